//! Service layer: engine wiring, application state and health checks

pub mod app;
pub mod engine;
pub mod health;

pub use app::{AppState, ServiceError};
pub use engine::{Engine, EngineSnapshot, EngineStores};
pub use health::{ComponentCheck, HealthCheck, HealthStatus};
