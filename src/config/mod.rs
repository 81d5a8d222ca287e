//! Configuration management for the matchforge service
//!
//! This module handles configuration loading from environment variables and
//! TOML files, validation, and default values.

pub mod app;
pub mod lifecycle;
pub mod rating;

// Re-export commonly used types
pub use app::{
    validate_config, AmqpSettings, AppConfig, AuthorizationSettings, ProviderSettings,
    ServiceSettings, WagerSettings,
};
pub use lifecycle::LifecycleConfig;
pub use rating::RatingConfig;
