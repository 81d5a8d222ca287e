//! Application state and service coordination
//!
//! Owns the broker connection, the engine, the health server and the
//! periodic jobs that drive matchmaking, confirmation expiry, provisioning
//! reconciliation and metrics refresh.

use crate::amqp::connection::{AmqpConfig, AmqpConnection};
use crate::amqp::handlers::{CommandHandler, PlayerCommandConsumer};
use crate::amqp::publisher::{AmqpEventPublisher, PublisherConfig};
use crate::config::AppConfig;
use crate::error::{MatchmakingError, Result as MatchmakingResult};
use crate::metrics::{HealthServer, HealthServerConfig, MetricsCollector, MetricsService};
use crate::provider::{GameServerProvider, HttpGameServerProvider};
use crate::service::engine::{Engine, EngineStores};
use crate::service::health::{HealthCheck, HealthStatus};
use crate::types::PlayerCommand;
use amqprs::channel::QueueDeclareArguments;
use async_trait::async_trait;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Service-level errors
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("AMQP connection error: {message}")]
    AmqpConnection { message: String },

    #[error("Service initialization error: {message}")]
    Initialization { message: String },

    #[error("Background task error: {message}")]
    BackgroundTask { message: String },
}

/// Runs broker commands against the engine
struct ProductionCommandHandler {
    engine: Arc<Engine>,
}

#[async_trait]
impl CommandHandler for ProductionCommandHandler {
    async fn handle_command(&self, command: PlayerCommand) -> MatchmakingResult<()> {
        let started = Instant::now();
        let user = command.user_id.clone();
        let result = self.engine.execute(command).await;
        debug!(
            "Command from {} finished in {:.2}ms",
            user,
            started.elapsed().as_secs_f64() * 1000.0
        );
        result
    }

    async fn handle_error(&self, error: MatchmakingError, message_data: &[u8]) {
        self.engine.metrics().record_error(error.category());
        if !error.is_user_facing() && !message_data.is_empty() {
            let preview_len = message_data.len().min(100);
            warn!(
                "Failed command preview: {:?}",
                String::from_utf8_lossy(&message_data[..preview_len])
            );
        }
    }
}

pub struct AppState {
    config: AppConfig,
    engine: Arc<Engine>,
    amqp_connection: Arc<AmqpConnection>,
    metrics_service: Arc<MetricsService>,
    background_tasks: Vec<JoinHandle<()>>,
    consumer: Option<PlayerCommandConsumer>,
    is_running: Arc<AtomicBool>,
    started_at: Instant,
}

impl AppState {
    /// Connect to the broker and the provider API and wire the engine
    pub async fn new(config: AppConfig) -> Result<Self, ServiceError> {
        let provider = HttpGameServerProvider::new(&config.provider).map_err(|e| {
            ServiceError::Configuration {
                message: format!("Game server provider: {}", e),
            }
        })?;
        Self::with_provider(config, Arc::new(provider)).await
    }

    /// Same as `new`, with a caller-supplied provider
    pub async fn with_provider(
        config: AppConfig,
        provider: Arc<dyn GameServerProvider>,
    ) -> Result<Self, ServiceError> {
        info!(
            "Initializing {} (health port {})",
            config.service.name, config.service.health_port
        );

        let amqp_config =
            AmqpConfig::from_settings(&config.amqp).map_err(|e| ServiceError::Configuration {
                message: e.to_string(),
            })?;
        let amqp_connection = Arc::new(AmqpConnection::new(amqp_config).await.map_err(|e| {
            ServiceError::AmqpConnection {
                message: format!("Failed to connect to AMQP: {}", e),
            }
        })?);

        let channel =
            amqp_connection
                .open_channel()
                .await
                .map_err(|e| ServiceError::AmqpConnection {
                    message: e.to_string(),
                })?;
        let publisher = Arc::new(
            AmqpEventPublisher::new(channel, PublisherConfig::default())
                .await
                .map_err(|e| ServiceError::Initialization {
                    message: format!("Failed to initialize event publisher: {}", e),
                })?,
        );

        let collector =
            Arc::new(
                MetricsCollector::new().map_err(|e| ServiceError::Initialization {
                    message: format!("Failed to create metrics collector: {}", e),
                })?,
            );

        let engine = Arc::new(
            Engine::new(
                config.clone(),
                EngineStores::in_memory(),
                publisher,
                provider,
                collector.clone(),
            )
            .map_err(|e| ServiceError::Initialization {
                message: format!("Failed to build engine: {}", e),
            })?,
        );

        let is_running = Arc::new(AtomicBool::new(false));
        let health_server = HealthServer::new(
            HealthServerConfig {
                port: config.service.health_port,
                host: "0.0.0.0".to_string(),
            },
            collector.clone(),
        )
        .with_engine(engine.clone(), is_running.clone());
        let metrics_service = Arc::new(MetricsService::new(collector, Arc::new(health_server)));

        Ok(Self {
            config,
            engine,
            amqp_connection,
            metrics_service,
            background_tasks: Vec::new(),
            consumer: None,
            is_running,
            started_at: Instant::now(),
        })
    }

    /// Start the health server, command consumption and periodic jobs
    pub async fn start(&mut self) -> Result<(), ServiceError> {
        info!("Starting {}", self.config.service.name);
        self.is_running.store(true, Ordering::SeqCst);

        self.start_metrics_service();
        self.start_command_consumption().await?;

        let resumed = self
            .engine
            .ingestion()
            .resume(self.engine.stores().matches.as_ref())
            .map_err(|e| ServiceError::Initialization {
                message: format!("Failed to resume ingestion: {}", e),
            })?;
        if resumed > 0 {
            info!("Resumed ingestion for {} match(es)", resumed);
        }

        self.start_background_tasks();
        info!("{} started", self.config.service.name);
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), ServiceError> {
        info!("Shutting down {}", self.config.service.name);
        self.is_running.store(false, Ordering::SeqCst);

        if let Some(consumer) = self.consumer.take() {
            if let Err(e) = consumer.stop_consuming().await {
                warn!("Failed to stop command consumer: {}", e);
            }
        }

        for task in self.background_tasks.drain(..) {
            task.abort();
        }
        self.engine.ingestion().shutdown();

        if let Err(e) = self.metrics_service.stop().await {
            warn!("Failed to stop metrics service: {}", e);
        }

        match self.engine.snapshot() {
            Ok(snapshot) => info!("Final statistics: {:?}", snapshot),
            Err(e) => warn!("Could not collect final statistics: {}", e),
        }
        Ok(())
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn engine(&self) -> Arc<Engine> {
        self.engine.clone()
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    pub fn metrics_service(&self) -> Arc<MetricsService> {
        self.metrics_service.clone()
    }

    pub fn amqp_connection(&self) -> Arc<AmqpConnection> {
        self.amqp_connection.clone()
    }

    fn start_metrics_service(&mut self) {
        let metrics_service = self.metrics_service.clone();
        self.background_tasks.push(tokio::spawn(async move {
            if let Err(e) = metrics_service.start().await {
                error!("Metrics service failed: {}", e);
            }
        }));
    }

    async fn start_command_consumption(&mut self) -> Result<(), ServiceError> {
        let queue = self.config.amqp.command_queue.clone();
        let channel =
            self.amqp_connection
                .open_channel()
                .await
                .map_err(|e| ServiceError::AmqpConnection {
                    message: format!("Failed to open consumer channel: {}", e),
                })?;

        channel
            .queue_declare(
                QueueDeclareArguments::new(&queue)
                    .durable(true)
                    .auto_delete(false)
                    .finish(),
            )
            .await
            .map_err(|e| ServiceError::AmqpConnection {
                message: format!("Failed to declare queue {}: {}", queue, e),
            })?;

        let handler = Arc::new(ProductionCommandHandler {
            engine: self.engine.clone(),
        });
        let consumer = PlayerCommandConsumer::new(handler, channel);
        consumer
            .start_consuming(&queue)
            .await
            .map_err(|e| ServiceError::AmqpConnection {
                message: e.to_string(),
            })?;
        self.consumer = Some(consumer);
        Ok(())
    }

    fn start_background_tasks(&mut self) {
        let lifecycle = self.config.lifecycle.clone();

        let matchmaker = self.spawn_periodic(
            "matchmaker",
            lifecycle.matchmaking_interval(),
            |engine| async move {
                engine.run_matchmaking().await.map(|_| ())
            },
        );
        let sweeper = self.spawn_periodic(
            "confirmation sweeper",
            lifecycle.sweep_interval(),
            |engine| async move {
                let expired = engine.sweep_confirmations().await?;
                if !expired.is_empty() {
                    info!("Expired {} unconfirmed match(es)", expired.len());
                }
                Ok(())
            },
        );
        let reconciler = self.spawn_periodic(
            "provisioning reconciler",
            lifecycle.sweep_interval(),
            |engine| async move {
                let released = engine.reconcile_provisioning()?;
                if !released.is_empty() {
                    warn!("Released {} stale provisioning lock(s)", released.len());
                }
                Ok(())
            },
        );

        let started_at = self.started_at;
        let running = self.is_running.clone();
        let refresher = self.spawn_periodic(
            "metrics refresh",
            Duration::from_secs(30),
            move |engine| {
                let running = running.load(Ordering::SeqCst);
                async move {
                    let metrics = engine.metrics();
                    metrics
                        .service()
                        .uptime_seconds
                        .set(started_at.elapsed().as_secs() as i64);
                    engine.refresh_metrics()?;
                    match HealthCheck::check(&engine, running) {
                        Ok(health) => {
                            metrics.update_health_status(health.status.as_gauge());
                            for check in &health.checks {
                                metrics.update_component_health(
                                    &check.name,
                                    check.status != HealthStatus::Unhealthy,
                                );
                            }
                        }
                        Err(e) => warn!("Health check failed: {}", e),
                    }
                    Ok(())
                }
            },
        );

        self.background_tasks
            .extend([matchmaker, sweeper, reconciler, refresher]);
        info!("Background tasks started");
    }

    /// Run `job` every `period` while the service is up. Failures are logged
    /// and the loop carries on.
    fn spawn_periodic<F, Fut>(&self, name: &'static str, period: Duration, job: F) -> JoinHandle<()>
    where
        F: Fn(Arc<Engine>) -> Fut + Send + 'static,
        Fut: Future<Output = MatchmakingResult<()>> + Send + 'static,
    {
        let engine = self.engine.clone();
        let is_running = self.is_running.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            info!("{} task started ({:?} interval)", name, period);

            while is_running.load(Ordering::SeqCst) {
                interval.tick().await;
                if let Err(e) = job(engine.clone()).await {
                    engine.metrics().record_error(e.category());
                    warn!("{} run failed: {}", name, e);
                }
            }

            info!("{} task stopped", name);
        })
    }
}
