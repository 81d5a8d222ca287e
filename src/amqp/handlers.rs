//! Consumer for player commands stamped by the identity gateway

use crate::amqp::messages::MessageUtils;
use crate::error::{MatchmakingError, Result};
use crate::types::PlayerCommand;
use amqprs::{
    channel::{BasicAckArguments, BasicCancelArguments, BasicConsumeArguments, Channel},
    consumer::AsyncConsumer,
    BasicProperties, Deliver,
};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Executes one player command against the engine
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle_command(&self, command: PlayerCommand) -> Result<()>;

    /// Called for every command that could not be parsed or failed
    async fn handle_error(&self, error: MatchmakingError, message_data: &[u8]);
}

/// Consumer bound to the player command queue
pub struct PlayerCommandConsumer {
    handler: Arc<dyn CommandHandler>,
    channel: Channel,
    consumer_tag: String,
}

impl PlayerCommandConsumer {
    pub fn new(handler: Arc<dyn CommandHandler>, channel: Channel) -> Self {
        Self {
            handler,
            channel,
            consumer_tag: format!("matchforge-commands-{}", uuid::Uuid::new_v4()),
        }
    }

    pub async fn start_consuming(&self, queue_name: &str) -> Result<()> {
        let args = BasicConsumeArguments::new(queue_name, &self.consumer_tag);
        self.channel
            .basic_consume(CommandConsumer::new(self.handler.clone()), args)
            .await
            .map_err(|e| MatchmakingError::Messaging {
                message: format!("Failed to start consuming: {}", e),
            })?;

        info!("Consuming player commands from {}", queue_name);
        Ok(())
    }

    pub async fn stop_consuming(&self) -> Result<()> {
        self.channel
            .basic_cancel(BasicCancelArguments::new(&self.consumer_tag))
            .await
            .map_err(|e| MatchmakingError::Messaging {
                message: format!("Failed to stop consuming: {}", e),
            })?;
        info!("Stopped consuming player commands");
        Ok(())
    }
}

struct CommandConsumer {
    handler: Arc<dyn CommandHandler>,
}

impl CommandConsumer {
    fn new(handler: Arc<dyn CommandHandler>) -> Self {
        Self { handler }
    }
}

#[async_trait]
impl AsyncConsumer for CommandConsumer {
    async fn consume(
        &mut self,
        channel: &Channel,
        deliver: Deliver,
        _basic_properties: BasicProperties,
        content: Vec<u8>,
    ) {
        let delivery_tag = deliver.delivery_tag();
        let started = Instant::now();
        debug!(
            "Command delivered - tag: {}, size: {} bytes",
            delivery_tag,
            content.len()
        );

        match dispatch(self.handler.as_ref(), &content).await {
            Ok(()) => debug!(
                "Command {} handled in {:.2}ms",
                delivery_tag,
                started.elapsed().as_secs_f64() * 1000.0
            ),
            Err(e) => {
                if e.is_user_facing() {
                    info!("Command {} rejected: {}", delivery_tag, e);
                } else {
                    error!("Command {} failed: {}", delivery_tag, e);
                }
                self.handler.handle_error(e, &content).await;
            }
        }

        // commands are not redelivered: a rejected command stays rejected
        if let Err(e) = channel
            .basic_ack(BasicAckArguments::new(delivery_tag, false))
            .await
        {
            warn!("Failed to ack command {}: {}", delivery_tag, e);
        }
    }
}

/// Parse a raw command and hand it to `handler`
pub async fn dispatch(handler: &dyn CommandHandler, content: &[u8]) -> Result<()> {
    let command = MessageUtils::deserialize_command(content)?;
    debug!("{} sent {:?}", command.user_id, command.action);
    handler.handle_command(command).await
}

/// Records every command and error, for tests
#[derive(Default)]
pub struct MockCommandHandler {
    pub received: tokio::sync::Mutex<Vec<PlayerCommand>>,
    pub errors: tokio::sync::Mutex<Vec<MatchmakingError>>,
}

impl MockCommandHandler {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CommandHandler for MockCommandHandler {
    async fn handle_command(&self, command: PlayerCommand) -> Result<()> {
        self.received.lock().await.push(command);
        Ok(())
    }

    async fn handle_error(&self, error: MatchmakingError, _message_data: &[u8]) {
        self.errors.lock().await.push(error);
    }
}
