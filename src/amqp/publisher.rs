//! AMQP event publisher for outbound lifecycle events

use crate::amqp::messages::{
    MessageEnvelope, MessageUtils, MATCH_EVENTS_EXCHANGE, QUEUE_EVENTS_EXCHANGE,
};
use crate::error::{MatchmakingError, Result};
use crate::types::*;
use amqprs::{
    channel::{BasicPublishArguments, Channel, ExchangeDeclareArguments},
    BasicProperties,
};
use async_trait::async_trait;
use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// Trait for publishing lifecycle events
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a queue join/leave event
    async fn publish_queue_event(&self, event: QueueEvent) -> Result<()>;

    /// Publish a match lifecycle event
    async fn publish_match_event(&self, event: MatchEvent) -> Result<()>;
}

/// Configuration for event publishing
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub enable_deduplication: bool,
    /// Number of recent match-event keys remembered for deduplication
    pub dedup_capacity: usize,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_ms: 500,
            enable_deduplication: true,
            dedup_capacity: 10_000,
        }
    }
}

/// Recently published event keys, oldest evicted first
#[derive(Debug)]
pub struct DedupCache {
    capacity: usize,
    order: VecDeque<String>,
    seen: HashSet<String>,
}

impl DedupCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            seen: HashSet::new(),
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.seen.contains(key)
    }

    pub fn insert(&mut self, key: String) {
        if !self.seen.insert(key.clone()) {
            return;
        }
        self.order.push_back(key);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// AMQP-based event publisher implementation
pub struct AmqpEventPublisher {
    channel: Channel,
    config: PublisherConfig,
    published: Mutex<DedupCache>,
}

impl AmqpEventPublisher {
    /// Create a new event publisher and declare its exchanges
    pub async fn new(channel: Channel, config: PublisherConfig) -> Result<Self> {
        let publisher = Self {
            channel,
            published: Mutex::new(DedupCache::new(config.dedup_capacity)),
            config,
        };

        publisher.setup_exchanges().await?;

        Ok(publisher)
    }

    async fn setup_exchanges(&self) -> Result<()> {
        for exchange in [QUEUE_EVENTS_EXCHANGE, MATCH_EVENTS_EXCHANGE] {
            let args = ExchangeDeclareArguments::new(exchange, "topic");
            self.channel
                .exchange_declare(args)
                .await
                .map_err(|e| MatchmakingError::Messaging {
                    message: format!("Failed to declare exchange {}: {}", exchange, e),
                })?;
        }

        info!("Successfully set up AMQP exchanges");
        Ok(())
    }

    /// Publish to an exchange with retry. A `dedup_key` already published
    /// recently is skipped.
    async fn publish_to_exchange<T>(
        &self,
        exchange: &str,
        envelope: &MessageEnvelope<T>,
        dedup_key: Option<String>,
    ) -> Result<()>
    where
        T: serde::Serialize + serde::de::DeserializeOwned,
    {
        let dedup_key = dedup_key.filter(|_| self.config.enable_deduplication);
        if let Some(key) = &dedup_key {
            let published = self
                .published
                .lock()
                .map_err(|_| MatchmakingError::lock_poisoned("published events"))?;
            if published.contains(key) {
                debug!("Event {} already published, skipping", key);
                return Ok(());
            }
        }

        let mut retry_count = 0;
        let mut delay = Duration::from_millis(self.config.retry_delay_ms);

        loop {
            match self.try_publish(exchange, envelope).await {
                Ok(_) => {
                    if let Some(key) = dedup_key {
                        self.published
                            .lock()
                            .map_err(|_| MatchmakingError::lock_poisoned("published events"))?
                            .insert(key);
                    }

                    debug!(
                        "Published {} to {} ({})",
                        envelope.correlation_id, exchange, envelope.routing_key
                    );
                    return Ok(());
                }
                Err(e) => {
                    retry_count += 1;
                    if retry_count > self.config.max_retries {
                        error!(
                            "Failed to publish message {} after {} retries: {}",
                            envelope.correlation_id, self.config.max_retries, e
                        );
                        return Err(e);
                    }

                    warn!(
                        "Publish attempt {} failed for message {}: {}. Retrying in {:?}",
                        retry_count, envelope.correlation_id, e, delay
                    );

                    sleep(delay).await;
                    delay = Duration::from_millis((delay.as_millis() as u64 * 2).min(5000));
                }
            }
        }
    }

    async fn try_publish<T>(&self, exchange: &str, envelope: &MessageEnvelope<T>) -> Result<()>
    where
        T: serde::Serialize + serde::de::DeserializeOwned,
    {
        let payload = envelope.to_bytes()?;

        let args = BasicPublishArguments::new(exchange, &envelope.routing_key);
        let mut properties = BasicProperties::default();
        properties
            .with_message_id(&envelope.correlation_id)
            .with_timestamp(envelope.timestamp.timestamp() as u64)
            .with_content_type("application/json");

        self.channel
            .basic_publish(properties, payload, args)
            .await
            .map_err(|e| MatchmakingError::Messaging {
                message: format!("Failed to publish message: {}", e),
            })?;

        Ok(())
    }

    /// Number of remembered event keys
    pub fn cached_message_count(&self) -> usize {
        self.published
            .lock()
            .map(|cache| cache.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl EventPublisher for AmqpEventPublisher {
    async fn publish_queue_event(&self, event: QueueEvent) -> Result<()> {
        let routing_key = MessageUtils::queue_routing_key(&event);
        let envelope = MessageEnvelope::new(event, routing_key);
        self.publish_to_exchange(QUEUE_EVENTS_EXCHANGE, &envelope, None)
            .await
    }

    async fn publish_match_event(&self, event: MatchEvent) -> Result<()> {
        let routing_key = MessageUtils::match_routing_key(&event);
        let key = event.dedup_key();
        let envelope = MessageEnvelope::new(event, routing_key);
        self.publish_to_exchange(MATCH_EVENTS_EXCHANGE, &envelope, Some(key))
            .await
    }
}

/// Event publisher that records what it was given
#[derive(Debug, Default)]
pub struct MockEventPublisher {
    queue_events: std::sync::Mutex<Vec<QueueEvent>>,
    match_events: std::sync::Mutex<Vec<MatchEvent>>,
}

impl MockEventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Names of every match event published so far, in order
    pub fn match_event_names(&self) -> Vec<&'static str> {
        self.match_events
            .lock()
            .map(|events| events.iter().map(MatchEvent::name).collect())
            .unwrap_or_default()
    }

    pub fn match_events(&self) -> Vec<MatchEvent> {
        self.match_events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    pub fn queue_events(&self) -> Vec<QueueEvent> {
        self.queue_events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    pub fn count(&self, name: &str) -> usize {
        self.match_event_names()
            .into_iter()
            .filter(|n| *n == name)
            .count()
    }

    pub fn clear_events(&self) {
        if let Ok(mut events) = self.match_events.lock() {
            events.clear();
        }
        if let Ok(mut events) = self.queue_events.lock() {
            events.clear();
        }
    }
}

#[async_trait]
impl EventPublisher for MockEventPublisher {
    async fn publish_queue_event(&self, event: QueueEvent) -> Result<()> {
        if let Ok(mut events) = self.queue_events.lock() {
            events.push(event);
        }
        Ok(())
    }

    async fn publish_match_event(&self, event: MatchEvent) -> Result<()> {
        if let Ok(mut events) = self.match_events.lock() {
            events.push(event);
        }
        Ok(())
    }
}

/// Publish without letting a broker failure undo a committed transition
pub async fn publish_best_effort(publisher: &dyn EventPublisher, event: MatchEvent) {
    let name = event.name();
    if let Err(e) = publisher.publish_match_event(event).await {
        warn!("Failed to publish {} event: {}", name, e);
    }
}
