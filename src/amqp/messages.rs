//! AMQP message definitions and serialization

use crate::error::{MatchmakingError, Result};
use crate::types::*;

/// AMQP queue and exchange names
pub const PLAYER_COMMAND_QUEUE: &str = "matchforge.player_commands";
pub const QUEUE_EVENTS_EXCHANGE: &str = "matchforge.queue_events";
pub const MATCH_EVENTS_EXCHANGE: &str = "matchforge.match_events";

/// Routing keys for queue events
pub const QUEUE_JOINED_ROUTING_KEY: &str = "queue.joined";
pub const QUEUE_LEFT_ROUTING_KEY: &str = "queue.left";

/// Message envelope with metadata
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct MessageEnvelope<T> {
    pub payload: T,
    pub correlation_id: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub routing_key: String,
}

impl<T> MessageEnvelope<T>
where
    T: serde::Serialize + serde::de::DeserializeOwned,
{
    /// Create a new message envelope
    pub fn new(payload: T, routing_key: String) -> Self {
        Self {
            payload,
            correlation_id: uuid::Uuid::new_v4().to_string(),
            timestamp: chrono::Utc::now(),
            routing_key,
        }
    }

    /// Serialize the envelope to JSON bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| MatchmakingError::InternalError {
            message: format!("Failed to serialize message: {}", e),
        })
    }

    /// Deserialize envelope from JSON bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| MatchmakingError::InvalidCommand {
            reason: format!("Failed to deserialize message: {}", e),
        })
    }
}

/// Message serialization and validation utilities
pub struct MessageUtils;

impl MessageUtils {
    /// Deserialize and validate a player command
    pub fn deserialize_command(bytes: &[u8]) -> Result<PlayerCommand> {
        let command: PlayerCommand =
            serde_json::from_slice(bytes).map_err(|e| MatchmakingError::InvalidCommand {
                reason: format!("Failed to deserialize player command: {}", e),
            })?;

        Self::validate_command(&command)?;
        Ok(command)
    }

    /// Validate a player command
    pub fn validate_command(command: &PlayerCommand) -> Result<()> {
        if command.user_id.trim().is_empty() {
            return Err(MatchmakingError::InvalidCommand {
                reason: "Command carries no resolved user id".to_string(),
            });
        }

        if let PlayerAction::Ban { item, .. } = &command.action {
            if item.trim().is_empty() {
                return Err(MatchmakingError::InvalidCommand {
                    reason: "Ban item cannot be empty".to_string(),
                });
            }
        }

        Ok(())
    }

    /// Serialize any AMQP message to bytes
    pub fn serialize_message<T: serde::Serialize>(message: &T) -> Result<Vec<u8>> {
        serde_json::to_vec(message).map_err(|e| MatchmakingError::InternalError {
            message: format!("Failed to serialize message: {}", e),
        })
    }

    /// Routing key for a queue event
    pub fn queue_routing_key(event: &QueueEvent) -> String {
        match event {
            QueueEvent::Joined { mode, .. } => format!("{}.{}", QUEUE_JOINED_ROUTING_KEY, mode),
            QueueEvent::Left { mode, .. } => format!("{}.{}", QUEUE_LEFT_ROUTING_KEY, mode),
        }
    }

    /// Routing key for a match event, e.g. `match.finished`
    pub fn match_routing_key(event: &MatchEvent) -> String {
        format!("match.{}", event.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_message_envelope_creation() {
        let event = QueueEvent::Left {
            user_ids: vec!["u1".to_string()],
            mode: GameMode::OneVsOne,
            timestamp: Utc::now(),
        };
        let envelope = MessageEnvelope::new(event, "queue.left.1v1".to_string());

        assert_eq!(envelope.routing_key, "queue.left.1v1");
        assert!(!envelope.correlation_id.is_empty());
    }

    #[test]
    fn test_command_validation() {
        let raw = br#"{"user_id":"u1","action":"leave_queue","timestamp":"2026-01-01T00:00:00Z"}"#;
        let command = MessageUtils::deserialize_command(raw).unwrap();
        assert_eq!(command.action, PlayerAction::LeaveQueue);

        let anonymous = br#"{"user_id":" ","action":"leave_queue","timestamp":"2026-01-01T00:00:00Z"}"#;
        assert!(MessageUtils::deserialize_command(anonymous).is_err());

        let garbage = br#"{"action":"explode"}"#;
        assert!(matches!(
            MessageUtils::deserialize_command(garbage),
            Err(MatchmakingError::InvalidCommand { .. })
        ));
    }

    #[test]
    fn test_routing_keys() {
        let event = QueueEvent::Joined {
            user_ids: vec!["u1".to_string()],
            mode: GameMode::FiveVsFive,
            joined_at: Utc::now(),
        };
        assert_eq!(MessageUtils::queue_routing_key(&event), "queue.joined.5v5");

        let event = MatchEvent::Live {
            match_id: uuid::Uuid::new_v4(),
            timestamp: Utc::now(),
        };
        assert_eq!(MessageUtils::match_routing_key(&event), "match.live");
    }
}
