//! AMQP integration: inbound player commands, outbound lifecycle events

pub mod connection;
pub mod handlers;
pub mod messages;
pub mod publisher;

pub use connection::{AmqpConfig, AmqpConnection};
pub use handlers::{dispatch, CommandHandler, MockCommandHandler, PlayerCommandConsumer};
pub use messages::*;
pub use publisher::{
    publish_best_effort, AmqpEventPublisher, EventPublisher, MockEventPublisher, PublisherConfig,
};
