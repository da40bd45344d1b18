//! Command producer.
//!
//! Turns a caller's intent into a [`Command`] and publishes it to the
//! commands topic. Publishing is fire-and-forget: the producer never waits
//! for execution.

use billnet_core::broker::{BrokerError, SharedBroker, publish_json};
use billnet_core::config::topics;

use crate::command::{Command, CommandId, CommandRequest};

/// Dispatch error types.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Transport error: {0}")]
    Transport(#[from] BrokerError),
}

/// Publishes commands to the commands topic.
#[derive(Clone)]
pub struct CommandProducer {
    broker: SharedBroker,
    topic: String,
}

impl CommandProducer {
    /// Create a producer on the default commands topic.
    pub fn new(broker: SharedBroker) -> Self {
        Self::with_topic(broker, topics::COMMANDS)
    }

    /// Create a producer on a custom topic.
    pub fn with_topic(broker: SharedBroker, topic: impl Into<String>) -> Self {
        Self {
            broker,
            topic: topic.into(),
        }
    }

    /// Topic commands are published to.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Dispatch a request and return the id of the published command.
    pub async fn dispatch(&self, request: CommandRequest) -> Result<CommandId, DispatchError> {
        let command = Command::from_request(request);
        self.publish(&command).await?;
        Ok(command.id)
    }

    /// Publish an already-built command. Keyed by device for partition
    /// affinity.
    pub async fn publish(&self, command: &Command) -> Result<(), DispatchError> {
        publish_json(
            self.broker.as_ref(),
            &self.topic,
            &command.device_id,
            command,
        )
        .await?;

        tracing::debug!(
            command_id = %command.id,
            device_id = %command.device_id,
            command_type = %command.command_type,
            "Command published"
        );
        Ok(())
    }
}
