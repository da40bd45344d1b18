//! Command API for external integration.
//!
//! The entry point callers use instead of wiring the producer and the
//! monitor by hand.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::command::{
    Command, CommandId, CommandRequest, CommandState, CommandStatus, DeviceId, ValidationError,
};
use crate::monitor::{CommandMonitor, CommandStats};
use crate::producer::{CommandProducer, DispatchError};

/// API error types.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Invalid request: {0}")]
    Validation(#[from] ValidationError),

    #[error("Dispatch failed: {0}")]
    Dispatch(#[from] DispatchError),
}

/// API response for command submission.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SubmitCommandResponse {
    /// Command ID
    pub command_id: CommandId,
    /// Target device ID
    pub device_id: DeviceId,
    /// Current status
    pub status: CommandState,
}

/// Validating front door over the producer and the monitor.
#[derive(Clone)]
pub struct CommandApi {
    producer: CommandProducer,
    monitor: Arc<CommandMonitor>,
}

impl CommandApi {
    pub fn new(producer: CommandProducer, monitor: Arc<CommandMonitor>) -> Self {
        Self { producer, monitor }
    }

    /// The monitor behind this API.
    pub fn monitor(&self) -> &Arc<CommandMonitor> {
        &self.monitor
    }

    /// Validate, dispatch and track a request.
    ///
    /// The command is registered before it is published so that a fast
    /// result cannot arrive ahead of its record. A failed publish withdraws
    /// the registration and no notification is emitted for it.
    pub async fn submit(&self, request: CommandRequest) -> Result<SubmitCommandResponse, ApiError> {
        request.validate()?;

        let command = Command::from_request(request);
        let response = SubmitCommandResponse {
            command_id: command.id.clone(),
            device_id: command.device_id.clone(),
            status: CommandState::Pending,
        };

        self.monitor.register_command(command.clone(), None).await;
        if let Err(e) = self.producer.publish(&command).await {
            self.monitor.forget(&command.id).await;
            return Err(e.into());
        }

        tracing::info!(
            command_id = %response.command_id,
            device_id = %response.device_id,
            command_type = %command.command_type,
            "Command submitted"
        );
        Ok(response)
    }

    /// Status of a pending attempt.
    pub async fn status(&self, command_id: &str) -> Option<CommandStatus> {
        self.monitor.get_command_status(command_id).await
    }

    /// All pending attempts.
    pub async fn active(&self) -> Vec<CommandStatus> {
        self.monitor.get_active_commands().await
    }

    /// Monitor counts.
    pub async fn stats(&self) -> CommandStats {
        self.monitor.get_command_stats().await
    }
}
