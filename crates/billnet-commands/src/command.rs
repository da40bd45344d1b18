//! Command data structures.
//!
//! Defines the wire types exchanged over the broker and the monitor's
//! bookkeeping record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique command identifier (one per dispatch attempt).
pub type CommandId = String;

/// Device identifier.
pub type DeviceId = String;

/// Account identifier.
pub type AccountId = String;

/// Device-side action requested by a command.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum CommandType {
    /// Provision a DHCP lease
    #[serde(rename = "ADD_DHCP")]
    AddLease,
    /// Remove a DHCP lease
    #[serde(rename = "REMOVE_DHCP")]
    RemoveLease,
    /// Block a subscriber
    #[serde(rename = "BLOCK_CLIENT")]
    BlockClient,
    /// Unblock a subscriber
    #[serde(rename = "UNBLOCK_CLIENT")]
    UnblockClient,
    /// Fetch usage statistics
    #[serde(rename = "GET_STATS")]
    GetStats,
}

impl CommandType {
    /// Wire name of the command type.
    pub fn type_name(&self) -> &'static str {
        match self {
            CommandType::AddLease => "ADD_DHCP",
            CommandType::RemoveLease => "REMOVE_DHCP",
            CommandType::BlockClient => "BLOCK_CLIENT",
            CommandType::UnblockClient => "UNBLOCK_CLIENT",
            CommandType::GetStats => "GET_STATS",
        }
    }

    /// Whether the type needs an IP address and pool name.
    pub fn requires_lease_params(&self) -> bool {
        matches!(self, CommandType::AddLease)
    }
}

impl std::fmt::Display for CommandType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.type_name())
    }
}

/// Validation errors for caller-supplied requests.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Field {field} is required for {command_type}")]
    MissingForType {
        field: &'static str,
        command_type: CommandType,
    },
}

/// A caller's intent: everything a command carries except its identity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CommandRequest {
    #[serde(rename = "type")]
    pub command_type: CommandType,
    pub device_id: DeviceId,
    pub account_id: AccountId,
    pub mac_address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool_name: Option<String>,
}

impl CommandRequest {
    /// Create a new request.
    pub fn new(
        command_type: CommandType,
        device_id: impl Into<DeviceId>,
        account_id: impl Into<AccountId>,
        mac_address: impl Into<String>,
    ) -> Self {
        Self {
            command_type,
            device_id: device_id.into(),
            account_id: account_id.into(),
            mac_address: mac_address.into(),
            ip_address: None,
            pool_name: None,
        }
    }

    /// Set lease parameters (AddLease).
    pub fn with_lease(mut self, ip_address: impl Into<String>, pool_name: impl Into<String>) -> Self {
        self.ip_address = Some(ip_address.into());
        self.pool_name = Some(pool_name.into());
        self
    }

    /// Check the caller-side constraints.
    ///
    /// The producer does not call this; it trusts its input.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.device_id.trim().is_empty() {
            return Err(ValidationError::MissingField("deviceId"));
        }
        if self.account_id.trim().is_empty() {
            return Err(ValidationError::MissingField("accountId"));
        }
        if self.mac_address.trim().is_empty() {
            return Err(ValidationError::MissingField("macAddress"));
        }

        if self.command_type.requires_lease_params() {
            if self.ip_address.as_deref().is_none_or(|s| s.trim().is_empty()) {
                return Err(ValidationError::MissingForType {
                    field: "ipAddress",
                    command_type: self.command_type,
                });
            }
            if self.pool_name.as_deref().is_none_or(|s| s.trim().is_empty()) {
                return Err(ValidationError::MissingForType {
                    field: "poolName",
                    command_type: self.command_type,
                });
            }
        }

        Ok(())
    }
}

/// A published command. Immutable once published.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    pub id: CommandId,
    #[serde(rename = "type")]
    pub command_type: CommandType,
    pub device_id: DeviceId,
    pub account_id: AccountId,
    pub mac_address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool_name: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl Command {
    /// Stamp a request with a fresh id and timestamp.
    pub fn from_request(request: CommandRequest) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            command_type: request.command_type,
            device_id: request.device_id,
            account_id: request.account_id,
            mac_address: request.mac_address,
            ip_address: request.ip_address,
            pool_name: request.pool_name,
            timestamp: Utc::now(),
        }
    }

    /// Build the command for the next attempt: same payload, new identity.
    pub fn next_attempt(&self) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            ..self.clone()
        }
    }

    /// Payload without identity.
    pub fn request(&self) -> CommandRequest {
        CommandRequest {
            command_type: self.command_type,
            device_id: self.device_id.clone(),
            account_id: self.account_id.clone(),
            mac_address: self.mac_address.clone(),
            ip_address: self.ip_address.clone(),
            pool_name: self.pool_name.clone(),
        }
    }
}

/// Outcome of executing one command.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CommandResult {
    pub command_id: CommandId,
    pub device_id: DeviceId,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl CommandResult {
    /// Create a successful result.
    pub fn success(command: &Command, result: serde_json::Value) -> Self {
        Self {
            command_id: command.id.clone(),
            device_id: command.device_id.clone(),
            success: true,
            result: Some(result),
            error: None,
            timestamp: Utc::now(),
        }
    }

    /// Create a failed result.
    pub fn failed(command: &Command, error: impl Into<String>) -> Self {
        Self {
            command_id: command.id.clone(),
            device_id: command.device_id.clone(),
            success: false,
            result: None,
            error: Some(error.into()),
            timestamp: Utc::now(),
        }
    }
}

/// Lifecycle state of a monitored attempt.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum CommandState {
    /// Registered, awaiting result
    Pending,
    /// Success result received
    Completed,
    /// Failure result received, retries exhausted
    Failed,
    /// No result before deadline, retries exhausted
    Timeout,
}

impl CommandState {
    /// Check if the state is terminal.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, CommandState::Pending)
    }

    /// Lowercase name.
    pub fn type_name(&self) -> &'static str {
        match self {
            CommandState::Pending => "pending",
            CommandState::Completed => "completed",
            CommandState::Failed => "failed",
            CommandState::Timeout => "timeout",
        }
    }
}

/// The monitor's record for one outstanding attempt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CommandStatus {
    pub command_id: CommandId,
    pub device_id: DeviceId,
    pub account_id: AccountId,
    #[serde(rename = "type")]
    pub command_type: CommandType,
    pub status: CommandState,
    pub retry_count: u32,
    pub max_retries: u32,
    pub timeout_ms: u64,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Full payload, so retries re-dispatch exactly what was asked for
    pub command: Command,
}

impl CommandStatus {
    /// Create a pending record for a command.
    pub fn pending(command: Command, retry_count: u32, max_retries: u32, timeout_ms: u64) -> Self {
        Self {
            command_id: command.id.clone(),
            device_id: command.device_id.clone(),
            account_id: command.account_id.clone(),
            command_type: command.command_type,
            status: CommandState::Pending,
            retry_count,
            max_retries,
            timeout_ms,
            created_at: Utc::now(),
            completed_at: None,
            result: None,
            error: None,
            command,
        }
    }

    /// Whether another attempt is allowed.
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Move to a terminal state.
    pub fn finish(
        &mut self,
        state: CommandState,
        result: Option<serde_json::Value>,
        error: Option<String>,
    ) {
        self.status = state;
        self.completed_at = Some(Utc::now());
        self.result = result;
        self.error = error;
    }
}

/// Notification kind tag.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    CommandCompleted,
}

/// Terminal notification published once per logical command.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CommandCompleted {
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    pub device_id: DeviceId,
    pub account_id: AccountId,
    pub command_id: CommandId,
    pub command_type: CommandType,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub retry_count: u32,
    pub timestamp: DateTime<Utc>,
}

impl CommandCompleted {
    /// Build the notification for a terminal record.
    pub fn from_status(status: &CommandStatus) -> Self {
        Self {
            kind: NotificationKind::CommandCompleted,
            device_id: status.device_id.clone(),
            account_id: status.account_id.clone(),
            command_id: status.command_id.clone(),
            command_type: status.command_type,
            success: status.status == CommandState::Completed,
            error: status.error.clone(),
            retry_count: status.retry_count,
            timestamp: status.completed_at.unwrap_or_else(Utc::now),
        }
    }
}
