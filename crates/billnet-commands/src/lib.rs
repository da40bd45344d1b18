//! Remote command dispatch for network devices.
//!
//! Provides:
//! - Command wire types
//! - The producer that publishes commands
//! - The executor that performs device actions and reports results
//! - The monitor that tracks deadlines, retries and terminal notifications
//! - A durable ledger for pending commands and outcomes

pub mod api;
pub mod command;
pub mod device;
pub mod executor;
pub mod ledger;
pub mod monitor;
pub mod producer;

// Re-exports
pub use command::{
    AccountId, Command, CommandCompleted, CommandId, CommandRequest, CommandResult, CommandState,
    CommandStatus, CommandType, DeviceId, NotificationKind, ValidationError,
};

pub use producer::{CommandProducer, DispatchError};

pub use device::{
    Account, ActionError, Device, DeviceController, DeviceDirectory, InMemoryDirectory,
    Inventory, LookupError, SimulatedController,
};

pub use executor::{
    ACCOUNT_NOT_FOUND, DEVICE_NOT_FOUND, DeviceActionExecutor, ExecutorConfig, ExecutorError,
    ExecutorStats,
};

pub use monitor::{CommandMonitor, CommandStats, DEADLINE_EXCEEDED, MonitorConfig, MonitorError};

pub use ledger::{CommandLedger, LedgerError, MemoryLedger, RedbLedger, SharedLedger};

pub use api::{ApiError, CommandApi, SubmitCommandResponse};
