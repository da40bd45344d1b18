//! Durable command ledger.
//!
//! The monitor's registry is process-local. The ledger mirrors its pending
//! records and keeps the history of terminal outcomes, so that a restarted
//! monitor can reconcile commands that were in flight.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use redb::{Database, ReadableTable, TableDefinition};

use crate::command::{CommandCompleted, CommandId, CommandStatus};

/// Pending attempts, keyed by command id.
const PENDING_TABLE: TableDefinition<&str, &str> = TableDefinition::new("pending_commands");

/// Terminal outcomes, keyed by sequence number.
const OUTCOMES_TABLE: TableDefinition<u64, &str> = TableDefinition::new("command_outcomes");

/// Ledger error types.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for LedgerError {
    fn from(e: serde_json::Error) -> Self {
        LedgerError::Serialization(e.to_string())
    }
}

impl From<redb::Error> for LedgerError {
    fn from(e: redb::Error) -> Self {
        LedgerError::Storage(format!("Redb error: {}", e))
    }
}

impl From<redb::DatabaseError> for LedgerError {
    fn from(e: redb::DatabaseError) -> Self {
        LedgerError::Storage(format!("Redb database error: {}", e))
    }
}

impl From<redb::TransactionError> for LedgerError {
    fn from(e: redb::TransactionError) -> Self {
        LedgerError::Storage(format!("Redb transaction error: {}", e))
    }
}

impl From<redb::TableError> for LedgerError {
    fn from(e: redb::TableError) -> Self {
        LedgerError::Storage(format!("Redb table error: {}", e))
    }
}

impl From<redb::StorageError> for LedgerError {
    fn from(e: redb::StorageError) -> Self {
        LedgerError::Storage(format!("Redb storage error: {}", e))
    }
}

impl From<redb::CommitError> for LedgerError {
    fn from(e: redb::CommitError) -> Self {
        LedgerError::Storage(format!("Redb commit error: {}", e))
    }
}

/// Persistence for monitored commands.
pub trait CommandLedger: Send + Sync {
    /// Store or replace a pending record.
    fn save_pending(&self, status: &CommandStatus) -> Result<(), LedgerError>;

    /// Drop a pending record. Missing ids are not an error.
    fn remove_pending(&self, command_id: &CommandId) -> Result<(), LedgerError>;

    /// Swap a pending record for the next attempt in one write.
    fn replace_pending(&self, old_id: &CommandId, next: &CommandStatus) -> Result<(), LedgerError>;

    /// All pending records.
    fn load_pending(&self) -> Result<Vec<CommandStatus>, LedgerError>;

    /// Append a terminal outcome.
    fn record_outcome(&self, outcome: &CommandCompleted) -> Result<(), LedgerError>;

    /// Most recent outcomes, newest first.
    fn recent_outcomes(&self, limit: usize) -> Result<Vec<CommandCompleted>, LedgerError>;
}

/// Shared ledger handle.
pub type SharedLedger = Arc<dyn CommandLedger>;

/// Ledger kept in memory. Survives monitor restarts within one process.
pub struct MemoryLedger {
    pending: Mutex<HashMap<CommandId, CommandStatus>>,
    outcomes: Mutex<VecDeque<CommandCompleted>>,
    max_outcomes: usize,
}

impl MemoryLedger {
    /// Create a ledger keeping at most `max_outcomes` terminal outcomes.
    pub fn new(max_outcomes: usize) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            outcomes: Mutex::new(VecDeque::new()),
            max_outcomes,
        }
    }
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl CommandLedger for MemoryLedger {
    fn save_pending(&self, status: &CommandStatus) -> Result<(), LedgerError> {
        self.pending
            .lock()
            .insert(status.command_id.clone(), status.clone());
        Ok(())
    }

    fn remove_pending(&self, command_id: &CommandId) -> Result<(), LedgerError> {
        self.pending.lock().remove(command_id);
        Ok(())
    }

    fn replace_pending(
        &self,
        old_id: &CommandId,
        next: &CommandStatus,
    ) -> Result<(), LedgerError> {
        let mut pending = self.pending.lock();
        pending.remove(old_id);
        pending.insert(next.command_id.clone(), next.clone());
        Ok(())
    }

    fn load_pending(&self) -> Result<Vec<CommandStatus>, LedgerError> {
        Ok(self.pending.lock().values().cloned().collect())
    }

    fn record_outcome(&self, outcome: &CommandCompleted) -> Result<(), LedgerError> {
        let mut outcomes = self.outcomes.lock();
        outcomes.push_back(outcome.clone());
        while outcomes.len() > self.max_outcomes {
            outcomes.pop_front();
        }
        Ok(())
    }

    fn recent_outcomes(&self, limit: usize) -> Result<Vec<CommandCompleted>, LedgerError> {
        Ok(self
            .outcomes
            .lock()
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect())
    }
}

/// Ledger backed by a redb file.
pub struct RedbLedger {
    db: Arc<Database>,
    path: String,
}

impl RedbLedger {
    /// Open or create a ledger at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, LedgerError> {
        let path_ref = path.as_ref();
        if let Some(parent) = path_ref.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let db = if path_ref.exists() {
            Database::open(path_ref)?
        } else {
            Database::create(path_ref)?
        };

        // Make sure both tables exist before the first read
        let write_txn = db.begin_write()?;
        {
            let _pending = write_txn.open_table(PENDING_TABLE)?;
            let _outcomes = write_txn.open_table(OUTCOMES_TABLE)?;
        }
        write_txn.commit()?;

        Ok(Self {
            db: Arc::new(db),
            path: path_ref.to_string_lossy().to_string(),
        })
    }

    /// Path of the database file.
    pub fn path(&self) -> &str {
        &self.path
    }
}

impl CommandLedger for RedbLedger {
    fn save_pending(&self, status: &CommandStatus) -> Result<(), LedgerError> {
        let json = serde_json::to_string(status)?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(PENDING_TABLE)?;
            table.insert(status.command_id.as_str(), json.as_str())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn remove_pending(&self, command_id: &CommandId) -> Result<(), LedgerError> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(PENDING_TABLE)?;
            table.remove(command_id.as_str())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn replace_pending(
        &self,
        old_id: &CommandId,
        next: &CommandStatus,
    ) -> Result<(), LedgerError> {
        let json = serde_json::to_string(next)?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(PENDING_TABLE)?;
            table.remove(old_id.as_str())?;
            table.insert(next.command_id.as_str(), json.as_str())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn load_pending(&self) -> Result<Vec<CommandStatus>, LedgerError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(PENDING_TABLE)?;

        let mut pending = Vec::new();
        for entry in table.iter()? {
            let (key, value) = entry?;
            match serde_json::from_str::<CommandStatus>(value.value()) {
                Ok(status) => pending.push(status),
                Err(e) => {
                    tracing::warn!(command_id = key.value(), error = %e, "Unreadable pending record")
                }
            }
        }
        Ok(pending)
    }

    fn record_outcome(&self, outcome: &CommandCompleted) -> Result<(), LedgerError> {
        let json = serde_json::to_string(outcome)?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(OUTCOMES_TABLE)?;
            let next = table.last()?.map(|(key, _)| key.value() + 1).unwrap_or(0);
            table.insert(next, json.as_str())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn recent_outcomes(&self, limit: usize) -> Result<Vec<CommandCompleted>, LedgerError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(OUTCOMES_TABLE)?;

        let mut outcomes = Vec::new();
        for entry in table.iter()?.rev() {
            if outcomes.len() >= limit {
                break;
            }
            let (_key, value) = entry?;
            outcomes.push(serde_json::from_str(value.value())?);
        }
        Ok(outcomes)
    }
}
