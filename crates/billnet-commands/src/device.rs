//! External collaborators of the executor.
//!
//! The device/account store and the vendor-specific device control protocol
//! live outside this crate. They are reached through [`DeviceDirectory`] and
//! [`DeviceController`].

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::command::{AccountId, Command, DeviceId};

/// Connection parameters of a network device.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Device {
    pub id: DeviceId,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// Vendor/driver identifier
    #[serde(default)]
    pub kind: String,
}

/// Subscriber account.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Account {
    pub id: AccountId,
    pub name: String,
    #[serde(default)]
    pub active: bool,
}

/// Lookup error types.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LookupError {
    #[error("Directory unavailable: {0}")]
    Unavailable(String),

    #[error("Lookup failed: {0}")]
    Failed(String),
}

/// Device action error types.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ActionError {
    #[error("Device unreachable: {0}")]
    Unreachable(String),

    #[error("Device rejected action: {0}")]
    Rejected(String),

    #[error("Unsupported action: {0}")]
    Unsupported(String),

    #[error("{0}")]
    Other(String),
}

/// Device and account lookup.
///
/// Not-found is `Ok(None)`, distinct from a failed lookup.
#[async_trait]
pub trait DeviceDirectory: Send + Sync {
    async fn find_device(&self, id: &str) -> Result<Option<Device>, LookupError>;

    async fn find_account(&self, id: &str) -> Result<Option<Account>, LookupError>;
}

/// Vendor-specific device actions.
///
/// Implementations must be idempotent: re-issuing an action that already
/// took effect must not corrupt device state. Calls may be slow.
#[async_trait]
pub trait DeviceController: Send + Sync {
    async fn add_lease(
        &self,
        device: &Device,
        account: &Account,
        command: &Command,
    ) -> Result<serde_json::Value, ActionError>;

    async fn remove_lease(
        &self,
        device: &Device,
        account: &Account,
        command: &Command,
    ) -> Result<serde_json::Value, ActionError>;

    async fn block_client(
        &self,
        device: &Device,
        account: &Account,
        command: &Command,
    ) -> Result<serde_json::Value, ActionError>;

    async fn unblock_client(
        &self,
        device: &Device,
        account: &Account,
        command: &Command,
    ) -> Result<serde_json::Value, ActionError>;

    async fn get_stats(
        &self,
        device: &Device,
        account: &Account,
        command: &Command,
    ) -> Result<serde_json::Value, ActionError>;
}

/// In-memory directory, for tests and the standalone node.
#[derive(Default)]
pub struct InMemoryDirectory {
    devices: DashMap<DeviceId, Device>,
    accounts: DashMap<AccountId, Account>,
}

/// Serialized inventory of devices and accounts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Inventory {
    #[serde(default)]
    pub devices: Vec<Device>,
    #[serde(default)]
    pub accounts: Vec<Account>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a directory from an inventory.
    pub fn from_inventory(inventory: Inventory) -> Self {
        let directory = Self::new();
        for device in inventory.devices {
            directory.add_device(device);
        }
        for account in inventory.accounts {
            directory.add_account(account);
        }
        directory
    }

    pub fn add_device(&self, device: Device) {
        self.devices.insert(device.id.clone(), device);
    }

    pub fn add_account(&self, account: Account) {
        self.accounts.insert(account.id.clone(), account);
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }
}

#[async_trait]
impl DeviceDirectory for InMemoryDirectory {
    async fn find_device(&self, id: &str) -> Result<Option<Device>, LookupError> {
        Ok(self.devices.get(id).map(|d| d.clone()))
    }

    async fn find_account(&self, id: &str) -> Result<Option<Account>, LookupError> {
        Ok(self.accounts.get(id).map(|a| a.clone()))
    }
}

/// Controller that answers locally without contacting hardware.
///
/// Devices whose `kind` is `"offline"` report as unreachable.
#[derive(Debug, Clone, Default)]
pub struct SimulatedController;

impl SimulatedController {
    fn respond(
        &self,
        device: &Device,
        command: &Command,
        body: serde_json::Value,
    ) -> Result<serde_json::Value, ActionError> {
        if device.kind == "offline" {
            return Err(ActionError::Unreachable(format!(
                "{}:{} did not answer",
                device.host, device.port
            )));
        }
        tracing::debug!(
            device_id = %device.id,
            command_type = %command.command_type,
            "Simulated device action"
        );
        Ok(body)
    }
}

#[async_trait]
impl DeviceController for SimulatedController {
    async fn add_lease(
        &self,
        device: &Device,
        _account: &Account,
        command: &Command,
    ) -> Result<serde_json::Value, ActionError> {
        self.respond(
            device,
            command,
            serde_json::json!({
                "lease": {
                    "mac": command.mac_address,
                    "ip": command.ip_address,
                    "pool": command.pool_name,
                }
            }),
        )
    }

    async fn remove_lease(
        &self,
        device: &Device,
        _account: &Account,
        command: &Command,
    ) -> Result<serde_json::Value, ActionError> {
        self.respond(device, command, serde_json::json!({ "removed": command.mac_address }))
    }

    async fn block_client(
        &self,
        device: &Device,
        _account: &Account,
        command: &Command,
    ) -> Result<serde_json::Value, ActionError> {
        self.respond(device, command, serde_json::json!({ "blocked": command.mac_address }))
    }

    async fn unblock_client(
        &self,
        device: &Device,
        _account: &Account,
        command: &Command,
    ) -> Result<serde_json::Value, ActionError> {
        self.respond(device, command, serde_json::json!({ "unblocked": command.mac_address }))
    }

    async fn get_stats(
        &self,
        device: &Device,
        account: &Account,
        command: &Command,
    ) -> Result<serde_json::Value, ActionError> {
        self.respond(
            device,
            command,
            serde_json::json!({
                "account": account.id,
                "mac": command.mac_address,
                "rxBytes": 0,
                "txBytes": 0,
            }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(kind: &str) -> Device {
        Device {
            id: "dev-1".to_string(),
            name: "edge router".to_string(),
            host: "192.0.2.1".to_string(),
            port: 8728,
            username: "admin".to_string(),
            password: String::new(),
            kind: kind.to_string(),
        }
    }

    #[tokio::test]
    async fn test_directory_lookup() {
        let directory = InMemoryDirectory::new();
        directory.add_device(device("router"));

        assert!(directory.find_device("dev-1").await.unwrap().is_some());
        assert!(directory.find_device("dev-2").await.unwrap().is_none());
        assert!(directory.find_account("acc-1").await.unwrap().is_none());
    }

    #[test]
    fn test_inventory_from_json() {
        let inventory: Inventory = serde_json::from_value(serde_json::json!({
            "devices": [{
                "id": "dev-1", "name": "r1", "host": "192.0.2.1",
                "port": 8728, "username": "admin"
            }],
            "accounts": [{ "id": "acc-1", "name": "Alice", "active": true }]
        }))
        .unwrap();

        let directory = InMemoryDirectory::from_inventory(inventory);
        assert_eq!(directory.device_count(), 1);
    }
}
