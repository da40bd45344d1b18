//! Device action executor.
//!
//! Consumes commands, performs the device action through the
//! [`DeviceController`] and publishes exactly one [`CommandResult`] per
//! consumed command, including for commands whose device or account cannot
//! be resolved.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use billnet_core::broker::{BrokerError, Envelope, SharedBroker, publish_json};
use billnet_core::config::{DispatchConfig, defaults, groups, topics};
use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, Semaphore, watch};
use tokio::task::JoinHandle;

use crate::command::{Command, CommandResult, CommandType};
use crate::device::{DeviceController, DeviceDirectory};

/// Error text for an unknown device.
pub const DEVICE_NOT_FOUND: &str = "device not found";

/// Error text for an unknown account.
pub const ACCOUNT_NOT_FOUND: &str = "account not found";

/// Executor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Consumer group shared by all executor instances
    pub group: String,
    /// Topic commands are read from
    pub commands_topic: String,
    /// Topic results are published to
    pub results_topic: String,
    /// Maximum commands executed simultaneously
    pub max_concurrent: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            group: groups::EXECUTORS.to_string(),
            commands_topic: topics::COMMANDS.to_string(),
            results_topic: topics::RESULTS.to_string(),
            max_concurrent: defaults::EXECUTOR_CONCURRENCY,
        }
    }
}

impl ExecutorConfig {
    /// Executor settings from the shared dispatch configuration.
    pub fn from_dispatch(config: &DispatchConfig) -> Self {
        Self {
            group: groups::EXECUTORS.to_string(),
            commands_topic: config.topics.commands.clone(),
            results_topic: config.topics.results.clone(),
            max_concurrent: config.executor_concurrency.max(1),
        }
    }
}

/// Executor statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutorStats {
    /// Commands consumed
    pub consumed: u64,
    /// Results published with success
    pub succeeded: u64,
    /// Results published with failure
    pub failed: u64,
    /// Messages that did not decode as a command
    pub malformed: u64,
}

#[derive(Default)]
struct Counters {
    consumed: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    malformed: AtomicU64,
}

/// Executor error types.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("Subscription failed: {0}")]
    Subscribe(BrokerError),

    #[error("Result publish failed: {0}")]
    Publish(BrokerError),
}

struct Worker {
    broker: SharedBroker,
    directory: Arc<dyn DeviceDirectory>,
    controller: Arc<dyn DeviceController>,
    results_topic: String,
    counters: Counters,
}

impl Worker {
    async fn execute(&self, command: &Command) -> CommandResult {
        let device = match self.directory.find_device(&command.device_id).await {
            Ok(Some(device)) => device,
            Ok(None) => return CommandResult::failed(command, DEVICE_NOT_FOUND),
            Err(e) => return CommandResult::failed(command, e.to_string()),
        };

        let account = match self.directory.find_account(&command.account_id).await {
            Ok(Some(account)) => account,
            Ok(None) => return CommandResult::failed(command, ACCOUNT_NOT_FOUND),
            Err(e) => return CommandResult::failed(command, e.to_string()),
        };

        let outcome = match command.command_type {
            CommandType::AddLease => self.controller.add_lease(&device, &account, command).await,
            CommandType::RemoveLease => {
                self.controller.remove_lease(&device, &account, command).await
            }
            CommandType::BlockClient => {
                self.controller.block_client(&device, &account, command).await
            }
            CommandType::UnblockClient => {
                self.controller
                    .unblock_client(&device, &account, command)
                    .await
            }
            CommandType::GetStats => self.controller.get_stats(&device, &account, command).await,
        };

        match outcome {
            Ok(payload) => CommandResult::success(command, payload),
            Err(e) => CommandResult::failed(command, e.to_string()),
        }
    }

    async fn handle(&self, command: &Command) -> Result<CommandResult, ExecutorError> {
        self.counters.consumed.fetch_add(1, Ordering::Relaxed);

        let result = self.execute(command).await;
        if result.success {
            self.counters.succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
            tracing::info!(
                command_id = %command.id,
                device_id = %command.device_id,
                error = result.error.as_deref().unwrap_or_default(),
                "Command execution failed"
            );
        }

        publish_json(
            self.broker.as_ref(),
            &self.results_topic,
            &command.device_id,
            &result,
        )
        .await
        .map_err(ExecutorError::Publish)?;

        Ok(result)
    }

    async fn handle_envelope(&self, envelope: Envelope) {
        let command: Command = match envelope.decode() {
            Ok(command) => command,
            Err(e) => {
                self.counters.malformed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(message_id = %envelope.id, error = %e, "Skipping malformed command");
                return;
            }
        };

        if let Err(e) = self.handle(&command).await {
            tracing::error!(command_id = %command.id, error = %e, "Result could not be published");
        }
    }
}

/// Command executor.
pub struct DeviceActionExecutor {
    config: ExecutorConfig,
    worker: Arc<Worker>,
    semaphore: Arc<Semaphore>,
    running: Arc<RwLock<bool>>,
    shutdown: watch::Sender<bool>,
    task_handle: Arc<RwLock<Option<JoinHandle<()>>>>,
}

impl DeviceActionExecutor {
    /// Create a new executor.
    pub fn new(
        broker: SharedBroker,
        directory: Arc<dyn DeviceDirectory>,
        controller: Arc<dyn DeviceController>,
        config: ExecutorConfig,
    ) -> Self {
        let max_concurrent = config.max_concurrent.max(1);
        let (shutdown, _) = watch::channel(false);

        Self {
            worker: Arc::new(Worker {
                broker,
                directory,
                controller,
                results_topic: config.results_topic.clone(),
                counters: Counters::default(),
            }),
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            config: ExecutorConfig {
                max_concurrent,
                ..config
            },
            running: Arc::new(RwLock::new(false)),
            shutdown,
            task_handle: Arc::new(RwLock::new(None)),
        }
    }

    /// Executor configuration.
    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Resolve and execute a command without publishing the result.
    pub async fn execute(&self, command: &Command) -> CommandResult {
        self.worker.execute(command).await
    }

    /// Execute a command and publish its result.
    pub async fn handle(&self, command: &Command) -> Result<CommandResult, ExecutorError> {
        self.worker.handle(command).await
    }

    /// Join the executor group and start consuming.
    pub async fn start(&self) -> Result<(), ExecutorError> {
        let mut running = self.running.write().await;
        if *running {
            return Ok(());
        }

        let subscription = self
            .worker
            .broker
            .subscribe(&self.config.commands_topic, &self.config.group)
            .await
            .map_err(ExecutorError::Subscribe)?;
        *running = true;
        drop(running);

        self.shutdown.send_replace(false);
        let mut shutdown_rx = self.shutdown.subscribe();
        let worker = self.worker.clone();
        let semaphore = self.semaphore.clone();

        tracing::info!(
            topic = %self.config.commands_topic,
            group = %self.config.group,
            max_concurrent = self.config.max_concurrent,
            "Executor started"
        );

        let handle = tokio::spawn(async move {
            loop {
                let envelope = tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    envelope = subscription.recv() => match envelope {
                        Some(envelope) => envelope,
                        None => break,
                    },
                };

                let permit = match semaphore.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => break,
                };

                let worker = worker.clone();
                tokio::spawn(async move {
                    worker.handle_envelope(envelope).await;
                    drop(permit);
                });
            }
        });

        *self.task_handle.write().await = Some(handle);
        Ok(())
    }

    /// Stop consuming and wait for in-flight commands to finish.
    pub async fn stop(&self) {
        let mut running = self.running.write().await;
        if !*running {
            return;
        }
        *running = false;
        drop(running);

        self.shutdown.send_replace(true);

        let mut task = self.task_handle.write().await;
        if let Some(handle) = task.take() {
            drop(task);
            handle.await.ok();
        }

        // Every permit back means no execution is still in flight
        let _ = self
            .semaphore
            .acquire_many(self.config.max_concurrent as u32)
            .await;

        tracing::info!("Executor stopped");
    }

    /// Check if the executor is running.
    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    /// Executor statistics.
    pub fn stats(&self) -> ExecutorStats {
        let counters = &self.worker.counters;
        ExecutorStats {
            consumed: counters.consumed.load(Ordering::Relaxed),
            succeeded: counters.succeeded.load(Ordering::Relaxed),
            failed: counters.failed.load(Ordering::Relaxed),
            malformed: counters.malformed.load(Ordering::Relaxed),
        }
    }
}
