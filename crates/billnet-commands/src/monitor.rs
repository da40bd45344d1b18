//! Command monitor.
//!
//! Tracks every outstanding dispatch attempt, supervises its deadline,
//! retries failed or timed out attempts with a fixed delay and publishes one
//! [`CommandCompleted`] notification per logical command once it reaches a
//! terminal state.
//!
//! Each pending attempt owns one supervisor task: it waits out the retry
//! delay (for retries), publishes the command, then sleeps until the
//! deadline. Cancelling an attempt is aborting its supervisor. All registry
//! mutations happen under one write lock, so results, timeouts and retries
//! are serialized even though they arrive on different tasks.
//!
//! Ledger writes happen after the lock is released. A supervisor is armed
//! only once its attempt is in the ledger, so nothing is published that a
//! restarted monitor could not recover.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use billnet_core::broker::{BrokerError, SharedBroker, publish_json};
use billnet_core::config::{DispatchConfig, defaults, groups, topics};
use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, oneshot, watch};
use tokio::task::JoinHandle;

use crate::command::{
    Command, CommandCompleted, CommandId, CommandResult, CommandState, CommandStatus,
};
use crate::executor::{ACCOUNT_NOT_FOUND, DEVICE_NOT_FOUND};
use crate::ledger::SharedLedger;
use crate::producer::CommandProducer;

/// Synthetic error recorded when a deadline passes without a result.
pub const DEADLINE_EXCEEDED: &str = "deadline exceeded";

/// Monitor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Deadline used when registration does not specify one
    pub default_timeout_ms: u64,
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Fixed wait before a retry is published
    pub retry_delay_ms: u64,
    /// Consumer group on the results topic
    pub group: String,
    /// Topic results are read from
    pub results_topic: String,
    /// Topic terminal notifications are published to
    pub notifications_topic: String,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: defaults::COMMAND_TIMEOUT_MS,
            max_retries: defaults::MAX_RETRIES,
            retry_delay_ms: defaults::RETRY_DELAY_MS,
            group: groups::MONITOR.to_string(),
            results_topic: topics::RESULTS.to_string(),
            notifications_topic: topics::NOTIFICATIONS.to_string(),
        }
    }
}

impl MonitorConfig {
    /// Monitor settings from the shared dispatch configuration.
    pub fn from_dispatch(config: &DispatchConfig) -> Self {
        Self {
            default_timeout_ms: config.command_timeout_ms,
            max_retries: config.max_retries,
            retry_delay_ms: config.retry_delay_ms,
            group: groups::MONITOR.to_string(),
            results_topic: config.topics.results.clone(),
            notifications_topic: config.topics.notifications.clone(),
        }
    }
}

/// Counts over the live registry plus outcome totals since creation.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandStats {
    /// Attempts currently pending
    pub pending: usize,
    /// Commands that completed successfully
    pub completed: u64,
    /// Commands that failed after exhausting retries
    pub failed: u64,
    /// Commands that timed out after exhausting retries
    pub timed_out: u64,
    /// Retry attempts started
    pub retried: u64,
    /// Results that matched no pending attempt
    pub orphaned: u64,
}

impl CommandStats {
    /// Number of commands that reached a terminal state.
    pub fn terminal(&self) -> u64 {
        self.completed + self.failed + self.timed_out
    }
}

/// Monitor error types.
#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("Subscription failed: {0}")]
    Subscribe(BrokerError),
}

#[derive(Default)]
struct Counters {
    completed: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    retried: AtomicU64,
    orphaned: AtomicU64,
}

struct Tracked {
    status: CommandStatus,
    supervisor: JoinHandle<()>,
}

enum Outcome {
    Success(Option<serde_json::Value>),
    Failure {
        error: String,
        terminal_state: CommandState,
        retryable: bool,
    },
}

struct MonitorInner {
    config: MonitorConfig,
    broker: SharedBroker,
    producer: CommandProducer,
    ledger: SharedLedger,
    registry: RwLock<HashMap<CommandId, Tracked>>,
    counters: Counters,
}

impl MonitorInner {
    /// Spawn the supervisor of one attempt.
    ///
    /// Nothing happens until `armed` fires, which callers do once the ledger
    /// holds the attempt. With `dispatch` set, the command is published after
    /// the delay and the deadline starts counting from the publish.
    fn supervise(
        self: &Arc<Self>,
        command_id: CommandId,
        timeout: Duration,
        dispatch: Option<(Command, Duration)>,
        armed: oneshot::Receiver<()>,
    ) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);

        tokio::spawn(async move {
            let _ = armed.await;

            if let Some((command, delay)) = dispatch {
                tokio::time::sleep(delay).await;
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                if let Err(e) = inner.producer.publish(&command).await {
                    tracing::warn!(command_id = %command.id, error = %e, "Dispatch failed");
                    let outcome = Outcome::Failure {
                        error: format!("dispatch failed: {}", e),
                        terminal_state: CommandState::Failed,
                        retryable: true,
                    };
                    inner.settle(&command.id, outcome, false).await;
                    return;
                }
            }

            tokio::time::sleep(timeout).await;
            if let Some(inner) = weak.upgrade() {
                inner.settle(&command_id, Self::deadline_outcome(), false).await;
            }
        })
    }

    fn deadline_outcome() -> Outcome {
        Outcome::Failure {
            error: DEADLINE_EXCEEDED.to_string(),
            terminal_state: CommandState::Timeout,
            retryable: true,
        }
    }

    /// Track an attempt. The returned sender arms its supervisor.
    fn insert_pending(
        self: &Arc<Self>,
        registry: &mut HashMap<CommandId, Tracked>,
        status: CommandStatus,
        dispatch: Option<(Command, Duration)>,
    ) -> oneshot::Sender<()> {
        let (arm, armed) = oneshot::channel();
        let supervisor = self.supervise(
            status.command_id.clone(),
            Duration::from_millis(status.timeout_ms),
            dispatch,
            armed,
        );
        registry.insert(status.command_id.clone(), Tracked { status, supervisor });
        arm
    }

    // Ledger writes run outside the registry lock; failures never block.

    fn ledger_save(&self, status: &CommandStatus) {
        if let Err(e) = self.ledger.save_pending(status) {
            tracing::warn!(command_id = %status.command_id, error = %e, "Ledger write failed");
        }
    }

    fn ledger_remove(&self, command_id: &CommandId) {
        if let Err(e) = self.ledger.remove_pending(command_id) {
            tracing::warn!(command_id = %command_id, error = %e, "Ledger write failed");
        }
    }

    fn ledger_replace(&self, old_id: &CommandId, next: &CommandStatus) {
        if let Err(e) = self.ledger.replace_pending(old_id, next) {
            tracing::warn!(command_id = %old_id, error = %e, "Ledger write failed");
        }
    }

    async fn register(
        self: &Arc<Self>,
        status: CommandStatus,
        dispatch: Option<(Command, Duration)>,
    ) -> bool {
        let mut registry = self.registry.write().await;
        if registry.contains_key(&status.command_id) {
            tracing::debug!(command_id = %status.command_id, "Command already registered");
            return false;
        }

        tracing::debug!(
            command_id = %status.command_id,
            device_id = %status.device_id,
            retry_count = status.retry_count,
            timeout_ms = status.timeout_ms,
            "Command registered"
        );
        let record = status.clone();
        let arm = self.insert_pending(&mut registry, status, dispatch);
        drop(registry);

        self.ledger_save(&record);
        let _ = arm.send(());
        true
    }

    /// Apply an outcome to a pending attempt. Returns false if the id is not
    /// pending.
    async fn settle(self: &Arc<Self>, command_id: &str, outcome: Outcome, cancel: bool) -> bool {
        let mut registry = self.registry.write().await;
        let Some(tracked) = registry.remove(command_id) else {
            return false;
        };
        if cancel {
            tracked.supervisor.abort();
        }

        let mut status = tracked.status;
        match outcome {
            Outcome::Success(result) => {
                drop(registry);
                self.ledger_remove(&status.command_id);
                status.finish(CommandState::Completed, result, None);
                self.notify(status).await;
            }
            Outcome::Failure {
                error,
                retryable,
                ..
            } if retryable && status.can_retry() => {
                let next = status.command.next_attempt();
                let delay = Duration::from_millis(self.config.retry_delay_ms);

                tracing::info!(
                    command_id,
                    next_command_id = %next.id,
                    device_id = %status.device_id,
                    retry = status.retry_count + 1,
                    max_retries = status.max_retries,
                    error = %error,
                    "Retrying command"
                );

                let next_status = CommandStatus::pending(
                    next.clone(),
                    status.retry_count + 1,
                    status.max_retries,
                    status.timeout_ms,
                );
                let record = next_status.clone();
                let arm = self.insert_pending(&mut registry, next_status, Some((next, delay)));
                drop(registry);
                self.counters.retried.fetch_add(1, Ordering::Relaxed);

                self.ledger_replace(&status.command_id, &record);
                let _ = arm.send(());
            }
            Outcome::Failure {
                error,
                terminal_state,
                ..
            } => {
                drop(registry);
                self.ledger_remove(&status.command_id);
                status.finish(terminal_state, None, Some(error));
                self.notify(status).await;
            }
        }
        true
    }

    async fn notify(&self, status: CommandStatus) {
        let counter = match status.status {
            CommandState::Completed => &self.counters.completed,
            CommandState::Timeout => &self.counters.timed_out,
            _ => &self.counters.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);

        let notification = CommandCompleted::from_status(&status);
        tracing::info!(
            command_id = %status.command_id,
            device_id = %status.device_id,
            status = status.status.type_name(),
            retry_count = status.retry_count,
            "Command finished"
        );

        if let Err(e) = self.ledger.record_outcome(&notification) {
            tracing::warn!(command_id = %status.command_id, error = %e, "Ledger write failed");
        }
        if let Err(e) = publish_json(
            self.broker.as_ref(),
            &self.config.notifications_topic,
            &status.device_id,
            &notification,
        )
        .await
        {
            tracing::error!(
                command_id = %status.command_id,
                error = %e,
                "Terminal notification could not be published"
            );
        }
    }

    async fn on_result(self: &Arc<Self>, result: CommandResult) -> bool {
        let outcome = if result.success {
            Outcome::Success(result.result)
        } else {
            let error = result.error.unwrap_or_else(|| "unknown error".to_string());
            // Retrying cannot fix a reference that does not exist
            let retryable = error != DEVICE_NOT_FOUND && error != ACCOUNT_NOT_FOUND;
            Outcome::Failure {
                error,
                terminal_state: CommandState::Failed,
                retryable,
            }
        };

        let tracked = self.settle(&result.command_id, outcome, true).await;
        if !tracked {
            self.counters.orphaned.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                command_id = %result.command_id,
                device_id = %result.device_id,
                "Result for unknown command ignored"
            );
        }
        tracked
    }

    async fn clear(&self) -> usize {
        let mut registry = self.registry.write().await;
        let count = registry.len();
        for (_, tracked) in registry.drain() {
            tracked.supervisor.abort();
        }
        count
    }
}

/// Command monitor.
pub struct CommandMonitor {
    inner: Arc<MonitorInner>,
    running: Arc<RwLock<bool>>,
    shutdown: watch::Sender<bool>,
    task_handle: Arc<RwLock<Option<JoinHandle<()>>>>,
}

impl CommandMonitor {
    /// Create a new monitor. Nothing is consumed until [`start`](Self::start).
    pub fn new(
        broker: SharedBroker,
        producer: CommandProducer,
        ledger: SharedLedger,
        config: MonitorConfig,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(MonitorInner {
                config,
                broker,
                producer,
                ledger,
                registry: RwLock::new(HashMap::new()),
                counters: Counters::default(),
            }),
            running: Arc::new(RwLock::new(false)),
            shutdown,
            task_handle: Arc::new(RwLock::new(None)),
        }
    }

    /// Monitor configuration.
    pub fn config(&self) -> &MonitorConfig {
        &self.inner.config
    }

    /// Track a published command and arm its deadline.
    ///
    /// Registration is create-only: returns `false` and changes nothing if
    /// the id is already pending.
    pub async fn register_command(&self, command: Command, timeout_ms: Option<u64>) -> bool {
        let timeout_ms = timeout_ms.unwrap_or(self.inner.config.default_timeout_ms);
        let status = CommandStatus::pending(command, 0, self.inner.config.max_retries, timeout_ms);
        self.inner.register(status, None).await
    }

    /// Handle a result from the executor.
    ///
    /// Returns `false` for results that match no pending attempt; those are
    /// expected under duplicate delivery and are only logged.
    pub async fn on_result(&self, result: CommandResult) -> bool {
        self.inner.on_result(result).await
    }

    /// Expire a pending attempt now, as if its deadline had passed.
    pub async fn on_timeout(&self, command_id: &str) -> bool {
        self.inner
            .settle(command_id, MonitorInner::deadline_outcome(), true)
            .await
    }

    /// Drop a pending attempt without notifying, e.g. when its first publish
    /// failed and the caller already saw the error.
    pub async fn forget(&self, command_id: &str) -> bool {
        let Some(tracked) = self.inner.registry.write().await.remove(command_id) else {
            return false;
        };
        tracked.supervisor.abort();
        self.inner.ledger_remove(&tracked.status.command_id);
        true
    }

    /// Status of a pending attempt.
    pub async fn get_command_status(&self, command_id: &str) -> Option<CommandStatus> {
        self.inner
            .registry
            .read()
            .await
            .get(command_id)
            .map(|tracked| tracked.status.clone())
    }

    /// All pending attempts, oldest first.
    pub async fn get_active_commands(&self) -> Vec<CommandStatus> {
        let mut active: Vec<CommandStatus> = self
            .inner
            .registry
            .read()
            .await
            .values()
            .map(|tracked| tracked.status.clone())
            .collect();
        active.sort_by_key(|status| status.created_at);
        active
    }

    /// Registry counts and outcome totals.
    pub async fn get_command_stats(&self) -> CommandStats {
        let pending = self.inner.registry.read().await.len();
        let counters = &self.inner.counters;
        CommandStats {
            pending,
            completed: counters.completed.load(Ordering::Relaxed),
            failed: counters.failed.load(Ordering::Relaxed),
            timed_out: counters.timed_out.load(Ordering::Relaxed),
            retried: counters.retried.load(Ordering::Relaxed),
            orphaned: counters.orphaned.load(Ordering::Relaxed),
        }
    }

    /// Re-register pending records left in the ledger and publish them again.
    ///
    /// A recorded attempt may never have reached the commands topic (a retry
    /// still inside its delay, or a submit interrupted before its publish),
    /// so every recovered attempt is re-sent. Device actions are idempotent
    /// and a duplicate result ends up as an orphan. The deadline restarts at
    /// the publish.
    pub async fn recover(&self) -> usize {
        let pending = match self.inner.ledger.load_pending() {
            Ok(pending) => pending,
            Err(e) => {
                tracing::warn!(error = %e, "Ledger could not be read, nothing recovered");
                return 0;
            }
        };

        let mut recovered = 0;
        for mut status in pending {
            status.status = CommandState::Pending;
            let resend = (status.command.clone(), Duration::ZERO);
            if self.inner.register(status, Some(resend)).await {
                recovered += 1;
            }
        }
        if recovered > 0 {
            tracing::info!(recovered, "Recovered pending commands from ledger");
        }
        recovered
    }

    /// Join the monitor group, recover pending commands and start consuming
    /// results.
    pub async fn start(&self) -> Result<(), MonitorError> {
        let mut running = self.running.write().await;
        if *running {
            return Ok(());
        }

        let subscription = self
            .inner
            .broker
            .subscribe(&self.inner.config.results_topic, &self.inner.config.group)
            .await
            .map_err(MonitorError::Subscribe)?;
        *running = true;
        drop(running);

        self.recover().await;

        self.shutdown.send_replace(false);
        let mut shutdown_rx = self.shutdown.subscribe();
        let inner = self.inner.clone();

        tracing::info!(
            topic = %self.inner.config.results_topic,
            group = %self.inner.config.group,
            "Monitor started"
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

                match envelope.decode::<CommandResult>() {
                    Ok(result) => {
                        inner.on_result(result).await;
                    }
                    Err(e) => {
                        tracing::warn!(message_id = %envelope.id, error = %e, "Skipping malformed result");
                    }
                }
            }
        });

        *self.task_handle.write().await = Some(handle);
        Ok(())
    }

    /// Stop consuming, cancel every deadline and clear the registry.
    ///
    /// Pending commands are abandoned without notification; they stay in the
    /// ledger for the next start.
    pub async fn stop(&self) {
        let mut running = self.running.write().await;
        let was_running = *running;
        *running = false;
        drop(running);

        if was_running {
            self.shutdown.send_replace(true);
            let mut task = self.task_handle.write().await;
            if let Some(handle) = task.take() {
                drop(task);
                handle.await.ok();
            }
        }

        let abandoned = self.inner.clear().await;
        tracing::info!(abandoned, "Monitor stopped");
    }

    /// Check if the monitor is consuming results.
    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }
}

impl Drop for CommandMonitor {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}
