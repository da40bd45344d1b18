//! Command monitor tests.
//!
//! Run on paused time: sleeping in the test advances the clock and fires
//! deadlines and retry delays deterministically.

use std::sync::Arc;
use std::time::Duration;

use billnet_commands::{
    Command, CommandCompleted, CommandId, CommandLedger, CommandMonitor, CommandProducer,
    CommandRequest, CommandResult, CommandState, CommandStatus, CommandType, DEADLINE_EXCEEDED,
    DEVICE_NOT_FOUND, LedgerError, MemoryLedger, MonitorConfig, RedbLedger,
};
use billnet_core::broker::{InMemoryBroker, MessageBroker, Subscription, publish_json};
use serde_json::json;
use tempfile::TempDir;

struct Harness {
    broker: Arc<InMemoryBroker>,
    ledger: Arc<MemoryLedger>,
    monitor: CommandMonitor,
    commands: Subscription,
    notifications: Subscription,
}

fn config(timeout_ms: u64, max_retries: u32, retry_delay_ms: u64) -> MonitorConfig {
    MonitorConfig {
        default_timeout_ms: timeout_ms,
        max_retries,
        retry_delay_ms,
        ..MonitorConfig::default()
    }
}

async fn harness(config: MonitorConfig) -> Harness {
    let broker = Arc::new(InMemoryBroker::new());
    let ledger = Arc::new(MemoryLedger::default());
    let commands = broker.subscribe("commands", "test").await.unwrap();
    let notifications = broker.subscribe("notifications", "test").await.unwrap();
    let monitor = CommandMonitor::new(
        broker.clone(),
        CommandProducer::new(broker.clone()),
        ledger.clone(),
        config,
    );

    Harness {
        broker,
        ledger,
        monitor,
        commands,
        notifications,
    }
}

fn block_command() -> Command {
    Command::from_request(CommandRequest::new(
        CommandType::BlockClient,
        "router-7",
        "acc-42",
        "AA:BB:CC:00:11:22",
    ))
}

fn lease_command() -> Command {
    Command::from_request(
        CommandRequest::new(CommandType::AddLease, "router-7", "acc-42", "AA:BB:CC:00:11:22")
            .with_lease("10.20.0.15", "residential"),
    )
}

async fn next_notification(sub: &Subscription) -> CommandCompleted {
    let envelope = tokio::time::timeout(Duration::from_secs(60), sub.recv())
        .await
        .expect("notification not published")
        .unwrap();
    envelope.decode().unwrap()
}

async fn sleep_ms(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

#[tokio::test(start_paused = true)]
async fn test_failure_without_retries_is_terminal() {
    let h = harness(config(30_000, 0, 5_000)).await;
    let command = block_command();

    assert!(h.monitor.register_command(command.clone(), None).await);
    assert!(
        h.monitor
            .on_result(CommandResult::failed(&command, "Device unreachable"))
            .await
    );

    let notification = next_notification(&h.notifications).await;
    assert!(!notification.success);
    assert_eq!(notification.command_id, command.id);
    assert_eq!(notification.device_id, "router-7");
    assert_eq!(notification.account_id, "acc-42");
    assert_eq!(notification.error.as_deref(), Some("Device unreachable"));
    assert_eq!(notification.retry_count, 0);

    let stats = h.monitor.get_command_stats().await;
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.failed, 1);
    assert!(h.monitor.get_active_commands().await.is_empty());

    // Nothing else fires later
    sleep_ms(60_000).await;
    assert!(h.notifications.try_recv().is_none());
    assert!(h.commands.try_recv().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_timeout_retries_then_times_out() {
    let h = harness(config(50, 1, 10)).await;
    let command = block_command();
    h.monitor.register_command(command.clone(), None).await;

    // First deadline passed, retry waiting out its delay
    sleep_ms(55).await;
    let active = h.monitor.get_active_commands().await;
    assert_eq!(active.len(), 1);
    assert_ne!(active[0].command_id, command.id);
    assert_eq!(active[0].retry_count, 1);
    assert!(h.monitor.get_command_status(&command.id).await.is_none());
    assert!(h.commands.try_recv().is_none());

    // Retry published after the delay
    sleep_ms(10).await;
    let retry: Command = h.commands.try_recv().unwrap().decode().unwrap();
    assert_eq!(retry.id, active[0].command_id);
    assert_eq!(retry.request(), command.request());

    let notification = next_notification(&h.notifications).await;
    assert!(!notification.success);
    assert_eq!(notification.command_id, retry.id);
    assert_eq!(notification.error.as_deref(), Some(DEADLINE_EXCEEDED));
    assert_eq!(notification.retry_count, 1);

    let stats = h.monitor.get_command_stats().await;
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.timed_out, 1);
    assert_eq!(stats.retried, 1);
}

#[tokio::test(start_paused = true)]
async fn test_success_cancels_deadline() {
    let h = harness(config(5_000, 3, 100)).await;
    let command = block_command();
    h.monitor.register_command(command.clone(), None).await;

    sleep_ms(100).await;
    h.monitor
        .on_result(CommandResult::success(&command, json!({ "blocked": true })))
        .await;

    let notification = next_notification(&h.notifications).await;
    assert!(notification.success);
    assert!(notification.error.is_none());

    sleep_ms(10_000).await;
    assert!(h.notifications.try_recv().is_none());
    assert!(h.commands.try_recv().is_none());

    let stats = h.monitor.get_command_stats().await;
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.timed_out, 0);
    assert_eq!(stats.retried, 0);
}

#[tokio::test(start_paused = true)]
async fn test_register_is_idempotent() {
    let h = harness(config(1_000, 0, 0)).await;
    let command = block_command();

    assert!(h.monitor.register_command(command.clone(), Some(200)).await);
    assert!(!h.monitor.register_command(command.clone(), Some(5_000)).await);

    let active = h.monitor.get_active_commands().await;
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].timeout_ms, 200);

    // The first deadline governs, and fires once
    sleep_ms(300).await;
    let notification = next_notification(&h.notifications).await;
    assert_eq!(notification.error.as_deref(), Some(DEADLINE_EXCEEDED));
    sleep_ms(5_000).await;
    assert!(h.notifications.try_recv().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_unknown_and_duplicate_results_are_ignored() {
    let h = harness(config(1_000, 0, 0)).await;
    let stranger = block_command();
    assert!(
        !h.monitor
            .on_result(CommandResult::success(&stranger, json!({})))
            .await
    );

    let command = block_command();
    h.monitor.register_command(command.clone(), None).await;
    assert!(
        h.monitor
            .on_result(CommandResult::success(&command, json!({})))
            .await
    );
    assert!(
        !h.monitor
            .on_result(CommandResult::failed(&command, "late failure"))
            .await
    );

    let notification = next_notification(&h.notifications).await;
    assert!(notification.success);
    assert!(h.notifications.try_recv().is_none());

    let stats = h.monitor.get_command_stats().await;
    assert_eq!(stats.orphaned, 2);
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.failed, 0);
}

#[tokio::test(start_paused = true)]
async fn test_failure_retry_keeps_payload() {
    let h = harness(config(1_000, 2, 250)).await;
    let command = lease_command();
    h.monitor.register_command(command.clone(), None).await;

    h.monitor
        .on_result(CommandResult::failed(&command, "Device unreachable"))
        .await;

    let active = h.monitor.get_active_commands().await;
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].retry_count, 1);
    assert_eq!(active[0].max_retries, 2);
    assert!(h.notifications.try_recv().is_none());

    sleep_ms(250).await;
    let retry: Command = h.commands.try_recv().unwrap().decode().unwrap();
    assert_eq!(retry.id, active[0].command_id);
    assert_eq!(retry.mac_address, "AA:BB:CC:00:11:22");
    assert_eq!(retry.ip_address.as_deref(), Some("10.20.0.15"));
    assert_eq!(retry.pool_name.as_deref(), Some("residential"));
    assert_eq!(retry.command_type, CommandType::AddLease);

    h.monitor
        .on_result(CommandResult::success(&retry, json!({ "lease": "ok" })))
        .await;
    let notification = next_notification(&h.notifications).await;
    assert!(notification.success);
    assert_eq!(notification.command_id, retry.id);
    assert_eq!(notification.retry_count, 1);
}

#[tokio::test(start_paused = true)]
async fn test_retries_exhausted_on_failures() {
    let h = harness(config(1_000, 1, 10)).await;
    let command = block_command();
    h.monitor.register_command(command.clone(), None).await;

    h.monitor
        .on_result(CommandResult::failed(&command, "first"))
        .await;
    sleep_ms(10).await;
    let retry: Command = h.commands.try_recv().unwrap().decode().unwrap();

    h.monitor
        .on_result(CommandResult::failed(&retry, "second"))
        .await;

    let notification = next_notification(&h.notifications).await;
    assert!(!notification.success);
    assert_eq!(notification.error.as_deref(), Some("second"));
    assert_eq!(notification.retry_count, 1);

    // Exactly one notification per logical command
    sleep_ms(5_000).await;
    assert!(h.notifications.try_recv().is_none());
    assert!(h.commands.try_recv().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_missing_device_is_not_retried() {
    let h = harness(config(1_000, 3, 10)).await;
    let command = block_command();
    h.monitor.register_command(command.clone(), None).await;

    h.monitor
        .on_result(CommandResult::failed(&command, DEVICE_NOT_FOUND))
        .await;

    let notification = next_notification(&h.notifications).await;
    assert!(!notification.success);
    assert_eq!(notification.error.as_deref(), Some(DEVICE_NOT_FOUND));
    assert_eq!(notification.retry_count, 0);

    sleep_ms(100).await;
    assert!(h.commands.try_recv().is_none());
    assert_eq!(h.monitor.get_command_stats().await.retried, 0);
}

#[tokio::test(start_paused = true)]
async fn test_manual_timeout() {
    let h = harness(config(60_000, 0, 0)).await;
    let command = block_command();
    h.monitor.register_command(command.clone(), None).await;

    assert!(h.monitor.on_timeout(&command.id).await);
    assert!(!h.monitor.on_timeout(&command.id).await);

    let notification = next_notification(&h.notifications).await;
    assert_eq!(notification.error.as_deref(), Some(DEADLINE_EXCEEDED));
    assert_eq!(h.monitor.get_command_stats().await.timed_out, 1);

    // The cancelled deadline does not fire again
    sleep_ms(120_000).await;
    assert!(h.notifications.try_recv().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_failed_retry_publish_counts_as_failure() {
    let h = harness(config(1_000, 1, 100)).await;
    let command = block_command();
    h.monitor.register_command(command.clone(), None).await;

    h.monitor
        .on_result(CommandResult::failed(&command, "Device unreachable"))
        .await;
    h.broker.set_available(false);
    sleep_ms(150).await;

    let stats = h.monitor.get_command_stats().await;
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.failed, 1);

    let outcomes = h.ledger.recent_outcomes(10).unwrap();
    assert_eq!(outcomes.len(), 1);
    assert!(!outcomes[0].success);
    assert!(
        outcomes[0]
            .error
            .as_deref()
            .unwrap()
            .starts_with("dispatch failed")
    );
}

#[tokio::test(start_paused = true)]
async fn test_ledger_mirrors_registry() {
    let h = harness(config(1_000, 1, 10)).await;
    let command = block_command();
    h.monitor.register_command(command.clone(), None).await;

    let pending = h.ledger.load_pending().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].command_id, command.id);

    h.monitor
        .on_result(CommandResult::failed(&command, "flaky"))
        .await;
    let pending = h.ledger.load_pending().unwrap();
    assert_eq!(pending.len(), 1);
    assert_ne!(pending[0].command_id, command.id);
    assert_eq!(pending[0].retry_count, 1);

    let retry_id = pending[0].command_id.clone();
    sleep_ms(10).await;
    let retry: Command = h.commands.try_recv().unwrap().decode().unwrap();
    assert_eq!(retry.id, retry_id);
    h.monitor
        .on_result(CommandResult::success(&retry, json!({})))
        .await;

    assert!(h.ledger.load_pending().unwrap().is_empty());
    let outcomes = h.ledger.recent_outcomes(10).unwrap();
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].command_id, retry_id);
}

#[tokio::test(start_paused = true)]
async fn test_stop_abandons_and_restart_recovers() {
    let h = harness(config(1_000, 2, 10)).await;
    let command = block_command();
    h.monitor.start().await.unwrap();
    assert!(h.monitor.is_running().await);
    h.monitor.register_command(command.clone(), None).await;

    h.monitor.stop().await;
    assert!(!h.monitor.is_running().await);
    assert!(h.monitor.get_active_commands().await.is_empty());

    // No notification for abandoned commands, even past the deadline
    sleep_ms(5_000).await;
    assert!(h.notifications.try_recv().is_none());
    assert_eq!(h.ledger.load_pending().unwrap().len(), 1);

    let restarted = CommandMonitor::new(
        h.broker.clone(),
        CommandProducer::new(h.broker.clone()),
        h.ledger.clone(),
        config(1_000, 2, 10),
    );
    restarted.start().await.unwrap();
    let status = restarted.get_command_status(&command.id).await.unwrap();
    assert_eq!(status.status, CommandState::Pending);

    // Recovered attempts are sent again
    let resent: Command = h.commands.recv().await.unwrap().decode().unwrap();
    assert_eq!(resent, command);

    publish_json(
        h.broker.as_ref(),
        "results",
        &command.device_id,
        &CommandResult::success(&command, json!({})),
    )
    .await
    .unwrap();

    let notification = next_notification(&h.notifications).await;
    assert!(notification.success);
    assert_eq!(notification.command_id, command.id);
    assert!(restarted.get_active_commands().await.is_empty());

    restarted.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_malformed_results_are_skipped() {
    let h = harness(config(1_000, 0, 0)).await;
    h.monitor.start().await.unwrap();
    let command = block_command();
    h.monitor.register_command(command.clone(), None).await;

    h.broker
        .publish("results", "router-7", json!({ "garbage": true }))
        .await
        .unwrap();
    publish_json(
        h.broker.as_ref(),
        "results",
        "router-7",
        &CommandResult::success(&command, json!({})),
    )
    .await
    .unwrap();

    let notification = next_notification(&h.notifications).await;
    assert!(notification.success);
    h.monitor.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_restart_sends_retry_held_in_delay() {
    let h = harness(config(100, 1, 1_000)).await;
    let command = lease_command();
    h.monitor.register_command(command.clone(), None).await;

    h.monitor
        .on_result(CommandResult::failed(&command, "Device unreachable"))
        .await;
    let retry_id = h.monitor.get_active_commands().await[0].command_id.clone();

    // Stopped while the retry waits out its delay
    sleep_ms(100).await;
    h.monitor.stop().await;
    assert!(h.commands.try_recv().is_none());

    let restarted = CommandMonitor::new(
        h.broker.clone(),
        CommandProducer::new(h.broker.clone()),
        h.ledger.clone(),
        config(100, 1, 1_000),
    );
    restarted.start().await.unwrap();
    sleep_ms(5_000).await;

    let mut published = Vec::new();
    while let Some(envelope) = h.commands.try_recv() {
        published.push(envelope.decode::<Command>().unwrap());
    }
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].id, retry_id);
    assert_eq!(published[0].request(), command.request());

    // The resent attempt went unanswered, so it ends as a timeout
    let notification = next_notification(&h.notifications).await;
    assert_eq!(notification.command_id, retry_id);
    assert_eq!(notification.retry_count, 1);
    assert_eq!(notification.error.as_deref(), Some(DEADLINE_EXCEEDED));

    restarted.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_restart_recovers_from_redb_ledger() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("ledger.redb");
    let broker = Arc::new(InMemoryBroker::new());
    let commands = broker.subscribe("commands", "test").await.unwrap();
    let notifications = broker.subscribe("notifications", "test").await.unwrap();
    let command = block_command();

    {
        let monitor = CommandMonitor::new(
            broker.clone(),
            CommandProducer::new(broker.clone()),
            Arc::new(RedbLedger::open(&path).unwrap()),
            config(1_000, 2, 10),
        );
        monitor.start().await.unwrap();
        monitor.register_command(command.clone(), None).await;
        monitor.stop().await;
    }

    let ledger = Arc::new(RedbLedger::open(&path).unwrap());
    assert_eq!(ledger.load_pending().unwrap().len(), 1);

    let restarted = CommandMonitor::new(
        broker.clone(),
        CommandProducer::new(broker.clone()),
        ledger.clone(),
        config(1_000, 2, 10),
    );
    restarted.start().await.unwrap();

    let resent: Command = commands.recv().await.unwrap().decode().unwrap();
    assert_eq!(resent.id, command.id);

    publish_json(
        broker.as_ref(),
        "results",
        &command.device_id,
        &CommandResult::success(&resent, json!({ "blocked": true })),
    )
    .await
    .unwrap();

    let notification = next_notification(&notifications).await;
    assert!(notification.success);
    assert_eq!(notification.command_id, command.id);

    restarted.stop().await;
    assert!(ledger.load_pending().unwrap().is_empty());
    let outcomes = ledger.recent_outcomes(10).unwrap();
    assert_eq!(outcomes.len(), 1);
    assert!(outcomes[0].success);
}

/// Ledger whose pending writes block until the test lets them through.
struct GatedLedger {
    inner: MemoryLedger,
    entered: tokio::sync::mpsc::UnboundedSender<()>,
    release: parking_lot::Mutex<std::sync::mpsc::Receiver<()>>,
}

impl CommandLedger for GatedLedger {
    fn save_pending(&self, status: &CommandStatus) -> Result<(), LedgerError> {
        let _ = self.entered.send(());
        let _ = self.release.lock().recv();
        self.inner.save_pending(status)
    }

    fn remove_pending(&self, command_id: &CommandId) -> Result<(), LedgerError> {
        self.inner.remove_pending(command_id)
    }

    fn replace_pending(&self, old_id: &CommandId, next: &CommandStatus) -> Result<(), LedgerError> {
        self.inner.replace_pending(old_id, next)
    }

    fn load_pending(&self) -> Result<Vec<CommandStatus>, LedgerError> {
        self.inner.load_pending()
    }

    fn record_outcome(&self, outcome: &CommandCompleted) -> Result<(), LedgerError> {
        self.inner.record_outcome(outcome)
    }

    fn recent_outcomes(&self, limit: usize) -> Result<Vec<CommandCompleted>, LedgerError> {
        self.inner.recent_outcomes(limit)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_slow_ledger_does_not_hold_registry() {
    let (entered_tx, mut entered_rx) = tokio::sync::mpsc::unbounded_channel();
    let (release_tx, release_rx) = std::sync::mpsc::channel();
    let ledger = Arc::new(GatedLedger {
        inner: MemoryLedger::default(),
        entered: entered_tx,
        release: parking_lot::Mutex::new(release_rx),
    });
    let broker = Arc::new(InMemoryBroker::new());
    let monitor = Arc::new(CommandMonitor::new(
        broker.clone(),
        CommandProducer::new(broker),
        ledger.clone(),
        config(60_000, 0, 0),
    ));

    let command = block_command();
    let registering = {
        let monitor = monitor.clone();
        let command = command.clone();
        tokio::spawn(async move { monitor.register_command(command, None).await })
    };
    entered_rx.recv().await.unwrap();

    // Registry stays readable while the ledger write is stuck
    let active = tokio::time::timeout(Duration::from_secs(1), monitor.get_active_commands())
        .await
        .expect("registry locked during ledger write");
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].command_id, command.id);

    release_tx.send(()).unwrap();
    assert!(registering.await.unwrap());
    assert_eq!(ledger.load_pending().unwrap().len(), 1);
}
