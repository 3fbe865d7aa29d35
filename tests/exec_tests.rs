//! Batch command execution tests.
//!
//! This module tests:
//! - Natural completion with zero and non-zero exit codes
//! - Per-host timeouts racing the natural end of the command
//! - Operator interrupts
//! - Script upload before execution
//! - Transcript banners and persisted status transitions

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use pretty_assertions::assert_eq;

use common::*;
use hostrelay::config::ExecConfig;
use hostrelay::exec::{
    BatchExecutor, ExecCommand, ExecContext, ExecHostStatus, ExecLogStore, MemoryExecLogStore,
};
use hostrelay::store::{ExecHostStore, MemoryStore};
use hostrelay::timeout::TimeoutChecker;

use ExecHostStatus::*;

struct Harness {
    executor: BatchExecutor,
    store: Arc<MemoryStore>,
    logs: Arc<MemoryExecLogStore>,
    connector: Arc<MockConnector>,
    checker: TimeoutChecker,
}

impl Harness {
    fn new(connector: MockConnector) -> Self {
        Self::with_config(connector, ExecConfig::default())
    }

    fn with_config(connector: MockConnector, config: ExecConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        let logs = Arc::new(MemoryExecLogStore::new());
        let connector = Arc::new(connector);
        let checker = TimeoutChecker::start();
        let executor = BatchExecutor::new(ExecContext {
            store: store.clone(),
            resolver: resolver(&[1, 2]),
            connector: connector.clone(),
            logs: logs.clone(),
            checker: checker.clone(),
            config,
        });
        Self {
            executor,
            store,
            logs,
            connector,
            checker,
        }
    }

    async fn transcript(&self, exec_id: u64, host_id: u64) -> String {
        self.logs.read(exec_id, host_id).await.unwrap()
    }
}

#[tokio::test]
async fn test_command_completes() {
    let harness = Harness::new(MockConnector::new());
    let command = ExecCommand::new(10, "echo hello").with_operator(4, "alice");

    let handle = harness.executor.submit(command, &[1]).await.unwrap();
    let outcomes = handle.wait().await;

    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].status, Completed);
    assert_eq!(outcomes[0].exit_code, Some(0));
    assert_eq!(
        harness.store.host_status_history(outcomes[0].id),
        vec![Waiting, Running, Completed]
    );

    let record = ExecHostStore::get_by_id(harness.store.as_ref(), outcomes[0].id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.exit_code, Some(0));
    assert_eq!(record.host_name, "host-1");
    assert!(record.start_time.is_some() && record.finish_time.is_some());

    let transcript = harness.transcript(10, 1).await;
    assert!(transcript.contains("> preparing"));
    assert!(transcript.contains("alice (4)"));
    assert!(transcript.contains("hello\n"));
    assert!(transcript.contains("< completed"));
    assert_eq!(count(&harness.connector.stats.connections_closed), 1);
    assert_eq!(*harness.connector.stats.exec_timeouts.lock(), vec![None]);
}

#[tokio::test]
async fn test_non_zero_exit_fails() {
    let harness = Harness::new(MockConnector::new());
    let handle = harness
        .executor
        .submit(ExecCommand::new(11, "warn disk full; exit 3"), &[1])
        .await
        .unwrap();
    let outcomes = handle.wait().await;

    assert_eq!(outcomes[0].status, Failed);
    assert_eq!(outcomes[0].exit_code, Some(3));
    let transcript = harness.transcript(11, 1).await;
    assert!(transcript.contains("disk full"));
    assert!(transcript.contains("< completed"));
}

#[tokio::test]
async fn test_timeout_terminates_command() {
    let harness = Harness::new(MockConnector::new());
    let command = ExecCommand::new(12, "echo started; sleep 5000")
        .with_timeout(Duration::from_millis(200));

    let started = Instant::now();
    let handle = harness.executor.submit(command, &[1]).await.unwrap();
    let outcomes = handle.wait().await;

    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(outcomes[0].status, Timeout);
    assert_eq!(outcomes[0].exit_code, None);
    assert_eq!(
        harness.store.host_status_history(outcomes[0].id),
        vec![Waiting, Running, Timeout]
    );
    assert_eq!(count(&harness.connector.stats.terminated), 1);
    assert_eq!(count(&harness.connector.stats.connections_closed), 1);
    assert!(harness.checker.is_empty());
    assert_eq!(
        *harness.connector.stats.exec_timeouts.lock(),
        vec![Some(Duration::from_millis(200))]
    );

    let record = ExecHostStore::get_by_id(harness.store.as_ref(), outcomes[0].id)
        .await
        .unwrap()
        .unwrap();
    assert!(record.error_message.is_some());

    let transcript = harness.transcript(12, 1).await;
    assert!(transcript.contains("started"));
    assert!(transcript.contains("< timeout"));
    assert!(!transcript.contains("< completed"));
}

#[tokio::test]
async fn test_deadline_racing_exit_records_one_final_status() {
    let harness = Harness::new(MockConnector::new());

    for exec_id in 100..120u64 {
        let command = ExecCommand::new(exec_id, "sleep 50; echo tail")
            .with_timeout(Duration::from_millis(50));
        let handle = harness.executor.submit(command, &[1]).await.unwrap();
        let outcomes = handle.wait().await;

        let history = harness.store.host_status_history(outcomes[0].id);
        assert_eq!(history.len(), 3, "history of exec {}: {:?}", exec_id, history);
        assert_eq!(&history[..2], &[Waiting, Running]);
        assert!(matches!(history[2], Completed | Timeout));
        assert_eq!(history[2], outcomes[0].status);

        let transcript = harness.transcript(exec_id, 1).await;
        let endings =
            transcript.matches("< completed").count() + transcript.matches("< timeout").count();
        assert_eq!(endings, 1, "transcript of exec {}: {}", exec_id, transcript);
        if history[2] == Timeout {
            assert!(transcript.contains("< timeout"));
        } else {
            assert!(transcript.contains("< completed"));
        }
    }
    assert!(harness.checker.is_empty());
}

#[tokio::test]
async fn test_default_timeout_applies() {
    let config = ExecConfig {
        default_timeout: Duration::from_millis(150),
        ..ExecConfig::default()
    };
    let harness = Harness::with_config(MockConnector::new(), config);

    let handle = harness
        .executor
        .submit(ExecCommand::new(13, "sleep 5000"), &[1])
        .await
        .unwrap();
    let outcomes = handle.wait().await;

    assert_eq!(outcomes[0].status, Timeout);
}

#[tokio::test]
async fn test_finishing_before_deadline_completes() {
    let harness = Harness::new(MockConnector::new());
    let command = ExecCommand::new(14, "sleep 20; echo done").with_timeout(Duration::from_secs(5));

    let handle = harness.executor.submit(command, &[1]).await.unwrap();
    let outcomes = handle.wait().await;

    assert_eq!(outcomes[0].status, Completed);
    assert_eq!(count(&harness.connector.stats.terminated), 0);
    assert!(harness.checker.is_empty());
}

#[tokio::test]
async fn test_interrupt_running_command() {
    let harness = Harness::new(MockConnector::new());
    let handle = harness
        .executor
        .submit(ExecCommand::new(15, "sleep 5000"), &[1, 2])
        .await
        .unwrap();

    let stats = Arc::clone(&harness.connector.stats);
    assert!(wait_for(|| count(&stats.execs_opened) == 2).await);
    assert!(handle.interrupt_host(1));
    assert!(!handle.interrupt_host(99));
    handle.interrupt();
    let outcomes = handle.wait().await;

    assert_eq!(
        outcomes.iter().map(|o| o.status).collect::<Vec<_>>(),
        vec![Interrupted, Interrupted]
    );
    assert_eq!(count(&stats.terminated), 2);
    assert_eq!(count(&stats.connections_closed), 2);

    let transcript = harness.transcript(15, 1).await;
    assert!(transcript.contains("< interrupted"));
    assert!(!transcript.contains("< completed"));
}

#[tokio::test]
async fn test_placeholders_are_rendered_per_host() {
    let harness = Harness::new(MockConnector::new());
    let command = ExecCommand::new(16, "echo @{{ greeting }} from @{{hostName}} @{{ unknown }}")
        .with_param("greeting", "hi");

    let handle = harness.executor.submit(command, &[1, 2]).await.unwrap();
    handle.wait().await;

    let mut commands = harness.connector.stats.commands.lock().clone();
    commands.sort();
    assert_eq!(
        commands,
        vec![
            "echo hi from host-1 @{{ unknown }}".to_string(),
            "echo hi from host-2 @{{ unknown }}".to_string(),
        ]
    );
    assert!(harness.transcript(16, 2).await.contains("hi from host-2"));
}

#[tokio::test]
async fn test_script_is_uploaded_then_run() {
    let harness = Harness::new(MockConnector::new());
    let command = ExecCommand::new(17, "echo from script\nexit 0").with_script(true);

    let handle = harness.executor.submit(command, &[1]).await.unwrap();
    let outcomes = handle.wait().await;

    let path = "/tmp/hostrelay/script/17_1.sh";
    assert_eq!(outcomes[0].status, Completed);
    assert_eq!(
        harness.connector.fs.read_string(path).as_deref(),
        Some("echo from script\nexit 0")
    );
    assert_eq!(harness.connector.fs.mode(path), Some(0o755));
    assert_eq!(
        harness.connector.stats.commands.lock().clone(),
        vec![path.to_string()]
    );

    let transcript = harness.transcript(17, 1).await;
    let uploaded = transcript.find("< uploaded").unwrap();
    assert!(transcript.contains("> uploading"));
    assert!(uploaded < transcript.rfind("> start").unwrap());
    // once in the command block, once as output
    assert_eq!(transcript.matches("from script\n").count(), 2);
    assert!(uploaded < transcript.rfind("from script\n").unwrap());
}

#[tokio::test]
async fn test_connect_failure_fails_host() {
    let harness = Harness::new(MockConnector::failing());
    let handle = harness
        .executor
        .submit(ExecCommand::new(18, "uptime"), &[1])
        .await
        .unwrap();
    let outcomes = handle.wait().await;

    assert_eq!(outcomes[0].status, Failed);
    assert_eq!(
        harness.store.host_status_history(outcomes[0].id),
        vec![Waiting, Running, Failed]
    );
    let record = ExecHostStore::get_by_id(harness.store.as_ref(), outcomes[0].id)
        .await
        .unwrap()
        .unwrap();
    assert!(record
        .error_message
        .unwrap_or_default()
        .contains("refused the connection"));
    assert!(harness.transcript(18, 1).await.contains("< failed"));
    assert_eq!(count(&harness.connector.stats.execs_opened), 0);
}

#[tokio::test]
async fn test_unknown_host_fails() {
    let harness = Harness::new(MockConnector::new());
    let handle = harness
        .executor
        .submit(ExecCommand::new(19, "uptime"), &[42])
        .await
        .unwrap();
    let outcomes = handle.wait().await;

    assert_eq!(outcomes[0].host_id, 42);
    assert_eq!(outcomes[0].status, Failed);
    assert_eq!(count(&harness.connector.stats.sessions_opened), 0);
}

#[tokio::test]
async fn test_character_split_across_output_chunks_is_kept() {
    let harness = Harness::new(MockConnector::new());
    // "x\u{e9}y\n" with the two bytes of the accent in separate chunks
    let command = ExecCommand::new(30, "bytes 78c3; bytes a9790a");

    let handle = harness.executor.submit(command, &[1]).await.unwrap();
    let outcomes = handle.wait().await;

    assert_eq!(outcomes[0].status, Completed);
    let transcript = harness.transcript(30, 1).await;
    assert!(transcript.contains("x\u{e9}y\n"), "{}", transcript);
    assert!(!transcript.contains('\u{fffd}'));
}
