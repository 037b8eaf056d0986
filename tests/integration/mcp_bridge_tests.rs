//! End-to-end tests for the JSON-RPC bridge against the mock agent.
//!
//! Covers:
//! - start then reply on the same conversation token
//! - reset starting a fresh conversation
//! - streamed deltas, reasoning, and stray events
//! - string request ids and a silent `initialize`
//! - protocol errors, timeouts, and cancellation
//! - restart after a write failure, and giving up after the retry
//! - teardown when the agent's output closes; garbage output is skipped
//! - single-flight start and restart under concurrent callers
//! - idle shutdown and graceful or forced close

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use discodex::bridge::observer::NoopObserver;
use discodex::bridge::McpBridge;
use discodex::config::ChannelConfig;
use discodex::runner::TurnContext;
use discodex::AppError;

use super::test_helpers::{
    agent_script, line_count, mock_channel, mock_command, read_call_log, script_channel,
    test_codex_config, tool_calls, wait_until, Observed, RecordingObserver,
};

fn quiet_bridge(timeout_seconds: u64) -> McpBridge {
    McpBridge::new(test_codex_config(timeout_seconds), Arc::new(NoopObserver))
}

// ── Conversation continuity ──────────────────────────────────────────────────

/// The first turn starts a conversation; the second continues it.
#[tokio::test]
async fn start_then_reply_reuses_token() {
    let dir = tempfile::tempdir().expect("tempdir");
    let log = dir.path().join("calls.jsonl");
    let channel = mock_channel("C1", &[("MOCK_AGENT_CALL_LOG", log.to_str().unwrap())]);
    let bridge = quiet_bridge(10);
    let ctx = TurnContext::for_user("alice");

    let first = bridge
        .chat_turn(&channel, "list files", &ctx)
        .await
        .expect("first turn");
    assert_eq!(first, vec!["ack: list files"]);
    assert_eq!(bridge.conversation_id("C1").await.as_deref(), Some("abc123"));

    let second = bridge
        .chat_turn(&channel, "show a.txt", &ctx)
        .await
        .expect("second turn");
    assert_eq!(second, vec!["ack: show a.txt"]);

    let calls = tool_calls(&log);
    assert_eq!(calls.len(), 2, "calls: {calls:?}");
    assert_eq!(calls[0]["params"]["name"], "codex");
    assert_eq!(calls[0]["params"]["arguments"]["sandbox"], "workspace-write");
    assert_eq!(calls[0]["params"]["arguments"]["approval-policy"], "never");
    assert_eq!(calls[0]["params"]["arguments"]["user"], "alice");
    assert_eq!(calls[1]["params"]["name"], "codex-reply");
    assert_eq!(calls[1]["params"]["arguments"]["conversationId"], "abc123");
    assert_eq!(
        calls[0]["pid"], calls[1]["pid"],
        "both turns must hit the same process"
    );

    let methods: Vec<String> = read_call_log(&log)
        .iter()
        .map(|e| e["method"].as_str().unwrap_or_default().to_owned())
        .collect();
    assert_eq!(&methods[..2], ["initialize", "initialized"]);

    bridge.shutdown().await;
}

/// After a reset the next turn starts over with `codex`.
#[tokio::test]
async fn reset_starts_a_new_conversation() {
    let dir = tempfile::tempdir().expect("tempdir");
    let log = dir.path().join("calls.jsonl");
    let channel = mock_channel("C1", &[("MOCK_AGENT_CALL_LOG", log.to_str().unwrap())]);
    let bridge = quiet_bridge(10);
    let ctx = TurnContext::default();

    bridge.chat_turn(&channel, "one", &ctx).await.expect("turn one");
    bridge.reset_conversation("C1").await;
    assert_eq!(bridge.conversation_id("C1").await, None);
    bridge.chat_turn(&channel, "two", &ctx).await.expect("turn two");

    let names: Vec<_> = tool_calls(&log)
        .iter()
        .map(|c| c["params"]["name"].as_str().unwrap_or_default().to_owned())
        .collect();
    assert_eq!(names, vec!["codex", "codex"]);

    bridge.shutdown().await;
}

/// Channels keep separate conversations on one shared process.
#[tokio::test]
async fn channels_share_process_but_not_conversations() {
    let dir = tempfile::tempdir().expect("tempdir");
    let log = dir.path().join("calls.jsonl");
    let log_env = [("MOCK_AGENT_CALL_LOG", log.to_str().unwrap())];
    let alpha = mock_channel("C-alpha", &log_env);
    let beta = mock_channel("C-beta", &log_env);
    let bridge = quiet_bridge(10);
    let ctx = TurnContext::default();

    bridge.chat_turn(&alpha, "a1", &ctx).await.expect("alpha");
    bridge.chat_turn(&beta, "b1", &ctx).await.expect("beta");

    let calls = tool_calls(&log);
    assert_eq!(calls[1]["params"]["name"], "codex", "beta starts its own conversation");
    assert_eq!(calls[0]["pid"], calls[1]["pid"]);

    bridge.shutdown().await;
}

// ── Streaming ────────────────────────────────────────────────────────────────

/// Deltas arrive in order, reasoning is surfaced, and nothing is posted twice.
#[tokio::test]
async fn streamed_reply_reaches_observer_in_order() {
    let channel = mock_channel(
        "C1",
        &[("MOCK_AGENT_STREAM", "3"), ("MOCK_AGENT_REPLY", "Hello")],
    );
    let observer = Arc::new(RecordingObserver::streaming());
    let bridge = McpBridge::new(test_codex_config(10), observer.clone());

    let messages = bridge
        .chat_turn(&channel, "greet", &TurnContext::default())
        .await
        .expect("streamed turn");
    assert!(messages.is_empty(), "streamed replies are not returned again");

    let events = observer.events();
    let deltas: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            Observed::Delta(owner, d) => Some((owner.as_str(), d.as_str())),
            _ => None,
        })
        .collect();
    assert_eq!(deltas, vec![("C1", "Hel"), ("C1", "lo")]);

    let done_at = events
        .iter()
        .position(|e| *e == Observed::Done("C1".into(), "Hello".into()))
        .expect("final message delivered");
    let last_delta_at = events
        .iter()
        .rposition(|e| matches!(e, Observed::Delta(..)))
        .expect("deltas delivered");
    assert!(last_delta_at < done_at);

    assert!(events.contains(&Observed::Reasoning("C1".into(), "Looking".into())));
    assert!(events.contains(&Observed::Reasoning("C1".into(), "Looking around".into())));
    assert!(events.contains(&Observed::ReasoningEnd("C1".into())));
    assert!(
        !events
            .iter()
            .any(|e| matches!(e, Observed::Delta(_, d) if d == "stray")),
        "events for unknown requests must be dropped"
    );
    assert_eq!(events.first(), Some(&Observed::Up));

    bridge.shutdown().await;
}

/// Without a streaming observer the reply comes back as messages.
#[tokio::test]
async fn non_streaming_observer_gets_messages() {
    let channel = mock_channel(
        "C1",
        &[("MOCK_AGENT_STREAM", "2"), ("MOCK_AGENT_REPLY", "done")],
    );
    let observer = Arc::new(RecordingObserver::default());
    let bridge = McpBridge::new(test_codex_config(10), observer.clone());

    let messages = bridge
        .chat_turn(&channel, "go", &TurnContext::default())
        .await
        .expect("turn");
    assert_eq!(messages, vec!["done"]);
    assert!(observer
        .events()
        .iter()
        .any(|e| matches!(e, Observed::Delta(..))));

    bridge.shutdown().await;
}

// ── Protocol tolerance ───────────────────────────────────────────────────────

#[tokio::test]
async fn string_request_ids_are_correlated() {
    let channel = mock_channel(
        "C1",
        &[("MOCK_AGENT_STRING_IDS", "1"), ("MOCK_AGENT_STREAM", "4")],
    );
    let observer = Arc::new(RecordingObserver::default());
    let bridge = McpBridge::new(test_codex_config(10), observer.clone());

    let messages = bridge
        .chat_turn(&channel, "ids", &TurnContext::default())
        .await
        .expect("turn with string ids");
    assert_eq!(messages, vec!["ack: ids"]);
    assert!(observer
        .events()
        .iter()
        .any(|e| matches!(e, Observed::Done(owner, _) if owner == "C1")));

    bridge.shutdown().await;
}

/// An agent that never answers `initialize` is still usable.
#[tokio::test]
async fn unanswered_initialize_is_tolerated() {
    let channel = mock_channel("C1", &[("MOCK_AGENT_SKIP_INITIALIZE", "1")]);
    let bridge = quiet_bridge(10);

    let messages = bridge
        .chat_turn(&channel, "hello", &TurnContext::default())
        .await
        .expect("turn after silent initialize");
    assert_eq!(messages, vec!["ack: hello"]);

    bridge.shutdown().await;
}

#[tokio::test]
async fn agent_error_is_a_protocol_error() {
    let channel = mock_channel("C1", &[("MOCK_AGENT_FAIL_TOOL", "codex")]);
    let bridge = quiet_bridge(10);

    let err = bridge
        .chat_turn(&channel, "fail please", &TurnContext::default())
        .await
        .expect_err("tool error expected");

    assert!(
        matches!(err, AppError::Protocol(ref m) if m.contains("tool failed") && m.contains("-32000")),
        "got {err:?}"
    );
    assert_eq!(bridge.conversation_id("C1").await, None);
    assert!(bridge.is_running().await, "a protocol error keeps the process");

    bridge.shutdown().await;
}

// ── Timeouts and cancellation ────────────────────────────────────────────────

#[tokio::test]
async fn slow_agent_times_out() {
    let channel = mock_channel("C1", &[("MOCK_AGENT_DELAY_MS", "2500")]);
    let bridge = quiet_bridge(1);
    let started = Instant::now();

    let err = bridge
        .chat_turn(&channel, "slow", &TurnContext::default())
        .await
        .expect_err("timeout expected");

    assert!(matches!(err, AppError::Timeout(_)), "got {err:?}");
    assert!(started.elapsed() < Duration::from_millis(2500));

    bridge.shutdown().await;
}

/// Cancelling a turn abandons the wait but keeps the agent.
#[tokio::test]
async fn cancelled_turn_keeps_the_process() {
    let channel = mock_channel("C1", &[("MOCK_AGENT_DELAY_MS", "1500")]);
    let bridge = quiet_bridge(10);
    bridge.ensure_started(&channel).await.expect("start agent");

    let ctx = TurnContext {
        user_tag: None,
        cancel: CancellationToken::new(),
    };
    let trigger = ctx.cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.cancel();
    });

    let err = bridge
        .chat_turn(&channel, "never mind", &ctx)
        .await
        .expect_err("cancelled");

    assert!(matches!(err, AppError::Cancelled), "got {err:?}");
    assert!(bridge.is_running().await);

    bridge.shutdown().await;
}

// ── Recovery ─────────────────────────────────────────────────────────────────

/// First start closes its input and idles; later starts run the mock.
fn failing_first_start(dir: &std::path::Path, starts: &std::path::Path) -> ChannelConfig {
    let marker = dir.join("first-start");
    let script = agent_script(
        dir,
        "flaky-agent",
        &format!(
            "echo start >> '{starts}'\n\
             if [ -e '{marker}' ]; then {mock}; fi\n\
             touch '{marker}'\n\
             exec 0<&-\n\
             sleep 30",
            starts = starts.display(),
            marker = marker.display(),
            mock = mock_command(""),
        ),
    );
    script_channel("C1", &script)
}

/// A write that fails triggers one restart and one retry.
#[tokio::test]
async fn write_failure_restarts_once_and_retries() {
    let dir = tempfile::tempdir().expect("tempdir");
    let starts = dir.path().join("starts.log");
    let channel = failing_first_start(dir.path(), &starts);
    let bridge = quiet_bridge(10);

    let messages = bridge
        .chat_turn(&channel, "retry me", &TurnContext::default())
        .await
        .expect("retry succeeds on the fresh process");

    assert_eq!(messages, vec!["ack: retry me"]);
    assert_eq!(line_count(&starts), 2);

    bridge.shutdown().await;
}

/// When the retry also cannot write, the failure is surfaced.
#[tokio::test]
async fn second_write_failure_is_surfaced() {
    let dir = tempfile::tempdir().expect("tempdir");
    let starts = dir.path().join("starts.log");
    let script = agent_script(
        dir.path(),
        "deaf-agent",
        &format!("echo start >> '{}'\nexec 0<&-\nsleep 30", starts.display()),
    );
    let channel = script_channel("C1", &script);
    let bridge = quiet_bridge(10);

    let err = bridge
        .chat_turn(&channel, "doomed", &TurnContext::default())
        .await
        .expect_err("write failure expected");

    assert!(err.is_write_failure(), "got {err:?}");
    assert_eq!(line_count(&starts), 2, "exactly one restart");

    bridge.shutdown().await;
}

/// An agent that closes its output is torn down and replaced on the spot.
#[tokio::test]
async fn closed_agent_output_forces_a_restart() {
    let dir = tempfile::tempdir().expect("tempdir");
    let starts = dir.path().join("starts.log");
    let marker = dir.path().join("first-start");
    let script = agent_script(
        dir.path(),
        "mute-agent",
        &format!(
            "echo start >> '{starts}'\n\
             if [ -e '{marker}' ]; then {mock}; fi\n\
             touch '{marker}'\n\
             exec 1>&-\n\
             sleep 30",
            starts = starts.display(),
            marker = marker.display(),
            mock = mock_command(""),
        ),
    );
    let channel = script_channel("C1", &script);
    let bridge = quiet_bridge(10);

    let messages = tokio::time::timeout(
        Duration::from_secs(8),
        bridge.chat_turn(&channel, "hello", &TurnContext::default()),
    )
    .await
    .expect("turn must not wait for the request timeout")
    .expect("turn succeeds on the replacement");

    assert_eq!(messages, vec!["ack: hello"]);
    assert_eq!(line_count(&starts), 2);

    bridge.shutdown().await;
}

/// Lines of invalid UTF-8 on stdout are skipped; the session survives.
#[tokio::test]
async fn garbage_output_is_skipped() {
    let dir = tempfile::tempdir().expect("tempdir");
    let log = dir.path().join("calls.jsonl");
    let channel = mock_channel(
        "C1",
        &[
            ("MOCK_AGENT_GARBAGE", "1"),
            ("MOCK_AGENT_CALL_LOG", log.to_str().unwrap()),
        ],
    );
    let bridge = quiet_bridge(10);
    let ctx = TurnContext::default();

    assert_eq!(
        bridge.chat_turn(&channel, "one", &ctx).await.expect("turn one"),
        vec!["ack: one"]
    );
    assert_eq!(
        bridge.chat_turn(&channel, "two", &ctx).await.expect("turn two"),
        vec!["ack: two"]
    );

    let calls = tool_calls(&log);
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0]["pid"], calls[1]["pid"], "no restart");

    bridge.shutdown().await;
}

// ── Concurrency ──────────────────────────────────────────────────────────────

/// Turns racing on a cold bridge share a single process start.
#[tokio::test]
async fn concurrent_turns_share_one_start() {
    let dir = tempfile::tempdir().expect("tempdir");
    let log = dir.path().join("calls.jsonl");
    let env = [("MOCK_AGENT_CALL_LOG", log.to_str().unwrap())];
    let (c1, c2, c3) = (
        mock_channel("C1", &env),
        mock_channel("C2", &env),
        mock_channel("C3", &env),
    );
    let bridge = quiet_bridge(10);
    let ctx = TurnContext::default();

    let (a, b, c) = tokio::join!(
        bridge.chat_turn(&c1, "one", &ctx),
        bridge.chat_turn(&c2, "two", &ctx),
        bridge.chat_turn(&c3, "three", &ctx),
    );

    assert_eq!(a.expect("one"), vec!["ack: one"]);
    assert_eq!(b.expect("two"), vec!["ack: two"]);
    assert_eq!(c.expect("three"), vec!["ack: three"]);

    let entries = read_call_log(&log);
    let initializes = entries
        .iter()
        .filter(|entry| entry["method"] == "initialize")
        .count();
    assert_eq!(initializes, 1, "one process for all callers");
    let calls = tool_calls(&log);
    assert_eq!(calls.len(), 3);
    assert!(calls.iter().all(|call| call["pid"] == calls[0]["pid"]));

    bridge.shutdown().await;
}

/// Callers that all hit the same broken process trigger one restart.
#[tokio::test]
async fn concurrent_write_failures_restart_once() {
    let dir = tempfile::tempdir().expect("tempdir");
    let starts = dir.path().join("starts.log");
    let first = failing_first_start(dir.path(), &starts);
    let second = ChannelConfig {
        channel_id: "C2".into(),
        ..first.clone()
    };
    let third = ChannelConfig {
        channel_id: "C3".into(),
        ..first.clone()
    };
    let bridge = quiet_bridge(10);
    let ctx = TurnContext::default();

    let (a, b, c) = tokio::join!(
        bridge.chat_turn(&first, "one", &ctx),
        bridge.chat_turn(&second, "two", &ctx),
        bridge.chat_turn(&third, "three", &ctx),
    );

    assert_eq!(a.expect("one"), vec!["ack: one"]);
    assert_eq!(b.expect("two"), vec!["ack: two"]);
    assert_eq!(c.expect("three"), vec!["ack: three"]);
    assert_eq!(line_count(&starts), 2, "one restart shared by every caller");

    bridge.shutdown().await;
}

/// An agent that exits between turns is replaced on the next turn.
#[tokio::test]
async fn exited_agent_is_restarted_on_next_turn() {
    let dir = tempfile::tempdir().expect("tempdir");
    let log = dir.path().join("calls.jsonl");
    let channel = mock_channel(
        "C1",
        &[
            ("MOCK_AGENT_EXIT_AFTER_CALLS", "1"),
            ("MOCK_AGENT_CALL_LOG", log.to_str().unwrap()),
        ],
    );
    let observer = Arc::new(RecordingObserver::default());
    let bridge = McpBridge::new(test_codex_config(10), observer.clone());
    let ctx = TurnContext::default();

    bridge.chat_turn(&channel, "one", &ctx).await.expect("turn one");
    let b = bridge.clone();
    assert!(
        wait_until(Duration::from_secs(3), || {
            let b = b.clone();
            async move { !b.is_running().await }
        })
        .await,
        "agent exit must be noticed"
    );
    assert!(observer.events().contains(&Observed::Down));

    let messages = bridge.chat_turn(&channel, "two", &ctx).await.expect("turn two");
    assert_eq!(messages, vec!["ack: two"]);

    let calls = tool_calls(&log);
    assert_eq!(calls[1]["params"]["name"], "codex-reply", "binding survives restarts");
    assert_ne!(calls[0]["pid"], calls[1]["pid"]);

    bridge.shutdown().await;
}

// ── Shutdown ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn idle_agent_is_shut_down() {
    let dir = tempfile::tempdir().expect("tempdir");
    let log = dir.path().join("calls.jsonl");
    let channel = mock_channel("C1", &[("MOCK_AGENT_CALL_LOG", log.to_str().unwrap())]);
    let mut config = test_codex_config(10);
    config.idle_seconds = 1;
    let observer = Arc::new(RecordingObserver::default());
    let bridge = McpBridge::new(config, observer.clone());

    bridge
        .chat_turn(&channel, "then rest", &TurnContext::default())
        .await
        .expect("turn");
    assert!(bridge.is_running().await);

    let b = bridge.clone();
    assert!(
        wait_until(Duration::from_secs(5), || {
            let b = b.clone();
            async move { !b.is_running().await }
        })
        .await,
        "idle agent must be closed"
    );
    assert!(read_call_log(&log).iter().any(|e| e["method"] == "shutdown"));
    assert!(observer.events().contains(&Observed::Down));

    let messages = bridge
        .chat_turn(&channel, "wake up", &TurnContext::default())
        .await
        .expect("turn after idle shutdown");
    assert_eq!(messages, vec!["ack: wake up"]);

    bridge.shutdown().await;
}

#[tokio::test]
async fn graceful_close_sends_shutdown_then_exit() {
    let dir = tempfile::tempdir().expect("tempdir");
    let log = dir.path().join("calls.jsonl");
    let channel = mock_channel("C1", &[("MOCK_AGENT_CALL_LOG", log.to_str().unwrap())]);
    let bridge = quiet_bridge(10);

    bridge.ensure_started(&channel).await.expect("start");
    bridge.shutdown().await;

    assert!(!bridge.is_running().await);
    let methods: Vec<String> = read_call_log(&log)
        .iter()
        .map(|e| e["method"].as_str().unwrap_or_default().to_owned())
        .collect();
    let shutdown_at = methods.iter().position(|m| m == "shutdown").expect("shutdown sent");
    let exit_at = methods.iter().position(|m| m == "exit").expect("exit sent");
    assert!(shutdown_at < exit_at);
}

/// An agent ignoring the shutdown protocol is killed.
#[tokio::test]
async fn stubborn_agent_is_killed() {
    let channel = mock_channel("C1", &[("MOCK_AGENT_IGNORE_SHUTDOWN", "1")]);
    let bridge = quiet_bridge(10);
    bridge.ensure_started(&channel).await.expect("start");

    let started = Instant::now();
    bridge.shutdown().await;

    assert!(!bridge.is_running().await);
    assert!(started.elapsed() < Duration::from_secs(5), "close must be bounded");
}

#[tokio::test]
async fn close_without_process_is_a_no_op() {
    let bridge = quiet_bridge(10);
    bridge.shutdown().await;
    bridge.shutdown().await;
    assert!(!bridge.is_running().await);
}
