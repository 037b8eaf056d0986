//! End-to-end tests for the session-log tail transport.
//!
//! The mock agent runs in `tail` mode: it creates a rollout log under the
//! configured session root and appends an `agent_message` line for every
//! prompt it reads.

use std::path::Path;
use std::time::Duration;

use nix::sys::signal::kill;
use nix::unistd::Pid;

use discodex::config::{ChannelConfig, CodexConfig, Transport};
use discodex::runner::{ChatRunner, TurnContext};
use discodex::tail::TailBridge;
use discodex::AppError;

use super::test_helpers::{agent_script, mock_command, read_call_log, script_channel, wait_until};

fn tail_config(root: &Path) -> CodexConfig {
    CodexConfig {
        transport: Transport::Tail,
        session_root: root.to_string_lossy().into_owned(),
        timeout_seconds: 10,
        ..CodexConfig::default()
    }
}

fn tail_channel(channel_id: &str, root: &Path, env: &[(&str, &str)]) -> ChannelConfig {
    let mut channel = ChannelConfig {
        command: mock_command("tail"),
        ..ChannelConfig::ad_hoc(channel_id)
    };
    channel.env.insert(
        "MOCK_AGENT_SESSION_ROOT".into(),
        root.to_string_lossy().into_owned(),
    );
    for (k, v) in env {
        channel.env.insert((*k).to_owned(), (*v).to_owned());
    }
    channel
}

#[tokio::test]
async fn replies_are_read_from_the_session_log() {
    let root = tempfile::tempdir().expect("tempdir");
    let bridge = TailBridge::new(tail_config(root.path()));
    let channel = tail_channel("C1", root.path(), &[]);
    let ctx = TurnContext::default();

    let first = bridge.chat(&channel, "ping", &ctx).await.expect("first turn");
    assert_eq!(first, "ack: ping");

    let second = bridge.chat(&channel, "pong", &ctx).await.expect("second turn");
    assert_eq!(second, "ack: pong");
    assert_eq!(bridge.session_count().await, 1, "one process per channel");

    let session = bridge.ensure(&channel).await.expect("existing session");
    assert!(session.log_path().starts_with(root.path()));

    bridge.close_all().await;
    assert_eq!(bridge.session_count().await, 0);
}

/// Each channel gets its own agent and its own log.
#[tokio::test]
async fn channels_get_separate_sessions() {
    let root = tempfile::tempdir().expect("tempdir");
    let bridge = TailBridge::new(tail_config(root.path()));
    let alpha = tail_channel("C-alpha", root.path(), &[("MOCK_AGENT_REPLY", "from alpha")]);
    let beta = tail_channel("C-beta", root.path(), &[("MOCK_AGENT_REPLY", "from beta")]);
    let ctx = TurnContext::default();

    assert_eq!(bridge.chat(&alpha, "hi", &ctx).await.expect("alpha"), "from alpha");
    assert_eq!(bridge.chat(&beta, "hi", &ctx).await.expect("beta"), "from beta");

    let alpha_log = bridge.ensure(&alpha).await.expect("alpha").log_path().to_path_buf();
    let beta_log = bridge.ensure(&beta).await.expect("beta").log_path().to_path_buf();
    assert_ne!(alpha_log, beta_log);

    bridge.close_all().await;
}

/// Resetting a channel ends its agent; the next turn starts a new one.
#[tokio::test]
async fn reset_ends_the_session() {
    let root = tempfile::tempdir().expect("tempdir");
    let bridge = TailBridge::new(tail_config(root.path()));
    let channel = tail_channel("C1", root.path(), &[]);
    let ctx = TurnContext::default();

    bridge.chat(&channel, "one", &ctx).await.expect("turn one");
    let first_log = bridge.ensure(&channel).await.expect("session").log_path().to_path_buf();

    ChatRunner::reset(&bridge, "C1").await;
    assert_eq!(bridge.session_count().await, 0);

    let reply = bridge.chat(&channel, "two", &ctx).await.expect("turn two");
    assert_eq!(reply, "ack: two");
    let second_log = bridge.ensure(&channel).await.expect("session").log_path().to_path_buf();
    assert_ne!(first_log, second_log);

    ChatRunner::close(&bridge).await;
}

// ── Start failures ───────────────────────────────────────────────────────────

/// An agent whose log never appears under the root is killed.
#[tokio::test]
async fn undiscovered_session_kills_the_agent() {
    let root = tempfile::tempdir().expect("tempdir");
    let elsewhere = tempfile::tempdir().expect("tempdir");
    let calls = elsewhere.path().join("calls.jsonl");
    let bridge = TailBridge::new(tail_config(root.path()))
        .with_discovery_timeout(Duration::from_secs(1));
    let channel = tail_channel(
        "C1",
        elsewhere.path(),
        &[("MOCK_AGENT_CALL_LOG", calls.to_str().unwrap())],
    );

    let err = bridge.ensure(&channel).await.expect_err("discovery must fail");

    assert!(matches!(err, AppError::Discovery(_)), "got {err:?}");
    assert_eq!(bridge.session_count().await, 0);

    let started = read_call_log(&calls);
    let pid = i32::try_from(started[0]["pid"].as_u64().expect("pid")).expect("pid fits");
    assert!(
        wait_until(Duration::from_secs(3), || async move {
            kill(Pid::from_raw(pid), None).is_err()
        })
        .await,
        "agent {pid} must be gone"
    );
}

/// Output of an agent that dies at once is carried in the error.
#[tokio::test]
async fn early_exit_output_is_reported() {
    let root = tempfile::tempdir().expect("tempdir");
    let script = agent_script(
        root.path(),
        "broken-agent",
        "echo 'boot failed: no credentials'\necho 'fatal' >&2\nexit 3",
    );
    let bridge = TailBridge::new(tail_config(root.path()))
        .with_discovery_timeout(Duration::from_millis(1500));
    let channel = script_channel("C1", &script);

    let err = bridge
        .chat(&channel, "hello", &TurnContext::default())
        .await
        .expect_err("start must fail");

    let message = match err {
        AppError::Discovery(message) => message,
        other => panic!("expected a discovery error, got {other:?}"),
    };
    assert!(message.contains("boot failed: no credentials"), "{message}");
    assert!(message.contains("fatal"), "{message}");
    assert_eq!(bridge.session_count().await, 0);
}
