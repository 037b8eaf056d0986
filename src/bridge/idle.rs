//! Inactivity timer that shuts an idle agent down.
//!
//! Activity is published through a `watch` channel holding the latest
//! timestamp, so the deadline is always `latest activity + threshold` no
//! matter how often activity is recorded. When the deadline passes the
//! timer re-checks the elapsed time and, if still idle, sends an
//! [`IdleEvent`] to the consumer. It then stays quiet until fresh activity
//! arrives.

use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, Instrument};

/// Emitted when the agent has been idle for the full threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdleEvent {
    /// How long the agent had been idle when the event fired.
    pub idle_for: Duration,
}

/// Builder for the idle timer.
#[derive(Debug)]
pub struct IdleSupervisor {
    threshold: Duration,
    event_tx: mpsc::Sender<IdleEvent>,
}

impl IdleSupervisor {
    /// Construct a supervisor (does not start the timer yet).
    #[must_use]
    pub fn new(threshold: Duration, event_tx: mpsc::Sender<IdleEvent>) -> Self {
        Self {
            threshold,
            event_tx,
        }
    }

    /// Start the timer task. Activity is counted from now.
    #[must_use]
    pub fn spawn(self) -> IdleHandle {
        let (activity_tx, activity_rx) = watch::channel(Instant::now());
        let cancel = CancellationToken::new();

        let task = tokio::spawn(
            run(self.threshold, activity_rx, self.event_tx, cancel.clone())
                .instrument(info_span!("idle_supervisor")),
        );

        IdleHandle {
            activity: activity_tx,
            cancel,
            task: Some(task),
        }
    }
}

async fn run(
    threshold: Duration,
    mut activity: watch::Receiver<Instant>,
    event_tx: mpsc::Sender<IdleEvent>,
    cancel: CancellationToken,
) {
    loop {
        // ── Wait for the deadline or newer activity ──────
        let last = *activity.borrow_and_update();
        tokio::select! {
            () = cancel.cancelled() => return,
            changed = activity.changed() => {
                if changed.is_err() {
                    return;
                }
                continue;
            }
            () = tokio::time::sleep_until(last + threshold) => {}
        }

        let idle_for = activity.borrow().elapsed();
        if idle_for < threshold {
            continue;
        }

        info!(idle_secs = idle_for.as_secs(), "agent idle past threshold");
        if event_tx.send(IdleEvent { idle_for }).await.is_err() {
            debug!("idle consumer gone, stopping");
            return;
        }

        // ── Stay quiet until something happens ───────────
        tokio::select! {
            () = cancel.cancelled() => return,
            changed = activity.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }
    }
}

/// Handle to a running idle timer. Dropping it stops the timer.
#[derive(Debug)]
pub struct IdleHandle {
    activity: watch::Sender<Instant>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl IdleHandle {
    /// Record activity now.
    pub fn touch(&self) {
        self.activity.send_replace(Instant::now());
    }

    /// Time of the most recent activity.
    #[must_use]
    pub fn last_activity(&self) -> Instant {
        *self.activity.borrow()
    }

    /// Stop the timer and wait for its task to exit.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for IdleHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
