//! Ack tracker: the at-most-once timeout/escalation primitive.
//!
//! An [`AckTracker`] guards one outstanding request. It settles exactly once,
//! to one of [`TrackerStatus::Acknowledged`], [`TrackerStatus::TimedOut`] or
//! [`TrackerStatus::Cancelled`]. The escalation callback runs only for the
//! timed-out outcome. Settling goes through `watch::Sender::send_if_modified`,
//! which holds the channel lock while the closure runs, so a disarm racing the
//! deadline always has exactly one winner.

use crate::fault::Fault;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerStatus {
    Armed,
    Acknowledged,
    TimedOut,
    Cancelled,
}

pub struct AckTracker {
    status: Arc<watch::Sender<TrackerStatus>>,
    timer: JoinHandle<()>,
    deadline: Duration,
    fault: Fault,
}

impl AckTracker {
    /// Arm a tracker. If it is still armed when `deadline` elapses,
    /// `on_timeout` is invoked with `fault`, once.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn arm<F>(deadline: Duration, fault: Fault, on_timeout: F) -> Self
    where
        F: FnOnce(Fault) + Send + 'static,
    {
        let (tx, _) = watch::channel(TrackerStatus::Armed);
        let status = Arc::new(tx);
        let timer_status = Arc::clone(&status);
        let escalation = fault.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            if settle(&timer_status, TrackerStatus::TimedOut) {
                on_timeout(escalation);
            }
        });
        Self {
            status,
            timer,
            deadline,
            fault,
        }
    }

    /// Mark the expected ack as received.
    ///
    /// Returns `true` only for the call that settled the tracker; a second
    /// disarm, or a disarm after the deadline escalated, returns `false`.
    pub fn disarm(&self) -> bool {
        let won = settle(&self.status, TrackerStatus::Acknowledged);
        if won {
            self.timer.abort();
        }
        won
    }

    /// Settle without escalating. Used when connections are torn down.
    pub fn cancel(&self) -> bool {
        let won = settle(&self.status, TrackerStatus::Cancelled);
        if won {
            self.timer.abort();
        }
        won
    }

    pub fn status(&self) -> TrackerStatus {
        *self.status.borrow()
    }

    pub fn is_armed(&self) -> bool {
        self.status() == TrackerStatus::Armed
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    pub fn fault(&self) -> &Fault {
        &self.fault
    }

    /// Wait until the tracker settles and return how it settled.
    pub async fn settled(&self) -> TrackerStatus {
        let mut rx = self.status.subscribe();
        let outcome = match rx.wait_for(|s| *s != TrackerStatus::Armed).await {
            Ok(status) => *status,
            Err(_) => TrackerStatus::Cancelled,
        };
        outcome
    }
}

impl Drop for AckTracker {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl std::fmt::Debug for AckTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AckTracker")
            .field("status", &self.status())
            .field("deadline", &self.deadline)
            .field("fault", &self.fault)
            .finish()
    }
}

fn settle(status: &watch::Sender<TrackerStatus>, outcome: TrackerStatus) -> bool {
    status.send_if_modified(|current| {
        if *current == TrackerStatus::Armed {
            *current = outcome;
            true
        } else {
            false
        }
    })
}
