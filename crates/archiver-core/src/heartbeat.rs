//! Ack-gated liveness probes.
//!
//! A [`HeartbeatMonitor`] keeps at most one probe outstanding per peer. The
//! next probe is scheduled one interval after the previous one was answered;
//! an unanswered probe escalates through the [`FaultSink`] and ends the loop.

use crate::broker::Broker;
use crate::fault::{Fault, FaultCode, FaultSink};
use crate::message::{field, AckIds, Message, MessageKind};
use crate::waiter::{AckTracker, TrackerStatus};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// The session id health checks are stamped with. The director updates it as
/// exposures arrive; each check reads it when it goes out.
pub type SessionCell = Arc<RwLock<Option<String>>>;

#[derive(Debug, Clone)]
pub struct HeartbeatSpec {
    /// Peer name used in logs and fault reports.
    pub peer: String,
    /// The peer's inbound queue.
    pub queue: String,
    pub probe: MessageKind,
    pub interval: Duration,
    pub fault_code: FaultCode,
    pub reply_queue: String,
    pub session: SessionCell,
}

// ---------------------------------------------------------------------------
// HeartbeatSlot
// ---------------------------------------------------------------------------

struct Outstanding {
    ack_id: String,
    tracker: Arc<AckTracker>,
}

/// The rendezvous between a heartbeat loop and the dispatcher delivering its
/// acks.
#[derive(Default)]
pub struct HeartbeatSlot {
    outstanding: Mutex<Option<Outstanding>>,
    probes: AtomicU64,
}

impl HeartbeatSlot {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Option<Outstanding>> {
        self.outstanding
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn install(&self, ack_id: String, tracker: Arc<AckTracker>) {
        *self.lock() = Some(Outstanding { ack_id, tracker });
    }

    fn clear(&self) {
        self.lock().take();
    }

    /// Settle the outstanding probe. An ack carrying a different `ACK_ID`
    /// belongs to an older probe and is ignored. Returns `false` for late,
    /// stale and duplicate acks.
    pub fn acknowledge(&self, ack_id: Option<&str>) -> bool {
        let mut slot = self.lock();
        match (slot.as_ref(), ack_id) {
            (None, _) => return false,
            (Some(current), Some(id)) if current.ack_id != id => return false,
            _ => {}
        }
        slot.take().map(|o| o.tracker.disarm()).unwrap_or(false)
    }

    pub fn probes_sent(&self) -> u64 {
        self.probes.load(Ordering::SeqCst)
    }

    pub fn is_awaiting_ack(&self) -> bool {
        self.lock().is_some()
    }
}

impl std::fmt::Debug for HeartbeatSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeartbeatSlot")
            .field("probes", &self.probes_sent())
            .field("awaiting_ack", &self.is_awaiting_ack())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// HeartbeatMonitor
// ---------------------------------------------------------------------------

pub struct HeartbeatMonitor {
    peer: String,
    slot: Arc<HeartbeatSlot>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl HeartbeatMonitor {
    pub fn start(
        spec: HeartbeatSpec,
        slot: Arc<HeartbeatSlot>,
        broker: Arc<dyn Broker>,
        ack_ids: Arc<AckIds>,
        sink: FaultSink,
    ) -> Self {
        let cancel = CancellationToken::new();
        let peer = spec.peer.clone();
        tracing::info!(peer = %spec.peer, queue = %spec.queue, interval_ms = spec.interval.as_millis() as u64, "starting heartbeat");
        let task = tokio::spawn(run(
            spec,
            Arc::clone(&slot),
            broker,
            ack_ids,
            sink,
            cancel.clone(),
        ));
        Self {
            peer,
            slot,
            cancel,
            task: Some(task),
        }
    }

    pub fn slot(&self) -> &Arc<HeartbeatSlot> {
        &self.slot
    }

    pub fn probes_sent(&self) -> u64 {
        self.slot.probes_sent()
    }

    /// `false` once the loop has ended, whether by timeout or by stop.
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Cancel the loop and wait for it to exit. Never escalates.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    tracing::warn!(peer = %self.peer, error = %e, "heartbeat task panicked");
                }
            }
        }
        tracing::debug!(peer = %self.peer, "heartbeat stopped");
    }
}

impl Drop for HeartbeatMonitor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for HeartbeatMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeartbeatMonitor")
            .field("peer", &self.peer)
            .field("running", &self.is_running())
            .field("slot", &self.slot)
            .finish()
    }
}

async fn run(
    spec: HeartbeatSpec,
    slot: Arc<HeartbeatSlot>,
    broker: Arc<dyn Broker>,
    ack_ids: Arc<AckIds>,
    sink: FaultSink,
    cancel: CancellationToken,
) {
    loop {
        let ack_id = ack_ids.next(spec.probe);
        let mut probe = Message::new(spec.probe)
            .with(field::ACK_ID, ack_id.as_str())
            .with(field::REPLY_QUEUE, spec.reply_queue.as_str());
        let session = spec
            .session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(session) = session {
            probe = probe.with(field::SESSION_ID, session);
        }

        // Installed before publishing so an immediate ack finds it.
        let fault = Fault::new(
            spec.fault_code,
            format!("no {} ack from {}", spec.probe, spec.peer),
        );
        let tracker = Arc::new(AckTracker::arm(spec.interval, fault, {
            let sink = sink.clone();
            move |fault| sink.raise(fault)
        }));
        slot.install(ack_id.clone(), Arc::clone(&tracker));

        let published = tokio::select! {
            _ = cancel.cancelled() => {
                tracker.cancel();
                slot.clear();
                return;
            }
            r = broker.publish(&spec.queue, probe) => r,
        };
        if let Err(e) = published {
            tracker.cancel();
            slot.clear();
            tracing::error!(peer = %spec.peer, error = %e, "heartbeat probe could not be published");
            sink.raise(Fault::new(FaultCode::PublishFailure, e.to_string()));
            return;
        }
        slot.probes.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(peer = %spec.peer, ack_id = %ack_id, "heartbeat probe sent");

        let outcome = tokio::select! {
            _ = cancel.cancelled() => {
                tracker.cancel();
                slot.clear();
                return;
            }
            s = tracker.settled() => s,
        };
        match outcome {
            TrackerStatus::Acknowledged => {}
            TrackerStatus::TimedOut => {
                slot.clear();
                tracing::warn!(peer = %spec.peer, code = spec.fault_code.code(), "heartbeat ack missed");
                return;
            }
            TrackerStatus::Cancelled | TrackerStatus::Armed => return,
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(spec.interval) => {}
        }
    }
}
