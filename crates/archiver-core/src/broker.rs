//! Message broker boundary.
//!
//! The director only needs two operations: publish a [`Message`] to a named
//! queue, and consume a queue as a stream of [`Delivery`] values that must be
//! acknowledged explicitly. [`MemoryBroker`] implements both in-process with
//! per-queue FIFO order and redelivery of unacknowledged messages when a
//! consumer goes away.

use crate::error::{ArchiverError, Result};
use crate::message::Message;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

#[async_trait]
pub trait Broker: Send + Sync + 'static {
    async fn publish(&self, queue: &str, message: Message) -> Result<()>;

    async fn consume(&self, queue: &str) -> Result<Consumer>;
}

// ---------------------------------------------------------------------------
// Delivery / Consumer
// ---------------------------------------------------------------------------

/// Settles a delivery with the broker.
pub trait Acknowledger: Send + Sync {
    fn ack(&self, tag: u64);
}

/// One message handed to a consumer. Call [`Delivery::ack`] once it has been
/// received; otherwise the broker redelivers it to the next consumer.
pub struct Delivery {
    pub message: Message,
    tag: u64,
    acker: Arc<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(message: Message, tag: u64, acker: Arc<dyn Acknowledger>) -> Self {
        Self {
            message,
            tag,
            acker,
        }
    }

    pub fn tag(&self) -> u64 {
        self.tag
    }

    /// Acknowledge receipt and take the message.
    pub fn ack(self) -> Message {
        self.acker.ack(self.tag);
        self.message
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("tag", &self.tag)
            .field("message", &self.message)
            .finish()
    }
}

type CloseHook = Box<dyn FnOnce() + Send>;

/// Subscription to a single queue. Dropping it stops consumption.
pub struct Consumer {
    queue: String,
    rx: mpsc::UnboundedReceiver<Delivery>,
    on_close: Option<CloseHook>,
}

impl Consumer {
    pub fn new(
        queue: impl Into<String>,
        rx: mpsc::UnboundedReceiver<Delivery>,
        on_close: Option<CloseHook>,
    ) -> Self {
        Self {
            queue: queue.into(),
            rx,
            on_close,
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub async fn next(&mut self) -> Option<Delivery> {
        self.rx.recv().await
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        self.rx.close();
        if let Some(hook) = self.on_close.take() {
            hook();
        }
    }
}

// ---------------------------------------------------------------------------
// MemoryBroker
// ---------------------------------------------------------------------------

#[derive(Default)]
struct QueueState {
    ready: VecDeque<Message>,
    consumer: Option<(u64, mpsc::UnboundedSender<Delivery>)>,
    unacked: BTreeMap<u64, Message>,
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, QueueState>,
    history: VecDeque<(String, Message)>,
    history_limit: usize,
    unreachable: bool,
    next_tag: u64,
    next_consumer: u64,
}

/// Publishes a [`MemoryBroker`] remembers when no limit is given.
pub const DEFAULT_HISTORY_LIMIT: usize = 10_000;

/// In-process broker. Cheap to clone; clones share the same queues.
///
/// Every publish is also recorded in a bounded history, oldest entries
/// evicted first, for inspection by tests and the simulator.
#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

struct MemoryAcker {
    queue: String,
    state: Arc<Mutex<BrokerState>>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl Acknowledger for MemoryAcker {
    fn ack(&self, tag: u64) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(q) = state.queues.get_mut(&self.queue) {
            q.unacked.remove(&tag);
        }
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::with_history_limit(DEFAULT_HISTORY_LIMIT)
    }

    pub fn with_history_limit(history_limit: usize) -> Self {
        let state = BrokerState {
            history_limit,
            ..BrokerState::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make every subsequent publish/consume fail, simulating a lost broker.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.lock().unreachable = unreachable;
    }

    /// Messages published to `queue` that are still in the history, in
    /// publish order.
    pub fn published(&self, queue: &str) -> Vec<Message> {
        self.lock()
            .history
            .iter()
            .filter(|(q, _)| q == queue)
            .map(|(_, m)| m.clone())
            .collect()
    }

    /// Retained publishes across all queues as `(queue, message)` pairs.
    pub fn history(&self) -> Vec<(String, Message)> {
        self.lock().history.iter().cloned().collect()
    }

    /// Messages sitting in `queue` that nobody has acknowledged yet.
    pub fn outstanding(&self, queue: &str) -> usize {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.ready.len() + q.unacked.len())
            .unwrap_or(0)
    }

    pub fn has_consumer(&self, queue: &str) -> bool {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.consumer.is_some())
            .unwrap_or(false)
    }

    fn acker(&self, queue: &str) -> Arc<dyn Acknowledger> {
        Arc::new(MemoryAcker {
            queue: queue.to_string(),
            state: Arc::clone(&self.state),
        })
    }

    fn close_consumer(state: &Arc<Mutex<BrokerState>>, queue: &str, id: u64) {
        let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(q) = state.queues.get_mut(queue) else {
            return;
        };
        if !matches!(q.consumer, Some((current, _)) if current == id) {
            return;
        }
        q.consumer = None;
        // Unacked deliveries go back to the head of the queue, oldest first.
        let unacked = std::mem::take(&mut q.unacked);
        for (_, msg) in unacked.into_iter().rev() {
            q.ready.push_front(msg);
        }
    }
}

/// Hand queued messages to the consumer, if there is one still listening.
fn drain(state: &mut BrokerState, queue: &str, acker: &Arc<dyn Acknowledger>) {
    let BrokerState {
        queues, next_tag, ..
    } = state;
    let Some(q) = queues.get_mut(queue) else {
        return;
    };
    while let Some(msg) = q.ready.pop_front() {
        let Some((_, tx)) = &q.consumer else {
            q.ready.push_front(msg);
            return;
        };
        *next_tag += 1;
        let tag = *next_tag;
        q.unacked.insert(tag, msg.clone());
        if tx.send(Delivery::new(msg, tag, Arc::clone(acker))).is_err() {
            // Receiver is gone but the close hook has not run yet.
            if let Some(msg) = q.unacked.remove(&tag) {
                q.ready.push_front(msg);
            }
            q.consumer = None;
            return;
        }
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, queue: &str, message: Message) -> Result<()> {
        let acker = self.acker(queue);
        let mut state = self.lock();
        if state.unreachable {
            return Err(ArchiverError::PublishFailure {
                queue: queue.to_string(),
                reason: "broker unreachable".to_string(),
            });
        }
        if state.history_limit > 0 {
            if state.history.len() == state.history_limit {
                state.history.pop_front();
            }
            state.history.push_back((queue.to_string(), message.clone()));
        }
        state
            .queues
            .entry(queue.to_string())
            .or_default()
            .ready
            .push_back(message);
        drain(&mut state, queue, &acker);
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<Consumer> {
        let acker = self.acker(queue);
        let (tx, rx) = mpsc::unbounded_channel();
        let id = {
            let mut state = self.lock();
            if state.unreachable {
                return Err(ArchiverError::PublishFailure {
                    queue: queue.to_string(),
                    reason: "broker unreachable".to_string(),
                });
            }
            state.next_consumer += 1;
            let id = state.next_consumer;
            let q = state.queues.entry(queue.to_string()).or_default();
            // A new consumer replaces the old one; whatever the old one had
            // not acknowledged is redelivered.
            let unacked = std::mem::take(&mut q.unacked);
            for (_, msg) in unacked.into_iter().rev() {
                q.ready.push_front(msg);
            }
            q.consumer = Some((id, tx));
            drain(&mut state, queue, &acker);
            id
        };

        let shared = Arc::clone(&self.state);
        let name = queue.to_string();
        let hook: CloseHook = Box::new(move || MemoryBroker::close_consumer(&shared, &name, id));
        Ok(Consumer::new(queue, rx, Some(hook)))
    }
}
