//! The director: handshake protocols, inbound dispatch and the connection
//! set (lease, consumers, heartbeats) that the supervisor starts and stops.

mod dispatch;
mod transaction;

pub use transaction::{Transaction, TransactionKind};

use crate::broker::{Broker, Consumer};
use crate::config::ArchiverConfig;
use crate::error::{ArchiverError, Result};
use crate::event::{FileObjectEvent, ImageEvent};
use crate::fault::{Fault, FaultCode, FaultSink, SupervisoryLayer};
use crate::heartbeat::{HeartbeatMonitor, HeartbeatSlot, HeartbeatSpec, SessionCell};
use crate::message::{field, AckIds, Message, MessageKind};
use crate::scoreboard::{LeaseRegistry, PeerDescriptor};
use crate::waiter::AckTracker;
use dispatch::Handler;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

type PendingMap = HashMap<(TransactionKind, u64), Transaction>;

/// One outbound request: what it is, which exposure it belongs to and where
/// it goes.
struct Request<'a> {
    kind: TransactionKind,
    job_num: u64,
    session_id: &'a str,
    image_id: &'a str,
    queue: &'a str,
}

/// Everything that only exists while connections are up and that message
/// handlers need: the leased forwarder, where faults go, and the heartbeat
/// slots acks are delivered to.
struct Link {
    generation: u64,
    forwarder: PeerDescriptor,
    sink: FaultSink,
    heartbeats: HashMap<MessageKind, Arc<HeartbeatSlot>>,
}

struct Connections {
    heartbeats: Vec<HeartbeatMonitor>,
    consumers: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
}

struct DirectorInner {
    config: ArchiverConfig,
    broker: Arc<dyn Broker>,
    registry: Arc<dyn LeaseRegistry>,
    supervisory: Arc<dyn SupervisoryLayer>,
    handlers: HashMap<MessageKind, Handler>,
    pending: Mutex<PendingMap>,
    link: RwLock<Option<Arc<Link>>>,
    connections: tokio::sync::Mutex<Option<Connections>>,
    ack_ids: Arc<AckIds>,
    session: SessionCell,
    starts: AtomicU64,
    stops: AtomicU64,
}

impl Drop for DirectorInner {
    fn drop(&mut self) {
        if let Some(conns) = self.connections.get_mut().take() {
            conns.cancel.cancel();
            for task in &conns.consumers {
                task.abort();
            }
        }
    }
}

/// Diagnostics snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct DirectorStats {
    pub connection_starts: u64,
    pub connection_stops: u64,
    pub in_flight: usize,
    pub running_heartbeats: usize,
    pub paired_forwarder: Option<String>,
}

/// Cheap to clone; clones share one director.
#[derive(Clone)]
pub struct Director {
    inner: Arc<DirectorInner>,
}

impl std::fmt::Debug for Director {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Director")
            .field("device", &self.inner.config.device)
            .field("in_flight", &self.in_flight())
            .field("paired_forwarder", &self.paired_forwarder())
            .finish()
    }
}

impl Director {
    pub fn new(
        config: ArchiverConfig,
        broker: Arc<dyn Broker>,
        registry: Arc<dyn LeaseRegistry>,
        supervisory: Arc<dyn SupervisoryLayer>,
    ) -> Self {
        Self {
            inner: Arc::new(DirectorInner {
                config,
                broker,
                registry,
                supervisory,
                handlers: dispatch::handler_table(),
                pending: Mutex::new(HashMap::new()),
                link: RwLock::new(None),
                connections: tokio::sync::Mutex::new(None),
                ack_ids: Arc::new(AckIds::new()),
                session: Arc::new(RwLock::new(None)),
                starts: AtomicU64::new(0),
                stops: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &ArchiverConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &Arc<dyn LeaseRegistry> {
        &self.inner.registry
    }

    pub fn supervisory(&self) -> &Arc<dyn SupervisoryLayer> {
        &self.inner.supervisory
    }

    fn pending(&self) -> MutexGuard<'_, PendingMap> {
        self.inner
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn current_link(&self) -> Option<Arc<Link>> {
        self.inner
            .link
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn link(&self) -> Result<Arc<Link>> {
        self.current_link().ok_or(ArchiverError::NotConnected)
    }

    fn set_link(&self, link: Option<Arc<Link>>) -> Option<Arc<Link>> {
        let mut slot = self
            .inner
            .link
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *slot, link)
    }

    // -----------------------------------------------------------------------
    // Diagnostics
    // -----------------------------------------------------------------------

    pub fn in_flight(&self) -> usize {
        self.pending().len()
    }

    pub fn is_pending(&self, kind: TransactionKind, job_num: u64) -> bool {
        self.pending().contains_key(&(kind, job_num))
    }

    pub fn paired_forwarder(&self) -> Option<PeerDescriptor> {
        self.current_link().map(|l| l.forwarder.clone())
    }

    /// Generation of the live connection set, if any.
    pub fn generation(&self) -> Option<u64> {
        self.current_link().map(|l| l.generation)
    }

    pub fn connection_starts(&self) -> u64 {
        self.inner.starts.load(Ordering::SeqCst)
    }

    pub fn connection_stops(&self) -> u64 {
        self.inner.stops.load(Ordering::SeqCst)
    }

    pub async fn running_heartbeats(&self) -> usize {
        self.inner
            .connections
            .lock()
            .await
            .as_ref()
            .map(|c| c.heartbeats.iter().filter(|h| h.is_running()).count())
            .unwrap_or(0)
    }

    pub async fn stats(&self) -> DirectorStats {
        DirectorStats {
            connection_starts: self.connection_starts(),
            connection_stops: self.connection_stops(),
            in_flight: self.in_flight(),
            running_heartbeats: self.running_heartbeats().await,
            paired_forwarder: self.paired_forwarder().map(|p| p.hostname),
        }
    }

    // -----------------------------------------------------------------------
    // Domain event entry points
    // -----------------------------------------------------------------------

    /// `startIntegration`: step 1 of the exposure handshake. The follow-up
    /// `XFER_PARAMS` is sent from the `NEW_ITEM_ACK` handler.
    pub async fn integration_start(&self, event: &ImageEvent) -> Result<()> {
        let link = self.link()?;
        self.record_job(event.job_num, &event.session_id).await;
        let msg = Message::new(MessageKind::NewItem)
            .with(field::JOB_NUM, event.job_num)
            .with(field::SESSION_ID, event.session_id.as_str())
            .with(field::IMAGE_ID, event.image_name.as_str());
        let request = Request {
            kind: TransactionKind::NewItem,
            job_num: event.job_num,
            session_id: &event.session_id,
            image_id: &event.image_name,
            queue: &self.inner.config.queues.archive_consume,
        };
        self.begin(&link, request, msg).await
    }

    pub async fn end_readout(&self, event: &ImageEvent) -> Result<()> {
        let link = self.link()?;
        let msg = Message::new(MessageKind::EndReadout)
            .with(field::JOB_NUM, event.job_num)
            .with(field::SESSION_ID, event.session_id.as_str())
            .with(field::IMAGE_ID, event.image_name.as_str())
            .with(field::IMAGE_SEQUENCE_NAME, event.image_sequence_name.as_str())
            .with(field::IMAGES_IN_SEQUENCE, event.images_in_sequence);
        let request = Request {
            kind: TransactionKind::ReadoutEnd,
            job_num: event.job_num,
            session_id: &event.session_id,
            image_id: &event.image_name,
            queue: &link.forwarder.consume_queue,
        };
        self.begin(&link, request, msg).await
    }

    pub async fn large_file_object_available(&self, event: &FileObjectEvent) -> Result<()> {
        let link = self.link()?;
        let msg = Message::new(MessageKind::HeaderReady)
            .with(field::FILENAME, event.url.as_str())
            .with(field::IMAGE_ID, event.id.as_str())
            .with(field::JOB_NUM, event.job_num)
            .with(field::SESSION_ID, event.session_id.as_str());
        let request = Request {
            kind: TransactionKind::ObjectAvailable,
            job_num: event.job_num,
            session_id: &event.session_id,
            image_id: &event.id,
            queue: &link.forwarder.consume_queue,
        };
        self.begin(&link, request, msg).await
    }

    async fn record_job(&self, job_num: u64, session_id: &str) {
        *self
            .inner
            .session
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(session_id.to_string());
        let registry = &self.inner.registry;
        if let Err(e) = registry.set_jobnum(job_num).await {
            tracing::warn!(job_num, error = %e, "could not record job number");
        }
        if let Err(e) = registry.set_session(session_id).await {
            tracing::warn!(session_id, error = %e, "could not record session");
        }
    }

    /// Arm a tracker for the request, register it, then publish.
    ///
    /// The tracker is registered before the publish so an ack that races the
    /// publish still finds it. If `link` was torn down in the meantime the
    /// request is withdrawn and `NotConnected` returned. A failed publish
    /// unregisters it and escalates with the publish-failure code.
    async fn begin(&self, link: &Link, request: Request<'_>, msg: Message) -> Result<()> {
        let Request {
            kind,
            job_num,
            session_id,
            image_id,
            queue,
        } = request;
        let ack_id = self.inner.ack_ids.next(kind.request());
        let msg = msg
            .with(field::ACK_ID, ack_id.as_str())
            .with(field::REPLY_QUEUE, self.inner.config.queues.reply.as_str());

        let timeout = self.inner.config.timing.ack_timeout();
        let report = ArchiverError::AckTimeout {
            kind: kind.ack().to_string(),
            job_num,
            timeout_ms: self.inner.config.timing.ack_timeout_ms,
        }
        .to_string();
        let tracker = AckTracker::arm(
            timeout,
            Fault::new(kind.fault_code(), report),
            self.escalation(kind, job_num, ack_id.clone(), link.sink.clone()),
        );
        let replaced = self.pending().insert(
            (kind, job_num),
            Transaction {
                kind,
                job_num,
                session_id: session_id.to_string(),
                image_id: image_id.to_string(),
                ack_id: ack_id.clone(),
                tracker,
            },
        );
        if replaced.is_some() {
            tracing::warn!(%kind, job_num, "replacing an outstanding transaction for the same job");
        }
        drop(replaced);

        // Teardown clears the link before it drains `pending`, so either it
        // sees this entry or this check sees the teardown.
        if self.generation() != Some(link.generation) {
            if let Some(txn) = self.withdraw(kind, job_num, &ack_id) {
                txn.tracker.cancel();
            }
            tracing::warn!(%kind, job_num, generation = link.generation, "connections stopped; request not sent");
            return Err(ArchiverError::NotConnected);
        }

        if let Err(e) = self.inner.broker.publish(queue, msg).await {
            if let Some(txn) = self.withdraw(kind, job_num, &ack_id) {
                txn.tracker.cancel();
            }
            tracing::error!(%kind, job_num, queue, error = %e, "publish failed");
            link.sink
                .raise(Fault::new(FaultCode::PublishFailure, e.to_string()));
            return Err(e);
        }
        tracing::info!(%kind, job_num, queue, ack_id = %ack_id, "sent {}", kind.request());
        Ok(())
    }

    /// Remove the pending entry for `kind`/`job_num` if it is still the one
    /// sent with `ack_id`.
    fn withdraw(&self, kind: TransactionKind, job_num: u64, ack_id: &str) -> Option<Transaction> {
        let mut pending = self.pending();
        match pending.get(&(kind, job_num)) {
            Some(txn) if txn.ack_id == ack_id => pending.remove(&(kind, job_num)),
            _ => None,
        }
    }

    /// Timeout callback for a transaction: drop it from the pending table and
    /// hand the fault to the sink.
    fn escalation(
        &self,
        kind: TransactionKind,
        job_num: u64,
        ack_id: String,
        sink: FaultSink,
    ) -> impl FnOnce(Fault) + Send + 'static {
        let weak: Weak<DirectorInner> = Arc::downgrade(&self.inner);
        move |fault| {
            if let Some(inner) = weak.upgrade() {
                let director = Director { inner };
                drop(director.withdraw(kind, job_num, &ack_id));
            }
            tracing::error!(%kind, job_num, code = fault.code.code(), report = %fault.report, "ack timed out");
            sink.raise(fault);
        }
    }

    /// Close the transaction an ack answers. Fails with `DuplicateAck` when
    /// nothing is outstanding for it or its tracker already settled.
    fn settle(&self, kind: TransactionKind, job_num: u64) -> Result<Transaction> {
        let txn = self.pending().remove(&(kind, job_num)).ok_or_else(|| {
            ArchiverError::DuplicateAck(format!(
                "{} for job {job_num} matches no outstanding request",
                kind.ack()
            ))
        })?;
        if !txn.tracker.disarm() {
            return Err(ArchiverError::DuplicateAck(format!(
                "{} for job {job_num} arrived after its deadline",
                kind.ack()
            )));
        }
        Ok(txn)
    }

    // -----------------------------------------------------------------------
    // Connections
    // -----------------------------------------------------------------------

    /// Lease a forwarder, start consuming the inbound queues, then start the
    /// forwarder and archive heartbeats. Faults raised by anything started
    /// here go to `sink`.
    pub async fn start_connections(&self, sink: FaultSink, generation: u64) -> Result<()> {
        let mut conns = self.inner.connections.lock().await;
        if conns.is_some() {
            tracing::warn!(generation, "connections already started");
            return Ok(());
        }
        let config = &self.inner.config;
        let registry = &self.inner.registry;

        let forwarder = registry.pop_peer(config.timing.lease_wait()).await?;
        if let Err(e) = registry.set_paired(&forwarder).await {
            self.release(&forwarder).await;
            return Err(e);
        }
        tracing::info!(generation, forwarder = %forwarder.hostname, queue = %forwarder.consume_queue, "paired with forwarder");

        let forwarder_slot = Arc::new(HeartbeatSlot::new());
        let archive_slot = Arc::new(HeartbeatSlot::new());
        let heartbeats = HashMap::from([
            (MessageKind::FwdrHealthCheckAck, Arc::clone(&forwarder_slot)),
            (MessageKind::ArchiveHealthCheckAck, Arc::clone(&archive_slot)),
        ]);
        self.set_link(Some(Arc::new(Link {
            generation,
            forwarder: forwarder.clone(),
            sink: sink.clone(),
            heartbeats,
        })));

        let cancel = CancellationToken::new();
        let mut consumers = Vec::new();
        for queue in config.queues.inbound() {
            match self.inner.broker.consume(queue).await {
                Ok(consumer) => {
                    let weak = Arc::downgrade(&self.inner);
                    consumers.push(tokio::spawn(consume(weak, consumer, cancel.child_token())));
                }
                Err(e) => {
                    tracing::error!(queue, error = %e, "could not start consumer");
                    cancel.cancel();
                    for task in consumers {
                        let _ = task.await;
                    }
                    self.set_link(None);
                    self.release(&forwarder).await;
                    return Err(e);
                }
            }
        }

        let interval = config.timing.heartbeat_interval();
        let monitors = vec![
            HeartbeatMonitor::start(
                HeartbeatSpec {
                    peer: forwarder.hostname.clone(),
                    queue: forwarder.consume_queue.clone(),
                    probe: MessageKind::FwdrHealthCheck,
                    interval,
                    fault_code: FaultCode::ForwarderHeartbeat,
                    reply_queue: config.queues.reply.clone(),
                    session: Arc::clone(&self.inner.session),
                },
                forwarder_slot,
                Arc::clone(&self.inner.broker),
                Arc::clone(&self.inner.ack_ids),
                sink.clone(),
            ),
            HeartbeatMonitor::start(
                HeartbeatSpec {
                    peer: "archive_controller".to_string(),
                    queue: config.queues.archive_consume.clone(),
                    probe: MessageKind::ArchiveHealthCheck,
                    interval,
                    fault_code: FaultCode::ArchiveHeartbeat,
                    reply_queue: config.queues.reply.clone(),
                    session: Arc::clone(&self.inner.session),
                },
                archive_slot,
                Arc::clone(&self.inner.broker),
                Arc::clone(&self.inner.ack_ids),
                sink,
            ),
        ];

        *conns = Some(Connections {
            heartbeats: monitors,
            consumers,
            cancel,
        });
        self.inner.starts.fetch_add(1, Ordering::SeqCst);
        tracing::info!(generation, "connections started");
        Ok(())
    }

    /// Tear down in order: heartbeats, publishers, consumers. Outstanding
    /// transactions are cancelled without escalating. With `release` the
    /// forwarder goes back to the registry; after a fault it stays out of
    /// the pool.
    pub async fn stop_connections(&self, release: bool) {
        let mut conns = self.inner.connections.lock().await;
        let Some(c) = conns.take() else {
            tracing::debug!("connections already stopped");
            return;
        };

        for monitor in c.heartbeats {
            monitor.stop().await;
        }
        let link = self.set_link(None);

        c.cancel.cancel();
        for task in c.consumers {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "consumer task ended abnormally");
            }
        }

        let pending = std::mem::take(&mut *self.pending());
        for txn in pending.values() {
            txn.tracker.cancel();
            tracing::debug!(kind = %txn.kind, job_num = txn.job_num, "cancelled outstanding transaction");
        }
        drop(pending);

        if release {
            if let Some(link) = &link {
                self.release(&link.forwarder).await;
            }
        }
        self.inner.stops.fetch_add(1, Ordering::SeqCst);
        tracing::info!(
            generation = link.as_ref().map(|l| l.generation),
            release,
            "connections stopped"
        );
    }

    async fn release(&self, forwarder: &PeerDescriptor) {
        let registry = &self.inner.registry;
        if let Err(e) = registry.clear_paired().await {
            tracing::warn!(error = %e, "could not clear paired forwarder");
        }
        match registry.push_peer(forwarder).await {
            Ok(()) => tracing::info!(forwarder = %forwarder.hostname, "released forwarder"),
            Err(e) => {
                tracing::warn!(forwarder = %forwarder.hostname, error = %e, "could not release forwarder")
            }
        }
    }
}

/// Inbound loop for one queue. Every delivery is acknowledged to the broker
/// on receipt, then dispatched.
async fn consume(weak: Weak<DirectorInner>, mut consumer: Consumer, cancel: CancellationToken) {
    let queue = consumer.queue().to_string();
    tracing::debug!(queue = %queue, "consumer started");
    loop {
        let delivery = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            d = consumer.next() => match d {
                Some(d) => d,
                None => break,
            },
        };
        let message = delivery.ack();
        let Some(inner) = weak.upgrade() else { break };
        Director { inner }.dispatch(message).await;
    }
    tracing::debug!(queue = %queue, "consumer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::scoreboard::MemoryScoreboard;
    use std::time::Duration;

    struct Recorder(Mutex<Vec<(i32, String)>>);

    impl SupervisoryLayer for Recorder {
        fn raise_fault(&self, code: i32, report: &str) {
            self.0.lock().unwrap().push((code, report.to_string()));
        }

        fn processing_status(&self, status_code: i64, description: &str) {
            self.0
                .lock()
                .unwrap()
                .push((status_code as i32, description.to_string()));
        }
    }

    struct Fixture {
        broker: MemoryBroker,
        board: Arc<MemoryScoreboard>,
        status: Arc<Recorder>,
        faults: Arc<Mutex<Vec<Fault>>>,
        director: Director,
    }

    async fn fixture() -> Fixture {
        let mut config = ArchiverConfig::default();
        config.timing.heartbeat_interval_ms = 3_600_000;
        config.timing.ack_timeout_ms = 5_000;
        let broker = MemoryBroker::new();
        let board = Arc::new(MemoryScoreboard::new("AT"));
        board
            .push_peer(&PeerDescriptor::new("f1", "10.0.0.1", "f1_consume"))
            .await
            .unwrap();
        let status = Arc::new(Recorder(Mutex::new(Vec::new())));
        let director = Director::new(
            config,
            Arc::new(broker.clone()),
            board.clone(),
            status.clone(),
        );
        Fixture {
            broker,
            board,
            status,
            faults: Arc::new(Mutex::new(Vec::new())),
            director,
        }
    }

    impl Fixture {
        fn sink(&self) -> FaultSink {
            let faults = Arc::clone(&self.faults);
            FaultSink::new(move |f| faults.lock().unwrap().push(f))
        }

        async fn connect(&self) {
            self.director.start_connections(self.sink(), 1).await.unwrap();
        }

        async fn reply(&self, msg: Message) {
            let queue = self.director.config().queues.reply.clone();
            self.broker.publish(&queue, msg).await.unwrap();
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn events_need_connections() {
        let fx = fixture().await;
        let err = fx
            .director
            .integration_start(&ImageEvent::new(1, "S1", "AT_O_1"))
            .await
            .unwrap_err();
        assert!(matches!(err, ArchiverError::NotConnected));
    }

    #[tokio::test(start_paused = true)]
    async fn start_leases_and_stop_releases() {
        let fx = fixture().await;
        fx.connect().await;
        assert_eq!(fx.board.available_peers(), 0);
        assert_eq!(fx.board.get_paired().await.unwrap().unwrap().hostname, "f1");
        assert_eq!(fx.director.running_heartbeats().await, 2);
        assert_eq!(fx.director.generation(), Some(1));

        fx.director.stop_connections(true).await;
        assert_eq!(fx.board.available_peers(), 1);
        assert!(fx.board.get_paired().await.unwrap().is_none());
        assert_eq!(fx.director.running_heartbeats().await, 0);
        assert_eq!(fx.director.connection_starts(), 1);
        assert_eq!(fx.director.connection_stops(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn start_without_forwarder_fails() {
        let fx = fixture().await;
        fx.board.pop_peer(Duration::ZERO).await.unwrap();
        let err = fx.director.start_connections(fx.sink(), 1).await.unwrap_err();
        assert!(matches!(err, ArchiverError::NoPeerAvailable));
        assert_eq!(err.fault_code(), Some(FaultCode::NoForwarderAvailable));
        assert_eq!(fx.director.connection_starts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn end_readout_ack_settles_transaction() {
        let fx = fixture().await;
        fx.connect().await;
        fx.director
            .end_readout(&ImageEvent::new(9, "S1", "AT_O_9"))
            .await
            .unwrap();
        assert!(fx.director.is_pending(TransactionKind::ReadoutEnd, 9));
        let sent = fx.broker.published("f1_consume");
        let readout = sent
            .iter()
            .find(|m| m.tag() == Some("END_READOUT"))
            .unwrap();
        assert_eq!(readout.get_u64(field::IMAGES_IN_SEQUENCE), Some(1));

        fx.reply(Message::new(MessageKind::EndReadoutAck).with(field::JOB_NUM, 9))
            .await;
        assert_eq!(fx.director.in_flight(), 0);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(fx.faults.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn header_ready_timeout_escalates_once() {
        let fx = fixture().await;
        fx.connect().await;
        let event = FileObjectEvent::new(3, "S1", "AT_O_3", "http://header/AT_O_3.header");
        fx.director.large_file_object_available(&event).await.unwrap();

        tokio::time::sleep(Duration::from_secs(30)).await;
        let faults = fx.faults.lock().unwrap().clone();
        assert_eq!(faults.len(), 1);
        assert_eq!(faults[0].code, FaultCode::HeaderReadyTimeout);
        assert_eq!(fx.director.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cancels_outstanding_without_fault() {
        let fx = fixture().await;
        fx.connect().await;
        fx.director
            .end_readout(&ImageEvent::new(4, "S1", "AT_O_4"))
            .await
            .unwrap();
        fx.director.stop_connections(false).await;
        assert_eq!(fx.director.in_flight(), 0);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(fx.faults.lock().unwrap().is_empty());
        // Not released: the lease stays out of the pool after a fault stop.
        assert_eq!(fx.board.available_peers(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn publish_failure_escalates_and_unregisters() {
        let fx = fixture().await;
        fx.connect().await;
        fx.broker.set_unreachable(true);
        let err = fx
            .director
            .end_readout(&ImageEvent::new(5, "S1", "AT_O_5"))
            .await
            .unwrap_err();
        assert!(matches!(err, ArchiverError::PublishFailure { .. }));
        assert_eq!(fx.director.in_flight(), 0);
        let faults = fx.faults.lock().unwrap().clone();
        assert_eq!(faults[0].code, FaultCode::PublishFailure);
    }

    #[tokio::test(start_paused = true)]
    async fn telemetry_reaches_supervisory_layer() {
        let fx = fixture().await;
        fx.connect().await;
        let telemetry = fx.director.config().queues.telemetry.clone();
        fx.broker
            .publish(
                &telemetry,
                Message::new(MessageKind::Telemetry)
                    .with(field::STATUS_CODE, 101)
                    .with(field::DESCRIPTION, "file transferred"),
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
        let seen = fx.status.0.lock().unwrap().clone();
        assert_eq!(seen, vec![(101, "file transferred".to_string())]);
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_acks_are_routed_to_their_slot() {
        let fx = fixture().await;
        fx.connect().await;
        tokio::time::sleep(Duration::from_millis(1)).await;
        let probe = fx
            .broker
            .published("f1_consume")
            .into_iter()
            .find(|m| m.tag() == Some("FWDR_HEALTH_CHECK"))
            .unwrap();
        let ack_id = probe.get_str(field::ACK_ID).unwrap().to_string();
        fx.reply(Message::new(MessageKind::FwdrHealthCheckAck).with(field::ACK_ID, ack_id))
            .await;
        let link = fx.director.current_link().unwrap();
        assert!(!link.heartbeats[&MessageKind::FwdrHealthCheckAck].is_awaiting_ack());
        assert!(link.heartbeats[&MessageKind::ArchiveHealthCheckAck].is_awaiting_ack());
        fx.director.stop_connections(true).await;
    }

    #[tokio::test(start_paused = true)]
    async fn health_checks_after_integration_start_carry_its_session() {
        let fx = fixture().await;
        fx.connect().await;
        tokio::time::sleep(Duration::from_millis(1)).await;
        let first = fx
            .broker
            .published("f1_consume")
            .into_iter()
            .find(|m| m.tag() == Some("FWDR_HEALTH_CHECK"))
            .unwrap();
        assert_eq!(first.get_str(field::SESSION_ID), None);

        fx.director
            .integration_start(&ImageEvent::new(2, "Session 7", "AT_O_2"))
            .await
            .unwrap();
        let ack_id = first.get_str(field::ACK_ID).unwrap().to_string();
        fx.reply(Message::new(MessageKind::FwdrHealthCheckAck).with(field::ACK_ID, ack_id))
            .await;
        tokio::time::sleep(Duration::from_millis(3_600_010)).await;

        let probes: Vec<Message> = fx
            .broker
            .published("f1_consume")
            .into_iter()
            .filter(|m| m.tag() == Some("FWDR_HEALTH_CHECK"))
            .collect();
        assert_eq!(probes.len(), 2);
        assert_eq!(probes[1].get_str(field::SESSION_ID), Some("Session 7"));
        fx.director.stop_connections(true).await;
    }

    /// A registry whose job bookkeeping is slow enough for a teardown to
    /// slip in while an event is being handled.
    struct SlowBoard(MemoryScoreboard);

    #[async_trait::async_trait]
    impl LeaseRegistry for SlowBoard {
        async fn pop_peer(&self, wait: Duration) -> Result<PeerDescriptor> {
            self.0.pop_peer(wait).await
        }

        async fn push_peer(&self, peer: &PeerDescriptor) -> Result<()> {
            self.0.push_peer(peer).await
        }

        async fn set_paired(&self, peer: &PeerDescriptor) -> Result<()> {
            self.0.set_paired(peer).await
        }

        async fn get_paired(&self) -> Result<Option<PeerDescriptor>> {
            self.0.get_paired().await
        }

        async fn clear_paired(&self) -> Result<()> {
            self.0.clear_paired().await
        }

        async fn set_jobnum(&self, job_num: u64) -> Result<()> {
            tokio::time::sleep(Duration::from_secs(1)).await;
            self.0.set_jobnum(job_num).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn integration_start_racing_teardown_leaves_nothing_armed() {
        let mut config = ArchiverConfig::default();
        config.timing.heartbeat_interval_ms = 3_600_000;
        config.timing.ack_timeout_ms = 5_000;
        let archive_queue = config.queues.archive_consume.clone();
        let broker = MemoryBroker::new();
        let board = SlowBoard(MemoryScoreboard::new("AT"));
        board
            .push_peer(&PeerDescriptor::new("f1", "10.0.0.1", "f1_consume"))
            .await
            .unwrap();
        let director = Director::new(
            config,
            Arc::new(broker.clone()),
            Arc::new(board),
            Arc::new(Recorder(Mutex::new(Vec::new()))),
        );
        let faults = Arc::new(Mutex::new(Vec::new()));
        let sink = {
            let faults = Arc::clone(&faults);
            FaultSink::new(move |f: Fault| faults.lock().unwrap().push(f))
        };
        director.start_connections(sink, 1).await.unwrap();

        let racing = director.clone();
        let started = tokio::spawn(async move {
            racing
                .integration_start(&ImageEvent::new(6, "S1", "AT_O_6"))
                .await
        });
        tokio::time::sleep(Duration::from_millis(1)).await;
        director.stop_connections(false).await;

        let err = started.await.unwrap().unwrap_err();
        assert!(matches!(err, ArchiverError::NotConnected));
        assert_eq!(director.in_flight(), 0);
        assert!(!broker
            .published(&archive_queue)
            .iter()
            .any(|m| m.tag() == Some("NEW_ITEM")));

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(faults.lock().unwrap().is_empty());
    }
}
