#![allow(dead_code)]

use archiver_core::broker::{Broker, MemoryBroker};
use archiver_core::config::ArchiverConfig;
use archiver_core::director::Director;
use archiver_core::fault::SupervisoryLayer;
use archiver_core::message::Message;
use archiver_core::scoreboard::{LeaseRegistry, MemoryScoreboard, PeerDescriptor};
use archiver_core::supervisor::{Supervisor, SupervisoryState};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
pub struct Recorder {
    pub faults: Mutex<Vec<(i32, String)>>,
    pub status: Mutex<Vec<(i64, String)>>,
}

impl Recorder {
    pub fn fault_codes(&self) -> Vec<i32> {
        self.faults.lock().unwrap().iter().map(|(c, _)| *c).collect()
    }
}

impl SupervisoryLayer for Recorder {
    fn raise_fault(&self, code: i32, report: &str) {
        self.faults.lock().unwrap().push((code, report.to_string()));
    }

    fn processing_status(&self, status_code: i64, description: &str) {
        self.status
            .lock()
            .unwrap()
            .push((status_code, description.to_string()));
    }
}

pub struct Harness {
    pub config: ArchiverConfig,
    pub broker: MemoryBroker,
    pub board: Arc<MemoryScoreboard>,
    pub recorder: Arc<Recorder>,
    pub supervisor: Supervisor,
}

impl Harness {
    pub async fn new(config: ArchiverConfig, forwarders: &[&str]) -> Self {
        let broker = MemoryBroker::new();
        let board = Arc::new(MemoryScoreboard::new(config.device.clone()));
        for name in forwarders {
            board
                .push_peer(&PeerDescriptor::new(*name, "10.0.0.1", forwarder_queue(name)))
                .await
                .unwrap();
        }
        let recorder = Arc::new(Recorder::default());
        let director = Director::new(
            config.clone(),
            Arc::new(broker.clone()),
            board.clone(),
            recorder.clone(),
        );
        let supervisor = Supervisor::spawn(director);
        Self {
            config,
            broker,
            board,
            recorder,
            supervisor,
        }
    }

    pub fn director(&self) -> &Director {
        self.supervisor.director()
    }

    pub async fn enable(&self) {
        self.supervisor.enter_disabled().await.unwrap();
        self.supervisor.enter_enabled().await.unwrap();
    }

    /// Deliver `msg` on the director's reply queue and let it be dispatched.
    pub async fn reply(&self, msg: Message) {
        self.broker
            .publish(&self.config.queues.reply, msg)
            .await
            .unwrap();
        settle().await;
    }

    pub fn sent(&self, queue: &str, tag: &str) -> Vec<Message> {
        self.broker
            .published(queue)
            .into_iter()
            .filter(|m| m.tag() == Some(tag))
            .collect()
    }

    pub async fn wait_for_state(&self, state: SupervisoryState) {
        let mut rx = self.supervisor.subscribe();
        rx.wait_for(|s| *s == state).await.unwrap();
        settle().await;
    }
}

pub fn forwarder_queue(name: &str) -> String {
    format!("{name}_consume")
}

/// Heartbeats effectively off, so only the transactions under test can fault.
pub fn quiet_config() -> ArchiverConfig {
    let mut config = ArchiverConfig::default();
    config.timing.heartbeat_interval_ms = 3_600_000;
    config.timing.ack_timeout_ms = 5_000;
    config.archive.login = "ARC".to_string();
    config.archive.host = "archive.example".to_string();
    config
}

/// Give spawned tasks a chance to run under paused time.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}
