//! Supervisory state machine.
//!
//! The state, the live connection generation and the one-fault-in-flight
//! guard are owned by a single actor task. Lifecycle commands and faults are
//! messages to that task, so transitions never interleave.

use crate::director::Director;
use crate::error::{ArchiverError, Result};
use crate::event::{FileObjectEvent, ImageEvent};
use crate::fault::{Fault, FaultCode, FaultSink};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

// ---------------------------------------------------------------------------
// SupervisoryState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SupervisoryState {
    Standby,
    Disabled,
    Enabled,
    Fault,
}

/// What a transition does to the director's connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionAction {
    Start,
    Stop,
    Keep,
}

impl SupervisoryState {
    pub fn all() -> &'static [SupervisoryState] {
        &[
            SupervisoryState::Standby,
            SupervisoryState::Disabled,
            SupervisoryState::Enabled,
            SupervisoryState::Fault,
        ]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SupervisoryState::Standby => "STANDBY",
            SupervisoryState::Disabled => "DISABLED",
            SupervisoryState::Enabled => "ENABLED",
            SupervisoryState::Fault => "FAULT",
        }
    }

    /// Connections and heartbeats run only in these states.
    pub fn connections_active(self) -> bool {
        matches!(self, SupervisoryState::Disabled | SupervisoryState::Enabled)
    }

    pub fn transition(self, next: SupervisoryState) -> Result<ConnectionAction> {
        use SupervisoryState::*;
        match (self, next) {
            (Standby, Disabled) => Ok(ConnectionAction::Start),
            (Disabled, Standby) => Ok(ConnectionAction::Stop),
            (Standby, Fault) | (Disabled, Fault) | (Enabled, Fault) => Ok(ConnectionAction::Stop),
            (Fault, Standby) => Ok(ConnectionAction::Keep),
            (Disabled, Enabled) | (Enabled, Disabled) => Ok(ConnectionAction::Keep),
            _ => Err(ArchiverError::InvalidTransition {
                from: self.to_string(),
                to: next.to_string(),
                reason: "not in the transition table".to_string(),
            }),
        }
    }
}

impl fmt::Display for SupervisoryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SupervisoryState {
    type Err = ArchiverError;

    fn from_str(s: &str) -> Result<Self> {
        SupervisoryState::all()
            .iter()
            .copied()
            .find(|st| st.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| ArchiverError::Config(format!("unknown supervisory state '{s}'")))
    }
}

// ---------------------------------------------------------------------------
// Actor
// ---------------------------------------------------------------------------

enum Command {
    Transition {
        to: SupervisoryState,
        require_from: Option<SupervisoryState>,
        reply: oneshot::Sender<Result<SupervisoryState>>,
    },
    Fault {
        generation: u64,
        fault: Fault,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

struct Actor {
    director: Director,
    state: watch::Sender<SupervisoryState>,
    commands: mpsc::WeakUnboundedSender<Command>,
    generation: u64,
    live_generation: Option<u64>,
    transitioning_to_fault: bool,
    faults_raised: Arc<AtomicU64>,
}

impl Actor {
    fn current(&self) -> SupervisoryState {
        *self.state.borrow()
    }

    async fn set(&self, next: SupervisoryState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            tracing::info!(from = %prev, to = %next, "supervisory state changed");
        }
        if let Err(e) = self.director.registry().set_state(next.as_str()).await {
            tracing::warn!(state = %next, error = %e, "could not mirror state to registry");
        }
    }

    /// Faults from this sink are tagged with `generation` so that anything
    /// still firing after its connection set is gone is recognised as stale.
    fn sink(&self, generation: u64) -> FaultSink {
        let commands = self.commands.clone();
        FaultSink::new(move |fault| {
            if let Some(tx) = commands.upgrade() {
                let _ = tx.send(Command::Fault { generation, fault });
            }
        })
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        self.set(SupervisoryState::Standby).await;
        while let Some(cmd) = rx.recv().await {
            match cmd {
                Command::Transition {
                    to,
                    require_from,
                    reply,
                } => {
                    let result = self.transition(to, require_from).await;
                    let _ = reply.send(result);
                }
                Command::Fault { generation, fault } => {
                    if self.live_generation != Some(generation) {
                        tracing::debug!(generation, %fault, "dropping fault from a stopped connection set");
                        continue;
                    }
                    self.escalate(fault).await;
                }
                Command::Shutdown { reply } => {
                    self.shutdown().await;
                    let _ = reply.send(());
                    return;
                }
            }
        }
        self.shutdown().await;
    }

    async fn transition(
        &mut self,
        to: SupervisoryState,
        require_from: Option<SupervisoryState>,
    ) -> Result<SupervisoryState> {
        let from = self.current();
        if let Some(required) = require_from {
            if from != required {
                return Err(ArchiverError::InvalidTransition {
                    from: from.to_string(),
                    to: to.to_string(),
                    reason: format!("only allowed from {required}"),
                });
            }
        }
        match from.transition(to)? {
            ConnectionAction::Start => {
                self.generation += 1;
                let generation = self.generation;
                let sink = self.sink(generation);
                if let Err(e) = self.director.start_connections(sink, generation).await {
                    let code = e.fault_code().unwrap_or(FaultCode::NoForwarderAvailable);
                    tracing::error!(error = %e, "could not start connections");
                    self.escalate(Fault::new(code, e.to_string())).await;
                    return Err(e);
                }
                self.live_generation = Some(generation);
            }
            ConnectionAction::Stop => {
                self.live_generation = None;
                self.director
                    .stop_connections(to != SupervisoryState::Fault)
                    .await;
            }
            ConnectionAction::Keep => {
                if from == SupervisoryState::Fault {
                    self.transitioning_to_fault = false;
                }
            }
        }
        self.set(to).await;
        Ok(to)
    }

    /// Tear down, enter FAULT, then tell the supervisory layer. At most one
    /// escalation runs until the next reset.
    async fn escalate(&mut self, fault: Fault) {
        if self.transitioning_to_fault {
            tracing::debug!(%fault, "fault already in progress");
            return;
        }
        self.transitioning_to_fault = true;
        let from = self.current();
        match from.transition(SupervisoryState::Fault) {
            Ok(ConnectionAction::Stop) => {
                self.live_generation = None;
                self.director.stop_connections(false).await;
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "escalating from unexpected state"),
        }
        self.set(SupervisoryState::Fault).await;
        self.faults_raised.fetch_add(1, Ordering::SeqCst);
        tracing::error!(code = fault.code.code(), report = %fault.report, "raising fault");
        self.director
            .supervisory()
            .raise_fault(fault.code.code(), &fault.report);
    }

    async fn shutdown(&mut self) {
        self.live_generation = None;
        self.director.stop_connections(true).await;
    }
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

/// Handle to the supervisory actor. Dropping every handle stops the actor,
/// which tears connections down.
#[derive(Debug)]
pub struct Supervisor {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<SupervisoryState>,
    director: Director,
    faults_raised: Arc<AtomicU64>,
    task: JoinHandle<()>,
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Transition { to, .. } => write!(f, "Transition({to})"),
            Command::Fault { generation, fault } => write!(f, "Fault({generation}, {fault})"),
            Command::Shutdown { .. } => f.write_str("Shutdown"),
        }
    }
}

impl Supervisor {
    /// Start in STANDBY. Must be called from within a Tokio runtime.
    pub fn spawn(director: Director) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SupervisoryState::Standby);
        let faults_raised = Arc::new(AtomicU64::new(0));
        let actor = Actor {
            director: director.clone(),
            state: state_tx,
            commands: tx.downgrade(),
            generation: 0,
            live_generation: None,
            transitioning_to_fault: false,
            faults_raised: Arc::clone(&faults_raised),
        };
        let task = tokio::spawn(actor.run(rx));
        Self {
            commands: tx,
            state: state_rx,
            director,
            faults_raised,
            task,
        }
    }

    pub fn director(&self) -> &Director {
        &self.director
    }

    pub fn state(&self) -> SupervisoryState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SupervisoryState> {
        self.state.clone()
    }

    /// Faults reported to the supervisory layer so far.
    pub fn faults_raised(&self) -> u64 {
        self.faults_raised.load(Ordering::SeqCst)
    }

    async fn request(
        &self,
        to: SupervisoryState,
        require_from: Option<SupervisoryState>,
    ) -> Result<SupervisoryState> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Transition {
                to,
                require_from,
                reply,
            })
            .map_err(|_| ArchiverError::SupervisorGone)?;
        rx.await.map_err(|_| ArchiverError::SupervisorGone)?
    }

    pub async fn enter_disabled(&self) -> Result<SupervisoryState> {
        self.request(SupervisoryState::Disabled, None).await
    }

    pub async fn enter_enabled(&self) -> Result<SupervisoryState> {
        self.request(SupervisoryState::Enabled, None).await
    }

    pub async fn enter_standby(&self) -> Result<SupervisoryState> {
        self.request(SupervisoryState::Standby, None).await
    }

    pub async fn reset_from_fault(&self) -> Result<SupervisoryState> {
        self.request(SupervisoryState::Standby, Some(SupervisoryState::Fault))
            .await
    }

    // -----------------------------------------------------------------------
    // Event ingestion, gated on ENABLED
    // -----------------------------------------------------------------------

    fn accepting(&self, event: &str, job_num: u64) -> bool {
        let state = self.state();
        if state != SupervisoryState::Enabled {
            tracing::info!(event, job_num, %state, "not enabled; dropping event");
            return false;
        }
        true
    }

    /// Returns `Ok(false)` when the event was dropped because the device is
    /// not ENABLED.
    pub async fn integration_start(&self, event: &ImageEvent) -> Result<bool> {
        if !self.accepting("startIntegration", event.job_num) {
            return Ok(false);
        }
        self.director.integration_start(event).await?;
        Ok(true)
    }

    pub async fn end_readout(&self, event: &ImageEvent) -> Result<bool> {
        if !self.accepting("endReadout", event.job_num) {
            return Ok(false);
        }
        self.director.end_readout(event).await?;
        Ok(true)
    }

    pub async fn large_file_object_available(&self, event: &FileObjectEvent) -> Result<bool> {
        if !self.accepting("largeFileObjectAvailable", event.job_num) {
            return Ok(false);
        }
        self.director.large_file_object_available(event).await?;
        Ok(true)
    }

    /// Stop connections, releasing the lease, and end the actor.
    pub async fn shutdown(self) {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown { reply }).is_ok() {
            let _ = rx.await;
        }
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "supervisor task ended abnormally");
        }
    }
}
