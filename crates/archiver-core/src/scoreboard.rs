//! Lease registry ("scoreboard") boundary.
//!
//! Forwarders announce themselves by pushing a JSON descriptor onto a shared
//! list. A director leases one by popping it; the pop is the only mutual
//! exclusion in the system, so the registry must make it atomic.

use crate::error::{ArchiverError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;

const JOBNUM: &str = "jobnum";
const SESSION: &str = "session";
const STATE: &str = "state";
const PAIRED_FORWARDER: &str = "paired_forwarder";

/// A leasable downstream worker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerDescriptor {
    pub hostname: String,
    pub ip_address: String,
    pub consume_queue: String,
}

impl PeerDescriptor {
    pub fn new(
        hostname: impl Into<String>,
        ip_address: impl Into<String>,
        consume_queue: impl Into<String>,
    ) -> Self {
        Self {
            hostname: hostname.into(),
            ip_address: ip_address.into(),
            consume_queue: consume_queue.into(),
        }
    }
}

#[async_trait]
pub trait LeaseRegistry: Send + Sync + 'static {
    /// Remove one available peer, waiting up to `wait` for one to appear.
    async fn pop_peer(&self, wait: Duration) -> Result<PeerDescriptor>;

    /// Make a peer available for leasing.
    async fn push_peer(&self, peer: &PeerDescriptor) -> Result<()>;

    async fn set_paired(&self, peer: &PeerDescriptor) -> Result<()>;

    async fn get_paired(&self) -> Result<Option<PeerDescriptor>>;

    async fn clear_paired(&self) -> Result<()>;

    /// Mirror of the supervisory state label, for operators.
    async fn set_state(&self, _state: &str) -> Result<()> {
        Ok(())
    }

    async fn set_session(&self, _session_id: &str) -> Result<()> {
        Ok(())
    }

    async fn set_jobnum(&self, _job_num: u64) -> Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemoryScoreboard
// ---------------------------------------------------------------------------

/// In-process registry with the same list/hash layout as the shared one.
#[derive(Debug)]
pub struct MemoryScoreboard {
    device: String,
    forwarders: Mutex<VecDeque<String>>,
    fields: Mutex<HashMap<String, String>>,
    available: Notify,
}

impl MemoryScoreboard {
    pub fn new(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            forwarders: Mutex::new(VecDeque::new()),
            fields: Mutex::new(HashMap::new()),
            available: Notify::new(),
        }
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    fn list(&self) -> MutexGuard<'_, VecDeque<String>> {
        self.forwarders.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn hash(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.fields.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of forwarders waiting to be leased.
    pub fn available_peers(&self) -> usize {
        self.list().len()
    }

    pub fn get_state(&self) -> Option<String> {
        self.hash().get(STATE).cloned()
    }

    pub fn get_session(&self) -> Option<String> {
        self.hash().get(SESSION).cloned()
    }

    pub fn get_jobnum(&self) -> Option<u64> {
        self.hash().get(JOBNUM).and_then(|v| v.parse().ok())
    }
}

#[async_trait]
impl LeaseRegistry for MemoryScoreboard {
    async fn pop_peer(&self, wait: Duration) -> Result<PeerDescriptor> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            // Pop under the lock: two callers can never see the same entry.
            let popped = self.list().pop_back();
            if let Some(raw) = popped {
                let peer: PeerDescriptor = serde_json::from_str(&raw)?;
                tracing::info!(device = %self.device, forwarder = %peer.hostname, "leased forwarder");
                return Ok(peer);
            }
            if tokio::time::timeout_at(deadline, self.available.notified())
                .await
                .is_err()
            {
                tracing::warn!(device = %self.device, "no forwarder available on scoreboard list");
                return Err(ArchiverError::NoPeerAvailable);
            }
        }
    }

    async fn push_peer(&self, peer: &PeerDescriptor) -> Result<()> {
        let raw = serde_json::to_string(peer)?;
        self.list().push_front(raw);
        self.available.notify_one();
        Ok(())
    }

    async fn set_paired(&self, peer: &PeerDescriptor) -> Result<()> {
        let raw = serde_json::to_string(peer)?;
        tracing::info!(device = %self.device, forwarder = %peer.hostname, "recording paired forwarder");
        self.hash().insert(PAIRED_FORWARDER.to_string(), raw);
        Ok(())
    }

    async fn get_paired(&self) -> Result<Option<PeerDescriptor>> {
        let raw = self.hash().get(PAIRED_FORWARDER).cloned();
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn clear_paired(&self) -> Result<()> {
        self.hash().remove(PAIRED_FORWARDER);
        Ok(())
    }

    async fn set_state(&self, state: &str) -> Result<()> {
        self.hash().insert(STATE.to_string(), state.to_string());
        Ok(())
    }

    async fn set_session(&self, session_id: &str) -> Result<()> {
        self.hash()
            .insert(SESSION.to_string(), session_id.to_string());
        Ok(())
    }

    async fn set_jobnum(&self, job_num: u64) -> Result<()> {
        self.hash().insert(JOBNUM.to_string(), job_num.to_string());
        Ok(())
    }
}
