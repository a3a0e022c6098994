//! Fault codes and the outward interface to the supervisory layer.
//!
//! Every fatal condition in the director ends up as a [`Fault`]. Codes are
//! stable per cause so operators can tell which peer stopped answering.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

// ---------------------------------------------------------------------------
// FaultCode
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultCode {
    ForwarderHeartbeat,
    XferParamsTimeout,
    EndReadoutTimeout,
    HeaderReadyTimeout,
    NewItemTimeout,
    ArchiveHeartbeat,
    NoForwarderAvailable,
    PublishFailure,
}

impl FaultCode {
    pub fn all() -> &'static [FaultCode] {
        &[
            FaultCode::ForwarderHeartbeat,
            FaultCode::XferParamsTimeout,
            FaultCode::EndReadoutTimeout,
            FaultCode::HeaderReadyTimeout,
            FaultCode::NewItemTimeout,
            FaultCode::ArchiveHeartbeat,
            FaultCode::NoForwarderAvailable,
            FaultCode::PublishFailure,
        ]
    }

    pub fn code(self) -> i32 {
        match self {
            FaultCode::ForwarderHeartbeat => 5751,
            FaultCode::XferParamsTimeout => 5752,
            FaultCode::EndReadoutTimeout => 5753,
            FaultCode::HeaderReadyTimeout => 5754,
            FaultCode::NewItemTimeout => 5755,
            FaultCode::ArchiveHeartbeat => 5756,
            FaultCode::NoForwarderAvailable => 5757,
            FaultCode::PublishFailure => 5758,
        }
    }
}

impl fmt::Display for FaultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

// ---------------------------------------------------------------------------
// Fault
// ---------------------------------------------------------------------------

/// Escalation payload carried by an ack tracker and delivered to the
/// supervisory layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fault {
    pub code: FaultCode,
    pub report: String,
}

impl Fault {
    pub fn new(code: FaultCode, report: impl Into<String>) -> Self {
        Self {
            code,
            report: report.into(),
        }
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fault {}: {}", self.code, self.report)
    }
}

// ---------------------------------------------------------------------------
// FaultSink
// ---------------------------------------------------------------------------

/// Where escalations go. Trackers and heartbeat loops hold a clone; the
/// supervisor decides what a fault means for the current connection.
#[derive(Clone)]
pub struct FaultSink {
    raise: Arc<dyn Fn(Fault) + Send + Sync>,
}

impl FaultSink {
    pub fn new<F>(raise: F) -> Self
    where
        F: Fn(Fault) + Send + Sync + 'static,
    {
        Self {
            raise: Arc::new(raise),
        }
    }

    pub fn raise(&self, fault: Fault) {
        (self.raise)(fault)
    }
}

impl fmt::Debug for FaultSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FaultSink")
    }
}

// ---------------------------------------------------------------------------
// SupervisoryLayer
// ---------------------------------------------------------------------------

/// The external supervisory layer (the CSC wrapper in production).
///
/// `raise_fault` is called at most once per fault episode, after all
/// connections have been torn down.
pub trait SupervisoryLayer: Send + Sync + 'static {
    fn raise_fault(&self, code: i32, report: &str);

    /// Telemetry relayed from the forwarder.
    fn processing_status(&self, status_code: i64, description: &str) {
        tracing::info!(status_code, description, "processing status");
    }
}

/// A supervisory layer that only logs. Used by the CLI.
#[derive(Debug, Default, Clone)]
pub struct LoggingSupervisor;

impl SupervisoryLayer for LoggingSupervisor {
    fn raise_fault(&self, code: i32, report: &str) {
        tracing::error!(code, report, "fault raised");
    }
}
