use crate::fault::FaultCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ArchiverError {
    #[error("no {kind} ack for job {job_num} within {timeout_ms}ms")]
    AckTimeout {
        kind: String,
        job_num: u64,
        timeout_ms: u64,
    },

    #[error("no forwarder available on scoreboard list")]
    NoPeerAvailable,

    #[error("failed to publish message to {queue}: {reason}")]
    PublishFailure { queue: String, reason: String },

    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("duplicate ack: {0}")]
    DuplicateAck(String),

    #[error("invalid transition from {from} to {to}: {reason}")]
    InvalidTransition {
        from: String,
        to: String,
        reason: String,
    },

    #[error("director has no active connections")]
    NotConnected,

    #[error("supervisor is not running")]
    SupervisorGone,

    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl ArchiverError {
    /// Fault code reported to the supervisory layer when this error is fatal.
    ///
    /// `None` for conditions that are absorbed locally (malformed or duplicate
    /// messages) and for caller mistakes such as an invalid transition.
    pub fn fault_code(&self) -> Option<FaultCode> {
        match self {
            ArchiverError::NoPeerAvailable => Some(FaultCode::NoForwarderAvailable),
            ArchiverError::PublishFailure { .. } => Some(FaultCode::PublishFailure),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, ArchiverError>;
