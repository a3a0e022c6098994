//! Broker message model.
//!
//! A [`Message`] is a flat field map with a mandatory `MSG_TYPE` tag. The core
//! never assumes a serialization; the broker hands over decoded maps.

use crate::error::{ArchiverError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Well-known field names.
pub mod field {
    pub const MSG_TYPE: &str = "MSG_TYPE";
    pub const REPLY_QUEUE: &str = "REPLY_QUEUE";
    pub const ACK_ID: &str = "ACK_ID";
    pub const ACK_BOOL: &str = "ACK_BOOL";
    pub const JOB_NUM: &str = "JOB_NUM";
    pub const SESSION_ID: &str = "SESSION_ID";
    pub const IMAGE_ID: &str = "IMAGE_ID";
    pub const DEVICE: &str = "DEVICE";
    pub const COMPONENT: &str = "COMPONENT";
    pub const TARGET_DIR: &str = "TARGET_DIR";
    pub const TARGET_LOCATION: &str = "TARGET_LOCATION";
    pub const XFER_PARAMS: &str = "XFER_PARAMS";
    pub const RAFT_LIST: &str = "RAFT_LIST";
    pub const RAFT_CCD_LIST: &str = "RAFT_CCD_LIST";
    pub const AT_FWDR: &str = "AT_FWDR";
    pub const IMAGE_SEQUENCE_NAME: &str = "IMAGE_SEQUENCE_NAME";
    pub const IMAGES_IN_SEQUENCE: &str = "IMAGES_IN_SEQUENCE";
    pub const FILENAME: &str = "FILENAME";
    pub const STATUS_CODE: &str = "STATUS_CODE";
    pub const DESCRIPTION: &str = "DESCRIPTION";
}

// ---------------------------------------------------------------------------
// MessageKind
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageKind {
    NewItem,
    NewItemAck,
    XferParams,
    XferParamsAck,
    EndReadout,
    EndReadoutAck,
    HeaderReady,
    HeaderReadyAck,
    FwdrHealthCheck,
    FwdrHealthCheckAck,
    ArchiveHealthCheck,
    ArchiveHealthCheckAck,
    ItemsXferdAck,
    FileTransferCompleted,
    FileTransferCompletedAck,
    Telemetry,
}

impl MessageKind {
    pub fn all() -> &'static [MessageKind] {
        &[
            MessageKind::NewItem,
            MessageKind::NewItemAck,
            MessageKind::XferParams,
            MessageKind::XferParamsAck,
            MessageKind::EndReadout,
            MessageKind::EndReadoutAck,
            MessageKind::HeaderReady,
            MessageKind::HeaderReadyAck,
            MessageKind::FwdrHealthCheck,
            MessageKind::FwdrHealthCheckAck,
            MessageKind::ArchiveHealthCheck,
            MessageKind::ArchiveHealthCheckAck,
            MessageKind::ItemsXferdAck,
            MessageKind::FileTransferCompleted,
            MessageKind::FileTransferCompletedAck,
            MessageKind::Telemetry,
        ]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::NewItem => "NEW_ITEM",
            MessageKind::NewItemAck => "NEW_ITEM_ACK",
            MessageKind::XferParams => "XFER_PARAMS",
            MessageKind::XferParamsAck => "XFER_PARAMS_ACK",
            MessageKind::EndReadout => "END_READOUT",
            MessageKind::EndReadoutAck => "END_READOUT_ACK",
            MessageKind::HeaderReady => "HEADER_READY",
            MessageKind::HeaderReadyAck => "HEADER_READY_ACK",
            MessageKind::FwdrHealthCheck => "FWDR_HEALTH_CHECK",
            MessageKind::FwdrHealthCheckAck => "FWDR_HEALTH_CHECK_ACK",
            MessageKind::ArchiveHealthCheck => "ARCHIVE_HEALTH_CHECK",
            MessageKind::ArchiveHealthCheckAck => "ARCHIVE_HEALTH_CHECK_ACK",
            MessageKind::ItemsXferdAck => "ITEMS_XFERD_ACK",
            MessageKind::FileTransferCompleted => "FILE_TRANSFER_COMPLETED",
            MessageKind::FileTransferCompletedAck => "FILE_TRANSFER_COMPLETED_ACK",
            MessageKind::Telemetry => "TELEMETRY",
        }
    }

    /// The acknowledgment kind a peer answers this request with, if any.
    pub fn ack(self) -> Option<MessageKind> {
        match self {
            MessageKind::NewItem => Some(MessageKind::NewItemAck),
            MessageKind::XferParams => Some(MessageKind::XferParamsAck),
            MessageKind::EndReadout => Some(MessageKind::EndReadoutAck),
            MessageKind::HeaderReady => Some(MessageKind::HeaderReadyAck),
            MessageKind::FwdrHealthCheck => Some(MessageKind::FwdrHealthCheckAck),
            MessageKind::ArchiveHealthCheck => Some(MessageKind::ArchiveHealthCheckAck),
            MessageKind::FileTransferCompleted => Some(MessageKind::FileTransferCompletedAck),
            _ => None,
        }
    }

    /// Heartbeat traffic is logged at debug level only.
    pub fn is_health_check(self) -> bool {
        matches!(
            self,
            MessageKind::FwdrHealthCheck
                | MessageKind::FwdrHealthCheckAck
                | MessageKind::ArchiveHealthCheck
                | MessageKind::ArchiveHealthCheckAck
        )
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MessageKind {
    type Err = ArchiverError;

    fn from_str(s: &str) -> Result<Self> {
        MessageKind::all()
            .iter()
            .copied()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| ArchiverError::MalformedMessage(format!("unknown MSG_TYPE '{s}'")))
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Message {
    fields: Map<String, Value>,
}

impl Message {
    pub fn new(kind: MessageKind) -> Self {
        Self::default().with(field::MSG_TYPE, kind.as_str())
    }

    pub fn from_fields(fields: Map<String, Value>) -> Self {
        Self { fields }
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Raw `MSG_TYPE` tag, if present and a string.
    pub fn tag(&self) -> Option<&str> {
        self.get_str(field::MSG_TYPE)
    }

    pub fn kind(&self) -> Result<MessageKind> {
        let tag = self
            .tag()
            .ok_or_else(|| ArchiverError::MalformedMessage("missing MSG_TYPE".to_string()))?;
        tag.parse()
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }

    /// Numeric field that may also arrive as a decimal string.
    pub fn get_u64(&self, key: &str) -> Option<u64> {
        match self.fields.get(key)? {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        match self.fields.get(key)? {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn require_str(&self, key: &str) -> Result<&str> {
        self.get_str(key).ok_or_else(|| self.missing(key))
    }

    pub fn require_u64(&self, key: &str) -> Result<u64> {
        self.get_u64(key).ok_or_else(|| self.missing(key))
    }

    fn missing(&self, key: &str) -> ArchiverError {
        ArchiverError::MalformedMessage(format!(
            "{} message missing {key}",
            self.tag().unwrap_or("untagged")
        ))
    }
}

// ---------------------------------------------------------------------------
// AckIds
// ---------------------------------------------------------------------------

/// Issues `ACK_ID` values, unique per generator: `<MSG_TYPE>_<n>`.
#[derive(Debug, Default)]
pub struct AckIds {
    next: AtomicU64,
}

impl AckIds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self, kind: MessageKind) -> String {
        let n = self.next.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{}_{n:06}", kind.as_str())
    }
}
