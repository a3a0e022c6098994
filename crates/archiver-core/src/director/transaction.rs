use crate::fault::FaultCode;
use crate::message::MessageKind;
use crate::waiter::AckTracker;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The request/ack exchanges the director tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    /// Step 1 of an exposure: ask the archive controller for a target dir.
    NewItem,
    /// Step 2 of an exposure: hand transfer parameters to the forwarder.
    IntegrationStart,
    ReadoutEnd,
    ObjectAvailable,
}

impl TransactionKind {
    pub fn all() -> &'static [TransactionKind] {
        &[
            TransactionKind::NewItem,
            TransactionKind::IntegrationStart,
            TransactionKind::ReadoutEnd,
            TransactionKind::ObjectAvailable,
        ]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TransactionKind::NewItem => "new_item",
            TransactionKind::IntegrationStart => "integration_start",
            TransactionKind::ReadoutEnd => "readout_end",
            TransactionKind::ObjectAvailable => "object_available",
        }
    }

    /// The message that opens the exchange.
    pub fn request(self) -> MessageKind {
        match self {
            TransactionKind::NewItem => MessageKind::NewItem,
            TransactionKind::IntegrationStart => MessageKind::XferParams,
            TransactionKind::ReadoutEnd => MessageKind::EndReadout,
            TransactionKind::ObjectAvailable => MessageKind::HeaderReady,
        }
    }

    /// The acknowledgment that closes it.
    pub fn ack(self) -> MessageKind {
        match self {
            TransactionKind::NewItem => MessageKind::NewItemAck,
            TransactionKind::IntegrationStart => MessageKind::XferParamsAck,
            TransactionKind::ReadoutEnd => MessageKind::EndReadoutAck,
            TransactionKind::ObjectAvailable => MessageKind::HeaderReadyAck,
        }
    }

    pub fn fault_code(self) -> FaultCode {
        match self {
            TransactionKind::NewItem => FaultCode::NewItemTimeout,
            TransactionKind::IntegrationStart => FaultCode::XferParamsTimeout,
            TransactionKind::ReadoutEnd => FaultCode::EndReadoutTimeout,
            TransactionKind::ObjectAvailable => FaultCode::HeaderReadyTimeout,
        }
    }
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One outstanding request. Dropping it cancels its tracker.
#[derive(Debug)]
pub struct Transaction {
    pub kind: TransactionKind,
    pub job_num: u64,
    pub session_id: String,
    pub image_id: String,
    pub ack_id: String,
    pub(crate) tracker: AckTracker,
}
