use super::{Director, Request, TransactionKind};
use crate::error::{ArchiverError, Result};
use crate::message::{field, Message, MessageKind};
use futures::future::BoxFuture;
use serde_json::{json, Map};
use std::collections::HashMap;

pub(super) type Handler = for<'a> fn(&'a Director, Message) -> BoxFuture<'a, Result<()>>;

/// Inbound message kinds the director reacts to. Anything else is dropped.
pub(super) fn handler_table() -> HashMap<MessageKind, Handler> {
    let entries: [(MessageKind, Handler); 8] = [
        (MessageKind::NewItemAck, new_item_ack),
        (MessageKind::XferParamsAck, xfer_params_ack),
        (MessageKind::EndReadoutAck, end_readout_ack),
        (MessageKind::HeaderReadyAck, header_ready_ack),
        (MessageKind::FwdrHealthCheckAck, fwdr_health_check_ack),
        (MessageKind::ArchiveHealthCheckAck, archive_health_check_ack),
        (MessageKind::ItemsXferdAck, items_xferd_ack),
        (MessageKind::Telemetry, telemetry),
    ];
    entries.into_iter().collect()
}

fn new_item_ack(d: &Director, m: Message) -> BoxFuture<'_, Result<()>> {
    Box::pin(d.on_new_item_ack(m))
}

fn xfer_params_ack(d: &Director, m: Message) -> BoxFuture<'_, Result<()>> {
    Box::pin(d.on_terminal_ack(TransactionKind::IntegrationStart, m))
}

fn end_readout_ack(d: &Director, m: Message) -> BoxFuture<'_, Result<()>> {
    Box::pin(d.on_terminal_ack(TransactionKind::ReadoutEnd, m))
}

fn header_ready_ack(d: &Director, m: Message) -> BoxFuture<'_, Result<()>> {
    Box::pin(d.on_terminal_ack(TransactionKind::ObjectAvailable, m))
}

fn fwdr_health_check_ack(d: &Director, m: Message) -> BoxFuture<'_, Result<()>> {
    Box::pin(d.on_heartbeat_ack(MessageKind::FwdrHealthCheckAck, m))
}

fn archive_health_check_ack(d: &Director, m: Message) -> BoxFuture<'_, Result<()>> {
    Box::pin(d.on_heartbeat_ack(MessageKind::ArchiveHealthCheckAck, m))
}

fn items_xferd_ack(d: &Director, m: Message) -> BoxFuture<'_, Result<()>> {
    Box::pin(d.on_items_xferd_ack(m))
}

fn telemetry(d: &Director, m: Message) -> BoxFuture<'_, Result<()>> {
    Box::pin(d.on_telemetry(m))
}

impl Director {
    /// Route one inbound message. Never fails: malformed, unknown, duplicate
    /// and late messages are logged and dropped.
    pub async fn dispatch(&self, msg: Message) {
        let kind = match msg.kind() {
            Ok(kind) => kind,
            Err(e) => {
                tracing::warn!(error = %e, "dropping message");
                return;
            }
        };
        let Some(handler) = self.inner.handlers.get(&kind).copied() else {
            tracing::warn!(msg_type = %kind, "no handler for message; dropping");
            return;
        };
        if kind.is_health_check() {
            tracing::debug!(msg_type = %kind, "received");
        } else {
            tracing::info!(msg_type = %kind, job_num = msg.get_u64(field::JOB_NUM), "received");
        }

        if let Err(e) = handler(self, msg).await {
            match e.fault_code() {
                Some(code) => {
                    tracing::error!(msg_type = %kind, code = code.code(), error = %e, "handler escalated")
                }
                None => tracing::warn!(msg_type = %kind, error = %e, "dropping message"),
            }
        }
    }

    /// Step 1 answered: forward the target location to the leased forwarder.
    async fn on_new_item_ack(&self, msg: Message) -> Result<()> {
        let job_num = msg.require_u64(field::JOB_NUM)?;
        // Validate before settling so a bad ack leaves the tracker armed.
        let target_dir = msg.require_str(field::TARGET_DIR)?.to_string();
        let link = self.link()?;
        let txn = self.settle(TransactionKind::NewItem, job_num)?;

        let config = self.config();
        let mut params = Map::new();
        params.insert(field::RAFT_LIST.into(), json!([config.camera.wfs_raft]));
        params.insert(field::RAFT_CCD_LIST.into(), json!([[config.camera.wfs_ccd]]));
        params.insert(field::AT_FWDR.into(), json!(link.forwarder.hostname));
        let xfer = Message::new(MessageKind::XferParams)
            .with(field::SESSION_ID, txn.session_id.as_str())
            .with(field::IMAGE_ID, txn.image_id.as_str())
            .with(field::DEVICE, config.device.as_str())
            .with(field::JOB_NUM, job_num)
            .with(field::TARGET_LOCATION, config.target_location(&target_dir))
            .with(field::XFER_PARAMS, params);
        let request = Request {
            kind: TransactionKind::IntegrationStart,
            job_num,
            session_id: &txn.session_id,
            image_id: &txn.image_id,
            queue: &link.forwarder.consume_queue,
        };
        self.begin(&link, request, xfer).await
    }

    async fn on_terminal_ack(&self, kind: TransactionKind, msg: Message) -> Result<()> {
        let job_num = msg.require_u64(field::JOB_NUM)?;
        let txn = self.settle(kind, job_num)?;
        tracing::info!(%kind, job_num, image_id = %txn.image_id, "transaction complete");
        Ok(())
    }

    async fn on_heartbeat_ack(&self, kind: MessageKind, msg: Message) -> Result<()> {
        let link = self.link()?;
        let slot = link.heartbeats.get(&kind).ok_or_else(|| {
            ArchiverError::MalformedMessage(format!("no heartbeat answers with {kind}"))
        })?;
        if !slot.acknowledge(msg.get_str(field::ACK_ID)) {
            return Err(ArchiverError::DuplicateAck(format!(
                "{kind} {} matches no outstanding probe",
                msg.get_str(field::ACK_ID).unwrap_or("without ACK_ID")
            )));
        }
        Ok(())
    }

    async fn on_items_xferd_ack(&self, msg: Message) -> Result<()> {
        tracing::info!(
            job_num = msg.get_u64(field::JOB_NUM),
            image_id = msg.get_str(field::IMAGE_ID),
            "items transferred"
        );
        Ok(())
    }

    async fn on_telemetry(&self, msg: Message) -> Result<()> {
        let status_code = msg.get_i64(field::STATUS_CODE).ok_or_else(|| {
            ArchiverError::MalformedMessage("TELEMETRY message missing STATUS_CODE".to_string())
        })?;
        let description = msg.get_str(field::DESCRIPTION).unwrap_or_default();
        self.supervisory().processing_status(status_code, description);
        Ok(())
    }
}
