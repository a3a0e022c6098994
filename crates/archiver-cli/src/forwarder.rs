//! A forwarder stand-in for `simulate`.
//!
//! Acks everything the director sends and, on end of readout, writes a
//! placeholder image into the target directory handed over in XFER_PARAMS,
//! then reports the transfer to the archive controller.

use archiver_core::broker::Broker;
use archiver_core::config::ArchiverConfig;
use archiver_core::message::{field, Message, MessageKind};
use archiver_core::{ArchiverError, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const COMPONENT: &str = "AT_FWDR";

pub struct EchoForwarder {
    queue: String,
    config: ArchiverConfig,
    broker: Arc<dyn Broker>,
    /// Target directory per job, from XFER_PARAMS.
    targets: Mutex<HashMap<u64, String>>,
}

impl EchoForwarder {
    pub fn new(queue: impl Into<String>, config: ArchiverConfig, broker: Arc<dyn Broker>) -> Self {
        Self {
            queue: queue.into(),
            config,
            broker,
            targets: Mutex::new(HashMap::new()),
        }
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<Result<()>> {
        tokio::spawn(async move { self.run(cancel).await })
    }

    async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let mut consumer = self.broker.consume(&self.queue).await?;
        tracing::debug!(queue = %self.queue, "forwarder listening");
        loop {
            let delivery = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                d = consumer.next() => match d {
                    Some(d) => d,
                    None => break,
                },
            };
            if let Err(e) = self.handle(delivery.ack()).await {
                tracing::warn!(error = %e, "forwarder dropped message");
            }
        }
        Ok(())
    }

    async fn handle(&self, msg: Message) -> Result<()> {
        match msg.kind()? {
            MessageKind::FwdrHealthCheck | MessageKind::HeaderReady => self.ack(&msg).await,
            MessageKind::XferParams => {
                let job_num = msg.require_u64(field::JOB_NUM)?;
                let location = msg.require_str(field::TARGET_LOCATION)?;
                let dir = location
                    .split_once(':')
                    .map(|(_, dir)| dir)
                    .unwrap_or(location);
                self.targets_lock().insert(job_num, dir.to_string());
                self.ack(&msg).await
            }
            MessageKind::EndReadout => {
                self.ack(&msg).await?;
                self.transfer(&msg).await
            }
            MessageKind::FileTransferCompletedAck => {
                tracing::debug!(filename = msg.get_str(field::FILENAME), "archive staged file");
                Ok(())
            }
            other => Err(ArchiverError::MalformedMessage(format!(
                "forwarder does not handle {other}"
            ))),
        }
    }

    fn targets_lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, String>> {
        self.targets.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Answer `msg` with the ack its kind calls for.
    async fn ack(&self, msg: &Message) -> Result<()> {
        let request = msg.kind()?;
        let kind = request.ack().ok_or_else(|| {
            ArchiverError::MalformedMessage(format!("{request} is not acknowledged"))
        })?;
        let mut ack = Message::new(kind)
            .with(field::COMPONENT, COMPONENT)
            .with(field::ACK_BOOL, "TRUE");
        for key in [field::ACK_ID, field::JOB_NUM, field::SESSION_ID, field::IMAGE_ID] {
            if let Some(value) = msg.get(key) {
                ack = ack.with(key, value.clone());
            }
        }
        let queue = msg
            .get_str(field::REPLY_QUEUE)
            .unwrap_or(&self.config.queues.reply);
        self.broker.publish(queue, ack).await
    }

    /// Write the image, hand it to the archive controller and report it.
    async fn transfer(&self, msg: &Message) -> Result<()> {
        let job_num = msg.require_u64(field::JOB_NUM)?;
        let image_id = msg.require_str(field::IMAGE_ID)?;
        let dir = self.targets_lock().remove(&job_num).ok_or_else(|| {
            ArchiverError::MalformedMessage(format!("no transfer parameters for job {job_num}"))
        })?;

        let dir = std::path::PathBuf::from(dir);
        std::fs::create_dir_all(&dir)?;
        let file = dir.join(format!("{image_id}.fits"));
        std::fs::write(&file, image_id.as_bytes())?;
        let filename = file.display().to_string();

        let queues = &self.config.queues;
        let completed = Message::new(MessageKind::FileTransferCompleted)
            .with(field::FILENAME, filename.as_str())
            .with(field::JOB_NUM, job_num)
            .with(field::REPLY_QUEUE, self.queue.as_str());
        self.broker.publish(&queues.archive_consume, completed).await?;

        let xferd = Message::new(MessageKind::ItemsXferdAck)
            .with(field::COMPONENT, COMPONENT)
            .with(field::JOB_NUM, job_num)
            .with(field::IMAGE_ID, image_id);
        self.broker.publish(&queues.reply, xferd).await?;

        let telemetry = Message::new(MessageKind::Telemetry)
            .with(field::STATUS_CODE, 0)
            .with(field::DESCRIPTION, format!("transferred {filename}"));
        self.broker.publish(&queues.telemetry, telemetry).await
    }
}
