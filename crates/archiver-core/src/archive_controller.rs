//! The archive controller peer.
//!
//! Answers health checks and new-item requests on the archive consume queue,
//! and stages completed transfers: each file is hard-linked into the DBB and
//! OODS staging areas and the forwarder's copy is removed.

use crate::broker::Broker;
use crate::config::ArchiverConfig;
use crate::error::{ArchiverError, Result};
use crate::message::{field, Message, MessageKind};
use chrono::{Local, NaiveDate};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const COMPONENT: &str = "ARCHIVE_CTRL";

pub struct ArchiveController {
    config: ArchiverConfig,
    broker: Arc<dyn Broker>,
}

impl ArchiveController {
    pub fn new(config: ArchiverConfig, broker: Arc<dyn Broker>) -> Self {
        if let Some(raw) = &config.archive.checksum_type {
            match config.archive.checksum() {
                Some(kind) => tracing::info!(?kind, "checksums enabled"),
                None => tracing::warn!(
                    checksum_type = %raw,
                    "unsupported checksum type; defaulting to no checksum"
                ),
            }
        }
        Self { config, broker }
    }

    /// Consume the archive queue until `cancel` fires.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<Result<()>> {
        tokio::spawn(async move { self.run(cancel).await })
    }

    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let queue = &self.config.queues.archive_consume;
        let mut consumer = self.broker.consume(queue).await?;
        tracing::info!(queue = %queue, "archive controller listening");
        loop {
            let delivery = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                d = consumer.next() => match d {
                    Some(d) => d,
                    None => break,
                },
            };
            let msg = delivery.ack();
            if let Err(e) = self.handle(msg).await {
                tracing::warn!(error = %e, "archive controller dropped message");
            }
        }
        tracing::info!(queue = %queue, "archive controller stopped");
        Ok(())
    }

    pub async fn handle(&self, msg: Message) -> Result<()> {
        match msg.kind()? {
            MessageKind::ArchiveHealthCheck => self.on_health_check(msg).await,
            MessageKind::NewItem => self.on_new_item(msg).await,
            MessageKind::FileTransferCompleted => self.on_file_transfer_completed(msg).await,
            MessageKind::FileTransferCompletedAck => {
                tracing::info!(filename = msg.get_str(field::FILENAME), "ack received");
                Ok(())
            }
            other => Err(ArchiverError::MalformedMessage(format!(
                "archive controller does not handle {other}"
            ))),
        }
    }

    fn reply_queue<'a>(&'a self, msg: &'a Message) -> &'a str {
        msg.get_str(field::REPLY_QUEUE)
            .unwrap_or(&self.config.queues.reply)
    }

    async fn on_health_check(&self, msg: Message) -> Result<()> {
        let mut ack = Message::new(MessageKind::ArchiveHealthCheckAck)
            .with(field::COMPONENT, COMPONENT)
            .with(field::ACK_BOOL, "TRUE")
            .with(field::ACK_ID, msg.require_str(field::ACK_ID)?);
        if let Some(session) = msg.get_str(field::SESSION_ID) {
            ack = ack.with(field::SESSION_ID, session);
        }
        self.broker.publish(self.reply_queue(&msg), ack).await
    }

    async fn on_new_item(&self, msg: Message) -> Result<()> {
        let job_num = msg.require_u64(field::JOB_NUM)?;
        let target_dir = self.target_dir(Local::now().date_naive())?;
        let mut ack = Message::new(MessageKind::NewItemAck)
            .with(field::TARGET_DIR, target_dir.as_str())
            .with(field::ACK_ID, msg.require_str(field::ACK_ID)?)
            .with(field::JOB_NUM, job_num)
            .with(field::COMPONENT, COMPONENT)
            .with(field::ACK_BOOL, "TRUE");
        for key in [field::IMAGE_ID, field::SESSION_ID] {
            if let Some(value) = msg.get_str(key) {
                ack = ack.with(key, value);
            }
        }
        tracing::info!(job_num, target_dir = %target_dir, "new archive item");
        self.broker.publish(self.reply_queue(&msg), ack).await
    }

    async fn on_file_transfer_completed(&self, msg: Message) -> Result<()> {
        let filename = msg.require_str(field::FILENAME)?;
        self.stage_file(Path::new(filename))?;
        let mut ack = Message::new(MessageKind::FileTransferCompletedAck)
            .with(field::COMPONENT, COMPONENT)
            .with(field::FILENAME, filename);
        if let Some(job) = msg.get(field::JOB_NUM) {
            ack = ack.with(field::JOB_NUM, job.clone());
        }
        if let Some(session) = msg.get_str(field::SESSION_ID) {
            ack = ack.with(field::SESSION_ID, session);
        }
        self.broker.publish(self.reply_queue(&msg), ack).await
    }

    /// `<forwarder_staging>/<YYYY-MM-DD>/`, created if missing.
    pub fn target_dir(&self, day: NaiveDate) -> Result<String> {
        let dir = self
            .config
            .archive
            .forwarder_staging
            .join(day.format("%Y-%m-%d").to_string());
        std::fs::create_dir_all(&dir)?;
        Ok(format!("{}/", dir.display()))
    }

    /// Link `file` into every configured staging area, then remove it if at
    /// least one link was made. Returns the links created.
    pub fn stage_file(&self, file: &Path) -> Result<Vec<PathBuf>> {
        let archive = &self.config.archive;
        let relative = file
            .strip_prefix(&archive.forwarder_staging)
            .unwrap_or(file);
        let relative = relative.strip_prefix("/").unwrap_or(relative);

        let mut linked = Vec::new();
        for area in [&archive.dbb_staging, &archive.oods_staging].into_iter().flatten() {
            let target = area.join(relative);
            match link_into(file, &target) {
                Ok(()) => {
                    tracing::info!(link = %target.display(), "created link");
                    linked.push(target);
                }
                Err(e) => {
                    tracing::warn!(file = %file.display(), link = %target.display(), error = %e, "could not link file")
                }
            }
        }
        if !linked.is_empty() {
            tracing::info!(file = %file.display(), "link created; removing original");
            std::fs::remove_file(file)?;
        }
        Ok(linked)
    }
}

fn link_into(file: &Path, target: &Path) -> std::io::Result<()> {
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::hard_link(file, target)
}
