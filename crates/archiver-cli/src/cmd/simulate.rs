use crate::forwarder::EchoForwarder;
use crate::output::{print_json, print_table};
use crate::settings;
use anyhow::Context;
use archiver_core::archive_controller::ArchiveController;
use archiver_core::broker::MemoryBroker;
use archiver_core::config::ArchiverConfig;
use archiver_core::director::Director;
use archiver_core::event::{FileObjectEvent, ImageEvent, JobSequence};
use archiver_core::fault::SupervisoryLayer;
use archiver_core::message::{Message, MessageKind};
use archiver_core::scoreboard::{LeaseRegistry, MemoryScoreboard, PeerDescriptor};
use archiver_core::supervisor::{Supervisor, SupervisoryState};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const FORWARDER: &str = "fwdr-01";
const POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Serialize)]
struct FaultRecord {
    code: i32,
    report: String,
}

#[derive(Default)]
struct Collector {
    faults: Mutex<Vec<FaultRecord>>,
}

impl Collector {
    fn faults(&self) -> Vec<FaultRecord> {
        self.faults.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl SupervisoryLayer for Collector {
    fn raise_fault(&self, code: i32, report: &str) {
        tracing::error!(code, report, "fault raised");
        self.faults
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(FaultRecord {
                code,
                report: report.to_string(),
            });
    }

    fn processing_status(&self, status_code: i64, description: &str) {
        tracing::info!(status_code, description, "processing status");
    }
}

#[derive(Serialize)]
struct Summary {
    session_id: String,
    forwarder: String,
    images_requested: u32,
    images_completed: u32,
    final_state: String,
    faults: Vec<FaultRecord>,
    connection_starts: u64,
    connection_stops: u64,
    staged_files: Vec<String>,
}

pub fn run(
    config_path: Option<&Path>,
    images: u32,
    silent_forwarder: bool,
    json: bool,
) -> anyhow::Result<()> {
    let config = settings::load(config_path)?;
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let summary = rt.block_on(simulate(config, images, silent_forwarder))?;

    if json {
        print_json(&summary)?;
    } else {
        print_summary(&summary);
    }
    Ok(())
}

async fn simulate(
    mut config: ArchiverConfig,
    images: u32,
    silent_forwarder: bool,
) -> anyhow::Result<Summary> {
    let staging = tempfile::TempDir::new().context("failed to create staging directory")?;
    config.archive.forwarder_staging = staging.path().join("atforwarder");
    config.archive.oods_staging = Some(staging.path().join("oods"));
    config.archive.dbb_staging = Some(staging.path().join("dbb"));

    let broker = MemoryBroker::with_history_limit(config.broker.history_limit);
    let board = Arc::new(MemoryScoreboard::new(config.device.clone()));
    let forwarder_queue = format!("{FORWARDER}_consume");
    board
        .push_peer(&PeerDescriptor::new(FORWARDER, "127.0.0.1", forwarder_queue.as_str()))
        .await?;
    let collector = Arc::new(Collector::default());

    let cancel = CancellationToken::new();
    let controller = ArchiveController::new(config.clone(), Arc::new(broker.clone()))
        .spawn(cancel.child_token());
    let forwarder = if silent_forwarder {
        tracing::warn!(queue = %forwarder_queue, "forwarder will not answer");
        None
    } else {
        let fwdr = EchoForwarder::new(forwarder_queue.as_str(), config.clone(), Arc::new(broker.clone()));
        Some(fwdr.spawn(cancel.child_token()))
    };

    let director = Director::new(
        config.clone(),
        Arc::new(broker.clone()),
        board.clone(),
        collector.clone(),
    );
    let supervisor = Supervisor::spawn(director.clone());
    supervisor.enter_disabled().await?;
    supervisor.enter_enabled().await?;

    let limit = config.timing.ack_timeout() * 2 + config.timing.heartbeat_interval();
    let jobs = JobSequence::new_session();
    let day = chrono::Local::now().format("%Y%m%d").to_string();
    let mut completed = 0;

    for _ in 0..images {
        let job_num = jobs.next_job();
        let image = format!("AT_O_{day}_{job_num:06}");
        let mut event = ImageEvent::new(job_num, jobs.session_id(), image.as_str());
        event.image_sequence_name = "simulate".to_string();
        event.images_in_sequence = images;
        let header = FileObjectEvent::new(
            job_num,
            jobs.session_id(),
            image.as_str(),
            format!("http://header-service/{image}.header"),
        );
        let faults_before = supervisor.faults_raised();

        if !supervisor.integration_start(&event).await? {
            break;
        }
        wait_idle(&supervisor, &director, limit).await;
        if !supervisor.end_readout(&event).await? {
            break;
        }
        wait_idle(&supervisor, &director, limit).await;
        if !supervisor.large_file_object_available(&header).await? {
            break;
        }
        wait_idle(&supervisor, &director, limit).await;

        if supervisor.state() == SupervisoryState::Enabled
            && supervisor.faults_raised() == faults_before
        {
            tracing::info!(job_num, image = %image, "image archived");
            completed += 1;
        }
    }

    // Let the archive controller finish staging what the forwarder handed it.
    let staged_acks = |broker: &MemoryBroker| {
        count_kind(
            &broker.published(&forwarder_queue),
            MessageKind::FileTransferCompletedAck,
        )
    };
    wait_until(limit, || staged_acks(&broker) >= completed as usize).await;

    let final_state = supervisor.state();
    match final_state {
        SupervisoryState::Enabled => {
            supervisor.enter_disabled().await?;
            supervisor.enter_standby().await?;
        }
        SupervisoryState::Disabled => {
            supervisor.enter_standby().await?;
        }
        SupervisoryState::Fault => {
            supervisor.reset_from_fault().await?;
        }
        SupervisoryState::Standby => {}
    }
    supervisor.shutdown().await;

    cancel.cancel();
    for task in [Some(controller), forwarder].into_iter().flatten() {
        match task.await {
            Ok(Err(e)) => tracing::warn!(error = %e, "peer stopped with an error"),
            Err(e) => tracing::warn!(error = %e, "peer task panicked"),
            Ok(Ok(())) => {}
        }
    }

    let stats = director.stats().await;
    let mut staged_files = Vec::new();
    for area in [&config.archive.dbb_staging, &config.archive.oods_staging]
        .into_iter()
        .flatten()
    {
        collect_files(area, staging.path(), &mut staged_files)?;
    }
    staged_files.sort();

    Ok(Summary {
        session_id: jobs.session_id().to_string(),
        forwarder: FORWARDER.to_string(),
        images_requested: images,
        images_completed: completed,
        final_state: final_state.to_string(),
        faults: collector.faults(),
        connection_starts: stats.connection_starts,
        connection_stops: stats.connection_stops,
        staged_files,
    })
}

/// Block until nothing is in flight, the device left ENABLED, or `limit`
/// elapsed.
async fn wait_idle(supervisor: &Supervisor, director: &Director, limit: Duration) {
    wait_until(limit, || {
        director.in_flight() == 0 || supervisor.state() != SupervisoryState::Enabled
    })
    .await;
}

async fn wait_until(limit: Duration, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + limit;
    while !done() {
        if Instant::now() >= deadline {
            tracing::warn!(?limit, "gave up waiting");
            return;
        }
        tokio::time::sleep(POLL).await;
    }
}

fn count_kind(messages: &[Message], kind: MessageKind) -> usize {
    messages
        .iter()
        .filter(|m| m.kind().ok() == Some(kind))
        .count()
}

fn collect_files(dir: &Path, root: &Path, out: &mut Vec<String>) -> anyhow::Result<()> {
    if !dir.is_dir() {
        return Ok(());
    }
    for entry in std::fs::read_dir(dir)? {
        let path: PathBuf = entry?.path();
        if path.is_dir() {
            collect_files(&path, root, out)?;
        } else {
            let shown = path.strip_prefix(root).unwrap_or(&path);
            out.push(shown.display().to_string());
        }
    }
    Ok(())
}

fn print_summary(summary: &Summary) {
    println!("session:     {}", summary.session_id);
    println!("forwarder:   {}", summary.forwarder);
    println!(
        "images:      {}/{} archived",
        summary.images_completed, summary.images_requested
    );
    println!("final state: {}", summary.final_state);
    println!(
        "connections: {} started, {} stopped",
        summary.connection_starts, summary.connection_stops
    );

    if !summary.faults.is_empty() {
        println!();
        let rows = summary
            .faults
            .iter()
            .map(|f| vec![f.code.to_string(), f.report.clone()])
            .collect();
        print_table(&["CODE", "REPORT"], rows);
    }

    if !summary.staged_files.is_empty() {
        println!();
        let rows = summary
            .staged_files
            .iter()
            .map(|f| vec![f.clone()])
            .collect();
        print_table(&["STAGED"], rows);
    }
}
