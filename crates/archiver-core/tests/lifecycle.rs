mod common;

use archiver_core::archive_controller::ArchiveController;
use archiver_core::fault::FaultCode;
use archiver_core::scoreboard::{LeaseRegistry, PeerDescriptor};
use archiver_core::supervisor::SupervisoryState;
use archiver_core::ArchiverError;
use common::{quiet_config, settle, Harness};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[tokio::test(start_paused = true)]
async fn fault_cycle_starts_and_stops_connections_twice() {
    let mut config = quiet_config();
    config.timing.heartbeat_interval_ms = 5_000;
    // Two forwarders: a fault keeps the first lease out of the pool.
    let h = Harness::new(config.clone(), &["f1", "f2"]).await;
    let cancel = CancellationToken::new();
    let archive = ArchiveController::new(config, Arc::new(h.broker.clone())).spawn(cancel.clone());
    let director = h.director().clone();

    assert_eq!(h.supervisor.state(), SupervisoryState::Standby);
    h.supervisor.enter_disabled().await.unwrap();
    assert_eq!(director.connection_starts(), 1);
    assert_eq!(director.running_heartbeats().await, 2);
    assert_eq!(director.paired_forwarder().unwrap().hostname, "f1");

    // Nobody answers f1's heartbeat; the archive controller answers its own.
    h.wait_for_state(SupervisoryState::Fault).await;
    assert_eq!(director.connection_stops(), 1);
    assert_eq!(director.running_heartbeats().await, 0);
    assert_eq!(
        h.recorder.fault_codes(),
        vec![FaultCode::ForwarderHeartbeat.code()]
    );
    assert_eq!(h.board.get_state().as_deref(), Some("FAULT"));

    h.supervisor.reset_from_fault().await.unwrap();
    assert_eq!(h.supervisor.state(), SupervisoryState::Standby);

    h.supervisor.enter_disabled().await.unwrap();
    assert_eq!(director.connection_starts(), 2);
    assert_eq!(director.paired_forwarder().unwrap().hostname, "f2");

    h.supervisor.enter_standby().await.unwrap();
    assert_eq!(director.connection_stops(), 2);
    assert_eq!(director.running_heartbeats().await, 0);
    assert!(director.paired_forwarder().is_none());

    // Nothing keeps probing once connections are down.
    let published = h.broker.history().len();
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(h.broker.history().len(), published);
    assert_eq!(h.recorder.fault_codes().len(), 1);

    // f2 was released by the orderly standby; f1 stays leased.
    assert_eq!(h.board.available_peers(), 1);
    assert!(h.board.get_paired().await.unwrap().is_none());

    cancel.cancel();
    archive.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn enable_and_disable_are_label_changes() {
    let h = Harness::new(quiet_config(), &["f1"]).await;
    h.supervisor.enter_disabled().await.unwrap();
    h.supervisor.enter_enabled().await.unwrap();
    h.supervisor.enter_disabled().await.unwrap();
    h.supervisor.enter_enabled().await.unwrap();

    let director = h.director();
    assert_eq!(director.connection_starts(), 1);
    assert_eq!(director.connection_stops(), 0);
    assert_eq!(h.board.get_state().as_deref(), Some("ENABLED"));
}

#[tokio::test(start_paused = true)]
async fn invalid_transitions_are_rejected_without_side_effects() {
    let h = Harness::new(quiet_config(), &["f1"]).await;

    let err = h.supervisor.enter_enabled().await.unwrap_err();
    assert!(matches!(err, ArchiverError::InvalidTransition { .. }));
    assert_eq!(h.supervisor.state(), SupervisoryState::Standby);

    let err = h.supervisor.reset_from_fault().await.unwrap_err();
    assert!(matches!(err, ArchiverError::InvalidTransition { .. }));

    h.supervisor.enter_disabled().await.unwrap();
    h.supervisor.enter_enabled().await.unwrap();
    let err = h.supervisor.enter_standby().await.unwrap_err();
    assert!(matches!(err, ArchiverError::InvalidTransition { .. }));
    assert_eq!(h.supervisor.state(), SupervisoryState::Enabled);
    assert_eq!(h.director().connection_stops(), 0);
}

#[tokio::test(start_paused = true)]
async fn empty_registry_faults_the_start() {
    let h = Harness::new(quiet_config(), &[]).await;

    let err = h.supervisor.enter_disabled().await.unwrap_err();
    assert!(matches!(err, ArchiverError::NoPeerAvailable));
    assert_eq!(h.supervisor.state(), SupervisoryState::Fault);
    assert_eq!(
        h.recorder.fault_codes(),
        vec![FaultCode::NoForwarderAvailable.code()]
    );
    assert_eq!(h.director().connection_starts(), 0);

    // Recoverable once a forwarder shows up.
    h.supervisor.reset_from_fault().await.unwrap();
    h.board
        .push_peer(&PeerDescriptor::new("late", "10.0.0.9", "late_consume"))
        .await
        .unwrap();
    h.supervisor.enter_disabled().await.unwrap();
    assert_eq!(h.director().paired_forwarder().unwrap().hostname, "late");
}

#[tokio::test(start_paused = true)]
async fn simultaneous_faults_escalate_once() {
    let mut config = quiet_config();
    config.timing.heartbeat_interval_ms = 5_000;
    // No archive controller and a silent forwarder: both heartbeats miss.
    let h = Harness::new(config, &["f1"]).await;
    h.supervisor.enter_disabled().await.unwrap();

    tokio::time::sleep(Duration::from_secs(60)).await;
    settle().await;

    assert_eq!(h.supervisor.state(), SupervisoryState::Fault);
    assert_eq!(h.recorder.fault_codes().len(), 1);
    assert_eq!(h.supervisor.faults_raised(), 1);
}

#[tokio::test(start_paused = true)]
async fn shutdown_releases_the_lease() {
    let h = Harness::new(quiet_config(), &["f1"]).await;
    h.supervisor.enter_disabled().await.unwrap();
    assert_eq!(h.board.available_peers(), 0);

    let board = Arc::clone(&h.board);
    let broker = h.broker.clone();
    let reply = h.config.queues.reply.clone();
    h.supervisor.shutdown().await;

    assert_eq!(board.available_peers(), 1);
    assert!(!broker.has_consumer(&reply));
    assert!(board.get_paired().await.unwrap().is_none());
}
