mod common;

use archiver_core::broker::Broker;
use archiver_core::director::TransactionKind;
use archiver_core::event::{FileObjectEvent, ImageEvent};
use archiver_core::fault::FaultCode;
use archiver_core::message::{field, Message, MessageKind};
use archiver_core::supervisor::SupervisoryState;
use archiver_core::ArchiverError;
use common::{forwarder_queue, quiet_config, settle, Harness};
use std::time::Duration;

fn new_item_ack(job: u64, target_dir: &str) -> Message {
    Message::new(MessageKind::NewItemAck)
        .with(field::JOB_NUM, job)
        .with(field::TARGET_DIR, target_dir)
        .with(field::ACK_BOOL, "TRUE")
}

// ---------------------------------------------------------------------------
// Chained exposure handshake
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn new_item_ack_chains_xfer_params() {
    let h = Harness::new(quiet_config(), &["f1"]).await;
    h.enable().await;

    let accepted = h
        .supervisor
        .integration_start(&ImageEvent::new(42, "S1", "AT_O_20200220_000042"))
        .await
        .unwrap();
    assert!(accepted);

    let archive_queue = &h.config.queues.archive_consume;
    let new_items = h.sent(archive_queue, "NEW_ITEM");
    assert_eq!(new_items.len(), 1);
    assert_eq!(new_items[0].get_u64(field::JOB_NUM), Some(42));
    assert_eq!(new_items[0].get_str(field::SESSION_ID), Some("S1"));
    assert_eq!(
        new_items[0].get_str(field::REPLY_QUEUE),
        Some(h.config.queues.reply.as_str())
    );
    assert!(new_items[0].get_str(field::ACK_ID).is_some());

    h.reply(new_item_ack(42, "/x/y")).await;

    let fwdr = forwarder_queue("f1");
    let xfer = h.sent(&fwdr, "XFER_PARAMS");
    assert_eq!(xfer.len(), 1);
    let location = xfer[0].get_str(field::TARGET_LOCATION).unwrap();
    assert!(location.ends_with("/x/y"), "{location}");
    assert_eq!(location, "ARC@archive.example:/x/y");
    assert_eq!(xfer[0].get_str(field::SESSION_ID), Some("S1"));
    assert_eq!(xfer[0].get_str(field::IMAGE_ID), Some("AT_O_20200220_000042"));
    let params = xfer[0].get(field::XFER_PARAMS).unwrap();
    assert_eq!(params[field::AT_FWDR], "f1");
    assert_eq!(params[field::RAFT_CCD_LIST][0][0], "00");

    let director = h.director();
    assert!(!director.is_pending(TransactionKind::NewItem, 42));
    assert!(director.is_pending(TransactionKind::IntegrationStart, 42));

    h.reply(Message::new(MessageKind::XferParamsAck).with(field::JOB_NUM, 42))
        .await;
    assert_eq!(director.in_flight(), 0);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert!(h.recorder.fault_codes().is_empty());
    assert_eq!(h.supervisor.state(), SupervisoryState::Enabled);
}

#[tokio::test(start_paused = true)]
async fn missing_new_item_ack_faults_with_step_one_code() {
    let h = Harness::new(quiet_config(), &["f1"]).await;
    h.enable().await;
    h.supervisor
        .integration_start(&ImageEvent::new(42, "S1", "AT_O_42"))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(60)).await;

    assert_eq!(
        h.recorder.fault_codes(),
        vec![FaultCode::NewItemTimeout.code()]
    );
    assert!(h.sent(&forwarder_queue("f1"), "XFER_PARAMS").is_empty());
    assert_eq!(h.supervisor.state(), SupervisoryState::Fault);
    assert_eq!(h.director().running_heartbeats().await, 0);

    // A straggling ack after the fault sends nothing.
    h.reply(new_item_ack(42, "/x/y")).await;
    assert!(h.sent(&forwarder_queue("f1"), "XFER_PARAMS").is_empty());
}

#[tokio::test(start_paused = true)]
async fn missing_xfer_params_ack_faults_with_step_two_code() {
    let h = Harness::new(quiet_config(), &["f1"]).await;
    h.enable().await;
    h.supervisor
        .integration_start(&ImageEvent::new(7, "S1", "AT_O_7"))
        .await
        .unwrap();
    h.reply(new_item_ack(7, "/x/y")).await;

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(
        h.recorder.fault_codes(),
        vec![FaultCode::XferParamsTimeout.code()]
    );
}

#[tokio::test(start_paused = true)]
async fn duplicate_ack_runs_no_second_follow_up() {
    let h = Harness::new(quiet_config(), &["f1"]).await;
    h.enable().await;
    h.supervisor
        .integration_start(&ImageEvent::new(5, "S1", "AT_O_5"))
        .await
        .unwrap();

    h.reply(new_item_ack(5, "/x/y")).await;
    h.reply(new_item_ack(5, "/x/y")).await;

    assert_eq!(h.sent(&forwarder_queue("f1"), "XFER_PARAMS").len(), 1);
    assert!(h.recorder.fault_codes().is_empty());
}

#[tokio::test(start_paused = true)]
async fn ack_without_target_dir_leaves_step_one_armed() {
    let h = Harness::new(quiet_config(), &["f1"]).await;
    h.enable().await;
    h.supervisor
        .integration_start(&ImageEvent::new(8, "S1", "AT_O_8"))
        .await
        .unwrap();

    h.reply(Message::new(MessageKind::NewItemAck).with(field::JOB_NUM, 8))
        .await;
    assert!(h.director().is_pending(TransactionKind::NewItem, 8));

    h.reply(new_item_ack(8, "/data/2020-02-20/")).await;
    assert_eq!(h.sent(&forwarder_queue("f1"), "XFER_PARAMS").len(), 1);
}

#[tokio::test(start_paused = true)]
async fn malformed_and_unknown_messages_are_dropped() {
    let h = Harness::new(quiet_config(), &["f1"]).await;
    h.enable().await;
    h.supervisor
        .integration_start(&ImageEvent::new(3, "S1", "AT_O_3"))
        .await
        .unwrap();

    h.reply(Message::default().with(field::JOB_NUM, 3)).await;
    h.reply(Message::default().with(field::MSG_TYPE, "AT_FWDR_PARAMS_ACK"))
        .await;
    h.reply(Message::new(MessageKind::EndReadoutAck)).await;
    h.reply(Message::new(MessageKind::EndReadoutAck).with(field::JOB_NUM, 99))
        .await;

    // The director is still listening.
    h.reply(new_item_ack(3, "/x/y")).await;
    assert_eq!(h.sent(&forwarder_queue("f1"), "XFER_PARAMS").len(), 1);
    assert!(h.recorder.fault_codes().is_empty());
}

// ---------------------------------------------------------------------------
// Single-step transactions
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn end_readout_and_header_ready_go_to_the_forwarder() {
    let h = Harness::new(quiet_config(), &["f1"]).await;
    h.enable().await;

    let mut readout = ImageEvent::new(11, "S1", "AT_O_11");
    readout.image_sequence_name = "seq".into();
    readout.images_in_sequence = 3;
    assert!(h.supervisor.end_readout(&readout).await.unwrap());
    let header = FileObjectEvent::new(11, "S1", "AT_O_11", "http://hdr/AT_O_11.header");
    assert!(h.supervisor.large_file_object_available(&header).await.unwrap());

    let fwdr = forwarder_queue("f1");
    let end = &h.sent(&fwdr, "END_READOUT")[0];
    assert_eq!(end.get_str(field::IMAGE_SEQUENCE_NAME), Some("seq"));
    assert_eq!(end.get_u64(field::IMAGES_IN_SEQUENCE), Some(3));
    let ready = &h.sent(&fwdr, "HEADER_READY")[0];
    assert_eq!(ready.get_str(field::FILENAME), Some("http://hdr/AT_O_11.header"));
    assert_ne!(end.get_str(field::ACK_ID), ready.get_str(field::ACK_ID));

    h.reply(Message::new(MessageKind::EndReadoutAck).with(field::JOB_NUM, 11))
        .await;
    h.reply(Message::new(MessageKind::HeaderReadyAck).with(field::JOB_NUM, "11"))
        .await;
    assert_eq!(h.director().in_flight(), 0);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert!(h.recorder.fault_codes().is_empty());
}

#[tokio::test(start_paused = true)]
async fn missing_end_readout_ack_faults() {
    let h = Harness::new(quiet_config(), &["f1"]).await;
    h.enable().await;
    h.supervisor
        .end_readout(&ImageEvent::new(12, "S1", "AT_O_12"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(
        h.recorder.fault_codes(),
        vec![FaultCode::EndReadoutTimeout.code()]
    );
}

#[tokio::test(start_paused = true)]
async fn events_outside_enabled_are_dropped() {
    let h = Harness::new(quiet_config(), &["f1"]).await;
    h.supervisor.enter_disabled().await.unwrap();

    let accepted = h
        .supervisor
        .integration_start(&ImageEvent::new(1, "S1", "AT_O_1"))
        .await
        .unwrap();
    assert!(!accepted);
    assert!(h.sent(&h.config.queues.archive_consume, "NEW_ITEM").is_empty());
    assert_eq!(h.director().in_flight(), 0);
}

#[tokio::test(start_paused = true)]
async fn telemetry_is_relayed_as_processing_status() {
    let h = Harness::new(quiet_config(), &["f1"]).await;
    h.supervisor.enter_disabled().await.unwrap();
    h.broker
        .publish(
            &h.config.queues.telemetry,
            Message::new(MessageKind::Telemetry)
                .with(field::STATUS_CODE, 0)
                .with(field::DESCRIPTION, "transfer ok"),
        )
        .await
        .unwrap();
    settle().await;
    assert_eq!(
        *h.recorder.status.lock().unwrap(),
        vec![(0, "transfer ok".to_string())]
    );
}

#[tokio::test(start_paused = true)]
async fn unreachable_broker_faults_with_publish_code() {
    let h = Harness::new(quiet_config(), &["f1"]).await;
    h.enable().await;
    h.broker.set_unreachable(true);

    let err = h
        .supervisor
        .integration_start(&ImageEvent::new(2, "S1", "AT_O_2"))
        .await
        .unwrap_err();
    assert!(matches!(err, ArchiverError::PublishFailure { .. }));
    h.wait_for_state(SupervisoryState::Fault).await;
    assert_eq!(
        h.recorder.fault_codes(),
        vec![FaultCode::PublishFailure.code()]
    );
}
