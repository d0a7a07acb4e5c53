//! Session tests against a mock FAH client on a local socket.

mod common;

use common::{
    log_body, test_services, wait_until, GatedRepository, MockFahServer, LOG, SLOTS, UNITS,
};
use foldwatch::benchmark::BenchmarkIdentifier;
use foldwatch::config::ClientSettings;
use foldwatch::prom_metrics::MessageLabel;
use foldwatch::repository::WorkUnitRepository;
use foldwatch::session::{ClientSession, SessionOptions};
use foldwatch::slot::{SlotIdentifier, SlotStatus};
use std::sync::Arc;
use std::time::Duration;

fn session_for(server: &MockFahServer, password: &str) -> (Arc<ClientSession>, common::TestServices) {
    let mut settings = ClientSettings::new("rig", "127.0.0.1", server.port);
    settings.password = password.to_string();
    let services = test_services();
    let session = Arc::new(ClientSession::new(
        settings,
        SessionOptions::default(),
        services.services.clone(),
    ));
    (session, services)
}

fn send_client_state(server: &MockFahServer) {
    server.send("slots", SLOTS);
    server.send("units", UNITS);
    server.send("log-restart", &log_body(LOG));
}

// ── Connect and subscribe ──

#[tokio::test]
async fn connect_authenticates_then_subscribes_in_order() {
    let server = MockFahServer::start().await;
    let (session, _services) = session_for(&server, "secret");
    session.connect().await.unwrap();
    assert!(session.is_connected());

    let commands = server.wait_for_commands(8).await;
    assert_eq!(
        commands,
        vec![
            "auth secret",
            "updates clear",
            "log-updates restart",
            "updates add 0 60 $heartbeat",
            "updates add 1 1 $info",
            "updates add 2 1 $(options -a)",
            "updates add 3 1 $slot-info",
            "queue-info",
        ]
    );
    session.close().await;
}

#[tokio::test]
async fn no_auth_without_password() {
    let server = MockFahServer::start().await;
    let (session, _services) = session_for(&server, "");
    session.connect().await.unwrap();
    let commands = server.wait_for_commands(7).await;
    assert_eq!(commands[0], "updates clear");
    session.close().await;
}

// ── Retrieve ──

/// Slots, units and the log arriving trigger a retrieve that stores the
/// finished unit, benchmarks its frames and tracks the running one.
#[tokio::test]
async fn full_state_drives_retrieve() {
    let server = MockFahServer::start().await;
    let (session, services) = session_for(&server, "");
    session.connect().await.unwrap();
    send_client_state(&server);

    wait_until(|| {
        session
            .slots()
            .first()
            .is_some_and(|s| s.work_unit_model.is_some())
    })
    .await;

    let slots = session.slots();
    assert_eq!(slots.len(), 1);
    let slot = &slots[0];
    assert_eq!(slot.status, SlotStatus::Running);
    assert_eq!(slot.queue.len(), 2);
    let current = slot.work_unit_model.as_ref().unwrap();
    assert_eq!(current.work_unit.key.project, 2670);
    assert_eq!(current.work_unit.queue_id, 1);

    assert_eq!(services.repository.len(), 1);
    assert_eq!(slot.counts.total_completed, 1);
    assert_eq!(slot.counts.run_completed, 1);
    assert_eq!(slot.counts.total_failed, 0);

    let slot_id = SlotIdentifier::new("rig", format!("127.0.0.1:{}", server.port), 0);
    assert_eq!(services.benchmarks.get_benchmark_projects(&slot_id), vec![2669, 2670]);
    let id = BenchmarkIdentifier::new(slot_id, 2669);
    let benchmark = services.benchmarks.get_benchmark(&id).unwrap();
    assert_eq!(benchmark.average_frame_time(), Duration::from_secs(300));

    let metrics = services.metrics.encode().unwrap();
    assert!(metrics.contains("foldwatch_work_units_stored_total{client=\"rig\"} 1"));
    session.close().await;
}

#[tokio::test]
async fn repeated_retrieve_does_not_duplicate_history() {
    let server = MockFahServer::start().await;
    let (session, services) = session_for(&server, "");
    session.connect().await.unwrap();
    send_client_state(&server);
    wait_until(|| services.repository.len() == 1).await;

    session.retrieve().await;
    session.retrieve().await;
    assert_eq!(services.repository.len(), 1);
    session.close().await;
}

#[tokio::test]
async fn duplicate_units_message_does_not_retrieve_again() {
    let server = MockFahServer::start().await;
    let (session, services) = session_for(&server, "");
    session.connect().await.unwrap();
    send_client_state(&server);
    wait_until(|| {
        services
            .metrics
            .encode()
            .unwrap()
            .contains("foldwatch_retrieve_seconds_count 1")
    })
    .await;

    server.send("units", UNITS);
    // A later message proves the duplicate was read.
    server.send("slots", &SLOTS.replace("RUNNING", "PAUSED"));
    wait_until(|| session.slots()[0].status == SlotStatus::Paused).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let units = MessageLabel {
        client: "rig".into(),
        message_type: "units".into(),
    };
    assert_eq!(services.metrics.messages_received.get_or_create(&units).get(), 1);
    assert!(services
        .metrics
        .encode()
        .unwrap()
        .contains("foldwatch_retrieve_seconds_count 1"));
    assert_eq!(services.repository.len(), 1);
    session.close().await;
}

/// Slot info that lands while a retrieve is waiting on history must survive
/// the retrieve's write-back.
#[tokio::test]
async fn slot_info_during_retrieve_is_kept() {
    let server = MockFahServer::start().await;
    let settings = ClientSettings::new("rig", "127.0.0.1", server.port);
    let mut services = test_services().services;
    let repository = Arc::new(GatedRepository::new());
    let history: Arc<dyn WorkUnitRepository> = repository.clone();
    services.repository = history;
    let session = Arc::new(ClientSession::new(settings, SessionOptions::default(), services));
    session.connect().await.unwrap();

    let two_slots = r#"[{"id": "00", "status": "RUNNING", "description": "cpu:4", "options": {}, "reason": "", "idle": False},
                        {"id": "01", "status": "READY", "description": "cpu:2", "options": {}, "reason": "", "idle": False}]"#;
    server.send("slots", two_slots);
    server.send("units", UNITS);
    server.send("log-restart", &log_body(LOG));
    wait_until(|| repository.waiting() > 0).await;
    assert_eq!(session.slots().len(), 2);

    server.send("slots", &SLOTS.replace("RUNNING", "PAUSED"));
    wait_until(|| session.slots().len() == 1).await;

    repository.open();
    wait_until(|| session.slots()[0].work_unit_model.is_some()).await;

    let slots = session.slots();
    assert_eq!(slots.len(), 1);
    assert_eq!(slots[0].slot_id(), 0);
    assert_eq!(slots[0].status, SlotStatus::Paused);
    assert_eq!(slots[0].work_unit_model.as_ref().unwrap().work_unit.key.project, 2670);
    assert_eq!(repository.len(), 1);
    session.close().await;
}

#[tokio::test]
async fn log_gap_requests_restart() {
    let server = MockFahServer::start().await;
    let (session, _services) = session_for(&server, "");
    session.connect().await.unwrap();
    server.wait_for_commands(7).await;
    server.send("log-restart", &log_body("17:00:01:one\n17:00:02:two"));
    server.send("log-update", r#"{"start": 40, "text": "17:00:40:far ahead\n"}"#);

    wait_until(|| {
        server
            .commands()
            .iter()
            .filter(|c| *c == "log-updates restart")
            .count()
            == 2
    })
    .await;
    session.close().await;
}

// ── Commands ──

#[tokio::test]
async fn slot_commands_reach_client() {
    let server = MockFahServer::start().await;
    let (session, _services) = session_for(&server, "");
    session.connect().await.unwrap();
    server.wait_for_commands(7).await;

    session.pause(Some(0)).await;
    session.fold(None).await;
    session.finish(Some(1)).await;
    let commands = server.wait_for_commands(10).await;
    assert_eq!(&commands[7..], &["pause 0", "unpause", "finish 1"]);
    session.close().await;
}

#[tokio::test]
async fn commands_while_offline_are_ignored() {
    let server = MockFahServer::start().await;
    let (session, _services) = session_for(&server, "");
    session.pause(None).await;
    assert!(!session.is_connected());
}

// ── Closing ──

#[tokio::test]
async fn closing_mid_read_leaves_session_offline() {
    let server = MockFahServer::start().await;
    let (session, services) = session_for(&server, "");
    session.connect().await.unwrap();
    // Half a frame: the read loop is parked inside a message.
    server.send_raw("PyON 1 units\n[\n");
    tokio::time::sleep(Duration::from_millis(50)).await;

    session.close().await;
    assert!(!session.is_connected());
    let slots = session.slots();
    assert_eq!(slots.len(), 1);
    assert_eq!(slots[0].status, SlotStatus::Offline);
    assert!(services.repository.is_empty());

    // Closing again is harmless.
    session.close().await;
    assert!(services.metrics.encode().unwrap().contains("foldwatch_clients_connected 0"));
}

#[tokio::test]
async fn server_hang_up_closes_session() {
    let server = MockFahServer::start().await;
    let (session, _services) = session_for(&server, "");
    session.connect().await.unwrap();
    server.send("slots", SLOTS);
    wait_until(|| session.slots()[0].slot.has_slot()).await;

    server.hang_up();
    wait_until(|| !session.is_connected()).await;
    wait_until(|| session.slots()[0].status == SlotStatus::Offline).await;
}

#[tokio::test]
async fn connect_failure_leaves_session_offline() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let services = test_services();
    let session = Arc::new(ClientSession::new(
        ClientSettings::new("rig", "127.0.0.1", port),
        SessionOptions::default(),
        services.services.clone(),
    ));
    assert!(session.connect().await.is_err());
    assert!(!session.is_connected());
    assert_eq!(session.slots()[0].status, SlotStatus::Offline);
}
