//! Service integration tests against the in-process device simulator

#![allow(clippy::disallowed_methods)]

mod common;

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use common::{eventually, test_config, wait_for_event, Simulator};
use relay_modbus::{CoilAction, ModbusError, PointOptions, SignalValue};
use relaysrv::{RelayService, RelaySrvError};

const CONNECT: Duration = Duration::from_secs(3);

#[tokio::test]
async fn test_reads_coils_and_registers() {
    let sim = Simulator::start().await;
    sim.set_coil(0, true);
    sim.set_coil(2, true);
    sim.set_register(5, 1234);

    let service = RelayService::start(&test_config(sim.port()), CancellationToken::new()).unwrap();
    let handle = service.handle();
    handle.wait_connected(CONNECT).await.unwrap();

    let coils = handle.read_coils(0, 6).await.unwrap();
    assert_eq!(coils, vec![true, false, true, false, false, false]);
    let registers = handle.read_registers(4, 2).await.unwrap();
    assert_eq!(registers, vec![0, 1234]);

    handle.shutdown();
    service.join().await;
}

#[tokio::test]
async fn test_input_change_is_published() {
    let sim = Simulator::start().await;
    let service = RelayService::start(&test_config(sim.port()), CancellationToken::new()).unwrap();
    let handle = service.handle();
    let mut events = handle.subscribe();
    handle.wait_connected(CONNECT).await.unwrap();

    sim.set_coil(3, true);
    assert!(
        wait_for_event(&mut events, "Input 4 State", &SignalValue::Bool(true), CONNECT).await
    );

    handle.shutdown();
    service.join().await;
}

#[tokio::test]
async fn test_coil_action_drives_relay() {
    let sim = Simulator::start().await;
    let service = RelayService::start(&test_config(sim.port()), CancellationToken::new()).unwrap();
    let handle = service.handle();
    let mut events = handle.subscribe();
    handle.wait_connected(CONNECT).await.unwrap();

    handle.coil_action("Relay 1", CoilAction::Close).await.unwrap();
    assert!(eventually(CONNECT, || sim.coil(16)).await);
    assert!(
        wait_for_event(&mut events, "Relay 1 State", &SignalValue::Bool(true), CONNECT).await
    );

    handle.coil_action("relay 1", CoilAction::Open).await.unwrap();
    assert!(eventually(CONNECT, || !sim.coil(16)).await);

    handle.shutdown();
    service.join().await;
}

#[tokio::test]
async fn test_bounce_reverts_after_delay() {
    let sim = Simulator::start().await;
    let service = RelayService::start(&test_config(sim.port()), CancellationToken::new()).unwrap();
    let handle = service.handle();
    handle.wait_connected(CONNECT).await.unwrap();

    handle.coil_action("Relay 2", CoilAction::Bounce).await.unwrap();
    assert!(eventually(CONNECT, || sim.coil(17)).await);
    assert!(eventually(CONNECT, || !sim.coil(17)).await);

    handle.shutdown();
    service.join().await;
}

#[tokio::test]
async fn test_label_addresses_coil_and_mirrors_events() {
    let sim = Simulator::start().await;
    let mut config = test_config(sim.port());
    config.points.insert(
        "Relay 3".to_string(),
        PointOptions {
            invert: false,
            label: Some("Pump".to_string()),
        },
    );
    let service = RelayService::start(&config, CancellationToken::new()).unwrap();
    let handle = service.handle();
    let mut events = handle.subscribe();
    handle.wait_connected(CONNECT).await.unwrap();

    handle.coil_action("pump", CoilAction::State(true)).await.unwrap();
    assert!(wait_for_event(&mut events, "Pump State", &SignalValue::Bool(true), CONNECT).await);
    assert!(sim.coil(18));

    let names = handle.event_names().await.unwrap();
    assert!(names.contains(&"Pump State".to_string()));

    handle.shutdown();
    service.join().await;
}

#[tokio::test]
async fn test_mismatch_recycles_connection() {
    let sim = Simulator::start().await;
    let service = RelayService::start(&test_config(sim.port()), CancellationToken::new()).unwrap();
    let handle = service.handle();
    handle.wait_connected(CONNECT).await.unwrap();

    sim.mismatch_next();
    assert!(eventually(CONNECT, || sim.connections() >= 2).await);
    handle.wait_connected(CONNECT).await.unwrap();

    let stats = handle.stats().await.unwrap();
    assert_eq!(stats.sync_errors, 1);
    assert!(stats.last_sync_error.is_some());
    assert!(stats.epoch >= 1);

    handle.shutdown();
    service.join().await;
}

#[tokio::test]
async fn test_protocol_timeout_recycles_connection() {
    let sim = Simulator::start().await;
    let service = RelayService::start(&test_config(sim.port()), CancellationToken::new()).unwrap();
    let handle = service.handle();
    handle.wait_connected(CONNECT).await.unwrap();

    sim.set_silent(true);
    assert!(eventually(CONNECT, || sim.connections() >= 2).await);
    sim.set_silent(false);

    // Requests sent while the device was silent may still time out once more
    let deadline = tokio::time::Instant::now() + CONNECT;
    let mut read = handle.read_coils(0, 6).await;
    while read.is_err() && tokio::time::Instant::now() < deadline {
        let _ = handle.wait_connected(CONNECT).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        read = handle.read_coils(0, 6).await;
    }
    assert_eq!(read, Ok(vec![false; 6]));

    let stats = handle.stats().await.unwrap();
    assert!(stats.protocol_timeouts >= 1);
    assert!(stats.epoch >= 1);

    handle.shutdown();
    service.join().await;
}

#[tokio::test]
async fn test_requests_rejected_without_device() {
    // Grab a free port, then close it again
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let service = RelayService::start(&test_config(port), CancellationToken::new()).unwrap();
    let handle = service.handle();

    assert_eq!(
        handle.read_coils(0, 6).await,
        Err(RelaySrvError::Modbus(ModbusError::NotConnected))
    );
    assert!(matches!(
        handle.wait_connected(Duration::from_millis(200)).await,
        Err(RelaySrvError::Timeout(_))
    ));
    assert_eq!(
        handle.coil_action("Relay 1", CoilAction::Close).await,
        Err(RelaySrvError::Modbus(ModbusError::NotConnected))
    );

    handle.shutdown();
    service.join().await;
}

#[tokio::test]
async fn test_shutdown_stops_service() {
    let sim = Simulator::start().await;
    let service = RelayService::start(&test_config(sim.port()), CancellationToken::new()).unwrap();
    let handle = service.handle();
    handle.wait_connected(CONNECT).await.unwrap();

    handle.shutdown();
    tokio::time::timeout(Duration::from_secs(2), service.join())
        .await
        .unwrap();
    assert_eq!(handle.read_coils(0, 1).await, Err(RelaySrvError::ServiceStopped));
    assert!(!handle.is_connected());
}
