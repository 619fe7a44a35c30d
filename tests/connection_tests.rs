//! Connection lifecycle tests

mod common;

use std::sync::Arc;
use std::time::Duration;

use futures::{FutureExt, StreamExt};
use pretty_assertions::assert_eq;
use tokio::time::Instant;

use blelink::bluetooth::{ConnectionState, Termination};
use blelink::{ConnectOptions, ConnectionEvent, PeripheralError};
use common::{connected_peripheral, next_event, peripheral, transport_error, Call, FakeTransport, MockTransport};

#[tokio::test(start_paused = true)]
async fn test_connect_emits_connect() {
    let fake = FakeTransport::new();
    let peripheral = peripheral(fake.clone());
    assert_eq!(peripheral.state(), ConnectionState::Disconnected);

    let mut events = peripheral.connect(ConnectOptions::new()).await.unwrap();
    assert_eq!(fake.count(Call::Connect), 1);
    assert_eq!(peripheral.state(), ConnectionState::Connecting);

    fake.complete_connect();
    let update = events.next().await.unwrap().unwrap();

    assert_eq!(update.event, ConnectionEvent::Connect);
    assert_eq!(update.peripheral.state, ConnectionState::Connected);
    assert_eq!(update.peripheral.name(), Some("Thermometer"));
    assert_eq!(peripheral.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_connect_while_connected_makes_no_transport_call() {
    let mut mock = MockTransport::new();
    mock.expect_is_connected().return_const(true);
    mock.expect_connect().never();
    mock.expect_disconnect().times(1).return_const(());

    let peripheral = peripheral(Arc::new(mock));
    assert_eq!(peripheral.state(), ConnectionState::Connected);

    let mut events = peripheral.connect(ConnectOptions::new()).await.unwrap();
    assert_eq!(peripheral.state(), ConnectionState::Connected);
    assert!(events.next().now_or_never().is_none());

    // The task is still alive and the link can be closed
    peripheral.disconnect().await.unwrap();
    assert_eq!(peripheral.state(), ConnectionState::Disconnecting);
}

#[tokio::test(start_paused = true)]
async fn test_connect_twice_while_connecting() {
    let fake = FakeTransport::new();
    let peripheral = peripheral(fake.clone());

    let _first = peripheral.connect(ConnectOptions::new()).await.unwrap();
    let mut second = peripheral.connect(ConnectOptions::new()).await.unwrap();
    assert_eq!(fake.count(Call::Connect), 1);

    fake.complete_connect();
    assert_eq!(next_event(&mut second).await, ConnectionEvent::Connect);
}

#[tokio::test(start_paused = true)]
async fn test_connect_error_is_surfaced() {
    let fake = FakeTransport::new();
    let peripheral = peripheral(fake.clone());
    let mut events = peripheral.connect(ConnectOptions::new()).await.unwrap();

    fake.last(Call::Connect).failed_to_connect(transport_error());

    let error = events.next().await.unwrap().unwrap_err();
    assert_eq!(error, PeripheralError::Transport(transport_error()));
    assert_eq!(error.transport_code(), Some(133));
    assert_eq!(peripheral.state(), ConnectionState::Disconnected);

    // Nothing to disconnect from
    peripheral.disconnect().await.unwrap();
    assert_eq!(events.next().await, Some(Err(PeripheralError::Disconnected)));
    assert_eq!(fake.count(Call::Disconnect), 0);
}

#[tokio::test(start_paused = true)]
async fn test_forced_disconnect() {
    let fake = FakeTransport::new();
    let (peripheral, mut events) = connected_peripheral(&fake, ConnectOptions::new()).await;

    peripheral.disconnect().await.unwrap();
    assert_eq!(peripheral.state(), ConnectionState::Disconnecting);
    assert_eq!(fake.count(Call::Disconnect), 1);

    fake.complete_disconnect();
    assert_eq!(next_event(&mut events).await, ConnectionEvent::ForceDisconnect);
    assert_eq!(peripheral.state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_while_connecting_abandons_attempt() {
    let fake = FakeTransport::new();
    let peripheral = peripheral(fake.clone());
    let mut events = peripheral.connect(ConnectOptions::new()).await.unwrap();

    peripheral.disconnect().await.unwrap();
    assert_eq!(fake.count(Call::Disconnect), 1);
    assert_eq!(next_event(&mut events).await, ConnectionEvent::ForceDisconnect);
    assert_eq!(peripheral.state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_link_loss_without_error() {
    let fake = FakeTransport::new();
    let (peripheral, mut events) = connected_peripheral(&fake, ConnectOptions::new()).await;

    fake.drop_link(None);

    assert_eq!(next_event(&mut events).await, ConnectionEvent::Disconnect);
    assert_eq!(peripheral.state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_link_loss_with_error() {
    let fake = FakeTransport::new();
    let (peripheral, mut events) = connected_peripheral(&fake, ConnectOptions::new()).await;

    peripheral.link_callback().disconnected(Some(transport_error()));

    assert_eq!(
        events.next().await,
        Some(Err(PeripheralError::Transport(transport_error())))
    );
    assert_eq!(peripheral.state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_fires_after_configured_duration() {
    let fake = FakeTransport::new();
    let peripheral = peripheral(fake.clone());
    let start = Instant::now();

    let mut events = peripheral
        .connect(ConnectOptions::new().with_timeout(Duration::from_millis(250)))
        .await
        .unwrap();

    assert_eq!(next_event(&mut events).await, ConnectionEvent::Timeout);
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(250), "fired after {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(350), "fired after {:?}", elapsed);

    // The pending attempt was abandoned
    assert_eq!(fake.count(Call::Disconnect), 1);
    assert_eq!(peripheral.state(), ConnectionState::Disconnected);

    // Exactly one timeout per attempt
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(events.next().now_or_never().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_late_connect_after_timeout_is_ignored() {
    let fake = FakeTransport::new();
    let peripheral = peripheral(fake.clone());
    let mut events = peripheral
        .connect(ConnectOptions::new().with_timeout(Duration::from_millis(250)))
        .await
        .unwrap();
    assert_eq!(next_event(&mut events).await, ConnectionEvent::Timeout);

    fake.complete_connect();
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(peripheral.state(), ConnectionState::Disconnected);
    assert!(events.next().now_or_never().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_timeout_budget_exhausted() {
    let fake = FakeTransport::new();
    let peripheral = peripheral(fake.clone());
    let options = ConnectOptions::new()
        .with_timeout(Duration::from_millis(250))
        .with_timeout_retries(1);

    let mut events = peripheral.connect(options).await.unwrap();
    assert_eq!(next_event(&mut events).await, ConnectionEvent::Timeout);

    peripheral.reconnect().await.unwrap();
    assert_eq!(fake.count(Call::Connect), 2);
    assert_eq!(next_event(&mut events).await, ConnectionEvent::GiveUp);

    // The stream ends after giving up
    assert!(events.next().await.is_none());
    assert_eq!(
        peripheral.state(),
        ConnectionState::Terminated(Termination::GiveUp)
    );
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_budget_exhausted() {
    let fake = FakeTransport::new();
    let (peripheral, mut events) =
        connected_peripheral(&fake, ConnectOptions::new().with_disconnect_retries(1)).await;

    fake.drop_link(None);
    assert_eq!(next_event(&mut events).await, ConnectionEvent::Disconnect);

    peripheral.reconnect().await.unwrap();
    fake.complete_connect();
    assert_eq!(next_event(&mut events).await, ConnectionEvent::Connect);

    fake.drop_link(None);
    assert_eq!(next_event(&mut events).await, ConnectionEvent::GiveUp);
    assert!(events.next().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_forced_disconnect_budget_exhausted() {
    let fake = FakeTransport::new();
    let (peripheral, mut events) =
        connected_peripheral(&fake, ConnectOptions::new().with_disconnect_retries(1)).await;

    peripheral.disconnect().await.unwrap();
    fake.complete_disconnect();
    assert_eq!(next_event(&mut events).await, ConnectionEvent::ForceDisconnect);

    peripheral.reconnect().await.unwrap();
    fake.complete_connect();
    assert_eq!(next_event(&mut events).await, ConnectionEvent::Connect);

    peripheral.disconnect().await.unwrap();
    fake.complete_disconnect();
    assert_eq!(next_event(&mut events).await, ConnectionEvent::GiveUp);
    assert_eq!(peripheral.state(), ConnectionState::Terminated(Termination::GiveUp));
    assert!(events.next().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_is_connected_follows_state() {
    let fake = FakeTransport::new();
    let peripheral = peripheral(fake.clone());
    assert!(!peripheral.is_connected());

    let mut events = peripheral.connect(ConnectOptions::new()).await.unwrap();
    assert!(!peripheral.is_connected());

    fake.complete_connect();
    assert_eq!(next_event(&mut events).await, ConnectionEvent::Connect);
    assert!(peripheral.is_connected());

    fake.drop_link(None);
    assert_eq!(next_event(&mut events).await, ConnectionEvent::Disconnect);
    assert!(!peripheral.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_error_consumes_budget() {
    let fake = FakeTransport::new();
    let (peripheral, mut events) =
        connected_peripheral(&fake, ConnectOptions::new().with_disconnect_retries(1)).await;

    fake.drop_link(Some(transport_error()));
    assert_eq!(
        events.next().await,
        Some(Err(PeripheralError::Transport(transport_error())))
    );

    peripheral.reconnect().await.unwrap();
    fake.complete_connect();
    assert_eq!(next_event(&mut events).await, ConnectionEvent::Connect);

    fake.drop_link(Some(transport_error()));
    assert_eq!(next_event(&mut events).await, ConnectionEvent::GiveUp);
}

#[tokio::test(start_paused = true)]
async fn test_stale_connect_callback_is_ignored() {
    let fake = FakeTransport::new();
    let peripheral = peripheral(fake.clone());
    let mut events = peripheral.connect(ConnectOptions::new()).await.unwrap();
    let stale = fake.last(Call::Connect);

    peripheral.disconnect().await.unwrap();
    assert_eq!(next_event(&mut events).await, ConnectionEvent::ForceDisconnect);

    peripheral.reconnect().await.unwrap();
    assert_eq!(fake.count(Call::Connect), 2);

    stale.connected();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(peripheral.state(), ConnectionState::Connecting);
    assert!(events.next().now_or_never().is_none());

    fake.complete_connect();
    assert_eq!(next_event(&mut events).await, ConnectionEvent::Connect);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_after_give_up_is_noop() {
    let fake = FakeTransport::new();
    let peripheral = peripheral(fake.clone());
    let options = ConnectOptions::new()
        .with_timeout(Duration::from_millis(100))
        .with_timeout_retries(0);

    let mut events = peripheral.connect(options).await.unwrap();
    assert_eq!(next_event(&mut events).await, ConnectionEvent::GiveUp);

    peripheral.reconnect().await.unwrap();
    assert_eq!(fake.count(Call::Connect), 1);
    assert!(events.next().await.is_none());

    // A fresh connect() starts over
    let mut events = peripheral.connect(ConnectOptions::new()).await.unwrap();
    assert_eq!(fake.count(Call::Connect), 2);
    fake.complete_connect();
    assert_eq!(next_event(&mut events).await, ConnectionEvent::Connect);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_before_connect_is_noop() {
    let fake = FakeTransport::new();
    let peripheral = peripheral(fake.clone());

    peripheral.reconnect().await.unwrap();

    assert_eq!(fake.count(Call::Connect), 0);
    assert_eq!(peripheral.state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_handles_share_state() {
    let fake = FakeTransport::new();
    let (peripheral, _events) = connected_peripheral(&fake, ConnectOptions::new()).await;
    let other = peripheral.clone();

    assert_eq!(other.state(), ConnectionState::Connected);
    assert_eq!(other.id(), peripheral.id());
    assert_eq!(other.rssi(), -70);
}
