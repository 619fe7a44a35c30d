//! Shared helpers for peripheral integration tests
//!
//! `FakeTransport` records every request together with its callback and never
//! answers on its own; tests drive completions explicitly. `MockTransport`
//! is a mockall mock for tests that only care about which calls are made.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures::StreamExt;
use mockall::mock;
use tokio::sync::Notify;
use uuid::Uuid;

use blelink::bluetooth::{
    Advertisement, Callback, ConnectOptions, ConnectionEvent, ConnectionResult,
    DiscoveredCharacteristic, DiscoveredService, EventStream, Peripheral, PeripheralId, Transport,
};
use blelink::TransportError;

mock! {
    pub Transport {}

    impl Transport for Transport {
        fn connect(&self, id: &PeripheralId, callback: Callback);
        fn disconnect(&self, id: &PeripheralId, callback: Callback);
        fn discover_services(&self, id: &PeripheralId, callback: Callback);
        fn discover_characteristics(&self, id: &PeripheralId, service: Uuid, callback: Callback);
        fn read_rssi(&self, id: &PeripheralId, callback: Callback);
        fn is_connected(&self, id: &PeripheralId) -> bool;
    }
}

/// Kind of request made to the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Call {
    Connect,
    Disconnect,
    DiscoverServices,
    DiscoverCharacteristics,
    ReadRssi,
}

#[derive(Default)]
struct Calls {
    connect: Vec<Callback>,
    disconnect: Vec<Callback>,
    discover: Vec<Callback>,
    characteristics: Vec<Callback>,
    characteristic_services: Vec<Uuid>,
    read_rssi: Vec<Callback>,
}

impl Calls {
    fn of(&self, call: Call) -> &Vec<Callback> {
        match call {
            Call::Connect => &self.connect,
            Call::Disconnect => &self.disconnect,
            Call::DiscoverServices => &self.discover,
            Call::DiscoverCharacteristics => &self.characteristics,
            Call::ReadRssi => &self.read_rssi,
        }
    }

    fn of_mut(&mut self, call: Call) -> &mut Vec<Callback> {
        match call {
            Call::Connect => &mut self.connect,
            Call::Disconnect => &mut self.disconnect,
            Call::DiscoverServices => &mut self.discover,
            Call::DiscoverCharacteristics => &mut self.characteristics,
            Call::ReadRssi => &mut self.read_rssi,
        }
    }
}

/// Scripted transport
#[derive(Default)]
pub struct FakeTransport {
    connected: AtomicBool,
    calls: Mutex<Calls>,
    changed: Notify,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn record(&self, call: Call, callback: Callback) {
        self.calls.lock().unwrap().of_mut(call).push(callback);
        self.changed.notify_one();
    }

    /// Number of requests of this kind received so far
    pub fn count(&self, call: Call) -> usize {
        self.calls.lock().unwrap().of(call).len()
    }

    /// Callback of the most recent request of this kind
    pub fn last(&self, call: Call) -> Callback {
        self.calls
            .lock()
            .unwrap()
            .of(call)
            .last()
            .cloned()
            .unwrap_or_else(|| panic!("no {:?} request recorded", call))
    }

    /// Wait until the `n`-th request of this kind (1-based) arrives
    pub async fn wait_for(&self, call: Call, n: usize) -> Callback {
        loop {
            if let Some(callback) = self.calls.lock().unwrap().of(call).get(n - 1) {
                return callback.clone();
            }
            self.changed.notified().await;
        }
    }

    /// Services whose characteristics were requested, in request order
    pub fn characteristic_services(&self) -> Vec<Uuid> {
        self.calls.lock().unwrap().characteristic_services.clone()
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Bring the link of the last connect request up
    pub fn complete_connect(&self) {
        self.set_connected(true);
        self.last(Call::Connect).connected();
    }

    /// Report the link of the last connect request lost
    pub fn drop_link(&self, error: Option<TransportError>) {
        self.set_connected(false);
        self.last(Call::Connect).disconnected(error);
    }

    /// Complete the last disconnect request
    pub fn complete_disconnect(&self) {
        self.set_connected(false);
        self.last(Call::Disconnect).disconnected(None);
    }
}

impl Transport for FakeTransport {
    fn connect(&self, _id: &PeripheralId, callback: Callback) {
        self.record(Call::Connect, callback);
    }

    fn disconnect(&self, _id: &PeripheralId, callback: Callback) {
        self.record(Call::Disconnect, callback);
    }

    fn discover_services(&self, _id: &PeripheralId, callback: Callback) {
        self.record(Call::DiscoverServices, callback);
    }

    fn discover_characteristics(&self, _id: &PeripheralId, service: Uuid, callback: Callback) {
        self.calls.lock().unwrap().characteristic_services.push(service);
        self.record(Call::DiscoverCharacteristics, callback);
    }

    fn read_rssi(&self, _id: &PeripheralId, callback: Callback) {
        self.record(Call::ReadRssi, callback);
    }

    fn is_connected(&self, _id: &PeripheralId) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn peripheral(transport: Arc<dyn Transport>) -> Peripheral {
    init_logging();
    Peripheral::new(
        PeripheralId::from("AA:BB:CC:DD:EE:FF"),
        Advertisement::named("Thermometer"),
        -70,
        transport,
    )
}

/// A peripheral driven through a successful connection
pub async fn connected_peripheral(
    fake: &Arc<FakeTransport>,
    options: ConnectOptions,
) -> (Peripheral, EventStream<ConnectionResult>) {
    let peripheral = peripheral(fake.clone());
    let mut events = peripheral.connect(options).await.unwrap();
    fake.complete_connect();
    assert_eq!(next_event(&mut events).await, ConnectionEvent::Connect);
    (peripheral, events)
}

/// Next item of a connection stream, which must be an event
pub async fn next_event(events: &mut EventStream<ConnectionResult>) -> ConnectionEvent {
    match events.next().await {
        Some(Ok(update)) => update.event,
        other => panic!("expected a connection event, got {:?}", other),
    }
}

pub fn service(n: u128) -> DiscoveredService {
    DiscoveredService::primary(Uuid::from_u128(n))
}

pub fn characteristic(service: &DiscoveredService, n: u128) -> DiscoveredCharacteristic {
    DiscoveredCharacteristic {
        uuid: Uuid::from_u128(n),
        service_uuid: service.uuid,
        // read | write
        properties: 0x0a,
    }
}

pub fn transport_error() -> TransportError {
    TransportError::new(133, "GATT error")
}
