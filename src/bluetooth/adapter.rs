//! `Transport` implementation backed by btleplug

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use btleplug::api::{Central, CentralEvent, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, Peripheral as PlatformPeripheral, PeripheralId as PlatformId};
use futures::StreamExt;
use log::{debug, info, warn};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use uuid::Uuid;

use crate::bluetooth::snapshot::{
    Advertisement, DiscoveredCharacteristic, DiscoveredService, PeripheralId,
};
use crate::bluetooth::transport::{Callback, Transport};
use crate::error::TransportError;

/// Attempts made to open an adapter before giving up
const MAX_ADAPTER_ATTEMPTS: u32 = 3;

/// RSSI reported for peripherals that did not advertise one
pub const UNKNOWN_RSSI: i16 = -127;

/// A peripheral seen during a scan
#[derive(Debug, Clone)]
pub struct ScannedPeripheral {
    pub id: PeripheralId,
    pub advertisement: Advertisement,
    pub rssi: i16,
}

#[derive(Default)]
struct Registry {
    peripherals: HashMap<PeripheralId, PlatformPeripheral>,
    ids: HashMap<PlatformId, PeripheralId>,
    connected: HashSet<PeripheralId>,
    links: HashMap<PeripheralId, Callback>,
}

fn lock(registry: &Mutex<Registry>) -> MutexGuard<'_, Registry> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Radio access through a btleplug adapter
pub struct BtleplugTransport {
    adapter: Adapter,
    registry: Arc<Mutex<Registry>>,
    monitor: JoinHandle<()>,
}

impl BtleplugTransport {
    /// Wrap an adapter and start watching it for link loss
    pub async fn new(adapter: Adapter) -> Result<Self, TransportError> {
        let registry = Arc::new(Mutex::new(Registry::default()));
        let mut events = adapter.events().await?;

        let watched = registry.clone();
        let monitor = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                if let CentralEvent::DeviceDisconnected(platform_id) = event {
                    let link = {
                        let mut registry = lock(&watched);
                        let Some(id) = registry.ids.get(&platform_id).cloned() else {
                            continue;
                        };
                        registry.connected.remove(&id);
                        registry.links.remove(&id).map(|callback| (id, callback))
                    };
                    if let Some((id, callback)) = link {
                        info!("Link to {} lost", id);
                        callback.disconnected(None);
                    }
                }
            }
        });

        Ok(Self {
            adapter,
            registry,
            monitor,
        })
    }

    /// Open the first adapter of the system, retrying with backoff
    pub async fn open_default() -> Result<Self, TransportError> {
        let mut last_error = None;

        for attempt in 1..=MAX_ADAPTER_ATTEMPTS {
            match Self::first_adapter().await {
                Ok(adapter) => return Self::new(adapter).await,
                Err(e) => {
                    warn!("Opening Bluetooth adapter failed (attempt {}/{}): {}", attempt, MAX_ADAPTER_ATTEMPTS, e);
                    last_error = Some(e);
                    if attempt < MAX_ADAPTER_ATTEMPTS {
                        // 500ms, 2500ms
                        sleep(Duration::from_millis(100 * 5_u64.pow(attempt))).await;
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| TransportError::other("No Bluetooth adapter found")))
    }

    async fn first_adapter() -> Result<Adapter, TransportError> {
        let manager = Manager::new().await?;
        manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| TransportError::other("No Bluetooth adapter found"))
    }

    /// Scan for `duration` and register every peripheral seen
    pub async fn scan(&self, duration: Duration) -> Result<Vec<ScannedPeripheral>, TransportError> {
        debug!("Scanning for {:?}", duration);
        self.adapter.start_scan(ScanFilter::default()).await?;
        sleep(duration).await;
        self.adapter.stop_scan().await?;

        let mut found = Vec::new();
        for peripheral in self.adapter.peripherals().await? {
            let properties = peripheral.properties().await?;
            let id = PeripheralId::new(peripheral.address().to_string());
            let (advertisement, rssi) = match &properties {
                Some(properties) => (
                    Advertisement::from(properties),
                    properties.rssi.unwrap_or(UNKNOWN_RSSI),
                ),
                None => (Advertisement::default(), UNKNOWN_RSSI),
            };

            let mut registry = lock(&self.registry);
            registry.ids.insert(peripheral.id(), id.clone());
            registry.peripherals.insert(id.clone(), peripheral);
            found.push(ScannedPeripheral {
                id,
                advertisement,
                rssi,
            });
        }

        info!("Scan found {} peripherals", found.len());
        Ok(found)
    }

    fn lookup(&self, id: &PeripheralId) -> Result<PlatformPeripheral, TransportError> {
        lock(&self.registry)
            .peripherals
            .get(id)
            .cloned()
            .ok_or_else(|| TransportError::new(2, format!("Unknown peripheral {}", id)))
    }
}

impl Drop for BtleplugTransport {
    fn drop(&mut self) {
        self.monitor.abort();
    }
}

impl Transport for BtleplugTransport {
    fn connect(&self, id: &PeripheralId, callback: Callback) {
        let peripheral = match self.lookup(id) {
            Ok(peripheral) => peripheral,
            Err(e) => return callback.failed_to_connect(e),
        };
        debug!("Connecting to {} ({})", id, callback.attempt());
        let registry = self.registry.clone();
        let id = id.clone();

        tokio::spawn(async move {
            match peripheral.connect().await {
                Ok(()) => {
                    {
                        let mut registry = lock(&registry);
                        registry.connected.insert(id.clone());
                        registry.links.insert(id, callback.clone());
                    }
                    callback.connected();
                }
                Err(e) => callback.failed_to_connect(e.into()),
            }
        });
    }

    fn disconnect(&self, id: &PeripheralId, callback: Callback) {
        let peripheral = match self.lookup(id) {
            Ok(peripheral) => peripheral,
            Err(e) => return callback.disconnected(Some(e)),
        };
        lock(&self.registry).links.remove(id);
        let registry = self.registry.clone();
        let id = id.clone();

        tokio::spawn(async move {
            let result = peripheral.disconnect().await;
            lock(&registry).connected.remove(&id);
            callback.disconnected(result.err().map(TransportError::from));
        });
    }

    fn discover_services(&self, id: &PeripheralId, callback: Callback) {
        let peripheral = match self.lookup(id) {
            Ok(peripheral) => peripheral,
            Err(e) => return callback.services_discovered(Vec::new(), Some(e)),
        };

        tokio::spawn(async move {
            match peripheral.discover_services().await {
                Ok(()) => {
                    let services = peripheral
                        .services()
                        .iter()
                        .map(DiscoveredService::from)
                        .collect();
                    callback.services_discovered(services, None);
                }
                Err(e) => callback.services_discovered(Vec::new(), Some(e.into())),
            }
        });
    }

    fn discover_characteristics(&self, id: &PeripheralId, service: Uuid, callback: Callback) {
        let peripheral = match self.lookup(id) {
            Ok(peripheral) => peripheral,
            Err(e) => return callback.characteristics_discovered(service, Vec::new(), Some(e)),
        };

        tokio::spawn(async move {
            // btleplug resolves characteristics together with the services
            let find = |peripheral: &PlatformPeripheral| {
                peripheral
                    .services()
                    .into_iter()
                    .find(|known| known.uuid == service)
            };
            let mut found = find(&peripheral);
            if found.is_none() {
                if let Err(e) = peripheral.discover_services().await {
                    return callback.characteristics_discovered(service, Vec::new(), Some(e.into()));
                }
                found = find(&peripheral);
            }

            match found {
                Some(known) => {
                    let characteristics = known
                        .characteristics
                        .iter()
                        .map(DiscoveredCharacteristic::from)
                        .collect();
                    callback.characteristics_discovered(service, characteristics, None);
                }
                None => callback.characteristics_discovered(
                    service,
                    Vec::new(),
                    Some(TransportError::other(format!("Service {} not found", service))),
                ),
            }
        });
    }

    fn read_rssi(&self, id: &PeripheralId, callback: Callback) {
        let peripheral = match self.lookup(id) {
            Ok(peripheral) => peripheral,
            Err(e) => return callback.rssi_read(UNKNOWN_RSSI, Some(e)),
        };

        tokio::spawn(async move {
            match peripheral.properties().await {
                Ok(Some(properties)) => match properties.rssi {
                    Some(rssi) => callback.rssi_read(rssi, None),
                    None => callback.rssi_read(UNKNOWN_RSSI, Some(TransportError::other("RSSI not reported"))),
                },
                Ok(None) => callback.rssi_read(UNKNOWN_RSSI, Some(TransportError::other("No properties reported"))),
                Err(e) => callback.rssi_read(UNKNOWN_RSSI, Some(e.into())),
            }
        });
    }

    fn is_connected(&self, id: &PeripheralId) -> bool {
        lock(&self.registry).connected.contains(id)
    }
}
