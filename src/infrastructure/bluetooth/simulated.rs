//! In-process BLE simulator
//!
//! A scripted radio with one simulated BikeControl peripheral behind it.
//! Used to exercise the link without Bluetooth hardware: tests queue
//! advertisements, push notifications, inject transport failures and
//! inspect what the link wrote.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc::{self, UnboundedSender};
use futures::StreamExt;
use uuid::Uuid;

use super::protocol::{self, SERVICE_UUID};
use super::transport::{
    Advertisement, AdvertisementStream, CharacteristicId, DeviceAddress, MonitorStream,
    PeripheralLink, RadioCentral, TransportError,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct RadioState {
    /// Advertisements replayed at the start of every scan
    script: Vec<Advertisement>,
    scan_tx: Option<UnboundedSender<Result<Advertisement, TransportError>>>,
    scans_started: usize,
    scans_stopped: usize,
    fail_scan_start: bool,

    connect_delay: Duration,
    reject_connect: bool,
    connects: usize,
    last_refresh_request: Option<bool>,
}

/// The simulated radio. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct SimulatedRadio {
    state: Arc<Mutex<RadioState>>,
    peripheral: Arc<SimulatedPeripheral>,
}

impl Default for SimulatedRadio {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedRadio {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(RadioState::default())),
            peripheral: Arc::new(SimulatedPeripheral::new()),
        }
    }

    /// This radio as a [`RadioCentral`] trait object
    pub fn central(&self) -> Arc<dyn RadioCentral> {
        Arc::new(self.clone())
    }

    /// The peripheral every connection lands on
    pub fn peripheral(&self) -> Arc<SimulatedPeripheral> {
        Arc::clone(&self.peripheral)
    }

    /// Queue an advertisement; delivered now if a scan is running and
    /// again at the start of every later scan.
    pub fn advertise(&self, advertisement: Advertisement) {
        let mut state = lock(&self.state);
        if let Some(tx) = &state.scan_tx {
            let _ = tx.unbounded_send(Ok(advertisement.clone()));
        }
        state.script.push(advertisement);
    }

    /// Advertise the BikeControl peripheral at `address`
    pub fn advertise_bike(&self, address: &str) {
        self.advertise(Advertisement {
            local_name: Some(protocol::DEVICE_NAME.to_string()),
            address: DeviceAddress::new(address),
            rssi: Some(-55),
        });
    }

    /// Deliver a scan error to the running scan
    pub fn inject_scan_error(&self) {
        if let Some(tx) = &lock(&self.state).scan_tx {
            let _ = tx.unbounded_send(Err(TransportError::Radio("scan glitch".to_string())));
        }
    }

    pub fn fail_scan_start(&self, fail: bool) {
        lock(&self.state).fail_scan_start = fail;
    }

    pub fn reject_connect(&self, reject: bool) {
        lock(&self.state).reject_connect = reject;
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        lock(&self.state).connect_delay = delay;
    }

    pub fn is_scanning(&self) -> bool {
        lock(&self.state).scan_tx.is_some()
    }

    pub fn scans_started(&self) -> usize {
        lock(&self.state).scans_started
    }

    pub fn scans_stopped(&self) -> usize {
        lock(&self.state).scans_stopped
    }

    pub fn connects(&self) -> usize {
        lock(&self.state).connects
    }

    /// `refresh_capabilities` flag of the latest connect request
    pub fn last_refresh_request(&self) -> Option<bool> {
        lock(&self.state).last_refresh_request
    }
}

#[async_trait]
impl RadioCentral for SimulatedRadio {
    async fn start_scan(&self) -> Result<AdvertisementStream, TransportError> {
        let mut state = lock(&self.state);
        if state.fail_scan_start {
            return Err(TransportError::Radio("scanner unavailable".to_string()));
        }
        let (tx, rx) = mpsc::unbounded();
        for advertisement in &state.script {
            let _ = tx.unbounded_send(Ok(advertisement.clone()));
        }
        state.scan_tx = Some(tx);
        state.scans_started += 1;
        Ok(rx.boxed())
    }

    async fn stop_scan(&self) -> Result<(), TransportError> {
        let mut state = lock(&self.state);
        state.scan_tx = None;
        state.scans_stopped += 1;
        Ok(())
    }

    async fn connect(
        &self,
        address: &DeviceAddress,
        refresh_capabilities: bool,
    ) -> Result<Arc<dyn PeripheralLink>, TransportError> {
        let delay = {
            let mut state = lock(&self.state);
            state.last_refresh_request = Some(refresh_capabilities);
            state.connect_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = lock(&self.state);
        if state.reject_connect {
            return Err(TransportError::Radio(format!(
                "connection to {} rejected",
                address
            )));
        }
        state.connects += 1;
        lock(&self.peripheral.state).connected = true;
        Ok(Arc::new(SimulatedConnection {
            address: address.clone(),
            peripheral: Arc::clone(&self.peripheral),
        }))
    }
}

type MonitorSender = UnboundedSender<Result<Option<String>, TransportError>>;

struct PeripheralState {
    characteristics: Vec<CharacteristicId>,
    monitors: HashMap<Uuid, Vec<MonitorSender>>,
    writes: Vec<(CharacteristicId, String)>,
    disconnects: usize,
    disconnect_delay: Duration,
    connected: bool,
    fail_discover: bool,
    fail_write: bool,
    fail_disconnect: bool,
}

/// Simulated BikeControl peripheral
pub struct SimulatedPeripheral {
    state: Mutex<PeripheralState>,
}

impl SimulatedPeripheral {
    fn new() -> Self {
        let characteristics = [
            protocol::TEMPERATURE_CHAR_UUID,
            protocol::HUMIDITY_CHAR_UUID,
            protocol::DISTANCE_LEFT_CHAR_UUID,
            protocol::BRAKING_CHAR_UUID,
        ]
        .into_iter()
        .map(|c| CharacteristicId::new(SERVICE_UUID, c))
        .collect();

        Self {
            state: Mutex::new(PeripheralState {
                characteristics,
                monitors: HashMap::new(),
                writes: Vec::new(),
                disconnects: 0,
                disconnect_delay: Duration::ZERO,
                connected: false,
                fail_discover: false,
                fail_write: false,
                fail_disconnect: false,
            }),
        }
    }

    /// Replace the exposed characteristic table
    pub fn set_characteristics(&self, characteristics: Vec<CharacteristicId>) {
        lock(&self.state).characteristics = characteristics;
    }

    /// Notify every monitor of `characteristic`; returns how many received it
    pub fn notify(&self, characteristic: Uuid, envelope: &str) -> usize {
        self.push(characteristic, || Ok(Some(envelope.to_string())))
    }

    /// Notification without a value
    pub fn notify_empty(&self, characteristic: Uuid) -> usize {
        self.push(characteristic, || Ok(None))
    }

    /// Report a transport error on the monitors of `characteristic`
    pub fn fail_monitor(&self, characteristic: Uuid) -> usize {
        self.push(characteristic, || Err(TransportError::Disconnected))
    }

    fn push(
        &self,
        characteristic: Uuid,
        event: impl Fn() -> Result<Option<String>, TransportError>,
    ) -> usize {
        let mut state = lock(&self.state);
        let Some(senders) = state.monitors.get_mut(&characteristic) else {
            return 0;
        };
        senders.retain(|tx| !tx.is_closed());
        senders
            .iter()
            .filter(|tx| tx.unbounded_send(event()).is_ok())
            .count()
    }

    /// Open monitors on `characteristic`
    pub fn monitor_count(&self, characteristic: Uuid) -> usize {
        let mut state = lock(&self.state);
        state.monitors.get_mut(&characteristic).map_or(0, |senders| {
            senders.retain(|tx| !tx.is_closed());
            senders.len()
        })
    }

    pub fn writes(&self) -> Vec<(CharacteristicId, String)> {
        lock(&self.state).writes.clone()
    }

    pub fn disconnects(&self) -> usize {
        lock(&self.state).disconnects
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.state).connected
    }

    pub fn fail_discover(&self, fail: bool) {
        lock(&self.state).fail_discover = fail;
    }

    pub fn fail_write(&self, fail: bool) {
        lock(&self.state).fail_write = fail;
    }

    pub fn fail_disconnect(&self, fail: bool) {
        lock(&self.state).fail_disconnect = fail;
    }

    /// Make each disconnect take `delay` before it completes
    pub fn set_disconnect_delay(&self, delay: Duration) {
        lock(&self.state).disconnect_delay = delay;
    }
}

struct SimulatedConnection {
    address: DeviceAddress,
    peripheral: Arc<SimulatedPeripheral>,
}

#[async_trait]
impl PeripheralLink for SimulatedConnection {
    fn address(&self) -> &DeviceAddress {
        &self.address
    }

    async fn discover(&self) -> Result<Vec<CharacteristicId>, TransportError> {
        let state = lock(&self.peripheral.state);
        if state.fail_discover {
            return Err(TransportError::Radio("service discovery failed".to_string()));
        }
        Ok(state.characteristics.clone())
    }

    async fn monitor(&self, id: CharacteristicId) -> Result<MonitorStream, TransportError> {
        let mut state = lock(&self.peripheral.state);
        if !state.characteristics.contains(&id) {
            return Err(TransportError::CharacteristicNotFound {
                service: id.service,
                characteristic: id.characteristic,
            });
        }
        let (tx, rx) = mpsc::unbounded();
        state.monitors.entry(id.characteristic).or_default().push(tx);
        Ok(rx.boxed())
    }

    async fn write_with_response(
        &self,
        id: CharacteristicId,
        envelope: &str,
    ) -> Result<(), TransportError> {
        let mut state = lock(&self.peripheral.state);
        if !state.connected {
            return Err(TransportError::Disconnected);
        }
        if state.fail_write {
            return Err(TransportError::Radio("write not acknowledged".to_string()));
        }
        if !state.characteristics.contains(&id) {
            return Err(TransportError::CharacteristicNotFound {
                service: id.service,
                characteristic: id.characteristic,
            });
        }
        state.writes.push((id, envelope.to_string()));
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let delay = lock(&self.peripheral.state).disconnect_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = lock(&self.peripheral.state);
        state.disconnects += 1;
        if state.fail_disconnect {
            return Err(TransportError::Radio("disconnect refused".to_string()));
        }
        state.connected = false;
        state.monitors.clear();
        Ok(())
    }
}
