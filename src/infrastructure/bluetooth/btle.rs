//! btleplug backend
//!
//! Real-radio implementation of the transport seam. GATT values arrive as
//! raw bytes and are wrapped into envelopes here, at the edge.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::future;
use futures::StreamExt;
use tracing::{debug, info};

use super::protocol;
use super::transport::{
    Advertisement, AdvertisementStream, CharacteristicId, DeviceAddress, MonitorStream,
    PeripheralLink, RadioCentral, TransportError,
};

impl From<btleplug::Error> for TransportError {
    fn from(err: btleplug::Error) -> Self {
        TransportError::Radio(err.to_string())
    }
}

type Discovered = Arc<Mutex<HashMap<DeviceAddress, Peripheral>>>;

/// BLE central on one local adapter
pub struct BtleCentral {
    adapter: Adapter,
    /// Peripherals seen by the current or a past scan, by address
    discovered: Discovered,
}

impl BtleCentral {
    pub async fn new(adapter_index: usize) -> Result<Self, TransportError> {
        let manager = Manager::new().await?;
        let adapters = manager.adapters().await?;
        if adapters.is_empty() {
            return Err(TransportError::AdapterNotFound(adapter_index));
        }
        for adapter in &adapters {
            debug!(
                "Found adapter: {}",
                adapter
                    .adapter_info()
                    .await
                    .unwrap_or_else(|_| "No name adapter".to_string())
            );
        }

        let adapter = adapters
            .into_iter()
            .nth(adapter_index)
            .ok_or(TransportError::AdapterNotFound(adapter_index))?;
        info!(
            "Using Bluetooth adapter {}: {}",
            adapter_index,
            adapter
                .adapter_info()
                .await
                .unwrap_or_else(|_| "No name adapter".to_string())
        );

        Ok(Self {
            adapter,
            discovered: Arc::new(Mutex::new(HashMap::new())),
        })
    }
}

async fn advertisement_for(
    adapter: &Adapter,
    discovered: &Discovered,
    id: &PeripheralId,
) -> Result<Advertisement, TransportError> {
    let peripheral = adapter.peripheral(id).await?;
    let properties = peripheral.properties().await?;
    let (local_name, rssi) = properties
        .map(|p| (p.local_name, p.rssi))
        .unwrap_or((None, None));
    let address = DeviceAddress::new(peripheral.address().to_string());

    discovered
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(address.clone(), peripheral);

    Ok(Advertisement {
        local_name,
        address,
        rssi,
    })
}

#[async_trait]
impl RadioCentral for BtleCentral {
    async fn start_scan(&self) -> Result<AdvertisementStream, TransportError> {
        let events = self.adapter.events().await?;
        self.adapter.start_scan(ScanFilter::default()).await?;

        let adapter = self.adapter.clone();
        let discovered = Arc::clone(&self.discovered);
        let advertisements = events.filter_map(move |event| {
            let adapter = adapter.clone();
            let discovered = Arc::clone(&discovered);
            async move {
                match event {
                    CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                        Some(advertisement_for(&adapter, &discovered, &id).await)
                    }
                    _ => None,
                }
            }
        });
        Ok(advertisements.boxed())
    }

    async fn stop_scan(&self) -> Result<(), TransportError> {
        self.adapter.stop_scan().await?;
        Ok(())
    }

    async fn connect(
        &self,
        address: &DeviceAddress,
        refresh_capabilities: bool,
    ) -> Result<Arc<dyn PeripheralLink>, TransportError> {
        let peripheral = self
            .discovered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(address)
            .cloned()
            .ok_or_else(|| TransportError::UnknownDevice(address.clone()))?;

        if !peripheral.is_connected().await? {
            peripheral.connect().await?;
        }
        // btleplug enumerates services on every discover_services() call
        debug!(
            "Connected to {} (refresh capabilities: {})",
            address, refresh_capabilities
        );

        Ok(Arc::new(BtlePeripheral {
            address: address.clone(),
            peripheral,
        }))
    }
}

struct BtlePeripheral {
    address: DeviceAddress,
    peripheral: Peripheral,
}

impl BtlePeripheral {
    fn characteristic(&self, id: CharacteristicId) -> Result<Characteristic, TransportError> {
        self.peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.service_uuid == id.service && c.uuid == id.characteristic)
            .ok_or(TransportError::CharacteristicNotFound {
                service: id.service,
                characteristic: id.characteristic,
            })
    }
}

#[async_trait]
impl PeripheralLink for BtlePeripheral {
    fn address(&self) -> &DeviceAddress {
        &self.address
    }

    async fn discover(&self) -> Result<Vec<CharacteristicId>, TransportError> {
        self.peripheral.discover_services().await?;
        Ok(self
            .peripheral
            .characteristics()
            .into_iter()
            .map(|c| CharacteristicId::new(c.service_uuid, c.uuid))
            .collect())
    }

    async fn monitor(&self, id: CharacteristicId) -> Result<MonitorStream, TransportError> {
        let characteristic = self.characteristic(id)?;
        self.peripheral.subscribe(&characteristic).await?;
        let notifications = self.peripheral.notifications().await?;

        let uuid = id.characteristic;
        Ok(notifications
            .filter(move |n| future::ready(n.uuid == uuid))
            .map(|n| Ok(Some(protocol::wrap_envelope(&n.value))))
            .boxed())
    }

    async fn write_with_response(
        &self,
        id: CharacteristicId,
        envelope: &str,
    ) -> Result<(), TransportError> {
        let characteristic = self.characteristic(id)?;
        let bytes = protocol::unwrap_envelope(envelope)?;
        self.peripheral
            .write(&characteristic, &bytes, WriteType::WithResponse)
            .await?;
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.peripheral.disconnect().await?;
        Ok(())
    }
}
