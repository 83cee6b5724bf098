//! Radio transport seam
//!
//! The link manager drives the radio only through these traits, so the same
//! state machine runs against btleplug or against the in-process simulator.
//! Characteristic values cross this seam as base64 envelopes.

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Bluetooth adapter {0} not found")]
    AdapterNotFound(usize),

    #[error("Device {0} has not been seen by a scan")]
    UnknownDevice(DeviceAddress),

    #[error("Service {0} not exposed by peripheral")]
    MissingService(Uuid),

    #[error("Characteristic {characteristic} not found in service {service}")]
    CharacteristicNotFound { service: Uuid, characteristic: Uuid },

    #[error("Peripheral disconnected")]
    Disconnected,

    #[error("Invalid payload envelope: {0}")]
    Envelope(#[from] base64::DecodeError),

    #[error("Radio error: {0}")]
    Radio(String),
}

/// Transport-specific peripheral address
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceAddress(String);

impl DeviceAddress {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An advertisement observed during a scan
#[derive(Debug, Clone)]
pub struct Advertisement {
    pub local_name: Option<String>,
    pub address: DeviceAddress,
    pub rssi: Option<i16>,
}

/// A characteristic exposed by a connected peripheral
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CharacteristicId {
    pub service: Uuid,
    pub characteristic: Uuid,
}

impl CharacteristicId {
    pub fn new(service: Uuid, characteristic: Uuid) -> Self {
        Self {
            service,
            characteristic,
        }
    }
}

/// Advertisements delivered by an active scan
pub type AdvertisementStream = BoxStream<'static, Result<Advertisement, TransportError>>;

/// Value-changed events of a monitored characteristic.
///
/// `Ok(None)` is a notification without data. An `Err` or the end of the
/// stream means the link is gone.
pub type MonitorStream = BoxStream<'static, Result<Option<String>, TransportError>>;

/// BLE central role: scanning and connecting.
#[async_trait]
pub trait RadioCentral: Send + Sync {
    /// Start an unfiltered scan.
    async fn start_scan(&self) -> Result<AdvertisementStream, TransportError>;

    /// Stop the scan started by [`RadioCentral::start_scan`].
    async fn stop_scan(&self) -> Result<(), TransportError>;

    /// Connect to an advertised peripheral.
    ///
    /// With `refresh_capabilities` set, any cached service table for the
    /// device must be discarded and enumerated again after connecting.
    async fn connect(
        &self,
        address: &DeviceAddress,
        refresh_capabilities: bool,
    ) -> Result<Arc<dyn PeripheralLink>, TransportError>;
}

/// An established connection to a peripheral.
#[async_trait]
pub trait PeripheralLink: Send + Sync {
    fn address(&self) -> &DeviceAddress;

    /// Enumerate every service and characteristic.
    async fn discover(&self) -> Result<Vec<CharacteristicId>, TransportError>;

    /// Enable notifications and return the value stream.
    async fn monitor(&self, id: CharacteristicId) -> Result<MonitorStream, TransportError>;

    /// Write an envelope and wait for the peripheral's acknowledgment.
    async fn write_with_response(
        &self,
        id: CharacteristicId,
        envelope: &str,
    ) -> Result<(), TransportError>;

    async fn disconnect(&self) -> Result<(), TransportError>;
}
