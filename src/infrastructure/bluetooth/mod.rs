//! Bluetooth Module
//!
//! Provides the BLE link to the BikeControl peripheral.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                        BikeLink                          │
//! │  (Facade - the only surface the application uses)        │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │
//!         ┌─────────────┼──────────────┐
//!         │             │              │
//!         ▼             ▼              ▼
//! ┌──────────────┐ ┌───────────┐ ┌───────────────┐
//! │ LinkManager  │ │ Protocol  │ │SubscriptionHub│
//! │ - state      │ │ - UUIDs   │ │ - listeners   │
//! │ - deadline   │ │ - codec   │ │ - fan-out     │
//! │ - monitors   │ └───────────┘ └───────────────┘
//! └──────┬───────┘
//!        ▼
//! ┌──────────────┐     ┌───────────────────────────┐
//! │DeviceLocator │ ──▶ │ RadioCentral (btleplug or │
//! │ - name filter│     │ simulated)                │
//! └──────────────┘     └───────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - Peripheral identity and payload codec
//! - [`transport`] - Radio traits the link is written against
//! - [`scanner`] - Device discovery
//! - [`connection`] - Connection state machine
//! - [`subscriptions`] - Listener registries
//! - [`service`] - Public facade
//! - [`simulated`] - In-process peripheral for tests
//! - `btle` - btleplug backend (feature `ble-central`)

#[cfg(feature = "ble-central")]
pub mod btle;
pub mod connection;
pub mod protocol;
pub mod scanner;
pub mod service;
pub mod simulated;
pub mod subscriptions;
pub mod transport;

use std::time::Duration;
use thiserror::Error;

pub use service::BikeLink;
pub use transport::TransportError;

#[derive(Error, Debug)]
pub enum LinkError {
    #[error("Radio permission denied")]
    PermissionDenied,

    #[error("No BikeControl connection within {0:?}")]
    Timeout(Duration),

    #[error("Connection failed: {0}")]
    ConnectFailure(#[source] TransportError),

    #[error("Scan failed: {0}")]
    ScanFailure(#[source] TransportError),

    #[error("Malformed payload: expected {expected} bytes, got {actual}")]
    MalformedPayload { expected: usize, actual: usize },

    #[error("Invalid payload envelope: {0}")]
    InvalidEnvelope(#[from] base64::DecodeError),
}
