//! BLE link to the BikeControl peripheral.
//!
//! ```no_run
//! # async fn demo(central: std::sync::Arc<dyn bikelink::RadioCentral>) {
//! use bikelink::{AlwaysGranted, BikeLink, LinkConfig};
//! use std::sync::Arc;
//!
//! let link = BikeLink::new(central, Arc::new(AlwaysGranted), LinkConfig::default());
//! if link.wait_for_device().await.is_ok() {
//!     link.subscribe_temperature(|r| println!("temperature: {}", r.value));
//!     link.write_braking(true).await;
//! }
//! # }
//! ```

pub mod domain;
pub mod infrastructure;

pub use domain::models::{ConnectionState, Reading, SignalKind};
pub use domain::settings::{LinkSettings, LogSettings, SettingsService};
pub use domain::throttle::throttle;
pub use infrastructure::bluetooth::connection::LinkConfig;
pub use infrastructure::bluetooth::subscriptions::SubscriptionId;
pub use infrastructure::bluetooth::transport::RadioCentral;
pub use infrastructure::bluetooth::{BikeLink, LinkError, TransportError};
pub use infrastructure::permission::{AlwaysGranted, PermissionGate};
