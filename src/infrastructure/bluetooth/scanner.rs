//! BLE Scanner Module
//!
//! Handles discovery of the BikeControl peripheral.
//!
//! The scan itself is unfiltered and matching happens here, by advertised
//! name only. Service UUID filters at the radio layer are not reliable
//! across platforms, so they are not used.

use crate::infrastructure::bluetooth::protocol;
use crate::infrastructure::bluetooth::transport::{Advertisement, RadioCentral};
use crate::infrastructure::bluetooth::{LinkError, TransportError};
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

/// Scans for the peripheral and stops the scan on every terminal path
pub struct DeviceLocator {
    central: Arc<dyn RadioCentral>,
    scanning: AtomicBool,
    /// Wakes a running `locate` when the scan is stopped from outside
    stopped: Notify,
}

impl DeviceLocator {
    pub fn new(central: Arc<dyn RadioCentral>) -> Self {
        Self {
            central,
            scanning: AtomicBool::new(false),
            stopped: Notify::new(),
        }
    }

    /// Scan until an advertisement from the peripheral shows up.
    ///
    /// The scan is stopped before the candidate is returned.
    pub async fn locate(&self) -> Result<Advertisement, LinkError> {
        info!(
            "Starting device scan: searching for {}",
            protocol::DEVICE_NAME
        );
        // Registered before the scan starts so no stop can slip past it
        let stopped = self.stopped.notified();
        tokio::pin!(stopped);
        // Marked before the await so a cancelled start still gets stopped
        self.scanning.store(true, Ordering::SeqCst);
        let mut advertisements = match self.central.start_scan().await {
            Ok(stream) => stream,
            Err(e) => {
                error!("Failed to start scan: {}", e);
                self.scanning.store(false, Ordering::SeqCst);
                return Err(LinkError::ScanFailure(e));
            }
        };

        loop {
            let next = tokio::select! {
                next = advertisements.next() => next,
                _ = &mut stopped => {
                    info!("Scan stopped before {} was found", protocol::DEVICE_NAME);
                    return Err(LinkError::ScanFailure(TransportError::Radio(
                        "scan stopped".to_string(),
                    )));
                }
            };
            let Some(next) = next else {
                break;
            };
            let advertisement = match next {
                Ok(adv) => adv,
                Err(e) => {
                    warn!("Scan error, still scanning: {}", e);
                    continue;
                }
            };

            if Self::matches(&advertisement) {
                info!(
                    "Found {} at {} (rssi {:?})",
                    protocol::DEVICE_NAME,
                    advertisement.address,
                    advertisement.rssi
                );
                self.stop_scan().await;
                return Ok(advertisement);
            }
            debug!(
                "Ignoring advertisement from {} ({:?})",
                advertisement.address, advertisement.local_name
            );
        }

        error!("Advertisement stream ended before the device was found");
        self.stop_scan().await;
        Err(LinkError::ScanFailure(TransportError::Radio(
            "advertisement stream closed".to_string(),
        )))
    }

    /// Whether an advertisement comes from the BikeControl peripheral
    pub fn matches(advertisement: &Advertisement) -> bool {
        advertisement.local_name.as_deref() == Some(protocol::DEVICE_NAME)
    }

    /// Stop scanning. Safe to call when no scan is running.
    ///
    /// The scanning flag is only cleared once the radio has answered, so a
    /// stop that is cancelled halfway can be retried.
    pub async fn stop_scan(&self) {
        if !self.scanning.load(Ordering::SeqCst) {
            return;
        }
        self.stopped.notify_waiters();
        info!("Stopping BLE scan...");
        if let Err(e) = self.central.stop_scan().await {
            error!("Failed to stop scan: {}", e);
        }
        self.scanning.store(false, Ordering::SeqCst);
    }

    /// Check if currently scanning
    pub fn is_scanning(&self) -> bool {
        self.scanning.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::simulated::SimulatedRadio;
    use crate::infrastructure::bluetooth::transport::DeviceAddress;

    fn advertisement(name: Option<&str>, address: &str) -> Advertisement {
        Advertisement {
            local_name: name.map(str::to_string),
            address: DeviceAddress::new(address),
            rssi: Some(-60),
        }
    }

    #[test]
    fn test_matches_exact_name_only() {
        assert!(DeviceLocator::matches(&advertisement(
            Some("BikeControl"),
            "aa"
        )));
        assert!(!DeviceLocator::matches(&advertisement(
            Some("BikeControl 2"),
            "aa"
        )));
        assert!(!DeviceLocator::matches(&advertisement(
            Some("bikecontrol"),
            "aa"
        )));
        assert!(!DeviceLocator::matches(&advertisement(None, "aa")));
    }

    #[tokio::test]
    async fn test_locate_skips_other_devices_and_stops_scan() {
        let radio = SimulatedRadio::new();
        radio.advertise(advertisement(Some("Headphones"), "11:11"));
        radio.advertise(advertisement(None, "22:22"));
        radio.advertise_bike("33:33");

        let locator = DeviceLocator::new(radio.central());
        let found = locator.locate().await.unwrap();

        assert_eq!(found.address.as_str(), "33:33");
        assert!(!locator.is_scanning());
        assert!(!radio.is_scanning());
        assert_eq!(radio.scans_started(), 1);
        assert_eq!(radio.scans_stopped(), 1);
    }

    #[tokio::test]
    async fn test_stop_scan_is_idempotent() {
        let radio = SimulatedRadio::new();
        radio.advertise_bike("33:33");
        let locator = DeviceLocator::new(radio.central());
        locator.locate().await.unwrap();

        locator.stop_scan().await;
        locator.stop_scan().await;
        assert_eq!(radio.scans_stopped(), 1);
    }

    #[tokio::test]
    async fn test_locate_skips_scan_errors() {
        let radio = SimulatedRadio::new();
        let locator = Arc::new(DeviceLocator::new(radio.central()));
        let search = tokio::spawn({
            let locator = Arc::clone(&locator);
            async move { locator.locate().await }
        });
        while !radio.is_scanning() {
            tokio::task::yield_now().await;
        }

        radio.inject_scan_error();
        radio.advertise_bike("33:33");

        let found = search.await.unwrap().unwrap();
        assert_eq!(found.address.as_str(), "33:33");
        assert!(!locator.is_scanning());
        assert!(!radio.is_scanning());
        assert_eq!(radio.scans_stopped(), 1);
    }

    #[tokio::test]
    async fn test_stop_scan_interrupts_locate() {
        let radio = SimulatedRadio::new();
        let locator = Arc::new(DeviceLocator::new(radio.central()));
        let search = tokio::spawn({
            let locator = Arc::clone(&locator);
            async move { locator.locate().await }
        });
        while !radio.is_scanning() {
            tokio::task::yield_now().await;
        }

        locator.stop_scan().await;

        assert!(matches!(
            search.await.unwrap(),
            Err(LinkError::ScanFailure(_))
        ));
        assert!(!locator.is_scanning());
        assert_eq!(radio.scans_stopped(), 1);
    }

    #[tokio::test]
    async fn test_stop_after_cancelled_locate() {
        let radio = SimulatedRadio::new();
        radio.advertise(advertisement(Some("Headphones"), "11:11"));
        let locator = DeviceLocator::new(radio.central());

        // Start a scan, then drop locate() while it waits for the bike
        let search = locator.locate();
        assert!(
            tokio::time::timeout(std::time::Duration::from_millis(10), search)
                .await
                .is_err()
        );
        assert!(locator.is_scanning());

        locator.stop_scan().await;
        assert!(!locator.is_scanning());
        assert!(!radio.is_scanning());
    }

    #[tokio::test]
    async fn test_scan_start_failure() {
        let radio = SimulatedRadio::new();
        radio.fail_scan_start(true);
        let locator = DeviceLocator::new(radio.central());

        assert!(matches!(
            locator.locate().await,
            Err(LinkError::ScanFailure(_))
        ));
        assert!(!locator.is_scanning());
    }
}
