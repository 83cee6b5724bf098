//! Bluetooth Service Module
//!
//! [`BikeLink`] is the single entry point the application uses. It owns the
//! connection manager and the listener registries; create one per process
//! and share it by `Arc`.

use crate::domain::models::{ConnectionState, Reading, SignalKind};
use crate::infrastructure::bluetooth::connection::{LinkConfig, LinkManager};
use crate::infrastructure::bluetooth::subscriptions::{SubscriptionHub, SubscriptionId};
use crate::infrastructure::bluetooth::transport::RadioCentral;
use crate::infrastructure::bluetooth::LinkError;
use crate::infrastructure::permission::PermissionGate;
use std::sync::Arc;

/// Main Bluetooth service for the BikeControl peripheral
pub struct BikeLink {
    manager: LinkManager,
    hub: Arc<SubscriptionHub>,
}

impl BikeLink {
    pub fn new(
        central: Arc<dyn RadioCentral>,
        permission: Arc<dyn PermissionGate>,
        config: LinkConfig,
    ) -> Self {
        let hub = Arc::new(SubscriptionHub::new());
        Self {
            manager: LinkManager::new(central, permission, Arc::clone(&hub), config),
            hub,
        }
    }

    /// Build a link on a real adapter through btleplug
    #[cfg(feature = "ble-central")]
    pub async fn with_btleplug(
        settings: &crate::domain::settings::LinkSettings,
    ) -> Result<Self, crate::infrastructure::bluetooth::TransportError> {
        use crate::infrastructure::bluetooth::btle::BtleCentral;
        use crate::infrastructure::permission::AlwaysGranted;

        let central = BtleCentral::new(settings.adapter_index).await?;
        Ok(Self::new(
            Arc::new(central),
            Arc::new(AlwaysGranted),
            settings.link_config(),
        ))
    }

    /// Connect to the peripheral, or return at once if already connected
    pub async fn wait_for_device(&self) -> Result<(), LinkError> {
        self.manager.wait_for_device().await
    }

    pub fn subscribe_temperature<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(Reading) + Send + Sync + 'static,
    {
        self.hub.subscribe(SignalKind::Temperature, listener)
    }

    pub fn subscribe_humidity<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(Reading) + Send + Sync + 'static,
    {
        self.hub.subscribe(SignalKind::Humidity, listener)
    }

    pub fn subscribe_distance_left<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(Reading) + Send + Sync + 'static,
    {
        self.hub.subscribe(SignalKind::DistanceLeft, listener)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.hub.unsubscribe(id)
    }

    pub fn is_connected(&self) -> bool {
        self.manager.is_connected()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.manager.connection_state()
    }

    /// Switch the brake light. Fire-and-forget: failures are only logged.
    pub async fn write_braking(&self, active: bool) {
        self.manager.write_braking(active).await
    }

    /// Disconnect if connected. Fire-and-forget: failures are only logged.
    pub async fn destroy_connection(&self) {
        self.manager.destroy_connection().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::protocol::{
        self, encode_float32, encode_float64, wrap_envelope, HUMIDITY_CHAR_UUID,
        TEMPERATURE_CHAR_UUID,
    };
    use crate::infrastructure::bluetooth::simulated::SimulatedRadio;
    use crate::infrastructure::permission::AlwaysGranted;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::mpsc;

    async fn connected_link() -> (SimulatedRadio, BikeLink) {
        let radio = SimulatedRadio::new();
        radio.advertise_bike("c0:ff:ee:00:00:01");
        let link = BikeLink::new(
            radio.central(),
            Arc::new(AlwaysGranted),
            LinkConfig::default(),
        );
        link.wait_for_device().await.unwrap();
        (radio, link)
    }

    async fn next_reading(rx: &mut mpsc::UnboundedReceiver<Reading>) -> Reading {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("no reading delivered")
            .expect("listener dropped")
    }

    #[tokio::test]
    async fn test_readings_reach_listeners() {
        let (radio, link) = connected_link().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let temperature_tx = tx.clone();
        link.subscribe_temperature(move |r| {
            let _ = temperature_tx.send(r);
        });
        let humidity_tx = tx.clone();
        link.subscribe_humidity(move |r| {
            let _ = humidity_tx.send(r);
        });
        link.subscribe_distance_left(move |r| {
            let _ = tx.send(r);
        });

        let peripheral = radio.peripheral();
        peripheral.notify(TEMPERATURE_CHAR_UUID, &encode_float32(21.456));
        assert_eq!(
            next_reading(&mut rx).await,
            Reading::new(SignalKind::Temperature, 21.46)
        );

        peripheral.notify(HUMIDITY_CHAR_UUID, &encode_float32(48.0));
        assert_eq!(
            next_reading(&mut rx).await,
            Reading::new(SignalKind::Humidity, 48.0)
        );

        peripheral.notify(protocol::DISTANCE_LEFT_CHAR_UUID, &encode_float64(139.875));
        assert_eq!(
            next_reading(&mut rx).await,
            Reading::new(SignalKind::DistanceLeft, 139.875)
        );
    }

    #[tokio::test]
    async fn test_listener_order_per_signal() {
        let (radio, link) = connected_link().await;
        let order = Arc::new(Mutex::new(Vec::new()));
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();

        let first = Arc::clone(&order);
        link.subscribe_temperature(move |_| first.lock().unwrap().push("L1"));
        let second = Arc::clone(&order);
        link.subscribe_temperature(move |r| {
            second.lock().unwrap().push("L2");
            let _ = done_tx.send(r);
        });

        radio
            .peripheral()
            .notify(TEMPERATURE_CHAR_UUID, &encode_float32(18.0));
        next_reading(&mut done_rx).await;

        assert_eq!(*order.lock().unwrap(), vec!["L1", "L2"]);
    }

    #[tokio::test]
    async fn test_malformed_payload_is_dropped() {
        let (radio, link) = connected_link().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        link.subscribe_temperature(move |r| {
            let _ = tx.send(r);
        });

        let peripheral = radio.peripheral();
        peripheral.notify(TEMPERATURE_CHAR_UUID, &wrap_envelope(&[0x01, 0x02, 0x03]));
        peripheral.notify(TEMPERATURE_CHAR_UUID, "%%%");
        peripheral.notify_empty(TEMPERATURE_CHAR_UUID);
        peripheral.notify(TEMPERATURE_CHAR_UUID, &encode_float32(5.0));

        // Only the well-formed reading arrives, and the link stays up
        assert_eq!(next_reading(&mut rx).await.value, 5.0);
        assert!(rx.try_recv().is_err());
        assert!(link.is_connected());
    }

    #[tokio::test]
    async fn test_link_loss_is_silent_for_listeners() {
        let (radio, link) = connected_link().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        link.subscribe_temperature(move |r| {
            let _ = tx.send(r);
        });

        radio.peripheral().fail_monitor(TEMPERATURE_CHAR_UUID);
        for _ in 0..100 {
            if !link.is_connected() {
                break;
            }
            tokio::task::yield_now().await;
        }

        assert!(!link.is_connected());
        assert_eq!(link.connection_state(), ConnectionState::Error);
        assert!(rx.try_recv().is_err());

        link.destroy_connection().await;
        assert_eq!(link.connection_state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_unsubscribe_and_registries_survive_teardown() {
        let (radio, link) = connected_link().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let dropped = link.subscribe_humidity(|_| panic!("unsubscribed listener ran"));
        link.subscribe_humidity(move |r| {
            let _ = tx.send(r);
        });
        assert!(link.unsubscribe(dropped));

        link.destroy_connection().await;
        link.wait_for_device().await.unwrap();

        radio
            .peripheral()
            .notify(HUMIDITY_CHAR_UUID, &encode_float32(61.25));
        assert_eq!(next_reading(&mut rx).await.value, 61.25);
    }

    #[tokio::test]
    async fn test_concurrent_waits_share_one_scan() {
        let radio = SimulatedRadio::new();
        radio.advertise_bike("c0:ff:ee:00:00:01");
        let link = Arc::new(BikeLink::new(
            radio.central(),
            Arc::new(AlwaysGranted),
            LinkConfig::default(),
        ));

        let a = tokio::spawn({
            let link = Arc::clone(&link);
            async move { link.wait_for_device().await }
        });
        let b = tokio::spawn({
            let link = Arc::clone(&link);
            async move { link.wait_for_device().await }
        });

        assert!(a.await.unwrap().is_ok());
        assert!(b.await.unwrap().is_ok());
        assert_eq!(radio.scans_started(), 1);
        assert_eq!(radio.connects(), 1);
    }
}
