//! BLE Connection Module
//!
//! Owns the connection state machine of the single BikeControl link:
//!
//! ```text
//! Disconnected ──wait_for_device──▶ Scanning ──match──▶ Connecting ──▶ Connected
//!       ▲                                                  │              │
//!       │                                                  ▼              ▼
//!       └──────────────destroy_connection─────────────── Error ◀── monitor error
//! ```
//!
//! All link state sits in one `Mutex<LinkState>`. Critical sections are
//! short and never span an `.await`; monitor tasks touch the state only
//! through [`mark_link_lost`], and only for their own session.

use crate::domain::models::{ConnectionState, Reading, SignalKind};
use crate::infrastructure::bluetooth::protocol::{self, BRAKING_CHAR_UUID, SERVICE_UUID};
use crate::infrastructure::bluetooth::scanner::DeviceLocator;
use crate::infrastructure::bluetooth::subscriptions::SubscriptionHub;
use crate::infrastructure::bluetooth::transport::{
    CharacteristicId, MonitorStream, PeripheralLink, RadioCentral, TransportError,
};
use crate::infrastructure::bluetooth::LinkError;
use crate::infrastructure::permission::PermissionGate;
use futures::StreamExt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

/// Configuration for connection behavior
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Deadline for scan, connect and monitor registration together
    pub connect_timeout: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(20),
        }
    }
}

/// The established connection. Only exists while `Connected`.
struct LinkHandle {
    session: u64,
    peripheral: Arc<dyn PeripheralLink>,
    monitors: Vec<JoinHandle<()>>,
}

impl LinkHandle {
    fn abort_monitors(&self) {
        for monitor in &self.monitors {
            monitor.abort();
        }
    }
}

#[derive(Default)]
struct LinkState {
    status: ConnectionState,
    handle: Option<LinkHandle>,
    /// Connected but not yet committed (discovery / subscription running)
    pending: Option<Arc<dyn PeripheralLink>>,
    permission_granted: bool,
    /// Bumped by every teardown; an attempt from an older epoch must not commit
    epoch: u64,
}

fn lock_state(state: &Mutex<LinkState>) -> MutexGuard<'_, LinkState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct LinkManager {
    central: Arc<dyn RadioCentral>,
    locator: DeviceLocator,
    permission: Arc<dyn PermissionGate>,
    hub: Arc<SubscriptionHub>,
    config: LinkConfig,
    state: Arc<Mutex<LinkState>>,
    /// Serializes connection attempts
    attempt: tokio::sync::Mutex<()>,
    next_session: AtomicU64,
}

impl LinkManager {
    pub fn new(
        central: Arc<dyn RadioCentral>,
        permission: Arc<dyn PermissionGate>,
        hub: Arc<SubscriptionHub>,
        config: LinkConfig,
    ) -> Self {
        Self {
            locator: DeviceLocator::new(Arc::clone(&central)),
            central,
            permission,
            hub,
            config,
            state: Arc::new(Mutex::new(LinkState::default())),
            attempt: tokio::sync::Mutex::new(()),
            next_session: AtomicU64::new(0),
        }
    }

    fn state(&self) -> MutexGuard<'_, LinkState> {
        lock_state(&self.state)
    }

    fn set_status(&self, status: ConnectionState) {
        let mut state = self.state();
        if state.status != status {
            debug!("Link state {} -> {}", state.status, status);
            state.status = status;
        }
    }

    /// Move an attempt to `status` unless a teardown happened since it began
    fn advance(&self, epoch: u64, status: ConnectionState) -> Result<(), LinkError> {
        let mut state = self.state();
        if state.epoch != epoch {
            return Err(LinkError::ConnectFailure(TransportError::Disconnected));
        }
        if state.status != status {
            debug!("Link state {} -> {}", state.status, status);
            state.status = status;
        }
        Ok(())
    }

    /// Record a failed attempt, leaving the state alone after a teardown
    fn fail_attempt(&self, epoch: u64, status: ConnectionState, err: LinkError) -> LinkError {
        match self.advance(epoch, status) {
            Ok(()) => err,
            Err(torn_down) => torn_down,
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state().status
    }

    pub fn is_connected(&self) -> bool {
        self.state().handle.is_some()
    }

    pub fn is_scanning(&self) -> bool {
        self.locator.is_scanning()
    }

    /// Scan for the peripheral, connect and register monitors, all within
    /// the configured deadline.
    ///
    /// Returns immediately when already connected. On deadline expiry the
    /// in-flight attempt is dropped, the scan is stopped and a half-open
    /// connection is torn down before `Timeout` is returned.
    ///
    /// The deadline runs from the call, including time spent waiting for a
    /// concurrent attempt to finish.
    pub async fn wait_for_device(&self) -> Result<(), LinkError> {
        let deadline = self.config.connect_timeout;
        let expires = Instant::now() + deadline;

        let Ok(_attempt) = tokio::time::timeout_at(expires, self.attempt.lock()).await else {
            warn!("Concurrent attempt still running after {:?}, giving up", deadline);
            return Err(LinkError::Timeout(deadline));
        };
        if self.is_connected() {
            debug!("Already connected, skipping scan");
            return Ok(());
        }

        match tokio::time::timeout_at(expires, self.establish()).await {
            Ok(result) => result,
            Err(_) => {
                warn!("No connection within {:?}, giving up", deadline);
                self.locator.stop_scan().await;
                self.abandon_attempt().await;
                Err(LinkError::Timeout(deadline))
            }
        }
    }

    async fn establish(&self) -> Result<(), LinkError> {
        let epoch = self.state().epoch;
        self.ensure_permission().await?;

        self.advance(epoch, ConnectionState::Scanning)?;
        let candidate = match self.locator.locate().await {
            Ok(candidate) => candidate,
            Err(e) => return Err(self.fail_attempt(epoch, ConnectionState::Disconnected, e)),
        };

        self.advance(epoch, ConnectionState::Connecting)?;
        info!("Connecting to {}...", candidate.address);
        // Always refresh: the peripheral's service table may change between sessions
        let peripheral = match self.central.connect(&candidate.address, true).await {
            Ok(peripheral) => peripheral,
            Err(e) => {
                error!("Error connecting to {}: {}", candidate.address, e);
                let err = LinkError::ConnectFailure(e);
                return Err(self.fail_attempt(epoch, ConnectionState::Error, err));
            }
        };
        if !self.hold_pending(epoch, &peripheral) {
            warn!("Connection to {} torn down while connecting", candidate.address);
            if let Err(e) = peripheral.disconnect().await {
                warn!("Failed to disconnect from {}: {}", peripheral.address(), e);
            }
            return Err(LinkError::ConnectFailure(TransportError::Disconnected));
        }

        let streams = match self.open_monitors(peripheral.as_ref()).await {
            Ok(streams) => streams,
            Err(e) => {
                error!("Setting up {} failed: {}", candidate.address, e);
                self.fail_pending(epoch, &peripheral).await;
                return Err(self.fail_attempt(
                    epoch,
                    ConnectionState::Error,
                    LinkError::ConnectFailure(e),
                ));
            }
        };

        let Some(session) = self.commit(epoch, &peripheral, streams) else {
            warn!("Connection to {} torn down while connecting", candidate.address);
            return Err(LinkError::ConnectFailure(TransportError::Disconnected));
        };
        info!(
            "Connected to {} (session {})",
            candidate.address, session
        );
        Ok(())
    }

    async fn ensure_permission(&self) -> Result<(), LinkError> {
        let granted = self.state().permission_granted;
        if granted {
            return Ok(());
        }
        if self.permission.request_permission().await {
            info!("Successfully got radio permission");
            self.state().permission_granted = true;
            Ok(())
        } else {
            error!("Failed to get required radio permission");
            self.locator.stop_scan().await;
            self.set_status(ConnectionState::Disconnected);
            Err(LinkError::PermissionDenied)
        }
    }

    /// Discover the capability set and open a monitor per signal
    async fn open_monitors(
        &self,
        peripheral: &dyn PeripheralLink,
    ) -> Result<Vec<(SignalKind, MonitorStream)>, TransportError> {
        info!("Discovering services of {}...", peripheral.address());
        let exposed = peripheral.discover().await?;
        info!("Found {} characteristics", exposed.len());

        if !exposed.iter().any(|c| c.service == SERVICE_UUID) {
            return Err(TransportError::MissingService(SERVICE_UUID));
        }
        if !exposed.contains(&CharacteristicId::new(SERVICE_UUID, BRAKING_CHAR_UUID)) {
            warn!("Braking characteristic not exposed, braking writes will fail");
        }

        let mut streams = Vec::with_capacity(SignalKind::ALL.len());
        for kind in SignalKind::ALL {
            let id = CharacteristicId::new(SERVICE_UUID, protocol::signal_characteristic(kind));
            if !exposed.contains(&id) {
                // Older firmware has no distance sensor
                if kind == SignalKind::DistanceLeft {
                    warn!("No {} characteristic, not monitoring it", kind);
                    continue;
                }
                return Err(TransportError::CharacteristicNotFound {
                    service: id.service,
                    characteristic: id.characteristic,
                });
            }
            info!("Subscribing to {} characteristic {}", kind, id.characteristic);
            streams.push((kind, peripheral.monitor(id).await?));
        }
        Ok(streams)
    }

    /// Publish the connection and start monitor tasks in one step.
    ///
    /// Returns `None` if the pending connection was torn down meanwhile.
    fn commit(
        &self,
        epoch: u64,
        peripheral: &Arc<dyn PeripheralLink>,
        streams: Vec<(SignalKind, MonitorStream)>,
    ) -> Option<u64> {
        let mut state = self.state();
        if state.epoch != epoch {
            return None;
        }
        match &state.pending {
            Some(pending) if Arc::ptr_eq(pending, peripheral) => {}
            _ => return None,
        }

        let session = self.next_session.fetch_add(1, Ordering::Relaxed) + 1;
        // Spawned under the lock: a task reporting loss blocks until committed
        let monitors = streams
            .into_iter()
            .map(|(kind, stream)| {
                tokio::spawn(run_monitor(
                    kind,
                    stream,
                    Arc::clone(&self.hub),
                    Arc::clone(&self.state),
                    session,
                ))
            })
            .collect();

        state.pending = None;
        state.handle = Some(LinkHandle {
            session,
            peripheral: Arc::clone(peripheral),
            monitors,
        });
        state.status = ConnectionState::Connected;
        Some(session)
    }

    /// Park a fresh connection as pending. False if a teardown got there first.
    fn hold_pending(&self, epoch: u64, peripheral: &Arc<dyn PeripheralLink>) -> bool {
        let mut state = self.state();
        if state.epoch != epoch {
            return false;
        }
        state.pending = Some(Arc::clone(peripheral));
        true
    }

    /// Disconnect a connection whose setup failed.
    ///
    /// It stays pending until the disconnect has returned, so a deadline
    /// firing mid-disconnect still finds it in `abandon_attempt`.
    async fn fail_pending(&self, epoch: u64, peripheral: &Arc<dyn PeripheralLink>) {
        let still_pending = {
            let state = self.state();
            state.epoch == epoch
                && matches!(&state.pending, Some(p) if Arc::ptr_eq(p, peripheral))
        };
        if !still_pending {
            return;
        }
        if let Err(e) = peripheral.disconnect().await {
            warn!("Failed to disconnect from {}: {}", peripheral.address(), e);
        }
        let mut state = self.state();
        if matches!(&state.pending, Some(p) if Arc::ptr_eq(p, peripheral)) {
            state.pending = None;
        }
    }

    async fn abandon_attempt(&self) {
        let pending = {
            let mut state = self.state();
            if state.handle.is_none() {
                state.status = ConnectionState::Disconnected;
            }
            state.pending.take()
        };
        if let Some(peripheral) = pending {
            info!("Dropping half-open connection to {}", peripheral.address());
            if let Err(e) = peripheral.disconnect().await {
                warn!("Failed to disconnect from {}: {}", peripheral.address(), e);
            }
        }
    }

    /// Write the braking command. Failures are logged, never returned.
    pub async fn write_braking(&self, active: bool) {
        let peripheral = self
            .state()
            .handle
            .as_ref()
            .map(|handle| Arc::clone(&handle.peripheral));
        let Some(peripheral) = peripheral else {
            warn!("Cannot write braking={}: not connected", active);
            return;
        };

        let id = CharacteristicId::new(SERVICE_UUID, BRAKING_CHAR_UUID);
        let envelope = protocol::encode_braking(active);
        match peripheral.write_with_response(id, &envelope).await {
            Ok(()) => debug!("Braking set to {}", active),
            Err(e) => error!("Failed to write braking={}: {}", active, e),
        }
    }

    /// Best-effort teardown. Never fails; a second call is a logged no-op.
    ///
    /// Also cuts short an attempt in flight: its scan is stopped and it can
    /// no longer commit a connection.
    pub async fn destroy_connection(&self) {
        let (handle, pending) = {
            let mut state = self.state();
            state.status = ConnectionState::Disconnected;
            state.epoch = state.epoch.wrapping_add(1);
            (state.handle.take(), state.pending.take())
        };
        self.locator.stop_scan().await;

        let peripheral = match (handle, pending) {
            (Some(handle), _) => {
                handle.abort_monitors();
                handle.peripheral
            }
            (None, Some(pending)) => pending,
            (None, None) => {
                warn!("No BLE connection to destroy");
                return;
            }
        };

        match peripheral.disconnect().await {
            Ok(()) => info!("Destroyed BLE connection to {}", peripheral.address()),
            Err(e) => warn!("Failed to destroy BLE connection: {}", e),
        }
    }
}

/// Decode and fan out notifications of one characteristic until the link fails
async fn run_monitor(
    kind: SignalKind,
    mut stream: MonitorStream,
    hub: Arc<SubscriptionHub>,
    state: Arc<Mutex<LinkState>>,
    session: u64,
) {
    while let Some(event) = stream.next().await {
        match event {
            Ok(Some(envelope)) => match protocol::decode_signal(kind, &envelope) {
                Ok(value) => {
                    trace!("{}: {}", kind, value);
                    hub.publish(Reading::new(kind, value));
                }
                Err(e) => warn!("Monitor {}: dropping payload: {}", kind, e),
            },
            Ok(None) => warn!("Monitor {}: no data", kind),
            Err(e) => {
                error!("Monitor {}: {}", kind, e);
                mark_link_lost(&state, session);
                return;
            }
        }
    }
    warn!("Monitor {}: notification stream closed", kind);
    mark_link_lost(&state, session);
}

/// Drop the handle of `session` after a transport failure. Listeners are
/// not told; they observe `is_connected() == false`.
fn mark_link_lost(state: &Mutex<LinkState>, session: u64) {
    let mut state = lock_state(state);
    let current = state.handle.as_ref().map(|handle| handle.session);
    if current != Some(session) {
        debug!("Ignoring loss report from stale session {}", session);
        return;
    }
    if let Some(handle) = state.handle.take() {
        handle.abort_monitors();
    }
    state.status = ConnectionState::Error;
    warn!("Link lost (session {}), marked disconnected", session);
}
