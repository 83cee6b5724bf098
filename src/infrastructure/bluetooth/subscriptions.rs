//! Listener registries and reading fan-out.

use crate::domain::models::{Reading, SignalKind};
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::error;

pub type Listener = Arc<dyn Fn(Reading) + Send + Sync>;

/// Handle returned by [`SubscriptionHub::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Default)]
pub struct SubscriptionHub {
    next_id: AtomicU64,
    registries: Mutex<HashMap<SignalKind, Vec<(SubscriptionId, Listener)>>>,
}

impl SubscriptionHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn registries(&self) -> MutexGuard<'_, HashMap<SignalKind, Vec<(SubscriptionId, Listener)>>> {
        self.registries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a listener for `kind`. Listeners run in subscription order.
    pub fn subscribe<F>(&self, kind: SignalKind, listener: F) -> SubscriptionId
    where
        F: Fn(Reading) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.registries()
            .entry(kind)
            .or_default()
            .push((id, Arc::new(listener)));
        id
    }

    /// Remove a listener. Returns `false` if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut registries = self.registries();
        for listeners in registries.values_mut() {
            if let Some(pos) = listeners.iter().position(|(sid, _)| *sid == id) {
                listeners.remove(pos);
                return true;
            }
        }
        false
    }

    pub fn listener_count(&self, kind: SignalKind) -> usize {
        self.registries().get(&kind).map_or(0, Vec::len)
    }

    /// Deliver `reading` to every listener of its kind.
    ///
    /// A panicking listener is logged and skipped. Returns how many
    /// listeners completed.
    pub fn publish(&self, reading: Reading) -> usize {
        // Snapshot so listeners may (un)subscribe without deadlocking
        let listeners: Vec<Listener> = self
            .registries()
            .get(&reading.kind)
            .map(|l| l.iter().map(|(_, f)| Arc::clone(f)).collect())
            .unwrap_or_default();

        let mut delivered = 0;
        for listener in listeners {
            match panic::catch_unwind(AssertUnwindSafe(|| listener(reading))) {
                Ok(()) => delivered += 1,
                Err(_) => error!("{} listener panicked, continuing fan-out", reading.kind),
            }
        }
        delivered
    }
}
