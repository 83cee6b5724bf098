//! Caller-side rate limiting for reading listeners.
//!
//! The subscription hub never drops readings; a caller that only wants an
//! update every few seconds wraps its listener before subscribing.

use crate::domain::models::Reading;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Wrap `listener` so it runs at most once per `interval`.
///
/// The first reading passes straight through; readings arriving before the
/// interval has elapsed since the last delivered one are discarded.
pub fn throttle<F>(interval: Duration, listener: F) -> impl Fn(Reading) + Send + Sync + 'static
where
    F: Fn(Reading) + Send + Sync + 'static,
{
    let last_delivery: Mutex<Option<Instant>> = Mutex::new(None);
    move |reading| {
        let now = Instant::now();
        {
            let mut last = last_delivery
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if let Some(previous) = *last {
                if now.duration_since(previous) < interval {
                    return;
                }
            }
            *last = Some(now);
        }
        listener(reading);
    }
}
