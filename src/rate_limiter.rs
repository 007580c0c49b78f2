//! Token-bucket-like gate enforcing a minimum interval between refresh attempts.

// crates.io
use tokio::{sync::Mutex, time};
// self
use crate::_prelude::*;

/// Asynchronous permit gate enforcing `MIN_REFRESH_DELAY_MS` between grants.
///
/// Exactly one logical bucket per instance; bursting beyond a single permit is
/// not permitted. Waiters queue FIFO on the internal mutex. Cancelling the
/// future returned by [`RateLimiter::acquire`] releases no reservation — the
/// next caller simply waits out whatever remains of the interval.
#[derive(Debug)]
pub struct RateLimiter {
	min_interval: Duration,
	last_permit: Mutex<Option<Instant>>,
}
impl RateLimiter {
	/// Build a limiter enforcing the given minimum interval between permits.
	pub fn new(min_interval: Duration) -> Self {
		Self { min_interval, last_permit: Mutex::new(None) }
	}

	/// Acquire a permit, suspending the caller (never blocking a worker thread)
	/// until the minimum interval since the previous grant has elapsed.
	pub async fn acquire(&self) {
		let mut last_permit = self.last_permit.lock().await;
		let now = Instant::now();

		if let Some(previous) = *last_permit {
			let earliest = previous + self.min_interval;

			if earliest > now {
				time::sleep_until(earliest).await;
			}
		}

		*last_permit = Some(Instant::now());
	}
}
