//! Pure calculation of when the next refresh attempt should start.

// self
use crate::_prelude::*;

/// Below this remaining lifetime, refresh immediately rather than scheduling.
const IMMEDIATE_REFRESH_THRESHOLD: Duration = Duration::from_secs(60 * 60);

/// Compute the delay, from `now`, until the next refresh should start.
///
/// Refreshes at the midpoint of the certificate's remaining lifetime, giving
/// callers ample headroom before expiry while avoiding refresh storms on
/// long-lived certificates. When less than an hour of lifetime remains, the
/// next refresh is due immediately (delay of zero).
pub fn next_refresh_delay(now: Instant, expiration: Instant) -> Duration {
	let lifetime = expiration.saturating_duration_since(now);

	if lifetime < IMMEDIATE_REFRESH_THRESHOLD { Duration::ZERO } else { lifetime / 2 }
}
