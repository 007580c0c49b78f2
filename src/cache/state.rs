//! Promise-cell primitives backing the refresher's "current" and "next" slots.

// crates.io
use tokio::{sync::watch, task::JoinHandle};
// self
use crate::{_prelude::*, data::InstanceData};

/// What a single refresh attempt settled on.
pub type AttemptOutcome = std::result::Result<InstanceData, Arc<Error>>;

/// Result of waiting on a [`DataFuture`] up to a deadline.
#[derive(Debug)]
pub enum DataWait {
	/// The attempt succeeded.
	Ready(InstanceData),
	/// The attempt concluded with a failure; callers that have nothing better
	/// to fall back on re-raise this cause directly instead of inventing one.
	Failed(Arc<Error>),
	/// The handle was dropped without ever resolving.
	Closed,
	/// Neither of the above happened before the deadline.
	TimedOut,
}

/// A read-only handle to an attempt's outcome, resolved at most once.
///
/// Models the "future" referenced throughout the refresher design as a
/// concrete, clonable promise cell: multiple callers may await the same
/// handle, and a still-unresolved handle can be polled with a deadline.
/// Unlike a plain `Option<InstanceData>`, a handle backing a failed attempt
/// actually resolves — to the recorded cause — rather than being left to
/// dangle; `RefresherState::last_failure` mirrors the same cause for callers
/// that only need the most recent one, not a specific attempt's.
#[derive(Clone, Debug)]
pub struct DataFuture {
	receiver: watch::Receiver<Option<AttemptOutcome>>,
}
impl DataFuture {
	/// Build a handle paired with the sender that will resolve it.
	pub fn pending() -> (watch::Sender<Option<AttemptOutcome>>, Self) {
		let (sender, receiver) = watch::channel(None);

		(sender, Self { receiver })
	}

	/// Build a handle that is already resolved to a success.
	pub fn ready(data: InstanceData) -> Self {
		let (_sender, receiver) = watch::channel(Some(Ok(data)));

		Self { receiver }
	}

	/// Current value, if the attempt backing this handle has resolved.
	pub fn peek(&self) -> Option<AttemptOutcome> {
		self.receiver.borrow().clone()
	}

	/// True once this handle has resolved to a successful value.
	pub fn has_succeeded(&self) -> bool {
		matches!(self.peek(), Some(Ok(_)))
	}

	/// Wait up to `timeout` for this handle to resolve.
	pub async fn get(&self, timeout: Duration) -> DataWait {
		if let Some(outcome) = self.peek() {
			return match outcome {
				Ok(data) => DataWait::Ready(data),
				Err(cause) => DataWait::Failed(cause),
			};
		}

		let mut receiver = self.receiver.clone();
		let wait = async {
			loop {
				if receiver.changed().await.is_err() {
					return DataWait::Closed;
				}

				if let Some(outcome) = receiver.borrow().clone() {
					return match outcome {
						Ok(data) => DataWait::Ready(data),
						Err(cause) => DataWait::Failed(cause),
					};
				}
			}
		};

		tokio::time::timeout(timeout, wait).await.unwrap_or(DataWait::TimedOut)
	}
}

/// The scheduled-or-running next refresh attempt.
///
/// Wraps the spawned task driving the attempt so it can be cancelled
/// (timer removal only — see `Refresher::force_refresh`) without disturbing
/// a handle already shared with waiters.
#[derive(Debug)]
pub struct NextAttempt {
	future: DataFuture,
	handle: JoinHandle<()>,
}
impl NextAttempt {
	/// Pair a spawned task's handle with the future it will eventually resolve.
	pub fn new(future: DataFuture, handle: JoinHandle<()>) -> Self {
		Self { future, handle }
	}

	/// The handle callers/tests observe.
	pub fn future(&self) -> &DataFuture {
		&self.future
	}

	/// Cancel the underlying task. A no-op if it has already completed.
	///
	/// Safe to call unconditionally: by the time a scheduled attempt begins
	/// executing it marks the refresher as running, and callers only reach
	/// this method while the refresher is not running.
	pub fn cancel(&self) {
		self.handle.abort();
	}
}

/// Per-instance refresh bookkeeping, always accessed under a single guard.
#[derive(Debug)]
pub struct RefresherState {
	/// Result served to callers; never replaced by a failed attempt.
	pub current: DataFuture,
	/// In-flight or scheduled next attempt.
	pub next: NextAttempt,
	/// Whether a refresh attempt is actively running (post rate-limit, fetching).
	pub refresh_running: bool,
	/// Most recent refresh failure, cleared on the next success.
	pub last_failure: Option<Arc<Error>>,
}

/// Point-in-time view of a single instance's refresh state, for diagnostics.
///
/// Always available, regardless of the `metrics` feature: this reports the
/// state machine's own bookkeeping rather than accumulated counters.
#[derive(Clone, Debug)]
pub struct CacheStatus {
	/// Monotonic instant the status was captured.
	pub captured_at: Instant,
	/// Wall-clock mirror of `captured_at`.
	pub captured_at_wallclock: DateTime<Utc>,
	/// Whether a refresh attempt is actively running.
	pub refresh_running: bool,
	/// Whether `current` has resolved at least once.
	pub has_resolved: bool,
	/// Display of the most recent refresh failure, if any, cleared on success.
	pub last_failure: Option<String>,
}
