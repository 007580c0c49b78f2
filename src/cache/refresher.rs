//! Per-instance refresh state machine.
//!
//! Orchestrates rate-limit → fetch → schedule-next, maintaining a "current"
//! value served to callers and a "next" in-flight or scheduled attempt, with
//! force-refresh collapsing and failure isolation from the served value.

// crates.io
use tokio::{
	sync::{Mutex, watch},
	task::JoinHandle,
};
// self
use crate::{
	_prelude::*,
	cache::state::{AttemptOutcome, CacheStatus, DataFuture, DataWait, NextAttempt, RefresherState},
	data::InstanceData,
	instance::ConnectionConfig,
	keypair::KeyPair,
	rate_limiter::RateLimiter,
	refresh_calculator::next_refresh_delay,
	repository::ConnectionInfoRepository,
};
#[cfg(feature = "metrics")] use crate::metrics::InstanceMetrics;

/// Per-instance state machine orchestrating refresh of an instance's connection info.
pub struct Refresher<R> {
	instance_display: Arc<str>,
	config: Arc<ConnectionConfig>,
	repository: Arc<R>,
	key_pair: Arc<KeyPair>,
	rate_limiter: Arc<RateLimiter>,
	state: Arc<Mutex<RefresherState>>,
	#[cfg(feature = "metrics")]
	metrics: Arc<InstanceMetrics>,
}
impl<R> Clone for Refresher<R> {
	fn clone(&self) -> Self {
		Self {
			instance_display: self.instance_display.clone(),
			config: self.config.clone(),
			repository: self.repository.clone(),
			key_pair: self.key_pair.clone(),
			rate_limiter: self.rate_limiter.clone(),
			state: self.state.clone(),
			#[cfg(feature = "metrics")]
			metrics: self.metrics.clone(),
		}
	}
}
impl<R> std::fmt::Debug for Refresher<R> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Refresher").field("instance", &self.instance_display).finish_non_exhaustive()
	}
}
impl<R> Refresher<R>
where
	R: ConnectionInfoRepository + 'static,
{
	/// Build a refresher and immediately kick off the first fetch attempt.
	///
	/// `current` and `next` initially refer to the same unresolved attempt (I1).
	pub fn new(
		config: ConnectionConfig,
		repository: Arc<R>,
		key_pair: Arc<KeyPair>,
		rate_limiter: Arc<RateLimiter>,
	) -> Self {
		let instance_display: Arc<str> = config.instance.to_string().into();
		let config = Arc::new(config);
		let (sender, future) = DataFuture::pending();
		// Placeholder, replaced with the real handle below while `guard` is still held, so
		// the spawned fetch task can never observe (or race to overwrite) this entry.
		let placeholder = tokio::spawn(async {});
		let state = Arc::new(Mutex::new(RefresherState {
			current: future.clone(),
			next: NextAttempt::new(future.clone(), placeholder),
			refresh_running: true,
			last_failure: None,
		}));
		// Held across the spawn below: on a multi-thread runtime the spawned task could
		// otherwise race ahead to `handle_refresh_result` and have its state update
		// clobbered once this constructor finally patches in the real task handle.
		let mut guard = state
			.clone()
			.try_lock_owned()
			.expect("state is freshly constructed and not yet shared");
		let refresher = Self {
			instance_display,
			config,
			repository,
			key_pair,
			rate_limiter,
			state,
			#[cfg(feature = "metrics")]
			metrics: InstanceMetrics::new(),
		};
		let handle = refresher.clone().spawn_fetch(sender);

		guard.next = NextAttempt::new(future, handle);
		drop(guard);

		refresher
	}

	/// Read `currentInstanceData` and wait on it up to `timeout`.
	///
	/// While no refresh has ever succeeded, a failed attempt redirects `current`
	/// to the retry that replaces it (see `handle_refresh_result`), so this
	/// keeps following `current` until either a value arrives or `timeout`
	/// elapses — a caller that started waiting before the very first success
	/// still observes it. If the attempt `current` was bound to concludes with
	/// a failure and no time remains to pick up its replacement, that cause is
	/// unwrapped and re-raised directly; only a genuine timeout with nothing
	/// resolved produces `ConnectionFailedTimeout`/`ConnectionFailedWithCause`.
	#[tracing::instrument(skip(self), fields(instance = %self.instance_display))]
	pub async fn get_data(&self, timeout: Duration) -> Result<InstanceData> {
		let deadline = Instant::now() + timeout;
		let mut current = { self.state.lock().await.current.clone() };
		let already_resolved = current.has_succeeded();

		loop {
			let remaining = deadline.saturating_duration_since(Instant::now());

			if remaining.is_zero() {
				return Err(self.timeout_error(timeout).await);
			}

			match current.get(remaining).await {
				DataWait::Ready(data) => {
					#[cfg(feature = "metrics")]
					{
						crate::metrics::record_resolve(&self.instance_display, !already_resolved);
						self.metrics.record_resolve(!already_resolved);
					}

					return Ok(data);
				},
				DataWait::Failed(cause) => {
					if Instant::now() >= deadline {
						return Err(Error::Upstream(cause));
					}

					current = { self.state.lock().await.current.clone() };
				},
				DataWait::Closed => {
					if Instant::now() >= deadline {
						return Err(self.timeout_error(timeout).await);
					}

					current = { self.state.lock().await.current.clone() };
				},
				DataWait::TimedOut => return Err(self.timeout_error(timeout).await),
			}
		}
	}

	/// Reconstruct the error `get_data` reports once its deadline elapses with
	/// nothing resolved: the last recorded cause if one exists, else a bare timeout.
	async fn timeout_error(&self, timeout: Duration) -> Error {
		let last_failure = { self.state.lock().await.last_failure.clone() };

		match last_failure {
			Some(cause) => Error::ConnectionFailedWithCause { timeout, cause: cause.to_string() },
			None => Error::ConnectionFailedTimeout(timeout),
		}
	}

	/// Collapse any number of concurrent force-refresh requests onto one attempt.
	///
	/// A no-op while a refresh is already running (I5); otherwise cancels the
	/// merely-scheduled next attempt and starts a new one immediately.
	#[tracing::instrument(skip(self), fields(instance = %self.instance_display))]
	pub async fn force_refresh(&self) {
		let mut state = self.state.lock().await;

		if state.refresh_running {
			return;
		}

		state.next.cancel();
		state.refresh_running = true;
		state.next = self.spawn_running_attempt();
	}

	/// Diagnostic accessor to the currently-served handle.
	pub async fn get_current(&self) -> DataFuture {
		self.state.lock().await.current.clone()
	}

	/// Diagnostic accessor to the in-flight or scheduled handle.
	pub async fn get_next(&self) -> DataFuture {
		self.state.lock().await.next.future().clone()
	}

	/// Capture a point-in-time view of this instance's refresh state.
	pub async fn status(&self) -> CacheStatus {
		let state = self.state.lock().await;

		CacheStatus {
			captured_at: Instant::now(),
			captured_at_wallclock: Utc::now(),
			refresh_running: state.refresh_running,
			has_resolved: state.current.has_succeeded(),
			last_failure: state.last_failure.as_ref().map(|cause| cause.to_string()),
		}
	}

	/// Access the per-instance metrics accumulator.
	#[cfg(feature = "metrics")]
	pub fn metrics(&self) -> Arc<InstanceMetrics> {
		self.metrics.clone()
	}

	fn spawn_running_attempt(&self) -> NextAttempt {
		let (sender, future) = DataFuture::pending();
		let handle = self.clone().spawn_fetch(sender);

		NextAttempt::new(future, handle)
	}

	fn spawn_scheduled_attempt(&self, delay: Duration) -> NextAttempt {
		let (sender, future) = DataFuture::pending();
		let refresher = self.clone();
		let handle = tokio::spawn(async move {
			if !delay.is_zero() {
				tokio::time::sleep(delay).await;
			}

			{
				let mut state = refresher.state.lock().await;

				state.refresh_running = true;
			}

			refresher.fetch_and_handle(sender).await;
		});

		NextAttempt::new(future, handle)
	}

	fn spawn_fetch(self, sender: watch::Sender<Option<AttemptOutcome>>) -> JoinHandle<()> {
		tokio::spawn(async move { self.fetch_and_handle(sender).await })
	}

	async fn fetch_and_handle(&self, sender: watch::Sender<Option<AttemptOutcome>>) {
		self.rate_limiter.acquire().await;

		let started = Instant::now();
		let outcome = self.repository.fetch(&self.config, &self.key_pair).await;

		self.handle_refresh_result(outcome, started.elapsed(), sender).await;
	}

	#[cfg_attr(not(feature = "metrics"), allow(unused_variables))]
	async fn handle_refresh_result(
		&self,
		outcome: Result<InstanceData>,
		fetch_duration: Duration,
		sender: watch::Sender<Option<AttemptOutcome>>,
	) {
		match outcome {
			Ok(data) => {
				let delay = next_refresh_delay(Instant::now(), data.expiration);

				tracing::debug!(
					instance = %self.instance_display,
					delay_secs = delay.as_secs(),
					"refresh succeeded; scheduling next attempt"
				);
				#[cfg(feature = "metrics")]
				{
					crate::metrics::record_refresh_success(&self.instance_display, fetch_duration);
					self.metrics.record_refresh_success(fetch_duration);
				}

				// Wakes any caller still waiting on the attempt that produced this data.
				let _ = sender.send(Some(Ok(data.clone())));

				let mut state = self.state.lock().await;

				state.refresh_running = false;
				state.last_failure = None;
				state.current = DataFuture::ready(data);
				state.next = self.spawn_scheduled_attempt(delay);
			},
			Err(err) => {
				tracing::warn!(instance = %self.instance_display, error = %err, "refresh attempt failed");
				#[cfg(feature = "metrics")]
				{
					crate::metrics::record_refresh_error(&self.instance_display);
					self.metrics.record_refresh_error();
				}

				let cause = Arc::new(err);

				// Wakes any caller watching this exact attempt; harmless if nobody is.
				let _ = sender.send(Some(Err(cause.clone())));

				let mut state = self.state.lock().await;

				state.last_failure = Some(cause);

				let retry = self.spawn_running_attempt();

				// No success has ever landed: `current` would otherwise be left pointing at
				// this now-concluded attempt, so redirect it to the retry we just spawned —
				// a caller waiting on it keeps waiting instead of observing a dead handle.
				// Once a success has landed, `current` is pinned to that good value (I4).
				if !state.current.has_succeeded() {
					state.current = retry.future().clone();
				}

				// `refresh_running` is left `true`: the replacement attempt starts immediately,
				// still gated by the rate limiter, and this prevents concurrent retries (I2).
				state.next = retry;
			},
		}
	}
}
