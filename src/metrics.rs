//! Metrics helpers and per-instance telemetry bookkeeping.

// std
use std::sync::{
	OnceLock,
	atomic::{AtomicU64, Ordering},
};
// crates.io
use metrics::Label;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use smallvec::SmallVec;
// self
use crate::_prelude::*;

type LabelSet = SmallVec<[Label; 2]>;

const METRIC_RESOLVE_TOTAL: &str = "cloudsql_connect_resolve_total";
const METRIC_RESOLVE_IMMEDIATE_TOTAL: &str = "cloudsql_connect_resolve_immediate_total";
const METRIC_RESOLVE_WAITED_TOTAL: &str = "cloudsql_connect_resolve_waited_total";
const METRIC_REFRESH_TOTAL: &str = "cloudsql_connect_refresh_total";
const METRIC_REFRESH_DURATION: &str = "cloudsql_connect_refresh_duration_seconds";
const METRIC_REFRESH_ERRORS: &str = "cloudsql_connect_refresh_errors_total";

/// Shared Prometheus handle installed by [`install_default_exporter`].
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Thread-safe metrics accumulator for a single instance's [`crate::cache::refresher::Refresher`].
#[derive(Debug, Default)]
pub struct InstanceMetrics {
	total_resolves: AtomicU64,
	immediate_resolves: AtomicU64,
	waited_resolves: AtomicU64,
	refresh_successes: AtomicU64,
	refresh_errors: AtomicU64,
	last_refresh_micros: AtomicU64,
}
impl InstanceMetrics {
	/// Create a new metrics accumulator.
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	/// Record a `getData` call, noting whether the current value was already resolved.
	pub fn record_resolve(&self, waited: bool) {
		self.total_resolves.fetch_add(1, Ordering::Relaxed);

		if waited {
			self.waited_resolves.fetch_add(1, Ordering::Relaxed);
		} else {
			self.immediate_resolves.fetch_add(1, Ordering::Relaxed);
		}
	}

	/// Record a successful refresh and its fetch latency.
	pub fn record_refresh_success(&self, duration: Duration) {
		self.refresh_successes.fetch_add(1, Ordering::Relaxed);
		self.last_refresh_micros.store(duration.as_micros() as u64, Ordering::Relaxed);
	}

	/// Record a refresh attempt that failed.
	pub fn record_refresh_error(&self) {
		self.refresh_errors.fetch_add(1, Ordering::Relaxed);
	}

	/// Take a point-in-time snapshot for status reporting.
	pub fn snapshot(&self) -> InstanceMetricsSnapshot {
		InstanceMetricsSnapshot {
			total_resolves: self.total_resolves.load(Ordering::Relaxed),
			immediate_resolves: self.immediate_resolves.load(Ordering::Relaxed),
			waited_resolves: self.waited_resolves.load(Ordering::Relaxed),
			refresh_successes: self.refresh_successes.load(Ordering::Relaxed),
			refresh_errors: self.refresh_errors.load(Ordering::Relaxed),
			last_refresh_micros: match self.last_refresh_micros.load(Ordering::Relaxed) {
				0 => None,
				value => Some(value),
			},
		}
	}
}

/// Read-only snapshot of per-instance telemetry counters.
#[derive(Clone, Debug)]
pub struct InstanceMetricsSnapshot {
	/// Total number of `getData` calls observed.
	pub total_resolves: u64,
	/// Count of calls served from an already-resolved current value.
	pub immediate_resolves: u64,
	/// Count of calls that had to wait on an in-flight or scheduled refresh.
	pub waited_resolves: u64,
	/// Count of successful refresh attempts.
	pub refresh_successes: u64,
	/// Count of refresh attempts that resulted in an error.
	pub refresh_errors: u64,
	/// Microsecond latency of the most recent successful refresh.
	pub last_refresh_micros: Option<u64>,
}
impl InstanceMetricsSnapshot {
	/// Ratio of resolves that had to wait for a refresh rather than being served immediately.
	pub fn wait_ratio(&self) -> f64 {
		if self.total_resolves == 0 {
			0.0
		} else {
			self.waited_resolves as f64 / self.total_resolves as f64
		}
	}
}

/// Install the default Prometheus recorder backed by `metrics`.
///
/// Multiple invocations are safe; subsequent calls become no-ops once the recorder is installed.
pub fn install_default_exporter() -> Result<()> {
	if PROMETHEUS_HANDLE.get().is_some() {
		return Ok(());
	}

	let handle = PrometheusBuilder::new()
		.install_recorder()
		.map_err(|err| Error::Metrics(err.to_string()))?;
	let _ = PROMETHEUS_HANDLE.set(handle);

	Ok(())
}

/// Access the global Prometheus exporter handle when installed.
pub fn prometheus_handle() -> Option<&'static PrometheusHandle> {
	PROMETHEUS_HANDLE.get()
}

/// Record a `getData` resolve, tagging whether the caller had to wait.
pub fn record_resolve(instance: &str, waited: bool) {
	let labels = instance_label(instance);

	metrics::counter!(METRIC_RESOLVE_TOTAL, labels.iter()).increment(1);

	if waited {
		metrics::counter!(METRIC_RESOLVE_WAITED_TOTAL, labels.iter()).increment(1);
	} else {
		metrics::counter!(METRIC_RESOLVE_IMMEDIATE_TOTAL, labels.iter()).increment(1);
	}
}

/// Record a successful refresh attempt along with its latency.
pub fn record_refresh_success(instance: &str, duration: Duration) {
	metrics::counter!(METRIC_REFRESH_TOTAL, status_labels(instance, "success").iter()).increment(1);
	metrics::histogram!(METRIC_REFRESH_DURATION, instance_label(instance).iter())
		.record(duration.as_secs_f64());
}

/// Record a failed refresh attempt.
pub fn record_refresh_error(instance: &str) {
	metrics::counter!(METRIC_REFRESH_TOTAL, status_labels(instance, "error").iter()).increment(1);
	metrics::counter!(METRIC_REFRESH_ERRORS, instance_label(instance).iter()).increment(1);
}

fn instance_label(instance: &str) -> LabelSet {
	let mut labels = LabelSet::with_capacity(1);

	labels.push(Label::new("instance", instance.to_owned()));

	labels
}

fn status_labels(instance: &str, status: &'static str) -> LabelSet {
	let mut labels = instance_label(instance);

	labels.push(Label::new("status", status));

	labels
}
