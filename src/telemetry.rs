use crate::client::RequestId;
use crate::types::Timestamp;

use std::sync::Arc;

/// Structured, in-process event hook for observability.
///
/// This crate is a library and does not print. Callers provide an implementation that
/// forwards these events to `tracing`, metrics, or a custom sink; [`TracingEventListener`]
/// covers the common case.
pub trait TsdbEventListener: std::fmt::Debug + Send + Sync + 'static {
    fn on_event(&self, event: TsdbEvent);
}

/// Structured events emitted by the append engine and the collector.
#[derive(Debug, Clone, PartialEq)]
pub enum TsdbEvent {
    /// A sample behind the current chunk fell outside the late-write window and was dropped.
    LateWriteDropped { metric: String, t: Timestamp, last_t: Timestamp },
    /// A sample older than the newest one in its chunk was dropped (the codec does not sort).
    OutOfOrderDropped { metric: String, t: Timestamp, last_t: Timestamp },
    AdvanceConflict { metric: String, t: Timestamp },

    StateFetchSubmitted { metric: String, request_id: RequestId },
    StateRestored { metric: String, samples: usize },

    WriteSubmitted { metric: String, request_id: RequestId, bytes: usize },
    WriteAcked { metric: String, request_id: RequestId },
    WriteFailed { metric: String, error: String },
    PendingReplayFailed { metric: String, error: String },
    UnknownResponse { request_id: RequestId },

    AggregateFieldMissing { metric: String, attr: String },
    CollectorStarted { worker: usize },
    CollectorFinished { worker: usize, results: usize },
    CollectorFailed { worker: usize, error: String },
}

#[derive(Debug)]
pub struct NoopEventListener;

impl TsdbEventListener for NoopEventListener {
    #[inline]
    fn on_event(&self, _event: TsdbEvent) {}
}

pub fn noop_event_listener() -> Arc<dyn TsdbEventListener> {
    Arc::new(NoopEventListener)
}

/// Forwards events to `tracing`: failures at `warn`, drops at `debug`, the rest at `trace`.
#[derive(Debug, Default)]
pub struct TracingEventListener;

impl TsdbEventListener for TracingEventListener {
    fn on_event(&self, event: TsdbEvent) {
        match &event {
            TsdbEvent::WriteFailed { metric, error }
            | TsdbEvent::PendingReplayFailed { metric, error } => {
                tracing::warn!(metric = %metric, error = %error, "{:?}", event)
            }
            TsdbEvent::CollectorFailed { worker, error } => {
                tracing::warn!(worker, error = %error, "collector worker failed")
            }
            TsdbEvent::AdvanceConflict { metric, t } => {
                tracing::warn!(metric = %metric, t, "append beyond chunk while write in flight")
            }
            TsdbEvent::UnknownResponse { request_id } => {
                tracing::warn!(request_id, "response for unknown request")
            }
            TsdbEvent::AggregateFieldMissing { metric, attr } => {
                tracing::warn!(metric = %metric, attr = %attr, "requested aggregate not found in response")
            }
            TsdbEvent::LateWriteDropped { .. } | TsdbEvent::OutOfOrderDropped { .. } => {
                tracing::debug!("{:?}", event)
            }
            _ => tracing::trace!("{:?}", event),
        }
    }
}

pub fn tracing_event_listener() -> Arc<dyn TsdbEventListener> {
    Arc::new(TracingEventListener)
}

/// Metrics instrumentation via the `metrics` facade and optional in-process scraping.
///
/// Emitting is a no-op until a recorder is installed.
pub mod tsdb_metrics {
    use super::*;

    use ::metrics::{describe_counter, describe_histogram, Unit};
    use std::time::Duration;

    #[cfg(feature = "prometheus")]
    use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
    #[cfg(feature = "prometheus")]
    use std::sync::atomic::{AtomicBool, Ordering};
    #[cfg(feature = "prometheus")]
    use std::sync::Mutex;
    #[cfg(feature = "prometheus")]
    use std::thread::JoinHandle;

    pub const APPENDED_SAMPLES: &str = "kvtsdb_appended_samples";
    pub const LATE_WRITES_DROPPED: &str = "kvtsdb_late_writes_dropped";
    pub const OUT_OF_ORDER_DROPPED: &str = "kvtsdb_out_of_order_dropped";
    pub const ADVANCE_CONFLICTS: &str = "kvtsdb_advance_conflicts";
    pub const FLUSH_REQUESTS: &str = "kvtsdb_flush_requests";
    pub const FLUSH_BYTES: &str = "kvtsdb_flush_bytes";
    pub const FLUSH_FAILURES: &str = "kvtsdb_flush_failures";
    pub const FLUSH_ROUNDTRIP_SECONDS: &str = "kvtsdb_flush_roundtrip_seconds";
    pub const COLLECTOR_RESULTS: &str = "kvtsdb_collector_results";

    /// Handle to the in-process Prometheus recorder/scrape renderer.
    ///
    /// This does **not** start an HTTP server. Call [`InProcessPrometheus::render`] to scrape.
    #[cfg(feature = "prometheus")]
    #[derive(Debug)]
    pub struct InProcessPrometheus {
        handle: PrometheusHandle,
        stop: Arc<AtomicBool>,
        upkeep_thread: Mutex<Option<JoinHandle<()>>>,
    }

    #[cfg(feature = "prometheus")]
    impl InProcessPrometheus {
        /// Installs a global Prometheus recorder (once per process) and starts an upkeep thread.
        pub fn install(upkeep_interval: Duration) -> Result<Self, MetricsInitError> {
            describe_all();

            let handle = PrometheusBuilder::new()
                .install_recorder()
                .map_err(MetricsInitError::from_build_error)?;

            let stop = Arc::new(AtomicBool::new(false));
            let stop_clone = stop.clone();
            let handle_clone = handle.clone();
            let upkeep_thread = std::thread::Builder::new()
                .name("kvtsdb-metrics-upkeep".to_string())
                .spawn(move || {
                    while !stop_clone.load(Ordering::Relaxed) {
                        std::thread::sleep(upkeep_interval);
                        handle_clone.run_upkeep();
                    }
                })
                .map_err(|e| MetricsInitError::ThreadSpawn(e.to_string()))?;

            Ok(Self {
                handle,
                stop,
                upkeep_thread: Mutex::new(Some(upkeep_thread)),
            })
        }

        /// Renders the current metrics in the Prometheus text exposition format.
        pub fn render(&self) -> String {
            self.handle.render()
        }
    }

    #[cfg(feature = "prometheus")]
    impl Drop for InProcessPrometheus {
        fn drop(&mut self) {
            self.stop.store(true, Ordering::Relaxed);
            if let Ok(mut guard) = self.upkeep_thread.lock() {
                if let Some(t) = guard.take() {
                    let _ = t.join();
                }
            }
        }
    }

    #[cfg(feature = "prometheus")]
    #[derive(Debug, thiserror::Error)]
    pub enum MetricsInitError {
        #[error("metrics recorder already installed")]
        AlreadyInstalled,
        #[error("failed to install prometheus recorder: {0}")]
        Install(String),
        #[error("failed to spawn upkeep thread: {0}")]
        ThreadSpawn(String),
    }

    #[cfg(feature = "prometheus")]
    impl MetricsInitError {
        fn from_build_error(e: BuildError) -> Self {
            match e {
                BuildError::FailedToSetGlobalRecorder(_) => MetricsInitError::AlreadyInstalled,
                other => MetricsInitError::Install(other.to_string()),
            }
        }
    }

    #[inline]
    pub fn record_appended(samples: u64) {
        if samples > 0 {
            ::metrics::counter!(APPENDED_SAMPLES).increment(samples);
        }
    }

    #[inline]
    pub fn record_late_write_dropped() {
        ::metrics::counter!(LATE_WRITES_DROPPED).increment(1);
    }

    #[inline]
    pub fn record_out_of_order_dropped() {
        ::metrics::counter!(OUT_OF_ORDER_DROPPED).increment(1);
    }

    #[inline]
    pub fn record_advance_conflict() {
        ::metrics::counter!(ADVANCE_CONFLICTS).increment(1);
    }

    #[inline]
    pub fn record_flush_submitted(bytes: u64) {
        ::metrics::counter!(FLUSH_REQUESTS).increment(1);
        if bytes > 0 {
            ::metrics::counter!(FLUSH_BYTES).increment(bytes);
        }
    }

    #[inline]
    pub fn record_flush_failure() {
        ::metrics::counter!(FLUSH_FAILURES).increment(1);
    }

    #[inline]
    pub fn record_flush_roundtrip(duration: Duration) {
        ::metrics::histogram!(FLUSH_ROUNDTRIP_SECONDS).record(duration.as_secs_f64());
    }

    #[inline]
    pub fn record_collector_results(results: u64) {
        if results > 0 {
            ::metrics::counter!(COLLECTOR_RESULTS).increment(results);
        }
    }

    /// Registers descriptions for every metric with the installed recorder.
    pub fn describe_all() {
        describe_counter!(APPENDED_SAMPLES, Unit::Count, "Samples accepted into a chunk.");
        describe_counter!(
            LATE_WRITES_DROPPED,
            Unit::Count,
            "Samples dropped because they were older than the late-write window."
        );
        describe_counter!(
            OUT_OF_ORDER_DROPPED,
            Unit::Count,
            "Samples dropped because they were older than the newest sample of their chunk."
        );
        describe_counter!(
            ADVANCE_CONFLICTS,
            Unit::Count,
            "Appends rejected because the next chunk buffer still had a write in flight."
        );
        describe_counter!(FLUSH_REQUESTS, Unit::Count, "Chunk update requests submitted.");
        describe_counter!(FLUSH_BYTES, Unit::Bytes, "Encoded chunk bytes shipped in update requests.");
        describe_counter!(FLUSH_FAILURES, Unit::Count, "Update requests rejected or failed.");
        describe_counter!(
            COLLECTOR_RESULTS,
            Unit::Count,
            "Per-partition query results processed by collector workers."
        );
        describe_histogram!(
            FLUSH_ROUNDTRIP_SECONDS,
            Unit::Seconds,
            "Time from update submission to acknowledgement."
        );
    }
}
