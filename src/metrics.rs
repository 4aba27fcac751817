/// Metrics and telemetry for the vault pipeline
///
/// Provides Prometheus-compatible metrics for monitoring:
/// - Event publishing, supersession and terminal outcomes
/// - Worker retries
/// - Commit batching (size, duration, failures)
/// - Watcher self-change suppression

use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge_vec,
    Encoder, Histogram, IntCounter, IntCounterVec, IntGaugeVec, TextEncoder,
};

lazy_static! {
    // ========== Event Metrics ==========

    /// Events published by operation kind
    pub static ref EVENTS_PUBLISHED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "vault_events_published_total",
        "Total number of events published",
        &["kind"]
    )
    .unwrap();

    /// Events that reached completed or failed
    pub static ref EVENTS_FINISHED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "vault_events_finished_total",
        "Total number of events that reached a terminal status",
        &["root", "status"]
    )
    .unwrap();

    /// Pending events replaced by a newer intent
    pub static ref EVENTS_SUPERSEDED_TOTAL: IntCounter = register_int_counter!(
        "vault_events_superseded_total",
        "Total number of pending events superseded"
    )
    .unwrap();

    /// Transient failures that returned an event to pending
    pub static ref EVENT_RETRIES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "vault_event_retries_total",
        "Total number of event retries",
        &["root"]
    )
    .unwrap();

    // ========== Commit Metrics ==========

    /// Commit attempts by outcome (committed, empty, failed)
    pub static ref COMMITS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "vault_commits_total",
        "Total number of commit attempts",
        &["root", "outcome"]
    )
    .unwrap();

    /// Commit duration in seconds, including lock wait
    pub static ref COMMIT_DURATION_SECONDS: Histogram = register_histogram!(
        "vault_commit_duration_seconds",
        "Batched commit latencies in seconds",
        vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
    )
    .unwrap();

    /// Paths per commit
    pub static ref COMMIT_BATCH_SIZE: Histogram = register_histogram!(
        "vault_commit_batch_size",
        "Number of paths covered by one commit",
        vec![1.0, 2.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 1000.0]
    )
    .unwrap();

    /// Paths staged but not yet committed
    pub static ref PENDING_COMMIT_PATHS: IntGaugeVec = register_int_gauge_vec!(
        "vault_pending_commit_paths",
        "Number of staged paths awaiting commit",
        &["root"]
    )
    .unwrap();

    // ========== Watcher Metrics ==========

    /// Notifications dropped because the worker caused them
    pub static ref WATCHER_SUPPRESSED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "vault_watcher_suppressed_total",
        "Total number of watcher notifications suppressed as self-caused",
        &["root"]
    )
    .unwrap();
}

/// Render metrics in Prometheus text format
pub fn render_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

/// Record an event reaching completed or failed
pub fn record_event_finished(root: &str, status: &str) {
    EVENTS_FINISHED_TOTAL.with_label_values(&[root, status]).inc();
}

/// Record a commit attempt
pub fn record_commit(root: &str, outcome: &str, paths: usize, duration: f64) {
    COMMITS_TOTAL.with_label_values(&[root, outcome]).inc();
    COMMIT_DURATION_SECONDS.observe(duration);
    if outcome == "committed" {
        COMMIT_BATCH_SIZE.observe(paths as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_commit() {
        record_commit("metrics-test", "committed", 3, 0.2);
        let metrics = render_metrics();
        assert!(metrics.contains("vault_commits_total"));
        assert!(metrics.contains("vault_commit_batch_size"));
    }

    #[test]
    fn test_record_event_finished() {
        record_event_finished("metrics-test", "completed");
        let metrics = render_metrics();
        assert!(metrics.contains("vault_events_finished_total"));
    }
}
