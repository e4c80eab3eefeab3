//! Metrics definitions for the reconciliation services.
//!
//! This module defines all metrics used throughout the engine.
//! Metrics are collected using the `metrics` crate and can be exported
//! to Prometheus via `metrics-exporter-prometheus`.

use metrics::{counter, describe_counter, describe_histogram, histogram};
use std::time::Instant;

/// Initialize all metric descriptions.
/// Call this once at startup before any metrics are recorded.
pub fn init_metrics() {
    describe_counter!(
        "reconciliation_cycles_total",
        "Total number of completed reconciliation cycles"
    );
    describe_counter!(
        "reconciliation_cycle_failures_total",
        "Total number of reconciliation cycles aborted by an error"
    );
    describe_histogram!(
        "reconciliation_cycle_duration_seconds",
        "Time taken by one reconciliation cycle in seconds"
    );
    describe_counter!(
        "record_transitions_total",
        "Total number of ledger status transitions, by record kind and target status"
    );
    describe_counter!(
        "fees_recorded_total",
        "Total number of fee audit records inserted"
    );
    describe_counter!(
        "lost_races_total",
        "Total number of compare-and-set writes that found the record already moved"
    );
    describe_counter!(
        "tracker_lookup_errors_total",
        "Total number of failed indexer lookups in confirmation trackers"
    );
    describe_counter!(
        "submissions_total",
        "Total number of transaction submissions, by action and outcome"
    );
    describe_counter!(
        "retries_total",
        "Total number of retried transient failures, by operation"
    );
}

/// Record a completed reconciliation cycle.
pub fn record_cycle_completed() {
    counter!("reconciliation_cycles_total").increment(1);
}

/// Record an aborted reconciliation cycle.
pub fn record_cycle_failed() {
    counter!("reconciliation_cycle_failures_total").increment(1);
}

/// Record reconciliation cycle duration.
pub fn record_cycle_duration(duration_secs: f64) {
    histogram!("reconciliation_cycle_duration_seconds").record(duration_secs);
}

/// Record a status transition.
///
/// # Arguments
/// * `kind` - The record kind ("listing" or "purchase")
/// * `status` - The status the record moved to
pub fn record_transition(kind: &str, status: &str) {
    counter!("record_transitions_total", "kind" => kind.to_string(), "status" => status.to_string())
        .increment(1);
}

/// Record an inserted fee.
pub fn record_fee_recorded() {
    counter!("fees_recorded_total").increment(1);
}

/// Record a compare-and-set that lost to another writer.
pub fn record_lost_race(kind: &str) {
    counter!("lost_races_total", "kind" => kind.to_string()).increment(1);
}

/// Record a failed tracker lookup.
pub fn record_tracker_lookup_error() {
    counter!("tracker_lookup_errors_total").increment(1);
}

/// Record a submission outcome.
///
/// # Arguments
/// * `action` - The marketplace action ("list", "buy", ...)
/// * `outcome` - "submitted", "rejected", "no_rate" or "error"
pub fn record_submission(action: &str, outcome: &str) {
    counter!("submissions_total", "action" => action.to_string(), "outcome" => outcome.to_string())
        .increment(1);
}

/// Record a retried transient failure.
pub fn record_retry(operation: &str) {
    counter!("retries_total", "operation" => operation.to_string()).increment(1);
}

/// A timer that records the cycle duration when dropped.
pub struct CycleTimer {
    start: Instant,
}

impl CycleTimer {
    /// Start a new cycle timer.
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for CycleTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CycleTimer {
    fn drop(&mut self) {
        let duration = self.start.elapsed().as_secs_f64();
        record_cycle_duration(duration);
    }
}
