//! Consumer metrics
//!
//! Prometheus-compatible series for:
//! - Claims and consumption outcomes per queue
//! - Handler latency and retries
//! - Lease renewal
//! - Rebalances and poll errors

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record a message claimed by a container
pub fn record_message_claimed(queue: &str, mode: &str) {
    counter!(
        "redismq_messages_claimed_total",
        "queue" => queue.to_string(),
        "mode" => mode.to_string()
    )
    .increment(1);
}

/// Record a claim lost to another client
pub fn record_claim_contended(queue: &str) {
    counter!(
        "redismq_claims_contended_total",
        "queue" => queue.to_string()
    )
    .increment(1);
}

/// Record a terminal consumption outcome
pub fn record_message_consumed(queue: &str, outcome: &str) {
    counter!(
        "redismq_messages_consumed_total",
        "queue" => queue.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

pub fn record_consume_duration(queue: &str, duration: Duration) {
    histogram!(
        "redismq_consume_duration_seconds",
        "queue" => queue.to_string()
    )
    .record(duration.as_secs_f64());
}

pub fn record_retry(queue: &str) {
    counter!(
        "redismq_consume_retries_total",
        "queue" => queue.to_string()
    )
    .increment(1);
}

/// Update in-flight workers gauge
pub fn set_in_flight(queue: &str, count: u32) {
    gauge!(
        "redismq_in_flight",
        "queue" => queue.to_string()
    )
    .set(count as f64);
}

pub fn record_lease_renewal(queue: &str, renewed: bool) {
    counter!(
        "redismq_lease_renewals_total",
        "queue" => queue.to_string(),
        "renewed" => renewed.to_string()
    )
    .increment(1);
}

/// Record a poll pass that failed against the store
pub fn record_poll_error(queue: &str, kind: &str) {
    counter!(
        "redismq_poll_errors_total",
        "queue" => queue.to_string(),
        "kind" => kind.to_string()
    )
    .increment(1);
}

/// Record an undecodable member dropped from a queue
pub fn record_malformed_message(queue: &str) {
    counter!(
        "redismq_malformed_messages_total",
        "queue" => queue.to_string()
    )
    .increment(1);
}

/// Record a completed rebalance and the resulting share
pub fn record_rebalance(owned: usize) {
    counter!("redismq_rebalances_total").increment(1);
    gauge!("redismq_owned_virtual_queues").set(owned as f64);
}

pub fn set_live_clients(count: usize) {
    gauge!("redismq_live_clients").set(count as f64);
}
