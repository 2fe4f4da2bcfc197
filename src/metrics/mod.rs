use std::net::SocketAddr;

use eyre::{bail, Result};
use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;

//  Counters ----------------------------------------------------------------
const LOG_MESSAGES_COUNTER: &str = "log_messages_processed_counter";
const ANNOUNCEMENTS_COUNTER: &str = "announcements_decrypted_counter";
const ADMITTED_ROUTES_COUNTER: &str = "admitted_routes_counter";
const REJECTED_ROUTES_COUNTER: &str = "rejected_routes_counter";
const CHALLENGES_FAILED_COUNTER: &str = "challenges_failed_counter";
const CONFIRMATIONS_FAILED_COUNTER: &str = "confirmations_failed_counter";

//  Gauges ------------------------------------------------------------------
const CONSUMER_CURSOR: &str = "consumer_cursor";

/// Metrics for the route-admission pipeline.
#[derive(Debug, Clone, Copy)]
pub struct RelayMetrics;

#[allow(missing_docs)]
impl RelayMetrics {
    pub fn describe_all() {
        // Counters
        describe_counter!(LOG_MESSAGES_COUNTER, "Total number of log messages processed");
        describe_counter!(
            ANNOUNCEMENTS_COUNTER,
            "Total number of announcements decrypted for this relay"
        );
        describe_counter!(ADMITTED_ROUTES_COUNTER, "Total number of routes admitted");
        describe_counter!(
            REJECTED_ROUTES_COUNTER,
            "Total number of routes rejected by the validator"
        );
        describe_counter!(
            CHALLENGES_FAILED_COUNTER,
            "Total number of routes that failed their liveness challenge"
        );
        describe_counter!(
            CONFIRMATIONS_FAILED_COUNTER,
            "Total number of confirmations that could not be delivered"
        );

        // Gauges
        describe_gauge!(CONSUMER_CURSOR, "Last fully admitted sequence number per topic");
    }

    pub fn increment_log_messages_count() {
        counter!(LOG_MESSAGES_COUNTER).increment(1);
    }

    pub fn increment_announcements_count() {
        counter!(ANNOUNCEMENTS_COUNTER).increment(1);
    }

    pub fn increment_admitted_routes_count(count: usize) {
        counter!(ADMITTED_ROUTES_COUNTER).increment(count as u64);
    }

    pub fn increment_rejected_routes_count(reason: &'static str) {
        counter!(REJECTED_ROUTES_COUNTER, &[("reason", reason)]).increment(1);
    }

    pub fn increment_challenges_failed_count(reason: &'static str) {
        counter!(CHALLENGES_FAILED_COUNTER, &[("reason", reason)]).increment(1);
    }

    pub fn increment_confirmations_failed_count() {
        counter!(CONFIRMATIONS_FAILED_COUNTER).increment(1);
    }

    pub fn set_consumer_cursor(topic: &str, seq: u64) {
        gauge!(CONSUMER_CURSOR, &[("topic", topic.to_string())]).set(seq as f64);
    }
}

pub fn run_metrics_server(metrics_port: u16) -> Result<()> {
    let prometheus_addr = SocketAddr::from(([0, 0, 0, 0], metrics_port));
    let builder = PrometheusBuilder::new().with_http_listener(prometheus_addr);

    if let Err(e) = builder.install() {
        bail!("failed to run a metrics server {:?}", e);
    } else {
        info!(
            "a metrics server running. Serving Prometheus metrics at: http://{}",
            prometheus_addr
        );
    }

    RelayMetrics::describe_all();

    Ok(())
}
