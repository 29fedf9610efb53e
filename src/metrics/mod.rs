//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Chain events seen by the tracker
//! - Status updates published to the watch-tower
//! - Redeem and refund submissions
//! - Swaps tracked and abandoned

use crate::error::{WatchtowerError, WatchtowerResult};
use crate::events::ChainType;

use axum::{http::StatusCode, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_gauge_vec, Counter,
    CounterVec, Encoder, Gauge, GaugeVec, TextEncoder,
};
use std::net::SocketAddr;
use tracing::info;

lazy_static! {
    // Tracker metrics
    pub static ref EVENTS_RECEIVED: CounterVec = register_counter_vec!(
        "watchtower_events_received_total",
        "Total chain events received by type",
        &["chain", "event_type"]
    ).unwrap();

    pub static ref STATUS_UPDATES: Counter = register_counter!(
        "watchtower_status_updates_total",
        "Total swap status updates published"
    ).unwrap();

    pub static ref TRACKED_SWAPS: Gauge = register_gauge!(
        "watchtower_tracker_swaps",
        "Unfinished swaps held by the tracker"
    ).unwrap();

    // Watch-tower metrics
    pub static ref SUBMISSIONS: CounterVec = register_counter_vec!(
        "watchtower_submissions_total",
        "Redeem and refund submissions by outcome",
        &["chain", "action", "outcome"]
    ).unwrap();

    pub static ref SWAPS_ABANDONED: Counter = register_counter!(
        "watchtower_swaps_abandoned_total",
        "Swaps given up after exhausting the retry budget"
    ).unwrap();

    pub static ref WATCHED_SWAPS: Gauge = register_gauge!(
        "watchtower_watched_swaps",
        "Swaps the watch-tower is acting on"
    ).unwrap();

    // Finished (tracker) and abandoned (watch-tower) swaps kept for the process lifetime
    pub static ref TOMBSTONED_SWAPS: GaugeVec = register_gauge_vec!(
        "watchtower_tombstoned_swaps",
        "Hashed secrets remembered to suppress late events",
        &["component"]
    ).unwrap();
}

/// Prometheus metrics server
pub struct MetricsServer {
    port: u16,
}

impl MetricsServer {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub async fn run(&self) -> WatchtowerResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| WatchtowerError::Internal(format!("metrics bind {}: {}", addr, e)))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| WatchtowerError::Internal(format!("metrics server: {}", e)))?;

        Ok(())
    }
}

async fn metrics_handler() -> Result<String, StatusCode> {
    render().map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

/// Encode every registered metric in the text exposition format
pub fn render() -> WatchtowerResult<String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| WatchtowerError::Internal(e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| WatchtowerError::Internal(e.to_string()))
}

// Helper functions to record metrics

pub fn record_event(chain: ChainType, event_type: &str) {
    EVENTS_RECEIVED
        .with_label_values(&[chain.as_str(), event_type])
        .inc();
}

pub fn record_status_update() {
    STATUS_UPDATES.inc();
}

pub fn record_tracked_swaps(count: usize) {
    TRACKED_SWAPS.set(count as f64);
}

pub fn record_submission(chain: ChainType, action: &str, succeeded: bool) {
    let outcome = if succeeded { "ok" } else { "failed" };
    SUBMISSIONS
        .with_label_values(&[chain.as_str(), action, outcome])
        .inc();
}

pub fn record_swap_abandoned() {
    SWAPS_ABANDONED.inc();
}

pub fn record_watched_swaps(count: usize) {
    WATCHED_SWAPS.set(count as f64);
}

pub fn record_tombstoned_swaps(component: &str, count: usize) {
    TOMBSTONED_SWAPS
        .with_label_values(&[component])
        .set(count as f64);
}
