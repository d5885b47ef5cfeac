//! Prometheus metrics for the relayer
//!
//! Exposes metrics on /metrics endpoint for Prometheus scraping.

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, CounterVec, Encoder, GaugeVec, TextEncoder,
};

lazy_static! {
    // Ingestion
    pub static ref BLOCKS_PROCESSED: CounterVec = register_counter_vec!(
        "vbank_blocks_processed_total",
        "Total number of external blocks classified",
        &["chain"]
    ).unwrap();

    pub static ref LATEST_BLOCK: GaugeVec = register_gauge_vec!(
        "vbank_latest_block",
        "Height of the newest locally synced external header",
        &["chain"]
    ).unwrap();

    pub static ref FORKS_DETECTED: CounterVec = register_counter_vec!(
        "vbank_forks_detected_total",
        "Header mismatches that triggered a one-block rollback",
        &["chain"]
    ).unwrap();

    // Classification
    pub static ref DEPOSITS_DETECTED: CounterVec = register_counter_vec!(
        "vbank_deposits_detected_total",
        "Deposits matched by the classifier",
        &["chain"]
    ).unwrap();

    pub static ref BROADCASTS_OBSERVED: CounterVec = register_counter_vec!(
        "vbank_broadcasts_observed_total",
        "Outbound multisig broadcasts observed on chain",
        &["chain", "type"]
    ).unwrap();

    // Confirmation
    pub static ref CALLBACKS: CounterVec = register_counter_vec!(
        "vbank_home_callbacks_total",
        "Home-chain callbacks by outcome",
        &["chain", "type", "outcome"]
    ).unwrap();

    pub static ref RECORDS_DROPPED: CounterVec = register_counter_vec!(
        "vbank_records_dropped_total",
        "Records dropped after a validation failure",
        &["chain", "type"]
    ).unwrap();

    // Resend
    pub static ref RESENDS: CounterVec = register_counter_vec!(
        "vbank_resends_total",
        "Outbound broadcast attempts by outcome",
        &["chain", "outcome"]
    ).unwrap();

    pub static ref RESEND_EXHAUSTED: CounterVec = register_counter_vec!(
        "vbank_resend_exhausted_total",
        "Records discarded after reaching the resend cap",
        &["chain"]
    ).unwrap();

    // Queue sizes
    pub static ref UNCONFIRMED_QUEUE: GaugeVec = register_gauge_vec!(
        "vbank_unconfirmed_queue",
        "Records waiting for confirmation depth",
        &["chain"]
    ).unwrap();

    pub static ref WAITING_QUEUE: GaugeVec = register_gauge_vec!(
        "vbank_waiting_queue",
        "Outbound broadcasts waiting for this node's turn",
        &["chain"]
    ).unwrap();

    pub static ref ERRORS: CounterVec = register_counter_vec!(
        "vbank_errors_total",
        "Errors by task and kind",
        &["chain", "task", "kind"]
    ).unwrap();
}

/// Render every registered metric in the Prometheus text format
pub fn gather() -> eyre::Result<String> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&prometheus::gather(), &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}
