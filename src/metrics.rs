//! Prometheus metrics registry and instruments.
//!
//! This module is framework-agnostic and can be used from any layer.

use lazy_static::lazy_static;
use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // Ingestion Metrics
    pub static ref INGEST_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("mergeline_ingest_total", "Total number of ingest calls"),
        &["entity", "outcome"]
    ).expect("metric can be created");
    pub static ref INGEST_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "mergeline_ingest_duration_seconds",
            "Duration of a top-level ingest call in seconds"
        ).buckets(vec![0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        &["entity"]
    ).expect("metric can be created");
    pub static ref INGEST_CONFLICTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("mergeline_ingest_conflicts_total", "Inserts that lost a uniqueness race and fell back to update"),
        &["entity"]
    ).expect("metric can be created");

    // Download Metrics
    pub static ref DOWNLOADS_ENQUEUED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("mergeline_downloads_enqueued_total", "Download descriptors handed to the coordinator"),
        &["download_kind", "outcome"]
    ).expect("metric can be created");

    // Timeline Metrics
    pub static ref TIMELINE_QUERIES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("mergeline_timeline_queries_total", "Total number of timeline queries"),
        &["timeline_kind"]
    ).expect("metric can be created");
}

/// Initialize metrics registry.
pub fn init_metrics() {
    REGISTRY
        .register(Box::new(INGEST_TOTAL.clone()))
        .expect("INGEST_TOTAL can be registered");
    REGISTRY
        .register(Box::new(INGEST_DURATION_SECONDS.clone()))
        .expect("INGEST_DURATION_SECONDS can be registered");
    REGISTRY
        .register(Box::new(INGEST_CONFLICTS_TOTAL.clone()))
        .expect("INGEST_CONFLICTS_TOTAL can be registered");
    REGISTRY
        .register(Box::new(DOWNLOADS_ENQUEUED_TOTAL.clone()))
        .expect("DOWNLOADS_ENQUEUED_TOTAL can be registered");
    REGISTRY
        .register(Box::new(TIMELINE_QUERIES_TOTAL.clone()))
        .expect("TIMELINE_QUERIES_TOTAL can be registered");

    tracing::info!("Metrics registry initialized");
}

/// Render all registered metrics in Prometheus text format.
pub fn gather_text() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}
