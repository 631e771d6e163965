use lazy_static::lazy_static;
use prometheus::{
    Counter, Encoder, Gauge, Histogram, HistogramOpts, IntCounterVec, Opts, Registry, TextEncoder,
};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref READINGS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "octa_readings_total",
        "Total readings received over HTTP"
    ))
    .unwrap();
    pub static ref VALID_READINGS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "octa_valid_readings_total",
        "Total readings accepted after validation"
    ))
    .unwrap();
    pub static ref INVALID_READINGS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "octa_invalid_readings_total",
        "Total readings rejected by validation"
    ))
    .unwrap();
    pub static ref DB_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "octa_db_failures_total",
        "Total database insert failures"
    ))
    .unwrap();
    pub static ref INGEST_LATENCY_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "octa_ingest_latency_seconds",
            "Time taken to ingest batch into DB"
        )
        .buckets(vec![
            0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0
        ])
    )
    .unwrap();
    pub static ref BATCH_SIZE: Gauge = Gauge::with_opts(Opts::new(
        "octa_batch_size",
        "Current batch size being processed"
    ))
    .unwrap();
    pub static ref CHANNEL_FULL_TOTAL: Counter = Counter::with_opts(Opts::new(
        "octa_channel_full_total",
        "Total number of times the reading channel was full (backpressure events)"
    ))
    .unwrap();
    pub static ref RECONCILE_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "octa_reconcile_total",
            "Actuator reconciliations by outcome"
        ),
        &["outcome"]
    )
    .unwrap();
    pub static ref RELAY_COMMANDS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "octa_relay_commands_total",
        "Total user relay commands accepted"
    ))
    .unwrap();
}

pub fn init_metrics() {
    REGISTRY.register(Box::new(READINGS_TOTAL.clone())).unwrap();
    REGISTRY
        .register(Box::new(VALID_READINGS_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(INVALID_READINGS_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(DB_FAILURES_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(INGEST_LATENCY_SECONDS.clone()))
        .unwrap();
    REGISTRY.register(Box::new(BATCH_SIZE.clone())).unwrap();
    REGISTRY
        .register(Box::new(CHANNEL_FULL_TOTAL.clone()))
        .unwrap();
    REGISTRY.register(Box::new(RECONCILE_TOTAL.clone())).unwrap();
    REGISTRY
        .register(Box::new(RELAY_COMMANDS_TOTAL.clone()))
        .unwrap();
}

pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# failed to encode metrics: {}\n", e);
    }
    String::from_utf8(buffer).unwrap_or_default()
}
