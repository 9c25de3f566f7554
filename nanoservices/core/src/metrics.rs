use once_cell::sync::Lazy;
use prometheus::{CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};

// Global registry and metrics are initialized lazily. A metric whose definition
// is rejected by the registry is simply not recorded.
static REGISTRY: Lazy<Registry> =
    Lazy::new(|| Registry::new_custom(Some("transitflow".to_string()), None).unwrap_or_default());

fn counter(name: &str, help: &str, labels: &[&str]) -> Option<CounterVec> {
    let c = CounterVec::new(Opts::new(name, help), labels).ok()?;
    REGISTRY.register(Box::new(c.clone())).ok();
    Some(c)
}

static FETCH_ATTEMPTS: Lazy<Option<CounterVec>> =
    Lazy::new(|| counter("fetch_attempts_total", "Fetch attempts by outcome", &["unit", "outcome"]));

static FAILURE_RECORDS: Lazy<Option<CounterVec>> =
    Lazy::new(|| counter("failure_records_total", "Failure records by error class", &["unit", "class"]));

static FAILURE_SINK_ERRORS: Lazy<Option<CounterVec>> =
    Lazy::new(|| counter("failure_sink_errors_total", "Failure batches the sink rejected", &[]));

static PAGES_LANDED: Lazy<Option<CounterVec>> =
    Lazy::new(|| counter("pages_landed_total", "Raw pages written to landing", &["unit"]));

static RAW_ROWS: Lazy<Option<CounterVec>> =
    Lazy::new(|| counter("raw_rows_total", "Rows appended to raw tables", &["unit"]));

static ROWS_REJECTED: Lazy<Option<CounterVec>> =
    Lazy::new(|| counter("rows_rejected_total", "Rows dropped by validation", &["unit", "reason"]));

static ROWS_MERGED: Lazy<Option<CounterVec>> =
    Lazy::new(|| counter("rows_merged_total", "Rows upserted into curated tables", &["unit"]));

static CYCLES: Lazy<Option<CounterVec>> =
    Lazy::new(|| counter("cycles_total", "Pipeline cycles by final status", &["pipeline", "status"]));

static CYCLE_DURATION_MS: Lazy<Option<HistogramVec>> = Lazy::new(|| {
    let opts = HistogramOpts::new("cycle_duration_ms", "Pipeline cycle duration in milliseconds")
        .buckets(prometheus::exponential_buckets(10.0, 4.0, 8).unwrap_or_default());
    let hist = HistogramVec::new(opts, &["pipeline"]).ok()?;
    REGISTRY.register(Box::new(hist.clone())).ok();
    Some(hist)
});

fn add(metric: &Lazy<Option<CounterVec>>, labels: &[&str], n: f64) {
    if let Some(c) = Lazy::force(metric) {
        c.with_label_values(labels).inc_by(n);
    }
}

pub fn inc_fetch_attempt(unit: &str, outcome: &str) {
    add(&FETCH_ATTEMPTS, &[unit, outcome], 1.0);
}

pub fn inc_failure(unit: &str, class: &str) {
    add(&FAILURE_RECORDS, &[unit, class], 1.0);
}

pub fn inc_failure_sink_error() {
    add(&FAILURE_SINK_ERRORS, &[], 1.0);
}

pub fn inc_pages_landed(unit: &str) {
    add(&PAGES_LANDED, &[unit], 1.0);
}

pub fn inc_raw_rows(unit: &str, n: u64) {
    add(&RAW_ROWS, &[unit], n as f64);
}

pub fn inc_rejected(unit: &str, reason: &str, n: u64) {
    add(&ROWS_REJECTED, &[unit, reason], n as f64);
}

pub fn inc_merged(unit: &str, n: u64) {
    add(&ROWS_MERGED, &[unit], n as f64);
}

pub fn inc_cycle(pipeline: &str, status: &str) {
    add(&CYCLES, &[pipeline, status], 1.0);
}

/// Observe a cycle duration in milliseconds.
pub fn observe_cycle_duration(pipeline: &str, duration_ms: f64) {
    if let Some(h) = &*CYCLE_DURATION_MS {
        h.with_label_values(&[pipeline]).observe(duration_ms);
    }
}

/// Gather metrics as text in Prometheus exposition format.
///
/// ```no_run
/// use transitflow_core::metrics;
/// metrics::inc_pages_landed("arrivals");
/// println!("{}", metrics::gather_text());
/// ```
pub fn gather_text() -> String {
    let mut buffer = vec![];
    if let Err(e) = TextEncoder::new().encode(&REGISTRY.gather(), &mut buffer) {
        tracing::warn!(error = %e, "metrics encoding failed");
    }
    String::from_utf8_lossy(&buffer).into_owned()
}
