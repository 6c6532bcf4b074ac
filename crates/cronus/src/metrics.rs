use lazy_static::lazy_static;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

lazy_static! {
    pub static ref CACHE_EVENTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("cronus_cache_events_total", "CronJob watch events applied to the cache."),
        &["event"]
    )
    .unwrap();
    pub static ref CACHED_SCHEDULED_JOBS: IntGauge = IntGauge::new(
        "cronus_cached_scheduled_jobs",
        "Number of CronJobs currently held in the cache."
    )
    .unwrap();
    pub static ref RESOLUTION_ERRORS_TOTAL: IntCounter = IntCounter::new(
        "cronus_resolution_errors_total",
        "Failed Job or Pod listings while resolving ownership."
    )
    .unwrap();
    pub static ref LOG_FETCHES_TOTAL: IntCounter = IntCounter::new(
        "cronus_log_fetches_total",
        "Pod log streams requested."
    )
    .unwrap();
    pub static ref LOG_FETCH_ERRORS_TOTAL: IntCounter = IntCounter::new(
        "cronus_log_fetch_errors_total",
        "Pod log streams that could not be read."
    )
    .unwrap();
    pub static ref HIERARCHY_BUILD_SECONDS: Histogram = Histogram::with_opts(HistogramOpts::new(
        "cronus_hierarchy_build_seconds",
        "Time taken to assemble the full CronJob hierarchy."
    ))
    .unwrap();
    pub static ref REGISTRY: Registry = {
        let registry = Registry::new();
        registry.register(Box::new(CACHE_EVENTS_TOTAL.clone())).unwrap();
        registry.register(Box::new(CACHED_SCHEDULED_JOBS.clone())).unwrap();
        registry.register(Box::new(RESOLUTION_ERRORS_TOTAL.clone())).unwrap();
        registry.register(Box::new(LOG_FETCHES_TOTAL.clone())).unwrap();
        registry.register(Box::new(LOG_FETCH_ERRORS_TOTAL.clone())).unwrap();
        registry.register(Box::new(HIERARCHY_BUILD_SECONDS.clone())).unwrap();
        registry
    };
}

// Function to gather metrics for exposition
pub fn gather_metrics() -> crate::Result<String> {
    let mut buffer = vec![];
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer)
        .map_err(|e| crate::Error::Internal(format!("metrics are not valid UTF-8: {}", e)))
}
