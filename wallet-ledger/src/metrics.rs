use lazy_static::lazy_static;
use prometheus::{
    Encoder, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry,
    TextEncoder,
};

lazy_static! {
    // Ledger operations
    pub static ref OPERATIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("wallet_operations_total", "Total wallet ledger operations"),
        &["operation", "outcome"]
    ).expect("metric can be created");

    pub static ref OPERATION_DURATION: HistogramVec = HistogramVec::new(
        HistogramOpts::new("wallet_operation_duration_seconds", "Wallet ledger operation duration in seconds")
            .buckets(vec![0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]),
        &["operation"]
    ).expect("metric can be created");

    pub static ref DEPOSIT_AMOUNT: Histogram = Histogram::with_opts(
        HistogramOpts::new("wallet_deposit_amount", "Distribution of deposit amounts")
            .buckets(vec![1.0, 10.0, 100.0, 1000.0, 10000.0, 100000.0, 1000000.0])
    ).expect("metric can be created");

    // Cache metrics
    pub static ref CACHE_HITS: IntCounter = IntCounter::new(
        "wallet_cache_hits_total",
        "Total cache hits"
    ).expect("metric can be created");

    pub static ref CACHE_MISSES: IntCounter = IntCounter::new(
        "wallet_cache_misses_total",
        "Total cache misses"
    ).expect("metric can be created");

    pub static ref CACHE_ERRORS: IntCounterVec = IntCounterVec::new(
        Opts::new("wallet_cache_errors_total", "Cache operations that failed and were ignored"),
        &["op"]
    ).expect("metric can be created");
}

/// Register all metrics with the given registry
pub fn register_metrics(registry: &Registry) -> Result<(), prometheus::Error> {
    registry.register(Box::new(OPERATIONS_TOTAL.clone()))?;
    registry.register(Box::new(OPERATION_DURATION.clone()))?;
    registry.register(Box::new(DEPOSIT_AMOUNT.clone()))?;
    registry.register(Box::new(CACHE_HITS.clone()))?;
    registry.register(Box::new(CACHE_MISSES.clone()))?;
    registry.register(Box::new(CACHE_ERRORS.clone()))?;
    Ok(())
}

/// Render a registry in the Prometheus text format
pub fn gather_metrics(registry: &Registry) -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = registry.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}

pub fn record_operation(operation: &str, outcome: &str, seconds: f64) {
    OPERATIONS_TOTAL
        .with_label_values(&[operation, outcome])
        .inc();
    OPERATION_DURATION
        .with_label_values(&[operation])
        .observe(seconds);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_gather() {
        let registry = Registry::new();
        register_metrics(&registry).unwrap();

        record_operation("deposit", "success", 0.002);
        CACHE_ERRORS.with_label_values(&["get"]).inc();

        let text = gather_metrics(&registry).unwrap();
        assert!(text.contains("wallet_operations_total"));
        assert!(text.contains("wallet_cache_errors_total"));
    }

    #[test]
    fn test_double_registration_fails() {
        let registry = Registry::new();
        register_metrics(&registry).unwrap();
        assert!(register_metrics(&registry).is_err());
    }
}
