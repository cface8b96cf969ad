use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, Encoder,
    HistogramVec, IntCounter, IntCounterVec, TextEncoder,
};
use std::sync::LazyLock;

pub static RECONCILE_TICKS: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!("ghostpay_reconcile_ticks_total", "Reconciliation ticks run")
        .expect("static metric definition")
});

pub static TRANSITIONS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "ghostpay_invoice_transitions_total",
        "Invoice status transitions",
        &["to"]
    )
    .expect("static metric definition")
});

pub static INVOICE_ERRORS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "ghostpay_invoice_errors_total",
        "Per-invoice reconciliation failures",
        &["code"]
    )
    .expect("static metric definition")
});

pub static SWEEPS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "ghostpay_sweeps_total",
        "Sweep attempts",
        &["chain", "result"]
    )
    .expect("static metric definition")
});

pub static SWEEP_LATENCY: LazyLock<HistogramVec> = LazyLock::new(|| {
    register_histogram_vec!(
        "ghostpay_sweep_duration_seconds",
        "Sweep attempt latency in seconds",
        &["chain"],
        vec![1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0]
    )
    .expect("static metric definition")
});

pub static WEBHOOKS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "ghostpay_webhooks_total",
        "Webhook delivery attempts",
        &["result"]
    )
    .expect("static metric definition")
});

/// Text exposition of every registered metric.
pub fn metrics_output() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
