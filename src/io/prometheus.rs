//! Prometheus text exposition of notifier metrics
//!
//! Served at GET /metrics by the HTTP server in `io::http`.

use crate::infra::metrics::{Metrics, MetricsSummary, METRICS_BUCKET_BOUNDS, METRICS_NUM_BUCKETS};
use std::fmt::Write;

/// Prometheus metric type
enum MetricType {
    Counter,
    Gauge,
}

impl MetricType {
    fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
        }
    }
}

/// Write a simple metric (counter or gauge) with site label
fn write_metric(
    output: &mut String,
    name: &str,
    help: &str,
    typ: MetricType,
    site: &str,
    val: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {}", typ.as_str());
    let _ = writeln!(output, "{name}{{site=\"{site}\"}} {val}");
}

/// Write a histogram metric with buckets, sum, and count
fn write_histogram(
    output: &mut String,
    name: &str,
    help: &str,
    site: &str,
    buckets: &[u64; METRICS_NUM_BUCKETS],
    sum: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} histogram");

    let mut cumulative = 0u64;
    for (i, &bound) in METRICS_BUCKET_BOUNDS.iter().enumerate() {
        cumulative += buckets[i];
        let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"{bound}\"}} {cumulative}");
    }
    cumulative += buckets[METRICS_NUM_BUCKETS - 1];
    let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"+Inf\"}} {cumulative}");
    let _ = writeln!(output, "{name}_sum{{site=\"{site}\"}} {sum}");
    let _ = writeln!(output, "{name}_count{{site=\"{site}\"}} {cumulative}");
}

/// Format metrics in Prometheus text exposition format
pub fn format_prometheus_metrics(metrics: &Metrics, tracked_subjects: usize, site_id: &str) -> String {
    let summary = metrics.snapshot(tracked_subjects);
    let mut output = String::with_capacity(4096);

    write_ingest_metrics(&mut output, site_id, &summary);
    write_dispatch_metrics(&mut output, site_id, &summary);
    write_health_metrics(&mut output, site_id, &summary);

    output
}

fn write_ingest_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "notifier_samples_total",
        "Location samples stored",
        MetricType::Counter,
        site,
        summary.samples_ingested,
    );
    write_metric(
        output,
        "notifier_samples_invalid_total",
        "Location samples rejected for invalid coordinates",
        MetricType::Counter,
        site,
        summary.samples_invalid,
    );
    write_metric(
        output,
        "notifier_samples_stale_total",
        "Evaluations whose newest sample was stale",
        MetricType::Counter,
        site,
        summary.stale_samples,
    );
    write_metric(
        output,
        "notifier_transitions_total",
        "Zone transitions detected",
        MetricType::Counter,
        site,
        summary.transitions_detected,
    );
    write_metric(
        output,
        "notifier_tracked_subjects",
        "Subjects with tracking enabled",
        MetricType::Gauge,
        site,
        summary.tracked_subjects as u64,
    );
}

fn write_dispatch_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "notifier_cooldown_suppressed_total",
        "Transitions suppressed by the cooldown",
        MetricType::Counter,
        site,
        summary.cooldown_suppressed,
    );
    write_metric(
        output,
        "notifier_dispatches_total",
        "Notification events dispatched",
        MetricType::Counter,
        site,
        summary.dispatches,
    );
    write_metric(
        output,
        "notifier_manual_dispatches_total",
        "Notification events fired by hand",
        MetricType::Counter,
        site,
        summary.manual_dispatches,
    );
    write_metric(
        output,
        "notifier_recipients_sent_total",
        "Recipient deliveries that succeeded",
        MetricType::Counter,
        site,
        summary.recipients_sent,
    );
    write_metric(
        output,
        "notifier_recipients_failed_total",
        "Recipient deliveries that failed",
        MetricType::Counter,
        site,
        summary.recipients_failed,
    );
    write_metric(
        output,
        "notifier_confirmations_sent_total",
        "Confirmation messages delivered to drivers and admins",
        MetricType::Counter,
        site,
        summary.confirmations_sent,
    );
    write_histogram(
        output,
        "notifier_send_latency_ms",
        "Per-recipient send latency in milliseconds",
        site,
        &summary.send_latency_buckets,
        summary.send_latency_sum_ms,
    );
}

fn write_health_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "notifier_persistence_failures_total",
        "Store operations that failed",
        MetricType::Counter,
        site,
        summary.persistence_failures,
    );
    write_metric(
        output,
        "notifier_poller_ticks_total",
        "Background scans started",
        MetricType::Counter,
        site,
        summary.poller_ticks,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_prometheus_metrics() {
        let metrics = Metrics::new();
        metrics.record_sample();
        metrics.record_dispatch(false);
        metrics.record_delivery(true, 120);
        metrics.record_delivery(false, 40);

        let output = format_prometheus_metrics(&metrics, 3, "driver");

        assert!(output.contains("notifier_samples_total{site=\"driver\"} 1"));
        assert!(output.contains("notifier_dispatches_total{site=\"driver\"} 1"));
        assert!(output.contains("notifier_recipients_failed_total{site=\"driver\"} 1"));
        assert!(output.contains("notifier_tracked_subjects{site=\"driver\"} 3"));
        assert!(output.contains("notifier_send_latency_ms_bucket{site=\"driver\",le=\"50\"} 1"));
        assert!(output.contains("notifier_send_latency_ms_bucket{site=\"driver\",le=\"+Inf\"} 2"));
        assert!(output.contains("notifier_send_latency_ms_sum{site=\"driver\"} 160"));
    }
}
