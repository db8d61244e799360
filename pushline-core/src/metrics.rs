//! Metrics collection for the horizontal adapter
//!
//! The coordinator reports through [`MetricsSink`] so it can run with either
//! the no-op sink or the Prometheus-backed one. Exposing the text output over
//! HTTP is left to the embedding server.

use prometheus::{
    register_histogram_vec_with_registry, register_int_counter_vec_with_registry, Encoder,
    HistogramVec, IntCounterVec, Registry, TextEncoder,
};

/// Fire-and-forget counters fed by the scatter-gather coordinator
pub trait MetricsSink: Send + Sync {
    fn mark_horizontal_adapter_request_sent(&self, app_id: &str);

    fn mark_horizontal_adapter_request_received(&self, app_id: &str);

    fn mark_horizontal_adapter_response_received(&self, app_id: &str);

    /// `resolved` is false when the request was force-resolved by its timer
    fn track_horizontal_adapter_resolved_promises(&self, app_id: &str, resolved: bool);

    fn track_horizontal_adapter_resolve_time(&self, app_id: &str, ms: f64);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn mark_horizontal_adapter_request_sent(&self, _app_id: &str) {}
    fn mark_horizontal_adapter_request_received(&self, _app_id: &str) {}
    fn mark_horizontal_adapter_response_received(&self, _app_id: &str) {}
    fn track_horizontal_adapter_resolved_promises(&self, _app_id: &str, _resolved: bool) {}
    fn track_horizontal_adapter_resolve_time(&self, _app_id: &str, _ms: f64) {}
}

pub struct PrometheusMetrics {
    registry: Registry,
    requests_sent: IntCounterVec,
    requests_received: IntCounterVec,
    responses_received: IntCounterVec,
    resolved_promises: IntCounterVec,
    resolve_time: HistogramVec,
}

impl PrometheusMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let requests_sent = register_int_counter_vec_with_registry!(
            "horizontal_adapter_sent_requests",
            "Scatter-gather requests published by this node",
            &["app_id"],
            registry
        )?;

        let requests_received = register_int_counter_vec_with_registry!(
            "horizontal_adapter_received_requests",
            "Scatter-gather requests received from peers",
            &["app_id"],
            registry
        )?;

        let responses_received = register_int_counter_vec_with_registry!(
            "horizontal_adapter_received_responses",
            "Peer responses folded into a pending request",
            &["app_id"],
            registry
        )?;

        let resolved_promises = register_int_counter_vec_with_registry!(
            "horizontal_adapter_resolved_promises",
            "Pending requests completed, split by whether every peer answered",
            &["app_id", "resolved"],
            registry
        )?;

        let resolve_time = register_histogram_vec_with_registry!(
            "horizontal_adapter_resolve_time",
            "Milliseconds between publishing a request and resolving it",
            &["app_id"],
            vec![1.0, 5.0, 10.0, 50.0, 100.0, 500.0, 1000.0, 5000.0],
            registry
        )?;

        Ok(Self {
            registry,
            requests_sent,
            requests_received,
            responses_received,
            resolved_promises,
            resolve_time,
        })
    }

    /// Render every metric in the Prometheus text exposition format
    pub fn gather_text(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

impl MetricsSink for PrometheusMetrics {
    fn mark_horizontal_adapter_request_sent(&self, app_id: &str) {
        self.requests_sent.with_label_values(&[app_id]).inc();
    }

    fn mark_horizontal_adapter_request_received(&self, app_id: &str) {
        self.requests_received.with_label_values(&[app_id]).inc();
    }

    fn mark_horizontal_adapter_response_received(&self, app_id: &str) {
        self.responses_received.with_label_values(&[app_id]).inc();
    }

    fn track_horizontal_adapter_resolved_promises(&self, app_id: &str, resolved: bool) {
        let label = if resolved { "true" } else { "false" };
        self.resolved_promises.with_label_values(&[app_id, label]).inc();
    }

    fn track_horizontal_adapter_resolve_time(&self, app_id: &str, ms: f64) {
        self.resolve_time.with_label_values(&[app_id]).observe(ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prometheus_metrics_render() {
        let metrics = PrometheusMetrics::new().unwrap();
        metrics.mark_horizontal_adapter_request_sent("app-1");
        metrics.track_horizontal_adapter_resolved_promises("app-1", false);
        metrics.track_horizontal_adapter_resolve_time("app-1", 12.0);

        let text = metrics.gather_text().unwrap();
        assert!(text.contains("horizontal_adapter_sent_requests{app_id=\"app-1\"} 1"));
        assert!(text.contains("resolved=\"false\""));
        assert!(text.contains("horizontal_adapter_resolve_time_count{app_id=\"app-1\"} 1"));
    }

    #[test]
    fn test_separate_instances_do_not_collide() {
        let first = PrometheusMetrics::new();
        let second = PrometheusMetrics::new();

        assert!(first.is_ok());
        assert!(second.is_ok());
    }
}
