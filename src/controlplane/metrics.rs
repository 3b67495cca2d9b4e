//! Operator metrics
//!
//! Reconcile and admission counters kept in a dedicated Prometheus
//! registry, rendered in text format by the metrics server.

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use std::time::Instant;

use crate::error::{Error, Result};

/// Prometheus metrics of the control plane
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    reconciles: IntCounterVec,
    reconcile_duration: Histogram,
    instance_changes: IntCounterVec,
    admissions: IntCounterVec,
    queue_depth: IntGauge,
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let reconciles = IntCounterVec::new(
            Opts::new("pool_fleet_reconciles_total", "Reconcile passes by result"),
            &["result"],
        )
        .map_err(metric_error)?;
        let reconcile_duration = Histogram::with_opts(
            HistogramOpts::new(
                "pool_fleet_reconcile_duration_seconds",
                "Duration of reconcile passes",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
        )
        .map_err(metric_error)?;
        let instance_changes = IntCounterVec::new(
            Opts::new(
                "pool_fleet_instance_changes_total",
                "Pool instance mutations by action",
            ),
            &["action"],
        )
        .map_err(metric_error)?;
        let admissions = IntCounterVec::new(
            Opts::new(
                "pool_fleet_admission_reviews_total",
                "Validation webhook verdicts by kind",
            ),
            &["kind", "verdict"],
        )
        .map_err(metric_error)?;
        let queue_depth = IntGauge::new("pool_fleet_queue_depth", "Keys waiting or running")
            .map_err(metric_error)?;

        registry
            .register(Box::new(reconciles.clone()))
            .map_err(metric_error)?;
        registry
            .register(Box::new(reconcile_duration.clone()))
            .map_err(metric_error)?;
        registry
            .register(Box::new(instance_changes.clone()))
            .map_err(metric_error)?;
        registry
            .register(Box::new(admissions.clone()))
            .map_err(metric_error)?;
        registry
            .register(Box::new(queue_depth.clone()))
            .map_err(metric_error)?;

        Ok(Self {
            registry,
            reconciles,
            reconcile_duration,
            instance_changes,
            admissions,
            queue_depth,
        })
    }

    /// Start timing a reconcile pass
    pub fn start_reconcile(&self) -> Instant {
        Instant::now()
    }

    pub fn record_reconcile(&self, started: Instant, ok: bool) {
        self.reconcile_duration
            .observe(started.elapsed().as_secs_f64());
        self.reconciles
            .with_label_values(&[if ok { "success" } else { "error" }])
            .inc();
    }

    pub fn record_instance_changes(&self, created: usize, deleted: usize, updated: usize) {
        for (action, count) in [("created", created), ("deleted", deleted), ("updated", updated)] {
            if count > 0 {
                self.instance_changes
                    .with_label_values(&[action])
                    .inc_by(count as u64);
            }
        }
    }

    pub fn record_admission(&self, kind: &str, allowed: bool) {
        self.admissions
            .with_label_values(&[kind, if allowed { "allowed" } else { "denied" }])
            .inc();
    }

    pub fn set_queue_depth(&self, depth: usize) {
        self.queue_depth.set(depth as i64);
    }

    /// Render every metric in the Prometheus text format
    pub fn encode(&self) -> Result<(String, Vec<u8>)> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(metric_error)?;
        Ok((encoder.format_type().to_string(), buffer))
    }
}

fn metric_error(e: prometheus::Error) -> Error {
    Error::Internal(format!("metrics: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_contains_recorded_values() {
        let metrics = Metrics::new().unwrap();
        let started = metrics.start_reconcile();
        metrics.record_reconcile(started, true);
        metrics.record_reconcile(started, false);
        metrics.record_admission("PoolCluster", false);
        metrics.record_instance_changes(2, 0, 1);

        let (content_type, body) = metrics.encode().unwrap();
        let text = String::from_utf8(body).unwrap();
        assert!(content_type.starts_with("text/plain"));
        assert!(text.contains(r#"pool_fleet_reconciles_total{result="success"} 1"#));
        assert!(text.contains(r#"pool_fleet_admission_reviews_total{kind="PoolCluster",verdict="denied"} 1"#));
        assert!(text.contains(r#"pool_fleet_instance_changes_total{action="created"} 2"#));
        assert!(!text.contains(r#"action="deleted""#));
    }

    #[test]
    fn test_registries_are_independent() {
        let a = Metrics::new().unwrap();
        let b = Metrics::new().unwrap();
        a.record_admission("Namespace", true);
        let (_, body) = b.encode().unwrap();
        assert!(!String::from_utf8(body).unwrap().contains("Namespace"));
    }
}
