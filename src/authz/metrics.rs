//! Decision counters and latency histograms.
//!
//! Each collector owns its own `prometheus::Registry`, so several engines
//! (or tests) in one process never share counters.

use std::collections::BTreeMap;
use std::time::Duration;

use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};
use serde::{Deserialize, Serialize};

use crate::authz::errors::AuthzError;
use crate::authz::types::Effect;

const EFFECTS: [Effect; 2] = [Effect::Allow, Effect::Deny];
const ERROR_KINDS: [&str; 4] = ["invalid_input", "unplannable", "audit_sink", "policy_load"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LatencySummary {
    pub count: u64,
    pub sum_ms: f64,
    pub mean_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub decisions_total: u64,
    pub allowed: u64,
    pub denied: u64,
    pub errors: BTreeMap<String, u64>,
    pub plans: BTreeMap<String, u64>,
    pub latency: LatencySummary,
}

#[derive(Clone)]
pub struct MetricsCollector {
    registry: Registry,
    decisions_total: IntCounterVec,
    decision_latency: HistogramVec,
    errors_total: IntCounterVec,
    plans_total: IntCounterVec,
}

impl std::fmt::Debug for MetricsCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsCollector").finish_non_exhaustive()
    }
}

impl MetricsCollector {
    pub fn new() -> Result<Self, AuthzError> {
        let registry = Registry::new();

        let decisions_total = IntCounterVec::new(
            Opts::new("warden_decisions_total", "Authorization decisions by effect"),
            &["effect"],
        )?;
        let decision_latency = HistogramVec::new(
            HistogramOpts::new(
                "warden_decision_latency_seconds",
                "Wall-clock time spent in evaluate",
            )
            .buckets(vec![
                0.00001, 0.00005, 0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1,
            ]),
            &["effect"],
        )?;
        let errors_total = IntCounterVec::new(
            Opts::new("warden_errors_total", "Errors raised by the authorization core"),
            &["kind"],
        )?;
        let plans_total = IntCounterVec::new(
            Opts::new("warden_plans_total", "Query plans by outcome"),
            &["outcome"],
        )?;

        registry.register(Box::new(decisions_total.clone()))?;
        registry.register(Box::new(decision_latency.clone()))?;
        registry.register(Box::new(errors_total.clone()))?;
        registry.register(Box::new(plans_total.clone()))?;

        let collector = Self {
            registry,
            decisions_total,
            decision_latency,
            errors_total,
            plans_total,
        };
        collector.init_series();
        Ok(collector)
    }

    /// Touch every known label so the exposition lists zeroes.
    fn init_series(&self) {
        for effect in EFFECTS {
            self.decisions_total.with_label_values(&[effect.as_str()]);
            self.decision_latency.with_label_values(&[effect.as_str()]);
        }
        for kind in ERROR_KINDS {
            self.errors_total.with_label_values(&[kind]);
        }
    }

    pub fn record_decision(&self, effect: Effect, latency: Duration) {
        self.decisions_total
            .with_label_values(&[effect.as_str()])
            .inc();
        self.decision_latency
            .with_label_values(&[effect.as_str()])
            .observe(latency.as_secs_f64());
    }

    pub fn record_error(&self, kind: &str) {
        self.errors_total.with_label_values(&[kind]).inc();
    }

    pub fn record_plan(&self, outcome: &str) {
        self.plans_total.with_label_values(&[outcome]).inc();
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let allowed = self.decisions_total.with_label_values(&["ALLOW"]).get();
        let denied = self.decisions_total.with_label_values(&["DENY"]).get();

        let mut count = 0;
        let mut sum_secs = 0.0;
        for effect in EFFECTS {
            let h = self.decision_latency.with_label_values(&[effect.as_str()]);
            count += h.get_sample_count();
            sum_secs += h.get_sample_sum();
        }
        let sum_ms = sum_secs * 1000.0;

        MetricsSnapshot {
            decisions_total: allowed + denied,
            allowed,
            denied,
            errors: label_values(&self.registry, "warden_errors_total", "kind"),
            plans: label_values(&self.registry, "warden_plans_total", "outcome"),
            latency: LatencySummary {
                count,
                sum_ms,
                mean_ms: if count == 0 { 0.0 } else { sum_ms / count as f64 },
            },
        }
    }

    /// Prometheus text exposition. Returns an empty string if encoding fails.
    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            tracing::warn!(error = %e, "failed to encode metrics");
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "metrics exposition is not valid UTF-8");
            String::new()
        })
    }

    pub fn reset(&self) {
        self.decisions_total.reset();
        self.decision_latency.reset();
        self.errors_total.reset();
        self.plans_total.reset();
        self.init_series();
        tracing::info!("metrics reset");
    }
}

fn label_values(registry: &Registry, family: &str, label: &str) -> BTreeMap<String, u64> {
    let mut out = BTreeMap::new();
    for mf in registry.gather() {
        if mf.get_name() != family {
            continue;
        }
        for m in mf.get_metric() {
            let Some(pair) = m.get_label().iter().find(|l| l.get_name() == label) else {
                continue;
            };
            out.insert(
                pair.get_value().to_string(),
                m.get_counter().get_value() as u64,
            );
        }
    }
    out
}
