//! PerformanceAnalyzer: p95 latency and throughput against configured limits.

use std::collections::BTreeMap;

use super::{finding_fingerprint, DetectorContext};
use crate::error::DetectorError;
use crate::sources::{MetricSample, MetricsSource};
use crate::types::{FindingCategory, NewFinding, PerformanceConfig, Severity};

const LATENCY_METHOD: &str = "performance:p95";
const THROUGHPUT_METHOD: &str = "performance:throughput";

pub struct PerformanceAnalyzer {
    source: Box<dyn MetricsSource>,
    config: PerformanceConfig,
}

impl PerformanceAnalyzer {
    pub fn new(source: Box<dyn MetricsSource>, config: PerformanceConfig) -> Self {
        Self { source, config }
    }

    pub async fn scan(&self, ctx: &DetectorContext) -> Result<Vec<NewFinding>, DetectorError> {
        let since = ctx.now - chrono::Duration::minutes(self.config.lookback_minutes);
        let samples = self.source.samples_since(since).await?;
        Ok(analyze(&samples, &self.config))
    }
}

/// Nearest-rank percentile over sorted values.
fn percentile(sorted: &[f64], p: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let n = sorted.len();
    let rank = ((p / 100.0) * n as f64).ceil() as usize;
    let idx = rank.saturating_sub(1).min(n - 1);
    Some(sorted[idx])
}

fn severity_for_ratio(ratio: f64) -> Option<Severity> {
    if ratio >= 4.0 {
        Some(Severity::Critical)
    } else if ratio >= 2.0 {
        Some(Severity::High)
    } else if ratio >= 1.5 {
        Some(Severity::Medium)
    } else if ratio > 1.0 {
        Some(Severity::Low)
    } else {
        None
    }
}

fn analyze(samples: &[MetricSample], config: &PerformanceConfig) -> Vec<NewFinding> {
    let mut by_op: BTreeMap<&str, Vec<f64>> = BTreeMap::new();
    for sample in samples {
        by_op
            .entry(sample.operation.as_str())
            .or_default()
            .push(sample.duration_ms);
    }

    let mut findings = Vec::new();

    for (op, durations) in by_op.iter_mut() {
        if durations.len() < config.min_samples {
            continue;
        }
        durations.sort_by(|a, b| a.total_cmp(b));
        let Some(p95) = percentile(durations, 95.0) else {
            continue;
        };
        let threshold = config
            .thresholds_ms
            .get(*op)
            .copied()
            .unwrap_or(config.default_p95_ms);
        if threshold <= 0.0 {
            continue;
        }
        let ratio = p95 / threshold;
        let Some(severity) = severity_for_ratio(ratio) else {
            continue;
        };

        findings.push(NewFinding {
            category: FindingCategory::Performance,
            severity,
            description: format!(
                "p95 latency for {} is {:.0}ms over {} samples (threshold {:.0}ms, {:.1}x)",
                op,
                p95,
                durations.len(),
                threshold,
                ratio
            ),
            location: op.to_string(),
            detection_method: LATENCY_METHOD.to_string(),
            fingerprint: finding_fingerprint(FindingCategory::Performance, LATENCY_METHOD, op, severity, "p95"),
        });
    }

    let minutes = config.lookback_minutes.max(1) as f64;
    let mut floors: Vec<(&String, &f64)> = config.min_throughput_per_min.iter().collect();
    floors.sort_by(|a, b| a.0.cmp(b.0));
    for (op, min_rate) in floors {
        let observed = by_op.get(op.as_str()).map(|d| d.len()).unwrap_or(0);
        let rate = observed as f64 / minutes;
        if rate >= *min_rate {
            continue;
        }
        findings.push(NewFinding {
            category: FindingCategory::Performance,
            severity: Severity::Medium,
            description: format!(
                "Throughput for {} is {:.2}/min, below the {:.2}/min floor",
                op, rate, min_rate
            ),
            location: op.clone(),
            detection_method: THROUGHPUT_METHOD.to_string(),
            fingerprint: finding_fingerprint(
                FindingCategory::Performance,
                THROUGHPUT_METHOD,
                op,
                Severity::Medium,
                "throughput",
            ),
        });
    }

    findings
}
