//! Detector set.
//!
//! Each detector turns one read-only view of the system into `NewFinding`s.
//! They run sequentially in a fixed order (errors, performance, integrity),
//! each under its own timeout; a detector that fails or times out yields a
//! single `error` finding instead of aborting the run.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};

use crate::error::DetectorError;
use crate::sources::{EndpointProbe, HttpProbe, JsonlLogSource, JsonlMetricsSource};
use crate::target::TargetDb;
use crate::types::{Config, DetectorConfig, FindingCategory, NewFinding, Severity};

pub mod error_monitor;
pub mod integrity;
pub mod performance;

pub use error_monitor::ErrorMonitor;
pub use integrity::IntegrityValidator;
pub use performance::PerformanceAnalyzer;

/// Context passed to each detector.
#[derive(Debug, Clone, Copy)]
pub struct DetectorContext {
    pub now: DateTime<Utc>,
}

/// The registered detector variants.
pub enum Detector {
    ErrorMonitor(ErrorMonitor),
    Performance(PerformanceAnalyzer),
    DataIntegrity(IntegrityValidator),
}

impl Detector {
    pub fn name(&self) -> &'static str {
        match self {
            Detector::ErrorMonitor(_) => "error_monitor",
            Detector::Performance(_) => "performance",
            Detector::DataIntegrity(_) => "data_integrity",
        }
    }

    /// Run order. Lower runs first.
    fn rank(&self) -> u8 {
        match self {
            Detector::ErrorMonitor(_) => 0,
            Detector::Performance(_) => 1,
            Detector::DataIntegrity(_) => 2,
        }
    }

    pub async fn scan(&self, ctx: &DetectorContext) -> Result<Vec<NewFinding>, DetectorError> {
        match self {
            Detector::ErrorMonitor(d) => d.scan(ctx).await,
            Detector::Performance(d) => d.scan(ctx).await,
            Detector::DataIntegrity(d) => d.scan(ctx).await,
        }
    }
}

/// Build the detectors the config enables, in run order.
///
/// ErrorMonitor needs `errorMonitor.logPath`, PerformanceAnalyzer needs
/// `performance.metricsPath`, and the integrity validator needs at least one
/// check or endpoint.
pub fn build_detectors(config: &Config, target: Option<Arc<Mutex<TargetDb>>>) -> Vec<Detector> {
    let mut detectors = Vec::new();

    if let Some(path) = &config.error_monitor.log_path {
        detectors.push(Detector::ErrorMonitor(ErrorMonitor::new(
            Box::new(JsonlLogSource::new(path)),
            config.error_monitor.lookback_minutes,
        )));
    }

    if let Some(path) = &config.performance.metrics_path {
        detectors.push(Detector::Performance(PerformanceAnalyzer::new(
            Box::new(JsonlMetricsSource::new(path)),
            config.performance.clone(),
        )));
    }

    if !config.integrity.checks.is_empty() || !config.integrity.endpoints.is_empty() {
        let probe: Box<dyn EndpointProbe> = Box::new(HttpProbe::new());
        detectors.push(Detector::DataIntegrity(IntegrityValidator::new(
            config.integrity.clone(),
            target,
            probe,
        )));
    }

    sort_detectors(&mut detectors);
    detectors
}

/// Put detectors in their fixed run order, whatever order they were registered in.
pub fn sort_detectors(detectors: &mut [Detector]) {
    detectors.sort_by_key(|d| d.rank());
}

/// Run every detector in order. Never fails: detector errors come back as findings.
pub async fn run_detectors(
    detectors: &[Detector],
    ctx: &DetectorContext,
    config: &DetectorConfig,
) -> Vec<NewFinding> {
    let mut findings = Vec::new();

    for detector in detectors {
        let name = detector.name();
        let timeout_secs = config.timeout_for(name);
        let outcome = match tokio::time::timeout(Duration::from_secs(timeout_secs), detector.scan(ctx)).await {
            Ok(result) => result,
            Err(_) => Err(DetectorError::Timeout(timeout_secs)),
        };

        match outcome {
            Ok(found) => {
                log::info!("Detectors: {} produced {} findings", name, found.len());
                findings.extend(found);
            }
            Err(e) => {
                log::warn!("Detectors: {} failed: {}", name, e);
                findings.push(failure_finding(name, &e));
            }
        }
    }

    findings
}

/// The single `error` finding that stands in for a failed detector.
pub fn failure_finding(detector: &str, err: &DetectorError) -> NewFinding {
    NewFinding {
        category: FindingCategory::Error,
        severity: Severity::High,
        description: format!("Detector {} failed: {}", detector, err),
        location: format!("detector/{}", detector),
        detection_method: format!("detector:{}", detector),
        fingerprint: fingerprint(&["detector-failure", detector, err.kind()]),
    }
}

/// Compute a dedup fingerprint from key components.
pub fn fingerprint(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update(b"|");
    }
    hex::encode(hasher.finalize())
}

/// Fingerprint of a detected condition. Severity is part of the identity, so
/// a disagreement in severity produces a new finding.
pub fn finding_fingerprint(
    category: FindingCategory,
    detection_method: &str,
    location: &str,
    severity: Severity,
    identity: &str,
) -> String {
    fingerprint(&[
        category.as_str(),
        detection_method,
        location,
        severity.as_str(),
        identity,
    ])
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::sources::{LogRecord, LogSource};

    struct SlowLogs;

    #[async_trait::async_trait]
    impl LogSource for SlowLogs {
        async fn read_since(&self, _since: DateTime<Utc>) -> Result<Vec<LogRecord>, DetectorError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(Vec::new())
        }
    }

    struct BrokenLogs;

    #[async_trait::async_trait]
    impl LogSource for BrokenLogs {
        async fn read_since(&self, _since: DateTime<Utc>) -> Result<Vec<LogRecord>, DetectorError> {
            Err(DetectorError::Source("log stream offline".to_string()))
        }
    }

    struct OneError;

    #[async_trait::async_trait]
    impl LogSource for OneError {
        async fn read_since(&self, since: DateTime<Utc>) -> Result<Vec<LogRecord>, DetectorError> {
            Ok(vec![LogRecord {
                timestamp: since,
                level: "error".to_string(),
                message: "boom".to_string(),
                location: Some("src/a.rs".to_string()),
            }])
        }
    }

    fn ctx() -> DetectorContext {
        DetectorContext {
            now: Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap(),
        }
    }

    #[test]
    fn test_fingerprint_deterministic() {
        let fp1 = fingerprint(&["error", "a1"]);
        let fp2 = fingerprint(&["error", "a1"]);
        assert_eq!(fp1, fp2);
        assert_eq!(fp1.len(), 64);
        assert_ne!(fp1, fingerprint(&["error", "a2"]));
    }

    #[test]
    fn test_severity_disagreement_changes_fingerprint() {
        let high = finding_fingerprint(FindingCategory::Error, "m", "loc", Severity::High, "id");
        let low = finding_fingerprint(FindingCategory::Error, "m", "loc", Severity::Low, "id");
        assert_ne!(high, low);
    }

    #[tokio::test]
    async fn test_timeout_becomes_single_error_finding() {
        let detectors = vec![Detector::ErrorMonitor(ErrorMonitor::new(Box::new(SlowLogs), 60))];
        let mut config = DetectorConfig::default();
        config.timeout_overrides.insert("error_monitor".to_string(), 0);

        let findings = run_detectors(&detectors, &ctx(), &config).await;
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].category, FindingCategory::Error);
        assert_eq!(findings[0].severity, Severity::High);
        assert_eq!(findings[0].detection_method, "detector:error_monitor");
        assert_eq!(findings[0].location, "detector/error_monitor");
        assert!(findings[0].description.contains("timed out"));
    }

    #[tokio::test]
    async fn test_failing_detector_does_not_stop_later_ones() {
        let detectors = vec![
            Detector::ErrorMonitor(ErrorMonitor::new(Box::new(BrokenLogs), 60)),
            Detector::ErrorMonitor(ErrorMonitor::new(Box::new(OneError), 60)),
        ];
        let findings = run_detectors(&detectors, &ctx(), &DetectorConfig::default()).await;
        assert_eq!(findings.len(), 2);
        assert_eq!(findings[0].detection_method, "detector:error_monitor");
        assert_eq!(findings[1].detection_method, "error_monitor");
    }

    #[test]
    fn test_repeated_failures_share_a_fingerprint() {
        let a = failure_finding("performance", &DetectorError::Timeout(30));
        let b = failure_finding("performance", &DetectorError::Timeout(45));
        assert_eq!(a.fingerprint, b.fingerprint);
        let c = failure_finding("performance", &DetectorError::Source("x".into()));
        assert_ne!(a.fingerprint, c.fingerprint);
    }

    #[test]
    fn test_build_detectors_follows_config_and_order() {
        let mut config = Config::default();
        assert!(build_detectors(&config, None).is_empty());

        config.integrity.endpoints.push(crate::types::EndpointCheck {
            name: "admin".to_string(),
            url: "http://localhost/admin".to_string(),
            expect_status: vec![200],
            severity: Severity::High,
        });
        config.error_monitor.log_path = Some("/tmp/errors.jsonl".to_string());
        config.performance.metrics_path = Some("/tmp/metrics.jsonl".to_string());

        let names: Vec<_> = build_detectors(&config, None).iter().map(|d| d.name()).collect();
        assert_eq!(names, vec!["error_monitor", "performance", "data_integrity"]);
    }
}
