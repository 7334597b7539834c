//! Read-side collaborators: log and metrics streams, endpoint probes and the
//! priority directive list.
//!
//! Detectors only see these traits, so tests substitute in-memory fakes.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::DetectorError;
use crate::types::PriorityDirective;

// =============================================================================
// Records
// =============================================================================

/// One entry of the application's error/log stream.
#[derive(Debug, Clone, Deserialize)]
pub struct LogRecord {
    pub timestamp: DateTime<Utc>,
    pub level: String,
    pub message: String,
    #[serde(default)]
    pub location: Option<String>,
}

/// One latency observation.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricSample {
    pub timestamp: DateTime<Utc>,
    pub operation: String,
    pub duration_ms: f64,
}

// =============================================================================
// Traits
// =============================================================================

#[async_trait::async_trait]
pub trait LogSource: Send + Sync {
    /// Records with `timestamp >= since`.
    async fn read_since(&self, since: DateTime<Utc>) -> Result<Vec<LogRecord>, DetectorError>;
}

#[async_trait::async_trait]
pub trait MetricsSource: Send + Sync {
    /// Samples with `timestamp >= since`.
    async fn samples_since(&self, since: DateTime<Utc>) -> Result<Vec<MetricSample>, DetectorError>;
}

#[async_trait::async_trait]
pub trait EndpointProbe: Send + Sync {
    /// HTTP status the endpoint answered with. `Err` when it did not answer.
    async fn status(&self, url: &str, timeout: Duration) -> Result<u16, String>;
}

/// Externally maintained priority goals.
pub trait DirectiveSource: Send + Sync {
    fn load(&self) -> Result<Vec<PriorityDirective>, String>;
}

// =============================================================================
// JSON-lines files
// =============================================================================

/// Parse newline-delimited JSON, skipping blank and malformed lines.
/// Returns the parsed values and the number of lines skipped as malformed.
fn parse_jsonl<T: DeserializeOwned>(content: &str) -> (Vec<T>, usize) {
    let mut values = Vec::new();
    let mut skipped = 0;
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str(line) {
            Ok(v) => values.push(v),
            Err(_) => skipped += 1,
        }
    }
    (values, skipped)
}

async fn read_stream(path: &Path) -> Result<String, DetectorError> {
    tokio::fs::read_to_string(path)
        .await
        .map_err(|e| DetectorError::Source(format!("{}: {}", path.display(), e)))
}

pub struct JsonlLogSource {
    path: PathBuf,
}

impl JsonlLogSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait::async_trait]
impl LogSource for JsonlLogSource {
    async fn read_since(&self, since: DateTime<Utc>) -> Result<Vec<LogRecord>, DetectorError> {
        let content = read_stream(&self.path).await?;
        let (records, skipped): (Vec<LogRecord>, usize) = parse_jsonl(&content);
        if skipped > 0 {
            log::warn!(
                "LogSource: skipped {} malformed lines in {}",
                skipped,
                self.path.display()
            );
        }
        Ok(records.into_iter().filter(|r| r.timestamp >= since).collect())
    }
}

pub struct JsonlMetricsSource {
    path: PathBuf,
}

impl JsonlMetricsSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait::async_trait]
impl MetricsSource for JsonlMetricsSource {
    async fn samples_since(&self, since: DateTime<Utc>) -> Result<Vec<MetricSample>, DetectorError> {
        let content = read_stream(&self.path).await?;
        let (samples, skipped): (Vec<MetricSample>, usize) = parse_jsonl(&content);
        if skipped > 0 {
            log::warn!(
                "MetricsSource: skipped {} malformed lines in {}",
                skipped,
                self.path.display()
            );
        }
        Ok(samples.into_iter().filter(|s| s.timestamp >= since).collect())
    }
}

// =============================================================================
// HTTP probe
// =============================================================================

pub struct HttpProbe {
    client: reqwest::Client,
}

impl HttpProbe {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl EndpointProbe for HttpProbe {
    async fn status(&self, url: &str, timeout: Duration) -> Result<u16, String> {
        let resp = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        Ok(resp.status().as_u16())
    }
}

// =============================================================================
// Directives
// =============================================================================

/// JSON array of directives in a file. A missing file means no directives.
pub struct JsonFileDirectives {
    path: PathBuf,
}

impl JsonFileDirectives {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl DirectiveSource for JsonFileDirectives {
    fn load(&self) -> Result<Vec<PriorityDirective>, String> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(format!("Failed to read {}: {}", self.path.display(), e)),
        };
        serde_json::from_str(&content)
            .map_err(|e| format!("Failed to parse {}: {}", self.path.display(), e))
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[tokio::test]
    async fn test_jsonl_log_source_filters_and_skips_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("errors.jsonl");
        std::fs::write(
            &path,
            concat!(
                r#"{"timestamp":"2026-03-01T10:00:00Z","level":"error","message":"old"}"#,
                "\n",
                "not json\n",
                "\n",
                r#"{"timestamp":"2026-03-01T11:30:00Z","level":"error","message":"new","location":"src/a.rs:3"}"#,
                "\n",
            ),
        )
        .unwrap();

        let source = JsonlLogSource::new(&path);
        let since = Utc.with_ymd_and_hms(2026, 3, 1, 11, 0, 0).unwrap();
        let records = source.read_since(since).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].message, "new");
        assert_eq!(records[0].location.as_deref(), Some("src/a.rs:3"));
    }

    #[tokio::test]
    async fn test_missing_stream_is_source_error() {
        let source = JsonlMetricsSource::new("/nonexistent/metrics.jsonl");
        let err = source.samples_since(Utc::now()).await.unwrap_err();
        assert_eq!(err.kind(), "source");
    }

    #[test]
    fn test_directive_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("directives.json");
        assert!(JsonFileDirectives::new(&path).load().unwrap().is_empty());

        std::fs::write(
            &path,
            r#"[{"key":"q3-latency","title":"Cut search latency","priority":2,
                 "scheduledFor":"2026-04-01T00:00:00Z"}]"#,
        )
        .unwrap();
        let directives = JsonFileDirectives::new(&path).load().unwrap();
        assert_eq!(directives.len(), 1);
        assert_eq!(directives[0].key, "q3-latency");
        assert!(directives[0].scheduled_for.is_some());
        assert!(directives[0].location.is_none());
    }
}
