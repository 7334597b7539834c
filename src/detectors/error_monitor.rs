//! ErrorMonitor: groups recent error log lines into findings.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;

use super::{finding_fingerprint, DetectorContext};
use crate::error::DetectorError;
use crate::sources::{LogRecord, LogSource};
use crate::types::{FindingCategory, NewFinding, Severity};

const DETECTION_METHOD: &str = "error_monitor";
const UNKNOWN_LOCATION: &str = "unknown";

pub struct ErrorMonitor {
    source: Box<dyn LogSource>,
    lookback_minutes: i64,
}

impl ErrorMonitor {
    pub fn new(source: Box<dyn LogSource>, lookback_minutes: i64) -> Self {
        Self {
            source,
            lookback_minutes,
        }
    }

    pub async fn scan(&self, ctx: &DetectorContext) -> Result<Vec<NewFinding>, DetectorError> {
        let since = ctx.now - chrono::Duration::minutes(self.lookback_minutes);
        let records = self.source.read_since(since).await?;
        Ok(group_errors(&records, self.lookback_minutes))
    }
}

fn is_error_level(level: &str) -> bool {
    matches!(
        level.to_ascii_lowercase().as_str(),
        "error" | "fatal" | "critical"
    )
}

/// Replace volatile tokens (UUIDs, hex ids, numbers) with `#` so repeats of
/// one error group together.
pub fn normalize_message(message: &str) -> String {
    static VOLATILE_RE: OnceLock<Regex> = OnceLock::new();
    let re = VOLATILE_RE.get_or_init(|| {
        Regex::new(
            r"(?i)[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}|\b0x[0-9a-f]+\b|\b[0-9a-f]{12,}\b|\d+",
        )
        .expect("volatile token regex should compile")
    });
    re.replace_all(message.trim(), "#").into_owned()
}

fn severity_for_count(count: usize) -> Severity {
    match count {
        n if n >= 50 => Severity::Critical,
        n if n >= 10 => Severity::High,
        n if n >= 3 => Severity::Medium,
        _ => Severity::Low,
    }
}

fn group_errors(records: &[LogRecord], lookback_minutes: i64) -> Vec<NewFinding> {
    let mut groups: HashMap<(String, String), usize> = HashMap::new();
    for record in records.iter().filter(|r| is_error_level(&r.level)) {
        let location = record
            .location
            .as_deref()
            .filter(|l| !l.trim().is_empty())
            .unwrap_or(UNKNOWN_LOCATION)
            .to_string();
        *groups
            .entry((location, normalize_message(&record.message)))
            .or_insert(0) += 1;
    }

    let mut grouped: Vec<((String, String), usize)> = groups.into_iter().collect();
    grouped.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

    grouped
        .into_iter()
        .map(|((location, signature), count)| {
            let severity = severity_for_count(count);
            NewFinding {
                category: FindingCategory::Error,
                severity,
                description: format!(
                    "{} occurrences of \"{}\" at {} in the last {} minutes",
                    count, signature, location, lookback_minutes
                ),
                fingerprint: finding_fingerprint(
                    FindingCategory::Error,
                    DETECTION_METHOD,
                    &location,
                    severity,
                    &signature,
                ),
                location,
                detection_method: DETECTION_METHOD.to_string(),
            }
        })
        .collect()
}
