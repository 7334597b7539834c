//! Notification sinks for periodic reports.
//!
//! The default sink writes the summary to the log. A file sink is added when
//! `reportPath` is configured.

use std::path::PathBuf;

use crate::report::MaintenanceReport;
use crate::util::atomic_write_str;

pub trait NotificationSink: Send + Sync {
    fn deliver(&self, report: &MaintenanceReport) -> Result<(), String>;
}

/// Writes the report summary through the `log` facade.
#[derive(Debug, Default)]
pub struct LogSink;

impl NotificationSink for LogSink {
    fn deliver(&self, report: &MaintenanceReport) -> Result<(), String> {
        for line in report.to_text().lines() {
            log::info!("Report: {}", line);
        }
        Ok(())
    }
}

/// Overwrites a JSON file with the latest report.
pub struct FileSink {
    path: PathBuf,
}

impl FileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl NotificationSink for FileSink {
    fn deliver(&self, report: &MaintenanceReport) -> Result<(), String> {
        let json = serde_json::to_string_pretty(report)
            .map_err(|e| format!("Failed to serialize report: {}", e))?;
        atomic_write_str(&self.path, &json)
            .map_err(|e| format!("Failed to write report to {}: {}", self.path.display(), e))
    }
}

/// Delivers to every inner sink. All sinks are attempted; errors are joined.
pub struct FanoutSink {
    sinks: Vec<Box<dyn NotificationSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Box<dyn NotificationSink>>) -> Self {
        Self { sinks }
    }
}

impl NotificationSink for FanoutSink {
    fn deliver(&self, report: &MaintenanceReport) -> Result<(), String> {
        let errors: Vec<String> = self
            .sinks
            .iter()
            .filter_map(|sink| sink.deliver(report).err())
            .collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors.join("; "))
        }
    }
}

/// The sink set a config asks for.
pub fn build_sink(report_path: Option<&str>) -> Box<dyn NotificationSink> {
    match report_path {
        Some(path) => Box::new(FanoutSink::new(vec![Box::new(LogSink), Box::new(FileSink::new(path))])),
        None => Box::new(LogSink),
    }
}
