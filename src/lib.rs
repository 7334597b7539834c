//! Autonomous maintenance engine.
//!
//! Each tick detects problems (log errors, latency regressions, integrity
//! violations), records them as findings, turns findings and directives into
//! tasks, executes a bounded batch of tasks (direct data fixes or reviewable
//! change plans) and writes a rolling report. All state lives in SQLite, so
//! ticks are stateless and may overlap.

pub mod autofix;
pub mod db;
pub mod detectors;
pub mod error;
pub mod executor;
mod migrations;
pub mod notification;
pub mod proposer;
pub mod report;
pub mod scheduler;
pub mod server;
pub mod sources;
pub mod state;
pub mod target;
pub mod trigger;
pub mod types;
pub mod util;
