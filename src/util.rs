//! Shared helpers: timestamps, SQL identifiers, slugs, atomic file writes.

use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};

/// Format a timestamp the way every table stores it.
///
/// Fixed-width RFC 3339 with microseconds and a `Z` suffix, so lexical order
/// in SQLite equals chronological order.
pub fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a stored timestamp. Accepts any RFC 3339 offset.
pub fn parse_ts(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Advance a tick's logical `now` by the wall-clock time spent so far.
///
/// Every timestamp written during a tick derives from the tick's start time,
/// so tests that inject a fixed `now` see consistent orderings.
pub fn tick_clock(now: DateTime<Utc>, started: std::time::Instant) -> DateTime<Utc> {
    now + chrono::Duration::from_std(started.elapsed()).unwrap_or_else(|_| chrono::Duration::zero())
}

/// Validate and double-quote a SQL identifier coming from configuration.
pub fn quote_ident(name: &str) -> Result<String, String> {
    let mut chars = name.chars();
    let valid_head = chars
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false);
    if !valid_head || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(format!("Invalid SQL identifier: {:?}", name));
    }
    Ok(format!("\"{}\"", name))
}

/// Lowercase, hyphen-separated slug capped at `max_len` characters.
pub fn slugify(text: &str, max_len: usize) -> String {
    let mut slug = String::with_capacity(text.len());
    let mut last_dash = true;
    for c in text.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
        if slug.len() >= max_len {
            break;
        }
    }
    let trimmed = slug.trim_matches('-');
    if trimmed.is_empty() {
        "untitled".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Write a file via a temp sibling + rename so readers never see a partial file.
pub fn atomic_write_str(path: &Path, content: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4()));
    std::fs::write(&tmp, content)?;
    std::fs::rename(&tmp, path).inspect_err(|_| {
        let _ = std::fs::remove_file(&tmp);
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_ts_is_fixed_width_and_ordered() {
        let a = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap();
        let b = a + chrono::Duration::milliseconds(1);
        assert_eq!(ts(a), "2026-01-02T03:04:05.000000Z");
        assert_eq!(ts(a).len(), ts(b).len());
        assert!(ts(a) < ts(b));
    }

    #[test]
    fn test_parse_ts_roundtrips_offsets() {
        let parsed = parse_ts("2026-01-02T05:04:05+02:00").expect("parse");
        assert_eq!(ts(parsed), "2026-01-02T03:04:05.000000Z");
        assert!(parse_ts("yesterday").is_none());
    }

    #[test]
    fn test_quote_ident_rejects_injection() {
        assert_eq!(quote_ident("orders").unwrap(), "\"orders\"");
        assert_eq!(quote_ident("_tmp1").unwrap(), "\"_tmp1\"");
        assert!(quote_ident("orders; DROP TABLE x").is_err());
        assert!(quote_ident("1orders").is_err());
        assert!(quote_ident("").is_err());
        assert!(quote_ident("a\"b").is_err());
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Reduce p95 latency of /api/search!", 64), "reduce-p95-latency-of-api-search");
        assert_eq!(slugify("***", 10), "untitled");
        assert!(slugify("a very long title indeed", 6).len() <= 6);
    }

    #[test]
    fn test_atomic_write_creates_parents() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("report.json");
        atomic_write_str(&path, "{}").expect("write");
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{}");
    }
}
