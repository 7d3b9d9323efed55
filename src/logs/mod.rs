//! Nginx access-log records
//!
//! Parses the stock "combined" log format into typed records and tails
//! the configured log file for the API. Records are derived on demand and
//! never persisted.

use std::path::Path;
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use tokio::fs;

use crate::models::AccessLogRecord;

fn combined_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        // 127.0.0.1 - - [10/Oct/2025:13:55:36 +0000] "GET /path HTTP/1.1" 200 612 "ref" "agent"
        Regex::new(
            r#"^(\S+) \S+ \S+ \[([^\]]+)\] "(\S+) (\S+)[^"]*" (\d{3}) (\d+|-) "([^"]*)" "([^"]*)""#,
        )
        .unwrap()
    })
}

/// Parse one combined-format line. Returns `None` for lines that do not
/// match (error-log noise, truncated writes).
pub fn parse_line(line: &str) -> Option<AccessLogRecord> {
    let caps = combined_re().captures(line)?;

    let timestamp = DateTime::parse_from_str(&caps[2], "%d/%b/%Y:%H:%M:%S %z")
        .ok()?
        .with_timezone(&Utc);

    let optional = |s: &str| {
        if s.is_empty() || s == "-" {
            None
        } else {
            Some(s.to_string())
        }
    };

    Some(AccessLogRecord {
        client: caps[1].to_string(),
        timestamp,
        method: caps[3].to_string(),
        path: caps[4].to_string(),
        status: caps[5].parse().ok()?,
        body_bytes: caps[6].parse().unwrap_or(0),
        referer: optional(&caps[7]),
        user_agent: optional(&caps[8]),
    })
}

/// Most-recent `limit` records from the access log, newest first.
/// A missing or unreadable log yields an empty list.
pub async fn tail(path: &Path, limit: usize) -> Vec<AccessLogRecord> {
    let content = match fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) => {
            tracing::debug!("Access log {} unreadable (non-fatal): {}", path.display(), e);
            return Vec::new();
        }
    };

    content
        .lines()
        .rev()
        .filter_map(parse_line)
        .take(limit)
        .collect()
}
