use anyhow::{Context, Result};
use chrono::{DateTime, Duration, SecondsFormat, Utc};

/// Renders `instant` as an RFC3339 string with second precision.
pub fn format_rfc3339(instant: DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Parses an RFC3339 string into a UTC instant.
pub fn parse_rfc3339(raw: &str) -> Result<DateTime<Utc>> {
    let parsed = DateTime::parse_from_rfc3339(raw.trim())
        .with_context(|| format!("invalid RFC3339 timestamp '{raw}'"))?;
    Ok(parsed.with_timezone(&Utc))
}

/// Returns true when `last` is absent or strictly older than `ttl` at `now`.
pub fn is_stale(last: Option<DateTime<Utc>>, now: DateTime<Utc>, ttl: Duration) -> bool {
    match last {
        Some(last) => now.signed_duration_since(last) > ttl,
        None => true,
    }
}
