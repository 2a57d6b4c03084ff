use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::header::HeaderMap;

/// Upper bound on any server-requested wait.
const MAX_SERVER_DELAY: Duration = Duration::from_secs(60);

/// Server-requested wait before retrying.
///
/// `retry-after` may carry seconds or an HTTP date. GitLab's rate limiter
/// also sends `ratelimit-reset` as a unix timestamp, used when `retry-after`
/// is absent. Instants in the past mean no wait.
pub(crate) fn parse_retry_after(headers: &HeaderMap, now: DateTime<Utc>) -> Option<Duration> {
    let delay = match header_text(headers, "retry-after") {
        Some(raw) => match raw.parse::<u64>() {
            Ok(seconds) => Duration::from_secs(seconds),
            Err(_) => {
                let at = DateTime::parse_from_rfc2822(raw).ok()?;
                until(at.with_timezone(&Utc), now)
            }
        },
        None => {
            let reset = header_text(headers, "ratelimit-reset")?.parse::<i64>().ok()?;
            until(DateTime::from_timestamp(reset, 0)?, now)
        }
    };
    Some(delay.min(MAX_SERVER_DELAY))
}

fn header_text<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name)?.to_str().ok().map(str::trim)
}

fn until(at: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    at.signed_duration_since(now).to_std().unwrap_or(Duration::ZERO)
}

/// Reads the `x-next-page` pagination header; empty or absent means last page.
pub(crate) fn parse_next_page(headers: &HeaderMap) -> Option<u32> {
    header_text(headers, "x-next-page")?
        .parse::<u32>()
        .ok()
        .filter(|page| *page > 0)
}

pub(crate) fn retry_delay(
    base_delay_ms: u64,
    attempt: usize,
    retry_after: Option<Duration>,
) -> Duration {
    if let Some(delay) = retry_after {
        return delay.max(Duration::from_millis(base_delay_ms));
    }
    let exponent = attempt.saturating_sub(1).min(10) as u32;
    let scaled = base_delay_ms.saturating_mul(2_u64.saturating_pow(exponent));
    Duration::from_millis(scaled.min(30_000))
}

pub(crate) fn is_retryable_transport_error(error: &reqwest::Error) -> bool {
    error.is_timeout() || error.is_connect() || error.is_request()
}

pub(crate) fn is_retryable_gitlab_status(status: u16) -> bool {
    status == 429 || status >= 500
}

pub(crate) fn truncate_for_error(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut truncated = text.chars().take(max_chars).collect::<String>();
    truncated.push_str("...");
    truncated
}
