use std::time::Duration;

use glu_gitlab::MergeRequestFilter;

use crate::{AutoMergeError, AutoMergeResult};

/// Runtime configuration for catalog refresh and merge automation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutoMergeConfig {
    pub author: Option<String>,
    pub reviewer: Option<String>,
    /// Maximum age of the cached project catalog.
    pub project_ttl: Duration,
    /// Maximum age of the cached merge request listing.
    pub item_ttl: Duration,
    /// Cadence of the enqueuer's scan over all merge targets.
    pub enqueue_interval: Duration,
    /// Pause after a failed target scan.
    pub scan_error_backoff: Duration,
    /// Delay applied when a target is rescheduled.
    pub retry_delay: Duration,
    /// How long inactive targets are kept before garbage collection.
    pub inactive_retention: Duration,
}

impl Default for AutoMergeConfig {
    fn default() -> Self {
        Self {
            author: None,
            reviewer: None,
            project_ttl: Duration::from_secs(60 * 60),
            item_ttl: Duration::from_secs(60),
            enqueue_interval: Duration::from_secs(5),
            scan_error_backoff: Duration::from_secs(2),
            retry_delay: Duration::from_secs(60),
            inactive_retention: Duration::from_secs(30 * 60),
        }
    }
}

impl AutoMergeConfig {
    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = Some(author.into());
        self
    }

    pub fn with_reviewer(mut self, reviewer: impl Into<String>) -> Self {
        self.reviewer = Some(reviewer.into());
        self
    }

    /// Validates the scheduler timings. Filters are checked when a listing is requested.
    pub fn validate(&self) -> AutoMergeResult<()> {
        if self.enqueue_interval.is_zero() {
            return Err(AutoMergeError::InvalidConfig(
                "enqueue_interval must be greater than 0".to_string(),
            ));
        }
        if self.scan_error_backoff.is_zero() {
            return Err(AutoMergeError::InvalidConfig(
                "scan_error_backoff must be greater than 0".to_string(),
            ));
        }
        if self.retry_delay.is_zero() {
            return Err(AutoMergeError::InvalidConfig(
                "retry_delay must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Author/reviewer filter for merge request listings.
    pub fn filter(&self) -> MergeRequestFilter {
        MergeRequestFilter::new(self.author.as_deref(), self.reviewer.as_deref())
    }
}

pub(crate) fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(36_500))
}
