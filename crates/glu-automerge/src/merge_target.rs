//! Merge target records and the decision function driving them.
//!
//! A [`MergeTarget`] tracks one merge request from human authorization until it
//! is merged or abandoned. [`MergePolicy::decide`] maps the remote detailed
//! merge status to the next action and is pure: the same target, status and
//! clock always yield the same transition. Remote follow-ups (approval, merge)
//! are applied by the scheduler through the `MergePolicy` outcome methods,
//! which are pure as well.

use chrono::{DateTime, Duration, Utc};
use glu_gitlab::MergeRequest;
use serde::{Deserialize, Serialize};

pub const INFO_ENABLED: &str = "enabled";
pub const INFO_CLEARED: &str = "cleared";
pub const INFO_MERGED: &str = "merged";
pub const INFO_APPROVED: &str = "approved - will try to merge";
/// Audit marker; targets stopped with it are never garbage collected.
pub const INFO_DIFF_CHANGED: &str = "aborted - diff changed";

const TRANSIENT_STATUSES: [&str; 12] = [
    "approvals_syncing",
    "blocked_status",
    "checking",
    "ci_must_pass",
    "ci_still_running",
    "conflict",
    "external_status_checks",
    "jira_association_missing",
    "need_rebase",
    "unchecked",
    "locked_paths",
    "locked_lfs_files",
];

const BLOCKING_STATUSES: [&str; 4] = [
    "discussions_not_resolved",
    "draft_status",
    "not_open",
    "requested_changes",
];

/// Local automation record for one merge request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeTarget {
    /// Instance-wide merge request id.
    pub id: u64,
    pub project_id: u64,
    pub merge_request_iid: u64,
    /// Diff captured when automation was authorized.
    pub diff_fingerprint: String,
    pub info: String,
    pub active: bool,
    /// Last time the target was processed.
    #[serde(default)]
    pub latest: Option<DateTime<Utc>>,
    /// Earliest time the target may be processed again.
    pub next: DateTime<Utc>,
}

impl MergeTarget {
    /// New active target, due immediately.
    pub fn authorize(
        merge_request: &MergeRequest,
        diff_fingerprint: String,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: merge_request.id,
            project_id: merge_request.project_id,
            merge_request_iid: merge_request.iid,
            diff_fingerprint,
            info: INFO_ENABLED.to_string(),
            active: true,
            latest: None,
            next: now,
        }
    }

    /// Cleared record for a merge request that is not cached locally.
    pub fn cleared(id: u64, now: DateTime<Utc>) -> Self {
        let mut target = Self {
            id,
            project_id: 0,
            merge_request_iid: 0,
            diff_fingerprint: String::new(),
            info: String::new(),
            active: false,
            latest: None,
            next: now,
        };
        target.clear(now);
        target
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.active && self.next <= now
    }

    /// True for inactive targets past `retention`, except diff-changed audit records.
    pub fn is_collectable(&self, now: DateTime<Utc>, retention: Duration) -> bool {
        if self.active || self.info == INFO_DIFF_CHANGED {
            return false;
        }
        match self.latest {
            Some(latest) => now.signed_duration_since(latest) > retention,
            None => true,
        }
    }

    /// Human cancellation: inactive immediately, subject to normal retention.
    pub fn clear(&mut self, now: DateTime<Utc>) {
        self.active = false;
        self.info = INFO_CLEARED.to_string();
        self.latest = Some(now);
        self.next = now;
    }

    fn reschedule(mut self, now: DateTime<Utc>, delay: Duration, info: String) -> Self {
        self.next = now + delay;
        self.info = info;
        self
    }

    fn stop(mut self, now: DateTime<Utc>, info: String) -> Self {
        self.active = false;
        self.next = now;
        self.info = info;
        self
    }
}

/// Coarse classification of GitLab's `detailed_merge_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStatusClass {
    /// Will resolve by itself; check again later.
    Transient,
    NeedsApproval,
    Mergeable,
    /// Needs human attention; automation gives up.
    Blocking,
    Unknown,
}

impl MergeStatusClass {
    pub fn classify(status: &str) -> Self {
        match status {
            "not_approved" => Self::NeedsApproval,
            "mergeable" => Self::Mergeable,
            _ if TRANSIENT_STATUSES.contains(&status) => Self::Transient,
            _ if BLOCKING_STATUSES.contains(&status) => Self::Blocking,
            _ => Self::Unknown,
        }
    }
}

/// Next step chosen for a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetAction {
    /// Target rescheduled; persist it.
    Reschedule,
    /// Target stopped; persist it.
    Stop,
    /// Re-fetch the diff, compare fingerprints, then approve.
    VerifyThenApprove,
    /// Accept (merge) the merge request.
    Merge,
    /// Target is inactive; nothing to do.
    Skip,
    /// Unrecognized status; target left unchanged.
    Ignore,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub action: TargetAction,
    pub target: MergeTarget,
}

/// Timing policy shared by every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergePolicy {
    pub retry_delay: Duration,
}

impl Default for MergePolicy {
    fn default() -> Self {
        Self {
            retry_delay: Duration::minutes(1),
        }
    }
}

impl MergePolicy {
    pub fn new(retry_delay: Duration) -> Self {
        Self { retry_delay }
    }

    pub fn decide(&self, target: &MergeTarget, status: &str, now: DateTime<Utc>) -> Transition {
        if !target.active {
            return Transition {
                action: TargetAction::Skip,
                target: target.clone(),
            };
        }

        let mut next = target.clone();
        next.latest = Some(now);
        let (action, target) = match MergeStatusClass::classify(status) {
            MergeStatusClass::Transient => {
                let info = format!(
                    "status {status} - will check again in {}",
                    self.retry_delay_label()
                );
                (
                    TargetAction::Reschedule,
                    next.reschedule(now, self.retry_delay, info),
                )
            }
            MergeStatusClass::NeedsApproval => (TargetAction::VerifyThenApprove, next),
            MergeStatusClass::Mergeable => (TargetAction::Merge, next),
            MergeStatusClass::Blocking => (
                TargetAction::Stop,
                next.stop(now, format!("aborted - {status}")),
            ),
            MergeStatusClass::Unknown => (TargetAction::Ignore, target.clone()),
        };
        Transition { action, target }
    }

    pub fn diff_fetch_failed(&self, target: MergeTarget, now: DateTime<Utc>) -> MergeTarget {
        self.retry(target, now, "error pulling diff")
    }

    pub fn diff_changed(&self, target: MergeTarget, now: DateTime<Utc>) -> MergeTarget {
        target.stop(now, INFO_DIFF_CHANGED.to_string())
    }

    pub fn approval_failed(&self, target: MergeTarget, now: DateTime<Utc>) -> MergeTarget {
        self.retry(target, now, "error approving")
    }

    /// Zero delay so the merge attempt runs on the next scheduler pass.
    pub fn approved(&self, target: MergeTarget, now: DateTime<Utc>) -> MergeTarget {
        target.reschedule(now, Duration::zero(), INFO_APPROVED.to_string())
    }

    pub fn merge_failed(&self, target: MergeTarget, now: DateTime<Utc>) -> MergeTarget {
        self.retry(target, now, "error merging")
    }

    pub fn merged(&self, target: MergeTarget, now: DateTime<Utc>) -> MergeTarget {
        target.stop(now, INFO_MERGED.to_string())
    }

    fn retry(&self, target: MergeTarget, now: DateTime<Utc>, reason: &str) -> MergeTarget {
        let info = format!(
            "{reason} - will check again in {}",
            self.retry_delay_label()
        );
        target.reschedule(now, self.retry_delay, info)
    }

    fn retry_delay_label(&self) -> String {
        describe_delay(self.retry_delay)
    }
}

fn describe_delay(delay: Duration) -> String {
    let seconds = delay.num_seconds();
    if seconds > 0 && seconds % 60 == 0 {
        let minutes = seconds / 60;
        if minutes == 1 {
            "1 minute".to_string()
        } else {
            format!("{minutes} minutes")
        }
    } else if seconds == 1 {
        "1 second".to_string()
    } else {
        format!("{seconds} seconds")
    }
}
