//! Merge request catalog cache and authorized auto-merge automation.
//!
//! [`MergeRequestManager`] is the entry point: it keeps cached projects and
//! merge requests fresh, records human authorizations as [`MergeTarget`]s,
//! and runs the background scheduler that approves and merges them once
//! GitLab reports them ready.

mod config;
mod error;
mod fingerprint;
mod keys;
mod manager;
mod merge_target;
mod scheduler;
mod sync;

#[cfg(test)]
mod test_support;

pub use config::AutoMergeConfig;
pub use error::{AutoMergeError, AutoMergeResult};
pub use fingerprint::{diff_fingerprint, fingerprint_matches};
pub use keys::{item_key, project_key, target_key};
pub use manager::{MergeRequestInfo, MergeRequestManager};
pub use merge_target::{
    MergePolicy, MergeStatusClass, MergeTarget, TargetAction, Transition, INFO_APPROVED,
    INFO_CLEARED, INFO_DIFF_CHANGED, INFO_ENABLED, INFO_MERGED,
};
pub use scheduler::{EnqueueReport, ProcessOutcome, SchedulerHandle, TargetProcessor};
pub use sync::{CatalogSync, SyncReport};
