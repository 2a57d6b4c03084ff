//! Record store key scheme. Every prefix is scanned as a whole collection.

use glu_gitlab::MergeRequestFilter;

pub const PROJECT_PREFIX: &str = "project-";
pub const ITEM_PREFIX: &str = "item-";
pub const TARGET_PREFIX: &str = "target-";
pub const TIMESTAMP_PREFIX: &str = "ts-";

pub const PROJECTS_RESOURCE: &str = "projects";
pub const ITEMS_RESOURCE_PREFIX: &str = "items-";

pub fn project_key(id: u64) -> String {
    format!("{PROJECT_PREFIX}{id}")
}

pub fn item_key(id: u64) -> String {
    format!("{ITEM_PREFIX}{id}")
}

pub fn target_key(id: u64) -> String {
    format!("{TARGET_PREFIX}{id}")
}

pub fn timestamp_key(resource_id: &str) -> String {
    format!("{TIMESTAMP_PREFIX}{resource_id}")
}

/// Refresh resource id for a merge request listing; an absent filter renders as `*`.
pub fn items_resource_id(filter: &MergeRequestFilter) -> String {
    format!(
        "{ITEMS_RESOURCE_PREFIX}{}-{}",
        filter.author_username.as_deref().unwrap_or("*"),
        filter.reviewer_username.as_deref().unwrap_or("*")
    )
}
