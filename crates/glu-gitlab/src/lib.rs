//! GitLab REST v4 client and entity models for gitlab-util.
//!
//! The [`GitlabApi`] trait is the seam the automation core talks to; the
//! reqwest-backed [`GitlabApiClient`] is the production implementation and
//! tests substitute in-process fakes.

use async_trait::async_trait;
use thiserror::Error;

mod client;
pub mod models;
mod transport;

pub use client::{GitlabApiClient, GitlabClientConfig};
pub use models::{ApprovalState, GitlabUser, MergeRequest, MergeRequestDiff, Project};

/// Result type for GitLab API operations.
pub type GitlabResult<T> = Result<T, GitlabError>;

/// Errors returned by GitLab API implementations.
#[derive(Debug, Error)]
pub enum GitlabError {
    #[error("invalid gitlab client configuration: {0}")]
    InvalidConfig(String),
    #[error("gitlab api {operation} request failed: {source}")]
    Transport {
        operation: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("gitlab api {operation} failed with status {status}: {body}")]
    HttpStatus {
        operation: String,
        status: u16,
        body: String,
    },
    #[error("failed to decode gitlab {operation}: {message}")]
    Decode { operation: String, message: String },
}

impl GitlabError {
    /// HTTP status of a non-success response, when there was one.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// One page of a paginated listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Next page number, `None` on the last page.
    pub next_page: Option<u32>,
}

impl<T> Page<T> {
    pub fn last(items: Vec<T>) -> Self {
        Self {
            items,
            next_page: None,
        }
    }
}

/// Author/reviewer filter for open merge request listings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeRequestFilter {
    pub author_username: Option<String>,
    pub reviewer_username: Option<String>,
}

impl MergeRequestFilter {
    pub fn new(author: Option<&str>, reviewer: Option<&str>) -> Self {
        let normalize = |value: Option<&str>| {
            value
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_string)
        };
        Self {
            author_username: normalize(author),
            reviewer_username: normalize(reviewer),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.author_username.is_none() && self.reviewer_username.is_none()
    }
}

#[async_trait]
/// Remote operations gitlab-util needs from a GitLab instance.
pub trait GitlabApi: Send + Sync {
    async fn current_user(&self) -> GitlabResult<GitlabUser>;

    async fn list_projects(&self, page: u32) -> GitlabResult<Page<Project>>;

    async fn list_merge_requests(
        &self,
        filter: &MergeRequestFilter,
        page: u32,
    ) -> GitlabResult<Page<MergeRequest>>;

    async fn get_merge_request(&self, project_id: u64, iid: u64) -> GitlabResult<MergeRequest>;

    async fn list_merge_request_diffs(
        &self,
        project_id: u64,
        iid: u64,
        page: u32,
    ) -> GitlabResult<Page<MergeRequestDiff>>;

    async fn approve_merge_request(&self, project_id: u64, iid: u64)
        -> GitlabResult<ApprovalState>;

    async fn accept_merge_request(&self, project_id: u64, iid: u64) -> GitlabResult<MergeRequest>;

    /// Collects every diff fragment across all pages, in API order.
    async fn all_merge_request_diffs(
        &self,
        project_id: u64,
        iid: u64,
    ) -> GitlabResult<Vec<MergeRequestDiff>> {
        let mut page = 1_u32;
        let mut rows = Vec::new();
        loop {
            let chunk = self.list_merge_request_diffs(project_id, iid, page).await?;
            rows.extend(chunk.items);
            match chunk.next_page {
                Some(next) if next > page => page = next,
                _ => break,
            }
        }
        Ok(rows)
    }
}
