use glu_gitlab::GitlabError;
use glu_store::StoreError;
use thiserror::Error;

/// Result type for automation operations.
pub type AutoMergeResult<T> = Result<T, AutoMergeError>;

/// Errors returned by catalog refresh and merge automation operations.
#[derive(Debug, Error)]
pub enum AutoMergeError {
    #[error("author and/or reviewer username must be set")]
    MissingFilter,
    #[error("invalid auto-merge configuration: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Gitlab(#[from] GitlabError),
}
