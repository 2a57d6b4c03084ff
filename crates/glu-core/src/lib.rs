//! Foundational low-level utilities shared across gitlab-util crates.
//!
//! Provides atomic file-write helpers for credential files and the RFC3339
//! time helpers used by refresh timestamps and staleness checks.

pub mod atomic_io;
pub mod time_utils;

pub use atomic_io::write_secret_atomic;
pub use time_utils::{format_rfc3339, is_stale, parse_rfc3339};
