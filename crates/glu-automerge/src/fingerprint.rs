//! Diff fingerprints bind an automated approval to the exact content a human reviewed.
//!
//! A fingerprint is the verbatim concatenation of every diff fragment, each
//! followed by a newline. It is compared byte-for-byte; whitespace-only changes
//! invalidate it.

use glu_gitlab::MergeRequestDiff;

/// Renders the fingerprint (and human-readable unified diff) of `diffs`.
pub fn diff_fingerprint(diffs: &[MergeRequestDiff]) -> String {
    let capacity = diffs.iter().map(|diff| diff.diff.len() + 1).sum();
    let mut rendered = String::with_capacity(capacity);
    for diff in diffs {
        rendered.push_str(&diff.diff);
        rendered.push('\n');
    }
    rendered
}

/// Returns true when `diffs` renders exactly to `expected`.
pub fn fingerprint_matches(expected: &str, diffs: &[MergeRequestDiff]) -> bool {
    diff_fingerprint(diffs) == expected
}
