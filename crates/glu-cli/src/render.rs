use chrono::{DateTime, Utc};
use glu_automerge::MergeRequestInfo;
use glu_gitlab::MergeRequestDiff;

const TITLE_WIDTH: usize = 60;

/// Coarse relative time, e.g. `3m ago` or `in 45s`.
pub fn relative_time(instant: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let delta = now.signed_duration_since(instant);
    let seconds = delta.num_seconds();
    let magnitude = seconds.unsigned_abs();
    let amount = if magnitude < 60 {
        format!("{magnitude}s")
    } else if magnitude < 3_600 {
        format!("{}m", magnitude / 60)
    } else if magnitude < 86_400 {
        format!("{}h", magnitude / 3_600)
    } else {
        format!("{}d", magnitude / 86_400)
    };
    if seconds >= 0 {
        format!("{amount} ago")
    } else {
        format!("in {amount}")
    }
}

fn truncate(text: &str, width: usize) -> String {
    if text.chars().count() <= width {
        return text.to_string();
    }
    let mut clipped = text.chars().take(width.saturating_sub(1)).collect::<String>();
    clipped.push('…');
    clipped
}

pub fn status_header() -> String {
    format!(
        "{:<24} {:<TITLE_WIDTH$} {:<10} {:<24} {:<44} {:<10} {}",
        "#", "Title", "Updated", "State", "Action Info", "Last", "Next Try"
    )
}

/// One row per merge request; action columns stay blank without an automation record.
pub fn status_line(info: &MergeRequestInfo, now: DateTime<Utc>) -> String {
    let merge_request = &info.merge_request;
    let updated = merge_request
        .updated_at
        .map(|updated| relative_time(updated, now))
        .unwrap_or_default();
    let (action_info, last, next) = match &info.target {
        Some(target) => (
            target.info.clone(),
            target
                .latest
                .map(|latest| relative_time(latest, now))
                .unwrap_or_default(),
            if target.active {
                relative_time(target.next, now)
            } else {
                String::new()
            },
        ),
        None => (String::new(), String::new(), String::new()),
    };
    format!(
        "{:<24} {:<TITLE_WIDTH$} {:<10} {:<24} {:<44} {:<10} {}",
        info.human_id(),
        truncate(&merge_request.title, TITLE_WIDTH),
        updated,
        merge_request.detailed_merge_status,
        action_info,
        last,
        next
    )
    .trim_end()
    .to_string()
}

/// Unified diff text with a header per file.
pub fn render_diff(diffs: &[MergeRequestDiff]) -> String {
    let mut rendered = String::new();
    for diff in diffs {
        rendered.push_str(&format!("diff a/{} b/{}\n", diff.old_path, diff.new_path));
        rendered.push_str(&diff.diff);
        rendered.push('\n');
    }
    rendered
}
