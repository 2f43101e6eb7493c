//! Markdown rendering of status reports

use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::{NoExpand, Regex};

use super::failure::{Failure, FailureCause, FailuresByLevel, Stage, Status};

/// Longest comment or issue body the tracker accepts, in characters
pub const MAX_COMMENT_LENGTH: usize = 65536;

/// Header every status report starts with
pub const REPORT_HEADER: &str = "## Indexing status: ";

const INSERT_START_MARKER: &str = "<!-- Automatic message start -->";
const INSERT_END_MARKER: &str = "<!-- Automatic message end -->";
const LAST_UPDATE_INTRO: &str = "\n## Last update\n";
const TRUNCATED_MARKER: &str = "### Message truncated as it was too long\n";

static TITLE_STATUS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(:\s*([^() ]+) )?\s*\(updated [^)]+\)").unwrap_or_else(|e| {
        unreachable!("status pattern is valid: {e}")
    })
});

/// Title label of an attempt that has started but not reported yet
pub const IN_PROGRESS_LABEL: &str = "InProgress";

/// Replace (or append) the `: <Status> (updated <time>)` marker of a title
#[must_use]
pub fn status_summary(now: DateTime<Utc>, status: Status, previous: &str) -> String {
    title_marker(now, status.as_str(), previous)
}

/// Same marker as [`status_summary`], labelled [`IN_PROGRESS_LABEL`]
#[must_use]
pub fn in_progress_summary(now: DateTime<Utc>, previous: &str) -> String {
    title_marker(now, IN_PROGRESS_LABEL, previous)
}

fn title_marker(now: DateTime<Utc>, label: &str, previous: &str) -> String {
    let marker = format!(": {} (updated {})", label, now.format("%Y-%m-%dT%H:%M:%SZ"));

    if TITLE_STATUS.is_match(previous) {
        TITLE_STATUS
            .replace_all(previous, NoExpand(&marker))
            .into_owned()
    } else {
        format!("{previous}{marker}")
    }
}

/// Full report: header line followed by the details
#[must_use]
pub fn status_report(status: Status, failures: &FailuresByLevel, include_causes: bool) -> String {
    let mut report = format!("{REPORT_HEADER}{status}\n");
    status_details(&mut report, failures, include_causes);
    report
}

/// Append failures grouped by level, then by stage in fixed order.
///
/// Failures are sorted inside each group so identical sets render identically.
pub fn status_details(out: &mut String, failures: &FailuresByLevel, include_causes: bool) {
    for (level, list) in failures {
        if list.is_empty() {
            continue;
        }
        let _ = write!(out, "\n### {level}\n");

        for stage in Stage::ALL {
            let sorted: BTreeSet<&Failure> = list.iter().filter(|f| f.stage == stage).collect();
            if sorted.is_empty() {
                continue;
            }

            out.push_str("<details>\n");
            let _ = write!(out, "  <summary>Issues with <code>{stage}</code>:</summary>\n\n");
            for failure in sorted {
                let _ = writeln!(out, "  * {}", failure.details);
                if include_causes {
                    if let Some(cause) = &failure.cause {
                        render_cause(out, cause);
                    }
                }
            }
            out.push_str("</details>\n");
        }
    }
}

fn render_cause(out: &mut String, cause: &FailureCause) {
    out.push_str("\n    <details>\n");
    let _ = write!(out, "      <summary>Cause: <code>{}</code></summary>\n\n", first_line(&cause.summary));
    out.push_str("    ```\n");
    for line in cause.summary.lines() {
        let _ = writeln!(out, "    {line}");
    }
    for source in &cause.chain {
        let _ = writeln!(out, "    caused by: {source}");
    }
    out.push_str("    ```\n    </details>\n\n");
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or_default()
}

/// Rewrite the automatic section of an issue description with `message`.
///
/// The section is created at the end of the description when missing; text
/// outside the markers is preserved.
#[must_use]
pub fn insert_message_in_description(description: Option<&str>, message: &str) -> String {
    let description = description.unwrap_or_default();

    let (before, after) = match description.find(INSERT_START_MARKER) {
        Some(start) => {
            let content_start = start + INSERT_START_MARKER.len();
            match description[content_start..].find(INSERT_END_MARKER) {
                Some(end) => (
                    &description[..content_start],
                    &description[content_start + end..],
                ),
                None => (description, ""),
            }
        }
        None => (description, ""),
    };

    let mut result = String::with_capacity(description.len() + message.len() + 128);
    if after.is_empty() {
        // No complete section yet: start a new one
        result.push_str(before);
        result.push('\n');
        result.push_str(INSERT_START_MARKER);
        result.push_str(LAST_UPDATE_INTRO);
        let reserved = char_len(&result) + 1 + INSERT_END_MARKER.chars().count();
        result.push_str(&truncate_for_max_length(&as_markdown_quote(message), reserved));
        result.push('\n');
        result.push_str(INSERT_END_MARKER);
    } else {
        result.push_str(before);
        result.push_str(LAST_UPDATE_INTRO);
        let reserved = char_len(&result) + 1 + char_len(after);
        result.push_str(&truncate_for_max_length(&as_markdown_quote(message), reserved));
        result.push('\n');
        result.push_str(after);
    }
    result
}

/// Truncate `message` so that it fits alongside `reserved` other characters
#[must_use]
pub fn truncate_for_max_length(message: &str, reserved: usize) -> String {
    let max = MAX_COMMENT_LENGTH.saturating_sub(reserved);
    if char_len(message) <= max {
        return message.to_string();
    }

    TRUNCATED_MARKER
        .chars()
        .chain(message.chars())
        .take(max)
        .collect()
}

fn as_markdown_quote(text: &str) -> String {
    text.lines()
        .map(|line| format!("> {line}"))
        .collect::<Vec<_>>()
        .join("\n")
}

fn char_len(text: &str) -> usize {
    text.chars().count()
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::reporting::failure::Level;

    fn epoch() -> DateTime<Utc> {
        Utc.timestamp_opt(0, 0).unwrap()
    }

    #[test]
    fn test_summary_appends_marker_to_plain_title() {
        assert_eq!(
            status_summary(epoch(), Status::Critical, "[PROD] Docs indexing"),
            "[PROD] Docs indexing: Critical (updated 1970-01-01T00:00:00Z)"
        );
    }

    #[test]
    fn test_summary_replaces_bare_updated_marker() {
        assert_eq!(
            status_summary(
                epoch(),
                Status::Warning,
                "[PROD] Docs indexing (updated 2024-05-28T00:03:23Z)"
            ),
            "[PROD] Docs indexing: Warning (updated 1970-01-01T00:00:00Z)"
        );
    }

    #[test]
    fn test_summary_replaces_previous_status() {
        for previous in ["Critical", "Warning", "Success", "Unstable"] {
            let title = format!("[PROD] Docs indexing: {previous} (updated 2024-05-28T00:03:23Z)");
            assert_eq!(
                status_summary(epoch(), Status::Success, &title),
                "[PROD] Docs indexing: Success (updated 1970-01-01T00:00:00Z)"
            );
        }
    }

    #[test]
    fn test_in_progress_marker_is_replaced_by_status() {
        let running = in_progress_summary(epoch(), "Docs indexing: Critical (updated 2024-05-28T00:03:23Z)");
        assert_eq!(running, "Docs indexing: InProgress (updated 1970-01-01T00:00:00Z)");
        assert_eq!(
            status_summary(epoch(), Status::Warning, &running),
            "Docs indexing: Warning (updated 1970-01-01T00:00:00Z)"
        );
    }

    #[test]
    fn test_summary_is_idempotent() {
        let once = status_summary(epoch(), Status::Warning, "Docs");
        let twice = status_summary(epoch(), Status::Warning, &once);
        assert_eq!(once, twice);
    }

    fn sample_failures() -> FailuresByLevel {
        let mut failures = FailuresByLevel::new();
        failures.insert(
            Level::Warning,
            vec![
                Failure::new(Level::Warning, Stage::Parsing, "page b is empty"),
                Failure::new(Level::Warning, Stage::Parsing, "page a is empty"),
            ],
        );
        failures.insert(
            Level::Critical,
            vec![Failure::new(Level::Critical, Stage::Indexing, "backend unreachable")],
        );
        failures
    }

    #[test]
    fn test_report_orders_levels_and_stages() {
        let report = status_report(Status::Critical, &sample_failures(), false);
        assert_eq!(
            report,
            "## Indexing status: Critical\n\
             \n### CRITICAL\n\
             <details>\n  <summary>Issues with <code>INDEXING</code>:</summary>\n\n\
             \x20 * backend unreachable\n\
             </details>\n\
             \n### WARNING\n\
             <details>\n  <summary>Issues with <code>PARSING</code>:</summary>\n\n\
             \x20 * page a is empty\n\
             \x20 * page b is empty\n\
             </details>\n"
        );
    }

    #[test]
    fn test_report_is_independent_of_collection_order() {
        let mut reversed = sample_failures();
        for list in reversed.values_mut() {
            list.reverse();
        }
        assert_eq!(
            status_report(Status::Critical, &sample_failures(), true),
            status_report(Status::Critical, &reversed, true)
        );
    }

    #[test]
    fn test_report_renders_causes_when_asked() {
        let io = std::io::Error::other("connection refused");
        let mut failures = FailuresByLevel::new();
        failures.insert(
            Level::Critical,
            vec![Failure::new(Level::Critical, Stage::Indexing, "rollover failed").with_cause(&io)],
        );

        let with = status_report(Status::Critical, &failures, true);
        assert!(with.contains("<summary>Cause: <code>connection refused</code></summary>"));
        assert!(with.contains("    ```\n    connection refused\n    ```\n"));

        let without = status_report(Status::Critical, &failures, false);
        assert!(!without.contains("Cause"));
    }

    #[test]
    fn test_success_report_has_only_header() {
        assert_eq!(
            status_report(Status::Success, &FailuresByLevel::new(), true),
            "## Indexing status: Success\n"
        );
    }

    #[test]
    fn test_insert_into_empty_description() {
        let body = insert_message_in_description(None, "line 1\nline 2");
        assert_eq!(
            body,
            "\n<!-- Automatic message start -->\n## Last update\n> line 1\n> line 2\n<!-- Automatic message end -->"
        );
    }

    #[test]
    fn test_insert_replaces_existing_section() {
        let original = "Intro text\n<!-- Automatic message start -->\n## Last update\n> old\n<!-- Automatic message end -->\nFooter";
        let body = insert_message_in_description(Some(original), "new");
        assert_eq!(
            body,
            "Intro text\n<!-- Automatic message start -->\n## Last update\n> new\n<!-- Automatic message end -->\nFooter"
        );

        // Re-inserting the same message does not change anything
        assert_eq!(insert_message_in_description(Some(&body), "new"), body);
    }

    #[test]
    fn test_insert_appends_after_existing_text() {
        let body = insert_message_in_description(Some("Tracking issue"), "ok");
        assert!(body.starts_with("Tracking issue\n<!-- Automatic message start -->"));
        assert!(body.ends_with("> ok\n<!-- Automatic message end -->"));
    }

    #[test]
    fn test_truncate_short_message_untouched() {
        assert_eq!(truncate_for_max_length("short", 0), "short");
    }

    #[test]
    fn test_truncate_long_message() {
        let long = "é".repeat(MAX_COMMENT_LENGTH + 10);
        let truncated = truncate_for_max_length(&long, 100);
        assert_eq!(truncated.chars().count(), MAX_COMMENT_LENGTH - 100);
        assert!(truncated.starts_with("### Message truncated as it was too long\né"));
    }

    #[test]
    fn test_long_description_stays_within_limit() {
        let long = "x".repeat(MAX_COMMENT_LENGTH * 2);
        let body = insert_message_in_description(Some("Intro"), &long);
        assert_eq!(body.chars().count(), MAX_COMMENT_LENGTH);
        assert!(body.ends_with("<!-- Automatic message end -->"));
    }
}
