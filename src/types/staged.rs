//! Staged-change sets: the parsed output of Gerrit's `staging-ls` query.
//!
//! One line per change, in the form:
//!
//! ```text
//! <40-hex sha> <change>,<patchset> <one-line summary>
//! ```
//!
//! The set is used to detect staging-branch quiescence (content equality) and
//! to build human-readable change lists for Jenkins build descriptions and
//! mail bodies. Malformed lines are skipped, never fatal: Gerrit occasionally
//! emits informational noise on the same stream.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::ids::Sha;

/// One staged change awaiting CI validation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StagedChange {
    /// Commit SHA-1 of the change's current patch set.
    pub sha1: Sha,
    /// Gerrit change number.
    pub change: u64,
    /// Patch-set number within the change.
    pub patch_set: u32,
    /// One-line commit summary.
    pub summary: String,
}

impl StagedChange {
    /// Parses a single `staging-ls` output line, returning `None` for
    /// malformed input.
    pub fn parse_line(line: &str) -> Option<Self> {
        let mut parts = line.trim_end().splitn(3, ' ');
        let sha1 = Sha::parse(parts.next()?)?;
        let (change_str, patch_set_str) = parts.next()?.split_once(',')?;
        let change = change_str.parse().ok()?;
        let patch_set = patch_set_str.parse().ok()?;
        let summary = parts.next().unwrap_or("").to_string();
        Some(StagedChange {
            sha1,
            change,
            patch_set,
            summary,
        })
    }
}

impl fmt::Display for StagedChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{},{}] {}",
            self.sha1.short(),
            self.change,
            self.patch_set,
            self.summary
        )
    }
}

/// Parses complete `staging-ls` output. Blank output means nothing staged.
pub fn parse_staging_ls(output: &str) -> Vec<StagedChange> {
    output
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(StagedChange::parse_line)
        .collect()
}

/// Renders a change list as plain text, one change per line.
///
/// Used in Gerrit approve messages and report mail bodies.
pub fn format_change_list(changes: &[StagedChange]) -> String {
    changes
        .iter()
        .map(|c| c.to_string())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Renders a change list as an HTML fragment for Jenkins build descriptions.
pub fn format_change_list_html(changes: &[StagedChange]) -> String {
    let mut out = String::from("Tested changes:<ul>");
    for c in changes {
        out.push_str(&format!(
            "<li>{},{}: {}</li>",
            c.change,
            c.patch_set,
            html_escape(&c.summary)
        ));
    }
    out.push_str("</ul>");
    out
}

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const SHA: &str = "0123456789abcdef0123456789abcdef01234567";

    #[test]
    fn parse_line_roundtrip() {
        let line = format!("{} 123,4 summary text", SHA);
        let parsed = StagedChange::parse_line(&line).unwrap();
        assert_eq!(parsed.sha1.as_str(), SHA);
        assert_eq!(parsed.change, 123);
        assert_eq!(parsed.patch_set, 4);
        assert_eq!(parsed.summary, "summary text");
    }

    #[test]
    fn parse_line_without_summary() {
        // Gerrit can emit a bare "<sha> <change>,<ps>" for empty subjects.
        let line = format!("{} 7,1", SHA);
        let parsed = StagedChange::parse_line(&line).unwrap();
        assert_eq!(parsed.summary, "");
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let output = format!(
            "{} 123,4 good one\n\
             not a sha at all\n\
             {} nocomma here\n\
             {} 55,2 another good one\n",
            SHA, SHA, SHA
        );
        let parsed = parse_staging_ls(&output);
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].change, 123);
        assert_eq!(parsed[1].change, 55);
    }

    #[test]
    fn blank_output_means_nothing_staged() {
        assert!(parse_staging_ls("").is_empty());
        assert!(parse_staging_ls("\n  \n").is_empty());
    }

    #[test]
    fn html_formatting_escapes_markup() {
        let changes = vec![StagedChange {
            sha1: Sha::parse(SHA).unwrap(),
            change: 1,
            patch_set: 1,
            summary: "Fix <b> & co".to_string(),
        }];
        let html = format_change_list_html(&changes);
        assert!(html.contains("Fix &lt;b&gt; &amp; co"));
        assert!(!html.contains("<b>"));
    }

    proptest! {
        /// Any well-formed line parses back to its components.
        #[test]
        fn parse_wellformed_lines(
            change in 1u64..10_000_000,
            patch_set in 1u32..100,
            summary in "[ -~]{0,80}",
        ) {
            // Leading spaces in the summary survive; the parser splits on the
            // first two spaces only.
            let line = format!("{} {},{} {}", SHA, change, patch_set, summary);
            let parsed = StagedChange::parse_line(&line).unwrap();
            prop_assert_eq!(parsed.change, change);
            prop_assert_eq!(parsed.patch_set, patch_set);
            prop_assert_eq!(parsed.summary, summary.trim_end());
        }

        /// The parser never panics on arbitrary input.
        #[test]
        fn parser_never_panics(input in ".{0,200}") {
            let _ = parse_staging_ls(&input);
        }
    }
}
