//! Study identity and path segment rules

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Substitute for identifiers that are empty after sanitizing.
pub const UNKNOWN_ID: &str = "UNKNOWN";

/// Extension appended to every stored instance.
pub const INSTANCE_EXT: &str = "dcm";

/// Make an identifier safe to use as a single path segment.
///
/// Path separators and NUL become `_`, leading dots become `_` (hidden names
/// are reserved for in-progress work), and an empty result maps to [`UNKNOWN_ID`].
pub fn sanitize_segment(raw: &str) -> String {
    let trimmed = raw.trim();
    let mut out: String = trimmed
        .chars()
        .map(|c| match c {
            '/' | '\\' | '\0' => '_',
            c => c,
        })
        .collect();
    let dots = out.chars().take_while(|&c| c == '.').count();
    if dots > 0 {
        out.replace_range(..dots, &"_".repeat(dots));
    }
    if out.is_empty() {
        UNKNOWN_ID.to_string()
    } else {
        out
    }
}

/// (subject, accession) pair identifying one study.
///
/// Doubles as the relative directory `<subject>/<accession>` under every root.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StudyKey {
    subject: String,
    accession: String,
}

impl StudyKey {
    /// Build a key from raw identifiers; both are sanitized.
    pub fn new(subject: &str, accession: &str) -> Self {
        Self {
            subject: sanitize_segment(subject),
            accession: sanitize_segment(accession),
        }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn accession(&self) -> &str {
        &self.accession
    }

    /// Relative directory of this study under a root.
    pub fn rel_path(&self) -> PathBuf {
        PathBuf::from(&self.subject).join(&self.accession)
    }
}

impl fmt::Display for StudyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.subject, self.accession)
    }
}

/// Series directory name, or `None` when the instance belongs directly under
/// the study directory.
///
/// The number is zero-padded to two digits; a non-blank description is
/// appended after `_`.
pub fn series_segment(number: Option<u32>, description: Option<&str>) -> Option<String> {
    let number = number?;
    let mut segment = format!("{number:02}");
    if let Some(desc) = description.map(str::trim).filter(|d| !d.is_empty()) {
        segment.push('_');
        segment.push_str(&desc.replace(['/', '\\', '\0'], "_"));
    }
    Some(segment)
}

/// File name of a stored instance.
///
/// Instance UIDs contain dots, so the extension is appended to the whole id
/// instead of replacing whatever follows the last dot.
pub fn instance_file_name(instance_id: &str) -> String {
    format!("{}.{INSTANCE_EXT}", sanitize_segment(instance_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn separators_replaced() {
        assert_eq!(sanitize_segment("a/b\\c"), "a_b_c");
    }

    #[test]
    fn hidden_and_empty_ids() {
        assert_eq!(sanitize_segment(""), UNKNOWN_ID);
        assert_eq!(sanitize_segment("   "), UNKNOWN_ID);
        assert_eq!(sanitize_segment(".."), "__");
        assert_eq!(sanitize_segment(".secret"), "_secret");
        assert_eq!(sanitize_segment("a.b"), "a.b");
    }

    #[test]
    fn sanitize_is_idempotent() {
        for raw in ["P1", "a/b", "..x", "", "1.2.840"] {
            let once = sanitize_segment(raw);
            assert_eq!(sanitize_segment(&once), once);
        }
    }

    #[test]
    fn key_path_and_display() {
        let key = StudyKey::new("P1", "A1");
        assert_eq!(key.rel_path(), PathBuf::from("P1/A1"));
        assert_eq!(key.to_string(), "P1/A1");
    }

    #[test]
    fn key_cannot_escape_root() {
        let key = StudyKey::new("../etc", "/passwd");
        assert_eq!(key.subject(), "___etc");
        assert_eq!(key.accession(), "_passwd");
        assert!(!key.rel_path().to_string_lossy().contains(".."));
        assert!(key.rel_path().is_relative());
    }

    #[test]
    fn series_segment_rules() {
        assert_eq!(series_segment(None, Some("AX T1")), None);
        assert_eq!(series_segment(Some(1), None).as_deref(), Some("01"));
        assert_eq!(series_segment(Some(123), None).as_deref(), Some("123"));
        assert_eq!(
            series_segment(Some(3), Some("T1/T2 MAP")).as_deref(),
            Some("03_T1_T2 MAP")
        );
        assert_eq!(series_segment(Some(4), Some("  ")).as_deref(), Some("04"));
    }

    #[test]
    fn instance_name_keeps_uid_dots() {
        assert_eq!(
            instance_file_name("1.2.840.113619.2.55"),
            "1.2.840.113619.2.55.dcm"
        );
    }
}
