//! Helpers for sanitizing data before it enters tracing span attributes.
//!
//! Upload locations can carry user or institution names in their
//! directories, so spans only ever see the file name.

use std::path::Path;

/// Returns only the filename component of a path (no directory).
pub fn redact_path(path: &Path) -> String {
    path.file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("<unknown>")
        .to_string()
}

/// Returns the innermost member of an entry path such as
/// `session.zip > S010.zip > essay.txt`, without its directories.
pub fn redact_entry_path(display_path: &str) -> String {
    let member = display_path.rsplit(" > ").next().unwrap_or(display_path);
    redact_path(Path::new(member))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redact_path_returns_filename() {
        assert_eq!(
            redact_path(Path::new("/srv/intake/uploads/job-1/session42.zip")),
            "session42.zip"
        );
    }

    #[test]
    fn test_redact_path_no_filename() {
        assert_eq!(redact_path(Path::new("/")), "<unknown>");
    }

    #[test]
    fn test_redact_entry_path() {
        assert_eq!(
            redact_entry_path("session1.zip > S010.zip > answers/essay.txt"),
            "essay.txt"
        );
        assert_eq!(redact_entry_path("report.pdf"), "report.pdf");
    }
}
