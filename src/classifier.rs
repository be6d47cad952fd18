//! Decides whether a filename is ignorable (temporary/backup patterns, OS metadata
//! files) or processable. Pure: case-insensitive comparison, no filesystem access.

const IGNORED_SUBSTRINGS: &[&str] = &[
    ".tmp",
    ".temp",
    ".swp",
    ".swo",
    ".bak",
    ".crdownload",
    ".part",
    ".download",
    "thumbs.db",
    "desktop.ini",
    ".ds_store",
];

/// Returns `true` if `name` should be skipped by both the scanner and the watcher.
pub fn is_ignored(name: &str) -> bool {
    let lower = name.to_lowercase();
    if lower.starts_with("~$") {
        return true;
    }
    if lower.ends_with('~') {
        return true;
    }
    IGNORED_SUBSTRINGS.iter().any(|pattern| lower.contains(pattern))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordinary_names_are_kept() {
        assert!(!is_ignored("photo.jpg"));
        assert!(!is_ignored("report.docx"));
        assert!(!is_ignored("archive.tar.gz"));
    }

    #[test]
    fn office_lock_files_are_ignored() {
        assert!(is_ignored("~$report.docx"));
    }

    #[test]
    fn trailing_tilde_is_ignored() {
        assert!(is_ignored("report.docx~"));
    }

    #[test]
    fn temp_and_backup_extensions_are_ignored() {
        for name in [
            "draft.tmp",
            "draft.temp",
            "scratch.swp",
            "scratch.swo",
            "backup.bak",
            "movie.mp4.crdownload",
            "archive.zip.part",
            "installer.exe.download",
        ] {
            assert!(is_ignored(name), "{name} should be ignored");
        }
    }

    #[test]
    fn os_metadata_files_are_ignored() {
        assert!(is_ignored("Thumbs.db"));
        assert!(is_ignored("Desktop.ini"));
        assert!(is_ignored(".DS_Store"));
    }

    #[test]
    fn comparison_is_case_insensitive() {
        assert!(is_ignored("THUMBS.DB"));
        assert!(is_ignored("Report.TMP"));
    }
}
