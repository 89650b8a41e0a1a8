//! Post-run processing utilities.
//!
//! Artifact-path extraction and temp-directory removal run inside the session
//! when it reaches a terminal state; history auto-save runs in the front-end
//! once the result has been published.

use crate::engine::PROGRESS_MARKER;
use crate::model::{ConversionMode, ConversionResult, InfoEvent};
use crate::storage;
use std::io;
use std::path::Path;
use tempfile::TempDir;
use tracing::{debug, warn};

/// Substring that marks the line naming the produced image.
pub const ARTIFACT_MARKER: &str = "-->";

fn non_empty(s: &str) -> Option<String> {
    let s = s.trim();
    if s.is_empty() || s == ARTIFACT_MARKER {
        None
    } else {
        Some(s.to_string())
    }
}

fn last_field(line: &str) -> Option<String> {
    line.split_whitespace().last().and_then(non_empty)
}

/// Value named by a line containing [`ARTIFACT_MARKER`].
fn marker_value(mode: &ConversionMode, line: &str) -> Option<String> {
    match mode {
        ConversionMode::Iso => last_field(line),
        ConversionMode::Vdi { .. } => match line.rsplit_once(':') {
            Some((_, tail)) => non_empty(tail),
            None => last_field(line),
        },
    }
}

/// Colon-delimited path on a line without the marker; only absolute paths
/// count so status lines such as `Elapsed: 00:05:12` are skipped.
fn colon_path(line: &str) -> Option<String> {
    if line.starts_with(PROGRESS_MARKER) {
        return None;
    }
    let (_, tail) = line.rsplit_once(':')?;
    non_empty(tail).filter(|v| Path::new(v).is_absolute())
}

/// Find the output image named in `display`, scanning from the end.
///
/// The last line containing `-->` wins: ISO takes its last space-delimited
/// field, VDI the text after its last `:`. VDI output without any `-->` line
/// falls back to the last line whose colon-delimited tail is an absolute path.
/// Returns an empty string when no line qualifies.
pub fn extract_artifact_path(mode: &ConversionMode, display: &str) -> String {
    let lines = || display.lines().rev().map(str::trim).filter(|l| !l.is_empty());

    let marked = lines()
        .filter(|l| l.contains(ARTIFACT_MARKER))
        .find_map(|l| marker_value(mode, l));
    if let Some(path) = marked {
        return path;
    }
    match mode {
        ConversionMode::Iso => String::new(),
        ConversionMode::Vdi { .. } => lines().find_map(colon_path).unwrap_or_default(),
    }
}

/// Remove a session's temp directory. Failures are logged and returned as an
/// info event, never as an error. A directory that is already gone counts as
/// removed.
pub fn remove_temp_dir(dir: TempDir) -> Option<InfoEvent> {
    let path = dir.path().to_path_buf();
    match dir.close() {
        Ok(()) => {
            debug!(path = %path.display(), "temporary folder removed");
            None
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "temporary folder already removed");
            None
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "error deleting temporary folder");
            Some(InfoEvent::CleanupFailed {
                path,
                error: e.to_string(),
            })
        }
    }
}

/// Result of front-end post-processing, ready for presentation layers.
pub(crate) struct ProcessedRun {
    pub auto_saved_path: Option<std::path::PathBuf>,
    pub save_error: Option<String>,
    /// Status-line messages, most important last.
    pub messages: Vec<String>,
}

/// Auto-save a finished run to history and describe what happened.
pub(crate) fn process_run_completion(auto_save: bool, run: &ConversionResult) -> ProcessedRun {
    let mut messages = Vec::new();
    let mut save_error = None;
    let auto_saved_path = if auto_save {
        match storage::save_run(run) {
            Ok(p) => Some(p),
            Err(e) => {
                warn!(error = %e, "failed to save run");
                messages.push(format!("Save failed: {e:#}"));
                save_error = Some(format!("{e:#}"));
                None
            }
        }
    } else {
        None
    };

    if run.artifact_path.is_empty() {
        messages.push("No output image reported".into());
    } else {
        messages.push(format!("Output: {}", run.artifact_path));
    }

    ProcessedRun {
        auto_saved_path,
        save_error,
        messages,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vdi() -> ConversionMode {
        ConversionMode::Vdi {
            name: "mojave".into(),
            size_gb: 32.0,
        }
    }

    #[test]
    fn iso_marker_at_end_of_buffer() {
        let buf = "Creating image\nCompleted: 100%\ncopy --> /out/image.iso\n\n";
        assert_eq!(
            extract_artifact_path(&ConversionMode::Iso, buf),
            "/out/image.iso"
        );
    }

    #[test]
    fn last_marker_wins() {
        let buf = "a --> /tmp/intermediate.cdr\nb --> /out/final.iso\ntrailing\n";
        assert_eq!(
            extract_artifact_path(&ConversionMode::Iso, buf),
            "/out/final.iso"
        );
    }

    #[test]
    fn vdi_uses_colon_separator() {
        let buf = "Completed: 100%\nResult: /out/disk.vdi\n";
        assert_eq!(extract_artifact_path(&vdi(), buf), "/out/disk.vdi");
    }

    #[test]
    fn vdi_accepts_arrow_line_without_colon() {
        let buf = "convert --> /out/disk.vdi\nCompleted: 100%\n";
        assert_eq!(extract_artifact_path(&vdi(), buf), "/out/disk.vdi");
    }

    #[test]
    fn vdi_status_lines_after_the_marker_are_ignored() {
        let buf = "convert --> /out/disk.vdi\nElapsed time: 00:05:12\n";
        assert_eq!(extract_artifact_path(&vdi(), buf), "/out/disk.vdi");
    }

    #[test]
    fn vdi_colon_fallback_needs_an_absolute_path() {
        let buf = "Result: /out/disk.vdi\nError: could not detach\n";
        assert_eq!(extract_artifact_path(&vdi(), buf), "/out/disk.vdi");
        assert_eq!(extract_artifact_path(&vdi(), "Error: could not detach\n"), "");
    }

    #[test]
    fn vdi_marker_line_with_colon_uses_text_after_it() {
        let buf = "Result: /tmp/older.vdi\nimage --> disk: /out/disk.vdi\nDone: ok\n";
        assert_eq!(extract_artifact_path(&vdi(), buf), "/out/disk.vdi");
    }

    #[test]
    fn missing_marker_gives_empty_path() {
        assert_eq!(
            extract_artifact_path(&ConversionMode::Iso, "nothing here\n"),
            ""
        );
        assert_eq!(extract_artifact_path(&ConversionMode::Iso, ""), "");
        assert_eq!(extract_artifact_path(&ConversionMode::Iso, "-->\n"), "");
    }

    #[test]
    fn temp_dir_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_path_buf();
        std::fs::write(path.join("scratch"), b"x").unwrap();
        assert!(remove_temp_dir(dir).is_none());
        assert!(!path.exists());
    }

    #[test]
    fn temp_dir_already_deleted_is_not_a_failure() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::remove_dir(dir.path()).unwrap();
        assert!(remove_temp_dir(dir).is_none());
    }

    #[test]
    fn temp_dir_replaced_by_a_file_reports_cleanup_failure() {
        let root = tempfile::tempdir().unwrap();
        let dir = tempfile::tempdir_in(root.path()).unwrap();
        let path = dir.path().to_path_buf();
        std::fs::remove_dir(&path).unwrap();
        std::fs::write(&path, b"not a dir").unwrap();

        match remove_temp_dir(dir) {
            Some(InfoEvent::CleanupFailed { path: reported, error }) => {
                assert_eq!(reported, path);
                assert!(!error.is_empty());
            }
            other => panic!("expected cleanup failure, got {other:?}"),
        }
    }

    #[test]
    fn completion_without_auto_save_reports_the_artifact() {
        let run = ConversionResult {
            session_id: "abc".into(),
            started_utc: String::new(),
            mode: ConversionMode::Iso,
            installer: "/Applications/Install macOS Mojave.app".into(),
            script: "/scripts/InstallerApp2ISO.sh".into(),
            script_is_override: false,
            status: crate::model::ConversionStatus::Succeeded,
            artifact_path: "/out/image.iso".into(),
            exit_code: Some(0),
            duration_ms: 10,
            display_text: String::new(),
        };
        let processed = process_run_completion(false, &run);
        assert!(processed.auto_saved_path.is_none());
        assert!(processed.save_error.is_none());
        assert_eq!(processed.messages, vec!["Output: /out/image.iso".to_string()]);
    }
}
