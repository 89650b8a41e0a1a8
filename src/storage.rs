//! Run history on disk and log export.

use crate::model::ConversionResult;
use crate::resolver::APP_DIR;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

fn runs_dir() -> Result<PathBuf> {
    let base = dirs::data_dir().context("no data directory on this platform")?;
    Ok(base.join(APP_DIR).join("runs"))
}

/// File name sorts chronologically: RFC 3339 timestamp first, then the id.
fn run_file_name(r: &ConversionResult) -> String {
    let stamp: String = r
        .started_utc
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    format!("{stamp}_{}.json", r.session_id)
}

pub fn save_run(r: &ConversionResult) -> Result<PathBuf> {
    save_run_in(&runs_dir()?, r)
}

pub fn save_run_in(dir: &Path, r: &ConversionResult) -> Result<PathBuf> {
    std::fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
    let path = dir.join(run_file_name(r));
    let json = serde_json::to_vec_pretty(r)?;
    std::fs::write(&path, json).with_context(|| format!("write {}", path.display()))?;
    Ok(path)
}

/// Most recent first. Unreadable files are skipped.
pub fn load_recent(limit: usize) -> Result<Vec<ConversionResult>> {
    load_recent_in(&runs_dir()?, limit)
}

pub fn load_recent_in(dir: &Path, limit: usize) -> Result<Vec<ConversionResult>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("read {}", dir.display()))?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.extension().and_then(|x| x.to_str()) == Some("json"))
        .collect();
    files.sort();
    files.reverse();

    let mut out = Vec::new();
    for path in files {
        if out.len() >= limit {
            break;
        }
        let Ok(bytes) = std::fs::read(&path) else {
            continue;
        };
        if let Ok(r) = serde_json::from_slice::<ConversionResult>(&bytes) {
            out.push(r);
        }
    }
    Ok(out)
}

/// Write the display text to `path`.
pub fn export_log(path: &Path, text: &str) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create {}", parent.display()))?;
    }
    std::fs::write(path, text).with_context(|| format!("write {}", path.display()))
}

/// Default export location for a session's log: `<output dir>/<id>.log`.
pub fn default_log_path(output_dir: &Path, session_id: &str) -> PathBuf {
    output_dir.join(format!("installer2iso-{session_id}.log"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ConversionMode, ConversionStatus};

    fn result(id: &str, started: &str) -> ConversionResult {
        ConversionResult {
            session_id: id.into(),
            started_utc: started.into(),
            mode: ConversionMode::Iso,
            installer: PathBuf::from("/Applications/Install macOS Mojave.app"),
            script: PathBuf::from("/s/InstallerApp2ISO.sh"),
            script_is_override: false,
            status: ConversionStatus::Succeeded,
            artifact_path: "/out/Mojave.iso".into(),
            exit_code: Some(0),
            duration_ms: 1200,
            display_text: "done\n".into(),
        }
    }

    #[test]
    fn recent_runs_come_back_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        save_run_in(dir.path(), &result("1", "2026-01-01T10:00:00Z")).unwrap();
        save_run_in(dir.path(), &result("2", "2026-01-02T10:00:00Z")).unwrap();
        save_run_in(dir.path(), &result("3", "2026-01-03T10:00:00Z")).unwrap();
        std::fs::write(dir.path().join("zzz.json"), "not json").unwrap();

        let recent = load_recent_in(dir.path(), 2).unwrap();
        let ids: Vec<_> = recent.iter().map(|r| r.session_id.as_str()).collect();
        assert_eq!(ids, vec!["3", "2"]);
    }

    #[test]
    fn missing_history_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_recent_in(&dir.path().join("none"), 5).unwrap().is_empty());
    }

    #[test]
    fn export_log_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs/run.log");
        export_log(&path, "line1\n").unwrap();
        assert_eq!(std::fs::read_to_string(path).unwrap(), "line1\n");
    }
}
