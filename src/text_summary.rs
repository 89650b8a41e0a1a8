//! Text summary builder for CLI output.
//!
//! Formats a finished conversion into human-readable lines for text mode and
//! for `--history` listings.

use crate::model::{ConversionMode, ConversionResult, ConversionStatus};
use std::time::Duration;

/// Pre-formatted lines for text output.
pub(crate) struct TextSummary {
    pub lines: Vec<String>,
}

fn mode_detail(mode: &ConversionMode) -> String {
    match mode {
        ConversionMode::Iso => "ISO".to_string(),
        ConversionMode::Vdi { name, size_gb } => format!("VDI ({name}, {size_gb:.0} GB)"),
    }
}

fn status_word(status: ConversionStatus) -> &'static str {
    match status {
        ConversionStatus::Succeeded => "completed",
        ConversionStatus::Cancelled => "cancelled",
        ConversionStatus::FailedToLaunch => "failed to launch",
    }
}

fn format_duration(ms: u64) -> String {
    // whole seconds are enough for multi-minute conversions
    let secs = Duration::from_millis(ms).as_secs();
    humantime::format_duration(Duration::from_secs(secs)).to_string()
}

/// Build the end-of-run summary.
pub(crate) fn build_text_summary(result: &ConversionResult) -> TextSummary {
    let mut lines = Vec::new();
    lines.push(format!(
        "Conversion {} after {}",
        status_word(result.status),
        format_duration(result.duration_ms)
    ));
    lines.push(format!("Installer: {}", result.installer.display()));
    lines.push(format!("Mode:      {}", mode_detail(&result.mode)));
    let origin = if result.script_is_override {
        "external"
    } else {
        "bundled"
    };
    lines.push(format!("Script:    {} ({origin})", result.script.display()));
    if let Some(code) = result.exit_code {
        lines.push(format!("Exit code: {code}"));
    }
    if !result.artifact_path.is_empty() {
        lines.push(format!("Output:    {}", result.artifact_path));
    }
    TextSummary { lines }
}

/// One line per stored run for `--history`.
pub(crate) fn history_line(result: &ConversionResult) -> String {
    let artifact = if result.artifact_path.is_empty() {
        "-"
    } else {
        result.artifact_path.as_str()
    };
    format!(
        "{}  {:<4} {:<16} {}",
        result.started_utc,
        result.mode.label(),
        status_word(result.status),
        artifact
    )
}
