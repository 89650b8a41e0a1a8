use crate::engine::filter::DisplayChange;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Smallest VDI disk the conversion script accepts, in GB.
pub const MIN_DISK_SIZE_GB: f64 = 15.0;
/// Largest VDI disk the conversion script accepts, in GB.
pub const MAX_DISK_SIZE_GB: f64 = 100_000.0;

/// Settings shared by every run of a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Interpreter invoked with `-c <script invocation>`.
    pub shell: PathBuf,
    pub bundled_dir: PathBuf,
    #[serde(default)]
    pub override_dir: Option<PathBuf>,
    #[serde(default)]
    pub privileged_helper: Option<PathBuf>,
    #[serde(with = "humantime_serde")]
    pub kill_grace: Duration,
    /// Value forced into `TERM`; the conversion scripts need a valid terminal type.
    pub term: String,
    /// Entries layered over the inherited environment after `TERM` and `AUTH_PROMPT`.
    #[serde(default)]
    pub extra_env: BTreeMap<String, String>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            shell: PathBuf::from("/bin/bash"),
            bundled_dir: PathBuf::from("scripts"),
            override_dir: None,
            privileged_helper: None,
            kill_grace: Duration::from_secs(3),
            term: "vt220".into(),
            extra_env: BTreeMap::new(),
        }
    }
}

/// Which image the script produces, with the per-mode parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ConversionMode {
    Iso,
    Vdi { name: String, size_gb: f64 },
}

impl ConversionMode {
    /// Logical name of the script implementing this mode.
    pub fn script_name(&self) -> &'static str {
        match self {
            ConversionMode::Iso => "InstallerApp2ISO.sh",
            ConversionMode::Vdi { .. } => "InstallerApp2VDI.sh",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ConversionMode::Iso => "ISO",
            ConversionMode::Vdi { .. } => "VDI",
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ParamsError {
    #[error("no installer selected")]
    MissingInstaller,
    #[error("no output directory selected")]
    MissingOutput,
    #[error("disk name must not be empty")]
    EmptyDiskName,
    #[error("disk size {0} GB is outside the supported range of 15 to 100000 GB")]
    DiskSize(f64),
    #[error("verbosity {0} is above the maximum of 3")]
    Verbosity(u8),
}

/// Everything one conversion request needs besides the session-wide config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionParams {
    pub mode: ConversionMode,
    pub installer: PathBuf,
    pub output_dir: PathBuf,
    pub verbosity: u8,
    pub dry_run: bool,
    /// Appended verbatim, in order, after the generated flags.
    #[serde(default)]
    pub extra_args: Vec<String>,
}

impl ConversionParams {
    pub fn validate(&self) -> Result<(), ParamsError> {
        if self.installer.as_os_str().is_empty() {
            return Err(ParamsError::MissingInstaller);
        }
        if self.output_dir.as_os_str().is_empty() {
            return Err(ParamsError::MissingOutput);
        }
        if self.verbosity > 3 {
            return Err(ParamsError::Verbosity(self.verbosity));
        }
        if let ConversionMode::Vdi { name, size_gb } = &self.mode {
            if name.trim().is_empty() {
                return Err(ParamsError::EmptyDiskName);
            }
            if !(MIN_DISK_SIZE_GB..=MAX_DISK_SIZE_GB).contains(size_gb) {
                return Err(ParamsError::DiskSize(*size_gb));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Idle,
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::Completed | SessionState::Cancelled | SessionState::Failed
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Idle => write!(f, "Idle"),
            SessionState::Running => write!(f, "Running"),
            SessionState::Completed => write!(f, "Completed"),
            SessionState::Cancelled => write!(f, "Cancelled"),
            SessionState::Failed => write!(f, "Failed"),
        }
    }
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConversionStatus {
    Succeeded,
    Cancelled,
    FailedToLaunch,
}

impl ConversionStatus {
    pub fn state(self) -> SessionState {
        match self {
            ConversionStatus::Succeeded => SessionState::Completed,
            ConversionStatus::Cancelled => SessionState::Cancelled,
            ConversionStatus::FailedToLaunch => SessionState::Failed,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionResult {
    pub session_id: String,
    #[serde(default)]
    pub started_utc: String,
    pub mode: ConversionMode,
    pub installer: PathBuf,
    pub script: PathBuf,
    #[serde(default)]
    pub script_is_override: bool,
    pub status: ConversionStatus,
    /// Empty when no artifact marker line was found.
    pub artifact_path: String,
    #[serde(default)]
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    pub display_text: String,
}

/// Events emitted by the session loop and consumed by the TUI/CLI layers.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    StateChanged {
        state: SessionState,
    },
    Output {
        /// Filtered text of this chunk only.
        chunk: String,
        /// Edit bringing a consumer's copy of the display buffer up to date.
        change: DisplayChange,
    },
    Info(InfoEvent),
    Finished {
        result: Box<ConversionResult>,
    },
}

/// Structured info events rendered by presentation layers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum InfoEvent {
    Message(String),
    ScriptSelected { path: PathBuf, is_override: bool },
    TempDirCreated { path: PathBuf },
    CleanupFailed { path: PathBuf, error: String },
    Cancelling,
}

impl InfoEvent {
    /// Render a human-readable message for UI/CLI layers.
    pub fn to_message(&self) -> String {
        match self {
            InfoEvent::Message(msg) => msg.clone(),
            InfoEvent::ScriptSelected { path, is_override } => {
                if *is_override {
                    format!("Using external script {}", path.display())
                } else {
                    format!("Using bundled script {}", path.display())
                }
            }
            InfoEvent::TempDirCreated { path } => {
                format!("Temporary folder: {}", path.display())
            }
            InfoEvent::CleanupFailed { path, error } => {
                format!("Error deleting temporary folder {}: {}", path.display(), error)
            }
            InfoEvent::Cancelling => "Cancelling…".to_string(),
        }
    }
}
