//! One conversion session: `Idle -> Running -> {Completed, Cancelled, Failed}`.
//!
//! The session owns its filter, its process handle and its temp directory.
//! Output chunks arrive on a channel filled by the process pump and are
//! applied by whoever drives [`ConversionSession::next_chunk`] and
//! [`ConversionSession::on_chunk`], so display state is only ever mutated
//! from one task.

use super::post_process::{extract_artifact_path, remove_temp_dir};
use crate::engine::{build_process_spec, OutputChunk, ProcessHandle, ProcessRunner, StreamFilter};
use crate::model::{
    ConversionParams, ConversionResult, ConversionStatus, InfoEvent, ParamsError, RunConfig,
    SessionEvent, SessionState,
};
use crate::resolver::{ResolveError, ScriptChoice, ScriptChooser, ScriptResolver};
use rand::RngCore;
use std::path::Path;
use std::time::Instant;
use tempfile::TempDir;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, warn};

pub const CANCEL_NOTICE: &str = "\n\nCANCELLED by user\n\n";

const TEMP_PREFIX: &str = ".installer2iso-";

#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error("a conversion is already running")]
    Busy,
    #[error(transparent)]
    Params(#[from] ParamsError),
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error("failed to create temporary folder: {0}")]
    TempDir(#[source] std::io::Error),
}

/// Generate a random id for one run.
fn gen_session_id() -> String {
    let mut b = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut b);
    format!("{:016x}", u64::from_le_bytes(b))
}

fn now_rfc3339() -> String {
    time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| "now".into())
}

/// Temp dir next to the output so large intermediates stay on that volume;
/// falls back to the system temp dir.
fn create_temp_dir(output_dir: &Path) -> Result<TempDir, StartError> {
    let mut builder = tempfile::Builder::new();
    builder.prefix(TEMP_PREFIX);
    match builder.tempdir_in(output_dir) {
        Ok(dir) => Ok(dir),
        Err(e) => {
            debug!(dir = %output_dir.display(), error = %e, "temp dir in output folder failed");
            builder.tempdir().map_err(StartError::TempDir)
        }
    }
}

/// Everything that exists only while a run is active.
struct ActiveRun {
    id: String,
    params: ConversionParams,
    script: ScriptChoice,
    handle: ProcessHandle,
    chunks: UnboundedReceiver<OutputChunk>,
    temp_dir: Option<TempDir>,
    started: Instant,
    started_utc: String,
}

pub struct ConversionSession {
    cfg: RunConfig,
    resolver: ScriptResolver,
    runner: ProcessRunner,
    state: SessionState,
    filter: StreamFilter,
    event_tx: UnboundedSender<SessionEvent>,
    run: Option<ActiveRun>,
    last_result: Option<ConversionResult>,
}

impl ConversionSession {
    pub fn new(cfg: RunConfig, event_tx: UnboundedSender<SessionEvent>) -> Self {
        let resolver = ScriptResolver::new(cfg.bundled_dir.clone(), cfg.override_dir.clone());
        let runner = ProcessRunner::new(cfg.kill_grace);
        Self {
            cfg,
            resolver,
            runner,
            state: SessionState::Idle,
            filter: StreamFilter::new(),
            event_tx,
            run: None,
            last_result: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == SessionState::Running
    }

    pub fn display(&self) -> &str {
        self.filter.display()
    }

    pub fn last_result(&self) -> Option<&ConversionResult> {
        self.last_result.as_ref()
    }

    fn emit(&self, ev: SessionEvent) {
        let _ = self.event_tx.send(ev);
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            debug!(from = %self.state, to = %state, "session state");
            self.state = state;
            self.emit(SessionEvent::StateChanged { state });
        }
    }

    /// Send consumers the part of the display that changed.
    fn publish_display(&mut self, chunk: String) {
        if let Some(change) = self.filter.take_change() {
            self.emit(SessionEvent::Output { chunk, change });
        }
    }

    /// Launch a conversion.
    ///
    /// Allowed from `Idle` or any terminal state. Parameter, resolution and
    /// temp-dir failures leave the session where it was; nothing is spawned.
    pub async fn start<C: ScriptChooser>(
        &mut self,
        params: &ConversionParams,
        chooser: &mut C,
    ) -> Result<(), StartError> {
        if self.is_running() {
            return Err(StartError::Busy);
        }
        params.validate()?;
        let script = self
            .resolver
            .resolve(params.mode.script_name(), chooser)
            .await?;
        let temp_dir = create_temp_dir(&params.output_dir)?;

        let spec = build_process_spec(&self.cfg, params, script.path(), temp_dir.path());
        let id = gen_session_id();
        info!(
            session = %id,
            mode = params.mode.label(),
            script = %script.path().display(),
            "starting conversion"
        );
        debug!(session = %id, program = %spec.program.display(), args = ?spec.args, "invocation");

        self.filter.reset();
        self.publish_display(String::new());
        self.emit(SessionEvent::Info(InfoEvent::ScriptSelected {
            path: script.path().to_path_buf(),
            is_override: script.is_override(),
        }));
        self.emit(SessionEvent::Info(InfoEvent::TempDirCreated {
            path: temp_dir.path().to_path_buf(),
        }));

        let (tx, chunks) = mpsc::unbounded_channel();
        let handle = self.runner.start(&spec, tx);
        self.run = Some(ActiveRun {
            id,
            params: params.clone(),
            script,
            handle,
            chunks,
            temp_dir: Some(temp_dir),
            started: Instant::now(),
            started_utc: now_rfc3339(),
        });
        self.set_state(SessionState::Running);
        Ok(())
    }

    /// Next chunk of the active run. Pends forever when nothing is running.
    pub async fn next_chunk(&mut self) -> OutputChunk {
        match self.run.as_mut() {
            Some(run) if self.state == SessionState::Running => {
                run.chunks.recv().await.unwrap_or(OutputChunk::End)
            }
            _ => futures::future::pending().await,
        }
    }

    /// Apply one chunk. Ignored unless `Running`.
    pub async fn on_chunk(&mut self, chunk: OutputChunk) {
        if !self.is_running() {
            return;
        }
        match chunk {
            OutputChunk::Text(text) => {
                if let Some(stripped) = self.filter.feed(&text) {
                    self.publish_display(stripped);
                }
            }
            OutputChunk::End => self.finish().await,
        }
    }

    async fn finish(&mut self) {
        let Some(mut run) = self.run.take() else {
            return;
        };
        run.handle.teardown().await;

        let status = match run.handle.launch_error() {
            Some(err) => {
                warn!(session = %run.id, error = %err, "conversion failed to launch");
                ConversionStatus::FailedToLaunch
            }
            None => ConversionStatus::Succeeded,
        };
        let artifact_path = match status {
            ConversionStatus::Succeeded => extract_artifact_path(&run.params.mode, self.display()),
            _ => String::new(),
        };
        info!(
            session = %run.id,
            program = run.handle.program(),
            pid = ?run.handle.pid(),
            exit_code = ?run.handle.exit_code(),
            artifact = %artifact_path,
            "conversion finished"
        );
        self.conclude(run, status, artifact_path);
    }

    /// Cancel the active run. Returns `false` (and does nothing) unless
    /// `Running`, so repeated calls are harmless.
    pub async fn cancel(&mut self) -> bool {
        if !self.is_running() {
            return false;
        }
        let Some(mut run) = self.run.take() else {
            return false;
        };
        self.emit(SessionEvent::Info(InfoEvent::Cancelling));
        run.handle.cancel().await;
        warn!(session = %run.id, "conversion cancelled by user");

        if self.filter.notice(CANCEL_NOTICE) {
            self.publish_display(CANCEL_NOTICE.to_string());
        }
        self.conclude(run, ConversionStatus::Cancelled, String::new());
        true
    }

    /// Shared terminal transition: temp cleanup, result, events.
    fn conclude(&mut self, mut run: ActiveRun, status: ConversionStatus, artifact_path: String) {
        debug_assert!(run.handle.is_torn_down());
        if let Some(dir) = run.temp_dir.take() {
            if let Some(ev) = remove_temp_dir(dir) {
                self.emit(SessionEvent::Info(ev));
            }
        }

        let result = ConversionResult {
            session_id: run.id,
            started_utc: run.started_utc,
            mode: run.params.mode,
            installer: run.params.installer,
            script: run.script.path().to_path_buf(),
            script_is_override: run.script.is_override(),
            status,
            artifact_path,
            exit_code: run.handle.exit_code(),
            duration_ms: run.started.elapsed().as_millis() as u64,
            display_text: self.filter.display().to_string(),
        };
        self.set_state(status.state());
        self.last_result = Some(result.clone());
        self.emit(SessionEvent::Finished {
            result: Box::new(result),
        });
    }
}
