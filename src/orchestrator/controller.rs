//! Run lifecycle controller.
//!
//! Owns start/cancel/quit orchestration for one [`ConversionSession`] and
//! feeds output chunks into it. Presentation layers talk to it through
//! [`UiCommand`] and listen on the session's event channel.

use super::session::{ConversionSession, StartError};
use crate::model::{ConversionParams, ConversionResult, InfoEvent, SessionEvent};
use crate::resolver::ScriptChooser;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tracing::debug;

/// Commands emitted by UI layers to control the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UiCommand {
    /// Start a run, or restart after a terminal state.
    Start,
    Cancel,
    Quit,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct ControllerOpts {
    pub start_on_launch: bool,
    /// Return as soon as the session reaches a terminal state (text/JSON).
    pub exit_when_finished: bool,
}

async fn start_run<C: ScriptChooser>(
    session: &mut ConversionSession,
    params: &ConversionParams,
    chooser: &mut C,
    event_tx: &UnboundedSender<SessionEvent>,
) -> Result<(), StartError> {
    let res = session.start(params, chooser).await;
    if let Err(e) = &res {
        let _ = event_tx.send(SessionEvent::Info(InfoEvent::Message(format!(
            "Cannot start: {e}"
        ))));
    }
    res
}

/// Drive `session` from UI commands until quit (or, with
/// `exit_when_finished`, until the run ends). Returns the last result.
///
/// A failure of the launch-time start is returned only when
/// `exit_when_finished` is set; otherwise it is reported as an info event.
pub(crate) async fn run_controller<C: ScriptChooser>(
    mut session: ConversionSession,
    params: ConversionParams,
    chooser: &mut C,
    event_tx: UnboundedSender<SessionEvent>,
    mut cmd_rx: UnboundedReceiver<UiCommand>,
    opts: ControllerOpts,
) -> Result<Option<ConversionResult>, StartError> {
    if opts.start_on_launch {
        let res = start_run(&mut session, &params, chooser, &event_tx).await;
        if opts.exit_when_finished {
            res?;
        }
    }

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                debug!(?cmd, state = %session.state(), "ui command");
                match cmd {
                    Some(UiCommand::Start) => {
                        // Busy sessions reject the start themselves.
                        let _ = start_run(&mut session, &params, chooser, &event_tx).await;
                    }
                    Some(UiCommand::Cancel) => {
                        session.cancel().await;
                        if opts.exit_when_finished && session.state().is_terminal() {
                            break;
                        }
                    }
                    Some(UiCommand::Quit) | None => {
                        session.cancel().await;
                        break;
                    }
                }
            }
            chunk = session.next_chunk() => {
                session.on_chunk(chunk).await;
                if opts.exit_when_finished && session.state().is_terminal() {
                    break;
                }
            }
        }
    }

    Ok(session.last_result().cloned())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::model::{ConversionMode, ConversionStatus, RunConfig, SessionState};
    use crate::resolver::{FixedChooser, ScriptDecision};
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn setup(body: &str) -> (tempfile::TempDir, RunConfig, ConversionParams) {
        let root = tempfile::tempdir().unwrap();
        let scripts = root.path().join("scripts");
        std::fs::create_dir_all(&scripts).unwrap();
        let script = scripts.join("InstallerApp2ISO.sh");
        std::fs::write(&script, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        let cfg = RunConfig {
            shell: PathBuf::from("/bin/sh"),
            bundled_dir: scripts,
            override_dir: None,
            kill_grace: Duration::from_millis(500),
            ..RunConfig::default()
        };
        let params = ConversionParams {
            mode: ConversionMode::Iso,
            installer: PathBuf::from("/Applications/Install macOS.app"),
            output_dir: root.path().to_path_buf(),
            verbosity: 1,
            dry_run: false,
            extra_args: Vec::new(),
        };
        (root, cfg, params)
    }

    #[tokio::test]
    async fn exits_when_run_finishes() {
        let (_root, cfg, params) = setup("echo 'copy --> /out/x.iso'");
        let (evt_tx, mut evt_rx) = mpsc::unbounded_channel();
        let (_cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let session = ConversionSession::new(cfg, evt_tx.clone());
        let opts = ControllerOpts {
            start_on_launch: true,
            exit_when_finished: true,
        };
        let mut chooser = FixedChooser(ScriptDecision::UseBundled);
        let result = run_controller(session, params, &mut chooser, evt_tx, cmd_rx, opts)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.status, ConversionStatus::Succeeded);
        assert_eq!(result.artifact_path, "/out/x.iso");

        let mut states = Vec::new();
        while let Ok(ev) = evt_rx.try_recv() {
            if let SessionEvent::StateChanged { state } = ev {
                states.push(state);
            }
        }
        assert_eq!(states, vec![SessionState::Running, SessionState::Completed]);
    }

    #[tokio::test]
    async fn cancel_command_stops_long_run() {
        let (_root, cfg, params) = setup("sleep 30");
        let (evt_tx, _evt_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let session = ConversionSession::new(cfg, evt_tx.clone());
        let opts = ControllerOpts {
            start_on_launch: true,
            exit_when_finished: true,
        };
        cmd_tx.send(UiCommand::Cancel).unwrap();
        let mut chooser = FixedChooser(ScriptDecision::UseBundled);
        let result = tokio::time::timeout(
            Duration::from_secs(10),
            run_controller(session, params, &mut chooser, evt_tx, cmd_rx, opts),
        )
        .await
        .unwrap()
        .unwrap()
        .unwrap();
        assert_eq!(result.status, ConversionStatus::Cancelled);
    }

    #[tokio::test]
    async fn launch_start_failure_is_returned_in_headless_mode() {
        let (_root, mut cfg, params) = setup("true");
        cfg.bundled_dir = PathBuf::from("/nonexistent/scripts");
        let (evt_tx, _evt_rx) = mpsc::unbounded_channel();
        let (_cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let session = ConversionSession::new(cfg, evt_tx.clone());
        let opts = ControllerOpts {
            start_on_launch: true,
            exit_when_finished: true,
        };
        let mut chooser = FixedChooser(ScriptDecision::UseBundled);
        let err = run_controller(session, params, &mut chooser, evt_tx, cmd_rx, opts)
            .await
            .unwrap_err();
        assert!(matches!(err, StartError::Resolve(_)));
    }

    #[tokio::test]
    async fn quit_without_run_returns_nothing() {
        let (_root, cfg, params) = setup("true");
        let (evt_tx, _evt_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let session = ConversionSession::new(cfg, evt_tx.clone());
        let opts = ControllerOpts {
            start_on_launch: false,
            exit_when_finished: false,
        };
        cmd_tx.send(UiCommand::Quit).unwrap();
        let mut chooser = FixedChooser(ScriptDecision::UseBundled);
        let result = run_controller(session, params, &mut chooser, evt_tx, cmd_rx, opts)
            .await
            .unwrap();
        assert!(result.is_none());
    }
}
