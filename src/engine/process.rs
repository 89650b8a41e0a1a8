//! Child process supervision.
//!
//! [`ProcessRunner::start`] spawns the child with stdout and stderr piped and
//! hands both to a pump task. The pump forwards decoded text to the caller's
//! channel as soon as each read returns and always finishes with exactly one
//! [`OutputChunk::End`]. [`ProcessHandle`] owns the child, its stdin pipe and
//! the pump; its teardown runs at most once however many times it is called.

use super::command::ProcessSpec;
use bytes::BytesMut;
use std::io;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const READ_CHUNK: usize = 8 * 1024;
/// Interval between liveness checks of a terminated process group.
#[cfg(unix)]
const GROUP_POLL: Duration = Duration::from_millis(25);

/// One delivery from the merged output stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputChunk {
    Text(String),
    End,
}

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
}

/// Incremental UTF-8 decoding that tolerates characters split across reads.
#[derive(Debug, Default)]
struct Utf8Decoder {
    carry: Vec<u8>,
}

impl Utf8Decoder {
    /// Decode `bytes` after any carried partial character.
    /// Returns `None` for bytes that can never become valid UTF-8.
    fn decode(&mut self, bytes: &[u8]) -> Option<String> {
        let mut buf = std::mem::take(&mut self.carry);
        buf.extend_from_slice(bytes);
        let checked = std::str::from_utf8(&buf)
            .map(|_| ())
            .map_err(|e| (e.valid_up_to(), e.error_len()));
        match checked {
            Ok(()) => String::from_utf8(buf).ok(),
            // incomplete character at the end, keep it for the next read
            Err((valid, None)) => {
                self.carry = buf.split_off(valid);
                String::from_utf8(buf).ok()
            }
            Err((_, Some(_))) => None,
        }
    }
}

enum ReadStep {
    Continue,
    Closed,
    Stop,
}

async fn read_some<R>(reader: &mut Option<R>, buf: &mut BytesMut) -> io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    match reader {
        Some(r) => {
            buf.clear();
            r.read_buf(buf).await
        }
        None => futures::future::pending().await,
    }
}

fn forward(
    res: io::Result<usize>,
    buf: &BytesMut,
    decoder: &mut Utf8Decoder,
    tx: &mpsc::UnboundedSender<OutputChunk>,
    stream: &'static str,
) -> ReadStep {
    match res {
        Ok(0) => ReadStep::Closed,
        Ok(_) => match decoder.decode(&buf[..]) {
            Some(text) => {
                if !text.is_empty() {
                    let _ = tx.send(OutputChunk::Text(text));
                }
                ReadStep::Continue
            }
            None => {
                warn!(stream, "undecodable output, treating as end of stream");
                ReadStep::Stop
            }
        },
        Err(e) => {
            debug!(stream, error = %e, "read failed");
            ReadStep::Closed
        }
    }
}

/// Merge stdout and stderr into `tx` until both close, output stops
/// decoding, or the handle detaches. Sends `End` exactly once on exit.
async fn pump<O, E>(
    mut stdout: Option<O>,
    mut stderr: Option<E>,
    tx: mpsc::UnboundedSender<OutputChunk>,
    mut detach: oneshot::Receiver<()>,
) where
    O: AsyncRead + Unpin,
    E: AsyncRead + Unpin,
{
    let mut out_buf = BytesMut::with_capacity(READ_CHUNK);
    let mut err_buf = BytesMut::with_capacity(READ_CHUNK);
    let mut out_dec = Utf8Decoder::default();
    let mut err_dec = Utf8Decoder::default();

    while stdout.is_some() || stderr.is_some() {
        tokio::select! {
            _ = &mut detach => {
                debug!("output handlers detached");
                break;
            }
            res = read_some(&mut stdout, &mut out_buf) => {
                match forward(res, &out_buf, &mut out_dec, &tx, "stdout") {
                    ReadStep::Continue => {}
                    ReadStep::Closed => stdout = None,
                    ReadStep::Stop => break,
                }
            }
            res = read_some(&mut stderr, &mut err_buf) => {
                match forward(res, &err_buf, &mut err_dec, &tx, "stderr") {
                    ReadStep::Continue => {}
                    ReadStep::Closed => stderr = None,
                    ReadStep::Stop => break,
                }
            }
        }
    }

    let _ = tx.send(OutputChunk::End);
}

#[cfg(unix)]
fn signal_group(pgid: u32, signal: Option<nix::sys::signal::Signal>) -> bool {
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pgid) else {
        return false;
    };
    match killpg(Pid::from_raw(raw), signal) {
        Ok(()) => true,
        Err(e) => {
            if signal.is_some() {
                debug!(pgid, ?signal, error = %e, "killpg failed");
            }
            false
        }
    }
}

/// Ask the script and its descendants to exit.
///
/// The group is signalled whatever the leader's status: the shell may be gone
/// while a background child still holds the output pipes.
#[cfg(unix)]
fn request_terminate(pgid: Option<u32>, child: Option<&mut Child>) {
    match pgid {
        Some(pgid) => {
            debug!(pgid, "sending SIGTERM to process group");
            signal_group(pgid, Some(nix::sys::signal::Signal::SIGTERM));
        }
        None => {
            if let Some(child) = child {
                let _ = child.start_kill();
            }
        }
    }
}

#[cfg(not(unix))]
fn request_terminate(_pgid: Option<u32>, child: Option<&mut Child>) {
    if let Some(child) = child {
        let _ = child.start_kill();
    }
}

fn force_kill(pgid: Option<u32>, child: Option<&mut Child>) {
    #[cfg(unix)]
    {
        if let Some(pgid) = pgid {
            debug!(pgid, "sending SIGKILL to process group");
            signal_group(pgid, Some(nix::sys::signal::Signal::SIGKILL));
        }
    }
    #[cfg(not(unix))]
    let _ = pgid;
    if let Some(child) = child {
        let _ = child.start_kill();
    }
}

/// Wait for every member of `pgid` to exit, killing the group once `grace`
/// runs out.
#[cfg(unix)]
async fn drain_group(pgid: u32, grace: Duration) {
    let deadline = tokio::time::Instant::now() + grace;
    while signal_group(pgid, None) {
        if tokio::time::Instant::now() >= deadline {
            warn!(pgid, ?grace, "process group outlived grace period, killing");
            signal_group(pgid, Some(nix::sys::signal::Signal::SIGKILL));
            return;
        }
        tokio::time::sleep(GROUP_POLL).await;
    }
}

#[cfg(not(unix))]
async fn drain_group(_pgid: u32, _grace: Duration) {}

/// Wait for exit, killing the child if it outlives `grace`.
async fn reap(child: &mut Child, pgid: Option<u32>, grace: Duration) -> Option<i32> {
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => return status.code(),
        Ok(Err(e)) => {
            warn!(error = %e, "waiting for child failed");
            return None;
        }
        Err(_) => {
            warn!(?grace, "child still running after grace period, killing");
        }
    }
    force_kill(pgid, Some(&mut *child));
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => status.code(),
        Ok(Err(e)) => {
            warn!(error = %e, "waiting for killed child failed");
            None
        }
        Err(_) => {
            warn!("child did not exit after SIGKILL");
            None
        }
    }
}

/// A launched (or failed-to-launch) child process.
pub struct ProcessHandle {
    program: String,
    pid: Option<u32>,
    /// Process group of the script; the leader's pid on Unix.
    pgid: Option<u32>,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    detach: Option<oneshot::Sender<()>>,
    pump: Option<JoinHandle<()>>,
    launch_error: Option<LaunchError>,
    exit_code: Option<i32>,
    terminate_requested: bool,
    torn_down: bool,
    grace: Duration,
}

impl ProcessHandle {
    fn failed(program: String, err: LaunchError) -> Self {
        Self {
            program,
            pid: None,
            pgid: None,
            child: None,
            stdin: None,
            detach: None,
            pump: None,
            launch_error: Some(err),
            exit_code: None,
            terminate_requested: false,
            torn_down: true,
            grace: Duration::ZERO,
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn launch_error(&self) -> Option<&LaunchError> {
        self.launch_error.as_ref()
    }

    /// Exit code once torn down; `None` while running, on signal death, or if
    /// the launch failed.
    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down
    }

    /// Terminate the child and its process group, then tear down.
    /// Returns `false` if teardown already happened.
    pub async fn cancel(&mut self) -> bool {
        if self.torn_down {
            return false;
        }
        self.terminate_requested = true;
        request_terminate(self.pgid, self.child.as_mut());
        self.teardown().await
    }

    /// Detach the output pump, close stdin and reap the child.
    /// Returns `false` if teardown already happened.
    pub async fn teardown(&mut self) -> bool {
        if self.torn_down {
            return false;
        }
        self.torn_down = true;

        if let Some(detach) = self.detach.take() {
            let _ = detach.send(());
        }
        drop(self.stdin.take());

        if let Some(mut child) = self.child.take() {
            self.exit_code = reap(&mut child, self.pgid, self.grace).await;
        }
        if self.terminate_requested {
            if let Some(pgid) = self.pgid {
                drain_group(pgid, self.grace).await;
            }
        }
        if let Some(pump) = self.pump.take() {
            if let Err(e) = pump.await {
                warn!(error = %e, "output pump task failed");
            }
        }
        debug!(program = %self.program, exit_code = ?self.exit_code, "process torn down");
        true
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if self.torn_down {
            return;
        }
        force_kill(self.pgid, self.child.as_mut());
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

/// Launches child processes with merged, streamed output.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    grace: Duration,
}

impl ProcessRunner {
    /// `grace` bounds every wait during teardown before escalating to SIGKILL.
    pub fn new(grace: Duration) -> Self {
        Self { grace }
    }

    /// Spawn `spec` and stream its output into `tx`.
    ///
    /// Always returns a handle. When the launch fails, `tx` receives one
    /// message chunk followed by `End` and the handle is already torn down.
    /// Must be called from within a Tokio runtime.
    pub fn start(
        &self,
        spec: &ProcessSpec,
        tx: mpsc::UnboundedSender<OutputChunk>,
    ) -> ProcessHandle {
        let program = spec.program.display().to_string();

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group so termination reaches the script's children too.
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(source) => {
                let err = LaunchError::Spawn {
                    program: program.clone(),
                    source,
                };
                warn!(error = %err, "launch failed");
                let _ = tx.send(OutputChunk::Text(format!("{err}\n")));
                let _ = tx.send(OutputChunk::End);
                return ProcessHandle::failed(program, err);
            }
        };

        let pid = child.id();
        // process_group(0) makes the child its own group leader.
        let pgid = if cfg!(unix) { pid } else { None };
        info!(%program, pid = ?pid, "process started");

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (detach_tx, detach_rx) = oneshot::channel();
        let pump = tokio::spawn(pump(stdout, stderr, tx, detach_rx));

        ProcessHandle {
            program,
            pid,
            pgid,
            child: Some(child),
            stdin,
            detach: Some(detach_tx),
            pump: Some(pump),
            launch_error: None,
            exit_code: None,
            terminate_requested: false,
            torn_down: false,
            grace: self.grace,
        }
    }
}
