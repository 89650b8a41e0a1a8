use crate::model::{
    ConversionMode, ConversionParams, ConversionResult, ConversionStatus, RunConfig, SessionEvent,
};
use crate::orchestrator::{
    process_run_completion, run_controller, ControllerOpts, ConversionSession, UiCommand,
};
use crate::resolver::{
    default_override_dir, FixedChooser, ScriptChooser, ScriptDecision, ScriptResolver, APP_DIR,
};
use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

/// Exit status for a cancelled run, as for SIGINT.
pub const EXIT_CANCELLED: i32 = 130;

/// Output line routing for stdout/stderr writer.
enum OutputLine {
    Stdout(String),
    Stderr(String),
    /// Script output, written as-is without adding a newline.
    Raw(String),
}

/// Spawn a blocking writer for stdout/stderr to avoid blocking async tasks.
fn spawn_output_writer() -> (
    mpsc::UnboundedSender<OutputLine>,
    tokio::task::JoinHandle<()>,
) {
    let (tx, mut rx) = mpsc::unbounded_channel::<OutputLine>();
    let handle = tokio::task::spawn_blocking(move || {
        let stdout = std::io::stdout();
        let stderr = std::io::stderr();
        let mut out = std::io::LineWriter::new(stdout.lock());
        let mut err = std::io::LineWriter::new(stderr.lock());

        while let Some(line) = rx.blocking_recv() {
            match line {
                OutputLine::Stdout(msg) => {
                    let _ = writeln!(out, "{}", msg);
                }
                OutputLine::Stderr(msg) => {
                    let _ = writeln!(err, "{}", msg);
                }
                OutputLine::Raw(text) => {
                    let _ = write!(out, "{}", text);
                    let _ = out.flush();
                }
            }
        }

        let _ = out.flush();
        let _ = err.flush();
    });
    (tx, handle)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ModeArg {
    Iso,
    Vdi,
}

/// Answer for the "external script exists" question.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ScriptChoiceArg {
    /// Ask every time
    Ask,
    Bundled,
    Override,
}

#[derive(Debug, Parser, Clone)]
#[command(
    name = "installer2iso",
    version,
    about = "Convert a macOS installer application into a bootable ISO or VDI image"
)]
pub struct Cli {
    /// Path to the macOS installer application (e.g. "/Applications/Install macOS Mojave.app")
    #[arg(required_unless_present_any = ["history", "export_script"])]
    pub installer: Option<PathBuf>,

    /// Directory receiving the image (default: desktop, else current directory)
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Image type to produce
    #[arg(long, value_enum, default_value_t = ModeArg::Iso)]
    pub mode: ModeArg,

    /// VDI disk name (default: installer name)
    #[arg(long)]
    pub name: Option<String>,

    /// VDI disk size in GB (15 to 100000)
    #[arg(long, default_value_t = 32.0)]
    pub size: f64,

    /// Script verbosity level (0 to 3)
    #[arg(short, long, default_value_t = 1)]
    pub verbosity: u8,

    /// Ask the script to report what it would do without doing it
    #[arg(long)]
    pub dry_run: bool,

    /// Shell used to run the conversion script
    #[arg(long, default_value = "/bin/bash")]
    pub shell: PathBuf,

    /// Directory holding the bundled conversion scripts
    #[arg(long)]
    pub scripts_dir: Option<PathBuf>,

    /// Directory searched for user-modified scripts
    #[arg(long)]
    pub override_dir: Option<PathBuf>,

    /// Helper binary passed to the script for privileged operations
    #[arg(long)]
    pub privileged_helper: Option<PathBuf>,

    /// Extra argument appended to the script invocation (repeatable)
    #[arg(long = "script-arg", allow_hyphen_values = true)]
    pub script_args: Vec<String>,

    /// Extra environment variable for the script, as KEY=VALUE (repeatable)
    #[arg(long = "env", value_name = "KEY=VALUE", value_parser = parse_env_pair)]
    pub env: Vec<(String, String)>,

    /// Wait between SIGTERM and SIGKILL when stopping the script
    #[arg(long, default_value = "3s")]
    pub kill_grace: humantime::Duration,

    /// What to do when an external script exists
    #[arg(long, value_enum, default_value_t = ScriptChoiceArg::Ask)]
    pub script_choice: ScriptChoiceArg,

    /// Print the result as JSON and exit (no TUI)
    #[arg(long, conflicts_with = "text")]
    pub json: bool,

    /// Stream script output to the terminal and exit (no TUI)
    #[arg(long)]
    pub text: bool,

    /// Verbose logging
    #[arg(long)]
    pub debug: bool,

    /// Write logs to this file (the only log sink in TUI mode)
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// Use --auto-save true or --auto-save false to override
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub auto_save: bool,

    /// Copy the bundled script for --mode to the override directory and exit
    #[arg(long)]
    pub export_script: bool,

    /// Overwrite an existing override with --export-script
    #[arg(long, requires = "export_script")]
    pub force: bool,

    /// Print the last N conversions and exit
    #[arg(long, value_name = "N")]
    pub history: Option<usize>,

    /// Start converting as soon as the TUI opens
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub start_on_launch: bool,
}

impl Cli {
    /// Whether this invocation ends up in the interactive TUI.
    pub fn is_tui(&self) -> bool {
        cfg!(feature = "tui")
            && !self.json
            && !self.text
            && self.history.is_none()
            && !self.export_script
    }
}

/// Returns the process exit code for the run.
pub async fn run(args: Cli) -> Result<i32> {
    if let Some(limit) = args.history {
        print_history(&args, limit)?;
        return Ok(0);
    }
    if args.export_script {
        export_script(&args)?;
        return Ok(0);
    }

    let params = build_params(&args)?;
    if !crate::installer::is_valid_installer(&params.installer) {
        anyhow::bail!(
            "{} is not a macOS installer application",
            params.installer.display()
        );
    }

    if !args.json && !args.text {
        #[cfg(feature = "tui")]
        {
            return crate::tui::run(args, params).await;
        }
        #[cfg(not(feature = "tui"))]
        {
            // Fallback when built without TUI support.
            return run_headless(args, params, false).await;
        }
    }

    let json = args.json;
    run_headless(args, params, json).await
}

fn exe_dir() -> Option<PathBuf> {
    let exe = std::env::current_exe().ok()?;
    exe.parent().map(Path::to_path_buf)
}

/// `scripts/` beside the executable, then `../share/installer2iso/scripts`.
fn default_scripts_dir() -> PathBuf {
    if let Some(dir) = exe_dir() {
        let beside = dir.join("scripts");
        if beside.is_dir() {
            return beside;
        }
        let shared = dir.join("..").join("share").join(APP_DIR).join("scripts");
        if shared.is_dir() {
            return shared;
        }
    }
    PathBuf::from("scripts")
}

fn default_privileged_helper() -> Option<PathBuf> {
    exe_dir()
        .map(|d| d.join("privileged"))
        .filter(|p| p.is_file())
}

fn default_output_dir() -> PathBuf {
    dirs::desktop_dir()
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Build a `RunConfig` from CLI arguments.
pub fn build_config(args: &Cli) -> RunConfig {
    RunConfig {
        shell: args.shell.clone(),
        bundled_dir: args.scripts_dir.clone().unwrap_or_else(default_scripts_dir),
        override_dir: args.override_dir.clone().or_else(default_override_dir),
        privileged_helper: args
            .privileged_helper
            .clone()
            .or_else(default_privileged_helper),
        kill_grace: Duration::from(args.kill_grace),
        extra_env: args.env.iter().cloned().collect(),
        ..RunConfig::default()
    }
}

fn parse_env_pair(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got `{s}`")),
    }
}

fn build_mode(args: &Cli, installer: Option<&Path>) -> ConversionMode {
    match args.mode {
        ModeArg::Iso => ConversionMode::Iso,
        ModeArg::Vdi => {
            let name = args.name.clone().unwrap_or_else(|| {
                installer
                    .and_then(Path::file_stem)
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_default()
            });
            ConversionMode::Vdi {
                name,
                size_gb: args.size,
            }
        }
    }
}

/// Build the per-run parameters from CLI arguments.
pub fn build_params(args: &Cli) -> Result<ConversionParams> {
    let installer = args.installer.clone().context("no installer given")?;
    let params = ConversionParams {
        mode: build_mode(args, Some(&installer)),
        output_dir: args.output.clone().unwrap_or_else(default_output_dir),
        installer,
        verbosity: args.verbosity,
        dry_run: args.dry_run,
        extra_args: args.script_args.clone(),
    };
    params.validate()?;
    Ok(params)
}

fn print_history(args: &Cli, limit: usize) -> Result<()> {
    let runs = crate::storage::load_recent(limit).context("failed to load history")?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&runs)?);
        return Ok(());
    }
    if runs.is_empty() {
        eprintln!("No stored conversions");
    }
    for r in &runs {
        println!("{}", crate::text_summary::history_line(r));
    }
    Ok(())
}

fn export_script(args: &Cli) -> Result<()> {
    let cfg = build_config(args);
    let resolver = ScriptResolver::new(cfg.bundled_dir, cfg.override_dir);
    let name = build_mode(args, None).script_name();
    let path = resolver.export_bundled(name, args.force)?;
    println!("Exported {name} to {}", path.display());
    Ok(())
}

fn parse_decision(answer: &str) -> ScriptDecision {
    match answer.trim().to_ascii_lowercase().as_str() {
        "" | "y" | "yes" => ScriptDecision::UseOverride,
        "n" | "no" => ScriptDecision::UseBundled,
        _ => ScriptDecision::Cancel,
    }
}

/// Ask on the terminal. End of input cancels.
async fn prompt_on_terminal(name: &str, override_path: &Path) -> ScriptDecision {
    let question = format!(
        "An external version of {name} exists at {}.\nUse the external script? [Y]es / [n]o, use bundled / [c]ancel: ",
        override_path.display()
    );
    let answer = tokio::task::spawn_blocking(move || {
        let mut err = std::io::stderr();
        let _ = write!(err, "{question}");
        let _ = err.flush();
        let mut line = String::new();
        match std::io::stdin().read_line(&mut line) {
            Ok(0) | Err(_) => None,
            Ok(_) => Some(line),
        }
    })
    .await;
    match answer {
        Ok(Some(line)) => parse_decision(&line),
        _ => ScriptDecision::Cancel,
    }
}

/// Chooser for the headless modes, picked by `--script-choice`.
enum CliChooser {
    Fixed(FixedChooser),
    Terminal,
}

impl CliChooser {
    fn from_arg(arg: ScriptChoiceArg) -> Self {
        match arg {
            ScriptChoiceArg::Ask => CliChooser::Terminal,
            ScriptChoiceArg::Bundled => CliChooser::Fixed(FixedChooser(ScriptDecision::UseBundled)),
            ScriptChoiceArg::Override => {
                CliChooser::Fixed(FixedChooser(ScriptDecision::UseOverride))
            }
        }
    }
}

impl ScriptChooser for CliChooser {
    async fn choose(&mut self, name: &str, bundled: &Path, override_path: &Path) -> ScriptDecision {
        match self {
            CliChooser::Fixed(c) => c.choose(name, bundled, override_path).await,
            CliChooser::Terminal => prompt_on_terminal(name, override_path).await,
        }
    }
}

/// Map a finished run to the process exit code.
pub fn exit_code_for(result: &ConversionResult) -> i32 {
    match result.status {
        ConversionStatus::Succeeded => 0,
        ConversionStatus::Cancelled => EXIT_CANCELLED,
        ConversionStatus::FailedToLaunch => 1,
    }
}

/// Text and JSON modes: run once, stream or collect output, print the result.
async fn run_headless(args: Cli, params: ConversionParams, json: bool) -> Result<i32> {
    let cfg = build_config(&args);
    debug!(config = %serde_json::to_string(&cfg).unwrap_or_default(), "run config");

    let (out_tx, out_handle) = spawn_output_writer();
    let (evt_tx, mut evt_rx) = mpsc::unbounded_channel::<SessionEvent>();
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<UiCommand>();

    let printer_tx = out_tx.clone();
    let printer = tokio::spawn(async move {
        while let Some(ev) = evt_rx.recv().await {
            match ev {
                SessionEvent::Output { chunk, .. } => {
                    if !json && !chunk.is_empty() {
                        let _ = printer_tx.send(OutputLine::Raw(chunk));
                    }
                }
                SessionEvent::Info(info) => {
                    let _ = printer_tx.send(OutputLine::Stderr(info.to_message()));
                }
                SessionEvent::StateChanged { state } => debug!(%state, "state changed"),
                SessionEvent::Finished { .. } => {}
            }
        }
    });

    // Ctrl-C cancels the run; the controller returns once it is torn down.
    // A second Ctrl-C (e.g. while a terminal prompt blocks) exits at once.
    let ctrl_tx = cmd_tx.clone();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = ctrl_tx.send(UiCommand::Cancel);
        }
        if tokio::signal::ctrl_c().await.is_ok() {
            std::process::exit(EXIT_CANCELLED);
        }
    });

    let session = ConversionSession::new(cfg, evt_tx.clone());
    let mut chooser = CliChooser::from_arg(args.script_choice);
    let opts = ControllerOpts {
        start_on_launch: true,
        exit_when_finished: true,
    };
    let outcome = run_controller(session, params, &mut chooser, evt_tx, cmd_rx, opts).await;
    ctrl_c.abort();
    drop(cmd_tx);
    let _ = printer.await;

    let code = match outcome {
        Ok(Some(result)) => {
            let processed = process_run_completion(args.auto_save, &result);
            if json {
                let _ = out_tx.send(OutputLine::Stdout(serde_json::to_string_pretty(&result)?));
            } else {
                if !result.display_text.is_empty() && !result.display_text.ends_with('\n') {
                    let _ = out_tx.send(OutputLine::Raw("\n".into()));
                }
                let _ = out_tx.send(OutputLine::Stdout(String::new()));
                for line in crate::text_summary::build_text_summary(&result).lines {
                    let _ = out_tx.send(OutputLine::Stdout(line));
                }
            }
            if let Some(p) = processed.auto_saved_path {
                let _ = out_tx.send(OutputLine::Stderr(format!("Saved: {}", p.display())));
            }
            if let Some(e) = processed.save_error {
                let _ = out_tx.send(OutputLine::Stderr(format!("Save failed: {e}")));
            }
            exit_code_for(&result)
        }
        Ok(None) => {
            let _ = out_tx.send(OutputLine::Stderr("No conversion was run".into()));
            1
        }
        Err(e) => {
            drop(out_tx);
            let _ = out_handle.await;
            return Err(e).context("could not start the conversion");
        }
    };

    drop(out_tx);
    let _ = out_handle.await;
    Ok(code)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(argv: &[&str]) -> Cli {
        Cli::try_parse_from(argv).unwrap()
    }

    #[test]
    fn vdi_params_default_name_from_installer() {
        let args = parse(&[
            "installer2iso",
            "/Applications/Install macOS Mojave.app",
            "-o",
            "/tmp/out",
            "--mode",
            "vdi",
            "--size",
            "40",
        ]);
        let p = build_params(&args).unwrap();
        assert_eq!(
            p.mode,
            ConversionMode::Vdi {
                name: "Install macOS Mojave".into(),
                size_gb: 40.0
            }
        );
        assert_eq!(p.output_dir, PathBuf::from("/tmp/out"));
    }

    #[test]
    fn out_of_range_size_is_rejected() {
        let args = parse(&["installer2iso", "/x.app", "-o", "/o", "--mode", "vdi", "--size", "10"]);
        assert!(build_params(&args).is_err());
    }

    #[test]
    fn script_args_keep_order_and_hyphens() {
        let args = parse(&[
            "installer2iso",
            "/x.app",
            "--script-arg",
            "-k",
            "--script-arg",
            "value",
        ]);
        assert_eq!(args.script_args, vec!["-k".to_string(), "value".to_string()]);
        let cfg = build_config(&args);
        assert_eq!(cfg.kill_grace, Duration::from_secs(3));
        assert_eq!(cfg.shell, PathBuf::from("/bin/bash"));
    }

    #[test]
    fn env_pairs_reach_the_run_config() {
        let args = parse(&[
            "installer2iso",
            "/x.app",
            "--env",
            "LANG=C",
            "--env",
            "EXTRA=a=b",
        ]);
        let cfg = build_config(&args);
        assert_eq!(cfg.extra_env.get("LANG").map(String::as_str), Some("C"));
        assert_eq!(cfg.extra_env.get("EXTRA").map(String::as_str), Some("a=b"));
        assert!(Cli::try_parse_from(["installer2iso", "/x.app", "--env", "=x"]).is_err());
        assert!(Cli::try_parse_from(["installer2iso", "/x.app", "--env", "NOVALUE"]).is_err());
    }

    #[test]
    fn installer_optional_only_for_side_commands() {
        assert!(Cli::try_parse_from(["installer2iso"]).is_err());
        assert!(Cli::try_parse_from(["installer2iso", "--history", "5"]).is_ok());
        assert!(Cli::try_parse_from(["installer2iso", "--export-script", "--force"]).is_ok());
        assert!(Cli::try_parse_from(["installer2iso", "/x.app", "--json", "--text"]).is_err());
    }

    #[test]
    fn prompt_answers() {
        assert_eq!(parse_decision("\n"), ScriptDecision::UseOverride);
        assert_eq!(parse_decision("Yes\n"), ScriptDecision::UseOverride);
        assert_eq!(parse_decision("n"), ScriptDecision::UseBundled);
        assert_eq!(parse_decision("c"), ScriptDecision::Cancel);
        assert_eq!(parse_decision("maybe"), ScriptDecision::Cancel);
    }
}
