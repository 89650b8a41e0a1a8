mod help;
mod prompt;
mod state;

use crate::cli::{build_config, Cli};
use crate::model::{ConversionParams, ConversionResult, SessionEvent, SessionState};
use crate::orchestrator::{self, ControllerOpts, ConversionSession, UiCommand};
use crate::resolver::ScriptDecision;
use anyhow::{Context, Result};
use crossterm::{
    event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use prompt::{draw_prompt, PromptRequest, UiChooser};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Paragraph, Tabs},
    Terminal,
};
use state::{apply_event, session_style, UiState};
use std::path::PathBuf;
use std::{io, time::Duration, time::Instant};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// Rows around the output text: tabs, status block and the output borders.
const OUTPUT_CHROME: u16 = 3 + 6 + 2;
const HISTORY_LOAD: usize = 100;

/// Fixed facts the UI thread needs about this invocation.
struct UiContext {
    title: String,
    output_dir: PathBuf,
    auto_save: bool,
}

pub async fn run(args: Cli, params: ConversionParams) -> Result<i32> {
    // Unbounded channels avoid backpressure and task switching in the hot path.
    let (event_tx, event_rx) = mpsc::unbounded_channel::<SessionEvent>();
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<UiCommand>();
    let (prompt_tx, prompt_rx) = mpsc::unbounded_channel::<PromptRequest>();

    let ctx = UiContext {
        title: format!(
            "installer2iso: {} → {}",
            crate::installer::display_name(&params.installer),
            params.mode.label()
        ),
        output_dir: params.output_dir.clone(),
        auto_save: args.auto_save,
    };

    // TUI runs in a dedicated thread to keep all blocking I/O out of the Tokio runtime.
    let ui_handle = std::thread::spawn(move || run_threaded(ctx, event_rx, prompt_rx, cmd_tx));

    let session = ConversionSession::new(build_config(&args), event_tx.clone());
    let mut chooser = UiChooser::new(prompt_tx);
    let opts = ControllerOpts {
        start_on_launch: args.start_on_launch,
        exit_when_finished: false,
    };
    let res =
        orchestrator::run_controller(session, params, &mut chooser, event_tx, cmd_rx, opts).await;

    let join_res = tokio::task::spawn_blocking(move || ui_handle.join()).await;
    if let Ok(joined) = join_res {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(anyhow::anyhow!("TUI thread panicked")),
        }
    }

    res.context("conversion controller failed")?;
    Ok(0)
}

/// Run the TUI loop on a dedicated thread.
fn run_threaded(
    ctx: UiContext,
    mut event_rx: UnboundedReceiver<SessionEvent>,
    mut prompt_rx: UnboundedReceiver<PromptRequest>,
    cmd_tx: UnboundedSender<UiCommand>,
) -> Result<()> {
    enable_raw_mode().context("enable raw mode")?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen).ok();

    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend).context("create terminal")?;
    terminal.clear().ok();

    // UiState is owned by the UI thread only; no cross-thread mutation.
    let mut state = UiState {
        auto_save: ctx.auto_save,
        history: crate::storage::load_recent(HISTORY_LOAD).unwrap_or_default(),
        ..Default::default()
    };

    let tick_rate = Duration::from_millis(100);
    let mut last_tick = Instant::now();

    let res = loop {
        // Drain events without blocking to keep UI responsive.
        while let Ok(ev) = event_rx.try_recv() {
            match ev {
                SessionEvent::Finished { result } => {
                    handle_run_completed(&mut state, *result);
                }
                other => apply_event(&mut state, other),
            }
        }
        while let Ok(req) = prompt_rx.try_recv() {
            if let Some(stale) = state.prompt.replace(req) {
                stale.answer(ScriptDecision::Cancel);
            }
        }

        if last_tick.elapsed() >= tick_rate {
            terminal.draw(|f| draw(f.area(), f, &state, &ctx)).ok();
            last_tick = Instant::now();
        }

        let view_height = terminal
            .size()
            .map(|size| size.height.saturating_sub(OUTPUT_CHROME) as usize)
            .unwrap_or(20)
            .max(1);

        // Poll input with a short timeout to avoid blocking the render loop.
        if event::poll(Duration::from_millis(10)).unwrap_or(false) {
            if let Ok(Event::Key(k)) = event::read() {
                if k.kind != KeyEventKind::Press {
                    continue;
                }
                if let Some(req) = state.prompt.take() {
                    if handle_prompt_key(&mut state, req, k) {
                        let _ = cmd_tx.send(UiCommand::Quit);
                        break Ok(());
                    }
                    continue;
                }
                match (k.modifiers, k.code) {
                    (_, KeyCode::Char('q')) | (KeyModifiers::CONTROL, KeyCode::Char('c')) => {
                        let _ = cmd_tx.send(UiCommand::Quit);
                        break Ok(());
                    }
                    (_, KeyCode::Char('s')) | (_, KeyCode::Char('r')) => {
                        if state.session == SessionState::Running {
                            state.info = "A conversion is already running".into();
                        } else {
                            let _ = cmd_tx.send(UiCommand::Start);
                        }
                    }
                    (_, KeyCode::Char('c')) | (_, KeyCode::Esc) => {
                        if state.session == SessionState::Running {
                            let _ = cmd_tx.send(UiCommand::Cancel);
                        }
                    }
                    (_, KeyCode::Char('e')) => export_log(&mut state, &ctx),
                    (_, KeyCode::Char('y')) => copy_artifact_path(&mut state),
                    (_, KeyCode::Char('a')) => {
                        state.auto_save = !state.auto_save;
                        state.info = if state.auto_save {
                            "Auto-save enabled".into()
                        } else {
                            "Auto-save disabled".into()
                        };
                    }
                    (_, KeyCode::Tab) => {
                        state.tab = (state.tab + 1) % 3;
                        if state.tab == 1 {
                            state.history_selected = 0;
                        }
                    }
                    (_, KeyCode::Char('?')) => {
                        state.tab = 2;
                    }
                    (_, KeyCode::Up) | (_, KeyCode::Char('k')) => {
                        if state.tab == 1 {
                            state.history_selected = state.history_selected.saturating_sub(1);
                        } else {
                            state.scroll_up(1, view_height);
                        }
                    }
                    (_, KeyCode::Down) | (_, KeyCode::Char('j')) => {
                        if state.tab == 1 {
                            if state.history_selected + 1 < state.history.len() {
                                state.history_selected += 1;
                            }
                        } else {
                            state.scroll_down(1, view_height);
                        }
                    }
                    (_, KeyCode::PageUp) => state.scroll_up(view_height, view_height),
                    (_, KeyCode::PageDown) => state.scroll_down(view_height, view_height),
                    (_, KeyCode::End) | (_, KeyCode::Char('G')) => state.follow = true,
                    _ => {}
                }
            }
        }
    };

    // Unanswered prompts resolve to cancel.
    if let Some(req) = state.prompt.take() {
        req.answer(ScriptDecision::Cancel);
    }
    disable_raw_mode().ok();
    let mut stdout = io::stdout();
    execute!(stdout, LeaveAlternateScreen).ok();
    res
}

/// Returns `true` when the user asked to quit.
fn handle_prompt_key(state: &mut UiState, req: PromptRequest, k: KeyEvent) -> bool {
    match (k.modifiers, k.code) {
        (KeyModifiers::CONTROL, KeyCode::Char('c')) | (_, KeyCode::Char('q')) => {
            req.answer(ScriptDecision::Cancel);
            true
        }
        (_, KeyCode::Char('y')) | (_, KeyCode::Enter) => {
            req.answer(ScriptDecision::UseOverride);
            false
        }
        (_, KeyCode::Char('n')) | (_, KeyCode::Char('b')) => {
            req.answer(ScriptDecision::UseBundled);
            false
        }
        (_, KeyCode::Esc) | (_, KeyCode::Char('c')) => {
            req.answer(ScriptDecision::Cancel);
            state.info = "Script selection cancelled".into();
            false
        }
        _ => {
            state.prompt = Some(req);
            false
        }
    }
}

fn handle_run_completed(state: &mut UiState, r: ConversionResult) {
    let processed = orchestrator::process_run_completion(state.auto_save, &r);
    if processed.auto_saved_path.is_some() {
        state.history = crate::storage::load_recent(HISTORY_LOAD).unwrap_or_default();
        state.history_selected = 0;
    }
    state.record_result(r, processed.messages);
}

fn export_log(state: &mut UiState, ctx: &UiContext) {
    if state.display.is_empty() {
        state.info = "Nothing to export yet".into();
        return;
    }
    let id = state
        .last_result
        .as_ref()
        .map(|r| r.session_id.as_str())
        .unwrap_or("current");
    let path = crate::storage::default_log_path(&ctx.output_dir, id);
    match crate::storage::export_log(&path, &state.display) {
        Ok(()) => state.info = format!("Log exported to {}", path.display()),
        Err(e) => state.info = format!("Log export failed: {e:#}"),
    }
}

fn copy_artifact_path(state: &mut UiState) {
    let Some(path) = state
        .last_result
        .as_ref()
        .map(|r| r.artifact_path.clone())
        .filter(|p| !p.is_empty())
    else {
        state.info = "No output image path to copy".into();
        return;
    };
    state.info = match copy_to_clipboard(&path) {
        Ok(()) => format!("✓ Copied to clipboard: {path}"),
        Err(e) => format!("Clipboard copy failed: {e:#}"),
    };
}

fn draw(area: Rect, f: &mut ratatui::Frame, state: &UiState, ctx: &UiContext) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),
            Constraint::Min(0),
            Constraint::Length(6),
        ])
        .split(area);

    let tabs = Tabs::new(vec![
        Line::from("Output"),
        Line::from("History"),
        Line::from("Help"),
    ])
    .select(state.tab)
    .block(
        Block::default()
            .borders(Borders::ALL)
            .title(ctx.title.as_str()),
    )
    .highlight_style(Style::default().fg(Color::Yellow));
    f.render_widget(tabs, chunks[0]);

    match state.tab {
        0 => draw_output(chunks[1], f, state),
        1 => draw_history(chunks[1], f, state),
        _ => help::draw_help(chunks[1], f),
    }
    draw_status(chunks[2], f, state);

    if let Some(req) = &state.prompt {
        draw_prompt(area, f, req);
    }
}

fn draw_output(area: Rect, f: &mut ratatui::Frame, state: &UiState) {
    let height = area.height.saturating_sub(2) as usize;
    let top = state.top_line(height);
    let lines: Vec<Line> = state
        .display
        .lines()
        .skip(top)
        .take(height)
        .map(|l| Line::from(l.to_string()))
        .collect();
    let title = if state.follow {
        "Output".to_string()
    } else {
        format!("Output (line {} of {})", top + 1, state.line_count)
    };
    let p = Paragraph::new(lines).block(Block::default().borders(Borders::ALL).title(title));
    f.render_widget(p, area);
}

fn draw_history(area: Rect, f: &mut ratatui::Frame, state: &UiState) {
    let height = area.height.saturating_sub(2) as usize;
    let skip = state.history_selected.saturating_sub(height.saturating_sub(1));
    let lines: Vec<Line> = if state.history.is_empty() {
        vec![Line::from("No stored conversions")]
    } else {
        state
            .history
            .iter()
            .enumerate()
            .skip(skip)
            .take(height)
            .map(|(i, r)| {
                let text = crate::text_summary::history_line(r);
                if i == state.history_selected {
                    Line::from(Span::styled(
                        text,
                        Style::default().add_modifier(Modifier::REVERSED),
                    ))
                } else {
                    Line::from(text)
                }
            })
            .collect()
    };
    let p = Paragraph::new(lines).block(Block::default().borders(Borders::ALL).title("History"));
    f.render_widget(p, area);
}

fn label(s: &str) -> Span<'static> {
    Span::styled(format!("{s}: "), Style::default().fg(Color::Gray))
}

fn draw_status(area: Rect, f: &mut ratatui::Frame, state: &UiState) {
    let elapsed = state
        .elapsed()
        .map(|d| humantime::format_duration(Duration::from_secs(d.as_secs())).to_string())
        .unwrap_or_else(|| "-".into());
    let auto_save = if state.auto_save { "on" } else { "off" };
    let mut lines = vec![Line::from(vec![
        label("State"),
        Span::styled(state.session.to_string(), session_style(state.session)),
        Span::raw("   "),
        label("Elapsed"),
        Span::raw(elapsed),
        Span::raw("   "),
        label("Auto-save"),
        Span::raw(auto_save),
    ])];
    lines.push(Line::from(vec![
        label("Script"),
        Span::raw(state.script.clone().unwrap_or_else(|| "-".into())),
    ]));
    let artifact = state
        .last_result
        .as_ref()
        .map(|r| r.artifact_path.as_str())
        .filter(|p| !p.is_empty());
    lines.push(match (&state.temp_dir, artifact) {
        (Some(dir), _) => Line::from(vec![label("Temp"), Span::raw(dir.display().to_string())]),
        (None, Some(p)) => Line::from(vec![
            label("Image"),
            Span::styled(p.to_string(), Style::default().fg(Color::Cyan)),
        ]),
        (None, None) => Line::from(""),
    });
    lines.push(Line::from(Span::styled(
        state.info.clone(),
        Style::default().fg(Color::White),
    )));

    let p = Paragraph::new(lines).block(
        Block::default()
            .borders(Borders::ALL)
            .title("Status (? for help)"),
    );
    f.render_widget(p, area);
}

// Global clipboard manager channel - initialized once on first use
use std::sync::mpsc as std_mpsc;
use std::sync::OnceLock;

static CLIPBOARD_SENDER: OnceLock<std_mpsc::Sender<String>> = OnceLock::new();

/// Start the clipboard thread on first use. Each copy keeps its clipboard
/// instance alive briefly so clipboard managers on Linux can read it.
fn init_clipboard_manager() -> Result<&'static std_mpsc::Sender<String>> {
    CLIPBOARD_SENDER.get_or_init(|| {
        let (tx, rx) = std_mpsc::channel::<String>();

        std::thread::spawn(move || {
            use arboard::Clipboard;

            for text in rx {
                if let Ok(mut clipboard) = Clipboard::new() {
                    if clipboard.set_text(&text).is_ok() {
                        std::thread::sleep(Duration::from_secs(2));
                    }
                }
            }
        });

        tx
    });

    CLIPBOARD_SENDER
        .get()
        .ok_or_else(|| anyhow::anyhow!("Failed to initialize clipboard manager"))
}

/// Queue `text` for the clipboard thread; returns without blocking.
fn copy_to_clipboard(text: &str) -> Result<()> {
    let sender = init_clipboard_manager()?;
    sender
        .send(text.to_string())
        .map_err(|_| anyhow::anyhow!("Clipboard manager channel closed"))?;
    Ok(())
}
