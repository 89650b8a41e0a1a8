use super::prompt::PromptRequest;
use crate::engine::filter::DisplayChange;
use crate::model::{ConversionResult, InfoEvent, SessionEvent, SessionState};
use ratatui::style::{Color, Style};
use std::path::PathBuf;
use std::time::{Duration, Instant};

/// UI-thread-only view of the session.
pub struct UiState {
    pub tab: usize,
    pub session: SessionState,
    pub info: String,

    pub display: String,
    /// Newlines in `display`, kept in step with each change.
    pub(super) newlines: usize,
    pub line_count: usize,
    /// First visible line when not following the tail.
    pub scroll: usize,
    pub follow: bool,

    pub script: Option<String>,
    pub temp_dir: Option<PathBuf>,
    pub run_start: Option<Instant>,
    /// Frozen run duration once the session is terminal.
    pub run_elapsed: Option<Duration>,

    pub last_result: Option<ConversionResult>,
    pub history: Vec<ConversionResult>,
    pub history_selected: usize,
    pub auto_save: bool,

    pub prompt: Option<PromptRequest>,
}

impl Default for UiState {
    fn default() -> Self {
        Self {
            tab: 0,
            session: SessionState::Idle,
            info: String::new(),
            display: String::new(),
            newlines: 0,
            line_count: 0,
            scroll: 0,
            follow: true,
            script: None,
            temp_dir: None,
            run_start: None,
            run_elapsed: None,
            last_result: None,
            history: Vec::new(),
            history_selected: 0,
            auto_save: true,
            prompt: None,
        }
    }
}

impl UiState {
    fn apply_output(&mut self, change: &DisplayChange) {
        let keep = change.keep.min(self.display.len());
        self.newlines -= self.display[keep..].matches('\n').count();
        change.apply_to(&mut self.display);
        self.newlines += change.append.matches('\n').count();

        let open_line = !self.display.is_empty() && !self.display.ends_with('\n');
        self.line_count = self.newlines + usize::from(open_line);
        if self.display.is_empty() {
            self.scroll = 0;
            self.follow = true;
        }
    }

    /// First line shown in a viewport of `height` lines.
    pub fn top_line(&self, height: usize) -> usize {
        let last_page = self.line_count.saturating_sub(height);
        if self.follow {
            last_page
        } else {
            self.scroll.min(last_page)
        }
    }

    pub fn scroll_up(&mut self, lines: usize, height: usize) {
        let top = self.top_line(height);
        self.follow = false;
        self.scroll = top.saturating_sub(lines);
    }

    /// Scrolling past the last page resumes following the tail.
    pub fn scroll_down(&mut self, lines: usize, height: usize) {
        let top = self.top_line(height) + lines;
        if top >= self.line_count.saturating_sub(height) {
            self.follow = true;
        } else {
            self.scroll = top;
        }
    }

    pub fn elapsed(&self) -> Option<Duration> {
        self.run_elapsed
            .or_else(|| self.run_start.map(|s| s.elapsed()))
    }

    pub fn record_result(&mut self, result: ConversionResult, messages: Vec<String>) {
        if let Some(last) = messages.last() {
            self.info = last.clone();
        }
        self.last_result = Some(result);
    }
}

/// Apply a session event. `Finished` needs storage access and is handled by
/// the caller.
pub fn apply_event(state: &mut UiState, ev: SessionEvent) {
    match ev {
        SessionEvent::StateChanged { state: s } => {
            state.session = s;
            match s {
                SessionState::Running => {
                    state.run_start = Some(Instant::now());
                    state.run_elapsed = None;
                    state.last_result = None;
                    state.info = "Converting…".into();
                }
                s if s.is_terminal() => {
                    state.run_elapsed = state.run_start.map(|t| t.elapsed());
                    state.temp_dir = None;
                    state.info = format!("Conversion {s}");
                }
                _ => {}
            }
        }
        SessionEvent::Output { change, .. } => state.apply_output(&change),
        SessionEvent::Info(info) => {
            match &info {
                InfoEvent::ScriptSelected { path, is_override } => {
                    let origin = if *is_override { "external" } else { "bundled" };
                    state.script = Some(format!("{} ({origin})", path.display()));
                }
                InfoEvent::TempDirCreated { path } => state.temp_dir = Some(path.clone()),
                _ => {}
            }
            state.info = info.to_message();
        }
        SessionEvent::Finished { result } => state.record_result(*result, Vec::new()),
    }
}

pub fn session_style(s: SessionState) -> Style {
    let color = match s {
        SessionState::Idle => Color::Gray,
        SessionState::Running => Color::Yellow,
        SessionState::Completed => Color::Green,
        SessionState::Cancelled => Color::Magenta,
        SessionState::Failed => Color::Red,
    };
    Style::default().fg(color)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(display: &str) -> SessionEvent {
        SessionEvent::Output {
            chunk: String::new(),
            change: DisplayChange {
                keep: 0,
                append: display.into(),
            },
        }
    }

    #[test]
    fn follows_tail_until_scrolled() {
        let mut s = UiState::default();
        let text: String = (0..50).map(|i| format!("line {i}\n")).collect();
        apply_event(&mut s, output(&text));
        assert_eq!(s.line_count, 50);
        assert_eq!(s.top_line(10), 40);

        s.scroll_up(5, 10);
        assert!(!s.follow);
        assert_eq!(s.top_line(10), 35);

        // new output does not move a scrolled view
        apply_event(&mut s, output(&format!("{text}more\n")));
        assert_eq!(s.top_line(10), 35);

        s.scroll_down(100, 10);
        assert!(s.follow);
        assert_eq!(s.top_line(10), 41);
    }

    #[test]
    fn partial_changes_keep_line_count_in_step() {
        let mut s = UiState::default();
        apply_event(&mut s, output("line1\nCompleted: 1\n"));
        assert_eq!(s.line_count, 2);

        let collapse = SessionEvent::Output {
            chunk: "Completed: 2\n".into(),
            change: DisplayChange {
                keep: 6,
                append: "Completed: 2\nnext".into(),
            },
        };
        apply_event(&mut s, collapse);
        assert_eq!(s.display, "line1\nCompleted: 2\nnext");
        assert_eq!(s.line_count, 3);
    }

    #[test]
    fn empty_display_resets_scroll() {
        let mut s = UiState::default();
        apply_event(&mut s, output("a\nb\nc\n"));
        s.scroll_up(1, 1);
        apply_event(&mut s, output(""));
        assert!(s.follow);
        assert_eq!(s.top_line(10), 0);
    }

    #[test]
    fn terminal_state_freezes_elapsed_and_clears_temp_dir() {
        let mut s = UiState::default();
        apply_event(
            &mut s,
            SessionEvent::StateChanged {
                state: SessionState::Running,
            },
        );
        apply_event(
            &mut s,
            SessionEvent::Info(InfoEvent::TempDirCreated {
                path: PathBuf::from("/tmp/x"),
            }),
        );
        assert_eq!(s.temp_dir, Some(PathBuf::from("/tmp/x")));
        assert!(s.run_elapsed.is_none());

        apply_event(
            &mut s,
            SessionEvent::StateChanged {
                state: SessionState::Cancelled,
            },
        );
        assert!(s.run_elapsed.is_some());
        assert!(s.temp_dir.is_none());
        assert_eq!(s.info, "Conversion Cancelled");
    }
}
