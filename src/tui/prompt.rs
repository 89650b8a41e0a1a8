//! Override-script question asked from the TUI.
//!
//! The controller side holds a [`UiChooser`]; each `choose` call sends a
//! [`PromptRequest`] to the UI thread and waits on its oneshot responder.

use crate::resolver::{ScriptChooser, ScriptDecision};
use ratatui::{
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Clear, Paragraph, Wrap},
    Frame,
};
use std::path::{Path, PathBuf};
use tokio::sync::{mpsc, oneshot};

pub struct PromptRequest {
    pub name: String,
    pub bundled: PathBuf,
    pub override_path: PathBuf,
    respond: oneshot::Sender<ScriptDecision>,
}

impl PromptRequest {
    pub fn answer(self, decision: ScriptDecision) {
        let _ = self.respond.send(decision);
    }
}

pub struct UiChooser {
    tx: mpsc::UnboundedSender<PromptRequest>,
}

impl UiChooser {
    pub fn new(tx: mpsc::UnboundedSender<PromptRequest>) -> Self {
        Self { tx }
    }
}

impl ScriptChooser for UiChooser {
    /// A closed UI or a dropped request counts as cancel.
    async fn choose(&mut self, name: &str, bundled: &Path, override_path: &Path) -> ScriptDecision {
        let (respond, rx) = oneshot::channel();
        let req = PromptRequest {
            name: name.to_string(),
            bundled: bundled.to_path_buf(),
            override_path: override_path.to_path_buf(),
            respond,
        };
        if self.tx.send(req).is_err() {
            return ScriptDecision::Cancel;
        }
        rx.await.unwrap_or(ScriptDecision::Cancel)
    }
}

fn centered(area: Rect, width: u16, height: u16) -> Rect {
    let vertical = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Min(0),
            Constraint::Length(height),
            Constraint::Min(0),
        ])
        .split(area);
    Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Min(0),
            Constraint::Length(width.min(area.width)),
            Constraint::Min(0),
        ])
        .split(vertical[1])[1]
}

fn key(k: &str) -> Span<'static> {
    Span::styled(k.to_string(), Style::default().fg(Color::Magenta))
}

pub fn draw_prompt(area: Rect, f: &mut Frame, req: &PromptRequest) {
    let popup = centered(area, 72, 10);
    let p = Paragraph::new(vec![
        Line::from(format!("An external version of {} exists:", req.name)),
        Line::from(Span::styled(
            req.override_path.display().to_string(),
            Style::default().fg(Color::Cyan),
        )),
        Line::from(vec![
            Span::styled("bundled: ", Style::default().fg(Color::Gray)),
            Span::raw(req.bundled.display().to_string()),
        ]),
        Line::from(""),
        Line::from("Use the external script instead of the bundled one?"),
        Line::from(""),
        Line::from(vec![
            key("y"),
            Span::raw(" external   "),
            key("n"),
            Span::raw(" bundled   "),
            key("Esc"),
            Span::raw(" cancel"),
        ]),
    ])
    .wrap(Wrap { trim: true })
    .block(
        Block::default()
            .borders(Borders::ALL)
            .title("Script override"),
    );
    f.render_widget(Clear, popup);
    f.render_widget(p, popup);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn answer_travels_back_to_the_chooser() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut chooser = UiChooser::new(tx);
        let ui = tokio::spawn(async move {
            let req = rx.recv().await.unwrap();
            assert_eq!(req.name, "InstallerApp2ISO.sh");
            req.answer(ScriptDecision::UseOverride);
        });
        let decision = chooser
            .choose(
                "InstallerApp2ISO.sh",
                Path::new("/b/InstallerApp2ISO.sh"),
                Path::new("/o/InstallerApp2ISO.sh"),
            )
            .await;
        assert_eq!(decision, ScriptDecision::UseOverride);
        ui.await.unwrap();
    }

    #[tokio::test]
    async fn dropped_request_cancels() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut chooser = UiChooser::new(tx);
        let ui = tokio::spawn(async move {
            drop(rx.recv().await);
        });
        let decision = chooser
            .choose("s.sh", Path::new("/b/s.sh"), Path::new("/o/s.sh"))
            .await;
        assert_eq!(decision, ScriptDecision::Cancel);
        ui.await.unwrap();
    }
}
