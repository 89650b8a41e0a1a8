use ratatui::{
    layout::Rect,
    style::Color,
    style::Style,
    text::{Line, Span},
    widgets::{Block, Borders, Paragraph},
    Frame,
};

fn bind(keys: &str, pad: usize, what: &str) -> Line<'static> {
    Line::from(vec![
        Span::raw("  "),
        Span::styled(keys.to_string(), Style::default().fg(Color::Magenta)),
        Span::raw(format!("{:pad$}{what}", "")),
    ])
}

pub fn draw_help(area: Rect, f: &mut Frame) {
    let p = Paragraph::new(vec![
        Line::from("Keybinds:"),
        Line::from(vec![
            Span::raw("  "),
            Span::styled("q", Style::default().fg(Color::Magenta)),
            Span::raw(" / "),
            Span::styled("Ctrl-C", Style::default().fg(Color::Magenta)),
            Span::raw("  Quit (cancels a running conversion)"),
        ]),
        bind("s", 11, "Start conversion"),
        bind("r", 11, "Restart after it finished"),
        bind("c", 11, "Cancel conversion"),
        bind("e", 11, "Export output log"),
        bind("y", 11, "Copy output image path to clipboard"),
        bind("a", 11, "Toggle auto-save"),
        bind("tab", 9, "Switch tabs"),
        bind("?", 11, "Show this help"),
        Line::from(""),
        Line::from("Output tab:"),
        bind("↑/↓", 9, "Scroll"),
        bind("PgUp/PgDn", 3, "Scroll a page"),
        bind("End", 9, "Follow new output"),
        Line::from(""),
        Line::from("History tab:"),
        bind("↑/↓", 9, "Navigate"),
        Line::from(""),
        Line::from("Script override prompt:"),
        bind("y", 11, "Use the external script"),
        bind("n", 11, "Use the bundled script"),
        bind("Esc", 9, "Cancel"),
    ])
    .block(Block::default().borders(Borders::ALL).title("Help"));
    f.render_widget(p, area);
}
