//! Output filtering between the child process and the display buffer.
//!
//! Two stateful stages run in sequence on every chunk: [`EscapeStripper`]
//! drops terminal escape sequences, then [`DisplayBuffer`] accumulates the
//! text and collapses consecutive progress lines into one.

/// Terminal escape introducer.
pub const ESCAPE: char = '\u{1b}';

/// Lines starting with this prefix are progress updates and replace each other.
pub const PROGRESS_MARKER: &str = "Completed:";

/// Characters dropped after an escape introducer.
const ESCAPE_TAIL: u8 = 2;

/// Removes escape sequences of the form `ESC x y`.
///
/// Only the introducer and the two characters after it are dropped. Longer
/// CSI sequences leave their tail in the output; the conversion scripts'
/// output has always been filtered this way.
#[derive(Debug, Default, Clone)]
pub struct EscapeStripper {
    pending: u8,
}

impl EscapeStripper {
    /// Filter one chunk. The suppress counter carries over to the next call.
    pub fn strip(&mut self, text: &str) -> String {
        let mut out = String::with_capacity(text.len());
        for c in text.chars() {
            if self.pending > 0 {
                self.pending -= 1;
                continue;
            }
            if c == ESCAPE {
                self.pending = ESCAPE_TAIL;
                continue;
            }
            out.push(c);
        }
        out
    }

    pub fn reset(&mut self) {
        self.pending = 0;
    }
}

/// Edit that brings a copy of the display up to date: keep the first `keep`
/// bytes, then append `append`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayChange {
    pub keep: usize,
    pub append: String,
}

impl DisplayChange {
    pub fn apply_to(&self, text: &mut String) {
        text.truncate(self.keep.min(text.len()));
        text.push_str(&self.append);
    }
}

/// Accumulated display text with in-place progress lines.
///
/// The last line may still be open (no trailing newline). Whether it is a
/// progress line is settled as soon as enough of it has arrived to compare
/// against [`PROGRESS_MARKER`], so a split marker is handled the same as an
/// unsplit one.
#[derive(Debug, Default, Clone)]
pub struct DisplayBuffer {
    text: String,
    /// Byte offset where the open line starts.
    line_start: usize,
    /// Start of the last completed line, if any.
    prev_line_start: Option<usize>,
    prev_was_progress: bool,
    open_settled: bool,
    open_is_progress: bool,
    /// Lowest byte offset touched since the last [`DisplayBuffer::take_change`].
    dirty_from: Option<usize>,
}

impl DisplayBuffer {
    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn clear(&mut self) {
        *self = Self {
            dirty_from: Some(0),
            ..Self::default()
        };
    }

    /// Everything that changed since the previous call, if anything did.
    pub fn take_change(&mut self) -> Option<DisplayChange> {
        let keep = self.dirty_from.take()?;
        Some(DisplayChange {
            keep,
            append: self.text.get(keep..).unwrap_or_default().to_string(),
        })
    }

    fn mark_dirty(&mut self, at: usize) {
        self.dirty_from = Some(self.dirty_from.map_or(at, |d| d.min(at)));
    }

    /// Append text. Returns `false` when nothing changed, so callers can skip
    /// a refresh.
    pub fn push(&mut self, text: &str) -> bool {
        if text.is_empty() {
            return false;
        }
        self.mark_dirty(self.text.len());
        let mut rest = text;
        while !rest.is_empty() {
            match rest.find('\n') {
                Some(idx) => {
                    self.text.push_str(&rest[..=idx]);
                    self.settle_open_line(true);
                    self.close_line();
                    rest = &rest[idx + 1..];
                }
                None => {
                    self.text.push_str(rest);
                    self.settle_open_line(false);
                    rest = "";
                }
            }
        }
        true
    }

    fn settle_open_line(&mut self, complete: bool) {
        if self.open_settled {
            return;
        }
        let open = &self.text[self.line_start..];
        let body = open.strip_suffix('\n').unwrap_or(open);
        let decided = complete
            || body.len() >= PROGRESS_MARKER.len()
            || !PROGRESS_MARKER.starts_with(body);
        if !decided {
            return;
        }

        let is_progress = body.starts_with(PROGRESS_MARKER);
        if is_progress && self.prev_was_progress {
            if let Some(prev) = self.prev_line_start {
                let removed = self.line_start - prev;
                self.text.replace_range(prev..self.line_start, "");
                self.mark_dirty(prev);
                self.line_start -= removed;
                self.prev_line_start = None;
            }
        }
        self.open_settled = true;
        self.open_is_progress = is_progress;
    }

    fn close_line(&mut self) {
        self.prev_line_start = Some(self.line_start);
        self.prev_was_progress = self.open_is_progress;
        self.line_start = self.text.len();
        self.open_settled = false;
        self.open_is_progress = false;
    }
}

/// Both filter stages, owned by one session.
#[derive(Debug, Default, Clone)]
pub struct StreamFilter {
    stripper: EscapeStripper,
    display: DisplayBuffer,
}

impl StreamFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run a chunk of child output through both stages.
    ///
    /// Returns the stripped chunk when the display changed, `None` otherwise.
    pub fn feed(&mut self, chunk: &str) -> Option<String> {
        let stripped = self.stripper.strip(chunk);
        if self.display.push(&stripped) {
            Some(stripped)
        } else {
            None
        }
    }

    /// Append text produced by the application itself, bypassing the stripper.
    pub fn notice(&mut self, text: &str) -> bool {
        self.display.push(text)
    }

    pub fn display(&self) -> &str {
        self.display.as_str()
    }

    pub fn take_change(&mut self) -> Option<DisplayChange> {
        self.display.take_change()
    }

    pub fn reset(&mut self) {
        self.stripper.reset();
        self.display.clear();
    }
}
