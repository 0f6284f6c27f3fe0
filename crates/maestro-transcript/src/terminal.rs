//! Incremental terminal output reconciliation
//!
//! PTY reads arrive as arbitrary byte chunks: a multi-byte character or a
//! `\r\n` pair may straddle two reads. [`TerminalBuffer`] folds chunks into
//! completed lines plus the line under the cursor.

use std::collections::VecDeque;

pub const DEFAULT_SCROLLBACK: usize = 5_000;

/// How the terminal process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminalExit {
    pub code: Option<i32>,
}

#[derive(Debug, Clone)]
pub struct TerminalBuffer {
    max_lines: usize,
    lines: VecDeque<String>,
    current: Vec<char>,
    cursor: usize,
    undecoded: Vec<u8>,
    unread: usize,
    exit: Option<TerminalExit>,
}

impl Default for TerminalBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_SCROLLBACK)
    }
}

impl TerminalBuffer {
    pub fn new(max_lines: usize) -> Self {
        Self {
            max_lines: max_lines.max(1),
            lines: VecDeque::new(),
            current: Vec::new(),
            cursor: 0,
            undecoded: Vec::new(),
            unread: 0,
            exit: None,
        }
    }

    /// Feed a raw chunk. An incomplete UTF-8 sequence at the end is held back
    /// until the next chunk; invalid sequences become U+FFFD.
    pub fn push_bytes(&mut self, bytes: &[u8]) {
        self.undecoded.extend_from_slice(bytes);
        let buf = std::mem::take(&mut self.undecoded);
        let mut start = 0;

        loop {
            match std::str::from_utf8(&buf[start..]) {
                Ok(text) => {
                    self.push_str(text);
                    break;
                }
                Err(e) => {
                    let valid_end = start + e.valid_up_to();
                    let valid = std::str::from_utf8(&buf[start..valid_end]).unwrap_or_default();
                    self.push_str(valid);
                    match e.error_len() {
                        Some(len) => {
                            self.push_char(char::REPLACEMENT_CHARACTER);
                            start = valid_end + len;
                        }
                        None => {
                            self.undecoded = buf[valid_end..].to_vec();
                            break;
                        }
                    }
                }
            }
        }
    }

    pub fn push_str(&mut self, text: &str) {
        for c in text.chars() {
            self.push_char(c);
        }
    }

    fn push_char(&mut self, c: char) {
        match c {
            '\n' => self.complete_line(),
            '\r' => self.cursor = 0,
            '\u{8}' => self.cursor = self.cursor.saturating_sub(1),
            c => {
                if self.cursor < self.current.len() {
                    self.current[self.cursor] = c;
                } else {
                    self.current.push(c);
                }
                self.cursor += 1;
            }
        }
    }

    fn complete_line(&mut self) {
        let line: String = self.current.drain(..).collect();
        self.cursor = 0;
        self.lines.push_back(line);
        self.unread += 1;
        while self.lines.len() > self.max_lines {
            self.lines.pop_front();
        }
        self.unread = self.unread.min(self.lines.len());
    }

    /// Flush any held-back bytes and record how the process ended.
    pub fn mark_exited(&mut self, code: Option<i32>) {
        if !self.undecoded.is_empty() {
            self.undecoded.clear();
            self.push_char(char::REPLACEMENT_CHARACTER);
        }
        self.exit = Some(TerminalExit { code });
    }

    pub fn exit(&self) -> Option<TerminalExit> {
        self.exit
    }

    pub fn is_exited(&self) -> bool {
        self.exit.is_some()
    }

    /// Completed lines still in scrollback.
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().map(String::as_str)
    }

    pub fn line_count(&self) -> usize {
        self.lines.len()
    }

    /// The line under the cursor, not yet terminated by a newline.
    pub fn current_line(&self) -> String {
        self.current.iter().collect()
    }

    /// Lines completed since the previous call.
    pub fn take_completed(&mut self) -> Vec<String> {
        let skip = self.lines.len() - self.unread;
        self.unread = 0;
        self.lines.iter().skip(skip).cloned().collect()
    }

    /// Scrollback plus the current line.
    pub fn contents(&self) -> String {
        let mut out = self
            .lines
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join("\n");
        if !self.current.is_empty() {
            if !out.is_empty() {
                out.push('\n');
            }
            out.extend(self.current.iter());
        }
        out
    }
}
