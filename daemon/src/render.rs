//! Plain-text rendering of transcripts for the terminal.

use std::fmt::Write as _;

use maestro_transcript::{Message, Part, PartContent, ToolStatus, Transcript};

fn tool_status(status: ToolStatus) -> &'static str {
    match status {
        ToolStatus::Pending => "pending",
        ToolStatus::Running => "running",
        ToolStatus::Completed => "completed",
        ToolStatus::Error => "error",
    }
}

fn render_part(out: &mut String, part: &Part) {
    match &part.content {
        PartContent::Text { text } => {
            out.push_str(text);
            out.push('\n');
        }
        PartContent::Reasoning { text } => {
            let _ = writeln!(out, "(thinking) {text}");
        }
        PartContent::Tool { tool, state, .. } => {
            let _ = write!(out, "[{tool}: {}]", tool_status(state.status));
            if let Some(title) = state.title.as_deref().filter(|t| !t.is_empty()) {
                let _ = write!(out, " {title}");
            }
            if let Some(error) = &state.error {
                let _ = write!(out, " ({error})");
            }
            out.push('\n');
        }
        PartContent::File { filename, mime, .. } => {
            let name = filename.as_deref().unwrap_or(mime);
            let _ = writeln!(out, "[file {name}]");
        }
        PartContent::StepStart {} | PartContent::StepFinish {} => {}
        PartContent::Other { part_type, .. } => {
            let _ = writeln!(out, "[{part_type}]");
        }
    }
}

pub fn render_message(message: &Message) -> String {
    let mut out = format!("{}:", message.role());
    if message.temporary {
        out.push_str(" (sending)");
    }
    out.push('\n');

    for part in &message.parts {
        render_part(&mut out, part);
    }

    // Synthetic error messages already carry the error as their text.
    if let Some(error) = &message.info.error {
        if message.text() != *error {
            let _ = writeln!(out, "error: {error}");
        }
    }
    out
}

pub fn render_transcript(transcript: &Transcript) -> String {
    let mut out = String::new();
    for (i, message) in transcript.messages().iter().enumerate() {
        if i > 0 {
            out.push('\n');
        }
        out.push_str(&render_message(message));
    }
    out
}

/// Tracks what has been printed so only new output is emitted.
///
/// The final newline of the rendering is held back, so a line still being
/// streamed can keep growing in place.
#[derive(Debug, Default)]
pub struct Renderer {
    printed: String,
    open_line: bool,
}

impl Renderer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Text to print to bring the terminal up to date with `transcript`.
    ///
    /// Appended text yields just the new suffix. When earlier output changed
    /// (a confirmed placeholder, a tool finishing) the whole transcript is
    /// returned behind a separator.
    pub fn update(&mut self, transcript: &Transcript) -> Option<String> {
        let rendered = render_transcript(transcript);
        let body = rendered.strip_suffix('\n').unwrap_or(&rendered);
        if body == self.printed {
            return None;
        }

        let out = match body.strip_prefix(self.printed.as_str()) {
            Some(suffix) => suffix.to_string(),
            None => format!("\n---\n{body}"),
        };
        self.printed = body.to_string();
        self.open_line = !self.printed.is_empty();
        Some(out)
    }

    /// Terminate the last printed line, if one is still open.
    pub fn finish(&mut self) -> Option<&'static str> {
        std::mem::take(&mut self.open_line).then_some("\n")
    }
}
