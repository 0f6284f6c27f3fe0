//! Session transcript reconciliation for OpenCode event streams.
//!
//! [`Transcript`] folds `message.updated` / `message.part.updated` events into
//! an ordered message list; [`TerminalBuffer`] does the same for raw terminal
//! output.

pub mod error;
pub mod event;
pub mod model;
pub mod reconciler;
pub mod terminal;

pub use error::EventError;
pub use event::TranscriptEvent;
pub use model::{
    Message, MessageInfo, MessageRole, MessageTime, MessageWithParts, Part, PartContent,
    ToolState, ToolStatus,
};
pub use reconciler::{Applied, Transcript};
pub use terminal::{TerminalBuffer, TerminalExit};
