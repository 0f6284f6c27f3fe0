//! Decoding of OpenCode bus events
//!
//! Events arrive as `{"type": "...", "properties": {...}}`. Only the kinds the
//! transcript cares about are decoded; every other kind maps to
//! [`TranscriptEvent::Unknown`].

use serde_json::Value;

use crate::error::EventError;
use crate::model::{error_text, MessageInfo, Part};

pub const MESSAGE_UPDATED: &str = "message.updated";
pub const PART_UPDATED: &str = "message.part.updated";
pub const SESSION_ERROR: &str = "session.error";
pub const SESSION_IDLE: &str = "session.idle";

#[derive(Debug, Clone, PartialEq)]
pub enum TranscriptEvent {
    /// A message was created or its metadata changed.
    MessageUpdated(MessageInfo),
    /// A part was created or its content changed. `delta` carries the newly
    /// streamed text when the server sends one.
    PartUpdated { part: Part, delta: Option<String> },
    /// The session failed. `session_id` is absent for server-wide errors.
    SessionError {
        session_id: Option<String>,
        message: String,
    },
    /// The session finished processing.
    SessionIdle { session_id: String },
    /// Any event kind the transcript does not track.
    Unknown(String),
}

impl TranscriptEvent {
    pub fn parse(raw: &Value) -> Result<Self, EventError> {
        let object = raw.as_object().ok_or(EventError::NotAnObject)?;
        let event_type = object
            .get("type")
            .and_then(Value::as_str)
            .ok_or(EventError::MissingType)?;

        let properties = || {
            object
                .get("properties")
                .filter(|props| props.is_object())
                .ok_or_else(|| EventError::MissingProperties {
                    event_type: event_type.to_string(),
                })
        };

        match event_type {
            MESSAGE_UPDATED => {
                let info = properties()?
                    .get("info")
                    .cloned()
                    .ok_or(EventError::MissingField("info"))?;
                let info: MessageInfo = serde_json::from_value(info)
                    .map_err(|source| EventError::InvalidField { field: "info", source })?;
                if info.id.is_empty() {
                    return Err(EventError::MissingField("id"));
                }
                if info.session_id.is_empty() {
                    return Err(EventError::MissingField("sessionID"));
                }
                Ok(TranscriptEvent::MessageUpdated(info))
            }
            PART_UPDATED => {
                let props = properties()?;
                let part = props
                    .get("part")
                    .cloned()
                    .ok_or(EventError::MissingField("part"))?;
                let part = Part::from_value(part)?;
                let delta = props
                    .get("delta")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                Ok(TranscriptEvent::PartUpdated { part, delta })
            }
            SESSION_ERROR => {
                let props = properties()?;
                let session_id = props
                    .get("sessionID")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                let message = props
                    .get("error")
                    .and_then(error_text)
                    .unwrap_or_else(|| "Unknown error".to_string());
                Ok(TranscriptEvent::SessionError {
                    session_id,
                    message,
                })
            }
            SESSION_IDLE => {
                let session_id = properties()?
                    .get("sessionID")
                    .and_then(Value::as_str)
                    .filter(|id| !id.is_empty())
                    .ok_or(EventError::MissingField("sessionID"))?;
                Ok(TranscriptEvent::SessionIdle {
                    session_id: session_id.to_string(),
                })
            }
            other => Ok(TranscriptEvent::Unknown(other.to_string())),
        }
    }

    /// Session this event belongs to, if it names one.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            TranscriptEvent::MessageUpdated(info) => Some(&info.session_id),
            TranscriptEvent::PartUpdated { part, .. } => Some(&part.session_id),
            TranscriptEvent::SessionError { session_id, .. } => session_id.as_deref(),
            TranscriptEvent::SessionIdle { session_id } => Some(session_id),
            TranscriptEvent::Unknown(_) => None,
        }
    }
}
