//! Transcript data model
//!
//! Mirrors the message and part shapes of the OpenCode server. Field names on
//! the wire use OpenCode's casing (`sessionID`, `messageID`, `callID`).

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::error::EventError;

/// Who authored a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
        }
    }
}

/// Message timestamps, epoch milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageTime {
    #[serde(default)]
    pub created: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed: Option<u64>,
}

/// Message metadata as carried by `message.updated` events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageInfo {
    pub id: String,
    #[serde(rename = "sessionID")]
    pub session_id: String,
    pub role: MessageRole,
    #[serde(default)]
    pub time: MessageTime,
    #[serde(rename = "modelID", default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    #[serde(rename = "providerID", default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
    #[serde(
        default,
        deserialize_with = "deserialize_error",
        skip_serializing_if = "Option::is_none"
    )]
    pub error: Option<String>,
}

impl MessageInfo {
    pub fn new(id: impl Into<String>, session_id: impl Into<String>, role: MessageRole) -> Self {
        Self {
            id: id.into(),
            session_id: session_id.into(),
            role,
            time: MessageTime::default(),
            model_id: None,
            provider_id: None,
            error: None,
        }
    }

    pub fn created_at(mut self, created: u64) -> Self {
        self.time.created = created;
        self
    }

    pub fn completed_at(mut self, completed: u64) -> Self {
        self.time.completed = Some(completed);
        self
    }

    pub fn is_complete(&self) -> bool {
        self.time.completed.is_some()
    }

    /// Fold a newer copy of the same message into this one.
    ///
    /// Fields present on `incoming` win. A completion timestamp or error that
    /// was already recorded is kept when a stale event arrives without it.
    pub fn merge(&mut self, incoming: MessageInfo) {
        self.id = incoming.id;
        self.session_id = incoming.session_id;
        self.role = incoming.role;
        if incoming.time.created != 0 {
            self.time.created = incoming.time.created;
        }
        if incoming.time.completed.is_some() {
            self.time.completed = incoming.time.completed;
        }
        if incoming.model_id.is_some() {
            self.model_id = incoming.model_id;
        }
        if incoming.provider_id.is_some() {
            self.provider_id = incoming.provider_id;
        }
        if incoming.error.is_some() {
            self.error = incoming.error;
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Error,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolState {
    #[serde(default)]
    pub status: ToolStatus,
    #[serde(default)]
    pub input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(
        default,
        deserialize_with = "deserialize_error",
        skip_serializing_if = "Option::is_none"
    )]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

/// Part types decoded into a typed [`PartContent`] variant. Anything else is
/// kept as [`PartContent::Other`].
const KNOWN_PART_TYPES: &[&str] = &[
    "text",
    "reasoning",
    "tool",
    "file",
    "step-start",
    "step-finish",
];

/// Body of a message part, discriminated by the wire `type` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum PartContent {
    Text {
        #[serde(default)]
        text: String,
    },
    Reasoning {
        #[serde(default)]
        text: String,
    },
    Tool {
        tool: String,
        #[serde(rename = "callID", alias = "toolCallID")]
        call_id: String,
        #[serde(default)]
        state: ToolState,
    },
    File {
        mime: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filename: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        url: Option<String>,
    },
    StepStart {},
    StepFinish {},
    Other {
        part_type: String,
        raw: Value,
    },
}

impl PartContent {
    pub fn text(text: impl Into<String>) -> Self {
        PartContent::Text { text: text.into() }
    }

    /// Wire type name of this part.
    pub fn kind(&self) -> &str {
        match self {
            PartContent::Text { .. } => "text",
            PartContent::Reasoning { .. } => "reasoning",
            PartContent::Tool { .. } => "tool",
            PartContent::File { .. } => "file",
            PartContent::StepStart {} => "step-start",
            PartContent::StepFinish {} => "step-finish",
            PartContent::Other { part_type, .. } => part_type,
        }
    }

    /// Step markers delimit model steps and carry no transcript content.
    pub fn is_step_marker(&self) -> bool {
        matches!(self, PartContent::StepStart {} | PartContent::StepFinish {})
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            PartContent::Text { text } | PartContent::Reasoning { text } => Some(text),
            _ => None,
        }
    }

    pub(crate) fn text_mut(&mut self) -> Option<&mut String> {
        match self {
            PartContent::Text { text } | PartContent::Reasoning { text } => Some(text),
            _ => None,
        }
    }
}

/// One content fragment of a message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Part {
    pub id: String,
    #[serde(rename = "messageID")]
    pub message_id: String,
    #[serde(rename = "sessionID")]
    pub session_id: String,
    #[serde(flatten)]
    pub content: PartContent,
    /// Synthesised locally, not yet confirmed by the server.
    #[serde(skip)]
    pub temporary: bool,
}

impl Part {
    pub fn new(
        id: impl Into<String>,
        message_id: impl Into<String>,
        session_id: impl Into<String>,
        content: PartContent,
    ) -> Self {
        Self {
            id: id.into(),
            message_id: message_id.into(),
            session_id: session_id.into(),
            content,
            temporary: false,
        }
    }

    /// Decode a part from its wire JSON.
    ///
    /// `id`, `messageID`, `sessionID` and `type` are required. Unknown part
    /// types are preserved as [`PartContent::Other`].
    pub fn from_value(value: Value) -> Result<Self, EventError> {
        let Value::Object(mut map) = value else {
            return Err(EventError::NotAnObject);
        };

        let id = take_id(&mut map, "id")?;
        let message_id = take_id(&mut map, "messageID")?;
        let session_id = take_id(&mut map, "sessionID")?;
        let part_type = map
            .get("type")
            .and_then(Value::as_str)
            .ok_or(EventError::MissingField("type"))?
            .to_string();

        let content = if KNOWN_PART_TYPES.contains(&part_type.as_str()) {
            serde_json::from_value(Value::Object(map))
                .map_err(|source| EventError::InvalidField { field: "part", source })?
        } else {
            map.remove("type");
            PartContent::Other {
                part_type,
                raw: Value::Object(map),
            }
        };

        Ok(Self {
            id,
            message_id,
            session_id,
            content,
            temporary: false,
        })
    }
}

impl<'de> Deserialize<'de> for Part {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Part::from_value(value).map_err(serde::de::Error::custom)
    }
}

/// A message and its ordered parts.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Message {
    pub info: MessageInfo,
    pub parts: Vec<Part>,
    /// Optimistic placeholder awaiting the server's copy.
    pub temporary: bool,
}

impl Message {
    pub fn new(info: MessageInfo) -> Self {
        Self {
            info,
            parts: Vec::new(),
            temporary: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.info.id
    }

    pub fn role(&self) -> MessageRole {
        self.info.role
    }

    /// Concatenated text of all text parts.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|part| match &part.content {
                PartContent::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }
}

/// Shape returned by the session history endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageWithParts {
    pub info: MessageInfo,
    #[serde(default)]
    pub parts: Vec<Part>,
}

fn take_id(map: &mut Map<String, Value>, field: &'static str) -> Result<String, EventError> {
    match map.remove(field) {
        Some(Value::String(id)) if !id.is_empty() => Ok(id),
        _ => Err(EventError::MissingField(field)),
    }
}

/// Normalise the error shapes OpenCode emits into a display string.
///
/// Accepts a bare string, `{ "data": { "message": .. } }`, `{ "message": .. }`
/// or `{ "name": .. }`.
pub(crate) fn error_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(text) => Some(text.clone()),
        Value::Object(map) => map
            .get("data")
            .and_then(|data| data.get("message"))
            .or_else(|| map.get("message"))
            .or_else(|| map.get("name"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| Some(value.to_string())),
        other => Some(other.to_string()),
    }
}

fn deserialize_error<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(error_text))
}
