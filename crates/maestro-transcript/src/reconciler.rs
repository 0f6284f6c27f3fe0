//! Transcript reconciliation
//!
//! Projects a live stream of message and part events onto an ordered,
//! de-duplicated list of messages for one session. Events may arrive
//! duplicated or out of order; applying them is idempotent and never fails.

use std::collections::HashMap;

use serde_json::Value;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::event::TranscriptEvent;
use crate::model::{Message, MessageInfo, MessageRole, MessageWithParts, Part, PartContent};

/// Outcome of applying one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    MessageInserted,
    MessageUpdated,
    /// An optimistic placeholder took the identity of the server's message.
    TemporaryReplaced { temporary_id: String },
    PartInserted,
    PartUpdated,
    /// The part's message has not been seen yet; the part is held until it is.
    PartDeferred,
    /// Step markers are never stored.
    PartFiltered,
    SessionFailed,
    SessionIdle,
    /// Unknown kind or another session's event.
    Ignored,
    /// Malformed event.
    Dropped,
}

/// Ordered message list for a single session.
#[derive(Debug, Clone)]
pub struct Transcript {
    session_id: String,
    messages: Vec<Message>,
    index: HashMap<String, usize>,
    pending_parts: HashMap<String, Vec<Part>>,
    streaming: Option<String>,
}

impl Transcript {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            messages: Vec::new(),
            index: HashMap::new(),
            pending_parts: HashMap::new(),
            streaming: None,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn message(&self, id: &str) -> Option<&Message> {
        self.index.get(id).map(|&pos| &self.messages[pos])
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming.is_some()
    }

    /// Assistant message currently being generated.
    pub fn streaming_message_id(&self) -> Option<&str> {
        self.streaming.as_deref()
    }

    /// Number of parts waiting for their message to arrive.
    pub fn pending_part_count(&self) -> usize {
        self.pending_parts.values().map(Vec::len).sum()
    }

    /// Decode and apply a raw bus event. Malformed events are dropped.
    pub fn apply_value(&mut self, raw: &Value) -> Applied {
        match TranscriptEvent::parse(raw) {
            Ok(event) => self.apply(event),
            Err(e) => {
                debug!(session_id = %self.session_id, error = %e, "dropping malformed event");
                Applied::Dropped
            }
        }
    }

    pub fn apply(&mut self, event: TranscriptEvent) -> Applied {
        if let Some(session_id) = event.session_id() {
            if session_id != self.session_id {
                return Applied::Ignored;
            }
        }

        match event {
            TranscriptEvent::MessageUpdated(info) => self.upsert_message(info),
            TranscriptEvent::PartUpdated { part, delta } => self.upsert_part(part, delta),
            TranscriptEvent::SessionError { message, .. } => {
                self.fail(message);
                Applied::SessionFailed
            }
            TranscriptEvent::SessionIdle { .. } => {
                if let Some(id) = self.streaming.take() {
                    debug!(session_id = %self.session_id, message_id = %id, "session idle, stream ended");
                }
                Applied::SessionIdle
            }
            TranscriptEvent::Unknown(kind) => {
                trace!(kind = %kind, "ignoring event");
                Applied::Ignored
            }
        }
    }

    /// Apply a history snapshot through the regular upsert paths.
    pub fn hydrate(&mut self, history: Vec<MessageWithParts>) {
        for entry in history {
            if entry.info.session_id != self.session_id {
                continue;
            }
            self.upsert_message(entry.info);
            for part in entry.parts {
                self.upsert_part(part, None);
            }
        }
    }

    /// Insert an optimistic user message ahead of the server's confirmation.
    /// Returns the placeholder's id.
    pub fn insert_temporary_user_message(&mut self, text: impl Into<String>) -> String {
        let id = format!("temp-{}", Uuid::new_v4());
        let info = MessageInfo::new(&id, &self.session_id, MessageRole::User).created_at(now_millis());
        let mut part = Part::new(
            format!("{id}-text"),
            &id,
            &self.session_id,
            PartContent::text(text),
        );
        part.temporary = true;

        self.push(Message {
            info,
            parts: vec![part],
            temporary: true,
        });
        id
    }

    /// Remove a placeholder the server never confirmed.
    pub fn discard_temporary(&mut self, id: &str) -> bool {
        let Some(&pos) = self.index.get(id) else {
            return false;
        };
        if !self.messages[pos].temporary {
            return false;
        }
        self.messages.remove(pos);
        self.reindex();
        true
    }

    /// End streaming and record `message` as a terminal assistant message.
    pub fn fail(&mut self, message: impl Into<String>) {
        let message = message.into();
        if let Some(id) = self.streaming.take() {
            debug!(session_id = %self.session_id, message_id = %id, "stream failed");
        }

        let id = format!("error-{}", Uuid::new_v4());
        let now = now_millis();
        let mut info = MessageInfo::new(&id, &self.session_id, MessageRole::Assistant)
            .created_at(now)
            .completed_at(now);
        info.error = Some(message.clone());
        let part = Part::new(
            format!("{id}-text"),
            &id,
            &self.session_id,
            PartContent::text(message),
        );

        self.push(Message {
            info,
            parts: vec![part],
            temporary: false,
        });
    }

    fn upsert_message(&mut self, info: MessageInfo) -> Applied {
        if let Some(&pos) = self.index.get(&info.id) {
            self.messages[pos].info.merge(info);
            self.track_streaming(pos);
            return Applied::MessageUpdated;
        }

        let id = info.id.clone();
        let replaced = match info.role {
            MessageRole::User => self.sole_temporary(MessageRole::User),
            MessageRole::Assistant => None,
        };

        let (pos, applied) = match replaced {
            Some(pos) => {
                let message = &mut self.messages[pos];
                let previous = std::mem::replace(&mut message.info, info);
                message.temporary = false;
                for part in &mut message.parts {
                    part.message_id = id.clone();
                    part.session_id = message.info.session_id.clone();
                }
                self.index.remove(&previous.id);
                self.index.insert(id.clone(), pos);
                debug!(
                    session_id = %self.session_id,
                    temporary_id = %previous.id,
                    message_id = %id,
                    "temporary message confirmed"
                );
                (
                    pos,
                    Applied::TemporaryReplaced {
                        temporary_id: previous.id,
                    },
                )
            }
            None => (self.push(Message::new(info)), Applied::MessageInserted),
        };

        self.track_streaming(pos);
        self.attach_pending(&id, pos);
        applied
    }

    fn upsert_part(&mut self, part: Part, delta: Option<String>) -> Applied {
        if part.content.is_step_marker() {
            return Applied::PartFiltered;
        }

        let Some(&pos) = self.index.get(&part.message_id) else {
            // Held parts carry their accumulated text, deltas already folded in.
            let pending = self.pending_parts.entry(part.message_id.clone()).or_default();
            match pending.iter_mut().find(|held| held.id == part.id) {
                Some(held) => *held = with_delta(Some(&*held), part, delta),
                None => pending.push(with_delta(None, part, delta)),
            }
            return Applied::PartDeferred;
        };

        self.place_part(pos, part, delta)
    }

    fn place_part(&mut self, pos: usize, part: Part, delta: Option<String>) -> Applied {
        let parts = &mut self.messages[pos].parts;

        if let Some(existing) = parts.iter_mut().find(|p| p.id == part.id) {
            let updated = with_delta(Some(&*existing), part, delta);
            *existing = updated;
            return Applied::PartUpdated;
        }

        // The server's copy of a locally synthesised part takes its slot.
        if let Some(slot) = parts
            .iter_mut()
            .find(|p| p.temporary && p.content.kind() == part.content.kind())
        {
            *slot = with_delta(None, part, delta);
            return Applied::PartUpdated;
        }

        parts.push(with_delta(None, part, delta));
        Applied::PartInserted
    }

    fn attach_pending(&mut self, message_id: &str, pos: usize) {
        if let Some(held) = self.pending_parts.remove(message_id) {
            debug!(message_id = %message_id, count = held.len(), "attaching deferred parts");
            for part in held {
                self.place_part(pos, part, None);
            }
        }
    }

    fn track_streaming(&mut self, pos: usize) {
        let message = &self.messages[pos];
        if message.role() != MessageRole::Assistant {
            return;
        }

        if message.info.is_complete() {
            if self.streaming.as_deref() == Some(message.id()) {
                debug!(session_id = %self.session_id, message_id = %message.id(), "stream completed");
                self.streaming = None;
            }
        } else if self.streaming.as_deref() != Some(message.id()) {
            debug!(session_id = %self.session_id, message_id = %message.id(), "stream started");
            self.streaming = Some(message.id().to_string());
        }
    }

    /// Position of the only unconfirmed message with `role`, if exactly one exists.
    fn sole_temporary(&self, role: MessageRole) -> Option<usize> {
        let mut candidates = self
            .messages
            .iter()
            .enumerate()
            .filter(|(_, m)| m.temporary && m.role() == role)
            .map(|(pos, _)| pos);
        let first = candidates.next()?;
        match candidates.next() {
            Some(_) => None,
            None => Some(first),
        }
    }

    fn push(&mut self, message: Message) -> usize {
        let pos = self.messages.len();
        self.index.insert(message.id().to_string(), pos);
        self.messages.push(message);
        pos
    }

    fn reindex(&mut self) {
        self.index = self
            .messages
            .iter()
            .enumerate()
            .map(|(pos, m)| (m.id().to_string(), pos))
            .collect();
    }
}

/// Fill an empty streamed body from the previous text plus `delta`.
fn with_delta(previous: Option<&Part>, mut part: Part, delta: Option<String>) -> Part {
    let Some(delta) = delta else {
        return part;
    };
    if let Some(text) = part.content.text_mut() {
        if text.is_empty() {
            let prior = previous
                .and_then(|p| p.content.as_text())
                .unwrap_or_default();
            *text = format!("{prior}{delta}");
        }
    }
    part
}

fn now_millis() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or_default()
}
