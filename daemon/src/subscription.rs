//! Event subscriptions
//!
//! Connects to the OpenCode event bus over SSE and feeds events, in arrival
//! order, into a session's transcript. At most one subscription is active
//! per session; opening a new one cancels the old one first.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use eventsource_client::Client as _;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::DIRECTORY_HEADER;
use crate::state::SessionState;

#[derive(Debug, Error)]
pub enum SubscriptionError {
    #[error("failed to create SSE client: {0}")]
    Connect(String),

    #[error("SSE stream error: {0}")]
    Transport(String),
}

/// Decoded event payloads from the bus.
pub type EventStream = BoxStream<'static, Result<Value, SubscriptionError>>;

/// Why a consumer stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumeOutcome {
    /// Cancelled by its owner or replaced by a newer subscription.
    Cancelled,
    /// The server closed the stream.
    Ended,
    /// The transport failed. The error was recorded in the transcript.
    Failed(String),
}

/// Open the server's SSE event stream.
///
/// The client's own reconnection is disabled: when the connection drops the
/// stream yields an error and ends, and the caller decides whether to retry.
pub fn open_event_stream(
    url: &str,
    directory: Option<&str>,
) -> Result<EventStream, SubscriptionError> {
    let mut builder = eventsource_client::ClientBuilder::for_url(url)
        .map_err(|e| SubscriptionError::Connect(e.to_string()))?;
    if let Some(directory) = directory {
        builder = builder
            .header(DIRECTORY_HEADER, directory)
            .map_err(|e| SubscriptionError::Connect(format!("Failed to set header: {e}")))?;
    }
    let client = builder
        .reconnect(eventsource_client::ReconnectOptions::reconnect(false).build())
        .build();

    let stream = client.stream().filter_map(|item| async move {
        match item {
            Ok(eventsource_client::SSE::Event(event)) => {
                match serde_json::from_str::<Value>(&event.data) {
                    Ok(value) => Some(Ok(value)),
                    Err(e) => {
                        debug!("Failed to parse SSE event data as JSON: {} - {}", e, event.data);
                        None
                    }
                }
            }
            Ok(_) => None,
            Err(e) => Some(Err(SubscriptionError::Transport(e.to_string()))),
        }
    });

    Ok(stream.boxed())
}

/// Consumer side of a start gate.
///
/// A gated consumer reports when the first item arrives (the connection is
/// up) and holds every event back until the gate is opened.
pub struct Gate {
    connected: Option<oneshot::Sender<()>>,
    open: oneshot::Receiver<()>,
}

/// Caller side of a start gate.
pub struct GateHandle {
    connected: oneshot::Receiver<()>,
    open: oneshot::Sender<()>,
}

pub fn gate() -> (Gate, GateHandle) {
    let (connected_tx, connected_rx) = oneshot::channel();
    let (open_tx, open_rx) = oneshot::channel();
    (
        Gate {
            connected: Some(connected_tx),
            open: open_rx,
        },
        GateHandle {
            connected: connected_rx,
            open: open_tx,
        },
    )
}

impl GateHandle {
    /// Wait up to `timeout` for the stream to deliver its first item.
    pub async fn connected(&mut self, timeout: Duration) -> bool {
        matches!(
            tokio::time::timeout(timeout, &mut self.connected).await,
            Ok(Ok(()))
        )
    }

    /// Let the consumer apply held and subsequent events.
    pub fn open(self) {
        let _ = self.open.send(());
    }
}

/// Apply events from `stream` to `state` until the stream ends, fails, or
/// `cancel` fires. The stream is dropped before returning.
///
/// With a `gate`, events that arrive before the gate opens are held, then
/// applied in arrival order. Dropping the [`GateHandle`] opens the gate.
pub async fn consume<S>(
    mut stream: S,
    state: &SessionState,
    cancel: &CancellationToken,
    gate: Option<Gate>,
) -> ConsumeOutcome
where
    S: Stream<Item = Result<Value, SubscriptionError>> + Unpin,
{
    if let Some(mut gate) = gate {
        let mut held = Vec::new();
        let mut ended = false;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return ConsumeOutcome::Cancelled,
                _ = &mut gate.open => break,
                next = stream.next(), if !ended => {
                    if let Some(connected) = gate.connected.take() {
                        let _ = connected.send(());
                    }
                    match next {
                        Some(item) => held.push(item),
                        None => ended = true,
                    }
                }
            }
        }

        if !held.is_empty() {
            debug!(session_id = %state.session_id(), count = held.len(), "applying held events");
        }
        for item in held {
            if let Some(outcome) = apply_item(item, state).await {
                return outcome;
            }
        }
        if ended {
            return ConsumeOutcome::Ended;
        }
    }

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return ConsumeOutcome::Cancelled,
            next = stream.next() => next,
        };

        match next {
            Some(item) => {
                if let Some(outcome) = apply_item(item, state).await {
                    return outcome;
                }
            }
            None => return ConsumeOutcome::Ended,
        }
    }
}

async fn apply_item(
    item: Result<Value, SubscriptionError>,
    state: &SessionState,
) -> Option<ConsumeOutcome> {
    match item {
        Ok(raw) => {
            let applied = state.apply_value(&raw).await;
            debug!(session_id = %state.session_id(), ?applied, "applied event");
            None
        }
        Err(e) => {
            let message = e.to_string();
            warn!("Subscription for session {} failed: {}", state.session_id(), message);
            state.update(|t| t.fail(message.clone())).await;
            Some(ConsumeOutcome::Failed(message))
        }
    }
}

/// Caller-side handle to a running consumer.
pub struct Subscription {
    outcome_rx: Option<oneshot::Receiver<ConsumeOutcome>>,
    outcome: Option<ConsumeOutcome>,
}

impl Subscription {
    /// Wait for the consumer to stop. Safe to call again afterwards.
    pub async fn finished(&mut self) -> ConsumeOutcome {
        if let Some(rx) = self.outcome_rx.as_mut() {
            let outcome = rx.await.unwrap_or(ConsumeOutcome::Cancelled);
            self.outcome_rx = None;
            self.outcome = Some(outcome);
        }
        self.outcome.clone().unwrap_or(ConsumeOutcome::Cancelled)
    }
}

struct ActiveSubscription {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl ActiveSubscription {
    async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            warn!("Subscription task failed: {e}");
        }
    }
}

/// Registry enforcing one live consumer per session.
#[derive(Default)]
pub struct SubscriptionManager {
    active: Mutex<HashMap<String, ActiveSubscription>>,
}

impl SubscriptionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start consuming `stream` into `state`, held behind `gate` if given.
    ///
    /// Any previous subscription for the same session is cancelled and has
    /// fully stopped before the new consumer starts, so two consumers never
    /// mutate one transcript.
    pub async fn subscribe(
        &self,
        state: Arc<SessionState>,
        stream: EventStream,
        gate: Option<Gate>,
    ) -> Subscription {
        let session_id = state.session_id().to_string();
        let mut active = self.active.lock().await;

        if let Some(previous) = active.remove(&session_id) {
            info!("Replacing subscription for session {}", session_id);
            previous.stop().await;
        }

        let cancel = CancellationToken::new();
        let (outcome_tx, outcome_rx) = oneshot::channel();
        let task_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            let outcome = consume(stream, &state, &task_cancel, gate).await;
            info!("Subscription for session {} stopped: {:?}", state.session_id(), outcome);
            let _ = outcome_tx.send(outcome);
        });

        active.insert(session_id, ActiveSubscription { cancel, handle });

        Subscription {
            outcome_rx: Some(outcome_rx),
            outcome: None,
        }
    }

    #[allow(dead_code)]
    pub async fn is_active(&self, session_id: &str) -> bool {
        self.active
            .lock()
            .await
            .get(session_id)
            .is_some_and(|sub| !sub.handle.is_finished())
    }

    /// Stop the session's subscription. Returns whether one was registered.
    pub async fn unsubscribe(&self, session_id: &str) -> bool {
        let removed = self.active.lock().await.remove(session_id);
        match removed {
            Some(sub) => {
                sub.stop().await;
                true
            }
            None => false,
        }
    }

    pub async fn shutdown(&self) {
        let drained: Vec<_> = self.active.lock().await.drain().collect();
        for (session_id, sub) in drained {
            debug!("Stopping subscription for session {}", session_id);
            sub.stop().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    const SESSION: &str = "ses_1";

    fn assistant(completed: Option<u64>) -> Value {
        let mut time = json!({"created": 1});
        if let Some(completed) = completed {
            time["completed"] = json!(completed);
        }
        json!({"type": "message.updated", "properties": {"info": {
            "id": "msg_1", "sessionID": SESSION, "role": "assistant", "time": time
        }}})
    }

    fn text_part(id: &str, text: &str) -> Value {
        json!({"type": "message.part.updated", "properties": {"part": {
            "id": id, "messageID": "msg_1", "sessionID": SESSION, "type": "text", "text": text
        }}})
    }

    /// Sets its flag when dropped along with the stream that owns it.
    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    /// Never yields; stands in for an idle connection.
    struct IdleStream(#[allow(dead_code)] DropFlag);

    impl Stream for IdleStream {
        type Item = Result<Value, SubscriptionError>;

        fn poll_next(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<Option<Self::Item>> {
            std::task::Poll::Pending
        }
    }

    fn pending_stream(flag: Arc<AtomicBool>) -> EventStream {
        IdleStream(DropFlag(flag)).boxed()
    }

    #[tokio::test]
    async fn consume_applies_events_in_order() {
        let state = SessionState::new(SESSION);
        let events = vec![
            Ok(assistant(None)),
            Ok(text_part("prt_2", "second")),
            Ok(json!({"type": "server.heartbeat", "properties": {}})),
            Ok(text_part("prt_1", "first")),
            Ok(json!("garbage")),
        ];

        let outcome = consume(
            futures::stream::iter(events),
            &state,
            &CancellationToken::new(),
            None,
        )
        .await;

        assert_eq!(outcome, ConsumeOutcome::Ended);
        let ids = state
            .read(|t| {
                t.message("msg_1")
                    .map(|m| m.parts.iter().map(|p| p.id.clone()).collect::<Vec<_>>())
            })
            .await;
        assert_eq!(ids, Some(vec!["prt_2".to_string(), "prt_1".to_string()]));
        assert!(state.is_streaming().await);
    }

    #[tokio::test]
    async fn transport_error_records_terminal_message() {
        let state = SessionState::new(SESSION);
        let events = vec![
            Ok(assistant(None)),
            Err(SubscriptionError::Transport("connection reset".to_string())),
            Ok(assistant(Some(2))),
        ];

        let outcome = consume(
            futures::stream::iter(events),
            &state,
            &CancellationToken::new(),
            None,
        )
        .await;

        assert_eq!(
            outcome,
            ConsumeOutcome::Failed("SSE stream error: connection reset".to_string())
        );
        let transcript = state.snapshot().await;
        assert!(!transcript.is_streaming());
        assert_eq!(transcript.len(), 2);
        let last = transcript.messages().last().unwrap();
        assert_eq!(
            last.info.error.as_deref(),
            Some("SSE stream error: connection reset")
        );
    }

    #[tokio::test]
    async fn cancellation_stops_promptly_and_releases_stream() {
        let state = SessionState::new(SESSION);
        let released = Arc::new(AtomicBool::new(false));
        let cancel = CancellationToken::new();

        let task = {
            let state = state.clone();
            let cancel = cancel.clone();
            let stream = pending_stream(released.clone());
            tokio::spawn(async move { consume(stream, &state, &cancel, None).await })
        };

        cancel.cancel();
        let outcome = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("consumer stops promptly")
            .expect("consumer task");

        assert_eq!(outcome, ConsumeOutcome::Cancelled);
        assert!(released.load(Ordering::SeqCst));
        assert!(state.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn new_subscription_replaces_previous() {
        let manager = SubscriptionManager::new();
        let state = SessionState::new(SESSION);
        let first_released = Arc::new(AtomicBool::new(false));

        let mut first = manager
            .subscribe(state.clone(), pending_stream(first_released.clone()), None)
            .await;
        assert!(manager.is_active(SESSION).await);

        let mut second = manager
            .subscribe(state.clone(), pending_stream(Arc::new(AtomicBool::new(false))), None)
            .await;

        assert_eq!(first.finished().await, ConsumeOutcome::Cancelled);
        assert!(first_released.load(Ordering::SeqCst));
        assert!(manager.is_active(SESSION).await);

        assert!(manager.unsubscribe(SESSION).await);
        assert_eq!(second.finished().await, ConsumeOutcome::Cancelled);
        assert!(!manager.is_active(SESSION).await);
        assert!(!manager.unsubscribe(SESSION).await);
    }

    #[tokio::test]
    async fn subscriptions_for_different_sessions_coexist() {
        let manager = SubscriptionManager::new();
        let a = SessionState::new("ses_a");
        let b = SessionState::new("ses_b");

        let _sub_a = manager
            .subscribe(a, pending_stream(Arc::new(AtomicBool::new(false))), None)
            .await;
        let _sub_b = manager
            .subscribe(b, pending_stream(Arc::new(AtomicBool::new(false))), None)
            .await;

        assert!(manager.is_active("ses_a").await);
        assert!(manager.is_active("ses_b").await);

        manager.shutdown().await;
        assert!(!manager.is_active("ses_a").await);
        assert!(!manager.is_active("ses_b").await);
    }

    #[tokio::test]
    async fn finished_reports_stream_end() {
        let manager = SubscriptionManager::new();
        let state = SessionState::new(SESSION);
        let stream = futures::stream::iter(vec![Ok(assistant(Some(2)))]).boxed();

        let mut sub = manager.subscribe(state.clone(), stream, None).await;
        assert_eq!(sub.finished().await, ConsumeOutcome::Ended);
        assert_eq!(sub.finished().await, ConsumeOutcome::Ended);
        assert_eq!(state.read(|t| t.len()).await, 1);
    }

    #[tokio::test]
    async fn gated_events_wait_for_the_gate() {
        let state = SessionState::new(SESSION);
        let (gate, mut handle) = gate();
        let (tx, rx) = futures::channel::mpsc::unbounded();
        let task = {
            let state = state.clone();
            tokio::spawn(async move {
                consume(rx, &state, &CancellationToken::new(), Some(gate)).await
            })
        };

        tx.unbounded_send(Ok(assistant(None))).unwrap();
        tx.unbounded_send(Ok(text_part("prt_1", "Hello"))).unwrap();
        assert!(handle.connected(Duration::from_secs(1)).await);
        tokio::task::yield_now().await;
        assert!(state.snapshot().await.is_empty());

        // History loaded while the stream is held lands first.
        state
            .update(|t| {
                t.apply_value(&json!({"type": "message.updated", "properties": {"info": {
                    "id": "msg_0", "sessionID": SESSION, "role": "user", "time": {"created": 0}
                }}}));
            })
            .await;
        handle.open();
        drop(tx);

        assert_eq!(task.await.unwrap(), ConsumeOutcome::Ended);
        let transcript = state.snapshot().await;
        let ids: Vec<&str> = transcript.messages().iter().map(|m| m.id()).collect();
        assert_eq!(ids, vec!["msg_0", "msg_1"]);
        assert_eq!(transcript.messages()[1].text(), "Hello");
    }

    #[tokio::test]
    async fn held_events_survive_an_early_stream_end() {
        let state = SessionState::new(SESSION);
        let (gate, mut handle) = gate();
        let stream = futures::stream::iter(vec![Ok(assistant(None)), Ok(assistant(Some(2)))]);
        let task = {
            let state = state.clone();
            tokio::spawn(async move {
                consume(stream, &state, &CancellationToken::new(), Some(gate)).await
            })
        };

        assert!(handle.connected(Duration::from_secs(1)).await);
        drop(handle);

        assert_eq!(task.await.unwrap(), ConsumeOutcome::Ended);
        let transcript = state.snapshot().await;
        assert_eq!(transcript.len(), 1);
        assert!(!transcript.is_streaming());
    }

    #[tokio::test]
    async fn gate_times_out_on_a_silent_stream() {
        let state = SessionState::new(SESSION);
        let (gate, mut handle) = gate();
        let cancel = CancellationToken::new();
        let task = {
            let state = state.clone();
            let cancel = cancel.clone();
            let stream = pending_stream(Arc::new(AtomicBool::new(false)));
            tokio::spawn(async move { consume(stream, &state, &cancel, Some(gate)).await })
        };

        assert!(!handle.connected(Duration::from_millis(50)).await);
        handle.open();
        cancel.cancel();
        assert_eq!(task.await.unwrap(), ConsumeOutcome::Cancelled);
    }
}
