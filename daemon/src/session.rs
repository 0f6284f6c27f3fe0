use std::sync::Arc;
use std::time::Duration;

use maestro_transcript::Transcript;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::client::{ClientError, OpenCodeClient};
use crate::state::SessionState;
use crate::subscription::{
    gate, open_event_stream, ConsumeOutcome, EventStream, Subscription, SubscriptionError,
    SubscriptionManager,
};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Client(#[from] ClientError),

    #[error(transparent)]
    Subscription(#[from] SubscriptionError),
}

/// How long to wait for the event stream to come up before loading history
/// anyway.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// A live, reconciled view of one OpenCode session.
///
/// Opening the view connects to the event stream first and holds its events
/// while the history loads. Held events are then applied on top, so nothing
/// published between the history response and the connection is lost.
pub struct SessionView {
    client: OpenCodeClient,
    manager: Arc<SubscriptionManager>,
    state: Arc<SessionState>,
    subscription: Option<Subscription>,
}

impl SessionView {
    pub async fn open(
        client: OpenCodeClient,
        manager: Arc<SubscriptionManager>,
        session_id: &str,
    ) -> Result<Self, SessionError> {
        let stream = open_event_stream(&client.event_url(), client.directory())?;
        Self::open_with_stream(client, manager, session_id, stream).await
    }

    /// Open with a caller-provided event stream instead of the server's SSE
    /// endpoint. History is still loaded from the server.
    pub async fn open_with_stream(
        client: OpenCodeClient,
        manager: Arc<SubscriptionManager>,
        session_id: &str,
        stream: EventStream,
    ) -> Result<Self, SessionError> {
        let mut view = Self {
            client,
            manager,
            state: SessionState::new(session_id),
            subscription: None,
        };
        view.start(stream).await?;
        Ok(view)
    }

    /// Start a fresh subscription and reload history, replacing any previous
    /// subscription for this session.
    pub async fn reconnect(&mut self) -> Result<(), SessionError> {
        let stream = open_event_stream(&self.client.event_url(), self.client.directory())?;
        self.start(stream).await
    }

    async fn start(&mut self, stream: EventStream) -> Result<(), SessionError> {
        let (gate, mut handle) = gate();
        let subscription = self
            .manager
            .subscribe(self.state.clone(), stream, Some(gate))
            .await;
        self.subscription = Some(subscription);

        if !handle.connected(CONNECT_TIMEOUT).await {
            warn!(
                "Event stream for session {} not up after {:?}, loading history anyway",
                self.session_id(),
                CONNECT_TIMEOUT
            );
        }

        if let Err(e) = self.hydrate().await {
            self.close().await;
            return Err(e);
        }
        handle.open();
        Ok(())
    }

    async fn hydrate(&self) -> Result<(), SessionError> {
        let history = self.client.messages(self.session_id()).await?;
        info!(
            "Loaded {} messages for session {}",
            history.len(),
            self.session_id()
        );
        self.state.update(|t| t.hydrate(history)).await;
        Ok(())
    }

    pub fn session_id(&self) -> &str {
        self.state.session_id()
    }

    pub fn state(&self) -> &Arc<SessionState> {
        &self.state
    }

    pub fn changes(&self) -> watch::Receiver<u64> {
        self.state.changes()
    }

    #[allow(dead_code)]
    pub async fn snapshot(&self) -> Transcript {
        self.state.snapshot().await
    }

    pub async fn is_streaming(&self) -> bool {
        self.state.is_streaming().await
    }

    /// Show the prompt immediately, then submit it.
    ///
    /// If the server rejects the prompt, the optimistic message is withdrawn
    /// and the failure is recorded in the transcript.
    pub async fn send_prompt(&self, text: &str) -> Result<(), SessionError> {
        let temp_id = self
            .state
            .update(|t| t.insert_temporary_user_message(text))
            .await;

        match self.client.prompt(self.session_id(), text).await {
            Ok(_) => Ok(()),
            Err(e) => {
                warn!("Prompt for session {} failed: {}", self.session_id(), e);
                let message = e.to_string();
                self.state
                    .update(|t| {
                        t.discard_temporary(&temp_id);
                        t.fail(message);
                    })
                    .await;
                Err(e.into())
            }
        }
    }

    pub async fn abort(&self) -> Result<(), SessionError> {
        self.client.abort(self.session_id()).await?;
        Ok(())
    }

    /// Wait until the current subscription stops.
    pub async fn finished(&mut self) -> ConsumeOutcome {
        match self.subscription.as_mut() {
            Some(sub) => sub.finished().await,
            None => ConsumeOutcome::Cancelled,
        }
    }

    /// Stop consuming events. The transcript stays readable.
    pub async fn close(&mut self) {
        if self.subscription.take().is_some() {
            self.manager.unsubscribe(self.session_id()).await;
        }
    }
}
