use std::sync::Arc;

use maestro_transcript::{Applied, Transcript};
use serde_json::Value;
use tokio::sync::{watch, Mutex};

/// Shared state of one open session view.
///
/// The transcript is only ever mutated through this type. Every change bumps
/// the revision counter so renderers can follow along.
pub struct SessionState {
    session_id: String,
    transcript: Mutex<Transcript>,
    revision: watch::Sender<u64>,
}

impl SessionState {
    pub fn new(session_id: impl Into<String>) -> Arc<Self> {
        let session_id = session_id.into();
        let (revision, _) = watch::channel(0);
        Arc::new(Self {
            transcript: Mutex::new(Transcript::new(session_id.clone())),
            session_id,
            revision,
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Receiver that fires after every transcript change
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    /// Apply one raw bus event, bumping the revision if anything changed
    pub async fn apply_value(&self, raw: &Value) -> Applied {
        let applied = self.transcript.lock().await.apply_value(raw);
        if !matches!(applied, Applied::Ignored | Applied::Dropped) {
            self.bump();
        }
        applied
    }

    /// Mutate the transcript directly
    pub async fn update<R>(&self, f: impl FnOnce(&mut Transcript) -> R) -> R {
        let result = f(&mut *self.transcript.lock().await);
        self.bump();
        result
    }

    pub async fn read<R>(&self, f: impl FnOnce(&Transcript) -> R) -> R {
        f(&*self.transcript.lock().await)
    }

    pub async fn snapshot(&self) -> Transcript {
        self.transcript.lock().await.clone()
    }

    pub async fn is_streaming(&self) -> bool {
        self.transcript.lock().await.is_streaming()
    }

    fn bump(&self) {
        self.revision.send_modify(|rev| *rev = rev.wrapping_add(1));
    }
}
