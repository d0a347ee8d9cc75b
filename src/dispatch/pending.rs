use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::protocol::ChatResponse;

/// Terminal failure delivered to a waiter instead of a response.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct ProviderLost(pub String);

pub type CompletionResult = Result<ChatResponse, ProviderLost>;

struct PendingEntry {
    session_id: Uuid,
    tx: oneshot::Sender<CompletionResult>,
}

/// Correlation map between forwarded requests and their waiting dispatchers.
///
/// Entries are keyed by correlation id; each is terminated exactly once --
/// completed by the session demux, failed on provider loss, or abandoned by
/// the waiter on timeout. The session side holds only the ids (stable-id
/// linkage, no cross-pointers), so disconnection drains both sides by id.
#[derive(Default)]
pub struct PendingRequests {
    inner: Mutex<HashMap<Uuid, PendingEntry>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter for the given correlation id.
    pub fn register(
        &self,
        correlation_id: Uuid,
        session_id: Uuid,
    ) -> oneshot::Receiver<CompletionResult> {
        let (tx, rx) = oneshot::channel();
        let mut map = self.inner.lock().expect("pending lock poisoned");
        map.insert(correlation_id, PendingEntry { session_id, tx });
        rx
    }

    /// Deliver a correlated response. Returns false for unknown ids, which
    /// the session layer logs and drops.
    pub fn complete(&self, correlation_id: Uuid, response: ChatResponse) -> bool {
        let entry = {
            let mut map = self.inner.lock().expect("pending lock poisoned");
            map.remove(&correlation_id)
        };
        match entry {
            Some(entry) => {
                // A send error only means the waiter already gave up.
                let _ = entry.tx.send(Ok(response));
                true
            }
            None => false,
        }
    }

    /// Fail every listed pending request with a provider-lost error.
    pub fn fail_many(&self, correlation_ids: &[Uuid], reason: &str) {
        let entries: Vec<PendingEntry> = {
            let mut map = self.inner.lock().expect("pending lock poisoned");
            correlation_ids
                .iter()
                .filter_map(|id| map.remove(id))
                .collect()
        };
        for entry in entries {
            let _ = entry.tx.send(Err(ProviderLost(reason.to_string())));
        }
    }

    /// Drop a waiter without delivering anything (timeout / cancellation).
    pub fn abandon(&self, correlation_id: Uuid) {
        let mut map = self.inner.lock().expect("pending lock poisoned");
        map.remove(&correlation_id);
    }

    /// The session a pending request is bound to, if still outstanding.
    pub fn session_of(&self, correlation_id: Uuid) -> Option<Uuid> {
        let map = self.inner.lock().expect("pending lock poisoned");
        map.get(&correlation_id).map(|e| e.session_id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("pending lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
