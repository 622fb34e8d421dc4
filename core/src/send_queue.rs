/// Optimistic sends: local placeholder first, server confirmation later.
/// Unconfirmed sends are mirrored to durable storage on every change.
use crate::backend::MessagingBackend;
use crate::error::{ChatError, Result};
use crate::message_store::{MessageStore, ReconcileOutcome};
use crate::storage::ViewerStorage;
use crate::types::{ChatMessage, Message, PendingSend, Viewer};
use crate::utils::event_bus::{EventBus, PortalEvent};
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

const PENDING_SENDS_KEY: &str = "pending_sends";

pub struct OptimisticSendQueue<B> {
    backend: Arc<B>,
    storage: ViewerStorage,
    viewer: Viewer,
    messages: Arc<RwLock<MessageStore>>,
    bus: EventBus,
    pending: RwLock<Vec<PendingSend>>,
    max_retries: u32,
}

impl<B: MessagingBackend> OptimisticSendQueue<B> {
    /// Create the queue, restoring sends left over from an earlier session
    pub fn new(
        backend: Arc<B>,
        storage: ViewerStorage,
        viewer: Viewer,
        messages: Arc<RwLock<MessageStore>>,
        bus: EventBus,
        max_retries: u32,
    ) -> Result<Self> {
        let mut restored: Vec<PendingSend> =
            storage.get_json(PENDING_SENDS_KEY)?.unwrap_or_default();

        // An interrupted send never got its answer; report it as failed
        for entry in &mut restored {
            if entry.last_error.is_none() {
                entry.last_error = Some("interrupted before confirmation".to_string());
            }
        }
        if !restored.is_empty() {
            info!("Restored {} unconfirmed sends for {}", restored.len(), viewer.id);
        }

        Ok(Self {
            backend,
            storage,
            viewer,
            messages,
            bus,
            pending: RwLock::new(restored),
            max_retries,
        })
    }

    pub async fn pending(&self) -> Vec<PendingSend> {
        self.pending.read().await.clone()
    }

    pub async fn pending_for(&self, conversation_id: &str) -> Vec<PendingSend> {
        self.pending
            .read()
            .await
            .iter()
            .filter(|p| p.conversation_id == conversation_id)
            .cloned()
            .collect()
    }

    /// Show `content` immediately, then deliver it.
    /// Validation failures happen before anything is created.
    pub async fn send(&self, active: Option<&str>, content: &str) -> Result<Message> {
        let conversation_id = active
            .ok_or_else(|| ChatError::Validation("no active conversation".to_string()))?;
        if content.trim().is_empty() {
            return Err(ChatError::Validation("message content is empty".to_string()));
        }

        let entry = PendingSend {
            temp_id: Uuid::new_v4(),
            conversation_id: conversation_id.to_string(),
            content: content.to_string(),
            sender_id: self.viewer.id.clone(),
            sender_role: self.viewer.role,
            retry_count: 0,
            created_at: Utc::now(),
            last_error: None,
        };

        self.messages
            .write()
            .await
            .append(ChatMessage::Pending(entry.to_pending_message()));
        {
            let mut pending = self.pending.write().await;
            pending.push(entry.clone());
            self.persist(&pending);
        }
        debug!("Queued pending message {} in {}", entry.temp_id, conversation_id);

        self.deliver(entry).await
    }

    /// Re-send one failed message at the user's request.
    /// A send still waiting for its response cannot be retried.
    pub async fn retry(&self, temp_id: Uuid) -> Result<Message> {
        let entry = {
            let mut pending = self.pending.write().await;
            let entry = pending
                .iter_mut()
                .find(|p| p.temp_id == temp_id)
                .ok_or_else(|| ChatError::NotFound(format!("pending send {}", temp_id)))?;
            // No error recorded means a delivery is in flight
            if entry.last_error.is_none() {
                return Err(ChatError::Validation(format!(
                    "message {} is still being sent",
                    temp_id
                )));
            }
            entry.last_error = None;
            let entry = entry.clone();
            self.persist(&pending);
            entry
        };
        {
            let mut messages = self.messages.write().await;
            if !messages.mark_sending(temp_id) {
                // Restored from storage and not on screen yet
                messages.append(ChatMessage::Pending(entry.to_pending_message()));
            }
        }
        self.deliver(entry).await
    }

    /// Retry failed sends of a conversation that still have attempts left
    pub async fn retry_failed(&self, conversation_id: &str) -> Vec<(Uuid, Result<Message>)> {
        let due: Vec<Uuid> = self
            .pending
            .read()
            .await
            .iter()
            .filter(|p| {
                p.conversation_id == conversation_id
                    && p.last_error.is_some()
                    && p.retry_count < self.max_retries
            })
            .map(|p| p.temp_id)
            .collect();

        let mut results = Vec::with_capacity(due.len());
        for temp_id in due {
            results.push((temp_id, self.retry(temp_id).await));
        }
        results
    }

    /// Drop a failed message on the user's request
    pub async fn discard(&self, temp_id: Uuid) -> bool {
        let removed = {
            let mut pending = self.pending.write().await;
            let before = pending.len();
            pending.retain(|p| p.temp_id != temp_id);
            let removed = pending.len() != before;
            if removed {
                self.persist(&pending);
            }
            removed
        };
        let shown = self.messages.write().await.remove_pending(temp_id);
        removed || shown
    }

    /// The live echo already replaced the placeholder; stop tracking it
    pub async fn forget(&self, temp_id: Uuid) -> bool {
        let mut pending = self.pending.write().await;
        let before = pending.len();
        pending.retain(|p| p.temp_id != temp_id);
        let removed = pending.len() != before;
        if removed {
            self.persist(&pending);
        }
        removed
    }

    async fn deliver(&self, entry: PendingSend) -> Result<Message> {
        let temp_id = entry.temp_id;
        let result = self
            .backend
            .send_message(
                &entry.conversation_id,
                &entry.content,
                &entry.sender_id,
                entry.sender_role,
            )
            .await;

        match result {
            Ok(confirmed) => {
                {
                    let mut pending = self.pending.write().await;
                    pending.retain(|p| p.temp_id != temp_id);
                    self.persist(&pending);
                }
                let outcome = self
                    .messages
                    .write()
                    .await
                    .reconcile(temp_id, confirmed.clone());
                match outcome {
                    ReconcileOutcome::OtherConversation => {
                        debug!("Confirmed {} after leaving its conversation", confirmed.id)
                    }
                    _ => info!("Message {} confirmed as {} ({:?})", temp_id, confirmed.id, outcome),
                }
                Ok(confirmed)
            }
            Err(e) => {
                let reason = e.to_string();
                {
                    let mut pending = self.pending.write().await;
                    if let Some(p) = pending.iter_mut().find(|p| p.temp_id == temp_id) {
                        p.retry_count += 1;
                        p.last_error = Some(reason.clone());
                    }
                    self.persist(&pending);
                }
                if self.messages.write().await.mark_failed(temp_id, &reason) {
                    self.bus.emit(PortalEvent::SendFailed {
                        temp_id,
                        reason: reason.clone(),
                    });
                }
                warn!("Send of {} failed: {}", temp_id, reason);
                Err(e)
            }
        }
    }

    fn persist(&self, pending: &[PendingSend]) {
        let result = if pending.is_empty() {
            self.storage.remove(PENDING_SENDS_KEY)
        } else {
            self.storage.set_json(PENDING_SENDS_KEY, &pending)
        };
        // A storage failure must not block delivery
        if let Err(e) = result {
            warn!("Failed to persist pending sends: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_backend::InMemoryBackend;
    use crate::storage::LocalStore;
    use crate::types::ClientSummary;
    use std::time::Duration;

    struct Fixture {
        backend: Arc<InMemoryBackend>,
        store: LocalStore,
        messages: Arc<RwLock<MessageStore>>,
        queue: OptimisticSendQueue<InMemoryBackend>,
        conversation: String,
    }

    async fn fixture() -> Fixture {
        let backend = Arc::new(InMemoryBackend::new());
        let conv = backend.seed_conversation("client-1", ClientSummary::default()).await;
        let store = LocalStore::temporary().unwrap();
        let messages = Arc::new(RwLock::new(MessageStore::new()));
        messages.write().await.reset(Some(&conv.id));
        let queue = OptimisticSendQueue::new(
            backend.clone(),
            store.for_viewer("client-1"),
            Viewer::client("client-1"),
            messages.clone(),
            EventBus::new(8),
            3,
        )
        .unwrap();
        Fixture {
            backend,
            store,
            messages,
            queue,
            conversation: conv.id,
        }
    }

    #[tokio::test]
    async fn test_validation_creates_nothing() {
        let f = fixture().await;
        assert!(matches!(
            f.queue.send(Some(&f.conversation), "   ").await,
            Err(ChatError::Validation(_))
        ));
        assert!(matches!(
            f.queue.send(None, "hello").await,
            Err(ChatError::Validation(_))
        ));
        assert!(f.messages.read().await.is_empty());
        assert!(f.queue.pending().await.is_empty());
    }

    #[tokio::test]
    async fn test_confirmed_send_replaces_placeholder() {
        let f = fixture().await;
        let msg = f.queue.send(Some(&f.conversation), "Olá").await.unwrap();

        let messages = f.messages.read().await;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages.messages()[0].durable_id(), Some(msg.id.as_str()));
        assert!(f.queue.pending().await.is_empty());

        // Confirmed sends leave nothing behind in storage
        let stored: Option<Vec<PendingSend>> = f
            .store
            .for_viewer("client-1")
            .get_json(PENDING_SENDS_KEY)
            .unwrap();
        assert_eq!(stored, None);
    }

    #[tokio::test]
    async fn test_retry_refused_while_send_in_flight() {
        let f = fixture().await;
        f.backend.set_send_delay(Some(Duration::from_millis(200))).await;

        let (sent, retried) = tokio::join!(f.queue.send(Some(&f.conversation), "Olá"), async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let temp_id = f.queue.pending().await[0].temp_id;
            f.queue.retry(temp_id).await
        });

        assert!(sent.is_ok());
        assert!(matches!(retried, Err(ChatError::Validation(_))));
        assert_eq!(f.backend.messages(&f.conversation).await.len(), 1);
        assert_eq!(f.messages.read().await.len(), 1);
    }

    #[tokio::test]
    async fn test_failure_keeps_message_and_persists() {
        let f = fixture().await;
        f.backend.fail_next_sends(1).await;

        assert!(f.queue.send(Some(&f.conversation), "hello").await.is_err());
        {
            let messages = f.messages.read().await;
            assert_eq!(messages.len(), 1);
            assert!(messages.messages()[0].is_failed());
        }

        let stored: Vec<PendingSend> = f
            .store
            .for_viewer("client-1")
            .get_json(PENDING_SENDS_KEY)
            .unwrap()
            .unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].retry_count, 1);

        let results = f.queue.retry_failed(&f.conversation).await;
        assert_eq!(results.len(), 1);
        assert!(results[0].1.is_ok());

        let messages = f.messages.read().await;
        assert_eq!(messages.len(), 1);
        assert!(!messages.messages()[0].is_pending());
        assert!(f.queue.pending().await.is_empty());
    }

    #[tokio::test]
    async fn test_retry_budget_limits_automatic_passes() {
        let f = fixture().await;
        f.backend.fail_next_sends(10).await;
        assert!(f.queue.send(Some(&f.conversation), "x").await.is_err());

        for _ in 0..5 {
            f.queue.retry_failed(&f.conversation).await;
        }
        let pending = f.queue.pending().await;
        assert_eq!(pending[0].retry_count, 3);
        assert!(f.queue.retry_failed(&f.conversation).await.is_empty());

        // Explicit retry still allowed
        let temp_id = pending[0].temp_id;
        f.backend.fail_next_sends(0).await;
        assert!(f.queue.retry(temp_id).await.is_ok());
    }

    #[tokio::test]
    async fn test_restored_sends_are_reported_failed() {
        let f = fixture().await;
        f.backend.set_offline(true).await;
        assert!(f.queue.send(Some(&f.conversation), "lost").await.is_err());

        let queue = OptimisticSendQueue::new(
            f.backend.clone(),
            f.store.for_viewer("client-1"),
            Viewer::client("client-1"),
            Arc::new(RwLock::new(MessageStore::new())),
            EventBus::new(8),
            3,
        )
        .unwrap();
        let restored = queue.pending_for(&f.conversation).await;
        assert_eq!(restored.len(), 1);
        assert!(restored[0].last_error.is_some());

        assert!(queue.discard(restored[0].temp_id).await);
        assert!(queue.pending().await.is_empty());
    }
}
