/// Messaging backend interface (REST-like calls + realtime push)
use crate::error::Result;
use crate::types::{Conversation, Message, Role, SubscriptionScope};
use chrono::{DateTime, Utc};
use std::future::Future;
use tokio::sync::broadcast;
use tracing::warn;

/// Calls the chat core makes against the server.
///
/// Implementations must be cheap to share behind an `Arc`; every method is
/// awaited from the session's event loop.
pub trait MessagingBackend: Send + Sync + 'static {
    /// Conversations visible to `owner_id` acting as `role`
    fn fetch_conversations(
        &self,
        role: Role,
        owner_id: &str,
    ) -> impl Future<Output = Result<Vec<Conversation>>> + Send;

    /// Up to `limit` messages strictly older than `before` (newest page when
    /// `None`), returned in ascending `created_at` order
    fn fetch_messages_page(
        &self,
        conversation_id: &str,
        limit: usize,
        before: Option<DateTime<Utc>>,
    ) -> impl Future<Output = Result<Vec<Message>>> + Send;

    /// Every message created strictly after `since` not sent by `excluding_sender`
    fn fetch_messages_since(
        &self,
        since: DateTime<Utc>,
        excluding_sender: &str,
    ) -> impl Future<Output = Result<Vec<Message>>> + Send;

    fn send_message(
        &self,
        conversation_id: &str,
        content: &str,
        sender_id: &str,
        sender_role: Role,
    ) -> impl Future<Output = Result<Message>> + Send;

    fn create_conversation(
        &self,
        client_id: &str,
        process_type: Option<&str>,
    ) -> impl Future<Output = Result<Conversation>> + Send;

    /// Open a push subscription; resolves once the server acknowledged it
    fn subscribe(
        &self,
        scope: SubscriptionScope,
    ) -> impl Future<Output = Result<Subscription>> + Send;
}

/// Handle to an open push subscription. Dropping it unsubscribes.
pub struct Subscription {
    scope: SubscriptionScope,
    rx: broadcast::Receiver<Message>,
}

impl Subscription {
    pub fn new(scope: SubscriptionScope, rx: broadcast::Receiver<Message>) -> Self {
        Self { scope, rx }
    }

    pub fn scope(&self) -> &SubscriptionScope {
        &self.scope
    }

    /// Next inserted message, or `None` once the channel is gone.
    /// Falling behind also ends the stream, so the gap is re-fetched on re-attach.
    pub async fn recv(&mut self) -> Option<Message> {
        match self.rx.recv().await {
            Ok(message) => Some(message),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("Subscription {} lagged {} events, closing", self.scope, n);
                None
            }
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }
}
