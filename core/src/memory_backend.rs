/// In-process messaging backend with broadcast push channels.
/// Serves the demo binary and the test-suite; supports fault injection.
use crate::backend::{MessagingBackend, Subscription};
use crate::error::{ChatError, Result};
use crate::types::{ClientSummary, Conversation, Message, Role, SubscriptionScope};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

const CHANNEL_CAPACITY: usize = 128;

#[derive(Default)]
struct BackendState {
    conversations: Vec<Conversation>,
    messages: Vec<Message>,
    next_message: u64,
    next_conversation: u64,
    last_timestamp: Option<DateTime<Utc>>,
    channels: HashMap<SubscriptionScope, broadcast::Sender<Message>>,

    // Fault injection
    failing_sends: u32,
    offline: bool,
    reject_subscriptions: bool,
    send_delay: Option<Duration>,
    page_delay: Option<Duration>,
}

impl BackendState {
    /// Server clock, strictly increasing
    fn next_timestamp(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let ts = match self.last_timestamp {
            Some(last) if now <= last => last + ChronoDuration::milliseconds(1),
            _ => now,
        };
        self.last_timestamp = Some(ts);
        ts
    }

    fn record(
        &mut self,
        conversation_id: &str,
        sender_id: &str,
        sender_role: Role,
        content: &str,
        created_at: DateTime<Utc>,
    ) -> Result<Message> {
        let conversation = self
            .conversations
            .iter_mut()
            .find(|c| c.id == conversation_id)
            .ok_or_else(|| ChatError::NotFound(format!("conversation {}", conversation_id)))?;
        if created_at > conversation.updated_at {
            conversation.updated_at = created_at;
        }

        self.next_message += 1;
        let message = Message {
            id: format!("m{}", self.next_message),
            conversation_id: conversation_id.to_string(),
            sender_id: sender_id.to_string(),
            sender_role,
            content: content.to_string(),
            created_at,
            is_read: false,
        };
        self.messages.push(message.clone());
        Ok(message)
    }

    fn publish(&self, message: &Message) {
        let scoped = SubscriptionScope::Conversation(message.conversation_id.clone());
        for scope in [scoped, SubscriptionScope::All] {
            if let Some(tx) = self.channels.get(&scope) {
                // No receivers is fine
                let _ = tx.send(message.clone());
            }
        }
    }
}

#[derive(Clone, Default)]
pub struct InMemoryBackend {
    state: Arc<RwLock<BackendState>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a conversation directly, bypassing the client lookup
    pub async fn seed_conversation(&self, client_id: &str, summary: ClientSummary) -> Conversation {
        let mut state = self.state.write().await;
        state.next_conversation += 1;
        let conversation = Conversation {
            id: format!("conv-{}", state.next_conversation),
            client_id: client_id.to_string(),
            updated_at: state.next_timestamp(),
            client_summary: summary,
        };
        state.conversations.push(conversation.clone());
        conversation
    }

    /// Store a historical message with an explicit timestamp (no push)
    pub async fn seed_message_at(
        &self,
        conversation_id: &str,
        sender_id: &str,
        sender_role: Role,
        content: &str,
        created_at: DateTime<Utc>,
    ) -> Result<Message> {
        let mut state = self.state.write().await;
        let message = state.record(conversation_id, sender_id, sender_role, content, created_at)?;
        if state.last_timestamp.map_or(true, |last| created_at > last) {
            state.last_timestamp = Some(created_at);
        }
        Ok(message)
    }

    /// Another party writes a message; subscribers are notified
    pub async fn insert_message(
        &self,
        conversation_id: &str,
        sender_id: &str,
        sender_role: Role,
        content: &str,
    ) -> Result<Message> {
        let mut state = self.state.write().await;
        let created_at = state.next_timestamp();
        let message = state.record(conversation_id, sender_id, sender_role, content, created_at)?;
        state.publish(&message);
        Ok(message)
    }

    pub async fn messages(&self, conversation_id: &str) -> Vec<Message> {
        let state = self.state.read().await;
        let mut out: Vec<Message> = state
            .messages
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .cloned()
            .collect();
        out.sort_by_key(|m| m.created_at);
        out
    }

    /// Make the next `n` sends fail with a network error
    pub async fn fail_next_sends(&self, n: u32) {
        self.state.write().await.failing_sends = n;
    }

    /// Offline: every call fails with a network error
    pub async fn set_offline(&self, offline: bool) {
        self.state.write().await.offline = offline;
    }

    pub async fn reject_subscriptions(&self, reject: bool) {
        self.state.write().await.reject_subscriptions = reject;
    }

    /// Delay send responses (the push echo is published before the delay)
    pub async fn set_send_delay(&self, delay: Option<Duration>) {
        self.state.write().await.send_delay = delay;
    }

    /// Delay message page responses, as a slow history query would
    pub async fn set_page_delay(&self, delay: Option<Duration>) {
        self.state.write().await.page_delay = delay;
    }

    /// Close every live channel, as if the push transport dropped
    pub async fn drop_live_channels(&self) {
        let mut state = self.state.write().await;
        let dropped = state.channels.len();
        state.channels.clear();
        debug!("Dropped {} live channels", dropped);
    }

    pub async fn subscriber_count(&self, scope: &SubscriptionScope) -> usize {
        let state = self.state.read().await;
        state
            .channels
            .get(scope)
            .map_or(0, |tx| tx.receiver_count())
    }

    async fn ensure_online(&self) -> Result<()> {
        if self.state.read().await.offline {
            return Err(ChatError::Network("backend unreachable".to_string()));
        }
        Ok(())
    }
}

impl MessagingBackend for InMemoryBackend {
    async fn fetch_conversations(&self, role: Role, owner_id: &str) -> Result<Vec<Conversation>> {
        self.ensure_online().await?;
        let state = self.state.read().await;
        let mut out: Vec<Conversation> = state
            .conversations
            .iter()
            .filter(|c| role == Role::Admin || c.client_id == owner_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(out)
    }

    async fn fetch_messages_page(
        &self,
        conversation_id: &str,
        limit: usize,
        before: Option<DateTime<Utc>>,
    ) -> Result<Vec<Message>> {
        self.ensure_online().await?;
        let delay = self.state.read().await.page_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let state = self.state.read().await;
        let mut matching: Vec<Message> = state
            .messages
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .filter(|m| before.map_or(true, |b| m.created_at < b))
            .cloned()
            .collect();
        matching.sort_by_key(|m| m.created_at);
        let skip = matching.len().saturating_sub(limit);
        Ok(matching.split_off(skip))
    }

    async fn fetch_messages_since(
        &self,
        since: DateTime<Utc>,
        excluding_sender: &str,
    ) -> Result<Vec<Message>> {
        self.ensure_online().await?;
        let state = self.state.read().await;
        let mut out: Vec<Message> = state
            .messages
            .iter()
            .filter(|m| m.created_at > since && m.sender_id != excluding_sender)
            .cloned()
            .collect();
        out.sort_by_key(|m| m.created_at);
        Ok(out)
    }

    async fn send_message(
        &self,
        conversation_id: &str,
        content: &str,
        sender_id: &str,
        sender_role: Role,
    ) -> Result<Message> {
        let delay = {
            let mut state = self.state.write().await;
            if state.offline {
                return Err(ChatError::Network("backend unreachable".to_string()));
            }
            if state.failing_sends > 0 {
                state.failing_sends -= 1;
                return Err(ChatError::Network("send rejected by transport".to_string()));
            }
            if content.trim().is_empty() {
                return Err(ChatError::Validation("content must not be empty".to_string()));
            }
            state.send_delay
        };

        let message = {
            let mut state = self.state.write().await;
            let created_at = state.next_timestamp();
            let message = state.record(conversation_id, sender_id, sender_role, content, created_at)?;
            state.publish(&message);
            message
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(message)
    }

    async fn create_conversation(
        &self,
        client_id: &str,
        process_type: Option<&str>,
    ) -> Result<Conversation> {
        self.ensure_online().await?;
        let mut state = self.state.write().await;
        if let Some(existing) = state.conversations.iter().find(|c| c.client_id == client_id) {
            return Ok(existing.clone());
        }
        state.next_conversation += 1;
        let conversation = Conversation {
            id: format!("conv-{}", state.next_conversation),
            client_id: client_id.to_string(),
            updated_at: state.next_timestamp(),
            client_summary: ClientSummary {
                process_type: process_type.map(str::to_string),
                ..Default::default()
            },
        };
        state.conversations.push(conversation.clone());
        Ok(conversation)
    }

    async fn subscribe(&self, scope: SubscriptionScope) -> Result<Subscription> {
        let mut state = self.state.write().await;
        if state.offline || state.reject_subscriptions {
            return Err(ChatError::Subscription(format!("subscribe to {} refused", scope)));
        }
        let tx = state
            .channels
            .entry(scope.clone())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        let rx = tx.subscribe();
        Ok(Subscription::new(scope, rx))
    }
}
