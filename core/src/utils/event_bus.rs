/// In-process publish/subscribe for UI-facing domain events
use crate::realtime::SubscriptionState;
use crate::types::{Conversation, SubscriptionScope};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeLevel {
    Info,
    Warning,
    Error,
}

/// Events the conversation list and chat views react to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PortalEvent {
    /// A conversation appeared in the list
    ConversationInserted { conversation: Conversation },
    /// A conversation moved because of new activity
    ConversationUpdated {
        conversation_id: String,
        updated_at: DateTime<Utc>,
    },
    /// A confirmed message entered the open conversation
    MessageInserted {
        conversation_id: String,
        message_id: String,
    },
    /// Unread count of a conversation changed
    UnreadChanged {
        conversation_id: String,
        unread: usize,
    },
    /// An optimistic message could not be delivered
    SendFailed { temp_id: Uuid, reason: String },
    SubscriptionChanged {
        scope: SubscriptionScope,
        state: SubscriptionState,
    },
    /// Toast-style feedback for the user
    Notice { level: NoticeLevel, text: String },
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<PortalEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn emit(&self, event: PortalEvent) {
        if self.tx.send(event).is_err() {
            debug!("Event bus has no subscribers");
        }
    }

    pub fn notice(&self, level: NoticeLevel, text: impl Into<String>) {
        self.emit(PortalEvent::Notice {
            level,
            text: text.into(),
        });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PortalEvent> {
        self.tx.subscribe()
    }
}
