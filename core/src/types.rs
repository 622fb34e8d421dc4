/// Shared types for the messaging layer
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::ChatError;

/// Which side of the portal a participant is on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Client,
}

impl Role {
    /// The role a viewer of this role talks to
    pub fn opposite(self) -> Role {
        match self {
            Role::Admin => Role::Client,
            Role::Client => Role::Admin,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Client => "client",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = ChatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "admin" => Ok(Role::Admin),
            "client" => Ok(Role::Client),
            other => Err(ChatError::Config(format!("Unknown role: {}", other))),
        }
    }
}

/// The authenticated user this session runs for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewer {
    pub id: String,
    pub role: Role,
}

impl Viewer {
    pub fn new(id: impl Into<String>, role: Role) -> Self {
        Self { id: id.into(), role }
    }

    pub fn admin(id: impl Into<String>) -> Self {
        Self::new(id, Role::Admin)
    }

    pub fn client(id: impl Into<String>) -> Self {
        Self::new(id, Role::Client)
    }
}

/// Denormalized client display fields, read-only here
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientSummary {
    pub name: String,
    pub email: String,
    pub process_type: Option<String>,
    pub process_number: Option<String>,
}

/// The single thread between one client and the firm
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub client_id: String,
    /// Timestamp of the most recent message; drives list ordering
    pub updated_at: DateTime<Utc>,
    pub client_summary: ClientSummary,
}

/// A server-confirmed message record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub sender_role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub is_read: bool,
}

/// Delivery progress of a locally created message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DeliveryState {
    Sending,
    Failed { reason: String },
}

/// A message shown before the server confirmed it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingMessage {
    pub temp_id: Uuid,
    pub conversation_id: String,
    pub sender_id: String,
    pub sender_role: Role,
    pub content: String,
    /// Local clock at send time
    pub created_at: DateTime<Utc>,
    pub state: DeliveryState,
}

/// An entry of the loaded message window
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChatMessage {
    Pending(PendingMessage),
    Confirmed(Message),
}

impl ChatMessage {
    pub fn created_at(&self) -> DateTime<Utc> {
        match self {
            ChatMessage::Pending(p) => p.created_at,
            ChatMessage::Confirmed(m) => m.created_at,
        }
    }

    pub fn conversation_id(&self) -> &str {
        match self {
            ChatMessage::Pending(p) => &p.conversation_id,
            ChatMessage::Confirmed(m) => &m.conversation_id,
        }
    }

    pub fn sender_id(&self) -> &str {
        match self {
            ChatMessage::Pending(p) => &p.sender_id,
            ChatMessage::Confirmed(m) => &m.sender_id,
        }
    }

    pub fn content(&self) -> &str {
        match self {
            ChatMessage::Pending(p) => &p.content,
            ChatMessage::Confirmed(m) => &m.content,
        }
    }

    /// Server id, if confirmed
    pub fn durable_id(&self) -> Option<&str> {
        match self {
            ChatMessage::Pending(_) => None,
            ChatMessage::Confirmed(m) => Some(&m.id),
        }
    }

    pub fn temp_id(&self) -> Option<Uuid> {
        match self {
            ChatMessage::Pending(p) => Some(p.temp_id),
            ChatMessage::Confirmed(_) => None,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, ChatMessage::Pending(_))
    }

    pub fn is_failed(&self) -> bool {
        matches!(
            self,
            ChatMessage::Pending(PendingMessage {
                state: DeliveryState::Failed { .. },
                ..
            })
        )
    }
}

/// Persisted record of an unconfirmed send
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingSend {
    pub temp_id: Uuid,
    pub conversation_id: String,
    pub content: String,
    pub sender_id: String,
    pub sender_role: Role,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    /// Last failure reason, if any attempt failed
    #[serde(default)]
    pub last_error: Option<String>,
}

impl PendingSend {
    pub fn to_pending_message(&self) -> PendingMessage {
        let state = match &self.last_error {
            Some(reason) => DeliveryState::Failed {
                reason: reason.clone(),
            },
            None => DeliveryState::Sending,
        };
        PendingMessage {
            temp_id: self.temp_id,
            conversation_id: self.conversation_id.clone(),
            sender_id: self.sender_id.clone(),
            sender_role: self.sender_role,
            content: self.content.clone(),
            created_at: self.created_at,
            state,
        }
    }
}

/// What a push subscription listens to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "scope", content = "id", rename_all = "snake_case")]
pub enum SubscriptionScope {
    Conversation(String),
    /// Inserts across every conversation (`"*"`)
    All,
}

impl fmt::Display for SubscriptionScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubscriptionScope::Conversation(id) => write!(f, "conversation:{}", id),
            SubscriptionScope::All => f.write_str("*"),
        }
    }
}
