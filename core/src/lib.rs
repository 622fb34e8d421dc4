/// Portal Chat - realtime messaging and notification core
///
/// Conversation list, paged message history with optimistic sends, live push
/// subscriptions with reconnect, and per-viewer unread tracking with offline
/// backfill for a law-firm client portal.

pub mod backend;
pub mod config;
pub mod conversation_store;
pub mod error;
pub mod memory_backend;
pub mod message_store;
pub mod notifications;
pub mod pager;
pub mod policy;
pub mod realtime;
pub mod scroll;
pub mod send_queue;
pub mod session;
pub mod storage;
pub mod types;
pub mod utils;

pub use backend::{MessagingBackend, Subscription};
pub use config::ChatConfig;
pub use error::{ChatError, Result};
pub use memory_backend::InMemoryBackend;
pub use notifications::BackfillOutcome;
pub use session::ChatSession;
pub use storage::LocalStore;
pub use types::{ChatMessage, Conversation, Message, Role, Viewer};
pub use utils::{EventBus, NoticeLevel, PortalEvent};
