/// Unread tracking per conversation, persisted per viewer.
/// Also reconstructs unread state for messages that arrived while logged out.
use crate::backend::MessagingBackend;
use crate::error::Result;
use crate::policy::NotificationPolicy;
use crate::storage::ViewerStorage;
use crate::types::{Message, Viewer};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

const NOTIFICATIONS_KEY: &str = "notifications";
const LAST_LOGOUT_KEY: &str = "last_logout_at";

/// Persisted unread state of one viewer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationState {
    /// conversation id -> unread message ids, in arrival order
    pub unread: BTreeMap<String, Vec<String>>,
    /// Newest message timestamp this viewer has observed
    pub last_seen_at: Option<DateTime<Utc>>,
}

impl NotificationState {
    fn insert(&mut self, conversation_id: &str, message_id: &str) -> bool {
        let ids = self.unread.entry(conversation_id.to_string()).or_default();
        if ids.iter().any(|id| id == message_id) {
            return false;
        }
        ids.push(message_id.to_string());
        true
    }

    fn touch(&mut self, at: DateTime<Utc>) -> bool {
        if self.last_seen_at.map_or(true, |seen| at > seen) {
            self.last_seen_at = Some(at);
            return true;
        }
        false
    }

    pub fn total(&self) -> usize {
        self.unread.values().map(Vec::len).sum()
    }
}

/// What a backfill run did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackfillOutcome {
    /// Gate already satisfied this session
    AlreadyChecked,
    /// No logout watermark recorded: nothing to catch up on
    FirstLogin,
    Merged {
        added: usize,
        conversations: BTreeSet<String>,
    },
}

pub struct NotificationTracker {
    viewer: Viewer,
    storage: ViewerStorage,
    policy: RwLock<Box<dyn NotificationPolicy>>,
    state: RwLock<NotificationState>,
    backfill_checked: AtomicBool,
    /// Catch-up floor while nothing has been observed yet
    tracking_since: DateTime<Utc>,
}

impl NotificationTracker {
    /// Load the viewer's persisted state
    pub fn new(
        viewer: Viewer,
        storage: ViewerStorage,
        policy: Box<dyn NotificationPolicy>,
    ) -> Result<Self> {
        let state: NotificationState = storage.get_json(NOTIFICATIONS_KEY)?.unwrap_or_default();
        debug!(
            "Loaded {} unread notifications for {}",
            state.total(),
            viewer.id
        );
        Ok(Self {
            viewer,
            storage,
            policy: RwLock::new(policy),
            state: RwLock::new(state),
            backfill_checked: AtomicBool::new(false),
            tracking_since: Utc::now(),
        })
    }

    pub fn viewer(&self) -> &Viewer {
        &self.viewer
    }

    pub async fn has_notification(&self, conversation_id: &str) -> bool {
        self.state
            .read()
            .await
            .unread
            .get(conversation_id)
            .is_some_and(|ids| !ids.is_empty())
    }

    pub async fn unread_count(&self, conversation_id: &str) -> usize {
        self.state
            .read()
            .await
            .unread
            .get(conversation_id)
            .map_or(0, Vec::len)
    }

    pub async fn unread_ids(&self, conversation_id: &str) -> Vec<String> {
        self.state
            .read()
            .await
            .unread
            .get(conversation_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn total_unread(&self) -> usize {
        self.state.read().await.total()
    }

    pub async fn snapshot(&self) -> NotificationState {
        self.state.read().await.clone()
    }

    /// Returns true if the id was not already unread
    pub async fn add_notification(&self, conversation_id: &str, message_id: &str) -> Result<bool> {
        let mut state = self.state.write().await;
        let added = state.insert(conversation_id, message_id);
        if added {
            self.persist(&state)?;
        }
        Ok(added)
    }

    /// Apply the live-notification rule to an inbound message
    pub async fn observe(&self, message: &Message) -> Result<bool> {
        let relevant = self.policy.read().await.is_relevant(&self.viewer, message);
        let mut state = self.state.write().await;
        let mut changed = state.touch(message.created_at);
        let added = relevant && state.insert(&message.conversation_id, &message.id);
        changed |= added;
        if changed {
            self.persist(&state)?;
        }
        Ok(added)
    }

    /// Advance the last-seen watermark without raising a notification
    pub async fn touch_last_seen(&self, at: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.write().await;
        if state.touch(at) {
            self.persist(&state)?;
        }
        Ok(())
    }

    /// Returns true if anything was unread
    pub async fn mark_as_read(&self, conversation_id: &str) -> Result<bool> {
        let mut state = self.state.write().await;
        let had = state
            .unread
            .remove(conversation_id)
            .is_some_and(|ids| !ids.is_empty());
        if had {
            self.persist(&state)?;
        }
        Ok(had)
    }

    pub async fn clear_all(&self) -> Result<()> {
        let mut state = self.state.write().await;
        state.unread.clear();
        self.persist(&state)
    }

    pub async fn set_owned_conversations(&self, ids: HashSet<String>) {
        self.policy.write().await.set_owned_conversations(ids);
    }

    pub fn last_logout_at(&self) -> Result<Option<DateTime<Utc>>> {
        self.storage.get_json(LAST_LOGOUT_KEY)
    }

    /// Logout hook: store the backfill watermark
    pub fn record_logout(&self, at: DateTime<Utc>) -> Result<()> {
        self.storage.set_json(LAST_LOGOUT_KEY, &at)?;
        info!("Recorded logout of {} at {}", self.viewer.id, at.to_rfc3339());
        Ok(())
    }

    pub fn backfill_checked(&self) -> bool {
        self.backfill_checked.load(Ordering::SeqCst)
    }

    /// Allow the next `backfill` call to run again (fresh login)
    pub fn reset_backfill_gate(&self) {
        self.backfill_checked.store(false, Ordering::SeqCst);
    }

    /// Merge unread state for messages created since the last logout.
    /// Runs once per login; a failed query leaves the gate open for a re-trigger.
    pub async fn backfill<B: MessagingBackend>(&self, backend: &B) -> Result<BackfillOutcome> {
        if self.backfill_checked() {
            return Ok(BackfillOutcome::AlreadyChecked);
        }

        let Some(since) = self.last_logout_at()? else {
            debug!("No logout watermark for {}, skipping backfill", self.viewer.id);
            self.backfill_checked.store(true, Ordering::SeqCst);
            return Ok(BackfillOutcome::FirstLogin);
        };

        let missed = backend.fetch_messages_since(since, &self.viewer.id).await?;
        let (added, conversations) = self.merge_missed(&missed, None).await?;

        self.backfill_checked.store(true, Ordering::SeqCst);
        info!(
            "Backfill for {} since {}: {} unread across {} conversations",
            self.viewer.id,
            since.to_rfc3339(),
            added,
            conversations.len()
        );
        Ok(BackfillOutcome::Merged {
            added,
            conversations,
        })
    }

    /// After a push channel outage, pick up messages newer than the last one
    /// seen, or than the tracker's creation if none was seen yet.
    /// `skip` names the conversation the viewer has open.
    pub async fn catch_up<B: MessagingBackend>(
        &self,
        backend: &B,
        skip: Option<&str>,
    ) -> Result<BTreeSet<String>> {
        let since = self
            .state
            .read()
            .await
            .last_seen_at
            .unwrap_or(self.tracking_since);
        let missed = backend.fetch_messages_since(since, &self.viewer.id).await?;
        let (added, conversations) = self.merge_missed(&missed, skip).await?;
        if added > 0 {
            info!("Caught up {} unread messages for {}", added, self.viewer.id);
        }
        Ok(conversations)
    }

    async fn merge_missed(
        &self,
        missed: &[Message],
        skip: Option<&str>,
    ) -> Result<(usize, BTreeSet<String>)> {
        let policy = self.policy.read().await;
        let mut state = self.state.write().await;
        let mut added = 0;
        let mut conversations = BTreeSet::new();

        for message in missed {
            // Server filter should already exclude our own messages
            if message.sender_id == self.viewer.id {
                warn!("Backfill query returned own message {}", message.id);
                continue;
            }
            state.touch(message.created_at);
            if skip == Some(message.conversation_id.as_str())
                || !policy.is_relevant(&self.viewer, message)
            {
                continue;
            }
            if state.insert(&message.conversation_id, &message.id) {
                added += 1;
                conversations.insert(message.conversation_id.clone());
            }
        }

        self.persist(&state)?;
        Ok((added, conversations))
    }

    fn persist(&self, state: &NotificationState) -> Result<()> {
        self.storage.set_json(NOTIFICATIONS_KEY, state)
    }
}
