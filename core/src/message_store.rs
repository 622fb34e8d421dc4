/// Message window of the active conversation
/// Ordered by created_at ascending, no duplicate durable ids
use crate::types::{ChatMessage, DeliveryState, Message, PendingMessage};
use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// Result of applying a live push event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LiveOutcome {
    /// The durable id is already in the window
    Duplicate,
    /// Matched and replaced an optimistic entry
    ReplacedPending { temp_id: Uuid },
    /// Someone else's message, inserted
    Appended,
    /// Event belongs to a conversation that is not loaded
    OtherConversation,
}

/// Result of reconciling a send response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Pending entry replaced in place
    Replaced,
    /// The live echo got there first; pending entry dropped
    AlreadyPresent,
    /// No pending entry found, confirmed message inserted
    Appended,
    OtherConversation,
}

#[derive(Debug, Default)]
pub struct MessageStore {
    conversation_id: Option<String>,
    entries: Vec<ChatMessage>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Discard the window and start tracking another conversation
    pub fn reset(&mut self, conversation_id: Option<&str>) {
        self.conversation_id = conversation_id.map(str::to_string);
        self.entries.clear();
    }

    pub fn conversation_id(&self) -> Option<&str> {
        self.conversation_id.as_deref()
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains_id(&self, id: &str) -> bool {
        self.position_of_id(id).is_some()
    }

    pub fn get_pending(&self, temp_id: Uuid) -> Option<&PendingMessage> {
        self.entries.iter().find_map(|m| match m {
            ChatMessage::Pending(p) if p.temp_id == temp_id => Some(p),
            _ => None,
        })
    }

    /// Keyset cursor for the next older page
    pub fn oldest_cursor(&self) -> Option<DateTime<Utc>> {
        self.entries
            .iter()
            .find(|m| !m.is_pending())
            .map(ChatMessage::created_at)
    }

    pub fn newest(&self) -> Option<&ChatMessage> {
        self.entries.last()
    }

    /// Insert a confirmed or pending message at its ordered position.
    /// Returns false when it was rejected as a duplicate or foreign message.
    pub fn append(&mut self, message: ChatMessage) -> bool {
        if !self.is_loaded(message.conversation_id()) {
            return false;
        }
        let duplicate = match &message {
            ChatMessage::Confirmed(m) => self.contains_id(&m.id),
            ChatMessage::Pending(p) => self.position_of_temp(p.temp_id).is_some(),
        };
        if duplicate {
            return false;
        }
        self.insert_sorted(message);
        true
    }

    /// Insert an older page at the head; returns how many entries were new
    pub fn prepend(&mut self, older: Vec<Message>) -> usize {
        let mut page: Vec<Message> = older
            .into_iter()
            .filter(|m| self.is_loaded(&m.conversation_id) && !self.contains_id(&m.id))
            .collect();
        page.sort_by_key(|m| m.created_at);
        page.dedup_by(|a, b| a.id == b.id);

        let count = page.len();
        let fits_at_head = match (page.last(), self.entries.first()) {
            (Some(last), Some(head)) => last.created_at <= head.created_at(),
            _ => true,
        };

        if fits_at_head {
            self.entries
                .splice(0..0, page.into_iter().map(ChatMessage::Confirmed));
        } else {
            // Overlapping page, fall back to ordered inserts
            for m in page {
                self.insert_sorted(ChatMessage::Confirmed(m));
            }
        }
        count
    }

    /// Merge a page of recent messages fetched after a reconnect
    pub fn merge_newer(&mut self, recent: Vec<Message>, window: Duration) -> usize {
        recent
            .into_iter()
            .map(|m| self.apply_live(m, window))
            .filter(|o| matches!(o, LiveOutcome::Appended | LiveOutcome::ReplacedPending { .. }))
            .count()
    }

    /// Replace a pending message with its confirmed counterpart
    pub fn reconcile(&mut self, temp_id: Uuid, confirmed: Message) -> ReconcileOutcome {
        if !self.is_loaded(&confirmed.conversation_id) {
            return ReconcileOutcome::OtherConversation;
        }

        if self.contains_id(&confirmed.id) {
            if let Some(pos) = self.position_of_temp(temp_id) {
                self.entries.remove(pos);
            }
            return ReconcileOutcome::AlreadyPresent;
        }

        match self.position_of_temp(temp_id) {
            Some(pos) => {
                self.entries[pos] = ChatMessage::Confirmed(confirmed);
                self.settle(pos);
                ReconcileOutcome::Replaced
            }
            None => {
                debug!("Confirmation for {} arrived before its pending entry", temp_id);
                self.insert_sorted(ChatMessage::Confirmed(confirmed));
                ReconcileOutcome::Appended
            }
        }
    }

    /// Apply an inbound live message, matching it against pending entries
    /// by sender, content and a recency window
    pub fn apply_live(&mut self, incoming: Message, window: Duration) -> LiveOutcome {
        if !self.is_loaded(&incoming.conversation_id) {
            return LiveOutcome::OtherConversation;
        }
        if self.contains_id(&incoming.id) {
            return LiveOutcome::Duplicate;
        }

        let window_ms = i64::try_from(window.as_millis()).unwrap_or(i64::MAX);
        let candidate = self
            .entries
            .iter()
            .enumerate()
            .filter_map(|(idx, m)| match m {
                ChatMessage::Pending(p)
                    if p.sender_id == incoming.sender_id && p.content == incoming.content =>
                {
                    let gap = (incoming.created_at - p.created_at).num_milliseconds().abs();
                    (gap < window_ms).then_some((idx, gap, p.temp_id))
                }
                _ => None,
            })
            .min_by_key(|(_, gap, _)| *gap);

        match candidate {
            Some((pos, _, temp_id)) => {
                self.entries[pos] = ChatMessage::Confirmed(incoming);
                self.settle(pos);
                LiveOutcome::ReplacedPending { temp_id }
            }
            None => {
                if self.has_unmatched_pending_from(&incoming) {
                    warn!(
                        "Live message {} resembles a pending entry outside the dedup window",
                        incoming.id
                    );
                }
                self.insert_sorted(ChatMessage::Confirmed(incoming));
                LiveOutcome::Appended
            }
        }
    }

    pub fn mark_failed(&mut self, temp_id: Uuid, reason: &str) -> bool {
        self.set_delivery_state(
            temp_id,
            DeliveryState::Failed {
                reason: reason.to_string(),
            },
        )
    }

    pub fn mark_sending(&mut self, temp_id: Uuid) -> bool {
        self.set_delivery_state(temp_id, DeliveryState::Sending)
    }

    pub fn remove_pending(&mut self, temp_id: Uuid) -> bool {
        match self.position_of_temp(temp_id) {
            Some(pos) => {
                self.entries.remove(pos);
                true
            }
            None => false,
        }
    }

    fn set_delivery_state(&mut self, temp_id: Uuid, state: DeliveryState) -> bool {
        for entry in &mut self.entries {
            if let ChatMessage::Pending(p) = entry {
                if p.temp_id == temp_id {
                    p.state = state;
                    return true;
                }
            }
        }
        false
    }

    fn is_loaded(&self, conversation_id: &str) -> bool {
        self.conversation_id.as_deref() == Some(conversation_id)
    }

    fn position_of_id(&self, id: &str) -> Option<usize> {
        self.entries.iter().position(|m| m.durable_id() == Some(id))
    }

    fn position_of_temp(&self, temp_id: Uuid) -> Option<usize> {
        self.entries.iter().position(|m| m.temp_id() == Some(temp_id))
    }

    fn has_unmatched_pending_from(&self, incoming: &Message) -> bool {
        self.entries.iter().any(|m| {
            m.is_pending() && m.sender_id() == incoming.sender_id && m.content() == incoming.content
        })
    }

    fn insert_sorted(&mut self, message: ChatMessage) {
        let at = message.created_at();
        let pos = self.entries.partition_point(|m| m.created_at() <= at);
        self.entries.insert(pos, message);
    }

    /// Keep the entry at `pos` in place unless its timestamp breaks ordering
    fn settle(&mut self, pos: usize) {
        let at = self.entries[pos].created_at();
        let after_prev = pos == 0 || self.entries[pos - 1].created_at() <= at;
        let before_next = pos + 1 >= self.entries.len() || at <= self.entries[pos + 1].created_at();
        if !(after_prev && before_next) {
            let entry = self.entries.remove(pos);
            self.insert_sorted(entry);
        }
    }
}
