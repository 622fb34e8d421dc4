/// Conversation list, newest activity first
use crate::types::Conversation;
use chrono::{DateTime, Utc};
use std::collections::hash_map::Entry;
use std::collections::HashMap;

/// What `upsert` did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Inserted,
    Updated,
}

#[derive(Debug, Default)]
pub struct ConversationStore {
    conversations: Vec<Conversation>,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole list with a freshly fetched one.
    /// Duplicate ids keep their newest copy.
    pub fn replace_all(&mut self, conversations: Vec<Conversation>) {
        let mut newest: HashMap<String, Conversation> = HashMap::new();
        for conversation in conversations {
            match newest.entry(conversation.id.clone()) {
                Entry::Occupied(mut slot) => {
                    if conversation.updated_at > slot.get().updated_at {
                        slot.insert(conversation);
                    }
                }
                Entry::Vacant(slot) => {
                    slot.insert(conversation);
                }
            }
        }
        let mut conversations: Vec<Conversation> = newest.into_values().collect();
        conversations.sort_by(|a, b| {
            b.updated_at
                .cmp(&a.updated_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        self.conversations = conversations;
    }

    pub fn conversations(&self) -> &[Conversation] {
        &self.conversations
    }

    pub fn len(&self) -> usize {
        self.conversations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conversations.is_empty()
    }

    pub fn get(&self, conversation_id: &str) -> Option<&Conversation> {
        self.conversations.iter().find(|c| c.id == conversation_id)
    }

    pub fn contains(&self, conversation_id: &str) -> bool {
        self.get(conversation_id).is_some()
    }

    pub fn find_by_client(&self, client_id: &str) -> Option<&Conversation> {
        self.conversations.iter().find(|c| c.client_id == client_id)
    }

    pub fn ids(&self) -> Vec<String> {
        self.conversations.iter().map(|c| c.id.clone()).collect()
    }

    /// Insert or refresh a conversation, keeping the list ordered
    pub fn upsert(&mut self, conversation: Conversation) -> Upsert {
        match self.conversations.iter().position(|c| c.id == conversation.id) {
            Some(pos) => {
                let existing = self.conversations.remove(pos);
                // Never move a conversation backwards in time
                let updated_at = existing.updated_at.max(conversation.updated_at);
                self.insert_ordered(Conversation {
                    updated_at,
                    ..conversation
                });
                Upsert::Updated
            }
            None => {
                self.insert_ordered(conversation);
                Upsert::Inserted
            }
        }
    }

    /// Record activity at `at`; returns true if the conversation moved or changed.
    /// Unknown conversations are left to the caller.
    pub fn bump(&mut self, conversation_id: &str, at: DateTime<Utc>) -> bool {
        let Some(pos) = self.conversations.iter().position(|c| c.id == conversation_id) else {
            return false;
        };
        if self.conversations[pos].updated_at >= at {
            return false;
        }
        let mut conversation = self.conversations.remove(pos);
        conversation.updated_at = at;
        self.insert_ordered(conversation);
        true
    }

    fn insert_ordered(&mut self, conversation: Conversation) {
        let pos = self
            .conversations
            .partition_point(|c| c.updated_at >= conversation.updated_at);
        self.conversations.insert(pos, conversation);
    }
}
