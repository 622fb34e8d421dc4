/// Keyset pagination over a conversation's history
use crate::backend::MessagingBackend;
use crate::error::Result;
use crate::types::Message;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

/// One fetched page, ascending by `created_at`
#[derive(Debug, Clone)]
pub struct Page {
    pub conversation_id: String,
    pub messages: Vec<Message>,
    pub has_more: bool,
}

#[derive(Default)]
struct PagerState {
    /// conversation id -> token of the load currently allowed to commit
    in_flight: HashMap<String, u64>,
    has_more: HashMap<String, bool>,
    next_token: u64,
}

/// Fetches message pages; at most one load per conversation at a time
pub struct Pager<B> {
    backend: Arc<B>,
    page_size: usize,
    state: Arc<Mutex<PagerState>>,
}

impl<B> Clone for Pager<B> {
    fn clone(&self) -> Self {
        Self {
            backend: self.backend.clone(),
            page_size: self.page_size,
            state: self.state.clone(),
        }
    }
}

/// Clears the in-flight mark when the load finishes or is dropped,
/// unless a reset already handed the conversation to a newer load
struct InFlight {
    state: Arc<Mutex<PagerState>>,
    conversation_id: String,
    token: u64,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        let mut state = lock(&self.state);
        if state.in_flight.get(&self.conversation_id) == Some(&self.token) {
            state.in_flight.remove(&self.conversation_id);
        }
    }
}

fn lock(state: &Mutex<PagerState>) -> MutexGuard<'_, PagerState> {
    // State stays consistent even if a holder panicked
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl<B: MessagingBackend> Pager<B> {
    pub fn new(backend: Arc<B>, page_size: usize) -> Self {
        Self {
            backend,
            page_size: page_size.max(1),
            state: Arc::new(Mutex::new(PagerState::default())),
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Whether older history may still exist; true until a short page is seen
    pub fn has_more(&self, conversation_id: &str) -> bool {
        lock(&self.state)
            .has_more
            .get(conversation_id)
            .copied()
            .unwrap_or(true)
    }

    pub fn is_loading(&self, conversation_id: &str) -> bool {
        lock(&self.state).in_flight.contains_key(conversation_id)
    }

    /// Forget paging state for a conversation (on switch).
    /// A load still in flight for it is superseded and resolves to `None`.
    pub fn reset(&self, conversation_id: &str) {
        let mut state = lock(&self.state);
        if state.in_flight.remove(conversation_id).is_some() {
            debug!("Superseded page load for {}", conversation_id);
        }
        state.has_more.insert(conversation_id.to_string(), true);
    }

    /// Newest page. Returns `None` when a load for this conversation is already
    /// running or a reset superseded this one.
    pub async fn load_initial(&self, conversation_id: &str) -> Result<Option<Page>> {
        self.load(conversation_id, None).await
    }

    /// Page strictly older than `before`. Returns `None` while another load is
    /// in flight, once history is exhausted, or when a reset superseded it.
    pub async fn load_older(
        &self,
        conversation_id: &str,
        before: DateTime<Utc>,
    ) -> Result<Option<Page>> {
        if !self.has_more(conversation_id) {
            debug!("No older history for {}", conversation_id);
            return Ok(None);
        }
        self.load(conversation_id, Some(before)).await
    }

    async fn load(
        &self,
        conversation_id: &str,
        before: Option<DateTime<Utc>>,
    ) -> Result<Option<Page>> {
        let Some(guard) = self.begin(conversation_id) else {
            debug!("Page load for {} already in flight", conversation_id);
            return Ok(None);
        };

        let mut messages = self
            .backend
            .fetch_messages_page(conversation_id, self.page_size, before)
            .await?;
        messages.sort_by_key(|m| m.created_at);

        let has_more = messages.len() >= self.page_size;
        {
            let mut state = lock(&self.state);
            if state.in_flight.get(conversation_id) != Some(&guard.token) {
                debug!("Dropping superseded page for {}", conversation_id);
                return Ok(None);
            }
            state.has_more.insert(conversation_id.to_string(), has_more);
        }

        debug!(
            "Loaded {} messages for {} (before {:?}, has_more {})",
            messages.len(),
            conversation_id,
            before,
            has_more
        );

        Ok(Some(Page {
            conversation_id: conversation_id.to_string(),
            messages,
            has_more,
        }))
    }

    fn begin(&self, conversation_id: &str) -> Option<InFlight> {
        let mut state = lock(&self.state);
        if state.in_flight.contains_key(conversation_id) {
            return None;
        }
        state.next_token += 1;
        let token = state.next_token;
        state.in_flight.insert(conversation_id.to_string(), token);
        Some(InFlight {
            state: self.state.clone(),
            conversation_id: conversation_id.to_string(),
            token,
        })
    }
}
