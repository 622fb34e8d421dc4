/// Chat session: the explicit store object a viewer's UI is built on.
///
/// Owns the conversation list, the open conversation's messages, the send
/// queue, unread tracking and the realtime bridge, and routes bridge events
/// into them. Created with `init` at login and torn down with `teardown` (or
/// `logout`, which also records the backfill watermark).
use crate::backend::MessagingBackend;
use crate::config::ChatConfig;
use crate::conversation_store::{ConversationStore, Upsert};
use crate::error::{ChatError, Result};
use crate::message_store::{LiveOutcome, MessageStore};
use crate::notifications::{BackfillOutcome, NotificationTracker};
use crate::pager::Pager;
use crate::policy::policy_for;
use crate::realtime::{
    BridgeEvent, BridgeEventKind, RealtimeBridge, ReconnectPolicy, SubscriptionState,
};
use crate::send_queue::OptimisticSendQueue;
use crate::scroll::ScrollCoordinator;
use crate::storage::LocalStore;
use crate::types::{ChatMessage, Conversation, Message, PendingSend, Role, SubscriptionScope, Viewer};
use crate::utils::event_bus::{EventBus, NoticeLevel, PortalEvent};
use chrono::Utc;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch, Mutex, MutexGuard, RwLock};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub struct ChatSession<B: MessagingBackend> {
    viewer: Viewer,
    config: ChatConfig,
    backend: Arc<B>,
    bus: EventBus,
    conversations: RwLock<ConversationStore>,
    messages: Arc<RwLock<MessageStore>>,
    pager: Pager<B>,
    sends: OptimisticSendQueue<B>,
    notifications: NotificationTracker,
    bridge: Mutex<RealtimeBridge<B>>,
    events: Mutex<mpsc::UnboundedReceiver<BridgeEvent>>,
    scroll: Mutex<ScrollCoordinator>,
    active: RwLock<Option<String>>,
    /// Bumped on every selection change; fetch results commit only if it is unchanged
    selection: AtomicU64,
}

impl<B: MessagingBackend> ChatSession<B> {
    /// Log `viewer` in: load conversations and persisted state, attach the
    /// admin stream and run the offline backfill.
    /// Only local storage failures are fatal; backend failures become notices.
    pub async fn init(
        viewer: Viewer,
        backend: Arc<B>,
        store: LocalStore,
        config: ChatConfig,
    ) -> Result<Self> {
        let storage = store.for_viewer(&viewer.id);
        let bus = EventBus::new(config.event_bus_capacity);

        let mut conversations = ConversationStore::new();
        match backend.fetch_conversations(viewer.role, &viewer.id).await {
            Ok(list) => conversations.replace_all(list),
            Err(e) => {
                warn!("Failed to load conversations for {}: {}", viewer.id, e);
                bus.notice(NoticeLevel::Error, format!("Could not load conversations: {}", e));
            }
        }
        let owned: HashSet<String> = match viewer.role {
            Role::Client => conversations.ids().into_iter().collect(),
            Role::Admin => HashSet::new(),
        };

        let notifications =
            NotificationTracker::new(viewer.clone(), storage.clone(), policy_for(&viewer, owned))?;
        let messages = Arc::new(RwLock::new(MessageStore::new()));
        let sends = OptimisticSendQueue::new(
            backend.clone(),
            storage,
            viewer.clone(),
            messages.clone(),
            bus.clone(),
            config.max_send_retries,
        )?;
        let (bridge, events) = RealtimeBridge::new(
            backend.clone(),
            bus.clone(),
            ReconnectPolicy {
                initial_backoff: config.reconnect_initial_backoff,
                max_backoff: config.reconnect_max_backoff,
            },
        );

        let session = Self {
            pager: Pager::new(backend.clone(), config.page_size),
            scroll: Mutex::new(ScrollCoordinator::new(config.near_bottom_threshold)),
            viewer,
            config,
            backend,
            bus,
            conversations: RwLock::new(conversations),
            messages,
            sends,
            notifications,
            bridge: Mutex::new(bridge),
            events: Mutex::new(events),
            active: RwLock::new(None),
            selection: AtomicU64::new(0),
        };

        if session.viewer.role == Role::Admin {
            if let Err(e) = session.bridge.lock().await.attach_global().await {
                // Heartbeat keeps retrying
                session
                    .bus
                    .notice(NoticeLevel::Warning, format!("Live updates unavailable: {}", e));
            }
        }

        // Failure already reported; the gate stays open for a later attempt
        let _ = session.run_backfill().await;

        let unsent = session.sends.pending().await.len();
        if unsent > 0 {
            session.bus.notice(
                NoticeLevel::Warning,
                format!("{} message(s) from your last session were not delivered", unsent),
            );
        }

        info!(
            "Session ready for {} ({}): {} conversations",
            session.viewer.id,
            session.viewer.role,
            session.conversations.read().await.len()
        );
        Ok(session)
    }

    pub fn viewer(&self) -> &Viewer {
        &self.viewer
    }

    pub fn config(&self) -> &ChatConfig {
        &self.config
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<PortalEvent> {
        self.bus.subscribe()
    }

    pub fn notifications(&self) -> &NotificationTracker {
        &self.notifications
    }

    pub async fn conversations(&self) -> Vec<Conversation> {
        self.conversations.read().await.conversations().to_vec()
    }

    pub async fn active_conversation(&self) -> Option<String> {
        self.active.read().await.clone()
    }

    /// Snapshot of the open conversation, ascending by `created_at`
    pub async fn messages(&self) -> Vec<ChatMessage> {
        self.messages.read().await.messages().to_vec()
    }

    pub async fn pending_sends(&self) -> Vec<PendingSend> {
        self.sends.pending().await
    }

    pub async fn has_more_history(&self) -> bool {
        match self.active_conversation().await {
            Some(id) => self.pager.has_more(&id),
            None => false,
        }
    }

    pub async fn has_notification(&self, conversation_id: &str) -> bool {
        self.notifications.has_notification(conversation_id).await
    }

    pub async fn unread_count(&self, conversation_id: &str) -> usize {
        self.notifications.unread_count(conversation_id).await
    }

    /// Scroll state of the message view
    pub async fn scroll(&self) -> MutexGuard<'_, ScrollCoordinator> {
        self.scroll.lock().await
    }

    /// (conversation, global) subscription states
    pub async fn subscription_states(&self) -> (SubscriptionState, SubscriptionState) {
        let bridge = self.bridge.lock().await;
        (bridge.conversation_state(), bridge.global_state())
    }

    /// Re-fetch the conversation list, announcing conversations not seen before
    pub async fn refresh_conversations(&self) -> Result<()> {
        let list = match self
            .backend
            .fetch_conversations(self.viewer.role, &self.viewer.id)
            .await
        {
            Ok(list) => list,
            Err(e) => {
                self.report(&e, "Could not refresh conversations");
                return Err(e);
            }
        };

        let mut inserted = Vec::new();
        {
            let mut store = self.conversations.write().await;
            for conversation in list {
                if store.upsert(conversation.clone()) == Upsert::Inserted {
                    inserted.push(conversation);
                }
            }
            if self.viewer.role == Role::Client {
                let owned = store.ids().into_iter().collect();
                self.notifications.set_owned_conversations(owned).await;
            }
        }
        for conversation in inserted {
            debug!("New conversation {} in list", conversation.id);
            self.bus.emit(PortalEvent::ConversationInserted { conversation });
        }
        Ok(())
    }

    /// Make `conversation_id` the open conversation and load its newest page
    pub async fn select_conversation(&self, conversation_id: &str) -> Result<()> {
        if !self.conversations.read().await.contains(conversation_id) {
            return Err(ChatError::NotFound(format!("conversation {}", conversation_id)));
        }

        let epoch = self.change_selection(Some(conversation_id)).await;
        self.messages.write().await.reset(Some(conversation_id));
        self.pager.reset(conversation_id);
        self.scroll.lock().await.reset();

        // Attach before loading so nothing written in between is missed
        if let Err(e) = self.bridge.lock().await.attach(conversation_id).await {
            self.bus
                .notice(NoticeLevel::Warning, format!("Live updates paused: {}", e));
        }

        if self.notifications.mark_as_read(conversation_id).await? {
            self.emit_unread(conversation_id).await;
        }

        let page = match self.pager.load_initial(conversation_id).await {
            Ok(Some(page)) => page,
            Ok(None) => return Ok(()),
            Err(e) => {
                self.report(&e, "Could not load messages");
                return Err(e);
            }
        };

        let mut messages = self.messages.write().await;
        if !self.is_selection(epoch) {
            debug!("Dropping page for {}, selection changed", conversation_id);
            return Ok(());
        }
        if let Some(newest) = page.messages.last() {
            if let Err(e) = self.notifications.touch_last_seen(newest.created_at).await {
                warn!("Failed to advance last seen: {}", e);
            }
        }
        messages.prepend(page.messages);
        for pending in self.sends.pending_for(conversation_id).await {
            messages.append(ChatMessage::Pending(pending.to_pending_message()));
        }
        debug!("Opened {} with {} messages", conversation_id, messages.len());
        Ok(())
    }

    /// Load the page before the oldest loaded message. Returns how many were added.
    pub async fn load_older(&self) -> Result<usize> {
        let (active, epoch) = self.current_selection().await;
        let conversation_id =
            active.ok_or_else(|| ChatError::Validation("no active conversation".to_string()))?;
        let Some(before) = self.messages.read().await.oldest_cursor() else {
            return Ok(0);
        };

        self.scroll.lock().await.capture_before_prepend();
        let result = self.pager.load_older(&conversation_id, before).await;

        let page = match result {
            Ok(Some(page)) => page,
            Ok(None) => {
                self.scroll.lock().await.cancel_prepend();
                return Ok(0);
            }
            Err(e) => {
                self.scroll.lock().await.cancel_prepend();
                self.report(&e, "Could not load older messages");
                return Err(e);
            }
        };

        let mut messages = self.messages.write().await;
        if !self.is_selection(epoch) {
            drop(messages);
            debug!("Dropping older page for {}, selection changed", conversation_id);
            self.scroll.lock().await.cancel_prepend();
            return Ok(0);
        }
        Ok(messages.prepend(page.messages))
    }

    /// Send `content` to the open conversation. Earlier failed sends that
    /// still have automatic attempts left go first.
    pub async fn send(&self, content: &str) -> Result<Message> {
        let active = self.active_conversation().await;
        if let Some(conversation_id) = active.as_deref() {
            if !content.trim().is_empty() {
                for (temp_id, result) in self.sends.retry_failed(conversation_id).await {
                    match result {
                        Ok(message) => self.on_sent(&message).await,
                        Err(e) => debug!("Retry of {} failed again: {}", temp_id, e),
                    }
                }
            }
        }

        match self.sends.send(active.as_deref(), content).await {
            Ok(message) => {
                self.on_sent(&message).await;
                Ok(message)
            }
            Err(e) => {
                self.report(&e, "Message not sent");
                Err(e)
            }
        }
    }

    /// Re-send a failed message at the user's request
    pub async fn retry(&self, temp_id: Uuid) -> Result<Message> {
        match self.sends.retry(temp_id).await {
            Ok(message) => {
                self.on_sent(&message).await;
                Ok(message)
            }
            Err(e) => {
                self.report(&e, "Message not sent");
                Err(e)
            }
        }
    }

    /// Remove a failed message at the user's request
    pub async fn discard(&self, temp_id: Uuid) -> bool {
        self.sends.discard(temp_id).await
    }

    /// Existing conversation for `client_id`, created if there is none
    pub async fn open_conversation_for_client(
        &self,
        client_id: &str,
        process_type: Option<&str>,
    ) -> Result<Conversation> {
        if let Some(existing) = self.conversations.read().await.find_by_client(client_id) {
            return Ok(existing.clone());
        }

        let found = self
            .backend
            .fetch_conversations(Role::Client, client_id)
            .await
            .map_err(|e| {
                self.report(&e, "Could not look up conversation");
                e
            })?
            .into_iter()
            .next();

        let conversation = match found {
            Some(conversation) => conversation,
            None => {
                let created = self
                    .backend
                    .create_conversation(client_id, process_type)
                    .await
                    .map_err(|e| {
                        self.report(&e, "Could not start conversation");
                        e
                    })?;
                info!("Created conversation {} for {}", created.id, client_id);
                created
            }
        };

        self.adopt_conversation(conversation.clone()).await;
        Ok(conversation)
    }

    pub async fn mark_as_read(&self, conversation_id: &str) -> Result<()> {
        if self.notifications.mark_as_read(conversation_id).await? {
            self.emit_unread(conversation_id).await;
        }
        Ok(())
    }

    pub async fn clear_notifications(&self) -> Result<()> {
        let cleared: Vec<String> = self
            .notifications
            .snapshot()
            .await
            .unread
            .into_keys()
            .collect();
        self.notifications.clear_all().await?;
        for conversation_id in cleared {
            self.emit_unread(&conversation_id).await;
        }
        Ok(())
    }

    /// Reconstruct unread state for messages that arrived while logged out
    pub async fn run_backfill(&self) -> Result<BackfillOutcome> {
        match self.notifications.backfill(&*self.backend).await {
            Ok(outcome) => {
                if let BackfillOutcome::Merged { conversations, .. } = &outcome {
                    for conversation_id in conversations {
                        self.emit_unread(conversation_id).await;
                    }
                }
                Ok(outcome)
            }
            Err(e) => {
                self.report(&e, "Could not check for missed messages");
                Err(e)
            }
        }
    }

    /// Wait for the next bridge event and apply it
    pub async fn process_next_event(&self) -> Option<()> {
        let event = self.events.lock().await.recv().await?;
        self.handle_bridge_event(event).await;
        Some(())
    }

    /// Apply every bridge event already queued without waiting
    pub async fn drain_events(&self) -> usize {
        let mut handled = 0;
        loop {
            let next = self.events.lock().await.try_recv();
            match next {
                Ok(event) => {
                    self.handle_bridge_event(event).await;
                    handled += 1;
                }
                Err(_) => return handled,
            }
        }
    }

    /// Heartbeat work: re-attach dropped subscriptions, then fetch whatever
    /// they missed. Returns the scopes that came back.
    pub async fn maintain_connections(&self) -> Vec<SubscriptionScope> {
        let restored = self.bridge.lock().await.reconnect_due().await;
        if restored.is_empty() {
            return restored;
        }

        let active = self.active_conversation().await;
        if let Some(conversation_id) = active.as_deref() {
            if restored.contains(&SubscriptionScope::Conversation(conversation_id.to_string())) {
                self.resync_active(conversation_id).await;
            }
        }

        match self
            .notifications
            .catch_up(&*self.backend, active.as_deref())
            .await
        {
            Ok(conversations) => {
                for conversation_id in conversations {
                    self.emit_unread(&conversation_id).await;
                }
            }
            Err(e) => warn!("Notification catch-up failed: {}", e),
        }

        self.bus.notice(NoticeLevel::Info, "Live updates resumed");
        restored
    }

    /// Event loop: bridge events and heartbeat ticks until `shutdown` flips.
    /// While this runs it is the only consumer of bridge events.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut heartbeat = interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut events = self.events.lock().await;
        info!("Event loop started for {}", self.viewer.id);

        loop {
            tokio::select! {
                maybe_event = events.recv() => match maybe_event {
                    Some(event) => self.handle_bridge_event(event).await,
                    None => break,
                },
                _ = heartbeat.tick() => {
                    self.maintain_connections().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Event loop stopped for {}", self.viewer.id);
    }

    /// Detach everything and forget the open conversation
    pub async fn teardown(&self) {
        self.bridge.lock().await.detach_all();
        self.change_selection(None).await;
        self.messages.write().await.reset(None);
        debug!("Session of {} torn down", self.viewer.id);
    }

    /// Sign-out hook: record the backfill watermark, then tear down
    pub async fn logout(&self) -> Result<()> {
        let recorded = self.notifications.record_logout(Utc::now());
        self.teardown().await;
        if let Err(e) = &recorded {
            error!("Failed to record logout for {}: {}", self.viewer.id, e);
        }
        recorded
    }

    /// Route one event from the bridge into the stores
    pub async fn handle_bridge_event(&self, event: BridgeEvent) {
        if !self.bridge.lock().await.is_current(&event) {
            debug!(
                "Dropping event from stale subscription {} (generation {})",
                event.scope, event.generation
            );
            return;
        }

        match event.kind {
            BridgeEventKind::Closed => {
                if self.bridge.lock().await.mark_closed(&event) {
                    self.bus
                        .notice(NoticeLevel::Warning, "Live updates interrupted, reconnecting");
                }
            }
            BridgeEventKind::Inserted(message) => self.apply_inserted(message).await,
        }
    }

    async fn apply_inserted(&self, message: Message) {
        let conversation_id = message.conversation_id.clone();

        let known = {
            let mut store = self.conversations.write().await;
            if store.bump(&conversation_id, message.created_at) {
                self.bus.emit(PortalEvent::ConversationUpdated {
                    conversation_id: conversation_id.clone(),
                    updated_at: message.created_at,
                });
            }
            store.contains(&conversation_id)
        };
        if !known {
            info!("Activity in unknown conversation {}, refreshing list", conversation_id);
            if self.refresh_conversations().await.is_ok() {
                self.conversations
                    .write()
                    .await
                    .bump(&conversation_id, message.created_at);
            }
        }

        if self.is_active(&conversation_id).await {
            let sender_is_viewer = message.sender_id == self.viewer.id;
            let created_at = message.created_at;
            let message_id = message.id.clone();
            let outcome = self
                .messages
                .write()
                .await
                .apply_live(message, self.config.dedup_window);

            match outcome {
                LiveOutcome::Appended | LiveOutcome::ReplacedPending { .. } => {
                    if let LiveOutcome::ReplacedPending { temp_id } = outcome {
                        self.sends.forget(temp_id).await;
                    }
                    let mut scroll = self.scroll.lock().await;
                    if sender_is_viewer {
                        scroll.on_own_message_confirmed();
                    } else {
                        scroll.on_live_message();
                    }
                    drop(scroll);
                    self.bus.emit(PortalEvent::MessageInserted {
                        conversation_id: conversation_id.clone(),
                        message_id,
                    });
                }
                LiveOutcome::Duplicate | LiveOutcome::OtherConversation => {}
            }
            if let Err(e) = self.notifications.touch_last_seen(created_at).await {
                warn!("Failed to advance last seen: {}", e);
            }
        } else {
            match self.notifications.observe(&message).await {
                Ok(true) => self.emit_unread(&conversation_id).await,
                Ok(false) => {}
                Err(e) => warn!("Failed to record notification for {}: {}", message.id, e),
            }
        }
    }

    /// Merge the newest page after the conversation subscription came back
    async fn resync_active(&self, conversation_id: &str) {
        let (active, epoch) = self.current_selection().await;
        if active.as_deref() != Some(conversation_id) {
            return;
        }
        let recent = match self
            .backend
            .fetch_messages_page(conversation_id, self.config.page_size, None)
            .await
        {
            Ok(recent) => recent,
            Err(e) => {
                warn!("Resync of {} failed: {}", conversation_id, e);
                return;
            }
        };
        let added = {
            let mut messages = self.messages.write().await;
            if !self.is_selection(epoch) {
                return;
            }
            messages.merge_newer(recent, self.config.dedup_window)
        };
        if added > 0 {
            info!("Resync picked up {} messages in {}", added, conversation_id);
            self.scroll.lock().await.on_live_message();
        }
    }

    async fn on_sent(&self, message: &Message) {
        if self.is_active(&message.conversation_id).await {
            self.scroll.lock().await.on_own_message_confirmed();
        }
        let moved = self
            .conversations
            .write()
            .await
            .bump(&message.conversation_id, message.created_at);
        if moved {
            self.bus.emit(PortalEvent::ConversationUpdated {
                conversation_id: message.conversation_id.clone(),
                updated_at: message.created_at,
            });
        }
    }

    async fn adopt_conversation(&self, conversation: Conversation) {
        let outcome = self.conversations.write().await.upsert(conversation.clone());
        if outcome == Upsert::Inserted {
            if self.viewer.role == Role::Client {
                let owned = self.conversations.read().await.ids().into_iter().collect();
                self.notifications.set_owned_conversations(owned).await;
            }
            self.bus.emit(PortalEvent::ConversationInserted { conversation });
        }
    }

    /// Set the open conversation and start a new selection epoch
    async fn change_selection(&self, conversation_id: Option<&str>) -> u64 {
        let mut active = self.active.write().await;
        *active = conversation_id.map(str::to_string);
        self.selection.fetch_add(1, Ordering::SeqCst) + 1
    }

    async fn current_selection(&self) -> (Option<String>, u64) {
        let active = self.active.read().await;
        (active.clone(), self.selection.load(Ordering::SeqCst))
    }

    fn is_selection(&self, epoch: u64) -> bool {
        self.selection.load(Ordering::SeqCst) == epoch
    }

    async fn is_active(&self, conversation_id: &str) -> bool {
        self.active.read().await.as_deref() == Some(conversation_id)
    }

    async fn emit_unread(&self, conversation_id: &str) {
        let unread = self.notifications.unread_count(conversation_id).await;
        self.bus.emit(PortalEvent::UnreadChanged {
            conversation_id: conversation_id.to_string(),
            unread,
        });
    }

    /// User-visible feedback for a failed operation
    fn report(&self, err: &ChatError, context: &str) {
        let level = match err {
            ChatError::Validation(_) => NoticeLevel::Warning,
            _ => NoticeLevel::Error,
        };
        warn!("{}: {}", context, err);
        self.bus.notice(level, format!("{}: {}", context, err));
    }
}
