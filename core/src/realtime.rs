/// Realtime bridge: push subscriptions -> typed event queue.
///
/// One subscription per active conversation, plus (for admins) one global
/// subscription tied to the session. Each attachment gets a generation number;
/// events from a generation that is no longer current are dropped at dispatch,
/// so nothing from a detached conversation can reach the stores.
use crate::backend::MessagingBackend;
use crate::error::Result;
use crate::types::{Message, SubscriptionScope};
use crate::utils::event_bus::{EventBus, PortalEvent};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Lifecycle of one subscription: Detached -> Attaching -> Attached -> Detached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionState {
    Detached,
    Attaching,
    Attached,
}

/// Exponential backoff between re-attach attempts
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl ReconnectPolicy {
    /// Delay before the next attempt after `failures` consecutive failures
    pub fn delay_for(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let factor = 2u32.saturating_pow(failures.saturating_sub(1).min(16));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
pub enum BridgeEventKind {
    /// A message was inserted server-side
    Inserted(Message),
    /// The push channel closed underneath us
    Closed,
}

#[derive(Debug, Clone)]
pub struct BridgeEvent {
    pub scope: SubscriptionScope,
    pub generation: u64,
    pub kind: BridgeEventKind,
}

struct Attachment {
    scope: SubscriptionScope,
    generation: u64,
    state: SubscriptionState,
    task: Option<JoinHandle<()>>,
    failures: u32,
    retry_at: Option<Instant>,
}

impl Attachment {
    fn new(scope: SubscriptionScope, generation: u64) -> Self {
        Self {
            scope,
            generation,
            state: SubscriptionState::Detached,
            task: None,
            failures: 0,
            retry_at: None,
        }
    }

    fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for Attachment {
    fn drop(&mut self) {
        self.stop();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Conversation,
    Global,
}

pub struct RealtimeBridge<B> {
    backend: Arc<B>,
    bus: EventBus,
    tx: mpsc::UnboundedSender<BridgeEvent>,
    conversation: Option<Attachment>,
    global: Option<Attachment>,
    next_generation: u64,
    reconnect: ReconnectPolicy,
}

impl<B: MessagingBackend> RealtimeBridge<B> {
    /// Create the bridge and the receiving end of its event queue
    pub fn new(
        backend: Arc<B>,
        bus: EventBus,
        reconnect: ReconnectPolicy,
    ) -> (Self, mpsc::UnboundedReceiver<BridgeEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let bridge = Self {
            backend,
            bus,
            tx,
            conversation: None,
            global: None,
            next_generation: 0,
            reconnect,
        };
        (bridge, rx)
    }

    pub fn conversation_state(&self) -> SubscriptionState {
        self.conversation
            .as_ref()
            .map_or(SubscriptionState::Detached, |a| a.state)
    }

    pub fn global_state(&self) -> SubscriptionState {
        self.global
            .as_ref()
            .map_or(SubscriptionState::Detached, |a| a.state)
    }

    /// Conversation the bridge is (or wants to be) attached to
    pub fn attached_conversation(&self) -> Option<&str> {
        match self.conversation.as_ref().map(|a| &a.scope) {
            Some(SubscriptionScope::Conversation(id)) => Some(id),
            _ => None,
        }
    }

    /// Subscribe to one conversation, detaching any previous one first
    pub async fn attach(&mut self, conversation_id: &str) -> Result<()> {
        if self.attached_conversation() == Some(conversation_id)
            && self.conversation_state() != SubscriptionState::Detached
        {
            return Ok(());
        }
        self.detach();

        let scope = SubscriptionScope::Conversation(conversation_id.to_string());
        let generation = self.bump_generation();
        self.conversation = Some(Attachment::new(scope, generation));
        self.open(Slot::Conversation).await
    }

    /// Tear down the conversation subscription; takes effect before returning
    pub fn detach(&mut self) {
        if let Some(attachment) = self.conversation.take() {
            debug!("Detaching {}", attachment.scope);
            self.announce(&attachment.scope, SubscriptionState::Detached);
        }
    }

    /// Subscribe to inserts across all conversations (admin session)
    pub async fn attach_global(&mut self) -> Result<()> {
        if self.global_state() != SubscriptionState::Detached {
            return Ok(());
        }
        let generation = self.bump_generation();
        self.global = Some(Attachment::new(SubscriptionScope::All, generation));
        self.open(Slot::Global).await
    }

    pub fn detach_global(&mut self) {
        if let Some(attachment) = self.global.take() {
            debug!("Detaching {}", attachment.scope);
            self.announce(&attachment.scope, SubscriptionState::Detached);
        }
    }

    pub fn detach_all(&mut self) {
        self.detach();
        self.detach_global();
    }

    /// Whether the event came from an attachment that is still wanted
    pub fn is_current(&self, event: &BridgeEvent) -> bool {
        [&self.conversation, &self.global]
            .into_iter()
            .flatten()
            .any(|a| a.generation == event.generation && a.scope == event.scope)
    }

    /// Record that the push channel behind `event` closed.
    /// Returns false for events of a stale generation.
    pub fn mark_closed(&mut self, event: &BridgeEvent) -> bool {
        if !self.is_current(event) {
            return false;
        }
        let slot = match event.scope {
            SubscriptionScope::All => Slot::Global,
            SubscriptionScope::Conversation(_) => Slot::Conversation,
        };
        let scope = event.scope.clone();
        if let Some(attachment) = self.slot_mut(slot) {
            attachment.stop();
            attachment.state = SubscriptionState::Detached;
            attachment.failures = 0;
            attachment.retry_at = Some(Instant::now());
        }
        warn!("Push channel {} closed, will re-attach", scope);
        self.announce(&scope, SubscriptionState::Detached);
        true
    }

    /// Re-attach every wanted subscription whose backoff elapsed.
    /// Returns the scopes that came back.
    pub async fn reconnect_due(&mut self) -> Vec<SubscriptionScope> {
        let now = Instant::now();
        let mut restored = Vec::new();

        for slot in [Slot::Conversation, Slot::Global] {
            let due = self.slot_mut(slot).is_some_and(|a| {
                a.state == SubscriptionState::Detached && a.retry_at.map_or(true, |at| at <= now)
            });
            if !due {
                continue;
            }

            let generation = self.bump_generation();
            let Some(attachment) = self.slot_mut(slot) else {
                continue;
            };
            attachment.generation = generation;
            let scope = attachment.scope.clone();
            info!("Re-attaching {}", scope);

            if self.open(slot).await.is_ok() {
                restored.push(scope);
            }
        }
        restored
    }

    fn bump_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    fn slot_mut(&mut self, slot: Slot) -> Option<&mut Attachment> {
        match slot {
            Slot::Conversation => self.conversation.as_mut(),
            Slot::Global => self.global.as_mut(),
        }
    }

    fn announce(&self, scope: &SubscriptionScope, state: SubscriptionState) {
        self.bus.emit(PortalEvent::SubscriptionChanged {
            scope: scope.clone(),
            state,
        });
    }

    /// Subscribe the attachment in `slot`; on failure it stays wanted but Detached
    async fn open(&mut self, slot: Slot) -> Result<()> {
        let (scope, generation) = match self.slot_mut(slot) {
            Some(attachment) => {
                attachment.state = SubscriptionState::Attaching;
                (attachment.scope.clone(), attachment.generation)
            }
            None => return Ok(()),
        };
        self.announce(&scope, SubscriptionState::Attaching);

        let result = self.backend.subscribe(scope.clone()).await;
        let reconnect = self.reconnect.clone();
        let tx = self.tx.clone();

        match result {
            Ok(mut subscription) => {
                let task_scope = scope.clone();
                let task = tokio::spawn(async move {
                    while let Some(message) = subscription.recv().await {
                        let event = BridgeEvent {
                            scope: task_scope.clone(),
                            generation,
                            kind: BridgeEventKind::Inserted(message),
                        };
                        if tx.send(event).is_err() {
                            return;
                        }
                    }
                    let _ = tx.send(BridgeEvent {
                        scope: task_scope,
                        generation,
                        kind: BridgeEventKind::Closed,
                    });
                });

                if let Some(attachment) = self.slot_mut(slot) {
                    attachment.stop();
                    attachment.task = Some(task);
                    attachment.state = SubscriptionState::Attached;
                    attachment.failures = 0;
                    attachment.retry_at = None;
                }
                info!("Attached {} (generation {})", scope, generation);
                self.announce(&scope, SubscriptionState::Attached);
                Ok(())
            }
            Err(e) => {
                if let Some(attachment) = self.slot_mut(slot) {
                    attachment.state = SubscriptionState::Detached;
                    attachment.failures += 1;
                    let delay = reconnect.delay_for(attachment.failures);
                    attachment.retry_at = Some(Instant::now() + delay);
                    warn!(
                        "Subscribe to {} failed ({}), retry in {:?}",
                        scope, e, delay
                    );
                }
                self.announce(&scope, SubscriptionState::Detached);
                Err(e)
            }
        }
    }
}
