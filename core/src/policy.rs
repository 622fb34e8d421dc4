/// Role-specific notification relevance rules
use crate::types::{Message, Role, Viewer};
use std::collections::HashSet;

/// Decides whether a message should raise an unread badge for a viewer
pub trait NotificationPolicy: Send + Sync {
    fn role(&self) -> Role;

    fn is_relevant(&self, viewer: &Viewer, message: &Message) -> bool;

    /// Refresh the set of conversations the viewer owns
    fn set_owned_conversations(&mut self, _ids: HashSet<String>) {}
}

/// Shared rule: someone else, writing from the other side of the portal
fn from_counterpart(viewer: &Viewer, message: &Message) -> bool {
    message.sender_id != viewer.id && message.sender_role == viewer.role.opposite()
}

/// Admins are notified by any client-authored message
#[derive(Debug, Default)]
pub struct AdminPolicy;

impl NotificationPolicy for AdminPolicy {
    fn role(&self) -> Role {
        Role::Admin
    }

    fn is_relevant(&self, viewer: &Viewer, message: &Message) -> bool {
        from_counterpart(viewer, message)
    }
}

/// Clients are notified by admin messages in their own conversations only
#[derive(Debug, Default)]
pub struct ClientPolicy {
    owned: HashSet<String>,
}

impl ClientPolicy {
    pub fn new(owned: HashSet<String>) -> Self {
        Self { owned }
    }
}

impl NotificationPolicy for ClientPolicy {
    fn role(&self) -> Role {
        Role::Client
    }

    fn is_relevant(&self, viewer: &Viewer, message: &Message) -> bool {
        from_counterpart(viewer, message) && self.owned.contains(&message.conversation_id)
    }

    fn set_owned_conversations(&mut self, ids: HashSet<String>) {
        self.owned = ids;
    }
}

/// Policy for a viewer's role
pub fn policy_for(viewer: &Viewer, owned: HashSet<String>) -> Box<dyn NotificationPolicy> {
    match viewer.role {
        Role::Admin => Box::new(AdminPolicy),
        Role::Client => Box::new(ClientPolicy::new(owned)),
    }
}
