/// Local utilities shared by the stores
pub mod event_bus;

pub use event_bus::{EventBus, NoticeLevel, PortalEvent};
