//! Per-session progress events and their fan-out to observers.

pub mod bus;
pub mod event;
pub mod reaper;

pub use bus::{validate_session_id, Drained, SessionEventBus, SessionSummary, Subscription};
pub use event::{Event, EventKind};
pub use reaper::SessionReaper;
