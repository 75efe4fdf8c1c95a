//! Event fan-out for alchemistral — the broadcast bus every component pushes
//! lifecycle events into, and the wire schema those events carry.

pub mod event_bus;
pub mod protocol;

pub use event_bus::EventBus;
pub use protocol::{Event, EventKind, ORCHESTRATOR_ID};
