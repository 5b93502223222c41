//! Serializes UI interactions across sessions: at most one UI request
//! is active system-wide, further requests queue FIFO (spec.md §4.5,
//! C7).

mod broker;
mod connection;

pub use broker::{BrokerEvent, CallerId, UiBroker};
pub use connection::{NullUiAgent, UiAgentConnection};
