//! The wire protocol spoken between the daemon and an out-of-process
//! method plugin (spec.md §4.4/§6).
//!
//! spec.md fixes the verbs but leaves the encoding a plugin-side
//! choice; this crate picks newline-delimited JSON over the child's
//! stdin/stdout (one JSON object per line) because it is the simplest
//! framing a `tokio::process::Child` plus a line-buffered reader can
//! drive without a binary RPC crate, and it doubles as something a
//! developer can drive by hand while debugging a plugin.

use serde::{Deserialize, Serialize};
use sso_dictionary::{Dictionary, SsoError};

/// Requests sent from the daemon to the plugin process. Each is tagged
/// with a monotonically increasing integer, unique within the plugin
/// proxy, used to route the matching event back to the right session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "verb", rename_all = "snake_case")]
pub enum Request {
    RequestInitial {
        tag: u64,
        mechanism: String,
        params: Dictionary,
    },
    Request {
        tag: u64,
        mechanism: String,
        params: Dictionary,
    },
    Cancel {
        tag: u64,
    },
    UserActionFinished {
        tag: u64,
        data: Dictionary,
    },
    /// Routed by dialog id, not tag — the dialog id was communicated to
    /// the caller at `user_action_required` time.
    Refresh {
        dialog_id: String,
        data: Dictionary,
    },
}

impl Request {
    /// The request tag, when this variant carries one. `Refresh`
    /// carries a dialog id instead (see spec.md §4.4's "Key algorithm").
    pub fn tag(&self) -> Option<u64> {
        match self {
            Request::RequestInitial { tag, .. }
            | Request::Request { tag, .. }
            | Request::Cancel { tag }
            | Request::UserActionFinished { tag, .. } => Some(*tag),
            Request::Refresh { .. } => None,
        }
    }
}

/// Events emitted from the plugin process to the daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "verb", rename_all = "snake_case")]
pub enum Event {
    Response {
        tag: u64,
        data: Dictionary,
    },
    ResponseFinal {
        tag: u64,
        data: Dictionary,
    },
    Error {
        tag: u64,
        kind: String,
        message: String,
    },
    /// `dialog_id` becomes the routing key for a subsequent `Refresh`.
    UserActionRequired {
        tag: u64,
        dialog_id: String,
        data: Dictionary,
    },
    StatusChanged {
        tag: u64,
        status: String,
    },
    Refreshed {
        dialog_id: String,
        data: Dictionary,
    },
    Store {
        tag: u64,
        data: Dictionary,
    },
}

impl Event {
    pub fn tag(&self) -> Option<u64> {
        match self {
            Event::Response { tag, .. }
            | Event::ResponseFinal { tag, .. }
            | Event::Error { tag, .. }
            | Event::UserActionRequired { tag, .. }
            | Event::StatusChanged { tag, .. }
            | Event::Store { tag, .. } => Some(*tag),
            Event::Refreshed { .. } => None,
        }
    }

    /// True for the events that release a request's tag (spec.md
    /// §4.4: "Tags are freed on terminal events").
    pub fn is_terminal(&self) -> bool {
        matches!(self, Event::ResponseFinal { .. } | Event::Error { .. })
    }

    pub fn error(tag: u64, err: &SsoError) -> Self {
        Event::Error {
            tag,
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

/// Serializes a request as a single line (including the trailing
/// newline) ready to be written to the plugin's stdin.
pub fn encode_request(req: &Request) -> serde_json::Result<String> {
    let mut line = serde_json::to_string(req)?;
    line.push('\n');
    Ok(line)
}

/// Parses one line of plugin stdout into an [`Event`].
pub fn decode_event(line: &str) -> serde_json::Result<Event> {
    serde_json::from_str(line.trim_end())
}

/// Serializes an event (plugin-side helper, used by the reference
/// plugin binaries and by tests that speak the protocol directly).
pub fn encode_event(event: &Event) -> serde_json::Result<String> {
    let mut line = serde_json::to_string(event)?;
    line.push('\n');
    Ok(line)
}

/// Parses one line of daemon-to-plugin stdin (plugin-side helper).
pub fn decode_request(line: &str) -> serde_json::Result<Request> {
    serde_json::from_str(line.trim_end())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trips() {
        let req = Request::RequestInitial {
            tag: 1,
            mechanism: "password".into(),
            params: Dictionary::new(),
        };
        let line = encode_request(&req).unwrap();
        assert!(line.ends_with('\n'));
        let decoded = decode_request(&line).unwrap();
        assert_eq!(req, decoded);
    }

    #[test]
    fn event_round_trips() {
        let event = Event::UserActionRequired {
            tag: 7,
            dialog_id: "d1".into(),
            data: Dictionary::new(),
        };
        let line = encode_event(&event).unwrap();
        let decoded = decode_event(&line).unwrap();
        assert_eq!(event, decoded);
    }

    #[test]
    fn terminal_events_are_classified() {
        let final_event = Event::ResponseFinal {
            tag: 1,
            data: Dictionary::new(),
        };
        let error_event = Event::Error {
            tag: 1,
            kind: "Unknown".into(),
            message: "boom".into(),
        };
        let status_event = Event::StatusChanged {
            tag: 1,
            status: "working".into(),
        };
        assert!(final_event.is_terminal());
        assert!(error_event.is_terminal());
        assert!(!status_event.is_terminal());
    }
}
