//! Janus gateway signaling over its HTTP API.
//!
//! # Architecture
//!
//! ```text
//! SignalingClient (stateless, one HTTP request per call)
//!     create_session ─► attach_plugin ─► watch ─► long_poll ... ─► start ─► trickle ─► destroy
//!
//! NegotiationSession (one per watch attempt)
//!     ├── create()       ── session + plugin handle + watch, cleaned up on failure
//!     ├── sdp_offer()    ── long-polls until the gateway's offer arrives, memoized
//!     ├── start(answer)  ── sends the answer, then keeps long-polling
//!     │                     and forwards SessionEvents
//!     └── destroy()      ── stops polling, destroys the session, idempotent
//! ```
//!
//! # Errors
//!
//! Every call fails with a [`SignalingError`]:
//!
//! - [`SignalingError::Transport`] for network failures, timeouts, non-2xx
//!   statuses and undecodable bodies
//! - [`SignalingError::Protocol`] when the gateway answers with an `error`
//! - [`SignalingError::NoSuchSession`] for a 404 on a session-scoped call

pub mod client;
pub mod session;
pub mod types;

use std::fmt;

use serde::{Deserialize, Serialize};

/// Gateway session id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Plugin handle id within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PluginId(pub u64);

impl fmt::Display for PluginId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Local ICE candidate as trickled to the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// `candidate:...` attribute line.
    pub candidate: String,
    /// Media stream identification tag.
    #[serde(rename = "sdpMid")]
    pub sdp_mid: Option<String>,
    /// Index of the media description.
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_m_line_index: Option<u16>,
}

impl IceCandidate {
    /// Transport protocol (`udp`/`tcp`) from the candidate line, lowercase.
    #[must_use]
    pub fn protocol(&self) -> Option<String> {
        // candidate:<foundation> <component> <transport> <priority> <ip> <port> typ <type>
        self.candidate
            .split_whitespace()
            .nth(2)
            .map(str::to_ascii_lowercase)
    }
}

/// Errors from the signaling layer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignalingError {
    /// Network failure, timeout, non-2xx status or malformed body.
    #[error("signaling transport error: {0}")]
    Transport(String),
    /// The gateway reported an error.
    #[error("gateway error {code}: {reason}")]
    Protocol {
        /// Janus error code.
        code: i64,
        /// Janus error text.
        reason: String,
    },
    /// The gateway answered with a transaction id other than ours.
    #[error("transaction mismatch: sent {sent}, got {received}")]
    TransactionMismatch {
        /// Transaction we sent.
        sent: String,
        /// Transaction in the response.
        received: String,
    },
    /// The session no longer exists on the gateway.
    #[error("no such session {0}")]
    NoSuchSession(SessionId),
    /// The operation was abandoned because the session was destroyed.
    #[error("signaling cancelled")]
    Cancelled,
}

// Re-exports
pub use client::SignalingClient;
pub use session::{NegotiationSession, SessionEvent, SessionSettings};
pub use types::{JanusEvent, Jsep};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ice_candidate_wire_names() {
        let candidate = IceCandidate {
            candidate: "candidate:1 1 UDP 2130706431 10.0.0.1 5000 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_m_line_index: Some(0),
        };
        let value = serde_json::to_value(&candidate).unwrap();
        assert_eq!(value["sdpMid"], "0");
        assert_eq!(value["sdpMLineIndex"], 0);
        assert_eq!(candidate.protocol().as_deref(), Some("udp"));
    }

    #[test]
    fn test_ice_candidate_protocol_tcp() {
        let candidate = IceCandidate {
            candidate: "candidate:2 1 tcp 1518280447 10.0.0.1 9 typ host tcptype active".into(),
            sdp_mid: None,
            sdp_m_line_index: None,
        };
        assert_eq!(candidate.protocol().as_deref(), Some("tcp"));
    }

    #[test]
    fn test_ids_are_transparent() {
        assert_eq!(serde_json::to_string(&SessionId(42)).unwrap(), "42");
        assert_eq!(SessionId(1_234_567_890_123_456_789).to_string(), "1234567890123456789");
        assert_eq!(PluginId(7).to_string(), "7");
    }
}
