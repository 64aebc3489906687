//! Phoenix v2 frame codec.
//!
//! Every frame on the wire is a JSON array:
//!
//! ```text
//! [join_ref, ref, topic, event, payload]
//! ```
//!
//! `join_ref` and `ref` are strings or `null`. Anything else is a
//! [`MessageError`] for that frame.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::constants::{EVENT_CLOSE, EVENT_ERROR, EVENT_REPLY, STATUS_OK};

/// Correlation id matching a push to its reply.
///
/// Issued by one [`RefGenerator`] per socket; encoded as a decimal string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ref(u64);

impl Ref {
    /// Numeric value of this ref.
    #[must_use]
    pub fn value(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for Ref {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotonic ref counter shared by everything on one socket.
#[derive(Debug)]
pub struct RefGenerator {
    next: AtomicU64,
}

impl Default for RefGenerator {
    fn default() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }
}

impl RefGenerator {
    /// Create a generator whose first ref is `1`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue the next ref. Strictly greater than every ref issued before.
    pub fn next_ref(&self) -> Ref {
        Ref(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

/// A frame that could not be decoded into the 5-tuple.
#[derive(Debug, thiserror::Error)]
#[error("malformed frame: {0}")]
pub struct MessageError(#[from] serde_json::Error);

/// One Phoenix frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Ref of the channel instance this frame belongs to.
    pub join_ref: Option<String>,
    /// Correlation ref of a push or reply.
    pub msg_ref: Option<String>,
    /// Topic the frame is routed on.
    pub topic: String,
    /// Event name.
    pub event: String,
    /// Arbitrary JSON payload.
    pub payload: Value,
}

/// Array form used on the wire.
#[derive(Serialize, Deserialize)]
struct WireFrame(Option<String>, Option<String>, String, String, Value);

impl Message {
    /// Build a frame.
    pub fn new(
        join_ref: Option<Ref>,
        msg_ref: Option<Ref>,
        topic: impl Into<String>,
        event: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            join_ref: join_ref.map(|r| r.to_string()),
            msg_ref: msg_ref.map(|r| r.to_string()),
            topic: topic.into(),
            event: event.into(),
            payload,
        }
    }

    /// Encode as a JSON array text frame.
    ///
    /// # Errors
    ///
    /// Fails only if the payload contains a value serde cannot represent.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&WireFrame(
            self.join_ref.clone(),
            self.msg_ref.clone(),
            self.topic.clone(),
            self.event.clone(),
            self.payload.clone(),
        ))
    }

    /// Decode a text frame.
    ///
    /// # Errors
    ///
    /// Returns [`MessageError`] unless the text is exactly a 5-element array
    /// with nullable string refs and string topic/event.
    pub fn decode(text: &str) -> Result<Self, MessageError> {
        let WireFrame(join_ref, msg_ref, topic, event, payload) = serde_json::from_str(text)?;
        Ok(Self {
            join_ref,
            msg_ref,
            topic,
            event,
            payload,
        })
    }

    /// Whether this frame carries `r` as its correlation ref.
    pub fn has_ref(&self, r: Ref) -> bool {
        self.msg_ref.as_deref() == Some(r.to_string().as_str())
    }

    /// Whether this frame belongs to the channel instance `join_ref`.
    pub fn has_join_ref(&self, join_ref: Ref) -> bool {
        self.join_ref.as_deref() == Some(join_ref.to_string().as_str())
    }

    /// Whether this is a `phx_reply`.
    pub fn is_reply(&self) -> bool {
        self.event == EVENT_REPLY
    }

    /// Whether this frame ends a channel (`phx_close` or `phx_error`).
    pub fn is_channel_end(&self) -> bool {
        self.event == EVENT_CLOSE || self.event == EVENT_ERROR
    }

    /// Split a `phx_reply` payload into `(status, response)`.
    ///
    /// Missing fields decode as an empty status and `null` response, which
    /// callers treat as a non-ok reply.
    pub fn reply(&self) -> (&str, &Value) {
        let status = self
            .payload
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let response = self.payload.get("response").unwrap_or(&Value::Null);
        (status, response)
    }

    /// Whether this is a reply with status `ok`.
    pub fn is_ok_reply(&self) -> bool {
        self.is_reply() && self.reply().0 == STATUS_OK
    }
}
