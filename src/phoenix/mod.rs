//! Phoenix channel protocol client.
//!
//! One [`Socket`] carries any number of [`Channel`]s, each a topic with its
//! own join ref. Requests are correlated to replies purely by [`Ref`].
//!
//! # Architecture
//!
//! ```text
//! Socket (one WebSocket)
//!     ├── connection task   ── decodes frames, broadcasts them to subscribers
//!     ├── heartbeat task    ── "heartbeat" on "phoenix" every interval
//!     └── RefGenerator      ── shared by every channel on the socket
//!
//! Channel (topic, join_ref)
//!     ├── join()  ── phx_join, wait for reply/close
//!     ├── push()  ── event with fresh ref, wait for matching reply/close
//!     └── leave() ── phx_leave
//! ```
//!
//! # Usage
//!
//! ```ignore
//! let socket = Socket::open("wss://example.com/socket/websocket", SocketOptions::default()).await?;
//! let channel = socket.channel("room:lobby");
//! channel.join(json!({})).await?;
//! let reply = channel.push("new_msg", json!({"body": "hi"})).await?;
//! ```

pub mod channel;
pub mod message;
pub mod socket;

use serde_json::Value;

/// Errors that can occur during socket and channel operations.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// Failed to establish the WebSocket.
    #[error("socket connection failed: {0}")]
    Connect(String),
    /// The socket is closed; nothing more can be sent or received.
    #[error("socket closed")]
    Closed,
    /// Push on a channel that has not joined (or has left).
    #[error("channel {topic} is not joined")]
    NotJoined {
        /// Channel topic.
        topic: String,
    },
    /// No reply arrived within the push timeout.
    #[error("timed out waiting for reply to {event} on {topic}")]
    Timeout {
        /// Channel topic.
        topic: String,
        /// Event that was pushed.
        event: String,
    },
    /// The server answered the join with a non-ok status.
    #[error("join of {topic} rejected: {response}")]
    JoinRejected {
        /// Channel topic.
        topic: String,
        /// Reply response payload.
        response: Value,
    },
    /// The server answered a push with a non-ok status.
    #[error("push {event} rejected with status {status:?}: {response}")]
    PushRejected {
        /// Event that was pushed.
        event: String,
        /// Reply status (usually `"error"`).
        status: String,
        /// Reply response payload.
        response: Value,
    },
    /// The channel was closed or crashed server-side while a join or push
    /// was waiting.
    #[error("channel {topic} closed by server")]
    ChannelClosed {
        /// Channel topic.
        topic: String,
    },
    /// An outgoing frame could not be serialized.
    #[error("failed to encode frame: {0}")]
    Encode(#[from] serde_json::Error),
}

// Re-exports
pub use channel::Channel;
pub use message::{Message, MessageError, Ref, RefGenerator};
pub use socket::{Socket, SocketOptions, SocketState};
