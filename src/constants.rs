//! Protocol constants and default intervals for streamwatch.
//!
//! This module centralizes all magic numbers and wire-level names so the
//! socket, signaling and orchestration layers agree on them.
//!
//! # Categories
//!
//! - **Phoenix**: socket protocol version, reserved topics and events
//! - **GraphQL**: control topic and event names
//! - **Janus**: long-poll parameters and request names
//! - **Timeouts**: heartbeat, push and HTTP timeouts
//! - **Orchestration**: poll and refresh intervals

use std::time::Duration;

// ============================================================================
// Phoenix socket protocol
// ============================================================================

/// Serializer version negotiated in the socket URL (`vsn=2.0.0` = array frames).
pub const PHOENIX_VSN: &str = "2.0.0";

/// Topic reserved for socket-level heartbeats.
pub const PHOENIX_TOPIC: &str = "phoenix";

/// Heartbeat event name.
pub const EVENT_HEARTBEAT: &str = "heartbeat";

/// Channel join request.
pub const EVENT_JOIN: &str = "phx_join";

/// Channel leave request.
pub const EVENT_LEAVE: &str = "phx_leave";

/// Reply to any push (`{status, response}`).
pub const EVENT_REPLY: &str = "phx_reply";

/// Server closed the channel.
pub const EVENT_CLOSE: &str = "phx_close";

/// Channel crashed server-side.
pub const EVENT_ERROR: &str = "phx_error";

/// Reply status that marks success.
pub const STATUS_OK: &str = "ok";

/// Capacity of the inbound frame broadcast.
///
/// A receiver that falls further behind than this loses frames and is told how
/// many it missed.
pub const INBOUND_BUFFER: usize = 256;

// ============================================================================
// GraphQL over channels
// ============================================================================

/// Fixed control topic that carries every GraphQL document.
pub const CONTROL_TOPIC: &str = "__absinthe__:control";

/// Push event carrying a `{query, variables}` document.
pub const EVENT_DOC: &str = "doc";

/// Push event cancelling a server-side subscription.
pub const EVENT_UNSUBSCRIBE: &str = "unsubscribe";

/// Server-push event carrying one subscription result.
pub const EVENT_SUBSCRIPTION_DATA: &str = "subscription:data";

// ============================================================================
// Janus signaling
// ============================================================================

/// Default Janus plugin used for watching a stream.
pub const DEFAULT_PLUGIN: &str = "janus.plugin.ftl";

/// Maximum events returned by one long-poll.
pub const LONG_POLL_MAX_EVENTS: u32 = 10;

/// Server-side hold time of one long-poll.
pub const LONG_POLL_TIMEOUT: Duration = Duration::from_secs(60);

/// Extra client-side slack on top of [`LONG_POLL_TIMEOUT`] before a poll is
/// treated as a transport failure.
pub const LONG_POLL_MARGIN: Duration = Duration::from_secs(5);

// ============================================================================
// Timeouts
// ============================================================================

/// Interval between socket heartbeats, and the deadline for each reply.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// How long a channel push waits for its reply.
pub const PUSH_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTP request timeout for non-poll signaling calls.
pub const HTTP_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// Orchestration
// ============================================================================

/// Delay between background long-polls of a started negotiation session.
pub const SESSION_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Interval of the stream metadata refresh loop.
///
/// Stands in for a server-push metadata feed.
pub const METADATA_REFRESH_INTERVAL: Duration = Duration::from_secs(30);
