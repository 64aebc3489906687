//! streamwatch - live stream viewer client core.
//!
//! This crate provides the networking and orchestration core of a live
//! stream viewer: a Phoenix channel client carrying GraphQL operations, a
//! Janus HTTP signaling client, a receive-only WebRTC media connection, and
//! the watcher that switches between streams.
//!
//! # Architecture
//!
//! ```text
//! StreamWatcher ──► MediaConnection ──► NegotiationSession ──► SignalingClient (HTTP)
//!       │
//!       └─────────► StreamApi ──► ApiClient ──► graphql::Connection ──► Channel ──► Socket (WebSocket)
//! ```
//!
//! # Modules
//!
//! - [`phoenix`] - Socket, channels and wire frames
//! - [`graphql`] - Queries, mutations and subscriptions over a channel
//! - [`api`] - Lazily connecting GraphQL client
//! - [`janus`] - Gateway signaling
//! - [`media`] - Peer connection engine seam and media connection
//! - [`watch`] - Stream switching
//! - [`config`] - Configuration loading

// Library modules
pub mod api;
pub mod graphql;
pub mod janus;
pub mod media;
pub mod phoenix;
pub mod watch;
pub mod ws;

pub mod config;
pub mod constants;

// Re-export commonly used types
pub use config::Config;
pub use watch::{StreamWatcher, WatchEvent, WatchTarget};
