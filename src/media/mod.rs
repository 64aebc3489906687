//! Receive-only WebRTC media.
//!
//! A [`MediaConnection`] binds one local peer connection to one
//! [`NegotiationSession`](crate::janus::NegotiationSession): the gateway's
//! offer is applied, an answer is sent back, local candidates are trickled,
//! and inbound tracks are handed to the caller.
//!
//! The WebRTC engine sits behind [`PeerConnectionFactory`] and [`LocalPeer`]
//! so the negotiation logic runs unchanged against [`rtc::RtcPeerFactory`]
//! or a test double.

pub mod connection;
pub mod rtc;

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::janus::{IceCandidate, SignalingError};

/// One STUN/TURN server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    /// `stun:`/`turn:` URLs.
    pub urls: Vec<String>,
    /// TURN username.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// TURN password.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

/// Peer connection policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaConfig {
    /// STUN/TURN servers.
    pub ice_servers: Vec<IceServer>,
    /// Whether TCP candidates are trickled. Off: they are dropped locally.
    pub tcp_candidates: bool,
    /// Keep gathering candidates after the initial set.
    pub continual_gathering: bool,
    /// Unified-plan SDP semantics.
    pub unified_plan: bool,
    /// Require RTCP multiplexing.
    pub require_rtcp_mux: bool,
    /// Bundle every media section on one transport.
    pub max_bundle: bool,
    /// Require DTLS-SRTP key agreement.
    pub require_dtls_srtp: bool,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            ice_servers: Vec::new(),
            tcp_candidates: false,
            continual_gathering: true,
            unified_plan: true,
            require_rtcp_mux: true,
            max_bundle: true,
            require_dtls_srtp: true,
        }
    }
}

/// Local peer connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// Negotiating or gathering.
    Connecting,
    /// Transport established.
    Connected,
    /// Transport interrupted; may recover.
    Disconnected,
    /// Transport failed for good.
    Failed,
    /// Closed.
    Closed,
}

/// Inbound media track, opaque to this crate.
pub struct InboundStream {
    /// Order in which the track arrived on its connection, from 0.
    pub index: usize,
    /// Engine-specific track handle.
    pub track: Box<dyn Any + Send>,
}

impl fmt::Debug for InboundStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundStream")
            .field("index", &self.index)
            .finish_non_exhaustive()
    }
}

/// Event from a [`LocalPeer`].
#[derive(Debug)]
pub enum PeerEvent {
    /// A local candidate was gathered.
    IceCandidate(IceCandidate),
    /// No more local candidates will be gathered.
    GatheringComplete,
    /// A remote track arrived.
    Track(InboundStream),
    /// The peer connection changed state.
    StateChanged(PeerState),
}

/// Errors from the media layer.
#[derive(Debug, thiserror::Error)]
pub enum MediaError {
    /// Signaling failed.
    #[error(transparent)]
    Signaling(#[from] SignalingError),
    /// Applying or producing a session description failed.
    #[error("SDP negotiation failed: {0}")]
    SdpNegotiation(String),
    /// The WebRTC engine failed.
    #[error("media engine error: {0}")]
    Engine(String),
    /// The connection is closed.
    #[error("media connection closed")]
    Closed,
}

/// Overall status of a [`MediaConnection`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaStatus {
    /// Offer/answer in progress.
    Negotiating,
    /// Media transport established.
    Connected,
    /// Closed locally or hung up by the gateway.
    Ended,
    /// Gave up.
    Failed(String),
}

impl MediaStatus {
    /// Whether no further transitions happen.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ended | Self::Failed(_))
    }
}

/// One local peer connection.
#[async_trait]
pub trait LocalPeer: Send + Sync + fmt::Debug {
    /// Apply the remote offer.
    async fn set_remote_offer(&self, sdp: &str) -> Result<(), MediaError>;

    /// Produce an answer to the applied offer.
    async fn create_answer(&self) -> Result<String, MediaError>;

    /// Apply our own answer.
    async fn set_local_answer(&self, sdp: &str) -> Result<(), MediaError>;

    /// Take the event receiver. Returns `None` after the first call.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<PeerEvent>>;

    /// Close the connection. Idempotent.
    fn close(&self);
}

/// Builds [`LocalPeer`]s.
pub trait PeerConnectionFactory: Send + Sync + fmt::Debug {
    /// Build a peer connection with `config`.
    ///
    /// # Errors
    ///
    /// [`MediaError::Engine`] if the engine refuses the configuration.
    fn create(&self, config: &MediaConfig) -> Result<Arc<dyn LocalPeer>, MediaError>;
}

// Re-exports
pub use connection::MediaConnection;
pub use rtc::RtcPeerFactory;
