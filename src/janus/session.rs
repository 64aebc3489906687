//! One negotiation with the gateway for one watch attempt.

// Rust guideline compliant 2026-02

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, OnceCell};
use tokio_util::sync::CancellationToken;

use super::types::JanusEvent;
use super::{IceCandidate, PluginId, SessionId, SignalingClient, SignalingError};
use crate::constants::{DEFAULT_PLUGIN, SESSION_POLL_INTERVAL};

/// Per-session settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSettings {
    /// Plugin to attach.
    pub plugin: String,
    /// Pause between long polls once the stream has started.
    pub poll_interval: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            plugin: DEFAULT_PLUGIN.to_string(),
            poll_interval: SESSION_POLL_INTERVAL,
        }
    }
}

/// Gateway events forwarded after [`NegotiationSession::start`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The gateway's peer connection is up.
    WebRtcUp,
    /// Media of `kind` started or stopped flowing.
    Media {
        /// `audio` or `video`.
        kind: String,
        /// Whether media is now being received.
        receiving: bool,
    },
    /// The gateway reported packet loss.
    SlowLink {
        /// Direction of the loss.
        uplink: bool,
        /// Lost packets.
        lost: u64,
    },
    /// The gateway closed the peer connection or detached the handle.
    Hangup {
        /// Reason given by the gateway.
        reason: String,
    },
    /// The gateway no longer knows the session. Polling has stopped.
    Lost,
}

impl SessionEvent {
    fn from_janus(event: &JanusEvent) -> Option<Self> {
        match event.janus.as_str() {
            "webrtcup" => Some(Self::WebRtcUp),
            "media" => Some(Self::Media {
                kind: event.media_type.clone().unwrap_or_default(),
                receiving: event.receiving.unwrap_or(false),
            }),
            "slowlink" => Some(Self::SlowLink {
                uplink: event.uplink.unwrap_or(false),
                lost: event.lost.unwrap_or(0),
            }),
            "hangup" => Some(Self::Hangup {
                reason: event.reason.clone().unwrap_or_default(),
            }),
            "detached" => Some(Self::Hangup {
                reason: "detached".to_string(),
            }),
            _ => None,
        }
    }
}

/// A session whose setup has not finished yet.
struct PendingSession {
    client: Option<SignalingClient>,
    session_id: SessionId,
}

impl PendingSession {
    fn disarm(&mut self) {
        self.client = None;
    }
}

impl Drop for PendingSession {
    fn drop(&mut self) {
        let Some(client) = self.client.take() else {
            return;
        };
        let session_id = self.session_id;
        log::info!("[Janus] Setup of session {session_id} abandoned; destroying");
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = client.destroy(session_id).await {
                        log::debug!("[Janus] Cleanup of session {session_id} failed: {e}");
                    }
                });
            }
            Err(_) => {
                log::warn!("[Janus] No runtime; session {session_id} left to expire");
            }
        }
    }
}

#[derive(Debug)]
struct SessionInner {
    client: SignalingClient,
    channel_id: u64,
    session_id: SessionId,
    plugin_id: PluginId,
    poll_interval: Duration,
    offer: OnceCell<String>,
    started: AtomicBool,
    destroyed: AtomicBool,
    shutdown: CancellationToken,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<SessionEvent>>>,
}

/// A created gateway session with the plugin attached and the watch request
/// sent. Cheap to clone; clones share state.
#[derive(Debug, Clone)]
pub struct NegotiationSession {
    inner: Arc<SessionInner>,
}

impl NegotiationSession {
    /// Create a session, attach the plugin and request `channel_id`.
    ///
    /// If attach or watch fails the session is destroyed before returning.
    /// If the returned future is dropped after the session exists, the
    /// session is destroyed in the background.
    ///
    /// # Errors
    ///
    /// The first [`SignalingError`] of the three steps.
    pub async fn create(
        client: SignalingClient,
        channel_id: u64,
        settings: &SessionSettings,
    ) -> Result<Self, SignalingError> {
        let session_id = client.create_session().await?;
        // Destroys the session if this future is dropped before setup ends.
        let mut pending = PendingSession {
            client: Some(client.clone()),
            session_id,
        };

        let attached = async {
            let plugin_id = client.attach_plugin(session_id, &settings.plugin).await?;
            client.watch(session_id, plugin_id, channel_id).await?;
            Ok::<_, SignalingError>(plugin_id)
        }
        .await;

        let plugin_id = match attached {
            Ok(plugin_id) => plugin_id,
            Err(e) => {
                log::warn!("[Janus] Setup of session {session_id} failed: {e}");
                if let Err(cleanup) = client.destroy(session_id).await {
                    log::debug!("[Janus] Cleanup of session {session_id} failed: {cleanup}");
                }
                pending.disarm();
                return Err(e);
            }
        };
        pending.disarm();

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Ok(Self {
            inner: Arc::new(SessionInner {
                client,
                channel_id,
                session_id,
                plugin_id,
                poll_interval: settings.poll_interval,
                offer: OnceCell::new(),
                started: AtomicBool::new(false),
                destroyed: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
                events_tx,
                events_rx: Mutex::new(Some(events_rx)),
            }),
        })
    }

    /// Gateway session id.
    #[must_use]
    pub fn session_id(&self) -> SessionId {
        self.inner.session_id
    }

    /// Plugin handle id.
    #[must_use]
    pub fn plugin_id(&self) -> PluginId {
        self.inner.plugin_id
    }

    /// Channel being watched.
    #[must_use]
    pub fn channel_id(&self) -> u64 {
        self.inner.channel_id
    }

    /// Whether [`NegotiationSession::destroy`] has been called.
    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::SeqCst)
    }

    /// Take the event receiver. Returns `None` after the first call.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<SessionEvent>> {
        self.inner
            .events_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// The gateway's SDP offer.
    ///
    /// Polls on first call; later calls return the same offer.
    ///
    /// # Errors
    ///
    /// [`SignalingError::Cancelled`] if the session is destroyed while
    /// waiting, or the poll error that ended the wait.
    pub async fn sdp_offer(&self) -> Result<String, SignalingError> {
        let inner = &self.inner;
        inner
            .offer
            .get_or_try_init(|| async {
                tokio::select! {
                    () = inner.shutdown.cancelled() => Err(SignalingError::Cancelled),
                    offer = inner.client.wait_for_sdp_offer(inner.session_id) => offer,
                }
            })
            .await
            .cloned()
    }

    /// Send the local answer and start forwarding gateway events.
    ///
    /// # Errors
    ///
    /// [`SignalingError::Cancelled`] after destroy, or the error of the
    /// `start` request.
    pub async fn start(&self, answer_sdp: &str) -> Result<(), SignalingError> {
        let inner = &self.inner;
        if inner.shutdown.is_cancelled() {
            return Err(SignalingError::Cancelled);
        }

        tokio::select! {
            () = inner.shutdown.cancelled() => return Err(SignalingError::Cancelled),
            started = inner.client.start(inner.session_id, inner.plugin_id, answer_sdp) => started?,
        }

        if !inner.started.swap(true, Ordering::SeqCst) {
            tokio::spawn(run_poll_loop(
                inner.client.clone(),
                inner.session_id,
                inner.poll_interval,
                inner.events_tx.clone(),
                inner.shutdown.clone(),
            ));
        }
        Ok(())
    }

    /// Trickle one local candidate.
    ///
    /// # Errors
    ///
    /// [`SignalingError::Cancelled`] after destroy, or the request error.
    pub async fn trickle_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), SignalingError> {
        let inner = &self.inner;
        if inner.shutdown.is_cancelled() {
            return Err(SignalingError::Cancelled);
        }
        inner
            .client
            .trickle_ice_candidate(inner.session_id, inner.plugin_id, candidate)
            .await
    }

    /// Signal end of local candidates.
    ///
    /// # Errors
    ///
    /// [`SignalingError::Cancelled`] after destroy, or the request error.
    pub async fn trickle_complete(&self) -> Result<(), SignalingError> {
        let inner = &self.inner;
        if inner.shutdown.is_cancelled() {
            return Err(SignalingError::Cancelled);
        }
        inner
            .client
            .trickle_complete(inner.session_id, inner.plugin_id)
            .await
    }

    /// Stop polling and destroy the session. Only the first call does
    /// anything; a session the gateway already forgot counts as destroyed.
    ///
    /// # Errors
    ///
    /// The destroy request's transport or protocol error.
    pub async fn destroy(&self) -> Result<(), SignalingError> {
        let inner = &self.inner;
        if inner.destroyed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        inner.shutdown.cancel();

        match inner.client.destroy(inner.session_id).await {
            Ok(()) => Ok(()),
            Err(SignalingError::NoSuchSession(id)) => {
                log::debug!("[Janus] Session {id} already gone");
                Ok(())
            }
            Err(e) => {
                log::warn!("[Janus] Destroy of session {} failed: {e}", inner.session_id);
                Err(e)
            }
        }
    }
}

/// Long-poll until cancelled or the gateway forgets the session.
async fn run_poll_loop(
    client: SignalingClient,
    session: SessionId,
    interval: Duration,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    shutdown: CancellationToken,
) {
    log::debug!("[Janus] Polling session {session}");
    loop {
        let polled = tokio::select! {
            () = shutdown.cancelled() => break,
            polled = client.long_poll_session(session) => polled,
        };

        match polled {
            Ok(events) => {
                for event in events.iter().filter_map(SessionEvent::from_janus) {
                    log::debug!("[Janus] Session {session}: {event:?}");
                    let _ = events_tx.send(event);
                }
            }
            Err(SignalingError::NoSuchSession(_)) => {
                log::warn!("[Janus] Session {session} lost");
                let _ = events_tx.send(SessionEvent::Lost);
                break;
            }
            Err(e) => {
                log::warn!("[Janus] Poll on session {session} failed: {e}");
            }
        }

        tokio::select! {
            () = shutdown.cancelled() => break,
            () = tokio::time::sleep(interval) => {}
        }
    }
    log::debug!("[Janus] Stopped polling session {session}");
}
