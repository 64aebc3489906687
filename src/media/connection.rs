//! Media connection: one local peer bound to one negotiation session.
//!
//! # Lifecycle
//!
//! ```text
//! new()   ── builds the peer, starts the event loop
//! start() ── offer ─► set remote ─► create answer ─► set local ─► send answer
//! close() ── closes the peer, destroys the session, status Ended
//! ```
//!
//! The event loop trickles local candidates (TCP dropped unless enabled),
//! hands inbound tracks to the stream handler, and closes the connection
//! when the peer fails or the gateway hangs up or forgets the session.

// Rust guideline compliant 2026-02

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use super::{
    InboundStream, LocalPeer, MediaConfig, MediaError, MediaStatus, PeerConnectionFactory,
    PeerEvent, PeerState,
};
use crate::janus::{IceCandidate, NegotiationSession, SessionEvent};

type StreamHandler = Arc<dyn Fn(InboundStream) + Send + Sync>;

struct MediaInner {
    session: NegotiationSession,
    peer: Arc<dyn LocalPeer>,
    closed: AtomicBool,
    shutdown: CancellationToken,
    status_tx: watch::Sender<MediaStatus>,
}

impl MediaInner {
    /// Close everything once; `status` becomes the final status.
    fn terminate(&self, status: MediaStatus) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.cancel();
        self.peer.close();
        log::info!(
            "[Media] Closing session {} ({status:?})",
            self.session.session_id()
        );
        self.status_tx.send_replace(status);

        let session = self.session.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    // Failures are logged by destroy itself.
                    let _ = session.destroy().await;
                });
            }
            Err(_) => {
                log::warn!(
                    "[Media] No runtime; session {} left to expire",
                    session.session_id()
                );
            }
        }
    }
}

/// Receive-only media connection. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct MediaConnection {
    inner: Arc<MediaInner>,
}

impl fmt::Debug for MediaConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaConnection")
            .field("session", &self.inner.session.session_id())
            .field("status", &*self.inner.status_tx.borrow())
            .finish_non_exhaustive()
    }
}

impl MediaConnection {
    /// Build the peer for `session` and start routing its events.
    ///
    /// `on_stream` is called from the event loop for every inbound track.
    ///
    /// # Errors
    ///
    /// [`MediaError::Engine`] if the factory fails or the peer's events were
    /// already taken.
    pub fn new<F>(
        factory: &dyn PeerConnectionFactory,
        config: &MediaConfig,
        session: NegotiationSession,
        on_stream: F,
    ) -> Result<Self, MediaError>
    where
        F: Fn(InboundStream) + Send + Sync + 'static,
    {
        let peer = factory.create(config)?;
        let Some(peer_events) = peer.take_events() else {
            peer.close();
            return Err(MediaError::Engine("peer events already taken".to_string()));
        };
        let session_events = session.take_events();

        let (status_tx, _) = watch::channel(MediaStatus::Negotiating);
        let inner = Arc::new(MediaInner {
            session,
            peer,
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            status_tx,
        });

        tokio::spawn(run_event_loop(
            Arc::downgrade(&inner),
            inner.shutdown.clone(),
            peer_events,
            session_events,
            Arc::new(on_stream),
            config.tcp_candidates,
        ));

        Ok(Self { inner })
    }

    /// Negotiation session this connection uses.
    #[must_use]
    pub fn session(&self) -> &NegotiationSession {
        &self.inner.session
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> MediaStatus {
        self.inner.status_tx.borrow().clone()
    }

    /// Observe status transitions.
    #[must_use]
    pub fn watch_status(&self) -> watch::Receiver<MediaStatus> {
        self.inner.status_tx.subscribe()
    }

    /// Whether [`MediaConnection::close`] ran or the connection shut itself
    /// down.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Run offer/answer.
    ///
    /// A failure aborts this attempt only; the caller decides whether to
    /// close the connection.
    ///
    /// # Errors
    ///
    /// - [`MediaError::Closed`] if the connection is already closed
    /// - [`MediaError::Signaling`] if the offer or start request fails
    /// - [`MediaError::SdpNegotiation`] if a description cannot be applied
    pub async fn start(&self) -> Result<(), MediaError> {
        if self.is_closed() {
            return Err(MediaError::Closed);
        }
        let inner = &self.inner;
        let session_id = inner.session.session_id();

        let offer = inner.session.sdp_offer().await?;
        inner
            .peer
            .set_remote_offer(&offer)
            .await
            .inspect_err(|e| log::error!("[Media] Session {session_id}: {e}"))?;
        let answer = inner
            .peer
            .create_answer()
            .await
            .inspect_err(|e| log::error!("[Media] Session {session_id}: {e}"))?;
        inner
            .peer
            .set_local_answer(&answer)
            .await
            .inspect_err(|e| log::error!("[Media] Session {session_id}: {e}"))?;

        if self.is_closed() {
            return Err(MediaError::Closed);
        }
        inner.session.start(&answer).await?;
        log::info!("[Media] Session {session_id} negotiated");
        Ok(())
    }

    /// Close the peer and destroy the session. Idempotent.
    pub fn close(&self) {
        self.inner.terminate(MediaStatus::Ended);
    }
}

/// Await the next session event, or forever once there is none.
async fn next_session_event(
    rx: &mut Option<mpsc::UnboundedReceiver<SessionEvent>>,
) -> Option<SessionEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

fn is_tcp(candidate: &IceCandidate) -> bool {
    candidate.protocol().as_deref() == Some("tcp")
}

async fn run_event_loop(
    inner: Weak<MediaInner>,
    shutdown: CancellationToken,
    mut peer_events: mpsc::UnboundedReceiver<PeerEvent>,
    mut session_events: Option<mpsc::UnboundedReceiver<SessionEvent>>,
    on_stream: StreamHandler,
    tcp_candidates: bool,
) {
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,

            event = peer_events.recv() => {
                let Some(inner) = inner.upgrade() else { break };
                match event {
                    Some(PeerEvent::IceCandidate(candidate)) => {
                        if !tcp_candidates && is_tcp(&candidate) {
                            log::trace!("[Media] Skipping TCP candidate");
                            continue;
                        }
                        let session = inner.session.clone();
                        tokio::spawn(async move {
                            if let Err(e) = session.trickle_ice_candidate(&candidate).await {
                                log::warn!("[Media] Trickle failed: {e}");
                            }
                        });
                    }
                    Some(PeerEvent::GatheringComplete) => {
                        log::debug!("[Media] Local candidates complete");
                        let session = inner.session.clone();
                        tokio::spawn(async move {
                            if let Err(e) = session.trickle_complete().await {
                                log::warn!("[Media] End of candidates failed: {e}");
                            }
                        });
                    }
                    Some(PeerEvent::Track(stream)) => {
                        log::info!("[Media] Inbound track {}", stream.index);
                        on_stream(stream);
                    }
                    Some(PeerEvent::StateChanged(state)) => match state {
                        PeerState::Connected => {
                            inner.status_tx.send_if_modified(|status| {
                                if *status == MediaStatus::Negotiating {
                                    *status = MediaStatus::Connected;
                                    true
                                } else {
                                    false
                                }
                            });
                        }
                        PeerState::Failed => {
                            inner.terminate(MediaStatus::Failed("peer connection failed".to_string()));
                            break;
                        }
                        PeerState::Closed => {
                            inner.terminate(MediaStatus::Ended);
                            break;
                        }
                        PeerState::Connecting | PeerState::Disconnected => {}
                    },
                    None => {
                        inner.terminate(MediaStatus::Ended);
                        break;
                    }
                }
            }

            event = next_session_event(&mut session_events) => {
                let Some(inner) = inner.upgrade() else { break };
                match event {
                    Some(SessionEvent::Lost) => {
                        inner.terminate(MediaStatus::Failed("signaling session lost".to_string()));
                        break;
                    }
                    Some(SessionEvent::Hangup { reason }) => {
                        log::info!("[Media] Gateway hung up: {reason}");
                        inner.terminate(MediaStatus::Ended);
                        break;
                    }
                    Some(SessionEvent::SlowLink { uplink, lost }) => {
                        log::warn!("[Media] Slow link (uplink={uplink}, lost={lost})");
                    }
                    Some(event) => log::debug!("[Media] {event:?}"),
                    None => session_events = None,
                }
            }
        }
    }
    log::debug!("[Media] Event loop ended");
}
