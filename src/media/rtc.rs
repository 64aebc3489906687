//! [`PeerConnectionFactory`] backed by rustrtc.
//!
//! rustrtc negotiates unified-plan, bundled, rtcp-muxed DTLS-SRTP sessions
//! only, so the matching [`MediaConfig`] flags are satisfied as-is; the TCP
//! candidate policy is applied by the media connection when trickling.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use rustrtc::{
    PeerConnection, PeerConnectionEvent, RtcConfiguration, SdpType, SessionDescription,
};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use super::{
    InboundStream, LocalPeer, MediaConfig, MediaError, PeerConnectionFactory, PeerEvent,
    PeerState,
};
use crate::janus::IceCandidate;

/// Builds rustrtc peer connections. Must be used inside a tokio runtime.
#[derive(Debug, Clone, Copy, Default)]
pub struct RtcPeerFactory;

impl PeerConnectionFactory for RtcPeerFactory {
    fn create(&self, config: &MediaConfig) -> Result<Arc<dyn LocalPeer>, MediaError> {
        if !config.unified_plan || !config.max_bundle || !config.require_rtcp_mux {
            return Err(MediaError::Engine(
                "only unified-plan, max-bundle, rtcp-mux sessions are supported".to_string(),
            ));
        }

        let ice_servers = config
            .ice_servers
            .iter()
            .map(|s| rustrtc::IceServer {
                urls: s.urls.clone(),
                username: s.username.clone(),
                credential: s.credential.clone(),
                credential_type: rustrtc::IceCredentialType::Password,
            })
            .collect();
        let pc = PeerConnection::new(RtcConfiguration {
            ice_servers,
            ..Default::default()
        });

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let sdp_mid = Arc::new(Mutex::new(None));
        let pump = tokio::spawn(run_event_pump(pc.clone(), Arc::clone(&sdp_mid), events_tx));

        Ok(Arc::new(RtcPeer {
            pc,
            sdp_mid,
            events_rx: Mutex::new(Some(events_rx)),
            pump: Mutex::new(Some(pump)),
        }))
    }
}

struct RtcPeer {
    pc: PeerConnection,
    /// First `a=mid` of the remote offer, stamped on trickled candidates.
    sdp_mid: Arc<Mutex<Option<String>>>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<PeerEvent>>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for RtcPeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RtcPeer").finish_non_exhaustive()
    }
}

#[async_trait]
impl LocalPeer for RtcPeer {
    async fn set_remote_offer(&self, sdp: &str) -> Result<(), MediaError> {
        *self.sdp_mid.lock().unwrap_or_else(PoisonError::into_inner) = first_mid(sdp);

        let offer = SessionDescription::parse(SdpType::Offer, sdp)
            .map_err(|e| MediaError::SdpNegotiation(format!("invalid SDP offer: {e}")))?;
        self.pc
            .set_remote_description(offer)
            .await
            .map_err(|e| MediaError::SdpNegotiation(format!("failed to set remote description: {e}")))
    }

    async fn create_answer(&self) -> Result<String, MediaError> {
        let answer = self
            .pc
            .create_answer()
            .await
            .map_err(|e| MediaError::SdpNegotiation(format!("failed to create answer: {e}")))?;
        Ok(answer.to_sdp_string())
    }

    async fn set_local_answer(&self, sdp: &str) -> Result<(), MediaError> {
        let answer = SessionDescription::parse(SdpType::Answer, sdp)
            .map_err(|e| MediaError::SdpNegotiation(format!("invalid SDP answer: {e}")))?;
        self.pc
            .set_local_description(answer)
            .map_err(|e| MediaError::SdpNegotiation(format!("failed to set local description: {e}")))
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<PeerEvent>> {
        self.events_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn close(&self) {
        if let Some(pump) = self
            .pump
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            pump.abort();
            self.pc.close();
            log::debug!("[Media] Peer connection closed");
        }
    }
}

/// Translate rustrtc callbacks into [`PeerEvent`]s.
async fn run_event_pump(
    pc: PeerConnection,
    sdp_mid: Arc<Mutex<Option<String>>>,
    events_tx: mpsc::UnboundedSender<PeerEvent>,
) {
    let mut ice_rx = pc.subscribe_ice_candidates();
    let mut peer_state_rx = pc.subscribe_peer_state();
    let mut track_index = 0;
    let mut gathering = true;

    loop {
        let event = tokio::select! {
            candidate = ice_rx.recv(), if gathering => match candidate {
                Ok(candidate) => {
                    let sdp_mid = sdp_mid
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .clone()
                        .or_else(|| Some("0".to_string()));
                    PeerEvent::IceCandidate(IceCandidate {
                        candidate: format!("candidate:{}", candidate.to_sdp()),
                        sdp_mid,
                        sdp_m_line_index: Some(0),
                    })
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    log::warn!("[Media] Dropped {n} local candidates");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    gathering = false;
                    PeerEvent::GatheringComplete
                }
            },

            event = pc.recv() => match event {
                Some(PeerConnectionEvent::Track(track)) => {
                    let stream = InboundStream { index: track_index, track: Box::new(track) };
                    track_index += 1;
                    PeerEvent::Track(stream)
                }
                Some(PeerConnectionEvent::DataChannel(dc)) => {
                    log::debug!("[Media] Ignoring data channel {}", dc.label);
                    continue;
                }
                None => break,
            },

            changed = peer_state_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *peer_state_rx.borrow();
                log::info!("[Media] Peer state {state:?}");
                PeerEvent::StateChanged(match state {
                    rustrtc::PeerConnectionState::Connected => PeerState::Connected,
                    rustrtc::PeerConnectionState::Disconnected => PeerState::Disconnected,
                    rustrtc::PeerConnectionState::Failed => PeerState::Failed,
                    rustrtc::PeerConnectionState::Closed => PeerState::Closed,
                    _ => PeerState::Connecting,
                })
            }
        };

        if events_tx.send(event).is_err() {
            break;
        }
    }
    log::debug!("[Media] Event pump ended");
}

/// First media stream tag of an SDP.
fn first_mid(sdp: &str) -> Option<String> {
    sdp.lines()
        .find_map(|line| line.trim().strip_prefix("a=mid:"))
        .map(|mid| mid.trim().to_string())
}
