//! Duplex Phoenix socket.
//!
//! Owns one WebSocket and two background tasks:
//!
//! - the connection task, which writes queued frames, decodes inbound text
//!   frames and broadcasts them to every current subscriber;
//! - the heartbeat task, which pushes `heartbeat` on the `phoenix` topic every
//!   interval and closes the socket as [`SocketState::Unknown`] when a
//!   heartbeat goes unacknowledged.
//!
//! Subscribers only see frames that arrive after they subscribe. A frame that
//! fails to decode is logged and dropped; the socket keeps running.

// Rust guideline compliant 2026-02

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde_json::json;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;

use super::channel::Channel;
use super::message::{Message, Ref, RefGenerator};
use super::ChannelError;
use crate::constants::{
    EVENT_HEARTBEAT, HEARTBEAT_INTERVAL, INBOUND_BUFFER, PHOENIX_TOPIC, PHOENIX_VSN, PUSH_TIMEOUT,
};
use crate::ws::{self, WsMessage, WsReader, WsWriter};

/// Lifecycle of a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    /// Constructed, not yet connecting.
    Created,
    /// WebSocket handshake in progress.
    Connecting,
    /// Connected; frames flow.
    Open,
    /// Local close requested, close frame being sent.
    Closing,
    /// Closed cleanly (locally or by the server).
    Closed,
    /// Closed after a protocol failure (missed heartbeat).
    Unknown,
}

/// Tunables for a socket.
#[derive(Debug, Clone)]
pub struct SocketOptions {
    /// Interval between heartbeats; also the deadline for each heartbeat reply.
    pub heartbeat_interval: Duration,
    /// How long a channel join/push/leave waits for its reply.
    pub push_timeout: Duration,
    /// Extra query parameters sent with the handshake (e.g. `token`).
    pub params: Vec<(String, String)>,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            heartbeat_interval: HEARTBEAT_INTERVAL,
            push_timeout: PUSH_TIMEOUT,
            params: Vec::new(),
        }
    }
}

impl SocketOptions {
    /// Add a handshake query parameter.
    #[must_use]
    pub fn param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((name.into(), value.into()));
        self
    }
}

/// State shared between the socket handle and its background tasks.
#[derive(Debug)]
struct Shared {
    refs: RefGenerator,
    outgoing_tx: mpsc::UnboundedSender<String>,
    /// Taken when the connection ends so every receiver sees end-of-stream.
    inbound: Mutex<Option<broadcast::Sender<Message>>>,
    state_tx: watch::Sender<SocketState>,
    shutdown: CancellationToken,
}

impl Shared {
    fn subscribe(&self) -> Option<broadcast::Receiver<Message>> {
        self.inbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(broadcast::Sender::subscribe)
    }

    fn broadcast(&self, msg: Message) {
        if let Some(tx) = self
            .inbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            // No subscribers is fine: nobody is waiting for this frame.
            let _ = tx.send(msg);
        }
    }

    fn send_text(&self, text: String) -> Result<(), ChannelError> {
        if *self.state_tx.borrow() != SocketState::Open {
            return Err(ChannelError::Closed);
        }
        self.outgoing_tx
            .send(text)
            .map_err(|mpsc::error::SendError(_)| ChannelError::Closed)
    }

    /// Mark the socket failed and stop every task.
    fn fail(&self) {
        self.state_tx.send_replace(SocketState::Unknown);
        self.shutdown.cancel();
    }

    /// Final cleanup once the connection task exits.
    fn finish(&self) {
        self.state_tx.send_modify(|state| {
            if *state != SocketState::Unknown {
                *state = SocketState::Closed;
            }
        });
        self.inbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.shutdown.cancel();
    }
}

#[derive(Debug)]
struct SocketInner {
    url: String,
    push_timeout: Duration,
    shared: Arc<Shared>,
}

impl Drop for SocketInner {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}

/// Handle to one Phoenix socket. Cheap to clone; the connection closes when
/// [`Socket::close`] is called or the last handle is dropped.
#[derive(Debug, Clone)]
pub struct Socket {
    inner: Arc<SocketInner>,
}

impl Socket {
    /// Connect to `endpoint` and start the connection and heartbeat tasks.
    ///
    /// `vsn=2.0.0` is always sent; `options.params` are appended after it.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Connect`] if the URL is invalid or the
    /// WebSocket handshake fails.
    pub async fn open(endpoint: &str, options: SocketOptions) -> Result<Self, ChannelError> {
        let mut params: Vec<(&str, &str)> = vec![("vsn", PHOENIX_VSN)];
        params.extend(options.params.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        let url = ws::socket_url(endpoint, &params)
            .map_err(|e| ChannelError::Connect(format!("{e:#}")))?;

        let (state_tx, _) = watch::channel(SocketState::Created);
        state_tx.send_replace(SocketState::Connecting);

        log::info!("[Socket] Connecting to {}", redact_query(&url));
        let (writer, reader) = ws::connect(&url)
            .await
            .map_err(|e| ChannelError::Connect(format!("{e:#}")))?;
        log::info!("[Socket] WebSocket connected");

        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let (inbound_tx, _) = broadcast::channel(INBOUND_BUFFER);
        state_tx.send_replace(SocketState::Open);

        let shared = Arc::new(Shared {
            refs: RefGenerator::new(),
            outgoing_tx,
            inbound: Mutex::new(Some(inbound_tx)),
            state_tx,
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(run_connection(
            Arc::clone(&shared),
            writer,
            reader,
            outgoing_rx,
        ));
        tokio::spawn(run_heartbeat(
            Arc::clone(&shared),
            options.heartbeat_interval,
        ));

        Ok(Self {
            inner: Arc::new(SocketInner {
                url,
                push_timeout: options.push_timeout,
                shared,
            }),
        })
    }

    /// Full socket URL including query parameters.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.inner.url
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SocketState {
        *self.inner.shared.state_tx.borrow()
    }

    /// Observe state transitions.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<SocketState> {
        self.inner.shared.state_tx.subscribe()
    }

    /// Whether frames can currently be sent.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state() == SocketState::Open
    }

    /// Issue the next ref from this socket's generator.
    pub fn make_ref(&self) -> Ref {
        self.inner.shared.refs.next_ref()
    }

    /// Reply deadline used by channels on this socket.
    #[must_use]
    pub fn push_timeout(&self) -> Duration {
        self.inner.push_timeout
    }

    /// Receive every decoded inbound frame from now on.
    ///
    /// On a closed socket the receiver reports end-of-stream immediately.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Message> {
        self.inner.shared.subscribe().unwrap_or_else(|| {
            let (_tx, rx) = broadcast::channel(1);
            rx
        })
    }

    /// Queue one frame for sending.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Closed`] if the socket is not open, or
    /// [`ChannelError::Encode`] if the payload cannot be serialized.
    pub fn send(&self, msg: &Message) -> Result<(), ChannelError> {
        let text = msg.encode()?;
        log::trace!("[Socket] -> {} {}", msg.topic, msg.event);
        self.inner.shared.send_text(text)
    }

    /// Create a channel for `topic` with a fresh join ref.
    #[must_use]
    pub fn channel(&self, topic: impl Into<String>) -> Channel {
        Channel::new(self.clone(), topic.into(), self.make_ref())
    }

    /// Close the socket. Idempotent.
    pub fn close(&self) {
        if !self.inner.shared.shutdown.is_cancelled() {
            log::info!("[Socket] Closing");
            self.inner.shared.shutdown.cancel();
        }
    }

    /// Wait until the socket has stopped, for any reason.
    pub async fn closed(&self) {
        self.inner.shared.shutdown.cancelled().await;
    }
}

/// Wait for the first inbound frame matching `pred`.
///
/// Returns `None` when the socket closes first. A lagging receiver keeps
/// waiting; the caller's timeout covers a reply lost to lag.
pub(crate) async fn next_matching(
    rx: &mut broadcast::Receiver<Message>,
    mut pred: impl FnMut(&Message) -> bool,
) -> Option<Message> {
    loop {
        match rx.recv().await {
            Ok(msg) if pred(&msg) => return Some(msg),
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(n)) => {
                log::warn!("[Socket] Subscriber lagged by {n} frames");
            }
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}

/// Connection task: single owner of the WebSocket halves.
async fn run_connection(
    shared: Arc<Shared>,
    mut writer: WsWriter,
    mut reader: WsReader,
    mut outgoing_rx: mpsc::UnboundedReceiver<String>,
) {
    loop {
        tokio::select! {
            () = shared.shutdown.cancelled() => {
                shared.state_tx.send_if_modified(|state| {
                    if *state == SocketState::Open {
                        *state = SocketState::Closing;
                        true
                    } else {
                        false
                    }
                });
                let _ = writer.close().await;
                break;
            }

            Some(text) = outgoing_rx.recv() => {
                if let Err(e) = writer.send_text(&text).await {
                    log::warn!("[Socket] Write failed: {e:#}");
                    break;
                }
            }

            msg = reader.recv() => {
                match msg {
                    Some(Ok(WsMessage::Text(text))) => match Message::decode(&text) {
                        Ok(frame) => {
                            log::trace!("[Socket] <- {} {}", frame.topic, frame.event);
                            shared.broadcast(frame);
                        }
                        Err(e) => {
                            log::warn!(
                                "[Socket] Dropping undecodable frame ({e}): {}",
                                preview(&text, 100)
                            );
                        }
                    },
                    Some(Ok(WsMessage::Ping(data))) => {
                        let _ = writer.send_pong(data).await;
                    }
                    Some(Ok(WsMessage::Binary(data))) => {
                        log::warn!("[Socket] Ignoring {} byte binary frame", data.len());
                    }
                    Some(Ok(WsMessage::Close { code, reason })) => {
                        log::info!("[Socket] Closed by server ({code}): {reason}");
                        break;
                    }
                    Some(Err(e)) => {
                        log::warn!("[Socket] {e:#}");
                        break;
                    }
                    None => {
                        log::info!("[Socket] Stream ended");
                        break;
                    }
                }
            }
        }
    }

    shared.finish();
    log::debug!("[Socket] Connection task exited");
}

/// Heartbeat task: one heartbeat per interval, each must be acknowledged
/// before the next interval elapses.
async fn run_heartbeat(shared: Arc<Shared>, interval: Duration) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = shared.shutdown.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let Some(mut rx) = shared.subscribe() else {
            return;
        };
        let heartbeat_ref = shared.refs.next_ref();
        let heartbeat = Message::new(None, Some(heartbeat_ref), PHOENIX_TOPIC, EVENT_HEARTBEAT, json!({}));
        let sent = heartbeat
            .encode()
            .map_err(ChannelError::from)
            .and_then(|text| shared.send_text(text));
        if sent.is_err() {
            return;
        }
        log::trace!("[Socket] Heartbeat {heartbeat_ref}");

        let reply = tokio::select! {
            () = shared.shutdown.cancelled() => return,
            reply = tokio::time::timeout(
                interval,
                next_matching(&mut rx, |m| m.topic == PHOENIX_TOPIC && m.is_reply() && m.has_ref(heartbeat_ref)),
            ) => reply,
        };

        match reply {
            Ok(Some(msg)) if msg.is_ok_reply() => {}
            Ok(Some(msg)) => {
                log::error!("[Socket] Heartbeat {heartbeat_ref} rejected: {}", msg.payload);
                shared.fail();
                return;
            }
            Ok(None) => return,
            Err(_elapsed) => {
                log::error!("[Socket] Heartbeat {heartbeat_ref} not acknowledged within {interval:?}");
                shared.fail();
                return;
            }
        }
    }
}

/// At most `max` characters of `text`, cut on a character boundary.
fn preview(text: &str, max: usize) -> &str {
    text.char_indices().nth(max).map_or(text, |(i, _)| &text[..i])
}

/// Strip the query string (which may carry a token) for logging.
fn redact_query(url: &str) -> &str {
    url.split_once('?').map_or(url, |(base, _)| base)
}
