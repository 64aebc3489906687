//! Stream watcher: switches between watch targets without letting work for
//! an old target leak into the new one.
//!
//! # Architecture
//!
//! ```text
//! StreamWatcher
//!     ├── state (one lock): generation, current target, cancel token,
//!     │                     media connection, chat subscription
//!     └── per generation, one task:
//!           ├── media:    session ─► MediaConnection ─► start
//!           ├── info:     metadata, then history
//!           └── once both are done:
//!                 ├── chat subscription
//!                 └── periodic metadata refresh
//! ```
//!
//! Every switch bumps the generation. Async work records the generation it
//! started under and drops its result if the generation moved on or
//! watching stopped. Events are emitted under the state lock, so nothing
//! for an old generation appears after [`StreamWatcher::watch`] or
//! [`StreamWatcher::stop_watching`] returns.

pub mod api;

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::constants::METADATA_REFRESH_INTERVAL;
use crate::graphql::Subscription;
use crate::janus::{NegotiationSession, SessionSettings, SignalingClient};
use crate::media::{InboundStream, MediaConfig, MediaConnection, MediaStatus, PeerConnectionFactory};

pub use api::{GraphqlStreamApi, StreamApi, StreamDocuments};

/// Channel to watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WatchTarget(pub u64);

impl fmt::Display for WatchTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What the watcher reports.
#[derive(Debug)]
pub enum WatchEvent {
    /// Metadata fetched (initially and on every refresh).
    Metadata {
        /// Target.
        target: WatchTarget,
        /// Query result.
        data: Value,
    },
    /// Recent chat history.
    History {
        /// Target.
        target: WatchTarget,
        /// Query result.
        data: Value,
    },
    /// One live chat event.
    Chat {
        /// Target.
        target: WatchTarget,
        /// Subscription result.
        data: Value,
    },
    /// An inbound media track.
    MediaStream {
        /// Target.
        target: WatchTarget,
        /// The track.
        stream: InboundStream,
    },
    /// Media could not be set up or failed later.
    MediaFailed {
        /// Target.
        target: WatchTarget,
        /// Why.
        reason: String,
    },
    /// Media ended (gateway hangup or peer closed).
    MediaEnded {
        /// Target.
        target: WatchTarget,
    },
    /// Metadata or history could not be fetched.
    InfoFailed {
        /// Target.
        target: WatchTarget,
        /// Why.
        reason: String,
    },
    /// The chat subscription could not be opened or ended unexpectedly.
    ChatInterrupted {
        /// Target.
        target: WatchTarget,
    },
}

#[derive(Debug, Default)]
struct WatchState {
    generation: u64,
    current: Option<WatchTarget>,
    token: CancellationToken,
    media: Option<MediaConnection>,
    chat: Option<Subscription<Value>>,
    shut_down: bool,
}

impl WatchState {
    fn is_live(&self, generation: u64) -> bool {
        self.generation == generation && self.current.is_some()
    }

    /// Cancel the current generation and hand back what must be released.
    fn stop(&mut self) -> (Option<MediaConnection>, Option<Subscription<Value>>) {
        self.current = None;
        self.token.cancel();
        (self.media.take(), self.chat.take())
    }
}

struct WatcherInner {
    signaling: SignalingClient,
    session_settings: SessionSettings,
    factory: Arc<dyn PeerConnectionFactory>,
    media_config: MediaConfig,
    api: Option<Arc<dyn StreamApi>>,
    metadata_refresh: Duration,
    state: Mutex<WatchState>,
    events_tx: mpsc::UnboundedSender<WatchEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<WatchEvent>>>,
}

impl WatcherInner {
    fn lock(&self) -> MutexGuard<'_, WatchState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Emit `event` only if `generation` is still the live one.
    fn emit(&self, generation: u64, event: WatchEvent) -> bool {
        let state = self.lock();
        if !state.is_live(generation) {
            log::debug!("[Watch] Dropping stale event of generation {generation}");
            return false;
        }
        self.events_tx.send(event).is_ok()
    }

    fn install_media(&self, generation: u64, media: &MediaConnection) -> bool {
        let mut state = self.lock();
        if !state.is_live(generation) || state.media.is_some() {
            return false;
        }
        state.media = Some(media.clone());
        true
    }

    fn discard_media(&self, generation: u64) -> Option<MediaConnection> {
        let mut state = self.lock();
        if state.generation == generation {
            state.media.take()
        } else {
            None
        }
    }

    fn install_chat(&self, generation: u64, chat: &Subscription<Value>) -> bool {
        let mut state = self.lock();
        if !state.is_live(generation) || state.chat.is_some() {
            return false;
        }
        state.chat = Some(chat.clone());
        true
    }

    fn discard_chat(&self, generation: u64) {
        let mut state = self.lock();
        if state.generation == generation {
            state.chat = None;
        }
    }
}

/// Close `media` and cancel `chat` outside the state lock.
fn release(media: Option<MediaConnection>, chat: Option<Subscription<Value>>) {
    if let Some(media) = media {
        media.close();
    }
    if let Some(chat) = chat {
        tokio::spawn(async move {
            if let Err(e) = chat.cancel().await {
                log::debug!("[Watch] Chat unsubscribe failed: {e}");
            }
        });
    }
}

/// Builder for [`StreamWatcher`].
#[derive(Debug)]
pub struct StreamWatcherBuilder {
    signaling: SignalingClient,
    factory: Arc<dyn PeerConnectionFactory>,
    session_settings: SessionSettings,
    media_config: MediaConfig,
    api: Option<Arc<dyn StreamApi>>,
    metadata_refresh: Duration,
}

impl StreamWatcherBuilder {
    /// Plugin and poll interval for negotiation sessions.
    #[must_use]
    pub fn session_settings(mut self, settings: SessionSettings) -> Self {
        self.session_settings = settings;
        self
    }

    /// Peer connection policy.
    #[must_use]
    pub fn media_config(mut self, config: MediaConfig) -> Self {
        self.media_config = config;
        self
    }

    /// Metadata, history and chat source. Without one, only media runs.
    #[must_use]
    pub fn stream_api(mut self, api: Arc<dyn StreamApi>) -> Self {
        self.api = Some(api);
        self
    }

    /// Metadata refresh period.
    #[must_use]
    pub fn metadata_refresh(mut self, period: Duration) -> Self {
        self.metadata_refresh = period;
        self
    }

    /// Build the watcher.
    #[must_use]
    pub fn build(self) -> StreamWatcher {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        StreamWatcher {
            inner: Arc::new(WatcherInner {
                signaling: self.signaling,
                session_settings: self.session_settings,
                factory: self.factory,
                media_config: self.media_config,
                api: self.api,
                metadata_refresh: self.metadata_refresh,
                state: Mutex::new(WatchState::default()),
                events_tx,
                events_rx: Mutex::new(Some(events_rx)),
            }),
        }
    }
}

/// Watches at most one target at a time. Cheap to clone.
#[derive(Clone)]
pub struct StreamWatcher {
    inner: Arc<WatcherInner>,
}

impl fmt::Debug for StreamWatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("StreamWatcher")
            .field("generation", &state.generation)
            .field("current", &state.current)
            .finish_non_exhaustive()
    }
}

impl StreamWatcher {
    /// Start building a watcher.
    pub fn builder(
        signaling: SignalingClient,
        factory: Arc<dyn PeerConnectionFactory>,
    ) -> StreamWatcherBuilder {
        StreamWatcherBuilder {
            signaling,
            factory,
            session_settings: SessionSettings::default(),
            media_config: MediaConfig::default(),
            api: None,
            metadata_refresh: METADATA_REFRESH_INTERVAL,
        }
    }

    /// Take the event receiver. Returns `None` after the first call.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<WatchEvent>> {
        self.inner
            .events_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Target being watched.
    #[must_use]
    pub fn current(&self) -> Option<WatchTarget> {
        self.inner.lock().current
    }

    /// Number of switches so far.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.inner.lock().generation
    }

    /// Whether a media connection is installed for the current target.
    #[must_use]
    pub fn has_media(&self) -> bool {
        self.inner.lock().media.is_some()
    }

    /// Whether a chat subscription is installed for the current target.
    #[must_use]
    pub fn has_chat(&self) -> bool {
        self.inner.lock().chat.is_some()
    }

    /// Switch to `target`. Watching the current target again does nothing.
    ///
    /// Everything belonging to the previous target is released before this
    /// returns. Must be called inside a tokio runtime.
    pub fn watch(&self, target: WatchTarget) {
        let mut state = self.inner.lock();
        if state.shut_down {
            log::warn!("[Watch] Ignoring watch of {target} after shutdown");
            return;
        }
        if state.current == Some(target) {
            return;
        }

        let (media, chat) = state.stop();
        state.generation += 1;
        state.current = Some(target);
        state.token = CancellationToken::new();
        let generation = state.generation;
        let token = state.token.clone();
        drop(state);

        log::info!("[Watch] Watching {target} (generation {generation})");
        release(media, chat);
        tokio::spawn(run_generation(
            Arc::clone(&self.inner),
            generation,
            target,
            token,
        ));
    }

    /// Stop watching. Media is closed before this returns; chat is
    /// unsubscribed in the background.
    pub fn stop_watching(&self) {
        let (media, chat) = {
            let mut state = self.inner.lock();
            if state.current.is_none() && state.media.is_none() && state.chat.is_none() {
                return;
            }
            state.stop()
        };
        log::info!("[Watch] Stopped watching");
        release(media, chat);
    }

    /// Stop watching and refuse further targets.
    pub fn shutdown(&self) {
        self.inner.lock().shut_down = true;
        self.stop_watching();
    }
}

/// All work for one generation.
async fn run_generation(
    inner: Arc<WatcherInner>,
    generation: u64,
    target: WatchTarget,
    token: CancellationToken,
) {
    tokio::join!(
        start_media(&inner, generation, target, &token),
        load_info(&inner, generation, target, &token),
    );

    if token.is_cancelled() {
        return;
    }
    if let Some(api) = inner.api.clone() {
        tokio::join!(
            follow_chat(&inner, api.as_ref(), generation, target, &token),
            refresh_metadata(&inner, api.as_ref(), generation, target, &token),
        );
    }
}

async fn start_media(
    inner: &Arc<WatcherInner>,
    generation: u64,
    target: WatchTarget,
    token: &CancellationToken,
) {
    // A create dropped here destroys its gateway session in the background.
    let created = tokio::select! {
        () = token.cancelled() => return,
        created = NegotiationSession::create(inner.signaling.clone(), target.0, &inner.session_settings) => created,
    };
    let session = match created {
        Ok(session) => session,
        Err(e) => {
            log::warn!("[Watch] Signaling for {target} failed: {e}");
            inner.emit(generation, WatchEvent::MediaFailed { target, reason: e.to_string() });
            return;
        }
    };

    let on_stream = {
        let weak = Arc::downgrade(inner);
        move |stream: InboundStream| {
            if let Some(inner) = weak.upgrade() {
                inner.emit(generation, WatchEvent::MediaStream { target, stream });
            }
        }
    };
    let media = match MediaConnection::new(
        inner.factory.as_ref(),
        &inner.media_config,
        session.clone(),
        on_stream,
    ) {
        Ok(media) => media,
        Err(e) => {
            log::warn!("[Watch] Media setup for {target} failed: {e}");
            tokio::spawn(async move {
                let _ = session.destroy().await;
            });
            inner.emit(generation, WatchEvent::MediaFailed { target, reason: e.to_string() });
            return;
        }
    };

    if !inner.install_media(generation, &media) {
        log::debug!("[Watch] Generation {generation} superseded before media install");
        media.close();
        return;
    }

    let started = tokio::select! {
        () = token.cancelled() => return,
        started = media.start() => started,
    };
    if let Err(e) = started {
        log::warn!("[Watch] Media negotiation for {target} failed: {e}");
        if let Some(media) = inner.discard_media(generation) {
            media.close();
        }
        inner.emit(generation, WatchEvent::MediaFailed { target, reason: e.to_string() });
        return;
    }

    tokio::spawn(monitor_media(
        Arc::clone(inner),
        media,
        generation,
        target,
        token.clone(),
    ));
}

/// Report the media connection's terminal status.
async fn monitor_media(
    inner: Arc<WatcherInner>,
    media: MediaConnection,
    generation: u64,
    target: WatchTarget,
    token: CancellationToken,
) {
    let mut status = media.watch_status();
    loop {
        let final_status = {
            let current = status.borrow_and_update();
            current.is_terminal().then(|| current.clone())
        };
        if let Some(final_status) = final_status {
            inner.discard_media(generation);
            let event = match final_status {
                MediaStatus::Failed(reason) => WatchEvent::MediaFailed { target, reason },
                _ => WatchEvent::MediaEnded { target },
            };
            inner.emit(generation, event);
            return;
        }

        tokio::select! {
            () = token.cancelled() => return,
            changed = status.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }
    }
}

async fn load_info(
    inner: &WatcherInner,
    generation: u64,
    target: WatchTarget,
    token: &CancellationToken,
) {
    let Some(api) = inner.api.clone() else {
        return;
    };

    let metadata = tokio::select! {
        () = token.cancelled() => return,
        metadata = api.fetch_metadata(target) => metadata,
    };
    match metadata {
        Ok(data) => {
            inner.emit(generation, WatchEvent::Metadata { target, data });
        }
        Err(e) => {
            log::warn!("[Watch] Metadata for {target} failed: {e}");
            inner.emit(generation, WatchEvent::InfoFailed { target, reason: e.to_string() });
        }
    }

    let history = tokio::select! {
        () = token.cancelled() => return,
        history = api.fetch_history(target) => history,
    };
    match history {
        Ok(data) => {
            inner.emit(generation, WatchEvent::History { target, data });
        }
        Err(e) => {
            log::warn!("[Watch] History for {target} failed: {e}");
            inner.emit(generation, WatchEvent::InfoFailed { target, reason: e.to_string() });
        }
    }
}

async fn follow_chat(
    inner: &WatcherInner,
    api: &dyn StreamApi,
    generation: u64,
    target: WatchTarget,
    token: &CancellationToken,
) {
    // Not raced against the token: a subscription granted after a switch
    // still has to be cancelled server-side.
    let chat = match api.subscribe_chat(target).await {
        Ok(chat) => chat,
        Err(e) => {
            log::warn!("[Watch] Chat for {target} failed: {e}");
            inner.emit(generation, WatchEvent::ChatInterrupted { target });
            return;
        }
    };

    if !inner.install_chat(generation, &chat) {
        log::debug!("[Watch] Generation {generation} superseded before chat install");
        release(None, Some(chat));
        return;
    }

    let mut events = chat.stream();
    loop {
        let next = tokio::select! {
            () = token.cancelled() => return,
            next = events.next() => next,
        };
        match next {
            Some(Ok(data)) => {
                inner.emit(generation, WatchEvent::Chat { target, data });
            }
            Some(Err(e)) => log::warn!("[Watch] Undecodable chat event: {e}"),
            None => {
                if !chat.is_cancelled() {
                    log::warn!("[Watch] Chat for {target} ended");
                    inner.emit(generation, WatchEvent::ChatInterrupted { target });
                }
                inner.discard_chat(generation);
                return;
            }
        }
    }
}

async fn refresh_metadata(
    inner: &WatcherInner,
    api: &dyn StreamApi,
    generation: u64,
    target: WatchTarget,
    token: &CancellationToken,
) {
    let period = inner.metadata_refresh;
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = token.cancelled() => return,
            _ = ticker.tick() => {}
        }
        let refreshed = tokio::select! {
            () = token.cancelled() => return,
            refreshed = api.fetch_metadata(target) => refreshed,
        };
        match refreshed {
            Ok(data) => {
                inner.emit(generation, WatchEvent::Metadata { target, data });
            }
            Err(e) => log::warn!("[Watch] Metadata refresh for {target} failed: {e}"),
        }
    }
}
