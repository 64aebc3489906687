//! Live GraphQL subscription handle.
//!
//! The handle filters the socket's frame stream for `subscription:data`
//! pushes on its own id. Filtering starts lazily, when the first consumer
//! asks for a stream, and the results are shared: every stream obtained from
//! the same handle (or from a [`Subscription::map`] of it) sees the same
//! events from the moment it was created.

// Rust guideline compliant 2026-02

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use futures_util::stream::{self, BoxStream, StreamExt};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use super::connection::Connection;
use super::GraphqlError;
use crate::constants::{EVENT_SUBSCRIPTION_DATA, INBOUND_BUFFER};
use crate::phoenix::Message;

type Decoder<T> = Arc<dyn Fn(Value) -> Result<T, GraphqlError> + Send + Sync>;

struct Shared {
    id: String,
    connection: Connection,
    cancel: CancellationToken,
    unsubscribed: AtomicBool,
    /// Socket frames; taken by the pump when it starts.
    frames: Mutex<Option<broadcast::Receiver<Message>>>,
    /// Fan-out of raw results; dropped on cancel or when the socket ends.
    results: Mutex<Option<broadcast::Sender<Value>>>,
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl Shared {
    fn results_rx(&self) -> Option<broadcast::Receiver<Value>> {
        self.results
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(broadcast::Sender::subscribe)
    }

    fn end_results(&self) {
        self.results
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    /// Start filtering socket frames, once.
    fn ensure_started(self: &Arc<Self>) {
        let Some(frames) = self
            .frames
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return;
        };
        let Some(results) = self
            .results
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
        else {
            return;
        };

        tokio::spawn(run_pump(
            Arc::downgrade(self),
            self.id.clone(),
            self.cancel.clone(),
            frames,
            results,
        ));
    }
}

/// Forward `subscription:data` results for `id` into `results`.
async fn run_pump(
    shared: Weak<Shared>,
    id: String,
    cancel: CancellationToken,
    mut frames: broadcast::Receiver<Message>,
    results: broadcast::Sender<Value>,
) {
    loop {
        let frame = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            frame = frames.recv() => frame,
        };

        match frame {
            Ok(msg) if is_data_for(&msg, &id) => {
                let result = msg.payload.get("result").cloned().unwrap_or(Value::Null);
                // No live consumers is fine: results are not replayed.
                let _ = results.send(result);
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(n)) => {
                log::warn!("[GraphQL] Subscription {id} lagged by {n} frames");
            }
            Err(broadcast::error::RecvError::Closed) => {
                log::info!("[GraphQL] Socket closed under subscription {id}");
                break;
            }
        }
    }

    drop(results);
    if let Some(shared) = shared.upgrade() {
        shared.end_results();
    }
}

fn is_data_for(msg: &Message, id: &str) -> bool {
    msg.join_ref.is_none()
        && msg.msg_ref.is_none()
        && msg.event == EVENT_SUBSCRIPTION_DATA
        && msg.topic == id
}

/// Handle to one server-side subscription.
///
/// Cheap to clone. [`Subscription::cancel`] on any clone (or on any handle
/// derived with [`Subscription::map`]) cancels the subscription for all of
/// them.
pub struct Subscription<T> {
    shared: Arc<Shared>,
    decode: Decoder<T>,
}

impl<T> Clone for Subscription<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            decode: Arc::clone(&self.decode),
        }
    }
}

impl<T> fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.shared.id)
            .field("cancelled", &self.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl<T> Subscription<T> {
    /// Server-assigned subscription id (also the data topic).
    #[must_use]
    pub fn id(&self) -> &str {
        &self.shared.id
    }

    /// Whether [`Subscription::cancel`] has been called.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }
}

impl<T: Send + 'static> Subscription<T> {
    pub(crate) fn new(
        connection: Connection,
        id: String,
        frames: broadcast::Receiver<Message>,
        decode: Decoder<T>,
    ) -> Self {
        let (results, _) = broadcast::channel(INBOUND_BUFFER);
        Self {
            shared: Arc::new(Shared {
                id,
                connection,
                cancel: CancellationToken::new(),
                unsubscribed: AtomicBool::new(false),
                frames: Mutex::new(Some(frames)),
                results: Mutex::new(Some(results)),
            }),
            decode,
        }
    }

    /// Stream of decoded results from now on.
    ///
    /// The first call starts frame filtering. The stream ends when the
    /// subscription is cancelled or the socket closes. A result that fails
    /// to decode is yielded as an error and the stream continues.
    #[must_use]
    pub fn stream(&self) -> BoxStream<'static, Result<T, GraphqlError>> {
        let rx = self.shared.results_rx();
        self.shared.ensure_started();

        let state = (rx, Arc::clone(&self.shared), Arc::clone(&self.decode));
        stream::unfold(state, |(mut rx, shared, decode)| async move {
            let receiver = rx.as_mut()?;
            loop {
                let next = tokio::select! {
                    biased;
                    () = shared.cancel.cancelled() => return None,
                    next = receiver.recv() => next,
                };
                match next {
                    Ok(_) if shared.cancel.is_cancelled() => return None,
                    Ok(value) => {
                        let item = decode(value);
                        return Some((item, (rx, shared, decode)));
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("[GraphQL] Consumer of {} lagged by {n} results", shared.id);
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .boxed()
    }

    /// Derived handle whose results pass through `f`.
    ///
    /// Shares the underlying subscription: cancelling either cancels both.
    #[must_use]
    pub fn map<U, F>(&self, f: F) -> Subscription<U>
    where
        U: Send + 'static,
        F: Fn(T) -> U + Send + Sync + 'static,
    {
        let decode = Arc::clone(&self.decode);
        Subscription {
            shared: Arc::clone(&self.shared),
            decode: Arc::new(move |value| decode(value).map(&f)),
        }
    }

    /// Stop delivery and unsubscribe server-side.
    ///
    /// Delivery stops before this returns, even if the unsubscribe push
    /// fails. Calling it again is a no-op.
    ///
    /// # Errors
    ///
    /// Returns the error of the `unsubscribe` push, if it fails.
    pub async fn cancel(&self) -> Result<(), GraphqlError> {
        self.shared.cancel.cancel();
        self.shared.end_results();
        self.shared
            .frames
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if self.shared.unsubscribed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shared.connection.unsubscribe(&self.shared.id).await
    }
}
