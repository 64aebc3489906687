//! Topic channel multiplexed over a [`Socket`].
//!
//! A channel is identified on the wire by its topic and the join ref it was
//! created with. Every request waits for either a `phx_reply` carrying its own
//! ref or a `phx_close`/`phx_error` carrying the channel's join ref, whichever
//! comes first. Replies to concurrent pushes may arrive in any order.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::{json, Value};

use super::message::{Message, Ref};
use super::socket::{next_matching, Socket};
use super::ChannelError;
use crate::constants::{EVENT_JOIN, EVENT_LEAVE};

/// How a join/push/leave request resolved.
#[derive(Debug)]
enum Outcome {
    /// `phx_reply` with our ref.
    Reply(Message),
    /// `phx_close` or `phx_error` with our join ref.
    ChannelEnded,
}

#[derive(Debug)]
struct ChannelInner {
    socket: Socket,
    topic: String,
    join_ref: Ref,
    joined: AtomicBool,
}

/// One joined (or joinable) topic. Cheap to clone; clones share join state.
#[derive(Debug, Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl Channel {
    pub(crate) fn new(socket: Socket, topic: String, join_ref: Ref) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                socket,
                topic,
                join_ref,
                joined: AtomicBool::new(false),
            }),
        }
    }

    /// Channel topic.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.inner.topic
    }

    /// Join ref tagging every frame of this channel.
    #[must_use]
    pub fn join_ref(&self) -> Ref {
        self.inner.join_ref
    }

    /// Whether the last join succeeded and no leave/close happened since.
    #[must_use]
    pub fn is_joined(&self) -> bool {
        self.inner.joined.load(Ordering::SeqCst)
    }

    /// Socket this channel runs on.
    #[must_use]
    pub fn socket(&self) -> &Socket {
        &self.inner.socket
    }

    /// Join the topic.
    ///
    /// The join frame uses the join ref as its own ref.
    ///
    /// # Errors
    ///
    /// - [`ChannelError::JoinRejected`] for a non-ok reply
    /// - [`ChannelError::ChannelClosed`] if the server closes the channel first
    /// - [`ChannelError::Timeout`] / [`ChannelError::Closed`] on transport problems
    pub async fn join(&self, payload: Value) -> Result<Value, ChannelError> {
        let join_ref = self.inner.join_ref;
        log::debug!("[Channel] Joining {}", self.inner.topic);

        match self.request(EVENT_JOIN, payload, join_ref).await? {
            Outcome::Reply(reply) => {
                let (status, response) = reply.reply();
                if reply.is_ok_reply() {
                    self.inner.joined.store(true, Ordering::SeqCst);
                    log::info!("[Channel] Joined {}", self.inner.topic);
                    Ok(response.clone())
                } else {
                    log::warn!("[Channel] Join of {} rejected ({status})", self.inner.topic);
                    Err(ChannelError::JoinRejected {
                        topic: self.inner.topic.clone(),
                        response: response.clone(),
                    })
                }
            }
            Outcome::ChannelEnded => Err(self.ended()),
        }
    }

    /// Push `event` with a fresh ref and wait for its reply.
    ///
    /// # Errors
    ///
    /// See [`Channel::push_with_ref`].
    pub async fn push(&self, event: &str, payload: Value) -> Result<Value, ChannelError> {
        let msg_ref = self.inner.socket.make_ref();
        self.push_with_ref(event, payload, msg_ref).await
    }

    /// Push `event` tagged with `msg_ref` and wait for the reply carrying it.
    ///
    /// # Errors
    ///
    /// - [`ChannelError::NotJoined`] before a successful join or after leave
    /// - [`ChannelError::PushRejected`] for a non-ok reply
    /// - [`ChannelError::ChannelClosed`] if the server closes the channel first
    /// - [`ChannelError::Timeout`] / [`ChannelError::Closed`] on transport problems
    pub async fn push_with_ref(
        &self,
        event: &str,
        payload: Value,
        msg_ref: Ref,
    ) -> Result<Value, ChannelError> {
        if !self.is_joined() {
            return Err(ChannelError::NotJoined {
                topic: self.inner.topic.clone(),
            });
        }

        match self.request(event, payload, msg_ref).await? {
            Outcome::Reply(reply) => {
                let (status, response) = reply.reply();
                if reply.is_ok_reply() {
                    Ok(response.clone())
                } else {
                    Err(ChannelError::PushRejected {
                        event: event.to_string(),
                        status: status.to_string(),
                        response: response.clone(),
                    })
                }
            }
            Outcome::ChannelEnded => Err(self.ended()),
        }
    }

    /// Leave the topic.
    ///
    /// The channel counts as left as soon as this is called; the server is then
    /// told with `phx_leave`. A reply of any status, a close frame, or an
    /// already-closed socket all count as success. Leaving a channel that is
    /// not joined sends nothing.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Timeout`] if the server never answers. The
    /// channel stays left either way.
    pub async fn leave(&self) -> Result<(), ChannelError> {
        if !self.inner.joined.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        log::debug!("[Channel] Leaving {}", self.inner.topic);

        let msg_ref = self.inner.socket.make_ref();
        match self.request(EVENT_LEAVE, json!({}), msg_ref).await {
            Ok(_) | Err(ChannelError::Closed) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Send one frame and wait for its outcome.
    ///
    /// The subscription is attached before the frame is queued so that a fast
    /// reply cannot slip past.
    async fn request(&self, event: &str, payload: Value, msg_ref: Ref) -> Result<Outcome, ChannelError> {
        let socket = &self.inner.socket;
        let topic = self.inner.topic.as_str();
        let join_ref = self.inner.join_ref;

        let mut rx = socket.subscribe();
        socket.send(&Message::new(Some(join_ref), Some(msg_ref), topic, event, payload))?;

        let waited = tokio::time::timeout(
            socket.push_timeout(),
            next_matching(&mut rx, |m| {
                m.topic == topic
                    && ((m.is_reply() && m.has_ref(msg_ref))
                        || (m.is_channel_end() && m.has_join_ref(join_ref)))
            }),
        )
        .await;

        match waited {
            Ok(Some(msg)) if msg.is_reply() => Ok(Outcome::Reply(msg)),
            Ok(Some(_)) => Ok(Outcome::ChannelEnded),
            Ok(None) => Err(ChannelError::Closed),
            Err(_elapsed) => Err(ChannelError::Timeout {
                topic: topic.to_string(),
                event: event.to_string(),
            }),
        }
    }

    fn ended(&self) -> ChannelError {
        self.inner.joined.store(false, Ordering::SeqCst);
        log::warn!("[Channel] {} closed by server", self.inner.topic);
        ChannelError::ChannelClosed {
            topic: self.inner.topic.clone(),
        }
    }
}
