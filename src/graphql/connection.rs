//! GraphQL connection over the control channel.

use std::sync::Arc;

use serde_json::{json, Value};

use super::subscription::Subscription;
use super::{decode_result, doc_payload, GraphqlError, Operation};
use crate::constants::{CONTROL_TOPIC, EVENT_DOC, EVENT_UNSUBSCRIBE};
use crate::phoenix::{Channel, Socket};

/// Joined control channel able to run queries, mutations and subscriptions.
///
/// Cheap to clone; clones share the channel and socket.
#[derive(Debug, Clone)]
pub struct Connection {
    channel: Channel,
}

impl Connection {
    /// Join the control topic on `socket`.
    ///
    /// # Errors
    ///
    /// Returns [`GraphqlError::Channel`] if the join fails.
    pub async fn connect(socket: Socket) -> Result<Self, GraphqlError> {
        let channel = socket.channel(CONTROL_TOPIC);
        channel.join(json!({})).await?;
        Ok(Self { channel })
    }

    /// Socket this connection runs on.
    #[must_use]
    pub fn socket(&self) -> &Socket {
        self.channel.socket()
    }

    /// Whether the socket is open and the control channel joined.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.channel.socket().is_open() && self.channel.is_joined()
    }

    /// Run a query.
    ///
    /// # Errors
    ///
    /// - [`GraphqlError::Channel`] when the push fails or the reply is not ok
    /// - [`GraphqlError::Server`] / [`GraphqlError::MissingData`] /
    ///   [`GraphqlError::Decode`] for unusable results
    pub async fn query<O: Operation>(&self, op: &O) -> Result<O::Response, GraphqlError> {
        self.execute(op).await
    }

    /// Run a mutation. Same wire shape and errors as [`Connection::query`].
    ///
    /// # Errors
    ///
    /// See [`Connection::query`].
    pub async fn mutation<O: Operation>(&self, op: &O) -> Result<O::Response, GraphqlError> {
        self.execute(op).await
    }

    async fn execute<O: Operation>(&self, op: &O) -> Result<O::Response, GraphqlError> {
        let reply = self.channel.push(EVENT_DOC, doc_payload(op)).await?;
        decode_result(reply)
    }

    /// Start a subscription.
    ///
    /// The socket receiver is attached before the document is pushed, so data
    /// pushed right after the reply is buffered for the first consumer.
    ///
    /// # Errors
    ///
    /// [`GraphqlError::Channel`] when the push fails or is rejected,
    /// [`GraphqlError::MissingSubscriptionId`] for a malformed reply.
    pub async fn subscription<O: Operation>(
        &self,
        op: &O,
    ) -> Result<Subscription<O::Response>, GraphqlError> {
        let frames = self.channel.socket().subscribe();
        let reply = self.channel.push(EVENT_DOC, doc_payload(op)).await?;
        let id = reply
            .get("subscriptionId")
            .and_then(Value::as_str)
            .ok_or(GraphqlError::MissingSubscriptionId)?
            .to_string();
        log::debug!("[GraphQL] Subscribed {id}");

        Ok(Subscription::new(
            self.clone(),
            id,
            frames,
            Arc::new(decode_result::<O::Response>),
        ))
    }

    /// Cancel subscription `id` server-side.
    ///
    /// # Errors
    ///
    /// Returns [`GraphqlError::Channel`] if the push fails or is rejected.
    pub async fn unsubscribe(&self, id: &str) -> Result<(), GraphqlError> {
        self.channel
            .push(EVENT_UNSUBSCRIBE, json!({ "subscriptionId": id }))
            .await?;
        log::debug!("[GraphQL] Unsubscribed {id}");
        Ok(())
    }

    /// Close the underlying socket.
    pub fn close(&self) {
        self.channel.socket().close();
    }
}
