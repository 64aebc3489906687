//! GraphQL operations carried over a Phoenix channel.
//!
//! Every document is pushed as a `doc` event on the fixed control topic.
//! Queries and mutations resolve with the reply; subscriptions resolve with a
//! server-assigned id whose topic then carries `subscription:data` pushes.
//!
//! # Architecture
//!
//! ```text
//! Connection ── Channel("__absinthe__:control") ── Socket
//!     │
//!     ├── query / mutation ──► push "doc" ──► decode reply
//!     └── subscription     ──► push "doc" ──► Subscription<T>
//!                                                 └── filters socket frames by id
//! ```

pub mod connection;
pub mod subscription;

use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::phoenix::ChannelError;

/// One error entry from a GraphQL response.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ServerError {
    /// Human-readable message.
    pub message: String,
    /// Path of the failing field, if reported.
    #[serde(default)]
    pub path: Vec<Value>,
}

/// Errors that can occur while running GraphQL operations.
#[derive(Debug, thiserror::Error)]
pub enum GraphqlError {
    /// The underlying channel push failed or was rejected.
    #[error(transparent)]
    Channel(#[from] ChannelError),
    /// The server answered with a non-empty `errors` array.
    #[error("server returned errors: {}", join_messages(.0))]
    Server(Vec<ServerError>),
    /// The response carried neither `data` nor `errors`.
    #[error("response has no data")]
    MissingData,
    /// The response did not match the operation's response type.
    #[error("failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),
    /// A subscription reply without `subscriptionId`.
    #[error("subscription reply carried no subscriptionId")]
    MissingSubscriptionId,
    /// The token provider could not supply a bearer token.
    #[error("no access token: {0}")]
    Unauthenticated(String),
}

fn join_messages(errors: &[ServerError]) -> String {
    errors
        .iter()
        .map(|e| e.message.as_str())
        .collect::<Vec<_>>()
        .join("; ")
}

/// A GraphQL document plus variables with a typed response.
///
/// The document text is opaque to this crate.
pub trait Operation: Send + Sync {
    /// Type the `data` field decodes into.
    type Response: DeserializeOwned + Send + 'static;

    /// Document text.
    fn document(&self) -> &str;

    /// Variables object.
    fn variables(&self) -> Value {
        json!({})
    }
}

/// Ready-made [`Operation`] over an opaque document string.
///
/// Decodes into `serde_json::Value` unless retyped with
/// [`Document::with_response`].
#[derive(Debug)]
pub struct Document<T = Value> {
    query: String,
    variables: Value,
    _response: PhantomData<fn() -> T>,
}

impl<T> Clone for Document<T> {
    fn clone(&self) -> Self {
        Self {
            query: self.query.clone(),
            variables: self.variables.clone(),
            _response: PhantomData,
        }
    }
}

impl Document {
    /// Document with empty variables and a `Value` response.
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            variables: json!({}),
            _response: PhantomData,
        }
    }
}

impl<T> Document<T> {
    /// Replace the variables object.
    #[must_use]
    pub fn with_variables(mut self, variables: Value) -> Self {
        self.variables = variables;
        self
    }

    /// Decode responses into `U` instead.
    #[must_use]
    pub fn with_response<U>(self) -> Document<U> {
        Document {
            query: self.query,
            variables: self.variables,
            _response: PhantomData,
        }
    }
}

impl<T: DeserializeOwned + Send + 'static> Operation for Document<T> {
    type Response = T;

    fn document(&self) -> &str {
        &self.query
    }

    fn variables(&self) -> Value {
        self.variables.clone()
    }
}

#[derive(Deserialize)]
struct ResponseEnvelope<T> {
    data: Option<T>,
    #[serde(default)]
    errors: Vec<ServerError>,
}

/// Decode a `{data, errors}` GraphQL result.
pub(crate) fn decode_result<T: DeserializeOwned>(result: Value) -> Result<T, GraphqlError> {
    let envelope: ResponseEnvelope<T> = serde_json::from_value(result)?;
    if !envelope.errors.is_empty() {
        return Err(GraphqlError::Server(envelope.errors));
    }
    envelope.data.ok_or(GraphqlError::MissingData)
}

/// `doc` push payload for an operation.
pub(crate) fn doc_payload<O: Operation + ?Sized>(op: &O) -> Value {
    json!({
        "query": op.document(),
        "variables": op.variables(),
    })
}

// Re-exports
pub use connection::Connection;
pub use subscription::Subscription;
