//! Stream information API used by the watcher.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::WatchTarget;
use crate::api::ApiClient;
use crate::graphql::{Document, GraphqlError, Subscription};

/// Source of stream metadata, history and live chat.
#[async_trait]
pub trait StreamApi: Send + Sync + std::fmt::Debug {
    /// Basic metadata for `target`.
    async fn fetch_metadata(&self, target: WatchTarget) -> Result<Value, GraphqlError>;

    /// Recent chat history for `target`.
    async fn fetch_history(&self, target: WatchTarget) -> Result<Value, GraphqlError>;

    /// Live chat for `target`.
    async fn subscribe_chat(&self, target: WatchTarget) -> Result<Subscription<Value>, GraphqlError>;
}

/// GraphQL documents behind [`GraphqlStreamApi`].
///
/// Each document receives `{"channelId": <target>}` as variables.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamDocuments {
    /// Metadata query.
    pub metadata: String,
    /// History query.
    pub history: String,
    /// Chat subscription.
    pub chat: String,
}

impl StreamDocuments {
    /// Whether every document is set.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        !self.metadata.trim().is_empty()
            && !self.history.trim().is_empty()
            && !self.chat.trim().is_empty()
    }
}

/// [`StreamApi`] over an [`ApiClient`].
///
/// Queries use the anonymous connection; chat uses the authenticated one
/// when the client has credentials.
#[derive(Debug, Clone)]
pub struct GraphqlStreamApi {
    client: Arc<ApiClient>,
    documents: StreamDocuments,
}

impl GraphqlStreamApi {
    /// Wrap `client` with `documents`.
    pub fn new(client: Arc<ApiClient>, documents: StreamDocuments) -> Self {
        Self { client, documents }
    }

    fn document(query: &str, target: WatchTarget) -> Document {
        Document::new(query).with_variables(json!({ "channelId": target.0 }))
    }
}

#[async_trait]
impl StreamApi for GraphqlStreamApi {
    async fn fetch_metadata(&self, target: WatchTarget) -> Result<Value, GraphqlError> {
        let conn = self.client.connection().await?;
        conn.query(&Self::document(&self.documents.metadata, target))
            .await
    }

    async fn fetch_history(&self, target: WatchTarget) -> Result<Value, GraphqlError> {
        let conn = self.client.connection().await?;
        conn.query(&Self::document(&self.documents.history, target))
            .await
    }

    async fn subscribe_chat(&self, target: WatchTarget) -> Result<Subscription<Value>, GraphqlError> {
        let conn = self.client.preferred_connection().await?;
        conn.subscription(&Self::document(&self.documents.chat, target))
            .await
    }
}
