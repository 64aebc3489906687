//! Application-level GraphQL client.
//!
//! Holds up to two lazily created connections to the same endpoint: an
//! anonymous one and one authenticated with a bearer token from a
//! [`TokenProvider`]. A connection whose socket has closed is replaced on
//! the next request.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::graphql::{Connection, GraphqlError};
use crate::phoenix::{ChannelError, Socket, SocketOptions};

/// Supplies bearer tokens for authenticated connections.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Return a fresh access token.
    async fn access_token(&self) -> anyhow::Result<String>;
}

/// [`TokenProvider`] that always returns the same token.
#[derive(Clone)]
pub struct StaticToken(String);

impl StaticToken {
    /// Wrap a fixed token.
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

impl fmt::Debug for StaticToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("StaticToken(..)")
    }
}

#[async_trait]
impl TokenProvider for StaticToken {
    async fn access_token(&self) -> anyhow::Result<String> {
        Ok(self.0.clone())
    }
}

/// Lazily connecting GraphQL client.
pub struct ApiClient {
    endpoint: String,
    options: SocketOptions,
    tokens: Option<Arc<dyn TokenProvider>>,
    anonymous: Mutex<Option<Connection>>,
    authenticated: Mutex<Option<Connection>>,
    shut_down: AtomicBool,
}

impl fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiClient")
            .field("endpoint", &self.endpoint)
            .field("authenticated", &self.tokens.is_some())
            .field("shut_down", &self.shut_down.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl ApiClient {
    /// Client for the Phoenix socket endpoint (`.../socket/websocket`).
    pub fn new(endpoint: impl Into<String>, options: SocketOptions) -> Self {
        Self {
            endpoint: endpoint.into(),
            options,
            tokens: None,
            anonymous: Mutex::new(None),
            authenticated: Mutex::new(None),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Enable [`ApiClient::authenticated_connection`].
    #[must_use]
    pub fn with_token_provider(mut self, tokens: Arc<dyn TokenProvider>) -> Self {
        self.tokens = Some(tokens);
        self
    }

    /// Socket endpoint.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Whether a token provider is configured.
    #[must_use]
    pub fn has_credentials(&self) -> bool {
        self.tokens.is_some()
    }

    /// The anonymous connection, connecting on first use.
    ///
    /// # Errors
    ///
    /// Returns [`GraphqlError::Channel`] if the socket cannot be opened or
    /// the control channel cannot be joined, or after [`ApiClient::shutdown`].
    pub async fn connection(&self) -> Result<Connection, GraphqlError> {
        let mut slot = self.anonymous.lock().await;
        self.reuse_or_connect(&mut slot, None).await
    }

    /// The authenticated connection, connecting with a fresh token on first
    /// use or after the previous socket closed.
    ///
    /// # Errors
    ///
    /// - [`GraphqlError::Unauthenticated`] without a provider or when it fails
    /// - [`GraphqlError::Channel`] as for [`ApiClient::connection`]
    pub async fn authenticated_connection(&self) -> Result<Connection, GraphqlError> {
        let tokens = self
            .tokens
            .as_ref()
            .ok_or_else(|| GraphqlError::Unauthenticated("no token provider configured".into()))?;

        let mut slot = self.authenticated.lock().await;
        if let Some(conn) = slot.as_ref().filter(|c| c.is_open()) {
            return Ok(conn.clone());
        }
        let token = tokens
            .access_token()
            .await
            .map_err(|e| GraphqlError::Unauthenticated(format!("{e:#}")))?;
        self.reuse_or_connect(&mut slot, Some(token)).await
    }

    /// Authenticated connection when credentials exist, anonymous otherwise.
    ///
    /// # Errors
    ///
    /// See [`ApiClient::connection`] and [`ApiClient::authenticated_connection`].
    pub async fn preferred_connection(&self) -> Result<Connection, GraphqlError> {
        if self.has_credentials() {
            self.authenticated_connection().await
        } else {
            self.connection().await
        }
    }

    async fn reuse_or_connect(
        &self,
        slot: &mut Option<Connection>,
        token: Option<String>,
    ) -> Result<Connection, GraphqlError> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(ChannelError::Closed.into());
        }
        if let Some(conn) = slot.as_ref() {
            if conn.is_open() {
                return Ok(conn.clone());
            }
            log::info!("[Api] Previous connection closed, reconnecting");
            conn.close();
        }

        let mut options = self.options.clone();
        if let Some(token) = token {
            options = options.param("token", token);
        }
        let socket = Socket::open(&self.endpoint, options).await?;
        let conn = match Connection::connect(socket.clone()).await {
            Ok(conn) => conn,
            Err(e) => {
                socket.close();
                return Err(e);
            }
        };
        *slot = Some(conn.clone());
        Ok(conn)
    }

    /// Close both connections. Later requests fail with
    /// [`ChannelError::Closed`].
    pub async fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
        for slot in [&self.anonymous, &self.authenticated] {
            if let Some(conn) = slot.lock().await.take() {
                conn.close();
            }
        }
        log::info!("[Api] Shut down");
    }
}
