//! Stateless client for the Janus HTTP API.
//!
//! This module provides the [`SignalingClient`] struct. Each method is one
//! HTTP exchange; session state lives in
//! [`NegotiationSession`](super::NegotiationSession).

use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde_json::json;

use super::types::{Candidate, Jsep, JanusEvent, PollResponse, Request, Response};
use super::{IceCandidate, PluginId, SessionId, SignalingError};
use crate::constants::{
    HTTP_REQUEST_TIMEOUT, LONG_POLL_MARGIN, LONG_POLL_MAX_EVENTS, LONG_POLL_TIMEOUT,
};

/// HTTP client for one Janus gateway.
#[derive(Debug, Clone)]
pub struct SignalingClient {
    client: Client,
    base_url: String,
}

impl SignalingClient {
    /// Creates a client for the gateway at `base_url` (e.g.
    /// `https://gateway.example/janus`) with the default request timeout.
    ///
    /// # Errors
    ///
    /// Returns [`SignalingError::Transport`] if the HTTP client cannot be
    /// built.
    pub fn new(base_url: impl Into<String>) -> Result<Self, SignalingError> {
        Self::with_timeout(base_url, HTTP_REQUEST_TIMEOUT)
    }

    /// Creates a client whose non-poll requests time out after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`SignalingError::Transport`] if the HTTP client cannot be
    /// built.
    pub fn with_timeout(
        base_url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, SignalingError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SignalingError::Transport(format!("failed to build HTTP client: {e}")))?;
        Ok(Self::with_client(client, base_url))
    }

    /// Creates a client with a pre-configured HTTP client.
    pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Returns the gateway base URL.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Creates a gateway session.
    ///
    /// # Errors
    ///
    /// [`SignalingError::Transport`] or [`SignalingError::Protocol`].
    pub async fn create_session(&self) -> Result<SessionId, SignalingError> {
        let response = self
            .post(&self.base_url, None, Request::new("create", transaction()))
            .await?;
        let id = data_id(&response)?;
        log::info!("[Janus] Created session {id}");
        Ok(SessionId(id))
    }

    /// Attaches `plugin` to `session`.
    ///
    /// # Errors
    ///
    /// [`SignalingError::Transport`], [`SignalingError::Protocol`] or
    /// [`SignalingError::NoSuchSession`].
    pub async fn attach_plugin(
        &self,
        session: SessionId,
        plugin: &str,
    ) -> Result<PluginId, SignalingError> {
        let mut request = Request::new("attach", transaction());
        request.plugin = Some(plugin);
        let response = self
            .post(&self.session_url(session), Some(session), request)
            .await?;
        let id = data_id(&response)?;
        log::debug!("[Janus] Attached {plugin} to session {session} as handle {id}");
        Ok(PluginId(id))
    }

    /// Asks the plugin to stream channel `channel_id`.
    ///
    /// # Errors
    ///
    /// As for [`SignalingClient::attach_plugin`].
    pub async fn watch(
        &self,
        session: SessionId,
        plugin: PluginId,
        channel_id: u64,
    ) -> Result<(), SignalingError> {
        let mut request = Request::new("message", transaction());
        request.body = Some(json!({ "request": "watch", "channelId": channel_id }));
        self.post(&self.handle_url(session, plugin), Some(session), request)
            .await?;
        log::debug!("[Janus] Watch {channel_id} requested on session {session}");
        Ok(())
    }

    /// Sends the local SDP answer and starts the stream.
    ///
    /// # Errors
    ///
    /// As for [`SignalingClient::attach_plugin`].
    pub async fn start(
        &self,
        session: SessionId,
        plugin: PluginId,
        answer_sdp: &str,
    ) -> Result<(), SignalingError> {
        let mut request = Request::new("message", transaction());
        request.body = Some(json!({ "request": "start" }));
        request.jsep = Some(Jsep::answer(answer_sdp));
        self.post(&self.handle_url(session, plugin), Some(session), request)
            .await?;
        log::debug!("[Janus] Answer sent on session {session}");
        Ok(())
    }

    /// Trickles one local ICE candidate.
    ///
    /// # Errors
    ///
    /// As for [`SignalingClient::attach_plugin`].
    pub async fn trickle_ice_candidate(
        &self,
        session: SessionId,
        plugin: PluginId,
        candidate: &IceCandidate,
    ) -> Result<(), SignalingError> {
        let mut request = Request::new("trickle", transaction());
        request.candidate = Some(Candidate::One(candidate));
        self.post(&self.handle_url(session, plugin), Some(session), request)
            .await?;
        Ok(())
    }

    /// Signals the end of local candidate gathering.
    ///
    /// # Errors
    ///
    /// As for [`SignalingClient::attach_plugin`].
    pub async fn trickle_complete(
        &self,
        session: SessionId,
        plugin: PluginId,
    ) -> Result<(), SignalingError> {
        let mut request = Request::new("trickle", transaction());
        request.candidate = Some(Candidate::Completed { completed: true });
        self.post(&self.handle_url(session, plugin), Some(session), request)
            .await?;
        Ok(())
    }

    /// One long poll for pending session events.
    ///
    /// The gateway holds the request until events are available or its own
    /// poll timeout passes; the client allows a little longer than that.
    ///
    /// # Errors
    ///
    /// - [`SignalingError::NoSuchSession`] for a 404
    /// - [`SignalingError::Protocol`] if any returned event carries an error
    /// - [`SignalingError::Transport`] otherwise
    pub async fn long_poll_session(
        &self,
        session: SessionId,
    ) -> Result<Vec<JanusEvent>, SignalingError> {
        let url = format!(
            "{}?maxev={LONG_POLL_MAX_EVENTS}&rid={}",
            self.session_url(session),
            chrono::Utc::now().timestamp_millis()
        );

        let response = self
            .client
            .get(&url)
            .timeout(LONG_POLL_TIMEOUT + LONG_POLL_MARGIN)
            .send()
            .await
            .map_err(transport)?;
        check_status(response.status(), Some(session))?;

        let events = response
            .json::<PollResponse>()
            .await
            .map_err(|e| SignalingError::Transport(format!("invalid poll response: {e}")))?
            .into_events();

        if let Some(error) = events.iter().find_map(|e| e.error.as_ref()) {
            return Err(SignalingError::Protocol {
                code: error.code,
                reason: error.reason.clone(),
            });
        }
        log::trace!("[Janus] Session {session} polled {} event(s)", events.len());
        Ok(events)
    }

    /// Long-polls until an event carries an SDP offer, and returns its SDP.
    ///
    /// Never returns on its own if no offer arrives; drop the future to stop.
    ///
    /// # Errors
    ///
    /// The first error from [`SignalingClient::long_poll_session`].
    pub async fn wait_for_sdp_offer(&self, session: SessionId) -> Result<String, SignalingError> {
        loop {
            let events = self.long_poll_session(session).await?;
            if let Some(jsep) = events
                .into_iter()
                .filter_map(|e| e.jsep)
                .find(Jsep::is_offer)
            {
                log::debug!("[Janus] Offer received on session {session}");
                return Ok(jsep.sdp);
            }
        }
    }

    /// Destroys the session.
    ///
    /// # Errors
    ///
    /// As for [`SignalingClient::attach_plugin`].
    pub async fn destroy(&self, session: SessionId) -> Result<(), SignalingError> {
        self.post(
            &self.session_url(session),
            Some(session),
            Request::new("destroy", transaction()),
        )
        .await?;
        log::info!("[Janus] Destroyed session {session}");
        Ok(())
    }

    fn session_url(&self, session: SessionId) -> String {
        format!("{}/{}", self.base_url, session)
    }

    fn handle_url(&self, session: SessionId, plugin: PluginId) -> String {
        format!("{}/{}/{}", self.base_url, session, plugin)
    }

    /// POST one request and validate the synchronous response.
    async fn post(
        &self,
        url: &str,
        session: Option<SessionId>,
        request: Request<'_>,
    ) -> Result<Response, SignalingError> {
        let sent = request.transaction.clone();
        log::trace!("[Janus] {} -> {url}", request.janus);

        let response = self
            .client
            .post(url)
            .json(&request)
            .send()
            .await
            .map_err(transport)?;
        check_status(response.status(), session)?;

        let body: Response = response
            .json()
            .await
            .map_err(|e| SignalingError::Transport(format!("invalid response body: {e}")))?;

        if let Some(error) = body.error {
            return Err(SignalingError::Protocol {
                code: error.code,
                reason: error.reason,
            });
        }
        match body.transaction.as_deref() {
            Some(received) if received != sent => Err(SignalingError::TransactionMismatch {
                sent,
                received: received.to_string(),
            }),
            _ => Ok(body),
        }
    }
}

/// Fresh random transaction id.
fn transaction() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

fn transport(e: reqwest::Error) -> SignalingError {
    if e.is_timeout() {
        SignalingError::Transport(format!("request timed out: {e}"))
    } else {
        SignalingError::Transport(e.to_string())
    }
}

fn check_status(status: StatusCode, session: Option<SessionId>) -> Result<(), SignalingError> {
    match session {
        Some(session) if status == StatusCode::NOT_FOUND => {
            Err(SignalingError::NoSuchSession(session))
        }
        _ if !status.is_success() => Err(SignalingError::Transport(format!("HTTP {status}"))),
        _ => Ok(()),
    }
}

fn data_id(response: &Response) -> Result<u64, SignalingError> {
    response
        .data
        .as_ref()
        .map(|d| d.id)
        .ok_or_else(|| SignalingError::Transport("response has no data.id".to_string()))
}
