//! Janus HTTP API wire types.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::IceCandidate;

/// Session description carried in `jsep` fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jsep {
    /// `offer` or `answer`.
    #[serde(rename = "type")]
    pub kind: String,
    /// SDP text.
    pub sdp: String,
}

impl Jsep {
    /// An `answer` description.
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: "answer".to_string(),
            sdp: sdp.into(),
        }
    }

    /// Whether this is an offer.
    #[must_use]
    pub fn is_offer(&self) -> bool {
        self.kind == "offer"
    }
}

/// `error` object of a gateway response or event.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ErrorBody {
    /// Janus error code.
    pub code: i64,
    /// Error text.
    #[serde(default)]
    pub reason: String,
}

/// Outgoing request body.
#[derive(Debug, Serialize)]
pub(crate) struct Request<'a> {
    pub janus: &'a str,
    pub transaction: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plugin: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jsep: Option<Jsep>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub candidate: Option<Candidate<'a>>,
}

impl<'a> Request<'a> {
    pub fn new(janus: &'a str, transaction: String) -> Self {
        Self {
            janus,
            transaction,
            plugin: None,
            body: None,
            jsep: None,
            candidate: None,
        }
    }
}

/// Trickle payload: one candidate, or the end-of-candidates marker.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub(crate) enum Candidate<'a> {
    One(&'a IceCandidate),
    Completed { completed: bool },
}

/// `data` of a create/attach success.
#[derive(Debug, Deserialize)]
pub(crate) struct IdData {
    pub id: u64,
}

/// Synchronous response to a POST.
#[derive(Debug, Deserialize)]
pub(crate) struct Response {
    #[allow(dead_code)]
    pub janus: String,
    #[serde(default)]
    pub transaction: Option<String>,
    #[serde(default)]
    pub data: Option<IdData>,
    #[serde(default)]
    pub error: Option<ErrorBody>,
}

/// One asynchronous event from a long poll.
///
/// Only the fields this crate acts on are decoded; the rest are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct JanusEvent {
    /// Event kind (`event`, `webrtcup`, `media`, `slowlink`, `hangup`, ...).
    pub janus: String,
    /// Plugin handle the event came from.
    #[serde(default)]
    pub sender: Option<u64>,
    /// Session description, for negotiation events.
    #[serde(default)]
    pub jsep: Option<Jsep>,
    /// Media kind for `media` events (`audio`/`video`).
    #[serde(default, rename = "type")]
    pub media_type: Option<String>,
    /// Whether media is flowing, for `media` events.
    #[serde(default)]
    pub receiving: Option<bool>,
    /// Direction of a `slowlink` report.
    #[serde(default)]
    pub uplink: Option<bool>,
    /// Lost packets in a `slowlink` report.
    #[serde(default)]
    pub lost: Option<u64>,
    /// Reason for `hangup`.
    #[serde(default)]
    pub reason: Option<String>,
    /// Gateway error attached to the event.
    #[serde(default)]
    pub error: Option<ErrorBody>,
}

/// A long poll returns either one event or an array of them.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub(crate) enum PollResponse {
    Many(Vec<JanusEvent>),
    One(JanusEvent),
}

impl PollResponse {
    pub fn into_events(self) -> Vec<JanusEvent> {
        match self {
            Self::Many(events) => events,
            Self::One(event) => vec![event],
        }
    }
}
