//! Janus gateway doubles built on wiremock.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

/// Offer SDP used by the doubles.
pub const OFFER_SDP: &str = "v=0\r\no=- 1 1 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\nm=video 9 UDP/TLS/RTP/SAVPF 96\r\na=mid:0\r\n";

/// Parse a recorded request body.
pub fn body(request: &Request) -> Value {
    serde_json::from_slice(&request.body).unwrap_or(Value::Null)
}

/// Responds with a fixed body, echoing the request's transaction.
pub struct Reply(pub Value);

impl Respond for Reply {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let mut reply = self.0.clone();
        if let Some(tx) = body(request).get("transaction") {
            reply["transaction"] = tx.clone();
        }
        ResponseTemplate::new(200).set_body_json(reply)
    }
}

/// `{"janus": "success", "data": {"id": id}}`.
pub fn success_id(id: u64) -> Reply {
    Reply(json!({ "janus": "success", "data": { "id": id } }))
}

/// `{"janus": "ack"}`.
pub fn ack() -> Reply {
    Reply(json!({ "janus": "ack" }))
}

/// Mount `reply` for POSTs to `route` whose body has `janus: kind`.
pub async fn mount_post(server: &MockServer, route: &str, kind: &str, reply: impl Respond + 'static) {
    Mock::given(method("POST"))
        .and(path(route))
        .and(body_partial_json(json!({ "janus": kind })))
        .respond_with(reply)
        .mount(server)
        .await;
}

/// Mount a gateway that creates `session`, attaches `handle`, acks messages
/// and trickles, and destroys successfully.
pub async fn mount_gateway(server: &MockServer, session: u64, handle: u64) {
    let session_path = format!("/janus/{session}");
    let handle_path = format!("/janus/{session}/{handle}");
    mount_post(server, "/janus", "create", success_id(session)).await;
    mount_post(server, &session_path, "attach", success_id(handle)).await;
    mount_post(server, &handle_path, "message", ack()).await;
    mount_post(server, &handle_path, "trickle", ack()).await;
    mount_post(server, &session_path, "destroy", Reply(json!({ "janus": "success" }))).await;
}

/// Bodies of recorded POSTs with `janus: kind`.
pub async fn posted(server: &MockServer, kind: &str) -> Vec<Value> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|r| r.method.as_str() == "POST")
        .map(body)
        .filter(|b| b["janus"] == kind)
        .collect()
}

/// Number of recorded long polls.
pub async fn polls(server: &MockServer) -> usize {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|r| r.method.as_str() == "GET")
        .count()
}

/// A stateful gateway serving any number of sessions.
///
/// Sessions are numbered from 1000, handles from 2000. Each session learns
/// its channel from the watch request. Channels in `slow` never produce an
/// offer; their polls hang. Every other session gets one offer, then
/// keepalives. Trickled candidates are recorded per session.
#[derive(Clone, Default)]
pub struct FakeGateway {
    state: Arc<GatewayState>,
}

#[derive(Default)]
struct GatewayState {
    next_id: AtomicU64,
    slow: Mutex<HashSet<u64>>,
    attach_delay: Mutex<Option<Duration>>,
    created: Mutex<Vec<u64>>,
    trickles: Mutex<Vec<(u64, Value)>>,
    channels: Mutex<HashMap<u64, u64>>,
    offered: Mutex<HashSet<u64>>,
    polled: Mutex<Vec<u64>>,
    destroyed: Mutex<Vec<u64>>,
}

impl FakeGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `channel` hang on polls.
    pub fn slow(self, channel: u64) -> Self {
        self.state.slow.lock().unwrap().insert(channel);
        self
    }

    /// Hold every attach reply for `delay`.
    pub fn delay_attach(self, delay: Duration) -> Self {
        *self.state.attach_delay.lock().unwrap() = Some(delay);
        self
    }

    pub async fn mount(&self, server: &MockServer) {
        Mock::given(wiremock::matchers::any())
            .respond_with(self.clone())
            .mount(server)
            .await;
    }

    /// Session watching `channel`, if any.
    pub fn session_for(&self, channel: u64) -> Option<u64> {
        self.state
            .channels
            .lock()
            .unwrap()
            .iter()
            .find(|(_, c)| **c == channel)
            .map(|(s, _)| *s)
    }

    pub fn was_polled(&self, session: u64) -> bool {
        self.state.polled.lock().unwrap().contains(&session)
    }

    pub fn destroyed(&self) -> Vec<u64> {
        self.state.destroyed.lock().unwrap().clone()
    }

    /// Sessions in creation order.
    pub fn created(&self) -> Vec<u64> {
        self.state.created.lock().unwrap().clone()
    }

    /// `candidate` objects trickled on `session`, in order.
    pub fn trickles(&self, session: u64) -> Vec<Value> {
        self.state
            .trickles
            .lock()
            .unwrap()
            .iter()
            .filter(|(s, _)| *s == session)
            .map(|(_, c)| c.clone())
            .collect()
    }

    fn allocate(&self, base: u64) -> u64 {
        base + self.state.next_id.fetch_add(1, Ordering::SeqCst)
    }
}

impl Respond for FakeGateway {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let segments: Vec<u64> = request
            .url
            .path_segments()
            .into_iter()
            .flatten()
            .skip(1)
            .filter_map(|s| s.parse().ok())
            .collect();
        let sent = body(request);
        let tx = sent.get("transaction").cloned().unwrap_or(Value::Null);
        let ok = |mut reply: Value| {
            reply["transaction"] = tx.clone();
            ResponseTemplate::new(200).set_body_json(reply)
        };

        if request.method.as_str() == "GET" {
            let Some(&session) = segments.first() else {
                return ResponseTemplate::new(404);
            };
            self.state.polled.lock().unwrap().push(session);
            let channel = self.state.channels.lock().unwrap().get(&session).copied();
            let Some(channel) = channel else {
                return ResponseTemplate::new(404);
            };
            if self.state.slow.lock().unwrap().contains(&channel) {
                return ResponseTemplate::new(200)
                    .set_body_json(json!([{ "janus": "keepalive" }]))
                    .set_delay(Duration::from_secs(30));
            }
            if self.state.offered.lock().unwrap().insert(session) {
                return ResponseTemplate::new(200).set_body_json(json!([{
                    "janus": "event",
                    "sender": 1,
                    "jsep": { "type": "offer", "sdp": OFFER_SDP },
                }]));
            }
            return ResponseTemplate::new(200)
                .set_body_json(json!([{ "janus": "keepalive" }]))
                .set_delay(Duration::from_millis(200));
        }

        match (sent["janus"].as_str().unwrap_or_default(), segments.as_slice()) {
            ("create", []) => {
                let session = self.allocate(1000);
                self.state.created.lock().unwrap().push(session);
                ok(json!({ "janus": "success", "data": { "id": session } }))
            }
            ("attach", [_]) => {
                let reply = ok(json!({ "janus": "success", "data": { "id": self.allocate(2000) } }));
                match *self.state.attach_delay.lock().unwrap() {
                    Some(delay) => reply.set_delay(delay),
                    None => reply,
                }
            }
            ("message", [session, _]) => {
                if sent["body"]["request"] == "watch" {
                    if let Some(channel) = sent["body"]["channelId"].as_u64() {
                        self.state.channels.lock().unwrap().insert(*session, channel);
                    }
                }
                ok(json!({ "janus": "ack" }))
            }
            ("trickle", [session, _]) => {
                self.state
                    .trickles
                    .lock()
                    .unwrap()
                    .push((*session, sent["candidate"].clone()));
                ok(json!({ "janus": "ack" }))
            }
            ("destroy", [session]) => {
                self.state.destroyed.lock().unwrap().push(*session);
                ok(json!({ "janus": "success" }))
            }
            _ => ResponseTemplate::new(400),
        }
    }
}
