//! Integration tests for negotiation sessions against a mock gateway.

mod common;

use std::time::Duration;

use common::janus::{mount_gateway, mount_post, polls, posted, success_id, Reply, OFFER_SDP};
use serde_json::json;
use streamwatch::janus::{
    IceCandidate, NegotiationSession, SessionEvent, SessionSettings, SignalingClient,
    SignalingError,
};
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client(server: &MockServer) -> SignalingClient {
    SignalingClient::new(format!("{}/janus", server.uri())).unwrap()
}

fn fast_settings() -> SessionSettings {
    SessionSettings {
        poll_interval: Duration::from_millis(20),
        ..SessionSettings::default()
    }
}

async fn mount_offer(server: &MockServer, session: u64) {
    Mock::given(method("GET"))
        .and(path(format!("/janus/{session}")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "janus": "event",
            "sender": 22,
            "jsep": {"type": "offer", "sdp": OFFER_SDP},
        })))
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_create_runs_three_steps() {
    let server = MockServer::start().await;
    mount_gateway(&server, 11, 22).await;

    let session = NegotiationSession::create(client(&server), 42, &SessionSettings::default())
        .await
        .unwrap();
    assert_eq!(session.session_id().0, 11);
    assert_eq!(session.plugin_id().0, 22);
    assert_eq!(session.channel_id(), 42);
    assert!(!session.is_destroyed());

    assert_eq!(posted(&server, "attach").await[0]["plugin"], "janus.plugin.ftl");
    assert_eq!(
        posted(&server, "message").await[0]["body"],
        json!({"request": "watch", "channelId": 42})
    );
}

#[tokio::test]
async fn test_create_destroys_session_when_attach_fails() {
    let server = MockServer::start().await;
    mount_post(&server, "/janus", "create", success_id(11)).await;
    mount_post(
        &server,
        "/janus/11",
        "attach",
        Reply(json!({"janus": "error", "error": {"code": 460, "reason": "No such plugin"}})),
    )
    .await;
    mount_post(&server, "/janus/11", "destroy", Reply(json!({"janus": "success"}))).await;

    let result = NegotiationSession::create(client(&server), 42, &SessionSettings::default()).await;
    assert!(matches!(result, Err(SignalingError::Protocol { code: 460, .. })));
    assert_eq!(posted(&server, "destroy").await.len(), 1);
}

#[tokio::test]
async fn test_abandoned_create_destroys_session() {
    let server = MockServer::start().await;
    mount_post(&server, "/janus", "create", success_id(11)).await;
    Mock::given(method("POST"))
        .and(path("/janus/11"))
        .and(body_partial_json(json!({"janus": "attach"})))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(30)))
        .mount(&server)
        .await;
    mount_post(&server, "/janus/11", "destroy", Reply(json!({"janus": "success"}))).await;

    let settings = SessionSettings::default();
    let creating = NegotiationSession::create(client(&server), 42, &settings);
    let result = tokio::time::timeout(Duration::from_millis(300), creating).await;
    assert!(result.is_err(), "attach should still be pending");

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while posted(&server, "destroy").await.is_empty() {
        assert!(tokio::time::Instant::now() < deadline, "session 11 never destroyed");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(posted(&server, "attach").await.len(), 1);
    assert!(posted(&server, "message").await.is_empty());
}

#[tokio::test]
async fn test_completed_create_is_not_destroyed() {
    let server = MockServer::start().await;
    mount_gateway(&server, 11, 22).await;

    let session = NegotiationSession::create(client(&server), 42, &SessionSettings::default())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(posted(&server, "destroy").await.is_empty());
    assert!(!session.is_destroyed());
}

#[tokio::test]
async fn test_offer_is_fetched_once() {
    let server = MockServer::start().await;
    mount_gateway(&server, 11, 22).await;
    mount_offer(&server, 11).await;

    let session = NegotiationSession::create(client(&server), 42, &SessionSettings::default())
        .await
        .unwrap();
    let (a, b) = tokio::join!(session.sdp_offer(), session.sdp_offer());
    assert_eq!(a.unwrap(), OFFER_SDP);
    assert_eq!(b.unwrap(), OFFER_SDP);
    assert_eq!(session.sdp_offer().await.unwrap(), OFFER_SDP);
    assert_eq!(polls(&server).await, 1);
}

#[tokio::test]
async fn test_destroy_cancels_offer_wait() {
    let server = MockServer::start().await;
    mount_gateway(&server, 11, 22).await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"janus": "keepalive"}))
                .set_delay(Duration::from_secs(30)),
        )
        .mount(&server)
        .await;

    let session = NegotiationSession::create(client(&server), 42, &SessionSettings::default())
        .await
        .unwrap();
    let waiting = tokio::spawn({
        let session = session.clone();
        async move { session.sdp_offer().await }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    session.destroy().await.unwrap();

    let result = tokio::time::timeout(Duration::from_secs(2), waiting)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result, Err(SignalingError::Cancelled));
}

#[tokio::test]
async fn test_destroy_is_idempotent_and_tolerates_missing_session() {
    let server = MockServer::start().await;
    mount_gateway(&server, 11, 22).await;
    let session = NegotiationSession::create(client(&server), 42, &SessionSettings::default())
        .await
        .unwrap();

    // The gateway has already reaped the session.
    server.reset().await;
    Mock::given(path("/janus/11"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    session.destroy().await.unwrap();
    session.destroy().await.unwrap();
    assert!(session.is_destroyed());
    assert_eq!(posted(&server, "destroy").await.len(), 1);

    let candidate = IceCandidate {
        candidate: "candidate:1 1 udp 1 192.0.2.1 5000 typ host".into(),
        sdp_mid: Some("0".into()),
        sdp_m_line_index: Some(0),
    };
    assert_eq!(
        session.trickle_ice_candidate(&candidate).await,
        Err(SignalingError::Cancelled)
    );
    assert_eq!(session.trickle_complete().await, Err(SignalingError::Cancelled));
    assert_eq!(session.start("v=0").await, Err(SignalingError::Cancelled));
}

#[tokio::test]
async fn test_start_forwards_gateway_events() {
    let server = MockServer::start().await;
    mount_gateway(&server, 11, 22).await;
    Mock::given(method("GET"))
        .and(path("/janus/11"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"janus": "webrtcup", "sender": 22},
            {"janus": "media", "sender": 22, "type": "video", "receiving": true},
            {"janus": "keepalive"},
        ])))
        .mount(&server)
        .await;

    let session = NegotiationSession::create(client(&server), 42, &fast_settings())
        .await
        .unwrap();
    let mut events = session.take_events().unwrap();
    assert!(session.take_events().is_none());

    session.start("v=0 answer").await.unwrap();
    let first = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .unwrap();
    assert_eq!(first, Some(SessionEvent::WebRtcUp));
    assert_eq!(
        events.recv().await,
        Some(SessionEvent::Media {
            kind: "video".into(),
            receiving: true
        })
    );

    session.destroy().await.unwrap();
}

#[tokio::test]
async fn test_poll_loop_reports_lost_session() {
    let server = MockServer::start().await;
    mount_gateway(&server, 11, 22).await;
    Mock::given(method("GET"))
        .and(path("/janus/11"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let session = NegotiationSession::create(client(&server), 42, &fast_settings())
        .await
        .unwrap();
    let mut events = session.take_events().unwrap();
    session.start("v=0 answer").await.unwrap();

    let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .unwrap();
    assert_eq!(event, Some(SessionEvent::Lost));

    // Polling stopped after the loss.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(polls(&server).await, 1);
}
