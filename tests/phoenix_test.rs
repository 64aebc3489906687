//! Integration tests for the Phoenix socket and channels against a scripted
//! server.

mod common;

use std::time::Duration;

use common::{wait_until, MockPhoenix};
use serde_json::json;
use streamwatch::phoenix::{ChannelError, Message, Socket, SocketOptions, SocketState};

fn quiet_options() -> SocketOptions {
    SocketOptions {
        heartbeat_interval: Duration::from_secs(600),
        push_timeout: Duration::from_secs(2),
        params: Vec::new(),
    }
}

#[tokio::test]
async fn test_handshake_carries_vsn_and_params() {
    let mut server = MockPhoenix::start().await;
    let socket = Socket::open(&server.url, quiet_options().param("token", "t0k"))
        .await
        .unwrap();

    let query = server.handshake_query().await;
    assert_eq!(query, "vsn=2.0.0&token=t0k");
    assert_eq!(socket.state(), SocketState::Open);
    socket.close();
}

#[tokio::test]
async fn test_join_and_push_reply() {
    let mut server = MockPhoenix::start().await;
    let socket = Socket::open(&server.url, quiet_options()).await.unwrap();
    let channel = socket.channel("room:lobby");

    let joining = tokio::spawn({
        let channel = channel.clone();
        async move { channel.join(json!({"user": 1})).await }
    });
    let join = server.recv_push().await;
    assert_eq!(join.topic, "room:lobby");
    assert_eq!(join.event, "phx_join");
    assert_eq!(join.payload, json!({"user": 1}));
    assert_eq!(join.join_ref, Some(channel.join_ref().to_string()));
    server.reply_ok(&join, json!({"welcome": true}));
    assert_eq!(joining.await.unwrap().unwrap(), json!({"welcome": true}));
    assert!(channel.is_joined());

    let pushing = tokio::spawn({
        let channel = channel.clone();
        async move { channel.push("new_msg", json!({"body": "hi"})).await }
    });
    let push = server.recv_push().await;
    assert_eq!(push.join_ref, join.join_ref);
    assert_ne!(push.msg_ref, join.msg_ref);
    server.reply_ok(&push, json!({"id": 7}));
    assert_eq!(pushing.await.unwrap().unwrap(), json!({"id": 7}));
}

#[tokio::test]
async fn test_concurrent_pushes_resolve_by_ref() {
    let mut server = MockPhoenix::start().await;
    let socket = Socket::open(&server.url, quiet_options()).await.unwrap();
    let channel = socket.channel("room:lobby");
    let joining = tokio::spawn({
        let channel = channel.clone();
        async move { channel.join(json!({})).await }
    });
    server.accept_join().await;
    joining.await.unwrap().unwrap();

    let mut tasks = Vec::new();
    for i in 0..3 {
        let channel = channel.clone();
        tasks.push(tokio::spawn(async move {
            channel.push("echo", json!({ "n": i })).await
        }));
    }

    let mut pushes = Vec::new();
    for _ in 0..3 {
        pushes.push(server.recv_push().await);
    }
    // Answer in reverse order of arrival, echoing each payload.
    for push in pushes.iter().rev() {
        server.reply_ok(push, push.payload.clone());
    }

    for (i, task) in tasks.into_iter().enumerate() {
        assert_eq!(task.await.unwrap().unwrap(), json!({ "n": i }));
    }
}

#[tokio::test]
async fn test_join_rejected() {
    let mut server = MockPhoenix::start().await;
    let socket = Socket::open(&server.url, quiet_options()).await.unwrap();
    let channel = socket.channel("private:1");

    let joining = tokio::spawn({
        let channel = channel.clone();
        async move { channel.join(json!({})).await }
    });
    let join = server.recv_push().await;
    server.reply(&join, "error", json!({"reason": "unauthorized"}));

    match joining.await.unwrap() {
        Err(ChannelError::JoinRejected { topic, response }) => {
            assert_eq!(topic, "private:1");
            assert_eq!(response, json!({"reason": "unauthorized"}));
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(!channel.is_joined());
}

#[tokio::test]
async fn test_push_rejected_and_not_joined() {
    let mut server = MockPhoenix::start().await;
    let socket = Socket::open(&server.url, quiet_options()).await.unwrap();
    let channel = socket.channel("room:lobby");

    assert!(matches!(
        channel.push("early", json!({})).await,
        Err(ChannelError::NotJoined { .. })
    ));

    let joining = tokio::spawn({
        let channel = channel.clone();
        async move { channel.join(json!({})).await }
    });
    server.accept_join().await;
    joining.await.unwrap().unwrap();

    let pushing = tokio::spawn({
        let channel = channel.clone();
        async move { channel.push("bad", json!({})).await }
    });
    let push = server.recv_push().await;
    server.reply(&push, "error", json!({"reason": "nope"}));
    match pushing.await.unwrap() {
        Err(ChannelError::PushRejected { event, status, .. }) => {
            assert_eq!(event, "bad");
            assert_eq!(status, "error");
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn test_channel_close_fails_pending_push() {
    let mut server = MockPhoenix::start().await;
    let socket = Socket::open(&server.url, quiet_options()).await.unwrap();
    let channel = socket.channel("room:lobby");
    let joining = tokio::spawn({
        let channel = channel.clone();
        async move { channel.join(json!({})).await }
    });
    let join = server.accept_join().await;
    joining.await.unwrap().unwrap();

    let pushing = tokio::spawn({
        let channel = channel.clone();
        async move { channel.push("slow", json!({})).await }
    });
    server.recv_push().await;
    server.send(&Message {
        join_ref: join.join_ref.clone(),
        msg_ref: None,
        topic: "room:lobby".into(),
        event: "phx_error".into(),
        payload: json!({}),
    });

    assert!(matches!(
        pushing.await.unwrap(),
        Err(ChannelError::ChannelClosed { .. })
    ));
    assert!(!channel.is_joined());
}

#[tokio::test]
async fn test_push_times_out() {
    let mut server = MockPhoenix::start().await;
    let options = SocketOptions {
        push_timeout: Duration::from_millis(200),
        ..quiet_options()
    };
    let socket = Socket::open(&server.url, options).await.unwrap();
    let channel = socket.channel("room:lobby");

    let joining = tokio::spawn({
        let channel = channel.clone();
        async move { channel.join(json!({})).await }
    });
    server.recv_push().await;
    assert!(matches!(
        joining.await.unwrap(),
        Err(ChannelError::Timeout { .. })
    ));
}

#[tokio::test]
async fn test_leave_semantics() {
    let mut server = MockPhoenix::start().await;
    let socket = Socket::open(&server.url, quiet_options()).await.unwrap();
    let channel = socket.channel("room:lobby");

    // Not joined: nothing is sent.
    channel.leave().await.unwrap();
    assert!(server.is_quiet(Duration::from_millis(100)).await);

    let joining = tokio::spawn({
        let channel = channel.clone();
        async move { channel.join(json!({})).await }
    });
    server.accept_join().await;
    joining.await.unwrap().unwrap();

    let leaving = tokio::spawn({
        let channel = channel.clone();
        async move { channel.leave().await }
    });
    let leave = server.recv_push().await;
    assert_eq!(leave.event, "phx_leave");
    assert!(!channel.is_joined());
    // Any reply status counts as left.
    server.reply(&leave, "error", json!({}));
    leaving.await.unwrap().unwrap();

    assert!(matches!(
        channel.push("after", json!({})).await,
        Err(ChannelError::NotJoined { .. })
    ));
}

#[tokio::test]
async fn test_malformed_frame_is_dropped() {
    let mut server = MockPhoenix::start().await;
    let socket = Socket::open(&server.url, quiet_options()).await.unwrap();
    let channel = socket.channel("room:lobby");

    let joining = tokio::spawn({
        let channel = channel.clone();
        async move { channel.join(json!({})).await }
    });
    let join = server.recv_push().await;
    server.send_raw("not json");
    server.send_raw(r#"["1","1","room:lobby"]"#);
    server.reply_ok(&join, json!({}));

    joining.await.unwrap().unwrap();
    assert!(socket.is_open());
}

#[tokio::test]
async fn test_non_ascii_malformed_frame_is_dropped() {
    // The dropped frame is logged, so its preview must be built.
    let _ = env_logger::builder()
        .is_test(true)
        .filter_level(log::LevelFilter::Trace)
        .try_init();
    let mut server = MockPhoenix::start().await;
    let socket = Socket::open(&server.url, quiet_options()).await.unwrap();
    let channel = socket.channel("room:lobby");

    let joining = tokio::spawn({
        let channel = channel.clone();
        async move { channel.join(json!({})).await }
    });
    let join = server.recv_push().await;
    // 'é' straddles byte 100.
    server.send_raw(format!("{}é not json", "x".repeat(99)));
    server.send_raw("ß".repeat(120));
    server.reply_ok(&join, json!({}));

    joining.await.unwrap().unwrap();
    assert!(socket.is_open());
}

#[tokio::test]
async fn test_subscribers_see_only_later_frames() {
    let mut server = MockPhoenix::start().await;
    let socket = Socket::open(&server.url, quiet_options()).await.unwrap();

    let early = Message::new(None, None, "news", "headline", json!({"n": 1}));
    let late = Message::new(None, None, "news", "headline", json!({"n": 2}));

    let mut first = socket.subscribe();
    server.send(&early);
    assert_eq!(first.recv().await.unwrap(), early);

    let mut second = socket.subscribe();
    server.send(&late);
    assert_eq!(first.recv().await.unwrap(), late);
    assert_eq!(second.recv().await.unwrap(), late);
}

#[tokio::test]
async fn test_heartbeat_acknowledged_keeps_socket_open() {
    let mut server = MockPhoenix::start().await;
    let options = SocketOptions {
        heartbeat_interval: Duration::from_millis(200),
        ..quiet_options()
    };
    let socket = Socket::open(&server.url, options).await.unwrap();

    for _ in 0..3 {
        let heartbeat = server.recv().await;
        assert_eq!(heartbeat.topic, "phoenix");
        assert_eq!(heartbeat.event, "heartbeat");
        assert_eq!(heartbeat.join_ref, None);
        assert!(heartbeat.msg_ref.is_some());
        server.reply_ok(&heartbeat, json!({}));
    }
    assert_eq!(socket.state(), SocketState::Open);
}

#[tokio::test]
async fn test_missed_heartbeat_closes_as_unknown() {
    let mut server = MockPhoenix::start().await;
    let options = SocketOptions {
        heartbeat_interval: Duration::from_millis(150),
        ..quiet_options()
    };
    let socket = Socket::open(&server.url, options).await.unwrap();
    let mut frames = socket.subscribe();

    let heartbeat = server.recv().await;
    assert_eq!(heartbeat.event, "heartbeat");
    // No reply.

    tokio::time::timeout(Duration::from_secs(2), socket.closed())
        .await
        .unwrap();
    wait_until("socket to finish closing", || {
        socket.state() == SocketState::Unknown
    })
    .await;
    assert!(matches!(
        frames.recv().await,
        Err(tokio::sync::broadcast::error::RecvError::Closed)
    ));
    assert!(matches!(
        socket.channel("room:lobby").join(json!({})).await,
        Err(ChannelError::Closed)
    ));
}

#[tokio::test]
async fn test_server_close_ends_socket() {
    let mut server = MockPhoenix::start().await;
    let socket = Socket::open(&server.url, quiet_options()).await.unwrap();
    let _ = server.handshake_query().await;

    server.close();
    tokio::time::timeout(Duration::from_secs(2), socket.closed())
        .await
        .unwrap();
    wait_until("socket state Closed", || socket.state() == SocketState::Closed).await;
    assert!(matches!(
        socket.send(&Message::new(None, None, "t", "e", json!({}))),
        Err(ChannelError::Closed)
    ));
}
