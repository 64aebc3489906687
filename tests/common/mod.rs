//! Shared test helpers: an in-process Phoenix server and Janus doubles.
//!
//! The server accepts one WebSocket connection and exposes its frames to the
//! test, which scripts every reply by hand.

#![allow(dead_code)]

pub mod janus;

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use streamwatch::phoenix::Message;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::Message as WsFrame;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// Scripted Phoenix server for one client connection.
pub struct MockPhoenix {
    /// Socket endpoint to pass to `Socket::open`.
    pub url: String,
    incoming: mpsc::UnboundedReceiver<Message>,
    outgoing: mpsc::UnboundedSender<Option<String>>,
    handshake_query: mpsc::UnboundedReceiver<String>,
}

impl MockPhoenix {
    /// Bind on localhost and wait for one client in the background.
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (incoming_tx, incoming) = mpsc::unbounded_channel();
        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<Option<String>>();
        let (query_tx, handshake_query) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_hdr_async(
                stream,
                |request: &Request, response: Response| {
                    let _ = query_tx.send(request.uri().query().unwrap_or_default().to_string());
                    Ok(response)
                },
            )
            .await
            .unwrap();
            let (mut sink, mut source) = ws.split();

            loop {
                tokio::select! {
                    frame = source.next() => match frame {
                        Some(Ok(WsFrame::Text(text))) => {
                            let msg = Message::decode(&text).unwrap();
                            let _ = incoming_tx.send(msg);
                        }
                        Some(Ok(WsFrame::Close(_))) | None | Some(Err(_)) => break,
                        Some(Ok(_)) => {}
                    },
                    out = outgoing_rx.recv() => match out {
                        Some(Some(text)) => {
                            if sink.send(WsFrame::Text(text)).await.is_err() {
                                break;
                            }
                        }
                        Some(None) | None => {
                            let _ = sink.close().await;
                            break;
                        }
                    },
                }
            }
        });

        Self {
            url: format!("ws://{addr}/socket/websocket"),
            incoming,
            outgoing,
            handshake_query,
        }
    }

    /// Query string of the client's handshake request.
    pub async fn handshake_query(&mut self) -> String {
        tokio::time::timeout(RECV_TIMEOUT, self.handshake_query.recv())
            .await
            .expect("no handshake")
            .expect("server task ended")
    }

    /// Next frame from the client, heartbeats included.
    pub async fn recv(&mut self) -> Message {
        tokio::time::timeout(RECV_TIMEOUT, self.incoming.recv())
            .await
            .expect("timed out waiting for a client frame")
            .expect("client disconnected")
    }

    /// Next non-heartbeat frame from the client.
    pub async fn recv_push(&mut self) -> Message {
        loop {
            let msg = self.recv().await;
            if msg.topic != "phoenix" {
                return msg;
            }
        }
    }

    /// Whether the client sends nothing (except heartbeats) for `wait`.
    pub async fn is_quiet(&mut self, wait: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            match tokio::time::timeout_at(deadline, self.incoming.recv()).await {
                Err(_) => return true,
                Ok(None) => return true,
                Ok(Some(msg)) if msg.topic == "phoenix" => {}
                Ok(Some(_)) => return false,
            }
        }
    }

    /// Send one frame.
    pub fn send(&self, msg: &Message) {
        self.send_raw(msg.encode().unwrap());
    }

    /// Send raw text, e.g. a malformed frame.
    pub fn send_raw(&self, text: impl Into<String>) {
        self.outgoing.send(Some(text.into())).unwrap();
    }

    /// Reply to `to` with `status` and `response`.
    pub fn reply(&self, to: &Message, status: &str, response: Value) {
        self.send(&Message {
            join_ref: to.join_ref.clone(),
            msg_ref: to.msg_ref.clone(),
            topic: to.topic.clone(),
            event: "phx_reply".to_string(),
            payload: json!({ "status": status, "response": response }),
        });
    }

    /// Reply ok to `to`.
    pub fn reply_ok(&self, to: &Message, response: Value) {
        self.reply(to, "ok", response);
    }

    /// Expect a join and accept it.
    pub async fn accept_join(&mut self) -> Message {
        let join = self.recv_push().await;
        assert_eq!(join.event, "phx_join");
        assert_eq!(join.join_ref, join.msg_ref);
        self.reply_ok(&join, json!({}));
        join
    }

    /// Push `subscription:data` for `id`.
    pub fn push_data(&self, id: &str, result: Value) {
        self.send(&Message {
            join_ref: None,
            msg_ref: None,
            topic: id.to_string(),
            event: "subscription:data".to_string(),
            payload: json!({ "result": result, "subscriptionId": id }),
        });
    }

    /// Close the WebSocket from the server side.
    pub fn close(&self) {
        let _ = self.outgoing.send(None);
    }
}

/// Poll `cond` every 10ms until it holds, panicking after 5s.
pub async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
    while !cond() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
