#![allow(dead_code)]

use futures_util::{SinkExt, StreamExt};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

pub type ServerStream = WebSocketStream<TcpStream>;

const TIMESTAMP: &str = "2023-07-19T14:56:51.634234626Z";

/// Local EventSub stand-in. Every accepted connection runs `script` with
/// its zero-based connection index.
pub struct MockServer {
    pub url: String,
    connections: Arc<AtomicUsize>,
}

impl MockServer {
    pub async fn start<F, Fut>(script: F) -> Self
    where
        F: Fn(ServerStream, usize) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/ws", listener.local_addr().unwrap());
        let connections = Arc::new(AtomicUsize::new(0));
        let script = Arc::new(script);

        let counter = connections.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let index = counter.fetch_add(1, Ordering::SeqCst);
                let script = script.clone();
                tokio::spawn(async move {
                    if let Ok(ws) = tokio_tungstenite::accept_async(stream).await {
                        script(ws, index).await;
                    }
                });
            }
        });

        Self { url, connections }
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

pub async fn send(ws: &mut ServerStream, frame: String) {
    let _ = ws.send(Message::Text(frame.into())).await;
}

/// Drain the socket until the client goes away
pub async fn hold(mut ws: ServerStream) {
    while let Some(Ok(_)) = ws.next().await {}
}

pub fn welcome(session_id: &str, keepalive_seconds: u64) -> String {
    serde_json::json!({
        "metadata": {
            "message_id": format!("welcome-{}", session_id),
            "message_type": "session_welcome",
            "message_timestamp": TIMESTAMP
        },
        "payload": {
            "session": {
                "id": session_id,
                "status": "connected",
                "connected_at": TIMESTAMP,
                "keepalive_timeout_seconds": keepalive_seconds,
                "reconnect_url": null
            }
        }
    })
    .to_string()
}

pub fn keepalive(message_id: &str) -> String {
    serde_json::json!({
        "metadata": {
            "message_id": message_id,
            "message_type": "session_keepalive",
            "message_timestamp": TIMESTAMP
        },
        "payload": {}
    })
    .to_string()
}

pub fn notification(message_id: &str, subscription_type: &str, event: serde_json::Value) -> String {
    serde_json::json!({
        "metadata": {
            "message_id": message_id,
            "message_type": "notification",
            "message_timestamp": TIMESTAMP,
            "subscription_type": subscription_type,
            "subscription_version": "1"
        },
        "payload": {
            "subscription": subscription(subscription_type, "enabled"),
            "event": event
        }
    })
    .to_string()
}

pub fn revocation(message_id: &str, subscription_type: &str, status: &str) -> String {
    serde_json::json!({
        "metadata": {
            "message_id": message_id,
            "message_type": "revocation",
            "message_timestamp": TIMESTAMP,
            "subscription_type": subscription_type,
            "subscription_version": "1"
        },
        "payload": {
            "subscription": subscription(subscription_type, status)
        }
    })
    .to_string()
}

pub fn reconnect(session_id: &str, url: &str) -> String {
    serde_json::json!({
        "metadata": {
            "message_id": format!("reconnect-{}", session_id),
            "message_type": "session_reconnect",
            "message_timestamp": TIMESTAMP
        },
        "payload": {
            "session": {
                "id": session_id,
                "status": "reconnecting",
                "connected_at": TIMESTAMP,
                "keepalive_timeout_seconds": null,
                "reconnect_url": url
            }
        }
    })
    .to_string()
}

pub fn subscription(subscription_type: &str, status: &str) -> serde_json::Value {
    serde_json::json!({
        "id": "f1c2a387-161a-49f9-a165-0f21d7a4e1c4",
        "status": status,
        "type": subscription_type,
        "version": "1",
        "cost": 1,
        "condition": { "broadcaster_user_id": "12826" },
        "transport": { "method": "websocket", "session_id": "AQoQexAWVYKSTIu4ec_2VAxyuhAB" },
        "created_at": TIMESTAMP
    })
}
