//! # Live Tail Socket
//!
//! The client sends `{"type":"query","query":"SELECT ..."}` and receives
//! `{"type":"log","data":..}` for every matching ingested line. A new query
//! replaces the previous one; closing the socket unsubscribes.

use crate::AppState;
use async_trait::async_trait;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::Mutex;
use tp_query::live::SinkError;
use tp_query::{LiveSink, SubscriptionId};

#[derive(Deserialize, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    Query { query: String },
}

/// Write half of a socket, shared between the live forwarder and the
/// handler's own replies.
struct WsSink {
    tx: Mutex<SplitSink<WebSocket, Message>>,
}

impl WsSink {
    async fn send_text(&self, text: String) -> Result<(), SinkError> {
        self.tx.lock().await.send(Message::Text(text)).await?;
        Ok(())
    }
}

#[async_trait]
impl LiveSink for WsSink {
    async fn deliver(&self, event: String) -> Result<(), SinkError> {
        self.send_text(event).await
    }
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (tx, mut rx) = socket.split();
    let sink = Arc::new(WsSink { tx: Mutex::new(tx) });
    let mut current: Option<SubscriptionId> = None;

    while let Some(message) = rx.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };

        let request = match serde_json::from_str::<ClientMessage>(&text) {
            Ok(request) => request,
            Err(e) => {
                tracing::debug!("Ignoring socket message: {}", e);
                continue;
            }
        };

        match request {
            ClientMessage::Query { query } => {
                if let Some(previous) = current.take() {
                    state.live.unsubscribe(&previous).await;
                }
                match state.live.subscribe(&query, sink.clone()).await {
                    Ok(id) => current = Some(id),
                    Err(e) => {
                        let reply = json!({ "type": "error", "data": e.to_string() }).to_string();
                        if sink.send_text(reply).await.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    }

    if let Some(id) = current {
        state.live.unsubscribe(&id).await;
    }
}
