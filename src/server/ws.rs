//! WebSocket binding for the multiplexer

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{error, warn};

use crate::server::{multiplexer::Multiplexer, AppState};

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    session_id: Option<String>,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
) -> impl IntoResponse {
    let multiplexer = state.multiplexer.clone();
    ws.on_upgrade(move |socket| handle_socket(socket, multiplexer, query.session_id))
}

async fn handle_socket(socket: WebSocket, multiplexer: Arc<Multiplexer>, requested: Option<String>) {
    let (mut sender, mut receiver) = socket.split();
    let (id, outbound) = multiplexer.connect(requested).await;

    let mut outbound = UnboundedReceiverStream::new(outbound);
    let writer = tokio::spawn(async move {
        while let Some(event) = outbound.next().await {
            let text = match serde_json::to_string(&event) {
                Ok(text) => text,
                Err(e) => {
                    error!("Failed to encode {:?}: {}", event, e);
                    continue;
                }
            };
            if sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(result) = receiver.next().await {
        match result {
            Ok(Message::Text(text)) => multiplexer.handle_text(id, text.as_str()).await,
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                warn!("WebSocket error on connection {}: {}", id, e);
                break;
            }
        }
    }

    multiplexer.disconnect(id);
    writer.abort();
}
