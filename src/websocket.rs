use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path as AxumPath, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info};

use crate::events::{EventBus, StreamEvent};
use crate::AppState;

/// Live status, detection and heartbeat events for one stream.
pub async fn stream_events_handler(
    ws: WebSocketUpgrade,
    AxumPath(stream_id): AxumPath<String>,
    State(state): State<AppState>,
) -> Response {
    match state.database.get_stream(&stream_id).await {
        Ok(Some(_)) => {}
        Ok(None) => return (StatusCode::NOT_FOUND, "Stream not found").into_response(),
        Err(e) => {
            error!("Failed to look up stream '{}': {}", stream_id, e);
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    }
    let events = state.events.clone();
    ws.on_upgrade(move |socket| handle_socket(socket, stream_id, events))
}

fn event_message(stream_id: &str, event: &StreamEvent) -> Option<Message> {
    if event.stream_id() != stream_id {
        return None;
    }
    match serde_json::to_string(event) {
        Ok(text) => Some(Message::Text(text)),
        Err(e) => {
            error!("Failed to serialize {} event: {}", event.kind(), e);
            None
        }
    }
}

async fn handle_socket(socket: WebSocket, stream_id: String, events: EventBus) {
    let (mut sender, mut receiver) = socket.split();
    let mut event_receiver = events.subscribe();

    info!("[{}] Event subscriber connected ({} total)", stream_id, events.subscriber_count());

    let send_stream_id = stream_id.clone();
    let send_task = tokio::spawn(async move {
        let mut sent = 0u64;
        let mut skipped = 0u64;

        loop {
            match event_receiver.recv().await {
                Ok(event) => {
                    let Some(message) = event_message(&send_stream_id, &event) else {
                        continue;
                    };
                    match tokio::time::timeout(std::time::Duration::from_millis(100), sender.send(message)).await {
                        Ok(Ok(())) => sent += 1,
                        Ok(Err(_)) => {
                            debug!("[{}] Event socket closed", send_stream_id);
                            break;
                        }
                        Err(_) => {
                            // Slow client: the event is lost.
                            skipped += 1;
                        }
                    }
                }
                Err(RecvError::Lagged(n)) => {
                    skipped += n;
                    debug!("[{}] Event subscriber lagged, skipped {} events", send_stream_id, n);
                }
                Err(RecvError::Closed) => break,
            }
        }
        info!("[{}] Event send task ended (sent: {}, skipped: {})", send_stream_id, sent, skipped);
    });

    let recv_task = tokio::spawn(async move {
        while let Some(msg) = receiver.next().await {
            match msg {
                Ok(Message::Close(_)) => break,
                Err(e) => {
                    debug!("WebSocket error: {}", e);
                    break;
                }
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = send_task => {},
        _ = recv_task => {},
    }

    info!("[{}] Event subscriber disconnected", stream_id);
}
