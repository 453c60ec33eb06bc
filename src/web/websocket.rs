use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
    routing::get,
    Router,
};
use futures::{sink::SinkExt, stream::StreamExt};
use serde_json::json;
use std::time::Duration;
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tracing::{debug, error, warn};

use crate::backup::BackupManager;

const STATUS_INTERVAL: Duration = Duration::from_secs(1);

pub fn routes() -> Router<BackupManager> {
    Router::new().route("/", get(websocket_handler))
}

async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(manager): State<BackupManager>,
) -> Response {
    ws.on_upgrade(|socket| handle_socket(socket, manager))
}

fn status_message(manager: &BackupManager) -> Message {
    let msg = json!({
        "type": "status",
        "data": manager.get_status(),
    });
    Message::Text(msg.to_string())
}

async fn handle_socket(socket: WebSocket, manager: BackupManager) {
    let (mut sender, mut receiver) = socket.split();

    // Subscribe before the snapshot so nothing falls between the two.
    let mut events = BroadcastStream::new(manager.subscribe_events());

    if let Err(e) = sender.send(status_message(&manager)).await {
        error!("Failed to send initial status: {}", e);
        return;
    }

    let mut send_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(STATUS_INTERVAL);
        interval.tick().await;

        loop {
            let msg = tokio::select! {
                next = events.next() => match next {
                    Some(Ok(event)) => match serde_json::to_string(&event) {
                        Ok(text) => Message::Text(text),
                        Err(e) => {
                            warn!("Failed to encode event: {}", e);
                            continue;
                        }
                    },
                    Some(Err(BroadcastStreamRecvError::Lagged(missed))) => {
                        debug!("WebSocket client lagged; {} events dropped", missed);
                        status_message(&manager)
                    }
                    None => break,
                },
                _ = interval.tick() => status_message(&manager),
            };

            if sender.send(msg).await.is_err() {
                break;
            }
        }
    });

    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => debug!("Ignoring WebSocket message: {}", text),
                Message::Close(_) => {
                    debug!("WebSocket closed by client");
                    break;
                }
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = (&mut send_task) => recv_task.abort(),
        _ = (&mut recv_task) => send_task.abort(),
    }

    debug!("WebSocket connection closed");
}
