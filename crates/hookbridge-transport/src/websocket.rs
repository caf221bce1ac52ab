//! HTTP and WebSocket transport.
//!
//! `POST /call` takes one bare request and answers with its
//! [`OperationResponse`]; a body that does not parse as a request gets an
//! `invalid_request` response with the rejection's status. `/ws` upgrades to a socket carrying
//! [`ClientMessage`] and [`ServerMessage`] JSON frames; calls on one socket
//! run concurrently and are matched to results by `id`.

use axum::{
    Json, Router,
    extract::{
        State, WebSocketUpgrade,
        rejection::JsonRejection,
        ws::{Message, WebSocket},
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::{
    dispatch::Dispatcher,
    protocol::{ClientMessage, OperationResponse, Request, ServerMessage},
};

/// Build the router.
///
/// # Example
/// ```ignore
/// let app = router(Dispatcher::new(registry));
/// axum::serve(listener, app).await?;
/// ```
#[must_use]
pub fn router(dispatcher: Dispatcher) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/call", post(call_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(dispatcher)
}

async fn call_handler(
    State(dispatcher): State<Dispatcher>,
    request: Result<Json<Request>, JsonRejection>,
) -> (StatusCode, Json<OperationResponse>) {
    match request {
        Ok(Json(request)) => (StatusCode::OK, Json(dispatcher.dispatch(request).await)),
        Err(rejection) => {
            tracing::warn!("Invalid request: {rejection}");
            (
                rejection.status(),
                Json(OperationResponse::invalid(rejection.body_text())),
            )
        }
    }
}

/// WebSocket upgrade handler.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(dispatcher): State<Dispatcher>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, dispatcher))
}

async fn handle_socket(socket: WebSocket, dispatcher: Dispatcher) {
    let (mut sender, mut receiver) = socket.split();

    // Channel for sending messages to the client
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

    // Spawn task to forward messages to WebSocket
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let json = match serde_json::to_string(&msg) {
                Ok(j) => j,
                Err(e) => {
                    tracing::error!("Failed to serialize message: {e}");
                    continue;
                }
            };
            if sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(msg) = receiver.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text.as_str().to_owned(),
            Ok(Message::Binary(data)) => match String::from_utf8(data.to_vec()) {
                Ok(s) => s,
                Err(_) => continue,
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                tracing::error!("WebSocket error: {e}");
                break;
            }
        };

        let client_msg = match parse_frame(&text) {
            Ok(m) => m,
            Err(reply) => {
                let _ = tx.send(reply);
                continue;
            }
        };

        match client_msg {
            ClientMessage::Ping => {
                let _ = tx.send(ServerMessage::Pong);
            }
            ClientMessage::Call { id, request } => {
                // Executions may wait a long time for a receipt; keep reading.
                let dispatcher = dispatcher.clone();
                let tx = tx.clone();
                tokio::spawn(async move {
                    let response = dispatcher.dispatch(request).await;
                    let _ = tx.send(ServerMessage::Result { id, response });
                });
            }
        }
    }

    // In-flight calls finish on their own; their results are discarded.
    drop(tx);
    send_task.abort();
    tracing::debug!("WebSocket disconnected");
}

/// Frames that carry a call `id` are answered with a `result` for that id,
/// so the caller can tell which call was rejected.
fn parse_frame(text: &str) -> Result<ClientMessage, ServerMessage> {
    let value: Value = serde_json::from_str(text).map_err(|e| invalid_frame(&e))?;
    let id = value
        .get("id")
        .and_then(Value::as_str)
        .filter(|_| value.get("type").and_then(Value::as_str) == Some("call"))
        .map(str::to_owned);
    serde_json::from_value(value).map_err(|e| match id {
        Some(id) => {
            tracing::warn!(call_id = %id, "Invalid request: {e}");
            ServerMessage::Result {
                id,
                response: OperationResponse::invalid(format!("Invalid request: {e}")),
            }
        }
        None => invalid_frame(&e),
    })
}

fn invalid_frame(e: &serde_json::Error) -> ServerMessage {
    tracing::warn!("Invalid client message: {e}");
    ServerMessage::Error {
        message: format!("Invalid message: {e}"),
    }
}
