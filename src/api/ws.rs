// =============================================================================
// WebSocket Handler — push channel for leaderboard/kline subscriptions
// =============================================================================
//
// Grounded on the teacher's `api/ws.rs`: the same `tokio::select!` race
// between a push side and a recv side, token-gated upgrade via
// `validate_token`, and the same Ping/Pong/Close/Text handling. The teacher
// pushed one full `StateSnapshot` on a 500ms poll of a version counter; this
// instead fans out Event Bus topics (§4.4) the client has subscribed to,
// forwarding each into a single outbound mpsc channel so the select! loop
// stays a fixed two-armed race regardless of how many topics are live.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::api::auth::validate_token;
use crate::app_state::AppState;

#[derive(Deserialize)]
pub struct WsQuery {
    token: Option<String>,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(query): Query<WsQuery>,
) -> impl IntoResponse {
    let token = query.token.unwrap_or_default();
    if !validate_token(&token) {
        warn!("WebSocket connection rejected: invalid token");
        return (
            axum::http::StatusCode::FORBIDDEN,
            "Invalid or missing token",
        )
            .into_response();
    }

    info!("WebSocket connection accepted — upgrading");
    ws.on_upgrade(move |socket| handle_ws_connection(socket, state))
        .into_response()
}

#[derive(Deserialize)]
#[serde(tag = "type")]
enum ClientCommand {
    #[serde(rename = "klines:subscribe")]
    KlinesSubscribe { symbol: String, interval: String },
    #[serde(rename = "klines:unsubscribe")]
    KlinesUnsubscribe { symbol: String, interval: String },
}

async fn handle_ws_connection(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<String>(256);

    // Always forward the leaderboard topic for the life of the connection.
    let leaderboard_task = spawn_forwarder(state.bus.clone(), "leaderboard:update".to_string(), tx.clone());
    let mut kline_tasks: HashMap<(String, String), tokio::task::JoinHandle<()>> = HashMap::new();

    loop {
        tokio::select! {
            // ── Push side: anything forwarded from the Event Bus ─────────
            event = rx.recv() => {
                match event {
                    Some(json) => {
                        if let Err(e) = sender.send(Message::Text(json.into())).await {
                            debug!(error = %e, "WebSocket send failed — disconnecting");
                            break;
                        }
                    }
                    None => break,
                }
            }

            // ── Recv side: client commands and protocol frames ───────────
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientCommand>(&text) {
                            Ok(ClientCommand::KlinesSubscribe { symbol, interval }) => {
                                let key = (symbol.clone(), interval.clone());
                                kline_tasks.entry(key).or_insert_with(|| {
                                    spawn_forwarder(
                                        state.bus.clone(),
                                        format!("klines:update:{symbol}:{interval}"),
                                        tx.clone(),
                                    )
                                });
                            }
                            Ok(ClientCommand::KlinesUnsubscribe { symbol, interval }) => {
                                if let Some(handle) = kline_tasks.remove(&(symbol, interval)) {
                                    handle.abort();
                                }
                            }
                            Err(e) => {
                                debug!(error = %e, "ignoring unrecognised WebSocket text frame");
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = sender.send(Message::Pong(data)).await {
                            debug!(error = %e, "failed to send Pong — disconnecting");
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) => {
                        info!("WebSocket Close frame received — disconnecting");
                        break;
                    }
                    Some(Ok(Message::Binary(_))) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket receive error — disconnecting");
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    leaderboard_task.abort();
    for (_, handle) in kline_tasks {
        handle.abort();
    }
    info!("WebSocket connection closed — cleanup complete");
}

/// Subscribe to one bus topic and forward every event as a JSON text frame
/// `{"topic": "...", "payload": ...}` into `tx`, until the task is aborted or
/// `tx`'s receiver is dropped.
fn spawn_forwarder(
    bus: Arc<crate::bus::EventBus>,
    topic: String,
    tx: mpsc::Sender<String>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let subscription = bus.subscribe(&topic);
        loop {
            let event = subscription.recv().await;
            let frame = serde_json::json!({ "topic": event.topic, "payload": event.payload });
            let text = frame.to_string();
            if tx.send(text).await.is_err() {
                break;
            }
        }
    })
}
