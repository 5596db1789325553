//! Agent socket: `GET /agent`.
//!
//! One socket per user. Outbound frames come from the relay's channel for
//! this connection; inbound text frames are handed back to the relay.

use std::time::Duration;

use axum::{
    extract::{
        Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::HeaderMap,
    response::{IntoResponse, Response},
};
use berth_runtime::relay::FrameReceiver;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::SharedState;
use super::api::ApiError;
use super::auth;

const PING_INTERVAL: Duration = Duration::from_secs(30);
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Default, Deserialize)]
pub struct AgentQuery {
    #[serde(default)]
    pub token: Option<String>,
}

pub async fn agent_handler(
    ws: WebSocketUpgrade,
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(query): Query<AgentQuery>,
) -> Response {
    let Some(token) = auth::bearer_token(&headers).or(query.token) else {
        return ApiError::Unauthorized("Missing agent token".into()).into_response();
    };
    let Some(user_id) = auth::agent_user(&state.agent_tokens, &token) else {
        warn!("agent connection rejected: unknown token");
        return ApiError::Unauthorized("Invalid agent token".into()).into_response();
    };
    ws.on_upgrade(move |socket| run_agent_socket(socket, state, user_id))
}

async fn run_agent_socket(socket: WebSocket, state: SharedState, user_id: String) {
    let (connection_id, outbound) = state.relay.connect(&user_id);
    info!(%user_id, %connection_id, "agent connected");

    run_socket_loop(socket, &state, outbound).await;

    if state.relay.disconnect(&user_id, &connection_id) {
        info!(%user_id, %connection_id, "agent disconnected");
    } else {
        debug!(%user_id, %connection_id, "superseded agent connection closed");
    }
}

async fn run_socket_loop(socket: WebSocket, state: &SharedState, mut outbound: FrameReceiver) {
    let (mut sender, mut receiver) = socket.split();
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    ping_interval.tick().await;
    let mut last_pong = Instant::now();
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            _ = ping_interval.tick() => {
                if awaiting_pong && last_pong.elapsed() > PONG_TIMEOUT {
                    warn!("agent stopped answering pings");
                    break;
                }
                if sender.send(Message::Ping(Default::default())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }

            frame = outbound.recv() => {
                // None: a newer connection for this user replaced us.
                let Some(frame) = frame else { break };
                match serde_json::to_string(&frame) {
                    Ok(json) => {
                        if sender.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "failed to serialize agent frame"),
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Err(e) = state.relay.handle_text(text.as_str()) {
                            warn!(error = %e, "dropping malformed agent frame");
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(error = %e, "agent socket error");
                        break;
                    }
                }
            }
        }
    }

    let _ = sender.send(Message::Close(None)).await;
}
