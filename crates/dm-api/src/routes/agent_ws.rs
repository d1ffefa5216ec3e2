//! Agent WebSocket endpoint. The first frame must be `register` within the
//! handshake timeout; anything else closes the socket with a policy
//! violation. After the ack, a single writer task serializes all outbound
//! frames while inbound frames go to the coordinator in arrival order.

use std::time::Duration;

use axum::Router;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use dm_agent::{AgentFrame, RegisterRequest, ServerFrame};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::state::ApiState;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const POLICY_VIOLATION: u16 = 1008;

pub fn router() -> Router<ApiState> {
    Router::new().route("/agent/ws", get(agent_ws_handler))
}

async fn agent_ws_handler(ws: WebSocketUpgrade, State(state): State<ApiState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_agent_socket(socket, state))
}

async fn close_policy(mut socket: WebSocket, reason: &str) {
    warn!("Agent WS rejected: {reason}");
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: POLICY_VIOLATION,
            reason: reason.to_string().into(),
        })))
        .await;
}

async fn handle_agent_socket(mut socket: WebSocket, state: ApiState) {
    // First frame must be register, within the handshake timeout
    let first = tokio::time::timeout(HANDSHAKE_TIMEOUT, socket.recv()).await;
    let frame = match first {
        Ok(Some(Ok(Message::Text(text)))) => serde_json::from_str::<AgentFrame>(&text).ok(),
        _ => None,
    };
    let Some(AgentFrame::Register {
        token,
        engine_id,
        version,
        proto_version,
        capabilities,
        os,
        arch,
        hostname,
    }) = frame
    else {
        close_policy(socket, "expected register frame").await;
        return;
    };

    let (agent, host) = match state
        .coordinator
        .register(RegisterRequest {
            token,
            engine_id,
            version,
            proto_version,
            capabilities,
            os,
            arch,
            hostname,
        })
        .await
    {
        Ok(result) => result,
        Err(e) => {
            let reject = ServerFrame::Error {
                message: e.to_string(),
            };
            if let Ok(json) = serde_json::to_string(&reject) {
                let _ = socket.send(Message::Text(json.into())).await;
            }
            close_policy(socket, "registration rejected").await;
            return;
        }
    };

    // Ack, then enter the session loop
    let ack = state.coordinator.register_ack(&agent);
    let Ok(ack_json) = serde_json::to_string(&ack) else {
        return;
    };
    if socket.send(Message::Text(ack_json.into())).await.is_err() {
        state.coordinator.detach_session(&agent.id).await;
        return;
    }

    let (tx, mut outbound_rx) = mpsc::channel::<ServerFrame>(64);
    state.coordinator.attach_session(&agent.id, tx).await;
    info!(agent_id = agent.id, host = host.name, "Agent session established");

    loop {
        tokio::select! {
            // Coordinator → agent: this loop is the single socket writer
            Some(frame) = outbound_rx.recv() => {
                let Ok(json) = serde_json::to_string(&frame) else {
                    continue;
                };
                if socket.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
            // Agent → coordinator, dispatched in arrival order
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<AgentFrame>(&text) {
                            Ok(frame) => {
                                state
                                    .coordinator
                                    .handle_frame(&agent.id, &host.id, &host.name, frame)
                                    .await;
                            }
                            Err(e) => {
                                warn!(agent_id = agent.id, "Invalid agent frame: {e}");
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!(agent_id = agent.id, "Agent socket error: {e}");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    state.coordinator.detach_session(&agent.id).await;
    info!(agent_id = agent.id, "Agent session closed");
}
