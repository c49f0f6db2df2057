use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use crucible_auth::JwtVerifier;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::hub::{RealtimeHub, RoomEvent};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// The client's handshake frame: `{auth:{token}}`.
#[derive(Debug, Deserialize)]
struct AuthFrame {
    auth: AuthFramePayload,
}

#[derive(Debug, Deserialize)]
struct AuthFramePayload {
    token: String,
}

/// Control and data frames sent to a connected subscriber.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
enum OutboundFrame {
    AuthSuccess {
        organization_id: String,
        user_id: String,
        role: String,
    },
    AuthError {
        reason: String,
    },
    Heartbeat,
    ExecutionUpdated {
        execution: crucible_common::Execution,
    },
    ExecutionLog {
        task_id: String,
        log: String,
    },
}

impl From<RoomEvent> for OutboundFrame {
    fn from(event: RoomEvent) -> Self {
        match event {
            RoomEvent::ExecutionUpdated { execution } => {
                OutboundFrame::ExecutionUpdated { execution }
            }
            RoomEvent::ExecutionLog { task_id, log } => OutboundFrame::ExecutionLog { task_id, log },
        }
    }
}

/// State required by the realtime WebSocket route: the hub plus the
/// verifier used for the auth-frame handshake.
pub trait RealtimeState: Clone + Send + Sync + 'static {
    fn hub(&self) -> &RealtimeHub;
    fn jwt_verifier(&self) -> &JwtVerifier;
}

pub async fn ws_realtime_handler<S: RealtimeState>(
    ws: WebSocketUpgrade,
    State(state): State<S>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket<S: RealtimeState>(mut socket: WebSocket, state: S) {
    let claims = match authenticate(&mut socket, state.jwt_verifier()).await {
        Some(claims) => claims,
        None => return,
    };

    let organization_id = claims.organization_id.clone();
    let room = state.hub().join(&organization_id);
    info!(organization_id = %organization_id, "subscriber joined room");

    let success = OutboundFrame::AuthSuccess {
        organization_id: organization_id.clone(),
        user_id: claims.user_id.clone(),
        role: claims.role.clone(),
    };
    if send_frame(&mut socket, &success).await.is_err() {
        state.hub().leave(&organization_id);
        return;
    }

    let (mut ws_tx, mut ws_rx) = socket.split();
    let mut updates_rx = room.subscribe_updates();
    let mut logs_rx = room.subscribe_logs();
    let mut heartbeat = interval(HEARTBEAT_INTERVAL);

    loop {
        tokio::select! {
            update = updates_rx.recv() => {
                match update {
                    Ok(event) => {
                        if send_frame(&mut ws_tx, &OutboundFrame::from(event)).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(organization_id = %organization_id, skipped, "updates lagged — this should not happen under normal load");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
            log = logs_rx.recv() => {
                match log {
                    Ok(event) => {
                        if send_frame(&mut ws_tx, &OutboundFrame::from(event)).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                        // expected under backpressure; logs may drop.
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
            _ = heartbeat.tick() => {
                if send_frame(&mut ws_tx, &OutboundFrame::Heartbeat).await.is_err() {
                    break;
                }
            }
            incoming = ws_rx.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }

    state.hub().leave(&organization_id);
    debug!(organization_id = %organization_id, "subscriber left room");
}

async fn authenticate(
    socket: &mut WebSocket,
    verifier: &JwtVerifier,
) -> Option<crucible_auth::Claims> {
    let message = socket.recv().await?.ok()?;
    let Message::Text(text) = message else {
        let _ = send_frame(socket, &OutboundFrame::AuthError { reason: "expected auth frame".into() }).await;
        return None;
    };

    let frame: AuthFrame = match serde_json::from_str(&text) {
        Ok(frame) => frame,
        Err(e) => {
            let _ = send_frame(socket, &OutboundFrame::AuthError { reason: e.to_string() }).await;
            return None;
        }
    };

    match verifier.verify(&frame.auth.token) {
        Ok(claims) => Some(claims),
        Err(e) => {
            let _ = send_frame(socket, &OutboundFrame::AuthError { reason: e.to_string() }).await;
            None
        }
    }
}

async fn send_frame<T: Serialize>(
    sink: &mut (impl SinkExt<Message, Error = axum::Error> + Unpin),
    frame: &T,
) -> Result<(), axum::Error> {
    let json = serde_json::to_string(frame).expect("frame always serializes");
    sink.send(Message::Text(json)).await
}
