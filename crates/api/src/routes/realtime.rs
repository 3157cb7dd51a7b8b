//! WebSocket endpoint for authenticated realtime connections.

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use tokio::sync::mpsc;

use herald_common::types::{RealtimeFrame, Room};

use crate::gateway::inbound;
use crate::middleware::auth::AuthUser;
use crate::state::AppState;

/// Frames buffered per connection before room sends start dropping.
const CONNECTION_BUFFER: usize = 64;
const PING_INTERVAL: Duration = Duration::from_secs(25);

pub fn router() -> Router<AppState> {
    Router::new().route("/ws", get(upgrade))
}

/// Authentication runs before the upgrade; a bad token never gets a socket.
async fn upgrade(auth: AuthUser, State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, auth.user_id))
}

async fn handle_socket(mut socket: WebSocket, state: AppState, user_id: String) {
    let (tx, mut rx) = mpsc::channel::<RealtimeFrame>(CONNECTION_BUFFER);
    let rooms = state.gateway.rooms();
    let connection_id = rooms.register(&user_id, tx);

    rooms.join(connection_id, Room::user(&user_id));
    match state.memberships.tenants_of(&user_id).await {
        Ok(tenants) => {
            for tenant in tenants {
                rooms.join(connection_id, Room::tenant(tenant));
            }
        }
        Err(e) => tracing::warn!(
            user_id = %user_id,
            error = %e,
            "Membership lookup failed, tenant rooms not joined"
        ),
    }

    tracing::info!(
        connection_id,
        user_id = %user_id,
        connections = rooms.connection_count(),
        "Realtime connection opened"
    );

    let mut ping = tokio::time::interval(PING_INTERVAL);
    ping.tick().await;
    let mut shutdown = state.shutdown.clone();

    loop {
        tokio::select! {
            // Outbound frames queued by room sends
            frame = rx.recv() => {
                let Some(frame) = frame else { break };
                let text = match serde_json::to_string(&frame) {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::error!(error = %e, event = %frame.event, "Failed to encode frame");
                        continue;
                    }
                };
                if socket.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            // Client frames
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let outcome = inbound::handle_frame(
                            state.store.as_ref(),
                            &state.inbound_limiter,
                            &user_id,
                            text.as_str(),
                        )
                        .await;
                        tracing::debug!(user_id = %user_id, ?outcome, "Inbound frame handled");
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!(user_id = %user_id, error = %e, "WebSocket receive error");
                        break;
                    }
                }
            }
            _ = ping.tick() => {
                if socket.send(Message::Ping(Default::default())).await.is_err() {
                    break;
                }
            }
            _ = shutdown.changed() => {
                let _ = socket.send(Message::Close(None)).await;
                break;
            }
        }
    }

    rooms.unregister(connection_id);
    tracing::info!(
        connection_id,
        user_id = %user_id,
        connections = rooms.connection_count(),
        "Realtime connection closed"
    );
}
