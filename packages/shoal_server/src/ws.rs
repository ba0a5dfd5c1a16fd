//! WebSocket Handler
//!
//! One socket per client connection. The socket is split into a sender
//! task draining the connection's outbox and an input task dispatching
//! decoded client frames. Presence registration happens on connect, and
//! offline/online transitions fan out as global `presence_changed`
//! broadcasts.

use axum::extract::ws::{Message, WebSocket};
use futures::{sink::SinkExt, stream::StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use shoal_protocol::{ClientEvent, ServerEvent, decode_client_event};

use crate::AppState;

/// Handle one client websocket for its whole lifetime. Returns when the
/// socket closes from either side.
pub async fn handle_socket(socket: WebSocket, state: AppState, user_id: String) {
    let connection_id = uuid::Uuid::new_v4().to_string();
    info!(user = %user_id, conn = %connection_id, "websocket connected");

    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Outbox: everything addressed to this connection funnels through one
    // queue, which keeps delivery FIFO per connection.
    let (tx, mut rx) = mpsc::channel::<ServerEvent>(state.outbox_capacity);

    state
        .rooms
        .register_connection(&connection_id, &user_id, tx)
        .await;
    if state.presence.register(&user_id, &connection_id).await
        == crate::presence::PresenceTransition::CameOnline
    {
        state
            .rooms
            .broadcast_global(ServerEvent::PresenceChanged {
                user_id: user_id.clone(),
                online: true,
            })
            .await;
    }

    // Task to pump the outbox into the socket
    let sender_task = async move {
        while let Some(event) = rx.recv().await {
            let json = match serde_json::to_string(&event) {
                Ok(j) => j,
                Err(e) => {
                    error!("Failed to serialize event: {}", e);
                    continue;
                }
            };
            if ws_sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    };

    // Task to dispatch incoming frames
    let rooms = state.rooms.clone();
    let conn_for_input = connection_id.clone();
    let user_for_input = user_id.clone();
    let input_task = async move {
        while let Some(msg) = ws_receiver.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    let Some(event) = decode_client_event(&text) else {
                        warn!(conn = %conn_for_input, "dropping undecodable frame");
                        continue;
                    };
                    dispatch_client_event(&rooms, &conn_for_input, &user_for_input, event).await;
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => {} // binary/ping/pong: nothing to do
                Err(e) => {
                    debug!(conn = %conn_for_input, "websocket error: {}", e);
                    break;
                }
            }
        }
    };

    tokio::select! {
        _ = sender_task => debug!(conn = %connection_id, "sender task ended"),
        _ = input_task => debug!(conn = %connection_id, "input task ended"),
    }

    // Teardown: drop room memberships first so no broadcast can race a
    // half-removed connection, then settle presence.
    state.rooms.remove_connection(&connection_id).await;
    if state.presence.unregister(&user_id, &connection_id).await
        == crate::presence::PresenceTransition::WentOffline
    {
        state
            .rooms
            .broadcast_global(ServerEvent::PresenceChanged {
                user_id: user_id.clone(),
                online: false,
            })
            .await;
    }
    info!(user = %user_id, conn = %connection_id, "websocket disconnected");
}

async fn dispatch_client_event(
    rooms: &Arc<crate::rooms::RoomMultiplexer>,
    connection_id: &str,
    user_id: &str,
    event: ClientEvent,
) {
    match event {
        ClientEvent::JoinRoom { room_id } => {
            rooms.join(connection_id, &room_id).await;
        }
        ClientEvent::LeaveRoom { room_id } => {
            rooms.leave(connection_id, &room_id).await;
        }
        ClientEvent::Typing { conversation_id } => {
            rooms
                .broadcast_to_room_except(
                    &conversation_id,
                    Some(connection_id),
                    ServerEvent::Typing {
                        conversation_id: conversation_id.clone(),
                        user_id: user_id.to_string(),
                    },
                )
                .await;
        }
        ClientEvent::TypingStop { conversation_id } => {
            rooms
                .broadcast_to_room_except(
                    &conversation_id,
                    Some(connection_id),
                    ServerEvent::TypingStop {
                        conversation_id: conversation_id.clone(),
                        user_id: user_id.to_string(),
                    },
                )
                .await;
        }
    }
}
