//! HTTP Write Path
//!
//! REST endpoints driving the synchronization core: durable writes land
//! here, then fan out live through the room multiplexer. Handlers return
//! plain status codes on failure; errors are logged server-side and
//! never leak into response bodies.

use axum::{
    Json,
    extract::{Path, Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use tracing::error;

use shoal_protocol::{
    Attachment, ConversationPreview, MembershipOp, Message, ReactionOp, ServerEvent,
};

use crate::AppState;
use crate::ws;

#[derive(Deserialize)]
pub struct ConnectParams {
    pub user_id: String,
}

/// Upgrade to the live event channel. Identity comes from the query
/// string; credential auth is out of scope.
pub async fn websocket_handler(
    State(state): State<AppState>,
    Query(params): Query<ConnectParams>,
    upgrade: WebSocketUpgrade,
) -> Response {
    upgrade.on_upgrade(move |socket| ws::handle_socket(socket, state, params.user_id))
}

#[derive(Deserialize)]
pub struct SendMessageRequest {
    pub sender_id: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    /// The other participant of a one-to-one conversation, when known.
    /// Carries the automated-reply trigger.
    #[serde(default)]
    pub peer_id: Option<String>,
}

/// Persist a message, refresh the conversation preview, broadcast it
/// into the room, and hand it to the reply pipeline. The response does
/// not wait for any generated reply.
pub async fn send_message(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
    Json(req): Json<SendMessageRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    if req.text.as_deref().is_none_or(str::is_empty) && req.attachments.is_empty() {
        return Err(StatusCode::UNPROCESSABLE_ENTITY);
    }

    let mut message = Message::new(&conversation_id, &req.sender_id, "");
    message.text = req.text.filter(|t| !t.is_empty());
    message.attachments = req.attachments;

    if let Err(e) = state.store.insert_message(&message).await {
        error!("Failed to persist message: {:#}", e);
        return Err(StatusCode::INTERNAL_SERVER_ERROR);
    }
    if let Err(e) = state
        .store
        .upsert_preview(&ConversationPreview::from_message(&message))
        .await
    {
        error!("Failed to update preview: {:#}", e);
        return Err(StatusCode::INTERNAL_SERVER_ERROR);
    }

    state
        .rooms
        .broadcast_to_room(
            &conversation_id,
            ServerEvent::MessageNew {
                conversation_id: conversation_id.clone(),
                message: message.clone(),
            },
        )
        .await;

    if let (Some(pipeline), Some(peer_id)) = (&state.pipeline, &req.peer_id) {
        pipeline.trigger(&message, peer_id);
    }

    Ok((StatusCode::CREATED, Json(message)))
}

pub async fn list_messages(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
) -> Result<impl IntoResponse, StatusCode> {
    match state.store.list_messages(&conversation_id).await {
        Ok(messages) => Ok(Json(messages)),
        Err(e) => {
            error!("Failed to list messages: {:#}", e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

#[derive(Deserialize)]
pub struct ReactionRequest {
    pub emoji: String,
    pub user_id: String,
    pub op: ReactionOp,
}

/// Mutate one reaction set and broadcast the delta. Receivers apply the
/// same mutation in place instead of refetching.
pub async fn react(
    State(state): State<AppState>,
    Path(message_id): Path<String>,
    Json(req): Json<ReactionRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    let updated = match state
        .store
        .apply_reaction(&message_id, &req.emoji, &req.user_id, req.op)
        .await
    {
        Ok(Some(m)) => m,
        Ok(None) => return Err(StatusCode::NOT_FOUND),
        Err(e) => {
            error!("Failed to apply reaction: {:#}", e);
            return Err(StatusCode::INTERNAL_SERVER_ERROR);
        }
    };

    state
        .rooms
        .broadcast_to_room(
            &updated.conversation_id,
            ServerEvent::ReactionChanged {
                message_id,
                conversation_id: updated.conversation_id.clone(),
                emoji: req.emoji,
                user_id: req.user_id,
                op: req.op,
            },
        )
        .await;

    Ok(Json(updated))
}

/// Delete a message and recompute the conversation preview from the
/// remaining tail. Live views self-heal on their next fetch.
pub async fn delete_message(
    State(state): State<AppState>,
    Path(message_id): Path<String>,
) -> StatusCode {
    let message = match state.store.get_message(&message_id).await {
        Ok(Some(m)) => m,
        Ok(None) => return StatusCode::NOT_FOUND,
        Err(e) => {
            error!("Failed to load message for delete: {:#}", e);
            return StatusCode::INTERNAL_SERVER_ERROR;
        }
    };

    if let Err(e) = state.store.delete_message(&message_id).await {
        error!("Failed to delete message: {:#}", e);
        return StatusCode::INTERNAL_SERVER_ERROR;
    }

    let preview = match state.store.list_messages(&message.conversation_id).await {
        Ok(remaining) => match remaining.last() {
            Some(last) => ConversationPreview::from_message(last),
            None => ConversationPreview {
                conversation_id: message.conversation_id.clone(),
                last_message_text: None,
                last_sender_id: None,
                last_message_at: None,
            },
        },
        Err(e) => {
            error!("Failed to recompute preview: {:#}", e);
            return StatusCode::INTERNAL_SERVER_ERROR;
        }
    };
    if let Err(e) = state.store.upsert_preview(&preview).await {
        error!("Failed to update preview: {:#}", e);
        return StatusCode::INTERNAL_SERVER_ERROR;
    }

    StatusCode::NO_CONTENT
}

#[derive(Deserialize)]
pub struct ReadReceiptRequest {
    pub user_id: String,
    pub message_ids: Vec<String>,
}

#[derive(Serialize)]
pub struct ReadReceiptResponse {
    pub changed: Vec<String>,
}

/// Mark a batch of messages read by one user. Only ids that actually
/// changed are broadcast; a fully redundant batch emits nothing.
pub async fn read_receipts(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
    Json(req): Json<ReadReceiptRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    let changed = match state.store.add_read_by(&req.message_ids, &req.user_id).await {
        Ok(changed) => changed,
        Err(e) => {
            error!("Failed to record read receipts: {:#}", e);
            return Err(StatusCode::INTERNAL_SERVER_ERROR);
        }
    };

    if !changed.is_empty() {
        state
            .rooms
            .broadcast_to_room(
                &conversation_id,
                ServerEvent::ReadReceiptBatch {
                    conversation_id: conversation_id.clone(),
                    user_id: req.user_id,
                    message_ids: changed.clone(),
                },
            )
            .await;
    }

    Ok(Json(ReadReceiptResponse { changed }))
}

#[derive(Deserialize)]
pub struct MembershipRequest {
    pub actor_name: String,
    pub member_id: String,
    pub member_name: String,
    pub op: MembershipOp,
}

/// Group membership change. The room gets the event directly; the
/// affected member additionally gets a `recipient_id`-tagged global
/// fallback when they never joined the room.
pub async fn change_membership(
    State(state): State<AppState>,
    Path(group_id): Path<String>,
    Json(req): Json<MembershipRequest>,
) -> StatusCode {
    let system_message = match req.op {
        MembershipOp::Add => format!("{} added {}", req.actor_name, req.member_name),
        MembershipOp::Remove => format!("{} removed {}", req.actor_name, req.member_name),
    };

    state
        .rooms
        .broadcast_to_room(
            &group_id,
            ServerEvent::MembershipChanged {
                group_id: group_id.clone(),
                op: req.op,
                system_message: system_message.clone(),
                recipient_id: None,
            },
        )
        .await;

    if !state.rooms.user_in_room(&group_id, &req.member_id).await {
        state
            .rooms
            .broadcast_global(ServerEvent::MembershipChanged {
                group_id,
                op: req.op,
                system_message,
                recipient_id: Some(req.member_id),
            })
            .await;
    }

    StatusCode::NO_CONTENT
}

#[derive(Deserialize)]
pub struct DeleteGroupRequest {
    /// Everyone who must learn about the removal, joined or not.
    pub member_ids: Vec<String>,
}

/// Delete a group conversation. Every member gets a tagged
/// `entity_removed`: through the room when joined, globally otherwise.
pub async fn delete_group(
    State(state): State<AppState>,
    Path(group_id): Path<String>,
    Json(req): Json<DeleteGroupRequest>,
) -> StatusCode {
    if let Err(e) = state.store.delete_conversation(&group_id).await {
        error!("Failed to delete group: {:#}", e);
        return StatusCode::INTERNAL_SERVER_ERROR;
    }

    for member_id in req.member_ids {
        let event = ServerEvent::EntityRemoved {
            entity_id: group_id.clone(),
            recipient_id: member_id.clone(),
        };
        if state.rooms.user_in_room(&group_id, &member_id).await {
            state.rooms.broadcast_to_room(&group_id, event).await;
        } else {
            state.rooms.broadcast_global(event).await;
        }
    }

    StatusCode::NO_CONTENT
}

pub async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}
