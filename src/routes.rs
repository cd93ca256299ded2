use std::sync::Arc;

use axum::extract::{Path, State, WebSocketUpgrade};
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::chat::{MentorshipUpdate, MessageMetadata, MessageType};
use crate::error::ChatResult;
use crate::gateway::RealtimeGateway;
use crate::principal::{Principal, PrincipalResolver};
use crate::store::Store;

pub struct AppState {
    pub store: Store,
    pub resolver: PrincipalResolver,
    pub gateway: RealtimeGateway,
}

/// The conversation API: durable operations over REST, live updates over
/// the `/ws` socket.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(
            "/conversations",
            post(create_conversation).get(list_conversations),
        )
        .route(
            "/conversations/:id/messages",
            post(send_message).get(list_messages),
        )
        .route("/conversations/:id/read", put(mark_read))
        .route("/conversations/:id/mentorship", put(update_mentorship))
        .route("/ws", get(ws_upgrade))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

async fn authenticate(resolver: &PrincipalResolver, headers: &HeaderMap) -> ChatResult<Principal> {
    let bearer = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    resolver.resolve(bearer).await
}

#[derive(Debug, Deserialize)]
struct CreateConversation {
    counterpart_id: String,
}

/// POST /conversations: create-or-get the chat with the counterpart.
/// 201 when a new chat was created, 200 when it already existed.
async fn create_conversation(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreateConversation>,
) -> ChatResult<Response> {
    let requester = authenticate(&state.resolver, &headers).await?;
    let (chat, created) = state
        .store
        .create_or_get(&requester, &body.counterpart_id)
        .await?;

    let status = if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(chat)).into_response())
}

/// GET /conversations: the caller's chats, most recently updated first.
async fn list_conversations(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ChatResult<Response> {
    let principal = authenticate(&state.resolver, &headers).await?;
    let chats = state.store.list_for(&principal).await?;
    Ok(Json(chats).into_response())
}

#[derive(Debug, Deserialize)]
struct SendMessage {
    content: String,
    #[serde(default)]
    message_type: MessageType,
    metadata: Option<MessageMetadata>,
    /// Client-generated idempotency key; retries with the same key return
    /// the original message instead of duplicating it.
    client_key: Option<String>,
}

/// POST /conversations/:id/messages: append and broadcast.
async fn send_message(
    State(state): State<Arc<AppState>>,
    Path(chat_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<SendMessage>,
) -> ChatResult<Response> {
    let sender = authenticate(&state.resolver, &headers).await?;
    let message = state
        .store
        .append_message(
            &chat_id,
            &sender,
            &body.content,
            body.message_type,
            body.metadata,
            body.client_key.as_deref(),
        )
        .await?;

    // Best-effort live delivery; the append already committed.
    state.gateway.broadcast_new_message(&chat_id, &message);

    Ok((StatusCode::CREATED, Json(message)).into_response())
}

/// GET /conversations/:id/messages: the ordered message log.
async fn list_messages(
    State(state): State<Arc<AppState>>,
    Path(chat_id): Path<String>,
    headers: HeaderMap,
) -> ChatResult<Response> {
    let principal = authenticate(&state.resolver, &headers).await?;
    let messages = state.store.messages_for(&chat_id, &principal).await?;
    Ok(Json(messages).into_response())
}

/// PUT /conversations/:id/read: catch the caller's read receipts up.
async fn mark_read(
    State(state): State<Arc<AppState>>,
    Path(chat_id): Path<String>,
    headers: HeaderMap,
) -> ChatResult<Response> {
    let principal = authenticate(&state.resolver, &headers).await?;
    state.store.mark_read(&chat_id, &principal).await?;
    Ok(Json(json!({ "message": "messages marked as read" })).into_response())
}

/// PUT /conversations/:id/mentorship: update goals/progress/meeting notes.
async fn update_mentorship(
    State(state): State<Arc<AppState>>,
    Path(chat_id): Path<String>,
    headers: HeaderMap,
    Json(update): Json<MentorshipUpdate>,
) -> ChatResult<Response> {
    let principal = authenticate(&state.resolver, &headers).await?;
    let chat = state
        .store
        .update_mentorship(&chat_id, &principal, update)
        .await?;
    Ok(Json(chat).into_response())
}

/// GET /ws: upgrade to the realtime channel. Authentication happens
/// in-band via the `authenticate` event.
async fn ws_upgrade(
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| {
        let gateway = state.gateway.clone();
        async move { gateway.handle_socket(socket).await }
    })
}
