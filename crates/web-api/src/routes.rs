use axum::{
    extract::{ws::WebSocketUpgrade, Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::Response,
    routing::{get, post},
    Json, Router,
};
use domain::{
    Conversation, ConversationId, ConversationSummary, ListingId, Message, MessageId, UserId,
};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;

use crate::auth::{bearer_token, AuthUser};
use crate::ws_connection::WebSocketConnection;
use crate::{error::ApiError, state::AppState};

#[derive(Debug, Deserialize)]
struct WsQuery {
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EnsureChatPayload {
    other_user_id: UserId,
    listing_id: Option<ListingId>,
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    before: Option<MessageId>,
    limit: Option<u32>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PresenceResponse {
    user_id: UserId,
    online: bool,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .nest("/api/v1", api_routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/ws", get(websocket_upgrade))
        .route("/chats", post(ensure_chat).get(list_chats))
        .route("/chats/{conversation_id}/messages", get(get_history))
        .route("/users/{user_id}/presence", get(get_presence))
}

async fn health() -> StatusCode {
    StatusCode::OK
}

/// 握手前先解析凭证，失败直接返回 401，不会升级连接
async fn websocket_upgrade(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let credential = query.token.as_deref().or_else(|| bearer_token(&headers));
    let user = state.identity.resolve(credential).await.map_err(|err| {
        tracing::warn!(error = %err, "WebSocket 握手认证失败");
        ApiError::from(err)
    })?;

    Ok(ws.on_upgrade(move |socket| async move {
        let connection = WebSocketConnection::new(socket, state, user).await;
        connection.run().await;
    }))
}

async fn ensure_chat(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Json(payload): Json<EnsureChatPayload>,
) -> Result<(StatusCode, Json<Conversation>), ApiError> {
    let conversation = state
        .chat
        .ensure_chat(user.id, payload.other_user_id, payload.listing_id)
        .await?;
    Ok((StatusCode::OK, Json(conversation)))
}

async fn list_chats(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
) -> Result<Json<Vec<ConversationSummary>>, ApiError> {
    let chats = state.chat.conversations_for(user.id).await?;
    Ok(Json(chats))
}

async fn get_history(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(conversation_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<Message>>, ApiError> {
    let messages = state
        .chat
        .history(
            user.id,
            &ConversationId::new(conversation_id),
            query.limit,
            query.before,
        )
        .await?;
    Ok(Json(messages))
}

async fn get_presence(
    State(state): State<AppState>,
    AuthUser(_): AuthUser,
    Path(user_id): Path<i64>,
) -> Json<PresenceResponse> {
    let user_id = UserId(user_id);
    Json(PresenceResponse {
        user_id,
        online: state.presence.is_online(user_id).await,
    })
}
