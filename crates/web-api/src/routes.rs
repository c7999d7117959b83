use axum::{
    extract::{ws::WebSocketUpgrade, Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::Response,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use tower_http::trace::TraceLayer;

use application::events::{HistoryPage, PresenceUpdate, RoomCreated};
use application::{ApplicationError, HistoryQuery, ServerEvent};
use domain::{PageDirection, PresenceStatus, Room, RoomId, UserId};

use crate::auth::bearer_token;
use crate::ws_connection::WebSocketConnection;
use crate::{error::ApiError, state::AppState};

#[derive(Debug, Deserialize)]
struct HistoryParams {
    cursor: Option<String>,
    limit: Option<u32>,
    #[serde(default)]
    direction: PageDirection,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DirectRoomPayload {
    user_id: UserId,
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    token: Option<String>,
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
        .route("/rooms/direct", post(create_direct_room))
        .route("/rooms/{room_id}/messages", get(get_history))
        .route("/users/{user_id}/presence", get(get_presence))
}

async fn health() -> StatusCode {
    StatusCode::OK
}

async fn get_history(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(room_id): Path<RoomId>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<HistoryPage>, ApiError> {
    let user_id = state.jwt_service.extract_user_from_headers(&headers)?;
    let page = state
        .messages
        .history(
            room_id,
            user_id,
            HistoryQuery {
                cursor: params.cursor,
                limit: params.limit,
                direction: params.direction,
            },
        )
        .await?;

    Ok(Json(HistoryPage {
        room_id,
        messages: page.messages,
        next_cursor: page.next_cursor.map(|cursor| cursor.encode()),
        has_more: page.has_more,
    }))
}

/// 幂等：已存在时返回同一个房间，只有新建时才通知双方
async fn create_direct_room(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<DirectRoomPayload>,
) -> Result<(StatusCode, Json<Room>), ApiError> {
    let user_id = state.jwt_service.extract_user_from_headers(&headers)?;
    let (room, created) = state
        .directory
        .create_direct(user_id, payload.user_id)
        .await?;

    if !created {
        return Ok((StatusCode::OK, Json(room)));
    }
    state
        .gateway
        .broadcast(
            room.id,
            ServerEvent::RoomCreated(RoomCreated {
                room: room.clone(),
                member_ids: vec![user_id, payload.user_id],
            }),
        )
        .await;
    Ok((StatusCode::CREATED, Json(room)))
}

/// 在线记录过期后回退到持久化的最后在线时间
async fn get_presence(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(user_id): Path<UserId>,
) -> Result<Json<PresenceUpdate>, ApiError> {
    state.jwt_service.extract_user_from_headers(&headers)?;

    if let Some(record) = state.presence.get_presence(user_id).await? {
        return Ok(Json(PresenceUpdate::from(&record)));
    }
    let last_seen = state
        .last_seen
        .find(user_id)
        .await
        .map_err(ApplicationError::from)?
        .ok_or_else(|| ApplicationError::not_found("presence", user_id))?;

    Ok(Json(PresenceUpdate {
        user_id,
        status: PresenceStatus::Offline,
        last_seen,
    }))
}

/// 升级前完成鉴权，失败直接返回 401，不建立连接
async fn websocket_upgrade(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let token = query.token.as_deref().or_else(|| bearer_token(&headers));
    let user_id = state.gateway.authenticate(token).await.map_err(|err| {
        tracing::info!(error = %err, "WebSocket 鉴权失败");
        ApiError::from(err)
    })?;

    Ok(ws.on_upgrade(move |socket| async move {
        match WebSocketConnection::new(state, user_id).await {
            Ok(connection) => connection.run(socket).await,
            Err(err) => {
                tracing::warn!(user_id = %user_id, error = ?err, "WebSocket 连接初始化失败");
            }
        }
    }))
}
