//! 房间生命周期的 HTTP 路由
//!
//! 处理器只做提取、鉴权与委派，业务裁决全部发生在应用层服务里。

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;
use validator::Validate;

use application::NearbyRoom;
use domain::{DomainError, Room, RoomId, UserId};

use crate::error::ApiError;
use crate::state::AppState;
use crate::websocket::websocket_upgrade;

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
struct CreateRoomPayload {
    #[validate(length(min = 1, max = 100))]
    name: String,
    img: Option<String>,
    #[validate(range(min = -90.0, max = 90.0))]
    lat: f64,
    #[validate(range(min = -180.0, max = 180.0))]
    lng: f64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TargetPayload {
    user_id: Uuid,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RemoveMembersPayload {
    user_ids: Vec<Uuid>,
}

#[derive(Debug, Deserialize, Validate)]
struct NearbyQuery {
    #[validate(range(min = -90.0, max = 90.0))]
    lat: f64,
    #[validate(range(min = -180.0, max = 180.0))]
    lng: f64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RoomResponse {
    id: Uuid,
    name: String,
    img: Option<String>,
    lat: f64,
    lng: f64,
    member_count: u32,
    max_members: u32,
    created_by: Uuid,
    created_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
}

impl From<Room> for RoomResponse {
    fn from(room: Room) -> Self {
        Self {
            id: room.id.into(),
            name: room.name,
            img: room.img,
            lat: room.lat,
            lng: room.lng,
            member_count: room.member_count,
            max_members: room.max_members,
            created_by: room.created_by.into(),
            created_at: room.created_at,
            expires_at: room.expires_at,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MemberCountResponse {
    room_id: Uuid,
    member_count: u32,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/rooms", post(create_room).get(list_rooms))
        .route("/rooms/nearby", get(nearby_rooms))
        .route("/rooms/{room_id}/join", post(join_room))
        .route("/rooms/{room_id}/leave", post(leave_room))
        .route("/rooms/{room_id}/promote", post(promote_member))
        .route("/rooms/{room_id}/demote", post(demote_admin))
        .route("/rooms/{room_id}/remove-members", post(remove_members))
        .route("/rooms/{room_id}", delete(delete_room))
        .route("/ws", get(websocket_upgrade))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> StatusCode {
    StatusCode::OK
}

fn validated<T: Validate>(payload: T) -> Result<T, ApiError> {
    payload
        .validate()
        .map_err(|err| ApiError::from(DomainError::validation(err.to_string())))?;
    Ok(payload)
}

async fn create_room(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateRoomPayload>,
) -> Result<(StatusCode, Json<RoomResponse>), ApiError> {
    let creator = state.verifier.verify_headers(&headers)?;
    let payload = validated(payload)?;
    let room = state
        .rooms
        .create_room(creator, payload.name, payload.img, payload.lat, payload.lng)
        .await?;
    Ok((StatusCode::CREATED, Json(room.into())))
}

async fn list_rooms(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<RoomResponse>>, ApiError> {
    state.verifier.verify_headers(&headers)?;
    let rooms = state.rooms.available_rooms().await?;
    Ok(Json(rooms.into_iter().map(RoomResponse::from).collect()))
}

async fn nearby_rooms(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<NearbyQuery>,
) -> Result<Json<Vec<NearbyRoom>>, ApiError> {
    state.verifier.verify_headers(&headers)?;
    let query = validated(query)?;
    let nearby = state.geo.nearby_rooms(query.lat, query.lng, Utc::now()).await?;
    Ok(Json(nearby))
}

async fn join_room(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(room_id): Path<Uuid>,
) -> Result<Json<MemberCountResponse>, ApiError> {
    let user = state.verifier.verify_headers(&headers)?;
    let member_count = state.rooms.join_room(RoomId::from(room_id), user).await?;
    Ok(Json(MemberCountResponse {
        room_id,
        member_count,
    }))
}

async fn leave_room(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(room_id): Path<Uuid>,
) -> Result<Json<MemberCountResponse>, ApiError> {
    let user = state.verifier.verify_headers(&headers)?;
    let member_count = state.rooms.leave_room(RoomId::from(room_id), user).await?;
    Ok(Json(MemberCountResponse {
        room_id,
        member_count,
    }))
}

async fn promote_member(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(room_id): Path<Uuid>,
    Json(payload): Json<TargetPayload>,
) -> Result<StatusCode, ApiError> {
    let requester = state.verifier.verify_headers(&headers)?;
    state
        .rooms
        .promote_member(RoomId::from(room_id), requester, UserId::from(payload.user_id))
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn demote_admin(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(room_id): Path<Uuid>,
    Json(payload): Json<TargetPayload>,
) -> Result<StatusCode, ApiError> {
    let requester = state.verifier.verify_headers(&headers)?;
    state
        .rooms
        .demote_admin(RoomId::from(room_id), requester, UserId::from(payload.user_id))
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn remove_members(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(room_id): Path<Uuid>,
    Json(payload): Json<RemoveMembersPayload>,
) -> Result<Json<MemberCountResponse>, ApiError> {
    let requester = state.verifier.verify_headers(&headers)?;
    let targets: Vec<UserId> = payload.user_ids.into_iter().map(UserId::from).collect();
    let member_count = state
        .rooms
        .remove_members(RoomId::from(room_id), requester, &targets)
        .await?;
    Ok(Json(MemberCountResponse {
        room_id,
        member_count,
    }))
}

async fn delete_room(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(room_id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    let requester = state.verifier.verify_headers(&headers)?;
    state
        .rooms
        .delete_room(RoomId::from(room_id), requester)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
