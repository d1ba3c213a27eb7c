use axum::{Extension, Json, extract::State, http::StatusCode, response::IntoResponse};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use uuid::Uuid;

use murmur_db::models::{JoinOutcome, RoomRow};
use murmur_db::time;
use murmur_types::api::{CreateRoomRequest, JoinRoomRequest, JoinRoomResponse, RoomResponse};
use murmur_types::models::Role;

use crate::error::ApiError;
use crate::middleware::AuthUser;
use crate::state::AppState;

const MAX_ROOM_NAME_CHARS: usize = 100;

/// 12 URL-safe characters.
fn new_invite_code() -> String {
    URL_SAFE_NO_PAD.encode(rand::random::<[u8; 9]>())
}

fn room_response(row: &RoomRow, role: Role) -> Result<RoomResponse, ApiError> {
    Ok(RoomResponse {
        id: row.room_id()?,
        name: row.name.clone(),
        is_private: row.is_private,
        invite_code: row.invite_code.clone(),
        role,
        created_at: time::from_db(&row.created_at)?,
    })
}

pub async fn create_room(
    State(state): State<AppState>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    Json(req): Json<CreateRoomRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let name = req.name.trim().to_string();
    if name.is_empty() || name.chars().count() > MAX_ROOM_NAME_CHARS {
        return Err(ApiError::BadRequest(format!(
            "room name must be 1 to {} characters",
            MAX_ROOM_NAME_CHARS
        )));
    }

    let room_id = Uuid::new_v4();
    let invite_code = new_invite_code();
    let is_private = req.is_private;
    let row = state
        .db(move |db| db.create_room(room_id, &name, is_private, &invite_code, user_id))
        .await?;

    Ok((StatusCode::CREATED, Json(room_response(&row, Role::Owner)?)))
}

pub async fn list_rooms(
    State(state): State<AppState>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
) -> Result<impl IntoResponse, ApiError> {
    let rows = state.db(move |db| db.rooms_for_user(user_id)).await?;
    let rooms = rows
        .iter()
        .map(|(row, role)| room_response(row, *role))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Json(rooms))
}

pub async fn join_room(
    State(state): State<AppState>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    Json(req): Json<JoinRoomRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let code = req.invite_code.trim().to_string();
    match state.db(move |db| db.join_room(&code, user_id)).await? {
        JoinOutcome::Joined { room_id, role } => Ok(Json(JoinRoomResponse { room_id, role })),
        JoinOutcome::Banned => Err(ApiError::Forbidden),
        JoinOutcome::NoSuchRoom => Err(ApiError::NotFound),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invite_codes_are_url_safe_and_distinct() {
        let a = new_invite_code();
        let b = new_invite_code();
        assert_eq!(a.len(), 12);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        assert_ne!(a, b);
    }
}
