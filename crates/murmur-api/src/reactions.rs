use axum::{
    Extension, Json,
    extract::{Path, State},
    response::IntoResponse,
};
use uuid::Uuid;

use murmur_db::models::ReactionChange;
use murmur_gateway::session::{MAX_EMOJI_CHARS, normalize_emoji};
use murmur_types::api::{ReactionCount, ReactionRequest};
use murmur_types::events::ReactionAction;

use crate::error::ApiError;
use crate::middleware::AuthUser;
use crate::state::AppState;

pub async fn add_reaction(
    State(state): State<AppState>,
    Path(message_id): Path<Uuid>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    Json(req): Json<ReactionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    react(&state, message_id, user_id, &req.emoji, ReactionAction::Add).await
}

pub async fn remove_reaction(
    State(state): State<AppState>,
    Path(message_id): Path<Uuid>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    Json(req): Json<ReactionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    react(&state, message_id, user_id, &req.emoji, ReactionAction::Remove).await
}

/// Same write and broadcast as a socket reaction; answers with the
/// message's per-emoji counts.
async fn react(
    state: &AppState,
    message_id: Uuid,
    user_id: Uuid,
    emoji: &str,
    action: ReactionAction,
) -> Result<Json<Vec<ReactionCount>>, ApiError> {
    let emoji = normalize_emoji(emoji).ok_or_else(|| {
        ApiError::BadRequest(format!("emoji must be 1 to {} characters", MAX_EMOJI_CHARS))
    })?;

    let found = state
        .db(move |db| {
            let Some(row) = db.get_message(message_id)? else {
                return Ok(None);
            };
            let room_id: Uuid = row.room_id.parse()?;
            Ok(Some((room_id, db.membership(room_id, user_id)?)))
        })
        .await?;
    let (room_id, role) = found.ok_or(ApiError::NotFound)?;
    if role.is_none() {
        return Err(ApiError::Forbidden);
    }

    let change = state.gateway.react(room_id, user_id, message_id, emoji, action).await?;
    if change == ReactionChange::NoSuchMessage {
        return Err(ApiError::NotFound);
    }

    let counts = state.db(move |db| db.reaction_counts(message_id)).await?;
    Ok(Json(
        counts
            .into_iter()
            .map(|(emoji, count)| ReactionCount { emoji, count })
            .collect(),
    ))
}
