use axum::{
    Extension, Json,
    extract::{Path, State},
    extract::ws::close_code,
    http::StatusCode,
    response::IntoResponse,
};
use tracing::info;
use uuid::Uuid;

use murmur_db::time;
use murmur_types::api::{BanRequest, BanResponse, MuteRequest, MuteResponse};
use murmur_types::models::Role;

use crate::error::ApiError;
use crate::middleware::AuthUser;
use crate::state::AppState;

struct Standing {
    actor: Role,
    /// Current role of the target in the room, if a member.
    target: Option<Role>,
    target_exists: bool,
}

/// Loads both roles and requires the actor to be at least a mod.
async fn standing(state: &AppState, room_id: Uuid, actor_id: Uuid, target_id: Uuid) -> Result<Standing, ApiError> {
    let (actor, target, target_exists) = state
        .db(move |db| {
            let actor = db.membership(room_id, actor_id)?;
            let target = db.membership(room_id, target_id)?;
            let exists = target.is_some() || db.get_user_by_id(target_id)?.is_some();
            Ok((actor, target, exists))
        })
        .await?;

    let actor = actor.ok_or(ApiError::Forbidden)?;
    if !actor.can_moderate() {
        return Err(ApiError::Forbidden);
    }
    Ok(Standing {
        actor,
        target,
        target_exists,
    })
}

/// Bans a user from a room. The actor must be at least a mod and strictly
/// outrank the target. Live connections of the target are closed.
pub async fn ban_user(
    State(state): State<AppState>,
    Path(room_id): Path<Uuid>,
    Extension(AuthUser(actor_id)): Extension<AuthUser>,
    Json(req): Json<BanRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let target_id = req.user_id;
    if target_id == actor_id {
        return Err(ApiError::BadRequest("cannot ban yourself".into()));
    }

    let standing = standing(&state, room_id, actor_id, target_id).await?;
    if !standing.target_exists {
        return Err(ApiError::NotFound);
    }
    if let Some(target_role) = standing.target {
        if !standing.actor.outranks(target_role) {
            return Err(ApiError::Forbidden);
        }
    }

    let reason = req.reason;
    let removed = state
        .db(move |db| db.ban_member(room_id, target_id, actor_id, reason.as_deref()))
        .await?;

    let connections_closed = state
        .gateway
        .registry()
        .evict(room_id, target_id, close_code::POLICY, "banned")
        .await;

    info!(
        "{} banned {} from room {} (membership removed: {}, connections closed: {})",
        actor_id, target_id, room_id, removed, connections_closed
    );

    Ok(Json(BanResponse {
        room_id,
        user_id: target_id,
        connections_closed,
    }))
}

/// Lifts a ban. The user is not re-added; they rejoin by invite.
pub async fn unban_user(
    State(state): State<AppState>,
    Path((room_id, target_id)): Path<(Uuid, Uuid)>,
    Extension(AuthUser(actor_id)): Extension<AuthUser>,
) -> Result<impl IntoResponse, ApiError> {
    standing(&state, room_id, actor_id, target_id).await?;

    if !state.db(move |db| db.unban_member(room_id, target_id)).await? {
        return Err(ApiError::NotFound);
    }
    info!("{} unbanned {} in room {}", actor_id, target_id, room_id);
    Ok(StatusCode::NO_CONTENT)
}

/// Mutes a member for `minutes`, or until lifted. A muted member keeps
/// reading but cannot post.
pub async fn mute_user(
    State(state): State<AppState>,
    Path(room_id): Path<Uuid>,
    Extension(AuthUser(actor_id)): Extension<AuthUser>,
    Json(req): Json<MuteRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let target_id = req.user_id;
    if target_id == actor_id {
        return Err(ApiError::BadRequest("cannot mute yourself".into()));
    }

    let standing = standing(&state, room_id, actor_id, target_id).await?;
    let target_role = standing.target.ok_or(ApiError::NotFound)?;
    if !standing.actor.outranks(target_role) {
        return Err(ApiError::Forbidden);
    }

    let until = match req.minutes.filter(|m| *m > 0) {
        None => None,
        Some(minutes) => Some(
            chrono::Duration::try_minutes(minutes)
                .and_then(|d| time::now().checked_add_signed(d))
                .ok_or_else(|| ApiError::BadRequest("mute duration is out of range".into()))?,
        ),
    };

    let reason = req.reason;
    state
        .db(move |db| db.mute_member(room_id, target_id, actor_id, reason.as_deref(), until))
        .await?;
    info!("{} muted {} in room {} until {:?}", actor_id, target_id, room_id, until);

    Ok(Json(MuteResponse {
        room_id,
        user_id: target_id,
        until,
    }))
}

pub async fn unmute_user(
    State(state): State<AppState>,
    Path((room_id, target_id)): Path<(Uuid, Uuid)>,
    Extension(AuthUser(actor_id)): Extension<AuthUser>,
) -> Result<impl IntoResponse, ApiError> {
    standing(&state, room_id, actor_id, target_id).await?;

    if !state.db(move |db| db.unmute_member(room_id, target_id)).await? {
        return Err(ApiError::NotFound);
    }
    info!("{} unmuted {} in room {}", actor_id, target_id, room_id);
    Ok(StatusCode::NO_CONTENT)
}
