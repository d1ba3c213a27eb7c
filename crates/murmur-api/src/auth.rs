use axum::{Extension, Json, extract::State, http::StatusCode, response::IntoResponse};
use tracing::{info, warn};
use uuid::Uuid;

use murmur_auth::TokenPair;
use murmur_auth::password::{hash_password, verify_password};
use murmur_types::api::{LoginRequest, RefreshRequest, RegisterRequest, TokenResponse};

use crate::error::ApiError;
use crate::middleware::AuthUser;
use crate::state::{AppState, with_tokens};

const MIN_PASSWORD_LEN: usize = 8;

fn token_response(pair: TokenPair) -> TokenResponse {
    TokenResponse {
        user_id: pair.user_id,
        access_token: pair.access_token,
        refresh_token: pair.refresh_token,
        token_type: "bearer".into(),
    }
}

pub async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let username = req.username.trim().to_string();
    let name_len = username.chars().count();
    if !(3..=32).contains(&name_len) {
        return Err(ApiError::BadRequest("username must be 3 to 32 characters".into()));
    }
    if req.password.chars().count() < MIN_PASSWORD_LEN {
        return Err(ApiError::BadRequest(format!(
            "password must be at least {} characters",
            MIN_PASSWORD_LEN
        )));
    }

    let password = req.password;
    let password_hash = tokio::task::spawn_blocking(move || hash_password(&password))
        .await
        .map_err(|e| ApiError::Internal(e.into()))?
        .map_err(|e| ApiError::Internal(anyhow::anyhow!("password hashing failed: {}", e)))?;

    let user_id = Uuid::new_v4();
    let name = username.clone();
    let display_name = req.display_name;
    let created = state
        .db(move |db| db.create_user(user_id, &name, &password_hash, display_name.as_deref()))
        .await?;
    if !created {
        return Err(ApiError::Conflict("username already taken".into()));
    }
    info!("Registered {} ({})", username, user_id);

    let pair = with_tokens(&state, move |tokens| tokens.issue_pair(user_id)).await?;
    Ok((StatusCode::CREATED, Json(token_response(pair))))
}

pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let username = req.username.trim().to_string();
    if !state.login_failures.check(&username) {
        warn!("Too many failed logins for {}", username);
        return Err(ApiError::TooManyRequests);
    }

    let name = username.clone();
    let Some(user) = state.db(move |db| db.get_user_by_username(&name)).await? else {
        state.login_failures.record(&username);
        return Err(ApiError::Unauthorized);
    };

    let password = req.password;
    let hash = user.password_hash.clone();
    let valid = tokio::task::spawn_blocking(move || verify_password(&password, &hash))
        .await
        .map_err(|e| ApiError::Internal(e.into()))?;
    if !valid {
        state.login_failures.record(&username);
        return Err(ApiError::Unauthorized);
    }
    state.login_failures.clear(&username);

    let user_id: Uuid = user
        .id
        .parse()
        .map_err(|e| ApiError::Internal(anyhow::anyhow!("corrupt user id '{}': {}", user.id, e)))?;
    state.db(move |db| db.touch_last_seen(user_id)).await?;

    let pair = with_tokens(&state, move |tokens| tokens.issue_pair(user_id)).await?;
    Ok(Json(token_response(pair)))
}

/// Single-use: the presented refresh token is spent whether or not the
/// caller receives the response.
pub async fn refresh(
    State(state): State<AppState>,
    Json(req): Json<RefreshRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let token = req.refresh_token;
    let pair = with_tokens(&state, move |tokens| tokens.rotate_refresh_token(&token)).await?;
    Ok(Json(token_response(pair)))
}

pub async fn logout(
    State(state): State<AppState>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
) -> Result<impl IntoResponse, ApiError> {
    let revoked = with_tokens(&state, move |tokens| tokens.revoke(user_id)).await?;
    info!("{} logged out, {} refresh tokens revoked", user_id, revoked);
    Ok(StatusCode::NO_CONTENT)
}
