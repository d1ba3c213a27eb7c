pub mod cleanup;
pub mod config;

use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    extract::{Query, State, WebSocketUpgrade},
    http::{HeaderMap, Request},
    middleware,
    response::IntoResponse,
    routing::{delete, get, post},
};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, debug_span};
use uuid::Uuid;

use murmur_api::middleware::{bearer_token, limit_auth, require_auth};
use murmur_api::{
    ApiError, AppState, AppStateInner, RateLimiter, auth, health, messages, moderation, reactions, receipts, rooms,
};
use murmur_auth::TokenService;
use murmur_db::Database;
use murmur_gateway::{Gateway, Registry, connection};

use crate::config::Config;

pub fn build_state(config: &Config, db: Arc<Database>) -> AppState {
    let tokens = TokenService::new(
        &config.jwt_secret,
        config.jwt_issuer.clone(),
        config.access_ttl,
        config.refresh_ttl,
        db.clone(),
    );
    let gateway = Gateway::new(db, Registry::new(), config.store_timeout);

    Arc::new(AppStateInner {
        gateway,
        tokens,
        history_max_limit: config.history_max_limit,
        auth_limiter: RateLimiter::new(config.auth_rate_limit, config.auth_rate_window),
        login_failures: RateLimiter::new(config.login_max_failures, config.login_failure_window),
    })
}

pub fn build_router(state: AppState) -> Router {
    let credential_routes = Router::new()
        .route("/auth/register", post(auth::register))
        .route("/auth/login", post(auth::login))
        .route_layer(middleware::from_fn_with_state(state.clone(), limit_auth))
        .with_state(state.clone());

    let public_routes = Router::new()
        .route("/auth/refresh", post(auth::refresh))
        .route("/health", get(health::health))
        .route("/ws", get(ws_upgrade))
        .with_state(state.clone());

    let protected_routes = Router::new()
        .route("/auth/logout", post(auth::logout))
        .route("/rooms", get(rooms::list_rooms).post(rooms::create_room))
        .route("/rooms/join", post(rooms::join_room))
        .route(
            "/rooms/{room_id}/messages",
            get(messages::get_history).post(messages::post_message),
        )
        .route(
            "/rooms/{room_id}/receipts/delivered",
            post(receipts::mark_delivered),
        )
        .route("/rooms/{room_id}/receipts/read", post(receipts::mark_read))
        .route(
            "/messages/{message_id}/reactions",
            post(reactions::add_reaction).delete(reactions::remove_reaction),
        )
        .route("/rooms/{room_id}/bans", post(moderation::ban_user))
        .route("/rooms/{room_id}/bans/{user_id}", delete(moderation::unban_user))
        .route("/rooms/{room_id}/mutes", post(moderation::mute_user))
        .route("/rooms/{room_id}/mutes/{user_id}", delete(moderation::unmute_user))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth))
        .with_state(state);

    Router::new()
        .merge(credential_routes)
        .merge(public_routes)
        .merge(protected_routes)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http().make_span_with(request_span))
}

/// Only the path is recorded; the socket route carries the access token in
/// its query string.
fn request_span(req: &Request<Body>) -> tracing::Span {
    debug_span!("request", method = %req.method(), path = %req.uri().path())
}

#[derive(Debug, Deserialize)]
struct WsParams {
    room_id: Uuid,
    token: Option<String>,
}

/// The access token is checked before the upgrade; membership is checked by
/// the session right after it.
async fn ws_upgrade(
    State(state): State<AppState>,
    Query(params): Query<WsParams>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<impl IntoResponse, ApiError> {
    let token = params
        .token
        .as_deref()
        .or_else(|| bearer_token(&headers))
        .ok_or(ApiError::Unauthorized)?;
    let user_id = state.tokens.verify_access(token)?;
    debug!("{} upgrading to room {}", user_id, params.room_id);

    let gateway = state.gateway.clone();
    let room_id = params.room_id;
    Ok(ws.on_upgrade(move |socket| connection::serve_socket(socket, gateway, room_id, user_id)))
}
