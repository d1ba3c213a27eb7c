use axum::{Json, extract::State};

use murmur_types::api::HealthResponse;

use crate::state::AppState;

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".into(),
        rooms_online: state.gateway.registry().room_count().await,
    })
}
