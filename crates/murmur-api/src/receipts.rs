use axum::{
    Extension, Json,
    extract::{Path, State},
    response::IntoResponse,
};
use uuid::Uuid;

use murmur_db::models::ReceiptKind;
use murmur_types::api::{ReceiptRequest, ReceiptResponse};

use crate::error::ApiError;
use crate::messages::require_member;
use crate::middleware::AuthUser;
use crate::state::AppState;

const MAX_RECEIPT_IDS: usize = 500;

pub async fn mark_delivered(
    State(state): State<AppState>,
    Path(room_id): Path<Uuid>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    Json(req): Json<ReceiptRequest>,
) -> Result<impl IntoResponse, ApiError> {
    record(&state, room_id, user_id, req.message_ids, ReceiptKind::Delivered).await
}

pub async fn mark_read(
    State(state): State<AppState>,
    Path(room_id): Path<Uuid>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    Json(req): Json<ReceiptRequest>,
) -> Result<impl IntoResponse, ApiError> {
    record(&state, room_id, user_id, req.message_ids, ReceiptKind::Read).await
}

async fn record(
    state: &AppState,
    room_id: Uuid,
    user_id: Uuid,
    message_ids: Vec<Uuid>,
    kind: ReceiptKind,
) -> Result<Json<ReceiptResponse>, ApiError> {
    if message_ids.len() > MAX_RECEIPT_IDS {
        return Err(ApiError::BadRequest(format!(
            "at most {} message ids per request",
            MAX_RECEIPT_IDS
        )));
    }
    require_member(state, room_id, user_id).await?;

    let recorded = state
        .gateway
        .record_receipts(room_id, user_id, message_ids, kind)
        .await?;
    Ok(Json(ReceiptResponse { recorded }))
}
