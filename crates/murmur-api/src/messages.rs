use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use uuid::Uuid;

use murmur_db::models::{MentionRow, ReactionRow};
use murmur_gateway::PublishOutcome;
use murmur_gateway::session::MAX_MESSAGE_CHARS;
use murmur_types::api::{HistoryResponse, MessageResponse, ReactionGroup, SendMessageRequest};

use crate::error::ApiError;
use crate::middleware::AuthUser;
use crate::state::AppState;

const DEFAULT_LIMIT: u32 = 50;

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    /// Only messages strictly older than this are returned.
    pub cursor: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
    /// Restrict to replies of this message.
    pub thread_of: Option<Uuid>,
}

pub(crate) async fn require_member(state: &AppState, room_id: Uuid, user_id: Uuid) -> Result<(), ApiError> {
    state
        .db(move |db| db.membership(room_id, user_id))
        .await?
        .map(|_| ())
        .ok_or(ApiError::Forbidden)
}

/// Group reaction rows by message, then emoji, keeping first-seen order.
fn group_reactions(rows: &[ReactionRow], message_id: &str) -> Vec<ReactionGroup> {
    let mut groups: Vec<ReactionGroup> = Vec::new();
    for r in rows.iter().filter(|r| r.message_id == message_id) {
        let Ok(uid) = r.user_id.parse::<Uuid>() else {
            continue;
        };
        match groups.iter_mut().find(|g| g.emoji == r.emoji) {
            Some(group) => {
                group.user_ids.push(uid);
                group.count += 1;
            }
            None => groups.push(ReactionGroup {
                emoji: r.emoji.clone(),
                count: 1,
                user_ids: vec![uid],
            }),
        }
    }
    groups
}

fn mentions_of(rows: &[MentionRow], message_id: &str) -> Vec<Uuid> {
    rows.iter()
        .filter(|m| m.message_id == message_id)
        .filter_map(|m| m.user_id.parse().ok())
        .collect()
}

pub async fn get_history(
    State(state): State<AppState>,
    Path(room_id): Path<Uuid>,
    Query(query): Query<HistoryQuery>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
) -> Result<impl IntoResponse, ApiError> {
    require_member(&state, room_id, user_id).await?;

    let limit = query
        .limit
        .unwrap_or(DEFAULT_LIMIT)
        .clamp(1, state.history_max_limit.max(1));
    let (cursor, thread_of) = (query.cursor, query.thread_of);

    let (rows, reaction_rows, mention_rows) = state
        .db(move |db| {
            let rows = db.get_messages(room_id, thread_of, cursor, limit)?;
            let ids: Vec<String> = rows.iter().map(|r| r.id.clone()).collect();
            let reactions = db.get_reactions_for_messages(&ids)?;
            let mentions = db.get_mentions_for_messages(&ids)?;
            Ok((rows, reactions, mentions))
        })
        .await?;

    let messages = rows
        .iter()
        .map(|row| {
            row.to_response(
                group_reactions(&reaction_rows, &row.id),
                mentions_of(&mention_rows, &row.id),
            )
        })
        .collect::<anyhow::Result<Vec<MessageResponse>>>()?;

    let next_cursor = if messages.len() == limit as usize {
        messages.last().map(|m| m.created_at)
    } else {
        None
    };

    Ok(Json(HistoryResponse { messages, next_cursor }))
}

/// Same persist-then-broadcast path as messages sent over the socket.
pub async fn post_message(
    State(state): State<AppState>,
    Path(room_id): Path<Uuid>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    Json(req): Json<SendMessageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    require_member(&state, room_id, user_id).await?;

    let attachment = req.attachment.clone();
    let outcome = state
        .gateway
        .publish_message(
            room_id,
            user_id,
            &req.content,
            req.parent_id,
            req.attachment,
            req.mentions,
        )
        .await?;

    match outcome {
        PublishOutcome::Published { stored, content } => Ok((
            StatusCode::CREATED,
            Json(MessageResponse {
                id: stored.id,
                room_id,
                user_id: Some(user_id),
                content,
                parent_id: req.parent_id,
                attachment,
                created_at: stored.created_at,
                edited: false,
                deleted: false,
                reactions: vec![],
                mentions: stored.mentions,
            }),
        )),
        PublishOutcome::Empty => Err(ApiError::BadRequest("message is empty".into())),
        PublishOutcome::TooLong => Err(ApiError::BadRequest(format!(
            "messages are limited to {} characters",
            MAX_MESSAGE_CHARS
        ))),
        PublishOutcome::InvalidParent => {
            Err(ApiError::BadRequest("parent message not found in this room".into()))
        }
        PublishOutcome::Muted => Err(ApiError::Forbidden),
    }
}
