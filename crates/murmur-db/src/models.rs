//! Database row types. These map directly to SQLite rows and stay distinct
//! from the murmur-types API models to keep the DB layer independent.

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use uuid::Uuid;

use murmur_types::api::{MessageResponse, ReactionGroup};
use murmur_types::models::{Attachment, Role};

use crate::time;

pub struct UserRow {
    pub id: String,
    pub username: String,
    pub password_hash: String,
    pub display_name: Option<String>,
    pub created_at: String,
    pub last_seen: Option<String>,
}

pub struct RoomRow {
    pub id: String,
    pub name: String,
    pub is_private: bool,
    pub invite_code: String,
    pub created_by: Option<String>,
    pub created_at: String,
}

pub struct MessageRow {
    pub id: String,
    pub room_id: String,
    pub user_id: Option<String>,
    pub content: String,
    pub parent_id: Option<String>,
    pub attachment_key: Option<String>,
    pub attachment_name: Option<String>,
    pub attachment_type: Option<String>,
    pub attachment_size: Option<i64>,
    pub created_at: String,
    pub edited: bool,
    pub deleted: bool,
}

pub struct ReactionRow {
    pub message_id: String,
    pub user_id: String,
    pub emoji: String,
}

pub struct MentionRow {
    pub message_id: String,
    pub user_id: String,
}

pub struct ReceiptRow {
    pub message_id: String,
    pub user_id: String,
    pub delivered_at: Option<String>,
    pub read_at: Option<String>,
}

pub struct RefreshTokenRow {
    pub jti: String,
    pub user_id: String,
    pub rotated: bool,
    pub revoked: bool,
    pub created_at: String,
    pub expires_at: String,
}

/// Input for a message insert. Id and timestamp are assigned by the store.
pub struct NewMessage<'a> {
    pub room_id: Uuid,
    pub user_id: Uuid,
    pub content: &'a str,
    pub parent_id: Option<Uuid>,
    pub attachment: Option<&'a Attachment>,
    /// Users to notify. Only current members of the room are kept.
    pub mentions: &'a [Uuid],
}

/// Canonical identity of a persisted message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    /// Mentions as recorded: deduplicated, members only.
    pub mentions: Vec<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertMessage {
    Inserted(StoredMessage),
    /// The parent does not exist or belongs to another room.
    InvalidParent,
    /// The sender has an active mute in the room.
    Muted,
}

/// Result of an idempotent reaction write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReactionChange {
    Changed,
    /// Row already in the requested state (duplicate add, absent remove).
    Unchanged,
    /// Message missing, deleted, or not in the given room.
    NoSuchMessage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiptKind {
    Delivered,
    Read,
}

impl ReceiptKind {
    pub(crate) fn column(&self) -> &'static str {
        match self {
            Self::Delivered => "delivered_at",
            Self::Read => "read_at",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    Joined { room_id: Uuid, role: Role },
    Banned,
    NoSuchRoom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotateOutcome {
    /// Old record is now rotated and the successor record exists.
    Rotated { user_id: Uuid },
    Unknown,
    /// The record was already rotated or revoked; every refresh record of
    /// `user_id` has been revoked.
    Reused { user_id: Uuid },
}

pub(crate) fn parse_uuid(raw: &str) -> Result<Uuid> {
    raw.parse().map_err(|e| anyhow!("Corrupt id '{}': {}", raw, e))
}

impl RoomRow {
    pub fn room_id(&self) -> Result<Uuid> {
        parse_uuid(&self.id)
    }
}

impl MessageRow {
    pub fn attachment(&self) -> Option<Attachment> {
        let key = self.attachment_key.clone()?;
        Some(Attachment {
            key,
            name: self.attachment_name.clone().unwrap_or_default(),
            content_type: self
                .attachment_type
                .clone()
                .unwrap_or_else(|| "application/octet-stream".to_string()),
            size: self.attachment_size.unwrap_or(0),
        })
    }

    pub fn to_response(&self, reactions: Vec<ReactionGroup>, mentions: Vec<Uuid>) -> Result<MessageResponse> {
        Ok(MessageResponse {
            id: parse_uuid(&self.id)?,
            room_id: parse_uuid(&self.room_id)?,
            user_id: self.user_id.as_deref().map(parse_uuid).transpose()?,
            content: self.content.clone(),
            parent_id: self.parent_id.as_deref().map(parse_uuid).transpose()?,
            attachment: self.attachment(),
            created_at: time::from_db(&self.created_at)?,
            edited: self.edited,
            deleted: self.deleted,
            mentions,
            reactions,
        })
    }
}
