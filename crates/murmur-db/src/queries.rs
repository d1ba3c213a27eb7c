use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::types::ToSql;
use rusqlite::{Connection, params, params_from_iter};
use tracing::warn;
use uuid::Uuid;

use murmur_types::models::Role;

use crate::Database;
use crate::models::{
    InsertMessage, JoinOutcome, MentionRow, MessageRow, NewMessage, ReactionChange, ReactionRow,
    ReceiptKind, ReceiptRow, RoomRow, StoredMessage, UserRow, parse_uuid,
};
use crate::time;

impl Database {
    // -- Users --

    /// Returns `false` when the username is already taken.
    pub fn create_user(
        &self,
        id: Uuid,
        username: &str,
        password_hash: &str,
        display_name: Option<&str>,
    ) -> Result<bool> {
        self.with_conn(|conn| {
            let inserted = conn.execute(
                "INSERT INTO users (id, username, password_hash, display_name, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(username) DO NOTHING",
                params![id.to_string(), username, password_hash, display_name, time::to_db(time::now())],
            )?;
            Ok(inserted == 1)
        })
    }

    pub fn get_user_by_username(&self, username: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, UserKey::Username(username)))
    }

    pub fn get_user_by_id(&self, id: Uuid) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, UserKey::Id(&id.to_string())))
    }

    pub fn touch_last_seen(&self, user_id: Uuid) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE users SET last_seen = ?1 WHERE id = ?2",
                params![time::to_db(time::now()), user_id.to_string()],
            )?;
            Ok(())
        })
    }

    // -- Rooms & membership --

    /// Creates the room and makes `owner` its first member in one transaction.
    pub fn create_room(
        &self,
        id: Uuid,
        name: &str,
        is_private: bool,
        invite_code: &str,
        owner: Uuid,
    ) -> Result<RoomRow> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let now = time::to_db(time::now());
            tx.execute(
                "INSERT INTO rooms (id, name, is_private, invite_code, created_by, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![id.to_string(), name, is_private, invite_code, owner.to_string(), now],
            )?;
            tx.execute(
                "INSERT INTO room_members (room_id, user_id, role, joined_at) VALUES (?1, ?2, ?3, ?4)",
                params![id.to_string(), owner.to_string(), Role::Owner.as_str(), now],
            )?;
            tx.commit()?;

            Ok(RoomRow {
                id: id.to_string(),
                name: name.to_string(),
                is_private,
                invite_code: invite_code.to_string(),
                created_by: Some(owner.to_string()),
                created_at: now,
            })
        })
    }

    /// Idempotent: joining a room twice keeps the existing role.
    pub fn join_room(&self, invite_code: &str, user_id: Uuid) -> Result<JoinOutcome> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            let room_id: Option<String> = tx
                .query_row("SELECT id FROM rooms WHERE invite_code = ?1", [invite_code], |row| row.get(0))
                .optional()?;
            let Some(room_id) = room_id else {
                return Ok(JoinOutcome::NoSuchRoom);
            };

            let banned = tx
                .query_row(
                    "SELECT 1 FROM room_bans WHERE room_id = ?1 AND user_id = ?2",
                    params![room_id, user_id.to_string()],
                    |_| Ok(()),
                )
                .optional()?
                .is_some();
            if banned {
                return Ok(JoinOutcome::Banned);
            }

            tx.execute(
                "INSERT INTO room_members (room_id, user_id, role, joined_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(room_id, user_id) DO NOTHING",
                params![room_id, user_id.to_string(), Role::Member.as_str(), time::to_db(time::now())],
            )?;
            let role: String = tx.query_row(
                "SELECT role FROM room_members WHERE room_id = ?1 AND user_id = ?2",
                params![room_id, user_id.to_string()],
                |row| row.get(0),
            )?;
            tx.commit()?;

            Ok(JoinOutcome::Joined {
                room_id: parse_uuid(&room_id)?,
                role: role_from_db(&role),
            })
        })
    }

    /// Adds a member with an explicit role. Returns `false` if already a member.
    pub fn add_member(&self, room_id: Uuid, user_id: Uuid, role: Role) -> Result<bool> {
        self.with_conn(|conn| {
            let inserted = conn.execute(
                "INSERT INTO room_members (room_id, user_id, role, joined_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(room_id, user_id) DO NOTHING",
                params![room_id.to_string(), user_id.to_string(), role.as_str(), time::to_db(time::now())],
            )?;
            Ok(inserted == 1)
        })
    }

    /// Membership oracle. Never cached: bans and leaves apply to the next call.
    pub fn membership(&self, room_id: Uuid, user_id: Uuid) -> Result<Option<Role>> {
        self.with_conn(|conn| {
            let role: Option<String> = conn
                .query_row(
                    "SELECT role FROM room_members WHERE room_id = ?1 AND user_id = ?2",
                    params![room_id.to_string(), user_id.to_string()],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(role.as_deref().map(role_from_db))
        })
    }

    pub fn rooms_for_user(&self, user_id: Uuid) -> Result<Vec<(RoomRow, Role)>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT r.id, r.name, r.is_private, r.invite_code, r.created_by, r.created_at, m.role
                 FROM rooms r
                 JOIN room_members m ON r.id = m.room_id
                 WHERE m.user_id = ?1
                 ORDER BY r.created_at DESC",
            )?;

            let rows = stmt
                .query_map([user_id.to_string()], |row| {
                    let room = RoomRow {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        is_private: row.get(2)?,
                        invite_code: row.get(3)?,
                        created_by: row.get(4)?,
                        created_at: row.get(5)?,
                    };
                    let role: String = row.get(6)?;
                    Ok((room, role))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows
                .into_iter()
                .map(|(room, role)| (room, role_from_db(&role)))
                .collect())
        })
    }

    /// Records the ban and removes the membership. Returns whether a
    /// membership was removed.
    pub fn ban_member(
        &self,
        room_id: Uuid,
        user_id: Uuid,
        banned_by: Uuid,
        reason: Option<&str>,
    ) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO room_bans (room_id, user_id, banned_by, reason, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(room_id, user_id) DO NOTHING",
                params![
                    room_id.to_string(),
                    user_id.to_string(),
                    banned_by.to_string(),
                    reason,
                    time::to_db(time::now())
                ],
            )?;
            let removed = tx.execute(
                "DELETE FROM room_members WHERE room_id = ?1 AND user_id = ?2",
                params![room_id.to_string(), user_id.to_string()],
            )?;
            tx.commit()?;
            Ok(removed == 1)
        })
    }

    /// Lifts a ban. The user has to rejoin by invite afterwards.
    pub fn unban_member(&self, room_id: Uuid, user_id: Uuid) -> Result<bool> {
        self.with_conn(|conn| {
            let removed = conn.execute(
                "DELETE FROM room_bans WHERE room_id = ?1 AND user_id = ?2",
                params![room_id.to_string(), user_id.to_string()],
            )?;
            Ok(removed == 1)
        })
    }

    /// Mutes until `until`, or until lifted when `None`. Muting again
    /// replaces the previous mute.
    pub fn mute_member(
        &self,
        room_id: Uuid,
        user_id: Uuid,
        muted_by: Uuid,
        reason: Option<&str>,
        until: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO room_mutes (room_id, user_id, muted_by, reason, until, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(room_id, user_id) DO UPDATE SET
                     muted_by = excluded.muted_by,
                     reason = excluded.reason,
                     until = excluded.until,
                     created_at = excluded.created_at",
                params![
                    room_id.to_string(),
                    user_id.to_string(),
                    muted_by.to_string(),
                    reason,
                    until.map(time::to_db),
                    time::to_db(time::now())
                ],
            )?;
            Ok(())
        })
    }

    pub fn unmute_member(&self, room_id: Uuid, user_id: Uuid) -> Result<bool> {
        self.with_conn(|conn| {
            let removed = conn.execute(
                "DELETE FROM room_mutes WHERE room_id = ?1 AND user_id = ?2",
                params![room_id.to_string(), user_id.to_string()],
            )?;
            Ok(removed == 1)
        })
    }

    pub fn is_muted(&self, room_id: Uuid, user_id: Uuid) -> Result<bool> {
        self.with_conn(|conn| mute_active(conn, room_id, user_id, time::now()))
    }

    // -- Messages --

    /// Checks the parent and the sender's mute, then stores the message and
    /// its mentions in one transaction.
    pub fn insert_message(&self, msg: &NewMessage<'_>) -> Result<InsertMessage> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let created_at = time::now();

            if let Some(parent_id) = msg.parent_id {
                if !message_in_room(&tx, parent_id, msg.room_id, true)? {
                    return Ok(InsertMessage::InvalidParent);
                }
            }
            if mute_active(&tx, msg.room_id, msg.user_id, created_at)? {
                return Ok(InsertMessage::Muted);
            }

            let id = Uuid::new_v4();
            let attachment = msg.attachment;

            tx.execute(
                "INSERT INTO messages (id, room_id, user_id, content, parent_id,
                     attachment_key, attachment_name, attachment_type, attachment_size, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    id.to_string(),
                    msg.room_id.to_string(),
                    msg.user_id.to_string(),
                    msg.content,
                    msg.parent_id.map(|id| id.to_string()),
                    attachment.map(|a| a.key.as_str()),
                    attachment.map(|a| a.name.as_str()),
                    attachment.map(|a| a.content_type.as_str()),
                    attachment.map(|a| a.size),
                    time::to_db(created_at),
                ],
            )?;

            let mut mentions = Vec::new();
            {
                let mut stmt = tx.prepare(
                    "INSERT OR IGNORE INTO message_mentions (message_id, user_id)
                     SELECT ?1, user_id FROM room_members WHERE room_id = ?2 AND user_id = ?3",
                )?;
                for user_id in msg.mentions {
                    let kept = stmt.execute(params![
                        id.to_string(),
                        msg.room_id.to_string(),
                        user_id.to_string()
                    ])?;
                    if kept == 1 {
                        mentions.push(*user_id);
                    }
                }
            }
            tx.commit()?;

            Ok(InsertMessage::Inserted(StoredMessage {
                id,
                created_at,
                mentions,
            }))
        })
    }

    /// Newest first. `cursor` is exclusive: only rows strictly older are returned.
    pub fn get_messages(
        &self,
        room_id: Uuid,
        thread_of: Option<Uuid>,
        cursor: Option<DateTime<Utc>>,
        limit: u32,
    ) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| query_messages(conn, room_id, thread_of, cursor, limit))
    }

    pub fn get_message(&self, id: Uuid) -> Result<Option<MessageRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("{MESSAGE_COLUMNS} WHERE id = ?1"))?;
            let row = stmt.query_row([id.to_string()], map_message).optional()?;
            Ok(row)
        })
    }

    // -- Reactions --

    /// Insert-or-ignore on `(message, user, emoji)`.
    pub fn add_reaction(
        &self,
        room_id: Uuid,
        message_id: Uuid,
        user_id: Uuid,
        emoji: &str,
    ) -> Result<ReactionChange> {
        self.with_conn(|conn| {
            if !message_in_room(conn, message_id, room_id, false)? {
                return Ok(ReactionChange::NoSuchMessage);
            }
            let inserted = conn.execute(
                "INSERT INTO message_reactions (message_id, user_id, emoji, created_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(message_id, user_id, emoji) DO NOTHING",
                params![message_id.to_string(), user_id.to_string(), emoji, time::to_db(time::now())],
            )?;
            Ok(if inserted == 1 { ReactionChange::Changed } else { ReactionChange::Unchanged })
        })
    }

    pub fn remove_reaction(
        &self,
        room_id: Uuid,
        message_id: Uuid,
        user_id: Uuid,
        emoji: &str,
    ) -> Result<ReactionChange> {
        self.with_conn(|conn| {
            if !message_in_room(conn, message_id, room_id, false)? {
                return Ok(ReactionChange::NoSuchMessage);
            }
            let removed = conn.execute(
                "DELETE FROM message_reactions WHERE message_id = ?1 AND user_id = ?2 AND emoji = ?3",
                params![message_id.to_string(), user_id.to_string(), emoji],
            )?;
            Ok(if removed == 1 { ReactionChange::Changed } else { ReactionChange::Unchanged })
        })
    }

    /// Batch-fetch reactions for a set of message IDs.
    pub fn get_reactions_for_messages(&self, message_ids: &[String]) -> Result<Vec<ReactionRow>> {
        if message_ids.is_empty() {
            return Ok(vec![]);
        }

        self.with_conn(|conn| {
            let placeholders: Vec<String> = (1..=message_ids.len()).map(|i| format!("?{}", i)).collect();
            let sql = format!(
                "SELECT message_id, user_id, emoji FROM message_reactions
                 WHERE message_id IN ({})
                 ORDER BY created_at",
                placeholders.join(", ")
            );

            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params_from_iter(message_ids.iter()), |row| {
                    Ok(ReactionRow {
                        message_id: row.get(0)?,
                        user_id: row.get(1)?,
                        emoji: row.get(2)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows)
        })
    }

    /// Per-emoji counts for one message, in order of first use.
    pub fn reaction_counts(&self, message_id: Uuid) -> Result<Vec<(String, i64)>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT emoji, COUNT(*) FROM message_reactions
                 WHERE message_id = ?1
                 GROUP BY emoji
                 ORDER BY MIN(created_at), emoji",
            )?;
            let rows = stmt
                .query_map([message_id.to_string()], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    // -- Mentions --

    pub fn get_mentions_for_messages(&self, message_ids: &[String]) -> Result<Vec<MentionRow>> {
        if message_ids.is_empty() {
            return Ok(vec![]);
        }

        self.with_conn(|conn| {
            let placeholders: Vec<String> = (1..=message_ids.len()).map(|i| format!("?{}", i)).collect();
            let sql = format!(
                "SELECT message_id, user_id FROM message_mentions WHERE message_id IN ({})",
                placeholders.join(", ")
            );

            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params_from_iter(message_ids.iter()), |row| {
                    Ok(MentionRow {
                        message_id: row.get(0)?,
                        user_id: row.get(1)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows)
        })
    }

    // -- Receipts --

    /// Advance-only upsert of one receipt column for each id that belongs to
    /// `room_id`. Ids outside the room are skipped. Returns how many rows were
    /// written.
    pub fn record_receipts(
        &self,
        room_id: Uuid,
        user_id: Uuid,
        message_ids: &[Uuid],
        kind: ReceiptKind,
        at: DateTime<Utc>,
    ) -> Result<usize> {
        if message_ids.is_empty() {
            return Ok(0);
        }

        let column = kind.column();
        let sql = format!(
            "INSERT INTO message_receipts (message_id, user_id, {column})
             SELECT id, ?2, ?3 FROM messages WHERE id = ?1 AND room_id = ?4
             ON CONFLICT(message_id, user_id) DO UPDATE SET
                 {column} = MAX(COALESCE(message_receipts.{column}, excluded.{column}), excluded.{column})"
        );

        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let at = time::to_db(at);
            let mut written = 0;
            {
                let mut stmt = tx.prepare(&sql)?;
                for id in message_ids {
                    written += stmt.execute(params![
                        id.to_string(),
                        user_id.to_string(),
                        at,
                        room_id.to_string()
                    ])?;
                }
            }
            tx.commit()?;
            Ok(written)
        })
    }

    pub fn get_receipt(&self, message_id: Uuid, user_id: Uuid) -> Result<Option<ReceiptRow>> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT message_id, user_id, delivered_at, read_at FROM message_receipts
                     WHERE message_id = ?1 AND user_id = ?2",
                    params![message_id.to_string(), user_id.to_string()],
                    |row| {
                        Ok(ReceiptRow {
                            message_id: row.get(0)?,
                            user_id: row.get(1)?,
                            delivered_at: row.get(2)?,
                            read_at: row.get(3)?,
                        })
                    },
                )
                .optional()?;
            Ok(row)
        })
    }
}

enum UserKey<'a> {
    Id(&'a str),
    Username(&'a str),
}

fn query_user(conn: &Connection, key: UserKey<'_>) -> Result<Option<UserRow>> {
    let (column, value) = match key {
        UserKey::Id(id) => ("id", id),
        UserKey::Username(username) => ("username", username),
    };
    let mut stmt = conn.prepare(&format!(
        "SELECT id, username, password_hash, display_name, created_at, last_seen
         FROM users WHERE {column} = ?1"
    ))?;

    let row = stmt
        .query_row([value], |row| {
            Ok(UserRow {
                id: row.get(0)?,
                username: row.get(1)?,
                password_hash: row.get(2)?,
                display_name: row.get(3)?,
                created_at: row.get(4)?,
                last_seen: row.get(5)?,
            })
        })
        .optional()?;

    Ok(row)
}

const MESSAGE_COLUMNS: &str = "SELECT id, room_id, user_id, content, parent_id,
        attachment_key, attachment_name, attachment_type, attachment_size,
        created_at, edited, deleted
     FROM messages";

fn map_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        id: row.get(0)?,
        room_id: row.get(1)?,
        user_id: row.get(2)?,
        content: row.get(3)?,
        parent_id: row.get(4)?,
        attachment_key: row.get(5)?,
        attachment_name: row.get(6)?,
        attachment_type: row.get(7)?,
        attachment_size: row.get(8)?,
        created_at: row.get(9)?,
        edited: row.get(10)?,
        deleted: row.get(11)?,
    })
}

fn query_messages(
    conn: &Connection,
    room_id: Uuid,
    thread_of: Option<Uuid>,
    cursor: Option<DateTime<Utc>>,
    limit: u32,
) -> Result<Vec<MessageRow>> {
    let mut sql = format!("{MESSAGE_COLUMNS} WHERE room_id = ?");
    let mut args: Vec<Box<dyn ToSql>> = vec![Box::new(room_id.to_string())];

    if let Some(parent_id) = thread_of {
        sql.push_str(" AND parent_id = ?");
        args.push(Box::new(parent_id.to_string()));
    }
    if let Some(cursor) = cursor {
        sql.push_str(" AND created_at < ?");
        args.push(Box::new(time::to_db(cursor)));
    }
    sql.push_str(" ORDER BY created_at DESC, id DESC LIMIT ?");
    args.push(Box::new(limit));

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(args.iter()), map_message)?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(rows)
}

fn message_in_room(conn: &Connection, message_id: Uuid, room_id: Uuid, allow_deleted: bool) -> Result<bool> {
    let found = conn
        .query_row(
            "SELECT deleted FROM messages WHERE id = ?1 AND room_id = ?2",
            params![message_id.to_string(), room_id.to_string()],
            |row| row.get::<_, bool>(0),
        )
        .optional()?;
    Ok(matches!(found, Some(deleted) if allow_deleted || !deleted))
}

fn mute_active(conn: &Connection, room_id: Uuid, user_id: Uuid, at: DateTime<Utc>) -> Result<bool> {
    let found = conn
        .query_row(
            "SELECT 1 FROM room_mutes
             WHERE room_id = ?1 AND user_id = ?2 AND (until IS NULL OR until > ?3)",
            params![room_id.to_string(), user_id.to_string(), time::to_db(at)],
            |_| Ok(()),
        )
        .optional()?;
    Ok(found.is_some())
}

fn role_from_db(raw: &str) -> Role {
    raw.parse().unwrap_or_else(|e| {
        warn!("{}; treating as guest", e);
        Role::Guest
    })
}

/// Extension trait for optional query results
pub(crate) trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
