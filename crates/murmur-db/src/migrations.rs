use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);")?;

    let version: i64 =
        conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |r| r.get(0))?;

    if version < 1 {
        info!("Running migration v1 (users, rooms, messages)");
        conn.execute_batch(
            "
            CREATE TABLE users (
                id              TEXT PRIMARY KEY,
                username        TEXT NOT NULL UNIQUE,
                password_hash   TEXT NOT NULL,
                display_name    TEXT,
                created_at      TEXT NOT NULL,
                last_seen       TEXT
            );

            CREATE TABLE rooms (
                id              TEXT PRIMARY KEY,
                name            TEXT NOT NULL,
                is_private      INTEGER NOT NULL DEFAULT 0,
                invite_code     TEXT NOT NULL UNIQUE,
                created_by      TEXT REFERENCES users(id) ON DELETE SET NULL,
                created_at      TEXT NOT NULL
            );

            CREATE TABLE room_members (
                room_id         TEXT NOT NULL REFERENCES rooms(id) ON DELETE CASCADE,
                user_id         TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                role            TEXT NOT NULL DEFAULT 'member',
                joined_at       TEXT NOT NULL,
                PRIMARY KEY (room_id, user_id)
            );

            CREATE INDEX idx_room_members_user ON room_members(user_id);

            CREATE TABLE room_bans (
                room_id         TEXT NOT NULL REFERENCES rooms(id) ON DELETE CASCADE,
                user_id         TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                banned_by       TEXT REFERENCES users(id) ON DELETE SET NULL,
                reason          TEXT,
                created_at      TEXT NOT NULL,
                PRIMARY KEY (room_id, user_id)
            );

            CREATE TABLE messages (
                id              TEXT PRIMARY KEY,
                room_id         TEXT NOT NULL REFERENCES rooms(id) ON DELETE CASCADE,
                user_id         TEXT REFERENCES users(id) ON DELETE SET NULL,
                content         TEXT NOT NULL,
                parent_id       TEXT REFERENCES messages(id),
                attachment_key  TEXT,
                attachment_name TEXT,
                attachment_type TEXT,
                attachment_size INTEGER,
                created_at      TEXT NOT NULL,
                edited          INTEGER NOT NULL DEFAULT 0,
                deleted         INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX idx_messages_room ON messages(room_id, created_at);
            CREATE INDEX idx_messages_parent ON messages(parent_id, created_at);

            CREATE TABLE message_reactions (
                message_id      TEXT NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
                user_id         TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                emoji           TEXT NOT NULL,
                created_at      TEXT NOT NULL,
                UNIQUE(message_id, user_id, emoji)
            );

            CREATE INDEX idx_reactions_message ON message_reactions(message_id);

            CREATE TABLE message_receipts (
                message_id      TEXT NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
                user_id         TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                delivered_at    TEXT,
                read_at         TEXT,
                PRIMARY KEY (message_id, user_id)
            );

            INSERT INTO schema_version (version) VALUES (1);
            ",
        )?;
    }

    if version < 2 {
        info!("Running migration v2 (refresh tokens)");
        conn.execute_batch(
            "
            CREATE TABLE refresh_tokens (
                jti             TEXT PRIMARY KEY,
                user_id         TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                rotated         INTEGER NOT NULL DEFAULT 0,
                revoked         INTEGER NOT NULL DEFAULT 0,
                created_at      TEXT NOT NULL,
                expires_at      TEXT NOT NULL
            );

            CREATE INDEX idx_refresh_tokens_user ON refresh_tokens(user_id);

            INSERT INTO schema_version (version) VALUES (2);
            ",
        )?;
    }

    if version < 3 {
        info!("Running migration v3 (mutes, mentions)");
        conn.execute_batch(
            "
            CREATE TABLE room_mutes (
                room_id         TEXT NOT NULL REFERENCES rooms(id) ON DELETE CASCADE,
                user_id         TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                muted_by        TEXT REFERENCES users(id) ON DELETE SET NULL,
                reason          TEXT,
                until           TEXT,
                created_at      TEXT NOT NULL,
                PRIMARY KEY (room_id, user_id)
            );

            CREATE TABLE message_mentions (
                message_id      TEXT NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
                user_id         TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                PRIMARY KEY (message_id, user_id)
            );

            CREATE INDEX idx_mentions_user ON message_mentions(user_id);
            CREATE INDEX idx_refresh_tokens_expiry ON refresh_tokens(expires_at);

            INSERT INTO schema_version (version) VALUES (3);
            ",
        )?;
    }

    info!("Database migrations complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_are_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run(&conn).unwrap();
        run(&conn).unwrap();

        let version: i64 = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |r| r.get(0))
            .unwrap();
        assert_eq!(version, 3);
    }
}
