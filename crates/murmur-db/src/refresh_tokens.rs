use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::params;
use uuid::Uuid;

use crate::Database;
use crate::models::{RefreshTokenRow, RotateOutcome, parse_uuid};
use crate::queries::OptionalExt;
use crate::time;

impl Database {
    pub fn insert_refresh_token(&self, jti: &str, user_id: Uuid, expires_at: DateTime<Utc>) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO refresh_tokens (jti, user_id, created_at, expires_at) VALUES (?1, ?2, ?3, ?4)",
                params![jti, user_id.to_string(), time::to_db(time::now()), time::to_db(expires_at)],
            )?;
            Ok(())
        })
    }

    pub fn get_refresh_token(&self, jti: &str) -> Result<Option<RefreshTokenRow>> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT jti, user_id, rotated, revoked, created_at, expires_at
                     FROM refresh_tokens WHERE jti = ?1",
                    [jti],
                    |row| {
                        Ok(RefreshTokenRow {
                            jti: row.get(0)?,
                            user_id: row.get(1)?,
                            rotated: row.get(2)?,
                            revoked: row.get(3)?,
                            created_at: row.get(4)?,
                            expires_at: row.get(5)?,
                        })
                    },
                )
                .optional()?;
            Ok(row)
        })
    }

    /// Marks `jti` rotated and records its successor, all in one transaction.
    ///
    /// Only one caller can win the `rotated = 0` compare-and-set. Presenting a
    /// record that is already rotated or revoked revokes every refresh record
    /// the owner holds.
    pub fn rotate_refresh_token(
        &self,
        jti: &str,
        successor_jti: &str,
        successor_expires_at: DateTime<Utc>,
    ) -> Result<RotateOutcome> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            let owner: Option<String> = tx
                .query_row("SELECT user_id FROM refresh_tokens WHERE jti = ?1", [jti], |row| row.get(0))
                .optional()?;
            let Some(owner) = owner else {
                return Ok(RotateOutcome::Unknown);
            };
            let user_id = parse_uuid(&owner)?;

            let claimed = tx.execute(
                "UPDATE refresh_tokens SET rotated = 1
                 WHERE jti = ?1 AND rotated = 0 AND revoked = 0",
                [jti],
            )?;

            if claimed == 0 {
                tx.execute("UPDATE refresh_tokens SET revoked = 1 WHERE user_id = ?1", [&owner])?;
                tx.commit()?;
                return Ok(RotateOutcome::Reused { user_id });
            }

            tx.execute(
                "INSERT INTO refresh_tokens (jti, user_id, created_at, expires_at) VALUES (?1, ?2, ?3, ?4)",
                params![successor_jti, owner, time::to_db(time::now()), time::to_db(successor_expires_at)],
            )?;
            tx.commit()?;

            Ok(RotateOutcome::Rotated { user_id })
        })
    }

    /// Revokes every refresh record of a user. Returns how many were still live.
    pub fn revoke_refresh_tokens(&self, user_id: Uuid) -> Result<usize> {
        self.with_conn(|conn| {
            let revoked = conn.execute(
                "UPDATE refresh_tokens SET revoked = 1 WHERE user_id = ?1 AND revoked = 0",
                [user_id.to_string()],
            )?;
            Ok(revoked)
        })
    }

    /// Deletes refresh records that expired before `now`. Unexpired records
    /// are kept even when rotated or revoked: they are what detects reuse.
    pub fn prune_refresh_tokens(&self, now: DateTime<Utc>) -> Result<usize> {
        self.with_conn(|conn| {
            let pruned = conn.execute(
                "DELETE FROM refresh_tokens WHERE expires_at < ?1",
                [time::to_db(now)],
            )?;
            Ok(pruned)
        })
    }
}
