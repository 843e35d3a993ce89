use rusqlite::params;
use uuid::Uuid;

use crate::models;
use crate::{Database, OptionalExt, Result};

impl Database {
    pub fn add_friendship(&self, a: Uuid, b: Uuid) -> Result<()> {
        let (lo, hi) = ordered_pair(a, b);
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO friendships (user_lo, user_hi, created_at) VALUES (?1, ?2, ?3)",
                params![lo.to_string(), hi.to_string(), models::now_string()],
            )?;
            Ok(())
        })
    }

    pub fn are_friends(&self, a: Uuid, b: Uuid) -> Result<bool> {
        let (lo, hi) = ordered_pair(a, b);
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT 1 FROM friendships WHERE user_lo = ?1 AND user_hi = ?2")?;
            let found = stmt
                .query_row(params![lo.to_string(), hi.to_string()], |_| Ok(()))
                .optional()?;
            Ok(found.is_some())
        })
    }

    pub fn add_block(&self, blocker: Uuid, blocked: Uuid) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO blocks (blocker_id, blocked_id, created_at) VALUES (?1, ?2, ?3)",
                params![blocker.to_string(), blocked.to_string(), models::now_string()],
            )?;
            Ok(())
        })
    }

    pub fn remove_block(&self, blocker: Uuid, blocked: Uuid) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "DELETE FROM blocks WHERE blocker_id = ?1 AND blocked_id = ?2",
                params![blocker.to_string(), blocked.to_string()],
            )?;
            Ok(())
        })
    }

    /// True when either user has blocked the other.
    pub fn blocked_between(&self, a: Uuid, b: Uuid) -> Result<bool> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT 1 FROM blocks
                 WHERE (blocker_id = ?1 AND blocked_id = ?2)
                    OR (blocker_id = ?2 AND blocked_id = ?1)",
            )?;
            let found = stmt
                .query_row(params![a.to_string(), b.to_string()], |_| Ok(()))
                .optional()?;
            Ok(found.is_some())
        })
    }
}

/// Stable ordering for unordered user pairs.
pub(crate) fn ordered_pair(a: Uuid, b: Uuid) -> (Uuid, Uuid) {
    if a <= b { (a, b) } else { (b, a) }
}
