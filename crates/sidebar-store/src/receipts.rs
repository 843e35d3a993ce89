use rusqlite::params;
use sidebar_types::ReadReceipt;
use uuid::Uuid;

use crate::models;
use crate::{Database, OptionalExt, Result};

impl Database {
    /// Upsert a read receipt. `last_read_at` only moves forward (MAX of
    /// old and new), so racing calls can never regress it.
    /// `last_read_message_id` changes only when the referenced message
    /// exists in the channel; an unknown id keeps the previous pointer.
    pub fn mark_read(
        &self,
        channel_id: Uuid,
        user_id: Uuid,
        message_id: Option<Uuid>,
    ) -> Result<ReadReceipt> {
        self.with_conn_mut(|conn| {
            let cid = channel_id.to_string();
            let uid = user_id.to_string();

            let valid_id = match message_id {
                Some(mid) => {
                    let mut stmt =
                        conn.prepare("SELECT 1 FROM messages WHERE id = ?1 AND channel_id = ?2")?;
                    stmt.query_row(params![mid.to_string(), cid], |_| Ok(()))
                        .optional()?
                        .map(|_| mid.to_string())
                }
                None => None,
            };

            conn.execute(
                "INSERT INTO read_receipts (channel_id, user_id, last_read_at, last_read_message_id)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(channel_id, user_id) DO UPDATE SET
                     last_read_at = MAX(read_receipts.last_read_at, excluded.last_read_at),
                     last_read_message_id = CASE
                         WHEN excluded.last_read_message_id IS NOT NULL
                             THEN excluded.last_read_message_id
                         ELSE read_receipts.last_read_message_id
                     END",
                params![cid, uid, models::now_string(), valid_id],
            )?;

            let mut stmt = conn.prepare(
                "SELECT last_read_at, last_read_message_id FROM read_receipts
                 WHERE channel_id = ?1 AND user_id = ?2",
            )?;
            let (at_raw, mid_raw): (String, Option<String>) =
                stmt.query_row(params![cid, uid], |row| Ok((row.get(0)?, row.get(1)?)))?;

            Ok(ReadReceipt {
                channel_id,
                user_id,
                last_read_at: models::parse_ts(&at_raw)?,
                last_read_message_id: mid_raw.as_deref().map(models::parse_id).transpose()?,
            })
        })
    }
}
