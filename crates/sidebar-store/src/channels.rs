use rusqlite::{Connection, params};
use sidebar_types::{ChannelKind, DmChannel};
use uuid::Uuid;

use crate::models::{self, ChannelRow};
use crate::relationships::ordered_pair;
use crate::{Database, OptionalExt, Result, StoreError};

impl Database {
    /// Open the Direct channel for a pair of users, creating it on first
    /// request. Returns `(channel, created)`; a repeat call for the same
    /// pair returns the existing row regardless of argument order.
    pub fn create_direct(&self, creator: Uuid, recipient: Uuid) -> Result<(DmChannel, bool)> {
        let key = direct_key(creator, recipient);
        self.with_conn_mut(|conn| {
            if let Some(existing) = query_channel_id_by_key(conn, &key)? {
                let channel = query_channel(conn, &existing)?.ok_or_else(|| {
                    StoreError::Corrupt(format!("direct key without channel: {key}"))
                })?;
                return Ok((channel, false));
            }

            let id = Uuid::new_v4();
            let now = models::now_string();
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO channels (id, kind, direct_key, created_at) VALUES (?1, 'direct', ?2, ?3)",
                params![id.to_string(), key, now],
            )?;
            tx.execute(
                "INSERT INTO channel_participants (channel_id, user_id, position) VALUES (?1, ?2, 0), (?1, ?3, 1)",
                params![id.to_string(), creator.to_string(), recipient.to_string()],
            )?;
            tx.commit()?;

            let channel = DmChannel {
                id,
                kind: ChannelKind::Direct,
                participants: vec![creator, recipient],
                owner_id: None,
                last_message_id: None,
                last_message_at: None,
                is_deleted: false,
                created_at: models::parse_ts(&now)?,
            };
            Ok((channel, true))
        })
    }

    /// Create a Group channel. The owner is the first participant;
    /// `members` follow in the given order.
    pub fn create_group(&self, owner: Uuid, members: &[Uuid]) -> Result<DmChannel> {
        self.with_conn_mut(|conn| {
            let id = Uuid::new_v4();
            let now = models::now_string();
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO channels (id, kind, owner_id, created_at) VALUES (?1, 'group', ?2, ?3)",
                params![id.to_string(), owner.to_string(), now],
            )?;
            tx.execute(
                "INSERT INTO channel_participants (channel_id, user_id, position) VALUES (?1, ?2, 0)",
                params![id.to_string(), owner.to_string()],
            )?;
            for (i, member) in members.iter().enumerate() {
                tx.execute(
                    "INSERT INTO channel_participants (channel_id, user_id, position) VALUES (?1, ?2, ?3)",
                    params![id.to_string(), member.to_string(), (i + 1) as i64],
                )?;
            }
            tx.commit()?;

            let channel = DmChannel {
                id,
                kind: ChannelKind::Group,
                participants: std::iter::once(owner).chain(members.iter().copied()).collect(),
                owner_id: Some(owner),
                last_message_id: None,
                last_message_at: None,
                is_deleted: false,
                created_at: models::parse_ts(&now)?,
            };
            Ok(channel)
        })
    }

    pub fn get_channel(&self, id: Uuid) -> Result<Option<DmChannel>> {
        self.with_conn(|conn| query_channel(conn, &id.to_string()))
    }

    /// Ids of the live channels a user participates in, oldest first.
    pub fn channel_ids_for_user(&self, user_id: Uuid) -> Result<Vec<Uuid>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT c.id FROM channels c
                 JOIN channel_participants p ON p.channel_id = c.id
                 WHERE p.user_id = ?1 AND c.is_deleted = 0
                 ORDER BY c.created_at",
            )?;
            let raw = stmt
                .query_map([user_id.to_string()], |row| row.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            raw.iter().map(|id| models::parse_id(id)).collect()
        })
    }

    pub fn soft_delete_channel(&self, id: Uuid) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "UPDATE channels SET is_deleted = 1 WHERE id = ?1",
                [id.to_string()],
            )?;
            Ok(())
        })
    }
}

/// Normalized pair key for Direct channels, identical for either argument
/// order.
pub(crate) fn direct_key(a: Uuid, b: Uuid) -> String {
    let (lo, hi) = ordered_pair(a, b);
    format!("{lo}:{hi}")
}

fn query_channel_id_by_key(conn: &Connection, key: &str) -> Result<Option<String>> {
    let mut stmt = conn.prepare("SELECT id FROM channels WHERE direct_key = ?1")?;
    stmt.query_row([key], |row| row.get(0)).optional()
}

pub(crate) fn query_channel(conn: &Connection, id: &str) -> Result<Option<DmChannel>> {
    let mut stmt = conn.prepare(
        "SELECT id, kind, owner_id, last_message_id, last_message_at, is_deleted, created_at
         FROM channels WHERE id = ?1",
    )?;
    let row = stmt
        .query_row([id], |row| {
            Ok(ChannelRow {
                id: row.get(0)?,
                kind: row.get(1)?,
                owner_id: row.get(2)?,
                last_message_id: row.get(3)?,
                last_message_at: row.get(4)?,
                is_deleted: row.get(5)?,
                created_at: row.get(6)?,
            })
        })
        .optional()?;

    let Some(row) = row else { return Ok(None) };
    let participants = query_participants(conn, id)?;
    Ok(Some(row.into_channel(participants)?))
}

fn query_participants(conn: &Connection, channel_id: &str) -> Result<Vec<Uuid>> {
    let mut stmt = conn.prepare(
        "SELECT user_id FROM channel_participants WHERE channel_id = ?1 ORDER BY position",
    )?;
    let raw = stmt
        .query_map([channel_id], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    raw.iter().map(|id| models::parse_id(id)).collect()
}
