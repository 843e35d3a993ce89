use chrono::{Duration, Utc};
use rusqlite::{Connection, params};
use sidebar_types::{Message, MessageState, ReactionGroup};
use uuid::Uuid;

use crate::models::{self, MessageRow};
use crate::{Database, OptionalExt, Result, StoreError};

/// Authors may edit their messages for this long after posting.
const EDIT_WINDOW_HOURS: i64 = 24;

/// Classified result of the atomic edit operation.
#[derive(Debug)]
pub enum EditOutcome {
    Edited(Message),
    NotFound,
    NotAuthor,
    WindowElapsed,
}

#[derive(Debug, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    NotFound,
    NotAuthor,
}

#[derive(Debug)]
pub enum ReactOutcome {
    Toggled { added: bool, reaction: ReactionGroup },
    NotFound,
}

impl Database {
    /// Insert a message and advance the channel's last-message marker in
    /// one transaction. Ids and timestamps are assigned here.
    pub fn insert_message(
        &self,
        channel_id: Uuid,
        author_id: Uuid,
        content: Option<&str>,
        attachments: &[String],
        referenced_message_id: Option<Uuid>,
    ) -> Result<Message> {
        self.with_conn_mut(|conn| {
            let id = Uuid::new_v4();
            let now = models::now_string();
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO messages (id, channel_id, author_id, content, referenced_message_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    id.to_string(),
                    channel_id.to_string(),
                    author_id.to_string(),
                    content,
                    referenced_message_id.map(|r| r.to_string()),
                    now
                ],
            )?;
            for (position, url) in attachments.iter().enumerate() {
                tx.execute(
                    "INSERT INTO message_attachments (message_id, position, url) VALUES (?1, ?2, ?3)",
                    params![id.to_string(), position as i64, url],
                )?;
            }
            tx.execute(
                "UPDATE channels SET last_message_id = ?1, last_message_at = ?2 WHERE id = ?3",
                params![id.to_string(), now, channel_id.to_string()],
            )?;
            tx.commit()?;

            Ok(Message {
                id,
                channel_id,
                author_id,
                created_at: models::parse_ts(&now)?,
                state: MessageState::Active {
                    content: content.map(str::to_string),
                    attachments: attachments.to_vec(),
                    reactions: Vec::new(),
                    referenced_message_id,
                    edited_at: None,
                },
            })
        })
    }

    pub fn get_message(&self, channel_id: Uuid, message_id: Uuid) -> Result<Option<Message>> {
        self.with_conn(|conn| query_message(conn, &channel_id.to_string(), &message_id.to_string()))
    }

    /// Whether a message row (deleted or not) exists in the channel.
    pub fn message_exists(&self, channel_id: Uuid, message_id: Uuid) -> Result<bool> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT 1 FROM messages WHERE id = ?1 AND channel_id = ?2")?;
            let found = stmt
                .query_row(params![message_id.to_string(), channel_id.to_string()], |_| Ok(()))
                .optional()?;
            Ok(found.is_some())
        })
    }

    /// Author check, deleted check and edit-window check happen together
    /// with the mutation under the connection lock.
    pub fn edit_message(
        &self,
        channel_id: Uuid,
        message_id: Uuid,
        author_id: Uuid,
        content: &str,
    ) -> Result<EditOutcome> {
        self.with_conn_mut(|conn| {
            let cid = channel_id.to_string();
            let mid = message_id.to_string();
            let Some(header) = query_message_header(conn, &cid, &mid)? else {
                return Ok(EditOutcome::NotFound);
            };
            if header.is_deleted {
                return Ok(EditOutcome::NotFound);
            }
            if header.author_id != author_id.to_string() {
                return Ok(EditOutcome::NotAuthor);
            }
            let created_at = models::parse_ts(&header.created_at)?;
            if Utc::now() - created_at >= Duration::hours(EDIT_WINDOW_HOURS) {
                return Ok(EditOutcome::WindowElapsed);
            }

            conn.execute(
                "UPDATE messages SET content = ?1, edited_at = ?2 WHERE id = ?3",
                params![content, models::now_string(), mid],
            )?;
            let message = query_message(conn, &cid, &mid)?
                .ok_or_else(|| StoreError::Corrupt(format!("message vanished mid-edit: {mid}")))?;
            Ok(EditOutcome::Edited(message))
        })
    }

    /// Soft delete: the row keeps its id and ordering slot, content and
    /// attachments and reactions are cleared in one transaction.
    pub fn delete_message(
        &self,
        channel_id: Uuid,
        message_id: Uuid,
        author_id: Uuid,
    ) -> Result<DeleteOutcome> {
        self.with_conn_mut(|conn| {
            let mid = message_id.to_string();
            let Some(header) = query_message_header(conn, &channel_id.to_string(), &mid)? else {
                return Ok(DeleteOutcome::NotFound);
            };
            if header.is_deleted {
                return Ok(DeleteOutcome::NotFound);
            }
            if header.author_id != author_id.to_string() {
                return Ok(DeleteOutcome::NotAuthor);
            }

            let tx = conn.transaction()?;
            tx.execute(
                "UPDATE messages
                 SET is_deleted = 1, content = NULL, referenced_message_id = NULL, edited_at = NULL
                 WHERE id = ?1",
                [&mid],
            )?;
            tx.execute("DELETE FROM message_attachments WHERE message_id = ?1", [&mid])?;
            tx.execute("DELETE FROM reactions WHERE message_id = ?1", [&mid])?;
            tx.commit()?;
            Ok(DeleteOutcome::Deleted)
        })
    }

    /// Toggle a reaction: present removes, absent inserts. Returns the
    /// resulting emoji group; an empty user set means the entry is gone.
    pub fn toggle_reaction(
        &self,
        channel_id: Uuid,
        message_id: Uuid,
        user_id: Uuid,
        emoji: &str,
    ) -> Result<ReactOutcome> {
        self.with_conn_mut(|conn| {
            let mid = message_id.to_string();
            let Some(header) = query_message_header(conn, &channel_id.to_string(), &mid)? else {
                return Ok(ReactOutcome::NotFound);
            };
            if header.is_deleted {
                return Ok(ReactOutcome::NotFound);
            }

            let uid = user_id.to_string();
            let existing = {
                let mut stmt = conn.prepare(
                    "SELECT 1 FROM reactions WHERE message_id = ?1 AND user_id = ?2 AND emoji = ?3",
                )?;
                stmt.query_row(params![mid, uid, emoji], |_| Ok(()))
                    .optional()?
                    .is_some()
            };

            let added = if existing {
                conn.execute(
                    "DELETE FROM reactions WHERE message_id = ?1 AND user_id = ?2 AND emoji = ?3",
                    params![mid, uid, emoji],
                )?;
                false
            } else {
                conn.execute(
                    "INSERT INTO reactions (message_id, user_id, emoji, created_at) VALUES (?1, ?2, ?3, ?4)",
                    params![mid, uid, emoji, models::now_string()],
                )?;
                true
            };

            let reaction = query_reaction_group(conn, &mid, emoji)?;
            Ok(ReactOutcome::Toggled { added, reaction })
        })
    }
}

struct MessageHeader {
    author_id: String,
    created_at: String,
    is_deleted: bool,
}

fn query_message_header(
    conn: &Connection,
    channel_id: &str,
    message_id: &str,
) -> Result<Option<MessageHeader>> {
    let mut stmt = conn.prepare(
        "SELECT author_id, created_at, is_deleted FROM messages WHERE id = ?1 AND channel_id = ?2",
    )?;
    stmt.query_row(params![message_id, channel_id], |row| {
        Ok(MessageHeader {
            author_id: row.get(0)?,
            created_at: row.get(1)?,
            is_deleted: row.get(2)?,
        })
    })
    .optional()
}

pub(crate) fn query_message(
    conn: &Connection,
    channel_id: &str,
    message_id: &str,
) -> Result<Option<Message>> {
    let mut stmt = conn.prepare(
        "SELECT id, channel_id, author_id, content, referenced_message_id, created_at, edited_at, is_deleted
         FROM messages WHERE id = ?1 AND channel_id = ?2",
    )?;
    let row = stmt
        .query_row(params![message_id, channel_id], |row| {
            Ok(MessageRow {
                id: row.get(0)?,
                channel_id: row.get(1)?,
                author_id: row.get(2)?,
                content: row.get(3)?,
                referenced_message_id: row.get(4)?,
                created_at: row.get(5)?,
                edited_at: row.get(6)?,
                is_deleted: row.get(7)?,
            })
        })
        .optional()?;

    let Some(row) = row else { return Ok(None) };
    if row.is_deleted {
        return Ok(Some(row.into_message(Vec::new(), Vec::new())?));
    }
    let attachments = query_attachments(conn, message_id)?;
    let reactions = query_reactions(conn, message_id)?;
    Ok(Some(row.into_message(attachments, reactions)?))
}

fn query_attachments(conn: &Connection, message_id: &str) -> Result<Vec<String>> {
    let mut stmt = conn
        .prepare("SELECT url FROM message_attachments WHERE message_id = ?1 ORDER BY position")?;
    let urls = stmt
        .query_map([message_id], |row| row.get(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(urls)
}

/// All reaction groups of a message, emoji order by first reaction.
fn query_reactions(conn: &Connection, message_id: &str) -> Result<Vec<ReactionGroup>> {
    let mut stmt = conn.prepare(
        "SELECT emoji, user_id FROM reactions WHERE message_id = ?1 ORDER BY created_at, rowid",
    )?;
    let rows = stmt
        .query_map([message_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut groups: Vec<ReactionGroup> = Vec::new();
    for (emoji, user_raw) in rows {
        let user_id = models::parse_id(&user_raw)?;
        match groups.iter_mut().find(|g| g.emoji == emoji) {
            Some(group) => {
                group.user_ids.push(user_id);
                group.count += 1;
            }
            None => groups.push(ReactionGroup {
                emoji,
                count: 1,
                user_ids: vec![user_id],
            }),
        }
    }
    Ok(groups)
}

fn query_reaction_group(conn: &Connection, message_id: &str, emoji: &str) -> Result<ReactionGroup> {
    let mut stmt = conn.prepare(
        "SELECT user_id FROM reactions WHERE message_id = ?1 AND emoji = ?2 ORDER BY created_at, rowid",
    )?;
    let raw = stmt
        .query_map(params![message_id, emoji], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    let user_ids = raw
        .iter()
        .map(|id| models::parse_id(id))
        .collect::<Result<Vec<_>>>()?;
    Ok(ReactionGroup {
        emoji: emoji.to_string(),
        count: user_ids.len(),
        user_ids,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (Database, Uuid, Uuid, Uuid) {
        let db = Database::open_in_memory().unwrap();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let (channel, _) = db.create_direct(alice, bob).unwrap();
        (db, channel.id, alice, bob)
    }

    fn backdate(db: &Database, message_id: Uuid, minutes: i64) {
        let ts = models::format_ts(Utc::now() - Duration::minutes(minutes));
        db.with_conn(|conn| {
            conn.execute(
                "UPDATE messages SET created_at = ?1 WHERE id = ?2",
                params![ts, message_id.to_string()],
            )?;
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn insert_advances_channel_marker() {
        let (db, channel_id, alice, _) = setup();
        let message = db
            .insert_message(channel_id, alice, Some("hello"), &[], None)
            .unwrap();

        let channel = db.get_channel(channel_id).unwrap().unwrap();
        assert_eq!(channel.last_message_id, Some(message.id));
        assert_eq!(channel.last_message_at, Some(message.created_at));
    }

    #[test]
    fn attachments_keep_order() {
        let (db, channel_id, alice, _) = setup();
        let refs = vec!["file/a".to_string(), "file/b".to_string()];
        let message = db
            .insert_message(channel_id, alice, None, &refs, None)
            .unwrap();

        let fetched = db.get_message(channel_id, message.id).unwrap().unwrap();
        match fetched.state {
            MessageState::Active { attachments, .. } => assert_eq!(attachments, refs),
            MessageState::Deleted => panic!("fresh message is deleted"),
        }
    }

    #[test]
    fn edit_rejects_foreign_author() {
        let (db, channel_id, alice, bob) = setup();
        let message = db
            .insert_message(channel_id, alice, Some("hi"), &[], None)
            .unwrap();

        let outcome = db.edit_message(channel_id, message.id, bob, "hacked").unwrap();
        assert!(matches!(outcome, EditOutcome::NotAuthor));
    }

    #[test]
    fn edit_allowed_just_inside_window() {
        let (db, channel_id, alice, _) = setup();
        let message = db
            .insert_message(channel_id, alice, Some("hi"), &[], None)
            .unwrap();
        backdate(&db, message.id, 23 * 60 + 59);

        let outcome = db.edit_message(channel_id, message.id, alice, "still ok").unwrap();
        match outcome {
            EditOutcome::Edited(updated) => match updated.state {
                MessageState::Active { content, edited_at, .. } => {
                    assert_eq!(content.as_deref(), Some("still ok"));
                    assert!(edited_at.is_some());
                }
                MessageState::Deleted => panic!("edited message is deleted"),
            },
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn edit_rejected_past_window() {
        let (db, channel_id, alice, _) = setup();
        let message = db
            .insert_message(channel_id, alice, Some("hi"), &[], None)
            .unwrap();
        backdate(&db, message.id, 25 * 60);

        let outcome = db.edit_message(channel_id, message.id, alice, "too late").unwrap();
        assert!(matches!(outcome, EditOutcome::WindowElapsed));
    }

    #[test]
    fn edit_on_deleted_message_is_not_found() {
        let (db, channel_id, alice, _) = setup();
        let message = db
            .insert_message(channel_id, alice, Some("hi"), &[], None)
            .unwrap();
        db.delete_message(channel_id, message.id, alice).unwrap();

        let outcome = db.edit_message(channel_id, message.id, alice, "zombie").unwrap();
        assert!(matches!(outcome, EditOutcome::NotFound));
    }

    #[test]
    fn delete_clears_content_attachments_reactions() {
        let (db, channel_id, alice, bob) = setup();
        let refs = vec!["file/x".to_string()];
        let message = db
            .insert_message(channel_id, alice, Some("bye"), &refs, None)
            .unwrap();
        db.toggle_reaction(channel_id, message.id, bob, "👍").unwrap();

        assert_eq!(
            db.delete_message(channel_id, message.id, alice).unwrap(),
            DeleteOutcome::Deleted
        );

        let fetched = db.get_message(channel_id, message.id).unwrap().unwrap();
        assert!(matches!(fetched.state, MessageState::Deleted));

        let leftover: i64 = db
            .with_conn(|conn| {
                let count = conn.query_row(
                    "SELECT COUNT(*) FROM reactions WHERE message_id = ?1",
                    [message.id.to_string()],
                    |row| row.get(0),
                )?;
                Ok(count)
            })
            .unwrap();
        assert_eq!(leftover, 0);
    }

    #[test]
    fn second_delete_is_not_found() {
        let (db, channel_id, alice, _) = setup();
        let message = db
            .insert_message(channel_id, alice, Some("bye"), &[], None)
            .unwrap();

        db.delete_message(channel_id, message.id, alice).unwrap();
        assert_eq!(
            db.delete_message(channel_id, message.id, alice).unwrap(),
            DeleteOutcome::NotFound
        );
    }

    #[test]
    fn deleted_row_still_exists() {
        let (db, channel_id, alice, _) = setup();
        let message = db
            .insert_message(channel_id, alice, Some("bye"), &[], None)
            .unwrap();
        db.delete_message(channel_id, message.id, alice).unwrap();

        assert!(db.message_exists(channel_id, message.id).unwrap());
    }

    #[test]
    fn toggle_twice_restores_state() {
        let (db, channel_id, alice, bob) = setup();
        let message = db
            .insert_message(channel_id, alice, Some("hi"), &[], None)
            .unwrap();

        let first = db.toggle_reaction(channel_id, message.id, bob, "🎉").unwrap();
        match first {
            ReactOutcome::Toggled { added, reaction } => {
                assert!(added);
                assert_eq!(reaction.count, 1);
                assert_eq!(reaction.user_ids, vec![bob]);
            }
            ReactOutcome::NotFound => panic!("message exists"),
        }

        let second = db.toggle_reaction(channel_id, message.id, bob, "🎉").unwrap();
        match second {
            ReactOutcome::Toggled { added, reaction } => {
                assert!(!added);
                assert_eq!(reaction.count, 0);
                assert!(reaction.user_ids.is_empty());
            }
            ReactOutcome::NotFound => panic!("message exists"),
        }

        let fetched = db.get_message(channel_id, message.id).unwrap().unwrap();
        match fetched.state {
            MessageState::Active { reactions, .. } => assert!(reactions.is_empty()),
            MessageState::Deleted => panic!("message is active"),
        }
    }

    #[test]
    fn react_on_deleted_message_is_not_found() {
        let (db, channel_id, alice, bob) = setup();
        let message = db
            .insert_message(channel_id, alice, Some("hi"), &[], None)
            .unwrap();
        db.delete_message(channel_id, message.id, alice).unwrap();

        let outcome = db.toggle_reaction(channel_id, message.id, bob, "👀").unwrap();
        assert!(matches!(outcome, ReactOutcome::NotFound));
    }
}
