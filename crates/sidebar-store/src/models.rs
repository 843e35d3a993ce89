//! Database row types and parse helpers. Rows map SQLite TEXT columns
//! one to one; conversion into the shared API models happens here.

use chrono::{DateTime, SecondsFormat, Utc};
use sidebar_types::{ChannelKind, DmChannel, Message, MessageState, ReactionGroup};
use uuid::Uuid;

use crate::{Result, StoreError};

pub struct ChannelRow {
    pub id: String,
    pub kind: String,
    pub owner_id: Option<String>,
    pub last_message_id: Option<String>,
    pub last_message_at: Option<String>,
    pub is_deleted: bool,
    pub created_at: String,
}

impl ChannelRow {
    pub fn into_channel(self, participants: Vec<Uuid>) -> Result<DmChannel> {
        Ok(DmChannel {
            id: parse_id(&self.id)?,
            kind: kind_from_str(&self.kind)?,
            participants,
            owner_id: self.owner_id.as_deref().map(parse_id).transpose()?,
            last_message_id: self.last_message_id.as_deref().map(parse_id).transpose()?,
            last_message_at: self.last_message_at.as_deref().map(parse_ts).transpose()?,
            is_deleted: self.is_deleted,
            created_at: parse_ts(&self.created_at)?,
        })
    }
}

pub struct MessageRow {
    pub id: String,
    pub channel_id: String,
    pub author_id: String,
    pub content: Option<String>,
    pub referenced_message_id: Option<String>,
    pub created_at: String,
    pub edited_at: Option<String>,
    pub is_deleted: bool,
}

impl MessageRow {
    pub fn into_message(
        self,
        attachments: Vec<String>,
        reactions: Vec<ReactionGroup>,
    ) -> Result<Message> {
        let state = if self.is_deleted {
            MessageState::Deleted
        } else {
            MessageState::Active {
                content: self.content,
                attachments,
                reactions,
                referenced_message_id: self
                    .referenced_message_id
                    .as_deref()
                    .map(parse_id)
                    .transpose()?,
                edited_at: self.edited_at.as_deref().map(parse_ts).transpose()?,
            }
        };
        Ok(Message {
            id: parse_id(&self.id)?,
            channel_id: parse_id(&self.channel_id)?,
            author_id: parse_id(&self.author_id)?,
            created_at: parse_ts(&self.created_at)?,
            state,
        })
    }
}

pub(crate) fn now_string() -> String {
    format_ts(Utc::now())
}

/// RFC 3339 UTC with a fixed six-digit microsecond field, so lexicographic
/// order on the stored TEXT equals chronological order.
pub(crate) fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| StoreError::Corrupt(format!("bad timestamp: {raw}")))
}

pub(crate) fn parse_id(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).map_err(|_| StoreError::Corrupt(format!("bad uuid: {raw}")))
}

pub(crate) fn kind_from_str(raw: &str) -> Result<ChannelKind> {
    match raw {
        "direct" => Ok(ChannelKind::Direct),
        "group" => Ok(ChannelKind::Group),
        other => Err(StoreError::Corrupt(format!("bad channel kind: {other}"))),
    }
}
