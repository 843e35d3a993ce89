use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Conversation shape: a pair DM or an owned group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Direct,
    Group,
}

/// A DM conversation. Participants are ordered (creator first); a Direct
/// channel always has exactly two, a Group has two or more plus an owner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DmChannel {
    pub id: Uuid,
    pub kind: ChannelKind,
    pub participants: Vec<Uuid>,
    pub owner_id: Option<Uuid>,
    /// Denormalized pointer to the newest message; eventually consistent
    /// with the message rows.
    pub last_message_id: Option<Uuid>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub is_deleted: bool,
    pub created_at: DateTime<Utc>,
}

impl DmChannel {
    pub fn is_participant(&self, user_id: Uuid) -> bool {
        self.participants.contains(&user_id)
    }

    /// Everyone in the channel except `user_id`.
    pub fn other_participants(&self, user_id: Uuid) -> Vec<Uuid> {
        self.participants
            .iter()
            .copied()
            .filter(|p| *p != user_id)
            .collect()
    }
}

/// A message row. Deletion is a state, not a flag: a `Deleted` message
/// carries no content, attachments, or reactions, while the row itself
/// (id, channel, author, created_at) keeps its ordering slot and stays
/// addressable by reply references.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub channel_id: Uuid,
    pub author_id: Uuid,
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub state: MessageState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum MessageState {
    Active {
        /// Absent only when at least one attachment is present.
        content: Option<String>,
        /// Opaque references owned by the upload subsystem.
        attachments: Vec<String>,
        reactions: Vec<ReactionGroup>,
        /// Weak reply reference to a message in the same channel. Survives
        /// deletion of the target; readers resolve a deleted target to a
        /// placeholder.
        referenced_message_id: Option<Uuid>,
        /// Set on first edit, bumped on each subsequent one.
        edited_at: Option<DateTime<Utc>>,
    },
    Deleted,
}

impl Message {
    pub fn is_deleted(&self) -> bool {
        matches!(self.state, MessageState::Deleted)
    }
}

/// One emoji's worth of reactions on a message. `count` always equals
/// `user_ids.len()`; a group whose user set empties is removed outright,
/// so zero-count groups never appear.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReactionGroup {
    pub emoji: String,
    pub count: usize,
    pub user_ids: Vec<Uuid>,
}

/// Per-(channel, user) read watermark. `last_read_at` only ever moves
/// forward; `last_read_message_id` is best-effort and may lag it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadReceipt {
    pub channel_id: Uuid,
    pub user_id: Uuid,
    pub last_read_at: DateTime<Utc>,
    pub last_read_message_id: Option<Uuid>,
}

/// JWT claims supplied by the identity layer. Canonical definition lives
/// here so the gateway and server agree on the shape; `sub` is the stable
/// user id every operation is attributed to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub exp: usize,
}
