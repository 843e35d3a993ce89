use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ErrorKind;
use crate::models::{DmChannel, Message, ReactionGroup, ReadReceipt};

/// Commands sent FROM client TO server over the gateway socket.
///
/// The connection is authenticated before the first command is read, so
/// every command is attributed to the session's user id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayCommand {
    /// Subscribe this session to the `dm:` room of every channel the user
    /// participates in. The `user:` room is joined at connect.
    JoinRooms,

    /// Open (or return the existing) Direct channel with `recipient_id`,
    /// optionally sending a first message through the normal send path.
    CreateDm {
        recipient_id: Uuid,
        initial_message: Option<String>,
    },

    /// Post a message. `nonce` is an opaque client token echoed back in
    /// this call's ack only; it is never stored or broadcast.
    SendMessage {
        channel_id: Uuid,
        content: Option<String>,
        #[serde(default)]
        attachments: Vec<String>,
        referenced_message_id: Option<Uuid>,
        nonce: Option<String>,
    },

    /// Replace the content of an own, still-editable message.
    EditMessage {
        channel_id: Uuid,
        message_id: Uuid,
        content: String,
    },

    /// Soft-delete an own message.
    DeleteMessage { channel_id: Uuid, message_id: Uuid },

    /// Toggle an emoji reaction on a message.
    ReactMessage {
        channel_id: Uuid,
        message_id: Uuid,
        emoji: String,
    },

    /// Indicate typing in a channel; repeat within the expiry window to
    /// keep the indicator alive.
    TypingStart { channel_id: Uuid },

    /// Explicitly end a typing indicator.
    TypingStop { channel_id: Uuid },

    /// Advance this user's read watermark for a channel.
    MarkRead {
        channel_id: Uuid,
        message_id: Option<Uuid>,
    },

    /// Unsubscribe this session from a channel's `dm:` room.
    LeaveRoom { channel_id: Uuid },
}

/// Events sent FROM server TO clients over the gateway socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayEvent {
    /// Server confirms the authenticated identity after upgrade.
    Ready { user_id: Uuid },

    /// A new channel including the recipient was created. Delivered to
    /// the `user:` rooms of all participants, so it arrives even before
    /// the recipient has joined the channel room.
    DmChannelCreate { channel: DmChannel },

    /// A message was posted.
    DmMessage { channel_id: Uuid, message: Message },

    /// A message was edited; carries the full updated message.
    DmMessageEdit { channel_id: Uuid, message: Message },

    /// A message was deleted. Ids only; the cleared fields are never
    /// re-broadcast.
    DmMessageDelete { channel_id: Uuid, message_id: Uuid },

    /// A reaction was toggled. `reaction` is the resulting group (empty
    /// user set means the emoji entry is gone); `added` tells clients
    /// which direction the toggle went.
    DmMessageReaction {
        channel_id: Uuid,
        message_id: Uuid,
        reaction: ReactionGroup,
        user_id: Uuid,
        added: bool,
    },

    /// A user started typing.
    DmTypingStart { channel_id: Uuid, user_id: Uuid },

    /// A user stopped typing. Emitted exactly once per typing cycle, for
    /// whichever of explicit stop, expiry, message send or disconnect
    /// comes first.
    DmTypingStop { channel_id: Uuid, user_id: Uuid },

    /// A participant advanced their read watermark.
    DmReadUpdate {
        channel_id: Uuid,
        user_id: Uuid,
        last_read_at: DateTime<Utc>,
        last_read_message_id: Option<Uuid>,
    },

    /// Per-call success acknowledgment, delivered to the originating
    /// session only.
    Ack(AckData),

    /// Per-call failure, delivered to the originating session only. No
    /// state was changed and nothing was broadcast.
    Error { kind: ErrorKind, message: String },
}

/// Operation-specific payload of a success ack.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum AckData {
    RoomsJoined {
        channel_ids: Vec<Uuid>,
    },
    DmCreated {
        channel: DmChannel,
        /// False when an existing channel was returned (idempotent
        /// re-request).
        created: bool,
        message: Option<Message>,
    },
    MessageSent {
        message: Message,
        nonce: Option<String>,
    },
    MessageEdited {
        message: Message,
    },
    MessageDeleted {
        message_id: Uuid,
    },
    ReactionToggled {
        message_id: Uuid,
        reaction: ReactionGroup,
        added: bool,
    },
    ReadMarked {
        receipt: ReadReceipt,
    },
    RoomLeft {
        channel_id: Uuid,
    },
    /// Commands with nothing to report (typing start/stop).
    Done,
}
