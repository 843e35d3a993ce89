//! The message pipeline: create, send, edit, delete and react. Every
//! mutation follows the same shape. Validate, check permissions, take the
//! channel's send lock, write to the store, broadcast to the `dm:` room,
//! return the ack payload.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use sidebar_store::{DeleteOutcome, EditOutcome, ReactOutcome};
use sidebar_types::{AckData, DmChannel, DmError, GatewayEvent};

use crate::dispatcher::Dispatcher;
use crate::rooms::RoomKey;
use crate::with_store;

/// Upper bound on message content, counted in characters.
pub const MAX_CONTENT_CHARS: usize = 4000;

/// Upper bound on a reaction emoji, counted in bytes. Large enough for
/// any multi-codepoint emoji or a custom emoji name.
pub const MAX_EMOJI_BYTES: usize = 64;

fn validate_content(content: Option<&str>, attachments: &[String]) -> Result<(), DmError> {
    let has_text = content.is_some_and(|c| !c.trim().is_empty());
    if !has_text && attachments.is_empty() {
        return Err(DmError::validation("message needs text or an attachment"));
    }
    if let Some(content) = content {
        if content.chars().count() > MAX_CONTENT_CHARS {
            return Err(DmError::validation(format!(
                "content exceeds {MAX_CONTENT_CHARS} characters"
            )));
        }
    }
    Ok(())
}

impl Dispatcher {
    /// Open (or return) the direct channel between two users.
    ///
    /// Creation is idempotent on the user pair, so a retry after a lost
    /// ack converges on the same channel. `DmChannelCreate` goes to both
    /// `user:` rooms only when the channel is actually new; the optional
    /// first message runs through the regular send path afterwards. A
    /// first message that cannot be sent does not undo creation; the ack
    /// then carries `message: None`.
    pub async fn create_dm(
        &self,
        user_id: Uuid,
        recipient_id: Uuid,
        initial_message: Option<String>,
    ) -> Result<AckData, DmError> {
        if recipient_id == user_id {
            return Err(DmError::validation("cannot open a direct channel with yourself"));
        }
        // Validate the first message before touching the store so a bad
        // payload cannot leave a half-created conversation behind.
        let initial_message = initial_message.filter(|c| !c.trim().is_empty());
        if let Some(content) = initial_message.as_deref() {
            validate_content(Some(content), &[])?;
        }
        if !self.inner.gate.can_create_dm(user_id, recipient_id).await? {
            return Err(DmError::authorization(
                "direct messages with this user are unavailable",
            ));
        }

        let (channel, created) = with_store(&self.inner.store, move |db| {
            db.create_direct(user_id, recipient_id)
        })
        .await?;

        // Subscribe every live session of both users, whether the channel
        // is new or was found again.
        let dm_room = RoomKey::Dm(channel.id);
        self.inner.registry.join_user_sessions(user_id, &dm_room).await;
        self.inner.registry.join_user_sessions(recipient_id, &dm_room).await;

        if created {
            info!("direct channel {} opened by {user_id}", channel.id);
            for participant in channel.participants.clone() {
                self.broadcast_room(
                    &RoomKey::User(participant),
                    GatewayEvent::DmChannelCreate {
                        channel: channel.clone(),
                    },
                )
                .await;
            }
        }

        // The channel already exists by now; a failed first send leaves it
        // in place and the ack reports `message: None`.
        let message = match initial_message {
            Some(content) => {
                match self
                    .send_message(user_id, channel.id, Some(content), Vec::new(), None, None)
                    .await
                {
                    Ok(AckData::MessageSent { message, .. }) => Some(message),
                    Ok(_) => None,
                    Err(err) => {
                        warn!("initial message for channel {} not sent: {err}", channel.id);
                        None
                    }
                }
            }
            None => None,
        };

        Ok(AckData::DmCreated {
            channel,
            created,
            message,
        })
    }

    /// Persist and fan out one message. The nonce is echoed in the ack
    /// only, never in the room broadcast.
    pub async fn send_message(
        &self,
        user_id: Uuid,
        channel_id: Uuid,
        content: Option<String>,
        attachments: Vec<String>,
        referenced_message_id: Option<Uuid>,
        nonce: Option<String>,
    ) -> Result<AckData, DmError> {
        let content = content.filter(|c| !c.trim().is_empty());
        validate_content(content.as_deref(), &attachments)?;

        let channel = self.load_channel_for(user_id, channel_id).await?;
        if !self.inner.gate.can_message(user_id, &channel).await? {
            return Err(DmError::authorization(
                "messaging is not available in this channel",
            ));
        }
        if let Some(reference) = referenced_message_id {
            let exists = with_store(&self.inner.store, move |db| {
                db.message_exists(channel_id, reference)
            })
            .await?;
            if !exists {
                return Err(DmError::validation(
                    "referenced message is not in this channel",
                ));
            }
        }

        let lock = self.channel_lock(channel_id).await;
        let _guard = lock.lock().await;

        let message = {
            let content = content.clone();
            let attachments = attachments.clone();
            with_store(&self.inner.store, move |db| {
                db.insert_message(
                    channel_id,
                    user_id,
                    content.as_deref(),
                    &attachments,
                    referenced_message_id,
                )
            })
            .await?
        };

        // A delivered message implies the author stopped typing.
        self.stop_typing(channel_id, user_id).await;
        self.broadcast_room(
            &RoomKey::Dm(channel_id),
            GatewayEvent::DmMessage {
                channel_id,
                message: message.clone(),
            },
        )
        .await;

        Ok(AckData::MessageSent { message, nonce })
    }

    pub async fn edit_message(
        &self,
        user_id: Uuid,
        channel_id: Uuid,
        message_id: Uuid,
        content: String,
    ) -> Result<AckData, DmError> {
        if content.trim().is_empty() {
            return Err(DmError::validation("edited content cannot be empty"));
        }
        if content.chars().count() > MAX_CONTENT_CHARS {
            return Err(DmError::validation(format!(
                "content exceeds {MAX_CONTENT_CHARS} characters"
            )));
        }

        let channel = self.load_channel_for(user_id, channel_id).await?;
        if !self.inner.gate.can_message(user_id, &channel).await? {
            return Err(DmError::authorization(
                "messaging is not available in this channel",
            ));
        }

        let lock = self.channel_lock(channel_id).await;
        let _guard = lock.lock().await;

        let outcome = {
            let content = content.clone();
            with_store(&self.inner.store, move |db| {
                db.edit_message(channel_id, message_id, user_id, &content)
            })
            .await?
        };
        let message = match outcome {
            EditOutcome::Edited(message) => message,
            EditOutcome::NotFound => return Err(DmError::not_found("message does not exist")),
            EditOutcome::NotAuthor => {
                return Err(DmError::authorization("only the author can edit a message"));
            }
            EditOutcome::WindowElapsed => {
                return Err(DmError::authorization(
                    "the edit window for this message has closed",
                ));
            }
        };

        self.broadcast_room(
            &RoomKey::Dm(channel_id),
            GatewayEvent::DmMessageEdit {
                channel_id,
                message: message.clone(),
            },
        )
        .await;

        Ok(AckData::MessageEdited { message })
    }

    /// Soft delete. The broadcast carries ids only; content is already
    /// gone from the store.
    pub async fn delete_message(
        &self,
        user_id: Uuid,
        channel_id: Uuid,
        message_id: Uuid,
    ) -> Result<AckData, DmError> {
        let channel = self.load_channel_for(user_id, channel_id).await?;
        if !self.inner.gate.can_message(user_id, &channel).await? {
            return Err(DmError::authorization(
                "messaging is not available in this channel",
            ));
        }

        let lock = self.channel_lock(channel_id).await;
        let _guard = lock.lock().await;

        let outcome = with_store(&self.inner.store, move |db| {
            db.delete_message(channel_id, message_id, user_id)
        })
        .await?;
        match outcome {
            DeleteOutcome::Deleted => {}
            DeleteOutcome::NotFound => return Err(DmError::not_found("message does not exist")),
            DeleteOutcome::NotAuthor => {
                return Err(DmError::authorization("only the author can delete a message"));
            }
        }

        self.broadcast_room(
            &RoomKey::Dm(channel_id),
            GatewayEvent::DmMessageDelete {
                channel_id,
                message_id,
            },
        )
        .await;

        Ok(AckData::MessageDeleted { message_id })
    }

    /// Toggle the caller's reaction. Membership is required but the
    /// relationship gate is not; reactions stay usable under a block.
    pub async fn react_message(
        &self,
        user_id: Uuid,
        channel_id: Uuid,
        message_id: Uuid,
        emoji: String,
    ) -> Result<AckData, DmError> {
        let emoji = emoji.trim().to_string();
        if emoji.is_empty() {
            return Err(DmError::validation("emoji cannot be empty"));
        }
        if emoji.len() > MAX_EMOJI_BYTES {
            return Err(DmError::validation("emoji is too long"));
        }

        self.load_channel_for(user_id, channel_id).await?;

        let lock = self.channel_lock(channel_id).await;
        let _guard = lock.lock().await;

        let outcome = {
            let emoji = emoji.clone();
            with_store(&self.inner.store, move |db| {
                db.toggle_reaction(channel_id, message_id, user_id, &emoji)
            })
            .await?
        };
        let (added, reaction) = match outcome {
            ReactOutcome::Toggled { added, reaction } => (added, reaction),
            ReactOutcome::NotFound => return Err(DmError::not_found("message does not exist")),
        };

        self.broadcast_room(
            &RoomKey::Dm(channel_id),
            GatewayEvent::DmMessageReaction {
                channel_id,
                message_id,
                reaction: reaction.clone(),
                user_id,
                added,
            },
        )
        .await;

        Ok(AckData::ReactionToggled {
            message_id,
            reaction,
            added,
        })
    }

    /// Load a channel and confirm the caller belongs to it. Deleted and
    /// unknown channels are indistinguishable to the caller.
    pub(crate) async fn load_channel_for(
        &self,
        user_id: Uuid,
        channel_id: Uuid,
    ) -> Result<DmChannel, DmError> {
        let channel = with_store(&self.inner.store, move |db| db.get_channel(channel_id))
            .await?
            .ok_or_else(|| DmError::not_found("channel does not exist"))?;
        if channel.is_deleted {
            return Err(DmError::not_found("channel does not exist"));
        }
        if !channel.is_participant(user_id) {
            return Err(DmError::authorization("not a participant of this channel"));
        }
        Ok(channel)
    }

    async fn channel_lock(&self, channel_id: Uuid) -> Arc<Mutex<()>> {
        let mut locks = self.inner.send_locks.lock().await;
        locks
            .entry(channel_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}
