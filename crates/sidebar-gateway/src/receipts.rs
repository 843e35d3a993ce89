use uuid::Uuid;

use sidebar_types::{AckData, DmError, GatewayEvent};

use crate::dispatcher::Dispatcher;
use crate::rooms::RoomKey;
use crate::with_store;

impl Dispatcher {
    /// Advance the caller's read watermark and tell the rest of the room.
    /// The acting session learns the result from its ack, so the
    /// broadcast skips it; the user's other sessions still get the event.
    pub async fn mark_read(
        &self,
        session_id: Uuid,
        user_id: Uuid,
        channel_id: Uuid,
        message_id: Option<Uuid>,
    ) -> Result<AckData, DmError> {
        self.load_channel_for(user_id, channel_id).await?;

        let receipt = with_store(&self.inner.store, move |db| {
            db.mark_read(channel_id, user_id, message_id)
        })
        .await?;

        self.broadcast_room_except(
            &RoomKey::Dm(channel_id),
            session_id,
            GatewayEvent::DmReadUpdate {
                channel_id,
                user_id,
                last_read_at: receipt.last_read_at,
                last_read_message_id: receipt.last_read_message_id,
            },
        )
        .await;

        Ok(AckData::ReadMarked { receipt })
    }
}
