use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tracing::debug;
use uuid::Uuid;

use sidebar_store::Database;
use sidebar_types::{AckData, DmError, GatewayCommand, GatewayEvent};

use crate::permissions::{GroupBlockPolicy, PermissionGate};
use crate::rooms::{RemovedSession, RoomKey, RoomRegistry};
use crate::typing::{TYPING_TTL, TypingCycle, TypingTracker};
use crate::with_store;

/// Routes commands from connected sessions, runs the messaging pipeline
/// and fans events out to rooms.
#[derive(Clone)]
pub struct Dispatcher {
    pub(crate) inner: Arc<DispatcherInner>,
}

pub(crate) struct DispatcherInner {
    pub(crate) store: Arc<Database>,
    pub(crate) registry: RoomRegistry,
    pub(crate) typing: TypingTracker,
    pub(crate) gate: PermissionGate,
    /// Per-channel send serialization: the store write and its broadcast
    /// happen under the channel's lock, so delivery order equals commit
    /// order for every observer.
    pub(crate) send_locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl Dispatcher {
    pub fn new(store: Arc<Database>, group_policy: GroupBlockPolicy) -> Self {
        let gate = PermissionGate::new(store.clone(), group_policy);
        Self {
            inner: Arc::new(DispatcherInner {
                store,
                registry: RoomRegistry::new(),
                typing: TypingTracker::new(),
                gate,
                send_locks: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Register a session for a user. The session starts in its `user:`
    /// room; `dm:` rooms are joined via `JoinRooms` or on channel
    /// creation.
    pub async fn register_session(&self, user_id: Uuid) -> (Uuid, mpsc::Receiver<GatewayEvent>) {
        self.inner.registry.register(user_id).await
    }

    /// Tear down a session: leave all rooms, then stop typing wherever
    /// the user has no live session left.
    pub async fn disconnect(&self, session_id: Uuid) {
        if let Some(removed) = self.inner.registry.remove_session(session_id).await {
            self.reap(vec![removed]).await;
        }
    }

    /// Handle one inbound command. The returned value becomes the `Ack`
    /// or `Error` frame for the originating session only.
    pub async fn handle_command(
        &self,
        session_id: Uuid,
        user_id: Uuid,
        cmd: GatewayCommand,
    ) -> Result<AckData, DmError> {
        match cmd {
            GatewayCommand::JoinRooms => self.join_rooms(session_id, user_id).await,
            GatewayCommand::CreateDm {
                recipient_id,
                initial_message,
            } => self.create_dm(user_id, recipient_id, initial_message).await,
            GatewayCommand::SendMessage {
                channel_id,
                content,
                attachments,
                referenced_message_id,
                nonce,
            } => {
                self.send_message(user_id, channel_id, content, attachments, referenced_message_id, nonce)
                    .await
            }
            GatewayCommand::EditMessage {
                channel_id,
                message_id,
                content,
            } => self.edit_message(user_id, channel_id, message_id, content).await,
            GatewayCommand::DeleteMessage {
                channel_id,
                message_id,
            } => self.delete_message(user_id, channel_id, message_id).await,
            GatewayCommand::ReactMessage {
                channel_id,
                message_id,
                emoji,
            } => self.react_message(user_id, channel_id, message_id, emoji).await,
            GatewayCommand::TypingStart { channel_id } => {
                self.typing_start(session_id, user_id, channel_id).await
            }
            GatewayCommand::TypingStop { channel_id } => {
                self.typing_stop(user_id, channel_id).await
            }
            GatewayCommand::MarkRead {
                channel_id,
                message_id,
            } => self.mark_read(session_id, user_id, channel_id, message_id).await,
            GatewayCommand::LeaveRoom { channel_id } => {
                self.leave_room(session_id, user_id, channel_id).await
            }
        }
    }

    /// Subscribe the session to the `dm:` room of every channel its user
    /// participates in.
    pub async fn join_rooms(&self, session_id: Uuid, user_id: Uuid) -> Result<AckData, DmError> {
        let channel_ids =
            with_store(&self.inner.store, move |db| db.channel_ids_for_user(user_id)).await?;
        for id in &channel_ids {
            self.inner.registry.join(session_id, RoomKey::Dm(*id)).await;
        }
        debug!("session {session_id} joined {} dm rooms", channel_ids.len());
        Ok(AckData::RoomsJoined { channel_ids })
    }

    pub async fn leave_room(
        &self,
        session_id: Uuid,
        user_id: Uuid,
        channel_id: Uuid,
    ) -> Result<AckData, DmError> {
        let key = RoomKey::Dm(channel_id);
        self.inner.registry.leave(session_id, &key).await;
        if !self.inner.registry.user_in_room(&key, user_id).await {
            self.stop_typing(channel_id, user_id).await;
        }
        Ok(AckData::RoomLeft { channel_id })
    }

    /// Open or refresh a typing indicator. The caller must pass the same
    /// relationship gate as sending; a blocked user must not surface as
    /// "typing" on the other side.
    pub async fn typing_start(
        &self,
        session_id: Uuid,
        user_id: Uuid,
        channel_id: Uuid,
    ) -> Result<AckData, DmError> {
        let channel = self.load_channel_for(user_id, channel_id).await?;
        if !self.inner.gate.can_message(user_id, &channel).await? {
            return Err(DmError::authorization(
                "messaging is not available in this channel",
            ));
        }

        let cycle = self.inner.typing.begin(channel_id, user_id).await;
        if cycle.fresh {
            self.broadcast_room_except(
                &RoomKey::Dm(channel_id),
                session_id,
                GatewayEvent::DmTypingStart {
                    channel_id,
                    user_id,
                },
            )
            .await;
        }
        self.arm_typing_expiry(channel_id, user_id, &cycle);
        Ok(AckData::Done)
    }

    /// Stopping without an active cycle is a no-op success.
    pub async fn typing_stop(&self, user_id: Uuid, channel_id: Uuid) -> Result<AckData, DmError> {
        self.stop_typing(channel_id, user_id).await;
        Ok(AckData::Done)
    }

    /// Targeted delivery to one session (acks and errors).
    pub async fn deliver(&self, session_id: Uuid, event: GatewayEvent) {
        if let Some(removed) = self.inner.registry.send_to_session(session_id, event).await {
            self.reap(vec![removed]).await;
        }
    }

    /// End the typing cycle and broadcast the stop to the full room. The
    /// broadcast happens only for the caller that actually removed the
    /// entry, so each cycle produces exactly one stop.
    pub(crate) async fn stop_typing(&self, channel_id: Uuid, user_id: Uuid) {
        if self.inner.typing.finish(channel_id, user_id).await {
            self.broadcast_room(
                &RoomKey::Dm(channel_id),
                GatewayEvent::DmTypingStop {
                    channel_id,
                    user_id,
                },
            )
            .await;
        }
    }

    fn arm_typing_expiry(&self, channel_id: Uuid, user_id: Uuid, cycle: &TypingCycle) {
        let dispatcher = self.clone();
        let cancel = cycle.cancel.clone();
        let generation = cycle.generation;
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(TYPING_TTL) => {
                    if dispatcher
                        .inner
                        .typing
                        .finish_if_current(channel_id, user_id, generation)
                        .await
                    {
                        dispatcher
                            .broadcast_room(
                                &RoomKey::Dm(channel_id),
                                GatewayEvent::DmTypingStop { channel_id, user_id },
                            )
                            .await;
                    }
                }
            }
        });
    }

    pub(crate) async fn broadcast_room(&self, key: &RoomKey, event: GatewayEvent) {
        let dropped = self.inner.registry.broadcast(key, event).await;
        if !dropped.is_empty() {
            self.reap(dropped).await;
        }
    }

    pub(crate) async fn broadcast_room_except(
        &self,
        key: &RoomKey,
        except: Uuid,
        event: GatewayEvent,
    ) {
        let dropped = self.inner.registry.broadcast_except(key, except, event).await;
        if !dropped.is_empty() {
            self.reap(dropped).await;
        }
    }

    /// Post-removal cleanup, iterative because stop broadcasts can evict
    /// further stalled sessions. Sweeps the user's active typing channels
    /// rather than the session's room list; typing state can exist for a
    /// channel whose `dm:` room the session never joined.
    pub(crate) async fn reap(&self, removed: Vec<RemovedSession>) {
        let mut queue = removed;
        while let Some(session) = queue.pop() {
            for channel_id in self.inner.typing.channels_of(session.user_id).await {
                let key = RoomKey::Dm(channel_id);
                if self.inner.registry.user_in_room(&key, session.user_id).await {
                    continue;
                }
                if self.inner.typing.finish(channel_id, session.user_id).await {
                    let more = self
                        .inner
                        .registry
                        .broadcast(
                            &key,
                            GatewayEvent::DmTypingStop {
                                channel_id,
                                user_id: session.user_id,
                            },
                        )
                        .await;
                    queue.extend(more);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn harness() -> (Dispatcher, Arc<Database>) {
        let store = Arc::new(Database::open_in_memory().unwrap());
        let dispatcher = Dispatcher::new(store.clone(), GroupBlockPolicy::default());
        (dispatcher, store)
    }

    async fn open_dm(dispatcher: &Dispatcher, a: Uuid, b: Uuid) -> Uuid {
        match dispatcher.create_dm(a, b, None).await.unwrap() {
            AckData::DmCreated { channel, .. } => channel.id,
            other => panic!("unexpected ack: {other:?}"),
        }
    }

    fn drain(rx: &mut mpsc::Receiver<GatewayEvent>) -> Vec<GatewayEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn count_stops(events: &[GatewayEvent]) -> usize {
        events
            .iter()
            .filter(|e| matches!(e, GatewayEvent::DmTypingStop { .. }))
            .count()
    }

    fn count_starts(events: &[GatewayEvent]) -> usize {
        events
            .iter()
            .filter(|e| matches!(e, GatewayEvent::DmTypingStart { .. }))
            .count()
    }

    #[tokio::test]
    async fn join_rooms_covers_all_user_channels() {
        let (dispatcher, _store) = harness();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let carol = Uuid::new_v4();
        let first = open_dm(&dispatcher, alice, bob).await;
        let second = open_dm(&dispatcher, alice, carol).await;

        let (session, _rx) = dispatcher.register_session(alice).await;
        let ack = dispatcher.join_rooms(session, alice).await.unwrap();
        match ack {
            AckData::RoomsJoined { channel_ids } => {
                assert!(channel_ids.contains(&first));
                assert!(channel_ids.contains(&second));
            }
            other => panic!("unexpected ack: {other:?}"),
        }
        assert!(
            dispatcher
                .inner
                .registry
                .user_in_room(&RoomKey::Dm(first), alice)
                .await
        );
    }

    #[tokio::test(start_paused = true)]
    async fn unrefreshed_typing_stops_exactly_once_at_ttl() {
        let (dispatcher, _store) = harness();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let (alice_session, mut alice_rx) = dispatcher.register_session(alice).await;
        let (_bob_session, mut bob_rx) = dispatcher.register_session(bob).await;
        let channel_id = open_dm(&dispatcher, alice, bob).await;
        drain(&mut alice_rx);
        drain(&mut bob_rx);

        dispatcher
            .typing_start(alice_session, alice, channel_id)
            .await
            .unwrap();

        // Just before the boundary nothing has expired.
        tokio::time::sleep(Duration::from_millis(9_900)).await;
        let early = drain(&mut bob_rx);
        assert_eq!(count_starts(&early), 1);
        assert_eq!(count_stops(&early), 0);

        // Crossing the boundary yields the single stop, to the full room.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let at_ttl = drain(&mut bob_rx);
        assert_eq!(count_stops(&at_ttl), 1);
        let own = drain(&mut alice_rx);
        assert_eq!(count_starts(&own), 0);
        assert_eq!(count_stops(&own), 1);

        // And never a second one.
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(count_stops(&drain(&mut bob_rx)), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_defers_expiry_without_rebroadcast() {
        let (dispatcher, _store) = harness();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let (alice_session, mut alice_rx) = dispatcher.register_session(alice).await;
        let (_bob_session, mut bob_rx) = dispatcher.register_session(bob).await;
        let channel_id = open_dm(&dispatcher, alice, bob).await;
        drain(&mut alice_rx);
        drain(&mut bob_rx);

        dispatcher
            .typing_start(alice_session, alice, channel_id)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(6)).await;
        dispatcher
            .typing_start(alice_session, alice, channel_id)
            .await
            .unwrap();

        // The original deadline passes without a stop.
        tokio::time::sleep(Duration::from_secs(5)).await;
        let mid = drain(&mut bob_rx);
        assert_eq!(count_starts(&mid), 1);
        assert_eq!(count_stops(&mid), 0);

        // The refreshed deadline fires exactly once.
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(count_stops(&drain(&mut bob_rx)), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn send_stops_typing_before_the_message() {
        let (dispatcher, _store) = harness();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let (alice_session, mut alice_rx) = dispatcher.register_session(alice).await;
        let (_bob_session, mut bob_rx) = dispatcher.register_session(bob).await;
        let channel_id = open_dm(&dispatcher, alice, bob).await;
        drain(&mut alice_rx);
        drain(&mut bob_rx);

        dispatcher
            .typing_start(alice_session, alice, channel_id)
            .await
            .unwrap();
        dispatcher
            .send_message(alice, channel_id, Some("done typing".into()), vec![], None, None)
            .await
            .unwrap();

        let events = drain(&mut bob_rx);
        let kinds: Vec<&str> = events
            .iter()
            .map(|e| match e {
                GatewayEvent::DmTypingStart { .. } => "start",
                GatewayEvent::DmTypingStop { .. } => "stop",
                GatewayEvent::DmMessage { .. } => "message",
                _ => "other",
            })
            .collect();
        assert_eq!(kinds, vec!["start", "stop", "message"]);

        // The cancelled timer must not fire a second stop.
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(count_stops(&drain(&mut bob_rx)), 0);
    }

    #[tokio::test]
    async fn disconnect_stops_typing_only_for_last_session() {
        let (dispatcher, _store) = harness();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let (first_session, mut first_rx) = dispatcher.register_session(alice).await;
        let (_bob_session, mut bob_rx) = dispatcher.register_session(bob).await;
        let channel_id = open_dm(&dispatcher, alice, bob).await;

        let (second_session, _second_rx) = dispatcher.register_session(alice).await;
        dispatcher.join_rooms(second_session, alice).await.unwrap();

        dispatcher
            .typing_start(first_session, alice, channel_id)
            .await
            .unwrap();
        drain(&mut first_rx);
        drain(&mut bob_rx);

        dispatcher.disconnect(first_session).await;
        assert_eq!(count_stops(&drain(&mut bob_rx)), 0);
        assert!(dispatcher.inner.typing.is_typing(channel_id, alice).await);

        dispatcher.disconnect(second_session).await;
        assert_eq!(count_stops(&drain(&mut bob_rx)), 1);
        assert!(!dispatcher.inner.typing.is_typing(channel_id, alice).await);
    }

    #[tokio::test]
    async fn leave_room_stops_typing_for_last_session() {
        let (dispatcher, _store) = harness();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let (alice_session, mut alice_rx) = dispatcher.register_session(alice).await;
        let (_bob_session, mut bob_rx) = dispatcher.register_session(bob).await;
        let channel_id = open_dm(&dispatcher, alice, bob).await;

        dispatcher
            .typing_start(alice_session, alice, channel_id)
            .await
            .unwrap();
        drain(&mut alice_rx);
        drain(&mut bob_rx);

        let ack = dispatcher
            .leave_room(alice_session, alice, channel_id)
            .await
            .unwrap();
        assert!(matches!(ack, AckData::RoomLeft { channel_id: id } if id == channel_id));
        assert_eq!(count_stops(&drain(&mut bob_rx)), 1);
    }

    #[tokio::test]
    async fn typing_requires_participant() {
        let (dispatcher, _store) = harness();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let outsider = Uuid::new_v4();
        let (outsider_session, _rx) = dispatcher.register_session(outsider).await;
        let channel_id = open_dm(&dispatcher, alice, bob).await;

        let err = dispatcher
            .typing_start(outsider_session, outsider, channel_id)
            .await
            .unwrap_err();
        assert!(matches!(err, DmError::Authorization(_)));
    }

    #[tokio::test]
    async fn typing_under_a_block_is_rejected_without_broadcast() {
        let (dispatcher, store) = harness();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let (alice_session, _alice_rx) = dispatcher.register_session(alice).await;
        let (_bob_session, mut bob_rx) = dispatcher.register_session(bob).await;
        let channel_id = open_dm(&dispatcher, alice, bob).await;
        drain(&mut bob_rx);

        store.add_block(bob, alice).unwrap();

        let err = dispatcher
            .typing_start(alice_session, alice, channel_id)
            .await
            .unwrap_err();
        assert!(matches!(err, DmError::Authorization(_)));
        assert_eq!(count_starts(&drain(&mut bob_rx)), 0);
        assert!(!dispatcher.inner.typing.is_typing(channel_id, alice).await);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_stops_typing_even_without_room_membership() {
        let (dispatcher, _store) = harness();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let (_bob_session, mut bob_rx) = dispatcher.register_session(bob).await;
        let channel_id = open_dm(&dispatcher, alice, bob).await;

        // Alice connects after the channel existed and never joins its room.
        let (alice_session, _alice_rx) = dispatcher.register_session(alice).await;
        dispatcher
            .typing_start(alice_session, alice, channel_id)
            .await
            .unwrap();
        drain(&mut bob_rx);

        dispatcher.disconnect(alice_session).await;
        assert_eq!(count_stops(&drain(&mut bob_rx)), 1);
        assert!(!dispatcher.inner.typing.is_typing(channel_id, alice).await);

        // The expiry timer finds nothing left to stop.
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(count_stops(&drain(&mut bob_rx)), 0);
    }

    #[tokio::test]
    async fn commands_route_through_handle_command() {
        let (dispatcher, _store) = harness();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let (alice_session, _alice_rx) = dispatcher.register_session(alice).await;
        let channel_id = open_dm(&dispatcher, alice, bob).await;

        let ack = dispatcher
            .handle_command(
                alice_session,
                alice,
                GatewayCommand::TypingStart { channel_id },
            )
            .await
            .unwrap();
        assert!(matches!(ack, AckData::Done));

        let ack = dispatcher
            .handle_command(
                alice_session,
                alice,
                GatewayCommand::MarkRead {
                    channel_id,
                    message_id: None,
                },
            )
            .await
            .unwrap();
        assert!(matches!(ack, AckData::ReadMarked { .. }));
    }
}
