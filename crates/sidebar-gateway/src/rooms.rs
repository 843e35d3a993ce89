use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};
use uuid::Uuid;

use sidebar_types::GatewayEvent;

/// Bounded outbound queue per session. A session that cannot drain this
/// many events is dropped rather than allowed to stall broadcasts.
pub const SESSION_QUEUE_CAPACITY: usize = 256;

/// Namespaced room identity. `Dm` rooms carry channel traffic, `User`
/// rooms reach every live session of one user.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RoomKey {
    Dm(Uuid),
    User(Uuid),
}

impl fmt::Display for RoomKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoomKey::Dm(id) => write!(f, "dm:{id}"),
            RoomKey::User(id) => write!(f, "user:{id}"),
        }
    }
}

/// A session taken out of the registry. Carries the user and the rooms it
/// occupied for post-removal cleanup.
#[derive(Debug)]
pub struct RemovedSession {
    pub session_id: Uuid,
    pub user_id: Uuid,
    pub rooms: Vec<RoomKey>,
}

/// Tracks live sessions and their room memberships.
#[derive(Clone)]
pub struct RoomRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    capacity: usize,
    state: tokio::sync::RwLock<RegistryState>,
}

/// Sessions and rooms index each other; both live under one lock so they
/// can never disagree.
struct RegistryState {
    sessions: HashMap<Uuid, SessionEntry>,
    rooms: HashMap<RoomKey, HashSet<Uuid>>,
}

struct SessionEntry {
    user_id: Uuid,
    tx: mpsc::Sender<GatewayEvent>,
    rooms: HashSet<RoomKey>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::with_capacity(SESSION_QUEUE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                capacity,
                state: tokio::sync::RwLock::new(RegistryState {
                    sessions: HashMap::new(),
                    rooms: HashMap::new(),
                }),
            }),
        }
    }

    /// Register a session for a user. The session starts in its `user:`
    /// room. Returns the session id and the outbound event queue.
    pub async fn register(&self, user_id: Uuid) -> (Uuid, mpsc::Receiver<GatewayEvent>) {
        let session_id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(self.inner.capacity);
        let user_room = RoomKey::User(user_id);

        let mut state = self.inner.state.write().await;
        state.sessions.insert(
            session_id,
            SessionEntry {
                user_id,
                tx,
                rooms: HashSet::from([user_room.clone()]),
            },
        );
        state.rooms.entry(user_room).or_default().insert(session_id);
        debug!("session {session_id} registered for user {user_id}");
        (session_id, rx)
    }

    /// Idempotent. Joining an unknown session is a no-op.
    pub async fn join(&self, session_id: Uuid, key: RoomKey) {
        let mut state = self.inner.state.write().await;
        let RegistryState { sessions, rooms } = &mut *state;
        let Some(session) = sessions.get_mut(&session_id) else {
            return;
        };
        if session.rooms.insert(key.clone()) {
            rooms.entry(key).or_default().insert(session_id);
        }
    }

    /// Idempotent.
    pub async fn leave(&self, session_id: Uuid, key: &RoomKey) {
        let mut state = self.inner.state.write().await;
        let RegistryState { sessions, rooms } = &mut *state;
        if let Some(session) = sessions.get_mut(&session_id) {
            session.rooms.remove(key);
        }
        if let Some(members) = rooms.get_mut(key) {
            members.remove(&session_id);
            if members.is_empty() {
                rooms.remove(key);
            }
        }
    }

    /// Join every live session of a user to a room.
    pub async fn join_user_sessions(&self, user_id: Uuid, key: &RoomKey) {
        let mut state = self.inner.state.write().await;
        let RegistryState { sessions, rooms } = &mut *state;
        for (session_id, session) in sessions.iter_mut() {
            if session.user_id != user_id {
                continue;
            }
            if session.rooms.insert(key.clone()) {
                rooms.entry(key.clone()).or_default().insert(*session_id);
            }
        }
    }

    pub async fn remove_session(&self, session_id: Uuid) -> Option<RemovedSession> {
        let mut state = self.inner.state.write().await;
        remove_session_locked(&mut state, session_id)
    }

    /// Best-effort fan-out to every session in the room. A session whose
    /// queue is full or closed is removed from the registry entirely; its
    /// receiver ends, which terminates its connection task. Never blocks.
    pub async fn broadcast(&self, key: &RoomKey, event: GatewayEvent) -> Vec<RemovedSession> {
        self.broadcast_filtered(key, None, event).await
    }

    /// Same as [`broadcast`](Self::broadcast) but skips one session.
    pub async fn broadcast_except(
        &self,
        key: &RoomKey,
        except: Uuid,
        event: GatewayEvent,
    ) -> Vec<RemovedSession> {
        self.broadcast_filtered(key, Some(except), event).await
    }

    async fn broadcast_filtered(
        &self,
        key: &RoomKey,
        except: Option<Uuid>,
        event: GatewayEvent,
    ) -> Vec<RemovedSession> {
        let mut stale = Vec::new();
        {
            let state = self.inner.state.read().await;
            let Some(members) = state.rooms.get(key) else {
                return Vec::new();
            };
            for session_id in members {
                if Some(*session_id) == except {
                    continue;
                }
                let Some(session) = state.sessions.get(session_id) else {
                    continue;
                };
                match session.tx.try_send(event.clone()) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        warn!("session {session_id} queue full in {key}, dropping session");
                        stale.push(*session_id);
                    }
                    Err(TrySendError::Closed(_)) => {
                        debug!("session {session_id} queue closed in {key}, dropping session");
                        stale.push(*session_id);
                    }
                }
            }
        }

        if stale.is_empty() {
            return Vec::new();
        }
        let mut state = self.inner.state.write().await;
        stale
            .into_iter()
            .filter_map(|sid| remove_session_locked(&mut state, sid))
            .collect()
    }

    /// Targeted delivery to one session. Returns the removed session when
    /// its queue was full or closed.
    pub async fn send_to_session(
        &self,
        session_id: Uuid,
        event: GatewayEvent,
    ) -> Option<RemovedSession> {
        {
            let state = self.inner.state.read().await;
            match state.sessions.get(&session_id) {
                None => return None,
                Some(session) => match session.tx.try_send(event) {
                    Ok(()) => return None,
                    Err(TrySendError::Full(_)) => {
                        warn!("session {session_id} queue full, dropping session");
                    }
                    Err(TrySendError::Closed(_)) => {
                        debug!("session {session_id} queue closed, dropping session");
                    }
                },
            }
        }
        let mut state = self.inner.state.write().await;
        remove_session_locked(&mut state, session_id)
    }

    pub async fn members_of(&self, key: &RoomKey) -> Vec<Uuid> {
        let state = self.inner.state.read().await;
        state
            .rooms
            .get(key)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Whether any live session of the user is in the room.
    pub async fn user_in_room(&self, key: &RoomKey, user_id: Uuid) -> bool {
        let state = self.inner.state.read().await;
        let Some(members) = state.rooms.get(key) else {
            return false;
        };
        members
            .iter()
            .any(|sid| state.sessions.get(sid).is_some_and(|s| s.user_id == user_id))
    }
}

fn remove_session_locked(state: &mut RegistryState, session_id: Uuid) -> Option<RemovedSession> {
    let session = state.sessions.remove(&session_id)?;
    for key in &session.rooms {
        if let Some(members) = state.rooms.get_mut(key) {
            members.remove(&session_id);
            if members.is_empty() {
                state.rooms.remove(key);
            }
        }
    }
    debug!("session {session_id} removed from registry");
    Some(RemovedSession {
        session_id,
        user_id: session.user_id,
        rooms: session.rooms.into_iter().collect(),
    })
}
