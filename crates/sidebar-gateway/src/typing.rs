use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

/// A typing indicator not refreshed within this window expires.
pub const TYPING_TTL: Duration = Duration::from_secs(10);

/// Live typing state per `(channel, user)`. Removal from the map is the
/// linearization point for ending a cycle: whichever path removes the
/// entry owns the single `DmTypingStop` broadcast for it.
#[derive(Clone)]
pub struct TypingTracker {
    inner: Arc<TypingInner>,
}

struct TypingInner {
    entries: Mutex<HashMap<(Uuid, Uuid), TypingEntry>>,
    generations: AtomicU64,
}

struct TypingEntry {
    generation: u64,
    started_at: Instant,
    cancel: CancellationToken,
}

/// Handle for the expiry timer of one typing cycle.
pub struct TypingCycle {
    /// True when this call opened a new cycle (the start gets broadcast);
    /// false when it refreshed a running one (no re-broadcast).
    pub fresh: bool,
    pub generation: u64,
    pub cancel: CancellationToken,
}

impl TypingTracker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TypingInner {
                entries: Mutex::new(HashMap::new()),
                generations: AtomicU64::new(0),
            }),
        }
    }

    /// Open or refresh the typing cycle for `(channel, user)`. A refresh
    /// cancels the previous expiry timer; the caller arms a new one from
    /// the returned cycle either way.
    pub async fn begin(&self, channel_id: Uuid, user_id: Uuid) -> TypingCycle {
        let generation = self.inner.generations.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();

        let mut entries = self.inner.entries.lock().await;
        match entries.get_mut(&(channel_id, user_id)) {
            Some(entry) => {
                entry.cancel.cancel();
                entry.generation = generation;
                entry.cancel = cancel.clone();
                TypingCycle {
                    fresh: false,
                    generation,
                    cancel,
                }
            }
            None => {
                entries.insert(
                    (channel_id, user_id),
                    TypingEntry {
                        generation,
                        started_at: Instant::now(),
                        cancel: cancel.clone(),
                    },
                );
                TypingCycle {
                    fresh: true,
                    generation,
                    cancel,
                }
            }
        }
    }

    /// End the cycle if one is running. True means the caller owns the
    /// stop broadcast.
    pub async fn finish(&self, channel_id: Uuid, user_id: Uuid) -> bool {
        let mut entries = self.inner.entries.lock().await;
        match entries.remove(&(channel_id, user_id)) {
            Some(entry) => {
                entry.cancel.cancel();
                debug!(
                    "typing by {user_id} in {channel_id} ended after {:?}",
                    entry.started_at.elapsed()
                );
                true
            }
            None => false,
        }
    }

    /// Expiry path: end the cycle only if it has not been refreshed since
    /// the timer was armed.
    pub async fn finish_if_current(
        &self,
        channel_id: Uuid,
        user_id: Uuid,
        generation: u64,
    ) -> bool {
        let mut entries = self.inner.entries.lock().await;
        let current = entries
            .get(&(channel_id, user_id))
            .is_some_and(|entry| entry.generation == generation);
        if !current {
            return false;
        }
        if let Some(entry) = entries.remove(&(channel_id, user_id)) {
            debug!(
                "typing by {user_id} in {channel_id} expired after {:?}",
                entry.started_at.elapsed()
            );
        }
        true
    }

    pub async fn is_typing(&self, channel_id: Uuid, user_id: Uuid) -> bool {
        self.inner
            .entries
            .lock()
            .await
            .contains_key(&(channel_id, user_id))
    }

    /// Channels where the user has a running typing cycle. Disconnect
    /// cleanup sweeps these; room membership is no guide because a
    /// session can type in a channel whose room it never joined.
    pub async fn channels_of(&self, user_id: Uuid) -> Vec<Uuid> {
        self.inner
            .entries
            .lock()
            .await
            .keys()
            .filter(|(_, user)| *user == user_id)
            .map(|(channel, _)| *channel)
            .collect()
    }
}
