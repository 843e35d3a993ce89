use std::sync::Arc;

use uuid::Uuid;

use sidebar_store::Database;
use sidebar_types::{ChannelKind, DmChannel, DmError};

use crate::with_store;

/// How blocks apply to sends in Group channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GroupBlockPolicy {
    /// A block between the sender and any other participant denies the
    /// send.
    #[default]
    AnyBlockDenies,
    /// Blocks gate Direct traffic only; group sends always pass.
    Permissive,
}

/// Relationship checks for messaging and DM creation. Blocks gate
/// messaging; friendship is consulted only when opening a channel.
#[derive(Clone)]
pub struct PermissionGate {
    store: Arc<Database>,
    group_policy: GroupBlockPolicy,
}

impl PermissionGate {
    pub fn new(store: Arc<Database>, group_policy: GroupBlockPolicy) -> Self {
        Self {
            store,
            group_policy,
        }
    }

    /// Deny iff a block exists in either direction.
    pub async fn can_interact(&self, a: Uuid, b: Uuid) -> Result<bool, DmError> {
        let blocked = with_store(&self.store, move |db| db.blocked_between(a, b)).await?;
        Ok(!blocked)
    }

    /// Friends may always open a DM; strangers may unless a block exists.
    pub async fn can_create_dm(&self, a: Uuid, b: Uuid) -> Result<bool, DmError> {
        let (friends, blocked) = with_store(&self.store, move |db| {
            Ok((db.are_friends(a, b)?, db.blocked_between(a, b)?))
        })
        .await?;
        Ok(friends || !blocked)
    }

    /// Whether `sender` may post into the channel, per its kind and the
    /// group policy.
    pub async fn can_message(&self, sender: Uuid, channel: &DmChannel) -> Result<bool, DmError> {
        if channel.kind == ChannelKind::Group && self.group_policy == GroupBlockPolicy::Permissive {
            return Ok(true);
        }
        let others = channel.other_participants(sender);
        with_store(&self.store, move |db| {
            for other in others {
                if db.blocked_between(sender, other)? {
                    return Ok(false);
                }
            }
            Ok(true)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate(policy: GroupBlockPolicy) -> (PermissionGate, Arc<Database>) {
        let store = Arc::new(Database::open_in_memory().unwrap());
        (PermissionGate::new(store.clone(), policy), store)
    }

    #[tokio::test]
    async fn block_denies_interaction_both_ways() {
        let (gate, store) = gate(GroupBlockPolicy::default());
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        store.add_block(alice, bob).unwrap();

        assert!(!gate.can_interact(alice, bob).await.unwrap());
        assert!(!gate.can_interact(bob, alice).await.unwrap());
    }

    #[tokio::test]
    async fn strangers_without_blocks_may_open_dm() {
        let (gate, _store) = gate(GroupBlockPolicy::default());
        assert!(
            gate.can_create_dm(Uuid::new_v4(), Uuid::new_v4())
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn friendship_outranks_block_for_creation_only() {
        let (gate, store) = gate(GroupBlockPolicy::default());
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        store.add_friendship(alice, bob).unwrap();
        store.add_block(bob, alice).unwrap();

        assert!(gate.can_create_dm(alice, bob).await.unwrap());
        assert!(!gate.can_interact(alice, bob).await.unwrap());
    }

    #[tokio::test]
    async fn group_send_denied_by_any_participant_block() {
        let (gate, store) = gate(GroupBlockPolicy::AnyBlockDenies);
        let owner = Uuid::new_v4();
        let sender = Uuid::new_v4();
        let blocker = Uuid::new_v4();
        let channel = store.create_group(owner, &[sender, blocker]).unwrap();
        store.add_block(blocker, sender).unwrap();

        assert!(!gate.can_message(sender, &channel).await.unwrap());
        assert!(gate.can_message(owner, &channel).await.unwrap());
    }

    #[tokio::test]
    async fn permissive_policy_ignores_group_blocks() {
        let (gate, store) = gate(GroupBlockPolicy::Permissive);
        let owner = Uuid::new_v4();
        let sender = Uuid::new_v4();
        let blocker = Uuid::new_v4();
        let channel = store.create_group(owner, &[sender, blocker]).unwrap();
        store.add_block(blocker, sender).unwrap();

        assert!(gate.can_message(sender, &channel).await.unwrap());
    }
}
