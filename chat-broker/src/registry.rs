use std::collections::HashMap;

use tokio::sync::{RwLock, RwLockReadGuard};

use crate::{mailbox::Mailbox, message::UserId};

pub(crate) type Mailboxes = HashMap<UserId, Mailbox>;

/// Maps each registered user to their mailbox.
///
/// Registration takes the write lock; routing takes the read lock, so any
/// number of lookups and fan-outs may proceed together and only serialize
/// against membership changes.
#[derive(Debug, Default)]
pub struct Registry {
    mailboxes: RwLock<Mailboxes>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if an earlier mailbox for `id` was replaced.
    pub async fn register(&self, id: UserId, mailbox: Mailbox) -> bool {
        let mut mailboxes = self.mailboxes.write().await;
        mailboxes.insert(id, mailbox).is_some()
    }

    /// Returns `true` if `id` was registered. The mailbox itself is left open.
    pub async fn unregister(&self, id: &str) -> bool {
        let mut mailboxes = self.mailboxes.write().await;
        mailboxes.remove(id).is_some()
    }

    pub async fn lookup(&self, id: &str) -> Option<Mailbox> {
        let mailboxes = self.mailboxes.read().await;
        mailboxes.get(id).cloned()
    }

    pub(crate) async fn read(&self) -> RwLockReadGuard<'_, Mailboxes> {
        self.mailboxes.read().await
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.mailboxes.read().await.contains_key(id)
    }

    /// Registered ids in sorted order.
    pub async fn user_ids(&self) -> Vec<UserId> {
        let mailboxes = self.mailboxes.read().await;
        let mut ids: Vec<UserId> = mailboxes.keys().cloned().collect();
        ids.sort();
        ids
    }
}
