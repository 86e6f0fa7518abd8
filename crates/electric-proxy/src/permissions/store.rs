//! Global rules store
//!
//! One store per upstream database, shared by every session. Sessions
//! read a snapshot when a transaction starts and fold their own copy;
//! the store itself only changes after the upstream COMMIT succeeds.
//! The persist lock serializes commit-time read-modify-write across
//! sessions and is held only for the duration of persistence.

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

use super::Rules;

#[derive(Debug)]
pub struct RulesStore {
    current: RwLock<Rules>,
    persist_lock: Arc<Mutex<()>>,
}

impl RulesStore {
    pub fn new(initial: Rules) -> Arc<Self> {
        Arc::new(Self {
            current: RwLock::new(initial),
            persist_lock: Arc::new(Mutex::new(())),
        })
    }

    /// The rules value as of now; cloned, never aliased
    pub fn snapshot(&self) -> Rules {
        self.current.read().clone()
    }

    /// Take the persist lock for a commit-time write-back. The guard
    /// must be dropped as soon as the COMMIT resolves either way.
    pub async fn lock_for_persist(self: &Arc<Self>) -> OwnedMutexGuard<()> {
        self.persist_lock.clone().lock_owned().await
    }

    /// Publish the folded value after the upstream COMMIT succeeded
    pub fn publish(&self, rules: Rules) {
        debug!(
            grants = rules.grants.len(),
            assigns = rules.assigns.len(),
            "published new permission rules"
        );
        *self.current.write() = rules;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permissions::GrantRule;
    use crate::ddlx::Action;

    fn one_grant() -> Rules {
        let mut rules = Rules::default();
        rules.grants.insert(GrantRule {
            table: "public.projects".into(),
            role: "member".into(),
            action: Action::Select,
            columns: None,
            check: None,
        });
        rules
    }

    #[tokio::test]
    async fn test_snapshot_is_independent_of_publish() {
        let store = RulesStore::new(Rules::default());
        let before = store.snapshot();
        store.publish(one_grant());
        assert!(before.is_empty());
        assert_eq!(store.snapshot(), one_grant());
    }

    #[tokio::test]
    async fn test_persist_lock_serializes_writers() {
        let store = RulesStore::new(Rules::default());
        let guard = store.lock_for_persist().await;
        assert!(store.persist_lock.clone().try_lock_owned().is_err());
        drop(guard);
        assert!(store.persist_lock.clone().try_lock_owned().is_ok());
    }
}
