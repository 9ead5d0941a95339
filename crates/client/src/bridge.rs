// Optimistic update bridge.
//
// Mutating call sites invoke these right after the server confirmed their
// mutation, passing the timestamp the server returned. The later push echo of
// the same mutation then carries an equal timestamp and is dropped by the
// ordering gate; a newer change from someone else still wins.

use tracing::debug;

use statesync_common::types::{TableName, Timestamp};

use crate::store::DirtyStateStore;

#[derive(Debug, Clone)]
pub struct OptimisticBridge {
    store: DirtyStateStore,
}

impl OptimisticBridge {
    pub fn new(store: DirtyStateStore) -> Self {
        Self { store }
    }

    /// Returns whether the store accepted the timestamp.
    pub fn set_project_last_updated(&self, ts: &Timestamp) -> bool {
        let accepted = self.store.set_project_last_updated(ts);
        debug!(%ts, accepted, "optimistic project update");
        accepted
    }

    /// Returns whether the store accepted the timestamp.
    pub fn set_entity_last_updated(&self, table: TableName, entity_id: &str, ts: &Timestamp) -> bool {
        let accepted = self.store.set_entity_last_updated(table, entity_id, ts);
        debug!(%table, entity_id, %ts, accepted, "optimistic entity update");
        accepted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_echo_of_optimistic_write_is_a_no_op() {
        let store = DirtyStateStore::new();
        let bridge = OptimisticBridge::new(store.clone());
        let t1 = Timestamp::from("2024-01-01T00:00:00Z");

        assert!(bridge.set_entity_last_updated(TableName::Slides, "abc", &t1));

        let mut rx = store.subscribe();
        rx.borrow_and_update();
        assert!(!store.set_entity_last_updated(TableName::Slides, "abc", &t1));

        assert_eq!(store.current().entity_last_updated(TableName::Slides, "abc"), Some(&t1));
        assert!(!rx.has_changed().unwrap());
    }

    #[test]
    fn newer_push_from_another_actor_wins() {
        let store = DirtyStateStore::new();
        let bridge = OptimisticBridge::new(store.clone());
        let mine = Timestamp::from("2024-01-01T00:00:00Z");
        let theirs = Timestamp::from("2024-01-01T00:00:05Z");

        bridge.set_entity_last_updated(TableName::SlideDecks, "deck", &mine);
        assert!(store.set_entity_last_updated(TableName::SlideDecks, "deck", &theirs));
        assert_eq!(
            store.current().entity_last_updated(TableName::SlideDecks, "deck"),
            Some(&theirs)
        );
    }

    #[test]
    fn stale_optimistic_write_loses_to_push() {
        let store = DirtyStateStore::new();
        let bridge = OptimisticBridge::new(store.clone());

        store.set_project_last_updated(&Timestamp::from("2024-01-02T00:00:00Z"));
        assert!(!bridge.set_project_last_updated(&Timestamp::from("2024-01-01T00:00:00Z")));
        assert_eq!(
            store.current().project_last_updated,
            Some(Timestamp::from("2024-01-02T00:00:00Z"))
        );
    }
}
