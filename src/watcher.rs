//! Edge-triggered conditional watchers.
//!
//! A watcher pairs a predicate with two callbacks that fire only on the
//! false→true and true→false transitions, never on a steady state. The
//! matched set records which entities the predicate currently holds for:
//! a single id on a concrete entity, arbitrarily many on the aggregate,
//! whose watchers are evaluated against every merging entity.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::Value;

use crate::entity::EntityView;
use crate::types::EntityId;

/// Opaque handle identifying a registered watcher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatcherHandle(u64);

static NEXT_WATCHER: AtomicU64 = AtomicU64::new(1);

impl WatcherHandle {
    fn next() -> Self {
        WatcherHandle(NEXT_WATCHER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Predicate evaluated against a locked entity view
pub type WatcherPredicate = Arc<dyn Fn(&EntityView<'_>) -> bool + Send + Sync>;

/// Callback invoked on a predicate transition; receives the entity view
/// and the payload that triggered re-evaluation, if any
pub type WatcherCallback = Arc<dyn Fn(&EntityView<'_>, Option<&Value>) + Send + Sync>;

struct WatcherRecord {
    predicate: WatcherPredicate,
    on_true: WatcherCallback,
    on_false_after_true: WatcherCallback,
    /// Entity ids for which the predicate has transitioned true
    matched: HashSet<EntityId>,
}

/// Watcher registrations of one entity
#[derive(Default)]
pub(crate) struct WatcherTable {
    records: HashMap<WatcherHandle, WatcherRecord>,
}

impl WatcherTable {
    pub(crate) fn insert(
        &mut self,
        predicate: WatcherPredicate,
        on_true: WatcherCallback,
        on_false_after_true: WatcherCallback,
    ) -> WatcherHandle {
        let handle = WatcherHandle::next();
        self.records.insert(
            handle,
            WatcherRecord {
                predicate,
                on_true,
                on_false_after_true,
                matched: HashSet::new(),
            },
        );
        handle
    }

    pub(crate) fn remove(&mut self, handle: WatcherHandle) -> bool {
        self.records.remove(&handle).is_some()
    }

    /// Re-evaluate every record against `view`, firing edge callbacks.
    pub(crate) fn evaluate(&mut self, view: &EntityView<'_>, payload: Option<&Value>) {
        for record in self.records.values_mut() {
            let holds = (record.predicate)(view);
            if holds {
                if record.matched.insert(view.id()) {
                    (record.on_true)(view, payload);
                }
            } else if record.matched.remove(&view.id()) {
                (record.on_false_after_true)(view, payload);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityState;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering as AtomicOrdering;

    fn counters() -> (Arc<AtomicUsize>, Arc<AtomicUsize>) {
        (Arc::new(AtomicUsize::new(0)), Arc::new(AtomicUsize::new(0)))
    }

    #[test]
    fn test_callbacks_fire_only_on_transitions() {
        let mut table = WatcherTable::default();
        let (ups, downs) = counters();
        let (ups_clone, downs_clone) = (Arc::clone(&ups), Arc::clone(&downs));

        table.insert(
            Arc::new(|view| view.tags().contains("live")),
            Arc::new(move |_, _| {
                ups_clone.fetch_add(1, AtomicOrdering::SeqCst);
            }),
            Arc::new(move |_, _| {
                downs_clone.fetch_add(1, AtomicOrdering::SeqCst);
            }),
        );

        let mut state = EntityState::new();
        table.evaluate(&EntityView::new(1, &state), None);
        assert_eq!(ups.load(AtomicOrdering::SeqCst), 0);
        assert_eq!(downs.load(AtomicOrdering::SeqCst), 0);

        state.tags.insert("live".to_string());
        table.evaluate(&EntityView::new(1, &state), None);
        table.evaluate(&EntityView::new(1, &state), None);
        assert_eq!(ups.load(AtomicOrdering::SeqCst), 1);

        state.tags.clear();
        table.evaluate(&EntityView::new(1, &state), None);
        table.evaluate(&EntityView::new(1, &state), None);
        assert_eq!(ups.load(AtomicOrdering::SeqCst), 1);
        assert_eq!(downs.load(AtomicOrdering::SeqCst), 1);
    }

    #[test]
    fn test_matched_state_is_tracked_per_entity() {
        let mut table = WatcherTable::default();
        let (ups, downs) = counters();
        let (ups_clone, downs_clone) = (Arc::clone(&ups), Arc::clone(&downs));

        table.insert(
            Arc::new(|view| view.tags().contains("live")),
            Arc::new(move |_, _| {
                ups_clone.fetch_add(1, AtomicOrdering::SeqCst);
            }),
            Arc::new(move |_, _| {
                downs_clone.fetch_add(1, AtomicOrdering::SeqCst);
            }),
        );

        let mut tagged = EntityState::new();
        tagged.tags.insert("live".to_string());
        let untagged = EntityState::new();

        // The same record tracks entity 1 and entity 2 independently.
        table.evaluate(&EntityView::new(1, &tagged), None);
        table.evaluate(&EntityView::new(2, &tagged), None);
        assert_eq!(ups.load(AtomicOrdering::SeqCst), 2);

        table.evaluate(&EntityView::new(1, &untagged), None);
        assert_eq!(downs.load(AtomicOrdering::SeqCst), 1);
        table.evaluate(&EntityView::new(2, &tagged), None);
        assert_eq!(ups.load(AtomicOrdering::SeqCst), 2);
    }

    #[test]
    fn test_removed_watcher_no_longer_fires() {
        let mut table = WatcherTable::default();
        let (ups, _downs) = counters();
        let ups_clone = Arc::clone(&ups);

        let handle = table.insert(
            Arc::new(|_| true),
            Arc::new(move |_, _| {
                ups_clone.fetch_add(1, AtomicOrdering::SeqCst);
            }),
            Arc::new(|_, _| {}),
        );

        let state = EntityState::new();
        table.evaluate(&EntityView::new(1, &state), None);
        assert_eq!(ups.load(AtomicOrdering::SeqCst), 1);

        assert!(table.remove(handle));
        assert!(!table.remove(handle));
        table.evaluate(&EntityView::new(1, &state), None);
        assert_eq!(ups.load(AtomicOrdering::SeqCst), 1);
    }
}
