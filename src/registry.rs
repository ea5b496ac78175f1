//! Thread-safe registry of every known entity.
//!
//! Entities are created exactly once per id and the same `Arc` is returned
//! on every later lookup. The aggregate broadcast entity is created
//! together with the registry and lives in the map under its reserved id,
//! alongside the concrete entities it mirrors.

use std::sync::{Arc, Weak};

use dashmap::DashMap;
use once_cell::sync::Lazy;
use tracing::debug;

use crate::entity::Entity;
use crate::types::{EntityId, AGGREGATE_ENTITY_ID};

pub(crate) struct RegistryInner {
    entities: DashMap<EntityId, Arc<Entity>>,
    aggregate: Arc<Entity>,
}

impl RegistryInner {
    pub(crate) fn aggregate(&self) -> &Arc<Entity> {
        &self.aggregate
    }

    /// `Arc` snapshot of every entity, so callers can release the shard
    /// locks before touching entity locks.
    pub(crate) fn snapshot(&self) -> Vec<Arc<Entity>> {
        self.entities
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }
}

static GLOBAL: Lazy<Registry> = Lazy::new(Registry::new);

/// Registry of all known entities, cheap to clone and share
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

impl Registry {
    /// Fresh registry containing only the aggregate entity
    pub fn new() -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<RegistryInner>| {
            let aggregate = Arc::new(Entity::new(AGGREGATE_ENTITY_ID, weak.clone()));
            let entities = DashMap::new();
            entities.insert(AGGREGATE_ENTITY_ID, Arc::clone(&aggregate));
            RegistryInner {
                entities,
                aggregate,
            }
        });
        Registry { inner }
    }

    /// Process-wide default registry
    pub fn global() -> &'static Registry {
        &GLOBAL
    }

    /// Entity for `id`, created on first access. Repeated calls return the
    /// same instance, creation is exactly-once under concurrent access.
    pub fn get_or_create(&self, id: EntityId) -> Arc<Entity> {
        let entry = self.inner.entities.entry(id).or_insert_with(|| {
            debug!("registry: created entity {}", id);
            Arc::new(Entity::new(id, Arc::downgrade(&self.inner)))
        });
        Arc::clone(entry.value())
    }

    /// Existing entity for `id`; never creates
    pub fn get(&self, id: EntityId) -> Option<Arc<Entity>> {
        self.inner.entities.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    /// The reserved aggregate broadcast entity
    pub fn aggregate(&self) -> Arc<Entity> {
        Arc::clone(&self.inner.aggregate)
    }

    /// Every entity matching `predicate`, the aggregate included.
    ///
    /// The predicate runs while registry shard locks are held: it may read
    /// entity state but must not call back into the registry.
    pub fn find<P>(&self, predicate: P) -> Vec<Arc<Entity>>
    where
        P: Fn(&Arc<Entity>) -> bool,
    {
        self.inner
            .entities
            .iter()
            .filter(|entry| predicate(entry.value()))
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Number of known entities, the aggregate included
    pub fn len(&self) -> usize {
        self.inner.entities.len()
    }

    /// Whether the registry holds no entities (never true in practice,
    /// since the aggregate is created with the registry)
    pub fn is_empty(&self) -> bool {
        self.inner.entities.is_empty()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_get_or_create_returns_same_instance() {
        let registry = Registry::new();
        let first = registry.get_or_create(42);
        let second = registry.get_or_create(42);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.id(), 42);
    }

    #[test]
    fn test_get_never_creates() {
        let registry = Registry::new();
        assert!(registry.get(7).is_none());

        let created = registry.get_or_create(7);
        let fetched = registry.get(7).unwrap();
        assert!(Arc::ptr_eq(&created, &fetched));
    }

    #[test]
    fn test_aggregate_lives_in_the_map() {
        let registry = Registry::new();
        let via_map = registry.get(AGGREGATE_ENTITY_ID).unwrap();
        assert!(Arc::ptr_eq(&via_map, &registry.aggregate()));
        assert!(via_map.is_aggregate());

        let via_create = registry.get_or_create(AGGREGATE_ENTITY_ID);
        assert!(Arc::ptr_eq(&via_create, &registry.aggregate()));
    }

    #[test]
    fn test_find_by_predicate() {
        let registry = Registry::new();
        registry.get_or_create(1).merge_tags(&["dance"]);
        registry.get_or_create(2).merge_tags(&["music"]);
        registry.get_or_create(3);

        let tagged = registry.find(|entity| entity.tags().contains("dance"));
        assert_eq!(tagged.len(), 1);
        assert_eq!(tagged[0].id(), 1);

        let concrete = registry.find(|entity| !entity.is_aggregate());
        assert_eq!(concrete.len(), 3);
        assert_eq!(registry.len(), 4);
    }

    #[test]
    fn test_concurrent_first_access_creates_once() {
        let registry = Registry::new();
        let mut created = Vec::new();
        crossbeam::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let registry = registry.clone();
                    scope.spawn(move |_| registry.get_or_create(99))
                })
                .collect();
            for handle in handles {
                created.push(handle.join().unwrap());
            }
        })
        .unwrap();

        for entity in &created {
            assert!(Arc::ptr_eq(entity, &created[0]));
        }
    }

    #[test]
    #[serial]
    fn test_global_registry_identity() {
        let first = Registry::global().get_or_create(9_000_001);
        let second = Registry::global().get_or_create(9_000_001);
        assert!(Arc::ptr_eq(&first, &second));
        assert!(Registry::global().aggregate().is_aggregate());
    }
}
