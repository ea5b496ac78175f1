//! Typed entity events and the subscribe/publish primitive.
//!
//! Event identity is polymorphic: any session property name can be
//! subscribed to, plus two reserved channels — the per-merge catch-all and
//! the tag-change stream. Events raised on a concrete entity are also
//! mirrored to the aggregate entity's subscribers.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;

use crate::entity::EntityView;

/// Identity of an event stream on an entity
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// A single named session property changed
    Property(String),
    /// Catch-all: fires once per visible merge, carrying the raw payload
    Update,
    /// The tag set was merged
    Tags,
}

/// A change notification raised by the merge engine
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum EntityEvent {
    /// `name` changed from `before` to `after` on the authoritative view
    PropertyChanged {
        name: String,
        before: Option<Value>,
        after: Option<Value>,
    },
    /// A visible merge was applied; `payload` is the raw decoded input
    Update { payload: Value },
    /// Tags were merged; carries the set before and after the union
    TagsChanged {
        before: BTreeSet<String>,
        after: BTreeSet<String>,
    },
}

impl EntityEvent {
    /// The subscription channel this event is delivered on
    pub fn kind(&self) -> EventKind {
        match self {
            EntityEvent::PropertyChanged { name, .. } => EventKind::Property(name.clone()),
            EntityEvent::Update { .. } => EventKind::Update,
            EntityEvent::TagsChanged { .. } => EventKind::Tags,
        }
    }
}

/// Handle returned by `subscribe`, used to unsubscribe
pub type SubscriptionId = u64;

pub(crate) type Handler = Arc<dyn Fn(&EntityView<'_>, &EntityEvent) + Send + Sync>;

static NEXT_SUBSCRIPTION: AtomicU64 = AtomicU64::new(1);

/// Per-entity subscriber table.
///
/// Handlers run synchronously on the thread that applied the update, while
/// that entity's lock is held: they may read the passed view but must not
/// call back into mutating operations on the entity or the registry.
#[derive(Default)]
pub(crate) struct EventEmitter {
    subscribers: RwLock<HashMap<EventKind, Vec<(SubscriptionId, Handler)>>>,
}

impl EventEmitter {
    pub(crate) fn subscribe(&self, kind: EventKind, handler: Handler) -> SubscriptionId {
        let id = NEXT_SUBSCRIPTION.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .write()
            .entry(kind)
            .or_default()
            .push((id, handler));
        id
    }

    pub(crate) fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.write();
        let mut removed = false;
        for list in subscribers.values_mut() {
            list.retain(|(subscription, _)| {
                if *subscription == id {
                    removed = true;
                    false
                } else {
                    true
                }
            });
        }
        removed
    }

    /// Deliver `event` to subscribers of its kind. The handler list is
    /// cloned out first so handlers may subscribe or unsubscribe.
    pub(crate) fn emit(&self, view: &EntityView<'_>, event: &EntityEvent) {
        let handlers: Vec<Handler> = {
            let subscribers = self.subscribers.read();
            match subscribers.get(&event.kind()) {
                Some(list) => list.iter().map(|(_, handler)| Arc::clone(handler)).collect(),
                None => return,
            }
        };
        for handler in handlers {
            handler(view, event);
        }
    }
}
