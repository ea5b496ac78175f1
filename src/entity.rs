//! Entity records and the session merge engine.
//!
//! One [`Entity`] aggregates everything known about a broadcaster across
//! her concurrent sessions: the session table, the grow-only tag set, the
//! cached display name, event subscribers, and conditional watchers. All
//! state updates flow through [`Entity::merge`], which diffs the incoming
//! payload against the authoritative session and raises notifications when
//! the update is visible.
//!
//! Lock order: an entity's state mutex is taken first, then that entity's
//! watcher mutex, then the aggregate's watcher mutex. The aggregate's own
//! state mutex is never taken during a concrete-entity operation, and
//! registry shard locks are never taken while an entity lock is held.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::{Map, Value};
use tracing::{debug, trace, warn};

use crate::error::StateError;
use crate::event::{EntityEvent, EventEmitter, EventKind, SubscriptionId};
use crate::registry::RegistryInner;
use crate::selector::{best_session, best_session_id};
use crate::text::normalize_value;
use crate::types::{keys, AccessLevel, EntityId, Session, SessionId, VideoState};
use crate::watcher::{WatcherCallback, WatcherHandle, WatcherPredicate, WatcherTable};

/// Mutable per-entity state guarded by the entity lock
pub(crate) struct EntityState {
    pub(crate) display_name: Option<String>,
    pub(crate) tags: BTreeSet<String>,
    pub(crate) sessions: HashMap<SessionId, Session>,
}

impl EntityState {
    pub(crate) fn new() -> Self {
        EntityState {
            display_name: None,
            tags: BTreeSet::new(),
            sessions: HashMap::new(),
        }
    }
}

/// Read-only view of a locked entity, handed to watcher predicates,
/// watcher callbacks, and event subscribers.
///
/// The view borrows state that stays locked for the duration of the
/// callback; callbacks must not call back into mutating operations on the
/// entity or the registry.
pub struct EntityView<'a> {
    id: EntityId,
    state: &'a EntityState,
}

impl<'a> EntityView<'a> {
    pub(crate) fn new(id: EntityId, state: &'a EntityState) -> Self {
        EntityView { id, state }
    }

    /// Id of the viewed entity
    pub fn id(&self) -> EntityId {
        self.id
    }

    /// Cached display name from the last visible best session
    pub fn display_name(&self) -> Option<&str> {
        self.state.display_name.as_deref()
    }

    /// Current tag set
    pub fn tags(&self) -> &BTreeSet<String> {
        &self.state.tags
    }

    /// Session row for `session_id`, if known
    pub fn session(&self, session_id: SessionId) -> Option<&Session> {
        self.state.sessions.get(&session_id)
    }

    /// Number of known sessions
    pub fn session_count(&self) -> usize {
        self.state.sessions.len()
    }

    /// Id of the authoritative session, recomputed from live session state
    pub fn best_session_id(&self) -> SessionId {
        best_session_id(&self.state.sessions)
    }

    /// Authoritative session row, or a defaulted offline row when no
    /// session qualifies
    pub fn best_session(&self) -> Session {
        best_session(&self.state.sessions, self.id)
    }

    /// Whether the authoritative session is in a true private show
    pub fn in_true_private(&self) -> bool {
        let best = self.best_session();
        best.video_state() == VideoState::Private && best.true_private()
    }
}

impl fmt::Debug for EntityView<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityView")
            .field("id", &self.id)
            .field("display_name", &self.state.display_name)
            .field("tags", &self.state.tags)
            .field("best_session", &self.best_session())
            .finish()
    }
}

/// A tracked broadcaster and everything known about her state
pub struct Entity {
    id: EntityId,
    state: Mutex<EntityState>,
    watchers: Mutex<WatcherTable>,
    emitter: EventEmitter,
    registry: Weak<RegistryInner>,
}

impl Entity {
    pub(crate) fn new(id: EntityId, registry: Weak<RegistryInner>) -> Self {
        Entity {
            id,
            state: Mutex::new(EntityState::new()),
            watchers: Mutex::new(WatcherTable::default()),
            emitter: EventEmitter::default(),
            registry,
        }
    }

    /// Immutable id of this entity
    pub fn id(&self) -> EntityId {
        self.id
    }

    /// Whether this is the reserved broadcast-only aggregate entity
    pub fn is_aggregate(&self) -> bool {
        self.id == crate::types::AGGREGATE_ENTITY_ID
    }

    /// Cached display name from the last visible best session
    pub fn display_name(&self) -> Option<String> {
        self.state.lock().display_name.clone()
    }

    /// Snapshot of the tag set
    pub fn tags(&self) -> BTreeSet<String> {
        self.state.lock().tags.clone()
    }

    /// Id of the authoritative session, recomputed from live session state
    pub fn best_session_id(&self) -> SessionId {
        best_session_id(&self.state.lock().sessions)
    }

    /// Authoritative session row, or a defaulted offline row when no
    /// session qualifies
    pub fn best_session(&self) -> Session {
        best_session(&self.state.lock().sessions, self.id)
    }

    /// Whether the authoritative session is in a true private show
    pub fn in_true_private(&self) -> bool {
        let state = self.state.lock();
        EntityView::new(self.id, &state).in_true_private()
    }

    /// Number of known sessions
    pub fn session_count(&self) -> usize {
        self.state.lock().sessions.len()
    }

    /// Subscribe to one event stream of this entity.
    ///
    /// Handlers run synchronously on the thread that applied the update,
    /// with the source entity's lock held: they may read the passed view
    /// but must not call mutating operations on any entity or the
    /// registry. Subscribing on the aggregate entity delivers the mirrored
    /// events of every concrete entity.
    pub fn subscribe<H>(&self, kind: EventKind, handler: H) -> SubscriptionId
    where
        H: Fn(&EntityView<'_>, &EntityEvent) + Send + Sync + 'static,
    {
        self.emitter.subscribe(kind, Arc::new(handler))
    }

    /// Remove a subscription. Returns false for unknown ids.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.emitter.unsubscribe(id)
    }

    /// Register an edge-triggered watcher and immediately run one
    /// evaluation pass. `on_true` fires when `predicate` transitions to
    /// true, `on_false_after_true` when it drops back to false; neither
    /// fires on a steady state. Watchers registered on the aggregate are
    /// evaluated against every merging entity.
    pub fn when<P, T, F>(&self, predicate: P, on_true: T, on_false_after_true: F) -> WatcherHandle
    where
        P: Fn(&EntityView<'_>) -> bool + Send + Sync + 'static,
        T: Fn(&EntityView<'_>, Option<&Value>) + Send + Sync + 'static,
        F: Fn(&EntityView<'_>, Option<&Value>) + Send + Sync + 'static,
    {
        let state = self.state.lock();
        let handle = self.watchers.lock().insert(
            Arc::new(predicate) as WatcherPredicate,
            Arc::new(on_true) as WatcherCallback,
            Arc::new(on_false_after_true) as WatcherCallback,
        );
        let view = EntityView::new(self.id, &state);
        self.evaluate_watchers(&view, None);
        handle
    }

    /// Remove a watcher registration. Returns false for unknown handles.
    pub fn remove_watcher(&self, handle: WatcherHandle) -> bool {
        self.watchers.lock().remove(handle)
    }

    /// Merge a decoded state payload into this entity's sessions.
    ///
    /// The target session is `payload.sessionId` (0 when absent), created
    /// with defaults on first sight. Top-level object-valued fields are
    /// property groups and are flattened into the session; a `flags`
    /// bitmask inside a group additionally derives the internal boolean
    /// flag fields. When the updated session is authoritative, one
    /// property-change event fires per actually-changed property, the
    /// catch-all update event fires unconditionally, and watchers are
    /// re-evaluated; all of it mirrored to the aggregate entity. Sessions
    /// left offline are purged afterwards, visible or not.
    pub fn merge(&self, payload: &Value) -> Result<(), StateError> {
        if self.is_aggregate() {
            warn!("rejected merge into the aggregate entity");
            return Err(StateError::AggregateMerge(self.id));
        }
        let object = match payload.as_object() {
            Some(object) => object,
            None => {
                warn!("rejected non-object payload for entity {}", self.id);
                return Err(StateError::PayloadNotObject { entity: self.id });
            }
        };
        if let Some(level) = object.get(keys::LEVEL) {
            let matches = level
                .as_i64()
                .and_then(AccessLevel::from_code)
                .map_or(false, |found| found == AccessLevel::Broadcaster);
            if !matches {
                warn!(
                    "rejected payload for entity {}: producer level {} is not the broadcaster level",
                    self.id, level
                );
                return Err(StateError::LevelMismatch {
                    found: level.clone(),
                });
            }
        }

        let mut state = self.state.lock();
        self.merge_locked(&mut state, payload, object);
        Ok(())
    }

    /// Merge `new_tags` into the tag set and notify.
    ///
    /// The tag set only grows (pure union). Exactly one tag-change event is
    /// emitted per call, carrying the previous and current sets, even when
    /// the union added nothing new; then watchers are re-evaluated with the
    /// tag list as the triggering payload.
    pub fn merge_tags<S: AsRef<str>>(&self, new_tags: &[S]) {
        let mut state = self.state.lock();
        let before = state.tags.clone();
        state
            .tags
            .extend(new_tags.iter().map(|tag| tag.as_ref().to_string()));
        let after = state.tags.clone();
        debug!(
            "entity {}: merged {} tag(s), set size {} -> {}",
            self.id,
            new_tags.len(),
            before.len(),
            after.len()
        );

        let payload = Value::Array(
            new_tags
                .iter()
                .map(|tag| Value::String(tag.as_ref().to_string()))
                .collect(),
        );
        let view = EntityView::new(self.id, &state);
        self.emit(&view, &EntityEvent::TagsChanged { before, after });
        self.evaluate_watchers(&view, Some(&payload));
    }

    /// Force this entity offline through the normal merge pipeline.
    ///
    /// Every non-best live session is first marked offline, then a
    /// synthetic offline update for the best session id runs through the
    /// merge engine, so diffing, notification, watchers, and purge all
    /// apply uniformly. On the aggregate entity this instead resets every
    /// concrete entity in the registry.
    pub fn reset(&self) {
        if self.is_aggregate() {
            if let Some(registry) = self.registry.upgrade() {
                for entity in registry.snapshot() {
                    if !entity.is_aggregate() {
                        entity.reset();
                    }
                }
            }
            return;
        }

        debug!("entity {}: reset", self.id);
        let mut state = self.state.lock();
        let best = best_session_id(&state.sessions);
        for (&session_id, session) in state.sessions.iter_mut() {
            if session_id != best && !session.is_offline() {
                session.set_video_state(VideoState::Offline);
            }
        }

        let mut object = Map::new();
        object.insert(keys::SESSION_ID.to_string(), Value::from(best));
        object.insert(keys::ENTITY_ID.to_string(), Value::from(self.id));
        object.insert(
            keys::VIDEO_STATE.to_string(),
            Value::from(VideoState::Offline.code()),
        );
        let payload = Value::Object(object);
        if let Some(object) = payload.as_object() {
            self.merge_locked(&mut state, &payload, object);
        }
    }

    /// Core of `merge`, running under the already-held entity lock so that
    /// `reset` can reuse it atomically.
    fn merge_locked(
        &self,
        state: &mut EntityState,
        payload: &Value,
        object: &Map<String, Value>,
    ) {
        // The diff baseline is the authoritative session before this update.
        let baseline = best_session(&state.sessions, self.id);
        let target_id = object
            .get(keys::SESSION_ID)
            .and_then(Value::as_i64)
            .unwrap_or(0);

        let mut recorded: Vec<(String, Option<Value>, Option<Value>)> = Vec::new();
        let updated_sid;
        {
            let target = state
                .sessions
                .entry(target_id)
                .or_insert_with(|| Session::with_defaults(target_id, self.id));

            for (key, value) in object {
                if let Some(group) = value.as_object() {
                    // Property group: flatten every entry into the session.
                    for (nested_key, nested_value) in group {
                        let incoming = normalize_value(nested_value);
                        recorded.push((
                            nested_key.clone(),
                            non_null(baseline.get(nested_key)),
                            non_null(Some(&incoming)),
                        ));
                        if nested_key == keys::FLAGS {
                            if let Some(bits) = incoming.as_i64() {
                                target.apply_flags(bits);
                            }
                        }
                        target.insert(nested_key.clone(), incoming);
                    }
                } else {
                    let incoming = normalize_value(value);
                    recorded.push((
                        key.clone(),
                        non_null(baseline.get(key)),
                        non_null(Some(&incoming)),
                    ));
                    target.insert(key.clone(), incoming);
                }
            }

            // A session id change implicitly clears every baseline key the
            // new session does not carry. Derived flag fields stay internal.
            if target.session_id() != baseline.session_id() {
                for key in baseline.keys() {
                    if target.contains_key(key) || keys::DERIVED.contains(&key.as_str()) {
                        continue;
                    }
                    recorded.push((key.clone(), non_null(baseline.get(key)), None));
                }
            }

            updated_sid = target.session_id();
        }

        let best_after = best_session_id(&state.sessions);
        let visible = best_after == updated_sid || (best_after == 0 && updated_sid != 0);
        trace!(
            "entity {}: merged session {} (best {} -> {}, visible: {})",
            self.id,
            target_id,
            baseline.session_id(),
            best_after,
            visible
        );

        if visible {
            let best = best_session(&state.sessions, self.id);
            if let Some(name) = best.display_name() {
                if state.display_name.as_deref() != Some(name) {
                    debug!("entity {}: display name is now {:?}", self.id, name);
                    state.display_name = Some(name.to_string());
                }
            }

            let view = EntityView::new(self.id, state);
            for (name, before, after) in &recorded {
                if before != after {
                    self.emit(
                        &view,
                        &EntityEvent::PropertyChanged {
                            name: name.clone(),
                            before: before.clone(),
                            after: after.clone(),
                        },
                    );
                }
            }
            self.emit(
                &view,
                &EntityEvent::Update {
                    payload: payload.clone(),
                },
            );
            self.evaluate_watchers(&view, Some(payload));
        }

        let purged = purge_offline(&mut state.sessions);
        if purged > 0 {
            trace!("entity {}: purged {} offline session(s)", self.id, purged);
        }
    }

    /// Publish to this entity's subscribers and mirror to the aggregate.
    fn emit(&self, view: &EntityView<'_>, event: &EntityEvent) {
        self.emitter.emit(view, event);
        if let Some(aggregate) = self.aggregate() {
            aggregate.emitter.emit(view, event);
        }
    }

    /// Re-evaluate watchers registered on this entity, then those on the
    /// aggregate, against this entity's current state. A no-op on the
    /// aggregate itself, which holds no session state to evaluate.
    fn evaluate_watchers(&self, view: &EntityView<'_>, payload: Option<&Value>) {
        if self.is_aggregate() {
            return;
        }
        self.watchers.lock().evaluate(view, payload);
        if let Some(aggregate) = self.aggregate() {
            aggregate.watchers.lock().evaluate(view, payload);
        }
    }

    /// The aggregate broadcast entity, when this entity is concrete and
    /// its registry is still alive.
    fn aggregate(&self) -> Option<Arc<Entity>> {
        if self.is_aggregate() {
            return None;
        }
        self.registry
            .upgrade()
            .map(|registry| Arc::clone(registry.aggregate()))
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Entity")
            .field("id", &self.id)
            .field("display_name", &state.display_name)
            .field("tags", &state.tags)
            .field("best_session", &best_session(&state.sessions, self.id))
            .finish()
    }
}

/// Drop every session that is offline or has no usable video state.
fn purge_offline(sessions: &mut HashMap<SessionId, Session>) -> usize {
    let before = sessions.len();
    sessions.retain(|_, session| !session.is_offline());
    before - sessions.len()
}

/// Missing keys and JSON nulls are both "no value" for diffing purposes.
fn non_null(value: Option<&Value>) -> Option<Value> {
    value.filter(|inner| !inner.is_null()).cloned()
}
