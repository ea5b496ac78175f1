//! Client-side presence and session-state reconciliation for a
//! live-streaming chat platform.
//!
//! Periodic partial-state payloads about remote broadcasters arrive over
//! an already-established connection, pre-decoded into JSON objects. This
//! crate merges them into one consistent view per entity across the
//! multiple sessions an entity may briefly hold, deterministically selects
//! the authoritative session, and raises typed change events to
//! subscribers — on the entity itself and mirrored to a reserved aggregate
//! entity that observes the whole registry. Edge-triggered watchers layer
//! conditional callbacks on top of the same pipeline.
//!
//! Transport, wire decoding, and process bootstrapping live outside this
//! crate; every operation here is synchronous and safe to call directly
//! from a network-receive path.
//!
//! ```
//! use presence_core::{EventKind, Registry, VideoState};
//! use serde_json::json;
//!
//! let registry = Registry::new();
//! let entity = registry.get_or_create(7);
//! entity.subscribe(EventKind::Property("name".to_string()), |view, event| {
//!     println!("entity {}: {:?}", view.id(), event);
//! });
//! entity.merge(&json!({
//!     "sessionId": 1,
//!     "videoState": VideoState::Public.code(),
//!     "name": "Alice",
//! }))?;
//! assert_eq!(entity.display_name().as_deref(), Some("Alice"));
//! # Ok::<(), presence_core::StateError>(())
//! ```

pub mod entity;
pub mod error;
pub mod event;
pub mod registry;
pub mod selector;
pub mod text;
pub mod types;
pub mod watcher;

pub use entity::{Entity, EntityView};
pub use error::StateError;
pub use event::{EntityEvent, EventKind, SubscriptionId};
pub use registry::Registry;
pub use selector::{best_session, best_session_id};
pub use text::{normalize_value, unquote};
pub use types::{
    AccessLevel, EntityId, Session, SessionId, VideoState, AGGREGATE_ENTITY_ID,
};
pub use watcher::{WatcherCallback, WatcherHandle, WatcherPredicate};
