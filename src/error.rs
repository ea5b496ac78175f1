//! Error taxonomy for the state core.
//!
//! Only caller misuse is represented here. Missing payload data is never
//! an error: absent sessions, tags, and properties are always defaulted.

use serde_json::Value;
use thiserror::Error;

use crate::types::EntityId;

/// A precondition violation; the offending call leaves state untouched.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StateError {
    /// The aggregate entity is a broadcast sink and never receives merges.
    #[error("entity {0} is the aggregate broadcast sink and cannot be merged into")]
    AggregateMerge(EntityId),

    /// Payloads must be pre-decoded JSON objects.
    #[error("payload for entity {entity} is not an object")]
    PayloadNotObject { entity: EntityId },

    /// The payload declares a producer level other than the broadcaster level.
    #[error("payload producer level {found} is not the broadcaster level")]
    LevelMismatch { found: Value },
}
