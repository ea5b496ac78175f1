//! Core identifiers, protocol enumerations, and the dynamic session record.
//!
//! Payloads arrive as pre-decoded JSON objects; a session keeps its
//! properties in a string-keyed map with typed accessors layered on top.

use serde::Serialize;
use serde_json::{json, Map, Value};

/// Unique identifier of a tracked entity (broadcaster)
pub type EntityId = i64;

/// Identifier of one state snapshot for an entity
pub type SessionId = i64;

/// Reserved id of the broadcast-only aggregate entity
///
/// The aggregate never carries session state of its own; it only mirrors
/// the events of every concrete entity.
pub const AGGREGATE_ENTITY_ID: EntityId = -500;

/// Payload and session property keys used by the platform protocol
pub mod keys {
    /// Session identifier
    pub const SESSION_ID: &str = "sessionId";
    /// Owning entity identifier
    pub const ENTITY_ID: &str = "entityId";
    /// Liveness state, carried as a numeric [`VideoState`](super::VideoState) code
    pub const VIDEO_STATE: &str = "videoState";
    /// Popularity rank
    pub const RANK: &str = "rank";
    /// Display name of the broadcaster
    pub const NAME: &str = "name";
    /// Producer access level of the payload
    pub const LEVEL: &str = "level";
    /// Bitmask of session option flags
    pub const FLAGS: &str = "flags";

    /// True-private flag derived from `flags`
    pub const TRUE_PRIVATE: &str = "truePrivate";
    /// Guests-muted flag derived from `flags`
    pub const GUESTS_MUTED: &str = "guestsMuted";
    /// Basics-muted flag derived from `flags`
    pub const BASICS_MUTED: &str = "basicsMuted";
    /// Official-software flag derived from `flags`
    pub const OFFICIAL_SOFTWARE: &str = "officialSoftware";

    /// Session fields derived from the `flags` bitmask. Consumed internally
    /// by the best-session selector; never diffed or emitted as events.
    pub(crate) const DERIVED: &[&str] =
        &[TRUE_PRIVATE, GUESTS_MUTED, BASICS_MUTED, OFFICIAL_SOFTWARE];
}

/// Bit assignments of the session `flags` bitmask
pub mod session_flags {
    /// Session is running a true private show
    pub const TRUE_PRIVATE: i64 = 1 << 0;
    /// Guest chat is muted
    pub const GUESTS_MUTED: i64 = 1 << 1;
    /// Basic-member chat is muted
    pub const BASICS_MUTED: i64 = 1 << 2;
    /// Session was opened by the official broadcasting software
    pub const OFFICIAL_SOFTWARE: i64 = 1 << 3;
}

/// Liveness/visibility state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VideoState {
    /// Publicly visible and streaming
    Public,
    /// Streaming but marked away
    Away,
    /// In a private show
    Private,
    /// In a group show
    GroupShow,
    /// Not streaming
    Offline,
}

impl VideoState {
    /// Numeric wire code for this state
    pub fn code(self) -> i64 {
        match self {
            VideoState::Public => 0,
            VideoState::Away => 2,
            VideoState::Private => 12,
            VideoState::GroupShow => 13,
            VideoState::Offline => 127,
        }
    }

    /// Decode a wire code; unknown codes are not mapped
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(VideoState::Public),
            2 => Some(VideoState::Away),
            12 => Some(VideoState::Private),
            13 => Some(VideoState::GroupShow),
            127 => Some(VideoState::Offline),
            _ => None,
        }
    }
}

impl std::fmt::Display for VideoState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VideoState::Public => write!(f, "public"),
            VideoState::Away => write!(f, "away"),
            VideoState::Private => write!(f, "private"),
            VideoState::GroupShow => write!(f, "group"),
            VideoState::Offline => write!(f, "offline"),
        }
    }
}

/// Access level of the account that produced a payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessLevel {
    Guest,
    Member,
    Premium,
    Broadcaster,
    Admin,
}

impl AccessLevel {
    /// Numeric wire code for this level
    pub fn code(self) -> i64 {
        match self {
            AccessLevel::Guest => 0,
            AccessLevel::Member => 1,
            AccessLevel::Premium => 2,
            AccessLevel::Broadcaster => 4,
            AccessLevel::Admin => 5,
        }
    }

    /// Decode a wire code; unknown codes are not mapped
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(AccessLevel::Guest),
            1 => Some(AccessLevel::Member),
            2 => Some(AccessLevel::Premium),
            4 => Some(AccessLevel::Broadcaster),
            5 => Some(AccessLevel::Admin),
            _ => None,
        }
    }
}

/// One state snapshot for an entity
///
/// Beyond the four keys guaranteed by [`Session::with_defaults`], properties
/// arrive dynamically from payloads and are kept verbatim.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Session(Map<String, Value>);

impl Session {
    /// Fresh offline session carrying only the required default keys
    pub fn with_defaults(session_id: SessionId, entity_id: EntityId) -> Self {
        let mut map = Map::new();
        map.insert(keys::SESSION_ID.to_string(), json!(session_id));
        map.insert(keys::ENTITY_ID.to_string(), json!(entity_id));
        map.insert(keys::VIDEO_STATE.to_string(), json!(VideoState::Offline.code()));
        map.insert(keys::RANK.to_string(), json!(0));
        Session(map)
    }

    /// Raw property value for `key`
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Whether `key` is present
    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Property names currently present
    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    /// All properties as the underlying map
    pub fn properties(&self) -> &Map<String, Value> {
        &self.0
    }

    pub(crate) fn insert(&mut self, key: String, value: Value) -> Option<Value> {
        self.0.insert(key, value)
    }

    /// Session id field, 0 when missing or non-numeric
    pub fn session_id(&self) -> SessionId {
        self.get(keys::SESSION_ID).and_then(Value::as_i64).unwrap_or(0)
    }

    /// Owning entity id field, 0 when missing or non-numeric
    pub fn entity_id(&self) -> EntityId {
        self.get(keys::ENTITY_ID).and_then(Value::as_i64).unwrap_or(0)
    }

    /// Popularity rank, 0 when missing or non-numeric
    pub fn rank(&self) -> i64 {
        self.get(keys::RANK).and_then(Value::as_i64).unwrap_or(0)
    }

    /// Liveness state; missing or unknown codes count as offline
    pub fn video_state(&self) -> VideoState {
        self.get(keys::VIDEO_STATE)
            .and_then(Value::as_i64)
            .and_then(VideoState::from_code)
            .unwrap_or(VideoState::Offline)
    }

    /// Whether this session counts as offline
    pub fn is_offline(&self) -> bool {
        self.video_state() == VideoState::Offline
    }

    /// Display name carried by this session, if any
    pub fn display_name(&self) -> Option<&str> {
        self.get(keys::NAME).and_then(Value::as_str)
    }

    fn flag(&self, key: &str) -> bool {
        self.get(key).and_then(Value::as_bool).unwrap_or(false)
    }

    /// Derived true-private flag
    pub fn true_private(&self) -> bool {
        self.flag(keys::TRUE_PRIVATE)
    }

    /// Derived guests-muted flag
    pub fn guests_muted(&self) -> bool {
        self.flag(keys::GUESTS_MUTED)
    }

    /// Derived basics-muted flag
    pub fn basics_muted(&self) -> bool {
        self.flag(keys::BASICS_MUTED)
    }

    /// Derived official-software flag
    pub fn official_software(&self) -> bool {
        self.flag(keys::OFFICIAL_SOFTWARE)
    }

    pub(crate) fn set_video_state(&mut self, state: VideoState) {
        self.insert(keys::VIDEO_STATE.to_string(), json!(state.code()));
    }

    /// Expand a `flags` bitmask into the derived boolean fields
    pub(crate) fn apply_flags(&mut self, flags: i64) {
        self.insert(
            keys::TRUE_PRIVATE.to_string(),
            json!(flags & session_flags::TRUE_PRIVATE != 0),
        );
        self.insert(
            keys::GUESTS_MUTED.to_string(),
            json!(flags & session_flags::GUESTS_MUTED != 0),
        );
        self.insert(
            keys::BASICS_MUTED.to_string(),
            json!(flags & session_flags::BASICS_MUTED != 0),
        );
        self.insert(
            keys::OFFICIAL_SOFTWARE.to_string(),
            json!(flags & session_flags::OFFICIAL_SOFTWARE != 0),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_session_required_keys() {
        let session = Session::with_defaults(42, 7);
        assert_eq!(session.session_id(), 42);
        assert_eq!(session.entity_id(), 7);
        assert_eq!(session.video_state(), VideoState::Offline);
        assert_eq!(session.rank(), 0);
        assert_eq!(session.properties().len(), 4);
    }

    #[test]
    fn test_video_state_codes_round_trip() {
        for state in [
            VideoState::Public,
            VideoState::Away,
            VideoState::Private,
            VideoState::GroupShow,
            VideoState::Offline,
        ] {
            assert_eq!(VideoState::from_code(state.code()), Some(state));
        }
        assert_eq!(VideoState::from_code(999), None);
    }

    #[test]
    fn test_missing_or_unknown_state_counts_as_offline() {
        let mut session = Session::with_defaults(1, 1);
        session.insert(keys::VIDEO_STATE.to_string(), json!("garbled"));
        assert!(session.is_offline());

        session.insert(keys::VIDEO_STATE.to_string(), json!(999));
        assert!(session.is_offline());

        session.insert(keys::VIDEO_STATE.to_string(), json!(VideoState::Public.code()));
        assert!(!session.is_offline());
    }

    #[test]
    fn test_apply_flags_derives_booleans() {
        let mut session = Session::with_defaults(1, 1);
        session.apply_flags(session_flags::TRUE_PRIVATE | session_flags::OFFICIAL_SOFTWARE);
        assert!(session.true_private());
        assert!(session.official_software());
        assert!(!session.guests_muted());
        assert!(!session.basics_muted());

        session.apply_flags(0);
        assert!(!session.true_private());
        assert!(!session.official_software());
    }

    #[test]
    fn test_access_level_codes() {
        assert_eq!(AccessLevel::from_code(4), Some(AccessLevel::Broadcaster));
        assert_eq!(AccessLevel::from_code(3), None);
        assert_eq!(AccessLevel::Broadcaster.code(), 4);
    }
}
