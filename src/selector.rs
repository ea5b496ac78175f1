//! Best-session selection.
//!
//! An entity may briefly hold several live sessions, e.g. while the
//! broadcaster reconnects or switches software. Exactly one session is
//! authoritative for display and notification; these helpers pick it.

use std::collections::HashMap;

use crate::types::{EntityId, Session, SessionId};

/// Id of the authoritative session among `sessions`.
///
/// Offline sessions never qualify. Sessions opened by the official
/// broadcasting software outrank all others; within the same class the
/// highest session id wins. Returns 0 when no session qualifies.
pub fn best_session_id(sessions: &HashMap<SessionId, Session>) -> SessionId {
    let mut chosen = 0;
    let mut found_official = false;
    for (&session_id, session) in sessions {
        if session.is_offline() {
            continue;
        }
        let use_this = if session.official_software() {
            if found_official {
                session_id > chosen
            } else {
                found_official = true;
                true
            }
        } else {
            !found_official && session_id > chosen
        };
        if use_this {
            chosen = session_id;
        }
    }
    chosen
}

/// The authoritative session row, or a freshly defaulted offline row when
/// no session qualifies. The fallback row is never inserted into the map.
pub fn best_session(sessions: &HashMap<SessionId, Session>, entity_id: EntityId) -> Session {
    let session_id = best_session_id(sessions);
    sessions
        .get(&session_id)
        .cloned()
        .unwrap_or_else(|| Session::with_defaults(session_id, entity_id))
}
