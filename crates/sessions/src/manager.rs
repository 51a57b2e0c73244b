//! Session identity for this process.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use qh_domain::trace::TraceEvent;

use crate::handoff::HandoffChannel;

/// Canonical handoff key. Always written back to the channel, even when
/// the id arrived under the legacy key.
pub const SESSION_PARAM: &str = "sessionId";

/// Older embedders still hand the id over under this key. Read-only: we
/// accept it but never write it.
pub const LEGACY_SESSION_PARAM: &str = "session";

/// Which side of the handoff this process is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceRole {
    /// Mints the session and displays the handoff link.
    Desktop,
    /// Adopts the session carried in the handoff link.
    Mobile,
}

/// The identity currently in effect.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
}

impl SessionHandle {
    fn mint() -> Self {
        Self {
            session_id: Uuid::new_v4().to_string(),
            created_at: Utc::now(),
        }
    }
}

/// Owns the current session identity and keeps the handoff channel's
/// canonical key in sync with it.
pub struct SessionManager {
    role: DeviceRole,
    current: RwLock<SessionHandle>,
}

impl SessionManager {
    /// Establish the session for this process.
    ///
    /// Desktop always mints a fresh id and writes it to the channel for the
    /// handoff link. Mobile adopts the id found under `sessionId` (or the
    /// legacy `session` key), minting one only when the channel carries
    /// neither; in every case the canonical key is written back.
    pub fn bootstrap(role: DeviceRole, channel: &mut dyn HandoffChannel) -> Self {
        let (handle, adopted) = match role {
            DeviceRole::Desktop => (SessionHandle::mint(), false),
            DeviceRole::Mobile => {
                let carried = channel
                    .get(SESSION_PARAM)
                    .or_else(|| channel.get(LEGACY_SESSION_PARAM))
                    .filter(|id| !id.is_empty());
                match carried {
                    Some(session_id) => (
                        SessionHandle {
                            session_id,
                            created_at: Utc::now(),
                        },
                        true,
                    ),
                    None => (SessionHandle::mint(), false),
                }
            }
        };

        channel.set(SESSION_PARAM, &handle.session_id);

        TraceEvent::SessionMinted {
            session_id: handle.session_id.clone(),
            adopted,
        }
        .emit();
        tracing::info!(session_id = %handle.session_id, ?role, adopted, "session established");

        Self {
            role,
            current: RwLock::new(handle),
        }
    }

    pub fn role(&self) -> DeviceRole {
        self.role
    }

    pub fn current(&self) -> SessionHandle {
        self.current.read().clone()
    }

    pub fn session_id(&self) -> String {
        self.current.read().session_id.clone()
    }

    /// Replace the current identity with a freshly minted one and write
    /// it back to the channel. Returns the new handle.
    pub fn refresh(&self, channel: &mut dyn HandoffChannel) -> SessionHandle {
        let fresh = SessionHandle::mint();
        let old_session_id = {
            let mut current = self.current.write();
            std::mem::replace(&mut *current, fresh.clone()).session_id
        };

        channel.set(SESSION_PARAM, &fresh.session_id);

        TraceEvent::SessionRefreshed {
            old_session_id,
            new_session_id: fresh.session_id.clone(),
        }
        .emit();

        fresh
    }
}
