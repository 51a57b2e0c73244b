//! Session identity and handoff.
//!
//! A measurement session is identified by a UUID minted on the desktop
//! side and carried to the mobile side through a query-string handoff
//! channel. The [`SessionManager`] owns the current identity for this
//! process and keeps the channel's canonical key up to date.

pub mod handoff;
pub mod manager;

pub use handoff::{HandoffChannel, QueryStringChannel};
pub use manager::{DeviceRole, SessionHandle, SessionManager, LEGACY_SESSION_PARAM, SESSION_PARAM};
