//! Shared domain types for the QHealth widget core.
//!
//! Everything the other crates agree on lives here: the common error type,
//! configuration, structured trace events, and the session data model with
//! its status state machine.

pub mod config;
pub mod error;
pub mod session;
pub mod trace;

pub use config::Config;
pub use error::{Error, Result};
pub use session::{MeasurementResult, SessionInfo, SessionPatch, SessionStatus};
pub use trace::TraceEvent;
