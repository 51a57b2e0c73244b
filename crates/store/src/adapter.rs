//! The storage contract shared by the local and HTTP adapters.

use async_trait::async_trait;

use qh_domain::error::Result;
use qh_domain::session::{MeasurementResult, SessionInfo, SessionPatch};

/// Abstraction over result/session storage.
///
/// Implementations may keep state in-process or behind a backend API; the
/// orchestrator and the poller only ever see this trait. Operations are not
/// retried here — retry policy belongs to the caller.
#[async_trait]
pub trait StoreAdapter: Send + Sync {
    /// Store the session's result, replacing any previous one, and upsert
    /// the session metadata to `COMPLETED` (bumping the measurement count
    /// and `lastMeasurementAt`). Creates metadata if none exists yet.
    async fn store_results(&self, session_id: &str, results: &MeasurementResult) -> Result<()>;

    /// Latest stored result, or `None` if absent or expired. Expired
    /// entries are deleted as a side effect of the read.
    async fn get_results(&self, session_id: &str) -> Result<Option<MeasurementResult>>;

    /// Session metadata. A session past its expiry is deleted and reported
    /// as a terminal `EXPIRED` snapshot exactly once; afterwards `None` —
    /// callers can distinguish "never existed" from "just expired".
    async fn get_session_info(&self, session_id: &str) -> Result<Option<SessionInfo>>;

    /// Merge fields into existing metadata, creating a default `ACTIVE`
    /// record first if none exists.
    async fn update_session_info(&self, session_id: &str, patch: SessionPatch) -> Result<()>;

    /// All non-expired sessions known to the store.
    async fn list_sessions(&self) -> Result<Vec<SessionInfo>>;
}
