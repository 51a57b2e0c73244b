//! Session data model.
//!
//! A session correlates one measurement attempt across possibly two devices
//! (desktop shows the session reference, mobile performs the measurement and
//! writes the result back). Wire representation is camelCase JSON with epoch
//! millisecond timestamps, matching the embedding API.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session status state machine
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Lifecycle status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    /// Session created, ready for measurement.
    Active,
    /// Measurement in progress.
    Measuring,
    /// Measurement completed successfully.
    Completed,
    /// Measurement failed.
    Failed,
    /// Session expired. Terminal — an expired session is replaced by a
    /// newly minted one, never revived.
    Expired,
}

impl SessionStatus {
    /// Whether `self → next` is a legal transition.
    ///
    /// `COMPLETED` and `FAILED` are not terminal: a new measurement on the
    /// same session id goes back to `MEASURING`. Any state may expire.
    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        match (self, next) {
            (Expired, _) => false,
            (_, Expired) => true,
            (Active, Measuring) => true,
            (Measuring, Completed) | (Measuring, Failed) => true,
            (Completed, Measuring) | (Failed, Measuring) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Measuring => "MEASURING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Expired => "EXPIRED",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session metadata
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Metadata tracked per session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub session_id: String,
    pub status: SessionStatus,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    #[serde(
        default,
        with = "chrono::serde::ts_milliseconds_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub last_measurement_at: Option<DateTime<Utc>>,
    pub measurement_count: u32,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub expires_at: DateTime<Utc>,
}

impl SessionInfo {
    /// A fresh `ACTIVE` session created at `now`, expiring after `expiry`.
    pub fn new(session_id: impl Into<String>, now: DateTime<Utc>, expiry: Duration) -> Self {
        Self {
            session_id: session_id.into(),
            status: SessionStatus::Active,
            created_at: now,
            last_measurement_at: None,
            measurement_count: 0,
            expires_at: now + expiry,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// Merge a partial update into this record.
    pub fn apply(&mut self, patch: SessionPatch) {
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(created_at) = patch.created_at {
            self.created_at = created_at;
        }
        if let Some(last) = patch.last_measurement_at {
            self.last_measurement_at = Some(last);
        }
        if let Some(count) = patch.measurement_count {
            self.measurement_count = count;
        }
        if let Some(expires_at) = patch.expires_at {
            self.expires_at = expires_at;
        }
    }
}

/// Partial update for [`SessionInfo`]; `None` fields are left untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<SessionStatus>,
    #[serde(
        default,
        with = "chrono::serde::ts_milliseconds_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(
        default,
        with = "chrono::serde::ts_milliseconds_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub last_measurement_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub measurement_count: Option<u32>,
    #[serde(
        default,
        with = "chrono::serde::ts_milliseconds_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub expires_at: Option<DateTime<Utc>>,
}

impl SessionPatch {
    pub fn status(status: SessionStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Measurement result
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The single authoritative result of a session's measurement.
///
/// `vital_signs` is an opaque blob at this layer — stored, retrieved and
/// forwarded whole, never inspected. The store is a latest-value cache:
/// a new result for the same session replaces the previous one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeasurementResult {
    pub session_id: String,
    pub vital_signs: serde_json::Value,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
}
