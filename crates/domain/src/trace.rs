use serde::Serialize;

/// Structured trace events emitted across all qhealth crates.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind")]
pub enum TraceEvent {
    RequestDispatched {
        request_id: String,
        method: String,
    },
    ResponseReceived {
        request_id: String,
        success: bool,
    },
    RequestTimedOut {
        request_id: String,
        method: String,
        timeout_ms: u64,
    },
    OriginRejected {
        origin: String,
    },
    EventBroadcast {
        event: String,
        session_id: Option<String>,
    },
    SessionMinted {
        session_id: String,
        adopted: bool,
    },
    SessionRefreshed {
        old_session_id: String,
        new_session_id: String,
    },
    SessionExpired {
        session_id: String,
    },
    ResultsStored {
        session_id: String,
        measurement_count: u32,
    },
    StoreCall {
        endpoint: String,
        status: u16,
        duration_ms: u64,
    },
    PollAttempt {
        session_id: String,
        attempt: u32,
        elapsed_ms: u64,
    },
    PollFinished {
        session_id: String,
        outcome: String,
        attempts: u32,
    },
}

impl TraceEvent {
    pub fn emit(&self) {
        let json = serde_json::to_string(self).unwrap_or_default();
        tracing::info!(trace_event = %json, "qh_event");
    }
}
