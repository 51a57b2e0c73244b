//! Wire protocol for the embedding API: envelope types, the closed method
//! and event catalogues, structured API errors, and boundary validation.
//!
//! Three envelope kinds travel over the host's cross-context transport,
//! discriminated by an explicit `type` field: requests, responses, and
//! fire-and-forget events. Envelopes are decoded and validated at the
//! boundary before their contents are treated as trusted data.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Method & event catalogues
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The closed set of RPC methods. Anything else is rejected with
/// `INVALID_REQUEST` before reaching a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApiMethod {
    GetLatestResults,
    GetResultsBySessionId,
    GetSessionInfo,
    GetSessionStatus,
    ListSessions,
    Ping,
}

impl ApiMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::GetLatestResults => "GET_LATEST_RESULTS",
            Self::GetResultsBySessionId => "GET_RESULTS_BY_SESSION_ID",
            Self::GetSessionInfo => "GET_SESSION_INFO",
            Self::GetSessionStatus => "GET_SESSION_STATUS",
            Self::ListSessions => "LIST_SESSIONS",
            Self::Ping => "PING",
        }
    }
}

impl std::str::FromStr for ApiMethod {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "GET_LATEST_RESULTS" => Ok(Self::GetLatestResults),
            "GET_RESULTS_BY_SESSION_ID" => Ok(Self::GetResultsBySessionId),
            "GET_SESSION_INFO" => Ok(Self::GetSessionInfo),
            "GET_SESSION_STATUS" => Ok(Self::GetSessionStatus),
            "LIST_SESSIONS" => Ok(Self::ListSessions),
            "PING" => Ok(Self::Ping),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for ApiMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events broadcast to embedding clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApiEventType {
    MeasurementStarted,
    MeasurementComplete,
    MeasurementFailed,
    SessionCreated,
    SessionExpired,
    Error,
}

impl ApiEventType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MeasurementStarted => "MEASUREMENT_STARTED",
            Self::MeasurementComplete => "MEASUREMENT_COMPLETE",
            Self::MeasurementFailed => "MEASUREMENT_FAILED",
            Self::SessionCreated => "SESSION_CREATED",
            Self::SessionExpired => "SESSION_EXPIRED",
            Self::Error => "ERROR",
        }
    }
}

impl std::fmt::Display for ApiEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// API errors
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApiErrorCode {
    InvalidRequest,
    SessionNotFound,
    SessionExpired,
    MeasurementNotComplete,
    MeasurementInProgress,
    MeasurementFailed,
    InternalError,
    Timeout,
}

/// Structured error carried inside response envelopes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiError {
    pub code: ApiErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
}

impl ApiError {
    pub fn new(code: ApiErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ApiErrorCode::InvalidRequest, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ApiErrorCode::InternalError, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ApiErrorCode::Timeout, message)
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

impl std::error::Error for ApiError {}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Envelopes
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A message on the cross-context transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Envelope {
    #[serde(rename = "QHEALTH_REQUEST")]
    Request(RequestEnvelope),
    #[serde(rename = "QHEALTH_RESPONSE")]
    Response(ResponseEnvelope),
    #[serde(rename = "QHEALTH_EVENT")]
    Event(EventEnvelope),
}

impl Envelope {
    /// Serialized size in bytes, for the request-size guard.
    pub fn encoded_size(&self) -> Result<usize, serde_json::Error> {
        serde_json::to_vec(self).map(|v| v.len())
    }
}

/// `QHEALTH_REQUEST` — one RPC call.
///
/// `method` travels as a string; the closed [`ApiMethod`] catalogue is
/// enforced during validation, not during decoding, so a malformed method
/// still yields a correlatable `requestId`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestEnvelope {
    pub request_id: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    pub version: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
}

impl RequestEnvelope {
    /// Build a request with a freshly minted correlation id.
    pub fn new(method: ApiMethod, params: Option<Value>, version: &str) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            method: method.as_str().to_owned(),
            params,
            version: version.to_owned(),
            timestamp: Utc::now(),
        }
    }
}

/// `QHEALTH_RESPONSE` — the answer to exactly one request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseEnvelope {
    pub request_id: String,
    pub method: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiError>,
    pub version: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
}

impl ResponseEnvelope {
    pub fn ok(request: &RequestEnvelope, data: Value, version: &str) -> Self {
        Self {
            request_id: request.request_id.clone(),
            method: request.method.clone(),
            success: true,
            data: Some(data),
            error: None,
            version: version.to_owned(),
            timestamp: Utc::now(),
        }
    }

    pub fn err(request: &RequestEnvelope, error: ApiError, version: &str) -> Self {
        Self {
            request_id: request.request_id.clone(),
            method: request.method.clone(),
            success: false,
            data: None,
            error: Some(error),
            version: version.to_owned(),
            timestamp: Utc::now(),
        }
    }
}

/// `QHEALTH_EVENT` — fire-and-forget notification, no acknowledgment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    pub event: ApiEventType,
    pub payload: Value,
    pub version: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl EventEnvelope {
    pub fn new(
        event: ApiEventType,
        payload: Value,
        version: &str,
        session_id: Option<String>,
    ) -> Self {
        Self {
            event,
            payload,
            version: version.to_owned(),
            timestamp: Utc::now(),
            session_id,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Boundary validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Validate an inbound request against the protocol contract.
///
/// Checks, in order: version match, recognized method, size budget.
/// Origin validation happens earlier, at the transport layer — a request
/// only reaches this function if its sender is allowed to talk to us.
pub fn validate_request(
    request: &RequestEnvelope,
    expected_version: &str,
    max_bytes: usize,
) -> Result<ApiMethod, ApiError> {
    if request.version != expected_version {
        return Err(ApiError::invalid_request(format!(
            "version mismatch: expected {expected_version}, got {}",
            request.version
        )));
    }

    let method: ApiMethod = request
        .method
        .parse()
        .map_err(|()| ApiError::invalid_request(format!("unknown method: {}", request.method)))?;

    let size = serde_json::to_vec(request).map(|v| v.len()).unwrap_or(0);
    if size > max_bytes {
        return Err(ApiError::invalid_request(format!(
            "request too large: {size} bytes"
        )));
    }

    Ok(method)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const VERSION: &str = "1.0.0";
    const MAX_BYTES: usize = 1024 * 1024;

    #[test]
    fn request_envelope_wire_format() {
        let req = RequestEnvelope::new(ApiMethod::Ping, Some(json!({})), VERSION);
        let json = serde_json::to_value(Envelope::Request(req.clone())).unwrap();

        assert_eq!(json["type"], "QHEALTH_REQUEST");
        assert_eq!(json["method"], "PING");
        assert_eq!(json["version"], "1.0.0");
        assert_eq!(json["requestId"], req.request_id);
        assert!(json["timestamp"].is_i64());
    }

    #[test]
    fn envelope_round_trips_through_tag() {
        let req = RequestEnvelope::new(ApiMethod::GetSessionStatus, None, VERSION);
        let raw = serde_json::to_string(&Envelope::Request(req.clone())).unwrap();
        match serde_json::from_str::<Envelope>(&raw).unwrap() {
            Envelope::Request(back) => {
                assert_eq!(back.request_id, req.request_id);
                assert_eq!(back.method, "GET_SESSION_STATUS");
            }
            other => panic!("expected Request, got {other:?}"),
        }
    }

    #[test]
    fn response_carries_error_body() {
        let req = RequestEnvelope::new(ApiMethod::GetLatestResults, None, VERSION);
        let resp = ResponseEnvelope::err(
            &req,
            ApiError::new(ApiErrorCode::MeasurementNotComplete, "not yet"),
            VERSION,
        );
        let json = serde_json::to_value(Envelope::Response(resp)).unwrap();

        assert_eq!(json["type"], "QHEALTH_RESPONSE");
        assert_eq!(json["success"], false);
        assert_eq!(json["requestId"], req.request_id);
        assert_eq!(json["error"]["code"], "MEASUREMENT_NOT_COMPLETE");
        assert!(json.get("data").is_none());
    }

    #[test]
    fn event_envelope_wire_format() {
        let env = EventEnvelope::new(
            ApiEventType::MeasurementComplete,
            json!({"heartRate": 72}),
            VERSION,
            Some("sid-1".into()),
        );
        let json = serde_json::to_value(Envelope::Event(env)).unwrap();

        assert_eq!(json["type"], "QHEALTH_EVENT");
        assert_eq!(json["event"], "MEASUREMENT_COMPLETE");
        assert_eq!(json["sessionId"], "sid-1");
        assert_eq!(json["payload"]["heartRate"], 72);
    }

    #[test]
    fn unknown_envelope_type_fails_to_decode() {
        let raw = r#"{"type":"SOMETHING_ELSE","requestId":"r1"}"#;
        assert!(serde_json::from_str::<Envelope>(raw).is_err());
    }

    #[test]
    fn validate_accepts_every_catalogue_method() {
        for method in [
            ApiMethod::GetLatestResults,
            ApiMethod::GetResultsBySessionId,
            ApiMethod::GetSessionInfo,
            ApiMethod::GetSessionStatus,
            ApiMethod::ListSessions,
            ApiMethod::Ping,
        ] {
            let req = RequestEnvelope::new(method, None, VERSION);
            assert_eq!(validate_request(&req, VERSION, MAX_BYTES).unwrap(), method);
        }
    }

    #[test]
    fn validate_rejects_unknown_method() {
        let mut req = RequestEnvelope::new(ApiMethod::Ping, None, VERSION);
        req.method = "DROP_TABLES".into();
        let err = validate_request(&req, VERSION, MAX_BYTES).unwrap_err();
        assert_eq!(err.code, ApiErrorCode::InvalidRequest);
        assert!(err.message.contains("DROP_TABLES"));
    }

    #[test]
    fn validate_rejects_version_mismatch() {
        let req = RequestEnvelope::new(ApiMethod::Ping, None, "0.9.0");
        let err = validate_request(&req, VERSION, MAX_BYTES).unwrap_err();
        assert_eq!(err.code, ApiErrorCode::InvalidRequest);
        assert!(err.message.contains("version mismatch"));
    }

    #[test]
    fn validate_enforces_size_budget() {
        let blob = "x".repeat(4096);
        let req = RequestEnvelope::new(
            ApiMethod::GetResultsBySessionId,
            Some(json!({ "sessionId": blob })),
            VERSION,
        );
        let err = validate_request(&req, VERSION, 1024).unwrap_err();
        assert_eq!(err.code, ApiErrorCode::InvalidRequest);
        assert!(err.message.contains("too large"));
    }

    #[test]
    fn error_codes_serialize_screaming() {
        let err = ApiError::timeout("no response within 5000ms");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["code"], "TIMEOUT");
        assert!(json["timestamp"].is_i64());
    }
}
