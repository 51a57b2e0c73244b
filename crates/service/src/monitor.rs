//! Bridge from the measurement engine's callback surface to the
//! orchestrator's lifecycle.
//!
//! The engine reports raw events (per-frame vitals, state changes, final
//! results, alerts); only a few of them drive session state. Everything
//! else is logged and dropped here so the orchestrator never sees
//! engine-internal chatter.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;

use crate::orchestrator::QHealthService;

/// An error or warning raised by the measurement engine.
#[derive(Debug, Clone, Deserialize)]
pub struct MonitorAlert {
    pub code: i64,
    #[serde(default)]
    pub message: Option<String>,
}

/// Raw events coming out of the measurement engine.
#[derive(Debug, Clone)]
pub enum MonitorEvent {
    /// Per-frame vitals while measuring. Informational only.
    VitalSign(Value),
    /// Aggregated vitals at the end of a successful measurement.
    FinalResults(Value),
    /// Engine state machine moved, e.g. to "measuring".
    StateChange(String),
    Error(MonitorAlert),
    Warning(MonitorAlert),
    /// Camera frame metadata. Informational only.
    ImageData(Value),
}

pub struct MonitorBridge {
    service: Arc<QHealthService>,
}

impl MonitorBridge {
    pub fn new(service: Arc<QHealthService>) -> Self {
        Self { service }
    }

    pub async fn handle(&self, event: MonitorEvent) {
        match event {
            MonitorEvent::FinalResults(vital_signs) => {
                if let Err(e) = self.service.complete_measurement(vital_signs).await {
                    tracing::error!(error = %e, "final results not recorded");
                }
            }
            MonitorEvent::Error(alert) => {
                let detail = serde_json::json!({
                    "code": alert.code,
                    "message": alert.message,
                });
                if let Err(e) = self.service.fail_measurement(detail).await {
                    tracing::error!(error = %e, "failure not recorded");
                }
            }
            MonitorEvent::StateChange(state) => {
                if state.eq_ignore_ascii_case("measuring") {
                    if let Err(e) = self.service.measurement_started().await {
                        tracing::warn!(error = %e, "measurement start not recorded");
                    }
                } else {
                    tracing::debug!(state = %state, "engine state change");
                }
            }
            MonitorEvent::Warning(alert) => {
                tracing::warn!(code = alert.code, message = ?alert.message, "engine warning");
            }
            MonitorEvent::VitalSign(_) | MonitorEvent::ImageData(_) => {
                tracing::trace!("engine frame event");
            }
        }
    }
}
