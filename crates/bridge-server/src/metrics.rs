use std::sync::Arc;
use std::time::Duration;

use bridge_core::StatusCode;
use bridge_telemetry::{names, MetricsRecorder};

/// Bridge-level metric recording. Every method is a no-op when metrics
/// are disabled.
#[derive(Clone, Default)]
pub struct BridgeMetrics {
    recorder: Option<Arc<MetricsRecorder>>,
}

impl BridgeMetrics {
    pub fn new(recorder: Option<Arc<MetricsRecorder>>) -> Self {
        Self { recorder }
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn recorder(&self) -> Option<&MetricsRecorder> {
        self.recorder.as_deref()
    }

    pub fn session_opened(&self) {
        if let Some(r) = &self.recorder {
            r.gauge_inc(names::SESSIONS_ACTIVE, &[], 1.0);
        }
    }

    pub fn session_closed(&self) {
        if let Some(r) = &self.recorder {
            r.gauge_inc(names::SESSIONS_ACTIVE, &[], -1.0);
        }
    }

    pub fn call_opened(&self, route: &str) {
        if let Some(r) = &self.recorder {
            r.counter_inc(names::CALLS_OPENED, &[("method", route)], 1);
        }
    }

    /// Count a terminal status; `elapsed` is recorded for calls that reached
    /// the backend.
    pub fn call_finished(&self, code: StatusCode, elapsed: Option<Duration>) {
        if let Some(r) = &self.recorder {
            r.counter_inc(names::CALLS_FINISHED, &[("status", code.as_str())], 1);
            if let Some(elapsed) = elapsed {
                r.histogram_observe(names::CALL_DURATION_MS, &[], elapsed.as_secs_f64() * 1000.0);
            }
        }
    }

    pub fn protocol_violation(&self, kind: &str) {
        if let Some(r) = &self.recorder {
            r.counter_inc(names::PROTOCOL_VIOLATIONS, &[("kind", kind)], 1);
        }
    }

    pub fn decode_error(&self) {
        if let Some(r) = &self.recorder {
            r.counter_inc(names::DECODE_ERRORS, &[], 1);
        }
    }
}
