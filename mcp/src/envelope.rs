//! Response envelope shared by every public operation.

use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    core::{operation::Payload, session::SessionSnapshot},
    error::ErrorDescriptor,
};

/// Wall-clock bounds and elapsed time of one operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Timing {
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: f64,
}

/// Captures the start of an operation.
#[derive(Debug, Clone, Copy)]
pub struct Stopwatch {
    started_at: DateTime<Utc>,
    started: Instant,
}

impl Stopwatch {
    pub fn start() -> Self {
        Self {
            started_at: Utc::now(),
            started: Instant::now(),
        }
    }

    pub fn stop(&self) -> Timing {
        let elapsed = self.started.elapsed();
        Timing {
            started_at: self.started_at,
            completed_at: Utc::now(),
            duration_ms: elapsed.as_secs_f64() * 1000.0,
        }
    }
}

/// Outcome of any public operation.
///
/// Exactly one of `payload` and `error` is set, matching `success`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationResult<T> {
    pub success: bool,
    pub payload: Option<T>,
    pub error: Option<ErrorDescriptor>,
    /// Session identity at the start of the call; `None` if there was none.
    #[serde(rename = "sessionSnapshot")]
    pub session: Option<SessionSnapshot>,
    pub timing: Timing,
}

impl<T> OperationResult<T> {
    pub fn ok(payload: T, session: Option<SessionSnapshot>, stopwatch: &Stopwatch) -> Self {
        Self {
            success: true,
            payload: Some(payload),
            error: None,
            session,
            timing: stopwatch.stop(),
        }
    }

    pub fn failed(
        error: ErrorDescriptor,
        session: Option<SessionSnapshot>,
        stopwatch: &Stopwatch,
    ) -> Self {
        Self {
            success: false,
            payload: None,
            error: Some(error),
            session,
            timing: stopwatch.stop(),
        }
    }

    pub fn into_result(self) -> Result<T, ErrorDescriptor> {
        match (self.payload, self.error) {
            (Some(payload), _) if self.success => Ok(payload),
            (_, Some(error)) => Err(error),
            _ => Err(ErrorDescriptor::new(
                crate::error::ErrorKind::ExecutionError,
                "operation produced neither payload nor error",
            )),
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> OperationResult<U> {
        OperationResult {
            success: self.success,
            payload: self.payload.map(f),
            error: self.error,
            session: self.session,
            timing: self.timing,
        }
    }
}

impl<T: Into<Payload>> OperationResult<T> {
    /// Erase the payload type so all operations share one wire shape.
    pub fn into_untyped(self) -> OperationResult<Payload> {
        self.map(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{
        core::{metrics::CounterSnapshot, session::SessionStatus, LifecycleState},
        error::ErrorKind,
    };

    fn idle_status() -> SessionStatus {
        SessionStatus {
            connected: false,
            lifecycle: LifecycleState::Idle,
            session: None,
            counters: CounterSnapshot::default(),
            connected_for_secs: None,
        }
    }

    #[test]
    fn test_timing_is_ordered() {
        let stopwatch = Stopwatch::start();
        let timing = stopwatch.stop();
        assert!(timing.completed_at >= timing.started_at);
        assert!(timing.duration_ms >= 0.0);
    }

    #[test]
    fn test_success_shape() {
        let result = OperationResult::ok(idle_status(), None, &Stopwatch::start()).into_untyped();
        let value = serde_json::to_value(&result).unwrap();

        assert_eq!(value["success"], true);
        assert_eq!(value["payload"]["type"], "status");
        assert_eq!(value["payload"]["connected"], false);
        assert_eq!(value["error"], json!(null));
        assert_eq!(value.get("sessionSnapshot"), Some(&json!(null)));
        assert!(value.get("session").is_none());
        assert!(value["timing"]["durationMs"].is_number());
    }

    #[test]
    fn test_failure_shape() {
        let result: OperationResult<SessionStatus> =
            OperationResult::failed(ErrorDescriptor::not_connected(), None, &Stopwatch::start());
        let value = serde_json::to_value(result.clone().into_untyped()).unwrap();

        assert_eq!(value["success"], false);
        assert_eq!(value["payload"], json!(null));
        assert_eq!(value["error"]["kind"], "not_connected");

        let err = result.into_result().unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotConnected);
    }
}
