//! Log, progress and conflict event surface consumed by the UI layer

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Pipeline stage reported with progress updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Scanning,
    Archiving,
    Restoring,
}

/// Payload of a `progress_update` event. `total == 0` means indeterminate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressUpdate {
    pub message: String,
    pub current: u64,
    pub total: u64,
    pub bytes_current: u64,
    pub bytes_total: u64,
    pub stage: Stage,
}

/// Outbound event stream. Implementations must be cheap and non-blocking;
/// engine workers call these while holding no locks.
pub trait EventSink: Send + Sync {
    fn log_message(&self, message: &str);
    fn progress_update(&self, update: &ProgressUpdate);
    fn conflict_detected(&self, path: &Path, request_id: u64);
}

/// Sink that drops every event. Used by headless executions (task runner).
pub struct NullEvents;

impl EventSink for NullEvents {
    fn log_message(&self, _message: &str) {}
    fn progress_update(&self, _update: &ProgressUpdate) {}
    fn conflict_detected(&self, _path: &Path, _request_id: u64) {}
}

pub(crate) const PROGRESS_INTERVAL: Duration = Duration::from_millis(150);

/// Rate limiter for progress events: at most one per 150 ms unless forced.
pub(crate) struct ProgressThrottle {
    base: Instant,
    last_emit_micros: AtomicU64,
}

impl ProgressThrottle {
    pub(crate) fn new() -> Self {
        Self {
            base: Instant::now(),
            last_emit_micros: AtomicU64::new(0),
        }
    }

    /// Returns true when the caller should emit. Unforced emissions race via
    /// compare-and-swap so concurrent workers collapse to a single event.
    pub(crate) fn should_emit(&self, force: bool) -> bool {
        let now = self.base.elapsed().as_micros() as u64;
        if force {
            self.last_emit_micros.store(now, Ordering::SeqCst);
            return true;
        }
        let last = self.last_emit_micros.load(Ordering::SeqCst);
        if last != 0 && now.saturating_sub(last) < PROGRESS_INTERVAL.as_micros() as u64 {
            return false;
        }
        self.last_emit_micros
            .compare_exchange(last, now, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_throttle_limits_unforced_emissions() {
        let throttle = ProgressThrottle::new();
        assert!(throttle.should_emit(true));
        assert!(!throttle.should_emit(false));
        assert!(throttle.should_emit(true));
    }

    #[test]
    fn test_first_unforced_emission_passes() {
        let throttle = ProgressThrottle::new();
        assert!(throttle.should_emit(false));
    }

    #[test]
    fn test_stage_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&Stage::Archiving).unwrap(),
            "\"archiving\""
        );
    }

    #[test]
    fn test_progress_payload_shape() {
        let update = ProgressUpdate {
            message: "archiving: a.txt".into(),
            current: 1,
            total: 3,
            bytes_current: 10,
            bytes_total: 30,
            stage: Stage::Archiving,
        };
        let json = serde_json::to_string(&update).unwrap();
        assert!(json.contains("\"bytesCurrent\":10"));
        assert!(json.contains("\"stage\":\"archiving\""));
    }
}
