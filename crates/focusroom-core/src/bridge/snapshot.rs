use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::BridgeError;
use crate::timer::PhaseKind;

/// State reported by an out-of-process surface (widget, live-status view).
///
/// `last_update_time` comes from the writer's monotonic clock, so it is only
/// comparable with other snapshots, never with the engine's wall clock.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BridgeSnapshot {
    pub is_paused: bool,
    pub remaining_seconds: u32,
    pub last_update_time: f64,
}

impl BridgeSnapshot {
    /// Reject snapshots whose timestamp cannot be ordered.
    pub fn validate(&self) -> Result<(), BridgeError> {
        if !self.last_update_time.is_finite() || self.last_update_time < 0.0 {
            return Err(BridgeError::Invalid(format!(
                "last_update_time {} is not a non-negative finite number",
                self.last_update_time
            )));
        }
        Ok(())
    }
}

/// The engine's own view of the session, published for other surfaces to
/// render. Never read back by the reconciler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMirror {
    pub session_id: Option<Uuid>,
    pub phase: PhaseKind,
    pub remaining_secs: u32,
    pub total_secs: u32,
    /// Wall-clock end instant while running, for countdown rendering.
    pub end_epoch_ms: Option<u64>,
    pub name: Option<String>,
    pub sound: Option<String>,
    pub updated_at: DateTime<Utc>,
}
