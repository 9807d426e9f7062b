use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Handle returned by a notification scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NotificationId(pub String);

impl std::fmt::Display for NotificationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Failure reported by a side-effect collaborator.
///
/// The engine logs these and moves on; they never block a transition.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EffectError {
    /// The collaborator refused the command (e.g. notification permission denied)
    #[error("rejected: {0}")]
    Rejected(String),

    /// The collaborator is not reachable right now
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// Persisting the command's result failed
    #[error("storage failed: {0}")]
    Storage(String),
}

/// Local notification subsystem.
///
/// At most one completion notification is outstanding per session; the
/// coordinator cancels the previous one before scheduling another.
pub trait NotificationScheduler {
    fn schedule(
        &mut self,
        after_secs: u32,
        session_name: &str,
    ) -> Result<NotificationId, EffectError>;

    fn cancel(&mut self, id: &NotificationId) -> Result<(), EffectError>;

    /// Remove already delivered completion notifications.
    fn clear_delivered(&mut self) -> Result<(), EffectError> {
        Ok(()) // default no-op
    }
}

/// Ambient audio playback.
///
/// Commands are intents: playback may be pre-empted by the system at any
/// time and the engine never assumes a command took effect.
pub trait AudioCoordinator {
    fn play(&mut self, sound_id: &str) -> Result<(), EffectError>;
    fn pause(&mut self) -> Result<(), EffectError>;
    fn resume(&mut self) -> Result<(), EffectError>;
    fn stop(&mut self) -> Result<(), EffectError>;
}

/// Completed-session persistence. Called at most once per run.
pub trait StatsSink {
    fn record(&mut self, duration_secs: u32, name: Option<&str>) -> Result<(), EffectError>;
}
