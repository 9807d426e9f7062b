//! Side-effect execution logging.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::timer::Transition;

/// A command issued to a collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum EffectCommand {
    ScheduleNotification { after_secs: u32 },
    CancelNotification,
    ClearDelivered,
    PlayAudio { sound_id: String },
    PauseAudio,
    ResumeAudio,
    StopAudio,
    RecordStats { duration_secs: u32 },
}

/// Status of a single command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionStatus {
    Success,
    /// The collaborator reported an error; the transition still completed
    Failed { reason: String },
    /// Not issued, e.g. disabled in config or already done for this run
    Skipped { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EffectResult {
    pub command: EffectCommand,
    pub status: ExecutionStatus,
}

/// Everything the coordinator did for one transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EffectLog {
    pub transition: Transition,
    pub executed_at: DateTime<Utc>,
    pub results: Vec<EffectResult>,
}

impl EffectLog {
    pub fn new(transition: Transition) -> Self {
        Self {
            transition,
            executed_at: Utc::now(),
            results: Vec::new(),
        }
    }

    pub fn push(&mut self, command: EffectCommand, status: ExecutionStatus) {
        self.results.push(EffectResult { command, status });
    }

    pub fn success_count(&self) -> usize {
        self.results
            .iter()
            .filter(|r| matches!(r.status, ExecutionStatus::Success))
            .count()
    }

    pub fn failure_count(&self) -> usize {
        self.results
            .iter()
            .filter(|r| matches!(r.status, ExecutionStatus::Failed { .. }))
            .count()
    }

    pub fn skipped_count(&self) -> usize {
        self.results
            .iter()
            .filter(|r| matches!(r.status, ExecutionStatus::Skipped { .. }))
            .count()
    }

    /// Commands that actually reached a collaborator.
    pub fn issued(&self) -> impl Iterator<Item = &EffectCommand> {
        self.results
            .iter()
            .filter(|r| !matches!(r.status, ExecutionStatus::Skipped { .. }))
            .map(|r| &r.command)
    }
}
