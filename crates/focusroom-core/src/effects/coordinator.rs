//! Maps phase transitions to collaborator commands.
//!
//! Each entry edge has a fixed command list, written so that repeating it is
//! harmless: notifications are cancelled before being rescheduled, audio
//! commands are intents, and stats are guarded by the run's
//! [`CompletionGuard`]. Collaborator failures are logged and recorded in the
//! returned [`EffectLog`], never propagated.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::log::{EffectCommand, EffectLog, ExecutionStatus};
use super::traits::{AudioCoordinator, EffectError, NotificationId, NotificationScheduler, StatsSink};
use crate::timer::{CompletionGuard, PhaseKind, Transition};

const DEFAULT_NOTIFICATION_TITLE: &str = "Focus session";

/// Collaborator-facing state that must outlive a single process run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EffectState {
    /// The one outstanding completion notification.
    #[serde(default)]
    pub pending_notification: Option<NotificationId>,
    /// Sound last started with `play`; `None` once stopped.
    #[serde(default)]
    pub playing_sound: Option<String>,
}

/// Config switches for the side channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EffectSettings {
    pub notifications_enabled: bool,
    pub audio_enabled: bool,
}

impl Default for EffectSettings {
    fn default() -> Self {
        Self {
            notifications_enabled: true,
            audio_enabled: true,
        }
    }
}

/// Run details the coordinator needs, borrowed from the state machine.
#[derive(Debug, Clone, Copy, Default)]
pub struct EffectContext<'a> {
    pub session_name: Option<&'a str>,
    pub sound: Option<&'a str>,
    pub planned_secs: Option<u32>,
}

pub struct SideEffectCoordinator {
    notifier: Box<dyn NotificationScheduler>,
    audio: Box<dyn AudioCoordinator>,
    stats: Box<dyn StatsSink>,
    settings: EffectSettings,
    state: EffectState,
}

impl SideEffectCoordinator {
    pub fn new(
        notifier: Box<dyn NotificationScheduler>,
        audio: Box<dyn AudioCoordinator>,
        stats: Box<dyn StatsSink>,
    ) -> Self {
        Self {
            notifier,
            audio,
            stats,
            settings: EffectSettings::default(),
            state: EffectState::default(),
        }
    }

    pub fn with_settings(mut self, settings: EffectSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn settings(&self) -> EffectSettings {
        self.settings
    }

    pub fn set_settings(&mut self, settings: EffectSettings) {
        self.settings = settings;
    }

    pub fn state(&self) -> &EffectState {
        &self.state
    }

    /// Restore state persisted by an earlier process.
    pub fn restore_state(&mut self, state: EffectState) {
        self.state = state;
    }

    /// Issue the commands for entering `transition.to`.
    pub fn apply(
        &mut self,
        transition: &Transition,
        ctx: EffectContext<'_>,
        guard: &mut CompletionGuard,
    ) -> EffectLog {
        let mut log = EffectLog::new(*transition);
        match transition.to {
            PhaseKind::Running => self.enter_running(transition, ctx, &mut log),
            PhaseKind::Paused => {
                // A paused remaining-update has nothing to reschedule.
                if transition.from != PhaseKind::Paused {
                    self.cancel_notification(&mut log);
                    self.pause_audio(&mut log);
                }
            }
            PhaseKind::Completed => self.enter_completed(ctx, guard, &mut log),
            PhaseKind::Idle => {
                self.cancel_notification(&mut log);
                self.stop_audio(&mut log);
                guard.clear();
            }
        }
        debug!(
            from = ?transition.from,
            to = ?transition.to,
            issued = log.issued().count(),
            failed = log.failure_count(),
            "side effects applied"
        );
        log
    }

    fn enter_running(&mut self, transition: &Transition, ctx: EffectContext<'_>, log: &mut EffectLog) {
        self.schedule_notification(transition.remaining_secs, ctx.session_name, log);

        // Re-anchoring a running session leaves playback alone.
        if transition.from == PhaseKind::Running {
            return;
        }
        if !self.settings.audio_enabled {
            if let Some(sound_id) = ctx.sound {
                log.push(
                    EffectCommand::PlayAudio {
                        sound_id: sound_id.to_owned(),
                    },
                    skipped("audio disabled"),
                );
            }
            return;
        }
        match ctx.sound {
            Some(sound_id)
                if transition.from == PhaseKind::Paused
                    && self.state.playing_sound.as_deref() == Some(sound_id) =>
            {
                let status = status_of("audio resume", self.audio.resume());
                log.push(EffectCommand::ResumeAudio, status);
            }
            Some(sound_id) => {
                let status = status_of("audio play", self.audio.play(sound_id));
                if status == ExecutionStatus::Success {
                    self.state.playing_sound = Some(sound_id.to_owned());
                }
                log.push(
                    EffectCommand::PlayAudio {
                        sound_id: sound_id.to_owned(),
                    },
                    status,
                );
            }
            // Sound deselected while paused.
            None => self.stop_audio(log),
        }
    }

    fn enter_completed(
        &mut self,
        ctx: EffectContext<'_>,
        guard: &mut CompletionGuard,
        log: &mut EffectLog,
    ) {
        if !guard.try_latch() {
            debug!("completion already handled for this run");
            log.push(
                EffectCommand::RecordStats {
                    duration_secs: ctx.planned_secs.unwrap_or(0),
                },
                skipped("completion already logged"),
            );
            return;
        }

        match ctx.planned_secs {
            Some(duration_secs) => {
                let status = status_of(
                    "stats record",
                    self.stats.record(duration_secs, ctx.session_name),
                );
                log.push(EffectCommand::RecordStats { duration_secs }, status);
            }
            None => warn!("completed run without a planned duration; nothing recorded"),
        }

        self.cancel_notification(log);
        if self.settings.notifications_enabled {
            let status = status_of("notification clear", self.notifier.clear_delivered());
            log.push(EffectCommand::ClearDelivered, status);
        }
        self.stop_audio(log);
    }

    fn schedule_notification(&mut self, after_secs: u32, name: Option<&str>, log: &mut EffectLog) {
        self.cancel_notification(log);
        if !self.settings.notifications_enabled {
            log.push(
                EffectCommand::ScheduleNotification { after_secs },
                skipped("notifications disabled"),
            );
            return;
        }
        let title = name.unwrap_or(DEFAULT_NOTIFICATION_TITLE);
        match self.notifier.schedule(after_secs, title) {
            Ok(id) => {
                debug!(%id, after_secs, "completion notification scheduled");
                self.state.pending_notification = Some(id);
                log.push(
                    EffectCommand::ScheduleNotification { after_secs },
                    ExecutionStatus::Success,
                );
            }
            Err(e) => log.push(
                EffectCommand::ScheduleNotification { after_secs },
                failed("notification schedule", e),
            ),
        }
    }

    fn cancel_notification(&mut self, log: &mut EffectLog) {
        // Dropped even if cancel fails: there is nothing to retry against.
        let Some(id) = self.state.pending_notification.take() else {
            return;
        };
        let status = status_of("notification cancel", self.notifier.cancel(&id));
        log.push(EffectCommand::CancelNotification, status);
    }

    fn pause_audio(&mut self, log: &mut EffectLog) {
        if self.state.playing_sound.is_none() {
            return;
        }
        if !self.settings.audio_enabled {
            log.push(EffectCommand::PauseAudio, skipped("audio disabled"));
            return;
        }
        let status = status_of("audio pause", self.audio.pause());
        log.push(EffectCommand::PauseAudio, status);
    }

    fn stop_audio(&mut self, log: &mut EffectLog) {
        if self.state.playing_sound.take().is_none() {
            return;
        }
        let status = status_of("audio stop", self.audio.stop());
        log.push(EffectCommand::StopAudio, status);
    }
}

fn status_of(what: &str, result: Result<(), EffectError>) -> ExecutionStatus {
    match result {
        Ok(()) => ExecutionStatus::Success,
        Err(e) => failed(what, e),
    }
}

fn failed(what: &str, err: EffectError) -> ExecutionStatus {
    warn!(error = %err, "{what} failed");
    ExecutionStatus::Failed {
        reason: err.to_string(),
    }
}

fn skipped(reason: &str) -> ExecutionStatus {
    ExecutionStatus::Skipped {
        reason: reason.to_owned(),
    }
}
