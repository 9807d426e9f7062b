//! Side-effect collaborators for a terminal process.
//!
//! A CLI invocation exits long before a completion notification is due, so
//! notifications and playback are recorded in the kv table for the desktop
//! shell to act on. Stats go straight to the sessions table.

use chrono::{DateTime, Duration, Utc};
use focusroom_core::effects::EffectSettings;
use focusroom_core::storage::Database;
use focusroom_core::{
    AudioCoordinator, CoreError, EffectError, NotificationId, NotificationScheduler,
    SideEffectCoordinator,
};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

const NOTIFICATION_KEY: &str = "notification";
const AUDIO_KEY: &str = "audio_state";

/// The single queued notification. Once `fire_at` has passed the shell has
/// shown it and the entry stands for the delivered notification.
#[derive(Debug, Serialize, Deserialize)]
struct QueuedNotification {
    id: NotificationId,
    title: String,
    fire_at: DateTime<Utc>,
}

impl QueuedNotification {
    fn is_delivered(&self, now: DateTime<Utc>) -> bool {
        self.fire_at <= now
    }
}

pub struct KvNotifier {
    db: Database,
}

impl KvNotifier {
    fn load(&self) -> Result<Option<QueuedNotification>, EffectError> {
        let json = self
            .db
            .kv_get(NOTIFICATION_KEY)
            .map_err(|e| EffectError::Storage(e.to_string()))?;
        Ok(json.and_then(|j| serde_json::from_str(&j).ok()))
    }

    fn remove(&self) -> Result<(), EffectError> {
        self.db
            .kv_delete(NOTIFICATION_KEY)
            .map_err(|e| EffectError::Storage(e.to_string()))
    }
}

impl NotificationScheduler for KvNotifier {
    fn schedule(&mut self, after_secs: u32, session_name: &str) -> Result<NotificationId, EffectError> {
        let queued = QueuedNotification {
            id: NotificationId(Uuid::new_v4().to_string()),
            title: session_name.to_string(),
            fire_at: Utc::now() + Duration::seconds(i64::from(after_secs)),
        };
        let json = serde_json::to_string(&queued).map_err(|e| EffectError::Storage(e.to_string()))?;
        self.db
            .kv_set(NOTIFICATION_KEY, &json)
            .map_err(|e| EffectError::Storage(e.to_string()))?;
        info!(id = %queued.id, fire_at = %queued.fire_at, "notification queued");
        Ok(queued.id)
    }

    /// Withdraw `id` if it has not fired. A newer notification or one
    /// already shown is left for `clear_delivered`.
    fn cancel(&mut self, id: &NotificationId) -> Result<(), EffectError> {
        match self.load()? {
            Some(queued) if queued.id == *id && !queued.is_delivered(Utc::now()) => self.remove(),
            _ => Ok(()),
        }
    }

    fn clear_delivered(&mut self) -> Result<(), EffectError> {
        match self.load()? {
            Some(queued) if queued.is_delivered(Utc::now()) => {
                info!(id = %queued.id, "delivered notification cleared");
                self.remove()
            }
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "lowercase")]
enum AudioState {
    Playing { sound_id: String },
    Paused { sound_id: String },
    Stopped,
}

pub struct KvAudio {
    db: Database,
}

impl KvAudio {
    fn load(&self) -> Result<AudioState, EffectError> {
        let json = self
            .db
            .kv_get(AUDIO_KEY)
            .map_err(|e| EffectError::Storage(e.to_string()))?;
        Ok(json
            .and_then(|j| serde_json::from_str(&j).ok())
            .unwrap_or(AudioState::Stopped))
    }

    fn store(&self, state: &AudioState) -> Result<(), EffectError> {
        let json = serde_json::to_string(state).map_err(|e| EffectError::Storage(e.to_string()))?;
        info!(?state, "audio");
        self.db
            .kv_set(AUDIO_KEY, &json)
            .map_err(|e| EffectError::Storage(e.to_string()))
    }
}

impl AudioCoordinator for KvAudio {
    fn play(&mut self, sound_id: &str) -> Result<(), EffectError> {
        self.store(&AudioState::Playing {
            sound_id: sound_id.to_string(),
        })
    }

    fn pause(&mut self) -> Result<(), EffectError> {
        match self.load()? {
            AudioState::Playing { sound_id } => self.store(&AudioState::Paused { sound_id }),
            _ => Ok(()),
        }
    }

    fn resume(&mut self) -> Result<(), EffectError> {
        match self.load()? {
            AudioState::Paused { sound_id } => self.store(&AudioState::Playing { sound_id }),
            AudioState::Stopped => Err(EffectError::Unavailable("nothing to resume".into())),
            AudioState::Playing { .. } => Ok(()),
        }
    }

    fn stop(&mut self) -> Result<(), EffectError> {
        self.store(&AudioState::Stopped)
    }
}

/// Build the coordinator with one connection per collaborator.
pub fn coordinator(settings: EffectSettings) -> Result<SideEffectCoordinator, CoreError> {
    let notifier = KvNotifier { db: Database::open()? };
    let audio = KvAudio { db: Database::open()? };
    let stats = Database::open()?;
    Ok(SideEffectCoordinator::new(Box::new(notifier), Box::new(audio), Box::new(stats))
        .with_settings(settings))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notifier() -> KvNotifier {
        KvNotifier {
            db: Database::open_memory().unwrap(),
        }
    }

    fn queue_due(notifier: &KvNotifier, id: &str) {
        let queued = QueuedNotification {
            id: NotificationId(id.into()),
            title: "Essay".into(),
            fire_at: Utc::now() - Duration::seconds(5),
        };
        notifier
            .db
            .kv_set(NOTIFICATION_KEY, &serde_json::to_string(&queued).unwrap())
            .unwrap();
    }

    #[test]
    fn cancel_withdraws_unfired_notification() {
        let mut notifier = notifier();
        let id = notifier.schedule(600, "Essay").unwrap();
        notifier.clear_delivered().unwrap();
        assert!(notifier.load().unwrap().is_some());

        notifier.cancel(&id).unwrap();
        assert!(notifier.load().unwrap().is_none());
    }

    #[test]
    fn cancel_ignores_replaced_notification() {
        let mut notifier = notifier();
        let old = notifier.schedule(600, "Essay").unwrap();
        let current = notifier.schedule(300, "Essay").unwrap();
        notifier.cancel(&old).unwrap();
        assert_eq!(notifier.load().unwrap().map(|q| q.id), Some(current));
    }

    #[test]
    fn fired_notification_survives_cancel_until_cleared() {
        let mut notifier = notifier();
        queue_due(&notifier, "n1");

        notifier.cancel(&NotificationId("n1".into())).unwrap();
        assert!(notifier.load().unwrap().is_some());

        notifier.clear_delivered().unwrap();
        assert!(notifier.load().unwrap().is_none());
    }

    #[test]
    fn audio_pause_and_resume_follow_stored_state() {
        let mut audio = KvAudio {
            db: Database::open_memory().unwrap(),
        };
        assert!(audio.resume().is_err());
        audio.play("rain").unwrap();
        audio.pause().unwrap();
        assert_eq!(
            audio.load().unwrap(),
            AudioState::Paused {
                sound_id: "rain".into()
            }
        );
        audio.resume().unwrap();
        audio.stop().unwrap();
        assert_eq!(audio.load().unwrap(), AudioState::Stopped);
    }
}
