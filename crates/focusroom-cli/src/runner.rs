//! Hand-off between one-shot commands and a live `session run`.
//!
//! The runner holds a lease in the kv table and renews it while it drives the
//! engine. While the lease is fresh, other invocations must not load and save
//! the engine themselves: they queue a [`DriverSignal`] and the runner applies
//! it on its own task.

use std::time::Duration;

use chrono::Utc;
use focusroom_core::driver::DriverSignal;
use focusroom_core::storage::Database;
use focusroom_core::CoreError;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

const LEASE_KEY: &str = "runner_lease";
const INTENT_PREFIX: &str = "runner_intent:";
const LEASE_TTL_MS: u64 = 3_000;

/// How often the runner renews its lease and drains the queue.
pub const RENEW_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lease {
    pub pid: u32,
    pub heartbeat_ms: u64,
}

impl Lease {
    fn is_fresh(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.heartbeat_ms) < LEASE_TTL_MS
    }
}

fn now_ms() -> u64 {
    u64::try_from(Utc::now().timestamp_millis()).unwrap_or(0)
}

fn read_lease(db: &Database) -> Result<Option<Lease>, CoreError> {
    match db.kv_get_json::<Lease>(LEASE_KEY) {
        Err(CoreError::Json(e)) => {
            warn!(error = %e, "ignoring unreadable runner lease");
            Ok(None)
        }
        other => other,
    }
}

/// The lease of a runner that is still renewing it.
pub fn active(db: &Database) -> Result<Option<Lease>, CoreError> {
    Ok(read_lease(db)?.filter(|lease| lease.is_fresh(now_ms())))
}

/// Queue `signal` for the active runner.
pub fn enqueue(db: &Database, signal: &DriverSignal) -> Result<(), CoreError> {
    let key = format!("{INTENT_PREFIX}{:020}:{}", now_ms(), Uuid::new_v4());
    db.kv_set_json(&key, signal)?;
    debug!(%key, ?signal, "intent queued");
    Ok(())
}

/// Held by `session run` for as long as it drives the engine.
pub struct LeaseGuard<'a> {
    db: &'a Database,
    pid: u32,
}

impl<'a> LeaseGuard<'a> {
    /// Take the lease unless another runner holds a fresh one.
    ///
    /// Intents left over from an earlier runner are discarded.
    pub fn acquire(db: &'a Database) -> Result<Self, Box<dyn std::error::Error>> {
        if let Some(lease) = active(db)? {
            return Err(format!("a session runner is already active (pid {})", lease.pid).into());
        }
        let stale = db.kv_take_prefix(INTENT_PREFIX, u32::MAX)?;
        if !stale.is_empty() {
            warn!(count = stale.len(), "discarding intents queued for a previous runner");
        }
        let guard = Self {
            db,
            pid: std::process::id(),
        };
        guard.renew()?;
        Ok(guard)
    }

    pub fn renew(&self) -> Result<(), CoreError> {
        self.db.kv_set_json(
            LEASE_KEY,
            &Lease {
                pid: self.pid,
                heartbeat_ms: now_ms(),
            },
        )
    }

    /// Dequeue up to `limit` intents, oldest first. Unreadable entries are
    /// dropped.
    pub fn take_intents(&self, limit: usize) -> Result<Vec<DriverSignal>, CoreError> {
        let limit = u32::try_from(limit).unwrap_or(u32::MAX);
        let taken = self.db.kv_take_prefix(INTENT_PREFIX, limit)?;
        Ok(taken
            .into_iter()
            .filter_map(|(key, json)| match serde_json::from_str(&json) {
                Ok(signal) => Some(signal),
                Err(e) => {
                    warn!(%key, error = %e, "dropping unreadable intent");
                    None
                }
            })
            .collect())
    }
}

impl Drop for LeaseGuard<'_> {
    fn drop(&mut self) {
        // Leave a lease that another runner has since taken over.
        match read_lease(self.db) {
            Ok(Some(lease)) if lease.pid == self.pid => {
                if let Err(e) = self.db.kv_delete(LEASE_KEY) {
                    warn!(error = %e, "runner lease not released");
                }
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "runner lease unreadable on release"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_blocks_second_runner_until_released() {
        let db = Database::open_memory().unwrap();
        assert!(active(&db).unwrap().is_none());

        let guard = LeaseGuard::acquire(&db).unwrap();
        assert_eq!(active(&db).unwrap().map(|l| l.pid), Some(std::process::id()));
        let err = LeaseGuard::acquire(&db).err().unwrap();
        assert!(err.to_string().contains("already active"));

        drop(guard);
        assert!(active(&db).unwrap().is_none());
    }

    #[test]
    fn expired_lease_is_not_active() {
        let db = Database::open_memory().unwrap();
        db.kv_set_json(
            LEASE_KEY,
            &Lease {
                pid: 1,
                heartbeat_ms: now_ms() - LEASE_TTL_MS - 1,
            },
        )
        .unwrap();
        assert!(active(&db).unwrap().is_none());
        assert!(LeaseGuard::acquire(&db).is_ok());
    }

    #[test]
    fn intents_arrive_in_order_and_only_once() {
        let db = Database::open_memory().unwrap();
        let guard = LeaseGuard::acquire(&db).unwrap();
        enqueue(&db, &DriverSignal::Pause).unwrap();
        std::thread::sleep(Duration::from_millis(2));
        enqueue(&db, &DriverSignal::Reset).unwrap();
        db.kv_set(&format!("{INTENT_PREFIX}{:020}:junk", now_ms() + 1_000), "{")
            .unwrap();

        assert_eq!(guard.take_intents(1).unwrap(), vec![DriverSignal::Pause]);
        assert_eq!(guard.take_intents(8).unwrap(), vec![DriverSignal::Reset]);
        assert!(guard.take_intents(8).unwrap().is_empty());
    }

    #[test]
    fn acquire_discards_leftover_intents() {
        let db = Database::open_memory().unwrap();
        enqueue(&db, &DriverSignal::Pause).unwrap();
        let guard = LeaseGuard::acquire(&db).unwrap();
        assert!(guard.take_intents(8).unwrap().is_empty());
    }
}
