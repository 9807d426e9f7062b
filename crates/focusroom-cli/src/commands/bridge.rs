use clap::Subcommand;
use focusroom_core::driver::DriverSignal;
use focusroom_core::storage::Database;
use focusroom_core::{BridgeSnapshot, BridgeStore, Config, FileBridgeStore};

use super::session::{load_engine, print_outcome, queue_for_runner, save_engine};
use crate::runner;

#[derive(Subcommand)]
pub enum BridgeAction {
    /// Reconcile the shared snapshot into the local session once
    Poll,
    /// Write a snapshot the way a widget would
    Push {
        /// Remaining seconds reported by the widget
        #[arg(long)]
        remaining: u32,
        /// Report the session as paused
        #[arg(long)]
        paused: bool,
    },
    /// Print the shared snapshot and the engine's published mirror
    Show,
}

/// Seconds since the Unix epoch, the widget-side timestamp convention.
fn widget_timestamp() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

pub fn run(action: BridgeAction) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;

    match action {
        BridgeAction::Poll => {
            let db = Database::open()?;
            if let Some(lease) = runner::active(&db)? {
                return queue_for_runner(&db, &lease, DriverSignal::Foreground);
            }
            let mut engine = load_engine(&db, &config)?;
            let tick = engine.tick();
            let outcome = engine.poll_bridge().or(tick);
            print_outcome(&engine, outcome)?;
            engine.publish_mirror();
            save_engine(&db, &engine)?;
        }
        BridgeAction::Push { remaining, paused } => {
            let store = FileBridgeStore::open(config.bridge_dir()?)?;
            let snapshot = BridgeSnapshot {
                is_paused: paused,
                remaining_seconds: remaining,
                last_update_time: widget_timestamp(),
            };
            store.write_snapshot(&snapshot)?;
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        }
        BridgeAction::Show => {
            let store = FileBridgeStore::open(config.bridge_dir()?)?;
            let view = serde_json::json!({
                "snapshot": store.load_snapshot()?,
                "mirror": store.load_mirror()?,
            });
            println!("{}", serde_json::to_string_pretty(&view)?);
        }
    }
    Ok(())
}
