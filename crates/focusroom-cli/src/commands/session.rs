use std::time::Duration;

use clap::Subcommand;
use focusroom_core::driver::{self, DriverExit, DriverSignal};
use focusroom_core::storage::Database;
use focusroom_core::{
    Config, CoreError, EngineState, Event, FileBridgeStore, FocusEngine, Outcome, SystemClock,
    ValidationError,
};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::collaborators;
use crate::runner::{self, Lease, LeaseGuard};

const ENGINE_KEY: &str = "focus_engine";

pub type CliEngine = FocusEngine<SystemClock, FileBridgeStore>;

#[derive(Subcommand)]
pub enum SessionAction {
    /// Start a new focus session
    Start {
        /// Session length in minutes (defaults to session.duration_min)
        #[arg(long)]
        duration_min: Option<u32>,
        /// Session name shown in notifications
        #[arg(long)]
        name: Option<String>,
        /// Ambient sound to play while running
        #[arg(long)]
        sound: Option<String>,
    },
    /// Pause the running session
    Pause,
    /// Resume the paused session
    Resume,
    /// Start, pause, or resume depending on the current phase
    Toggle,
    /// Return to idle
    Reset,
    /// Print current session state as JSON
    Status,
    /// Select the ambient sound ("none" to clear)
    Sound {
        sound: String,
    },
    /// Drive the session in the foreground until it ends. While it runs,
    /// other session commands are handed to it.
    Run,
}

/// Load the persisted engine, wired to this process's collaborators.
pub fn load_engine(db: &Database, config: &Config) -> Result<CliEngine, Box<dyn std::error::Error>> {
    let state = match db.kv_get_json::<EngineState>(ENGINE_KEY) {
        Ok(state) => state.unwrap_or_default(),
        Err(CoreError::Json(e)) => {
            warn!(error = %e, "discarding unreadable engine state");
            EngineState::default()
        }
        Err(e) => return Err(e.into()),
    };
    let effects = collaborators::coordinator(config.effect_settings())?;
    let bridge = FileBridgeStore::open(config.bridge_dir()?)?;
    let mut engine = FocusEngine::from_state(state, effects, bridge, SystemClock);
    engine.apply_config(config);
    Ok(engine)
}

pub fn save_engine(db: &Database, engine: &CliEngine) -> Result<(), Box<dyn std::error::Error>> {
    db.kv_set_json(ENGINE_KEY, &engine.to_state())?;
    Ok(())
}

/// Print an outcome, or the current snapshot when nothing happened.
pub fn print_outcome(
    engine: &CliEngine,
    outcome: Option<Outcome>,
) -> Result<(), Box<dyn std::error::Error>> {
    match outcome {
        Some(outcome) => println!("{}", serde_json::to_string_pretty(&outcome)?),
        None => println!("{}", serde_json::to_string_pretty(&engine.snapshot())?),
    }
    Ok(())
}

/// Queue `signal` for the live runner and report it.
pub fn queue_for_runner(
    db: &Database,
    lease: &Lease,
    signal: DriverSignal,
) -> Result<(), Box<dyn std::error::Error>> {
    runner::enqueue(db, &signal)?;
    let queued = serde_json::json!({ "queued": signal, "runner_pid": lease.pid });
    println!("{}", serde_json::to_string_pretty(&queued)?);
    Ok(())
}

fn parse_sound(sound: String) -> Option<String> {
    match sound.as_str() {
        "" | "none" => None,
        _ => Some(sound),
    }
}

/// A live `session run` owns the engine. Mutations are queued for it and
/// reads answer from the state it last saved, without catching up here.
fn hand_off(
    db: &Database,
    config: &Config,
    lease: &Lease,
    action: SessionAction,
) -> Result<(), Box<dyn std::error::Error>> {
    let signal = match action {
        SessionAction::Pause => DriverSignal::Pause,
        SessionAction::Resume => DriverSignal::Resume,
        SessionAction::Toggle => DriverSignal::Toggle,
        SessionAction::Reset => DriverSignal::Reset,
        SessionAction::Sound { sound } => DriverSignal::Sound {
            sound: parse_sound(sound),
        },
        SessionAction::Start { duration_min: Some(0), .. } => {
            return Err(ValidationError::ZeroDuration.into());
        }
        // A runner only exists while a session is active, so start has
        // nothing to do beyond reporting it.
        SessionAction::Start { .. } | SessionAction::Status => {
            let engine = load_engine(db, config)?;
            println!("{}", serde_json::to_string_pretty(&engine.snapshot())?);
            return Ok(());
        }
        SessionAction::Run => {
            return Err(format!("a session runner is already active (pid {})", lease.pid).into());
        }
    };
    queue_for_runner(db, lease, signal)
}

pub fn run(action: SessionAction) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;
    let db = Database::open()?;
    if let Some(lease) = runner::active(&db)? {
        debug!(pid = lease.pid, "handing off to session runner");
        return hand_off(&db, &config, &lease, action);
    }
    let mut engine = load_engine(&db, &config)?;

    // Every invocation is a return to the foreground: catch up first.
    if !matches!(action, SessionAction::Reset) {
        for outcome in engine.on_foreground() {
            info!(event = ?outcome.event, "caught up");
        }
    }

    match action {
        SessionAction::Start {
            duration_min,
            name,
            sound,
        } => {
            if sound.is_some() {
                engine.set_sound(sound);
            }
            let outcome = match duration_min {
                Some(0) => return Err(ValidationError::ZeroDuration.into()),
                Some(minutes) => {
                    let secs = minutes.checked_mul(60).ok_or_else(|| ValidationError::InvalidValue {
                        field: "duration_min".into(),
                        message: format!("{minutes} minutes is too long"),
                    })?;
                    let name = name.or_else(|| engine.machine().defaults().name.clone());
                    engine.start_with(secs, name)
                }
                None if name.is_some() => {
                    let secs = engine.machine().defaults().duration_secs;
                    engine.start_with(secs, name)
                }
                None => engine.start(),
            };
            print_outcome(&engine, outcome)?;
        }
        SessionAction::Pause => {
            let outcome = engine.pause();
            print_outcome(&engine, outcome)?;
        }
        SessionAction::Resume => {
            let outcome = engine.resume();
            print_outcome(&engine, outcome)?;
        }
        SessionAction::Toggle => {
            let outcome = engine.toggle();
            print_outcome(&engine, outcome)?;
        }
        SessionAction::Reset => {
            let outcome = engine.reset();
            print_outcome(&engine, Some(outcome))?;
        }
        SessionAction::Status => {
            println!("{}", serde_json::to_string_pretty(&engine.snapshot())?);
        }
        SessionAction::Sound { sound } => {
            engine.set_sound(parse_sound(sound));
            println!("{}", serde_json::to_string_pretty(&engine.mirror())?);
        }
        SessionAction::Run => {
            let lease = LeaseGuard::acquire(&db)?;
            let interval = Duration::from_secs(u64::from(config.bridge.poll_interval_secs));
            let exit = drive(&mut engine, interval, &db, &lease)?;
            info!(?exit, "session run finished");
            println!("{}", serde_json::to_string_pretty(&engine.snapshot())?);
            // Saved before the lease is released.
            engine.publish_mirror();
            save_engine(&db, &engine)?;
            return Ok(());
        }
    }

    engine.publish_mirror();
    save_engine(&db, &engine)?;
    Ok(())
}

/// Run the 1 Hz driver on a current-thread runtime, streaming events as
/// JSON lines. Engine state is saved after every change so queued intents
/// and readers in other processes see it. Ctrl-C stops the driver; SIGUSR1
/// forces an immediate poll.
fn drive(
    engine: &mut CliEngine,
    interval: Duration,
    db: &Database,
    lease: &LeaseGuard<'_>,
) -> Result<DriverExit, Box<dyn std::error::Error>> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let mut events = engine.subscribe();
    let (signal_tx, signal_rx) = mpsc::channel(8);

    let exit = runtime.block_on(async {
        let shutdown = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "ctrl-c handler unavailable");
                std::future::pending::<()>().await;
            }
        };
        let checkpoint = |engine: &CliEngine| {
            if let Err(e) = save_engine(db, engine) {
                warn!(error = %e, "engine state not saved");
            }
        };
        let drive = driver::run(engine, interval, signal_rx, shutdown, checkpoint);
        let refresh = forward_refresh(signal_tx.clone());
        let mut intake = tokio::time::interval(runner::RENEW_INTERVAL);
        tokio::pin!(drive);
        tokio::pin!(refresh);

        loop {
            tokio::select! {
                exit = &mut drive => break exit,
                event = events.recv() => print_event(event),
                _ = intake.tick() => relay_intents(lease, &signal_tx),
                () = &mut refresh => {}
            }
        }
    });

    while let Ok(event) = events.try_recv() {
        print_event(Ok(event));
    }
    Ok(exit)
}

/// Renew the lease and pass queued intents to the driver.
fn relay_intents(lease: &LeaseGuard<'_>, tx: &mpsc::Sender<DriverSignal>) {
    if let Err(e) = lease.renew() {
        warn!(error = %e, "runner lease not renewed");
    }
    let intents = match lease.take_intents(tx.capacity()) {
        Ok(intents) => intents,
        Err(e) => {
            warn!(error = %e, "queued intents unreadable");
            return;
        }
    };
    for signal in intents {
        if let Err(e) = tx.try_send(signal) {
            warn!(error = %e, "intent dropped");
        }
    }
}

fn print_event(event: Result<Event, broadcast::error::RecvError>) {
    match event {
        Ok(event) => match serde_json::to_string(&event) {
            Ok(line) => println!("{line}"),
            Err(e) => warn!(error = %e, "event not printable"),
        },
        Err(broadcast::error::RecvError::Lagged(skipped)) => {
            warn!(skipped, "event stream lagged");
        }
        Err(broadcast::error::RecvError::Closed) => {}
    }
}

#[cfg(unix)]
async fn forward_refresh(tx: mpsc::Sender<DriverSignal>) {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::user_defined1()) {
        Ok(mut usr1) => {
            while usr1.recv().await.is_some() {
                if tx.send(DriverSignal::Foreground).await.is_err() {
                    break;
                }
            }
        }
        Err(e) => warn!(error = %e, "SIGUSR1 handler unavailable"),
    }
    std::future::pending::<()>().await
}

#[cfg(not(unix))]
async fn forward_refresh(tx: mpsc::Sender<DriverSignal>) {
    drop(tx);
    std::future::pending::<()>().await
}
