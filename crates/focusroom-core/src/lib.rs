//! # Focusroom Core Library
//!
//! This library provides the focus session engine behind Focusroom. A single
//! timed session is kept consistent across the main process and out-of-process
//! surfaces (widgets, live-status views) that can only exchange state through
//! a shared, polled store.
//!
//! ## Architecture
//!
//! - **Timer**: a wall-clock-anchored countdown and the session state machine.
//!   The caller invokes `tick()` periodically; remaining time is always derived
//!   from an absolute end instant, so it survives suspension without drift.
//! - **Bridge**: the shared store and the reconciler that folds newer external
//!   reports into local state.
//! - **Effects**: notification, audio, and stats collaborators, driven with
//!   at-most-once semantics per transition.
//! - **Storage**: SQLite session history and TOML configuration.
//!
//! ## Key Components
//!
//! - [`FocusEngine`]: the one engine object per process
//! - [`SessionMachine`]: phase and transition rules
//! - [`BridgeReconciler`]: staleness-checked external state folding
//! - [`SideEffectCoordinator`]: transition-to-command mapping

pub mod bridge;
pub mod driver;
pub mod effects;
pub mod engine;
pub mod error;
pub mod events;
pub mod storage;
pub mod timer;

pub use bridge::{BridgeIntent, BridgeReconciler, BridgeSnapshot, BridgeStore, FileBridgeStore, MemoryBridgeStore, SessionMirror};
pub use effects::{
    AudioCoordinator, EffectError, EffectLog, NotificationId, NotificationScheduler,
    SideEffectCoordinator, StatsSink,
};
pub use engine::{EngineState, FocusEngine, Outcome};
pub use error::{BridgeError, ConfigError, CoreError, DatabaseError, ValidationError};
pub use events::{Event, Origin};
pub use storage::{Config, Database};
pub use timer::{Clock, ManualClock, Phase, PhaseKind, SessionDefaults, SessionMachine, SystemClock, Transition};
