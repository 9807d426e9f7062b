//! Transition-triggered side effects.
//!
//! Notification, audio, and stats collaborators are reached only through the
//! traits in this module; the engine owns one [`SideEffectCoordinator`] that
//! translates each phase transition into commands for them.

mod coordinator;
mod log;
mod traits;

pub use coordinator::{EffectContext, EffectSettings, EffectState, SideEffectCoordinator};
pub use log::{EffectCommand, EffectLog, EffectResult, ExecutionStatus};
pub use traits::{AudioCoordinator, EffectError, NotificationId, NotificationScheduler, StatsSink};
