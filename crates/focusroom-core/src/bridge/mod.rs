//! Cross-process session bridge.
//!
//! Widgets and live-status surfaces run in separate OS processes and share
//! no call channel with the engine. They exchange state through a shared,
//! polled [`BridgeStore`]; the [`BridgeReconciler`] decides which external
//! reports are new enough to act on.

mod reconciler;
mod snapshot;
mod store;

pub use reconciler::{BridgeIntent, BridgeReconciler, Reconciliation};
pub use snapshot::{BridgeSnapshot, SessionMirror};
pub use store::{BridgeStore, FileBridgeStore, MemoryBridgeStore};
