//! Shared, polled store between the engine and out-of-process surfaces.
//!
//! The file store keeps two JSON documents in one directory:
//!
//! - `bridge_snapshot.json`: written by widgets, read by the engine
//! - `session_state.json`: written by the engine, read by widgets
//!
//! Writes go to a temporary sibling first and are renamed into place so a
//! concurrent reader in another process never observes a torn document.

use std::cell::{Cell, RefCell};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::snapshot::{BridgeSnapshot, SessionMirror};
use crate::error::BridgeError;

const SNAPSHOT_FILE: &str = "bridge_snapshot.json";
const MIRROR_FILE: &str = "session_state.json";

pub trait BridgeStore {
    /// Latest snapshot written by an external actor, if any.
    fn load_snapshot(&self) -> Result<Option<BridgeSnapshot>, BridgeError>;

    /// Publish the engine's own view. Stores without readers can ignore it.
    fn publish(&self, _mirror: &SessionMirror) -> Result<(), BridgeError> {
        Ok(())
    }
}

impl<S: BridgeStore + ?Sized> BridgeStore for &S {
    fn load_snapshot(&self) -> Result<Option<BridgeSnapshot>, BridgeError> {
        (**self).load_snapshot()
    }

    fn publish(&self, mirror: &SessionMirror) -> Result<(), BridgeError> {
        (**self).publish(mirror)
    }
}

impl<S: BridgeStore + ?Sized> BridgeStore for std::rc::Rc<S> {
    fn load_snapshot(&self) -> Result<Option<BridgeSnapshot>, BridgeError> {
        (**self).load_snapshot()
    }

    fn publish(&self, mirror: &SessionMirror) -> Result<(), BridgeError> {
        (**self).publish(mirror)
    }
}

/// Directory-backed store shared between processes.
#[derive(Debug, Clone)]
pub struct FileBridgeStore {
    dir: PathBuf,
}

impl FileBridgeStore {
    /// Use `dir` as the shared location, creating it if needed.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, BridgeError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|source| BridgeError::Unavailable {
            path: dir.clone(),
            source,
        })?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write a snapshot as an external actor would.
    pub fn write_snapshot(&self, snapshot: &BridgeSnapshot) -> Result<(), BridgeError> {
        snapshot.validate()?;
        write_json(&self.dir.join(SNAPSHOT_FILE), snapshot)
    }

    /// Read back the engine's last published view.
    pub fn load_mirror(&self) -> Result<Option<SessionMirror>, BridgeError> {
        read_json(&self.dir.join(MIRROR_FILE))
    }
}

impl BridgeStore for FileBridgeStore {
    fn load_snapshot(&self) -> Result<Option<BridgeSnapshot>, BridgeError> {
        let snapshot: Option<BridgeSnapshot> = read_json(&self.dir.join(SNAPSHOT_FILE))?;
        if let Some(snapshot) = &snapshot {
            snapshot.validate()?;
        }
        Ok(snapshot)
    }

    fn publish(&self, mirror: &SessionMirror) -> Result<(), BridgeError> {
        write_json(&self.dir.join(MIRROR_FILE), mirror)
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, BridgeError> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(BridgeError::Unavailable {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    serde_json::from_str(&content)
        .map(Some)
        .map_err(|e| BridgeError::Malformed {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), BridgeError> {
    let content = serde_json::to_vec_pretty(value).map_err(|e| BridgeError::Malformed {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    let tmp = path.with_extension("json.tmp");
    let unavailable = |source: std::io::Error| BridgeError::Unavailable {
        path: path.to_path_buf(),
        source,
    };
    std::fs::write(&tmp, content).map_err(unavailable)?;
    std::fs::rename(&tmp, path).map_err(unavailable)
}

/// In-process store for tests and single-process embedding.
#[derive(Debug, Default)]
pub struct MemoryBridgeStore {
    snapshot: Cell<Option<BridgeSnapshot>>,
    mirror: RefCell<Option<SessionMirror>>,
    unavailable: Cell<bool>,
    loads: Cell<usize>,
}

impl MemoryBridgeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_snapshot(&self, snapshot: BridgeSnapshot) {
        self.snapshot.set(Some(snapshot));
    }

    pub fn clear_snapshot(&self) {
        self.snapshot.set(None);
    }

    /// Make subsequent loads fail as if the shared location were gone.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.set(unavailable);
    }

    pub fn mirror(&self) -> Option<SessionMirror> {
        self.mirror.borrow().clone()
    }

    /// Number of `load_snapshot` calls so far.
    pub fn load_count(&self) -> usize {
        self.loads.get()
    }
}

impl BridgeStore for MemoryBridgeStore {
    fn load_snapshot(&self) -> Result<Option<BridgeSnapshot>, BridgeError> {
        self.loads.set(self.loads.get() + 1);
        if self.unavailable.get() {
            return Err(BridgeError::Unavailable {
                path: PathBuf::from("memory"),
                source: std::io::Error::new(std::io::ErrorKind::NotConnected, "store offline"),
            });
        }
        let snapshot = self.snapshot.get();
        if let Some(snapshot) = &snapshot {
            snapshot.validate()?;
        }
        Ok(snapshot)
    }

    fn publish(&self, mirror: &SessionMirror) -> Result<(), BridgeError> {
        *self.mirror.borrow_mut() = Some(mirror.clone());
        Ok(())
    }
}
