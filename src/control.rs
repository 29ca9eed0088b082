//! Operational controls: maintenance flags and restart epochs

use std::collections::HashSet;
use std::path::PathBuf;

use parking_lot::Mutex;

use crate::error::{QueueError, QueueResult};

/// Flag name workers consult before polling.
pub const WORKER_FLAG: &str = "queue-worker";

/// Conventional storage key for the restart epoch, for stores that persist
/// into a shared namespace.
pub const RESTART_KEY: &str = "conveyor:restart";

/// Named on/off flags. Workers check [`WORKER_FLAG`] each loop iteration and
/// idle while it is on (unless forced).
pub trait MaintenanceSwitch: Send + Sync {
    fn is_on(&self, flag: &str) -> QueueResult<bool>;

    fn is_off(&self, flag: &str) -> QueueResult<bool> {
        Ok(!self.is_on(flag)?)
    }

    fn turn_on(&self, flag: &str) -> QueueResult<()>;

    fn turn_off(&self, flag: &str) -> QueueResult<()>;
}

/// Process-local switch.
#[derive(Default)]
pub struct InMemorySwitch {
    flags: Mutex<HashSet<String>>,
}

impl InMemorySwitch {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MaintenanceSwitch for InMemorySwitch {
    fn is_on(&self, flag: &str) -> QueueResult<bool> {
        Ok(self.flags.lock().contains(flag))
    }

    fn turn_on(&self, flag: &str) -> QueueResult<()> {
        self.flags.lock().insert(flag.to_string());
        Ok(())
    }

    fn turn_off(&self, flag: &str) -> QueueResult<()> {
        self.flags.lock().remove(flag);
        Ok(())
    }
}

/// Switch backed by marker files in a directory, so separate processes on
/// one host observe the same flags. The file content is the unix timestamp
/// the flag was raised at.
pub struct FileSwitch {
    dir: PathBuf,
}

impl FileSwitch {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, flag: &str) -> QueueResult<PathBuf> {
        let ok = !flag.is_empty()
            && flag
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !ok {
            return Err(QueueError::Config(format!("invalid flag name '{flag}'")));
        }
        Ok(self.dir.join(format!("{flag}.lock")))
    }
}

impl MaintenanceSwitch for FileSwitch {
    fn is_on(&self, flag: &str) -> QueueResult<bool> {
        Ok(self.path(flag)?.exists())
    }

    fn turn_on(&self, flag: &str) -> QueueResult<()> {
        let path = self.path(flag)?;
        std::fs::create_dir_all(&self.dir)?;
        std::fs::write(path, crate::time::current_time().to_string())?;
        Ok(())
    }

    fn turn_off(&self, flag: &str) -> QueueResult<()> {
        let path = self.path(flag)?;
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Shared restart epoch. Bumping it tells every running worker to finish
/// its current job and exit cleanly.
pub trait RestartStore: Send + Sync {
    fn get(&self) -> Option<i64>;

    fn set(&self, epoch: i64);

    /// Record "restart requested now".
    fn bump(&self) {
        self.set(crate::time::current_time());
    }
}

/// Process-local restart store, enough for tests and single-process setups.
#[derive(Default)]
pub struct InMemoryRestartStore {
    epoch: Mutex<Option<i64>>,
}

impl InMemoryRestartStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RestartStore for InMemoryRestartStore {
    fn get(&self) -> Option<i64> {
        *self.epoch.lock()
    }

    fn set(&self, epoch: i64) {
        *self.epoch.lock() = Some(epoch);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_switch_round_trips() {
        let switch = InMemorySwitch::new();
        assert!(switch.is_off(WORKER_FLAG).unwrap());
        switch.turn_on(WORKER_FLAG).unwrap();
        assert!(switch.is_on(WORKER_FLAG).unwrap());
        switch.turn_off(WORKER_FLAG).unwrap();
        assert!(switch.is_off(WORKER_FLAG).unwrap());
    }

    #[test]
    fn file_switch_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let switch = FileSwitch::new(dir.path());
        assert!(!switch.is_on("queue-worker").unwrap());
        switch.turn_on("queue-worker").unwrap();
        assert!(switch.is_on("queue-worker").unwrap());
        // Turning off twice is fine.
        switch.turn_off("queue-worker").unwrap();
        switch.turn_off("queue-worker").unwrap();
        assert!(!switch.is_on("queue-worker").unwrap());
    }

    #[test]
    fn file_switch_rejects_path_tricks() {
        let switch = FileSwitch::new("/tmp/flags");
        assert!(switch.is_on("../etc/passwd").is_err());
        assert!(switch.turn_on("a/b").is_err());
    }

    #[test]
    fn restart_store_bumps_forward() {
        let store = InMemoryRestartStore::new();
        assert_eq!(store.get(), None);
        store.bump();
        let first = store.get().unwrap();
        store.set(first + 10);
        assert_eq!(store.get(), Some(first + 10));
    }
}
