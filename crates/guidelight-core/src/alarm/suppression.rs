// ── Durable alarm suppression ──
//
// One deadline, persisted as an epoch-millisecond string. Every store
// opened on the same file, in this process or another, sees writes
// through its `watch` channel.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use notify::RecommendedWatcher;
use tokio::sync::watch;
use tracing::{debug, warn};

use super::file_watch::watch_file;
use crate::error::CoreError;

type Deadline = Option<DateTime<Utc>>;

/// Durable storage for the suppression deadline.
pub trait SuppressionStore: Send + Sync + 'static {
    /// Current deadline, if any. Expired deadlines are still returned.
    fn suppressed_until(&self) -> Result<Option<DateTime<Utc>>, CoreError>;

    fn set_suppressed_until(&self, until: DateTime<Utc>) -> Result<(), CoreError>;

    fn clear(&self) -> Result<(), CoreError>;

    /// Observe changes to the stored deadline.
    fn subscribe(&self) -> watch::Receiver<Option<DateTime<Utc>>>;

    /// `true` while `now` is before the stored deadline.
    fn is_suppressed_at(&self, now: DateTime<Utc>) -> Result<bool, CoreError> {
        Ok(self.suppressed_until()?.is_some_and(|until| now < until))
    }
}

// ── File store ───────────────────────────────────────────────────────

/// Deadline kept in a single file, watched for writes by other handles.
pub struct FileSuppressionStore {
    path: PathBuf,
    changes: Arc<watch::Sender<Deadline>>,
    /// Serializes read-modify-write of the file within this process.
    io: Mutex<()>,
    /// `None` when the platform refused a watch; reads still resync.
    _watcher: Option<RecommendedWatcher>,
}

impl FileSuppressionStore {
    /// Open (or lazily create) the store at `path`.
    ///
    /// Creates the parent directory so it can be watched right away.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, CoreError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| CoreError::Storage {
                path: path.clone(),
                source,
            })?;
        }
        let initial = read_deadline(&path)?;
        let changes = Arc::new(watch::channel(initial).0);

        let watched = Arc::clone(&changes);
        let file = path.clone();
        let watcher = watch_file(&path, move || match read_deadline(&file) {
            Ok(deadline) => publish(&watched, deadline),
            Err(e) => warn!(error = %e, "could not reload suppression deadline"),
        });
        let watcher = match watcher {
            Ok(watcher) => Some(watcher),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "suppression file not watched, other processes seen on read only");
                None
            }
        };

        debug!(path = %path.display(), deadline = ?initial, "opened suppression store");
        Ok(Self {
            path,
            changes,
            io: Mutex::new(()),
            _watcher: watcher,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn storage_error(&self, source: std::io::Error) -> CoreError {
        CoreError::Storage {
            path: self.path.clone(),
            source,
        }
    }
}

/// Wake watchers only when the deadline actually moved.
fn publish(changes: &watch::Sender<Deadline>, deadline: Deadline) {
    changes.send_if_modified(|current| {
        let changed = *current != deadline;
        *current = deadline;
        changed
    });
}

impl SuppressionStore for FileSuppressionStore {
    fn suppressed_until(&self) -> Result<Option<DateTime<Utc>>, CoreError> {
        let _io = self.io.lock().unwrap_or_else(PoisonError::into_inner);
        let deadline = read_deadline(&self.path)?;
        // Covers writes the watcher has not reported yet.
        publish(&self.changes, deadline);
        Ok(deadline)
    }

    fn set_suppressed_until(&self, until: DateTime<Utc>) -> Result<(), CoreError> {
        {
            let _io = self.io.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(parent) = self.path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| self.storage_error(e))?;
            }
            // Write-then-rename keeps readers from seeing a torn value.
            let staging = self.path.with_extension("tmp");
            std::fs::write(&staging, until.timestamp_millis().to_string())
                .map_err(|e| self.storage_error(e))?;
            std::fs::rename(&staging, &self.path).map_err(|e| self.storage_error(e))?;
        }
        publish(&self.changes, Some(until));
        Ok(())
    }

    fn clear(&self) -> Result<(), CoreError> {
        {
            let _io = self.io.lock().unwrap_or_else(PoisonError::into_inner);
            match std::fs::remove_file(&self.path) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(self.storage_error(e)),
            }
        }
        publish(&self.changes, None);
        Ok(())
    }

    fn subscribe(&self) -> watch::Receiver<Option<DateTime<Utc>>> {
        self.changes.subscribe()
    }
}

/// Missing file means no deadline; an unparseable one is ignored.
fn read_deadline(path: &Path) -> Result<Option<DateTime<Utc>>, CoreError> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(CoreError::Storage {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    let parsed = raw
        .trim()
        .parse::<i64>()
        .ok()
        .and_then(DateTime::from_timestamp_millis);
    if parsed.is_none() {
        warn!(path = %path.display(), value = raw.trim(), "ignoring malformed suppression deadline");
    }
    Ok(parsed)
}

// ── Memory store ─────────────────────────────────────────────────────

/// Non-durable store, shared by handing out clones of an `Arc`.
pub struct MemorySuppressionStore {
    changes: watch::Sender<Option<DateTime<Utc>>>,
}

impl MemorySuppressionStore {
    pub fn new() -> Self {
        let (changes, _) = watch::channel(None);
        Self { changes }
    }
}

impl Default for MemorySuppressionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SuppressionStore for MemorySuppressionStore {
    fn suppressed_until(&self) -> Result<Option<DateTime<Utc>>, CoreError> {
        Ok(*self.changes.borrow())
    }

    fn set_suppressed_until(&self, until: DateTime<Utc>) -> Result<(), CoreError> {
        self.changes.send_replace(Some(until));
        Ok(())
    }

    fn clear(&self) -> Result<(), CoreError> {
        self.changes.send_if_modified(|current| current.take().is_some());
        Ok(())
    }

    fn subscribe(&self) -> watch::Receiver<Option<DateTime<Utc>>> {
        self.changes.subscribe()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use chrono::TimeDelta;

    use super::*;

    #[test]
    fn file_store_persists_epoch_millis() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alarm").join("suppressed_until");
        let store = FileSuppressionStore::open(&path).unwrap();
        assert_eq!(store.suppressed_until().unwrap(), None);

        let until = DateTime::from_timestamp_millis(1_767_225_600_123).unwrap();
        store.set_suppressed_until(until).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "1767225600123");

        // A second handle on the same file sees the value.
        let reopened = FileSuppressionStore::open(&path).unwrap();
        assert_eq!(reopened.suppressed_until().unwrap(), Some(until));

        store.clear().unwrap();
        assert!(!path.exists());
        assert_eq!(reopened.suppressed_until().unwrap(), None);
    }

    #[tokio::test]
    async fn file_store_sees_writes_from_another_handle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alarm").join("suppressed_until");
        let writer = FileSuppressionStore::open(&path).unwrap();
        let reader = FileSuppressionStore::open(&path).unwrap();
        let mut rx = reader.subscribe();

        let until = Utc::now() + TimeDelta::minutes(5);
        let until = DateTime::from_timestamp_millis(until.timestamp_millis()).unwrap();
        writer.set_suppressed_until(until).unwrap();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|d| *d == Some(until)))
            .await
            .unwrap()
            .unwrap();

        writer.clear().unwrap();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(Option::is_none))
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn file_store_ignores_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("suppressed_until");
        std::fs::write(&path, "not-a-number").unwrap();

        let store = FileSuppressionStore::open(&path).unwrap();
        assert_eq!(store.suppressed_until().unwrap(), None);
    }

    #[test]
    fn writes_are_observable() {
        let store = MemorySuppressionStore::new();
        let mut rx = store.subscribe();
        let until = Utc::now() + TimeDelta::minutes(2);

        store.set_suppressed_until(until).unwrap();
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), Some(until));

        store.clear().unwrap();
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), None);

        // Clearing twice does not wake watchers again.
        store.clear().unwrap();
        assert!(!rx.has_changed().unwrap());
    }

    #[test]
    fn suppression_is_exclusive_of_the_deadline() {
        let store = MemorySuppressionStore::new();
        let until = Utc::now() + TimeDelta::seconds(10);
        store.set_suppressed_until(until).unwrap();

        assert!(store.is_suppressed_at(until - TimeDelta::milliseconds(1)).unwrap());
        assert!(!store.is_suppressed_at(until).unwrap());
    }
}
