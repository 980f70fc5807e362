// ── Cross-process coordination ──
//
// Advisory file locks stand in for the named lock and an append-only
// JSON-lines file stands in for the bus. Every coordinator opened on the
// same directory shares both, whichever process it lives in.

use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, ErrorKind, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use fs4::fs_std::FileExt;
use notify::RecommendedWatcher;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use super::bus::{AlarmBroadcast, BUS_CHANNEL_SIZE, Lease, SingletonResourceCoordinator};
use super::file_watch::watch_file;
use crate::error::CoreError;

const BUS_FILE: &str = "alarm-bus.jsonl";

/// A bus file past this size is emptied when a coordinator opens it.
const BUS_COMPACT_BYTES: u64 = 1024 * 1024;

#[derive(Debug, Serialize, Deserialize)]
struct BusLine {
    /// Coordinator instance that appended the line.
    from: Uuid,
    message: AlarmBroadcast,
}

/// Coordinator shared by every process that opens the same directory.
///
/// Locks live in `<dir>/<name>.lock`; a lease holds the open, locked file
/// and the OS releases it when the lease drops or the process dies.
/// Broadcasts reach local subscribers at once and other processes once
/// their watcher sees the appended line.
pub struct FileCoordinator {
    dir: PathBuf,
    bus_path: PathBuf,
    instance: Uuid,
    bus: broadcast::Sender<AlarmBroadcast>,
    _watcher: RecommendedWatcher,
}

impl FileCoordinator {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, CoreError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|source| CoreError::Storage {
            path: dir.clone(),
            source,
        })?;

        let bus_path = dir.join(BUS_FILE);
        let offset = compact(&bus_path).map_err(|source| CoreError::Storage {
            path: bus_path.clone(),
            source,
        })?;

        let instance = Uuid::new_v4();
        let (bus, _) = broadcast::channel(BUS_CHANNEL_SIZE);
        let tail = Mutex::new(BusTail {
            path: bus_path.clone(),
            offset,
            instance,
            bus: bus.clone(),
        });
        let watcher = watch_file(&bus_path, move || {
            let mut tail = tail.lock().unwrap_or_else(PoisonError::into_inner);
            if let Err(e) = tail.drain() {
                warn!(path = %tail.path.display(), error = %e, "could not read alarm bus");
            }
        })
        .map_err(|e| CoreError::Storage {
            path: bus_path.clone(),
            source: io::Error::other(e),
        })?;

        debug!(dir = %dir.display(), %instance, "opened file coordinator");
        Ok(Self {
            dir,
            bus_path,
            instance,
            bus,
            _watcher: watcher,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn lock_path(&self, name: &str) -> Result<PathBuf, CoreError> {
        let valid = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
            && !name.starts_with('.');
        if !valid {
            return Err(CoreError::LockUnavailable {
                name: name.into(),
                reason: "lock names may only contain letters, digits, '-', '_' and '.'".into(),
            });
        }
        Ok(self.dir.join(format!("{name}.lock")))
    }

    fn append(&self, message: AlarmBroadcast) -> io::Result<()> {
        let mut line = serde_json::to_vec(&BusLine {
            from: self.instance,
            message,
        })?;
        line.push(b'\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.bus_path)?;
        // One write per line so appends from several processes never interleave.
        file.write_all(&line)
    }
}

impl SingletonResourceCoordinator for FileCoordinator {
    fn try_acquire(&self, name: &str) -> Result<Option<Lease>, CoreError> {
        let path = self.lock_path(name)?;
        let unavailable = |e: io::Error| CoreError::LockUnavailable {
            name: name.into(),
            reason: format!("{}: {e}", path.display()),
        };

        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(unavailable)?;
        match file.try_lock_exclusive() {
            Ok(true) => {
                trace!(lock = name, "acquired file lock");
                Ok(Some(Lease::new(name, file)))
            }
            Ok(false) => Ok(None),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(unavailable(e)),
        }
    }

    fn broadcast(&self, message: AlarmBroadcast) {
        // No local subscribers is fine.
        let _ = self.bus.send(message.clone());
        if let Err(e) = self.append(message) {
            warn!(path = %self.bus_path.display(), error = %e, "could not append to alarm bus");
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<AlarmBroadcast> {
        self.bus.subscribe()
    }
}

/// Empty an oversized bus file. Returns the offset to start tailing from.
fn compact(path: &Path) -> io::Result<u64> {
    let len = match std::fs::metadata(path) {
        Ok(meta) => meta.len(),
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };
    if len <= BUS_COMPACT_BYTES {
        return Ok(len);
    }
    debug!(path = %path.display(), len, "compacting alarm bus");
    OpenOptions::new().write(true).open(path)?.set_len(0)?;
    Ok(0)
}

// ── Tailing ──────────────────────────────────────────────────────────

struct BusTail {
    path: PathBuf,
    offset: u64,
    instance: Uuid,
    bus: broadcast::Sender<AlarmBroadcast>,
}

impl BusTail {
    /// Relay every complete line past `offset` written by another instance.
    fn drain(&mut self) -> io::Result<()> {
        let mut file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                self.offset = 0;
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        if file.metadata()?.len() < self.offset {
            // Compacted by another process.
            self.offset = 0;
        }
        file.seek(SeekFrom::Start(self.offset))?;

        let mut reader = BufReader::new(file);
        let mut line = String::new();
        loop {
            line.clear();
            let read = reader.read_line(&mut line)?;
            // A line without its newline is still being written.
            if read == 0 || !line.ends_with('\n') {
                return Ok(());
            }
            self.offset = self
                .offset
                .saturating_add(u64::try_from(read).unwrap_or(u64::MAX));

            match serde_json::from_str::<BusLine>(line.trim_end()) {
                Ok(entry) if entry.from == self.instance => {}
                Ok(entry) => {
                    let _ = self.bus.send(entry.message);
                }
                Err(e) => warn!(error = %e, "skipping malformed alarm bus line"),
            }
        }
    }
}
