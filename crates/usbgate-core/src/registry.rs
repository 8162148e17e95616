//! Append-only set of authorized device identifiers backed by a JSON store.
//!
//! The registry only ever grows: load, remote merge and manual authorization
//! all funnel through [`Registry::merge`]. Several processes may share one
//! store (the daemon and the operator CLI), so every write first folds in
//! whatever is already on disk under an advisory lock, and [`Registry::reload`]
//! picks up entries persisted by others. A failed write is logged and the
//! in-memory set stays authoritative for the rest of the process lifetime.

use crate::device::DeviceId;
use crate::error::{GateError, GateResult};
use log::{debug, info, warn};
use std::collections::HashSet;
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::SystemTime;
use tempfile::NamedTempFile;

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

/// Modification time and length of the store as last read or written.
type StoreStamp = (SystemTime, u64);

#[derive(Debug)]
pub struct Registry {
    store_path: PathBuf,
    entries: Mutex<Entries>,
}

#[derive(Debug, Default)]
struct Entries {
    ids: Vec<DeviceId>,
    seen: HashSet<DeviceId>,
    stamp: Option<StoreStamp>,
}

impl Entries {
    fn insert(&mut self, id: DeviceId) -> bool {
        if !self.seen.insert(id.clone()) {
            return false;
        }
        self.ids.push(id);
        true
    }

    /// Fold the on-disk store into memory; returns how many ids were new.
    fn absorb_store(&mut self, store_path: &Path) -> usize {
        match read_store(store_path) {
            Ok(persisted) => persisted.into_iter().filter(|id| self.insert(id.clone())).count(),
            Err(GateError::Io(err)) if err.kind() == ErrorKind::NotFound => 0,
            Err(err) => {
                warn!("{err}; ignoring on-disk entries");
                0
            }
        }
    }
}

impl Registry {
    /// Load the registry persisted at `store_path`.
    ///
    /// A missing or unreadable store yields an empty registry; the gate then
    /// relies on remote sync or manual authorization to seed it.
    pub fn load(store_path: impl Into<PathBuf>) -> Self {
        let store_path = store_path.into();
        let mut entries = Entries {
            stamp: store_stamp(&store_path),
            ..Entries::default()
        };
        match read_store(&store_path) {
            Ok(ids) => {
                for id in ids {
                    entries.insert(id);
                }
                info!(
                    "loaded {} authorized device(s) from {}",
                    entries.ids.len(),
                    store_path.display()
                );
            }
            Err(GateError::Io(err)) if err.kind() == ErrorKind::NotFound => {
                info!(
                    "registry store {} not found; starting empty",
                    store_path.display()
                );
            }
            Err(err) => warn!("{err}; starting with an empty registry"),
        }

        Self {
            store_path,
            entries: Mutex::new(entries),
        }
    }

    pub fn store_path(&self) -> &Path {
        &self.store_path
    }

    pub fn contains(&self, id: &DeviceId) -> bool {
        self.guard().seen.contains(id)
    }

    /// Returns true when any of `present` is authorized.
    pub fn intersects<'a, I>(&self, present: I) -> bool
    where
        I: IntoIterator<Item = &'a DeviceId>,
    {
        let entries = self.guard();
        present.into_iter().any(|id| entries.seen.contains(id))
    }

    /// Union `incoming` into the registry, persisting when anything was added.
    ///
    /// Returns whether `incoming` added anything. Merging the same set twice
    /// is a no-op the second time. Entries another process persisted in the
    /// meantime are kept in the rewritten store.
    pub fn merge<I>(&self, incoming: I) -> bool
    where
        I: IntoIterator<Item = DeviceId>,
    {
        let mut entries = self.guard();
        let mut added = 0;
        for id in incoming {
            debug!("authorizing device {id}");
            if entries.insert(id) {
                added += 1;
            }
        }
        if added == 0 {
            return false;
        }

        let _lock = match lock_store(&self.store_path) {
            Ok(lock) => Some(lock),
            Err(err) => {
                warn!("writing registry without a store lock: {err}");
                None
            }
        };
        let external = entries.absorb_store(&self.store_path);
        if external > 0 {
            info!("picked up {external} device(s) persisted by another process");
        }

        info!("registry gained {added} device(s); {} total", entries.ids.len());
        match write_store(&self.store_path, &entries.ids) {
            Ok(()) => entries.stamp = store_stamp(&self.store_path),
            Err(err) => warn!(
                "failed to persist registry to {}: {err}; keeping in-memory copy",
                self.store_path.display()
            ),
        }
        true
    }

    /// Pick up entries another process persisted since the last read or write.
    ///
    /// Cheap when the store is unchanged: only its metadata is consulted.
    pub fn reload(&self) -> bool {
        let mut entries = self.guard();
        let stamp = store_stamp(&self.store_path);
        if stamp.is_none() || stamp == entries.stamp {
            return false;
        }
        let added = entries.absorb_store(&self.store_path);
        entries.stamp = stamp;
        if added > 0 {
            info!(
                "registry store {} gained {added} device(s) from another process",
                self.store_path.display()
            );
        }
        added > 0
    }

    /// Ordered copy of the current identifiers.
    pub fn snapshot(&self) -> Vec<DeviceId> {
        self.guard().ids.clone()
    }

    pub fn len(&self) -> usize {
        self.guard().ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.guard().ids.is_empty()
    }

    fn guard(&self) -> MutexGuard<'_, Entries> {
        // The set is only ever appended to, so a poisoned guard still holds a usable list.
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Parse the store, normalising entries and dropping duplicates and blanks.
fn read_store(path: &Path) -> GateResult<Vec<DeviceId>> {
    let contents = fs::read_to_string(path)?;
    let raw: Vec<String> = serde_json::from_str(&contents).map_err(|err| GateError::Store {
        path: path.to_path_buf(),
        reason: err.to_string(),
    })?;

    let mut seen = HashSet::new();
    let mut ids = Vec::with_capacity(raw.len());
    for entry in raw {
        match DeviceId::new(&entry) {
            Some(id) => {
                if seen.insert(id.clone()) {
                    ids.push(id);
                }
            }
            None => debug!("skipping blank registry entry {entry:?}"),
        }
    }
    Ok(ids)
}

fn store_stamp(path: &Path) -> Option<StoreStamp> {
    let meta = fs::metadata(path).ok()?;
    Some((meta.modified().ok()?, meta.len()))
}

fn store_dir(path: &Path) -> &Path {
    path.parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
}

/// Exclusive advisory lock on `<store>.lock`, released when dropped.
struct StoreLock {
    _file: File,
}

fn lock_store(store_path: &Path) -> GateResult<StoreLock> {
    fs::create_dir_all(store_dir(store_path))?;
    let mut lock_path = OsString::from(store_path.as_os_str());
    lock_path.push(".lock");
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(PathBuf::from(lock_path))?;

    #[cfg(unix)]
    {
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
        if rc != 0 {
            return Err(GateError::Io(std::io::Error::last_os_error()));
        }
    }

    Ok(StoreLock { _file: file })
}

fn write_store(path: &Path, ids: &[DeviceId]) -> GateResult<()> {
    let parent = store_dir(path);
    fs::create_dir_all(parent)?;

    let payload = serde_json::to_vec_pretty(ids)?;
    let mut temp = NamedTempFile::new_in(parent)?;
    temp.as_file_mut().write_all(&payload)?;
    temp.as_file_mut().flush()?;
    let _ = temp.as_file().sync_all();
    temp.persist(path).map_err(|err| GateError::Io(err.error))?;
    Ok(())
}
