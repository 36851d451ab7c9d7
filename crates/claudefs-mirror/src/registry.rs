//! Per-directory exclusive registrations and the workers that hold them.

use crate::error::{MirrorError, MirrorResult};
use crate::fs::DirFd;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A member of the replayer's worker pool.
///
/// The cancellation flag is scoped to the directory the worker currently
/// holds: `remove_directory` raises it, releasing the registration clears it.
#[derive(Debug)]
pub struct Worker {
    id: usize,
    name: String,
    canceled: AtomicBool,
}

impl Worker {
    /// Creates worker `id`, named `replayer-<id>`.
    pub fn new(id: usize) -> Self {
        Self {
            id,
            name: format!("replayer-{}", id),
            canceled: AtomicBool::new(false),
        }
    }

    /// Worker index within the pool.
    pub fn id(&self) -> usize {
        self.id
    }

    /// Thread name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Requests cooperative cancellation of the current directory.
    pub fn cancel(&self) {
        self.canceled.store(true, Ordering::SeqCst);
    }

    /// Returns true if cancellation was requested.
    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }

    /// Clears a pending cancellation.
    pub fn reset_cancel(&self) {
        self.canceled.store(false, Ordering::SeqCst);
    }
}

/// A live claim on a directory: the remote directory handle plus its owner.
#[derive(Debug, Clone)]
pub struct DirRegistration {
    /// Open descriptor of the remote directory.
    pub fd: DirFd,
    /// Worker holding the directory.
    pub worker: Arc<Worker>,
}

/// Map of directories currently being synchronized.
#[derive(Debug, Default)]
pub struct DirectoryRegistry {
    entries: HashMap<String, DirRegistration>,
}

impl DirectoryRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if some worker holds the directory.
    pub fn is_registered(&self, dir: &str) -> bool {
        self.entries.contains_key(dir)
    }

    /// Inserts a registration; fails if the directory is already held.
    pub fn register(&mut self, dir: &str, registration: DirRegistration) -> MirrorResult<()> {
        if self.entries.contains_key(dir) {
            return Err(MirrorError::AlreadyRegistered {
                dir: dir.to_string(),
            });
        }
        self.entries.insert(dir.to_string(), registration);
        Ok(())
    }

    /// Removes and returns a registration.
    pub fn unregister(&mut self, dir: &str) -> Option<DirRegistration> {
        self.entries.remove(dir)
    }

    /// Looks up a registration.
    pub fn get(&self, dir: &str) -> Option<&DirRegistration> {
        self.entries.get(dir)
    }

    /// Cancels the worker holding `dir`. Returns false if nobody holds it.
    pub fn cancel(&self, dir: &str) -> bool {
        match self.entries.get(dir) {
            Some(reg) => {
                reg.worker.cancel();
                true
            }
            None => false,
        }
    }

    /// Number of held directories.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is held.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Held directories, sorted.
    pub fn directories(&self) -> Vec<String> {
        let mut dirs: Vec<String> = self.entries.keys().cloned().collect();
        dirs.sort();
        dirs
    }
}
