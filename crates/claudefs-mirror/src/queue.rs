//! Directories eligible for mirroring.

use std::collections::VecDeque;

/// Round-robin list of mirrored directory paths.
///
/// Every pick rotates the list by one so that no directory starves others,
/// regardless of which candidate was chosen.
#[derive(Debug, Default)]
pub struct DirectoryQueue {
    dirs: VecDeque<String>,
}

impl DirectoryQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a directory. Returns false if it was already queued.
    pub fn add(&mut self, dir: &str) -> bool {
        if self.contains(dir) {
            return false;
        }
        self.dirs.push_back(dir.to_string());
        true
    }

    /// Removes a directory. Returns false if it was not queued.
    pub fn remove(&mut self, dir: &str) -> bool {
        match self.dirs.iter().position(|d| d == dir) {
            Some(idx) => {
                self.dirs.remove(idx);
                true
            }
            None => false,
        }
    }

    /// Returns true if the directory is queued.
    pub fn contains(&self, dir: &str) -> bool {
        self.dirs.iter().any(|d| d == dir)
    }

    /// Number of queued directories.
    pub fn len(&self) -> usize {
        self.dirs.len()
    }

    /// Returns true if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.dirs.is_empty()
    }

    /// Queued directories in current rotation order.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.dirs.iter().map(String::as_str)
    }

    /// Returns the first directory accepted by `eligible`, then rotates by one.
    pub fn pick<F>(&mut self, mut eligible: F) -> Option<String>
    where
        F: FnMut(&str) -> bool,
    {
        let candidate = self.dirs.iter().find(|d| eligible(d.as_str())).cloned();
        if !self.dirs.is_empty() {
            self.dirs.rotate_left(1);
        }
        candidate
    }
}
