//! Mirrors the contents of one local snapshot into the remote directory.
//!
//! The walk is iterative over an explicit stack of [`SyncEntry`] cursors.
//! A level's directory stream stays open only while that level is visited.
//! On entering a level, remote entries that vanished locally or changed type
//! are purged before local entries are applied. The backoff check runs
//! before every step, so cancellation latency is bounded by one entry.

use crate::error::{MirrorError, MirrorResult};
use crate::fs::{join_path, DirStream, FilesystemClient, Stat, SNAP_DIR};
use std::io::{self, Read, Write};
use tracing::debug;

/// Preflight invoked before every walk step.
pub type BackoffCheck<'a> = dyn Fn() -> MirrorResult<()> + 'a;

/// Counters for one tree walk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TreeSyncStats {
    /// Regular files whose data was transferred.
    pub files_copied: u64,
    /// Regular files skipped because size and mtime matched.
    pub files_skipped: u64,
    /// File data bytes transferred.
    pub bytes_copied: u64,
    /// Remote directories created.
    pub dirs_created: u64,
    /// Remote entries removed because they vanished locally or changed type.
    pub entries_purged: u64,
    /// Symlinks created or recreated.
    pub symlinks_created: u64,
    /// Fifos, sockets and device nodes created or recreated.
    pub nodes_created: u64,
}

impl TreeSyncStats {
    /// Adds another walk's counters to this one.
    pub fn merge(&mut self, other: &TreeSyncStats) {
        self.files_copied += other.files_copied;
        self.files_skipped += other.files_skipped;
        self.bytes_copied += other.bytes_copied;
        self.dirs_created += other.dirs_created;
        self.entries_purged += other.entries_purged;
        self.symlinks_created += other.symlinks_created;
        self.nodes_created += other.nodes_created;
    }
}

/// Tree-walk cursor: a path relative to the synchronized root, the open
/// listing of that directory (if it is one being visited) and its local stat.
pub struct SyncEntry {
    /// Path relative to the root; "" is the root itself.
    pub epath: String,
    /// Open listing, present once the level has been entered.
    pub dirp: Option<Box<dyn DirStream>>,
    /// Local attributes.
    pub stat: Stat,
}

impl SyncEntry {
    fn new(epath: String, stat: Stat) -> Self {
        Self {
            epath,
            dirp: None,
            stat,
        }
    }

    fn is_directory(&self) -> bool {
        self.stat.is_dir()
    }

    fn needs_opendir(&self) -> bool {
        self.dirp.is_none()
    }
}

/// Applies the contents of a local snapshot to the remote directory.
pub struct FileTreeSynchronizer<'a> {
    local: &'a dyn FilesystemClient,
    remote: &'a dyn FilesystemClient,
    buffer_size: usize,
    backoff: &'a BackoffCheck<'a>,
    stats: TreeSyncStats,
}

impl<'a> FileTreeSynchronizer<'a> {
    /// Creates a synchronizer streaming file data in `buffer_size` chunks.
    pub fn new(
        local: &'a dyn FilesystemClient,
        remote: &'a dyn FilesystemClient,
        buffer_size: usize,
        backoff: &'a BackoffCheck<'a>,
    ) -> Self {
        Self {
            local,
            remote,
            buffer_size: buffer_size.max(1),
            backoff,
            stats: TreeSyncStats::default(),
        }
    }

    /// Mirrors snapshot `snap_name` of local `dir` into remote `dir`.
    pub fn do_synchronize(mut self, dir: &str, snap_name: &str) -> MirrorResult<TreeSyncStats> {
        let local_root = self.local.snapshot_path(dir, snap_name);
        let root_stat = self
            .local
            .stat(&local_root)
            .map_err(|e| MirrorError::fs("stat", local_root.as_str(), e))?;
        if !root_stat.is_dir() {
            return Err(MirrorError::InvalidSnapshot {
                dir: dir.to_string(),
                snap: snap_name.to_string(),
                reason: "snapshot root is not a directory".to_string(),
            });
        }
        self.remote_mkdir(&root_stat, dir)?;

        let mut stack = vec![SyncEntry::new(String::new(), root_stat)];
        while let Some(entry) = stack.last_mut() {
            (self.backoff)()?;

            if !entry.is_directory() {
                if let Some(file) = stack.pop() {
                    self.remote_file_op(
                        &join_path(&local_root, &file.epath),
                        &join_path(dir, &file.epath),
                        &file.stat,
                    )?;
                }
                continue;
            }

            if entry.needs_opendir() {
                let local_path = join_path(&local_root, &entry.epath);
                let remote_path = join_path(dir, &entry.epath);
                self.purge_stale_entries(&local_path, &remote_path)?;
                let stream = self
                    .local
                    .read_dir(&local_path)
                    .map_err(|e| MirrorError::fs("read_dir", local_path.as_str(), e))?;
                entry.dirp = Some(stream);
            }

            let next = match entry.dirp.as_mut() {
                Some(stream) => stream.next_entry().map_err(|e| {
                    MirrorError::fs("read_dir", join_path(&local_root, &entry.epath), e)
                })?,
                None => None,
            };

            match next {
                Some(child) => {
                    let epath = join_path(&entry.epath, &child.name);
                    if child.stat.is_dir() {
                        self.remote_mkdir(&child.stat, &join_path(dir, &epath))?;
                    }
                    stack.push(SyncEntry::new(epath, child.stat));
                }
                None => {
                    // Children updates move the remote mtime; restore it once the level is done.
                    if let Some(done) = stack.pop() {
                        let remote_path = join_path(dir, &done.epath);
                        self.remote
                            .set_attrs(&remote_path, &done.stat.attrs())
                            .map_err(|e| MirrorError::fs("set_attrs", remote_path, e))?;
                    }
                }
            }
        }

        debug!(
            dir = %dir,
            snap = %snap_name,
            files_copied = self.stats.files_copied,
            files_skipped = self.stats.files_skipped,
            bytes_copied = self.stats.bytes_copied,
            dirs_created = self.stats.dirs_created,
            entries_purged = self.stats.entries_purged,
            "tree synchronized"
        );
        Ok(self.stats)
    }

    /// Creates a remote directory (an existing one is fine) and copies attributes onto it.
    pub fn remote_mkdir(&mut self, stat: &Stat, remote_path: &str) -> MirrorResult<()> {
        match self.remote.mkdir(remote_path, stat.mode) {
            Ok(()) => {
                self.stats.dirs_created += 1;
                debug!(path = %remote_path, "created remote directory");
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(MirrorError::fs("mkdir", remote_path, e)),
        }
        self.remote
            .set_attrs(remote_path, &stat.attrs())
            .map_err(|e| MirrorError::fs("set_attrs", remote_path, e))
    }

    /// Brings one non-directory remote entry in line with its local counterpart.
    ///
    /// Regular files are streamed; symlinks and special nodes are recreated.
    pub fn remote_file_op(
        &mut self,
        local_path: &str,
        remote_path: &str,
        stat: &Stat,
    ) -> MirrorResult<()> {
        if stat.is_file() {
            match self.remote_stat(remote_path)? {
                Some(rstat) if rstat.data_matches(stat) => {
                    self.stats.files_skipped += 1;
                    if !rstat.attrs_match(stat) {
                        self.remote
                            .set_attrs(remote_path, &stat.attrs())
                            .map_err(|e| MirrorError::fs("set_attrs", remote_path, e))?;
                    }
                    Ok(())
                }
                _ => self.remote_copy(local_path, remote_path, stat),
            }
        } else if stat.is_symlink() {
            let target = self
                .local
                .readlink(local_path)
                .map_err(|e| MirrorError::fs("readlink", local_path, e))?;
            if let Some(rstat) = self.remote_stat(remote_path)? {
                if rstat.is_symlink() {
                    let current = self
                        .remote
                        .readlink(remote_path)
                        .map_err(|e| MirrorError::fs("readlink", remote_path, e))?;
                    if current == target {
                        return Ok(());
                    }
                }
                self.remote
                    .unlink(remote_path)
                    .map_err(|e| MirrorError::fs("unlink", remote_path, e))?;
            }
            self.remote
                .symlink(&target, remote_path)
                .map_err(|e| MirrorError::fs("symlink", remote_path, e))?;
            self.stats.symlinks_created += 1;
            self.remote
                .set_attrs(remote_path, &stat.attrs())
                .map_err(|e| MirrorError::fs("set_attrs", remote_path, e))
        } else {
            match self.remote_stat(remote_path)? {
                Some(rstat) if rstat.node_matches(stat) => {
                    if !rstat.attrs_match(stat) {
                        self.remote
                            .set_attrs(remote_path, &stat.attrs())
                            .map_err(|e| MirrorError::fs("set_attrs", remote_path, e))?;
                    }
                    return Ok(());
                }
                Some(_) => self
                    .remote
                    .unlink(remote_path)
                    .map_err(|e| MirrorError::fs("unlink", remote_path, e))?,
                None => {}
            }
            self.remote
                .mknod(remote_path, stat.file_type, stat.mode, stat.rdev)
                .map_err(|e| MirrorError::fs("mknod", remote_path, e))?;
            self.stats.nodes_created += 1;
            debug!(path = %remote_path, file_type = ?stat.file_type, "created special node");
            self.remote
                .set_attrs(remote_path, &stat.attrs())
                .map_err(|e| MirrorError::fs("set_attrs", remote_path, e))
        }
    }

    /// Streams a regular file to the remote side, then applies its attributes.
    pub fn remote_copy(
        &mut self,
        local_path: &str,
        remote_path: &str,
        stat: &Stat,
    ) -> MirrorResult<()> {
        let mut reader = self
            .local
            .open_read(local_path)
            .map_err(|e| MirrorError::fs("open_read", local_path, e))?;
        let mut writer = self
            .remote
            .create_file(remote_path, stat.mode)
            .map_err(|e| MirrorError::fs("create_file", remote_path, e))?;

        let mut buf = vec![0u8; self.buffer_size];
        let mut copied = 0u64;
        loop {
            let n = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(MirrorError::fs("read", local_path, e)),
            };
            writer
                .write_all(&buf[..n])
                .map_err(|e| MirrorError::fs("write", remote_path, e))?;
            copied += n as u64;
        }
        writer
            .flush()
            .map_err(|e| MirrorError::fs("write", remote_path, e))?;
        drop(writer);

        self.remote
            .set_attrs(remote_path, &stat.attrs())
            .map_err(|e| MirrorError::fs("set_attrs", remote_path, e))?;
        self.stats.files_copied += 1;
        self.stats.bytes_copied += copied;
        debug!(path = %remote_path, bytes = copied, "copied file");
        Ok(())
    }

    /// Removes a remote subtree, deepest entries first.
    pub fn cleanup_remote_dir(&mut self, remote_path: &str) -> MirrorResult<()> {
        let mut stack: Vec<(String, Option<Box<dyn DirStream>>)> =
            vec![(remote_path.to_string(), None)];
        while let Some((path, dirp)) = stack.last_mut() {
            (self.backoff)()?;

            if dirp.is_none() {
                let stream = self
                    .remote
                    .read_dir(path)
                    .map_err(|e| MirrorError::fs("read_dir", path.as_str(), e))?;
                *dirp = Some(stream);
            }
            let next = match dirp.as_mut() {
                Some(stream) => stream
                    .next_entry()
                    .map_err(|e| MirrorError::fs("read_dir", path.as_str(), e))?,
                None => None,
            };

            match next {
                Some(child) => {
                    let child_path = join_path(path, &child.name);
                    if child.stat.is_dir() {
                        stack.push((child_path, None));
                    } else {
                        self.remote
                            .unlink(&child_path)
                            .map_err(|e| MirrorError::fs("unlink", child_path.as_str(), e))?;
                        self.stats.entries_purged += 1;
                    }
                }
                None => {
                    if let Some((done, stream)) = stack.pop() {
                        drop(stream);
                        self.remote
                            .rmdir(&done)
                            .map_err(|e| MirrorError::fs("rmdir", done.as_str(), e))?;
                        self.stats.entries_purged += 1;
                    }
                }
            }
        }
        debug!(path = %remote_path, "removed remote subtree");
        Ok(())
    }

    /// Removes remote entries of one level that are gone locally or changed type.
    ///
    /// Entries are removed as the remote listing is streamed.
    fn purge_stale_entries(&mut self, local_path: &str, remote_path: &str) -> MirrorResult<()> {
        let mut stream = match self.remote.read_dir(remote_path) {
            Ok(stream) => stream,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(MirrorError::fs("read_dir", remote_path, e)),
        };
        while let Some(rentry) = stream
            .next_entry()
            .map_err(|e| MirrorError::fs("read_dir", remote_path, e))?
        {
            if rentry.name == SNAP_DIR {
                continue;
            }
            let lpath = join_path(local_path, &rentry.name);
            let stale = match self.local.stat(&lpath) {
                Ok(lstat) => lstat.file_type != rentry.stat.file_type,
                Err(e) if e.kind() == io::ErrorKind::NotFound => true,
                Err(e) => return Err(MirrorError::fs("stat", lpath, e)),
            };
            if !stale {
                continue;
            }

            (self.backoff)()?;
            let rpath = join_path(remote_path, &rentry.name);
            if rentry.stat.is_dir() {
                self.cleanup_remote_dir(&rpath)?;
            } else {
                self.remote
                    .unlink(&rpath)
                    .map_err(|e| MirrorError::fs("unlink", rpath.as_str(), e))?;
                self.stats.entries_purged += 1;
            }
            debug!(path = %rpath, "purged stale remote entry");
        }
        Ok(())
    }

    fn remote_stat(&self, path: &str) -> MirrorResult<Option<Stat>> {
        match self.remote.stat(path) {
            Ok(stat) => Ok(Some(stat)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(MirrorError::fs("stat", path, e)),
        }
    }
}
