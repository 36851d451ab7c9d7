//! Mount capability consumed by the mirroring engine.
//!
//! A [`FilesystemClient`] is a connected handle to either the local (primary)
//! or the remote (peer) filesystem. All calls are synchronous and may block on
//! I/O; the engine never holds its state lock across them.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{self, Read, Write};
use std::time::SystemTime;

/// Name of the virtual directory exposing a directory's snapshots.
pub const SNAP_DIR: &str = ".snap";

/// Type of a filesystem entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileType {
    /// A directory.
    Directory,
    /// A regular file.
    File,
    /// A symbolic link.
    Symlink,
    /// A named pipe.
    Fifo,
    /// A unix domain socket.
    Socket,
    /// A character device.
    CharDevice,
    /// A block device.
    BlockDevice,
}

impl FileType {
    /// Returns true for entries recreated with `mknod` rather than copied.
    pub fn is_special(self) -> bool {
        matches!(
            self,
            FileType::Fifo | FileType::Socket | FileType::CharDevice | FileType::BlockDevice
        )
    }
}

/// Captured attributes of an entry, as returned by a `statx`-style call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stat {
    /// Inode number on the mount that produced it.
    pub ino: u64,
    /// Entry type.
    pub file_type: FileType,
    /// Permission bits (no type bits).
    pub mode: u32,
    /// Owner user id.
    pub uid: u32,
    /// Owner group id.
    pub gid: u32,
    /// Size in bytes (target length for symlinks).
    pub size: u64,
    /// Device number for character and block devices, 0 otherwise.
    pub rdev: u64,
    /// Last access time.
    pub atime: SystemTime,
    /// Last modification time.
    pub mtime: SystemTime,
}

impl Stat {
    /// Returns true if the entry is a directory.
    pub fn is_dir(&self) -> bool {
        self.file_type == FileType::Directory
    }

    /// Returns true if the entry is a regular file.
    pub fn is_file(&self) -> bool {
        self.file_type == FileType::File
    }

    /// Returns true if the entry is a symbolic link.
    pub fn is_symlink(&self) -> bool {
        self.file_type == FileType::Symlink
    }

    /// Returns true for fifos, sockets and device nodes.
    pub fn is_special(&self) -> bool {
        self.file_type.is_special()
    }

    /// Returns true if file data can be assumed identical (same type, size and mtime).
    pub fn data_matches(&self, other: &Stat) -> bool {
        self.file_type == other.file_type && self.size == other.size && self.mtime == other.mtime
    }

    /// Returns true if both are the same kind of special node for the same device.
    pub fn node_matches(&self, other: &Stat) -> bool {
        self.file_type == other.file_type && self.rdev == other.rdev
    }

    /// Returns true if mode and ownership are identical.
    pub fn attrs_match(&self, other: &Stat) -> bool {
        self.mode == other.mode && self.uid == other.uid && self.gid == other.gid
    }

    /// The settable attributes of this entry.
    pub fn attrs(&self) -> FileAttrs {
        FileAttrs {
            mode: self.mode,
            uid: self.uid,
            gid: self.gid,
            atime: self.atime,
            mtime: self.mtime,
        }
    }
}

/// Attributes applied with [`FilesystemClient::set_attrs`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileAttrs {
    /// Permission bits.
    pub mode: u32,
    /// Owner user id.
    pub uid: u32,
    /// Owner group id.
    pub gid: u32,
    /// Access time.
    pub atime: SystemTime,
    /// Modification time.
    pub mtime: SystemTime,
}

/// Open directory descriptor handed out by [`FilesystemClient::open_dir`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DirFd(pub u64);

/// One entry yielded by a [`DirStream`].
#[derive(Debug, Clone)]
pub struct DirEntry {
    /// Entry name (no path separators).
    pub name: String,
    /// Entry attributes.
    pub stat: Stat,
}

/// A streaming directory listing (`readdirplus`). `.` and `..` are never returned.
pub trait DirStream: Send {
    /// Returns the next entry, or `None` at the end of the directory.
    fn next_entry(&mut self) -> io::Result<Option<DirEntry>>;
}

/// A snapshot of a directory as reported by a mount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    /// Snapshot id assigned by the mount; monotonically increasing.
    pub id: u64,
    /// Snapshot name.
    pub name: String,
    /// Metadata attached at creation time.
    pub metadata: BTreeMap<String, String>,
}

/// Filesystem operations needed to replicate snapshots.
pub trait FilesystemClient: Send + Sync {
    /// Stats an entry without following a trailing symlink.
    fn stat(&self, path: &str) -> io::Result<Stat>;

    /// Opens a directory and returns a descriptor for it.
    fn open_dir(&self, path: &str) -> io::Result<DirFd>;

    /// Closes a descriptor returned by `open_dir`.
    fn close_dir(&self, fd: DirFd) -> io::Result<()>;

    /// Opens a streaming listing of a directory.
    fn read_dir(&self, path: &str) -> io::Result<Box<dyn DirStream>>;

    /// Creates a single directory.
    fn mkdir(&self, path: &str, mode: u32) -> io::Result<()>;

    /// Creates a directory and any missing parents.
    fn mkdirs(&self, path: &str, mode: u32) -> io::Result<()>;

    /// Removes an empty directory.
    fn rmdir(&self, path: &str) -> io::Result<()>;

    /// Removes a file or symlink.
    fn unlink(&self, path: &str) -> io::Result<()>;

    /// Creates a symlink at `path` pointing to `target`.
    fn symlink(&self, target: &str, path: &str) -> io::Result<()>;

    /// Creates a fifo, socket or device node. Other file types are rejected.
    fn mknod(&self, path: &str, file_type: FileType, mode: u32, rdev: u64) -> io::Result<()>;

    /// Reads the target of a symlink.
    fn readlink(&self, path: &str) -> io::Result<String>;

    /// Opens a regular file for reading.
    fn open_read(&self, path: &str) -> io::Result<Box<dyn Read + Send>>;

    /// Creates (or truncates) a regular file for writing.
    fn create_file(&self, path: &str, mode: u32) -> io::Result<Box<dyn Write + Send>>;

    /// Applies mode, ownership and times without following symlinks.
    fn set_attrs(&self, path: &str, attrs: &FileAttrs) -> io::Result<()>;

    /// Reads an extended attribute; `None` if it is not set.
    fn get_xattr(&self, path: &str, name: &str) -> io::Result<Option<Vec<u8>>>;

    /// Sets an extended attribute.
    fn set_xattr(&self, path: &str, name: &str, value: &[u8]) -> io::Result<()>;

    /// Lists the snapshots of a directory.
    fn list_snapshots(&self, dir: &str) -> io::Result<Vec<SnapshotInfo>>;

    /// Creates a snapshot of a directory with the given metadata.
    fn create_snapshot(
        &self,
        dir: &str,
        name: &str,
        metadata: &BTreeMap<String, String>,
    ) -> io::Result<()>;

    /// Removes a snapshot of a directory.
    fn remove_snapshot(&self, dir: &str, name: &str) -> io::Result<()>;

    /// Renames a snapshot in place.
    fn rename_snapshot(&self, dir: &str, from: &str, to: &str) -> io::Result<()>;

    /// Path under which the contents of a snapshot can be read.
    fn snapshot_path(&self, dir: &str, name: &str) -> String {
        join_path(&join_path(dir, SNAP_DIR), name)
    }

    /// Returns whether an entry exists.
    fn exists(&self, path: &str) -> io::Result<bool> {
        match self.stat(path) {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// Joins a relative entry path onto a base path. An empty `name` returns `base`.
pub fn join_path(base: &str, name: &str) -> String {
    if name.is_empty() {
        return base.to_string();
    }
    if base.is_empty() {
        return name.to_string();
    }
    if base.ends_with('/') {
        format!("{}{}", base, name)
    } else {
        format!("{}/{}", base, name)
    }
}
