//! Shared fixtures for the replayer integration tests.

#![allow(dead_code)]

use claudefs_mirror::fs::{
    DirFd, DirStream, FileAttrs, FileType, FilesystemClient, SnapshotInfo, Stat,
};
use claudefs_mirror::{BlocklistFlag, MemMount, MirrorConfig, Peer, PeerReplayer};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Installs a test-writer subscriber; `RUST_LOG` selects the level.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Fast-cycling config for tests.
pub fn test_config(workers: usize) -> MirrorConfig {
    MirrorConfig {
        max_concurrent_directory_syncs: workers,
        max_consecutive_failures_per_directory: 3,
        retry_failed_directories_interval_secs: 0,
        max_snapshot_sync_per_cycle: 0,
        directory_scan_interval_ms: 0,
        copy_buffer_size: 16,
    }
}

/// Polls `cond` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}

/// Creates `files` files under `dir` and snapshots it as `snap`.
pub fn populate(mount: &MemMount, dir: &str, files: usize, snap: &str) {
    for i in 0..files {
        mount
            .write_file(&format!("{}/f{}", dir, i), format!("{}:{}", snap, i).as_bytes())
            .unwrap();
    }
    mount.create_snapshot(dir, snap, &BTreeMap::new()).unwrap();
}

/// Id of the last snapshot the replayer reports as synced for `dir`.
pub fn last_synced_id(replayer: &PeerReplayer, dir: &str) -> Option<u64> {
    replayer
        .peer_status()
        .directories
        .get(dir)
        .and_then(|d| d.last_synced_snap.as_ref().map(|s| s.id))
}

/// A replayer plus handles on everything it talks to.
pub struct Harness {
    pub local: MemMount,
    pub remote: TrackingMount,
    pub health: Arc<BlocklistFlag>,
    pub replayer: PeerReplayer,
}

impl Harness {
    pub fn new(config: MirrorConfig) -> Self {
        init_tracing();
        let local = MemMount::new();
        let remote = TrackingMount::new(MemMount::new());
        let health = Arc::new(BlocklistFlag::new());
        let replayer = PeerReplayer::new(
            Peer::new("client.mirror", "site-b", "cfs"),
            config,
            Arc::new(local.clone()),
            Arc::new(remote.clone()),
            health.clone(),
        )
        .unwrap();
        Self {
            local,
            remote,
            health,
            replayer,
        }
    }
}

/// Wraps a mount and records, per top-level directory, the highest number of
/// threads that were inside a call at the same time.
///
/// Opening and creating the directory are not tracked: that is how a worker
/// claims it, and a worker losing the claim may do so alongside the winner.
#[derive(Clone)]
pub struct TrackingMount {
    pub inner: MemMount,
    in_flight: Arc<Mutex<HashMap<String, usize>>>,
    max_in_flight: Arc<AtomicUsize>,
}

struct InFlight<'a> {
    mount: &'a TrackingMount,
    key: String,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut map = self.mount.in_flight.lock();
        if let Some(n) = map.get_mut(&self.key) {
            *n -= 1;
        }
    }
}

impl TrackingMount {
    pub fn new(inner: MemMount) -> Self {
        Self {
            inner,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            max_in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Most threads ever seen inside calls for the same directory.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn track(&self, path: &str) -> InFlight<'_> {
        let key = path
            .trim_start_matches('/')
            .split('/')
            .next()
            .unwrap_or_default()
            .to_string();
        let mut map = self.in_flight.lock();
        let n = map.entry(key.clone()).or_insert(0);
        *n += 1;
        self.max_in_flight.fetch_max(*n, Ordering::SeqCst);
        InFlight { mount: self, key }
    }
}

impl FilesystemClient for TrackingMount {
    fn stat(&self, path: &str) -> io::Result<Stat> {
        let _t = self.track(path);
        self.inner.stat(path)
    }

    fn open_dir(&self, path: &str) -> io::Result<DirFd> {
        self.inner.open_dir(path)
    }

    fn close_dir(&self, fd: DirFd) -> io::Result<()> {
        self.inner.close_dir(fd)
    }

    fn read_dir(&self, path: &str) -> io::Result<Box<dyn DirStream>> {
        let _t = self.track(path);
        self.inner.read_dir(path)
    }

    fn mkdir(&self, path: &str, mode: u32) -> io::Result<()> {
        let _t = self.track(path);
        self.inner.mkdir(path, mode)
    }

    fn mkdirs(&self, path: &str, mode: u32) -> io::Result<()> {
        self.inner.mkdirs(path, mode)
    }

    fn rmdir(&self, path: &str) -> io::Result<()> {
        let _t = self.track(path);
        self.inner.rmdir(path)
    }

    fn unlink(&self, path: &str) -> io::Result<()> {
        let _t = self.track(path);
        self.inner.unlink(path)
    }

    fn symlink(&self, target: &str, path: &str) -> io::Result<()> {
        let _t = self.track(path);
        self.inner.symlink(target, path)
    }

    fn mknod(&self, path: &str, file_type: FileType, mode: u32, rdev: u64) -> io::Result<()> {
        let _t = self.track(path);
        self.inner.mknod(path, file_type, mode, rdev)
    }

    fn readlink(&self, path: &str) -> io::Result<String> {
        let _t = self.track(path);
        self.inner.readlink(path)
    }

    fn open_read(&self, path: &str) -> io::Result<Box<dyn Read + Send>> {
        let _t = self.track(path);
        self.inner.open_read(path)
    }

    fn create_file(&self, path: &str, mode: u32) -> io::Result<Box<dyn Write + Send>> {
        let _t = self.track(path);
        self.inner.create_file(path, mode)
    }

    fn set_attrs(&self, path: &str, attrs: &FileAttrs) -> io::Result<()> {
        let _t = self.track(path);
        self.inner.set_attrs(path, attrs)
    }

    fn get_xattr(&self, path: &str, name: &str) -> io::Result<Option<Vec<u8>>> {
        let _t = self.track(path);
        self.inner.get_xattr(path, name)
    }

    fn set_xattr(&self, path: &str, name: &str, value: &[u8]) -> io::Result<()> {
        let _t = self.track(path);
        self.inner.set_xattr(path, name, value)
    }

    fn list_snapshots(&self, dir: &str) -> io::Result<Vec<SnapshotInfo>> {
        let _t = self.track(dir);
        self.inner.list_snapshots(dir)
    }

    fn create_snapshot(
        &self,
        dir: &str,
        name: &str,
        metadata: &BTreeMap<String, String>,
    ) -> io::Result<()> {
        let _t = self.track(dir);
        self.inner.create_snapshot(dir, name, metadata)
    }

    fn remove_snapshot(&self, dir: &str, name: &str) -> io::Result<()> {
        let _t = self.track(dir);
        self.inner.remove_snapshot(dir, name)
    }

    fn rename_snapshot(&self, dir: &str, from: &str, to: &str) -> io::Result<()> {
        let _t = self.track(dir);
        self.inner.rename_snapshot(dir, from, to)
    }
}
