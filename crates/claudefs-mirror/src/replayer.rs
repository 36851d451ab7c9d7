//! The peer replayer: a fixed pool of worker threads mirroring directory
//! snapshots to one peer.
//!
//! Workers loop over pick, register, sync, unregister. The queue, the
//! registry of held directories, the per-directory stats and the stopping
//! flag live behind one mutex that is never held across mount I/O.

use crate::config::MirrorConfig;
use crate::error::{MirrorError, MirrorResult};
use crate::fs::{DirFd, FilesystemClient};
use crate::health::PeerHealth;
use crate::metrics::MirrorMetrics;
use crate::peer::Peer;
use crate::queue::DirectoryQueue;
use crate::registry::{DirRegistration, DirectoryRegistry, Worker};
use crate::snap_diff::{SnapshotDiffEngine, SyncHooks};
use crate::stats::{PeerStatus, StatsTracker};
use crate::tree_sync::TreeSyncStats;
use parking_lot::{Condvar, Mutex};
use std::io;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, info_span, warn};

/// Lower bound for waits that poll for time-based eligibility.
const MIN_IDLE_WAIT: Duration = Duration::from_millis(10);

/// Mode of remote directories created on first sync.
const REMOTE_DIR_MODE: u32 = 0o755;

struct ReplayerState {
    queue: DirectoryQueue,
    registry: DirectoryRegistry,
    stats: StatsTracker,
    stopping: bool,
}

struct Shared {
    peer: Peer,
    config: MirrorConfig,
    local: Arc<dyn FilesystemClient>,
    remote: Arc<dyn FilesystemClient>,
    health: Arc<dyn PeerHealth>,
    metrics: MirrorMetrics,
    state: Mutex<ReplayerState>,
    /// Signalled when a directory is added or released.
    dir_available: Condvar,
    /// Signalled on shutdown to cut pacing waits short.
    pacing: Condvar,
}

impl Shared {
    fn idle_wait(&self) -> Duration {
        self.config.scan_interval().max(MIN_IDLE_WAIT)
    }

    /// Blocks until an eligible directory exists; `None` once stopping.
    fn pick_directory(&self) -> Option<String> {
        let retry_interval = self.config.retry_failed_interval();
        let mut state = self.state.lock();
        loop {
            if state.stopping {
                return None;
            }
            let now = Instant::now();
            let ReplayerState {
                queue,
                registry,
                stats,
                ..
            } = &mut *state;
            let picked = queue.pick(|dir| {
                !registry.is_registered(dir) && stats.retry_eligible(dir, now, retry_interval)
            });
            if picked.is_some() {
                return picked;
            }
            self.dir_available.wait_for(&mut state, self.idle_wait());
        }
    }

    /// Claims `dir` for `worker`, opening (and if needed creating) the remote directory.
    fn register_directory(&self, dir: &str, worker: &Arc<Worker>) -> MirrorResult<()> {
        if self.state.lock().registry.is_registered(dir) {
            return Err(MirrorError::AlreadyRegistered {
                dir: dir.to_string(),
            });
        }

        let fd = self.try_lock_directory(dir)?;

        let mut state = self.state.lock();
        let result = if state.stopping {
            Err(MirrorError::Shutdown)
        } else if !state.queue.contains(dir) {
            Err(MirrorError::Canceled)
        } else {
            state.registry.register(
                dir,
                DirRegistration {
                    fd,
                    worker: Arc::clone(worker),
                },
            )
        };
        drop(state);

        if result.is_err() {
            self.close_remote_dir(dir, fd);
        } else {
            debug!(dir = %dir, worker = worker.name(), "registered directory");
        }
        result
    }

    fn try_lock_directory(&self, dir: &str) -> MirrorResult<DirFd> {
        match self.remote.open_dir(dir) {
            Ok(fd) => Ok(fd),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!(dir = %dir, "creating remote directory");
                self.remote
                    .mkdirs(dir, REMOTE_DIR_MODE)
                    .map_err(|e| MirrorError::fs("mkdirs", dir, e))?;
                self.remote
                    .open_dir(dir)
                    .map_err(|e| MirrorError::fs("open_dir", dir, e))
            }
            Err(e) => Err(MirrorError::fs("open_dir", dir, e)),
        }
    }

    /// Releases `dir`. Drops its stats if it left mirroring meanwhile.
    fn unregister_directory(&self, dir: &str) {
        let registration = {
            let mut state = self.state.lock();
            let registration = state.registry.unregister(dir);
            if let Some(reg) = &registration {
                reg.worker.reset_cancel();
            }
            if !state.queue.contains(dir) {
                state.stats.remove(dir);
            }
            registration
        };
        self.dir_available.notify_one();

        match registration {
            Some(reg) => {
                self.close_remote_dir(dir, reg.fd);
                debug!(dir = %dir, worker = reg.worker.name(), "unregistered directory");
            }
            None => error!(dir = %dir, "unregistering a directory that is not registered"),
        }
    }

    fn close_remote_dir(&self, dir: &str, fd: DirFd) {
        if let Err(e) = self.remote.close_dir(fd) {
            warn!(dir = %dir, error = %e, "failed to close remote directory");
        }
    }

    /// Preflight before each sync step.
    fn should_backoff(&self, dir: &str) -> MirrorResult<()> {
        if self.health.is_blocklisted() {
            return Err(MirrorError::Blocklisted);
        }
        let state = self.state.lock();
        if state.stopping {
            return Err(MirrorError::Shutdown);
        }
        match state.registry.get(dir) {
            Some(reg) if !reg.worker.is_canceled() => Ok(()),
            _ => Err(MirrorError::Canceled),
        }
    }

    /// Runs one sync cycle for a registered directory and accounts for its outcome.
    fn sync_snaps(&self, dir: &str) {
        let engine = SnapshotDiffEngine::new(&*self.local, &*self.remote, &self.config);
        let hooks = DirHooks { shared: self, dir };
        match engine.do_sync_snaps(dir, &hooks) {
            Ok(cycle) => {
                self.state.lock().stats.reset_failed_count(dir);
                debug!(
                    dir = %dir,
                    synced = cycle.snaps_synced,
                    deleted = cycle.snaps_deleted,
                    renamed = cycle.snaps_renamed,
                    deferred = cycle.snaps_deferred,
                    "sync cycle finished"
                );
            }
            Err(e) if !e.counts_as_failure() => {
                debug!(dir = %dir, error = %e, "sync cycle interrupted");
            }
            Err(e) => self.record_failure(dir, &e),
        }
    }

    fn record_failure(&self, dir: &str, err: &MirrorError) {
        self.metrics.record_sync_failure();
        let newly_failed = self.state.lock().stats.inc_failed_count(dir, Instant::now());
        warn!(dir = %dir, error = %err, "failed to sync snapshots");
        if newly_failed {
            warn!(
                dir = %dir,
                max_failures = self.config.max_consecutive_failures_per_directory,
                "directory marked as failed"
            );
        }
    }

    /// Waits `wait` or until shutdown. Returns false once stopping.
    fn pace(&self, wait: Duration) -> bool {
        let mut state = self.state.lock();
        if state.stopping {
            return false;
        }
        if !wait.is_zero() {
            self.pacing.wait_for(&mut state, wait);
        }
        !state.stopping
    }

    fn run(&self, worker: Arc<Worker>) {
        debug!("worker started");
        loop {
            if self.health.is_blocklisted() {
                debug!("peer blocklisted, waiting");
                if !self.pace(self.idle_wait()) {
                    break;
                }
                continue;
            }

            let dir = match self.pick_directory() {
                Some(dir) => dir,
                None => break,
            };
            debug!(dir = %dir, "picked directory");

            match self.register_directory(&dir, &worker) {
                Ok(()) => {
                    let _guard = RegistrationGuard {
                        shared: self,
                        dir: &dir,
                    };
                    self.sync_snaps(&dir);
                }
                Err(MirrorError::AlreadyRegistered { .. }) => {
                    debug!(dir = %dir, "directory held by another worker");
                }
                Err(e) if !e.counts_as_failure() => {
                    debug!(dir = %dir, error = %e, "registration abandoned");
                }
                Err(e) => self.record_failure(&dir, &e),
            }

            if !self.pace(self.config.scan_interval()) {
                break;
            }
        }
        debug!("worker exiting");
    }
}

/// Releases a registration on every exit path of a sync.
struct RegistrationGuard<'a> {
    shared: &'a Shared,
    dir: &'a str,
}

impl Drop for RegistrationGuard<'_> {
    fn drop(&mut self) {
        self.shared.unregister_directory(self.dir);
    }
}

/// Routes sync progress of one directory into the shared stats.
struct DirHooks<'a> {
    shared: &'a Shared,
    dir: &'a str,
}

impl SyncHooks for DirHooks<'_> {
    fn should_backoff(&self) -> MirrorResult<()> {
        self.shared.should_backoff(self.dir)
    }

    fn set_last_synced_snap(&self, snap_id: u64, snap_name: &str) {
        self.shared
            .state
            .lock()
            .stats
            .set_last_synced_snap(self.dir, snap_id, snap_name);
    }

    fn set_current_syncing_snap(&self, snap_id: u64, snap_name: &str) {
        self.shared
            .state
            .lock()
            .stats
            .set_current_syncing_snap(self.dir, snap_id, snap_name);
    }

    fn clear_current_syncing_snap(&self) {
        self.shared
            .state
            .lock()
            .stats
            .clear_current_syncing_snap(self.dir);
    }

    fn inc_deleted_snap(&self) {
        self.shared.metrics.record_snapshot_deleted();
        self.shared.state.lock().stats.inc_deleted_snap(self.dir);
    }

    fn inc_renamed_snap(&self) {
        self.shared.metrics.record_snapshot_renamed();
        self.shared.state.lock().stats.inc_renamed_snap(self.dir);
    }

    fn set_last_synced_stat(
        &self,
        snap_id: u64,
        snap_name: &str,
        duration: Duration,
        tree: &TreeSyncStats,
    ) {
        self.shared.metrics.record_snapshot_synced(tree);
        self.shared
            .state
            .lock()
            .stats
            .set_last_synced_stat(self.dir, snap_id, snap_name, duration);
    }
}

/// Mirrors snapshots of a set of directories to one peer.
pub struct PeerReplayer {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl PeerReplayer {
    /// Creates a replayer. No thread runs until [`PeerReplayer::init`].
    pub fn new(
        peer: Peer,
        config: MirrorConfig,
        local: Arc<dyn FilesystemClient>,
        remote: Arc<dyn FilesystemClient>,
        health: Arc<dyn PeerHealth>,
    ) -> MirrorResult<Self> {
        config.validate()?;
        let stats = StatsTracker::new(config.max_consecutive_failures_per_directory);
        Ok(Self {
            shared: Arc::new(Shared {
                peer,
                config,
                local,
                remote,
                health,
                metrics: MirrorMetrics::new(),
                state: Mutex::new(ReplayerState {
                    queue: DirectoryQueue::new(),
                    registry: DirectoryRegistry::new(),
                    stats,
                    stopping: false,
                }),
                dir_available: Condvar::new(),
                pacing: Condvar::new(),
            }),
            workers: Mutex::new(Vec::new()),
        })
    }

    /// The peer this replayer mirrors to.
    pub fn peer(&self) -> &Peer {
        &self.shared.peer
    }

    /// Spawns the worker pool.
    pub fn init(&self) -> MirrorResult<()> {
        let mut workers = self.workers.lock();
        if !workers.is_empty() {
            warn!(peer = %self.shared.peer, "replayer already initialized");
            return Ok(());
        }
        if self.shared.state.lock().stopping {
            return Err(MirrorError::Shutdown);
        }

        let count = self.shared.config.max_concurrent_directory_syncs;
        info!(peer = %self.shared.peer, workers = count, "starting peer replayer");
        for id in 0..count {
            let worker = Arc::new(Worker::new(id));
            let shared = Arc::clone(&self.shared);
            let handle = std::thread::Builder::new()
                .name(worker.name().to_string())
                .spawn(move || {
                    let span = info_span!(
                        "replayer",
                        worker = worker.name(),
                        peer = %shared.peer.uuid
                    );
                    let _entered = span.enter();
                    shared.run(worker);
                })?;
            workers.push(handle);
        }
        Ok(())
    }

    /// Stops every worker and waits for them to exit. Safe to call more than once.
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock();
            if !state.stopping {
                info!(peer = %self.shared.peer, "shutting down peer replayer");
            }
            state.stopping = true;
        }
        self.shared.dir_available.notify_all();
        self.shared.pacing.notify_all();

        let handles: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        for handle in handles {
            if handle.join().is_err() {
                error!(peer = %self.shared.peer, "replayer worker panicked");
            }
        }
    }

    /// Starts mirroring `dir`.
    pub fn add_directory(&self, dir: &str) {
        let added = {
            let mut state = self.shared.state.lock();
            state.stats.ensure(dir);
            state.queue.add(dir)
        };
        if added {
            info!(peer = %self.shared.peer, dir = %dir, "added directory");
            self.shared.dir_available.notify_one();
        }
    }

    /// Stops mirroring `dir`, canceling the worker that holds it, if any.
    pub fn remove_directory(&self, dir: &str) {
        let mut state = self.shared.state.lock();
        if !state.queue.remove(dir) {
            debug!(dir = %dir, "removing a directory that is not mirrored");
        }
        if state.registry.cancel(dir) {
            info!(peer = %self.shared.peer, dir = %dir, "removed directory, canceling its sync");
        } else {
            state.stats.remove(dir);
            info!(peer = %self.shared.peer, dir = %dir, "removed directory");
        }
    }

    /// Mirrored directories in rotation order.
    pub fn directories(&self) -> Vec<String> {
        self.shared
            .state
            .lock()
            .queue
            .iter()
            .map(str::to_string)
            .collect()
    }

    /// Read-only status of every tracked directory.
    pub fn peer_status(&self) -> PeerStatus {
        let directories = self.shared.state.lock().stats.report(Instant::now());
        PeerStatus {
            peer: self.shared.peer.clone(),
            directories,
        }
    }

    /// Counters shared by the workers.
    pub fn metrics(&self) -> &MirrorMetrics {
        &self.shared.metrics
    }

    /// Metrics in Prometheus text format.
    pub fn format_prometheus(&self) -> String {
        let status = self.peer_status();
        self.shared.metrics.format_prometheus(
            &status.peer.uuid.to_string(),
            status.directories.len(),
            status.failed_count(),
        )
    }
}

impl Drop for PeerReplayer {
    fn drop(&mut self) {
        self.shutdown();
    }
}
