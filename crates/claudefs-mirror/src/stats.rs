//! Per-directory synchronization statistics and status reporting.
//!
//! Workers update a directory's [`SnapSyncStat`] as they delete, rename and
//! synchronize snapshots; the admin interface reads a [`PeerStatus`] built
//! from the same map.

use crate::error::MirrorResult;
use crate::peer::Peer;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Synchronization state of one mirrored directory.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SnapSyncStat {
    /// Consecutive failed synchronization attempts.
    pub nr_failures: u64,
    /// When the last attempt failed.
    pub last_failed: Option<Instant>,
    /// Set once `nr_failures` reached the configured cap.
    pub failed: bool,
    /// Last snapshot known to be present on the peer.
    pub last_synced_snap: Option<(u64, String)>,
    /// Snapshot being transferred right now.
    pub current_syncing_snap: Option<(u64, String)>,
    /// Snapshots synchronized.
    pub synced_snap_count: u64,
    /// Remote snapshots deleted.
    pub deleted_snap_count: u64,
    /// Remote snapshots renamed.
    pub renamed_snap_count: u64,
    /// Wall-clock time of the last completed snapshot sync.
    pub last_synced: Option<SystemTime>,
    /// Duration of the last completed snapshot sync.
    pub last_sync_duration: Option<Duration>,
}

/// Stats for every directory registered for mirroring.
#[derive(Debug)]
pub struct StatsTracker {
    stats: BTreeMap<String, SnapSyncStat>,
    max_failures: u64,
}

impl StatsTracker {
    /// Creates a tracker that flags a directory after `max_failures` consecutive failures.
    pub fn new(max_failures: u64) -> Self {
        Self {
            stats: BTreeMap::new(),
            max_failures,
        }
    }

    /// Creates a fresh stat for `dir` unless one exists. Returns true if created.
    pub fn ensure(&mut self, dir: &str) -> bool {
        if self.stats.contains_key(dir) {
            return false;
        }
        self.stats.insert(dir.to_string(), SnapSyncStat::default());
        true
    }

    /// Drops the stat for `dir`.
    pub fn remove(&mut self, dir: &str) -> Option<SnapSyncStat> {
        self.stats.remove(dir)
    }

    /// Returns true if `dir` has a stat.
    pub fn contains(&self, dir: &str) -> bool {
        self.stats.contains_key(dir)
    }

    /// Looks up the stat for `dir`.
    pub fn get(&self, dir: &str) -> Option<&SnapSyncStat> {
        self.stats.get(dir)
    }

    /// Number of tracked directories.
    pub fn len(&self) -> usize {
        self.stats.len()
    }

    /// Returns true if no directory is tracked.
    pub fn is_empty(&self) -> bool {
        self.stats.is_empty()
    }

    /// Records a failed attempt. Returns true if this failure raised the failed flag.
    pub fn inc_failed_count(&mut self, dir: &str, now: Instant) -> bool {
        let max_failures = self.max_failures;
        match self.stats.get_mut(dir) {
            Some(stat) => {
                stat.last_failed = Some(now);
                stat.nr_failures += 1;
                let newly_failed = !stat.failed && stat.nr_failures >= max_failures;
                if stat.nr_failures >= max_failures {
                    stat.failed = true;
                }
                newly_failed
            }
            None => false,
        }
    }

    /// Records a successful attempt.
    pub fn reset_failed_count(&mut self, dir: &str) {
        if let Some(stat) = self.stats.get_mut(dir) {
            stat.nr_failures = 0;
            stat.failed = false;
            stat.last_failed = None;
        }
    }

    /// Returns whether a failed directory may be retried at `now`.
    /// Directories that are not flagged are always eligible.
    pub fn retry_eligible(&self, dir: &str, now: Instant, retry_interval: Duration) -> bool {
        match self.stats.get(dir) {
            Some(stat) if stat.failed => stat
                .last_failed
                .map_or(true, |at| now.saturating_duration_since(at) >= retry_interval),
            _ => true,
        }
    }

    /// Records the last snapshot present on the peer. Never moves to a lower id.
    pub fn set_last_synced_snap(&mut self, dir: &str, snap_id: u64, snap_name: &str) {
        if let Some(stat) = self.stats.get_mut(dir) {
            if stat
                .last_synced_snap
                .as_ref()
                .map_or(true, |(id, _)| *id <= snap_id)
            {
                stat.last_synced_snap = Some((snap_id, snap_name.to_string()));
            }
            stat.current_syncing_snap = None;
        }
    }

    /// Marks a snapshot as being transferred.
    pub fn set_current_syncing_snap(&mut self, dir: &str, snap_id: u64, snap_name: &str) {
        if let Some(stat) = self.stats.get_mut(dir) {
            stat.current_syncing_snap = Some((snap_id, snap_name.to_string()));
        }
    }

    /// Clears the in-progress snapshot.
    pub fn clear_current_syncing_snap(&mut self, dir: &str) {
        if let Some(stat) = self.stats.get_mut(dir) {
            stat.current_syncing_snap = None;
        }
    }

    /// Counts a deleted remote snapshot.
    pub fn inc_deleted_snap(&mut self, dir: &str) {
        if let Some(stat) = self.stats.get_mut(dir) {
            stat.deleted_snap_count += 1;
        }
    }

    /// Counts a renamed remote snapshot.
    pub fn inc_renamed_snap(&mut self, dir: &str) {
        if let Some(stat) = self.stats.get_mut(dir) {
            stat.renamed_snap_count += 1;
        }
    }

    /// Records a completed snapshot synchronization.
    pub fn set_last_synced_stat(
        &mut self,
        dir: &str,
        snap_id: u64,
        snap_name: &str,
        duration: Duration,
    ) {
        self.set_last_synced_snap(dir, snap_id, snap_name);
        if let Some(stat) = self.stats.get_mut(dir) {
            stat.last_synced = Some(SystemTime::now());
            stat.last_sync_duration = Some(duration);
            stat.synced_snap_count += 1;
        }
    }

    /// Builds the status view of every tracked directory.
    pub fn report(&self, now: Instant) -> BTreeMap<String, DirectoryStatus> {
        self.stats
            .iter()
            .map(|(dir, stat)| (dir.clone(), DirectoryStatus::from_stat(stat, now)))
            .collect()
    }
}

/// Reported state of a directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    /// Nothing in flight.
    Idle,
    /// A snapshot is being transferred.
    Syncing,
    /// The directory hit its consecutive-failure cap.
    Failed,
}

/// A snapshot reference in a status report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SnapRef {
    /// Snapshot id.
    pub id: u64,
    /// Snapshot name.
    pub name: String,
}

/// The last synchronized snapshot in a status report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LastSyncedSnap {
    /// Snapshot id.
    pub id: u64,
    /// Snapshot name.
    pub name: String,
    /// How long the transfer took, in seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sync_duration_secs: Option<f64>,
    /// When the transfer completed, seconds since the Unix epoch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sync_time_stamp: Option<u64>,
}

/// Read-only status of one mirrored directory.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DirectoryStatus {
    /// Current state.
    pub state: SyncState,
    /// Snapshot in flight, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_syncing_snap: Option<SnapRef>,
    /// Last snapshot present on the peer, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_synced_snap: Option<LastSyncedSnap>,
    /// Consecutive failures.
    pub failure_count: u64,
    /// Seconds since the last failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failed_secs_ago: Option<f64>,
    /// Snapshots synchronized.
    pub snaps_synced: u64,
    /// Remote snapshots deleted.
    pub snaps_deleted: u64,
    /// Remote snapshots renamed.
    pub snaps_renamed: u64,
}

impl DirectoryStatus {
    fn from_stat(stat: &SnapSyncStat, now: Instant) -> Self {
        let state = if stat.failed {
            SyncState::Failed
        } else if stat.current_syncing_snap.is_some() {
            SyncState::Syncing
        } else {
            SyncState::Idle
        };
        let last_synced_snap = stat.last_synced_snap.as_ref().map(|(id, name)| LastSyncedSnap {
            id: *id,
            name: name.clone(),
            sync_duration_secs: stat.last_sync_duration.map(|d| d.as_secs_f64()),
            sync_time_stamp: stat
                .last_synced
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_secs()),
        });
        Self {
            state,
            current_syncing_snap: stat
                .current_syncing_snap
                .as_ref()
                .map(|(id, name)| SnapRef {
                    id: *id,
                    name: name.clone(),
                }),
            last_synced_snap,
            failure_count: stat.nr_failures,
            last_failed_secs_ago: stat
                .last_failed
                .map(|at| now.saturating_duration_since(at).as_secs_f64()),
            snaps_synced: stat.synced_snap_count,
            snaps_deleted: stat.deleted_snap_count,
            snaps_renamed: stat.renamed_snap_count,
        }
    }
}

/// Status of every directory mirrored to one peer.
#[derive(Debug, Clone, Serialize)]
pub struct PeerStatus {
    /// The peer.
    pub peer: Peer,
    /// Per-directory status, keyed by directory path.
    pub directories: BTreeMap<String, DirectoryStatus>,
}

impl PeerStatus {
    /// Renders the status as pretty-printed JSON.
    pub fn to_json(&self) -> MirrorResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Number of directories flagged as failed.
    pub fn failed_count(&self) -> usize {
        self.directories
            .values()
            .filter(|d| d.state == SyncState::Failed)
            .count()
    }

    /// Format as a one-line summary.
    pub fn one_line_summary(&self) -> String {
        let syncing = self
            .directories
            .values()
            .filter(|d| d.state == SyncState::Syncing)
            .count();
        let synced: u64 = self.directories.values().map(|d| d.snaps_synced).sum();
        format!(
            "Peer {}: {} dirs | {} syncing | {} failed | {} snaps synced",
            self.peer,
            self.directories.len(),
            syncing,
            self.failed_count(),
            synced
        )
    }
}
