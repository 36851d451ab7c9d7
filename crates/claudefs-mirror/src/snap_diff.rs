//! Snapshot diffing between the primary and the peer.
//!
//! Each side's snapshots are keyed by the primary's snapshot id: local
//! snapshots by their own id, remote snapshots by the `primary_snap_id`
//! metadata recorded when they were committed. The diff drives remote
//! deletes, renames and, for every local snapshot newer than the last one
//! the peer has, a tree synchronization followed by a snapshot commit.

use crate::config::MirrorConfig;
use crate::error::{MirrorError, MirrorResult};
use crate::fs::FilesystemClient;
use crate::tree_sync::{FileTreeSynchronizer, TreeSyncStats};
use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::ops::Bound;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Extended attribute on the remote directory, and metadata key on remote
/// snapshots, holding the primary's snapshot id.
pub const PRIMARY_SNAP_ID_KEY: &str = "primary_snap_id";

/// Snapshot id to name, in id order.
pub type SnapMap = BTreeMap<u64, String>;

/// What must change on the peer to match the primary.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapDiff {
    /// Remote snapshot names whose id no longer exists locally.
    pub deletes: BTreeSet<String>,
    /// (remote name, local name) pairs for ids present on both sides.
    pub renames: BTreeSet<(String, String)>,
    /// Newest snapshot already present on the peer, under its local name.
    pub last_synced: Option<(u64, String)>,
    /// Local snapshots newer than `last_synced`, in increasing id order.
    pub pending: Vec<(u64, String)>,
}

impl SnapDiff {
    /// Returns true if the peer already matches the primary.
    pub fn is_empty(&self) -> bool {
        self.deletes.is_empty() && self.renames.is_empty() && self.pending.is_empty()
    }
}

/// Which side a snapshot map is built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapSource {
    /// The primary; keys are the mount's own snapshot ids.
    Local,
    /// The peer; keys come from `primary_snap_id` metadata.
    Remote,
}

/// Lists the snapshots of `dir` on one side.
///
/// A remote directory that does not exist yet has no snapshots.
pub fn build_snap_map(
    client: &dyn FilesystemClient,
    dir: &str,
    source: SnapSource,
) -> MirrorResult<SnapMap> {
    let snaps = match client.list_snapshots(dir) {
        Ok(snaps) => snaps,
        Err(e) if source == SnapSource::Remote && e.kind() == io::ErrorKind::NotFound => {
            return Ok(SnapMap::new())
        }
        Err(e) => return Err(MirrorError::fs("list_snapshots", dir, e)),
    };

    let mut map = SnapMap::new();
    for snap in snaps {
        let id = match source {
            SnapSource::Local => snap.id,
            SnapSource::Remote => snap
                .metadata
                .get(PRIMARY_SNAP_ID_KEY)
                .ok_or_else(|| MirrorError::InvalidSnapshot {
                    dir: dir.to_string(),
                    snap: snap.name.clone(),
                    reason: format!("missing {} metadata", PRIMARY_SNAP_ID_KEY),
                })?
                .parse::<u64>()
                .map_err(|e| MirrorError::InvalidSnapshot {
                    dir: dir.to_string(),
                    snap: snap.name.clone(),
                    reason: format!("bad {}: {}", PRIMARY_SNAP_ID_KEY, e),
                })?,
        };
        map.insert(id, snap.name);
    }
    Ok(map)
}

/// Computes the changes that bring `remote` in line with `local`.
pub fn plan_snap_diff(local: &SnapMap, remote: &SnapMap) -> SnapDiff {
    let mut diff = SnapDiff::default();
    for (id, rname) in remote {
        match local.get(id) {
            None => {
                diff.deletes.insert(rname.clone());
            }
            Some(lname) if lname != rname => {
                diff.renames.insert((rname.clone(), lname.clone()));
            }
            Some(_) => {}
        }
    }

    diff.last_synced = remote
        .keys()
        .rev()
        .find_map(|id| local.get(id).map(|name| (*id, name.clone())));

    let lower = match &diff.last_synced {
        Some((id, _)) => Bound::Excluded(*id),
        None => Bound::Unbounded,
    };
    diff.pending = local
        .range((lower, Bound::Unbounded))
        .map(|(id, name)| (*id, name.clone()))
        .collect();
    diff
}

/// Callbacks through which a sync cycle reports progress and asks whether to stop.
pub trait SyncHooks {
    /// Preflight run before every side effect; an error aborts the cycle.
    fn should_backoff(&self) -> MirrorResult<()>;
    /// Records the newest snapshot present on the peer.
    fn set_last_synced_snap(&self, snap_id: u64, snap_name: &str);
    /// Marks a snapshot as in flight.
    fn set_current_syncing_snap(&self, snap_id: u64, snap_name: &str);
    /// Clears the in-flight snapshot after a failure.
    fn clear_current_syncing_snap(&self);
    /// Counts one propagated delete.
    fn inc_deleted_snap(&self);
    /// Counts one propagated rename.
    fn inc_renamed_snap(&self);
    /// Records a committed snapshot.
    fn set_last_synced_stat(
        &self,
        snap_id: u64,
        snap_name: &str,
        duration: Duration,
        tree: &TreeSyncStats,
    );
}

/// Outcome of one `do_sync_snaps` call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncCycle {
    /// Remote snapshots deleted.
    pub snaps_deleted: u64,
    /// Remote snapshots renamed.
    pub snaps_renamed: u64,
    /// Snapshots synchronized and committed.
    pub snaps_synced: u64,
    /// Pending snapshots left for a later cycle by the per-cycle cap.
    pub snaps_deferred: u64,
    /// Tree walk counters summed over synchronized snapshots.
    pub tree: TreeSyncStats,
}

/// Drives snapshot replication of a directory from `local` to `remote`.
pub struct SnapshotDiffEngine<'a> {
    local: &'a dyn FilesystemClient,
    remote: &'a dyn FilesystemClient,
    config: &'a MirrorConfig,
}

impl<'a> SnapshotDiffEngine<'a> {
    /// Creates an engine over the two mounts.
    pub fn new(
        local: &'a dyn FilesystemClient,
        remote: &'a dyn FilesystemClient,
        config: &'a MirrorConfig,
    ) -> Self {
        Self {
            local,
            remote,
            config,
        }
    }

    /// Runs one replication cycle for `dir`: deletes, renames, then pending snapshots.
    pub fn do_sync_snaps(&self, dir: &str, hooks: &dyn SyncHooks) -> MirrorResult<SyncCycle> {
        let local_snaps = build_snap_map(self.local, dir, SnapSource::Local)?;
        let remote_snaps = build_snap_map(self.remote, dir, SnapSource::Remote)?;
        let diff = plan_snap_diff(&local_snaps, &remote_snaps);
        debug!(
            dir = %dir,
            local = local_snaps.len(),
            remote = remote_snaps.len(),
            deletes = diff.deletes.len(),
            renames = diff.renames.len(),
            pending = diff.pending.len(),
            "planned snapshot diff"
        );

        hooks.should_backoff()?;
        if let Some((id, name)) = &diff.last_synced {
            hooks.set_last_synced_snap(*id, name);
        }

        let mut cycle = SyncCycle {
            snaps_deleted: self.propagate_snap_deletes(dir, &diff.deletes, hooks)?,
            snaps_renamed: self.propagate_snap_renames(dir, &diff.renames, hooks)?,
            ..Default::default()
        };

        let cap = match self.config.max_snapshot_sync_per_cycle {
            0 => diff.pending.len(),
            n => usize::try_from(n).unwrap_or(usize::MAX),
        };
        for (id, name) in diff.pending.iter().take(cap) {
            hooks.should_backoff()?;
            hooks.set_current_syncing_snap(*id, name);
            let start = Instant::now();
            match self.synchronize(dir, *id, name, hooks) {
                Ok(tree) => {
                    let duration = start.elapsed();
                    hooks.set_last_synced_stat(*id, name, duration, &tree);
                    cycle.snaps_synced += 1;
                    cycle.tree.merge(&tree);
                    info!(
                        dir = %dir,
                        snap_id = *id,
                        snap = %name,
                        duration_ms = duration.as_millis() as u64,
                        "snapshot synchronized"
                    );
                }
                Err(e) => {
                    hooks.clear_current_syncing_snap();
                    return Err(e);
                }
            }
        }
        cycle.snaps_deferred = diff.pending.len().saturating_sub(cap) as u64;
        Ok(cycle)
    }

    /// Removes remote snapshots that no longer exist locally.
    pub fn propagate_snap_deletes(
        &self,
        dir: &str,
        names: &BTreeSet<String>,
        hooks: &dyn SyncHooks,
    ) -> MirrorResult<u64> {
        let mut deleted = 0;
        for name in names {
            hooks.should_backoff()?;
            match self.remote.remove_snapshot(dir, name) {
                Ok(()) => {
                    hooks.inc_deleted_snap();
                    deleted += 1;
                    info!(dir = %dir, snap = %name, "deleted remote snapshot");
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    debug!(dir = %dir, snap = %name, "remote snapshot already gone");
                }
                Err(e) => return Err(MirrorError::fs("remove_snapshot", dir, e)),
            }
        }
        Ok(deleted)
    }

    /// Renames remote snapshots whose local counterpart was renamed.
    ///
    /// A rename waits while its target name is still the source of another
    /// pending rename. When every pending rename waits (a cycle such as a
    /// swap), one source is parked under an unused temporary name first.
    pub fn propagate_snap_renames(
        &self,
        dir: &str,
        renames: &BTreeSet<(String, String)>,
        hooks: &dyn SyncHooks,
    ) -> MirrorResult<u64> {
        if renames.is_empty() {
            return Ok(0);
        }
        let mut taken: BTreeSet<String> = self
            .remote
            .list_snapshots(dir)
            .map_err(|e| MirrorError::fs("list_snapshots", dir, e))?
            .into_iter()
            .map(|s| s.name)
            .collect();
        let mut pending: Vec<(String, String)> = renames.iter().cloned().collect();
        let mut renamed = 0;

        while !pending.is_empty() {
            hooks.should_backoff()?;
            let ready = pending
                .iter()
                .position(|(_, to)| !pending.iter().any(|(from, _)| from == to));
            match ready {
                Some(idx) => {
                    let (from, to) = pending.remove(idx);
                    if self.rename_remote_snap(dir, &from, &to)? {
                        hooks.inc_renamed_snap();
                        renamed += 1;
                        info!(dir = %dir, from = %from, to = %to, "renamed remote snapshot");
                    }
                    taken.remove(&from);
                    taken.insert(to);
                }
                None => {
                    let (from, to) = pending[0].clone();
                    let parked = temp_snap_name(&to, |name| {
                        taken.contains(name) || pending.iter().any(|(_, t)| t == name)
                    });
                    self.rename_remote_snap(dir, &from, &parked)?;
                    debug!(dir = %dir, from = %from, parked = %parked, "parked remote snapshot");
                    taken.remove(&from);
                    taken.insert(parked.clone());
                    pending[0].0 = parked;
                }
            }
        }
        Ok(renamed)
    }

    /// Transfers snapshot `snap_name` to the peer and commits it there.
    ///
    /// If the remote directory's marker already names `snap_id`, the data was
    /// transferred by an earlier attempt and only the commit is repeated.
    pub fn synchronize(
        &self,
        dir: &str,
        snap_id: u64,
        snap_name: &str,
        hooks: &dyn SyncHooks,
    ) -> MirrorResult<TreeSyncStats> {
        let tree = if self.remote_marker(dir)? == Some(snap_id) {
            debug!(dir = %dir, snap_id, "snapshot data already transferred, committing");
            TreeSyncStats::default()
        } else {
            let backoff = || hooks.should_backoff();
            let tree = FileTreeSynchronizer::new(
                self.local,
                self.remote,
                self.config.copy_buffer_size,
                &backoff,
            )
            .do_synchronize(dir, snap_name)?;
            self.remote
                .set_xattr(dir, PRIMARY_SNAP_ID_KEY, snap_id.to_string().as_bytes())
                .map_err(|e| MirrorError::fs("set_xattr", dir, e))?;
            tree
        };

        let mut metadata = BTreeMap::new();
        metadata.insert(PRIMARY_SNAP_ID_KEY.to_string(), snap_id.to_string());
        match self.remote.create_snapshot(dir, snap_name, &metadata) {
            Ok(()) => Ok(tree),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                let committed = build_snap_map(self.remote, dir, SnapSource::Remote)?
                    .get(&snap_id)
                    .map_or(false, |name| name == snap_name);
                if committed {
                    Ok(tree)
                } else {
                    Err(MirrorError::fs("create_snapshot", dir, e))
                }
            }
            Err(e) => Err(MirrorError::fs("create_snapshot", dir, e)),
        }
    }

    fn remote_marker(&self, dir: &str) -> MirrorResult<Option<u64>> {
        match self.remote.get_xattr(dir, PRIMARY_SNAP_ID_KEY) {
            Ok(Some(raw)) => Ok(std::str::from_utf8(&raw)
                .ok()
                .and_then(|s| s.trim().parse::<u64>().ok())),
            Ok(None) => Ok(None),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(MirrorError::fs("get_xattr", dir, e)),
        }
    }

    /// Renames one remote snapshot; false if an earlier attempt already did.
    fn rename_remote_snap(&self, dir: &str, from: &str, to: &str) -> MirrorResult<bool> {
        match self.remote.rename_snapshot(dir, from, to) {
            Ok(()) => Ok(true),
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::NotFound | io::ErrorKind::AlreadyExists
                ) && self.rename_applied(dir, from, to)? =>
            {
                debug!(dir = %dir, from = %from, to = %to, "remote snapshot already renamed");
                Ok(false)
            }
            Err(e) => Err(MirrorError::fs("rename_snapshot", dir, e)),
        }
    }

    fn rename_applied(&self, dir: &str, from: &str, to: &str) -> MirrorResult<bool> {
        let snaps = self
            .remote
            .list_snapshots(dir)
            .map_err(|e| MirrorError::fs("list_snapshots", dir, e))?;
        Ok(!snaps.iter().any(|s| s.name == from) && snaps.iter().any(|s| s.name == to))
    }
}

/// First of `<target>.mirror-tmp`, `<target>.mirror-tmp.1`, ... not in use.
fn temp_snap_name(target: &str, in_use: impl Fn(&str) -> bool) -> String {
    let base = format!("{}.mirror-tmp", target);
    let mut name = base.clone();
    let mut n = 1u32;
    while in_use(&name) {
        name = format!("{}.{}", base, n);
        n += 1;
    }
    name
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem_fs::MemMount;
    use std::cell::{Cell, RefCell};

    #[derive(Default)]
    struct RecordingHooks {
        backoff_calls: Cell<usize>,
        fail_after: Option<usize>,
        last_synced: RefCell<Option<(u64, String)>>,
        current: RefCell<Option<(u64, String)>>,
        deleted: Cell<u64>,
        renamed: Cell<u64>,
        synced: RefCell<Vec<u64>>,
    }

    impl SyncHooks for RecordingHooks {
        fn should_backoff(&self) -> MirrorResult<()> {
            let n = self.backoff_calls.get() + 1;
            self.backoff_calls.set(n);
            match self.fail_after {
                Some(limit) if n > limit => Err(MirrorError::Canceled),
                _ => Ok(()),
            }
        }

        fn set_last_synced_snap(&self, snap_id: u64, snap_name: &str) {
            *self.last_synced.borrow_mut() = Some((snap_id, snap_name.to_string()));
        }

        fn set_current_syncing_snap(&self, snap_id: u64, snap_name: &str) {
            *self.current.borrow_mut() = Some((snap_id, snap_name.to_string()));
        }

        fn clear_current_syncing_snap(&self) {
            *self.current.borrow_mut() = None;
        }

        fn inc_deleted_snap(&self) {
            self.deleted.set(self.deleted.get() + 1);
        }

        fn inc_renamed_snap(&self) {
            self.renamed.set(self.renamed.get() + 1);
        }

        fn set_last_synced_stat(
            &self,
            snap_id: u64,
            snap_name: &str,
            _duration: Duration,
            _tree: &TreeSyncStats,
        ) {
            self.set_last_synced_snap(snap_id, snap_name);
            self.clear_current_syncing_snap();
            self.synced.borrow_mut().push(snap_id);
        }
    }

    fn map(entries: &[(u64, &str)]) -> SnapMap {
        entries.iter().map(|(id, n)| (*id, n.to_string())).collect()
    }

    fn commit_remote(remote: &MemMount, dir: &str, name: &str, primary_id: u64) {
        let mut md = BTreeMap::new();
        md.insert(PRIMARY_SNAP_ID_KEY.to_string(), primary_id.to_string());
        remote.create_snapshot(dir, name, &md).unwrap();
    }

    fn mounts() -> (MemMount, MemMount) {
        let local = MemMount::new();
        let remote = MemMount::new();
        local.write_file("/d/f", b"v1").unwrap();
        remote.mkdirs("/d", 0o755).unwrap();
        (local, remote)
    }

    fn remote_names(remote: &MemMount) -> Vec<(u64, String)> {
        build_snap_map(remote, "/d", SnapSource::Remote)
            .unwrap()
            .into_iter()
            .collect()
    }

    #[test]
    fn test_plan_only_new_snapshot_pending() {
        let diff = plan_snap_diff(&map(&[(1, "a"), (2, "b")]), &map(&[(1, "a")]));
        assert!(diff.deletes.is_empty());
        assert!(diff.renames.is_empty());
        assert_eq!(diff.last_synced, Some((1, "a".to_string())));
        assert_eq!(diff.pending, vec![(2, "b".to_string())]);
    }

    #[test]
    fn test_plan_delete() {
        let diff = plan_snap_diff(&map(&[(1, "a")]), &map(&[(1, "a"), (2, "b")]));
        assert_eq!(diff.deletes.iter().collect::<Vec<_>>(), vec!["b"]);
        assert!(diff.pending.is_empty());
        assert_eq!(diff.last_synced, Some((1, "a".to_string())));
    }

    #[test]
    fn test_plan_rename() {
        let diff = plan_snap_diff(&map(&[(1, "a"), (2, "c")]), &map(&[(1, "a"), (2, "b")]));
        assert_eq!(
            diff.renames.into_iter().collect::<Vec<_>>(),
            vec![("b".to_string(), "c".to_string())]
        );
        assert!(diff.deletes.is_empty());
        assert!(diff.pending.is_empty());
        assert_eq!(diff.last_synced, Some((2, "c".to_string())));
    }

    #[test]
    fn test_plan_empty_remote_syncs_everything() {
        let diff = plan_snap_diff(&map(&[(3, "c"), (1, "a")]), &SnapMap::new());
        assert_eq!(diff.last_synced, None);
        assert_eq!(
            diff.pending,
            vec![(1, "a".to_string()), (3, "c".to_string())]
        );
    }

    #[test]
    fn test_build_remote_map_uses_primary_id() {
        let (_, remote) = mounts();
        commit_remote(&remote, "/d", "a", 42);
        let snaps = build_snap_map(&remote, "/d", SnapSource::Remote).unwrap();
        assert_eq!(snaps, map(&[(42, "a")]));
    }

    #[test]
    fn test_build_remote_map_missing_dir_is_empty() {
        let remote = MemMount::new();
        assert!(build_snap_map(&remote, "/nope", SnapSource::Remote)
            .unwrap()
            .is_empty());
        assert!(build_snap_map(&remote, "/nope", SnapSource::Local).is_err());
    }

    #[test]
    fn test_build_remote_map_rejects_unmarked_snapshot() {
        let (_, remote) = mounts();
        remote.create_snapshot("/d", "manual", &BTreeMap::new()).unwrap();
        let err = build_snap_map(&remote, "/d", SnapSource::Remote).unwrap_err();
        assert!(matches!(err, MirrorError::InvalidSnapshot { ref snap, .. } if snap == "manual"));
    }

    #[test]
    fn test_sync_only_new_snapshot() {
        let (local, remote) = mounts();
        local.create_snapshot("/d", "a", &BTreeMap::new()).unwrap();
        local.write_file("/d/g", b"second").unwrap();
        local.create_snapshot("/d", "b", &BTreeMap::new()).unwrap();
        commit_remote(&remote, "/d", "a", 1);

        let config = MirrorConfig::default();
        let hooks = RecordingHooks::default();
        let cycle = SnapshotDiffEngine::new(&local, &remote, &config)
            .do_sync_snaps("/d", &hooks)
            .unwrap();

        assert_eq!(*hooks.synced.borrow(), vec![2]);
        assert_eq!(cycle.snaps_synced, 1);
        assert_eq!(cycle.snaps_deleted, 0);
        assert_eq!(cycle.snaps_renamed, 0);
        assert_eq!(remote_names(&remote), vec![(1, "a".into()), (2, "b".into())]);
        assert_eq!(remote.read_file("/d/g").unwrap(), b"second");
        assert_eq!(*hooks.last_synced.borrow(), Some((2, "b".to_string())));
    }

    #[test]
    fn test_sync_propagates_delete() {
        let (local, remote) = mounts();
        local.create_snapshot("/d", "a", &BTreeMap::new()).unwrap();
        commit_remote(&remote, "/d", "a", 1);
        commit_remote(&remote, "/d", "b", 2);

        let config = MirrorConfig::default();
        let hooks = RecordingHooks::default();
        SnapshotDiffEngine::new(&local, &remote, &config)
            .do_sync_snaps("/d", &hooks)
            .unwrap();

        assert_eq!(hooks.deleted.get(), 1);
        assert_eq!(remote_names(&remote), vec![(1, "a".into())]);
    }

    #[test]
    fn test_sync_propagates_rename_without_copy() {
        let (local, remote) = mounts();
        local.create_snapshot("/d", "a", &BTreeMap::new()).unwrap();
        local.create_snapshot("/d", "b", &BTreeMap::new()).unwrap();
        local.rename_snapshot("/d", "b", "c").unwrap();
        commit_remote(&remote, "/d", "a", 1);
        commit_remote(&remote, "/d", "b", 2);

        let config = MirrorConfig::default();
        let hooks = RecordingHooks::default();
        SnapshotDiffEngine::new(&local, &remote, &config)
            .do_sync_snaps("/d", &hooks)
            .unwrap();

        assert_eq!(hooks.renamed.get(), 1);
        assert_eq!(remote.op_count("create_file"), 0);
        assert_eq!(remote_names(&remote), vec![(1, "a".into()), (2, "c".into())]);
    }

    #[test]
    fn test_delete_of_missing_snapshot_is_done() {
        let (local, remote) = mounts();
        let config = MirrorConfig::default();
        let hooks = RecordingHooks::default();
        let names: BTreeSet<String> = ["gone".to_string()].into_iter().collect();
        let deleted = SnapshotDiffEngine::new(&local, &remote, &config)
            .propagate_snap_deletes("/d", &names, &hooks)
            .unwrap();
        assert_eq!(deleted, 0);
        assert_eq!(hooks.deleted.get(), 0);
    }

    #[test]
    fn test_rename_already_applied_is_done() {
        let (local, remote) = mounts();
        commit_remote(&remote, "/d", "c", 2);
        let config = MirrorConfig::default();
        let hooks = RecordingHooks::default();
        let renames: BTreeSet<(String, String)> =
            [("b".to_string(), "c".to_string())].into_iter().collect();
        let renamed = SnapshotDiffEngine::new(&local, &remote, &config)
            .propagate_snap_renames("/d", &renames, &hooks)
            .unwrap();
        assert_eq!(renamed, 0);
    }

    fn run_cycle(local: &MemMount, remote: &MemMount) -> MirrorResult<SyncCycle> {
        let config = MirrorConfig::default();
        SnapshotDiffEngine::new(local, remote, &config)
            .do_sync_snaps("/d", &RecordingHooks::default())
    }

    #[test]
    fn test_rename_chain_frees_targets_first() {
        let (local, remote) = mounts();
        local.create_snapshot("/d", "a", &BTreeMap::new()).unwrap();
        local.create_snapshot("/d", "b", &BTreeMap::new()).unwrap();
        local.rename_snapshot("/d", "b", "c").unwrap();
        local.rename_snapshot("/d", "a", "b").unwrap();
        commit_remote(&remote, "/d", "a", 1);
        commit_remote(&remote, "/d", "b", 2);

        let cycle = run_cycle(&local, &remote).unwrap();
        assert_eq!(cycle.snaps_renamed, 2);
        assert_eq!(cycle.snaps_synced, 0);
        assert_eq!(remote_names(&remote), vec![(1, "b".into()), (2, "c".into())]);
        assert_eq!(run_cycle(&local, &remote).unwrap().snaps_renamed, 0);
    }

    #[test]
    fn test_rename_swap_uses_temporary_name() {
        let (local, remote) = mounts();
        local.create_snapshot("/d", "a", &BTreeMap::new()).unwrap();
        local.create_snapshot("/d", "b", &BTreeMap::new()).unwrap();
        local.rename_snapshot("/d", "a", "t").unwrap();
        local.rename_snapshot("/d", "b", "a").unwrap();
        local.rename_snapshot("/d", "t", "b").unwrap();
        commit_remote(&remote, "/d", "a", 1);
        commit_remote(&remote, "/d", "b", 2);

        let cycle = run_cycle(&local, &remote).unwrap();
        assert_eq!(cycle.snaps_renamed, 2);
        assert_eq!(remote_names(&remote), vec![(1, "b".into()), (2, "a".into())]);
        assert_eq!(remote.op_count("create_file"), 0);
    }

    #[test]
    fn test_rename_rotation_of_three() {
        let (local, remote) = mounts();
        for (i, name) in ["x", "y", "z"].into_iter().enumerate() {
            local.create_snapshot("/d", name, &BTreeMap::new()).unwrap();
            commit_remote(&remote, "/d", name, i as u64 + 1);
        }
        local.rename_snapshot("/d", "x", "tmp").unwrap();
        local.rename_snapshot("/d", "z", "x").unwrap();
        local.rename_snapshot("/d", "y", "z").unwrap();
        local.rename_snapshot("/d", "tmp", "y").unwrap();

        run_cycle(&local, &remote).unwrap();
        assert_eq!(
            remote_names(&remote),
            vec![(1, "y".into()), (2, "z".into()), (3, "x".into())]
        );
    }

    #[test]
    fn test_interrupted_swap_completes_next_cycle() {
        let (local, remote) = mounts();
        local.create_snapshot("/d", "a", &BTreeMap::new()).unwrap();
        local.create_snapshot("/d", "b", &BTreeMap::new()).unwrap();
        local.rename_snapshot("/d", "a", "t").unwrap();
        local.rename_snapshot("/d", "b", "a").unwrap();
        local.rename_snapshot("/d", "t", "b").unwrap();
        commit_remote(&remote, "/d", "b.mirror-tmp", 1);
        commit_remote(&remote, "/d", "b", 2);

        let cycle = run_cycle(&local, &remote).unwrap();
        assert_eq!(cycle.snaps_renamed, 2);
        assert_eq!(remote_names(&remote), vec![(1, "b".into()), (2, "a".into())]);
    }

    #[test]
    fn test_temporary_name_avoids_existing_names() {
        let (local, remote) = mounts();
        local.create_snapshot("/d", "a", &BTreeMap::new()).unwrap();
        local.create_snapshot("/d", "b", &BTreeMap::new()).unwrap();
        local.create_snapshot("/d", "b.mirror-tmp", &BTreeMap::new()).unwrap();
        local.rename_snapshot("/d", "a", "t").unwrap();
        local.rename_snapshot("/d", "b", "a").unwrap();
        local.rename_snapshot("/d", "t", "b").unwrap();
        commit_remote(&remote, "/d", "a", 1);
        commit_remote(&remote, "/d", "b", 2);
        commit_remote(&remote, "/d", "b.mirror-tmp", 3);

        run_cycle(&local, &remote).unwrap();
        assert_eq!(
            remote_names(&remote),
            vec![(1, "b".into()), (2, "a".into()), (3, "b.mirror-tmp".into())]
        );
    }

    #[test]
    fn test_rename_into_name_of_deleted_snapshot() {
        let (local, remote) = mounts();
        local.create_snapshot("/d", "a", &BTreeMap::new()).unwrap();
        local.create_snapshot("/d", "b", &BTreeMap::new()).unwrap();
        local.remove_snapshot("/d", "b").unwrap();
        local.rename_snapshot("/d", "a", "b").unwrap();
        commit_remote(&remote, "/d", "a", 1);
        commit_remote(&remote, "/d", "b", 2);

        let cycle = run_cycle(&local, &remote).unwrap();
        assert_eq!(cycle.snaps_deleted, 1);
        assert_eq!(cycle.snaps_renamed, 1);
        assert_eq!(remote_names(&remote), vec![(1, "b".into())]);
    }

    #[test]
    fn test_temp_snap_name_skips_used_names() {
        assert_eq!(temp_snap_name("a", |_| false), "a.mirror-tmp");
        let used = ["a.mirror-tmp", "a.mirror-tmp.1"];
        assert_eq!(temp_snap_name("a", |n| used.contains(&n)), "a.mirror-tmp.2");
    }

    #[test]
    fn test_aborted_cycle_leaves_stats_untouched() {
        let (local, remote) = mounts();
        local.create_snapshot("/d", "a", &BTreeMap::new()).unwrap();
        local.create_snapshot("/d", "b", &BTreeMap::new()).unwrap();
        commit_remote(&remote, "/d", "a", 1);

        let config = MirrorConfig::default();
        let hooks = RecordingHooks {
            fail_after: Some(0),
            ..Default::default()
        };
        let err = SnapshotDiffEngine::new(&local, &remote, &config)
            .do_sync_snaps("/d", &hooks)
            .unwrap_err();
        assert!(matches!(err, MirrorError::Canceled));
        assert!(hooks.last_synced.borrow().is_none());
        assert!(hooks.current.borrow().is_none());
    }

    #[test]
    fn test_resume_skips_transfer() {
        let (local, remote) = mounts();
        local.create_snapshot("/d", "a", &BTreeMap::new()).unwrap();
        remote.set_xattr("/d", PRIMARY_SNAP_ID_KEY, b"1").unwrap();

        let config = MirrorConfig::default();
        let hooks = RecordingHooks::default();
        let cycle = SnapshotDiffEngine::new(&local, &remote, &config)
            .do_sync_snaps("/d", &hooks)
            .unwrap();

        assert_eq!(cycle.snaps_synced, 1);
        assert_eq!(cycle.tree, TreeSyncStats::default());
        assert_eq!(remote.op_count("create_file"), 0);
        assert_eq!(remote_names(&remote), vec![(1, "a".into())]);
    }

    #[test]
    fn test_marker_written_after_transfer() {
        let (local, remote) = mounts();
        local.create_snapshot("/d", "a", &BTreeMap::new()).unwrap();
        let config = MirrorConfig::default();
        SnapshotDiffEngine::new(&local, &remote, &config)
            .do_sync_snaps("/d", &RecordingHooks::default())
            .unwrap();
        assert_eq!(
            remote.get_xattr("/d", PRIMARY_SNAP_ID_KEY).unwrap(),
            Some(b"1".to_vec())
        );
    }

    #[test]
    fn test_per_cycle_cap() {
        let (local, remote) = mounts();
        for name in ["a", "b", "c"] {
            local.create_snapshot("/d", name, &BTreeMap::new()).unwrap();
        }
        let config = MirrorConfig {
            max_snapshot_sync_per_cycle: 1,
            ..Default::default()
        };
        let engine = SnapshotDiffEngine::new(&local, &remote, &config);

        let hooks = RecordingHooks::default();
        let cycle = engine.do_sync_snaps("/d", &hooks).unwrap();
        assert_eq!(cycle.snaps_synced, 1);
        assert_eq!(cycle.snaps_deferred, 2);
        assert_eq!(*hooks.synced.borrow(), vec![1]);

        let cycle = engine.do_sync_snaps("/d", &hooks).unwrap();
        assert_eq!(cycle.snaps_synced, 1);
        assert_eq!(*hooks.synced.borrow(), vec![1, 2]);
    }

    #[test]
    fn test_failure_clears_current_snapshot() {
        let (local, remote) = mounts();
        local.create_snapshot("/d", "a", &BTreeMap::new()).unwrap();
        remote.fail_op("create_snapshot", None);

        let config = MirrorConfig::default();
        let hooks = RecordingHooks::default();
        let err = SnapshotDiffEngine::new(&local, &remote, &config)
            .do_sync_snaps("/d", &hooks)
            .unwrap_err();
        assert!(matches!(err, MirrorError::Fs { op: "create_snapshot", .. }));
        assert!(hooks.current.borrow().is_none());
        assert!(hooks.synced.borrow().is_empty());

        remote.clear_faults();
        let cycle = SnapshotDiffEngine::new(&local, &remote, &config)
            .do_sync_snaps("/d", &hooks)
            .unwrap();
        assert_eq!(cycle.tree.files_copied, 0);
        assert_eq!(remote_names(&remote), vec![(1, "a".into())]);
    }

    #[test]
    fn test_backoff_aborts_before_side_effects() {
        let (local, remote) = mounts();
        local.create_snapshot("/d", "a", &BTreeMap::new()).unwrap();
        commit_remote(&remote, "/d", "old", 9);

        let config = MirrorConfig::default();
        let hooks = RecordingHooks {
            fail_after: Some(0),
            ..Default::default()
        };
        let err = SnapshotDiffEngine::new(&local, &remote, &config)
            .do_sync_snaps("/d", &hooks)
            .unwrap_err();
        assert!(matches!(err, MirrorError::Canceled));
        assert_eq!(remote.op_count("remove_snapshot"), 0);
        assert_eq!(remote_names(&remote), vec![(9, "old".into())]);
    }

    #[test]
    fn test_create_existing_snapshot_with_same_id_is_committed() {
        let (local, remote) = mounts();
        local.create_snapshot("/d", "a", &BTreeMap::new()).unwrap();
        commit_remote(&remote, "/d", "a", 1);
        let config = MirrorConfig::default();
        SnapshotDiffEngine::new(&local, &remote, &config)
            .synchronize("/d", 1, "a", &RecordingHooks::default())
            .unwrap();
        assert_eq!(remote_names(&remote), vec![(1, "a".into())]);

        let err = SnapshotDiffEngine::new(&local, &remote, &config)
            .synchronize("/d", 5, "a", &RecordingHooks::default())
            .unwrap_err();
        assert_eq!(err.io_kind(), Some(io::ErrorKind::AlreadyExists));
    }
}
