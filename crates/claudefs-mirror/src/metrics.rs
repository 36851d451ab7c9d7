//! Prometheus-compatible mirroring metrics.
//!
//! Counters are updated lock-free by worker threads and rendered in the
//! Prometheus text exposition format on demand.

use crate::tree_sync::TreeSyncStats;
use std::sync::atomic::{AtomicU64, Ordering};

/// A single Prometheus sample with its metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct Metric {
    /// Metric name (e.g., "claudefs_mirror_snaps_synced_total").
    pub name: String,
    /// Help text for the metric.
    pub help: String,
    /// Metric type ("counter" or "gauge").
    pub metric_type: &'static str,
    /// Label pairs.
    pub labels: Vec<(String, String)>,
    /// Current value.
    pub value: f64,
}

impl Metric {
    /// Create a new counter metric.
    pub fn counter(name: &str, help: &str, labels: Vec<(String, String)>, value: f64) -> Self {
        Self {
            name: name.to_string(),
            help: help.to_string(),
            metric_type: "counter",
            labels,
            value,
        }
    }

    /// Create a new gauge metric.
    pub fn gauge(name: &str, help: &str, labels: Vec<(String, String)>, value: f64) -> Self {
        Self {
            name: name.to_string(),
            help: help.to_string(),
            metric_type: "gauge",
            labels,
            value,
        }
    }

    /// Format this metric as Prometheus text exposition format.
    pub fn format(&self) -> String {
        let mut output = format!("# HELP {} {}\n", self.name, self.help);
        output.push_str(&format!("# TYPE {} {}\n", self.name, self.metric_type));
        if self.labels.is_empty() {
            output.push_str(&format!("{} {}\n", self.name, self.format_value()));
        } else {
            let label_str = self
                .labels
                .iter()
                .map(|(k, v)| format!("{}=\"{}\"", k, escape_label(v)))
                .collect::<Vec<_>>()
                .join(",");
            output.push_str(&format!(
                "{}{{{}}} {}\n",
                self.name,
                label_str,
                self.format_value()
            ));
        }
        output
    }

    fn format_value(&self) -> String {
        if self.value.fract() == 0.0 && self.value.abs() < 1e15 {
            format!("{}", self.value as i64)
        } else {
            format!("{}", self.value)
        }
    }
}

fn escape_label(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

/// Counters shared by all workers of one peer replayer.
#[derive(Debug, Default)]
pub struct MirrorMetrics {
    snaps_synced: AtomicU64,
    snaps_deleted: AtomicU64,
    snaps_renamed: AtomicU64,
    sync_failures: AtomicU64,
    files_copied: AtomicU64,
    bytes_copied: AtomicU64,
    entries_purged: AtomicU64,
}

impl MirrorMetrics {
    /// Creates zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts a committed snapshot and folds in its tree walk.
    pub fn record_snapshot_synced(&self, tree: &TreeSyncStats) {
        self.snaps_synced.fetch_add(1, Ordering::Relaxed);
        self.files_copied
            .fetch_add(tree.files_copied, Ordering::Relaxed);
        self.bytes_copied
            .fetch_add(tree.bytes_copied, Ordering::Relaxed);
        self.entries_purged
            .fetch_add(tree.entries_purged, Ordering::Relaxed);
    }

    /// Counts a deleted remote snapshot.
    pub fn record_snapshot_deleted(&self) {
        self.snaps_deleted.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a renamed remote snapshot.
    pub fn record_snapshot_renamed(&self) {
        self.snaps_renamed.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a failed directory sync attempt.
    pub fn record_sync_failure(&self) {
        self.sync_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshots committed on the peer.
    pub fn snaps_synced(&self) -> u64 {
        self.snaps_synced.load(Ordering::Relaxed)
    }

    /// Failed directory sync attempts.
    pub fn sync_failures(&self) -> u64 {
        self.sync_failures.load(Ordering::Relaxed)
    }

    /// Bytes of file data transferred.
    pub fn bytes_copied(&self) -> u64 {
        self.bytes_copied.load(Ordering::Relaxed)
    }

    /// Produce the list of Prometheus metrics, labelled with the peer and
    /// the current directory gauges.
    pub fn to_metrics(&self, peer: &str, directories: usize, failed: usize) -> Vec<Metric> {
        let labels = vec![("peer".to_string(), peer.to_string())];
        let counter = |name: &str, help: &str, v: &AtomicU64| {
            Metric::counter(name, help, labels.clone(), v.load(Ordering::Relaxed) as f64)
        };
        vec![
            counter(
                "claudefs_mirror_snaps_synced_total",
                "Snapshots synchronized to the peer",
                &self.snaps_synced,
            ),
            counter(
                "claudefs_mirror_snaps_deleted_total",
                "Remote snapshots deleted",
                &self.snaps_deleted,
            ),
            counter(
                "claudefs_mirror_snaps_renamed_total",
                "Remote snapshots renamed",
                &self.snaps_renamed,
            ),
            counter(
                "claudefs_mirror_sync_failures_total",
                "Failed directory synchronization attempts",
                &self.sync_failures,
            ),
            counter(
                "claudefs_mirror_files_copied_total",
                "Files whose data was transferred",
                &self.files_copied,
            ),
            counter(
                "claudefs_mirror_bytes_copied_total",
                "Bytes of file data transferred",
                &self.bytes_copied,
            ),
            counter(
                "claudefs_mirror_entries_purged_total",
                "Stale remote entries removed",
                &self.entries_purged,
            ),
            Metric::gauge(
                "claudefs_mirror_directories",
                "Directories configured for mirroring",
                labels.clone(),
                directories as f64,
            ),
            Metric::gauge(
                "claudefs_mirror_failed_directories",
                "Directories flagged as failed",
                labels.clone(),
                failed as f64,
            ),
        ]
    }

    /// Format all metrics as Prometheus text exposition format.
    pub fn format_prometheus(&self, peer: &str, directories: usize, failed: usize) -> String {
        self.to_metrics(peer, directories, failed)
            .iter()
            .map(Metric::format)
            .collect()
    }
}
