#![warn(missing_docs)]

//! ClaudeFS mirroring subsystem: snapshot replication of directories to a peer filesystem.
//!
//! A [`replayer::PeerReplayer`] runs a pool of worker threads. Each worker
//! picks a directory, claims it exclusively, diffs the directory's snapshots
//! against the peer's and replays deletes, renames and new snapshots there.

pub mod config;
pub mod error;
pub mod fs;
pub mod health;
pub mod mem_fs;
pub mod metrics;
pub mod peer;
pub mod queue;
pub mod registry;
pub mod replayer;
pub mod snap_diff;
pub mod stats;
pub mod tree_sync;

pub use config::MirrorConfig;
pub use error::{MirrorError, MirrorResult};
pub use fs::{FilesystemClient, SnapshotInfo, Stat};
pub use health::{BlocklistFlag, PeerHealth};
pub use mem_fs::MemMount;
pub use peer::Peer;
pub use replayer::PeerReplayer;
pub use snap_diff::PRIMARY_SNAP_ID_KEY;
pub use stats::{DirectoryStatus, PeerStatus, SyncState};
