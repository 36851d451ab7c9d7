//! Identity of a mirroring peer.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Where the remote filesystem lives.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemotePeer {
    /// Client name used to authenticate against the remote cluster.
    pub client_name: String,
    /// Remote cluster name.
    pub cluster_name: String,
    /// Remote filesystem name.
    pub fs_name: String,
}

/// The remote cluster and filesystem that is the mirroring target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Peer {
    /// Unique peer identifier.
    pub uuid: Uuid,
    /// Remote location.
    pub remote: RemotePeer,
}

impl Peer {
    /// Creates a peer with a fresh random identifier.
    pub fn new(client_name: &str, cluster_name: &str, fs_name: &str) -> Self {
        Self::with_uuid(Uuid::new_v4(), client_name, cluster_name, fs_name)
    }

    /// Creates a peer with a known identifier.
    pub fn with_uuid(uuid: Uuid, client_name: &str, cluster_name: &str, fs_name: &str) -> Self {
        Self {
            uuid,
            remote: RemotePeer {
                client_name: client_name.to_string(),
                cluster_name: cluster_name.to_string(),
                fs_name: fs_name.to_string(),
            },
        }
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}@{}/{})",
            self.uuid, self.remote.client_name, self.remote.cluster_name, self.remote.fs_name
        )
    }
}
