//! Peer session health.
//!
//! The owning daemon watches the remote session; when the remote cluster
//! blocklists it every directory sync must stop until the peer is
//! reinitialized.

use std::sync::atomic::{AtomicBool, Ordering};

/// Answers whether the peer's mount session has been blocklisted.
pub trait PeerHealth: Send + Sync {
    /// Returns true if the remote session was forcibly invalidated.
    fn is_blocklisted(&self) -> bool;
}

/// A [`PeerHealth`] backed by a flag the daemon flips.
#[derive(Debug, Default)]
pub struct BlocklistFlag {
    blocklisted: AtomicBool,
}

impl BlocklistFlag {
    /// Creates a healthy flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the session blocklisted.
    pub fn set_blocklisted(&self) {
        if !self.blocklisted.swap(true, Ordering::SeqCst) {
            tracing::warn!("peer session blocklisted");
        }
    }

    /// Clears the flag after the peer was reinitialized.
    pub fn clear(&self) {
        if self.blocklisted.swap(false, Ordering::SeqCst) {
            tracing::info!("peer session restored");
        }
    }
}

impl PeerHealth for BlocklistFlag {
    fn is_blocklisted(&self) -> bool {
        self.blocklisted.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_transitions() {
        let flag = BlocklistFlag::new();
        assert!(!flag.is_blocklisted());
        flag.set_blocklisted();
        assert!(flag.is_blocklisted());
        flag.set_blocklisted();
        assert!(flag.is_blocklisted());
        flag.clear();
        assert!(!flag.is_blocklisted());
    }
}
