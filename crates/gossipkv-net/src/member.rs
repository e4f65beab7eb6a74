//! Member identity and health as reported by the transport

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Liveness of a member, as judged by the transport's failure detector
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberState {
    Alive,
    Suspect,
    Dead,
    Left,
}

/// Snapshot of one cluster member.
///
/// Owned by the transport; the store only reads these for diagnostics.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    /// Unique member name
    pub name: String,
    /// Gossip address
    pub addr: SocketAddr,
    /// Current health
    pub state: MemberState,
    /// Last seen timestamp (unix millis)
    pub last_seen: u64,
}

impl Member {
    /// Create a new, alive member seen just now
    pub fn new(name: impl Into<String>, addr: SocketAddr) -> Self {
        let last_seen = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        Self {
            name: name.into(),
            addr,
            state: MemberState::Alive,
            last_seen,
        }
    }
}

impl std::fmt::Display for Member {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.name, self.addr)
    }
}
