//! The transport capability consumed by the store
//!
//! Point-to-point delivery and failure detection live behind this trait. The
//! store only needs to broadcast payloads, read a member snapshot, and drain
//! an event stream of inbound payloads and membership changes.

use crate::member::Member;
use thiserror::Error;
use tokio::sync::mpsc;

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Transport closed")]
    Closed,
    #[error("Member already joined: {0}")]
    AlreadyJoined(String),
}

/// Event from the transport layer
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A member joined the cluster
    MemberJoined(Member),
    /// A member left or was declared dead
    MemberLeft(Member),
    /// A broadcast payload arrived
    PayloadReceived { from: String, payload: Vec<u8> },
}

/// Receiving half of a transport's event stream
pub type EventReceiver = mpsc::Receiver<TransportEvent>;

/// Gossip transport capability.
///
/// Broadcast is best-effort: a payload may reach some members, all members or
/// none, in any order relative to other broadcasts.
pub trait Transport: Send + Sync {
    /// This node
    fn local_member(&self) -> Member;

    /// Snapshot of the known members, including this node
    fn members(&self) -> Vec<Member>;

    /// Queue a payload for delivery to every other member
    fn broadcast(&self, payload: Vec<u8>) -> Result<(), TransportError>;
}
