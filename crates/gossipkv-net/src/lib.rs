//! Networking primitives for gossipkv
//!
//! This crate provides:
//! - The transport capability the store consumes
//! - Member identity and health snapshots
//! - Typed, length-prefixed framing of gossip payloads
//! - An in-process loopback network

pub mod framing;
pub mod local;
pub mod member;
pub mod transport;

pub use framing::{Frame, FrameCodec, FrameError, FrameType};
pub use local::{LocalNetwork, LocalTransport};
pub use member::{Member, MemberState};
pub use transport::{EventReceiver, Transport, TransportError, TransportEvent};
