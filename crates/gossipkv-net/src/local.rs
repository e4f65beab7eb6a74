//! In-process loopback network
//!
//! Connects any number of nodes inside one process through bounded channels.
//! Used by tests and by the daemon's simulation mode.

use crate::member::{Member, MemberState};
use crate::transport::{EventReceiver, Transport, TransportError, TransportEvent};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

/// Default per-node inbound queue length
pub const DEFAULT_QUEUE_LEN: usize = 1024;

/// Base port for synthesized member addresses
const BASE_PORT: u16 = 7946;

struct Node {
    member: Member,
    tx: mpsc::Sender<TransportEvent>,
}

#[derive(Default)]
struct Inner {
    nodes: BTreeMap<String, Node>,
    joined_total: u16,
}

/// Shared hub all local transports attach to
#[derive(Clone)]
pub struct LocalNetwork {
    inner: Arc<RwLock<Inner>>,
    queue_len: usize,
}

impl LocalNetwork {
    /// Create an empty network
    pub fn new() -> Self {
        Self::with_queue_len(DEFAULT_QUEUE_LEN)
    }

    /// Create a network with a custom per-node inbound queue length
    pub fn with_queue_len(queue_len: usize) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner::default())),
            queue_len: queue_len.max(1),
        }
    }

    /// Attach a node; every existing member is told it joined
    pub fn join(&self, name: &str) -> Result<(Arc<LocalTransport>, EventReceiver), TransportError> {
        let mut inner = self.inner.write();
        if inner.nodes.contains_key(name) {
            return Err(TransportError::AlreadyJoined(name.to_string()));
        }

        let port = BASE_PORT.wrapping_add(inner.joined_total);
        inner.joined_total = inner.joined_total.wrapping_add(1);
        let member = Member::new(name, SocketAddr::from((Ipv4Addr::LOCALHOST, port)));

        for node in inner.nodes.values() {
            deliver(&node.member.name, &node.tx, TransportEvent::MemberJoined(member.clone()));
        }

        let (tx, rx) = mpsc::channel(self.queue_len);
        inner.nodes.insert(
            name.to_string(),
            Node {
                member: member.clone(),
                tx,
            },
        );
        info!("{} joined local network ({} members)", member, inner.nodes.len());

        let transport = Arc::new(LocalTransport {
            name: name.to_string(),
            network: self.clone(),
        });
        Ok((transport, rx))
    }

    /// Detach a node. Its event stream ends once drained and the remaining
    /// members are told it left.
    pub fn disconnect(&self, name: &str) -> Option<Member> {
        let mut inner = self.inner.write();
        let mut member = inner.nodes.remove(name)?.member;
        member.state = MemberState::Left;

        for node in inner.nodes.values() {
            deliver(&node.member.name, &node.tx, TransportEvent::MemberLeft(member.clone()));
        }
        info!("{} left local network", member);
        Some(member)
    }

    /// Snapshot of attached members
    pub fn members(&self) -> Vec<Member> {
        self.inner
            .read()
            .nodes
            .values()
            .map(|n| n.member.clone())
            .collect()
    }

    fn member(&self, name: &str) -> Option<Member> {
        self.inner.read().nodes.get(name).map(|n| n.member.clone())
    }

    fn broadcast_from(&self, from: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        let inner = self.inner.read();
        if !inner.nodes.contains_key(from) {
            return Err(TransportError::Closed);
        }

        for (name, node) in inner.nodes.iter().filter(|(name, _)| name.as_str() != from) {
            deliver(
                name,
                &node.tx,
                TransportEvent::PayloadReceived {
                    from: from.to_string(),
                    payload: payload.clone(),
                },
            );
        }
        Ok(())
    }
}

impl Default for LocalNetwork {
    fn default() -> Self {
        Self::new()
    }
}

/// Best-effort delivery: a full queue drops the event like a lost datagram
fn deliver(to: &str, tx: &mpsc::Sender<TransportEvent>, event: TransportEvent) {
    match tx.try_send(event) {
        Ok(()) => {}
        Err(TrySendError::Full(_)) => warn!("Inbound queue of {} full, dropping event", to),
        Err(TrySendError::Closed(_)) => debug!("Inbound queue of {} closed", to),
    }
}

/// One node's handle on a [`LocalNetwork`]
pub struct LocalTransport {
    name: String,
    network: LocalNetwork,
}

impl Transport for LocalTransport {
    fn local_member(&self) -> Member {
        self.network.member(&self.name).unwrap_or_else(|| {
            let mut gone = Member::new(&self.name, SocketAddr::from((Ipv4Addr::LOCALHOST, 0)));
            gone.state = MemberState::Left;
            gone
        })
    }

    fn members(&self) -> Vec<Member> {
        self.network.members()
    }

    fn broadcast(&self, payload: Vec<u8>) -> Result<(), TransportError> {
        self.network.broadcast_from(&self.name, payload)
    }
}
