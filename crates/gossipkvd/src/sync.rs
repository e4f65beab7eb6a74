//! Gossip dissemination
//!
//! Turns accepted store changes into framed broadcasts and inbound frames into
//! merges. Deltas carry only the keys changed since the previous round; a
//! full-state push carries every key and is used for newly joined members and
//! periodic anti-entropy. Delivery order is never assumed.

use crate::message_log::Direction;
use crate::store::{MergeOutcome, Store};
use gossipkv_core::canonical::{decode_batch, encode_batch};
use gossipkv_core::{GossipBatch, KeyValuePair, ValueDescriptor};
use gossipkv_net::{Frame, FrameError, FrameType, Transport, TransportError};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Sync protocol errors
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("Encoding error: {0}")]
    Encoding(#[from] gossipkv_core::Error),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

impl SyncError {
    /// The transport is gone for good
    pub fn is_fatal(&self) -> bool {
        matches!(self, SyncError::Transport(TransportError::Closed))
    }
}

/// Per-payload merge tally
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MergeReport {
    pub adopted: usize,
    pub merged: usize,
    pub unchanged: usize,
    pub dropped: usize,
}

impl MergeReport {
    /// Pairs that changed the local store
    pub fn accepted(&self) -> usize {
        self.adopted + self.merged
    }
}

/// Sync statistics
#[derive(Debug, Default, Clone, Serialize)]
pub struct SyncStats {
    pub deltas_sent: u64,
    pub full_states_sent: u64,
    pub pairs_sent: u64,
    pub payloads_received: u64,
    pub pairs_accepted: u64,
    pub pairs_dropped: u64,
}

#[derive(Default)]
struct Counters {
    deltas_sent: AtomicU64,
    full_states_sent: AtomicU64,
    pairs_sent: AtomicU64,
    payloads_received: AtomicU64,
    pairs_accepted: AtomicU64,
    pairs_dropped: AtomicU64,
}

/// Bridges a [`Store`] and a [`Transport`]
pub struct Disseminator {
    store: Arc<Store>,
    transport: Arc<dyn Transport>,
    max_pairs: usize,
    counters: Counters,
}

impl Disseminator {
    pub fn new(store: Arc<Store>, transport: Arc<dyn Transport>, max_pairs: usize) -> Self {
        Self {
            store,
            transport,
            max_pairs: max_pairs.max(1),
            counters: Counters::default(),
        }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Broadcast keys changed since the last flush.
    ///
    /// On failure the keys are queued again for the next round. Returns the
    /// number of pairs sent.
    pub fn flush(&self) -> Result<usize, SyncError> {
        let keys = self.store.take_pending();
        if keys.is_empty() {
            return Ok(0);
        }

        let pairs = self.encode_keys(&keys);
        match self.send(FrameType::Delta, pairs) {
            Ok(sent) => {
                debug!(keys = keys.len(), sent, "Delta gossip round");
                Ok(sent)
            }
            Err(e) => {
                self.store.requeue(keys);
                Err(e)
            }
        }
    }

    /// Broadcast every key in the store
    pub fn push_full_state(&self) -> Result<usize, SyncError> {
        let keys: Vec<String> = self.store.snapshot().into_keys().collect();
        if keys.is_empty() {
            return Ok(0);
        }

        let sent = self.send(FrameType::FullState, self.encode_keys(&keys))?;
        debug!(sent, "Full-state push");
        Ok(sent)
    }

    /// Merge one inbound payload.
    ///
    /// A payload that is not a valid frame or batch is rejected as a whole.
    /// Within a valid batch each pair stands alone: unknown codecs, undecodable
    /// values and codec mismatches are dropped without affecting the others.
    pub fn handle_payload(&self, from: &str, payload: &[u8]) -> Result<MergeReport, SyncError> {
        self.counters.payloads_received.fetch_add(1, Ordering::Relaxed);

        let frame = Frame::from_bytes(payload)?;
        let batch = decode_batch(&frame.payload)?;

        let mut report = MergeReport::default();
        for pair in batch.pairs {
            match self.merge_pair(pair) {
                Ok(MergeOutcome::Adopted) => report.adopted += 1,
                Ok(MergeOutcome::Merged) => report.merged += 1,
                Ok(MergeOutcome::Unchanged) => report.unchanged += 1,
                Err((key, reason)) => {
                    warn!(from, key = %key, "Dropping gossiped value: {}", reason);
                    report.dropped += 1;
                }
            }
        }

        self.counters
            .pairs_accepted
            .fetch_add(report.accepted() as u64, Ordering::Relaxed);
        self.counters
            .pairs_dropped
            .fetch_add(report.dropped as u64, Ordering::Relaxed);
        debug!(from, frame = ?frame.frame_type, ?report, "Merged gossip payload");
        Ok(report)
    }

    pub fn stats(&self) -> SyncStats {
        let c = &self.counters;
        SyncStats {
            deltas_sent: c.deltas_sent.load(Ordering::Relaxed),
            full_states_sent: c.full_states_sent.load(Ordering::Relaxed),
            pairs_sent: c.pairs_sent.load(Ordering::Relaxed),
            payloads_received: c.payloads_received.load(Ordering::Relaxed),
            pairs_accepted: c.pairs_accepted.load(Ordering::Relaxed),
            pairs_dropped: c.pairs_dropped.load(Ordering::Relaxed),
        }
    }

    fn merge_pair(&self, pair: KeyValuePair) -> Result<MergeOutcome, (String, String)> {
        let Some(codec) = self.store.lookup_codec(pair.codec) else {
            return Err((pair.key, format!("unknown codec {}", pair.codec)));
        };
        let value = match codec.decode(&pair.value) {
            Ok(value) => value,
            Err(e) => return Err((pair.key, format!("decode failed: {}", e))),
        };
        let desc = ValueDescriptor::new(value, pair.version, pair.codec);
        self.store
            .merge_remote(&pair.key, desc)
            .map_err(|e| (pair.key, e.to_string()))
    }

    fn encode_keys(&self, keys: &[String]) -> Vec<(KeyValuePair, ValueDescriptor)> {
        keys.iter()
            .filter_map(|key| {
                let desc = self.store.get(key)?;
                match self.store.encode_descriptor(key, &desc) {
                    Ok(pair) => Some((pair, desc)),
                    Err(e) => {
                        warn!(key = %key, "Skipping key that failed to encode: {}", e);
                        None
                    }
                }
            })
            .collect()
    }

    fn send(&self, frame_type: FrameType, pairs: Vec<(KeyValuePair, ValueDescriptor)>) -> Result<usize, SyncError> {
        let mut sent = 0;
        for chunk in pairs.chunks(self.max_pairs) {
            let batch = GossipBatch::new(chunk.iter().map(|(pair, _)| pair.clone()).collect());
            let frame = Frame::new(frame_type, encode_batch(batch)?);
            self.transport.broadcast(frame.to_bytes()?)?;

            match frame_type {
                FrameType::Delta => {
                    // Only deltas are logged; full-state pushes repeat the whole store
                    let log = self.store.message_log();
                    for (pair, desc) in chunk {
                        log.record(Direction::Sent, &pair.key, desc);
                    }
                    self.counters.deltas_sent.fetch_add(1, Ordering::Relaxed)
                }
                FrameType::FullState => self.counters.full_states_sent.fetch_add(1, Ordering::Relaxed),
            };
            self.counters
                .pairs_sent
                .fetch_add(chunk.len() as u64, Ordering::Relaxed);
            sent += chunk.len();
        }
        Ok(sent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message_log::MessageLog;
    use crate::test_utils::init_test_logging;
    use gossipkv_core::canonical::canonical_bytes;
    use gossipkv_core::codecs::{MaxCounter, MAX_COUNTER};
    use gossipkv_core::{CodecId, CodecRegistry};
    use gossipkv_net::{EventReceiver, LocalNetwork, TransportEvent};

    fn store() -> Arc<Store> {
        Arc::new(Store::new(
            Arc::new(CodecRegistry::with_builtin()),
            Arc::new(MessageLog::new(16)),
            10,
        ))
    }

    fn node(network: &LocalNetwork, name: &str, max_pairs: usize) -> (Disseminator, EventReceiver) {
        let (transport, events) = network.join(name).unwrap();
        (Disseminator::new(store(), transport, max_pairs), events)
    }

    fn encoded(n: u64) -> Vec<u8> {
        canonical_bytes(&MaxCounter(n)).unwrap()
    }

    fn payload(pairs: Vec<KeyValuePair>) -> Vec<u8> {
        Frame::delta(encode_batch(GossipBatch::new(pairs)).unwrap())
            .to_bytes()
            .unwrap()
    }

    async fn next_payload(events: &mut EventReceiver) -> (String, Vec<u8>) {
        loop {
            match events.recv().await {
                Some(TransportEvent::PayloadReceived { from, payload }) => return (from, payload),
                Some(_) => continue,
                None => panic!("event stream closed"),
            }
        }
    }

    fn bump(store: &Store, key: &str, n: u64) {
        store
            .cas_typed::<MaxCounter, _>(key, MAX_COUNTER, |_| Some(MaxCounter(n)))
            .unwrap();
    }

    #[test]
    fn test_unknown_codec_isolated_from_batch() {
        init_test_logging();
        let network = LocalNetwork::new();
        let (sync, _events) = node(&network, "a", 16);

        let bytes = payload(vec![
            KeyValuePair {
                key: "good".into(),
                value: encoded(4),
                codec: MAX_COUNTER,
                version: 1,
            },
            KeyValuePair {
                key: "stray".into(),
                value: vec![1, 2, 3],
                codec: CodecId(999),
                version: 1,
            },
        ]);

        let report = sync.handle_payload("b", &bytes).unwrap();
        assert_eq!(report.adopted, 1);
        assert_eq!(report.dropped, 1);
        assert_eq!(sync.store.get_typed::<MaxCounter>("good"), Some(MaxCounter(4)));
        assert!(sync.store.get("stray").is_none());
        assert_eq!(sync.stats().pairs_dropped, 1);
    }

    #[test]
    fn test_undecodable_value_dropped() {
        init_test_logging();
        let network = LocalNetwork::new();
        let (sync, _events) = node(&network, "a", 16);

        let bytes = payload(vec![KeyValuePair {
            key: "bad".into(),
            value: vec![0xff; 12],
            codec: MAX_COUNTER,
            version: 1,
        }]);
        let report = sync.handle_payload("b", &bytes).unwrap();
        assert_eq!(report, MergeReport { dropped: 1, ..Default::default() });
    }

    #[test]
    fn test_malformed_payload_rejected() {
        init_test_logging();
        let network = LocalNetwork::new();
        let (sync, _events) = node(&network, "a", 16);

        assert!(matches!(sync.handle_payload("b", &[0, 1]), Err(SyncError::Frame(_))));

        let garbage = Frame::delta(vec![0xff; 3]).to_bytes().unwrap();
        assert!(matches!(sync.handle_payload("b", &garbage), Err(SyncError::Encoding(_))));
    }

    #[tokio::test]
    async fn test_delta_reaches_peer() {
        init_test_logging();
        let network = LocalNetwork::new();
        let (a, _a_events) = node(&network, "a", 16);
        let (b, mut b_events) = node(&network, "b", 16);

        bump(&a.store, "x", 5);
        assert_eq!(a.flush().unwrap(), 1);
        assert_eq!(a.flush().unwrap(), 0);

        let (from, bytes) = next_payload(&mut b_events).await;
        assert_eq!(from, "a");
        let report = b.handle_payload(&from, &bytes).unwrap();
        assert_eq!(report.adopted, 1);
        assert_eq!(b.store.get_typed::<MaxCounter>("x"), Some(MaxCounter(5)));
        assert_eq!(b.store.get("x").unwrap().version, 1);
    }

    #[tokio::test]
    async fn test_full_state_split_into_batches() {
        init_test_logging();
        let network = LocalNetwork::new();
        let (a, _a_events) = node(&network, "a", 2);
        let (b, mut b_events) = node(&network, "b", 2);

        for (i, key) in ["k1", "k2", "k3", "k4", "k5"].iter().enumerate() {
            bump(&a.store, key, i as u64);
        }
        assert_eq!(a.push_full_state().unwrap(), 5);
        assert_eq!(a.stats().full_states_sent, 3);

        for _ in 0..3 {
            let (from, bytes) = next_payload(&mut b_events).await;
            let frame = Frame::from_bytes(&bytes).unwrap();
            assert_eq!(frame.frame_type, FrameType::FullState);
            b.handle_payload(&from, &bytes).unwrap();
        }
        assert_eq!(b.store.len(), 5);
        assert_eq!(a.store.digest().unwrap(), b.store.digest().unwrap());
    }

    #[test]
    fn test_failed_flush_requeues() {
        init_test_logging();
        let network = LocalNetwork::new();
        let (a, _events) = node(&network, "a", 16);

        bump(&a.store, "x", 1);
        network.disconnect("a");

        let err = a.flush().unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(a.store.pending_len(), 1);

        // Nothing left the node, so nothing is logged as sent
        let (sent, _) = a.store.message_log().list();
        assert!(sent.is_empty());
    }

    #[tokio::test]
    async fn test_sent_log_follows_broadcasts() {
        init_test_logging();
        let network = LocalNetwork::new();
        let (a, _a_events) = node(&network, "a", 16);
        let (b, mut b_events) = node(&network, "b", 16);
        let (_c, mut c_events) = node(&network, "c", 16);

        bump(&a.store, "x", 3);
        assert!(a.store.message_log().list().0.is_empty());
        a.flush().unwrap();

        let (sent, _) = a.store.message_log().list();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].key, "x");
        assert_eq!(sent[0].descriptor.version, 1);

        // Full-state pushes are not logged
        a.push_full_state().unwrap();
        assert_eq!(a.store.message_log().list().0.len(), 1);

        // A merged remote change is logged as sent once forwarded
        let (from, bytes) = next_payload(&mut b_events).await;
        b.handle_payload(&from, &bytes).unwrap();
        let (sent, received) = b.store.message_log().list();
        assert!(sent.is_empty());
        assert_eq!(received.len(), 1);

        assert_eq!(b.flush().unwrap(), 1);
        let (sent, _) = b.store.message_log().list();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].key, "x");

        let (from, _) = next_payload(&mut c_events).await;
        assert_eq!(from, "a");
    }
}
