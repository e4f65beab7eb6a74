//! Versioned, codec-tagged value store
//!
//! The store is the single owner of every [`ValueDescriptor`]. Callers only
//! ever receive copies; all mutation goes through [`Store::cas`] (local
//! writes) or [`Store::merge_remote`] (gossip), both of which serialize on the
//! store's write lock for the duration of a version check and commit.

use crate::message_log::{Direction, MessageLog};
use gossipkv_core::{
    Codec, CodecId, CodecRegistry, KeyValuePair, Mergeable, Value, ValueDescriptor,
};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, Notify};
use tracing::{debug, warn};

/// Buffered change notifications per watcher before it starts lagging
const WATCH_BUFFER: usize = 256;

/// Store errors
#[derive(Debug, Error)]
pub enum StoreError {
    /// Concurrent writers kept winning; retrying later may succeed
    #[error("write conflict on key {key} after {attempts} attempts")]
    WriteConflict { key: String, attempts: u32 },
    #[error("codec mismatch on key {key}: local {local}, incoming {incoming}")]
    CodecMismatch {
        key: String,
        local: CodecId,
        incoming: CodecId,
    },
    #[error("unknown codec: {0}")]
    UnknownCodec(CodecId),
    #[error("codec error: {0}")]
    Codec(#[from] gossipkv_core::Error),
}

impl StoreError {
    /// Whether the caller may simply try again
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::WriteConflict { .. })
    }
}

/// Result of merging a remote descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Key was unknown locally; the incoming descriptor was taken as is
    Adopted,
    /// The codec merge changed the local value
    Merged,
    /// The incoming value carried nothing new
    Unchanged,
}

/// Where an accepted change came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Local,
    Remote,
}

/// Notification sent to watchers after every accepted change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyChange {
    pub key: String,
    pub version: u64,
    pub origin: Origin,
}

/// In-memory replica
pub struct Store {
    registry: Arc<CodecRegistry>,
    values: RwLock<HashMap<String, ValueDescriptor>>,
    /// Keys changed since the last outbound gossip round
    pending: Mutex<BTreeSet<String>>,
    changed: Notify,
    log: Arc<MessageLog>,
    watchers: broadcast::Sender<KeyChange>,
    cas_retries: u32,
}

impl Store {
    /// Create an empty store
    pub fn new(registry: Arc<CodecRegistry>, log: Arc<MessageLog>, cas_retries: u32) -> Self {
        let (watchers, _) = broadcast::channel(WATCH_BUFFER);
        Self {
            registry,
            values: RwLock::new(HashMap::new()),
            pending: Mutex::new(BTreeSet::new()),
            changed: Notify::new(),
            log,
            watchers,
            cas_retries: cas_retries.max(1),
        }
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Copy of the descriptor for `key`
    pub fn get(&self, key: &str) -> Option<ValueDescriptor> {
        self.values.read().get(key).cloned()
    }

    /// Copy of the value for `key` as its concrete type
    pub fn get_typed<T: Mergeable>(&self, key: &str) -> Option<T> {
        self.get(key)
            .and_then(|desc| desc.downcast_ref::<T>().cloned())
    }

    /// Independent copy of every descriptor
    pub fn snapshot(&self) -> BTreeMap<String, ValueDescriptor> {
        self.values
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.values.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn registry(&self) -> &Arc<CodecRegistry> {
        &self.registry
    }

    pub fn lookup_codec(&self, id: CodecId) -> Option<Arc<dyn Codec>> {
        self.registry.lookup(id)
    }

    pub fn message_log(&self) -> &Arc<MessageLog> {
        &self.log
    }

    // ========================================================================
    // Local writes
    // ========================================================================

    /// Compare-and-swap a key.
    ///
    /// `f` receives the current value (or the codec's zero value) and returns
    /// the replacement, or `None` to leave the key untouched. No lock is held
    /// while `f` runs, so it may read or even write the store; if anything
    /// else commits to `key` in the meantime, `f` is called again with the
    /// newer value. Returns the committed descriptor, or `None` when `f`
    /// declined to write.
    pub fn cas<F>(&self, key: &str, codec_id: CodecId, mut f: F) -> Result<Option<ValueDescriptor>, StoreError>
    where
        F: FnMut(&Value) -> Option<Value>,
    {
        let codec = self.codec(codec_id)?;

        for attempt in 1..=self.cas_retries {
            let (input, observed) = match self.get(key) {
                Some(desc) if desc.codec != codec_id => {
                    return Err(StoreError::CodecMismatch {
                        key: key.to_string(),
                        local: desc.codec,
                        incoming: codec_id,
                    })
                }
                Some(desc) => (desc.value, Some(desc.version)),
                None => (codec.zero(), None),
            };

            let Some(output) = f(&input) else {
                return Ok(None);
            };
            codec.check(&output)?;

            let mut values = self.values.write();
            let current = values.get(key).map(|d| d.version);
            if current != observed {
                debug!(key, attempt, ?observed, ?current, "CAS lost a race, retrying");
                continue;
            }

            let version = observed.map_or(1, |v| v + 1);
            let desc = ValueDescriptor::new(output, version, codec_id);
            values.insert(key.to_string(), desc.clone());
            drop(values);

            self.accepted(key, &desc, Origin::Local);
            return Ok(Some(desc));
        }

        warn!(key, attempts = self.cas_retries, "CAS gave up after repeated conflicts");
        Err(StoreError::WriteConflict {
            key: key.to_string(),
            attempts: self.cas_retries,
        })
    }

    /// [`cas`](Self::cas) over the concrete value type of `codec_id`
    pub fn cas_typed<T, F>(&self, key: &str, codec_id: CodecId, mut f: F) -> Result<Option<ValueDescriptor>, StoreError>
    where
        T: Mergeable,
        F: FnMut(&T) -> Option<T>,
    {
        let codec = self.codec(codec_id)?;
        if codec.zero().downcast_ref::<T>().is_none() {
            return Err(gossipkv_core::Error::TypeMismatch {
                codec: codec_id,
                expected: std::any::type_name::<T>(),
            }
            .into());
        }

        self.cas(key, codec_id, |value| {
            value
                .downcast_ref::<T>()
                .and_then(&mut f)
                .map(Value::new)
        })
    }

    // ========================================================================
    // Remote merges
    // ========================================================================

    /// Merge a descriptor received from a peer.
    ///
    /// Unknown keys adopt the incoming descriptor verbatim. Known keys run the
    /// codec merge; a changed result is stored at
    /// `max(local.version, incoming.version) + 1`. A value whose type does
    /// not belong to its codec is rejected either way.
    pub fn merge_remote(&self, key: &str, incoming: ValueDescriptor) -> Result<MergeOutcome, StoreError> {
        let codec = self.codec(incoming.codec)?;
        codec.check(&incoming.value)?;

        let mut values = self.values.write();
        let (desc, outcome) = match values.get(key) {
            None => (incoming, MergeOutcome::Adopted),
            Some(local) if local.codec != incoming.codec => {
                return Err(StoreError::CodecMismatch {
                    key: key.to_string(),
                    local: local.codec,
                    incoming: incoming.codec,
                });
            }
            Some(local) => match codec.merge(&local.value, &incoming.value)? {
                None => return Ok(MergeOutcome::Unchanged),
                Some(merged) => (
                    ValueDescriptor::new(
                        merged,
                        local.version.max(incoming.version) + 1,
                        local.codec,
                    ),
                    MergeOutcome::Merged,
                ),
            },
        };
        values.insert(key.to_string(), desc.clone());
        drop(values);

        self.accepted(key, &desc, Origin::Remote);
        Ok(outcome)
    }

    // ========================================================================
    // Outbound queue
    // ========================================================================

    /// Drain the keys changed since the previous call
    pub fn take_pending(&self) -> Vec<String> {
        std::mem::take(&mut *self.pending.lock()).into_iter().collect()
    }

    /// Put keys back for the next round after a failed broadcast
    pub fn requeue(&self, keys: impl IntoIterator<Item = String>) {
        self.pending.lock().extend(keys);
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Signalled after every accepted change
    pub fn changed(&self) -> &Notify {
        &self.changed
    }

    /// Encode the current descriptor of `key` for the wire
    pub fn encode_pair(&self, key: &str) -> Result<Option<KeyValuePair>, StoreError> {
        match self.get(key) {
            Some(desc) => self.encode_descriptor(key, &desc).map(Some),
            None => Ok(None),
        }
    }

    /// Encode a descriptor previously read from this store
    pub fn encode_descriptor(&self, key: &str, desc: &ValueDescriptor) -> Result<KeyValuePair, StoreError> {
        let codec = self.codec(desc.codec)?;
        Ok(KeyValuePair {
            key: key.to_string(),
            value: codec.encode(&desc.value)?,
            codec: desc.codec,
            version: desc.version,
        })
    }

    // ========================================================================
    // Watchers
    // ========================================================================

    /// Receive every accepted change
    pub fn subscribe(&self) -> broadcast::Receiver<KeyChange> {
        self.watchers.subscribe()
    }

    /// Receive changes to exactly `key`
    pub fn watch_key(&self, key: impl Into<String>) -> Watch {
        Watch {
            rx: self.subscribe(),
            filter: WatchFilter::Key(key.into()),
        }
    }

    /// Receive changes to keys starting with `prefix`
    pub fn watch_prefix(&self, prefix: impl Into<String>) -> Watch {
        Watch {
            rx: self.subscribe(),
            filter: WatchFilter::Prefix(prefix.into()),
        }
    }

    // ========================================================================
    // Diagnostics
    // ========================================================================

    /// BLAKE3 digest over keys, codecs and encoded values.
    ///
    /// Versions are local bookkeeping and are left out, so converged replicas
    /// produce equal digests.
    pub fn digest(&self) -> Result<[u8; 32], StoreError> {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"gossipkv-store-v1:");
        for (key, desc) in self.snapshot() {
            let codec = self.codec(desc.codec)?;
            let encoded = codec.encode(&desc.value)?;
            hasher.update(&(key.len() as u64).to_le_bytes());
            hasher.update(key.as_bytes());
            hasher.update(&desc.codec.0.to_le_bytes());
            hasher.update(&(encoded.len() as u64).to_le_bytes());
            hasher.update(&encoded);
        }
        Ok(*hasher.finalize().as_bytes())
    }

    fn codec(&self, id: CodecId) -> Result<Arc<dyn Codec>, StoreError> {
        self.registry.lookup(id).ok_or(StoreError::UnknownCodec(id))
    }

    fn accepted(&self, key: &str, desc: &ValueDescriptor, origin: Origin) {
        // Sent messages are logged by the disseminator once broadcast
        if origin == Origin::Remote {
            self.log.record(Direction::Received, key, desc);
        }
        self.pending.lock().insert(key.to_string());
        self.changed.notify_one();
        // No receivers is fine
        let _ = self.watchers.send(KeyChange {
            key: key.to_string(),
            version: desc.version,
            origin,
        });
    }
}

#[derive(Debug, Clone)]
enum WatchFilter {
    Key(String),
    Prefix(String),
}

impl WatchFilter {
    fn matches(&self, key: &str) -> bool {
        match self {
            WatchFilter::Key(k) => k == key,
            WatchFilter::Prefix(p) => key.starts_with(p.as_str()),
        }
    }
}

/// Filtered stream of [`KeyChange`]s
pub struct Watch {
    rx: broadcast::Receiver<KeyChange>,
    filter: WatchFilter,
}

impl Watch {
    /// Next matching change, or `None` once the store is gone.
    ///
    /// A watcher that falls behind skips the changes it missed; it should
    /// re-read the keys it cares about rather than rely on every event.
    pub async fn next(&mut self) -> Option<KeyChange> {
        loop {
            match self.rx.recv().await {
                Ok(change) if self.filter.matches(&change.key) => return Some(change),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, filter = ?self.filter, "Watcher lagged, changes skipped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::init_test_logging;
    use gossipkv_core::codecs::{GCounter, LwwRegister, MaxCounter, G_COUNTER, LWW_REGISTER, MAX_COUNTER};
    use std::thread;

    fn store() -> Arc<Store> {
        init_test_logging();
        Arc::new(Store::new(
            Arc::new(CodecRegistry::with_builtin()),
            Arc::new(MessageLog::new(64)),
            10,
        ))
    }

    fn counter(n: u64, version: u64) -> ValueDescriptor {
        ValueDescriptor::new(Value::new(MaxCounter(n)), version, MAX_COUNTER)
    }

    fn value_of(store: &Store, key: &str) -> u64 {
        store.get_typed::<MaxCounter>(key).unwrap().0
    }

    // ========================================================================
    // Remote merge
    // ========================================================================

    #[test]
    fn test_counter_merge_scenario() {
        let store = store();
        assert_eq!(store.merge_remote("x", counter(5, 1)).unwrap(), MergeOutcome::Adopted);
        assert_eq!(store.merge_remote("x", counter(8, 1)).unwrap(), MergeOutcome::Merged);

        let desc = store.get("x").unwrap();
        assert_eq!(desc.downcast_ref::<MaxCounter>(), Some(&MaxCounter(8)));
        assert_eq!(desc.version, 2);
    }

    #[test]
    fn test_merged_version_exceeds_both_sides() {
        let store = store();
        store.merge_remote("x", counter(1, 3)).unwrap();
        store.merge_remote("x", counter(2, 9)).unwrap();
        assert_eq!(store.get("x").unwrap().version, 10);
    }

    #[test]
    fn test_merge_commutative() {
        let (a, b) = (store(), store());
        let first = LwwRegister::new(b"v1".to_vec(), 4, "n1");
        let second = LwwRegister::new(b"v2".to_vec(), 4, "n2");
        let wrap = |r: &LwwRegister| ValueDescriptor::new(Value::new(r.clone()), 1, LWW_REGISTER);

        a.merge_remote("cfg", wrap(&first)).unwrap();
        a.merge_remote("cfg", wrap(&second)).unwrap();
        b.merge_remote("cfg", wrap(&second)).unwrap();
        b.merge_remote("cfg", wrap(&first)).unwrap();

        assert_eq!(a.get_typed::<LwwRegister>("cfg"), b.get_typed::<LwwRegister>("cfg"));
        assert_eq!(a.get_typed::<LwwRegister>("cfg").unwrap().value, b"v2");
        assert_eq!(a.digest().unwrap(), b.digest().unwrap());
    }

    #[test]
    fn test_merge_idempotent() {
        let store = store();
        store.merge_remote("x", counter(1, 1)).unwrap();
        assert_eq!(store.merge_remote("x", counter(7, 4)).unwrap(), MergeOutcome::Merged);
        let after_first = store.get("x").unwrap().version;

        assert_eq!(store.merge_remote("x", counter(7, 4)).unwrap(), MergeOutcome::Unchanged);
        assert_eq!(store.get("x").unwrap().version, after_first);
        assert_eq!(value_of(&store, "x"), 7);
    }

    #[test]
    fn test_codec_mismatch_discards_update() {
        let store = store();
        store.merge_remote("x", counter(3, 1)).unwrap();

        let foreign = ValueDescriptor::new(Value::new(GCounter::default()), 5, G_COUNTER);
        let err = store.merge_remote("x", foreign).unwrap_err();
        assert!(matches!(err, StoreError::CodecMismatch { local, incoming, .. }
            if local == MAX_COUNTER && incoming == G_COUNTER));
        assert!(!err.is_retryable());

        let desc = store.get("x").unwrap();
        assert_eq!((desc.version, desc.codec), (1, MAX_COUNTER));
    }

    #[test]
    fn test_unknown_codec_rejected() {
        let store = store();
        let stray = ValueDescriptor::new(Value::new(MaxCounter(1)), 1, CodecId(77));
        assert!(matches!(
            store.merge_remote("x", stray),
            Err(StoreError::UnknownCodec(CodecId(77)))
        ));
        assert!(store.is_empty());
    }

    #[test]
    fn test_value_of_wrong_type_rejected() {
        let store = store();
        let mislabeled = ValueDescriptor::new(Value::new(MaxCounter(3)), 1, LWW_REGISTER);
        assert!(matches!(
            store.merge_remote("x", mislabeled),
            Err(StoreError::Codec(gossipkv_core::Error::TypeMismatch { .. }))
        ));
        assert!(store.is_empty());
        assert_eq!(store.take_pending(), Vec::<String>::new());

        // Still digestible and encodable afterwards
        store.merge_remote("y", counter(2, 1)).unwrap();
        store.digest().unwrap();
        assert!(store.encode_pair("y").unwrap().is_some());
    }

    // ========================================================================
    // Local writes
    // ========================================================================

    #[test]
    fn test_cas_starts_from_zero_value() {
        let store = store();
        let desc = store
            .cas_typed::<MaxCounter, _>("x", MAX_COUNTER, |c| Some(MaxCounter(c.0 + 1)))
            .unwrap()
            .unwrap();
        assert_eq!(desc.version, 1);
        assert_eq!(value_of(&store, "x"), 1);
    }

    #[test]
    fn test_cas_declined_write_keeps_version() {
        let store = store();
        store.cas_typed::<MaxCounter, _>("x", MAX_COUNTER, |_| Some(MaxCounter(4))).unwrap();
        let out = store.cas_typed::<MaxCounter, _>("x", MAX_COUNTER, |_| None).unwrap();
        assert!(out.is_none());
        assert_eq!(store.get("x").unwrap().version, 1);
    }

    #[test]
    fn test_concurrent_cas_loses_no_write() {
        let store = store();
        let mut handles = vec![];

        for _ in 0..10 {
            let store = store.clone();
            handles.push(thread::spawn(move || {
                store
                    .cas_typed::<MaxCounter, _>("x", MAX_COUNTER, |c| Some(MaxCounter(c.0 + 1)))
                    .unwrap()
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let desc = store.get("x").unwrap();
        assert_eq!(desc.version, 10);
        assert_eq!(value_of(&store, "x"), 10);
    }

    #[test]
    fn test_cas_reentrant_writer_conflicts() {
        let store = store();
        let mut calls = 0;

        // Every attempt commits a competing write from inside the callback,
        // which is only possible because no lock is held while it runs.
        let err = store
            .cas_typed::<MaxCounter, _>("x", MAX_COUNTER, |c| {
                calls += 1;
                store
                    .cas_typed::<MaxCounter, _>("x", MAX_COUNTER, |inner| Some(MaxCounter(inner.0 + 1)))
                    .unwrap();
                Some(MaxCounter(c.0 + 100))
            })
            .unwrap_err();

        assert!(matches!(err, StoreError::WriteConflict { attempts: 10, .. }));
        assert!(err.is_retryable());
        assert_eq!(calls, 10);
        assert_eq!(value_of(&store, "x"), 10);
    }

    #[test]
    fn test_cas_wrong_codec_or_type() {
        let store = store();
        store.merge_remote("x", counter(1, 1)).unwrap();

        assert!(matches!(
            store.cas_typed::<GCounter, _>("x", G_COUNTER, |g| Some(g.clone())),
            Err(StoreError::CodecMismatch { .. })
        ));
        assert!(matches!(
            store.cas_typed::<GCounter, _>("y", MAX_COUNTER, |g| Some(g.clone())),
            Err(StoreError::Codec(gossipkv_core::Error::TypeMismatch { .. }))
        ));
    }

    #[test]
    fn test_cas_output_of_wrong_type_rejected() {
        let store = store();
        let result = store.cas("x", MAX_COUNTER, |_| Some(Value::new("not a counter".to_string())));
        assert!(matches!(
            result,
            Err(StoreError::Codec(gossipkv_core::Error::TypeMismatch { .. }))
        ));
        assert!(store.get("x").is_none());
        assert_eq!(store.pending_len(), 0);
    }

    #[test]
    fn test_version_monotonic_across_local_and_remote() {
        let store = store();
        let mut last = 0;
        for round in 0..20u64 {
            if round % 3 == 0 {
                store.merge_remote("x", counter(round * 2, round)).unwrap();
            } else {
                store
                    .cas_typed::<MaxCounter, _>("x", MAX_COUNTER, |c| Some(MaxCounter(c.0 + 1)))
                    .unwrap();
            }
            let version = store.get("x").unwrap().version;
            assert!(version >= last);
            last = version;
        }
    }

    // ========================================================================
    // Snapshots, queue and notifications
    // ========================================================================

    #[test]
    fn test_snapshot_isolation() {
        let store = store();
        store.merge_remote("x", counter(1, 1)).unwrap();
        let snapshot = store.snapshot();

        store.merge_remote("x", counter(9, 1)).unwrap();
        store.merge_remote("y", counter(2, 1)).unwrap();

        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot["x"].version, 1);
        assert_eq!(snapshot["x"].downcast_ref::<MaxCounter>(), Some(&MaxCounter(1)));
        assert_eq!(value_of(&store, "x"), 9);
    }

    #[test]
    fn test_accepted_changes_are_logged_and_queued() {
        let store = store();
        store.cas_typed::<MaxCounter, _>("a", MAX_COUNTER, |_| Some(MaxCounter(1))).unwrap();
        store.merge_remote("b", counter(1, 1)).unwrap();
        store.merge_remote("b", counter(1, 1)).unwrap();

        // Local writes are logged when broadcast, not when committed
        let (sent, received) = store.message_log().list();
        assert!(sent.is_empty());
        assert_eq!(received.len(), 1);

        assert_eq!(store.take_pending(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(store.pending_len(), 0);

        store.requeue(vec!["a".to_string()]);
        assert_eq!(store.take_pending(), vec!["a".to_string()]);
    }

    #[test]
    fn test_encode_pair() {
        let store = store();
        assert!(store.encode_pair("missing").unwrap().is_none());

        store.merge_remote("x", counter(6, 2)).unwrap();
        let pair = store.encode_pair("x").unwrap().unwrap();
        assert_eq!((pair.codec, pair.version), (MAX_COUNTER, 2));
        let codec = store.lookup_codec(MAX_COUNTER).unwrap();
        let decoded = codec.decode(&pair.value).unwrap();
        assert_eq!(decoded.downcast_ref::<MaxCounter>(), Some(&MaxCounter(6)));
    }

    #[tokio::test]
    async fn test_watch_prefix() {
        let store = store();
        let mut ring = store.watch_prefix("ring/");
        let mut exact = store.watch_key("config");

        store.merge_remote("other", counter(1, 1)).unwrap();
        store.merge_remote("ring/ingester", counter(1, 1)).unwrap();
        store
            .cas_typed::<MaxCounter, _>("config", MAX_COUNTER, |_| Some(MaxCounter(3)))
            .unwrap();

        let change = ring.next().await.unwrap();
        assert_eq!(change.key, "ring/ingester");
        assert_eq!(change.origin, Origin::Remote);

        let change = exact.next().await.unwrap();
        assert_eq!((change.key.as_str(), change.version, change.origin), ("config", 1, Origin::Local));
    }
}
