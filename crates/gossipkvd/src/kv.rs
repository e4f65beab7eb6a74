//! The running store service
//!
//! A [`Kv`] owns one replica, its disseminator and the background loop that
//! connects them to the transport. It is normally obtained through
//! [`KvInitService`](crate::init::KvInitService) rather than built directly.

use crate::config::KvConfig;
use crate::message_log::{Message, MessageLog};
use crate::service::{await_terminated, Service, ServiceError, ServiceState};
use crate::store::{Store, StoreError};
use crate::sync::{Disseminator, SyncError, SyncStats};
use gossipkv_core::{Codec, CodecId, CodecRegistry};
use gossipkv_net::{EventReceiver, Member, Transport, TransportEvent};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::time::{interval, interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

const SERVICE_NAME: &str = "gossipkv store";

/// Replicated key-value store bound to a transport
pub struct Kv {
    config: KvConfig,
    store: Arc<Store>,
    sync: Arc<Disseminator>,
    state: Arc<watch::Sender<ServiceState>>,
    stop: watch::Sender<bool>,
}

impl Kv {
    pub fn new(config: KvConfig, registry: Arc<CodecRegistry>, transport: Arc<dyn Transport>) -> Self {
        let log = Arc::new(MessageLog::new(config.message_history));
        let store = Arc::new(Store::new(registry, log, config.cas_retries));
        let sync = Arc::new(Disseminator::new(
            store.clone(),
            transport,
            config.max_pairs_per_broadcast,
        ));
        let (state, _) = watch::channel(ServiceState::New);
        let (stop, _) = watch::channel(false);

        Self {
            config,
            store,
            sync,
            state: Arc::new(state),
            stop,
        }
    }

    /// Spawn the background loop on `handle`.
    ///
    /// A service can be started once; it ends in [`ServiceState::Terminated`]
    /// after [`stop`](Self::stop) or in [`ServiceState::Failed`] when the loop
    /// dies.
    pub fn start(&self, handle: &Handle, events: EventReceiver) -> Result<(), ServiceError> {
        let starting = self.state.send_if_modified(|state| {
            if *state != ServiceState::New {
                return false;
            }
            *state = ServiceState::Starting;
            true
        });
        if !starting {
            return Err(ServiceError::InitializationFailure(format!(
                "{} on {} already started",
                SERVICE_NAME, self.config.node_name
            )));
        }

        let worker = Worker {
            node: self.config.node_name.clone(),
            gossip_interval: self.config.gossip_interval,
            full_state_interval: self.config.full_state_interval,
            store: self.store.clone(),
            sync: self.sync.clone(),
            stop: self.stop.subscribe(),
            events,
        };

        self.state.send_replace(ServiceState::Running);
        info!(node = %self.config.node_name, "Store running");

        let inner = handle.spawn(worker.run());
        let state = self.state.clone();
        let node = self.config.node_name.clone();
        handle.spawn(async move {
            let outcome = match inner.await {
                Ok(Ok(())) => ServiceState::Terminated,
                Ok(Err(e)) => ServiceState::Failed(e),
                Err(e) => ServiceState::Failed(ServiceError::StoreFailure(format!(
                    "background loop aborted: {}",
                    e
                ))),
            };
            match &outcome {
                ServiceState::Failed(e) => error!(node = %node, "Store failed: {}", e),
                _ => info!(node = %node, "Store terminated"),
            }
            state.send_replace(outcome);
        });

        Ok(())
    }

    /// Ask the background loop to finish. Idempotent; a service that was
    /// never started terminates immediately.
    pub fn stop(&self) {
        let never_started = self.state.send_if_modified(|state| {
            if *state != ServiceState::New {
                return false;
            }
            *state = ServiceState::Terminated;
            true
        });
        if !never_started {
            self.state.send_if_modified(|state| {
                if *state != ServiceState::Running {
                    return false;
                }
                *state = ServiceState::Stopping;
                true
            });
        }
        self.stop.send_replace(true);
    }

    /// Wait for a terminal state
    pub async fn await_terminated(&self) -> Result<(), ServiceError> {
        await_terminated(self.state.subscribe()).await
    }

    pub fn node_name(&self) -> &str {
        &self.config.node_name
    }

    pub fn config(&self) -> &KvConfig {
        &self.config
    }

    /// The replica. All reads and writes go through it.
    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn sync_stats(&self) -> SyncStats {
        self.sync.stats()
    }

    /// Broadcast pending changes now instead of waiting for the next round
    pub fn flush(&self) -> Result<usize, SyncError> {
        self.sync.flush()
    }

    // ========================================================================
    // Diagnostics
    // ========================================================================

    /// This node as the transport sees it
    pub fn local_member(&self) -> Member {
        self.sync.transport().local_member()
    }

    /// Cluster members sorted by name
    pub fn members(&self) -> Vec<Member> {
        let mut members = self.sync.transport().members();
        members.sort_by(|a, b| a.name.cmp(&b.name));
        members
    }

    /// Logged messages as `(sent, received)`, oldest first
    pub fn list_messages(&self) -> (Vec<Message>, Vec<Message>) {
        self.store.message_log().list()
    }

    pub fn message(&self, id: u64) -> Option<Message> {
        self.store.message_log().get(id)
    }

    pub fn clear_messages(&self) {
        self.store.message_log().clear();
        info!(node = %self.config.node_name, "Message history cleared");
    }

    pub fn lookup_codec(&self, id: CodecId) -> Option<Arc<dyn Codec>> {
        self.store.lookup_codec(id)
    }

    /// Wire encoding of the current value of `key`
    pub fn encoded_value(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.store.encode_pair(key)?.map(|pair| pair.value))
    }

    /// Hex store digest; equal on converged replicas
    pub fn digest(&self) -> Result<String, StoreError> {
        Ok(hex::encode(self.store.digest()?))
    }
}

impl fmt::Debug for Kv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Kv")
            .field("node", &self.config.node_name)
            .field("state", &*self.state.borrow())
            .field("keys", &self.store.len())
            .finish()
    }
}

impl Service for Kv {
    fn name(&self) -> &str {
        SERVICE_NAME
    }

    fn state(&self) -> ServiceState {
        self.state.borrow().clone()
    }

    fn subscribe_state(&self) -> watch::Receiver<ServiceState> {
        self.state.subscribe()
    }
}

/// Background loop state
struct Worker {
    node: String,
    gossip_interval: Duration,
    full_state_interval: Option<Duration>,
    store: Arc<Store>,
    sync: Arc<Disseminator>,
    stop: watch::Receiver<bool>,
    events: EventReceiver,
}

impl Worker {
    async fn run(mut self) -> Result<(), ServiceError> {
        let mut gossip = interval(self.gossip_interval);
        gossip.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut full_state = self.full_state_interval.map(|period| {
            let mut tick = interval_at(Instant::now() + period, period);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tick
        });

        debug!(node = %self.node, "Gossip loop started");
        // Flush on local changes and on every gossip tick
        loop {
            tokio::select! {
                _ = stopped(&mut self.stop) => break,
                _ = self.store.changed().notified() => self.check(self.sync.flush())?,
                _ = gossip.tick() => self.check(self.sync.flush())?,
                _ = next_tick(&mut full_state) => self.check(self.sync.push_full_state())?,
                event = self.events.recv() => match event {
                    Some(event) => self.handle_event(event)?,
                    None => {
                        return Err(ServiceError::StoreFailure(
                            "transport event stream closed".into(),
                        ))
                    }
                },
            }
        }

        // Last chance for writes made just before stop
        if let Err(e) = self.sync.flush() {
            debug!(node = %self.node, "Final flush failed: {}", e);
        }
        debug!(node = %self.node, "Gossip loop stopped");
        Ok(())
    }

    fn handle_event(&self, event: TransportEvent) -> Result<(), ServiceError> {
        match event {
            TransportEvent::PayloadReceived { from, payload } => {
                if let Err(e) = self.sync.handle_payload(&from, &payload) {
                    warn!(node = %self.node, from = %from, "Discarding gossip payload: {}", e);
                }
                Ok(())
            }
            TransportEvent::MemberJoined(member) => {
                info!(node = %self.node, member = %member, "Member joined, pushing full state");
                self.check(self.sync.push_full_state())
            }
            TransportEvent::MemberLeft(member) => {
                info!(node = %self.node, member = %member, "Member left");
                Ok(())
            }
        }
    }

    /// Only a closed transport ends the loop; everything else is retried by
    /// the next round
    fn check(&self, result: Result<usize, SyncError>) -> Result<(), ServiceError> {
        match result {
            Ok(_) => Ok(()),
            Err(e) if e.is_fatal() => Err(ServiceError::StoreFailure(e.to_string())),
            Err(e) => {
                warn!(node = %self.node, "Gossip round failed: {}", e);
                Ok(())
            }
        }
    }
}

/// Resolves once stop is requested or the sender is gone
async fn stopped(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|stop| *stop).await;
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
