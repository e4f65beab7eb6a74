//! Init-once lifecycle wrapper
//!
//! [`KvInitService`] builds and starts a [`Kv`] on first use, exactly once no
//! matter how many callers race for it. The outcome, success or failure, is
//! kept for the lifetime of the wrapper and handed to every caller. Once
//! running, the store's failure is relayed through a [`FailureWatcher`] and
//! becomes the result of [`KvInitService::run`].

use crate::config::KvConfig;
use crate::kv::Kv;
use crate::service::{Service, ServiceError, ServiceState};
use crate::watcher::FailureWatcher;
use gossipkv_core::CodecRegistry;
use gossipkv_net::{EventReceiver, Transport, TransportError};
use parking_lot::Mutex;
use std::sync::{Arc, OnceLock};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{error, info};

/// Builds the transport for a node. Called at most once per wrapper.
pub type TransportFactory = Box<
    dyn Fn(&KvConfig) -> Result<(Arc<dyn Transport>, EventReceiver), TransportError> + Send + Sync,
>;

type InitResult = Result<Arc<Kv>, ServiceError>;

/// Wrapper state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitState {
    Uninitialized,
    Initializing,
    Running,
    Stopped,
    Failed,
}

/// Lazily initialized, supervised store
pub struct KvInitService {
    config: KvConfig,
    registry: Arc<CodecRegistry>,
    factory: TransportFactory,
    cell: OnceLock<InitResult>,
    /// Mirrors `cell` for async waiters in `stop`
    ready: watch::Sender<Option<InitResult>>,
    watcher: FailureWatcher,
    state: Mutex<InitState>,
    stop: watch::Sender<bool>,
}

impl KvInitService {
    pub fn new(config: KvConfig, registry: Arc<CodecRegistry>, factory: TransportFactory) -> Self {
        Self {
            config,
            registry,
            factory,
            cell: OnceLock::new(),
            ready: watch::channel(None).0,
            watcher: FailureWatcher::new(),
            state: Mutex::new(InitState::Uninitialized),
            stop: watch::channel(false).0,
        }
    }

    /// Get the store, initializing it on first call.
    ///
    /// Must be called from within a tokio runtime the first time, since the
    /// background loop is spawned onto the current runtime. Concurrent
    /// callers block until the first one finishes and all of them receive
    /// the same instance or the same error.
    pub fn acquire(&self) -> Result<Arc<Kv>, ServiceError> {
        self.cell.get_or_init(|| self.initialize()).clone()
    }

    /// The store, if initialization already succeeded
    pub fn get(&self) -> Option<Arc<Kv>> {
        self.cell.get().and_then(|result| result.as_ref().ok().cloned())
    }

    pub fn state(&self) -> InitState {
        *self.state.lock()
    }

    /// State of the wrapped store, once there is one
    pub fn store_state(&self) -> Option<ServiceState> {
        self.get().map(|kv| kv.state())
    }

    pub fn node_name(&self) -> &str {
        &self.config.node_name
    }

    /// Wait until [`stop`](Self::stop) is called (`Ok`) or the store fails
    /// (`Err` with the first failure)
    pub async fn run(&self) -> Result<(), ServiceError> {
        let mut stop = self.stop.subscribe();
        tokio::select! {
            _ = stop.wait_for(|stop| *stop) => Ok(()),
            failure = self.watcher.failure() => {
                *self.state.lock() = InitState::Failed;
                error!(node = %self.config.node_name, "KV service failed: {}", failure);
                Err(failure)
            }
        }
    }

    /// Stop the store and wait for it to terminate.
    ///
    /// Succeeds immediately if the store was never initialized; later
    /// calls to [`acquire`](Self::acquire) then fail. Idempotent.
    pub async fn stop(&self) -> Result<(), ServiceError> {
        {
            let mut state = self.state.lock();
            self.stop.send_replace(true);
            match *state {
                InitState::Uninitialized => {
                    *state = InitState::Stopped;
                    info!(node = %self.config.node_name, "KV service stopped before initialization");
                    return Ok(());
                }
                // Stopped before initialization; no result will ever arrive
                InitState::Stopped if self.ready.borrow().is_none() => return Ok(()),
                _ => {}
            }
        }

        // Initialization is in progress or done; wait for its result
        let mut ready = self.ready.subscribe();
        let result = match ready.wait_for(Option::is_some).await {
            Ok(result) => result.clone(),
            Err(_) => None,
        };
        let Some(Ok(kv)) = result else {
            return Ok(());
        };

        kv.stop();
        let outcome = kv.await_terminated().await;
        *self.state.lock() = match outcome {
            Ok(()) => InitState::Stopped,
            Err(_) => InitState::Failed,
        };
        info!(node = %self.config.node_name, "KV service stopped");
        outcome
    }

    fn initialize(&self) -> InitResult {
        let result = self.try_initialize();
        {
            let mut state = self.state.lock();
            if *state == InitState::Initializing {
                *state = match &result {
                    Ok(_) => InitState::Running,
                    Err(_) => InitState::Failed,
                };
            }
        }
        match &result {
            Ok(_) => info!(node = %self.config.node_name, "KV service initialized"),
            Err(e) => error!(node = %self.config.node_name, "KV initialization failed: {}", e),
        }
        self.ready.send_replace(Some(result.clone()));
        result
    }

    fn try_initialize(&self) -> InitResult {
        {
            let mut state = self.state.lock();
            if *state != InitState::Uninitialized {
                return Err(ServiceError::InitializationFailure(
                    "service stopped before initialization".into(),
                ));
            }
            *state = InitState::Initializing;
        }

        self.config
            .validate()
            .map_err(ServiceError::InitializationFailure)?;
        let handle = Handle::try_current().map_err(|e| {
            ServiceError::InitializationFailure(format!("no async runtime: {}", e))
        })?;
        let (transport, events) = (self.factory)(&self.config).map_err(|e| {
            ServiceError::InitializationFailure(format!("transport setup failed: {}", e))
        })?;

        let kv = Arc::new(Kv::new(
            self.config.clone(),
            self.registry.clone(),
            transport,
        ));
        self.watcher.watch(&handle, kv.as_ref());
        kv.start(&handle, events)?;
        Ok(kv)
    }
}
