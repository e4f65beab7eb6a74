//! Relays the first failure of any watched service

use crate::service::{await_terminated, Service, ServiceError};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error};

/// Single-fire failure channel.
///
/// Any number of services can be watched; only the first failure among them
/// is kept and later ones are logged and discarded.
pub struct FailureWatcher {
    tx: Arc<watch::Sender<Option<ServiceError>>>,
}

impl FailureWatcher {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Start observing `service` on `handle`
    pub fn watch(&self, handle: &Handle, service: &dyn Service) -> JoinHandle<()> {
        let name = service.name().to_string();
        let rx = service.subscribe_state();
        let tx = self.tx.clone();

        handle.spawn(async move {
            match await_terminated(rx).await {
                Ok(()) => debug!(service = %name, "Watched service terminated cleanly"),
                Err(e) => {
                    let first = tx.send_if_modified(|slot| {
                        if slot.is_some() {
                            return false;
                        }
                        *slot = Some(e.clone());
                        true
                    });
                    if first {
                        error!(service = %name, "Watched service failed: {}", e);
                    } else {
                        debug!(service = %name, "Additional failure ignored: {}", e);
                    }
                }
            }
        })
    }

    /// Failure recorded so far, if any
    pub fn first_failure(&self) -> Option<ServiceError> {
        self.tx.borrow().clone()
    }

    /// Wait for the first failure
    pub async fn failure(&self) -> ServiceError {
        let mut rx = self.tx.subscribe();
        let failure = match rx.wait_for(Option::is_some).await {
            Ok(slot) => slot.clone(),
            // Unreachable while self holds the sender
            Err(_) => None,
        };
        failure.unwrap_or_else(|| ServiceError::StoreFailure("failure watcher closed".into()))
    }
}

impl Default for FailureWatcher {
    fn default() -> Self {
        Self::new()
    }
}
