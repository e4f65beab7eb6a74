//! Service lifecycle states shared by the store and its supervisors

use thiserror::Error;
use tokio::sync::watch;

/// Why a service stopped working. `Clone` so one failure can be handed to
/// every caller that asks.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceError {
    #[error("initialization failed: {0}")]
    InitializationFailure(String),
    #[error("store failed: {0}")]
    StoreFailure(String),
}

/// Lifecycle of a background service
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceState {
    New,
    Starting,
    Running,
    Stopping,
    Terminated,
    Failed(ServiceError),
}

impl ServiceState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ServiceState::Terminated | ServiceState::Failed(_))
    }
}

/// A background service whose state can be observed
pub trait Service: Send + Sync {
    fn name(&self) -> &str;

    fn state(&self) -> ServiceState;

    /// Receiver that sees every state transition
    fn subscribe_state(&self) -> watch::Receiver<ServiceState>;
}

/// Wait until the observed service reaches a terminal state.
///
/// Returns the failure cause for [`ServiceState::Failed`]. A service dropped
/// before terminating counts as a failure.
pub async fn await_terminated(mut rx: watch::Receiver<ServiceState>) -> Result<(), ServiceError> {
    let state = match rx.wait_for(ServiceState::is_terminal).await {
        Ok(state) => state.clone(),
        Err(_) => {
            return Err(ServiceError::StoreFailure(
                "service dropped before terminating".into(),
            ))
        }
    };
    match state {
        ServiceState::Failed(e) => Err(e),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_await_terminated_reports_failure() {
        let (tx, rx) = watch::channel(ServiceState::Running);
        let waiter = tokio::spawn(await_terminated(rx));

        tx.send_replace(ServiceState::Stopping);
        tx.send_replace(ServiceState::Failed(ServiceError::StoreFailure("boom".into())));

        assert_eq!(
            waiter.await.unwrap(),
            Err(ServiceError::StoreFailure("boom".into()))
        );
    }

    #[tokio::test]
    async fn test_await_terminated_on_dropped_sender() {
        let (tx, rx) = watch::channel(ServiceState::Running);
        drop(tx);
        assert!(matches!(
            await_terminated(rx).await,
            Err(ServiceError::StoreFailure(_))
        ));
    }

    #[tokio::test]
    async fn test_already_terminated() {
        let (_tx, rx) = watch::channel(ServiceState::Terminated);
        assert_eq!(await_terminated(rx).await, Ok(()));
    }
}
