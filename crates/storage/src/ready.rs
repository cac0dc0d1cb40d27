//! One-shot ready gate for asynchronous collection initialisation.
//!
//! A collection registers its init task when it is constructed; every
//! public operation awaits the first successful completion before
//! touching storage. The gate transitions exactly once, from pending to
//! ready or failed, and a failure is sticky: its cause is re-raised to
//! every later waiter.

use std::future::Future;
use std::sync::Arc;

use colstore_common::StoreError;
use tokio::sync::watch;
use tracing::debug;

#[derive(Debug, Clone)]
enum GateState {
    Pending,
    Ready,
    Failed(Arc<StoreError>),
}

/// A one-shot broadcast of initialisation completion.
#[derive(Debug, Clone)]
pub struct ReadyGate {
    state: watch::Receiver<GateState>,
}

impl ReadyGate {
    /// A gate that is already open, for backends with no async setup.
    pub fn open() -> Self {
        let (_tx, rx) = watch::channel(GateState::Ready);
        ReadyGate { state: rx }
    }

    /// Spawns `init` and returns a gate that settles with its outcome.
    pub fn spawn<F>(init: F) -> Self
    where
        F: Future<Output = Result<(), StoreError>> + Send + 'static,
    {
        let (tx, rx) = watch::channel(GateState::Pending);
        tokio::spawn(async move {
            let outcome = match init.await {
                Ok(()) => GateState::Ready,
                Err(err) => {
                    debug!(error = %err, "collection initialisation failed");
                    GateState::Failed(Arc::new(err))
                }
            };
            // Nobody may be waiting yet; the value is retained either way.
            let _ = tx.send(outcome);
        });
        ReadyGate { state: rx }
    }

    /// Waits for the first completion. A failed init is re-raised to
    /// every caller as [`StoreError::Init`].
    pub async fn wait(&self) -> Result<(), StoreError> {
        let mut state = self.state.clone();
        loop {
            {
                let current = state.borrow_and_update();
                match &*current {
                    GateState::Ready => return Ok(()),
                    GateState::Failed(cause) => return Err(StoreError::Init(cause.clone())),
                    GateState::Pending => {}
                }
            }
            if state.changed().await.is_err() {
                // The init task was dropped without reporting; treat it
                // as a failed initialisation.
                return Err(StoreError::Init(Arc::new(StoreError::Custom(
                    "initialisation task aborted".to_string(),
                ))));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_gate_is_immediate() {
        ReadyGate::open().wait().await.unwrap();
    }

    #[tokio::test]
    async fn waiters_see_success() {
        let gate = ReadyGate::spawn(async {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            Ok(())
        });
        let (a, b) = tokio::join!(gate.wait(), gate.wait());
        a.unwrap();
        b.unwrap();
        // Late waiters see the retained state.
        gate.wait().await.unwrap();
    }

    #[tokio::test]
    async fn failure_is_sticky() {
        let gate = ReadyGate::spawn(async { Err(StoreError::Custom("boom".to_string())) });
        for _ in 0..2 {
            match gate.wait().await {
                Err(StoreError::Init(cause)) => assert_eq!(cause.to_string(), "boom"),
                other => panic!("expected sticky init failure, got {other:?}"),
            }
        }
    }
}
