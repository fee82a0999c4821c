//! Single-assignment outcome shared between an authentication hook and the
//! admission controller waiting on it

use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// A participant awaiting a decision
///
/// Cloning yields another handle to the same outcome. The first `resolve`
/// or `reject` wins; later attempts fail with [`Error::PromiseResolved`].
pub struct Promise<T: ?Sized> {
    participant: Arc<T>,
    outcome: Arc<watch::Sender<Option<Result<()>>>>,
}

impl<T: ?Sized> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            participant: Arc::clone(&self.participant),
            outcome: Arc::clone(&self.outcome),
        }
    }
}

impl<T: ?Sized> Promise<T> {
    pub fn new(participant: Arc<T>) -> Self {
        let (outcome, _) = watch::channel(None);
        Self {
            participant,
            outcome: Arc::new(outcome),
        }
    }

    /// The participant this decision is about
    pub fn participant(&self) -> &Arc<T> {
        &self.participant
    }

    /// Accept the participant
    pub fn resolve(&self) -> Result<()> {
        self.settle(Ok(()))
    }

    /// Refuse the participant
    pub fn reject(&self, err: Error) -> Result<()> {
        self.settle(Err(err))
    }

    fn settle(&self, outcome: Result<()>) -> Result<()> {
        let settled = self.outcome.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(outcome);
            true
        });
        if !settled {
            tracing::error!("Promise resolved more than once");
            return Err(Error::PromiseResolved);
        }
        Ok(())
    }

    pub fn is_resolved(&self) -> bool {
        self.outcome.borrow().is_some()
    }

    /// Wait until the outcome is assigned
    pub async fn wait(&self) -> Result<()> {
        self.outcome().wait().await
    }

    /// Wait until the outcome is assigned or `cancel` fires
    pub async fn wait_or_cancel(&self, cancel: &CancellationToken) -> Result<()> {
        self.outcome().wait_or_cancel(cancel).await
    }

    /// Observe the outcome without keeping the promise alive
    pub(crate) fn outcome(&self) -> Outcome {
        Outcome {
            rx: self.outcome.subscribe(),
        }
    }
}

/// Read side of a [`Promise`]
///
/// Once every `Promise` handle is dropped without an assignment the wait
/// fails with [`Error::PromiseAbandoned`].
pub(crate) struct Outcome {
    rx: watch::Receiver<Option<Result<()>>>,
}

impl Outcome {
    pub(crate) async fn wait(&mut self) -> Result<()> {
        let outcome = match self.rx.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone().unwrap_or(Ok(())),
            Err(_) => {
                tracing::error!("Promise dropped without a decision");
                Err(Error::PromiseAbandoned)
            }
        };
        outcome
    }

    pub(crate) async fn wait_or_cancel(&mut self, cancel: &CancellationToken) -> Result<()> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            outcome = self.wait() => outcome,
        }
    }
}

impl<T: ?Sized> std::fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Promise")
            .field("outcome", &*self.outcome.borrow())
            .finish()
    }
}
