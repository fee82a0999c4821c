//! Authentication hook protocol
//!
//! A hook receives a [`Promise`] for the participant and either fails
//! immediately or arranges for the promise to be resolved, possibly from
//! another task. Admission waits on the promise without holding any
//! registry lock.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::error::Result;

use super::promise::Promise;
use super::{Publish, Subscribe};

/// Process-wide authentication hook
pub type AuthHook<T> = Arc<dyn Fn(Promise<T>) -> Result<()> + Send + Sync>;

/// Hook deciding on publishers
pub type PublishAuth = AuthHook<dyn Publish>;

/// Hook deciding on subscribers
pub type SubscribeAuth = AuthHook<dyn Subscribe>;

/// Wrap a closure as an [`AuthHook`]
pub fn auth_hook<T, F>(hook: F) -> AuthHook<T>
where
    T: ?Sized,
    F: Fn(Promise<T>) -> Result<()> + Send + Sync + 'static,
{
    Arc::new(hook)
}

/// Run the handshake for one participant
///
/// `own_hook` is the participant's override; it returns `None` when the
/// participant has none, in which case `default` is used. Without any hook
/// the participant is admitted. A hook that drops its promise without
/// resolving it fails the handshake with
/// [`Error::PromiseAbandoned`](crate::Error::PromiseAbandoned).
pub(crate) async fn authenticate<T, F>(
    participant: Arc<T>,
    own_hook: F,
    default: Option<AuthHook<T>>,
    cancel: &CancellationToken,
) -> Result<()>
where
    T: ?Sized,
    F: FnOnce(Promise<T>) -> Option<Result<()>>,
{
    let promise = Promise::new(participant);
    let mut outcome = promise.outcome();

    // The hook holds the only promise handle
    let started = match own_hook(promise.clone()) {
        Some(started) => {
            drop(promise);
            started
        }
        None => match default {
            Some(hook) => hook(promise),
            None => return Ok(()),
        },
    };
    started?;

    outcome.wait_or_cancel(cancel).await
}
