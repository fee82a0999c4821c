//! Publisher and subscriber lifecycle
//!
//! Transport adapters (RTMP sessions, HTTP-FLV writers, RTSP pullers, ...)
//! own an [`Io`] and implement [`Publish`] or [`Subscribe`] around it. The
//! engine fills in the bind-time fields (stream, arguments, start time,
//! logging span) and drives the participant through [`IoEvent`]s.
//!
//! ```text
//!   adapter ──owns──► Io { id, kind, token, stream, args, span, closer }
//!      │
//!      └─ impl Publish / Subscribe ──► Engine::bind_* ──► IoEvent::Bound
//!                                                    └──► IoEvent::Kick / Close
//! ```
//!
//! Cancelling the `Io` token is the single signal that the participant is
//! done; every wait performed on its behalf observes it.

pub mod auth;
pub mod promise;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::{PublishConfig, SubscribeConfig};
use crate::error::Result;
use crate::registry::Stream;

pub use auth::{auth_hook, AuthHook, PublishAuth, SubscribeAuth};
pub use promise::Promise;

/// Query arguments of the bind path
pub type Args = HashMap<String, Vec<String>>;

type Closer = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct IoState {
    kind: String,
    start_time: Option<Instant>,
    stream_path: String,
    stream: Weak<Stream>,
    args: Args,
    span: Option<tracing::Span>,
    closer: Option<Closer>,
}

/// Identity and lifetime shared by publishers and subscribers
pub struct Io {
    id: String,
    token: OnceLock<CancellationToken>,
    state: Mutex<IoState>,
}

impl Io {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            token: OnceLock::new(),
            state: Mutex::new(IoState::default()),
        }
    }

    /// Set an explicit type label instead of the one derived at bind time
    pub fn with_kind(self, kind: impl Into<String>) -> Self {
        self.lock().kind = kind.into();
        self
    }

    /// Tie this participant's lifetime to `parent`
    ///
    /// Without a parent the engine's own token is used at bind time.
    pub fn with_parent(self, parent: &CancellationToken) -> Self {
        let _ = self.token.set(parent.child_token());
        self
    }

    /// Register the release action run on close or kick (e.g. closing the
    /// connection)
    pub fn set_closer(&self, closer: impl FnOnce() + Send + 'static) {
        self.lock().closer = Some(Box::new(closer));
    }

    fn lock(&self) -> MutexGuard<'_, IoState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Type label, e.g. "Rtmp" for an `RtmpPublisher`
    pub fn kind(&self) -> String {
        self.lock().kind.clone()
    }

    /// Lifetime scope of this participant
    pub fn token(&self) -> CancellationToken {
        self.token.get_or_init(CancellationToken::new).clone()
    }

    pub fn is_closed(&self) -> bool {
        self.token.get().is_some_and(CancellationToken::is_cancelled)
    }

    /// Stop publishing or subscribing; called by the participant itself
    pub fn stop(&self) {
        self.token().cancel();
    }

    /// Release resources and cancel on `Close`/`Kick`
    pub fn on_event(&self, event: &IoEvent) {
        match event {
            IoEvent::Close | IoEvent::Kick => {
                let closer = self.lock().closer.take();
                if let Some(closer) = closer {
                    closer();
                }
                self.stop();
            }
            IoEvent::Bound(_) => {}
        }
    }

    /// Whether the bound stream has been closed
    pub fn is_shutdown(&self) -> bool {
        self.stream().is_some_and(|stream| stream.is_closed())
    }

    pub fn start_time(&self) -> Option<Instant> {
        self.lock().start_time
    }

    /// The stream this participant is bound to
    pub fn stream(&self) -> Option<Arc<Stream>> {
        self.lock().stream.upgrade()
    }

    pub fn stream_path(&self) -> String {
        self.lock().stream_path.clone()
    }

    pub fn args(&self) -> Args {
        self.lock().args.clone()
    }

    /// First value of a query argument
    pub fn arg(&self, key: &str) -> Option<String> {
        self.lock().args.get(key).and_then(|v| v.first().cloned())
    }

    /// Logging span carrying stream, kind and id
    pub fn span(&self) -> tracing::Span {
        self.lock().span.clone().unwrap_or_else(tracing::Span::none)
    }

    /// Fill in the bind-time fields
    pub(crate) fn attach(
        &self,
        stream: &Arc<Stream>,
        args: Args,
        default_kind: &str,
        parent: &CancellationToken,
    ) {
        let _ = self.token.get_or_init(|| parent.child_token());

        let mut state = self.lock();
        if state.kind.is_empty() {
            state.kind = default_kind.to_string();
        }
        state.start_time = Some(Instant::now());
        state.stream_path = stream.path().to_string();
        state.stream = Arc::downgrade(stream);
        state.args = args;

        let span = if self.id.is_empty() {
            tracing::info_span!("io", stream = %stream.path(), kind = %state.kind)
        } else {
            tracing::info_span!("io", stream = %stream.path(), kind = %state.kind, id = %self.id)
        };
        state.span = Some(span);
    }
}

impl std::fmt::Debug for Io {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("Io")
            .field("id", &self.id)
            .field("kind", &state.kind)
            .field("stream", &state.stream_path)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// A bound publisher or subscriber
#[derive(Clone)]
pub enum Participant {
    Publisher(Arc<dyn Publish>),
    Subscriber(Arc<dyn Subscribe>),
}

impl Participant {
    pub fn io(&self) -> &Io {
        match self {
            Participant::Publisher(p) => p.io(),
            Participant::Subscriber(s) => s.io(),
        }
    }

    /// Whether this is the participant owning `io`
    pub fn is(&self, io: &Io) -> bool {
        std::ptr::eq(self.io(), io)
    }
}

impl std::fmt::Debug for Participant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Participant::Publisher(p) => f.debug_tuple("Publisher").field(p.io()).finish(),
            Participant::Subscriber(s) => f.debug_tuple("Subscriber").field(s.io()).finish(),
        }
    }
}

/// Events delivered to participants
#[derive(Debug, Clone)]
pub enum IoEvent {
    /// The stream closed or dropped this participant
    Close,
    /// Evicted by a newer publisher
    Kick,
    /// Admission succeeded
    ///
    /// Carries the participant itself on a fresh bind, or the stream's
    /// previous publisher when a publisher resumes a stream.
    Bound(Participant),
}

/// Implemented by transport adapters that produce media
pub trait Publish: Send + Sync + 'static {
    fn io(&self) -> &Io;

    /// Publisher options; `None` uses the engine defaults
    fn config(&self) -> Option<PublishConfig> {
        None
    }

    /// Per-publisher authentication; `None` falls back to the engine hook
    fn on_auth(&self, _promise: Promise<dyn Publish>) -> Option<Result<()>> {
        None
    }

    fn on_event(&self, event: &IoEvent) {
        self.io().on_event(event);
    }
}

/// Implemented by transport adapters that consume media
pub trait Subscribe: Send + Sync + 'static {
    fn io(&self) -> &Io;

    /// Subscriber options; `None` uses the engine defaults
    fn config(&self) -> Option<SubscribeConfig> {
        None
    }

    /// Per-subscriber authentication; `None` falls back to the engine hook
    fn on_auth(&self, _promise: Promise<dyn Subscribe>) -> Option<Result<()>> {
        None
    }

    fn on_event(&self, event: &IoEvent) {
        self.io().on_event(event);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn test_new_io_is_open() {
        let io = Io::new("conn-1");
        assert_eq!(io.id(), "conn-1");
        assert!(!io.is_closed());
        assert!(io.stream().is_none());
        assert!(!io.is_shutdown());
        assert!(io.start_time().is_none());
        assert!(io.kind().is_empty());
    }

    #[test]
    fn test_stop_cancels_token() {
        let io = Io::new("");
        let token = io.token();
        io.stop();
        assert!(io.is_closed());
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_parent_cancellation() {
        let parent = CancellationToken::new();
        let io = Io::new("a").with_parent(&parent);
        parent.cancel();
        assert!(io.is_closed());
    }

    #[test]
    fn test_close_and_kick_release_once() {
        for event in [IoEvent::Close, IoEvent::Kick] {
            let released = Arc::new(AtomicUsize::new(0));
            let io = Io::new("a");
            let counter = Arc::clone(&released);
            io.set_closer(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });

            io.on_event(&event);
            io.on_event(&event);

            assert!(io.is_closed());
            assert_eq!(released.load(Ordering::SeqCst), 1);
        }
    }

    #[test]
    fn test_explicit_kind_kept() {
        let io = Io::new("a").with_kind("Relay");
        assert_eq!(io.kind(), "Relay");
    }
}
