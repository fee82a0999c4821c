//! Stream registry and admission controller
//!
//! The engine owns every stream by path and decides who may publish or
//! subscribe to it. The registry lock is only held to look up or insert a
//! stream; authentication and event delivery happen outside it.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError};

use tokio::sync::{broadcast, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::io::auth::{self, PublishAuth, SubscribeAuth};
use crate::io::{Args, IoEvent, Participant, Publish, Subscribe};
use crate::media::track::Completion;

use super::stream::{Expiry, Stream, StreamOptions};

/// Base for resolving scheme-less stream paths
const BASE_URL: &str = "live://engine/";

/// Notifications for external collaborators
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// A subscriber created this stream; start pulling it from upstream
    PullOnDemand { path: String },
    /// The stream was closed and removed
    StreamClosed { path: String },
}

/// Split a bind path into the stream path and its query arguments
///
/// Leading and trailing `/` are ignored: `/live/test/?token=1` names the
/// stream `live/test` with argument `token`.
pub fn parse_stream_path(raw: &str) -> Result<(String, Args)> {
    let invalid = |source: url::ParseError| Error::InvalidPath {
        path: raw.to_string(),
        source,
    };
    let base = Url::parse(BASE_URL).map_err(invalid)?;
    let url = base.join(raw.trim_matches('/')).map_err(invalid)?;

    let mut args = Args::new();
    for (key, value) in url.query_pairs() {
        args.entry(key.into_owned()).or_default().push(value.into_owned());
    }
    Ok((url.path().trim_matches('/').to_string(), args))
}

/// Default type label: the type's own name without `suffix`
fn type_label<T: ?Sized>(suffix: &str) -> String {
    let full = std::any::type_name::<T>();
    let name = full.split('<').next().unwrap_or(full);
    let name = name.rsplit("::").next().unwrap_or(name);
    name.strip_suffix(suffix).unwrap_or(name).to_string()
}

/// The stream registry
pub struct Engine {
    config: EngineConfig,
    streams: RwLock<HashMap<String, Arc<Stream>>>,
    events: broadcast::Sender<EngineEvent>,
    token: CancellationToken,
    publish_auth: std::sync::RwLock<Option<PublishAuth>>,
    subscribe_auth: std::sync::RwLock<Option<SubscribeAuth>>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Arc<Self> {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Arc::new(Self {
            config,
            streams: RwLock::new(HashMap::new()),
            events,
            token: CancellationToken::new(),
            publish_auth: std::sync::RwLock::new(None),
            subscribe_auth: std::sync::RwLock::new(None),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Parent scope of every stream and participant
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Subscribe to engine notifications
    pub fn events(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Default hook deciding on publishers without their own
    pub fn set_publish_auth(&self, hook: PublishAuth) {
        *self
            .publish_auth
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(hook);
    }

    /// Default hook deciding on subscribers without their own
    pub fn set_subscribe_auth(&self, hook: SubscribeAuth) {
        *self
            .subscribe_auth
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(hook);
    }

    fn emit(&self, event: EngineEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }

    fn stream_options(&self, wait_timeout: std::time::Duration) -> StreamOptions {
        StreamOptions {
            wait_timeout,
            publish_timeout: self.config.publish.publish_timeout,
            delay_close_timeout: self.config.publish.delay_close_timeout,
            completion: Completion {
                rtp: self.config.enable_rtp,
                avcc: self.config.enable_avcc,
            },
            speed_limit: self.config.speed_limit,
        }
    }

    /// Look up a live stream or create it; `true` when created
    async fn find_or_create(
        &self,
        path: &str,
        wait_timeout: std::time::Duration,
    ) -> Result<(Arc<Stream>, bool)> {
        let mut streams = self.streams.write().await;
        // Checked under the lock so nothing is inserted after shutdown drains
        if self.token.is_cancelled() {
            return Err(Error::StreamClosed(path.to_string()));
        }
        let replaced = match streams.get(path) {
            Some(stream) if !stream.is_closed() => return Ok((Arc::clone(stream), false)),
            Some(_) => true,
            None => false,
        };

        let stream = Arc::new(Stream::new(
            path.to_string(),
            self.stream_options(wait_timeout),
            &self.token,
        ));
        streams.insert(path.to_string(), Arc::clone(&stream));
        drop(streams);

        if replaced {
            self.emit(EngineEvent::StreamClosed {
                path: path.to_string(),
            });
        }
        tracing::info!(stream = %path, "Stream created");
        Ok((stream, true))
    }

    /// Admit a publisher to `path`
    ///
    /// A live incumbent is kicked when the publisher's config allows it; the
    /// same instance binding again is a reconnection. Any other conflict
    /// fails with [`Error::NameExists`].
    pub async fn bind_publisher<P: Publish>(&self, path: &str, publisher: Arc<P>) -> Result<Arc<Stream>> {
        let (path, args) = parse_stream_path(path).inspect_err(|err| {
            tracing::error!(error = %err, "Stream path has wrong format");
        })?;
        let (stream, _) = self
            .find_or_create(&path, self.config.subscribe.wait_timeout)
            .await?;

        let io = publisher.io();
        io.attach(&stream, args, &type_label::<P>("Publisher"), &self.token);
        let span = io.span();

        let config = publisher.config().unwrap_or_else(|| self.config.publish.clone());
        let incoming: Arc<dyn Publish> = publisher.clone();

        if let Some(old) = stream.publisher().filter(|old| !old.io().is_closed()) {
            if std::ptr::eq(old.io(), io) {
                tracing::debug!(parent: &span, "Publisher reconnecting");
            } else if config.kick_exist {
                tracing::warn!(parent: &span, kind = %old.io().kind(), "Kicking publisher");
                old.on_event(&IoEvent::Kick);
            } else {
                tracing::warn!(parent: &span, "Stream already has a publisher");
                return Err(Error::NameExists(path));
            }
        }
        stream.set_publish_timeouts(config.publish_timeout, config.delay_close_timeout);

        if self.config.enable_auth {
            let default = self
                .publish_auth
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            let own = Arc::clone(&publisher);
            auth::authenticate(
                Arc::clone(&incoming),
                move |promise| own.on_auth(promise),
                default,
                &io.token(),
            )
            .await
            .inspect_err(|err| tracing::warn!(parent: &span, error = %err, "Publisher rejected"))?;
        }

        let incumbent = stream.receive_publisher(Arc::clone(&incoming), config.kick_exist)?;
        let bound = incumbent.unwrap_or(incoming);
        publisher.on_event(&IoEvent::Bound(Participant::Publisher(bound)));
        Ok(stream)
    }

    /// Admit a subscriber to `path`
    ///
    /// Creating the stream here asks upstream collaborators to pull it
    /// through [`EngineEvent::PullOnDemand`].
    pub async fn bind_subscriber<S: Subscribe>(&self, path: &str, subscriber: Arc<S>) -> Result<Arc<Stream>> {
        let (path, args) = parse_stream_path(path).inspect_err(|err| {
            tracing::error!(error = %err, "Stream path has wrong format");
        })?;
        let config = subscriber
            .config()
            .unwrap_or_else(|| self.config.subscribe.clone());
        let (stream, created) = self.find_or_create(&path, config.wait_timeout).await?;

        let io = subscriber.io();
        io.attach(&stream, args, &type_label::<S>("Subscriber"), &self.token);
        let span = io.span();

        if created {
            tracing::info!(parent: &span, "Requesting pull on demand");
            self.emit(EngineEvent::PullOnDemand { path: path.clone() });
        }

        let incoming: Arc<dyn Subscribe> = subscriber.clone();
        if self.config.enable_auth {
            let default = self
                .subscribe_auth
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            let own = Arc::clone(&subscriber);
            auth::authenticate(
                Arc::clone(&incoming),
                move |promise| own.on_auth(promise),
                default,
                &io.token(),
            )
            .await
            .inspect_err(|err| tracing::warn!(parent: &span, error = %err, "Subscriber rejected"))?;
        }

        stream.receive_subscriber(Arc::clone(&incoming))?;
        subscriber.on_event(&IoEvent::Bound(Participant::Subscriber(incoming)));
        Ok(stream)
    }

    /// Detach a publisher from its stream; the stream waits for a new one
    pub fn unbind_publisher(&self, publisher: &(impl Publish + ?Sized)) -> bool {
        let io = publisher.io();
        io.stream().is_some_and(|stream| stream.remove_publisher(io))
    }

    /// Detach a subscriber from its stream
    pub fn unbind_subscriber(&self, subscriber: &(impl Subscribe + ?Sized)) -> bool {
        let io = subscriber.io();
        io.stream().is_some_and(|stream| stream.remove_subscriber(io))
    }

    /// Get a stream by path
    pub async fn stream(&self, path: &str) -> Option<Arc<Stream>> {
        self.streams.read().await.get(path.trim_matches('/')).cloned()
    }

    /// All registered streams
    pub async fn streams(&self) -> Vec<Arc<Stream>> {
        self.streams.read().await.values().cloned().collect()
    }

    /// Get total number of streams
    pub async fn stream_count(&self) -> usize {
        self.streams.read().await.len()
    }

    /// Close and remove a stream; returns whether it existed
    pub async fn close_stream(&self, path: &str) -> bool {
        let removed = self.streams.write().await.remove(path.trim_matches('/'));
        match removed {
            Some(stream) => {
                stream.close();
                self.emit(EngineEvent::StreamClosed {
                    path: stream.path().to_string(),
                });
                true
            }
            None => false,
        }
    }

    /// Run the idle policy once
    ///
    /// Publishers silent past their publish timeout are dropped; streams
    /// whose subscribers waited too long, or that sat empty past the
    /// delay-close timeout, are closed and removed.
    pub async fn cleanup(&self) {
        let now = Instant::now();
        let streams = self.streams().await;

        let closed: Vec<_> = streams
            .into_iter()
            .filter(|stream| stream.check_timeouts(now) == Expiry::Close)
            .collect();
        if closed.is_empty() {
            return;
        }

        let mut registry = self.streams.write().await;
        let mut removed = Vec::with_capacity(closed.len());
        for stream in closed {
            let current = registry
                .get(stream.path())
                .is_some_and(|s| Arc::ptr_eq(s, &stream));
            if current {
                registry.remove(stream.path());
                removed.push(stream.path().to_string());
            }
        }
        drop(registry);

        for path in removed {
            tracing::info!(stream = %path, "Stream removed by cleanup");
            self.emit(EngineEvent::StreamClosed { path });
        }
    }

    /// Spawn background cleanup task
    ///
    /// Runs every `cleanup_interval` until the engine shuts down.
    pub fn spawn_cleanup_task(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let engine = Arc::clone(self);
        let interval = engine.config.cleanup_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = engine.token.cancelled() => break,
                    _ = ticker.tick() => engine.cleanup().await,
                }
            }
        })
    }

    /// Close every stream and refuse further binds
    pub async fn shutdown(&self) {
        self.token.cancel();
        let streams: Vec<_> = self.streams.write().await.drain().map(|(_, s)| s).collect();
        for stream in &streams {
            stream.close();
            self.emit(EngineEvent::StreamClosed {
                path: stream.path().to_string(),
            });
        }
        tracing::info!(streams = streams.len(), "Engine shut down");
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("closed", &self.token.is_cancelled())
            .finish()
    }
}
