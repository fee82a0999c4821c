//! A named stream: one publisher slot, its subscribers and its tracks

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::TrackConfig;
use crate::error::{Error, Result};
use crate::io::{IoEvent, Io, Publish, Subscribe};
use crate::media::track::{Completion, Media, Track, TrackCodec};
use crate::stats::StreamStats;

/// State of a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// No live publisher; subscribers may wait
    WaitingPublisher,
    /// A publisher is bound
    Publishing,
    /// Closed; waiting for the registry to drop it
    Closed,
}

/// Per-stream options fixed at creation
#[derive(Debug, Clone)]
pub(crate) struct StreamOptions {
    pub wait_timeout: Duration,
    pub publish_timeout: Duration,
    pub delay_close_timeout: Duration,
    pub completion: Completion,
    pub speed_limit: Duration,
}

struct Inner {
    state: StreamState,
    publisher: Option<Arc<dyn Publish>>,
    /// Publisher lost most recently, reported to the next one on bind
    previous: Option<Arc<dyn Publish>>,
    subscribers: Vec<Arc<dyn Subscribe>>,
    wait_timeout: Duration,
    publish_timeout: Duration,
    delay_close_timeout: Duration,
    /// When the current publisher was bound
    published_at: Option<Instant>,
    /// Since when the stream has had no publisher
    waiting_since: Instant,
    /// Since when the stream has had neither publisher nor subscribers
    idle_since: Option<Instant>,
}

impl Inner {
    fn refresh_idle(&mut self, now: Instant) {
        if self.publisher.is_none() && self.subscribers.is_empty() {
            self.idle_since.get_or_insert(now);
        } else {
            self.idle_since = None;
        }
    }
}

/// Outcome of an idle check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Expiry {
    Alive,
    PublisherLost,
    Close,
}

/// A named stream
pub struct Stream {
    path: String,
    created_at: Instant,
    token: CancellationToken,
    completion: Completion,
    speed_limit: Duration,
    inner: Mutex<Inner>,
    tracks: watch::Sender<HashMap<String, Arc<Track>>>,
    /// Bumped on every publisher bind
    announce: watch::Sender<u64>,
}

impl Stream {
    pub(crate) fn new(path: String, options: StreamOptions, parent: &CancellationToken) -> Self {
        let now = Instant::now();
        let (tracks, _) = watch::channel(HashMap::new());
        Self {
            path,
            created_at: now,
            token: parent.child_token(),
            completion: options.completion,
            speed_limit: options.speed_limit,
            inner: Mutex::new(Inner {
                state: StreamState::WaitingPublisher,
                publisher: None,
                previous: None,
                subscribers: Vec::new(),
                wait_timeout: options.wait_timeout,
                publish_timeout: options.publish_timeout,
                delay_close_timeout: options.delay_close_timeout,
                published_at: None,
                waiting_since: now,
                idle_since: Some(now),
            }),
            tracks,
            announce: watch::channel(0).0,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn state(&self) -> StreamState {
        self.lock().state
    }

    pub fn is_closed(&self) -> bool {
        self.state() == StreamState::Closed
    }

    /// Cancelled when the stream closes
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// The bound publisher, if any
    pub fn publisher(&self) -> Option<Arc<dyn Publish>> {
        self.lock().publisher.clone()
    }

    pub fn has_publisher(&self) -> bool {
        self.lock().publisher.is_some()
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    pub fn subscribers(&self) -> Vec<Arc<dyn Subscribe>> {
        self.lock().subscribers.clone()
    }

    /// Whether `io` belongs to a registered subscriber
    pub fn has_subscriber(&self, io: &Io) -> bool {
        self.lock()
            .subscribers
            .iter()
            .any(|s| std::ptr::eq(s.io(), io))
    }

    pub fn wait_timeout(&self) -> Duration {
        self.lock().wait_timeout
    }

    pub fn publish_timeout(&self) -> Duration {
        self.lock().publish_timeout
    }

    pub fn delay_close_timeout(&self) -> Duration {
        self.lock().delay_close_timeout
    }

    pub(crate) fn set_publish_timeouts(&self, publish_timeout: Duration, delay_close_timeout: Duration) {
        let mut inner = self.lock();
        inner.publish_timeout = publish_timeout;
        inner.delay_close_timeout = delay_close_timeout;
    }

    /// Bind `publisher` as the stream's publisher
    ///
    /// A live incumbent other than `publisher` is kicked when `kick_exist`
    /// is set and otherwise causes [`Error::NameExists`]. Returns the
    /// previous publisher, live or lost, so a resumed stream can be told
    /// apart from a fresh one.
    pub fn receive_publisher(
        &self,
        publisher: Arc<dyn Publish>,
        kick_exist: bool,
    ) -> Result<Option<Arc<dyn Publish>>> {
        let mut kicked = None;
        let incumbent = {
            let mut inner = self.lock();
            if inner.state == StreamState::Closed {
                return Err(Error::StreamClosed(self.path.clone()));
            }

            let incumbent = inner.publisher.clone();
            if let Some(old) = &incumbent {
                let same = std::ptr::eq(old.io(), publisher.io());
                if !same && !old.io().is_closed() {
                    if !kick_exist {
                        return Err(Error::NameExists(self.path.clone()));
                    }
                    kicked = Some(Arc::clone(old));
                }
            }

            let now = Instant::now();
            let previous = inner.previous.take();
            inner.publisher = Some(publisher);
            inner.state = StreamState::Publishing;
            inner.published_at = Some(now);
            inner.refresh_idle(now);
            incumbent.or(previous)
        };

        if let Some(old) = kicked {
            tracing::warn!(stream = %self.path, kind = %old.io().kind(), "Kicking publisher");
            old.on_event(&IoEvent::Kick);
        }
        self.announce.send_modify(|n| *n = n.wrapping_add(1));
        tracing::info!(stream = %self.path, "Publisher bound");
        Ok(incumbent)
    }

    /// Register a subscriber
    pub fn receive_subscriber(&self, subscriber: Arc<dyn Subscribe>) -> Result<()> {
        let count = {
            let mut inner = self.lock();
            if inner.state == StreamState::Closed {
                return Err(Error::StreamClosed(self.path.clone()));
            }
            inner.subscribers.push(subscriber);
            inner.refresh_idle(Instant::now());
            inner.subscribers.len()
        };
        tracing::info!(stream = %self.path, subscribers = count, "Subscriber added");
        Ok(())
    }

    /// Drop the subscriber owning `io`; returns whether it was registered
    pub fn remove_subscriber(&self, io: &Io) -> bool {
        let (removed, count) = {
            let mut inner = self.lock();
            let before = inner.subscribers.len();
            inner.subscribers.retain(|s| !std::ptr::eq(s.io(), io));
            inner.refresh_idle(Instant::now());
            (before != inner.subscribers.len(), inner.subscribers.len())
        };
        if removed {
            tracing::info!(stream = %self.path, subscribers = count, "Subscriber removed");
        }
        removed
    }

    /// Detach the publisher owning `io`; returns whether it was bound
    pub fn remove_publisher(&self, io: &Io) -> bool {
        let owned = self
            .lock()
            .publisher
            .as_ref()
            .is_some_and(|p| std::ptr::eq(p.io(), io));
        if owned {
            self.publisher_lost();
        }
        owned
    }

    /// The publisher is gone: close it and wait for a new one
    pub fn publisher_lost(&self) {
        let lost = {
            let mut inner = self.lock();
            if inner.state == StreamState::Closed {
                return;
            }
            let now = Instant::now();
            let lost = inner.publisher.take();
            if lost.is_some() {
                inner.previous = lost.clone();
            }
            inner.state = StreamState::WaitingPublisher;
            inner.published_at = None;
            inner.waiting_since = now;
            inner.refresh_idle(now);
            lost
        };

        if let Some(publisher) = lost {
            let err = Error::PublisherLost(self.path.clone());
            tracing::warn!(stream = %self.path, kind = %publisher.io().kind(), error = %err, "Publisher lost");
            publisher.on_event(&IoEvent::Close);
        }
    }

    /// Wait until a publisher is bound
    ///
    /// Fails with [`Error::PublisherLost`] after the subscriber wait
    /// timeout.
    pub async fn wait_publisher(&self, cancel: &CancellationToken) -> Result<Arc<dyn Publish>> {
        let deadline = Instant::now() + self.wait_timeout();
        let mut announced = self.announce.subscribe();
        loop {
            if let Some(publisher) = self.publisher() {
                return Ok(publisher);
            }
            if self.is_closed() {
                return Err(Error::StreamClosed(self.path.clone()));
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = self.token.cancelled() => return Err(Error::StreamClosed(self.path.clone())),
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(Error::PublisherLost(self.path.clone()));
                }
                changed = announced.changed() => {
                    if changed.is_err() {
                        return Err(Error::StreamClosed(self.path.clone()));
                    }
                }
            }
        }
    }

    /// Create the writer half of a track
    ///
    /// Names are unique while the previous writer is alive; a track whose
    /// writer has been dropped is replaced.
    pub fn new_track<C: TrackCodec>(&self, config: TrackConfig, codec: C) -> Result<Media<C>> {
        if self.is_closed() {
            return Err(Error::StreamClosed(self.path.clone()));
        }

        let mut config = config;
        config.speed_limit.get_or_insert(self.speed_limit);

        let mut result = Err(Error::TrackExists(config.name.clone()));
        self.tracks.send_if_modified(|tracks| {
            if tracks.get(&config.name).is_some_and(|t| !t.is_closed()) {
                return false;
            }
            let media = Media::new(&self.path, &config, codec, self.completion);
            tracks.insert(config.name.clone(), Arc::clone(media.track()));
            result = Ok(media);
            true
        });

        if result.is_ok() {
            tracing::info!(stream = %self.path, track = %config.name, "Track added");
        }
        result
    }

    pub fn track(&self, name: &str) -> Option<Arc<Track>> {
        self.tracks.borrow().get(name).cloned()
    }

    pub fn tracks(&self) -> Vec<Arc<Track>> {
        self.tracks.borrow().values().cloned().collect()
    }

    /// Wait for a track to appear, bounded by the subscriber wait timeout
    pub async fn wait_track(&self, name: &str, cancel: &CancellationToken) -> Result<Arc<Track>> {
        let mut rx = self.tracks.subscribe();
        let found = async {
            rx.wait_for(|tracks| tracks.contains_key(name))
                .await
                .ok()
                .and_then(|tracks| tracks.get(name).cloned())
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            _ = self.token.cancelled() => Err(Error::StreamClosed(self.path.clone())),
            track = tokio::time::timeout(self.wait_timeout(), found) => match track {
                Ok(Some(track)) => Ok(track),
                Ok(None) => Err(Error::StreamClosed(self.path.clone())),
                Err(_) => Err(Error::TrackTimeout(name.to_string())),
            },
        }
    }

    /// Close the stream and every participant bound to it
    pub fn close(&self) {
        let (publisher, subscribers) = {
            let mut inner = self.lock();
            if inner.state == StreamState::Closed {
                return;
            }
            inner.state = StreamState::Closed;
            inner.previous = None;
            (inner.publisher.take(), std::mem::take(&mut inner.subscribers))
        };
        self.token.cancel();

        tracing::info!(stream = %self.path, subscribers = subscribers.len(), "Stream closed");
        if let Some(publisher) = publisher {
            publisher.on_event(&IoEvent::Close);
        }
        for subscriber in subscribers {
            subscriber.on_event(&IoEvent::Close);
        }
    }

    /// Statistics snapshot
    pub fn snapshot(&self) -> StreamStats {
        let (has_publisher, subscriber_count) = {
            let inner = self.lock();
            (inner.publisher.is_some(), inner.subscribers.len())
        };
        let mut tracks: Vec<_> = self
            .tracks()
            .into_iter()
            .map(|t| (t.name().to_string(), t.stats()))
            .collect();
        tracks.sort_by(|a, b| a.0.cmp(&b.0));

        StreamStats {
            path: self.path.clone(),
            has_publisher,
            subscriber_count,
            tracks,
            age: self.created_at.elapsed(),
        }
    }

    fn last_activity(&self, published_at: Instant) -> Instant {
        self.tracks()
            .iter()
            .filter_map(|t| t.last_write_time())
            .fold(published_at, Instant::max)
    }

    /// Apply the idle policy at `now`
    pub(crate) fn check_timeouts(&self, now: Instant) -> Expiry {
        let expiry = self.expiry_at(now);
        match expiry {
            Expiry::PublisherLost => self.publisher_lost(),
            Expiry::Close => self.close(),
            Expiry::Alive => {}
        }
        expiry
    }

    fn expiry_at(&self, now: Instant) -> Expiry {
        let (published_at, publish_timeout) = {
            let mut inner = self.lock();
            inner.subscribers.retain(|s| !s.io().is_closed());
            inner.refresh_idle(now);

            match inner.state {
                StreamState::Closed => return Expiry::Close,
                StreamState::WaitingPublisher => {
                    let expired = match inner.idle_since {
                        Some(idle_since) => {
                            now.saturating_duration_since(idle_since) > inner.delay_close_timeout
                        }
                        None => now.saturating_duration_since(inner.waiting_since) > inner.wait_timeout,
                    };
                    return if expired { Expiry::Close } else { Expiry::Alive };
                }
                StreamState::Publishing => match (&inner.publisher, inner.published_at) {
                    (Some(publisher), Some(at)) if !publisher.io().is_closed() => {
                        (at, inner.publish_timeout)
                    }
                    _ => return Expiry::PublisherLost,
                },
            }
        };

        let silent = now.saturating_duration_since(self.last_activity(published_at));
        if silent > publish_timeout {
            Expiry::PublisherLost
        } else {
            Expiry::Alive
        }
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("Stream")
            .field("path", &self.path)
            .field("state", &inner.state)
            .field("has_publisher", &inner.publisher.is_some())
            .field("subscribers", &inner.subscribers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::media::h264::H264Codec;

    struct TestPublisher {
        io: Io,
    }

    impl Publish for TestPublisher {
        fn io(&self) -> &Io {
            &self.io
        }
    }

    struct TestSubscriber {
        io: Io,
    }

    impl Subscribe for TestSubscriber {
        fn io(&self) -> &Io {
            &self.io
        }
    }

    fn options() -> StreamOptions {
        StreamOptions {
            wait_timeout: Duration::from_secs(2),
            publish_timeout: Duration::from_secs(3),
            delay_close_timeout: Duration::from_secs(5),
            completion: Completion::default(),
            speed_limit: Duration::ZERO,
        }
    }

    fn stream() -> Stream {
        Stream::new("live/test".into(), options(), &CancellationToken::new())
    }

    fn publisher(id: &str) -> Arc<TestPublisher> {
        Arc::new(TestPublisher { io: Io::new(id) })
    }

    fn subscriber(id: &str) -> Arc<TestSubscriber> {
        Arc::new(TestSubscriber { io: Io::new(id) })
    }

    #[tokio::test]
    async fn test_single_publisher() {
        let stream = stream();
        let a = publisher("a");
        let b = publisher("b");

        assert!(stream.receive_publisher(a.clone(), false).unwrap().is_none());
        assert_eq!(stream.state(), StreamState::Publishing);

        let result = stream.receive_publisher(b.clone(), false);
        assert!(matches!(result, Err(Error::NameExists(_))));
        assert!(std::ptr::eq(stream.publisher().unwrap().io(), &a.io));
        assert!(!a.io.is_closed());
    }

    #[tokio::test]
    async fn test_same_instance_rebinds_without_kick() {
        let stream = stream();
        let a = publisher("a");

        stream.receive_publisher(a.clone(), false).unwrap();
        let prior = stream.receive_publisher(a.clone(), false).unwrap();
        assert!(std::ptr::eq(prior.unwrap().io(), &a.io));
        assert!(!a.io.is_closed());
    }

    #[tokio::test]
    async fn test_resume_reports_lost_publisher() {
        let stream = stream();
        let a = publisher("a");
        let b = publisher("b");

        stream.receive_publisher(a.clone(), false).unwrap();
        assert!(stream.remove_publisher(&a.io));
        assert!(a.io.is_closed());
        assert_eq!(stream.state(), StreamState::WaitingPublisher);

        let prior = stream.receive_publisher(b, false).unwrap();
        assert_eq!(prior.unwrap().io().id(), "a");
    }

    #[tokio::test]
    async fn test_kick_incumbent() {
        let stream = stream();
        let a = publisher("a");
        let b = publisher("b");

        stream.receive_publisher(a.clone(), true).unwrap();
        stream.receive_publisher(b.clone(), true).unwrap();

        assert!(a.io.is_closed());
        assert!(!b.io.is_closed());
        assert!(std::ptr::eq(stream.publisher().unwrap().io(), &b.io));
    }

    #[tokio::test]
    async fn test_closed_incumbent_replaced() {
        let stream = stream();
        let a = publisher("a");
        let b = publisher("b");

        stream.receive_publisher(a.clone(), false).unwrap();
        a.io.stop();
        assert!(stream.receive_publisher(b, false).is_ok());
    }

    #[tokio::test]
    async fn test_subscribers() {
        let stream = stream();
        let s1 = subscriber("s1");
        let s2 = subscriber("s2");

        stream.receive_subscriber(s1.clone()).unwrap();
        stream.receive_subscriber(s2.clone()).unwrap();
        assert_eq!(stream.subscriber_count(), 2);
        assert!(stream.has_subscriber(&s1.io));

        assert!(stream.remove_subscriber(&s1.io));
        assert!(!stream.remove_subscriber(&s1.io));
        assert_eq!(stream.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn test_close_notifies_everyone() {
        let stream = stream();
        let p = publisher("p");
        let s = subscriber("s");
        stream.receive_publisher(p.clone(), false).unwrap();
        stream.receive_subscriber(s.clone()).unwrap();

        stream.close();

        assert!(stream.is_closed());
        assert!(stream.token().is_cancelled());
        assert!(p.io.is_closed());
        assert!(s.io.is_closed());
        assert!(matches!(
            stream.receive_subscriber(subscriber("late")),
            Err(Error::StreamClosed(_))
        ));
    }

    #[tokio::test]
    async fn test_track_names_unique_while_writer_lives() {
        let stream = stream();
        let media = stream
            .new_track(TrackConfig::video("h264"), H264Codec::new())
            .unwrap();

        let dup = stream.new_track(TrackConfig::video("h264"), H264Codec::new());
        assert!(matches!(dup, Err(Error::TrackExists(_))));

        drop(media);
        assert!(stream.new_track(TrackConfig::video("h264"), H264Codec::new()).is_ok());
        assert_eq!(stream.tracks().len(), 1);
    }

    #[tokio::test]
    async fn test_wait_track() {
        let stream = Arc::new(stream());
        let cancel = CancellationToken::new();

        let waiter = {
            let stream = Arc::clone(&stream);
            let cancel = cancel.clone();
            tokio::spawn(async move { stream.wait_track("h264", &cancel).await })
        };
        tokio::task::yield_now().await;

        let mut media = stream
            .new_track(TrackConfig::video("h264"), H264Codec::new())
            .unwrap();
        let track = waiter.await.unwrap().unwrap();
        assert_eq!(track.name(), "h264");

        let mut reader = track.reader();
        media
            .write_avcc(40, Bytes::from_static(&[0x17, 0x01, 0, 0, 0, 0, 0, 0, 2, 0x65, 0x88]))
            .unwrap();
        media.flush().await;
        assert_eq!(reader.next(&cancel).await.unwrap().abs_time, 40);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_track_times_out() {
        let stream = stream();
        let cancel = CancellationToken::new();
        let result = stream.wait_track("aac", &cancel).await;
        assert!(matches!(result, Err(Error::TrackTimeout(ref name)) if name == "aac"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_publisher() {
        let stream = Arc::new(stream());
        let cancel = CancellationToken::new();

        let result = stream.wait_publisher(&cancel).await;
        assert!(matches!(result, Err(Error::PublisherLost(_))));

        let waiter = {
            let stream = Arc::clone(&stream);
            let cancel = cancel.clone();
            tokio::spawn(async move { stream.wait_publisher(&cancel).await.map(|p| p.io().id().to_string()) })
        };
        tokio::task::yield_now().await;
        stream.receive_publisher(publisher("p"), false).unwrap();

        assert_eq!(waiter.await.unwrap().unwrap(), "p");
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_timeout() {
        let stream = stream();
        let p = publisher("p");
        let s = subscriber("s");
        stream.receive_publisher(p.clone(), false).unwrap();
        stream.receive_subscriber(s.clone()).unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(stream.check_timeouts(Instant::now()), Expiry::Alive);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(stream.check_timeouts(Instant::now()), Expiry::PublisherLost);
        assert!(p.io.is_closed());
        assert_eq!(stream.state(), StreamState::WaitingPublisher);
        assert!(!s.io.is_closed());

        // Subscriber waits 2s for a new publisher
        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(stream.check_timeouts(Instant::now()), Expiry::Close);
        assert!(s.io.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_writes_keep_publisher_alive() {
        let stream = stream();
        let p = publisher("p");
        stream.receive_publisher(p.clone(), false).unwrap();
        let mut media = stream
            .new_track(TrackConfig::audio("aac"), crate::media::aac::AacCodec::new())
            .unwrap();

        for _ in 0..4 {
            tokio::time::advance(Duration::from_secs(2)).await;
            media.write_avcc(0, Bytes::from_static(&[0xAF, 0x01, 0x21])).unwrap();
            media.flush().await;
            assert_eq!(stream.check_timeouts(Instant::now()), Expiry::Alive);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_close_without_participants() {
        let stream = stream();

        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(stream.check_timeouts(Instant::now()), Expiry::Alive);
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(stream.check_timeouts(Instant::now()), Expiry::Close);
        assert!(stream.is_closed());
    }

    #[tokio::test]
    async fn test_snapshot() {
        let stream = stream();
        stream.receive_publisher(publisher("p"), false).unwrap();
        let _v = stream.new_track(TrackConfig::video("h264"), H264Codec::new()).unwrap();
        let _a = stream
            .new_track(TrackConfig::audio("aac"), crate::media::aac::AacCodec::new())
            .unwrap();

        let stats = stream.snapshot();
        assert_eq!(stats.path, "live/test");
        assert!(stats.has_publisher);
        assert_eq!(stats.subscriber_count, 0);
        let names: Vec<_> = stats.tracks.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["aac", "h264"]);
    }
}
