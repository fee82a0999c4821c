//! Engine configuration
//!
//! Every option the engine, publishers, subscribers and tracks recognize is
//! a named field here. Loading these from files is left to the embedding
//! application.

use std::time::Duration;

/// Default ring capacity for video tracks
pub const DEFAULT_VIDEO_RING_SIZE: usize = 256;

/// Default ring capacity for audio tracks
pub const DEFAULT_AUDIO_RING_SIZE: usize = 256;

/// Engine-wide options
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Run the authentication hooks on every bind
    pub enable_auth: bool,

    /// Derive the RTP representation of frames that lack one
    pub enable_rtp: bool,

    /// Derive the AVCC representation of frames that lack one
    pub enable_avcc: bool,

    /// Default pacing ceiling for new tracks (zero disables pacing)
    pub speed_limit: Duration,

    /// How often idle streams are checked
    pub cleanup_interval: Duration,

    /// Capacity of the engine event channel
    pub event_capacity: usize,

    /// Defaults applied to publishers
    pub publish: PublishConfig,

    /// Defaults applied to subscribers
    pub subscribe: SubscribeConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            enable_auth: true,
            enable_rtp: true,
            enable_avcc: true,
            speed_limit: Duration::from_millis(500),
            cleanup_interval: Duration::from_secs(1),
            event_capacity: 64,
            publish: PublishConfig::default(),
            subscribe: SubscribeConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Enable or disable authentication hooks
    pub fn enable_auth(mut self, enabled: bool) -> Self {
        self.enable_auth = enabled;
        self
    }

    /// Enable or disable RTP completion
    pub fn enable_rtp(mut self, enabled: bool) -> Self {
        self.enable_rtp = enabled;
        self
    }

    /// Enable or disable AVCC completion
    pub fn enable_avcc(mut self, enabled: bool) -> Self {
        self.enable_avcc = enabled;
        self
    }

    /// Set the default pacing ceiling
    pub fn speed_limit(mut self, limit: Duration) -> Self {
        self.speed_limit = limit;
        self
    }

    /// Set the cleanup interval
    pub fn cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    /// Set publisher defaults
    pub fn publish(mut self, publish: PublishConfig) -> Self {
        self.publish = publish;
        self
    }

    /// Set subscriber defaults
    pub fn subscribe(mut self, subscribe: SubscribeConfig) -> Self {
        self.subscribe = subscribe;
        self
    }
}

/// Publisher options
#[derive(Debug, Clone)]
pub struct PublishConfig {
    /// Evict a live incumbent publisher instead of rejecting the newcomer
    pub kick_exist: bool,

    /// A bound publisher that writes nothing for this long is considered lost
    pub publish_timeout: Duration,

    /// How long a stream without publisher or subscribers lingers before removal
    pub delay_close_timeout: Duration,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            kick_exist: false,
            publish_timeout: Duration::from_secs(10),
            delay_close_timeout: Duration::from_secs(10),
        }
    }
}

impl PublishConfig {
    /// Allow evicting the current publisher
    pub fn kick_exist(mut self, kick: bool) -> Self {
        self.kick_exist = kick;
        self
    }

    /// Set publish timeout
    pub fn publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }

    /// Set delay-close timeout
    pub fn delay_close_timeout(mut self, timeout: Duration) -> Self {
        self.delay_close_timeout = timeout;
        self
    }
}

/// Subscriber options
#[derive(Debug, Clone)]
pub struct SubscribeConfig {
    /// How long a subscriber waits for a publisher (or a track) to appear
    pub wait_timeout: Duration,
}

impl Default for SubscribeConfig {
    fn default() -> Self {
        Self {
            wait_timeout: Duration::from_secs(10),
        }
    }
}

impl SubscribeConfig {
    /// Set wait timeout
    pub fn wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = timeout;
        self
    }
}

/// Track options
///
/// `poll` is the interval transports use when polling a track that has no
/// push notification; the engine itself only stores it.
#[derive(Debug, Clone)]
pub struct TrackConfig {
    /// Track name, unique within a stream (e.g. "h264", "aac")
    pub name: String,

    /// Ring capacity
    pub ring_size: usize,

    /// Native clock rate of the media
    pub sample_rate: u32,

    /// RTP payload type
    pub payload_type: u8,

    /// Polling interval for pull-style readers
    pub poll: Duration,

    /// Pacing ceiling; zero disables pacing, `None` inherits the engine default
    pub speed_limit: Option<Duration>,
}

impl TrackConfig {
    /// Video track defaults (90 kHz, payload type 96)
    pub fn video(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ring_size: DEFAULT_VIDEO_RING_SIZE,
            sample_rate: 90_000,
            payload_type: 96,
            poll: Duration::from_millis(20),
            speed_limit: None,
        }
    }

    /// Audio track defaults (44.1 kHz, payload type 97)
    pub fn audio(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ring_size: DEFAULT_AUDIO_RING_SIZE,
            sample_rate: 44_100,
            payload_type: 97,
            poll: Duration::from_millis(10),
            speed_limit: None,
        }
    }

    /// Set ring capacity
    pub fn ring_size(mut self, size: usize) -> Self {
        self.ring_size = size.max(1);
        self
    }

    /// Set sample rate
    pub fn sample_rate(mut self, rate: u32) -> Self {
        self.sample_rate = rate;
        self
    }

    /// Set RTP payload type
    pub fn payload_type(mut self, pt: u8) -> Self {
        self.payload_type = pt & 0x7F;
        self
    }

    /// Set polling interval
    pub fn poll(mut self, poll: Duration) -> Self {
        self.poll = poll;
        self
    }

    /// Set pacing ceiling
    pub fn speed_limit(mut self, limit: Duration) -> Self {
        self.speed_limit = Some(limit);
        self
    }
}
