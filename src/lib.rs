//! # live-engine
//!
//! Transport-independent core of a live media server. Protocol adapters
//! (RTMP, RTSP, HTTP-FLV, ...) bind publishers and subscribers to named
//! streams; the engine handles admission, authentication and idle cleanup,
//! and every track fans its frames out through a lock-free ring.
//!
//! ```no_run
//! use std::sync::Arc;
//! use live_engine::{Engine, EngineConfig, Io, Publish};
//!
//! struct Relay {
//!     io: Io,
//! }
//!
//! impl Publish for Relay {
//!     fn io(&self) -> &Io {
//!         &self.io
//!     }
//! }
//!
//! # async fn run() -> live_engine::Result<()> {
//! let engine = Engine::new(EngineConfig::default());
//! engine.spawn_cleanup_task();
//!
//! let relay = Arc::new(Relay { io: Io::new("relay-1") });
//! let stream = engine.bind_publisher("live/test", relay).await?;
//! let _video = stream.new_track(
//!     live_engine::config::TrackConfig::video("h264"),
//!     live_engine::media::H264Codec::new(),
//! )?;
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`registry`]: the [`Engine`] and its [`Stream`]s
//! - [`io`]: participant identity, lifecycle events and authentication
//! - [`media`]: frames, rings, the completion pipeline and FLV framing
//! - [`stats`]: per-track and per-stream accounting

pub mod config;
pub mod error;
pub mod io;
pub mod media;
pub mod registry;
pub mod stats;

pub use config::{EngineConfig, PublishConfig, SubscribeConfig, TrackConfig};
pub use error::{Error, Result};
pub use io::{auth_hook, Io, IoEvent, Participant, Promise, Publish, Subscribe};
pub use registry::{Engine, EngineEvent, Stream, StreamState};
