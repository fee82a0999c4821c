//! Stream registry and admission control
//!
//! The engine maps stream paths to [`Stream`]s and admits publishers and
//! subscribers to them. Media never passes through the registry: each
//! stream owns its tracks, and subscribers read the track rings directly.
//!
//! # Architecture
//!
//! ```text
//!                            Arc<Engine>
//!                     ┌─────────────────────────┐
//!                     │ streams: HashMap<Path,  │
//!                     │   Arc<Stream> {         │
//!                     │     publisher,          │
//!                     │     subscribers,        │
//!                     │     tracks,             │
//!                     │   }                     │
//!                     │ >                       │
//!                     └───────────┬─────────────┘
//!                                 │
//!         ┌───────────────────────┼───────────────────────┐
//!         │                       │                       │
//!         ▼                       ▼                       ▼
//!    [Publisher]            [Subscriber]            [Subscriber]
//!    Media::flush()         TrackReader::next()     TrackReader::next()
//!         │                       ▲                       ▲
//!         └──► Track ring ────────┴───────────────────────┘
//! ```
//!
//! # Lifecycle
//!
//! A stream is created by the first bind on its path. When its publisher
//! goes silent past the publish timeout it falls back to waiting; when it
//! has no participants past the delay-close timeout, or its subscribers
//! waited too long, [`Engine::cleanup`] closes and removes it.

pub mod store;
pub mod stream;

pub use store::{parse_stream_path, Engine, EngineEvent};
pub use stream::{Stream, StreamState};
