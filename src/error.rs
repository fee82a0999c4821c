//! Error types
//!
//! A single error type covers admission, authentication, ring cursors and
//! container framing. It is `Clone` so a failed authentication outcome can
//! be stored in a [`Promise`](crate::io::Promise) and read by every waiter.

use std::sync::Arc;

/// Result alias used throughout the crate
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Error type for engine operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// Another publisher already owns the stream and eviction is disabled
    #[error("Stream already exists: {0}")]
    NameExists(String),

    /// The stream (or the whole engine) is shutting down
    #[error("Stream is closed: {0}")]
    StreamClosed(String),

    /// The publisher stopped producing within the publish timeout
    #[error("Publisher lost: {0}")]
    PublisherLost(String),

    /// The stream path could not be parsed
    #[error("Invalid stream path {path:?}: {source}")]
    InvalidPath {
        path: String,
        #[source]
        source: url::ParseError,
    },

    /// Authentication hook rejected the participant
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// A wait was cancelled through the participant's lifetime scope
    #[error("Cancelled")]
    Cancelled,

    /// A promise was resolved twice
    #[error("Promise already resolved")]
    PromiseResolved,

    /// Every handle to a promise was dropped before it was resolved
    #[error("Promise dropped without a decision")]
    PromiseAbandoned,

    /// A subscriber gave up waiting for a track
    #[error("Timed out waiting for track: {0}")]
    TrackTimeout(String),

    /// The writer of a track went away
    #[error("Track closed")]
    TrackClosed,

    /// A track with this name already has a writer
    #[error("Track already exists: {0}")]
    TrackExists(String),

    /// Malformed or truncated FLV data
    #[error("Invalid FLV: {0}")]
    InvalidFlv(&'static str),

    /// Malformed RTP packet
    #[error("Invalid RTP packet: {0}")]
    InvalidRtp(&'static str),

    /// Malformed codec payload
    #[error("Invalid media payload: {0}")]
    InvalidMedia(&'static str),

    /// Underlying I/O failure
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            return Error::InvalidFlv("unexpected end of stream");
        }
        Error::Io(Arc::new(err))
    }
}

impl Error {
    /// Whether the error ends the stream rather than just this participant
    pub fn is_stream_closed(&self) -> bool {
        matches!(self, Error::StreamClosed(_) | Error::PublisherLost(_))
    }
}
