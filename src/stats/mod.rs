//! Track and stream statistics

pub mod metrics;

pub use metrics::{StreamStats, TrackStats};
