//! Statistics for tracks and streams

use std::time::Duration;

use tokio::time::Instant;

use crate::media::frame::AVFrame;

/// Length of the rate measurement window
const RATE_WINDOW: Duration = Duration::from_secs(1);

/// Per-track accounting, updated once per committed frame
#[derive(Debug, Clone, Default)]
pub struct TrackStats {
    /// Frames committed
    pub frames: u64,
    /// Keyframes committed
    pub keyframes: u64,
    /// Bytes received from the publisher
    pub bytes_in: u64,
    /// Absolute timestamp of the last frame
    pub last_abs_time: u32,
    /// Bitrate over the last complete window (bits/sec)
    pub bps: u64,
    /// Frame rate over the last complete window
    pub fps: u32,
    window_start: Option<Instant>,
    window_bytes: u64,
    window_frames: u32,
}

impl TrackStats {
    /// Account for one frame
    pub fn record(&mut self, frame: &AVFrame) {
        let now = frame.written_at.unwrap_or_else(Instant::now);

        self.frames += 1;
        if frame.keyframe {
            self.keyframes += 1;
        }
        self.bytes_in += frame.bytes_in as u64;
        self.last_abs_time = frame.abs_time;

        let start = *self.window_start.get_or_insert(now);
        let elapsed = now.saturating_duration_since(start);
        if elapsed >= RATE_WINDOW {
            let secs = elapsed.as_secs_f64();
            self.bps = (self.window_bytes as f64 * 8.0 / secs) as u64;
            self.fps = (self.window_frames as f64 / secs).round() as u32;
            self.window_start = Some(now);
            self.window_bytes = 0;
            self.window_frames = 0;
        }
        self.window_bytes += frame.bytes_in as u64;
        self.window_frames += 1;
    }
}

/// Snapshot of a stream
#[derive(Debug, Clone)]
pub struct StreamStats {
    /// Stream path
    pub path: String,
    /// Whether a publisher is bound
    pub has_publisher: bool,
    /// Number of bound subscribers
    pub subscriber_count: usize,
    /// Per-track statistics by track name
    pub tracks: Vec<(String, TrackStats)>,
    /// Time since the stream was created
    pub age: Duration,
}

impl StreamStats {
    /// Total bytes received across tracks
    pub fn bytes_in(&self) -> u64 {
        self.tracks.iter().map(|(_, t)| t.bytes_in).sum()
    }

    /// Combined bitrate across tracks
    pub fn bitrate(&self) -> u64 {
        self.tracks.iter().map(|(_, t)| t.bps).sum()
    }
}
