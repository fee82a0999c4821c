//! Flow pacing
//!
//! Keeps a publisher that replays or bursts frames from running ahead of
//! the media's own timeline. Real-time sources never sleep: the writer is
//! only held back when the frame timestamps are more than
//! [`ELASTIC_WINDOW`] ahead of the wall clock since the baseline.

use std::time::Duration;

use tokio::time::Instant;

/// Slack absorbed before the pacer sleeps
pub const ELASTIC_WINDOW: Duration = Duration::from_millis(100);

/// Per-track pacing state
#[derive(Debug, Clone)]
pub struct FlowPacer {
    baseline_ts: u32,
    baseline_at: Option<Instant>,
    ceiling: Duration,
}

impl FlowPacer {
    /// Create a pacer; a zero ceiling disables pacing
    pub fn new(ceiling: Duration) -> Self {
        Self {
            baseline_ts: 0,
            baseline_at: None,
            ceiling,
        }
    }

    /// Restart the timeline at `abs_time`
    pub fn reset(&mut self, abs_time: u32) {
        self.baseline_at = Some(Instant::now());
        self.baseline_ts = abs_time;
    }

    /// Whether a baseline has been set
    pub fn is_initialized(&self) -> bool {
        self.baseline_at.is_some()
    }

    pub fn is_enabled(&self) -> bool {
        !self.ceiling.is_zero()
    }

    pub fn ceiling(&self) -> Duration {
        self.ceiling
    }

    pub fn set_ceiling(&mut self, ceiling: Duration) {
        self.ceiling = ceiling;
    }

    /// How long the writer should sleep before committing `abs_time`
    pub fn delay_for(&self, abs_time: u32) -> Option<Duration> {
        if !self.is_enabled() {
            return None;
        }
        let baseline_at = self.baseline_at?;

        let source_elapsed = Duration::from_millis(abs_time.wrapping_sub(self.baseline_ts) as u64);
        let wall_elapsed = baseline_at.elapsed();

        // Behind the wall clock (or within the window): proceed without sleeping
        let ahead = source_elapsed.checked_sub(wall_elapsed)?;
        if ahead > ELASTIC_WINDOW {
            Some(ahead.min(self.ceiling))
        } else {
            None
        }
    }

    /// Sleep as long as `delay_for` says
    pub async fn pace(&self, abs_time: u32) {
        if let Some(delay) = self.delay_for(abs_time) {
            tracing::trace!(abs_time, delay_ms = delay.as_millis() as u64, "Pacing writer");
            tokio::time::sleep(delay).await;
        }
    }
}

impl Default for FlowPacer {
    fn default() -> Self {
        Self::new(Duration::ZERO)
    }
}
