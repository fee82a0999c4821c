//! Tracks and the frame completion pipeline
//!
//! A track is one elementary stream of a [`Stream`](crate::registry::Stream).
//! It is split in two halves:
//!
//! - [`Media<C>`]: the writer half, owned by the bound publisher. It builds
//!   the current frame, completes it on [`Media::flush`] and commits it to
//!   the ring. There is exactly one per track.
//! - [`Track`]: the shared half (`Arc`), from which subscribers clone
//!   [`TrackReader`] cursors and read the decoder configuration.
//!
//! The codec type parameter supplies the kind-specific transforms between
//! the RTP and AVCC representations.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::TrackConfig;
use crate::error::Result;
use crate::stats::TrackStats;

use super::frame::{AVFrame, MediaKind};
use super::pacer::FlowPacer;
use super::ring::{RingBuffer, RingHandle, RingReader, RingWriter};
use super::rtp::{RtpHeader, RtpPacket, TimestampExtender};

/// Codec-specific strategy of a track
///
/// Conversions may fail on malformed input; the pipeline then leaves that
/// representation empty instead of rejecting the frame.
pub trait TrackCodec: Send + 'static {
    /// Media kind handled by this codec
    const KIND: MediaKind;

    /// Short codec name (e.g. "h264")
    fn name(&self) -> &'static str;

    /// Whether an AVCC payload is a decoder configuration rather than a frame
    fn is_sequence_header(&self, avcc: &[u8]) -> bool;

    /// Extract the raw decoder configuration from an AVCC sequence header
    fn config_from_avcc(&mut self, avcc: &Bytes) -> Result<Vec<Bytes>>;

    /// Build the AVCC sequence header from raw configuration units
    fn config_from_raw(&mut self, raw: &[Bytes]) -> Result<Bytes>;

    /// Clock rate announced by the decoder configuration, if any
    fn clock_rate(&self) -> Option<u32> {
        None
    }

    /// Fill timestamps and flags of a frame written as AVCC at `abs_time` ms
    fn stamp_avcc(&mut self, frame: &mut AVFrame, abs_time: u32);

    /// Fill timestamps of a frame from one of its RTP packets
    fn stamp_rtp(&mut self, frame: &mut AVFrame, header: &RtpHeader, clock_rate: u32);

    /// Whether this packet is the last one of its frame
    fn ends_frame(&self, packet: &RtpPacket) -> bool;

    /// Append a raw slice (e.g. one NAL unit) to the frame
    fn write_slice(&mut self, frame: &mut AVFrame, slice: Bytes);

    /// Derive the RTP representation
    fn complete_rtp(
        &mut self,
        frame: &mut AVFrame,
        muxer: &mut RtpMuxer,
        config: &DecoderConfiguration,
    ) -> Result<()>;

    /// Derive the AVCC representation
    fn complete_avcc(&mut self, frame: &mut AVFrame) -> Result<()>;

    /// Decoder configuration discovered in-band since the last call
    fn take_config_update(&mut self) -> Option<Vec<Bytes>> {
        None
    }
}

/// Decoder configuration (H.264 SPS/PPS, AAC AudioSpecificConfig)
#[derive(Debug, Clone, Default)]
pub struct DecoderConfiguration {
    /// RTP payload type
    pub payload_type: u8,
    /// FLV sequence header body
    pub avcc: Bytes,
    /// Raw configuration units
    pub raw: Vec<Bytes>,
    /// Bumped on every change
    pub seq: u32,
}

impl DecoderConfiguration {
    pub fn is_empty(&self) -> bool {
        self.avcc.is_empty() && self.raw.is_empty()
    }
}

/// Builds outgoing RTP packets for a track
#[derive(Debug, Clone)]
pub struct RtpMuxer {
    pub ssrc: u32,
    pub payload_type: u8,
    pub clock_rate: u32,
    sequence: u16,
    timeline: TimestampExtender,
}

impl RtpMuxer {
    pub fn new(ssrc: u32, payload_type: u8, clock_rate: u32) -> Self {
        Self {
            ssrc,
            payload_type,
            clock_rate,
            sequence: 0,
            timeline: TimestampExtender::default(),
        }
    }

    /// Next packet in sequence
    pub fn packet(&mut self, marker: bool, timestamp: u32, payload: Bytes) -> RtpPacket {
        let header = RtpHeader {
            marker,
            payload_type: self.payload_type,
            sequence_number: self.sequence,
            timestamp,
            ssrc: self.ssrc,
        };
        self.sequence = self.sequence.wrapping_add(1);
        RtpPacket::new(header, payload)
    }

    /// Convert a 90 kHz timestamp to this muxer's clock
    ///
    /// Timestamps are extended across 32-bit wraps before scaling, so the
    /// output keeps advancing by the scaled step when the input wraps.
    pub fn rescale(&mut self, ts_90k: u32) -> u32 {
        self.timeline.rescale(ts_90k, 90_000, self.clock_rate)
    }
}

/// Which representations the completion pipeline derives
#[derive(Debug, Clone, Copy)]
pub struct Completion {
    pub rtp: bool,
    pub avcc: bool,
}

impl Default for Completion {
    fn default() -> Self {
        Self {
            rtp: true,
            avcc: true,
        }
    }
}

/// Synchronization source derived from the track identity
pub fn derive_ssrc(stream_path: &str, track_name: &str) -> u32 {
    // FNV-1a
    let mut hash: u32 = 0x811c_9dc5;
    for b in stream_path.bytes().chain([b'/']).chain(track_name.bytes()) {
        hash ^= b as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

/// Shared half of a track
pub struct Track {
    name: String,
    kind: MediaKind,
    codec: &'static str,
    ssrc: u32,
    sample_rate: AtomicU32,
    poll: Duration,
    ring: RingHandle,
    config: watch::Sender<DecoderConfiguration>,
    stats: Mutex<TrackStats>,
}

impl Track {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn codec(&self) -> &'static str {
        self.codec
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate.load(Ordering::Relaxed)
    }

    pub fn poll(&self) -> Duration {
        self.poll
    }

    /// Current decoder configuration
    pub fn decoder_configuration(&self) -> DecoderConfiguration {
        self.config.borrow().clone()
    }

    /// Watch decoder configuration changes
    pub fn watch_decoder_configuration(&self) -> watch::Receiver<DecoderConfiguration> {
        self.config.subscribe()
    }

    /// A new read cursor at the writer's current position
    pub fn reader(self: &Arc<Self>) -> TrackReader {
        TrackReader {
            track: Arc::clone(self),
            cursor: self.ring.reader(),
        }
    }

    /// Commit time of the last frame
    pub fn last_write_time(&self) -> Option<Instant> {
        self.ring.last_write_time()
    }

    /// Most recent committed frame
    pub fn latest(&self) -> Option<Arc<AVFrame>> {
        self.ring.latest()
    }

    /// Whether the writer half has been dropped
    pub fn is_closed(&self) -> bool {
        self.ring.is_closed()
    }

    pub fn stats(&self) -> TrackStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn record(&self, frame: &AVFrame) {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record(frame);
    }
}

impl std::fmt::Debug for Track {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Track")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("codec", &self.codec)
            .field("ssrc", &self.ssrc)
            .field("committed", &self.ring.committed())
            .finish()
    }
}

/// Subscriber-side cursor over a track
pub struct TrackReader {
    track: Arc<Track>,
    cursor: RingReader,
}

impl TrackReader {
    pub fn track(&self) -> &Arc<Track> {
        &self.track
    }

    /// Wait for the next frame
    pub async fn next(&mut self, cancel: &CancellationToken) -> Result<Arc<AVFrame>> {
        self.cursor.next(cancel).await
    }

    /// Deliver every frame in commit order until `cancel` fires, the
    /// callback fails, or the writer goes away
    pub async fn play<F>(&mut self, cancel: &CancellationToken, mut on_frame: F) -> Result<()>
    where
        F: FnMut(&Arc<AVFrame>) -> Result<()>,
    {
        loop {
            let frame = self.cursor.next(cancel).await?;
            if let Err(err) = on_frame(&frame) {
                tracing::debug!(
                    track = %self.track.name,
                    sequence = frame.sequence,
                    error = %err,
                    "Frame callback failed"
                );
                return Err(err);
            }
        }
    }

    /// Frames this reader lost to overwrite
    pub fn skipped(&self) -> u64 {
        self.cursor.skipped()
    }
}

type FlushHook = Box<dyn FnMut(&AVFrame) + Send>;

/// Writer half of a track
pub struct Media<C: TrackCodec> {
    track: Arc<Track>,
    codec: C,
    ring: RingWriter,
    current: AVFrame,
    pacer: FlowPacer,
    muxer: RtpMuxer,
    completion: Completion,
    flush_hook: Option<FlushHook>,
}

impl<C: TrackCodec> Media<C> {
    /// Create a track for `stream_path`
    pub fn new(stream_path: &str, config: &TrackConfig, codec: C, completion: Completion) -> Self {
        let (ring, handle) = RingBuffer::new(config.ring_size);
        let ssrc = derive_ssrc(stream_path, &config.name);
        let (decoder_config, _) = watch::channel(DecoderConfiguration {
            payload_type: config.payload_type,
            ..Default::default()
        });

        let track = Arc::new(Track {
            name: config.name.clone(),
            kind: C::KIND,
            codec: codec.name(),
            ssrc,
            sample_rate: AtomicU32::new(config.sample_rate),
            poll: config.poll,
            ring: handle,
            config: decoder_config,
            stats: Mutex::new(TrackStats::default()),
        });

        Self {
            track,
            codec,
            ring,
            current: AVFrame::new(),
            pacer: FlowPacer::new(config.speed_limit.unwrap_or_default()),
            muxer: RtpMuxer::new(ssrc, config.payload_type, config.sample_rate),
            completion,
            flush_hook: None,
        }
    }

    /// Shared half of this track
    pub fn track(&self) -> &Arc<Track> {
        &self.track
    }

    pub fn codec(&self) -> &C {
        &self.codec
    }

    /// Frame being written
    pub fn current(&self) -> &AVFrame {
        &self.current
    }

    /// Frame being written, mutably (for transports that stamp extra fields)
    pub fn current_mut(&mut self) -> &mut AVFrame {
        &mut self.current
    }

    /// Last committed frame
    pub fn previous(&self) -> Option<&Arc<AVFrame>> {
        self.ring.last()
    }

    /// A read cursor over this track
    pub fn reader(&self) -> TrackReader {
        self.track.reader()
    }

    /// Change the pacing ceiling; zero disables pacing
    pub fn set_speed_limit(&mut self, limit: Duration) {
        self.pacer.set_ceiling(limit);
    }

    /// Register bookkeeping run on every frame before it is committed
    pub fn set_flush_hook(&mut self, hook: impl FnMut(&AVFrame) + Send + 'static) {
        self.flush_hook = Some(Box::new(hook));
    }

    /// Store an AVCC sequence header as the decoder configuration
    pub fn set_decoder_configuration(&mut self, avcc: Bytes) -> Result<()> {
        let raw = self.codec.config_from_avcc(&avcc)?;
        self.publish_config(avcc, raw);
        Ok(())
    }

    /// Store raw configuration units (e.g. SPS and PPS from SDP)
    pub fn set_raw_decoder_configuration(&mut self, raw: Vec<Bytes>) -> Result<()> {
        let avcc = self.codec.config_from_raw(&raw)?;
        self.publish_config(avcc, raw);
        Ok(())
    }

    fn publish_config(&mut self, avcc: Bytes, raw: Vec<Bytes>) {
        if let Some(rate) = self.codec.clock_rate() {
            self.track.sample_rate.store(rate, Ordering::Relaxed);
            self.muxer.clock_rate = rate;
        }
        self.track.config.send_modify(|config| {
            config.avcc = avcc;
            config.raw = raw;
            config.seq = config.seq.wrapping_add(1);
        });
        tracing::debug!(
            track = %self.track.name,
            codec = self.codec.name(),
            "Decoder configuration updated"
        );
    }

    /// Append an AVCC payload (FLV tag body) to the current frame
    ///
    /// Sequence headers update the decoder configuration instead.
    pub fn write_avcc(&mut self, abs_time: u32, data: Bytes) -> Result<()> {
        if self.codec.is_sequence_header(&data) {
            return self.set_decoder_configuration(data);
        }
        self.current.abs_time = abs_time;
        self.current.bytes_in += data.len();
        self.current.append_avcc(data);
        self.codec.stamp_avcc(&mut self.current, abs_time);
        Ok(())
    }

    /// Append an RTP packet, flushing when it ends the frame
    pub async fn write_rtp(&mut self, packet: RtpPacket) {
        let clock_rate = self.track.sample_rate();
        self.current.bytes_in += packet.size();
        self.codec
            .stamp_rtp(&mut self.current, &packet.header, clock_rate);
        let ends_frame = self.codec.ends_frame(&packet);
        self.current.append_rtp(packet);
        if ends_frame {
            self.flush().await;
        }
    }

    /// Append a raw slice to the current frame
    pub fn write_slice(&mut self, slice: Bytes) {
        self.current.bytes_in += slice.len();
        self.codec.write_slice(&mut self.current, slice);
    }

    /// Set PTS and DTS (90 kHz) of the current frame
    pub fn generate_timestamp(&mut self, ts: u32) {
        self.current.pts = ts;
        self.current.dts = ts;
    }

    /// Complete, stamp, pace and commit the current frame
    pub async fn flush(&mut self) {
        let mut frame = std::mem::take(&mut self.current);

        if self.completion.rtp && !frame.has_rtp() {
            let config = self.track.config.borrow().clone();
            if let Err(err) = self.codec.complete_rtp(&mut frame, &mut self.muxer, &config) {
                tracing::debug!(track = %self.track.name, error = %err, "RTP completion skipped");
            }
        }
        if self.completion.avcc && !frame.has_avcc() {
            if let Err(err) = self.codec.complete_avcc(&mut frame) {
                tracing::debug!(track = %self.track.name, error = %err, "AVCC completion skipped");
            }
        }
        if let Some(raw) = self.codec.take_config_update() {
            match self.codec.config_from_raw(&raw) {
                Ok(avcc) => self.publish_config(avcc, raw),
                Err(err) => {
                    tracing::debug!(track = %self.track.name, error = %err, "In-band configuration ignored")
                }
            }
        }

        if !frame.has_rtp() && !frame.has_avcc() && frame.raw.is_empty() {
            tracing::debug!(track = %self.track.name, "Dropping empty frame");
            return;
        }

        match self.ring.last() {
            Some(prev) if self.pacer.is_initialized() => {
                if frame.abs_time == 0 {
                    frame.delta_time = frame.dts.wrapping_sub(prev.dts) / 90;
                    frame.abs_time = prev.abs_time.wrapping_add(frame.delta_time);
                } else {
                    frame.delta_time = frame.abs_time.wrapping_sub(prev.abs_time);
                }
            }
            _ => {
                frame.delta_time = 0;
                self.pacer.reset(frame.abs_time);
            }
        }

        frame.written_at = Some(Instant::now());
        self.track.record(&frame);
        if let Some(hook) = self.flush_hook.as_mut() {
            hook(&frame);
        }

        if self.pacer.is_enabled() {
            self.pacer.pace(frame.abs_time).await;
        }

        let committed = self.ring.commit(frame);
        tracing::trace!(
            track = %self.track.name,
            sequence = committed.sequence,
            abs_time = committed.abs_time,
            delta = committed.delta_time,
            "Frame committed"
        );
    }
}
