//! Media frames
//!
//! An [`AVFrame`] is one timestamped access unit. The single writer of a
//! track builds it in place, then the completion pipeline fills in the
//! missing representation and commits it to the ring as an `Arc<AVFrame>`,
//! after which it is never mutated again.
//!
//! Timestamps:
//! - `pts`/`dts` are in 90 kHz units for every track kind (audio clocks are
//!   rescaled on write), so a DTS difference divided by 90 is milliseconds.
//! - `abs_time` is milliseconds on the stream's timeline; zero means "not
//!   supplied" and is derived from the DTS at flush.
//! - `delta_time` is always derived at flush, never supplied.

use bytes::{Bytes, BytesMut};
use tokio::time::Instant;

use super::rtp::RtpPacket;

/// Media kind of a track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Audio,
    Video,
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaKind::Audio => write!(f, "audio"),
            MediaKind::Video => write!(f, "video"),
        }
    }
}

/// One timestamped media access unit
#[derive(Debug, Clone, Default)]
pub struct AVFrame {
    /// Presentation timestamp (90 kHz)
    pub pts: u32,
    /// Decode timestamp (90 kHz)
    pub dts: u32,
    /// Absolute timestamp in milliseconds
    pub abs_time: u32,
    /// Milliseconds since the previous frame of the track
    pub delta_time: u32,
    /// Bytes received from the publisher for this frame
    pub bytes_in: usize,
    /// Random access point
    pub keyframe: bool,
    /// Packetized representation
    pub rtp: Vec<RtpPacket>,
    /// Length-prefixed representation (FLV tag body chunks)
    pub avcc: Vec<Bytes>,
    /// Raw slices written through `write_slice` (e.g. NAL units)
    pub raw: Vec<Bytes>,
    /// Position in the track, assigned on commit
    pub sequence: u64,
    /// Wall time of the commit
    pub written_at: Option<Instant>,
}

impl AVFrame {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a length-prefixed chunk
    pub fn append_avcc(&mut self, chunk: Bytes) {
        self.avcc.push(chunk);
    }

    /// Append an RTP packet
    pub fn append_rtp(&mut self, packet: RtpPacket) {
        self.rtp.push(packet);
    }

    /// Append a raw slice
    pub fn append_raw(&mut self, slice: Bytes) {
        self.raw.push(slice);
    }

    pub fn has_avcc(&self) -> bool {
        !self.avcc.is_empty()
    }

    pub fn has_rtp(&self) -> bool {
        !self.rtp.is_empty()
    }

    /// Total size of the AVCC chunks
    pub fn avcc_len(&self) -> usize {
        self.avcc.iter().map(Bytes::len).sum()
    }

    /// AVCC chunks as one contiguous buffer
    pub fn avcc_bytes(&self) -> Bytes {
        match self.avcc.as_slice() {
            [] => Bytes::new(),
            [single] => single.clone(),
            chunks => {
                let mut buf = BytesMut::with_capacity(self.avcc_len());
                for chunk in chunks {
                    buf.extend_from_slice(chunk);
                }
                buf.freeze()
            }
        }
    }

    /// Composition time offset in milliseconds
    pub fn cts_ms(&self) -> u32 {
        self.pts.wrapping_sub(self.dts) / 90
    }

    /// Clear everything so the frame can be reused as the next write target
    pub fn reset(&mut self) {
        self.pts = 0;
        self.dts = 0;
        self.abs_time = 0;
        self.delta_time = 0;
        self.bytes_in = 0;
        self.keyframe = false;
        self.rtp.clear();
        self.avcc.clear();
        self.raw.clear();
        self.sequence = 0;
        self.written_at = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::rtp::RtpHeader;

    #[test]
    fn test_representations() {
        let mut frame = AVFrame::new();
        assert!(!frame.has_avcc());
        assert!(!frame.has_rtp());

        frame.append_avcc(Bytes::from_static(&[0x17, 0x01]));
        frame.append_avcc(Bytes::from_static(&[0x00, 0x00, 0x00]));
        assert!(frame.has_avcc());
        assert_eq!(frame.avcc_len(), 5);
        assert_eq!(&frame.avcc_bytes()[..], &[0x17, 0x01, 0x00, 0x00, 0x00]);

        frame.append_rtp(RtpPacket::new(RtpHeader::default(), Bytes::from_static(&[1])));
        assert!(frame.has_rtp());
    }

    #[test]
    fn test_reset() {
        let mut frame = AVFrame::new();
        frame.abs_time = 40;
        frame.dts = 3600;
        frame.keyframe = true;
        frame.append_avcc(Bytes::from_static(&[0xAF, 0x01]));
        frame.append_raw(Bytes::from_static(&[0x65]));

        frame.reset();

        assert_eq!(frame.abs_time, 0);
        assert_eq!(frame.dts, 0);
        assert!(!frame.keyframe);
        assert!(frame.avcc.is_empty());
        assert!(frame.raw.is_empty());
    }

    #[test]
    fn test_cts_ms() {
        let frame = AVFrame {
            dts: 9000,
            pts: 9000 + 90 * 80,
            ..Default::default()
        };
        assert_eq!(frame.cts_ms(), 80);
    }
}
