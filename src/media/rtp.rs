//! RTP packets
//!
//! The packetized representation of a frame is a list of RTP packets.
//!
//! Fixed header (RFC 3550 §5.1):
//! ```text
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |V=2|P|X|  CC   |M|     PT      |       sequence number         |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                           timestamp                           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                             SSRC                              |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

/// Size of the fixed RTP header
pub const RTP_HEADER_SIZE: usize = 12;

/// Payload budget per packet when packetizing
pub const RTP_MAX_PAYLOAD: usize = 1200;

/// RTP fixed header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RtpHeader {
    /// Last packet of an access unit
    pub marker: bool,
    /// Payload type (7 bits)
    pub payload_type: u8,
    /// Sequence number
    pub sequence_number: u16,
    /// Media timestamp in the track's clock rate
    pub timestamp: u32,
    /// Synchronization source
    pub ssrc: u32,
}

/// A single RTP packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpPacket {
    pub header: RtpHeader,
    pub payload: Bytes,
}

impl RtpHeader {
    /// Write the 12-byte header
    pub fn marshal(&self, buf: &mut impl BufMut) {
        buf.put_u8(0x80);
        let marker = if self.marker { 0x80 } else { 0 };
        buf.put_u8(marker | (self.payload_type & 0x7F));
        buf.put_u16(self.sequence_number);
        buf.put_u32(self.timestamp);
        buf.put_u32(self.ssrc);
    }

    /// Read a header, skipping CSRCs and the extension if present
    pub fn unmarshal(buf: &mut impl Buf) -> Result<Self> {
        if buf.remaining() < RTP_HEADER_SIZE {
            return Err(Error::InvalidRtp("short header"));
        }

        let b0 = buf.get_u8();
        if b0 >> 6 != 2 {
            return Err(Error::InvalidRtp("unsupported version"));
        }
        let b1 = buf.get_u8();
        let header = RtpHeader {
            marker: b1 & 0x80 != 0,
            payload_type: b1 & 0x7F,
            sequence_number: buf.get_u16(),
            timestamp: buf.get_u32(),
            ssrc: buf.get_u32(),
        };

        let csrc_len = (b0 & 0x0F) as usize * 4;
        if buf.remaining() < csrc_len {
            return Err(Error::InvalidRtp("short csrc list"));
        }
        buf.advance(csrc_len);

        if b0 & 0x10 != 0 {
            if buf.remaining() < 4 {
                return Err(Error::InvalidRtp("short extension header"));
            }
            let _profile = buf.get_u16();
            let ext_len = buf.get_u16() as usize * 4;
            if buf.remaining() < ext_len {
                return Err(Error::InvalidRtp("short extension"));
            }
            buf.advance(ext_len);
        }

        Ok(header)
    }
}

impl RtpPacket {
    pub fn new(header: RtpHeader, payload: Bytes) -> Self {
        Self { header, payload }
    }

    /// Serialize header and payload into one buffer
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(RTP_HEADER_SIZE + self.payload.len());
        self.header.marshal(&mut buf);
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }

    /// Parse a packet, honoring the padding bit
    pub fn parse(mut data: Bytes) -> Result<Self> {
        let padded = data.first().map(|b| b & 0x20 != 0).unwrap_or(false);
        let header = RtpHeader::unmarshal(&mut data)?;

        if padded {
            let pad = data.last().copied().unwrap_or(0) as usize;
            if pad == 0 || pad > data.len() {
                return Err(Error::InvalidRtp("bad padding"));
            }
            data.truncate(data.len() - pad);
        }

        Ok(Self {
            header,
            payload: data,
        })
    }

    /// Total size on the wire
    pub fn size(&self) -> usize {
        RTP_HEADER_SIZE + self.payload.len()
    }
}

/// Extends wrapping 32-bit timestamps onto a 64-bit timeline
///
/// Consecutive timestamps are assumed to be less than half the 32-bit range
/// apart, so the signed wrapping delta gives the step across a wrap.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimestampExtender {
    last: Option<u32>,
    extended: i64,
}

impl TimestampExtender {
    pub fn extend(&mut self, ts: u32) -> i64 {
        self.extended = match self.last {
            Some(last) => self.extended + ts.wrapping_sub(last) as i32 as i64,
            None => ts as i64,
        };
        self.last = Some(ts);
        self.extended
    }

    /// Extend `ts` and convert it between clock rates, wrapping back to 32 bits
    pub fn rescale(&mut self, ts: u32, from: u32, to: u32) -> u32 {
        let extended = self.extend(ts);
        if from == 0 || from == to {
            return ts;
        }
        (extended as i128 * to as i128 / from as i128) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let header = RtpHeader {
            marker: true,
            payload_type: 96,
            sequence_number: 0x1234,
            timestamp: 0xDEADBEEF,
            ssrc: 0x01020304,
        };
        let packet = RtpPacket::new(header, Bytes::from_static(&[0xAA]));
        let bytes = packet.to_bytes();

        assert_eq!(
            &bytes[..],
            &[0x80, 0xE0, 0x12, 0x34, 0xDE, 0xAD, 0xBE, 0xEF, 0x01, 0x02, 0x03, 0x04, 0xAA]
        );
        assert_eq!(packet.size(), 13);
    }

    #[test]
    fn test_parse_skips_csrc_and_extension() {
        let data = Bytes::from_static(&[
            0x91, 0x60, 0x00, 0x01, 0x00, 0x00, 0x00, 0x10, 0x00, 0x00, 0x00, 0x05, // header, CC=1, X=1
            0x00, 0x00, 0x00, 0x09, // csrc
            0xBE, 0xDE, 0x00, 0x01, // extension header, 1 word
            0x01, 0x02, 0x03, 0x04, // extension data
            0x65, 0x88, // payload
        ]);
        let packet = RtpPacket::parse(data).unwrap();

        assert!(!packet.header.marker);
        assert_eq!(packet.header.payload_type, 96);
        assert_eq!(packet.header.sequence_number, 1);
        assert_eq!(packet.header.timestamp, 16);
        assert_eq!(packet.header.ssrc, 5);
        assert_eq!(&packet.payload[..], &[0x65, 0x88]);
    }

    #[test]
    fn test_parse_padding() {
        let data = Bytes::from_static(&[
            0xA0, 0x60, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x41, 0x00,
            0x02,
        ]);
        let packet = RtpPacket::parse(data).unwrap();
        assert_eq!(&packet.payload[..], &[0x41]);
    }

    #[test]
    fn test_parse_errors() {
        assert!(RtpPacket::parse(Bytes::from_static(&[0x80, 0x60])).is_err());

        // Version 1
        let v1 = Bytes::from_static(&[0x40, 0x60, 0, 1, 0, 0, 0, 0, 0, 0, 0, 0]);
        assert!(matches!(RtpPacket::parse(v1), Err(Error::InvalidRtp(_))));

        // CSRC count larger than packet
        let csrc = Bytes::from_static(&[0x82, 0x60, 0, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
        assert!(RtpPacket::parse(csrc).is_err());
    }

    #[test]
    fn test_rescale_across_wrap() {
        let mut ext = TimestampExtender::default();
        let start = u32::MAX - 1500;
        let mut previous = ext.rescale(start, 48_000, 90_000);
        for i in 1..4u32 {
            let ts = ext.rescale(start.wrapping_add(i * 1024), 48_000, 90_000);
            // 1024 samples at 48kHz
            assert_eq!(ts.wrapping_sub(previous), 1920);
            previous = ts;
        }
        assert_eq!(ext.extend(start.wrapping_add(4 * 1024)), start as i64 + 4096);
    }

    #[test]
    fn test_extend_steps_backwards() {
        let mut ext = TimestampExtender::default();
        assert_eq!(ext.extend(5), 5);
        assert_eq!(ext.extend(u32::MAX), -1);
        assert_eq!(ext.extend(10), 10);
    }
}
