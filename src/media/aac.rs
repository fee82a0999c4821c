//! AAC audio track
//!
//! The AVCC representation is an FLV audio tag body carrying one raw AAC
//! frame (no ADTS header); the RTP representation is RFC 3640 AAC-hbr with
//! one 16-bit AU header per access unit, all AUs of a frame in one packet.
//!
//! AAC Audio Packet Structure:
//! ```text
//! +----------+----------+----------+----------+---------+
//! |SoundFormat|SoundRate|SoundSize |SoundType | AACType | AACData
//! | (4 bits)  | (2 bits)| (1 bit)  | (1 bit)  | (1 byte)|
//! +----------+----------+----------+----------+---------+
//! ```
//!
//! AACPacketType:
//! - 0: AAC sequence header (AudioSpecificConfig)
//! - 1: AAC raw frame data
//!
//! RFC 3640 payload:
//! ```text
//! | AU-headers-length (16 bits) | AU-size (13) | AU-index (3) | ... | AU data ...
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

use super::flv::AudioFormat;
use super::frame::{AVFrame, MediaKind};
use super::rtp::{RtpHeader, RtpPacket, TimestampExtender};
use super::track::{DecoderConfiguration, RtpMuxer, TrackCodec};

/// FLV sound byte for AAC: 44 kHz, 16-bit, stereo regardless of the actual stream
const AAC_SOUND_BYTE: u8 = 0xAF;

/// AAC packet type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AacPacketType {
    /// Sequence header (AudioSpecificConfig)
    SequenceHeader = 0,
    /// Raw AAC frame data
    Raw = 1,
}

impl AacPacketType {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(AacPacketType::SequenceHeader),
            1 => Some(AacPacketType::Raw),
            _ => None,
        }
    }
}

/// AudioSpecificConfig (from sequence header)
#[derive(Debug, Clone)]
pub struct AudioSpecificConfig {
    /// Audio object type (profile)
    pub audio_object_type: u8,
    /// Sampling frequency index
    pub sampling_frequency_index: u8,
    /// Sampling frequency in Hz
    pub sampling_frequency: u32,
    /// Channel configuration (1=mono, 2=stereo, etc.)
    pub channel_configuration: u8,
    /// Raw config bytes
    pub raw: Bytes,
}

impl AudioSpecificConfig {
    /// Standard sampling frequencies by index
    const SAMPLING_FREQUENCIES: [u32; 16] = [
        96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000, 7350, 0,
        0, 0,
    ];

    /// Parse from AAC sequence header data
    pub fn parse(data: Bytes) -> Result<Self> {
        if data.len() < 2 {
            return Err(Error::InvalidMedia("short AudioSpecificConfig"));
        }

        // audioObjectType: 5 bits
        // samplingFrequencyIndex: 4 bits
        // if (samplingFrequencyIndex == 0xf) samplingFrequency: 24 bits
        // channelConfiguration: 4 bits
        let b0 = data[0];
        let b1 = data[1];

        let audio_object_type = (b0 >> 3) & 0x1F;
        let sampling_frequency_index = ((b0 & 0x07) << 1) | ((b1 >> 7) & 0x01);

        let (sampling_frequency, channel_configuration) = if sampling_frequency_index == 0x0F {
            if data.len() < 5 {
                return Err(Error::InvalidMedia("short explicit sampling frequency"));
            }
            let f0 = (data[1] & 0x7F) as u32;
            let f1 = data[2] as u32;
            let f2 = data[3] as u32;
            let f3 = (data[4] >> 7) as u32;
            let channels = (data[4] >> 3) & 0x0F;
            ((f0 << 17) | (f1 << 9) | (f2 << 1) | f3, channels)
        } else {
            let freq = Self::SAMPLING_FREQUENCIES[sampling_frequency_index as usize];
            if freq == 0 {
                return Err(Error::InvalidMedia("reserved sampling frequency index"));
            }
            (freq, (b1 >> 3) & 0x0F)
        };

        Ok(AudioSpecificConfig {
            audio_object_type,
            sampling_frequency_index,
            sampling_frequency,
            channel_configuration,
            raw: data,
        })
    }

    /// Get channel count
    pub fn channels(&self) -> u8 {
        match self.channel_configuration {
            1..=6 => self.channel_configuration,
            7 => 8,
            _ => 0,
        }
    }
}

/// Largest AU the 13-bit AU-size field can describe
pub const MAX_AU_SIZE: usize = 0x1FFF;

/// Build one RFC 3640 payload carrying every access unit of a frame
pub fn packetize_aus(aus: &[Bytes]) -> Result<Bytes> {
    let header_bits = aus.len() * 16;
    if header_bits > u16::MAX as usize {
        return Err(Error::InvalidMedia("too many AUs for one packet"));
    }
    let data_len: usize = aus.iter().map(Bytes::len).sum();

    let mut payload = BytesMut::with_capacity(2 + aus.len() * 2 + data_len);
    payload.put_u16(header_bits as u16);
    for au in aus {
        if au.len() > MAX_AU_SIZE {
            return Err(Error::InvalidMedia("AU larger than 8191 bytes"));
        }
        // AU-index and AU-index-delta are always zero
        payload.put_u16((au.len() as u16) << 3);
    }
    for au in aus {
        payload.extend_from_slice(au);
    }
    Ok(payload.freeze())
}

/// Split an RFC 3640 payload into its access units
pub fn depacketize_aus(mut payload: Bytes) -> Result<Vec<Bytes>> {
    if payload.len() < 2 {
        return Err(Error::InvalidMedia("short AU header section"));
    }
    let header_bits = payload.get_u16() as usize;
    let header_bytes = header_bits.div_ceil(8);
    if payload.len() < header_bytes {
        return Err(Error::InvalidMedia("truncated AU headers"));
    }
    let mut headers = payload.split_to(header_bytes);

    let mut aus = Vec::with_capacity(header_bits / 16);
    for _ in 0..header_bits / 16 {
        let size = (headers.get_u16() >> 3) as usize;
        if payload.len() < size {
            return Err(Error::InvalidMedia("truncated AU"));
        }
        aus.push(payload.split_to(size));
    }
    Ok(aus)
}

/// AAC strategy for [`Media`](super::track::Media)
#[derive(Debug, Clone, Default)]
pub struct AacCodec {
    config: Option<AudioSpecificConfig>,
    rtp_timeline: TimestampExtender,
}

impl AacCodec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(&self) -> Option<&AudioSpecificConfig> {
        self.config.as_ref()
    }

    /// Raw AAC payloads of a frame: raw slices first, else the AVCC body
    fn frame_aus(frame: &AVFrame) -> Result<Vec<Bytes>> {
        if !frame.raw.is_empty() {
            return Ok(frame.raw.clone());
        }
        let avcc = frame.avcc_bytes();
        if avcc.len() < 2 || AacPacketType::from_byte(avcc[1]) != Some(AacPacketType::Raw) {
            return Err(Error::InvalidMedia("no raw AAC data"));
        }
        Ok(vec![avcc.slice(2..)])
    }
}

impl TrackCodec for AacCodec {
    const KIND: MediaKind = MediaKind::Audio;

    fn name(&self) -> &'static str {
        "aac"
    }

    fn is_sequence_header(&self, avcc: &[u8]) -> bool {
        avcc.len() >= 2
            && AudioFormat::from_byte(avcc[0]) == AudioFormat::Aac
            && avcc[1] == AacPacketType::SequenceHeader as u8
    }

    fn config_from_avcc(&mut self, avcc: &Bytes) -> Result<Vec<Bytes>> {
        if avcc.len() < 2 {
            return Err(Error::InvalidMedia("short sequence header"));
        }
        let config = AudioSpecificConfig::parse(avcc.slice(2..))?;
        let raw = vec![config.raw.clone()];
        self.config = Some(config);
        Ok(raw)
    }

    fn config_from_raw(&mut self, raw: &[Bytes]) -> Result<Bytes> {
        let asc = raw.first().ok_or(Error::InvalidMedia("no AudioSpecificConfig"))?;
        let config = AudioSpecificConfig::parse(asc.clone())?;

        let mut avcc = BytesMut::with_capacity(asc.len() + 2);
        avcc.put_u8(AAC_SOUND_BYTE);
        avcc.put_u8(AacPacketType::SequenceHeader as u8);
        avcc.extend_from_slice(asc);
        self.config = Some(config);
        Ok(avcc.freeze())
    }

    fn clock_rate(&self) -> Option<u32> {
        self.config.as_ref().map(|c| c.sampling_frequency)
    }

    fn stamp_avcc(&mut self, frame: &mut AVFrame, abs_time: u32) {
        frame.dts = abs_time.wrapping_mul(90);
        frame.pts = frame.dts;
    }

    fn stamp_rtp(&mut self, frame: &mut AVFrame, header: &RtpHeader, clock_rate: u32) {
        let ts = self
            .rtp_timeline
            .rescale(header.timestamp, clock_rate, 90_000);
        frame.pts = ts;
        frame.dts = ts;
    }

    fn ends_frame(&self, _packet: &RtpPacket) -> bool {
        true
    }

    fn write_slice(&mut self, frame: &mut AVFrame, slice: Bytes) {
        frame.append_raw(slice);
    }

    fn complete_rtp(
        &mut self,
        frame: &mut AVFrame,
        muxer: &mut RtpMuxer,
        _config: &DecoderConfiguration,
    ) -> Result<()> {
        let payload = packetize_aus(&Self::frame_aus(frame)?)?;
        let timestamp = muxer.rescale(frame.pts);
        frame.append_rtp(muxer.packet(true, timestamp, payload));
        Ok(())
    }

    fn complete_avcc(&mut self, frame: &mut AVFrame) -> Result<()> {
        let aus = if frame.raw.is_empty() {
            let mut aus = Vec::new();
            for packet in &frame.rtp {
                aus.extend(depacketize_aus(packet.payload.clone())?);
            }
            aus
        } else {
            frame.raw.clone()
        };
        if aus.is_empty() {
            return Err(Error::InvalidMedia("no access units"));
        }

        frame.append_avcc(Bytes::from_static(&[AAC_SOUND_BYTE, AacPacketType::Raw as u8]));
        for au in aus {
            frame.append_avcc(au);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn muxer(rate: u32) -> RtpMuxer {
        RtpMuxer::new(0xABCD, 97, rate)
    }

    #[test]
    fn test_aac_packet_type() {
        assert_eq!(AacPacketType::from_byte(0), Some(AacPacketType::SequenceHeader));
        assert_eq!(AacPacketType::from_byte(1), Some(AacPacketType::Raw));
        assert_eq!(AacPacketType::from_byte(2), None);
    }

    #[test]
    fn test_audio_specific_config_parse() {
        // AAC-LC, 44100Hz, stereo
        let config = AudioSpecificConfig::parse(Bytes::from_static(&[0x12, 0x10])).unwrap();
        assert_eq!(config.audio_object_type, 2);
        assert_eq!(config.sampling_frequency_index, 4);
        assert_eq!(config.sampling_frequency, 44100);
        assert_eq!(config.channels(), 2);

        // AAC-LC, 48000Hz, mono
        let config = AudioSpecificConfig::parse(Bytes::from_static(&[0x11, 0x88])).unwrap();
        assert_eq!(config.sampling_frequency, 48000);
        assert_eq!(config.channels(), 1);
    }

    #[test]
    fn test_audio_specific_config_explicit_frequency() {
        // index 15, frequency 22050 (0x005622) written in 24 bits, stereo
        let freq: u32 = 22050;
        let b0 = (2 << 3) | 0x07;
        let b1 = 0x80 | ((freq >> 17) as u8 & 0x7F);
        let b2 = (freq >> 9) as u8;
        let b3 = (freq >> 1) as u8;
        let b4 = (((freq & 1) as u8) << 7) | (2 << 3);
        let config = AudioSpecificConfig::parse(Bytes::from(vec![b0, b1, b2, b3, b4])).unwrap();

        assert_eq!(config.sampling_frequency_index, 15);
        assert_eq!(config.sampling_frequency, 22050);
        assert_eq!(config.channels(), 2);
    }

    #[test]
    fn test_audio_specific_config_invalid() {
        assert!(AudioSpecificConfig::parse(Bytes::from_static(&[0x12])).is_err());
        // Reserved index 13
        assert!(AudioSpecificConfig::parse(Bytes::from_static(&[0x16, 0x90])).is_err());
        // Explicit frequency but short
        assert!(AudioSpecificConfig::parse(Bytes::from_static(&[0x17, 0x80, 0x00])).is_err());
    }

    #[test]
    fn test_sequence_header_and_clock_rate() {
        let mut codec = AacCodec::new();
        let header = Bytes::from_static(&[0xAF, 0x00, 0x11, 0x90]);
        assert!(codec.is_sequence_header(&header));
        assert!(!codec.is_sequence_header(&[0xAF, 0x01, 0x21]));
        // MP3 sound format
        assert!(!codec.is_sequence_header(&[0x2F, 0x00]));

        assert_eq!(codec.clock_rate(), None);
        let raw = codec.config_from_avcc(&header).unwrap();
        assert_eq!(&raw[0][..], &[0x11, 0x90]);
        assert_eq!(codec.clock_rate(), Some(48000));

        let avcc = codec.config_from_raw(&raw).unwrap();
        assert_eq!(avcc, header);
    }

    #[test]
    fn test_au_payload_layout() {
        let payload = packetize_aus(&[Bytes::from_static(&[1, 2, 3, 4, 5])]).unwrap();
        assert_eq!(&payload[..4], &[0x00, 0x10, 0x00, 5 << 3]);

        let aus = depacketize_aus(payload).unwrap();
        assert_eq!(aus.len(), 1);
        assert_eq!(&aus[0][..], &[1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_packetize_aggregates_aus() {
        let aus = [Bytes::from_static(&[0xA, 0xB]), Bytes::from_static(&[0xC])];
        let payload = packetize_aus(&aus).unwrap();
        assert_eq!(&payload[..], &[0x00, 0x20, 0x00, 0x10, 0x00, 0x08, 0xA, 0xB, 0xC]);
    }

    #[test]
    fn test_packetize_rejects_oversized_au() {
        let largest = Bytes::from(vec![0u8; MAX_AU_SIZE]);
        let payload = packetize_aus(&[largest]).unwrap();
        assert_eq!(&payload[2..4], &[0xFF, 0xF8]);

        // 8192 bytes would wrap the 13-bit size to zero
        let oversized = Bytes::from(vec![0u8; MAX_AU_SIZE + 1]);
        assert!(matches!(
            packetize_aus(&[oversized]),
            Err(Error::InvalidMedia(_))
        ));
    }

    #[test]
    fn test_depacketize_multiple_aus() {
        let payload = Bytes::from_static(&[0x00, 0x20, 0x00, 0x10, 0x00, 0x08, 0xA, 0xB, 0xC]);
        let aus = depacketize_aus(payload).unwrap();
        assert_eq!(aus.len(), 2);
        assert_eq!(&aus[0][..], &[0xA, 0xB]);
        assert_eq!(&aus[1][..], &[0xC]);

        let truncated = Bytes::from_static(&[0x00, 0x10, 0x00, 0x40, 0x01]);
        assert!(depacketize_aus(truncated).is_err());
    }

    #[test]
    fn test_complete_rtp_from_avcc() {
        let mut codec = AacCodec::new();
        let mut muxer = muxer(48_000);
        let mut frame = AVFrame::new();
        frame.append_avcc(Bytes::from_static(&[0xAF, 0x01, 0x21, 0x10]));
        codec.stamp_avcc(&mut frame, 1000);

        codec
            .complete_rtp(&mut frame, &mut muxer, &DecoderConfiguration::default())
            .unwrap();

        assert_eq!(frame.rtp.len(), 1);
        let packet = &frame.rtp[0];
        assert!(packet.header.marker);
        assert_eq!(packet.header.timestamp, 48_000);
        assert_eq!(&packet.payload[4..], &[0x21, 0x10]);
    }

    #[test]
    fn test_complete_avcc_from_rtp() {
        let mut codec = AacCodec::new();
        let mut muxer = muxer(48_000);
        let mut frame = AVFrame::new();
        let payload = packetize_aus(&[Bytes::from_static(&[0x21, 0x10, 0x04])]).unwrap();
        let packet = muxer.packet(true, 96_000, payload);
        codec.stamp_rtp(&mut frame, &packet.header, 48_000);
        frame.append_rtp(packet);

        // 2 seconds in 90kHz
        assert_eq!(frame.dts, 180_000);

        codec.complete_avcc(&mut frame).unwrap();
        assert_eq!(&frame.avcc_bytes()[..], &[0xAF, 0x01, 0x21, 0x10, 0x04]);
    }

    #[test]
    fn test_complete_rtp_single_packet_for_all_aus() {
        let mut codec = AacCodec::new();
        let mut muxer = muxer(48_000);
        let mut frame = AVFrame::new();
        frame.append_raw(Bytes::from_static(&[0x21, 0x10]));
        frame.append_raw(Bytes::from_static(&[0x21, 0x20, 0x30]));

        codec
            .complete_rtp(&mut frame, &mut muxer, &DecoderConfiguration::default())
            .unwrap();

        assert_eq!(frame.rtp.len(), 1);
        assert!(frame.rtp[0].header.marker);
        let aus = depacketize_aus(frame.rtp[0].payload.clone()).unwrap();
        assert_eq!(aus, frame.raw);
    }

    #[test]
    fn test_stamp_rtp_across_wrap() {
        let mut codec = AacCodec::new();
        let mut muxer = muxer(48_000);
        let start = u32::MAX - 1500;

        let mut dts = Vec::new();
        for i in 0..4u32 {
            let mut frame = AVFrame::new();
            let packet = muxer.packet(true, start.wrapping_add(i * 1024), Bytes::new());
            codec.stamp_rtp(&mut frame, &packet.header, 48_000);
            dts.push(frame.dts);
        }

        // 1024 samples at 48kHz is 1920 ticks at 90kHz, wrap or not
        for pair in dts.windows(2) {
            assert_eq!(pair[1].wrapping_sub(pair[0]), 1920);
        }
    }

    #[test]
    fn test_raw_avcc_required_for_rtp() {
        let mut codec = AacCodec::new();
        let mut frame = AVFrame::new();
        frame.append_avcc(Bytes::from_static(&[0xAF, 0x00, 0x12, 0x10]));
        let result = codec.complete_rtp(&mut frame, &mut muxer(44_100), &DecoderConfiguration::default());
        assert!(result.is_err());
    }
}
