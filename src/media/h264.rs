//! H.264/AVC video track
//!
//! The AVCC representation is an FLV video tag body carrying length-prefixed
//! NAL units; the RTP representation follows RFC 6184 (single NAL unit,
//! STAP-A and FU-A packets).
//!
//! AVC Video Packet Structure:
//! ```text
//! +----------+----------+-----------------+
//! |FrameType | CodecID  | AVCPacketType   | CompositionTime | Data
//! | (4 bits) | (4 bits) | (1 byte)        | (3 bytes, SI24) |
//! +----------+----------+-----------------+
//! ```
//!
//! AVCPacketType:
//! - 0: AVC sequence header (AVCDecoderConfigurationRecord)
//! - 1: AVC NALU (one or more NALUs)
//! - 2: AVC end of sequence
//!
//! AVCDecoderConfigurationRecord (sequence header):
//! ```text
//! configurationVersion (1) | AVCProfileIndication (1) | profile_compatibility (1)
//! | AVCLevelIndication (1) | lengthSizeMinusOne (1, lower 2 bits)
//! | numOfSPS (1, lower 5 bits) | { spsLength (2) | spsNALUnit }*
//! | numOfPPS (1) | { ppsLength (2) | ppsNALUnit }*
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

use super::flv::VideoFrameType;
use super::frame::{AVFrame, MediaKind};
use super::rtp::{RtpHeader, RtpPacket, RTP_MAX_PAYLOAD};
use super::track::{DecoderConfiguration, RtpMuxer, TrackCodec};

/// FLV codec id for AVC
const CODEC_ID_AVC: u8 = 7;

/// Size of the FLV video tag body header
const VIDEO_TAG_HEADER_SIZE: usize = 5;

/// RTP aggregation packet (RFC 6184 §5.7.1)
const NALU_STAP_A: u8 = 24;

/// RTP fragmentation unit (RFC 6184 §5.8)
const NALU_FU_A: u8 = 28;

/// AVC packet type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AvcPacketType {
    /// Sequence header (AVCDecoderConfigurationRecord)
    SequenceHeader = 0,
    /// NAL units
    Nalu = 1,
    /// End of sequence
    EndOfSequence = 2,
}

impl AvcPacketType {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(AvcPacketType::SequenceHeader),
            1 => Some(AvcPacketType::Nalu),
            2 => Some(AvcPacketType::EndOfSequence),
            _ => None,
        }
    }
}

/// NAL unit type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NaluType {
    /// Non-IDR slice
    Slice = 1,
    /// IDR slice (keyframe)
    Idr = 5,
    /// Supplemental enhancement information
    Sei = 6,
    /// Sequence parameter set
    Sps = 7,
    /// Picture parameter set
    Pps = 8,
    /// Access unit delimiter
    Aud = 9,
}

impl NaluType {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b & 0x1F {
            1 => Some(NaluType::Slice),
            5 => Some(NaluType::Idr),
            6 => Some(NaluType::Sei),
            7 => Some(NaluType::Sps),
            8 => Some(NaluType::Pps),
            9 => Some(NaluType::Aud),
            _ => None,
        }
    }

    pub fn is_keyframe(&self) -> bool {
        matches!(self, NaluType::Idr)
    }

    pub fn is_parameter_set(&self) -> bool {
        matches!(self, NaluType::Sps | NaluType::Pps)
    }
}

/// AVC decoder configuration (from sequence header)
#[derive(Debug, Clone)]
pub struct AvcConfig {
    /// AVC profile (66=Baseline, 77=Main, 100=High, etc.)
    pub profile: u8,
    /// Profile compatibility flags
    pub compatibility: u8,
    /// AVC level (e.g., 31 = 3.1)
    pub level: u8,
    /// NALU length size in bytes (usually 4)
    pub nalu_length_size: u8,
    /// Sequence Parameter Sets
    pub sps: Vec<Bytes>,
    /// Picture Parameter Sets
    pub pps: Vec<Bytes>,
}

impl AvcConfig {
    /// Parse from AVCDecoderConfigurationRecord
    pub fn parse(mut data: Bytes) -> Result<Self> {
        if data.len() < 7 {
            return Err(Error::InvalidMedia("short AVC configuration record"));
        }

        let version = data.get_u8();
        if version != 1 {
            return Err(Error::InvalidMedia("unsupported AVC configuration version"));
        }

        let profile = data.get_u8();
        let compatibility = data.get_u8();
        let level = data.get_u8();
        let nalu_length_size = (data.get_u8() & 0x03) + 1;

        let num_sps = (data.get_u8() & 0x1F) as usize;
        let sps = read_parameter_sets(&mut data, num_sps)?;

        if data.is_empty() {
            return Err(Error::InvalidMedia("missing PPS count"));
        }
        let num_pps = data.get_u8() as usize;
        let pps = read_parameter_sets(&mut data, num_pps)?;

        Ok(AvcConfig {
            profile,
            compatibility,
            level,
            nalu_length_size,
            sps,
            pps,
        })
    }

    /// Build from raw SPS/PPS NAL units (4-byte NALU lengths)
    pub fn from_parameter_sets(sps: Vec<Bytes>, pps: Vec<Bytes>) -> Result<Self> {
        let first = sps.first().ok_or(Error::InvalidMedia("no SPS"))?;
        if first.len() < 4 || pps.is_empty() {
            return Err(Error::InvalidMedia("incomplete parameter sets"));
        }
        Ok(AvcConfig {
            profile: first[1],
            compatibility: first[2],
            level: first[3],
            nalu_length_size: 4,
            sps,
            pps,
        })
    }

    /// Serialize as AVCDecoderConfigurationRecord
    pub fn to_record(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(1);
        buf.put_u8(self.profile);
        buf.put_u8(self.compatibility);
        buf.put_u8(self.level);
        buf.put_u8(0xFC | (self.nalu_length_size.saturating_sub(1) & 0x03));
        buf.put_u8(0xE0 | (self.sps.len() as u8 & 0x1F));
        for sps in &self.sps {
            buf.put_u16(sps.len() as u16);
            buf.extend_from_slice(sps);
        }
        buf.put_u8(self.pps.len() as u8);
        for pps in &self.pps {
            buf.put_u16(pps.len() as u16);
            buf.extend_from_slice(pps);
        }
        buf.freeze()
    }

    /// Get profile name
    pub fn profile_name(&self) -> &'static str {
        match self.profile {
            66 => "Baseline",
            77 => "Main",
            88 => "Extended",
            100 => "High",
            110 => "High 10",
            122 => "High 4:2:2",
            244 => "High 4:4:4",
            _ => "Unknown",
        }
    }
}

fn read_parameter_sets(data: &mut Bytes, count: usize) -> Result<Vec<Bytes>> {
    let mut sets = Vec::with_capacity(count);
    for _ in 0..count {
        if data.len() < 2 {
            return Err(Error::InvalidMedia("truncated parameter set length"));
        }
        let len = data.get_u16() as usize;
        if data.len() < len {
            return Err(Error::InvalidMedia("truncated parameter set"));
        }
        sets.push(data.copy_to_bytes(len));
    }
    Ok(sets)
}

/// Parsed FLV video tag body header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoTagHeader {
    pub keyframe: bool,
    pub packet_type: AvcPacketType,
    /// Composition time offset in milliseconds
    pub composition_time: i32,
}

impl VideoTagHeader {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < VIDEO_TAG_HEADER_SIZE {
            return Err(Error::InvalidMedia("short video tag"));
        }
        let keyframe = VideoFrameType::from_byte(data[0])
            .map(|ft| ft.is_keyframe())
            .unwrap_or(false);
        let packet_type =
            AvcPacketType::from_byte(data[1]).ok_or(Error::InvalidMedia("bad AVC packet type"))?;

        // Signed 24-bit
        let ct = ((data[2] as i32) << 16) | ((data[3] as i32) << 8) | data[4] as i32;
        let composition_time = if ct & 0x80_0000 != 0 {
            ct | !0xFF_FFFF
        } else {
            ct
        };

        Ok(Self {
            keyframe,
            packet_type,
            composition_time,
        })
    }

    fn write(&self, buf: &mut BytesMut) {
        let frame_type = if self.keyframe { 1 } else { 2 };
        buf.put_u8((frame_type << 4) | CODEC_ID_AVC);
        buf.put_u8(self.packet_type as u8);
        let ct = self.composition_time as u32;
        buf.put_u8((ct >> 16) as u8);
        buf.put_u8((ct >> 8) as u8);
        buf.put_u8(ct as u8);
    }
}

/// Iterator over NAL units in AVCC format
pub struct NaluIterator<'a> {
    data: &'a [u8],
    offset: usize,
    nalu_length_size: usize,
}

impl<'a> NaluIterator<'a> {
    pub fn new(data: &'a [u8], nalu_length_size: u8) -> Self {
        Self {
            data,
            offset: 0,
            nalu_length_size: nalu_length_size as usize,
        }
    }
}

impl<'a> Iterator for NaluIterator<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset + self.nalu_length_size > self.data.len() {
            return None;
        }

        // Read length (big-endian)
        let mut len: usize = 0;
        for i in 0..self.nalu_length_size {
            len = (len << 8) | (self.data[self.offset + i] as usize);
        }
        self.offset += self.nalu_length_size;

        if self.offset + len > self.data.len() {
            return None;
        }

        let nalu = &self.data[self.offset..self.offset + len];
        self.offset += len;
        Some(nalu)
    }
}

/// Split one NAL unit into RTP payloads (single NAL unit or FU-A)
pub fn packetize_nalu(nalu: &Bytes, mtu: usize) -> Vec<Bytes> {
    if nalu.len() <= mtu {
        return vec![nalu.clone()];
    }

    let header = nalu[0];
    let indicator = (header & 0xE0) | NALU_FU_A;
    let body = nalu.slice(1..);
    let chunk_size = mtu.saturating_sub(2).max(1);
    let count = body.len().div_ceil(chunk_size);

    body.chunks(chunk_size)
        .enumerate()
        .map(|(i, chunk)| {
            let mut fu_header = header & 0x1F;
            if i == 0 {
                fu_header |= 0x80;
            }
            if i + 1 == count {
                fu_header |= 0x40;
            }
            let mut payload = BytesMut::with_capacity(chunk.len() + 2);
            payload.put_u8(indicator);
            payload.put_u8(fu_header);
            payload.extend_from_slice(chunk);
            payload.freeze()
        })
        .collect()
}

/// Reassemble NAL units from RTP payloads
pub fn depacketize(packets: &[RtpPacket]) -> Result<Vec<Bytes>> {
    let mut nalus = Vec::new();
    let mut fragment: Option<BytesMut> = None;

    for packet in packets {
        let payload = &packet.payload;
        let Some(&first) = payload.first() else {
            continue;
        };

        match first & 0x1F {
            1..=23 => nalus.push(payload.clone()),
            NALU_STAP_A => {
                let mut rest = payload.slice(1..);
                while rest.len() >= 2 {
                    let len = rest.get_u16() as usize;
                    if rest.len() < len {
                        return Err(Error::InvalidMedia("truncated STAP-A unit"));
                    }
                    nalus.push(rest.split_to(len));
                }
            }
            NALU_FU_A => {
                if payload.len() < 2 {
                    return Err(Error::InvalidMedia("short FU-A"));
                }
                let fu_header = payload[1];
                if fu_header & 0x80 != 0 {
                    let mut buf = BytesMut::with_capacity(payload.len() * 4);
                    buf.put_u8((first & 0xE0) | (fu_header & 0x1F));
                    fragment = Some(buf);
                }
                // A fragment without its start packet is dropped
                if let Some(buf) = fragment.as_mut() {
                    buf.extend_from_slice(&payload[2..]);
                }
                if fu_header & 0x40 != 0 {
                    if let Some(buf) = fragment.take() {
                        nalus.push(buf.freeze());
                    }
                }
            }
            _ => return Err(Error::InvalidMedia("unsupported RTP NAL unit type")),
        }
    }

    Ok(nalus)
}

/// H.264 strategy for [`Media`](super::track::Media)
#[derive(Debug, Clone)]
pub struct H264Codec {
    nalu_length_size: u8,
    mtu: usize,
    in_band: Option<(Vec<Bytes>, Vec<Bytes>)>,
    config_update: Option<Vec<Bytes>>,
}

impl Default for H264Codec {
    fn default() -> Self {
        Self {
            nalu_length_size: 4,
            mtu: RTP_MAX_PAYLOAD,
            in_band: None,
            config_update: None,
        }
    }
}

impl H264Codec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the RTP payload budget
    pub fn with_mtu(mut self, mtu: usize) -> Self {
        self.mtu = mtu.max(3);
        self
    }

    /// NAL units of a frame: raw slices first, else the AVCC payload
    fn frame_nalus(&self, frame: &AVFrame) -> Result<Vec<Bytes>> {
        if !frame.raw.is_empty() {
            return Ok(frame.raw.clone());
        }
        let avcc = frame.avcc_bytes();
        if avcc.len() < VIDEO_TAG_HEADER_SIZE {
            return Err(Error::InvalidMedia("no NAL units"));
        }
        let body = avcc.slice(VIDEO_TAG_HEADER_SIZE..);
        let nalus = NaluIterator::new(&body, self.nalu_length_size)
            .map(|nalu| body.slice_ref(nalu))
            .collect();
        Ok(nalus)
    }

    fn remember_parameter_set(&mut self, nalu: &Bytes) {
        let (sps, pps) = self.in_band.get_or_insert_with(Default::default);
        match NaluType::from_byte(nalu[0]) {
            Some(NaluType::Sps) if sps.first() != Some(nalu) => {
                *sps = vec![nalu.clone()];
            }
            Some(NaluType::Pps) if pps.first() != Some(nalu) => {
                *pps = vec![nalu.clone()];
            }
            _ => return,
        }
        if !sps.is_empty() && !pps.is_empty() {
            self.config_update = Some(sps.iter().chain(pps.iter()).cloned().collect());
        }
    }
}

impl TrackCodec for H264Codec {
    const KIND: MediaKind = MediaKind::Video;

    fn name(&self) -> &'static str {
        "h264"
    }

    fn is_sequence_header(&self, avcc: &[u8]) -> bool {
        avcc.len() >= 2 && avcc[0] & 0x0F == CODEC_ID_AVC && avcc[1] == 0
    }

    fn config_from_avcc(&mut self, avcc: &Bytes) -> Result<Vec<Bytes>> {
        if avcc.len() < VIDEO_TAG_HEADER_SIZE {
            return Err(Error::InvalidMedia("short sequence header"));
        }
        let config = AvcConfig::parse(avcc.slice(VIDEO_TAG_HEADER_SIZE..))?;
        self.nalu_length_size = config.nalu_length_size;
        Ok(config.sps.into_iter().chain(config.pps).collect())
    }

    fn config_from_raw(&mut self, raw: &[Bytes]) -> Result<Bytes> {
        let (sps, pps): (Vec<Bytes>, Vec<Bytes>) = raw
            .iter()
            .filter(|nalu| !nalu.is_empty())
            .cloned()
            .partition(|nalu| NaluType::from_byte(nalu[0]) == Some(NaluType::Sps));
        let config = AvcConfig::from_parameter_sets(sps, pps)?;

        let mut buf = BytesMut::new();
        VideoTagHeader {
            keyframe: true,
            packet_type: AvcPacketType::SequenceHeader,
            composition_time: 0,
        }
        .write(&mut buf);
        buf.extend_from_slice(&config.to_record());
        Ok(buf.freeze())
    }

    fn stamp_avcc(&mut self, frame: &mut AVFrame, abs_time: u32) {
        frame.dts = abs_time.wrapping_mul(90);
        frame.pts = frame.dts;
        let Some(first) = frame.avcc.first() else {
            return;
        };
        if let Ok(header) = VideoTagHeader::parse(first) {
            frame.keyframe = header.keyframe;
            frame.pts = frame
                .dts
                .wrapping_add((header.composition_time as u32).wrapping_mul(90));
        }
    }

    fn stamp_rtp(&mut self, frame: &mut AVFrame, header: &RtpHeader, _clock_rate: u32) {
        frame.pts = header.timestamp;
        frame.dts = header.timestamp;
    }

    fn ends_frame(&self, packet: &RtpPacket) -> bool {
        packet.header.marker
    }

    fn write_slice(&mut self, frame: &mut AVFrame, slice: Bytes) {
        if let Some(t) = slice.first().and_then(|b| NaluType::from_byte(*b)) {
            if t.is_keyframe() {
                frame.keyframe = true;
            }
        }
        frame.append_raw(slice);
    }

    fn complete_rtp(
        &mut self,
        frame: &mut AVFrame,
        muxer: &mut RtpMuxer,
        config: &DecoderConfiguration,
    ) -> Result<()> {
        let mut nalus = self.frame_nalus(frame)?;
        if nalus.is_empty() {
            return Err(Error::InvalidMedia("no NAL units"));
        }
        // Keyframes carry their parameter sets so RTP receivers can join
        if frame.keyframe && !config.raw.is_empty() {
            let has_sps = nalus
                .iter()
                .any(|n| n.first().and_then(|b| NaluType::from_byte(*b)) == Some(NaluType::Sps));
            if !has_sps {
                nalus.splice(0..0, config.raw.iter().cloned());
            }
        }

        let payloads: Vec<Bytes> = nalus
            .iter()
            .filter(|nalu| !nalu.is_empty())
            .flat_map(|nalu| packetize_nalu(nalu, self.mtu))
            .collect();
        let last = payloads.len().saturating_sub(1);
        let timestamp = muxer.rescale(frame.pts);
        for (i, payload) in payloads.into_iter().enumerate() {
            let packet = muxer.packet(i == last, timestamp, payload);
            frame.append_rtp(packet);
        }
        Ok(())
    }

    fn complete_avcc(&mut self, frame: &mut AVFrame) -> Result<()> {
        let nalus = if frame.raw.is_empty() {
            depacketize(&frame.rtp)?
        } else {
            frame.raw.clone()
        };

        let mut body = BytesMut::new();
        let mut keyframe = frame.keyframe;
        for nalu in nalus.iter().filter(|n| !n.is_empty()) {
            match NaluType::from_byte(nalu[0]) {
                Some(t) if t.is_parameter_set() => {
                    self.remember_parameter_set(nalu);
                    continue;
                }
                Some(NaluType::Aud) => continue,
                Some(t) if t.is_keyframe() => keyframe = true,
                _ => {}
            }
            body.put_u32(nalu.len() as u32);
            body.extend_from_slice(nalu);
        }
        if body.is_empty() {
            return Err(Error::InvalidMedia("no slice NAL units"));
        }

        let mut header = BytesMut::with_capacity(VIDEO_TAG_HEADER_SIZE);
        VideoTagHeader {
            keyframe,
            packet_type: AvcPacketType::Nalu,
            composition_time: frame.cts_ms() as i32,
        }
        .write(&mut header);

        frame.keyframe = keyframe;
        frame.append_avcc(header.freeze());
        frame.append_avcc(body.freeze());
        Ok(())
    }

    fn take_config_update(&mut self) -> Option<Vec<Bytes>> {
        self.config_update.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPS: &[u8] = &[0x67, 0x64, 0x00, 0x1F, 0xAC];
    const PPS: &[u8] = &[0x68, 0xEE, 0x3C, 0x80];

    fn sequence_header() -> Bytes {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0x17, 0x00, 0x00, 0x00, 0x00]);
        buf.extend_from_slice(&[0x01, 0x64, 0x00, 0x1F, 0xFF, 0xE1]);
        buf.put_u16(SPS.len() as u16);
        buf.extend_from_slice(SPS);
        buf.put_u8(1);
        buf.put_u16(PPS.len() as u16);
        buf.extend_from_slice(PPS);
        buf.freeze()
    }

    fn avcc_frame(keyframe: bool, cts: u32, nalus: &[&[u8]]) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(if keyframe { 0x17 } else { 0x27 });
        buf.put_u8(0x01);
        buf.put_u8((cts >> 16) as u8);
        buf.put_u8((cts >> 8) as u8);
        buf.put_u8(cts as u8);
        for nalu in nalus {
            buf.put_u32(nalu.len() as u32);
            buf.extend_from_slice(nalu);
        }
        buf.freeze()
    }

    fn muxer() -> RtpMuxer {
        RtpMuxer::new(0x1234, 96, 90_000)
    }

    #[test]
    fn test_nalu_type() {
        assert_eq!(NaluType::from_byte(0x65), Some(NaluType::Idr));
        assert_eq!(NaluType::from_byte(0x41), Some(NaluType::Slice));
        assert_eq!(NaluType::from_byte(0x67), Some(NaluType::Sps));
        assert_eq!(NaluType::from_byte(0x68), Some(NaluType::Pps));
        assert!(NaluType::Idr.is_keyframe());
        assert!(!NaluType::Slice.is_keyframe());
        assert!(NaluType::Sps.is_parameter_set());
        assert!(!NaluType::Sei.is_parameter_set());
    }

    #[test]
    fn test_avc_packet_type() {
        assert_eq!(AvcPacketType::from_byte(0), Some(AvcPacketType::SequenceHeader));
        assert_eq!(AvcPacketType::from_byte(1), Some(AvcPacketType::Nalu));
        assert_eq!(AvcPacketType::from_byte(2), Some(AvcPacketType::EndOfSequence));
        assert_eq!(AvcPacketType::from_byte(3), None);
    }

    #[test]
    fn test_avc_config_parse() {
        let config = AvcConfig::parse(sequence_header().slice(5..)).unwrap();
        assert_eq!(config.profile, 0x64);
        assert_eq!(config.profile_name(), "High");
        assert_eq!(config.level, 0x1F);
        assert_eq!(config.nalu_length_size, 4);
        assert_eq!(&config.sps[0][..], SPS);
        assert_eq!(&config.pps[0][..], PPS);

        // Serializing gives back the same record
        assert_eq!(config.to_record(), sequence_header().slice(5..));
    }

    #[test]
    fn test_avc_config_invalid() {
        assert!(AvcConfig::parse(Bytes::from_static(&[0x01, 0x64])).is_err());
        assert!(AvcConfig::parse(Bytes::from_static(&[0x02, 0x64, 0, 0x1F, 0xFF, 0xE0, 0])).is_err());
        // SPS length larger than data
        assert!(AvcConfig::parse(Bytes::from_static(&[0x01, 0x64, 0, 0x1F, 0xFF, 0xE1, 0, 9, 0x67])).is_err());
    }

    #[test]
    fn test_video_tag_header() {
        let header = VideoTagHeader::parse(&[0x17, 0x01, 0x00, 0x00, 0x50]).unwrap();
        assert!(header.keyframe);
        assert_eq!(header.packet_type, AvcPacketType::Nalu);
        assert_eq!(header.composition_time, 80);

        // Negative composition time
        let header = VideoTagHeader::parse(&[0x27, 0x01, 0xFF, 0xFF, 0xFE]).unwrap();
        assert!(!header.keyframe);
        assert_eq!(header.composition_time, -2);

        assert!(VideoTagHeader::parse(&[0x17, 0x01]).is_err());
    }

    #[test]
    fn test_nalu_iterator() {
        let data = [0, 0, 0, 2, 0x65, 0x88, 0, 0, 0, 1, 0x41];
        let nalus: Vec<&[u8]> = NaluIterator::new(&data, 4).collect();
        assert_eq!(nalus, vec![&[0x65, 0x88][..], &[0x41][..]]);

        // Truncated
        let data = [0, 0, 0, 9, 0x65];
        assert_eq!(NaluIterator::new(&data, 4).count(), 0);

        // 2-byte lengths
        let data = [0, 1, 0x41];
        assert_eq!(NaluIterator::new(&data, 2).count(), 1);
    }

    #[test]
    fn test_sequence_header_detection() {
        let codec = H264Codec::new();
        assert!(codec.is_sequence_header(&sequence_header()));
        assert!(!codec.is_sequence_header(&avcc_frame(true, 0, &[&[0x65]])));
        // HEVC codec id
        assert!(!codec.is_sequence_header(&[0x1C, 0x00]));
    }

    #[test]
    fn test_config_round_trip() {
        let mut codec = H264Codec::new();
        let raw = codec.config_from_avcc(&sequence_header()).unwrap();
        assert_eq!(raw.len(), 2);
        assert_eq!(&raw[0][..], SPS);
        assert_eq!(&raw[1][..], PPS);

        let avcc = codec.config_from_raw(&raw).unwrap();
        assert_eq!(avcc, sequence_header());
    }

    #[test]
    fn test_stamp_avcc_composition_time() {
        let mut codec = H264Codec::new();
        let mut frame = AVFrame::new();
        frame.append_avcc(avcc_frame(true, 80, &[&[0x65, 0x01]]));
        codec.stamp_avcc(&mut frame, 1000);

        assert!(frame.keyframe);
        assert_eq!(frame.dts, 90_000);
        assert_eq!(frame.pts, 90_000 + 80 * 90);
    }

    #[test]
    fn test_complete_rtp_single_nalus() {
        let mut codec = H264Codec::new();
        let mut muxer = muxer();
        let mut frame = AVFrame::new();
        frame.append_avcc(avcc_frame(false, 0, &[&[0x41, 0x9A], &[0x41, 0x9B]]));
        frame.pts = 3600;

        codec
            .complete_rtp(&mut frame, &mut muxer, &DecoderConfiguration::default())
            .unwrap();

        assert_eq!(frame.rtp.len(), 2);
        assert!(!frame.rtp[0].header.marker);
        assert!(frame.rtp[1].header.marker);
        assert_eq!(frame.rtp[1].header.timestamp, 3600);
        assert_eq!(frame.rtp[1].header.sequence_number, 1);
        assert_eq!(&frame.rtp[0].payload[..], &[0x41, 0x9A]);
    }

    #[test]
    fn test_complete_rtp_keyframe_carries_parameter_sets() {
        let mut codec = H264Codec::new();
        let mut muxer = muxer();
        let config = DecoderConfiguration {
            raw: vec![Bytes::from_static(SPS), Bytes::from_static(PPS)],
            ..Default::default()
        };
        let mut frame = AVFrame::new();
        frame.keyframe = true;
        frame.append_avcc(avcc_frame(true, 0, &[&[0x65, 0x88]]));

        codec.complete_rtp(&mut frame, &mut muxer, &config).unwrap();

        let types: Vec<u8> = frame.rtp.iter().map(|p| p.payload[0] & 0x1F).collect();
        assert_eq!(types, vec![7, 8, 5]);
    }

    #[test]
    fn test_fu_a_round_trip() {
        let mut nalu = vec![0x65];
        nalu.extend((0..3000u32).map(|i| i as u8));
        let nalu = Bytes::from(nalu);

        let payloads = packetize_nalu(&nalu, 1200);
        assert_eq!(payloads.len(), 3);
        assert_eq!(payloads[0][0] & 0x1F, NALU_FU_A);
        assert_eq!(payloads[0][1], 0x80 | 5);
        assert_eq!(payloads[1][1], 5);
        assert_eq!(payloads[2][1], 0x40 | 5);

        let mut muxer = muxer();
        let packets: Vec<RtpPacket> = payloads
            .into_iter()
            .map(|p| muxer.packet(false, 0, p))
            .collect();
        let nalus = depacketize(&packets).unwrap();
        assert_eq!(nalus, vec![nalu]);
    }

    #[test]
    fn test_depacketize_stap_a() {
        let mut payload = BytesMut::new();
        payload.put_u8(0x18);
        payload.put_u16(SPS.len() as u16);
        payload.extend_from_slice(SPS);
        payload.put_u16(PPS.len() as u16);
        payload.extend_from_slice(PPS);

        let packet = muxer().packet(false, 0, payload.freeze());
        let nalus = depacketize(&[packet]).unwrap();
        assert_eq!(nalus.len(), 2);
        assert_eq!(&nalus[0][..], SPS);
        assert_eq!(&nalus[1][..], PPS);
    }

    #[test]
    fn test_complete_avcc_from_rtp() {
        let mut codec = H264Codec::new();
        let mut muxer = muxer();
        let mut frame = AVFrame::new();
        frame.dts = 9000;
        frame.pts = 9000 + 90 * 40;
        for nalu in [SPS, PPS, &[0x65, 0x88, 0x84][..]] {
            let packet = muxer.packet(false, 9000, Bytes::copy_from_slice(nalu));
            frame.append_rtp(packet);
        }

        codec.complete_avcc(&mut frame).unwrap();

        assert!(frame.keyframe);
        let avcc = frame.avcc_bytes();
        assert_eq!(&avcc[..5], &[0x17, 0x01, 0x00, 0x00, 40]);
        assert_eq!(&avcc[5..], &[0, 0, 0, 3, 0x65, 0x88, 0x84]);

        // Parameter sets were lifted into a configuration update
        let update = codec.take_config_update().unwrap();
        assert_eq!(update.len(), 2);
        assert!(codec.take_config_update().is_none());
    }

    #[test]
    fn test_complete_avcc_without_slices_fails() {
        let mut codec = H264Codec::new();
        let mut frame = AVFrame::new();
        assert!(codec.complete_avcc(&mut frame).is_err());
    }

    #[test]
    fn test_write_slice_marks_keyframe() {
        let mut codec = H264Codec::new();
        let mut frame = AVFrame::new();
        codec.write_slice(&mut frame, Bytes::from_static(&[0x41, 0x01]));
        assert!(!frame.keyframe);
        codec.write_slice(&mut frame, Bytes::from_static(&[0x65, 0x01]));
        assert!(frame.keyframe);
        assert_eq!(frame.raw.len(), 2);
    }
}
