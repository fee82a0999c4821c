//! FLV tag framing
//!
//! Bridges committed AVCC frames to transports that speak FLV (HTTP-FLV,
//! recorders) and reads tags back from such streams.
//!
//! FLV Tag Structure:
//! ```text
//! +--------+-------------+-----------+-------+-------------+---------+--------------+
//! | Type(1)| DataSize(3) | TS(3)     | TSx(1)| StreamID(3) | Data(N) | PrevSize(4)  |
//! +--------+-------------+-----------+-------+-------------+---------+--------------+
//! ```
//!
//! `TSx` holds the upper 8 bits of the 32-bit millisecond timestamp;
//! `StreamID` is always zero; `PrevSize` is `N + 11`.
//!
//! Video Data:
//! ```text
//! +----------+----------+
//! | FrameType| CodecID  | CodecData...
//! | (4 bits) | (4 bits) |
//! +----------+----------+
//! ```
//!
//! Audio Data:
//! ```text
//! +----------+----------+----------+----------+
//! |SoundFormat|SoundRate|SoundSize |SoundType | AudioData...
//! | (4 bits)  | (2 bits)| (1 bit)  | (1 bit)  |
//! +----------+----------+----------+----------+
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

use super::frame::{AVFrame, MediaKind};

pub const TAG_TYPE_AUDIO: u8 = 0x08;
pub const TAG_TYPE_VIDEO: u8 = 0x09;
pub const TAG_TYPE_SCRIPT: u8 = 0x12;

/// Tag header size
pub const TAG_HEADER_SIZE: usize = 11;

/// Previous-tag-size trailer size
pub const TAG_TRAILER_SIZE: usize = 4;

/// File header for an audio+video stream, followed by PreviousTagSize0
pub const FLV_HEADER: [u8; 13] = [
    b'F', b'L', b'V', 0x01, 0x05, 0x00, 0x00, 0x00, 0x09, 0x00, 0x00, 0x00, 0x00,
];

/// FLV tag type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlvTagType {
    Audio,
    Video,
    Script,
}

impl FlvTagType {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            TAG_TYPE_AUDIO => Some(FlvTagType::Audio),
            TAG_TYPE_VIDEO => Some(FlvTagType::Video),
            TAG_TYPE_SCRIPT => Some(FlvTagType::Script),
            _ => None,
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            FlvTagType::Audio => TAG_TYPE_AUDIO,
            FlvTagType::Video => TAG_TYPE_VIDEO,
            FlvTagType::Script => TAG_TYPE_SCRIPT,
        }
    }
}

impl From<MediaKind> for FlvTagType {
    fn from(kind: MediaKind) -> Self {
        match kind {
            MediaKind::Audio => FlvTagType::Audio,
            MediaKind::Video => FlvTagType::Video,
        }
    }
}

/// Parsed FLV tag
#[derive(Debug, Clone)]
pub struct FlvTag {
    /// Tag type
    pub tag_type: FlvTagType,
    /// Timestamp in milliseconds
    pub timestamp: u32,
    /// Raw tag data (including codec headers)
    pub data: Bytes,
}

/// Codec id of AVC in the video tag's low nibble
const VIDEO_CODEC_AVC: u8 = 7;

/// Sound format of AAC in the audio tag's high nibble
const SOUND_FORMAT_AAC: u8 = 10;

/// Largest body the 24-bit data size field can describe
pub const MAX_TAG_DATA_SIZE: usize = 0xFF_FFFF;

/// Frame type nibble of a video tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoFrameType {
    /// Random access point, including server-generated ones
    Keyframe,
    /// Inter or disposable inter frame
    InterFrame,
}

impl VideoFrameType {
    /// Info/command frames and reserved values have no frame type
    pub fn from_byte(b: u8) -> Option<Self> {
        match b >> 4 {
            1 | 4 => Some(VideoFrameType::Keyframe),
            2 | 3 => Some(VideoFrameType::InterFrame),
            _ => None,
        }
    }

    pub fn is_keyframe(&self) -> bool {
        *self == VideoFrameType::Keyframe
    }
}

/// Codec nibble of a video tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoCodec {
    Avc,
    Other(u8),
}

impl VideoCodec {
    pub fn from_byte(b: u8) -> Self {
        match b & 0x0F {
            VIDEO_CODEC_AVC => VideoCodec::Avc,
            id => VideoCodec::Other(id),
        }
    }
}

/// Sound format nibble of an audio tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioFormat {
    Aac,
    Other(u8),
}

impl AudioFormat {
    pub fn from_byte(b: u8) -> Self {
        match b >> 4 {
            SOUND_FORMAT_AAC => AudioFormat::Aac,
            format => AudioFormat::Other(format),
        }
    }
}

impl FlvTag {
    pub fn new(tag_type: FlvTagType, timestamp: u32, data: Bytes) -> Self {
        Self {
            tag_type,
            timestamp,
            data,
        }
    }

    /// Create a new video tag
    pub fn video(timestamp: u32, data: Bytes) -> Self {
        Self::new(FlvTagType::Video, timestamp, data)
    }

    /// Create a new audio tag
    pub fn audio(timestamp: u32, data: Bytes) -> Self {
        Self::new(FlvTagType::Audio, timestamp, data)
    }

    pub fn is_video(&self) -> bool {
        self.tag_type == FlvTagType::Video
    }

    pub fn is_audio(&self) -> bool {
        self.tag_type == FlvTagType::Audio
    }

    /// Frame type of a non-empty video tag
    pub fn video_frame_type(&self) -> Option<VideoFrameType> {
        self.data
            .first()
            .filter(|_| self.is_video())
            .and_then(|b| VideoFrameType::from_byte(*b))
    }

    /// Codec of a non-empty video tag
    pub fn video_codec(&self) -> Option<VideoCodec> {
        self.data
            .first()
            .filter(|_| self.is_video())
            .map(|b| VideoCodec::from_byte(*b))
    }

    /// Sound format of a non-empty audio tag
    pub fn audio_format(&self) -> Option<AudioFormat> {
        self.data
            .first()
            .filter(|_| self.is_audio())
            .map(|b| AudioFormat::from_byte(*b))
    }

    pub fn is_keyframe(&self) -> bool {
        self.video_frame_type()
            .map(|ft| ft.is_keyframe())
            .unwrap_or(false)
    }

    pub fn is_avc_sequence_header(&self) -> bool {
        self.video_codec() == Some(VideoCodec::Avc) && self.data.len() >= 2 && self.data[1] == 0
    }

    pub fn is_aac_sequence_header(&self) -> bool {
        self.audio_format() == Some(AudioFormat::Aac) && self.data.len() >= 2 && self.data[1] == 0
    }

    /// Size of the tag body
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Encode this tag with its header and trailer
    pub fn encode(&self) -> Result<Vec<Bytes>> {
        encode_tag(self.tag_type.code(), self.timestamp, &[self.data.clone()])
    }
}

fn tag_header(tag_type: u8, timestamp: u32, data_size: usize) -> Bytes {
    let mut header = BytesMut::with_capacity(TAG_HEADER_SIZE);
    header.put_u8(tag_type);
    header.put_uint(data_size as u64, 3);
    header.put_uint((timestamp & 0x00FF_FFFF) as u64, 3);
    header.put_u8((timestamp >> 24) as u8);
    header.put_uint(0, 3);
    header.freeze()
}

fn tag_trailer(data_size: usize) -> Bytes {
    let mut trailer = BytesMut::with_capacity(TAG_TRAILER_SIZE);
    trailer.put_u32((data_size + TAG_HEADER_SIZE) as u32);
    trailer.freeze()
}

/// Frame a tag body as header, body chunks and trailer
///
/// The body chunks are passed through without copying. Bodies larger than
/// [`MAX_TAG_DATA_SIZE`] do not fit the header and are refused.
pub fn encode_tag(tag_type: u8, timestamp: u32, body: &[Bytes]) -> Result<Vec<Bytes>> {
    let data_size: usize = body.iter().map(Bytes::len).sum();
    if data_size > MAX_TAG_DATA_SIZE {
        return Err(Error::InvalidFlv("tag body too large"));
    }
    let mut out = Vec::with_capacity(body.len() + 2);
    out.push(tag_header(tag_type, timestamp, data_size));
    out.extend(body.iter().cloned());
    out.push(tag_trailer(data_size));
    Ok(out)
}

/// Frame an audio AVCC payload
pub fn audio_avcc_to_flv(timestamp: u32, avcc: &[Bytes]) -> Result<Vec<Bytes>> {
    encode_tag(TAG_TYPE_AUDIO, timestamp, avcc)
}

/// Frame a video AVCC payload
pub fn video_avcc_to_flv(timestamp: u32, avcc: &[Bytes]) -> Result<Vec<Bytes>> {
    encode_tag(TAG_TYPE_VIDEO, timestamp, avcc)
}

/// Frame a committed frame's AVCC representation at its absolute time
pub fn frame_to_flv(kind: MediaKind, frame: &AVFrame) -> Result<Vec<Bytes>> {
    match kind {
        MediaKind::Audio => audio_avcc_to_flv(frame.abs_time, &frame.avcc),
        MediaKind::Video => video_avcc_to_flv(frame.abs_time, &frame.avcc),
    }
}

/// Write a tag to an async sink
pub async fn write_tag<W>(writer: &mut W, tag_type: u8, timestamp: u32, body: &[Bytes]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    for chunk in encode_tag(tag_type, timestamp, body)? {
        writer.write_all(&chunk).await?;
    }
    Ok(())
}

fn parse_header(mut header: &[u8]) -> Result<(FlvTagType, usize, u32)> {
    let code = header.get_u8();
    let tag_type = FlvTagType::from_code(code).ok_or(Error::InvalidFlv("unknown tag type"))?;
    let data_size = header.get_uint(3) as usize;
    let low = header.get_uint(3) as u32;
    let high = header.get_u8() as u32;
    // Stream ID (3 bytes) is ignored
    Ok((tag_type, data_size, (high << 24) | low))
}

fn check_trailer(trailer: u32, data_size: usize) -> Result<()> {
    if trailer as usize != data_size + TAG_HEADER_SIZE {
        return Err(Error::InvalidFlv("previous tag size mismatch"));
    }
    Ok(())
}

/// Read one tag (header, body and trailer) from an async source
pub async fn read_tag<R>(reader: &mut R) -> Result<FlvTag>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; TAG_HEADER_SIZE];
    reader.read_exact(&mut header).await?;
    let (tag_type, data_size, timestamp) = parse_header(&header)?;

    let mut data = vec![0u8; data_size];
    reader.read_exact(&mut data).await?;

    let trailer = reader.read_u32().await?;
    check_trailer(trailer, data_size)?;

    Ok(FlvTag::new(tag_type, timestamp, Bytes::from(data)))
}

/// Decode one tag from a buffer
///
/// Returns `Ok(None)` if the buffer does not yet hold a complete tag; no
/// bytes are consumed in that case.
pub fn decode_tag(buf: &mut BytesMut) -> Result<Option<FlvTag>> {
    if buf.len() < TAG_HEADER_SIZE {
        return Ok(None);
    }
    let (tag_type, data_size, timestamp) = parse_header(&buf[..TAG_HEADER_SIZE])?;
    let total = TAG_HEADER_SIZE + data_size + TAG_TRAILER_SIZE;
    if buf.len() < total {
        return Ok(None);
    }

    buf.advance(TAG_HEADER_SIZE);
    let data = buf.split_to(data_size).freeze();
    check_trailer(buf.get_u32(), data_size)?;

    Ok(Some(FlvTag::new(tag_type, timestamp, data)))
}

/// Consume and validate the 13-byte file header
pub async fn read_header<R>(reader: &mut R) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 13];
    reader.read_exact(&mut header).await?;
    if &header[..3] != b"FLV" {
        return Err(Error::InvalidFlv("bad signature"));
    }
    Ok(())
}
