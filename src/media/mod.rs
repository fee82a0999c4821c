//! Media tracks
//!
//! This module provides:
//! - Frames and their RTP / AVCC representations
//! - The single-writer ring buffer and flow pacer behind every track
//! - The frame completion pipeline (`Media`) with H.264 and AAC strategies
//! - FLV tag framing for container transports

pub mod aac;
pub mod flv;
pub mod frame;
pub mod h264;
pub mod pacer;
pub mod ring;
pub mod rtp;
pub mod track;

pub use aac::AacCodec;
pub use flv::{FlvTag, FlvTagType};
pub use frame::{AVFrame, MediaKind};
pub use h264::H264Codec;
pub use pacer::FlowPacer;
pub use ring::{RingBuffer, RingHandle, RingReader, RingWriter};
pub use rtp::{RtpHeader, RtpPacket};
pub use track::{Completion, DecoderConfiguration, Media, Track, TrackCodec, TrackReader};
