use std::convert::TryFrom;
use std::io::{Cursor, Read};
use std::path::Path;

use bytes::{Buf, Bytes};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;

use super::CodecError;
use crate::packet::{Packet, PacketKind};
use crate::{put_i24_be, put_i32_be, FLV_HEADER};

pub const TAG_AUDIO: u8 = 8;
pub const TAG_VIDEO: u8 = 9;
pub const TAG_SCRIPT: u8 = 18;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    KeyFrame,
    InterFrame,
    DisposableInterFrame,
    GeneratedKeyframe,
    VideoInfoFrame,
}

impl TryFrom<u8> for FrameType {
    type Error = CodecError;

    fn try_from(val: u8) -> Result<Self, Self::Error> {
        Ok(match val {
            1 => Self::KeyFrame,
            2 => Self::InterFrame,
            3 => Self::DisposableInterFrame,
            4 => Self::GeneratedKeyframe,
            5 => Self::VideoInfoFrame,
            x => return Err(CodecError::UnknownFrameType(x)),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AvcPacketType {
    SequenceHeader,
    NalUnit,
    EndOfSequence,
}

impl TryFrom<u8> for AvcPacketType {
    type Error = CodecError;

    fn try_from(val: u8) -> Result<Self, Self::Error> {
        Ok(match val {
            0 => Self::SequenceHeader,
            1 => Self::NalUnit,
            2 => Self::EndOfSequence,
            x => return Err(CodecError::UnknownPacketType(x)),
        })
    }
}

// Field                | Type
// -------------------- | ---
// Frame Type           | u4
// Codec ID             | u4
// AVC Packet Type      | u8
// Composition Time     | i24
// Body                 | [u8]
#[derive(Debug, Clone)]
pub struct VideoData {
    pub frame_type: FrameType,
    pub packet_type: AvcPacketType,
    pub composition_time: i32,
    pub body: Bytes,
}

impl VideoData {
    pub fn is_sequence_header(&self) -> bool {
        self.packet_type == AvcPacketType::SequenceHeader
    }

    pub fn is_keyframe(&self) -> bool {
        self.frame_type == FrameType::KeyFrame
    }

    /// Composition time clamped to the non-negative range the relay
    /// carries internally.
    pub fn composition_time_ms(&self) -> u64 {
        self.composition_time.max(0) as u64
    }
}

impl TryFrom<&[u8]> for VideoData {
    type Error = CodecError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        if bytes.len() < 5 {
            return Err(CodecError::NotEnoughData("FLV video tag header"));
        }

        let mut buf = Cursor::new(bytes);
        let header_a = buf.get_u8();
        let codec_id = header_a & 0x0F;
        if codec_id != 7 {
            return Err(CodecError::UnsupportedVideoFormat(codec_id));
        }

        let frame_type = FrameType::try_from(header_a >> 4)?;
        let header_b = buf.get_u32();
        let packet_type = AvcPacketType::try_from((header_b >> 24) as u8)?;
        // i24, sign-extended
        let raw_cts = (header_b & 0x00FF_FFFF) as i32;
        let composition_time = if raw_cts & 0x0080_0000 != 0 {
            raw_cts | !0x00FF_FFFF
        } else {
            raw_cts
        };

        let mut remaining = Vec::new();
        buf.read_to_end(&mut remaining)?;
        Ok(Self {
            frame_type,
            packet_type,
            composition_time,
            body: remaining.into(),
        })
    }
}

// Field       | Type
// ----------- | ---
// Format      | u4
// Rate        | u2
// Size        | u1
// Type        | u1
// Packet Type | u8 (AAC only)
// Body        | [u8]
#[derive(Debug, Clone)]
pub struct AudioData {
    pub is_aac: bool,
    pub is_sequence_header: bool,
    pub body: Bytes,
}

impl TryFrom<&[u8]> for AudioData {
    type Error = CodecError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        if bytes.len() < 2 {
            return Err(CodecError::NotEnoughData("FLV audio tag header"));
        }
        let is_aac = bytes[0] >> 4 == 10;
        let is_sequence_header = is_aac && bytes[1] == 0;
        Ok(Self {
            is_aac,
            is_sequence_header,
            body: Bytes::copy_from_slice(&bytes[2..]),
        })
    }
}

/// Serializes one packet as an FLV tag (header + payload + previous tag
/// size), the on-disk framing.
pub fn tag_bytes(tag_type: u8, timestamp_ms: u64, payload: &[u8]) -> Vec<u8> {
    let data_len = payload.len();
    let timestamp_base = timestamp_ms & 0xFF_FFFF;
    let timestamp_ext = (timestamp_ms >> 24) & 0xFF;

    let mut h = [0u8; 11];
    h[0] = tag_type;
    put_i24_be(&mut h[1..4], data_len as i32);
    put_i24_be(&mut h[4..7], timestamp_base as i32);
    h[7] = timestamp_ext as u8;

    let mut out = Vec::with_capacity(11 + data_len + 4);
    out.extend_from_slice(&h);
    out.extend_from_slice(payload);

    let mut tail = [0u8; 4];
    put_i32_be(&mut tail, (data_len + 11) as i32);
    out.extend_from_slice(&tail);
    out
}

/// FLV file sink: header on open, tags as packets arrive.
pub struct FlvFileWriter {
    file: File,
    bytes_written: u64,
}

impl FlvFileWriter {
    pub async fn create<P: AsRef<Path>>(path: P) -> std::io::Result<Self> {
        let mut file = File::create(path).await?;
        file.write_all(&FLV_HEADER).await?;
        Ok(Self {
            file,
            bytes_written: FLV_HEADER.len() as u64,
        })
    }

    pub async fn write_packet(&mut self, packet: &Packet) -> std::io::Result<()> {
        let tag_type = match packet.kind {
            PacketKind::Video => TAG_VIDEO,
            PacketKind::Audio => TAG_AUDIO,
        };
        self.write_tag(tag_type, packet.time_ms(), &packet.payload)
            .await
    }

    pub async fn write_tag(
        &mut self,
        tag_type: u8,
        timestamp_ms: u64,
        payload: &[u8],
    ) -> std::io::Result<()> {
        let bytes = tag_bytes(tag_type, timestamp_ms, payload);
        self.file.write_all(&bytes).await?;
        self.bytes_written += bytes.len() as u64;
        Ok(())
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub async fn finish(mut self) -> std::io::Result<()> {
        self.file.flush().await?;
        self.file.sync_all().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn video_tag_parse() {
        // keyframe, H264, NALU, cts = 0x000102
        let bytes = [0x17u8, 0x01, 0x00, 0x01, 0x02, 0xAA, 0xBB];
        let tag = VideoData::try_from(&bytes[..]).unwrap();
        assert!(tag.is_keyframe());
        assert!(!tag.is_sequence_header());
        assert_eq!(tag.composition_time, 0x0102);
        assert_eq!(tag.body.as_ref(), &[0xAA, 0xBB]);
    }

    #[test]
    fn video_tag_negative_cts_clamped() {
        // cts = 0xFFFFFF = -1 as i24
        let bytes = [0x27u8, 0x01, 0xFF, 0xFF, 0xFF, 0x00];
        let tag = VideoData::try_from(&bytes[..]).unwrap();
        assert_eq!(tag.composition_time, -1);
        assert_eq!(tag.composition_time_ms(), 0);
    }

    #[test]
    fn video_tag_rejects_non_h264() {
        let bytes = [0x12u8, 0x01, 0x00, 0x00, 0x00];
        assert!(matches!(
            VideoData::try_from(&bytes[..]),
            Err(CodecError::UnsupportedVideoFormat(2))
        ));
    }

    #[test]
    fn audio_tag_sequence_header() {
        let bytes = [0xAFu8, 0x00, 0x12, 0x10];
        let tag = AudioData::try_from(&bytes[..]).unwrap();
        assert!(tag.is_aac);
        assert!(tag.is_sequence_header);
        assert_eq!(tag.body.as_ref(), &[0x12, 0x10]);
    }

    #[test]
    fn tag_framing_layout() {
        let out = tag_bytes(TAG_VIDEO, 0x01020304, &[0xDE, 0xAD]);
        assert_eq!(out.len(), 11 + 2 + 4);
        assert_eq!(out[0], TAG_VIDEO);
        // data size
        assert_eq!(&out[1..4], &[0, 0, 2]);
        // timestamp base + extension
        assert_eq!(&out[4..7], &[0x02, 0x03, 0x04]);
        assert_eq!(out[7], 0x01);
        // previous tag size
        assert_eq!(&out[13..17], &[0, 0, 0, 13]);
    }
}
