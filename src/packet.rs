use std::time::Duration;

use bytes::Bytes;
use rml_rtmp::sessions::StreamMetadata;

/// Media unit flowing through the fanout. Immutable once produced by the
/// source reader; clones share the payload.
#[derive(Debug, Clone)]
pub struct Packet {
    pub kind: PacketKind,
    /// Presentation time, zero-based per connection.
    pub time: Duration,
    /// Composition time offset (video only, clamped non-negative at parse).
    pub composition_time: Duration,
    pub keyframe: bool,
    pub payload: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Video,
    Audio,
}

impl PacketKind {
    /// Stream index: 0 = video, 1 = audio.
    pub fn index(&self) -> usize {
        match self {
            PacketKind::Video => 0,
            PacketKind::Audio => 1,
        }
    }
}

impl Packet {
    pub fn video<B: Into<Bytes>>(time_ms: u64, cts_ms: u64, keyframe: bool, payload: B) -> Self {
        Self {
            kind: PacketKind::Video,
            time: Duration::from_millis(time_ms),
            composition_time: Duration::from_millis(cts_ms),
            keyframe,
            payload: payload.into(),
        }
    }

    pub fn audio<B: Into<Bytes>>(time_ms: u64, payload: B) -> Self {
        Self {
            kind: PacketKind::Audio,
            time: Duration::from_millis(time_ms),
            composition_time: Duration::ZERO,
            keyframe: false,
            payload: payload.into(),
        }
    }

    pub fn time_ms(&self) -> u64 {
        self.time.as_millis() as u64
    }

    pub fn is_video(&self) -> bool {
        self.kind == PacketKind::Video
    }
}

/// Codec descriptors captured from the source, shared with every output
/// sink so reconnecting writers can re-emit headers.
#[derive(Debug, Clone, Default)]
pub struct StreamInfo {
    pub metadata: Option<StreamMetadata>,
    /// Full FLV video tag body of the AVC sequence header.
    pub video_header: Option<Bytes>,
    /// Full FLV audio tag body of the AAC sequence header.
    pub audio_header: Option<Bytes>,
}

impl StreamInfo {
    pub fn has_video(&self) -> bool {
        self.video_header.is_some()
    }

    pub fn has_audio(&self) -> bool {
        self.audio_header.is_some()
    }
}
