pub mod aac;
pub mod avc;
pub mod flv;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Not enough data: {0}")]
    NotEnoughData(&'static str),

    #[error("Unsupported video format: {0}")]
    UnsupportedVideoFormat(u8),

    #[error("Unknown frame type: {0}")]
    UnknownFrameType(u8),

    #[error("Unknown AVC packet type: {0}")]
    UnknownPacketType(u8),

    #[error("Missing SPS or PPS")]
    MissingParameterSets,

    #[error("Invalid ADTS header")]
    InvalidAdts,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
