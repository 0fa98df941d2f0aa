use std::io;
use thiserror::Error;
use tokio::time::error::Elapsed;

#[derive(Error, Debug)]
pub enum Error {
    #[error("No ingest configured for path {0}")]
    NoSuchIngest(String),

    #[error("Client disconnected: {0}")]
    Disconnected(#[from] io::Error),

    #[error("Connection timeout")]
    ConnectionTimeout(#[from] Elapsed),

    #[error("RTMP handshake failed")]
    HandshakeFailed,

    #[error("RTMP session initialization failed")]
    SessionInitializationFailed,

    #[error("Received invalid input")]
    InvalidInput,

    #[error("RTMP request was not accepted")]
    RequestRejected,

    #[error("Failed to deliver packet to session")]
    SessionSendFailed,
}
