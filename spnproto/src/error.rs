use thiserror::Error;

/// Errors produced while encoding or decoding protocol data.
///
/// None of these are fatal for a session: the transport logs the offending
/// message and keeps the channel open.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("invalid message envelope: {0}")]
    Envelope(#[from] serde_json::Error),

    #[error("message envelope has no string 'type' field")]
    MissingType,

    #[error("binary frame too short: {0} bytes (9-byte header required)")]
    FrameTooShort(usize),
}
