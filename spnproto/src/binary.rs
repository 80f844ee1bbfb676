//! Binary media frames.
//!
//! Every binary frame starts with a one-byte type and an 8-byte big-endian
//! timestamp in server-clock microseconds. The type byte selects a slot in
//! one of three ranges; anything outside them is preserved as
//! [`FrameKind::Unknown`] so the session can log and skip it.

use crate::ProtocolError;

/// First player-audio frame type.
pub const PLAYER_AUDIO_FIRST: u8 = 4;
/// Last player-audio frame type.
pub const PLAYER_AUDIO_LAST: u8 = 7;
/// First artwork frame type (channel 0).
pub const ARTWORK_FIRST: u8 = 8;
/// Last artwork frame type (channel 3).
pub const ARTWORK_LAST: u8 = 11;
/// First visualizer frame type.
pub const VISUALIZER_FIRST: u8 = 16;
/// Last visualizer frame type.
pub const VISUALIZER_LAST: u8 = 23;

const HEADER_LEN: usize = 9;

/// Classification of a binary frame's type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Audio destined for the playback pipeline; `slot` is 0-3.
    PlayerAudio { slot: u8 },
    /// Cover art for one of four display channels.
    Artwork { channel: u8 },
    /// Spectrum data for visualizer clients; `slot` is 0-7.
    Visualizer { slot: u8 },
    /// A type this implementation does not know.
    Unknown { type_id: u8 },
}

/// Maps a raw type byte to its [`FrameKind`].
pub fn frame_kind(type_id: u8) -> FrameKind {
    match type_id {
        PLAYER_AUDIO_FIRST..=PLAYER_AUDIO_LAST => FrameKind::PlayerAudio {
            slot: type_id - PLAYER_AUDIO_FIRST,
        },
        ARTWORK_FIRST..=ARTWORK_LAST => FrameKind::Artwork {
            channel: type_id - ARTWORK_FIRST,
        },
        VISUALIZER_FIRST..=VISUALIZER_LAST => FrameKind::Visualizer {
            slot: type_id - VISUALIZER_FIRST,
        },
        other => FrameKind::Unknown { type_id: other },
    }
}

impl FrameKind {
    /// The raw type byte this kind encodes to.
    pub fn type_id(&self) -> u8 {
        match *self {
            FrameKind::PlayerAudio { slot } => PLAYER_AUDIO_FIRST + slot,
            FrameKind::Artwork { channel } => ARTWORK_FIRST + channel,
            FrameKind::Visualizer { slot } => VISUALIZER_FIRST + slot,
            FrameKind::Unknown { type_id } => type_id,
        }
    }

    pub fn is_audio(&self) -> bool {
        matches!(self, FrameKind::PlayerAudio { .. })
    }
}

/// One decoded binary frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryFrame {
    pub kind: FrameKind,
    /// Intended presentation time of the first payload sample, server clock.
    pub timestamp_micros: i64,
    pub payload: Vec<u8>,
}

impl BinaryFrame {
    pub fn new(kind: FrameKind, timestamp_micros: i64, payload: Vec<u8>) -> Self {
        Self {
            kind,
            timestamp_micros,
            payload,
        }
    }

    /// Parses a frame from raw bytes. Frames shorter than the 9-byte header
    /// are rejected; an empty payload is valid (artwork-clear uses it).
    pub fn parse(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < HEADER_LEN {
            return Err(ProtocolError::FrameTooShort(data.len()));
        }

        let mut ts_bytes = [0u8; 8];
        ts_bytes.copy_from_slice(&data[1..HEADER_LEN]);

        Ok(Self {
            kind: frame_kind(data[0]),
            timestamp_micros: i64::from_be_bytes(ts_bytes),
            payload: data[HEADER_LEN..].to_vec(),
        })
    }

    /// Encodes the frame back to its wire representation.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.payload.len());
        out.push(self.kind.type_id());
        out.extend_from_slice(&self.timestamp_micros.to_be_bytes());
        out.extend_from_slice(&self.payload);
        out
    }
}
