//! # spnproto
//!
//! Wire protocol for the SpinPlayer session: JSON control messages and
//! binary media frames, both carried over one full-duplex channel.
//!
//! The crate is purely computational. Serialization and parsing never touch
//! the network; a malformed input yields a [`ProtocolError`] and nothing else.
//!
//! ## Text messages
//!
//! Control messages travel as a JSON envelope `{"type": ..., "payload": ...}`.
//! [`Message`] models the envelope as a tagged enum; [`parse_message`] is the
//! lenient entry point used on the receive path (unknown types are reported
//! as `None`, not as errors, so protocol extensions never kill a session).
//!
//! ## Binary frames
//!
//! Media data travels as binary frames with a fixed 9-byte prefix:
//!
//! ```text
//! byte 0      frame type (u8)
//! bytes 1..9  timestamp   (i64, big-endian, microseconds, server clock)
//! bytes 9..   payload
//! ```
//!
//! Frame types 4-7 carry player audio, 8-11 artwork channels 0-3 and 16-23
//! visualizer data. Only audio frames are consumed by the playback core;
//! the other kinds are classified here and handed to external collaborators.

mod binary;
mod error;
mod messages;

pub use binary::{frame_kind, BinaryFrame, FrameKind};
pub use error::ProtocolError;
pub use messages::{
    parse_message, serialize_message, ClientGoodbye, ClientHello, ClientState, ClientTime,
    ControllerState, DeviceInfo, FormatSpec, GoodbyeReason, GroupUpdate, Message, Metadata,
    PlaybackState, PlayerCommand, PlayerState, PlayerSupport, PlayerSyncState, ServerCommand,
    ServerHello, ServerState, ServerTime, StreamClear, StreamEnd, StreamPlayerConfig, StreamStart,
    TrackProgress, PROTOCOL_VERSION,
};
