//! JSON control messages.
//!
//! The envelope is `{"type": "<name>", "payload": {...}}` with snake_case
//! payload fields. Serde's adjacently-tagged representation maps onto it
//! directly, so [`Message`] round-trips without any hand-written glue.

use serde::{Deserialize, Serialize};

use crate::ProtocolError;

/// Protocol revision announced in `client/hello`.
pub const PROTOCOL_VERSION: u32 = 1;

/// Message types this implementation understands. Anything else on the wire
/// is ignored (with a debug log) rather than rejected.
const KNOWN_TYPES: &[&str] = &[
    "client/hello",
    "server/hello",
    "client/time",
    "server/time",
    "client/state",
    "server/state",
    "server/command",
    "stream/start",
    "stream/clear",
    "stream/end",
    "group/update",
    "client/goodbye",
];

/// Envelope of every JSON message exchanged with the controller server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload")]
pub enum Message {
    /// Opens the handshake; declares identity and capabilities.
    #[serde(rename = "client/hello")]
    ClientHello(ClientHello),

    /// Server side of the handshake; assigns identity and active roles.
    #[serde(rename = "server/hello")]
    ServerHello(ServerHello),

    /// Time-sync probe, carries the client transmit timestamp (T1).
    #[serde(rename = "client/time")]
    ClientTime(ClientTime),

    /// Time-sync answer, carries T1 back plus server receive/transmit (T2, T3).
    #[serde(rename = "server/time")]
    ServerTime(ServerTime),

    /// Player readiness and volume state reported to the server.
    #[serde(rename = "client/state")]
    ClientState(ClientState),

    /// Metadata and controller state pushed by the server.
    #[serde(rename = "server/state")]
    ServerState(ServerState),

    /// Direct command addressed to this player (volume, mute, ...).
    #[serde(rename = "server/command")]
    ServerCommand(ServerCommand),

    /// A new audio stream begins; carries the negotiated format.
    #[serde(rename = "stream/start")]
    StreamStart(StreamStart),

    /// Flush buffered audio (seek).
    #[serde(rename = "stream/clear")]
    StreamClear(StreamClear),

    /// The current stream is over.
    #[serde(rename = "stream/end")]
    StreamEnd(StreamEnd),

    /// Group membership / shared playback state update.
    #[serde(rename = "group/update")]
    GroupUpdate(GroupUpdate),

    /// Polite disconnect notice.
    #[serde(rename = "client/goodbye")]
    ClientGoodbye(ClientGoodbye),
}

impl Message {
    /// Wire name of this message's type tag.
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::ClientHello(_) => "client/hello",
            Message::ServerHello(_) => "server/hello",
            Message::ClientTime(_) => "client/time",
            Message::ServerTime(_) => "server/time",
            Message::ClientState(_) => "client/state",
            Message::ServerState(_) => "server/state",
            Message::ServerCommand(_) => "server/command",
            Message::StreamStart(_) => "stream/start",
            Message::StreamClear(_) => "stream/clear",
            Message::StreamEnd(_) => "stream/end",
            Message::GroupUpdate(_) => "group/update",
            Message::ClientGoodbye(_) => "client/goodbye",
        }
    }
}

/// Serializes a message into its JSON envelope.
pub fn serialize_message(message: &Message) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(message)?)
}

/// Parses a JSON envelope leniently.
///
/// Returns `Ok(None)` when the envelope is well-formed but carries a type
/// this implementation does not know, so that newer servers never break the
/// session. A known type with a malformed payload is a real error.
pub fn parse_message(text: &str) -> Result<Option<Message>, ProtocolError> {
    let value: serde_json::Value = serde_json::from_str(text)?;
    let type_name = value
        .get("type")
        .and_then(|t| t.as_str())
        .ok_or(ProtocolError::MissingType)?
        .to_string();

    match serde_json::from_value::<Message>(value) {
        Ok(message) => Ok(Some(message)),
        Err(err) => {
            if KNOWN_TYPES.contains(&type_name.as_str()) {
                Err(ProtocolError::Envelope(err))
            } else {
                tracing::debug!(message_type = %type_name, "Ignoring unknown message type");
                Ok(None)
            }
        }
    }
}

// ───────────────────────────────────────────────────────────────────────────
// Handshake
// ───────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientHello {
    /// Stable identifier for this endpoint (persisted across restarts).
    pub client_id: String,
    /// Human-readable name shown by controllers.
    pub name: String,
    pub version: u32,
    /// Roles with versions, e.g. `"player@v1"`.
    pub supported_roles: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_info: Option<DeviceInfo>,
    /// Player capabilities; present iff `player@v1` is among the roles.
    #[serde(rename = "player@v1_support", skip_serializing_if = "Option::is_none")]
    pub player_support: Option<PlayerSupport>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct DeviceInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub software_version: Option<String>,
}

/// What the player half of this endpoint can do.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlayerSupport {
    pub supported_formats: Vec<FormatSpec>,
    /// How many audio chunks the endpoint is willing to buffer.
    pub buffer_capacity: u32,
    pub supported_commands: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FormatSpec {
    pub codec: String,
    pub sample_rate: u32,
    pub channels: u8,
    pub bit_depth: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerHello {
    pub server_id: String,
    pub name: String,
    pub version: u32,
    /// Roles the server activated for this client.
    pub active_roles: Vec<String>,
}

// ───────────────────────────────────────────────────────────────────────────
// Time synchronization
// ───────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClientTime {
    /// T1: client monotonic clock at transmission, microseconds.
    pub client_transmitted: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerTime {
    /// T1 echoed back, used to match the answer to its probe.
    pub client_transmitted: i64,
    /// T2: server monotonic clock at reception.
    pub server_received: i64,
    /// T3: server monotonic clock at transmission.
    pub server_transmitted: i64,
}

// ───────────────────────────────────────────────────────────────────────────
// State
// ───────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientState {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub player: Option<PlayerState>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlayerState {
    pub state: PlayerSyncState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub muted: Option<bool>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PlayerSyncState {
    Synchronized,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ServerState {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub controller: Option<ControllerState>,
}

/// Now-playing metadata. Opaque to the playback core; forwarded to whoever
/// displays it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Metadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artist: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub album: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artwork_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<TrackProgress>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct TrackProgress {
    pub position: i64,
    pub duration: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub playback_speed: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ControllerState {
    pub supported_commands: Vec<String>,
    pub volume: u8,
    pub muted: bool,
}

// ───────────────────────────────────────────────────────────────────────────
// Commands
// ───────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerCommand {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub player: Option<PlayerCommand>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlayerCommand {
    /// `"volume"`, `"mute"`, ... ; the catalog is server-driven.
    pub command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mute: Option<bool>,
}

// ───────────────────────────────────────────────────────────────────────────
// Stream control
// ───────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StreamStart {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub player: Option<StreamPlayerConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StreamPlayerConfig {
    pub codec: String,
    pub sample_rate: u32,
    pub channels: u8,
    pub bit_depth: u8,
    /// Codec initialization blob (base64), e.g. the FLAC STREAMINFO block.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub codec_header: Option<String>,
    /// Intended start of playback on the server clock, microseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct StreamClear {
    /// Roles whose buffers should be flushed; all of them when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub roles: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct StreamEnd {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub roles: Option<Vec<String>>,
}

// ───────────────────────────────────────────────────────────────────────────
// Group
// ───────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct GroupUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub playback_state: Option<PlaybackState>,
    /// Group-wide volume; the player applies it to its sink.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub muted: Option<bool>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackState {
    Playing,
    Paused,
    Stopped,
}

// ───────────────────────────────────────────────────────────────────────────
// Lifecycle
// ───────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientGoodbye {
    pub reason: GoodbyeReason,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GoodbyeReason {
    Shutdown,
    Restart,
    UserRequest,
    AnotherServer,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_shape_on_the_wire() {
        let msg = Message::ClientTime(ClientTime {
            client_transmitted: 123_456,
        });
        let json = serialize_message(&msg).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(value["type"], "client/time");
        assert_eq!(value["payload"]["client_transmitted"], 123_456);
    }

    #[test]
    fn test_unknown_type_is_ignored() {
        let parsed =
            parse_message(r#"{"type":"server/banana","payload":{"ripeness":3}}"#).unwrap();
        assert!(parsed.is_none());
    }

    #[test]
    fn test_known_type_with_bad_payload_is_an_error() {
        let result = parse_message(r#"{"type":"server/time","payload":{"wrong":true}}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_missing_type_field() {
        let result = parse_message(r#"{"payload":{}}"#);
        assert!(matches!(result, Err(ProtocolError::MissingType)));
    }
}
