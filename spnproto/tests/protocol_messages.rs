use spnproto::{
    parse_message, serialize_message, ClientGoodbye, ClientHello, ClientState, ClientTime,
    ControllerState, DeviceInfo, FormatSpec, GoodbyeReason, GroupUpdate, Message, Metadata,
    PlaybackState, PlayerCommand, PlayerState, PlayerSupport, PlayerSyncState, ServerCommand,
    ServerHello, ServerState, ServerTime, StreamClear, StreamEnd, StreamPlayerConfig, StreamStart,
    PROTOCOL_VERSION,
};

fn roundtrip(message: Message) {
    let json = serialize_message(&message).unwrap();
    let parsed = parse_message(&json)
        .unwrap()
        .expect("round-tripped message must be recognized");
    assert_eq!(parsed, message, "mismatch for {}", json);
}

#[test]
fn test_client_hello_roundtrip() {
    roundtrip(Message::ClientHello(ClientHello {
        client_id: "9e4a7a3e-0001-4c2f-9df0-0f1a2b3c4d5e".into(),
        name: "Living room".into(),
        version: PROTOCOL_VERSION,
        supported_roles: vec!["player@v1".into()],
        device_info: Some(DeviceInfo {
            product_name: Some("SpinPlayer".into()),
            manufacturer: None,
            software_version: Some("0.1.0".into()),
        }),
        player_support: Some(PlayerSupport {
            supported_formats: vec![FormatSpec {
                codec: "pcm".into(),
                sample_rate: 48_000,
                channels: 2,
                bit_depth: 16,
            }],
            buffer_capacity: 400,
            supported_commands: vec!["volume".into(), "mute".into()],
        }),
    }));
}

#[test]
fn test_client_hello_wire_field_names() {
    let msg = Message::ClientHello(ClientHello {
        client_id: "id".into(),
        name: "n".into(),
        version: 1,
        supported_roles: vec!["player@v1".into()],
        device_info: None,
        player_support: Some(PlayerSupport {
            supported_formats: vec![],
            buffer_capacity: 1,
            supported_commands: vec![],
        }),
    });
    let value: serde_json::Value =
        serde_json::from_str(&serialize_message(&msg).unwrap()).unwrap();

    // The support block uses the role-tagged key, everything else snake_case.
    assert!(value["payload"].get("player@v1_support").is_some());
    assert!(value["payload"].get("client_id").is_some());
    assert!(value["payload"].get("device_info").is_none());
}

#[test]
fn test_server_hello_roundtrip() {
    roundtrip(Message::ServerHello(ServerHello {
        server_id: "srv-1".into(),
        name: "Controller".into(),
        version: 1,
        active_roles: vec!["player@v1".into()],
    }));
}

#[test]
fn test_time_messages_roundtrip() {
    roundtrip(Message::ClientTime(ClientTime {
        client_transmitted: 1_000_000,
    }));
    roundtrip(Message::ServerTime(ServerTime {
        client_transmitted: 1_000_000,
        server_received: 2_000_500,
        server_transmitted: 2_000_700,
    }));
}

#[test]
fn test_state_messages_roundtrip() {
    roundtrip(Message::ClientState(ClientState {
        player: Some(PlayerState {
            state: PlayerSyncState::Synchronized,
            volume: Some(80),
            muted: Some(false),
        }),
    }));
    roundtrip(Message::ServerState(ServerState {
        metadata: Some(Metadata {
            title: Some("Title".into()),
            artist: Some("Artist".into()),
            ..Default::default()
        }),
        controller: Some(ControllerState {
            supported_commands: vec!["volume".into()],
            volume: 55,
            muted: false,
        }),
    }));
}

#[test]
fn test_command_and_stream_roundtrip() {
    roundtrip(Message::ServerCommand(ServerCommand {
        player: Some(PlayerCommand {
            command: "volume".into(),
            volume: Some(42),
            mute: None,
        }),
    }));
    roundtrip(Message::StreamStart(StreamStart {
        player: Some(StreamPlayerConfig {
            codec: "opus".into(),
            sample_rate: 48_000,
            channels: 2,
            bit_depth: 16,
            codec_header: None,
            timestamp: Some(123_456_789),
        }),
    }));
    roundtrip(Message::StreamClear(StreamClear { roles: None }));
    roundtrip(Message::StreamEnd(StreamEnd {
        roles: Some(vec!["player@v1".into()]),
    }));
}

#[test]
fn test_group_and_goodbye_roundtrip() {
    roundtrip(Message::GroupUpdate(GroupUpdate {
        group_id: Some("g1".into()),
        group_name: Some("Downstairs".into()),
        playback_state: Some(PlaybackState::Playing),
        volume: Some(70),
        muted: Some(false),
    }));
    roundtrip(Message::ClientGoodbye(ClientGoodbye {
        reason: GoodbyeReason::Shutdown,
    }));
}

#[test]
fn test_enum_wire_casing() {
    let json = serialize_message(&Message::ClientGoodbye(ClientGoodbye {
        reason: GoodbyeReason::AnotherServer,
    }))
    .unwrap();
    assert!(json.contains("another_server"));

    let json = serialize_message(&Message::ClientState(ClientState {
        player: Some(PlayerState {
            state: PlayerSyncState::Synchronized,
            volume: None,
            muted: None,
        }),
    }))
    .unwrap();
    assert!(json.contains("\"synchronized\""));
}

#[test]
fn test_unknown_message_type_is_not_an_error() {
    let parsed = parse_message(r#"{"type":"stream/request-format","payload":{}}"#).unwrap();
    assert!(parsed.is_none());
}

#[test]
fn test_garbage_is_an_error() {
    assert!(parse_message("{not json").is_err());
    assert!(parse_message(r#"{"type":42,"payload":{}}"#).is_err());
}
