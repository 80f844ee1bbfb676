use spnproto::{frame_kind, BinaryFrame, FrameKind, ProtocolError};

#[test]
fn test_audio_frame_parse() {
    // Type 4, timestamp 1_000_000, four payload bytes.
    let mut data = vec![0x04];
    data.extend_from_slice(&1_000_000i64.to_be_bytes());
    data.extend_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]);

    let frame = BinaryFrame::parse(&data).unwrap();
    assert_eq!(frame.kind, FrameKind::PlayerAudio { slot: 0 });
    assert!(frame.kind.is_audio());
    assert_eq!(frame.timestamp_micros, 1_000_000);
    assert_eq!(frame.payload, vec![0xDE, 0xAD, 0xBE, 0xEF]);
}

#[test]
fn test_encode_parse_identity() {
    for (kind, ts, payload) in [
        (FrameKind::PlayerAudio { slot: 2 }, 0i64, vec![]),
        (FrameKind::Artwork { channel: 3 }, 77i64, vec![1, 2, 3]),
        (FrameKind::Visualizer { slot: 7 }, i64::MAX, vec![9; 32]),
        (FrameKind::Unknown { type_id: 200 }, -5i64, vec![0]),
    ] {
        let frame = BinaryFrame::new(kind, ts, payload);
        let parsed = BinaryFrame::parse(&frame.encode()).unwrap();
        assert_eq!(parsed, frame);
    }
}

#[test]
fn test_truncated_frame_is_rejected() {
    for len in 0..9 {
        let data = vec![0x04; len];
        match BinaryFrame::parse(&data) {
            Err(ProtocolError::FrameTooShort(n)) => assert_eq!(n, len),
            other => panic!("expected FrameTooShort, got {:?}", other),
        }
    }
}

#[test]
fn test_header_only_frame_has_empty_payload() {
    // Artwork-clear is a 9-byte frame.
    let mut data = vec![0x09];
    data.extend_from_slice(&0i64.to_be_bytes());

    let frame = BinaryFrame::parse(&data).unwrap();
    assert_eq!(frame.kind, FrameKind::Artwork { channel: 1 });
    assert!(frame.payload.is_empty());
}

#[test]
fn test_only_audio_types_route_to_playback() {
    let audio: Vec<u8> = (0u8..=255).filter(|t| frame_kind(*t).is_audio()).collect();
    assert_eq!(audio, vec![4, 5, 6, 7]);
}
