//! Tests de session contre un serveur WebSocket en process.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;

use spnaudio::{AudioPipeline, NullSink, PipelineConfig, PipelineState};
use spnproto::{
    parse_message, serialize_message, Message, ServerCommand, ServerHello, ServerTime,
    StreamPlayerConfig, StreamStart, PlayerCommand,
};
use spnsession::{
    spawn_sync_driver, BackoffConfig, InboundEvent, Session, SessionConfig, SessionError,
    SessionEvents, SyncDriverConfig, Transport,
};
use spnsync::{KalmanConfig, SharedClock};

type ServerWs = WebSocketStream<TcpStream>;

fn server_hello() -> Message {
    Message::ServerHello(ServerHello {
        server_id: "srv-test".to_string(),
        name: "Test server".to_string(),
        version: 1,
        active_roles: vec!["player@v1".to_string()],
    })
}

fn client_hello() -> Message {
    // Le hello minimal suffit aux tests de transport.
    Message::ClientHello(spnproto::ClientHello {
        client_id: "test-client".to_string(),
        name: "Test player".to_string(),
        version: spnproto::PROTOCOL_VERSION,
        supported_roles: vec!["player@v1".to_string()],
        device_info: None,
        player_support: None,
    })
}

/// Démarre un serveur acceptant une connexion, servie par `handler`.
async fn one_shot_server<F, Fut>(handler: F) -> String
where
    F: FnOnce(ServerWs) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        handler(ws).await;
    });
    format!("ws://{addr}")
}

/// Handshake côté serveur : consomme le client/hello, répond server/hello.
async fn accept_handshake(ws: &mut ServerWs) {
    let first = ws.next().await.unwrap().unwrap();
    let WsMessage::Text(text) = first else {
        panic!("expected text client/hello, got {first:?}");
    };
    let message = parse_message(&text).unwrap().unwrap();
    assert!(matches!(message, Message::ClientHello(_)));
    ws.send(WsMessage::Text(
        serialize_message(&server_hello()).unwrap(),
    ))
    .await
    .unwrap();
}

#[tokio::test]
async fn test_handshake_success() {
    let url = one_shot_server(|mut ws| async move {
        accept_handshake(&mut ws).await;
        // Garder le canal ouvert le temps du test.
        while ws.next().await.is_some() {}
    })
    .await;

    let transport = Transport::new(&url, BackoffConfig::default());
    let cancel = CancellationToken::new();
    let connection = transport.connect(&client_hello(), &cancel).await.unwrap();

    assert_eq!(connection.server_hello.server_id, "srv-test");
    assert_eq!(
        transport.current_state(),
        spnsession::SessionState::Connected
    );

    // disconnect ; disconnect == disconnect.
    connection.sender.close().await;
    connection.sender.close().await;
    assert!(matches!(
        connection.sender.send(&client_hello()).await,
        Err(SessionError::Cancelled)
    ));
}

#[tokio::test]
async fn test_handshake_timeout() {
    let url = one_shot_server(|mut ws| async move {
        // Jamais de server/hello.
        while ws.next().await.is_some() {}
    })
    .await;

    let transport = Transport::new(&url, BackoffConfig::default())
        .with_handshake_timeout(Duration::from_millis(200));
    let cancel = CancellationToken::new();
    let result = transport.connect(&client_hello(), &cancel).await;
    assert!(matches!(result, Err(SessionError::HandshakeTimeout)));
}

#[tokio::test]
async fn test_unexpected_message_during_handshake_is_protocol_error() {
    let url = one_shot_server(|mut ws| async move {
        let _ = ws.next().await;
        // stream/start à la place du server/hello attendu.
        let wrong = Message::StreamStart(StreamStart { player: None });
        let _ = ws
            .send(WsMessage::Text(serialize_message(&wrong).unwrap()))
            .await;
        while ws.next().await.is_some() {}
    })
    .await;

    let transport = Transport::new(&url, BackoffConfig::default());
    let cancel = CancellationToken::new();
    let result = transport.connect(&client_hello(), &cancel).await;
    assert!(matches!(result, Err(SessionError::Protocol(_))));
}

#[tokio::test]
async fn test_burst_feeds_only_best_rtt_sample() {
    // Chaque réponse encode un offset différent et une pénalité de RTT
    // artificielle ; seul l'échantillon le moins pénalisé (k = 2, offset
    // 3 s) doit atteindre le filtre.
    let penalties: [i64; 8] = [8_000, 9_000, 5_000, 40_000, 8_000, 8_100, 50_000, 8_000];

    let url = one_shot_server(move |mut ws| async move {
        accept_handshake(&mut ws).await;
        let mut index = 0usize;
        while let Some(Ok(frame)) = ws.next().await {
            if let WsMessage::Text(text) = frame {
                if let Ok(Some(Message::ClientTime(probe))) = parse_message(&text) {
                    // Seule la première rafale reçoit des réponses : le
                    // filtre ne doit voir qu'une mesure, la meilleure.
                    if index >= penalties.len() {
                        continue;
                    }
                    let offset = (index as i64 + 1) * 1_000_000;
                    let penalty = penalties[index];
                    let reply = Message::ServerTime(ServerTime {
                        client_transmitted: probe.client_transmitted,
                        server_received: probe.client_transmitted + offset,
                        server_transmitted: probe.client_transmitted + offset - penalty,
                    });
                    index += 1;
                    let _ = ws
                        .send(WsMessage::Text(serialize_message(&reply).unwrap()))
                        .await;
                }
            }
        }
    })
    .await;

    let transport = Transport::new(&url, BackoffConfig::default());
    let cancel = CancellationToken::new();
    let mut connection = transport.connect(&client_hello(), &cancel).await.unwrap();

    let clock = SharedClock::new(KalmanConfig::default());
    let driver = spawn_sync_driver(
        connection.sender.clone(),
        clock.clone(),
        SyncDriverConfig::default(),
        &cancel,
    );

    // Pompe de routage minimale : server/time vers le pilote.
    let pump = tokio::spawn(async move {
        while let Some(event) = connection.events.recv().await {
            if let InboundEvent::Message {
                message: Message::ServerTime(time),
                received_at_micros,
            } = event
            {
                driver.handle_server_time(time, received_at_micros);
            }
        }
    });

    // Attendre qu'au moins une rafale complète ait nourri le filtre.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while clock.measurement_count() == 0 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    assert!(clock.measurement_count() >= 1, "burst never fed the filter");
    let offset = clock.status().offset_micros;
    assert!(
        (offset - 3_000_000.0).abs() < 100_000.0,
        "filter got offset {offset}, expected the k=2 sample near 3 s"
    );

    cancel.cancel();
    pump.abort();
}

/// Chunk audio binaire PCM16 stéréo (frames × valeur constante).
fn audio_frame(timestamp_micros: i64, frames: usize) -> WsMessage {
    let mut payload = Vec::with_capacity(frames * 4);
    for _ in 0..frames * 2 {
        payload.extend_from_slice(&2_000i16.to_le_bytes());
    }
    let frame = spnproto::BinaryFrame::new(
        spnproto::FrameKind::PlayerAudio { slot: 0 },
        timestamp_micros,
        payload,
    );
    WsMessage::Binary(frame.encode())
}

#[tokio::test]
async fn test_full_stream_flow() {
    // Scénario complet : handshake, synchro, stream/start, audio, commande
    // de volume, stream/end, arrêt propre.
    let (client_states_tx, mut client_states) = mpsc::unbounded_channel::<Message>();
    let (step_tx, mut step_rx) = mpsc::unbounded_channel::<&'static str>();

    let url = one_shot_server(move |ws| async move {
        let (mut writer, mut reader) = ws.split();

        // Handshake.
        let first = reader.next().await.unwrap().unwrap();
        let WsMessage::Text(text) = first else {
            panic!("expected client/hello");
        };
        assert!(matches!(
            parse_message(&text).unwrap().unwrap(),
            Message::ClientHello(_)
        ));
        writer
            .send(WsMessage::Text(serialize_message(&server_hello()).unwrap()))
            .await
            .unwrap();

        // Lecture : répond aux sondes de temps, relaie les client/state.
        let (time_tx, mut time_rx) = mpsc::unbounded_channel::<Message>();
        tokio::spawn(async move {
            while let Some(Ok(frame)) = reader.next().await {
                if let WsMessage::Text(text) = frame {
                    match parse_message(&text) {
                        Ok(Some(Message::ClientTime(probe))) => {
                            let reply = Message::ServerTime(ServerTime {
                                client_transmitted: probe.client_transmitted,
                                server_received: probe.client_transmitted,
                                server_transmitted: probe.client_transmitted,
                            });
                            let _ = time_tx.send(reply);
                        }
                        Ok(Some(message @ Message::ClientState(_))) => {
                            let _ = client_states_tx.send(message);
                        }
                        Ok(Some(message @ Message::ClientGoodbye(_))) => {
                            let _ = client_states_tx.send(message);
                        }
                        _ => {}
                    }
                }
            }
        });

        // Script serveur.
        let stream_start = Message::StreamStart(StreamStart {
            player: Some(StreamPlayerConfig {
                codec: "pcm".to_string(),
                sample_rate: 48_000,
                channels: 2,
                bit_depth: 16,
                codec_header: None,
                timestamp: None,
            }),
        });
        writer
            .send(WsMessage::Text(serialize_message(&stream_start).unwrap()))
            .await
            .unwrap();

        let mut chunk_index = 0i64;
        loop {
            // Répondre aux sondes en attente.
            while let Ok(reply) = time_rx.try_recv() {
                let _ = writer
                    .send(WsMessage::Text(serialize_message(&reply).unwrap()))
                    .await;
            }
            // Alimenter le flux, 6 chunks de 20 ms par tour de 100 ms :
            // le tampon reste devant la consommation temps réel.
            for _ in 0..6 {
                let _ = writer
                    .send(audio_frame(chunk_index * 20_000, 960))
                    .await;
                chunk_index += 1;
            }

            match tokio::time::timeout(Duration::from_millis(100), step_rx.recv()).await {
                Err(_) => continue,
                Ok(Some("volume")) => {
                    let command = Message::ServerCommand(ServerCommand {
                        player: Some(PlayerCommand {
                            command: "volume".to_string(),
                            volume: Some(42),
                            mute: None,
                        }),
                    });
                    writer
                        .send(WsMessage::Text(serialize_message(&command).unwrap()))
                        .await
                        .unwrap();
                }
                Ok(Some("end")) => {
                    let end = Message::StreamEnd(spnproto::StreamEnd { roles: None });
                    writer
                        .send(WsMessage::Text(serialize_message(&end).unwrap()))
                        .await
                        .unwrap();
                }
                Ok(_) => break,
            }
        }
        // Drainer jusqu'à la fermeture.
        tokio::time::sleep(Duration::from_secs(1)).await;
    })
    .await;

    let clock = SharedClock::new(KalmanConfig::default());
    let (pipeline_states_tx, mut pipeline_states) = mpsc::unbounded_channel::<PipelineState>();
    let pipeline = AudioPipeline::new(
        PipelineConfig {
            buffer_capacity_ms: 8_000,
            buffer_target_ms: 250.0,
        },
        clock.clone(),
        Box::new(|| Box::new(NullSink::new())),
    );

    let events = SessionEvents {
        pipeline_state: Some(Arc::new(move |state| {
            let _ = pipeline_states_tx.send(state);
        })),
        ..SessionEvents::default()
    };

    let config = SessionConfig {
        url,
        client_id: "it-client".to_string(),
        player_name: "Integration player".to_string(),
        backoff: BackoffConfig::default(),
        wait_for_convergence: false,
        convergence_timeout: Duration::from_secs(2),
    };

    let mut session = Session::new(config, clock, pipeline, events);
    let cancel = CancellationToken::new();
    let session_cancel = cancel.clone();
    let session_task = tokio::spawn(async move { session.run(session_cancel).await });

    // L'état initial (synchronized) arrive après le handshake.
    let first_state = tokio::time::timeout(Duration::from_secs(5), client_states.recv())
        .await
        .expect("no initial client/state")
        .unwrap();
    match first_state {
        Message::ClientState(state) => {
            assert_eq!(
                state.player.unwrap().state,
                spnproto::PlayerSyncState::Synchronized
            );
        }
        other => panic!("expected client/state, got {other:?}"),
    }

    // Le pipeline doit atteindre Playing une fois le tampon rempli.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let state = tokio::time::timeout_at(deadline, pipeline_states.recv())
            .await
            .expect("pipeline never reached Playing")
            .unwrap();
        if state == PipelineState::Playing {
            break;
        }
    }

    // Commande de volume : appliquée et état renvoyé.
    step_tx.send("volume").unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let message = tokio::time::timeout_at(deadline, client_states.recv())
            .await
            .expect("no client/state after volume command")
            .unwrap();
        if let Message::ClientState(state) = message {
            if state.player.as_ref().and_then(|p| p.volume) == Some(42) {
                break;
            }
        }
    }

    // Fin de flux : retour à Idle.
    step_tx.send("end").unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let state = tokio::time::timeout_at(deadline, pipeline_states.recv())
            .await
            .expect("pipeline never went Idle after stream/end")
            .unwrap();
        if state == PipelineState::Idle {
            break;
        }
    }

    // Arrêt : la session sort proprement.
    cancel.cancel();
    let result = tokio::time::timeout(Duration::from_secs(5), session_task)
        .await
        .expect("session did not shut down")
        .unwrap();
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_reconnects_after_server_drop() {
    // Le serveur coupe après le premier handshake ; la session doit revenir
    // en Connected via le backoff.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        // Première connexion : handshake, un instant en ligne, puis coupure
        // sèche (le temps que le client observe l'état Connected).
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        accept_handshake(&mut ws).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        drop(ws);

        // Seconde connexion : on reste en ligne.
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        accept_handshake(&mut ws).await;
        while ws.next().await.is_some() {}
    });

    let clock = SharedClock::new(KalmanConfig::default());
    let pipeline = AudioPipeline::new(
        PipelineConfig::default(),
        clock.clone(),
        Box::new(|| Box::new(NullSink::new())),
    );
    let config = SessionConfig {
        url: format!("ws://{addr}"),
        client_id: "reconnect-client".to_string(),
        player_name: "Reconnect player".to_string(),
        backoff: BackoffConfig {
            base_delay_ms: 100,
            multiplier: 1.5,
            max_delay_ms: 1_000,
        },
        wait_for_convergence: false,
        convergence_timeout: Duration::from_secs(2),
    };

    let mut session = Session::new(config, clock, pipeline, SessionEvents::default());
    let mut states = session.state_watch();
    let cancel = CancellationToken::new();
    let session_cancel = cancel.clone();
    let task = tokio::spawn(async move { session.run(session_cancel).await });

    // Connected (1re fois) → perte → Connected (2e fois).
    let mut connections = 0;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while connections < 2 {
        tokio::time::timeout_at(deadline, states.changed())
            .await
            .expect("never reconnected")
            .unwrap();
        if *states.borrow() == spnsession::SessionState::Connected {
            connections += 1;
        }
    }

    cancel.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(5), task).await;
}
