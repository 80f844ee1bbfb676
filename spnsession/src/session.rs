//! Orchestrateur de session : câble transport, horloge, pilote de
//! synchronisation et pipeline audio, et route chaque message entrant vers
//! le bon composant.
//!
//! # Routage
//!
//! | entrée                  | destination                                   |
//! |-------------------------|-----------------------------------------------|
//! | `server/time`           | rafale en cours (T4 tamponné à la réception)  |
//! | `stream/start`          | rafale immédiate puis démarrage du pipeline   |
//! | `stream/clear` / `end`  | pipeline (flush / arrêt)                      |
//! | `server/command`        | volume/mute vers le sink, état renvoyé        |
//! | `server/state`          | volume/mute + métadonnées vers les hooks      |
//! | trames audio binaires   | pipeline (décodage + tampon)                  |
//! | trames artwork          | hook externe, opaque pour le cœur             |
//!
//! L'orchestrateur possède exclusivement le transport, le pilote et le
//! pipeline. Ordre d'arrêt : pilote → pipeline (sink compris) → transport.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use spnaudio::{AudioCodec, AudioFormat, AudioPipeline, BufferStats, PipelineState};
use spnproto::{
    ClientGoodbye, ClientHello, ClientState, DeviceInfo, FormatSpec, FrameKind, GoodbyeReason,
    GroupUpdate, Message, Metadata, PlayerState, PlayerSupport, PlayerSyncState, ServerCommand,
    ServerHello, ServerState, StreamStart, PROTOCOL_VERSION,
};
use spnsync::{ClockStatus, SharedClock};

use crate::{
    spawn_sync_driver, BackoffConfig, Connection, InboundEvent, SessionError, SessionState,
    SyncDriverConfig, SyncDriverHandle, Transport, WsSender,
};

/// Réglages d'une session de lecteur.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Adresse finale du serveur (la découverte est hors du cœur).
    pub url: String,
    /// Identifiant stable du client, persisté par la configuration.
    pub client_id: String,
    pub player_name: String,
    pub backoff: BackoffConfig,
    /// Si vrai, `stream/start` attend la synchro minimale de l'horloge.
    pub wait_for_convergence: bool,
    pub convergence_timeout: std::time::Duration,
}

/// Flux annoncé par `stream/start`, en attente de la rafale pré-flux.
struct PendingStart {
    format: AudioFormat,
    codec_header: Option<Vec<u8>>,
    /// Échéance de l'attente de synchro minimale.
    deadline: tokio::time::Instant,
}

/// Hooks étroits vers les collaborateurs externes (UI, presse-papier de
/// métadonnées...). Tous optionnels ; le cœur n'a aucune connaissance de ce
/// qu'il y a derrière.
#[derive(Clone, Default)]
pub struct SessionEvents {
    pub pipeline_state: Option<Arc<dyn Fn(PipelineState) + Send + Sync>>,
    pub metadata: Option<Arc<dyn Fn(Metadata) + Send + Sync>>,
    /// (canal, octets d'image ; vide = effacer).
    pub artwork: Option<Arc<dyn Fn(u8, Vec<u8>) + Send + Sync>>,
    pub error: Option<Arc<dyn Fn(String) + Send + Sync>>,
}

pub struct Session {
    config: SessionConfig,
    transport: Transport,
    clock: SharedClock,
    pipeline: AudioPipeline,
    events: SessionEvents,
    /// Consommé par `run()` ; le canal vit ensuite sur sa pile.
    sink_errors: Option<mpsc::UnboundedReceiver<String>>,
    server: Option<ServerHello>,
    pending_start: Option<PendingStart>,
}

impl Session {
    pub fn new(
        config: SessionConfig,
        clock: SharedClock,
        mut pipeline: AudioPipeline,
        events: SessionEvents,
    ) -> Self {
        let (error_tx, sink_error_rx) = mpsc::unbounded_channel();
        pipeline.set_error_hook(Arc::new(move |message| {
            let _ = error_tx.send(message);
        }));
        if let Some(hook) = events.pipeline_state.clone() {
            pipeline.set_state_hook(hook);
        }

        let transport = Transport::new(&config.url, config.backoff);
        Self {
            config,
            transport,
            clock,
            pipeline,
            events,
            sink_errors: Some(sink_error_rx),
            server: None,
            pending_start: None,
        }
    }

    /// Identité du serveur de la session en cours, si connecté.
    pub fn server_info(&self) -> Option<&ServerHello> {
        self.server.as_ref()
    }

    pub fn session_state(&self) -> SessionState {
        self.transport.current_state()
    }

    pub fn state_watch(&self) -> tokio::sync::watch::Receiver<SessionState> {
        self.transport.state()
    }

    pub fn pipeline_state(&self) -> PipelineState {
        self.pipeline.state()
    }

    pub fn clock_status(&self) -> ClockStatus {
        self.clock.status()
    }

    pub fn stats(&self) -> Option<BufferStats> {
        self.pipeline.stats()
    }

    /// Boucle de vie de la session : connexion (avec backoff), service,
    /// reconnexion sur coupure, sortie propre sur annulation.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<(), SessionError> {
        let mut sink_errors = self
            .sink_errors
            .take()
            .expect("Session::run may only be called once");

        loop {
            let hello = self.client_hello();
            let mut connection = match self.transport.connect_with_backoff(&hello, &cancel).await {
                Ok(connection) => connection,
                Err(SessionError::Cancelled) => return Ok(()),
                Err(other) => return Err(other),
            };

            // Nouvelle session : filtre d'horloge vierge, état annoncé.
            self.server = Some(connection.server_hello.clone());
            self.clock.reset();
            if let Err(e) = connection.sender.send(&self.client_state_message()).await {
                tracing::warn!(error = %e, "Failed to send initial state, reconnecting");
                continue;
            }

            let driver = spawn_sync_driver(
                connection.sender.clone(),
                self.clock.clone(),
                SyncDriverConfig::default(),
                &cancel,
            );

            self.drive_connection(&mut connection, &driver, &mut sink_errors, &cancel)
                .await;

            // Ordre d'arrêt : pilote → pipeline (sink compris) → transport.
            driver.shutdown().await;
            self.pipeline.stop();
            self.pending_start = None;
            self.server = None;

            if cancel.is_cancelled() {
                let goodbye = Message::ClientGoodbye(ClientGoodbye {
                    reason: GoodbyeReason::Shutdown,
                });
                let _ = connection.sender.send(&goodbye).await;
                connection.sender.close().await;
                self.transport.mark_disconnected();
                return Ok(());
            }
            // Coupure inattendue : C3 repart en backoff au tour suivant.
            self.transport.mark_reconnecting();
        }
    }

    /// Sert une connexion établie jusqu'à coupure ou annulation.
    async fn drive_connection(
        &mut self,
        connection: &mut Connection,
        driver: &SyncDriverHandle,
        sink_errors: &mut mpsc::UnboundedReceiver<String>,
        cancel: &CancellationToken,
    ) {
        // Complétions de rafales pré-flux ; le démarrage différé du pipeline
        // se joue ici pour ne jamais bloquer le routage des réponses.
        let (burst_done_tx, mut burst_done) = mpsc::unbounded_channel::<()>();

        loop {
            // Le tampon change à chaque flux ; on recapture son Arc à chaque
            // tour pour attendre la bonne instance.
            let buffer = self.pipeline.buffer();

            tokio::select! {
                _ = cancel.cancelled() => return,

                _ = async {
                    match &buffer {
                        Some(buffer) => buffer.reanchor_required().await,
                        None => std::future::pending().await,
                    }
                } => {
                    tracing::info!("Re-anchor requested, flushing buffer");
                    self.pipeline.clear();
                }

                error = sink_errors.recv() => {
                    if let Some(message) = error {
                        tracing::error!(error = %message, "Audio sink failed");
                        self.pipeline.mark_error();
                        if let Some(hook) = &self.events.error {
                            hook(message);
                        }
                    }
                }

                done = burst_done.recv() => {
                    if done.is_some() {
                        self.on_burst_complete(driver, &burst_done_tx);
                    }
                }

                event = connection.events.recv() => {
                    match event {
                        None => return,
                        Some(InboundEvent::Closed { code, reason }) => {
                            tracing::warn!(code = ?code, reason = %reason, "Connection closed by peer");
                            return;
                        }
                        Some(InboundEvent::Message { message, received_at_micros }) => {
                            self.handle_message(message, received_at_micros, driver, &connection.sender, &burst_done_tx)
                                .await;
                        }
                        Some(InboundEvent::Binary(frame)) => {
                            self.handle_binary(frame);
                        }
                    }
                }
            }
        }
    }

    /// Programme une rafale immédiate et route sa complétion vers la boucle.
    fn burst_then_notify(driver: &SyncDriverHandle, done: mpsc::UnboundedSender<()>) {
        let (ack_tx, ack_rx) = oneshot::channel();
        driver.trigger_burst(ack_tx);
        tokio::spawn(async move {
            let _ = ack_rx.await;
            let _ = done.send(());
        });
    }

    /// La rafale pré-flux est terminée : démarrer le flux en attente, ou
    /// relancer une rafale si la synchro minimale se fait attendre.
    fn on_burst_complete(
        &mut self,
        driver: &SyncDriverHandle,
        burst_done: &mpsc::UnboundedSender<()>,
    ) {
        let Some(pending) = self.pending_start.take() else {
            return;
        };

        if self.config.wait_for_convergence
            && !self.clock.has_minimal_sync()
            && tokio::time::Instant::now() < pending.deadline
        {
            tracing::debug!("Clock not minimally synced yet, running another burst");
            Self::burst_then_notify(driver, burst_done.clone());
            self.pending_start = Some(pending);
            return;
        }
        if !self.clock.has_minimal_sync() {
            tracing::warn!("Starting stream without minimal clock sync");
        }

        if let Err(e) = self
            .pipeline
            .start(pending.format, pending.codec_header.as_deref())
        {
            tracing::error!(error = %e, "Failed to start audio pipeline");
            if let Some(hook) = &self.events.error {
                hook(e.to_string());
            }
        }
    }

    async fn handle_message(
        &mut self,
        message: Message,
        received_at_micros: i64,
        driver: &SyncDriverHandle,
        sender: &WsSender,
        burst_done: &mpsc::UnboundedSender<()>,
    ) {
        match message {
            Message::ServerTime(time) => {
                driver.handle_server_time(time, received_at_micros);
            }
            Message::StreamStart(start) => {
                self.on_stream_start(start, driver, burst_done);
            }
            Message::StreamClear(_) => {
                tracing::info!("Stream clear (seek), flushing buffer");
                self.pipeline.clear();
            }
            Message::StreamEnd(_) => {
                tracing::info!("Stream ended");
                self.pending_start = None;
                self.pipeline.stop();
            }
            Message::ServerCommand(command) => {
                self.on_server_command(command, sender).await;
            }
            Message::ServerState(state) => {
                self.on_server_state(state);
            }
            Message::GroupUpdate(update) => {
                self.on_group_update(update);
            }
            Message::ServerHello(hello) => {
                tracing::debug!(server_id = %hello.server_id, "Server identity refreshed");
                self.server = Some(hello);
            }
            other => {
                tracing::debug!(
                    message_type = other.type_name(),
                    "Ignoring unexpected message"
                );
            }
        }
    }

    fn handle_binary(&mut self, frame: spnproto::BinaryFrame) {
        match frame.kind {
            FrameKind::PlayerAudio { .. } => {
                self.pipeline
                    .process_chunk(frame.timestamp_micros, &frame.payload);
            }
            FrameKind::Artwork { channel } => {
                if let Some(hook) = &self.events.artwork {
                    hook(channel, frame.payload);
                }
            }
            FrameKind::Visualizer { .. } => {
                tracing::trace!("Ignoring visualizer frame (role not active)");
            }
            FrameKind::Unknown { type_id } => {
                tracing::debug!(type_id, "Ignoring unknown binary frame type");
            }
        }
    }

    /// `stream/start` : le format est mis en attente et une rafale de
    /// synchro part immédiatement ; le pipeline démarre à sa complétion
    /// (voir [`Self::on_burst_complete`]).
    fn on_stream_start(
        &mut self,
        start: StreamStart,
        driver: &SyncDriverHandle,
        burst_done: &mpsc::UnboundedSender<()>,
    ) {
        let Some(player) = start.player else {
            tracing::debug!("stream/start without player block, nothing to do");
            return;
        };

        let codec: AudioCodec = match player.codec.parse() {
            Ok(codec) => codec,
            Err(e) => {
                tracing::error!(codec = %player.codec, "Server chose an unsupported codec");
                if let Some(hook) = &self.events.error {
                    hook(e.to_string());
                }
                return;
            }
        };
        let format = AudioFormat {
            codec,
            sample_rate: player.sample_rate,
            channels: u16::from(player.channels),
            bit_depth: Some(player.bit_depth),
        };
        let codec_header = player.codec_header.as_deref().and_then(|encoded| {
            use base64::Engine as _;
            match base64::engine::general_purpose::STANDARD.decode(encoded) {
                Ok(bytes) => Some(bytes),
                Err(e) => {
                    tracing::warn!(error = %e, "Discarding undecodable codec header");
                    None
                }
            }
        });

        tracing::info!(format = %format, target = ?player.timestamp, "Stream announced");

        self.pending_start = Some(PendingStart {
            format,
            codec_header,
            deadline: tokio::time::Instant::now() + self.config.convergence_timeout,
        });
        // Rafale pré-flux : une mesure fraîche avant la première conversion.
        Self::burst_then_notify(driver, burst_done.clone());
    }

    async fn on_server_command(&mut self, command: ServerCommand, sender: &WsSender) {
        let Some(player) = command.player else { return };
        match player.command.as_str() {
            "volume" => {
                if let Some(volume) = player.volume {
                    tracing::info!(volume, "Applying volume command");
                    self.pipeline.set_volume(volume);
                }
            }
            "mute" => {
                if let Some(muted) = player.mute {
                    tracing::info!(muted, "Applying mute command");
                    self.pipeline.set_muted(muted);
                }
            }
            other => {
                tracing::debug!(command = other, "Ignoring unsupported player command");
            }
        }
        // L'état effectif est toujours renvoyé au serveur.
        let _ = sender.send(&self.client_state_message()).await;
    }

    fn on_server_state(&mut self, state: ServerState) {
        if let Some(controller) = state.controller {
            self.pipeline.set_volume(controller.volume);
            self.pipeline.set_muted(controller.muted);
        }
        if let Some(metadata) = state.metadata {
            if let Some(hook) = &self.events.metadata {
                hook(metadata);
            }
        }
    }

    fn on_group_update(&mut self, update: GroupUpdate) {
        if let Some(volume) = update.volume {
            self.pipeline.set_volume(volume);
        }
        if let Some(muted) = update.muted {
            self.pipeline.set_muted(muted);
        }
        tracing::debug!(
            group = update.group_name.as_deref().unwrap_or("?"),
            state = ?update.playback_state,
            "Group update"
        );
    }

    fn client_hello(&self) -> Message {
        Message::ClientHello(ClientHello {
            client_id: self.config.client_id.clone(),
            name: self.config.player_name.clone(),
            version: PROTOCOL_VERSION,
            supported_roles: vec!["player@v1".to_string()],
            device_info: Some(DeviceInfo {
                product_name: Some("SpinPlayer".to_string()),
                manufacturer: None,
                software_version: Some(env!("CARGO_PKG_VERSION").to_string()),
            }),
            player_support: Some(PlayerSupport {
                supported_formats: supported_formats(),
                buffer_capacity: 400,
                supported_commands: vec!["volume".to_string(), "mute".to_string()],
            }),
        })
    }

    fn client_state_message(&self) -> Message {
        Message::ClientState(ClientState {
            player: Some(PlayerState {
                state: PlayerSyncState::Synchronized,
                volume: Some(self.pipeline.volume()),
                muted: Some(self.pipeline.muted()),
            }),
        })
    }
}

/// Formats annoncés dans le client/hello, du préféré au moins préféré.
fn supported_formats() -> Vec<FormatSpec> {
    let mut formats = Vec::new();
    for sample_rate in [48_000u32, 44_100] {
        for (codec, bit_depth) in [("flac", 16u8), ("pcm", 16), ("pcm", 24)] {
            formats.push(FormatSpec {
                codec: codec.to_string(),
                sample_rate,
                channels: 2,
                bit_depth,
            });
        }
    }
    formats.push(FormatSpec {
        codec: "opus".to_string(),
        sample_rate: 48_000,
        channels: 2,
        bit_depth: 16,
    });
    formats
}
