//! Canal de session WebSocket : connexion, handshake, routage des trames.
//!
//! Le canal est full-duplex : les messages JSON (contrôle) et les trames
//! binaires (audio, artwork) arrivent entrelacés. Une tâche de routage les
//! classe et les pousse sur un canal mpsc vers l'orchestrateur. T4 est
//! tamponné DANS la tâche de routage, au plus près de la réception.
//!
//! # États
//!
//! ```text
//! Disconnected ──► Connecting ──► Handshaking ──► Connected
//!       ▲               ▲                             │
//!       │               └──────── Reconnecting ◄──────┘ (coupure)
//!       └──────────────── disconnect() ───────────────┘
//! ```
//!
//! Les envois sont totalement ordonnés : un unique mutex async sérialise
//! l'accès à la moitié émettrice, un message n'est jamais entrelacé avec un
//! autre sur le fil.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use spnproto::{parse_message, serialize_message, BinaryFrame, Message, ServerHello};
use spnsync::monotonic;

use crate::SessionError;

/// Chemin par défaut ajouté aux URLs sans chemin explicite.
pub const DEFAULT_WS_PATH: &str = "/sendspin";

/// Délai maximal d'attente du server/hello.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

type WsWriter = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;
type WsReader = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// État du canal de session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Handshaking,
    Connected,
    Reconnecting,
}

/// Reconnexion à backoff exponentiel :
/// `delay = min(max, base × multiplier^(tentative−1))`.
#[derive(Debug, Clone, Copy)]
pub struct BackoffConfig {
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            multiplier: 1.5,
            max_delay_ms: 30_000,
        }
    }
}

impl BackoffConfig {
    /// Délai avant la tentative `attempt` (1-indexée).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let millis = (self.base_delay_ms as f64 * factor).min(self.max_delay_ms as f64);
        Duration::from_millis(millis as u64)
    }
}

/// Événement entrant, déjà classé par la tâche de routage.
#[derive(Debug)]
pub enum InboundEvent {
    /// Message JSON reconnu, avec l'heure locale de réception (sert de T4
    /// aux réponses de synchronisation).
    Message {
        message: Message,
        received_at_micros: i64,
    },
    /// Trame binaire (audio, artwork, visualiseur ou inconnue).
    Binary(BinaryFrame),
    /// Le pair a fermé le canal.
    Closed {
        code: Option<u16>,
        reason: String,
    },
}

/// Moitié émettrice, clonable, à envois sérialisés.
#[derive(Clone)]
pub struct WsSender {
    writer: Arc<tokio::sync::Mutex<WsWriter>>,
    closed: Arc<AtomicBool>,
}

impl WsSender {
    fn new(writer: WsWriter) -> Self {
        Self {
            writer: Arc::new(tokio::sync::Mutex::new(writer)),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Envoie un message de contrôle. Les appels concurrents sont sérialisés
    /// par le mutex : l'ordre d'acceptation est l'ordre sur le fil.
    pub async fn send(&self, message: &Message) -> Result<(), SessionError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SessionError::Cancelled);
        }
        let json = serialize_message(message)?;
        tracing::trace!(message_type = message.type_name(), "Sending message");

        let mut writer = self.writer.lock().await;
        writer
            .send(WsMessage::Text(json))
            .await
            .map_err(|e| SessionError::WebSocket(e.to_string()))
    }

    /// Variante annulable : l'abandon rend `Cancelled` et ne laisse pas le
    /// canal dans un état bancal (le message part entier ou pas du tout).
    pub async fn send_cancellable(
        &self,
        message: &Message,
        cancel: &CancellationToken,
    ) -> Result<(), SessionError> {
        tokio::select! {
            result = self.send(message) => result,
            _ = cancel.cancelled() => Err(SessionError::Cancelled),
        }
    }

    /// Ferme proprement le canal. Idempotent ; les envois suivants échouent
    /// avec `Cancelled`.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut writer = self.writer.lock().await;
        let _ = writer.send(WsMessage::Close(None)).await;
    }
}

/// Une connexion établie et authentifiée (handshake terminé).
pub struct Connection {
    pub sender: WsSender,
    pub events: mpsc::UnboundedReceiver<InboundEvent>,
    pub server_hello: ServerHello,
}

/// Fabrique de connexions avec suivi d'état et backoff.
pub struct Transport {
    url: String,
    backoff: BackoffConfig,
    handshake_timeout: Duration,
    state_tx: watch::Sender<SessionState>,
}

impl Transport {
    pub fn new(url: &str, backoff: BackoffConfig) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Disconnected);
        Self {
            url: normalize_url(url),
            backoff,
            handshake_timeout: HANDSHAKE_TIMEOUT,
            state_tx,
        }
    }

    /// Raccourcit le timeout de handshake (tests).
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Abonnement aux changements d'état.
    pub fn state(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    pub fn current_state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, state: SessionState) {
        if *self.state_tx.borrow() != state {
            tracing::info!(state = ?state, "Session transport state");
            self.state_tx.send_replace(state);
        }
    }

    /// Marque le canal fermé côté orchestrateur.
    pub fn mark_disconnected(&self) {
        self.set_state(SessionState::Disconnected);
    }

    /// Coupure inattendue : l'orchestrateur va retenter.
    pub fn mark_reconnecting(&self) {
        self.set_state(SessionState::Reconnecting);
    }

    /// Une tentative de connexion complète : ouverture, client/hello,
    /// attente du server/hello sous timeout.
    pub async fn connect(
        &self,
        hello: &Message,
        cancel: &CancellationToken,
    ) -> Result<Connection, SessionError> {
        self.set_state(SessionState::Connecting);

        let connect = connect_async(self.url.as_str());
        let (ws_stream, _) = tokio::select! {
            result = connect => result.map_err(|e| SessionError::Connect(e.to_string()))?,
            _ = cancel.cancelled() => return Err(SessionError::Cancelled),
        };

        self.set_state(SessionState::Handshaking);
        let (mut writer, mut reader) = ws_stream.split();

        let hello_json = serialize_message(hello)?;
        writer
            .send(WsMessage::Text(hello_json))
            .await
            .map_err(|e| SessionError::WebSocket(e.to_string()))?;

        let server_hello = tokio::select! {
            result = tokio::time::timeout(self.handshake_timeout, wait_server_hello(&mut reader)) => {
                match result {
                    Ok(hello) => hello?,
                    Err(_) => {
                        tracing::warn!("Handshake timed out");
                        return Err(SessionError::HandshakeTimeout);
                    }
                }
            }
            _ = cancel.cancelled() => return Err(SessionError::Cancelled),
        };

        tracing::info!(
            server_id = %server_hello.server_id,
            server_name = %server_hello.name,
            "Handshake complete"
        );

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        tokio::spawn(route_incoming(reader, event_tx));

        self.set_state(SessionState::Connected);
        Ok(Connection {
            sender: WsSender::new(writer),
            events: event_rx,
            server_hello,
        })
    }

    /// Boucle de connexion avec backoff. Chaque handshake réussi remet le
    /// compteur de tentatives à zéro (une nouvelle invocation repart à 1).
    pub async fn connect_with_backoff(
        &self,
        hello: &Message,
        cancel: &CancellationToken,
    ) -> Result<Connection, SessionError> {
        let mut attempt = 0u32;
        loop {
            if cancel.is_cancelled() {
                self.set_state(SessionState::Disconnected);
                return Err(SessionError::Cancelled);
            }

            match self.connect(hello, cancel).await {
                Ok(connection) => return Ok(connection),
                Err(SessionError::Cancelled) => {
                    self.set_state(SessionState::Disconnected);
                    return Err(SessionError::Cancelled);
                }
                Err(error) => {
                    attempt += 1;
                    let delay = self.backoff.delay_for_attempt(attempt);
                    tracing::warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Connection attempt failed, backing off"
                    );
                    self.set_state(SessionState::Reconnecting);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => {
                            self.set_state(SessionState::Disconnected);
                            return Err(SessionError::Cancelled);
                        }
                    }
                }
            }
        }
    }
}

/// Attend le server/hello ; tout autre message de contrôle pendant le
/// handshake est une violation de protocole.
async fn wait_server_hello(reader: &mut WsReader) -> Result<ServerHello, SessionError> {
    loop {
        let frame = reader
            .next()
            .await
            .ok_or_else(|| SessionError::Connect("closed during handshake".to_string()))?
            .map_err(|e| SessionError::WebSocket(e.to_string()))?;

        match frame {
            WsMessage::Text(text) => match parse_message(&text)? {
                Some(Message::ServerHello(hello)) => return Ok(hello),
                Some(other) => {
                    return Err(SessionError::Protocol(format!(
                        "expected server/hello, got {}",
                        other.type_name()
                    )));
                }
                // Type inconnu : toléré même pendant le handshake.
                None => continue,
            },
            WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Binary(_) => continue,
            WsMessage::Close(frame) => {
                let (code, reason) = match frame {
                    Some(f) => (Some(u16::from(f.code)), f.reason.to_string()),
                    None => (None, String::new()),
                };
                return Err(SessionError::ClosedByPeer { code, reason });
            }
            _ => continue,
        }
    }
}

/// Tâche de routage : classe chaque trame entrante et la pousse vers
/// l'orchestrateur. Une trame invalide est journalisée puis oubliée, la
/// session continue.
async fn route_incoming(mut reader: WsReader, events: mpsc::UnboundedSender<InboundEvent>) {
    while let Some(result) = reader.next().await {
        match result {
            Ok(WsMessage::Text(text)) => {
                // T4 : au plus près de la réception, avant tout traitement.
                let received_at_micros = monotonic::now_micros();
                match parse_message(&text) {
                    Ok(Some(message)) => {
                        if events
                            .send(InboundEvent::Message {
                                message,
                                received_at_micros,
                            })
                            .is_err()
                        {
                            return;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!(error = %e, "Discarding unparsable message");
                    }
                }
            }
            Ok(WsMessage::Binary(data)) => match BinaryFrame::parse(&data) {
                Ok(frame) => {
                    if events.send(InboundEvent::Binary(frame)).is_err() {
                        return;
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Discarding truncated binary frame");
                }
            },
            Ok(WsMessage::Close(frame)) => {
                let (code, reason) = match frame {
                    Some(f) => (Some(u16::from(f.code)), f.reason.to_string()),
                    None => (None, String::new()),
                };
                let _ = events.send(InboundEvent::Closed { code, reason });
                return;
            }
            Ok(WsMessage::Ping(_)) | Ok(WsMessage::Pong(_)) => {}
            Ok(_) => {}
            Err(e) => {
                let _ = events.send(InboundEvent::Closed {
                    code: None,
                    reason: e.to_string(),
                });
                return;
            }
        }
    }

    let _ = events.send(InboundEvent::Closed {
        code: None,
        reason: "stream ended".to_string(),
    });
}

/// Ajoute le chemin par défaut aux URLs qui n'en précisent pas.
pub fn normalize_url(url: &str) -> String {
    let after_scheme = match url.find("://") {
        Some(pos) => &url[pos + 3..],
        None => return format!("ws://{}{}", url, DEFAULT_WS_PATH),
    };
    if after_scheme.contains('/') {
        url.to_string()
    } else {
        format!("{}{}", url, DEFAULT_WS_PATH)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_schedule() {
        let backoff = BackoffConfig::default();
        assert_eq!(backoff.delay_for_attempt(1), Duration::from_millis(1_000));
        assert_eq!(backoff.delay_for_attempt(2), Duration::from_millis(1_500));
        assert_eq!(backoff.delay_for_attempt(3), Duration::from_millis(2_250));
        // Plafonné à 30 s.
        assert_eq!(backoff.delay_for_attempt(50), Duration::from_millis(30_000));
    }

    #[test]
    fn test_url_normalization() {
        assert_eq!(
            normalize_url("ws://10.0.0.5:8927"),
            "ws://10.0.0.5:8927/sendspin"
        );
        assert_eq!(
            normalize_url("ws://10.0.0.5:8927/custom"),
            "ws://10.0.0.5:8927/custom"
        );
        assert_eq!(
            normalize_url("10.0.0.5:8927"),
            "ws://10.0.0.5:8927/sendspin"
        );
    }
}
