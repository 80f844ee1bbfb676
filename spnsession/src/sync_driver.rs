//! Pilote de synchronisation d'horloge : rafales de `client/time`.
//!
//! Une rafale envoie 8 sondes espacées de 50 ms, attend encore 100 ms que
//! les réponses rentrent, puis ne retient QUE le quadruplet au RTT minimal :
//! c'est l'échantillon le moins pollué par les files d'attente réseau. Les
//! autres sont jetés.
//!
//! L'intervalle entre rafales s'adapte à l'incertitude du filtre : on sonde
//! vite tant que l'offset est flou, puis de moins en moins souvent.

use std::collections::HashSet;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use spnproto::{ClientTime, Message, ServerTime};
use spnsync::{monotonic, MeasurementQuad, SharedClock};

use crate::WsSender;

/// Réglages d'une rafale.
#[derive(Debug, Clone, Copy)]
pub struct SyncDriverConfig {
    pub burst_len: usize,
    pub burst_spacing: Duration,
    /// Fenêtre supplémentaire après la dernière sonde.
    pub settle: Duration,
}

impl Default for SyncDriverConfig {
    fn default() -> Self {
        Self {
            burst_len: 8,
            burst_spacing: Duration::from_millis(50),
            settle: Duration::from_millis(100),
        }
    }
}

/// Réponse serveur horodatée à la réception (T4).
type StampedServerTime = (ServerTime, i64);

/// Poignée de contrôle du pilote, côté orchestrateur.
pub struct SyncDriverHandle {
    response_tx: mpsc::UnboundedSender<StampedServerTime>,
    request_tx: mpsc::UnboundedSender<oneshot::Sender<()>>,
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

impl SyncDriverHandle {
    /// Route une réponse `server/time` vers la rafale en cours.
    pub fn handle_server_time(&self, message: ServerTime, received_at_micros: i64) {
        let _ = self.response_tx.send((message, received_at_micros));
    }

    /// Déclenche une rafale immédiate ; `ack` est signalé à sa complétion.
    pub fn trigger_burst(&self, ack: oneshot::Sender<()>) {
        let _ = self.request_tx.send(ack);
    }

    /// Déclenche une rafale immédiate et attend sa fin.
    pub async fn request_burst(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.trigger_burst(ack_tx);
        let _ = ack_rx.await;
    }

    /// Arrêt coopératif ; le pilote sort en moins d'une fenêtre de rafale.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

/// Démarre le pilote sur une connexion établie.
pub fn spawn_sync_driver(
    sender: WsSender,
    clock: SharedClock,
    config: SyncDriverConfig,
    parent_cancel: &CancellationToken,
) -> SyncDriverHandle {
    let (response_tx, response_rx) = mpsc::unbounded_channel();
    let (request_tx, request_rx) = mpsc::unbounded_channel();
    let cancel = parent_cancel.child_token();

    let driver = SyncDriver {
        sender,
        clock,
        config,
        responses: response_rx,
        requests: request_rx,
        cancel: cancel.clone(),
    };
    let task = tokio::spawn(driver.run());

    SyncDriverHandle {
        response_tx,
        request_tx,
        cancel,
        task,
    }
}

struct SyncDriver {
    sender: WsSender,
    clock: SharedClock,
    config: SyncDriverConfig,
    responses: mpsc::UnboundedReceiver<StampedServerTime>,
    requests: mpsc::UnboundedReceiver<oneshot::Sender<()>>,
    cancel: CancellationToken,
}

impl SyncDriver {
    async fn run(mut self) {
        tracing::debug!("Sync driver started");
        let mut pending_acks: Vec<oneshot::Sender<()>> = Vec::new();

        loop {
            self.run_burst().await;

            // Les demandes arrivées pendant la rafale sont servies par elle.
            while let Ok(ack) = self.requests.try_recv() {
                pending_acks.push(ack);
            }
            for ack in pending_acks.drain(..) {
                let _ = ack.send(());
            }

            if self.cancel.is_cancelled() {
                break;
            }

            let interval = self.adaptive_interval();
            tracing::trace!(interval_ms = interval.as_millis() as u64, "Next sync burst");
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
                request = self.requests.recv() => {
                    // Rafale immédiate demandée (pré-flux).
                    if let Some(ack) = request {
                        pending_acks.push(ack);
                    }
                }
            }
        }
        tracing::debug!("Sync driver stopped");
    }

    /// Intervalle entre rafales selon √variance de l'offset.
    fn adaptive_interval(&self) -> Duration {
        let status = self.clock.status();
        let millis = if status.measurement_count < 3 {
            500
        } else if status.offset_std_micros < 1_000.0 {
            10_000
        } else if status.offset_std_micros < 2_000.0 {
            5_000
        } else if status.offset_std_micros < 5_000.0 {
            2_000
        } else {
            1_000
        };
        Duration::from_millis(millis)
    }

    /// Une rafale complète : émission, collecte, sélection du meilleur RTT.
    async fn run_burst(&mut self) {
        let mut outstanding: HashSet<i64> = HashSet::with_capacity(self.config.burst_len);
        let mut best: Option<MeasurementQuad> = None;

        // Vider les réponses périmées d'une rafale précédente.
        while self.responses.try_recv().is_ok() {}

        for _ in 0..self.config.burst_len {
            if self.cancel.is_cancelled() {
                return;
            }

            let t1 = monotonic::now_micros();
            let probe = Message::ClientTime(ClientTime {
                client_transmitted: t1,
            });
            if let Err(e) = self.sender.send(&probe).await {
                tracing::warn!(error = %e, "Aborting sync burst, send failed");
                return;
            }
            outstanding.insert(t1);

            let deadline = Instant::now() + self.config.burst_spacing;
            self.collect_until(deadline, &mut outstanding, &mut best).await;
        }

        let deadline = Instant::now() + self.config.settle;
        self.collect_until(deadline, &mut outstanding, &mut best).await;

        match best {
            Some(quad) => {
                tracing::debug!(
                    rtt_micros = quad.rtt_micros(),
                    "Feeding best burst sample to clock filter"
                );
                self.clock.add_measurement(&quad);
            }
            None => {
                tracing::warn!("Sync burst received no usable response");
            }
        }
    }

    /// Collecte les réponses jusqu'à l'échéance, en gardant le RTT minimal.
    async fn collect_until(
        &mut self,
        deadline: Instant,
        outstanding: &mut HashSet<i64>,
        best: &mut Option<MeasurementQuad>,
    ) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep_until(deadline) => return,
                response = self.responses.recv() => {
                    let Some((message, t4)) = response else { return };
                    // Une réponse qui ne correspond à aucune sonde de CETTE
                    // rafale est périmée : on l'ignore.
                    if !outstanding.remove(&message.client_transmitted) {
                        tracing::trace!("Ignoring stale server/time response");
                        continue;
                    }
                    let quad = MeasurementQuad {
                        t1: message.client_transmitted,
                        t2: message.server_received,
                        t3: message.server_transmitted,
                        t4,
                    };
                    let better = match best {
                        None => true,
                        Some(current) => quad.rtt_micros() < current.rtt_micros(),
                    };
                    if better {
                        *best = Some(quad);
                    }
                }
            }
        }
    }
}
