//! Estimateur d'offset et de dérive entre horloge serveur et horloge locale.
//!
//! Le modèle est un filtre de Kalman linéaire à deux états sur des mesures
//! NTP à quatre timestamps :
//!
//! ```text
//! état        x = [offset (µs), dérive (µs/s)]ᵀ,  server = client + offset
//! prédiction  F = [[1, Δt], [0, 1]],  Q = diag(q_offset, q_drift)·Δt
//! mesure      z = ((T2−T1) + (T3−T4)) / 2,  H = [1, 0]
//! bruit       R = R₀ + rtt²/4   (un RTT élevé est moins digne de confiance)
//! ```
//!
//! L'oubli adaptatif élargit la covariance quand l'innovation sort de la
//! plage attendue, ce qui accélère la reconvergence après un saut d'horloge
//! serveur sans dégrader le régime stationnaire.
//!
//! Toutes les valeurs sont en microsecondes (offset) et microsecondes par
//! seconde (dérive) ; Δt est en secondes.

use std::sync::{Arc, Mutex};

use crate::monotonic;

// Covariance initiale : ±1 s sur l'offset, ±1000 µs/s sur la dérive.
const INITIAL_OFFSET_VARIANCE: f64 = 1e12;
const INITIAL_DRIFT_VARIANCE: f64 = 1e6;

// Plancher numérique empêchant l'effondrement de la covariance.
const OFFSET_VARIANCE_FLOOR: f64 = 1.0;
const DRIFT_VARIANCE_FLOOR: f64 = 1e-6;

/// Réglages du filtre. Les valeurs par défaut conviennent à un LAN.
#[derive(Debug, Clone, Copy)]
pub struct KalmanConfig {
    /// Bruit de process sur l'offset, µs²/s.
    pub q_offset: f64,
    /// Bruit de process sur la dérive, µs²/s³.
    pub q_drift: f64,
    /// Bruit de mesure plancher, µs² (≈ (3 ms)²/... voir R ci-dessus).
    pub r0: f64,
    /// Facteur d'oubli (> 1.0 pour activer l'oubli adaptatif).
    pub forget_factor: f64,
    /// Seuil de déclenchement en écarts-types de l'innovation.
    pub adaptive_cutoff: f64,
    /// Nombre de mesures avant d'armer l'oubli adaptatif.
    pub min_samples_for_forgetting: u32,
}

impl Default for KalmanConfig {
    fn default() -> Self {
        Self {
            q_offset: 100.0,
            q_drift: 1.0,
            r0: 10_000.0,
            forget_factor: 1.05,
            adaptive_cutoff: 0.75,
            min_samples_for_forgetting: 100,
        }
    }
}

/// Un échange de synchronisation complet.
///
/// T1/T4 sont sur l'horloge locale (émission/réception du client), T2/T3 sur
/// l'horloge serveur (réception/émission du serveur).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeasurementQuad {
    pub t1: i64,
    pub t2: i64,
    pub t3: i64,
    pub t4: i64,
}

impl MeasurementQuad {
    /// Offset mesuré par la formule NTP, en µs.
    pub fn measured_offset_micros(&self) -> f64 {
        ((self.t2 - self.t1) as f64 + (self.t3 - self.t4) as f64) / 2.0
    }

    /// Temps aller-retour hors temps de traitement serveur, en µs.
    pub fn rtt_micros(&self) -> i64 {
        (self.t4 - self.t1) - (self.t3 - self.t2)
    }
}

/// Instantané en lecture seule de l'état du filtre.
#[derive(Debug, Clone, Copy)]
pub struct ClockStatus {
    pub offset_micros: f64,
    pub drift_micros_per_sec: f64,
    /// Écart-type de l'offset (√P₀₀), µs.
    pub offset_std_micros: f64,
    /// Écart-type de la dérive (√P₁₁), µs/s.
    pub drift_std_micros: f64,
    pub measurement_count: u64,
    pub has_minimal_sync: bool,
    pub is_converged: bool,
    pub is_drift_reliable: bool,
    pub static_delay_micros: i64,
    pub forget_count: u64,
    pub skipped_measurements: u64,
}

/// Filtre de Kalman offset/dérive.
///
/// L'état n'est pas thread-safe ; voir [`SharedClock`] pour le partage entre
/// le pilote de synchronisation et le tampon audio.
#[derive(Debug)]
pub struct ClockFilter {
    config: KalmanConfig,
    offset: f64,
    drift: f64,
    p: [[f64; 2]; 2],
    last_update_micros: i64,
    measurement_count: u64,
    static_delay_micros: i64,
    forget_count: u64,
    skipped_measurements: u64,
}

impl ClockFilter {
    pub fn new(config: KalmanConfig) -> Self {
        Self {
            config,
            offset: 0.0,
            drift: 0.0,
            p: [
                [INITIAL_OFFSET_VARIANCE, 0.0],
                [0.0, INITIAL_DRIFT_VARIANCE],
            ],
            last_update_micros: 0,
            measurement_count: 0,
            static_delay_micros: 0,
            forget_count: 0,
            skipped_measurements: 0,
        }
    }

    /// Repart d'une covariance vierge ; appelé à chaque nouvelle session.
    /// Le délai statique, réglage utilisateur, survit au reset.
    pub fn reset(&mut self) {
        let static_delay = self.static_delay_micros;
        *self = Self::new(self.config);
        self.static_delay_micros = static_delay;
    }

    /// Intègre une mesure. La première initialise l'état sans étape de
    /// prédiction ; un Δt non positif est ignoré avec un avertissement.
    pub fn add_measurement(&mut self, quad: &MeasurementQuad) {
        let z = quad.measured_offset_micros();
        let rtt = quad.rtt_micros() as f64;

        if self.measurement_count == 0 {
            self.offset = z;
            self.last_update_micros = quad.t4;
            self.measurement_count = 1;
            tracing::debug!(
                offset_micros = z,
                rtt_micros = rtt,
                "Clock filter initialized from first measurement"
            );
            return;
        }

        let dt = (quad.t4 - self.last_update_micros) as f64 / 1e6;
        if dt <= 0.0 {
            self.skipped_measurements += 1;
            tracing::warn!(
                dt_seconds = dt,
                "Skipping clock measurement with non-positive dt"
            );
            return;
        }

        // Prédiction : x⁻ = F x, P⁻ = F P Fᵀ + Q·Δt
        self.offset += self.drift * dt;
        let mut p00 = self.p[0][0]
            + dt * (self.p[0][1] + self.p[1][0])
            + dt * dt * self.p[1][1]
            + self.config.q_offset * dt;
        let mut p01 = self.p[0][1] + dt * self.p[1][1];
        let mut p10 = self.p[1][0] + dt * self.p[1][1];
        let mut p11 = self.p[1][1] + self.config.q_drift * dt;

        // Oubli adaptatif : une innovation hors plage élargit la covariance
        // et laisse le filtre suivre un saut d'horloge.
        if self.measurement_count >= u64::from(self.config.min_samples_for_forgetting)
            && self.config.forget_factor > 1.0
        {
            let innovation = z - self.offset;
            if innovation.abs() > self.config.adaptive_cutoff * p00.sqrt() {
                let f2 = self.config.forget_factor * self.config.forget_factor;
                p00 *= f2;
                p01 *= f2;
                p10 *= f2;
                p11 *= f2;
                self.forget_count += 1;
                tracing::debug!(
                    innovation_micros = innovation,
                    offset_std_micros = p00.sqrt(),
                    "Adaptive forgetting triggered"
                );
            }
        }

        // Mise à jour : S = P⁻₀₀ + R, K = P⁻ Hᵀ / S
        let r = self.config.r0 + rtt * rtt / 4.0;
        let s = p00 + r;
        let k0 = p00 / s;
        let k1 = p10 / s;
        let innovation = z - self.offset;

        self.offset += k0 * innovation;
        self.drift += k1 * innovation;

        let new_p00 = (1.0 - k0) * p00;
        let new_p01 = (1.0 - k0) * p01;
        let new_p10 = p10 - k1 * p00;
        let new_p11 = p11 - k1 * p01;

        // Symétrisation + plancher : P doit rester définie positive malgré
        // l'arithmétique flottante.
        let off_diag = (new_p01 + new_p10) / 2.0;
        self.p[0][0] = new_p00.max(OFFSET_VARIANCE_FLOOR);
        self.p[0][1] = off_diag;
        self.p[1][0] = off_diag;
        self.p[1][1] = new_p11.max(DRIFT_VARIANCE_FLOOR);

        self.last_update_micros = quad.t4;
        self.measurement_count += 1;

        tracing::trace!(
            offset_micros = self.offset,
            drift_micros_per_sec = self.drift,
            offset_std_micros = self.p[0][0].sqrt(),
            rtt_micros = rtt,
            count = self.measurement_count,
            "Clock measurement applied"
        );
    }

    /// Assez de mesures pour démarrer la lecture.
    pub fn has_minimal_sync(&self) -> bool {
        self.measurement_count >= 2
    }

    /// L'offset est stabilisé sous la milliseconde.
    pub fn is_converged(&self) -> bool {
        self.measurement_count >= 5 && self.p[0][0].sqrt() < 1_000.0
    }

    /// La dérive est assez sûre pour extrapoler entre deux mesures.
    pub fn is_drift_reliable(&self) -> bool {
        self.measurement_count >= 5 && self.p[1][1].sqrt() < 50.0
    }

    pub fn offset_std_micros(&self) -> f64 {
        self.p[0][0].sqrt()
    }

    pub fn measurement_count(&self) -> u64 {
        self.measurement_count
    }

    /// Décalage utilisateur ajouté à chaque conversion serveur→local.
    /// Positif = jouer plus tard.
    pub fn set_static_delay_micros(&mut self, delay: i64) {
        self.static_delay_micros = delay;
    }

    fn extrapolated_offset(&self, dt_seconds: f64) -> f64 {
        if self.is_drift_reliable() {
            self.offset + self.drift * dt_seconds
        } else {
            self.offset
        }
    }

    /// Convertit un instant local en temps serveur.
    /// Indéfini avant la première mesure.
    pub fn client_to_server_micros(&self, client_micros: i64) -> Option<i64> {
        if self.measurement_count == 0 {
            return None;
        }
        let dt = (client_micros - self.last_update_micros) as f64 / 1e6;
        Some(client_micros + self.extrapolated_offset(dt).round() as i64)
    }

    /// Convertit un instant serveur en temps local, délai statique inclus.
    /// Indéfini avant la première mesure.
    pub fn server_to_client_micros(&self, server_micros: i64) -> Option<i64> {
        if self.measurement_count == 0 {
            return None;
        }
        // Δt approché : l'instant local correspondant n'est pas encore connu,
        // on retranche l'offset courant pour l'estimer.
        let dt = (server_micros as f64 - self.offset - self.last_update_micros as f64) / 1e6;
        let total_offset = self.extrapolated_offset(dt);
        Some((server_micros as f64 - total_offset).round() as i64 + self.static_delay_micros)
    }

    pub fn status(&self) -> ClockStatus {
        ClockStatus {
            offset_micros: self.offset,
            drift_micros_per_sec: self.drift,
            offset_std_micros: self.p[0][0].sqrt(),
            drift_std_micros: self.p[1][1].sqrt(),
            measurement_count: self.measurement_count,
            has_minimal_sync: self.has_minimal_sync(),
            is_converged: self.is_converged(),
            is_drift_reliable: self.is_drift_reliable(),
            static_delay_micros: self.static_delay_micros,
            forget_count: self.forget_count,
            skipped_measurements: self.skipped_measurements,
        }
    }
}

/// Filtre partagé entre le pilote de synchronisation (écrivain) et le tampon
/// audio (une conversion par écriture). Chaque opération prend le verrou pour
/// toute sa durée ; les conversions sont O(1), le temps de détention est
/// négligeable.
#[derive(Debug, Clone)]
pub struct SharedClock {
    inner: Arc<Mutex<ClockFilter>>,
}

impl SharedClock {
    pub fn new(config: KalmanConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ClockFilter::new(config))),
        }
    }

    /// Reset du filtre + compteurs de l'horloge monotone ; nouvelle session.
    pub fn reset(&self) {
        self.inner.lock().unwrap().reset();
        monotonic::global().reset_diagnostics();
    }

    pub fn add_measurement(&self, quad: &MeasurementQuad) {
        self.inner.lock().unwrap().add_measurement(quad);
    }

    pub fn has_minimal_sync(&self) -> bool {
        self.inner.lock().unwrap().has_minimal_sync()
    }

    pub fn is_converged(&self) -> bool {
        self.inner.lock().unwrap().is_converged()
    }

    pub fn offset_std_micros(&self) -> f64 {
        self.inner.lock().unwrap().offset_std_micros()
    }

    pub fn measurement_count(&self) -> u64 {
        self.inner.lock().unwrap().measurement_count()
    }

    pub fn set_static_delay_micros(&self, delay: i64) {
        self.inner.lock().unwrap().set_static_delay_micros(delay);
    }

    pub fn client_to_server_micros(&self, client_micros: i64) -> Option<i64> {
        self.inner.lock().unwrap().client_to_server_micros(client_micros)
    }

    pub fn server_to_client_micros(&self, server_micros: i64) -> Option<i64> {
        self.inner.lock().unwrap().server_to_client_micros(server_micros)
    }

    pub fn status(&self) -> ClockStatus {
        self.inner.lock().unwrap().status()
    }
}
