//! Source de temps monotone microseconde, filtrée contre les sauts.
//!
//! Toutes les horloges du lecteur (timestamps T1/T4, temps de lecture passé
//! au tampon audio) proviennent d'ici. Deux anomalies du compteur sous-jacent
//! sont absorbées :
//!
//! - **Recul** : si la source brute recule, la valeur précédente est retenue
//!   jusqu'à ce que la source la dépasse à nouveau.
//! - **Saut avant** : un delta supérieur au seuil (50 ms par défaut) est
//!   écrêté au seuil. Une vraie dérive s'accumule à ≪ 1 ms/s et n'est donc
//!   jamais écrêtée ; seuls les artefacts d'hyperviseur le sont.
//!
//! Les compteurs de diagnostic sont cumulatifs et remis à zéro au début de
//! chaque session de lecture via [`MonotonicClock::reset_diagnostics`].

use std::sync::Mutex;
use std::time::Instant;

use once_cell::sync::Lazy;

/// Seuil d'écrêtage des sauts avant, en microsecondes.
pub const DEFAULT_JUMP_THRESHOLD_MICROS: i64 = 50_000;

/// Compteurs cumulés de l'horloge monotone.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClockDiagnostics {
    /// Nombre total d'appels à `now_micros`.
    pub calls: u64,
    /// Sauts avant écrêtés au seuil.
    pub clamped_forward: u64,
    /// Reculs retenus (valeur précédente restituée).
    pub held_backward: u64,
    /// Plus grand saut avant observé (µs).
    pub max_forward_jump_micros: i64,
    /// Plus grand recul observé (µs).
    pub max_backward_jump_micros: i64,
}

/// Filtre de sauts pur, séparé de la source `Instant` pour être testable
/// avec des valeurs brutes injectées.
#[derive(Debug)]
struct JumpFilter {
    threshold_micros: i64,
    initialized: bool,
    last_raw: i64,
    last_returned: i64,
    diag: ClockDiagnostics,
}

impl JumpFilter {
    fn new(threshold_micros: i64) -> Self {
        Self {
            threshold_micros,
            initialized: false,
            last_raw: 0,
            last_returned: 0,
            diag: ClockDiagnostics::default(),
        }
    }

    fn filter(&mut self, raw: i64) -> i64 {
        self.diag.calls += 1;

        if !self.initialized {
            self.initialized = true;
            self.last_raw = raw;
            self.last_returned = raw;
            return raw;
        }

        let delta = raw - self.last_raw;

        if delta < 0 {
            // La source a reculé : on gèle la valeur restituée jusqu'à ce que
            // la source repasse devant last_raw.
            self.diag.held_backward += 1;
            self.diag.max_backward_jump_micros = self.diag.max_backward_jump_micros.max(-delta);
            return self.last_returned;
        }

        let advance = if delta > self.threshold_micros {
            self.diag.clamped_forward += 1;
            self.diag.max_forward_jump_micros = self.diag.max_forward_jump_micros.max(delta);
            self.threshold_micros
        } else {
            delta
        };

        self.last_raw = raw;
        self.last_returned += advance;
        self.last_returned
    }

    fn reset_diagnostics(&mut self) {
        self.diag = ClockDiagnostics::default();
    }
}

/// Horloge monotone microseconde à origine arbitraire.
///
/// L'instance globale est accessible par [`now_micros`] ; des instances
/// dédiées ne servent qu'aux tests.
#[derive(Debug)]
pub struct MonotonicClock {
    origin: Instant,
    filter: Mutex<JumpFilter>,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self::with_threshold(DEFAULT_JUMP_THRESHOLD_MICROS)
    }

    pub fn with_threshold(threshold_micros: i64) -> Self {
        Self {
            origin: Instant::now(),
            filter: Mutex::new(JumpFilter::new(threshold_micros)),
        }
    }

    /// Microsecondes écoulées depuis l'origine, jamais décroissantes.
    pub fn now_micros(&self) -> i64 {
        let raw = self.origin.elapsed().as_micros() as i64;
        self.filter.lock().unwrap().filter(raw)
    }

    /// Instantané des compteurs de diagnostic.
    pub fn diagnostics(&self) -> ClockDiagnostics {
        self.filter.lock().unwrap().diag
    }

    /// Remise à zéro des compteurs, appelée au début d'une session.
    pub fn reset_diagnostics(&self) {
        self.filter.lock().unwrap().reset_diagnostics();
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

static GLOBAL_CLOCK: Lazy<MonotonicClock> = Lazy::new(MonotonicClock::new);

/// Horloge monotone du process.
pub fn global() -> &'static MonotonicClock {
    &GLOBAL_CLOCK
}

/// Raccourci sur l'horloge globale.
pub fn now_micros() -> i64 {
    GLOBAL_CLOCK.now_micros()
}
