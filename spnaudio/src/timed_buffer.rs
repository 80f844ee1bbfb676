//! Tampon audio temporel - le cœur de la synchronisation fine.
//!
//! Un producteur (le thread de réception réseau) écrit des échantillons
//! décodés accompagnés de leur timestamp serveur ; un consommateur (le
//! callback temps réel du sink) les relit au rythme du matériel. Un seul
//! mutex protège tout l'état ; chaque opération publique le tient pour
//! toute sa durée.
//!
//! # Architecture
//!
//! ```text
//! réseau ──write(samples, ts_serveur)──►  ┌───────────────┐
//!            conversion ts via l'horloge  │  ring f32     │
//!            partagée, un segment par     │  + FIFO de    │──read(out, now)──► sink
//!            écriture                     │    segments   │    correction drop/insert
//!                                         └───────────────┘
//! ```
//!
//! # Correction de synchronisation
//!
//! L'erreur mesurée est l'avance du curseur de lecture sur sa position
//! idéale :
//!
//! ```text
//! sync_error = (Δt_mur − latence_sortie) − Δt_lu
//! ```
//!
//! où `Δt_lu` est la progression du temps de présentation visé (porté par
//! les segments, donc sensible à l'offset et à la dérive de l'horloge
//! serveur), rebasée au démarrage de la lecture. Erreur positive : on est en
//! retard, on saute des frames. Négative : on est en avance, on en insère.
//! Au-delà de ±500 ms la correction fine n'a plus de sens : le tampon
//! demande un ré-ancrage complet (événement coalescé par CAS, au plus un en
//! vol).
//!
//! Le démarrage n'attend PAS l'heure visée du premier segment : le serveur
//! envoie l'audio avec plusieurs secondes d'avance et le rattrapage est du
//! ressort de la correction, pas d'une attente bloquante.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use tokio::sync::Notify;

use spnsync::SharedClock;

use crate::{AudioError, AudioFormat};

/// Zone morte : en deçà, aucune correction.
const SYNC_DEADBAND_MICROS: i64 = 2_000;
/// Au-delà, ré-ancrage complet plutôt que correction fine.
const REANCHOR_THRESHOLD_MICROS: i64 = 500_000;
/// Durée de sortie pendant laquelle la correction est suspendue.
const STARTUP_GRACE_MICROS: i64 = 500_000;
/// Horizon de résorption d'une erreur, en secondes.
const CORRECTION_TARGET_SECONDS: f64 = 2.0;
/// Vitesse maximale de correction (fraction du débit nominal).
const MAX_CORRECTION_SPEED: f64 = 0.04;
/// Espacement minimal entre deux corrections, en frames.
const MIN_CORRECTION_INTERVAL_FRAMES: u32 = 10;

/// Stratégie de correction en cours.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorrectionMode {
    /// Dans la zone morte : copie directe.
    None,
    /// En retard : consommer deux frames pour une émise, toutes les N frames.
    Dropping,
    /// En avance : réémettre la dernière frame sans consommer, toutes les N.
    Inserting,
}

/// Instantané en lecture seule des statistiques du tampon.
#[derive(Debug, Clone, Copy)]
pub struct BufferStats {
    pub buffered_ms: f64,
    pub target_ms: f64,
    pub underruns: u64,
    pub overruns: u64,
    /// Échantillons perdus par débordement de capacité.
    pub dropped_samples: u64,
    pub samples_written: u64,
    pub samples_read: u64,
    pub sync_error_micros: i64,
    pub correction_mode: CorrectionMode,
    pub samples_dropped_for_sync: u64,
    pub samples_inserted_for_sync: u64,
}

/// Rattache un bloc contigu d'échantillons du ring à son heure de
/// présentation locale. `local_playback_micros` suit le premier échantillon
/// non consommé du segment.
#[derive(Debug)]
struct Segment {
    local_playback_micros: i64,
    samples: usize,
}

struct BufferState {
    ring: Vec<f32>,
    capacity: usize,
    channels: usize,
    micros_per_frame: f64,
    read_pos: usize,
    write_pos: usize,
    occupied: usize,
    segments: VecDeque<Segment>,

    playback_started: bool,
    playback_start_local_micros: i64,
    /// Heure visée du premier échantillon consommé après le démarrage ;
    /// l'erreur de synchro est rebasée dessus.
    intended_start_micros: i64,
    samples_read_since_start: u64,
    samples_output_since_start: u64,

    output_latency_micros: i64,
    sync_error_micros: i64,
    correction_mode: CorrectionMode,
    correction_interval_frames: u32,
    frames_since_correction: u32,
    last_output_frame: Vec<f32>,
    have_last_frame: bool,
    reanchor_armed: bool,
    disposed: bool,

    underruns: u64,
    overruns: u64,
    dropped_overflow_samples: u64,
    samples_written_total: u64,
    samples_read_total: u64,
    samples_dropped_for_sync: u64,
    samples_inserted_for_sync: u64,

    last_stats_log: Option<Instant>,
}

impl BufferState {
    /// Heure de présentation visée du curseur de lecture.
    fn intended_cursor_micros(&self) -> Option<i64> {
        self.segments.front().map(|s| s.local_playback_micros)
    }

    fn frames_available(&self) -> usize {
        self.occupied / self.channels
    }

    /// Avance le curseur de lecture de `count` échantillons et met à jour le
    /// FIFO de segments. Invariant : Σ segments == occupation du ring.
    fn advance_read(&mut self, count: usize) {
        debug_assert!(count <= self.occupied);
        self.read_pos = (self.read_pos + count) % self.capacity;
        self.occupied -= count;
        self.samples_read_since_start += count as u64;
        self.samples_read_total += count as u64;

        let mut remaining = count;
        while remaining > 0 {
            let channels = self.channels;
            let micros_per_frame = self.micros_per_frame;
            let front = self
                .segments
                .front_mut()
                .expect("segment FIFO out of sync with ring occupancy");
            let taken = remaining.min(front.samples);
            front.samples -= taken;
            front.local_playback_micros +=
                ((taken / channels) as f64 * micros_per_frame).round() as i64;
            remaining -= taken;
            if front.samples == 0 {
                self.segments.pop_front();
            }
        }
    }

    /// Copie une frame du ring vers `dst` sans avancer le curseur.
    fn peek_frame(&self, dst: &mut [f32]) {
        for (i, value) in dst.iter_mut().enumerate().take(self.channels) {
            *value = self.ring[(self.read_pos + i) % self.capacity];
        }
    }

    fn maybe_log_stats(&mut self) {
        let now = Instant::now();
        let due = match self.last_stats_log {
            None => true,
            Some(last) => now.duration_since(last).as_secs() >= 1,
        };
        if due {
            self.last_stats_log = Some(now);
            tracing::debug!(
                buffered_frames = self.frames_available(),
                sync_error_micros = self.sync_error_micros,
                correction_mode = ?self.correction_mode,
                underruns = self.underruns,
                overruns = self.overruns,
                dropped_for_sync = self.samples_dropped_for_sync,
                inserted_for_sync = self.samples_inserted_for_sync,
                "Timed buffer stats"
            );
        }
    }
}

/// Tampon circulaire d'échantillons datés.
///
/// Accédé par exactement deux threads : la réception réseau (écrivain) et le
/// callback de sortie (lecteur). Voir la doc du module pour la sémantique de
/// correction.
pub struct TimedBuffer {
    state: Mutex<BufferState>,
    /// Latch CAS : au plus un événement de ré-ancrage en vol.
    reanchor_inflight: AtomicBool,
    reanchor_notify: Notify,
    clock: SharedClock,
    sample_rate: u32,
    channels: usize,
    target_ms: f64,
}

impl TimedBuffer {
    /// Crée un tampon pour `format` avec `capacity_ms` de profondeur.
    pub fn new(format: &AudioFormat, capacity_ms: u64, target_ms: f64, clock: SharedClock) -> Self {
        let channels = format.channels as usize;
        let capacity = format.samples_for_millis(capacity_ms).max(channels);

        Self {
            state: Mutex::new(BufferState {
                ring: vec![0.0; capacity],
                capacity,
                channels,
                micros_per_frame: format.micros_per_frame(),
                read_pos: 0,
                write_pos: 0,
                occupied: 0,
                segments: VecDeque::new(),
                playback_started: false,
                playback_start_local_micros: 0,
                intended_start_micros: 0,
                samples_read_since_start: 0,
                samples_output_since_start: 0,
                output_latency_micros: 0,
                sync_error_micros: 0,
                correction_mode: CorrectionMode::None,
                correction_interval_frames: 0,
                frames_since_correction: 0,
                last_output_frame: vec![0.0; channels],
                have_last_frame: false,
                reanchor_armed: false,
                disposed: false,
                underruns: 0,
                overruns: 0,
                dropped_overflow_samples: 0,
                samples_written_total: 0,
                samples_read_total: 0,
                samples_dropped_for_sync: 0,
                samples_inserted_for_sync: 0,
                last_stats_log: None,
            }),
            reanchor_inflight: AtomicBool::new(false),
            reanchor_notify: Notify::new(),
            clock,
            sample_rate: format.sample_rate,
            channels,
            target_ms,
        }
    }

    /// Écrit des échantillons décodés datés de leur timestamp serveur.
    ///
    /// Le timestamp est converti en heure locale via l'horloge partagée ;
    /// avant la première mesure de synchro la conversion utilise un offset
    /// nul (le ré-ancrage rattrapera une éventuelle erreur grossière).
    /// En cas de débordement, les échantillons les plus anciens sont perdus.
    pub fn write(&self, samples: &[f32], server_timestamp_micros: i64) -> Result<(), AudioError> {
        let local_micros = self
            .clock
            .server_to_client_micros(server_timestamp_micros)
            .unwrap_or(server_timestamp_micros);

        let mut state = self.state.lock().unwrap();
        if state.disposed {
            return Err(AudioError::Disposed);
        }
        if samples.is_empty() {
            return Ok(());
        }

        // Une écriture plus grande que le ring ne garde que la fin.
        let skipped_input = samples.len().saturating_sub(state.capacity);
        let input = &samples[skipped_input..];

        let overflow = (state.occupied + input.len()).saturating_sub(state.capacity);
        if overflow > 0 || skipped_input > 0 {
            state.overruns += 1;
            state.dropped_overflow_samples += (overflow + skipped_input) as u64;
            state.advance_read(overflow);
            tracing::warn!(
                dropped = overflow + skipped_input,
                "Timed buffer overflow, dropping oldest samples"
            );
        }

        // Copie avec rebouclage en deux tranches au plus.
        let write_pos = state.write_pos;
        let first = input.len().min(state.capacity - write_pos);
        state.ring[write_pos..write_pos + first].copy_from_slice(&input[..first]);
        if first < input.len() {
            let rest = input.len() - first;
            state.ring[..rest].copy_from_slice(&input[first..]);
        }
        state.write_pos = (write_pos + input.len()) % state.capacity;
        state.occupied += input.len();
        state.samples_written_total += input.len() as u64;

        let adjusted_micros = local_micros
            + ((skipped_input / state.channels) as f64 * state.micros_per_frame).round() as i64;
        state.segments.push_back(Segment {
            local_playback_micros: adjusted_micros,
            samples: input.len(),
        });

        Ok(())
    }

    /// Sert un bloc de sortie. Retourne le nombre d'échantillons écrits dans
    /// `out` ; le reste est mis à zéro.
    ///
    /// `now_micros` est fourni par l'appelant et reste constant pour tout
    /// l'appel : le tampon ne rééchantillonne jamais l'horloge en cours de
    /// lecture.
    pub fn read(&self, out: &mut [f32], now_micros: i64) -> usize {
        let mut state = self.state.lock().unwrap();

        if state.disposed {
            out.fill(0.0);
            return 0;
        }

        // Ré-ancrage demandé par la lecture précédente : silence, événement
        // (au plus un en vol grâce au latch CAS), et on rend la main.
        if state.reanchor_armed {
            out.fill(0.0);
            state.reanchor_armed = false;
            if self
                .reanchor_inflight
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.reanchor_notify.notify_one();
            }
            return 0;
        }

        if state.occupied == 0 {
            out.fill(0.0);
            if state.playback_started {
                state.underruns += 1;
            }
            return 0;
        }

        if !state.playback_started {
            // Démarrage immédiat, sans attendre l'heure visée du segment :
            // l'audio arrive avec de l'avance, la correction s'en charge.
            state.playback_started = true;
            state.playback_start_local_micros = now_micros;
            state.intended_start_micros = state
                .intended_cursor_micros()
                .expect("non-empty ring has a front segment");
            state.samples_read_since_start = 0;
            state.samples_output_since_start = 0;
            state.frames_since_correction = 0;
        }

        // L'erreur et le mode sont recalculés sur l'état courant AVANT de
        // consommer ce bloc : l'état en fin d'appel est identique à l'état en
        // début d'appel suivant, et la stat publiée n'a pas un bloc de biais.
        self.update_correction(&mut state, now_micros);

        if state.reanchor_armed {
            // Erreur grossière détectée à l'instant : ce bloc est déjà servi
            // en silence, l'événement partira à la prochaine lecture.
            out.fill(0.0);
            state.maybe_log_stats();
            return 0;
        }

        let written = match state.correction_mode {
            CorrectionMode::None => Self::read_bulk(&mut state, out),
            _ => Self::read_corrected(&mut state, out),
        };

        out[written..].fill(0.0);
        state.samples_output_since_start += written as u64;
        state.maybe_log_stats();
        written
    }

    /// Chemin rapide sans correction : copie en deux tranches au plus.
    fn read_bulk(state: &mut BufferState, out: &mut [f32]) -> usize {
        let channels = state.channels;
        let mut count = out.len().min(state.occupied);
        count -= count % channels;
        if count == 0 {
            return 0;
        }

        let read_pos = state.read_pos;
        let first = count.min(state.capacity - read_pos);
        out[..first].copy_from_slice(&state.ring[read_pos..read_pos + first]);
        if first < count {
            out[first..count].copy_from_slice(&state.ring[..count - first]);
        }

        state.advance_read(count);
        state.last_output_frame.copy_from_slice(&out[count - channels..count]);
        state.have_last_frame = true;
        count
    }

    /// Chemin frame par frame avec drop/insert.
    ///
    /// Une *frame* = un échantillon par canal. Le compteur de frames depuis
    /// la dernière correction persiste entre deux appels.
    fn read_corrected(state: &mut BufferState, out: &mut [f32]) -> usize {
        let channels = state.channels;
        let interval = state.correction_interval_frames.max(1);
        let mut out_pos = 0;

        while out_pos + channels <= out.len() {
            if state.frames_available() == 0 {
                break;
            }

            state.frames_since_correction += 1;

            if state.correction_mode == CorrectionMode::Dropping
                && state.frames_since_correction >= interval
                && state.frames_available() >= 2
            {
                // Deux frames consommées, une seule (la dernière émise)
                // ressort : le curseur de lecture gagne une frame sur le
                // temps de sortie.
                out[out_pos..out_pos + channels].copy_from_slice(&state.last_output_frame);
                state.advance_read(channels);
                let mut scratch = [0.0f32; 16];
                state.peek_frame(&mut scratch[..channels]);
                state.advance_read(channels);
                state.last_output_frame.copy_from_slice(&scratch[..channels]);
                state.have_last_frame = true;
                state.samples_dropped_for_sync += channels as u64;
                state.frames_since_correction = 0;
            } else if state.correction_mode == CorrectionMode::Inserting
                && state.frames_since_correction >= interval
            {
                // Une frame émise sans rien consommer : le temps de sortie
                // gagne une frame sur le curseur de lecture.
                if state.have_last_frame {
                    out[out_pos..out_pos + channels].copy_from_slice(&state.last_output_frame);
                } else {
                    out[out_pos..out_pos + channels].fill(0.0);
                }
                state.samples_inserted_for_sync += channels as u64;
                state.frames_since_correction = 0;
            } else {
                let mut scratch = [0.0f32; 16];
                state.peek_frame(&mut scratch[..channels]);
                state.advance_read(channels);
                out[out_pos..out_pos + channels].copy_from_slice(&scratch[..channels]);
                state.last_output_frame.copy_from_slice(&scratch[..channels]);
                state.have_last_frame = true;
            }

            out_pos += channels;
        }

        out_pos
    }

    /// Recalcule l'erreur de synchro et le réglage de correction.
    /// Suspendu pendant la période de grâce initiale.
    fn update_correction(&self, state: &mut BufferState, now_micros: i64) {
        let output_frames = state.samples_output_since_start / state.channels as u64;
        let output_micros = (output_frames as f64 * state.micros_per_frame) as i64;
        if output_micros < STARTUP_GRACE_MICROS {
            return;
        }

        let intended_now = match state.intended_cursor_micros() {
            Some(micros) => micros,
            None => return,
        };

        let wall_elapsed = now_micros - state.playback_start_local_micros;
        let read_elapsed = intended_now - state.intended_start_micros;
        let error = (wall_elapsed - state.output_latency_micros) - read_elapsed;
        state.sync_error_micros = error;

        if error.abs() > REANCHOR_THRESHOLD_MICROS {
            state.reanchor_armed = true;
            state.correction_mode = CorrectionMode::None;
            tracing::warn!(
                sync_error_micros = error,
                "Sync error beyond fine-correction range, requesting re-anchor"
            );
            return;
        }

        if error.abs() <= SYNC_DEADBAND_MICROS {
            state.correction_mode = CorrectionMode::None;
            return;
        }

        let rate = self.sample_rate as f64;
        let corrections_per_sec =
            (error.abs() as f64 * rate / 1e6 / CORRECTION_TARGET_SECONDS).min(MAX_CORRECTION_SPEED * rate);
        let interval = (rate / corrections_per_sec) as u32;
        state.correction_interval_frames = interval.max(MIN_CORRECTION_INTERVAL_FRAMES);
        state.correction_mode = if error > 0 {
            CorrectionMode::Dropping
        } else {
            CorrectionMode::Inserting
        };
    }

    /// Vide le tampon (seek, ré-ancrage, changement de délai statique).
    ///
    /// Idempotent. Les compteurs cumulés de drop/insert survivent, l'état de
    /// lecture et le latch de ré-ancrage sont remis à zéro.
    pub fn clear(&self) {
        let mut state = self.state.lock().unwrap();
        state.read_pos = 0;
        state.write_pos = 0;
        state.occupied = 0;
        state.segments.clear();
        state.playback_started = false;
        state.playback_start_local_micros = 0;
        state.intended_start_micros = 0;
        state.samples_read_since_start = 0;
        state.samples_output_since_start = 0;
        state.sync_error_micros = 0;
        state.correction_mode = CorrectionMode::None;
        state.correction_interval_frames = 0;
        state.frames_since_correction = 0;
        state.have_last_frame = false;
        state.reanchor_armed = false;
        drop(state);
        self.reanchor_inflight.store(false, Ordering::Release);
    }

    /// Marque le tampon comme hors service : les écritures échouent, les
    /// lectures rendent du silence.
    pub fn dispose(&self) {
        self.state.lock().unwrap().disposed = true;
    }

    /// Latence de sortie annoncée par le sink, soustraite de l'erreur.
    pub fn set_output_latency_micros(&self, latency: i64) {
        self.state.lock().unwrap().output_latency_micros = latency;
    }

    /// Attend la prochaine demande de ré-ancrage (coalescée).
    pub async fn reanchor_required(&self) {
        self.reanchor_notify.notified().await;
    }

    /// Assez de matière pour démarrer la lecture ?
    pub fn ready_for_playback(&self) -> bool {
        self.buffered_ms() >= 0.8 * self.target_ms
    }

    pub fn buffered_ms(&self) -> f64 {
        let state = self.state.lock().unwrap();
        (state.frames_available() as f64) * 1000.0 / self.sample_rate as f64
    }

    pub fn stats(&self) -> BufferStats {
        let state = self.state.lock().unwrap();
        BufferStats {
            buffered_ms: (state.frames_available() as f64) * 1000.0 / self.sample_rate as f64,
            target_ms: self.target_ms,
            underruns: state.underruns,
            overruns: state.overruns,
            dropped_samples: state.dropped_overflow_samples,
            samples_written: state.samples_written_total,
            samples_read: state.samples_read_total,
            sync_error_micros: state.sync_error_micros,
            correction_mode: state.correction_mode,
            samples_dropped_for_sync: state.samples_dropped_for_sync,
            samples_inserted_for_sync: state.samples_inserted_for_sync,
        }
    }

    #[cfg(test)]
    fn segment_sum(&self) -> usize {
        let state = self.state.lock().unwrap();
        assert_eq!(
            state.segments.iter().map(|s| s.samples).sum::<usize>(),
            state.occupied
        );
        state.occupied
    }

    pub fn channels(&self) -> usize {
        self.channels
    }
}
