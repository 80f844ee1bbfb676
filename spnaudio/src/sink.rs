//! Sorties audio.
//!
//! [`CpalSink`] joue sur le périphérique par défaut via cpal. Le `Stream`
//! cpal n'étant pas `Send`, il vit sur un thread dédié commandé par un canal
//! d'arrêt, comme le reste de la chaîne l'attend d'un composant temps réel :
//! le callback ne fait que tirer des échantillons de la source, appliquer le
//! gain et convertir vers le format matériel (F32, I16 ou U16).
//!
//! [`NullSink`] consomme la source au rythme nominal sans carte son, pour
//! les tests et le fonctionnement headless.
//!
//! Le callback tamponne UNE valeur d'horloge par invocation et la passe
//! telle quelle à la source : le tampon temporel exige un instant cohérent
//! pour tout le bloc.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

use spnsync::monotonic;

use crate::{AudioError, AudioFormat};

/// Source d'échantillons d'un sink : remplit `out`, reçoit l'heure locale du
/// bloc, retourne le nombre d'échantillons écrits (le reste est du silence).
pub type SampleSource = Arc<dyn Fn(&mut [f32], i64) -> usize + Send + Sync>;

/// Callback d'erreur fatale du périphérique (device perdu, format refusé).
pub type SinkErrorHook = Arc<dyn Fn(String) + Send + Sync>;

/// Sortie audio pilotée par une source d'échantillons.
pub trait AudioSink: Send {
    /// Prépare le sink pour un format. Peut être rappelé entre deux flux de
    /// même format sans reconstruire le périphérique.
    fn initialize(&mut self, format: &AudioFormat) -> Result<(), AudioError>;

    fn set_sample_source(&mut self, source: SampleSource);

    fn set_error_hook(&mut self, hook: SinkErrorHook);

    /// Démarre la restitution. La source doit être posée avant.
    fn play(&mut self) -> Result<(), AudioError>;

    /// Arrête la restitution. Idempotent.
    fn stop(&mut self);

    /// Latence de sortie estimée, en µs (0 si inconnue).
    fn output_latency_micros(&self) -> i64;

    /// Volume 0-100, appliqué dans le callback.
    fn set_volume(&mut self, volume: u8);

    fn set_muted(&mut self, muted: bool);
}

/// État partagé avec le callback temps réel.
struct Shared {
    gain_bits: AtomicU32,
    muted: AtomicBool,
    latency_micros: AtomicI64,
}

impl Shared {
    fn new() -> Self {
        Self {
            gain_bits: AtomicU32::new(1.0f32.to_bits()),
            muted: AtomicBool::new(false),
            latency_micros: AtomicI64::new(0),
        }
    }

    fn gain(&self) -> f32 {
        if self.muted.load(Ordering::Relaxed) {
            0.0
        } else {
            f32::from_bits(self.gain_bits.load(Ordering::Relaxed))
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// CpalSink
// ═══════════════════════════════════════════════════════════════════════════

/// Sink cpal multiplateforme.
pub struct CpalSink {
    format: Option<AudioFormat>,
    source: Option<SampleSource>,
    error_hook: Option<SinkErrorHook>,
    shared: Arc<Shared>,
    stop_tx: Option<std_mpsc::Sender<()>>,
    stream_thread: Option<thread::JoinHandle<()>>,
}

impl CpalSink {
    pub fn new() -> Self {
        Self {
            format: None,
            source: None,
            error_hook: None,
            shared: Arc::new(Shared::new()),
            stop_tx: None,
            stream_thread: None,
        }
    }

    /// Remplit `data` (format matériel `T`) depuis la source float.
    fn fill_block<T: cpal::SizedSample + cpal::FromSample<f32>>(
        data: &mut [T],
        scratch: &mut Vec<f32>,
        source: &SampleSource,
        shared: &Shared,
        info: &cpal::OutputCallbackInfo,
    ) {
        if scratch.len() < data.len() {
            scratch.resize(data.len(), 0.0);
        }
        let block = &mut scratch[..data.len()];

        // Une seule lecture d'horloge pour tout le bloc.
        let now = monotonic::now_micros();
        source(block, now);

        if let Some(delay) = info
            .timestamp()
            .playback
            .duration_since(&info.timestamp().callback)
        {
            shared
                .latency_micros
                .store(delay.as_micros() as i64, Ordering::Relaxed);
        }

        let gain = shared.gain();
        for (dst, src) in data.iter_mut().zip(block.iter()) {
            *dst = T::from_sample(src * gain);
        }
    }
}

impl Default for CpalSink {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioSink for CpalSink {
    fn initialize(&mut self, format: &AudioFormat) -> Result<(), AudioError> {
        if format.channels == 0 || format.channels > 8 {
            return Err(AudioError::UnsupportedFormat(format!(
                "{} output channels",
                format.channels
            )));
        }
        self.format = Some(*format);
        Ok(())
    }

    fn set_sample_source(&mut self, source: SampleSource) {
        self.source = Some(source);
    }

    fn set_error_hook(&mut self, hook: SinkErrorHook) {
        self.error_hook = Some(hook);
    }

    fn play(&mut self) -> Result<(), AudioError> {
        if self.stream_thread.is_some() {
            return Ok(());
        }
        let format = self
            .format
            .ok_or_else(|| AudioError::Sink("play() before initialize()".to_string()))?;
        let source = self
            .source
            .clone()
            .ok_or_else(|| AudioError::Sink("play() without a sample source".to_string()))?;

        let shared = self.shared.clone();
        let error_hook = self.error_hook.clone();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<(), String>>();

        // Le Stream cpal n'est pas Send : il vit et meurt sur ce thread.
        let handle = thread::Builder::new()
            .name("spn-audio-out".to_string())
            .spawn(move || {
                run_output_stream(format, source, shared, error_hook, ready_tx, stop_rx);
            })
            .map_err(|e| AudioError::Sink(format!("spawn output thread: {e}")))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                self.stop_tx = Some(stop_tx);
                self.stream_thread = Some(handle);
                tracing::info!(format = %format, "Audio output started");
                Ok(())
            }
            Ok(Err(message)) => {
                let _ = handle.join();
                Err(AudioError::Sink(message))
            }
            Err(_) => {
                let _ = handle.join();
                Err(AudioError::Sink("output thread died during init".to_string()))
            }
        }
    }

    fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.stream_thread.take() {
            let _ = handle.join();
        }
    }

    fn output_latency_micros(&self) -> i64 {
        self.shared.latency_micros.load(Ordering::Relaxed)
    }

    fn set_volume(&mut self, volume: u8) {
        let gain = f32::from(volume.min(100)) / 100.0;
        self.shared.gain_bits.store(gain.to_bits(), Ordering::Relaxed);
    }

    fn set_muted(&mut self, muted: bool) {
        self.shared.muted.store(muted, Ordering::Relaxed);
    }
}

impl Drop for CpalSink {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Corps du thread de restitution : construit le stream au format matériel
/// le plus proche, le joue, attend l'ordre d'arrêt.
fn run_output_stream(
    format: AudioFormat,
    source: SampleSource,
    shared: Arc<Shared>,
    error_hook: Option<SinkErrorHook>,
    ready_tx: std_mpsc::Sender<Result<(), String>>,
    stop_rx: std_mpsc::Receiver<()>,
) {
    let host = cpal::default_host();
    let device = match host.default_output_device() {
        Some(device) => device,
        None => {
            let _ = ready_tx.send(Err("no output device available".to_string()));
            return;
        }
    };

    tracing::debug!(
        device = %device.name().unwrap_or_else(|_| "unknown".to_string()),
        "Using audio output device"
    );

    // Recherche d'une configuration au sample rate et au nombre de canaux du
    // flux ; pas de rééchantillonnage côté lecteur.
    let wanted_rate = cpal::SampleRate(format.sample_rate);
    let config_range = match device.supported_output_configs() {
        Ok(mut configs) => configs.find(|c| {
            c.channels() == format.channels
                && c.min_sample_rate() <= wanted_rate
                && wanted_rate <= c.max_sample_rate()
        }),
        Err(e) => {
            let _ = ready_tx.send(Err(format!("query output configs: {e}")));
            return;
        }
    };
    let supported = match config_range {
        Some(range) => range.with_sample_rate(wanted_rate),
        None => {
            let _ = ready_tx.send(Err(format!("no output config for {format}")));
            return;
        }
    };

    let sample_format = supported.sample_format();
    let config: cpal::StreamConfig = supported.into();
    let err_hook = error_hook.clone();
    let on_error = move |err: cpal::StreamError| {
        tracing::error!(error = %err, "Audio stream error");
        if let Some(hook) = &err_hook {
            hook(err.to_string());
        }
    };

    let mut scratch: Vec<f32> = vec![0.0; 8_192 * format.channels as usize];
    let stream = match sample_format {
        cpal::SampleFormat::F32 => device.build_output_stream(
            &config,
            move |data: &mut [f32], info: &cpal::OutputCallbackInfo| {
                CpalSink::fill_block(data, &mut scratch, &source, &shared, info);
            },
            on_error,
            None,
        ),
        cpal::SampleFormat::I16 => device.build_output_stream(
            &config,
            move |data: &mut [i16], info: &cpal::OutputCallbackInfo| {
                CpalSink::fill_block(data, &mut scratch, &source, &shared, info);
            },
            on_error,
            None,
        ),
        cpal::SampleFormat::U16 => device.build_output_stream(
            &config,
            move |data: &mut [u16], info: &cpal::OutputCallbackInfo| {
                CpalSink::fill_block(data, &mut scratch, &source, &shared, info);
            },
            on_error,
            None,
        ),
        other => {
            let _ = ready_tx.send(Err(format!("unsupported hardware sample format {other:?}")));
            return;
        }
    };

    let stream = match stream {
        Ok(stream) => stream,
        Err(e) => {
            let _ = ready_tx.send(Err(format!("build output stream: {e}")));
            return;
        }
    };

    if let Err(e) = stream.play() {
        let _ = ready_tx.send(Err(format!("start output stream: {e}")));
        return;
    }
    let _ = ready_tx.send(Ok(()));

    // Le stream joue tant que ce thread vit.
    let _ = stop_rx.recv();
    tracing::debug!("Audio output thread exiting");
}

// ═══════════════════════════════════════════════════════════════════════════
// NullSink
// ═══════════════════════════════════════════════════════════════════════════

/// Sink sans périphérique : tire la source au rythme nominal et jette les
/// échantillons. Pour les tests et les machines sans carte son.
pub struct NullSink {
    format: Option<AudioFormat>,
    source: Option<SampleSource>,
    shared: Arc<Shared>,
    stop_tx: Option<std_mpsc::Sender<()>>,
    thread: Option<thread::JoinHandle<()>>,
    block_millis: u64,
}

impl NullSink {
    pub fn new() -> Self {
        Self {
            format: None,
            source: None,
            shared: Arc::new(Shared::new()),
            stop_tx: None,
            thread: None,
            block_millis: 10,
        }
    }
}

impl Default for NullSink {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioSink for NullSink {
    fn initialize(&mut self, format: &AudioFormat) -> Result<(), AudioError> {
        self.format = Some(*format);
        Ok(())
    }

    fn set_sample_source(&mut self, source: SampleSource) {
        self.source = Some(source);
    }

    fn set_error_hook(&mut self, _hook: SinkErrorHook) {}

    fn play(&mut self) -> Result<(), AudioError> {
        if self.thread.is_some() {
            return Ok(());
        }
        let format = self
            .format
            .ok_or_else(|| AudioError::Sink("play() before initialize()".to_string()))?;
        let source = self
            .source
            .clone()
            .ok_or_else(|| AudioError::Sink("play() without a sample source".to_string()))?;

        let block_millis = self.block_millis;
        let block_len = format.samples_for_millis(block_millis);
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        let handle = thread::Builder::new()
            .name("spn-null-out".to_string())
            .spawn(move || {
                let mut block = vec![0.0f32; block_len];
                loop {
                    match stop_rx.recv_timeout(Duration::from_millis(block_millis)) {
                        Ok(()) | Err(std_mpsc::RecvTimeoutError::Disconnected) => break,
                        Err(std_mpsc::RecvTimeoutError::Timeout) => {
                            source(&mut block, monotonic::now_micros());
                        }
                    }
                }
            })
            .map_err(|e| AudioError::Sink(format!("spawn null output thread: {e}")))?;

        self.stop_tx = Some(stop_tx);
        self.thread = Some(handle);
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }

    fn output_latency_micros(&self) -> i64 {
        0
    }

    fn set_volume(&mut self, volume: u8) {
        let gain = f32::from(volume.min(100)) / 100.0;
        self.shared.gain_bits.store(gain.to_bits(), Ordering::Relaxed);
    }

    fn set_muted(&mut self, muted: bool) {
        self.shared.muted.store(muted, Ordering::Relaxed);
    }
}

impl Drop for NullSink {
    fn drop(&mut self) {
        self.stop();
    }
}
