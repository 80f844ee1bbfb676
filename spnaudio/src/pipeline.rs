//! Pipeline de lecture : décodeur → tampon temporel → sink.
//!
//! # Machine à états
//!
//! ```text
//! Idle ──start──► Starting ──► Buffering ──tampon prêt──► Playing
//!   ▲                │             ▲                         │
//!   │                ▼             └────────clear()──────────┘
//!   └──stop──── Stopping                     (re-Buffering)
//!
//! (tout état) ──erreur sink──► Error
//! ```
//!
//! Le pipeline possède exclusivement son décodeur, son tampon et son sink.
//! Un nouveau flux reconstruit décodeur et tampon ; le sink est conservé
//! quand le format ne change pas. Les erreurs de décodage d'une frame sont
//! journalisées et la frame ignorée : le chemin chaud ne remonte jamais
//! d'erreur au thread de réception.

use std::sync::Arc;

use spnsync::SharedClock;

use crate::{
    make_decoder, AudioError, AudioFormat, AudioSink, BufferStats, Decoder, SinkErrorHook,
    TimedBuffer,
};

/// Fraction du tampon cible requise avant de démarrer le sink.
const READY_FRACTION: f64 = 0.8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Starting,
    Buffering,
    Playing,
    Stopping,
    Error,
}

/// Notification de changement d'état, pour l'orchestrateur.
pub type StateHook = Arc<dyn Fn(PipelineState) + Send + Sync>;

/// Fabrique de sink, injectée pour pouvoir tester sans carte son.
pub type SinkFactory = Box<dyn Fn() -> Box<dyn AudioSink> + Send + Sync>;

/// Réglages du tampon, issus de la configuration.
#[derive(Debug, Clone, Copy)]
pub struct PipelineConfig {
    pub buffer_capacity_ms: u64,
    pub buffer_target_ms: f64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            buffer_capacity_ms: 8_000,
            buffer_target_ms: 250.0,
        }
    }
}

pub struct AudioPipeline {
    config: PipelineConfig,
    clock: SharedClock,
    sink_factory: SinkFactory,
    state: PipelineState,
    format: Option<AudioFormat>,
    decoder: Option<Box<dyn Decoder>>,
    buffer: Option<Arc<TimedBuffer>>,
    sink: Option<Box<dyn AudioSink>>,
    scratch: Vec<f32>,
    volume: u8,
    muted: bool,
    state_hook: Option<StateHook>,
    error_hook: Option<SinkErrorHook>,
}

impl AudioPipeline {
    pub fn new(config: PipelineConfig, clock: SharedClock, sink_factory: SinkFactory) -> Self {
        Self {
            config,
            clock,
            sink_factory,
            state: PipelineState::Idle,
            format: None,
            decoder: None,
            buffer: None,
            sink: None,
            scratch: Vec::new(),
            volume: 100,
            muted: false,
            state_hook: None,
            error_hook: None,
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn set_state_hook(&mut self, hook: StateHook) {
        self.state_hook = Some(hook);
    }

    /// Callback d'erreur fatale du sink, relayé à l'orchestrateur.
    pub fn set_error_hook(&mut self, hook: SinkErrorHook) {
        self.error_hook = Some(hook);
    }

    fn set_state(&mut self, state: PipelineState) {
        if self.state != state {
            tracing::info!(from = ?self.state, to = ?state, "Pipeline state change");
            self.state = state;
            if let Some(hook) = &self.state_hook {
                hook(state);
            }
        }
    }

    /// Démarre un nouveau flux. Arrête d'abord le flux courant si besoin ;
    /// en cas d'échec le pipeline est laissé propre (Idle).
    pub fn start(
        &mut self,
        format: AudioFormat,
        codec_header: Option<&[u8]>,
    ) -> Result<(), AudioError> {
        if self.state != PipelineState::Idle {
            let keep_sink = self.format == Some(format);
            self.stop_internal(keep_sink);
        }

        if format.sample_rate == 0 || format.channels == 0 || format.channels > 8 {
            return Err(AudioError::UnsupportedFormat(format.to_string()));
        }

        self.set_state(PipelineState::Starting);

        let decoder = match make_decoder(&format, codec_header) {
            Ok(decoder) => decoder,
            Err(e) => {
                self.stop_internal(false);
                return Err(e);
            }
        };
        self.scratch = vec![0.0; decoder.max_samples_per_frame()];

        let buffer = Arc::new(TimedBuffer::new(
            &format,
            self.config.buffer_capacity_ms,
            self.config.buffer_target_ms,
            self.clock.clone(),
        ));

        let mut sink = self.sink.take().unwrap_or_else(|| (self.sink_factory)());
        if let Err(e) = sink.initialize(&format) {
            self.stop_internal(false);
            return Err(e);
        }
        let source_buffer = buffer.clone();
        sink.set_sample_source(Arc::new(move |out: &mut [f32], now_micros: i64| {
            source_buffer.read(out, now_micros)
        }));
        if let Some(hook) = &self.error_hook {
            sink.set_error_hook(hook.clone());
        }
        sink.set_volume(self.volume);
        sink.set_muted(self.muted);

        self.format = Some(format);
        self.decoder = Some(decoder);
        self.buffer = Some(buffer);
        self.sink = Some(sink);
        self.set_state(PipelineState::Buffering);
        tracing::info!(format = %format, "Pipeline started, buffering");
        Ok(())
    }

    /// Décode et empile un chunk. Jamais d'erreur vers l'appelant : une
    /// frame indécodable est ignorée, le flux continue.
    pub fn process_chunk(&mut self, server_timestamp_micros: i64, payload: &[u8]) {
        if !matches!(
            self.state,
            PipelineState::Buffering | PipelineState::Playing
        ) {
            tracing::trace!(state = ?self.state, "Dropping audio chunk outside of stream");
            return;
        }
        let (Some(decoder), Some(buffer)) = (self.decoder.as_mut(), self.buffer.as_ref()) else {
            return;
        };

        let decoded = match decoder.decode(payload, &mut self.scratch) {
            Ok(count) => count,
            Err(e) => {
                tracing::warn!(error = %e, "Skipping undecodable audio frame");
                return;
            }
        };
        if decoded == 0 {
            return;
        }

        if let Err(e) = buffer.write(&self.scratch[..decoded], server_timestamp_micros) {
            tracing::warn!(error = %e, "Dropping chunk, buffer rejected write");
            return;
        }

        match self.state {
            PipelineState::Buffering if buffer.ready_for_playback() => {
                self.begin_playback();
            }
            PipelineState::Playing => {
                // La latence réelle n'est connue qu'après les premiers
                // callbacks du matériel ; on la rafraîchit au fil de l'eau.
                if let Some(sink) = self.sink.as_ref() {
                    buffer.set_output_latency_micros(sink.output_latency_micros());
                }
            }
            _ => {}
        }
    }

    /// Le tampon a atteint le seuil : démarrage du sink.
    fn begin_playback(&mut self) {
        let Some(sink) = self.sink.as_mut() else {
            return;
        };
        match sink.play() {
            Ok(()) => {
                if let Some(buffer) = &self.buffer {
                    buffer.set_output_latency_micros(sink.output_latency_micros());
                }
                self.set_state(PipelineState::Playing);
            }
            Err(e) => {
                tracing::error!(error = %e, "Audio sink failed to start");
                self.set_state(PipelineState::Error);
            }
        }
    }

    /// Flush (seek ou ré-ancrage) : tampon vidé, décodeur réinitialisé, et
    /// retour en Buffering si on jouait. Idempotent.
    pub fn clear(&mut self) {
        if let Some(buffer) = &self.buffer {
            buffer.clear();
        }
        if let Some(decoder) = self.decoder.as_mut() {
            decoder.reset();
        }
        if self.state == PipelineState::Playing {
            // Le sink continue de tourner et tire du silence en attendant.
            self.set_state(PipelineState::Buffering);
        }
    }

    /// Arrêt complet, sink compris. Idempotent.
    pub fn stop(&mut self) {
        self.stop_internal(false);
    }

    fn stop_internal(&mut self, keep_sink: bool) {
        if self.state == PipelineState::Idle && self.decoder.is_none() {
            return;
        }
        self.set_state(PipelineState::Stopping);

        if let Some(sink) = self.sink.as_mut() {
            sink.stop();
        }
        if !keep_sink {
            self.sink = None;
        }
        if let Some(buffer) = &self.buffer {
            buffer.dispose();
        }
        self.buffer = None;
        self.decoder = None;
        if !keep_sink {
            self.format = None;
        }
        self.scratch = Vec::new();

        self.set_state(PipelineState::Idle);
    }

    /// Passage en état d'erreur après une panne de périphérique ; le flux
    /// est démonté comme pour un stop.
    pub fn mark_error(&mut self) {
        self.stop_internal(false);
        self.set_state(PipelineState::Error);
    }

    pub fn set_volume(&mut self, volume: u8) {
        self.volume = volume.min(100);
        if let Some(sink) = self.sink.as_mut() {
            sink.set_volume(self.volume);
        }
    }

    pub fn volume(&self) -> u8 {
        self.volume
    }

    pub fn set_muted(&mut self, muted: bool) {
        self.muted = muted;
        if let Some(sink) = self.sink.as_mut() {
            sink.set_muted(muted);
        }
    }

    pub fn muted(&self) -> bool {
        self.muted
    }

    /// Tampon du flux courant ; l'orchestrateur s'en sert pour attendre les
    /// demandes de ré-ancrage.
    pub fn buffer(&self) -> Option<Arc<TimedBuffer>> {
        self.buffer.clone()
    }

    pub fn stats(&self) -> Option<BufferStats> {
        self.buffer.as_ref().map(|b| b.stats())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AudioCodec, NullSink};
    use spnsync::KalmanConfig;

    fn pcm_16(sample_rate: u32) -> AudioFormat {
        AudioFormat {
            codec: AudioCodec::Pcm,
            sample_rate,
            channels: 2,
            bit_depth: Some(16),
        }
    }

    fn pipeline() -> AudioPipeline {
        AudioPipeline::new(
            PipelineConfig {
                buffer_capacity_ms: 1_000,
                buffer_target_ms: 100.0,
            },
            SharedClock::new(KalmanConfig::default()),
            Box::new(|| Box::new(NullSink::new())),
        )
    }

    /// Un chunk PCM16 stéréo de `frames` frames.
    fn pcm_chunk(frames: usize) -> Vec<u8> {
        let mut data = Vec::with_capacity(frames * 4);
        for _ in 0..frames * 2 {
            data.extend_from_slice(&1000i16.to_le_bytes());
        }
        data
    }

    #[test]
    fn test_start_transitions_to_buffering() {
        let mut pipeline = pipeline();
        assert_eq!(pipeline.state(), PipelineState::Idle);
        pipeline.start(pcm_16(48_000), None).unwrap();
        assert_eq!(pipeline.state(), PipelineState::Buffering);
        pipeline.stop();
        assert_eq!(pipeline.state(), PipelineState::Idle);
    }

    #[test]
    fn test_playback_begins_at_ready_threshold() {
        let mut pipeline = pipeline();
        pipeline.start(pcm_16(48_000), None).unwrap();

        // Cible 100 ms, seuil 80 ms : trois chunks de 20 ms ne suffisent pas.
        for i in 0..3 {
            pipeline.process_chunk(i * 20_000, &pcm_chunk(960));
        }
        assert_eq!(pipeline.state(), PipelineState::Buffering);

        // Le quatrième atteint exactement le seuil.
        pipeline.process_chunk(3 * 20_000, &pcm_chunk(960));
        assert_eq!(pipeline.state(), PipelineState::Playing);
        pipeline.stop();
    }

    #[test]
    fn test_bad_frame_does_not_kill_stream() {
        let mut pipeline = pipeline();
        pipeline.start(
            AudioFormat {
                codec: AudioCodec::Opus,
                sample_rate: 48_000,
                channels: 2,
                bit_depth: None,
            },
            None,
        )
        .unwrap();

        // Des octets quelconques ne forment pas un paquet opus valide.
        pipeline.process_chunk(0, &[0xDE, 0xAD, 0xBE, 0xEF]);
        assert_eq!(pipeline.state(), PipelineState::Buffering);
        pipeline.stop();
    }

    #[test]
    fn test_clear_reenters_buffering() {
        let mut pipeline = pipeline();
        pipeline.start(pcm_16(48_000), None).unwrap();
        for i in 0..5 {
            pipeline.process_chunk(i * 20_000, &pcm_chunk(960));
        }
        assert_eq!(pipeline.state(), PipelineState::Playing);

        pipeline.clear();
        assert_eq!(pipeline.state(), PipelineState::Buffering);
        assert_eq!(pipeline.stats().unwrap().buffered_ms, 0.0);

        // Clear est idempotent.
        pipeline.clear();
        assert_eq!(pipeline.state(), PipelineState::Buffering);
        pipeline.stop();
    }

    #[test]
    fn test_format_change_rebuilds_buffer() {
        let mut pipeline = pipeline();
        pipeline.start(pcm_16(48_000), None).unwrap();
        for i in 0..5 {
            pipeline.process_chunk(i * 20_000, &pcm_chunk(960));
        }
        let old_buffer = pipeline.buffer().unwrap();

        // Nouveau flux à 44.1 kHz : décodeur et tampon neufs, aucun
        // échantillon de l'ancien flux ne survit.
        pipeline.start(pcm_16(44_100), None).unwrap();
        let new_buffer = pipeline.buffer().unwrap();
        assert!(!Arc::ptr_eq(&old_buffer, &new_buffer));
        assert_eq!(new_buffer.stats().samples_written, 0);

        // L'ancien tampon est hors service.
        assert!(matches!(
            old_buffer.write(&[0.0; 4], 0),
            Err(AudioError::Disposed)
        ));
        pipeline.stop();
    }

    #[test]
    fn test_volume_is_clamped_and_persisted() {
        let mut pipeline = pipeline();
        pipeline.set_volume(150);
        assert_eq!(pipeline.volume(), 100);
        pipeline.set_muted(true);
        assert!(pipeline.muted());

        // Les réglages survivent au démarrage d'un flux.
        pipeline.start(pcm_16(48_000), None).unwrap();
        assert_eq!(pipeline.volume(), 100);
        assert!(pipeline.muted());
        pipeline.stop();
    }

    #[test]
    fn test_stop_is_idempotent() {
        let mut pipeline = pipeline();
        pipeline.start(pcm_16(48_000), None).unwrap();
        pipeline.stop();
        pipeline.stop();
        assert_eq!(pipeline.state(), PipelineState::Idle);
    }

    #[test]
    fn test_chunks_outside_stream_are_ignored() {
        let mut pipeline = pipeline();
        // Pas de start : le chunk est jeté sans bruit.
        pipeline.process_chunk(0, &pcm_chunk(960));
        assert_eq!(pipeline.state(), PipelineState::Idle);
        assert!(pipeline.stats().is_none());
    }
}
