//! Décodeurs de frames encodées vers PCM float entrelacé.
//!
//! Chaque frame binaire reçue du réseau est décodée dans un scratch
//! pré-alloué de [`Decoder::max_samples_per_frame`] échantillons, puis écrite
//! dans le tampon temporel. Une erreur de décodage est journalisée et la
//! frame ignorée ; le décodeur n'est PAS réinitialisé (seul un seek le fait).
//!
//! Les échantillons produits sont normalisés dans [-1.0, +1.0] :
//!
//! | codec | source                         | facteur         |
//! |-------|--------------------------------|-----------------|
//! | pcm   | i16/i24/i32 little-endian      | 1 / (2^(n-1)-1) |
//! | opus  | libopus `decode_float`         | natif           |
//! | flac  | symphonia, copie entrelacée    | natif           |

use symphonia::core::audio::{Channels, SampleBuffer};
use symphonia::core::codecs::{CodecParameters, DecoderOptions, CODEC_TYPE_FLAC};
use symphonia::core::formats::Packet;

use crate::{AudioCodec, AudioError, AudioFormat};

/// Durée maximale d'une frame encodée, utilisée pour dimensionner les
/// scratchs de décodage (120 ms est le maximum d'une frame Opus).
const MAX_FRAME_MILLIS: u64 = 120;

/// Transforme une frame encodée en échantillons float entrelacés.
pub trait Decoder: Send {
    /// Décode `input` dans `output` ; retourne le nombre d'échantillons
    /// entrelacés produits. `output` fait au moins `max_samples_per_frame`.
    fn decode(&mut self, input: &[u8], output: &mut [f32]) -> Result<usize, AudioError>;

    /// Oublie l'état inter-frames (appelé sur seek).
    fn reset(&mut self);

    /// Borne supérieure d'échantillons produits par une frame, fixée à la
    /// construction pour permettre la pré-allocation.
    fn max_samples_per_frame(&self) -> usize;
}

/// Construit le décodeur adapté au format négocié.
///
/// `codec_header` transporte le blob d'initialisation du codec quand le
/// serveur en fournit un (STREAMINFO pour le FLAC).
pub fn make_decoder(
    format: &AudioFormat,
    codec_header: Option<&[u8]>,
) -> Result<Box<dyn Decoder>, AudioError> {
    match format.codec {
        AudioCodec::Pcm => Ok(Box::new(PcmDecoder::new(format)?)),
        AudioCodec::Opus => Ok(Box::new(OpusDecoder::new(format)?)),
        AudioCodec::Flac => Ok(Box::new(FlacDecoder::new(format, codec_header)?)),
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// PCM
// ═══════════════════════════════════════════════════════════════════════════

/// Décodeur PCM little-endian 16/24/32 bits signés.
pub struct PcmDecoder {
    bytes_per_sample: usize,
    scale: f32,
    max_samples: usize,
}

impl PcmDecoder {
    pub fn new(format: &AudioFormat) -> Result<Self, AudioError> {
        let bit_depth = format.bit_depth.ok_or_else(|| {
            AudioError::UnsupportedFormat("pcm stream without bit depth".to_string())
        })?;
        let bytes_per_sample = match bit_depth {
            16 => 2,
            24 => 3,
            32 => 4,
            other => {
                return Err(AudioError::UnsupportedFormat(format!(
                    "pcm bit depth {other}"
                )))
            }
        };

        // Normalisation vers [-1, +1] par la valeur max positive.
        let scale = 1.0 / ((1u64 << (bit_depth - 1)) as f32 - 1.0);

        Ok(Self {
            bytes_per_sample,
            scale,
            max_samples: format.samples_for_millis(MAX_FRAME_MILLIS),
        })
    }
}

impl Decoder for PcmDecoder {
    fn decode(&mut self, input: &[u8], output: &mut [f32]) -> Result<usize, AudioError> {
        let count = (input.len() / self.bytes_per_sample).min(output.len());

        match self.bytes_per_sample {
            2 => {
                for (i, out) in output.iter_mut().enumerate().take(count) {
                    let b = &input[i * 2..i * 2 + 2];
                    *out = i16::from_le_bytes([b[0], b[1]]) as f32 * self.scale;
                }
            }
            3 => {
                for (i, out) in output.iter_mut().enumerate().take(count) {
                    let b = &input[i * 3..i * 3 + 3];
                    // Extension de signe depuis 3 octets.
                    let v = (i32::from(b[2]) << 24 | i32::from(b[1]) << 16 | i32::from(b[0]) << 8)
                        >> 8;
                    *out = v as f32 * self.scale;
                }
            }
            4 => {
                for (i, out) in output.iter_mut().enumerate().take(count) {
                    let b = &input[i * 4..i * 4 + 4];
                    *out = i32::from_le_bytes([b[0], b[1], b[2], b[3]]) as f32 * self.scale;
                }
            }
            _ => unreachable!("bytes_per_sample validated at construction"),
        }

        Ok(count)
    }

    fn reset(&mut self) {
        // Le PCM est sans état.
    }

    fn max_samples_per_frame(&self) -> usize {
        self.max_samples
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Opus
// ═══════════════════════════════════════════════════════════════════════════

/// Décodeur Opus via libopus.
pub struct OpusDecoder {
    inner: opus::Decoder,
    channels: usize,
    max_samples: usize,
}

impl OpusDecoder {
    pub fn new(format: &AudioFormat) -> Result<Self, AudioError> {
        let channels = match format.channels {
            1 => opus::Channels::Mono,
            2 => opus::Channels::Stereo,
            other => {
                return Err(AudioError::UnsupportedFormat(format!(
                    "opus with {other} channels"
                )))
            }
        };
        let inner = opus::Decoder::new(format.sample_rate, channels)
            .map_err(|e| AudioError::Decode(format!("opus decoder init: {e}")))?;

        Ok(Self {
            inner,
            channels: format.channels as usize,
            max_samples: format.samples_for_millis(MAX_FRAME_MILLIS),
        })
    }
}

impl Decoder for OpusDecoder {
    fn decode(&mut self, input: &[u8], output: &mut [f32]) -> Result<usize, AudioError> {
        let frames = self
            .inner
            .decode_float(input, output, false)
            .map_err(|e| AudioError::Decode(format!("opus: {e}")))?;
        Ok(frames * self.channels)
    }

    fn reset(&mut self) {
        if let Err(e) = self.inner.reset_state() {
            tracing::warn!(error = %e, "Failed to reset opus decoder state");
        }
    }

    fn max_samples_per_frame(&self) -> usize {
        self.max_samples
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// FLAC
// ═══════════════════════════════════════════════════════════════════════════

/// Décodeur FLAC via symphonia, alimenté frame par frame.
pub struct FlacDecoder {
    inner: Box<dyn symphonia::core::codecs::Decoder>,
    sample_buf: Option<SampleBuffer<f32>>,
    max_samples: usize,
}

impl FlacDecoder {
    pub fn new(format: &AudioFormat, codec_header: Option<&[u8]>) -> Result<Self, AudioError> {
        let channels = match format.channels {
            1 => Channels::FRONT_LEFT,
            2 => Channels::FRONT_LEFT | Channels::FRONT_RIGHT,
            other => {
                return Err(AudioError::UnsupportedFormat(format!(
                    "flac with {other} channels"
                )))
            }
        };

        let mut params = CodecParameters::new();
        params
            .for_codec(CODEC_TYPE_FLAC)
            .with_sample_rate(format.sample_rate)
            .with_channels(channels);
        if let Some(header) = codec_header {
            params.with_extra_data(header.to_vec().into_boxed_slice());
        }

        let inner = symphonia::default::get_codecs()
            .make(&params, &DecoderOptions::default())
            .map_err(|e| AudioError::Decode(format!("flac decoder init: {e}")))?;

        Ok(Self {
            inner,
            sample_buf: None,
            max_samples: format.samples_for_millis(MAX_FRAME_MILLIS),
        })
    }
}

impl Decoder for FlacDecoder {
    fn decode(&mut self, input: &[u8], output: &mut [f32]) -> Result<usize, AudioError> {
        let packet = Packet::new_from_boxed_slice(0, 0, 0, input.to_vec().into_boxed_slice());
        let decoded = self
            .inner
            .decode(&packet)
            .map_err(|e| AudioError::Decode(format!("flac: {e}")))?;

        let spec = *decoded.spec();
        let needed = decoded.capacity() * spec.channels.count();
        let stale = match &self.sample_buf {
            Some(buf) => buf.capacity() < needed,
            None => true,
        };
        if stale {
            self.sample_buf = Some(SampleBuffer::new(decoded.capacity() as u64, spec));
        }
        let buf = self
            .sample_buf
            .as_mut()
            .expect("sample buffer just allocated");

        buf.copy_interleaved_ref(decoded);
        let samples = buf.samples();
        let count = samples.len().min(output.len());
        output[..count].copy_from_slice(&samples[..count]);
        Ok(count)
    }

    fn reset(&mut self) {
        self.inner.reset();
    }

    fn max_samples_per_frame(&self) -> usize {
        self.max_samples
    }
}
