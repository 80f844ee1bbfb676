//! Description d'un flux audio entrant.

use std::fmt;
use std::str::FromStr;

use crate::AudioError;

/// Codecs acceptés par le lecteur.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioCodec {
    Pcm,
    Flac,
    Opus,
}

impl AudioCodec {
    pub fn as_str(&self) -> &'static str {
        match self {
            AudioCodec::Pcm => "pcm",
            AudioCodec::Flac => "flac",
            AudioCodec::Opus => "opus",
        }
    }
}

impl FromStr for AudioCodec {
    type Err = AudioError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pcm" => Ok(AudioCodec::Pcm),
            "flac" => Ok(AudioCodec::Flac),
            "opus" => Ok(AudioCodec::Opus),
            other => Err(AudioError::UnsupportedFormat(format!(
                "unknown codec '{other}'"
            ))),
        }
    }
}

impl fmt::Display for AudioCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Format d'un flux, immuable pour toute sa durée de vie.
/// Un nouveau `stream/start` peut en changer ; décodeur et tampon sont alors
/// reconstruits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub codec: AudioCodec,
    pub sample_rate: u32,
    pub channels: u16,
    /// Profondeur de bits ; requise pour le PCM, indicative sinon.
    pub bit_depth: Option<u8>,
}

impl AudioFormat {
    /// Durée d'une frame (un échantillon par canal), en µs.
    pub fn micros_per_frame(&self) -> f64 {
        1e6 / self.sample_rate as f64
    }

    /// Nombre d'échantillons entrelacés pour une durée donnée.
    pub fn samples_for_millis(&self, millis: u64) -> usize {
        (self.sample_rate as u64 * millis / 1000) as usize * self.channels as usize
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} Hz {}ch",
            self.codec, self.sample_rate, self.channels
        )?;
        if let Some(bits) = self.bit_depth {
            write!(f, " {}bit", bits)?;
        }
        Ok(())
    }
}
