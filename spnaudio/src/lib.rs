#![doc = r#"
spnaudio - Chaîne de lecture audio synchronisée

Cette crate contient la moitié audio du lecteur : décodage des chunks reçus
du réseau, tampon temporel à correction fine, et restitution via cpal.

# Architecture

```text
réseau ──chunk encodé + ts serveur──► AudioPipeline
                                          │ decode (scratch pré-alloué)
                                          ▼
                                     TimedBuffer ◄── SharedClock (conversion
                                          │          ts serveur → local)
                              callback temps réel
                                          ▼
                                  CpalSink / NullSink
```

Trois threads se partagent le travail :

- le thread de réception réseau écrit dans le tampon (`process_chunk`) ;
- le callback du sink lit le tampon à son rythme matériel ;
- les opérations de cycle de vie (start/clear/stop) arrivent par
  l'orchestrateur de session.

Le tampon est l'unique état partagé entre réseau et audio, toujours manipulé
sous son mutex. Voir [`timed_buffer`] pour la sémantique de correction
(drop/insert, zone morte, ré-ancrage).
"#]

mod decoder;
mod error;
mod format;
mod pipeline;
mod sink;
mod timed_buffer;

pub use decoder::{make_decoder, Decoder, FlacDecoder, OpusDecoder, PcmDecoder};
pub use error::AudioError;
pub use format::{AudioCodec, AudioFormat};
pub use pipeline::{AudioPipeline, PipelineConfig, PipelineState, SinkFactory, StateHook};
pub use sink::{AudioSink, CpalSink, NullSink, SampleSource, SinkErrorHook};
pub use timed_buffer::{BufferStats, CorrectionMode, TimedBuffer};
