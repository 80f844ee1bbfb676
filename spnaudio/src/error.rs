use thiserror::Error;

/// Erreurs de la chaîne audio.
///
/// Les erreurs de décodage ne sont jamais fatales : la frame fautive est
/// journalisée puis ignorée, le flux continue. Les erreurs de sink, elles,
/// font basculer le pipeline en état `Error`.
#[derive(Error, Debug)]
pub enum AudioError {
    #[error("audio buffer disposed")]
    Disposed,

    #[error("decode error: {0}")]
    Decode(String),

    #[error("audio sink error: {0}")]
    Sink(String),

    #[error("unsupported audio format: {0}")]
    UnsupportedFormat(String),
}
