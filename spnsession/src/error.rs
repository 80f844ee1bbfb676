use thiserror::Error;

/// Erreurs du canal de session.
///
/// Les erreurs de connexion et de handshake sont fatales pour la tentative
/// en cours et déclenchent le backoff de reconnexion ; une trame invalide en
/// régime établi est journalisée sans fermer la session.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("connection failed: {0}")]
    Connect(String),

    #[error("websocket error: {0}")]
    WebSocket(String),

    #[error("handshake timed out waiting for server/hello")]
    HandshakeTimeout,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("connection closed by peer (code {code:?}): {reason}")]
    ClosedByPeer {
        code: Option<u16>,
        reason: String,
    },

    #[error("operation cancelled")]
    Cancelled,
}

impl From<spnproto::ProtocolError> for SessionError {
    fn from(err: spnproto::ProtocolError) -> Self {
        SessionError::Protocol(err.to_string())
    }
}
