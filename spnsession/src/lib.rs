//! # spnsession - Session de lecteur synchronisé
//!
//! Cette crate relie les briques du lecteur en une session complète :
//!
//! - [`transport`] : le canal WebSocket (handshake, envois sérialisés,
//!   reconnexion à backoff exponentiel, annulation coopérative) ;
//! - [`sync_driver`] : les rafales `client/time` qui alimentent le filtre
//!   d'horloge, avec sélection du meilleur RTT et intervalle adaptatif ;
//! - [`session`] : l'orchestrateur qui route les messages entrants vers
//!   l'horloge, le pilote ou le pipeline audio, et qui répond aux demandes
//!   de ré-ancrage du tampon.
//!
//! # Threads et tâches
//!
//! ```text
//! tâche de routage (par connexion) ──mpsc──► Session::run (orchestrateur)
//! tâche pilote de synchro          ◄─mpsc──          │
//!                                                    ▼
//!                                             AudioPipeline
//!                                      (callback sink sur son thread)
//! ```
//!
//! La tâche de réception ne bloque jamais sur l'audio : elle pousse les
//! trames classées dans un canal et l'orchestrateur fait le reste.

mod error;
mod session;
mod sync_driver;
mod transport;

pub use error::SessionError;
pub use session::{Session, SessionConfig, SessionEvents};
pub use sync_driver::{spawn_sync_driver, SyncDriverConfig, SyncDriverHandle};
pub use transport::{
    normalize_url, BackoffConfig, Connection, InboundEvent, SessionState, Transport, WsSender,
    DEFAULT_WS_PATH, HANDSHAKE_TIMEOUT,
};
