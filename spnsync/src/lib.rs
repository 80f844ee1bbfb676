//! # spnsync - Horloge monotone et synchronisation d'horloges
//!
//! Cette crate fournit les deux briques temporelles du lecteur :
//!
//! - [`monotonic`] : une source de temps microseconde process-wide, filtrée
//!   contre les sauts du compteur matériel (hyperviseurs, suspend/resume).
//! - [`kalman`] : l'estimateur offset/dérive entre l'horloge monotone locale
//!   et celle du serveur, alimenté par des échanges NTP à quatre timestamps.
//!
//! # Architecture
//!
//! ```text
//! client/time ──► serveur ──► server/time
//!      T1            T2,T3         T4 (tamponné à la réception)
//!                     │
//!                     ▼
//!            MeasurementQuad ──► ClockFilter (Kalman 2 états)
//!                                     │
//!                                     ▼
//!                      server_to_client_micros() / client_to_server_micros()
//! ```
//!
//! Le filtre est partagé entre le pilote de synchronisation (écrivain) et le
//! tampon audio (lecteur, une conversion par écriture réseau) via
//! [`SharedClock`], un wrapper `Arc<Mutex<...>>` dont chaque opération prend
//! le verrou pour toute sa durée. Les conversions sont O(1).

pub mod kalman;
pub mod monotonic;

pub use kalman::{ClockFilter, ClockStatus, KalmanConfig, MeasurementQuad, SharedClock};
pub use monotonic::{now_micros, ClockDiagnostics, MonotonicClock};
