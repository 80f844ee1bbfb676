//! Convergence du filtre sur des échanges réseau simulés.

use spnsync::{KalmanConfig, MeasurementQuad, SharedClock};

/// Générateur déterministe de jitter (LCG), pour des tests reproductibles.
struct Jitter(u64);

impl Jitter {
    fn next_micros(&mut self, max: i64) -> i64 {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        ((self.0 >> 33) as i64) % max
    }
}

/// Fabrique un échange avec délais aller/retour asymétriques.
fn exchange(t1: i64, true_offset: i64, up_micros: i64, down_micros: i64) -> MeasurementQuad {
    let t2 = t1 + up_micros + true_offset;
    let t3 = t2 + 150; // temps de traitement serveur
    let t4 = t3 - true_offset + down_micros;
    MeasurementQuad { t1, t2, t3, t4 }
}

#[test]
fn test_constant_offset_estimated_within_tolerance() {
    // Offset vrai : 1 s. Jitter réseau : 2-6 ms par sens.
    let clock = SharedClock::new(KalmanConfig::default());
    let mut jitter = Jitter(7);
    let true_offset = 1_000_000;

    for i in 0..40 {
        let t1 = i * 500_000;
        let up = 2_000 + jitter.next_micros(4_000);
        let down = 2_000 + jitter.next_micros(4_000);
        clock.add_measurement(&exchange(t1, true_offset, up, down));
    }

    let status = clock.status();
    assert!(status.is_converged);
    assert!(
        (status.offset_micros - true_offset as f64).abs() < 2_000.0,
        "offset {} vs truth {}",
        status.offset_micros,
        true_offset
    );

    // La conversion aller-retour retombe sur ses pieds.
    let t = 25_000_000;
    let round_trip = clock
        .client_to_server_micros(t)
        .and_then(|s| clock.server_to_client_micros(s))
        .unwrap();
    assert!((round_trip - t).abs() < 2_000);
}

#[test]
fn test_reset_forgets_everything_between_sessions() {
    let clock = SharedClock::new(KalmanConfig::default());
    for i in 0..10 {
        clock.add_measurement(&exchange(i * 500_000, 123_456, 3_000, 3_000));
    }
    assert!(clock.has_minimal_sync());

    clock.reset();
    assert!(!clock.has_minimal_sync());
    assert_eq!(clock.measurement_count(), 0);
    assert!(clock.server_to_client_micros(0).is_none());
}
