//! Radio signal and timing calculations for a 2.4 GHz IEEE 802.15.4 O-QPSK PHY.
//!
//! Contains helpers for:
//! - Log-distance path loss with optional log-normal shadowing
//! - Byte, frame and turnaround durations in fast-clock ticks
//! - dBm/mW conversion and the transceiver's RSSI register encoding
//!
//! Units:
//! - Power: dBm, mW (conversion provided)
//! - Time: microseconds for PHY constants, fast-clock ticks for the API
//! - Distance: meters

use rand::Rng;
use rand_distr::{Distribution, Normal};
use serde::Deserialize;

use crate::flood::FastTicks;
use crate::flood::engine::FAST_CLOCK_HZ;

/// One byte at 250 kbit/s.
pub const BYTE_DURATION_US: f64 = 32.0;

/// RX/TX turnaround: 12 symbol periods of 16 µs.
pub const TX_TURNAROUND_US: f64 = 192.0;

/// Preamble (4 bytes) and SFD (1 byte) precede the SFD edge.
pub const SYNC_HEADER_BYTES: usize = 5;

/// Offset between the RSSI register and the input power (dBm = RSSI + offset).
pub const RSSI_OFFSET_DBM: f32 = -45.0;

/// Parameters defining the radio channel propagation model.
///
/// The constants of the log-distance path loss model with log-normal
/// shadowing. Shadowing is sampled once per directed link when the network
/// is built, so a link keeps its quality for the whole run.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct PathLossParameters {
    /// Path loss exponent (n).
    ///
    /// - n = 2.0: Free space
    /// - n = 2.7 to 3.5: Urban areas
    /// - n = 3.0 to 5.0: Indoor obstructed environments
    pub path_loss_exponent: f32,

    /// Standard deviation for log-normal shadowing (σ) in dB. 0.0 disables shadowing.
    pub shadowing_sigma: f32,

    /// Path loss at the reference distance d₀ = 1 m in dB.
    pub path_loss_at_reference_distance: f32,
}

/// Microseconds to fast-clock ticks, rounded to nearest.
pub fn us_to_fast_ticks(us: f64) -> FastTicks {
    (us * FAST_CLOCK_HZ as f64 / 1_000_000.0).round() as FastTicks
}

pub fn byte_ticks() -> FastTicks {
    us_to_fast_ticks(BYTE_DURATION_US)
}

/// From the transmit strobe to the SFD edge of the outgoing frame.
pub fn tx_start_delay() -> FastTicks {
    us_to_fast_ticks(TX_TURNAROUND_US + SYNC_HEADER_BYTES as f64 * BYTE_DURATION_US)
}

/// SFD high time for a frame whose length byte is followed by
/// `packet_len` bytes (including the FCS).
pub fn frame_air_ticks(packet_len: usize) -> FastTicks {
    us_to_fast_ticks((1 + packet_len) as f64 * BYTE_DURATION_US)
}

/// Calculate the path loss (in dB) at a given distance using a log-distance
/// path loss model with log-normal shadowing.
///
/// ```text
/// PL(d) = PL(d₀) + 10 × n × log₁₀(d/d₀) + X_σ
/// ```
///
/// For distances below 1 m the reference loss is used without further
/// attenuation. `X_σ` is drawn from `rng`, so a seeded generator makes the
/// result reproducible.
pub fn calculate_path_loss<R: Rng + ?Sized>(distance: f32, params: &PathLossParameters, rng: &mut R) -> f32 {
    let path_loss = if distance < 1.0 {
        params.path_loss_at_reference_distance
    } else {
        params.path_loss_at_reference_distance + 10.0 * params.path_loss_exponent * distance.log10()
    };
    let shadowing = if params.shadowing_sigma > 0.0 {
        match Normal::new(0.0_f32, params.shadowing_sigma) {
            Ok(normal) => normal.sample(rng),
            Err(e) => {
                log::warn!("Shadowing disabled: {}", e);
                0.0
            }
        }
    } else {
        0.0
    };
    path_loss + shadowing
}

/// Received power in dBm for a transmitter `distance` meters away.
pub fn calculate_rssi<R: Rng + ?Sized>(distance: f32, tx_power_dbm: f32, params: &PathLossParameters, rng: &mut R) -> f32 {
    tx_power_dbm - calculate_path_loss(distance, params, rng)
}

pub fn dbm_to_mw(dbm: f32) -> f64 {
    10f64.powf(dbm as f64 / 10.0)
}

pub fn mw_to_dbm(mw: f64) -> f32 {
    (10.0 * mw.log10()) as f32
}

/// Value the transceiver writes into the first footer byte.
pub fn rssi_register(dbm: f32) -> u8 {
    let value = (dbm - RSSI_OFFSET_DBM).round().clamp(i8::MIN as f32, i8::MAX as f32) as i8;
    value as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn params(sigma: f32) -> PathLossParameters {
        PathLossParameters {
            path_loss_exponent: 3.0,
            shadowing_sigma: sigma,
            path_loss_at_reference_distance: 40.0,
        }
    }

    #[test]
    fn phy_durations_in_fast_ticks() {
        assert_eq!(byte_ticks(), 134);
        assert_eq!(tx_start_delay(), 1476);
        // 10-byte packet plus length byte
        assert_eq!(frame_air_ticks(10), 1476);
    }

    #[test]
    fn path_loss_without_shadowing_is_deterministic() {
        let mut rng = StdRng::seed_from_u64(1);
        let loss = calculate_path_loss(100.0, &params(0.0), &mut rng);
        assert!((loss - 100.0).abs() < 1e-4);
        assert_eq!(calculate_path_loss(0.5, &params(0.0), &mut rng), 40.0);
        let rssi = calculate_rssi(10.0, 0.0, &params(0.0), &mut rng);
        assert!((rssi + 70.0).abs() < 1e-4);
    }

    #[test]
    fn shadowing_is_reproducible_with_a_seed() {
        let a = calculate_path_loss(50.0, &params(6.0), &mut StdRng::seed_from_u64(7));
        let b = calculate_path_loss(50.0, &params(6.0), &mut StdRng::seed_from_u64(7));
        assert_eq!(a, b);
    }

    #[test]
    fn power_conversions() {
        assert!((dbm_to_mw(0.0) - 1.0).abs() < 1e-9);
        assert!((mw_to_dbm(dbm_to_mw(-80.0) * 2.0) + 76.99).abs() < 0.01);
        assert_eq!(rssi_register(-45.0), 0);
        assert_eq!(rssi_register(-80.0) as i8, -35);
    }
}
