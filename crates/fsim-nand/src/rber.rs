//! Analytic raw bit error rate model.
//!
//! `rber` is a pure function of (retention interval, program/erase count,
//! wordline layer): a power law in wear and retention time, Arrhenius-scaled
//! by temperature, with a deterministic per-layer variation profile.
//! `sampled_error_count` adds seeded Gaussian read noise on top for the
//! observed-error statistics.

use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

/// Activation energy of the retention mechanism, in eV.
const ACTIVATION_ENERGY_EV: f64 = 1.1;
/// Boltzmann constant in eV/K.
const BOLTZMANN_EV_PER_K: f64 = 8.617e-5;
/// Baseline junction temperature in K.
const ROOM_TEMPERATURE_K: f64 = 298.15;
/// Peak-to-trough spread of the per-layer variation profile.
const LAYER_SPREAD: f64 = 0.25;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RberConfig {
    /// Junction temperature in kelvin.
    pub temperature: f64,
    /// Error-rate floor of a freshly written page.
    pub epsilon: f64,
    /// Wear term coefficient (P/E-driven, retention-independent).
    pub alpha: f64,
    /// Retention term coefficient.
    pub beta: f64,
    /// Wear term P/E exponent.
    pub k_term: f64,
    /// Retention term P/E exponent.
    pub m_term: f64,
    /// Retention term time exponent.
    pub n_term: f64,
    /// Standard deviation (in bits) of the per-read noise.
    pub error_sigma: f64,
}

impl Default for RberConfig {
    fn default() -> Self {
        Self {
            temperature: 328.15,
            epsilon: 1.0e-5,
            alpha: 2.0e-9,
            beta: 5.0e-9,
            k_term: 1.1,
            m_term: 0.8,
            n_term: 1.0,
            error_sigma: 5.0,
        }
    }
}

/// RBER model instance bound to one device's page size and noise seed.
#[derive(Debug, Clone)]
pub struct RberModel {
    cfg: RberConfig,
    page_bits: f64,
    accel: f64,
    rng: StdRng,
}

impl RberModel {
    #[must_use]
    pub fn new(cfg: RberConfig, page_size_bytes: u32, seed: u64) -> Self {
        let accel = (ACTIVATION_ENERGY_EV / BOLTZMANN_EV_PER_K
            * (1.0 / ROOM_TEMPERATURE_K - 1.0 / cfg.temperature))
            .exp();
        Self {
            cfg,
            page_bits: f64::from(page_size_bytes) * 8.0,
            accel,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Deterministic per-layer variation: outer wordlines retain worse than
    /// the middle of the stack.
    #[must_use]
    fn layer_factor(layer: u32) -> f64 {
        let phase = f64::from(layer % 64) / 64.0 * std::f64::consts::TAU;
        1.0 + LAYER_SPREAD * phase.cos()
    }

    /// Predicted raw bit error rate after `retention_ns` of retention at
    /// `erase_count` P/E cycles on `layer`.
    #[must_use]
    pub fn rber(&self, retention_ns: u64, erase_count: u32, layer: u32) -> f64 {
        let pe = f64::from(erase_count);
        let t_eff = retention_ns as f64 * 1.0e-9 * self.accel;
        let wear = self.cfg.alpha * pe.powf(self.cfg.k_term);
        let retention = self.cfg.beta * (pe + 1.0).powf(self.cfg.m_term) * t_eff.powf(self.cfg.n_term);
        Self::layer_factor(layer) * (self.cfg.epsilon + wear + retention)
    }

    /// Sample an observed per-read error count: `rber * page_bits` plus
    /// Gaussian read noise, clamped at zero.
    pub fn sampled_error_count(&mut self, retention_ns: u64, erase_count: u32, layer: u32) -> u64 {
        let mean = self.rber(retention_ns, erase_count, layer) * self.page_bits;
        let noise = match Normal::new(0.0, self.cfg.error_sigma) {
            Ok(dist) => dist.sample(&mut self.rng),
            Err(_) => 0.0,
        };
        let count = (mean + noise).round();
        if count <= 0.0 {
            0
        } else {
            count as u64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model() -> RberModel {
        RberModel::new(RberConfig::default(), 8192, 42)
    }

    #[test]
    fn test_rber_monotonic_in_retention() {
        let m = model();
        let day = 86_400_000_000_000;
        let a = m.rber(day, 100, 0);
        let b = m.rber(30 * day, 100, 0);
        assert!(b > a, "longer retention must raise RBER ({b} > {a})");
    }

    #[test]
    fn test_rber_monotonic_in_wear() {
        let m = model();
        let day = 86_400_000_000_000;
        assert!(m.rber(day, 3_000, 0) > m.rber(day, 10, 0));
    }

    #[test]
    fn test_rber_layer_profile_bounded() {
        let m = model();
        let day = 86_400_000_000_000;
        let mid = m.rber(day, 100, 32);
        for layer in 0..64 {
            let r = m.rber(day, 100, layer);
            assert!(r > 0.0);
            assert!(r <= mid * (1.0 + LAYER_SPREAD) / (1.0 - LAYER_SPREAD) + f64::EPSILON);
        }
    }

    #[test]
    fn test_rber_pure_and_deterministic() {
        let m = model();
        assert_eq!(m.rber(1_000_000, 50, 7), m.rber(1_000_000, 50, 7));
    }

    #[test]
    fn test_sampled_errors_deterministic_per_seed() {
        let mut a = RberModel::new(RberConfig::default(), 8192, 7);
        let mut b = RberModel::new(RberConfig::default(), 8192, 7);
        let day = 86_400_000_000_000;
        for _ in 0..16 {
            assert_eq!(
                a.sampled_error_count(day, 500, 3),
                b.sampled_error_count(day, 500, 3)
            );
        }
    }

    #[test]
    fn test_hotter_device_degrades_faster() {
        let hot = RberModel::new(
            RberConfig {
                temperature: 358.15,
                ..RberConfig::default()
            },
            8192,
            1,
        );
        let cool = RberModel::new(
            RberConfig {
                temperature: 308.15,
                ..RberConfig::default()
            },
            8192,
            1,
        );
        let day = 86_400_000_000_000;
        assert!(hot.rber(day, 100, 0) > cool.rber(day, 100, 0));
    }
}
