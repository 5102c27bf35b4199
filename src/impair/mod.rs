//! Stochastic network impairments
//!
//! Per-packet drop / delay / duplicate / reorder decisions drawn from the
//! owning worker's PRNG. The only state beyond the generator is the
//! burst-loss run length, which is tracked per profile by the caller.

use crate::{Error, Result};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;

/// Per-profile impairment configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ImpairmentConfig {
    pub enabled: bool,

    /// Loss probability in percent (0-100)
    pub loss_rate: f64,

    /// When set, a fired drop extends to this many consecutive packets
    pub burst_length: Option<u32>,

    /// Fixed extra delay per packet
    pub fixed_delay_ns: u64,

    /// Uniform jitter bound; actual delay contribution is in [-jitter, +jitter]
    pub jitter_ns: u64,

    /// Reorder probability in percent (0-100)
    pub reorder_rate: f64,

    /// Duplicate probability in percent (0-100)
    pub duplicate_rate: f64,
}

impl ImpairmentConfig {
    pub fn validate(&self) -> Result<()> {
        for (name, rate) in [
            ("loss_rate", self.loss_rate),
            ("reorder_rate", self.reorder_rate),
            ("duplicate_rate", self.duplicate_rate),
        ] {
            if !(0.0..=100.0).contains(&rate) {
                return Err(Error::InvalidConfig(format!(
                    "impairment {} must be in [0, 100], got {}",
                    name, rate
                )));
            }
        }
        if self.burst_length == Some(0) {
            return Err(Error::InvalidConfig(
                "impairment burst_length must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Remaining packets of an in-progress loss burst
#[derive(Debug, Default)]
pub struct BurstLossState {
    remaining: u32,
}

/// Per-worker impairment decision engine
pub struct ImpairmentEngine {
    rng: SmallRng,
}

impl ImpairmentEngine {
    /// Seeded from the worker's first TSC read
    pub fn new(seed: u64) -> Self {
        Self {
            rng: SmallRng::seed_from_u64(seed),
        }
    }

    /// Whether this packet is dropped. A fired Bernoulli drop starts a
    /// burst of `burst_length` unconditional drops when burst mode is on.
    #[inline]
    pub fn should_drop(&mut self, cfg: &ImpairmentConfig, burst: &mut BurstLossState) -> bool {
        if !cfg.enabled || cfg.loss_rate == 0.0 {
            return false;
        }

        if burst.remaining > 0 {
            burst.remaining -= 1;
            return true;
        }

        if self.rng.gen::<f64>() < cfg.loss_rate / 100.0 {
            if let Some(len) = cfg.burst_length {
                burst.remaining = len.saturating_sub(1);
            }
            return true;
        }
        false
    }

    /// Extra transmit delay for this packet in nanoseconds
    #[inline]
    pub fn extra_delay_ns(&mut self, cfg: &ImpairmentConfig) -> u64 {
        if !cfg.enabled {
            return 0;
        }

        let mut delay = cfg.fixed_delay_ns as i64;
        if cfg.jitter_ns > 0 {
            let factor = self.rng.gen::<f64>() * 2.0 - 1.0;
            delay += (factor * cfg.jitter_ns as f64) as i64;
        }
        delay.max(0) as u64
    }

    /// Whether this packet gets a duplicate transmission
    #[inline]
    pub fn should_duplicate(&mut self, cfg: &ImpairmentConfig) -> bool {
        cfg.enabled
            && cfg.duplicate_rate > 0.0
            && self.rng.gen::<f64>() < cfg.duplicate_rate / 100.0
    }

    /// Whether this packet is held back behind its successor
    #[inline]
    pub fn should_reorder(&mut self, cfg: &ImpairmentConfig) -> bool {
        cfg.enabled && cfg.reorder_rate > 0.0 && self.rng.gen::<f64>() < cfg.reorder_rate / 100.0
    }

    /// Borrow the generator for pattern evaluation and source-port sampling
    #[inline]
    pub fn rng(&mut self) -> &mut SmallRng {
        &mut self.rng
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> ImpairmentEngine {
        ImpairmentEngine::new(0xfeed_beef)
    }

    fn lossy(rate: f64) -> ImpairmentConfig {
        ImpairmentConfig {
            enabled: true,
            loss_rate: rate,
            ..Default::default()
        }
    }

    #[test]
    fn test_disabled_never_fires() {
        let mut eng = engine();
        let cfg = ImpairmentConfig {
            enabled: false,
            loss_rate: 100.0,
            duplicate_rate: 100.0,
            fixed_delay_ns: 1_000_000,
            ..Default::default()
        };
        let mut burst = BurstLossState::default();
        for _ in 0..1000 {
            assert!(!eng.should_drop(&cfg, &mut burst));
            assert!(!eng.should_duplicate(&cfg));
            assert_eq!(eng.extra_delay_ns(&cfg), 0);
        }
    }

    #[test]
    fn test_loss_rate_extremes() {
        let mut eng = engine();
        let mut burst = BurstLossState::default();
        for _ in 0..1000 {
            assert!(!eng.should_drop(&lossy(0.0), &mut burst));
            assert!(eng.should_drop(&lossy(100.0), &mut burst));
        }
    }

    #[test]
    fn test_loss_rate_statistics() {
        // 1% over 1e6 packets: expect 10_000 with sigma ~100; allow 5 sigma
        let mut eng = engine();
        let cfg = lossy(1.0);
        let mut burst = BurstLossState::default();
        let mut drops = 0u64;
        for _ in 0..1_000_000 {
            if eng.should_drop(&cfg, &mut burst) {
                drops += 1;
            }
        }
        assert!(
            (9_500..=10_500).contains(&drops),
            "drops = {} outside 5 sigma",
            drops
        );
    }

    #[test]
    fn test_burst_loss_runs() {
        let mut eng = engine();
        let cfg = ImpairmentConfig {
            enabled: true,
            loss_rate: 2.0,
            burst_length: Some(8),
            ..Default::default()
        };
        let mut burst = BurstLossState::default();

        // Find a fired drop and verify the subsequent run is unconditional
        let mut runs = 0;
        let mut i = 0;
        while runs < 10 && i < 1_000_000 {
            i += 1;
            if eng.should_drop(&cfg, &mut burst) {
                for _ in 0..7 {
                    assert!(eng.should_drop(&cfg, &mut burst));
                }
                runs += 1;
            }
        }
        assert_eq!(runs, 10, "burst loss never fired");
    }

    #[test]
    fn test_delay_within_jitter_bounds() {
        let mut eng = engine();
        let cfg = ImpairmentConfig {
            enabled: true,
            fixed_delay_ns: 10_000,
            jitter_ns: 3_000,
            ..Default::default()
        };
        for _ in 0..10_000 {
            let d = eng.extra_delay_ns(&cfg);
            assert!((7_000..=13_000).contains(&d), "delay {} out of bounds", d);
        }
    }

    #[test]
    fn test_duplicate_statistics() {
        let mut eng = engine();
        let cfg = ImpairmentConfig {
            enabled: true,
            duplicate_rate: 5.0,
            ..Default::default()
        };
        let mut dups = 0u64;
        for _ in 0..100_000 {
            if eng.should_duplicate(&cfg) {
                dups += 1;
            }
        }
        // Expect 5000, sigma ~69; allow 5 sigma
        assert!((4_650..=5_350).contains(&dups), "dups = {}", dups);
    }

    #[test]
    fn test_validation() {
        assert!(ImpairmentConfig::default().validate().is_ok());
        assert!(lossy(101.0).validate().is_err());
        assert!(lossy(-1.0).validate().is_err());
        let cfg = ImpairmentConfig {
            burst_length: Some(0),
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }
}
