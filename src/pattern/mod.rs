//! Time-varying rate patterns
//!
//! A pattern maps elapsed time to an instantaneous target rate in Mb/s.
//! Evaluation is a plain match over a tagged enum so the hot loop inlines
//! it; the stochastic variants draw from the calling worker's own PRNG.

use crate::{Error, Result};
use rand::rngs::SmallRng;
use rand::Rng;
use serde::Deserialize;

/// Decay constant for the DECAY pattern
const DECAY_K: f64 = 5.0;

/// Rate pattern descriptor
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RatePattern {
    /// Fixed rate
    Constant { rate: f64 },
    /// Linear increase from base to peak over each period
    RampUp { base: f64, peak: f64, period_sec: f64 },
    /// Linear decrease from peak to base over each period
    RampDown { base: f64, peak: f64, period_sec: f64 },
    /// Sine oscillation between min and max
    Sine { min: f64, max: f64, period_sec: f64 },
    /// Peak rate for burst_ms, then silence for idle_ms
    Burst { peak: f64, burst_ms: u32, idle_ms: u32 },
    /// Alternate base and peak every period
    Step { base: f64, peak: f64, period_sec: f64 },
    /// Exponential decay from peak toward base within each period
    Decay { base: f64, peak: f64, period_sec: f64 },
    /// Triangle wave between base and peak
    Cyclic { base: f64, peak: f64, period_sec: f64 },
    /// Poisson-scaled rate around `mean`, capped at peak
    Poisson { mean: f64, peak: f64 },
    /// Exponentially distributed rate clamped to [base, peak]
    Exponential { mean: f64, base: f64, peak: f64 },
    /// Normally distributed rate clamped to [base, peak]
    Normal { mean: f64, stddev: f64, base: f64, peak: f64 },
}

impl RatePattern {
    /// Highest rate this pattern can emit, used for clamping and validation
    pub fn peak(&self) -> f64 {
        match *self {
            RatePattern::Constant { rate } => rate,
            RatePattern::RampUp { peak, .. }
            | RatePattern::RampDown { peak, .. }
            | RatePattern::Burst { peak, .. }
            | RatePattern::Step { peak, .. }
            | RatePattern::Decay { peak, .. }
            | RatePattern::Cyclic { peak, .. }
            | RatePattern::Poisson { peak, .. }
            | RatePattern::Exponential { peak, .. }
            | RatePattern::Normal { peak, .. } => peak,
            RatePattern::Sine { max, .. } => max,
        }
    }

    /// Instantaneous rate in Mb/s at `elapsed_sec` since pattern start,
    /// clamped to [0, peak]
    #[inline]
    pub fn evaluate(&self, elapsed_sec: f64, rng: &mut SmallRng) -> f64 {
        let rate = match *self {
            RatePattern::Constant { rate } => rate,

            RatePattern::RampUp {
                base,
                peak,
                period_sec,
            } => {
                let progress = (elapsed_sec % period_sec) / period_sec;
                base + (peak - base) * progress
            }

            RatePattern::RampDown {
                base,
                peak,
                period_sec,
            } => {
                let progress = (elapsed_sec % period_sec) / period_sec;
                peak - (peak - base) * progress
            }

            RatePattern::Sine {
                min,
                max,
                period_sec,
            } => {
                let phase = (elapsed_sec % period_sec) / period_sec;
                let amplitude = (max - min) / 2.0;
                let offset = (max + min) / 2.0;
                offset + amplitude * (2.0 * std::f64::consts::PI * phase).sin()
            }

            RatePattern::Burst {
                peak,
                burst_ms,
                idle_ms,
            } => {
                let cycle_ms = (burst_ms + idle_ms) as u64;
                let elapsed_ms = (elapsed_sec * 1000.0) as u64 % cycle_ms;
                if elapsed_ms < burst_ms as u64 {
                    peak
                } else {
                    0.0
                }
            }

            RatePattern::Step {
                base,
                peak,
                period_sec,
            } => {
                let step = (elapsed_sec / period_sec) as u64 % 2;
                if step == 1 {
                    peak
                } else {
                    base
                }
            }

            RatePattern::Decay {
                base,
                peak,
                period_sec,
            } => {
                let progress = (elapsed_sec % period_sec) / period_sec;
                base + (peak - base) * (-DECAY_K * progress).exp()
            }

            RatePattern::Cyclic {
                base,
                peak,
                period_sec,
            } => {
                let progress = (elapsed_sec % period_sec) / period_sec;
                if progress < 0.5 {
                    base + 2.0 * (peak - base) * progress
                } else {
                    peak - 2.0 * (peak - base) * (progress - 0.5)
                }
            }

            RatePattern::Poisson { mean, peak } => {
                // Lambda is bounded so Knuth's product sampler stays cheap;
                // the mean rate is preserved by rescaling.
                let lambda = mean.min(32.0);
                let sample = sample_poisson(rng, lambda);
                (mean * sample / lambda).min(peak)
            }

            RatePattern::Exponential { mean, base, peak } => {
                sample_exponential(rng, mean).clamp(base, peak)
            }

            RatePattern::Normal {
                mean,
                stddev,
                base,
                peak,
            } => sample_normal(rng, mean, stddev).clamp(base, peak),
        };

        rate.clamp(0.0, self.peak())
    }

    /// Configure-time validation
    pub fn validate(&self) -> Result<()> {
        let bad = |msg: &str| Err(Error::InvalidConfig(format!("pattern: {}", msg)));
        match *self {
            RatePattern::Constant { rate } => {
                if rate < 0.0 {
                    return bad("rate must be non-negative");
                }
            }
            RatePattern::RampUp { period_sec, .. }
            | RatePattern::RampDown { period_sec, .. }
            | RatePattern::Step { period_sec, .. }
            | RatePattern::Decay { period_sec, .. }
            | RatePattern::Cyclic { period_sec, .. } => {
                if period_sec <= 0.0 {
                    return bad("period_sec must be positive");
                }
            }
            RatePattern::Sine {
                min,
                max,
                period_sec,
            } => {
                if period_sec <= 0.0 {
                    return bad("period_sec must be positive");
                }
                if min > max {
                    return bad("min must not exceed max");
                }
            }
            RatePattern::Burst {
                burst_ms, idle_ms, ..
            } => {
                if burst_ms + idle_ms == 0 {
                    return bad("burst and idle durations cannot both be zero");
                }
            }
            RatePattern::Poisson { mean, .. } => {
                if mean <= 0.0 {
                    return bad("mean must be positive");
                }
            }
            RatePattern::Exponential { mean, base, peak } => {
                if mean <= 0.0 {
                    return bad("mean must be positive");
                }
                if base > peak {
                    return bad("base must not exceed peak");
                }
            }
            RatePattern::Normal {
                stddev, base, peak, ..
            } => {
                if stddev < 0.0 {
                    return bad("stddev must be non-negative");
                }
                if base > peak {
                    return bad("base must not exceed peak");
                }
            }
        }
        if self.peak() < 0.0 {
            return bad("peak must be non-negative");
        }
        Ok(())
    }
}

/// Inverse-transform exponential variate
#[inline]
fn sample_exponential(rng: &mut SmallRng, mean: f64) -> f64 {
    let u: f64 = rng.gen();
    -mean * (1.0 - u).ln()
}

/// Box-Muller normal variate
#[inline]
fn sample_normal(rng: &mut SmallRng, mean: f64, stddev: f64) -> f64 {
    let u1: f64 = rng.gen::<f64>().max(f64::MIN_POSITIVE);
    let u2: f64 = rng.gen();
    let z0 = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos();
    mean + stddev * z0
}

/// Knuth's Poisson sampler; adequate for the small lambdas used here
#[inline]
fn sample_poisson(rng: &mut SmallRng, lambda: f64) -> f64 {
    let limit = (-lambda).exp();
    let mut p = 1.0;
    let mut k: u64 = 0;
    loop {
        k += 1;
        p *= rng.gen::<f64>();
        if p <= limit {
            break;
        }
    }
    (k - 1) as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn rng() -> SmallRng {
        SmallRng::seed_from_u64(0x5eed)
    }

    #[test]
    fn test_constant() {
        let p = RatePattern::Constant { rate: 500.0 };
        assert_eq!(p.evaluate(0.0, &mut rng()), 500.0);
        assert_eq!(p.evaluate(1234.5, &mut rng()), 500.0);
    }

    #[test]
    fn test_ramp_up() {
        let p = RatePattern::RampUp {
            base: 100.0,
            peak: 1100.0,
            period_sec: 10.0,
        };
        assert!((p.evaluate(0.0, &mut rng()) - 100.0).abs() < 1e-9);
        assert!((p.evaluate(5.0, &mut rng()) - 600.0).abs() < 1e-9);
        // Wraps at the period boundary
        assert!((p.evaluate(10.0, &mut rng()) - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_ramp_down() {
        let p = RatePattern::RampDown {
            base: 100.0,
            peak: 1100.0,
            period_sec: 10.0,
        };
        assert!((p.evaluate(0.0, &mut rng()) - 1100.0).abs() < 1e-9);
        assert!((p.evaluate(5.0, &mut rng()) - 600.0).abs() < 1e-9);
    }

    #[test]
    fn test_sine_bounds_and_midpoint() {
        let p = RatePattern::Sine {
            min: 200.0,
            max: 800.0,
            period_sec: 4.0,
        };
        assert!((p.evaluate(0.0, &mut rng()) - 500.0).abs() < 1e-9);
        assert!((p.evaluate(1.0, &mut rng()) - 800.0).abs() < 1e-6);
        assert!((p.evaluate(3.0, &mut rng()) - 200.0).abs() < 1e-6);
        for t in 0..100 {
            let rate = p.evaluate(t as f64 * 0.13, &mut rng());
            assert!((200.0..=800.0).contains(&rate));
        }
    }

    #[test]
    fn test_burst_duty_cycle() {
        let p = RatePattern::Burst {
            peak: 1000.0,
            burst_ms: 50,
            idle_ms: 150,
        };
        assert_eq!(p.evaluate(0.010, &mut rng()), 1000.0);
        assert_eq!(p.evaluate(0.049, &mut rng()), 1000.0);
        assert_eq!(p.evaluate(0.060, &mut rng()), 0.0);
        assert_eq!(p.evaluate(0.199, &mut rng()), 0.0);
        // Next cycle
        assert_eq!(p.evaluate(0.210, &mut rng()), 1000.0);
    }

    #[test]
    fn test_step_alternates() {
        let p = RatePattern::Step {
            base: 100.0,
            peak: 900.0,
            period_sec: 2.0,
        };
        assert_eq!(p.evaluate(1.0, &mut rng()), 100.0);
        assert_eq!(p.evaluate(3.0, &mut rng()), 900.0);
        assert_eq!(p.evaluate(5.0, &mut rng()), 100.0);
    }

    #[test]
    fn test_decay_monotone_within_period() {
        let p = RatePattern::Decay {
            base: 100.0,
            peak: 1000.0,
            period_sec: 10.0,
        };
        let start = p.evaluate(0.0, &mut rng());
        let mid = p.evaluate(5.0, &mut rng());
        let late = p.evaluate(9.9, &mut rng());
        assert!((start - 1000.0).abs() < 1e-9);
        assert!(mid < start);
        assert!(late < mid);
        assert!(late >= 100.0);
    }

    #[test]
    fn test_cyclic_triangle() {
        let p = RatePattern::Cyclic {
            base: 0.0,
            peak: 1000.0,
            period_sec: 10.0,
        };
        assert!((p.evaluate(0.0, &mut rng()) - 0.0).abs() < 1e-9);
        assert!((p.evaluate(2.5, &mut rng()) - 500.0).abs() < 1e-9);
        assert!((p.evaluate(5.0, &mut rng()) - 1000.0).abs() < 1e-9);
        assert!((p.evaluate(7.5, &mut rng()) - 500.0).abs() < 1e-9);
    }

    #[test]
    fn test_stochastic_within_bounds() {
        let mut r = rng();
        let exp = RatePattern::Exponential {
            mean: 300.0,
            base: 100.0,
            peak: 900.0,
        };
        let norm = RatePattern::Normal {
            mean: 500.0,
            stddev: 100.0,
            base: 100.0,
            peak: 900.0,
        };
        let pois = RatePattern::Poisson {
            mean: 4.0,
            peak: 900.0,
        };
        for t in 0..1000 {
            let t = t as f64 * 0.01;
            let e = exp.evaluate(t, &mut r);
            assert!((100.0..=900.0).contains(&e));
            let n = norm.evaluate(t, &mut r);
            assert!((100.0..=900.0).contains(&n));
            let p = pois.evaluate(t, &mut r);
            assert!((0.0..=900.0).contains(&p));
        }
    }

    #[test]
    fn test_deterministic_variants_are_pure() {
        let patterns = [
            RatePattern::Constant { rate: 100.0 },
            RatePattern::RampUp {
                base: 0.0,
                peak: 100.0,
                period_sec: 5.0,
            },
            RatePattern::Sine {
                min: 10.0,
                max: 90.0,
                period_sec: 3.0,
            },
            RatePattern::Burst {
                peak: 100.0,
                burst_ms: 10,
                idle_ms: 10,
            },
            RatePattern::Step {
                base: 10.0,
                peak: 90.0,
                period_sec: 1.0,
            },
        ];
        for p in &patterns {
            for t in 0..50 {
                let t = t as f64 * 0.37;
                assert_eq!(p.evaluate(t, &mut rng()), p.evaluate(t, &mut rng()));
            }
        }
    }

    #[test]
    fn test_validation() {
        assert!(RatePattern::Constant { rate: 100.0 }.validate().is_ok());
        assert!(RatePattern::Sine {
            min: 0.0,
            max: 100.0,
            period_sec: 0.0
        }
        .validate()
        .is_err());
        assert!(RatePattern::RampUp {
            base: 0.0,
            peak: 100.0,
            period_sec: 0.0
        }
        .validate()
        .is_err());
        assert!(RatePattern::Burst {
            peak: 100.0,
            burst_ms: 0,
            idle_ms: 0
        }
        .validate()
        .is_err());
        assert!(RatePattern::Poisson {
            mean: 0.0,
            peak: 100.0
        }
        .validate()
        .is_err());
    }

    #[test]
    fn test_validation_rejects_inverted_bounds() {
        assert!(RatePattern::Normal {
            mean: 500.0,
            stddev: 10.0,
            base: 900.0,
            peak: 100.0
        }
        .validate()
        .is_err());
        assert!(RatePattern::Exponential {
            mean: 300.0,
            base: 900.0,
            peak: 100.0
        }
        .validate()
        .is_err());
        assert!(RatePattern::Sine {
            min: 800.0,
            max: 200.0,
            period_sec: 5.0
        }
        .validate()
        .is_err());
    }

    #[test]
    fn test_pattern_json() {
        let p: RatePattern =
            serde_json::from_str(r#"{"type":"sine","min":100.0,"max":500.0,"period_sec":10.0}"#)
                .unwrap();
        assert_eq!(
            p,
            RatePattern::Sine {
                min: 100.0,
                max: 500.0,
                period_sec: 10.0
            }
        );
    }
}
