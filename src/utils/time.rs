//! TSC-based timestamping for sub-microsecond pacing
//!
//! Workers pace emission by comparing raw cycle counts; conversion to
//! nanoseconds happens only where a wall-clock quantity is needed (the
//! correlation tag and the latency summary). The calibration is a
//! two-point sample against CLOCK_MONOTONIC taken once at engine startup.

use std::time::Duration;

/// Read the time-stamp counter
#[inline(always)]
pub fn read_tsc() -> u64 {
    #[cfg(target_arch = "x86_64")]
    {
        unsafe {
            let mut low: u32;
            let mut high: u32;
            core::arch::asm!(
                "rdtsc",
                out("eax") low,
                out("edx") high,
                options(nostack, nomem, preserves_flags),
            );
            ((high as u64) << 32) | (low as u64)
        }
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        // Monotonic nanoseconds stand in for cycles; calibration then
        // measures a frequency of ~1 GHz and all conversions stay exact.
        monotonic_ns()
    }
}

/// Monotonic clock in nanoseconds
#[inline]
pub fn monotonic_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

/// Calibrated TSC clock
///
/// Immutable after construction; safe to share across cores behind an `Arc`.
#[derive(Debug, Clone, Copy)]
pub struct TscClock {
    tsc_hz: u64,
    tsc_base: u64,
    mono_base_ns: u64,
}

impl TscClock {
    /// Calibrate the counter frequency against CLOCK_MONOTONIC
    pub fn calibrate() -> Self {
        Self::calibrate_for(Duration::from_millis(25))
    }

    /// Calibrate over a specific sampling window
    pub fn calibrate_for(window: Duration) -> Self {
        // Warm the code paths before taking the first sample
        for _ in 0..100 {
            let _ = read_tsc();
            let _ = monotonic_ns();
        }

        let tsc0 = read_tsc();
        let mono0 = monotonic_ns();
        std::thread::sleep(window);
        let tsc1 = read_tsc();
        let mono1 = monotonic_ns();

        let tsc_delta = tsc1.wrapping_sub(tsc0);
        let mono_delta = mono1.saturating_sub(mono0);

        let tsc_hz = if tsc_delta == 0 || mono_delta == 0 {
            log::warn!("TSC calibration produced a zero delta, assuming 1 GHz");
            1_000_000_000
        } else {
            ((tsc_delta as u128 * 1_000_000_000) / mono_delta as u128) as u64
        };

        let tsc_base = read_tsc();
        let mono_base_ns = monotonic_ns();

        log::debug!("TSC calibrated: {} Hz", tsc_hz);

        Self {
            tsc_hz,
            tsc_base,
            mono_base_ns,
        }
    }

    /// Counter frequency in Hz
    #[inline]
    pub fn tsc_hz(&self) -> u64 {
        self.tsc_hz
    }

    /// Raw cycle count
    #[inline(always)]
    pub fn now_cycles(&self) -> u64 {
        read_tsc()
    }

    /// Current time in nanoseconds on the monotonic timeline
    #[inline(always)]
    pub fn now_ns(&self) -> u64 {
        let delta = read_tsc().wrapping_sub(self.tsc_base);
        self.mono_base_ns.wrapping_add(self.cycles_to_ns(delta))
    }

    /// Convert a cycle delta to nanoseconds
    #[inline]
    pub fn cycles_to_ns(&self, cycles: u64) -> u64 {
        (cycles as u128 * 1_000_000_000 / self.tsc_hz as u128) as u64
    }

    /// Convert a nanosecond interval to cycles
    #[inline]
    pub fn ns_to_cycles(&self, ns: u64) -> u64 {
        (ns as u128 * self.tsc_hz as u128 / 1_000_000_000) as u64
    }

    /// Seconds elapsed since `start_cycles`
    #[inline]
    pub fn elapsed_sec(&self, start_cycles: u64, now_cycles: u64) -> f64 {
        now_cycles.wrapping_sub(start_cycles) as f64 / self.tsc_hz as f64
    }

    /// Busy-wait for the given number of cycles
    #[inline]
    pub fn spin_cycles(&self, cycles: u64) {
        let start = read_tsc();
        while read_tsc().wrapping_sub(start) < cycles {
            std::hint::spin_loop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tsc_monotonic() {
        let a = read_tsc();
        let b = read_tsc();
        assert!(b >= a);
    }

    #[test]
    fn test_calibration_frequency_sane() {
        let clock = TscClock::calibrate_for(Duration::from_millis(20));
        // Any real CPU sits between 100 MHz and 10 GHz
        assert!(clock.tsc_hz() > 100_000_000);
        assert!(clock.tsc_hz() < 10_000_000_000);
    }

    #[test]
    fn test_cycles_ns_round_trip() {
        let clock = TscClock::calibrate_for(Duration::from_millis(20));
        let ns = 1_000_000u64; // 1 ms
        let cycles = clock.ns_to_cycles(ns);
        let back = clock.cycles_to_ns(cycles);
        let err = (back as i64 - ns as i64).abs();
        assert!(err < 1_000, "round trip error {} ns", err);
    }

    #[test]
    fn test_now_ns_advances() {
        let clock = TscClock::calibrate_for(Duration::from_millis(20));
        let t0 = clock.now_ns();
        std::thread::sleep(Duration::from_millis(5));
        let t1 = clock.now_ns();
        assert!(t1 > t0);
        let elapsed = t1 - t0;
        assert!(elapsed >= 4_000_000, "elapsed {} ns", elapsed);
        assert!(elapsed < 1_000_000_000, "elapsed {} ns", elapsed);
    }

    #[test]
    fn test_elapsed_sec() {
        let clock = TscClock::calibrate_for(Duration::from_millis(20));
        let start = clock.now_cycles();
        std::thread::sleep(Duration::from_millis(10));
        let elapsed = clock.elapsed_sec(start, clock.now_cycles());
        assert!(elapsed >= 0.009 && elapsed < 1.0, "elapsed {} s", elapsed);
    }
}
