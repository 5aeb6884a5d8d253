//! Retry backoff: exponential with a jitter band.

use rand::Rng;

/// Exponent cap; beyond this the clamp to `max_ms` dominates anyway.
const MAX_EXPONENT: u32 = 16;

/// Lower jitter bound.
pub const JITTER_LOW: f64 = 0.8;
/// Upper jitter bound.
pub const JITTER_HIGH: f64 = 1.2;

/// `clamp(base * 2^min(16, attempts), base, max) * jitter`, jitter uniform
/// in `[0.8, 1.2]`.
pub fn backoff_delay_ms(base_ms: u64, max_ms: u64, attempts: u32) -> u64 {
    let jitter = rand::thread_rng().gen_range(JITTER_LOW..=JITTER_HIGH);
    jittered_delay_ms(base_ms, max_ms, attempts, jitter)
}

/// Deterministic core of [`backoff_delay_ms`], split out for tests.
pub fn jittered_delay_ms(base_ms: u64, max_ms: u64, attempts: u32, jitter: f64) -> u64 {
    let exponent = attempts.min(MAX_EXPONENT);
    let nominal = base_ms.saturating_mul(1u64 << exponent);
    let clamped = nominal.clamp(base_ms, max_ms.max(base_ms));
    (clamped as f64 * jitter).round() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_retry_lands_in_the_documented_band() {
        // attempts = 1, base 1000, max 60000: nominal 2000 ms, jitter band
        // [1600, 2400], inside the documented [800, 2400] envelope.
        assert_eq!(jittered_delay_ms(1000, 60_000, 1, JITTER_LOW), 1600);
        assert_eq!(jittered_delay_ms(1000, 60_000, 1, JITTER_HIGH), 2400);
        for _ in 0..64 {
            let delay = backoff_delay_ms(1000, 60_000, 1);
            assert!((800..=2400).contains(&delay), "delay {delay} out of band");
        }
    }

    #[test]
    fn delay_is_clamped_to_max() {
        assert_eq!(jittered_delay_ms(1000, 60_000, 16, 1.0), 60_000);
        // The exponent saturates at 16 even for absurd attempt counts.
        assert_eq!(jittered_delay_ms(1000, 60_000, 4000, 1.0), 60_000);
        // And never drops below base.
        assert_eq!(jittered_delay_ms(1000, 60_000, 0, 1.0), 1000);
    }
}
