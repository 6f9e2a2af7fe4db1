//! Retry Scheduling
//!
//! Pure exponential-backoff computation with randomized jitter. Kept free of
//! clocks and I/O so retry timing is testable deterministically.

use std::time::Duration;

use rand::Rng;

/// Jitter applied to every computed delay: ±30%.
pub const DEFAULT_JITTER_RATIO: f64 = 0.3;

/// Exponential delay for the given attempt, capped, without jitter.
///
/// Attempt numbers are 1-based (the first retry is attempt 1); attempt 0
/// yields no delay.
#[must_use]
pub fn capped_exponential_ms(attempt: u32, base_ms: u64, cap_ms: u64) -> u64 {
    if attempt == 0 {
        return 0;
    }
    let exponential = 2u64.saturating_pow(attempt - 1);
    base_ms.saturating_mul(exponential).min(cap_ms)
}

/// Backoff delay for a retry attempt: capped exponential with ±`jitter_ratio`
/// randomized jitter to avoid synchronized retry storms.
#[must_use]
pub fn backoff(attempt: u32, base_ms: u64, cap_ms: u64, jitter_ratio: f64) -> Duration {
    backoff_from(&mut rand::thread_rng(), attempt, base_ms, cap_ms, jitter_ratio)
}

/// [`backoff`] with an explicit randomness source, for deterministic tests.
pub fn backoff_from<R: Rng>(
    rng: &mut R,
    attempt: u32,
    base_ms: u64,
    cap_ms: u64,
    jitter_ratio: f64,
) -> Duration {
    let delay_ms = capped_exponential_ms(attempt, base_ms, cap_ms);
    if delay_ms == 0 {
        return Duration::ZERO;
    }
    let ratio = jitter_ratio.clamp(0.0, 1.0);
    let factor = rng.gen_range(1.0 - ratio..=1.0 + ratio);
    Duration::from_millis((delay_ms as f64 * factor) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attempt_zero_has_no_delay() {
        assert_eq!(capped_exponential_ms(0, 500, 60_000), 0);
        assert_eq!(backoff(0, 500, 60_000, 0.3), Duration::ZERO);
    }

    #[test]
    fn exponential_growth_is_monotonic_up_to_cap() {
        let mut prev = 0;
        for attempt in 1..=16 {
            let d = capped_exponential_ms(attempt, 500, 60_000);
            assert!(d >= prev, "delay shrank at attempt {attempt}");
            assert!(d <= 60_000);
            prev = d;
        }
        // Well past the cap the delay stays pinned to it
        assert_eq!(capped_exponential_ms(40, 500, 60_000), 60_000);
    }

    #[test]
    fn exponential_doubles_before_cap() {
        assert_eq!(capped_exponential_ms(1, 500, 60_000), 500);
        assert_eq!(capped_exponential_ms(2, 500, 60_000), 1_000);
        assert_eq!(capped_exponential_ms(3, 500, 60_000), 2_000);
        assert_eq!(capped_exponential_ms(4, 500, 60_000), 4_000);
    }

    #[test]
    fn jitter_stays_within_thirty_percent_of_theoretical() {
        let mut rng = rand::thread_rng();
        for attempt in 1..=10 {
            let theoretical = capped_exponential_ms(attempt, 500, 60_000) as f64;
            for _ in 0..100 {
                let d = backoff_from(&mut rng, attempt, 500, 60_000, 0.3).as_millis() as f64;
                assert!(d >= (theoretical * 0.7).floor());
                assert!(d <= (theoretical * 1.3).ceil());
            }
        }
    }

    #[test]
    fn zero_jitter_is_exact() {
        let mut rng = rand::thread_rng();
        let d = backoff_from(&mut rng, 3, 500, 60_000, 0.0);
        assert_eq!(d, Duration::from_millis(2_000));
    }

    #[test]
    fn huge_attempts_do_not_overflow() {
        assert_eq!(capped_exponential_ms(u32::MAX, 500, 60_000), 60_000);
    }
}
