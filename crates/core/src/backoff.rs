//! Retry backoff: super-linear growth with bounded randomized jitter.
//!
//! `growth = BASE + retries^FACTOR` seconds, jittered by
//! `± ceil(ln(growth + random(growth/2 ..= growth)))` so that many jobs
//! failing in lockstep do not retry in lockstep.

use rand::Rng;
use std::collections::HashMap;

/// Base seconds added to every retry delay.
pub const GROWTH_BASE: u64 = 5;
/// Exponent applied to the retry count.
pub const GROWTH_FACTOR: u32 = 4;

/// Unjittered delay in seconds for the given retry count.
pub fn growth(retries: u32) -> u64 {
    GROWTH_BASE + (retries as u64).pow(GROWTH_FACTOR)
}

/// Largest jitter magnitude the jitter function can produce for a growth
/// value: the random term is at most `growth`, so the bound is
/// `ceil(ln(2 * growth))`.
pub fn max_jitter(growth: u64) -> u64 {
    if growth == 0 {
        return 0;
    }
    ((2 * growth) as f64).ln().ceil() as u64
}

/// Jittered retry delay in seconds for the given retry count.
///
/// `overrides` maps a retry count to a fixed growth value replacing the
/// computed one for that count; jitter still applies.
pub fn retry_delay_secs(retries: u32, overrides: &HashMap<u32, u64>) -> u64 {
    let g = overrides
        .get(&retries)
        .copied()
        .unwrap_or_else(|| growth(retries));
    jittered(g)
}

fn jittered(growth: u64) -> u64 {
    if growth == 0 {
        return 0;
    }

    let mut rng = rand::rng();
    let low = (growth / 2).max(1);
    let sample = rng.random_range(low..=growth.max(low));
    let jitter = ((growth + sample) as f64).ln().ceil() as i64;
    let jitter = if rng.random_bool(0.5) { jitter } else { -jitter };

    (growth as i64 + jitter).max(0) as u64
}
