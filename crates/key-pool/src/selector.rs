//! Weighted random choice
//!
//! Each candidate owns a slice of `[0, total)` as wide as its weight. A roll
//! uniform over that range lands in candidate `i` with probability
//! `w_i / Σw`. One candidate or equal weights need no special case.

use rand::RngExt;

/// Index of the candidate owning `roll`, where `roll < weights.sum()`.
///
/// `None` for an empty slice or an out-of-range roll.
pub fn pick(weights: &[u32], roll: u64) -> Option<usize> {
    let mut upper = 0u64;
    for (i, &w) in weights.iter().enumerate() {
        upper += u64::from(w);
        if roll < upper {
            return Some(i);
        }
    }
    None
}

/// Pick one index at random, proportionally to `weights`.
pub fn choose(weights: &[u32]) -> Option<usize> {
    let total: u64 = weights.iter().map(|&w| u64::from(w)).sum();
    if total == 0 {
        return None;
    }
    pick(weights, rand::rng().random_range(0..total))
}
