//! Per-block difficulty adjustment and the difficulty → target mapping.
//!
//! The adjustment follows the parent block:
//!
//! ```text
//! diff = parent_diff + parent_diff / divisor * max(base - (time - parent_time) / duration, -99)
//! ```
//!
//! where `base` is 2 when the parent included uncles and 1 otherwise. The
//! result never drops below the chain's configured minimum.
//!
//! A sealed header is valid when its hashimoto result, read as a big-endian
//! 256-bit integer, is at most `floor(2^256 / difficulty)`.

use crate::config::PowParams;
use crate::types::{empty_uncle_hash, Header};
use primitive_types::U256;

/// Lowest adjustment factor a single block may apply.
const MAX_DOWNWARD_STEPS: i64 = -99;

/// Difficulty of a block built on `parent` with timestamp `time`.
pub fn calc_difficulty(params: &PowParams, time: u64, parent: &Header) -> U256 {
    let base: i64 = if parent.uncle_hash == empty_uncle_hash() { 1 } else { 2 };
    let elapsed = time.saturating_sub(parent.time);
    let duration = params.duration_limit.max(1);
    let steps = (elapsed / duration).min(i64::MAX as u64) as i64;
    let factor = base.saturating_sub(steps).max(MAX_DOWNWARD_STEPS);

    let divisor = U256::from(params.difficulty_bound_divisor.max(1));
    let bound = parent.difficulty / divisor;

    let diff = if factor >= 0 {
        parent
            .difficulty
            .saturating_add(bound.saturating_mul(U256::from(factor as u64)))
    } else {
        parent
            .difficulty
            .saturating_sub(bound.saturating_mul(U256::from(factor.unsigned_abs())))
    };
    diff.max(params.minimum_difficulty)
}

/// `floor(2^256 / difficulty)`; difficulties of 0 and 1 map to the maximum.
pub fn target_for(difficulty: U256) -> U256 {
    if difficulty <= U256::one() {
        return U256::MAX;
    }
    // 2^256 = MAX + 1, so the quotient gains one exactly when MAX leaves a
    // remainder of difficulty - 1.
    let (q, r) = U256::MAX.div_mod(difficulty);
    if r == difficulty - U256::one() {
        q + U256::one()
    } else {
        q
    }
}

/// Whether a big-endian hash result meets the target of `difficulty`.
pub fn meets_target(result: &[u8; 32], difficulty: U256) -> bool {
    U256::from_big_endian(result) <= target_for(difficulty)
}
