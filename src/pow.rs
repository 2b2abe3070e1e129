//! Proof of work: target checks and difficulty retargeting

use crate::config::NetworkParams;
use crate::types::*;
use crate::uint256::Uint256;

/// CheckProofOfWork: ℍ × ℕ × ℕ → {true, false}
///
/// Let (target, neg, ovf) = SetCompact(bits). Valid iff
/// ¬neg ∧ ¬ovf ∧ target ≠ 0 ∧ target ≤ limit ∧ hash ≤ target
pub fn check_proof_of_work(hash: &HashId, bits: u32, limit: &Uint256) -> bool {
    let (target, negative, overflow) = Uint256::from_compact(bits);

    // Check range
    if negative || overflow || target.is_zero() || target > *limit {
        return false;
    }

    // Check proof of work matches claimed amount
    Uint256::from_hash(hash) <= target
}

/// CalculateWorkRequired: ℕ × ℕ × ℕ × ℕ × ℕ → ℕ
///
/// For the block closing a retarget window:
/// 1. Let actual = current_time - window_start_time
/// 2. Clamp actual to [timespan/4, timespan*4]
/// 3. Let target = SetCompact(prev_bits) × actual / timespan (floor)
/// 4. Return Compact(min(target, limit))
///
/// `timespan` must be positive.
pub fn calculate_work_required(
    current_time: u32,
    window_start_time: u32,
    prev_bits: u32,
    timespan: u64,
    limit: &Uint256,
) -> u32 {
    assert!(timespan > 0, "retarget timespan must be positive");

    // 1-2. Limit adjustment step
    let actual = current_time as i64 - window_start_time as i64;
    let timespan_i = timespan as i64;
    let clamped = actual.clamp(timespan_i / 4, timespan_i * 4) as u64;

    // 3. Retarget
    let (prev_target, _, _) = Uint256::from_compact(prev_bits);
    let scaled = prev_target * Uint256::from_u64(clamped);
    let mut target = scaled.checked_div(&Uint256::from_u64(timespan)).unwrap_or(Uint256::ZERO);

    // 4. Cap at the network limit
    if target > *limit {
        target = *limit;
    }
    target.compact(false)
}

/// GetNextWorkRequired: ℋ × ℕ × ℕ → ℕ
///
/// Bits required for the block after `last` (at height `last_height`),
/// to be stamped `new_block_time`. `ancestor(h)` returns the header at
/// height h on the same chain.
pub fn get_next_work_required<F>(
    last: &BlockHeader,
    last_height: u32,
    new_block_time: u32,
    params: &NetworkParams,
    ancestor: F,
) -> Option<u32>
where
    F: Fn(u32) -> Option<BlockHeader>,
{
    let limit_bits = params.pow_limit.compact(false);
    let interval = params.difficulty_adjustment_interval();

    // Only change once per difficulty adjustment interval
    if (last_height as u64 + 1) % interval != 0 {
        if params.allow_min_difficulty_blocks {
            // A block more than twice the spacing late may be mined at minimum difficulty
            if new_block_time as u64 > last.timestamp as u64 + params.pow_target_spacing * 2 {
                return Some(limit_bits);
            }
            // Otherwise return the last non-minimum-difficulty bits
            let mut header = *last;
            let mut height = last_height;
            while height > 0 && height as u64 % interval != 0 && header.bits == limit_bits {
                height -= 1;
                header = ancestor(height)?;
            }
            return Some(header.bits);
        }
        return Some(last.bits);
    }

    if params.no_retargeting {
        return Some(last.bits);
    }

    // Go back by what we want to be the retarget window worth of blocks
    let first_height = (last_height as u64 + 1).checked_sub(interval)? as u32;
    let first = ancestor(first_height)?;
    Some(calculate_work_required(
        last.timestamp,
        first.timestamp,
        last.bits,
        params.pow_target_timespan,
        &params.pow_limit,
    ))
}

/// BlockWork: ℕ → ℕ
///
/// Expected number of hashes to meet `bits`: 2^256 / (target + 1),
/// computed as ~target / (target + 1) + 1 to stay within 256 bits.
pub fn block_work(bits: u32) -> Uint256 {
    let (target, negative, overflow) = Uint256::from_compact(bits);
    if negative || overflow || target.is_zero() {
        return Uint256::ZERO;
    }
    match (!target).checked_div(&(target + Uint256::ONE)) {
        Some(q) => q + Uint256::ONE,
        None => Uint256::ZERO,
    }
}
