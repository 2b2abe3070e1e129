//! Monetary rules: block subsidy schedule, money range and fee checks

use crate::constants::*;
use crate::error::{ConsensusError, Result};
use crate::types::*;

/// MoneyRange: ℤ → {true, false}
///
/// 0 ≤ amount < M_max
pub fn money_range(amount: Amount) -> bool {
    (0..MAX_MONEY).contains(&amount)
}

/// GetBlockSubsidy: ℕ × ℕ → ℤ
///
/// Subsidy for height h with halving interval H:
/// subsidy = 50 * C * 2^(-⌊h/H⌋), and zero once ⌊h/H⌋ ≥ 64
pub fn get_block_subsidy(height: u64, halving_interval: u64) -> Amount {
    let halvings = height / halving_interval.max(1);

    // After 64 halvings, subsidy becomes 0
    if halvings >= MAX_HALVINGS {
        return 0;
    }

    INITIAL_SUBSIDY >> halvings
}

/// Subsidy under the main network's 210,000-block halving interval
pub fn block_subsidy(height: u64) -> Amount {
    get_block_subsidy(height, HALVING_INTERVAL)
}

/// TotalSupply: ℕ → ℤ
///
/// Sum of all subsidies from genesis through `height`, computed per era.
pub fn total_supply(height: u64) -> Amount {
    let mut total: Amount = 0;
    let mut era_start = 0u64;
    while era_start <= height {
        let subsidy = block_subsidy(era_start);
        if subsidy == 0 {
            break;
        }
        let era_end = (era_start + HALVING_INTERVAL - 1).min(height);
        total += subsidy * (era_end - era_start + 1) as Amount;
        era_start += HALVING_INTERVAL;
    }
    total
}

/// Fee = Σ inputs - Σ outputs; both sums and the fee itself must be in range
pub fn calculate_fee(input_total: Amount, output_total: Amount) -> Result<Amount> {
    if !money_range(input_total) || !money_range(output_total) {
        return Err(ConsensusError::EconomicValidation("value out of range".to_string()));
    }
    let fee = input_total - output_total;
    if fee < 0 {
        return Err(ConsensusError::EconomicValidation(format!(
            "outputs {} exceed inputs {}",
            output_total, input_total
        )));
    }
    Ok(fee)
}

/// Coinbase outputs may claim at most subsidy + fees
pub fn check_coinbase_reward(coinbase: &Transaction, height: u64, fees: Amount, halving_interval: u64) -> Result<()> {
    let claimed = coinbase
        .total_output_value()
        .ok_or_else(|| ConsensusError::EconomicValidation("coinbase value out of range".to_string()))?;
    let allowed = get_block_subsidy(height, halving_interval) + fees;
    if claimed > allowed {
        return Err(ConsensusError::EconomicValidation(format!(
            "coinbase pays {} but only {} is allowed at height {}",
            claimed, allowed, height
        )));
    }
    Ok(())
}
