//! Decimal amount parsing and gas arithmetic.
//!
//! Everything is integer math on `U256`; no floating point touches an amount.

use alloy::primitives::U256;

use crate::error::{GhostpayError, Result};

/// Parse a human decimal string ("10.00", "0.015", "3") into base units with
/// `decimals` fractional digits. Digits beyond `decimals` are truncated.
pub fn parse_units(amount: &str, decimals: u8) -> Result<U256> {
    let amount = amount.trim();
    if amount.is_empty() {
        return Err(GhostpayError::Validation("amount is empty".to_string()));
    }
    if !amount.chars().all(|c| c.is_ascii_digit() || c == '.') || amount.matches('.').count() > 1
    {
        return Err(GhostpayError::Validation(format!(
            "invalid amount '{amount}': expected a non-negative decimal"
        )));
    }

    let (integer_part, fractional_part) = amount.split_once('.').unwrap_or((amount, ""));
    if integer_part.is_empty() && fractional_part.is_empty() {
        return Err(GhostpayError::Validation(format!(
            "invalid amount '{amount}': no digits"
        )));
    }

    let decimals = decimals as usize;
    let mut digits = String::with_capacity(integer_part.len() + decimals);
    digits.push_str(integer_part);
    let kept = &fractional_part[..fractional_part.len().min(decimals)];
    digits.push_str(kept);
    for _ in kept.len()..decimals {
        digits.push('0');
    }

    let digits = digits.trim_start_matches('0');
    if digits.is_empty() {
        return Ok(U256::ZERO);
    }
    U256::from_str_radix(digits, 10)
        .map_err(|e| GhostpayError::Validation(format!("invalid amount '{amount}': {e}")))
}

/// Check that `amount` is well-formed and still positive once truncated to
/// `decimals` places.
pub fn validate_positive(amount: &str, decimals: u8) -> Result<()> {
    if parse_units(amount, decimals)?.is_zero() {
        return Err(GhostpayError::Validation(format!(
            "amount_native '{}' is zero at {decimals} decimals",
            amount.trim()
        )));
    }
    Ok(())
}

/// Gas limit for a transfer estimated at `gas_units`, with `buffer_percent` headroom.
pub fn buffered_gas_limit(gas_units: u64, buffer_percent: u32) -> u64 {
    gas_units.saturating_mul(100 + u64::from(buffer_percent)) / 100
}

/// Network fee budget: `gas_units * gas_price * (100 + buffer_percent) / 100`.
pub fn gas_cost(gas_units: u64, gas_price: u128, buffer_percent: u32) -> U256 {
    U256::from(gas_units) * U256::from(gas_price) * U256::from(100u64 + u64::from(buffer_percent))
        / U256::from(100u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_stablecoin_amounts() {
        assert_eq!(parse_units("10.00", 6).unwrap(), U256::from(10_000_000u64));
        assert_eq!(parse_units("0.5", 6).unwrap(), U256::from(500_000u64));
        assert_eq!(parse_units("3", 6).unwrap(), U256::from(3_000_000u64));
        assert_eq!(parse_units(".25", 2).unwrap(), U256::from(25u64));
    }

    #[test]
    fn parses_native_amounts_with_eighteen_decimals() {
        assert_eq!(
            parse_units("0.01", 18).unwrap(),
            U256::from(10_000_000_000_000_000u64)
        );
    }

    #[test]
    fn truncates_excess_precision() {
        assert_eq!(parse_units("1.1234567", 6).unwrap(), U256::from(1_123_456u64));
    }

    #[test]
    fn rejects_malformed_amounts() {
        assert!(parse_units("", 6).is_err());
        assert!(parse_units("abc", 6).is_err());
        assert!(parse_units("1.2.3", 6).is_err());
        assert!(parse_units("-1", 6).is_err());
        assert!(parse_units(".", 6).is_err());
    }

    #[test]
    fn zero_is_not_a_valid_invoice_amount() {
        assert!(validate_positive("0.000", 18).is_err());
        assert!(validate_positive("0.01", 6).is_ok());
    }

    #[test]
    fn precision_beyond_token_decimals_is_rejected() {
        assert!(validate_positive("0.0000001", 18).is_ok());
        assert!(validate_positive("0.0000001", 6).is_err());
        assert!(validate_positive("0.000001", 6).is_ok());
    }

    #[test]
    fn buffered_limit_prices_to_the_funded_budget() {
        let limit = buffered_gas_limit(65_000, 20);
        assert_eq!(limit, 78_000);
        // What a node reserves for the transfer equals what gets funded.
        let reserved = U256::from(limit) * U256::from(5_000_000_000u128);
        assert_eq!(reserved, gas_cost(65_000, 5_000_000_000, 20));
    }

    #[test]
    fn gas_buffer_arithmetic() {
        let cost = gas_cost(65_000, 5_000_000_000, 20);
        assert_eq!(cost, U256::from(390_000_000_000_000u64));
    }

    #[test]
    fn gas_cost_without_buffer_is_exact() {
        assert_eq!(
            gas_cost(21_000, 3_000_000_000, 0),
            U256::from(63_000_000_000_000u64)
        );
    }
}
