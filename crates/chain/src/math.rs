//! Fixed-point helpers for converting protocol-native integers.
//!
//! Balances stay `U256` in token base units. USD values are computed as
//! 18-decimal WAD integers and only turned into `f64` at the display and
//! aggregation boundary.

use alloy::primitives::U256;

/// WAD constant: 1e18 for 18-decimal fixed-point arithmetic
pub const WAD: U256 = U256::from_limbs([1_000_000_000_000_000_000u64, 0, 0, 0]);

/// Basis points denominator (10000 = 100%)
pub const BPS_DENOMINATOR: U256 = U256::from_limbs([10000u64, 0, 0, 0]);

/// Oracle price decimals (8)
pub const PRICE_DECIMALS: u8 = 8;

/// Seconds in a (non-leap) year, used for rate compounding.
pub const SECONDS_PER_YEAR: f64 = 31_536_000.0;

/// Pre-computed powers of 10 for fast decimal conversion
const POW10: [u128; 39] = [
    1,
    10,
    100,
    1_000,
    10_000,
    100_000,
    1_000_000,
    10_000_000,
    100_000_000,
    1_000_000_000,
    10_000_000_000,
    100_000_000_000,
    1_000_000_000_000,
    10_000_000_000_000,
    100_000_000_000_000,
    1_000_000_000_000_000,
    10_000_000_000_000_000,
    100_000_000_000_000_000,
    1_000_000_000_000_000_000,
    10_000_000_000_000_000_000,
    100_000_000_000_000_000_000,
    1_000_000_000_000_000_000_000,
    10_000_000_000_000_000_000_000,
    100_000_000_000_000_000_000_000,
    1_000_000_000_000_000_000_000_000,
    10_000_000_000_000_000_000_000_000,
    100_000_000_000_000_000_000_000_000,
    1_000_000_000_000_000_000_000_000_000,
    10_000_000_000_000_000_000_000_000_000,
    100_000_000_000_000_000_000_000_000_000,
    1_000_000_000_000_000_000_000_000_000_000,
    10_000_000_000_000_000_000_000_000_000_000,
    100_000_000_000_000_000_000_000_000_000_000,
    1_000_000_000_000_000_000_000_000_000_000_000,
    10_000_000_000_000_000_000_000_000_000_000_000,
    100_000_000_000_000_000_000_000_000_000_000_000,
    1_000_000_000_000_000_000_000_000_000_000_000_000,
    10_000_000_000_000_000_000_000_000_000_000_000_000,
    100_000_000_000_000_000_000_000_000_000_000_000_000,
];

/// Fast power of 10 lookup (up to 10^38)
#[inline(always)]
pub fn pow10(exp: u8) -> U256 {
    if exp < 39 {
        U256::from(POW10[exp as usize])
    } else {
        U256::from(10u64).pow(U256::from(exp))
    }
}

/// Calculate USD value from token amount and an 8-decimal oracle price.
/// Returns value in 18-decimal WAD format.
///
/// Formula: (amount * price * 10^18) / (10^decimals * 10^8)
#[inline(always)]
pub fn usd_wad(amount: U256, price: U256, decimals: u8) -> U256 {
    if amount.is_zero() || price.is_zero() {
        return U256::ZERO;
    }

    let scale_adjustment = 18i32 - decimals as i32 - PRICE_DECIMALS as i32;

    if scale_adjustment >= 0 {
        amount.saturating_mul(price).saturating_mul(pow10(scale_adjustment as u8))
    } else {
        amount.saturating_mul(price) / pow10((-scale_adjustment) as u8)
    }
}

/// Convert WAD (18 decimals) to f64.
/// Use only at the display/aggregation boundary.
#[inline(always)]
pub fn wad_to_f64(wad: U256) -> f64 {
    if wad <= U256::from(u128::MAX) {
        let value: u128 = wad.to();
        value as f64 / 1e18
    } else {
        let limbs = wad.as_limbs();
        let mut acc = 0.0f64;
        for limb in limbs.iter().rev() {
            acc = acc * 18_446_744_073_709_551_616.0 + *limb as f64;
        }
        acc / 1e18
    }
}

/// Convert a fraction in [0, 1] to WAD. Negative and non-finite input maps to zero.
#[inline(always)]
pub fn fraction_to_wad(value: f64) -> U256 {
    if !value.is_finite() || value <= 0.0 {
        return U256::ZERO;
    }
    U256::from((value * 1e18).round() as u128)
}

/// Convert an integer amount in token base units to f64 whole tokens.
pub fn units_to_f64(amount: U256, decimals: u8) -> f64 {
    wad_to_f64(amount) * 1e18 / 10f64.powi(decimals as i32)
}

/// Basis points (e.g. 8000) to a fraction (0.80).
#[inline(always)]
pub fn bps_to_fraction(bps: u16) -> f64 {
    bps as f64 / 10_000.0
}

/// 1e18 mantissa (WAD, Compound mantissa, Morpho LLTV) to a fraction.
#[inline(always)]
pub fn mantissa_to_fraction(mantissa: U256) -> f64 {
    wad_to_f64(mantissa)
}

/// RAY (1e27) value to a fraction.
#[inline(always)]
pub fn ray_to_fraction(ray: U256) -> f64 {
    wad_to_f64(ray) / 1e9
}

/// Annual percentage rate to APY with per-second compounding.
pub fn apr_to_apy(apr: f64) -> f64 {
    if apr <= 0.0 {
        return 0.0;
    }
    (1.0 + apr / SECONDS_PER_YEAR).powf(SECONDS_PER_YEAR) - 1.0
}

/// Per-second rate (1e18 mantissa) to APY, as quoted by Comet and Moonwell.
pub fn per_second_rate_to_apy(rate_mantissa: U256) -> f64 {
    let rate = mantissa_to_fraction(rate_mantissa);
    if rate <= 0.0 {
        return 0.0;
    }
    (1.0 + rate).powf(SECONDS_PER_YEAR) - 1.0
}

/// Multiply two WAD values: (a * b) / WAD
#[inline(always)]
pub fn wad_mul(a: U256, b: U256) -> U256 {
    a.saturating_mul(b) / WAD
}

/// Divide two WAD values: (a * WAD) / b
#[inline(always)]
pub fn wad_div(a: U256, b: U256) -> U256 {
    if b.is_zero() {
        return U256::MAX;
    }
    a.saturating_mul(WAD) / b
}
