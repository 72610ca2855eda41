//! Scaled fractions in the on-chain numeric format.
//!
//! `Fraction` is an unsigned 68.60 fixed point number stored in a `u128`
//! (fields suffixed `_sf`). `BigFraction` is a 256-bit integer over the same
//! `2^60` scale (fields suffixed `_bsf`), used for cumulative borrow rates.

use fixed::types::U68F60;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use crate::core::error::{Error, Result};

pub type Fraction = U68F60;

pub const FRACTION_BITS: u32 = 60;
/// `2^60`, the raw value of `Fraction::ONE`.
pub const FRACTION_ONE_SCALED: u128 = 1u128 << FRACTION_BITS;

// Kept in its own module: the macro expands against the two-argument
// `Result` from std, not the crate alias imported above.
mod big {
    uint::construct_uint! {
        pub struct U256(4);
    }
}

pub use big::U256;

/// Helpers the protocol uses on top of the raw fixed point type.
pub trait FractionExtra: Sized {
    fn from_percent(percent: u64) -> Self;
    fn from_bps(bps: u64) -> Self;
    fn to_percent(&self) -> Option<u128>;
    fn to_bps(&self) -> Option<u128>;
    fn to_floor(&self) -> u64;
    fn to_ceil(&self) -> u64;
    fn to_round(&self) -> u64;
}

impl FractionExtra for Fraction {
    fn from_percent(percent: u64) -> Self {
        Fraction::from_num(percent) / 100
    }

    fn from_bps(bps: u64) -> Self {
        Fraction::from_num(bps) / 10_000
    }

    fn to_percent(&self) -> Option<u128> {
        (*self * 100).round().checked_to_num()
    }

    fn to_bps(&self) -> Option<u128> {
        (*self * 10_000).round().checked_to_num()
    }

    /// Saturates at `u64::MAX`.
    fn to_floor(&self) -> u64 {
        self.floor().saturating_to_num()
    }

    fn to_ceil(&self) -> u64 {
        self.ceil().saturating_to_num()
    }

    fn to_round(&self) -> u64 {
        self.round().saturating_to_num()
    }
}

/// Builds a fraction from a decimal, rounding to the nearest scaled value with
/// ties toward positive infinity.
pub fn fraction_from_decimal(value: Decimal) -> Result<Fraction> {
    if value.is_sign_negative() && !value.is_zero() {
        return Err(Error::arithmetic(format!(
            "Cannot represent negative value {} as a fraction",
            value
        )));
    }

    let mantissa = value.mantissa().unsigned_abs();
    let denom = U256::from(10u128.pow(value.scale()));

    // floor((2 * m * 2^60 + 10^s) / (2 * 10^s))
    let numerator = U256::from(mantissa) * U256::from(FRACTION_ONE_SCALED) * U256::from(2u8) + denom;
    let scaled = numerator / (denom * U256::from(2u8));

    if scaled > U256::from(u128::MAX) {
        return Err(Error::arithmetic(format!(
            "Value {} exceeds the maximum representable fraction",
            value
        )));
    }

    Ok(Fraction::from_bits(scaled.low_u128()))
}

pub fn fraction_to_decimal(value: Fraction) -> Result<Decimal> {
    bits_to_decimal(value.to_bits())
}

/// Decimal view of a raw `_sf` field.
pub fn sf_to_decimal(bits: u128) -> Result<Decimal> {
    bits_to_decimal(bits)
}

fn bits_to_decimal(bits: u128) -> Result<Decimal> {
    let int_part = bits >> FRACTION_BITS;
    let frac_part = bits & (FRACTION_ONE_SCALED - 1);

    let int_dec = Decimal::from_u128(int_part)
        .ok_or_else(|| Error::arithmetic(format!("Integer part {} out of decimal range", int_part)))?;
    if frac_part == 0 {
        return Ok(int_dec);
    }

    let frac_dec = Decimal::from_u128(frac_part)
        .ok_or_else(|| Error::arithmetic("Fractional part out of decimal range"))?;
    let one = Decimal::from_u128(FRACTION_ONE_SCALED)
        .ok_or_else(|| Error::arithmetic("Scale out of decimal range"))?;

    int_dec
        .checked_add(frac_dec / one)
        .ok_or_else(|| Error::arithmetic("Fraction too large for decimal"))
}

pub fn fraction_from_bps(bps: u64) -> Fraction {
    Fraction::from_bps(bps)
}

pub fn fraction_from_percent(percent: u64) -> Fraction {
    Fraction::from_percent(percent)
}

/// 256-bit scaled value, the cumulative borrow rate index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct BigFraction(pub U256);

impl BigFraction {
    pub fn one() -> Self {
        BigFraction(U256::from(FRACTION_ONE_SCALED))
    }

    /// From the little-endian `u64` limbs stored on chain.
    pub fn from_limbs(limbs: [u64; 4]) -> Self {
        BigFraction(U256(limbs))
    }

    pub fn to_limbs(&self) -> [u64; 4] {
        self.0 .0
    }

    pub fn to_fraction(&self) -> Result<Fraction> {
        if self.0 > U256::from(u128::MAX) {
            return Err(Error::arithmetic("Big fraction does not fit a 128-bit fraction"));
        }
        Ok(Fraction::from_bits(self.0.low_u128()))
    }

    pub fn to_decimal(&self) -> Result<Decimal> {
        fraction_to_decimal(self.to_fraction()?)
    }

    pub fn from_decimal(value: Decimal) -> Result<Self> {
        Ok(BigFraction(U256::from(fraction_from_decimal(value)?.to_bits())))
    }
}

impl From<Fraction> for BigFraction {
    fn from(value: Fraction) -> Self {
        BigFraction(U256::from(value.to_bits()))
    }
}

/// Integer token amount from a non-negative decimal, floored.
pub fn decimal_to_u64_floor(value: Decimal) -> Result<u64> {
    value
        .floor()
        .to_u64()
        .ok_or_else(|| Error::arithmetic(format!("{} does not fit u64", value)))
}

pub fn decimal_to_u64_ceil(value: Decimal) -> Result<u64> {
    value
        .ceil()
        .to_u64()
        .ok_or_else(|| Error::arithmetic(format!("{} does not fit u64", value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_round_trip_dyadic_values() {
        for s in ["0", "1", "1.5", "0.25", "123.375", "1000000"] {
            let d = Decimal::from_str(s).unwrap();
            let f = fraction_from_decimal(d).unwrap();
            assert_eq!(fraction_to_decimal(f).unwrap(), d, "round trip failed for {}", s);
        }
    }

    #[test]
    fn test_from_decimal_rounds_half_up() {
        // 2^60 = 3 * 384307168202282325 + 1, so 1/3 scales to ...325.33 and
        // 2/3 to ...650.67.
        let one_third = fraction_from_decimal(Decimal::ONE / Decimal::from(3)).unwrap();
        assert_eq!(one_third.to_bits(), 384_307_168_202_282_325, "below half rounds down");
        let two_thirds = fraction_from_decimal(Decimal::TWO / Decimal::from(3)).unwrap();
        assert_eq!(two_thirds.to_bits(), 768_614_336_404_564_651, "above half rounds up");

        // 4e-19 and 5e-19 scale to 0.46 and 0.58 of the last place.
        assert_eq!(fraction_from_decimal(Decimal::new(4, 19)).unwrap().to_bits(), 0);
        assert_eq!(fraction_from_decimal(Decimal::new(5, 19)).unwrap().to_bits(), 1);

        // Just past one and a half units of the last place.
        let one_and_half_ulp = Decimal::from(3) / Decimal::from_u128(FRACTION_ONE_SCALED * 2).unwrap();
        assert_eq!(fraction_from_decimal(one_and_half_ulp).unwrap().to_bits(), 2);
    }

    #[test]
    fn test_u64_max_sentinel_is_exact() {
        let max = Decimal::from(u64::MAX);
        let f = fraction_from_decimal(max).unwrap();
        assert_eq!(f.to_bits(), (u64::MAX as u128) << FRACTION_BITS);
        assert_eq!(f.to_floor(), u64::MAX);
        assert_eq!(fraction_to_decimal(f).unwrap(), max);
    }

    #[test]
    fn test_out_of_range_is_arithmetic_error() {
        let too_big = Decimal::from_u128(1u128 << 70).unwrap();
        match fraction_from_decimal(too_big) {
            Err(Error::Arithmetic(_)) => {}
            other => panic!("expected arithmetic error, got {:?}", other),
        }
        assert!(fraction_from_decimal(Decimal::from(-1)).is_err());
    }

    #[test]
    fn test_bps_and_percent() {
        assert_eq!(fraction_from_bps(5_000), Fraction::from_num(1) / 2);
        assert_eq!(fraction_from_percent(75).to_bps(), Some(7_500));
        assert_eq!(Fraction::from_percent(100), Fraction::ONE);
    }

    #[test]
    fn test_big_fraction_limbs() {
        let one = BigFraction::one();
        assert_eq!(one.to_limbs(), [FRACTION_ONE_SCALED as u64, 0, 0, 0]);
        assert_eq!(one.to_decimal().unwrap(), Decimal::ONE);
        assert!(BigFraction::from_limbs([0, 0, 1, 0]).to_fraction().is_err());
    }
}
