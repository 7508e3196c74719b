// =============================================================================
// Fixed-Point Price Codec
// =============================================================================
//
// The feed carries prices as integers scaled by 10^8.  Everything facing a
// client (snapshots, live trades) uses the exact decimal value.
// =============================================================================

use rust_decimal::Decimal;

/// Number of fractional digits carried by the integer representation.
pub const PRICE_SCALE: u32 = 8;

/// 10^PRICE_SCALE.
#[cfg(test)]
const PRICE_FACTOR: i64 = 100_000_000;

/// Decode a fixed-point integer price into its exact decimal value.
pub fn integer_to_price(value: i64) -> Decimal {
    Decimal::new(value, PRICE_SCALE)
}

/// Encode a decimal price into the fixed-point integer form.  `None` when
/// the price has more than [`PRICE_SCALE`] fractional digits or does not fit
/// in an `i64` once scaled.
#[cfg(test)]
pub fn price_to_integer(price: Decimal) -> Option<i64> {
    use rust_decimal::prelude::ToPrimitive;

    let scaled = price.checked_mul(Decimal::from(PRICE_FACTOR))?;
    if !scaled.fract().is_zero() {
        return None;
    }
    scaled.trunc().to_i64()
}
