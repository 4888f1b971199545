// Overflow-safe proportional arithmetic for reward and pot calculations.

use crate::types::Amount;
use num_bigint::BigUint;

/// `a * b / denom`, rounded down. Falls back to big integers when the product
/// does not fit in 128 bits. Returns `None` on a zero denominator or when the
/// quotient itself overflows.
pub fn mul_div(a: Amount, b: Amount, denom: Amount) -> Option<Amount> {
    if denom == 0 {
        return None;
    }
    match a.checked_mul(b) {
        Some(product) => Some(product / denom),
        None => {
            let wide = BigUint::from(a) * BigUint::from(b) / BigUint::from(denom);
            u128::try_from(&wide).ok()
        }
    }
}

/// `amount * percent / 100`, saturating on nonsense input.
pub fn percent_of(amount: Amount, percent: u64) -> Amount {
    mul_div(amount, percent as Amount, 100).unwrap_or(Amount::MAX)
}
