//! Collection of utility functions.

pub use self::counter::*;

mod counter;

/// Divide `x` by `y` and round up towards infinity. For example, `21/5 = 4.2` thus
/// `div_ceil(21, 5) == 5`.
#[inline]
pub fn div_ceil(x: u64, y: u64) -> u64 {
    let (q, r) = (x / y, x % y);
    if r != 0 {
        q + 1
    } else {
        q
    }
}

/// Product of all elements of `values`, saturating instead of overflowing. The empty
/// product is one.
pub fn product(values: &[u64]) -> u64 {
    values.iter().fold(1u64, |acc, &v| acc.saturating_mul(v))
}
