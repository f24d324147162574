use rust_decimal::RoundingStrategy;

use crate::Decimal;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Comparison {
    /// `actual - expected`.
    pub difference: Decimal,
    pub within_tolerance: bool,
}

/// Compare a site value against the ledger.
///
/// The absolute difference is measured at the resolution of `tolerance`, rounding
/// half away from zero to its decimal places, so float noise below that resolution
/// does not count. A zero tolerance demands exact equality.
pub fn compare(actual: Decimal, expected: Decimal, tolerance: Decimal) -> Comparison {
    let difference = actual - expected;
    let tolerance = tolerance.abs().normalize();

    let within_tolerance = if tolerance.is_zero() {
        difference.is_zero()
    } else {
        let measured = difference
            .abs()
            .round_dp_with_strategy(tolerance.scale(), RoundingStrategy::MidpointAwayFromZero);
        measured <= tolerance
    };

    Comparison {
        difference: difference.normalize(),
        within_tolerance,
    }
}
