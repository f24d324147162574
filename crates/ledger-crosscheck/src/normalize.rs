//! Turning balance text scraped from a website or printed by ledger into a [`Decimal`].

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use rust_decimal::RoundingStrategy;

use crate::Decimal;
use crate::error::NormalizeError;

// Applied after whitespace is stripped, so "- $ 1 234,56" arrives as "-$1234,56".
static NUMBER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?P<sign>[-+\x{2212}])?\p{Sc}?(?P<digits>[0-9](?:[0-9.,']*[0-9])?)")
        .expect("number pattern is valid")
});

/// How a value is brought to the precision the site displays before comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Rounding {
    #[default]
    Exact,
    /// Round half away from zero to this many decimal places.
    Round(u32),
    /// Truncate toward zero to a whole number. Loyalty programs show whole points
    /// while the ledger accrues fractions.
    Truncate,
}

impl Rounding {
    pub fn apply(self, value: Decimal) -> Decimal {
        match self {
            Rounding::Exact => value,
            Rounding::Round(places) => value
                .round_dp_with_strategy(places, RoundingStrategy::MidpointAwayFromZero)
                .normalize(),
            Rounding::Truncate => value.trunc().normalize(),
        }
    }
}

impl fmt::Display for Rounding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rounding::Exact => f.write_str("exact"),
            Rounding::Round(places) => write!(f, "round:{places}"),
            Rounding::Truncate => f.write_str("truncate"),
        }
    }
}

impl FromStr for Rounding {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "exact" => Ok(Rounding::Exact),
            "truncate" => Ok(Rounding::Truncate),
            other => other
                .strip_prefix("round:")
                .and_then(|places| places.parse().ok())
                .map(Rounding::Round)
                .ok_or_else(|| {
                    format!("invalid rounding '{other}', expected exact | truncate | round:N")
                }),
        }
    }
}

/// Parse the first number in `text` into a canonical decimal.
///
/// Whitespace (including non-breaking and narrow spaces) and currency symbols are
/// ignored. When both `.` and `,` occur, the rightmost one is the decimal separator.
/// A separator occurring only once is a decimal separator, one occurring repeatedly
/// groups thousands. Trailing zeros are dropped, so rendering the result and
/// normalizing it again yields the same value.
pub fn normalize(text: &str) -> Result<Decimal, NormalizeError> {
    let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    let captures = NUMBER
        .captures(&compact)
        .ok_or_else(|| NormalizeError::NoNumericContent(text.to_owned()))?;

    let digits = canonical_digits(&captures["digits"]);
    let magnitude: Decimal = digits
        .parse()
        .map_err(|_| NormalizeError::OutOfRange(text.to_owned()))?;

    let negative = matches!(
        captures.name("sign").map(|sign| sign.as_str()),
        Some("-" | "\u{2212}")
    );
    let value = if negative { -magnitude } else { magnitude };

    Ok(value.normalize())
}

/// [`normalize`] followed by the balance's rounding policy.
pub fn normalize_with(text: &str, rounding: Rounding) -> Result<Decimal, NormalizeError> {
    normalize(text).map(|value| rounding.apply(value))
}

fn canonical_digits(token: &str) -> String {
    let dots = token.matches('.').count();
    let commas = token.matches(',').count();

    let decimal_separator = match (dots, commas) {
        (0, 0) => None,
        (1, 0) => Some('.'),
        (0, 1) => Some(','),
        (_, 0) | (0, _) => None,
        _ => {
            if token.rfind('.') > token.rfind(',') {
                Some('.')
            } else {
                Some(',')
            }
        }
    };
    let decimal_at = decimal_separator.and_then(|separator| token.rfind(separator));

    token
        .char_indices()
        .filter_map(|(index, c)| match c {
            '0'..='9' => Some(c),
            _ if Some(index) == decimal_at => Some('.'),
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    #[test]
    fn separator_conventions_agree() {
        assert_eq!(normalize("1.234,56").unwrap(), dec("1234.56"));
        assert_eq!(normalize("1,234.56").unwrap(), dec("1234.56"));
        assert_eq!(normalize("1 234,56").unwrap(), dec("1234.56"));
        assert_eq!(normalize("1'234.56").unwrap(), dec("1234.56"));
    }

    #[test]
    fn lone_comma_is_decimal() {
        assert_eq!(normalize("0,5").unwrap(), dec("0.5"));
        assert_eq!(normalize("151,78").unwrap(), dec("151.78"));
    }

    #[test]
    fn repeated_separator_groups_thousands() {
        assert_eq!(normalize("1,234,567").unwrap(), dec("1234567"));
        assert_eq!(normalize("1.234.567").unwrap(), dec("1234567"));
        assert_eq!(normalize("1.234.567,5").unwrap(), dec("1234567.5"));
    }

    #[test]
    fn strips_currency_and_exotic_spaces() {
        assert_eq!(normalize("1\u{a0}234,56\u{a0}₽").unwrap(), dec("1234.56"));
        assert_eq!(normalize("12\u{202f}000 ₽").unwrap(), dec("12000"));
        assert_eq!(normalize("122.36₽").unwrap(), dec("122.36"));
        assert_eq!(normalize("$1,000.00").unwrap(), dec("1000"));
        assert_eq!(normalize("  76 ₽ ").unwrap(), dec("76"));
        assert_eq!(normalize("0.01234 BNB").unwrap(), dec("0.01234"));
    }

    #[test]
    fn sign_is_kept() {
        assert_eq!(normalize("-12.50").unwrap(), dec("-12.5"));
        assert_eq!(normalize("- $ 3").unwrap(), dec("-3"));
        assert_eq!(normalize("\u{2212}7,5 €").unwrap(), dec("-7.5"));
        assert_eq!(normalize("+0.25").unwrap(), dec("0.25"));
        assert_eq!(normalize("-0").unwrap(), Decimal::ZERO);
    }

    #[test]
    fn no_digits_is_an_error() {
        assert_eq!(
            normalize("—"),
            Err(NormalizeError::NoNumericContent("—".to_owned()))
        );
        assert!(matches!(
            normalize(""),
            Err(NormalizeError::NoNumericContent(_))
        ));
    }

    #[test]
    fn oversized_number_is_out_of_range() {
        let text = "9".repeat(40);
        assert_eq!(normalize(&text), Err(NormalizeError::OutOfRange(text)));
    }

    #[test]
    fn idempotent_through_render() {
        for text in [
            "1.234,56",
            "1,234.56",
            "-0,5 BNB",
            "12 000 ₽",
            "0.000100",
            "99",
            "−1'000.25",
        ] {
            let once = normalize(text).unwrap();
            let twice = normalize(&once.to_string()).unwrap();
            assert_eq!(once, twice, "{text}");
            assert_eq!(once.to_string(), twice.to_string(), "{text}");
        }
    }

    #[test]
    fn truncation_policy() {
        assert_eq!(
            normalize_with("151.78", Rounding::Truncate).unwrap(),
            dec("151")
        );
        assert_eq!(
            normalize_with("-151.78", Rounding::Truncate).unwrap(),
            dec("-151")
        );
    }

    #[test]
    fn round_policy_is_half_away_from_zero() {
        assert_eq!(Rounding::Round(2).apply(dec("122.365")), dec("122.37"));
        assert_eq!(Rounding::Round(2).apply(dec("-122.365")), dec("-122.37"));
        assert_eq!(Rounding::Round(4).apply(dec("0.123449")), dec("0.1234"));
        assert_eq!(Rounding::Exact.apply(dec("0.123449")), dec("0.123449"));
    }

    #[test]
    fn rounding_parses_from_flags() {
        assert_eq!("exact".parse(), Ok(Rounding::Exact));
        assert_eq!("truncate".parse(), Ok(Rounding::Truncate));
        assert_eq!("round:4".parse(), Ok(Rounding::Round(4)));
        assert!("round:x".parse::<Rounding>().is_err());
        assert_eq!(Rounding::Round(2).to_string(), "round:2");
    }
}
