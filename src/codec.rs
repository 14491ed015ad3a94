//! Amount conversions between the two ledgers.
//!
//! Ledger A stores signed integer milliunits (negative = outflow). Ledger B stores
//! positive decimal strings with two fraction digits plus per-party shares. Decimal
//! arithmetic goes through `rust_decimal`, rounding half away from zero.

use crate::error::{Result, SyncError};
use crate::types::Milliunits;
use regex::Regex;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

/// Largest magnitude (in milliunits) the codec accepts.
pub const MAX_MAGNITUDE: i64 = 1_000_000_000_000_000;

const HALF_UP: RoundingStrategy = RoundingStrategy::MidpointAwayFromZero;

/// Plain decimal notation only: optional sign, digits, at most one point.
fn is_plain_decimal(input: &str) -> bool {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^[+-]?(\d+\.?\d*|\.\d+)$").ok())
        .as_ref()
        .is_some_and(|re| re.is_match(input))
}

fn parse_decimal(input: &str) -> Option<Decimal> {
    let trimmed = input.trim();
    if !is_plain_decimal(trimmed) {
        return None;
    }
    let (negative, digits) = match trimmed.as_bytes()[0] {
        b'-' => (true, &trimmed[1..]),
        b'+' => (false, &trimmed[1..]),
        _ => (false, trimmed),
    };
    let mut canonical = String::with_capacity(digits.len() + 2);
    if digits.starts_with('.') {
        canonical.push('0');
    }
    canonical.push_str(digits.trim_end_matches('.'));
    let value = Decimal::from_str(&canonical).ok()?;
    Some(if negative { -value } else { value })
}

fn out_of_range(input: impl fmt::Display) -> SyncError {
    SyncError::InvalidAmount(format!("'{input}' is outside the supported range"))
}

/// Format whole cents as a decimal string with exactly two fraction digits.
pub fn format_cents(cents: i64) -> String {
    Decimal::new(cents, 2).to_string()
}

/// Round milliunits to whole cents.
pub fn milliunits_to_cents(amount: Milliunits) -> i64 {
    let cents = (Decimal::new(amount, 3) * Decimal::ONE_HUNDRED).round_dp_with_strategy(0, HALF_UP);
    // |amount| / 10 always fits back into an i64
    cents.to_i64().unwrap_or_default()
}

/// Parse a decimal string into milliunits, rounding half away from zero.
pub fn parse_milliunits(decimal: &str) -> Result<Milliunits> {
    let value = parse_decimal(decimal).ok_or_else(|| {
        SyncError::InvalidAmount(format!("'{decimal}' is not a decimal number"))
    })?;
    let milliunits = value
        .round_dp_with_strategy(3, HALF_UP)
        .checked_mul(Decimal::ONE_THOUSAND)
        .and_then(|v| v.to_i64())
        .filter(|v| v.abs() <= MAX_MAGNITUDE)
        .ok_or_else(|| out_of_range(decimal))?;
    Ok(milliunits)
}

/// Ledger A amount to Ledger B cost: sign inverted, two decimals.
pub fn to_expense_cost(amount: Milliunits) -> Result<String> {
    let negated = amount
        .checked_neg()
        .filter(|v| v.abs() <= MAX_MAGNITUDE)
        .ok_or_else(|| out_of_range(format!("{amount} milliunits")))?;
    Ok(format_cents(milliunits_to_cents(negated)))
}

/// Ledger B decimal to a Ledger A amount coming back to the user.
pub fn to_inflow_amount(decimal: &str) -> Result<Milliunits> {
    parse_milliunits(decimal)
}

/// Ledger B decimal to a Ledger A amount leaving the user.
pub fn to_outflow_amount(decimal: &str) -> Result<Milliunits> {
    Ok(-parse_milliunits(decimal)?)
}

/// How an expense cost is divided between this user and the partner, e.g. `1:1` or `60:40`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitRatio {
    user: Decimal,
    partner: Decimal,
}

impl SplitRatio {
    pub const EQUAL: SplitRatio = SplitRatio {
        user: Decimal::ONE,
        partner: Decimal::ONE,
    };

    /// Split a positive decimal cost into `(user_share, partner_share)` in whole cents.
    ///
    /// The partner share is rounded; the user share takes the remainder so the two
    /// always add up to the cost.
    pub fn split_cost(&self, cost: &str) -> Result<(String, String)> {
        let cost_cents = milliunits_to_cents(parse_milliunits(cost)?);
        let partner_cents = Decimal::from(cost_cents)
            .checked_mul(self.partner)
            .and_then(|v| v.checked_div(self.user.checked_add(self.partner)?))
            .map(|v| v.round_dp_with_strategy(0, HALF_UP))
            .and_then(|v| v.to_i64())
            .ok_or_else(|| out_of_range(cost))?;
        Ok((
            format_cents(cost_cents - partner_cents),
            format_cents(partner_cents),
        ))
    }
}

impl Default for SplitRatio {
    fn default() -> Self {
        SplitRatio::EQUAL
    }
}

impl FromStr for SplitRatio {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (user, partner) = s
            .split_once(':')
            .ok_or_else(|| format!("'{s}' must look like 'a:b'"))?;
        let parse_term = |term: &str| -> std::result::Result<Decimal, String> {
            let value = parse_decimal(term).ok_or_else(|| format!("'{term}' is not a number"))?;
            if value <= Decimal::ZERO {
                return Err(format!("'{term}' must be positive"));
            }
            Ok(value)
        };
        Ok(SplitRatio {
            user: parse_term(user)?,
            partner: parse_term(partner)?,
        })
    }
}

impl fmt::Display for SplitRatio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.user.normalize(), self.partner.normalize())
    }
}

impl Serialize for SplitRatio {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SplitRatio {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outflow_becomes_positive_cost() {
        assert_eq!(to_expense_cost(-150_000).unwrap(), "150.00");
        assert_eq!(to_expense_cost(-1_230).unwrap(), "1.23");
        assert_eq!(to_expense_cost(-10).unwrap(), "0.01");
        assert_eq!(to_expense_cost(0).unwrap(), "0.00");
    }

    #[test]
    fn sub_cent_amounts_round_half_away_from_zero() {
        assert_eq!(to_expense_cost(-1_235).unwrap(), "1.24");
        assert_eq!(to_expense_cost(-1_234).unwrap(), "1.23");
        assert_eq!(to_expense_cost(1_235).unwrap(), "-1.24");
    }

    #[test]
    fn unrepresentable_amounts_are_rejected() {
        assert!(matches!(
            to_expense_cost(i64::MIN),
            Err(SyncError::InvalidAmount(_))
        ));
        assert!(to_expense_cost(-(MAX_MAGNITUDE + 1)).is_err());
    }

    #[test]
    fn decimal_parsing() {
        assert_eq!(to_inflow_amount("37.50").unwrap(), 37_500);
        assert_eq!(to_outflow_amount("37.50").unwrap(), -37_500);
        assert_eq!(to_inflow_amount("75").unwrap(), 75_000);
        assert_eq!(to_inflow_amount("75.0").unwrap(), 75_000);
        assert_eq!(to_inflow_amount(".5").unwrap(), 500);
        assert_eq!(to_inflow_amount("-2.25").unwrap(), -2_250);
        assert_eq!(to_inflow_amount("+2.25").unwrap(), 2_250);
        assert_eq!(to_inflow_amount(" 1.2345 ").unwrap(), 1_235);
        assert_eq!(to_inflow_amount("1.2344").unwrap(), 1_234);
        assert_eq!(to_inflow_amount("-0.0005").unwrap(), -1);
    }

    #[test]
    fn malformed_decimals_are_rejected() {
        for input in ["", "-", ".", "abc", "1.2.3", "NaN", "inf", "1,50", "1e3", "--1"] {
            assert!(
                matches!(to_inflow_amount(input), Err(SyncError::InvalidAmount(_))),
                "expected '{input}' to be rejected"
            );
        }
        assert!(to_inflow_amount("99999999999999999999").is_err());
        assert!(to_inflow_amount("79228162514264337593543950335").is_err());
    }

    #[test]
    fn trailing_point_and_exact_halves() {
        assert_eq!(to_inflow_amount("75.").unwrap(), 75_000);
        assert_eq!(to_inflow_amount("-.5").unwrap(), -500);
        assert_eq!(to_inflow_amount("0.0015").unwrap(), 2);
        assert_eq!(to_inflow_amount("-0.0015").unwrap(), -2);
        assert_eq!(milliunits_to_cents(5), 1);
        assert_eq!(milliunits_to_cents(-5), -1);
        assert_eq!(milliunits_to_cents(4), 0);
        assert_eq!(format_cents(-7), "-0.07");
    }

    #[test]
    fn whole_cent_round_trip() {
        let samples = [
            -150_000i64,
            -37_500,
            -10,
            -990,
            -1_000_010,
            -999_999_999_990,
            10,
            123_450,
            999_999_999_990,
        ];
        for x in samples {
            let cost = to_expense_cost(x).unwrap();
            assert_eq!(to_outflow_amount(&cost).unwrap(), x, "cost {cost}");
        }
        for cents in (-100_000i64..100_000).step_by(997) {
            let x = cents * 10;
            assert_eq!(to_outflow_amount(&to_expense_cost(x).unwrap()).unwrap(), x);
        }
    }

    #[test]
    fn equal_split_shares_sum_to_cost() {
        let (user, partner) = SplitRatio::EQUAL.split_cost("150.00").unwrap();
        assert_eq!((user.as_str(), partner.as_str()), ("75.00", "75.00"));

        let (user, partner) = SplitRatio::EQUAL.split_cost("0.01").unwrap();
        assert_eq!((user.as_str(), partner.as_str()), ("0.00", "0.01"));

        let (user, partner) = SplitRatio::EQUAL.split_cost("10.01").unwrap();
        assert_eq!((user.as_str(), partner.as_str()), ("5.00", "5.01"));
    }

    #[test]
    fn custom_ratio_split() {
        let ratio: SplitRatio = "60:40".parse().unwrap();
        let (user, partner) = ratio.split_cost("100.00").unwrap();
        assert_eq!((user.as_str(), partner.as_str()), ("60.00", "40.00"));

        let ratio: SplitRatio = "2:1".parse().unwrap();
        let (user, partner) = ratio.split_cost("10.00").unwrap();
        assert_eq!((user.as_str(), partner.as_str()), ("6.67", "3.33"));
    }

    #[test]
    fn ratio_parsing_and_display() {
        assert_eq!("1:1".parse::<SplitRatio>().unwrap(), SplitRatio::EQUAL);
        assert_eq!("60:40".parse::<SplitRatio>().unwrap().to_string(), "60:40");
        assert_eq!("1.5:1".parse::<SplitRatio>().unwrap().to_string(), "1.5:1");
        for bad in ["", "1", "1:", ":1", "0:1", "-1:1", "a:b", "1:1:1"] {
            assert!(bad.parse::<SplitRatio>().is_err(), "expected '{bad}' to fail");
        }
    }

    #[test]
    fn ratio_round_trips_through_serde() {
        let ratio: SplitRatio = serde_json::from_str("\"3:1\"").unwrap();
        assert_eq!(serde_json::to_string(&ratio).unwrap(), "\"3:1\"");
        assert!(serde_json::from_str::<SplitRatio>("\"x\"").is_err());
    }
}
