//! Liasse amount parsing
//!
//! Source amounts are 15-character zero-padded digit strings, sometimes
//! space-grouped, sometimes expressed in cents. Anything that does not read as
//! a number is treated as absent.

use crate::record::RawAmount;

/// Magnitude above which a value is taken to be expressed in cents
pub const MINOR_UNIT_THRESHOLD: u64 = 1_000_000_000;

/// Parse a raw amount into whole currency units.
pub fn parse_amount(raw: &RawAmount) -> Option<i64> {
    let value = match raw {
        RawAmount::Integer(n) => *n,
        RawAmount::Decimal(f) => truncate_float(*f)?,
        RawAmount::Text(s) => parse_digits(s)?,
    };
    Some(to_major_units(value))
}

/// Parse an amount already expressed in whole units (no cents detection).
pub fn parse_whole_units(raw: &RawAmount) -> Option<i64> {
    match raw {
        RawAmount::Integer(n) => Some(*n),
        RawAmount::Decimal(f) => truncate_float(*f),
        RawAmount::Text(s) => parse_digits(s),
    }
}

/// Parse an amount given as text.
pub fn parse_amount_str(s: &str) -> Option<i64> {
    parse_digits(s).map(to_major_units)
}

fn parse_digits(s: &str) -> Option<i64> {
    let cleaned: String = s.chars().filter(|c| !c.is_whitespace()).collect();
    if cleaned.is_empty() || cleaned == "-" {
        return None;
    }
    match cleaned.parse::<i64>() {
        Ok(n) => Some(n),
        Err(_) => cleaned.parse::<f64>().ok().and_then(truncate_float),
    }
}

fn truncate_float(f: f64) -> Option<i64> {
    if !f.is_finite() || f.abs() >= i64::MAX as f64 {
        return None;
    }
    Some(f.trunc() as i64)
}

fn to_major_units(value: i64) -> i64 {
    if value.unsigned_abs() > MINOR_UNIT_THRESHOLD {
        value / 100
    } else {
        value
    }
}
