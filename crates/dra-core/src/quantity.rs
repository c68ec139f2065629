//! Resource quantities (`4`, `500m`, `16Gi`, `1.5G`).
//!
//! Values are held as signed milli-units so decimal and binary suffixes
//! compare exactly. The original spelling is kept for serialization.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid quantity {input:?}: {reason}")]
pub struct QuantityParseError {
    pub input: String,
    pub reason: &'static str,
}

/// A resource quantity.
#[derive(Clone)]
pub struct Quantity {
    millis: i128,
    raw: String,
}

impl Quantity {
    pub const ZERO: Quantity = Quantity {
        millis: 0,
        raw: String::new(),
    };

    pub fn from_millis(millis: i128) -> Self {
        let raw = if millis % 1000 == 0 {
            (millis / 1000).to_string()
        } else {
            format!("{millis}m")
        };
        Self { millis, raw }
    }

    pub fn from_int(value: i64) -> Self {
        Self::from_millis(i128::from(value) * 1000)
    }

    pub fn millis(&self) -> i128 {
        self.millis
    }

    pub fn is_zero(&self) -> bool {
        self.millis == 0
    }

    pub fn is_negative(&self) -> bool {
        self.millis < 0
    }

    pub fn checked_add(&self, other: &Quantity) -> Option<Quantity> {
        self.millis.checked_add(other.millis).map(Self::from_millis)
    }

    pub fn checked_sub(&self, other: &Quantity) -> Option<Quantity> {
        self.millis.checked_sub(other.millis).map(Self::from_millis)
    }

    /// Subtraction clamped at zero.
    pub fn saturating_sub(&self, other: &Quantity) -> Quantity {
        Self::from_millis(self.millis.saturating_sub(other.millis).max(0))
    }
}

fn suffix_multiplier(suffix: &str) -> Option<(i128, i128)> {
    // (numerator, denominator) applied to the base value in whole units.
    let m = match suffix {
        "" => (1, 1),
        "m" => (1, 1000),
        "k" => (1_000, 1),
        "M" => (1_000_000, 1),
        "G" => (1_000_000_000, 1),
        "T" => (1_000_000_000_000, 1),
        "P" => (1_000_000_000_000_000, 1),
        "E" => (1_000_000_000_000_000_000, 1),
        "Ki" => (1 << 10, 1),
        "Mi" => (1 << 20, 1),
        "Gi" => (1 << 30, 1),
        "Ti" => (1 << 40, 1),
        "Pi" => (1 << 50, 1),
        "Ei" => (1 << 60, 1),
        _ => return None,
    };
    Some(m)
}

impl FromStr for Quantity {
    type Err = QuantityParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = |reason| QuantityParseError {
            input: s.to_string(),
            reason,
        };
        let trimmed = s.trim();
        let (negative, body) = match trimmed.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, trimmed.strip_prefix('+').unwrap_or(trimmed)),
        };
        let split = body
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(body.len());
        let (number, suffix) = body.split_at(split);
        if number.is_empty() || number == "." {
            return Err(err("missing number"));
        }
        let (int_part, frac_part) = number.split_once('.').unwrap_or((number, ""));
        if frac_part.contains('.') {
            return Err(err("more than one decimal point"));
        }
        let (num, den) = suffix_multiplier(suffix).ok_or_else(|| err("unknown suffix"))?;

        let digits = format!("{int_part}{frac_part}");
        let mantissa: i128 = digits.parse().map_err(|_| err("number out of range"))?;
        let scale = 10i128
            .checked_pow(frac_part.len() as u32)
            .ok_or_else(|| err("too many fractional digits"))?;

        let numerator = mantissa
            .checked_mul(num)
            .and_then(|v| v.checked_mul(1000))
            .ok_or_else(|| err("number out of range"))?;
        let denominator = scale
            .checked_mul(den)
            .ok_or_else(|| err("too many fractional digits"))?;
        // Round fractional milli-units up.
        let mut millis = numerator / denominator;
        if numerator % denominator != 0 {
            millis += 1;
        }
        if negative {
            millis = -millis;
        }
        Ok(Self {
            millis,
            raw: trimmed.to_string(),
        })
    }
}

impl fmt::Debug for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Quantity({})", self)
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.raw.is_empty() {
            write!(f, "{}", self.millis / 1000)
        } else {
            f.write_str(&self.raw)
        }
    }
}

impl PartialEq for Quantity {
    fn eq(&self, other: &Self) -> bool {
        self.millis == other.millis
    }
}

impl Eq for Quantity {}

impl Hash for Quantity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.millis.hash(state);
    }
}

impl PartialOrd for Quantity {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Quantity {
    fn cmp(&self, other: &Self) -> Ordering {
        self.millis.cmp(&other.millis)
    }
}

impl Default for Quantity {
    fn default() -> Self {
        Self::ZERO
    }
}

impl Serialize for Quantity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Quantity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct QuantityVisitor;

        impl Visitor<'_> for QuantityVisitor {
            type Value = Quantity;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a quantity string or integer")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Quantity, E> {
                v.parse().map_err(E::custom)
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Quantity, E> {
                Ok(Quantity::from_int(v))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Quantity, E> {
                Ok(Quantity::from_millis(i128::from(v) * 1000))
            }
        }

        deserializer.deserialize_any(QuantityVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn q(s: &str) -> Quantity {
        s.parse().unwrap()
    }

    #[test]
    fn parses_plain_integers() {
        assert_eq!(q("32").millis(), 32_000);
        assert_eq!(q("0").millis(), 0);
    }

    #[test]
    fn parses_suffixes() {
        assert_eq!(q("500m").millis(), 500);
        assert_eq!(q("2k"), q("2000"));
        assert_eq!(q("1Ki"), q("1024"));
        assert_eq!(q("16Gi").millis(), 16 * (1i128 << 30) * 1000);
    }

    #[test]
    fn parses_decimals() {
        assert_eq!(q("1.5"), q("1500m"));
        assert_eq!(q("0.5Gi"), q("512Mi"));
    }

    #[test]
    fn rounds_sub_milli_up() {
        assert_eq!(q("0.0001").millis(), 1);
    }

    #[test]
    fn rejects_garbage() {
        assert!("".parse::<Quantity>().is_err());
        assert!("abc".parse::<Quantity>().is_err());
        assert!("5Xi".parse::<Quantity>().is_err());
        assert!("1.2.3".parse::<Quantity>().is_err());
    }

    #[test]
    fn negative_values() {
        assert!(q("-3").is_negative());
    }

    #[test]
    fn serde_keeps_original_spelling() {
        let v: Quantity = serde_json::from_str("\"16Gi\"").unwrap();
        assert_eq!(serde_json::to_string(&v).unwrap(), "\"16Gi\"");
        let n: Quantity = serde_json::from_str("7").unwrap();
        assert_eq!(n, Quantity::from_int(7));
    }

    #[test]
    fn arithmetic() {
        let a = q("20");
        let b = q("12");
        assert_eq!(a.checked_add(&b).unwrap(), q("32"));
        assert_eq!(b.saturating_sub(&a), Quantity::ZERO);
        assert!(a > b);
    }

    #[test]
    fn rejects_fraction_too_fine_for_suffix() {
        let input = format!("0.{}m", "0".repeat(38));
        let err = input.parse::<Quantity>().unwrap_err();
        assert_eq!(err.reason, "too many fractional digits");
    }

    #[test]
    fn saturating_sub_at_extremes() {
        let low = Quantity::from_millis(i128::MIN + 1);
        let high = Quantity::from_millis(i128::MAX);
        assert_eq!(low.saturating_sub(&high), Quantity::ZERO);
        assert_eq!(high.saturating_sub(&low), high);
    }
}
