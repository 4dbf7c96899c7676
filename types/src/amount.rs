//! USDC amounts held as integer micro-units (6 decimals).

use crate::ParseError;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::iter::Sum;
use std::str::FromStr;

/// Decimal places of the settlement token.
pub const USDC_DECIMALS: u32 = 6;

/// Micro-units in one whole USDC.
pub const MICROS_PER_USDC: u64 = 1_000_000;

/// An amount of USDC in micro-units.
///
/// Serialized as a decimal string (`"1.0"`, `"0.05"`) so that clients never
/// see floating point rounding.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Usdc(u64);

impl Usdc {
    pub const ZERO: Usdc = Usdc(0);

    pub const fn from_micros(micros: u64) -> Self {
        Self(micros)
    }

    /// Whole-token constructor. Saturates instead of wrapping.
    pub const fn from_units(units: u64) -> Self {
        Self(units.saturating_mul(MICROS_PER_USDC))
    }

    pub const fn micros(self) -> u64 {
        self.0
    }

    pub fn checked_add(self, other: Usdc) -> Option<Usdc> {
        self.0.checked_add(other.0).map(Usdc)
    }

    pub fn saturating_add(self, other: Usdc) -> Usdc {
        Usdc(self.0.saturating_add(other.0))
    }

    pub fn saturating_sub(self, other: Usdc) -> Usdc {
        Usdc(self.0.saturating_sub(other.0))
    }

    pub fn checked_mul(self, factor: u64) -> Option<Usdc> {
        self.0.checked_mul(factor).map(Usdc)
    }

    /// `self * numerator / denominator`, rounded down. Returns zero for a zero denominator.
    pub fn mul_div(self, numerator: Usdc, denominator: Usdc) -> Usdc {
        if denominator.0 == 0 {
            return Usdc::ZERO;
        }
        let value = (self.0 as u128 * numerator.0 as u128) / denominator.0 as u128;
        Usdc(u64::try_from(value).unwrap_or(u64::MAX))
    }

    /// Lossy conversion for percentage style math in responses.
    pub fn as_f64(self) -> f64 {
        self.0 as f64 / MICROS_PER_USDC as f64
    }
}

impl fmt::Display for Usdc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let whole = self.0 / MICROS_PER_USDC;
        let fraction = self.0 % MICROS_PER_USDC;
        let digits = format!("{fraction:06}");
        let trimmed = digits.trim_end_matches('0');
        if trimmed.is_empty() {
            write!(f, "{whole}.0")
        } else {
            write!(f, "{whole}.{trimmed}")
        }
    }
}

impl FromStr for Usdc {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (whole, fraction) = match s.split_once('.') {
            Some((whole, fraction)) => (whole, fraction),
            None => (s, ""),
        };
        if whole.is_empty() && fraction.is_empty() {
            return Err(ParseError::Amount(s.to_string()));
        }
        if !whole.chars().all(|c| c.is_ascii_digit())
            || !fraction.chars().all(|c| c.is_ascii_digit())
            || fraction.len() > USDC_DECIMALS as usize
        {
            return Err(ParseError::Amount(s.to_string()));
        }
        let whole: u64 = if whole.is_empty() {
            0
        } else {
            whole.parse().map_err(|_| ParseError::AmountOverflow)?
        };
        let fraction_micros: u64 = if fraction.is_empty() {
            0
        } else {
            let padded = format!("{fraction:0<6}");
            padded
                .parse()
                .map_err(|_| ParseError::Amount(s.to_string()))?
        };
        whole
            .checked_mul(MICROS_PER_USDC)
            .and_then(|micros| micros.checked_add(fraction_micros))
            .map(Usdc)
            .ok_or(ParseError::AmountOverflow)
    }
}

impl Sum for Usdc {
    fn sum<I: Iterator<Item = Usdc>>(iter: I) -> Self {
        iter.fold(Usdc::ZERO, Usdc::saturating_add)
    }
}

impl Serialize for Usdc {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Usdc {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct UsdcVisitor;

        impl de::Visitor<'_> for UsdcVisitor {
            type Value = Usdc;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a decimal USDC amount")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Usdc, E> {
                v.parse().map_err(E::custom)
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Usdc, E> {
                v.checked_mul(MICROS_PER_USDC)
                    .map(Usdc)
                    .ok_or_else(|| E::custom(ParseError::AmountOverflow))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Usdc, E> {
                let v = u64::try_from(v).map_err(|_| E::custom("negative amount"))?;
                self.visit_u64(v)
            }

            fn visit_f64<E: de::Error>(self, v: f64) -> Result<Usdc, E> {
                if !v.is_finite() || v < 0.0 {
                    return Err(E::custom("invalid amount"));
                }
                format!("{v:.6}").parse().map_err(E::custom)
            }
        }

        deserializer.deserialize_any(UsdcVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_like_format_units() {
        assert_eq!(Usdc::ZERO.to_string(), "0.0");
        assert_eq!(Usdc::from_units(1000).to_string(), "1000.0");
        assert_eq!(Usdc::from_micros(50_000).to_string(), "0.05");
        assert_eq!(Usdc::from_micros(1_234_567).to_string(), "1.234567");
    }

    #[test]
    fn parses_decimal_strings() {
        assert_eq!("1".parse::<Usdc>().unwrap(), Usdc::from_units(1));
        assert_eq!("0.5".parse::<Usdc>().unwrap(), Usdc::from_micros(500_000));
        assert_eq!(".25".parse::<Usdc>().unwrap(), Usdc::from_micros(250_000));
        assert!("1.0000001".parse::<Usdc>().is_err());
        assert!("-1".parse::<Usdc>().is_err());
        assert!("abc".parse::<Usdc>().is_err());
        assert!(".".parse::<Usdc>().is_err());
    }

    #[test]
    fn referral_share_rounds_down() {
        let spent = Usdc::from_units(3);
        let share = spent.mul_div(Usdc::from_units(50), Usdc::from_units(1000));
        assert_eq!(share, Usdc::from_micros(150_000));
        assert_eq!(spent.mul_div(Usdc::from_units(1), Usdc::ZERO), Usdc::ZERO);
    }

    #[test]
    fn deserializes_strings_and_numbers() {
        let from_str: Usdc = serde_json::from_str("\"2.5\"").unwrap();
        let from_int: Usdc = serde_json::from_str("3").unwrap();
        assert_eq!(from_str, Usdc::from_micros(2_500_000));
        assert_eq!(from_int, Usdc::from_units(3));
        assert_eq!(serde_json::to_string(&from_str).unwrap(), "\"2.5\"");
    }
}
