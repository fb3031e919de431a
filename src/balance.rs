use std::{fmt, str::FromStr, sync::LazyLock};

use bigdecimal::{num_bigint::BigInt, BigDecimal};
use serde::{de::Error as _, Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Decimals of the native token; balances arrive in the smallest unit (wei).
pub const NATIVE_DECIMALS: i64 = 18;

/// Decimals shown when a balance is rendered for humans.
const DISPLAY_DECIMALS: i64 = 6;

/// Largest number of significant digits a threshold may carry. Thresholds are
/// persisted as JSON numbers, this keeps that representation exact.
const MAX_THRESHOLD_DIGITS: u64 = 15;

static DEFAULT_THRESHOLD: LazyLock<BigDecimal> = LazyLock::new(|| BigDecimal::new(5.into(), 2));
static MAX_THRESHOLD: LazyLock<BigDecimal> = LazyLock::new(|| BigDecimal::from(100i64));

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QuantityError {
    #[error("malformed quantity: {0:?}")]
    Malformed(String),
}

/// Renders a decimal without exponent notation.
fn format_plain(value: &BigDecimal) -> String {
    let (digits, scale) = value.as_bigint_and_exponent();
    let digits = digits.to_string();
    let (sign, digits) = match digits.strip_prefix('-') {
        Some(rest) => ("-", rest.to_string()),
        None => ("", digits),
    };

    if scale <= 0 {
        if digits == "0" {
            return digits;
        }
        return format!("{sign}{digits}{}", "0".repeat(scale.unsigned_abs() as usize));
    }

    let scale = scale as usize;
    let padded = format!("{:0>width$}", digits, width = scale + 1);
    let (int_part, frac_part) = padded.split_at(padded.len() - scale);
    format!("{sign}{int_part}.{frac_part}")
}

fn parse_integer(digits: &str, radix: u32) -> Result<BigInt, QuantityError> {
    let well_formed = !digits.is_empty() && digits.chars().all(|c| c.is_digit(radix));
    if !well_formed {
        return Err(QuantityError::Malformed(digits.to_string()));
    }
    BigInt::parse_bytes(digits.as_bytes(), radix)
        .ok_or_else(|| QuantityError::Malformed(digits.to_string()))
}

/// An exact native-token or token balance in display units.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Balance(BigDecimal);

impl Balance {
    /// Converts an amount of the smallest unit into display units by an exact
    /// divide by 10^18.
    pub fn from_smallest_unit(amount: BigInt) -> Self {
        Self(BigDecimal::new(amount, NATIVE_DECIMALS))
    }

    /// Parses a `0x` prefixed base-16 quantity as returned by JSON-RPC nodes.
    pub fn from_hex_quantity(input: &str) -> Result<Self, QuantityError> {
        let digits = input
            .strip_prefix("0x")
            .ok_or_else(|| QuantityError::Malformed(input.to_string()))?;
        parse_integer(digits, 16).map(Self::from_smallest_unit)
    }

    /// Parses a base-10 quantity string as returned by explorer APIs.
    pub fn from_decimal_quantity(input: &str) -> Result<Self, QuantityError> {
        parse_integer(input, 10).map(Self::from_smallest_unit)
    }

    pub fn as_decimal(&self) -> &BigDecimal {
        &self.0
    }

    pub fn is_below(&self, threshold: &Threshold) -> bool {
        self.0 < threshold.0
    }
}

impl FromStr for Balance {
    type Err = QuantityError;

    /// Parses a balance already expressed in display units, e.g. `0.05`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BigDecimal::from_str(s)
            .map(Self)
            .map_err(|_| QuantityError::Malformed(s.to_string()))
    }
}

impl fmt::Display for Balance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", format_plain(&self.0.with_scale(DISPLAY_DECIMALS)))
    }
}

impl Serialize for Balance {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format_plain(&self.0.normalized()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ThresholdError {
    #[error("threshold must be greater than 0")]
    NotPositive,
    #[error("threshold must not exceed {}", format_plain(&MAX_THRESHOLD))]
    AboveMaximum,
    #[error("threshold has more than {} significant digits", MAX_THRESHOLD_DIGITS)]
    TooPrecise,
    #[error("threshold is not a number: {0:?}")]
    Malformed(String),
}

/// Per-subscriber alert threshold in display units, `0 < t <= 100`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Threshold(BigDecimal);

impl Threshold {
    pub fn new(value: BigDecimal) -> Result<Self, ThresholdError> {
        if value <= BigDecimal::from(0i64) {
            return Err(ThresholdError::NotPositive);
        }
        if value > *MAX_THRESHOLD {
            return Err(ThresholdError::AboveMaximum);
        }
        let value = value.normalized();
        if value.digits() > MAX_THRESHOLD_DIGITS {
            return Err(ThresholdError::TooPrecise);
        }
        Ok(Self(value))
    }

    pub fn as_decimal(&self) -> &BigDecimal {
        &self.0
    }
}

impl Default for Threshold {
    fn default() -> Self {
        Self(DEFAULT_THRESHOLD.clone())
    }
}

impl FromStr for Threshold {
    type Err = ThresholdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value = BigDecimal::from_str(s.trim())
            .map_err(|_| ThresholdError::Malformed(s.to_string()))?;
        Self::new(value)
    }
}

impl fmt::Display for Threshold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", format_plain(&self.0))
    }
}

// Persisted as a plain JSON number in display units.
impl Serialize for Threshold {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let value = format_plain(&self.0)
            .parse::<f64>()
            .map_err(<S::Error as serde::ser::Error>::custom)?;
        serializer.serialize_f64(value)
    }
}

impl<'de> Deserialize<'de> for Threshold {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = f64::deserialize(deserializer)?;
        value.to_string().parse().map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn balance(s: &str) -> Balance {
        s.parse().unwrap()
    }

    fn threshold(s: &str) -> Threshold {
        s.parse().unwrap()
    }

    #[test]
    fn converts_hex_wei_exactly() {
        // 0.05 BNB
        let parsed = Balance::from_hex_quantity("0xb1a2bc2ec50000").unwrap();
        assert_eq!(parsed, balance("0.05"));
        assert_eq!(Balance::from_hex_quantity("0x0").unwrap(), balance("0"));
    }

    #[test]
    fn converts_decimal_wei_exactly() {
        let parsed = Balance::from_decimal_quantity("1234567890123456789").unwrap();
        assert_eq!(parsed, balance("1.234567890123456789"));
    }

    #[test]
    fn rejects_malformed_quantities() {
        assert!(Balance::from_hex_quantity("b1a2bc2ec50000").is_err());
        assert!(Balance::from_hex_quantity("0x").is_err());
        assert!(Balance::from_hex_quantity("0xzz").is_err());
        assert!(Balance::from_decimal_quantity("").is_err());
        assert!(Balance::from_decimal_quantity("-5").is_err());
        assert!(Balance::from_decimal_quantity("1.5").is_err());
        assert!(Balance::from_decimal_quantity("0x10").is_err());
    }

    #[test]
    fn displays_six_decimals() {
        assert_eq!(balance("0.05").to_string(), "0.050000");
        assert_eq!(balance("12").to_string(), "12.000000");
        assert_eq!(
            Balance::from_decimal_quantity("1999999").unwrap().to_string(),
            "0.000000"
        );
        assert_eq!(
            Balance::from_decimal_quantity("123456789012345678901")
                .unwrap()
                .to_string(),
            "123.456789"
        );
    }

    #[test]
    fn compares_strictly_below_threshold() {
        assert!(balance("0.01").is_below(&threshold("0.05")));
        assert!(!balance("0.05").is_below(&threshold("0.05")));
        assert!(!balance("0.050000000000000000").is_below(&threshold("0.05")));
        assert!(!balance("0.06").is_below(&threshold("0.05")));
    }

    #[test]
    fn validates_threshold_bounds() {
        assert_eq!("0".parse::<Threshold>(), Err(ThresholdError::NotPositive));
        assert_eq!("-1".parse::<Threshold>(), Err(ThresholdError::NotPositive));
        assert_eq!("100.1".parse::<Threshold>(), Err(ThresholdError::AboveMaximum));
        assert!(matches!(
            "abc".parse::<Threshold>(),
            Err(ThresholdError::Malformed(_))
        ));
        assert_eq!(
            "0.1234567890123456".parse::<Threshold>(),
            Err(ThresholdError::TooPrecise)
        );
        assert_eq!(threshold("100").to_string(), "100");
        assert_eq!(threshold("0.10").to_string(), "0.1");
    }

    #[test]
    fn default_threshold_is_five_hundredths() {
        assert_eq!(Threshold::default(), threshold("0.05"));
        assert_eq!(Threshold::default().to_string(), "0.05");
    }

    #[test]
    fn threshold_persists_as_number() {
        let json = serde_json::to_string(&threshold("0.1")).unwrap();
        assert_eq!(json, "0.1");
        let parsed: Threshold = serde_json::from_str("0.05").unwrap();
        assert_eq!(parsed, threshold("0.05"));
        assert!(serde_json::from_str::<Threshold>("0").is_err());
    }
}
