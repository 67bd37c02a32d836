use std::{
    fmt::Display,
    iter::Sum,
    ops::{Add, AddAssign, Mul, Neg, Sub, SubAssign},
    str::FromStr,
};

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use sqlx::{
    encode::IsNull,
    error::BoxDynError,
    sqlite::{SqliteArgumentValue, SqliteTypeInfo, SqliteValueRef},
    Decode, Encode, Sqlite, Type,
};
use thiserror::Error;

use crate::op;

pub const USD_CURRENCY_CODE: &str = "USD";

//--------------------------------------    AtomicAmount    -----------------------------------------------------------

/// An amount of a token, counted in the token's smallest indivisible unit.
///
/// Backed by a signed 128-bit integer, which comfortably holds the full
/// circulating supply of any stablecoin at 6 or 18 decimals. Amounts are
/// persisted as decimal TEXT columns so the database never truncates them,
/// and serialized as JSON strings so clients never lose precision to
/// floating-point parsing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Ord, PartialOrd, Hash)]
pub struct AtomicAmount(i128);

op!(binary AtomicAmount, Add, add);
op!(binary AtomicAmount, Sub, sub);
op!(inplace AtomicAmount, AddAssign, add_assign);
op!(inplace AtomicAmount, SubAssign, sub_assign);
op!(unary AtomicAmount, Neg, neg);

impl Mul<i128> for AtomicAmount {
    type Output = Self;

    fn mul(self, rhs: i128) -> Self::Output {
        Self(self.0 * rhs)
    }
}

impl Sum for AtomicAmount {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::default(), Add::add)
    }
}

#[derive(Debug, Clone, Error)]
#[error("Value cannot be represented as an atomic token amount: {0}")]
pub struct AtomicAmountConversionError(String);

impl AtomicAmount {
    pub const ZERO: AtomicAmount = AtomicAmount(0);

    pub fn value(&self) -> i128 {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

impl From<i128> for AtomicAmount {
    fn from(value: i128) -> Self {
        Self(value)
    }
}

impl From<i64> for AtomicAmount {
    fn from(value: i64) -> Self {
        Self(value as i128)
    }
}

impl FromStr for AtomicAmount {
    type Err = AtomicAmountConversionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<i128>().map(Self).map_err(|e| AtomicAmountConversionError(format!("{s}: {e}")))
    }
}

impl Display for AtomicAmount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for AtomicAmount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for AtomicAmount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

// i128 is not a native sqlx type, so amounts travel to and from SQLite as decimal text.
impl Type<Sqlite> for AtomicAmount {
    fn type_info() -> SqliteTypeInfo {
        <&str as Type<Sqlite>>::type_info()
    }

    fn compatible(ty: &SqliteTypeInfo) -> bool {
        <&str as Type<Sqlite>>::compatible(ty)
    }
}

impl<'q> Encode<'q, Sqlite> for AtomicAmount {
    fn encode_by_ref(&self, buf: &mut Vec<SqliteArgumentValue<'q>>) -> Result<IsNull, BoxDynError> {
        <String as Encode<'q, Sqlite>>::encode(self.0.to_string(), buf)
    }
}

impl<'r> Decode<'r, Sqlite> for AtomicAmount {
    fn decode(value: SqliteValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as Decode<'r, Sqlite>>::decode(value)?;
        Ok(s.parse::<AtomicAmount>()?)
    }
}

//--------------------------------------     FiatCents     ------------------------------------------------------------

/// A fiat amount in integer cents. No floating point anywhere in the money path.
#[derive(Debug, Clone, Copy, Default, Type, Ord, PartialOrd, Serialize, Deserialize)]
#[sqlx(transparent)]
pub struct FiatCents(i64);

op!(binary FiatCents, Add, add);
op!(binary FiatCents, Sub, sub);
op!(inplace FiatCents, SubAssign, sub_assign);
op!(unary FiatCents, Neg, neg);

impl Sum for FiatCents {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::default(), Add::add)
    }
}

impl PartialEq for FiatCents {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for FiatCents {}

impl From<i64> for FiatCents {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl FiatCents {
    pub fn value(&self) -> i64 {
        self.0
    }

    pub fn from_dollars(dollars: i64) -> Self {
        Self(dollars * 100)
    }
}

impl Display for FiatCents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "${}.{:02}", self.0 / 100, (self.0 % 100).abs())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn atomic_amount_arithmetic() {
        let a = AtomicAmount::from(6_000_000i64);
        let b = AtomicAmount::from(4_000_000i64);
        assert_eq!(a + b, AtomicAmount::from(10_000_000i64));
        assert_eq!(a - b, AtomicAmount::from(2_000_000i64));
        assert_eq!(-b, AtomicAmount::from(-4_000_000i64));
        let total: AtomicAmount = [a, b].into_iter().sum();
        assert_eq!(total.value(), 10_000_000);
    }

    #[test]
    fn atomic_amount_survives_json_round_trip_at_full_precision() {
        // 78-digit decimals overflow i128, but the full u64 range and well past it must survive.
        let amount = AtomicAmount::from(123_456_789_012_345_678_901_234_567_890i128);
        let json = serde_json::to_string(&amount).unwrap();
        assert_eq!(json, r#""123456789012345678901234567890""#);
        let back: AtomicAmount = serde_json::from_str(&json).unwrap();
        assert_eq!(back, amount);
    }

    #[test]
    fn atomic_amount_rejects_garbage() {
        assert!("1.5".parse::<AtomicAmount>().is_err());
        assert!("ten".parse::<AtomicAmount>().is_err());
        assert!("10000000".parse::<AtomicAmount>().is_ok());
    }

    #[test]
    fn fiat_cents_display() {
        assert_eq!(FiatCents::from(1000).to_string(), "$10.00");
        assert_eq!(FiatCents::from(1099).to_string(), "$10.99");
        assert_eq!(FiatCents::from_dollars(25).value(), 2500);
    }
}
