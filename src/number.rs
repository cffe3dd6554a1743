// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use core::cmp::{Ord, Ordering};
use core::fmt::{self, Debug, Display, Formatter};
use core::str::FromStr;

use crate::Rc;
use anyhow::{bail, Result};
use num_bigint::{BigInt, Sign};
use num_traits::{Signed, ToPrimitive, Zero};
use serde::ser::Serializer;
use serde::Serialize;

/// A Rego number.
///
/// Integers are arbitrary precision; the textual form in the policy or data
/// document is kept intact until arithmetic or comparison forces promotion.
/// Floats are IEEE-754 doubles. Mixed arithmetic widens to float.
#[derive(Clone)]
pub enum Number {
    Int(Rc<BigInt>),
    Float(f64),
}

use Number::*;

impl Debug for Number {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Int(i) => Debug::fmt(i, f),
            Float(d) => Debug::fmt(d, f),
        }
    }
}

impl Display for Number {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Int(i) => Display::fmt(i, f),
            Float(d) => {
                if d.fract() == 0.0 && d.is_finite() && d.abs() < 1e15 {
                    // Keep whole-valued floats in integer form, as JSON would.
                    write!(f, "{}", *d as i64)
                } else {
                    write!(f, "{d}")
                }
            }
        }
    }
}

impl Serialize for Number {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            Int(i) => {
                if let Some(v) = i.to_u64() {
                    serializer.serialize_u64(v)
                } else if let Some(v) = i.to_i64() {
                    serializer.serialize_i64(v)
                } else {
                    // Out of 64-bit range: fall back to the decimal string
                    // parsed as a JSON number.
                    match serde_json::Number::from_str(&i.to_string()) {
                        Ok(n) => n.serialize(serializer),
                        Err(_) => Err(serde::ser::Error::custom("could not serialize big number")),
                    }
                }
            }
            Float(d) => serializer.serialize_f64(*d),
        }
    }
}

impl From<u64> for Number {
    fn from(n: u64) -> Self {
        Int(Rc::new(BigInt::from(n)))
    }
}

impl From<i64> for Number {
    fn from(n: i64) -> Self {
        Int(Rc::new(BigInt::from(n)))
    }
}

impl From<usize> for Number {
    fn from(n: usize) -> Self {
        Int(Rc::new(BigInt::from(n)))
    }
}

impl From<f64> for Number {
    fn from(n: f64) -> Self {
        Float(n)
    }
}

impl From<BigInt> for Number {
    fn from(n: BigInt) -> Self {
        Int(Rc::new(n))
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseNumberError;

impl FromStr for Number {
    type Err = ParseNumberError;

    /// Promote a source-text number. Presence of `.`, `e` or `E` selects the
    /// float representation, anything else parses as an integer.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.contains(['.', 'e', 'E']) {
            f64::from_str(s).map(Float).map_err(|_| ParseNumberError)
        } else {
            BigInt::from_str(s)
                .map(|i| Int(Rc::new(i)))
                .map_err(|_| ParseNumberError)
        }
    }
}

impl Number {
    /// Whether the source text denotes an integer (no fraction or exponent).
    pub fn text_is_int(s: &str) -> bool {
        !s.contains(['.', 'e', 'E'])
    }

    pub fn is_integer(&self) -> bool {
        match self {
            Int(_) => true,
            Float(d) => d.fract() == 0.0 && d.is_finite(),
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Int(i) => i.to_u64(),
            Float(d) if d.fract() == 0.0 && *d >= 0.0 && *d <= u64::MAX as f64 => Some(*d as u64),
            Float(_) => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Int(i) => i.to_i64(),
            Float(d) if d.fract() == 0.0 && *d >= i64::MIN as f64 && *d <= i64::MAX as f64 => {
                Some(*d as i64)
            }
            Float(_) => None,
        }
    }

    pub fn as_f64(&self) -> f64 {
        match self {
            Int(i) => i.to_f64().unwrap_or_else(|| {
                if i.sign() == Sign::Minus {
                    f64::NEG_INFINITY
                } else {
                    f64::INFINITY
                }
            }),
            Float(d) => *d,
        }
    }

    pub fn add(&self, rhs: &Self) -> Result<Number> {
        Ok(match (self, rhs) {
            (Int(a), Int(b)) => Int(Rc::new(a.as_ref() + b.as_ref())),
            _ => Float(self.as_f64() + rhs.as_f64()),
        })
    }

    pub fn sub(&self, rhs: &Self) -> Result<Number> {
        Ok(match (self, rhs) {
            (Int(a), Int(b)) => Int(Rc::new(a.as_ref() - b.as_ref())),
            _ => Float(self.as_f64() - rhs.as_f64()),
        })
    }

    pub fn mul(&self, rhs: &Self) -> Result<Number> {
        Ok(match (self, rhs) {
            (Int(a), Int(b)) => Int(Rc::new(a.as_ref() * b.as_ref())),
            _ => Float(self.as_f64() * rhs.as_f64()),
        })
    }

    pub fn divide(&self, rhs: &Self) -> Result<Number> {
        match (self, rhs) {
            (Int(a), Int(b)) => {
                if b.is_zero() {
                    bail!("divide by zero");
                }
                if (a.as_ref() % b.as_ref()).is_zero() {
                    Ok(Int(Rc::new(a.as_ref() / b.as_ref())))
                } else {
                    Ok(Float(self.as_f64() / rhs.as_f64()))
                }
            }
            _ => {
                let d = rhs.as_f64();
                if d == 0.0 {
                    bail!("divide by zero");
                }
                Ok(Float(self.as_f64() / d))
            }
        }
    }

    pub fn modulo(&self, rhs: &Self) -> Result<Number> {
        match (self, rhs) {
            (Int(a), Int(b)) => {
                if b.is_zero() {
                    bail!("modulo by zero");
                }
                Ok(Int(Rc::new(a.as_ref() % b.as_ref())))
            }
            _ => bail!("modulo on floating-point number"),
        }
    }

    pub fn neg(&self) -> Number {
        match self {
            Int(i) => Int(Rc::new(-i.as_ref())),
            Float(d) => Float(-d),
        }
    }

    pub fn abs(&self) -> Number {
        match self {
            Int(i) => Int(Rc::new(i.abs())),
            Float(d) => Float(d.abs()),
        }
    }
}

impl Eq for Number {}

impl PartialEq for Number {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Ord for Number {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Int(a), Int(b)) => a.cmp(b),
            // Mixed comparisons go through f64; total_cmp keeps NaN ordered.
            _ => self.as_f64().total_cmp(&other.as_f64()),
        }
    }
}

impl PartialOrd for Number {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn n(s: &str) -> Number {
        Number::from_str(s).unwrap()
    }

    #[test]
    fn promotes_lazily() {
        assert!(matches!(n("42"), Int(_)));
        assert!(matches!(n("4.2"), Float(_)));
        assert!(matches!(n("4e2"), Float(_)));
        assert!(matches!(
            n("123456789012345678901234567890123456789"),
            Int(_)
        ));
    }

    #[test]
    fn integer_arithmetic_is_exact() {
        let a = n("123456789012345678901234567890");
        let b = n("1");
        let c = a.add(&b).unwrap();
        assert_eq!(c.to_string(), "123456789012345678901234567891");
        assert_eq!(c.sub(&b).unwrap(), a);
    }

    #[test]
    fn mixed_arithmetic_widens() {
        let c = n("2").mul(&n("1.5")).unwrap();
        assert!(matches!(c, Float(_)));
        assert_eq!(c, n("3.0"));
    }

    #[test]
    fn division() {
        assert_eq!(n("42").divide(&n("2")).unwrap(), n("21"));
        assert_eq!(n("3").divide(&n("2")).unwrap(), n("1.5"));
        assert!(n("1").divide(&n("0")).is_err());
        assert!(n("7").modulo(&n("1.5")).is_err());
        assert_eq!(n("7").modulo(&n("4")).unwrap(), n("3"));
    }

    #[test]
    fn mixed_equality() {
        assert_eq!(n("2"), n("2.0"));
        assert!(n("2") < n("2.5"));
        assert!(n("3") > n("2.5"));
    }

    #[test]
    fn serializes_as_json_number() {
        assert_eq!(serde_json::to_string(&n("42")).unwrap(), "42");
        assert_eq!(serde_json::to_string(&n("-1")).unwrap(), "-1");
        assert_eq!(serde_json::to_string(&n("1.5")).unwrap(), "1.5");
    }
}
