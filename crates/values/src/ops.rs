//! Arithmetic, logical, comparison and LIKE kernels over [`SqlValue`].
//!
//! Every kernel is Null-propagating: a Null operand yields Null unless the
//! three-valued logic of AND/OR can decide without it. Integer arithmetic
//! that overflows i64 promotes into BigInt rather than wrapping.

use std::cmp::Ordering;

use num_bigint::BigInt;
use num_traits::{ToPrimitive, Zero};

use crate::value::numeric_prefix;
use crate::{compare, SqlValue};

/// The numeric tower a value lands in for arithmetic.
enum Num {
    Null,
    Int(i64),
    Big(BigInt),
    Real(f64),
}

fn numeric(v: &SqlValue) -> Num {
    match v {
        SqlValue::Null => Num::Null,
        SqlValue::Integer(i) => Num::Int(*i),
        SqlValue::BigInt(b) => Num::Big((**b).clone()),
        SqlValue::Float(f) => Num::Real(*f),
        // Text and blobs coerce through their numeric prefix, 0 otherwise.
        SqlValue::Text(t) => {
            let f = numeric_prefix(t);
            if f.fract() == 0.0 && f.abs() < 9.2e18 {
                Num::Int(f as i64)
            } else {
                Num::Real(f)
            }
        }
        SqlValue::Blob(_) => Num::Int(0),
    }
}

fn from_big(b: BigInt) -> SqlValue {
    match b.to_i64() {
        Some(i) => SqlValue::Integer(i),
        None => SqlValue::BigInt(Box::new(b)),
    }
}

macro_rules! arith {
    ($name:ident, $checked:ident, $op:tt) => {
        pub fn $name(lhs: &SqlValue, rhs: &SqlValue) -> SqlValue {
            match (numeric(lhs), numeric(rhs)) {
                (Num::Null, _) | (_, Num::Null) => SqlValue::Null,
                (Num::Int(l), Num::Int(r)) => match l.$checked(r) {
                    Some(v) => SqlValue::Integer(v),
                    None => from_big(BigInt::from(l) $op BigInt::from(r)),
                },
                (Num::Real(l), Num::Real(r)) => SqlValue::Float(l $op r),
                (Num::Real(l), Num::Int(r)) => SqlValue::Float(l $op r as f64),
                (Num::Int(l), Num::Real(r)) => SqlValue::Float(l as f64 $op r),
                (Num::Big(l), Num::Big(r)) => from_big(l $op r),
                (Num::Big(l), Num::Int(r)) => from_big(l $op BigInt::from(r)),
                (Num::Int(l), Num::Big(r)) => from_big(BigInt::from(l) $op r),
                (Num::Big(l), Num::Real(r)) => SqlValue::Float(l.to_f64().unwrap_or(f64::INFINITY) $op r),
                (Num::Real(l), Num::Big(r)) => SqlValue::Float(l $op r.to_f64().unwrap_or(f64::INFINITY)),
            }
        }
    };
}

arith!(add, checked_add, +);
arith!(sub, checked_sub, -);
arith!(mul, checked_mul, *);

/// Division: integer division truncates; division by zero is Null.
pub fn div(lhs: &SqlValue, rhs: &SqlValue) -> SqlValue {
    match (numeric(lhs), numeric(rhs)) {
        (Num::Null, _) | (_, Num::Null) => SqlValue::Null,
        (_, Num::Int(0)) => SqlValue::Null,
        (_, Num::Big(ref r)) if r.is_zero() => SqlValue::Null,
        (_, Num::Real(r)) if r == 0.0 => SqlValue::Null,
        (Num::Int(l), Num::Int(r)) => match l.checked_div(r) {
            Some(v) => SqlValue::Integer(v),
            None => from_big(BigInt::from(l) / BigInt::from(r)),
        },
        (Num::Real(l), Num::Real(r)) => SqlValue::Float(l / r),
        (Num::Real(l), Num::Int(r)) => SqlValue::Float(l / r as f64),
        (Num::Int(l), Num::Real(r)) => SqlValue::Float(l as f64 / r),
        (Num::Big(l), Num::Big(r)) => from_big(l / r),
        (Num::Big(l), Num::Int(r)) => from_big(l / BigInt::from(r)),
        (Num::Int(l), Num::Big(r)) => from_big(BigInt::from(l) / r),
        (Num::Big(l), Num::Real(r)) => SqlValue::Float(l.to_f64().unwrap_or(f64::INFINITY) / r),
        (Num::Real(l), Num::Big(r)) => {
            SqlValue::Float(l / r.to_f64().unwrap_or(f64::INFINITY))
        }
    }
}

/// Remainder, with the same zero-divisor and overflow handling as div.
pub fn rem(lhs: &SqlValue, rhs: &SqlValue) -> SqlValue {
    match (numeric(lhs), numeric(rhs)) {
        (Num::Null, _) | (_, Num::Null) => SqlValue::Null,
        (_, Num::Int(0)) => SqlValue::Null,
        (_, Num::Big(ref r)) if r.is_zero() => SqlValue::Null,
        (_, Num::Real(r)) if r == 0.0 => SqlValue::Null,
        (Num::Int(l), Num::Int(r)) => match l.checked_rem(r) {
            Some(v) => SqlValue::Integer(v),
            None => SqlValue::Integer(0),
        },
        (Num::Real(l), Num::Real(r)) => SqlValue::Float(l % r),
        (Num::Real(l), Num::Int(r)) => SqlValue::Float(l % r as f64),
        (Num::Int(l), Num::Real(r)) => SqlValue::Float(l as f64 % r),
        (Num::Big(l), Num::Big(r)) => from_big(l % r),
        (Num::Big(l), Num::Int(r)) => from_big(l % BigInt::from(r)),
        (Num::Int(l), Num::Big(r)) => from_big(BigInt::from(l) % r),
        (Num::Big(l), Num::Real(r)) => SqlValue::Float(l.to_f64().unwrap_or(f64::INFINITY) % r),
        (Num::Real(l), Num::Big(r)) => {
            SqlValue::Float(l % r.to_f64().unwrap_or(f64::INFINITY))
        }
    }
}

pub fn neg(v: &SqlValue) -> SqlValue {
    match numeric(v) {
        Num::Null => SqlValue::Null,
        Num::Int(i) => match i.checked_neg() {
            Some(n) => SqlValue::Integer(n),
            None => from_big(-BigInt::from(i)),
        },
        Num::Big(b) => from_big(-b),
        Num::Real(f) => SqlValue::Float(-f),
    }
}

/// String concatenation (the `||` operator).
pub fn concat(lhs: &SqlValue, rhs: &SqlValue) -> SqlValue {
    if lhs.is_null() || rhs.is_null() {
        return SqlValue::Null;
    }
    SqlValue::text(format!("{lhs}{rhs}"))
}

fn bool_value(b: Option<bool>) -> SqlValue {
    match b {
        None => SqlValue::Null,
        Some(true) => SqlValue::Integer(1),
        Some(false) => SqlValue::Integer(0),
    }
}

/// Comparison kernels. Null operands yield Null.
pub fn cmp(op: Ordering, negate_eq: bool, lhs: &SqlValue, rhs: &SqlValue) -> SqlValue {
    if lhs.is_null() || rhs.is_null() {
        return SqlValue::Null;
    }
    let ord = compare(lhs, rhs);
    let hit = if negate_eq { ord != op } else { ord == op };
    bool_value(Some(hit))
}

pub fn eq(lhs: &SqlValue, rhs: &SqlValue) -> SqlValue {
    cmp(Ordering::Equal, false, lhs, rhs)
}
pub fn ne(lhs: &SqlValue, rhs: &SqlValue) -> SqlValue {
    cmp(Ordering::Equal, true, lhs, rhs)
}
pub fn lt(lhs: &SqlValue, rhs: &SqlValue) -> SqlValue {
    cmp(Ordering::Less, false, lhs, rhs)
}
pub fn gt(lhs: &SqlValue, rhs: &SqlValue) -> SqlValue {
    cmp(Ordering::Greater, false, lhs, rhs)
}
pub fn le(lhs: &SqlValue, rhs: &SqlValue) -> SqlValue {
    cmp(Ordering::Greater, true, lhs, rhs)
}
pub fn ge(lhs: &SqlValue, rhs: &SqlValue) -> SqlValue {
    cmp(Ordering::Less, true, lhs, rhs)
}

/// Three-valued AND: false dominates Null.
pub fn and(lhs: &SqlValue, rhs: &SqlValue) -> SqlValue {
    match (lhs.is_truthy(), rhs.is_truthy()) {
        (Some(false), _) | (_, Some(false)) => bool_value(Some(false)),
        (Some(true), Some(true)) => bool_value(Some(true)),
        _ => SqlValue::Null,
    }
}

/// Three-valued OR: true dominates Null.
pub fn or(lhs: &SqlValue, rhs: &SqlValue) -> SqlValue {
    match (lhs.is_truthy(), rhs.is_truthy()) {
        (Some(true), _) | (_, Some(true)) => bool_value(Some(true)),
        (Some(false), Some(false)) => bool_value(Some(false)),
        _ => SqlValue::Null,
    }
}

pub fn not(v: &SqlValue) -> SqlValue {
    bool_value(v.is_truthy().map(|b| !b))
}

/// LIKE with `%` and `_` wildcards, ASCII case-insensitive.
pub fn like(text: &SqlValue, pattern: &SqlValue) -> SqlValue {
    let (Some(text), Some(pattern)) = (text.as_str(), pattern.as_str()) else {
        return SqlValue::Null;
    };
    bool_value(Some(like_match(
        pattern.to_ascii_lowercase().as_bytes(),
        text.to_ascii_lowercase().as_bytes(),
    )))
}

fn like_match(pattern: &[u8], text: &[u8]) -> bool {
    match pattern.split_first() {
        None => text.is_empty(),
        Some((b'%', rest)) => {
            (0..=text.len()).any(|skip| like_match(rest, &text[skip..]))
        }
        Some((b'_', rest)) => match text.split_first() {
            Some((_, text)) => like_match(rest, text),
            None => false,
        },
        Some((c, rest)) => match text.split_first() {
            Some((t, text)) if t == c => like_match(rest, text),
            _ => false,
        },
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::SqlValue;
    use num_bigint::BigInt;

    #[test]
    fn test_add_overflow_promotes() {
        let sum = add(&SqlValue::Integer(i64::MAX), &SqlValue::Integer(1));
        assert_eq!(
            sum,
            SqlValue::BigInt(Box::new(BigInt::from(i64::MAX) + 1))
        );
        // And BigInt arithmetic narrows back when it fits.
        let back = sub(&sum, &SqlValue::Integer(1));
        assert_eq!(back, SqlValue::Integer(i64::MAX));
    }

    #[test]
    fn test_div_by_zero_is_null() {
        assert_eq!(div(&SqlValue::Integer(1), &SqlValue::Integer(0)), SqlValue::Null);
        assert_eq!(rem(&SqlValue::Integer(1), &SqlValue::Float(0.0)), SqlValue::Null);
    }

    #[test]
    fn test_three_valued_logic() {
        let t = SqlValue::Integer(1);
        let f = SqlValue::Integer(0);
        let n = SqlValue::Null;
        assert_eq!(and(&f, &n), SqlValue::Integer(0));
        assert_eq!(and(&t, &n), SqlValue::Null);
        assert_eq!(or(&t, &n), SqlValue::Integer(1));
        assert_eq!(or(&f, &n), SqlValue::Null);
        assert_eq!(not(&n), SqlValue::Null);
    }

    #[test]
    fn test_comparisons() {
        assert_eq!(gt(&SqlValue::Integer(2), &SqlValue::Integer(1)), SqlValue::Integer(1));
        assert_eq!(le(&SqlValue::Integer(2), &SqlValue::Integer(1)), SqlValue::Integer(0));
        assert_eq!(eq(&SqlValue::Null, &SqlValue::Integer(1)), SqlValue::Null);
        assert_eq!(
            eq(&SqlValue::Integer(3), &SqlValue::Float(3.0)),
            SqlValue::Integer(1)
        );
    }

    #[test]
    fn test_like() {
        let t = |s: &str| SqlValue::text(s);
        assert_eq!(like(&t("hello"), &t("h%")), SqlValue::Integer(1));
        assert_eq!(like(&t("hello"), &t("H_LLO")), SqlValue::Integer(1));
        assert_eq!(like(&t("hello"), &t("h_llx")), SqlValue::Integer(0));
        assert_eq!(like(&t("hello"), &t("%ll%")), SqlValue::Integer(1));
        assert_eq!(like(&SqlValue::Null, &t("%")), SqlValue::Null);
    }

    #[test]
    fn test_concat() {
        assert_eq!(
            concat(&SqlValue::text("a"), &SqlValue::Integer(1)),
            SqlValue::text("a1")
        );
        assert_eq!(concat(&SqlValue::text("a"), &SqlValue::Null), SqlValue::Null);
    }
}
