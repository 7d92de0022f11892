use std::cmp::Ordering;

use num_bigint::BigInt;
use num_traits::ToPrimitive;

use crate::{Collation, SqlValue};

/// compare evaluates the total ordering of |lhs| and |rhs|.
/// All numeric variants compare by numeric value; across storage
/// classes the order is Null < numerics < Text < Blob. Sort nodes,
/// B-tree keys and DISTINCT all route through here.
pub fn compare(lhs: &SqlValue, rhs: &SqlValue) -> Ordering {
    use SqlValue::*;

    match (lhs, rhs) {
        (Null, Null) => Ordering::Equal,
        (Integer(l), Integer(r)) => l.cmp(r),
        (BigInt(l), BigInt(r)) => l.cmp(r),
        (Integer(l), BigInt(r)) => num_bigint::BigInt::from(*l).cmp(r),
        (BigInt(l), Integer(r)) => (**l).cmp(&num_bigint::BigInt::from(*r)),
        (Float(l), Float(r)) => l.total_cmp(r),
        (Integer(l), Float(r)) => cmp_int_float(*l, *r),
        (Float(l), Integer(r)) => cmp_int_float(*r, *l).reverse(),
        (BigInt(l), Float(r)) => cmp_big_float(l, *r),
        (Float(l), BigInt(r)) => cmp_big_float(r, *l).reverse(),
        (Text(l), Text(r)) => l.as_bytes().cmp(r.as_bytes()),
        (Blob(l), Blob(r)) => l.cmp(r),

        // Storage classes differ. Null < numerics < Text < Blob.
        (Null, _) => Ordering::Less,
        (_, Null) => Ordering::Greater,
        (Integer(_) | BigInt(_) | Float(_), _) => Ordering::Less,
        (_, Integer(_) | BigInt(_) | Float(_)) => Ordering::Greater,
        (Text(_), _) => Ordering::Less,
        (_, Text(_)) => Ordering::Greater,
    }
}

/// compare_with applies |collation| to the text-vs-text case and
/// falls back to the plain total order everywhere else.
pub fn compare_with(collation: Collation, lhs: &SqlValue, rhs: &SqlValue) -> Ordering {
    match (lhs, rhs) {
        (SqlValue::Text(l), SqlValue::Text(r)) => collation.compare_text(l, r),
        _ => compare(lhs, rhs),
    }
}

fn cmp_int_float(i: i64, f: f64) -> Ordering {
    if f.is_nan() {
        // NaN sorts below every number, mirroring f64::total_cmp for -NaN.
        return Ordering::Greater;
    }
    if f == f64::INFINITY {
        return Ordering::Less;
    }
    if f == f64::NEG_INFINITY {
        return Ordering::Greater;
    }
    // i64 -> f64 can round; compare the integer against the float's
    // integral and fractional parts separately to stay exact.
    let trunc = f.trunc();
    // i64::MAX as f64 rounds up to 2^63, which no i64 reaches.
    if trunc >= i64::MAX as f64 {
        return Ordering::Less;
    }
    if trunc < i64::MIN as f64 {
        return Ordering::Greater;
    }
    match i.cmp(&(trunc as i64)) {
        Ordering::Equal => 0.0f64.partial_cmp(&(f - trunc)).unwrap_or(Ordering::Equal),
        other => other,
    }
}

fn cmp_big_float(b: &BigInt, f: f64) -> Ordering {
    if f.is_nan() {
        return Ordering::Greater;
    }
    match b.to_f64() {
        Some(bf) => bf.partial_cmp(&f).unwrap_or(Ordering::Equal),
        None => {
            // Out of f64 range entirely: the sign decides.
            if b.sign() == num_bigint::Sign::Minus {
                Ordering::Less
            } else {
                Ordering::Greater
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::SqlValue;
    use num_bigint::BigInt;
    use std::cmp::Ordering;

    fn is_lt(lhs: SqlValue, rhs: SqlValue) {
        assert_eq!(compare(&lhs, &rhs), Ordering::Less, "{lhs} < {rhs}");
        assert_eq!(compare(&rhs, &lhs), Ordering::Greater, "{rhs} > {lhs}");
    }
    fn is_eq(lhs: SqlValue, rhs: SqlValue) {
        assert_eq!(compare(&lhs, &rhs), Ordering::Equal);
        assert_eq!(compare(&rhs, &lhs), Ordering::Equal);
    }

    #[test]
    fn test_null_ordering() {
        is_eq(SqlValue::Null, SqlValue::Null);
        is_lt(SqlValue::Null, SqlValue::Integer(i64::MIN));
    }

    #[test]
    fn test_numeric_ordering() {
        is_eq(SqlValue::Integer(10), SqlValue::Integer(10));
        is_eq(SqlValue::Integer(20), SqlValue::Float(20.0));
        is_eq(
            SqlValue::Integer(5),
            SqlValue::BigInt(Box::new(BigInt::from(5))),
        );
        is_lt(SqlValue::Integer(-1), SqlValue::Integer(1));
        is_lt(SqlValue::Float(1.5), SqlValue::Integer(2));
        is_lt(
            SqlValue::Integer(i64::MAX),
            SqlValue::BigInt(Box::new(BigInt::from(i64::MAX) + 1)),
        );
        is_lt(
            SqlValue::BigInt(Box::new(-(BigInt::from(u64::MAX) * 100i32))),
            SqlValue::Float(0.0),
        );
    }

    #[test]
    fn test_text_and_blob_ordering() {
        is_eq(SqlValue::text("foo"), SqlValue::text("foo"));
        is_lt(SqlValue::text("foo"), SqlValue::text("fp"));
        is_lt(SqlValue::Integer(99), SqlValue::text("1"));
        is_lt(SqlValue::text("zzz"), SqlValue::blob(vec![0x00]));
        is_lt(SqlValue::blob(vec![1, 2]), SqlValue::blob(vec![1, 2, 3]));
    }

    #[derive(Debug, Clone)]
    struct ArbValue(SqlValue);

    impl quickcheck::Arbitrary for ArbValue {
        fn arbitrary(g: &mut quickcheck::Gen) -> Self {
            let v = match u8::arbitrary(g) % 6 {
                0 => SqlValue::Null,
                1 => SqlValue::Integer(i64::arbitrary(g)),
                2 => SqlValue::BigInt(Box::new(
                    BigInt::from(i64::arbitrary(g)) * BigInt::from(i64::arbitrary(g)),
                )),
                3 => {
                    let f = f64::arbitrary(g);
                    SqlValue::Float(if f.is_nan() { 0.0 } else { f })
                }
                4 => SqlValue::text(String::arbitrary(g)),
                _ => SqlValue::blob(Vec::<u8>::arbitrary(g)),
            };
            ArbValue(v)
        }
    }

    #[quickcheck_macros::quickcheck]
    fn prop_total_order(a: ArbValue, b: ArbValue, c: ArbValue) -> bool {
        let (a, b, c) = (a.0, b.0, c.0);
        // Antisymmetry.
        if compare(&a, &b) != compare(&b, &a).reverse() {
            return false;
        }
        // Transitivity over the sorted arrangement.
        let mut sorted = vec![a, b, c];
        sorted.sort_by(compare);
        compare(&sorted[0], &sorted[1]) != Ordering::Greater
            && compare(&sorted[1], &sorted[2]) != Ordering::Greater
            && compare(&sorted[0], &sorted[2]) != Ordering::Greater
    }

    #[test]
    fn test_collated_compare() {
        use crate::compare_with;
        assert_eq!(
            compare_with(Collation::NoCase, &SqlValue::text("ABC"), &SqlValue::text("abc")),
            Ordering::Equal
        );
        assert_eq!(
            compare_with(Collation::Rtrim, &SqlValue::text("a  "), &SqlValue::text("a")),
            Ordering::Equal
        );
        assert_eq!(
            compare_with(Collation::Binary, &SqlValue::text("ABC"), &SqlValue::text("abc")),
            Ordering::Less
        );
    }
}
