//! Correlation analysis and the predicate pushdown gate.

use std::collections::BTreeSet;

use crate::{AttributeId, ScalarExpr};

/// Every attribute a scalar expression references.
pub fn collect_attrs(expr: &ScalarExpr) -> BTreeSet<AttributeId> {
    let mut attrs = BTreeSet::new();
    expr.visit(&mut |node| {
        match node {
            ScalarExpr::Column(attribute) => {
                attrs.insert(attribute.id);
            }
            // Subqueries keep their own attribute universe; only their
            // correlation sets leak outward.
            ScalarExpr::Exists { correlated, .. }
            | ScalarExpr::ScalarSubquery { correlated, .. }
            | ScalarExpr::InSubquery { correlated, .. } => {
                attrs.extend(correlated.iter().copied());
            }
            _ => {}
        }
    });
    attrs
}

/// A predicate may be pushed beneath an operator iff every column it
/// references resolves within |allowed|. OR-trees, subqueries and other
/// opaque shapes are conservatively rejected.
pub fn is_pushable(predicate: &ScalarExpr, allowed: &BTreeSet<AttributeId>) -> bool {
    let mut rejected = false;
    predicate.visit(&mut |node| match node {
        ScalarExpr::Binary { op, .. } if matches!(op, crate::BinOp::Or) => rejected = true,
        ScalarExpr::Exists { .. }
        | ScalarExpr::ScalarSubquery { .. }
        | ScalarExpr::InSubquery { .. }
        | ScalarExpr::Aggregate(_) => rejected = true,
        _ => {}
    });
    if rejected {
        return false;
    }
    collect_attrs(predicate).is_subset(allowed)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{Attribute, BinOp, ScalarTy};
    use std::sync::Arc;
    use values::SqlValue;

    fn column(id: u32) -> Arc<ScalarExpr> {
        Arc::new(ScalarExpr::Column(Attribute {
            id: AttributeId(id),
            name: format!("c{id}"),
            ty: ScalarTy::default(),
        }))
    }

    fn literal(v: i64) -> Arc<ScalarExpr> {
        Arc::new(ScalarExpr::Literal(SqlValue::Integer(v)))
    }

    fn binary(op: BinOp, left: Arc<ScalarExpr>, right: Arc<ScalarExpr>) -> Arc<ScalarExpr> {
        Arc::new(ScalarExpr::Binary { op, left, right })
    }

    #[test]
    fn test_pushable_when_attrs_are_allowed() {
        let predicate = binary(BinOp::Gt, column(1), literal(5));
        let allowed: BTreeSet<_> = [AttributeId(1), AttributeId(2)].into();
        assert!(is_pushable(&predicate, &allowed));

        let foreign = binary(BinOp::Gt, column(9), literal(5));
        assert!(!is_pushable(&foreign, &allowed));
    }

    #[test]
    fn test_or_trees_are_rejected() {
        let predicate = binary(
            BinOp::Or,
            binary(BinOp::Eq, column(1), literal(1)),
            binary(BinOp::Eq, column(1), literal(2)),
        );
        let allowed: BTreeSet<_> = [AttributeId(1)].into();
        assert!(!is_pushable(&predicate, &allowed));
    }

    #[test]
    fn test_collect_attrs_sees_correlation() {
        let expr = binary(BinOp::And, column(1), column(3));
        assert_eq!(
            collect_attrs(&expr),
            [AttributeId(1), AttributeId(3)].into()
        );
    }
}
