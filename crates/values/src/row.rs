use std::sync::Arc;

use crate::SqlValue;

/// A row is an immutable, cheaply-cloned sequence of values.
pub type Row = Arc<[SqlValue]>;

pub fn row(values: Vec<SqlValue>) -> Row {
    values.into()
}

/// Assemble a flat row: OLD values in positions `0..n`, NEW values in
/// `n..2n`. A missing half (INSERT has no OLD, DELETE no NEW) is Null-filled.
pub fn flat_row(old: Option<&Row>, new: Option<&Row>, width: usize) -> Row {
    let mut flat = Vec::with_capacity(width * 2);
    match old {
        Some(old) => flat.extend(old.iter().take(width).cloned()),
        None => flat.extend(std::iter::repeat(SqlValue::Null).take(width)),
    }
    while flat.len() < width {
        flat.push(SqlValue::Null);
    }
    match new {
        Some(new) => flat.extend(new.iter().take(width).cloned()),
        None => flat.extend(std::iter::repeat(SqlValue::Null).take(width)),
    }
    while flat.len() < width * 2 {
        flat.push(SqlValue::Null);
    }
    flat.into()
}

/// The OLD half of a flat row.
pub fn flat_old(flat: &Row, width: usize) -> &[SqlValue] {
    &flat[..width]
}

/// The NEW half of a flat row.
pub fn flat_new(flat: &Row, width: usize) -> &[SqlValue] {
    &flat[width..width * 2]
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_flat_row_layout() {
        let old = row(vec![SqlValue::Integer(1), SqlValue::text("a")]);
        let new = row(vec![SqlValue::Integer(2), SqlValue::text("b")]);

        let flat = flat_row(Some(&old), Some(&new), 2);
        assert_eq!(flat_old(&flat, 2), &old[..]);
        assert_eq!(flat_new(&flat, 2), &new[..]);

        let insert = flat_row(None, Some(&new), 2);
        assert_eq!(insert_nulls(&insert), vec![true, true, false, false]);

        let delete = flat_row(Some(&old), None, 2);
        assert_eq!(insert_nulls(&delete), vec![false, false, true, true]);
    }

    fn insert_nulls(flat: &Row) -> Vec<bool> {
        flat.iter().map(SqlValue::is_null).collect()
    }
}
