use futures::stream::BoxStream;
use values::Row;

use crate::{Cursor, Error};

/// Adapt an armed cursor (filter already applied) into a row stream.
/// Dropping the stream drops the cursor, which releases whatever snapshot
/// or iterator state the module holds; that is the cancellation path.
pub fn cursor_rows(mut cursor: Box<dyn Cursor>) -> BoxStream<'static, Result<Row, Error>> {
    Box::pin(async_stream::try_stream! {
        while !cursor.eof() {
            let row = cursor.row()?;
            yield row;
            cursor.next().await?;
        }
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use futures::TryStreamExt;
    use values::{row, SqlValue};

    struct FixedCursor {
        rows: Vec<Row>,
        at: usize,
    }

    #[async_trait::async_trait]
    impl Cursor for FixedCursor {
        async fn filter(
            &mut self,
            _index_number: i32,
            _index_string: Option<&str>,
            _args: &[SqlValue],
        ) -> crate::Result<()> {
            self.at = 0;
            Ok(())
        }

        async fn next(&mut self) -> crate::Result<()> {
            self.at += 1;
            Ok(())
        }

        fn eof(&self) -> bool {
            self.at >= self.rows.len()
        }

        fn row(&self) -> crate::Result<Row> {
            self.rows
                .get(self.at)
                .cloned()
                .ok_or_else(|| Error::Misuse("row at eof".into()))
        }
    }

    #[tokio::test]
    async fn test_cursor_rows_drains_and_stops() {
        let cursor = Box::new(FixedCursor {
            rows: vec![
                row(vec![SqlValue::Integer(1)]),
                row(vec![SqlValue::Integer(2)]),
            ],
            at: 0,
        });
        let collected: Vec<Row> = cursor_rows(cursor).try_collect().await.unwrap();
        assert_eq!(collected.len(), 2);
        assert_eq!(collected[1][0], SqlValue::Integer(2));
    }
}
