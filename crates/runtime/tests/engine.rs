//! End-to-end engine scenarios: DDL through the memory module, scans and
//! ordering, recursive CTEs, savepoints, constraints, isolation, and the
//! statement-lifecycle API.

use futures::TryStreamExt;
use pretty_assertions::assert_eq;
use runtime::{Database, Error};
use values::SqlValue;
use vtab::ErrorCode;

async fn rows(db: &Database, sql: &str) -> Vec<Vec<SqlValue>> {
    db.query(sql)
        .await
        .unwrap()
        .iter()
        .map(|row| row.to_vec())
        .collect()
}

fn int(v: i64) -> SqlValue {
    SqlValue::Integer(v)
}

fn text(v: &str) -> SqlValue {
    SqlValue::text(v)
}

#[tokio::test]
async fn test_scan_with_range_and_order() {
    let db = Database::new();
    db.exec(
        "CREATE TABLE t (a INT PRIMARY KEY, b TEXT) USING memory;
         INSERT INTO t VALUES (1, 'x'), (2, 'y'), (3, 'z');",
    )
    .await
    .unwrap();

    assert_eq!(
        rows(&db, "SELECT a, b FROM t WHERE a > 1 ORDER BY a DESC").await,
        vec![vec![int(3), text("z")], vec![int(2), text("y")]]
    );
    assert_eq!(
        rows(&db, "SELECT b FROM t WHERE a = 2").await,
        vec![vec![text("y")]]
    );
    assert_eq!(rows(&db, "SELECT a FROM t WHERE a = 9").await, Vec::<Vec<SqlValue>>::new());
}

#[tokio::test]
async fn test_recursive_cte_union_all() {
    let db = Database::new();
    let got = rows(
        &db,
        "WITH RECURSIVE c(n) AS (SELECT 1 UNION ALL SELECT n + 1 FROM c WHERE n < 5) \
         SELECT n FROM c",
    )
    .await;
    assert_eq!(
        got,
        vec![vec![int(1)], vec![int(2)], vec![int(3)], vec![int(4)], vec![int(5)]]
    );
}

#[tokio::test]
async fn test_recursive_cte_union_distinct_terminates() {
    let db = Database::new();
    let got = rows(
        &db,
        "WITH RECURSIVE c(n) AS (SELECT 1 UNION SELECT n FROM c WHERE n < 3) \
         SELECT count(*) FROM c",
    )
    .await;
    assert_eq!(got, vec![vec![int(1)]]);
}

#[tokio::test]
async fn test_savepoint_rollback_to() {
    let db = Database::new();
    db.exec("CREATE TABLE t (a INT PRIMARY KEY, b TEXT) USING memory")
        .await
        .unwrap();
    db.exec(
        "BEGIN;
         INSERT INTO t VALUES (10, 'a');
         SAVEPOINT s1;
         INSERT INTO t VALUES (11, 'b');
         INSERT INTO t VALUES (12, 'c');
         ROLLBACK TO s1;
         COMMIT;",
    )
    .await
    .unwrap();

    assert_eq!(rows(&db, "SELECT a FROM t ORDER BY a").await, vec![vec![int(10)]]);
}

#[tokio::test]
async fn test_check_violation_leaves_table_unchanged() {
    let db = Database::new();
    db.exec("CREATE TABLE t (a INT CHECK (a > 0)) USING memory")
        .await
        .unwrap();

    let error = db.exec("INSERT INTO t VALUES (-1)").await.unwrap_err();
    assert_eq!(error.code(), ErrorCode::Constraint);
    assert!(error.to_string().contains("CHECK"), "{error}");

    assert_eq!(rows(&db, "SELECT count(*) FROM t").await, vec![vec![int(0)]]);
}

#[tokio::test]
async fn test_multi_row_insert_is_atomic() {
    let db = Database::new();
    db.exec("CREATE TABLE t (a INT PRIMARY KEY, b INT CHECK (b > 0)) USING memory")
        .await
        .unwrap();

    // The third row violates its CHECK; the first two must not survive.
    let error = db
        .exec("INSERT INTO t VALUES (1, 5), (2, 6), (3, -1)")
        .await
        .unwrap_err();
    assert_eq!(error.code(), ErrorCode::Constraint);
    assert_eq!(rows(&db, "SELECT count(*) FROM t").await, vec![vec![int(0)]]);
}

#[tokio::test]
async fn test_reader_isolation_mid_scan() {
    let writer = Database::new();
    writer
        .exec(
            "CREATE TABLE t (a INT PRIMARY KEY) USING memory;
             INSERT INTO t VALUES (1), (2);",
        )
        .await
        .unwrap();

    let reader = writer.connect();
    let mut statement = reader.prepare("SELECT a FROM t ORDER BY a").unwrap();
    let mut stream = statement.iterate_rows().await.unwrap();
    let first = stream.try_next().await.unwrap().unwrap();
    assert_eq!(first.to_vec(), vec![int(1)]);

    // A commit lands mid-scan; the open iterator keeps its snapshot.
    writer.exec("INSERT INTO t VALUES (3)").await.unwrap();

    let mut seen = vec![first.to_vec()];
    while let Some(row) = stream.try_next().await.unwrap() {
        seen.push(row.to_vec());
    }
    assert_eq!(seen, vec![vec![int(1)], vec![int(2)]]);
    drop(stream);

    // A fresh statement sees the new committed state.
    assert_eq!(
        rows(&reader, "SELECT count(*) FROM t").await,
        vec![vec![int(3)]]
    );
}

#[tokio::test]
async fn test_conflict_policies() {
    let db = Database::new();
    db.exec(
        "CREATE TABLE t (a INT PRIMARY KEY, b TEXT) USING memory;
         INSERT INTO t VALUES (1, 'x');",
    )
    .await
    .unwrap();

    let error = db.exec("INSERT INTO t VALUES (1, 'y')").await.unwrap_err();
    assert_eq!(error.code(), ErrorCode::Constraint);

    db.exec("INSERT OR IGNORE INTO t VALUES (1, 'y')").await.unwrap();
    assert_eq!(rows(&db, "SELECT b FROM t").await, vec![vec![text("x")]]);

    db.exec("INSERT OR REPLACE INTO t VALUES (1, 'z')").await.unwrap();
    assert_eq!(rows(&db, "SELECT b FROM t").await, vec![vec![text("z")]]);
}

#[tokio::test]
async fn test_update_delete_and_returning() {
    let db = Database::new();
    db.exec(
        "CREATE TABLE t (a INT PRIMARY KEY, b TEXT) USING memory;
         INSERT INTO t VALUES (1, 'x'), (2, 'y'), (3, 'z');",
    )
    .await
    .unwrap();

    let mut statement = db
        .prepare("UPDATE t SET b = 'q' WHERE a >= 2 RETURNING a, b")
        .unwrap();
    let returned: Vec<Vec<SqlValue>> = statement
        .iterate_rows()
        .await
        .unwrap()
        .try_collect::<Vec<_>>()
        .await
        .unwrap()
        .iter()
        .map(|row| row.to_vec())
        .collect();
    assert_eq!(
        returned,
        vec![vec![int(2), text("q")], vec![int(3), text("q")]]
    );

    db.exec("DELETE FROM t WHERE a = 1").await.unwrap();
    assert_eq!(
        rows(&db, "SELECT a, b FROM t ORDER BY a").await,
        vec![vec![int(2), text("q")], vec![int(3), text("q")]]
    );
}

#[tokio::test]
async fn test_aggregates_and_group_by() {
    let db = Database::new();
    db.exec(
        "CREATE TABLE t (a INT PRIMARY KEY, b TEXT) USING memory;
         INSERT INTO t VALUES (1, 'red'), (2, 'blue'), (3, 'red'), (4, 'red');",
    )
    .await
    .unwrap();

    assert_eq!(
        rows(&db, "SELECT count(*), sum(a), min(b) FROM t").await,
        vec![vec![int(4), int(10), text("blue")]]
    );
    // Group-arrival order is preserved.
    assert_eq!(
        rows(&db, "SELECT b, count(*) FROM t GROUP BY b").await,
        vec![vec![text("red"), int(3)], vec![text("blue"), int(1)]]
    );
    assert_eq!(
        rows(&db, "SELECT b, count(*) FROM t GROUP BY b HAVING count(*) > 1").await,
        vec![vec![text("red"), int(3)]]
    );
}

#[tokio::test]
async fn test_limit_offset_and_distinct() {
    let db = Database::new();
    db.exec(
        "CREATE TABLE t (a INT PRIMARY KEY, b INT) USING memory;
         INSERT INTO t VALUES (1, 7), (2, 7), (3, 8), (4, 9);",
    )
    .await
    .unwrap();

    assert_eq!(
        rows(&db, "SELECT a FROM t ORDER BY a LIMIT 2 OFFSET 1").await,
        vec![vec![int(2)], vec![int(3)]]
    );
    assert_eq!(
        rows(&db, "SELECT DISTINCT b FROM t").await,
        vec![vec![int(7)], vec![int(8)], vec![int(9)]]
    );
}

#[tokio::test]
async fn test_secondary_index_scan() {
    let db = Database::new();
    db.exec(
        "CREATE TABLE t (a INT PRIMARY KEY, b TEXT) USING memory;
         INSERT INTO t VALUES (1, 'red'), (2, 'blue'), (3, 'red');
         CREATE INDEX t_b ON t (b);",
    )
    .await
    .unwrap();

    // The index was backfilled from existing rows and serves equality.
    assert_eq!(
        rows(&db, "SELECT a FROM t WHERE b = 'red'").await,
        vec![vec![int(1)], vec![int(3)]]
    );

    db.exec("INSERT INTO t VALUES (4, 'red')").await.unwrap();
    assert_eq!(
        rows(&db, "SELECT count(*) FROM t WHERE b = 'red'").await,
        vec![vec![int(3)]]
    );
}

#[tokio::test]
async fn test_correlated_subqueries() {
    let db = Database::new();
    db.exec(
        "CREATE TABLE t (a INT PRIMARY KEY) USING memory;
         CREATE TABLE u (a INT PRIMARY KEY) USING memory;
         INSERT INTO t VALUES (1), (2), (3);
         INSERT INTO u VALUES (2), (3), (4);",
    )
    .await
    .unwrap();

    assert_eq!(
        rows(&db, "SELECT a FROM t WHERE EXISTS (SELECT 1 FROM u WHERE u.a = t.a) ORDER BY a").await,
        vec![vec![int(2)], vec![int(3)]]
    );
    assert_eq!(
        rows(&db, "SELECT a FROM t WHERE a IN (SELECT a FROM u) ORDER BY a").await,
        vec![vec![int(2)], vec![int(3)]]
    );
    assert_eq!(
        rows(&db, "SELECT (SELECT count(*) FROM u WHERE u.a > t.a) FROM t ORDER BY a").await,
        vec![vec![int(3)], vec![int(2)], vec![int(1)]]
    );
}

#[tokio::test]
async fn test_materialized_and_view_ctes() {
    let db = Database::new();
    db.exec(
        "CREATE TABLE t (a INT PRIMARY KEY) USING memory;
         INSERT INTO t VALUES (1), (2), (3);",
    )
    .await
    .unwrap();

    // Referenced twice: materialized once, read twice.
    assert_eq!(
        rows(
            &db,
            "WITH big AS (SELECT a FROM t WHERE a > 1) \
             SELECT (SELECT count(*) FROM big), (SELECT sum(a) FROM big)"
        )
        .await,
        vec![vec![int(2), int(5)]]
    );

    db.exec("CREATE VIEW v AS SELECT a FROM t WHERE a < 3")
        .await
        .unwrap();
    assert_eq!(
        rows(&db, "SELECT a FROM v ORDER BY a").await,
        vec![vec![int(1)], vec![int(2)]]
    );
}

#[tokio::test]
async fn test_check_mask_gates_row_operations() {
    let db = Database::new();
    // The mask marker narrows this CHECK to DELETE only.
    db.exec(
        "CREATE TABLE t (a INT PRIMARY KEY, \
         CONSTRAINT \"undeletable@delete\" CHECK (a < 100)) USING memory",
    )
    .await
    .unwrap();

    // An out-of-range INSERT passes: the constraint doesn't fire on insert.
    db.exec("INSERT INTO t VALUES (150)").await.unwrap();
    db.exec("INSERT INTO t VALUES (5)").await.unwrap();

    // Deleting the in-range row is fine; the out-of-range one is refused,
    // with the OLD values feeding the predicate.
    db.exec("DELETE FROM t WHERE a = 5").await.unwrap();
    let error = db.exec("DELETE FROM t WHERE a = 150").await.unwrap_err();
    assert_eq!(error.code(), ErrorCode::Constraint);
    assert!(error.to_string().contains("undeletable"), "{error}");
    assert_eq!(rows(&db, "SELECT a FROM t").await, vec![vec![int(150)]]);
}

#[tokio::test]
async fn test_deferred_check_runs_at_commit() {
    let db = Database::new();
    db.exec(
        "CREATE TABLE t (a INT PRIMARY KEY, \
         CONSTRAINT \"positive@deferred\" CHECK (a > 0)) USING memory",
    )
    .await
    .unwrap();

    db.exec("BEGIN; INSERT INTO t VALUES (-5);").await.unwrap();
    let error = db.exec("COMMIT").await.unwrap_err();
    assert_eq!(error.code(), ErrorCode::Constraint);
    assert!(error.to_string().contains("positive"), "{error}");

    db.exec("ROLLBACK").await.unwrap();
    assert_eq!(rows(&db, "SELECT count(*) FROM t").await, vec![vec![int(0)]]);

    // A passing deferred check commits cleanly.
    db.exec("BEGIN; INSERT INTO t VALUES (5); COMMIT;").await.unwrap();
    assert_eq!(rows(&db, "SELECT a FROM t").await, vec![vec![int(5)]]);
}

#[tokio::test]
async fn test_statement_lifecycle_api() {
    let db = Database::new();
    db.exec("CREATE TABLE t (a INT PRIMARY KEY, b TEXT) USING memory")
        .await
        .unwrap();

    // Parameter binding, both named and positional.
    let mut statement = db
        .prepare("INSERT INTO t VALUES (:id, ?)")
        .unwrap();
    assert_eq!(statement.parameter_count().unwrap(), 2);
    assert_eq!(
        statement.parameter_name(0).unwrap().as_deref(),
        Some(":id")
    );
    statement.bind("id", SqlValue::Integer(1)).unwrap();
    statement.bind_at(1, SqlValue::text("one")).unwrap();
    statement.run().await.unwrap();

    let mut query = db.prepare("SELECT a, b FROM t").unwrap();
    assert_eq!(query.column_names().unwrap(), vec!["a", "b"]);
    let first = query.get().await.unwrap().unwrap();
    assert_eq!(first["a"], int(1));
    assert_eq!(first["b"], text("one"));

    // The busy guard rejects re-entrant iteration.
    let mut held = db.prepare("SELECT a FROM t").unwrap();
    let stream = held.iterate_rows().await.unwrap();
    let error = held.run().await.unwrap_err();
    assert_eq!(error.code(), ErrorCode::Misuse);
    drop(stream);
    held.run().await.unwrap();

    // Finalize closes the statement for good.
    held.finalize();
    let error = held.run().await.unwrap_err();
    assert_eq!(error.code(), ErrorCode::Misuse);

    // Batches advance with next_statement.
    let mut batch = db
        .prepare("INSERT INTO t VALUES (2, 'two'); SELECT count(*) FROM t;")
        .unwrap();
    batch.run().await.unwrap();
    assert!(batch.next_statement().unwrap());
    let count = batch.get().await.unwrap().unwrap();
    assert_eq!(count["count(*)"], int(2));
    assert!(!batch.next_statement().unwrap());
}

#[tokio::test]
async fn test_nested_begin_is_rejected() {
    let db = Database::new();
    db.exec("BEGIN").await.unwrap();
    let error = db.exec("BEGIN").await.unwrap_err();
    assert_eq!(error.code(), ErrorCode::Misuse);
    db.exec("ROLLBACK").await.unwrap();
}

#[tokio::test]
async fn test_drop_table() {
    let db = Database::new();
    db.exec("CREATE TABLE t (a INT PRIMARY KEY) USING memory")
        .await
        .unwrap();
    db.exec("DROP TABLE t").await.unwrap();

    let error = db.query("SELECT a FROM t").await.unwrap_err();
    assert_eq!(error.code(), ErrorCode::NotFound);

    // And the name is reusable.
    db.exec("CREATE TABLE t (a INT PRIMARY KEY) USING memory")
        .await
        .unwrap();
}

#[tokio::test]
async fn test_explain_table_functions() {
    let db = Database::new();
    db.exec(
        "CREATE TABLE t (a INT PRIMARY KEY, b TEXT) USING memory;
         INSERT INTO t VALUES (1, 'x');",
    )
    .await
    .unwrap();

    let plan = rows(&db, "SELECT op FROM query_plan('SELECT a FROM t WHERE a = 1')").await;
    let ops: Vec<String> = plan
        .iter()
        .map(|row| row[0].as_str().unwrap_or_default().to_string())
        .collect();
    assert!(ops.contains(&"project".to_string()), "{ops:?}");
    assert!(ops.contains(&"scan".to_string()), "{ops:?}");

    let program = rows(
        &db,
        "SELECT description FROM scheduler_program('SELECT a FROM t WHERE a = 1')",
    )
    .await;
    let descriptions: Vec<String> = program
        .iter()
        .map(|row| row[0].as_str().unwrap_or_default().to_string())
        .collect();
    insta::assert_snapshot!(descriptions.join(" | "), @"scan main.t | project 1 columns");

    let trace = rows(&db, "SELECT phase FROM execution_trace('SELECT a FROM t')").await;
    let phases: Vec<String> = trace
        .iter()
        .map(|row| row[0].as_str().unwrap_or_default().to_string())
        .collect();
    assert_eq!(phases, vec!["parse", "plan", "emit", "schedule"]);
}

#[tokio::test]
async fn test_parse_errors_surface_at_prepare() {
    let db = Database::new();
    let error = db.prepare("SELEKT 1").unwrap_err();
    assert!(matches!(error, Error::Parse(_)));
}

#[tokio::test]
async fn test_scalar_functions_and_expressions() {
    let db = Database::new();
    assert_eq!(
        rows(&db, "SELECT upper('abc'), lower('DEF'), length('four'), abs(-2)").await,
        vec![vec![text("ABC"), text("def"), int(4), int(2)]]
    );
    assert_eq!(
        rows(&db, "SELECT coalesce(NULL, NULL, 3), nullif(1, 1), typeof('x')").await,
        vec![vec![int(3), SqlValue::Null, text("text")]]
    );
    assert_eq!(
        rows(&db, "SELECT 1 + 2 * 3, 'a' || 'b', CASE WHEN 1 > 2 THEN 'no' ELSE 'yes' END").await,
        vec![vec![int(7), text("ab"), text("yes")]]
    );
    assert_eq!(
        rows(&db, "SELECT 1 WHERE 'abc' LIKE 'a%'").await,
        vec![vec![int(1)]]
    );
}
