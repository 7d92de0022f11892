//! Builder integration: parse real SQL, build plans against a catalog
//! backed by the memory module, and check the resulting shapes.

use std::sync::Arc;

use catalog::{Catalog, SchemaDefaults};
use plan::{
    parse, AggregateFunction, AggregateState, AttributeGenerator, BuildOutput, Builder,
    BuilderEnv, FunctionRegistry, ParamKey, RelNode, StatementPlan,
};
use values::{SqlValue, TypeAffinity};
use vtab::ModuleRegistry;

struct CountState(i64);

impl AggregateState for CountState {
    fn step(&mut self, _args: &[SqlValue]) -> Result<(), vtab::Error> {
        self.0 += 1;
        Ok(())
    }
    fn finish(self: Box<Self>) -> Result<SqlValue, vtab::Error> {
        Ok(SqlValue::Integer(self.0))
    }
}

struct Fixture {
    catalog: Catalog,
    defaults: SchemaDefaults,
    modules: ModuleRegistry,
    functions: FunctionRegistry,
    attrs: AttributeGenerator,
}

impl Fixture {
    fn new(ddl: &[&str]) -> Self {
        let defaults = SchemaDefaults::default();
        let mut catalog = Catalog::new();
        for sql in ddl {
            let parsed = parse::parse_batch(sql).unwrap();
            let parse::ParsedStatement::Sql { statement, module, .. } = &parsed[0] else {
                panic!("fixture DDL must be CREATE TABLE");
            };
            let lowered =
                catalog::ddl::table_from_create(statement, module.as_ref(), &defaults).unwrap();
            catalog.register(Arc::new(lowered.schema)).unwrap();
        }

        let modules = ModuleRegistry::new();
        modules.register("memory", Arc::new(memstore::MemoryModule::default()));

        let mut functions = FunctionRegistry::new();
        functions.register_aggregate(AggregateFunction {
            name: "count".to_string(),
            arg_count: None,
            returns: TypeAffinity::Integer,
            init: Arc::new(|| Box::new(CountState(0))),
        });

        Fixture {
            catalog,
            defaults,
            modules,
            functions,
            attrs: AttributeGenerator::default(),
        }
    }

    fn build(&self, sql: &str) -> Result<BuildOutput, plan::Error> {
        let parsed = parse::parse_batch(sql)?;
        let builder = Builder::new(BuilderEnv {
            catalog: &self.catalog,
            defaults: &self.defaults,
            modules: &self.modules,
            functions: &self.functions,
            attrs: &self.attrs,
        });
        builder.build(&parsed[0])
    }
}

fn fixture() -> Fixture {
    Fixture::new(&["CREATE TABLE t (a INT PRIMARY KEY, b TEXT) USING memory"])
}

#[test]
fn test_select_plan_shape() {
    let fx = fixture();
    let out = fx
        .build("SELECT a, b FROM t WHERE a > 1 ORDER BY a DESC")
        .unwrap();

    let StatementPlan::Query { root, column_names } = &out.plan else {
        panic!("expected a query plan");
    };
    assert_eq!(column_names, &["a", "b"]);

    // The module consumed both the range constraint and the ordering:
    // the plan is a bare Project over the planned scan.
    let RelNode::Project { input, .. } = &**root else {
        panic!("expected project at the root, got {root:?}");
    };
    let RelNode::TableScan { access, .. } = &**input else {
        panic!("expected a planned scan under the project, got {input:?}");
    };
    let access = access.as_ref().expect("scan must carry an access plan");
    assert!(access.order_by_consumed);
    assert_eq!(access.args.len(), 1);
}

fn outline(node: &RelNode) -> String {
    let mut parts = vec![node.op_name().to_string()];
    for child in node.children() {
        parts.push(outline(child));
    }
    parts.join(" > ")
}

#[test]
fn test_plan_outline_snapshots() {
    let fx = fixture();

    let out = fx
        .build("SELECT a, b FROM t WHERE a > 1 ORDER BY a DESC")
        .unwrap();
    let StatementPlan::Query { root, .. } = &out.plan else {
        panic!("expected a query plan");
    };
    // The module consumed both the range and the ordering.
    insta::assert_snapshot!(outline(root), @"project > scan");

    let out = fx.build("SELECT b, count(*) FROM t GROUP BY b").unwrap();
    let StatementPlan::Query { root, .. } = &out.plan else {
        panic!("expected a query plan");
    };
    insta::assert_snapshot!(outline(root), @"project > aggregate > scan");
}

#[test]
fn test_point_lookup_suppresses_filter() {
    let fx = fixture();
    let out = fx.build("SELECT b FROM t WHERE a = 42").unwrap();
    let StatementPlan::Query { root, .. } = &out.plan else {
        panic!("expected a query plan");
    };
    let RelNode::Project { input, .. } = &**root else {
        panic!("expected project");
    };
    let RelNode::TableScan { access, .. } = &**input else {
        panic!("omitted constraint should leave no Filter, got {input:?}");
    };
    assert!(access.as_ref().unwrap().unique_scan);
}

#[test]
fn test_mixed_aggregate_rejected() {
    let fx = fixture();
    let err = fx.build("SELECT a, count(*) FROM t").unwrap_err();
    assert!(
        err.to_string().contains("GROUP BY"),
        "unexpected error: {err}"
    );
}

#[test]
fn test_unknown_column_and_table() {
    let fx = fixture();
    assert!(matches!(
        fx.build("SELECT nope FROM t"),
        Err(plan::Error::NoSuchColumn(_))
    ));
    assert!(matches!(
        fx.build("SELECT 1 FROM missing"),
        Err(plan::Error::NoSuchTable(_))
    ));
}

#[test]
fn test_joins_are_unsupported() {
    let fx = Fixture::new(&[
        "CREATE TABLE t (a INT PRIMARY KEY) USING memory",
        "CREATE TABLE u (a INT PRIMARY KEY) USING memory",
    ]);
    assert!(matches!(
        fx.build("SELECT * FROM t, u"),
        Err(plan::Error::Unsupported(_))
    ));
    assert!(matches!(
        fx.build("SELECT * FROM t JOIN u ON t.a = u.a"),
        Err(plan::Error::Unsupported(_))
    ));
}

#[test]
fn test_parameters_collected_in_order() {
    let fx = fixture();
    let out = fx
        .build("SELECT b FROM t WHERE a = :low OR a = ? OR b = :low")
        .unwrap();
    assert_eq!(
        out.params,
        vec![
            ParamKey::Named("low".to_string()),
            ParamKey::Positional(1),
        ]
    );
}

#[test]
fn test_recursive_cte_shape() {
    let fx = fixture();
    let out = fx
        .build("WITH RECURSIVE c(n) AS (SELECT 1 UNION ALL SELECT n + 1 FROM c WHERE n < 5) SELECT n FROM c")
        .unwrap();
    let StatementPlan::Query { root, .. } = &out.plan else {
        panic!("expected a query plan");
    };
    let RelNode::Materialize { plan, body, .. } = &**root else {
        panic!("recursive CTE must materialize, got {root:?}");
    };
    assert!(matches!(&**plan, RelNode::RecursiveCte { union_all: true, .. }));

    // The body reads the result table.
    fn find_cte_scan(node: &RelNode) -> bool {
        matches!(node, RelNode::CteScan { .. })
            || node.children().iter().any(|child| find_cte_scan(child))
    }
    assert!(find_cte_scan(body));
}

#[test]
fn test_view_cte_inlines() {
    let fx = fixture();
    let out = fx
        .build("WITH v AS (SELECT a FROM t) SELECT a FROM v")
        .unwrap();
    let StatementPlan::Query { root, .. } = &out.plan else {
        panic!("expected a query plan");
    };
    // Single reference, no hint: inlined, so no Materialize node exists.
    fn has_materialize(node: &RelNode) -> bool {
        matches!(node, RelNode::Materialize { .. })
            || node.children().iter().any(|child| has_materialize(child))
    }
    assert!(!has_materialize(root));
}

#[test]
fn test_insert_plan() {
    let fx = fixture();
    let out = fx
        .build("INSERT INTO t (a, b) VALUES (1, 'x'), (2, 'y')")
        .unwrap();
    let StatementPlan::Dml {
        root, returning, ..
    } = &out.plan
    else {
        panic!("expected a DML plan");
    };
    assert!(!*returning);
    assert!(matches!(&**root, RelNode::Insert { .. }));
}

#[test]
fn test_update_with_returning() {
    let fx = fixture();
    let out = fx
        .build("UPDATE t SET b = 'z' WHERE a = 1 RETURNING a, b")
        .unwrap();
    let StatementPlan::Dml {
        root,
        returning,
        column_names,
    } = &out.plan
    else {
        panic!("expected a DML plan");
    };
    assert!(*returning);
    assert_eq!(column_names, &["a", "b"]);
    assert!(matches!(&**root, RelNode::Project { .. }));
}
