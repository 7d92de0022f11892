//! The introspection table functions: `query_plan`, `scheduler_program`
//! and `execution_trace`. Each re-enters the planner (and emitter) in dry
//! mode against the live catalog; none of them executes the statement.

use std::sync::{Arc, Weak};
use std::time::Instant;

use plan::{
    Builder, BuilderEnv, ParsedStatement, RelNode, ScalarExpr, StatementPlan, TableFunction,
};
use values::{row, Row, SqlValue, TypeAffinity};

use crate::db::DbCore;
use crate::{Emitter, Program};

type FnResult<T> = std::result::Result<T, vtab::Error>;

pub(crate) fn register(core: &Arc<DbCore>) {
    let mut functions = core.functions.write().expect("function registry poisoned");

    functions.register_table(TableFunction {
        name: "query_plan".to_string(),
        columns: vec![
            ("id".to_string(), TypeAffinity::Integer),
            ("parent_id".to_string(), TypeAffinity::Integer),
            ("subquery_level".to_string(), TypeAffinity::Integer),
            ("op".to_string(), TypeAffinity::Text),
            ("detail".to_string(), TypeAffinity::Text),
            ("object_name".to_string(), TypeAffinity::Text),
            ("alias".to_string(), TypeAffinity::Text),
            ("estimated_cost".to_string(), TypeAffinity::Real),
            ("estimated_rows".to_string(), TypeAffinity::Real),
        ],
        call: {
            let core = Arc::downgrade(core);
            Arc::new(move |args| {
                let rows = query_plan_rows(&core, argument_sql(args)?)?;
                Ok(Box::pin(futures::stream::iter(rows.into_iter().map(Ok))))
            })
        },
    });

    functions.register_table(TableFunction {
        name: "scheduler_program".to_string(),
        columns: vec![
            ("address".to_string(), TypeAffinity::Integer),
            ("instruction_id".to_string(), TypeAffinity::Integer),
            ("dependencies".to_string(), TypeAffinity::Text),
            ("description".to_string(), TypeAffinity::Text),
            ("is_subprogram".to_string(), TypeAffinity::Integer),
            ("parent_address".to_string(), TypeAffinity::Integer),
        ],
        call: {
            let core = Arc::downgrade(core);
            Arc::new(move |args| {
                let rows = scheduler_program_rows(&core, argument_sql(args)?)?;
                Ok(Box::pin(futures::stream::iter(rows.into_iter().map(Ok))))
            })
        },
    });

    functions.register_table(TableFunction {
        name: "execution_trace".to_string(),
        columns: vec![
            ("phase".to_string(), TypeAffinity::Text),
            ("duration_us".to_string(), TypeAffinity::Integer),
            ("estimated_bytes".to_string(), TypeAffinity::Integer),
        ],
        call: {
            let core = Arc::downgrade(core);
            Arc::new(move |args| {
                let rows = execution_trace_rows(&core, argument_sql(args)?)?;
                Ok(Box::pin(futures::stream::iter(rows.into_iter().map(Ok))))
            })
        },
    });
}

fn argument_sql(args: &[SqlValue]) -> FnResult<String> {
    args.first()
        .and_then(SqlValue::as_str)
        .map(str::to_string)
        .ok_or_else(|| vtab::Error::Misuse("expected a SQL text argument".into()))
}

fn upgrade(core: &Weak<DbCore>) -> FnResult<Arc<DbCore>> {
    core.upgrade()
        .ok_or_else(|| vtab::Error::Internal("database is gone".into()))
}

/// Parse and build |sql|, handing back its first statement's plan.
fn dry_plan(core: &Arc<DbCore>, sql: &str) -> FnResult<(Arc<StatementPlan>, usize)> {
    let misuse = |e: plan::Error| vtab::Error::Misuse(e.to_string());
    let parsed = plan::parse::parse_batch(sql).map_err(misuse)?;
    let statement = parsed
        .iter()
        .find(|statement| matches!(statement, ParsedStatement::Sql { .. }))
        .ok_or_else(|| vtab::Error::Misuse("no plannable statement in argument".into()))?;

    let catalog = core.catalog.read().expect("catalog poisoned");
    let functions = core.functions.read().expect("function registry poisoned");
    let defaults = core.options.schema_defaults();
    let builder = Builder::new(BuilderEnv {
        catalog: &catalog,
        defaults: &defaults,
        modules: &core.modules,
        functions: &functions,
        attrs: &core.attrs,
    });
    let output = builder.build(statement).map_err(misuse)?;
    Ok((Arc::new(output.plan), sql.len()))
}

fn query_plan_rows(core: &Weak<DbCore>, sql: String) -> FnResult<Vec<Row>> {
    let core = upgrade(core)?;
    let (plan, _) = dry_plan(&core, &sql)?;

    let mut rows = Vec::new();
    match &*plan {
        StatementPlan::Query { root, .. } | StatementPlan::Dml { root, .. } => {
            let mut next_id = 0i64;
            walk_plan(root, None, 0, &mut next_id, &mut rows);
        }
        other => {
            rows.push(row(vec![
                SqlValue::Integer(0),
                SqlValue::Null,
                SqlValue::Integer(0),
                SqlValue::text("ddl"),
                SqlValue::text(format!("{other:?}")),
                SqlValue::Null,
                SqlValue::Null,
                SqlValue::Null,
                SqlValue::Null,
            ]));
        }
    }
    Ok(rows)
}

fn walk_plan(
    node: &Arc<RelNode>,
    parent: Option<i64>,
    level: i64,
    next_id: &mut i64,
    rows: &mut Vec<Row>,
) {
    let id = *next_id;
    *next_id += 1;
    rows.push(row(vec![
        SqlValue::Integer(id),
        parent.map(SqlValue::Integer).unwrap_or(SqlValue::Null),
        SqlValue::Integer(level),
        SqlValue::text(node.op_name()),
        SqlValue::text(node.detail()),
        node.object_name()
            .map(SqlValue::text)
            .unwrap_or(SqlValue::Null),
        SqlValue::Null,
        SqlValue::Float(node.estimated_cost()),
        SqlValue::Float(node.estimated_rows()),
    ]));

    for child in node.children() {
        walk_plan(child, Some(id), level, next_id, rows);
    }
    // Subqueries hang off scalar expressions, one level down.
    for subplan in subquery_plans(node) {
        walk_plan(&subplan, Some(id), level + 1, next_id, rows);
    }
}

/// Subquery plans referenced by a node's scalar expressions.
fn subquery_plans(node: &RelNode) -> Vec<Arc<RelNode>> {
    let mut exprs: Vec<Arc<ScalarExpr>> = Vec::new();
    match node {
        RelNode::Filter { predicate, .. } => exprs.push(predicate.clone()),
        RelNode::Project { exprs: list, .. } => exprs.extend(list.iter().cloned()),
        RelNode::Aggregate {
            group_by,
            aggregates,
            ..
        } => {
            exprs.extend(group_by.iter().cloned());
            exprs.extend(aggregates.iter().cloned());
        }
        RelNode::Values { rows, .. } => {
            exprs.extend(rows.iter().flatten().cloned());
        }
        RelNode::Update { assignments, .. } => {
            exprs.extend(assignments.iter().map(|(_, expr)| expr.clone()));
        }
        _ => {}
    }

    let mut plans = Vec::new();
    for expr in exprs {
        expr.visit(&mut |node| match node {
            ScalarExpr::Exists { plan, .. }
            | ScalarExpr::ScalarSubquery { plan, .. }
            | ScalarExpr::InSubquery { plan, .. } => plans.push(plan.clone()),
            _ => {}
        });
    }
    plans
}

fn scheduler_program_rows(core: &Weak<DbCore>, sql: String) -> FnResult<Vec<Row>> {
    let core = upgrade(core)?;
    let (plan, _) = dry_plan(&core, &sql)?;
    let program = Emitter::emit_statement(&plan)
        .map_err(|e| vtab::Error::Internal(e.to_string()))?;

    let mut rows = Vec::new();
    push_program_rows(&program, None, &mut rows);
    Ok(rows)
}

fn push_program_rows(program: &Program, parent: Option<i64>, rows: &mut Vec<Row>) {
    for (address, instruction) in program.instructions.iter().enumerate() {
        let dependencies =
            serde_json::to_string(&instruction.params).unwrap_or_else(|_| "[]".to_string());
        rows.push(row(vec![
            SqlValue::Integer(address as i64),
            SqlValue::Integer(address as i64),
            SqlValue::text(dependencies),
            SqlValue::text(instruction.note.clone()),
            SqlValue::Integer(parent.is_some() as i64),
            parent.map(SqlValue::Integer).unwrap_or(SqlValue::Null),
        ]));
    }
    for (parent_address, subprogram) in &program.subprograms {
        push_program_rows(subprogram, Some(*parent_address as i64), rows);
    }
}

fn execution_trace_rows(core: &Weak<DbCore>, sql: String) -> FnResult<Vec<Row>> {
    let core = upgrade(core)?;

    let parse_started = Instant::now();
    let parsed = plan::parse::parse_batch(&sql)
        .map_err(|e| vtab::Error::Misuse(e.to_string()))?;
    let parse_elapsed = parse_started.elapsed();

    let statement = parsed
        .iter()
        .find(|statement| matches!(statement, ParsedStatement::Sql { .. }))
        .ok_or_else(|| vtab::Error::Misuse("no plannable statement in argument".into()))?;

    let plan_started = Instant::now();
    let plan = {
        let catalog = core.catalog.read().expect("catalog poisoned");
        let functions = core.functions.read().expect("function registry poisoned");
        let defaults = core.options.schema_defaults();
        let builder = Builder::new(BuilderEnv {
            catalog: &catalog,
            defaults: &defaults,
            modules: &core.modules,
            functions: &functions,
            attrs: &core.attrs,
        });
        Arc::new(
            builder
                .build(statement)
                .map_err(|e| vtab::Error::Misuse(e.to_string()))?
                .plan,
        )
    };
    let plan_elapsed = plan_started.elapsed();

    let emit_started = Instant::now();
    let program =
        Emitter::emit_statement(&plan).map_err(|e| vtab::Error::Internal(e.to_string()))?;
    let emit_elapsed = emit_started.elapsed();

    // A dry scheduling pass: verify the dependency order without running
    // anything.
    let schedule_started = Instant::now();
    for (address, instruction) in program.instructions.iter().enumerate() {
        for &param in &instruction.params {
            debug_assert!(param < address.max(1));
            let _ = param;
        }
    }
    let schedule_elapsed = schedule_started.elapsed();

    let instruction_count = program.instructions.len()
        + program
            .subprograms
            .iter()
            .map(|(_, p)| p.instructions.len())
            .sum::<usize>();

    let phase = |name: &str, elapsed: std::time::Duration, bytes: usize| {
        row(vec![
            SqlValue::text(name),
            SqlValue::Integer(elapsed.as_micros() as i64),
            SqlValue::Integer(bytes as i64),
        ])
    };
    Ok(vec![
        phase("parse", parse_elapsed, sql.len()),
        phase("plan", plan_elapsed, plan_size(&plan) * 256),
        phase("emit", emit_elapsed, instruction_count * 512),
        phase("schedule", schedule_elapsed, instruction_count * 64),
    ])
}

fn plan_size(plan: &StatementPlan) -> usize {
    fn count(node: &Arc<RelNode>) -> usize {
        1 + node.children().iter().map(|child| count(child)).sum::<usize>()
    }
    match plan {
        StatementPlan::Query { root, .. } | StatementPlan::Dml { root, .. } => count(root),
        _ => 1,
    }
}
