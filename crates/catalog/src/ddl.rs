//! Lowering of parsed DDL statements into schema objects, and the reverse
//! rendering of schema objects back into canonical DDL text.
//!
//! The `USING module(args…)` table clause is a dialect extension the
//! upstream grammar doesn't know; the statement layer extracts it before
//! parsing and hands it in as a [`ModuleClause`].

use std::fmt::Write;

use itertools::Itertools;
use sqlparser::ast::{
    ColumnOption, Expr, ObjectName, OrderByExpr, Statement, TableConstraint,
};
use values::{Collation, TypeAffinity};

use crate::{
    CheckConstraint, ColumnSchema, Error, IndexPart, IndexSchema, PrimaryKeyPart, Result, RowOps,
    SchemaDefaults, TableSchema,
};

/// The extracted `USING module(args…)` clause of a CREATE TABLE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleClause {
    pub name: String,
    pub args: Vec<String>,
}

/// A lowered CREATE TABLE, plus the bits of the statement the executor
/// cares about.
#[derive(Debug)]
pub struct LoweredTable {
    pub schema: TableSchema,
    pub if_not_exists: bool,
}

/// Split an ObjectName into (optional schema qualifier, object name).
pub fn object_name_parts(name: &ObjectName) -> Result<(Option<String>, String)> {
    match name.0.as_slice() {
        [table] => Ok((None, table.value.clone())),
        [schema, table] => Ok((Some(schema.value.clone()), table.value.clone())),
        _ => Err(Error::Unsupported(format!(
            "object name {name} has too many qualifiers"
        ))),
    }
}

/// Lower a CREATE TABLE statement into a TableSchema.
pub fn table_from_create(
    stmt: &Statement,
    module: Option<&ModuleClause>,
    defaults: &SchemaDefaults,
) -> Result<LoweredTable> {
    let Statement::CreateTable {
        name,
        columns,
        constraints,
        temporary,
        if_not_exists,
        ..
    } = stmt
    else {
        return Err(Error::Unsupported(format!(
            "expected CREATE TABLE, got {stmt}"
        )));
    };

    let (schema_name, table_name) = object_name_parts(name)?;
    let schema_name = schema_name.unwrap_or_else(|| defaults.schema_name.clone());

    let mut out_columns = Vec::with_capacity(columns.len());
    let mut checks = Vec::new();
    let mut pk_columns: Vec<usize> = Vec::new();

    for (index, column) in columns.iter().enumerate() {
        let mut schema_column = ColumnSchema {
            name: column.name.value.clone(),
            affinity: TypeAffinity::from_type_name(&column.data_type.to_string()),
            declared_type: Some(column.data_type.to_string()),
            not_null: false,
            default: None,
            collation: match &column.collation {
                Some(name) => Collation::parse(&name.to_string())?,
                None => Collation::Binary,
            },
            generated: false,
            pk_ordinal: None,
        };

        for def in &column.options {
            match &def.option {
                ColumnOption::NotNull => schema_column.not_null = true,
                ColumnOption::Null => schema_column.not_null = false,
                ColumnOption::Default(expr) => schema_column.default = Some(expr.clone()),
                ColumnOption::Unique { is_primary, .. } if *is_primary => {
                    pk_columns.push(index);
                }
                ColumnOption::Unique { .. } => {}
                ColumnOption::Check(expr) => {
                    let raw = def
                        .name
                        .as_ref()
                        .map(|n| n.value.clone())
                        .unwrap_or_else(|| format!("{}_check_{}", table_name, checks.len() + 1));
                    checks.push(check_constraint(raw, expr.clone()));
                }
                ColumnOption::Generated { .. } => schema_column.generated = true,
                other => {
                    return Err(Error::Unsupported(format!(
                        "column option {other} on {}",
                        column.name
                    )))
                }
            }
        }
        out_columns.push(schema_column);
    }

    for constraint in constraints {
        match constraint {
            TableConstraint::Unique {
                name: constraint_name,
                columns: key_columns,
                is_primary,
                ..
            } => {
                if !is_primary {
                    // Plain UNIQUE becomes a secondary index at lowering time.
                    continue;
                }
                for ident in key_columns {
                    let position = out_columns
                        .iter()
                        .position(|c| c.name.eq_ignore_ascii_case(&ident.value))
                        .ok_or_else(|| Error::NoSuchColumn {
                            table: table_name.clone(),
                            column: ident.value.clone(),
                        })?;
                    pk_columns.push(position);
                }
                let _ = constraint_name;
            }
            TableConstraint::Check {
                name: constraint_name,
                expr,
            } => {
                let raw = constraint_name
                    .as_ref()
                    .map(|n| n.value.clone())
                    .unwrap_or_else(|| format!("{}_check_{}", table_name, checks.len() + 1));
                checks.push(check_constraint(raw, (**expr).clone()));
            }
            other => {
                return Err(Error::Unsupported(format!(
                    "table constraint {other} on {table_name}"
                )))
            }
        }
    }

    // Without a declared key, the whole row is the key.
    if pk_columns.is_empty() {
        pk_columns = (0..out_columns.len()).collect();
    }

    let primary_key = pk_columns
        .iter()
        .map(|&column| PrimaryKeyPart {
            column,
            descending: false,
            collation: out_columns[column].collation,
        })
        .collect::<Vec<_>>();
    for (ordinal, part) in primary_key.iter().enumerate() {
        out_columns[part.column].pk_ordinal = Some(ordinal);
        // Key columns are implicitly NOT NULL.
        out_columns[part.column].not_null = true;
    }

    let (module_name, module_args) = match module {
        Some(clause) => (clause.name.clone(), clause.args.clone()),
        None => (defaults.module_name.clone(), defaults.module_args.clone()),
    };

    Ok(LoweredTable {
        schema: TableSchema {
            schema_name,
            name: table_name,
            columns: out_columns,
            primary_key,
            checks,
            indexes: Vec::new(),
            module_name,
            module_args,
            is_view: false,
            view_query: None,
            is_temporary: *temporary,
            read_only: false,
        },
        if_not_exists: *if_not_exists,
    })
}

/// Lower a CREATE VIEW statement.
pub fn view_from_create(stmt: &Statement, defaults: &SchemaDefaults) -> Result<TableSchema> {
    let Statement::CreateView {
        name,
        columns,
        query,
        ..
    } = stmt
    else {
        return Err(Error::Unsupported(format!(
            "expected CREATE VIEW, got {stmt}"
        )));
    };
    let (schema_name, view_name) = object_name_parts(name)?;

    Ok(TableSchema {
        schema_name: schema_name.unwrap_or_else(|| defaults.schema_name.clone()),
        name: view_name,
        columns: columns
            .iter()
            .map(|ident| ColumnSchema {
                name: ident.name.value.clone(),
                affinity: TypeAffinity::Blob,
                declared_type: None,
                not_null: false,
                default: None,
                collation: Collation::Binary,
                generated: false,
                pk_ordinal: None,
            })
            .collect(),
        primary_key: Vec::new(),
        checks: Vec::new(),
        indexes: Vec::new(),
        module_name: String::new(),
        module_args: Vec::new(),
        is_view: true,
        view_query: Some((**query).clone()),
        is_temporary: false,
        read_only: true,
    })
}

/// The target of a CREATE INDEX: (schema qualifier, table name, index name).
pub fn create_index_target(stmt: &Statement) -> Result<(Option<String>, String, String)> {
    let Statement::CreateIndex {
        name, table_name, ..
    } = stmt
    else {
        return Err(Error::Unsupported(format!(
            "expected CREATE INDEX, got {stmt}"
        )));
    };
    let index_name = match name {
        Some(name) => object_name_parts(name)?.1,
        None => return Err(Error::Unsupported("unnamed CREATE INDEX".to_string())),
    };
    let (schema_name, table) = object_name_parts(table_name)?;
    Ok((schema_name, table, index_name))
}

/// Lower a CREATE INDEX statement against its resolved table.
pub fn index_from_create(stmt: &Statement, table: &TableSchema) -> Result<IndexSchema> {
    let Statement::CreateIndex { name, columns, .. } = stmt else {
        return Err(Error::Unsupported(format!(
            "expected CREATE INDEX, got {stmt}"
        )));
    };
    let index_name = name
        .as_ref()
        .map(|n| object_name_parts(n).map(|(_, name)| name))
        .transpose()?
        .ok_or_else(|| Error::Unsupported("unnamed CREATE INDEX".to_string()))?;

    let parts = columns
        .iter()
        .map(|term| index_part(term, table))
        .collect::<Result<Vec<_>>>()?;

    Ok(IndexSchema {
        name: index_name,
        parts,
    })
}

fn index_part(term: &OrderByExpr, table: &TableSchema) -> Result<IndexPart> {
    let (expr, collation) = match &term.expr {
        Expr::Collate { expr, collation } => {
            (expr.as_ref(), Some(Collation::parse(&collation.to_string())?))
        }
        other => (other, None),
    };
    let column_name = match expr {
        Expr::Identifier(ident) => ident.value.clone(),
        other => {
            return Err(Error::Unsupported(format!(
                "expression index term {other}"
            )))
        }
    };
    let column = table
        .column_index(&column_name)
        .ok_or_else(|| Error::NoSuchColumn {
            table: table.name.clone(),
            column: column_name,
        })?;
    Ok(IndexPart {
        column,
        descending: term.asc == Some(false),
        collation: collation.unwrap_or(table.columns[column].collation),
    })
}

/// Parse trailing `@…` markers off a constraint name: `positive@delete`
/// adds DELETE to the op mask, `@deferred` defers the check. The clean
/// name is what failures report.
fn check_constraint(raw_name: String, expr: Expr) -> CheckConstraint {
    let mut ops = RowOps::default();
    let mut deferred = false;
    let mut parts = raw_name.split('@');
    let name = parts.next().unwrap_or_default().to_string();
    let mut explicit = RowOps::empty();
    for marker in parts {
        for token in marker.split(',') {
            match token.trim().to_ascii_lowercase().as_str() {
                "insert" => explicit |= RowOps::INSERT,
                "update" => explicit |= RowOps::UPDATE,
                "delete" => explicit |= RowOps::DELETE,
                "deferred" => deferred = true,
                _ => {}
            }
        }
    }
    if !explicit.is_empty() {
        ops = explicit;
    }
    CheckConstraint {
        name,
        expr,
        ops,
        deferred,
    }
}

/// Render a table schema back into canonical CREATE TABLE DDL.
pub fn render_create_table(table: &TableSchema) -> String {
    let mut sql = String::new();
    write!(
        sql,
        "CREATE {}TABLE {}.{} (",
        if table.is_temporary { "TEMP " } else { "" },
        table.schema_name,
        table.name,
    )
    .unwrap();

    let columns = table.columns.iter().map(|column| {
        let mut text = column.name.clone();
        if let Some(declared) = &column.declared_type {
            write!(text, " {declared}").unwrap();
        }
        if column.collation != Collation::Binary {
            write!(text, " COLLATE {}", column.collation).unwrap();
        }
        if column.not_null && column.pk_ordinal.is_none() {
            text.push_str(" NOT NULL");
        }
        if let Some(default) = &column.default {
            write!(text, " DEFAULT {default}").unwrap();
        }
        text
    });
    write!(sql, "{}", columns.format(", ")).unwrap();

    if !table.primary_key.is_empty() {
        write!(
            sql,
            ", PRIMARY KEY ({})",
            table
                .primary_key
                .iter()
                .map(|part| {
                    let mut text = table.columns[part.column].name.clone();
                    if part.descending {
                        text.push_str(" DESC");
                    }
                    text
                })
                .format(", ")
        )
        .unwrap();
    }

    for check in &table.checks {
        let mut name = check.name.clone();
        if check.ops != RowOps::default() || check.deferred {
            let mut markers = Vec::new();
            if check.ops.contains(RowOps::INSERT) {
                markers.push("insert");
            }
            if check.ops.contains(RowOps::UPDATE) {
                markers.push("update");
            }
            if check.ops.contains(RowOps::DELETE) {
                markers.push("delete");
            }
            if check.deferred {
                markers.push("deferred");
            }
            write!(name, "@{}", markers.join(",")).unwrap();
        }
        write!(sql, ", CONSTRAINT \"{name}\" CHECK ({})", check.expr).unwrap();
    }

    write!(sql, ") USING {}", table.module_name).unwrap();
    if !table.module_args.is_empty() {
        write!(sql, "({})", table.module_args.iter().format(", ")).unwrap();
    }
    sql
}

/// Render a secondary index back into CREATE INDEX DDL.
pub fn render_create_index(table: &TableSchema, index: &IndexSchema) -> String {
    format!(
        "CREATE INDEX {} ON {}.{} ({})",
        index.name,
        table.schema_name,
        table.name,
        index
            .parts
            .iter()
            .map(|part| {
                let mut text = table.columns[part.column].name.clone();
                if part.collation != table.columns[part.column].collation {
                    write!(text, " COLLATE {}", part.collation).unwrap();
                }
                if part.descending {
                    text.push_str(" DESC");
                }
                text
            })
            .format(", ")
    )
}

/// Render a view back into CREATE VIEW DDL.
pub fn render_create_view(view: &TableSchema) -> String {
    let columns = if view.columns.is_empty() {
        String::new()
    } else {
        format!(
            " ({})",
            view.columns.iter().map(|c| c.name.as_str()).format(", ")
        )
    };
    format!(
        "CREATE VIEW {}.{}{} AS {}",
        view.schema_name,
        view.name,
        columns,
        view.view_query
            .as_ref()
            .map(|q| q.to_string())
            .unwrap_or_default()
    )
}

#[cfg(test)]
pub(crate) fn test_table(name: &str) -> std::sync::Arc<TableSchema> {
    use std::sync::Arc;

    use sqlparser::dialect::GenericDialect;
    use sqlparser::parser::Parser;

    let sql = format!("CREATE TABLE {name} (a INTEGER PRIMARY KEY, b TEXT)");
    let statements = Parser::parse_sql(&GenericDialect {}, &sql).unwrap();
    let lowered =
        table_from_create(&statements[0], None, &SchemaDefaults::default()).unwrap();
    Arc::new(lowered.schema)
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;
    use sqlparser::dialect::GenericDialect;
    use sqlparser::parser::Parser;

    fn parse_one(sql: &str) -> Statement {
        Parser::parse_sql(&GenericDialect {}, sql)
            .unwrap()
            .into_iter()
            .next()
            .unwrap()
    }

    #[test]
    fn test_lower_create_table() {
        let stmt = parse_one(
            "CREATE TABLE inventory (
                id INTEGER PRIMARY KEY,
                sku TEXT NOT NULL,
                qty INT DEFAULT 0,
                CONSTRAINT \"qty_positive\" CHECK (qty >= 0)
            )",
        );
        let lowered = table_from_create(
            &stmt,
            Some(&ModuleClause {
                name: "memory".to_string(),
                args: vec![],
            }),
            &SchemaDefaults::default(),
        )
        .unwrap();
        let table = lowered.schema;

        assert_eq!(table.schema_name, "main");
        assert_eq!(table.name, "inventory");
        assert_eq!(table.columns.len(), 3);
        assert_eq!(table.columns[0].affinity, TypeAffinity::Integer);
        assert_eq!(table.columns[0].pk_ordinal, Some(0));
        assert!(table.columns[0].not_null);
        assert!(table.columns[1].not_null);
        assert!(table.columns[2].default.is_some());
        assert_eq!(
            table.primary_key,
            vec![PrimaryKeyPart {
                column: 0,
                descending: false,
                collation: Collation::Binary
            }]
        );
        assert_eq!(table.checks.len(), 1);
        assert_eq!(table.checks[0].name, "qty_positive");
        assert_eq!(table.checks[0].ops, RowOps::INSERT | RowOps::UPDATE);
        assert_eq!(table.module_name, "memory");
    }

    #[test]
    fn test_check_markers() {
        let stmt = parse_one(
            "CREATE TABLE t (
                a INT PRIMARY KEY,
                CONSTRAINT \"guard@insert,delete\" CHECK (a > 0),
                CONSTRAINT \"late@deferred\" CHECK (a < 100)
            )",
        );
        let table = table_from_create(&stmt, None, &SchemaDefaults::default())
            .unwrap()
            .schema;

        assert_eq!(table.checks[0].name, "guard");
        assert_eq!(table.checks[0].ops, RowOps::INSERT | RowOps::DELETE);
        assert!(!table.checks[0].deferred);

        assert_eq!(table.checks[1].name, "late");
        assert_eq!(table.checks[1].ops, RowOps::INSERT | RowOps::UPDATE);
        assert!(table.checks[1].deferred);
    }

    #[test]
    fn test_whole_row_key_when_no_pk() {
        let stmt = parse_one("CREATE TABLE t (a INT, b TEXT)");
        let table = table_from_create(&stmt, None, &SchemaDefaults::default())
            .unwrap()
            .schema;
        assert_eq!(
            table.primary_key.iter().map(|p| p.column).collect::<Vec<_>>(),
            vec![0, 1]
        );
    }

    #[test]
    fn test_lower_create_index() {
        let table = test_table("t");
        let stmt = parse_one("CREATE INDEX t_b ON t (b COLLATE nocase DESC, a)");
        let index = index_from_create(&stmt, &table).unwrap();

        assert_eq!(index.name, "t_b");
        assert_eq!(
            index.parts,
            vec![
                IndexPart {
                    column: 1,
                    descending: true,
                    collation: Collation::NoCase
                },
                IndexPart {
                    column: 0,
                    descending: false,
                    collation: Collation::Binary
                },
            ]
        );
    }

    #[test]
    fn test_render_round_trip() {
        let table = test_table("t");
        let rendered = render_create_table(&table);
        assert_eq!(
            rendered,
            "CREATE TABLE main.t (a INTEGER, b TEXT, PRIMARY KEY (a)) USING memory"
        );
    }
}
