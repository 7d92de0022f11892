//! The declared-vs-actual schema differ: compare a declared set of schema
//! objects against the live catalog and produce the migration steps that
//! reconcile them. Migration DDL is emitted drops-first, then creates,
//! then alters.

use std::sync::Arc;

use crate::{ddl, Catalog, SchemaDefaults, TableSchema};

/// Column additions and drops for one existing table.
#[derive(Debug, Default, PartialEq)]
pub struct TableAlteration {
    pub table: String,
    pub columns_to_add: Vec<String>,
    pub columns_to_drop: Vec<String>,
}

/// The migration set reconciling declared and actual schemas.
#[derive(Debug, Default)]
pub struct Migration {
    pub tables_to_create: Vec<String>,
    pub tables_to_drop: Vec<String>,
    pub tables_to_alter: Vec<TableAlteration>,
    pub views_to_create: Vec<String>,
    pub views_to_drop: Vec<String>,
    pub indexes_to_create: Vec<String>,
    pub indexes_to_drop: Vec<String>,
}

impl Migration {
    pub fn is_empty(&self) -> bool {
        self.tables_to_create.is_empty()
            && self.tables_to_drop.is_empty()
            && self.tables_to_alter.is_empty()
            && self.views_to_create.is_empty()
            && self.views_to_drop.is_empty()
            && self.indexes_to_create.is_empty()
            && self.indexes_to_drop.is_empty()
    }

    /// Emit the migration as a DDL batch: drops, then creates, then alters.
    pub fn to_sql(&self) -> Vec<String> {
        let mut out = Vec::new();
        for index in &self.indexes_to_drop {
            out.push(format!("DROP INDEX {index}"));
        }
        for view in &self.views_to_drop {
            out.push(format!("DROP VIEW {view}"));
        }
        for table in &self.tables_to_drop {
            out.push(format!("DROP TABLE {table}"));
        }
        out.extend(self.tables_to_create.iter().cloned());
        out.extend(self.views_to_create.iter().cloned());
        out.extend(self.indexes_to_create.iter().cloned());
        for alteration in &self.tables_to_alter {
            for column in &alteration.columns_to_drop {
                out.push(format!(
                    "ALTER TABLE {} DROP COLUMN {column}",
                    alteration.table
                ));
            }
            for column in &alteration.columns_to_add {
                out.push(format!("ALTER TABLE {} ADD COLUMN {column}", alteration.table));
            }
        }
        out
    }
}

/// Compute the migration reconciling |declared| against |actual|.
/// Declared tables missing their module pick up the schema defaults when
/// their DDL is regenerated.
pub fn diff(
    declared: &[Arc<TableSchema>],
    actual: &Catalog,
    defaults: &SchemaDefaults,
) -> Migration {
    let mut migration = Migration::default();

    for wanted in declared {
        let mut wanted = wanted.clone();
        if !wanted.is_view && wanted.module_name.is_empty() {
            let mut patched = (*wanted).clone();
            patched.module_name = defaults.module_name.clone();
            patched.module_args = defaults.module_args.clone();
            wanted = Arc::new(patched);
        }

        let actual_table = actual.resolve(&wanted.schema_name, &wanted.name);
        match (&actual_table, wanted.is_view) {
            (None, true) => migration
                .views_to_create
                .push(ddl::render_create_view(&wanted)),
            (None, false) => {
                migration
                    .tables_to_create
                    .push(ddl::render_create_table(&wanted));
                for index in &wanted.indexes {
                    migration
                        .indexes_to_create
                        .push(ddl::render_create_index(&wanted, index));
                }
            }
            (Some(existing), true) => {
                // Views are recreated when their definition drifts.
                if render_view_key(existing) != render_view_key(&wanted) {
                    migration.views_to_drop.push(existing.qualified_name());
                    migration
                        .views_to_create
                        .push(ddl::render_create_view(&wanted));
                }
            }
            (Some(existing), false) => {
                diff_table(&wanted, existing, &mut migration);
            }
        }
    }

    for existing in actual.iter() {
        let declared_match = declared.iter().any(|wanted| {
            wanted.schema_name.eq_ignore_ascii_case(&existing.schema_name)
                && wanted.name.eq_ignore_ascii_case(&existing.name)
        });
        if !declared_match {
            if existing.is_view {
                migration.views_to_drop.push(existing.qualified_name());
            } else {
                migration.tables_to_drop.push(existing.qualified_name());
            }
        }
    }

    migration
}

fn diff_table(wanted: &TableSchema, existing: &TableSchema, migration: &mut Migration) {
    let mut alteration = TableAlteration {
        table: existing.qualified_name(),
        ..Default::default()
    };

    for column in &wanted.columns {
        if existing.column_index(&column.name).is_none() {
            let mut text = column.name.clone();
            if let Some(declared) = &column.declared_type {
                text.push(' ');
                text.push_str(declared);
            }
            alteration.columns_to_add.push(text);
        }
    }
    for column in &existing.columns {
        if wanted.column_index(&column.name).is_none() {
            alteration.columns_to_drop.push(column.name.clone());
        }
    }
    if !alteration.columns_to_add.is_empty() || !alteration.columns_to_drop.is_empty() {
        migration.tables_to_alter.push(alteration);
    }

    for index in &wanted.indexes {
        if existing.index(&index.name).is_none() {
            migration
                .indexes_to_create
                .push(ddl::render_create_index(wanted, index));
        }
    }
    for index in &existing.indexes {
        if wanted.index(&index.name).is_none() {
            migration.indexes_to_drop.push(index.name.clone());
        }
    }
}

fn render_view_key(view: &TableSchema) -> String {
    view.view_query
        .as_ref()
        .map(|q| q.to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ddl::{table_from_create, ModuleClause};
    use pretty_assertions::assert_eq;
    use sqlparser::dialect::GenericDialect;
    use sqlparser::parser::Parser;

    fn declared(sql: &str, module: Option<&str>) -> Arc<TableSchema> {
        let stmt = Parser::parse_sql(&GenericDialect {}, sql)
            .unwrap()
            .into_iter()
            .next()
            .unwrap();
        let clause = module.map(|name| ModuleClause {
            name: name.to_string(),
            args: vec![],
        });
        Arc::new(
            table_from_create(&stmt, clause.as_ref(), &SchemaDefaults::default())
                .unwrap()
                .schema,
        )
    }

    #[test]
    fn test_diff_creates_missing_tables() {
        let catalog = Catalog::new();
        let wanted = declared("CREATE TABLE t (a INT PRIMARY KEY)", Some("memory"));
        let migration = diff(&[wanted], &catalog, &SchemaDefaults::default());

        assert_eq!(
            migration.tables_to_create,
            vec!["CREATE TABLE main.t (a INT, PRIMARY KEY (a)) USING memory"]
        );
        assert!(migration.tables_to_drop.is_empty());
    }

    #[test]
    fn test_diff_drops_undeclared_and_alters_columns() {
        let mut catalog = Catalog::new();
        catalog
            .register(declared(
                "CREATE TABLE t (a INT PRIMARY KEY, b TEXT)",
                Some("memory"),
            ))
            .unwrap();
        catalog
            .register(declared("CREATE TABLE stale (x INT)", Some("memory")))
            .unwrap();

        let wanted = declared("CREATE TABLE t (a INT PRIMARY KEY, c REAL)", Some("memory"));
        let migration = diff(&[wanted], &catalog, &SchemaDefaults::default());

        assert_eq!(migration.tables_to_drop, vec!["main.stale"]);
        assert_eq!(
            migration.tables_to_alter,
            vec![TableAlteration {
                table: "main.t".to_string(),
                columns_to_add: vec!["c REAL".to_string()],
                columns_to_drop: vec!["b".to_string()],
            }]
        );

        // Drops come before creates and alters in the emitted batch.
        let sql = migration.to_sql();
        assert_eq!(
            sql,
            vec![
                "DROP TABLE main.stale",
                "ALTER TABLE main.t DROP COLUMN b",
                "ALTER TABLE main.t ADD COLUMN c REAL",
            ]
        );
    }

    #[test]
    fn test_diff_applies_module_defaults() {
        let catalog = Catalog::new();
        let mut bare = (*declared("CREATE TABLE t (a INT PRIMARY KEY)", None)).clone();
        bare.module_name = String::new();
        let migration = diff(&[Arc::new(bare)], &catalog, &SchemaDefaults::default());

        assert_eq!(
            migration.tables_to_create,
            vec!["CREATE TABLE main.t (a INT, PRIMARY KEY (a)) USING memory"]
        );
    }
}
