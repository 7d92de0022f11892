use std::sync::Arc;

use indexmap::IndexMap;

use crate::{Error, Result, TableSchema};

/// Schema-level defaults applied when lowering DDL that doesn't name a
/// virtual-table module explicitly, and by the differ when regenerating DDL.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SchemaDefaults {
    pub schema_name: String,
    pub module_name: String,
    pub module_args: Vec<String>,
}

impl Default for SchemaDefaults {
    fn default() -> Self {
        Self {
            schema_name: "main".to_string(),
            module_name: "memory".to_string(),
            module_args: Vec::new(),
        }
    }
}

/// The catalog of registered tables and views, keyed by lowercased
/// (schema, name). Iteration preserves registration order, which the
/// introspection functions rely on.
#[derive(Debug, Default)]
pub struct Catalog {
    tables: IndexMap<(String, String), Arc<TableSchema>>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(schema: &str, name: &str) -> (String, String) {
        (schema.to_ascii_lowercase(), name.to_ascii_lowercase())
    }

    pub fn register(&mut self, table: Arc<TableSchema>) -> Result<()> {
        let key = Self::key(&table.schema_name, &table.name);
        if self.tables.contains_key(&key) {
            return Err(Error::TableExists {
                schema: table.schema_name.clone(),
                name: table.name.clone(),
            });
        }
        tracing::debug!(table = %table.qualified_name(), "registered table schema");
        self.tables.insert(key, table);
        Ok(())
    }

    /// Swap in a derived schema (index add/drop). The table must exist.
    pub fn replace(&mut self, table: Arc<TableSchema>) -> Result<()> {
        let key = Self::key(&table.schema_name, &table.name);
        match self.tables.get_mut(&key) {
            Some(slot) => {
                *slot = table;
                Ok(())
            }
            None => Err(Error::NoSuchTable {
                schema: table.schema_name.clone(),
                name: table.name.clone(),
            }),
        }
    }

    pub fn resolve(&self, schema: &str, name: &str) -> Option<Arc<TableSchema>> {
        self.tables.get(&Self::key(schema, name)).cloned()
    }

    /// Resolve an unqualified name within |default_schema|.
    pub fn resolve_unqualified(
        &self,
        default_schema: &str,
        name: &str,
    ) -> Option<Arc<TableSchema>> {
        self.resolve(default_schema, name)
    }

    pub fn drop_table(&mut self, schema: &str, name: &str) -> Result<Arc<TableSchema>> {
        self.tables
            .shift_remove(&Self::key(schema, name))
            .ok_or_else(|| Error::NoSuchTable {
                schema: schema.to_string(),
                name: name.to_string(),
            })
    }

    pub fn contains(&self, schema: &str, name: &str) -> bool {
        self.tables.contains_key(&Self::key(schema, name))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<TableSchema>> {
        self.tables.values()
    }

    /// Locate the table that owns the named index.
    pub fn table_of_index(&self, index_name: &str) -> Option<Arc<TableSchema>> {
        self.tables
            .values()
            .find(|t| t.index(index_name).is_some())
            .cloned()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ddl;

    fn table(name: &str) -> Arc<TableSchema> {
        ddl::test_table(name)
    }

    #[test]
    fn test_register_resolve_drop() {
        let mut catalog = Catalog::new();
        catalog.register(table("t")).unwrap();

        assert!(catalog.resolve("main", "T").is_some());
        assert!(catalog.resolve("main", "u").is_none());
        assert!(matches!(
            catalog.register(table("T")).unwrap_err(),
            Error::TableExists { .. }
        ));

        catalog.drop_table("MAIN", "t").unwrap();
        assert!(!catalog.contains("main", "t"));
    }
}
