//! DDL emission: schema changes run as single instructions against the
//! database core.

use std::sync::Arc;

use futures::FutureExt;
use plan::StatementPlan;

use crate::{Emitter, Error, InstrOutput, Result, RuntimeCtx};

impl Emitter {
    pub(super) fn emit_ddl(&mut self, plan: Arc<StatementPlan>) {
        let note = match &*plan {
            StatementPlan::CreateTable { schema, .. } => {
                format!("create table {}", schema.qualified_name())
            }
            StatementPlan::CreateIndex { index, .. } => {
                format!("create index {}", index.name)
            }
            StatementPlan::CreateView { schema } => {
                format!("create view {}", schema.qualified_name())
            }
            StatementPlan::DropTable { name, .. } => format!("drop table {name}"),
            StatementPlan::DropView { name, .. } => format!("drop view {name}"),
            StatementPlan::DropIndex { name, .. } => format!("drop index {name}"),
            _ => "ddl".to_string(),
        };
        let body = Arc::new(move |ctx: Arc<RuntimeCtx>, _params: Vec<InstrOutput>| {
            let plan = plan.clone();
            async move {
                execute_ddl(&ctx, &plan).await?;
                Ok(InstrOutput::Void)
            }
            .boxed()
        });
        self.push(vec![], note, body);
    }
}

async fn execute_ddl(ctx: &Arc<RuntimeCtx>, plan: &StatementPlan) -> Result<()> {
    let core = &ctx.core;
    match plan {
        StatementPlan::CreateTable {
            schema,
            if_not_exists,
        } => {
            {
                let catalog = core.catalog.read().expect("catalog poisoned");
                if catalog.contains(&schema.schema_name, &schema.name) {
                    if *if_not_exists {
                        return Ok(());
                    }
                    return Err(catalog::Error::TableExists {
                        schema: schema.schema_name.clone(),
                        name: schema.name.clone(),
                    }
                    .into());
                }
            }
            core.catalog
                .write()
                .expect("catalog poisoned")
                .register(schema.clone())?;
            // Instantiate eagerly so scans and connections find it.
            core.table_instance(schema)?;
            tracing::debug!(table = %schema.qualified_name(), module = %schema.module_name, "created table");
            Ok(())
        }

        StatementPlan::CreateIndex { table, index } => {
            let instance = core.table_instance(table)?;
            let Some(memory) = instance.as_any().downcast_ref::<memstore::MemoryTable>()
            else {
                return Err(Error::Unsupported(format!(
                    "module {} does not support CREATE INDEX",
                    table.module_name
                )));
            };
            let next_schema = memory.define_index(index.clone())?;
            core.catalog
                .write()
                .expect("catalog poisoned")
                .replace(next_schema)?;
            tracing::debug!(index = %index.name, table = %table.qualified_name(), "created index");
            Ok(())
        }

        StatementPlan::CreateView { schema } => {
            core.catalog
                .write()
                .expect("catalog poisoned")
                .register(schema.clone())?;
            Ok(())
        }

        StatementPlan::DropTable {
            schema_name,
            name,
            if_exists,
        } => {
            let dropped = core
                .catalog
                .write()
                .expect("catalog poisoned")
                .drop_table(schema_name, name);
            match dropped {
                Ok(schema) => {
                    if schema.is_view {
                        // Put it back; DROP TABLE must not drop views.
                        core.catalog
                            .write()
                            .expect("catalog poisoned")
                            .register(schema)?;
                        return Err(Error::Misuse(format!("{name} is a view")));
                    }
                    core.remove_table_instance(schema_name, name);
                    ctx.session.forget_connection(schema_name, name);
                    Ok(())
                }
                Err(catalog::Error::NoSuchTable { .. }) if *if_exists => Ok(()),
                Err(error) => Err(error.into()),
            }
        }

        StatementPlan::DropView {
            schema_name,
            name,
            if_exists,
        } => {
            let dropped = core
                .catalog
                .write()
                .expect("catalog poisoned")
                .drop_table(schema_name, name);
            match dropped {
                Ok(schema) if schema.is_view => Ok(()),
                Ok(schema) => {
                    core.catalog
                        .write()
                        .expect("catalog poisoned")
                        .register(schema)?;
                    Err(Error::Misuse(format!("{name} is a table")))
                }
                Err(catalog::Error::NoSuchTable { .. }) if *if_exists => Ok(()),
                Err(error) => Err(error.into()),
            }
        }

        StatementPlan::DropIndex { name, if_exists } => {
            let owner = core
                .catalog
                .read()
                .expect("catalog poisoned")
                .table_of_index(name);
            let Some(owner) = owner else {
                if *if_exists {
                    return Ok(());
                }
                return Err(Error::NotFound(format!("index {name}")));
            };
            let instance = core.table_instance(&owner)?;
            let Some(memory) = instance.as_any().downcast_ref::<memstore::MemoryTable>()
            else {
                return Err(Error::Unsupported(format!(
                    "module {} does not support DROP INDEX",
                    owner.module_name
                )));
            };
            let next_schema = memory.drop_index(name)?;
            core.catalog
                .write()
                .expect("catalog poisoned")
                .replace(next_schema)?;
            Ok(())
        }

        other => Err(Error::Internal(format!(
            "emit_ddl on a non-DDL plan: {other:?}"
        ))),
    }
}
