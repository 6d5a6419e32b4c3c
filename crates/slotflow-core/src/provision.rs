//! Destination table provisioning.
//!
//! One relation per group key, created on first use with the fixed key
//! columns plus every canonical column the registry declares, then never
//! altered (additive provisioning happens only at creation). Concurrent
//! calls for different group keys are safe; the pipeline serializes calls
//! for the same key by provisioning once per batch before fan-out.

use sqlx::Row;
use tracing::info;

use crate::db::DbPool;
use crate::error::Result;
use crate::registry::SchemaRegistry;
use crate::sql;

/// A provisioned destination relation, reflected from the database.
#[derive(Debug, Clone)]
pub struct DestinationRelation {
    pub table: String,
    /// All columns in table position order (key columns first).
    pub columns: Vec<String>,
    /// Non-key columns, the overwrite set for conflict handling.
    pub value_columns: Vec<String>,
}

pub struct TableProvisioner<'a> {
    pool: &'a DbPool,
    registry: &'a SchemaRegistry,
}

impl<'a> TableProvisioner<'a> {
    pub fn new(pool: &'a DbPool, registry: &'a SchemaRegistry) -> Self {
        Self { pool, registry }
    }

    /// Create the group's relation if absent, then reflect its current
    /// column set. Idempotent.
    pub async fn ensure(&self, group_key: &str) -> Result<DestinationRelation> {
        let schema = self.registry.get(group_key)?;
        let table = schema.table_name();

        sqlx::query(&sql::create_destination_table(schema))
            .execute(self.pool)
            .await?;
        info!(%table, group_key, "ensured destination relation");
        for statement in sql::create_destination_indexes(&table) {
            sqlx::query(&statement).execute(self.pool).await?;
        }

        let columns = self.reflect_columns(&table).await?;
        let value_columns = columns
            .iter()
            .filter(|c| !sql::KEY_COLUMNS.contains(&c.as_str()))
            .cloned()
            .collect();

        Ok(DestinationRelation {
            table,
            columns,
            value_columns,
        })
    }

    async fn reflect_columns(&self, table: &str) -> Result<Vec<String>> {
        let rows = sqlx::query(sql::select_table_columns())
            .bind(table)
            .fetch_all(self.pool)
            .await?;
        let mut columns = Vec::with_capacity(rows.len());
        for row in rows {
            columns.push(row.try_get("column_name")?);
        }
        Ok(columns)
    }
}
