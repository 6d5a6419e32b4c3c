//! Read-only query surface for the visualization layer.
//!
//! Everything here is a plain SELECT against destination relations; no
//! write access is exposed outward.

use chrono::NaiveDate;
use pg_escape::quote_identifier;
use serde::Serialize;
use sqlx::Row;

use crate::db::DbPool;
use crate::error::{PipelineError, Result};
use crate::registry::GroupSchema;

/// All destination relations currently present.
pub async fn store_tables(pool: &DbPool) -> Result<Vec<String>> {
    let rows = sqlx::query(
        "SELECT tablename FROM pg_tables \
         WHERE schemaname = current_schema() AND tablename LIKE 'slot_%' \
         ORDER BY tablename",
    )
    .fetch_all(pool)
    .await?;
    let mut tables = Vec::with_capacity(rows.len());
    for row in rows {
        tables.push(row.try_get("tablename")?);
    }
    Ok(tables)
}

/// Machines with data for the group in the inclusive date range.
pub async fn machines(
    pool: &DbPool,
    schema: &GroupSchema,
    start: NaiveDate,
    end: NaiveDate,
) -> Result<Vec<String>> {
    let statement = format!(
        "SELECT DISTINCT machine FROM {} WHERE date BETWEEN $1 AND $2 ORDER BY machine",
        quote_identifier(&schema.table_name())
    );
    let rows = sqlx::query(&statement)
        .bind(start)
        .bind(end)
        .fetch_all(pool)
        .await?;
    let mut machines = Vec::with_capacity(rows.len());
    for row in rows {
        machines.push(row.try_get("machine")?);
    }
    Ok(machines)
}

/// Slot numbers recorded for one machine in the range.
pub async fn slot_numbers(
    pool: &DbPool,
    schema: &GroupSchema,
    machine: &str,
    start: NaiveDate,
    end: NaiveDate,
) -> Result<Vec<i64>> {
    let statement = format!(
        "SELECT DISTINCT slot_no FROM {} \
         WHERE machine = $1 AND date BETWEEN $2 AND $3 ORDER BY slot_no",
        quote_identifier(&schema.table_name())
    );
    let rows = sqlx::query(&statement)
        .bind(machine)
        .bind(start)
        .bind(end)
        .fetch_all(pool)
        .await?;
    let mut slots = Vec::with_capacity(rows.len());
    for row in rows {
        slots.push(row.try_get("slot_no")?);
    }
    Ok(slots)
}

/// Earliest and latest snapshot dates in the group's relation, if any.
pub async fn date_bounds(
    pool: &DbPool,
    schema: &GroupSchema,
) -> Result<Option<(NaiveDate, NaiveDate)>> {
    let statement = format!(
        "SELECT MIN(date) AS min_date, MAX(date) AS max_date FROM {}",
        quote_identifier(&schema.table_name())
    );
    let row = sqlx::query(&statement).fetch_one(pool).await?;
    let min: Option<NaiveDate> = row.try_get("min_date")?;
    let max: Option<NaiveDate> = row.try_get("max_date")?;
    Ok(min.zip(max))
}

#[derive(Debug, Clone, Serialize)]
pub struct SeriesPoint {
    pub date: NaiveDate,
    pub value: Option<f64>,
}

/// Daily series of one canonical column for a machine, averaged across
/// slots unless a single `slot_no` is given (the "whole floor average"
/// view versus a single unit).
pub async fn column_series(
    pool: &DbPool,
    schema: &GroupSchema,
    machine: &str,
    slot_no: Option<i64>,
    column: &str,
    start: NaiveDate,
    end: NaiveDate,
) -> Result<Vec<SeriesPoint>> {
    if schema.kind_of(column).is_none() {
        return Err(PipelineError::Identifier(format!(
            "'{column}' is not a canonical column of group '{}'",
            schema.group_key
        )));
    }

    let table = quote_identifier(&schema.table_name()).to_string();
    let col = quote_identifier(column).to_string();
    let mut statement = format!(
        "SELECT date, AVG({col}::double precision) AS value FROM {table} \
         WHERE machine = $1 AND date BETWEEN $2 AND $3"
    );
    if slot_no.is_some() {
        statement.push_str(" AND slot_no = $4");
    }
    statement.push_str(" GROUP BY date ORDER BY date");

    let mut query = sqlx::query(&statement).bind(machine).bind(start).bind(end);
    if let Some(slot) = slot_no {
        query = query.bind(slot);
    }

    let rows = query.fetch_all(pool).await?;
    let mut series = Vec::with_capacity(rows.len());
    for row in rows {
        series.push(SeriesPoint {
            date: row.try_get("date")?,
            value: row.try_get("value")?,
        });
    }
    Ok(series)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::SchemaRegistry;

    #[tokio::test]
    async fn unknown_column_is_rejected_before_any_query() {
        // No pool needed: validation fails first. Use a lazily-connecting
        // pool that never actually dials.
        let pool = sqlx::postgres::PgPoolOptions::new()
            .connect_lazy("postgres://localhost/unused")
            .expect("lazy pool");
        let schema = SchemaRegistry::builtin().get("プレゴ立川").unwrap();
        let err = column_series(
            &pool,
            schema,
            "ジャグラー",
            None,
            "not_a_column",
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2024, 1, 31).unwrap(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, PipelineError::Identifier(_)));
    }
}
