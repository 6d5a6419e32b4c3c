//! Identifier handling and statement builders for the dynamic per-store
//! tables. Table and column names cannot be bound as parameters, so every
//! dynamic identifier passes through [`validate_identifier`] once (at
//! registry load) and [`quote_identifier`] at statement-build time.

use pg_escape::quote_identifier;

use crate::error::{PipelineError, Result};
use crate::registry::{ColumnKind, GroupSchema};

/// Key columns shared by every destination relation, in PK order.
pub const KEY_COLUMNS: [&str; 3] = ["date", "machine", "slot_no"];

/// Validate that `name` is a simple, unquoted-safe Postgres identifier.
pub fn validate_identifier(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(PipelineError::Identifier("identifier is empty".into()));
    }
    if name.len() > 63 {
        return Err(PipelineError::Identifier(format!(
            "'{name}' exceeds the 63-byte identifier limit"
        )));
    }
    let first = name.chars().next().unwrap_or('_');
    if !first.is_ascii_alphabetic() && first != '_' {
        return Err(PipelineError::Identifier(format!(
            "'{name}' must start with a letter or underscore"
        )));
    }
    for ch in name.chars() {
        if !ch.is_ascii_alphanumeric() && ch != '_' {
            return Err(PipelineError::Identifier(format!(
                "'{name}' contains invalid character '{ch}'"
            )));
        }
    }
    Ok(())
}

fn quoted(name: &str) -> String {
    quote_identifier(name).to_string()
}

fn pg_type(kind: ColumnKind) -> &'static str {
    match kind {
        ColumnKind::IntegerCount => "BIGINT",
        ColumnKind::Ratio => "DOUBLE PRECISION",
    }
}

/// CREATE TABLE IF NOT EXISTS for a group's destination relation: fixed key
/// columns plus every canonical column the registry declares for the group.
pub fn create_destination_table(schema: &GroupSchema) -> String {
    let mut columns = vec![
        "date DATE NOT NULL".to_string(),
        "machine TEXT NOT NULL".to_string(),
        "slot_no BIGINT NOT NULL".to_string(),
    ];
    for column in schema.columns() {
        columns.push(format!("{} {}", quoted(&column.name), pg_type(column.kind)));
    }
    format!(
        "CREATE TABLE IF NOT EXISTS {} ({}, PRIMARY KEY (date, machine, slot_no))",
        quoted(&schema.table_name()),
        columns.join(", ")
    )
}

/// Secondary indexes matching the read patterns of the query surface:
/// machine-level series, date rollups, and single-slot series.
pub fn create_destination_indexes(table: &str) -> Vec<String> {
    vec![
        format!(
            "CREATE INDEX IF NOT EXISTS {} ON {} (machine, date)",
            quoted(&format!("idx_{table}_machine_date")),
            quoted(table)
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS {} ON {} (date)",
            quoted(&format!("idx_{table}_date")),
            quoted(table)
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS {} ON {} (machine, slot_no, date)",
            quoted(&format!("idx_{table}_machine_slot_date")),
            quoted(table)
        ),
    ]
}

/// Reflect the current column set of an existing table.
pub fn select_table_columns() -> &'static str {
    "SELECT column_name FROM information_schema.columns \
     WHERE table_schema = current_schema() AND table_name = $1 \
     ORDER BY ordinal_position"
}

/// Session-local staging table shaped like the destination.
pub fn create_staging_table(staging: &str, table: &str) -> String {
    format!(
        "CREATE TEMP TABLE {} (LIKE {} INCLUDING DEFAULTS) ON COMMIT DROP",
        quoted(staging),
        quoted(table)
    )
}

/// Multi-row parameterized INSERT into `table` for `row_count` rows of the
/// given columns: `INSERT INTO t (c1, c2) VALUES ($1, $2), ($3, $4), ...`.
pub fn insert_rows(table: &str, columns: &[String], row_count: usize) -> String {
    let column_list = columns
        .iter()
        .map(|c| quoted(c))
        .collect::<Vec<_>>()
        .join(", ");
    let mut placeholders = Vec::with_capacity(row_count);
    let width = columns.len();
    for row in 0..row_count {
        let tuple = (0..width)
            .map(|i| format!("${}", row * width + i + 1))
            .collect::<Vec<_>>()
            .join(", ");
        placeholders.push(format!("({tuple})"));
    }
    format!(
        "INSERT INTO {} ({}) VALUES {}",
        quoted(table),
        column_list,
        placeholders.join(", ")
    )
}

fn update_assignments(value_columns: &[String]) -> String {
    value_columns
        .iter()
        .map(|c| {
            let q = quoted(c);
            format!("{q} = EXCLUDED.{q}")
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Set-based merge from staging into the destination: insert new keys,
/// overwrite every non-key column for existing keys (last writer wins).
pub fn merge_from_staging(table: &str, staging: &str, value_columns: &[String]) -> String {
    let conflict_action = if value_columns.is_empty() {
        "DO NOTHING".to_string()
    } else {
        format!("DO UPDATE SET {}", update_assignments(value_columns))
    };
    format!(
        "INSERT INTO {} SELECT * FROM {} ON CONFLICT (date, machine, slot_no) {}",
        quoted(table),
        quoted(staging),
        conflict_action
    )
}

/// Single-row insert-or-overwrite used by the fallback path.
pub fn upsert_single_row(table: &str, columns: &[String], value_columns: &[String]) -> String {
    let base = insert_rows(table, columns, 1);
    let conflict_action = if value_columns.is_empty() {
        "DO NOTHING".to_string()
    } else {
        format!("DO UPDATE SET {}", update_assignments(value_columns))
    };
    format!("{base} ON CONFLICT (date, machine, slot_no) {conflict_action}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::SchemaRegistry;

    fn sample_schema() -> GroupSchema {
        let toml = r#"
            [groups."StoreA"]
            table_stem = "store_a"
            slot_aliases = ["台番号"]

            [[groups."StoreA".columns]]
            name = "bb_count"
            kind = "integer_count"
            aliases = ["BB回数"]

            [[groups."StoreA".columns]]
            name = "combined_rate"
            kind = "ratio"
            aliases = ["合成確率"]
        "#;
        SchemaRegistry::from_toml_str(toml)
            .unwrap()
            .get("StoreA")
            .unwrap()
            .clone()
    }

    #[test]
    fn validate_identifier_accepts_simple_names() {
        assert!(validate_identifier("slot_store_a").is_ok());
        assert!(validate_identifier("_hidden").is_ok());
        assert!(validate_identifier("t123").is_ok());
    }

    #[test]
    fn validate_identifier_rejects_injection_and_oddities() {
        assert!(validate_identifier("").is_err());
        assert!(validate_identifier("1table").is_err());
        assert!(validate_identifier("ta ble").is_err());
        assert!(validate_identifier("t;drop").is_err());
        assert!(validate_identifier(&"a".repeat(64)).is_err());
    }

    #[test]
    fn create_table_lists_key_and_value_columns() {
        let sql = create_destination_table(&sample_schema());
        assert!(sql.starts_with("CREATE TABLE IF NOT EXISTS"));
        assert!(sql.contains("slot_store_a"));
        assert!(sql.contains("date DATE NOT NULL"));
        assert!(sql.contains("bb_count"));
        assert!(sql.contains("DOUBLE PRECISION"));
        assert!(sql.contains("PRIMARY KEY (date, machine, slot_no)"));
    }

    #[test]
    fn destination_indexes_cover_series_lookups() {
        let statements = create_destination_indexes("slot_store_a");
        assert_eq!(statements.len(), 3);
        assert!(statements[0].contains("(machine, date)"));
        assert!(statements[1].contains("(date)"));
        // single-slot series scans by machine + slot_no + date
        assert!(statements[2].contains("(machine, slot_no, date)"));
        assert!(statements
            .iter()
            .all(|s| s.starts_with("CREATE INDEX IF NOT EXISTS")));
    }

    #[test]
    fn insert_rows_numbers_placeholders_row_major() {
        let columns = vec!["date".to_string(), "machine".to_string()];
        let sql = insert_rows("slot_store_a", &columns, 2);
        assert!(sql.contains("($1, $2), ($3, $4)"));
    }

    #[test]
    fn merge_from_staging_overwrites_non_key_columns() {
        let value_columns = vec!["bb_count".to_string(), "combined_rate".to_string()];
        let sql = merge_from_staging("slot_store_a", "staging_x", &value_columns);
        assert!(sql.contains("ON CONFLICT (date, machine, slot_no) DO UPDATE SET"));
        assert!(sql.contains("bb_count = EXCLUDED.bb_count"));
        assert!(sql.contains("combined_rate = EXCLUDED.combined_rate"));
        assert!(!sql.contains("machine = EXCLUDED"));
    }

    #[test]
    fn single_row_upsert_appends_conflict_clause() {
        let columns = vec![
            "date".to_string(),
            "machine".to_string(),
            "slot_no".to_string(),
            "bb_count".to_string(),
        ];
        let value_columns = vec!["bb_count".to_string()];
        let sql = upsert_single_row("slot_store_a", &columns, &value_columns);
        assert!(sql.contains("VALUES ($1, $2, $3, $4)"));
        assert!(sql.ends_with("DO UPDATE SET bb_count = EXCLUDED.bb_count"));
    }
}
