//! Two-tier merge of canonical rows into a destination relation.
//!
//! Fast path: stage the whole relation group into a session-local temp
//! table with chunked multi-row inserts, then one set-based
//! insert-or-overwrite, all inside a single transaction. Any failure rolls
//! the transaction back and the same rows replay through the fallback
//! path: per-file, per-row upserts where one bad row only fails its own
//! source file. Conflict policy is last-writer-wins on every non-key
//! column; snapshots are authoritative, so no column-level merging.

use chrono::NaiveDate;
use sqlx::postgres::PgArguments;
use sqlx::query::Query;
use sqlx::Postgres;
use tracing::{debug, warn};

use crate::db::DbPool;
use crate::error::{PipelineError, Result};
use crate::fetch::FetchedFile;
use crate::normalize::Value;
use crate::provision::DestinationRelation;
use crate::sql;

/// Postgres caps bind parameters per statement at 65535; stay under it.
const MAX_BIND_PARAMS: usize = 60_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergePath {
    Fast,
    Fallback,
}

#[derive(Debug)]
pub struct MergeOutcome {
    pub path_used: MergePath,
    /// Indexes into the input slice of files whose rows all merged.
    pub merged_files: Vec<usize>,
    pub failed_files: Vec<(usize, PipelineError)>,
    pub rows_merged: usize,
}

#[derive(Debug, Clone)]
enum Cell {
    Date(NaiveDate),
    Text(String),
    Int(Option<i64>),
    Float(Option<f64>),
}

fn bind_cell<'q>(
    query: Query<'q, Postgres, PgArguments>,
    cell: &'q Cell,
) -> Query<'q, Postgres, PgArguments> {
    match cell {
        Cell::Date(d) => query.bind(*d),
        Cell::Text(t) => query.bind(t.as_str()),
        Cell::Int(i) => query.bind(*i),
        Cell::Float(f) => query.bind(*f),
    }
}

/// Flatten one file's rows into bind tuples following the relation's
/// column order. Canonical columns missing from the file bind as NULL.
fn file_tuples(relation: &DestinationRelation, file: &FetchedFile) -> Vec<Vec<Cell>> {
    file.rows
        .iter()
        .map(|row| {
            let mut tuple = Vec::with_capacity(relation.columns.len());
            tuple.push(Cell::Date(file.planned.meta.date));
            tuple.push(Cell::Text(file.planned.meta.sub_key.clone()));
            tuple.push(Cell::Int(Some(row.slot_no)));
            for column in &relation.value_columns {
                tuple.push(match row.get(column) {
                    Some(Value::Count(v)) => Cell::Int(v),
                    Some(Value::Ratio(v)) => Cell::Float(Some(v)),
                    None => Cell::Float(None),
                });
            }
            tuple
        })
        .collect()
}

pub struct MergeEngine<'a> {
    pool: &'a DbPool,
    force_row_path: bool,
}

impl<'a> MergeEngine<'a> {
    pub fn new(pool: &'a DbPool, force_row_path: bool) -> Self {
        Self {
            pool,
            force_row_path,
        }
    }

    /// Merge one relation group of fetched files. The fast path covers all
    /// files at once; if any step of it fails, the identical rows replay
    /// through the per-row fallback so already-committed data is never
    /// lost and per-file failures stay isolated.
    pub async fn merge(
        &self,
        relation: &DestinationRelation,
        files: &[FetchedFile],
    ) -> Result<MergeOutcome> {
        if !self.force_row_path {
            match self.fast_merge(relation, files).await {
                Ok(rows_merged) => {
                    return Ok(MergeOutcome {
                        path_used: MergePath::Fast,
                        merged_files: (0..files.len()).collect(),
                        failed_files: Vec::new(),
                        rows_merged,
                    });
                }
                Err(err) => {
                    warn!(
                        table = %relation.table,
                        error = %PipelineError::BulkMerge {
                            table: relation.table.clone(),
                            message: err.to_string(),
                        },
                        "bulk merge failed, falling back to per-row upserts"
                    );
                }
            }
        }

        self.row_merge(relation, files).await
    }

    async fn fast_merge(
        &self,
        relation: &DestinationRelation,
        files: &[FetchedFile],
    ) -> Result<usize> {
        let staging = format!("staging_{}", relation.table);
        let mut tx = self.pool.begin().await?;

        sqlx::query(&sql::create_staging_table(&staging, &relation.table))
            .execute(&mut *tx)
            .await?;

        let tuples: Vec<Vec<Cell>> = files
            .iter()
            .flat_map(|file| file_tuples(relation, file))
            .collect();
        let width = relation.columns.len().max(1);
        let rows_per_chunk = (MAX_BIND_PARAMS / width).max(1);

        for chunk in tuples.chunks(rows_per_chunk) {
            let statement = sql::insert_rows(&staging, &relation.columns, chunk.len());
            let mut query = sqlx::query(&statement);
            for tuple in chunk {
                for cell in tuple {
                    query = bind_cell(query, cell);
                }
            }
            query.execute(&mut *tx).await?;
        }

        sqlx::query(&sql::merge_from_staging(
            &relation.table,
            &staging,
            &relation.value_columns,
        ))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        debug!(table = %relation.table, rows = tuples.len(), "bulk merge committed");
        Ok(tuples.len())
    }

    async fn row_merge(
        &self,
        relation: &DestinationRelation,
        files: &[FetchedFile],
    ) -> Result<MergeOutcome> {
        let statement = sql::upsert_single_row(
            &relation.table,
            &relation.columns,
            &relation.value_columns,
        );

        let mut outcome = MergeOutcome {
            path_used: MergePath::Fallback,
            merged_files: Vec::new(),
            failed_files: Vec::new(),
            rows_merged: 0,
        };

        'files: for (idx, file) in files.iter().enumerate() {
            let tuples = file_tuples(relation, file);
            for tuple in &tuples {
                let mut query = sqlx::query(&statement);
                for cell in tuple {
                    query = bind_cell(query, cell);
                }
                if let Err(err) = query.execute(self.pool).await {
                    outcome.failed_files.push((
                        idx,
                        PipelineError::RowMerge {
                            table: relation.table.clone(),
                            path: file.planned.descriptor.path.clone(),
                            message: err.to_string(),
                        },
                    ));
                    continue 'files;
                }
            }
            outcome.rows_merged += tuples.len();
            outcome.merged_files.push(idx);
        }

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::ParsedMeta;
    use crate::normalize::normalize_csv;
    use crate::registry::SchemaRegistry;
    use crate::scanner::FileDescriptor;
    use crate::schedule::PlannedFile;

    fn relation() -> DestinationRelation {
        DestinationRelation {
            table: "slot_messe_musashisakai".to_string(),
            columns: vec![
                "date".to_string(),
                "machine".to_string(),
                "slot_no".to_string(),
                "bb_count".to_string(),
                "combined_rate".to_string(),
            ],
            value_columns: vec!["bb_count".to_string(), "combined_rate".to_string()],
        }
    }

    fn fetched(csv: &str) -> FetchedFile {
        let schema = SchemaRegistry::builtin().get("メッセ武蔵境").unwrap();
        FetchedFile {
            planned: PlannedFile {
                descriptor: FileDescriptor {
                    id: "f1".to_string(),
                    path: "メッセ武蔵境/マイジャグラーV/snap_2024-01-01.csv".to_string(),
                    content_hash: "h1".to_string(),
                    mime: "text/csv".to_string(),
                },
                meta: ParsedMeta {
                    group_key: "メッセ武蔵境".to_string(),
                    sub_key: "マイジャグラーV".to_string(),
                    date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
                },
            },
            rows: normalize_csv(csv.as_bytes(), schema).unwrap(),
        }
    }

    #[test]
    fn tuples_follow_relation_column_order() {
        let file = fetched("台番号,BB回数,合成確率\n7,21,1/133\n");
        let tuples = file_tuples(&relation(), &file);
        assert_eq!(tuples.len(), 1);
        let tuple = &tuples[0];
        assert_eq!(tuple.len(), 5);
        assert!(matches!(tuple[0], Cell::Date(_)));
        assert!(matches!(tuple[1], Cell::Text(ref m) if m == "マイジャグラーV"));
        assert!(matches!(tuple[2], Cell::Int(Some(7))));
        assert!(matches!(tuple[3], Cell::Int(Some(21))));
        assert!(matches!(tuple[4], Cell::Float(Some(r)) if (r - 1.0 / 133.0).abs() < 1e-12));
    }

    #[test]
    fn columns_absent_from_the_file_bind_null() {
        let file = fetched("台番号,合成確率\n7,1/100\n");
        let tuples = file_tuples(&relation(), &file);
        // bb_count not in the source file
        assert!(matches!(tuples[0][3], Cell::Float(None)));
    }

    #[test]
    fn chunking_respects_the_bind_limit() {
        let width = relation().columns.len();
        let rows_per_chunk = (MAX_BIND_PARAMS / width).max(1);
        assert!(rows_per_chunk * width <= MAX_BIND_PARAMS);
        assert!(rows_per_chunk >= 1);
    }
}
