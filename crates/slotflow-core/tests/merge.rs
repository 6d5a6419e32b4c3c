use std::env;

use anyhow::Result;
use chrono::NaiveDate;
use sqlx::Row;
use tokio::runtime::Runtime;

use slotflow_core::db::{self, DbPool};
use slotflow_core::fetch::FetchedFile;
use slotflow_core::metadata::ParsedMeta;
use slotflow_core::normalize::normalize_csv;
use slotflow_core::provision::{DestinationRelation, TableProvisioner};
use slotflow_core::registry::SchemaRegistry;
use slotflow_core::scanner::FileDescriptor;
use slotflow_core::schedule::PlannedFile;
use slotflow_core::upsert::{MergeEngine, MergePath};

const TABLE: &str = "slot_merge_check";

fn test_registry() -> SchemaRegistry {
    SchemaRegistry::from_toml_str(
        r#"
        [groups."StoreMerge"]
        table_stem = "merge_check"
        slot_aliases = ["slot"]

        [[groups."StoreMerge".columns]]
        name = "bb_count"
        kind = "integer_count"
        aliases = ["bb"]

        [[groups."StoreMerge".columns]]
        name = "combined_rate"
        kind = "ratio"
        aliases = ["rate"]
        "#,
    )
    .expect("test registry")
}

fn fetched(id: &str, csv: &str) -> FetchedFile {
    let registry = test_registry();
    let schema = registry.get("StoreMerge").expect("schema");
    FetchedFile {
        planned: PlannedFile {
            descriptor: FileDescriptor {
                id: id.to_string(),
                path: format!("StoreMerge/MachineX/snap_2024-01-01_{id}.csv"),
                content_hash: format!("hash-{id}"),
                mime: "text/csv".to_string(),
            },
            meta: ParsedMeta {
                group_key: "StoreMerge".to_string(),
                sub_key: "MachineX".to_string(),
                date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            },
        },
        rows: normalize_csv(csv.as_bytes(), schema).expect("normalize"),
    }
}

async fn fresh_relation(pool: &DbPool, registry: &SchemaRegistry) -> Result<DestinationRelation> {
    sqlx::query(&format!("DROP TABLE IF EXISTS {TABLE}"))
        .execute(pool)
        .await?;
    let relation = TableProvisioner::new(pool, registry)
        .ensure("StoreMerge")
        .await?;
    Ok(relation)
}

async fn stored_slots(pool: &DbPool) -> Result<Vec<i64>> {
    let rows = sqlx::query(&format!("SELECT slot_no FROM {TABLE} ORDER BY slot_no"))
        .fetch_all(pool)
        .await?;
    let mut slots = Vec::with_capacity(rows.len());
    for row in rows {
        slots.push(row.try_get("slot_no")?);
    }
    Ok(slots)
}

fn test_database_url(test_name: &str) -> Option<String> {
    match env::var("SLOTFLOW_TEST_DATABASE_URL") {
        Ok(url) => Some(url),
        Err(_) => {
            eprintln!("Skipping {test_name} because SLOTFLOW_TEST_DATABASE_URL is not set");
            None
        }
    }
}

#[test]
fn fast_path_merges_a_relation_group() -> Result<()> {
    let Some(database_url) = test_database_url("fast_path_merges_a_relation_group") else {
        return Ok(());
    };

    let rt = Runtime::new()?;
    rt.block_on(async move {
        let pool = db::connect(&database_url).await?;
        let registry = test_registry();
        let relation = fresh_relation(&pool, &registry).await?;

        let files = vec![
            fetched("f1", "slot,bb,rate\n7,3,1/100\n8,4,1/120\n"),
            fetched("f2", "slot,bb,rate\n9,5,1/133\n"),
        ];
        let outcome = MergeEngine::new(&pool, false).merge(&relation, &files).await?;

        assert_eq!(outcome.path_used, MergePath::Fast);
        assert_eq!(outcome.merged_files, vec![0, 1]);
        assert!(outcome.failed_files.is_empty());
        assert_eq!(outcome.rows_merged, 3);
        assert_eq!(stored_slots(&pool).await?, vec![7, 8, 9]);
        Ok(())
    })
}

#[test]
fn forced_row_path_skips_the_bulk_merge() -> Result<()> {
    let Some(database_url) = test_database_url("forced_row_path_skips_the_bulk_merge") else {
        return Ok(());
    };

    let rt = Runtime::new()?;
    rt.block_on(async move {
        let pool = db::connect(&database_url).await?;
        let registry = test_registry();
        let relation = fresh_relation(&pool, &registry).await?;

        let files = vec![fetched("f1", "slot,bb,rate\n7,3,1/100\n8,4,1/120\n")];
        let outcome = MergeEngine::new(&pool, true).merge(&relation, &files).await?;

        assert_eq!(outcome.path_used, MergePath::Fallback);
        assert_eq!(outcome.merged_files, vec![0]);
        assert_eq!(outcome.rows_merged, 2);
        assert_eq!(stored_slots(&pool).await?, vec![7, 8]);
        Ok(())
    })
}

#[test]
fn failed_fast_path_falls_back_and_isolates_the_bad_file() -> Result<()> {
    let Some(database_url) =
        test_database_url("failed_fast_path_falls_back_and_isolates_the_bad_file")
    else {
        return Ok(());
    };

    let rt = Runtime::new()?;
    rt.block_on(async move {
        let pool = db::connect(&database_url).await?;
        let registry = test_registry();
        let relation = fresh_relation(&pool, &registry).await?;

        // The staging table copies the destination's shape but not its
        // constraints, so a negative slot id passes staging and makes the
        // set-based merge fail deterministically.
        sqlx::query(&format!(
            "ALTER TABLE {TABLE} ADD CONSTRAINT slot_no_positive CHECK (slot_no >= 0)"
        ))
        .execute(&pool)
        .await?;

        let files = vec![
            fetched("good", "slot,bb,rate\n7,3,1/100\n8,4,1/120\n"),
            fetched("bad", "slot,bb,rate\n-1,5,1/133\n9,6,1/150\n"),
        ];
        let outcome = MergeEngine::new(&pool, false).merge(&relation, &files).await?;

        assert_eq!(outcome.path_used, MergePath::Fallback);
        assert_eq!(outcome.merged_files, vec![0]);
        assert_eq!(outcome.failed_files.len(), 1);
        assert_eq!(outcome.failed_files[0].0, 1);
        assert!(outcome.failed_files[0]
            .1
            .to_string()
            .contains("row merge into slot_merge_check"));
        assert_eq!(outcome.rows_merged, 2);

        // the good file's rows landed; nothing from the bad file did
        assert_eq!(stored_slots(&pool).await?, vec![7, 8]);
        Ok(())
    })
}
