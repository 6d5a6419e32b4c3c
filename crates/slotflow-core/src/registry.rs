//! Schema registry: per-group-key column alias tables.
//!
//! Each group key (store) declares its destination table stem, which raw
//! spellings name the slot-id column, and which canonical columns it carries.
//! The registry is read-only at runtime; the built-in table covers the stores
//! we currently receive snapshots from and a TOML file can extend it.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use serde::Deserialize;

use crate::error::{PipelineError, Result};
use crate::sql;

static BUILTIN_TOML: &str = include_str!("../registry/builtin.toml");

static BUILTIN: Lazy<SchemaRegistry> = Lazy::new(|| {
    SchemaRegistry::from_toml_str(BUILTIN_TOML).expect("built-in registry is valid")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnKind {
    /// Non-negative whole counts; missing or unparsable values stay null.
    IntegerCount,
    /// Probabilities in `[0, 1]`; missing or unparsable values become 0.
    Ratio,
}

#[derive(Debug, Clone)]
pub struct CanonicalColumn {
    pub name: String,
    pub kind: ColumnKind,
}

/// The schema declared for one group key.
#[derive(Debug, Clone)]
pub struct GroupSchema {
    pub group_key: String,
    pub table_stem: String,
    columns: Vec<CanonicalColumn>,
    slot_aliases: Vec<String>,
    alias_to_canonical: HashMap<String, String>,
}

impl GroupSchema {
    /// Canonical value columns in declaration order (slot id excluded).
    pub fn columns(&self) -> &[CanonicalColumn] {
        &self.columns
    }

    pub fn kind_of(&self, canonical: &str) -> Option<ColumnKind> {
        self.columns
            .iter()
            .find(|c| c.name == canonical)
            .map(|c| c.kind)
    }

    /// Map a raw header spelling to its canonical column name. Canonical
    /// names map to themselves so a second normalization pass is a no-op.
    pub fn resolve(&self, raw: &str) -> Option<&str> {
        if let Some(name) = self.alias_to_canonical.get(raw) {
            return Some(name);
        }
        self.columns
            .iter()
            .find(|c| c.name == raw)
            .map(|c| c.name.as_str())
    }

    /// Whether a raw header spelling names the slot-id column.
    pub fn is_slot_column(&self, raw: &str) -> bool {
        self.slot_aliases.iter().any(|a| a == raw) || raw == "slot_no"
    }

    /// Destination table name for this group key.
    pub fn table_name(&self) -> String {
        format!("slot_{}", self.table_stem)
    }
}

#[derive(Debug, Deserialize)]
struct RegistryFile {
    groups: HashMap<String, GroupEntry>,
}

#[derive(Debug, Deserialize)]
struct GroupEntry {
    table_stem: String,
    slot_aliases: Vec<String>,
    columns: Vec<ColumnEntry>,
}

#[derive(Debug, Deserialize)]
struct ColumnEntry {
    name: String,
    kind: ColumnKind,
    aliases: Vec<String>,
}

/// Static lookup table from group key to its schema. Never mutated after
/// construction.
#[derive(Debug, Clone)]
pub struct SchemaRegistry {
    groups: HashMap<String, GroupSchema>,
}

impl SchemaRegistry {
    /// The registry compiled into the binary.
    pub fn builtin() -> &'static SchemaRegistry {
        &BUILTIN
    }

    pub fn from_toml_str(input: &str) -> Result<Self> {
        let file: RegistryFile =
            toml::from_str(input).map_err(|err| PipelineError::Registry(err.to_string()))?;

        let mut groups = HashMap::with_capacity(file.groups.len());
        for (group_key, entry) in file.groups {
            sql::validate_identifier(&format!("slot_{}", entry.table_stem))?;

            let mut alias_to_canonical = HashMap::new();
            let mut columns = Vec::with_capacity(entry.columns.len());
            for column in &entry.columns {
                sql::validate_identifier(&column.name)?;
                for alias in &column.aliases {
                    if let Some(previous) =
                        alias_to_canonical.insert(alias.clone(), column.name.clone())
                    {
                        if previous != column.name {
                            return Err(PipelineError::Registry(format!(
                                "group '{group_key}': alias '{alias}' maps to both \
                                 '{previous}' and '{}'",
                                column.name
                            )));
                        }
                    }
                }
                columns.push(CanonicalColumn {
                    name: column.name.clone(),
                    kind: column.kind,
                });
            }

            if entry.slot_aliases.is_empty() {
                return Err(PipelineError::Registry(format!(
                    "group '{group_key}' declares no slot-id aliases"
                )));
            }

            groups.insert(
                group_key.clone(),
                GroupSchema {
                    group_key,
                    table_stem: entry.table_stem,
                    columns,
                    slot_aliases: entry.slot_aliases,
                    alias_to_canonical,
                },
            );
        }

        Ok(Self { groups })
    }

    pub fn from_toml_file(path: &std::path::Path) -> Result<Self> {
        let input = std::fs::read_to_string(path)
            .map_err(|err| PipelineError::Registry(format!("{}: {err}", path.display())))?;
        Self::from_toml_str(&input)
    }

    pub fn get(&self, group_key: &str) -> Result<&GroupSchema> {
        self.groups
            .get(group_key)
            .ok_or_else(|| PipelineError::UnknownGroup {
                group_key: group_key.to_string(),
            })
    }

    pub fn contains(&self, group_key: &str) -> bool {
        self.groups.contains_key(group_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_registry_loads_and_resolves_aliases() {
        let registry = SchemaRegistry::builtin();
        let schema = registry.get("メッセ武蔵境").expect("store registered");
        assert_eq!(schema.table_name(), "slot_messe_musashisakai");
        assert_eq!(schema.resolve("最大持ち玉"), Some("max_medals"));
        assert_eq!(schema.resolve("最大持玉"), Some("max_medals"));
        assert_eq!(schema.kind_of("combined_rate"), Some(ColumnKind::Ratio));
        assert_eq!(schema.kind_of("bb_count"), Some(ColumnKind::IntegerCount));
        assert!(schema.is_slot_column("台番号"));
    }

    #[test]
    fn canonical_names_resolve_to_themselves() {
        let registry = SchemaRegistry::builtin();
        let schema = registry.get("プレゴ立川").unwrap();
        assert_eq!(schema.resolve("combined_rate"), Some("combined_rate"));
        assert!(schema.is_slot_column("slot_no"));
    }

    #[test]
    fn unknown_group_key_is_an_error() {
        let registry = SchemaRegistry::builtin();
        let err = registry.get("nonexistent").unwrap_err();
        assert!(matches!(
            err,
            crate::error::PipelineError::UnknownGroup { .. }
        ));
    }

    #[test]
    fn conflicting_alias_is_rejected() {
        let toml = r#"
            [groups."StoreA"]
            table_stem = "store_a"
            slot_aliases = ["no"]

            [[groups."StoreA".columns]]
            name = "bb_count"
            kind = "integer_count"
            aliases = ["BB"]

            [[groups."StoreA".columns]]
            name = "rb_count"
            kind = "integer_count"
            aliases = ["BB"]
        "#;
        assert!(SchemaRegistry::from_toml_str(toml).is_err());
    }

    #[test]
    fn bad_table_stem_is_rejected() {
        let toml = r#"
            [groups."StoreA"]
            table_stem = "store a; drop"
            slot_aliases = ["no"]
            columns = []
        "#;
        assert!(SchemaRegistry::from_toml_str(toml).is_err());
    }
}
