//! Record normalization: raw snapshot CSV bytes to canonical rows.
//!
//! Vendors report bonus probabilities as `"1/133"` strings, plain
//! reciprocals (`133`), or already-normalized fractions (`0.0075`), and
//! older exports spell several columns differently. Normalization renames
//! columns through the schema registry, folds every ratio representation
//! into a float in `[0, 1]`, and coerces counts to nullable integers.
//!
//! Null handling is deliberately asymmetric: an unparsable ratio becomes 0
//! ("no signal"), while an unparsable count stays null so it remains
//! distinguishable from a true zero.

use std::collections::HashMap;

use thiserror::Error;

use crate::registry::{ColumnKind, GroupSchema};

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("snapshot has no header row")]
    EmptyFile,

    #[error("no slot-id column in header {header:?}")]
    NoSlotColumn { header: Vec<String> },
}

/// One canonical value cell.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Count(Option<i64>),
    Ratio(f64),
}

/// One normalized row, keyed within a file by `slot_no`. Columns absent from
/// the source file are simply absent from `values` and surface as NULL.
#[derive(Debug, Clone)]
pub struct CanonicalRow {
    pub slot_no: i64,
    values: HashMap<String, Value>,
}

impl CanonicalRow {
    pub fn get(&self, canonical: &str) -> Option<Value> {
        self.values.get(canonical).copied()
    }
}

/// Decode snapshot bytes: UTF-8 (with optional BOM) first, Shift_JIS
/// otherwise. The vendors' exports are Shift_JIS.
fn decode(bytes: &[u8]) -> String {
    let stripped = bytes.strip_prefix(b"\xef\xbb\xbf").unwrap_or(bytes);
    match std::str::from_utf8(stripped) {
        Ok(text) => text.to_string(),
        Err(_) => {
            let (text, _, _) = encoding_rs::SHIFT_JIS.decode(stripped);
            text.into_owned()
        }
    }
}

/// Parse a ratio cell into `[0, 1]`.
///
/// `"a/b"` ignores the numerator (source files always use 1) and yields
/// `1/b`, or 0 when `b <= 0` or unparsable. A plain number `> 1` is an
/// implicit denominator (`1/n`); `<= 1` is already normalized. Anything
/// else is 0, never an error.
fn parse_ratio(raw: &str) -> f64 {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return 0.0;
    }
    if let Some((_, denom)) = trimmed.split_once('/') {
        return match denom.trim().parse::<f64>() {
            Ok(d) if d.is_finite() && d > 0.0 => 1.0 / d,
            _ => 0.0,
        };
    }
    match trimmed.parse::<f64>() {
        Ok(n) if n.is_finite() => {
            if n > 1.0 {
                1.0 / n
            } else {
                n
            }
        }
        _ => 0.0,
    }
}

/// Parse a count cell. Values are whole numbers, occasionally exported with
/// a trailing `.0` or thousands separators.
fn parse_count(raw: &str) -> Option<i64> {
    let cleaned: String = raw.trim().chars().filter(|c| *c != ',').collect();
    if cleaned.is_empty() {
        return None;
    }
    if let Ok(n) = cleaned.parse::<i64>() {
        return Some(n);
    }
    match cleaned.parse::<f64>() {
        Ok(f) if f.is_finite() && f.fract() == 0.0 => Some(f as i64),
        _ => None,
    }
}

enum ColumnRole {
    Slot,
    Canonical { name: String, kind: ColumnKind },
    Ignored,
}

/// Normalize one raw snapshot into canonical rows. Unknown raw columns are
/// dropped; rows without a parseable slot id are dropped. Idempotent:
/// normalizing already-canonical output changes nothing.
pub fn normalize_csv(bytes: &[u8], schema: &GroupSchema) -> Result<Vec<CanonicalRow>, NormalizeError> {
    let text = decode(bytes);
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(text.as_bytes());

    let header = reader.headers()?.clone();
    if header.is_empty() || (header.len() == 1 && header[0].trim().is_empty()) {
        return Err(NormalizeError::EmptyFile);
    }

    let roles: Vec<ColumnRole> = header
        .iter()
        .map(|raw| {
            let raw = raw.trim();
            if schema.is_slot_column(raw) {
                ColumnRole::Slot
            } else if let Some(name) = schema.resolve(raw) {
                // resolve() only returns canonical names, so kind_of is Some
                let kind = schema.kind_of(name).unwrap_or(ColumnKind::IntegerCount);
                ColumnRole::Canonical {
                    name: name.to_string(),
                    kind,
                }
            } else {
                ColumnRole::Ignored
            }
        })
        .collect();

    if !roles.iter().any(|r| matches!(r, ColumnRole::Slot)) {
        return Err(NormalizeError::NoSlotColumn {
            header: header.iter().map(str::to_string).collect(),
        });
    }

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = match record {
            Ok(record) => record,
            // mirror the original importer: skip unreadable lines
            Err(_) => continue,
        };

        let mut slot_no = None;
        let mut values = HashMap::new();
        for (idx, role) in roles.iter().enumerate() {
            let cell = record.get(idx).unwrap_or("");
            match role {
                ColumnRole::Slot => slot_no = parse_count(cell),
                ColumnRole::Canonical { name, kind } => {
                    let value = match kind {
                        ColumnKind::Ratio => Value::Ratio(parse_ratio(cell)),
                        ColumnKind::IntegerCount => Value::Count(parse_count(cell)),
                    };
                    values.insert(name.clone(), value);
                }
                ColumnRole::Ignored => {}
            }
        }

        match slot_no {
            Some(slot_no) => rows.push(CanonicalRow { slot_no, values }),
            None => continue,
        }
    }

    Ok(rows)
}
