//! Path metadata extraction.
//!
//! Remote paths follow `<store>/<machine>/<name>_<YYYY-MM-DD>.csv`. The
//! store and machine segments are positional (third- and second-from-last);
//! the date is the first ISO date token in the filename.

use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

static DATE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\d{4}-\d{2}-\d{2}").expect("date regex compiles"));

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("path '{path}' has fewer than 3 segments")]
    TooShort { path: String },

    #[error("no YYYY-MM-DD date token in file name '{name}'")]
    NoDate { name: String },

    #[error("'{token}' is not a calendar date")]
    BadDate { token: String },
}

/// Metadata derived from a file's remote path. Deterministic, no I/O.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedMeta {
    pub group_key: String,
    pub sub_key: String,
    pub date: NaiveDate,
}

pub fn parse_path(path: &str) -> Result<ParsedMeta, ParseError> {
    let trimmed = path.trim_matches('/');
    let parts: Vec<&str> = trimmed.split('/').collect();
    if parts.len() < 3 {
        return Err(ParseError::TooShort {
            path: path.to_string(),
        });
    }

    let group_key = parts[parts.len() - 3].to_string();
    let sub_key = parts[parts.len() - 2].to_string();
    let name = parts[parts.len() - 1];

    let token = DATE_RE
        .find(name)
        .ok_or_else(|| ParseError::NoDate {
            name: name.to_string(),
        })?
        .as_str();

    let date = NaiveDate::parse_from_str(token, "%Y-%m-%d").map_err(|_| ParseError::BadDate {
        token: token.to_string(),
    })?;

    Ok(ParsedMeta {
        group_key,
        sub_key,
        date,
    })
}
