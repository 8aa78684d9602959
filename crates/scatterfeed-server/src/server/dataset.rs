//! The record partition a worker serves.
//!
//! Records are loaded once at startup and never change afterwards. Each new
//! session receives an immutable snapshot selected by the caller's query;
//! selecting everything shares the loaded sequence instead of copying it.

use anyhow::Context;
use scatterfeed_core::{
    Error, Result,
    types::{Record, RecordSet},
};
use serde::Deserialize;
use std::path::Path;

/// Queries that select the whole partition. The team names are the selectors
/// upstream leaders have always sent.
const SELECT_ALL: &[&str] = &["", "*", "all", "all_data", "green_data", "pink_data"];

/// One row as stored on disk.
#[derive(Debug, Deserialize)]
struct RecordRow {
    datetime: String,
    #[serde(default = "default_timezone")]
    timezone: String,
    location: String,
    #[serde(default)]
    latitude: f64,
    #[serde(default)]
    longitude: f64,
    parameter: String,
    value: f64,
    #[serde(default)]
    unit: String,
    #[serde(default)]
    category: String,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

impl From<RecordRow> for Record {
    fn from(row: RecordRow) -> Self {
        Self {
            datetime: row.datetime,
            timezone: row.timezone,
            location: row.location,
            latitude: row.latitude,
            longitude: row.longitude,
            parameter: row.parameter,
            value: row.value,
            unit: row.unit,
            category: row.category,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Selector {
    All,
    Parameter(String),
    Location(String),
}

impl Selector {
    fn parse(query: &str) -> Result<Self> {
        let query = query.trim();
        if SELECT_ALL.iter().any(|all| all.eq_ignore_ascii_case(query)) {
            return Ok(Self::All);
        }

        match query.split_once(':') {
            Some((field, value)) if !value.trim().is_empty() => {
                let value = value.trim().to_string();
                match field.trim().to_ascii_lowercase().as_str() {
                    "parameter" => Ok(Self::Parameter(value)),
                    "location" => Ok(Self::Location(value)),
                    other => Err(Error::InvalidRequest {
                        reason: format!("unknown query field `{other}`"),
                    }),
                }
            }
            _ => Err(Error::InvalidRequest {
                reason: format!("unsupported query `{query}`"),
            }),
        }
    }

    fn matches(&self, record: &Record) -> bool {
        match self {
            Self::All => true,
            Self::Parameter(parameter) => record.parameter.eq_ignore_ascii_case(parameter),
            Self::Location(location) => record.location.eq_ignore_ascii_case(location),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Dataset {
    records: RecordSet,
}

impl Dataset {
    pub fn new(records: Vec<Record>) -> Self {
        Self {
            records: records.into(),
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    /// Loads records from a JSON array or a JSON-lines file.
    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("failed to parse {}", path.display()))
    }

    fn parse(raw: &str) -> anyhow::Result<Self> {
        let rows: Vec<RecordRow> = if raw.trim_start().starts_with('[') {
            serde_json::from_str(raw)?
        } else {
            raw.lines()
                .enumerate()
                .filter(|(_, line)| !line.trim().is_empty())
                .map(|(n, line)| {
                    serde_json::from_str(line).with_context(|| format!("line {}", n + 1))
                })
                .collect::<anyhow::Result<_>>()?
        };
        Ok(Self::new(rows.into_iter().map(Record::from).collect()))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Returns the snapshot a new session should page through.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRequest`] for queries this worker cannot
    /// interpret.
    pub fn select(&self, query: &str) -> Result<RecordSet> {
        match Selector::parse(query)? {
            Selector::All => Ok(self.records.clone()),
            selector => Ok(self
                .records
                .iter()
                .filter(|record| selector.matches(record))
                .cloned()
                .collect()),
        }
    }
}
