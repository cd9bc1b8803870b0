//! Declarative translation rules between the two schemas.
//!
//! The catalog is declared in primary-store terms: each [`TableMapping`]
//! names a primary-side table and its secondary-side counterpart, the key
//! correspondence, and per-column rename/coercion rules. The same catalog
//! serves both directions; coercions are invertible and the translator flips
//! them for inbound events.
//!
//! Catalogs are static configuration, loaded once at startup from TOML and
//! never mutated at runtime.

use crate::error::SyncError;
use chrono::{DateTime, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Type coercion applied to a column value, declared primary → secondary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Coercion {
    /// Value passes through unchanged.
    #[default]
    Identity,
    /// `"YYYY-MM-DD HH:MM:SS"` (naive, treated as UTC) to RFC 3339.
    LocalDateTimeToRfc3339,
    /// RFC 3339 to `"YYYY-MM-DD HH:MM:SS"`.
    Rfc3339ToLocalDateTime,
    /// `true`/`false` to `1`/`0`.
    BoolToInt,
    /// `1`/`0` to `true`/`false`.
    IntToBool,
    /// Numeric value to its decimal string rendering.
    NumberToText,
    /// Decimal string to a numeric value.
    TextToNumber,
    /// Explicit value correspondence (enum labels, status codes).
    ValueMap(Vec<ValueMapEntry>),
}

/// One entry of a [`Coercion::ValueMap`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueMapEntry {
    /// Primary-side value.
    pub primary: Value,
    /// Secondary-side value.
    pub secondary: Value,
}

impl Coercion {
    /// Returns the coercion for the opposite direction.
    pub fn invert(&self) -> Coercion {
        match self {
            Coercion::Identity => Coercion::Identity,
            Coercion::LocalDateTimeToRfc3339 => Coercion::Rfc3339ToLocalDateTime,
            Coercion::Rfc3339ToLocalDateTime => Coercion::LocalDateTimeToRfc3339,
            Coercion::BoolToInt => Coercion::IntToBool,
            Coercion::IntToBool => Coercion::BoolToInt,
            Coercion::NumberToText => Coercion::TextToNumber,
            Coercion::TextToNumber => Coercion::NumberToText,
            Coercion::ValueMap(entries) => Coercion::ValueMap(
                entries
                    .iter()
                    .map(|e| ValueMapEntry {
                        primary: e.secondary.clone(),
                        secondary: e.primary.clone(),
                    })
                    .collect(),
            ),
        }
    }

    /// Applies the coercion to one value.
    ///
    /// `Null` passes through every coercion unchanged. Errors carry a
    /// message only; the translator attaches the column name.
    pub fn apply(&self, value: &Value) -> Result<Value, String> {
        if value.is_null() {
            return Ok(Value::Null);
        }

        match self {
            Coercion::Identity => Ok(value.clone()),

            Coercion::LocalDateTimeToRfc3339 => {
                let text = value
                    .as_str()
                    .ok_or_else(|| format!("expected datetime string, got {value}"))?;
                let naive = parse_local_datetime(text)?;
                let utc: DateTime<Utc> = Utc.from_utc_datetime(&naive);
                Ok(Value::String(
                    utc.to_rfc3339_opts(SecondsFormat::Secs, true),
                ))
            }

            Coercion::Rfc3339ToLocalDateTime => {
                let text = value
                    .as_str()
                    .ok_or_else(|| format!("expected datetime string, got {value}"))?;
                let parsed = DateTime::parse_from_rfc3339(text)
                    .map_err(|e| format!("not an RFC 3339 timestamp: {e}"))?;
                Ok(Value::String(
                    parsed
                        .with_timezone(&Utc)
                        .naive_utc()
                        .format("%Y-%m-%d %H:%M:%S")
                        .to_string(),
                ))
            }

            Coercion::BoolToInt => {
                let flag = value
                    .as_bool()
                    .ok_or_else(|| format!("expected boolean, got {value}"))?;
                Ok(Value::from(if flag { 1 } else { 0 }))
            }

            Coercion::IntToBool => match value.as_i64() {
                Some(0) => Ok(Value::Bool(false)),
                Some(1) => Ok(Value::Bool(true)),
                _ => Err(format!("expected 0 or 1, got {value}")),
            },

            Coercion::NumberToText => {
                if value.is_number() {
                    Ok(Value::String(value.to_string()))
                } else {
                    Err(format!("expected number, got {value}"))
                }
            }

            Coercion::TextToNumber => {
                let text = value
                    .as_str()
                    .ok_or_else(|| format!("expected numeric string, got {value}"))?;
                if let Ok(int) = text.parse::<i64>() {
                    return Ok(Value::from(int));
                }
                let float = text
                    .parse::<f64>()
                    .map_err(|_| format!("not a number: {text:?}"))?;
                serde_json::Number::from_f64(float)
                    .map(Value::Number)
                    .ok_or_else(|| format!("not a finite number: {text:?}"))
            }

            Coercion::ValueMap(entries) => entries
                .iter()
                .find(|e| e.primary == *value)
                .map(|e| e.secondary.clone())
                .ok_or_else(|| format!("no value mapping for {value}")),
        }
    }
}

fn parse_local_datetime(text: &str) -> Result<NaiveDateTime, String> {
    NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S")
        .or_else(|_| NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f"))
        .map_err(|e| format!("not a local datetime: {e}"))
}

/// How primary keys correspond across the two stores.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStrategy {
    /// Both stores use the same natural key value.
    Shared,
    /// Surrogate keys differ; correspondence lives in the cross-reference
    /// map, created as rows first synchronize.
    #[default]
    CrossReference,
}

/// Key correspondence for one table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyMapping {
    /// Primary-side key column.
    pub primary_column: String,
    /// Secondary-side key column.
    pub secondary_column: String,
    /// Correspondence strategy.
    #[serde(default)]
    pub strategy: KeyStrategy,
}

impl KeyMapping {
    /// Shared natural key.
    pub fn shared(primary: impl Into<String>, secondary: impl Into<String>) -> Self {
        Self {
            primary_column: primary.into(),
            secondary_column: secondary.into(),
            strategy: KeyStrategy::Shared,
        }
    }

    /// Cross-referenced surrogate keys.
    pub fn cross_reference(primary: impl Into<String>, secondary: impl Into<String>) -> Self {
        Self {
            primary_column: primary.into(),
            secondary_column: secondary.into(),
            strategy: KeyStrategy::CrossReference,
        }
    }
}

/// Rename/coercion rule for one column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnMapping {
    /// Primary-side column name.
    pub primary: String,
    /// Secondary-side column name.
    pub secondary: String,
    /// Coercion, declared primary → secondary.
    #[serde(default)]
    pub coercion: Coercion,
}

/// A foreign-key column whose values are keys of another mapped table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceMapping {
    /// Primary-side column name.
    pub primary_column: String,
    /// Secondary-side column name.
    pub secondary_column: String,
    /// Primary-side name of the referenced table.
    pub table: String,
}

/// Translation rules for one table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableMapping {
    /// Primary-side table name.
    pub primary_table: String,
    /// Secondary-side table name.
    pub secondary_table: String,
    /// Key correspondence.
    pub key: KeyMapping,
    /// Column rules. Columns absent here (and not skipped) fail translation.
    #[serde(default)]
    pub columns: Vec<ColumnMapping>,
    /// Foreign-key columns resolved through the cross-reference map.
    #[serde(default)]
    pub references: Vec<ReferenceMapping>,
    /// Primary-side columns that never synchronize.
    #[serde(default)]
    pub skip_primary: Vec<String>,
    /// Secondary-side columns that never synchronize.
    #[serde(default)]
    pub skip_secondary: Vec<String>,
    /// Primary-side column carrying the row's last-modified time, used as
    /// the last-writer-wins guard. Must also appear in `columns`.
    #[serde(default)]
    pub timestamp_guard: Option<String>,
}

impl TableMapping {
    /// Creates a mapping with no column rules.
    pub fn new(
        primary_table: impl Into<String>,
        secondary_table: impl Into<String>,
        key: KeyMapping,
    ) -> Self {
        Self {
            primary_table: primary_table.into(),
            secondary_table: secondary_table.into(),
            key,
            columns: Vec::new(),
            references: Vec::new(),
            skip_primary: Vec::new(),
            skip_secondary: Vec::new(),
            timestamp_guard: None,
        }
    }

    /// Adds a column rule.
    pub fn with_column(
        mut self,
        primary: impl Into<String>,
        secondary: impl Into<String>,
        coercion: Coercion,
    ) -> Self {
        self.columns.push(ColumnMapping {
            primary: primary.into(),
            secondary: secondary.into(),
            coercion,
        });
        self
    }

    /// Adds a foreign-key rule.
    pub fn with_reference(
        mut self,
        primary_column: impl Into<String>,
        secondary_column: impl Into<String>,
        table: impl Into<String>,
    ) -> Self {
        self.references.push(ReferenceMapping {
            primary_column: primary_column.into(),
            secondary_column: secondary_column.into(),
            table: table.into(),
        });
        self
    }

    /// Marks a primary-side column as never synchronized.
    pub fn with_skip_primary(mut self, column: impl Into<String>) -> Self {
        self.skip_primary.push(column.into());
        self
    }

    /// Marks a secondary-side column as never synchronized.
    pub fn with_skip_secondary(mut self, column: impl Into<String>) -> Self {
        self.skip_secondary.push(column.into());
        self
    }

    /// Sets the last-writer-wins guard column (primary-side name).
    pub fn with_timestamp_guard(mut self, column: impl Into<String>) -> Self {
        self.timestamp_guard = Some(column.into());
        self
    }

    /// Finds the rule for a primary-side column.
    pub fn column_for_primary(&self, name: &str) -> Option<&ColumnMapping> {
        self.columns.iter().find(|c| c.primary == name)
    }

    /// Finds the rule for a secondary-side column.
    pub fn column_for_secondary(&self, name: &str) -> Option<&ColumnMapping> {
        self.columns.iter().find(|c| c.secondary == name)
    }

    /// Finds the foreign-key rule for a primary-side column.
    pub fn reference_for_primary(&self, name: &str) -> Option<&ReferenceMapping> {
        self.references.iter().find(|r| r.primary_column == name)
    }

    /// Finds the foreign-key rule for a secondary-side column.
    pub fn reference_for_secondary(&self, name: &str) -> Option<&ReferenceMapping> {
        self.references.iter().find(|r| r.secondary_column == name)
    }

    /// Secondary-side name of the guard column, when configured.
    pub fn secondary_guard_column(&self) -> Option<&str> {
        let guard = self.timestamp_guard.as_deref()?;
        self.column_for_primary(guard).map(|c| c.secondary.as_str())
    }
}

/// The full set of table mappings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MappingCatalog {
    /// Per-table rules.
    #[serde(rename = "table", default)]
    pub tables: Vec<TableMapping>,
}

impl MappingCatalog {
    /// Creates a catalog from table mappings, validating consistency.
    pub fn new(tables: Vec<TableMapping>) -> Result<Self, SyncError> {
        let catalog = Self { tables };
        catalog.validate()?;
        Ok(catalog)
    }

    /// Parses a catalog from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self, SyncError> {
        let catalog: MappingCatalog =
            toml::from_str(text).map_err(|e| SyncError::Config(format!("mapping catalog: {e}")))?;
        catalog.validate()?;
        Ok(catalog)
    }

    /// Loads a catalog from a TOML file.
    pub fn load(path: &std::path::Path) -> Result<Self, SyncError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| SyncError::Config(format!("read {}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    /// Finds the mapping whose primary-side table matches.
    pub fn table_by_primary(&self, table: &str) -> Option<&TableMapping> {
        self.tables.iter().find(|t| t.primary_table == table)
    }

    /// Finds the mapping whose secondary-side table matches.
    pub fn table_by_secondary(&self, table: &str) -> Option<&TableMapping> {
        self.tables.iter().find(|t| t.secondary_table == table)
    }

    fn validate(&self) -> Result<(), SyncError> {
        let mut seen = std::collections::HashSet::new();
        for table in &self.tables {
            if !seen.insert(table.primary_table.as_str()) {
                return Err(SyncError::Config(format!(
                    "duplicate mapping for table {}",
                    table.primary_table
                )));
            }
            for column in &table.columns {
                let count = table
                    .columns
                    .iter()
                    .filter(|c| c.primary == column.primary)
                    .count();
                if count > 1 {
                    return Err(SyncError::Config(format!(
                        "column {}.{} mapped more than once",
                        table.primary_table, column.primary
                    )));
                }
            }
            for reference in &table.references {
                if self.table_by_primary(&reference.table).is_none() {
                    return Err(SyncError::Config(format!(
                        "{}.{} references unmapped table {}",
                        table.primary_table, reference.primary_column, reference.table
                    )));
                }
            }
            if let Some(guard) = &table.timestamp_guard {
                if table.column_for_primary(guard).is_none() {
                    return Err(SyncError::Config(format!(
                        "timestamp guard {}.{} is not a mapped column",
                        table.primary_table, guard
                    )));
                }
            }
        }
        Ok(())
    }
}
