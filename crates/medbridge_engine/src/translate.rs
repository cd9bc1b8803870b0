//! Translation of captured events into target-store statements.

use crate::error::{MappingError, SyncError, SyncResult};
use crate::mapping::{Coercion, KeyStrategy, MappingCatalog, TableMapping};
use async_trait::async_trait;
use medbridge_protocol::{ChangeEvent, ChangeOp, Direction, RowImage, Statement, WriteGuard};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Lookup into the cross-reference key map.
///
/// Both lookups are keyed by the primary-side table name; the map itself is
/// maintained by the processors as rows first synchronize.
#[async_trait]
pub trait KeyResolver: Send + Sync {
    /// Returns the secondary-store key mapped to a primary-store key.
    async fn secondary_key(&self, table: &str, primary_key: &Value) -> SyncResult<Option<Value>>;

    /// Returns the primary-store key mapped to a secondary-store key.
    async fn primary_key(&self, table: &str, secondary_key: &Value) -> SyncResult<Option<Value>>;
}

/// Renders a key value as canonical JSON text for map storage.
pub(crate) fn canonical_key(value: &Value) -> String {
    value.to_string()
}

/// Renders a key value for display and outbox grouping.
pub fn key_display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Translates change events into statements for the opposite store.
///
/// Pure over the mapping catalog apart from cross-reference lookups through
/// the provided [`KeyResolver`].
#[derive(Clone)]
pub struct Translator {
    catalog: Arc<MappingCatalog>,
}

/// Per-direction view over a table mapping: resolves source-side names to
/// target-side names and flips coercions for inbound events.
struct DirectedTable<'a> {
    table: &'a TableMapping,
    direction: Direction,
}

impl<'a> DirectedTable<'a> {
    fn target_table(&self) -> &'a str {
        match self.direction {
            Direction::Outbound => &self.table.secondary_table,
            Direction::Inbound => &self.table.primary_table,
        }
    }

    fn source_key_column(&self) -> &'a str {
        match self.direction {
            Direction::Outbound => &self.table.key.primary_column,
            Direction::Inbound => &self.table.key.secondary_column,
        }
    }

    fn target_key_column(&self) -> &'a str {
        match self.direction {
            Direction::Outbound => &self.table.key.secondary_column,
            Direction::Inbound => &self.table.key.primary_column,
        }
    }

    fn skipped(&self, source_column: &str) -> bool {
        let skips = match self.direction {
            Direction::Outbound => &self.table.skip_primary,
            Direction::Inbound => &self.table.skip_secondary,
        };
        skips.iter().any(|c| c == source_column)
    }

    /// Returns (target column name, coercion in source → target direction).
    fn column(&self, source_column: &str) -> Option<(&'a str, Coercion)> {
        match self.direction {
            Direction::Outbound => self
                .table
                .column_for_primary(source_column)
                .map(|c| (c.secondary.as_str(), c.coercion.clone())),
            Direction::Inbound => self
                .table
                .column_for_secondary(source_column)
                .map(|c| (c.primary.as_str(), c.coercion.invert())),
        }
    }

    /// Returns (referenced primary-side table, target column name).
    fn reference(&self, source_column: &str) -> Option<(&'a str, &'a str)> {
        match self.direction {
            Direction::Outbound => self
                .table
                .reference_for_primary(source_column)
                .map(|r| (r.table.as_str(), r.secondary_column.as_str())),
            Direction::Inbound => self
                .table
                .reference_for_secondary(source_column)
                .map(|r| (r.table.as_str(), r.primary_column.as_str())),
        }
    }

    fn guard_column(&self) -> Option<&'a str> {
        match self.direction {
            Direction::Outbound => self.table.secondary_guard_column(),
            Direction::Inbound => self.table.timestamp_guard.as_deref(),
        }
    }
}

impl Translator {
    /// Creates a translator over a catalog.
    pub fn new(catalog: Arc<MappingCatalog>) -> Self {
        Self { catalog }
    }

    /// The catalog this translator works from.
    pub fn catalog(&self) -> &MappingCatalog {
        &self.catalog
    }

    fn directed(&self, event: &ChangeEvent, direction: Direction) -> Result<DirectedTable<'_>, MappingError> {
        let table = match direction {
            Direction::Outbound => self.catalog.table_by_primary(&event.table),
            Direction::Inbound => self.catalog.table_by_secondary(&event.table),
        };
        table
            .map(|table| DirectedTable { table, direction })
            .ok_or_else(|| MappingError::UnknownTable(event.table.clone()))
    }

    /// Extracts the source-side key value from an event.
    ///
    /// Deletes may carry the key only in `old_record`.
    pub fn source_key(
        &self,
        event: &ChangeEvent,
        direction: Direction,
    ) -> Result<Value, MappingError> {
        let view = self.directed(event, direction)?;
        let column = view.source_key_column();
        event
            .record
            .get(column)
            .or_else(|| event.old_record.as_ref().and_then(|old| old.get(column)))
            .filter(|v| !v.is_null())
            .cloned()
            .ok_or_else(|| MappingError::MissingKey {
                table: event.table.clone(),
                column: column.to_string(),
            })
    }

    /// Returns the key strategy configured for the event's table.
    pub fn key_strategy(
        &self,
        event: &ChangeEvent,
        direction: Direction,
    ) -> Result<KeyStrategy, MappingError> {
        Ok(self.directed(event, direction)?.table.key.strategy)
    }

    /// Translates an event into a statement for the opposite store.
    ///
    /// Fails with [`MappingError::UnknownTable`]/[`MappingError::UnknownColumn`]
    /// when no rule covers the input, and with
    /// [`MappingError::UnresolvedReference`] when a key or foreign key has no
    /// cross-reference entry yet; the caller re-queues those.
    pub async fn to_target(
        &self,
        event: &ChangeEvent,
        direction: Direction,
        keys: &dyn KeyResolver,
    ) -> SyncResult<Statement> {
        let view = self.directed(event, direction)?;
        let source_key = self.source_key(event, direction)?;

        let target_key = match view.table.key.strategy {
            KeyStrategy::Shared => Some(source_key.clone()),
            KeyStrategy::CrossReference => {
                self.resolve_key(&view.table.primary_table, &source_key, direction, keys)
                    .await?
            }
        };

        if event.op == ChangeOp::Delete {
            let key = target_key.ok_or_else(|| MappingError::UnresolvedReference {
                table: event.table.clone(),
                column: view.source_key_column().to_string(),
                value: key_display(&source_key),
            })?;
            return Ok(Statement::Delete {
                table: view.target_table().to_string(),
                key_column: view.target_key_column().to_string(),
                key,
            });
        }

        let mut values = RowImage::new();
        for (name, value) in &event.record {
            if name == view.source_key_column() || view.skipped(name) {
                continue;
            }

            if let Some((referenced_table, target_column)) = view.reference(name) {
                let mapped = if value.is_null() {
                    Value::Null
                } else {
                    self.resolve_key(referenced_table, value, direction, keys)
                        .await?
                        .ok_or_else(|| MappingError::UnresolvedReference {
                            table: referenced_table.to_string(),
                            column: name.clone(),
                            value: key_display(value),
                        })?
                };
                values.insert(target_column.to_string(), mapped);
                continue;
            }

            if let Some((target_column, coercion)) = view.column(name) {
                let coerced =
                    coercion
                        .apply(value)
                        .map_err(|message| MappingError::Coercion {
                            column: name.clone(),
                            message,
                        })?;
                values.insert(target_column.to_string(), coerced);
                continue;
            }

            return Err(MappingError::UnknownColumn {
                table: event.table.clone(),
                column: name.clone(),
            }
            .into());
        }

        let guard = view.guard_column().map(|column| WriteGuard {
            column: column.to_string(),
            timestamp: event.timestamp,
        });

        Ok(Statement::Upsert {
            table: view.target_table().to_string(),
            key_column: view.target_key_column().to_string(),
            key: target_key,
            values,
            guard,
        })
    }

    /// Resolves a key through the cross-reference map, honoring the
    /// referenced table's own strategy.
    async fn resolve_key(
        &self,
        primary_table: &str,
        value: &Value,
        direction: Direction,
        keys: &dyn KeyResolver,
    ) -> SyncResult<Option<Value>> {
        let strategy = self
            .catalog
            .table_by_primary(primary_table)
            .map(|t| t.key.strategy)
            .unwrap_or(KeyStrategy::CrossReference);

        if strategy == KeyStrategy::Shared {
            return Ok(Some(value.clone()));
        }

        match direction {
            Direction::Outbound => keys.secondary_key(primary_table, value).await,
            Direction::Inbound => keys.primary_key(primary_table, value).await,
        }
    }
}

/// In-memory cross-reference map for tests.
#[derive(Default)]
pub struct MemoryKeyMap {
    forward: RwLock<HashMap<(String, String), Value>>,
    reverse: RwLock<HashMap<(String, String), Value>>,
}

impl MemoryKeyMap {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a key correspondence.
    pub fn put(&self, table: &str, primary: &Value, secondary: &Value) {
        self.forward.write().insert(
            (table.to_string(), canonical_key(primary)),
            secondary.clone(),
        );
        self.reverse.write().insert(
            (table.to_string(), canonical_key(secondary)),
            primary.clone(),
        );
    }
}

#[async_trait]
impl KeyResolver for MemoryKeyMap {
    async fn secondary_key(&self, table: &str, primary_key: &Value) -> SyncResult<Option<Value>> {
        Ok(self
            .forward
            .read()
            .get(&(table.to_string(), canonical_key(primary_key)))
            .cloned())
    }

    async fn primary_key(&self, table: &str, secondary_key: &Value) -> SyncResult<Option<Value>> {
        Ok(self
            .reverse
            .read()
            .get(&(table.to_string(), canonical_key(secondary_key)))
            .cloned())
    }
}
