//! Entity schema: the shape of the record store.
//!
//! A schema is a set of entity tables. Every table has an implicit string
//! primary key (`id`) plus a list of typed columns. The store materializes one
//! table per entity on every rebuild, and the indexing context validates
//! writes against it.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::IndexerError;

/// Column value types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    String,
    Int,
    BigInt,
    Float,
    Boolean,
    Bytes,
    Json,
}

impl ColumnType {
    /// Returns `true` if `value` is representable as this column type.
    ///
    /// `BigInt` accepts decimal strings as well as JSON numbers since
    /// 256-bit values don't fit a JSON number.
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Int => value.is_i64() || value.is_u64(),
            Self::BigInt => {
                value.is_i64()
                    || value.is_u64()
                    || value
                        .as_str()
                        .map(|s| {
                            let digits = s.strip_prefix('-').unwrap_or(s);
                            !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit())
                        })
                        .unwrap_or(false)
            }
            Self::Float => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Bytes => value
                .as_str()
                .map(|s| s.starts_with("0x") && s[2..].chars().all(|c| c.is_ascii_hexdigit()))
                .unwrap_or(false),
            Self::Json => true,
        }
    }
}

/// A single column of an entity table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ColumnType,
    #[serde(default)]
    pub optional: bool,
}

/// An entity table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Table {
    pub columns: Vec<Column>,
}

impl Table {
    pub fn column(mut self, name: impl Into<String>, kind: ColumnType) -> Self {
        self.columns.push(Column {
            name: name.into(),
            kind,
            optional: false,
        });
        self
    }

    pub fn optional_column(mut self, name: impl Into<String>, kind: ColumnType) -> Self {
        self.columns.push(Column {
            name: name.into(),
            kind,
            optional: true,
        });
        self
    }
}

/// The full entity schema.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    pub tables: BTreeMap<String, Table>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or replace) an entity table.
    pub fn table(mut self, name: impl Into<String>, table: Table) -> Self {
        self.tables.insert(name.into(), table);
        self
    }

    pub fn entity_names(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }

    /// Look up an entity table, failing on unknown names.
    pub fn get(&self, entity: &str) -> Result<&Table, IndexerError> {
        self.tables
            .get(entity)
            .ok_or_else(|| IndexerError::Schema(format!("unknown entity '{entity}'")))
    }

    /// Validate a full record for `create`: every required column present,
    /// every present column well-typed, no unknown columns.
    pub fn validate_record(&self, entity: &str, data: &Value) -> Result<(), IndexerError> {
        let table = self.get(entity)?;
        let obj = as_object(entity, data)?;
        for col in &table.columns {
            match obj.get(&col.name) {
                None | Some(Value::Null) if col.optional => {}
                None | Some(Value::Null) => {
                    return Err(IndexerError::Schema(format!(
                        "{entity}.{} is required",
                        col.name
                    )))
                }
                Some(v) => check_column(entity, col, v)?,
            }
        }
        check_unknown(entity, table, obj)
    }

    /// Validate a partial record for `update`: present columns well-typed,
    /// required columns not nulled out, no unknown columns.
    pub fn validate_patch(&self, entity: &str, patch: &Value) -> Result<(), IndexerError> {
        let table = self.get(entity)?;
        let obj = as_object(entity, patch)?;
        for col in &table.columns {
            match obj.get(&col.name) {
                None => {}
                Some(Value::Null) if col.optional => {}
                Some(Value::Null) => {
                    return Err(IndexerError::Schema(format!(
                        "{entity}.{} cannot be null",
                        col.name
                    )))
                }
                Some(v) => check_column(entity, col, v)?,
            }
        }
        check_unknown(entity, table, obj)
    }
}

fn as_object<'a>(
    entity: &str,
    data: &'a Value,
) -> Result<&'a serde_json::Map<String, Value>, IndexerError> {
    data.as_object()
        .ok_or_else(|| IndexerError::Schema(format!("{entity} record must be a JSON object")))
}

fn check_column(entity: &str, col: &Column, value: &Value) -> Result<(), IndexerError> {
    if col.kind.accepts(value) {
        Ok(())
    } else {
        Err(IndexerError::Schema(format!(
            "{entity}.{} expects {:?}, got {value}",
            col.name, col.kind
        )))
    }
}

fn check_unknown(
    entity: &str,
    table: &Table,
    obj: &serde_json::Map<String, Value>,
) -> Result<(), IndexerError> {
    match obj
        .keys()
        .find(|k| k.as_str() != "id" && !table.columns.iter().any(|c| &c.name == *k))
    {
        Some(k) => Err(IndexerError::Schema(format!("{entity} has no column '{k}'"))),
        None => Ok(()),
    }
}
