//! Table-to-relationship mapping configuration.
//!
//! A mapping file is a JSON array of [`TableMapping`] entries describing how
//! rows of each table project into SpiceDB relationships. Before the
//! replication stream can be interpreted the name-based mappings are resolved
//! against the reflected schema into [`InternalTableMapping`]s keyed by table
//! OID and 1-based column ordinals (see
//! [`Schema::resolve`](crate::postgres::schema::Schema::resolve)).

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::Result;

/// Maps the name of a table to a set of configs for transforming its rows
/// into relationships.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableMapping {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub relationships: Vec<RowMapping>,
}

/// Configures how to transform a row into a relationship.
///
/// Multi-column id lists produce underscore-joined object ids, in the
/// configured column order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowMapping {
    pub resource_type: String,
    pub subject_type: String,
    pub relation: String,
    pub resource_id_cols: Vec<String>,
    pub subject_id_cols: Vec<String>,
}

/// A [`TableMapping`] with the table name replaced by its postgres OID, so it
/// can be matched against replication messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InternalTableMapping {
    pub table_id: u32,
    pub row_mappings: Vec<InternalRowMapping>,
}

/// A [`RowMapping`] with column names replaced by 1-based column ordinals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InternalRowMapping {
    pub resource_type: String,
    pub subject_type: String,
    pub relation: String,
    pub resource_id_cols: Vec<usize>,
    pub subject_id_cols: Vec<usize>,
}

/// Loads a mapping file.
pub async fn load(path: impl AsRef<Path>) -> Result<Vec<TableMapping>> {
    let contents = tokio::fs::read_to_string(path.as_ref()).await?;
    let mappings = serde_json::from_str(&contents)?;
    Ok(mappings)
}
