//! Catalogue reflection.
//!
//! Produces a [`Schema`]: the user-visible tables (columns with 1-based
//! ordinals, primary keys, foreign keys) together with the WAL position
//! captured on the same session, so follow mode can replay from a point
//! consistent with the observed catalogue state.

use postgres_protocol::escape::escape_literal;
use std::collections::{HashMap, HashSet};
use tracing::warn;

use super::connection::ReplicationConnection;
use super::lsn::Lsn;
use crate::mapping::{InternalRowMapping, InternalTableMapping, RowMapping, TableMapping};
use crate::{Error, Result};

const QUERY_SELECT_TABLES: &str = "\
SELECT c.OID,s.table_name
FROM   information_schema.Tables s
JOIN   pg_class c ON s.table_name=c.relname
WHERE  s.table_schema != 'information_schema'
AND    s.table_schema != 'pg_catalog';";

const QUERY_SELECT_FOREIGN_KEYS: &str = "\
SELECT   string_agg(kcu.column_name, ',') AS fk_columns,
         string_agg(a.attnum::text, ',') AS fk_column_nums,
         kcu.constraint_name AS constraint_name,
         kcu.table_name AS foreign_table,
         rel_tco.table_name AS primary_table
FROM     information_schema.table_constraints tco
JOIN     information_schema.key_column_usage kcu
            ON tco.constraint_schema = kcu.constraint_schema
           AND tco.constraint_name   = kcu.constraint_name
JOIN     information_schema.referential_constraints rco
            ON tco.constraint_schema = rco.constraint_schema
           AND tco.constraint_name   = rco.constraint_name
JOIN     information_schema.table_constraints rel_tco
            ON rco.unique_constraint_schema = rel_tco.constraint_schema
           AND rco.unique_constraint_name   = rel_tco.constraint_name
JOIN     pg_class c
           ON c.relname = kcu.table_name
JOIN     pg_attribute a
           ON a.attrelid = c.OID
           AND a.attname = kcu.column_name
WHERE    tco.constraint_type = 'FOREIGN KEY'
GROUP BY kcu.table_schema,
         kcu.table_name,
         rel_tco.table_name,
         rel_tco.table_schema,
         kcu.constraint_name
ORDER BY kcu.table_schema,
         kcu.table_name;";

// the replication session only speaks the simple protocol, so per-table
// queries inline their parameter as an escaped literal
fn query_select_columns(table: &str) -> String {
    format!(
        "SELECT DISTINCT attname,attnum
FROM  pg_attribute,pg_class
WHERE attrelid = pg_class.oid
AND   pg_class.relname={};",
        escape_literal(table)
    )
}

fn query_select_primary_keys(table: &str) -> String {
    format!(
        "SELECT a.attnum,a.attname
FROM   pg_index i
JOIN   pg_attribute a ON a.attrelid = i.indrelid
                     AND a.attnum   = ANY(i.indkey)
WHERE  i.indrelid = {}::regclass
AND    i.indisprimary;",
        escape_literal(table)
    )
}

/// An immutable snapshot of the user schema and the WAL position at which it
/// was read.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    pub tables: Vec<Table>,
    pub xlog_pos: Lsn,
}

/// One user table with its column ordinals and key constraints.
#[derive(Debug, Clone)]
pub struct Table {
    /// The postgres OID identifying the table on the replication stream.
    pub id: u32,
    pub name: String,
    pub primary_keys: Vec<Column>,
    pub cols: Vec<Column>,
    pub foreign_keys: Vec<ForeignKey>,
}

/// A column name and its 1-based ordinal (attnum).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub ordinal: usize,
}

/// A foreign key: the columns `cols` on `foreign_table` reference the
/// primary key of `primary_table`. `col_ids` holds the matching ordinals.
#[derive(Debug, Clone)]
pub struct ForeignKey {
    pub name: String,
    pub cols: Vec<String>,
    pub col_ids: Vec<usize>,
    pub foreign_table: String,
    pub primary_table: String,
}

/// Reads the full user schema (excluding `information_schema` and
/// `pg_catalog`) and the current WAL position in a single transaction on the
/// given replication session.
///
/// When `included_tables` is non-empty it acts as an allow-list; any listed
/// table missing from the database is a fatal schema mismatch. Partial
/// schemas are never returned.
pub async fn reflect(conn: &ReplicationConnection, included_tables: &[&str]) -> Result<Schema> {
    if !conn.is_replication() {
        return Err(Error::Config(
            "schema reflection requires a replication session".to_string(),
        ));
    }

    conn.simple_query("BEGIN").await?;
    let result = reflect_in_tx(conn, included_tables).await;
    match &result {
        Ok(_) => {
            conn.simple_query("COMMIT").await?;
        }
        Err(_) => {
            // read-only transaction; nothing to keep
            let _ = conn.simple_query("ROLLBACK").await;
        }
    }
    result
}

async fn reflect_in_tx(conn: &ReplicationConnection, included_tables: &[&str]) -> Result<Schema> {
    let mut tables = read_tables(conn, included_tables).await?;

    for table in &mut tables {
        table.primary_keys = read_primary_keys(conn, &table.name).await?;
        table.cols = read_columns(conn, &table.name).await?;
    }

    let mut foreign_keys = read_foreign_keys(conn).await?;
    for table in &mut tables {
        if let Some(keys) = foreign_keys.remove(&table.name) {
            table.foreign_keys = keys;
        }
    }

    // same session, same transaction: the position is consistent with the
    // catalogue reads above
    let info = conn.identify_system().await?;

    Ok(Schema {
        tables,
        xlog_pos: info.xlog_pos,
    })
}

async fn read_tables(conn: &ReplicationConnection, included_tables: &[&str]) -> Result<Vec<Table>> {
    let mut expected: HashSet<&str> = included_tables.iter().copied().collect();
    let rows = conn.simple_query(QUERY_SELECT_TABLES).await?;

    let mut tables = Vec::new();
    for row in rows {
        let oid = column_text(&row, "oid")?;
        let name = column_text(&row, "table_name")?;
        if !included_tables.is_empty() && !expected.remove(name) {
            continue;
        }
        let id = oid
            .parse::<u32>()
            .map_err(|_| Error::Protocol(format!("invalid table oid: {oid}")))?;
        tables.push(Table {
            id,
            name: name.to_string(),
            primary_keys: Vec::new(),
            cols: Vec::new(),
            foreign_keys: Vec::new(),
        });
    }

    if !expected.is_empty() {
        let mut missing: Vec<&str> = expected.into_iter().collect();
        missing.sort_unstable();
        return Err(Error::SchemaMismatch(format!(
            "not all expected tables found in remote schema, missing: {}",
            missing.join(", ")
        )));
    }
    Ok(tables)
}

async fn read_columns(conn: &ReplicationConnection, table: &str) -> Result<Vec<Column>> {
    let rows = conn.simple_query(&query_select_columns(table)).await?;
    let mut cols = Vec::with_capacity(rows.len());
    for row in rows {
        let name = column_text(&row, "attname")?;
        let ordinal = parse_ordinal(column_text(&row, "attnum")?)?;
        // system columns (ctid, xmin, ...) carry non-positive attnums
        if let Some(ordinal) = ordinal {
            cols.push(Column {
                name: name.to_string(),
                ordinal,
            });
        }
    }
    Ok(cols)
}

async fn read_primary_keys(conn: &ReplicationConnection, table: &str) -> Result<Vec<Column>> {
    let rows = conn.simple_query(&query_select_primary_keys(table)).await?;
    let mut keys = Vec::with_capacity(rows.len());
    for row in rows {
        let ordinal = parse_ordinal(column_text(&row, "attnum")?)?;
        let name = column_text(&row, "attname")?;
        if let Some(ordinal) = ordinal {
            keys.push(Column {
                name: name.to_string(),
                ordinal,
            });
        }
    }
    Ok(keys)
}

async fn read_foreign_keys(
    conn: &ReplicationConnection,
) -> Result<HashMap<String, Vec<ForeignKey>>> {
    let rows = conn.simple_query(QUERY_SELECT_FOREIGN_KEYS).await?;
    let mut foreign_keys: HashMap<String, Vec<ForeignKey>> = HashMap::new();
    for row in rows {
        // columns within a constraint arrive comma-joined, in matching order
        let cols: Vec<String> = column_text(&row, "fk_columns")?
            .split(',')
            .map(str::to_string)
            .collect();
        let mut col_ids = Vec::with_capacity(cols.len());
        for num in column_text(&row, "fk_column_nums")?.split(',') {
            let ordinal = parse_ordinal(num)?.ok_or_else(|| {
                Error::Protocol(format!("non-positive foreign key column ordinal: {num}"))
            })?;
            col_ids.push(ordinal);
        }

        let fk = ForeignKey {
            name: column_text(&row, "constraint_name")?.to_string(),
            cols,
            col_ids,
            foreign_table: column_text(&row, "foreign_table")?.to_string(),
            primary_table: column_text(&row, "primary_table")?.to_string(),
        };
        foreign_keys.entry(fk.foreign_table.clone()).or_default().push(fk);
    }
    Ok(foreign_keys)
}

fn column_text<'a>(
    row: &'a tokio_postgres::SimpleQueryRow,
    column: &str,
) -> Result<&'a str> {
    row.try_get(column)?
        .ok_or_else(|| Error::Protocol(format!("catalogue row is missing column {column}")))
}

fn parse_ordinal(text: &str) -> Result<Option<usize>> {
    let value = text
        .parse::<i32>()
        .map_err(|_| Error::Protocol(format!("invalid column ordinal: {text}")))?;
    if value <= 0 {
        return Ok(None);
    }
    Ok(Some(value as usize))
}

impl Schema {
    pub fn table(&self, name: &str) -> Option<&Table> {
        self.tables.iter().find(|t| t.name == name)
    }

    /// Derives a provisional mapping from the reflected foreign keys: each
    /// constraint becomes a relation from the referencing table (keyed by its
    /// primary key) to the referenced table (keyed by the constraint's
    /// columns). A useful starting point for hand-written mapping configs.
    pub fn to_table_mapping(&self) -> Vec<TableMapping> {
        self.tables
            .iter()
            .map(|table| TableMapping {
                name: table.name.clone(),
                relationships: table
                    .foreign_keys
                    .iter()
                    .map(|fk| RowMapping {
                        resource_type: fk.foreign_table.clone(),
                        subject_type: fk.primary_table.clone(),
                        relation: fk.name.clone(),
                        resource_id_cols: table
                            .primary_keys
                            .iter()
                            .map(|col| col.name.clone())
                            .collect(),
                        subject_id_cols: fk.cols.clone(),
                    })
                    .collect(),
            })
            .collect()
    }

    /// Resolves name-based mappings against this schema, replacing table
    /// names with OIDs and column names with 1-based ordinals.
    ///
    /// A mapping that names a table absent from the schema is a fatal
    /// mismatch. Unknown column names are skipped with a warning.
    pub fn resolve(&self, mappings: &[TableMapping]) -> Result<Vec<InternalTableMapping>> {
        mappings
            .iter()
            .map(|mapping| {
                let table = self.table(&mapping.name).ok_or_else(|| {
                    Error::SchemaMismatch(format!(
                        "mapped table {} does not exist in the schema",
                        mapping.name
                    ))
                })?;
                let row_mappings = mapping
                    .relationships
                    .iter()
                    .map(|rm| InternalRowMapping {
                        resource_type: rm.resource_type.clone(),
                        subject_type: rm.subject_type.clone(),
                        relation: rm.relation.clone(),
                        resource_id_cols: resolve_columns(table, &rm.resource_id_cols),
                        subject_id_cols: resolve_columns(table, &rm.subject_id_cols),
                    })
                    .collect();
                Ok(InternalTableMapping {
                    table_id: table.id,
                    row_mappings,
                })
            })
            .collect()
    }
}

fn resolve_columns(table: &Table, names: &[String]) -> Vec<usize> {
    let mut ordinals = Vec::with_capacity(names.len());
    for name in names {
        match table.cols.iter().find(|col| &col.name == name) {
            Some(col) => ordinals.push(col.ordinal),
            None => warn!(
                table = %table.name,
                column = %name,
                "mapped column not found in schema, skipping"
            ),
        }
    }
    ordinals
}

#[cfg(test)]
mod tests {
    use super::*;

    fn join_table_schema() -> Schema {
        Schema {
            tables: vec![
                Table {
                    id: 101,
                    name: "article".to_string(),
                    primary_keys: vec![Column {
                        name: "id".to_string(),
                        ordinal: 1,
                    }],
                    cols: vec![
                        Column {
                            name: "id".to_string(),
                            ordinal: 1,
                        },
                        Column {
                            name: "title".to_string(),
                            ordinal: 2,
                        },
                    ],
                    foreign_keys: vec![],
                },
                Table {
                    id: 102,
                    name: "tag".to_string(),
                    primary_keys: vec![Column {
                        name: "id".to_string(),
                        ordinal: 1,
                    }],
                    cols: vec![Column {
                        name: "id".to_string(),
                        ordinal: 1,
                    }],
                    foreign_keys: vec![],
                },
                Table {
                    id: 103,
                    name: "article_tag".to_string(),
                    primary_keys: vec![
                        Column {
                            name: "article_id".to_string(),
                            ordinal: 1,
                        },
                        Column {
                            name: "tag_id".to_string(),
                            ordinal: 2,
                        },
                    ],
                    cols: vec![
                        Column {
                            name: "article_id".to_string(),
                            ordinal: 1,
                        },
                        Column {
                            name: "tag_id".to_string(),
                            ordinal: 2,
                        },
                    ],
                    foreign_keys: vec![
                        ForeignKey {
                            name: "fk_article".to_string(),
                            cols: vec!["article_id".to_string()],
                            col_ids: vec![1],
                            foreign_table: "article_tag".to_string(),
                            primary_table: "article".to_string(),
                        },
                        ForeignKey {
                            name: "fk_tag".to_string(),
                            cols: vec!["tag_id".to_string()],
                            col_ids: vec![2],
                            foreign_table: "article_tag".to_string(),
                            primary_table: "tag".to_string(),
                        },
                    ],
                },
            ],
            xlog_pos: Lsn(0x1634FA0),
        }
    }

    #[test]
    fn test_provisional_mapping_from_foreign_keys() {
        let schema = join_table_schema();
        let mappings = schema.to_table_mapping();

        let join = mappings
            .iter()
            .find(|m| m.name == "article_tag")
            .expect("join table mapping");
        assert_eq!(join.relationships.len(), 2);

        let fk_tag = join
            .relationships
            .iter()
            .find(|rm| rm.relation == "fk_tag")
            .unwrap();
        assert_eq!(fk_tag.resource_type, "article_tag");
        assert_eq!(fk_tag.subject_type, "tag");
        assert_eq!(fk_tag.resource_id_cols, vec!["article_id", "tag_id"]);
        assert_eq!(fk_tag.subject_id_cols, vec!["tag_id"]);
    }

    #[test]
    fn test_resolve_maps_names_to_ordinals() {
        let schema = join_table_schema();
        let mappings = vec![TableMapping {
            name: "article_tag".to_string(),
            relationships: vec![RowMapping {
                resource_type: "article".to_string(),
                subject_type: "tag".to_string(),
                relation: "tags".to_string(),
                resource_id_cols: vec!["article_id".to_string()],
                subject_id_cols: vec!["tag_id".to_string()],
            }],
        }];

        let internal = schema.resolve(&mappings).unwrap();
        assert_eq!(internal.len(), 1);
        assert_eq!(internal[0].table_id, 103);
        assert_eq!(internal[0].row_mappings[0].resource_id_cols, vec![1]);
        assert_eq!(internal[0].row_mappings[0].subject_id_cols, vec![2]);
    }

    #[test]
    fn test_resolve_unknown_table_is_fatal() {
        let schema = join_table_schema();
        let mappings = vec![TableMapping {
            name: "missing".to_string(),
            relationships: vec![],
        }];

        let err = schema.resolve(&mappings).unwrap_err();
        assert!(matches!(err, Error::SchemaMismatch(_)));
    }

    #[test]
    fn test_resolve_skips_unknown_columns() {
        let schema = join_table_schema();
        let mappings = vec![TableMapping {
            name: "article_tag".to_string(),
            relationships: vec![RowMapping {
                resource_type: "article".to_string(),
                subject_type: "tag".to_string(),
                relation: "tags".to_string(),
                resource_id_cols: vec!["article_id".to_string(), "nope".to_string()],
                subject_id_cols: vec!["tag_id".to_string()],
            }],
        }];

        let internal = schema.resolve(&mappings).unwrap();
        assert_eq!(internal[0].row_mappings[0].resource_id_cols, vec![1]);
    }

    #[test]
    fn test_derived_mapping_resolves_back_onto_schema() {
        let schema = join_table_schema();
        let derived = schema.to_table_mapping();

        let internal = schema.resolve(&derived).unwrap();
        for (mapping, resolved) in derived.iter().zip(&internal) {
            let table = schema.table(&mapping.name).unwrap();
            assert_eq!(resolved.table_id, table.id);
            for (rm, irm) in mapping.relationships.iter().zip(&resolved.row_mappings) {
                // every derived column name resolves to a real ordinal
                assert_eq!(irm.resource_id_cols.len(), rm.resource_id_cols.len());
                assert_eq!(irm.subject_id_cols.len(), rm.subject_id_cols.len());
                for ordinal in irm.resource_id_cols.iter().chain(&irm.subject_id_cols) {
                    assert!(table.cols.iter().any(|col| col.ordinal == *ordinal));
                }
            }
        }
    }
}
