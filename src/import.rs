//! Backfill importer: sweeps the mapped tables once and emits one TOUCH per
//! row.

use tokio_postgres::Client;
use tracing::info;

use crate::mapping::{RowMapping, TableMapping};
use crate::relationship::{Operation, OperationType, Relationship};
use crate::sink::RelationshipSink;
use crate::Result;

/// Imports the current contents of the mapped tables into the sink.
pub struct Importer<'a> {
    client: &'a Client,
    sink: &'a dyn RelationshipSink,
    mappings: &'a [TableMapping],
}

impl<'a> Importer<'a> {
    pub fn new(
        client: &'a Client,
        sink: &'a dyn RelationshipSink,
        mappings: &'a [TableMapping],
    ) -> Self {
        Self {
            client,
            sink,
            mappings,
        }
    }

    /// Walks through each mapped table and writes its relationships. Any row
    /// scan error aborts the import.
    pub async fn import(&self) -> Result<()> {
        for mapping in self.mappings {
            info!(table = %mapping.name, "writing relationships");
            self.import_table(mapping).await?;
        }
        Ok(())
    }

    async fn import_table(&self, mapping: &TableMapping) -> Result<()> {
        for rm in &mapping.relationships {
            let updates = self.relationships_for(&mapping.name, rm).await?;
            self.sink.write(&updates).await?;
        }
        Ok(())
    }

    async fn relationships_for(&self, table: &str, rm: &RowMapping) -> Result<Vec<Operation>> {
        let query = projection_query(table, rm);
        let rows = self.client.query(query.as_str(), &[]).await?;

        let mut updates = Vec::with_capacity(rows.len());
        for row in rows {
            let resource_id: String = row.try_get(0)?;
            let subject_id: String = row.try_get(1)?;
            updates.push(Operation {
                op: OperationType::Touch,
                rel: Relationship {
                    resource_type: rm.resource_type.clone(),
                    resource_id,
                    relation: rm.relation.clone(),
                    subject_type: rm.subject_type.clone(),
                    subject_id,
                },
            });
        }
        Ok(updates)
    }
}

/// Builds the projection that concatenates the configured id columns.
/// Composite keys become underscore-joined strings in column order.
fn projection_query(table: &str, rm: &RowMapping) -> String {
    let resource_cols = cast_to_text(&rm.resource_id_cols);
    let subject_cols = cast_to_text(&rm.subject_id_cols);
    format!(
        "SELECT CONCAT_WS('_', {}), CONCAT_WS('_', {}) FROM {};",
        resource_cols.join(","),
        subject_cols.join(","),
        table
    )
}

fn cast_to_text(cols: &[String]) -> Vec<String> {
    cols.iter().map(|col| format!("{col}::text")).collect()
}
