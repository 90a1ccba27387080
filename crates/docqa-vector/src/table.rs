//! LanceDB connection and housekeeping helpers.
use anyhow::Result;
use arrow_array::RecordBatchIterator;
use lancedb::{connect, Connection};
use std::sync::Arc;

pub async fn open_db(uri: &str) -> Result<Connection> {
    Ok(connect(uri).execute().await?)
}

pub async fn ensure_table(conn: &Connection, name: &str, schema: Arc<arrow_schema::Schema>) -> Result<()> {
    let names = conn.table_names().execute().await?;
    if names.iter().any(|n| n == name) {
        return Ok(());
    }
    // create empty table with 0 rows
    let iter = RecordBatchIterator::new(vec![].into_iter(), schema.clone());
    conn.create_table(name, Box::new(iter)).execute().await?;
    Ok(())
}

/// `column = 'value'` with the value quoted for a Lance filter expression.
pub fn eq_predicate(column: &str, value: &str) -> String {
    format!("{} = '{}'", column, value.replace('\'', "''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn predicate_escapes_quotes() {
        assert_eq!(eq_predicate("document_id", "a/o'neil.pdf"), "document_id = 'a/o''neil.pdf'");
    }
}
