//! Write-through persistence of chunk rows and vectors in a LanceDB table.
//!
//! The in-memory [`crate::VectorIndex`] stays the query path; this table lets
//! a later process reload the corpus without re-embedding.

use anyhow::{anyhow, Context, Result};
use arrow_array::cast::AsArray;
use arrow_array::types::Float32Type;
use arrow_array::{
    Array, FixedSizeListArray, RecordBatch, RecordBatchIterator, StringArray, UInt32Array, UInt64Array,
};
use futures::TryStreamExt;
use lancedb::query::ExecutableQuery;
use lancedb::Connection;
use std::sync::Arc;
use tracing::debug;

use docqa_core::types::Chunk;

use crate::schema::build_chunk_schema;
use crate::table::{ensure_table, eq_predicate, open_db};

pub struct LanceStore {
    conn: Connection,
    table_name: String,
    dim: usize,
}

impl LanceStore {
    pub async fn open(uri: &str, table_name: &str, dim: usize) -> Result<Self> {
        let conn = open_db(uri).await?;
        ensure_table(&conn, table_name, build_chunk_schema(dim)).await?;
        Ok(Self { conn, table_name: table_name.to_string(), dim })
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Delete every row of `document_id`, then append `rows`.
    pub async fn replace_document(&self, document_id: &str, rows: &[(Chunk, Vec<f32>)]) -> Result<()> {
        let tbl = self.conn.open_table(&self.table_name).execute().await?;
        tbl.delete(&eq_predicate("document_id", document_id)).await?;
        if rows.is_empty() {
            return Ok(());
        }
        let batch = self.rows_to_record_batch(rows)?;
        let schema = batch.schema();
        let reader = Box::new(RecordBatchIterator::new(vec![Ok(batch)].into_iter(), schema));
        tbl.add(reader).execute().await?;
        debug!(document_id, rows = rows.len(), table = %self.table_name, "persisted document");
        Ok(())
    }

    pub async fn delete_document(&self, document_id: &str) -> Result<()> {
        let tbl = self.conn.open_table(&self.table_name).execute().await?;
        tbl.delete(&eq_predicate("document_id", document_id)).await?;
        Ok(())
    }

    pub async fn clear(&self) -> Result<()> {
        let tbl = self.conn.open_table(&self.table_name).execute().await?;
        tbl.delete("chunk_id IS NOT NULL").await?;
        Ok(())
    }

    pub async fn load_all(&self) -> Result<Vec<(Chunk, Vec<f32>)>> {
        let tbl = self.conn.open_table(&self.table_name).execute().await?;
        let mut stream = tbl.query().execute().await?;
        let mut out = Vec::new();
        while let Some(batch) = stream.try_next().await? {
            decode_batch(&batch, &mut out)?;
        }
        Ok(out)
    }

    fn rows_to_record_batch(&self, rows: &[(Chunk, Vec<f32>)]) -> Result<RecordBatch> {
        let schema = build_chunk_schema(self.dim);
        let mut chunk_ids = Vec::with_capacity(rows.len());
        let mut document_ids = Vec::with_capacity(rows.len());
        let mut subjects = Vec::with_capacity(rows.len());
        let mut modules = Vec::with_capacity(rows.len());
        let mut filenames = Vec::with_capacity(rows.len());
        let mut pages = Vec::with_capacity(rows.len());
        let mut starts = Vec::with_capacity(rows.len());
        let mut ends = Vec::with_capacity(rows.len());
        let mut texts = Vec::with_capacity(rows.len());
        let mut vectors: Vec<Option<Vec<Option<f32>>>> = Vec::with_capacity(rows.len());
        for (chunk, vector) in rows {
            if vector.len() != self.dim {
                return Err(anyhow!("vector for {} has dim {}, table expects {}", chunk.chunk_id, vector.len(), self.dim));
            }
            chunk_ids.push(chunk.chunk_id.as_str());
            document_ids.push(chunk.document_id.as_str());
            subjects.push(chunk.subject.as_str());
            modules.push(chunk.module.as_str());
            filenames.push(chunk.filename.as_str());
            pages.push(chunk.page);
            starts.push(chunk.start_offset as u64);
            ends.push(chunk.end_offset as u64);
            texts.push(chunk.text.as_str());
            vectors.push(Some(vector.iter().map(|&x| Some(x)).collect()));
        }
        let record_batch = RecordBatch::try_new(
            schema,
            vec![
                Arc::new(StringArray::from(chunk_ids)),
                Arc::new(StringArray::from(document_ids)),
                Arc::new(StringArray::from(subjects)),
                Arc::new(StringArray::from(modules)),
                Arc::new(StringArray::from(filenames)),
                Arc::new(UInt32Array::from(pages)),
                Arc::new(UInt64Array::from(starts)),
                Arc::new(UInt64Array::from(ends)),
                Arc::new(StringArray::from(texts)),
                Arc::new(FixedSizeListArray::from_iter_primitive::<Float32Type, _, _>(
                    vectors.into_iter(),
                    self.dim as i32,
                )),
            ],
        )?;
        Ok(record_batch)
    }
}

fn string_col<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a StringArray> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<StringArray>())
        .ok_or_else(|| anyhow!("column {name} missing or not utf8"))
}

fn decode_batch(batch: &RecordBatch, out: &mut Vec<(Chunk, Vec<f32>)>) -> Result<()> {
    let chunk_ids = string_col(batch, "chunk_id")?;
    let document_ids = string_col(batch, "document_id")?;
    let subjects = string_col(batch, "subject")?;
    let modules = string_col(batch, "module")?;
    let filenames = string_col(batch, "filename")?;
    let texts = string_col(batch, "text")?;
    let pages = batch
        .column_by_name("page")
        .and_then(|c| c.as_any().downcast_ref::<UInt32Array>())
        .context("column page missing")?;
    let starts = batch
        .column_by_name("start_offset")
        .and_then(|c| c.as_any().downcast_ref::<UInt64Array>())
        .context("column start_offset missing")?;
    let ends = batch
        .column_by_name("end_offset")
        .and_then(|c| c.as_any().downcast_ref::<UInt64Array>())
        .context("column end_offset missing")?;
    let vectors = batch
        .column_by_name("vector")
        .and_then(|c| c.as_any().downcast_ref::<FixedSizeListArray>())
        .context("column vector missing")?;

    for i in 0..batch.num_rows() {
        if !vectors.is_valid(i) {
            continue;
        }
        let vector = vectors.value(i).as_primitive::<Float32Type>().values().to_vec();
        let chunk = Chunk {
            chunk_id: chunk_ids.value(i).to_string(),
            document_id: document_ids.value(i).to_string(),
            text: texts.value(i).to_string(),
            page: pages.value(i),
            start_offset: starts.value(i) as usize,
            end_offset: ends.value(i) as usize,
            subject: subjects.value(i).to_string(),
            module: modules.value(i).to_string(),
            filename: filenames.value(i).to_string(),
        };
        out.push((chunk, vector));
    }
    Ok(())
}
