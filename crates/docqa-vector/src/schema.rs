use arrow_schema::{DataType, Field, Schema};
use std::sync::Arc;

/// Row layout of the persisted chunk table. The vector width is fixed per
/// table and equals the embedder dimension.
pub fn build_chunk_schema(dim: usize) -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("chunk_id", DataType::Utf8, false),
        Field::new("document_id", DataType::Utf8, false),
        Field::new("subject", DataType::Utf8, false),
        Field::new("module", DataType::Utf8, false),
        Field::new("filename", DataType::Utf8, false),
        Field::new("page", DataType::UInt32, false),
        Field::new("start_offset", DataType::UInt64, false),
        Field::new("end_offset", DataType::UInt64, false),
        Field::new("text", DataType::Utf8, false),
        Field::new(
            "vector",
            DataType::FixedSizeList(Arc::new(Field::new("item", DataType::Float32, true)), dim as i32),
            true,
        ),
    ]))
}
