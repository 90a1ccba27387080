//! Hybrid retrieval over the vector and lexical indexes, plus the ingestion
//! path that keeps both in step.

pub mod ingest;
pub mod retriever;
pub mod scoring;

pub use ingest::{IngestReport, Ingestor};
pub use retriever::Retriever;
