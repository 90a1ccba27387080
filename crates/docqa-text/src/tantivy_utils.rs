use tantivy::schema::{Field, IndexRecordOption, Schema, TextFieldIndexing, TextOptions, STORED, STRING};
use tantivy::tokenizer::{LowerCaser, SimpleTokenizer, StopWordFilter, TextAnalyzer};
use tantivy::Index;

pub const TOKENIZER: &str = "text_with_stopwords";

#[derive(Debug, Clone, Copy)]
pub struct ChunkFields {
    pub chunk_id: Field,
    pub document_id: Field,
    pub subject: Field,
    pub module: Field,
    pub text: Field,
}

pub fn build_schema() -> Schema {
    let mut schema_builder = Schema::builder();
    schema_builder.add_text_field("chunk_id", STRING | STORED);
    schema_builder.add_text_field("document_id", STRING | STORED);
    schema_builder.add_text_field("subject", STRING | STORED);
    schema_builder.add_text_field("module", STRING | STORED);
    let text_field_indexing = TextFieldIndexing::default()
        .set_tokenizer(TOKENIZER)
        .set_index_option(IndexRecordOption::WithFreqsAndPositions);
    let text_options = TextOptions::default().set_indexing_options(text_field_indexing);
    schema_builder.add_text_field("text", text_options);
    schema_builder.build()
}

pub fn chunk_fields(schema: &Schema) -> tantivy::Result<ChunkFields> {
    Ok(ChunkFields {
        chunk_id: schema.get_field("chunk_id")?,
        document_id: schema.get_field("document_id")?,
        subject: schema.get_field("subject")?,
        module: schema.get_field("module")?,
        text: schema.get_field("text")?,
    })
}

pub fn register_tokenizer(index: &Index) {
    let stop_words = [
        "a", "an", "and", "are", "as", "at", "be", "by", "for", "from", "has", "he", "in", "is", "it", "its", "of",
        "on", "that", "the", "to", "was", "will", "with", "or", "but", "not", "this", "these", "they", "them",
        "their", "there", "then", "than", "so", "if", "when", "where", "why", "how", "what", "which", "who", "whom",
        "whose", "can", "could", "should", "would", "may", "might", "must", "shall", "do", "does", "did", "have",
        "had", "having",
    ];
    let tokenizer = TextAnalyzer::builder(SimpleTokenizer::default())
        .filter(LowerCaser)
        .filter(StopWordFilter::remove(stop_words.iter().map(|s| s.to_string())))
        .build();
    index.tokenizers().register(TOKENIZER, tokenizer);
}
