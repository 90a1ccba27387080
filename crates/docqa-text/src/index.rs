use anyhow::Result;
use parking_lot::Mutex;
use std::path::Path;
use tantivy::collector::TopDocs;
use tantivy::directory::MmapDirectory;
use tantivy::query::{BooleanQuery, Occur, Query, QueryParser, TermQuery};
use tantivy::schema::{IndexRecordOption, Value};
use tantivy::{doc, Index, IndexReader, IndexWriter, ReloadPolicy, TantivyDocument, Term};
use tracing::{debug, warn};

use docqa_core::traits::LexicalIndex;
use docqa_core::types::{Chunk, SearchFilter, SearchHit, SourceKind};

use crate::tantivy_utils::{build_schema, chunk_fields, register_tokenizer, ChunkFields};

const WRITER_HEAP: usize = 50_000_000;

/// BM25 index over chunk text. All writes go through one writer and land in a
/// single commit, so a document's chunks are swapped atomically for readers.
pub struct TantivyLexicalIndex {
    index: Index,
    reader: IndexReader,
    writer: Mutex<IndexWriter>,
    fields: ChunkFields,
}

impl TantivyLexicalIndex {
    pub fn open_or_create(index_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(index_dir)?;
        let index = Index::open_or_create(MmapDirectory::open(index_dir)?, build_schema())?;
        Self::from_index(index)
    }

    pub fn in_memory() -> Result<Self> {
        Self::from_index(Index::create_in_ram(build_schema()))
    }

    fn from_index(index: Index) -> Result<Self> {
        register_tokenizer(&index);
        let fields = chunk_fields(&index.schema())?;
        let reader: IndexReader = index.reader_builder().reload_policy(ReloadPolicy::Manual).try_into()?;
        let writer: IndexWriter = index.writer(WRITER_HEAP)?;
        Ok(Self { index, reader, writer: Mutex::new(writer), fields })
    }

    /// Apply `edit` and commit; on failure the pending operations are rolled back.
    fn commit_with(&self, edit: impl FnOnce(&mut IndexWriter, &ChunkFields) -> Result<()>) -> Result<()> {
        let mut writer = self.writer.lock();
        let outcome = edit(&mut *writer, &self.fields).and_then(|_| writer.commit().map(|_| ()).map_err(Into::into));
        if let Err(e) = outcome {
            warn!(error = %e, "lexical index write failed, rolling back");
            writer.rollback()?;
            return Err(e);
        }
        drop(writer);
        self.reader.reload()?;
        Ok(())
    }

    pub fn num_docs(&self) -> u64 {
        self.reader.searcher().num_docs()
    }

    fn filtered_query(&self, query: &str, filter: &SearchFilter) -> Box<dyn Query> {
        let parser = QueryParser::for_index(&self.index, vec![self.fields.text]);
        let (text_query, errors) = parser.parse_query_lenient(query);
        if !errors.is_empty() {
            debug!(errors = errors.len(), "lenient query parse dropped terms");
        }
        if filter.is_empty() {
            return text_query;
        }
        let mut clauses: Vec<(Occur, Box<dyn Query>)> = vec![(Occur::Must, text_query)];
        if let Some(subject) = &filter.subject {
            let term = Term::from_field_text(self.fields.subject, subject);
            clauses.push((Occur::Must, Box::new(TermQuery::new(term, IndexRecordOption::Basic))));
        }
        if let Some(module) = &filter.module {
            let term = Term::from_field_text(self.fields.module, module);
            clauses.push((Occur::Must, Box::new(TermQuery::new(term, IndexRecordOption::Basic))));
        }
        Box::new(BooleanQuery::new(clauses))
    }
}

impl LexicalIndex for TantivyLexicalIndex {
    fn replace_document(&self, document_id: &str, chunks: &[Chunk]) -> Result<()> {
        self.commit_with(|writer, f| {
            writer.delete_term(Term::from_field_text(f.document_id, document_id));
            for c in chunks {
                writer.add_document(doc!(
                    f.chunk_id => c.chunk_id.clone(),
                    f.document_id => c.document_id.clone(),
                    f.subject => c.subject.clone(),
                    f.module => c.module.clone(),
                    f.text => c.text.clone(),
                ))?;
            }
            Ok(())
        })?;
        debug!(document_id, chunks = chunks.len(), "replaced document text");
        Ok(())
    }

    fn delete_document(&self, document_id: &str) -> Result<()> {
        self.commit_with(|writer, f| {
            writer.delete_term(Term::from_field_text(f.document_id, document_id));
            Ok(())
        })
    }

    fn search(&self, query: &str, k: usize, filter: &SearchFilter) -> Result<Vec<SearchHit>> {
        if k == 0 || query.trim().is_empty() {
            return Ok(Vec::new());
        }
        let searcher = self.reader.searcher();
        let q = self.filtered_query(query, filter);
        let top_docs = searcher.search(&q, &TopDocs::with_limit(k))?;
        let mut hits = Vec::with_capacity(top_docs.len());
        for (score, addr) in top_docs {
            let doc: TantivyDocument = searcher.doc(addr)?;
            if let Some(id) = doc.get_first(self.fields.chunk_id).and_then(|v| v.as_str()) {
                hits.push(SearchHit { id: id.to_string(), score, source: SourceKind::Text });
            }
        }
        Ok(hits)
    }

    fn clear(&self) -> Result<()> {
        self.commit_with(|writer, _| {
            writer.delete_all_documents()?;
            Ok(())
        })
    }
}
