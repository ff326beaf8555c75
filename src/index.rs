//! index.rs
//!
//! The process-wide log index: a tantivy in-RAM index for term search and
//! filtering, plus the stored documents it was built from. Snapshots hold only
//! the schema and the documents; tantivy is rebuilt from them on restore.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tantivy::collector::{Count, TopDocs};
use tantivy::schema::Value as _;
use tantivy::{Index, IndexReader, IndexWriter, ReloadPolicy, TantivyDocument};
use tracing::{debug, info, warn};

use crate::errors::IndexerError;
use crate::metrics::{DOCUMENTS_INSERTED, INSERT_REJECTED, SEARCH_COUNTER, SEARCH_HISTOGRAM};
use crate::schema::{Document, FieldKind, IndexSchema, TantivyFields};
use crate::search::{build_query, Hit, SearchParams, SearchResults, SortOrder};
use crate::snapshot::{Snapshot, StoredDocument};

/// Inserts go through here one batch at a time.
struct WriterState {
    writer: IndexWriter,
    next_id: u64,
}

pub struct LogIndex {
    schema: IndexSchema,
    fields: TantivyFields,
    index: Index,
    reader: IndexReader,
    writer: Mutex<WriterState>,
    documents: RwLock<BTreeMap<u64, Document>>,
}

impl LogIndex {
    /// Create an empty index for `schema`.
    pub fn create(schema: IndexSchema, writer_heap_bytes: usize) -> Result<Self, IndexerError> {
        schema.check()?;
        let fields = schema.build_tantivy();
        let index = Index::create_in_ram(fields.schema.clone());

        // Reloaded by hand after each commit so that a finished insert is
        // immediately visible to the next search
        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::Manual)
            .try_into()?;
        let writer = index.writer_with_num_threads(1, writer_heap_bytes)?;

        info!(fields = schema.len(), heap = writer_heap_bytes, "Created log index");

        Ok(LogIndex {
            schema,
            fields,
            index,
            reader,
            writer: Mutex::new(WriterState { writer, next_id: 1 }),
            documents: RwLock::new(BTreeMap::new()),
        })
    }

    /// Rebuild an index from a snapshot. The snapshot's schema is authoritative.
    pub fn from_snapshot(snapshot: Snapshot, writer_heap_bytes: usize) -> Result<Self, IndexerError> {
        let index = LogIndex::create(snapshot.schema, writer_heap_bytes)?;
        index.load(snapshot.documents)?;
        Ok(index)
    }

    pub fn schema(&self) -> &IndexSchema {
        &self.schema
    }

    pub fn count(&self) -> usize {
        self.documents.read().len()
    }

    /// Validate and insert a batch. Either the whole batch lands or none of it.
    pub fn insert_many(&self, values: Vec<Value>) -> Result<Vec<u64>, IndexerError> {
        let batch: Vec<Document> = match values
            .into_iter()
            .map(|v| self.schema.into_document(v))
            .collect::<Result<_, _>>()
        {
            Ok(batch) => batch,
            Err(e) => {
                INSERT_REJECTED.inc();
                return Err(e);
            }
        };
        if batch.is_empty() {
            return Ok(Vec::new());
        }

        let mut state = self.writer.lock();
        let first = state.next_id;
        let staged: Vec<StoredDocument> = batch
            .into_iter()
            .zip(first..)
            .map(|(document, id)| StoredDocument { id, document })
            .collect();

        let ids: Vec<u64> = staged.iter().map(|s| s.id).collect();
        self.write_batch(&mut state, staged)?;

        DOCUMENTS_INSERTED.inc_by(ids.len() as u64);
        debug!(count = ids.len(), first_id = first, "Inserted documents");
        Ok(ids)
    }

    /// Run `params` against the committed index.
    pub fn search(&self, params: &SearchParams) -> Result<SearchResults, IndexerError> {
        let started = Instant::now();
        SEARCH_COUNTER.inc();

        let (query, scored) = build_query(&self.index, &self.fields, params)?;
        if let Some(sort) = &params.sort_by {
            self.fields.lookup(&sort.property)?;
        }

        let searcher = self.reader.searcher();
        let total = searcher.search(&*query, &Count)?;

        let mut matched: Vec<(u64, f32)> = Vec::with_capacity(total);
        if total > 0 {
            for (score, address) in searcher.search(&*query, &TopDocs::with_limit(total))? {
                let doc: TantivyDocument = searcher.doc(address)?;
                if let Some(id) = doc.get_first(self.fields.id).and_then(|v| v.as_u64()) {
                    matched.push((id, score));
                }
            }
        }

        let documents = self.documents.read();
        let mut rows: Vec<(u64, f32, &Document)> = matched
            .into_iter()
            .filter_map(|(id, score)| documents.get(&id).map(|doc| (id, score, doc)))
            .collect();

        match &params.sort_by {
            Some(sort) => rows.sort_by(|a, b| {
                compare_values(a.2.get(&sort.property), b.2.get(&sort.property), sort.order)
                    .then(a.0.cmp(&b.0))
            }),
            None if scored => rows.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0))),
            None => rows.sort_by_key(|row| row.0),
        }

        let count = rows.len();
        let hits = rows
            .into_iter()
            .skip(params.offset)
            .take(params.limit)
            .map(|(id, score, document)| Hit {
                id,
                score,
                document: document.clone(),
            })
            .collect();

        let elapsed = started.elapsed();
        SEARCH_HISTOGRAM.observe(elapsed.as_secs_f64());

        Ok(SearchResults {
            count,
            hits,
            elapsed: elapsed.into(),
        })
    }

    /// Copy the whole index state out for persistence.
    pub fn to_snapshot(&self) -> Snapshot {
        let documents = self
            .documents
            .read()
            .iter()
            .map(|(id, document)| StoredDocument {
                id: *id,
                document: document.clone(),
            })
            .collect();
        Snapshot::new(self.schema.clone(), documents)
    }

    /// Re-index stored documents under their original ids.
    fn load(&self, documents: Vec<StoredDocument>) -> Result<(), IndexerError> {
        if documents.is_empty() {
            return Ok(());
        }
        let mut state = self.writer.lock();
        // Ids of skipped documents stay retired
        let highest = documents.iter().map(|s| s.id).max().unwrap_or(0);
        let mut staged = Vec::with_capacity(documents.len());
        for stored in documents {
            if let Err(e) = self.schema.validate_document(&Value::Object(stored.document.clone())) {
                warn!(id = stored.id, error = %e, "Skipping snapshot document that does not fit the schema");
                continue;
            }
            staged.push(stored);
        }
        let count = staged.len();
        self.write_batch(&mut state, staged)?;
        state.next_id = state.next_id.max(highest + 1);
        info!(documents = count, "Re-indexed documents from snapshot");
        Ok(())
    }

    /// Stage documents, commit, and make them searchable. Rolls back the
    /// tantivy writer and the document store if anything fails.
    fn write_batch(
        &self,
        state: &mut WriterState,
        staged: Vec<StoredDocument>,
    ) -> Result<(), IndexerError> {
        let ids: Vec<u64> = staged.iter().map(|s| s.id).collect();
        let last = ids.iter().copied().max().unwrap_or(0);

        for stored in &staged {
            if let Err(e) = state.writer.add_document(self.to_tantivy(stored)) {
                let _ = state.writer.rollback();
                return Err(e.into());
            }
        }

        {
            let mut documents = self.documents.write();
            for stored in staged {
                documents.insert(stored.id, stored.document);
            }
        }

        let committed = state
            .writer
            .commit()
            .map_err(IndexerError::from)
            .and_then(|_| self.reader.reload().map_err(IndexerError::from));
        if let Err(e) = committed {
            let _ = state.writer.rollback();
            let mut documents = self.documents.write();
            for id in &ids {
                documents.remove(id);
            }
            return Err(e);
        }

        state.next_id = state.next_id.max(last + 1);
        Ok(())
    }

    fn to_tantivy(&self, stored: &StoredDocument) -> TantivyDocument {
        let mut doc = TantivyDocument::default();
        doc.add_u64(self.fields.id, stored.id);

        for (name, (field, kind)) in &self.fields.fields {
            match (kind, stored.document.get(name)) {
                (FieldKind::String, Some(Value::String(s))) => doc.add_text(*field, s),
                (FieldKind::Number, Some(Value::Number(n))) => {
                    if let Some(f) = n.as_f64() {
                        doc.add_f64(*field, f);
                    }
                }
                (FieldKind::Boolean, Some(Value::Bool(b))) => doc.add_bool(*field, *b),
                _ => {}
            }
        }
        doc
    }
}

/// Sort comparison on a stored field. Documents missing the field go last
/// whichever the order.
fn compare_values(a: Option<&Value>, b: Option<&Value>, order: SortOrder) -> Ordering {
    let a = a.filter(|v| !v.is_null());
    let b = b.filter(|v| !v.is_null());
    match (a, b) {
        (Some(x), Some(y)) => {
            let ord = match (x, y) {
                (Value::Number(x), Value::Number(y)) => x
                    .as_f64()
                    .unwrap_or(f64::NAN)
                    .total_cmp(&y.as_f64().unwrap_or(f64::NAN)),
                (Value::String(x), Value::String(y)) => x.cmp(y),
                (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
                _ => Ordering::Equal,
            };
            match order {
                SortOrder::Asc => ord,
                SortOrder::Desc => ord.reverse(),
            }
        }
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}
