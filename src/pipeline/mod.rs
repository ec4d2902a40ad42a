//! Pipeline Coordinator (`spec.md` §4.8 / C8).
//!
//! Drives one document through convert → clean (both external, outside this
//! crate's scope) → chunk (C6) → per-chunk context (C7.a) ∥ metadata (C7.b)
//! → batch-embed (external) → persist (external store) → `AddChunks`
//! (C4). Grounded on the stage order implied by
//! `search_index_builder_service.py`'s `build_or_update_index`/`add_chunks`
//! being the terminal stage of an otherwise external pipeline.
//!
//! Per-chunk concurrency between the context and metadata stages is gated by
//! a [`tokio::sync::Semaphore`] rather than a blocking `crossbeam_channel`:
//! the latter's `recv` would park the async worker thread it runs on, which
//! doesn't compose with the rest of this crate's cooperative-I/O model.
//! `crossbeam_channel` remains the right tool for the denial sink's
//! fire-and-forget observation path (`denial::DenialSink`), where `try_send`
//! never blocks.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, instrument, warn};

use crate::chunking;
use crate::context::{build_embedding_text, Contextualizer};
use crate::embedding::Embedder;
use crate::error::{GatedHnswError, Result};
use crate::llm::LlmClient;
use crate::metadata_extract::{ExtractedMetadata, MetadataExtractor};
use crate::store::{ChunkRecord, DocumentRecord, EmbeddingRecord, MetadataStore};
use crate::tenant::{NewChunk, TenantIndexManager};
use crate::types::{AccessLevel, ChunkId, DocumentId, GroupId, Metadata, TenantId, Timestamp, Value};

/// How many chunks may have their context/metadata generated concurrently.
const MAX_CONCURRENT_CHUNK_WORK: usize = 8;

/// One document to ingest. Permission fields are set on the document and
/// inherited by every chunk produced from it.
#[derive(Clone, Debug)]
pub struct IngestRequest {
    pub tenant_id: TenantId,
    pub document_id: DocumentId,
    pub document_title: String,
    /// Already converted and cleaned plain text (conversion/cleaning are
    /// external concerns upstream of this crate).
    pub document_text: String,
    pub access_level: AccessLevel,
    pub group_id: Option<GroupId>,
    pub restricted_to_users: Vec<String>,
    /// Path to a temp file holding the uploaded document, removed on total
    /// pipeline failure. `None` if the caller manages its own temp storage.
    pub temp_file_path: Option<PathBuf>,
}

/// Outcome of one [`PipelineCoordinator::ingest_document`] call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IngestStatus {
    Completed,
    Failed,
}

/// Summary of an ingest run.
#[derive(Clone, Debug, PartialEq)]
pub struct IngestReport {
    pub status: IngestStatus,
    pub chunks_persisted: usize,
    pub chunks_skipped: usize,
}

impl IngestReport {
    fn failed() -> Self {
        Self {
            status: IngestStatus::Failed,
            chunks_persisted: 0,
            chunks_skipped: 0,
        }
    }
}

struct EnrichedChunk {
    index: usize,
    content: String,
    context: String,
    extracted: ExtractedMetadata,
}

/// Drives document ingestion end to end.
pub struct PipelineCoordinator {
    tenants: Arc<TenantIndexManager>,
    store: Arc<dyn MetadataStore>,
    embedder: Arc<dyn Embedder>,
    llm: Arc<dyn LlmClient>,
    contextualizer: Arc<Contextualizer>,
    metadata_extractor: Arc<MetadataExtractor>,
}

impl PipelineCoordinator {
    /// Creates a coordinator wired to its collaborators.
    pub fn new(
        tenants: Arc<TenantIndexManager>,
        store: Arc<dyn MetadataStore>,
        embedder: Arc<dyn Embedder>,
        llm: Arc<dyn LlmClient>,
    ) -> Self {
        Self {
            tenants,
            store,
            embedder,
            contextualizer: Arc::new(Contextualizer::new(Arc::clone(&llm))),
            metadata_extractor: Arc::new(MetadataExtractor::new(Arc::clone(&llm))),
            llm,
        }
    }

    /// Ingests one document: chunks it, enriches every chunk with context
    /// and metadata, embeds and persists the survivors, then folds them into
    /// the tenant's live index.
    #[instrument(skip(self, request), fields(tenant_id = %request.tenant_id, document_id = %request.document_id))]
    pub async fn ingest_document(&self, request: IngestRequest) -> Result<IngestReport> {
        if request.document_text.trim().is_empty() {
            return Err(GatedHnswError::invalid_input("document text is empty"));
        }

        let now = Timestamp::now();
        let document_record = DocumentRecord {
            id: request.document_id,
            organization_id: request.tenant_id,
            title: request.document_title.clone(),
            access_level: request.access_level,
            group_id: request.group_id.clone(),
            restricted_to_users: request.restricted_to_users.clone(),
            metadata: Metadata::new(),
            is_deleted: false,
            created_at: now,
            updated_at: now,
        };

        if let Err(err) = self.store.create_document(document_record).await {
            warn!(error = %err, "failed to persist document, aborting ingest");
            self.cleanup_temp_file(&request);
            return Ok(IngestReport::failed());
        }

        let chunks = match chunking::chunk_document(&request.document_text, &self.llm).await {
            Ok(chunks) if !chunks.is_empty() => chunks,
            Ok(_) => {
                warn!("chunking produced no chunks, aborting ingest");
                self.cleanup_temp_file(&request);
                return Ok(IngestReport::failed());
            }
            Err(err) => {
                warn!(error = %err, "chunking failed, aborting ingest");
                self.cleanup_temp_file(&request);
                return Ok(IngestReport::failed());
            }
        };

        info!(count = chunks.len(), "document split into chunks");

        let enriched = self
            .enrich_chunks(&chunks, &request.document_text)
            .await;

        let mut new_chunks = Vec::with_capacity(enriched.len());
        let mut persisted = 0usize;
        let mut skipped = 0usize;

        for chunk in enriched {
            let embedding_text = build_embedding_text(&chunk.content, &chunk.context);
            let vector = match self.embedder.embed(&embedding_text).await {
                Ok(vector) => vector,
                Err(err) => {
                    warn!(
                        chunk_index = chunk.index,
                        error = %err,
                        "embedding failed for chunk, skipping"
                    );
                    skipped += 1;
                    continue;
                }
            };

            let chunk_id = ChunkId::new();
            let metadata = self.build_chunk_metadata(&chunk, &request);

            let chunk_record = ChunkRecord {
                id: chunk_id,
                document_id: request.document_id,
                organization_id: request.tenant_id,
                content: chunk.content.clone(),
                metadata: metadata.clone(),
                is_deleted: false,
            };
            if let Err(err) = self.store.create_chunk(chunk_record).await {
                warn!(chunk_index = chunk.index, error = %err, "failed to persist chunk, skipping");
                skipped += 1;
                continue;
            }

            let embedding_record = EmbeddingRecord {
                id: uuid::Uuid::now_v7(),
                chunk_id,
                document_id: request.document_id,
                organization_id: request.tenant_id,
                vector: vector.clone(),
                is_deleted: false,
            };
            if let Err(err) = self.store.create_embedding(embedding_record).await {
                warn!(chunk_index = chunk.index, error = %err, "failed to persist embedding, skipping");
                skipped += 1;
                continue;
            }

            persisted += 1;
            new_chunks.push(NewChunk {
                chunk_id,
                document_id: request.document_id,
                embedding: Some(vector),
                metadata,
            });
        }

        if persisted == 0 {
            warn!("no chunks survived ingestion, reporting failure");
            self.cleanup_temp_file(&request);
            return Ok(IngestReport {
                status: IngestStatus::Failed,
                chunks_persisted: 0,
                chunks_skipped: skipped,
            });
        }

        let inserted = self.tenants.add_chunks(request.tenant_id, new_chunks).await?;
        info!(
            persisted,
            skipped,
            inserted_into_index = inserted,
            "document ingestion complete"
        );

        Ok(IngestReport {
            status: IngestStatus::Completed,
            chunks_persisted: persisted,
            chunks_skipped: skipped,
        })
    }

    /// Runs context and metadata generation concurrently for every chunk,
    /// bounded by [`MAX_CONCURRENT_CHUNK_WORK`] in-flight at once.
    async fn enrich_chunks(&self, chunks: &[String], document_text: &str) -> Vec<EnrichedChunk> {
        let semaphore = Arc::new(tokio::sync::Semaphore::new(MAX_CONCURRENT_CHUNK_WORK));
        let mut handles = Vec::with_capacity(chunks.len());

        for (index, chunk) in chunks.iter().enumerate() {
            let semaphore = Arc::clone(&semaphore);
            let contextualizer = Arc::clone(&self.contextualizer);
            let metadata_extractor = Arc::clone(&self.metadata_extractor);
            let chunk = chunk.clone();
            let document_text = document_text.to_string();

            handles.push(tokio::spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("semaphore is never closed while handles are outstanding");

                let context_handle = tokio::spawn({
                    let contextualizer = Arc::clone(&contextualizer);
                    let chunk = chunk.clone();
                    async move { contextualizer.generate(&chunk, &document_text).await }
                });
                let metadata_handle = tokio::spawn({
                    let metadata_extractor = Arc::clone(&metadata_extractor);
                    let chunk = chunk.clone();
                    async move { metadata_extractor.extract(&chunk).await }
                });

                let context = context_handle.await.unwrap_or_default();
                let extracted = metadata_handle.await.unwrap_or_default();

                EnrichedChunk {
                    index,
                    content: chunk,
                    context,
                    extracted,
                }
            }));
        }

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok(enriched) => results.push(enriched),
                Err(err) => warn!(error = %err, "chunk enrichment task panicked, chunk dropped"),
            }
        }
        results.sort_by_key(|c| c.index);
        results
    }

    fn build_chunk_metadata(&self, chunk: &EnrichedChunk, request: &IngestRequest) -> Metadata {
        let mut metadata = Metadata::new();
        metadata.insert(
            "keywords".to_string(),
            Value::from(chunk.extracted.keywords.clone()),
        );
        metadata.insert(
            "topics".to_string(),
            Value::from(chunk.extracted.topics.clone()),
        );
        metadata.insert(
            "entities".to_string(),
            Value::from(chunk.extracted.entities.clone()),
        );
        metadata.insert(
            "document_type".to_string(),
            Value::string(chunk.extracted.document_type.clone()),
        );
        metadata.insert(
            "chunk_index".to_string(),
            Value::Number(chunk.index as f64),
        );
        metadata.insert("context".to_string(), Value::string(chunk.context.clone()));
        metadata.insert(
            "accessLevel".to_string(),
            Value::string(request.access_level.to_string()),
        );
        metadata.insert(
            "groupId".to_string(),
            match &request.group_id {
                Some(group_id) => Value::string(group_id.as_str()),
                None => Value::Null,
            },
        );
        metadata.insert(
            "restrictedToUsers".to_string(),
            Value::from(request.restricted_to_users.clone()),
        );
        metadata
    }

    fn cleanup_temp_file(&self, request: &IngestRequest) {
        let Some(path) = &request.temp_file_path else {
            return;
        };
        if let Err(err) = std::fs::remove_file(path) {
            warn!(path = %path.display(), error = %err, "failed to remove temp file after ingest failure");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{AccessDenialLogEntry, ChunkEnrichment, ChunkWithEmbedding, OrganizationStats};
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeStore {
        documents: Mutex<Vec<DocumentRecord>>,
        chunks: Mutex<Vec<ChunkRecord>>,
        embeddings: Mutex<Vec<EmbeddingRecord>>,
    }

    #[async_trait]
    impl MetadataStore for FakeStore {
        async fn get_chunks_and_embeddings_for_organization(
            &self,
            _organization_id: TenantId,
        ) -> Result<Vec<ChunkWithEmbedding>> {
            Ok(Vec::new())
        }
        async fn has_embeddings_for_document(&self, _document_id: DocumentId) -> Result<bool> {
            Ok(false)
        }
        async fn get_organization_stats(&self, _organization_id: TenantId) -> Result<OrganizationStats> {
            Ok(OrganizationStats {
                document_count: 0,
                chunk_count: 0,
                embedding_count: 0,
                last_index_update: None,
                last_data_change: None,
                needs_reindex: true,
            })
        }
        async fn update_last_index_time(&self, _organization_id: TenantId, _at: Timestamp) -> Result<()> {
            Ok(())
        }
        async fn create_document(&self, document: DocumentRecord) -> Result<()> {
            self.documents.lock().unwrap().push(document);
            Ok(())
        }
        async fn create_chunk(&self, chunk: ChunkRecord) -> Result<()> {
            self.chunks.lock().unwrap().push(chunk);
            Ok(())
        }
        async fn create_embedding(&self, embedding: EmbeddingRecord) -> Result<()> {
            self.embeddings.lock().unwrap().push(embedding);
            Ok(())
        }
        async fn soft_delete_chunks(&self, _chunk_ids: &[ChunkId]) -> Result<u64> {
            Ok(0)
        }
        async fn get_enrichment_for_chunks(&self, _chunk_ids: &[ChunkId]) -> Result<Vec<ChunkEnrichment>> {
            Ok(Vec::new())
        }
        async fn insert_access_denial_log(&self, _entry: AccessDenialLogEntry) -> Result<()> {
            Ok(())
        }
    }

    struct StaticLlm;

    #[async_trait]
    impl LlmClient for StaticLlm {
        async fn chunk_split(&self, _prompt: &str) -> Result<String> {
            Ok("split_after: none".to_string())
        }
        async fn contextualize(&self, _prompt: &str) -> Result<String> {
            Ok("Background context for this section.".to_string())
        }
        async fn extract_metadata(&self, _prompt: &str) -> Result<String> {
            Ok(r#"{"keywords": ["k"], "topics": ["t"], "entities": [], "document_type": "report"}"#.to_string())
        }
        async fn enhance_query(&self, query: &str, _history: &[String]) -> Result<Vec<String>> {
            Ok(vec![query.to_string()])
        }
        async fn select_context(&self, _query: &str, candidates: &[String]) -> Result<Vec<usize>> {
            Ok((0..candidates.len()).collect())
        }
        async fn generate_answer(
            &self,
            _query: &str,
            selected: &[String],
            _history: &[String],
        ) -> Result<crate::llm::GeneratedAnswer> {
            Ok(crate::llm::GeneratedAnswer {
                answer: selected.join(" "),
                confidence: 1.0,
            })
        }
    }

    fn coordinator() -> PipelineCoordinator {
        let store: Arc<dyn MetadataStore> = Arc::new(FakeStore::default());
        let tenants = Arc::new(TenantIndexManager::new(
            Arc::clone(&store),
            crate::config::HnswParams::default(),
        ));
        let embedder: Arc<dyn Embedder> = Arc::new(crate::embedding::NullEmbedder::new(8));
        let llm: Arc<dyn LlmClient> = Arc::new(StaticLlm);
        PipelineCoordinator::new(tenants, store, embedder, llm)
    }

    fn sample_request() -> IngestRequest {
        IngestRequest {
            tenant_id: TenantId::new(),
            document_id: DocumentId::new(),
            document_title: "Quarterly Report".to_string(),
            document_text: "Revenue grew this quarter. Costs remained stable. \
                The outlook for next quarter is positive given current trends."
                .to_string(),
            access_level: AccessLevel::Group,
            group_id: Some(GroupId::new("finance")),
            restricted_to_users: Vec::new(),
            temp_file_path: None,
        }
    }

    #[tokio::test]
    async fn ingest_document_completes_and_populates_index() {
        let coordinator = coordinator();
        let tenant_id = TenantId::new();
        let mut request = sample_request();
        request.tenant_id = tenant_id;

        let report = coordinator.ingest_document(request).await.unwrap();
        assert_eq!(report.status, IngestStatus::Completed);
        assert!(report.chunks_persisted > 0);
        assert!(coordinator.tenants.has(tenant_id));
    }

    #[tokio::test]
    async fn ingest_document_rejects_empty_text() {
        let coordinator = coordinator();
        let mut request = sample_request();
        request.document_text = "   ".to_string();

        let result = coordinator.ingest_document(request).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn chunk_metadata_inherits_document_permissions() {
        let coordinator = coordinator();
        let request = sample_request();
        let enriched = EnrichedChunk {
            index: 0,
            content: "chunk text".to_string(),
            context: "some context".to_string(),
            extracted: ExtractedMetadata::default(),
        };

        let metadata = coordinator.build_chunk_metadata(&enriched, &request);
        assert_eq!(
            metadata.get("accessLevel"),
            Some(&Value::string("GROUP"))
        );
        assert_eq!(
            metadata.get("groupId"),
            Some(&Value::string("finance"))
        );
        assert_eq!(metadata.get("chunk_index"), Some(&Value::Number(0.0)));
    }

    struct FailingDocumentStore;

    #[async_trait]
    impl MetadataStore for FailingDocumentStore {
        async fn get_chunks_and_embeddings_for_organization(
            &self,
            _organization_id: TenantId,
        ) -> Result<Vec<ChunkWithEmbedding>> {
            Ok(Vec::new())
        }
        async fn has_embeddings_for_document(&self, _document_id: DocumentId) -> Result<bool> {
            Ok(false)
        }
        async fn get_organization_stats(&self, _organization_id: TenantId) -> Result<OrganizationStats> {
            Ok(OrganizationStats {
                document_count: 0,
                chunk_count: 0,
                embedding_count: 0,
                last_index_update: None,
                last_data_change: None,
                needs_reindex: true,
            })
        }
        async fn update_last_index_time(&self, _organization_id: TenantId, _at: Timestamp) -> Result<()> {
            Ok(())
        }
        async fn create_document(&self, _document: DocumentRecord) -> Result<()> {
            Err(GatedHnswError::invalid_input("store unavailable"))
        }
        async fn create_chunk(&self, _chunk: ChunkRecord) -> Result<()> {
            Ok(())
        }
        async fn create_embedding(&self, _embedding: EmbeddingRecord) -> Result<()> {
            Ok(())
        }
        async fn soft_delete_chunks(&self, _chunk_ids: &[ChunkId]) -> Result<u64> {
            Ok(0)
        }
        async fn get_enrichment_for_chunks(&self, _chunk_ids: &[ChunkId]) -> Result<Vec<ChunkEnrichment>> {
            Ok(Vec::new())
        }
        async fn insert_access_denial_log(&self, _entry: AccessDenialLogEntry) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn cleanup_removes_temp_file_on_total_failure() {
        let store: Arc<dyn MetadataStore> = Arc::new(FailingDocumentStore);
        let tenants = Arc::new(TenantIndexManager::new(
            Arc::clone(&store),
            crate::config::HnswParams::default(),
        ));
        let embedder: Arc<dyn Embedder> = Arc::new(crate::embedding::NullEmbedder::new(8));
        let llm: Arc<dyn LlmClient> = Arc::new(StaticLlm);
        let coordinator = PipelineCoordinator::new(tenants, store, embedder, llm);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("upload.tmp");
        std::fs::write(&path, b"doc bytes").unwrap();

        let mut request = sample_request();
        request.temp_file_path = Some(path.clone());

        let report = coordinator.ingest_document(request).await.unwrap();
        assert_eq!(report.status, IngestStatus::Failed);
        assert!(!path.exists(), "temp file should be removed after a total failure");
    }
}
