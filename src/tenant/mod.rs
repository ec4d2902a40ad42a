//! Tenant Index Manager (`spec.md` §4.4 / C4).
//!
//! Owns the in-memory `HnswIndex` per tenant and serializes every mutating
//! operation on a given tenant while leaving reads (`Get`/`Has`/`Stats`) and
//! searches lock-free of the build path. Grounded on the teacher's
//! `RwLock<HashMap<CollectiveId, HnswIndex>>` container in `db.rs` for the
//! per-tenant state, and on `search_index_builder_service.py`'s
//! `OrganizationIndexes`/`building_locks` for the build-serialization and
//! stats-snapshot shape.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};

use tracing::{info, instrument, warn};

use crate::config::HnswParams;
use crate::error::{GatedHnswError, Result};
use crate::store::MetadataStore;
use crate::types::{ChunkId, DocumentId, Metadata, TenantId, Timestamp, Vector};
use crate::vector::{BuildInput, HnswIndex, IndexBuilder};

/// One chunk to be inserted via [`TenantIndexManager::add_chunks`].
///
/// Chunks without an `embedding` are counted (for `chunk_count`) but not
/// inserted into the vector graph, matching the build path's handling of
/// embedding-less rows.
#[derive(Clone, Debug)]
pub struct NewChunk {
    /// External chunk id.
    pub chunk_id: ChunkId,
    /// Parent document id.
    pub document_id: DocumentId,
    /// Embedding vector, if one has been computed.
    pub embedding: Option<Vector>,
    /// Chunk metadata, including the permission sub-fields.
    pub metadata: Metadata,
}

/// A per-chunk metadata patch for [`TenantIndexManager::update_chunk_metadata`].
#[derive(Clone, Debug)]
pub struct ChunkMetadataUpdate {
    /// The chunk to patch.
    pub chunk_id: ChunkId,
    /// Keys to merge into the chunk's existing metadata.
    pub metadata: Metadata,
}

/// Snapshot of one tenant's index state, returned by `Get`/`Stats`/`StatsAll`.
#[derive(Clone, Debug, PartialEq)]
pub struct TenantStats {
    /// The tenant this snapshot describes.
    pub tenant_id: TenantId,
    /// Rows fetched from the store at last build/update, live or not.
    pub chunk_count: u64,
    /// Distinct document ids seen at last build/update.
    pub document_count: u64,
    /// When the index was last (re)built.
    pub last_updated: Option<Timestamp>,
    /// Whether a build is currently in flight for this tenant.
    pub is_building: bool,
    /// Whether an index currently exists in memory.
    pub has_index: bool,
}

struct TenantState {
    index: Option<HnswIndex>,
    last_updated: Option<Timestamp>,
    chunk_count: u64,
    document_count: u64,
    is_building: bool,
}

impl TenantState {
    fn empty() -> Self {
        Self {
            index: None,
            last_updated: None,
            chunk_count: 0,
            document_count: 0,
            is_building: false,
        }
    }
}

/// Per-tenant container: the index itself plus a serialization lock for the
/// long-running async build sequence. `Get`/`Has`/`Stats`/`Search` only ever
/// take `state`'s read lock. Every mutator — `BuildOrUpdate`, `AddChunks`,
/// `RemoveChunks`, `UpdateChunkMetadata`, `Destroy`, `LoadPersisted` — holds
/// `building` for its whole body, so they serialize against each other and
/// against concurrent builds rather than race. `Destroy` is the one
/// exception: it `try_lock`s rather than blocking, so a build already in
/// flight wins the race and `Destroy` reports `Conflict` instead of waiting.
struct TenantEntry {
    state: RwLock<TenantState>,
    building: tokio::sync::Mutex<()>,
}

impl TenantEntry {
    fn new() -> Self {
        Self {
            state: RwLock::new(TenantState::empty()),
            building: tokio::sync::Mutex::new(()),
        }
    }

    fn has_index(&self) -> bool {
        self.state.read().unwrap().index.is_some()
    }

    fn stats(&self, tenant_id: TenantId) -> TenantStats {
        let state = self.state.read().unwrap();
        TenantStats {
            tenant_id,
            chunk_count: state.chunk_count,
            document_count: state.document_count,
            last_updated: state.last_updated,
            is_building: state.is_building,
            has_index: state.index.is_some(),
        }
    }

    fn set_building(&self, building: bool) {
        self.state.write().unwrap().is_building = building;
    }

    fn replace_empty(&self, at: Timestamp) {
        let mut state = self.state.write().unwrap();
        state.index = None;
        state.chunk_count = 0;
        state.document_count = 0;
        state.last_updated = Some(at);
    }

    fn replace_index(&self, index: HnswIndex, chunk_count: u64, document_count: u64, at: Timestamp) {
        let mut state = self.state.write().unwrap();
        state.index = Some(index);
        state.chunk_count = chunk_count;
        state.document_count = document_count;
        state.last_updated = Some(at);
    }
}

/// Manages the lifecycle of every tenant's `HnswIndex`: building, online
/// mutation, and destruction.
///
/// `Send + Sync`; designed to be shared behind an `Arc` across the search
/// service and the ingestion pipeline.
pub struct TenantIndexManager {
    store: Arc<dyn MetadataStore>,
    hnsw_params: HnswParams,
    entries: Mutex<HashMap<TenantId, Arc<TenantEntry>>>,
}

impl TenantIndexManager {
    /// Creates a manager backed by `store`, building new tenant indexes with
    /// `hnsw_params`.
    pub fn new(store: Arc<dyn MetadataStore>, hnsw_params: HnswParams) -> Self {
        Self {
            store,
            hnsw_params,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Fetches or creates the per-tenant entry. The outer map lock is held
    /// only long enough to look up or insert — never across an await point.
    fn entry_for(&self, tenant_id: TenantId) -> Arc<TenantEntry> {
        let mut entries = self.entries.lock().unwrap();
        entries
            .entry(tenant_id)
            .or_insert_with(|| Arc::new(TenantEntry::new()))
            .clone()
    }

    /// `BuildOrUpdate(tenant_id, force)`.
    ///
    /// Builds a fresh index only if `force`, no index currently exists, or
    /// the store reports the tenant's data has changed since the last
    /// build. Two concurrent calls for the same tenant serialize: the
    /// second observes the first's result rather than racing it.
    #[instrument(skip(self))]
    pub async fn build_or_update(&self, tenant_id: TenantId, force: bool) -> Result<TenantStats> {
        let entry = self.entry_for(tenant_id);
        let _build_guard = entry.building.lock().await;
        self.build_or_update_locked(&entry, tenant_id, force).await
    }

    /// Shared body of `BuildOrUpdate`, assuming the caller already holds
    /// `entry.building` — lets `AddChunks` build a missing index without
    /// re-entering the (non-reentrant) lock it is already holding.
    async fn build_or_update_locked(
        &self,
        entry: &TenantEntry,
        tenant_id: TenantId,
        force: bool,
    ) -> Result<TenantStats> {
        let org_stats = self.store.get_organization_stats(tenant_id).await?;
        let needs_rebuild = force || !entry.has_index() || org_stats.needs_reindex;

        if !needs_rebuild {
            info!(
                tenant_id = %tenant_id,
                chunks = org_stats.chunk_count,
                documents = org_stats.document_count,
                "tenant index is up to date"
            );
            return Ok(entry.stats(tenant_id));
        }

        entry.set_building(true);
        let outcome = self.build_tenant_index(entry, tenant_id).await;
        entry.set_building(false);
        outcome
    }

    async fn build_tenant_index(&self, entry: &TenantEntry, tenant_id: TenantId) -> Result<TenantStats> {
        info!(tenant_id = %tenant_id, "building tenant index");

        let chunks_data = self
            .store
            .get_chunks_and_embeddings_for_organization(tenant_id)
            .await?;

        if chunks_data.is_empty() {
            warn!(tenant_id = %tenant_id, "no chunks found for tenant");
            entry.replace_empty(Timestamp::now());
            return Ok(entry.stats(tenant_id));
        }

        let total_chunk_count = chunks_data.len();
        let mut document_ids_seen = HashSet::new();
        let mut vectors = Vec::new();
        let mut chunk_ids = Vec::new();
        let mut document_ids = Vec::new();
        let mut metadatas = Vec::new();
        let mut without_embeddings = 0usize;

        for row in chunks_data {
            document_ids_seen.insert(row.chunk.document_id);
            match row.embedding {
                Some(vector) => {
                    vectors.push(vector);
                    chunk_ids.push(row.chunk.id);
                    document_ids.push(row.chunk.document_id);
                    metadatas.push(row.chunk.metadata);
                }
                None => without_embeddings += 1,
            }
        }

        if without_embeddings > 0 {
            warn!(
                tenant_id = %tenant_id,
                count = without_embeddings,
                "chunks without embeddings excluded from vector search"
            );
        }

        let builder = IndexBuilder::new(tenant_id, self.hnsw_params);
        let (index, report) = builder
            .build(
                BuildInput {
                    vectors,
                    chunk_ids,
                    document_ids,
                    metadatas,
                },
                None,
            )
            .map_err(GatedHnswError::invalid_input)?;

        info!(
            tenant_id = %tenant_id,
            inserted = report.inserted,
            warnings = report.warnings.len(),
            "built HNSW index for tenant"
        );

        let now = Timestamp::now();
        entry.replace_index(index, total_chunk_count as u64, document_ids_seen.len() as u64, now);

        self.store.update_last_index_time(tenant_id, now).await?;

        info!(
            tenant_id = %tenant_id,
            documents = document_ids_seen.len(),
            chunks = total_chunk_count,
            "successfully built tenant index"
        );

        Ok(entry.stats(tenant_id))
    }

    /// `AddChunks(tenant_id, chunks[])`. Builds the tenant's index first if
    /// none exists yet. Chunks without an embedding are counted but skipped.
    #[instrument(skip(self, chunks))]
    pub async fn add_chunks(&self, tenant_id: TenantId, chunks: Vec<NewChunk>) -> Result<usize> {
        let entry = self.entry_for(tenant_id);
        let _build_guard = entry.building.lock().await;
        if !entry.has_index() {
            warn!(tenant_id = %tenant_id, "no index found, building before adding chunks");
            self.build_or_update_locked(&entry, tenant_id, false).await?;
        }

        let mut inserted = 0usize;
        {
            let mut state = entry.state.write().unwrap();
            if let Some(index) = state.index.as_mut() {
                for chunk in &chunks {
                    let Some(vector) = chunk.embedding.clone() else {
                        continue;
                    };
                    match index.insert(
                        chunk.chunk_id,
                        chunk.document_id,
                        vector,
                        chunk.metadata.clone(),
                    ) {
                        Ok(_) => inserted += 1,
                        Err(err) => {
                            warn!(chunk_id = %chunk.chunk_id, error = %err, "failed to add chunk")
                        }
                    }
                }
            }
            state.chunk_count += chunks.len() as u64;
        }

        info!(tenant_id = %tenant_id, inserted, "added chunks to tenant index");
        Ok(inserted)
    }

    /// `RemoveChunks(tenant_id, chunk_ids[])`. Soft-deletes each chunk id
    /// present in the tenant's index; ids that don't exist are ignored.
    #[instrument(skip(self, chunk_ids))]
    pub async fn remove_chunks(&self, tenant_id: TenantId, chunk_ids: &[ChunkId]) -> Result<usize> {
        let entry = self.entry_for(tenant_id);
        let _build_guard = entry.building.lock().await;
        let mut state = entry.state.write().unwrap();
        let Some(index) = state.index.as_mut() else {
            warn!(tenant_id = %tenant_id, "no index found for tenant");
            return Ok(0);
        };

        let mut removed = 0usize;
        for chunk_id in chunk_ids {
            if index.soft_delete(*chunk_id) {
                removed += 1;
            }
        }

        info!(tenant_id = %tenant_id, removed, "soft-deleted chunks in tenant index");
        Ok(removed)
    }

    /// `UpdateChunkMetadata(tenant_id, updates[])`. Merges each update's keys
    /// into the existing metadata of the named chunk.
    #[instrument(skip(self, updates))]
    pub async fn update_chunk_metadata(
        &self,
        tenant_id: TenantId,
        updates: &[ChunkMetadataUpdate],
    ) -> Result<usize> {
        let entry = self.entry_for(tenant_id);
        let _build_guard = entry.building.lock().await;
        let mut state = entry.state.write().unwrap();
        let Some(index) = state.index.as_mut() else {
            warn!(tenant_id = %tenant_id, "no index found for tenant");
            return Ok(0);
        };

        let mut updated = 0usize;
        for update in updates {
            if index.update_metadata(update.chunk_id, update.metadata.clone()) {
                updated += 1;
            }
        }

        info!(tenant_id = %tenant_id, updated, "updated chunk metadata in tenant index");
        Ok(updated)
    }

    /// `Has(tenant_id)`: whether an index currently exists in memory and is
    /// not mid-build.
    pub fn has(&self, tenant_id: TenantId) -> bool {
        let entries = self.entries.lock().unwrap();
        match entries.get(&tenant_id) {
            Some(entry) => {
                let state = entry.state.read().unwrap();
                state.index.is_some() && !state.is_building
            }
            None => false,
        }
    }

    /// `Stats(tenant_id)`: a snapshot of one tenant's index state.
    pub fn stats(&self, tenant_id: TenantId) -> TenantStats {
        self.entry_for(tenant_id).stats(tenant_id)
    }

    /// `Stats()` across every tenant this manager currently tracks.
    pub fn stats_all(&self) -> Vec<TenantStats> {
        let entries = self.entries.lock().unwrap();
        entries
            .iter()
            .map(|(tenant_id, entry)| entry.stats(*tenant_id))
            .collect()
    }

    /// `Get(tenant_id)`: runs `f` against the tenant's index under a read
    /// guard, or returns `None` if no index has been built yet.
    pub fn with_index<F, R>(&self, tenant_id: TenantId, f: F) -> Option<R>
    where
        F: FnOnce(&HnswIndex) -> R,
    {
        let entry = self.entry_for(tenant_id);
        let state = entry.state.read().unwrap();
        state.index.as_ref().map(f)
    }

    /// `Destroy(tenant_id, persist)`: drops the tenant's index from memory,
    /// optionally returning its serialized form first so the caller can
    /// write it to disk (`SaveToDisk`).
    ///
    /// Races a concurrent `BuildOrUpdate`/`AddChunks`/etc. on the same tenant
    /// non-blockingly: if a build is already in flight holding `building`,
    /// the build wins and this returns `GatedHnswError::Conflict` without
    /// touching the entry. Otherwise this acquires `building` itself (so no
    /// build can start while the destroy is in progress) and proceeds.
    #[instrument(skip(self))]
    pub fn destroy(&self, tenant_id: TenantId, persist: bool) -> Result<Option<crate::vector::PersistedIndex>> {
        let entry = {
            let entries = self.entries.lock().unwrap();
            match entries.get(&tenant_id) {
                Some(entry) => entry.clone(),
                None => return Ok(None),
            }
        };

        let _build_guard = entry.building.try_lock().map_err(|_| {
            GatedHnswError::conflict(format!(
                "tenant {tenant_id} has a build in flight; destroy lost the race"
            ))
        })?;

        let mut entries = self.entries.lock().unwrap();
        entries.remove(&tenant_id);
        drop(entries);

        let state = entry.state.read().unwrap();
        let persisted = if persist {
            match state.index.as_ref() {
                Some(index) => Some(index.save()?),
                None => None,
            }
        } else {
            None
        };

        info!(tenant_id = %tenant_id, persist, "destroyed tenant index");
        Ok(persisted)
    }

    /// `LoadPersisted(tenant_id)`: installs a previously-saved index into
    /// memory for `tenant_id`, replacing whatever (if anything) is there.
    /// Does nothing and returns `false` if an index is already present and
    /// not mid-build, matching `has_indexes`' short-circuit in the Python.
    #[instrument(skip(self, persisted))]
    pub async fn load_persisted(
        &self,
        tenant_id: TenantId,
        persisted: crate::vector::PersistedIndex,
        loaded_at: Timestamp,
    ) -> Result<bool> {
        let entry = self.entry_for(tenant_id);
        let _build_guard = entry.building.lock().await;

        if entry.has_index() {
            info!(tenant_id = %tenant_id, "index already in memory, skipping load");
            return Ok(true);
        }

        let index = HnswIndex::load(persisted, None)?;
        let chunk_count = index.size_total() as u64;
        entry.replace_index(index, chunk_count, 0, loaded_at);

        info!(tenant_id = %tenant_id, chunk_count, "loaded persisted index into memory");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{
        AccessDenialLogEntry, ChunkEnrichment, ChunkRecord, ChunkWithEmbedding, DocumentRecord,
        EmbeddingRecord, OrganizationStats,
    };
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct FakeStore {
        chunks: StdMutex<Vec<ChunkWithEmbedding>>,
        needs_reindex: StdMutex<bool>,
    }

    #[async_trait]
    impl MetadataStore for FakeStore {
        async fn get_chunks_and_embeddings_for_organization(
            &self,
            _organization_id: TenantId,
        ) -> Result<Vec<ChunkWithEmbedding>> {
            Ok(self.chunks.lock().unwrap().clone())
        }

        async fn has_embeddings_for_document(&self, _document_id: DocumentId) -> Result<bool> {
            Ok(true)
        }

        async fn get_organization_stats(&self, _organization_id: TenantId) -> Result<OrganizationStats> {
            Ok(OrganizationStats {
                document_count: 0,
                chunk_count: self.chunks.lock().unwrap().len() as u64,
                embedding_count: 0,
                last_index_update: None,
                last_data_change: None,
                needs_reindex: *self.needs_reindex.lock().unwrap(),
            })
        }

        async fn update_last_index_time(&self, _organization_id: TenantId, _at: Timestamp) -> Result<()> {
            Ok(())
        }

        async fn create_document(&self, _document: DocumentRecord) -> Result<()> {
            Ok(())
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

        async fn get_enrichment_for_chunks(
            &self,
            chunk_ids: &[ChunkId],
        ) -> Result<Vec<ChunkEnrichment>> {
            let chunks = self.chunks.lock().unwrap();
            Ok(chunk_ids
                .iter()
                .filter_map(|id| {
                    chunks.iter().find(|c| c.chunk.id == *id).map(|c| ChunkEnrichment {
                        chunk_id: *id,
                        content: c.chunk.content.clone(),
                        document_title: "Doc".to_string(),
                        metadata: c.chunk.metadata.clone(),
                    })
                })
                .collect())
        }

        async fn insert_access_denial_log(&self, _entry: AccessDenialLogEntry) -> Result<()> {
            Ok(())
        }
    }

    fn sample_chunk(doc: DocumentId) -> ChunkWithEmbedding {
        ChunkWithEmbedding {
            chunk: ChunkRecord {
                id: ChunkId::new(),
                document_id: doc,
                organization_id: TenantId::nil(),
                content: "hello".to_string(),
                metadata: Metadata::new(),
                is_deleted: false,
            },
            embedding: Some(vec![1.0, 0.0, 0.0]),
        }
    }

    #[tokio::test]
    async fn build_or_update_builds_fresh_index() {
        let doc = DocumentId::new();
        let store = Arc::new(FakeStore {
            chunks: StdMutex::new(vec![sample_chunk(doc), sample_chunk(doc)]),
            needs_reindex: StdMutex::new(true),
        });
        let manager = TenantIndexManager::new(store, HnswParams::default());
        let tenant_id = TenantId::new();

        let stats = manager.build_or_update(tenant_id, false).await.unwrap();
        assert!(stats.has_index);
        assert_eq!(stats.chunk_count, 2);
        assert_eq!(stats.document_count, 1);
    }

    #[tokio::test]
    async fn build_or_update_skips_when_not_needed() {
        let store = Arc::new(FakeStore {
            chunks: StdMutex::new(vec![sample_chunk(DocumentId::new())]),
            needs_reindex: StdMutex::new(false),
        });
        let manager = TenantIndexManager::new(store.clone(), HnswParams::default());
        let tenant_id = TenantId::new();

        manager.build_or_update(tenant_id, true).await.unwrap();
        store.chunks.lock().unwrap().push(sample_chunk(DocumentId::new()));
        let stats = manager.build_or_update(tenant_id, false).await.unwrap();
        assert_eq!(stats.chunk_count, 1, "second call should not have rebuilt");
    }

    #[tokio::test]
    async fn add_chunks_builds_first_when_no_index_exists() {
        let store = Arc::new(FakeStore::default());
        let manager = TenantIndexManager::new(store, HnswParams::default());
        let tenant_id = TenantId::new();

        let mut metadata = Metadata::new();
        metadata.insert(
            "accessLevel".to_string(),
            crate::types::Value::string("PUBLIC"),
        );
        let inserted = manager
            .add_chunks(
                tenant_id,
                vec![NewChunk {
                    chunk_id: ChunkId::new(),
                    document_id: DocumentId::new(),
                    embedding: Some(vec![0.0, 1.0, 0.0]),
                    metadata,
                }],
            )
            .await
            .unwrap();

        assert_eq!(inserted, 1);
        assert!(manager.has(tenant_id));
    }

    #[tokio::test]
    async fn remove_chunks_soft_deletes_present_ids() {
        let doc = DocumentId::new();
        let chunk = sample_chunk(doc);
        let chunk_id = chunk.chunk.id;
        let store = Arc::new(FakeStore {
            chunks: StdMutex::new(vec![chunk]),
            needs_reindex: StdMutex::new(true),
        });
        let manager = TenantIndexManager::new(store, HnswParams::default());
        let tenant_id = TenantId::new();

        manager.build_or_update(tenant_id, false).await.unwrap();
        let removed = manager.remove_chunks(tenant_id, &[chunk_id]).await.unwrap();
        assert_eq!(removed, 1);
    }

    #[test]
    fn destroy_removes_entry_without_persisting() {
        let store: Arc<dyn MetadataStore> = Arc::new(FakeStore::default());
        let manager = TenantIndexManager::new(store, HnswParams::default());
        let tenant_id = TenantId::new();

        manager.entry_for(tenant_id);
        let persisted = manager.destroy(tenant_id, false).unwrap();
        assert!(persisted.is_none());
        assert!(!manager.has(tenant_id));
    }

    #[tokio::test]
    async fn destroy_reports_conflict_when_build_in_flight() {
        let store: Arc<dyn MetadataStore> = Arc::new(FakeStore::default());
        let manager = TenantIndexManager::new(store, HnswParams::default());
        let tenant_id = TenantId::new();

        let entry = manager.entry_for(tenant_id);
        let _build_guard = entry.building.lock().await;

        let err = manager.destroy(tenant_id, false).unwrap_err();
        assert!(matches!(err, GatedHnswError::Conflict(_)));
    }
}
