//! A `redb`-backed reference implementation of [`MetadataStore`].
//!
//! Not the mandated production backend — the core only requires the trait.
//! This exists as a self-contained test/demo backend, grounded on the
//! table-definition and bincode-record idiom from the teacher's
//! `storage::schema`/`storage::redb`.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::error::{Result, StoreError};
use crate::types::{AccessLevel, ChunkId, DocumentId, GroupId, TenantId, Timestamp, Vector};

use super::{
    AccessDenialLogEntry, ChunkEnrichment, ChunkRecord, ChunkWithEmbedding, DocumentRecord,
    EmbeddingRecord, MetadataStore, OrganizationStats,
};

const DOCUMENTS_TABLE: TableDefinition<&[u8; 16], &[u8]> = TableDefinition::new("documents");
const CHUNKS_TABLE: TableDefinition<&[u8; 16], &[u8]> = TableDefinition::new("chunks");
const EMBEDDINGS_TABLE: TableDefinition<&[u8; 16], &[u8]> = TableDefinition::new("embeddings");
const ORG_STATS_TABLE: TableDefinition<&[u8; 16], &[u8]> = TableDefinition::new("org_stats");
const DENIAL_LOG_TABLE: TableDefinition<&[u8; 24], &[u8]> = TableDefinition::new("denial_log");

#[derive(Clone, Debug, Serialize, Deserialize)]
struct StoredDocument {
    organization_id: TenantId,
    title: String,
    access_level: AccessLevel,
    group_id: Option<String>,
    restricted_to_users: Vec<String>,
    metadata: crate::types::Metadata,
    is_deleted: bool,
    created_at: i64,
    updated_at: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct StoredChunk {
    document_id: DocumentId,
    organization_id: TenantId,
    content: String,
    metadata: crate::types::Metadata,
    is_deleted: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct StoredEmbedding {
    chunk_id: ChunkId,
    document_id: DocumentId,
    organization_id: TenantId,
    vector: Vector,
    is_deleted: bool,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
struct StoredOrgStats {
    last_index_update: Option<i64>,
    last_data_change: Option<i64>,
}

/// A `redb`-backed metadata store. One file per deployment; all tenants
/// share the same database, partitioned by key prefix.
pub struct RedbMetadataStore {
    db: Mutex<Database>,
    path: PathBuf,
}

impl RedbMetadataStore {
    /// Opens or creates the database at `path`, creating empty tables on
    /// first use.
    #[instrument(fields(path = %path.as_ref().display()))]
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let db = Database::create(path).map_err(|e| StoreError::backend(e.to_string()))?;

        {
            let write_txn = db.begin_write().map_err(|e| StoreError::backend(e.to_string()))?;
            write_txn
                .open_table(DOCUMENTS_TABLE)
                .map_err(|e| StoreError::backend(e.to_string()))?;
            write_txn
                .open_table(CHUNKS_TABLE)
                .map_err(|e| StoreError::backend(e.to_string()))?;
            write_txn
                .open_table(EMBEDDINGS_TABLE)
                .map_err(|e| StoreError::backend(e.to_string()))?;
            write_txn
                .open_table(ORG_STATS_TABLE)
                .map_err(|e| StoreError::backend(e.to_string()))?;
            write_txn
                .open_table(DENIAL_LOG_TABLE)
                .map_err(|e| StoreError::backend(e.to_string()))?;
            write_txn.commit().map_err(|e| StoreError::backend(e.to_string()))?;
        }

        debug!("opened redb metadata store");
        Ok(Self {
            db: Mutex::new(db),
            path: path.to_path_buf(),
        })
    }

    /// The path this store was opened at.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn denial_key(ts: Timestamp, seq: u64) -> [u8; 24] {
        let mut key = [0u8; 24];
        key[..8].copy_from_slice(&ts.to_be_bytes());
        key[8..].copy_from_slice(&seq.to_be_bytes());
        key
    }
}

#[async_trait]
impl MetadataStore for RedbMetadataStore {
    async fn get_chunks_and_embeddings_for_organization(
        &self,
        organization_id: TenantId,
    ) -> Result<Vec<ChunkWithEmbedding>> {
        let db = self.db.lock().unwrap();
        let read_txn = db.begin_read().map_err(|e| StoreError::backend(e.to_string()))?;
        let chunks_table = read_txn
            .open_table(CHUNKS_TABLE)
            .map_err(|e| StoreError::backend(e.to_string()))?;
        let embeddings_table = read_txn
            .open_table(EMBEDDINGS_TABLE)
            .map_err(|e| StoreError::backend(e.to_string()))?;

        let mut results = Vec::new();
        for entry in chunks_table.iter().map_err(|e| StoreError::backend(e.to_string()))? {
            let (key, value) = entry.map_err(|e| StoreError::backend(e.to_string()))?;
            let chunk_id = ChunkId::from_bytes(*key.value());
            let stored: StoredChunk = bincode::deserialize(value.value())
                .map_err(|e| StoreError::backend(e.to_string()))?;

            if stored.is_deleted || stored.organization_id != organization_id {
                continue;
            }

            let embedding = embeddings_table
                .get(chunk_id.as_bytes())
                .map_err(|e| StoreError::backend(e.to_string()))?
                .and_then(|v| bincode::deserialize::<StoredEmbedding>(v.value()).ok())
                .filter(|e| !e.is_deleted)
                .map(|e| e.vector);

            results.push(ChunkWithEmbedding {
                chunk: ChunkRecord {
                    id: chunk_id,
                    document_id: stored.document_id,
                    organization_id: stored.organization_id,
                    content: stored.content,
                    metadata: stored.metadata,
                    is_deleted: stored.is_deleted,
                },
                embedding,
            });
        }

        Ok(results)
    }

    async fn has_embeddings_for_document(&self, document_id: DocumentId) -> Result<bool> {
        let db = self.db.lock().unwrap();
        let read_txn = db.begin_read().map_err(|e| StoreError::backend(e.to_string()))?;
        let table = read_txn
            .open_table(EMBEDDINGS_TABLE)
            .map_err(|e| StoreError::backend(e.to_string()))?;
        for entry in table.iter().map_err(|e| StoreError::backend(e.to_string()))? {
            let (_, value) = entry.map_err(|e| StoreError::backend(e.to_string()))?;
            if let Ok(stored) = bincode::deserialize::<StoredEmbedding>(value.value()) {
                if !stored.is_deleted && stored.document_id == document_id {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    async fn get_organization_stats(&self, organization_id: TenantId) -> Result<OrganizationStats> {
        let db = self.db.lock().unwrap();
        let read_txn = db.begin_read().map_err(|e| StoreError::backend(e.to_string()))?;

        let documents = read_txn
            .open_table(DOCUMENTS_TABLE)
            .map_err(|e| StoreError::backend(e.to_string()))?;
        let chunks = read_txn
            .open_table(CHUNKS_TABLE)
            .map_err(|e| StoreError::backend(e.to_string()))?;
        let embeddings = read_txn
            .open_table(EMBEDDINGS_TABLE)
            .map_err(|e| StoreError::backend(e.to_string()))?;
        let org_stats = read_txn
            .open_table(ORG_STATS_TABLE)
            .map_err(|e| StoreError::backend(e.to_string()))?;

        let count_live = |table: &redb::ReadOnlyTable<&[u8; 16], &[u8]>,
                           filter: &dyn Fn(&[u8]) -> bool|
         -> Result<u64> {
            let mut n = 0u64;
            for entry in table.iter().map_err(|e| StoreError::backend(e.to_string()))? {
                let (_, value) = entry.map_err(|e| StoreError::backend(e.to_string()))?;
                if filter(value.value()) {
                    n += 1;
                }
            }
            Ok(n)
        };

        let document_count = count_live(&documents, &|bytes| {
            bincode::deserialize::<StoredDocument>(bytes)
                .map(|d| !d.is_deleted && d.organization_id == organization_id)
                .unwrap_or(false)
        })?;
        let chunk_count = count_live(&chunks, &|bytes| {
            bincode::deserialize::<StoredChunk>(bytes)
                .map(|c| !c.is_deleted && c.organization_id == organization_id)
                .unwrap_or(false)
        })?;
        let embedding_count = count_live(&embeddings, &|bytes| {
            bincode::deserialize::<StoredEmbedding>(bytes)
                .map(|e| !e.is_deleted && e.organization_id == organization_id)
                .unwrap_or(false)
        })?;

        let stored_stats = org_stats
            .get(organization_id.as_bytes())
            .map_err(|e| StoreError::backend(e.to_string()))?
            .and_then(|v| bincode::deserialize::<StoredOrgStats>(v.value()).ok());

        let last_index_update = stored_stats.and_then(|s| s.last_index_update).map(Timestamp::from_millis);
        let last_data_change = stored_stats.and_then(|s| s.last_data_change).map(Timestamp::from_millis);

        let needs_reindex = match (last_data_change, last_index_update) {
            (Some(changed), Some(indexed)) => changed > indexed,
            (Some(_), None) => true,
            _ => false,
        };

        Ok(OrganizationStats {
            document_count,
            chunk_count,
            embedding_count,
            last_index_update,
            last_data_change,
            needs_reindex,
        })
    }

    async fn update_last_index_time(&self, organization_id: TenantId, at: Timestamp) -> Result<()> {
        let db = self.db.lock().unwrap();
        let write_txn = db.begin_write().map_err(|e| StoreError::backend(e.to_string()))?;
        {
            let mut table = write_txn
                .open_table(ORG_STATS_TABLE)
                .map_err(|e| StoreError::backend(e.to_string()))?;
            let mut stats = table
                .get(organization_id.as_bytes())
                .map_err(|e| StoreError::backend(e.to_string()))?
                .and_then(|v| bincode::deserialize::<StoredOrgStats>(v.value()).ok())
                .unwrap_or(StoredOrgStats {
                    last_index_update: None,
                    last_data_change: None,
                });
            stats.last_index_update = Some(at.as_millis());
            let bytes = bincode::serialize(&stats).map_err(|e| StoreError::backend(e.to_string()))?;
            table
                .insert(organization_id.as_bytes(), bytes.as_slice())
                .map_err(|e| StoreError::backend(e.to_string()))?;
        }
        write_txn.commit().map_err(|e| StoreError::backend(e.to_string()))?;
        Ok(())
    }

    async fn create_document(&self, document: DocumentRecord) -> Result<()> {
        let stored = StoredDocument {
            organization_id: document.organization_id,
            title: document.title,
            access_level: document.access_level,
            group_id: document.group_id.map(|g| g.0),
            restricted_to_users: document.restricted_to_users,
            metadata: document.metadata,
            is_deleted: document.is_deleted,
            created_at: document.created_at.as_millis(),
            updated_at: document.updated_at.as_millis(),
        };
        let bytes = bincode::serialize(&stored).map_err(|e| StoreError::backend(e.to_string()))?;

        let db = self.db.lock().unwrap();
        let write_txn = db.begin_write().map_err(|e| StoreError::backend(e.to_string()))?;
        {
            let mut table = write_txn
                .open_table(DOCUMENTS_TABLE)
                .map_err(|e| StoreError::backend(e.to_string()))?;
            table
                .insert(document.id.as_bytes(), bytes.as_slice())
                .map_err(|e| StoreError::backend(e.to_string()))?;
        }
        write_txn.commit().map_err(|e| StoreError::backend(e.to_string()))?;
        Ok(())
    }

    async fn create_chunk(&self, chunk: ChunkRecord) -> Result<()> {
        let stored = StoredChunk {
            document_id: chunk.document_id,
            organization_id: chunk.organization_id,
            content: chunk.content,
            metadata: chunk.metadata,
            is_deleted: chunk.is_deleted,
        };
        let bytes = bincode::serialize(&stored).map_err(|e| StoreError::backend(e.to_string()))?;

        let db = self.db.lock().unwrap();
        let write_txn = db.begin_write().map_err(|e| StoreError::backend(e.to_string()))?;
        {
            let mut table = write_txn
                .open_table(CHUNKS_TABLE)
                .map_err(|e| StoreError::backend(e.to_string()))?;
            table
                .insert(chunk.id.as_bytes(), bytes.as_slice())
                .map_err(|e| StoreError::backend(e.to_string()))?;
        }
        write_txn.commit().map_err(|e| StoreError::backend(e.to_string()))?;
        Ok(())
    }

    async fn create_embedding(&self, embedding: EmbeddingRecord) -> Result<()> {
        let stored = StoredEmbedding {
            chunk_id: embedding.chunk_id,
            document_id: embedding.document_id,
            organization_id: embedding.organization_id,
            vector: embedding.vector,
            is_deleted: embedding.is_deleted,
        };
        let bytes = bincode::serialize(&stored).map_err(|e| StoreError::backend(e.to_string()))?;

        let db = self.db.lock().unwrap();
        let write_txn = db.begin_write().map_err(|e| StoreError::backend(e.to_string()))?;
        {
            let mut table = write_txn
                .open_table(EMBEDDINGS_TABLE)
                .map_err(|e| StoreError::backend(e.to_string()))?;
            table
                .insert(embedding.chunk_id.as_bytes(), bytes.as_slice())
                .map_err(|e| StoreError::backend(e.to_string()))?;
        }
        write_txn.commit().map_err(|e| StoreError::backend(e.to_string()))?;
        Ok(())
    }

    async fn soft_delete_chunks(&self, chunk_ids: &[ChunkId]) -> Result<u64> {
        let db = self.db.lock().unwrap();
        let write_txn = db.begin_write().map_err(|e| StoreError::backend(e.to_string()))?;
        let mut updated = 0u64;
        {
            let mut table = write_txn
                .open_table(CHUNKS_TABLE)
                .map_err(|e| StoreError::backend(e.to_string()))?;
            for chunk_id in chunk_ids {
                let existing = table
                    .get(chunk_id.as_bytes())
                    .map_err(|e| StoreError::backend(e.to_string()))?
                    .and_then(|v| bincode::deserialize::<StoredChunk>(v.value()).ok());
                if let Some(mut stored) = existing {
                    stored.is_deleted = true;
                    let bytes =
                        bincode::serialize(&stored).map_err(|e| StoreError::backend(e.to_string()))?;
                    table
                        .insert(chunk_id.as_bytes(), bytes.as_slice())
                        .map_err(|e| StoreError::backend(e.to_string()))?;
                    updated += 1;
                }
            }
        }
        write_txn.commit().map_err(|e| StoreError::backend(e.to_string()))?;
        Ok(updated)
    }

    async fn get_enrichment_for_chunks(&self, chunk_ids: &[ChunkId]) -> Result<Vec<ChunkEnrichment>> {
        let db = self.db.lock().unwrap();
        let read_txn = db.begin_read().map_err(|e| StoreError::backend(e.to_string()))?;
        let chunks_table = read_txn
            .open_table(CHUNKS_TABLE)
            .map_err(|e| StoreError::backend(e.to_string()))?;
        let documents_table = read_txn
            .open_table(DOCUMENTS_TABLE)
            .map_err(|e| StoreError::backend(e.to_string()))?;

        let mut results = Vec::with_capacity(chunk_ids.len());
        for chunk_id in chunk_ids {
            let Some(stored_chunk) = chunks_table
                .get(chunk_id.as_bytes())
                .map_err(|e| StoreError::backend(e.to_string()))?
                .and_then(|v| bincode::deserialize::<StoredChunk>(v.value()).ok())
            else {
                continue;
            };
            if stored_chunk.is_deleted {
                continue;
            }
            let document_title = documents_table
                .get(stored_chunk.document_id.as_bytes())
                .map_err(|e| StoreError::backend(e.to_string()))?
                .and_then(|v| bincode::deserialize::<StoredDocument>(v.value()).ok())
                .map(|d| d.title)
                .unwrap_or_default();

            results.push(ChunkEnrichment {
                chunk_id: *chunk_id,
                content: stored_chunk.content,
                document_title,
                metadata: stored_chunk.metadata,
            });
        }

        Ok(results)
    }

    async fn insert_access_denial_log(&self, entry: AccessDenialLogEntry) -> Result<()> {
        #[derive(Serialize)]
        struct StoredDenial<'a> {
            organization_id: TenantId,
            user_id: &'a str,
            search_query: &'a str,
            chunk_id: ChunkId,
            document_id: DocumentId,
            group_id: Option<&'a str>,
            access_level: AccessLevel,
            denial_reason: &'a str,
            similarity: f32,
        }

        let stored = StoredDenial {
            organization_id: entry.organization_id,
            user_id: &entry.user_id,
            search_query: &entry.search_query,
            chunk_id: entry.chunk_id,
            document_id: entry.document_id,
            group_id: entry.group_id.as_ref().map(GroupId::as_str),
            access_level: entry.access_level,
            denial_reason: &entry.denial_reason,
            similarity: entry.similarity,
        };
        let bytes = bincode::serialize(&stored).map_err(|e| StoreError::backend(e.to_string()))?;

        let db = self.db.lock().unwrap();
        let write_txn = db.begin_write().map_err(|e| StoreError::backend(e.to_string()))?;
        {
            let mut table = write_txn
                .open_table(DENIAL_LOG_TABLE)
                .map_err(|e| StoreError::backend(e.to_string()))?;
            let key = Self::denial_key(entry.timestamp, fastrand_seq());
            table
                .insert(&key, bytes.as_slice())
                .map_err(|e| StoreError::backend(e.to_string()))?;
        }
        write_txn.commit().map_err(|e| StoreError::backend(e.to_string()))?;
        Ok(())
    }
}

/// A process-local monotonic counter, used only to disambiguate denial-log
/// keys sharing the same millisecond timestamp.
fn fastrand_seq() -> u64 {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    COUNTER.fetch_add(1, Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Value;
    use std::collections::BTreeMap;

    fn sample_document(org: TenantId) -> DocumentRecord {
        DocumentRecord {
            id: DocumentId::new(),
            organization_id: org,
            title: "Doc".to_string(),
            access_level: AccessLevel::Public,
            group_id: None,
            restricted_to_users: vec![],
            metadata: BTreeMap::new(),
            is_deleted: false,
            created_at: Timestamp::now(),
            updated_at: Timestamp::now(),
        }
    }

    #[tokio::test]
    async fn create_and_fetch_chunk_with_embedding() {
        let dir = tempfile::tempdir().unwrap();
        let store = RedbMetadataStore::open(dir.path().join("store.redb")).unwrap();

        let org = TenantId::new();
        let doc = sample_document(org);
        store.create_document(doc.clone()).await.unwrap();

        let chunk_id = ChunkId::new();
        let mut metadata = BTreeMap::new();
        metadata.insert("accessLevel".to_string(), Value::string("PUBLIC"));
        store
            .create_chunk(ChunkRecord {
                id: chunk_id,
                document_id: doc.id,
                organization_id: org,
                content: "hello".to_string(),
                metadata,
                is_deleted: false,
            })
            .await
            .unwrap();
        store
            .create_embedding(EmbeddingRecord {
                id: uuid::Uuid::now_v7(),
                chunk_id,
                document_id: doc.id,
                organization_id: org,
                vector: vec![1.0, 0.0],
                is_deleted: false,
            })
            .await
            .unwrap();

        let fetched = store
            .get_chunks_and_embeddings_for_organization(org)
            .await
            .unwrap();
        assert_eq!(fetched.len(), 1);
        assert_eq!(fetched[0].chunk.id, chunk_id);
        assert_eq!(fetched[0].embedding, Some(vec![1.0, 0.0]));
    }

    #[tokio::test]
    async fn soft_delete_excludes_from_bulk_fetch() {
        let dir = tempfile::tempdir().unwrap();
        let store = RedbMetadataStore::open(dir.path().join("store.redb")).unwrap();
        let org = TenantId::new();
        let doc = sample_document(org);
        store.create_document(doc.clone()).await.unwrap();

        let chunk_id = ChunkId::new();
        store
            .create_chunk(ChunkRecord {
                id: chunk_id,
                document_id: doc.id,
                organization_id: org,
                content: "hello".to_string(),
                metadata: BTreeMap::new(),
                is_deleted: false,
            })
            .await
            .unwrap();

        store.soft_delete_chunks(&[chunk_id]).await.unwrap();

        let fetched = store
            .get_chunks_and_embeddings_for_organization(org)
            .await
            .unwrap();
        assert!(fetched.is_empty());
    }
}
