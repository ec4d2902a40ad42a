//! The external metadata store collaborator (`spec.md` §6).
//!
//! `MetadataStore` is the trait boundary for everything the core needs from
//! the SQL-backed document/chunk/embedding/organization/denial-log schema.
//! Shaped after the teacher's `StorageEngine` trait (one cohesive
//! `Send + Sync` trait, `Result`-returning, record structs rather than raw
//! rows) but made `async_trait` since a real backend talks to a network
//! database rather than an embedded file.

#[cfg(feature = "redb-store")]
pub mod redb_store;

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{AccessLevel, ChunkId, DocumentId, GroupId, Metadata, TenantId, Timestamp, Vector};

/// A document row, as read from the external store.
#[derive(Clone, Debug, PartialEq)]
pub struct DocumentRecord {
    /// Document id.
    pub id: DocumentId,
    /// Owning tenant.
    pub organization_id: TenantId,
    /// Display title.
    pub title: String,
    /// Permission block access level.
    pub access_level: AccessLevel,
    /// Group id, relevant when `access_level == Group`.
    pub group_id: Option<GroupId>,
    /// User ids, relevant when `access_level == Restricted`.
    pub restricted_to_users: Vec<String>,
    /// Open-ended document metadata.
    pub metadata: Metadata,
    /// Soft-delete marker.
    pub is_deleted: bool,
    /// Creation time.
    pub created_at: Timestamp,
    /// Last update time.
    pub updated_at: Timestamp,
}

/// A chunk row, as read from the external store.
#[derive(Clone, Debug, PartialEq)]
pub struct ChunkRecord {
    /// Chunk id.
    pub id: ChunkId,
    /// Parent document.
    pub document_id: DocumentId,
    /// Owning tenant (denormalized for bulk-fetch efficiency).
    pub organization_id: TenantId,
    /// Chunk text content.
    pub content: String,
    /// Open-ended chunk metadata, including the permission sub-fields.
    pub metadata: Metadata,
    /// Soft-delete marker.
    pub is_deleted: bool,
}

/// An embedding row. `vector` is the little-endian concatenation of
/// single-precision floats on the wire; the store is responsible for
/// decoding it into [`Vector`] before handing it to the core.
#[derive(Clone, Debug, PartialEq)]
pub struct EmbeddingRecord {
    /// Embedding id.
    pub id: uuid::Uuid,
    /// Owning chunk.
    pub chunk_id: ChunkId,
    /// Owning document (denormalized).
    pub document_id: DocumentId,
    /// Owning tenant (denormalized).
    pub organization_id: TenantId,
    /// The decoded embedding vector.
    pub vector: Vector,
    /// Soft-delete marker.
    pub is_deleted: bool,
}

/// A chunk joined with its live embedding, the shape the bulk fetch returns.
#[derive(Clone, Debug, PartialEq)]
pub struct ChunkWithEmbedding {
    /// The chunk row.
    pub chunk: ChunkRecord,
    /// The chunk's embedding, if one has been computed and is live.
    pub embedding: Option<Vector>,
}

/// Aggregate organization stats, used by `BuildOrUpdate` to decide whether a
/// rebuild is necessary.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct OrganizationStats {
    /// Live document count.
    pub document_count: u64,
    /// Live chunk count.
    pub chunk_count: u64,
    /// Live embedding count.
    pub embedding_count: u64,
    /// When the tenant's index was last successfully built.
    pub last_index_update: Option<Timestamp>,
    /// When the tenant's underlying data last changed.
    pub last_data_change: Option<Timestamp>,
    /// Whether `last_data_change > last_index_update` (or no index exists yet).
    pub needs_reindex: bool,
}

/// The `{content, document_title}` enrichment row for one chunk, fetched by
/// the search service after an `HnswIndex::search` call (`spec.md` §4.5 step 5).
#[derive(Clone, Debug, PartialEq)]
pub struct ChunkEnrichment {
    /// The chunk this enrichment row belongs to.
    pub chunk_id: ChunkId,
    /// The chunk's text content.
    pub content: String,
    /// The parent document's display title.
    pub document_title: String,
    /// The chunk's stored metadata, to be merged into the result's
    /// index-evaluated metadata for generic keys only.
    pub metadata: Metadata,
}

/// Everything needed to append one access-denial log row.
#[derive(Clone, Debug, PartialEq)]
pub struct AccessDenialLogEntry {
    /// Owning tenant.
    pub organization_id: TenantId,
    /// The caller whose request was denied.
    pub user_id: String,
    /// The query text that surfaced the denial.
    pub search_query: String,
    /// The chunk that was denied.
    pub chunk_id: ChunkId,
    /// The chunk's parent document.
    pub document_id: DocumentId,
    /// The group id involved in the denial, if any.
    pub group_id: Option<GroupId>,
    /// The access level that caused the denial.
    pub access_level: AccessLevel,
    /// A short machine-readable reason code.
    pub denial_reason: String,
    /// `1 / (1 + distance)` at the moment of denial.
    pub similarity: f32,
    /// Additional free-form metadata.
    pub metadata: Metadata,
    /// When the denial was observed.
    pub timestamp: Timestamp,
}

/// The external metadata store collaborator.
///
/// Implementations must be `Send + Sync` so a single store can be shared
/// across the tenant manager and the search service behind a connection
/// pool (`spec.md` §5).
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Bulk fetch of every live chunk in `organization_id`, joined with its
    /// live embedding if one exists. Chunks belonging to soft-deleted
    /// documents are excluded.
    async fn get_chunks_and_embeddings_for_organization(
        &self,
        organization_id: TenantId,
    ) -> Result<Vec<ChunkWithEmbedding>>;

    /// Whether `document_id` has at least one live embedding.
    async fn has_embeddings_for_document(&self, document_id: DocumentId) -> Result<bool>;

    /// Aggregate stats used to decide whether a tenant's index needs a rebuild.
    async fn get_organization_stats(&self, organization_id: TenantId) -> Result<OrganizationStats>;

    /// Records that `organization_id`'s index was just rebuilt/updated.
    async fn update_last_index_time(&self, organization_id: TenantId, at: Timestamp) -> Result<()>;

    /// Creates a document row.
    async fn create_document(&self, document: DocumentRecord) -> Result<()>;

    /// Creates a chunk row.
    async fn create_chunk(&self, chunk: ChunkRecord) -> Result<()>;

    /// Creates an embedding row.
    async fn create_embedding(&self, embedding: EmbeddingRecord) -> Result<()>;

    /// Soft-deletes the given chunks (bulk update, not a physical delete).
    async fn soft_delete_chunks(&self, chunk_ids: &[ChunkId]) -> Result<u64>;

    /// Fetches `{content, document_title}` plus stored metadata for each of
    /// `chunk_ids`, joining chunks to their parent document. Ids with no
    /// live chunk row are silently omitted from the result.
    async fn get_enrichment_for_chunks(&self, chunk_ids: &[ChunkId]) -> Result<Vec<ChunkEnrichment>>;

    /// Appends one row to the append-only access-denial log.
    async fn insert_access_denial_log(&self, entry: AccessDenialLogEntry) -> Result<()>;
}
