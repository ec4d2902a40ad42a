//! # GatedHNSW
//!
//! Per-tenant, permission-aware HNSW vector search with a deterministic
//! ingestion pipeline for turning raw documents into searchable, contextualized
//! chunks.
//!
//! GatedHNSW keeps one independent HNSW graph per tenant and evaluates every
//! search against a caller-supplied permission context (`accessLevel`,
//! `groupId`, `restrictedToUsers`) at traversal time — a denied chunk is never
//! returned, and denials are observed on a fire-and-forget sink rather than
//! blocking the query path.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use gatedhnsw::{Config, TenantIndexManager, SearchService};
//! use std::sync::Arc;
//!
//! let config = Config::default();
//! let store: Arc<dyn gatedhnsw::MetadataStore> = todo!("your store implementation");
//! let embedder: Arc<dyn gatedhnsw::Embedder> = todo!("your embedder implementation");
//!
//! let tenants = Arc::new(TenantIndexManager::new(store.clone(), config.hnsw));
//! let service = SearchService::new(
//!     tenants.clone(),
//!     store,
//!     embedder,
//!     None,
//!     config.default_k,
//!     config.max_k,
//! );
//! ```
//!
//! ## Key Concepts
//!
//! ### Tenant
//!
//! A **tenant** owns one isolated HNSW index. Every mutating operation on a
//! tenant's index is serialized; reads and searches never block on a build.
//!
//! ### Chunk
//!
//! A **chunk** is the unit of retrieval: a section of a document, embedded,
//! tagged with permission metadata, and inserted into its tenant's graph.
//!
//! ### Permission block
//!
//! Every chunk carries `accessLevel` (`PUBLIC`/`GROUP`/`MANAGERS`/`ADMINS`/
//! `RESTRICTED`) plus the `groupId`/`restrictedToUsers` fields that
//! `accessLevel` requires. A search's `PermissionContext` is evaluated against
//! this block during traversal, not as a post-filter.
//!
//! ### Collaborators
//!
//! The core never talks to a database, an embedding API, or an LLM directly —
//! it calls through the [`MetadataStore`], [`Embedder`], and [`LlmClient`]
//! traits. A `redb`-backed reference [`MetadataStore`] is bundled behind the
//! `redb-store` feature.
//!
//! ## Features
//!
//! - `redb-store` — enables the bundled `redb`-backed `MetadataStore`.
//!
//! ## Thread Safety
//!
//! [`TenantIndexManager`], [`SearchService`], and [`PipelineCoordinator`] are
//! all `Send + Sync` and designed to be shared behind an `Arc` across tasks.

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![deny(unsafe_op_in_unsafe_fn)]

// ============================================================================
// Module declarations
// ============================================================================

mod config;
mod error;
mod types;

pub mod chunking;
pub mod context;
pub mod denial;
pub mod embedding;
pub mod llm;
pub mod metadata_extract;
pub mod pipeline;
pub mod search;
pub mod store;
pub mod tenant;

/// Vector index module for HNSW-based approximate nearest neighbor search.
pub mod vector;

// ============================================================================
// Public API re-exports
// ============================================================================

// Configuration
pub use config::{Config, DenialSinkConfig, HnswParams, StorePoolConfig};

// Error handling
pub use error::{ChunkingError, ConfigError, GatedHnswError, IndexError, Result, StoreError};

// Core types
pub use types::{
    AccessLevel, ChunkId, DocumentId, GroupId, Metadata, NodeId, TenantId, Timestamp, UserId,
    UserRole, Value, Vector,
};

// Tenant Index Manager
pub use tenant::{ChunkMetadataUpdate, NewChunk, TenantIndexManager, TenantStats};

// Search Service
pub use search::{
    IndexesUsed, SearchFilterInput, SearchPermissions, SearchResponse, SearchResult, SearchService,
};

// Pipeline Coordinator
pub use pipeline::{IngestReport, IngestRequest, IngestStatus, PipelineCoordinator};

// Contextualization + Metadata
pub use context::Contextualizer;
pub use metadata_extract::{ExtractedMetadata, MetadataExtractor};

// External collaborators
pub use embedding::Embedder;
pub use llm::{GeneratedAnswer, LlmClient};
pub use store::{
    AccessDenialLogEntry, ChunkEnrichment, ChunkRecord, ChunkWithEmbedding, DocumentRecord,
    EmbeddingRecord, MetadataStore, OrganizationStats,
};

// Denial observation
pub use denial::{DenialEvent, DenialSink};

// Vector index internals (for advanced users building their own tenant manager)
pub use vector::{Filter, FilterOp, GenericPredicate, HnswIndex, PermissionContext, SearchHit};

// ============================================================================
// Prelude module for convenient imports
// ============================================================================

/// Convenient imports for common GatedHNSW usage.
///
/// ```rust
/// use gatedhnsw::prelude::*;
/// ```
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::error::{GatedHnswError, Result};
    pub use crate::pipeline::{IngestRequest, PipelineCoordinator};
    pub use crate::search::{SearchFilterInput, SearchPermissions, SearchService};
    pub use crate::tenant::TenantIndexManager;
    pub use crate::types::{AccessLevel, ChunkId, DocumentId, TenantId, Timestamp};
}
