//! Search Service (`spec.md` §4.5 / C5).
//!
//! `Search(query_text, tenant_id, filter, k)`: fetch-or-build the tenant's
//! index, embed the query, delegate to [`HnswIndex::search`] with the
//! permission block carried through so denials can be observed, then enrich
//! the surviving hits with stored `{content, document_title}` — without ever
//! letting the store's metadata overwrite the permission keys the index
//! already evaluated against. Grounded on `search_service.py`'s
//! `SearchService.search`/`_parse_filters`/`_search_hnsw`/`_enrich_results`,
//! diverging from its `_enrich_results` only in the metadata merge order
//! (`DESIGN.md` records why).

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use tracing::{instrument, warn};

use crate::denial::DenialSink;
use crate::embedding::Embedder;
use crate::error::Result;
use crate::store::MetadataStore;
use crate::tenant::TenantIndexManager;
use crate::types::{ChunkId, DocumentId, GroupId, Metadata, TenantId, UserId, UserRole, Value};
use crate::vector::filter::{permission_passes, Filter, FilterOp, GenericPredicate, PermissionContext};
use crate::vector::SearchObservationContext;

/// Caller-supplied permission context, mirroring the `filters.permissions`
/// sub-object of the original request shape.
#[derive(Clone, Debug, PartialEq)]
pub struct SearchPermissions {
    /// The caller's user id.
    pub user_id: String,
    /// The caller's role.
    pub user_role: UserRole,
    /// Groups the caller belongs to.
    pub user_group_ids: Vec<String>,
}

impl From<SearchPermissions> for PermissionContext {
    fn from(p: SearchPermissions) -> Self {
        PermissionContext {
            user_id: UserId::new(p.user_id),
            user_role: p.user_role,
            user_group_ids: p.user_group_ids.into_iter().map(GroupId::new).collect(),
        }
    }
}

/// A caller's raw search request filters: an optional permission block plus
/// arbitrary generic metadata predicates (`spec.md` §4.1's operator map).
#[derive(Clone, Debug, Default)]
pub struct SearchFilterInput {
    /// Permission sub-structure; `None` means the search runs unauthenticated
    /// and the permission block is skipped entirely.
    pub permissions: Option<SearchPermissions>,
    /// Generic metadata key → raw filter value. A scalar means equality, a
    /// list means membership, and a map means an operator map keyed by
    /// `$in`/`$gte`/`$lte`/`$ne`.
    pub generic: BTreeMap<String, Value>,
}

/// Canonicalizes a raw request filter into the internal [`Filter`]
/// (`_parse_filters` in the original).
fn parse_filters(input: SearchFilterInput) -> Filter {
    let generic = input
        .generic
        .into_iter()
        .map(|(key, value)| (key, generic_predicate_from_value(value)))
        .collect();

    Filter {
        permissions: input.permissions.map(Into::into),
        generic,
    }
}

fn generic_predicate_from_value(value: Value) -> GenericPredicate {
    match value {
        Value::List(items) => GenericPredicate::MemberOf(items),
        Value::Map(ops) => {
            let mut out = Vec::new();
            for (op, operand) in ops {
                match op.as_str() {
                    "$in" => {
                        if let Value::List(items) = operand {
                            out.push(FilterOp::In(items));
                        }
                    }
                    "$ne" => out.push(FilterOp::Ne(operand)),
                    "$gte" => {
                        if let Some(n) = operand.as_f64() {
                            out.push(FilterOp::Gte(n));
                        }
                    }
                    "$lte" => {
                        if let Some(n) = operand.as_f64() {
                            out.push(FilterOp::Lte(n));
                        }
                    }
                    _ => {}
                }
            }
            GenericPredicate::Ops(out)
        }
        scalar => GenericPredicate::Equals(scalar),
    }
}

/// One enriched search hit (`spec.md` §4.5 step 6's `results[]`).
#[derive(Clone, Debug, PartialEq)]
pub struct SearchResult {
    /// The chunk this result describes.
    pub chunk_id: ChunkId,
    /// The chunk's parent document.
    pub document_id: DocumentId,
    /// The chunk's text content, fetched from the external store.
    pub content: String,
    /// `1 / (1 + distance)`.
    pub score: f32,
    /// Merged metadata: stored values shadow index-held values for generic
    /// keys only; `accessLevel`/`groupId`/`restrictedToUsers` are always the
    /// values the index evaluated the permission check against.
    pub metadata: Metadata,
    /// Always `"hnsw"` until a second retrieval path (e.g. BM25) exists.
    pub source: &'static str,
}

/// Which underlying indexes contributed to a [`SearchResponse`], mirroring
/// the original's `indexes_used` diagnostic block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndexesUsed {
    /// Whether the HNSW vector index was searched.
    pub hnsw: bool,
    /// Reserved for a future lexical retrieval path; always `false` today.
    pub bm25: bool,
}

/// The full response of a [`SearchService::search`] call.
#[derive(Clone, Debug, PartialEq)]
pub struct SearchResponse {
    /// The query text that was searched.
    pub query: String,
    /// Scored, enriched hits, already truncated to `k`.
    pub results: Vec<SearchResult>,
    /// `results.len()`.
    pub total_results: usize,
    /// Wall-clock time spent in `search`, in seconds.
    pub processing_time: f64,
    /// Which retrieval paths contributed.
    pub indexes_used: IndexesUsed,
}

const HNSW_OVERFETCH_FACTOR: usize = 2;

/// The search service: query embedding, filtered HNSW retrieval, and
/// store-backed enrichment.
pub struct SearchService {
    tenants: Arc<TenantIndexManager>,
    store: Arc<dyn MetadataStore>,
    embedder: Arc<dyn Embedder>,
    denial_sink: Option<DenialSink>,
    default_k: usize,
    max_k: usize,
}

impl SearchService {
    /// Creates a search service backed by `tenants`/`store`/`embedder`, with
    /// `default_k`/`max_k` clamping per `spec.md` §4.5 (`k = min(k or
    /// default_k, max_k)`). `denial_sink`, when present, receives observed
    /// access denials during the HNSW traversal.
    pub fn new(
        tenants: Arc<TenantIndexManager>,
        store: Arc<dyn MetadataStore>,
        embedder: Arc<dyn Embedder>,
        denial_sink: Option<DenialSink>,
        default_k: usize,
        max_k: usize,
    ) -> Self {
        Self {
            tenants,
            store,
            embedder,
            denial_sink,
            default_k,
            max_k,
        }
    }

    /// Runs `Search(query_text, tenant_id, filter, k)`.
    #[instrument(skip(self, filter))]
    pub async fn search(
        &self,
        query_text: &str,
        tenant_id: TenantId,
        filter: SearchFilterInput,
        k: Option<usize>,
    ) -> Result<SearchResponse> {
        let start = Instant::now();
        let k = k.unwrap_or(self.default_k).min(self.max_k).max(1);

        if !self.tenants.has(tenant_id) {
            self.tenants.build_or_update(tenant_id, false).await?;
        }

        let permission_ctx = filter.permissions.clone().map(PermissionContext::from);
        let parsed_filter = parse_filters(filter);

        let query_vector = self.embedder.embed(query_text).await?;

        let observation = SearchObservationContext {
            query_text: Some(query_text.to_string()),
            user_id: permission_ctx.as_ref().map(|p| p.user_id.as_str().to_string()),
        };

        let overfetch_k = k * HNSW_OVERFETCH_FACTOR;
        let hits = self.tenants.with_index(tenant_id, |index| {
            index.search(
                &query_vector,
                overfetch_k,
                None,
                &parsed_filter,
                &observation,
                self.denial_sink.as_ref(),
            )
        });

        let Some(mut hits) = hits else {
            return Ok(SearchResponse {
                query: query_text.to_string(),
                results: Vec::new(),
                total_results: 0,
                processing_time: start.elapsed().as_secs_f64(),
                indexes_used: IndexesUsed { hnsw: false, bm25: false },
            });
        };

        // Defensive re-check: the index should already have filtered these,
        // this only guards against a caller bypassing `with_index`'s search.
        if let Some(ctx) = &permission_ctx {
            hits.retain(|hit| permission_passes(ctx, &hit.metadata));
        }

        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(k);

        let chunk_ids: Vec<ChunkId> = hits.iter().map(|h| h.chunk_id).collect();
        let enrichment = self.store.get_enrichment_for_chunks(&chunk_ids).await?;
        let enrichment: BTreeMap<ChunkId, _> =
            enrichment.into_iter().map(|e| (e.chunk_id, e)).collect();

        let mut results = Vec::with_capacity(hits.len());
        for hit in hits {
            let Some(enriched) = enrichment.get(&hit.chunk_id) else {
                warn!(chunk_id = %hit.chunk_id, "no stored content found for search hit, dropping");
                continue;
            };

            let mut metadata = hit.metadata;
            for (key, value) in &enriched.metadata {
                if matches!(key.as_str(), "accessLevel" | "groupId" | "restrictedToUsers") {
                    continue;
                }
                metadata.insert(key.clone(), value.clone());
            }
            metadata.insert(
                "documentTitle".to_string(),
                Value::string(enriched.document_title.clone()),
            );

            results.push(SearchResult {
                chunk_id: hit.chunk_id,
                document_id: hit.document_id,
                content: enriched.content.clone(),
                score: hit.score,
                metadata,
                source: "hnsw",
            });
        }

        let total_results = results.len();
        Ok(SearchResponse {
            query: query_text.to_string(),
            results,
            total_results,
            processing_time: start.elapsed().as_secs_f64(),
            indexes_used: IndexesUsed { hnsw: true, bm25: false },
        })
    }
}
