//! Batch index construction and post-build validation (C3).
//!
//! Grounded on `HNSWBuilder.build_index`/`rebuild_index`/`validate_index`:
//! sequential inserts through [`HnswIndex::insert`], per-item failures
//! logged as warnings rather than aborting the batch, and a structural
//! validation pass over the finished graph.

use tracing::{info, warn};

use crate::config::HnswParams;
use crate::types::{ChunkId, DocumentId, Metadata, TenantId, Vector};
use crate::vector::index::{HnswIndex, IndexStats};

/// Aligned input arrays for a cold-start batch build.
pub struct BuildInput {
    /// Embedding vectors, one per chunk.
    pub vectors: Vec<Vector>,
    /// External chunk ids, aligned with `vectors`.
    pub chunk_ids: Vec<ChunkId>,
    /// Parent document ids, aligned with `vectors`.
    pub document_ids: Vec<DocumentId>,
    /// Per-chunk metadata, aligned with `vectors`.
    pub metadatas: Vec<Metadata>,
}

impl BuildInput {
    fn len(&self) -> usize {
        self.vectors.len()
    }

    fn validate_aligned(&self) -> Result<(), String> {
        let n = self.len();
        if self.chunk_ids.len() != n || self.document_ids.len() != n || self.metadatas.len() != n
        {
            return Err("all input arrays must have the same length".to_string());
        }
        Ok(())
    }
}

/// A single per-item insert failure surfaced as a warning rather than
/// aborting the batch.
#[derive(Clone, Debug)]
pub struct BuildWarning {
    /// The chunk that failed to insert.
    pub chunk_id: ChunkId,
    /// Why the insert failed.
    pub reason: String,
}

/// Report returned by [`IndexBuilder::build`]/[`IndexBuilder::rebuild`].
#[derive(Clone, Debug)]
pub struct BuildReport {
    /// Count of items successfully inserted.
    pub inserted: usize,
    /// Per-item failures, non-fatal to the batch.
    pub warnings: Vec<BuildWarning>,
}

/// Validation report returned by [`IndexBuilder::validate`].
#[derive(Clone, Debug)]
pub struct ValidationReport {
    /// Whether every structural invariant held.
    pub ok: bool,
    /// Hard invariant violations.
    pub issues: Vec<String>,
    /// Non-fatal observations (e.g. tuning hints).
    pub warnings: Vec<String>,
    /// A snapshot of the index's own stats at validation time.
    pub stats: IndexStats,
}

/// Progress callback: `(completed, total)`.
pub type ProgressCallback<'a> = Box<dyn FnMut(usize, usize) + 'a>;

/// Batch constructor and post-build validator for a tenant's index.
pub struct IndexBuilder {
    tenant_id: TenantId,
    params: HnswParams,
}

impl IndexBuilder {
    /// Creates a builder for `tenant_id` using the given build parameters.
    pub fn new(tenant_id: TenantId, params: HnswParams) -> Self {
        Self { tenant_id, params }
    }

    /// Cold-start batch construction. Inserts sequentially through
    /// `HnswIndex::insert`; per-item failures are logged as warnings and do
    /// not abort the batch. `progress` is invoked at least once per 100 items
    /// and once more at completion.
    pub fn build(
        &self,
        input: BuildInput,
        mut progress: Option<ProgressCallback<'_>>,
    ) -> Result<(HnswIndex, BuildReport), String> {
        input.validate_aligned()?;

        info!(
            tenant_id = %self.tenant_id,
            count = input.len(),
            "building HNSW index"
        );

        let mut index = HnswIndex::new(self.tenant_id, self.params);
        let total = input.len();
        let mut inserted = 0usize;
        let mut warnings = Vec::new();

        let BuildInput {
            vectors,
            chunk_ids,
            document_ids,
            metadatas,
        } = input;

        for (i, (((vector, chunk_id), document_id), metadata)) in vectors
            .into_iter()
            .zip(chunk_ids)
            .zip(document_ids)
            .zip(metadatas)
            .enumerate()
        {
            match index.insert(chunk_id, document_id, vector, metadata) {
                Ok(_) => inserted += 1,
                Err(err) => {
                    warn!(chunk_id = %chunk_id, error = %err, "failed to insert chunk during build");
                    warnings.push(BuildWarning {
                        chunk_id,
                        reason: err.to_string(),
                    });
                }
            }

            if let Some(cb) = progress.as_mut() {
                if (i + 1) % 100 == 0 {
                    cb(i + 1, total);
                }
            }
        }

        if let Some(cb) = progress.as_mut() {
            cb(total, total);
        }

        info!(tenant_id = %self.tenant_id, inserted, "HNSW index construction complete");

        Ok((index, BuildReport { inserted, warnings }))
    }

    /// Applies metadata updates, then removals, then additions to an
    /// existing index, in that order (matching the three-phase rebuild).
    pub fn rebuild(
        &self,
        index: &mut HnswIndex,
        updated_metadata: Vec<(ChunkId, Metadata)>,
        removed_chunk_ids: Vec<ChunkId>,
        additions: BuildInput,
        mut progress: Option<ProgressCallback<'_>>,
    ) -> Result<BuildReport, String> {
        additions.validate_aligned()?;

        let mut updated_count = 0;
        for (chunk_id, metadata) in updated_metadata {
            if index.set_metadata(chunk_id, metadata) {
                updated_count += 1;
            }
        }
        info!(updated_count, "updated metadata during rebuild");

        let mut removed_count = 0;
        for chunk_id in removed_chunk_ids {
            if index.soft_delete(chunk_id) {
                removed_count += 1;
            }
        }
        info!(removed_count, "soft-deleted chunks during rebuild");

        let total = additions.len();
        let mut inserted = 0usize;
        let mut warnings = Vec::new();

        let BuildInput {
            vectors,
            chunk_ids,
            document_ids,
            metadatas,
        } = additions;

        for (i, (((vector, chunk_id), document_id), metadata)) in vectors
            .into_iter()
            .zip(chunk_ids)
            .zip(document_ids)
            .zip(metadatas)
            .enumerate()
        {
            match index.insert(chunk_id, document_id, vector, metadata) {
                Ok(_) => inserted += 1,
                Err(err) => {
                    warn!(chunk_id = %chunk_id, error = %err, "failed to insert chunk during rebuild");
                    warnings.push(BuildWarning {
                        chunk_id,
                        reason: err.to_string(),
                    });
                }
            }

            if let Some(cb) = progress.as_mut() {
                if (i + 1) % 50 == 0 {
                    cb(i + 1, total);
                }
            }
        }

        if let Some(cb) = progress.as_mut() {
            cb(total, total);
        }

        info!(inserted, "added new nodes during rebuild");

        Ok(BuildReport { inserted, warnings })
    }

    /// Verifies: every node appears in layers `0..=max_layer`, edges are
    /// symmetric, the entry point is present and holds the maximum layer,
    /// and no neighbor id dangles.
    pub fn validate(&self, index: &HnswIndex) -> ValidationReport {
        let mut issues = Vec::new();
        let mut warnings = Vec::new();

        let stats = index.stats();

        if stats.size_total == 0 {
            issues.push("index is empty".to_string());
            return ValidationReport {
                ok: false,
                issues,
                warnings,
                stats,
            };
        }

        match index.entry_point() {
            None => issues.push("missing entry point".to_string()),
            Some(ep) => match index.node(ep) {
                None => issues.push("entry point does not reference an existing node".to_string()),
                Some(node) => {
                    if node.max_layer() != index.max_layer() {
                        issues.push("entry point is not at the maximum layer".to_string());
                    }
                }
            },
        }

        let mut orphaned = 0usize;
        let mut connection_issues = 0usize;

        for node_id in index.node_ids() {
            let Some(node) = index.node(node_id) else {
                continue;
            };
            let in_layers = (0..=node.max_layer()).any(|l| index.layer_members(l).any(|id| id == node_id));
            if !in_layers {
                orphaned += 1;
            }

            for layer in 0..=node.max_layer() {
                for neighbor_id in node.connections(layer).iter().copied() {
                    match index.node(neighbor_id) {
                        None => connection_issues += 1,
                        Some(neighbor) if !neighbor.has_connection(layer, node_id) => {
                            connection_issues += 1
                        }
                        _ => {}
                    }
                }
            }
        }

        if orphaned > 0 {
            issues.push(format!("{orphaned} orphaned nodes found"));
        }
        if connection_issues > 0 {
            issues.push(format!("{connection_issues} connection inconsistencies found"));
        }

        if stats.size_total > 10_000 && self.params.ef_construction < 200 {
            warnings.push("ef_construction may be too low for large index".to_string());
        }

        let layer_0_size = stats.layer_sizes.get(&0).copied().unwrap_or(0);
        if (layer_0_size as f64) < stats.size_total as f64 * 0.8 {
            warnings.push("unusual layer 0 distribution, many nodes on higher layers".to_string());
        }

        let ok = issues.is_empty();
        ValidationReport {
            ok,
            issues,
            warnings,
            stats,
        }
    }
}
