//! The per-tenant HNSW graph (C2): insert, search, soft-delete, metadata
//! ops, stats, and persistence.
//!
//! Grounded module-for-module on the original `HNSWIndex`, with four
//! deliberate divergences recorded in `DESIGN.md`'s Open Question
//! resolutions: re-insert replaces atomically; size tracks both
//! `size_total` and `size_live`; soft-delete never recomputes the entry
//! point (only `hard_remove` does); and the filter is `None` during every
//! `ef=1` top-layer descent, deferred entirely to the layer-0 post-traversal
//! step.

use std::collections::{BinaryHeap, HashMap};
use std::f64::consts::LN_2;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::config::HnswParams;
use crate::denial::{DenialEvent, DenialSink};
use crate::error::{IndexError, Result};
use crate::types::{ChunkId, DocumentId, Metadata, NodeId, TenantId, Timestamp, Vector};
use crate::vector::filter::Filter;
use crate::vector::node::HnswNode;

const FORMAT_VERSION: u32 = 1;

/// One scored search hit.
#[derive(Clone, Debug, PartialEq)]
pub struct SearchHit {
    /// Cosine distance between the query and this chunk's vector.
    pub distance: f32,
    /// `1 / (1 + distance)` — monotonically decreasing in distance.
    pub score: f32,
    /// The external chunk identifier.
    pub chunk_id: ChunkId,
    /// The chunk's parent document.
    pub document_id: DocumentId,
    /// The node's metadata as evaluated by the index, including the
    /// permission sub-fields (`accessLevel`/`groupId`/`restrictedToUsers`).
    pub metadata: Metadata,
}

/// Optional context for access-denial observation during search.
#[derive(Clone, Debug, Default)]
pub struct SearchObservationContext {
    /// The query text, logged verbatim in denial events.
    pub query_text: Option<String>,
    /// The caller's user id, logged in denial events.
    pub user_id: Option<String>,
}

/// Aggregate statistics returned by [`HnswIndex::stats`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IndexStats {
    /// Total nodes ever inserted, including soft-deleted ones.
    pub size_total: usize,
    /// Nodes that are not soft-deleted.
    pub size_live: usize,
    /// Highest occupied layer.
    pub max_layer: usize,
    /// Current entry point, if any.
    pub entry_point: Option<NodeId>,
    /// Node count per layer.
    pub layer_sizes: HashMap<usize, usize>,
    /// Mean out-degree per layer.
    pub avg_connections_per_layer: HashMap<usize, f64>,
}

#[derive(Clone, Debug, PartialEq)]
struct ScoredId {
    distance: f32,
    id: NodeId,
}

impl Eq for ScoredId {}
impl PartialOrd for ScoredId {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for ScoredId {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .distance
            .partial_cmp(&self.distance)
            .unwrap_or(std::cmp::Ordering::Equal)
    }
}

/// Min-ordering wrapper so the same `ScoredId` type can back both the
/// candidate min-heap (`C`) and the results max-heap (`W`, via `Reverse`).
#[derive(Clone, Debug, PartialEq)]
struct MaxScoredId(ScoredId);
impl Eq for MaxScoredId {}
impl PartialOrd for MaxScoredId {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for MaxScoredId {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0
            .distance
            .partial_cmp(&other.0.distance)
            .unwrap_or(std::cmp::Ordering::Equal)
    }
}

/// A tenant's HNSW graph.
pub struct HnswIndex {
    tenant_id: TenantId,
    params: HnswParams,
    dimension: Option<usize>,
    nodes: HashMap<NodeId, HnswNode>,
    chunk_index: HashMap<ChunkId, NodeId>,
    layers: HashMap<usize, std::collections::HashSet<NodeId>>,
    entry_point: Option<NodeId>,
    max_layer: usize,
    size_total: usize,
    next_node_id: u64,
    rng: StdRng,
}

impl HnswIndex {
    /// Creates an empty index for `tenant_id` with the given build parameters.
    pub fn new(tenant_id: TenantId, params: HnswParams) -> Self {
        let rng = match params.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            tenant_id,
            params,
            dimension: None,
            nodes: HashMap::new(),
            chunk_index: HashMap::new(),
            layers: HashMap::new(),
            entry_point: None,
            max_layer: 0,
            size_total: 0,
            next_node_id: 0,
            rng,
        }
    }

    /// The tenant this index belongs to.
    pub fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    /// The build/search parameters this index was constructed with.
    pub fn params(&self) -> &HnswParams {
        &self.params
    }

    /// The embedding dimension, established by the first insert.
    pub fn dimension(&self) -> Option<usize> {
        self.dimension
    }

    fn fresh_node_id(&mut self) -> NodeId {
        let id = NodeId(self.next_node_id);
        self.next_node_id += 1;
        id
    }

    /// `level = floor(-ln(U) * mL)` with `U ~ Uniform(0, 1]`.
    fn select_level(&mut self) -> usize {
        let u: f64 = loop {
            let sample: f64 = self.rng.gen();
            if sample > 0.0 {
                break sample;
            }
        };
        let m_l = 1.0 / LN_2;
        (-u.ln() * m_l).floor() as usize
    }

    /// SEARCH-LAYER: beam search within a single layer.
    ///
    /// `filter`, when present, is applied when seeding and expanding the
    /// frontier (used by the builder's post-build validation and callers
    /// that want layer-level filtered search); production insert/search call
    /// sites always pass `None` here per §4.2.4/§4.2.5.
    fn search_layer(
        &self,
        query: &[f32],
        entry_points: &[NodeId],
        ef: usize,
        layer: usize,
        filter: Option<&Filter>,
    ) -> Vec<(f32, NodeId)> {
        let mut visited = std::collections::HashSet::new();
        let mut candidates: BinaryHeap<ScoredId> = BinaryHeap::new();
        let mut worst_first: BinaryHeap<MaxScoredId> = BinaryHeap::new();

        for &ep in entry_points {
            let Some(node) = self.nodes.get(&ep) else {
                continue;
            };
            if let Some(f) = filter {
                if !node.matches(f) {
                    continue;
                }
            }
            let distance = node.distance_to_vector(query);
            visited.insert(ep);
            candidates.push(ScoredId { distance, id: ep });
            worst_first.push(MaxScoredId(ScoredId { distance, id: ep }));
        }

        while let Some(current) = candidates.pop() {
            if let Some(worst) = worst_first.peek() {
                if current.distance > worst.0.distance {
                    break;
                }
            }
            let Some(current_node) = self.nodes.get(&current.id) else {
                continue;
            };
            for &neighbor_id in current_node.connections(layer) {
                if visited.contains(&neighbor_id) {
                    continue;
                }
                visited.insert(neighbor_id);
                let Some(neighbor) = self.nodes.get(&neighbor_id) else {
                    continue;
                };
                if let Some(f) = filter {
                    if !neighbor.matches(f) {
                        continue;
                    }
                }
                let distance = neighbor.distance_to_vector(query);
                if worst_first.len() < ef {
                    candidates.push(ScoredId {
                        distance,
                        id: neighbor_id,
                    });
                    worst_first.push(MaxScoredId(ScoredId {
                        distance,
                        id: neighbor_id,
                    }));
                } else if worst_first
                    .peek()
                    .is_some_and(|w| distance < w.0.distance)
                {
                    candidates.push(ScoredId {
                        distance,
                        id: neighbor_id,
                    });
                    worst_first.push(MaxScoredId(ScoredId {
                        distance,
                        id: neighbor_id,
                    }));
                    if worst_first.len() > ef {
                        worst_first.pop();
                    }
                }
            }
        }

        let mut result: Vec<(f32, NodeId)> =
            worst_first.into_sorted_vec().into_iter().map(|m| (m.0.distance, m.0.id)).collect();
        result.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
        result
    }

    /// SELECT-NEIGHBORS: the HNSW paper's diversity heuristic
    /// (`extend_candidates=true`, `keep_pruned=true`).
    fn select_neighbors(&self, candidates: &[(f32, NodeId)], m: usize) -> Vec<NodeId> {
        if candidates.len() <= m {
            return candidates.iter().map(|(_, id)| *id).collect();
        }

        let mut sorted = candidates.to_vec();
        sorted.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));

        let mut selected = Vec::new();
        let mut remaining = sorted;

        while selected.len() < m && !remaining.is_empty() {
            let (_, best_id) = remaining.remove(0);
            selected.push(best_id);
            if remaining.is_empty() {
                break;
            }
            let Some(best_node) = self.nodes.get(&best_id) else {
                continue;
            };
            remaining.retain(|(dist_to_query, id)| {
                self.nodes
                    .get(id)
                    .map(|node| *dist_to_query < best_node.distance_to(node))
                    .unwrap_or(false)
            });
        }

        while selected.len() < m && !remaining.is_empty() {
            let (_, id) = remaining.remove(0);
            selected.push(id);
        }

        selected
    }

    fn m_for_layer(&self, layer: usize) -> usize {
        if layer == 0 {
            self.params.m_max0()
        } else {
            self.params.m
        }
    }

    /// Inserts (or, for an existing `chunk_id`, atomically replaces) a chunk.
    ///
    /// Fails with [`IndexError::DimensionMismatch`] if `vector`'s length
    /// disagrees with the dimension established by the first insert.
    pub fn insert(
        &mut self,
        chunk_id: ChunkId,
        document_id: DocumentId,
        vector: Vector,
        metadata: Metadata,
    ) -> Result<NodeId> {
        match self.dimension {
            Some(d) if d != vector.len() => {
                return Err(IndexError::DimensionMismatch {
                    expected: d,
                    got: vector.len(),
                }
                .into())
            }
            None => self.dimension = Some(vector.len()),
            _ => {}
        }

        if let Some(&old_id) = self.chunk_index.get(&chunk_id) {
            self.hard_remove_by_node_id(old_id);
        }

        let level = self.select_level();
        let node_id = self.fresh_node_id();
        let node = HnswNode::new(node_id, vector.clone(), chunk_id, document_id, metadata, level);
        self.nodes.insert(node_id, node);
        self.chunk_index.insert(chunk_id, node_id);

        for l in 0..=level {
            self.layers.entry(l).or_default().insert(node_id);
        }
        if level > self.max_layer {
            self.max_layer = level;
        }

        if self.entry_point.is_none() {
            self.entry_point = Some(node_id);
            self.size_total += 1;
            return Ok(node_id);
        }

        let mut current_nearest = vec![self.entry_point.unwrap()];
        for lc in (level + 1..=self.max_layer).rev() {
            current_nearest = self
                .search_layer(&vector, &current_nearest, 1, lc, None)
                .into_iter()
                .map(|(_, id)| id)
                .collect();
        }

        for lc in (0..=level.min(self.max_layer)).rev() {
            let candidates =
                self.search_layer(&vector, &current_nearest, self.params.ef_construction, lc, None);
            let m_layer = self.m_for_layer(lc);
            let selected = self.select_neighbors(&candidates, m_layer);

            for &neighbor_id in &selected {
                if self.nodes.contains_key(&neighbor_id) {
                    self.nodes.get_mut(&node_id).unwrap().add_connection(lc, neighbor_id);
                    self.nodes.get_mut(&neighbor_id).unwrap().add_connection(lc, node_id);
                }
            }

            for &neighbor_id in &selected {
                self.prune_neighbor(neighbor_id, lc);
            }

            current_nearest = selected;
        }

        if level > self.max_layer {
            self.entry_point = Some(node_id);
            self.max_layer = level;
        }

        self.size_total += 1;
        Ok(node_id)
    }

    fn prune_neighbor(&mut self, neighbor_id: NodeId, layer: usize) {
        let max_conn = self.m_for_layer(layer);
        let Some(neighbor) = self.nodes.get(&neighbor_id) else {
            return;
        };
        let current: Vec<NodeId> = neighbor.connections(layer).iter().copied().collect();
        if current.len() <= max_conn {
            return;
        }
        let candidates: Vec<(f32, NodeId)> = current
            .iter()
            .filter_map(|&id| {
                let other = self.nodes.get(&id)?;
                Some((neighbor.distance_to(other), id))
            })
            .collect();
        let new_connections = self.select_neighbors(&candidates, max_conn);
        let new_set: std::collections::HashSet<NodeId> = new_connections.iter().copied().collect();

        for &old_id in &current {
            if !new_set.contains(&old_id) {
                if let Some(old) = self.nodes.get_mut(&old_id) {
                    old.remove_connection(layer, neighbor_id);
                }
            }
        }
        for &new_id in &new_connections {
            if let Some(new_node) = self.nodes.get_mut(&new_id) {
                new_node.add_connection(layer, neighbor_id);
            }
        }
        if let Some(neighbor) = self.nodes.get_mut(&neighbor_id) {
            neighbor.set_connections(layer, new_set);
        }
    }

    /// Searches for the `k` nearest live, filter-matching chunks.
    ///
    /// `ef` defaults to `max(ef_construction, k)`. When `filter` is
    /// non-empty, the layer-0 scan widens to `max(ef, 3k)` and the filter is
    /// applied only after that widened scan — never during the `ef=1`
    /// top-layer descent.
    pub fn search(
        &self,
        query: &[f32],
        k: usize,
        ef: Option<usize>,
        filter: &Filter,
        observation: &SearchObservationContext,
        denial_sink: Option<&DenialSink>,
    ) -> Vec<SearchHit> {
        let Some(entry_point) = self.entry_point else {
            return Vec::new();
        };
        if self.nodes.is_empty() {
            return Vec::new();
        }

        let ef = ef.unwrap_or_else(|| self.params.ef_construction.max(k));

        let mut current_nearest = vec![entry_point];
        for lc in (1..=self.max_layer).rev() {
            current_nearest = self
                .search_layer(query, &current_nearest, 1, lc, None)
                .into_iter()
                .map(|(_, id)| id)
                .collect();
        }

        let has_filter = !filter.is_empty();
        let ef_eff = if has_filter { ef.max(3 * k) } else { ef };
        let candidates = self.search_layer(query, &current_nearest, ef_eff, 0, None);

        let mut hits = Vec::with_capacity(k);
        for (distance, node_id) in candidates {
            let Some(node) = self.nodes.get(&node_id) else {
                continue;
            };
            if node.is_deleted() {
                continue;
            }
            if !filter.matches(node.metadata()) {
                self.observe_denial(node, distance, filter, observation, denial_sink);
                continue;
            }
            hits.push(SearchHit {
                distance,
                score: 1.0 / (1.0 + distance),
                chunk_id: node.chunk_id(),
                document_id: node.document_id(),
                metadata: node.metadata().clone(),
            });
            if hits.len() >= k {
                break;
            }
        }

        hits
    }

    fn observe_denial(
        &self,
        node: &HnswNode,
        distance: f32,
        filter: &Filter,
        observation: &SearchObservationContext,
        denial_sink: Option<&DenialSink>,
    ) {
        let Some(sink) = denial_sink else { return };
        let Some(ctx) = &filter.permissions else {
            return;
        };
        if ctx.user_role == crate::types::UserRole::Admin {
            return;
        }
        let metadata = node.metadata();
        let access_level = metadata.get("accessLevel").and_then(|v| v.as_str());
        if access_level != Some("GROUP") {
            return;
        }
        let group_id = match metadata.get("groupId").and_then(|v| v.as_str()) {
            Some(g) if !g.is_empty() => g,
            _ => return,
        };
        if ctx.user_group_ids.iter().any(|g| g.as_str() == group_id) {
            return;
        }
        let Some(query_text) = &observation.query_text else {
            return;
        };
        let Some(user_id) = &observation.user_id else {
            return;
        };

        let event = DenialEvent {
            tenant_id: self.tenant_id,
            user_id: user_id.clone(),
            query_text: query_text.clone(),
            chunk_id: node.chunk_id(),
            document_id: node.document_id(),
            group_id: group_id.to_string(),
            similarity: 1.0 / (1.0 + distance),
            timestamp: Timestamp::now(),
        };
        sink.observe(event);
    }

    /// Soft-deletes the node owning `chunk_id`. The node stays in the graph;
    /// the entry point is never recomputed as a result of a soft delete.
    pub fn soft_delete(&mut self, chunk_id: ChunkId) -> bool {
        let Some(&node_id) = self.chunk_index.get(&chunk_id) else {
            return false;
        };
        if let Some(node) = self.nodes.get_mut(&node_id) {
            node.mark_deleted();
            true
        } else {
            false
        }
    }

    fn hard_remove_by_node_id(&mut self, node_id: NodeId) -> bool {
        let Some(node) = self.nodes.get(&node_id) else {
            return false;
        };
        let max_layer = node.max_layer();
        let chunk_id = node.chunk_id();

        for layer in 0..=max_layer {
            let neighbors: Vec<NodeId> = self
                .nodes
                .get(&node_id)
                .map(|n| n.connections(layer).iter().copied().collect())
                .unwrap_or_default();
            for neighbor_id in neighbors {
                if let Some(neighbor) = self.nodes.get_mut(&neighbor_id) {
                    neighbor.remove_connection(layer, node_id);
                }
            }
            if let Some(set) = self.layers.get_mut(&layer) {
                set.remove(&node_id);
            }
        }

        self.nodes.remove(&node_id);
        self.chunk_index.remove(&chunk_id);
        self.size_total = self.size_total.saturating_sub(1);

        if self.entry_point == Some(node_id) {
            self.recompute_entry_point();
        }
        true
    }

    fn recompute_entry_point(&mut self) {
        self.entry_point = None;
        self.max_layer = 0;
        for node in self.nodes.values() {
            if self.entry_point.is_none() || node.max_layer() > self.max_layer {
                self.max_layer = node.max_layer();
                self.entry_point = Some(node.id());
            }
        }
    }

    /// Merges `updates` into the node's metadata.
    pub fn update_metadata(&mut self, chunk_id: ChunkId, updates: Metadata) -> bool {
        self.with_node_mut(chunk_id, |n| n.update_metadata(updates))
    }

    /// Replaces the node's metadata wholesale.
    pub fn set_metadata(&mut self, chunk_id: ChunkId, metadata: Metadata) -> bool {
        self.with_node_mut(chunk_id, |n| n.set_metadata(metadata))
    }

    /// Removes the given keys from the node's metadata.
    pub fn drop_metadata_keys(&mut self, chunk_id: ChunkId, keys: &[String]) -> bool {
        self.with_node_mut(chunk_id, |n| n.drop_metadata_keys(keys))
    }

    fn with_node_mut(&mut self, chunk_id: ChunkId, f: impl FnOnce(&mut HnswNode)) -> bool {
        let Some(&node_id) = self.chunk_index.get(&chunk_id) else {
            return false;
        };
        if let Some(node) = self.nodes.get_mut(&node_id) {
            f(node);
            true
        } else {
            false
        }
    }

    /// Total nodes ever inserted, live or soft-deleted.
    pub fn size_total(&self) -> usize {
        self.size_total
    }

    /// Nodes that are not soft-deleted.
    pub fn size_live(&self) -> usize {
        self.nodes.values().filter(|n| !n.is_deleted()).count()
    }

    /// Returns aggregate index statistics.
    pub fn stats(&self) -> IndexStats {
        let mut layer_sizes = HashMap::new();
        let mut avg_connections = HashMap::new();
        for (layer, members) in &self.layers {
            layer_sizes.insert(*layer, members.len());
            if members.is_empty() {
                avg_connections.insert(*layer, 0.0);
                continue;
            }
            let total: usize = members
                .iter()
                .filter_map(|id| self.nodes.get(id))
                .map(|n| n.connections(*layer).len())
                .sum();
            avg_connections.insert(*layer, total as f64 / members.len() as f64);
        }

        IndexStats {
            size_total: self.size_total,
            size_live: self.size_live(),
            max_layer: self.max_layer,
            entry_point: self.entry_point,
            layer_sizes,
            avg_connections_per_layer: avg_connections,
        }
    }

    /// Direct node accessor, used by the builder's post-build validation.
    pub fn node(&self, id: NodeId) -> Option<&HnswNode> {
        self.nodes.get(&id)
    }

    /// All node ids currently in the graph (live and soft-deleted).
    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes.keys().copied()
    }

    /// Members of a given layer.
    pub fn layer_members(&self, layer: usize) -> impl Iterator<Item = NodeId> + '_ {
        self.layers
            .get(&layer)
            .into_iter()
            .flat_map(|set| set.iter().copied())
    }

    /// The current entry point, if any.
    pub fn entry_point(&self) -> Option<NodeId> {
        self.entry_point
    }

    /// The current maximum occupied layer.
    pub fn max_layer(&self) -> usize {
        self.max_layer
    }

    /// Serializes the whole index to a self-describing on-disk representation.
    pub fn save(&self) -> Result<PersistedIndex> {
        let mut node_records = Vec::with_capacity(self.nodes.len());
        let mut edges = Vec::new();
        let mut seen_edges = std::collections::HashSet::new();

        for (&id, node) in &self.nodes {
            node_records.push(NodeRecord {
                node_id: id,
                chunk_id: node.chunk_id(),
                document_id: node.document_id(),
                metadata: node.metadata().clone(),
                max_layer: node.max_layer(),
                deleted: node.is_deleted(),
                vector: node.vector().clone(),
            });

            for layer in 0..=node.max_layer() {
                for &neighbor in node.connections(layer) {
                    let key = if id.0 < neighbor.0 {
                        (id, neighbor, layer)
                    } else {
                        (neighbor, id, layer)
                    };
                    if seen_edges.insert(key) {
                        edges.push(EdgeRecord {
                            node_id: key.0,
                            layer: key.2,
                            neighbor_id: key.1,
                        });
                    }
                }
            }
        }

        Ok(PersistedIndex {
            header: PersistedHeader {
                format_version: FORMAT_VERSION,
                tenant_id: self.tenant_id,
                dimension: self.dimension,
                params: self.params,
                entry_point: self.entry_point,
                max_layer: self.max_layer,
                size_total: self.size_total,
                next_node_id: self.next_node_id,
            },
            nodes: node_records,
            edges,
        })
    }

    /// Rehydrates an index from a previously [`HnswIndex::save`]d representation.
    ///
    /// Refuses to load on format-version mismatch or if the persisted
    /// dimension disagrees with `expected_dimension` (when supplied).
    pub fn load(persisted: PersistedIndex, expected_dimension: Option<usize>) -> Result<Self> {
        if persisted.header.format_version != FORMAT_VERSION {
            return Err(IndexError::UnsupportedVersion {
                expected: FORMAT_VERSION,
                found: persisted.header.format_version,
            }
            .into());
        }
        if let (Some(expected), Some(found)) = (expected_dimension, persisted.header.dimension) {
            if expected != found {
                return Err(IndexError::DimensionMismatch {
                    expected,
                    got: found,
                }
                .into());
            }
        }

        let mut index = HnswIndex::new(persisted.header.tenant_id, persisted.header.params);
        index.dimension = persisted.header.dimension;
        index.entry_point = persisted.header.entry_point;
        index.max_layer = persisted.header.max_layer;
        index.size_total = persisted.header.size_total;
        index.next_node_id = persisted.header.next_node_id;

        for record in persisted.nodes {
            let mut node = HnswNode::new(
                record.node_id,
                record.vector,
                record.chunk_id,
                record.document_id,
                record.metadata,
                record.max_layer,
            );
            if record.deleted {
                node.mark_deleted();
            }
            index.chunk_index.insert(record.chunk_id, record.node_id);
            for l in 0..=record.max_layer {
                index.layers.entry(l).or_default().insert(record.node_id);
            }
            index.nodes.insert(record.node_id, node);
        }

        for edge in persisted.edges {
            if let Some(a) = index.nodes.get_mut(&edge.node_id) {
                a.add_connection(edge.layer, edge.neighbor_id);
            }
            if let Some(b) = index.nodes.get_mut(&edge.neighbor_id) {
                b.add_connection(edge.layer, edge.node_id);
            }
        }

        if index.entry_point.is_none() && !index.nodes.is_empty() {
            return Err(IndexError::corrupted("entry point missing for non-empty index").into());
        }

        Ok(index)
    }
}

/// Self-describing header for a serialized index (JSON, per the teacher's
/// header/body persistence split).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PersistedHeader {
    /// On-disk format version; load refuses to proceed on mismatch.
    pub format_version: u32,
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Embedding dimension, if any vector has been inserted.
    pub dimension: Option<usize>,
    /// Build parameters in effect when this snapshot was taken.
    pub params: HnswParams,
    /// Entry point at snapshot time.
    pub entry_point: Option<NodeId>,
    /// Max layer at snapshot time.
    pub max_layer: usize,
    /// Total nodes ever inserted at snapshot time.
    pub size_total: usize,
    /// Next node id to allocate, so ids never collide across save/load cycles.
    pub next_node_id: u64,
}

/// One persisted node row (bincode-encoded body table).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeRecord {
    /// Internal node id.
    pub node_id: NodeId,
    /// External chunk id.
    pub chunk_id: ChunkId,
    /// Parent document id.
    pub document_id: DocumentId,
    /// Filter/display metadata.
    pub metadata: Metadata,
    /// Highest layer this node participates in.
    pub max_layer: usize,
    /// Soft-delete marker.
    pub deleted: bool,
    /// Embedding vector.
    pub vector: Vector,
}

/// One persisted edge row, emitted once per undirected pair per layer.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct EdgeRecord {
    /// Lower-numbered endpoint, by convention (see [`HnswIndex::save`]).
    pub node_id: NodeId,
    /// Layer this edge exists at.
    pub layer: usize,
    /// Other endpoint.
    pub neighbor_id: NodeId,
}

/// A whole serialized index: self-describing header plus node/edge tables.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PersistedIndex {
    /// JSON-serializable header, kept separate so format/dimension checks
    /// don't require decoding the (larger, bincode) body tables first.
    pub header: PersistedHeader,
    /// Node rows.
    pub nodes: Vec<NodeRecord>,
    /// Edge rows.
    pub edges: Vec<EdgeRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector::filter::{Filter, PermissionContext};
    use std::collections::BTreeMap;

    fn params() -> HnswParams {
        HnswParams {
            m: 4,
            ef_construction: 20,
            ef_search: 20,
            rng_seed: Some(42),
        }
    }

    fn public_metadata() -> Metadata {
        let mut m = BTreeMap::new();
        m.insert(
            "accessLevel".to_string(),
            crate::types::Value::string("PUBLIC"),
        );
        m
    }

    #[test]
    fn first_insert_becomes_entry_point() {
        let mut index = HnswIndex::new(TenantId::new(), params());
        let chunk = ChunkId::new();
        let doc = DocumentId::new();
        let id = index
            .insert(chunk, doc, vec![1.0, 0.0, 0.0], public_metadata())
            .unwrap();
        assert_eq!(index.entry_point(), Some(id));
        assert_eq!(index.size_total(), 1);
        assert_eq!(index.size_live(), 1);
    }

    #[test]
    fn dimension_mismatch_rejected() {
        let mut index = HnswIndex::new(TenantId::new(), params());
        index
            .insert(ChunkId::new(), DocumentId::new(), vec![1.0, 0.0], public_metadata())
            .unwrap();
        let err = index
            .insert(
                ChunkId::new(),
                DocumentId::new(),
                vec![1.0, 0.0, 0.0],
                public_metadata(),
            )
            .unwrap_err();
        assert!(matches!(
            err,
            crate::error::GatedHnswError::Index(IndexError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn search_finds_nearest_vector() {
        let mut index = HnswIndex::new(TenantId::new(), params());
        let doc = DocumentId::new();
        let c1 = ChunkId::new();
        let c2 = ChunkId::new();
        index.insert(c1, doc, vec![1.0, 0.0, 0.0], public_metadata()).unwrap();
        index.insert(c2, doc, vec![0.0, 1.0, 0.0], public_metadata()).unwrap();

        let hits = index.search(
            &[0.9, 0.1, 0.0],
            1,
            None,
            &Filter::none(),
            &SearchObservationContext::default(),
            None,
        );
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk_id, c1);
    }

    #[test]
    fn reinsert_replaces_atomically() {
        let mut index = HnswIndex::new(TenantId::new(), params());
        let doc = DocumentId::new();
        let chunk = ChunkId::new();
        index
            .insert(chunk, doc, vec![1.0, 0.0, 0.0], public_metadata())
            .unwrap();
        index
            .insert(chunk, doc, vec![0.0, 1.0, 0.0], public_metadata())
            .unwrap();

        assert_eq!(index.size_live(), 1);

        let hits = index.search(
            &[0.0, 1.0, 0.0],
            1,
            None,
            &Filter::none(),
            &SearchObservationContext::default(),
            None,
        );
        assert_eq!(hits[0].chunk_id, chunk);
        assert!(hits[0].distance < 0.01);
    }

    #[test]
    fn soft_delete_excludes_from_search_but_keeps_node() {
        let mut index = HnswIndex::new(TenantId::new(), params());
        let doc = DocumentId::new();
        let chunk = ChunkId::new();
        let id = index
            .insert(chunk, doc, vec![1.0, 0.0, 0.0], public_metadata())
            .unwrap();
        index.soft_delete(chunk);

        assert_eq!(index.size_total(), 1);
        assert_eq!(index.size_live(), 0);
        assert_eq!(index.entry_point(), Some(id));

        let hits = index.search(
            &[1.0, 0.0, 0.0],
            1,
            None,
            &Filter::none(),
            &SearchObservationContext::default(),
            None,
        );
        assert!(hits.is_empty());
    }

    #[test]
    fn permission_filter_excludes_non_matching_nodes() {
        let mut index = HnswIndex::new(TenantId::new(), params());
        let doc = DocumentId::new();
        let mut restricted = BTreeMap::new();
        restricted.insert(
            "accessLevel".to_string(),
            crate::types::Value::string("ADMINS"),
        );
        let chunk = ChunkId::new();
        index.insert(chunk, doc, vec![1.0, 0.0, 0.0], restricted).unwrap();

        let filter = Filter {
            permissions: Some(PermissionContext::member("u1", vec![])),
            generic: vec![],
        };
        let hits = index.search(
            &[1.0, 0.0, 0.0],
            1,
            None,
            &filter,
            &SearchObservationContext::default(),
            None,
        );
        assert!(hits.is_empty());
    }

    #[test]
    fn save_and_load_roundtrips() {
        let mut index = HnswIndex::new(TenantId::new(), params());
        let doc = DocumentId::new();
        for _ in 0..5 {
            index
                .insert(ChunkId::new(), doc, vec![1.0, 0.0, 0.0], public_metadata())
                .unwrap();
        }
        let persisted = index.save().unwrap();
        let reloaded = HnswIndex::load(persisted, Some(3)).unwrap();
        assert_eq!(reloaded.size_total(), 5);
        assert_eq!(reloaded.entry_point(), index.entry_point());
    }

    #[test]
    fn load_rejects_dimension_mismatch() {
        let mut index = HnswIndex::new(TenantId::new(), params());
        index
            .insert(ChunkId::new(), DocumentId::new(), vec![1.0, 0.0, 0.0], public_metadata())
            .unwrap();
        let persisted = index.save().unwrap();
        let err = HnswIndex::load(persisted, Some(99)).unwrap_err();
        assert!(matches!(
            err,
            crate::error::GatedHnswError::Index(IndexError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn metadata_update_merges_keys() {
        let mut index = HnswIndex::new(TenantId::new(), params());
        let chunk = ChunkId::new();
        index
            .insert(chunk, DocumentId::new(), vec![1.0], public_metadata())
            .unwrap();
        let mut updates = BTreeMap::new();
        updates.insert("topic".to_string(), crate::types::Value::string("rust"));
        assert!(index.update_metadata(chunk, updates));
    }
}
