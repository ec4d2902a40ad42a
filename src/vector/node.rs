//! A single HNSW graph node (C1).
//!
//! Grounded on the original index's `HNSWNode`: per-layer connection sets,
//! cosine distance with a per-node distance cache, and metadata-based
//! filter matching. The cache uses `RefCell` since distance queries are
//! logically read-only even though they memoize.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};

use crate::types::{ChunkId, DocumentId, Metadata, NodeId, Timestamp, Vector};
use crate::vector::filter::Filter;

/// A node in the HNSW graph: one chunk's embedding plus its per-layer edges.
///
/// `max_layer` is the highest layer this node participates in; it holds
/// connections for every layer in `0..=max_layer`.
#[derive(Debug)]
pub struct HnswNode {
    id: NodeId,
    vector: Vector,
    chunk_id: ChunkId,
    document_id: DocumentId,
    metadata: Metadata,
    max_layer: usize,
    connections: Vec<HashSet<NodeId>>,
    /// Soft-delete marker. A deleted node stays in the graph (still
    /// traversable, still contributes to connectivity) but is excluded
    /// from search results and from `satisfies_filters`.
    deleted: bool,
    inserted_at: Timestamp,
    distance_cache: RefCell<HashMap<NodeId, f32>>,
}

impl HnswNode {
    /// Creates a new node at the given layer with empty connection sets.
    pub fn new(
        id: NodeId,
        vector: Vector,
        chunk_id: ChunkId,
        document_id: DocumentId,
        metadata: Metadata,
        max_layer: usize,
    ) -> Self {
        Self {
            id,
            vector,
            chunk_id,
            document_id,
            metadata,
            max_layer,
            connections: vec![HashSet::new(); max_layer + 1],
            deleted: false,
            inserted_at: Timestamp::now(),
            distance_cache: RefCell::new(HashMap::new()),
        }
    }

    /// This node's internal graph identifier.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// The embedding vector.
    pub fn vector(&self) -> &Vector {
        &self.vector
    }

    /// The external, user-visible chunk identifier.
    pub fn chunk_id(&self) -> ChunkId {
        self.chunk_id
    }

    /// The parent document identifier.
    pub fn document_id(&self) -> DocumentId {
        self.document_id
    }

    /// The node's metadata, used by filter matching.
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// The highest layer this node participates in.
    pub fn max_layer(&self) -> usize {
        self.max_layer
    }

    /// When this node was inserted (re-insert resets this).
    pub fn inserted_at(&self) -> Timestamp {
        self.inserted_at
    }

    /// Whether this node has been soft-deleted.
    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    /// Marks this node as soft-deleted. Connections are left intact so the
    /// graph stays traversable for nodes that route through it.
    pub fn mark_deleted(&mut self) {
        self.deleted = true;
    }

    /// Replaces this node's metadata wholesale and invalidates nothing
    /// (metadata does not participate in distance caching).
    pub fn set_metadata(&mut self, metadata: Metadata) {
        self.metadata = metadata;
    }

    /// Merges the given key/value pairs into this node's metadata.
    pub fn update_metadata(&mut self, updates: Metadata) {
        self.metadata.extend(updates);
    }

    /// Removes the given keys from this node's metadata.
    pub fn drop_metadata_keys(&mut self, keys: &[String]) {
        for key in keys {
            self.metadata.remove(key);
        }
    }

    /// Adds an undirected-in-intent connection at `layer`, if `layer` is
    /// within this node's range. The caller is responsible for adding the
    /// symmetric edge on the neighbor.
    pub fn add_connection(&mut self, layer: usize, neighbor: NodeId) {
        if let Some(set) = self.connections.get_mut(layer) {
            set.insert(neighbor);
        }
    }

    /// Removes a connection at `layer`, if present.
    pub fn remove_connection(&mut self, layer: usize, neighbor: NodeId) {
        if let Some(set) = self.connections.get_mut(layer) {
            set.remove(&neighbor);
        }
    }

    /// Replaces the full connection set at `layer`.
    pub fn set_connections(&mut self, layer: usize, neighbors: HashSet<NodeId>) {
        if let Some(set) = self.connections.get_mut(layer) {
            *set = neighbors;
        }
    }

    /// Returns the connection set at `layer`, or an empty set if `layer`
    /// exceeds this node's `max_layer`.
    pub fn connections(&self, layer: usize) -> &HashSet<NodeId> {
        static EMPTY: once_empty::EmptySet = once_empty::EmptySet;
        self.connections.get(layer).unwrap_or_else(|| EMPTY.get())
    }

    /// Whether this node has a connection to `neighbor` at `layer`.
    pub fn has_connection(&self, layer: usize, neighbor: NodeId) -> bool {
        self.connections
            .get(layer)
            .is_some_and(|set| set.contains(&neighbor))
    }

    /// Cosine distance to another node's vector, memoized by neighbor id.
    pub fn distance_to(&self, other: &HnswNode) -> f32 {
        if let Some(cached) = self.distance_cache.borrow().get(&other.id) {
            return *cached;
        }
        let distance = cosine_distance(&self.vector, &other.vector);
        self.distance_cache.borrow_mut().insert(other.id, distance);
        distance
    }

    /// Cosine distance to an arbitrary query vector (not cached — queries
    /// are not stable node identities).
    pub fn distance_to_vector(&self, query: &[f32]) -> f32 {
        cosine_distance(&self.vector, query)
    }

    /// Clears the memoized distance cache. Call after the vector changes
    /// (re-insert replaces the node wholesale, so this is mostly for tests).
    pub fn clear_cache(&self) {
        self.distance_cache.borrow_mut().clear();
    }

    /// Evaluates `filter` against this node's metadata. Deleted nodes never
    /// match, regardless of the filter.
    pub fn matches(&self, filter: &Filter) -> bool {
        !self.deleted && filter.matches(&self.metadata)
    }
}

/// Cosine distance (`1 - cosine_similarity`), treating a zero-norm vector
/// as maximally distant from everything (distance `1.0`).
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 1.0;
    }
    1.0 - (dot / (norm_a * norm_b))
}

/// Tiny helper so [`HnswNode::connections`] can hand back `&HashSet` for an
/// out-of-range layer without allocating on every call.
mod once_empty {
    use super::HashSet;
    use crate::types::NodeId;
    use std::sync::OnceLock;

    pub struct EmptySet;

    impl EmptySet {
        pub fn get(&self) -> &'static HashSet<NodeId> {
            static SET: OnceLock<HashSet<NodeId>> = OnceLock::new();
            SET.get_or_init(HashSet::new)
        }
    }
}
