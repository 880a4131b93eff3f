/// Shared configuration for point cloud indexing

/// Number of decoded points handed through the reader channel per message.
pub const BATCH_SIZE: usize = 4096;

/// Bound on the reader channel. The decoder side blocks once this many
/// batches are in flight, which is the backpressure the inserter relies on.
pub const CHANNEL_CAPACITY: usize = 16;

/// Subdivision policy for both octree variants.
#[derive(Debug, Clone, Copy)]
pub struct TreePolicy {
    /// The maximum number of elements a leaf may hold before subdivision.
    pub max_elements_per_leaf: usize,
    /// Depth below which nodes always subdivide, to guarantee fan-out at
    /// the top of the tree even for sparse data.
    pub min_forced_subdivision_depth: u32,
    /// Hard depth cap. Leaves at this depth keep accepting elements past
    /// the per-leaf maximum instead of subdividing.
    pub max_depth: u32,
}

impl Default for TreePolicy {
    fn default() -> Self {
        Self {
            max_elements_per_leaf: 1000,
            min_forced_subdivision_depth: 3,
            max_depth: 10,
        }
    }
}

/// Configuration threaded through the ingestion pipeline.
#[derive(Debug, Clone, Default)]
pub struct IndexingConfig {
    /// Decimation factor: skip this many records between emitted points.
    pub skip: u32,
    pub policy: TreePolicy,
}

impl IndexingConfig {
    pub fn with_skip(skip: u32) -> Self {
        Self {
            skip,
            policy: TreePolicy::default(),
        }
    }
}
