//! LAS point cloud decoding and adaptive octree spatial indexing.
//!
//! The crate decodes raw little-endian LAS point records (formats 0 to 3),
//! normalises their coordinates into a canonical unit cube around the
//! origin, and partitions them with an adaptive octree whose leaves carry
//! render-ready vertex buffers and aggregate summaries. Two tree variants
//! share the same partitioning semantics: [`Octree`] keeps every element in
//! memory, [`SpillingOctree`] keeps each leaf in an on-disk spill file so
//! datasets larger than memory can still be indexed.
//!
//! Construction is a two-pass pipeline over one or more files: a header
//! pass establishes the global bounds, then decoders run in parallel and
//! stream decimated, normalised points into a single-writer tree.
pub mod bounds;
pub mod config;
pub mod error;
pub mod header;
pub mod octree;
pub mod pipeline;
pub mod record;
pub mod spill;

pub use bounds::PointCloudBounds;
pub use config::{IndexingConfig, TreePolicy};
pub use error::{IndexError, IndexResult};
pub use header::LasHeader;
pub use octree::{LeafPoints, LeafSummary, NodeId, Octree, OctreeElement};
pub use pipeline::{ingest, IngestReport, PointSink};
pub use record::{DecodedPoint, PointFormat, RecordDecoder, RecordStream};
pub use spill::SpillingOctree;
