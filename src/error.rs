//! Error types for point cloud decoding and index construction.
use std::path::PathBuf;
use thiserror::Error;

/// Result type for indexing operations.
pub type IndexResult<T> = Result<T, IndexError>;

/// Faults raised while decoding source files or building the octree.
///
/// Header and record faults are file-scoped: the ingestion pipeline logs
/// them and continues with the remaining files. `TruncatedSpill` is fatal
/// for the construction pass, since it means an intermediate file on disk
/// is corrupt.
#[derive(Debug, Error)]
pub enum IndexError {
    /// The leading 4-byte signature of the file header was not `LASF`.
    #[error("malformed header: file signature is not LASF")]
    MalformedHeader,

    /// The header's point data format id is outside the supported set.
    #[error("unsupported point record format {0}")]
    UnsupportedRecordFormat(u8),

    /// The combined extents of every usable source span zero width, so
    /// coordinates cannot be normalised into the canonical cube.
    #[error("degenerate source extents: largest axis span is zero")]
    DegenerateExtent,

    /// The record block ended mid-record. Carries the number of points
    /// that were decoded and emitted before the fault.
    #[error("truncated point record after {emitted} decoded points")]
    TruncatedRecord { emitted: u64 },

    /// A per-node spill file ended mid-record while being drained.
    #[error("truncated spill record in {}", path.display())]
    TruncatedSpill { path: PathBuf },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
