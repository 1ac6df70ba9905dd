use std::path::PathBuf;

use cairn_store::StoreError;
use cairn_types::ObjectId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PackError {
    #[error("invalid magic: expected {expected}, got {actual}")]
    InvalidMagic { expected: String, actual: String },

    #[error("unsupported pack version: {0}")]
    UnsupportedVersion(u32),

    #[error("checksum mismatch in {0}")]
    ChecksumMismatch(PathBuf),

    #[error("corrupt pack entry at offset {offset}: {reason}")]
    CorruptEntry { offset: u64, reason: String },

    #[error("CRC32 mismatch for object {id}")]
    CrcMismatch { id: ObjectId },

    #[error("decompression failed: {0}")]
    DecompressionFailed(String),

    #[error("compression failed: {0}")]
    CompressionFailed(String),

    #[error("index corrupted: {0}")]
    IndexCorrupted(String),

    /// The segment's data no longer matches the index loaded for it.
    #[error("pack segment {name} is corrupt or was replaced: {reason}")]
    CorruptSegment { name: String, reason: String },

    /// The segment's backing files have disappeared.
    #[error("pack segment {name} is missing")]
    SegmentMissing { name: String },

    /// No source holds the object.
    #[error("missing object {0}")]
    MissingObject(ObjectId),

    /// A pack could not be written; nothing was published.
    #[error("failed to write pack {path}: {source}")]
    WriteFailure {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("loose store error: {0}")]
    Store(#[from] StoreError),
}

impl PackError {
    /// Failures confined to one segment. The directory drops or reopens the
    /// segment and retries elsewhere instead of surfacing these.
    pub fn is_segment_failure(&self) -> bool {
        matches!(
            self,
            Self::CorruptSegment { .. }
                | Self::SegmentMissing { .. }
                | Self::CrcMismatch { .. }
                | Self::CorruptEntry { .. }
                | Self::DecompressionFailed(_)
        )
    }
}

pub type PackResult<T> = Result<T, PackError>;
