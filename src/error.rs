use std::io;
use thiserror::Error;

use crate::types::PageId;

pub type Result<T> = std::result::Result<T, VettoreError>;

/// Detail attached to a [`VettoreError::Corruption`] report.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CorruptionKind {
    /// Page header magic did not match.
    BadMagic,
    /// Stored checksum disagrees with a recomputation over the payload.
    BadChecksum,
    /// Page header declared an impossible layout.
    BadHeader,
    /// File ended before a full page could be read.
    Truncated,
    /// In-memory bookkeeping disagrees with the on-disk state.
    BadState,
}

impl CorruptionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CorruptionKind::BadMagic => "bad magic",
            CorruptionKind::BadChecksum => "bad checksum",
            CorruptionKind::BadHeader => "bad header",
            CorruptionKind::Truncated => "truncated",
            CorruptionKind::BadState => "bad state",
        }
    }
}

#[derive(Debug, Error)]
pub enum VettoreError {
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("{0} already exists")]
    AlreadyExists(&'static str),
    #[error("invalid collection spec: {0}")]
    InvalidSpec(String),
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),
    #[error("unsupported on-disk format version {0}")]
    UnsupportedVersion(u16),
    #[error("corruption in page {page_id}: {}", .kind.as_str())]
    Corruption { page_id: PageId, kind: CorruptionKind },
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("operation canceled")]
    Canceled,
    #[error("capacity exceeded: {0}")]
    CapacityExceeded(&'static str),
}

impl VettoreError {
    /// Errors that leave the collection unusable until operator intervention.
    pub fn quarantines(&self) -> bool {
        matches!(
            self,
            VettoreError::Corruption { .. } | VettoreError::UnsupportedVersion(_)
        )
    }

    pub(crate) fn corruption(page_id: PageId, kind: CorruptionKind) -> Self {
        VettoreError::Corruption { page_id, kind }
    }
}
