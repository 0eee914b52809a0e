use std::path::PathBuf;

use thiserror::Error;

/// Errors for every recoverable failure in the crate.
///
/// Anything not listed here (broken lattices, all-pruned positions, invalid
/// n-gram arithmetic) is a programming error and panics with a diagnostic
/// dump instead of being reported through `Result`.
#[derive(Debug, Error)]
pub enum Error {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A serialized record carried the wrong format version tag.
    #[error("wrong serial version, got {found} (expected {expected})")]
    VersionMismatch { expected: i64, found: i64 },

    /// A lattice record started with a discriminant no variant claims.
    #[error("unknown lattice variant {0}")]
    UnknownVariant(i64),

    /// A lattice loaded from storage does not belong to the sequence it was
    /// paired with.
    #[error("sequence hash mismatch: lattice has {found:#x}, sequence has {expected:#x}")]
    SequenceHashMismatch { expected: u32, found: u32 },

    /// A required data file is absent and the caller asked for strict handling.
    #[error("missing data file: {0}")]
    MissingDataFile(PathBuf),

    #[error("malformed weight dump: {0}")]
    WeightDump(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
