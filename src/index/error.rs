use thiserror::Error;

use crate::file::{FileError, NodeNbr};

/// Result type for index operations
pub type IndexResult<T> = Result<T, IndexError>;

/// Errors that can occur during index operations
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("File error: {0}")]
    File(#[from] FileError),

    #[error("Index declared with a zero-length key")]
    ZeroLengthKey,

    #[error("Key length {0} does not fit a tree node")]
    KeyTooLong(usize),

    #[error("Corrupted tree node {0}")]
    CorruptNode(NodeNbr),
}
