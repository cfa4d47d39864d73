use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FileError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Bad magic number in file header")]
    BadMagic,

    #[error("Unsupported file version: {0}")]
    UnsupportedVersion(u32),

    #[error("Node size mismatch: file says {stored}, build uses {expected}")]
    NodeSizeMismatch { stored: u32, expected: u32 },

    #[error("Invalid node number: {0}")]
    InvalidNode(u32),

    #[error("Free list cycle detected at node {0}")]
    FreeListCycle(u32),
}

pub type FileResult<T> = Result<T, FileError>;
