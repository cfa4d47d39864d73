use thiserror::Error;

use crate::catalog::CatalogError;
use crate::file::{FileError, NodeNbr, ObjAddr};
use crate::index::IndexError;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("File error: {0}")]
    File(#[from] FileError),

    #[error("Index error: {0}")]
    Index(#[from] IndexError),

    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("Bad object address: node {0} is not the head of an object of the expected class")]
    BadObjAddr(ObjAddr),

    #[error("Object node chain corrupt at node {0}")]
    ChainCorrupt(NodeNbr),

    #[error("Object payload ended before the requested bytes")]
    UnexpectedEof,

    #[error("Stored string is not valid UTF-8")]
    InvalidString,

    #[error("Object produced {produced} key values for {declared} declared keys")]
    KeyCountMismatch { declared: usize, produced: usize },

    #[error("Handle or cursor used with an object of another class")]
    ClassMismatch,

    #[error("Object is not tracked by this datastore")]
    NotLive,
}
