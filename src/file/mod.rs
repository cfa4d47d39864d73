mod error;
mod node;
mod paged_file;

pub use error::{FileError, FileResult};
pub use node::{Node, NODE_HEADER_SIZE};
pub use paged_file::PagedFile;

/// Node size in bytes (1KB), fixed for the lifetime of a file
pub const NODE_SIZE: usize = 1024;

/// Payload bytes per node (node size minus the node header)
pub const NODE_DATA_LENGTH: usize = NODE_SIZE - NODE_HEADER_SIZE;

/// Number of nodes held in each file's page cache
pub const PAGE_CACHE_SIZE: usize = 256;

/// 1-based node number; 0 means "none"
pub type NodeNbr = u32;

/// Address of an object: the node number of its first node
pub type ObjAddr = u32;
