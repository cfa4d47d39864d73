//! Index structures: keys and the paged on-disk B-tree

mod btree;
mod error;
mod key;

pub use btree::{BTREE_HEADER_SIZE, BtCursor, Btree};
pub use error::{IndexError, IndexResult};
pub use key::{ADDRESS_KEY_LENGTH, Key, KeyKind, KeySpec, KeyValue};
