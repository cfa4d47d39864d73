//! Embeddable, single-process object datastore.
//!
//! Each datastore is two files: `<base>.eds` holds object payloads laid
//! across chains of fixed-size nodes, `<base>.idx` holds the class registry
//! and one on-disk B-tree per declared index. Applications declare classes
//! through the [`Persistent`] trait and drive inserts, updates, deletes,
//! lookups and cursored traversal through [`Datastore`]; point operations
//! stay O(log n) in the number of indexed objects.

pub mod catalog;
pub mod file;
pub mod index;
pub mod store;

pub use index::{KeySpec, KeyValue};
pub use store::{
    Cursor, Datastore, ObjRef, ObjectReader, ObjectWriter, Persistent, StoreError, StoreResult,
};
