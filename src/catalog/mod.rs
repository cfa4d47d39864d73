//! Persistent class registry
//!
//! Classes live in the index file as an append-only chain of class-header
//! nodes rooted at node 1. Each header node carries the zero-padded class
//! name followed by one 12-byte B-tree header per declared index. A class's
//! id is its position in the chain, which makes ids stable across sessions.

use std::collections::HashMap;
use thiserror::Error;

use crate::file::{FileError, NODE_DATA_LENGTH, PagedFile};
use crate::index::{BTREE_HEADER_SIZE, Btree, IndexError, KeySpec};

/// Fixed on-disk width of a class name, zero-padded
pub const CLASSNAME_SIZE: usize = 64;

/// Session-stable small integer identifying a class by chain position
pub type ClassId = u16;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("File error: {0}")]
    File(#[from] FileError),

    #[error("Index error: {0}")]
    Index(#[from] IndexError),

    #[error("Class name {0:?} is empty or too long")]
    BadClassName(String),

    #[error("Class {0} declares more indexes than fit its header node")]
    TooManyIndexes(String),

    #[error("Stored index {index_no} of class {class} does not match its declaration")]
    KeySpecMismatch { class: String, index_no: u16 },
}

pub type CatalogResult<T> = Result<T, CatalogError>;

/// One registered class
#[derive(Debug, Clone)]
pub struct ClassInfo {
    pub name: String,
    pub class_id: ClassId,
    /// Byte address of the first B-tree header slot, right after the name
    pub header_addr: u64,
    pub specs: Vec<KeySpec>,
}

/// Session cache over the on-disk class chain
#[derive(Default)]
pub struct Catalog {
    classes: Vec<ClassInfo>,
    by_name: HashMap<String, usize>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a class already seen this session
    pub fn get(&self, name: &str) -> Option<&ClassInfo> {
        self.by_name.get(name).map(|&i| &self.classes[i])
    }

    /// Id of a class seen this session
    pub fn class_id(&self, name: &str) -> Option<ClassId> {
        self.get(name).map(|cls| cls.class_id)
    }

    pub fn by_id(&self, class_id: ClassId) -> Option<&ClassInfo> {
        self.classes.iter().find(|cls| cls.class_id == class_id)
    }

    /// Register a class on first sight: finds it in the on-disk chain or
    /// appends a new class-header node, and opens or creates one B-tree per
    /// key spec. Must not be called for a name already cached.
    pub fn register(
        &mut self,
        file: &mut PagedFile,
        name: &str,
        specs: Vec<KeySpec>,
    ) -> CatalogResult<(ClassId, Vec<Btree>)> {
        debug_assert!(!self.by_name.contains_key(name));

        if name.is_empty() || name.len() > CLASSNAME_SIZE {
            return Err(CatalogError::BadClassName(name.to_string()));
        }
        for spec in &specs {
            spec.validate()?;
        }
        if CLASSNAME_SIZE + specs.len() * BTREE_HEADER_SIZE > NODE_DATA_LENGTH {
            return Err(CatalogError::TooManyIndexes(name.to_string()));
        }

        let mut class_id: ClassId = 0;
        let mut chain_tail = 0;

        if !file.is_new_file() {
            // the chain is rooted at node 1 of a non-empty index file
            let mut nbr = 1;
            while nbr != 0 {
                let mut stored = [0u8; CLASSNAME_SIZE];
                file.read_at(PagedFile::node_data_addr(nbr), &mut stored)?;
                if stored_name_matches(&stored, name) {
                    let header_addr = PagedFile::node_data_addr(nbr) + CLASSNAME_SIZE as u64;
                    let btrees = self.open_btrees(file, name, header_addr, &specs)?;
                    return Ok(self.cache(name, class_id, header_addr, specs, btrees));
                }
                class_id += 1;
                chain_tail = nbr;
                nbr = file.next_node(nbr)?;
            }
        }

        // unseen class: append a header node to the chain
        let nbr = file.new_node()?;
        if chain_tail != 0 {
            file.set_next_node(chain_tail, nbr)?;
        }

        let mut padded = [0u8; CLASSNAME_SIZE];
        padded[..name.len()].copy_from_slice(name.as_bytes());
        file.write_at(PagedFile::node_data_addr(nbr), &padded)?;
        // the allocator cleared the rest of the node

        let header_addr = PagedFile::node_data_addr(nbr) + CLASSNAME_SIZE as u64;
        let mut btrees = Vec::with_capacity(specs.len());
        for (i, spec) in specs.iter().enumerate() {
            let slot = header_addr + (i * BTREE_HEADER_SIZE) as u64;
            btrees.push(Btree::create(file, slot, spec.index_no, spec.key_len)?);
        }

        Ok(self.cache(name, class_id, header_addr, specs, btrees))
    }

    /// Open the persisted trees of a known class, asserting that the stored
    /// headers agree with the declared specs
    fn open_btrees(
        &self,
        file: &mut PagedFile,
        name: &str,
        header_addr: u64,
        specs: &[KeySpec],
    ) -> CatalogResult<Vec<Btree>> {
        let mut btrees = Vec::with_capacity(specs.len());
        for (i, spec) in specs.iter().enumerate() {
            let slot = header_addr + (i * BTREE_HEADER_SIZE) as u64;
            let tree = Btree::open(file, slot)?;
            if tree.key_len() != spec.key_len || tree.index_no() != spec.index_no {
                return Err(CatalogError::KeySpecMismatch {
                    class: name.to_string(),
                    index_no: spec.index_no,
                });
            }
            btrees.push(tree);
        }
        Ok(btrees)
    }

    fn cache(
        &mut self,
        name: &str,
        class_id: ClassId,
        header_addr: u64,
        specs: Vec<KeySpec>,
        btrees: Vec<Btree>,
    ) -> (ClassId, Vec<Btree>) {
        self.by_name.insert(name.to_string(), self.classes.len());
        self.classes.push(ClassInfo {
            name: name.to_string(),
            class_id,
            header_addr,
            specs,
        });
        (class_id, btrees)
    }
}

fn stored_name_matches(stored: &[u8; CLASSNAME_SIZE], name: &str) -> bool {
    let bytes = name.as_bytes();
    stored[..bytes.len()] == *bytes && stored[bytes.len()..].iter().all(|&b| b == 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::IndexError;
    use tempfile::TempDir;

    fn setup_index_file() -> (TempDir, PagedFile) {
        let temp_dir = tempfile::tempdir().unwrap();
        let file = PagedFile::open(temp_dir.path().join("test.idx"), true).unwrap();
        (temp_dir, file)
    }

    #[test]
    fn test_ids_assigned_in_registration_order() {
        let (_tmp, mut file) = setup_index_file();
        let mut catalog = Catalog::new();

        let (book, _) = catalog
            .register(&mut file, "Book", vec![KeySpec::value(0, 16)])
            .unwrap();
        let (member, _) = catalog
            .register(&mut file, "Member", vec![KeySpec::value(0, 8)])
            .unwrap();

        assert_eq!(book, 0);
        assert_eq!(member, 1);
        assert_eq!(catalog.class_id("Book"), Some(0));
        assert_eq!(catalog.by_id(1).unwrap().name, "Member");
    }

    #[test]
    fn test_ids_stable_across_reopen() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("test.idx");

        {
            let mut file = PagedFile::open(&path, true).unwrap();
            let mut catalog = Catalog::new();
            catalog
                .register(&mut file, "Book", vec![KeySpec::value(0, 16)])
                .unwrap();
            catalog
                .register(&mut file, "Member", vec![KeySpec::value(0, 8)])
                .unwrap();
            catalog
                .register(&mut file, "Loan", vec![KeySpec::value(0, 24)])
                .unwrap();
            file.flush().unwrap();
        }

        let mut file = PagedFile::open(&path, false).unwrap();
        let mut catalog = Catalog::new();
        // registration order differs; chain position wins
        let (loan, _) = catalog
            .register(&mut file, "Loan", vec![KeySpec::value(0, 24)])
            .unwrap();
        let (book, _) = catalog
            .register(&mut file, "Book", vec![KeySpec::value(0, 16)])
            .unwrap();
        let (member, _) = catalog
            .register(&mut file, "Member", vec![KeySpec::value(0, 8)])
            .unwrap();

        assert_eq!(book, 0);
        assert_eq!(member, 1);
        assert_eq!(loan, 2);
    }

    #[test]
    fn test_zero_length_key_rejected() {
        let (_tmp, mut file) = setup_index_file();
        let mut catalog = Catalog::new();

        let result = catalog.register(&mut file, "Bad", vec![KeySpec::value(0, 0)]);
        assert!(matches!(
            result,
            Err(CatalogError::Index(IndexError::ZeroLengthKey))
        ));
    }

    #[test]
    fn test_bad_class_name() {
        let (_tmp, mut file) = setup_index_file();
        let mut catalog = Catalog::new();

        assert!(matches!(
            catalog.register(&mut file, "", vec![]),
            Err(CatalogError::BadClassName(_))
        ));
        let long = "x".repeat(CLASSNAME_SIZE + 1);
        assert!(matches!(
            catalog.register(&mut file, &long, vec![]),
            Err(CatalogError::BadClassName(_))
        ));
    }

    #[test]
    fn test_too_many_indexes() {
        let (_tmp, mut file) = setup_index_file();
        let mut catalog = Catalog::new();

        let count = (NODE_DATA_LENGTH - CLASSNAME_SIZE) / BTREE_HEADER_SIZE + 1;
        let specs: Vec<KeySpec> = (0..count as u16).map(|i| KeySpec::value(i, 8)).collect();
        let result = catalog.register(&mut file, "Wide", specs);
        assert!(matches!(result, Err(CatalogError::TooManyIndexes(_))));
    }

    #[test]
    fn test_redeclaration_mismatch_detected() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("test.idx");

        {
            let mut file = PagedFile::open(&path, true).unwrap();
            let mut catalog = Catalog::new();
            catalog
                .register(&mut file, "Book", vec![KeySpec::value(0, 16)])
                .unwrap();
            file.flush().unwrap();
        }

        let mut file = PagedFile::open(&path, false).unwrap();
        let mut catalog = Catalog::new();
        let result = catalog.register(&mut file, "Book", vec![KeySpec::value(0, 32)]);
        assert!(matches!(
            result,
            Err(CatalogError::KeySpecMismatch { index_no: 0, .. })
        ));
    }

    #[test]
    fn test_keyless_class() {
        let (_tmp, mut file) = setup_index_file();
        let mut catalog = Catalog::new();

        let (id, btrees) = catalog.register(&mut file, "Scratch", vec![]).unwrap();
        assert_eq!(id, 0);
        assert!(btrees.is_empty());
        assert!(catalog.get("Scratch").unwrap().specs.is_empty());
    }

    #[test]
    fn test_name_prefix_is_not_a_match() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("test.idx");

        {
            let mut file = PagedFile::open(&path, true).unwrap();
            let mut catalog = Catalog::new();
            catalog
                .register(&mut file, "Bookmark", vec![KeySpec::value(0, 8)])
                .unwrap();
            file.flush().unwrap();
        }

        let mut file = PagedFile::open(&path, false).unwrap();
        let mut catalog = Catalog::new();
        let (id, _) = catalog
            .register(&mut file, "Book", vec![KeySpec::value(0, 8)])
            .unwrap();
        assert_eq!(id, 1);
    }
}
