//! Paged on-disk B-tree
//!
//! Every declared index is one of these trees; all trees of a datastore
//! share the index file and its free list. Each tree node occupies one file
//! node with the layout `[parent | is_leaf | key_count | keys | children]`;
//! keys are fixed-width `(key bytes, object address)` entries. Parent
//! pointers are kept current through splits, borrows and merges so that a
//! cursor can walk the in-order sequence without auxiliary state.

use crate::file::{NODE_DATA_LENGTH, NODE_HEADER_SIZE, NodeNbr, PagedFile};

use super::error::{IndexError, IndexResult};
use super::key::Key;

/// Bytes of a persisted tree header: root (4), key length (2),
/// index number (2), key count (4)
pub const BTREE_HEADER_SIZE: usize = 12;

/// Smallest supported minimum degree
const MIN_DEGREE: usize = 4;

/// Tree-node prefix inside a file node's payload: parent (4),
/// is_leaf (1), key_count (2)
const NODE_PREFIX: usize = 7;

/// A position in the in-order key sequence of one tree.
///
/// Cursors are plain values handed back by the positioning calls (`seek`,
/// `first`, `last`) and re-presented to `next`/`previous`. Any insert or
/// delete on the tree invalidates outstanding cursors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BtCursor {
    node: NodeNbr,
    slot: usize,
}

/// In-memory image of one tree node
struct BtNode {
    nbr: NodeNbr,
    parent: NodeNbr,
    leaf: bool,
    keys: Vec<Key>,
    children: Vec<NodeNbr>,
}

/// One B-tree over the index file
pub struct Btree {
    index_no: u16,
    key_len: usize,
    header_addr: u64,
    root: NodeNbr,
    key_count: u32,
    /// Minimum degree m: nodes hold m-1 to 2m-1 keys, the root 1 to 2m-1
    order: usize,
    changed: bool,
}

impl Btree {
    /// Create a fresh tree and persist its header at `header_addr`
    pub fn create(
        file: &mut PagedFile,
        header_addr: u64,
        index_no: u16,
        key_len: usize,
    ) -> IndexResult<Self> {
        let order = Self::compute_order(key_len)?;
        let mut tree = Self {
            index_no,
            key_len,
            header_addr,
            root: 0,
            key_count: 0,
            order,
            changed: true,
        };
        tree.write_header(file)?;
        Ok(tree)
    }

    /// Open a tree from its persisted header
    pub fn open(file: &mut PagedFile, header_addr: u64) -> IndexResult<Self> {
        let mut buf = [0u8; BTREE_HEADER_SIZE];
        file.read_at(header_addr, &mut buf)?;

        let root = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let key_len = u16::from_le_bytes([buf[4], buf[5]]) as usize;
        let index_no = u16::from_le_bytes([buf[6], buf[7]]);
        let key_count = u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]);

        let order = Self::compute_order(key_len)?;
        Ok(Self {
            index_no,
            key_len,
            header_addr,
            root,
            key_count,
            order,
            changed: false,
        })
    }

    /// Persist the header if anything changed since the last write
    pub fn write_header(&mut self, file: &mut PagedFile) -> IndexResult<()> {
        if !self.changed {
            return Ok(());
        }
        let mut buf = [0u8; BTREE_HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.root.to_le_bytes());
        buf[4..6].copy_from_slice(&(self.key_len as u16).to_le_bytes());
        buf[6..8].copy_from_slice(&self.index_no.to_le_bytes());
        buf[8..12].copy_from_slice(&self.key_count.to_le_bytes());
        file.write_at(self.header_addr, &buf)?;
        self.changed = false;
        Ok(())
    }

    pub fn index_no(&self) -> u16 {
        self.index_no
    }

    pub fn key_len(&self) -> usize {
        self.key_len
    }

    /// Total number of keys in the tree
    pub fn len(&self) -> u32 {
        self.key_count
    }

    pub fn is_empty(&self) -> bool {
        self.key_count == 0
    }

    // ========== Search and cursors ==========

    /// Position at the first key >= `probe`, or None when no such key exists
    pub fn seek(&self, file: &mut PagedFile, probe: &Key) -> IndexResult<Option<BtCursor>> {
        if self.root == 0 {
            return Ok(None);
        }
        let mut current = self.root;
        let mut best = None;
        loop {
            let node = self.load(file, current)?;
            let idx = node.keys.partition_point(|k| k < probe);
            if idx < node.keys.len() {
                best = Some(BtCursor {
                    node: current,
                    slot: idx,
                });
                if node.keys[idx] == *probe {
                    break;
                }
            }
            if node.leaf {
                break;
            }
            current = node.children[idx];
        }
        Ok(best)
    }

    /// Seek plus the equal-key test: the cursor of the first key >= `probe`
    /// and whether a key with the same bytes exists
    pub fn find(&self, file: &mut PagedFile, probe: &Key) -> IndexResult<(Option<BtCursor>, bool)> {
        let cursor = self.seek(file, probe)?;
        let found = match cursor {
            Some(cur) => self.key_at(file, &cur)?.bytes == probe.bytes,
            None => false,
        };
        Ok((cursor, found))
    }

    /// True when some entry carries exactly these key bytes
    pub fn contains_bytes(&self, file: &mut PagedFile, bytes: &[u8]) -> IndexResult<bool> {
        let mut probe_bytes = vec![0u8; self.key_len];
        let n = bytes.len().min(self.key_len);
        probe_bytes[..n].copy_from_slice(&bytes[..n]);
        let (_, found) = self.find(file, &Key::new(probe_bytes, 0))?;
        Ok(found)
    }

    /// Key under the cursor
    pub fn key_at(&self, file: &mut PagedFile, cursor: &BtCursor) -> IndexResult<Key> {
        let node = self.load(file, cursor.node)?;
        node.keys
            .get(cursor.slot)
            .cloned()
            .ok_or(IndexError::CorruptNode(cursor.node))
    }

    /// Cursor at the smallest key
    pub fn first(&self, file: &mut PagedFile) -> IndexResult<Option<BtCursor>> {
        if self.root == 0 {
            return Ok(None);
        }
        Ok(Some(self.min_cursor(file, self.root)?))
    }

    /// Cursor at the largest key
    pub fn last(&self, file: &mut PagedFile) -> IndexResult<Option<BtCursor>> {
        if self.root == 0 {
            return Ok(None);
        }
        Ok(Some(self.max_cursor(file, self.root)?))
    }

    /// In-order successor position
    pub fn next(&self, file: &mut PagedFile, cursor: &BtCursor) -> IndexResult<Option<BtCursor>> {
        let node = self.load(file, cursor.node)?;
        if !node.leaf {
            return Ok(Some(self.min_cursor(file, node.children[cursor.slot + 1])?));
        }
        if cursor.slot + 1 < node.keys.len() {
            return Ok(Some(BtCursor {
                node: cursor.node,
                slot: cursor.slot + 1,
            }));
        }
        // climb until we come up from a child that has a key to its right
        let mut child = node.nbr;
        let mut parent = node.parent;
        while parent != 0 {
            let up = self.load(file, parent)?;
            let pos = up
                .children
                .iter()
                .position(|&c| c == child)
                .ok_or(IndexError::CorruptNode(parent))?;
            if pos < up.keys.len() {
                return Ok(Some(BtCursor {
                    node: parent,
                    slot: pos,
                }));
            }
            child = parent;
            parent = up.parent;
        }
        Ok(None)
    }

    /// In-order predecessor position
    pub fn previous(
        &self,
        file: &mut PagedFile,
        cursor: &BtCursor,
    ) -> IndexResult<Option<BtCursor>> {
        let node = self.load(file, cursor.node)?;
        if !node.leaf {
            return Ok(Some(self.max_cursor(file, node.children[cursor.slot])?));
        }
        if cursor.slot > 0 {
            return Ok(Some(BtCursor {
                node: cursor.node,
                slot: cursor.slot - 1,
            }));
        }
        let mut child = node.nbr;
        let mut parent = node.parent;
        while parent != 0 {
            let up = self.load(file, parent)?;
            let pos = up
                .children
                .iter()
                .position(|&c| c == child)
                .ok_or(IndexError::CorruptNode(parent))?;
            if pos > 0 {
                return Ok(Some(BtCursor {
                    node: parent,
                    slot: pos - 1,
                }));
            }
            child = parent;
            parent = up.parent;
        }
        Ok(None)
    }

    /// Back up over duplicates of the key under the cursor until the key
    /// bytes change, then step forward once: lands on the first duplicate
    /// in the in-order sequence (the secondary-index seek protocol)
    pub fn first_duplicate(
        &self,
        file: &mut PagedFile,
        cursor: BtCursor,
    ) -> IndexResult<BtCursor> {
        let bytes = self.key_at(file, &cursor)?.bytes;
        let mut current = cursor;
        while let Some(back) = self.previous(file, &current)? {
            if self.key_at(file, &back)?.bytes != bytes {
                break;
            }
            current = back;
        }
        Ok(current)
    }

    // ========== Insert ==========

    /// Insert a key; duplicate `(bytes, addr)` pairs are rejected.
    /// Returns whether the key went in.
    pub fn insert(&mut self, file: &mut PagedFile, key: &Key) -> IndexResult<bool> {
        debug_assert_eq!(key.bytes.len(), self.key_len);

        if self.root == 0 {
            let nbr = file.new_node()?;
            let node = BtNode {
                nbr,
                parent: 0,
                leaf: true,
                keys: vec![key.clone()],
                children: Vec::new(),
            };
            self.store(file, &node)?;
            self.root = nbr;
            self.key_count += 1;
            self.changed = true;
            return Ok(true);
        }

        if let Some(cursor) = self.seek(file, key)? {
            if self.key_at(file, &cursor)? == *key {
                return Ok(false);
            }
        }

        let max_keys = self.max_keys();
        let root = self.load(file, self.root)?;
        if root.keys.len() == max_keys {
            // grow height by one
            let new_root_nbr = file.new_node()?;
            let mut old_root = root;
            old_root.parent = new_root_nbr;
            self.store(file, &old_root)?;

            let mut new_root = BtNode {
                nbr: new_root_nbr,
                parent: 0,
                leaf: false,
                keys: Vec::new(),
                children: vec![old_root.nbr],
            };
            self.split_child(file, &mut new_root, 0)?;
            self.root = new_root_nbr;
        }

        // descend, splitting any full child ahead of the step into it
        let mut current = self.root;
        loop {
            let mut node = self.load(file, current)?;
            if node.leaf {
                let idx = node.keys.partition_point(|k| k < key);
                node.keys.insert(idx, key.clone());
                self.store(file, &node)?;
                break;
            }
            let mut idx = node.keys.partition_point(|k| k < key);
            let child = self.load(file, node.children[idx])?;
            if child.keys.len() == max_keys {
                self.split_child(file, &mut node, idx)?;
                if *key > node.keys[idx] {
                    idx += 1;
                }
            }
            current = node.children[idx];
        }

        self.key_count += 1;
        self.changed = true;
        Ok(true)
    }

    /// Split the full child at `child_idx`, promoting its median into
    /// `parent`
    fn split_child(
        &mut self,
        file: &mut PagedFile,
        parent: &mut BtNode,
        child_idx: usize,
    ) -> IndexResult<()> {
        let m = self.order;
        let mut child = self.load(file, parent.children[child_idx])?;
        let right_nbr = file.new_node()?;

        let median = child.keys[m - 1].clone();
        let right_keys = child.keys.split_off(m);
        child.keys.truncate(m - 1);
        let right_children = if child.leaf {
            Vec::new()
        } else {
            child.children.split_off(m)
        };

        for &moved in &right_children {
            self.set_parent(file, moved, right_nbr)?;
        }

        let right = BtNode {
            nbr: right_nbr,
            parent: parent.nbr,
            leaf: child.leaf,
            keys: right_keys,
            children: right_children,
        };

        parent.keys.insert(child_idx, median);
        parent.children.insert(child_idx + 1, right_nbr);

        self.store(file, &child)?;
        self.store(file, &right)?;
        self.store(file, parent)?;
        Ok(())
    }

    // ========== Delete ==========

    /// Delete the entry equal to `key` (full `(bytes, addr)` match).
    /// Returns whether anything was removed.
    pub fn delete(&mut self, file: &mut PagedFile, key: &Key) -> IndexResult<bool> {
        if self.root == 0 {
            return Ok(false);
        }
        let found = self.delete_from(file, self.root, key)?;

        // collapse an emptied root
        let root = self.load(file, self.root)?;
        if root.keys.is_empty() {
            file.mark_deleted(self.root)?;
            if root.leaf {
                self.root = 0;
            } else {
                let only_child = root.children[0];
                self.set_parent(file, only_child, 0)?;
                self.root = only_child;
            }
            self.changed = true;
        }

        if found {
            self.key_count -= 1;
            self.changed = true;
        }
        Ok(found)
    }

    fn delete_from(&mut self, file: &mut PagedFile, nbr: NodeNbr, key: &Key) -> IndexResult<bool> {
        let mut node = self.load(file, nbr)?;
        let idx = node.keys.partition_point(|k| k < key);
        let exact = idx < node.keys.len() && node.keys[idx] == *key;

        if node.leaf {
            if !exact {
                return Ok(false);
            }
            node.keys.remove(idx);
            self.store(file, &node)?;
            return Ok(true);
        }

        if exact {
            let left_nbr = node.children[idx];
            let right_nbr = node.children[idx + 1];

            let left = self.load(file, left_nbr)?;
            if left.keys.len() >= self.order {
                let pred = self.max_key(file, left_nbr)?;
                node.keys[idx] = pred.clone();
                self.store(file, &node)?;
                return self.delete_from(file, left_nbr, &pred);
            }

            let right = self.load(file, right_nbr)?;
            if right.keys.len() >= self.order {
                let succ = self.min_key(file, right_nbr)?;
                node.keys[idx] = succ.clone();
                self.store(file, &node)?;
                return self.delete_from(file, right_nbr, &succ);
            }

            // both children minimal: pull the separator down and merge
            self.merge_children(file, &mut node, idx)?;
            return self.delete_from(file, left_nbr, key);
        }

        // descending: top up a minimal child first, then retry from here
        // (the key may have rotated between siblings)
        let child_nbr = node.children[idx];
        let child = self.load(file, child_nbr)?;
        if child.keys.len() < self.order {
            self.fill_child(file, &mut node, idx)?;
            return self.delete_from(file, nbr, key);
        }
        self.delete_from(file, child_nbr, key)
    }

    /// Bring the child at `idx` up to at least `order` keys by borrowing
    /// from a sibling or merging with one
    fn fill_child(&mut self, file: &mut PagedFile, node: &mut BtNode, idx: usize) -> IndexResult<()> {
        if idx > 0 {
            let left = self.load(file, node.children[idx - 1])?;
            if left.keys.len() >= self.order {
                return self.borrow_from_prev(file, node, idx);
            }
        }
        if idx + 1 < node.children.len() {
            let right = self.load(file, node.children[idx + 1])?;
            if right.keys.len() >= self.order {
                return self.borrow_from_next(file, node, idx);
            }
        }
        if idx + 1 < node.children.len() {
            self.merge_children(file, node, idx)
        } else {
            self.merge_children(file, node, idx - 1)
        }
    }

    /// Rotate the last key of the left sibling through the parent into the
    /// front of the child
    fn borrow_from_prev(
        &mut self,
        file: &mut PagedFile,
        node: &mut BtNode,
        idx: usize,
    ) -> IndexResult<()> {
        let mut child = self.load(file, node.children[idx])?;
        let mut sibling = self.load(file, node.children[idx - 1])?;

        let separator = node.keys[idx - 1].clone();
        child.keys.insert(0, separator);
        node.keys[idx - 1] = sibling.keys.pop().ok_or(IndexError::CorruptNode(sibling.nbr))?;

        if !child.leaf {
            let moved = sibling
                .children
                .pop()
                .ok_or(IndexError::CorruptNode(sibling.nbr))?;
            child.children.insert(0, moved);
            self.set_parent(file, moved, child.nbr)?;
        }

        self.store(file, &sibling)?;
        self.store(file, &child)?;
        self.store(file, node)?;
        Ok(())
    }

    /// Rotate the first key of the right sibling through the parent onto
    /// the back of the child
    fn borrow_from_next(
        &mut self,
        file: &mut PagedFile,
        node: &mut BtNode,
        idx: usize,
    ) -> IndexResult<()> {
        let mut child = self.load(file, node.children[idx])?;
        let mut sibling = self.load(file, node.children[idx + 1])?;

        let separator = node.keys[idx].clone();
        child.keys.push(separator);
        node.keys[idx] = sibling.keys.remove(0);

        if !child.leaf {
            let moved = sibling.children.remove(0);
            child.children.push(moved);
            self.set_parent(file, moved, child.nbr)?;
        }

        self.store(file, &sibling)?;
        self.store(file, &child)?;
        self.store(file, node)?;
        Ok(())
    }

    /// Merge `children[idx]`, the separator at `idx` and `children[idx+1]`
    /// into one node, freeing the right one
    fn merge_children(
        &mut self,
        file: &mut PagedFile,
        node: &mut BtNode,
        idx: usize,
    ) -> IndexResult<()> {
        let left_nbr = node.children[idx];
        let right_nbr = node.children[idx + 1];

        let mut left = self.load(file, left_nbr)?;
        let right = self.load(file, right_nbr)?;

        left.keys.push(node.keys.remove(idx));
        left.keys.extend(right.keys);
        if !left.leaf {
            for &moved in &right.children {
                self.set_parent(file, moved, left_nbr)?;
            }
            left.children.extend(right.children);
        }
        node.children.remove(idx + 1);

        file.mark_deleted(right_nbr)?;
        self.store(file, &left)?;
        self.store(file, node)?;
        self.changed = true;
        Ok(())
    }

    // ========== Node I/O ==========

    fn max_keys(&self) -> usize {
        2 * self.order - 1
    }

    fn entry_width(&self) -> usize {
        self.key_len + 4
    }

    fn children_offset(&self) -> usize {
        NODE_PREFIX + self.max_keys() * self.entry_width()
    }

    /// Largest minimum degree whose worst-case node fits the payload
    fn compute_order(key_len: usize) -> IndexResult<usize> {
        if key_len == 0 {
            return Err(IndexError::ZeroLengthKey);
        }
        let width = key_len + 4;
        let usable = NODE_DATA_LENGTH - NODE_PREFIX;
        // max_keys * width + (max_keys + 1) * 4 <= usable
        let max_keys = (usable - 4) / (width + 4);
        let order = (max_keys + 1) / 2;
        if order < MIN_DEGREE {
            return Err(IndexError::KeyTooLong(key_len));
        }
        Ok(order)
    }

    fn load(&self, file: &mut PagedFile, nbr: NodeNbr) -> IndexResult<BtNode> {
        let width = self.entry_width();
        let max_keys = self.max_keys();
        let children_offset = self.children_offset();

        let page = file.page(nbr)?;
        let payload = &page[NODE_HEADER_SIZE..];

        let parent = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
        let leaf = payload[4] != 0;
        let count = u16::from_le_bytes([payload[5], payload[6]]) as usize;
        if count > max_keys {
            return Err(IndexError::CorruptNode(nbr));
        }

        let mut keys = Vec::with_capacity(count);
        for i in 0..count {
            let offset = NODE_PREFIX + i * width;
            keys.push(Key::read(&payload[offset..offset + width], self.key_len));
        }

        let mut children = Vec::new();
        if !leaf {
            children.reserve(count + 1);
            for i in 0..=count {
                let offset = children_offset + i * 4;
                children.push(u32::from_le_bytes([
                    payload[offset],
                    payload[offset + 1],
                    payload[offset + 2],
                    payload[offset + 3],
                ]));
            }
        }

        Ok(BtNode {
            nbr,
            parent,
            leaf,
            keys,
            children,
        })
    }

    fn store(&self, file: &mut PagedFile, node: &BtNode) -> IndexResult<()> {
        debug_assert!(node.keys.len() <= self.max_keys());
        debug_assert!(node.leaf || node.children.len() == node.keys.len() + 1);

        let width = self.entry_width();
        let children_offset = self.children_offset();

        let page = file.page_mut(node.nbr)?;
        let payload = &mut page[NODE_HEADER_SIZE..];

        payload[0..4].copy_from_slice(&node.parent.to_le_bytes());
        payload[4] = node.leaf as u8;
        payload[5..7].copy_from_slice(&(node.keys.len() as u16).to_le_bytes());

        for (i, key) in node.keys.iter().enumerate() {
            let offset = NODE_PREFIX + i * width;
            key.write(&mut payload[offset..offset + width]);
        }
        for (i, &child) in node.children.iter().enumerate() {
            let offset = children_offset + i * 4;
            payload[offset..offset + 4].copy_from_slice(&child.to_le_bytes());
        }
        Ok(())
    }

    /// Patch just the parent field of a node
    fn set_parent(&self, file: &mut PagedFile, nbr: NodeNbr, parent: NodeNbr) -> IndexResult<()> {
        file.write_at(PagedFile::node_data_addr(nbr), &parent.to_le_bytes())?;
        Ok(())
    }

    fn min_cursor(&self, file: &mut PagedFile, mut nbr: NodeNbr) -> IndexResult<BtCursor> {
        loop {
            let node = self.load(file, nbr)?;
            if node.leaf {
                return Ok(BtCursor { node: nbr, slot: 0 });
            }
            nbr = node.children[0];
        }
    }

    fn max_cursor(&self, file: &mut PagedFile, mut nbr: NodeNbr) -> IndexResult<BtCursor> {
        loop {
            let node = self.load(file, nbr)?;
            if node.leaf {
                if node.keys.is_empty() {
                    return Err(IndexError::CorruptNode(nbr));
                }
                return Ok(BtCursor {
                    node: nbr,
                    slot: node.keys.len() - 1,
                });
            }
            nbr = *node.children.last().unwrap();
        }
    }

    fn min_key(&self, file: &mut PagedFile, nbr: NodeNbr) -> IndexResult<Key> {
        let cursor = self.min_cursor(file, nbr)?;
        self.key_at(file, &cursor)
    }

    fn max_key(&self, file: &mut PagedFile, nbr: NodeNbr) -> IndexResult<Key> {
        let cursor = self.max_cursor(file, nbr)?;
        self.key_at(file, &cursor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::key::KeySpec;
    use tempfile::TempDir;

    const KEY_LEN: usize = 8;

    fn setup_tree() -> (TempDir, PagedFile, Btree) {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut file = PagedFile::open(temp_dir.path().join("test.idx"), true).unwrap();
        // a node to host the header, as a class-header node would
        let header_node = file.new_node().unwrap();
        let header_addr = PagedFile::node_data_addr(header_node);
        let tree = Btree::create(&mut file, header_addr, 0, KEY_LEN).unwrap();
        (temp_dir, file, tree)
    }

    fn key(n: u64, addr: u32) -> Key {
        Key::new(n.to_be_bytes().to_vec(), addr)
    }

    fn collect(tree: &Btree, file: &mut PagedFile) -> Vec<Key> {
        let mut out = Vec::new();
        let mut cursor = tree.first(file).unwrap();
        while let Some(cur) = cursor {
            out.push(tree.key_at(file, &cur).unwrap());
            cursor = tree.next(file, &cur).unwrap();
        }
        out
    }

    #[test]
    fn test_empty_tree() {
        let (_tmp, mut file, tree) = setup_tree();
        assert!(tree.is_empty());
        assert!(tree.first(&mut file).unwrap().is_none());
        assert!(tree.last(&mut file).unwrap().is_none());
        assert!(tree.seek(&mut file, &key(1, 1)).unwrap().is_none());
    }

    #[test]
    fn test_insert_and_find() {
        let (_tmp, mut file, mut tree) = setup_tree();

        assert!(tree.insert(&mut file, &key(5, 100)).unwrap());
        assert!(tree.insert(&mut file, &key(3, 101)).unwrap());
        assert!(tree.insert(&mut file, &key(9, 102)).unwrap());
        assert_eq!(tree.len(), 3);

        let (cursor, found) = tree.find(&mut file, &key(5, 0)).unwrap();
        assert!(found);
        assert_eq!(tree.key_at(&mut file, &cursor.unwrap()).unwrap().addr, 100);

        let (_, found) = tree.find(&mut file, &key(4, 0)).unwrap();
        assert!(!found);
    }

    #[test]
    fn test_duplicate_entry_rejected() {
        let (_tmp, mut file, mut tree) = setup_tree();

        assert!(tree.insert(&mut file, &key(5, 100)).unwrap());
        assert!(!tree.insert(&mut file, &key(5, 100)).unwrap());
        // same bytes, different address is a legal secondary duplicate
        assert!(tree.insert(&mut file, &key(5, 101)).unwrap());
        assert_eq!(tree.len(), 2);
    }

    #[test]
    fn test_in_order_traversal_after_splits() {
        let (_tmp, mut file, mut tree) = setup_tree();

        // enough keys for several levels at this key length
        let mut n: u64 = 1;
        for _ in 0..2000 {
            n = n.wrapping_mul(48271) % 0x7FFF_FFFF;
            assert!(tree.insert(&mut file, &key(n, (n % 9973) as u32)).unwrap());
        }
        assert_eq!(tree.len(), 2000);

        let keys = collect(&tree, &mut file);
        assert_eq!(keys.len(), 2000);
        for pair in keys.windows(2) {
            assert!(pair[0] < pair[1]);
        }
    }

    #[test]
    fn test_backward_traversal() {
        let (_tmp, mut file, mut tree) = setup_tree();

        for n in 0..500u64 {
            tree.insert(&mut file, &key(n, n as u32 + 1)).unwrap();
        }

        let mut out = Vec::new();
        let mut cursor = tree.last(&mut file).unwrap();
        while let Some(cur) = cursor {
            out.push(tree.key_at(&mut file, &cur).unwrap());
            cursor = tree.previous(&mut file, &cur).unwrap();
        }
        assert_eq!(out.len(), 500);
        for pair in out.windows(2) {
            assert!(pair[0] > pair[1]);
        }
    }

    #[test]
    fn test_seek_lands_on_first_geq() {
        let (_tmp, mut file, mut tree) = setup_tree();

        for n in (0..100u64).map(|i| i * 10) {
            tree.insert(&mut file, &key(n, 1)).unwrap();
        }

        let cursor = tree.seek(&mut file, &key(55, 0)).unwrap().unwrap();
        assert_eq!(tree.key_at(&mut file, &cursor).unwrap().bytes, 60u64.to_be_bytes());

        assert!(tree.seek(&mut file, &key(10_000, 0)).unwrap().is_none());
    }

    #[test]
    fn test_first_duplicate_protocol() {
        let (_tmp, mut file, mut tree) = setup_tree();

        tree.insert(&mut file, &key(1, 10)).unwrap();
        for addr in [30, 10, 50, 20, 40] {
            tree.insert(&mut file, &key(7, addr)).unwrap();
        }
        tree.insert(&mut file, &key(9, 10)).unwrap();

        let (cursor, found) = tree.find(&mut file, &key(7, 20)).unwrap();
        assert!(found);
        let first = tree.first_duplicate(&mut file, cursor.unwrap()).unwrap();
        let k = tree.key_at(&mut file, &first).unwrap();
        assert_eq!(k.bytes, 7u64.to_be_bytes());
        assert_eq!(k.addr, 10);
    }

    #[test]
    fn test_delete_leaf_and_not_found() {
        let (_tmp, mut file, mut tree) = setup_tree();

        tree.insert(&mut file, &key(1, 1)).unwrap();
        tree.insert(&mut file, &key(2, 2)).unwrap();

        assert!(tree.delete(&mut file, &key(1, 1)).unwrap());
        assert!(!tree.delete(&mut file, &key(1, 1)).unwrap());
        // address is part of the identity
        assert!(!tree.delete(&mut file, &key(2, 9)).unwrap());
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn test_delete_until_empty_frees_root() {
        let (_tmp, mut file, mut tree) = setup_tree();

        for n in 0..200u64 {
            tree.insert(&mut file, &key(n, 1)).unwrap();
        }
        for n in 0..200u64 {
            assert!(tree.delete(&mut file, &key(n, 1)).unwrap(), "key {}", n);
        }

        assert!(tree.is_empty());
        assert!(tree.first(&mut file).unwrap().is_none());
        assert!(file.free_list_len().unwrap() > 0);
    }

    #[test]
    fn test_random_insert_delete_keeps_order() {
        let (_tmp, mut file, mut tree) = setup_tree();

        let mut present = std::collections::BTreeSet::new();
        let mut state: u64 = 0x2545F491;
        let mut rand = || {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            state
        };

        for _ in 0..3000 {
            let n = rand() % 512;
            let k = key(n, 1);
            if present.contains(&n) {
                assert!(tree.delete(&mut file, &k).unwrap());
                present.remove(&n);
            } else {
                assert!(tree.insert(&mut file, &k).unwrap());
                present.insert(n);
            }
            assert_eq!(tree.len() as usize, present.len());
        }

        let keys = collect(&tree, &mut file);
        let expected: Vec<u64> = present.iter().copied().collect();
        assert_eq!(keys.len(), expected.len());
        for (k, n) in keys.iter().zip(expected.iter()) {
            assert_eq!(k.bytes, n.to_be_bytes());
        }
    }

    #[test]
    fn test_header_persists_across_reopen() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("test.idx");
        let header_addr;

        {
            let mut file = PagedFile::open(&path, true).unwrap();
            let header_node = file.new_node().unwrap();
            header_addr = PagedFile::node_data_addr(header_node);
            let mut tree = Btree::create(&mut file, header_addr, 2, KEY_LEN).unwrap();
            for n in 0..50u64 {
                tree.insert(&mut file, &key(n, n as u32 + 1)).unwrap();
            }
            tree.write_header(&mut file).unwrap();
            file.flush().unwrap();
        }

        let mut file = PagedFile::open(&path, false).unwrap();
        let tree = Btree::open(&mut file, header_addr).unwrap();
        assert_eq!(tree.index_no(), 2);
        assert_eq!(tree.key_len(), KEY_LEN);
        assert_eq!(tree.len(), 50);

        let keys = collect(&tree, &mut file);
        assert_eq!(keys.len(), 50);
        assert_eq!(keys[0].bytes, 0u64.to_be_bytes());
        assert_eq!(keys[49].bytes, 49u64.to_be_bytes());
    }

    #[test]
    fn test_key_too_long() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut file = PagedFile::open(temp_dir.path().join("t.idx"), true).unwrap();
        let node = file.new_node().unwrap();
        let result = Btree::create(&mut file, PagedFile::node_data_addr(node), 0, 400);
        assert!(matches!(result, Err(IndexError::KeyTooLong(400))));
    }

    #[test]
    fn test_contains_bytes_ignores_address() {
        let (_tmp, mut file, mut tree) = setup_tree();
        tree.insert(&mut file, &key(77, 1234)).unwrap();

        assert!(tree.contains_bytes(&mut file, &77u64.to_be_bytes()).unwrap());
        assert!(!tree.contains_bytes(&mut file, &78u64.to_be_bytes()).unwrap());
    }

    #[test]
    fn test_spec_encoding_matches_tree_width() {
        let spec = KeySpec::value(0, KEY_LEN);
        let encoded = spec.encode(&crate::index::KeyValue::Bytes(vec![1, 2, 3]));
        assert_eq!(encoded.bytes.len(), KEY_LEN);
    }
}
