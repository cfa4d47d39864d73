//! The object engine
//!
//! `Datastore` ties the pieces together: the two paged files, the class
//! registry, the per-index B-trees and the identity cache of live objects.
//! Mutations are tracked in memory and written out by the close-time flush;
//! every index change the flush performs mirrors one B-tree insert or
//! delete per affected key.

mod error;
mod object;
mod stream;

pub use error::{StoreError, StoreResult};
pub use object::{ObjRef, Persistent};
pub use stream::{OBJECT_HEADER_SIZE, ObjectHeader, ObjectReader, ObjectWriter};

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::rc::Rc;

use crate::catalog::{Catalog, ClassId};
use crate::file::{FileError, NodeNbr, ObjAddr, PagedFile};
use crate::index::{Key, KeyKind, KeySpec, KeyValue};

use object::{ObjectState, SharedObject, WeakObject};
use stream::{read_object_header, write_object_header};

/// One B-tree and the spec it serves, owned by the engine.
/// The list is ordered class-major, then by index number.
struct IndexEntry {
    class_id: ClassId,
    spec: KeySpec,
    tree: crate::index::Btree,
}

/// Identity-cache entry for one object address
struct LiveEntry {
    class_id: ClassId,
    state: ObjectState,
    /// Keys as they were at load/save time, used to diff index updates
    org_keys: Vec<Key>,
    object: WeakObject,
    /// Strong reference kept while the object has unflushed work, so the
    /// flush can reach it even after the application drops its handles
    pending: Option<SharedObject>,
}

/// Where a traversal stands
enum CursorPos {
    /// Indexed traversal: the key last returned
    Key(Key),
    /// Keyless scan: the node last returned (0 = before the first)
    Node(NodeNbr),
}

/// A traversal position over one class's index (or its data-file extent
/// for keyless classes). Cursors are values: obtain one from
/// `first_object`/`last_object` and re-present it to `next_object`/
/// `previous_object`. A cursor survives interleaved mutations by
/// remembering the last key rather than a tree position.
pub struct Cursor {
    class_id: ClassId,
    index_no: u16,
    pos: CursorPos,
}

/// An embeddable object datastore: `<base>.eds` holds object payloads,
/// `<base>.idx` holds the class registry and every index B-tree.
pub struct Datastore {
    data: PagedFile,
    index: PagedFile,
    catalog: Catalog,
    btrees: Vec<IndexEntry>,
    live: HashMap<ObjAddr, LiveEntry>,
    /// Flush processes objects in first-tracked order so that relational
    /// re-checks see earlier objects' indexes already written
    flush_order: Vec<ObjAddr>,
}

impl Datastore {
    /// Open or create the datastore at `<base>.eds` / `<base>.idx`
    pub fn open<P: AsRef<Path>>(base: P) -> StoreResult<Self> {
        let base = base.as_ref();
        let data = PagedFile::open(base.with_extension("eds"), true)?;
        let index = PagedFile::open(base.with_extension("idx"), true)?;
        Ok(Self {
            data,
            index,
            catalog: Catalog::new(),
            btrees: Vec::new(),
            live: HashMap::new(),
            flush_order: Vec::new(),
        })
    }

    /// Flush everything and end the session
    pub fn close(mut self) -> StoreResult<()> {
        self.flush()
    }

    // ========== Lifecycle operations ==========

    /// Stage a new object for insertion. Fails (returning `None`) when the
    /// primary key is already in use or a declared relationship does not
    /// hold. The object's first node is allocated immediately; payload and
    /// index entries are written by the flush.
    pub fn add_object<T: Persistent>(&mut self, obj: T) -> StoreResult<Option<ObjRef<T>>> {
        let class_id = self.ensure_class::<T>()?;
        let keys = self.encode_keys(class_id, &obj.key_values())?;
        if !self.test_relationships(class_id, 0, &keys)? {
            return Ok(None);
        }

        let addr = self.data.new_node()?;
        write_object_header(
            &mut self.data,
            addr,
            ObjectHeader {
                class_id,
                nd_nbr: 0,
            },
        )?;

        let shared: SharedObject = Rc::new(std::cell::RefCell::new(obj));
        self.track(addr, class_id, ObjectState::New, Vec::new(), &shared);
        Ok(Some(ObjRef::new(shared, addr)))
    }

    /// Flag a loaded object for rewrite at flush. Returns false (and stays
    /// clean) when a declared relationship no longer holds.
    pub fn change_object<T: Persistent>(&mut self, handle: &ObjRef<T>) -> StoreResult<bool> {
        let class_id = self.class_of::<T>(handle)?;
        let keys = self.encode_keys(class_id, &handle.borrow().key_values())?;
        if !self.test_relationships(class_id, handle.addr, &keys)? {
            return Ok(false);
        }

        let entry = self.live.get_mut(&handle.addr).ok_or(StoreError::NotLive)?;
        if entry.state == ObjectState::Clean {
            entry.state = ObjectState::Dirty;
        }
        entry.pending = Some(Rc::clone(&handle.object));
        Ok(true)
    }

    /// Flag an object for removal at flush. Refuses (returning false) when
    /// any other object still references it through a related-class index.
    pub fn delete_object<T: Persistent>(&mut self, handle: &ObjRef<T>) -> StoreResult<bool> {
        let class_id = self.class_of::<T>(handle)?;
        let keys = self.encode_keys(class_id, &handle.borrow().key_values())?;

        if let Some(primary) = keys.first() {
            if !primary.is_null() {
                let addr_bytes = handle.addr.to_be_bytes();
                for pos in 0..self.btrees.len() {
                    let entry = &self.btrees[pos];
                    if entry.spec.index_no == 0 {
                        continue;
                    }
                    if entry.spec.related_class != Some(T::class_name()) {
                        continue;
                    }
                    let referenced = match entry.spec.kind {
                        KeyKind::ObjectAddress => self.btrees[pos]
                            .tree
                            .contains_bytes(&mut self.index, &addr_bytes)?,
                        KeyKind::Value => self.btrees[pos]
                            .tree
                            .contains_bytes(&mut self.index, &primary.bytes)?,
                    };
                    if referenced {
                        return Ok(false);
                    }
                }
            }
        }

        let entry = self.live.get_mut(&handle.addr).ok_or(StoreError::NotLive)?;
        entry.state = ObjectState::Deleted;
        entry.pending = Some(Rc::clone(&handle.object));
        Ok(true)
    }

    // ========== Lookup and traversal ==========

    /// Point lookup through an index. Secondary lookups land on the first
    /// duplicate in address order.
    pub fn find_object<T: Persistent + Default>(
        &mut self,
        index_no: u16,
        value: &KeyValue,
    ) -> StoreResult<Option<ObjRef<T>>> {
        let class_id = self.ensure_class::<T>()?;
        let Some(pos) = self.index_pos(class_id, index_no) else {
            return Ok(None);
        };

        let probe = self.btrees[pos].spec.encode(value);
        if probe.is_null() {
            return Ok(None);
        }

        let tree = &self.btrees[pos].tree;
        let (cursor, found) = tree.find(&mut self.index, &probe)?;
        if !found {
            return Ok(None);
        }
        let mut cursor = cursor.expect("find returned a match");
        if index_no != 0 {
            cursor = tree.first_duplicate(&mut self.index, cursor)?;
        }
        let key = tree.key_at(&mut self.index, &cursor)?;

        self.materialize::<T>(class_id, key.addr).map(Some)
    }

    /// First object in index order (or data-file order for a keyless class)
    pub fn first_object<T: Persistent + Default>(
        &mut self,
        index_no: u16,
    ) -> StoreResult<Option<(ObjRef<T>, Cursor)>> {
        let class_id = self.ensure_class::<T>()?;
        if self.is_keyless(class_id) {
            return match self.scan_forward(class_id, 0)? {
                Some(addr) => {
                    let obj = self.materialize::<T>(class_id, addr)?;
                    Ok(Some((obj, self.node_cursor(class_id, addr))))
                }
                None => Ok(None),
            };
        }

        let Some(pos) = self.index_pos(class_id, index_no) else {
            return Ok(None);
        };
        let tree = &self.btrees[pos].tree;
        let Some(cursor) = tree.first(&mut self.index)? else {
            return Ok(None);
        };
        let key = tree.key_at(&mut self.index, &cursor)?;
        let obj = self.materialize::<T>(class_id, key.addr)?;
        Ok(Some((obj, self.key_cursor(class_id, index_no, key))))
    }

    /// Last object in index order (or data-file order for a keyless class)
    pub fn last_object<T: Persistent + Default>(
        &mut self,
        index_no: u16,
    ) -> StoreResult<Option<(ObjRef<T>, Cursor)>> {
        let class_id = self.ensure_class::<T>()?;
        if self.is_keyless(class_id) {
            return match self.scan_backward(class_id, 0)? {
                Some(addr) => {
                    let obj = self.materialize::<T>(class_id, addr)?;
                    Ok(Some((obj, self.node_cursor(class_id, addr))))
                }
                None => Ok(None),
            };
        }

        let Some(pos) = self.index_pos(class_id, index_no) else {
            return Ok(None);
        };
        let tree = &self.btrees[pos].tree;
        let Some(cursor) = tree.last(&mut self.index)? else {
            return Ok(None);
        };
        let key = tree.key_at(&mut self.index, &cursor)?;
        let obj = self.materialize::<T>(class_id, key.addr)?;
        Ok(Some((obj, self.key_cursor(class_id, index_no, key))))
    }

    /// Step the cursor forward; at the end the cursor stays put and `None`
    /// comes back
    pub fn next_object<T: Persistent + Default>(
        &mut self,
        cursor: &mut Cursor,
    ) -> StoreResult<Option<ObjRef<T>>> {
        self.check_cursor::<T>(cursor)?;
        match &cursor.pos {
            CursorPos::Key(key) => {
                let Some(pos) = self.index_pos(cursor.class_id, cursor.index_no) else {
                    return Ok(None);
                };
                let key = key.clone();
                match self.tree_after(pos, &key)? {
                    Some(next) => {
                        let obj = self.materialize::<T>(cursor.class_id, next.addr)?;
                        cursor.pos = CursorPos::Key(next);
                        Ok(Some(obj))
                    }
                    None => Ok(None),
                }
            }
            CursorPos::Node(nbr) => match self.scan_forward(cursor.class_id, *nbr)? {
                Some(addr) => {
                    let obj = self.materialize::<T>(cursor.class_id, addr)?;
                    cursor.pos = CursorPos::Node(addr);
                    Ok(Some(obj))
                }
                None => Ok(None),
            },
        }
    }

    /// Step the cursor backward; at the front the cursor stays put and
    /// `None` comes back
    pub fn previous_object<T: Persistent + Default>(
        &mut self,
        cursor: &mut Cursor,
    ) -> StoreResult<Option<ObjRef<T>>> {
        self.check_cursor::<T>(cursor)?;
        match &cursor.pos {
            CursorPos::Key(key) => {
                let Some(pos) = self.index_pos(cursor.class_id, cursor.index_no) else {
                    return Ok(None);
                };
                let key = key.clone();
                match self.tree_before(pos, &key)? {
                    Some(prev) => {
                        let obj = self.materialize::<T>(cursor.class_id, prev.addr)?;
                        cursor.pos = CursorPos::Key(prev);
                        Ok(Some(obj))
                    }
                    None => Ok(None),
                }
            }
            CursorPos::Node(nbr) => match self.scan_backward(cursor.class_id, *nbr)? {
                Some(addr) => {
                    let obj = self.materialize::<T>(cursor.class_id, addr)?;
                    cursor.pos = CursorPos::Node(addr);
                    Ok(Some(obj))
                }
                None => Ok(None),
            },
        }
    }

    /// Re-materialize the object under the cursor, if it still exists
    pub fn current_object<T: Persistent + Default>(
        &mut self,
        cursor: &Cursor,
    ) -> StoreResult<Option<ObjRef<T>>> {
        self.check_cursor::<T>(cursor)?;
        match &cursor.pos {
            CursorPos::Key(key) => {
                let Some(pos) = self.index_pos(cursor.class_id, cursor.index_no) else {
                    return Ok(None);
                };
                let key = key.clone();
                let tree = &self.btrees[pos].tree;
                let Some(found) = tree.seek(&mut self.index, &key)? else {
                    return Ok(None);
                };
                if tree.key_at(&mut self.index, &found)? != key {
                    return Ok(None);
                }
                self.materialize::<T>(cursor.class_id, key.addr).map(Some)
            }
            CursorPos::Node(nbr) => {
                if *nbr == 0 || *nbr > self.data.highest_node() || self.data.is_deleted(*nbr)? {
                    return Ok(None);
                }
                let header = read_object_header(&mut self.data, *nbr)?;
                if header.nd_nbr != 0 || header.class_id != cursor.class_id {
                    return Ok(None);
                }
                self.materialize::<T>(cursor.class_id, *nbr).map(Some)
            }
        }
    }

    // ========== Flush ==========

    /// Write out every pending object: payloads through the serializer and
    /// the matching index inserts/deletes, in first-tracked order. Clean
    /// objects are untouched. Both files are flushed at the end.
    pub fn flush(&mut self) -> StoreResult<()> {
        let order = self.flush_order.clone();
        let mut done = HashSet::new();
        for addr in order {
            if !done.insert(addr) {
                continue;
            }
            let Some(entry) = self.live.get(&addr) else {
                continue;
            };
            match entry.state {
                ObjectState::Clean => {}
                ObjectState::New => self.flush_new(addr)?,
                ObjectState::Dirty => self.flush_dirty(addr)?,
                ObjectState::Deleted => self.flush_deleted(addr)?,
            }
        }

        // prune entries nobody can reach any more
        self.live
            .retain(|_, entry| entry.object.strong_count() > 0 || entry.pending.is_some());
        let live = &self.live;
        self.flush_order.retain(|addr| live.contains_key(addr));

        for entry in &mut self.btrees {
            entry.tree.write_header(&mut self.index)?;
        }
        self.index.flush()?;
        self.data.flush()?;
        Ok(())
    }

    /// Key count of one index, as persisted in its header
    pub fn key_count<T: Persistent>(&mut self, index_no: u16) -> StoreResult<u32> {
        let class_id = self.ensure_class::<T>()?;
        Ok(self
            .index_pos(class_id, index_no)
            .map(|pos| self.btrees[pos].tree.len())
            .unwrap_or(0))
    }

    /// Highest node ever allocated in the data file
    pub fn data_highest_node(&self) -> NodeNbr {
        self.data.highest_node()
    }

    /// Current length of the data file's free list
    pub fn data_free_list_len(&mut self) -> StoreResult<usize> {
        Ok(self.data.free_list_len()?)
    }

    // ========== Registration and bookkeeping ==========

    fn ensure_class<T: Persistent>(&mut self) -> StoreResult<ClassId> {
        let name = T::class_name();
        if let Some(class_id) = self.catalog.class_id(name) {
            return Ok(class_id);
        }
        let (class_id, btrees) = self
            .catalog
            .register(&mut self.index, name, T::key_specs())?;
        let specs = self
            .catalog
            .get(name)
            .expect("class cached by register")
            .specs
            .clone();
        for (tree, spec) in btrees.into_iter().zip(specs) {
            self.btrees.push(IndexEntry {
                class_id,
                spec,
                tree,
            });
        }
        Ok(class_id)
    }

    fn class_of<T: Persistent>(&mut self, handle: &ObjRef<T>) -> StoreResult<ClassId> {
        let class_id = self.ensure_class::<T>()?;
        match self.live.get(&handle.addr) {
            Some(entry) if entry.class_id == class_id => Ok(class_id),
            Some(_) => Err(StoreError::ClassMismatch),
            None => Err(StoreError::NotLive),
        }
    }

    fn check_cursor<T: Persistent>(&mut self, cursor: &Cursor) -> StoreResult<()> {
        let class_id = self.ensure_class::<T>()?;
        if class_id != cursor.class_id {
            return Err(StoreError::ClassMismatch);
        }
        Ok(())
    }

    fn is_keyless(&self, class_id: ClassId) -> bool {
        self.catalog
            .by_id(class_id)
            .map(|cls| cls.specs.is_empty())
            .unwrap_or(true)
    }

    fn index_pos(&self, class_id: ClassId, index_no: u16) -> Option<usize> {
        self.btrees
            .iter()
            .position(|entry| entry.class_id == class_id && entry.spec.index_no == index_no)
    }

    fn specs_of(&self, class_id: ClassId) -> Vec<KeySpec> {
        self.catalog
            .by_id(class_id)
            .expect("class registered")
            .specs
            .clone()
    }

    fn encode_keys(&self, class_id: ClassId, values: &[KeyValue]) -> StoreResult<Vec<Key>> {
        let specs = &self
            .catalog
            .by_id(class_id)
            .expect("class registered")
            .specs;
        if specs.len() != values.len() {
            return Err(StoreError::KeyCountMismatch {
                declared: specs.len(),
                produced: values.len(),
            });
        }
        Ok(specs
            .iter()
            .zip(values)
            .map(|(spec, value)| spec.encode(value))
            .collect())
    }

    fn encoded_keys_of(
        &self,
        class_id: ClassId,
        object: &SharedObject,
        addr: ObjAddr,
    ) -> StoreResult<Vec<Key>> {
        let values = object.borrow().key_values();
        Ok(self
            .encode_keys(class_id, &values)?
            .into_iter()
            .map(|key| key.with_addr(addr))
            .collect())
    }

    fn track(
        &mut self,
        addr: ObjAddr,
        class_id: ClassId,
        state: ObjectState,
        org_keys: Vec<Key>,
        object: &SharedObject,
    ) {
        let pending = match state {
            ObjectState::Clean => None,
            _ => Some(Rc::clone(object)),
        };
        self.live.insert(
            addr,
            LiveEntry {
                class_id,
                state,
                org_keys,
                object: Rc::downgrade(object),
                pending,
            },
        );
        self.flush_order.push(addr);
    }

    fn key_cursor(&self, class_id: ClassId, index_no: u16, key: Key) -> Cursor {
        Cursor {
            class_id,
            index_no,
            pos: CursorPos::Key(key),
        }
    }

    fn node_cursor(&self, class_id: ClassId, nbr: NodeNbr) -> Cursor {
        Cursor {
            class_id,
            index_no: 0,
            pos: CursorPos::Node(nbr),
        }
    }

    // ========== Relational integrity ==========

    /// True when the object may be inserted or rewritten: an unsaved
    /// object's primary key is unused, every address reference points at a
    /// live head node of the related class, and every value-copied foreign
    /// key matches some primary key of the related class.
    fn test_relationships(
        &mut self,
        class_id: ClassId,
        addr: ObjAddr,
        keys: &[Key],
    ) -> StoreResult<bool> {
        let specs = self.specs_of(class_id);
        debug_assert_eq!(specs.len(), keys.len());
        if specs.is_empty() {
            return Ok(true);
        }

        if addr == 0 {
            if let Some(pos) = self.index_pos(class_id, specs[0].index_no) {
                let in_use = self.btrees[pos]
                    .tree
                    .contains_bytes(&mut self.index, &keys[0].bytes)?;
                if in_use {
                    return Ok(false);
                }
            }
        }

        for (spec, key) in specs.iter().zip(keys).skip(1) {
            let Some(related_name) = spec.related_class else {
                continue;
            };
            match spec.kind {
                KeyKind::ObjectAddress => {
                    if key.is_null() {
                        continue;
                    }
                    let target = u32::from_be_bytes([
                        key.bytes[0],
                        key.bytes[1],
                        key.bytes[2],
                        key.bytes[3],
                    ]);
                    let Some(related_id) = self.catalog.class_id(related_name) else {
                        return Ok(false);
                    };
                    if !self.is_object_of(target, related_id)? {
                        return Ok(false);
                    }
                }
                KeyKind::Value => {
                    if key.is_null() {
                        continue;
                    }
                    // only primary trees of classes seen this session can
                    // be consulted; an unregistered related class passes
                    let Some(related_id) = self.catalog.class_id(related_name) else {
                        continue;
                    };
                    let Some(pos) = self.index_pos(related_id, 0) else {
                        continue;
                    };
                    let exists = self.btrees[pos]
                        .tree
                        .contains_bytes(&mut self.index, &key.bytes)?;
                    if !exists {
                        return Ok(false);
                    }
                }
            }
        }
        Ok(true)
    }

    /// Does `target` head a live object of `class_id`?
    fn is_object_of(&mut self, target: ObjAddr, class_id: ClassId) -> StoreResult<bool> {
        if target == 0 || target > self.data.highest_node() {
            return Ok(false);
        }
        if self.data.is_deleted(target)? {
            return Ok(false);
        }
        let header = match read_object_header(&mut self.data, target) {
            Ok(header) => header,
            Err(StoreError::File(FileError::InvalidNode(_))) => return Ok(false),
            Err(err) => return Err(err),
        };
        Ok(header.nd_nbr == 0 && header.class_id == class_id)
    }

    // ========== Materialization ==========

    /// Read the object at `addr` and hand back the one shared instance for
    /// that address: the payload is read first, then the identity cache
    /// decides whether the fresh copy survives or an existing instance is
    /// handed out instead.
    fn materialize<T: Persistent + Default>(
        &mut self,
        class_id: ClassId,
        addr: ObjAddr,
    ) -> StoreResult<ObjRef<T>> {
        let mut obj = T::default();
        {
            let mut reader = ObjectReader::begin(&mut self.data, addr, class_id)?;
            obj.read(&mut reader)?;
        }

        if let Some(entry) = self.live.get(&addr) {
            if let Some(existing) = entry.object.upgrade() {
                if entry.class_id != class_id {
                    return Err(StoreError::ClassMismatch);
                }
                return Ok(ObjRef::new(existing, addr));
            }
        }

        let keys = self
            .encode_keys(class_id, &obj.key_values())?
            .into_iter()
            .map(|key| key.with_addr(addr))
            .collect();
        let shared: SharedObject = Rc::new(std::cell::RefCell::new(obj));
        self.track(addr, class_id, ObjectState::Clean, keys, &shared);
        Ok(ObjRef::new(shared, addr))
    }

    // ========== Flush paths ==========

    fn pending_object(&self, addr: ObjAddr) -> StoreResult<SharedObject> {
        let entry = self.live.get(&addr).ok_or(StoreError::NotLive)?;
        entry
            .pending
            .clone()
            .or_else(|| entry.object.upgrade())
            .ok_or(StoreError::NotLive)
    }

    fn flush_new(&mut self, addr: ObjAddr) -> StoreResult<()> {
        let class_id = self.live[&addr].class_id;
        let object = self.pending_object(addr)?;
        let keys = self.encoded_keys_of(class_id, &object, addr)?;

        // the relational picture may have changed since add_object, and a
        // primary key staged earlier this session may have claimed the
        // slot; re-checking with an unsaved address covers both, and a
        // failed re-check drops the staged object and its node
        if !self.test_relationships(class_id, 0, &keys)? {
            self.data.mark_deleted(addr)?;
            self.live.remove(&addr);
            return Ok(());
        }

        self.add_indexes(class_id, &keys)?;
        self.write_payload(addr, class_id, &object)?;

        let entry = self.live.get_mut(&addr).expect("entry checked above");
        entry.org_keys = keys;
        entry.state = ObjectState::Clean;
        entry.pending = None;
        Ok(())
    }

    fn flush_dirty(&mut self, addr: ObjAddr) -> StoreResult<()> {
        let class_id = self.live[&addr].class_id;
        let object = self.pending_object(addr)?;
        let keys = self.encoded_keys_of(class_id, &object, addr)?;

        self.write_payload(addr, class_id, &object)?;
        self.update_indexes(class_id, addr, &keys)?;

        let entry = self.live.get_mut(&addr).expect("entry checked above");
        entry.org_keys = keys;
        entry.state = ObjectState::Clean;
        entry.pending = None;
        Ok(())
    }

    fn flush_deleted(&mut self, addr: ObjAddr) -> StoreResult<()> {
        let class_id = self.live[&addr].class_id;

        // release the whole chain
        let mut nbr = addr;
        while nbr != 0 {
            let next = self.data.next_node(nbr)?;
            self.data.mark_deleted(nbr)?;
            nbr = next;
        }

        let org_keys = self.live[&addr].org_keys.clone();
        self.delete_indexes(class_id, &org_keys)?;
        self.live.remove(&addr);
        Ok(())
    }

    fn write_payload(
        &mut self,
        addr: ObjAddr,
        class_id: ClassId,
        object: &SharedObject,
    ) -> StoreResult<()> {
        let mut writer = ObjectWriter::begin(&mut self.data, addr, class_id)?;
        object.borrow().write_payload(&mut writer)?;
        writer.finish()
    }

    // ========== Index maintenance ==========

    fn add_indexes(&mut self, class_id: ClassId, keys: &[Key]) -> StoreResult<()> {
        let specs = self.specs_of(class_id);
        for (spec, key) in specs.iter().zip(keys) {
            if key.is_null() {
                continue;
            }
            if let Some(pos) = self.index_pos(class_id, spec.index_no) {
                self.btrees[pos].tree.insert(&mut self.index, key)?;
            }
        }
        Ok(())
    }

    /// Pairwise diff against the org-key snapshot: delete the old entry,
    /// insert the new one, only where the key actually changed
    fn update_indexes(&mut self, class_id: ClassId, addr: ObjAddr, keys: &[Key]) -> StoreResult<()> {
        let specs = self.specs_of(class_id);
        let org_keys = self.live[&addr].org_keys.clone();
        if org_keys.len() != keys.len() {
            return Err(StoreError::KeyCountMismatch {
                declared: org_keys.len(),
                produced: keys.len(),
            });
        }

        for ((spec, org), key) in specs.iter().zip(&org_keys).zip(keys) {
            if org == key {
                continue;
            }
            let Some(pos) = self.index_pos(class_id, spec.index_no) else {
                continue;
            };
            if !org.is_null() {
                self.btrees[pos].tree.delete(&mut self.index, org)?;
            }
            if !key.is_null() {
                self.btrees[pos].tree.insert(&mut self.index, key)?;
            }
        }
        Ok(())
    }

    fn delete_indexes(&mut self, class_id: ClassId, org_keys: &[Key]) -> StoreResult<()> {
        let specs = self.specs_of(class_id);
        for (spec, key) in specs.iter().zip(org_keys) {
            if key.is_null() {
                continue;
            }
            if let Some(pos) = self.index_pos(class_id, spec.index_no) {
                self.btrees[pos].tree.delete(&mut self.index, key)?;
            }
        }
        Ok(())
    }

    // ========== Traversal internals ==========

    /// First key strictly after `key` in tree order
    fn tree_after(&mut self, pos: usize, key: &Key) -> StoreResult<Option<Key>> {
        let tree = &self.btrees[pos].tree;
        let Some(cursor) = tree.seek(&mut self.index, key)? else {
            return Ok(None);
        };
        let at = tree.key_at(&mut self.index, &cursor)?;
        if at != *key {
            return Ok(Some(at));
        }
        match tree.next(&mut self.index, &cursor)? {
            Some(next) => Ok(Some(tree.key_at(&mut self.index, &next)?)),
            None => Ok(None),
        }
    }

    /// Last key strictly before `key` in tree order
    fn tree_before(&mut self, pos: usize, key: &Key) -> StoreResult<Option<Key>> {
        let tree = &self.btrees[pos].tree;
        match tree.seek(&mut self.index, key)? {
            Some(cursor) => match tree.previous(&mut self.index, &cursor)? {
                Some(prev) => Ok(Some(tree.key_at(&mut self.index, &prev)?)),
                None => Ok(None),
            },
            // everything sorts before the probe
            None => match tree.last(&mut self.index)? {
                Some(last) => Ok(Some(tree.key_at(&mut self.index, &last)?)),
                None => Ok(None),
            },
        }
    }

    /// Next live head node of this class after `from`
    fn scan_forward(&mut self, class_id: ClassId, from: NodeNbr) -> StoreResult<Option<ObjAddr>> {
        let mut nbr = from + 1;
        while nbr <= self.data.highest_node() {
            if !self.data.is_deleted(nbr)? {
                let header = read_object_header(&mut self.data, nbr)?;
                if header.nd_nbr == 0 && header.class_id == class_id {
                    return Ok(Some(nbr));
                }
            }
            nbr += 1;
        }
        Ok(None)
    }

    /// Previous live head node of this class before `from` (0 = from the end)
    fn scan_backward(&mut self, class_id: ClassId, from: NodeNbr) -> StoreResult<Option<ObjAddr>> {
        let mut nbr = if from == 0 {
            self.data.highest_node() + 1
        } else {
            from
        };
        while nbr > 1 {
            nbr -= 1;
            if !self.data.is_deleted(nbr)? {
                let header = read_object_header(&mut self.data, nbr)?;
                if header.nd_nbr == 0 && header.class_id == class_id {
                    return Ok(Some(nbr));
                }
            }
        }
        Ok(None)
    }
}

impl Drop for Datastore {
    fn drop(&mut self) {
        // the close-time flush is mandatory; close() reports errors,
        // dropping does its best
        let _ = self.flush();
    }
}
