use lru::LruCache;
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

use super::error::{FileError, FileResult};
use super::node::Node;
use super::{NODE_SIZE, PAGE_CACHE_SIZE, NodeNbr};

/// Magic number for datastore files: "EDS\0"
pub const MAGIC: u32 = 0x45445300;

/// Current file format version
pub const VERSION: u32 = 1;

/// Bytes of node 0 occupied by the file header
const HEADER_BYTES: usize = 20;

/// One cached node image
struct Frame {
    data: Vec<u8>,
    dirty: bool,
}

/// A file organized as fixed-size nodes with a header node, an allocator
/// and a free list threaded through the node headers of deleted nodes.
///
/// Node 0 holds the file header (magic, version, node size, highest node,
/// free-list head) and is never handed out. All other node I/O goes through
/// a write-back LRU page cache; eviction writes dirty frames out, `flush`
/// writes everything and syncs.
pub struct PagedFile {
    file: std::fs::File,
    path: PathBuf,
    cache: LruCache<NodeNbr, Frame>,
    highest: NodeNbr,
    free_head: NodeNbr,
    header_dirty: bool,
}

impl PagedFile {
    /// Open or create a paged file
    pub fn open<P: AsRef<Path>>(path: P, create_if_missing: bool) -> FileResult<Self> {
        let path = path.as_ref().to_path_buf();
        if !create_if_missing && !path.exists() {
            return Err(FileError::FileNotFound(path.display().to_string()));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(create_if_missing)
            .open(&path)?;
        let file_len = file.metadata()?.len();

        let mut paged = Self {
            file,
            path,
            cache: LruCache::new(NonZeroUsize::new(PAGE_CACHE_SIZE).unwrap()),
            highest: 0,
            free_head: 0,
            header_dirty: false,
        };

        if file_len >= HEADER_BYTES as u64 {
            paged.read_header()?;
        } else {
            // freshly created: stamp the header right away
            paged.header_dirty = true;
            paged.write_header()?;
        }

        Ok(paged)
    }

    /// Path this file was opened at
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// True until the first node is allocated; a new file has no content
    /// beyond the header node
    pub fn is_new_file(&self) -> bool {
        self.highest == 0
    }

    /// Largest node number ever allocated; never decreases
    pub fn highest_node(&self) -> NodeNbr {
        self.highest
    }

    /// Allocate a node: pops the free list if possible, otherwise appends.
    /// The returned node has a zeroed payload and no next pointer.
    pub fn new_node(&mut self) -> FileResult<NodeNbr> {
        let nbr = if self.free_head != 0 {
            let nbr = self.free_head;
            self.ensure_cached(nbr)?;
            let frame = self.cache.get_mut(&nbr).unwrap();
            let next_free = Node::from_buffer(&mut frame.data).next_node();
            frame.data.fill(0);
            frame.dirty = true;
            self.free_head = next_free;
            nbr
        } else {
            self.highest += 1;
            let nbr = self.highest;
            self.install_frame(
                nbr,
                Frame {
                    data: vec![0u8; NODE_SIZE],
                    dirty: true,
                },
            )?;
            nbr
        };
        self.header_dirty = true;
        Ok(nbr)
    }

    /// Set the deleted bit and push the node onto the free list
    pub fn mark_deleted(&mut self, nbr: NodeNbr) -> FileResult<()> {
        let free_head = self.free_head;
        let buffer = self.page_mut(nbr)?;
        let mut node = Node::from_buffer(buffer);
        node.set_deleted(true);
        node.set_next_node(free_head);
        self.free_head = nbr;
        self.header_dirty = true;
        Ok(())
    }

    /// Number of nodes currently on the free list
    pub fn free_list_len(&mut self) -> FileResult<usize> {
        let mut count = 0;
        let mut nbr = self.free_head;
        while nbr != 0 {
            count += 1;
            if count > self.highest as usize {
                return Err(FileError::FreeListCycle(nbr));
            }
            nbr = self.next_node(nbr)?;
        }
        Ok(count)
    }

    /// Read access to a node's full buffer
    pub fn page(&mut self, nbr: NodeNbr) -> FileResult<&[u8]> {
        self.ensure_cached(nbr)?;
        Ok(&self.cache.get(&nbr).unwrap().data)
    }

    /// Write access to a node's full buffer; marks the frame dirty
    pub fn page_mut(&mut self, nbr: NodeNbr) -> FileResult<&mut [u8]> {
        self.ensure_cached(nbr)?;
        let frame = self.cache.get_mut(&nbr).unwrap();
        frame.dirty = true;
        Ok(&mut frame.data)
    }

    /// Chain pointer of a node (0 = none)
    pub fn next_node(&mut self, nbr: NodeNbr) -> FileResult<NodeNbr> {
        let buffer = self.page(nbr)?;
        let mut copy = [0u8; 4];
        copy.copy_from_slice(&buffer[0..4]);
        Ok(u32::from_le_bytes(copy))
    }

    pub fn set_next_node(&mut self, nbr: NodeNbr, next: NodeNbr) -> FileResult<()> {
        let buffer = self.page_mut(nbr)?;
        Node::from_buffer(buffer).set_next_node(next);
        Ok(())
    }

    pub fn is_deleted(&mut self, nbr: NodeNbr) -> FileResult<bool> {
        let buffer = self.page(nbr)?;
        Ok(super::node::is_buffer_deleted(buffer))
    }

    /// Byte offset of a node's payload in the file
    pub fn node_data_addr(nbr: NodeNbr) -> u64 {
        nbr as u64 * NODE_SIZE as u64 + super::NODE_HEADER_SIZE as u64
    }

    /// Read bytes at a raw file offset; must not cross a node boundary
    pub fn read_at(&mut self, addr: u64, buf: &mut [u8]) -> FileResult<()> {
        let (nbr, offset) = Self::locate(addr, buf.len())?;
        let page = self.page(nbr)?;
        buf.copy_from_slice(&page[offset..offset + buf.len()]);
        Ok(())
    }

    /// Write bytes at a raw file offset; must not cross a node boundary
    pub fn write_at(&mut self, addr: u64, data: &[u8]) -> FileResult<()> {
        let (nbr, offset) = Self::locate(addr, data.len())?;
        let page = self.page_mut(nbr)?;
        page[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Write all dirty frames and the header, then sync to disk
    pub fn flush(&mut self) -> FileResult<()> {
        let file = &mut self.file;
        for (&nbr, frame) in self.cache.iter_mut() {
            if frame.dirty {
                file.seek(SeekFrom::Start(nbr as u64 * NODE_SIZE as u64))?;
                file.write_all(&frame.data)?;
                frame.dirty = false;
            }
        }
        if self.header_dirty {
            self.write_header()?;
        }
        self.file.sync_data()?;
        Ok(())
    }

    // ========== Internals ==========

    fn locate(addr: u64, len: usize) -> FileResult<(NodeNbr, usize)> {
        let nbr = (addr / NODE_SIZE as u64) as NodeNbr;
        let offset = (addr % NODE_SIZE as u64) as usize;
        if nbr == 0 || offset + len > NODE_SIZE {
            return Err(FileError::InvalidNode(nbr));
        }
        Ok((nbr, offset))
    }

    fn ensure_cached(&mut self, nbr: NodeNbr) -> FileResult<()> {
        if nbr == 0 || nbr > self.highest {
            return Err(FileError::InvalidNode(nbr));
        }
        if self.cache.contains(&nbr) {
            return Ok(());
        }

        let mut data = vec![0u8; NODE_SIZE];
        self.file
            .seek(SeekFrom::Start(nbr as u64 * NODE_SIZE as u64))?;
        let bytes_read = self.file.read(&mut data)?;
        // a node past the physical end of file reads back as zeros
        if bytes_read < NODE_SIZE {
            data[bytes_read..].fill(0);
        }

        self.install_frame(nbr, Frame { data, dirty: false })
    }

    fn install_frame(&mut self, nbr: NodeNbr, frame: Frame) -> FileResult<()> {
        if let Some((evicted, old)) = self.cache.push(nbr, frame) {
            if evicted != nbr && old.dirty {
                self.file
                    .seek(SeekFrom::Start(evicted as u64 * NODE_SIZE as u64))?;
                self.file.write_all(&old.data)?;
            }
        }
        Ok(())
    }

    fn read_header(&mut self) -> FileResult<()> {
        let mut buf = [0u8; HEADER_BYTES];
        self.file.seek(SeekFrom::Start(0))?;
        self.file.read_exact(&mut buf)?;

        let magic = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if magic != MAGIC {
            return Err(FileError::BadMagic);
        }
        let version = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
        if version != VERSION {
            return Err(FileError::UnsupportedVersion(version));
        }
        let node_size = u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]);
        if node_size != NODE_SIZE as u32 {
            return Err(FileError::NodeSizeMismatch {
                stored: node_size,
                expected: NODE_SIZE as u32,
            });
        }
        self.highest = u32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]]);
        self.free_head = u32::from_le_bytes([buf[16], buf[17], buf[18], buf[19]]);
        Ok(())
    }

    fn write_header(&mut self) -> FileResult<()> {
        let mut buf = [0u8; HEADER_BYTES];
        buf[0..4].copy_from_slice(&MAGIC.to_le_bytes());
        buf[4..8].copy_from_slice(&VERSION.to_le_bytes());
        buf[8..12].copy_from_slice(&(NODE_SIZE as u32).to_le_bytes());
        buf[12..16].copy_from_slice(&self.highest.to_le_bytes());
        buf[16..20].copy_from_slice(&self.free_head.to_le_bytes());

        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&buf)?;
        self.header_dirty = false;
        Ok(())
    }
}

impl Drop for PagedFile {
    fn drop(&mut self) {
        // best effort; callers wanting the error use flush() directly
        let _ = self.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::NODE_HEADER_SIZE;
    use tempfile::TempDir;

    fn setup_test_dir() -> TempDir {
        tempfile::tempdir().unwrap()
    }

    #[test]
    fn test_create_and_reopen() {
        let temp_dir = setup_test_dir();
        let path = temp_dir.path().join("test.eds");

        {
            let mut file = PagedFile::open(&path, true).unwrap();
            assert!(file.is_new_file());
            assert_eq!(file.new_node().unwrap(), 1);
            assert_eq!(file.new_node().unwrap(), 2);
            assert!(!file.is_new_file());
            file.flush().unwrap();
        }

        let file = PagedFile::open(&path, false).unwrap();
        assert!(!file.is_new_file());
        assert_eq!(file.highest_node(), 2);
    }

    #[test]
    fn test_open_missing_file() {
        let temp_dir = setup_test_dir();
        let path = temp_dir.path().join("missing.eds");

        let result = PagedFile::open(&path, false);
        assert!(matches!(result, Err(FileError::FileNotFound(_))));
    }

    #[test]
    fn test_bad_magic() {
        let temp_dir = setup_test_dir();
        let path = temp_dir.path().join("garbage.eds");
        std::fs::write(&path, vec![0xFFu8; 64]).unwrap();

        let result = PagedFile::open(&path, false);
        assert!(matches!(result, Err(FileError::BadMagic)));
    }

    #[test]
    fn test_page_round_trip() {
        let temp_dir = setup_test_dir();
        let path = temp_dir.path().join("test.eds");

        {
            let mut file = PagedFile::open(&path, true).unwrap();
            let nbr = file.new_node().unwrap();
            file.page_mut(nbr).unwrap()[NODE_HEADER_SIZE] = 0x5A;
            file.flush().unwrap();
        }

        let mut file = PagedFile::open(&path, false).unwrap();
        assert_eq!(file.page(1).unwrap()[NODE_HEADER_SIZE], 0x5A);
    }

    #[test]
    fn test_free_list_reuse() {
        let temp_dir = setup_test_dir();
        let path = temp_dir.path().join("test.eds");
        let mut file = PagedFile::open(&path, true).unwrap();

        let a = file.new_node().unwrap();
        let b = file.new_node().unwrap();
        let c = file.new_node().unwrap();
        assert_eq!((a, b, c), (1, 2, 3));

        file.mark_deleted(b).unwrap();
        file.mark_deleted(a).unwrap();
        assert_eq!(file.free_list_len().unwrap(), 2);

        // LIFO reuse, payload comes back zeroed
        file.page_mut(a).unwrap()[NODE_HEADER_SIZE + 1] = 0x77;
        let reused = file.new_node().unwrap();
        assert_eq!(reused, a);
        assert!(file.page(reused).unwrap().iter().all(|&b| b == 0));
        assert_eq!(file.free_list_len().unwrap(), 1);

        // highest never decreases
        assert_eq!(file.highest_node(), 3);
        assert_eq!(file.new_node().unwrap(), b);
        assert_eq!(file.new_node().unwrap(), 4);
        assert_eq!(file.highest_node(), 4);
    }

    #[test]
    fn test_deleted_flag_cleared_on_reuse() {
        let temp_dir = setup_test_dir();
        let path = temp_dir.path().join("test.eds");
        let mut file = PagedFile::open(&path, true).unwrap();

        let a = file.new_node().unwrap();
        file.mark_deleted(a).unwrap();
        assert!(file.is_deleted(a).unwrap());

        let reused = file.new_node().unwrap();
        assert_eq!(reused, a);
        assert!(!file.is_deleted(a).unwrap());
        assert_eq!(file.next_node(a).unwrap(), 0);
    }

    #[test]
    fn test_chain_pointers() {
        let temp_dir = setup_test_dir();
        let path = temp_dir.path().join("test.eds");
        let mut file = PagedFile::open(&path, true).unwrap();

        let a = file.new_node().unwrap();
        let b = file.new_node().unwrap();
        file.set_next_node(a, b).unwrap();
        assert_eq!(file.next_node(a).unwrap(), b);
        assert_eq!(file.next_node(b).unwrap(), 0);
    }

    #[test]
    fn test_read_write_at() {
        let temp_dir = setup_test_dir();
        let path = temp_dir.path().join("test.eds");
        let mut file = PagedFile::open(&path, true).unwrap();

        let nbr = file.new_node().unwrap();
        let addr = PagedFile::node_data_addr(nbr) + 10;
        file.write_at(addr, b"hello").unwrap();

        let mut buf = [0u8; 5];
        file.read_at(addr, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn test_invalid_node_access() {
        let temp_dir = setup_test_dir();
        let path = temp_dir.path().join("test.eds");
        let mut file = PagedFile::open(&path, true).unwrap();

        assert!(matches!(file.page(0), Err(FileError::InvalidNode(0))));
        assert!(matches!(file.page(5), Err(FileError::InvalidNode(5))));
    }

    #[test]
    fn test_survives_cache_pressure() {
        let temp_dir = setup_test_dir();
        let path = temp_dir.path().join("test.eds");
        let mut file = PagedFile::open(&path, true).unwrap();

        let count = (PAGE_CACHE_SIZE * 2) as u32;
        for i in 0..count {
            let nbr = file.new_node().unwrap();
            file.page_mut(nbr).unwrap()[NODE_HEADER_SIZE] = (i % 251) as u8;
        }
        for i in 0..count {
            let nbr = i + 1;
            assert_eq!(file.page(nbr).unwrap()[NODE_HEADER_SIZE], (i % 251) as u8);
        }
    }
}
