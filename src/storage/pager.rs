use std::collections::{BTreeSet, HashMap};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use fs2::FileExt;

use crate::common::{CannonError, DbConfig, PageId, Result, FREE_LIST_END};

/// File magic, first 8 bytes of page 0.
pub const MAGIC: &[u8; 8] = b"CANNONDB";

/// On-disk format version.
pub const FORMAT_VERSION: u32 = 1;

/// Serialized header length. The remainder of page 0 is reserved zero.
pub const HEADER_SIZE: usize = 36;

/// Fixed metadata at the start of page 0. All integers big-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    pub version: u32,
    pub page_size: u32,
    pub max_key_size: u32,
    pub max_value_size: u32,
    pub root_page: u32,
    pub free_head: u32,
    pub high_water: u32,
}

impl FileHeader {
    fn from_config(config: &DbConfig) -> Self {
        Self {
            version: FORMAT_VERSION,
            page_size: config.page_size,
            max_key_size: config.max_key_size,
            max_value_size: config.max_value_size,
            root_page: 0,
            free_head: FREE_LIST_END,
            high_water: 0,
        }
    }

    fn serialize(&self, out: &mut [u8]) {
        out[0..8].copy_from_slice(MAGIC);
        out[8..12].copy_from_slice(&self.version.to_be_bytes());
        out[12..16].copy_from_slice(&self.page_size.to_be_bytes());
        out[16..20].copy_from_slice(&self.max_key_size.to_be_bytes());
        out[20..24].copy_from_slice(&self.max_value_size.to_be_bytes());
        out[24..28].copy_from_slice(&self.root_page.to_be_bytes());
        out[28..32].copy_from_slice(&self.free_head.to_be_bytes());
        out[32..36].copy_from_slice(&self.high_water.to_be_bytes());
    }

    fn deserialize(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(CannonError::IncompatibleFile(
                "file too short for header".to_string(),
            ));
        }
        if &data[0..8] != MAGIC {
            return Err(CannonError::IncompatibleFile("bad magic".to_string()));
        }
        let word = |at: usize| u32::from_be_bytes(data[at..at + 4].try_into().unwrap());
        let header = Self {
            version: word(8),
            page_size: word(12),
            max_key_size: word(16),
            max_value_size: word(20),
            root_page: word(24),
            free_head: word(28),
            high_water: word(32),
        };
        if header.version != FORMAT_VERSION {
            return Err(CannonError::IncompatibleFile(format!(
                "format version {} (expected {})",
                header.version, FORMAT_VERSION
            )));
        }
        Ok(header)
    }
}

/// Byte-addressable storage behind the pager: the database file, or a
/// growable buffer for in-memory mode.
enum Backing {
    File(File),
    Memory(Vec<u8>),
}

impl Backing {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        match self {
            Backing::File(file) => {
                file.seek(SeekFrom::Start(offset))?;
                let mut filled = 0;
                while filled < buf.len() {
                    match file.read(&mut buf[filled..])? {
                        0 => break,
                        n => filled += n,
                    }
                }
                // Reads past the current end of file yield zeroes; the file
                // is extended lazily on write.
                buf[filled..].fill(0);
                Ok(())
            }
            Backing::Memory(bytes) => {
                let start = (offset as usize).min(bytes.len());
                let end = (offset as usize + buf.len()).min(bytes.len());
                let available = end - start;
                buf[..available].copy_from_slice(&bytes[start..end]);
                buf[available..].fill(0);
                Ok(())
            }
        }
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        match self {
            Backing::File(file) => {
                file.seek(SeekFrom::Start(offset))?;
                file.write_all(data)?;
                Ok(())
            }
            Backing::Memory(bytes) => {
                let end = offset as usize + data.len();
                if bytes.len() < end {
                    bytes.resize(end, 0);
                }
                bytes[offset as usize..end].copy_from_slice(data);
                Ok(())
            }
        }
    }

    fn sync(&mut self) -> Result<()> {
        match self {
            Backing::File(file) => {
                file.sync_all()?;
                Ok(())
            }
            Backing::Memory(_) => Ok(()),
        }
    }
}

/// Pager owns the main database file: page-granular I/O, the free-page
/// list, and the file header.
///
/// `write_page` carries no implicit sync; durability is the commit and
/// checkpoint machinery's concern. The free list is a chain threaded
/// through the first 4 bytes of free page bodies with only its head in the
/// header; list manipulations are journaled implicitly because the pages
/// they touch go through the normal commit pathway.
pub struct Pager {
    backing: Backing,
    header: FileHeader,
    header_dirty: bool,
    /// Next-pointers for pages freed by this handle. The on-disk bytes of
    /// such a page are stale until the next checkpoint, so allocation must
    /// consult this map before falling back to the file.
    free_links: HashMap<u32, u32>,
    /// Pages freed since the last commit, pending journaling.
    freed_since_commit: BTreeSet<u32>,
}

impl Pager {
    /// Opens or creates the database file. A fresh file gets a header
    /// built from `config` and synced immediately; an existing file must
    /// match the configured page size and carry valid magic and version.
    /// An exclusive advisory lock guards against a second handle.
    pub fn open<P: AsRef<Path>>(path: P, config: &DbConfig) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.as_ref())?;

        file.try_lock_exclusive().map_err(|e| {
            if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() {
                CannonError::AlreadyOpen
            } else {
                CannonError::Io(e)
            }
        })?;

        let file_len = file.metadata()?.len();
        if file_len == 0 {
            let header = FileHeader::from_config(config);
            let mut pager = Self {
                backing: Backing::File(file),
                header,
                header_dirty: false,
                free_links: HashMap::new(),
                freed_since_commit: BTreeSet::new(),
            };
            let image = pager.header_image();
            pager.backing.write_at(0, &image)?;
            pager.backing.sync()?;
            Ok(pager)
        } else {
            let mut raw = [0u8; HEADER_SIZE];
            file.seek(SeekFrom::Start(0))?;
            file.read_exact(&mut raw).map_err(|_| {
                CannonError::IncompatibleFile("file too short for header".to_string())
            })?;
            let header = FileHeader::deserialize(&raw)?;
            if header.page_size != config.page_size {
                return Err(CannonError::IncompatibleFile(format!(
                    "page size {} on disk, {} configured",
                    header.page_size, config.page_size
                )));
            }
            Ok(Self {
                backing: Backing::File(file),
                header,
                header_dirty: false,
                free_links: HashMap::new(),
                freed_since_commit: BTreeSet::new(),
            })
        }
    }

    /// Creates a pager over a growable in-memory buffer. No locking, and
    /// `fsync` is a no-op.
    pub fn in_memory(config: &DbConfig) -> Self {
        let header = FileHeader::from_config(config);
        let mut buffer = vec![0u8; config.page_size as usize];
        header.serialize(&mut buffer[..HEADER_SIZE]);
        Self {
            backing: Backing::Memory(buffer),
            header,
            header_dirty: false,
            free_links: HashMap::new(),
            freed_since_commit: BTreeSet::new(),
        }
    }

    pub fn page_size(&self) -> u32 {
        self.header.page_size
    }

    pub fn max_key_size(&self) -> u32 {
        self.header.max_key_size
    }

    pub fn max_value_size(&self) -> u32 {
        self.header.max_value_size
    }

    pub fn root_page(&self) -> PageId {
        PageId::new(self.header.root_page)
    }

    pub fn set_root_page(&mut self, root: PageId) {
        if self.header.root_page != root.as_u32() {
            self.header.root_page = root.as_u32();
            self.header_dirty = true;
        }
    }

    pub fn high_water(&self) -> u32 {
        self.header.high_water
    }

    pub fn free_head(&self) -> u32 {
        self.header.free_head
    }

    pub fn header_dirty(&self) -> bool {
        self.header_dirty
    }

    pub fn clear_header_dirty(&mut self) {
        self.header_dirty = false;
    }

    /// Reads one page. Exactly one positioned read of page size.
    pub fn read_page(&mut self, page: PageId) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.header.page_size as usize];
        let offset = page.as_u64() * self.header.page_size as u64;
        self.backing.read_at(offset, &mut buf)?;
        Ok(buf)
    }

    /// Writes one page. Exactly one positioned write, no implicit sync.
    pub fn write_page(&mut self, page: PageId, data: &[u8]) -> Result<()> {
        assert_eq!(
            data.len(),
            self.header.page_size as usize,
            "buffer must be page size"
        );
        let offset = page.as_u64() * self.header.page_size as u64;
        self.backing.write_at(offset, data)
    }

    /// Allocates a page: pops the free-list head if there is one, else
    /// bumps the high-water mark (the file grows lazily on first write).
    pub fn allocate(&mut self) -> Result<PageId> {
        if self.header.free_head != FREE_LIST_END {
            let page = self.header.free_head;
            let next = match self.free_links.remove(&page) {
                Some(next) => next,
                None => {
                    let data = self.read_page(PageId::new(page))?;
                    u32::from_be_bytes(data[0..4].try_into().unwrap())
                }
            };
            self.freed_since_commit.remove(&page);
            self.header.free_head = next;
            self.header_dirty = true;
            Ok(PageId::new(page))
        } else {
            self.header.high_water += 1;
            self.header_dirty = true;
            Ok(PageId::new(self.header.high_water))
        }
    }

    /// Returns a page to the free list by pushing it on the head.
    pub fn free(&mut self, page: PageId) {
        let n = page.as_u32();
        debug_assert_ne!(n, 0, "page 0 is the header");
        self.free_links.insert(n, self.header.free_head);
        self.freed_since_commit.insert(n);
        self.header.free_head = n;
        self.header_dirty = true;
    }

    /// Next pointer for a page freed by this handle, if known in memory.
    pub fn free_link(&self, page: u32) -> Option<u32> {
        self.free_links.get(&page).copied()
    }

    /// Page images for everything freed since the last commit, ascending,
    /// ready to be journaled. Clears the pending set.
    pub fn drain_freed_images(&mut self) -> Vec<(PageId, Vec<u8>)> {
        let freed = std::mem::take(&mut self.freed_since_commit);
        freed
            .into_iter()
            .map(|n| {
                let mut image = vec![0u8; self.header.page_size as usize];
                let next = self.free_links[&n];
                image[0..4].copy_from_slice(&next.to_be_bytes());
                (PageId::new(n), image)
            })
            .collect()
    }

    /// Full page-0 image with the current header state.
    pub fn header_image(&self) -> Vec<u8> {
        let mut image = vec![0u8; self.header.page_size as usize];
        self.header.serialize(&mut image[..HEADER_SIZE]);
        image
    }

    /// Re-reads the header from the backing, discarding the in-memory
    /// copy. Used after WAL recovery has replayed page 0.
    pub fn reload_header(&mut self) -> Result<()> {
        let mut raw = [0u8; HEADER_SIZE];
        self.backing.read_at(0, &mut raw)?;
        self.header = FileHeader::deserialize(&raw)?;
        self.header_dirty = false;
        Ok(())
    }

    /// Durable barrier on the backing.
    pub fn fsync(&mut self) -> Result<()> {
        self.backing.sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::config::DbConfig;

    fn small_config() -> DbConfig {
        DbConfig {
            page_size: 512,
            ..Default::default()
        }
    }

    #[test]
    fn test_fresh_file_gets_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fresh.db");
        let pager = Pager::open(&path, &small_config()).unwrap();
        assert_eq!(pager.page_size(), 512);
        assert_eq!(pager.high_water(), 0);
        assert_eq!(pager.free_head(), FREE_LIST_END);
        drop(pager);

        let pager = Pager::open(&path, &small_config()).unwrap();
        assert_eq!(pager.page_size(), 512);
    }

    #[test]
    fn test_page_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rw.db");
        let mut pager = Pager::open(&path, &small_config()).unwrap();

        let page = pager.allocate().unwrap();
        let mut data = vec![0u8; 512];
        data[0] = 42;
        data[511] = 128;
        pager.write_page(page, &data).unwrap();

        let read = pager.read_page(page).unwrap();
        assert_eq!(read, data);
    }

    #[test]
    fn test_read_past_end_is_zeroes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sparse.db");
        let mut pager = Pager::open(&path, &small_config()).unwrap();
        let data = pager.read_page(PageId::new(9)).unwrap();
        assert!(data.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_allocate_bumps_high_water() {
        let mut pager = Pager::in_memory(&small_config());
        assert_eq!(pager.allocate().unwrap(), PageId::new(1));
        assert_eq!(pager.allocate().unwrap(), PageId::new(2));
        assert_eq!(pager.high_water(), 2);
    }

    #[test]
    fn test_free_then_allocate_reuses_page() {
        let mut pager = Pager::in_memory(&small_config());
        let a = pager.allocate().unwrap();
        let b = pager.allocate().unwrap();
        pager.free(a);
        pager.free(b);
        // LIFO: b was pushed last
        assert_eq!(pager.allocate().unwrap(), b);
        assert_eq!(pager.allocate().unwrap(), a);
        // Chain exhausted, back to extending
        assert_eq!(pager.allocate().unwrap(), PageId::new(3));
    }

    #[test]
    fn test_freed_images_thread_the_chain() {
        let mut pager = Pager::in_memory(&small_config());
        let a = pager.allocate().unwrap();
        let b = pager.allocate().unwrap();
        pager.free(a);
        pager.free(b);
        let images = pager.drain_freed_images();
        assert_eq!(images.len(), 2);
        // Page a was freed onto an empty list, page b points at a.
        assert_eq!(&images[0].1[0..4], &FREE_LIST_END.to_be_bytes());
        assert_eq!(&images[1].1[0..4], &a.as_u32().to_be_bytes());
        assert!(pager.drain_freed_images().is_empty());
    }

    #[test]
    fn test_free_list_survives_reopen_via_file_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("freelist.db");
        {
            let mut pager = Pager::open(&path, &small_config()).unwrap();
            let a = pager.allocate().unwrap();
            let _b = pager.allocate().unwrap();
            pager.free(a);
            // Persist the freed image and header the way a checkpoint would.
            for (page, image) in pager.drain_freed_images() {
                pager.write_page(page, &image).unwrap();
            }
            let header = pager.header_image();
            pager.write_page(PageId::new(0), &header).unwrap();
            pager.fsync().unwrap();
        }
        let mut pager = Pager::open(&path, &small_config()).unwrap();
        assert_eq!(pager.allocate().unwrap(), PageId::new(1));
        assert_eq!(pager.allocate().unwrap(), PageId::new(3));
    }

    #[test]
    fn test_bad_magic_is_incompatible() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bogus.db");
        std::fs::write(&path, vec![0xAAu8; 512]).unwrap();
        assert!(matches!(
            Pager::open(&path, &small_config()),
            Err(CannonError::IncompatibleFile(_))
        ));
    }

    #[test]
    fn test_page_size_mismatch_is_incompatible() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mismatch.db");
        drop(Pager::open(&path, &small_config()).unwrap());
        assert!(matches!(
            Pager::open(&path, &DbConfig::default()),
            Err(CannonError::IncompatibleFile(_))
        ));
    }

    #[test]
    fn test_second_handle_fails_already_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("locked.db");
        let _first = Pager::open(&path, &small_config()).unwrap();
        assert!(matches!(
            Pager::open(&path, &small_config()),
            Err(CannonError::AlreadyOpen)
        ));
    }

    #[test]
    fn test_header_roundtrip() {
        let header = FileHeader {
            version: FORMAT_VERSION,
            page_size: 4096,
            max_key_size: 64,
            max_value_size: 512,
            root_page: 7,
            free_head: 3,
            high_water: 12,
        };
        let mut buf = [0u8; HEADER_SIZE];
        header.serialize(&mut buf);
        assert_eq!(FileHeader::deserialize(&buf).unwrap(), header);
    }
}
