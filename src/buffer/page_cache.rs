use std::collections::HashMap;

use tracing::{debug, info, warn};

use crate::common::{PageId, Result, HEADER_PAGE_ID};
use crate::index::node::Node;
use crate::storage::{Pager, Wal};

use super::LruReplacer;

struct CacheEntry {
    node: Node,
    dirty: bool,
}

/// Bounded cache of decoded nodes, binding the pager and the write-ahead
/// log underneath the B-tree.
///
/// Clean entries are evicted in strict LRU order; dirty entries are pinned
/// until a commit cleans them. When every resident entry is dirty, the
/// least-recent one is flushed into the current WAL frame group and then
/// dropped, so the cache never exceeds its capacity. Cache misses consult
/// the WAL for a page's latest image before falling back to the main file,
/// which is only current as of the last checkpoint.
pub struct PageCache {
    pager: Pager,
    wal: Option<Wal>,
    capacity: usize,
    entries: HashMap<PageId, CacheEntry>,
    replacer: LruReplacer,
}

impl PageCache {
    pub fn new(pager: Pager, wal: Option<Wal>, capacity: usize) -> Self {
        Self {
            pager,
            wal,
            capacity,
            entries: HashMap::new(),
            replacer: LruReplacer::new(),
        }
    }

    pub fn page_size(&self) -> u32 {
        self.pager.page_size()
    }

    pub fn max_key_size(&self) -> u32 {
        self.pager.max_key_size()
    }

    pub fn max_value_size(&self) -> u32 {
        self.pager.max_value_size()
    }

    pub fn root_page(&self) -> PageId {
        self.pager.root_page()
    }

    pub fn high_water(&self) -> u32 {
        self.pager.high_water()
    }

    pub fn cached_pages(&self) -> usize {
        self.entries.len()
    }

    /// Replays any sealed commit groups left in the WAL into the main
    /// file, then resets the log. Returns the number of pages replayed.
    /// Must run before the first user operation.
    pub fn recover(&mut self) -> Result<usize> {
        let Some(wal) = &mut self.wal else {
            return Ok(0);
        };
        if !wal.needs_recovery()? {
            return Ok(0);
        }
        warn!("found an existing write-ahead log, the database was not closed properly");
        let images = wal.recover()?;
        let replayed = images.len();
        if replayed > 0 {
            for (page, image) in images {
                self.pager.write_page(page, &image)?;
            }
            self.pager.fsync()?;
            self.pager.reload_header()?;
        }
        wal.truncate()?;
        info!(pages = replayed, "write-ahead log recovery complete");
        Ok(replayed)
    }

    /// Fetches a node, reading and decoding its page on a miss.
    pub fn node(&mut self, page: PageId) -> Result<&Node> {
        if self.entries.contains_key(&page) {
            self.replacer.record_access(page);
            return Ok(&self.entries[&page].node);
        }
        let image = match &mut self.wal {
            Some(wal) => match wal.page_image(page)? {
                Some(image) => image,
                None => self.pager.read_page(page)?,
            },
            None => self.pager.read_page(page)?,
        };
        let node = Node::from_page_bytes(page, &image)?;
        self.admit(node, false)?;
        Ok(&self.entries[&page].node)
    }

    /// Installs or replaces a node and marks it dirty. Dirty nodes stay
    /// pinned in the cache until the next commit.
    pub fn put_dirty(&mut self, node: Node) -> Result<()> {
        self.admit(node, true)
    }

    pub fn allocate(&mut self) -> Result<PageId> {
        self.pager.allocate()
    }

    /// Returns a page to the free list and drops any cached copy.
    pub fn free_page(&mut self, page: PageId) -> Result<()> {
        self.pager.free(page);
        self.invalidate(page);
        Ok(())
    }

    pub fn invalidate(&mut self, page: PageId) {
        self.entries.remove(&page);
        self.replacer.remove(page);
    }

    /// Raw latest image of a page (WAL first, then main file), bypassing
    /// the node cache. Used for free-list inspection.
    pub fn raw_page(&mut self, page: PageId) -> Result<Vec<u8>> {
        if let Some(wal) = &mut self.wal {
            if let Some(image) = wal.page_image(page)? {
                return Ok(image);
            }
        }
        self.pager.read_page(page)
    }

    /// Pages currently on the free list, walking the chain from the
    /// header. In-session frees are resolved from the pager's link map,
    /// older ones from the page bytes.
    pub fn free_pages(&mut self) -> Result<Vec<PageId>> {
        let mut pages = Vec::new();
        let mut current = self.pager.free_head();
        let limit = self.pager.high_water() as usize + 1;
        while current != crate::common::FREE_LIST_END && pages.len() <= limit {
            pages.push(PageId::new(current));
            current = match self.pager.free_link(current) {
                Some(next) => next,
                None => {
                    let image = self.raw_page(PageId::new(current))?;
                    u32::from_be_bytes(image[0..4].try_into().unwrap())
                }
            };
        }
        Ok(pages)
    }

    /// Seals everything dirtied since the last commit into one durable
    /// WAL frame group: dirty nodes in ascending page order, freed-page
    /// images, and the header carrying `root`. The main file is not
    /// touched. In-memory mode writes straight to the backing instead.
    pub fn commit(&mut self, root: PageId) -> Result<()> {
        self.pager.set_root_page(root);

        let mut frames = self.dirty_images();
        frames.extend(self.pager.drain_freed_images());
        let pending = self.wal.as_ref().is_some_and(Wal::has_pending);
        if frames.is_empty() && !pending && !self.pager.header_dirty() {
            return Ok(());
        }
        frames.push((HEADER_PAGE_ID, self.pager.header_image()));
        frames.sort_by_key(|(page, _)| page.as_u32());

        match &mut self.wal {
            Some(wal) => {
                for (page, image) in &frames {
                    wal.append_frame(*page, image)?;
                }
                wal.commit()?;
            }
            None => {
                for (page, image) in &frames {
                    self.pager.write_page(*page, image)?;
                }
            }
        }

        for entry in self.entries.values_mut() {
            entry.dirty = false;
        }
        let pages: Vec<PageId> = self.entries.keys().copied().collect();
        for page in pages {
            self.replacer.set_evictable(page, true);
        }
        self.pager.clear_header_dirty();
        Ok(())
    }

    /// Applies every WAL-committed page to the main file, syncs it, and
    /// truncates the log. A no-op in-memory and when nothing is staged.
    pub fn checkpoint(&mut self) -> Result<()> {
        let Some(wal) = &mut self.wal else {
            return Ok(());
        };
        if !wal.has_committed() && !wal.has_pending() {
            return Ok(());
        }
        let images = wal.committed_pages()?;
        debug!(pages = images.len(), "checkpointing write-ahead log");
        for (page, image) in images {
            self.pager.write_page(page, &image)?;
        }
        self.pager.fsync()?;
        wal.truncate()?;
        Ok(())
    }

    /// Current dirty set as page images, ascending by page number. Flags
    /// are left set; `commit` clears them once the group is durable.
    fn dirty_images(&self) -> Vec<(PageId, Vec<u8>)> {
        let page_size = self.pager.page_size() as usize;
        let mut dirty: Vec<&CacheEntry> = self
            .entries
            .values()
            .filter(|entry| entry.dirty)
            .collect();
        dirty.sort_by_key(|entry| entry.node.page_id.as_u32());
        dirty
            .into_iter()
            .map(|entry| (entry.node.page_id, entry.node.to_page_bytes(page_size)))
            .collect()
    }

    fn admit(&mut self, node: Node, dirty: bool) -> Result<()> {
        let page = node.page_id;
        if !self.entries.contains_key(&page) {
            self.make_room()?;
        }
        self.replacer.record_access(page);
        self.replacer.set_evictable(page, !dirty);
        match self.entries.entry(page) {
            std::collections::hash_map::Entry::Occupied(mut slot) => {
                let entry = slot.get_mut();
                entry.node = node;
                entry.dirty = entry.dirty || dirty;
            }
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(CacheEntry { node, dirty });
            }
        }
        Ok(())
    }

    fn make_room(&mut self) -> Result<()> {
        let page_size = self.pager.page_size() as usize;
        while self.entries.len() >= self.capacity {
            if let Some(victim) = self.replacer.evict() {
                self.entries.remove(&victim);
                continue;
            }
            // Every resident is dirty: push the least-recent one into the
            // current WAL frame group before dropping it.
            let Some(victim) = self.replacer.victim_any() else {
                break;
            };
            if let Some(entry) = self.entries.remove(&victim) {
                debug!(page = victim.as_u32(), "flushing dirty page to make room");
                let image = entry.node.to_page_bytes(page_size);
                match &mut self.wal {
                    Some(wal) => wal.append_frame(victim, &image)?,
                    None => self.pager.write_page(victim, &image)?,
                }
            }
        }
        Ok(())
    }
}
