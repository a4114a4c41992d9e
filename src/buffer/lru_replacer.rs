use std::collections::HashMap;

use crate::common::PageId;

#[derive(Debug)]
struct FrameInfo {
    last_access: u64,
    evictable: bool,
}

/// Strict LRU replacement policy over cached pages.
///
/// The replacer evicts the evictable page with the oldest access stamp.
/// Dirty pages are registered non-evictable until commit cleans them;
/// `victim_any` ignores the flag for the flush-then-evict path when every
/// resident page is dirty.
pub struct LruReplacer {
    counter: u64,
    frames: HashMap<PageId, FrameInfo>,
}

impl LruReplacer {
    pub fn new() -> Self {
        Self {
            counter: 0,
            frames: HashMap::new(),
        }
    }

    /// Records an access, stamping the page most-recent.
    pub fn record_access(&mut self, page: PageId) {
        self.counter += 1;
        let stamp = self.counter;
        self.frames
            .entry(page)
            .and_modify(|info| info.last_access = stamp)
            .or_insert(FrameInfo {
                last_access: stamp,
                evictable: true,
            });
    }

    pub fn set_evictable(&mut self, page: PageId, evictable: bool) {
        if let Some(info) = self.frames.get_mut(&page) {
            info.evictable = evictable;
        }
    }

    /// Removes and returns the least-recently-used evictable page.
    pub fn evict(&mut self) -> Option<PageId> {
        let victim = self
            .frames
            .iter()
            .filter(|(_, info)| info.evictable)
            .min_by_key(|(_, info)| info.last_access)
            .map(|(&page, _)| page)?;
        self.frames.remove(&victim);
        Some(victim)
    }

    /// Removes and returns the least-recently-used page regardless of the
    /// evictable flag.
    pub fn victim_any(&mut self) -> Option<PageId> {
        let victim = self
            .frames
            .iter()
            .min_by_key(|(_, info)| info.last_access)
            .map(|(&page, _)| page)?;
        self.frames.remove(&victim);
        Some(victim)
    }

    pub fn remove(&mut self, page: PageId) {
        self.frames.remove(&page);
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

impl Default for LruReplacer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_evict_empty() {
        let mut replacer = LruReplacer::new();
        assert_eq!(replacer.evict(), None);
    }

    #[test]
    fn test_evicts_least_recent() {
        let mut replacer = LruReplacer::new();
        replacer.record_access(PageId::new(1));
        replacer.record_access(PageId::new(2));
        replacer.record_access(PageId::new(3));
        replacer.record_access(PageId::new(1));

        assert_eq!(replacer.evict(), Some(PageId::new(2)));
        assert_eq!(replacer.evict(), Some(PageId::new(3)));
        assert_eq!(replacer.evict(), Some(PageId::new(1)));
        assert_eq!(replacer.evict(), None);
    }

    #[test]
    fn test_non_evictable_is_skipped() {
        let mut replacer = LruReplacer::new();
        replacer.record_access(PageId::new(1));
        replacer.record_access(PageId::new(2));
        replacer.set_evictable(PageId::new(1), false);

        assert_eq!(replacer.evict(), Some(PageId::new(2)));
        assert_eq!(replacer.evict(), None);

        replacer.set_evictable(PageId::new(1), true);
        assert_eq!(replacer.evict(), Some(PageId::new(1)));
    }

    #[test]
    fn test_victim_any_ignores_flag() {
        let mut replacer = LruReplacer::new();
        replacer.record_access(PageId::new(1));
        replacer.record_access(PageId::new(2));
        replacer.set_evictable(PageId::new(1), false);
        replacer.set_evictable(PageId::new(2), false);

        assert_eq!(replacer.evict(), None);
        assert_eq!(replacer.victim_any(), Some(PageId::new(1)));
    }

    #[test]
    fn test_remove() {
        let mut replacer = LruReplacer::new();
        replacer.record_access(PageId::new(1));
        replacer.remove(PageId::new(1));
        assert_eq!(replacer.evict(), None);
        assert!(replacer.is_empty());
    }
}
