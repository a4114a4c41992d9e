use std::collections::HashSet;

use crate::buffer::PageCache;
use crate::common::{CannonError, PageId, Result};
use crate::value::compare_encoded;

use super::node::{Entry, Node};

/// Ordered index over encoded keys.
///
/// A classic B-tree: every node holds (key, value) entries, branch nodes
/// additionally hold `entries + 1` child page numbers. Nodes are reached
/// exclusively through the page cache and never retained across calls;
/// mutated nodes are reinstalled with `put_dirty`, pages freed by merges
/// go back to the pager's free list.
pub struct BTree {
    root: PageId,
    order: usize,
}

impl BTree {
    /// Attaches to an existing tree rooted at `root`.
    pub fn open(root: PageId, order: usize) -> Self {
        Self { root, order }
    }

    /// Creates a fresh tree: a single empty leaf.
    pub fn bootstrap(cache: &mut PageCache, order: usize) -> Result<Self> {
        let page = cache.allocate()?;
        cache.put_dirty(Node::new_leaf(page))?;
        Ok(Self { root: page, order })
    }

    pub fn root_page(&self) -> PageId {
        self.root
    }

    /// Minimum entries for a non-root node.
    fn min_entries(&self) -> usize {
        (self.order + 1) / 2 - 1
    }

    /// Descends from the root to the key, returning its value.
    pub fn search(&self, cache: &mut PageCache, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut current = self.root;
        loop {
            let node = cache.node(current)?;
            match node.find_key(key) {
                Ok(i) => return Ok(Some(node.entries[i].value.clone())),
                Err(i) => {
                    if node.is_leaf {
                        return Ok(None);
                    }
                    current = node.children[i];
                }
            }
        }
    }

    /// Inserts a key. An existing key is overwritten in place when
    /// `overwrite` is set and is `DuplicateKey` otherwise. Leaf overflow
    /// splits around the median and propagates upward; a root split grows
    /// the tree by one level.
    pub fn insert(
        &mut self,
        cache: &mut PageCache,
        key: Vec<u8>,
        value: Vec<u8>,
        overwrite: bool,
    ) -> Result<()> {
        let mut path: Vec<(PageId, usize)> = Vec::new();
        let mut current = self.root;
        loop {
            let node = cache.node(current)?;
            match node.find_key(&key) {
                Ok(i) => {
                    if !overwrite {
                        return Err(CannonError::DuplicateKey);
                    }
                    let mut updated = node.clone();
                    updated.entries[i].value = value;
                    return cache.put_dirty(updated);
                }
                Err(i) => {
                    if node.is_leaf {
                        let mut leaf = node.clone();
                        leaf.entries.insert(i, Entry { key, value });
                        return self.resolve_overflow(cache, leaf, path);
                    }
                    path.push((current, i));
                    current = node.children[i];
                }
            }
        }
    }

    /// Splits overflowing nodes up the recorded path until the tree is
    /// within bounds again, allocating a new root if the split reaches it.
    fn resolve_overflow(
        &mut self,
        cache: &mut PageCache,
        mut node: Node,
        mut path: Vec<(PageId, usize)>,
    ) -> Result<()> {
        loop {
            if node.entries.len() <= self.order - 1 {
                return cache.put_dirty(node);
            }

            // The overflow set holds `order` entries; the entry at index
            // order/2 is promoted, the rest partition left and right.
            let mid = node.entries.len() / 2;
            let mut right_entries = node.entries.split_off(mid);
            let median = right_entries.remove(0);
            let right_children = if node.is_leaf {
                Vec::new()
            } else {
                node.children.split_off(mid + 1)
            };

            let right_page = cache.allocate()?;
            let right = Node {
                page_id: right_page,
                is_leaf: node.is_leaf,
                entries: right_entries,
                children: right_children,
            };
            let left_page = node.page_id;
            cache.put_dirty(node)?;
            cache.put_dirty(right)?;

            match path.pop() {
                Some((parent_page, slot)) => {
                    let mut parent = cache.node(parent_page)?.clone();
                    parent.entries.insert(slot, median);
                    parent.children.insert(slot + 1, right_page);
                    node = parent;
                }
                None => {
                    let root_page = cache.allocate()?;
                    let root =
                        Node::new_branch(root_page, vec![median], vec![left_page, right_page]);
                    cache.put_dirty(root)?;
                    self.root = root_page;
                    return Ok(());
                }
            }
        }
    }

    /// Removes a key. A hit in a branch node is swapped with its in-order
    /// successor (the leftmost entry of the right subtree) so the physical
    /// deletion always happens at a leaf, then underflow is repaired back
    /// up the descent path.
    pub fn remove(&mut self, cache: &mut PageCache, key: &[u8]) -> Result<()> {
        let mut path: Vec<(PageId, usize)> = Vec::new();
        let mut current = self.root;
        let (holder, slot) = loop {
            let node = cache.node(current)?;
            match node.find_key(key) {
                Ok(i) => break (current, i),
                Err(i) => {
                    if node.is_leaf {
                        return Err(CannonError::NotFound);
                    }
                    path.push((current, i));
                    current = node.children[i];
                }
            }
        };

        let holder_is_leaf = cache.node(holder)?.is_leaf;
        let leaf_page = if holder_is_leaf {
            let mut leaf = cache.node(holder)?.clone();
            leaf.entries.remove(slot);
            cache.put_dirty(leaf)?;
            holder
        } else {
            path.push((holder, slot + 1));
            let mut cursor = cache.node(holder)?.children[slot + 1];
            loop {
                let node = cache.node(cursor)?;
                if node.is_leaf {
                    break;
                }
                path.push((cursor, 0));
                cursor = node.children[0];
            }
            let mut leaf = cache.node(cursor)?.clone();
            let successor = leaf.entries.remove(0);
            cache.put_dirty(leaf)?;
            let mut branch = cache.node(holder)?.clone();
            branch.entries[slot] = successor;
            cache.put_dirty(branch)?;
            cursor
        };

        self.rebalance(cache, leaf_page, path)
    }

    /// Walks the descent path upward repairing underflow, shrinking the
    /// tree when a branch root runs out of entries.
    fn rebalance(
        &mut self,
        cache: &mut PageCache,
        mut page: PageId,
        mut path: Vec<(PageId, usize)>,
    ) -> Result<()> {
        loop {
            let underfull = cache.node(page)?.entries.len() < self.min_entries();
            match path.pop() {
                Some((parent_page, slot)) => {
                    if !underfull {
                        return Ok(());
                    }
                    if self.borrow_or_merge(cache, page, parent_page, slot)? {
                        return Ok(());
                    }
                    page = parent_page;
                }
                None => {
                    let root = cache.node(page)?;
                    if !root.is_leaf && root.entries.is_empty() {
                        let only_child = root.children[0];
                        cache.free_page(page)?;
                        self.root = only_child;
                    }
                    return Ok(());
                }
            }
        }
    }

    /// Repairs an underfull node against its siblings. Borrowing moves one
    /// entry through the parent separator, preferring the left sibling;
    /// when neither can spare an entry the node merges through the
    /// separator (into the left sibling when it exists) and the freed page
    /// goes back to the free list. Returns true when a borrow sufficed.
    fn borrow_or_merge(
        &mut self,
        cache: &mut PageCache,
        page: PageId,
        parent_page: PageId,
        slot: usize,
    ) -> Result<bool> {
        let mut parent = cache.node(parent_page)?.clone();
        let min = self.min_entries();

        if slot > 0 {
            let left_page = parent.children[slot - 1];
            let left = cache.node(left_page)?;
            if left.entries.len() > min {
                let mut left = left.clone();
                let mut node = cache.node(page)?.clone();
                let separator =
                    std::mem::replace(&mut parent.entries[slot - 1], left.entries.pop().unwrap());
                node.entries.insert(0, separator);
                if !node.is_leaf {
                    node.children.insert(0, left.children.pop().unwrap());
                }
                cache.put_dirty(left)?;
                cache.put_dirty(node)?;
                cache.put_dirty(parent)?;
                return Ok(true);
            }
        }

        if slot + 1 < parent.children.len() {
            let right_page = parent.children[slot + 1];
            let right = cache.node(right_page)?;
            if right.entries.len() > min {
                let mut right = right.clone();
                let mut node = cache.node(page)?.clone();
                let separator =
                    std::mem::replace(&mut parent.entries[slot], right.entries.remove(0));
                node.entries.push(separator);
                if !node.is_leaf {
                    node.children.push(right.children.remove(0));
                }
                cache.put_dirty(right)?;
                cache.put_dirty(node)?;
                cache.put_dirty(parent)?;
                return Ok(true);
            }
        }

        if slot > 0 {
            let left_page = parent.children[slot - 1];
            let mut left = cache.node(left_page)?.clone();
            let node = cache.node(page)?.clone();
            left.entries.push(parent.entries.remove(slot - 1));
            left.entries.extend(node.entries);
            left.children.extend(node.children);
            parent.children.remove(slot);
            cache.put_dirty(left)?;
            cache.free_page(page)?;
        } else {
            let right_page = parent.children[slot + 1];
            let right = cache.node(right_page)?.clone();
            let mut node = cache.node(page)?.clone();
            node.entries.push(parent.entries.remove(slot));
            node.entries.extend(right.entries);
            node.children.extend(right.children);
            parent.children.remove(slot + 1);
            cache.put_dirty(node)?;
            cache.free_page(right_page)?;
        }
        cache.put_dirty(parent)?;
        Ok(false)
    }

    /// In-order traversal of every (key, value) pair.
    pub fn traverse(&self, cache: &mut PageCache) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut out = Vec::new();
        self.visit(cache, self.root, &mut out)?;
        Ok(out)
    }

    fn visit(
        &self,
        cache: &mut PageCache,
        page: PageId,
        out: &mut Vec<(Vec<u8>, Vec<u8>)>,
    ) -> Result<()> {
        let node = cache.node(page)?.clone();
        if node.is_leaf {
            out.extend(node.entries.into_iter().map(|e| (e.key, e.value)));
        } else {
            for (i, entry) in node.entries.iter().enumerate() {
                self.visit(cache, node.children[i], out)?;
                out.push((entry.key.clone(), entry.value.clone()));
            }
            self.visit(cache, *node.children.last().unwrap(), out)?;
        }
        Ok(())
    }

    /// Verifies the structural invariants: occupancy bounds, strict key
    /// order, separator bounds, branch child counts, uniform leaf depth,
    /// and that no page appears twice. Returns the set of visited pages.
    pub fn check_invariants(&self, cache: &mut PageCache) -> Result<HashSet<u32>> {
        let mut visited = HashSet::new();
        let mut leaf_depth = None;
        self.check_node(cache, self.root, 0, None, None, &mut visited, &mut leaf_depth)?;
        Ok(visited)
    }

    #[allow(clippy::too_many_arguments)]
    fn check_node(
        &self,
        cache: &mut PageCache,
        page: PageId,
        depth: usize,
        lower: Option<Vec<u8>>,
        upper: Option<Vec<u8>>,
        visited: &mut HashSet<u32>,
        leaf_depth: &mut Option<usize>,
    ) -> Result<()> {
        let fail = |what: String| Err(CannonError::InvalidEncoding(what));
        if !visited.insert(page.as_u32()) {
            return fail(format!("page {} appears twice in the tree", page.as_u32()));
        }
        let node = cache.node(page)?.clone();
        let is_root = page == self.root;

        if node.entries.len() > self.order - 1 {
            return fail(format!("page {} overfull", page.as_u32()));
        }
        if !is_root && node.entries.len() < self.min_entries() {
            return fail(format!("page {} underfull", page.as_u32()));
        }
        if is_root && !node.is_leaf && node.entries.is_empty() {
            return fail("branch root has no entries".to_string());
        }
        for pair in node.entries.windows(2) {
            if compare_encoded(&pair[0].key, &pair[1].key) != std::cmp::Ordering::Less {
                return fail(format!("page {} keys not strictly increasing", page.as_u32()));
            }
        }
        if let (Some(lo), Some(first)) = (&lower, node.entries.first()) {
            if compare_encoded(&first.key, lo) != std::cmp::Ordering::Greater {
                return fail(format!("page {} violates lower separator", page.as_u32()));
            }
        }
        if let (Some(hi), Some(last)) = (&upper, node.entries.last()) {
            if compare_encoded(&last.key, hi) != std::cmp::Ordering::Less {
                return fail(format!("page {} violates upper separator", page.as_u32()));
            }
        }

        if node.is_leaf {
            match leaf_depth {
                None => *leaf_depth = Some(depth),
                Some(expected) if *expected != depth => {
                    return fail(format!("leaf {} at uneven depth", page.as_u32()));
                }
                _ => {}
            }
        } else {
            if node.children.len() != node.entries.len() + 1 {
                return fail(format!("page {} child count mismatch", page.as_u32()));
            }
            for (i, &child) in node.children.iter().enumerate() {
                let lo = if i == 0 {
                    lower.clone()
                } else {
                    Some(node.entries[i - 1].key.clone())
                };
                let hi = if i == node.entries.len() {
                    upper.clone()
                } else {
                    Some(node.entries[i].key.clone())
                };
                self.check_node(cache, child, depth + 1, lo, hi, visited, leaf_depth)?;
            }
        }
        Ok(())
    }
}
