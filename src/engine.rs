use std::path::Path;

use parking_lot::Mutex;
use tracing::info;

use crate::buffer::PageCache;
use crate::common::{CannonError, DbConfig, Result};
use crate::index::{tree_order, BTree};
use crate::storage::{Pager, Wal};
use crate::value::Value;

/// Storage counters, point-in-time.
#[derive(Debug, Clone, Copy)]
pub struct Stats {
    /// Page allocation high-water mark (pages ever allocated, header excluded).
    pub page_count: u32,
    /// Pages currently on the free list.
    pub free_pages: usize,
    /// Pages resident in the cache.
    pub cached_pages: usize,
}

struct Inner {
    cache: PageCache,
    tree: BTree,
    auto_commit: bool,
    poisoned: bool,
}

/// An open CannonDB database.
///
/// Single-writer, single-reader: every operation serializes behind one
/// mutex, and a second handle to the same file fails with `AlreadyOpen`.
/// A storage-level failure mid-operation poisons the handle; subsequent
/// calls fail with `Poisoned` and only `close` remains valid. Dropping the
/// handle without `close` behaves like a crash: everything up to the last
/// commit record is recovered on the next open, anything after it is lost.
pub struct CannonDb {
    inner: Mutex<Inner>,
    max_key_size: usize,
    max_value_size: usize,
}

impl CannonDb {
    /// Opens or creates a database at `path` (the write-ahead log lives
    /// beside it with a `.wal` extension). Recovery runs before the first
    /// user operation. With `config.in_memory` set the path is ignored and
    /// the database lives in a private buffer.
    pub fn open<P: AsRef<Path>>(path: P, config: DbConfig) -> Result<Self> {
        config.validate()?;
        if config.in_memory {
            return Self::build_in_memory(config);
        }
        let path = path.as_ref();
        info!(path = %path.display(), "opening database");

        let pager = Pager::open(path, &config)?;
        let wal = Wal::open(path.with_extension("wal"), pager.page_size())?;
        let mut cache = PageCache::new(pager, Some(wal), config.cache_size);
        cache.recover()?;

        let order = tree_order(
            cache.page_size(),
            cache.max_key_size(),
            cache.max_value_size(),
        )?;
        let max_key_size = cache.max_key_size() as usize;
        let max_value_size = cache.max_value_size() as usize;

        let tree = if cache.root_page().as_u32() == 0 {
            // Fresh database: seal an empty root leaf so even a crash
            // right after open recovers to a valid empty tree.
            let tree = BTree::bootstrap(&mut cache, order)?;
            cache.commit(tree.root_page())?;
            tree
        } else {
            BTree::open(cache.root_page(), order)
        };

        Ok(Self {
            inner: Mutex::new(Inner {
                cache,
                tree,
                auto_commit: config.auto_commit,
                poisoned: false,
            }),
            max_key_size,
            max_value_size,
        })
    }

    /// Opens a database backed by an in-memory buffer. The write-ahead log
    /// is short-circuited and `checkpoint` is a no-op; semantics are
    /// otherwise identical, durability excluded.
    pub fn in_memory(config: DbConfig) -> Result<Self> {
        config.validate()?;
        Self::build_in_memory(config)
    }

    fn build_in_memory(config: DbConfig) -> Result<Self> {
        let order = tree_order(config.page_size, config.max_key_size, config.max_value_size)?;
        let pager = Pager::in_memory(&config);
        let mut cache = PageCache::new(pager, None, config.cache_size);
        let tree = BTree::bootstrap(&mut cache, order)?;
        Ok(Self {
            inner: Mutex::new(Inner {
                cache,
                tree,
                auto_commit: config.auto_commit,
                poisoned: false,
            }),
            max_key_size: config.max_key_size as usize,
            max_value_size: config.max_value_size as usize,
        })
    }

    /// Looks up a key. Absent keys fail with `NotFound`.
    pub fn get(&self, key: &Value) -> Result<Value> {
        let k = self.encode_key(key)?;
        self.with(|inner| match inner.tree.search(&mut inner.cache, &k)? {
            Some(bytes) => Value::decode(&bytes),
            None => Err(CannonError::NotFound),
        })
    }

    /// Whether a key is present.
    pub fn contains_key(&self, key: &Value) -> Result<bool> {
        let k = self.encode_key(key)?;
        self.with(|inner| Ok(inner.tree.search(&mut inner.cache, &k)?.is_some()))
    }

    /// Inserts a key/value pair. An existing key fails with
    /// `DuplicateKey` unless `overwrite` is set.
    pub fn insert(&self, key: Value, value: Value, overwrite: bool) -> Result<()> {
        let k = self.encode_key(&key)?;
        let v = self.encode_value(&value)?;
        self.with(|inner| {
            inner.tree.insert(&mut inner.cache, k, v, overwrite)?;
            inner.maybe_commit()
        })
    }

    /// Inserts a batch of pairs, committing once at the end under
    /// auto-commit.
    pub fn insert_many<I>(&self, pairs: I, overwrite: bool) -> Result<()>
    where
        I: IntoIterator<Item = (Value, Value)>,
    {
        let mut encoded = Vec::new();
        for (key, value) in pairs {
            encoded.push((self.encode_key(&key)?, self.encode_value(&value)?));
        }
        self.with(|inner| {
            for (k, v) in encoded {
                inner.tree.insert(&mut inner.cache, k, v, overwrite)?;
            }
            inner.maybe_commit()
        })
    }

    /// Removes a key. Absent keys fail with `NotFound`.
    pub fn remove(&self, key: &Value) -> Result<()> {
        let k = self.encode_key(key)?;
        self.with(|inner| {
            inner.tree.remove(&mut inner.cache, &k)?;
            inner.maybe_commit()
        })
    }

    /// Seals everything dirtied since the last commit into one durable
    /// write-ahead-log group. The main file is untouched until the next
    /// checkpoint.
    pub fn commit(&self) -> Result<()> {
        self.with(Inner::commit)
    }

    /// Applies committed pages to the main file and truncates the log.
    pub fn checkpoint(&self) -> Result<()> {
        self.with(|inner| inner.cache.checkpoint())
    }

    /// Toggles commit-after-every-operation. Defaults to the config value.
    pub fn set_auto_commit(&self, enabled: bool) -> Result<()> {
        self.with(|inner| {
            inner.auto_commit = enabled;
            Ok(())
        })
    }

    /// Every (key, value) pair in key order.
    pub fn items(&self) -> Result<Vec<(Value, Value)>> {
        self.with(|inner| {
            inner
                .tree
                .traverse(&mut inner.cache)?
                .into_iter()
                .map(|(k, v)| Ok((Value::decode(&k)?, Value::decode(&v)?)))
                .collect()
        })
    }

    /// Every key in order.
    pub fn keys(&self) -> Result<Vec<Value>> {
        self.with(|inner| {
            inner
                .tree
                .traverse(&mut inner.cache)?
                .into_iter()
                .map(|(k, _)| Value::decode(&k))
                .collect()
        })
    }

    /// Number of stored pairs.
    pub fn len(&self) -> Result<usize> {
        self.with(|inner| Ok(inner.tree.traverse(&mut inner.cache)?.len()))
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn stats(&self) -> Result<Stats> {
        self.with(|inner| {
            Ok(Stats {
                page_count: inner.cache.high_water(),
                free_pages: inner.cache.free_pages()?.len(),
                cached_pages: inner.cache.cached_pages(),
            })
        })
    }

    /// Verifies tree invariants and page accounting: every allocated page
    /// is in the tree, on the free list, or is the header, exactly once.
    pub fn check_integrity(&self) -> Result<()> {
        self.with(|inner| {
            let mut seen = inner.tree.check_invariants(&mut inner.cache)?;
            for page in inner.cache.free_pages()? {
                if !seen.insert(page.as_u32()) {
                    return Err(CannonError::InvalidEncoding(format!(
                        "page {} is both in the tree and on the free list",
                        page.as_u32()
                    )));
                }
            }
            for n in 1..=inner.cache.high_water() {
                if !seen.contains(&n) {
                    return Err(CannonError::InvalidEncoding(format!(
                        "page {} is neither in the tree nor on the free list",
                        n
                    )));
                }
            }
            Ok(())
        })
    }

    /// Commits, checkpoints, and releases the database. Skips the flush
    /// when the handle is poisoned, leaving the file at the last
    /// successful commit point.
    pub fn close(self) -> Result<()> {
        let mut inner = self.inner.into_inner();
        if inner.poisoned {
            return Ok(());
        }
        inner.commit()?;
        inner.cache.checkpoint()?;
        Ok(())
    }

    fn with<T>(&self, f: impl FnOnce(&mut Inner) -> Result<T>) -> Result<T> {
        let mut inner = self.inner.lock();
        if inner.poisoned {
            return Err(CannonError::Poisoned);
        }
        let result = f(&mut inner);
        if let Err(e) = &result {
            if e.poisons() {
                inner.poisoned = true;
            }
        }
        result
    }

    // Encoding runs before the poisoning boundary: a malformed or
    // oversized input is the caller's error and leaves the handle healthy.
    fn encode_key(&self, key: &Value) -> Result<Vec<u8>> {
        let bytes = key.encode()?;
        if bytes.len() > self.max_key_size {
            return Err(CannonError::EncodingTooLarge {
                kind: "key",
                size: bytes.len(),
                limit: self.max_key_size,
            });
        }
        Ok(bytes)
    }

    fn encode_value(&self, value: &Value) -> Result<Vec<u8>> {
        let bytes = value.encode()?;
        if bytes.len() > self.max_value_size {
            return Err(CannonError::EncodingTooLarge {
                kind: "value",
                size: bytes.len(),
                limit: self.max_value_size,
            });
        }
        Ok(bytes)
    }
}

impl Inner {
    fn commit(&mut self) -> Result<()> {
        let root = self.tree.root_page();
        self.cache.commit(root)
    }

    fn maybe_commit(&mut self) -> Result<()> {
        if self.auto_commit {
            self.commit()
        } else {
            Ok(())
        }
    }
}
