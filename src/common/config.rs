use crate::common::{CannonError, Result};

/// Default size of a page in bytes (8 KiB)
pub const DEFAULT_PAGE_SIZE: u32 = 8192;

/// Smallest supported page size
pub const MIN_PAGE_SIZE: u32 = 512;

/// Largest supported page size
pub const MAX_PAGE_SIZE: u32 = 65536;

/// Default cap on an encoded key, in bytes
pub const DEFAULT_MAX_KEY_SIZE: u32 = 32;

/// Default cap on an encoded value, in bytes
pub const DEFAULT_MAX_VALUE_SIZE: u32 = 256;

/// Default page cache capacity (number of pages)
pub const DEFAULT_CACHE_SIZE: usize = 512;

/// Database configuration.
///
/// `page_size`, `max_key_size` and `max_value_size` are fixed at database
/// creation and persisted in the file header; on reopen the header wins
/// for the size caps, while a `page_size` mismatch fails the open.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Size of a page in bytes. Power of two, 512..=65536.
    pub page_size: u32,
    /// Maximum encoded key size in bytes.
    pub max_key_size: u32,
    /// Maximum encoded value size in bytes.
    pub max_value_size: u32,
    /// Page cache capacity in pages.
    pub cache_size: usize,
    /// Back the database with a growable in-memory buffer instead of files.
    pub in_memory: bool,
    /// Commit after every mutating operation.
    pub auto_commit: bool,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            max_key_size: DEFAULT_MAX_KEY_SIZE,
            max_value_size: DEFAULT_MAX_VALUE_SIZE,
            cache_size: DEFAULT_CACHE_SIZE,
            in_memory: false,
            auto_commit: true,
        }
    }
}

impl DbConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.page_size.is_power_of_two() {
            return Err(CannonError::InvalidConfig(format!(
                "page size {} is not a power of two",
                self.page_size
            )));
        }
        if self.page_size < MIN_PAGE_SIZE || self.page_size > MAX_PAGE_SIZE {
            return Err(CannonError::InvalidConfig(format!(
                "page size {} outside {}..={}",
                self.page_size, MIN_PAGE_SIZE, MAX_PAGE_SIZE
            )));
        }
        if self.max_key_size == 0 || self.max_value_size == 0 {
            return Err(CannonError::InvalidConfig(
                "key and value size caps must be non-zero".to_string(),
            ));
        }
        if self.cache_size == 0 {
            return Err(CannonError::InvalidConfig(
                "cache size must be at least one page".to_string(),
            ));
        }
        Ok(())
    }
}
