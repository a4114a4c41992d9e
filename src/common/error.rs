use thiserror::Error;

/// Database error types
#[derive(Error, Debug)]
pub enum CannonError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("key not found")]
    NotFound,

    #[error("duplicate key")]
    DuplicateKey,

    #[error("encoded {kind} is {size} bytes, limit is {limit}")]
    EncodingTooLarge {
        kind: &'static str,
        size: usize,
        limit: usize,
    },

    #[error("invalid encoding: {0}")]
    InvalidEncoding(String),

    #[error("incompatible database file: {0}")]
    IncompatibleFile(String),

    #[error("page size cannot hold at least 3 maximum-size entries")]
    ConfigTooTight,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("corrupt write-ahead log: {0}")]
    CorruptWal(String),

    #[error("database file is locked by another handle")]
    AlreadyOpen,

    #[error("handle is poisoned by a previous I/O failure")]
    Poisoned,
}

impl CannonError {
    /// Whether this error leaves the handle in an unusable state.
    /// Logical errors surface to the caller and the handle stays healthy;
    /// storage-level failures poison it until close.
    pub fn poisons(&self) -> bool {
        matches!(
            self,
            CannonError::Io(_) | CannonError::InvalidEncoding(_) | CannonError::CorruptWal(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, CannonError>;
