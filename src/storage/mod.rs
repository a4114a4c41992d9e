//! Page-granular storage: the pager over the main file and the
//! write-ahead log beside it.

pub mod pager;
pub mod wal;

pub use pager::Pager;
pub use wal::Wal;
