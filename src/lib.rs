//! CannonDB - an embeddable, single-writer key-value store.
//!
//! Data lives in an on-disk B-tree of fixed-size pages, with a write-ahead
//! log providing crash-consistent durability and no server process in
//! sight. Keys and values are typed ([`Value`]): integers, floats, text,
//! UUIDs, and recursively nested maps and lists, all usable on either side
//! of a pair.
//!
//! # Architecture
//!
//! The engine is organized into layers, each reachable only through the
//! one above it:
//!
//! - **Value codec** (`value`): typed scalars and composites to/from
//!   tagged, self-delimiting bytes; keys compare directly on encoded form.
//! - **Storage** (`storage`): the `Pager` owns the main file (page I/O,
//!   header, free-page list); the `Wal` journals committed page images.
//! - **Buffer** (`buffer`): a bounded `PageCache` of decoded nodes with
//!   LRU eviction; dirty pages are pinned until commit.
//! - **Index** (`index`): the B-tree with split, borrow and merge.
//! - **Engine** (`engine`): [`CannonDb`] binds it all together and
//!   serializes operations behind one lock.
//!
//! # Example
//!
//! ```rust,no_run
//! use cannondb::{CannonDb, DbConfig, Value};
//!
//! let db = CannonDb::open("example.db", DbConfig::default())?;
//! db.insert(Value::from("pi"), Value::from(3.1415926), false)?;
//! db.insert(Value::from("n"), Value::from(42i64), false)?;
//! assert_eq!(db.get(&Value::from("n"))?, Value::from(42i64));
//! db.close()?;
//! # Ok::<(), cannondb::CannonError>(())
//! ```
//!
//! Mutations become durable at `commit` (automatic by default); `close`
//! commits, checkpoints the log into the main file, and releases the
//! handle. Dropping without `close` is equivalent to a crash: the next
//! open replays the log up to the last commit record.

pub mod buffer;
pub mod common;
pub mod engine;
pub mod index;
pub mod storage;
pub mod value;

// Re-export the public surface at the crate root
pub use common::{CannonError, DbConfig, PageId, Result};
pub use engine::{CannonDb, Stats};
pub use value::Value;
