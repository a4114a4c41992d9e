//! B-tree index over encoded keys.

pub mod btree;
pub mod node;

pub use btree::BTree;
pub use node::{tree_order, Entry, Node};
