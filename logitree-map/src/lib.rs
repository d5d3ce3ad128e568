//! Concurrent ordered maps over `i32` keys, backed by lock-coupled trees
//! augmented with a logical ordering linked list.
//!
//! Two variants are provided:
//!
//! - [`BstMap`] — an unbalanced binary search tree. Simpler, no
//!   rebalancing; degrades to a linked list under adversarial (e.g.
//!   sorted) insertion order.
//! - [`AvlMap`] — a relaxed-balance AVL tree. Every insert/delete walks up
//!   the ancestor chain repairing balance; concurrent readers may briefly
//!   observe an unbalanced subtree mid-repair.
//!
//! Both support the same operations — `lookup`, `insert`, `delete`,
//! `validate`, `warmup` — and the same concurrency protocol: lookups walk
//! the tree unsynchronized and correct against the `pred`/`succ` chain;
//! mutators take a validation latch on the target's logical predecessor
//! (and, for delete, successor) before touching any tree pointer.
//!
//! # Example
//!
//! ```
//! use logitree_map::BstMap;
//!
//! let map: BstMap<&str> = BstMap::new();
//! assert!(map.insert(5, "five").unwrap());
//! assert!(map.lookup(5).unwrap());
//! assert!(map.delete(5).unwrap());
//! assert!(!map.lookup(5).unwrap());
//! ```

pub mod avl;
pub mod bst;
pub mod config;

pub use avl::AvlMap;
pub use bst::BstMap;
pub use logitree_core::{Error, Result, ValidationReport, MAX_KEY, MIN_KEY};
