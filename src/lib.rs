//! Strata - the storage engine core of a disk-oriented RDBMS, in Rust.
//!
//! The crate is a four-layer stack. Each layer only sees the one below it:
//!
//! - **Container** (`container`): a concurrent extendible hash table, used
//!   by the buffer pool as its `page_id -> frame_id` directory.
//! - **Buffer pool** (`buffer`): a fixed array of page frames with LRU-K
//!   replacement (`LruKReplacer`) and RAII page guards
//!   (`ReadPageGuard`/`WritePageGuard`) that pair every fetch with exactly
//!   one unpin.
//! - **Storage** (`storage`): the single-file `DiskManager`, the
//!   channel-fed `DiskScheduler` worker, the `LogManager` WAL hook, and the
//!   header page holding `(index name, root page id)` records.
//! - **Index** (`index`): a disk-resident B+Tree with latch-coupled
//!   concurrent reads and writes, plus a pinned-leaf forward iterator.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use strata::buffer::BufferPoolManager;
//! use strata::common::{PageId, RecordId, SlotId};
//! use strata::index::BPlusTree;
//! use strata::storage::disk::DiskManager;
//!
//! let disk_manager = Arc::new(DiskManager::new("test.db").unwrap());
//! let bpm = Arc::new(BufferPoolManager::new(100, 2, disk_manager));
//!
//! let tree = BPlusTree::new("orders_pk", Arc::clone(&bpm));
//! let rid = RecordId::new(PageId::new(100), SlotId::new(0));
//! tree.insert(42, rid).unwrap();
//! assert_eq!(tree.get_value(42).unwrap(), Some(rid));
//!
//! for entry in tree.iter().unwrap() {
//!     let (key, rid) = entry.unwrap();
//!     println!("{} -> {:?}", key, rid);
//! }
//! ```

pub mod buffer;
pub mod common;
pub mod container;
pub mod index;
pub mod storage;

// Re-export commonly used types at the crate root
pub use common::{PageId, RecordId, Result, SlotId, StrataError};
