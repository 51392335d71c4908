mod btree;
mod btree_page;
mod internal_page;
mod iterator;
mod leaf_page;

pub use btree::BPlusTree;
pub use btree_page::{BTreePageRef, BTreePageType};
pub use internal_page::{InternalPage, InternalPageRef, INTERNAL_PAGE_CAPACITY};
pub use iterator::IndexIterator;
pub use leaf_page::{LeafPage, LeafPageRef, LEAF_PAGE_CAPACITY};
