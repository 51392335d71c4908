use std::sync::Arc;

use crate::buffer::{BufferPoolManager, ReadPageGuard, WritePageGuard};
use crate::common::{PageId, RecordId, Result, HEADER_PAGE_ID, INVALID_PAGE_ID};
use crate::storage::page::{HeaderPage, HeaderPageRef};

use super::btree_page::{write_page_id, BTreePageRef, PARENT_OFFSET};
use super::internal_page::{InternalPage, InternalPageRef, INTERNAL_PAGE_CAPACITY};
use super::iterator::IndexIterator;
use super::leaf_page::{LeafPage, LeafPageRef, LEAF_PAGE_CAPACITY};

/// Writes a node's parent pointer through its guard. The field sits at the
/// same offset for both node kinds.
fn set_parent(guard: &mut WritePageGuard, parent: PageId) {
    write_page_id(guard.data_mut(), PARENT_OFFSET, parent);
}

/// Disk-resident B+Tree index mapping u32 keys to record ids.
///
/// All page access goes through the buffer pool; pages refer to each other
/// only by id. The root page id is persisted in the header page (page 0)
/// under this tree's index name and is read under the header-page latch at
/// the start of every operation, which makes the tree `&self`-concurrent.
///
/// Concurrent access uses latch coupling. Readers crab down with read
/// latches, holding at most a parent/child pair at a time. Writers latch the
/// header page and the whole descent path with write latches, releasing all
/// strictly-ancestral latches as soon as the newly latched child is safe
/// (guaranteed not to split on insert, nor merge on remove).
pub struct BPlusTree {
    index_name: String,
    bpm: Arc<BufferPoolManager>,
    leaf_max_size: usize,
    internal_max_size: usize,
}

enum WriteOp {
    Insert,
    Remove,
}

impl BPlusTree {
    /// Creates a handle over the index named `index_name`. The tree itself
    /// materializes on first insert; opening an existing name attaches to
    /// its persisted root.
    pub fn new(index_name: impl Into<String>, bpm: Arc<BufferPoolManager>) -> Self {
        Self::with_max_sizes(index_name, bpm, LEAF_PAGE_CAPACITY, INTERNAL_PAGE_CAPACITY)
    }

    /// Like `new` with explicit node fan-outs; small values force deep trees
    /// in tests.
    pub fn with_max_sizes(
        index_name: impl Into<String>,
        bpm: Arc<BufferPoolManager>,
        leaf_max_size: usize,
        internal_max_size: usize,
    ) -> Self {
        assert!((2..=LEAF_PAGE_CAPACITY).contains(&leaf_max_size));
        assert!((3..=INTERNAL_PAGE_CAPACITY).contains(&internal_max_size));
        Self {
            index_name: index_name.into(),
            bpm,
            leaf_max_size,
            internal_max_size,
        }
    }

    pub fn name(&self) -> &str {
        &self.index_name
    }

    /// Root page id as currently persisted, INVALID_PAGE_ID when the tree
    /// has never been written.
    pub fn root_page_id(&self) -> Result<PageId> {
        let header = self.bpm.read_page(HEADER_PAGE_ID)?;
        Ok(self.read_root(header.data()))
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.root_page_id()? == INVALID_PAGE_ID)
    }

    fn read_root(&self, header_data: &[u8]) -> PageId {
        HeaderPageRef::new(header_data)
            .get_root_id(&self.index_name)
            .unwrap_or(INVALID_PAGE_ID)
    }

    /*****************************************************************
     * SEARCH
     *****************************************************************/

    /// Point lookup.
    pub fn get_value(&self, key: u32) -> Result<Option<RecordId>> {
        let leaf = match self.find_leaf_read(Some(key))? {
            Some(leaf) => leaf,
            None => return Ok(None),
        };
        Ok(LeafPageRef::new(leaf.data()).lookup(key))
    }

    /// Read-path descent: crab read latches down to the leaf covering `key`
    /// (or the leftmost leaf when `key` is None). Returns None on an empty
    /// tree.
    fn find_leaf_read(&self, key: Option<u32>) -> Result<Option<ReadPageGuard>> {
        let header = self.bpm.read_page(HEADER_PAGE_ID)?;
        let root_id = self.read_root(header.data());
        if root_id == INVALID_PAGE_ID {
            return Ok(None);
        }

        let mut node = self.bpm.read_page(root_id)?;
        drop(header);

        loop {
            if BTreePageRef::new(node.data()).is_leaf() {
                return Ok(Some(node));
            }
            let internal = InternalPageRef::new(node.data());
            let child_id = match key {
                Some(k) => internal.lookup(k),
                None => internal.leftmost_child(),
            };
            let child = self.bpm.read_page(child_id)?;
            node = child;
        }
    }

    /*****************************************************************
     * ITERATION
     *****************************************************************/

    /// Iterator over every entry in ascending key order.
    pub fn iter(&self) -> Result<IndexIterator> {
        match self.find_leaf_read(None)? {
            None => Ok(IndexIterator::end(Arc::clone(&self.bpm))),
            Some(leaf) => Ok(IndexIterator::new(Arc::clone(&self.bpm), Some(leaf), 0)),
        }
    }

    /// Iterator positioned at the first entry with key >= `key`.
    pub fn iter_from(&self, key: u32) -> Result<IndexIterator> {
        match self.find_leaf_read(Some(key))? {
            None => Ok(IndexIterator::end(Arc::clone(&self.bpm))),
            Some(leaf) => {
                let index = LeafPageRef::new(leaf.data()).key_index(key);
                Ok(IndexIterator::new(Arc::clone(&self.bpm), Some(leaf), index))
            }
        }
    }

    /*****************************************************************
     * INSERTION
     *****************************************************************/

    /// Inserts a key/value pair. Returns false (leaving the tree untouched)
    /// when the key is already present.
    pub fn insert(&self, key: u32, rid: RecordId) -> Result<bool> {
        let mut header = self.bpm.write_page(HEADER_PAGE_ID)?;
        let root_id = self.read_root(header.data());

        if root_id == INVALID_PAGE_ID {
            // Start a new tree while still holding the header latch.
            let (root_pid, mut root_guard) = self.bpm.new_page()?;
            let mut root =
                LeafPage::init(root_guard.data_mut(), root_pid, INVALID_PAGE_ID, self.leaf_max_size);
            root.insert(key, rid);
            HeaderPage::new(header.data_mut()).upsert_record(&self.index_name, root_pid)?;
            return Ok(true);
        }

        let mut ctx = self.find_leaf_write(header, root_id, key, WriteOp::Insert)?;
        let mut leaf_guard = ctx.pop().expect("write descent always ends at a leaf");

        let (duplicate, has_room) = {
            let leaf = LeafPageRef::new(leaf_guard.data());
            (leaf.lookup(key).is_some(), leaf.size() < leaf.max_size())
        };
        if duplicate {
            return Ok(false);
        }
        if has_room {
            LeafPage::new(leaf_guard.data_mut()).insert(key, rid);
            return Ok(true);
        }

        self.split_leaf_and_insert(&mut ctx, leaf_guard, key, rid)?;
        Ok(true)
    }

    /// Write-path descent from the root. Returns the retained latch stack:
    /// the header guard (while no safe node has been reached), every still-
    /// unsafe ancestor, and the leaf last.
    fn find_leaf_write(
        &self,
        header: WritePageGuard,
        root_id: PageId,
        key: u32,
        op: WriteOp,
    ) -> Result<Vec<WritePageGuard>> {
        let mut ctx = vec![header];
        let mut node_id = root_id;

        loop {
            let guard = self.bpm.write_page(node_id)?;
            let (is_leaf, is_safe, next_id) = {
                let page = BTreePageRef::new(guard.data());
                let is_root = page.parent_page_id() == INVALID_PAGE_ID;
                if page.is_leaf() {
                    let safe = match op {
                        // Will not split: stays clear of max even after one
                        // more entry
                        WriteOp::Insert => page.size() + 1 < page.max_size(),
                        // Will not merge: root leaves never do
                        WriteOp::Remove => is_root || page.size() > page.min_size(),
                    };
                    (true, safe, INVALID_PAGE_ID)
                } else {
                    let internal = InternalPageRef::new(guard.data());
                    let safe = match op {
                        WriteOp::Insert => page.size() < page.max_size(),
                        WriteOp::Remove => {
                            if is_root {
                                page.size() > 2
                            } else {
                                page.size() > page.min_size()
                            }
                        }
                    };
                    (false, safe, internal.lookup(key))
                }
            };

            ctx.push(guard);
            if is_safe {
                // This node absorbs any structural change from below, so
                // everything above it (header included) can go.
                ctx.drain(..ctx.len() - 1);
            }
            if is_leaf {
                return Ok(ctx);
            }
            node_id = next_id;
        }
    }

    /// Splits a full leaf and inserts the new entry into whichever half owns
    /// its key range, then propagates the new sibling's first key upward.
    fn split_leaf_and_insert(
        &self,
        ctx: &mut Vec<WritePageGuard>,
        mut leaf_guard: WritePageGuard,
        key: u32,
        rid: RecordId,
    ) -> Result<()> {
        let (new_pid, mut new_guard) = self.bpm.new_page()?;

        let sep_key = {
            let mut leaf = LeafPage::new(leaf_guard.data_mut());
            let moved = leaf.split_off_upper(leaf.size() - leaf.min_size());

            let mut new_leaf = LeafPage::init(
                new_guard.data_mut(),
                new_pid,
                leaf.parent_page_id(),
                self.leaf_max_size,
            );
            new_leaf.append_entries(&moved);
            new_leaf.set_next_page_id(leaf.next_page_id());
            leaf.set_next_page_id(new_pid);

            let sep_key = new_leaf.key_at(0);
            if key >= sep_key {
                new_leaf.insert(key, rid);
            } else {
                leaf.insert(key, rid);
            }
            sep_key
        };

        self.insert_into_parent(ctx, leaf_guard, sep_key, new_guard)
    }

    /// Links a freshly split-off `right` sibling into `left`'s parent,
    /// splitting upward as long as parents overflow. `ctx` ends with the
    /// parent of `left`, or with the header guard when `left` is the root.
    fn insert_into_parent(
        &self,
        ctx: &mut Vec<WritePageGuard>,
        mut left: WritePageGuard,
        key: u32,
        mut right: WritePageGuard,
    ) -> Result<()> {
        let top = ctx.last_mut().expect("split propagation lost its path");

        if top.page_id() == HEADER_PAGE_ID {
            // `left` was the root: grow the tree by one level.
            let (root_pid, mut root_guard) = self.bpm.new_page()?;
            InternalPage::init(
                root_guard.data_mut(),
                root_pid,
                INVALID_PAGE_ID,
                self.internal_max_size,
            )
            .populate_new_root(left.page_id(), key, right.page_id());

            set_parent(&mut left, root_pid);
            set_parent(&mut right, root_pid);
            HeaderPage::new(top.data_mut()).upsert_record(&self.index_name, root_pid)?;
            return Ok(());
        }

        let parent_pid = top.page_id();
        let has_room = {
            let parent = InternalPageRef::new(top.data());
            parent.size() < parent.max_size()
        };

        if has_room {
            InternalPage::new(top.data_mut()).insert_node_after(left.page_id(), key, right.page_id());
            set_parent(&mut right, parent_pid);
            return Ok(());
        }

        // Parent overflows: insert into the slack slot, split, recurse.
        let left_pid = left.page_id();
        let right_pid = right.page_id();
        let (promoted_key, sibling_leftmost, moved, parent_parent) = {
            let mut parent = InternalPage::new(top.data_mut());
            parent.insert_node_after(left_pid, key, right_pid);
            let (promoted, leftmost, moved) = parent.split_off_upper();
            (promoted, leftmost, moved, parent.parent_page_id())
        };

        let (sibling_pid, mut sibling_guard) = self.bpm.new_page()?;
        InternalPage::init(
            sibling_guard.data_mut(),
            sibling_pid,
            parent_parent,
            self.internal_max_size,
        )
        .receive_split(sibling_leftmost, &moved);

        // Reparent everything that moved under the sibling. `left`/`right`
        // may be among the movers and are already write-latched by us.
        set_parent(&mut right, parent_pid);
        let moved_children =
            std::iter::once(sibling_leftmost).chain(moved.iter().map(|&(_, child)| child));
        for child_pid in moved_children {
            if child_pid == left_pid {
                set_parent(&mut left, sibling_pid);
            } else if child_pid == right_pid {
                set_parent(&mut right, sibling_pid);
            } else {
                let mut child = self.bpm.write_page(child_pid)?;
                set_parent(&mut child, sibling_pid);
            }
        }
        drop(left);
        drop(right);

        let parent_guard = ctx.pop().expect("parent guard vanished mid-split");
        self.insert_into_parent(ctx, parent_guard, promoted_key, sibling_guard)
    }

    /*****************************************************************
     * DELETION
     *****************************************************************/

    /// Removes a key. Removing an absent key is a no-op.
    pub fn remove(&self, key: u32) -> Result<()> {
        let header = self.bpm.write_page(HEADER_PAGE_ID)?;
        let root_id = self.read_root(header.data());
        if root_id == INVALID_PAGE_ID {
            return Ok(());
        }

        let mut ctx = self.find_leaf_write(header, root_id, key, WriteOp::Remove)?;
        let mut leaf_guard = ctx.pop().expect("write descent always ends at a leaf");

        let (present, deficient) = {
            let leaf = LeafPageRef::new(leaf_guard.data());
            let present = leaf.lookup(key).is_some();
            let is_root = BTreePageRef::new(leaf_guard.data()).is_root();
            // Size after removal; the root may shrink arbitrarily
            (present, !is_root && leaf.size() - 1 < leaf.min_size())
        };
        if !present {
            return Ok(());
        }

        LeafPage::new(leaf_guard.data_mut()).remove(key);
        if !deficient {
            return Ok(());
        }

        let mut deleted = Vec::new();
        self.coalesce_or_redistribute(&mut ctx, leaf_guard, &mut deleted)?;
        drop(ctx);

        for page_id in deleted {
            let ok = self.bpm.delete_page(page_id)?;
            assert!(ok, "emptied tree page {} was still pinned", page_id);
        }
        Ok(())
    }

    /// Repairs a node that fell below minimum occupancy by borrowing from or
    /// merging with a sibling, recursing upward while parents become
    /// deficient. Pages emptied by merges are recorded in `deleted`.
    fn coalesce_or_redistribute(
        &self,
        ctx: &mut Vec<WritePageGuard>,
        mut node: WritePageGuard,
        deleted: &mut Vec<PageId>,
    ) -> Result<()> {
        let node_pid = node.page_id();

        let (node_index, sibling_index, sibling_pid) = {
            let parent_guard = ctx.last().expect("deficient node must have a latched parent");
            debug_assert_ne!(parent_guard.page_id(), HEADER_PAGE_ID);
            let parent = InternalPageRef::new(parent_guard.data());
            let idx = parent
                .value_index(node_pid)
                .expect("deficient node is not a child of its parent");
            // Prefer the left sibling; fall back to the right for the
            // leftmost child
            let sibling_idx = if idx > 0 { idx - 1 } else { 1 };
            (idx, sibling_idx, parent.value_at(sibling_idx))
        };
        let sibling_is_left = sibling_index < node_index;
        let mut sibling = self.bpm.write_page(sibling_pid)?;

        let node_is_leaf = BTreePageRef::new(node.data()).is_leaf();
        let (node_size, sibling_size, max_size) = {
            let n = BTreePageRef::new(node.data());
            let s = BTreePageRef::new(sibling.data());
            (n.size(), s.size(), s.max_size())
        };

        if node_size + sibling_size > max_size {
            // Redistribute: shift one entry across and fix the separator.
            if node_is_leaf {
                self.redistribute_leaf(ctx, &mut node, &mut sibling, node_index, sibling_index);
            } else {
                self.redistribute_internal(ctx, &mut node, &mut sibling, node_index, sibling_index)?;
            }
            return Ok(());
        }

        // Coalesce into the left of the two pages; the right one empties.
        if node_is_leaf {
            self.coalesce_leaf(ctx, &mut node, &mut sibling, node_index, sibling_index);
        } else {
            self.coalesce_internal(ctx, &mut node, &mut sibling, node_index, sibling_index)?;
        }
        if sibling_is_left {
            deleted.push(node_pid);
        } else {
            deleted.push(sibling_pid);
        }
        // Structural changes below this level are complete; release before
        // touching the parent so reparenting fetches cannot self-deadlock.
        drop(node);
        drop(sibling);

        let (parent_is_root, parent_size, parent_min) = {
            let parent_guard = ctx.last().expect("parent guard must outlive the merge");
            let parent = BTreePageRef::new(parent_guard.data());
            (parent.is_root(), parent.size(), parent.min_size())
        };

        if parent_is_root {
            if parent_size == 1 {
                self.promote_single_child(ctx, deleted)?;
            }
            return Ok(());
        }
        if parent_size < parent_min {
            let parent_guard = ctx.pop().expect("deficient parent must be latched");
            return self.coalesce_or_redistribute(ctx, parent_guard, deleted);
        }
        Ok(())
    }

    fn redistribute_leaf(
        &self,
        ctx: &mut Vec<WritePageGuard>,
        node: &mut WritePageGuard,
        sibling: &mut WritePageGuard,
        node_index: usize,
        sibling_index: usize,
    ) {
        let parent_guard = ctx.last_mut().expect("redistribution requires the parent");
        let mut parent = InternalPage::new(parent_guard.data_mut());
        let mut node_leaf = LeafPage::new(node.data_mut());
        let mut sibling_leaf = LeafPage::new(sibling.data_mut());

        if sibling_index < node_index {
            // Borrow the left sibling's largest entry
            let (key, rid) = sibling_leaf.pop_back();
            node_leaf.push_front(key, rid);
            parent.set_key_at(node_index, key);
        } else {
            // Borrow the right sibling's smallest entry
            let (key, rid) = sibling_leaf.pop_front();
            node_leaf.push_back(key, rid);
            parent.set_key_at(sibling_index, sibling_leaf.key_at(0));
        }
    }

    fn redistribute_internal(
        &self,
        ctx: &mut Vec<WritePageGuard>,
        node: &mut WritePageGuard,
        sibling: &mut WritePageGuard,
        node_index: usize,
        sibling_index: usize,
    ) -> Result<()> {
        let node_pid = node.page_id();
        let moved_child = {
            let parent_guard = ctx.last_mut().expect("redistribution requires the parent");
            let mut parent = InternalPage::new(parent_guard.data_mut());
            let mut node_page = InternalPage::new(node.data_mut());
            let mut sibling_page = InternalPage::new(sibling.data_mut());

            if sibling_index < node_index {
                // Rotate the left sibling's last child through the parent
                // separator
                let separator = parent.key_at(node_index);
                let (borrowed_key, borrowed_child) = sibling_page.pop_back();
                node_page.prepend_child(separator, borrowed_child);
                parent.set_key_at(node_index, borrowed_key);
                borrowed_child
            } else {
                // Rotate the right sibling's first child the other way
                let separator = parent.key_at(sibling_index);
                let (borrowed_child, freed_key) = sibling_page.pop_front_child();
                node_page.push_back(separator, borrowed_child);
                parent.set_key_at(sibling_index, freed_key);
                borrowed_child
            }
        };

        let mut child = self.bpm.write_page(moved_child)?;
        set_parent(&mut child, node_pid);
        Ok(())
    }

    /// Merges the right leaf of the (node, sibling) pair into the left one.
    fn coalesce_leaf(
        &self,
        ctx: &mut Vec<WritePageGuard>,
        node: &mut WritePageGuard,
        sibling: &mut WritePageGuard,
        node_index: usize,
        sibling_index: usize,
    ) {
        let parent_guard = ctx.last_mut().expect("coalesce requires the parent");
        let mut parent = InternalPage::new(parent_guard.data_mut());

        let (mut left, mut right, removed_slot) = if sibling_index < node_index {
            (
                LeafPage::new(sibling.data_mut()),
                LeafPage::new(node.data_mut()),
                node_index,
            )
        } else {
            (
                LeafPage::new(node.data_mut()),
                LeafPage::new(sibling.data_mut()),
                sibling_index,
            )
        };

        let entries = right.drain_all();
        left.append_entries(&entries);
        left.set_next_page_id(right.next_page_id());
        parent.remove_at(removed_slot);
    }

    /// Merges the right internal node of the pair into the left one, pulling
    /// the parent separator down between them and reparenting every moved
    /// child.
    fn coalesce_internal(
        &self,
        ctx: &mut Vec<WritePageGuard>,
        node: &mut WritePageGuard,
        sibling: &mut WritePageGuard,
        node_index: usize,
        sibling_index: usize,
    ) -> Result<()> {
        let node_pid = node.page_id();
        let sibling_pid = sibling.page_id();

        let (moved_children, survivor) = {
            let parent_guard = ctx.last_mut().expect("coalesce requires the parent");
            let mut parent = InternalPage::new(parent_guard.data_mut());

            let (mut left, mut right, removed_slot, survivor) = if sibling_index < node_index {
                (
                    InternalPage::new(sibling.data_mut()),
                    InternalPage::new(node.data_mut()),
                    node_index,
                    sibling_pid,
                )
            } else {
                (
                    InternalPage::new(node.data_mut()),
                    InternalPage::new(sibling.data_mut()),
                    sibling_index,
                    node_pid,
                )
            };

            let separator = parent.key_at(removed_slot);
            let (leftmost, rest) = right.drain_all();
            left.push_back(separator, leftmost);
            let mut moved = vec![leftmost];
            for (key, child) in rest {
                left.push_back(key, child);
                moved.push(child);
            }
            parent.remove_at(removed_slot);
            (moved, survivor)
        };

        for child_pid in moved_children {
            let mut child = self.bpm.write_page(child_pid)?;
            set_parent(&mut child, survivor);
        }
        Ok(())
    }

    /// The internal root is down to one child: that child becomes the new
    /// root and the old root page is discarded.
    fn promote_single_child(
        &self,
        ctx: &mut Vec<WritePageGuard>,
        deleted: &mut Vec<PageId>,
    ) -> Result<()> {
        let old_root = ctx.pop().expect("shrinking root must be latched");
        let old_root_pid = old_root.page_id();
        let child_pid = InternalPageRef::new(old_root.data()).value_at(0);
        drop(old_root);

        let mut child = self.bpm.write_page(child_pid)?;
        set_parent(&mut child, INVALID_PAGE_ID);
        drop(child);

        let header = ctx.last_mut().expect("root change requires the header latch");
        debug_assert_eq!(header.page_id(), HEADER_PAGE_ID);
        HeaderPage::new(header.data_mut()).upsert_record(&self.index_name, child_pid)?;

        deleted.push(old_root_pid);
        Ok(())
    }
}
