use std::sync::Arc;

use crate::buffer::{BufferPoolManager, ReadPageGuard};
use crate::common::{RecordId, Result, INVALID_PAGE_ID};

use super::leaf_page::LeafPageRef;

/// Forward iterator over the leaf chain.
///
/// The iterator owns the read guard (pin + read latch) of its current leaf;
/// entries are read under that latch. Crossing to the next leaf releases the
/// current guard before fetching the neighbor, so a scan never holds two
/// leaf latches at once and cannot deadlock against structural writes. The
/// pin is released when the iterator is dropped.
pub struct IndexIterator {
    bpm: Arc<BufferPoolManager>,
    leaf: Option<ReadPageGuard>,
    index: usize,
}

impl IndexIterator {
    pub(crate) fn new(bpm: Arc<BufferPoolManager>, leaf: Option<ReadPageGuard>, index: usize) -> Self {
        Self { bpm, leaf, index }
    }

    pub(crate) fn end(bpm: Arc<BufferPoolManager>) -> Self {
        Self {
            bpm,
            leaf: None,
            index: 0,
        }
    }

    /// True once the iterator has run off the end of the leaf chain.
    pub fn is_end(&self) -> bool {
        self.leaf.is_none()
    }

    /// Moves the cursor onto a real entry, following next-leaf links past
    /// exhausted (or empty) leaves.
    fn settle(&mut self) -> Result<()> {
        loop {
            let (size, next) = match &self.leaf {
                None => return Ok(()),
                Some(guard) => {
                    let leaf = LeafPageRef::new(guard.data());
                    (leaf.size(), leaf.next_page_id())
                }
            };
            if self.index < size {
                return Ok(());
            }

            // Release the current leaf before latching its neighbor.
            self.leaf = None;
            if next == INVALID_PAGE_ID {
                return Ok(());
            }
            self.leaf = Some(self.bpm.read_page(next)?);
            self.index = 0;
        }
    }
}

impl Iterator for IndexIterator {
    type Item = Result<(u32, RecordId)>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Err(e) = self.settle() {
            self.leaf = None;
            return Some(Err(e));
        }
        let guard = self.leaf.as_ref()?;
        let entry = LeafPageRef::new(guard.data()).entry_at(self.index);
        self.index += 1;
        Some(Ok(entry))
    }
}
