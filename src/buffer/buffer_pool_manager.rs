use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::common::{
    FrameId, PageId, Result, StrataError, DEFAULT_BUCKET_SIZE, INVALID_PAGE_ID, PAGE_SIZE,
};
use crate::container::ExtendibleHashTable;
use crate::storage::disk::{DiskManager, DiskScheduler};
use crate::storage::LogManager;

use super::{FrameHeader, LruKReplacer, ReadPageGuard, WritePageGuard};

/// State protected by the pool mutex
struct PoolInner {
    /// Page table: maps resident page IDs to frame IDs
    page_table: ExtendibleHashTable<PageId, FrameId>,
    /// Frames not bound to any page
    free_list: VecDeque<FrameId>,
}

/// Shared pool state. Page guards hold an `Arc` to this so they can unpin
/// on drop without referencing the manager itself.
pub(crate) struct PoolState {
    frames: Vec<Arc<FrameHeader>>,
    /// Coarse mutex serializing all frame-state transitions. Held across
    /// eviction I/O, which intentionally synchronizes eviction and fetch.
    inner: Mutex<PoolInner>,
    replacer: LruKReplacer,
    disk_scheduler: DiskScheduler,
    log_manager: Option<Arc<dyn LogManager>>,
}

impl PoolState {
    /// Decrements a page's pin count, OR-ing in the dirty verdict. The frame
    /// becomes evictable when the count reaches zero. Returns false if the
    /// page is not resident or was not pinned.
    pub(crate) fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> bool {
        let inner = self.inner.lock();
        let frame_id = match inner.page_table.find(&page_id) {
            Some(f) => f,
            None => return false,
        };
        let frame = &self.frames[frame_id.as_usize()];
        if frame.pin_count() == 0 {
            return false;
        }
        if is_dirty {
            frame.set_dirty(true);
        }
        if frame.unpin() == Some(0) {
            self.replacer.set_evictable(frame_id, true);
        }
        true
    }

    /// Binds a frame for reuse: free list first, else evict a victim,
    /// writing it back (through the WAL hook) if dirty.
    fn acquire_frame(&self, inner: &mut PoolInner) -> Result<FrameId> {
        if let Some(frame_id) = inner.free_list.pop_front() {
            return Ok(frame_id);
        }

        let frame_id = self.replacer.evict().ok_or(StrataError::BufferPoolFull)?;
        let frame = &self.frames[frame_id.as_usize()];
        let old_page_id = frame.page_id();

        if frame.is_dirty() {
            if let Some(log) = &self.log_manager {
                log.flush()?;
            }
            let mut data = [0u8; PAGE_SIZE];
            frame.copy_to(&mut data);
            self.disk_scheduler.schedule_write_sync(old_page_id, &data)?;
        }

        inner.page_table.remove(&old_page_id);
        frame.reset();
        Ok(frame_id)
    }

    /// Resolves a page to a pinned, non-evictable frame, reading it from
    /// disk on a miss.
    fn fetch_page(&self, page_id: PageId) -> Result<FrameId> {
        let mut inner = self.inner.lock();

        if let Some(frame_id) = inner.page_table.find(&page_id) {
            let frame = &self.frames[frame_id.as_usize()];
            frame.pin();
            self.replacer.record_access(frame_id);
            self.replacer.set_evictable(frame_id, false);
            return Ok(frame_id);
        }

        let frame_id = self.acquire_frame(&mut inner)?;
        let frame = &self.frames[frame_id.as_usize()];

        let mut data = [0u8; PAGE_SIZE];
        self.disk_scheduler.schedule_read_sync(page_id, &mut data)?;
        frame.copy_from(&data);
        frame.set_page_id(page_id);
        frame.set_dirty(false);
        frame.pin();

        inner.page_table.insert(page_id, frame_id);
        self.replacer.record_access(frame_id);
        self.replacer.set_evictable(frame_id, false);
        Ok(frame_id)
    }

    /// Writes a resident page to disk unconditionally, clearing its dirty
    /// flag. Returns false if the page is not resident.
    fn flush_frame(&self, page_id: PageId, frame_id: FrameId) -> Result<()> {
        let frame = &self.frames[frame_id.as_usize()];
        if frame.is_dirty() {
            if let Some(log) = &self.log_manager {
                log.flush()?;
            }
        }
        let mut data = [0u8; PAGE_SIZE];
        frame.copy_to(&mut data);
        self.disk_scheduler.schedule_write_sync(page_id, &data)?;
        frame.set_dirty(false);
        Ok(())
    }
}

/// BufferPoolManager mediates all page access: it owns a fixed array of
/// frames, maps disk pages to frames through an extendible hash table, and
/// evicts via the LRU-K replacer when the pool is full.
pub struct BufferPoolManager {
    pool_size: usize,
    state: Arc<PoolState>,
}

impl BufferPoolManager {
    pub fn new(pool_size: usize, replacer_k: usize, disk_manager: Arc<DiskManager>) -> Self {
        Self::build(pool_size, replacer_k, disk_manager, None)
    }

    /// Like `new`, but registers a WAL hook invoked before any dirty page is
    /// written back.
    pub fn with_log_manager(
        pool_size: usize,
        replacer_k: usize,
        disk_manager: Arc<DiskManager>,
        log_manager: Arc<dyn LogManager>,
    ) -> Self {
        Self::build(pool_size, replacer_k, disk_manager, Some(log_manager))
    }

    fn build(
        pool_size: usize,
        replacer_k: usize,
        disk_manager: Arc<DiskManager>,
        log_manager: Option<Arc<dyn LogManager>>,
    ) -> Self {
        let mut frames = Vec::with_capacity(pool_size);
        let mut free_list = VecDeque::with_capacity(pool_size);
        for i in 0..pool_size {
            let frame_id = FrameId::new(i as u32);
            frames.push(Arc::new(FrameHeader::new(frame_id)));
            free_list.push_back(frame_id);
        }

        let state = Arc::new(PoolState {
            frames,
            inner: Mutex::new(PoolInner {
                page_table: ExtendibleHashTable::new(DEFAULT_BUCKET_SIZE),
                free_list,
            }),
            replacer: LruKReplacer::new(replacer_k, pool_size),
            disk_scheduler: DiskScheduler::new(disk_manager),
            log_manager,
        });

        Self { pool_size, state }
    }

    /// Allocates a new page and returns it pinned once behind a write guard.
    /// The frame is zero-initialized; no disk read is issued for fresh pages.
    pub fn new_page(&self) -> Result<(PageId, WritePageGuard)> {
        let (page_id, frame) = {
            let mut inner = self.state.inner.lock();
            let frame_id = self.state.acquire_frame(&mut inner)?;

            let page_id = match self.state.disk_scheduler.disk_manager().allocate_page() {
                Ok(id) => id,
                Err(e) => {
                    inner.free_list.push_back(frame_id);
                    return Err(e);
                }
            };

            let frame = &self.state.frames[frame_id.as_usize()];
            frame.set_page_id(page_id);
            frame.pin();

            inner.page_table.insert(page_id, frame_id);
            self.state.replacer.record_access(frame_id);
            self.state.replacer.set_evictable(frame_id, false);
            (page_id, Arc::clone(frame))
        };

        // The guard adopts the pin taken above; latch acquisition happens
        // outside the pool mutex.
        let guard = WritePageGuard::new(page_id, frame, Arc::clone(&self.state));
        Ok((page_id, guard))
    }

    /// Fetches a page for shared access. The guard owns one pin and the
    /// page latch in read mode.
    pub fn read_page(&self, page_id: PageId) -> Result<ReadPageGuard> {
        if page_id == INVALID_PAGE_ID {
            return Err(StrataError::InvalidPageId(page_id));
        }
        let frame_id = self.state.fetch_page(page_id)?;
        let frame = Arc::clone(&self.state.frames[frame_id.as_usize()]);
        Ok(ReadPageGuard::new(page_id, frame, Arc::clone(&self.state)))
    }

    /// Fetches a page for exclusive access. The guard owns one pin and the
    /// page latch in write mode.
    pub fn write_page(&self, page_id: PageId) -> Result<WritePageGuard> {
        if page_id == INVALID_PAGE_ID {
            return Err(StrataError::InvalidPageId(page_id));
        }
        let frame_id = self.state.fetch_page(page_id)?;
        let frame = Arc::clone(&self.state.frames[frame_id.as_usize()]);
        Ok(WritePageGuard::new(page_id, frame, Arc::clone(&self.state)))
    }

    /// Explicit unpin, paired with a prior fetch. Guards route their drop
    /// through this.
    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> bool {
        self.state.unpin_page(page_id, is_dirty)
    }

    /// Writes a page to disk regardless of its dirty flag, clearing it.
    /// Returns false if the page is not resident.
    pub fn flush_page(&self, page_id: PageId) -> Result<bool> {
        if page_id == INVALID_PAGE_ID {
            return Err(StrataError::InvalidPageId(page_id));
        }
        let inner = self.state.inner.lock();
        match inner.page_table.find(&page_id) {
            Some(frame_id) => {
                self.state.flush_frame(page_id, frame_id)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Writes every resident page to disk.
    pub fn flush_all_pages(&self) -> Result<()> {
        let _inner = self.state.inner.lock();
        for frame in &self.state.frames {
            let page_id = frame.page_id();
            if page_id != INVALID_PAGE_ID {
                self.state.flush_frame(page_id, frame.frame_id())?;
            }
        }
        Ok(())
    }

    /// Removes a page from the pool and deallocates it on disk. Returns
    /// false if the page is pinned, true if it was deleted or not resident.
    pub fn delete_page(&self, page_id: PageId) -> Result<bool> {
        let mut inner = self.state.inner.lock();
        let frame_id = match inner.page_table.find(&page_id) {
            Some(f) => f,
            None => return Ok(true),
        };
        let frame = &self.state.frames[frame_id.as_usize()];
        if frame.pin_count() > 0 {
            return Ok(false);
        }

        inner.page_table.remove(&page_id);
        self.state.replacer.remove(frame_id);
        frame.reset();
        inner.free_list.push_back(frame_id);

        self.state
            .disk_scheduler
            .disk_manager()
            .deallocate_page(page_id)?;
        Ok(true)
    }

    /// Returns the pin count of a resident page, None otherwise.
    pub fn get_pin_count(&self, page_id: PageId) -> Option<u32> {
        let inner = self.state.inner.lock();
        inner
            .page_table
            .find(&page_id)
            .map(|frame_id| self.state.frames[frame_id.as_usize()].pin_count())
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    pub fn free_frame_count(&self) -> usize {
        self.state.inner.lock().free_list.len()
    }

    pub fn disk_manager(&self) -> &Arc<DiskManager> {
        self.state.disk_scheduler.disk_manager()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn create_bpm(pool_size: usize) -> (BufferPoolManager, NamedTempFile) {
        let temp_file = NamedTempFile::new().unwrap();
        let dm = Arc::new(DiskManager::new(temp_file.path()).unwrap());
        let bpm = BufferPoolManager::new(pool_size, 2, dm);
        (bpm, temp_file)
    }

    #[test]
    fn test_new_pool_starts_free() {
        let (bpm, _temp) = create_bpm(10);
        assert_eq!(bpm.pool_size(), 10);
        assert_eq!(bpm.free_frame_count(), 10);
    }

    #[test]
    fn test_new_page_is_pinned_once() {
        let (bpm, _temp) = create_bpm(10);

        let (page_id, guard) = bpm.new_page().unwrap();
        assert_eq!(page_id, PageId::new(1)); // page 0 is the header page
        assert_eq!(bpm.get_pin_count(page_id), Some(1));
        assert_eq!(bpm.free_frame_count(), 9);

        drop(guard);
        assert_eq!(bpm.get_pin_count(page_id), Some(0));
    }

    #[test]
    fn test_write_then_read() {
        let (bpm, _temp) = create_bpm(10);

        let (page_id, mut guard) = bpm.new_page().unwrap();
        guard.data_mut()[0] = 42;
        guard.data_mut()[100] = 255;
        drop(guard);

        let guard = bpm.read_page(page_id).unwrap();
        assert_eq!(guard.data()[0], 42);
        assert_eq!(guard.data()[100], 255);
    }

    #[test]
    fn test_unpin_page_contract() {
        let (bpm, _temp) = create_bpm(10);

        let (page_id, guard) = bpm.new_page().unwrap();
        drop(guard);

        // Already unpinned
        assert!(!bpm.unpin_page(page_id, false));
        // Not resident at all
        assert!(!bpm.unpin_page(PageId::new(999), false));

        let guard = bpm.read_page(page_id).unwrap();
        assert_eq!(bpm.get_pin_count(page_id), Some(1));
        drop(guard);
        assert_eq!(bpm.get_pin_count(page_id), Some(0));
    }

    #[test]
    fn test_flush_persists_bytes() {
        let (bpm, temp) = create_bpm(10);

        let (page_id, mut guard) = bpm.new_page().unwrap();
        guard.data_mut()[0] = 42;
        drop(guard);

        assert!(bpm.flush_page(page_id).unwrap());
        drop(bpm);

        let dm = Arc::new(DiskManager::new(temp.path()).unwrap());
        let bpm2 = BufferPoolManager::new(10, 2, dm);
        let guard = bpm2.read_page(page_id).unwrap();
        assert_eq!(guard.data()[0], 42);
    }

    #[test]
    fn test_eviction_round_trips_through_disk() {
        let (bpm, _temp) = create_bpm(3);

        let mut ids = Vec::new();
        for i in 0..3u8 {
            let (pid, mut guard) = bpm.new_page().unwrap();
            guard.data_mut()[0] = i;
            ids.push(pid);
        }
        assert_eq!(bpm.free_frame_count(), 0);

        // Evicts one of the unpinned pages
        let (_pid, guard) = bpm.new_page().unwrap();
        drop(guard);

        // Every original page is still readable, evicted or not
        for (i, pid) in ids.iter().enumerate() {
            let guard = bpm.read_page(*pid).unwrap();
            assert_eq!(guard.data()[0], i as u8);
        }
    }

    #[test]
    fn test_pool_exhaustion() {
        let (bpm, _temp) = create_bpm(2);

        let (_p1, _g1) = bpm.new_page().unwrap();
        let (_p2, _g2) = bpm.new_page().unwrap();

        assert!(matches!(bpm.new_page(), Err(StrataError::BufferPoolFull)));
    }

    #[test]
    fn test_delete_page() {
        let (bpm, _temp) = create_bpm(10);

        let (page_id, guard) = bpm.new_page().unwrap();

        // Pinned pages cannot be deleted
        assert!(!bpm.delete_page(page_id).unwrap());
        drop(guard);

        assert!(bpm.delete_page(page_id).unwrap());
        assert_eq!(bpm.get_pin_count(page_id), None);
        // Deleting a non-resident page is vacuously true
        assert!(bpm.delete_page(page_id).unwrap());
    }
}
