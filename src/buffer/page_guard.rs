use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::{RwLockReadGuard, RwLockWriteGuard};

use crate::common::{PageId, PAGE_SIZE};

use super::buffer_pool_manager::PoolState;
use super::FrameHeader;

/// RAII guard for read access to a page.
///
/// Holds one pin and the page latch in read mode. Dropping the guard
/// releases the latch and then unpins the page.
pub struct ReadPageGuard {
    page_id: PageId,
    state: Arc<PoolState>,
    /// Keeps the frame alive for the transmuted latch guard below
    _frame: Arc<FrameHeader>,
    data: Option<RwLockReadGuard<'static, Box<[u8; PAGE_SIZE]>>>,
}

impl ReadPageGuard {
    pub(crate) fn new(page_id: PageId, frame: Arc<FrameHeader>, state: Arc<PoolState>) -> Self {
        let data = frame.data.read();
        // The latch guard borrows the frame, which the Arc keeps alive for
        // the guard's whole lifetime, so extending to 'static is sound.
        let data: RwLockReadGuard<'static, Box<[u8; PAGE_SIZE]>> =
            unsafe { std::mem::transmute(data) };

        Self {
            page_id,
            state,
            _frame: frame,
            data: Some(data),
        }
    }

    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    pub fn data(&self) -> &[u8] {
        &self.data.as_ref().unwrap()[..]
    }
}

impl Deref for ReadPageGuard {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.data()
    }
}

impl Drop for ReadPageGuard {
    fn drop(&mut self) {
        // Latch before pin: once the pin drops the frame may be evicted.
        self.data.take();
        self.state.unpin_page(self.page_id, false);
    }
}

/// RAII guard for write access to a page.
///
/// Holds one pin and the page latch in write mode. Taking a mutable view of
/// the data records a dirty verdict which is OR-ed into the frame when the
/// guard drops.
pub struct WritePageGuard {
    page_id: PageId,
    state: Arc<PoolState>,
    _frame: Arc<FrameHeader>,
    data: Option<RwLockWriteGuard<'static, Box<[u8; PAGE_SIZE]>>>,
    is_dirty: bool,
}

impl WritePageGuard {
    pub(crate) fn new(page_id: PageId, frame: Arc<FrameHeader>, state: Arc<PoolState>) -> Self {
        let data = frame.data.write();
        let data: RwLockWriteGuard<'static, Box<[u8; PAGE_SIZE]>> =
            unsafe { std::mem::transmute(data) };

        Self {
            page_id,
            state,
            _frame: frame,
            data: Some(data),
            is_dirty: false,
        }
    }

    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    pub fn data(&self) -> &[u8] {
        &self.data.as_ref().unwrap()[..]
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        self.is_dirty = true;
        &mut self.data.as_mut().unwrap()[..]
    }
}

impl Deref for WritePageGuard {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.data()
    }
}

impl DerefMut for WritePageGuard {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.data_mut()
    }
}

impl Drop for WritePageGuard {
    fn drop(&mut self) {
        self.data.take();
        self.state.unpin_page(self.page_id, self.is_dirty);
    }
}
