use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;

use crate::common::{PageId, Result, HEADER_PAGE_ID, PAGE_SIZE};

/// DiskManager reads and writes fixed-size pages against a single database
/// file and hands out page ids from a monotonic counter.
///
/// Page 0 is reserved for the header page and is never returned by
/// `allocate_page`. Reads past the end of the file (including reads of pages
/// that were allocated but never written) return zeros, which is what lets
/// the buffer pool zero-initialize fresh pages without a disk round trip.
pub struct DiskManager {
    file: Mutex<File>,
    /// Allocation counter; also an upper bound on pages ever handed out
    next_page_id: AtomicU32,
    num_reads: AtomicU32,
    num_writes: AtomicU32,
}

impl DiskManager {
    /// Opens (or creates) the database file at the given path. Reopening an
    /// existing file resumes page allocation past its current size.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(db_path.as_ref())?;

        let pages_on_disk = (file.metadata()?.len() / PAGE_SIZE as u64) as u32;

        Ok(Self {
            file: Mutex::new(file),
            next_page_id: AtomicU32::new(pages_on_disk.max(HEADER_PAGE_ID.as_u32() + 1)),
            num_reads: AtomicU32::new(0),
            num_writes: AtomicU32::new(0),
        })
    }

    /// Reads a page into the provided PAGE_SIZE buffer, zero-filling any
    /// bytes past the end of the file.
    pub fn read_page(&self, page_id: PageId, data: &mut [u8]) -> Result<()> {
        assert_eq!(data.len(), PAGE_SIZE, "buffer must be PAGE_SIZE bytes");

        let offset = page_id.as_u32() as u64 * PAGE_SIZE as u64;
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;

        let mut filled = 0;
        while filled < PAGE_SIZE {
            let n = file.read(&mut data[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        data[filled..].fill(0);

        self.num_reads.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Writes a page from the provided PAGE_SIZE buffer.
    pub fn write_page(&self, page_id: PageId, data: &[u8]) -> Result<()> {
        assert_eq!(data.len(), PAGE_SIZE, "buffer must be PAGE_SIZE bytes");

        let offset = page_id.as_u32() as u64 * PAGE_SIZE as u64;
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        file.flush()?;

        self.num_writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Allocates a fresh page id. The page's contents read as zeros until
    /// first written.
    pub fn allocate_page(&self) -> Result<PageId> {
        Ok(PageId::new(self.next_page_id.fetch_add(1, Ordering::SeqCst)))
    }

    /// Releases a page id. Allocation is a monotonic counter, so this is
    /// bookkeeping only; the id is not recycled.
    pub fn deallocate_page(&self, _page_id: PageId) -> Result<()> {
        Ok(())
    }

    /// Number of pages handed out (including the reserved header page).
    pub fn num_pages(&self) -> u32 {
        self.next_page_id.load(Ordering::Relaxed)
    }

    pub fn num_reads(&self) -> u32 {
        self.num_reads.load(Ordering::Relaxed)
    }

    pub fn num_writes(&self) -> u32 {
        self.num_writes.load(Ordering::Relaxed)
    }

    /// Forces file contents to stable storage.
    pub fn sync(&self) -> Result<()> {
        self.file.lock().sync_all()?;
        Ok(())
    }
}

impl Drop for DiskManager {
    fn drop(&mut self) {
        let _ = self.file.get_mut().sync_all();
    }
}
