use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender};

use crate::common::{PageId, Result, StrataError, PAGE_SIZE};

use super::DiskManager;

/// A disk I/O request with an owned buffer and a completion channel.
enum DiskRequest {
    Read {
        page_id: PageId,
        done: mpsc::Sender<Result<Box<[u8; PAGE_SIZE]>>>,
    },
    Write {
        page_id: PageId,
        data: Box<[u8; PAGE_SIZE]>,
        done: mpsc::Sender<Result<()>>,
    },
}

/// DiskScheduler funnels page I/O through a background worker thread fed by
/// a bounded channel. The synchronous entry points block until the worker
/// signals completion, preserving the disk manager's synchronous contract.
pub struct DiskScheduler {
    disk_manager: Arc<DiskManager>,
    sender: Option<Sender<DiskRequest>>,
    worker: Option<JoinHandle<()>>,
}

impl DiskScheduler {
    pub fn new(disk_manager: Arc<DiskManager>) -> Self {
        let (sender, receiver) = bounded::<DiskRequest>(128);

        let dm = Arc::clone(&disk_manager);
        let worker = thread::spawn(move || Self::run_worker(dm, receiver));

        Self {
            disk_manager,
            sender: Some(sender),
            worker: Some(worker),
        }
    }

    /// Reads a page and blocks until the worker completes it.
    pub fn schedule_read_sync(&self, page_id: PageId, data: &mut [u8]) -> Result<()> {
        assert_eq!(data.len(), PAGE_SIZE);

        let (done, ready) = mpsc::channel();
        self.submit(DiskRequest::Read { page_id, done })?;

        let buf = ready
            .recv()
            .map_err(|e| StrataError::DiskScheduler(format!("worker dropped request: {}", e)))??;
        data.copy_from_slice(&buf[..]);
        Ok(())
    }

    /// Writes a page and blocks until the worker completes it.
    pub fn schedule_write_sync(&self, page_id: PageId, data: &[u8]) -> Result<()> {
        assert_eq!(data.len(), PAGE_SIZE);

        let mut buf = Box::new([0u8; PAGE_SIZE]);
        buf.copy_from_slice(data);

        let (done, ready) = mpsc::channel();
        self.submit(DiskRequest::Write {
            page_id,
            data: buf,
            done,
        })?;

        ready
            .recv()
            .map_err(|e| StrataError::DiskScheduler(format!("worker dropped request: {}", e)))?
    }

    pub fn disk_manager(&self) -> &Arc<DiskManager> {
        &self.disk_manager
    }

    fn submit(&self, request: DiskRequest) -> Result<()> {
        self.sender
            .as_ref()
            .expect("scheduler shut down")
            .send(request)
            .map_err(|e| StrataError::DiskScheduler(format!("failed to submit request: {}", e)))
    }

    /// Worker loop: drains requests until the scheduler drops its sender.
    fn run_worker(disk_manager: Arc<DiskManager>, receiver: Receiver<DiskRequest>) {
        while let Ok(request) = receiver.recv() {
            match request {
                DiskRequest::Read { page_id, done } => {
                    let mut buf = Box::new([0u8; PAGE_SIZE]);
                    let result = disk_manager
                        .read_page(page_id, &mut buf[..])
                        .map(move |_| buf);
                    let _ = done.send(result);
                }
                DiskRequest::Write {
                    page_id,
                    data,
                    done,
                } => {
                    let _ = done.send(disk_manager.write_page(page_id, &data[..]));
                }
            }
        }
    }
}

impl Drop for DiskScheduler {
    fn drop(&mut self) {
        // Disconnecting the channel lets the worker drain and exit.
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_read_write_through_worker() {
        let temp = NamedTempFile::new().unwrap();
        let dm = Arc::new(DiskManager::new(temp.path()).unwrap());
        let scheduler = DiskScheduler::new(dm);

        let page_id = scheduler.disk_manager().allocate_page().unwrap();

        let mut data = [0u8; PAGE_SIZE];
        data[0] = 42;
        data[100] = 255;
        scheduler.schedule_write_sync(page_id, &data).unwrap();

        let mut read_back = [0u8; PAGE_SIZE];
        scheduler
            .schedule_read_sync(page_id, &mut read_back)
            .unwrap();
        assert_eq!(read_back[0], 42);
        assert_eq!(read_back[100], 255);
    }

    #[test]
    fn test_interleaved_requests() {
        let temp = NamedTempFile::new().unwrap();
        let dm = Arc::new(DiskManager::new(temp.path()).unwrap());
        let scheduler = DiskScheduler::new(dm);

        let p1 = scheduler.disk_manager().allocate_page().unwrap();
        let p2 = scheduler.disk_manager().allocate_page().unwrap();

        scheduler.schedule_write_sync(p1, &[1u8; PAGE_SIZE]).unwrap();
        scheduler.schedule_write_sync(p2, &[2u8; PAGE_SIZE]).unwrap();

        let mut b1 = [0u8; PAGE_SIZE];
        let mut b2 = [0u8; PAGE_SIZE];
        scheduler.schedule_read_sync(p1, &mut b1).unwrap();
        scheduler.schedule_read_sync(p2, &mut b2).unwrap();
        assert_eq!(b1[0], 1);
        assert_eq!(b2[0], 2);
    }
}
