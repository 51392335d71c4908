use crate::common::Result;

/// Write-ahead log hook consumed by the buffer pool.
///
/// When a log manager is registered, the pool calls `flush` before any dirty
/// frame is written back, so that log records covering the page's mutations
/// reach stable storage first. The core neither produces nor interprets log
/// records; higher layers own the log's contents.
pub trait LogManager: Send + Sync {
    /// Flushes all buffered log records to stable storage.
    fn flush(&self) -> Result<()>;
}
