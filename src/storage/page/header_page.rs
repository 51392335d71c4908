use crate::common::{PageId, Result, StrataError, PAGE_SIZE};

const RECORD_COUNT_OFFSET: usize = 0;
const RECORDS_OFFSET: usize = 4;

const NAME_LEN_SIZE: usize = 2;
const ROOT_ID_SIZE: usize = 4;

/// Read-only view of the header page (page 0).
///
/// The page stores a `u32` record count followed by packed variable-length
/// records `[name_len: u16][name][root_page_id: u32]`, one per index. A page
/// of zeros is a valid empty header, which is how a fresh database file
/// bootstraps without an explicit format step.
pub struct HeaderPageRef<'a> {
    data: &'a [u8],
}

impl<'a> HeaderPageRef<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        assert_eq!(data.len(), PAGE_SIZE);
        Self { data }
    }

    pub fn record_count(&self) -> u32 {
        read_u32(self.data, RECORD_COUNT_OFFSET)
    }

    /// Returns the root page id recorded for the given index name.
    pub fn get_root_id(&self, name: &str) -> Option<PageId> {
        find_record(self.data, name).map(|(_, root_offset)| PageId::new(read_u32(self.data, root_offset)))
    }
}

/// Mutable view of the header page.
pub struct HeaderPage<'a> {
    data: &'a mut [u8],
}

impl<'a> HeaderPage<'a> {
    pub fn new(data: &'a mut [u8]) -> Self {
        assert_eq!(data.len(), PAGE_SIZE);
        Self { data }
    }

    pub fn record_count(&self) -> u32 {
        read_u32(self.data, RECORD_COUNT_OFFSET)
    }

    pub fn get_root_id(&self, name: &str) -> Option<PageId> {
        find_record(self.data, name).map(|(_, root_offset)| PageId::new(read_u32(self.data, root_offset)))
    }

    /// Appends a record for a new index. Fails if the page has no room.
    /// The caller is responsible for not inserting a duplicate name.
    pub fn insert_record(&mut self, name: &str, root_page_id: PageId) -> Result<()> {
        debug_assert!(self.get_root_id(name).is_none(), "duplicate index record");

        let end = records_end(self.data);
        let needed = NAME_LEN_SIZE + name.len() + ROOT_ID_SIZE;
        if end + needed > PAGE_SIZE {
            return Err(StrataError::HeaderPageFull);
        }

        write_u16(self.data, end, name.len() as u16);
        self.data[end + NAME_LEN_SIZE..end + NAME_LEN_SIZE + name.len()]
            .copy_from_slice(name.as_bytes());
        write_u32(self.data, end + NAME_LEN_SIZE + name.len(), root_page_id.as_u32());

        let count = self.record_count() + 1;
        write_u32(self.data, RECORD_COUNT_OFFSET, count);
        Ok(())
    }

    /// Updates an existing record in place. Returns false if absent.
    pub fn update_record(&mut self, name: &str, root_page_id: PageId) -> bool {
        match find_record(self.data, name) {
            Some((_, root_offset)) => {
                write_u32(self.data, root_offset, root_page_id.as_u32());
                true
            }
            None => false,
        }
    }

    /// Inserts the record, or updates it if the name is already present.
    pub fn upsert_record(&mut self, name: &str, root_page_id: PageId) -> Result<()> {
        if self.update_record(name, root_page_id) {
            Ok(())
        } else {
            self.insert_record(name, root_page_id)
        }
    }

    /// Removes a record, compacting the ones after it. Returns false if
    /// absent.
    pub fn delete_record(&mut self, name: &str) -> bool {
        match find_record(self.data, name) {
            Some((record_offset, root_offset)) => {
                let record_end = root_offset + ROOT_ID_SIZE;
                let tail_end = records_end(self.data);
                self.data.copy_within(record_end..tail_end, record_offset);
                self.data[tail_end - (record_end - record_offset)..tail_end].fill(0);

                let count = self.record_count() - 1;
                write_u32(self.data, RECORD_COUNT_OFFSET, count);
                true
            }
            None => false,
        }
    }
}

/// Walks the records, returning (record_offset, root_id_offset) for `name`.
fn find_record(data: &[u8], name: &str) -> Option<(usize, usize)> {
    let count = read_u32(data, RECORD_COUNT_OFFSET);
    let mut offset = RECORDS_OFFSET;
    for _ in 0..count {
        let name_len = read_u16(data, offset) as usize;
        let name_start = offset + NAME_LEN_SIZE;
        let record_name = &data[name_start..name_start + name_len];
        if record_name == name.as_bytes() {
            return Some((offset, name_start + name_len));
        }
        offset = name_start + name_len + ROOT_ID_SIZE;
    }
    None
}

/// Byte offset one past the last record.
fn records_end(data: &[u8]) -> usize {
    let count = read_u32(data, RECORD_COUNT_OFFSET);
    let mut offset = RECORDS_OFFSET;
    for _ in 0..count {
        let name_len = read_u16(data, offset) as usize;
        offset += NAME_LEN_SIZE + name_len + ROOT_ID_SIZE;
    }
    offset
}

fn read_u16(data: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes(data[offset..offset + 2].try_into().unwrap())
}

fn write_u16(data: &mut [u8], offset: usize, value: u16) {
    data[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

fn read_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(data[offset..offset + 4].try_into().unwrap())
}

fn write_u32(data: &mut [u8], offset: usize, value: u32) {
    data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}
