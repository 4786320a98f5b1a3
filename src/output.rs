//! Record sinks for miner output.
//!
//! Miners emit whole records (announcements, shares, or 16-byte pointer
//! records) to one or more sinks; routing by hash happens at the call site.
//! The sink is a trait so tests can collect records in memory instead of
//! standing up file descriptors.

use crate::protocol::FindRecord;
use parking_lot::Mutex;
use std::fs::File;
use std::io::{self, Write};

pub trait RecordSink: Send + Sync {
    /// Write one record in full. Implementations must not interleave
    /// records from concurrent writers or report success on a short write.
    fn write_record(&self, record: &[u8]) -> io::Result<()>;
}

impl<T: RecordSink + ?Sized> RecordSink for std::sync::Arc<T> {
    fn write_record(&self, record: &[u8]) -> io::Result<()> {
        (**self).write_record(record)
    }
}

/// File-backed sink. `write_all` keeps retrying short writes, which is the
/// whole-record discipline downstream consumers rely on.
pub struct FileSink {
    file: Mutex<File>,
}

impl FileSink {
    pub fn new(file: File) -> Self {
        FileSink { file: Mutex::new(file) }
    }
}

impl RecordSink for FileSink {
    fn write_record(&self, record: &[u8]) -> io::Result<()> {
        let mut file = self.file.lock();
        file.write_all(record)
    }
}

/// In-memory sink for tests and same-process consumers.
#[derive(Default)]
pub struct MemorySink {
    records: Mutex<Vec<Vec<u8>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        MemorySink::default()
    }

    pub fn records(&self) -> Vec<Vec<u8>> {
        self.records.lock().clone()
    }

    pub fn take(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.records.lock())
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

impl RecordSink for MemorySink {
    fn write_record(&self, record: &[u8]) -> io::Result<()> {
        self.records.lock().push(record.to_vec());
        Ok(())
    }
}

/// Encode a pointer record for in-process handoff. The buffer is leaked;
/// the consumer on the other end of the pipe owns reconstructing and
/// freeing it (`Box::from_raw` over `ptr` with the known allocation size).
pub fn pointer_record(buf: Vec<u8>, size: u64) -> [u8; 16] {
    let leaked: &'static mut [u8] = Box::leak(buf.into_boxed_slice());
    FindRecord { ptr: leaked.as_mut_ptr() as usize as u64, size }.to_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_sink_collects_whole_records() {
        let sink = MemorySink::new();
        sink.write_record(b"abc").expect("write");
        sink.write_record(b"defg").expect("write");
        assert_eq!(sink.records(), vec![b"abc".to_vec(), b"defg".to_vec()]);
        assert_eq!(sink.take().len(), 2);
        assert!(sink.is_empty());
    }

    #[test]
    fn test_pointer_record_addresses_the_content() {
        let rec = pointer_record(vec![1, 2, 3, 4], 4);
        let find = FindRecord::from_bytes(&rec);
        assert_eq!(find.size, 4);
        let slice = unsafe { std::slice::from_raw_parts(find.ptr as usize as *const u8, 4) };
        assert_eq!(slice, &[1, 2, 3, 4]);
        // reclaim so the test does not leak
        unsafe {
            drop(Box::from_raw(std::slice::from_raw_parts_mut(
                find.ptr as usize as *mut u8,
                4,
            )));
        }
    }

    #[test]
    fn test_file_sink_appends() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("out.bin");
        let sink = FileSink::new(File::create(&path).expect("create"));
        sink.write_record(&[9u8; 16]).expect("write");
        sink.write_record(&[7u8; 8]).expect("write");
        assert_eq!(std::fs::read(&path).expect("read").len(), 24);
    }
}
