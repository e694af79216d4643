//! Bounded buffer of records awaiting the next sync.

use crate::sink::error::SinkError;
use bytes::Bytes;

#[derive(Debug, Clone)]
pub struct RecordBuffer {
    records: Vec<Bytes>,
    capacity: usize,
    pending_bytes: usize,
}

impl RecordBuffer {
    pub fn new(capacity: usize) -> Self {
        debug_assert!(capacity > 0, "buffer capacity must be positive");
        RecordBuffer {
            records: Vec::with_capacity(capacity),
            capacity,
            pending_bytes: 0,
        }
    }

    /// Buffer a record; a full buffer rejects it and stays unchanged
    pub fn push(&mut self, record: Bytes) -> Result<(), SinkError> {
        if self.is_full() {
            return Err(SinkError::CapacityExceeded {
                capacity: self.capacity,
            });
        }
        self.pending_bytes += record.len();
        self.records.push(record);
        Ok(())
    }

    pub fn records(&self) -> &[Bytes] {
        &self.records
    }

    pub fn iter(&self) -> impl Iterator<Item = &Bytes> {
        self.records.iter()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.records.len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Payload bytes of the buffered records (excluding framing)
    pub fn pending_bytes(&self) -> usize {
        self.pending_bytes
    }

    /// Drop every buffered record, keeping the allocation
    pub fn clear(&mut self) {
        self.records.clear();
        self.pending_bytes = 0;
    }
}
