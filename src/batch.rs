//! Atomic batched writes.
//!
//! A `WriteBatch` collects puts and deletes and applies them to the
//! memtable as one unit with consecutive sequence numbers. The batch keeps
//! its records in a single encoded buffer:
//!
//! ```text
//! +---------------+------------+---------------------------------+
//! | sequence (u64)| count (u32)| records ...                     |
//! +---------------+------------+---------------------------------+
//! record := 0x01 varint(klen) key varint(vlen) value   (put)
//!         | 0x00 varint(klen) key                      (delete)
//! ```
//!
//! The header's sequence is the number assigned to the first record; record
//! `i` commits at `sequence + i`.

use byteorder::{ByteOrder, LittleEndian};
use integer_encoding::VarInt;

use crate::error::{Error, Result};
use crate::key::{SequenceNumber, ValueType};
use crate::memtable::MemTable;

const HEADER_SIZE: usize = 12;

/// A collection of updates applied atomically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteBatch {
    rep: Vec<u8>,
}

impl Default for WriteBatch {
    fn default() -> Self {
        Self::new()
    }
}

impl WriteBatch {
    pub fn new() -> Self {
        Self {
            rep: vec![0u8; HEADER_SIZE],
        }
    }

    /// Queues a value write.
    pub fn put(&mut self, key: &[u8], value: &[u8]) {
        self.set_count(self.count() + 1);
        self.rep.push(ValueType::Value as u8);
        self.append_length_prefixed(key);
        self.append_length_prefixed(value);
    }

    /// Queues a tombstone.
    pub fn delete(&mut self, key: &[u8]) {
        self.set_count(self.count() + 1);
        self.rep.push(ValueType::Deletion as u8);
        self.append_length_prefixed(key);
    }

    /// Drops all queued updates.
    pub fn clear(&mut self) {
        self.rep.clear();
        self.rep.resize(HEADER_SIZE, 0);
    }

    /// Number of queued updates.
    pub fn count(&self) -> u32 {
        LittleEndian::read_u32(&self.rep[8..HEADER_SIZE])
    }

    /// Encoded size in bytes.
    pub fn approximate_size(&self) -> usize {
        self.rep.len()
    }

    /// Appends all of `other`'s records to this batch.
    pub fn append(&mut self, other: &WriteBatch) {
        self.set_count(self.count() + other.count());
        self.rep.extend_from_slice(&other.rep[HEADER_SIZE..]);
    }

    /// Invokes `handler(value_type, key, value)` for each record in commit
    /// order. Deletions pass `None` as the value.
    pub fn iterate(
        &self,
        mut handler: impl FnMut(ValueType, &[u8], Option<&[u8]>),
    ) -> Result<()> {
        if self.rep.len() < HEADER_SIZE {
            return Err(Error::Corruption("malformed write batch (too small)".into()));
        }
        let mut input = &self.rep[HEADER_SIZE..];
        let mut found = 0u32;
        while !input.is_empty() {
            let tag = input[0];
            input = &input[1..];
            match ValueType::try_from(tag)? {
                ValueType::Value => {
                    let key = Self::read_length_prefixed(&mut input)?;
                    let value = Self::read_length_prefixed(&mut input)?;
                    handler(ValueType::Value, key, Some(value));
                }
                ValueType::Deletion => {
                    let key = Self::read_length_prefixed(&mut input)?;
                    handler(ValueType::Deletion, key, None);
                }
            }
            found += 1;
        }
        if found != self.count() {
            return Err(Error::Corruption(format!(
                "write batch count mismatch: header {} actual {found}",
                self.count()
            )));
        }
        Ok(())
    }

    pub(crate) fn sequence(&self) -> SequenceNumber {
        LittleEndian::read_u64(&self.rep[0..8])
    }

    pub(crate) fn set_sequence(&mut self, seq: SequenceNumber) {
        LittleEndian::write_u64(&mut self.rep[0..8], seq);
    }

    /// Applies the batch to `mem`, assigning consecutive sequence numbers
    /// starting at the header sequence.
    pub(crate) fn insert_into(&self, mem: &MemTable) -> Result<()> {
        let mut seq = self.sequence();
        self.iterate(|t, key, value| {
            mem.add(seq, t, key, value.unwrap_or_default());
            seq += 1;
        })
    }

    fn set_count(&mut self, count: u32) {
        LittleEndian::write_u32(&mut self.rep[8..HEADER_SIZE], count);
    }

    fn append_length_prefixed(&mut self, data: &[u8]) {
        self.rep
            .extend_from_slice(&(data.len() as u64).encode_var_vec());
        self.rep.extend_from_slice(data);
    }

    fn read_length_prefixed<'a>(input: &mut &'a [u8]) -> Result<&'a [u8]> {
        let (len, read) = u64::decode_var(input)
            .ok_or_else(|| Error::Corruption("bad length prefix in write batch".into()))?;
        let len = len as usize;
        if input.len() < read + len {
            return Err(Error::Corruption("write batch record truncated".into()));
        }
        let data = &input[read..read + len];
        *input = &input[read + len..];
        Ok(data)
    }
}
