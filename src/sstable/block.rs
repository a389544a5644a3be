//! Data blocks: prefix-compressed runs of key/value entries with restart
//! points.
//!
//! ```text
//! +-------------------------------------------+
//! | entry 1 | entry 2 | ... | entry N         |
//! +-------------------------------------------+
//! | restart offsets (u32 each) | count (u32)  |
//! +-------------------------------------------+
//! entry := shared (u16) | unshared (u16) | vlen (u32) | key tail | value
//! ```
//!
//! Keys are internal keys; all ordering inside a block goes through the
//! internal-key comparator, never raw byte order.

use std::cmp::Ordering;
use std::io;
use std::sync::Arc;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Error, Result};
use crate::key::InternalKeyComparator;

const RESTART_INTERVAL: usize = 16;

/// Accumulates sorted entries into an encoded block.
pub struct BlockBuilder {
    buffer: Vec<u8>,
    restart_positions: Vec<u32>,
    entry_count: usize,
    last_key: Vec<u8>,
}

impl BlockBuilder {
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            restart_positions: Vec::new(),
            entry_count: 0,
            last_key: Vec::new(),
        }
    }

    /// Appends an entry. Keys must arrive in comparator order.
    pub fn add(&mut self, key: &[u8], value: &[u8]) {
        let shared = if self.entry_count % RESTART_INTERVAL == 0 {
            self.restart_positions.push(self.buffer.len() as u32);
            0
        } else {
            shared_prefix_length(&self.last_key, key)
        };
        let unshared = key.len() - shared;

        self.buffer.write_u16::<BigEndian>(shared as u16).unwrap();
        self.buffer.write_u16::<BigEndian>(unshared as u16).unwrap();
        self.buffer
            .write_u32::<BigEndian>(value.len() as u32)
            .unwrap();
        self.buffer.extend_from_slice(&key[shared..]);
        self.buffer.extend_from_slice(value);

        self.last_key.clear();
        self.last_key.extend_from_slice(key);
        self.entry_count += 1;
    }

    /// Seals the block, appending the restart array.
    pub fn finish(mut self) -> Vec<u8> {
        for pos in &self.restart_positions {
            self.buffer.write_u32::<BigEndian>(*pos).unwrap();
        }
        self.buffer
            .write_u32::<BigEndian>(self.restart_positions.len() as u32)
            .unwrap();
        self.buffer
    }

    /// Current encoded size, before the restart array.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn entry_count(&self) -> usize {
        self.entry_count
    }
}

impl Default for BlockBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn shared_prefix_length(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|&(a, b)| a == b).count()
}

/// A decoded, immutable block.
pub struct Block {
    data: Vec<u8>,
    restart_positions: Vec<u32>,
}

impl Block {
    pub fn new(data: Vec<u8>) -> Result<Self> {
        use std::io::Cursor;

        let data_len = data.len();
        if data_len < 4 {
            return Err(Error::Corruption("block too short".to_string()));
        }

        let num_restarts_offset = data_len - 4;
        let mut cursor = Cursor::new(&data[num_restarts_offset..]);
        let num_restarts = cursor.read_u32::<BigEndian>()? as usize;

        let restart_array_size = num_restarts * 4;
        if num_restarts_offset < restart_array_size {
            return Err(Error::Corruption(
                "block too short for restart array".to_string(),
            ));
        }

        let restart_array_offset = num_restarts_offset - restart_array_size;
        let mut cursor = Cursor::new(&data[restart_array_offset..num_restarts_offset]);
        let mut restart_positions = Vec::with_capacity(num_restarts);
        for _ in 0..num_restarts {
            restart_positions.push(cursor.read_u32::<BigEndian>()?);
        }

        Ok(Self {
            data: data[..restart_array_offset].to_vec(),
            restart_positions,
        })
    }

    pub fn iter(self: &Arc<Self>, icmp: InternalKeyComparator) -> BlockIterator {
        BlockIterator::new(Arc::clone(self), icmp)
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Key at a restart point; restart entries never share a prefix.
    fn restart_key(&self, restart_index: usize) -> Result<&[u8]> {
        let mut pos = self.restart_positions[restart_index] as usize;
        let data = &self.data;

        let shared = read_u16_at(data, &mut pos)? as usize;
        let unshared = read_u16_at(data, &mut pos)? as usize;
        let _vlen = read_u32_at(data, &mut pos)? as usize;
        if shared != 0 {
            return Err(Error::Corruption(
                "restart point key has shared prefix".to_string(),
            ));
        }
        if pos + unshared > data.len() {
            return Err(Error::Corruption("restart entry out of bounds".to_string()));
        }
        Ok(&data[pos..pos + unshared])
    }
}

fn read_u16_at(data: &[u8], pos: &mut usize) -> Result<u16> {
    let v = (&data[*pos..])
        .read_u16::<BigEndian>()
        .map_err(|e: io::Error| Error::Corruption(e.to_string()))?;
    *pos += 2;
    Ok(v)
}

fn read_u32_at(data: &[u8], pos: &mut usize) -> Result<u32> {
    let v = (&data[*pos..])
        .read_u32::<BigEndian>()
        .map_err(|e: io::Error| Error::Corruption(e.to_string()))?;
    *pos += 4;
    Ok(v)
}

/// Forward iterator over a block's entries.
pub struct BlockIterator {
    block: Arc<Block>,
    icmp: InternalKeyComparator,
    current_offset: usize,
    last_key: Vec<u8>,
}

impl BlockIterator {
    pub fn new(block: Arc<Block>, icmp: InternalKeyComparator) -> Self {
        Self {
            block,
            icmp,
            current_offset: 0,
            last_key: Vec::new(),
        }
    }

    /// Positions the iterator so the next `next()` yields the first entry
    /// whose key is >= `target`, or nothing if the block holds no such key.
    pub fn seek(&mut self, target: &[u8]) -> Result<()> {
        // Binary search restart points for the last restart whose key is
        // < target.
        let mut left = 0usize;
        let mut right = self.block.restart_positions.len();
        while left < right {
            let mid = left + (right - left) / 2;
            let key = self.block.restart_key(mid)?;
            match self.icmp.compare(key, target) {
                Ordering::Less => left = mid + 1,
                _ => right = mid,
            }
        }
        let restart_index = left.saturating_sub(1);

        self.current_offset = self
            .block
            .restart_positions
            .get(restart_index)
            .map_or(0, |&p| p as usize);
        self.last_key.clear();

        // Linear scan forward until the next entry is >= target.
        loop {
            let saved_offset = self.current_offset;
            let saved_key = self.last_key.clone();
            match self.next() {
                Some(Ok((key, _))) => {
                    if self.icmp.compare(&key, target) != Ordering::Less {
                        self.current_offset = saved_offset;
                        self.last_key = saved_key;
                        return Ok(());
                    }
                }
                Some(Err(e)) => return Err(e),
                None => return Ok(()),
            }
        }
    }
}

impl Iterator for BlockIterator {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.current_offset >= self.block.data.len() {
            return None;
        }

        let data = &self.block.data;
        let mut pos = self.current_offset;

        let shared = match read_u16_at(data, &mut pos) {
            Ok(v) => v as usize,
            Err(e) => return Some(Err(e)),
        };
        let unshared = match read_u16_at(data, &mut pos) {
            Ok(v) => v as usize,
            Err(e) => return Some(Err(e)),
        };
        let value_len = match read_u32_at(data, &mut pos) {
            Ok(v) => v as usize,
            Err(e) => return Some(Err(e)),
        };

        if shared > self.last_key.len() || pos + unshared + value_len > data.len() {
            return Some(Err(Error::Corruption(
                "block entry out of bounds".to_string(),
            )));
        }

        let mut key = Vec::with_capacity(shared + unshared);
        key.extend_from_slice(&self.last_key[..shared]);
        key.extend_from_slice(&data[pos..pos + unshared]);
        pos += unshared;

        let value = data[pos..pos + value_len].to_vec();
        pos += value_len;

        self.current_offset = pos;
        self.last_key.clear();
        self.last_key.extend_from_slice(&key);

        Some(Ok((key, value)))
    }
}
