//! Table files: a sequence of checksummed data blocks, a block index, and
//! a fixed footer.
//!
//! ```text
//! +--------------------------+
//! | data block 1 | crc (u32) |
//! +--------------------------+
//! | ...                      |
//! +--------------------------+
//! | data block N | crc (u32) |
//! +--------------------------+
//! | index block              |
//! +--------------------------+
//! | index offset (u64)       |
//! +--------------------------+
//! index entry := klen (u16) | first key | offset (u64) | size (u64)
//! ```
//!
//! The index records each block's first internal key; lookup finds the last
//! block whose first key is not greater than the target and scans from
//! there, spilling into the following block when the target is past the
//! block's end.

use std::cmp::Ordering;
use std::fs::File;
use std::io::{BufWriter, Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use crc::{Crc, CRC_32_ISCSI};

use crate::error::{Error, Result};
use crate::key::InternalKeyComparator;
use crate::sstable::block::{Block, BlockBuilder, BlockIterator};

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Target maximum size for a data block; the last entry may push a block
/// slightly over.
pub const MAX_BLOCK_SIZE: usize = 4096;

const FOOTER_SIZE: u64 = 8;
const BLOCK_TRAILER_SIZE: u64 = 4;

/// Builds an immutable table file from entries added in comparator order.
pub struct TableBuilder {
    file: BufWriter<File>,
    path: PathBuf,
    icmp: InternalKeyComparator,
    block: BlockBuilder,
    index: Vec<(Vec<u8>, u64, u64)>,
    first_key_in_block: Option<Vec<u8>>,
    last_key: Vec<u8>,
    offset: u64,
    num_entries: u64,
}

impl TableBuilder {
    pub fn new(path: &Path, icmp: InternalKeyComparator) -> Result<Self> {
        let file = BufWriter::new(File::create(path)?);
        Ok(Self {
            file,
            path: path.to_path_buf(),
            icmp,
            block: BlockBuilder::new(),
            index: Vec::new(),
            first_key_in_block: None,
            last_key: Vec::new(),
            offset: 0,
            num_entries: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends an entry. Keys must arrive in strict internal-key order.
    pub fn add(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        debug_assert!(
            self.num_entries == 0 || self.icmp.compare(&self.last_key, key) == Ordering::Less
        );
        if self.first_key_in_block.is_none() {
            self.first_key_in_block = Some(key.to_vec());
        }
        self.block.add(key, value);
        self.last_key.clear();
        self.last_key.extend_from_slice(key);
        self.num_entries += 1;

        if self.block.len() >= MAX_BLOCK_SIZE {
            self.flush_block()?;
        }
        Ok(())
    }

    pub fn num_entries(&self) -> u64 {
        self.num_entries
    }

    /// Bytes the file would occupy if finished now (estimate).
    pub fn file_size_estimate(&self) -> u64 {
        self.offset + self.block.len() as u64
    }

    /// Writes the index and footer and syncs the file. Returns the final
    /// file size.
    pub fn finish(mut self) -> Result<u64> {
        self.flush_block()?;

        let index_offset = self.offset;
        let mut index_data = Vec::new();
        for (key, offset, size) in &self.index {
            index_data.write_u16::<BigEndian>(key.len() as u16).unwrap();
            index_data.extend_from_slice(key);
            index_data.write_u64::<BigEndian>(*offset).unwrap();
            index_data.write_u64::<BigEndian>(*size).unwrap();
        }
        self.file.write_all(&index_data)?;
        self.file.write_u64::<BigEndian>(index_offset)?;
        self.file.flush()?;
        self.file.get_ref().sync_all()?;

        Ok(index_offset + index_data.len() as u64 + FOOTER_SIZE)
    }

    fn flush_block(&mut self) -> Result<()> {
        if self.block.is_empty() {
            return Ok(());
        }
        let block = std::mem::take(&mut self.block);
        let data = block.finish();
        let checksum = CRC32.checksum(&data);

        self.file.write_all(&data)?;
        self.file.write_u32::<BigEndian>(checksum)?;

        let first_key = self
            .first_key_in_block
            .take()
            .expect("non-empty block without first key");
        let on_disk_size = data.len() as u64 + BLOCK_TRAILER_SIZE;
        self.index.push((first_key, self.offset, on_disk_size));
        self.offset += on_disk_size;
        Ok(())
    }
}

/// An open, immutable table file.
pub struct Table {
    file: File,
    icmp: InternalKeyComparator,
    index: Vec<(Vec<u8>, u64, u64)>,
    index_offset: u64,
}

impl Table {
    /// Opens a table, checking the committed size and loading the index.
    pub fn open(path: &Path, file_size: u64, icmp: InternalKeyComparator) -> Result<Self> {
        let mut file = File::open(path)?;
        let actual = file.metadata()?.len();
        if actual != file_size {
            return Err(Error::Corruption(format!(
                "table {} size mismatch: expected {file_size}, found {actual}",
                path.display()
            )));
        }
        if file_size < FOOTER_SIZE {
            return Err(Error::Corruption(format!(
                "table {} too small for footer",
                path.display()
            )));
        }

        file.seek(SeekFrom::Start(file_size - FOOTER_SIZE))?;
        let index_offset = file.read_u64::<BigEndian>()?;
        if index_offset > file_size - FOOTER_SIZE {
            return Err(Error::Corruption(format!(
                "table {} index offset out of range",
                path.display()
            )));
        }

        let index_len = (file_size - FOOTER_SIZE - index_offset) as usize;
        let mut index_data = vec![0u8; index_len];
        file.seek(SeekFrom::Start(index_offset))?;
        file.read_exact(&mut index_data)?;

        let mut index = Vec::new();
        let mut cursor = Cursor::new(index_data.as_slice());
        while (cursor.position() as usize) < index_len {
            let key_len = cursor.read_u16::<BigEndian>()? as usize;
            let mut key = vec![0u8; key_len];
            cursor.read_exact(&mut key)?;
            let offset = cursor.read_u64::<BigEndian>()?;
            let size = cursor.read_u64::<BigEndian>()?;
            index.push((key, offset, size));
        }

        Ok(Self {
            file,
            icmp,
            index,
            index_offset,
        })
    }

    /// Point lookup: invokes `visitor` with the first entry whose internal
    /// key is >= `target`, if the table holds one. Returns whether the
    /// visitor ran.
    pub fn get(
        &self,
        target: &[u8],
        verify_checksums: bool,
        mut visitor: impl FnMut(&[u8], &[u8]),
    ) -> Result<bool> {
        if self.index.is_empty() {
            return Ok(false);
        }
        let start = self.find_block_index(target);

        for block_index in [start, start + 1] {
            let Some(&(_, offset, size)) = self.index.get(block_index) else {
                break;
            };
            let block = Arc::new(self.read_block(offset, size, verify_checksums)?);
            let mut iter = block.iter(self.icmp.clone());
            // Only the candidate block needs a seek; a spill into the next
            // block starts at its first entry, which is > target's block.
            if block_index == start {
                iter.seek(target)?;
            }
            if let Some(entry) = iter.next() {
                let (key, value) = entry?;
                visitor(&key, &value);
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Forward iterator over all entries.
    pub fn iter(self: &Arc<Self>, verify_checksums: bool) -> TableIterator {
        TableIterator {
            table: Arc::clone(self),
            verify_checksums,
            next_block: 0,
            current: None,
        }
    }

    /// Approximate byte offset of `target` within the file.
    pub fn approximate_offset_of(&self, target: &[u8]) -> u64 {
        let p = self
            .index
            .partition_point(|(key, _, _)| self.icmp.compare(key, target) != Ordering::Greater);
        match p.checked_sub(1) {
            Some(i) => {
                // Past the last block's keys the best estimate is the end
                // of the data area.
                if p == self.index.len() {
                    self.index_offset
                } else {
                    self.index[i].1
                }
            }
            None => 0,
        }
    }

    /// Index slot of the last block whose first key is <= target (or 0
    /// when the target precedes every block).
    fn find_block_index(&self, target: &[u8]) -> usize {
        let p = self
            .index
            .partition_point(|(key, _, _)| self.icmp.compare(key, target) != Ordering::Greater);
        p.saturating_sub(1)
    }

    fn read_block(&self, offset: u64, size: u64, verify_checksums: bool) -> Result<Block> {
        if size < BLOCK_TRAILER_SIZE {
            return Err(Error::Corruption("block handle too small".to_string()));
        }
        let mut raw = vec![0u8; size as usize];
        let mut reader = self.file.try_clone()?;
        reader.seek(SeekFrom::Start(offset))?;
        reader.read_exact(&mut raw)?;

        let data_len = raw.len() - BLOCK_TRAILER_SIZE as usize;
        if verify_checksums {
            let stored = (&raw[data_len..]).read_u32::<BigEndian>()?;
            let computed = CRC32.checksum(&raw[..data_len]);
            if stored != computed {
                return Err(Error::Corruption(format!(
                    "block checksum mismatch at offset {offset}"
                )));
            }
        }
        raw.truncate(data_len);
        Block::new(raw)
    }
}

/// Iterates a table's entries in internal-key order.
pub struct TableIterator {
    table: Arc<Table>,
    verify_checksums: bool,
    next_block: usize,
    current: Option<BlockIterator>,
}

impl Iterator for TableIterator {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(iter) = &mut self.current {
                if let Some(entry) = iter.next() {
                    return Some(entry);
                }
            }
            let &(_, offset, size) = self.table.index.get(self.next_block)?;
            self.next_block += 1;
            match self.table.read_block(offset, size, self.verify_checksums) {
                Ok(block) => {
                    self.current = Some(Arc::new(block).iter(self.table.icmp.clone()));
                }
                Err(e) => {
                    // Do not retry the same block forever.
                    self.next_block = self.table.index.len();
                    self.current = None;
                    return Some(Err(e));
                }
            }
        }
    }
}
