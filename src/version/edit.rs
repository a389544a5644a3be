//! Version edits: the deltas recorded in the descriptor log.
//!
//! An edit describes file additions and deletions plus counter updates.
//! Encoding is a sequence of varint-tagged fields:
//!
//! ```text
//! field := tag (varint) payload
//! tags: 1 comparator name     2 log number        3 next file number
//!       4 last sequence       5 compact pointer   6 deleted file
//!       7 new file            9 previous log number
//! ```
//!
//! Unknown tags are a corruption error, never skipped: a descriptor
//! written by a newer engine must not be half-understood.

use std::collections::BTreeSet;

use integer_encoding::VarInt;

use crate::error::{Error, Result};
use crate::key::InternalKey;

const TAG_COMPARATOR: u64 = 1;
const TAG_LOG_NUMBER: u64 = 2;
const TAG_NEXT_FILE_NUMBER: u64 = 3;
const TAG_LAST_SEQUENCE: u64 = 4;
const TAG_COMPACT_POINTER: u64 = 5;
const TAG_DELETED_FILE: u64 = 6;
const TAG_NEW_FILE: u64 = 7;
const TAG_PREV_LOG_NUMBER: u64 = 9;

/// A file added to a level by an edit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewFile {
    pub level: usize,
    pub number: u64,
    pub file_size: u64,
    pub smallest: InternalKey,
    pub largest: InternalKey,
}

/// A delta over the current version: counters, compact pointers, and the
/// file set changes of one flush or compaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionEdit {
    pub comparator: Option<String>,
    pub log_number: Option<u64>,
    pub prev_log_number: Option<u64>,
    pub next_file_number: Option<u64>,
    pub last_sequence: Option<u64>,
    pub compact_pointers: Vec<(usize, InternalKey)>,
    pub deleted_files: BTreeSet<(usize, u64)>,
    pub new_files: Vec<NewFile>,
}

impl VersionEdit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    pub fn set_comparator_name(&mut self, name: &str) {
        self.comparator = Some(name.to_string());
    }

    pub fn set_log_number(&mut self, number: u64) {
        self.log_number = Some(number);
    }

    pub fn set_prev_log_number(&mut self, number: u64) {
        self.prev_log_number = Some(number);
    }

    pub fn set_next_file_number(&mut self, number: u64) {
        self.next_file_number = Some(number);
    }

    pub fn set_last_sequence(&mut self, sequence: u64) {
        self.last_sequence = Some(sequence);
    }

    pub fn set_compact_pointer(&mut self, level: usize, key: InternalKey) {
        self.compact_pointers.push((level, key));
    }

    /// Records a file addition.
    pub fn add_file(
        &mut self,
        level: usize,
        number: u64,
        file_size: u64,
        smallest: InternalKey,
        largest: InternalKey,
    ) {
        self.new_files.push(NewFile {
            level,
            number,
            file_size,
            smallest,
            largest,
        });
    }

    /// Records a file deletion.
    pub fn remove_file(&mut self, level: usize, number: u64) {
        self.deleted_files.insert((level, number));
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(256);

        if let Some(name) = &self.comparator {
            put_varint(&mut buf, TAG_COMPARATOR);
            put_length_prefixed(&mut buf, name.as_bytes());
        }
        if let Some(n) = self.log_number {
            put_varint(&mut buf, TAG_LOG_NUMBER);
            put_varint(&mut buf, n);
        }
        if let Some(n) = self.prev_log_number {
            put_varint(&mut buf, TAG_PREV_LOG_NUMBER);
            put_varint(&mut buf, n);
        }
        if let Some(n) = self.next_file_number {
            put_varint(&mut buf, TAG_NEXT_FILE_NUMBER);
            put_varint(&mut buf, n);
        }
        if let Some(n) = self.last_sequence {
            put_varint(&mut buf, TAG_LAST_SEQUENCE);
            put_varint(&mut buf, n);
        }
        for (level, key) in &self.compact_pointers {
            put_varint(&mut buf, TAG_COMPACT_POINTER);
            put_varint(&mut buf, *level as u64);
            put_length_prefixed(&mut buf, key.as_slice());
        }
        for (level, number) in &self.deleted_files {
            put_varint(&mut buf, TAG_DELETED_FILE);
            put_varint(&mut buf, *level as u64);
            put_varint(&mut buf, *number);
        }
        for file in &self.new_files {
            put_varint(&mut buf, TAG_NEW_FILE);
            put_varint(&mut buf, file.level as u64);
            put_varint(&mut buf, file.number);
            put_varint(&mut buf, file.file_size);
            put_length_prefixed(&mut buf, file.smallest.as_slice());
            put_length_prefixed(&mut buf, file.largest.as_slice());
        }

        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut edit = Self::default();
        let mut input = buf;

        while !input.is_empty() {
            let tag = get_varint(&mut input, "edit tag")?;
            match tag {
                TAG_COMPARATOR => {
                    let name = get_length_prefixed(&mut input, "comparator name")?;
                    edit.comparator = Some(
                        String::from_utf8(name.to_vec())
                            .map_err(|_| Error::Corruption("comparator name not utf-8".into()))?,
                    );
                }
                TAG_LOG_NUMBER => edit.log_number = Some(get_varint(&mut input, "log number")?),
                TAG_PREV_LOG_NUMBER => {
                    edit.prev_log_number = Some(get_varint(&mut input, "prev log number")?)
                }
                TAG_NEXT_FILE_NUMBER => {
                    edit.next_file_number = Some(get_varint(&mut input, "next file number")?)
                }
                TAG_LAST_SEQUENCE => {
                    edit.last_sequence = Some(get_varint(&mut input, "last sequence")?)
                }
                TAG_COMPACT_POINTER => {
                    let level = get_level(&mut input)?;
                    let key = get_length_prefixed(&mut input, "compact pointer key")?;
                    edit.compact_pointers
                        .push((level, InternalKey::decode_from(key)));
                }
                TAG_DELETED_FILE => {
                    let level = get_level(&mut input)?;
                    let number = get_varint(&mut input, "deleted file number")?;
                    edit.deleted_files.insert((level, number));
                }
                TAG_NEW_FILE => {
                    let level = get_level(&mut input)?;
                    let number = get_varint(&mut input, "new file number")?;
                    let file_size = get_varint(&mut input, "new file size")?;
                    let smallest = get_length_prefixed(&mut input, "new file smallest")?.to_vec();
                    let largest = get_length_prefixed(&mut input, "new file largest")?;
                    edit.new_files.push(NewFile {
                        level,
                        number,
                        file_size,
                        smallest: InternalKey::decode_from(&smallest),
                        largest: InternalKey::decode_from(largest),
                    });
                }
                other => {
                    return Err(Error::Corruption(format!(
                        "unknown version edit tag {other}"
                    )))
                }
            }
        }

        Ok(edit)
    }
}

fn put_varint(buf: &mut Vec<u8>, value: u64) {
    buf.extend_from_slice(&value.encode_var_vec());
}

fn put_length_prefixed(buf: &mut Vec<u8>, data: &[u8]) {
    put_varint(buf, data.len() as u64);
    buf.extend_from_slice(data);
}

fn get_varint(input: &mut &[u8], field: &str) -> Result<u64> {
    let (value, read) = u64::decode_var(input)
        .ok_or_else(|| Error::Corruption(format!("truncated varint for {field}")))?;
    *input = &input[read..];
    Ok(value)
}

fn get_length_prefixed<'a>(input: &mut &'a [u8], field: &str) -> Result<&'a [u8]> {
    let len = get_varint(input, field)? as usize;
    if input.len() < len {
        return Err(Error::Corruption(format!("truncated bytes for {field}")));
    }
    let (data, rest) = input.split_at(len);
    *input = rest;
    Ok(data)
}

fn get_level(input: &mut &[u8]) -> Result<usize> {
    let level = get_varint(input, "level")?;
    if level as usize >= crate::config::NUM_LEVELS {
        return Err(Error::Corruption(format!("level {level} out of range")));
    }
    Ok(level as usize)
}
