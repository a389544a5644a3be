//! Descriptor-log record framing.
//!
//! The descriptor (MANIFEST) is an append-only log of encoded version
//! edits. Each record is framed independently so replay can detect where a
//! crashed writer stopped:
//!
//! ```text
//! +------------+------------------+------------+
//! | length:u32 | record bytes     | crc32:u32  |
//! +------------+------------------+------------+
//! ```
//!
//! A checksum mismatch or short read surfaces as corruption; the reader
//! never guesses past damage.

use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use crc::{Crc, CRC_32_ISCSI};

use crate::error::{Error, Result};

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Appends framed records to a descriptor file.
pub struct LogWriter {
    writer: BufWriter<File>,
}

impl LogWriter {
    /// Creates a fresh descriptor, truncating any leftover file.
    pub fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }

    /// Reopens an existing descriptor for appending (manifest reuse).
    pub fn open_append(path: &Path) -> Result<Self> {
        let mut file = OpenOptions::new().write(true).open(path)?;
        file.seek(SeekFrom::End(0))?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }

    pub fn add_record(&mut self, record: &[u8]) -> Result<()> {
        self.writer.write_u32::<BigEndian>(record.len() as u32)?;
        self.writer.write_all(record)?;
        self.writer.write_u32::<BigEndian>(CRC32.checksum(record))?;
        Ok(())
    }

    /// Flushes buffered records and makes them durable.
    pub fn sync(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok(())
    }
}

/// Replays framed records from a descriptor file.
pub struct LogReader {
    reader: BufReader<File>,
}

impl LogReader {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            reader: BufReader::new(File::open(path)?),
        })
    }
}

impl Iterator for LogReader {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        let len = match self.reader.read_u32::<BigEndian>() {
            Ok(len) => len as usize,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return None,
            Err(e) => return Some(Err(e.into())),
        };

        let mut record = vec![0u8; len];
        if let Err(e) = self.reader.read_exact(&mut record) {
            return Some(Err(Error::Corruption(format!(
                "descriptor record truncated: {e}"
            ))));
        }

        let stored = match self.reader.read_u32::<BigEndian>() {
            Ok(crc) => crc,
            Err(e) => {
                return Some(Err(Error::Corruption(format!(
                    "descriptor checksum missing: {e}"
                ))))
            }
        };
        if stored != CRC32.checksum(&record) {
            return Some(Err(Error::Corruption(
                "descriptor record checksum mismatch".to_string(),
            )));
        }

        Some(Ok(record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmpfs::TempDir;

    #[test]
    fn test_write_read_roundtrip() -> Result<()> {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("MANIFEST-000001");

        let records: Vec<Vec<u8>> = vec![b"first".to_vec(), vec![], vec![0xAB; 1000]];
        {
            let mut writer = LogWriter::create(&path)?;
            for record in &records {
                writer.add_record(record)?;
            }
            writer.sync()?;
        }

        let read: Vec<Vec<u8>> = LogReader::open(&path)?.collect::<Result<_>>()?;
        assert_eq!(read, records);
        Ok(())
    }

    #[test]
    fn test_append_preserves_existing_records() -> Result<()> {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("MANIFEST-000001");

        {
            let mut writer = LogWriter::create(&path)?;
            writer.add_record(b"one")?;
            writer.sync()?;
        }
        {
            let mut writer = LogWriter::open_append(&path)?;
            writer.add_record(b"two")?;
            writer.sync()?;
        }

        let read: Vec<Vec<u8>> = LogReader::open(&path)?.collect::<Result<_>>()?;
        assert_eq!(read, vec![b"one".to_vec(), b"two".to_vec()]);
        Ok(())
    }

    #[test]
    fn test_checksum_corruption_detected() -> Result<()> {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("MANIFEST-000001");

        {
            let mut writer = LogWriter::create(&path)?;
            writer.add_record(b"record")?;
            writer.sync()?;
        }
        {
            let mut file = OpenOptions::new().write(true).open(&path)?;
            file.seek(SeekFrom::Start(5))?; // inside the payload
            file.write_all(&[0xFF])?;
        }

        let mut reader = LogReader::open(&path)?;
        assert!(matches!(
            reader.next(),
            Some(Err(Error::Corruption(_)))
        ));
        Ok(())
    }

    #[test]
    fn test_truncated_tail_is_corruption() -> Result<()> {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("MANIFEST-000001");

        {
            let mut writer = LogWriter::create(&path)?;
            writer.add_record(b"complete")?;
            writer.add_record(b"will be cut")?;
            writer.sync()?;
        }
        {
            let file = OpenOptions::new().write(true).open(&path)?;
            let len = file.metadata()?.len();
            file.set_len(len - 6)?;
        }

        let mut reader = LogReader::open(&path)?;
        assert_eq!(reader.next().unwrap()?, b"complete");
        assert!(matches!(
            reader.next(),
            Some(Err(Error::Corruption(_)))
        ));
        Ok(())
    }
}
