//! Database file naming.
//!
//! Every file in the database directory is named by its role and file
//! number: `MANIFEST-<number>` for descriptors, `<number>.sst` (or the
//! legacy `<number>.ldb`) for tables, `<number>.log` for write-ahead logs,
//! `<number>.dbtmp` for scratch files, and the `CURRENT` pointer naming the
//! active descriptor. Numbers are zero-padded decimals.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// The role a database file plays, parsed back from its name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Log,
    Table,
    Descriptor,
    Current,
    Temp,
}

pub fn log_file_name(dir: &Path, number: u64) -> PathBuf {
    dir.join(format!("{number:06}.log"))
}

pub fn table_file_name(dir: &Path, number: u64) -> PathBuf {
    dir.join(format!("{number:06}.sst"))
}

/// Legacy table name, accepted on open for databases written by older
/// builds.
pub fn alt_table_file_name(dir: &Path, number: u64) -> PathBuf {
    dir.join(format!("{number:06}.ldb"))
}

pub fn descriptor_file_name(dir: &Path, number: u64) -> PathBuf {
    dir.join(format!("MANIFEST-{number:06}"))
}

pub fn current_file_name(dir: &Path) -> PathBuf {
    dir.join("CURRENT")
}

pub fn temp_file_name(dir: &Path, number: u64) -> PathBuf {
    dir.join(format!("{number:06}.dbtmp"))
}

/// Parses a file's base name into its type and number. `CURRENT` carries
/// number 0. Returns `None` for names this engine does not own.
pub fn parse_file_name(name: &str) -> Option<(FileType, u64)> {
    if name == "CURRENT" {
        return Some((FileType::Current, 0));
    }
    if let Some(rest) = name.strip_prefix("MANIFEST-") {
        let number = rest.parse::<u64>().ok()?;
        return Some((FileType::Descriptor, number));
    }
    let (stem, ext) = name.split_once('.')?;
    let number = stem.parse::<u64>().ok()?;
    match ext {
        "log" => Some((FileType::Log, number)),
        "sst" | "ldb" => Some((FileType::Table, number)),
        "dbtmp" => Some((FileType::Temp, number)),
        _ => None,
    }
}

/// Points `CURRENT` at the descriptor named by `descriptor_number`.
///
/// The new contents are written to a temp file, synced, and renamed over
/// `CURRENT` so readers always observe a complete pointer.
pub fn set_current_file(dir: &Path, descriptor_number: u64) -> Result<()> {
    let contents = format!("MANIFEST-{descriptor_number:06}\n");
    let tmp = temp_file_name(dir, descriptor_number);

    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&tmp)?;
    file.write_all(contents.as_bytes())?;
    file.sync_all()?;
    drop(file);

    if let Err(e) = fs::rename(&tmp, current_file_name(dir)) {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}

/// Reads `CURRENT` and returns the active descriptor's base name.
pub fn read_current_file(dir: &Path) -> Result<String> {
    let mut contents = String::new();
    File::open(current_file_name(dir))?.read_to_string(&mut contents)?;
    if contents.is_empty() || !contents.ends_with('\n') {
        return Err(Error::Corruption(
            "CURRENT file does not end with newline".to_string(),
        ));
    }
    let name = contents.trim_end_matches('\n').to_string();
    match parse_file_name(&name) {
        Some((FileType::Descriptor, _)) => Ok(name),
        _ => Err(Error::Corruption(format!(
            "CURRENT names a non-descriptor file: {name}"
        ))),
    }
}
