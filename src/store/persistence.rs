//! # Index State File
//!
//! The key index lives only in memory. This module writes it to a side file
//! next to the backing file and reads it back on reopen, so a restart does
//! not need to scan every arena.
//!
//! ## File Format
//!
//! ```text
//! Offset  Size      Description
//! 0       4         Entry count (u32 little-endian)
//! 4       ...       Entries
//!
//! Entry:
//!   blob_len: i32 (little-endian, -1 = skipped entry, no blob follows)
//!   blob:     blob_len bytes
//!
//! Blob:
//!   key_len:  u32
//!   key:      key_len bytes
//!   view_id:  u32
//!   offset:   u32
//! ```
//!
//! An entry whose blob cannot be represented (blob longer than `i32::MAX`) is
//! written as a bare `-1` and skipped on load.
//!
//! ## Atomic Replacement
//!
//! The file is written to `<state>.tmp`, synced, then renamed over the old
//! state file. A crash mid-save leaves the previous state intact.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use eyre::{bail, ensure, Result, WrapErr};
use tracing::{debug, warn};

use super::engine::Locator;
use crate::config::SKIPPED_ENTRY_LEN;

const COUNT_SIZE: usize = 4;
const BLOB_LEN_SIZE: usize = 4;

/// Entries recovered from a state file.
#[derive(Debug, Default)]
pub struct LoadedIndex {
    pub entries: Vec<(Vec<u8>, Locator)>,
    pub skipped: usize,
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

fn read_u32(bytes: &[u8], pos: usize) -> Result<u32> {
    ensure!(
        pos + 4 <= bytes.len(),
        "state file truncated at offset {} (len={})",
        pos,
        bytes.len()
    );
    Ok(u32::from_le_bytes([
        bytes[pos],
        bytes[pos + 1],
        bytes[pos + 2],
        bytes[pos + 3],
    ]))
}

fn encode_blob(key: &[u8], locator: Locator) -> Vec<u8> {
    let mut blob = Vec::with_capacity(12 + key.len());
    blob.extend((key.len() as u32).to_le_bytes());
    blob.extend_from_slice(key);
    blob.extend(locator.view_id.to_le_bytes());
    blob.extend(locator.offset.to_le_bytes());
    blob
}

fn decode_blob(blob: &[u8]) -> Result<(Vec<u8>, Locator)> {
    let key_len = read_u32(blob, 0)? as usize;
    let key_end = 4 + key_len;
    ensure!(
        key_end + 8 == blob.len(),
        "index blob of {} bytes does not match key length {}",
        blob.len(),
        key_len
    );

    let key = blob[4..key_end].to_vec();
    let view_id = read_u32(blob, key_end)?;
    let offset = read_u32(blob, key_end + 4)?;
    Ok((key, Locator { view_id, offset }))
}

pub fn serialize<'a, I>(entries: I) -> Vec<u8>
where
    I: ExactSizeIterator<Item = (&'a [u8], Locator)>,
{
    let mut buf = Vec::new();
    buf.extend((entries.len() as u32).to_le_bytes());

    for (key, locator) in entries {
        let blob = encode_blob(key, locator);
        match i32::try_from(blob.len()) {
            Ok(len) => {
                buf.extend(len.to_le_bytes());
                buf.extend_from_slice(&blob);
            }
            Err(_) => {
                warn!(key_len = key.len(), "index entry too large, writing skip marker");
                buf.extend(SKIPPED_ENTRY_LEN.to_le_bytes());
            }
        }
    }
    buf
}

pub fn deserialize(bytes: &[u8]) -> Result<LoadedIndex> {
    let count = read_u32(bytes, 0)? as usize;
    let mut pos = COUNT_SIZE;
    let mut loaded = LoadedIndex {
        entries: Vec::with_capacity(count.min(bytes.len() / 12)),
        skipped: 0,
    };

    for _ in 0..count {
        let blob_len = read_u32(bytes, pos)? as i32;
        pos += BLOB_LEN_SIZE;

        if blob_len == SKIPPED_ENTRY_LEN {
            loaded.skipped += 1;
            continue;
        }
        if blob_len < 0 {
            bail!("invalid blob length {} at offset {}", blob_len, pos - BLOB_LEN_SIZE);
        }

        let end = pos + blob_len as usize;
        ensure!(
            end <= bytes.len(),
            "index blob at offset {} runs past end of state file",
            pos
        );

        match decode_blob(&bytes[pos..end]) {
            Ok(entry) => loaded.entries.push(entry),
            Err(e) => {
                debug!(offset = pos, error = %e, "skipping undecodable index entry");
                loaded.skipped += 1;
            }
        }
        pos = end;
    }

    Ok(loaded)
}

/// Atomically replaces the state file at `path`.
pub fn save<'a, I>(path: &Path, entries: I) -> Result<()>
where
    I: ExactSizeIterator<Item = (&'a [u8], Locator)>,
{
    let count = entries.len();
    let bytes = serialize(entries);
    let tmp = temp_path(path);

    {
        let file = File::create(&tmp)
            .wrap_err_with(|| format!("failed to create state file '{}'", tmp.display()))?;
        let mut writer = BufWriter::new(file);
        writer
            .write_all(&bytes)
            .wrap_err_with(|| format!("failed to write state file '{}'", tmp.display()))?;
        let file = writer
            .into_inner()
            .map_err(|e| eyre::eyre!("failed to flush state file '{}': {}", tmp.display(), e))?;
        file.sync_all()
            .wrap_err_with(|| format!("failed to sync state file '{}'", tmp.display()))?;
    }

    fs::rename(&tmp, path).wrap_err_with(|| {
        format!(
            "failed to rename '{}' to '{}'",
            tmp.display(),
            path.display()
        )
    })?;

    debug!(path = %path.display(), entries = count, bytes = bytes.len(), "saved index state");
    Ok(())
}

/// Loads the state file at `path`, or `None` if it does not exist.
pub fn load(path: &Path) -> Result<Option<LoadedIndex>> {
    if !path.exists() {
        return Ok(None);
    }

    let bytes = fs::read(path)
        .wrap_err_with(|| format!("failed to read state file '{}'", path.display()))?;
    let loaded = deserialize(&bytes)
        .wrap_err_with(|| format!("corrupt state file '{}'", path.display()))?;

    debug!(
        path = %path.display(),
        entries = loaded.entries.len(),
        skipped = loaded.skipped,
        "loaded index state"
    );
    Ok(Some(loaded))
}
