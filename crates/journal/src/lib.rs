#![deny(rustdoc::broken_intra_doc_links)]

//! Crash-resumable transfer journal.
//!
//! The journal is a memory-mapped file of identical 528-byte records, one
//! per in-flight source: an 8-byte little-endian fingerprint of the source
//! URI, an 8-byte last-success offset, and a 512-byte NUL-padded UTF-8
//! target name. Fingerprint `0` marks a free slot. An in-memory table maps
//! fingerprints to slot indices and a free list tracks empty slots, so
//! updates are a single record write under one lock.
//!
//! After a crash, [`Journal::resume`] yields every occupied record: each
//! one is a source that was in flight when the process died. The recorded
//! offset is advisory; callers decide whether to continue from it or
//! restart the file.
//!
//! The file length is always a whole number of records. When no free slot
//! remains, the mapping is released, the file grows by
//! [`GROWTH_RECORDS`] records (one mebibyte rounded down to whole
//! records), and the new slot range joins the free list.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;
use std::sync::{Mutex, PoisonError};

use memmap2::MmapMut;
use rustc_hash::FxHashMap;
use tracing::{debug, warn};
use xxhash_rust::xxh3::xxh3_64;

/// On-disk size of one journal record.
pub const RECORD_SIZE: usize = 528;

/// Width of the NUL-padded target name field.
const TARGET_FIELD_LEN: usize = RECORD_SIZE - 16;

/// Records added per file extension: one MiB rounded down to whole
/// records, keeping the length a multiple of [`RECORD_SIZE`].
pub const GROWTH_RECORDS: usize = (1024 * 1024) / RECORD_SIZE;

/// Conventional journal file name in the working directory.
pub const DEFAULT_FILE_NAME: &str = "fastcopy.journal";

/// Error raised by journal operations.
#[derive(Debug, thiserror::Error)]
pub enum JournalError {
    /// Underlying file or mapping failure.
    #[error("journal I/O error: {0}")]
    Io(#[from] io::Error),

    /// The target name does not fit the fixed record field.
    #[error("target name exceeds {TARGET_FIELD_LEN} bytes: {length}")]
    TargetTooLong {
        /// Byte length of the rejected name.
        length: usize,
    },
}

/// One occupied record, as yielded by [`Journal::resume`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    /// Fingerprint of the source URI.
    pub fingerprint: u64,
    /// Destination recorded for the source.
    pub target: String,
    /// Last offset the transfer had confirmed. Advisory.
    pub last_offset: u64,
}

struct Inner {
    file: File,
    map: MmapMut,
    /// fingerprint -> slot index for occupied slots.
    slots: FxHashMap<u64, usize>,
    free: Vec<usize>,
}

/// The journal store. All operations serialize on one internal lock.
pub struct Journal {
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for Journal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Journal").finish_non_exhaustive()
    }
}

/// Fingerprints a source URI for journal keying.
///
/// The hash value `0` is remapped to `1`: zero is the free-slot sentinel.
#[must_use]
pub fn fingerprint(source: &str) -> u64 {
    match xxh3_64(source.as_bytes()) {
        0 => 1,
        hash => hash,
    }
}

impl Journal {
    /// Opens (or creates) the journal at `path` and indexes its records.
    ///
    /// A trailing partial record, the residue of a torn write, is
    /// discarded.
    pub fn open(path: &Path) -> Result<Self, JournalError> {
        let file = OpenOptions::new().read(true).write(true).create(true).open(path)?;

        let length = file.metadata()?.len();
        let usable = length - length % RECORD_SIZE as u64;
        if usable != length {
            warn!(length, usable, "journal has a torn trailing record, truncating");
            file.set_len(usable)?;
        }
        if usable == 0 {
            file.set_len((GROWTH_RECORDS * RECORD_SIZE) as u64)?;
        }

        // SAFETY: the journal file is owned by this process for the run;
        // concurrent truncation by another process is outside the
        // supported deployment.
        let map = unsafe { MmapMut::map_mut(&file)? };

        let record_count = map.len() / RECORD_SIZE;
        let mut slots = FxHashMap::default();
        let mut free = Vec::new();
        for index in (0..record_count).rev() {
            let base = index * RECORD_SIZE;
            let fingerprint = u64::from_le_bytes(
                map[base..base + 8].try_into().unwrap_or([0u8; 8]),
            );
            if fingerprint == 0 {
                free.push(index);
            } else {
                slots.insert(fingerprint, index);
            }
        }
        debug!(records = record_count, occupied = slots.len(), "journal opened");

        Ok(Self { inner: Mutex::new(Inner { file, map, slots, free }) })
    }

    /// Yields every occupied record: the sources in flight when the file
    /// was last written.
    #[must_use]
    pub fn resume(&self) -> Vec<JournalEntry> {
        let inner = self.lock();
        let mut entries: Vec<JournalEntry> = inner
            .slots
            .iter()
            .map(|(&fingerprint, &slot)| read_entry(&inner.map, fingerprint, slot))
            .collect();
        entries.sort_by_key(|entry| entry.fingerprint);
        entries
    }

    /// Upserts the record for `source`.
    ///
    /// Offsets never move backwards while an entry is live; an update with
    /// a smaller offset keeps the recorded one.
    pub fn update(&self, source: &str, target: &str, offset: u64) -> Result<(), JournalError> {
        if target.len() > TARGET_FIELD_LEN {
            return Err(JournalError::TargetTooLong { length: target.len() });
        }
        let fingerprint = fingerprint(source);

        let mut inner = self.lock();
        let slot = match inner.slots.get(&fingerprint) {
            Some(&slot) => slot,
            None => {
                let slot = match inner.free.pop() {
                    Some(slot) => slot,
                    None => grow(&mut inner)?,
                };
                inner.slots.insert(fingerprint, slot);
                slot
            }
        };

        let base = slot * RECORD_SIZE;
        let record = &mut inner.map[base..base + RECORD_SIZE];
        let existing = u64::from_le_bytes(record[..8].try_into().unwrap_or([0u8; 8]));
        let previous_offset = if existing == fingerprint {
            i64::from_le_bytes(record[8..16].try_into().unwrap_or([0u8; 8])).max(0) as u64
        } else {
            0
        };
        let offset = offset.max(previous_offset).min(i64::MAX as u64);

        record[..8].copy_from_slice(&fingerprint.to_le_bytes());
        record[8..16].copy_from_slice(&(offset as i64).to_le_bytes());
        record[16..16 + target.len()].copy_from_slice(target.as_bytes());
        record[16 + target.len()..].fill(0);
        Ok(())
    }

    /// Clears the record for `source`, freeing its slot.
    pub fn complete(&self, source: &str) {
        let fingerprint = fingerprint(source);
        let mut inner = self.lock();
        if let Some(slot) = inner.slots.remove(&fingerprint) {
            let base = slot * RECORD_SIZE;
            inner.map[base..base + RECORD_SIZE].fill(0);
            inner.free.push(slot);
        }
    }

    /// Number of occupied records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().slots.len()
    }

    /// Whether no transfer is journalled.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().slots.is_empty()
    }

    /// Durably writes pending records.
    pub fn flush(&self) -> Result<(), JournalError> {
        self.lock().map.flush()?;
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Journal {
    /// Best-effort flush; disposal errors are swallowed.
    fn drop(&mut self) {
        if let Ok(inner) = self.inner.get_mut() {
            let _ = inner.map.flush();
        }
    }
}

fn read_entry(map: &MmapMut, fingerprint: u64, slot: usize) -> JournalEntry {
    let base = slot * RECORD_SIZE;
    let record = &map[base..base + RECORD_SIZE];
    let last_offset = i64::from_le_bytes(record[8..16].try_into().unwrap_or([0u8; 8])).max(0) as u64;
    let name = &record[16..];
    let end = name.iter().position(|byte| *byte == 0).unwrap_or(name.len());
    let target = String::from_utf8_lossy(&name[..end]).into_owned();
    JournalEntry { fingerprint, target, last_offset }
}

/// Extends the file by [`GROWTH_RECORDS`], remaps, and returns a fresh
/// slot. The old mapping is released before the file changes size.
fn grow(inner: &mut Inner) -> Result<usize, JournalError> {
    let old_len = inner.map.len();
    let old_records = old_len / RECORD_SIZE;

    let released = std::mem::replace(&mut inner.map, MmapMut::map_anon(RECORD_SIZE)?);
    released.flush()?;
    drop(released);

    inner.file.set_len((old_len + GROWTH_RECORDS * RECORD_SIZE) as u64)?;
    // SAFETY: same single-owner assumption as in `Journal::open`.
    inner.map = unsafe { MmapMut::map_mut(&inner.file)? };

    let new_records = inner.map.len() / RECORD_SIZE;
    for index in ((old_records + 1)..new_records).rev() {
        inner.free.push(index);
    }
    debug!(records = new_records, "journal grew");
    Ok(old_records)
}
