//! # Mapped Arena
//!
//! `MappedFile` owns the primary file descriptor and its mapping, publishes
//! the real size and the bump allocator's `free_offset`, and funnels every
//! byte mutation through one place.
//!
//! ## Allocation
//!
//! Allocation advances `free_offset` and never reclaims: the region handed
//! out is freshly extended sparse-file territory, which the OS guarantees
//! to read as zeros. Callers rely on that and never zero new regions.
//!
//! ## The Write Funnel
//!
//! The mapping is private to this module. The only mutating accessors are
//! `write` and the typed wrappers over it, and when a redo transaction is
//! open they journal the bytes before touching memory. Once journaling is
//! armed (after the first clean commit), a data write outside a
//! transaction is an internal bug and is rejected. Header slots are the
//! commit mechanism itself and bypass the journal by design; they are only
//! written by the commit path and recovery.
//!
//! ## Safety Model
//!
//! The mapping is created once and never remapped: the file cannot grow,
//! so `&self`/`&mut self` borrows are enough to keep slice access sound,
//! following the borrow-checker-as-guard approach used across the storage
//! layer. All slice math is bounds-checked against the mapped size.

use std::fs::OpenOptions;
use std::path::Path;

use eyre::{ensure, Result, WrapErr};
use memmap2::MmapMut;

use crate::error::{io_err, StoreError};
use crate::storage::headers::{FileHeader, HEADER_SIZE};
use crate::storage::{align_up, page_aligned, FlushMode, RedoLog, DATA_START, SLOT_OFFSETS};

pub struct MappedFile {
    map: MmapMut,
    real_size: u64,
    free_offset: u64,
    redo: Option<RedoLog>,
    journaling_armed: bool,
    zero_allocations: bool,
}

impl MappedFile {
    /// Creates the primary file: two header pages plus a data region of
    /// `data_bytes` rounded up to whole pages.
    pub fn create(path: &Path, data_bytes: u64) -> Result<Self> {
        let real_size = DATA_START + page_aligned(data_bytes);

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(io_err)
            .wrap_err_with(|| format!("failed to create store file '{}'", path.display()))?;

        file.set_len(real_size)
            .map_err(io_err)
            .wrap_err_with(|| format!("failed to size store file to {real_size} bytes"))?;

        // SAFETY: the file was just created with exclusive access
        // (create_new) and sized before mapping; the mapping's lifetime is
        // tied to MappedFile, and every access is bounds-checked.
        let map = unsafe {
            MmapMut::map_mut(&file)
                .map_err(io_err)
                .wrap_err_with(|| format!("failed to map store file '{}'", path.display()))?
        };

        Ok(Self {
            map,
            real_size,
            free_offset: DATA_START,
            redo: None,
            journaling_armed: false,
            zero_allocations: false,
        })
    }

    /// Maps an existing primary file at its current size.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(io_err)
            .wrap_err_with(|| format!("failed to open store file '{}'", path.display()))?;

        let real_size = file
            .metadata()
            .map_err(io_err)
            .wrap_err("failed to stat store file")?
            .len();

        ensure!(
            real_size >= DATA_START,
            StoreError::Corruption(format!(
                "store file is {real_size} bytes, smaller than its header region"
            ))
        );

        // SAFETY: single-process exclusive access by contract; the mapping's
        // lifetime is tied to MappedFile, and every access is bounds-checked.
        let map = unsafe {
            MmapMut::map_mut(&file)
                .map_err(io_err)
                .wrap_err_with(|| format!("failed to map store file '{}'", path.display()))?
        };

        Ok(Self {
            map,
            real_size,
            free_offset: DATA_START,
            redo: None,
            journaling_armed: false,
            zero_allocations: true,
        })
    }

    pub fn real_size(&self) -> u64 {
        self.real_size
    }

    pub fn free_offset(&self) -> u64 {
        self.free_offset
    }

    /// Adopts the allocator mark recorded in a header or a replayed
    /// transaction.
    pub fn set_free_offset(&mut self, offset: u64) {
        self.free_offset = offset.clamp(DATA_START, self.real_size);
    }

    pub fn attach_redo(&mut self, redo: RedoLog) {
        self.redo = Some(redo);
    }

    pub fn detach_redo(&mut self) -> Option<RedoLog> {
        self.redo.take()
    }

    pub fn redo_mut(&mut self) -> Option<&mut RedoLog> {
        self.redo.as_mut()
    }

    /// After the first clean commit every data write must run inside a
    /// transaction; this switch makes the funnel enforce that. It also
    /// turns on journaled zero-fill for allocations, since the fresh-file
    /// zero guarantee no longer holds once regions can be reclaimed by a
    /// torn-tail rollback.
    pub fn arm_journaling(&mut self) {
        self.journaling_armed = true;
        self.zero_allocations = true;
    }

    pub fn begin_trx(&mut self) -> Result<()> {
        if let Some(redo) = &mut self.redo {
            redo.begin()?;
        }
        Ok(())
    }

    pub fn commit_trx(&mut self, mode: FlushMode) -> Result<()> {
        let free_offset = self.free_offset;
        if let Some(redo) = &mut self.redo {
            redo.commit(free_offset, mode)?;
        }
        Ok(())
    }

    pub fn abandon_trx(&mut self) {
        if let Some(redo) = &mut self.redo {
            redo.abandon();
        }
    }

    /// Returns the aligned pre-increment `free_offset`. The bytes handed
    /// out read as zeros: a freshly created file guarantees that by
    /// itself, while regions of a reopened store (which may hold stale
    /// bytes from a discarded transaction tail) are zero-filled through
    /// the journaled funnel so replay reproduces them.
    pub fn allocate(&mut self, len: u64, align: u64) -> Result<u64> {
        let at = align_up(self.free_offset, align);

        if at + len > self.real_size {
            return Err(StoreError::Full.into());
        }

        self.free_offset = at + len;
        if self.zero_allocations && len > 0 {
            let zeros = vec![0u8; len as usize];
            self.write(at, &zeros)?;
        }
        Ok(at)
    }

    /// Bounds-checked read of allocated data-region bytes.
    pub fn bytes(&self, offset: u64, len: u64) -> Result<&[u8]> {
        ensure!(
            offset >= DATA_START && offset + len <= self.free_offset,
            "read of [{offset}, +{len}) outside the allocated region (free_offset={})",
            self.free_offset
        );
        Ok(&self.map[offset as usize..(offset + len) as usize])
    }

    /// The journaled write funnel: records the bytes into the open redo
    /// transaction, then mutates the mapping.
    pub fn write(&mut self, offset: u64, bytes: &[u8]) -> Result<()> {
        let len = bytes.len() as u64;
        ensure!(
            offset >= DATA_START && offset + len <= self.free_offset,
            "write of [{offset}, +{len}) outside the allocated region (free_offset={})",
            self.free_offset
        );

        if let Some(redo) = &mut self.redo {
            if redo.in_transaction() {
                redo.save(offset, bytes).map_err(|e| {
                    // The redo log running out blocks the primary write.
                    if matches!(StoreError::of(&e), Some(StoreError::RedoFull)) {
                        eyre::Report::from(StoreError::Full)
                    } else {
                        e
                    }
                })?;
            } else {
                ensure!(
                    !self.journaling_armed,
                    "data write at {offset} outside of a redo transaction"
                );
            }
        }

        self.map[offset as usize..(offset + len) as usize].copy_from_slice(bytes);
        Ok(())
    }

    pub fn read_u64(&self, offset: u64) -> Result<u64> {
        let bytes: [u8; 8] = self
            .bytes(offset, 8)?
            .try_into()
            .map_err(|_| eyre::eyre!("short read of a word at {offset}"))?;
        Ok(u64::from_le_bytes(bytes))
    }

    pub fn read_i64(&self, offset: u64) -> Result<i64> {
        let bytes: [u8; 8] = self
            .bytes(offset, 8)?
            .try_into()
            .map_err(|_| eyre::eyre!("short read of a word at {offset}"))?;
        Ok(i64::from_le_bytes(bytes))
    }

    pub fn read_f64(&self, offset: u64) -> Result<f64> {
        let bytes: [u8; 8] = self
            .bytes(offset, 8)?
            .try_into()
            .map_err(|_| eyre::eyre!("short read of a word at {offset}"))?;
        Ok(f64::from_le_bytes(bytes))
    }

    pub fn read_u32(&self, offset: u64) -> Result<u32> {
        let bytes: [u8; 4] = self
            .bytes(offset, 4)?
            .try_into()
            .map_err(|_| eyre::eyre!("short read of a length at {offset}"))?;
        Ok(u32::from_le_bytes(bytes))
    }

    pub fn write_u64(&mut self, offset: u64, value: u64) -> Result<()> {
        self.write(offset, &value.to_le_bytes())
    }

    pub fn write_i64(&mut self, offset: u64, value: i64) -> Result<()> {
        self.write(offset, &value.to_le_bytes())
    }

    pub fn write_f64(&mut self, offset: u64, value: f64) -> Result<()> {
        self.write(offset, &value.to_le_bytes())
    }

    pub fn write_u32(&mut self, offset: u64, value: u32) -> Result<()> {
        self.write(offset, &value.to_le_bytes())
    }

    /// Raw application of a replayed redo record. Recovery runs before the
    /// allocator mark is adopted, so bounds are checked against the mapped
    /// size only.
    pub fn apply_redo_record(&mut self, offset: u64, bytes: &[u8]) -> Result<()> {
        let len = bytes.len() as u64;
        ensure!(
            offset >= DATA_START && offset + len <= self.real_size,
            StoreError::Corruption(format!(
                "replayed record [{offset}, +{len}) falls outside the file"
            ))
        );
        self.map[offset as usize..(offset + len) as usize].copy_from_slice(bytes);
        Ok(())
    }

    pub fn header_slot(&self, slot: usize) -> &[u8] {
        let at = SLOT_OFFSETS[slot] as usize;
        &self.map[at..at + HEADER_SIZE]
    }

    /// Writes a header slot directly. This is the durable commit mechanism
    /// and deliberately bypasses the journal; only the commit path and
    /// recovery call it.
    pub fn write_header_slot(&mut self, slot: usize, header: &FileHeader) {
        use zerocopy::IntoBytes;
        let at = SLOT_OFFSETS[slot] as usize;
        self.map[at..at + HEADER_SIZE].copy_from_slice(header.as_bytes());
    }

    pub fn flush(&self, mode: FlushMode) -> Result<()> {
        match mode {
            FlushMode::Sync => self
                .map
                .flush()
                .map_err(io_err)
                .wrap_err("failed to sync store file"),
            FlushMode::Async => self
                .map
                .flush_async()
                .map_err(io_err)
                .wrap_err("failed to schedule store file write-back"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_rounds_data_region_to_pages() {
        let dir = tempdir().unwrap();
        let file = MappedFile::create(&dir.path().join("a.pin"), 1).unwrap();

        assert_eq!(file.real_size(), DATA_START + crate::storage::PAGE_SIZE);
        assert_eq!(file.free_offset(), DATA_START);
    }

    #[test]
    fn allocations_are_aligned_disjoint_and_monotonic() {
        let dir = tempdir().unwrap();
        let mut file = MappedFile::create(&dir.path().join("a.pin"), 4096).unwrap();

        let a = file.allocate(12, 8).unwrap();
        let b = file.allocate(8, 8).unwrap();

        assert_eq!(a, DATA_START);
        assert_eq!(b, DATA_START + 16);
        assert_eq!(a % 8, 0);
        assert_eq!(b % 8, 0);
        assert!(file.free_offset() > b);
    }

    #[test]
    fn allocation_past_capacity_fails_full() {
        let dir = tempdir().unwrap();
        let mut file = MappedFile::create(&dir.path().join("a.pin"), 1).unwrap();

        let err = file.allocate(2 * crate::storage::PAGE_SIZE, 8).unwrap_err();
        assert!(matches!(StoreError::of(&err), Some(StoreError::Full)));
    }

    #[test]
    fn fresh_allocations_read_as_zeros() {
        let dir = tempdir().unwrap();
        let mut file = MappedFile::create(&dir.path().join("a.pin"), 4096).unwrap();

        let at = file.allocate(64, 8).unwrap();
        assert_eq!(file.bytes(at, 64).unwrap(), &[0u8; 64]);
    }

    #[test]
    fn writes_roundtrip_through_typed_helpers() {
        let dir = tempdir().unwrap();
        let mut file = MappedFile::create(&dir.path().join("a.pin"), 4096).unwrap();

        let at = file.allocate(24, 8).unwrap();
        file.write_i64(at, -42).unwrap();
        file.write_f64(at + 8, 2.5).unwrap();
        file.write_u64(at + 16, u64::MAX).unwrap();

        assert_eq!(file.read_i64(at).unwrap(), -42);
        assert_eq!(file.read_f64(at + 8).unwrap(), 2.5);
        assert_eq!(file.read_u64(at + 16).unwrap(), u64::MAX);
    }

    #[test]
    fn out_of_region_access_is_rejected() {
        let dir = tempdir().unwrap();
        let mut file = MappedFile::create(&dir.path().join("a.pin"), 4096).unwrap();

        assert!(file.bytes(0, 8).is_err());
        assert!(file.write_u64(DATA_START, 1).is_err());

        let at = file.allocate(8, 8).unwrap();
        assert!(file.write_u64(at, 1).is_ok());
        assert!(file.write_u64(at + 8, 1).is_err());
    }

    #[test]
    fn armed_journaling_rejects_untracked_writes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.pin");
        let redo_path = dir.path().join("a.redo");

        let mut file = MappedFile::create(&path, 4096).unwrap();
        file.attach_redo(RedoLog::create(&redo_path, 4096).unwrap());
        let at = file.allocate(8, 8).unwrap();
        file.arm_journaling();

        assert!(file.write_u64(at, 1).is_err());

        file.begin_trx().unwrap();
        assert!(file.write_u64(at, 1).is_ok());
        file.commit_trx(FlushMode::Sync).unwrap();
    }
}
