//! # Redo Log
//!
//! Append-only journal of byte-range updates to the primary file. The log
//! is a second memory-mapped file: one header page, then a sequence of
//! checksummed transactions.
//!
//! ## Transaction Format
//!
//! ```text
//! +-----------------------------+
//! | TrxHeader                   |  length, CRC-64 checksum, free_offset
//! +-----------------------------+
//! | RecordHeader | bytes[len]   |  target offset in the primary file
//! +-----------------------------+
//! | RecordHeader | bytes[len]   |
//! |            ...              |
//! +-----------------------------+
//! ```
//!
//! A transaction is committed iff the checksum computed over its payload
//! (the record sequence) equals the header's checksum. The header also
//! carries the bump allocator's post-transaction `free_offset`, so replay
//! restores the allocator mark together with the data.
//!
//! ## Write Protocol
//!
//! 1. `begin` reserves the header at the cached tail and starts a
//!    streaming digest
//! 2. `save` appends a record, updating the digest
//! 3. `commit` finalizes the digest into the header, advances the tail,
//!    and flushes (sync or async)
//!
//! A transaction that saved nothing is dropped without touching the log.
//!
//! ## Recovery
//!
//! `recover` scans forward from the first transaction and hands each
//! verified transaction's records to the caller in order. A zero length
//! marks the end of the log; the first checksum mismatch marks a torn
//! transaction, which is discarded together with everything after it.
//!
//! ## Checksum
//!
//! CRC-64/ECMA-182, an integrity check only (not a security boundary).
//! The redo magic is version-tagged; changing the checksum or the record
//! format requires a magic bump.

use std::fs::OpenOptions;
use std::path::Path;

use crc::{Crc, CRC_64_ECMA_182};
use eyre::{Result, WrapErr};
use memmap2::MmapMut;
use zerocopy::{FromBytes, IntoBytes};

use crate::error::{corrupt, io_err, StoreError};
use crate::storage::headers::{
    RecordHeader, RedoFileHeader, TrxHeader, HEADER_SIZE, RECORD_HEADER_SIZE, TRX_HEADER_SIZE,
};
use crate::storage::{page_aligned, FlushMode, PAGE_SIZE};

static CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

pub struct RedoLog {
    map: MmapMut,
    real_size: u64,
    first_trx: u64,
    tail: u64,
    open: Option<OpenTrx>,
}

struct OpenTrx {
    payload_len: u64,
    digest: crc::Digest<'static, u64>,
}

/// What a recovery scan found and applied.
#[derive(Debug, Default)]
pub struct RecoveryOutcome {
    pub applied: usize,
    pub discarded_torn: bool,
    pub free_offset: Option<u64>,
}

impl RedoLog {
    /// Creates a fresh log sized to hold `capacity` bytes of transactions.
    pub fn create(path: &Path, capacity: u64) -> Result<Self> {
        let real_size = PAGE_SIZE + page_aligned(capacity);

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(io_err)
            .wrap_err_with(|| format!("failed to create redo log '{}'", path.display()))?;

        file.set_len(real_size)
            .map_err(io_err)
            .wrap_err_with(|| format!("failed to size redo log to {real_size} bytes"))?;

        // SAFETY: the file was just created with exclusive access and sized
        // to real_size; the mapping's lifetime is tied to RedoLog and all
        // access below is bounds-checked against real_size.
        let mut map = unsafe {
            MmapMut::map_mut(&file)
                .map_err(io_err)
                .wrap_err_with(|| format!("failed to map redo log '{}'", path.display()))?
        };

        let header = RedoFileHeader::new(PAGE_SIZE);
        map[..HEADER_SIZE].copy_from_slice(header.as_bytes());
        map.flush().map_err(io_err).wrap_err("failed to flush new redo header")?;

        Ok(Self {
            map,
            real_size,
            first_trx: PAGE_SIZE,
            tail: PAGE_SIZE,
            open: None,
        })
    }

    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(io_err)
            .wrap_err_with(|| format!("failed to open redo log '{}'", path.display()))?;

        let real_size = file
            .metadata()
            .map_err(io_err)
            .wrap_err("failed to stat redo log")?
            .len();

        if real_size < PAGE_SIZE {
            return Err(corrupt(format!(
                "redo log truncated to {real_size} bytes, below its header page"
            )));
        }

        // SAFETY: exclusive single-process access by contract; the mapping's
        // lifetime is tied to RedoLog and all access is bounds-checked.
        let map = unsafe {
            MmapMut::map_mut(&file)
                .map_err(io_err)
                .wrap_err_with(|| format!("failed to map redo log '{}'", path.display()))?
        };

        let header = RedoFileHeader::from_bytes(&map[..HEADER_SIZE])?;
        let first_trx = header.first_trx();
        let tail = header.tail();

        if first_trx != PAGE_SIZE || tail < first_trx || tail > real_size {
            return Err(corrupt(format!(
                "redo header out of range: first_trx={first_trx}, tail={tail}, size={real_size}"
            )));
        }

        Ok(Self {
            map,
            real_size,
            first_trx,
            tail,
            open: None,
        })
    }

    pub fn tail(&self) -> u64 {
        self.tail
    }

    pub fn in_transaction(&self) -> bool {
        self.open.is_some()
    }

    /// Reserves the tail transaction header and starts a streaming digest.
    pub fn begin(&mut self) -> Result<()> {
        eyre::ensure!(self.open.is_none(), "redo transaction already open");

        if self.tail + TRX_HEADER_SIZE as u64 > self.real_size {
            return Err(StoreError::RedoFull.into());
        }

        self.open = Some(OpenTrx {
            payload_len: 0,
            digest: CRC64.digest(),
        });

        Ok(())
    }

    /// Appends one redo record carrying the new bytes for `target`.
    pub fn save(&mut self, target: u64, bytes: &[u8]) -> Result<()> {
        let trx = self
            .open
            .as_mut()
            .ok_or_else(|| eyre::eyre!("redo save outside of a transaction"))?;

        let record_at = self.tail + TRX_HEADER_SIZE as u64 + trx.payload_len;
        let record_len = RECORD_HEADER_SIZE as u64 + bytes.len() as u64;

        if record_at + record_len > self.real_size {
            return Err(StoreError::RedoFull.into());
        }

        let header = RecordHeader {
            target: target.into(),
            length: (bytes.len() as u64).into(),
        };

        let at = record_at as usize;
        self.map[at..at + RECORD_HEADER_SIZE].copy_from_slice(header.as_bytes());
        self.map[at + RECORD_HEADER_SIZE..at + RECORD_HEADER_SIZE + bytes.len()]
            .copy_from_slice(bytes);

        trx.digest.update(header.as_bytes());
        trx.digest.update(bytes);
        trx.payload_len += record_len;

        Ok(())
    }

    /// Finalizes the digest into the transaction header, advances the tail,
    /// and flushes. An empty transaction is dropped without a trace.
    pub fn commit(&mut self, free_offset: u64, mode: FlushMode) -> Result<()> {
        let trx = self
            .open
            .take()
            .ok_or_else(|| eyre::eyre!("redo commit outside of a transaction"))?;

        if trx.payload_len == 0 {
            return Ok(());
        }

        let header = TrxHeader {
            length: trx.payload_len.into(),
            checksum: trx.digest.finalize().into(),
            free_offset: free_offset.into(),
        };

        let at = self.tail as usize;
        self.map[at..at + TRX_HEADER_SIZE].copy_from_slice(header.as_bytes());

        self.tail += TRX_HEADER_SIZE as u64 + trx.payload_len;
        self.write_header()?;
        self.flush(mode)?;

        Ok(())
    }

    /// Drops the open transaction. Its bytes stay beyond the tail where no
    /// scan will accept them: the next commit overwrites them.
    pub fn abandon(&mut self) {
        self.open = None;
    }

    /// Scans forward from the first transaction, handing each verified
    /// transaction's records to `apply` in order. Stops at the end marker
    /// or the first torn transaction; the cached tail is rewritten to the
    /// end of the last verified transaction.
    pub fn recover(
        &mut self,
        mut apply: impl FnMut(u64, &[u8]) -> Result<()>,
    ) -> Result<RecoveryOutcome> {
        eyre::ensure!(self.open.is_none(), "recovery with a transaction open");

        let mut outcome = RecoveryOutcome::default();
        let mut pos = self.first_trx;

        loop {
            if pos + TRX_HEADER_SIZE as u64 > self.real_size {
                break;
            }

            let at = pos as usize;
            let header = TrxHeader::read_from_bytes(&self.map[at..at + TRX_HEADER_SIZE])
                .map_err(|e| corrupt(format!("unreadable transaction header: {e:?}")))?;

            let length = header.length.get();
            if length == 0 {
                break;
            }

            let payload_at = pos + TRX_HEADER_SIZE as u64;
            if payload_at + length > self.real_size {
                outcome.discarded_torn = true;
                break;
            }

            let payload = &self.map[payload_at as usize..(payload_at + length) as usize];
            if CRC64.checksum(payload) != header.checksum.get() {
                outcome.discarded_torn = true;
                break;
            }

            let mut rpos = 0usize;
            while rpos < payload.len() {
                if rpos + RECORD_HEADER_SIZE > payload.len() {
                    return Err(corrupt("redo record header crosses its payload end"));
                }
                let record =
                    RecordHeader::read_from_bytes(&payload[rpos..rpos + RECORD_HEADER_SIZE])
                        .map_err(|e| corrupt(format!("unreadable redo record: {e:?}")))?;
                let data_at = rpos + RECORD_HEADER_SIZE;
                let data_end = data_at + record.length.get() as usize;
                if data_end > payload.len() {
                    return Err(corrupt("redo record data crosses its payload end"));
                }

                apply(record.target.get(), &payload[data_at..data_end])?;
                rpos = data_end;
            }

            outcome.applied += 1;
            outcome.free_offset = Some(header.free_offset.get());
            pos = payload_at + length;
        }

        self.tail = pos;
        self.write_header()?;

        Ok(outcome)
    }

    /// Empties the log: the tail returns to the first transaction slot and
    /// an end marker is written there, so stale transactions beyond it can
    /// never be replayed.
    pub fn reset(&mut self) -> Result<()> {
        self.open = None;
        self.tail = self.first_trx;

        let at = self.first_trx as usize;
        self.map[at..at + TRX_HEADER_SIZE].copy_from_slice(&[0u8; TRX_HEADER_SIZE]);
        self.write_header()?;
        self.flush(FlushMode::Sync)?;

        Ok(())
    }

    pub fn flush(&self, mode: FlushMode) -> Result<()> {
        match mode {
            FlushMode::Sync => self
                .map
                .flush()
                .map_err(io_err)
                .wrap_err("failed to sync redo log"),
            FlushMode::Async => self
                .map
                .flush_async()
                .map_err(io_err)
                .wrap_err("failed to schedule redo log write-back"),
        }
    }

    fn write_header(&mut self) -> Result<()> {
        let mut header = RedoFileHeader::new(self.first_trx);
        header.set_tail(self.tail);
        self.map[..HEADER_SIZE].copy_from_slice(header.as_bytes());
        Ok(())
    }
}
