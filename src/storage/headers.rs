//! # File Header Definitions
//!
//! Type-safe, zerocopy-based header structs for both PinDB file kinds. Each
//! header is exactly 128 bytes and occupies the start of its page; the rest
//! of the page is padding.
//!
//! ## Primary File Header
//!
//! Two identical slots live at offsets 0 and 4096. A slot is *clean* when
//! its status byte is `C`; the current slot is the clean one with the
//! highest revision, the other is the shadow the next commit overwrites.
//!
//! ```text
//! Offset  Size  Description
//! 0       32    Magic: "pindb file v1", NUL-padded (bounded, len <= 31)
//! 32      1     Status: b'C' (clean) or b'D' (dirty)
//! 33      7     Padding
//! 40      8     Revision (u64 LE), strictly increasing across commits
//! 48      8     Last applied redo file number (reserved)
//! 56      8     Last applied transaction offset (reserved)
//! 64      8     free_offset: bump-allocator high-water mark
//! 72      8     Offset of the string registry
//! 80      8     Offset of the persisted type list
//! 88      8     Offset of the root value
//! 96      32    Reserved
//! ```
//!
//! ## Redo File Header
//!
//! ```text
//! Offset  Size  Description
//! 0       32    Magic: "pindb redo v1", NUL-padded
//! 32      8     Offset of the first transaction (= header page size)
//! 40      8     Cached tail: first byte past the last committed transaction
//! 48      80    Reserved
//! ```
//!
//! All multi-byte fields are little-endian via `zerocopy` wrappers; sizes
//! are pinned with compile-time assertions. The descriptor tag alphabet and
//! the checksum choice are versioned with these magics: changing either
//! requires a magic bump.

use eyre::Result;
use zerocopy::little_endian::U64;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::error::corrupt;

pub const HEADER_SIZE: usize = 128;

pub const FILE_MAGIC: &[u8; 32] = b"pindb file v1\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0";
pub const REDO_MAGIC: &[u8; 32] = b"pindb redo v1\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0";

pub const STATUS_CLEAN: u8 = b'C';
pub const STATUS_DIRTY: u8 = b'D';

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct FileHeader {
    magic: [u8; 32],
    status: u8,
    _pad: [u8; 7],
    revision: U64,
    last_applied_redo_file: U64,
    last_applied_trx: U64,
    free_offset: U64,
    string_registry: U64,
    type_list: U64,
    root: U64,
    reserved: [u8; 32],
}

const _: () = assert!(std::mem::size_of::<FileHeader>() == HEADER_SIZE);

impl FileHeader {
    pub fn new_dirty() -> Self {
        Self {
            magic: *FILE_MAGIC,
            status: STATUS_DIRTY,
            _pad: [0; 7],
            revision: U64::new(0),
            last_applied_redo_file: U64::new(0),
            last_applied_trx: U64::new(0),
            free_offset: U64::new(0),
            string_registry: U64::new(0),
            type_list: U64::new(0),
            root: U64::new(0),
            reserved: [0; 32],
        }
    }

    pub fn clean(
        revision: u64,
        free_offset: u64,
        string_registry: u64,
        type_list: u64,
        root: u64,
    ) -> Self {
        Self {
            magic: *FILE_MAGIC,
            status: STATUS_CLEAN,
            _pad: [0; 7],
            revision: U64::new(revision),
            last_applied_redo_file: U64::new(0),
            last_applied_trx: U64::new(0),
            free_offset: U64::new(free_offset),
            string_registry: U64::new(string_registry),
            type_list: U64::new(type_list),
            root: U64::new(root),
            reserved: [0; 32],
        }
    }

    /// Parses a header slot, verifying the magic. A slot that fails here is
    /// unusable but does not condemn the file; the other slot may be fine.
    pub fn from_bytes(bytes: &[u8]) -> Result<&Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(corrupt(format!(
                "header slot truncated: {} < {} bytes",
                bytes.len(),
                HEADER_SIZE
            )));
        }

        let header = Self::ref_from_bytes(&bytes[..HEADER_SIZE])
            .map_err(|e| corrupt(format!("unparseable header slot: {e:?}")))?;

        if &header.magic != FILE_MAGIC {
            return Err(corrupt("bad magic in primary file header"));
        }

        Ok(header)
    }

    pub fn is_clean(&self) -> bool {
        self.status == STATUS_CLEAN
    }

    pub fn revision(&self) -> u64 {
        self.revision.get()
    }

    pub fn free_offset(&self) -> u64 {
        self.free_offset.get()
    }

    pub fn string_registry(&self) -> u64 {
        self.string_registry.get()
    }

    pub fn type_list(&self) -> u64 {
        self.type_list.get()
    }

    pub fn root(&self) -> u64 {
        self.root.get()
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct RedoFileHeader {
    magic: [u8; 32],
    first_trx: U64,
    tail: U64,
    reserved: [u8; 80],
}

const _: () = assert!(std::mem::size_of::<RedoFileHeader>() == HEADER_SIZE);

impl RedoFileHeader {
    pub fn new(first_trx: u64) -> Self {
        Self {
            magic: *REDO_MAGIC,
            first_trx: U64::new(first_trx),
            tail: U64::new(first_trx),
            reserved: [0; 80],
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<&Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(corrupt(format!(
                "redo header truncated: {} < {} bytes",
                bytes.len(),
                HEADER_SIZE
            )));
        }

        let header = Self::ref_from_bytes(&bytes[..HEADER_SIZE])
            .map_err(|e| corrupt(format!("unparseable redo header: {e:?}")))?;

        if &header.magic != REDO_MAGIC {
            return Err(corrupt("bad magic in redo file header"));
        }

        Ok(header)
    }

    pub fn first_trx(&self) -> u64 {
        self.first_trx.get()
    }

    pub fn tail(&self) -> u64 {
        self.tail.get()
    }

    pub fn set_tail(&mut self, tail: u64) {
        self.tail = U64::new(tail);
    }
}

/// On-log transaction header. A transaction is committed iff the CRC-64
/// checksum over its `length` payload bytes verifies.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct TrxHeader {
    pub length: U64,
    pub checksum: U64,
    pub free_offset: U64,
}

pub const TRX_HEADER_SIZE: usize = 24;
const _: () = assert!(std::mem::size_of::<TrxHeader>() == TRX_HEADER_SIZE);

/// On-log redo record header, followed by `length` payload bytes destined
/// for `target` in the primary file.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct RecordHeader {
    pub target: U64,
    pub length: U64,
}

pub const RECORD_HEADER_SIZE: usize = 16;
const _: () = assert!(std::mem::size_of::<RecordHeader>() == RECORD_HEADER_SIZE);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;

    #[test]
    fn file_header_roundtrip() {
        let header = FileHeader::clean(7, 8192, 8192, 8240, 8300);
        let bytes = header.as_bytes();
        let parsed = FileHeader::from_bytes(bytes).unwrap();

        assert!(parsed.is_clean());
        assert_eq!(parsed.revision(), 7);
        assert_eq!(parsed.free_offset(), 8192);
        assert_eq!(parsed.string_registry(), 8192);
        assert_eq!(parsed.type_list(), 8240);
        assert_eq!(parsed.root(), 8300);
    }

    #[test]
    fn dirty_header_is_not_clean() {
        let header = FileHeader::new_dirty();
        let parsed = FileHeader::from_bytes(header.as_bytes()).unwrap();

        assert!(!parsed.is_clean());
        assert_eq!(parsed.revision(), 0);
    }

    #[test]
    fn bad_magic_is_corruption() {
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[..16].copy_from_slice(b"definitely wrong");

        let err = FileHeader::from_bytes(&bytes).unwrap_err();
        assert!(matches!(
            StoreError::of(&err),
            Some(StoreError::Corruption(_))
        ));
    }

    #[test]
    fn redo_header_tail_updates() {
        let mut header = RedoFileHeader::new(4096);
        assert_eq!(header.first_trx(), 4096);
        assert_eq!(header.tail(), 4096);

        header.set_tail(9000);
        let parsed = RedoFileHeader::from_bytes(header.as_bytes()).unwrap();
        assert_eq!(parsed.tail(), 9000);
    }

    #[test]
    fn magics_are_nul_padded_bounded_strings() {
        assert!(FILE_MAGIC.iter().position(|&b| b == 0).unwrap() <= 31);
        assert!(REDO_MAGIC.iter().position(|&b| b == 0).unwrap() <= 31);
        assert_ne!(FILE_MAGIC, REDO_MAGIC);
    }
}
