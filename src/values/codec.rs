//! # Scalar and Byte-String Codecs
//!
//! In-place readers and writers for the primitive value representations:
//! 64-bit integers and floats inline in their slots, byte strings as a
//! 32-bit length followed by raw bytes in their own region. All access
//! goes through the arena's journaled write funnel.
//!
//! The stable content hash used by persistent hash tables is CRC-64 over
//! the canonical little-endian bytes; it must not change without a file
//! magic bump, because bucket positions are persisted.

use crc::{Crc, CRC_64_ECMA_182};
use eyre::Result;

use crate::storage::{MappedFile, WORD};

static CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

/// Stable 64-bit content hash for persisted bucket placement.
pub(crate) fn content_hash(bytes: &[u8]) -> u64 {
    CRC64.checksum(bytes)
}

/// Allocates and writes a stand-alone byte string: u32 length, then bytes.
pub(crate) fn alloc_bytes(file: &mut MappedFile, data: &[u8]) -> Result<u64> {
    let at = file.allocate(4 + data.len() as u64, WORD)?;
    file.write_u32(at, data.len() as u32)?;
    if !data.is_empty() {
        file.write(at + 4, data)?;
    }
    Ok(at)
}

pub(crate) fn read_bytes(file: &MappedFile, offset: u64) -> Result<Vec<u8>> {
    Ok(bytes_slice(file, offset)?.to_vec())
}

pub(crate) fn bytes_slice(file: &MappedFile, offset: u64) -> Result<&[u8]> {
    let len = file.read_u32(offset)? as u64;
    file.bytes(offset + 4, len)
}

/// Lexicographic byte-string order with length tiebreak, which is exactly
/// what slice comparison yields.
pub(crate) fn compare_stored_bytes(
    file: &MappedFile,
    a_offset: u64,
    b_offset: u64,
) -> Result<std::cmp::Ordering> {
    let a = bytes_slice(file, a_offset)?;
    let b = bytes_slice(file, b_offset)?;
    Ok(a.cmp(b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::DATA_START;
    use tempfile::tempdir;

    fn arena() -> (tempfile::TempDir, MappedFile) {
        let dir = tempdir().unwrap();
        let file = MappedFile::create(&dir.path().join("a.pin"), 16 * 4096).unwrap();
        (dir, file)
    }

    #[test]
    fn byte_strings_roundtrip() {
        let (_dir, mut file) = arena();

        let at = alloc_bytes(&mut file, b"James Bond").unwrap();
        assert!(at >= DATA_START);
        assert_eq!(read_bytes(&file, at).unwrap(), b"James Bond");
    }

    #[test]
    fn empty_byte_string_is_just_a_length() {
        let (_dir, mut file) = arena();

        let at = alloc_bytes(&mut file, b"").unwrap();
        assert_eq!(read_bytes(&file, at).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn stored_bytes_compare_lexicographically_with_length_tiebreak() {
        use std::cmp::Ordering::*;
        let (_dir, mut file) = arena();

        let a = alloc_bytes(&mut file, b"Bond").unwrap();
        let b = alloc_bytes(&mut file, b"Bond, James").unwrap();
        let c = alloc_bytes(&mut file, b"Bond").unwrap();

        assert_eq!(compare_stored_bytes(&file, a, b).unwrap(), Less);
        assert_eq!(compare_stored_bytes(&file, b, a).unwrap(), Greater);
        assert_eq!(compare_stored_bytes(&file, a, c).unwrap(), Equal);
    }

    #[test]
    fn content_hash_is_stable_for_equal_bytes() {
        assert_eq!(content_hash(b"moneypenny"), content_hash(b"moneypenny"));
        assert_ne!(content_hash(b"moneypenny"), content_hash(b"tanner"));
    }
}
