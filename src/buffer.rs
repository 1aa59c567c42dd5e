//! # Reconstructable Buffer
//!
//! A by-reference value that records a foreign producer's byte layout,
//! copied C-contiguously at creation:
//!
//! ```text
//! { len: u64, itemsize: u64, ndim: u64, format: u64,
//!   shape[ndim]: u64, strides[ndim]: u64, bytes[len] }
//! ```
//!
//! `format` is the offset of the interned format string. On read the
//! buffer exposes a read-write view over the stored bytes; consumers
//! requesting a non-C-contiguous layout are rejected with a value error.
//! This value type carries no conversion logic.

use eyre::Result;

use crate::containers::hash;
use crate::error::{type_err, value_err};
use crate::schema::Schema;
use crate::storage::{MappedFile, WORD};
use crate::types::TypeKind;
use crate::values::{codec, PValue};

const HEADER_WORDS: u64 = 4;

/// C-contiguous strides for a shape: the last dimension advances by
/// `itemsize`, each outer dimension by the span of the dimensions inside
/// it.
pub(crate) fn c_contiguous_strides(itemsize: u64, shape: &[u64]) -> Vec<u64> {
    let mut strides = vec![0u64; shape.len()];
    let mut span = itemsize;
    for (i, dim) in shape.iter().enumerate().rev() {
        strides[i] = span;
        span *= (*dim).max(1);
    }
    strides
}

pub(crate) fn create_buffer(
    file: &mut MappedFile,
    schema: &Schema,
    registry: u64,
    format: &str,
    itemsize: u64,
    shape: &[u64],
    data: &[u8],
) -> Result<u64> {
    if itemsize == 0 {
        return Err(value_err("buffer itemsize must be positive"));
    }

    let expected: u64 = if shape.is_empty() {
        itemsize
    } else {
        shape.iter().product::<u64>() * itemsize
    };
    if data.len() as u64 != expected {
        return Err(value_err(format!(
            "buffer data is {} bytes, shape and itemsize demand {expected}",
            data.len()
        )));
    }

    let format_at = hash::intern(file, schema, registry, format.as_bytes())?;
    let ndim = shape.len() as u64;
    let strides = c_contiguous_strides(itemsize, shape);

    let total = (HEADER_WORDS + 2 * ndim) * WORD + data.len() as u64;
    let at = file.allocate(total, WORD)?;

    file.write_u64(at, data.len() as u64)?;
    file.write_u64(at + WORD, itemsize)?;
    file.write_u64(at + 2 * WORD, ndim)?;
    file.write_u64(at + 3 * WORD, format_at)?;
    for (i, dim) in shape.iter().enumerate() {
        file.write_u64(at + (HEADER_WORDS + i as u64) * WORD, *dim)?;
    }
    for (i, stride) in strides.iter().enumerate() {
        file.write_u64(at + (HEADER_WORDS + ndim + i as u64) * WORD, *stride)?;
    }
    if !data.is_empty() {
        file.write(at + (HEADER_WORDS + 2 * ndim) * WORD, data)?;
    }

    Ok(at)
}

/// Typed view over a buffer value.
pub struct BufferView {
    value: PValue,
}

impl PValue {
    /// Views this value as a reconstructable buffer; fails with a type
    /// error when it is anything else.
    pub fn as_buffer(&self) -> Result<BufferView> {
        self.handle
            .core
            .with_state(|st| match st.schema.ptype(self.type_id).kind {
                TypeKind::Buffer => Ok(()),
                _ => Err(type_err("value is not a buffer")),
            })?;
        Ok(BufferView {
            value: self.clone(),
        })
    }
}

impl BufferView {
    pub fn proxy(&self) -> &PValue {
        &self.value
    }

    fn at(&self) -> u64 {
        self.value.offset
    }

    pub fn len(&self) -> Result<u64> {
        self.value
            .handle
            .core
            .with_state(|st| st.file.read_u64(self.at()))
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn itemsize(&self) -> Result<u64> {
        self.value
            .handle
            .core
            .with_state(|st| st.file.read_u64(self.at() + WORD))
    }

    pub fn ndim(&self) -> Result<u64> {
        self.value
            .handle
            .core
            .with_state(|st| st.file.read_u64(self.at() + 2 * WORD))
    }

    pub fn format(&self) -> Result<Vec<u8>> {
        self.value.handle.core.with_state(|st| {
            let format_at = st.file.read_u64(self.at() + 3 * WORD)?;
            codec::read_bytes(&st.file, format_at)
        })
    }

    pub fn shape(&self) -> Result<Vec<u64>> {
        self.dimension_words(0)
    }

    pub fn strides(&self) -> Result<Vec<u64>> {
        let ndim = self.ndim()?;
        self.dimension_words(ndim)
    }

    fn dimension_words(&self, skip: u64) -> Result<Vec<u64>> {
        self.value.handle.core.with_state(|st| {
            let ndim = st.file.read_u64(self.at() + 2 * WORD)?;
            let mut out = Vec::with_capacity(ndim as usize);
            for i in 0..ndim {
                out.push(
                    st.file
                        .read_u64(self.at() + (HEADER_WORDS + skip + i) * WORD)?,
                )
            }
            Ok(out)
        })
    }

    fn data_offset(&self, st: &crate::store::core::CoreState) -> Result<u64> {
        let ndim = st.file.read_u64(self.at() + 2 * WORD)?;
        Ok(self.at() + (HEADER_WORDS + 2 * ndim) * WORD)
    }

    /// The stored bytes, C-contiguous.
    pub fn bytes(&self) -> Result<Vec<u8>> {
        self.value.handle.core.with_state(|st| {
            let len = st.file.read_u64(self.at())?;
            let data = self.data_offset(st)?;
            Ok(st.file.bytes(data, len)?.to_vec())
        })
    }

    /// A consumer view with explicit strides. Only the buffer's own
    /// C-contiguous layout can be served.
    pub fn bytes_strided(&self, requested: &[u64]) -> Result<Vec<u8>> {
        let actual = self.strides()?;
        if requested != actual.as_slice() {
            return Err(value_err(
                "only C-contiguous buffer views are supported",
            ));
        }
        self.bytes()
    }

    /// In-place overwrite of stored bytes starting at `offset`.
    pub fn write_at(&self, offset: u64, bytes: &[u8]) -> Result<()> {
        self.value.handle.core.with_trx(|st| {
            let len = st.file.read_u64(self.at())?;
            if offset + bytes.len() as u64 > len {
                return Err(value_err(format!(
                    "write of {} bytes at {offset} exceeds buffer length {len}",
                    bytes.len()
                )));
            }
            let data = self.data_offset(st)?;
            st.file.write(data + offset, bytes)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strides_are_c_contiguous() {
        assert_eq!(c_contiguous_strides(8, &[2, 3, 4]), vec![96, 32, 8]);
        assert_eq!(c_contiguous_strides(4, &[5]), vec![4]);
        assert_eq!(c_contiguous_strides(8, &[]), Vec::<u64>::new());
    }
}
