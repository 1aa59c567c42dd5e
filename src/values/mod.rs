//! # Value Proxies
//!
//! `PValue` is the transient runtime handle to one persistent value: a
//! counted store handle, a type id, and an offset. Reads and writes
//! resolve against the store's mapping at call time, so a closed store
//! renders every proxy inert instead of dangling — each operation begins
//! with a liveness check.
//!
//! Proxy identity is `(store, offset)`: `is_same_as` compares exactly
//! that. Value equality and ordering are defined by the type: scalars and
//! byte strings compare by contents, every other type by identity.
//! Comparison against plain (non-persistent) ints and floats uses the
//! usual numeric order; cross-type comparison is equality-only and always
//! unequal.

pub mod codec;
pub mod field;

use std::cmp::Ordering;
use std::sync::Arc;

use eyre::Result;

use crate::error::{type_err, value_err};
use crate::store::core::{StoreCore, StoreHandle};
use crate::types::{TypeId, TypeKind};
use crate::values::field::SlotSource;

/// A plain, non-persistent value used for comparisons and as an
/// assignment source.
#[derive(Debug, Clone, Copy)]
pub enum Plain<'a> {
    Null,
    Int(i64),
    Float(f64),
    Bytes(&'a [u8]),
}

/// Anything that can be assigned into a typed slot: a plain value (the
/// slot type's assignment rule applies) or an existing persistent value
/// (subtype and same-store checks apply).
pub enum Assign<'a> {
    Plain(Plain<'a>),
    Value(&'a PValue),
}

impl From<i64> for Plain<'_> {
    fn from(v: i64) -> Self {
        Plain::Int(v)
    }
}

impl From<i32> for Plain<'_> {
    fn from(v: i32) -> Self {
        Plain::Int(v as i64)
    }
}

impl From<f64> for Plain<'_> {
    fn from(v: f64) -> Self {
        Plain::Float(v)
    }
}

impl<'a> From<&'a [u8]> for Plain<'a> {
    fn from(v: &'a [u8]) -> Self {
        Plain::Bytes(v)
    }
}

impl<'a> From<&'a str> for Plain<'a> {
    fn from(v: &'a str) -> Self {
        Plain::Bytes(v.as_bytes())
    }
}

impl<'a> From<Plain<'a>> for Assign<'a> {
    fn from(v: Plain<'a>) -> Self {
        Assign::Plain(v)
    }
}

impl From<i64> for Assign<'_> {
    fn from(v: i64) -> Self {
        Assign::Plain(Plain::Int(v))
    }
}

impl From<i32> for Assign<'_> {
    fn from(v: i32) -> Self {
        Assign::Plain(Plain::Int(v as i64))
    }
}

impl From<f64> for Assign<'_> {
    fn from(v: f64) -> Self {
        Assign::Plain(Plain::Float(v))
    }
}

impl<'a> From<&'a [u8]> for Assign<'a> {
    fn from(v: &'a [u8]) -> Self {
        Assign::Plain(Plain::Bytes(v))
    }
}

impl<'a> From<&'a str> for Assign<'a> {
    fn from(v: &'a str) -> Self {
        Assign::Plain(Plain::Bytes(v.as_bytes()))
    }
}

impl<'a> From<&'a PValue> for Assign<'a> {
    fn from(v: &'a PValue) -> Self {
        Assign::Value(v)
    }
}

/// Proxy over one persistent value.
#[derive(Clone)]
pub struct PValue {
    pub(crate) handle: StoreHandle,
    pub(crate) type_id: TypeId,
    pub(crate) offset: u64,
}

impl std::fmt::Debug for PValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PValue")
            .field("type_id", &self.type_id)
            .field("offset", &self.offset)
            .finish()
    }
}

impl PValue {
    pub(crate) fn new(core: &Arc<StoreCore>, type_id: TypeId, offset: u64) -> Self {
        Self {
            handle: StoreHandle::for_offset(core, offset),
            type_id,
            offset,
        }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn type_name(&self) -> Result<String> {
        self.handle
            .core
            .with_state(|st| Ok(st.schema.ptype(self.type_id).name.clone()))
    }

    /// Proxy identity: same store, same offset.
    pub fn is_same_as(&self, other: &PValue) -> bool {
        self.handle.same_store(&other.handle) && self.offset == other.offset
    }

    fn kind(&self, st: &crate::store::core::CoreState) -> TypeKind {
        st.schema.ptype(self.type_id).kind.clone()
    }

    pub fn get_int(&self) -> Result<i64> {
        self.handle.core.with_state(|st| match self.kind(st) {
            TypeKind::Int => st.file.read_i64(self.offset),
            _ => Err(type_err("value is not an int")),
        })
    }

    pub fn set_int(&self, v: i64) -> Result<()> {
        self.handle.core.with_trx(|st| match self.kind(st) {
            TypeKind::Int => st.file.write_i64(self.offset, v),
            _ => Err(type_err("value is not an int")),
        })
    }

    /// In-place `+= delta`.
    pub fn add_int(&self, delta: i64) -> Result<()> {
        self.handle.core.with_trx(|st| match self.kind(st) {
            TypeKind::Int => {
                let v = st.file.read_i64(self.offset)?;
                st.file.write_i64(self.offset, v.wrapping_add(delta))
            }
            _ => Err(type_err("value is not an int")),
        })
    }

    pub fn increment(&self) -> Result<()> {
        self.add_int(1)
    }

    pub fn set_bit(&self, bit: u32) -> Result<()> {
        self.bit_op(bit, |v, mask| v | mask)
    }

    pub fn clear_bit(&self, bit: u32) -> Result<()> {
        self.bit_op(bit, |v, mask| v & !mask)
    }

    fn bit_op(&self, bit: u32, op: impl FnOnce(i64, i64) -> i64) -> Result<()> {
        if bit >= 64 {
            return Err(value_err(format!("bit index {bit} out of range")));
        }
        self.handle.core.with_trx(|st| match self.kind(st) {
            TypeKind::Int => {
                let v = st.file.read_i64(self.offset)?;
                st.file.write_i64(self.offset, op(v, 1i64 << bit))
            }
            _ => Err(type_err("value is not an int")),
        })
    }

    pub fn test_bit(&self, bit: u32) -> Result<bool> {
        if bit >= 64 {
            return Err(value_err(format!("bit index {bit} out of range")));
        }
        self.handle.core.with_state(|st| match self.kind(st) {
            TypeKind::Int => Ok(st.file.read_i64(self.offset)? & (1i64 << bit) != 0),
            _ => Err(type_err("value is not an int")),
        })
    }

    pub fn get_float(&self) -> Result<f64> {
        self.handle.core.with_state(|st| match self.kind(st) {
            TypeKind::Float => st.file.read_f64(self.offset),
            _ => Err(type_err("value is not a float")),
        })
    }

    pub fn set_float(&self, v: f64) -> Result<()> {
        self.handle.core.with_trx(|st| match self.kind(st) {
            TypeKind::Float => st.file.write_f64(self.offset, v),
            _ => Err(type_err("value is not a float")),
        })
    }

    /// In-place `+= delta`.
    pub fn add_float(&self, delta: f64) -> Result<()> {
        self.handle.core.with_trx(|st| match self.kind(st) {
            TypeKind::Float => {
                let v = st.file.read_f64(self.offset)?;
                st.file.write_f64(self.offset, v + delta)
            }
            _ => Err(type_err("value is not a float")),
        })
    }

    /// Contents of a byte-string value.
    pub fn bytes(&self) -> Result<Vec<u8>> {
        self.handle.core.with_state(|st| match self.kind(st) {
            TypeKind::Bytes => codec::read_bytes(&st.file, self.offset),
            _ => Err(type_err("value is not a byte string")),
        })
    }

    /// Value equality, defined by type. Scalars and byte strings compare
    /// by contents; all other types by identity; values of different
    /// types or stores are unequal.
    pub fn eq_value(&self, other: &PValue) -> Result<bool> {
        if !self.handle.same_store(&other.handle) {
            return Ok(false);
        }
        self.handle.core.with_state(|st| {
            let a = self.kind(st);
            let b = other.kind(st);
            match (&a, &b) {
                (TypeKind::Int, TypeKind::Int) => Ok(st.file.read_i64(self.offset)?
                    == st.file.read_i64(other.offset)?),
                (TypeKind::Float, TypeKind::Float) => Ok(st.file.read_f64(self.offset)?
                    == st.file.read_f64(other.offset)?),
                (TypeKind::Bytes, TypeKind::Bytes) => Ok(codec::compare_stored_bytes(
                    &st.file,
                    self.offset,
                    other.offset,
                )? == Ordering::Equal),
                _ if self.type_id == other.type_id => Ok(self.offset == other.offset),
                _ => Ok(false),
            }
        })
    }

    /// Ordering between persistent values of the same scalar or
    /// byte-string type; `None` for everything else.
    pub fn cmp_value(&self, other: &PValue) -> Result<Option<Ordering>> {
        if !self.handle.same_store(&other.handle) {
            return Ok(None);
        }
        self.handle.core.with_state(|st| {
            match (self.kind(st), other.kind(st)) {
                (TypeKind::Int, TypeKind::Int) => Ok(st
                    .file
                    .read_i64(self.offset)?
                    .partial_cmp(&st.file.read_i64(other.offset)?)),
                (TypeKind::Float, TypeKind::Float) => Ok(st
                    .file
                    .read_f64(self.offset)?
                    .partial_cmp(&st.file.read_f64(other.offset)?)),
                (TypeKind::Bytes, TypeKind::Bytes) => Ok(Some(codec::compare_stored_bytes(
                    &st.file,
                    self.offset,
                    other.offset,
                )?)),
                _ => Ok(None),
            }
        })
    }

    /// Equality against a plain value: numeric across int/float, content
    /// equality for bytes, unequal otherwise.
    pub fn eq_plain<'a>(&self, plain: impl Into<Plain<'a>>) -> Result<bool> {
        Ok(self.cmp_plain(plain)? == Some(Ordering::Equal))
    }

    /// Ordering against a plain value by the numeric / lexicographic
    /// rules; `None` where no order is defined.
    pub fn cmp_plain<'a>(&self, plain: impl Into<Plain<'a>>) -> Result<Option<Ordering>> {
        let plain = plain.into();
        self.handle.core.with_state(|st| {
            match (self.kind(st), plain) {
                (TypeKind::Int, Plain::Int(v)) => {
                    Ok(st.file.read_i64(self.offset)?.partial_cmp(&v))
                }
                (TypeKind::Int, Plain::Float(v)) => {
                    Ok((st.file.read_i64(self.offset)? as f64).partial_cmp(&v))
                }
                (TypeKind::Float, Plain::Float(v)) => {
                    Ok(st.file.read_f64(self.offset)?.partial_cmp(&v))
                }
                (TypeKind::Float, Plain::Int(v)) => {
                    Ok(st.file.read_f64(self.offset)?.partial_cmp(&(v as f64)))
                }
                (TypeKind::Bytes, Plain::Bytes(v)) => {
                    Ok(Some(codec::bytes_slice(&st.file, self.offset)?.cmp(v)))
                }
                _ => Ok(None),
            }
        })
    }

    /// Reads a named field of a structure value. `None` means the field
    /// is a null by-reference slot.
    pub fn field(&self, name: &str) -> Result<Option<PValue>> {
        let resolved = self.handle.core.with_state(|st| {
            let field = st.schema.field_of(self.type_id, name)?.clone();
            field::read_slot(
                &st.file,
                &st.schema,
                self.offset + field.offset,
                field.type_id,
            )
        })?;
        Ok(resolved.map(|(ty, at)| PValue::new(&self.handle.core, ty, at)))
    }

    /// Assigns into a named field following the uniform assignment
    /// contract.
    pub fn set_field<'a>(&self, name: &str, source: impl Into<Assign<'a>>) -> Result<()> {
        let source = source.into();
        let resolved = self.resolve_assign(&source)?;
        self.handle.core.with_trx(|st| {
            let field = st.schema.field_of(self.type_id, name)?.clone();
            field::assign_slot(
                &mut st.file,
                &st.schema,
                self.offset + field.offset,
                field.type_id,
                &resolved,
            )
        })
    }

    /// Lowers a public assignment source to a slot source, enforcing that
    /// persistent sources belong to this store.
    pub(crate) fn resolve_assign<'a>(&self, source: &Assign<'a>) -> Result<SlotSource<'a>> {
        resolve_assign_in(&self.handle.core, source)
    }
}

pub(crate) fn resolve_assign_in<'a>(
    core: &Arc<StoreCore>,
    source: &Assign<'a>,
) -> Result<SlotSource<'a>> {
    match source {
        Assign::Plain(Plain::Null) => Ok(SlotSource::Null),
        Assign::Plain(Plain::Int(v)) => Ok(SlotSource::Int(*v)),
        Assign::Plain(Plain::Float(v)) => Ok(SlotSource::Float(*v)),
        Assign::Plain(Plain::Bytes(v)) => Ok(SlotSource::Bytes(*v)),
        Assign::Value(value) => {
            if !Arc::ptr_eq(&value.handle.core, core) {
                return Err(type_err(
                    "cannot assign a value that belongs to another store",
                ));
            }
            Ok(SlotSource::Persist {
                type_id: value.type_id,
                offset: value.offset,
            })
        }
    }
}
