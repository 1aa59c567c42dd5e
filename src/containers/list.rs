//! # Persistent Singly Linked List
//!
//! ```text
//! list:   { head: u64, tail: u64 }
//! entry:  { next: u64, value_slot: u64 }
//! ```
//!
//! `insert` prepends and `append` extends through the tail offset, both
//! O(1); iteration walks first to last. Lists are unbounded except by the
//! file's capacity. The persisted type list reuses this layout through
//! the hidden `__type_list` type.

use eyre::Result;

use crate::error::type_err;
use crate::schema::Schema;
use crate::storage::{MappedFile, NULL_OFFSET, WORD};
use crate::types::{TypeId, TypeKind};
use crate::values::field::{self, SlotSource};
use crate::values::{Assign, PValue};

pub(crate) fn create(file: &mut MappedFile) -> Result<u64> {
    // Fresh allocations read as zeros: head and tail start null.
    file.allocate(2 * WORD, WORD)
}

fn new_entry(
    file: &mut MappedFile,
    schema: &Schema,
    elem_ty: TypeId,
    source: &SlotSource<'_>,
) -> Result<u64> {
    let entry = file.allocate(2 * WORD, WORD)?;
    field::assign_slot(file, schema, entry + WORD, elem_ty, source)?;
    Ok(entry)
}

/// Prepends, becoming the new head.
pub(crate) fn push_front(
    file: &mut MappedFile,
    schema: &Schema,
    list: u64,
    elem_ty: TypeId,
    source: &SlotSource<'_>,
) -> Result<u64> {
    let entry = new_entry(file, schema, elem_ty, source)?;

    let head = file.read_u64(list)?;
    file.write_u64(entry, head)?;
    file.write_u64(list, entry)?;
    if file.read_u64(list + WORD)? == NULL_OFFSET {
        file.write_u64(list + WORD, entry)?;
    }
    Ok(entry)
}

/// Appends through the tail offset.
pub(crate) fn append(
    file: &mut MappedFile,
    schema: &Schema,
    list: u64,
    elem_ty: TypeId,
    source: &SlotSource<'_>,
) -> Result<u64> {
    let entry = new_entry(file, schema, elem_ty, source)?;

    let tail = file.read_u64(list + WORD)?;
    if tail == NULL_OFFSET {
        file.write_u64(list, entry)?;
    } else {
        file.write_u64(tail, entry)?;
    }
    file.write_u64(list + WORD, entry)?;
    Ok(entry)
}

/// Entry offsets in first-to-last order.
pub(crate) fn entries(file: &MappedFile, list: u64) -> Result<Vec<u64>> {
    let mut out = Vec::new();
    let mut at = file.read_u64(list)?;
    while at != NULL_OFFSET {
        out.push(at);
        at = file.read_u64(at)?;
    }
    Ok(out)
}

/// Typed view over a linked-list value.
pub struct ListView {
    value: PValue,
    elem_ty: TypeId,
}

impl PValue {
    /// Views this value as a linked list; fails with a type error when it
    /// is anything else.
    pub fn as_list(&self) -> Result<ListView> {
        let elem_ty = self
            .handle
            .core
            .with_state(|st| match st.schema.ptype(self.type_id).kind {
                TypeKind::List { elem } => Ok(elem),
                _ => Err(type_err("value is not a list")),
            })?;
        Ok(ListView {
            value: self.clone(),
            elem_ty,
        })
    }
}

impl ListView {
    pub fn value(&self) -> &PValue {
        &self.value
    }

    /// O(1) prepend.
    pub fn insert<'a>(&self, source: impl Into<Assign<'a>>) -> Result<()> {
        let source = source.into();
        let resolved = self.value.resolve_assign(&source)?;
        self.value.handle.core.with_trx(|st| {
            push_front(
                &mut st.file,
                &st.schema,
                self.value.offset,
                self.elem_ty,
                &resolved,
            )
            .map(|_| ())
        })
    }

    /// O(1) append via the tail offset.
    pub fn append<'a>(&self, source: impl Into<Assign<'a>>) -> Result<()> {
        let source = source.into();
        let resolved = self.value.resolve_assign(&source)?;
        self.value.handle.core.with_trx(|st| {
            append(
                &mut st.file,
                &st.schema,
                self.value.offset,
                self.elem_ty,
                &resolved,
            )
            .map(|_| ())
        })
    }

    pub fn is_empty(&self) -> Result<bool> {
        self.value
            .handle
            .core
            .with_state(|st| Ok(st.file.read_u64(self.value.offset)? == NULL_OFFSET))
    }

    /// Proxies for every element in first-to-last order; `None` marks an
    /// entry whose by-reference slot is null.
    pub fn iter(&self) -> Result<Vec<Option<PValue>>> {
        let core = &self.value.handle.core;
        let resolved = core.with_state(|st| {
            let mut out = Vec::new();
            for entry in entries(&st.file, self.value.offset)? {
                out.push(field::read_slot(
                    &st.file,
                    &st.schema,
                    entry + WORD,
                    self.elem_ty,
                )?);
            }
            Ok(out)
        })?;

        Ok(resolved
            .into_iter()
            .map(|slot| slot.map(|(ty, at)| PValue::new(core, ty, at)))
            .collect())
    }
}
