//! # Persistent Skip List
//!
//! Sorted container with probabilistic balancing, laid out in the arena:
//!
//! ```text
//! list:  { head: u64, len: u64 }
//! node:  { level: u64, nexts: u64, value_slot: u64 }
//! nexts: level x u64 forward pointers (offset array)
//! ```
//!
//! The head is a sentinel whose level equals the maximum level ever
//! inserted. Node levels are drawn from the geometric distribution
//! `P[L >= k+1] = 1/3`, capped at 32. When an insert draws a higher level
//! than the head's, the head's pointer array is reallocated and extended
//! with null pointers before the new array is published; the old array's
//! bytes are abandoned (storage is append-only).
//!
//! ## Ordering
//!
//! Level 0 is sorted ascending by the element's sort key, extracted per
//! the list type's `OrderSpec`:
//!
//! - `Natural`: the element itself (int, float or byte string; inserting
//!   a structure fails with a type error)
//! - `Field(name)`: the named field of a structure element
//! - `Named(tag)`: a pre-compiled key function from the open-time
//!   registry
//!
//! `insert` walks the cut list of per-level predecessors and splices; the
//! new node's own pointers are written before any predecessor is updated,
//! so a partially linked node is never observable.

use eyre::Result;
use smallvec::SmallVec;

use crate::error::{type_err, value_err, StoreError};
use crate::schema::Schema;
use crate::storage::{MappedFile, NULL_OFFSET, WORD};
use crate::types::{ElemView, OrderSpec, SortKey, TypeId, TypeKind};
use crate::values::field::{self, SlotSource};
use crate::values::{Assign, PValue, Plain};

pub(crate) const MAX_LEVEL: u64 = 32;

pub(crate) fn create(file: &mut MappedFile) -> Result<u64> {
    let list = file.allocate(2 * WORD, WORD)?;
    let head = file.allocate(3 * WORD, WORD)?;
    let nexts = file.allocate(WORD, WORD)?;

    file.write_u64(head, 1)?;
    file.write_u64(head + WORD, nexts)?;
    file.write_u64(list, head)?;
    Ok(list)
}

fn draw_level() -> u64 {
    let mut level = 1;
    while level < MAX_LEVEL && rand::random::<u32>() % 3 == 0 {
        level += 1;
    }
    level
}

fn node_level(file: &MappedFile, node: u64) -> Result<u64> {
    file.read_u64(node)
}

fn next_of(file: &MappedFile, node: u64, level: u64) -> Result<u64> {
    let nexts = file.read_u64(node + WORD)?;
    file.read_u64(nexts + level * WORD)
}

fn set_next(file: &mut MappedFile, node: u64, level: u64, target: u64) -> Result<()> {
    let nexts = file.read_u64(node + WORD)?;
    file.write_u64(nexts + level * WORD, target)
}

/// Extracts the sort key of an element already resolved to a view.
fn key_of_view(view: &ElemView<'_>, order: &OrderSpec, schema: &Schema) -> Result<SortKey> {
    match order {
        OrderSpec::Natural => view.natural_key(),
        OrderSpec::Field(name) => view.field(name)?.natural_key(),
        OrderSpec::Named(tag) => {
            let f = schema.order_fn(tag).ok_or_else(|| {
                value_err(format!("order function '{tag}' is not registered"))
            })?;
            f(view)
        }
    }
}

/// Extracts the sort key of the element stored in `node`'s value slot.
fn node_key(
    file: &MappedFile,
    schema: &Schema,
    elem_ty: TypeId,
    order: &OrderSpec,
    node: u64,
) -> Result<SortKey> {
    let Some((ty, at)) = field::read_slot(file, schema, node + 2 * WORD, elem_ty)? else {
        return Err(crate::error::corrupt("skip-list node holds a null element"));
    };
    let view = ElemView {
        file,
        schema,
        type_id: ty,
        offset: at,
    };
    key_of_view(&view, order, schema)
}

/// Extracts the sort key of an incoming element before it is stored.
fn source_key(
    file: &MappedFile,
    schema: &Schema,
    order: &OrderSpec,
    source: &SlotSource<'_>,
) -> Result<SortKey> {
    match source {
        SlotSource::Persist { type_id, offset } => {
            let view = ElemView {
                file,
                schema,
                type_id: *type_id,
                offset: *offset,
            };
            key_of_view(&view, order, schema)
        }
        SlotSource::Int(v) => match order {
            OrderSpec::Natural => Ok(SortKey::Int(*v)),
            _ => Err(type_err("a plain int only fits a naturally ordered list")),
        },
        SlotSource::Float(v) => match order {
            OrderSpec::Natural => Ok(SortKey::Float(*v)),
            _ => Err(type_err("a plain float only fits a naturally ordered list")),
        },
        SlotSource::Bytes(data) => match order {
            OrderSpec::Natural => Ok(SortKey::Bytes(data.to_vec())),
            _ => Err(type_err("plain bytes only fit a naturally ordered list")),
        },
        SlotSource::Null => Err(value_err("cannot insert null into a skip list")),
    }
}

fn key_of_plain(plain: &Plain<'_>) -> Result<SortKey> {
    match plain {
        Plain::Int(v) => Ok(SortKey::Int(*v)),
        Plain::Float(v) => Ok(SortKey::Float(*v)),
        Plain::Bytes(data) => Ok(SortKey::Bytes(data.to_vec())),
        Plain::Null => Err(value_err("null is not a skip-list key")),
    }
}

/// Per-level predecessors of the position where `key` belongs.
fn cut_list(
    file: &MappedFile,
    schema: &Schema,
    elem_ty: TypeId,
    order: &OrderSpec,
    head: u64,
    key: &SortKey,
) -> Result<SmallVec<[u64; MAX_LEVEL as usize]>> {
    let head_level = node_level(file, head)?;
    let mut cut: SmallVec<[u64; MAX_LEVEL as usize]> =
        SmallVec::from_elem(head, head_level as usize);

    let mut at = head;
    for level in (0..head_level).rev() {
        loop {
            let next = next_of(file, at, level)?;
            if next == NULL_OFFSET {
                break;
            }
            let next_key = node_key(file, schema, elem_ty, order, next)?;
            if next_key.compare(key)? == std::cmp::Ordering::Less {
                at = next;
            } else {
                break;
            }
        }
        cut[level as usize] = at;
    }

    Ok(cut)
}

/// Typed view over a skip-list value.
pub struct SkipListView {
    value: PValue,
    elem_ty: TypeId,
    order: OrderSpec,
}

impl PValue {
    /// Views this value as a skip list; fails with a type error when it
    /// is anything else.
    pub fn as_skip_list(&self) -> Result<SkipListView> {
        let (elem_ty, order) = self.handle.core.with_state(|st| {
            match st.schema.ptype(self.type_id).kind.clone() {
                TypeKind::SkipList { elem, order } => Ok((elem, order)),
                _ => Err(type_err("value is not a skip list")),
            }
        })?;
        Ok(SkipListView {
            value: self.clone(),
            elem_ty,
            order,
        })
    }
}

impl SkipListView {
    pub fn value(&self) -> &PValue {
        &self.value
    }

    pub fn len(&self) -> Result<u64> {
        self.value
            .handle
            .core
            .with_state(|st| st.file.read_u64(self.value.offset + WORD))
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Inserts an element at its sorted position.
    pub fn insert<'a>(&self, source: impl Into<Assign<'a>>) -> Result<()> {
        let source = source.into();
        let resolved = self.value.resolve_assign(&source)?;

        self.value.handle.core.with_trx(|st| {
            let head = st.file.read_u64(self.value.offset)?;
            let key = source_key(&st.file, &st.schema, &self.order, &resolved)?;
            let mut cut = cut_list(&st.file, &st.schema, self.elem_ty, &self.order, head, &key)?;

            let new_level = draw_level();

            // Re-level the head first when the draw exceeds it: the new
            // pointer array is fully written before it is published.
            let head_level = node_level(&st.file, head)?;
            if new_level > head_level {
                let fresh = st.file.allocate(new_level * WORD, WORD)?;
                for level in 0..head_level {
                    let next = next_of(&st.file, head, level)?;
                    st.file.write_u64(fresh + level * WORD, next)?;
                }
                st.file.write_u64(head + WORD, fresh)?;
                st.file.write_u64(head, new_level)?;
                cut.resize(new_level as usize, head);
            }

            let node = st.file.allocate(3 * WORD, WORD)?;
            let nexts = st.file.allocate(new_level * WORD, WORD)?;
            st.file.write_u64(node, new_level)?;
            st.file.write_u64(node + WORD, nexts)?;
            field::assign_slot(&mut st.file, &st.schema, node + 2 * WORD, self.elem_ty, &resolved)?;

            // Write the node's own forward pointers, then splice the
            // predecessors.
            for level in 0..new_level {
                let succ = next_of(&st.file, cut[level as usize], level)?;
                st.file.write_u64(nexts + level * WORD, succ)?;
            }
            for level in 0..new_level {
                set_next(&mut st.file, cut[level as usize], level, node)?;
            }

            let len = st.file.read_u64(self.value.offset + WORD)?;
            st.file.write_u64(self.value.offset + WORD, len + 1)
        })
    }

    /// First element whose key equals `key`; `KeyNotFound` when absent.
    pub fn find<'a>(&self, key: impl Into<Plain<'a>>) -> Result<PValue> {
        let key = key_of_plain(&key.into())?;
        let core = &self.value.handle.core;

        let resolved = core.with_state(|st| {
            let head = st.file.read_u64(self.value.offset)?;
            let cut = cut_list(&st.file, &st.schema, self.elem_ty, &self.order, head, &key)?;

            let candidate = next_of(&st.file, cut[0], 0)?;
            if candidate == NULL_OFFSET {
                return Err(StoreError::KeyNotFound.into());
            }
            let found = node_key(&st.file, &st.schema, self.elem_ty, &self.order, candidate)?;
            if found.compare(&key)? != std::cmp::Ordering::Equal {
                return Err(StoreError::KeyNotFound.into());
            }

            field::read_slot(&st.file, &st.schema, candidate + 2 * WORD, self.elem_ty)?
                .ok_or_else(|| crate::error::corrupt("skip-list node holds a null element"))
        })?;

        let (ty, at) = resolved;
        Ok(PValue::new(core, ty, at))
    }

    /// Elements with keys in `[from, to)`, in ascending order. A null
    /// bound is open: `range(None, None)` walks the whole list.
    pub fn range<'a, 'b>(
        &self,
        from: Option<Plain<'a>>,
        to: Option<Plain<'b>>,
    ) -> Result<Vec<PValue>> {
        let from = from.map(|p| key_of_plain(&p)).transpose()?;
        let to = to.map(|p| key_of_plain(&p)).transpose()?;
        let core = &self.value.handle.core;

        let resolved = core.with_state(|st| {
            let head = st.file.read_u64(self.value.offset)?;

            let mut at = match &from {
                Some(from) => {
                    let cut =
                        cut_list(&st.file, &st.schema, self.elem_ty, &self.order, head, from)?;
                    next_of(&st.file, cut[0], 0)?
                }
                None => next_of(&st.file, head, 0)?,
            };

            let mut out = Vec::new();
            while at != NULL_OFFSET {
                if let Some(to) = &to {
                    let key = node_key(&st.file, &st.schema, self.elem_ty, &self.order, at)?;
                    if key.compare(to)? != std::cmp::Ordering::Less {
                        break;
                    }
                }
                if let Some(slot) =
                    field::read_slot(&st.file, &st.schema, at + 2 * WORD, self.elem_ty)?
                {
                    out.push(slot);
                }
                at = next_of(&st.file, at, 0)?;
            }
            Ok(out)
        })?;

        Ok(resolved
            .into_iter()
            .map(|(ty, at)| PValue::new(core, ty, at))
            .collect())
    }

    /// The whole list in ascending key order.
    pub fn iter(&self) -> Result<Vec<PValue>> {
        self.range(None, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drawn_levels_stay_in_range() {
        for _ in 0..1000 {
            let level = draw_level();
            assert!((1..=MAX_LEVEL).contains(&level));
        }
    }
}
