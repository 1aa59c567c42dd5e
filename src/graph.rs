//! # Property Graph
//!
//! Typed directed edges between typed nodes, with per-kind incidence
//! lists. The kind of an edge is its edge type; the kind's textual name
//! is interned in the string registry, so per-node kind records compare
//! kinds by a single offset.
//!
//! ## Layout
//!
//! ```text
//! node:  { in_kinds: u64, out_kinds: u64, value_slot: u64 }
//! edge:  { from: u64, to: u64, next_from: u64, next_to: u64, value_slot: u64 }
//! kind:  { kind_name: u64, first_edge: u64, next: u64 }
//! ```
//!
//! `in_kinds` / `out_kinds` head singly linked lists of kind records,
//! created on demand. An edge is inserted at construction into the
//! from-node's out-list of its kind and the to-node's in-list, both O(1)
//! prepends, so traversal yields edges most-recently-inserted first.

use eyre::Result;

use crate::containers::hash;
use crate::error::type_err;
use crate::schema::Schema;
use crate::storage::{MappedFile, NULL_OFFSET, WORD};
use crate::types::{TypeId, TypeKind};
use crate::values::field::{self, SlotSource};
use crate::values::PValue;

pub(crate) fn create_node(
    file: &mut MappedFile,
    schema: &Schema,
    value_ty: TypeId,
    source: &SlotSource<'_>,
) -> Result<u64> {
    let node = file.allocate(3 * WORD, WORD)?;
    field::assign_slot(file, schema, node + 2 * WORD, value_ty, source)?;
    Ok(node)
}

/// Walks a kind list for the record of `kind_name`.
fn find_kind(file: &MappedFile, head_slot: u64, kind_name: u64) -> Result<Option<u64>> {
    let mut at = file.read_u64(head_slot)?;
    while at != NULL_OFFSET {
        if file.read_u64(at)? == kind_name {
            return Ok(Some(at));
        }
        at = file.read_u64(at + 2 * WORD)?;
    }
    Ok(None)
}

/// Finds or prepends the kind record of `kind_name` on one kind list.
fn ensure_kind(file: &mut MappedFile, head_slot: u64, kind_name: u64) -> Result<u64> {
    if let Some(record) = find_kind(file, head_slot, kind_name)? {
        return Ok(record);
    }

    let record = file.allocate(3 * WORD, WORD)?;
    let head = file.read_u64(head_slot)?;
    file.write_u64(record, kind_name)?;
    file.write_u64(record + 2 * WORD, head)?;
    file.write_u64(head_slot, record)?;
    Ok(record)
}

/// Allocates an edge tying `from_node` to `to_node` and links it into
/// both endpoints' per-kind incidence lists.
pub(crate) fn create_edge(
    file: &mut MappedFile,
    schema: &Schema,
    registry: u64,
    kind_name: &str,
    value_ty: TypeId,
    from_node: u64,
    to_node: u64,
    source: &SlotSource<'_>,
) -> Result<u64> {
    let kind = hash::intern(file, schema, registry, kind_name.as_bytes())?;

    let edge = file.allocate(5 * WORD, WORD)?;
    file.write_u64(edge, from_node)?;
    file.write_u64(edge + WORD, to_node)?;
    field::assign_slot(file, schema, edge + 4 * WORD, value_ty, source)?;

    // Out-edges of the from node, then in-edges of the to node; each is a
    // prepend with the edge's own pointer written before publication.
    let out_kind = ensure_kind(file, from_node + WORD, kind)?;
    let first = file.read_u64(out_kind + WORD)?;
    file.write_u64(edge + 2 * WORD, first)?;
    file.write_u64(out_kind + WORD, edge)?;

    let in_kind = ensure_kind(file, to_node, kind)?;
    let first = file.read_u64(in_kind + WORD)?;
    file.write_u64(edge + 3 * WORD, first)?;
    file.write_u64(in_kind + WORD, edge)?;

    Ok(edge)
}

#[derive(Debug, Clone, Copy)]
enum Direction {
    In,
    Out,
}

/// Edge offsets of one kind on one node, most recently inserted first.
fn edges_of(
    file: &MappedFile,
    node: u64,
    kind_name: u64,
    direction: Direction,
) -> Result<Vec<u64>> {
    let head_slot = match direction {
        Direction::In => node,
        Direction::Out => node + WORD,
    };
    let Some(record) = find_kind(file, head_slot, kind_name)? else {
        return Ok(Vec::new());
    };

    let mut out = Vec::new();
    let mut at = file.read_u64(record + WORD)?;
    while at != NULL_OFFSET {
        out.push(at);
        at = match direction {
            Direction::Out => file.read_u64(at + 2 * WORD)?,
            Direction::In => file.read_u64(at + 3 * WORD)?,
        };
    }
    Ok(out)
}

/// Typed view over a graph node value.
pub struct NodeView {
    value: PValue,
    value_ty: TypeId,
}

impl PValue {
    /// Views this value as a graph node; fails with a type error when it
    /// is anything else.
    pub fn as_node(&self) -> Result<NodeView> {
        let value_ty = self
            .handle
            .core
            .with_state(|st| match st.schema.ptype(self.type_id).kind {
                TypeKind::Node { value } => Ok(value),
                _ => Err(type_err("value is not a graph node")),
            })?;
        Ok(NodeView {
            value: self.clone(),
            value_ty,
        })
    }

    /// Views this value as a graph edge; fails with a type error when it
    /// is anything else.
    pub fn as_edge(&self) -> Result<EdgeView> {
        let (value_ty, from_ty, to_ty) = self.handle.core.with_state(|st| {
            match st.schema.ptype(self.type_id).kind {
                TypeKind::Edge { value, from, to } => Ok((value, from, to)),
                _ => Err(type_err("value is not a graph edge")),
            }
        })?;
        Ok(EdgeView {
            value: self.clone(),
            value_ty,
            from_ty,
            to_ty,
        })
    }
}

impl NodeView {
    pub fn proxy(&self) -> &PValue {
        &self.value
    }

    /// The node's payload; `None` for a null by-reference slot.
    pub fn value(&self) -> Result<Option<PValue>> {
        let core = &self.value.handle.core;
        let resolved = core.with_state(|st| {
            field::read_slot(
                &st.file,
                &st.schema,
                self.value.offset + 2 * WORD,
                self.value_ty,
            )
        })?;
        Ok(resolved.map(|(ty, at)| PValue::new(core, ty, at)))
    }

    /// Edges of `kind` arriving at this node, most recent first.
    pub fn in_edges(&self, kind: &str) -> Result<Vec<PValue>> {
        self.edges(kind, Direction::In)
    }

    /// Edges of `kind` leaving this node, most recent first.
    pub fn out_edges(&self, kind: &str) -> Result<Vec<PValue>> {
        self.edges(kind, Direction::Out)
    }

    fn edges(&self, kind: &str, direction: Direction) -> Result<Vec<PValue>> {
        let core = &self.value.handle.core;

        let (edge_ty, offsets) = core.with_state(|st| {
            let edge_ty = st.schema.type_of(kind)?;
            if !matches!(st.schema.ptype(edge_ty).kind, TypeKind::Edge { .. }) {
                return Err(type_err(format!("'{kind}' is not an edge type")));
            }

            let Some(kind_name) =
                hash::find_interned(&st.file, &st.schema, st.string_registry, kind.as_bytes())?
            else {
                // No edge of this kind was ever created in this store.
                return Ok((edge_ty, Vec::new()));
            };

            Ok((
                edge_ty,
                edges_of(&st.file, self.value.offset, kind_name, direction)?,
            ))
        })?;

        Ok(offsets
            .into_iter()
            .map(|at| PValue::new(core, edge_ty, at))
            .collect())
    }
}

/// Typed view over a graph edge value.
pub struct EdgeView {
    value: PValue,
    value_ty: TypeId,
    from_ty: TypeId,
    to_ty: TypeId,
}

impl std::fmt::Debug for EdgeView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EdgeView")
            .field("value", &self.value)
            .field("value_ty", &self.value_ty)
            .field("from_ty", &self.from_ty)
            .field("to_ty", &self.to_ty)
            .finish()
    }
}

impl EdgeView {
    pub fn proxy(&self) -> &PValue {
        &self.value
    }

    pub fn from_node(&self) -> Result<PValue> {
        let core = &self.value.handle.core;
        let at = core.with_state(|st| st.file.read_u64(self.value.offset))?;
        Ok(PValue::new(core, self.from_ty, at))
    }

    pub fn to_node(&self) -> Result<PValue> {
        let core = &self.value.handle.core;
        let at = core.with_state(|st| st.file.read_u64(self.value.offset + WORD))?;
        Ok(PValue::new(core, self.to_ty, at))
    }

    /// The edge's payload; `None` for a null by-reference slot.
    pub fn value(&self) -> Result<Option<PValue>> {
        let core = &self.value.handle.core;
        let resolved = core.with_state(|st| {
            field::read_slot(
                &st.file,
                &st.schema,
                self.value.offset + 4 * WORD,
                self.value_ty,
            )
        })?;
        Ok(resolved.map(|(ty, at)| PValue::new(core, ty, at)))
    }
}
