//! # Persistent Type System
//!
//! Runtime descriptions of every persistent type a store can hold. A
//! `PType` names a type and fixes its storage contract:
//!
//! - **Allocation size**: bytes a stand-alone value occupies (dynamic for
//!   byte strings and buffers).
//! - **Assignment size**: bytes written into a containing slot, always one
//!   word here — by-value types inline their word, by-reference types
//!   store the offset of a stand-alone region.
//! - **Assignment kind**: by-value (int, float) or by-reference
//!   (everything else).
//!
//! Structure layouts are canonical: fields are sorted by name when the
//! type is defined, so the layout is stable across reopens regardless of
//! declaration order.
//!
//! Skip-list element ordering is described by an `OrderSpec`, persisted as
//! a short tag; `named:` tags resolve against a registry of pre-compiled
//! key functions at open time. No executable code is ever persisted.

pub mod descriptor;

use std::cmp::Ordering;
use std::sync::Arc;

use eyre::Result;

use crate::error::type_err;
use crate::schema::Schema;
use crate::storage::{MappedFile, WORD};

/// Index of a type within its store's schema. Only meaningful together
/// with the store that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeId(pub(crate) u32);

impl TypeId {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// One named field of a structure, with its slot offset fixed at
/// type-definition time.
#[derive(Debug, Clone)]
pub struct FieldDef {
    pub name: String,
    pub type_id: TypeId,
    pub offset: u64,
}

#[derive(Debug, Clone)]
pub enum TypeKind {
    Int,
    Float,
    Bytes,
    Struct {
        fields: Vec<FieldDef>,
        bases: Vec<TypeId>,
        volatile_bases: Vec<String>,
        size: u64,
    },
    List {
        elem: TypeId,
    },
    Hash {
        key: TypeId,
        value: Option<TypeId>,
        default_insert: bool,
    },
    SkipList {
        elem: TypeId,
        order: OrderSpec,
    },
    Node {
        value: TypeId,
    },
    Edge {
        value: TypeId,
        from: TypeId,
        to: TypeId,
    },
    Buffer,
}

#[derive(Debug, Clone)]
pub struct PType {
    pub name: String,
    pub kind: TypeKind,
}

impl PType {
    /// By-value types live inline in their containing slot.
    pub fn is_by_value(&self) -> bool {
        matches!(self.kind, TypeKind::Int | TypeKind::Float)
    }

    /// Bytes written into a containing slot on assignment: the inline word
    /// for by-value types, the offset word for by-reference types.
    pub fn assign_size(&self) -> u64 {
        WORD
    }

    /// Bytes a stand-alone value occupies, when that is fixed by the type.
    /// Byte strings and buffers size themselves from their contents.
    pub fn alloc_size(&self) -> Option<u64> {
        match &self.kind {
            TypeKind::Int | TypeKind::Float => Some(WORD),
            TypeKind::Bytes | TypeKind::Buffer => None,
            TypeKind::Struct { size, .. } => Some(*size),
            TypeKind::List { .. } => Some(2 * WORD),
            TypeKind::Hash { .. } => Some(4 * WORD),
            TypeKind::SkipList { .. } => Some(2 * WORD),
            TypeKind::Node { .. } => Some(3 * WORD),
            TypeKind::Edge { .. } => Some(5 * WORD),
        }
    }

    /// Hidden types carry the reserved `__` prefix: they exist in every
    /// store but are not exposed in the schema nor independently persisted.
    pub fn is_hidden(&self) -> bool {
        self.name.starts_with("__")
    }
}

/// How a skip list orders its elements. Persisted as a short tag
/// (`natural`, `field:<name>`, `named:<tag>`); never as code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderSpec {
    /// The element itself is the key; it must be an int, float or byte
    /// string.
    Natural,
    /// The element is a structure; the named field's scalar or byte-string
    /// value is the key.
    Field(String),
    /// A pre-compiled key function, looked up by tag in the registry the
    /// store was opened with.
    Named(String),
}

impl OrderSpec {
    pub fn to_tag(&self) -> String {
        match self {
            OrderSpec::Natural => "natural".to_owned(),
            OrderSpec::Field(name) => format!("field:{name}"),
            OrderSpec::Named(tag) => format!("named:{tag}"),
        }
    }

    pub fn parse_tag(tag: &str) -> Result<Self> {
        if tag == "natural" {
            return Ok(OrderSpec::Natural);
        }
        if let Some(name) = tag.strip_prefix("field:") {
            return Ok(OrderSpec::Field(name.to_owned()));
        }
        if let Some(name) = tag.strip_prefix("named:") {
            return Ok(OrderSpec::Named(name.to_owned()));
        }
        Err(crate::error::corrupt(format!(
            "unrecognized skip-list order tag '{tag}'"
        )))
    }
}

/// A materialized sort key. Ints and floats order numerically against each
/// other; byte strings order lexicographically among themselves and do not
/// order against numbers.
#[derive(Debug, Clone, PartialEq)]
pub enum SortKey {
    Int(i64),
    Float(f64),
    Bytes(Vec<u8>),
}

impl SortKey {
    pub fn compare(&self, other: &SortKey) -> Result<Ordering> {
        use SortKey::*;
        let ord = match (self, other) {
            (Int(a), Int(b)) => a.cmp(b),
            (Float(a), Float(b)) => a.partial_cmp(b).unwrap_or(Ordering::Equal),
            (Int(a), Float(b)) => (*a as f64).partial_cmp(b).unwrap_or(Ordering::Equal),
            (Float(a), Int(b)) => a.partial_cmp(&(*b as f64)).unwrap_or(Ordering::Equal),
            (Bytes(a), Bytes(b)) => a.cmp(b),
            _ => {
                return Err(type_err(
                    "byte-string keys do not order against numeric keys",
                ))
            }
        };
        Ok(ord)
    }
}

/// Read-only view over one stored element, handed to registered key
/// functions so they can extract a sort key without owning the mapping.
pub struct ElemView<'a> {
    pub(crate) file: &'a MappedFile,
    pub(crate) schema: &'a Schema,
    pub(crate) type_id: TypeId,
    pub(crate) offset: u64,
}

impl<'a> ElemView<'a> {
    pub fn type_name(&self) -> &str {
        &self.schema.ptype(self.type_id).name
    }

    pub fn int(&self) -> Result<i64> {
        match self.schema.ptype(self.type_id).kind {
            TypeKind::Int => self.file.read_i64(self.offset),
            _ => Err(type_err(format!("{} is not an int", self.type_name()))),
        }
    }

    pub fn float(&self) -> Result<f64> {
        match self.schema.ptype(self.type_id).kind {
            TypeKind::Float => self.file.read_f64(self.offset),
            _ => Err(type_err(format!("{} is not a float", self.type_name()))),
        }
    }

    pub fn bytes(&self) -> Result<Vec<u8>> {
        match self.schema.ptype(self.type_id).kind {
            TypeKind::Bytes => crate::values::codec::read_bytes(self.file, self.offset),
            _ => Err(type_err(format!(
                "{} is not a byte string",
                self.type_name()
            ))),
        }
    }

    /// Resolves a named field of a structure element to its own view.
    /// Fails on null by-reference fields.
    pub fn field(&self, name: &str) -> Result<ElemView<'a>> {
        let field = self.schema.field_of(self.type_id, name)?;
        let slot = self.offset + field.offset;

        match crate::values::field::read_slot(self.file, self.schema, slot, field.type_id)? {
            Some((ty, at)) => Ok(ElemView {
                file: self.file,
                schema: self.schema,
                type_id: ty,
                offset: at,
            }),
            None => Err(crate::error::value_err(format!(
                "field '{name}' is null"
            ))),
        }
    }

    /// The element's natural key, when it has one.
    pub fn natural_key(&self) -> Result<SortKey> {
        match self.schema.ptype(self.type_id).kind {
            TypeKind::Int => Ok(SortKey::Int(self.int()?)),
            TypeKind::Float => Ok(SortKey::Float(self.float()?)),
            TypeKind::Bytes => Ok(SortKey::Bytes(self.bytes()?)),
            _ => Err(type_err(format!(
                "{} values have no natural sort order",
                self.type_name()
            ))),
        }
    }
}

/// A pre-compiled key extraction function for `OrderSpec::Named`.
pub type OrderFn = Arc<dyn Fn(&ElemView<'_>) -> Result<SortKey> + Send + Sync>;

/// Registry of named key functions, supplied in `StoreOptions` and
/// consulted when a `named:` skip-list type is defined or reloaded.
pub type OrderRegistry = hashbrown::HashMap<String, OrderFn>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_tags_roundtrip() {
        for order in [
            OrderSpec::Natural,
            OrderSpec::Field("age".to_owned()),
            OrderSpec::Named("by_len".to_owned()),
        ] {
            let tag = order.to_tag();
            assert_eq!(OrderSpec::parse_tag(&tag).unwrap(), order);
        }
    }

    #[test]
    fn unknown_order_tag_is_rejected() {
        assert!(OrderSpec::parse_tag("python:lambda v: v").is_err());
    }

    #[test]
    fn sort_keys_order_numerically_across_int_and_float() {
        use std::cmp::Ordering::*;

        assert_eq!(
            SortKey::Int(2).compare(&SortKey::Float(2.5)).unwrap(),
            Less
        );
        assert_eq!(
            SortKey::Float(3.0).compare(&SortKey::Int(3)).unwrap(),
            Equal
        );
        assert_eq!(
            SortKey::Bytes(b"b".to_vec())
                .compare(&SortKey::Bytes(b"a".to_vec()))
                .unwrap(),
            Greater
        );
        assert!(SortKey::Bytes(b"a".to_vec())
            .compare(&SortKey::Int(1))
            .is_err());
    }
}
