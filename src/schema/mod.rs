//! # Schema Registry
//!
//! Named persistent types bound to one store. A `SchemaBuilder` is handed
//! to the populate callback when a store is created: built-in types are
//! pre-registered, user types are registered through builder methods, and
//! the builder seals into the store's `Schema`.
//!
//! ## Built-ins
//!
//! | Name | Kind | Visibility |
//! |------|------|------------|
//! | `int` | 64-bit signed integer, by-value | public |
//! | `float` | 64-bit float, by-value | public |
//! | `bytes` | byte string, by-reference | public |
//! | `__type_list` | list of `bytes`, holds the persisted descriptors | hidden |
//! | `__string_registry` | set of `bytes`, the interning table | hidden |
//!
//! Types whose name begins with the reserved `__` prefix are hidden: they
//! are reconstructed on every open and never independently persisted.
//!
//! ## Reload
//!
//! Each user-visible type's reflective descriptor is encoded
//! (`types::descriptor`), interned, and its offset appended to the
//! persisted type list in definition order. Reopening decodes every
//! descriptor and replays it through the same definition path, so the
//! reloaded schema is indistinguishable from the original.
//!
//! ## Structure Inheritance
//!
//! A derived structure's layout is its bases' fields followed by its own,
//! re-canonicalized by the lexicographic field sort. Redefining an
//! inherited field is accepted iff the new type is the same (ignored), a
//! supertype (ignored), or a subtype (takes effect); anything else is a
//! type error. Volatile (non-persistent) bases are recorded by name and
//! must be resolvable through the pluggable resolver when the store is
//! reopened.

use std::sync::Arc;

use eyre::Result;
use hashbrown::HashMap;
use tracing::warn;

use crate::error::{type_err, value_err};
use crate::types::descriptor::Descriptor;
use crate::types::{FieldDef, OrderFn, OrderRegistry, OrderSpec, PType, TypeId, TypeKind};
use crate::storage::WORD;

pub const TYPE_INT: TypeId = TypeId(0);
pub const TYPE_FLOAT: TypeId = TypeId(1);
pub const TYPE_BYTES: TypeId = TypeId(2);
pub const TYPE_TYPE_LIST: TypeId = TypeId(3);
pub const TYPE_STRING_REGISTRY: TypeId = TypeId(4);

/// Resolves the names of volatile (non-persistent) structure bases when a
/// store is reopened. Returns whether the name is known to the runtime.
pub type VolatileResolver = Arc<dyn Fn(&str) -> bool + Send + Sync>;

pub struct Schema {
    types: Vec<PType>,
    by_name: HashMap<String, TypeId>,
    user_types: Vec<(TypeId, Descriptor)>,
    orders: OrderRegistry,
    volatile_resolver: Option<VolatileResolver>,
}

impl Schema {
    pub(crate) fn new(
        orders: OrderRegistry,
        volatile_resolver: Option<VolatileResolver>,
    ) -> Self {
        let mut schema = Self {
            types: Vec::new(),
            by_name: HashMap::new(),
            user_types: Vec::new(),
            orders,
            volatile_resolver,
        };

        schema.install("int", TypeKind::Int);
        schema.install("float", TypeKind::Float);
        schema.install("bytes", TypeKind::Bytes);
        schema.install("__type_list", TypeKind::List { elem: TYPE_BYTES });
        schema.install(
            "__string_registry",
            TypeKind::Hash {
                key: TYPE_BYTES,
                value: None,
                default_insert: false,
            },
        );

        schema
    }

    fn install(&mut self, name: &str, kind: TypeKind) -> TypeId {
        let id = TypeId(self.types.len() as u32);
        self.types.push(PType {
            name: name.to_owned(),
            kind,
        });
        self.by_name.insert(name.to_owned(), id);
        id
    }

    pub fn ptype(&self, id: TypeId) -> &PType {
        &self.types[id.index()]
    }

    /// Internal lookup; sees hidden types too.
    pub(crate) fn lookup(&self, name: &str) -> Option<TypeId> {
        self.by_name.get(name).copied()
    }

    /// Public lookup. Hidden types are not part of the schema namespace.
    pub fn type_of(&self, name: &str) -> Result<TypeId> {
        match self.by_name.get(name) {
            Some(&id) if !self.ptype(id).is_hidden() => Ok(id),
            _ => Err(value_err(format!("unknown type '{name}'"))),
        }
    }

    /// User-visible types with their descriptors, in definition order.
    pub(crate) fn user_types(&self) -> &[(TypeId, Descriptor)] {
        &self.user_types
    }

    pub(crate) fn order_fn(&self, tag: &str) -> Option<OrderFn> {
        self.orders.get(tag).cloned()
    }

    pub fn field_of(&self, struct_ty: TypeId, name: &str) -> Result<&FieldDef> {
        let ptype = self.ptype(struct_ty);
        let TypeKind::Struct { fields, .. } = &ptype.kind else {
            return Err(value_err(format!(
                "{} is not a structure type",
                ptype.name
            )));
        };
        fields
            .iter()
            .find(|f| f.name == name)
            .ok_or_else(|| value_err(format!("structure {} has no field '{name}'", ptype.name)))
    }

    /// `sub` is a subtype of `sup` iff they are the same type or `sup`
    /// appears in `sub`'s transitive structure bases.
    pub fn is_subtype(&self, sub: TypeId, sup: TypeId) -> bool {
        if sub == sup {
            return true;
        }
        match &self.ptype(sub).kind {
            TypeKind::Struct { bases, .. } => {
                bases.iter().any(|&base| self.is_subtype(base, sup))
            }
            _ => false,
        }
    }

    fn check_new_name(&self, name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(value_err("type name must not be empty"));
        }
        if name.starts_with("__") {
            return Err(value_err(format!(
                "type name '{name}' uses the reserved '__' prefix"
            )));
        }
        if self.by_name.contains_key(name) {
            return Err(value_err(format!("type '{name}' is already defined")));
        }
        Ok(())
    }

    fn resolve(&self, name: &str) -> Result<TypeId> {
        self.lookup(name)
            .filter(|&id| !self.ptype(id).is_hidden())
            .ok_or_else(|| value_err(format!("referenced type '{name}' is not defined")))
    }

    fn define_struct(
        &mut self,
        name: &str,
        base_names: &[String],
        volatile_bases: &[String],
        own_fields: &[(String, String)],
        replaying: bool,
    ) -> Result<TypeId> {
        self.check_new_name(name)?;

        let mut bases = Vec::with_capacity(base_names.len());
        for base in base_names {
            let id = self.resolve(base)?;
            if !matches!(self.ptype(id).kind, TypeKind::Struct { .. }) {
                return Err(value_err(format!(
                    "base '{base}' of '{name}' is not a structure"
                )));
            }
            bases.push(id);
        }

        let mut volatile = Vec::with_capacity(volatile_bases.len());
        for base in volatile_bases {
            if self.lookup(base).is_some() {
                warn!(
                    base,
                    structure = name,
                    "volatile base names a persistent type; its persistent \
                     attributes are ignored"
                );
                continue;
            }
            if replaying {
                let resolved = self
                    .volatile_resolver
                    .as_ref()
                    .map(|resolver| resolver(base))
                    .unwrap_or(false);
                if !resolved {
                    return Err(value_err(format!(
                        "volatile base '{base}' of '{name}' cannot be resolved"
                    )));
                }
            }
            volatile.push(base.clone());
        }

        // Inherited fields first, then own; redefinitions follow the
        // same/supertype (ignored) vs subtype (takes effect) rule.
        let mut merged: Vec<(String, TypeId)> = Vec::new();
        let merge = |merged: &mut Vec<(String, TypeId)>,
                         field_name: &str,
                         field_ty: TypeId,
                         schema: &Schema|
         -> Result<()> {
            if let Some(slot) = merged.iter_mut().find(|(n, _)| n == field_name) {
                if schema.is_subtype(field_ty, slot.1) {
                    slot.1 = field_ty;
                    return Ok(());
                }
                if schema.is_subtype(slot.1, field_ty) {
                    return Ok(());
                }
                return Err(type_err(format!(
                    "field '{field_name}' of '{name}' redefines an inherited \
                     field with an unrelated type"
                )));
            }
            merged.push((field_name.to_owned(), field_ty));
            Ok(())
        };

        for &base in &bases {
            let TypeKind::Struct { fields, .. } = self.ptype(base).kind.clone() else {
                unreachable!("bases were checked to be structures");
            };
            for field in fields {
                merge(&mut merged, &field.name, field.type_id, self)?;
            }
        }
        for (field_name, type_name) in own_fields {
            let field_ty = self.resolve(type_name)?;
            merge(&mut merged, field_name, field_ty, self)?;
        }

        // Canonical layout: field names sorted lexicographically, one word
        // per slot. Stable across reopens regardless of declaration order.
        merged.sort_by(|a, b| a.0.cmp(&b.0));
        let fields: Vec<FieldDef> = merged
            .into_iter()
            .enumerate()
            .map(|(i, (field_name, type_id))| FieldDef {
                name: field_name,
                type_id,
                offset: i as u64 * WORD,
            })
            .collect();
        let size = (fields.len() as u64 * WORD).max(WORD);

        Ok(self.install(
            name,
            TypeKind::Struct {
                fields,
                bases,
                volatile_bases: volatile,
                size,
            },
        ))
    }

    fn define_list(&mut self, name: &str, elem: &str) -> Result<TypeId> {
        self.check_new_name(name)?;
        let elem = self.resolve(elem)?;
        Ok(self.install(name, TypeKind::List { elem }))
    }

    fn define_hash(
        &mut self,
        name: &str,
        key: &str,
        value: Option<&str>,
        default_insert: bool,
    ) -> Result<TypeId> {
        self.check_new_name(name)?;
        let key = self.resolve(key)?;
        let value = match value {
            Some(value) => Some(self.resolve(value)?),
            None => None,
        };
        if default_insert && value.is_none() {
            return Err(value_err(format!(
                "default dictionary '{name}' needs a value type"
            )));
        }
        Ok(self.install(
            name,
            TypeKind::Hash {
                key,
                value,
                default_insert,
            },
        ))
    }

    fn define_skip_list(&mut self, name: &str, elem: &str, order: OrderSpec) -> Result<TypeId> {
        self.check_new_name(name)?;
        let elem = self.resolve(elem)?;

        match &order {
            OrderSpec::Natural => {}
            OrderSpec::Field(field) => {
                // The element must be a structure carrying the key field.
                self.field_of(elem, field)?;
            }
            OrderSpec::Named(tag) => {
                if !self.orders.contains_key(tag) {
                    return Err(value_err(format!(
                        "skip list '{name}' needs order function '{tag}', \
                         which is not registered"
                    )));
                }
            }
        }

        Ok(self.install(name, TypeKind::SkipList { elem, order }))
    }

    fn define_node(&mut self, name: &str, value: &str) -> Result<TypeId> {
        self.check_new_name(name)?;
        let value = self.resolve(value)?;
        Ok(self.install(name, TypeKind::Node { value }))
    }

    fn define_edge(&mut self, name: &str, value: &str, from: &str, to: &str) -> Result<TypeId> {
        self.check_new_name(name)?;
        let value = self.resolve(value)?;
        let from = self.resolve(from)?;
        let to = self.resolve(to)?;

        for (endpoint, id) in [("from", from), ("to", to)] {
            if !matches!(self.ptype(id).kind, TypeKind::Node { .. }) {
                return Err(value_err(format!(
                    "{endpoint} type of edge '{name}' is not a node type"
                )));
            }
        }

        Ok(self.install(name, TypeKind::Edge { value, from, to }))
    }

    fn define_buffer(&mut self, name: &str) -> Result<TypeId> {
        self.check_new_name(name)?;
        Ok(self.install(name, TypeKind::Buffer))
    }

    /// Replays one decoded descriptor through the regular definition path.
    /// Referenced types must already be defined; the persisted type list's
    /// insertion order guarantees that for well-formed files.
    pub(crate) fn replay(&mut self, descriptor: Descriptor) -> Result<()> {
        let id = match &descriptor {
            Descriptor::Struct {
                name,
                bases,
                volatile_bases,
                fields,
            } => self.define_struct(name, bases, volatile_bases, fields, true)?,
            Descriptor::List { name, elem } => self.define_list(name, elem)?,
            Descriptor::Hash {
                name,
                key,
                value,
                default_insert,
            } => self.define_hash(name, key, value.as_deref(), *default_insert)?,
            Descriptor::SkipList {
                name,
                elem,
                order_tag,
            } => {
                let order = OrderSpec::parse_tag(order_tag)?;
                self.define_skip_list(name, elem, order)?
            }
            Descriptor::Node { name, value } => self.define_node(name, value)?,
            Descriptor::Edge {
                name,
                value,
                from,
                to,
            } => self.define_edge(name, value, from, to)?,
            Descriptor::Buffer { name } => self.define_buffer(name)?,
        };

        self.user_types.push((id, descriptor));
        Ok(())
    }
}

/// Explicit schema population handle, passed to the populate callback on
/// store creation. Every registration both defines the runtime type and
/// records the reflective descriptor that will be persisted.
pub struct SchemaBuilder {
    schema: Schema,
}

impl SchemaBuilder {
    pub(crate) fn new(
        orders: OrderRegistry,
        volatile_resolver: Option<VolatileResolver>,
    ) -> Self {
        Self {
            schema: Schema::new(orders, volatile_resolver),
        }
    }

    pub(crate) fn seal(self) -> Schema {
        self.schema
    }

    pub fn structure(&mut self, name: &str, fields: &[(&str, &str)]) -> Result<()> {
        self.structure_with_bases(name, &[], &[], fields)
    }

    pub fn structure_with_bases(
        &mut self,
        name: &str,
        bases: &[&str],
        volatile_bases: &[&str],
        fields: &[(&str, &str)],
    ) -> Result<()> {
        let bases: Vec<String> = bases.iter().map(|s| (*s).to_owned()).collect();
        let volatile: Vec<String> = volatile_bases.iter().map(|s| (*s).to_owned()).collect();
        let fields: Vec<(String, String)> = fields
            .iter()
            .map(|(n, t)| ((*n).to_owned(), (*t).to_owned()))
            .collect();

        let id = self
            .schema
            .define_struct(name, &bases, &volatile, &fields, false)?;
        self.schema.user_types.push((
            id,
            Descriptor::Struct {
                name: name.to_owned(),
                bases,
                volatile_bases: volatile,
                fields,
            },
        ));
        Ok(())
    }

    pub fn list_of(&mut self, name: &str, elem: &str) -> Result<()> {
        let id = self.schema.define_list(name, elem)?;
        self.schema.user_types.push((
            id,
            Descriptor::List {
                name: name.to_owned(),
                elem: elem.to_owned(),
            },
        ));
        Ok(())
    }

    pub fn hash_of(&mut self, name: &str, key: &str, value: &str) -> Result<()> {
        self.register_hash(name, key, Some(value), false)
    }

    /// Hash table with set semantics: keys only, no value slots.
    pub fn set_of(&mut self, name: &str, key: &str) -> Result<()> {
        self.register_hash(name, key, None, false)
    }

    /// As `hash_of`, but lookups of absent keys create a fresh value.
    pub fn default_hash_of(&mut self, name: &str, key: &str, value: &str) -> Result<()> {
        self.register_hash(name, key, Some(value), true)
    }

    fn register_hash(
        &mut self,
        name: &str,
        key: &str,
        value: Option<&str>,
        default_insert: bool,
    ) -> Result<()> {
        let id = self.schema.define_hash(name, key, value, default_insert)?;
        self.schema.user_types.push((
            id,
            Descriptor::Hash {
                name: name.to_owned(),
                key: key.to_owned(),
                value: value.map(str::to_owned),
                default_insert,
            },
        ));
        Ok(())
    }

    pub fn skip_list_of(&mut self, name: &str, elem: &str, order: OrderSpec) -> Result<()> {
        let id = self.schema.define_skip_list(name, elem, order.clone())?;
        self.schema.user_types.push((
            id,
            Descriptor::SkipList {
                name: name.to_owned(),
                elem: elem.to_owned(),
                order_tag: order.to_tag(),
            },
        ));
        Ok(())
    }

    pub fn node_of(&mut self, name: &str, value: &str) -> Result<()> {
        let id = self.schema.define_node(name, value)?;
        self.schema.user_types.push((
            id,
            Descriptor::Node {
                name: name.to_owned(),
                value: value.to_owned(),
            },
        ));
        Ok(())
    }

    pub fn edge(&mut self, name: &str, value: &str, from: &str, to: &str) -> Result<()> {
        let id = self.schema.define_edge(name, value, from, to)?;
        self.schema.user_types.push((
            id,
            Descriptor::Edge {
                name: name.to_owned(),
                value: value.to_owned(),
                from: from.to_owned(),
                to: to.to_owned(),
            },
        ));
        Ok(())
    }

    pub fn buffer(&mut self, name: &str) -> Result<()> {
        let id = self.schema.define_buffer(name)?;
        self.schema.user_types.push((
            id,
            Descriptor::Buffer {
                name: name.to_owned(),
            },
        ));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;

    fn builder() -> SchemaBuilder {
        SchemaBuilder::new(OrderRegistry::default(), None)
    }

    #[test]
    fn builtins_are_preregistered() {
        let schema = builder().seal();

        assert_eq!(schema.type_of("int").unwrap(), TYPE_INT);
        assert_eq!(schema.type_of("float").unwrap(), TYPE_FLOAT);
        assert_eq!(schema.type_of("bytes").unwrap(), TYPE_BYTES);
    }

    #[test]
    fn hidden_types_are_not_in_the_namespace() {
        let schema = builder().seal();

        assert!(schema.type_of("__type_list").is_err());
        assert!(schema.type_of("__string_registry").is_err());
        assert!(schema.lookup("__type_list").is_some());
    }

    #[test]
    fn reserved_prefix_is_rejected_for_user_types() {
        let mut b = builder();
        let err = b.structure("__Sneaky", &[]).unwrap_err();
        assert!(matches!(StoreError::of(&err), Some(StoreError::Value(_))));
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut b = builder();
        b.structure("Agent", &[("age", "int")]).unwrap();
        assert!(b.structure("Agent", &[]).is_err());
        assert!(b.list_of("int", "int").is_err());
    }

    #[test]
    fn field_layout_is_sorted_by_name() {
        let mut b = builder();
        b.structure("Agent", &[("weight", "float"), ("age", "int"), ("name", "bytes")])
            .unwrap();
        let schema = b.seal();

        let id = schema.type_of("Agent").unwrap();
        let TypeKind::Struct { fields, size, .. } = &schema.ptype(id).kind else {
            panic!("Agent should be a structure");
        };

        let names: Vec<&str> = fields.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, ["age", "name", "weight"]);
        assert_eq!(fields[0].offset, 0);
        assert_eq!(fields[1].offset, 8);
        assert_eq!(fields[2].offset, 16);
        assert_eq!(*size, 24);
    }

    #[test]
    fn layout_is_independent_of_declaration_order() {
        let mut a = builder();
        a.structure("S", &[("b", "int"), ("a", "int")]).unwrap();
        let mut b = builder();
        b.structure("S", &[("a", "int"), ("b", "int")]).unwrap();

        let sa = a.seal();
        let sb = b.seal();
        let fa = match &sa.ptype(sa.type_of("S").unwrap()).kind {
            TypeKind::Struct { fields, .. } => fields,
            _ => unreachable!(),
        };
        let fb = match &sb.ptype(sb.type_of("S").unwrap()).kind {
            TypeKind::Struct { fields, .. } => fields,
            _ => unreachable!(),
        };

        for (x, y) in fa.iter().zip(fb.iter()) {
            assert_eq!(x.name, y.name);
            assert_eq!(x.offset, y.offset);
        }
    }

    #[test]
    fn inheritance_concatenates_and_recanonicalizes() {
        let mut b = builder();
        b.structure("Person", &[("name", "bytes"), ("age", "int")])
            .unwrap();
        b.structure_with_bases("Agent", &["Person"], &[], &[("codename", "bytes")])
            .unwrap();
        let schema = b.seal();

        let agent = schema.type_of("Agent").unwrap();
        let person = schema.type_of("Person").unwrap();
        let TypeKind::Struct { fields, .. } = &schema.ptype(agent).kind else {
            panic!("Agent should be a structure");
        };

        let names: Vec<&str> = fields.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, ["age", "codename", "name"]);
        assert!(schema.is_subtype(agent, person));
        assert!(!schema.is_subtype(person, agent));
    }

    #[test]
    fn subtype_redefinition_takes_effect_and_unrelated_fails() {
        let mut b = builder();
        b.structure("Base", &[]).unwrap();
        b.structure_with_bases("Derived", &["Base"], &[], &[]).unwrap();
        b.structure("Holder", &[("it", "Base")]).unwrap();

        // Subtype redefinition narrows the field.
        b.structure_with_bases("NarrowHolder", &["Holder"], &[], &[("it", "Derived")])
            .unwrap();
        // Supertype redefinition is accepted and ignored.
        b.structure_with_bases("WideHolder", &["NarrowHolder"], &[], &[("it", "Base")])
            .unwrap();
        // Unrelated redefinition fails with a type error.
        let err = b
            .structure_with_bases("BadHolder", &["Holder"], &[], &[("it", "int")])
            .unwrap_err();
        assert!(matches!(StoreError::of(&err), Some(StoreError::Type(_))));

        let schema = b.seal();
        let narrow = schema.type_of("NarrowHolder").unwrap();
        let derived = schema.type_of("Derived").unwrap();
        assert_eq!(schema.field_of(narrow, "it").unwrap().type_id, derived);

        let wide = schema.type_of("WideHolder").unwrap();
        assert_eq!(schema.field_of(wide, "it").unwrap().type_id, derived);
    }

    #[test]
    fn skip_list_named_order_requires_registration() {
        let mut b = builder();
        let err = b
            .skip_list_of("S", "int", OrderSpec::Named("missing".to_owned()))
            .unwrap_err();
        assert!(matches!(StoreError::of(&err), Some(StoreError::Value(_))));
    }

    #[test]
    fn edge_endpoints_must_be_node_types() {
        let mut b = builder();
        b.structure("V", &[("name", "bytes")]).unwrap();
        b.node_of("Vertex", "V").unwrap();

        assert!(b.edge("Bad", "int", "V", "Vertex").is_err());
        assert!(b.edge("Good", "int", "Vertex", "Vertex").is_ok());
    }

    #[test]
    fn replay_reproduces_definitions() {
        let mut b = builder();
        b.structure("Agent", &[("name", "bytes"), ("age", "int")])
            .unwrap();
        b.list_of("Agents", "Agent").unwrap();
        b.default_hash_of("ByName", "bytes", "Agent").unwrap();
        let original = b.seal();

        let mut reloaded = Schema::new(OrderRegistry::default(), None);
        for (_, descriptor) in original.user_types() {
            reloaded.replay(descriptor.clone()).unwrap();
        }

        for name in ["Agent", "Agents", "ByName"] {
            let a = original.type_of(name).unwrap();
            let r = reloaded.type_of(name).unwrap();
            assert_eq!(a, r, "type ids diverged for {name}");
        }

        let agent = reloaded.type_of("Agent").unwrap();
        assert_eq!(reloaded.field_of(agent, "age").unwrap().offset, 0);
        assert_eq!(reloaded.field_of(agent, "name").unwrap().offset, 8);
    }
}
