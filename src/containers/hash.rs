//! # Persistent Hash Table
//!
//! Open addressing over a contiguous entry array in the arena. One layout
//! serves four roles: plain dictionaries, sets (no value slots), default
//! dictionaries, and the store's string registry.
//!
//! ## Layout
//!
//! ```text
//! table:  { capacity: u64, used: u64, mask: u64, entries: u64 }
//! entry:  { used_flag: u64, key_slot: u64 [, value_slot: u64] }
//! ```
//!
//! Capacity is the smallest power of two strictly larger than 3/2 of the
//! requested size. An entry whose flag is zero holds undefined key/value
//! bytes and is never read. There is no rehashing: inserting past the 0.9
//! load cap fails `Full`.
//!
//! ## Probing
//!
//! The classic perturbed sequence, seeded from the key hash masked by
//! `capacity - 1`:
//!
//! ```text
//! i = (i << 2) + i + perturb + 1;  perturb >>= 5
//! ```
//!
//! ## Hashing and Equality
//!
//! By-value keys hash their canonical little-endian bytes; byte strings
//! hash their contents; every other by-reference key hashes its offset.
//! Equality during a probe delegates to the key type's equality operator,
//! so interned byte strings compare by content and structures by
//! identity. The hash is CRC-64 and is persisted implicitly in bucket
//! positions: changing it requires a file magic bump.

use eyre::Result;

use crate::error::{type_err, value_err, StoreError};
use crate::schema::Schema;
use crate::storage::{MappedFile, WORD};
use crate::types::{TypeId, TypeKind};
use crate::values::codec;
use crate::values::field::{self, SlotSource};
use crate::values::{Assign, PValue};

const HEADER_WORDS: u64 = 4;
const MAX_PROBE_FACTOR: u64 = 4;

/// A canonicalized probe key, owned so probing never borrows the mapping.
pub(crate) enum ProbeKey {
    Word([u8; 8]),
    Bytes(Vec<u8>),
    Offset(u64),
}

impl ProbeKey {
    fn hash(&self) -> u64 {
        match self {
            ProbeKey::Word(word) => codec::content_hash(word),
            ProbeKey::Bytes(bytes) => codec::content_hash(bytes),
            ProbeKey::Offset(offset) => codec::content_hash(&offset.to_le_bytes()),
        }
    }
}

pub(crate) enum Probe {
    Found(u64),
    Vacant(u64),
}

fn stride(value: Option<TypeId>) -> u64 {
    if value.is_some() {
        3 * WORD
    } else {
        2 * WORD
    }
}

/// Smallest power of two strictly larger than 3/2 of the requested size.
fn capacity_for(requested: u64) -> u64 {
    let floor = requested.max(4) * 3 / 2;
    (floor + 1).next_power_of_two()
}

/// Allocates and initializes an empty table. The freshly allocated entry
/// array reads as zeros, which is exactly "every flag unused".
pub(crate) fn create(
    file: &mut MappedFile,
    value: Option<TypeId>,
    requested: u64,
) -> Result<u64> {
    let capacity = capacity_for(requested);
    let table = file.allocate(HEADER_WORDS * WORD, WORD)?;
    let entries = file.allocate(capacity * stride(value), WORD)?;

    file.write_u64(table, capacity)?;
    file.write_u64(table + WORD, 0)?;
    file.write_u64(table + 2 * WORD, capacity - 1)?;
    file.write_u64(table + 3 * WORD, entries)?;

    Ok(table)
}

pub(crate) fn used_count(file: &MappedFile, table: u64) -> Result<u64> {
    file.read_u64(table + WORD)
}

pub(crate) fn capacity(file: &MappedFile, table: u64) -> Result<u64> {
    file.read_u64(table)
}

/// Canonicalizes an assignment source into a probe key for `key_ty`.
pub(crate) fn probe_key(
    file: &MappedFile,
    schema: &Schema,
    key_ty: TypeId,
    source: &SlotSource<'_>,
) -> Result<ProbeKey> {
    let kind = schema.ptype(key_ty).kind.clone();
    match (&kind, source) {
        (TypeKind::Int, SlotSource::Int(v)) => Ok(ProbeKey::Word(v.to_le_bytes())),
        (TypeKind::Float, SlotSource::Float(v)) => Ok(ProbeKey::Word(v.to_le_bytes())),
        (TypeKind::Float, SlotSource::Int(v)) => Ok(ProbeKey::Word((*v as f64).to_le_bytes())),
        (TypeKind::Bytes, SlotSource::Bytes(bytes)) => Ok(ProbeKey::Bytes(bytes.to_vec())),
        (_, SlotSource::Persist { type_id, offset }) => {
            if !schema.is_subtype(*type_id, key_ty) {
                return Err(type_err(format!(
                    "key of type {} does not fit a {} keyed table",
                    schema.ptype(*type_id).name,
                    schema.ptype(key_ty).name
                )));
            }
            match kind {
                TypeKind::Int | TypeKind::Float => {
                    let word = file.read_u64(*offset)?;
                    Ok(ProbeKey::Word(word.to_le_bytes()))
                }
                TypeKind::Bytes => Ok(ProbeKey::Bytes(codec::read_bytes(file, *offset)?)),
                _ => Ok(ProbeKey::Offset(*offset)),
            }
        }
        (_, SlotSource::Null) => Err(value_err("null cannot be a hash key")),
        _ => Err(type_err(format!(
            "plain key does not fit a {} keyed table",
            schema.ptype(key_ty).name
        ))),
    }
}

fn keys_equal(
    file: &MappedFile,
    schema: &Schema,
    key_ty: TypeId,
    key_slot: u64,
    probe: &ProbeKey,
) -> Result<bool> {
    match (&schema.ptype(key_ty).kind, probe) {
        (TypeKind::Int, ProbeKey::Word(word)) => {
            Ok(file.read_i64(key_slot)? == i64::from_le_bytes(*word))
        }
        (TypeKind::Float, ProbeKey::Word(word)) => {
            Ok(file.read_f64(key_slot)? == f64::from_le_bytes(*word))
        }
        (TypeKind::Bytes, ProbeKey::Bytes(bytes)) => {
            let stored = file.read_u64(key_slot)?;
            Ok(codec::bytes_slice(file, stored)? == bytes.as_slice())
        }
        (_, ProbeKey::Offset(offset)) => Ok(file.read_u64(key_slot)? == *offset),
        _ => Ok(false),
    }
}

/// Walks the probe sequence to the key's entry or the first vacant slot.
pub(crate) fn probe(
    file: &MappedFile,
    schema: &Schema,
    table: u64,
    key_ty: TypeId,
    value: Option<TypeId>,
    pk: &ProbeKey,
) -> Result<Probe> {
    let capacity = file.read_u64(table)?;
    let mask = file.read_u64(table + 2 * WORD)?;
    let entries = file.read_u64(table + 3 * WORD)?;
    let stride = stride(value);

    let hash = pk.hash();
    let mut i = hash & mask;
    let mut perturb = hash;

    for _ in 0..capacity * MAX_PROBE_FACTOR {
        let entry = entries + i * stride;
        if file.read_u64(entry)? == 0 {
            return Ok(Probe::Vacant(entry));
        }
        if keys_equal(file, schema, key_ty, entry + WORD, pk)? {
            return Ok(Probe::Found(entry));
        }
        i = ((i << 2).wrapping_add(i).wrapping_add(perturb).wrapping_add(1)) & mask;
        perturb >>= 5;
    }

    Err(crate::error::corrupt(
        "hash probe did not terminate; table has no vacancy",
    ))
}

fn check_load(file: &MappedFile, table: u64) -> Result<()> {
    let capacity = file.read_u64(table)?;
    let used = file.read_u64(table + WORD)?;
    if (used + 1) * 10 > capacity * 9 {
        return Err(StoreError::Full.into());
    }
    Ok(())
}

/// Installs a key into a vacant entry: key slot first (which may
/// allocate), then the used flag, then the count, so a partially written
/// entry is never observable as used.
fn install_key(
    file: &mut MappedFile,
    schema: &Schema,
    table: u64,
    entry: u64,
    key_ty: TypeId,
    source: &SlotSource<'_>,
) -> Result<()> {
    check_load(file, table)?;
    field::assign_slot(file, schema, entry + WORD, key_ty, source)?;
    file.write_u64(entry, 1)?;
    let used = file.read_u64(table + WORD)?;
    file.write_u64(table + WORD, used + 1)
}

/// Resolves the key stored in a used entry.
pub(crate) fn entry_key(
    file: &MappedFile,
    schema: &Schema,
    entry: u64,
    key_ty: TypeId,
) -> Result<(TypeId, u64)> {
    if schema.ptype(key_ty).is_by_value() {
        Ok((key_ty, entry + WORD))
    } else {
        Ok((key_ty, file.read_u64(entry + WORD)?))
    }
}

/// Interns a byte sequence into a set-of-bytes table, returning the offset
/// of the persisted bytes value. Repeated calls with equal bytes return
/// equal offsets.
pub(crate) fn intern(
    file: &mut MappedFile,
    schema: &Schema,
    table: u64,
    data: &[u8],
) -> Result<u64> {
    let pk = ProbeKey::Bytes(data.to_vec());
    match probe(file, schema, table, crate::schema::TYPE_BYTES, None, &pk)? {
        Probe::Found(entry) => file.read_u64(entry + WORD),
        Probe::Vacant(entry) => {
            install_key(
                file,
                schema,
                table,
                entry,
                crate::schema::TYPE_BYTES,
                &SlotSource::Bytes(data),
            )?;
            file.read_u64(entry + WORD)
        }
    }
}

/// Looks up an interned byte sequence without creating it.
pub(crate) fn find_interned(
    file: &MappedFile,
    schema: &Schema,
    table: u64,
    data: &[u8],
) -> Result<Option<u64>> {
    let pk = ProbeKey::Bytes(data.to_vec());
    match probe(file, schema, table, crate::schema::TYPE_BYTES, None, &pk)? {
        Probe::Found(entry) => Ok(Some(file.read_u64(entry + WORD)?)),
        Probe::Vacant(_) => Ok(None),
    }
}

/// Typed view over a hash table value.
pub struct HashView {
    value: PValue,
    key_ty: TypeId,
    value_ty: Option<TypeId>,
    default_insert: bool,
}

impl PValue {
    /// Views this value as a hash table; fails with a type error when it
    /// is anything else.
    pub fn as_hash(&self) -> Result<HashView> {
        let (key_ty, value_ty, default_insert) =
            self.handle.core.with_state(|st| {
                match st.schema.ptype(self.type_id).kind.clone() {
                    TypeKind::Hash {
                        key,
                        value,
                        default_insert,
                    } => Ok((key, value, default_insert)),
                    _ => Err(type_err("value is not a hash table")),
                }
            })?;
        Ok(HashView {
            value: self.clone(),
            key_ty,
            value_ty,
            default_insert,
        })
    }
}

impl HashView {
    pub fn value(&self) -> &PValue {
        &self.value
    }

    fn table(&self) -> u64 {
        self.value.offset
    }

    pub fn len(&self) -> Result<u64> {
        self.value
            .handle
            .core
            .with_state(|st| used_count(&st.file, self.table()))
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn capacity(&self) -> Result<u64> {
        self.value
            .handle
            .core
            .with_state(|st| capacity(&st.file, self.table()))
    }

    pub fn contains<'a>(&self, key: impl Into<Assign<'a>>) -> Result<bool> {
        let key = key.into();
        let source = self.value.resolve_assign(&key)?;
        self.value.handle.core.with_state(|st| {
            let pk = probe_key(&st.file, &st.schema, self.key_ty, &source)?;
            match probe(
                &st.file,
                &st.schema,
                self.table(),
                self.key_ty,
                self.value_ty,
                &pk,
            )? {
                Probe::Found(_) => Ok(true),
                Probe::Vacant(_) => Ok(false),
            }
        })
    }

    /// Standard map lookup. A set-semantics table returns the key; a
    /// default dictionary creates a fresh value for an absent key; plain
    /// dictionaries fail with `KeyNotFound`.
    pub fn get<'a>(&self, key: impl Into<Assign<'a>>) -> Result<PValue> {
        let key = key.into();
        let source = self.value.resolve_assign(&key)?;
        let core = &self.value.handle.core;

        let resolved = core.with_trx(|st| {
            let pk = probe_key(&st.file, &st.schema, self.key_ty, &source)?;
            let probed = probe(
                &st.file,
                &st.schema,
                self.table(),
                self.key_ty,
                self.value_ty,
                &pk,
            )?;

            match probed {
                Probe::Found(entry) => match self.value_ty {
                    None => entry_key(&st.file, &st.schema, entry, self.key_ty),
                    Some(value_ty) => {
                        match field::read_slot(
                            &st.file,
                            &st.schema,
                            entry + 2 * WORD,
                            value_ty,
                        )? {
                            Some(resolved) => Ok(resolved),
                            None => Err(value_err("the value stored under this key is null")),
                        }
                    }
                },
                Probe::Vacant(entry) => {
                    let Some(value_ty) = self.value_ty.filter(|_| self.default_insert) else {
                        return Err(StoreError::KeyNotFound.into());
                    };

                    if st.schema.ptype(value_ty).is_by_value() {
                        install_key(&mut st.file, &st.schema, self.table(), entry, self.key_ty, &source)?;
                        return Ok((value_ty, entry + 2 * WORD));
                    }

                    let Some(size) = st.schema.ptype(value_ty).alloc_size() else {
                        return Err(value_err(format!(
                            "cannot default-construct a {} value",
                            st.schema.ptype(value_ty).name
                        )));
                    };

                    // Allocate the fresh value before publishing the key so
                    // a Full failure leaks no half-inserted entry.
                    let fresh = st.file.allocate(size, WORD)?;
                    install_key(&mut st.file, &st.schema, self.table(), entry, self.key_ty, &source)?;
                    st.file.write_u64(entry + 2 * WORD, fresh)?;
                    Ok((value_ty, fresh))
                }
            }
        })?;

        let (ty, at) = resolved;
        Ok(PValue::new(core, ty, at))
    }

    /// Standard map update; inserts the key when absent. A set-semantics
    /// table silently ignores the value.
    pub fn set<'a, 'b>(
        &self,
        key: impl Into<Assign<'a>>,
        value: impl Into<Assign<'b>>,
    ) -> Result<()> {
        let key = key.into();
        let value = value.into();
        let key_source = self.value.resolve_assign(&key)?;
        let value_source = self.value.resolve_assign(&value)?;

        self.value.handle.core.with_trx(|st| {
            let pk = probe_key(&st.file, &st.schema, self.key_ty, &key_source)?;
            let entry = match probe(
                &st.file,
                &st.schema,
                self.table(),
                self.key_ty,
                self.value_ty,
                &pk,
            )? {
                Probe::Found(entry) => entry,
                Probe::Vacant(entry) => {
                    // Validate and materialize the value before publishing
                    // the key so a bad or unallocatable value leaves no
                    // half-inserted entry behind.
                    if let Some(value_ty) = self.value_ty {
                        probe_check_assignable(&st.schema, value_ty, &value_source)?;
                    }
                    let value_source = materialize_bytes(&mut st.file, value_source)?;
                    install_key(&mut st.file, &st.schema, self.table(), entry, self.key_ty, &key_source)?;

                    if let Some(value_ty) = self.value_ty {
                        field::assign_slot(
                            &mut st.file,
                            &st.schema,
                            entry + 2 * WORD,
                            value_ty,
                            &value_source,
                        )?;
                    }
                    return Ok(());
                }
            };

            match self.value_ty {
                Some(value_ty) => field::assign_slot(
                    &mut st.file,
                    &st.schema,
                    entry + 2 * WORD,
                    value_ty,
                    &value_source,
                ),
                None => Ok(()),
            }
        })
    }

    /// Probes for the key and installs it when absent, returning the
    /// persisted key. An optional value is written only when the entry is
    /// fresh; for an existing key it is ignored.
    pub fn get_or_intern<'a>(&self, key: impl Into<Assign<'a>>) -> Result<PValue> {
        self.intern_impl(key.into(), None)
    }

    pub fn get_or_intern_with<'a, 'b>(
        &self,
        key: impl Into<Assign<'a>>,
        value: impl Into<Assign<'b>>,
    ) -> Result<PValue> {
        self.intern_impl(key.into(), Some(value.into()))
    }

    fn intern_impl(&self, key: Assign<'_>, value: Option<Assign<'_>>) -> Result<PValue> {
        let key_source = self.value.resolve_assign(&key)?;
        let value_source = match &value {
            Some(value) => Some(self.value.resolve_assign(value)?),
            None => None,
        };
        let core = &self.value.handle.core;

        let (ty, at) = core.with_trx(|st| {
            let pk = probe_key(&st.file, &st.schema, self.key_ty, &key_source)?;
            match probe(
                &st.file,
                &st.schema,
                self.table(),
                self.key_ty,
                self.value_ty,
                &pk,
            )? {
                Probe::Found(entry) => entry_key(&st.file, &st.schema, entry, self.key_ty),
                Probe::Vacant(entry) => {
                    install_key(&mut st.file, &st.schema, self.table(), entry, self.key_ty, &key_source)?;
                    if let (Some(value_ty), Some(value_source)) = (self.value_ty, &value_source) {
                        field::assign_slot(
                            &mut st.file,
                            &st.schema,
                            entry + 2 * WORD,
                            value_ty,
                            value_source,
                        )?;
                    }
                    entry_key(&st.file, &st.schema, entry, self.key_ty)
                }
            }
        })?;

        Ok(PValue::new(core, ty, at))
    }

    /// Linear scan of used entries yielding key proxies.
    pub fn keys(&self) -> Result<Vec<PValue>> {
        let core = &self.value.handle.core;
        let keys = core.with_state(|st| {
            let mut keys = Vec::new();
            self.scan(st, |file, schema, entry| {
                keys.push(entry_key(file, schema, entry, self.key_ty)?);
                Ok(())
            })?;
            Ok(keys)
        })?;
        Ok(keys
            .into_iter()
            .map(|(ty, at)| PValue::new(core, ty, at))
            .collect())
    }

    /// Linear scan yielding value proxies (`None` where a value slot is
    /// null). Fails with a type error on set-semantics tables.
    pub fn values(&self) -> Result<Vec<Option<PValue>>> {
        Ok(self.items()?.into_iter().map(|(_, v)| v).collect())
    }

    /// Linear scan yielding `(key, value)` pairs. Fails with a type error
    /// on set-semantics tables.
    pub fn items(&self) -> Result<Vec<(PValue, Option<PValue>)>> {
        let Some(value_ty) = self.value_ty else {
            return Err(type_err(
                "a set-semantics table has no values to iterate",
            ));
        };

        let core = &self.value.handle.core;
        let items = core.with_state(|st| {
            let mut items = Vec::new();
            self.scan(st, |file, schema, entry| {
                let key = entry_key(file, schema, entry, self.key_ty)?;
                let value = field::read_slot(file, schema, entry + 2 * WORD, value_ty)?;
                items.push((key, value));
                Ok(())
            })?;
            Ok(items)
        })?;

        Ok(items
            .into_iter()
            .map(|((kty, kat), value)| {
                (
                    PValue::new(core, kty, kat),
                    value.map(|(vty, vat)| PValue::new(core, vty, vat)),
                )
            })
            .collect())
    }

    fn scan(
        &self,
        st: &crate::store::core::CoreState,
        mut visit: impl FnMut(&MappedFile, &Schema, u64) -> Result<()>,
    ) -> Result<()> {
        let capacity = st.file.read_u64(self.table())?;
        let entries = st.file.read_u64(self.table() + 3 * WORD)?;
        let stride = stride(self.value_ty);

        for i in 0..capacity {
            let entry = entries + i * stride;
            if st.file.read_u64(entry)? != 0 {
                visit(&st.file, &st.schema, entry)?;
            }
        }
        Ok(())
    }
}

/// Turns a plain-bytes source into a persisted one up front, so the later
/// slot assignment cannot fail on allocation.
fn materialize_bytes<'a>(
    file: &mut MappedFile,
    source: SlotSource<'a>,
) -> Result<SlotSource<'a>> {
    match source {
        SlotSource::Bytes(data) => {
            let at = codec::alloc_bytes(file, data)?;
            Ok(SlotSource::Persist {
                type_id: crate::schema::TYPE_BYTES,
                offset: at,
            })
        }
        other => Ok(other),
    }
}

/// Pre-validates that a source can be assigned to a slot of `slot_ty`,
/// without writing anything.
fn probe_check_assignable(
    schema: &Schema,
    slot_ty: TypeId,
    source: &SlotSource<'_>,
) -> Result<()> {
    let slot = schema.ptype(slot_ty);
    let ok = match source {
        SlotSource::Persist { type_id, .. } => schema.is_subtype(*type_id, slot_ty),
        SlotSource::Int(_) => matches!(slot.kind, TypeKind::Int | TypeKind::Float),
        SlotSource::Float(_) => matches!(slot.kind, TypeKind::Float),
        SlotSource::Bytes(_) => matches!(slot.kind, TypeKind::Bytes),
        SlotSource::Null => !slot.is_by_value(),
    };
    if ok {
        Ok(())
    } else {
        Err(type_err(format!(
            "value does not fit a {} slot",
            slot.name
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_is_strictly_beyond_three_halves() {
        assert_eq!(capacity_for(4), 8);
        assert_eq!(capacity_for(32), 64);
        assert_eq!(capacity_for(42), 64);
        assert_eq!(capacity_for(0), 8);
        assert!(capacity_for(100) > 150);
        assert!(capacity_for(100).is_power_of_two());
    }
}
