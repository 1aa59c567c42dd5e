//! # Slots and the Assignment Contract
//!
//! Every containing position in the store — a structure field, a list
//! entry, a hash key or value slot, a graph value slot — is a one-word
//! *slot* typed by the schema. This module implements the two operations
//! shared by all of them:
//!
//! - **Reading** a slot resolves to the value it holds: by-value types
//!   live in the slot itself, by-reference types store the offset of a
//!   stand-alone region (zero meaning null).
//! - **Assigning** into a slot follows the uniform contract: a persistent
//!   source of a subtype copies its word (by-value) or its offset
//!   (by-reference); a plain source writes inline (by-value), allocates a
//!   fresh value (byte strings), or clears the slot (null into
//!   by-reference).
//!
//! Assignments validate before they mutate, so a failed assignment leaves
//! the mapping untouched.

use eyre::Result;

use crate::error::type_err;
use crate::schema::Schema;
use crate::storage::{MappedFile, NULL_OFFSET};
use crate::types::{TypeId, TypeKind};
use crate::values::codec;

/// A resolved assignment source, after proxy identity and store checks.
pub(crate) enum SlotSource<'a> {
    Null,
    Int(i64),
    Float(f64),
    Bytes(&'a [u8]),
    Persist { type_id: TypeId, offset: u64 },
}

/// Resolves what a slot holds: `(type, offset)` of the value, or `None`
/// for a null by-reference slot.
pub(crate) fn read_slot(
    file: &MappedFile,
    schema: &Schema,
    slot_offset: u64,
    slot_type: TypeId,
) -> Result<Option<(TypeId, u64)>> {
    if schema.ptype(slot_type).is_by_value() {
        return Ok(Some((slot_type, slot_offset)));
    }

    let target = file.read_u64(slot_offset)?;
    if target == NULL_OFFSET {
        return Ok(None);
    }
    Ok(Some((slot_type, target)))
}

pub(crate) fn assign_slot(
    file: &mut MappedFile,
    schema: &Schema,
    slot_offset: u64,
    slot_type: TypeId,
    source: &SlotSource<'_>,
) -> Result<()> {
    let slot = schema.ptype(slot_type);

    match source {
        SlotSource::Persist { type_id, offset } => {
            if !schema.is_subtype(*type_id, slot_type) {
                return Err(type_err(format!(
                    "cannot assign a {} into a {} slot",
                    schema.ptype(*type_id).name,
                    slot.name
                )));
            }
            if slot.is_by_value() {
                let word = file.read_u64(*offset)?;
                file.write_u64(slot_offset, word)
            } else {
                file.write_u64(slot_offset, *offset)
            }
        }
        SlotSource::Int(v) => match slot.kind {
            TypeKind::Int => file.write_i64(slot_offset, *v),
            TypeKind::Float => file.write_f64(slot_offset, *v as f64),
            _ => Err(type_err(format!(
                "cannot assign a plain int into a {} slot",
                slot.name
            ))),
        },
        SlotSource::Float(v) => match slot.kind {
            TypeKind::Float => file.write_f64(slot_offset, *v),
            _ => Err(type_err(format!(
                "cannot assign a plain float into a {} slot",
                slot.name
            ))),
        },
        SlotSource::Bytes(data) => match slot.kind {
            TypeKind::Bytes => {
                let at = codec::alloc_bytes(file, data)?;
                file.write_u64(slot_offset, at)
            }
            _ => Err(type_err(format!(
                "cannot assign plain bytes into a {} slot",
                slot.name
            ))),
        },
        SlotSource::Null => {
            if slot.is_by_value() {
                return Err(type_err(format!(
                    "cannot assign null into a by-value {} slot",
                    slot.name
                )));
            }
            file.write_u64(slot_offset, NULL_OFFSET)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::schema::{SchemaBuilder, TYPE_BYTES, TYPE_FLOAT, TYPE_INT};
    use crate::storage::WORD;
    use crate::types::OrderRegistry;
    use tempfile::tempdir;

    fn fixture() -> (tempfile::TempDir, MappedFile, Schema) {
        let dir = tempdir().unwrap();
        let file = MappedFile::create(&dir.path().join("a.pin"), 16 * 4096).unwrap();

        let mut builder = SchemaBuilder::new(OrderRegistry::default(), None);
        builder
            .structure("Agent", &[("name", "bytes"), ("age", "int")])
            .unwrap();
        (dir, file, builder.seal())
    }

    #[test]
    fn by_value_slot_reads_in_place() {
        let (_dir, mut file, schema) = fixture();

        let slot = file.allocate(WORD, WORD).unwrap();
        assign_slot(&mut file, &schema, slot, TYPE_INT, &SlotSource::Int(27)).unwrap();

        let (ty, at) = read_slot(&file, &schema, slot, TYPE_INT).unwrap().unwrap();
        assert_eq!(ty, TYPE_INT);
        assert_eq!(at, slot);
        assert_eq!(file.read_i64(at).unwrap(), 27);
    }

    #[test]
    fn plain_int_coerces_into_float_slot_but_not_back() {
        let (_dir, mut file, schema) = fixture();

        let slot = file.allocate(WORD, WORD).unwrap();
        assign_slot(&mut file, &schema, slot, TYPE_FLOAT, &SlotSource::Int(3)).unwrap();
        assert_eq!(file.read_f64(slot).unwrap(), 3.0);

        let err =
            assign_slot(&mut file, &schema, slot, TYPE_INT, &SlotSource::Float(1.5)).unwrap_err();
        assert!(matches!(StoreError::of(&err), Some(StoreError::Type(_))));
    }

    #[test]
    fn plain_bytes_allocate_and_reference() {
        let (_dir, mut file, schema) = fixture();

        let slot = file.allocate(WORD, WORD).unwrap();
        assign_slot(
            &mut file,
            &schema,
            slot,
            TYPE_BYTES,
            &SlotSource::Bytes(b"Miss Moneypenny"),
        )
        .unwrap();

        let (_, at) = read_slot(&file, &schema, slot, TYPE_BYTES)
            .unwrap()
            .unwrap();
        assert_ne!(at, slot);
        assert_eq!(codec::read_bytes(&file, at).unwrap(), b"Miss Moneypenny");
    }

    #[test]
    fn null_clears_by_reference_and_rejects_by_value() {
        let (_dir, mut file, schema) = fixture();

        let slot = file.allocate(WORD, WORD).unwrap();
        assign_slot(
            &mut file,
            &schema,
            slot,
            TYPE_BYTES,
            &SlotSource::Bytes(b"temp"),
        )
        .unwrap();
        assign_slot(&mut file, &schema, slot, TYPE_BYTES, &SlotSource::Null).unwrap();
        assert!(read_slot(&file, &schema, slot, TYPE_BYTES)
            .unwrap()
            .is_none());

        let err = assign_slot(&mut file, &schema, slot, TYPE_INT, &SlotSource::Null).unwrap_err();
        assert!(matches!(StoreError::of(&err), Some(StoreError::Type(_))));
    }

    #[test]
    fn persistent_assignment_respects_the_subtype_rule() {
        let (_dir, mut file, schema) = fixture();
        let agent = schema.type_of("Agent").unwrap();

        let value = file.allocate(3 * WORD, WORD).unwrap();
        let slot = file.allocate(WORD, WORD).unwrap();

        assign_slot(
            &mut file,
            &schema,
            slot,
            agent,
            &SlotSource::Persist {
                type_id: agent,
                offset: value,
            },
        )
        .unwrap();
        assert_eq!(file.read_u64(slot).unwrap(), value);

        let err = assign_slot(
            &mut file,
            &schema,
            slot,
            agent,
            &SlotSource::Persist {
                type_id: TYPE_INT,
                offset: value,
            },
        )
        .unwrap_err();
        assert!(matches!(StoreError::of(&err), Some(StoreError::Type(_))));
    }
}
