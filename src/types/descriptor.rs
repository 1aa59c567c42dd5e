//! # Type Descriptor Encoding
//!
//! Serialization of the reflective per-type descriptors that make a store
//! self-describing. Each user-visible type is encoded to a tagged,
//! length-prefixed byte string, interned into the string registry, and its
//! offset appended to the persisted type list; reopening decodes each
//! descriptor and replays the original definition path.
//!
//! ## Format
//!
//! ```text
//! descriptor := kind_tag: u8, name: str, body
//! str        := len: u16 LE, utf-8 bytes
//!
//! STRUCT   (4): base_count: u8, bases: str*,
//!               volatile_count: u8, volatile: str*,
//!               field_count: u16 LE, (field_name: str, type_name: str)*
//! LIST     (5): elem: str
//! HASH     (6): key: str, has_value: u8, [value: str], default_insert: u8
//! SKIPLIST (7): elem: str, order_tag: str
//! NODE     (8): value: str
//! EDGE     (9): value: str, from: str, to: str
//! BUFFER  (10): (no body)
//! ```
//!
//! Structure fields are recorded in *declared* order, before layout
//! canonicalization, so replaying a descriptor walks exactly the same
//! definition path the user did. Referenced types appear by name and must
//! already be defined when the descriptor is replayed; the persisted type
//! list preserves definition order, which guarantees that.
//!
//! The tag alphabet is finite and versioned with the file magic: adding a
//! tag requires a magic bump. Tags 1-3 name the built-in scalar kinds in
//! the alphabet; built-ins are reconstructed on every open and never
//! persisted. Decoding is fully data-driven — no descriptor can cause code
//! execution.

use eyre::Result;

use crate::error::corrupt;

pub const TAG_INT: u8 = 1;
pub const TAG_FLOAT: u8 = 2;
pub const TAG_BYTES: u8 = 3;
pub const TAG_STRUCT: u8 = 4;
pub const TAG_LIST: u8 = 5;
pub const TAG_HASH: u8 = 6;
pub const TAG_SKIPLIST: u8 = 7;
pub const TAG_NODE: u8 = 8;
pub const TAG_EDGE: u8 = 9;
pub const TAG_BUFFER: u8 = 10;

/// A decoded reflective type description. Field and type references are
/// by name; resolution happens at replay time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Descriptor {
    Struct {
        name: String,
        bases: Vec<String>,
        volatile_bases: Vec<String>,
        fields: Vec<(String, String)>,
    },
    List {
        name: String,
        elem: String,
    },
    Hash {
        name: String,
        key: String,
        value: Option<String>,
        default_insert: bool,
    },
    SkipList {
        name: String,
        elem: String,
        order_tag: String,
    },
    Node {
        name: String,
        value: String,
    },
    Edge {
        name: String,
        value: String,
        from: String,
        to: String,
    },
    Buffer {
        name: String,
    },
}

impl Descriptor {
    pub fn name(&self) -> &str {
        match self {
            Descriptor::Struct { name, .. }
            | Descriptor::List { name, .. }
            | Descriptor::Hash { name, .. }
            | Descriptor::SkipList { name, .. }
            | Descriptor::Node { name, .. }
            | Descriptor::Edge { name, .. }
            | Descriptor::Buffer { name } => name,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            Descriptor::Struct {
                name,
                bases,
                volatile_bases,
                fields,
            } => {
                buf.push(TAG_STRUCT);
                put_str(&mut buf, name);
                buf.push(bases.len() as u8);
                for base in bases {
                    put_str(&mut buf, base);
                }
                buf.push(volatile_bases.len() as u8);
                for base in volatile_bases {
                    put_str(&mut buf, base);
                }
                buf.extend((fields.len() as u16).to_le_bytes());
                for (field_name, type_name) in fields {
                    put_str(&mut buf, field_name);
                    put_str(&mut buf, type_name);
                }
            }
            Descriptor::List { name, elem } => {
                buf.push(TAG_LIST);
                put_str(&mut buf, name);
                put_str(&mut buf, elem);
            }
            Descriptor::Hash {
                name,
                key,
                value,
                default_insert,
            } => {
                buf.push(TAG_HASH);
                put_str(&mut buf, name);
                put_str(&mut buf, key);
                match value {
                    Some(value) => {
                        buf.push(1);
                        put_str(&mut buf, value);
                    }
                    None => buf.push(0),
                }
                buf.push(u8::from(*default_insert));
            }
            Descriptor::SkipList {
                name,
                elem,
                order_tag,
            } => {
                buf.push(TAG_SKIPLIST);
                put_str(&mut buf, name);
                put_str(&mut buf, elem);
                put_str(&mut buf, order_tag);
            }
            Descriptor::Node { name, value } => {
                buf.push(TAG_NODE);
                put_str(&mut buf, name);
                put_str(&mut buf, value);
            }
            Descriptor::Edge {
                name,
                value,
                from,
                to,
            } => {
                buf.push(TAG_EDGE);
                put_str(&mut buf, name);
                put_str(&mut buf, value);
                put_str(&mut buf, from);
                put_str(&mut buf, to);
            }
            Descriptor::Buffer { name } => {
                buf.push(TAG_BUFFER);
                put_str(&mut buf, name);
            }
        }
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Descriptor> {
        let mut cursor = Cursor { bytes, at: 0 };
        let tag = cursor.take_u8()?;
        let name = cursor.take_str()?;

        let descriptor = match tag {
            TAG_STRUCT => {
                let base_count = cursor.take_u8()? as usize;
                let mut bases = Vec::with_capacity(base_count);
                for _ in 0..base_count {
                    bases.push(cursor.take_str()?);
                }
                let volatile_count = cursor.take_u8()? as usize;
                let mut volatile_bases = Vec::with_capacity(volatile_count);
                for _ in 0..volatile_count {
                    volatile_bases.push(cursor.take_str()?);
                }
                let field_count = cursor.take_u16()? as usize;
                let mut fields = Vec::with_capacity(field_count);
                for _ in 0..field_count {
                    let field_name = cursor.take_str()?;
                    let type_name = cursor.take_str()?;
                    fields.push((field_name, type_name));
                }
                Descriptor::Struct {
                    name,
                    bases,
                    volatile_bases,
                    fields,
                }
            }
            TAG_LIST => Descriptor::List {
                name,
                elem: cursor.take_str()?,
            },
            TAG_HASH => {
                let key = cursor.take_str()?;
                let value = match cursor.take_u8()? {
                    0 => None,
                    1 => Some(cursor.take_str()?),
                    other => {
                        return Err(corrupt(format!(
                            "hash descriptor value flag must be 0 or 1, got {other}"
                        )))
                    }
                };
                let default_insert = cursor.take_u8()? != 0;
                Descriptor::Hash {
                    name,
                    key,
                    value,
                    default_insert,
                }
            }
            TAG_SKIPLIST => {
                let elem = cursor.take_str()?;
                let order_tag = cursor.take_str()?;
                Descriptor::SkipList {
                    name,
                    elem,
                    order_tag,
                }
            }
            TAG_NODE => Descriptor::Node {
                name,
                value: cursor.take_str()?,
            },
            TAG_EDGE => {
                let value = cursor.take_str()?;
                let from = cursor.take_str()?;
                let to = cursor.take_str()?;
                Descriptor::Edge {
                    name,
                    value,
                    from,
                    to,
                }
            }
            TAG_BUFFER => Descriptor::Buffer { name },
            other => return Err(corrupt(format!("unknown descriptor tag {other}"))),
        };

        if cursor.at != bytes.len() {
            return Err(corrupt(format!(
                "descriptor for '{}' has {} trailing bytes",
                descriptor.name(),
                bytes.len() - cursor.at
            )));
        }

        Ok(descriptor)
    }
}

fn put_str(buf: &mut Vec<u8>, s: &str) {
    debug_assert!(s.len() <= u16::MAX as usize);
    buf.extend((s.len() as u16).to_le_bytes());
    buf.extend(s.as_bytes());
}

struct Cursor<'a> {
    bytes: &'a [u8],
    at: usize,
}

impl Cursor<'_> {
    fn take_u8(&mut self) -> Result<u8> {
        let b = *self
            .bytes
            .get(self.at)
            .ok_or_else(|| corrupt("descriptor truncated"))?;
        self.at += 1;
        Ok(b)
    }

    fn take_u16(&mut self) -> Result<u16> {
        if self.at + 2 > self.bytes.len() {
            return Err(corrupt("descriptor truncated"));
        }
        let v = u16::from_le_bytes([self.bytes[self.at], self.bytes[self.at + 1]]);
        self.at += 2;
        Ok(v)
    }

    fn take_str(&mut self) -> Result<String> {
        let len = self.take_u16()? as usize;
        if self.at + len > self.bytes.len() {
            return Err(corrupt("descriptor string crosses the end"));
        }
        let s = std::str::from_utf8(&self.bytes[self.at..self.at + len])
            .map_err(|e| corrupt(format!("descriptor string is not UTF-8: {e}")))?
            .to_owned();
        self.at += len;
        Ok(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;

    #[test]
    fn struct_descriptor_roundtrip() {
        let descriptor = Descriptor::Struct {
            name: "Agent".to_owned(),
            bases: vec!["Person".to_owned()],
            volatile_bases: vec!["Reportable".to_owned()],
            fields: vec![
                ("name".to_owned(), "bytes".to_owned()),
                ("age".to_owned(), "int".to_owned()),
                ("weight".to_owned(), "float".to_owned()),
            ],
        };

        let decoded = Descriptor::decode(&descriptor.encode()).unwrap();
        assert_eq!(decoded, descriptor);
    }

    #[test]
    fn container_descriptors_roundtrip() {
        let descriptors = [
            Descriptor::List {
                name: "ListOfAgents".to_owned(),
                elem: "Agent".to_owned(),
            },
            Descriptor::Hash {
                name: "AgentsByName".to_owned(),
                key: "bytes".to_owned(),
                value: Some("Agent".to_owned()),
                default_insert: false,
            },
            Descriptor::Hash {
                name: "NameSet".to_owned(),
                key: "bytes".to_owned(),
                value: None,
                default_insert: false,
            },
            Descriptor::SkipList {
                name: "Lengths".to_owned(),
                elem: "int".to_owned(),
                order_tag: "natural".to_owned(),
            },
            Descriptor::Node {
                name: "Vertex".to_owned(),
                value: "Agent".to_owned(),
            },
            Descriptor::Edge {
                name: "Knows".to_owned(),
                value: "int".to_owned(),
                from: "Vertex".to_owned(),
                to: "Vertex".to_owned(),
            },
            Descriptor::Buffer {
                name: "Snapshot".to_owned(),
            },
        ];

        for descriptor in descriptors {
            let decoded = Descriptor::decode(&descriptor.encode()).unwrap();
            assert_eq!(decoded, descriptor);
        }
    }

    #[test]
    fn truncated_descriptor_is_corruption() {
        let bytes = Descriptor::List {
            name: "L".to_owned(),
            elem: "Agent".to_owned(),
        }
        .encode();

        let err = Descriptor::decode(&bytes[..bytes.len() - 2]).unwrap_err();
        assert!(matches!(
            StoreError::of(&err),
            Some(StoreError::Corruption(_))
        ));
    }

    #[test]
    fn unknown_tag_is_corruption() {
        let mut bytes = vec![200u8];
        put_str(&mut bytes, "Mystery");

        let err = Descriptor::decode(&bytes).unwrap_err();
        assert!(matches!(
            StoreError::of(&err),
            Some(StoreError::Corruption(_))
        ));
    }

    #[test]
    fn trailing_bytes_are_corruption() {
        let mut bytes = Descriptor::Buffer {
            name: "B".to_owned(),
        }
        .encode();
        bytes.push(0);

        assert!(Descriptor::decode(&bytes).is_err());
    }
}
