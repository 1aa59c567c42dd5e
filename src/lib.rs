//! # PinDB — Persistent Objects over a Memory-Mapped File
//!
//! PinDB is an embedded, single-process object store built on a single
//! memory-mapped file. Applications declare a typed schema of structures,
//! collections, graphs and byte strings; the engine lays the values out
//! in the file and hands back lightweight proxies that read and write the
//! mapped bytes in place — no serialization on the access path. The file
//! carries a reflective description of its own schema, so reopening it
//! reconstructs the exact types that created it.
//!
//! ## Quick Start
//!
//! ```ignore
//! use pindb::{Store, StoreOptions};
//!
//! let store = Store::open(
//!     "agents.pin",
//!     StoreOptions::new().file_size(1 << 20).populate(|schema| {
//!         schema.structure("Root", &[
//!             ("name", "bytes"),
//!             ("age", "int"),
//!             ("weight", "float"),
//!         ])
//!     }),
//! )?;
//!
//! let root = store.root()?;
//! root.set_field("age", 27)?;
//! root.set_field("name", "James Bond")?;
//! root.field("age")?.unwrap().increment()?;
//! store.close()?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────┐
//! │      Public API (Store, PValue)       │
//! ├───────────────────────────────────────┤
//! │ Schema Registry │ Containers │ Graph  │
//! ├───────────────────────────────────────┤
//! │   Value Codecs & Assignment Contract  │
//! ├───────────────────────────────────────┤
//! │  Mapped Arena │ Dual Headers │ Redo   │
//! └───────────────────────────────────────┘
//! ```
//!
//! ## Durability
//!
//! The file keeps two header slots; a commit flushes data, writes the
//! shadow slot clean with a bumped revision, and flushes again. Between
//! commits every byte mutation is journaled into a checksummed redo log:
//! reopening after a torn shutdown replays every committed transaction
//! and discards the uncommitted tail, rolling the allocator back so the
//! tail's allocations become unreachable.
//!
//! ## Concurrency Model
//!
//! Single-threaded cooperative: one non-reentrant lock is held for the
//! duration of every public operation. Proxies must not outlive their
//! store — `close()` refuses while any non-root proxy is alive, and every
//! operation on a proxy of a closed store fails instead of dangling.
//!
//! ## Module Overview
//!
//! - [`storage`]: mapped arena, bump allocator, dual headers, redo log
//! - [`types`]: runtime type descriptions and sort keys
//! - [`schema`]: schema builder, registry, persisted descriptors
//! - [`values`]: value proxies, codecs, the assignment contract
//! - [`containers`]: hash table, linked list, skip list
//! - [`graph`]: typed property graph
//! - [`buffer`]: reconstructable foreign-buffer snapshots
//! - [`store`]: the store lifecycle itself

pub mod buffer;
pub mod containers;
pub mod error;
pub mod graph;
pub mod schema;
pub mod storage;
pub mod store;
pub mod types;
pub mod values;

pub use buffer::BufferView;
pub use containers::hash::HashView;
pub use containers::list::ListView;
pub use containers::skiplist::SkipListView;
pub use error::StoreError;
pub use graph::{EdgeView, NodeView};
pub use schema::{Schema, SchemaBuilder, VolatileResolver};
pub use storage::FlushMode;
pub use store::{Store, StoreOptions};
pub use types::descriptor::Descriptor;
pub use types::{ElemView, OrderRegistry, OrderSpec, SortKey, TypeId};
pub use values::{Assign, PValue, Plain};

/// Crate-wide result alias following the `eyre` convention.
pub type Result<T> = eyre::Result<T>;
