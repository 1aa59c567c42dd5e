//! # Store
//!
//! The public entry point: a `Store` binds one memory-mapped primary file
//! to a sealed schema, a string registry, a persisted type list, a root
//! value, and (optionally) a redo log.
//!
//! ## Creation
//!
//! Opening a non-existent path creates the file: the engine sizes and
//! maps it, initializes both header slots, pre-registers the built-in
//! types, runs the populate callback against a `SchemaBuilder`, persists
//! every user type's descriptor, creates the root value (the schema must
//! define a structure named `Root`), and commits the first clean header.
//!
//! ## Reopen
//!
//! Opening an existing path picks the clean header with the highest
//! revision, replays any committed redo transactions, reconstructs the
//! schema from the persisted type list, and reattaches the string
//! registry and root. The populate callback is not run on reopen.
//!
//! ```ignore
//! let store = Store::open(
//!     "agents.pin",
//!     StoreOptions::new().file_size(1 << 20).populate(|schema| {
//!         schema.structure("Root", &[("name", "bytes"), ("age", "int")])
//!     }),
//! )?;
//! store.root()?.set_field("age", 27)?;
//! store.close()?;
//! ```

pub(crate) mod core;
mod lifecycle;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use eyre::{Result, WrapErr};
use tracing::{debug, info, warn};

use crate::buffer::BufferView;
use crate::containers::hash::{self, HashView};
use crate::containers::{list, skiplist};
use crate::error::{corrupt, type_err, value_err};
use crate::graph::{self, EdgeView, NodeView};
use crate::schema::{Schema, SchemaBuilder, VolatileResolver, TYPE_BYTES, TYPE_STRING_REGISTRY};
use crate::storage::headers::FileHeader;
use crate::storage::{page_aligned, FlushMode, MappedFile, RedoLog, DATA_START};
use crate::store::core::{CoreState, StoreCore};
use crate::types::descriptor::Descriptor;
use crate::types::{ElemView, OrderRegistry, SortKey, TypeId, TypeKind};
use crate::values::field::SlotSource;
use crate::values::{codec, resolve_assign_in, Assign, PValue};

type PopulateFn = Box<dyn FnOnce(&mut SchemaBuilder) -> Result<()>>;

/// Configuration for `Store::open` / `Store::create`.
pub struct StoreOptions {
    file_size: u64,
    registry_capacity: u64,
    journal: bool,
    redo_capacity: Option<u64>,
    populate: Option<PopulateFn>,
    orders: OrderRegistry,
    volatile_resolver: Option<VolatileResolver>,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl StoreOptions {
    pub fn new() -> Self {
        Self {
            file_size: 0,
            registry_capacity: 32,
            journal: true,
            redo_capacity: None,
            populate: None,
            orders: OrderRegistry::default(),
            volatile_resolver: None,
        }
    }

    /// Requested data-region size in bytes, rounded up to whole pages.
    /// `0` is valid only when reopening and means "use the current size".
    pub fn file_size(mut self, bytes: u64) -> Self {
        self.file_size = bytes;
        self
    }

    /// Requested capacity of the string registry.
    pub fn registry_capacity(mut self, entries: u64) -> Self {
        self.registry_capacity = entries;
        self
    }

    /// Whether mutations are journaled through the redo log.
    pub fn journal(mut self, enabled: bool) -> Self {
        self.journal = enabled;
        self
    }

    /// Capacity of the redo log; defaults to the primary file's size.
    pub fn redo_capacity(mut self, bytes: u64) -> Self {
        self.redo_capacity = Some(bytes);
        self
    }

    /// Schema population callback, run once when the file is created.
    pub fn populate(
        mut self,
        populate: impl FnOnce(&mut SchemaBuilder) -> Result<()> + 'static,
    ) -> Self {
        self.populate = Some(Box::new(populate));
        self
    }

    /// Registers a named skip-list key function for `OrderSpec::Named`.
    pub fn register_order(
        mut self,
        tag: &str,
        f: impl Fn(&ElemView<'_>) -> Result<SortKey> + Send + Sync + 'static,
    ) -> Self {
        self.orders.insert(tag.to_owned(), Arc::new(f));
        self
    }

    /// Resolver consulted for volatile structure bases on reopen.
    pub fn volatile_resolver(
        mut self,
        resolver: impl Fn(&str) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.volatile_resolver = Some(Arc::new(resolver));
        self
    }
}

/// An open persistent object store.
pub struct Store {
    pub(crate) core: Arc<StoreCore>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").finish()
    }
}

fn redo_path_for(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".redo");
    PathBuf::from(name)
}

impl Store {
    /// Opens the store at `path`, creating it when the path does not
    /// exist yet.
    pub fn open(path: impl AsRef<Path>, options: StoreOptions) -> Result<Store> {
        let path = path.as_ref();
        if path.exists() {
            Self::open_existing(path, options)
        } else {
            Self::create(path, options)
        }
    }

    /// Creates a fresh store; fails when the path already exists.
    pub fn create(path: impl AsRef<Path>, options: StoreOptions) -> Result<Store> {
        let path = path.as_ref();

        if options.file_size == 0 {
            return Err(value_err(
                "a requested size of 0 is only valid when reopening an existing store",
            ));
        }

        let mut file = MappedFile::create(path, options.file_size)?;

        if options.journal {
            let capacity = options.redo_capacity.unwrap_or(file.real_size());
            let redo = RedoLog::create(&redo_path_for(path), capacity)
                .wrap_err("failed to create the redo log")?;
            file.attach_redo(redo);
        }

        // Both slots start dirty; the first clean commit below elects slot 0.
        file.write_header_slot(0, &FileHeader::new_dirty());
        file.write_header_slot(1, &FileHeader::new_dirty());

        let mut builder = SchemaBuilder::new(options.orders, options.volatile_resolver);
        if let Some(populate) = options.populate {
            populate(&mut builder).wrap_err("schema population failed")?;
        }
        let schema = builder.seal();

        let string_registry = hash::create(&mut file, None, options.registry_capacity)?;
        let type_list = list::create(&mut file)?;

        for (_, descriptor) in schema.user_types() {
            let encoded = descriptor.encode();
            let interned = hash::intern(&mut file, &schema, string_registry, &encoded)?;
            list::append(
                &mut file,
                &schema,
                type_list,
                TYPE_BYTES,
                &SlotSource::Persist {
                    type_id: TYPE_BYTES,
                    offset: interned,
                },
            )?;
        }

        let root_ty = schema.type_of("Root").map_err(|_| {
            value_err("the populated schema must define a structure named 'Root'")
        })?;
        let TypeKind::Struct { size, .. } = schema.ptype(root_ty).kind else {
            return Err(value_err("'Root' must be a structure type"));
        };
        let root = file.allocate(size, crate::storage::WORD)?;

        let mut state = CoreState {
            file,
            schema,
            closed: false,
            revision: 0,
            current_slot: 1,
            string_registry,
            type_list,
            root,
        };

        lifecycle::commit_header(&mut state, FlushMode::Sync)?;
        if let Some(redo) = state.file.redo_mut() {
            redo.reset()?;
        }
        state.file.arm_journaling();

        debug!(path = %path.display(), size = state.file.real_size(), "created store");
        Ok(Store {
            core: StoreCore::new(state),
        })
    }

    fn open_existing(path: &Path, options: StoreOptions) -> Result<Store> {
        let mut file = MappedFile::open(path)?;

        if options.file_size != 0
            && DATA_START + page_aligned(options.file_size) > file.real_size()
        {
            return Err(value_err(
                "an existing store cannot be resized upward on open",
            ));
        }

        // The current header is the clean slot with the highest revision.
        let mut current: Option<(usize, u64)> = None;
        let mut headers = [None, None];
        for slot in 0..2 {
            match FileHeader::from_bytes(file.header_slot(slot)) {
                Ok(header) if header.is_clean() => {
                    if current.map(|(_, rev)| header.revision() > rev).unwrap_or(true) {
                        current = Some((slot, header.revision()));
                    }
                    headers[slot] = Some(*header);
                }
                Ok(_) => headers[slot] = None,
                Err(_) => headers[slot] = None,
            }
        }
        let Some((slot, revision)) = current else {
            return Err(corrupt("no clean header slot; the file never committed"));
        };
        let Some(header) = headers[slot] else {
            return Err(corrupt("current header slot vanished while opening"));
        };

        if header.free_offset() < DATA_START || header.free_offset() > file.real_size() {
            return Err(corrupt(format!(
                "free offset {} outside the file",
                header.free_offset()
            )));
        }
        file.set_free_offset(header.free_offset());

        // Replay committed redo transactions into the primary mapping.
        let redo_path = redo_path_for(path);
        let mut recovered = 0usize;
        let redo = if redo_path.exists() {
            let mut redo = RedoLog::open(&redo_path)?;
            let outcome = redo.recover(|target, bytes| file.apply_redo_record(target, bytes))?;
            if let Some(free_offset) = outcome.free_offset {
                file.set_free_offset(free_offset);
            }
            if outcome.discarded_torn {
                warn!(path = %redo_path.display(), "discarded a torn redo transaction tail");
            }
            if outcome.applied > 0 {
                info!(applied = outcome.applied, "replayed redo transactions");
            }
            recovered = outcome.applied;
            Some(redo)
        } else if options.journal {
            let capacity = options.redo_capacity.unwrap_or(file.real_size());
            Some(RedoLog::create(&redo_path, capacity)?)
        } else {
            None
        };

        // Rebuild the schema by replaying the persisted descriptors.
        let mut schema = Schema::new(options.orders, options.volatile_resolver);
        for entry in list::entries(&file, header.type_list())? {
            let at = file.read_u64(entry + crate::storage::WORD)?;
            let encoded = codec::read_bytes(&file, at)?;
            let descriptor = Descriptor::decode(&encoded)
                .wrap_err("failed to decode a persisted type descriptor")?;
            schema.replay(descriptor)?;
        }

        if let Some(redo) = redo {
            file.attach_redo(redo);
        }

        let mut state = CoreState {
            file,
            schema,
            closed: false,
            revision,
            current_slot: slot,
            string_registry: header.string_registry(),
            type_list: header.type_list(),
            root: header.root(),
        };

        // Make a recovered state durable, then let the log forget the
        // transactions it just replayed.
        if recovered > 0 {
            lifecycle::commit_header(&mut state, FlushMode::Sync)?;
            if let Some(redo) = state.file.redo_mut() {
                redo.reset()?;
            }
        }
        if !options.journal {
            drop(state.file.detach_redo());
        }
        state.file.arm_journaling();

        debug!(path = %path.display(), revision = state.revision, "opened store");
        Ok(Store {
            core: StoreCore::new(state),
        })
    }

    /// The root value.
    pub fn root(&self) -> Result<PValue> {
        let (ty, at) = self.core.with_state(|st| {
            let ty = st.schema.type_of("Root")?;
            Ok((ty, st.root))
        })?;
        Ok(PValue::new(&self.core, ty, at))
    }

    /// The interning set of byte strings owned by this store.
    pub fn string_registry(&self) -> Result<HashView> {
        let at = self.core.with_state(|st| Ok(st.string_registry))?;
        PValue::new(&self.core, TYPE_STRING_REGISTRY, at).as_hash()
    }

    /// Interns a byte sequence, returning the persisted byte string.
    /// Equal inputs yield proxies for equal offsets.
    pub fn intern(&self, data: &[u8]) -> Result<PValue> {
        self.string_registry()?.get_or_intern(data)
    }

    /// Looks a type up by name in the schema namespace.
    pub fn type_of(&self, name: &str) -> Result<TypeId> {
        self.core.with_state(|st| st.schema.type_of(name))
    }

    /// Defines one additional type on an open store from its reflective
    /// descriptor, persisting it like the populate-time definitions.
    /// Types the descriptor references must already be defined.
    pub fn define(&self, descriptor: Descriptor) -> Result<TypeId> {
        self.core.with_trx(|st| {
            let name = descriptor.name().to_owned();
            let encoded = descriptor.encode();

            st.schema.replay(descriptor)?;

            let registry = st.string_registry;
            let type_list = st.type_list;
            let interned = hash::intern(&mut st.file, &st.schema, registry, &encoded)?;
            list::append(
                &mut st.file,
                &st.schema,
                type_list,
                TYPE_BYTES,
                &SlotSource::Persist {
                    type_id: TYPE_BYTES,
                    offset: interned,
                },
            )?;

            st.schema.type_of(&name)
        })
    }

    /// Creates a stand-alone value of a named type. By-value types refuse
    /// stand-alone creation; byte strings, buffers, nodes and edges have
    /// dedicated constructors carrying their payload.
    pub fn new_instance(&self, type_name: &str) -> Result<PValue> {
        let (ty, at) = self.core.with_trx(|st| {
            let ty = st.schema.type_of(type_name)?;
            let at = match &st.schema.ptype(ty).kind {
                TypeKind::Int | TypeKind::Float => {
                    return Err(type_err(format!(
                        "by-value type '{type_name}' cannot be created stand-alone"
                    )))
                }
                TypeKind::Bytes => {
                    return Err(value_err("use new_bytes to create a byte string"))
                }
                TypeKind::Buffer => {
                    return Err(value_err("use new_buffer to create a buffer"))
                }
                TypeKind::Node { .. } => {
                    return Err(value_err("use new_node to create a graph node"))
                }
                TypeKind::Edge { .. } => {
                    return Err(value_err("use new_edge to create a graph edge"))
                }
                TypeKind::Struct { size, .. } => {
                    let size = *size;
                    st.file.allocate(size, crate::storage::WORD)?
                }
                TypeKind::List { .. } => list::create(&mut st.file)?,
                TypeKind::SkipList { .. } => skiplist::create(&mut st.file)?,
                TypeKind::Hash { .. } => {
                    let value_ty = hash_value_ty(st, ty);
                    hash::create(&mut st.file, value_ty, 16)?
                }
            };
            Ok((ty, at))
        })?;
        Ok(PValue::new(&self.core, ty, at))
    }

    /// Creates a stand-alone byte string.
    pub fn new_bytes(&self, data: &[u8]) -> Result<PValue> {
        let at = self
            .core
            .with_trx(|st| codec::alloc_bytes(&mut st.file, data))?;
        Ok(PValue::new(&self.core, TYPE_BYTES, at))
    }

    /// Creates a hash table of a named hash type with a requested
    /// capacity.
    pub fn new_hash(&self, type_name: &str, capacity: u64) -> Result<HashView> {
        let (ty, at) = self.core.with_trx(|st| {
            let ty = st.schema.type_of(type_name)?;
            if !matches!(st.schema.ptype(ty).kind, TypeKind::Hash { .. }) {
                return Err(type_err(format!("'{type_name}' is not a hash type")));
            }
            let value_ty = hash_value_ty(st, ty);
            let at = hash::create(&mut st.file, value_ty, capacity)?;
            Ok((ty, at))
        })?;
        PValue::new(&self.core, ty, at).as_hash()
    }

    /// Creates a graph node of a named node type carrying `value`.
    pub fn new_node<'a>(
        &self,
        type_name: &str,
        value: impl Into<Assign<'a>>,
    ) -> Result<NodeView> {
        let value = value.into();
        let source = resolve_assign_in(&self.core, &value)?;

        let (ty, at) = self.core.with_trx(|st| {
            let ty = st.schema.type_of(type_name)?;
            let TypeKind::Node { value: value_ty } = st.schema.ptype(ty).kind else {
                return Err(type_err(format!("'{type_name}' is not a node type")));
            };
            let at = graph::create_node(&mut st.file, &st.schema, value_ty, &source)?;
            Ok((ty, at))
        })?;
        PValue::new(&self.core, ty, at).as_node()
    }

    /// Creates a graph edge of a named edge type from `from` to `to`,
    /// carrying `value`. The endpoints must be nodes of the edge type's
    /// endpoint types, in this store.
    pub fn new_edge<'a>(
        &self,
        type_name: &str,
        from: &NodeView,
        to: &NodeView,
        value: impl Into<Assign<'a>>,
    ) -> Result<EdgeView> {
        let value = value.into();
        let source = resolve_assign_in(&self.core, &value)?;

        for endpoint in [from.proxy(), to.proxy()] {
            if !Arc::ptr_eq(&endpoint.handle.core, &self.core) {
                return Err(type_err("edge endpoints must belong to this store"));
            }
        }

        let (ty, at) = self.core.with_trx(|st| {
            let ty = st.schema.type_of(type_name)?;
            let TypeKind::Edge {
                value: value_ty,
                from: from_ty,
                to: to_ty,
            } = st.schema.ptype(ty).kind
            else {
                return Err(type_err(format!("'{type_name}' is not an edge type")));
            };

            if from.proxy().type_id() != from_ty || to.proxy().type_id() != to_ty {
                return Err(type_err(format!(
                    "edge '{type_name}' connects {} to {}, got {} to {}",
                    st.schema.ptype(from_ty).name,
                    st.schema.ptype(to_ty).name,
                    st.schema.ptype(from.proxy().type_id()).name,
                    st.schema.ptype(to.proxy().type_id()).name,
                )));
            }

            let kind_name = st.schema.ptype(ty).name.clone();
            let registry = st.string_registry;
            let at = graph::create_edge(
                &mut st.file,
                &st.schema,
                registry,
                &kind_name,
                value_ty,
                from.proxy().offset(),
                to.proxy().offset(),
                &source,
            )?;
            Ok((ty, at))
        })?;
        PValue::new(&self.core, ty, at).as_edge()
    }

    /// Creates a buffer of a named buffer type, copying `data`
    /// C-contiguously.
    pub fn new_buffer(
        &self,
        type_name: &str,
        format: &str,
        itemsize: u64,
        shape: &[u64],
        data: &[u8],
    ) -> Result<BufferView> {
        let (ty, at) = self.core.with_trx(|st| {
            let ty = st.schema.type_of(type_name)?;
            if !matches!(st.schema.ptype(ty).kind, TypeKind::Buffer) {
                return Err(type_err(format!("'{type_name}' is not a buffer type")));
            }
            let registry = st.string_registry;
            let at = crate::buffer::create_buffer(
                &mut st.file,
                &st.schema,
                registry,
                format,
                itemsize,
                shape,
                data,
            )?;
            Ok((ty, at))
        })?;
        PValue::new(&self.core, ty, at).as_buffer()
    }

    /// Number of live proxies other than the three roots.
    pub fn live_proxy_count(&self) -> usize {
        self.core
            .live_proxies
            .load(std::sync::atomic::Ordering::Relaxed)
    }

    /// Revision of the current clean header; increases with every commit.
    pub fn revision(&self) -> Result<u64> {
        self.core.with_state(|st| Ok(st.revision))
    }

    /// The bump allocator's high-water mark.
    pub fn free_offset(&self) -> Result<u64> {
        self.core.with_state(|st| Ok(st.file.free_offset()))
    }
}

fn hash_value_ty(st: &CoreState, ty: TypeId) -> Option<TypeId> {
    match st.schema.ptype(ty).kind {
        TypeKind::Hash { value, .. } => value,
        _ => None,
    }
}
