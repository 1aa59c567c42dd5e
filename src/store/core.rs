//! # Store Core
//!
//! The shared runtime state behind a `Store` and all of its proxies: the
//! mapped primary file, the sealed schema, the root offsets, and the
//! single non-reentrant operation lock.
//!
//! ## Locking
//!
//! The engine is single-threaded cooperative: one `parking_lot::Mutex` is
//! taken once per public operation and passed down as `&mut CoreState`.
//! Internal code never re-locks, which makes the non-reentrancy harmless
//! and the "one operation at a time" rule hold by construction.
//!
//! ## Transactions
//!
//! `with_trx` brackets every public mutating operation: it opens a redo
//! transaction, runs the body, and commits with a lazy flush on success or
//! abandons the transaction on error. Read-only operations go through
//! `with_state` and never touch the journal.
//!
//! ## Proxy Accounting
//!
//! Every proxy holds a `StoreHandle`. Handles for non-root values bump the
//! live-proxy counter on creation and clone, and release it on drop; the
//! three roots (root value, string registry, persisted type list) are
//! exempt, which is exactly the census `close()` takes.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use eyre::Result;
use parking_lot::Mutex;

use crate::error::StoreError;
use crate::schema::Schema;
use crate::storage::{FlushMode, MappedFile};

pub(crate) struct RootOffsets {
    pub root: u64,
    pub string_registry: u64,
    pub type_list: u64,
}

impl RootOffsets {
    fn contains(&self, offset: u64) -> bool {
        offset == self.root || offset == self.string_registry || offset == self.type_list
    }
}

pub(crate) struct CoreState {
    pub file: MappedFile,
    pub schema: Schema,
    pub closed: bool,
    pub revision: u64,
    pub current_slot: usize,
    pub string_registry: u64,
    pub type_list: u64,
    pub root: u64,
}

pub(crate) struct StoreCore {
    pub(crate) state: Mutex<CoreState>,
    pub(crate) live_proxies: AtomicUsize,
    pub(crate) roots: RootOffsets,
}

impl StoreCore {
    pub(crate) fn new(state: CoreState) -> Arc<Self> {
        let roots = RootOffsets {
            root: state.root,
            string_registry: state.string_registry,
            type_list: state.type_list,
        };
        Arc::new(Self {
            state: Mutex::new(state),
            live_proxies: AtomicUsize::new(0),
            roots,
        })
    }

    /// Runs a read-only operation under the lock, after the liveness check
    /// that precedes every proxy operation.
    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&CoreState) -> Result<R>) -> Result<R> {
        let state = self.state.lock();
        if state.closed {
            return Err(StoreError::Closed.into());
        }
        f(&state)
    }

    /// Runs a mutating operation under the lock, bracketed by one redo
    /// transaction: committed with a lazy flush on success, abandoned on
    /// error so a failed operation leaves no committed trace.
    pub(crate) fn with_trx<R>(&self, f: impl FnOnce(&mut CoreState) -> Result<R>) -> Result<R> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(StoreError::Closed.into());
        }

        state.file.begin_trx()?;
        match f(&mut state) {
            Ok(result) => {
                state.file.commit_trx(FlushMode::Async)?;
                Ok(result)
            }
            Err(e) => {
                state.file.abandon_trx();
                Err(e)
            }
        }
    }
}

/// A counted reference from a proxy to its store. Root proxies are exempt
/// from counting so holding `root()` or the string registry never blocks
/// `close()`.
pub(crate) struct StoreHandle {
    pub(crate) core: Arc<StoreCore>,
    counted: bool,
}

impl StoreHandle {
    pub(crate) fn for_offset(core: &Arc<StoreCore>, offset: u64) -> Self {
        let counted = !core.roots.contains(offset);
        if counted {
            core.live_proxies.fetch_add(1, Ordering::Relaxed);
        }
        Self {
            core: Arc::clone(core),
            counted,
        }
    }

    pub(crate) fn same_store(&self, other: &StoreHandle) -> bool {
        Arc::ptr_eq(&self.core, &other.core)
    }
}

impl Clone for StoreHandle {
    fn clone(&self) -> Self {
        if self.counted {
            self.core.live_proxies.fetch_add(1, Ordering::Relaxed);
        }
        Self {
            core: Arc::clone(&self.core),
            counted: self.counted,
        }
    }
}

impl Drop for StoreHandle {
    fn drop(&mut self) {
        if self.counted {
            self.core.live_proxies.fetch_sub(1, Ordering::Relaxed);
        }
    }
}
