//! # Store Lifecycle
//!
//! Commit, flush and safe close.
//!
//! ## The Commit Sequence
//!
//! The only externally visible durable transition: flush the data pages,
//! write the shadow header slot with status `C` and a bumped revision,
//! flush again. The previously current slot keeps its lower revision, so
//! a torn commit leaves the old header electable and the file falls back
//! to the previous committed state.
//!
//! ## Safe Close
//!
//! `close` first takes a census of live proxies. Anything beyond the
//! three roots (root value, string registry, persisted type list) makes
//! the close fail with `Proxies` and leaves the store open; the caller
//! drops the proxies and retries. A successful close commits, resets the
//! redo log, and marks the store closed — every later proxy operation
//! fails with `Closed`.

use eyre::Result;
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::storage::headers::FileHeader;
use crate::storage::FlushMode;
use crate::store::core::CoreState;
use crate::store::Store;

/// Flush data, write the shadow header clean with the next revision,
/// flush again, and elect the shadow as current.
pub(crate) fn commit_header(state: &mut CoreState, mode: FlushMode) -> Result<()> {
    state.file.flush(mode)?;

    let shadow = 1 - state.current_slot;
    let header = FileHeader::clean(
        state.revision + 1,
        state.file.free_offset(),
        state.string_registry,
        state.type_list,
        state.root,
    );
    state.file.write_header_slot(shadow, &header);
    state.file.flush(mode)?;

    state.revision += 1;
    state.current_slot = shadow;
    Ok(())
}

impl Store {
    /// Commits the current state. A synchronous flush also lets the redo
    /// log forget everything the commit just made durable.
    pub fn flush(&self, mode: FlushMode) -> Result<()> {
        let mut state = self.core.state.lock();
        if state.closed {
            return Err(StoreError::Closed.into());
        }

        commit_header(&mut state, mode)?;
        if mode == FlushMode::Sync {
            if let Some(redo) = state.file.redo_mut() {
                redo.reset()?;
            }
        }
        Ok(())
    }

    /// Safely closes the store. Fails with `Proxies` while any proxy
    /// other than the three roots is alive, leaving the store open.
    pub fn close(&self) -> Result<()> {
        let mut state = self.core.state.lock();
        if state.closed {
            return Err(StoreError::Closed.into());
        }

        let live = self
            .core
            .live_proxies
            .load(std::sync::atomic::Ordering::Relaxed);
        if live > 0 {
            return Err(StoreError::Proxies(live).into());
        }

        commit_header(&mut state, FlushMode::Sync)?;
        if let Some(redo) = state.file.redo_mut() {
            redo.reset()?;
        }
        state.closed = true;

        debug!(revision = state.revision, "closed store");
        Ok(())
    }
}

impl Store {
    /// Abandons the store without the final commit, the way a crashing
    /// process would. The next open falls back to the last clean header
    /// plus whatever the redo log replays. Intended for crash testing.
    pub fn abandon(self) {
        let mut state = self.core.state.lock();
        state.closed = true;
    }
}

impl Drop for Store {
    /// Best-effort final commit for stores dropped without `close`. Redo
    /// transactions already cover the data, so on commit failure the next
    /// open recovers instead.
    fn drop(&mut self) {
        let mut state = self.core.state.lock();
        if state.closed {
            return;
        }

        match commit_header(&mut state, FlushMode::Sync) {
            Ok(()) => {
                if let Some(redo) = state.file.redo_mut() {
                    if let Err(e) = redo.reset() {
                        warn!(error = %e, "failed to reset the redo log on drop");
                    }
                }
            }
            Err(e) => warn!(error = %e, "final commit failed while dropping the store"),
        }
        state.closed = true;
    }
}
