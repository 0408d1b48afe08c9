//! # Handle Bridge
//!
//! The public face of the crate: turns managed references into handle words
//! native code can store, compare and dereference, and back again.
//!
//! ## Locking
//!
//! Table and identity cache sit behind a single `parking_lot::RwLock`:
//!
//! - `create`, `create_deref` and `release` take the write lock, so the cache
//!   lookup and the table update happen in one critical section
//! - `resolve`, `is_handle` and deref reads/writes take the read lock; deref
//!   accesses hold it across the runtime field access so a concurrent release
//!   cannot interleave
//! - a deref read that finds a reference drops the read lock before minting
//!   the pointee's handle under the write lock
//!
//! A `release` that has returned is visible to every later `resolve` on any
//! thread.

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, trace};

use crate::config::{BridgeConfig, ConfigError};
use crate::deref::{self, DerefAccess, RawRead};
use crate::error::{HandleError, HandleResult};
use crate::identity::{Flavor, IdentityCache};
use crate::layout::LayoutDescriptor;
use crate::runtime::ManagedRuntime;
use crate::table::{EntryKind, HandleTable, Released, TableStats};
use crate::tag::{HandleKind, HandleWord};

/// Occupancy snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgeStats {
    /// Handle table statistics.
    pub table: TableStats,
    /// Identity cache entries.
    pub cached: usize,
}

struct BridgeState<R: ManagedRuntime> {
    table: HandleTable<R::Ref>,
    cache: IdentityCache<R::Identity>,
}

/// Handle bridge over a managed runtime.
pub struct HandleBridge<R: ManagedRuntime> {
    runtime: Arc<R>,
    state: RwLock<BridgeState<R>>,
    config: BridgeConfig,
}

impl<R: ManagedRuntime> HandleBridge<R> {
    /// Create a bridge with the default configuration.
    pub fn new(runtime: Arc<R>) -> Self {
        Self::build(runtime, BridgeConfig::default())
    }

    /// Create a bridge with a validated configuration.
    pub fn with_config(runtime: Arc<R>, config: BridgeConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::build(runtime, config))
    }

    fn build(runtime: Arc<R>, config: BridgeConfig) -> Self {
        debug!(
            initial_slots = config.initial_slots,
            max_slots = config.max_slots,
            dedup_deref = config.dedup_deref,
            "creating handle bridge"
        );
        Self {
            runtime,
            state: RwLock::new(BridgeState {
                table: HandleTable::with_capacity(config.initial_slots, config.max_slots),
                cache: IdentityCache::new(),
            }),
            config,
        }
    }

    /// The managed runtime.
    pub fn runtime(&self) -> &Arc<R> {
        &self.runtime
    }

    /// Active configuration.
    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Get the opaque handle for `obj`.
    ///
    /// While a handle for the same object is live, the same word is returned
    /// and its live count goes up by one. Every successful call must be
    /// balanced by a [`release`](Self::release).
    pub fn create(&self, obj: &R::Ref) -> HandleResult<HandleWord> {
        self.create_entry(obj, EntryKind::Opaque, true)
    }

    /// Get a deref handle viewing `obj` through `layout`.
    ///
    /// Deduplication is keyed by the whole layout, so two layouts sharing a
    /// name but not a shape get separate handles. It can be switched off with
    /// [`BridgeConfig::dedup_deref`].
    pub fn create_deref(
        &self,
        obj: &R::Ref,
        layout: Arc<LayoutDescriptor>,
    ) -> HandleResult<HandleWord> {
        self.create_entry(obj, EntryKind::Deref(layout), self.config.dedup_deref)
    }

    /// Get a deref handle using the layout the runtime reports for
    /// `type_name`.
    pub fn create_deref_named(&self, obj: &R::Ref, type_name: &str) -> HandleResult<HandleWord> {
        let layout = self.runtime.describe_layout(type_name)?;
        self.create_deref(obj, layout)
    }

    fn create_entry(&self, obj: &R::Ref, kind: EntryKind, dedup: bool) -> HandleResult<HandleWord> {
        let identity = self.runtime.identity(obj);
        let flavor = flavor_of(&kind);

        let mut guard = self.state.write();
        let state = &mut *guard;
        if dedup {
            if let Some(word) = state.cache.lookup(&identity, &flavor) {
                let live = state.table.retain(word)?;
                trace!(%word, live, "reusing cached handle");
                return Ok(word);
            }
        }

        let word = state.table.allocate(obj.clone(), kind)?;
        if dedup {
            state.cache.insert(identity, flavor, word);
        }
        self.runtime.pin(obj);
        Ok(word)
    }

    /// Check whether `word` designates a live handle. Never fails.
    ///
    /// Deref words carrying an offset count as handles as long as their entry
    /// is live, whatever the offset.
    pub fn is_handle(&self, word: HandleWord) -> bool {
        match self.state.read().table.resolve(word) {
            Ok(_) => true,
            Err(err) => {
                trace!(%word, %err, "rejected probe");
                false
            }
        }
    }

    /// The managed reference a live handle designates.
    pub fn resolve(&self, word: HandleWord) -> HandleResult<R::Ref> {
        let state = self.state.read();
        let entry = state.table.resolve(word)?;
        Ok(entry.managed().clone())
    }

    /// The layout of a live deref handle.
    pub fn layout_of(&self, word: HandleWord) -> HandleResult<Arc<LayoutDescriptor>> {
        let state = self.state.read();
        let (_, layout) = deref_entry(&state.table, word)?;
        Ok(layout.clone())
    }

    /// Outstanding `create` calls for the handle.
    pub fn live_count(&self, word: HandleWord) -> HandleResult<u32> {
        let state = self.state.read();
        Ok(state.table.resolve(word)?.live_count())
    }

    /// Drop one reference. The last release frees the slot and unpins the
    /// object; the word (and any offset copies of it) is dead from then on.
    pub fn release(&self, word: HandleWord) -> HandleResult<()> {
        let mut guard = self.state.write();
        let state = &mut *guard;
        let released = state.table.release(word).map_err(|err| {
            debug!(%word, %err, "release rejected");
            err
        })?;

        match released {
            Released::Decremented { remaining } => {
                trace!(%word, remaining, "handle still live");
            }
            Released::Freed { managed, kind } => {
                let identity = self.runtime.identity(&managed);
                state.cache.remove_if(&identity, &flavor_of(&kind), word.base());
                self.runtime.unpin(&managed);
            }
        }
        Ok(())
    }

    /// Move a deref word by `delta` bytes.
    ///
    /// The result designates the same entry; nothing is minted and nothing
    /// needs releasing beyond the original handle.
    pub fn offset_by(&self, word: HandleWord, delta: i64) -> HandleResult<HandleWord> {
        {
            let state = self.state.read();
            deref_entry(&state.table, word)?;
        }
        word.offset_by(delta)
            .ok_or(HandleError::OffsetOverflow { word, delta })
    }

    /// Free every live handle regardless of live count. Returns how many
    /// entries were reclaimed.
    pub fn release_all(&self) -> usize {
        let mut guard = self.state.write();
        let state = &mut *guard;
        let drained = state.table.drain();
        state.cache.clear();
        for (_, managed) in &drained {
            self.runtime.unpin(managed);
        }
        if !drained.is_empty() {
            debug!(count = drained.len(), "released all handles");
        }
        drained.len()
    }

    /// Occupancy snapshot.
    pub fn stats(&self) -> BridgeStats {
        let state = self.state.read();
        BridgeStats {
            table: state.table.stats(),
            cached: state.cache.len(),
        }
    }

    fn mint_pointee(&self, target: &R::Ref, pointee: Option<&str>) -> HandleResult<HandleWord> {
        match pointee {
            Some(type_name) => self.create_deref_named(target, type_name),
            None => self.create(target),
        }
    }
}

impl<R: ManagedRuntime> DerefAccess for HandleBridge<R> {
    /// Read `width` bytes at `offset` from a deref handle.
    ///
    /// Pointer fields holding a reference read as an owned deref handle for
    /// the pointee (an opaque handle for untyped pointers); release it when
    /// done. Null reads as 0. A range covering only part of a pointer field
    /// is rejected with [`HandleError::InvalidWidth`] and mints nothing.
    fn read(&self, word: HandleWord, offset: u64, width: usize) -> HandleResult<Vec<u8>> {
        let RawRead {
            mut bytes,
            pointers,
        } = {
            let state = self.state.read();
            let (obj, layout) = deref_entry(&state.table, word)?;
            let absolute = deref::absolute_offset(layout, word.offset(), offset, width)?;
            let raw = deref::read_fields(&*self.runtime, obj, layout, absolute, width)?;
            raw
        };

        let mut minted = Vec::with_capacity(pointers.len());
        for pending in &pointers {
            match self.mint_pointee(&pending.target, pending.pointee.as_deref()) {
                Ok(handle) => {
                    pending.fill(&mut bytes, handle);
                    minted.push(handle);
                }
                Err(err) => {
                    for handle in minted {
                        if let Err(undo) = self.release(handle) {
                            debug!(%handle, %undo, "rollback release failed");
                        }
                    }
                    return Err(err);
                }
            }
        }
        Ok(bytes)
    }

    /// Write `bytes` at `offset` through a deref handle.
    ///
    /// Pointer fields accept 0 or a live handle word and must be written
    /// whole.
    fn write(&self, word: HandleWord, offset: u64, bytes: &[u8]) -> HandleResult<()> {
        let state = self.state.read();
        let (obj, layout) = deref_entry(&state.table, word)?;
        let absolute = deref::absolute_offset(layout, word.offset(), offset, bytes.len())?;
        deref::write_fields(&*self.runtime, obj, layout, absolute, bytes, |target| {
            state
                .table
                .resolve(target)
                .ok()
                .map(|entry| entry.managed().clone())
        })
    }
}

impl<R: ManagedRuntime> Drop for HandleBridge<R> {
    fn drop(&mut self) {
        self.release_all();
    }
}

impl<R: ManagedRuntime> fmt::Debug for HandleBridge<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandleBridge")
            .field("stats", &self.stats())
            .field("config", &self.config)
            .finish()
    }
}

fn flavor_of(kind: &EntryKind) -> Flavor {
    match kind {
        EntryKind::Opaque => Flavor::Opaque,
        EntryKind::Deref(layout) => Flavor::Deref(layout.clone()),
    }
}

fn deref_entry<T>(
    table: &HandleTable<T>,
    word: HandleWord,
) -> HandleResult<(&T, &Arc<LayoutDescriptor>)> {
    let entry = table.resolve(word)?;
    match entry.kind() {
        EntryKind::Deref(layout) => Ok((entry.managed(), layout)),
        EntryKind::Opaque => Err(HandleError::WrongKind {
            word,
            expected: HandleKind::Deref,
            actual: HandleKind::Opaque,
        }),
    }
}
