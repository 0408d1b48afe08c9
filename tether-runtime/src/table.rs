//! # Handle Table
//!
//! Slot arena mapping handle words to managed references.
//!
//! ## Design
//!
//! Each slot carries a generation counter. Freeing a slot bumps its
//! generation, so any copy of the old handle word fails the generation check
//! forever after, even once the slot is reused for an unrelated object. This
//! is the [generational arena](https://crates.io/crates/generational-arena)
//! pattern for solving the ABA problem.
//!
//! A slot whose generation reaches [`generation::MAX_ENCODED`] is retired
//! instead of reused: the word encoding cannot carry a larger generation, and
//! wrapping would let an ancient handle value come back to life. Freed slots
//! queue up FIFO so reuse (and generation wear) spreads across the table.
//! Once every slot is retired, allocation fails with
//! [`HandleError::Exhausted`].
//!
//! The table itself is not synchronized; the bridge serializes access.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::error::{HandleError, HandleResult};
use crate::layout::LayoutDescriptor;
use crate::tag::{self, generation, Generation, HandleKind, HandleWord, TaggedFields};

/// What a table entry supports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKind {
    /// Identity only.
    Opaque,
    /// Identity plus byte-offset access through an immutable layout.
    Deref(Arc<LayoutDescriptor>),
}

impl EntryKind {
    /// The handle flavor encoded in words for this entry.
    pub fn handle_kind(&self) -> HandleKind {
        match self {
            EntryKind::Opaque => HandleKind::Opaque,
            EntryKind::Deref(_) => HandleKind::Deref,
        }
    }

    /// Layout of a deref entry.
    pub fn layout(&self) -> Option<&Arc<LayoutDescriptor>> {
        match self {
            EntryKind::Opaque => None,
            EntryKind::Deref(layout) => Some(layout),
        }
    }
}

/// A live table entry.
#[derive(Debug, Clone)]
pub struct Entry<R> {
    managed: R,
    kind: EntryKind,
    live_count: u32,
}

impl<R> Entry<R> {
    /// The managed reference this entry keeps alive.
    pub fn managed(&self) -> &R {
        &self.managed
    }

    /// Entry kind.
    pub fn kind(&self) -> &EntryKind {
        &self.kind
    }

    /// Number of `release` calls still needed before the slot is reclaimed.
    pub fn live_count(&self) -> u32 {
        self.live_count
    }
}

struct Slot<R> {
    generation: Generation,
    entry: Option<Entry<R>>,
    retired: bool,
}

/// Outcome of a successful release.
#[derive(Debug)]
pub enum Released<R> {
    /// Other holders remain.
    Decremented {
        /// Remaining live count.
        remaining: u32,
    },
    /// The last holder released; the slot has been reclaimed.
    Freed {
        /// Reference the slot held.
        managed: R,
        /// Kind of the reclaimed entry.
        kind: EntryKind,
    },
}

/// Occupancy statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableStats {
    /// Slots ever created.
    pub capacity: usize,
    /// Slots holding a live entry.
    pub live: usize,
    /// Slots waiting on the free list.
    pub free: usize,
    /// Slots permanently taken out of service.
    pub retired: usize,
}

/// Generational slot table.
pub struct HandleTable<R> {
    slots: Vec<Slot<R>>,
    free: VecDeque<u32>,
    live: usize,
    retired: usize,
    max_slots: u32,
}

impl<R> HandleTable<R> {
    /// Create a table with no slots and the full encodable slot range.
    pub fn new() -> Self {
        Self::with_capacity(0, tag::MAX_SLOTS)
    }

    /// Create a table, pre-reserving `initial` slots and refusing to grow past
    /// `max_slots` (clamped to what the word encoding can address).
    pub fn with_capacity(initial: usize, max_slots: u32) -> Self {
        Self {
            slots: Vec::with_capacity(initial),
            free: VecDeque::new(),
            live: 0,
            retired: 0,
            max_slots: max_slots.min(tag::MAX_SLOTS),
        }
    }

    /// Store a new entry with a live count of one.
    pub fn allocate(&mut self, managed: R, kind: EntryKind) -> HandleResult<HandleWord> {
        let handle_kind = kind.handle_kind();
        let entry = Entry {
            managed,
            kind,
            live_count: 1,
        };

        let index = match self.free.pop_front() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                debug_assert!(slot.entry.is_none() && !slot.retired);
                slot.entry = Some(entry);
                trace!(slot = index, generation = slot.generation, "reusing slot");
                index
            }
            None => {
                if self.slots.len() >= self.max_slots as usize {
                    if self.live == 0 {
                        warn!(retired = self.retired, "every slot is retired");
                        return Err(HandleError::Exhausted {
                            retired: self.retired as u32,
                        });
                    }
                    warn!(max_slots = self.max_slots, "handle table full");
                    return Err(HandleError::TableFull {
                        max_slots: self.max_slots,
                    });
                }
                let index = self.slots.len() as u32;
                self.slots.push(Slot {
                    generation: generation::FIRST,
                    entry: Some(entry),
                    retired: false,
                });
                index
            }
        };

        self.live += 1;
        let generation = self.slots[index as usize].generation;
        let word = tag::tag(handle_kind, index, generation);
        debug!(%word, slot = index, generation, kind = ?handle_kind, "allocated handle");
        Ok(word)
    }

    /// Look up the live entry a word designates.
    pub fn resolve(&self, word: HandleWord) -> HandleResult<&Entry<R>> {
        let fields = tag::untag(word).ok_or(HandleError::NotAHandle { word })?;
        let slot = self.checked_slot(word, &fields)?;
        match &slot.entry {
            Some(entry) if entry.kind.handle_kind() == fields.kind => Ok(entry),
            _ => Err(stale(word, &fields, slot.generation)),
        }
    }

    /// Increment the live count of the entry a word designates.
    ///
    /// Fails with [`HandleError::LiveCountOverflow`] rather than saturating,
    /// so the count never falls behind the number of holders.
    pub fn retain(&mut self, word: HandleWord) -> HandleResult<u32> {
        let fields = tag::untag(word).ok_or(HandleError::NotAHandle { word })?;
        let current = self.checked_slot(word, &fields)?.generation;
        let slot = &mut self.slots[index_of(&fields)];
        match slot.entry.as_mut() {
            Some(entry) if entry.kind.handle_kind() == fields.kind => {
                entry.live_count = entry
                    .live_count
                    .checked_add(1)
                    .ok_or(HandleError::LiveCountOverflow { word })?;
                Ok(entry.live_count)
            }
            _ => Err(stale(word, &fields, current)),
        }
    }

    /// Decrement the live count; reclaim the slot when it reaches zero.
    ///
    /// A word whose generation is older than the slot's, or whose slot was
    /// retired by its final release, is reported as
    /// [`HandleError::DoubleRelease`] and leaves the slot untouched, so an
    /// unrelated entry that reused the slot is unaffected.
    pub fn release(&mut self, word: HandleWord) -> HandleResult<Released<R>> {
        let fields = tag::untag(word).ok_or(HandleError::NotAHandle { word })?;
        let slot = self
            .slots
            .get_mut(index_of(&fields))
            .ok_or(HandleError::Stale {
                word,
                slot: fields.slot,
                current: generation::UNINITIALIZED,
            })?;

        if fields.generation != generation::UNINITIALIZED && fields.generation < slot.generation {
            return Err(HandleError::DoubleRelease { word });
        }
        if fields.generation != slot.generation {
            return Err(stale(word, &fields, slot.generation));
        }
        if slot.retired {
            return Err(HandleError::DoubleRelease { word });
        }
        let entry = match slot.entry.as_mut() {
            Some(entry) if entry.kind.handle_kind() == fields.kind => entry,
            _ => return Err(stale(word, &fields, slot.generation)),
        };

        entry.live_count -= 1;
        if entry.live_count > 0 {
            return Ok(Released::Decremented {
                remaining: entry.live_count,
            });
        }

        let Some(entry) = slot.entry.take() else {
            return Err(stale(word, &fields, slot.generation));
        };
        if slot.generation >= generation::MAX_ENCODED {
            slot.retired = true;
            self.retired += 1;
            warn!(slot = fields.slot, "slot generation exhausted, retiring slot");
        } else {
            slot.generation += 1;
            self.free.push_back(fields.slot);
        }
        self.live -= 1;
        debug!(%word, slot = fields.slot, "released handle");

        Ok(Released::Freed {
            managed: entry.managed,
            kind: entry.kind,
        })
    }

    /// Reclaim every live entry regardless of live count.
    pub fn drain(&mut self) -> Vec<(HandleWord, R)> {
        let mut drained = Vec::with_capacity(self.live);
        for (index, slot) in self.slots.iter_mut().enumerate() {
            let Some(entry) = slot.entry.take() else {
                continue;
            };
            let word = tag::tag(entry.kind.handle_kind(), index as u32, slot.generation);
            if slot.generation >= generation::MAX_ENCODED {
                slot.retired = true;
                self.retired += 1;
            } else {
                slot.generation += 1;
                self.free.push_back(index as u32);
            }
            drained.push((word, entry.managed));
        }
        self.live = 0;
        drained
    }

    /// Current generation of a slot, if the slot exists.
    pub fn slot_generation(&self, slot: u32) -> Option<Generation> {
        self.slots.get(slot as usize).map(|s| s.generation)
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.live
    }

    /// Check if no entries are live.
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Occupancy statistics.
    pub fn stats(&self) -> TableStats {
        TableStats {
            capacity: self.slots.len(),
            live: self.live,
            free: self.free.len(),
            retired: self.retired,
        }
    }

    fn checked_slot(&self, word: HandleWord, fields: &TaggedFields) -> HandleResult<&Slot<R>> {
        let slot = self.slots.get(index_of(fields)).ok_or(HandleError::Stale {
            word,
            slot: fields.slot,
            current: generation::UNINITIALIZED,
        })?;
        if slot.generation != fields.generation {
            return Err(stale(word, fields, slot.generation));
        }
        Ok(slot)
    }

    #[cfg(test)]
    fn force_generation(&mut self, slot: u32, generation: Generation) {
        self.slots[slot as usize].generation = generation;
    }

    #[cfg(test)]
    fn force_live_count(&mut self, slot: u32, live_count: u32) {
        if let Some(entry) = self.slots[slot as usize].entry.as_mut() {
            entry.live_count = live_count;
        }
    }
}

impl<R> Default for HandleTable<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R> fmt::Debug for HandleTable<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandleTable")
            .field("stats", &self.stats())
            .field("max_slots", &self.max_slots)
            .finish()
    }
}

fn index_of(fields: &TaggedFields) -> usize {
    fields.slot as usize
}

fn stale(word: HandleWord, fields: &TaggedFields, current: Generation) -> HandleError {
    HandleError::Stale {
        word,
        slot: fields.slot,
        current,
    }
}
