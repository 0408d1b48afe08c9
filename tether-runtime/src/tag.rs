//! # Tag Scheme
//!
//! Handles are plain 64-bit words so native code can store them wherever it
//! would store a pointer. A reserved high-bit pattern marks a word as a
//! handle; the rest of the word packs the slot index, the slot generation and,
//! for deref handles, a byte offset that native pointer arithmetic moves.
//!
//! ## Layout
//!
//! ```text
//!  63   61 60  59            44 43            24 23             0
//! ┌───────┬────┬───────────────┬────────────────┬───────────────┐
//! │  101  │kind│  generation   │      slot      │    offset     │
//! └───────┴────┴───────────────┴────────────────┴───────────────┘
//!    3      1        16               20               24
//! ```
//!
//! User-space addresses on x86-64 and AArch64 keep the top bits clear, so the
//! `101` pattern never matches an address handed out by the allocator or the
//! stack. A foreign integer that happens to carry the pattern is still
//! syntactically a handle: rejection then falls to the table's generation
//! check, which makes discrimination probabilistic rather than absolute.
//!
//! ## Technical References
//!
//! - [Handles are the better pointers](https://floooh.github.io/2018/06/17/handles-vs-pointers.html)
//! - [slotmap](https://crates.io/crates/slotmap)

use std::fmt;

/// Generation counter for detecting stale handles.
pub type Generation = u32;

/// Reserved generation values.
pub mod generation {
    use super::Generation;

    /// Never issued; a word carrying it is always stale.
    pub const UNINITIALIZED: Generation = 0;
    /// First generation handed out for a fresh slot.
    pub const FIRST: Generation = 1;
    /// Largest generation the word encoding can carry. A slot that reaches it
    /// is retired instead of wrapping.
    pub const MAX_ENCODED: Generation = (1 << super::GENERATION_BITS) - 1;
}

const TAG_SHIFT: u32 = 61;
const TAG_PATTERN: u64 = 0b101;
const KIND_BIT: u64 = 1 << 60;

const GENERATION_SHIFT: u32 = 44;
const GENERATION_BITS: u32 = 16;
const SLOT_SHIFT: u32 = 24;
const SLOT_BITS: u32 = 20;
const OFFSET_BITS: u32 = 24;

const GENERATION_MASK: u64 = (1 << GENERATION_BITS) - 1;
const SLOT_MASK: u64 = (1 << SLOT_BITS) - 1;
const OFFSET_MASK: u64 = (1 << OFFSET_BITS) - 1;

/// Number of distinct slot indices a word can address.
pub const MAX_SLOTS: u32 = 1 << SLOT_BITS;

/// Largest byte offset a deref word can carry.
pub const MAX_OFFSET: u32 = (1 << OFFSET_BITS) - 1;

/// Which flavor of handle a word (or table entry) is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandleKind {
    /// Identity only; supports resolve and release.
    Opaque,
    /// Identity plus byte-offset field access through a layout.
    Deref,
}

/// A native-word-sized value that may or may not be a handle.
///
/// Equality is numeric, exactly as native code compares pointers.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[repr(transparent)]
pub struct HandleWord(u64);

impl HandleWord {
    /// The null word.
    pub const NULL: Self = Self(0);

    /// Wrap a raw integer received from native code.
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw integer handed to native code.
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Check if the word is null.
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Check the reserved tag bits only. No table lookup.
    pub const fn has_tag(self) -> bool {
        self.0 >> TAG_SHIFT == TAG_PATTERN
    }

    /// The same word with the offset bits cleared.
    pub const fn base(self) -> Self {
        Self(self.0 & !OFFSET_MASK)
    }

    /// The byte offset carried in the low bits.
    pub const fn offset(self) -> u32 {
        (self.0 & OFFSET_MASK) as u32
    }

    /// Advance (or rewind) a deref word by `delta` bytes.
    ///
    /// Returns `None` for words that are not deref handles, and when the new
    /// offset would be negative or exceed [`MAX_OFFSET`]. The result refers
    /// to the same table entry; no new handle is minted.
    pub fn offset_by(self, delta: i64) -> Option<Self> {
        let fields = untag(self)?;
        if fields.kind != HandleKind::Deref {
            return None;
        }
        let target = i64::from(fields.offset).checked_add(delta)?;
        if !(0..=i64::from(MAX_OFFSET)).contains(&target) {
            return None;
        }
        Some(Self(self.base().0 | target as u64))
    }
}

impl fmt::Debug for HandleWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HandleWord({:#018x})", self.0)
    }
}

impl fmt::Display for HandleWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

impl From<u64> for HandleWord {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

impl From<HandleWord> for u64 {
    fn from(word: HandleWord) -> Self {
        word.0
    }
}

/// Fields decoded from a tagged word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaggedFields {
    /// Handle flavor.
    pub kind: HandleKind,
    /// Slot index into the handle table.
    pub slot: u32,
    /// Generation the slot had when the handle was issued.
    pub generation: Generation,
    /// Byte offset (always zero for opaque handles).
    pub offset: u32,
}

/// Pack a slot index and generation into a handle word with a zero offset.
pub fn tag(kind: HandleKind, slot: u32, generation: Generation) -> HandleWord {
    tag_with_offset(kind, slot, generation, 0)
}

/// Pack all fields into a handle word.
///
/// Out-of-range inputs are masked; the table never produces them.
pub fn tag_with_offset(
    kind: HandleKind,
    slot: u32,
    generation: Generation,
    offset: u32,
) -> HandleWord {
    debug_assert!(slot < MAX_SLOTS);
    debug_assert!(generation <= generation::MAX_ENCODED);
    debug_assert!(offset <= MAX_OFFSET);
    debug_assert!(kind == HandleKind::Deref || offset == 0);

    let mut raw = TAG_PATTERN << TAG_SHIFT;
    if kind == HandleKind::Deref {
        raw |= KIND_BIT;
    }
    raw |= (u64::from(generation) & GENERATION_MASK) << GENERATION_SHIFT;
    raw |= (u64::from(slot) & SLOT_MASK) << SLOT_SHIFT;
    raw |= u64::from(offset) & OFFSET_MASK;
    HandleWord(raw)
}

/// Decode a word. `None` means "clearly not a handle".
///
/// Opaque words with a non-zero offset are rejected here: opaque handles do
/// not support pointer arithmetic, so such a value was never produced by the
/// bridge.
pub fn untag(word: HandleWord) -> Option<TaggedFields> {
    if !word.has_tag() {
        return None;
    }
    let raw = word.raw();
    let kind = if raw & KIND_BIT != 0 {
        HandleKind::Deref
    } else {
        HandleKind::Opaque
    };
    let offset = (raw & OFFSET_MASK) as u32;
    if kind == HandleKind::Opaque && offset != 0 {
        return None;
    }
    Some(TaggedFields {
        kind,
        slot: ((raw >> SLOT_SHIFT) & SLOT_MASK) as u32,
        generation: ((raw >> GENERATION_SHIFT) & GENERATION_MASK) as Generation,
        offset,
    })
}
