//! # Handle Errors
//!
//! Every bridge operation reports failure through [`HandleError`]. Native
//! callers routinely probe arbitrary integers, so none of these are fatal:
//! the bridge never aborts and never hands back a plausible-looking wrong
//! answer.

use thiserror::Error;

use crate::runtime::RuntimeError;
use crate::tag::{Generation, HandleKind, HandleWord};

/// Errors returned by the handle bridge.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandleError {
    /// The value does not carry the handle tag.
    #[error("{word} is not a handle")]
    NotAHandle {
        /// The rejected value.
        word: HandleWord,
    },

    /// The tag matched but no live entry has this generation.
    #[error("stale handle {word}: slot {slot} is at generation {current}")]
    Stale {
        /// The rejected value.
        word: HandleWord,
        /// Slot index encoded in the value.
        slot: u32,
        /// Generation currently stored in the slot (0 if the slot never existed).
        current: Generation,
    },

    /// A handle that was already fully released was released again.
    #[error("handle {word} was already released")]
    DoubleRelease {
        /// The rejected value.
        word: HandleWord,
    },

    /// A deref operation was attempted on an opaque handle (or vice versa).
    #[error("handle {word} is {actual:?}, expected {expected:?}")]
    WrongKind {
        /// The rejected value.
        word: HandleWord,
        /// Kind the operation requires.
        expected: HandleKind,
        /// Kind of the entry.
        actual: HandleKind,
    },

    /// The access range does not fit inside the object's layout.
    #[error("access of {width} bytes at offset {offset} exceeds object size {size}")]
    OutOfBounds {
        /// Absolute byte offset of the access.
        offset: u64,
        /// Width of the access in bytes.
        width: u64,
        /// Total size of the layout.
        size: u64,
    },

    /// Pointer arithmetic moved the offset outside the encodable range.
    #[error("offset arithmetic on {word} by {delta} leaves the encodable range")]
    OffsetOverflow {
        /// The base value.
        word: HandleWord,
        /// Requested byte delta.
        delta: i64,
    },

    /// Zero-width or oversized access.
    #[error("invalid access width {width}")]
    InvalidWidth {
        /// The rejected width.
        width: usize,
    },

    /// Every slot the configuration allows is in use. Releasing a handle
    /// makes room again.
    #[error("handle table is full ({max_slots} slots)")]
    TableFull {
        /// Configured slot limit.
        max_slots: u32,
    },

    /// Every slot the configuration allows has exhausted its generations and
    /// been retired. No release can make room; the bridge must be replaced.
    #[error("handle table exhausted: all {retired} slots are retired")]
    Exhausted {
        /// Retired slots, equal to the configured limit.
        retired: u32,
    },

    /// The handle's live count cannot go any higher.
    #[error("live count of {word} would overflow")]
    LiveCountOverflow {
        /// The handle being retained.
        word: HandleWord,
    },

    /// The managed runtime rejected a field access or layout lookup.
    #[error("managed runtime error: {0}")]
    Runtime(#[from] RuntimeError),
}

impl HandleError {
    /// Stable integer code reported across the C ABI.
    pub fn code(&self) -> i32 {
        match self {
            HandleError::NotAHandle { .. } => codes::NOT_A_HANDLE,
            HandleError::Stale { .. } => codes::STALE,
            HandleError::WrongKind { .. } => codes::WRONG_KIND,
            HandleError::OutOfBounds { .. } | HandleError::OffsetOverflow { .. } => {
                codes::OUT_OF_BOUNDS
            }
            HandleError::DoubleRelease { .. } => codes::DOUBLE_RELEASE,
            HandleError::TableFull { .. } => codes::TABLE_FULL,
            HandleError::Runtime(_) => codes::RUNTIME,
            HandleError::InvalidWidth { .. } => codes::INVALID_WIDTH,
            HandleError::Exhausted { .. } => codes::EXHAUSTED,
            HandleError::LiveCountOverflow { .. } => codes::LIVE_COUNT_OVERFLOW,
        }
    }

    /// Whether this error means "the value is not a live handle".
    pub fn is_invalid_handle(&self) -> bool {
        matches!(
            self,
            HandleError::NotAHandle { .. }
                | HandleError::Stale { .. }
                | HandleError::DoubleRelease { .. }
        )
    }
}

/// Native error codes. Zero is success.
pub mod codes {
    /// Operation succeeded.
    pub const OK: i32 = 0;
    /// Value does not carry the handle tag.
    pub const NOT_A_HANDLE: i32 = -1;
    /// Tag matched, generation did not.
    pub const STALE: i32 = -2;
    /// Deref operation on an opaque handle.
    pub const WRONG_KIND: i32 = -3;
    /// Access outside the object layout.
    pub const OUT_OF_BOUNDS: i32 = -4;
    /// Handle released twice.
    pub const DOUBLE_RELEASE: i32 = -5;
    /// No free slots.
    pub const TABLE_FULL: i32 = -6;
    /// Managed runtime failure.
    pub const RUNTIME: i32 = -7;
    /// Bad access width.
    pub const INVALID_WIDTH: i32 = -8;
    /// No bridge installed for native calls.
    pub const NO_BRIDGE: i32 = -9;
    /// Null out/in pointer passed from native code.
    pub const NULL_POINTER: i32 = -10;
    /// Every slot retired.
    pub const EXHAUSTED: i32 = -11;
    /// Live count at its maximum.
    pub const LIVE_COUNT_OVERFLOW: i32 = -12;
}

/// Result alias for bridge operations.
pub type HandleResult<T> = Result<T, HandleError>;
