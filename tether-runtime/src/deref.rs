//! # Deref View
//!
//! Byte-offset access into managed objects. Native code treats a deref
//! handle as a pointer to a struct; this module turns `*(T*)(h + o)` into
//! leaf field accesses on the managed object:
//!
//! 1. the absolute offset (word offset plus call offset) and width are
//!    bounds-checked against the layout,
//! 2. the range is split into per-field segments and padding,
//! 3. each segment reads or writes its field through [`ManagedRuntime`].
//!
//! Reads that land inside a field read the whole field and slice it; writes
//! that cover part of a field read-modify-write it. Padding reads as zero and
//! writes to it are discarded.
//!
//! Pointer fields carry handle words on the native side. A read that finds a
//! managed reference reports it as a [`PendingPointer`]; the bridge mints (or
//! reuses) the pointee's handle and patches the word into the buffer. Writes
//! accept null or a live handle and store the designated reference. Pointer
//! fields are only accessed whole in either direction: a read that returned
//! part of a freshly minted word would leave a handle nobody can release.
//!
//! Locking is the caller's concern. Nothing here touches the handle table
//! except through the `resolve` callback passed to [`write_fields`].

use tracing::trace;

use crate::error::{HandleError, HandleResult};
use crate::layout::{FieldDescriptor, FieldType, LayoutDescriptor, TypeName, POINTER_SIZE};
use crate::runtime::{FieldValue, ManagedRuntime, RuntimeError};
use crate::tag::{HandleWord, MAX_OFFSET};

/// Widest single access: the whole addressable object.
pub const MAX_ACCESS_WIDTH: usize = MAX_OFFSET as usize + 1;

/// Part of an access range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Segment<'a> {
    /// Bytes `skip..skip + len` of a leaf field.
    Field {
        /// The leaf.
        field: &'a FieldDescriptor,
        /// Bytes of the field before the access starts.
        skip: usize,
        /// Bytes of the field covered by the access.
        len: usize,
    },
    /// Padding between (or after) fields.
    Padding {
        /// Length in bytes.
        len: usize,
    },
}

impl Segment<'_> {
    /// Bytes of the access this segment covers.
    pub fn len(&self) -> usize {
        match self {
            Segment::Field { len, .. } | Segment::Padding { len } => *len,
        }
    }

    /// Check if the segment covers no bytes.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Validate an access and return its absolute offset within the object.
pub fn absolute_offset(
    layout: &LayoutDescriptor,
    word_offset: u32,
    offset: u64,
    width: usize,
) -> HandleResult<u64> {
    if width == 0 || width > MAX_ACCESS_WIDTH {
        return Err(HandleError::InvalidWidth { width });
    }
    let start = u64::from(word_offset).saturating_add(offset);
    if !layout.contains_range(start, width as u64) {
        return Err(HandleError::OutOfBounds {
            offset: start,
            width: width as u64,
            size: layout.size(),
        });
    }
    Ok(start)
}

/// Split `absolute..absolute + width` into field segments and padding.
///
/// The range must already be inside the layout.
pub fn plan(layout: &LayoutDescriptor, absolute: u64, width: usize) -> Vec<Segment<'_>> {
    let end = absolute + width as u64;
    let mut cursor = absolute;
    let mut segments = Vec::new();

    for field in layout.fields_in(absolute, width as u64) {
        if field.offset > cursor {
            segments.push(Segment::Padding {
                len: (field.offset - cursor) as usize,
            });
            cursor = field.offset;
        }
        let stop = field.end().min(end);
        segments.push(Segment::Field {
            field,
            skip: (cursor - field.offset) as usize,
            len: (stop - cursor) as usize,
        });
        cursor = stop;
    }
    if cursor < end {
        segments.push(Segment::Padding {
            len: (end - cursor) as usize,
        });
    }
    segments
}

/// A pointer field whose handle word still has to be minted.
#[derive(Debug)]
pub struct PendingPointer<R> {
    /// Position of the word in the output buffer.
    pub at: usize,
    /// The referenced object.
    pub target: R,
    /// Layout name of the pointee; `None` for untyped pointers.
    pub pointee: Option<TypeName>,
}

impl<R> PendingPointer<R> {
    /// Copy `word` into `buf`.
    pub fn fill(&self, buf: &mut [u8], word: HandleWord) {
        let end = self.at + POINTER_SIZE as usize;
        buf[self.at..end].copy_from_slice(&word.raw().to_le_bytes());
    }
}

/// Result of reading raw field bytes.
#[derive(Debug)]
pub struct RawRead<R> {
    /// Little-endian bytes; pointer positions are zero until filled.
    pub bytes: Vec<u8>,
    /// Pointer fields that hold a reference.
    pub pointers: Vec<PendingPointer<R>>,
}

/// Read `width` bytes at `absolute` from `obj`.
///
/// Pointer fields must be read whole.
pub fn read_fields<M: ManagedRuntime>(
    runtime: &M,
    obj: &M::Ref,
    layout: &LayoutDescriptor,
    absolute: u64,
    width: usize,
) -> HandleResult<RawRead<M::Ref>> {
    let mut bytes = vec![0u8; width];
    let mut pointers = Vec::new();
    let mut at = 0;

    for segment in plan(layout, absolute, width) {
        let Segment::Field { field, skip, len } = segment else {
            at += segment.len();
            continue;
        };
        if field.ty.is_pointer() && !covers_whole(skip, len) {
            return Err(HandleError::InvalidWidth { width });
        }
        match runtime.read_field(obj, field)? {
            FieldValue::Bytes(value) => {
                let value = full_width(value, field)?;
                bytes[at..at + len].copy_from_slice(&value[skip..skip + len]);
            }
            FieldValue::Ref(None) => {}
            FieldValue::Ref(Some(target)) => match &field.ty {
                FieldType::Pointer { pointee } => pointers.push(PendingPointer {
                    at,
                    target,
                    pointee: pointee.clone(),
                }),
                _ => return Err(mismatch(field, "reference stored in scalar field").into()),
            },
        }
        at += len;
    }

    Ok(RawRead { bytes, pointers })
}

/// Write `src` at `absolute` into `obj`.
///
/// Every segment is validated (and pointer words resolved through
/// `resolve`) before the first field is written, so a rejected write leaves
/// the object untouched. Pointer fields must be written whole.
pub fn write_fields<M, F>(
    runtime: &M,
    obj: &M::Ref,
    layout: &LayoutDescriptor,
    absolute: u64,
    src: &[u8],
    resolve: F,
) -> HandleResult<()>
where
    M: ManagedRuntime,
    F: Fn(HandleWord) -> Option<M::Ref>,
{
    let mut staged: Vec<(&FieldDescriptor, FieldValue<M::Ref>)> = Vec::new();
    let mut at = 0;

    for segment in plan(layout, absolute, src.len()) {
        let (field, skip, len) = match segment {
            Segment::Field { field, skip, len } => (field, skip, len),
            Segment::Padding { len } => {
                trace!(len, "discarding write to padding");
                at += len;
                continue;
            }
        };
        let chunk = &src[at..at + len];

        let value = if field.ty.is_pointer() {
            let whole: [u8; POINTER_SIZE as usize] = match <[u8; 8]>::try_from(chunk) {
                Ok(whole) if covers_whole(skip, len) => whole,
                _ => return Err(HandleError::InvalidWidth { width: src.len() }),
            };
            let word = HandleWord::from_raw(u64::from_le_bytes(whole));
            if word.is_null() {
                FieldValue::Ref(None)
            } else {
                let target = resolve(word).ok_or(HandleError::NotAHandle { word })?;
                FieldValue::Ref(Some(target))
            }
        } else if skip == 0 && len as u64 == field.size() {
            FieldValue::Bytes(chunk.to_vec())
        } else {
            let current = match runtime.read_field(obj, field)? {
                FieldValue::Bytes(value) => full_width(value, field)?,
                FieldValue::Ref(_) => {
                    return Err(mismatch(field, "reference stored in scalar field").into())
                }
            };
            let mut merged = current;
            merged[skip..skip + len].copy_from_slice(chunk);
            FieldValue::Bytes(merged)
        };

        staged.push((field, value));
        at += len;
    }

    for (field, value) in staged {
        runtime.write_field(obj, field, value)?;
    }
    Ok(())
}

fn covers_whole(skip: usize, len: usize) -> bool {
    skip == 0 && len as u64 == u64::from(POINTER_SIZE)
}

fn full_width(value: Vec<u8>, field: &FieldDescriptor) -> Result<Vec<u8>, RuntimeError> {
    if value.len() as u64 == field.size() {
        Ok(value)
    } else {
        Err(mismatch(field, &format!("runtime returned {} bytes", value.len())))
    }
}

fn mismatch(field: &FieldDescriptor, detail: &str) -> RuntimeError {
    RuntimeError::TypeMismatch {
        field: field.to_string(),
        detail: detail.to_string(),
    }
}

macro_rules! typed_accessors {
    ($($read:ident, $write:ident => $ty:ty;)*) => {
        $(
            #[doc = concat!("Read a little-endian `", stringify!($ty), "` at `offset`.")]
            fn $read(&self, word: HandleWord, offset: u64) -> HandleResult<$ty> {
                const WIDTH: usize = std::mem::size_of::<$ty>();
                let bytes = self.read(word, offset, WIDTH)?;
                let buf = <[u8; WIDTH]>::try_from(bytes.as_slice())
                    .map_err(|_| HandleError::InvalidWidth { width: bytes.len() })?;
                Ok(<$ty>::from_le_bytes(buf))
            }

            #[doc = concat!("Write a little-endian `", stringify!($ty), "` at `offset`.")]
            fn $write(&self, word: HandleWord, offset: u64, value: $ty) -> HandleResult<()> {
                self.write(word, offset, &value.to_le_bytes())
            }
        )*
    };
}

/// Byte-offset access through deref handles.
///
/// Offsets are relative to the word, so `read(h + 4, 0, n)` and
/// `read(h, 4, n)` touch the same bytes.
pub trait DerefAccess {
    /// Read `width` bytes at `offset`.
    fn read(&self, word: HandleWord, offset: u64, width: usize) -> HandleResult<Vec<u8>>;

    /// Write `bytes` at `offset`.
    fn write(&self, word: HandleWord, offset: u64, bytes: &[u8]) -> HandleResult<()>;

    typed_accessors! {
        read_u8, write_u8 => u8;
        read_u16, write_u16 => u16;
        read_u32, write_u32 => u32;
        read_u64, write_u64 => u64;
        read_i32, write_i32 => i32;
        read_i64, write_i64 => i64;
        read_f32, write_f32 => f32;
        read_f64, write_f64 => f64;
    }

    /// Read a pointer field as a handle word (0 for null).
    ///
    /// A non-null result is an owned handle; release it when done.
    fn read_pointer(&self, word: HandleWord, offset: u64) -> HandleResult<HandleWord> {
        self.read_u64(word, offset).map(HandleWord::from_raw)
    }

    /// Store a handle word (or [`HandleWord::NULL`]) into a pointer field.
    fn write_pointer(&self, word: HandleWord, offset: u64, target: HandleWord) -> HandleResult<()> {
        self.write_u64(word, offset, target.raw())
    }
}
