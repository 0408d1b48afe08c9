//! # Native Layout Descriptors
//!
//! A [`LayoutDescriptor`] describes how a managed type looks when viewed as a
//! native struct: which byte range each field occupies, and the total size.
//! Deref handles use it to translate `*(T*)(handle + offset)` into field
//! accesses on the managed object.
//!
//! Layouts are flattened: arrays become one leaf per element and nested
//! structs become dotted leaf names, so every leaf is a scalar or a pointer
//! that the managed runtime can read and write on its own.
//!
//! [`LayoutBuilder`] computes offsets the way a C compiler does for the
//! equivalent declaration: natural alignment, padding between fields, tail
//! padding up to the struct alignment, and no padding at all for packed
//! structs.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// Name of a managed type, as understood by the runtime's layout lookup.
pub type TypeName = Arc<str>;

/// Size of a pointer-typed field. Handles are always 64-bit words.
pub const POINTER_SIZE: u32 = 8;

/// Errors produced while building a layout.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LayoutError {
    /// Two fields share a name.
    #[error("duplicate field '{0}'")]
    DuplicateField(String),
    /// An integer or float width the native ABI does not have.
    #[error("unsupported scalar width {size} for field '{field}'")]
    UnsupportedWidth {
        /// Field name.
        field: String,
        /// Requested width in bytes.
        size: u32,
    },
    /// Zero-length arrays and empty structs have no native counterpart here.
    #[error("field '{0}' has zero size")]
    ZeroSized(String),
    /// The struct does not fit in the offset range a handle can address.
    #[error("layout '{name}' is {size} bytes, larger than the addressable {max}")]
    TooLarge {
        /// Type name.
        name: String,
        /// Computed size.
        size: u64,
        /// Limit.
        max: u64,
    },
}

/// Type of a single leaf field.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FieldType {
    /// Integer of 1, 2, 4 or 8 bytes.
    Int {
        /// Width in bytes.
        size: u32,
        /// Signedness (informational; bytes are passed through unchanged).
        signed: bool,
    },
    /// IEEE float of 4 or 8 bytes.
    Float {
        /// Width in bytes.
        size: u32,
    },
    /// One-byte boolean.
    Bool,
    /// Pointer-sized field. With a pointee name, the field holds a reference
    /// to another deref-compatible managed object.
    Pointer {
        /// Layout name of the pointee, if it is a managed struct.
        pointee: Option<TypeName>,
    },
}

impl FieldType {
    /// Signed 32-bit integer.
    pub fn i32() -> Self {
        FieldType::Int { size: 4, signed: true }
    }

    /// Signed 64-bit integer.
    pub fn i64() -> Self {
        FieldType::Int { size: 8, signed: true }
    }

    /// Unsigned 8-bit integer.
    pub fn u8() -> Self {
        FieldType::Int { size: 1, signed: false }
    }

    /// 64-bit float.
    pub fn f64() -> Self {
        FieldType::Float { size: 8 }
    }

    /// Pointer to another managed struct.
    pub fn pointer_to(pointee: &str) -> Self {
        FieldType::Pointer { pointee: Some(Arc::from(pointee)) }
    }

    /// Untyped pointer.
    pub fn void_pointer() -> Self {
        FieldType::Pointer { pointee: None }
    }

    /// Size in bytes.
    pub fn size(&self) -> u32 {
        match self {
            FieldType::Int { size, .. } | FieldType::Float { size } => *size,
            FieldType::Bool => 1,
            FieldType::Pointer { .. } => POINTER_SIZE,
        }
    }

    /// Natural alignment in bytes.
    pub fn alignment(&self) -> u32 {
        self.size().max(1)
    }

    /// Whether the field holds a reference.
    pub fn is_pointer(&self) -> bool {
        matches!(self, FieldType::Pointer { .. })
    }

    fn check(&self, field: &str) -> Result<(), LayoutError> {
        let ok = match self {
            FieldType::Int { size, .. } => matches!(size, 1 | 2 | 4 | 8),
            FieldType::Float { size } => matches!(size, 4 | 8),
            FieldType::Bool | FieldType::Pointer { .. } => true,
        };
        if ok {
            Ok(())
        } else {
            Err(LayoutError::UnsupportedWidth {
                field: field.to_string(),
                size: self.size(),
            })
        }
    }
}

/// One leaf of a flattened layout.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldDescriptor {
    /// Field name; nested struct members are joined with `.`.
    pub name: Arc<str>,
    /// Element index for array members.
    pub index: Option<u32>,
    /// Byte offset from the start of the struct.
    pub offset: u64,
    /// Leaf type.
    pub ty: FieldType,
}

impl FieldDescriptor {
    /// Size of the leaf in bytes.
    pub fn size(&self) -> u64 {
        u64::from(self.ty.size())
    }

    /// One past the last byte of the leaf.
    pub fn end(&self) -> u64 {
        self.offset + self.size()
    }
}

impl fmt::Display for FieldDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.index {
            Some(i) => write!(f, "{}[{}]@{}", self.name, i, self.offset),
            None => write!(f, "{}@{}", self.name, self.offset),
        }
    }
}

/// Native-ABI view of a managed type. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LayoutDescriptor {
    name: TypeName,
    fields: Vec<FieldDescriptor>,
    size: u64,
    alignment: u64,
}

impl LayoutDescriptor {
    /// Start building a layout for the named type.
    pub fn builder(name: &str) -> LayoutBuilder {
        LayoutBuilder::new(name)
    }

    /// Type name.
    pub fn name(&self) -> &TypeName {
        &self.name
    }

    /// Total size including tail padding.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Struct alignment.
    pub fn alignment(&self) -> u64 {
        self.alignment
    }

    /// All leaves, ordered by offset.
    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }

    /// Look up a non-array leaf (or element 0 of an array) by name.
    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields
            .iter()
            .find(|f| &*f.name == name && f.index.unwrap_or(0) == 0)
    }

    /// Look up an array element.
    pub fn element(&self, name: &str, index: u32) -> Option<&FieldDescriptor> {
        self.fields
            .iter()
            .find(|f| &*f.name == name && f.index == Some(index))
    }

    /// Whether `offset..offset + width` lies inside the struct.
    pub fn contains_range(&self, offset: u64, width: u64) -> bool {
        offset
            .checked_add(width)
            .map(|end| end <= self.size)
            .unwrap_or(false)
    }

    /// Leaves overlapping `offset..offset + width`, in offset order.
    pub fn fields_in(&self, offset: u64, width: u64) -> impl Iterator<Item = &FieldDescriptor> {
        let end = offset.saturating_add(width);
        let start = self.fields.partition_point(|f| f.end() <= offset);
        self.fields[start..]
            .iter()
            .take_while(move |f| f.offset < end)
    }

    /// The leaf containing byte `offset`, if it is not padding.
    pub fn field_at(&self, offset: u64) -> Option<&FieldDescriptor> {
        self.fields_in(offset, 1).next()
    }
}

impl fmt::Display for LayoutDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "struct {} {{", self.name)?;
        for (i, field) in self.fields.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, " {field}")?;
        }
        write!(f, " }} ({} bytes, align {})", self.size, self.alignment)
    }
}

enum Member {
    Scalar { name: String, ty: FieldType },
    Array { name: String, ty: FieldType, length: u32 },
    Nested { name: String, layout: LayoutDescriptor },
}

/// Computes C-compatible struct layouts.
pub struct LayoutBuilder {
    name: String,
    members: Vec<Member>,
    packed: bool,
}

impl LayoutBuilder {
    /// Create a builder for the named type.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            members: Vec::new(),
            packed: false,
        }
    }

    /// Lay the struct out without padding (`__attribute__((packed))`).
    pub fn packed(mut self) -> Self {
        self.packed = true;
        self
    }

    /// Append a scalar or pointer field.
    pub fn field(mut self, name: &str, ty: FieldType) -> Self {
        self.members.push(Member::Scalar { name: name.to_string(), ty });
        self
    }

    /// Append a fixed-length array field.
    pub fn array(mut self, name: &str, ty: FieldType, length: u32) -> Self {
        self.members.push(Member::Array { name: name.to_string(), ty, length });
        self
    }

    /// Append an inline struct field.
    pub fn nested(mut self, name: &str, layout: &LayoutDescriptor) -> Self {
        self.members.push(Member::Nested {
            name: name.to_string(),
            layout: layout.clone(),
        });
        self
    }

    /// Compute offsets and produce the descriptor.
    pub fn build(self) -> Result<LayoutDescriptor, LayoutError> {
        let mut fields: Vec<FieldDescriptor> = Vec::new();
        let mut names: Vec<&str> = Vec::new();
        let mut offset: u64 = 0;
        let mut max_align: u64 = 1;
        let max = u64::from(crate::tag::MAX_OFFSET) + 1;

        for member in &self.members {
            let member_name = match member {
                Member::Scalar { name, .. }
                | Member::Array { name, .. }
                | Member::Nested { name, .. } => name.as_str(),
            };
            if names.contains(&member_name) {
                return Err(LayoutError::DuplicateField(member_name.to_string()));
            }
            names.push(member_name);

            match member {
                Member::Scalar { name, ty } => {
                    ty.check(name)?;
                    let align = self.effective_align(u64::from(ty.alignment()));
                    offset = align_up(offset, align);
                    max_align = max_align.max(align);
                    fields.push(FieldDescriptor {
                        name: Arc::from(name.as_str()),
                        index: None,
                        offset,
                        ty: ty.clone(),
                    });
                    offset += u64::from(ty.size());
                }
                Member::Array { name, ty, length } => {
                    ty.check(name)?;
                    if *length == 0 {
                        return Err(LayoutError::ZeroSized(name.clone()));
                    }
                    let align = self.effective_align(u64::from(ty.alignment()));
                    offset = align_up(offset, align);
                    max_align = max_align.max(align);
                    let span = u64::from(*length) * u64::from(ty.size());
                    if offset + span > max {
                        return Err(LayoutError::TooLarge {
                            name: self.name.clone(),
                            size: offset + span,
                            max,
                        });
                    }
                    let shared: Arc<str> = Arc::from(name.as_str());
                    for i in 0..*length {
                        fields.push(FieldDescriptor {
                            name: shared.clone(),
                            index: Some(i),
                            offset,
                            ty: ty.clone(),
                        });
                        offset += u64::from(ty.size());
                    }
                }
                Member::Nested { name, layout } => {
                    if layout.size == 0 {
                        return Err(LayoutError::ZeroSized(name.clone()));
                    }
                    let align = self.effective_align(layout.alignment);
                    offset = align_up(offset, align);
                    max_align = max_align.max(align);
                    for inner in &layout.fields {
                        fields.push(FieldDescriptor {
                            name: Arc::from(format!("{}.{}", name, inner.name)),
                            index: inner.index,
                            offset: offset + inner.offset,
                            ty: inner.ty.clone(),
                        });
                    }
                    offset += layout.size;
                }
            }
        }

        let size = align_up(offset, max_align);
        if size > max {
            return Err(LayoutError::TooLarge { name: self.name, size, max });
        }

        Ok(LayoutDescriptor {
            name: Arc::from(self.name),
            fields,
            size,
            alignment: max_align,
        })
    }

    fn effective_align(&self, natural: u64) -> u64 {
        if self.packed {
            1
        } else {
            natural
        }
    }
}

/// Round `value` up to the next multiple of `align`.
fn align_up(value: u64, align: u64) -> u64 {
    if align == 0 {
        return value;
    }
    value.div_ceil(align) * align
}
