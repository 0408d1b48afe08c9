//! # Managed Runtime Interface
//!
//! The bridge never looks inside managed objects. Everything it needs from
//! the managed side goes through [`ManagedRuntime`]:
//!
//! - an identity key with runtime-defined equality, used for deduplication
//! - leaf field reads and writes, addressed by [`FieldDescriptor`]
//! - layout lookup for pointee types reached through pointer fields
//! - pin/unpin notifications: while an object is pinned the runtime must not
//!   collect it

use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use thiserror::Error;

use crate::layout::{FieldDescriptor, LayoutDescriptor};

/// Errors reported by a managed runtime implementation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuntimeError {
    /// The object has no field matching the descriptor.
    #[error("no field {0}")]
    NoSuchField(String),
    /// The stored value cannot be represented in the descriptor's type.
    #[error("type mismatch on field {field}: {detail}")]
    TypeMismatch {
        /// Field the access targeted.
        field: String,
        /// What went wrong.
        detail: String,
    },
    /// No layout is registered under this type name.
    #[error("unknown type '{0}'")]
    UnknownType(String),
    /// The reference no longer designates a live object.
    #[error("object is no longer live")]
    Collected,
}

/// Value crossing the field-access interface.
#[derive(Clone, PartialEq, Eq)]
pub enum FieldValue<R> {
    /// Little-endian bytes of a scalar leaf; length equals the leaf size.
    Bytes(Vec<u8>),
    /// Contents of a pointer leaf.
    Ref(Option<R>),
}

impl<R> FieldValue<R> {
    /// The scalar bytes, if this is a scalar.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            FieldValue::Bytes(b) => Some(b),
            FieldValue::Ref(_) => None,
        }
    }
}

impl<R> fmt::Debug for FieldValue<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Bytes(b) => f.debug_tuple("Bytes").field(b).finish(),
            FieldValue::Ref(Some(_)) => f.write_str("Ref(..)"),
            FieldValue::Ref(None) => f.write_str("Ref(null)"),
        }
    }
}

/// The managed runtime as seen by the bridge.
pub trait ManagedRuntime: Send + Sync {
    /// Reference to a managed object.
    type Ref: Clone + Send + Sync;
    /// Identity key: two references are the same object iff their keys are
    /// equal.
    type Identity: Hash + Eq + Clone + Send + Sync + fmt::Debug;

    /// Identity key for `obj`.
    fn identity(&self, obj: &Self::Ref) -> Self::Identity;

    /// Runtime-defined equality.
    fn same_object(&self, a: &Self::Ref, b: &Self::Ref) -> bool {
        self.identity(a) == self.identity(b)
    }

    /// Read one leaf field.
    fn read_field(
        &self,
        obj: &Self::Ref,
        field: &FieldDescriptor,
    ) -> Result<FieldValue<Self::Ref>, RuntimeError>;

    /// Write one leaf field.
    fn write_field(
        &self,
        obj: &Self::Ref,
        field: &FieldDescriptor,
        value: FieldValue<Self::Ref>,
    ) -> Result<(), RuntimeError>;

    /// Native layout of a named type.
    fn describe_layout(&self, ty: &str) -> Result<Arc<LayoutDescriptor>, RuntimeError>;

    /// Called when a table entry starts holding `obj`. Calls nest: an object
    /// with an opaque and a deref handle is pinned twice.
    ///
    /// Invoked with the bridge lock held; implementations must not call back
    /// into the bridge.
    fn pin(&self, _obj: &Self::Ref) {}

    /// Called when the table entry holding `obj` is reclaimed.
    fn unpin(&self, _obj: &Self::Ref) {}
}
