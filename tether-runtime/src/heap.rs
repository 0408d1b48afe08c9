//! # Reference Managed Heap
//!
//! A small in-process object heap implementing [`ManagedRuntime`]. Objects
//! hold named, dynamically typed fields; a layout registry maps type names to
//! their native views. [`ManagedHeap::collect`] simulates a collection cycle
//! that frees every object no handle pins, which lets tests observe the
//! liveness obligation the bridge places on the runtime.
//!
//! Embedders with a real runtime implement [`ManagedRuntime`] themselves;
//! this heap backs the test suite and the benchmarks.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::layout::{FieldDescriptor, FieldType, LayoutDescriptor};
use crate::runtime::{FieldValue, ManagedRuntime, RuntimeError};

/// Stable identity of a heap object. Survives relocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(pub u64);

/// A dynamically typed managed value.
#[derive(Debug, Clone)]
pub enum Value {
    /// Integer of any width.
    Int(i64),
    /// Float of any width.
    Float(f64),
    /// Boolean.
    Bool(bool),
    /// Reference to another object, or null.
    Ref(Option<ObjectRef>),
    /// Fixed-length array.
    Array(Vec<Value>),
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Ref(a), Value::Ref(b)) => match (a, b) {
                (Some(a), Some(b)) => a.id() == b.id(),
                (None, None) => true,
                _ => false,
            },
            (Value::Array(a), Value::Array(b)) => a == b,
            _ => false,
        }
    }
}

struct ManagedObject {
    id: ObjectId,
    type_name: String,
    fields: Mutex<HashMap<String, Value>>,
    pins: AtomicU32,
}

/// Reference to a heap object. Cloning shares the object.
#[derive(Clone)]
pub struct ObjectRef(Arc<ManagedObject>);

impl ObjectRef {
    /// Stable identity.
    pub fn id(&self) -> ObjectId {
        self.0.id
    }

    /// Name of the object's type.
    pub fn type_name(&self) -> &str {
        &self.0.type_name
    }

    /// Managed-side read of a field.
    pub fn get(&self, name: &str) -> Option<Value> {
        self.0.fields.lock().get(name).cloned()
    }

    /// Managed-side write of a field.
    pub fn set(&self, name: &str, value: Value) {
        self.0.fields.lock().insert(name.to_string(), value);
    }

    /// Number of outstanding pins from the bridge.
    pub fn pin_count(&self) -> u32 {
        self.0.pins.load(Ordering::Acquire)
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectRef")
            .field("id", &self.0.id.0)
            .field("type", &self.0.type_name)
            .finish()
    }
}

/// In-process managed heap.
pub struct ManagedHeap {
    objects: RwLock<HashMap<ObjectId, ObjectRef>>,
    layouts: RwLock<HashMap<String, Arc<LayoutDescriptor>>>,
    next_id: AtomicU64,
}

impl ManagedHeap {
    /// Create an empty heap.
    pub fn new() -> Self {
        Self {
            objects: RwLock::new(HashMap::new()),
            layouts: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register the native view of a type.
    pub fn register_layout(&self, layout: LayoutDescriptor) -> Arc<LayoutDescriptor> {
        let layout = Arc::new(layout);
        self.layouts
            .write()
            .insert(layout.name().to_string(), layout.clone());
        layout
    }

    /// Allocate an object with the given fields.
    pub fn alloc<'a>(
        &self,
        type_name: &str,
        fields: impl IntoIterator<Item = (&'a str, Value)>,
    ) -> ObjectRef {
        let id = ObjectId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let fields = fields
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        let obj = ObjectRef(Arc::new(ManagedObject {
            id,
            type_name: type_name.to_string(),
            fields: Mutex::new(fields),
            pins: AtomicU32::new(0),
        }));
        self.objects.write().insert(id, obj.clone());
        obj
    }

    /// Whether the heap still holds the object.
    pub fn contains(&self, id: ObjectId) -> bool {
        self.objects.read().contains_key(&id)
    }

    /// Number of objects on the heap.
    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    /// Check if the heap is empty.
    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }

    /// Free every unpinned object. Returns how many were freed.
    ///
    /// Everything not pinned is treated as unreachable; there is no root
    /// scanning.
    pub fn collect(&self) -> usize {
        let mut objects = self.objects.write();
        let before = objects.len();
        objects.retain(|_, obj| obj.pin_count() > 0);
        before - objects.len()
    }

    fn ensure_live(&self, obj: &ObjectRef) -> Result<(), RuntimeError> {
        if self.contains(obj.id()) {
            Ok(())
        } else {
            Err(RuntimeError::Collected)
        }
    }

    fn lookup<'v>(
        fields: &'v HashMap<String, Value>,
        field: &FieldDescriptor,
    ) -> Result<&'v Value, RuntimeError> {
        let value = fields
            .get(&*field.name)
            .ok_or_else(|| RuntimeError::NoSuchField(field.to_string()))?;
        match (field.index, value) {
            (None, v) => Ok(v),
            (Some(i), Value::Array(items)) => items
                .get(i as usize)
                .ok_or_else(|| RuntimeError::NoSuchField(field.to_string())),
            (Some(_), _) => Err(mismatch(field, "expected an array")),
        }
    }

    fn lookup_mut<'v>(
        fields: &'v mut HashMap<String, Value>,
        field: &FieldDescriptor,
    ) -> Result<&'v mut Value, RuntimeError> {
        let value = fields
            .get_mut(&*field.name)
            .ok_or_else(|| RuntimeError::NoSuchField(field.to_string()))?;
        match (field.index, value) {
            (None, v) => Ok(v),
            (Some(i), Value::Array(items)) => items
                .get_mut(i as usize)
                .ok_or_else(|| RuntimeError::NoSuchField(field.to_string())),
            (Some(_), _) => Err(mismatch(field, "expected an array")),
        }
    }
}

impl Default for ManagedHeap {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ManagedHeap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedHeap")
            .field("objects", &self.objects.read().len())
            .field("layouts", &self.layouts.read().len())
            .finish()
    }
}

fn mismatch(field: &FieldDescriptor, detail: &str) -> RuntimeError {
    RuntimeError::TypeMismatch {
        field: field.to_string(),
        detail: detail.to_string(),
    }
}

fn encode(value: &Value, field: &FieldDescriptor) -> Result<FieldValue<ObjectRef>, RuntimeError> {
    let bytes = match (&field.ty, value) {
        (FieldType::Int { size, .. }, Value::Int(v)) => v.to_le_bytes()[..*size as usize].to_vec(),
        (FieldType::Bool, Value::Bool(b)) => vec![u8::from(*b)],
        (FieldType::Float { size: 4 }, Value::Float(v)) => (*v as f32).to_le_bytes().to_vec(),
        (FieldType::Float { size: 8 }, Value::Float(v)) => v.to_le_bytes().to_vec(),
        (FieldType::Pointer { .. }, Value::Ref(r)) => return Ok(FieldValue::Ref(r.clone())),
        (_, other) => return Err(mismatch(field, &format!("stored value {other:?}"))),
    };
    Ok(FieldValue::Bytes(bytes))
}

fn decode(value: FieldValue<ObjectRef>, field: &FieldDescriptor) -> Result<Value, RuntimeError> {
    match (&field.ty, value) {
        (FieldType::Pointer { .. }, FieldValue::Ref(r)) => Ok(Value::Ref(r)),
        (_, FieldValue::Ref(_)) => Err(mismatch(field, "reference written to scalar")),
        (ty, FieldValue::Bytes(bytes)) => {
            if bytes.len() as u32 != ty.size() {
                return Err(mismatch(field, &format!("{} bytes written", bytes.len())));
            }
            match ty {
                FieldType::Int { size, signed } => {
                    let mut buf = [0u8; 8];
                    buf[..bytes.len()].copy_from_slice(&bytes);
                    let raw = u64::from_le_bytes(buf);
                    let bits = *size * 8;
                    let v = if *signed && bits < 64 {
                        let shift = 64 - bits;
                        ((raw << shift) as i64) >> shift
                    } else {
                        raw as i64
                    };
                    Ok(Value::Int(v))
                }
                FieldType::Float { size: 4 } => {
                    let mut buf = [0u8; 4];
                    buf.copy_from_slice(&bytes);
                    Ok(Value::Float(f64::from(f32::from_le_bytes(buf))))
                }
                FieldType::Float { .. } => {
                    let mut buf = [0u8; 8];
                    buf.copy_from_slice(&bytes);
                    Ok(Value::Float(f64::from_le_bytes(buf)))
                }
                FieldType::Bool => Ok(Value::Bool(bytes[0] != 0)),
                FieldType::Pointer { .. } => Err(mismatch(field, "bytes written to pointer")),
            }
        }
    }
}

impl ManagedRuntime for ManagedHeap {
    type Ref = ObjectRef;
    type Identity = ObjectId;

    fn identity(&self, obj: &ObjectRef) -> ObjectId {
        obj.id()
    }

    fn read_field(
        &self,
        obj: &ObjectRef,
        field: &FieldDescriptor,
    ) -> Result<FieldValue<ObjectRef>, RuntimeError> {
        self.ensure_live(obj)?;
        let fields = obj.0.fields.lock();
        let value = Self::lookup(&fields, field)?;
        encode(value, field)
    }

    fn write_field(
        &self,
        obj: &ObjectRef,
        field: &FieldDescriptor,
        value: FieldValue<ObjectRef>,
    ) -> Result<(), RuntimeError> {
        self.ensure_live(obj)?;
        let decoded = decode(value, field)?;
        let mut fields = obj.0.fields.lock();
        let slot = Self::lookup_mut(&mut fields, field)?;
        *slot = decoded;
        Ok(())
    }

    fn describe_layout(&self, ty: &str) -> Result<Arc<LayoutDescriptor>, RuntimeError> {
        self.layouts
            .read()
            .get(ty)
            .cloned()
            .ok_or_else(|| RuntimeError::UnknownType(ty.to_string()))
    }

    fn pin(&self, obj: &ObjectRef) {
        obj.0.pins.fetch_add(1, Ordering::AcqRel);
    }

    fn unpin(&self, obj: &ObjectRef) {
        obj.0.pins.fetch_sub(1, Ordering::AcqRel);
    }
}
