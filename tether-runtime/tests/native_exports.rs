//! C ABI exports over an installed bridge.
//!
//! The installed bridge is process-wide, so every test takes `SERIAL`.

use std::ffi::c_void;
use std::sync::Arc;

use parking_lot::Mutex;
use tether_runtime::error::codes;
use tether_runtime::exports::{
    tether_deref_load, tether_deref_store, tether_handle_offset, tether_is_handle,
    tether_last_error, tether_release_handle,
};
use tether_runtime::heap::{ManagedHeap, ObjectRef, Value};
use tether_runtime::layout::{FieldType, LayoutDescriptor};
use tether_runtime::{install_bridge, uninstall_bridge, HandleBridge};

static SERIAL: Mutex<()> = parking_lot::const_mutex(());

fn installed() -> (Arc<ManagedHeap>, Arc<HandleBridge<ManagedHeap>>) {
    let heap = Arc::new(ManagedHeap::new());
    heap.register_layout(
        LayoutDescriptor::builder("Point")
            .field("x", FieldType::i32())
            .field("y", FieldType::i32())
            .build()
            .unwrap(),
    );
    let bridge = Arc::new(HandleBridge::new(heap.clone()));
    install_bridge(bridge.clone());
    (heap, bridge)
}

fn point(heap: &ManagedHeap, x: i64, y: i64) -> ObjectRef {
    heap.alloc("Point", [("x", Value::Int(x)), ("y", Value::Int(y))])
}

#[test]
fn no_bridge_installed() {
    let _serial = SERIAL.lock();
    uninstall_bridge();

    assert_eq!(tether_is_handle(0xA000_0000_0000_0000), 0);
    assert_eq!(tether_last_error(), codes::NO_BRIDGE);
    assert_eq!(tether_release_handle(1), codes::NO_BRIDGE);
    assert_eq!(tether_handle_offset(1, 4), 0);
}

#[test]
fn lifecycle_through_exports() {
    let _serial = SERIAL.lock();
    let (heap, bridge) = installed();
    let obj = point(&heap, 1, 2);
    let h = bridge.create(&obj).unwrap().raw();

    assert_eq!(tether_is_handle(h), 1);
    assert_eq!(tether_last_error(), codes::OK);
    assert_eq!(tether_is_handle(0x7fff_0000_1000), 0);

    assert_eq!(tether_release_handle(h), codes::OK);
    assert_eq!(tether_is_handle(h), 0);
    assert_eq!(tether_release_handle(h), codes::DOUBLE_RELEASE);
    assert_eq!(tether_release_handle(0x1000), codes::NOT_A_HANDLE);
    assert_eq!(tether_last_error(), codes::NOT_A_HANDLE);

    uninstall_bridge();
}

#[test]
fn load_and_store_through_exports() {
    let _serial = SERIAL.lock();
    let (heap, bridge) = installed();
    let obj = point(&heap, 7, 9);
    let h = bridge.create_deref_named(&obj, "Point").unwrap().raw();

    let mut out = [0u8; 4];
    let status = unsafe { tether_deref_load(h, out.as_mut_ptr().cast::<c_void>(), out.len()) };
    assert_eq!(status, codes::OK);
    assert_eq!(i32::from_le_bytes(out), 7);

    let y = tether_handle_offset(h, 4);
    assert_ne!(y, 0);
    assert_eq!(tether_is_handle(y), 1);
    let status = unsafe { tether_deref_load(y, out.as_mut_ptr().cast::<c_void>(), out.len()) };
    assert_eq!(status, codes::OK);
    assert_eq!(i32::from_le_bytes(out), 9);

    let value = 100i32.to_le_bytes();
    let status = unsafe { tether_deref_store(h, value.as_ptr().cast::<c_void>(), value.len()) };
    assert_eq!(status, codes::OK);
    assert_eq!(obj.get("x"), Some(Value::Int(100)));

    let mut wide = [0u8; 8];
    let status = unsafe { tether_deref_load(y, wide.as_mut_ptr().cast::<c_void>(), wide.len()) };
    assert_eq!(status, codes::OUT_OF_BOUNDS);

    uninstall_bridge();
}

#[test]
fn export_error_codes() {
    let _serial = SERIAL.lock();
    let (heap, bridge) = installed();
    let opaque = bridge.create(&point(&heap, 1, 2)).unwrap().raw();
    let mut out = [0u8; 4];

    let status = unsafe { tether_deref_load(opaque, out.as_mut_ptr().cast::<c_void>(), 4) };
    assert_eq!(status, codes::WRONG_KIND);

    assert_eq!(tether_handle_offset(opaque, 4), 0);
    assert_eq!(tether_last_error(), codes::WRONG_KIND);

    let status = unsafe { tether_deref_load(opaque, std::ptr::null_mut(), 4) };
    assert_eq!(status, codes::NULL_POINTER);

    let deref = bridge.create_deref_named(&point(&heap, 1, 2), "Point").unwrap().raw();
    let status = unsafe { tether_deref_load(deref, out.as_mut_ptr().cast::<c_void>(), 0) };
    assert_eq!(status, codes::INVALID_WIDTH);

    assert_eq!(tether_handle_offset(deref, -1), 0);
    assert_eq!(tether_last_error(), codes::OUT_OF_BOUNDS);

    uninstall_bridge();
}

#[test]
fn store_and_clipped_pointer_load_through_exports() {
    let _serial = SERIAL.lock();
    let (heap, bridge) = installed();
    heap.register_layout(
        LayoutDescriptor::builder("Node")
            .field("value", FieldType::i64())
            .field("next", FieldType::pointer_to("Node"))
            .build()
            .unwrap(),
    );
    let tail = heap.alloc("Node", [("value", Value::Int(2)), ("next", Value::Ref(None))]);
    let head = heap.alloc(
        "Node",
        [("value", Value::Int(1)), ("next", Value::Ref(Some(tail.clone())))],
    );
    let h = bridge.create_deref_named(&head, "Node").unwrap().raw();

    let status = unsafe { tether_deref_store(h, std::ptr::null(), 8) };
    assert_eq!(status, codes::NULL_POINTER);

    let value = 5i64.to_le_bytes();
    let status = unsafe { tether_deref_store(h, value.as_ptr().cast::<c_void>(), value.len()) };
    assert_eq!(status, codes::OK);
    assert_eq!(head.get("value"), Some(Value::Int(5)));

    let mut clipped = [0u8; 12];
    let status =
        unsafe { tether_deref_load(h, clipped.as_mut_ptr().cast::<c_void>(), clipped.len()) };
    assert_eq!(status, codes::INVALID_WIDTH);
    assert_eq!(tail.pin_count(), 0);

    let mut whole = [0u8; 16];
    let status = unsafe { tether_deref_load(h, whole.as_mut_ptr().cast::<c_void>(), whole.len()) };
    assert_eq!(status, codes::OK);
    let next = u64::from_le_bytes(whole[8..].try_into().unwrap());
    assert_eq!(tether_is_handle(next), 1);
    assert_eq!(tail.pin_count(), 1);
    assert_eq!(tether_release_handle(next), codes::OK);
    assert_eq!(tail.pin_count(), 0);

    uninstall_bridge();
}
