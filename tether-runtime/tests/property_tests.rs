//! Property-based tests for the handle bridge.
//!
//! Uses proptest to generate random inputs and verify invariants hold.

use std::collections::HashMap;
use std::sync::Arc;

use proptest::prelude::*;
use tether_runtime::deref;
use tether_runtime::heap::{ManagedHeap, Value};
use tether_runtime::layout::{FieldType, LayoutDescriptor};
use tether_runtime::table::{EntryKind, HandleTable};
use tether_runtime::tag::{self, generation, Generation, HandleKind, HandleWord, MAX_OFFSET, MAX_SLOTS};
use tether_runtime::{DerefAccess, HandleBridge, HandleError};

/// Strategy for generating slot indices the encoding can carry
fn valid_slot() -> impl Strategy<Value = u32> {
    0..MAX_SLOTS
}

/// Strategy for generating issued generations
fn valid_generation() -> impl Strategy<Value = Generation> {
    generation::FIRST..=generation::MAX_ENCODED
}

/// Strategy for generating handle kinds
fn handle_kind() -> impl Strategy<Value = HandleKind> {
    prop_oneof![Just(HandleKind::Opaque), Just(HandleKind::Deref)]
}

/// Strategy for generating integer leaf types
fn int_type() -> impl Strategy<Value = FieldType> {
    prop_oneof![
        Just(FieldType::u8()),
        Just(FieldType::Int { size: 2, signed: true }),
        Just(FieldType::i32()),
        Just(FieldType::i64()),
    ]
}

/// Strategy for generating scalar leaf types, floats included
fn scalar_type() -> impl Strategy<Value = FieldType> {
    prop_oneof![
        int_type(),
        Just(FieldType::Float { size: 4 }),
        Just(FieldType::f64()),
    ]
}

/// Strategy for generating small C structs, packed or naturally aligned
fn layout_of(leaf: impl Strategy<Value = FieldType>) -> impl Strategy<Value = LayoutDescriptor> {
    (prop::collection::vec(leaf, 1..8), any::<bool>()).prop_map(|(types, packed)| {
        let mut builder = LayoutDescriptor::builder("Gen");
        if packed {
            builder = builder.packed();
        }
        for (i, ty) in types.into_iter().enumerate() {
            builder = builder.field(&format!("f{i}"), ty);
        }
        builder.build().unwrap()
    })
}

/// Strategy for generating an integer-only layout with an in-bounds write
fn int_access() -> impl Strategy<Value = (LayoutDescriptor, u64, Vec<u8>)> {
    layout_of(int_type()).prop_flat_map(|layout| {
        let size = layout.size();
        (Just(layout), 0..size).prop_flat_map(move |(layout, start)| {
            let max = (size - start).min(16) as usize;
            (
                Just(layout),
                Just(start),
                prop::collection::vec(any::<u8>(), 1..=max),
            )
        })
    })
}

/// Operation for the table model test
#[derive(Debug, Clone)]
enum Op {
    Allocate,
    Retain(usize),
    Release(usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => Just(Op::Allocate),
        1 => any::<usize>().prop_map(Op::Retain),
        3 => any::<usize>().prop_map(Op::Release),
    ]
}

proptest! {
    /// Tag roundtrip: every field is preserved
    #[test]
    fn tag_roundtrip(kind in handle_kind(), slot in valid_slot(), gen in valid_generation()) {
        let word = tag::tag(kind, slot, gen);
        let fields = tag::untag(word).unwrap();
        prop_assert_eq!(fields.kind, kind);
        prop_assert_eq!(fields.slot, slot);
        prop_assert_eq!(fields.generation, gen);
        prop_assert_eq!(fields.offset, 0);
    }

    /// Deref offsets survive packing and never disturb the base word
    #[test]
    fn deref_offset_roundtrip(slot in valid_slot(), gen in valid_generation(), offset in 0..=MAX_OFFSET) {
        let word = tag::tag_with_offset(HandleKind::Deref, slot, gen, offset);
        let fields = tag::untag(word).unwrap();
        prop_assert_eq!(fields.offset, offset);
        prop_assert_eq!(word.base(), tag::tag(HandleKind::Deref, slot, gen));
    }

    /// Words without the tag pattern never decode
    #[test]
    fn untagged_words_rejected(raw in any::<u64>()) {
        let word = HandleWord::from_raw(raw);
        prop_assume!(raw >> 61 != 0b101);
        prop_assert!(tag::untag(word).is_none());
    }

    /// Canonical user-space addresses never carry the tag
    #[test]
    fn user_addresses_rejected(addr in 0u64..(1 << 47)) {
        prop_assert!(tag::untag(HandleWord::from_raw(addr)).is_none());
    }

    /// Pointer arithmetic composes and stays within the offset field
    #[test]
    fn offset_arithmetic(start in 0u32..1024, a in -2048i64..2048, b in -2048i64..2048) {
        let word = tag::tag_with_offset(HandleKind::Deref, 3, 1, start);
        match word.offset_by(a) {
            Some(moved) => {
                prop_assert_eq!(i64::from(moved.offset()), i64::from(start) + a);
                prop_assert_eq!(moved.base(), word.base());
                if let Some(twice) = moved.offset_by(b) {
                    prop_assert_eq!(Some(twice), word.offset_by(a + b));
                }
            }
            None => prop_assert!(i64::from(start) + a < 0),
        }
    }

    /// Generations only grow across free/reuse, and every old word stays dead
    #[test]
    fn generation_monotonic(cycles in 1usize..200) {
        let mut table = HandleTable::new();
        let mut previous: Vec<HandleWord> = Vec::new();
        let mut last = generation::UNINITIALIZED;
        for i in 0..cycles {
            let h = table.allocate(i, EntryKind::Opaque).unwrap();
            let gen = tag::untag(h).unwrap().generation;
            prop_assert!(gen > last);
            last = gen;
            table.release(h).unwrap();
            previous.push(h);
        }
        for old in previous {
            prop_assert!(table.resolve(old).is_err());
        }
    }

    /// The table agrees with a simple model under random operations
    #[test]
    fn table_matches_model(ops in prop::collection::vec(op(), 1..200)) {
        let mut table = HandleTable::new();
        let mut live: Vec<(HandleWord, usize)> = Vec::new();
        let mut counts: HashMap<HandleWord, u32> = HashMap::new();
        let mut dead: Vec<HandleWord> = Vec::new();
        let mut next = 0usize;

        for op in ops {
            match op {
                Op::Allocate => {
                    let h = table.allocate(next, EntryKind::Opaque).unwrap();
                    prop_assert!(!counts.contains_key(&h));
                    live.push((h, next));
                    counts.insert(h, 1);
                    next += 1;
                }
                Op::Retain(i) if !live.is_empty() => {
                    let (h, _) = live[i % live.len()];
                    let n = table.retain(h).unwrap();
                    let count = counts.get_mut(&h).unwrap();
                    *count += 1;
                    prop_assert_eq!(n, *count);
                }
                Op::Release(i) if !live.is_empty() => {
                    let idx = i % live.len();
                    let (h, _) = live[idx];
                    table.release(h).unwrap();
                    let count = counts.get_mut(&h).unwrap();
                    *count -= 1;
                    if *count == 0 {
                        counts.remove(&h);
                        live.swap_remove(idx);
                        dead.push(h);
                    }
                }
                _ => {}
            }
        }

        prop_assert_eq!(table.len(), live.len());
        for (h, value) in &live {
            prop_assert_eq!(*table.resolve(*h).unwrap().managed(), *value);
        }
        for h in dead {
            prop_assert!(table.resolve(h).is_err());
        }
    }

    /// Deref accesses succeed exactly when the range is inside the layout
    #[test]
    fn deref_bounds(layout in layout_of(scalar_type()), offset in 0u64..96, width in 1usize..24) {
        let fits = offset + width as u64 <= layout.size();
        match deref::absolute_offset(&layout, 0, offset, width) {
            Ok(absolute) => {
                prop_assert!(fits);
                prop_assert_eq!(absolute, offset);
                let covered: usize = deref::plan(&layout, absolute, width)
                    .iter()
                    .map(|s| s.len())
                    .sum();
                prop_assert_eq!(covered, width);
            }
            Err(HandleError::OutOfBounds { .. }) => prop_assert!(!fits),
            Err(other) => prop_assert!(false, "unexpected error {other}"),
        }
    }

    /// Writing then reading any in-bounds byte range through the bridge
    /// returns the written bytes, except padding which reads as zero
    #[test]
    fn deref_write_read((layout, start, bytes) in int_access()) {
        let heap = Arc::new(ManagedHeap::new());
        let layout = heap.register_layout(layout);
        let fields = layout.fields().iter().map(|f| (f.name.as_ref(), Value::Int(0)));
        let obj = heap.alloc("Gen", fields);
        let bridge = HandleBridge::new(heap.clone());
        let h = bridge.create_deref(&obj, layout.clone()).unwrap();

        bridge.write(h, start, &bytes).unwrap();
        let read = bridge.read(h, start, bytes.len()).unwrap();
        for (i, (&written, &got)) in bytes.iter().zip(&read).enumerate() {
            let at = start + i as u64;
            if layout.field_at(at).is_some() {
                prop_assert_eq!(got, written);
            } else {
                prop_assert_eq!(got, 0);
            }
        }
    }
}
