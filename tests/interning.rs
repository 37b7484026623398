//! Property- and scenario-level tests that need a live `Vm` instance
//! (interning identity and GC liveness both require real heap state, not
//! just the pure hashing/arithmetic helpers exercised in `src/`).

mod support;

use support::*;
use uza_vm::{Value, Vm};

/// A minimal valid image: one chunk that immediately halts. Enough to
/// construct a `Vm` for tests that only care about its allocator/interning
/// behavior, not about running a program.
fn minimal_image() -> Vec<u8> {
    let mut main = ChunkBuilder::new(0);
    main.op(EXITVM);
    let mut image = ImageBuilder::new();
    image.push_chunk(main);
    image.build()
}

fn test_vm() -> Vm {
    Vm::from_bytes_with_output(minimal_image(), Box::new(std::io::sink())).expect("minimal image always loads")
}

#[test]
fn interning_returns_the_same_pointer_for_equal_bytes() {
    let mut vm = test_vm();
    let a = vm.intern_string(b"hello world");
    let b = vm.intern_string(b"hello world");
    assert_eq!(a, b, "two interning requests for identical bytes must return the same object");
}

#[test]
fn interning_returns_distinct_pointers_for_different_bytes() {
    let mut vm = test_vm();
    let a = vm.intern_string(b"foo");
    let b = vm.intern_string(b"bar");
    assert_ne!(a, b);
}

proptest::proptest! {
    /// Interning identity (spec §8 property 1): pointer equality tracks
    /// content equality exactly, for an arbitrary small alphabet.
    #[test]
    fn interning_identity_tracks_content_equality(
        s1 in "[a-c]{0,6}",
        s2 in "[a-c]{0,6}",
    ) {
        let mut vm = test_vm();
        let p1 = vm.intern_string(s1.as_bytes());
        let p2 = vm.intern_string(s2.as_bytes());
        proptest::prop_assert_eq!(p1 == p2, s1 == s2);
    }
}

#[test]
fn garbage_collection_frees_unreachable_strings_and_keeps_reachable_ones() {
    let mut vm = test_vm();
    // Root "kept" on the operand stack -- mark_roots scans every occupied
    // stack slot regardless of which frame is active, so this is enough to
    // survive collection without needing a running interpreter loop.
    let kept = vm.intern_string(b"kept");
    vm.push_result(Value::Object(kept)).unwrap();
    for i in 0..10_000 {
        // Each of these becomes unreachable the instant the loop moves on;
        // nothing roots them, so they are sweepable.
        vm.intern_string(format!("garbage-{i}").as_bytes());
    }
    vm.collect_garbage();
    let kept_again = vm.intern_string(b"kept");
    assert_eq!(kept, kept_again, "a string still referenced elsewhere must survive collection");
}
