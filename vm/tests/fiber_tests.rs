//! Cooperative fiber scenarios.

use bytecode::ChunkBuilder;
use vm::{Config, FiberState, VM};

#[test]
fn yield_then_return_then_none() {
    // f = coinit { yield 1; return 2 }
    // resume -> 1, resume -> 2, resume -> none
    let mut b = ChunkBuilder::new();
    let co = b.coinit(0, 0, 2, 4);
    // Fiber body (its own root frame, locals from slot 4).
    b.const_i8(1, 4);
    b.coyield(4);
    b.const_i8(2, 4);
    b.coreturn(4);
    b.bind(co);
    b.coresume(4, 5);
    b.coresume(4, 6);
    b.coresume(4, 7);
    b.list(5, 3, 8);
    b.end(8);
    let chunk = b.finish_with_retained(12, &[4, 8]);

    let mut vm = VM::new(Config::default());
    let result = vm.run_chunk(chunk).unwrap();
    // SAFETY: known list.
    let elems =
        unsafe { result.as_heap_ref::<object::List>().elems.clone() };
    assert_eq!(elems.len(), 3);
    assert_eq!(elems[0].as_f64(), 1.0);
    assert_eq!(elems[1].as_f64(), 2.0);
    assert!(elems[2].is_none());
    vm.release(result);
    assert_eq!(vm.global_rc(), 0);
}

#[test]
fn fiber_states_progress_through_the_protocol() {
    // Resume once, then hand the paused fiber to the embedder.
    let mut b = ChunkBuilder::new();
    let co = b.coinit(0, 0, 2, 4);
    b.const_i8(1, 4);
    b.coyield(4);
    b.const_i8(2, 4);
    b.coreturn(4);
    b.bind(co);
    b.coresume(4, 5);
    b.end(4);
    let chunk = b.finish_with_retained(8, &[4]);

    let mut vm = VM::new(Config::default());
    let fiber = vm.run_chunk(chunk).unwrap();
    assert_eq!(vm.fiber_state(fiber), Some(FiberState::Paused));
    vm.release(fiber);
    assert_eq!(vm.global_rc(), 0);
}

#[test]
fn finished_fiber_reports_done() {
    let mut b = ChunkBuilder::new();
    let co = b.coinit(0, 0, 2, 4);
    b.const_i8(2, 4);
    b.coreturn(4);
    b.bind(co);
    b.coresume(4, 5);
    b.end(4);
    let chunk = b.finish_with_retained(8, &[4]);

    let mut vm = VM::new(Config::default());
    let fiber = vm.run_chunk(chunk).unwrap();
    assert_eq!(vm.fiber_state(fiber), Some(FiberState::Done));
    vm.release(fiber);
    assert_eq!(vm.global_rc(), 0);
}

#[test]
fn unresumed_fiber_stays_init_and_releases_args() {
    // coinit binds one heap argument, then the fiber is dropped without
    // ever running.
    let mut b = ChunkBuilder::new();
    let s = b.add_string_const("bound");
    b.const_op(s, 8);
    // Bound arg is a static string; also bind a fresh list to prove
    // heap args release.
    b.const_i8_int(1, 6);
    b.list(6, 1, 8);
    let co = b.coinit(8, 1, 2, 4);
    b.coreturn(4);
    b.bind(co);
    b.end(4);
    let chunk = b.finish_with_retained(12, &[4, 8]);

    let mut vm = VM::new(Config::default());
    let fiber = vm.run_chunk(chunk).unwrap();
    assert_eq!(vm.fiber_state(fiber), Some(FiberState::Init));
    vm.release(fiber);
    assert_eq!(vm.global_rc(), 0);
}

#[test]
fn dropping_paused_fiber_releases_its_stack() {
    // The fiber builds a map into a local, yields, and never resumes.
    let mut b = ChunkBuilder::new();
    let co = b.coinit(0, 0, 2, 4);
    b.none(4);
    b.map_empty(5);
    b.coyield(4);
    b.coreturn(4);
    b.bind(co);
    b.coresume(4, 5);
    b.end(4);
    let chunk = b.finish_with_retained(8, &[4]);

    let mut vm = VM::new(Config::default());
    let fiber = vm.run_chunk(chunk).unwrap();
    assert_eq!(vm.fiber_state(fiber), Some(FiberState::Paused));
    assert!(vm.heap.live_count() >= 2); // fiber + its parked map
    vm.release(fiber);
    assert_eq!(vm.heap.live_count(), 0);
    assert_eq!(vm.global_rc(), 0);
}

#[test]
fn yield_value_passes_heap_values_with_ownership() {
    // The fiber yields a freshly built list.
    let mut b = ChunkBuilder::new();
    let co = b.coinit(0, 0, 2, 4);
    b.const_i8_int(7, 4);
    b.list(4, 1, 5);
    b.coyield(5);
    b.release(5);
    b.coreturn(4);
    b.bind(co);
    b.coresume(4, 5);
    b.end(5);
    let chunk = b.finish_with_retained(12, &[4, 5]);

    let mut vm = VM::new(Config::default());
    let result = vm.run_chunk(chunk).unwrap();
    // SAFETY: known list.
    let first =
        unsafe { result.as_heap_ref::<object::List>().elems[0] };
    assert_eq!(first.as_integer(), 7);
    vm.release(result);
    assert_eq!(vm.global_rc(), 0);
}
