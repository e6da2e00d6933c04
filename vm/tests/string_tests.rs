//! String behaviour through the interpreter: UTF-8 indexing slices,
//! boundary errors, concatenation and method dispatch on every string
//! shape.

use bytecode::ChunkBuilder;
use vm::{Config, VM};

const SAMPLE: &str = "abc🦊xyz🐶";

fn index_chunk(idx: i8) -> bytecode::Chunk {
    let mut b = ChunkBuilder::new();
    let s = b.add_string_const(SAMPLE);
    b.const_op(s, 4);
    b.const_i8_int(idx, 5);
    b.index(4, 5, 6);
    b.end(6);
    b.finish_with_retained(8, &[6])
}

#[test]
fn rune_index_yields_single_rune_slice() {
    let mut vm = VM::new(Config::default());
    let result = vm.run_chunk(index_chunk(3)).unwrap();
    let view = vm.string_view(result).unwrap();
    assert_eq!(view.as_str(), "🦊");
    assert_eq!(view.char_len, 1);
    vm.release(result);
    assert_eq!(vm.global_rc(), 0);
}

#[test]
fn index_into_continuation_bytes_is_invalid_rune() {
    let mut vm = VM::new(Config::default());
    let result = vm.run_chunk(index_chunk(4)).unwrap();
    assert!(result.is_error());
    assert_eq!(vm.error_sym_name(result.payload()), "InvalidRune");
    assert_eq!(vm.global_rc(), 0);
}

#[test]
fn index_past_rune_count_is_out_of_bounds() {
    let mut vm = VM::new(Config::default());
    let result = vm.run_chunk(index_chunk(8)).unwrap();
    assert!(result.is_error());
    assert_eq!(vm.error_sym_name(result.payload()), "OutOfBounds");
    assert_eq!(vm.global_rc(), 0);
}

#[test]
fn ascii_index_boundaries_through_bytecode() {
    let build = |idx: i8| {
        let mut b = ChunkBuilder::new();
        let s = b.add_string_const("abc");
        b.const_op(s, 4);
        b.const_i8_int(idx, 5);
        b.index(4, 5, 6);
        b.end(6);
        b.finish_with_retained(8, &[6])
    };
    let mut vm = VM::new(Config::default());
    let r = vm.run_chunk(build(0)).unwrap();
    assert_eq!(vm.string_view(r).unwrap().as_str(), "a");
    vm.release(r);
    let r = vm.run_chunk(build(2)).unwrap();
    assert_eq!(vm.string_view(r).unwrap().as_str(), "c");
    vm.release(r);
    let r = vm.run_chunk(build(3)).unwrap();
    assert!(r.is_error());
    let r = vm.run_chunk(build(-1)).unwrap();
    assert!(r.is_error());
    assert_eq!(vm.global_rc(), 0);
}

#[test]
fn add_concatenates_strings() {
    let mut b = ChunkBuilder::new();
    let l = b.add_string_const("fox ");
    let r = b.add_string_const("🦊");
    b.const_op(l, 4);
    b.const_op(r, 5);
    b.add(4, 5, 6);
    b.end(6);
    let chunk = b.finish_with_retained(8, &[6]);

    let mut vm = VM::new(Config::default());
    let result = vm.run_chunk(chunk).unwrap();
    assert_eq!(vm.string_view(result).unwrap().as_str(), "fox 🦊");
    vm.release(result);
    assert_eq!(vm.global_rc(), 0);
}

#[test]
fn insert_method_accepts_len_and_rejects_past_len() {
    let build = |at: i8| {
        let mut b = ChunkBuilder::new();
        let sym = b.method_sym("insert");
        let base = b.add_string_const("ab");
        let extra = b.add_string_const("+");
        // recv at start+4, args at start+5 and start+6.
        b.const_op(base, 8);
        b.const_i8_int(at, 9);
        b.const_op(extra, 10);
        b.call_obj_sym(4, 3, 1, sym);
        b.end(4);
        b.finish_with_retained(12, &[4])
    };

    let mut vm = VM::new(Config::default());
    let ok = vm.run_chunk(build(2)).unwrap();
    assert_eq!(vm.string_view(ok).unwrap().as_str(), "ab+");
    vm.release(ok);

    let err = vm.run_chunk(build(3)).unwrap();
    assert!(err.is_error());
    assert_eq!(vm.error_sym_name(err.payload()), "OutOfBounds");
    assert_eq!(vm.global_rc(), 0);
}

#[test]
fn len_method_counts_runes_on_every_shape() {
    // Static UTF-8 string.
    let mut b = ChunkBuilder::new();
    let sym = b.method_sym("len");
    let s = b.add_string_const(SAMPLE);
    b.const_op(s, 8);
    b.call_obj_sym(4, 1, 1, sym);
    b.end(4);
    let chunk = b.finish(12);
    let mut vm = VM::new(Config::default());
    let result = vm.run_chunk(chunk).unwrap();
    assert_eq!(result.as_integer(), 8);

    // Heap string and slice via the embedder API.
    let heap_s = vm.heap.new_string("abcd").unwrap();
    assert_eq!(vm.string_view(heap_s).unwrap().char_len, 4);
    vm.release(heap_s);
    assert_eq!(vm.global_rc(), 0);
}

#[test]
fn slice_of_string_shares_the_parent() {
    let mut b = ChunkBuilder::new();
    let s = b.add_string_const(SAMPLE);
    b.const_op(s, 4);
    b.const_i8_int(3, 5);
    b.const_i8_int(5, 6);
    b.slice(4, 5, 6, 7);
    b.end(7);
    let chunk = b.finish_with_retained(8, &[7]);

    let mut vm = VM::new(Config::default());
    let result = vm.run_chunk(chunk).unwrap();
    let view = vm.string_view(result).unwrap();
    assert_eq!(view.as_str(), "🦊x");
    assert_eq!(view.char_len, 2);
    vm.release(result);
    assert_eq!(vm.global_rc(), 0);
}
