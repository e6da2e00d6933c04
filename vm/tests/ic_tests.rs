//! Inline-cache behaviour: monomorphic rewrite, polymorphic
//! deoptimisation, and equivalence with the generic dispatch path.

use bytecode::{ChunkBuilder, OpCode};
use object::Value;
use vm::{Config, VM};

/// Builds `list.len()` called in a loop of `n` iterations through one
/// call site. Returns (chunk, site pc).
fn len_loop_chunk(n: i32) -> (bytecode::Chunk, usize) {
    let mut b = ChunkBuilder::new();
    let len_sym = b.method_sym("len");
    let n_const = b.add_const(Value::from_f64(n as f64));

    // r4 = [1, 2, 3]
    b.const_i8_int(1, 5);
    b.const_i8_int(2, 6);
    b.const_i8_int(3, 7);
    b.list(5, 3, 4);

    // for _ in 0..n { r10 = r4.len() }
    b.const_i8(0, 5); // start
    b.const_op(n_const, 6); // end
    b.const_i8(1, 7); // step
    let init = b.for_range_init(5, 6, 7, 8, 9);
    let body = b.here();
    b.copy(4, 14); // receiver into the callee's first incoming slot
    let site = b.here();
    b.call_obj_sym(10, 1, 1, len_sym);
    b.bind(init);
    b.for_range(8, 7, 6, 9, body);
    b.end(10);
    (b.finish_with_retained(18, &[4]), site)
}

#[test]
fn first_call_rewrites_the_site_to_its_ic_form() {
    let (chunk, site) = len_loop_chunk(1);
    let mut vm = VM::new(Config::default());
    assert_eq!(chunk.ops[site], OpCode::CallObjSym as u8);
    let result = vm.run_chunk(chunk).unwrap();
    assert_eq!(result.as_integer(), 3);
    assert_eq!(vm.op_byte_at(site), OpCode::CallObjNativeFuncIC as u8);
    assert_eq!(vm.global_rc(), 0);
}

#[test]
fn monomorphic_site_stays_cached_across_many_calls() {
    let (chunk, site) = len_loop_chunk(1000);
    let mut vm = VM::new(Config::default());
    let result = vm.run_chunk(chunk).unwrap();
    assert_eq!(result.as_integer(), 3);
    assert_eq!(vm.op_byte_at(site), OpCode::CallObjNativeFuncIC as u8);
    assert_eq!(vm.global_rc(), 0);
}

#[test]
fn polymorphic_receivers_deopt_and_stay_correct() {
    // One call site, receiver alternating list/string each iteration:
    // len() yields 3, 5, 3, 5 -> 16.
    let mut b = ChunkBuilder::new();
    let len_sym = b.method_sym("len");
    let s = b.add_string_const("abcde");

    b.const_i8_int(1, 5);
    b.const_i8_int(2, 6);
    b.const_i8_int(3, 7);
    b.list(5, 3, 4); // r4 = list
    b.const_op(s, 5); // r5 = "abcde" (static string)
    b.const_i8_int(0, 11); // acc

    b.const_i8(0, 6);
    b.const_i8(4, 7);
    b.const_i8(1, 8);
    let init = b.for_range_init(6, 7, 8, 9, 10);
    let body = b.here();
    b.copy(4, 18); // receiver for call at start=14
    let site = b.here();
    b.call_obj_sym(14, 1, 1, len_sym);
    b.add_int(11, 14, 11);
    // Swap the receivers for the next iteration.
    b.copy(4, 12);
    b.copy(5, 4);
    b.copy(12, 5);
    b.bind(init);
    b.for_range(9, 8, 7, 10, body);
    b.end(11);
    let chunk = b.finish_with_retained(22, &[4]);

    let mut vm = VM::new(Config::default());
    let result = vm.run_chunk(chunk).unwrap();
    assert_eq!(result.as_integer(), 16);
    // The site ends up cached for whichever receiver ran last.
    let last = vm.op_byte_at(site);
    assert_eq!(last, OpCode::CallObjNativeFuncIC as u8);
    assert_eq!(vm.global_rc(), 0);
}

#[test]
fn script_method_sites_cache_and_deopt() {
    // Two user types sharing a method symbol; one site sees both.
    let mut vm = VM::new(Config::default());
    let ta = vm.register_object_type("Au", 1);
    let tb = vm.register_object_type("Bu", 1);
    vm.register_field(ta, "v", 0);
    vm.register_field(tb, "v", 0);

    let mut b = ChunkBuilder::new();
    let get_sym = b.method_sym("get");
    let v_sym = b.method_sym("v");

    // Method bodies: return self.v (self at local 4).
    let fwd = b.jump();
    let fa = b.here();
    b.field(4, 0, v_sym);
    b.ret1();
    let fb = b.here();
    b.field(4, 0, v_sym);
    b.ret1();
    b.bind(fwd);
    let fa_id = b.add_func(fa as u32, 1, 8, &[], u16::MAX);
    let fb_id = b.add_func(fb as u32, 1, 8, &[], u16::MAX);

    // a = Au{10}; b = Bu{32}
    b.const_i8_int(10, 6);
    b.object_small(ta as u16, 6, 1, 4);
    b.const_i8_int(32, 6);
    b.object_small(tb as u16, 6, 1, 5);

    // r11 = a.get() via the site, then b.get() via the same site…
    // run the pair twice with a two-iteration loop and sum.
    b.const_i8_int(0, 11);
    b.const_i8(0, 6);
    b.const_i8(2, 7);
    b.const_i8(1, 8);
    let init = b.for_range_init(6, 7, 8, 9, 10);
    let body = b.here();
    b.copy(4, 18);
    let site = b.here();
    b.call_obj_sym(14, 1, 1, get_sym);
    b.add_int(11, 14, 11);
    b.copy(4, 12);
    b.copy(5, 4);
    b.copy(12, 5);
    b.bind(init);
    b.for_range(9, 8, 7, 10, body);
    b.end(11);
    let chunk = b.finish_with_retained(24, &[4, 5]);

    // Register the script methods against the chunk's function table.
    vm.register_method(
        ta,
        "get",
        vm::MethodEntry::Script { func_id: fa_id },
    );
    vm.register_method(
        tb,
        "get",
        vm::MethodEntry::Script { func_id: fb_id },
    );

    let result = vm.run_chunk(chunk).unwrap();
    assert_eq!(result.as_integer(), 42);
    assert_eq!(vm.op_byte_at(site), OpCode::CallObjFuncIC as u8);
    assert_eq!(vm.global_rc(), 0);
}

#[test]
fn rebinding_a_static_func_resets_its_call_sites() {
    // inc() first returns 1; after SetStaticFunc it returns 9.
    let mut b = ChunkBuilder::new();
    let sym = b.static_sym("f");

    let fwd = b.jump();
    let f1 = b.here();
    b.const_i8(1, 0);
    b.ret1();
    let f2 = b.here();
    b.const_i8(9, 0);
    b.ret1();
    b.bind(fwd);
    b.add_func(f1 as u32, 0, 8, &[], sym);
    let _ = b.add_func(f2 as u32, 0, 8, &[], u16::MAX);

    let site = b.here();
    b.call_sym(4, 0, 1, sym); // -> 1, site becomes CallFuncIC
    b.copy(4, 10); // stash the first result
    b.lambda(f2 as u16, 0, 8, 11);
    b.set_static_func(sym, 11);
    b.release(11);
    b.none(11);
    b.call_sym(4, 0, 1, sym); // -> 9 through the rebound value
    b.add(10, 4, 4);
    b.end(4);
    let chunk = b.finish(14);

    let mut vm = VM::new(Config::default());
    let result = vm.run_chunk(chunk).unwrap();
    assert_eq!(result.as_f64(), 10.0);
    // The rebind deoptimised the first site back to CallSym.
    assert_eq!(vm.op_byte_at(site), OpCode::CallSym as u8);
    // The rebound static still owns the lambda until teardown.
    assert_eq!(vm.global_rc(), 1);
}

#[test]
fn field_sites_cache_and_deopt() {
    let mut vm = VM::new(Config::default());
    let ta = vm.register_object_type("Pa", 1);
    let tb = vm.register_object_type("Pb", 1);
    vm.register_field(ta, "x", 0);
    vm.register_field(tb, "x", 0);

    let mut b = ChunkBuilder::new();
    let x_sym = b.method_sym("x");
    b.const_i8_int(5, 6);
    b.object_small(ta as u16, 6, 1, 4);
    b.const_i8_int(37, 6);
    b.object_small(tb as u16, 6, 1, 5);
    b.const_i8_int(0, 11); // acc

    // Two iterations through one field site, receiver type changing
    // between them.
    b.const_i8(0, 6);
    b.const_i8(2, 7);
    b.const_i8(1, 8);
    let init = b.for_range_init(6, 7, 8, 9, 10);
    let body = b.here();
    let site = b.here();
    b.field(4, 13, x_sym);
    b.add_int(11, 13, 11);
    b.copy(4, 12);
    b.copy(5, 4);
    b.copy(12, 5);
    b.bind(init);
    b.for_range(9, 8, 7, 10, body);
    b.end(11);
    let chunk = b.finish_with_retained(16, &[4, 5]);

    let result = vm.run_chunk(chunk).unwrap();
    assert_eq!(result.as_integer(), 42);
    // Cached again after the miss, now for the second type.
    assert_eq!(vm.op_byte_at(site), OpCode::FieldIC as u8);
    assert_eq!(vm.global_rc(), 0);
}
