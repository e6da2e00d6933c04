//! End-to-end interpreter scenarios driven through built chunks.

use bytecode::{ChunkBuilder, OpCode};
use object::Value;
use vm::{Config, PanicKind, VM};

fn new_vm() -> VM {
    VM::new(Config::default())
}

#[test]
fn arithmetic_expression_evaluates_to_float() {
    // 1 + 2 * 3
    let mut b = ChunkBuilder::new();
    b.const_i8(1, 4);
    b.const_i8(2, 5);
    b.const_i8(3, 6);
    b.mul(5, 6, 5);
    b.add(4, 5, 4);
    b.end(4);
    let chunk = b.finish(8);

    let mut vm = new_vm();
    let result = vm.run_chunk(chunk).unwrap();
    assert!(result.is_float());
    assert_eq!(result.as_f64(), 7.0);
    // Pure arithmetic allocates nothing.
    assert_eq!(vm.heap.live_count(), 0);
    assert_eq!(vm.global_rc(), 0);
}

#[test]
fn list_build_and_index() {
    // [1, 2, 3][1]
    let mut b = ChunkBuilder::new();
    b.const_i8_int(1, 4);
    b.const_i8_int(2, 5);
    b.const_i8_int(3, 6);
    b.list(4, 3, 7);
    b.const_i8_int(1, 5);
    b.index(7, 5, 6);
    b.end(6);
    let chunk = b.finish_with_retained(9, &[7]);

    let mut vm = new_vm();
    let result = vm.run_chunk(chunk).unwrap();
    assert!(result.is_integer());
    assert_eq!(result.as_integer(), 2);
    vm.release(result);
    assert_eq!(vm.global_rc(), 0);
}

#[test]
fn integer_ops_wrap_mod_2_pow_48() {
    let mut vm = new_vm();
    // Build (2^47 - 1) + 1 by doubling 1 up 47 times, then adding 1.
    let mut b = ChunkBuilder::new();
    b.const_i8_int(1, 4); // acc = 1
    for _ in 0..47 {
        b.add_int(4, 4, 4); // acc += acc
    }
    // 2^47 is out of range and wraps to -2^47.
    b.end(4);
    let result = vm.run_chunk(b.finish(8)).unwrap();
    assert_eq!(result.as_integer(), -(1i64 << 47));
}

#[test]
fn mixed_int_float_promotes() {
    let mut b = ChunkBuilder::new();
    b.const_i8_int(2, 4);
    b.const_i8(3, 5); // float 3
    b.add(4, 5, 6);
    b.end(6);
    let mut vm = new_vm();
    let result = vm.run_chunk(b.finish(8)).unwrap();
    assert!(result.is_float());
    assert_eq!(result.as_f64(), 5.0);
}

#[test]
fn division_follows_ieee754() {
    let mut b = ChunkBuilder::new();
    b.const_i8(1, 4);
    b.const_i8(0, 5);
    b.div(4, 5, 6);
    b.end(6);
    let mut vm = new_vm();
    let result = vm.run_chunk(b.finish(8)).unwrap();
    assert!(result.is_float());
    assert!(result.as_f64().is_infinite());
}

#[test]
fn mod_follows_host_fmod() {
    let mut b = ChunkBuilder::new();
    b.const_i8(-7, 4);
    b.const_i8(3, 5);
    b.mod_(4, 5, 6);
    b.end(6);
    let mut vm = new_vm();
    let result = vm.run_chunk(b.finish(8)).unwrap();
    // fmod keeps the dividend's sign.
    assert_eq!(result.as_f64(), -1.0);
}

#[test]
fn conditional_jumps() {
    // if false { 1 } else { 2 }
    let mut b = ChunkBuilder::new();
    b.false_(4);
    let j = b.jump_not_cond(4);
    b.const_i8(1, 5);
    let done = b.jump();
    b.bind(j);
    b.const_i8(2, 5);
    b.bind(done);
    b.end(5);
    let mut vm = new_vm();
    let result = vm.run_chunk(b.finish(8)).unwrap();
    assert_eq!(result.as_f64(), 2.0);
}

#[test]
fn match_selects_case_or_else() {
    let build = |scrutinee: i8| {
        let mut b = ChunkBuilder::new();
        let c1 = b.add_const(Value::from_integer(1));
        let c2 = b.add_const(Value::from_integer(2));
        b.const_i8_int(scrutinee, 4);
        let (cases, else_p) = b.match_op(4, &[c1, c2]);
        // case 1 => 10
        b.bind(cases[0]);
        b.const_i8(10, 5);
        let d1 = b.jump();
        // case 2 => 20
        b.bind(cases[1]);
        b.const_i8(20, 5);
        let d2 = b.jump();
        // else => 99
        b.bind(else_p);
        b.const_i8(99, 5);
        b.bind(d1);
        b.bind(d2);
        b.end(5);
        b.finish(8)
    };

    let mut vm = new_vm();
    assert_eq!(vm.run_chunk(build(2)).unwrap().as_f64(), 20.0);
    assert_eq!(vm.run_chunk(build(1)).unwrap().as_f64(), 10.0);
    assert_eq!(vm.run_chunk(build(7)).unwrap().as_f64(), 99.0);
}

#[test]
fn try_value_short_circuits_errors() {
    // r4 = [0][5]  (out of bounds -> error value)
    // r5 = try r4 else skip the overwrite
    let mut b = ChunkBuilder::new();
    b.const_i8_int(0, 4);
    b.list(4, 1, 6);
    b.const_i8_int(5, 5);
    b.index(6, 5, 4);
    let j = b.try_value(4, 5);
    b.const_i8(0, 5); // skipped on error
    b.bind(j);
    b.end(5);
    let chunk = b.finish_with_retained(8, &[6]);

    let mut vm = new_vm();
    let result = vm.run_chunk(chunk).unwrap();
    assert!(result.is_error());
    assert_eq!(vm.error_sym_name(result.payload()), "OutOfBounds");
    assert_eq!(vm.global_rc(), 0);
}

#[test]
fn for_range_init_patches_forward_direction() {
    // for i in 0..5 step 1: count += 1
    let mut b = ChunkBuilder::new();
    b.const_i8_int(0, 9); // count
    b.const_i8_int(1, 10); // one
    b.const_i8(0, 4); // start
    b.const_i8(5, 5); // end
    b.const_i8(1, 6); // step
    let init = b.for_range_init(4, 5, 6, 7, 8);
    let body = b.here();
    b.add_int(9, 10, 9);
    b.bind(init);
    let loop_at = b.here();
    b.for_range(7, 6, 5, 8, body);
    b.end(9);
    let chunk = b.finish(12);

    let mut vm = new_vm();
    let result = vm.run_chunk(chunk).unwrap();
    assert_eq!(result.as_integer(), 5);
    // The loop opcode was specialised in place.
    assert_eq!(vm.op_byte_at(loop_at), OpCode::ForRange as u8);
}

#[test]
fn for_range_init_patches_reverse_direction() {
    // for i in 5..0 step 1 (negative direction measured at run time)
    let mut b = ChunkBuilder::new();
    b.const_i8_int(0, 9);
    b.const_i8_int(1, 10);
    b.const_i8(5, 4); // start
    b.const_i8(0, 5); // end
    b.const_i8(-1, 6); // step, stored as |step|
    let init = b.for_range_init(4, 5, 6, 7, 8);
    let body = b.here();
    b.add_int(9, 10, 9);
    b.bind(init);
    let loop_at = b.here();
    b.for_range(7, 6, 5, 8, body);
    b.end(9);
    let chunk = b.finish(12);

    let mut vm = new_vm();
    let result = vm.run_chunk(chunk).unwrap();
    assert_eq!(result.as_integer(), 5);
    assert_eq!(vm.op_byte_at(loop_at), OpCode::ForRangeReverse as u8);
}

#[test]
fn empty_range_skips_loop_entirely() {
    let mut b = ChunkBuilder::new();
    b.const_i8_int(0, 9);
    b.const_i8_int(1, 10);
    b.const_i8(3, 4);
    b.const_i8(3, 5);
    b.const_i8(1, 6);
    let init = b.for_range_init(4, 5, 6, 7, 8);
    let body = b.here();
    b.add_int(9, 10, 9);
    b.bind(init);
    b.for_range(7, 6, 5, 8, body);
    b.end(9);
    let mut vm = new_vm();
    let result = vm.run_chunk(b.finish(12)).unwrap();
    assert_eq!(result.as_integer(), 0);
}

#[test]
fn static_function_calls() {
    // func inc(n) = n + 1; inc(inc(40)) == 42
    let mut b = ChunkBuilder::new();
    let sym = b.static_sym("inc");
    b.const_i8(40, 8); // arg for first call at start=4: slot 4+4
    b.call_sym(4, 1, 1, sym);
    b.copy(4, 8); // result -> arg of second call
    b.call_sym(4, 1, 1, sym);
    b.end(4);
    // Function body after the main code.
    let fpc = b.here() as u32;
    b.const_i8(1, 5);
    b.add(4, 5, 0);
    b.ret1();
    b.add_func(fpc, 1, 8, &[], sym);
    let chunk = b.finish(16);

    let mut vm = new_vm();
    let result = vm.run_chunk(chunk).unwrap();
    assert_eq!(result.as_f64(), 42.0);
    assert_eq!(vm.global_rc(), 0);
}

#[test]
fn static_vars_hold_retained_values() {
    let mut b = ChunkBuilder::new();
    let sym = b.static_sym("cache");
    let s = b.add_string_const("kept");
    b.const_op(s, 4);
    b.set_static_var(sym, 4);
    b.static_var(sym, 5);
    b.end(5);
    let chunk = b.finish(8);

    let mut vm = new_vm();
    let result = vm.run_chunk(chunk).unwrap();
    assert_eq!(vm.string_view(result).unwrap().as_str(), "kept");
    vm.release(result);
    // The static slot still owns nothing extra: the constant is a
    // static string (a primitive), so the whole program is rc-clean.
    assert_eq!(vm.global_rc(), 0);
}

#[test]
fn lambdas_call_through_values() {
    // f = fn(a) = a * a; f(6) == 36
    let mut b = ChunkBuilder::new();
    let fwd = b.jump();
    let fpc = b.here();
    b.mul(4, 4, 0);
    b.ret1();
    b.bind(fwd);
    b.const_i8(6, 8); // arg at start(4) + 4
    b.lambda(fpc as u16, 1, 8, 9); // callee at start + 4 + nargs
    b.call1(4, 1); // consumes the callee reference
    b.end(4);
    let chunk = b.finish(12);

    let mut vm = new_vm();
    let result = vm.run_chunk(chunk).unwrap();
    assert_eq!(result.as_f64(), 36.0);
    vm.release(result);
    assert_eq!(vm.global_rc(), 0);
}

#[test]
fn boxes_share_state_with_closures() {
    // x = box 7; f = closure capturing x; f() reads the box.
    let mut b = ChunkBuilder::new();
    let fwd = b.jump();
    let fpc = b.here();
    // Body: the capture arrives at local 4 (no args). Read, release the
    // frame's copy, return.
    b.box_value_retain(4, 0);
    b.release(4);
    b.ret1();
    b.bind(fwd);
    b.const_i8(7, 4);
    b.box_(4, 5); // r5 = box(7)
    // The call frame starts past the live locals: callee occupies
    // r6..r14, the closure value sits at start + 4 + 0 = r10 and is
    // consumed by the call.
    b.closure(fpc as u16, 0, 8, &[5], 10);
    b.call1(6, 0);
    b.end(6);
    let chunk = b.finish_with_retained(16, &[5]);

    let mut vm = new_vm();
    let result = vm.run_chunk(chunk).unwrap();
    assert_eq!(result.as_f64(), 7.0);
    assert_eq!(vm.global_rc(), 0);
}

#[test]
fn set_box_value_updates_shared_cell() {
    let mut b = ChunkBuilder::new();
    b.const_i8(1, 4);
    b.box_(4, 5);
    b.const_i8(9, 6);
    b.set_box_value(5, 6);
    b.box_value(5, 7);
    b.end(7);
    let chunk = b.finish_with_retained(8, &[5]);
    let mut vm = new_vm();
    let result = vm.run_chunk(chunk).unwrap();
    assert_eq!(result.as_f64(), 9.0);
    assert_eq!(vm.global_rc(), 0);
}

#[test]
fn nullary_call_fits_exactly_at_stack_end() {
    let mut vm = VM::new(Config { stack_slots: 32 });
    let mut b = ChunkBuilder::new();
    let sym = b.static_sym("leaf");
    b.call_sym(28, 0, 0, sym); // frame [28..32): fits
    b.const_i8(1, 4);
    b.end(4);
    let fpc = b.here() as u32;
    b.ret0();
    b.add_func(fpc, 0, 4, &[], sym);
    let result = vm.run_chunk(b.finish(8)).unwrap();
    assert_eq!(result.as_f64(), 1.0);
}

#[test]
fn call_past_stack_end_raises_stack_overflow() {
    let mut vm = VM::new(Config { stack_slots: 32 });
    let mut b = ChunkBuilder::new();
    let sym = b.static_sym("leaf");
    b.call_sym(29, 0, 0, sym); // frame [29..33): one past the end
    b.const_i8(1, 4);
    b.end(4);
    let fpc = b.here() as u32;
    b.ret0();
    b.add_func(fpc, 0, 4, &[], sym);
    let err = vm.run_chunk(b.finish(8)).unwrap_err();
    assert_eq!(err.kind, PanicKind::StackOverflow);
    assert_eq!(vm.global_rc(), 0);
}

#[test]
fn runaway_recursion_overflows_cleanly() {
    let mut vm = VM::new(Config { stack_slots: 256 });
    let mut b = ChunkBuilder::new();
    let sym = b.static_sym("spin");
    b.call_sym(4, 0, 0, sym);
    b.const_i8(0, 4);
    b.end(4);
    let fpc = b.here() as u32;
    b.call_sym(4, 0, 0, sym); // calls itself forever
    b.ret0();
    b.add_func(fpc, 0, 8, &[], sym);
    let err = vm.run_chunk(b.finish(8)).unwrap_err();
    assert_eq!(err.kind, PanicKind::StackOverflow);
    assert!(vm.last_error_report().unwrap().contains("stack overflow"));
}

#[test]
fn panic_unwind_releases_retained_locals() {
    // Build a list, then index an integer (a type panic); the unwinder
    // must release the list through the retained-locals metadata.
    let mut b = ChunkBuilder::new();
    b.const_i8_int(1, 4);
    b.list(4, 1, 5);
    b.const_i8_int(0, 6);
    b.index(6, 6, 7); // indexing an integer panics
    b.end(7);
    let chunk = b.finish_with_retained(9, &[5]);

    let mut vm = new_vm();
    let err = vm.run_chunk(chunk).unwrap_err();
    assert!(matches!(err.kind, PanicKind::InvalidArgument(_)));
    assert_eq!(vm.global_rc(), 0);
    assert_eq!(vm.heap.live_count(), 0);
}

#[test]
fn string_template_renders_interleaved_parts() {
    let mut b = ChunkBuilder::new();
    let s1 = b.add_string_const("x = ");
    let s2 = b.add_string_const("!");
    b.const_op(s1, 4);
    b.const_i8(7, 5);
    b.const_op(s2, 6);
    b.string_template(4, 1, 7);
    b.end(7);
    let chunk = b.finish_with_retained(8, &[7]);
    let mut vm = new_vm();
    let result = vm.run_chunk(chunk).unwrap();
    assert_eq!(vm.string_view(result).unwrap().as_str(), "x = 7!");
    vm.release(result);
    assert_eq!(vm.global_rc(), 0);
}

#[test]
fn move_and_refcount_ops_balance() {
    // Exercise SetInitN, CopyRetainRelease, ReleaseN and JumpNotNone on
    // heap values; the program must come out rc-clean on its own.
    let mut b = ChunkBuilder::new();
    let s = b.add_string_const("x");
    b.set_init_n(&[4, 5, 6]);
    b.const_op(s, 4);
    b.add(4, 4, 5); // r5 = heap string "xx"
    b.copy_retain_release(5, 6); // r6 owns a second reference
    let j = b.jump_not_none(5);
    b.const_i8(0, 7); // skipped: r5 is a string
    b.bind(j);
    b.release_n(&[5, 6]);
    b.set_init_n(&[5, 6]);
    b.true_(7);
    b.not(7, 7);
    b.end(7);
    let chunk = b.finish(8);

    let mut vm = new_vm();
    let result = vm.run_chunk(chunk).unwrap();
    assert!(result.is_bool() && !result.as_bool());
    assert_eq!(vm.global_rc(), 0);
    assert_eq!(vm.heap.live_count(), 0);
}

#[test]
fn symbols_and_metatypes() {
    let mut b = ChunkBuilder::new();
    b.tag_literal(3, 4);
    b.tag(1, 2, 5);
    b.sym(0, 9, 6);
    b.compare(4, 5, 7);
    b.list(4, 3, 8);
    b.end(8);
    let chunk = b.finish_with_retained(10, &[8]);

    let mut vm = new_vm();
    let result = vm.run_chunk(chunk).unwrap();
    let elems =
        unsafe { result.as_heap_ref::<object::List>().elems.clone() };
    assert!(elems[0].is_symbol());
    assert_eq!(elems[0].payload(), 3);
    // Tag packs group and member.
    assert_eq!(elems[1].payload(), (1 << 8) | 2);
    assert_eq!(vm.type_of(elems[2]), object::TYPE_METATYPE);
    vm.release(result);
    assert_eq!(vm.global_rc(), 0);
}

#[test]
fn ret0_returns_none_to_nret1_callers() {
    let mut b = ChunkBuilder::new();
    let sym = b.static_sym("noop");
    b.call_sym(4, 0, 1, sym);
    b.end(4);
    let fpc = b.here() as u32;
    b.ret0();
    b.add_func(fpc, 0, 4, &[], sym);
    let mut vm = new_vm();
    let result = vm.run_chunk(b.finish(8)).unwrap();
    assert!(result.is_none());
}

#[test]
fn bitwise_ops_on_integers() {
    let mut b = ChunkBuilder::new();
    b.const_i8_int(0b1100, 4);
    b.const_i8_int(0b1010, 5);
    b.bitwise_and(4, 5, 6);
    b.bitwise_or(4, 5, 7);
    b.bitwise_xor(4, 5, 8);
    b.const_i8_int(2, 9);
    b.bitwise_left_shift(4, 9, 10);
    b.list(6, 5, 11);
    b.end(11);
    let chunk = b.finish_with_retained(13, &[11]);
    let mut vm = new_vm();
    let result = vm.run_chunk(chunk).unwrap();
    // SAFETY: known list.
    let elems = unsafe {
        result.as_heap_ref::<object::List>().elems.clone()
    };
    assert_eq!(elems[0].as_integer(), 0b1000);
    assert_eq!(elems[1].as_integer(), 0b1110);
    assert_eq!(elems[2].as_integer(), 0b0110);
    assert_eq!(elems[4].as_integer(), 0b110000);
    vm.release(result);
    assert_eq!(vm.global_rc(), 0);
}
