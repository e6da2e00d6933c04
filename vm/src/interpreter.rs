//! The bytecode dispatch loop.
//!
//! A tight `loop { match opcode }` over the owned instruction buffer,
//! with `pc`/`fp` in locals and byte-exact little-endian operand
//! decoding. The buffer is mutable on purpose: inline caches rewrite
//! call and field sites in place, and `ForRangeInit` patches its loop
//! opcode to the measured direction. Every rewrite keeps the
//! instruction width, so pc arithmetic never changes.

use bytecode::{instruction_size, OpCode};
use object::{
    frame, Closure, HostFunc, Lambda, Value, TYPE_BOX, TYPE_CLOSURE,
    TYPE_HOST_FUNC, TYPE_LAMBDA,
};
use tracing::trace;

use crate::error::{PanicKind, RuntimePanic};
use crate::host::{HostFuncFn, HostMethodFn, MethodEntry, StaticFuncEntry};
use crate::{fiber, ops as builtins, stack, VM};

const CALL_SITE_SIZE: usize = 14;
const FIELD_SITE_SIZE: usize = 8;

#[inline(always)]
fn u16_at(ops: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([ops[at], ops[at + 1]])
}

#[inline(always)]
fn i16_at(ops: &[u8], at: usize) -> i16 {
    u16_at(ops, at) as i16
}

#[inline(always)]
fn u48_at(ops: &[u8], at: usize) -> u64 {
    let mut v = 0u64;
    for i in (0..6).rev() {
        v = (v << 8) | ops[at + i] as u64;
    }
    v
}

#[inline(always)]
fn write_u16(ops: &mut [u8], at: usize, v: u16) {
    ops[at..at + 2].copy_from_slice(&v.to_le_bytes());
}

#[inline(always)]
fn write_u48(ops: &mut [u8], at: usize, v: u64) {
    debug_assert!(v < (1 << 48));
    for i in 0..6 {
        ops[at + i] = (v >> (8 * i)) as u8;
    }
}

macro_rules! vm_try {
    ($vm:expr, $pc:expr, $fp:expr, $e:expr) => {
        match $e {
            Ok(v) => v,
            Err(kind) => {
                return Err(stack::unwind_panic($vm, $pc, $fp, kind))
            }
        }
    };
}

macro_rules! vm_panic {
    ($vm:expr, $pc:expr, $fp:expr, $kind:expr) => {
        return Err(stack::unwind_panic($vm, $pc, $fp, $kind))
    };
}

/// Runs the loaded program from the VM's saved pc until `End` (or a
/// root return) hands a result to the embedder.
pub(crate) fn exec(vm: &mut VM) -> Result<Value, RuntimePanic> {
    let mut ops = core::mem::take(&mut vm.ops);
    let result = run(vm, &mut ops);
    vm.ops = ops;
    result
}

fn run(vm: &mut VM, ops: &mut [u8]) -> Result<Value, RuntimePanic> {
    let mut pc = vm.pc;
    let mut fp = vm.fp;

    loop {
        // SAFETY: the buffer came from the builder/loader; every byte
        // at an instruction boundary is a valid opcode.
        let op = unsafe { OpCode::from_u8_unchecked(ops[pc]) };
        if vm.verbose {
            let (text, _) = bytecode::disasm_at(ops, pc);
            trace!(target: "vm::trace", pc, fp, "{text}");
        }

        match op {
            // ── Constants & literals ───────────────────────────────
            OpCode::ConstOp => {
                let idx = u16_at(ops, pc + 1) as usize;
                vm.stack[fp + ops[pc + 3] as usize] = vm.consts[idx];
                pc += 4;
            }
            OpCode::ConstI8 => {
                vm.stack[fp + ops[pc + 2] as usize] =
                    Value::from_f64(ops[pc + 1] as i8 as f64);
                pc += 3;
            }
            OpCode::ConstI8Int => {
                vm.stack[fp + ops[pc + 2] as usize] =
                    Value::from_integer(ops[pc + 1] as i8 as i64);
                pc += 3;
            }
            OpCode::True => {
                vm.stack[fp + ops[pc + 1] as usize] = Value::TRUE;
                pc += 2;
            }
            OpCode::False => {
                vm.stack[fp + ops[pc + 1] as usize] = Value::FALSE;
                pc += 2;
            }
            OpCode::None => {
                vm.stack[fp + ops[pc + 1] as usize] = Value::NONE;
                pc += 2;
            }
            OpCode::Tag => {
                let id = ((ops[pc + 1] as u32) << 8) | ops[pc + 2] as u32;
                vm.stack[fp + ops[pc + 3] as usize] = Value::symbol(id);
                pc += 4;
            }
            OpCode::TagLiteral => {
                vm.stack[fp + ops[pc + 2] as usize] =
                    Value::symbol(ops[pc + 1] as u32);
                pc += 3;
            }

            // ── Moves & refcounts ──────────────────────────────────
            OpCode::Copy => {
                vm.stack[fp + ops[pc + 2] as usize] =
                    vm.stack[fp + ops[pc + 1] as usize];
                pc += 3;
            }
            OpCode::CopyReleaseDst => {
                let dst = fp + ops[pc + 2] as usize;
                let old = vm.stack[dst];
                vm.stack[dst] = vm.stack[fp + ops[pc + 1] as usize];
                vm.heap.release(old);
                pc += 3;
            }
            OpCode::CopyRetainSrc => {
                let v = vm.stack[fp + ops[pc + 1] as usize];
                vm.heap.retain(v);
                vm.stack[fp + ops[pc + 2] as usize] = v;
                pc += 3;
            }
            OpCode::CopyRetainRelease => {
                let v = vm.stack[fp + ops[pc + 1] as usize];
                vm.heap.retain(v);
                let dst = fp + ops[pc + 2] as usize;
                let old = vm.stack[dst];
                vm.stack[dst] = v;
                vm.heap.release(old);
                pc += 3;
            }
            OpCode::Retain => {
                vm.heap.retain(vm.stack[fp + ops[pc + 1] as usize]);
                pc += 2;
            }
            OpCode::Release => {
                let v = vm.stack[fp + ops[pc + 1] as usize];
                vm.heap.release(v);
                pc += 2;
            }
            OpCode::ReleaseN => {
                let n = ops[pc + 1] as usize;
                for i in 0..n {
                    let v = vm.stack[fp + ops[pc + 2 + i] as usize];
                    vm.heap.release(v);
                }
                pc += 2 + n;
            }
            OpCode::SetInitN => {
                let n = ops[pc + 1] as usize;
                for i in 0..n {
                    vm.stack[fp + ops[pc + 2 + i] as usize] = Value::NONE;
                }
                pc += 2 + n;
            }

            // ── Arithmetic ─────────────────────────────────────────
            OpCode::Add => {
                let l = vm.stack[fp + ops[pc + 1] as usize];
                let r = vm.stack[fp + ops[pc + 2] as usize];
                let v = if l.is_float() && r.is_float() {
                    Value::from_f64(l.as_f64() + r.as_f64())
                } else {
                    vm_try!(vm, pc, fp, builtins::add_fallback(vm, l, r))
                };
                vm.stack[fp + ops[pc + 3] as usize] = v;
                pc += 4;
            }
            OpCode::Sub => {
                arith_binop(vm, ops, &mut pc, fp, |a, b| a - b)?;
            }
            OpCode::Mul => {
                arith_binop(vm, ops, &mut pc, fp, |a, b| a * b)?;
            }
            OpCode::Div => {
                arith_binop(vm, ops, &mut pc, fp, |a, b| a / b)?;
            }
            OpCode::Pow => {
                arith_binop(vm, ops, &mut pc, fp, f64::powf)?;
            }
            OpCode::Mod => {
                arith_binop(vm, ops, &mut pc, fp, |a, b| a % b)?;
            }
            OpCode::Neg => {
                let v = vm.stack[fp + ops[pc + 1] as usize];
                let out = if v.is_integer() {
                    Value::from_integer(-v.as_integer())
                } else {
                    Value::from_f64(-vm_try!(
                        vm,
                        pc,
                        fp,
                        builtins::to_f64(vm, v)
                    ))
                };
                vm.stack[fp + ops[pc + 2] as usize] = out;
                pc += 3;
            }
            OpCode::AddInt => {
                let l = vm.stack[fp + ops[pc + 1] as usize].as_integer();
                let r = vm.stack[fp + ops[pc + 2] as usize].as_integer();
                vm.stack[fp + ops[pc + 3] as usize] =
                    Value::from_integer(l.wrapping_add(r));
                pc += 4;
            }
            OpCode::SubInt => {
                let l = vm.stack[fp + ops[pc + 1] as usize].as_integer();
                let r = vm.stack[fp + ops[pc + 2] as usize].as_integer();
                vm.stack[fp + ops[pc + 3] as usize] =
                    Value::from_integer(l.wrapping_sub(r));
                pc += 4;
            }
            OpCode::LessInt => {
                let l = vm.stack[fp + ops[pc + 1] as usize].as_integer();
                let r = vm.stack[fp + ops[pc + 2] as usize].as_integer();
                vm.stack[fp + ops[pc + 3] as usize] = Value::from_bool(l < r);
                pc += 4;
            }

            // ── Comparison & boolean ───────────────────────────────
            OpCode::Compare => {
                let l = vm.stack[fp + ops[pc + 1] as usize];
                let r = vm.stack[fp + ops[pc + 2] as usize];
                vm.stack[fp + ops[pc + 3] as usize] =
                    Value::from_bool(builtins::values_equal(vm, l, r));
                pc += 4;
            }
            OpCode::CompareNot => {
                let l = vm.stack[fp + ops[pc + 1] as usize];
                let r = vm.stack[fp + ops[pc + 2] as usize];
                vm.stack[fp + ops[pc + 3] as usize] =
                    Value::from_bool(!builtins::values_equal(vm, l, r));
                pc += 4;
            }
            OpCode::Less => {
                compare_binop(vm, ops, &mut pc, fp, |a, b| a < b)?;
            }
            OpCode::Greater => {
                compare_binop(vm, ops, &mut pc, fp, |a, b| a > b)?;
            }
            OpCode::LessEqual => {
                compare_binop(vm, ops, &mut pc, fp, |a, b| a <= b)?;
            }
            OpCode::GreaterEqual => {
                compare_binop(vm, ops, &mut pc, fp, |a, b| a >= b)?;
            }
            OpCode::Not => {
                let v = vm.stack[fp + ops[pc + 1] as usize];
                vm.stack[fp + ops[pc + 2] as usize] =
                    Value::from_bool(!v.is_truthy());
                pc += 3;
            }

            // ── Bitwise ────────────────────────────────────────────
            OpCode::BitwiseAnd => {
                bitwise_binop(vm, ops, &mut pc, fp, |a, b| a & b)?;
            }
            OpCode::BitwiseOr => {
                bitwise_binop(vm, ops, &mut pc, fp, |a, b| a | b)?;
            }
            OpCode::BitwiseXor => {
                bitwise_binop(vm, ops, &mut pc, fp, |a, b| a ^ b)?;
            }
            OpCode::BitwiseLeftShift => {
                bitwise_binop(vm, ops, &mut pc, fp, |a, b| {
                    a.wrapping_shl(b as u32 & 63)
                })?;
            }
            OpCode::BitwiseRightShift => {
                bitwise_binop(vm, ops, &mut pc, fp, |a, b| {
                    a.wrapping_shr(b as u32 & 63)
                })?;
            }
            OpCode::BitwiseNot => {
                let v = vm.stack[fp + ops[pc + 1] as usize];
                let n = vm_try!(vm, pc, fp, builtins::to_i48(v));
                vm.stack[fp + ops[pc + 2] as usize] = Value::from_integer(!n);
                pc += 3;
            }

            // ── Control flow ───────────────────────────────────────
            OpCode::Jump => {
                pc = (pc as i64 + i16_at(ops, pc + 1) as i64) as usize;
            }
            OpCode::JumpCond => {
                if vm.stack[fp + ops[pc + 3] as usize].is_truthy() {
                    pc = (pc as i64 + i16_at(ops, pc + 1) as i64) as usize;
                } else {
                    pc += 4;
                }
            }
            OpCode::JumpNotCond => {
                if !vm.stack[fp + ops[pc + 3] as usize].is_truthy() {
                    pc = (pc as i64 + i16_at(ops, pc + 1) as i64) as usize;
                } else {
                    pc += 4;
                }
            }
            OpCode::JumpNotNone => {
                if !vm.stack[fp + ops[pc + 3] as usize].is_none() {
                    pc = (pc as i64 + i16_at(ops, pc + 1) as i64) as usize;
                } else {
                    pc += 4;
                }
            }
            OpCode::Match => {
                let expr = vm.stack[fp + ops[pc + 1] as usize];
                let n = ops[pc + 2] as usize;
                let mut target = pc + u16_at(ops, pc + 3 + 4 * n) as usize;
                for i in 0..n {
                    let cidx = u16_at(ops, pc + 3 + 4 * i) as usize;
                    if builtins::values_equal(vm, expr, vm.consts[cidx]) {
                        target =
                            pc + u16_at(ops, pc + 3 + 4 * i + 2) as usize;
                        break;
                    }
                }
                pc = target;
            }
            OpCode::TryValue => {
                let v = vm.stack[fp + ops[pc + 1] as usize];
                vm.stack[fp + ops[pc + 2] as usize] = v;
                if v.is_error() && !v.is_panic() {
                    pc += u16_at(ops, pc + 3) as usize;
                } else {
                    pc += 5;
                }
            }

            // ── Calls & returns ────────────────────────────────────
            OpCode::Call0 | OpCode::Call1 => {
                let start = ops[pc + 1] as usize;
                let nargs = ops[pc + 2] as usize;
                let nret = (op == OpCode::Call1) as u8;
                let callee =
                    vm.stack[fp + start + frame::FRAME_HEADER_SLOTS + nargs];
                let (npc, nfp) = vm_try!(
                    vm,
                    pc,
                    fp,
                    call_callable(
                        vm,
                        pc,
                        fp,
                        callee,
                        start,
                        nargs,
                        nret,
                        pc + 3,
                        true,
                    )
                );
                pc = npc;
                fp = nfp;
            }
            OpCode::CallSym => {
                let (npc, nfp) =
                    vm_try!(vm, pc, fp, call_sym(vm, ops, pc, fp));
                pc = npc;
                fp = nfp;
            }
            OpCode::CallFuncIC => {
                let start = ops[pc + 1] as usize;
                let nargs = ops[pc + 2] as usize;
                let nret = ops[pc + 3];
                let stack_size = ops[pc + 12];
                let target = u48_at(ops, pc + 6) as usize;
                let func_id = vm
                    .func_by_pc
                    .get(&(target as u32))
                    .copied()
                    .unwrap_or(frame::NO_FUNC);
                let nfp = vm_try!(
                    vm,
                    pc,
                    fp,
                    stack::push_frame(
                        vm,
                        fp,
                        start,
                        nargs,
                        nret,
                        stack_size,
                        func_id,
                        pc + CALL_SITE_SIZE,
                    )
                );
                fp = nfp;
                pc = target;
            }
            OpCode::CallNativeFuncIC => {
                let fnbits = u48_at(ops, pc + 6) as usize;
                // SAFETY: the cache word was written from a live
                // HostFuncFn whose address fits 48 bits.
                let func: HostFuncFn =
                    unsafe { core::mem::transmute(fnbits) };
                vm_try!(
                    vm,
                    pc,
                    fp,
                    call_host_func(vm, ops, pc, fp, func)
                );
                pc += CALL_SITE_SIZE;
            }
            OpCode::CallObjSym => {
                let (npc, nfp) =
                    vm_try!(vm, pc, fp, call_obj_sym(vm, ops, pc, fp));
                pc = npc;
                fp = nfp;
            }
            OpCode::CallObjNativeFuncIC => {
                let start = ops[pc + 1] as usize;
                let recv =
                    vm.stack[fp + start + frame::FRAME_HEADER_SLOTS];
                let tid = vm.type_of(recv);
                if u16_at(ops, pc + 12) == tid as u16 {
                    let fnbits = u48_at(ops, pc + 6) as usize;
                    // SAFETY: the cache word was written from a live
                    // HostMethodFn whose address fits 48 bits.
                    let func: HostMethodFn =
                        unsafe { core::mem::transmute(fnbits) };
                    vm_try!(
                        vm,
                        pc,
                        fp,
                        call_host_method(vm, ops, pc, fp, func)
                    );
                    pc += CALL_SITE_SIZE;
                } else {
                    // Deoptimise: back to the generic dispatch.
                    ops[pc] = OpCode::CallObjSym as u8;
                }
            }
            OpCode::CallObjFuncIC => {
                let start = ops[pc + 1] as usize;
                let nargs = ops[pc + 2] as usize;
                let nret = ops[pc + 3];
                let recv =
                    vm.stack[fp + start + frame::FRAME_HEADER_SLOTS];
                let tid = vm.type_of(recv);
                if u16_at(ops, pc + 12) == tid as u16 {
                    let stack_size = ops[pc + 5];
                    let target = u48_at(ops, pc + 6) as usize;
                    let func_id = vm
                        .func_by_pc
                        .get(&(target as u32))
                        .copied()
                        .unwrap_or(frame::NO_FUNC);
                    let nfp = vm_try!(
                        vm,
                        pc,
                        fp,
                        stack::push_frame(
                            vm,
                            fp,
                            start,
                            nargs,
                            nret,
                            stack_size,
                            func_id,
                            pc + CALL_SITE_SIZE,
                        )
                    );
                    fp = nfp;
                    pc = target;
                } else {
                    ops[pc] = OpCode::CallObjSym as u8;
                }
            }
            OpCode::Ret1 => {
                let meta = vm.stack[fp + 1];
                if frame::frame_num_ret(meta) == 0 {
                    let v = vm.stack[fp];
                    vm.heap.release(v);
                }
                if frame::frame_is_root(meta) {
                    let result = vm.stack[fp];
                    vm.heap.retain(result);
                    vm.pc = pc;
                    vm.fp = fp;
                    return Ok(result);
                }
                let rpc = frame::value_to_pc(vm.stack[fp + 2]);
                let rfp = frame::value_to_fp(vm.stack[fp + 3]);
                pc = rpc;
                fp = rfp;
            }
            OpCode::Ret0 => {
                let meta = vm.stack[fp + 1];
                if frame::frame_num_ret(meta) == 1 {
                    vm.stack[fp] = Value::NONE;
                }
                if frame::frame_is_root(meta) {
                    vm.pc = pc;
                    vm.fp = fp;
                    return Ok(Value::NONE);
                }
                let rpc = frame::value_to_pc(vm.stack[fp + 2]);
                let rfp = frame::value_to_fp(vm.stack[fp + 3]);
                pc = rpc;
                fp = rfp;
            }

            // ── Aggregates ─────────────────────────────────────────
            OpCode::List => {
                let start = fp + ops[pc + 1] as usize;
                let n = ops[pc + 2] as usize;
                let elems = vm.stack[start..start + n].to_vec();
                let list = vm_try!(
                    vm,
                    pc,
                    fp,
                    vm.heap.new_list(elems).ok_or(PanicKind::OutOfMemory)
                );
                vm.stack[fp + ops[pc + 3] as usize] = list;
                pc += 4;
            }
            OpCode::Map => {
                let start = fp + ops[pc + 1] as usize;
                let n = ops[pc + 2] as usize;
                let map = vm_try!(
                    vm,
                    pc,
                    fp,
                    vm.heap.new_map().ok_or(PanicKind::OutOfMemory)
                );
                for i in 0..n {
                    let key =
                        vm.consts[u16_at(ops, pc + 4 + 2 * i) as usize];
                    let val = vm.stack[start + i];
                    // SAFETY: freshly allocated map.
                    let m: &mut object::Map = unsafe { map.as_heap_mut() };
                    let ctx = crate::VmKeyContext { vm };
                    m.inner.insert(&ctx, key, val);
                }
                vm.stack[fp + ops[pc + 3] as usize] = map;
                pc += 4 + 2 * n;
            }
            OpCode::MapEmpty => {
                let map = vm_try!(
                    vm,
                    pc,
                    fp,
                    vm.heap.new_map().ok_or(PanicKind::OutOfMemory)
                );
                vm.stack[fp + ops[pc + 1] as usize] = map;
                pc += 2;
            }
            OpCode::Index => {
                let recv = vm.stack[fp + ops[pc + 1] as usize];
                let idx = vm.stack[fp + ops[pc + 2] as usize];
                let v = vm_try!(
                    vm,
                    pc,
                    fp,
                    builtins::index_value(vm, recv, idx)
                );
                vm.stack[fp + ops[pc + 3] as usize] = v;
                pc += 4;
            }
            OpCode::ReverseIndex => {
                let recv = vm.stack[fp + ops[pc + 1] as usize];
                let idx = vm.stack[fp + ops[pc + 2] as usize];
                let v = vm_try!(
                    vm,
                    pc,
                    fp,
                    builtins::reverse_index_value(vm, recv, idx)
                );
                vm.stack[fp + ops[pc + 3] as usize] = v;
                pc += 4;
            }
            OpCode::SetIndex | OpCode::SetIndexRelease => {
                let recv = vm.stack[fp + ops[pc + 1] as usize];
                let idx = vm.stack[fp + ops[pc + 2] as usize];
                let val = vm.stack[fp + ops[pc + 3] as usize];
                vm_try!(
                    vm,
                    pc,
                    fp,
                    builtins::set_index(
                        vm,
                        recv,
                        idx,
                        val,
                        op == OpCode::SetIndexRelease,
                    )
                );
                pc += 4;
            }
            OpCode::Slice => {
                let recv = vm.stack[fp + ops[pc + 1] as usize];
                let start = vm.stack[fp + ops[pc + 2] as usize];
                let end = vm.stack[fp + ops[pc + 3] as usize];
                let v = vm_try!(
                    vm,
                    pc,
                    fp,
                    builtins::slice_value(vm, recv, start, end)
                );
                vm.stack[fp + ops[pc + 4] as usize] = v;
                pc += 5;
            }
            OpCode::Object | OpCode::ObjectSmall => {
                let tid = u16_at(ops, pc + 1) as object::TypeId;
                let start = fp + ops[pc + 3] as usize;
                let n = ops[pc + 4] as usize;
                if (tid as usize) >= vm.heap.types.len() {
                    vm_panic!(
                        vm,
                        pc,
                        fp,
                        PanicKind::InvalidArgument("unknown object type")
                    );
                }
                let fields = vm.stack[start..start + n].to_vec();
                let obj = vm_try!(
                    vm,
                    pc,
                    fp,
                    vm.heap
                        .new_object(tid, &fields)
                        .ok_or(PanicKind::OutOfMemory)
                );
                vm.stack[fp + ops[pc + 5] as usize] = obj;
                pc += 6;
            }
            OpCode::StringTemplate => {
                let start = fp + ops[pc + 1] as usize;
                let n = ops[pc + 2] as usize;
                let parts = vm.stack[start..start + 2 * n + 1].to_vec();
                let s = vm_try!(
                    vm,
                    pc,
                    fp,
                    builtins::string_template(vm, &parts)
                );
                vm.stack[fp + ops[pc + 3] as usize] = s;
                pc += 4;
            }

            // ── Fields ─────────────────────────────────────────────
            OpCode::Field | OpCode::FieldRetain | OpCode::FieldRelease => {
                let npc =
                    vm_try!(vm, pc, fp, field_slow(vm, ops, pc, fp, op));
                pc = npc;
            }
            OpCode::FieldIC | OpCode::FieldRetainIC => {
                let recv = vm.stack[fp + ops[pc + 1] as usize];
                let hit = recv.is_heap()
                    && u16_at(ops, pc + 4) == vm.type_of(recv) as u16;
                if hit {
                    let idx = ops[pc + 6] as usize;
                    // SAFETY: type guard passed; the cached offset was
                    // validated at rewrite time.
                    let v = unsafe {
                        recv.as_heap_ref::<object::Object>().field(idx)
                    };
                    if op == OpCode::FieldRetainIC {
                        vm.heap.retain(v);
                    }
                    vm.stack[fp + ops[pc + 2] as usize] = v;
                    pc += FIELD_SITE_SIZE;
                } else {
                    ops[pc] = if op == OpCode::FieldIC {
                        OpCode::Field as u8
                    } else {
                        OpCode::FieldRetain as u8
                    };
                }
            }
            OpCode::SetField
            | OpCode::SetFieldRelease => {
                let npc = vm_try!(
                    vm,
                    pc,
                    fp,
                    set_field_slow(vm, ops, pc, fp, op)
                );
                pc = npc;
            }
            OpCode::SetFieldReleaseIC => {
                let recv = vm.stack[fp + ops[pc + 1] as usize];
                let hit = recv.is_heap()
                    && u16_at(ops, pc + 4) == vm.type_of(recv) as u16;
                if hit {
                    let idx = ops[pc + 6] as usize;
                    let val = vm.stack[fp + ops[pc + 3] as usize];
                    vm.heap.retain(val);
                    // SAFETY: type guard passed.
                    let old = unsafe {
                        let o: &mut object::Object = recv.as_heap_mut();
                        let old = o.field(idx);
                        o.set_field(idx, val);
                        old
                    };
                    vm.heap.release(old);
                    pc += FIELD_SITE_SIZE;
                } else {
                    ops[pc] = OpCode::SetFieldRelease as u8;
                }
            }

            // ── Closures & boxes ───────────────────────────────────
            OpCode::Lambda => {
                let func_pc = u16_at(ops, pc + 1) as u32;
                let lambda = vm_try!(
                    vm,
                    pc,
                    fp,
                    vm.heap
                        .new_lambda(func_pc, ops[pc + 3], ops[pc + 4])
                        .ok_or(PanicKind::OutOfMemory)
                );
                vm.stack[fp + ops[pc + 5] as usize] = lambda;
                pc += 6;
            }
            OpCode::Closure => {
                let func_pc = u16_at(ops, pc + 1) as u32;
                let num_params = ops[pc + 3];
                let ncap = ops[pc + 4] as usize;
                let stack_size = ops[pc + 5];
                let mut captured = Vec::with_capacity(ncap);
                for i in 0..ncap {
                    let v = vm.stack[fp + ops[pc + 7 + i] as usize];
                    vm.heap.retain(v);
                    captured.push(v);
                }
                let closure = vm_try!(
                    vm,
                    pc,
                    fp,
                    vm.heap
                        .new_closure(
                            func_pc, num_params, stack_size, &captured
                        )
                        .ok_or(PanicKind::OutOfMemory)
                );
                vm.stack[fp + ops[pc + 6] as usize] = closure;
                pc += 7 + ncap;
            }
            OpCode::Box => {
                let src = fp + ops[pc + 1] as usize;
                let v = vm.stack[src];
                vm.stack[src] = Value::NONE;
                let b = vm_try!(
                    vm,
                    pc,
                    fp,
                    vm.heap.new_box(v).ok_or(PanicKind::OutOfMemory)
                );
                vm.stack[fp + ops[pc + 2] as usize] = b;
                pc += 3;
            }
            OpCode::BoxValue | OpCode::BoxValueRetain => {
                let b = vm.stack[fp + ops[pc + 1] as usize];
                if !b.is_heap() || vm.type_of(b) != TYPE_BOX {
                    vm_panic!(
                        vm,
                        pc,
                        fp,
                        PanicKind::InvalidArgument("expected a box")
                    );
                }
                // SAFETY: type id checked.
                let v = unsafe { b.as_heap_ref::<object::BoxObject>().val };
                if op == OpCode::BoxValueRetain {
                    vm.heap.retain(v);
                }
                vm.stack[fp + ops[pc + 2] as usize] = v;
                pc += 3;
            }
            OpCode::SetBoxValue | OpCode::SetBoxValueRelease => {
                let b = vm.stack[fp + ops[pc + 1] as usize];
                if !b.is_heap() || vm.type_of(b) != TYPE_BOX {
                    vm_panic!(
                        vm,
                        pc,
                        fp,
                        PanicKind::InvalidArgument("expected a box")
                    );
                }
                let v = vm.stack[fp + ops[pc + 2] as usize];
                vm.heap.retain(v);
                // SAFETY: type id checked.
                let old = unsafe {
                    let cell: &mut object::BoxObject = b.as_heap_mut();
                    core::mem::replace(&mut cell.val, v)
                };
                if op == OpCode::SetBoxValueRelease {
                    vm.heap.release(old);
                }
                pc += 3;
            }

            // ── Iteration ──────────────────────────────────────────
            OpCode::ForRangeInit => {
                let start = vm_try!(
                    vm,
                    pc,
                    fp,
                    builtins::to_f64(
                        vm,
                        vm.stack[fp + ops[pc + 1] as usize]
                    )
                );
                let end = vm_try!(
                    vm,
                    pc,
                    fp,
                    builtins::to_f64(
                        vm,
                        vm.stack[fp + ops[pc + 2] as usize]
                    )
                );
                let step = vm_try!(
                    vm,
                    pc,
                    fp,
                    builtins::to_f64(
                        vm,
                        vm.stack[fp + ops[pc + 3] as usize]
                    )
                )
                .abs();
                vm.stack[fp + ops[pc + 2] as usize] = Value::from_f64(end);
                vm.stack[fp + ops[pc + 3] as usize] = Value::from_f64(step);
                let offset = u16_at(ops, pc + 6) as usize;
                if start == end {
                    pc += offset + 7;
                } else {
                    vm.stack[fp + ops[pc + 4] as usize] =
                        Value::from_f64(start);
                    vm.stack[fp + ops[pc + 5] as usize] =
                        Value::from_f64(start);
                    // Specialise the loop opcode to the direction.
                    ops[pc + offset] = if start < end {
                        OpCode::ForRange as u8
                    } else {
                        OpCode::ForRangeReverse as u8
                    };
                    pc += 8;
                }
            }
            OpCode::ForRange => {
                let counter = vm.stack[fp + ops[pc + 1] as usize].as_f64()
                    + vm.stack[fp + ops[pc + 2] as usize].as_f64();
                if counter < vm.stack[fp + ops[pc + 3] as usize].as_f64() {
                    vm.stack[fp + ops[pc + 1] as usize] =
                        Value::from_f64(counter);
                    vm.stack[fp + ops[pc + 4] as usize] =
                        Value::from_f64(counter);
                    pc -= u16_at(ops, pc + 5) as usize;
                } else {
                    pc += 7;
                }
            }
            OpCode::ForRangeReverse => {
                let counter = vm.stack[fp + ops[pc + 1] as usize].as_f64()
                    - vm.stack[fp + ops[pc + 2] as usize].as_f64();
                if counter > vm.stack[fp + ops[pc + 3] as usize].as_f64() {
                    vm.stack[fp + ops[pc + 1] as usize] =
                        Value::from_f64(counter);
                    vm.stack[fp + ops[pc + 4] as usize] =
                        Value::from_f64(counter);
                    pc -= u16_at(ops, pc + 5) as usize;
                } else {
                    pc += 7;
                }
            }

            // ── Fibers ─────────────────────────────────────────────
            OpCode::Coinit => {
                pc = vm_try!(vm, pc, fp, fiber::coinit(vm, ops, pc, fp));
            }
            OpCode::Coresume => {
                let (npc, nfp) =
                    vm_try!(vm, pc, fp, fiber::coresume(vm, ops, pc, fp));
                pc = npc;
                fp = nfp;
            }
            OpCode::Coyield => {
                let (npc, nfp) =
                    vm_try!(vm, pc, fp, fiber::coyield(vm, ops, pc, fp));
                pc = npc;
                fp = nfp;
            }
            OpCode::Coreturn => {
                let (npc, nfp) =
                    vm_try!(vm, pc, fp, fiber::coreturn(vm, ops, pc, fp));
                pc = npc;
                fp = nfp;
            }

            // ── Statics ────────────────────────────────────────────
            OpCode::StaticVar => {
                let sym = u16_at(ops, pc + 1) as usize;
                let v = vm.static_vars[sym];
                vm.heap.retain(v);
                vm.stack[fp + ops[pc + 3] as usize] = v;
                pc += 4;
            }
            OpCode::SetStaticVar => {
                let sym = u16_at(ops, pc + 1) as usize;
                let v = vm.stack[fp + ops[pc + 3] as usize];
                vm.heap.retain(v);
                let old = core::mem::replace(&mut vm.static_vars[sym], v);
                vm.heap.release(old);
                pc += 4;
            }
            OpCode::StaticFunc => {
                let sym = u16_at(ops, pc + 1) as usize;
                let v = vm_try!(vm, pc, fp, static_func_value(vm, sym));
                vm.stack[fp + ops[pc + 3] as usize] = v;
                pc += 4;
            }
            OpCode::SetStaticFunc => {
                let sym = u16_at(ops, pc + 1);
                let v = vm.stack[fp + ops[pc + 3] as usize];
                let tid = vm.type_of(v);
                if !matches!(tid, TYPE_LAMBDA | TYPE_CLOSURE | TYPE_HOST_FUNC)
                {
                    vm_panic!(
                        vm,
                        pc,
                        fp,
                        PanicKind::InvalidArgument("value is not callable")
                    );
                }
                vm.heap.retain(v);
                if let Some(StaticFuncEntry::Bound(old)) =
                    vm.static_funcs[sym as usize]
                {
                    vm.heap.release(old);
                }
                vm.static_funcs[sym as usize] =
                    Some(StaticFuncEntry::Bound(v));
                // Rebinding invalidates every cached call site for this
                // symbol.
                reset_call_sym_ics(ops, sym);
                pc += 4;
            }
            OpCode::Sym => {
                let m = vm_try!(
                    vm,
                    pc,
                    fp,
                    vm.heap
                        .new_metatype(ops[pc + 1] as u32, ops[pc + 2] as u32)
                        .ok_or(PanicKind::OutOfMemory)
                );
                vm.stack[fp + ops[pc + 3] as usize] = m;
                pc += 4;
            }

            // ── End ────────────────────────────────────────────────
            OpCode::End => {
                let result = vm.stack[fp + ops[pc + 1] as usize];
                vm.heap.retain(result);
                vm.pc = pc;
                vm.fp = fp;
                return Ok(result);
            }
        }
    }
}

// ── Arithmetic helpers ─────────────────────────────────────────────

#[inline(always)]
fn arith_binop(
    vm: &mut VM,
    ops: &[u8],
    pc: &mut usize,
    fp: usize,
    f: impl Fn(f64, f64) -> f64,
) -> Result<(), RuntimePanic> {
    let at = *pc;
    let l = vm.stack[fp + ops[at + 1] as usize];
    let r = vm.stack[fp + ops[at + 2] as usize];
    let v = if l.is_float() && r.is_float() {
        Value::from_f64(f(l.as_f64(), r.as_f64()))
    } else {
        let x = builtins::to_f64(vm, l)
            .and_then(|x| builtins::to_f64(vm, r).map(|y| (x, y)));
        match x {
            Ok((x, y)) => Value::from_f64(f(x, y)),
            Err(kind) => {
                return Err(stack::unwind_panic(vm, at, fp, kind))
            }
        }
    };
    vm.stack[fp + ops[at + 3] as usize] = v;
    *pc = at + 4;
    Ok(())
}

#[inline(always)]
fn compare_binop(
    vm: &mut VM,
    ops: &[u8],
    pc: &mut usize,
    fp: usize,
    f: impl Fn(f64, f64) -> bool,
) -> Result<(), RuntimePanic> {
    let at = *pc;
    let l = vm.stack[fp + ops[at + 1] as usize];
    let r = vm.stack[fp + ops[at + 2] as usize];
    let x = builtins::to_f64(vm, l)
        .and_then(|x| builtins::to_f64(vm, r).map(|y| (x, y)));
    let (x, y) = match x {
        Ok(p) => p,
        Err(kind) => return Err(stack::unwind_panic(vm, at, fp, kind)),
    };
    vm.stack[fp + ops[at + 3] as usize] = Value::from_bool(f(x, y));
    *pc = at + 4;
    Ok(())
}

#[inline(always)]
fn bitwise_binop(
    vm: &mut VM,
    ops: &[u8],
    pc: &mut usize,
    fp: usize,
    f: impl Fn(i64, i64) -> i64,
) -> Result<(), RuntimePanic> {
    let at = *pc;
    let l = vm.stack[fp + ops[at + 1] as usize];
    let r = vm.stack[fp + ops[at + 2] as usize];
    let x = builtins::to_i48(l).and_then(|x| builtins::to_i48(r).map(|y| (x, y)));
    let (x, y) = match x {
        Ok(p) => p,
        Err(kind) => return Err(stack::unwind_panic(vm, at, fp, kind)),
    };
    vm.stack[fp + ops[at + 3] as usize] = Value::from_integer(f(x, y));
    *pc = at + 4;
    Ok(())
}

// ── Call helpers ───────────────────────────────────────────────────

/// Dispatches a call on a first-class callable (lambda, closure or host
/// function object). With `consume`, the callee reference is taken over
/// by the call itself — `Call0`/`Call1` sites place the callee in a
/// slot the new frame overwrites, so the reference cannot outlive the
/// setup. Captures are copied (retained) before the callee goes away.
fn call_callable(
    vm: &mut VM,
    pc: usize,
    fp: usize,
    callee: Value,
    start: usize,
    nargs: usize,
    nret: u8,
    ret_pc: usize,
    consume: bool,
) -> Result<(usize, usize), PanicKind> {
    if !callee.is_heap() {
        return Err(PanicKind::InvalidArgument("value is not callable"));
    }
    match vm.type_of(callee) {
        TYPE_LAMBDA => {
            // SAFETY: type id checked.
            let (func_pc, num_params, stack_size) = unsafe {
                let l: &Lambda = callee.as_heap_ref();
                (l.func_pc, l.num_params, l.stack_size)
            };
            if num_params as usize != nargs {
                return Err(PanicKind::InvalidArgument(
                    "wrong argument count",
                ));
            }
            let func_id = vm
                .func_by_pc
                .get(&func_pc)
                .copied()
                .unwrap_or(frame::NO_FUNC);
            let nfp = stack::push_frame(
                vm, fp, start, nargs, nret, stack_size, func_id, ret_pc,
            )?;
            if consume {
                vm.heap.release(callee);
            }
            Ok((func_pc as usize, nfp))
        }
        TYPE_CLOSURE => {
            // SAFETY: type id checked.
            let (func_pc, num_params, stack_size, ncap) = unsafe {
                let c: &Closure = callee.as_heap_ref();
                (c.func_pc, c.num_params, c.stack_size, c.num_captured)
            };
            if num_params as usize != nargs {
                return Err(PanicKind::InvalidArgument(
                    "wrong argument count",
                ));
            }
            let func_id = vm
                .func_by_pc
                .get(&func_pc)
                .copied()
                .unwrap_or(frame::NO_FUNC);
            let nfp = stack::push_frame(
                vm, fp, start, nargs, nret, stack_size, func_id, ret_pc,
            )?;
            // Captured boxes land after the args, retained for the
            // callee frame.
            for i in 0..ncap as usize {
                // SAFETY: type id checked above; the closure stays live
                // until the release below.
                let cap =
                    unsafe { callee.as_heap_ref::<Closure>().captured_at(i) };
                vm.heap.retain(cap);
                vm.stack[nfp + frame::FRAME_HEADER_SLOTS + nargs + i] = cap;
            }
            if consume {
                vm.heap.release(callee);
            }
            Ok((func_pc as usize, nfp))
        }
        TYPE_HOST_FUNC => {
            // SAFETY: type id checked.
            let (bits, num_params) = unsafe {
                let h: &HostFunc = callee.as_heap_ref();
                (h.func, h.num_params)
            };
            if num_params as usize != nargs {
                return Err(PanicKind::InvalidArgument(
                    "wrong argument count",
                ));
            }
            vm.pc = pc;
            vm.fp = fp;
            let base = fp + start + frame::FRAME_HEADER_SLOTS;
            let args = vm.stack[base..base + nargs].to_vec();
            if consume {
                vm.heap.release(callee);
            }
            // SAFETY: the bits came from a live HostFuncFn.
            let func: HostFuncFn = unsafe { core::mem::transmute(bits) };
            let res = func(vm, &args);
            if res.is_panic() {
                return Err(PanicKind::NativePanic);
            }
            if nret == 1 {
                vm.stack[fp + start] = res;
            } else {
                vm.heap.release(res);
            }
            Ok((ret_pc, fp))
        }
        _ => Err(PanicKind::InvalidArgument("value is not callable")),
    }
}

/// `CallSym` slow path: resolve the static symbol, rewrite the site to
/// its IC form and take the call.
fn call_sym(
    vm: &mut VM,
    ops: &mut [u8],
    pc: usize,
    fp: usize,
) -> Result<(usize, usize), PanicKind> {
    let start = ops[pc + 1] as usize;
    let nargs = ops[pc + 2] as usize;
    let nret = ops[pc + 3];
    let sym = u16_at(ops, pc + 4) as usize;
    let entry = vm
        .static_funcs
        .get(sym)
        .copied()
        .flatten()
        .ok_or_else(|| {
            PanicKind::UndefinedSymbol(
                vm.static_syms
                    .get(sym)
                    .cloned()
                    .unwrap_or_else(|| format!("static#{sym}")),
            )
        })?;
    match entry {
        StaticFuncEntry::Script { func_id } => {
            let f = &vm.funcs[func_id as usize];
            if f.num_params as usize != nargs {
                return Err(PanicKind::InvalidArgument(
                    "wrong argument count",
                ));
            }
            let (target, stack_size) = (f.pc, f.stack_size);
            ops[pc] = OpCode::CallFuncIC as u8;
            write_u48(ops, pc + 6, target as u64);
            ops[pc + 12] = stack_size;
            let nfp = stack::push_frame(
                vm,
                fp,
                start,
                nargs,
                nret,
                stack_size,
                func_id,
                pc + CALL_SITE_SIZE,
            )?;
            Ok((target as usize, nfp))
        }
        StaticFuncEntry::Host { func, num_params } => {
            if num_params as usize != nargs {
                return Err(PanicKind::InvalidArgument(
                    "wrong argument count",
                ));
            }
            ops[pc] = OpCode::CallNativeFuncIC as u8;
            write_u48(ops, pc + 6, func as usize as u64);
            call_host_func(vm, ops, pc, fp, func)?;
            Ok((pc + CALL_SITE_SIZE, fp))
        }
        StaticFuncEntry::Bound(v) => {
            // Rebound symbols stay on the generic path; the binding
            // keeps its reference.
            call_callable(
                vm,
                pc,
                fp,
                v,
                start,
                nargs,
                nret,
                pc + CALL_SITE_SIZE,
                false,
            )
        }
    }
}

fn call_host_func(
    vm: &mut VM,
    ops: &[u8],
    pc: usize,
    fp: usize,
    func: HostFuncFn,
) -> Result<(), PanicKind> {
    let start = ops[pc + 1] as usize;
    let nargs = ops[pc + 2] as usize;
    let nret = ops[pc + 3];
    vm.pc = pc;
    vm.fp = fp;
    let base = fp + start + frame::FRAME_HEADER_SLOTS;
    let args = vm.stack[base..base + nargs].to_vec();
    let res = func(vm, &args);
    if res.is_panic() {
        return Err(PanicKind::NativePanic);
    }
    if nret == 1 {
        vm.stack[fp + start] = res;
    } else {
        vm.heap.release(res);
    }
    Ok(())
}

fn call_host_method(
    vm: &mut VM,
    ops: &[u8],
    pc: usize,
    fp: usize,
    func: HostMethodFn,
) -> Result<(), PanicKind> {
    let start = ops[pc + 1] as usize;
    let nargs = ops[pc + 2] as usize;
    let nret = ops[pc + 3];
    vm.pc = pc;
    vm.fp = fp;
    let base = fp + start + frame::FRAME_HEADER_SLOTS;
    let recv = vm.stack[base];
    let args = vm.stack[base + 1..base + nargs].to_vec();
    let res = func(vm, recv, &args);
    if res.is_panic() {
        return Err(PanicKind::NativePanic);
    }
    if nret == 1 {
        vm.stack[fp + start] = res;
    } else {
        vm.heap.release(res);
    }
    Ok(())
}

/// `CallObjSym` slow path: resolve the method on the receiver's type,
/// cache type id and target in the site, and take the call.
fn call_obj_sym(
    vm: &mut VM,
    ops: &mut [u8],
    pc: usize,
    fp: usize,
) -> Result<(usize, usize), PanicKind> {
    let start = ops[pc + 1] as usize;
    let nargs = ops[pc + 2] as usize;
    let nret = ops[pc + 3];
    let sym = ops[pc + 4] as usize;
    let recv = vm.stack[fp + start + frame::FRAME_HEADER_SLOTS];
    let tid = vm.type_of(recv);
    let name = vm
        .method_names
        .get(sym)
        .cloned()
        .ok_or(PanicKind::InvalidArgument("unknown method symbol"))?;
    let entry = vm
        .methods
        .get(tid, &name)
        .ok_or(PanicKind::UndefinedSymbol(name))?;
    match entry {
        MethodEntry::Host { func, num_params } => {
            // The receiver occupies the first incoming slot.
            if num_params as usize + 1 != nargs {
                return Err(PanicKind::InvalidArgument(
                    "wrong argument count",
                ));
            }
            ops[pc] = OpCode::CallObjNativeFuncIC as u8;
            write_u48(ops, pc + 6, func as usize as u64);
            write_u16(ops, pc + 12, tid as u16);
            call_host_method(vm, ops, pc, fp, func)?;
            Ok((pc + CALL_SITE_SIZE, fp))
        }
        MethodEntry::Script { func_id } => {
            let f = &vm.funcs[func_id as usize];
            if f.num_params as usize != nargs {
                return Err(PanicKind::InvalidArgument(
                    "wrong argument count",
                ));
            }
            let (target, stack_size) = (f.pc, f.stack_size);
            ops[pc] = OpCode::CallObjFuncIC as u8;
            ops[pc + 5] = stack_size;
            write_u48(ops, pc + 6, target as u64);
            write_u16(ops, pc + 12, tid as u16);
            let nfp = stack::push_frame(
                vm,
                fp,
                start,
                nargs,
                nret,
                stack_size,
                func_id,
                pc + CALL_SITE_SIZE,
            )?;
            Ok((target as usize, nfp))
        }
    }
}

// ── Field helpers ──────────────────────────────────────────────────

fn resolve_field(
    vm: &VM,
    recv: Value,
    sym: usize,
) -> Result<(object::TypeId, u8), PanicKind> {
    if !recv.is_heap() {
        return Err(PanicKind::InvalidArgument(
            "value does not have fields",
        ));
    }
    let tid = vm.type_of(recv);
    let name = vm
        .method_names
        .get(sym)
        .ok_or(PanicKind::InvalidArgument("unknown field symbol"))?;
    let idx = vm
        .fields
        .get(tid, name)
        .ok_or_else(|| PanicKind::UndefinedSymbol(name.clone()))?;
    Ok((tid, idx))
}

fn field_slow(
    vm: &mut VM,
    ops: &mut [u8],
    pc: usize,
    fp: usize,
    op: OpCode,
) -> Result<usize, PanicKind> {
    let recv = vm.stack[fp + ops[pc + 1] as usize];
    let sym = ops[pc + 3] as usize;
    let (tid, idx) = resolve_field(vm, recv, sym)?;
    // SAFETY: resolve_field verified the receiver is an object of a
    // registered type with `idx` in range.
    let v = unsafe { recv.as_heap_ref::<object::Object>().field(idx as usize) };
    match op {
        OpCode::Field => {
            write_u16(ops, pc + 4, tid as u16);
            ops[pc + 6] = idx;
            ops[pc] = OpCode::FieldIC as u8;
        }
        OpCode::FieldRetain => {
            write_u16(ops, pc + 4, tid as u16);
            ops[pc + 6] = idx;
            ops[pc] = OpCode::FieldRetainIC as u8;
            vm.heap.retain(v);
        }
        OpCode::FieldRelease => {
            vm.heap.retain(v);
            vm.heap.release(recv);
        }
        _ => unreachable!(),
    }
    vm.stack[fp + ops[pc + 2] as usize] = v;
    Ok(pc + FIELD_SITE_SIZE)
}

fn set_field_slow(
    vm: &mut VM,
    ops: &mut [u8],
    pc: usize,
    fp: usize,
    op: OpCode,
) -> Result<usize, PanicKind> {
    let recv = vm.stack[fp + ops[pc + 1] as usize];
    let sym = ops[pc + 2] as usize;
    let (tid, idx) = resolve_field(vm, recv, sym)?;
    let val = vm.stack[fp + ops[pc + 3] as usize];
    vm.heap.retain(val);
    // SAFETY: resolve_field verified receiver and index.
    let old = unsafe {
        let o: &mut object::Object = recv.as_heap_mut();
        let old = o.field(idx as usize);
        o.set_field(idx as usize, val);
        old
    };
    if op == OpCode::SetFieldRelease {
        vm.heap.release(old);
        write_u16(ops, pc + 4, tid as u16);
        ops[pc + 6] = idx;
        ops[pc] = OpCode::SetFieldReleaseIC as u8;
    }
    Ok(pc + FIELD_SITE_SIZE)
}

fn static_func_value(vm: &mut VM, sym: usize) -> Result<Value, PanicKind> {
    let entry = vm
        .static_funcs
        .get(sym)
        .copied()
        .flatten()
        .ok_or_else(|| {
            PanicKind::UndefinedSymbol(
                vm.static_syms
                    .get(sym)
                    .cloned()
                    .unwrap_or_else(|| format!("static#{sym}")),
            )
        })?;
    match entry {
        StaticFuncEntry::Script { func_id } => {
            let f = &vm.funcs[func_id as usize];
            let (pc, np, ss) = (f.pc, f.num_params, f.stack_size);
            vm.heap
                .new_lambda(pc, np, ss)
                .ok_or(PanicKind::OutOfMemory)
        }
        StaticFuncEntry::Host { func, num_params } => vm
            .heap
            .new_host_func(func as usize, num_params as u32)
            .ok_or(PanicKind::OutOfMemory),
        StaticFuncEntry::Bound(v) => {
            vm.heap.retain(v);
            Ok(v)
        }
    }
}

/// Deoptimises every `CallFuncIC`/`CallNativeFuncIC` site bound to
/// `sym` back to `CallSym` after a rebind.
fn reset_call_sym_ics(ops: &mut [u8], sym: u16) {
    let mut pc = 0;
    while pc < ops.len() {
        let size = instruction_size(ops, pc);
        if matches!(
            OpCode::try_from(ops[pc]),
            Ok(OpCode::CallFuncIC) | Ok(OpCode::CallNativeFuncIC)
        ) && u16_at(ops, pc + 4) == sym
        {
            ops[pc] = OpCode::CallSym as u8;
        }
        pc += size;
    }
}
