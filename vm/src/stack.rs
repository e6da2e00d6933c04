//! Call-frame management and panic unwinding.
//!
//! Frames are four header slots plus locals inside the flat value
//! stack; see `object::frame` for the slot layout. On a panic the VM
//! walks every frame — across fiber boundaries — releasing the locals
//! the compiler marked as retained, then reports to the embedder.

use object::{frame, Fiber, FiberState, Value};

use crate::error::{PanicKind, RuntimePanic};
use crate::fiber::restore_context;
use crate::ops::to_display_string;
use crate::VM;

/// Writes a frame header at `fp + start` and moves the frame pointer.
/// Locals beyond the already-written args are cleared so a release walk
/// (unwind, fiber teardown) never sees stale values from earlier
/// frames. Fails with `StackOverflow` when the callee's slots don't
/// fit.
#[inline]
pub(crate) fn push_frame(
    vm: &mut VM,
    fp: usize,
    start: usize,
    num_args: usize,
    num_ret: u8,
    stack_size: u8,
    func_id: u16,
    ret_pc: usize,
) -> Result<usize, PanicKind> {
    let new_fp = fp + start;
    if new_fp + stack_size as usize > vm.stack.len() {
        return Err(PanicKind::StackOverflow);
    }
    vm.stack[new_fp + 1] =
        frame::pack_frame_meta(num_ret, false, stack_size, func_id);
    vm.stack[new_fp + 2] = frame::pc_to_value(ret_pc);
    vm.stack[new_fp + 3] = frame::fp_to_value(fp);
    let end = new_fp + stack_size as usize;
    let locals = (new_fp + frame::FRAME_HEADER_SLOTS + num_args).min(end);
    vm.stack[locals..end].fill(Value::NONE);
    Ok(new_fp)
}

/// Unwinds after an irrecoverable failure: releases each frame's
/// retained locals (per compiler-emitted metadata), pops through fiber
/// boundaries back to the main context, and records a formatted report.
pub(crate) fn unwind_panic(
    vm: &mut VM,
    pc: usize,
    mut fp: usize,
    kind: PanicKind,
) -> RuntimePanic {
    loop {
        let meta = vm.stack[fp + 1];
        let root = frame::frame_is_root(meta);
        let func_id = frame::frame_func_id(meta);

        // Fiber stacks keep every local uniquely owning (the same
        // convention their destructor relies on), so those frames
        // release wholesale; main-context frames consult the
        // compiler-emitted release metadata.
        if vm.cur_fiber.is_none() {
            let retained: Vec<u8> = if func_id != frame::NO_FUNC {
                vm.funcs[func_id as usize].retained_locals.clone()
            } else if root {
                vm.main_retained.clone()
            } else {
                Vec::new()
            };
            for l in retained {
                let slot = fp + l as usize;
                let v = vm.stack[slot];
                vm.stack[slot] = Value::NONE;
                vm.heap.release(v);
            }
        } else {
            let size = frame::frame_stack_size(meta) as usize;
            for slot in fp + frame::FRAME_HEADER_SLOTS..fp + size {
                let v = vm.stack[slot];
                vm.stack[slot] = Value::NONE;
                vm.heap.release(v);
            }
        }

        if !root {
            fp = frame::value_to_fp(vm.stack[fp + 3]);
            continue;
        }
        if vm.cur_fiber.is_none() {
            break;
        }

        // Fiber boundary: the dying fiber's frames are done; continue
        // unwinding in the resumer.
        let fv = vm.cur_fiber;
        // SAFETY: the running fiber value is live.
        let prev = unsafe {
            let f: &mut Fiber = fv.as_heap_mut();
            f.state = FiberState::Done;
            f.stack = Box::default();
            let prev = f.prev_fiber;
            f.prev_fiber = Value::NONE;
            prev
        };
        let (_, rfp) = restore_context(vm, prev);
        vm.heap.release(fv);
        fp = rfp;
    }

    vm.fp = 0;
    vm.pc = 0;
    let panic = RuntimePanic {
        kind,
        pc: pc as u32,
    };
    vm.last_error = Some(format_panic_report(vm, &panic));
    panic
}

fn format_panic_report(vm: &VM, panic: &RuntimePanic) -> String {
    match vm.debug_sym_at(panic.pc) {
        Some(d) => format!(
            "panic: {} at {}:{} (pc {})",
            panic.kind, d.line, d.col, panic.pc
        ),
        None => format!("panic: {} (pc {})", panic.kind, panic.pc),
    }
}

impl VM {
    pub(crate) fn debug_sym_at(
        &self,
        pc: u32,
    ) -> Option<bytecode::DebugSym> {
        let idx = self.debug.partition_point(|d| d.pc <= pc);
        idx.checked_sub(1).map(|i| self.debug[i])
    }

    /// Formatted report for the last non-success result.
    pub fn last_error_report(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Render a value the way `print` and error reports do.
    pub fn display_value(&self, v: Value) -> String {
        to_display_string(self, v)
    }
}
