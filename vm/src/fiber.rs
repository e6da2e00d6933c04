//! Cooperative fiber switching.
//!
//! The VM's `stack` field is always the running context's buffer;
//! suspended contexts park theirs in the Fiber object (or in
//! `main_saved` for the main context). `Coresume` saves the caller
//! unadvanced, so yielding back can read the resume site's `dst`
//! operand and write the passed value before stepping past it.

use object::{frame, Fiber, FiberState, Value};

use crate::error::PanicKind;
use crate::VM;

const COINIT_SIZE: usize = 8;
const CORESUME_SIZE: usize = 3;

/// Suspended main-context state.
pub(crate) struct SavedCtx {
    pub stack: Box<[Value]>,
    pub pc: usize,
    pub fp: usize,
}

/// `Coinit start_args, nargs, stack_pages, dst, skip`. Builds the fiber
/// with a root frame and retained copies of the bound args; the body
/// starts right after this instruction and the main path jumps over it.
pub(crate) fn coinit(
    vm: &mut VM,
    ops: &[u8],
    pc: usize,
    fp: usize,
) -> Result<usize, PanicKind> {
    let start_args = ops[pc + 1] as usize;
    let num_args = ops[pc + 2] as usize;
    let pages = ops[pc + 3] as usize;
    let dst = ops[pc + 4] as usize;
    let skip = u16::from_le_bytes([ops[pc + 5], ops[pc + 6]]) as usize;

    let slots = (pages * 16)
        .max(frame::FRAME_HEADER_SLOTS + num_args)
        .max(16);
    let mut stack = vec![Value::NONE; slots].into_boxed_slice();
    let root_size = slots.min(u8::MAX as usize) as u8;
    stack[1] = frame::pack_frame_meta(0, true, root_size, frame::NO_FUNC);
    stack[2] = frame::pc_to_value(0);
    stack[3] = frame::fp_to_value(0);
    for i in 0..num_args {
        let v = vm.stack[fp + start_args + i];
        vm.heap.retain(v);
        stack[frame::FRAME_HEADER_SLOTS + i] = v;
    }

    let fiber = vm
        .heap
        .new_fiber(stack, (pc + COINIT_SIZE) as u32, num_args as u8)
        .ok_or(PanicKind::OutOfMemory)?;
    vm.stack[fp + dst] = fiber;
    Ok(pc + skip)
}

/// `Coresume fiber, dst`. Parks the caller (pc unadvanced) and installs
/// the fiber's context. Resuming a finished or already-running fiber
/// just produces `none`.
pub(crate) fn coresume(
    vm: &mut VM,
    ops: &[u8],
    pc: usize,
    fp: usize,
) -> Result<(usize, usize), PanicKind> {
    let fiber_local = ops[pc + 1] as usize;
    let dst = ops[pc + 2] as usize;
    let fv = vm.stack[fp + fiber_local];
    if !fv.is_heap() || vm.type_of(fv) != object::TYPE_FIBER {
        return Err(PanicKind::InvalidArgument("coresume on a non-fiber"));
    }
    // SAFETY: the fiber value is live; no other reference is active.
    let state = unsafe { fv.as_heap_ref::<Fiber>().state };
    match state {
        FiberState::Done | FiberState::Exec => {
            vm.stack[fp + dst] = Value::NONE;
            return Ok((pc + CORESUME_SIZE, fp));
        }
        FiberState::Init | FiberState::Paused => {}
    }

    // Park the running context with pc still at the Coresume.
    let cur_stack = core::mem::take(&mut vm.stack);
    if vm.cur_fiber.is_none() {
        vm.main_saved = Some(SavedCtx {
            stack: cur_stack,
            pc,
            fp,
        });
    } else {
        // SAFETY: the running fiber value is live.
        unsafe {
            let cf: &mut Fiber = vm.cur_fiber.as_heap_mut();
            cf.stack = cur_stack;
            cf.pc = pc as u32;
            cf.fp = fp as u32;
            cf.state = FiberState::Paused;
        }
    }

    // SAFETY: the fiber value is live.
    let (new_pc, new_fp) = unsafe {
        let f: &mut Fiber = fv.as_heap_mut();
        // The resumed fiber takes over the VM's reference to the old
        // current fiber as its caller link.
        f.prev_fiber = vm.cur_fiber;
        f.state = FiberState::Exec;
        vm.stack = core::mem::take(&mut f.stack);
        (f.pc as usize, f.fp as usize)
    };
    vm.heap.retain(fv);
    vm.cur_fiber = fv;
    Ok((new_pc, new_fp))
}

/// `Coyield src`. Suspends the running fiber, passing a retained value
/// back to the resumer.
pub(crate) fn coyield(
    vm: &mut VM,
    ops: &[u8],
    pc: usize,
    fp: usize,
) -> Result<(usize, usize), PanicKind> {
    if vm.cur_fiber.is_none() {
        return Err(PanicKind::InvalidArgument("yield outside a fiber"));
    }
    let src = ops[pc + 1] as usize;
    let val = vm.stack[fp + src];
    vm.heap.retain(val);

    let fv = vm.cur_fiber;
    // SAFETY: the running fiber value is live.
    unsafe {
        let f: &mut Fiber = fv.as_heap_mut();
        f.stack = core::mem::take(&mut vm.stack);
        f.pc = (pc + 2) as u32;
        f.fp = fp as u32;
        f.state = FiberState::Paused;
    }
    Ok(switch_back(vm, ops, fv, val))
}

/// `Coreturn src`. Finishes the fiber; its locals were released by the
/// compiled epilogue, so the buffer goes back without a walk.
pub(crate) fn coreturn(
    vm: &mut VM,
    ops: &[u8],
    pc: usize,
    fp: usize,
) -> Result<(usize, usize), PanicKind> {
    if vm.cur_fiber.is_none() {
        return Err(PanicKind::InvalidArgument("coreturn outside a fiber"));
    }
    let src = ops[pc + 1] as usize;
    let val = vm.stack[fp + src];
    vm.heap.retain(val);

    let fv = vm.cur_fiber;
    // SAFETY: the running fiber value is live.
    unsafe {
        let f: &mut Fiber = fv.as_heap_mut();
        f.stack = core::mem::take(&mut vm.stack);
        f.pc = pc as u32;
        f.fp = fp as u32;
        f.state = FiberState::Done;
    }
    Ok(switch_back(vm, ops, fv, val))
}

/// Returns control to `from`'s resumer, delivering `val` into the
/// resume site's destination slot.
fn switch_back(
    vm: &mut VM,
    ops: &[u8],
    from: Value,
    val: Value,
) -> (usize, usize) {
    // SAFETY: the suspending fiber value is live.
    let prev = unsafe {
        let f: &mut Fiber = from.as_heap_mut();
        let prev = f.prev_fiber;
        f.prev_fiber = Value::NONE;
        prev
    };
    let (rpc, rfp) = restore_context(vm, prev);
    // The VM's reference to the suspending fiber ends here.
    vm.heap.release(from);

    // `rpc` points at the Coresume that started this slice.
    let dst = ops[rpc + 2] as usize;
    vm.stack[rfp + dst] = val;
    (rpc + CORESUME_SIZE, rfp)
}

/// Reinstalls a parked context (`prev` fiber, or the main context when
/// `prev` is none) as the running one. The VM's current-fiber reference
/// becomes `prev` (ownership moves with it). Returns its saved pc/fp.
pub(crate) fn restore_context(vm: &mut VM, prev: Value) -> (usize, usize) {
    if prev.is_none() {
        let saved = vm
            .main_saved
            .take()
            .expect("fiber chain bottomed out without a main context");
        vm.stack = saved.stack;
        vm.cur_fiber = Value::NONE;
        (saved.pc, saved.fp)
    } else {
        // SAFETY: the parked fiber value is live.
        unsafe {
            let pf: &mut Fiber = prev.as_heap_mut();
            pf.state = FiberState::Exec;
            vm.stack = core::mem::take(&mut pf.stack);
            vm.cur_fiber = prev;
            (pf.pc as usize, pf.fp as usize)
        }
    }
}

impl VM {
    /// Status of a fiber value, for embedder inspection.
    pub fn fiber_state(&self, v: Value) -> Option<FiberState> {
        if v.is_heap() && self.type_of(v) == object::TYPE_FIBER {
            // SAFETY: the fiber value is live.
            Some(unsafe { v.as_heap_ref::<Fiber>().state })
        } else {
            None
        }
    }
}
