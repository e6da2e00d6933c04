use object::Value;

use crate::chunk::{Chunk, ChunkString, DebugSym, FuncInfo};
use crate::op::OpCode;

/// An unresolved forward jump: the instruction starts at `at` and its
/// offset operand sits at `at + operand_off`.
#[derive(Debug, Clone, Copy)]
#[must_use = "unbound jumps leave a zero offset in the stream"]
pub struct JumpPatch {
    at: usize,
    operand_off: usize,
}

/// Assembles a [`Chunk`]: pushes instructions, interns constants,
/// strings and symbols, and patches jump offsets.
///
/// Jump offsets are relative to the first byte of the jump instruction
/// itself.
#[derive(Debug, Default)]
pub struct ChunkBuilder {
    chunk: Chunk,
}

impl ChunkBuilder {
    pub fn new() -> Self {
        Self {
            chunk: Chunk::new(),
        }
    }

    /// Current instruction offset (the pc the next emit will land on).
    #[inline]
    pub fn here(&self) -> usize {
        self.chunk.ops.len()
    }

    pub fn finish(mut self, main_stack_size: u8) -> Chunk {
        self.chunk.main_stack_size = main_stack_size;
        self.chunk
    }

    pub fn finish_with_retained(
        mut self,
        main_stack_size: u8,
        retained_locals: &[u8],
    ) -> Chunk {
        self.chunk.main_stack_size = main_stack_size;
        self.chunk.main_retained_locals = retained_locals.to_vec();
        self.chunk
    }

    // ── Pools and tables ───────────────────────────────────────────

    /// Interns a constant by bit pattern.
    pub fn add_const(&mut self, v: Value) -> u16 {
        if let Some(i) =
            self.chunk.consts.iter().position(|c| c.raw() == v.raw())
        {
            return i as u16;
        }
        self.chunk.consts.push(v);
        (self.chunk.consts.len() - 1) as u16
    }

    /// Interns a static string, returning its string-table id.
    pub fn add_string(&mut self, s: &str) -> u32 {
        if let Some(i) =
            self.chunk.strings.iter().position(|c| c.as_str() == s)
        {
            return i as u32;
        }
        self.chunk.strings.push(ChunkString::new(s));
        (self.chunk.strings.len() - 1) as u32
    }

    /// Interns a string and adds a static-string constant referencing it.
    pub fn add_string_const(&mut self, s: &str) -> u16 {
        let id = self.add_string(s);
        let v = if self.chunk.strings[id as usize].ascii {
            Value::static_astring(id)
        } else {
            Value::static_ustring(id)
        };
        self.add_const(v)
    }

    pub fn method_sym(&mut self, name: &str) -> u8 {
        if let Some(i) =
            self.chunk.method_syms.iter().position(|n| n == name)
        {
            return i as u8;
        }
        self.chunk.method_syms.push(name.to_string());
        (self.chunk.method_syms.len() - 1) as u8
    }

    pub fn static_sym(&mut self, name: &str) -> u16 {
        if let Some(i) =
            self.chunk.static_syms.iter().position(|n| n == name)
        {
            return i as u16;
        }
        self.chunk.static_syms.push(name.to_string());
        (self.chunk.static_syms.len() - 1) as u16
    }

    pub fn error_sym(&mut self, name: &str) -> u32 {
        if let Some(i) = self.chunk.error_syms.iter().position(|n| n == name)
        {
            return i as u32;
        }
        self.chunk.error_syms.push(name.to_string());
        (self.chunk.error_syms.len() - 1) as u32
    }

    /// Registers a function body. `sym` binds it to a static symbol;
    /// pass `u16::MAX` for an anonymous body (lambdas, fiber bodies).
    pub fn add_func(
        &mut self,
        pc: u32,
        num_params: u8,
        stack_size: u8,
        retained_locals: &[u8],
        sym: u16,
    ) -> u16 {
        self.chunk.funcs.push(FuncInfo {
            pc,
            num_params,
            stack_size,
            retained_locals: retained_locals.to_vec(),
            sym,
        });
        (self.chunk.funcs.len() - 1) as u16
    }

    /// Records a source position for the next instruction.
    pub fn debug_sym(&mut self, line: u32, col: u32) {
        self.chunk.debug.push(DebugSym {
            pc: self.here() as u32,
            line,
            col,
        });
    }

    // ── Raw emission ───────────────────────────────────────────────

    #[inline]
    fn op(&mut self, op: OpCode) {
        self.chunk.ops.push(op as u8);
    }

    #[inline]
    fn u8(&mut self, b: u8) {
        self.chunk.ops.push(b);
    }

    #[inline]
    fn i8(&mut self, b: i8) {
        self.chunk.ops.push(b as u8);
    }

    #[inline]
    fn u16(&mut self, v: u16) {
        self.chunk.ops.extend_from_slice(&v.to_le_bytes());
    }

    #[inline]
    fn pad(&mut self, n: usize) {
        self.chunk.ops.resize(self.chunk.ops.len() + n, 0);
    }

    // ── Constants & literals ───────────────────────────────────────

    pub fn const_op(&mut self, idx: u16, dst: u8) {
        self.op(OpCode::ConstOp);
        self.u16(idx);
        self.u8(dst);
    }

    pub fn const_i8(&mut self, val: i8, dst: u8) {
        self.op(OpCode::ConstI8);
        self.i8(val);
        self.u8(dst);
    }

    pub fn const_i8_int(&mut self, val: i8, dst: u8) {
        self.op(OpCode::ConstI8Int);
        self.i8(val);
        self.u8(dst);
    }

    pub fn true_(&mut self, dst: u8) {
        self.op(OpCode::True);
        self.u8(dst);
    }

    pub fn false_(&mut self, dst: u8) {
        self.op(OpCode::False);
        self.u8(dst);
    }

    pub fn none(&mut self, dst: u8) {
        self.op(OpCode::None);
        self.u8(dst);
    }

    pub fn tag(&mut self, group: u8, member: u8, dst: u8) {
        self.op(OpCode::Tag);
        self.u8(group);
        self.u8(member);
        self.u8(dst);
    }

    pub fn tag_literal(&mut self, sym: u8, dst: u8) {
        self.op(OpCode::TagLiteral);
        self.u8(sym);
        self.u8(dst);
    }

    // ── Moves & refcounts ──────────────────────────────────────────

    pub fn copy(&mut self, src: u8, dst: u8) {
        self.op(OpCode::Copy);
        self.u8(src);
        self.u8(dst);
    }

    pub fn copy_release_dst(&mut self, src: u8, dst: u8) {
        self.op(OpCode::CopyReleaseDst);
        self.u8(src);
        self.u8(dst);
    }

    pub fn copy_retain_src(&mut self, src: u8, dst: u8) {
        self.op(OpCode::CopyRetainSrc);
        self.u8(src);
        self.u8(dst);
    }

    pub fn copy_retain_release(&mut self, src: u8, dst: u8) {
        self.op(OpCode::CopyRetainRelease);
        self.u8(src);
        self.u8(dst);
    }

    pub fn retain(&mut self, local: u8) {
        self.op(OpCode::Retain);
        self.u8(local);
    }

    pub fn release(&mut self, local: u8) {
        self.op(OpCode::Release);
        self.u8(local);
    }

    pub fn release_n(&mut self, locals: &[u8]) {
        self.op(OpCode::ReleaseN);
        self.u8(locals.len() as u8);
        self.chunk.ops.extend_from_slice(locals);
    }

    pub fn set_init_n(&mut self, locals: &[u8]) {
        self.op(OpCode::SetInitN);
        self.u8(locals.len() as u8);
        self.chunk.ops.extend_from_slice(locals);
    }

    // ── Arithmetic & comparison ────────────────────────────────────

    fn binop(&mut self, op: OpCode, left: u8, right: u8, dst: u8) {
        self.op(op);
        self.u8(left);
        self.u8(right);
        self.u8(dst);
    }

    pub fn add(&mut self, l: u8, r: u8, dst: u8) {
        self.binop(OpCode::Add, l, r, dst);
    }

    pub fn sub(&mut self, l: u8, r: u8, dst: u8) {
        self.binop(OpCode::Sub, l, r, dst);
    }

    pub fn mul(&mut self, l: u8, r: u8, dst: u8) {
        self.binop(OpCode::Mul, l, r, dst);
    }

    pub fn div(&mut self, l: u8, r: u8, dst: u8) {
        self.binop(OpCode::Div, l, r, dst);
    }

    pub fn pow(&mut self, l: u8, r: u8, dst: u8) {
        self.binop(OpCode::Pow, l, r, dst);
    }

    pub fn mod_(&mut self, l: u8, r: u8, dst: u8) {
        self.binop(OpCode::Mod, l, r, dst);
    }

    pub fn neg(&mut self, src: u8, dst: u8) {
        self.op(OpCode::Neg);
        self.u8(src);
        self.u8(dst);
    }

    pub fn not(&mut self, src: u8, dst: u8) {
        self.op(OpCode::Not);
        self.u8(src);
        self.u8(dst);
    }

    pub fn add_int(&mut self, l: u8, r: u8, dst: u8) {
        self.binop(OpCode::AddInt, l, r, dst);
    }

    pub fn sub_int(&mut self, l: u8, r: u8, dst: u8) {
        self.binop(OpCode::SubInt, l, r, dst);
    }

    pub fn less_int(&mut self, l: u8, r: u8, dst: u8) {
        self.binop(OpCode::LessInt, l, r, dst);
    }

    pub fn compare(&mut self, l: u8, r: u8, dst: u8) {
        self.binop(OpCode::Compare, l, r, dst);
    }

    pub fn compare_not(&mut self, l: u8, r: u8, dst: u8) {
        self.binop(OpCode::CompareNot, l, r, dst);
    }

    pub fn less(&mut self, l: u8, r: u8, dst: u8) {
        self.binop(OpCode::Less, l, r, dst);
    }

    pub fn greater(&mut self, l: u8, r: u8, dst: u8) {
        self.binop(OpCode::Greater, l, r, dst);
    }

    pub fn less_equal(&mut self, l: u8, r: u8, dst: u8) {
        self.binop(OpCode::LessEqual, l, r, dst);
    }

    pub fn greater_equal(&mut self, l: u8, r: u8, dst: u8) {
        self.binop(OpCode::GreaterEqual, l, r, dst);
    }

    pub fn bitwise_and(&mut self, l: u8, r: u8, dst: u8) {
        self.binop(OpCode::BitwiseAnd, l, r, dst);
    }

    pub fn bitwise_or(&mut self, l: u8, r: u8, dst: u8) {
        self.binop(OpCode::BitwiseOr, l, r, dst);
    }

    pub fn bitwise_xor(&mut self, l: u8, r: u8, dst: u8) {
        self.binop(OpCode::BitwiseXor, l, r, dst);
    }

    pub fn bitwise_not(&mut self, src: u8, dst: u8) {
        self.op(OpCode::BitwiseNot);
        self.u8(src);
        self.u8(dst);
    }

    pub fn bitwise_left_shift(&mut self, l: u8, r: u8, dst: u8) {
        self.binop(OpCode::BitwiseLeftShift, l, r, dst);
    }

    pub fn bitwise_right_shift(&mut self, l: u8, r: u8, dst: u8) {
        self.binop(OpCode::BitwiseRightShift, l, r, dst);
    }

    // ── Control flow ───────────────────────────────────────────────

    fn jump_op(&mut self, op: OpCode, cond: Option<u8>) -> JumpPatch {
        let at = self.here();
        self.op(op);
        self.u16(0);
        if let Some(c) = cond {
            self.u8(c);
        }
        JumpPatch { at, operand_off: 1 }
    }

    pub fn jump(&mut self) -> JumpPatch {
        self.jump_op(OpCode::Jump, None)
    }

    pub fn jump_cond(&mut self, cond: u8) -> JumpPatch {
        self.jump_op(OpCode::JumpCond, Some(cond))
    }

    pub fn jump_not_cond(&mut self, cond: u8) -> JumpPatch {
        self.jump_op(OpCode::JumpNotCond, Some(cond))
    }

    pub fn jump_not_none(&mut self, src: u8) -> JumpPatch {
        self.jump_op(OpCode::JumpNotNone, Some(src))
    }

    /// Backward jump to an already-emitted target.
    pub fn jump_back(&mut self, target: usize) {
        let at = self.here();
        self.op(OpCode::Jump);
        let offset = target as i64 - at as i64;
        self.chunk
            .ops
            .extend_from_slice(&(offset as i16).to_le_bytes());
    }

    /// Resolves a forward jump to the current offset.
    pub fn bind(&mut self, patch: JumpPatch) {
        let offset = (self.here() - patch.at) as u16;
        let pos = patch.at + patch.operand_off;
        self.chunk.ops[pos..pos + 2].copy_from_slice(&offset.to_le_bytes());
    }

    pub fn try_value(&mut self, src: u8, dst: u8) -> JumpPatch {
        let at = self.here();
        self.op(OpCode::TryValue);
        self.u8(src);
        self.u8(dst);
        self.u16(0);
        JumpPatch { at, operand_off: 3 }
    }

    /// Emits a `Match`; returns one patch per case plus the else patch.
    pub fn match_op(
        &mut self,
        expr: u8,
        case_consts: &[u16],
    ) -> (Vec<JumpPatch>, JumpPatch) {
        let at = self.here();
        self.op(OpCode::Match);
        self.u8(expr);
        self.u8(case_consts.len() as u8);
        let mut patches = Vec::with_capacity(case_consts.len());
        for (i, &c) in case_consts.iter().enumerate() {
            self.u16(c);
            patches.push(JumpPatch {
                at,
                operand_off: 3 + 4 * i + 2,
            });
            self.u16(0);
        }
        let else_patch = JumpPatch {
            at,
            operand_off: 3 + 4 * case_consts.len(),
        };
        self.u16(0);
        (patches, else_patch)
    }

    // ── Calls & returns ────────────────────────────────────────────

    pub fn call0(&mut self, start: u8, num_args: u8) {
        self.op(OpCode::Call0);
        self.u8(start);
        self.u8(num_args);
    }

    pub fn call1(&mut self, start: u8, num_args: u8) {
        self.op(OpCode::Call1);
        self.u8(start);
        self.u8(num_args);
    }

    pub fn call_sym(&mut self, start: u8, num_args: u8, num_ret: u8, sym: u16) {
        self.op(OpCode::CallSym);
        self.u8(start);
        self.u8(num_args);
        self.u8(num_ret);
        self.u16(sym);
        self.pad(8);
    }

    pub fn call_obj_sym(
        &mut self,
        start: u8,
        num_args: u8,
        num_ret: u8,
        sym: u8,
    ) {
        self.op(OpCode::CallObjSym);
        self.u8(start);
        self.u8(num_args);
        self.u8(num_ret);
        self.u8(sym);
        self.pad(9);
    }

    pub fn ret0(&mut self) {
        self.op(OpCode::Ret0);
    }

    pub fn ret1(&mut self) {
        self.op(OpCode::Ret1);
    }

    // ── Aggregates ─────────────────────────────────────────────────

    pub fn list(&mut self, start: u8, n: u8, dst: u8) {
        self.op(OpCode::List);
        self.u8(start);
        self.u8(n);
        self.u8(dst);
    }

    pub fn map(&mut self, start: u8, key_consts: &[u16], dst: u8) {
        self.op(OpCode::Map);
        self.u8(start);
        self.u8(key_consts.len() as u8);
        self.u8(dst);
        for &k in key_consts {
            self.u16(k);
        }
    }

    pub fn map_empty(&mut self, dst: u8) {
        self.op(OpCode::MapEmpty);
        self.u8(dst);
    }

    pub fn index(&mut self, recv: u8, idx: u8, dst: u8) {
        self.binop(OpCode::Index, recv, idx, dst);
    }

    pub fn reverse_index(&mut self, recv: u8, idx: u8, dst: u8) {
        self.binop(OpCode::ReverseIndex, recv, idx, dst);
    }

    pub fn set_index(&mut self, recv: u8, idx: u8, src: u8) {
        self.binop(OpCode::SetIndex, recv, idx, src);
    }

    pub fn set_index_release(&mut self, recv: u8, idx: u8, src: u8) {
        self.binop(OpCode::SetIndexRelease, recv, idx, src);
    }

    pub fn slice(&mut self, recv: u8, start: u8, end: u8, dst: u8) {
        self.op(OpCode::Slice);
        self.u8(recv);
        self.u8(start);
        self.u8(end);
        self.u8(dst);
    }

    pub fn object(&mut self, type_id: u16, start: u8, n: u8, dst: u8) {
        self.op(OpCode::Object);
        self.u16(type_id);
        self.u8(start);
        self.u8(n);
        self.u8(dst);
    }

    pub fn object_small(&mut self, type_id: u16, start: u8, n: u8, dst: u8) {
        self.op(OpCode::ObjectSmall);
        self.u16(type_id);
        self.u8(start);
        self.u8(n);
        self.u8(dst);
    }

    fn field_op(&mut self, op: OpCode, recv: u8, dst: u8, sym: u8) {
        self.op(op);
        self.u8(recv);
        self.u8(dst);
        self.u8(sym);
        self.pad(4);
    }

    pub fn field(&mut self, recv: u8, dst: u8, sym: u8) {
        self.field_op(OpCode::Field, recv, dst, sym);
    }

    pub fn field_retain(&mut self, recv: u8, dst: u8, sym: u8) {
        self.field_op(OpCode::FieldRetain, recv, dst, sym);
    }

    pub fn field_release(&mut self, recv: u8, dst: u8, sym: u8) {
        self.field_op(OpCode::FieldRelease, recv, dst, sym);
    }

    pub fn set_field(&mut self, recv: u8, sym: u8, src: u8) {
        self.field_op(OpCode::SetField, recv, sym, src);
    }

    pub fn set_field_release(&mut self, recv: u8, sym: u8, src: u8) {
        self.field_op(OpCode::SetFieldRelease, recv, sym, src);
    }

    pub fn string_template(&mut self, start: u8, expr_count: u8, dst: u8) {
        self.op(OpCode::StringTemplate);
        self.u8(start);
        self.u8(expr_count);
        self.u8(dst);
    }

    // ── Closures & boxes ───────────────────────────────────────────

    pub fn lambda(
        &mut self,
        func_pc: u16,
        num_params: u8,
        stack_size: u8,
        dst: u8,
    ) {
        self.op(OpCode::Lambda);
        self.u16(func_pc);
        self.u8(num_params);
        self.u8(stack_size);
        self.u8(dst);
    }

    pub fn closure(
        &mut self,
        func_pc: u16,
        num_params: u8,
        stack_size: u8,
        captured: &[u8],
        dst: u8,
    ) {
        self.op(OpCode::Closure);
        self.u16(func_pc);
        self.u8(num_params);
        self.u8(captured.len() as u8);
        self.u8(stack_size);
        self.u8(dst);
        self.chunk.ops.extend_from_slice(captured);
    }

    pub fn box_(&mut self, src: u8, dst: u8) {
        self.op(OpCode::Box);
        self.u8(src);
        self.u8(dst);
    }

    pub fn box_value(&mut self, box_local: u8, dst: u8) {
        self.op(OpCode::BoxValue);
        self.u8(box_local);
        self.u8(dst);
    }

    pub fn box_value_retain(&mut self, box_local: u8, dst: u8) {
        self.op(OpCode::BoxValueRetain);
        self.u8(box_local);
        self.u8(dst);
    }

    pub fn set_box_value(&mut self, box_local: u8, src: u8) {
        self.op(OpCode::SetBoxValue);
        self.u8(box_local);
        self.u8(src);
    }

    pub fn set_box_value_release(&mut self, box_local: u8, src: u8) {
        self.op(OpCode::SetBoxValueRelease);
        self.u8(box_local);
        self.u8(src);
    }

    // ── Iteration ──────────────────────────────────────────────────

    /// Emits `ForRangeInit`; bind the returned patch when emitting the
    /// loop's `ForRange` so the init can find and specialise it.
    pub fn for_range_init(
        &mut self,
        start: u8,
        end: u8,
        step: u8,
        counter: u8,
        user: u8,
    ) -> JumpPatch {
        let at = self.here();
        self.op(OpCode::ForRangeInit);
        self.u8(start);
        self.u8(end);
        self.u8(step);
        self.u8(counter);
        self.u8(user);
        self.u16(0);
        JumpPatch { at, operand_off: 6 }
    }

    /// Emits the loop-step placeholder (`ForRange`; the init rewrites it
    /// to the right direction at run time). `body` is the loop-body pc
    /// to jump back to.
    pub fn for_range(
        &mut self,
        counter: u8,
        step: u8,
        end: u8,
        user: u8,
        body: usize,
    ) {
        let at = self.here();
        self.op(OpCode::ForRange);
        self.u8(counter);
        self.u8(step);
        self.u8(end);
        self.u8(user);
        self.u16((at - body) as u16);
    }

    // ── Fibers ─────────────────────────────────────────────────────

    /// Emits `Coinit`; the fiber body follows immediately. Bind the
    /// returned patch after emitting the body (plus its `Coreturn`) so
    /// the main path skips it.
    pub fn coinit(
        &mut self,
        start_args: u8,
        num_args: u8,
        stack_pages: u8,
        dst: u8,
    ) -> JumpPatch {
        let at = self.here();
        self.op(OpCode::Coinit);
        self.u8(start_args);
        self.u8(num_args);
        self.u8(stack_pages);
        self.u8(dst);
        self.u16(0);
        self.pad(1);
        JumpPatch { at, operand_off: 5 }
    }

    pub fn coyield(&mut self, src: u8) {
        self.op(OpCode::Coyield);
        self.u8(src);
    }

    pub fn coresume(&mut self, fiber: u8, dst: u8) {
        self.op(OpCode::Coresume);
        self.u8(fiber);
        self.u8(dst);
    }

    pub fn coreturn(&mut self, src: u8) {
        self.op(OpCode::Coreturn);
        self.u8(src);
    }

    // ── Statics & misc ─────────────────────────────────────────────

    pub fn static_var(&mut self, sym: u16, dst: u8) {
        self.op(OpCode::StaticVar);
        self.u16(sym);
        self.u8(dst);
    }

    pub fn set_static_var(&mut self, sym: u16, src: u8) {
        self.op(OpCode::SetStaticVar);
        self.u16(sym);
        self.u8(src);
    }

    pub fn static_func(&mut self, sym: u16, dst: u8) {
        self.op(OpCode::StaticFunc);
        self.u16(sym);
        self.u8(dst);
    }

    pub fn set_static_func(&mut self, sym: u16, src: u8) {
        self.op(OpCode::SetStaticFunc);
        self.u16(sym);
        self.u8(src);
    }

    pub fn sym(&mut self, kind: u8, id: u8, dst: u8) {
        self.op(OpCode::Sym);
        self.u8(kind);
        self.u8(id);
        self.u8(dst);
    }

    pub fn end(&mut self, src: u8) {
        self.op(OpCode::End);
        self.u8(src);
    }
}
