/// Bytecode opcodes.
///
/// Operands are byte-wide register (frame slot) indices unless noted;
/// multi-byte operands are little-endian. Every opcode has a fixed width
/// except the few marked *variable*, whose width depends on an inline
/// count operand.
///
/// The three call families are all 14 bytes wide so an inline-cache
/// rewrite never changes the instruction size: byte 0 is the opcode,
/// bytes 6..12 hold the cached 48-bit target and bytes 12..14 the cached
/// receiver type id. Deoptimisation rewrites byte 0 only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    /// Load a constant-pool entry. `idx:u16, dst` — width 4.
    ConstOp = 0,
    /// Load a small float literal. `val:i8, dst` — width 3.
    ConstI8,
    /// Load a small integer literal. `val:i8, dst` — width 3.
    ConstI8Int,
    /// Float add with slow-path fallback. `left, right, dst` — width 4.
    Add,
    /// Float subtract with fallback. `left, right, dst` — width 4.
    Sub,
    /// Load `true`. `dst` — width 2.
    True,
    /// Load `false`. `dst` — width 2.
    False,
    /// Load `none`. `dst` — width 2.
    None,
    /// Boolean negation (truthiness). `src, dst` — width 3.
    Not,
    /// Plain move. `src, dst` — width 3.
    Copy,
    /// Move, releasing the previous destination. `src, dst` — width 3.
    CopyReleaseDst,
    /// `recv[index] = right`. `recv, index, right` — width 4.
    SetIndex,
    /// Like [`SetIndex`](Self::SetIndex), releasing the replaced element.
    /// `recv, index, right` — width 4.
    SetIndexRelease,
    /// Move, retaining the source. `src, dst` — width 3.
    CopyRetainSrc,
    /// `recv[index]`. `recv, index, dst` — width 4.
    Index,
    /// `recv[-index]` (from the end). `recv, index, dst` — width 4.
    ReverseIndex,
    /// Build a list from consecutive locals. `start, n, dst` — width 4.
    List,
    /// *Variable.* Build a map; keys come from the constant pool, values
    /// from consecutive locals. `start, n, dst, key_idx:u16 × n` —
    /// width 4+2n.
    Map,
    /// Build an empty map. `dst` — width 2.
    MapEmpty,
    /// `recv[start..end]`. `recv, start, end, dst` — width 5.
    Slice,
    /// Jump if falsy. `offset:i16, cond` — width 4.
    JumpNotCond,
    /// Jump if truthy. `offset:i16, cond` — width 4.
    JumpCond,
    /// Unconditional jump. `offset:i16` — width 3.
    Jump,
    /// Release a local. `local` — width 2.
    Release,
    /// *Variable.* Release `n` locals. `n, local × n` — width 2+n.
    ReleaseN,
    /// Method call, unresolved. `start, nargs, nret, sym` then IC space —
    /// width 14. The receiver occupies the first incoming slot
    /// (`start + 4`); `nargs` counts it.
    CallObjSym,
    /// Method call with cached host fn. Same frame as
    /// [`CallObjSym`](Self::CallObjSym) plus `fn:u48@6, type:u16@12` —
    /// width 14.
    CallObjNativeFuncIC,
    /// Method call with cached bytecode fn. Same frame as
    /// [`CallObjSym`](Self::CallObjSym) plus `pc:u48@6, type:u16@12`
    /// and the callee stack size at byte 5 — width 14.
    CallObjFuncIC,
    /// Static function call, unresolved. `start, nargs, nret, sym:u16@4`
    /// then IC space — width 14.
    CallSym,
    /// Static call with cached bytecode fn. `pc:u48@6`, callee stack
    /// size at byte 12 (the receiver-type slot is unused for static
    /// calls) — width 14.
    CallFuncIC,
    /// Static call with cached host fn. `fn:u48@6` — width 14.
    CallNativeFuncIC,
    /// Return one value (written to frame slot 0) — width 1.
    Ret1,
    /// Return no value — width 1.
    Ret0,
    /// Call a callable value expecting no result. `start, nargs` —
    /// width 3. The callee sits at `start + 4 + nargs`.
    Call0,
    /// Call a callable value expecting one result. `start, nargs` —
    /// width 3.
    Call1,
    /// Field load, unresolved. `recv, dst, sym` then cache space
    /// (`type:u16@4, offset:u8@6`) — width 8.
    Field,
    /// Field load with cached offset — width 8.
    FieldIC,
    /// Field load, retaining the value — width 8.
    FieldRetain,
    /// Retaining field load with cached offset — width 8.
    FieldRetainIC,
    /// Field load that releases the receiver afterwards — width 8.
    FieldRelease,
    /// Make a lambda. `pc:u16, nparams, stack_size, dst` — width 6.
    Lambda,
    /// *Variable.* Make a closure capturing box locals.
    /// `pc:u16, nparams, ncaptured, stack_size, dst, local × n` —
    /// width 7+n.
    Closure,
    /// Equality (content for strings). `left, right, dst` — width 4.
    Compare,
    /// `<` on numbers. `left, right, dst` — width 4.
    Less,
    /// `>` on numbers. `left, right, dst` — width 4.
    Greater,
    /// `<=` on numbers. `left, right, dst` — width 4.
    LessEqual,
    /// `>=` on numbers. `left, right, dst` — width 4.
    GreaterEqual,
    /// Float multiply with fallback. `left, right, dst` — width 4.
    Mul,
    /// Float divide with fallback. `left, right, dst` — width 4.
    Div,
    /// Float power with fallback. `left, right, dst` — width 4.
    Pow,
    /// Float modulo (host `fmod`). `left, right, dst` — width 4.
    Mod,
    /// Inequality. `left, right, dst` — width 4.
    CompareNot,
    /// Concatenate interleaved literal/expression parts:
    /// locals `start .. start + 2n + 1`. `start, n, dst` — width 4.
    StringTemplate,
    /// Numeric negation. `src, dst` — width 3.
    Neg,
    /// *Variable.* Initialise `n` locals to `none`. `n, local × n` —
    /// width 2+n.
    SetInitN,
    /// Build a pool-sized object. `type:u16, start, nfields, dst` —
    /// width 6.
    ObjectSmall,
    /// Build an object. `type:u16, start, nfields, dst` — width 6.
    Object,
    /// Store a field. `recv, sym, src` then cache space — width 8.
    SetField,
    /// Store a field, releasing the previous value — width 8.
    SetFieldRelease,
    /// Releasing field store with cached offset — width 8.
    SetFieldReleaseIC,
    /// Create a fiber over the following body. `start_args, nargs,
    /// stack_pages, dst, skip:u16@5` — width 8. The body begins right
    /// after this instruction; the main path continues at `pc + skip`.
    Coinit,
    /// Suspend the current fiber, yielding a value. `src` — width 2.
    Coyield,
    /// Resume a fiber. `fiber, dst` — width 3.
    Coresume,
    /// Terminate the current fiber, returning a value. `src` — width 2.
    Coreturn,
    /// Retain a local. `local` — width 2.
    Retain,
    /// Move, retaining source and releasing destination. `src, dst` —
    /// width 3.
    CopyRetainRelease,
    /// Wrap a local in a new box (moves the value). `src, dst` —
    /// width 3.
    Box,
    /// Store into a box. `box, src` — width 3.
    SetBoxValue,
    /// Store into a box, releasing the previous value. `box, src` —
    /// width 3.
    SetBoxValueRelease,
    /// Read a box. `box, dst` — width 3.
    BoxValue,
    /// Read a box, retaining the value. `box, dst` — width 3.
    BoxValueRetain,
    /// Enum member literal. `group, member, dst` — width 4.
    Tag,
    /// Symbol literal. `sym, dst` — width 3.
    TagLiteral,
    /// Copy, jumping on error values. `src, dst, offset:u16@3` —
    /// width 5.
    TryValue,
    /// `left & right` on integers. `left, right, dst` — width 4.
    BitwiseAnd,
    /// `left | right` on integers. `left, right, dst` — width 4.
    BitwiseOr,
    /// `left ^ right` on integers. `left, right, dst` — width 4.
    BitwiseXor,
    /// `!src` on integers. `src, dst` — width 3.
    BitwiseNot,
    /// `left << right` on integers. `left, right, dst` — width 4.
    BitwiseLeftShift,
    /// `left >> right` on integers. `left, right, dst` — width 4.
    BitwiseRightShift,
    /// Jump when not `none`. `offset:i16, src` — width 4.
    JumpNotNone,
    /// Typed integer add; wraps mod 2⁴⁸. `left, right, dst` — width 4.
    AddInt,
    /// Typed integer subtract; wraps mod 2⁴⁸. `left, right, dst` —
    /// width 4.
    SubInt,
    /// Typed integer `<`. `left, right, dst` — width 4.
    LessInt,
    /// Set up a numeric for-loop and patch the loop opcode at
    /// `pc + offset` to [`ForRange`](Self::ForRange) or
    /// [`ForRangeReverse`](Self::ForRangeReverse) by direction.
    /// `start, end, step, counter, user, offset:u16@6` — width 8.
    /// When the range is empty, skips to `pc + offset + 7`.
    ForRangeInit,
    /// Forward loop step. `counter, step, end, user, back:u16@5` —
    /// width 7.
    ForRange,
    /// Backward loop step. Same operands — width 7.
    ForRangeReverse,
    /// *Variable.* Multi-way branch on constants.
    /// `expr, n, (const_idx:u16, offset:u16) × n, else_offset:u16` —
    /// width 3+4n+2. Offsets are relative to this instruction.
    Match,
    /// Load a static function as a lambda value. `sym:u16, dst` —
    /// width 4.
    StaticFunc,
    /// Load a static variable (retained). `sym:u16, dst` — width 4.
    StaticVar,
    /// Store a static variable, releasing the previous value.
    /// `sym:u16, src` — width 4.
    SetStaticVar,
    /// Rebind a static function. `sym:u16, src` — width 4.
    SetStaticFunc,
    /// Reflective type handle. `kind, id, dst` — width 4.
    Sym,
    /// End of script; the result is in `src`. `src` — width 2.
    End,
}

impl OpCode {
    pub const COUNT: usize = OpCode::End as usize + 1;

    /// Convert a raw byte to an opcode without a bounds check.
    ///
    /// # Safety
    ///
    /// `byte` must be a valid opcode value (`< OpCode::COUNT`).
    #[inline(always)]
    pub unsafe fn from_u8_unchecked(byte: u8) -> Self {
        debug_assert!(
            (byte as usize) < Self::COUNT,
            "invalid opcode: 0x{byte:02x}"
        );
        core::mem::transmute::<u8, OpCode>(byte)
    }

    /// Fixed instruction width in bytes, or `None` for the
    /// count-dependent opcodes.
    pub const fn fixed_size(self) -> Option<usize> {
        Some(match self {
            OpCode::Ret0 | OpCode::Ret1 => 1,
            OpCode::True
            | OpCode::False
            | OpCode::None
            | OpCode::MapEmpty
            | OpCode::Release
            | OpCode::Retain
            | OpCode::Coyield
            | OpCode::Coreturn
            | OpCode::End => 2,
            OpCode::ConstI8
            | OpCode::ConstI8Int
            | OpCode::Not
            | OpCode::Copy
            | OpCode::CopyReleaseDst
            | OpCode::CopyRetainSrc
            | OpCode::CopyRetainRelease
            | OpCode::Jump
            | OpCode::Call0
            | OpCode::Call1
            | OpCode::Neg
            | OpCode::Coresume
            | OpCode::Box
            | OpCode::SetBoxValue
            | OpCode::SetBoxValueRelease
            | OpCode::BoxValue
            | OpCode::BoxValueRetain
            | OpCode::TagLiteral
            | OpCode::BitwiseNot => 3,
            OpCode::ConstOp
            | OpCode::Add
            | OpCode::Sub
            | OpCode::Mul
            | OpCode::Div
            | OpCode::Pow
            | OpCode::Mod
            | OpCode::SetIndex
            | OpCode::SetIndexRelease
            | OpCode::Index
            | OpCode::ReverseIndex
            | OpCode::List
            | OpCode::JumpNotCond
            | OpCode::JumpCond
            | OpCode::JumpNotNone
            | OpCode::Compare
            | OpCode::CompareNot
            | OpCode::Less
            | OpCode::Greater
            | OpCode::LessEqual
            | OpCode::GreaterEqual
            | OpCode::StringTemplate
            | OpCode::Tag
            | OpCode::BitwiseAnd
            | OpCode::BitwiseOr
            | OpCode::BitwiseXor
            | OpCode::BitwiseLeftShift
            | OpCode::BitwiseRightShift
            | OpCode::AddInt
            | OpCode::SubInt
            | OpCode::LessInt
            | OpCode::StaticFunc
            | OpCode::StaticVar
            | OpCode::SetStaticVar
            | OpCode::SetStaticFunc
            | OpCode::Sym => 4,
            OpCode::Slice | OpCode::TryValue => 5,
            OpCode::Lambda | OpCode::Object | OpCode::ObjectSmall => 6,
            OpCode::ForRange | OpCode::ForRangeReverse => 7,
            OpCode::Field
            | OpCode::FieldIC
            | OpCode::FieldRetain
            | OpCode::FieldRetainIC
            | OpCode::FieldRelease
            | OpCode::SetField
            | OpCode::SetFieldRelease
            | OpCode::SetFieldReleaseIC
            | OpCode::Coinit
            | OpCode::ForRangeInit => 8,
            OpCode::CallObjSym
            | OpCode::CallObjNativeFuncIC
            | OpCode::CallObjFuncIC
            | OpCode::CallSym
            | OpCode::CallFuncIC
            | OpCode::CallNativeFuncIC => 14,
            OpCode::Map
            | OpCode::ReleaseN
            | OpCode::SetInitN
            | OpCode::Closure
            | OpCode::Match => return Option::None,
        })
    }
}

impl TryFrom<u8> for OpCode {
    type Error = u8;

    fn try_from(byte: u8) -> Result<Self, u8> {
        if byte < Self::COUNT as u8 {
            // SAFETY: OpCode is repr(u8) with contiguous variants from 0.
            Ok(unsafe { core::mem::transmute::<u8, OpCode>(byte) })
        } else {
            Err(byte)
        }
    }
}

/// Width of the instruction starting at `pc`, including variable-width
/// opcodes (their count operand is read from the stream).
pub fn instruction_size(ops: &[u8], pc: usize) -> usize {
    let op = OpCode::try_from(ops[pc]).expect("invalid opcode");
    match op.fixed_size() {
        Some(n) => n,
        None => match op {
            OpCode::Map => 4 + 2 * ops[pc + 2] as usize,
            OpCode::ReleaseN | OpCode::SetInitN => 2 + ops[pc + 1] as usize,
            OpCode::Closure => 7 + ops[pc + 4] as usize,
            OpCode::Match => 3 + 4 * ops[pc + 2] as usize + 2,
            _ => unreachable!(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_all_opcodes() {
        for byte in 0..OpCode::COUNT as u8 {
            let op = OpCode::try_from(byte).unwrap();
            assert_eq!(op as u8, byte);
        }
        assert!(OpCode::try_from(OpCode::COUNT as u8).is_err());
        assert!(OpCode::try_from(0xff).is_err());
    }

    #[test]
    fn call_sites_share_one_width() {
        let w = OpCode::CallObjSym.fixed_size();
        for op in [
            OpCode::CallObjNativeFuncIC,
            OpCode::CallObjFuncIC,
            OpCode::CallSym,
            OpCode::CallFuncIC,
            OpCode::CallNativeFuncIC,
        ] {
            assert_eq!(op.fixed_size(), w);
        }
    }

    #[test]
    fn field_sites_share_one_width() {
        let w = OpCode::Field.fixed_size();
        for op in [
            OpCode::FieldIC,
            OpCode::FieldRetain,
            OpCode::FieldRetainIC,
            OpCode::SetField,
            OpCode::SetFieldRelease,
            OpCode::SetFieldReleaseIC,
        ] {
            assert_eq!(op.fixed_size(), w);
        }
    }

    #[test]
    fn loop_patch_targets_share_one_width() {
        assert_eq!(
            OpCode::ForRange.fixed_size(),
            OpCode::ForRangeReverse.fixed_size()
        );
    }

    #[test]
    fn variable_sizes() {
        // Map with 3 keys.
        let ops = [OpCode::Map as u8, 0, 3, 1, 0, 0, 1, 0, 2, 0];
        assert_eq!(instruction_size(&ops, 0), 10);
        // ReleaseN with 2 locals.
        let ops = [OpCode::ReleaseN as u8, 2, 5, 6];
        assert_eq!(instruction_size(&ops, 0), 4);
        // Closure with 2 captures.
        let ops = [OpCode::Closure as u8, 0, 0, 2, 2, 3, 4, 5, 6];
        assert_eq!(instruction_size(&ops, 0), 9);
        // Match with 1 case.
        let ops = [OpCode::Match as u8, 1, 1, 0, 0, 9, 0, 11, 0];
        assert_eq!(instruction_size(&ops, 0), 9);
    }
}
