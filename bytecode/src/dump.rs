//! Instruction disassembler, used by the trace facility and tests.

use crate::op::{instruction_size, OpCode};

fn u16_at(ops: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([ops[at], ops[at + 1]])
}

fn u48_at(ops: &[u8], at: usize) -> u64 {
    let mut v = 0u64;
    for i in (0..6).rev() {
        v = (v << 8) | ops[at + i] as u64;
    }
    v
}

/// Renders the instruction at `pc` and returns it with its width.
pub fn disasm_at(ops: &[u8], pc: usize) -> (String, usize) {
    let size = instruction_size(ops, pc);
    let op = OpCode::try_from(ops[pc]).expect("invalid opcode");
    let b = |i: usize| ops[pc + i];
    let text = match op {
        OpCode::ConstOp => {
            format!("ConstOp c{} r{}", u16_at(ops, pc + 1), b(3))
        }
        OpCode::ConstI8 => format!("ConstI8 {} r{}", b(1) as i8, b(2)),
        OpCode::ConstI8Int => format!("ConstI8Int {} r{}", b(1) as i8, b(2)),
        OpCode::True => format!("True r{}", b(1)),
        OpCode::False => format!("False r{}", b(1)),
        OpCode::None => format!("None r{}", b(1)),
        OpCode::Not | OpCode::Neg | OpCode::BitwiseNot => {
            format!("{op:?} r{} r{}", b(1), b(2))
        }
        OpCode::Copy
        | OpCode::CopyReleaseDst
        | OpCode::CopyRetainSrc
        | OpCode::CopyRetainRelease => {
            format!("{op:?} r{} r{}", b(1), b(2))
        }
        OpCode::Retain | OpCode::Release => format!("{op:?} r{}", b(1)),
        OpCode::ReleaseN | OpCode::SetInitN => {
            let n = b(1) as usize;
            let locals: Vec<String> = (0..n)
                .map(|i| format!("r{}", b(2 + i)))
                .collect();
            format!("{op:?} {}", locals.join(" "))
        }
        OpCode::Add
        | OpCode::Sub
        | OpCode::Mul
        | OpCode::Div
        | OpCode::Pow
        | OpCode::Mod
        | OpCode::AddInt
        | OpCode::SubInt
        | OpCode::LessInt
        | OpCode::Compare
        | OpCode::CompareNot
        | OpCode::Less
        | OpCode::Greater
        | OpCode::LessEqual
        | OpCode::GreaterEqual
        | OpCode::BitwiseAnd
        | OpCode::BitwiseOr
        | OpCode::BitwiseXor
        | OpCode::BitwiseLeftShift
        | OpCode::BitwiseRightShift
        | OpCode::Index
        | OpCode::ReverseIndex
        | OpCode::SetIndex
        | OpCode::SetIndexRelease => {
            format!("{op:?} r{} r{} r{}", b(1), b(2), b(3))
        }
        OpCode::List => format!("List r{}..{} r{}", b(1), b(2), b(3)),
        OpCode::Map => {
            let n = b(2) as usize;
            let keys: Vec<String> = (0..n)
                .map(|i| format!("c{}", u16_at(ops, pc + 4 + 2 * i)))
                .collect();
            format!("Map r{} [{}] r{}", b(1), keys.join(" "), b(3))
        }
        OpCode::MapEmpty => format!("MapEmpty r{}", b(1)),
        OpCode::Slice => {
            format!("Slice r{} r{} r{} r{}", b(1), b(2), b(3), b(4))
        }
        OpCode::Jump => {
            format!("Jump {:+}", u16_at(ops, pc + 1) as i16)
        }
        OpCode::JumpCond | OpCode::JumpNotCond | OpCode::JumpNotNone => {
            format!("{op:?} {:+} r{}", u16_at(ops, pc + 1) as i16, b(3))
        }
        OpCode::CallObjSym
        | OpCode::CallObjNativeFuncIC
        | OpCode::CallObjFuncIC => format!(
            "{op:?} r{} {} {} #{} [0x{:x} t{}]",
            b(1),
            b(2),
            b(3),
            b(4),
            u48_at(ops, pc + 6),
            u16_at(ops, pc + 12),
        ),
        OpCode::CallSym | OpCode::CallFuncIC | OpCode::CallNativeFuncIC => {
            format!(
                "{op:?} r{} {} {} #{} [0x{:x}]",
                b(1),
                b(2),
                b(3),
                u16_at(ops, pc + 4),
                u48_at(ops, pc + 6),
            )
        }
        OpCode::Ret0 | OpCode::Ret1 => format!("{op:?}"),
        OpCode::Call0 | OpCode::Call1 => {
            format!("{op:?} r{} {}", b(1), b(2))
        }
        OpCode::Field
        | OpCode::FieldIC
        | OpCode::FieldRetain
        | OpCode::FieldRetainIC
        | OpCode::FieldRelease => format!(
            "{op:?} r{} r{} #{} [t{} +{}]",
            b(1),
            b(2),
            b(3),
            u16_at(ops, pc + 4),
            b(6),
        ),
        OpCode::SetField
        | OpCode::SetFieldRelease
        | OpCode::SetFieldReleaseIC => format!(
            "{op:?} r{} #{} r{} [t{} +{}]",
            b(1),
            b(2),
            b(3),
            u16_at(ops, pc + 4),
            b(6),
        ),
        OpCode::Lambda => format!(
            "Lambda @{} {} {} r{}",
            u16_at(ops, pc + 1),
            b(3),
            b(4),
            b(5),
        ),
        OpCode::Closure => {
            let n = b(3) as usize;
            let caps: Vec<String> =
                (0..n).map(|i| format!("r{}", b(7 + i))).collect();
            format!(
                "Closure @{} {} [{}] r{}",
                u16_at(ops, pc + 1),
                b(3),
                caps.join(" "),
                b(6),
            )
        }
        OpCode::StringTemplate => {
            format!("StringTemplate r{} {} r{}", b(1), b(2), b(3))
        }
        OpCode::ObjectSmall | OpCode::Object => format!(
            "{op:?} t{} r{} {} r{}",
            u16_at(ops, pc + 1),
            b(3),
            b(4),
            b(5),
        ),
        OpCode::Coinit => format!(
            "Coinit r{} {} {} r{} skip{:+}",
            b(1),
            b(2),
            b(3),
            b(4),
            u16_at(ops, pc + 5) as i16,
        ),
        OpCode::Coyield | OpCode::Coreturn => {
            format!("{op:?} r{}", b(1))
        }
        OpCode::Coresume => format!("Coresume r{} r{}", b(1), b(2)),
        OpCode::Box => format!("Box r{} r{}", b(1), b(2)),
        OpCode::SetBoxValue
        | OpCode::SetBoxValueRelease
        | OpCode::BoxValue
        | OpCode::BoxValueRetain => {
            format!("{op:?} r{} r{}", b(1), b(2))
        }
        OpCode::Tag => format!("Tag {}.{} r{}", b(1), b(2), b(3)),
        OpCode::TagLiteral => format!("TagLiteral #{} r{}", b(1), b(2)),
        OpCode::TryValue => format!(
            "TryValue r{} r{} {:+}",
            b(1),
            b(2),
            u16_at(ops, pc + 3) as i16,
        ),
        OpCode::ForRangeInit => format!(
            "ForRangeInit r{} r{} r{} r{} r{} @{:+}",
            b(1),
            b(2),
            b(3),
            b(4),
            b(5),
            u16_at(ops, pc + 6) as i16,
        ),
        OpCode::ForRange | OpCode::ForRangeReverse => format!(
            "{op:?} r{} r{} r{} r{} back{}",
            b(1),
            b(2),
            b(3),
            b(4),
            u16_at(ops, pc + 5),
        ),
        OpCode::Match => {
            let n = b(2) as usize;
            let cases: Vec<String> = (0..n)
                .map(|i| {
                    format!(
                        "c{}->{:+}",
                        u16_at(ops, pc + 3 + 4 * i),
                        u16_at(ops, pc + 3 + 4 * i + 2) as i16,
                    )
                })
                .collect();
            format!(
                "Match r{} [{}] else{:+}",
                b(1),
                cases.join(" "),
                u16_at(ops, pc + 3 + 4 * n) as i16,
            )
        }
        OpCode::StaticFunc | OpCode::StaticVar => {
            format!("{op:?} #{} r{}", u16_at(ops, pc + 1), b(3))
        }
        OpCode::SetStaticVar | OpCode::SetStaticFunc => {
            format!("{op:?} #{} r{}", u16_at(ops, pc + 1), b(3))
        }
        OpCode::Sym => format!("Sym {} {} r{}", b(1), b(2), b(3)),
        OpCode::End => format!("End r{}", b(1)),
    };
    (text, size)
}

/// Disassembles a whole instruction buffer, one instruction per line.
pub fn dump(ops: &[u8]) -> String {
    let mut out = String::new();
    let mut pc = 0;
    while pc < ops.len() {
        let (text, size) = disasm_at(ops, pc);
        out.push_str(&format!("{pc:04} {text}\n"));
        pc += size;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::ChunkBuilder;
    use object::Value;

    #[test]
    fn dump_walks_every_instruction() {
        let mut b = ChunkBuilder::new();
        let c = b.add_const(Value::from_f64(3.5));
        b.const_op(c, 4);
        b.const_i8_int(7, 5);
        b.add_int(4, 5, 6);
        let j = b.jump_not_cond(6);
        b.list(4, 2, 7);
        b.bind(j);
        b.end(6);
        let chunk = b.finish(8);

        let text = dump(&chunk.ops);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 6);
        assert!(lines[0].contains("ConstOp c0 r4"));
        assert!(lines[1].contains("ConstI8Int 7 r5"));
        assert!(lines[3].contains("JumpNotCond"));
        assert!(lines[5].contains("End r6"));
    }

    #[test]
    fn disasm_reports_widths() {
        let mut b = ChunkBuilder::new();
        b.call_obj_sym(4, 1, 1, 0);
        b.ret0();
        let chunk = b.finish(8);
        let (text, size) = disasm_at(&chunk.ops, 0);
        assert!(text.starts_with("CallObjSym"));
        assert_eq!(size, 14);
        let (text, size) = disasm_at(&chunk.ops, 14);
        assert_eq!(text, "Ret0");
        assert_eq!(size, 1);
    }
}
