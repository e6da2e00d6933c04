//! The compiled-chunk format: opcodes, builder, binary serialisation
//! and disassembly.
//!
//! A [`Chunk`] is what the compiler front end hands to the VM: a
//! constant pool, an instruction buffer and the symbol tables the
//! interpreter resolves against. The instruction encoding is fixed
//! width per opcode, little-endian, with jump offsets relative to the
//! first byte of the jump instruction.

mod builder;
mod chunk;
mod dump;
mod op;
mod serialize;

pub use builder::{ChunkBuilder, JumpPatch};
pub use chunk::{Chunk, ChunkString, DebugSym, FuncInfo};
pub use dump::{disasm_at, dump};
pub use op::{instruction_size, OpCode};
pub use serialize::{load, serialize, ChunkLoadError};
