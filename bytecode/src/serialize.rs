//! Binary chunk format.
//!
//! Little-endian throughout: a magic/version header, section counts,
//! the constant pool as packed value bit patterns, the string table,
//! the instruction bytes verbatim, then the symbol and debug tables.
//! Loading then serialising a chunk reproduces the instruction byte
//! sequence and the constant pool exactly.

use object::Value;
use thiserror::Error;

use crate::chunk::{Chunk, ChunkString, DebugSym, FuncInfo};

const MAGIC: [u8; 4] = *b"FUNK";
const VERSION: u16 = 1;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChunkLoadError {
    #[error("bad magic bytes")]
    BadMagic,
    #[error("unsupported chunk version {0}")]
    UnsupportedVersion(u16),
    #[error("truncated chunk (wanted {wanted} more bytes at offset {at})")]
    Truncated { at: usize, wanted: usize },
    #[error("invalid UTF-8 in symbol table")]
    InvalidSymbol,
}

pub fn serialize(chunk: &Chunk) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&MAGIC);
    out.extend_from_slice(&VERSION.to_le_bytes());

    write_u32(&mut out, chunk.consts.len() as u32);
    for c in &chunk.consts {
        out.extend_from_slice(&c.raw().to_le_bytes());
    }

    write_u32(&mut out, chunk.strings.len() as u32);
    for s in &chunk.strings {
        out.push(s.ascii as u8);
        write_u32(&mut out, s.char_len);
        write_bytes(&mut out, &s.bytes);
    }

    write_bytes(&mut out, &chunk.ops);

    write_u32(&mut out, chunk.funcs.len() as u32);
    for f in &chunk.funcs {
        write_u32(&mut out, f.pc);
        out.push(f.num_params);
        out.push(f.stack_size);
        out.extend_from_slice(&f.sym.to_le_bytes());
        write_bytes(&mut out, &f.retained_locals);
    }

    write_syms(&mut out, &chunk.method_syms);
    write_syms(&mut out, &chunk.static_syms);
    write_syms(&mut out, &chunk.error_syms);

    out.push(chunk.main_stack_size);
    write_bytes(&mut out, &chunk.main_retained_locals);

    write_u32(&mut out, chunk.debug.len() as u32);
    for d in &chunk.debug {
        write_u32(&mut out, d.pc);
        write_u32(&mut out, d.line);
        write_u32(&mut out, d.col);
    }

    out
}

pub fn load(bytes: &[u8]) -> Result<Chunk, ChunkLoadError> {
    let mut r = Reader { bytes, pos: 0 };
    if r.take(4)? != MAGIC {
        return Err(ChunkLoadError::BadMagic);
    }
    let version = r.u16()?;
    if version != VERSION {
        return Err(ChunkLoadError::UnsupportedVersion(version));
    }

    let mut chunk = Chunk::new();

    let n = r.u32()? as usize;
    chunk.consts.reserve(n);
    for _ in 0..n {
        chunk.consts.push(Value::from_raw(r.u64()?));
    }

    let n = r.u32()? as usize;
    for _ in 0..n {
        let ascii = r.u8()? != 0;
        let char_len = r.u32()?;
        let bytes = r.bytes()?.to_vec();
        chunk.strings.push(ChunkString {
            ascii,
            char_len,
            bytes,
        });
    }

    chunk.ops = r.bytes()?.to_vec();

    let n = r.u32()? as usize;
    for _ in 0..n {
        let pc = r.u32()?;
        let num_params = r.u8()?;
        let stack_size = r.u8()?;
        let sym = r.u16()?;
        let retained_locals = r.bytes()?.to_vec();
        chunk.funcs.push(FuncInfo {
            pc,
            num_params,
            stack_size,
            retained_locals,
            sym,
        });
    }

    chunk.method_syms = read_syms(&mut r)?;
    chunk.static_syms = read_syms(&mut r)?;
    chunk.error_syms = read_syms(&mut r)?;

    chunk.main_stack_size = r.u8()?;
    chunk.main_retained_locals = r.bytes()?.to_vec();

    let n = r.u32()? as usize;
    for _ in 0..n {
        chunk.debug.push(DebugSym {
            pc: r.u32()?,
            line: r.u32()?,
            col: r.u32()?,
        });
    }

    Ok(chunk)
}

fn write_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn write_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    write_u32(out, bytes.len() as u32);
    out.extend_from_slice(bytes);
}

fn write_syms(out: &mut Vec<u8>, syms: &[String]) {
    write_u32(out, syms.len() as u32);
    for s in syms {
        write_bytes(out, s.as_bytes());
    }
}

fn read_syms(r: &mut Reader<'_>) -> Result<Vec<String>, ChunkLoadError> {
    let n = r.u32()? as usize;
    let mut syms = Vec::with_capacity(n);
    for _ in 0..n {
        let bytes = r.bytes()?;
        let s = core::str::from_utf8(bytes)
            .map_err(|_| ChunkLoadError::InvalidSymbol)?;
        syms.push(s.to_string());
    }
    Ok(syms)
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], ChunkLoadError> {
        if self.pos + n > self.bytes.len() {
            return Err(ChunkLoadError::Truncated {
                at: self.pos,
                wanted: self.pos + n - self.bytes.len(),
            });
        }
        let out = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, ChunkLoadError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, ChunkLoadError> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn u32(&mut self) -> Result<u32, ChunkLoadError> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64, ChunkLoadError> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn bytes(&mut self) -> Result<&'a [u8], ChunkLoadError> {
        let n = self.u32()? as usize;
        self.take(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::ChunkBuilder;

    fn sample_chunk() -> Chunk {
        let mut b = ChunkBuilder::new();
        let one = b.add_const(Value::from_f64(1.0));
        let s = b.add_string_const("hello 🦊");
        b.method_sym("append");
        b.static_sym("counter");
        b.error_sym("OutOfBounds");
        b.add_func(20, 1, 8, &[4, 5], u16::MAX);
        b.debug_sym(1, 0);
        b.const_op(one, 4);
        b.const_op(s, 5);
        b.add(4, 5, 6);
        b.end(6);
        b.finish_with_retained(8, &[5])
    }

    #[test]
    fn round_trip_preserves_everything() {
        let chunk = sample_chunk();
        let bytes = serialize(&chunk);
        let loaded = load(&bytes).unwrap();
        assert_eq!(loaded, chunk);
        // Instruction bytes and constants survive bit-exactly.
        assert_eq!(loaded.ops, chunk.ops);
        assert_eq!(
            loaded.consts.iter().map(|v| v.raw()).collect::<Vec<_>>(),
            chunk.consts.iter().map(|v| v.raw()).collect::<Vec<_>>()
        );
    }

    #[test]
    fn serialise_is_idempotent() {
        let chunk = sample_chunk();
        let bytes = serialize(&chunk);
        let again = serialize(&load(&bytes).unwrap());
        assert_eq!(bytes, again);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = serialize(&sample_chunk());
        bytes[0] = b'X';
        assert_eq!(load(&bytes), Err(ChunkLoadError::BadMagic));
    }

    #[test]
    fn rejects_wrong_version() {
        let mut bytes = serialize(&sample_chunk());
        bytes[4] = 0xfe;
        assert!(matches!(
            load(&bytes),
            Err(ChunkLoadError::UnsupportedVersion(_))
        ));
    }

    #[test]
    fn rejects_truncation() {
        let bytes = serialize(&sample_chunk());
        for cut in [3, 5, 9, bytes.len() - 1] {
            assert!(matches!(
                load(&bytes[..cut]),
                Err(ChunkLoadError::Truncated { .. })
            ));
        }
    }
}
