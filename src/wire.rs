//! Binary form of a compiled script.
//!
//! Little-endian throughout, no magic and no version tag: five element
//! counts, then the instruction array, the global tags, the function and
//! native descriptor arrays, and finally the raw string pool
//! (NUL-terminated UTF-8 strings back to back). Tail flags travel with the
//! instructions, so a loaded script runs without a second optimizer pass.
//! `decode` validates every tag and index before a [`Script`] exists;
//! a hostile file produces a [`WireError`], never a panic.

use std::fs;
use std::path::Path;
use std::rc::Rc;

use crate::bytecode::{Const, FuncDesc, NativeSlot, Op, Script};
use crate::value::Value;

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("unexpected end of input")]
    UnexpectedEof,
    #[error("invalid opcode tag {0}")]
    InvalidOpcode(u8),
    #[error("invalid constant tag {0}")]
    InvalidConstTag(u8),
    #[error("invalid global tag {0}")]
    InvalidGlobalTag(u8),
    #[error("{0} index {1} out of range")]
    IndexOutOfRange(&'static str, u32),
    #[error("string pool is not valid UTF-8")]
    InvalidUtf8,
    #[error("trailing bytes after the script payload")]
    TrailingBytes,
}

const OP_CONST: u8 = 0;
const OP_GLOBAL_READ: u8 = 1;
const OP_LOCAL_READ: u8 = 2;
const OP_LAMBDA: u8 = 3;
const OP_NATIVE: u8 = 4;
const OP_CALL: u8 = 5;
const OP_ADD: u8 = 6;
const OP_SUB: u8 = 7;
const OP_MUL: u8 = 8;
const OP_DIV: u8 = 9;
const OP_EQ: u8 = 10;
const OP_LT: u8 = 11;
const OP_GT: u8 = 12;
const OP_SET: u8 = 13;
const OP_IF: u8 = 14;
const OP_BEGIN: u8 = 15;
const OP_LIST: u8 = 16;
const OP_CAR: u8 = 17;
const OP_CDR: u8 = 18;
const OP_WHILE: u8 = 19;
const OP_END: u8 = 20;

const CONST_INT: u8 = 0;
const CONST_FLOAT: u8 = 1;
const CONST_STR: u8 = 2;

/// Globals always reload as `Unknown`; their values are not part of the
/// compiled form.
const GLOBAL_UNKNOWN: u8 = 0;

pub fn write(script: &Script, path: &Path) -> Result<(), WireError> {
    fs::write(path, encode(script))?;
    Ok(())
}

pub fn load(path: &Path) -> Result<Script, WireError> {
    decode(&fs::read(path)?)
}

pub fn encode(script: &Script) -> Vec<u8> {
    let mut pool = Vec::new();
    for s in &script.strings {
        pool.extend_from_slice(s.as_bytes());
        pool.push(0);
    }

    let mut out = Vec::new();
    put_u32(&mut out, script.code.len() as u32);
    put_u32(&mut out, script.globals.len() as u32);
    put_u32(&mut out, script.funcs.len() as u32);
    put_u32(&mut out, script.natives.len() as u32);
    put_u32(&mut out, pool.len() as u32);
    for op in &script.code {
        put_op(&mut out, op);
    }
    for _ in &script.globals {
        out.push(GLOBAL_UNKNOWN);
    }
    for f in &script.funcs {
        put_u32(&mut out, f.arg_count);
        put_u32(&mut out, f.entry);
        put_u32(&mut out, f.end);
    }
    for n in &script.natives {
        put_u32(&mut out, n.name);
    }
    out.extend_from_slice(&pool);
    out
}

pub fn decode(bytes: &[u8]) -> Result<Script, WireError> {
    let mut r = Reader { buf: bytes, at: 0 };
    let code_len = r.u32()? as usize;
    let global_count = r.u32()? as usize;
    let func_count = r.u32()? as usize;
    let native_count = r.u32()? as usize;
    let pool_len = r.u32()? as usize;

    let mut code = Vec::with_capacity(code_len.min(1 << 16));
    for _ in 0..code_len {
        code.push(read_op(&mut r)?);
    }
    for _ in 0..global_count {
        let tag = r.u8()?;
        if tag != GLOBAL_UNKNOWN {
            return Err(WireError::InvalidGlobalTag(tag));
        }
    }
    let mut funcs = Vec::with_capacity(func_count.min(1 << 16));
    for _ in 0..func_count {
        funcs.push(FuncDesc { arg_count: r.u32()?, entry: r.u32()?, end: r.u32()? });
    }
    let mut natives = Vec::with_capacity(native_count.min(1 << 16));
    for _ in 0..native_count {
        natives.push(NativeSlot { name: r.u32()?, binding: None });
    }
    let pool = r.take(pool_len)?;
    if r.at != bytes.len() {
        return Err(WireError::TrailingBytes);
    }
    let strings = split_pool(pool)?;

    let script = Script {
        code,
        globals: vec![Value::Unknown; global_count],
        funcs,
        natives,
        strings,
    };
    validate(&script)?;
    Ok(script)
}

fn validate(script: &Script) -> Result<(), WireError> {
    let code_len = script.code.len() as u32;
    for op in &script.code {
        match *op {
            Op::Const(Const::Str(i)) if i as usize >= script.strings.len() => {
                return Err(WireError::IndexOutOfRange("string", i));
            }
            Op::GlobalRead(i) if i as usize >= script.globals.len() => {
                return Err(WireError::IndexOutOfRange("global", i));
            }
            Op::Lambda(i) if i as usize >= script.funcs.len() => {
                return Err(WireError::IndexOutOfRange("function", i));
            }
            Op::Native(i) if i as usize >= script.natives.len() => {
                return Err(WireError::IndexOutOfRange("native", i));
            }
            Op::If { second, end } if second > code_len || end > code_len => {
                return Err(WireError::IndexOutOfRange("code", second.max(end)));
            }
            Op::While { end } if end > code_len => {
                return Err(WireError::IndexOutOfRange("code", end));
            }
            _ => {}
        }
    }
    for f in &script.funcs {
        if f.entry > code_len || f.end > code_len {
            return Err(WireError::IndexOutOfRange("code", f.entry.max(f.end)));
        }
    }
    for n in &script.natives {
        if n.name as usize >= script.strings.len() {
            return Err(WireError::IndexOutOfRange("string", n.name));
        }
    }
    Ok(())
}

fn split_pool(pool: &[u8]) -> Result<Vec<Rc<str>>, WireError> {
    if pool.is_empty() {
        return Ok(Vec::new());
    }
    let text = std::str::from_utf8(pool).map_err(|_| WireError::InvalidUtf8)?;
    let mut parts: Vec<&str> = text.split('\0').collect();
    // the pool ends with a terminator, so the final split piece is empty
    if parts.last().is_some_and(|p| p.is_empty()) {
        parts.pop();
    }
    Ok(parts.into_iter().map(Rc::from).collect())
}

// ── encode helpers ───────────────────────────────────────────────────────

fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_op(out: &mut Vec<u8>, op: &Op) {
    match *op {
        Op::Const(c) => {
            out.push(OP_CONST);
            match c {
                Const::Int(i) => {
                    out.push(CONST_INT);
                    out.extend_from_slice(&i.to_le_bytes());
                }
                Const::Float(x) => {
                    out.push(CONST_FLOAT);
                    out.extend_from_slice(&x.to_le_bytes());
                }
                Const::Str(i) => {
                    out.push(CONST_STR);
                    put_u32(out, i);
                }
            }
        }
        Op::GlobalRead(i) => {
            out.push(OP_GLOBAL_READ);
            put_u32(out, i);
        }
        Op::LocalRead(i) => {
            out.push(OP_LOCAL_READ);
            put_u32(out, i);
        }
        Op::Lambda(i) => {
            out.push(OP_LAMBDA);
            put_u32(out, i);
        }
        Op::Native(i) => {
            out.push(OP_NATIVE);
            put_u32(out, i);
        }
        Op::Call { tail } => {
            out.push(OP_CALL);
            out.push(tail as u8);
        }
        Op::Add => out.push(OP_ADD),
        Op::Sub => out.push(OP_SUB),
        Op::Mul => out.push(OP_MUL),
        Op::Div => out.push(OP_DIV),
        Op::Eq => out.push(OP_EQ),
        Op::Lt => out.push(OP_LT),
        Op::Gt => out.push(OP_GT),
        Op::Set => out.push(OP_SET),
        Op::If { second, end } => {
            out.push(OP_IF);
            put_u32(out, second);
            put_u32(out, end);
        }
        Op::Begin => out.push(OP_BEGIN),
        Op::List => out.push(OP_LIST),
        Op::Car => out.push(OP_CAR),
        Op::Cdr => out.push(OP_CDR),
        Op::While { end } => {
            out.push(OP_WHILE);
            put_u32(out, end);
        }
        Op::End => out.push(OP_END),
    }
}

// ── decode helpers ───────────────────────────────────────────────────────

struct Reader<'a> {
    buf: &'a [u8],
    at: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        let end = self.at.checked_add(n).ok_or(WireError::UnexpectedEof)?;
        if end > self.buf.len() {
            return Err(WireError::UnexpectedEof);
        }
        let out = &self.buf[self.at..end];
        self.at = end;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, WireError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i64(&mut self) -> Result<i64, WireError> {
        let b = self.take(8)?;
        let mut a = [0u8; 8];
        a.copy_from_slice(b);
        Ok(i64::from_le_bytes(a))
    }

    fn f64(&mut self) -> Result<f64, WireError> {
        let b = self.take(8)?;
        let mut a = [0u8; 8];
        a.copy_from_slice(b);
        Ok(f64::from_le_bytes(a))
    }
}

fn read_op(r: &mut Reader) -> Result<Op, WireError> {
    Ok(match r.u8()? {
        OP_CONST => Op::Const(match r.u8()? {
            CONST_INT => Const::Int(r.i64()?),
            CONST_FLOAT => Const::Float(r.f64()?),
            CONST_STR => Const::Str(r.u32()?),
            other => return Err(WireError::InvalidConstTag(other)),
        }),
        OP_GLOBAL_READ => Op::GlobalRead(r.u32()?),
        OP_LOCAL_READ => Op::LocalRead(r.u32()?),
        OP_LAMBDA => Op::Lambda(r.u32()?),
        OP_NATIVE => Op::Native(r.u32()?),
        OP_CALL => Op::Call { tail: r.u8()? != 0 },
        OP_ADD => Op::Add,
        OP_SUB => Op::Sub,
        OP_MUL => Op::Mul,
        OP_DIV => Op::Div,
        OP_EQ => Op::Eq,
        OP_LT => Op::Lt,
        OP_GT => Op::Gt,
        OP_SET => Op::Set,
        OP_IF => Op::If { second: r.u32()?, end: r.u32()? },
        OP_BEGIN => Op::Begin,
        OP_LIST => Op::List,
        OP_CAR => Op::Car,
        OP_CDR => Op::Cdr,
        OP_WHILE => Op::While { end: r.u32()? },
        OP_END => Op::End,
        other => return Err(WireError::InvalidOpcode(other)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::compile;

    fn roundtrip(src: &str) -> (Script, Script) {
        let original = compile(src, "test").unwrap();
        let loaded = decode(&encode(&original)).unwrap();
        (original, loaded)
    }

    #[test]
    fn structural_roundtrip() {
        let (a, b) = roundtrip(
            r#"(define f (lambda (n) (if (< n 1) "done" (f (- n 1))))) (native "tick") (f 3)"#,
        );
        assert_eq!(a.code, b.code);
        assert_eq!(a.funcs, b.funcs);
        assert_eq!(a.globals.len(), b.globals.len());
        assert_eq!(a.strings, b.strings);
        assert_eq!(a.natives.len(), b.natives.len());
        assert_eq!(a.natives[0].name, b.natives[0].name);
        assert!(b.natives[0].binding.is_none());
    }

    #[test]
    fn empty_program_roundtrip() {
        let (a, b) = roundtrip("");
        assert_eq!(a.code, b.code);
        assert!(b.strings.is_empty());
    }

    #[test]
    fn truncated_input_is_rejected() {
        let bytes = encode(&compile("(+ 1 2)", "test").unwrap());
        for cut in [0, 4, bytes.len() / 2, bytes.len() - 1] {
            assert!(matches!(decode(&bytes[..cut]), Err(WireError::UnexpectedEof)), "cut {cut}");
        }
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let mut bytes = encode(&compile("1", "test").unwrap());
        bytes.push(0);
        assert!(matches!(decode(&bytes), Err(WireError::TrailingBytes)));
    }

    #[test]
    fn bad_opcode_is_rejected() {
        let mut bytes = Vec::new();
        for count in [1u32, 0, 0, 0, 0] {
            bytes.extend_from_slice(&count.to_le_bytes());
        }
        bytes.push(99);
        assert!(matches!(decode(&bytes), Err(WireError::InvalidOpcode(99))));
    }

    #[test]
    fn out_of_range_indices_are_rejected() {
        let mut script = compile("(define x 1) x", "test").unwrap();
        script.code[1] = Op::GlobalRead(7);
        assert!(matches!(
            decode(&encode(&script)),
            Err(WireError::IndexOutOfRange("global", 7))
        ));
    }

    #[test]
    fn loaded_scripts_run() {
        let mut original =
            compile("(define f (lambda (n) (* n n))) (f 9)", "test").unwrap();
        crate::optimizer::mark_tail_calls(&mut original);
        let mut loaded = decode(&encode(&original)).unwrap();
        assert_eq!(loaded.run().unwrap(), "81");
    }
}
