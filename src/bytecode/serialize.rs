//! The on-disk module format.
//!
//! Little-endian throughout: a 4-byte magic, a version byte, six `u32`
//! section lengths (`main`, `code.op`, `code.data`, `extra`, `strings`,
//! `debug.lines`), then the arrays verbatim. Compatibility requires an
//! exact version match, and `to_bytes` followed by `from_bytes` yields a
//! module that re-serializes to identical bytes.

use crate::bytecode::instruction::{Data, Op};
use crate::bytecode::module::{Bytecode, Code, DebugInfo};
use crate::error::{DecodeError, EncodeError};

pub const MAGIC: [u8; 4] = *b"ORYX";
pub const VERSION: u8 = 1;

/// Serialize a module.
pub fn to_bytes(module: &Bytecode) -> Result<Vec<u8>, EncodeError> {
    let sections = [
        module.main.len(),
        module.code.op.len(),
        module.code.data.len(),
        module.extra.len(),
        module.strings.len(),
        module.debug.lines.len(),
    ];
    for &len in &sections {
        if len > u32::MAX as usize {
            return Err(EncodeError::SectionTooLarge(len));
        }
    }

    let mut out = Vec::new();
    out.extend_from_slice(&MAGIC);
    out.push(VERSION);
    for &len in &sections {
        out.extend_from_slice(&(len as u32).to_le_bytes());
    }
    for &word in &module.main {
        out.extend_from_slice(&word.to_le_bytes());
    }
    for &op in &module.code.op {
        out.push(op as u8);
    }
    for &data in &module.code.data {
        out.extend_from_slice(&data.0.to_le_bytes());
    }
    for &word in &module.extra {
        out.extend_from_slice(&word.to_le_bytes());
    }
    out.extend_from_slice(&module.strings);
    for &(index, offset) in &module.debug.lines {
        out.extend_from_slice(&index.to_le_bytes());
        out.extend_from_slice(&offset.to_le_bytes());
    }
    Ok(out)
}

/// Deserialize a module. The source path and text are not part of the
/// format; the debug line map alone survives.
pub fn from_bytes(bytes: &[u8]) -> Result<Bytecode, DecodeError> {
    let mut reader = Reader { bytes, at: 0 };

    let magic = reader.take(4, "magic")?;
    if magic != MAGIC {
        return Err(DecodeError::BadMagic);
    }
    let version = reader.u8("version")?;
    if version != VERSION {
        return Err(DecodeError::BadVersion(version));
    }

    let main_len = reader.u32("main length")? as usize;
    let op_len = reader.u32("code.op length")? as usize;
    let data_len = reader.u32("code.data length")? as usize;
    let extra_len = reader.u32("extra length")? as usize;
    let strings_len = reader.u32("strings length")? as usize;
    let lines_len = reader.u32("debug lines length")? as usize;

    let mut main = Vec::with_capacity(main_len);
    for _ in 0..main_len {
        main.push(reader.u32("main")?);
    }
    let mut op = Vec::with_capacity(op_len);
    for _ in 0..op_len {
        let byte = reader.u8("code.op")?;
        op.push(Op::from_u8(byte).ok_or(DecodeError::BadOpcode(byte))?);
    }
    let mut data = Vec::with_capacity(data_len);
    for _ in 0..data_len {
        data.push(Data(reader.u64("code.data")?));
    }
    let mut extra = Vec::with_capacity(extra_len);
    for _ in 0..extra_len {
        extra.push(reader.u32("extra")?);
    }
    let strings = reader.take(strings_len, "strings")?.to_vec();
    std::str::from_utf8(&strings).map_err(|_| DecodeError::BadStringPool)?;
    let mut lines = Vec::with_capacity(lines_len);
    for _ in 0..lines_len {
        let index = reader.u32("debug lines")?;
        let offset = reader.u32("debug lines")?;
        lines.push((index, offset));
    }

    if reader.at != bytes.len() {
        return Err(DecodeError::TrailingBytes);
    }

    Ok(Bytecode {
        code: Code { op, data },
        extra,
        main,
        strings,
        debug: DebugInfo {
            path: String::new(),
            source: String::new(),
            lines,
        },
    })
}

struct Reader<'a> {
    bytes: &'a [u8],
    at: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize, what: &'static str) -> Result<&'a [u8], DecodeError> {
        if self.at + n > self.bytes.len() {
            return Err(DecodeError::Truncated(what));
        }
        let slice = &self.bytes[self.at..self.at + n];
        self.at += n;
        Ok(slice)
    }

    fn u8(&mut self, what: &'static str) -> Result<u8, DecodeError> {
        Ok(self.take(1, what)?[0])
    }

    fn u32(&mut self, what: &'static str) -> Result<u32, DecodeError> {
        let slice = self.take(4, what)?;
        Ok(u32::from_le_bytes([slice[0], slice[1], slice[2], slice[3]]))
    }

    fn u64(&mut self, what: &'static str) -> Result<u64, DecodeError> {
        let slice = self.take(8, what)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(slice);
        Ok(u64::from_le_bytes(buf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::compiler;
    use crate::lexer::Scanner;
    use crate::parser::Parser;

    fn compile_source(source: &str) -> Bytecode {
        let tokens = Scanner::new(source).scan_tokens().expect("scan failed");
        let program = Parser::new(tokens).parse().expect("parse failed");
        compiler::compile("<test>", source, &program).expect("compile failed")
    }

    #[test]
    fn test_roundtrip_is_bitwise_identical() {
        let module = compile_source(
            "let mk = fn(n) fn() n\nlet g = mk(7)\nlet acc = []\nfor x in 1:4 acc.append(x)\ng() + acc[0]",
        );
        let bytes = to_bytes(&module).expect("encode failed");
        let decoded = from_bytes(&bytes).expect("decode failed");
        let bytes_again = to_bytes(&decoded).expect("re-encode failed");
        assert_eq!(bytes, bytes_again);
        assert_eq!(decoded.code, module.code);
        assert_eq!(decoded.extra, module.extra);
        assert_eq!(decoded.main, module.main);
        assert_eq!(decoded.strings, module.strings);
        assert_eq!(decoded.debug.lines, module.debug.lines);
    }

    #[test]
    fn test_bad_magic_rejected() {
        let module = compile_source("1 + 2");
        let mut bytes = to_bytes(&module).expect("encode failed");
        bytes[0] = b'X';
        assert!(matches!(from_bytes(&bytes), Err(DecodeError::BadMagic)));
    }

    #[test]
    fn test_version_mismatch_rejected() {
        let module = compile_source("1 + 2");
        let mut bytes = to_bytes(&module).expect("encode failed");
        bytes[4] = VERSION + 1;
        assert!(matches!(from_bytes(&bytes), Err(DecodeError::BadVersion(_))));
    }

    #[test]
    fn test_truncated_rejected() {
        let module = compile_source("1 + 2");
        let bytes = to_bytes(&module).expect("encode failed");
        assert!(matches!(
            from_bytes(&bytes[..bytes.len() - 1]),
            Err(DecodeError::Truncated(_))
        ));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let module = compile_source("1 + 2");
        let mut bytes = to_bytes(&module).expect("encode failed");
        bytes.push(0);
        assert!(matches!(from_bytes(&bytes), Err(DecodeError::TrailingBytes)));
    }
}
