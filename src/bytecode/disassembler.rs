//! Bytecode disassembler for debugging.

use crate::bytecode::instruction::{Data, Op, PRIM_FALSE, PRIM_NULL, PRIM_TRUE};
use crate::bytecode::module::Bytecode;
use std::fmt::Write;

/// Disassemble a whole module: the top-level body first, then every
/// function body in creation order.
pub fn disassemble_module(module: &Bytecode) -> String {
    let mut output = String::new();
    writeln!(&mut output, "== main ==").unwrap();
    disassemble_body(module, &module.main, 0, &mut output);

    let mut bodies: Vec<(u32, u32, Vec<u32>)> = Vec::new();
    collect_functions(module, &module.main, &mut bodies);
    for (code_index, arity, body) in bodies {
        writeln!(&mut output).unwrap();
        writeln!(&mut output, "== fn @{} (arity: {}) ==", code_index, arity).unwrap();
        disassemble_body(module, &body, arity, &mut output);
    }
    output
}

fn collect_functions(module: &Bytecode, body: &[u32], out: &mut Vec<(u32, u32, Vec<u32>)>) {
    for &code_index in body {
        let op = module.code.op[code_index as usize];
        let data = module.code.data[code_index as usize];
        if matches!(op, Op::BuildFunc | Op::BuildFuncCapture) {
            let (offset, len) = data.as_slice();
            let words = module.get_extra(offset, len);
            let (arity, nested) = match op {
                Op::BuildFunc => (words[0], words[1..].to_vec()),
                _ => {
                    let ncaps = words[1] as usize;
                    (words[0], words[2 + ncaps..].to_vec())
                }
            };
            collect_functions(module, &nested, out);
            out.push((code_index, arity, nested));
        }
    }
}

/// Disassemble one body (a slice of code indices).
pub fn disassemble_body(module: &Bytecode, body: &[u32], arity: u32, output: &mut String) {
    for (pos, &code_index) in body.iter().enumerate() {
        let op = module.code.op[code_index as usize];
        let data = module.code.data[code_index as usize];
        write!(output, "{:4}  ", pos).unwrap();
        if op.has_result() {
            write!(output, "%{:<3} = ", arity + pos as u32).unwrap();
        } else {
            write!(output, "       ").unwrap();
        }
        write!(output, "{}", op.name()).unwrap();
        write_operands(module, op, data, pos, output);
        writeln!(output).unwrap();
    }
}

fn write_operands(module: &Bytecode, op: Op, data: Data, pos: usize, output: &mut String) {
    match op {
        Op::Nop
        | Op::BuildErrorNull
        | Op::LoadThis
        | Op::PopErrHandler
        | Op::RetNull => {}
        Op::Primitive => {
            let name = match data.as_primitive() {
                PRIM_NULL => "null",
                PRIM_TRUE => "true",
                PRIM_FALSE => "false",
                _ => "?",
            };
            write!(output, " {}", name).unwrap();
        }
        Op::Int => write!(output, " {}", data.as_int()).unwrap(),
        Op::Num => write!(output, " {}", data.as_num()).unwrap(),
        Op::Str | Op::BuildTaggedNull | Op::Import | Op::Native => {
            let (offset, len) = data.as_slice();
            write!(output, " {:?}", module.get_string(offset, len)).unwrap();
        }
        Op::BuildTuple | Op::BuildList | Op::BuildMap => {
            let (offset, len) = data.as_slice();
            let refs = module.get_extra(offset, len);
            write!(output, " [").unwrap();
            for (i, r) in refs.iter().enumerate() {
                if i > 0 {
                    write!(output, " ").unwrap();
                }
                write!(output, "%{}", r).unwrap();
            }
            write!(output, "]").unwrap();
        }
        Op::BuildFunc | Op::BuildFuncCapture => {
            let (offset, len) = data.as_slice();
            let words = module.get_extra(offset, len);
            let arity = words[0];
            match op {
                Op::BuildFunc => {
                    write!(output, " arity={} body_len={}", arity, len - 1).unwrap();
                }
                _ => {
                    let ncaps = words[1] as usize;
                    write!(output, " arity={} captures=[", arity).unwrap();
                    for (i, c) in words[2..2 + ncaps].iter().enumerate() {
                        if i > 0 {
                            write!(output, " ").unwrap();
                        }
                        write!(output, "%{}", c).unwrap();
                    }
                    write!(output, "] body_len={}", len as usize - 2 - ncaps).unwrap();
                }
            }
        }
        Op::BuildTagged | Op::UnwrapTagged | Op::UnwrapTaggedOrNull => {
            let (operand, extra) = data.as_range();
            let words = module.get_extra(extra, 2);
            let name = module.get_string(words[0], words[1]);
            write!(output, " %{} .{}", operand, name).unwrap();
        }
        Op::BuildRangeStep | Op::Set => {
            let (start, extra) = data.as_range();
            let words = module.get_extra(extra, 2);
            write!(output, " %{} %{} %{}", start, words[0], words[1]).unwrap();
        }
        Op::Discard
        | Op::CopyUn
        | Op::BuildError
        | Op::UnwrapError
        | Op::Negate
        | Op::BoolNot
        | Op::BitNot
        | Op::IterInit
        | Op::CallZero
        | Op::Ret
        | Op::Throw => {
            write!(output, " %{}", data.as_un()).unwrap();
        }
        Op::LoadGlobal => write!(output, " global[{}]", data.as_un()).unwrap(),
        Op::LoadCapture => write!(output, " capture[{}]", data.as_un()).unwrap(),
        Op::Copy | Op::Move => {
            let (dst, src) = data.as_bin();
            write!(output, " %{} <- %{}", dst, src).unwrap();
        }
        Op::CheckLen | Op::AssertLen => {
            let (operand, len) = data.as_bin();
            write!(output, " %{} len={}", operand, len).unwrap();
        }
        Op::DivFloor
        | Op::Div
        | Op::Mul
        | Op::Pow
        | Op::Rem
        | Op::Add
        | Op::Sub
        | Op::LShift
        | Op::RShift
        | Op::BitAnd
        | Op::BitOr
        | Op::BitXor
        | Op::Equal
        | Op::NotEqual
        | Op::LessThan
        | Op::LessThanEqual
        | Op::GreaterThan
        | Op::GreaterThanEqual
        | Op::In
        | Op::Append
        | Op::BuildRange
        | Op::Get
        | Op::GetOrNull
        | Op::CallOne
        | Op::ThisCallZero => {
            let (lhs, rhs) = data.as_bin();
            write!(output, " %{} %{}", lhs, rhs).unwrap();
        }
        Op::As | Op::Is => {
            let (operand, ty) = data.as_bin_ty();
            let name = ty.map(|t| t.name()).unwrap_or("?");
            write!(output, " %{} {}", operand, name).unwrap();
        }
        Op::Jump => {
            let offset = data.as_jump();
            write!(output, " -> {}", pos as i64 + offset as i64).unwrap();
        }
        Op::JumpIfTrue
        | Op::JumpIfFalse
        | Op::JumpIfNull
        | Op::UnwrapErrorOrJump
        | Op::PushErrHandler
        | Op::IterNext => {
            let (operand, offset) = data.as_jump_condition();
            write!(output, " %{} -> {}", operand, pos as i64 + offset as i64).unwrap();
        }
        Op::Call | Op::ThisCall => {
            let (offset, len) = data.as_slice();
            let refs = module.get_extra(offset, len);
            write!(output, " [").unwrap();
            for (i, r) in refs.iter().enumerate() {
                if i > 0 {
                    write!(output, " ").unwrap();
                }
                write!(output, "%{}", r).unwrap();
            }
            write!(output, "]").unwrap();
        }
    }
}

/// Print a module's disassembly to stdout.
pub fn print_disassembly(module: &Bytecode) {
    print!("{}", disassemble_module(module));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::compiler;
    use crate::lexer::Scanner;
    use crate::parser::Parser;

    fn disassemble_source(source: &str) -> String {
        let tokens = Scanner::new(source).scan_tokens().expect("scan failed");
        let program = Parser::new(tokens).parse().expect("parse failed");
        let module = compiler::compile("<test>", source, &program).expect("compile failed");
        disassemble_module(&module)
    }

    #[test]
    fn test_dump_uses_normative_names() {
        let output = disassemble_source("let x = 1 + 2 * 3\nx");
        assert!(output.contains("int 7"));
        assert!(output.contains("ret"));
        assert!(!output.contains("add"));
    }

    #[test]
    fn test_dump_shows_function_bodies() {
        let output = disassemble_source("let f = fn(a, b) a + b\nf(40, 2)");
        assert!(output.contains("build_func"));
        assert!(output.contains("add %0 %1"));
        assert!(output.contains("call ["));
    }

    #[test]
    fn test_dump_shows_iteration() {
        let output = disassemble_source("let acc = []\nfor x in 1:4 acc.append(x)\nacc");
        assert!(output.contains("build_range"));
        assert!(output.contains("iter_init"));
        assert!(output.contains("iter_next"));
        assert!(output.contains("append"));
    }
}
