//! Structural validation of a finished module.
//!
//! Checks the register discipline the compiler is supposed to uphold:
//! operands only reference parameters or earlier instructions, registers
//! of result-less instructions are never read, every faulting opcode has
//! a debug entry, jump targets stay inside their body, and extra/string
//! slices stay inside their pools.

use crate::bytecode::instruction::{Data, Op};
use crate::bytecode::module::Bytecode;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("verify error: {message}")]
pub struct VerifyError {
    pub message: String,
}

fn fail<T>(message: String) -> Result<T, VerifyError> {
    Err(VerifyError { message })
}

/// Verify the whole module: the top-level body plus every function body
/// reachable from it.
pub fn verify_module(module: &Bytecode) -> Result<(), VerifyError> {
    verify_body(module, &module.main, 0, 0, "main")?;
    let mut stack = vec![module.main.clone()];
    while let Some(body) = stack.pop() {
        for &code_index in &body {
            let op = module.code.op[code_index as usize];
            let data = module.code.data[code_index as usize];
            if matches!(op, Op::BuildFunc | Op::BuildFuncCapture) {
                let (offset, len) = data.as_slice();
                let words = checked_extra(module, offset, len)?;
                if words.is_empty() {
                    return fail(format!("function at code {} has empty extra", code_index));
                }
                let (arity, ncaps, nested) = match op {
                    Op::BuildFunc => (words[0], 0, &words[1..]),
                    _ => {
                        if words.len() < 2 {
                            return fail(format!(
                                "capturing function at code {} is missing capture count",
                                code_index
                            ));
                        }
                        let ncaps = words[1] as usize;
                        if words.len() < 2 + ncaps {
                            return fail(format!(
                                "capturing function at code {} overruns its extra",
                                code_index
                            ));
                        }
                        (words[0], ncaps as u32, &words[2 + ncaps..])
                    }
                };
                let label = format!("fn@{}", code_index);
                verify_body(module, nested, arity, ncaps, &label)?;
                stack.push(nested.to_vec());
            }
        }
    }
    Ok(())
}

fn checked_extra(module: &Bytecode, offset: u32, len: u32) -> Result<&[u32], VerifyError> {
    let end = offset as usize + len as usize;
    if end > module.extra.len() {
        return fail(format!(
            "extra slice {}..{} out of bounds (pool {})",
            offset,
            end,
            module.extra.len()
        ));
    }
    Ok(module.get_extra(offset, len))
}

fn checked_string(module: &Bytecode, offset: u32, len: u32) -> Result<(), VerifyError> {
    let end = offset as usize + len as usize;
    if end > module.strings.len() {
        return fail(format!(
            "string slice {}..{} out of bounds (pool {})",
            offset,
            end,
            module.strings.len()
        ));
    }
    Ok(())
}

fn verify_body(
    module: &Bytecode,
    body: &[u32],
    params: u32,
    ncaps: u32,
    label: &str,
) -> Result<(), VerifyError> {
    for (pos, &code_index) in body.iter().enumerate() {
        if code_index as usize >= module.code.len() {
            return fail(format!(
                "{}: body position {} references code {} out of bounds",
                label, pos, code_index
            ));
        }
        let op = module.code.op[code_index as usize];
        let data = module.code.data[code_index as usize];

        // Backward-only register references.
        let limit = params + pos as u32;
        let mut refs = Vec::new();
        collect_refs(module, op, data, &mut refs)?;
        for r in refs {
            if r >= limit {
                return fail(format!(
                    "{}: instruction {} ({}) references register {} (limit {})",
                    label,
                    pos,
                    op.name(),
                    r,
                    limit
                ));
            }
            // A result-less instruction's register must never be read.
            if r >= params {
                let source = body[(r - params) as usize] as usize;
                if !module.code.op[source].has_result() {
                    return fail(format!(
                        "{}: instruction {} reads register {} of result-less {}",
                        label,
                        pos,
                        r,
                        module.code.op[source].name()
                    ));
                }
            }
        }

        // Jump targets stay inside the body.
        if let Some(offset) = jump_offset(op, data) {
            let target = pos as i64 + offset as i64;
            if target < 0 || target > body.len() as i64 {
                return fail(format!(
                    "{}: instruction {} ({}) jumps to {} (body {})",
                    label,
                    pos,
                    op.name(),
                    target,
                    body.len()
                ));
            }
        }

        // Faulting ops carry a source offset.
        if op.needs_debug_info() && module.debug.offset_for(code_index).is_none() {
            return fail(format!(
                "{}: instruction {} ({}) has no debug entry",
                label,
                pos,
                op.name()
            ));
        }

        // Capture indices stay inside the capture list.
        if op == Op::LoadCapture && data.as_un() >= ncaps {
            return fail(format!(
                "{}: load_capture {} out of range (captures {})",
                label,
                data.as_un(),
                ncaps
            ));
        }
        if op == Op::LoadGlobal && data.as_un() as usize >= module.main.len() {
            return fail(format!(
                "{}: load_global {} out of range (globals {})",
                label,
                data.as_un(),
                module.main.len()
            ));
        }
    }
    Ok(())
}

fn jump_offset(op: Op, data: Data) -> Option<i32> {
    match op {
        Op::Jump => Some(data.as_jump()),
        Op::JumpIfTrue
        | Op::JumpIfFalse
        | Op::JumpIfNull
        | Op::UnwrapErrorOrJump
        | Op::PushErrHandler
        | Op::IterNext => Some(data.as_jump_condition().1),
        _ => None,
    }
}

/// Enumerate the register references of one instruction.
fn collect_refs(
    module: &Bytecode,
    op: Op,
    data: Data,
    refs: &mut Vec<u32>,
) -> Result<(), VerifyError> {
    match op {
        Op::Nop
        | Op::Primitive
        | Op::Int
        | Op::Num
        | Op::BuildErrorNull
        | Op::LoadThis
        | Op::PopErrHandler
        | Op::Jump
        | Op::RetNull
        | Op::LoadGlobal
        | Op::LoadCapture => {}
        Op::Str | Op::BuildTaggedNull | Op::Import | Op::Native => {
            let (offset, len) = data.as_slice();
            checked_string(module, offset, len)?;
        }
        Op::BuildTuple | Op::BuildList | Op::BuildMap | Op::Call | Op::ThisCall => {
            let (offset, len) = data.as_slice();
            refs.extend_from_slice(checked_extra(module, offset, len)?);
        }
        Op::BuildFunc | Op::BuildFuncCapture => {
            let (offset, len) = data.as_slice();
            let words = checked_extra(module, offset, len)?;
            // Only the capture refs are registers of this body.
            if op == Op::BuildFuncCapture && words.len() >= 2 {
                let ncaps = words[1] as usize;
                if 2 + ncaps <= words.len() {
                    refs.extend_from_slice(&words[2..2 + ncaps]);
                }
            }
        }
        Op::BuildTagged | Op::UnwrapTagged | Op::UnwrapTaggedOrNull => {
            let (operand, extra) = data.as_range();
            refs.push(operand);
            let words = checked_extra(module, extra, 2)?;
            checked_string(module, words[0], words[1])?;
        }
        Op::BuildRangeStep | Op::Set => {
            let (start, extra) = data.as_range();
            refs.push(start);
            refs.extend_from_slice(checked_extra(module, extra, 2)?);
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
        | Op::Throw => refs.push(data.as_un()),
        Op::Copy | Op::Move => {
            let (dst, src) = data.as_bin();
            refs.push(dst);
            refs.push(src);
        }
        Op::CheckLen | Op::AssertLen => {
            let (operand, _) = data.as_bin();
            refs.push(operand);
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
            refs.push(lhs);
            refs.push(rhs);
        }
        Op::As | Op::Is => {
            let (operand, ty) = data.as_bin_ty();
            refs.push(operand);
            if ty.is_none() {
                return fail(format!("{} carries an invalid type tag", op.name()));
            }
        }
        Op::JumpIfTrue | Op::JumpIfFalse | Op::JumpIfNull | Op::UnwrapErrorOrJump
        | Op::PushErrHandler | Op::IterNext => {
            refs.push(data.as_jump_condition().0);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::instruction::Data;
    use crate::bytecode::module::Bytecode;

    fn module_of(ops: &[(Op, Data)]) -> Bytecode {
        let mut module = Bytecode::default();
        for &(op, data) in ops {
            let index = module.push_inst(op, data);
            if op.needs_debug_info() {
                module.push_debug(index, 0);
            }
            module.main.push(index);
        }
        module
    }

    #[test]
    fn test_valid_body_passes() {
        let module = module_of(&[
            (Op::Int, Data::int(1)),
            (Op::Int, Data::int(2)),
            (Op::Add, Data::bin(0, 1)),
            (Op::Ret, Data::un(2)),
        ]);
        verify_module(&module).expect("valid module");
    }

    #[test]
    fn test_forward_reference_rejected() {
        let module = module_of(&[
            (Op::Add, Data::bin(1, 2)),
            (Op::Int, Data::int(1)),
            (Op::Int, Data::int(2)),
            (Op::RetNull, Data::NONE),
        ]);
        assert!(verify_module(&module).is_err());
    }

    #[test]
    fn test_reading_resultless_register_rejected() {
        let module = module_of(&[
            (Op::Int, Data::int(1)),
            (Op::Discard, Data::un(0)),
            (Op::Ret, Data::un(1)),
        ]);
        assert!(verify_module(&module).is_err());
    }

    #[test]
    fn test_missing_debug_entry_rejected() {
        let mut module = Bytecode::default();
        let a = module.push_inst(Op::Int, Data::int(1));
        let b = module.push_inst(Op::Int, Data::int(0));
        // No debug entry for the faulting div.
        let c = module.push_inst(Op::Div, Data::bin(0, 1));
        let d = module.push_inst(Op::Ret, Data::un(2));
        module.main = vec![a, b, c, d];
        assert!(verify_module(&module).is_err());
    }

    #[test]
    fn test_jump_out_of_body_rejected() {
        let module = module_of(&[(Op::Jump, Data::jump(5)), (Op::RetNull, Data::NONE)]);
        assert!(verify_module(&module).is_err());
    }
}
