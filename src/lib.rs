//! Oryx: a small dynamically-typed scripting language.
//!
//! The pipeline is source → lexer → parser → bytecode compiler →
//! register VM. This library root wires the phases together; `main.rs`
//! is a thin CLI over it.

pub mod ast;
pub mod bytecode;
pub mod error;
pub mod fmt;
pub mod lexer;
pub mod parser;
pub mod repl;
pub mod span;
pub mod vm;

use crate::ast::Program;
use crate::bytecode::Bytecode;
use crate::error::OryxError;
use crate::vm::value::Value;
use crate::vm::Vm;
use std::path::Path;
use std::rc::Rc;

/// Parse source text into an AST without executing.
pub fn parse_source(source: &str) -> Result<Program, OryxError> {
    let tokens = lexer::Scanner::new(source).scan_tokens()?;
    let program = parser::Parser::new(tokens).parse()?;
    Ok(program)
}

/// Compile source text to a bytecode module without executing.
pub fn compile_source(path: &str, source: &str) -> Result<Bytecode, OryxError> {
    let program = parse_source(source)?;
    let module = bytecode::compiler::compile(path, source, &program)?;
    Ok(module)
}

/// The outcome of running a script: the rendered top-level value and
/// the process exit code it implies (an integer result in 0..=255 is
/// the exit code; everything else exits 0).
#[derive(Debug)]
pub struct RunOutcome {
    pub rendered: String,
    pub exit_code: i32,
}

/// Compile and run a source string.
pub fn run_source(
    path: &str,
    source: &str,
    import_base: Option<std::path::PathBuf>,
) -> Result<RunOutcome, OryxError> {
    let module = compile_source(path, source)?;
    run_module(Rc::new(module), import_base)
}

/// Run a script or compiled module from disk. A `.oxb` file is decoded;
/// anything else is compiled from source. Imports resolve relative to
/// the file's directory.
pub fn run_file(path: &Path) -> Result<RunOutcome, OryxError> {
    let base = path
        .parent()
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|| std::path::PathBuf::from("."));
    if path.extension().and_then(|e| e.to_str()) == Some("oxb") {
        let bytes = std::fs::read(path)?;
        let module = bytecode::from_bytes(&bytes)?;
        bytecode::verify_module(&module)
            .map_err(|e| error::RuntimeError::new(e.to_string()))?;
        return run_module(Rc::new(module), Some(base));
    }
    let source = std::fs::read_to_string(path)?;
    let module = compile_source(&path.display().to_string(), &source)?;
    run_module(Rc::new(module), Some(base))
}

fn run_module(
    module: Rc<Bytecode>,
    import_base: Option<std::path::PathBuf>,
) -> Result<RunOutcome, OryxError> {
    let mut vm = Vm::new();
    if let Some(base) = import_base {
        vm.enable_imports(base);
    }
    let result = vm.run_module(module)?;
    // A propagated top-level error value is a script failure.
    if let Value::Error(inner) = vm.value(result) {
        let message = vm.render_value(*inner);
        return Err(error::RuntimeError::new(message).into());
    }
    let exit_code = match vm.value(result) {
        Value::Int(n) if (0..=255).contains(n) => *n as i32,
        _ => 0,
    };
    Ok(RunOutcome {
        rendered: vm.render_value(result),
        exit_code,
    })
}

/// Tokenize + parse + render, backing `oryx fmt`.
pub fn format_source(source: &str) -> Result<String, OryxError> {
    let program = parse_source(source)?;
    Ok(fmt::format_program(&program))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_source_exit_codes() {
        let outcome = run_source("<test>", "40 + 2", None).expect("run failed");
        assert_eq!(outcome.rendered, "42");
        assert_eq!(outcome.exit_code, 42);

        let outcome = run_source("<test>", "\"done\"", None).expect("run failed");
        assert_eq!(outcome.exit_code, 0);

        let outcome = run_source("<test>", "1000", None).expect("run failed");
        assert_eq!(outcome.exit_code, 0, "out-of-range ints exit 0");
    }

    #[test]
    fn test_top_level_error_value_fails() {
        let err = run_source("<test>", "let f = fn() error(\"nope\")\ntry f()", None)
            .expect_err("must fail");
        assert!(err.to_string().contains("nope"));
    }

    #[test]
    fn test_compile_error_is_reported() {
        let err = run_source("<test>", "missing", None).expect_err("must fail");
        assert!(matches!(err, OryxError::Compile(_)));
    }
}
