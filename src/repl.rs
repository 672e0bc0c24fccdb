//! The read-eval-print loop.
//!
//! One persistent module grows a few instructions per line; the VM runs
//! only the new tail of `main` against a persistent base frame whose
//! registers double as the globals table. The base frame is reified as
//! a heap value so REPL bindings stay GC-rooted between lines.

use crate::bytecode::Compiler;
use crate::error::ParseError;
use crate::lexer::Scanner;
use crate::parser::Parser;
use crate::vm::value::{Globals, Value};
use crate::vm::Vm;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use std::cell::RefCell;
use std::rc::Rc;

const HISTORY_FILE: &str = ".oryx_history";

/// Persistent REPL state.
pub struct Repl {
    compiler: Compiler,
    vm: Vm,
    globals: Globals,
    /// How many `main` instructions have already executed.
    executed: usize,
}

impl Default for Repl {
    fn default() -> Self {
        Self::new()
    }
}

impl Repl {
    pub fn new() -> Self {
        let mut vm = Vm::new();
        let globals: Globals = Rc::new(RefCell::new(Vec::new()));
        // Reify the base frame so its registers are rooted uniformly.
        let frame = vm.heap.alloc(Value::Frame(globals.clone()));
        vm.add_root(frame);
        Self {
            compiler: Compiler::new("<repl>", ""),
            vm,
            globals,
            executed: 0,
        }
    }

    /// Compile and run one input; returns the rendered value of its last
    /// expression, if any.
    pub fn eval(&mut self, line: &str) -> Result<Option<String>, String> {
        let tokens = Scanner::new(line).scan_tokens().map_err(|e| e.to_string())?;
        let program = Parser::new(tokens).parse().map_err(|e| e.to_string())?;

        let pinned = self
            .compiler
            .compile_more(line, &program)
            .map_err(|e| e.to_string())?;

        let module = Rc::new(self.compiler.module().clone());
        let from = self.executed;
        self.executed = module.main.len();
        match self.vm.run_repl_line(module, self.globals.clone(), from) {
            Ok(Some(value)) if pinned => {
                if matches!(self.vm.value(value), Value::Null) {
                    Ok(None)
                } else {
                    Ok(Some(self.vm.render_value(value)))
                }
            }
            Ok(_) => Ok(None),
            Err(e) => Err(e.to_string()),
        }
    }
}

/// Whether a parse failure looks like an incomplete input that should
/// keep accumulating lines.
fn is_incomplete(line: &str) -> bool {
    match Scanner::new(line).scan_tokens() {
        Ok(tokens) => matches!(
            Parser::new(tokens).parse(),
            Err(ParseError::UnexpectedEnd(_))
        ),
        Err(_) => false,
    }
}

/// Run the interactive loop.
pub fn run() -> Result<(), ReadlineError> {
    let mut editor = DefaultEditor::new()?;
    let _ = editor.load_history(HISTORY_FILE);
    println!("Oryx {}", env!("CARGO_PKG_VERSION"));

    let mut repl = Repl::new();
    let mut buffer = String::new();

    loop {
        let prompt = if buffer.is_empty() { ">> " } else { ".. " };
        match editor.readline(prompt) {
            Ok(line) => {
                if buffer.is_empty() && line.trim().is_empty() {
                    continue;
                }
                if !buffer.is_empty() {
                    buffer.push('\n');
                }
                buffer.push_str(&line);
                if is_incomplete(&buffer) {
                    continue;
                }
                let input = std::mem::take(&mut buffer);
                let _ = editor.add_history_entry(input.as_str());
                match repl.eval(&input) {
                    Ok(Some(rendered)) => println!("{}", rendered),
                    Ok(None) => {}
                    Err(message) => eprintln!("{}", message),
                }
            }
            Err(ReadlineError::Interrupted) => {
                buffer.clear();
            }
            Err(ReadlineError::Eof) => break,
            Err(e) => return Err(e),
        }
    }
    let _ = editor.save_history(HISTORY_FILE);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bindings_persist_across_lines() {
        let mut repl = Repl::new();
        assert_eq!(repl.eval("let x = 40").expect("eval failed"), None);
        assert_eq!(
            repl.eval("x + 2").expect("eval failed"),
            Some("42".to_string())
        );
    }

    #[test]
    fn test_functions_persist_and_capture_globals() {
        let mut repl = Repl::new();
        repl.eval("let base = 10").expect("eval failed");
        repl.eval("let add = fn(n) base + n").expect("eval failed");
        assert_eq!(
            repl.eval("add(5)").expect("eval failed"),
            Some("15".to_string())
        );
    }

    #[test]
    fn test_failed_line_leaves_state_usable() {
        let mut repl = Repl::new();
        repl.eval("let x = 1").expect("eval failed");
        assert!(repl.eval("x + missing").is_err());
        assert_eq!(
            repl.eval("x + 1").expect("eval failed"),
            Some("2".to_string())
        );
    }

    #[test]
    fn test_runtime_error_does_not_poison_the_session() {
        let mut repl = Repl::new();
        repl.eval("let l = [1]").expect("eval failed");
        assert!(repl.eval("l[9]").is_err());
        assert_eq!(
            repl.eval("l[0]").expect("eval failed"),
            Some("1".to_string())
        );
    }

    #[test]
    fn test_incomplete_input_detection() {
        assert!(is_incomplete("let f = fn(a) {"));
        assert!(is_incomplete("let l = [1,"));
        assert!(!is_incomplete("let f = 1"));
        assert!(!is_incomplete("let f = )"));
    }
}
