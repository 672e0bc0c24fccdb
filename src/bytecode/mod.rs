//! Bytecode: the instruction set, compiled modules, the compiler, and
//! the tools around them.
//!
//! - `instruction`: opcodes, the packed operand word, derived predicates
//! - `module`: the compiled module (code, extra pool, strings, debug map)
//! - `compiler`: AST lowering with scopes, captures and constant folding
//! - `disassembler`: human-readable dumps
//! - `serialize`: the on-disk module format
//! - `verify`: structural validation of finished modules

pub mod compiler;
pub mod disassembler;
pub mod instruction;
pub mod module;
pub mod serialize;
pub mod verify;

pub use compiler::Compiler;
pub use disassembler::{disassemble_module, print_disassembly};
pub use instruction::{Data, Op, Ref, TypeTag};
pub use module::Bytecode;
pub use serialize::{from_bytes, to_bytes};
pub use verify::verify_module;
