//! Bytecode compiler: lowers the AST into a module.
//!
//! Registers follow the instruction-as-register scheme: in a function
//! body with `P` parameters, the instruction at body position `i` writes
//! register `P + i`. The compiler threads a result hint down each node
//! and hands a compile-time value back up, materialising constants into
//! registers only when they escape into runtime operations.

use crate::ast::{
    BinaryOp, CatchClause, DeclKind, Expr, ExprKind, JumpKind, Literal, MatchCase, Pattern,
    Program, UnaryOp,
};
use crate::bytecode::instruction::{Data, Op, TypeTag, PRIM_FALSE, PRIM_NULL, PRIM_TRUE};
use crate::bytecode::module::Bytecode;
use crate::error::{CompileError, CompileErrors};

/// Compile-error sentinel: the diagnostic itself lives in the shared
/// error list; this just aborts the current statement.
#[derive(Debug)]
pub struct Sentinel;

pub type CResult<T> = Result<T, Sentinel>;

/// What the caller needs from a compiled node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Hint {
    /// Any value, runtime or compile-time.
    Value,
    /// The value will be dropped; emit only for side effects.
    Discard,
}

/// A compile-time value handed back up the tree.
#[derive(Debug, Clone, PartialEq)]
enum CValue {
    /// Statements that produce nothing (declarations, jumps).
    Empty,
    /// Already in a register owned by the expression (a temporary).
    Rt(u32),
    /// A named register (binding); must not be rebound or spent.
    Ref(u32),
    Null,
    Bool(bool),
    Int(i64),
    Num(f64),
    Str(String),
}

impl CValue {
    fn is_const(&self) -> bool {
        !matches!(self, CValue::Empty | CValue::Rt(_) | CValue::Ref(_))
    }

    /// Truthiness of a constant: only `false` and `null` are false.
    fn const_truthy(&self) -> Option<bool> {
        match self {
            CValue::Null => Some(false),
            CValue::Bool(b) => Some(*b),
            CValue::Int(_) | CValue::Num(_) | CValue::Str(_) => Some(true),
            _ => None,
        }
    }
}

/// A declared name.
#[derive(Debug, Clone)]
struct Symbol {
    name: String,
    reg: u32,
    mutable: bool,
    /// True for capture references synthesized by resolution.
    synthetic: bool,
}

#[derive(Debug)]
enum ScopeKind {
    /// Function boundary; cuts off non-captured lookups.
    Fn,
    /// Plain lexical block.
    Block,
    /// Loop: back-jump target plus pending `break` slots.
    Loop {
        head: usize,
        breaks: Vec<usize>,
        handlers_at_entry: u32,
    },
}

#[derive(Debug)]
struct Scope {
    kind: ScopeKind,
    /// Which function context this scope belongs to.
    fn_index: usize,
    symbols: Vec<Symbol>,
}

impl Scope {
    fn find(&self, name: &str) -> Option<&Symbol> {
        self.symbols.iter().rev().find(|s| s.name == name)
    }
}

/// Per-function compile context.
#[derive(Debug)]
struct FnCtx {
    arity: u32,
    /// Code indices in execution order.
    body: Vec<u32>,
    /// Ordered, de-duplicated capture list: name plus the register in the
    /// enclosing frame read at `build_func_capture` time.
    captures: Vec<(String, u32)>,
    /// Scope-stack index of this function's `Fn` scope.
    scope_base: usize,
    /// Error handlers currently armed in this function.
    open_handlers: u32,
}

/// How a name resolved.
enum Resolved {
    Local { reg: u32, mutable: bool, synthetic: bool },
    Global { slot: u32, mutable: bool },
}

/// The bytecode compiler. One instance per module; the REPL keeps it
/// alive and feeds it more statements via [`Compiler::compile_more`].
pub struct Compiler {
    module: Bytecode,
    errors: Vec<CompileError>,
    scopes: Vec<Scope>,
    fns: Vec<FnCtx>,
    /// Added to AST spans; nonzero for incremental (REPL) input.
    offset_base: usize,
    /// Nonzero while compiling an expression protected by a `catch`;
    /// constant folds that would trap fall back to runtime ops there.
    protected_depth: u32,
}

/// Compile a whole program into a fresh module.
pub fn compile(path: &str, source: &str, program: &Program) -> Result<Bytecode, CompileErrors> {
    let mut compiler = Compiler::new(path, source);
    compiler.compile_program(program)?;
    Ok(compiler.take_module())
}

impl Compiler {
    pub fn new(path: &str, source: &str) -> Self {
        let mut compiler = Self {
            module: Bytecode::new(path, source),
            errors: Vec::new(),
            scopes: Vec::new(),
            fns: Vec::new(),
            offset_base: 0,
            protected_depth: 0,
        };
        compiler.fns.push(FnCtx {
            arity: 0,
            body: Vec::new(),
            captures: Vec::new(),
            scope_base: 0,
            open_handlers: 0,
        });
        compiler.scopes.push(Scope {
            kind: ScopeKind::Fn,
            fn_index: 0,
            symbols: Vec::new(),
        });
        compiler
    }

    pub fn module(&self) -> &Bytecode {
        &self.module
    }

    pub fn take_module(self) -> Bytecode {
        self.module
    }

    /// Compile a full program: every statement, then a `ret` of the final
    /// statement's value.
    pub fn compile_program(&mut self, program: &Program) -> Result<(), CompileErrors> {
        let count = program.statements.len();
        for (i, stmt) in program.statements.iter().enumerate() {
            let scope_depth = self.scopes.len();
            let result = if i + 1 == count {
                self.compile_tail(stmt)
            } else {
                self.compile_statement(stmt)
            };
            if result.is_err() {
                self.scopes.truncate(scope_depth);
                self.fns.truncate(1);
            }
        }
        if count == 0 {
            self.emit(Op::RetNull, Data::NONE, 0);
        }
        if self.errors.is_empty() {
            self.module.main = self.fns[0].body.clone();
            Ok(())
        } else {
            Err(CompileErrors(std::mem::take(&mut self.errors)))
        }
    }

    /// Compile additional statements into the existing module (REPL).
    /// Returns whether the final statement pinned a printable value as
    /// the last instruction. On failure the module is rolled back
    /// untouched.
    pub fn compile_more(&mut self, source: &str, program: &Program) -> Result<bool, CompileErrors> {
        let code_len = self.module.code.len();
        let extra_len = self.module.extra.len();
        let strings_len = self.module.strings.len();
        let lines_len = self.module.debug.lines.len();
        let source_len = self.module.debug.source.len();
        let body_len = self.fns[0].body.len();
        let symbols_len = self.scopes[0].symbols.len();

        self.offset_base = source_len;
        self.module.debug.source.push_str(source);
        self.module.debug.source.push('\n');

        let count = program.statements.len();
        let mut failed = false;
        let mut pinned = false;
        for (i, stmt) in program.statements.iter().enumerate() {
            let scope_depth = self.scopes.len();
            let result = if i + 1 == count {
                // The last value is pinned into a final register so the
                // REPL can read and print it.
                self.compile_expr(stmt, Hint::Value)
                    .and_then(|v| match v {
                        CValue::Empty => Ok(()),
                        v => {
                            let offset = self.offset_base + stmt.span.start;
                            let reg = self.materialize(v, offset)?;
                            self.emit(Op::CopyUn, Data::un(reg), offset);
                            pinned = true;
                            Ok(())
                        }
                    })
            } else {
                self.compile_statement(stmt)
            };
            if result.is_err() {
                self.scopes.truncate(scope_depth);
                self.fns.truncate(1);
                failed = true;
            }
        }

        if failed || !self.errors.is_empty() {
            self.module.code.op.truncate(code_len);
            self.module.code.data.truncate(code_len);
            self.module.extra.truncate(extra_len);
            self.module.strings.truncate(strings_len);
            self.module.debug.lines.truncate(lines_len);
            self.module.debug.source.truncate(source_len);
            self.fns[0].body.truncate(body_len);
            self.scopes[0].symbols.truncate(symbols_len);
            return Err(CompileErrors(std::mem::take(&mut self.errors)));
        }

        self.module.main = self.fns[0].body.clone();
        Ok(pinned)
    }

    // ---- emission ----

    fn cur(&mut self) -> &mut FnCtx {
        self.fns.last_mut().expect("function context stack is never empty")
    }

    /// Append an instruction to a specific function's body; returns its
    /// result register.
    fn emit_in(&mut self, fn_index: usize, op: Op, data: Data, offset: usize) -> u32 {
        let code_index = self.module.push_inst(op, data);
        if op.needs_debug_info() {
            self.module.push_debug(code_index, offset as u32);
        }
        let ctx = &mut self.fns[fn_index];
        ctx.body.push(code_index);
        ctx.arity + (ctx.body.len() - 1) as u32
    }

    fn emit(&mut self, op: Op, data: Data, offset: usize) -> u32 {
        self.emit_in(self.fns.len() - 1, op, data, offset)
    }

    /// Current body position of the innermost function.
    fn pos(&self) -> usize {
        self.fns.last().expect("function context stack is never empty").body.len()
    }

    /// Emit a forward jump with a placeholder offset; returns its body
    /// position for patching.
    fn emit_jump(&mut self, op: Op, operand: Option<u32>, offset: usize) -> usize {
        let data = match operand {
            Some(reg) => Data::jump_condition(reg, 0),
            None => Data::jump(0),
        };
        self.emit(op, data, offset);
        self.pos() - 1
    }

    /// Patch a forward jump to land on the current position.
    fn patch_jump(&mut self, jump_pos: usize) {
        let target = self.pos();
        let delta = (target - jump_pos) as i32;
        let ctx = self.fns.last().expect("function context stack is never empty");
        let code_index = ctx.body[jump_pos] as usize;
        let op = self.module.code.op[code_index];
        let data = self.module.code.data[code_index];
        self.module.code.data[code_index] = if op == Op::Jump {
            data.patch_jump(delta)
        } else {
            data.patch_jump_condition(delta)
        };
    }

    /// Emit a backward jump to an already-known body position.
    fn emit_jump_back(&mut self, target: usize, offset: usize) {
        let delta = target as i32 - self.pos() as i32;
        self.emit(Op::Jump, Data::jump(delta), offset);
    }

    fn err<T>(&mut self, message: impl Into<String>, offset: usize) -> CResult<T> {
        self.errors.push(CompileError::new(message, offset));
        Err(Sentinel)
    }

    fn offset(&self, expr: &Expr) -> usize {
        self.offset_base + expr.span.start
    }

    // ---- scopes & symbols ----

    fn push_scope(&mut self, kind: ScopeKind) {
        self.scopes.push(Scope {
            kind,
            fn_index: self.fns.len() - 1,
            symbols: Vec::new(),
        });
    }

    fn pop_scope(&mut self) {
        self.scopes.pop();
    }

    fn declare(&mut self, name: &str, reg: u32, mutable: bool, offset: usize) -> CResult<()> {
        let scope = self.scopes.last().expect("scope stack is never empty");
        if scope
            .symbols
            .iter()
            .any(|s| !s.synthetic && s.name == name)
        {
            return self.err(format!("Duplicate declaration of '{}'", name), offset);
        }
        self.scopes
            .last_mut()
            .expect("scope stack is never empty")
            .symbols
            .push(Symbol {
                name: name.to_string(),
                reg,
                mutable,
                synthetic: false,
            });
        Ok(())
    }

    /// Innermost-to-outermost name lookup. Crossing a `fn` boundary adds
    /// the outer binding to each crossed function's capture list and
    /// synthesizes a local `load_capture` register; module-level bindings
    /// resolve to `load_global` instead.
    fn resolve(&mut self, name: &str, offset: usize) -> Option<Resolved> {
        let cur_fn = self.fns.len() - 1;
        let mut found: Option<(usize, u32, bool, bool)> = None;
        for scope in self.scopes.iter().rev() {
            if let Some(sym) = scope.find(name) {
                found = Some((scope.fn_index, sym.reg, sym.mutable, sym.synthetic));
                break;
            }
        }
        let (owner, reg, mutable, synthetic) = found?;

        if owner == cur_fn {
            return Some(Resolved::Local {
                reg,
                mutable,
                synthetic,
            });
        }
        if owner == 0 {
            return Some(Resolved::Global { slot: reg, mutable });
        }

        // Capture chain: every function between the owner and here gets a
        // capture entry and a synthesized register holding the value.
        let mut outer_ref = reg;
        for f in owner + 1..=cur_fn {
            let base = self.fns[f].scope_base;
            if let Some(sym) = self.scopes[base]
                .symbols
                .iter()
                .rev()
                .find(|s| s.synthetic && s.name == name)
            {
                outer_ref = sym.reg;
                continue;
            }
            let cap_index = match self.fns[f].captures.iter().position(|c| c.0 == name) {
                Some(i) => i,
                None => {
                    self.fns[f].captures.push((name.to_string(), outer_ref));
                    self.fns[f].captures.len() - 1
                }
            };
            let synth_reg = self.emit_in(f, Op::LoadCapture, Data::un(cap_index as u32), offset);
            self.scopes[base].symbols.push(Symbol {
                name: name.to_string(),
                reg: synth_reg,
                mutable: false,
                synthetic: true,
            });
            outer_ref = synth_reg;
        }
        Some(Resolved::Local {
            reg: outer_ref,
            mutable: false,
            synthetic: true,
        })
    }

    // ---- values ----

    /// Force a compile-time value into a register.
    fn materialize(&mut self, value: CValue, offset: usize) -> CResult<u32> {
        let reg = match value {
            CValue::Rt(reg) | CValue::Ref(reg) => reg,
            CValue::Null | CValue::Empty => {
                self.emit(Op::Primitive, Data::primitive(PRIM_NULL), offset)
            }
            CValue::Bool(true) => self.emit(Op::Primitive, Data::primitive(PRIM_TRUE), offset),
            CValue::Bool(false) => self.emit(Op::Primitive, Data::primitive(PRIM_FALSE), offset),
            CValue::Int(n) => self.emit(Op::Int, Data::int(n), offset),
            CValue::Num(n) => self.emit(Op::Num, Data::num(n), offset),
            CValue::Str(s) => {
                let (off, len) = self.module.add_string(&s);
                self.emit(Op::Str, Data::str(off, len), offset)
            }
        };
        Ok(reg)
    }

    /// Write a value into a slot register reserved by `nop`.
    fn copy_into(&mut self, slot: u32, value: CValue, offset: usize) -> CResult<()> {
        match value {
            CValue::Ref(reg) => {
                self.emit(Op::Copy, Data::bin(slot, reg), offset);
            }
            value => {
                let reg = self.materialize(value, offset)?;
                self.emit(Op::Move, Data::bin(slot, reg), offset);
            }
        }
        Ok(())
    }

    // ---- statements ----

    /// A statement whose value is dropped. Runtime temporaries get a
    /// `discard`, which raises if the value is an unhandled error; values
    /// produced by a `catch` expression are statically known handled and
    /// are dropped silently.
    fn compile_statement(&mut self, stmt: &Expr) -> CResult<()> {
        let value = self.compile_expr(stmt, Hint::Discard)?;
        if let CValue::Rt(reg) = value {
            let caught = matches!(
                stmt.kind,
                ExprKind::Try {
                    catch: Some(_),
                    ..
                }
            );
            if !caught {
                let offset = self.offset(stmt);
                self.emit(Op::Discard, Data::un(reg), offset);
            }
        }
        Ok(())
    }

    /// The final statement of a program: its value becomes the module
    /// result.
    fn compile_tail(&mut self, stmt: &Expr) -> CResult<()> {
        let offset = self.offset(stmt);
        let value = self.compile_expr(stmt, Hint::Value)?;
        match value {
            CValue::Empty | CValue::Null => {
                self.emit(Op::RetNull, Data::NONE, offset);
            }
            value => {
                let reg = self.materialize(value, offset)?;
                self.emit(Op::Ret, Data::un(reg), offset);
            }
        }
        Ok(())
    }

    // ---- expressions ----

    fn compile_expr(&mut self, expr: &Expr, hint: Hint) -> CResult<CValue> {
        let offset = self.offset(expr);
        match &expr.kind {
            ExprKind::Literal(lit) => Ok(literal_value(lit)),
            ExprKind::Identifier(name) => self.compile_identifier(name, offset),
            ExprKind::Grouped(inner) => self.compile_expr(inner, hint),
            ExprKind::Block(statements) => self.compile_block(statements, hint),
            ExprKind::Prefix { op, operand } => self.compile_prefix(*op, operand, offset),
            ExprKind::Infix { op, lhs, rhs } => self.compile_infix(*op, lhs, rhs, offset),
            ExprKind::TypeInfix {
                is_cast,
                operand,
                ty,
            } => {
                let value = self.compile_expr(operand, Hint::Value)?;
                let reg = self.materialize(value, offset)?;
                let op = if *is_cast { Op::As } else { Op::Is };
                Ok(CValue::Rt(self.emit(op, Data::bin_ty(reg, *ty), offset)))
            }
            ExprKind::Decl {
                kind,
                pattern,
                value,
            } => self.compile_decl(*kind, pattern, value, offset),
            ExprKind::Assign { target, op, value } => {
                self.compile_assign(target, *op, value, offset)
            }
            ExprKind::If { cond, then, els } => self.compile_if(cond, then, els.as_deref(), hint),
            ExprKind::While { cond, body } => self.compile_while(cond, body, offset),
            ExprKind::For {
                binding,
                iterable,
                body,
            } => self.compile_for(binding, iterable, body, offset),
            ExprKind::Jump(kind) => self.compile_jump(kind, offset),
            ExprKind::Tuple(elements) => self.compile_sequence(Op::BuildTuple, elements, offset),
            ExprKind::List(elements) => self.compile_sequence(Op::BuildList, elements, offset),
            ExprKind::Map(pairs) => self.compile_map(pairs, offset),
            ExprKind::Range { start, end, step } => {
                self.compile_range(start, end, step.as_deref(), offset)
            }
            ExprKind::Discard => self.err("'_' is only allowed as a binding target", offset),
            ExprKind::Fn { params, body } => self.compile_fn(params, body, offset),
            ExprKind::Call { callee, args } => self.compile_call(callee, args, offset),
            ExprKind::MethodCall { recv, name, args } => {
                self.compile_method_call(recv, name, args, offset)
            }
            ExprKind::Index {
                recv,
                index,
                or_null,
            } => {
                let recv_value = self.compile_expr(recv, Hint::Value)?;
                let recv_reg = self.materialize(recv_value, offset)?;
                let index_value = self.compile_expr(index, Hint::Value)?;
                let index_reg = self.materialize(index_value, offset)?;
                let op = if *or_null { Op::GetOrNull } else { Op::Get };
                Ok(CValue::Rt(self.emit(
                    op,
                    Data::bin(recv_reg, index_reg),
                    offset,
                )))
            }
            ExprKind::ErrorLit(payload) => match payload {
                Some(inner) => {
                    let value = self.compile_expr(inner, Hint::Value)?;
                    let reg = self.materialize(value, offset)?;
                    Ok(CValue::Rt(self.emit(Op::BuildError, Data::un(reg), offset)))
                }
                None => Ok(CValue::Rt(self.emit(
                    Op::BuildErrorNull,
                    Data::NONE,
                    offset,
                ))),
            },
            ExprKind::Tagged { name, payload } => {
                let (name_off, name_len) = self.module.add_string(name);
                match payload {
                    Some(inner) => {
                        let value = self.compile_expr(inner, Hint::Value)?;
                        let reg = self.materialize(value, offset)?;
                        let (extra_off, _) = self.module.add_extra(&[name_off, name_len]);
                        Ok(CValue::Rt(self.emit(
                            Op::BuildTagged,
                            Data::range(reg, extra_off),
                            offset,
                        )))
                    }
                    None => Ok(CValue::Rt(self.emit(
                        Op::BuildTaggedNull,
                        Data::str(name_off, name_len),
                        offset,
                    ))),
                }
            }
            ExprKind::Try { expr, catch } => self.compile_try(expr, catch.as_ref(), hint, offset),
            ExprKind::Import(path) => {
                let (off, len) = self.module.add_string(path);
                Ok(CValue::Rt(self.emit(Op::Import, Data::str(off, len), offset)))
            }
            ExprKind::Native(name) => {
                let (off, len) = self.module.add_string(name);
                Ok(CValue::Rt(self.emit(Op::Native, Data::str(off, len), offset)))
            }
            ExprKind::This => Ok(CValue::Rt(self.emit(Op::LoadThis, Data::NONE, offset))),
            ExprKind::Match { subject, cases } => self.compile_match(subject, cases, hint, offset),
        }
    }

    fn compile_identifier(&mut self, name: &str, offset: usize) -> CResult<CValue> {
        match self.resolve(name, offset) {
            Some(Resolved::Local { reg, .. }) => Ok(CValue::Ref(reg)),
            Some(Resolved::Global { slot, .. }) => {
                if self.fns.len() == 1 {
                    Ok(CValue::Ref(slot))
                } else {
                    Ok(CValue::Rt(self.emit(
                        Op::LoadGlobal,
                        Data::un(slot),
                        offset,
                    )))
                }
            }
            None => self.err(format!("Undefined variable '{}'", name), offset),
        }
    }

    fn compile_block(&mut self, statements: &[Expr], hint: Hint) -> CResult<CValue> {
        if statements.is_empty() {
            return Ok(CValue::Null);
        }
        self.push_scope(ScopeKind::Block);
        let mut result = CValue::Null;
        let count = statements.len();
        for (i, stmt) in statements.iter().enumerate() {
            if i + 1 == count {
                let value = self.compile_expr(stmt, hint);
                match value {
                    Ok(v) => result = v,
                    Err(e) => {
                        self.pop_scope();
                        return Err(e);
                    }
                }
            } else if let Err(e) = self.compile_statement(stmt) {
                self.pop_scope();
                return Err(e);
            }
        }
        self.pop_scope();
        if result == CValue::Empty {
            result = CValue::Null;
        }
        Ok(result)
    }

    fn compile_prefix(&mut self, op: UnaryOp, operand: &Expr, offset: usize) -> CResult<CValue> {
        let value = self.compile_expr(operand, Hint::Value)?;
        if value.is_const() {
            match self.fold_unary(op, &value, offset)? {
                Some(folded) => return Ok(folded),
                None => {}
            }
        }
        let reg = self.materialize(value, offset)?;
        let opcode = match op {
            UnaryOp::Negate => Op::Negate,
            UnaryOp::Not => Op::BoolNot,
            UnaryOp::BitNot => Op::BitNot,
        };
        Ok(CValue::Rt(self.emit(opcode, Data::un(reg), offset)))
    }

    fn fold_unary(
        &mut self,
        op: UnaryOp,
        value: &CValue,
        offset: usize,
    ) -> CResult<Option<CValue>> {
        let folded = match (op, value) {
            (UnaryOp::Negate, CValue::Int(n)) => match n.checked_neg() {
                Some(neg) => Some(CValue::Int(neg)),
                None => return self.fold_trap("Integer overflow", offset),
            },
            (UnaryOp::Negate, CValue::Num(n)) => Some(CValue::Num(-n)),
            (UnaryOp::Not, CValue::Bool(b)) => Some(CValue::Bool(!b)),
            (UnaryOp::BitNot, CValue::Int(n)) => Some(CValue::Int(!n)),
            _ => None,
        };
        Ok(folded)
    }

    /// A constant fold that would trap at run time: a compile error,
    /// except inside a `catch`-protected expression, where the runtime op
    /// is emitted instead so the handler can observe the raise.
    fn fold_trap(&mut self, message: &str, offset: usize) -> CResult<Option<CValue>> {
        if self.protected_depth > 0 {
            Ok(None)
        } else {
            self.err(format!("{} in constant expression", message), offset)
        }
    }

    fn compile_infix(
        &mut self,
        op: BinaryOp,
        lhs: &Expr,
        rhs: &Expr,
        offset: usize,
    ) -> CResult<CValue> {
        if matches!(op, BinaryOp::And | BinaryOp::Or) {
            return self.compile_short_circuit(op, lhs, rhs, offset);
        }

        let lhs_value = self.compile_expr(lhs, Hint::Value)?;
        let rhs_value = self.compile_expr(rhs, Hint::Value)?;

        if lhs_value.is_const() && rhs_value.is_const() {
            if let Some(folded) = self.fold_binary(op, &lhs_value, &rhs_value, offset)? {
                return Ok(folded);
            }
        }

        let lhs_reg = self.materialize(lhs_value, offset)?;
        let rhs_reg = self.materialize(rhs_value, offset)?;
        let opcode = binary_opcode(op);
        Ok(CValue::Rt(self.emit(
            opcode,
            Data::bin(lhs_reg, rhs_reg),
            offset,
        )))
    }

    /// `and`/`or`: the left operand decides; the right is compiled only
    /// behind a conditional jump (or dropped entirely when the left is a
    /// deciding constant).
    fn compile_short_circuit(
        &mut self,
        op: BinaryOp,
        lhs: &Expr,
        rhs: &Expr,
        offset: usize,
    ) -> CResult<CValue> {
        let lhs_value = self.compile_expr(lhs, Hint::Value)?;
        if let Some(truthy) = lhs_value.const_truthy() {
            let decided = match op {
                BinaryOp::And => !truthy,
                _ => truthy,
            };
            if decided {
                return Ok(lhs_value);
            }
            return self.compile_expr(rhs, Hint::Value);
        }

        let slot = self.emit(Op::Nop, Data::NONE, offset);
        let lhs_reg = self.materialize(lhs_value, offset)?;
        self.emit(Op::Copy, Data::bin(slot, lhs_reg), offset);
        let jump_op = if op == BinaryOp::And {
            Op::JumpIfFalse
        } else {
            Op::JumpIfTrue
        };
        let skip = self.emit_jump(jump_op, Some(lhs_reg), offset);
        let rhs_value = self.compile_expr(rhs, Hint::Value)?;
        self.copy_into(slot, rhs_value, offset)?;
        self.patch_jump(skip);
        Ok(CValue::Rt(slot))
    }

    /// Constant folding with the VM's exact semantics and overflow
    /// policy.
    fn fold_binary(
        &mut self,
        op: BinaryOp,
        lhs: &CValue,
        rhs: &CValue,
        offset: usize,
    ) -> CResult<Option<CValue>> {
        use BinaryOp::*;
        use CValue::*;

        let folded = match (lhs, rhs) {
            (Int(a), Int(b)) => match op {
                Add => match a.checked_add(*b) {
                    Some(n) => Some(Int(n)),
                    None => return self.fold_trap("Integer overflow", offset),
                },
                Sub => match a.checked_sub(*b) {
                    Some(n) => Some(Int(n)),
                    None => return self.fold_trap("Integer overflow", offset),
                },
                Mul => match a.checked_mul(*b) {
                    Some(n) => Some(Int(n)),
                    None => return self.fold_trap("Integer overflow", offset),
                },
                Div => {
                    if *b == 0 {
                        return self.fold_trap("Division by zero", offset);
                    }
                    Some(Num(*a as f64 / *b as f64))
                }
                DivFloor => {
                    if *b == 0 {
                        return self.fold_trap("Division by zero", offset);
                    }
                    match floor_div(*a, *b) {
                        Some(n) => Some(Int(n)),
                        None => return self.fold_trap("Integer overflow", offset),
                    }
                }
                Rem => {
                    if *b == 0 {
                        return self.fold_trap("Modulo by zero", offset);
                    }
                    match a.checked_rem(*b) {
                        Some(n) => Some(Int(n)),
                        None => return self.fold_trap("Integer overflow", offset),
                    }
                }
                Pow => {
                    if *b >= 0 {
                        let exp = u32::try_from(*b).ok();
                        match exp.and_then(|e| a.checked_pow(e)) {
                            Some(n) => Some(Int(n)),
                            None => return self.fold_trap("Integer overflow", offset),
                        }
                    } else {
                        Some(Num((*a as f64).powi(*b as i32)))
                    }
                }
                Shl | Shr => {
                    if !(0..64).contains(b) {
                        return self.fold_trap("Shift amount out of range", offset);
                    }
                    Some(Int(if op == Shl { a << b } else { a >> b }))
                }
                BitAnd => Some(Int(a & b)),
                BitOr => Some(Int(a | b)),
                BitXor => Some(Int(a ^ b)),
                Equal => Some(Bool(a == b)),
                NotEqual => Some(Bool(a != b)),
                Less => Some(Bool(a < b)),
                LessEqual => Some(Bool(a <= b)),
                Greater => Some(Bool(a > b)),
                GreaterEqual => Some(Bool(a >= b)),
                In | And | Or => None,
            },
            (Num(_), Num(_)) | (Num(_), Int(_)) | (Int(_), Num(_)) => {
                let a = match lhs {
                    Num(n) => *n,
                    Int(n) => *n as f64,
                    _ => unreachable!(),
                };
                let b = match rhs {
                    Num(n) => *n,
                    Int(n) => *n as f64,
                    _ => unreachable!(),
                };
                match op {
                    Add => Some(Num(a + b)),
                    Sub => Some(Num(a - b)),
                    Mul => Some(Num(a * b)),
                    Div => {
                        if b == 0.0 {
                            return self.fold_trap("Division by zero", offset);
                        }
                        Some(Num(a / b))
                    }
                    Rem => {
                        if b == 0.0 {
                            return self.fold_trap("Modulo by zero", offset);
                        }
                        Some(Num(a % b))
                    }
                    Pow => Some(Num(a.powf(b))),
                    Equal => Some(Bool(a == b)),
                    NotEqual => Some(Bool(a != b)),
                    Less => Some(Bool(a < b)),
                    LessEqual => Some(Bool(a <= b)),
                    Greater => Some(Bool(a > b)),
                    GreaterEqual => Some(Bool(a >= b)),
                    _ => None,
                }
            }
            (Str(a), Str(b)) => match op {
                Add => Some(Str(format!("{}{}", a, b))),
                Equal => Some(Bool(a == b)),
                NotEqual => Some(Bool(a != b)),
                Less => Some(Bool(a.as_bytes() < b.as_bytes())),
                LessEqual => Some(Bool(a.as_bytes() <= b.as_bytes())),
                Greater => Some(Bool(a.as_bytes() > b.as_bytes())),
                GreaterEqual => Some(Bool(a.as_bytes() >= b.as_bytes())),
                _ => None,
            },
            (Bool(a), Bool(b)) => match op {
                Equal => Some(Bool(a == b)),
                NotEqual => Some(Bool(a != b)),
                _ => None,
            },
            (Null, Null) => match op {
                Equal => Some(Bool(true)),
                NotEqual => Some(Bool(false)),
                _ => None,
            },
            _ => match op {
                Equal => Some(Bool(false)),
                NotEqual => Some(Bool(true)),
                _ => None,
            },
        };
        Ok(folded)
    }

    fn compile_decl(
        &mut self,
        kind: DeclKind,
        pattern: &Pattern,
        value: &Expr,
        offset: usize,
    ) -> CResult<CValue> {
        let mutable = kind == DeclKind::Let;
        match pattern {
            Pattern::Binding(name) => {
                // A function literal sees its own name (recursion): the
                // binding gets a slot register up front and the built
                // function is moved into it.
                if matches!(value.kind, ExprKind::Fn { .. }) {
                    let slot = self.emit(Op::Nop, Data::NONE, offset);
                    self.declare(name, slot, mutable, offset)?;
                    let v = self.compile_expr(value, Hint::Value)?;
                    let reg = self.materialize(v, offset)?;
                    self.emit(Op::Move, Data::bin(slot, reg), offset);
                    return Ok(CValue::Empty);
                }
                let v = self.compile_expr(value, Hint::Value)?;
                let reg = match v {
                    CValue::Rt(reg) => reg,
                    CValue::Ref(reg) => self.emit(Op::CopyUn, Data::un(reg), offset),
                    constant => self.materialize(constant, offset)?,
                };
                self.declare(name, reg, mutable, offset)?;
                Ok(CValue::Empty)
            }
            Pattern::Wildcard => {
                let v = self.compile_expr(value, Hint::Discard)?;
                if let CValue::Rt(reg) = v {
                    self.emit(Op::Discard, Data::un(reg), offset);
                }
                Ok(CValue::Empty)
            }
            Pattern::Tuple(elements) | Pattern::List(elements) => {
                let v = self.compile_expr(value, Hint::Value)?;
                let is_temp = matches!(v, CValue::Rt(_)) || v.is_const();
                let reg = self.materialize(v, offset)?;
                self.destructure(elements, reg, mutable, offset)?;
                if is_temp {
                    self.emit(Op::Discard, Data::un(reg), offset);
                }
                Ok(CValue::Empty)
            }
            _ => self.err("Refutable pattern in a 'let' binding", offset),
        }
    }

    /// `let`-style destructuring: assert the shape, `get` each bound
    /// element, recurse into nested sequences.
    fn destructure(
        &mut self,
        elements: &[Pattern],
        source: u32,
        mutable: bool,
        offset: usize,
    ) -> CResult<()> {
        self.emit(
            Op::AssertLen,
            Data::bin(source, elements.len() as u32),
            offset,
        );
        for (i, element) in elements.iter().enumerate() {
            match element {
                Pattern::Wildcard => {}
                Pattern::Binding(name) => {
                    let index = self.emit(Op::Int, Data::int(i as i64), offset);
                    let reg = self.emit(Op::Get, Data::bin(source, index), offset);
                    self.declare(name, reg, mutable, offset)?;
                }
                Pattern::Tuple(nested) | Pattern::List(nested) => {
                    let index = self.emit(Op::Int, Data::int(i as i64), offset);
                    let reg = self.emit(Op::Get, Data::bin(source, index), offset);
                    self.destructure(nested, reg, mutable, offset)?;
                }
                _ => return self.err("Refutable pattern in a 'let' binding", offset),
            }
        }
        Ok(())
    }

    fn compile_assign(
        &mut self,
        target: &Expr,
        op: Option<BinaryOp>,
        value: &Expr,
        offset: usize,
    ) -> CResult<CValue> {
        match &target.kind {
            ExprKind::Identifier(name) => {
                let resolved = match self.resolve(name, offset) {
                    Some(r) => r,
                    None => return self.err(format!("Undefined variable '{}'", name), offset),
                };
                let dst = match resolved {
                    Resolved::Local {
                        synthetic: true, ..
                    } => {
                        return self.err(
                            format!("Cannot assign to captured binding '{}'", name),
                            offset,
                        )
                    }
                    Resolved::Local { mutable: false, .. } => {
                        return self.err(format!("Cannot assign to constant '{}'", name), offset)
                    }
                    Resolved::Local { reg, .. } => reg,
                    Resolved::Global { mutable, slot } => {
                        if self.fns.len() > 1 {
                            return self.err(
                                format!(
                                    "Cannot assign to module-level binding '{}' from a function",
                                    name
                                ),
                                offset,
                            );
                        }
                        if !mutable {
                            return self
                                .err(format!("Cannot assign to constant '{}'", name), offset);
                        }
                        slot
                    }
                };
                match op {
                    Some(bop) => {
                        let rhs = self.compile_expr(value, Hint::Value)?;
                        let rhs_reg = self.materialize(rhs, offset)?;
                        let result =
                            self.emit(binary_opcode(bop), Data::bin(dst, rhs_reg), offset);
                        self.emit(Op::Move, Data::bin(dst, result), offset);
                    }
                    None => {
                        let rhs = self.compile_expr(value, Hint::Value)?;
                        self.copy_into(dst, rhs, offset)?;
                    }
                }
                Ok(CValue::Empty)
            }
            ExprKind::Index {
                recv,
                index,
                or_null: false,
            } => {
                let recv_value = self.compile_expr(recv, Hint::Value)?;
                let recv_reg = self.materialize(recv_value, offset)?;
                let index_value = self.compile_expr(index, Hint::Value)?;
                let index_reg = self.materialize(index_value, offset)?;
                let value_reg = match op {
                    Some(bop) => {
                        let current = self.emit(Op::Get, Data::bin(recv_reg, index_reg), offset);
                        let rhs = self.compile_expr(value, Hint::Value)?;
                        let rhs_reg = self.materialize(rhs, offset)?;
                        self.emit(binary_opcode(bop), Data::bin(current, rhs_reg), offset)
                    }
                    None => {
                        let rhs = self.compile_expr(value, Hint::Value)?;
                        self.materialize(rhs, offset)?
                    }
                };
                let (extra_off, _) = self.module.add_extra(&[index_reg, value_reg]);
                self.emit(Op::Set, Data::range(recv_reg, extra_off), offset);
                Ok(CValue::Empty)
            }
            _ => self.err("Invalid assignment target", offset),
        }
    }

    fn compile_if(
        &mut self,
        cond: &Expr,
        then: &Expr,
        els: Option<&Expr>,
        hint: Hint,
    ) -> CResult<CValue> {
        let offset = self.offset(cond);
        let cond_value = self.compile_expr(cond, Hint::Value)?;
        if let Some(truthy) = cond_value.const_truthy() {
            return if truthy {
                self.compile_expr(then, hint)
            } else {
                match els {
                    Some(els) => self.compile_expr(els, hint),
                    None => Ok(CValue::Null),
                }
            };
        }

        if hint == Hint::Discard {
            let cond_reg = self.materialize(cond_value, offset)?;
            let to_else = self.emit_jump(Op::JumpIfFalse, Some(cond_reg), offset);
            self.compile_branch_statement(then)?;
            match els {
                Some(els) => {
                    let to_end = self.emit_jump(Op::Jump, None, offset);
                    self.patch_jump(to_else);
                    self.compile_branch_statement(els)?;
                    self.patch_jump(to_end);
                }
                None => self.patch_jump(to_else),
            }
            return Ok(CValue::Empty);
        }

        let slot = self.emit(Op::Nop, Data::NONE, offset);
        let cond_reg = self.materialize(cond_value, offset)?;
        let to_else = self.emit_jump(Op::JumpIfFalse, Some(cond_reg), offset);
        let then_value = self.compile_expr(then, Hint::Value)?;
        let then_offset = self.offset(then);
        self.copy_into(slot, then_value, then_offset)?;
        let to_end = self.emit_jump(Op::Jump, None, then_offset);
        self.patch_jump(to_else);
        if let Some(els) = els {
            let els_value = self.compile_expr(els, Hint::Value)?;
            let els_offset = self.offset(els);
            self.copy_into(slot, els_value, els_offset)?;
        }
        self.patch_jump(to_end);
        Ok(CValue::Rt(slot))
    }

    /// A branch compiled for effect only.
    fn compile_branch_statement(&mut self, expr: &Expr) -> CResult<()> {
        self.compile_statement(expr)
    }

    fn compile_while(&mut self, cond: &Expr, body: &Expr, offset: usize) -> CResult<CValue> {
        let cond_offset = self.offset(cond);

        // A constant-false condition compiles to nothing.
        {
            let probe = self.probe_const(cond);
            if probe == Some(false) {
                return Ok(CValue::Null);
            }
        }

        let head = self.pos();
        let open = self.cur().open_handlers;
        self.push_scope(ScopeKind::Loop {
            head,
            breaks: Vec::new(),
            handlers_at_entry: open,
        });

        let cond_value = self.compile_expr(cond, Hint::Value)?;
        let exit = match cond_value.const_truthy() {
            Some(true) => None,
            _ => {
                let cond_reg = self.materialize(cond_value, cond_offset)?;
                Some(self.emit_jump(Op::JumpIfFalse, Some(cond_reg), cond_offset))
            }
        };

        self.push_scope(ScopeKind::Block);
        let body_result = self.compile_statement(body);
        self.pop_scope();
        body_result.map_err(|e| {
            self.pop_scope();
            e
        })?;

        self.emit_jump_back(head, offset);
        if let Some(exit) = exit {
            self.patch_jump(exit);
        }
        self.finish_loop();
        Ok(CValue::Null)
    }

    fn compile_for(
        &mut self,
        binding: &str,
        iterable: &Expr,
        body: &Expr,
        offset: usize,
    ) -> CResult<CValue> {
        let iter_value = self.compile_expr(iterable, Hint::Value)?;
        let iter_offset = self.offset(iterable);
        let source_reg = self.materialize(iter_value, iter_offset)?;
        let iter_reg = self.emit(Op::IterInit, Data::un(source_reg), iter_offset);

        let head = self.pos();
        let element = self.emit(Op::IterNext, Data::jump_condition(iter_reg, 0), iter_offset);

        let open = self.cur().open_handlers;
        self.push_scope(ScopeKind::Loop {
            head,
            breaks: Vec::new(),
            handlers_at_entry: open,
        });
        self.push_scope(ScopeKind::Block);
        let declared = self.declare(binding, element, true, offset);
        let body_result = declared.and_then(|_| self.compile_statement(body));
        self.pop_scope();
        body_result.map_err(|e| {
            self.pop_scope();
            e
        })?;

        self.emit_jump_back(head, offset);
        // The exhausted jump and every `break` land here.
        let exit_delta = (self.pos() - head) as i32;
        {
            let ctx = self.fns.last().expect("function context stack is never empty");
            let code_index = ctx.body[head] as usize;
            let data = self.module.code.data[code_index];
            self.module.code.data[code_index] = data.patch_jump_condition(exit_delta);
        }
        self.finish_loop();
        Ok(CValue::Null)
    }

    /// Pop the loop scope, patching pending breaks to the current
    /// position.
    fn finish_loop(&mut self) {
        let scope = self.scopes.pop().expect("loop scope present");
        if let ScopeKind::Loop { breaks, .. } = scope.kind {
            for jump_pos in breaks {
                self.patch_jump(jump_pos);
            }
        }
    }

    fn compile_jump(&mut self, kind: &JumpKind, offset: usize) -> CResult<CValue> {
        match kind {
            JumpKind::Break | JumpKind::Continue => {
                let open = self.cur().open_handlers;
                let current_fn = self.fns.len() - 1;
                let mut target: Option<(usize, usize, u32)> = None;
                for (i, scope) in self.scopes.iter().enumerate().rev() {
                    if scope.fn_index != current_fn {
                        break;
                    }
                    if let ScopeKind::Loop {
                        head,
                        handlers_at_entry,
                        ..
                    } = &scope.kind
                    {
                        target = Some((i, *head, *handlers_at_entry));
                        break;
                    }
                }
                let Some((scope_index, head, handlers_at_entry)) = target else {
                    let what = if matches!(kind, JumpKind::Break) {
                        "break"
                    } else {
                        "continue"
                    };
                    return self.err(format!("'{}' outside of a loop", what), offset);
                };
                for _ in handlers_at_entry..open {
                    self.emit(Op::PopErrHandler, Data::NONE, offset);
                }
                if matches!(kind, JumpKind::Break) {
                    let jump_pos = self.emit_jump(Op::Jump, None, offset);
                    if let ScopeKind::Loop { breaks, .. } = &mut self.scopes[scope_index].kind {
                        breaks.push(jump_pos);
                    }
                } else {
                    self.emit_jump_back(head, offset);
                }
                Ok(CValue::Empty)
            }
            JumpKind::Return(value) => {
                let open = self.cur().open_handlers;
                let result = match value {
                    Some(expr) => Some(self.compile_expr(expr, Hint::Value)?),
                    None => None,
                };
                for _ in 0..open {
                    self.emit(Op::PopErrHandler, Data::NONE, offset);
                }
                match result {
                    None | Some(CValue::Null) | Some(CValue::Empty) => {
                        self.emit(Op::RetNull, Data::NONE, offset);
                    }
                    Some(v) => {
                        let reg = self.materialize(v, offset)?;
                        self.emit(Op::Ret, Data::un(reg), offset);
                    }
                }
                Ok(CValue::Empty)
            }
        }
    }

    fn compile_sequence(&mut self, op: Op, elements: &[Expr], offset: usize) -> CResult<CValue> {
        let mut regs = Vec::with_capacity(elements.len());
        for element in elements {
            let value = self.compile_expr(element, Hint::Value)?;
            let element_offset = self.offset(element);
            regs.push(self.materialize(value, element_offset)?);
        }
        let (extra_off, extra_len) = self.module.add_extra(&regs);
        Ok(CValue::Rt(self.emit(
            op,
            Data::extra(extra_off, extra_len),
            offset,
        )))
    }

    fn compile_map(&mut self, pairs: &[(Expr, Expr)], offset: usize) -> CResult<CValue> {
        let mut regs = Vec::with_capacity(pairs.len() * 2);
        for (key, value) in pairs {
            let key_value = self.compile_expr(key, Hint::Value)?;
            regs.push(self.materialize(key_value, self.offset(key))?);
            let value_value = self.compile_expr(value, Hint::Value)?;
            regs.push(self.materialize(value_value, self.offset(value))?);
        }
        let (extra_off, extra_len) = self.module.add_extra(&regs);
        Ok(CValue::Rt(self.emit(
            Op::BuildMap,
            Data::extra(extra_off, extra_len),
            offset,
        )))
    }

    fn compile_range(
        &mut self,
        start: &Expr,
        end: &Expr,
        step: Option<&Expr>,
        offset: usize,
    ) -> CResult<CValue> {
        let start_value = self.compile_expr(start, Hint::Value)?;
        let start_reg = self.materialize(start_value, offset)?;
        let end_value = self.compile_expr(end, Hint::Value)?;
        let end_reg = self.materialize(end_value, offset)?;
        match step {
            None => Ok(CValue::Rt(self.emit(
                Op::BuildRange,
                Data::bin(start_reg, end_reg),
                offset,
            ))),
            Some(step) => {
                let step_value = self.compile_expr(step, Hint::Value)?;
                let step_reg = self.materialize(step_value, offset)?;
                let (extra_off, _) = self.module.add_extra(&[end_reg, step_reg]);
                Ok(CValue::Rt(self.emit(
                    Op::BuildRangeStep,
                    Data::range(start_reg, extra_off),
                    offset,
                )))
            }
        }
    }

    fn compile_fn(&mut self, params: &[String], body: &Expr, offset: usize) -> CResult<CValue> {
        if params.len() > u8::MAX as usize {
            return self.err("Too many parameters", offset);
        }
        self.fns.push(FnCtx {
            arity: params.len() as u32,
            body: Vec::new(),
            captures: Vec::new(),
            scope_base: self.scopes.len(),
            open_handlers: 0,
        });
        self.push_scope(ScopeKind::Fn);
        for (i, param) in params.iter().enumerate() {
            if let Err(e) = self.declare(param, i as u32, true, offset) {
                self.pop_scope();
                self.fns.pop();
                return Err(e);
            }
        }

        let body_value = self.compile_expr(body, Hint::Value);
        let finished = body_value.and_then(|value| {
            let body_offset = self.offset(body);
            match value {
                CValue::Empty | CValue::Null => {
                    self.emit(Op::RetNull, Data::NONE, body_offset);
                    Ok(())
                }
                value => {
                    let reg = self.materialize(value, body_offset)?;
                    self.emit(Op::Ret, Data::un(reg), body_offset);
                    Ok(())
                }
            }
        });

        self.pop_scope();
        let ctx = self.fns.pop().expect("function context present");
        finished?;

        let mut words = Vec::with_capacity(2 + ctx.captures.len() + ctx.body.len());
        words.push(ctx.arity);
        if ctx.captures.is_empty() {
            words.extend_from_slice(&ctx.body);
            let (extra_off, extra_len) = self.module.add_extra(&words);
            Ok(CValue::Rt(self.emit(
                Op::BuildFunc,
                Data::extra(extra_off, extra_len),
                offset,
            )))
        } else {
            words.push(ctx.captures.len() as u32);
            words.extend(ctx.captures.iter().map(|&(_, outer)| outer));
            words.extend_from_slice(&ctx.body);
            let (extra_off, extra_len) = self.module.add_extra(&words);
            Ok(CValue::Rt(self.emit(
                Op::BuildFuncCapture,
                Data::extra(extra_off, extra_len),
                offset,
            )))
        }
    }

    fn compile_call(&mut self, callee: &Expr, args: &[Expr], offset: usize) -> CResult<CValue> {
        let callee_value = self.compile_expr(callee, Hint::Value)?;
        let callee_reg = self.materialize(callee_value, offset)?;
        let mut arg_regs = Vec::with_capacity(args.len());
        for arg in args {
            let value = self.compile_expr(arg, Hint::Value)?;
            let arg_offset = self.offset(arg);
            arg_regs.push(self.materialize(value, arg_offset)?);
        }
        let reg = match arg_regs.len() {
            0 => self.emit(Op::CallZero, Data::un(callee_reg), offset),
            1 => self.emit(Op::CallOne, Data::bin(callee_reg, arg_regs[0]), offset),
            _ => {
                let mut words = Vec::with_capacity(1 + arg_regs.len());
                words.push(callee_reg);
                words.extend_from_slice(&arg_regs);
                let (extra_off, extra_len) = self.module.add_extra(&words);
                self.emit(Op::Call, Data::extra(extra_off, extra_len), offset)
            }
        };
        Ok(CValue::Rt(reg))
    }

    fn compile_method_call(
        &mut self,
        recv: &Expr,
        name: &str,
        args: &[Expr],
        offset: usize,
    ) -> CResult<CValue> {
        // `.append` is an opcode, not a callable.
        if name == "append" && args.len() == 1 {
            let recv_value = self.compile_expr(recv, Hint::Value)?;
            let recv_reg = self.materialize(recv_value, offset)?;
            let arg_value = self.compile_expr(&args[0], Hint::Value)?;
            let arg_reg = self.materialize(arg_value, offset)?;
            self.emit(Op::Append, Data::bin(recv_reg, arg_reg), offset);
            return Ok(CValue::Null);
        }

        // The callee is an ordinary binding, with the host registry as a
        // fallback; the receiver becomes `this`.
        let callee_reg = if self.lookup_exists(name) {
            let value = self.compile_identifier(name, offset)?;
            self.materialize(value, offset)?
        } else {
            let (off, len) = self.module.add_string(name);
            self.emit(Op::Native, Data::str(off, len), offset)
        };

        let recv_value = self.compile_expr(recv, Hint::Value)?;
        let recv_reg = self.materialize(recv_value, offset)?;
        let mut arg_regs = Vec::with_capacity(args.len());
        for arg in args {
            let value = self.compile_expr(arg, Hint::Value)?;
            let arg_offset = self.offset(arg);
            arg_regs.push(self.materialize(value, arg_offset)?);
        }
        let reg = if arg_regs.is_empty() {
            self.emit(Op::ThisCallZero, Data::bin(callee_reg, recv_reg), offset)
        } else {
            let mut words = Vec::with_capacity(2 + arg_regs.len());
            words.push(callee_reg);
            words.push(recv_reg);
            words.extend_from_slice(&arg_regs);
            let (extra_off, extra_len) = self.module.add_extra(&words);
            self.emit(Op::ThisCall, Data::extra(extra_off, extra_len), offset)
        };
        Ok(CValue::Rt(reg))
    }

    fn lookup_exists(&self, name: &str) -> bool {
        self.scopes.iter().rev().any(|s| s.find(name).is_some())
    }

    fn compile_try(
        &mut self,
        expr: &Expr,
        catch: Option<&CatchClause>,
        hint: Hint,
        offset: usize,
    ) -> CResult<CValue> {
        match catch {
            None => {
                // Propagate: a resulting error value returns from the
                // enclosing function.
                let value = self.compile_expr(expr, Hint::Value)?;
                if value.is_const() {
                    // Constants are never errors.
                    return Ok(value);
                }
                let reg = match &value {
                    CValue::Rt(r) | CValue::Ref(r) => *r,
                    _ => self.materialize(value.clone(), offset)?,
                };
                let to_exit = self.emit_jump(Op::UnwrapErrorOrJump, Some(reg), offset);
                let to_end = self.emit_jump(Op::Jump, None, offset);
                self.patch_jump(to_exit);
                let open = self.cur().open_handlers;
                for _ in 0..open {
                    self.emit(Op::PopErrHandler, Data::NONE, offset);
                }
                self.emit(Op::Ret, Data::un(reg), offset);
                self.patch_jump(to_end);
                Ok(value)
            }
            Some(clause) => {
                let want_value = hint == Hint::Value;
                let slot = if want_value {
                    Some(self.emit(Op::Nop, Data::NONE, offset))
                } else {
                    None
                };
                let catch_reg = self.emit(Op::Nop, Data::NONE, offset);
                let push_pos = self.emit_jump(Op::PushErrHandler, Some(catch_reg), offset);
                self.cur().open_handlers += 1;

                self.protected_depth += 1;
                let protected = self.compile_expr(expr, Hint::Value);
                self.protected_depth -= 1;
                let value = protected?;
                let value_reg = self.materialize(value, offset)?;

                self.emit(Op::PopErrHandler, Data::NONE, offset);
                self.cur().open_handlers -= 1;

                let to_err_value = self.emit_jump(Op::UnwrapErrorOrJump, Some(value_reg), offset);
                if let Some(slot) = slot {
                    self.emit(Op::Copy, Data::bin(slot, value_reg), offset);
                }
                let to_end = self.emit_jump(Op::Jump, None, offset);

                // Error-value path: deliver the error to the catch
                // register, then fall into the handler.
                self.patch_jump(to_err_value);
                self.emit(Op::Copy, Data::bin(catch_reg, value_reg), offset);

                // Raised errors land here directly.
                self.patch_jump(push_pos);
                self.push_scope(ScopeKind::Block);
                let handler_result = (|| {
                    if let Some(binding) = &clause.binding {
                        self.declare(binding, catch_reg, false, offset)?;
                    }
                    let handler_hint = if want_value { Hint::Value } else { Hint::Discard };
                    let handler_value = self.compile_expr(&clause.handler, handler_hint)?;
                    if let Some(slot) = slot {
                        let handler_offset = self.offset(&clause.handler);
                        self.copy_into(slot, handler_value, handler_offset)?;
                    }
                    Ok(())
                })();
                self.pop_scope();
                handler_result?;

                self.patch_jump(to_end);
                match slot {
                    Some(slot) => Ok(CValue::Rt(slot)),
                    None => Ok(CValue::Empty),
                }
            }
        }
    }

    fn compile_match(
        &mut self,
        subject: &Expr,
        cases: &[MatchCase],
        hint: Hint,
        offset: usize,
    ) -> CResult<CValue> {
        let subject_value = self.compile_expr(subject, Hint::Value)?;
        let subject_reg = self.materialize(subject_value, offset)?;

        let want_value = hint == Hint::Value;
        let slot = if want_value {
            Some(self.emit(Op::Nop, Data::NONE, offset))
        } else {
            None
        };

        let mut end_jumps = Vec::with_capacity(cases.len());
        for case in cases {
            let case_offset = self.offset_base + case.span.start;
            let mut fail_jumps = Vec::new();
            self.push_scope(ScopeKind::Block);
            let arm = (|| {
                self.compile_pattern_test(&case.pattern, subject_reg, &mut fail_jumps, case_offset)?;
                let body_hint = if want_value { Hint::Value } else { Hint::Discard };
                let body_value = self.compile_expr(&case.body, body_hint)?;
                if let Some(slot) = slot {
                    self.copy_into(slot, body_value, case_offset)?;
                } else if let CValue::Rt(reg) = body_value {
                    self.emit(Op::Discard, Data::un(reg), case_offset);
                }
                Ok(())
            })();
            self.pop_scope();
            arm?;
            end_jumps.push(self.emit_jump(Op::Jump, None, case_offset));
            for fail in fail_jumps {
                self.patch_jump(fail);
            }
        }
        // No arm matched: the slot keeps its null.
        for end in end_jumps {
            self.patch_jump(end);
        }
        match slot {
            Some(slot) => Ok(CValue::Rt(slot)),
            None => Ok(CValue::Empty),
        }
    }

    /// Emit the tests for one pattern against a subject register,
    /// pushing forward jumps taken when the pattern does not match.
    fn compile_pattern_test(
        &mut self,
        pattern: &Pattern,
        subject: u32,
        fail_jumps: &mut Vec<usize>,
        offset: usize,
    ) -> CResult<()> {
        match pattern {
            Pattern::Wildcard => Ok(()),
            Pattern::Binding(name) => {
                self.scopes
                    .last_mut()
                    .expect("scope stack is never empty")
                    .symbols
                    .push(Symbol {
                        name: name.clone(),
                        reg: subject,
                        mutable: false,
                        synthetic: false,
                    });
                Ok(())
            }
            Pattern::Literal(lit) => {
                let lit_reg = self.materialize(literal_value(lit), offset)?;
                let test = self.emit(Op::Equal, Data::bin(subject, lit_reg), offset);
                fail_jumps.push(self.emit_jump(Op::JumpIfFalse, Some(test), offset));
                Ok(())
            }
            Pattern::Tuple(elements) | Pattern::List(elements) => {
                let copy = self.emit(Op::CopyUn, Data::un(subject), offset);
                self.emit(Op::CheckLen, Data::bin(copy, elements.len() as u32), offset);
                fail_jumps.push(self.emit_jump(Op::JumpIfNull, Some(copy), offset));
                for (i, element) in elements.iter().enumerate() {
                    if matches!(element, Pattern::Wildcard) {
                        continue;
                    }
                    let index = self.emit(Op::Int, Data::int(i as i64), offset);
                    let reg = self.emit(Op::Get, Data::bin(copy, index), offset);
                    self.compile_pattern_test(element, reg, fail_jumps, offset)?;
                }
                Ok(())
            }
            Pattern::Tagged { name, payload } => match payload {
                None => {
                    let (off, len) = self.module.add_string(name);
                    let tag_reg = self.emit(Op::BuildTaggedNull, Data::str(off, len), offset);
                    let test = self.emit(Op::Equal, Data::bin(subject, tag_reg), offset);
                    fail_jumps.push(self.emit_jump(Op::JumpIfFalse, Some(test), offset));
                    Ok(())
                }
                Some(inner) => {
                    let (off, len) = self.module.add_string(name);
                    let (extra_off, _) = self.module.add_extra(&[off, len]);
                    let payload_reg = self.emit(
                        Op::UnwrapTaggedOrNull,
                        Data::range(subject, extra_off),
                        offset,
                    );
                    fail_jumps.push(self.emit_jump(Op::JumpIfNull, Some(payload_reg), offset));
                    self.compile_pattern_test(inner, payload_reg, fail_jumps, offset)
                }
            },
            Pattern::Error(payload) => {
                let test = self.emit(Op::Is, Data::bin_ty(subject, TypeTag::Error), offset);
                fail_jumps.push(self.emit_jump(Op::JumpIfFalse, Some(test), offset));
                if let Some(inner) = payload {
                    let payload_reg = self.emit(Op::UnwrapError, Data::un(subject), offset);
                    self.compile_pattern_test(inner, payload_reg, fail_jumps, offset)?;
                }
                Ok(())
            }
        }
    }

    /// Constant truthiness of an expression without emitting anything;
    /// only trivially-constant conditions qualify.
    fn probe_const(&self, expr: &Expr) -> Option<bool> {
        match &expr.kind {
            ExprKind::Literal(lit) => literal_value(lit).const_truthy(),
            ExprKind::Grouped(inner) => self.probe_const(inner),
            _ => None,
        }
    }
}

fn literal_value(lit: &Literal) -> CValue {
    match lit {
        Literal::Null => CValue::Null,
        Literal::Bool(b) => CValue::Bool(*b),
        Literal::Int(n) => CValue::Int(*n),
        Literal::Num(n) => CValue::Num(*n),
        Literal::Str(s) => CValue::Str(s.clone()),
    }
}

fn binary_opcode(op: BinaryOp) -> Op {
    match op {
        BinaryOp::Add => Op::Add,
        BinaryOp::Sub => Op::Sub,
        BinaryOp::Mul => Op::Mul,
        BinaryOp::Div => Op::Div,
        BinaryOp::DivFloor => Op::DivFloor,
        BinaryOp::Rem => Op::Rem,
        BinaryOp::Pow => Op::Pow,
        BinaryOp::Shl => Op::LShift,
        BinaryOp::Shr => Op::RShift,
        BinaryOp::BitAnd => Op::BitAnd,
        BinaryOp::BitOr => Op::BitOr,
        BinaryOp::BitXor => Op::BitXor,
        BinaryOp::Equal => Op::Equal,
        BinaryOp::NotEqual => Op::NotEqual,
        BinaryOp::Less => Op::LessThan,
        BinaryOp::LessEqual => Op::LessThanEqual,
        BinaryOp::Greater => Op::GreaterThan,
        BinaryOp::GreaterEqual => Op::GreaterThanEqual,
        BinaryOp::In => Op::In,
        BinaryOp::And | BinaryOp::Or => unreachable!("short-circuit ops have no opcode"),
    }
}

/// Floor division; `None` on `i64::MIN / -1`.
pub fn floor_div(a: i64, b: i64) -> Option<i64> {
    let q = a.checked_div(b)?;
    if a % b != 0 && (a < 0) != (b < 0) {
        Some(q - 1)
    } else {
        Some(q)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::verify::verify_module;
    use crate::lexer::Scanner;
    use crate::parser::Parser;

    fn compile_source(source: &str) -> Result<Bytecode, CompileErrors> {
        let tokens = Scanner::new(source).scan_tokens().expect("scan failed");
        let program = Parser::new(tokens).parse().expect("parse failed");
        compile("<test>", source, &program)
    }

    fn ops_of(module: &Bytecode) -> Vec<Op> {
        module.main.iter().map(|&i| module.code.op[i as usize]).collect()
    }

    #[test]
    fn test_constant_folding_produces_single_literal() {
        let module = compile_source("let x = 1 + 2 * 3\nx").expect("compile failed");
        let ops = ops_of(&module);
        assert_eq!(ops, vec![Op::Int, Op::Ret]);
        assert_eq!(module.code.data[module.main[0] as usize].as_int(), 7);
    }

    #[test]
    fn test_call_uses_extra_pool_for_two_args() {
        let module = compile_source("let f = fn(a, b) a + b\nf(40, 2)").expect("compile failed");
        let ops = ops_of(&module);
        assert!(ops.contains(&Op::BuildFunc), "non-capturing fn: {:?}", ops);
        assert!(ops.contains(&Op::Call));
        // The call's extra is [callee, arg0, arg1].
        let call_index = module
            .main
            .iter()
            .position(|&i| module.code.op[i as usize] == Op::Call)
            .expect("call present");
        let data = module.code.data[module.main[call_index] as usize];
        let (off, len) = data.as_slice();
        assert_eq!(len, 3);
        assert_eq!(module.get_extra(off, len).len(), 3);
    }

    #[test]
    fn test_destructuring_shape() {
        let module = compile_source("let (a, _, b) = (1, 2, 3)\na + b").expect("compile failed");
        let ops = ops_of(&module);
        let asserts = ops.iter().filter(|&&op| op == Op::AssertLen).count();
        let gets = ops.iter().filter(|&&op| op == Op::Get).count();
        let discards = ops.iter().filter(|&&op| op == Op::Discard).count();
        assert_eq!(asserts, 1);
        assert_eq!(gets, 2, "only the bound elements are fetched");
        assert_eq!(discards, 1, "the spent tuple temporary is discarded");
    }

    #[test]
    fn test_for_loop_uses_iterator_protocol() {
        let module =
            compile_source("let acc = []\nfor x in 1:4 acc.append(x)\nacc").expect("compile failed");
        let ops = ops_of(&module);
        assert!(ops.contains(&Op::BuildRange));
        assert!(ops.contains(&Op::IterInit));
        assert!(ops.contains(&Op::IterNext));
        assert!(ops.contains(&Op::Append));
    }

    #[test]
    fn test_capture_compiles_to_build_func_capture() {
        let module =
            compile_source("let mk = fn(n) fn() n\nlet g = mk(7)\ng() + g()").expect("compile failed");
        let all_ops: Vec<Op> = module.code.op.clone();
        assert!(all_ops.contains(&Op::BuildFuncCapture));
        assert!(all_ops.contains(&Op::LoadCapture));
    }

    #[test]
    fn test_short_circuit_drops_constant_rhs() {
        let module = compile_source("false and @print(\"nope\")").expect("compile failed");
        let ops = ops_of(&module);
        assert!(!ops.contains(&Op::Native), "rhs must be dropped: {:?}", ops);
    }

    #[test]
    fn test_fold_trap_is_a_compile_error_outside_catch() {
        assert!(compile_source("1 / 0").is_err());
        assert!(compile_source("9223372036854775807 + 1").is_err());
    }

    #[test]
    fn test_fold_trap_is_runtime_inside_catch() {
        let module = compile_source("try 10 / 0 catch |e| e").expect("compile failed");
        let ops = ops_of(&module);
        assert!(ops.contains(&Op::Div));
        assert!(ops.contains(&Op::PushErrHandler));
        assert!(ops.contains(&Op::PopErrHandler));
    }

    #[test]
    fn test_duplicate_declaration_errors() {
        assert!(compile_source("let x = 1\nlet x = 2").is_err());
    }

    #[test]
    fn test_assign_to_const_errors() {
        assert!(compile_source("const k = 1\nk = 2").is_err());
    }

    #[test]
    fn test_undefined_variable_reports_all_diagnostics() {
        let err = compile_source("missing_a\nmissing_b").expect_err("must fail");
        assert_eq!(err.0.len(), 2);
    }

    #[test]
    fn test_break_outside_loop_errors() {
        assert!(compile_source("break").is_err());
    }

    #[test]
    fn test_compiled_modules_verify() {
        let sources = [
            "let x = 1 + 2 * 3\nx",
            "let f = fn(a, b) a + b\nf(40, 2)",
            "let acc = []\nfor x in 1:4 acc.append(x)\nacc",
            "let r = try 10 / 0 catch |e| e\nr is error",
            "let mk = fn(n) fn() n\nlet g = mk(7)\ng() + g()",
            "let (a, _, b) = (1, 2, 3)\na + b",
            "let m = {\"a\": 1}\nm[\"a\"]",
            "let i = 0\nwhile i < 3 { i += 1 }\ni",
            "match (1, 2) { (a, b) => a + b, _ => 0 }",
        ];
        for source in sources {
            let module = compile_source(source).expect("compile failed");
            verify_module(&module).expect("verification failed");
        }
    }

    #[test]
    fn test_incremental_compile_rolls_back_on_error() {
        let mut compiler = Compiler::new("<repl>", "");
        let tokens = Scanner::new("let x = 1").scan_tokens().expect("scan failed");
        let program = Parser::new(tokens).parse().expect("parse failed");
        compiler.compile_more("let x = 1", &program).expect("first line compiles");

        let code_len = compiler.module().code.len();
        let main_len = compiler.module().main.len();

        let tokens = Scanner::new("x + missing").scan_tokens().expect("scan failed");
        let program = Parser::new(tokens).parse().expect("parse failed");
        assert!(compiler.compile_more("x + missing", &program).is_err());
        assert_eq!(compiler.module().code.len(), code_len);
        assert_eq!(compiler.module().main.len(), main_len);

        // The module still works for subsequent lines.
        let tokens = Scanner::new("x + 1").scan_tokens().expect("scan failed");
        let program = Parser::new(tokens).parse().expect("parse failed");
        compiler.compile_more("x + 1", &program).expect("later line compiles");
        assert!(compiler.module().code.len() > code_len);
    }
}
