//! The register virtual machine.
//!
//! One instruction dispatch loop over the current frame's body slice.
//! A raise is modeled as a scan of each frame's error-handler stack,
//! innermost out; an unhandled raise unwinds everything into a
//! traceback built from the debug line map.

pub mod heap;
mod loader;
pub mod natives;
pub mod value;

use crate::bytecode::instruction::{Data, Op, PRIM_NULL, PRIM_TRUE};
use crate::bytecode::module::Bytecode;
use crate::error::{RuntimeError, TraceFrame};
use crate::span::line_column;
use crate::vm::heap::{Handle, Heap};
use crate::vm::loader::Loader;
use crate::vm::natives::NativeRegistry;
use crate::vm::value::{cast_value, compare, deep_equal, render, Func, Globals, Iter, Value};
use std::cell::RefCell;
use std::cmp::Ordering;
use std::path::PathBuf;
use std::rc::Rc;

/// An armed error handler: resume target (body position) and the
/// register that receives the error value.
#[derive(Debug, Clone, Copy)]
struct Handler {
    target: usize,
    reg: u32,
}

/// One invocation.
struct Frame {
    /// Register file; the module frame shares it with the globals table.
    regs: Globals,
    arity: u32,
    this: Handle,
    body: Rc<Vec<u32>>,
    ip: usize,
    captures: Rc<Vec<Handle>>,
    module: Rc<Bytecode>,
    globals: Globals,
    /// Caller register that receives this frame's return value.
    dst: u32,
    handlers: Vec<Handler>,
}

/// An in-flight raise: the error value plus the frames unwound so far.
struct Raise {
    value: Handle,
    trace: Vec<TraceFrame>,
}

enum Flow {
    Normal,
    Return(Handle),
}

type StepResult<T> = Result<T, Raise>;

/// The virtual machine. Single-threaded; owns the heap and call stack.
pub struct Vm {
    pub heap: Heap,
    frames: Vec<Frame>,
    natives: NativeRegistry,
    loader: Option<Loader>,
    /// Persistent roots: REPL base frame, cached import results.
    roots: Vec<Handle>,
    null: Handle,
    tru: Handle,
    fls: Handle,
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

impl Vm {
    pub fn new() -> Self {
        let mut heap = Heap::new();
        let null = heap.alloc(Value::Null);
        let tru = heap.alloc(Value::Bool(true));
        let fls = heap.alloc(Value::Bool(false));
        Self {
            heap,
            frames: Vec::new(),
            natives: NativeRegistry::new(),
            loader: None,
            roots: Vec::new(),
            null,
            tru,
            fls,
        }
    }

    /// Allow `import` to compile and run files relative to `base`.
    pub fn enable_imports(&mut self, base: PathBuf) {
        self.loader = Some(Loader::new(base));
    }

    pub fn natives_mut(&mut self) -> &mut NativeRegistry {
        &mut self.natives
    }

    /// Keep a value alive across runs (REPL frame, host-held values).
    pub fn add_root(&mut self, handle: Handle) {
        self.roots.push(handle);
    }

    pub fn render_value(&self, handle: Handle) -> String {
        render(&self.heap, handle)
    }

    pub fn value(&self, handle: Handle) -> &Value {
        self.heap.value(handle)
    }

    /// Run a module to completion; the result is its top-level value.
    pub fn run_module(&mut self, module: Rc<Bytecode>) -> Result<Handle, RuntimeError> {
        let floor = self.frames.len();
        let globals = Rc::new(RefCell::new(vec![self.null; module.main.len()]));
        self.push_module_frame(module, globals);
        match self.execute_until(floor) {
            Ok(value) => Ok(value),
            Err(raise) => Err(self.render_raise(raise)),
        }
    }

    /// Run the tail of a REPL module: instructions `from..` of `main`
    /// against the persistent base-frame registers. Returns the value of
    /// the last new instruction, if it produced one.
    pub fn run_repl_line(
        &mut self,
        module: Rc<Bytecode>,
        globals: Globals,
        from: usize,
    ) -> Result<Option<Handle>, RuntimeError> {
        globals.borrow_mut().resize(module.main.len(), self.null);
        let floor = self.frames.len();
        self.frames.push(Frame {
            regs: globals.clone(),
            arity: 0,
            this: self.null,
            body: Rc::new(module.main.clone()),
            ip: from,
            captures: Rc::new(Vec::new()),
            module: module.clone(),
            globals: globals.clone(),
            dst: 0,
            handlers: Vec::new(),
        });
        match self.execute_until(floor) {
            Ok(_) => {
                let last = module.main.len();
                if last == from {
                    return Ok(None);
                }
                let last_op = module.code.op[module.main[last - 1] as usize];
                if last_op.has_result() {
                    let value = globals.borrow()[last - 1];
                    Ok(Some(value))
                } else {
                    Ok(None)
                }
            }
            Err(raise) => Err(self.render_raise(raise)),
        }
    }

    fn push_module_frame(&mut self, module: Rc<Bytecode>, globals: Globals) {
        self.frames.push(Frame {
            regs: globals.clone(),
            arity: 0,
            this: self.null,
            body: Rc::new(module.main.clone()),
            ip: 0,
            captures: Rc::new(Vec::new()),
            module,
            globals,
            dst: 0,
            handlers: Vec::new(),
        });
    }

    // ---- the dispatch loop ----

    fn execute_until(&mut self, floor: usize) -> StepResult<Handle> {
        while self.frames.len() > floor {
            // Collection happens only between instructions.
            if self.heap.should_collect() {
                let roots = self.gather_roots();
                self.heap.collect(&roots);
            }

            let fetched = {
                let frame = self.frames.last_mut().expect("active frame");
                if frame.ip >= frame.body.len() {
                    None
                } else {
                    let code_index = frame.body[frame.ip] as usize;
                    frame.ip += 1;
                    Some((code_index, frame.module.clone()))
                }
            };

            let Some((code_index, module)) = fetched else {
                // Body exhausted without `ret` (incremental execution).
                if let Some(result) = self.deliver(self.null, floor) {
                    return Ok(result);
                }
                continue;
            };

            let op = module.code.op[code_index];
            let data = module.code.data[code_index];
            match self.step(op, data, &module) {
                Ok(Flow::Normal) => {}
                Ok(Flow::Return(value)) => {
                    if let Some(result) = self.deliver(value, floor) {
                        return Ok(result);
                    }
                }
                Err(raise) => self.unwind(raise, floor)?,
            }
        }
        Ok(self.null)
    }

    /// Pop the returning frame and store its value in the caller's
    /// expected register; `Some` when the popped frame was the entry.
    fn deliver(&mut self, value: Handle, floor: usize) -> Option<Handle> {
        let frame = self.frames.pop().expect("returning frame");
        debug_assert!(
            frame.handlers.is_empty(),
            "error-handler stack must be balanced at return"
        );
        if self.frames.len() == floor {
            return Some(value);
        }
        let caller = self.frames.last().expect("caller frame");
        caller.regs.borrow_mut()[frame.dst as usize] = value;
        None
    }

    /// Scan handler stacks innermost-out; resume at a handler or keep
    /// popping frames into the traceback.
    fn unwind(&mut self, mut raise: Raise, floor: usize) -> StepResult<()> {
        while self.frames.len() > floor {
            let frame = self.frames.last_mut().expect("unwinding frame");
            if let Some(handler) = frame.handlers.pop() {
                frame.regs.borrow_mut()[handler.reg as usize] = raise.value;
                frame.ip = handler.target;
                return Ok(());
            }
            raise.trace.push(trace_entry(frame));
            self.frames.pop();
        }
        Err(raise)
    }

    fn render_raise(&self, raise: Raise) -> RuntimeError {
        let message = match self.heap.value(raise.value) {
            Value::Error(inner) => render(&self.heap, *inner),
            _ => render(&self.heap, raise.value),
        };
        RuntimeError {
            message,
            trace: raise.trace,
        }
    }

    fn gather_roots(&self) -> Vec<Handle> {
        let mut roots = self.roots.clone();
        roots.push(self.null);
        roots.push(self.tru);
        roots.push(self.fls);
        for frame in &self.frames {
            roots.push(frame.this);
            roots.extend_from_slice(&frame.regs.borrow());
            roots.extend_from_slice(&frame.captures);
        }
        roots
    }

    // ---- register access ----

    fn cur(&self) -> &Frame {
        self.frames.last().expect("active frame")
    }

    fn reg(&self, r: u32) -> Handle {
        self.cur().regs.borrow()[r as usize]
    }

    fn set_reg(&self, r: u32, value: Handle) {
        self.cur().regs.borrow_mut()[r as usize] = value;
    }

    /// The current instruction's own register.
    fn result_reg(&self) -> u32 {
        let frame = self.cur();
        frame.arity + (frame.ip - 1) as u32
    }

    fn set_result(&self, value: Handle) {
        self.set_reg(self.result_reg(), value);
    }

    /// Jump relative to the current instruction's body position.
    fn jump_by(&mut self, offset: i32) {
        let frame = self.frames.last_mut().expect("active frame");
        let pos = frame.ip as i64 - 1;
        frame.ip = (pos + offset as i64) as usize;
    }

    fn raise<T>(&mut self, message: impl Into<String>) -> StepResult<T> {
        let inner = self.heap.alloc(Value::Str(message.into()));
        let value = self.heap.alloc(Value::Error(inner));
        Err(Raise {
            value,
            trace: Vec::new(),
        })
    }

    fn bool_handle(&self, b: bool) -> Handle {
        if b {
            self.tru
        } else {
            self.fls
        }
    }

    // ---- instruction execution ----

    fn step(&mut self, op: Op, data: Data, module: &Rc<Bytecode>) -> StepResult<Flow> {
        match op {
            Op::Nop => self.set_result(self.null),
            Op::Primitive => {
                let value = match data.as_primitive() {
                    PRIM_NULL => self.null,
                    PRIM_TRUE => self.tru,
                    _ => self.fls,
                };
                self.set_result(value);
            }
            Op::Int => {
                let value = self.heap.alloc(Value::Int(data.as_int()));
                self.set_result(value);
            }
            Op::Num => {
                let value = self.heap.alloc(Value::Num(data.as_num()));
                self.set_result(value);
            }
            Op::Str => {
                let (offset, len) = data.as_slice();
                let text = module.get_string(offset, len).to_string();
                let value = self.heap.alloc(Value::Str(text));
                self.set_result(value);
            }

            Op::BuildTuple | Op::BuildList => {
                let (offset, len) = data.as_slice();
                let items: Vec<Handle> = module
                    .get_extra(offset, len)
                    .iter()
                    .map(|&r| self.reg(r))
                    .collect();
                let value = if op == Op::BuildTuple {
                    Value::Tuple(items)
                } else {
                    Value::List(items)
                };
                let handle = self.heap.alloc(value);
                self.set_result(handle);
            }
            Op::BuildMap => {
                let (offset, len) = data.as_slice();
                let refs: Vec<u32> = module.get_extra(offset, len).to_vec();
                let mut entries: Vec<(Handle, Handle)> = Vec::with_capacity(refs.len() / 2);
                for pair in refs.chunks(2) {
                    let key = self.reg(pair[0]);
                    let val = self.reg(pair[1]);
                    match entries
                        .iter_mut()
                        .find(|(k, _)| deep_equal(&self.heap, *k, key))
                    {
                        Some(entry) => entry.1 = val,
                        None => entries.push((key, val)),
                    }
                }
                let handle = self.heap.alloc(Value::Map(entries));
                self.set_result(handle);
            }
            Op::BuildError => {
                let inner = self.reg(data.as_un());
                let handle = self.heap.alloc(Value::Error(inner));
                self.set_result(handle);
            }
            Op::BuildErrorNull => {
                let handle = self.heap.alloc(Value::Error(self.null));
                self.set_result(handle);
            }
            Op::BuildTagged => {
                let (inner_ref, extra) = data.as_range();
                let words = module.get_extra(extra, 2);
                let name = module.get_string(words[0], words[1]).to_string();
                let inner = self.reg(inner_ref);
                let handle = self.heap.alloc(Value::Tagged {
                    name,
                    inner: Some(inner),
                });
                self.set_result(handle);
            }
            Op::BuildTaggedNull => {
                let (offset, len) = data.as_slice();
                let name = module.get_string(offset, len).to_string();
                let handle = self.heap.alloc(Value::Tagged { name, inner: None });
                self.set_result(handle);
            }
            Op::BuildRange => {
                let (start_ref, end_ref) = data.as_bin();
                let handle = self.build_range(self.reg(start_ref), self.reg(end_ref), None)?;
                self.set_result(handle);
            }
            Op::BuildRangeStep => {
                let (start_ref, extra) = data.as_range();
                let words = module.get_extra(extra, 2);
                let (end_ref, step_ref) = (words[0], words[1]);
                let step = self.reg(step_ref);
                let handle =
                    self.build_range(self.reg(start_ref), self.reg(end_ref), Some(step))?;
                self.set_result(handle);
            }
            Op::BuildFunc | Op::BuildFuncCapture => {
                let (offset, len) = data.as_slice();
                let words = module.get_extra(offset, len).to_vec();
                let (arity, captures, body) = if op == Op::BuildFunc {
                    (words[0], Vec::new(), words[1..].to_vec())
                } else {
                    let ncaps = words[1] as usize;
                    let captures: Vec<Handle> =
                        words[2..2 + ncaps].iter().map(|&r| self.reg(r)).collect();
                    (words[0], captures, words[2 + ncaps..].to_vec())
                };
                let frame = self.cur();
                let func = Func::Script {
                    arity,
                    body: Rc::new(body),
                    captures: Rc::new(captures),
                    module: frame.module.clone(),
                    globals: frame.globals.clone(),
                };
                let handle = self.heap.alloc(Value::Function(func));
                self.set_result(handle);
            }

            Op::Discard => {
                let value = self.reg(data.as_un());
                if matches!(self.heap.value(value), Value::Error(_)) {
                    return Err(Raise {
                        value,
                        trace: Vec::new(),
                    });
                }
            }
            Op::CopyUn => self.set_result(self.reg(data.as_un())),
            Op::Copy | Op::Move => {
                let (dst, src) = data.as_bin();
                self.set_reg(dst, self.reg(src));
            }
            Op::LoadGlobal => {
                let slot = data.as_un() as usize;
                let value = self.cur().globals.borrow().get(slot).copied();
                match value {
                    Some(value) => self.set_result(value),
                    None => return self.raise(format!("Global slot {} out of range", slot)),
                }
            }
            Op::LoadCapture => {
                let index = data.as_un() as usize;
                let value = self.cur().captures.get(index).copied();
                match value {
                    Some(value) => self.set_result(value),
                    None => return self.raise(format!("Capture {} out of range", index)),
                }
            }
            Op::LoadThis => self.set_result(self.cur().this),
            Op::Import => {
                let (offset, len) = data.as_slice();
                let path = module.get_string(offset, len).to_string();
                let value = self.import_module(&path)?;
                self.set_result(value);
            }
            Op::Native => {
                let (offset, len) = data.as_slice();
                let name = module.get_string(offset, len);
                let Some(f) = self.natives.get(name) else {
                    let name = name.to_string();
                    return self.raise(format!("Unknown native '{}'", name));
                };
                let func = Func::Native {
                    name: Rc::from(name),
                    f,
                };
                let handle = self.heap.alloc(Value::Function(func));
                self.set_result(handle);
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
            | Op::BitXor => {
                let (lhs, rhs) = data.as_bin();
                let result = self.arith(op, self.reg(lhs), self.reg(rhs))?;
                self.set_result(result);
            }

            Op::Equal | Op::NotEqual => {
                let (lhs, rhs) = data.as_bin();
                let eq = deep_equal(&self.heap, self.reg(lhs), self.reg(rhs));
                self.set_result(self.bool_handle(if op == Op::Equal { eq } else { !eq }));
            }
            Op::LessThan | Op::LessThanEqual | Op::GreaterThan | Op::GreaterThanEqual => {
                let (lhs, rhs) = data.as_bin();
                let ordering = match compare(&self.heap, self.reg(lhs), self.reg(rhs)) {
                    Ok(ordering) => ordering,
                    Err(message) => return self.raise(message),
                };
                let result = match op {
                    Op::LessThan => ordering == Ordering::Less,
                    Op::LessThanEqual => ordering != Ordering::Greater,
                    Op::GreaterThan => ordering == Ordering::Greater,
                    _ => ordering != Ordering::Less,
                };
                self.set_result(self.bool_handle(result));
            }
            Op::In => {
                let (item_ref, container_ref) = data.as_bin();
                let result = self.contains(self.reg(container_ref), self.reg(item_ref))?;
                self.set_result(self.bool_handle(result));
            }

            Op::Append => {
                let (list_ref, item_ref) = data.as_bin();
                let list = self.reg(list_ref);
                let item = self.reg(item_ref);
                match self.heap.get_mut(list) {
                    Some(Value::List(items)) => items.push(item),
                    Some(other) => {
                        let name = other.type_name();
                        return self.raise(format!("Cannot append to {}", name));
                    }
                    None => return self.raise("Cannot append to a dead value"),
                }
            }

            Op::As => {
                let (operand, ty) = data.as_bin_ty();
                let ty = ty.expect("compiler emits valid type tags");
                let value = self.reg(operand);
                match cast_value(&mut self.heap, value, ty) {
                    Ok(result) => self.set_result(result),
                    Err(message) => return self.raise(message),
                }
            }
            Op::Is => {
                let (operand, ty) = data.as_bin_ty();
                let ty = ty.expect("compiler emits valid type tags");
                let tag = self.heap.value(self.reg(operand)).type_tag();
                self.set_result(self.bool_handle(tag == ty));
            }

            Op::Negate => {
                let value = self.reg(data.as_un());
                let result = match self.heap.value(value) {
                    Value::Int(n) => match n.checked_neg() {
                        Some(n) => Value::Int(n),
                        None => return self.raise("Integer overflow"),
                    },
                    Value::Num(n) => Value::Num(-n),
                    other => {
                        let name = other.type_name();
                        return self.raise(format!("Cannot negate {}", name));
                    }
                };
                let handle = self.heap.alloc(result);
                self.set_result(handle);
            }
            Op::BoolNot => {
                let value = self.reg(data.as_un());
                match self.heap.value(value) {
                    Value::Bool(b) => {
                        let b = *b;
                        self.set_result(self.bool_handle(!b));
                    }
                    other => {
                        let name = other.type_name();
                        return self.raise(format!("Expected bool, got {}", name));
                    }
                }
            }
            Op::BitNot => {
                let value = self.reg(data.as_un());
                match self.heap.value(value) {
                    Value::Int(n) => {
                        let n = !n;
                        let handle = self.heap.alloc(Value::Int(n));
                        self.set_result(handle);
                    }
                    other => {
                        let name = other.type_name();
                        return self.raise(format!("Expected int, got {}", name));
                    }
                }
            }

            Op::UnwrapError => {
                let value = self.reg(data.as_un());
                match self.heap.value(value) {
                    Value::Error(inner) => {
                        let inner = *inner;
                        self.set_result(inner);
                    }
                    other => {
                        let name = other.type_name();
                        return self.raise(format!("Expected an error value, got {}", name));
                    }
                }
            }
            Op::UnwrapTagged | Op::UnwrapTaggedOrNull => {
                let (operand, extra) = data.as_range();
                let words = module.get_extra(extra, 2);
                let expected = module.get_string(words[0], words[1]);
                let value = self.reg(operand);
                let unwrapped = match self.heap.value(value) {
                    Value::Tagged { name, inner } if name == expected => {
                        Some(inner.unwrap_or(self.null))
                    }
                    _ => None,
                };
                match unwrapped {
                    Some(inner) => self.set_result(inner),
                    None if op == Op::UnwrapTaggedOrNull => self.set_result(self.null),
                    None => {
                        let expected = expected.to_string();
                        return self.raise(format!("Expected tagged value .{}", expected));
                    }
                }
            }

            Op::CheckLen | Op::AssertLen => {
                let (operand, expected) = data.as_bin();
                let value = self.reg(operand);
                let actual = match self.heap.value(value) {
                    Value::Tuple(items) | Value::List(items) => Some(items.len()),
                    _ => None,
                };
                if actual != Some(expected as usize) {
                    if op == Op::CheckLen {
                        self.set_reg(operand, self.null);
                    } else {
                        let found = match actual {
                            Some(len) => format!("length {}", len),
                            None => self.heap.value(value).type_name().to_string(),
                        };
                        return self.raise(format!(
                            "Expected a sequence of length {}, got {}",
                            expected, found
                        ));
                    }
                }
            }

            Op::Get | Op::GetOrNull => {
                let (container, index) = data.as_bin();
                let result =
                    self.index_get(self.reg(container), self.reg(index), op == Op::GetOrNull)?;
                self.set_result(result);
            }
            Op::Set => {
                let (container, extra) = data.as_range();
                let words = module.get_extra(extra, 2);
                let (index_ref, value_ref) = (words[0], words[1]);
                self.index_set(self.reg(container), self.reg(index_ref), self.reg(value_ref))?;
            }

            Op::PushErrHandler => {
                let (reg, offset) = data.as_jump_condition();
                let frame = self.frames.last_mut().expect("active frame");
                let target = (frame.ip as i64 - 1 + offset as i64) as usize;
                frame.handlers.push(Handler { target, reg });
            }
            Op::PopErrHandler => {
                let frame = self.frames.last_mut().expect("active frame");
                if frame.handlers.pop().is_none() {
                    return self.raise("Unbalanced error-handler stack");
                }
            }
            Op::Jump => self.jump_by(data.as_jump()),
            Op::JumpIfTrue | Op::JumpIfFalse => {
                let (operand, offset) = data.as_jump_condition();
                let truthy = self.heap.value(self.reg(operand)).is_truthy();
                if truthy == (op == Op::JumpIfTrue) {
                    self.jump_by(offset);
                }
            }
            Op::JumpIfNull => {
                let (operand, offset) = data.as_jump_condition();
                if matches!(self.heap.value(self.reg(operand)), Value::Null) {
                    self.jump_by(offset);
                }
            }
            Op::UnwrapErrorOrJump => {
                let (operand, offset) = data.as_jump_condition();
                if matches!(self.heap.value(self.reg(operand)), Value::Error(_)) {
                    self.jump_by(offset);
                }
            }

            Op::IterInit => {
                let source = self.reg(data.as_un());
                let iter = match self.heap.value(source) {
                    Value::Tuple(items) | Value::List(items) => Iter::Seq {
                        source,
                        index: 0,
                        len: items.len(),
                    },
                    Value::Str(_) => Iter::Str { source, index: 0 },
                    Value::Map(entries) => Iter::Map {
                        source,
                        index: 0,
                        len: entries.len(),
                    },
                    Value::Range { start, end, step } => Iter::Range {
                        current: *start,
                        end: *end,
                        step: *step,
                    },
                    other => {
                        let name = other.type_name();
                        return self.raise(format!("Cannot iterate over {}", name));
                    }
                };
                let handle = self.heap.alloc(Value::Iterator(iter));
                self.set_result(handle);
            }
            Op::IterNext => {
                let (iter_ref, offset) = data.as_jump_condition();
                let iter_handle = self.reg(iter_ref);
                match self.iter_next(iter_handle)? {
                    Some(element) => self.set_result(element),
                    None => self.jump_by(offset),
                }
            }

            Op::Call => {
                let (offset, len) = data.as_slice();
                let words = module.get_extra(offset, len).to_vec();
                let callee = self.reg(words[0]);
                let args: Vec<Handle> = words[1..].iter().map(|&r| self.reg(r)).collect();
                let dst = self.result_reg();
                self.call_value(callee, None, args, dst)?;
            }
            Op::CallOne => {
                let (callee_ref, arg_ref) = data.as_bin();
                let callee = self.reg(callee_ref);
                let args = vec![self.reg(arg_ref)];
                let dst = self.result_reg();
                self.call_value(callee, None, args, dst)?;
            }
            Op::CallZero => {
                let callee = self.reg(data.as_un());
                let dst = self.result_reg();
                self.call_value(callee, None, Vec::new(), dst)?;
            }
            Op::ThisCall => {
                let (offset, len) = data.as_slice();
                let words = module.get_extra(offset, len).to_vec();
                let callee = self.reg(words[0]);
                let this = self.reg(words[1]);
                let args: Vec<Handle> = words[2..].iter().map(|&r| self.reg(r)).collect();
                let dst = self.result_reg();
                self.call_value(callee, Some(this), args, dst)?;
            }
            Op::ThisCallZero => {
                let (callee_ref, this_ref) = data.as_bin();
                let callee = self.reg(callee_ref);
                let this = self.reg(this_ref);
                let dst = self.result_reg();
                self.call_value(callee, Some(this), Vec::new(), dst)?;
            }

            Op::Ret => return Ok(Flow::Return(self.reg(data.as_un()))),
            Op::RetNull => return Ok(Flow::Return(self.null)),
            Op::Throw => {
                let value = self.reg(data.as_un());
                let value = if matches!(self.heap.value(value), Value::Error(_)) {
                    value
                } else {
                    self.heap.alloc(Value::Error(value))
                };
                return Err(Raise {
                    value,
                    trace: Vec::new(),
                });
            }
        }
        Ok(Flow::Normal)
    }

    // ---- op helpers ----

    fn build_range(
        &mut self,
        start: Handle,
        end: Handle,
        step: Option<Handle>,
    ) -> StepResult<Handle> {
        let start = match self.heap.value(start) {
            Value::Int(n) => *n,
            other => {
                let name = other.type_name();
                return self.raise(format!("Range bounds must be ints, got {}", name));
            }
        };
        let end = match self.heap.value(end) {
            Value::Int(n) => *n,
            other => {
                let name = other.type_name();
                return self.raise(format!("Range bounds must be ints, got {}", name));
            }
        };
        let step = match step {
            None => 1,
            Some(step) => match self.heap.value(step) {
                Value::Int(0) => return self.raise("Range step cannot be zero"),
                Value::Int(n) => *n,
                other => {
                    let name = other.type_name();
                    return self.raise(format!("Range step must be an int, got {}", name));
                }
            },
        };
        Ok(self.heap.alloc(Value::Range { start, end, step }))
    }

    fn arith(&mut self, op: Op, lhs: Handle, rhs: Handle) -> StepResult<Handle> {
        enum Operands {
            Ints(i64, i64),
            Nums(f64, f64),
        }
        let pair = match (self.heap.value(lhs), self.heap.value(rhs)) {
            (Value::Int(a), Value::Int(b)) => Operands::Ints(*a, *b),
            (Value::Int(a), Value::Num(b)) => Operands::Nums(*a as f64, *b),
            (Value::Num(a), Value::Int(b)) => Operands::Nums(*a, *b as f64),
            (Value::Num(a), Value::Num(b)) => Operands::Nums(*a, *b),
            (Value::Str(a), Value::Str(b)) if op == Op::Add => {
                let joined = format!("{}{}", a, b);
                let handle = self.heap.alloc(Value::Str(joined));
                return Ok(handle);
            }
            (Value::List(a), Value::List(b)) if op == Op::Add => {
                let mut joined = a.clone();
                joined.extend_from_slice(b);
                let handle = self.heap.alloc(Value::List(joined));
                return Ok(handle);
            }
            (a, b) => {
                let message = format!(
                    "Cannot apply {} to {} and {}",
                    op.name(),
                    a.type_name(),
                    b.type_name()
                );
                return self.raise(message);
            }
        };

        let value = match pair {
            Operands::Ints(a, b) => match op {
                Op::Add => match a.checked_add(b) {
                    Some(n) => Value::Int(n),
                    None => return self.raise("Integer overflow"),
                },
                Op::Sub => match a.checked_sub(b) {
                    Some(n) => Value::Int(n),
                    None => return self.raise("Integer overflow"),
                },
                Op::Mul => match a.checked_mul(b) {
                    Some(n) => Value::Int(n),
                    None => return self.raise("Integer overflow"),
                },
                Op::Div => {
                    if b == 0 {
                        return self.raise("Division by zero");
                    }
                    Value::Num(a as f64 / b as f64)
                }
                Op::DivFloor => {
                    if b == 0 {
                        return self.raise("Division by zero");
                    }
                    match crate::bytecode::compiler::floor_div(a, b) {
                        Some(n) => Value::Int(n),
                        None => return self.raise("Integer overflow"),
                    }
                }
                Op::Rem => {
                    if b == 0 {
                        return self.raise("Modulo by zero");
                    }
                    match a.checked_rem(b) {
                        Some(n) => Value::Int(n),
                        None => return self.raise("Integer overflow"),
                    }
                }
                Op::Pow => {
                    if b >= 0 {
                        let exp = u32::try_from(b).ok();
                        match exp.and_then(|e| a.checked_pow(e)) {
                            Some(n) => Value::Int(n),
                            None => return self.raise("Integer overflow"),
                        }
                    } else {
                        Value::Num((a as f64).powi(b as i32))
                    }
                }
                Op::LShift | Op::RShift => {
                    if !(0..64).contains(&b) {
                        return self.raise("Shift amount out of range");
                    }
                    Value::Int(if op == Op::LShift { a << b } else { a >> b })
                }
                Op::BitAnd => Value::Int(a & b),
                Op::BitOr => Value::Int(a | b),
                Op::BitXor => Value::Int(a ^ b),
                _ => unreachable!("not an arithmetic opcode"),
            },
            Operands::Nums(a, b) => match op {
                Op::Add => Value::Num(a + b),
                Op::Sub => Value::Num(a - b),
                Op::Mul => Value::Num(a * b),
                Op::Div => {
                    if b == 0.0 {
                        return self.raise("Division by zero");
                    }
                    Value::Num(a / b)
                }
                Op::Rem => {
                    if b == 0.0 {
                        return self.raise("Modulo by zero");
                    }
                    Value::Num(a % b)
                }
                Op::Pow => Value::Num(a.powf(b)),
                Op::DivFloor => {
                    return self.raise("Floor division applies to ints only");
                }
                _ => {
                    let message = format!("Cannot apply {} to num operands", op.name());
                    return self.raise(message);
                }
            },
        };
        Ok(self.heap.alloc(value))
    }

    fn contains(&mut self, container: Handle, item: Handle) -> StepResult<bool> {
        let result = match self.heap.value(container) {
            Value::Tuple(items) | Value::List(items) => {
                let items = items.clone();
                items.iter().any(|&i| deep_equal(&self.heap, i, item))
            }
            Value::Map(entries) => {
                let entries = entries.clone();
                entries
                    .iter()
                    .any(|&(k, _)| deep_equal(&self.heap, k, item))
            }
            Value::Str(haystack) => match self.heap.value(item) {
                Value::Str(needle) => haystack.contains(needle.as_str()),
                other => {
                    let name = other.type_name();
                    return self.raise(format!("Cannot search for {} in a str", name));
                }
            },
            Value::Range { start, end, step } => match self.heap.value(item) {
                Value::Int(n) => {
                    let (start, end, step) = (*start, *end, *step);
                    let n = *n;
                    let in_bounds = if step > 0 {
                        n >= start && n < end
                    } else {
                        n <= start && n > end
                    };
                    in_bounds && (n - start) % step == 0
                }
                _ => false,
            },
            other => {
                let name = other.type_name();
                return self.raise(format!("'in' does not apply to {}", name));
            }
        };
        Ok(result)
    }

    fn index_get(&mut self, container: Handle, index: Handle, or_null: bool) -> StepResult<Handle> {
        match self.heap.value(container) {
            Value::Tuple(items) | Value::List(items) => {
                let items = items.clone();
                let index = self.int_index(index)?;
                match items.get(index) {
                    Some(&item) => Ok(item),
                    None if or_null => Ok(self.null),
                    None => {
                        self.raise(format!("Index {} out of bounds (length {})", index, items.len()))
                    }
                }
            }
            Value::Str(s) => {
                let s = s.clone();
                let index = self.int_index(index)?;
                match s.as_bytes().get(index) {
                    Some(&byte) => {
                        let text = (byte as char).to_string();
                        Ok(self.heap.alloc(Value::Str(text)))
                    }
                    None if or_null => Ok(self.null),
                    None => self.raise(format!("Index {} out of bounds (length {})", index, s.len())),
                }
            }
            Value::Map(entries) => {
                let entries = entries.clone();
                match entries
                    .iter()
                    .find(|&&(k, _)| deep_equal(&self.heap, k, index))
                {
                    Some(&(_, v)) => Ok(v),
                    None if or_null => Ok(self.null),
                    None => {
                        let key = render(&self.heap, index);
                        self.raise(format!("Key not found: {}", key))
                    }
                }
            }
            other => {
                let name = other.type_name();
                self.raise(format!("Cannot index {}", name))
            }
        }
    }

    fn int_index(&mut self, index: Handle) -> StepResult<usize> {
        match self.heap.value(index) {
            Value::Int(n) if *n >= 0 => Ok(*n as usize),
            Value::Int(n) => {
                let n = *n;
                self.raise(format!("Negative index {}", n))
            }
            other => {
                let name = other.type_name();
                self.raise(format!("Index must be an int, got {}", name))
            }
        }
    }

    fn index_set(&mut self, container: Handle, index: Handle, value: Handle) -> StepResult<()> {
        match self.heap.value(container) {
            Value::List(_) => {
                let i = self.int_index(index)?;
                match self.heap.get_mut(container) {
                    Some(Value::List(items)) => {
                        if i >= items.len() {
                            let len = items.len();
                            return self.raise(format!("Index {} out of bounds (length {})", i, len));
                        }
                        items[i] = value;
                        Ok(())
                    }
                    _ => self.raise("List vanished during assignment"),
                }
            }
            Value::Map(_) => {
                let existing = {
                    let entries = match self.heap.value(container) {
                        Value::Map(entries) => entries.clone(),
                        _ => unreachable!(),
                    };
                    entries
                        .iter()
                        .position(|&(k, _)| deep_equal(&self.heap, k, index))
                };
                match self.heap.get_mut(container) {
                    Some(Value::Map(entries)) => {
                        match existing {
                            Some(i) => entries[i].1 = value,
                            None => entries.push((index, value)),
                        }
                        Ok(())
                    }
                    _ => self.raise("Map vanished during assignment"),
                }
            }
            Value::Tuple(_) => self.raise("Tuples are immutable"),
            Value::Str(_) => self.raise("Strings are immutable"),
            other => {
                let name = other.type_name();
                self.raise(format!("Cannot index {}", name))
            }
        }
    }

    fn iter_next(&mut self, iter_handle: Handle) -> StepResult<Option<Handle>> {
        let state = match self.heap.value(iter_handle) {
            Value::Iterator(iter) => iter.clone(),
            other => {
                let name = other.type_name();
                return self.raise(format!("Expected an iterator, got {}", name));
            }
        };

        let (next_state, element) = match state {
            Iter::Seq { source, index, len } => {
                let items = match self.heap.value(source) {
                    Value::Tuple(items) | Value::List(items) => items,
                    _ => return self.raise("Iterator source vanished"),
                };
                if items.len() != len {
                    return self.raise("Collection changed during iteration");
                }
                if index >= len {
                    (None, None)
                } else {
                    let element = items[index];
                    (
                        Some(Iter::Seq {
                            source,
                            index: index + 1,
                            len,
                        }),
                        Some(element),
                    )
                }
            }
            Iter::Str { source, index } => {
                let byte = match self.heap.value(source) {
                    Value::Str(s) => s.as_bytes().get(index).copied(),
                    _ => return self.raise("Iterator source vanished"),
                };
                match byte {
                    None => (None, None),
                    Some(byte) => {
                        let element = self.heap.alloc(Value::Str((byte as char).to_string()));
                        (
                            Some(Iter::Str {
                                source,
                                index: index + 1,
                            }),
                            Some(element),
                        )
                    }
                }
            }
            Iter::Map { source, index, len } => {
                let entries = match self.heap.value(source) {
                    Value::Map(entries) => entries,
                    _ => return self.raise("Iterator source vanished"),
                };
                if entries.len() != len {
                    return self.raise("Collection changed during iteration");
                }
                if index >= len {
                    (None, None)
                } else {
                    let element = entries[index].0;
                    (
                        Some(Iter::Map {
                            source,
                            index: index + 1,
                            len,
                        }),
                        Some(element),
                    )
                }
            }
            Iter::Range { current, end, step } => {
                let exhausted = if step > 0 { current >= end } else { current <= end };
                if exhausted {
                    (None, None)
                } else {
                    let element = self.heap.alloc(Value::Int(current));
                    (
                        Some(Iter::Range {
                            current: current + step,
                            end,
                            step,
                        }),
                        Some(element),
                    )
                }
            }
        };

        if let Some(next) = next_state {
            if let Some(Value::Iterator(iter)) = self.heap.get_mut(iter_handle) {
                *iter = next;
            }
        }
        Ok(element)
    }

    fn call_value(
        &mut self,
        callee: Handle,
        this: Option<Handle>,
        args: Vec<Handle>,
        dst: u32,
    ) -> StepResult<()> {
        let func = match self.heap.value(callee) {
            Value::Function(func) => func.clone(),
            other => {
                let name = other.type_name();
                return self.raise(format!("Cannot call {}", name));
            }
        };
        match func {
            Func::Script {
                arity,
                body,
                captures,
                module,
                globals,
            } => {
                if args.len() != arity as usize {
                    return self.raise(format!(
                        "Expected {} argument{}, got {}",
                        arity,
                        if arity == 1 { "" } else { "s" },
                        args.len()
                    ));
                }
                let mut regs = Vec::with_capacity(arity as usize + body.len());
                regs.extend_from_slice(&args);
                regs.resize(arity as usize + body.len(), self.null);
                self.frames.push(Frame {
                    regs: Rc::new(RefCell::new(regs)),
                    arity,
                    this: this.unwrap_or(self.null),
                    body,
                    ip: 0,
                    captures,
                    module,
                    globals,
                    dst,
                    handlers: Vec::new(),
                });
                Ok(())
            }
            Func::Native { name: _, f } => {
                let full_args = match this {
                    Some(this) => {
                        let mut v = Vec::with_capacity(args.len() + 1);
                        v.push(this);
                        v.extend_from_slice(&args);
                        v
                    }
                    None => args,
                };
                match f(&mut self.heap, &full_args) {
                    Ok(result) => {
                        self.set_reg(dst, result);
                        Ok(())
                    }
                    Err(message) => self.raise(message),
                }
            }
        }
    }
}

fn trace_entry(frame: &Frame) -> TraceFrame {
    let code_index = frame.body.get(frame.ip.wrapping_sub(1)).copied();
    let (line, column) = match code_index.and_then(|ci| frame.module.debug.offset_for(ci)) {
        Some(offset) if !frame.module.debug.source.is_empty() => {
            line_column(&frame.module.debug.source, offset as usize)
        }
        _ => (0, 0),
    };
    TraceFrame {
        path: frame.module.debug.path.clone(),
        line,
        column,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::compiler;
    use crate::lexer::Scanner;
    use crate::parser::Parser;

    fn run_source(source: &str) -> Result<String, String> {
        let tokens = Scanner::new(source)
            .scan_tokens()
            .map_err(|e| e.to_string())?;
        let program = Parser::new(tokens).parse().map_err(|e| e.to_string())?;
        let module = compiler::compile("<test>", source, &program).map_err(|e| e.to_string())?;
        let mut vm = Vm::new();
        let result = vm.run_module(Rc::new(module)).map_err(|e| e.to_string())?;
        Ok(vm.render_value(result))
    }

    fn eval(source: &str) -> String {
        run_source(source).expect("run failed")
    }

    // ---- the end-to-end scenarios ----

    #[test]
    fn test_scenario_constant_fold() {
        assert_eq!(eval("let x = 1 + 2 * 3\nx"), "7");
    }

    #[test]
    fn test_scenario_function_call() {
        assert_eq!(eval("let f = fn(a, b) a + b\nf(40, 2)"), "42");
    }

    #[test]
    fn test_scenario_for_loop_over_range() {
        assert_eq!(
            eval("let acc = []\nfor x in 1:4 acc.append(x)\nacc"),
            "[1, 2, 3]"
        );
    }

    #[test]
    fn test_scenario_catch_division_by_zero() {
        assert_eq!(eval("let r = try 10 / 0 catch |e| e\nr is error"), "true");
    }

    #[test]
    fn test_scenario_captures() {
        assert_eq!(eval("let mk = fn(n) fn() n\nlet g = mk(7)\ng() + g()"), "14");
    }

    #[test]
    fn test_scenario_destructuring() {
        assert_eq!(eval("let (a, _, b) = (1, 2, 3)\na + b"), "4");
    }

    // ---- arithmetic & comparison semantics ----

    #[test]
    fn test_div_always_returns_num() {
        assert_eq!(eval("let a = 7\nlet b = 2\na / b"), "3.5");
        assert_eq!(eval("let a = 6\nlet b = 3\na / b"), "2.0");
    }

    #[test]
    fn test_div_floor_and_rem() {
        assert_eq!(eval("let a = 7\nlet b = 2\na // b"), "3");
        assert_eq!(eval("let a = -7\nlet b = 2\na // b"), "-4");
        assert_eq!(eval("let a = -7\nlet b = 2\na % b"), "-1");
        assert_eq!(eval("let a = 7\nlet b = -2\na % b"), "1");
    }

    #[test]
    fn test_pow_negative_exponent_promotes() {
        assert_eq!(eval("let a = 2\nlet b = -1\na ** b"), "0.5");
        assert_eq!(eval("let a = 2\nlet b = 10\na ** b"), "1024");
    }

    #[test]
    fn test_int_overflow_raises() {
        let result = run_source("let a = 9223372036854775807\nlet b = 1\na + b");
        assert!(result.expect_err("must raise").contains("overflow"));
    }

    #[test]
    fn test_constant_folding_matches_runtime() {
        // The compiler folds both operands when constant; the result must
        // equal what the VM computes for the same operands in registers.
        let int_ops = ["+", "-", "*", "/", "//", "%", "**", "<<", ">>", "&", "|", "^"];
        for op in int_ops {
            let folded = eval(&format!("7 {} 2", op));
            let runtime = eval(&format!("let a = 7\nlet b = 2\na {} b", op));
            assert_eq!(folded, runtime, "int fold law for '{}'", op);
        }
        let cmp_ops = ["==", "!=", "<", "<=", ">", ">="];
        for op in cmp_ops {
            let folded = eval(&format!("7 {} 2", op));
            let runtime = eval(&format!("let a = 7\nlet b = 2\na {} b", op));
            assert_eq!(folded, runtime, "comparison fold law for '{}'", op);
        }
        let num_ops = ["+", "-", "*", "/", "%", "**"];
        for op in num_ops {
            let folded = eval(&format!("7.5 {} 2.0", op));
            let runtime = eval(&format!("let a = 7.5\nlet b = 2.0\na {} b", op));
            assert_eq!(folded, runtime, "num fold law for '{}'", op);
        }
        assert_eq!(
            eval("\"a\" + \"b\""),
            eval("let a = \"a\"\nlet b = \"b\"\na + b")
        );
    }

    #[test]
    fn test_mixed_numeric_equality() {
        assert_eq!(eval("let a = 2\nlet b = 2.0\na == b"), "true");
        assert_eq!(eval("let t = (1, 2)\nlet u = (1, 2)\nt == u"), "true");
        assert_eq!(eval("let t = (1, 2)\nlet l = [1, 2]\nt == l"), "false");
    }

    #[test]
    fn test_string_comparison_and_concat() {
        assert_eq!(eval("let a = \"abc\"\nlet b = \"abd\"\na < b"), "true");
        assert_eq!(eval("let a = \"a\"\nlet b = \"b\"\na + b"), "ab");
    }

    #[test]
    fn test_cast_idempotence() {
        assert_eq!(eval("let x = 2.9\nx as int as int == x as int"), "true");
        assert_eq!(eval("let x = 42\n(x as str) as str == x as str"), "true");
    }

    // ---- control flow ----

    #[test]
    fn test_if_else_value() {
        assert_eq!(eval("let x = 5\nif x > 3 \"big\" else \"small\""), "big");
        assert_eq!(eval("let x = 1\nif x > 3 \"big\""), "null");
    }

    #[test]
    fn test_while_loop_with_break_continue() {
        let source = "
let total = 0
let i = 0
while true {
    i += 1
    if i > 10 break
    if i % 2 == 0 continue
    total += i
}
total";
        assert_eq!(eval(source), "25");
    }

    #[test]
    fn test_short_circuit_side_effects() {
        let source = "
let acc = []
let probe = fn(v) { acc.append(v)\n v }
let a = false and probe(true)
let b = true or probe(true)
@len(acc)";
        assert_eq!(run_source(source).expect("run failed"), "0");
    }

    #[test]
    fn test_short_circuit_values() {
        assert_eq!(eval("let x = 0\nx == 0 and \"yes\""), "yes");
        assert_eq!(eval("let x = null\nx or \"fallback\""), "fallback");
    }

    #[test]
    fn test_match_expression() {
        let source = "
let shape = (2, 3)
match shape {
    1 => \"one\",
    (a, b) => a * b,
    _ => \"other\"
}";
        assert_eq!(eval(source), "6");
    }

    #[test]
    fn test_match_tagged_and_wildcard() {
        let source = "
let v = .some(5)
match v {
    .none => 0,
    .some(x) => x + 1,
    _ => -1
}";
        assert_eq!(eval(source), "6");
    }

    #[test]
    fn test_match_falls_through_to_null() {
        assert_eq!(eval("match 9 { 1 => \"one\" }"), "null");
    }

    #[test]
    fn test_stepped_and_backward_ranges() {
        assert_eq!(
            eval("let acc = []\nfor x in 1:10:3 acc.append(x)\nacc"),
            "[1, 4, 7]"
        );
        assert_eq!(
            eval("let acc = []\nfor x in 5:0:-2 acc.append(x)\nacc"),
            "[5, 3, 1]"
        );
    }

    #[test]
    fn test_iteration_over_collections() {
        assert_eq!(
            eval("let acc = []\nfor c in \"abc\" acc.append(c)\nacc"),
            "[\"a\", \"b\", \"c\"]"
        );
        assert_eq!(
            eval("let m = {\"a\": 1, \"b\": 2}\nlet acc = []\nfor k in m acc.append(m[k])\nacc"),
            "[1, 2]"
        );
    }

    #[test]
    fn test_mutating_list_during_iteration_raises() {
        let result = run_source("let l = [1, 2, 3]\nfor x in l l.append(x)");
        assert!(result
            .expect_err("must raise")
            .contains("changed during iteration"));
    }

    // ---- aggregates ----

    #[test]
    fn test_map_insertion_order_and_last_write() {
        assert_eq!(
            eval("let m = {\"b\": 1, \"a\": 2, \"b\": 3}\nm"),
            "{\"b\": 3, \"a\": 2}"
        );
    }

    #[test]
    fn test_index_get_set() {
        assert_eq!(eval("let l = [1, 2, 3]\nl[1] = 9\nl[1]"), "9");
        assert_eq!(eval("let m = {\"k\": 1}\nm[\"k\"] += 5\nm[\"k\"]"), "6");
        assert_eq!(eval("let m = {\"k\": 1}\nm[\"missing\"]?"), "null");
    }

    #[test]
    fn test_out_of_bounds_raises() {
        let result = run_source("let l = [1]\nl[5]");
        assert!(result.expect_err("must raise").contains("out of bounds"));
    }

    #[test]
    fn test_list_aliasing_is_shared() {
        assert_eq!(eval("let a = [1]\nlet b = a\nb.append(2)\na"), "[1, 2]");
    }

    #[test]
    fn test_membership() {
        assert_eq!(eval("let l = [1, 2]\n2 in l"), "true");
        assert_eq!(eval("let m = {\"k\": 1}\n\"k\" in m"), "true");
        assert_eq!(eval("let r = 1:10:2\n7 in r"), "true");
        assert_eq!(eval("let r = 1:10:2\n8 in r"), "false");
        assert_eq!(eval("let s = \"hello\"\n\"ell\" in s"), "true");
    }

    // ---- errors ----

    #[test]
    fn test_error_values_and_throw() {
        assert_eq!(eval("let e = error(\"boom\")\ne is error"), "true");
        let result = run_source("let e = error(\"boom\")\nthrow e\n1");
        assert!(result.expect_err("must raise").contains("boom"));
    }

    #[test]
    fn test_try_propagates_error_value() {
        let source = "
let half = fn(n) {
    if n % 2 != 0 return error(\"odd\")
    n // 2
}
let run = fn(n) {
    let v = try half(n)
    v + 100
}
let ok = run(4)
let bad = run(3)
(ok, bad is error)";
        assert_eq!(eval(source), "(102, true)");
    }

    #[test]
    fn test_discarding_an_error_raises() {
        let result = run_source("error(\"lost\")\n1");
        assert!(result.expect_err("must raise").contains("lost"));
    }

    #[test]
    fn test_discarding_a_caught_error_is_fine() {
        assert_eq!(eval("try 10 / 0 catch |e| e\n1"), "1");
    }

    #[test]
    fn test_unhandled_raise_has_traceback() {
        let source = "let f = fn(n) n // 0\nlet g = fn() f(8)\ng()";
        let tokens = Scanner::new(source).scan_tokens().expect("scan failed");
        let program = Parser::new(tokens).parse().expect("parse failed");
        let module = compiler::compile("main.ox", source, &program).expect("compile failed");
        let mut vm = Vm::new();
        let err = vm.run_module(Rc::new(module)).expect_err("must raise");
        assert!(err.message.contains("Division by zero"));
        // One entry per unwound frame: f, g, main.
        assert_eq!(err.trace.len(), 3);
        assert_eq!(err.trace[0].path, "main.ox");
        assert_eq!(err.trace[0].line, 1);
    }

    #[test]
    fn test_catch_without_binding() {
        assert_eq!(eval("try 10 / 0 catch -1"), "-1");
    }

    // ---- functions ----

    #[test]
    fn test_wrong_arity_raises() {
        let result = run_source("let f = fn(a) a\nf(1, 2)");
        assert!(result.expect_err("must raise").contains("argument"));
    }

    #[test]
    fn test_this_call_on_user_function() {
        let source = "
let double = fn() this * 2
let x = 21
x.double()";
        assert_eq!(eval(source), "42");
    }

    #[test]
    fn test_native_method_call_with_receiver() {
        assert_eq!(eval("let s = \"hello\"\ns.len()"), "5");
    }

    #[test]
    fn test_capture_is_by_reference_to_boxed_value() {
        let source = "
let make = fn() {
    let items = []
    let add = fn(v) items.append(v)
    (items, add)
}
let (items, add) = make()
add(1)
add(2)
items";
        assert_eq!(eval(source), "[1, 2]");
    }

    #[test]
    fn test_nested_capture_chain() {
        let source = "
let outer = fn(a) {
    let middle = fn() {
        let inner = fn() a * 2
        inner()
    }
    middle()
}
outer(21)";
        assert_eq!(eval(source), "42");
    }

    // ---- natives ----

    #[test]
    fn test_native_calls() {
        assert_eq!(eval("@len([1, 2, 3])"), "3");
        assert_eq!(eval("@type_of(1:4)"), "range");
        assert_eq!(eval("@abs(-5)"), "5");
        assert_eq!(eval("@max(2, 3.5)"), "3.5");
        assert_eq!(eval("@int(\"42\")"), "42");
    }

    #[test]
    fn test_unknown_native_raises() {
        let result = run_source("@no_such_native()");
        assert!(result.expect_err("must raise").contains("no_such_native"));
    }

    // ---- GC behavior through the VM ----

    #[test]
    fn test_garbage_is_collected_across_a_loop() {
        let source = "
let total = 0
for i in 0:2000 {
    let garbage = [i, i + 1, i + 2]
    total += garbage[0]
}
total";
        let tokens = Scanner::new(source).scan_tokens().expect("scan failed");
        let program = Parser::new(tokens).parse().expect("parse failed");
        let module = compiler::compile("<test>", source, &program).expect("compile failed");
        let mut vm = Vm::new();
        let result = vm.run_module(Rc::new(module)).expect("run failed");
        assert_eq!(vm.render_value(result), "1999000");
    }

}
