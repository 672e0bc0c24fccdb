//! Runtime values.
//!
//! Every value is boxed on the GC heap; registers, aggregate elements
//! and captures hold [`Handle`]s. Each variant maps one-to-one onto a
//! [`TypeTag`] so `is`/`as` agree with what the compiler emitted.

use crate::bytecode::instruction::TypeTag;
use crate::bytecode::module::Bytecode;
use crate::vm::heap::{Handle, Heap};
use std::cell::RefCell;
use std::cmp::Ordering;
use std::rc::Rc;

/// A shared register file: the module frame's registers double as the
/// globals table, and the REPL's base frame is reified on the heap.
pub type Globals = Rc<RefCell<Vec<Handle>>>;

/// A host callable: arguments in, value out, message on raise.
pub type NativeFn = fn(&mut Heap, &[Handle]) -> Result<Handle, String>;

/// A function value: a compiled body plus captures, or a host callable.
#[derive(Clone)]
pub enum Func {
    Script {
        arity: u32,
        /// Code indices into `module`.
        body: Rc<Vec<u32>>,
        /// Captured values, copied by reference at build time.
        captures: Rc<Vec<Handle>>,
        module: Rc<Bytecode>,
        globals: Globals,
    },
    Native {
        name: Rc<str>,
        f: NativeFn,
    },
}

impl std::fmt::Debug for Func {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Func::Script { arity, .. } => write!(f, "<fn/{}>", arity),
            Func::Native { name, .. } => write!(f, "<native {}>", name),
        }
    }
}

/// Iterator state for `iter_init`/`iter_next`.
#[derive(Debug, Clone)]
pub enum Iter {
    /// Tuple or list: cursor plus the length observed at init, to detect
    /// mutation during iteration.
    Seq {
        source: Handle,
        index: usize,
        len: usize,
    },
    /// String: byte cursor.
    Str { source: Handle, index: usize },
    /// Map: entry cursor plus init length.
    Map {
        source: Handle,
        index: usize,
        len: usize,
    },
    Range {
        current: i64,
        end: i64,
        step: i64,
    },
}

/// A runtime value.
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Num(f64),
    Str(String),
    Tuple(Vec<Handle>),
    List(Vec<Handle>),
    /// Ordered `(key, value)` entries; duplicate keys keep the last
    /// write, lookup is structural equality.
    Map(Vec<(Handle, Handle)>),
    Range {
        start: i64,
        end: i64,
        step: i64,
    },
    Error(Handle),
    Tagged {
        name: String,
        inner: Option<Handle>,
    },
    Function(Func),
    Iterator(Iter),
    /// A reified call frame; roots the REPL's base registers.
    Frame(Globals),
}

impl Value {
    pub fn type_tag(&self) -> TypeTag {
        match self {
            Value::Null => TypeTag::Null,
            Value::Bool(_) => TypeTag::Bool,
            Value::Int(_) => TypeTag::Int,
            Value::Num(_) => TypeTag::Num,
            Value::Str(_) => TypeTag::Str,
            Value::Tuple(_) => TypeTag::Tuple,
            Value::List(_) => TypeTag::List,
            Value::Map(_) => TypeTag::Map,
            Value::Range { .. } => TypeTag::Range,
            Value::Error(_) => TypeTag::Error,
            Value::Tagged { .. } => TypeTag::Tagged,
            Value::Function(_) => TypeTag::Function,
            Value::Iterator(_) => TypeTag::Iterator,
            Value::Frame(_) => TypeTag::Frame,
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.type_tag().name()
    }

    /// Only `false` and `null` are false.
    pub fn is_truthy(&self) -> bool {
        !matches!(self, Value::Null | Value::Bool(false))
    }

    /// Rough payload size driving the GC trigger.
    pub fn approx_bytes(&self) -> usize {
        let payload = match self {
            Value::Str(s) => s.len(),
            Value::Tuple(items) | Value::List(items) => items.len() * 8,
            Value::Map(entries) => entries.len() * 16,
            Value::Tagged { name, .. } => name.len(),
            Value::Function(Func::Script { captures, .. }) => captures.len() * 8,
            Value::Frame(regs) => regs.borrow().len() * 8,
            _ => 0,
        };
        32 + payload
    }

    /// Push every handle this value keeps alive.
    pub fn trace(&self, out: &mut Vec<Handle>) {
        match self {
            Value::Tuple(items) | Value::List(items) => out.extend_from_slice(items),
            Value::Map(entries) => {
                for &(k, v) in entries {
                    out.push(k);
                    out.push(v);
                }
            }
            Value::Error(inner) => out.push(*inner),
            Value::Tagged {
                inner: Some(inner), ..
            } => out.push(*inner),
            Value::Function(Func::Script {
                captures, globals, ..
            }) => {
                out.extend_from_slice(captures);
                out.extend_from_slice(&globals.borrow());
            }
            Value::Iterator(iter) => match iter {
                Iter::Seq { source, .. } | Iter::Str { source, .. } | Iter::Map { source, .. } => {
                    out.push(*source)
                }
                Iter::Range { .. } => {}
            },
            Value::Frame(regs) => out.extend_from_slice(&regs.borrow()),
            _ => {}
        }
    }
}

/// Structural equality; `int == num` compares mathematically.
pub fn deep_equal(heap: &Heap, a: Handle, b: Handle) -> bool {
    if a == b {
        return true;
    }
    match (heap.value(a), heap.value(b)) {
        (Value::Null, Value::Null) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Int(x), Value::Int(y)) => x == y,
        (Value::Num(x), Value::Num(y)) => x == y,
        (Value::Int(x), Value::Num(y)) | (Value::Num(y), Value::Int(x)) => (*x as f64) == *y,
        (Value::Str(x), Value::Str(y)) => x == y,
        (Value::Tuple(x), Value::Tuple(y)) | (Value::List(x), Value::List(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(&i, &j)| deep_equal(heap, i, j))
        }
        (
            Value::Range {
                start: s1,
                end: e1,
                step: t1,
            },
            Value::Range {
                start: s2,
                end: e2,
                step: t2,
            },
        ) => s1 == s2 && e1 == e2 && t1 == t2,
        (Value::Error(x), Value::Error(y)) => deep_equal(heap, *x, *y),
        (
            Value::Tagged {
                name: n1,
                inner: i1,
            },
            Value::Tagged {
                name: n2,
                inner: i2,
            },
        ) => {
            n1 == n2
                && match (i1, i2) {
                    (None, None) => true,
                    (Some(x), Some(y)) => deep_equal(heap, *x, *y),
                    _ => false,
                }
        }
        (Value::Map(x), Value::Map(y)) => {
            x.len() == y.len()
                && x.iter().all(|&(k, v)| {
                    y.iter()
                        .any(|&(k2, v2)| deep_equal(heap, k, k2) && deep_equal(heap, v, v2))
                })
        }
        // Functions and iterators compare by identity only.
        _ => false,
    }
}

/// Ordered comparison: numbers, byte-wise strings, and same-kind
/// same-length sequences element-wise.
pub fn compare(heap: &Heap, a: Handle, b: Handle) -> Result<Ordering, String> {
    match (heap.value(a), heap.value(b)) {
        (Value::Int(x), Value::Int(y)) => Ok(x.cmp(y)),
        (Value::Int(x), Value::Num(y)) => (*x as f64)
            .partial_cmp(y)
            .ok_or_else(|| "Cannot order against nan".to_string()),
        (Value::Num(x), Value::Int(y)) => x
            .partial_cmp(&(*y as f64))
            .ok_or_else(|| "Cannot order against nan".to_string()),
        (Value::Num(x), Value::Num(y)) => x
            .partial_cmp(y)
            .ok_or_else(|| "Cannot order against nan".to_string()),
        (Value::Str(x), Value::Str(y)) => Ok(x.as_bytes().cmp(y.as_bytes())),
        (Value::Tuple(x), Value::Tuple(y)) | (Value::List(x), Value::List(y)) => {
            if x.len() != y.len() {
                return Err(format!(
                    "Cannot order sequences of different lengths ({} vs {})",
                    x.len(),
                    y.len()
                ));
            }
            let (x, y) = (x.clone(), y.clone());
            for (i, j) in x.into_iter().zip(y) {
                match compare(heap, i, j)? {
                    Ordering::Equal => continue,
                    other => return Ok(other),
                }
            }
            Ok(Ordering::Equal)
        }
        (x, y) => Err(format!(
            "Cannot order {} against {}",
            x.type_name(),
            y.type_name()
        )),
    }
}

/// Render a value for display. Strings inside aggregates are quoted;
/// a top-level string is rendered bare.
pub fn render(heap: &Heap, handle: Handle) -> String {
    match heap.value(handle) {
        Value::Str(s) => s.clone(),
        _ => render_inner(heap, handle),
    }
}

fn render_inner(heap: &Heap, handle: Handle) -> String {
    match heap.value(handle) {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Int(n) => n.to_string(),
        Value::Num(n) => {
            if n.fract() == 0.0 && n.is_finite() {
                format!("{:.1}", n)
            } else {
                n.to_string()
            }
        }
        Value::Str(s) => format!("{:?}", s),
        Value::Tuple(items) => {
            let parts: Vec<String> = items.iter().map(|&i| render_inner(heap, i)).collect();
            format!("({})", parts.join(", "))
        }
        Value::List(items) => {
            let parts: Vec<String> = items.iter().map(|&i| render_inner(heap, i)).collect();
            format!("[{}]", parts.join(", "))
        }
        Value::Map(entries) => {
            let parts: Vec<String> = entries
                .iter()
                .map(|&(k, v)| format!("{}: {}", render_inner(heap, k), render_inner(heap, v)))
                .collect();
            format!("{{{}}}", parts.join(", "))
        }
        Value::Range { start, end, step } => {
            if *step == 1 {
                format!("{}:{}", start, end)
            } else {
                format!("{}:{}:{}", start, end, step)
            }
        }
        Value::Error(inner) => format!("error({})", render_inner(heap, *inner)),
        Value::Tagged { name, inner } => match inner {
            Some(inner) => format!(".{}({})", name, render_inner(heap, *inner)),
            None => format!(".{}", name),
        },
        Value::Function(Func::Script { arity, .. }) => format!("<fn/{}>", arity),
        Value::Function(Func::Native { name, .. }) => format!("<native {}>", name),
        Value::Iterator(_) => "<iterator>".to_string(),
        Value::Frame(_) => "<frame>".to_string(),
    }
}

/// Cast a value to a target type. Identity casts return the value
/// unchanged, which is what makes `x as int as int == x as int`.
pub fn cast_value(heap: &mut Heap, handle: Handle, ty: TypeTag) -> Result<Handle, String> {
    let value = heap.value(handle);
    if value.type_tag() == ty {
        return Ok(handle);
    }
    let result = match (value, ty) {
        (Value::Num(n), TypeTag::Int) => {
            if n.is_finite() && (i64::MIN as f64..=i64::MAX as f64).contains(n) {
                Value::Int(n.trunc() as i64)
            } else {
                return Err(format!("Cannot cast {} to int", n));
            }
        }
        (Value::Bool(b), TypeTag::Int) => Value::Int(if *b { 1 } else { 0 }),
        (Value::Str(s), TypeTag::Int) => match s.trim().parse::<i64>() {
            Ok(n) => Value::Int(n),
            Err(_) => return Err(format!("Cannot parse {:?} as int", s)),
        },
        (Value::Int(n), TypeTag::Num) => Value::Num(*n as f64),
        (Value::Bool(b), TypeTag::Num) => Value::Num(if *b { 1.0 } else { 0.0 }),
        (Value::Str(s), TypeTag::Num) => match s.trim().parse::<f64>() {
            Ok(n) => Value::Num(n),
            Err(_) => return Err(format!("Cannot parse {:?} as num", s)),
        },
        (_, TypeTag::Str) => Value::Str(render(heap, handle)),
        (Value::List(items), TypeTag::Tuple) => Value::Tuple(items.clone()),
        (Value::Tuple(items), TypeTag::List) => Value::List(items.clone()),
        (Value::Range { start, end, step }, TypeTag::List) => {
            let (start, end, step) = (*start, *end, *step);
            let mut items = Vec::new();
            let mut current = start;
            while (step > 0 && current < end) || (step < 0 && current > end) {
                items.push(heap.alloc(Value::Int(current)));
                current += step;
            }
            Value::List(items)
        }
        (value, ty) => {
            return Err(format!(
                "Cannot cast {} to {}",
                value.type_name(),
                ty.name()
            ))
        }
    };
    Ok(heap.alloc(result))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truthiness() {
        assert!(!Value::Null.is_truthy());
        assert!(!Value::Bool(false).is_truthy());
        assert!(Value::Bool(true).is_truthy());
        assert!(Value::Int(0).is_truthy());
        assert!(Value::Str(String::new()).is_truthy());
    }

    #[test]
    fn test_deep_equal_mixed_numbers() {
        let mut heap = Heap::new();
        let i = heap.alloc(Value::Int(2));
        let n = heap.alloc(Value::Num(2.0));
        assert!(deep_equal(&heap, i, n));
    }

    #[test]
    fn test_deep_equal_nested() {
        let mut heap = Heap::new();
        let a1 = heap.alloc(Value::Int(1));
        let a2 = heap.alloc(Value::Int(2));
        let b1 = heap.alloc(Value::Int(1));
        let b2 = heap.alloc(Value::Int(2));
        let t1 = heap.alloc(Value::Tuple(vec![a1, a2]));
        let t2 = heap.alloc(Value::Tuple(vec![b1, b2]));
        assert!(deep_equal(&heap, t1, t2));
        let l1 = heap.alloc(Value::List(vec![a1, a2]));
        assert!(!deep_equal(&heap, t1, l1), "tuples never equal lists");
    }

    #[test]
    fn test_compare_strings_bytewise() {
        let mut heap = Heap::new();
        let a = heap.alloc(Value::Str("abc".to_string()));
        let b = heap.alloc(Value::Str("abd".to_string()));
        assert_eq!(compare(&heap, a, b), Ok(Ordering::Less));
    }

    #[test]
    fn test_cast_identity_and_trunc() {
        let mut heap = Heap::new();
        let n = heap.alloc(Value::Num(2.9));
        let i = cast_value(&mut heap, n, TypeTag::Int).expect("cast failed");
        assert!(matches!(heap.value(i), Value::Int(2)));
        let again = cast_value(&mut heap, i, TypeTag::Int).expect("cast failed");
        assert_eq!(i, again, "identity cast returns the same handle");
    }

    #[test]
    fn test_cast_str_renders() {
        let mut heap = Heap::new();
        let a = heap.alloc(Value::Int(1));
        let b = heap.alloc(Value::Int(2));
        let t = heap.alloc(Value::Tuple(vec![a, b]));
        let s = cast_value(&mut heap, t, TypeTag::Str).expect("cast failed");
        assert!(matches!(heap.value(s), Value::Str(text) if text == "(1, 2)"));
    }

    #[test]
    fn test_render_quotes_nested_strings() {
        let mut heap = Heap::new();
        let s = heap.alloc(Value::Str("hi".to_string()));
        let l = heap.alloc(Value::List(vec![s]));
        assert_eq!(render(&heap, s), "hi");
        assert_eq!(render(&heap, l), "[\"hi\"]");
    }
}
