//! The host FFI registry and the built-in standard library.
//!
//! Natives are plain functions over the heap: a slice of argument
//! handles in, a handle out, a message on raise. `native` opcodes
//! resolve names here; method-call syntax reaches the same registry
//! with the receiver prepended to the arguments.

use crate::bytecode::instruction::TypeTag;
use crate::vm::heap::{Handle, Heap};
use crate::vm::value::{cast_value, compare, render, NativeFn, Value};
use indexmap::IndexMap;
use std::cmp::Ordering;
use std::time::{SystemTime, UNIX_EPOCH};

/// Name-to-callable registry, in registration order.
pub struct NativeRegistry {
    map: IndexMap<String, NativeFn>,
}

impl Default for NativeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl NativeRegistry {
    /// A registry pre-populated with the built-ins.
    pub fn new() -> Self {
        let mut registry = Self {
            map: IndexMap::new(),
        };
        registry.register("print", native_print);
        registry.register("println", native_println);
        registry.register("len", native_len);
        registry.register("type_of", native_type_of);
        registry.register("str", native_str);
        registry.register("int", native_int);
        registry.register("num", native_num);
        registry.register("abs", native_abs);
        registry.register("min", native_min);
        registry.register("max", native_max);
        registry.register("clock", native_clock);
        registry
    }

    /// Register or replace a host callable.
    pub fn register(&mut self, name: impl Into<String>, f: NativeFn) {
        self.map.insert(name.into(), f);
    }

    pub fn get(&self, name: &str) -> Option<NativeFn> {
        self.map.get(name).copied()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.map.keys().map(|s| s.as_str())
    }
}

fn arity(args: &[Handle], expected: usize, name: &str) -> Result<(), String> {
    if args.len() != expected {
        return Err(format!(
            "{} expects {} argument{}, got {}",
            name,
            expected,
            if expected == 1 { "" } else { "s" },
            args.len()
        ));
    }
    Ok(())
}

fn native_print(heap: &mut Heap, args: &[Handle]) -> Result<Handle, String> {
    let parts: Vec<String> = args.iter().map(|&a| render(heap, a)).collect();
    print!("{}", parts.join(" "));
    Ok(heap.alloc(Value::Null))
}

fn native_println(heap: &mut Heap, args: &[Handle]) -> Result<Handle, String> {
    let parts: Vec<String> = args.iter().map(|&a| render(heap, a)).collect();
    println!("{}", parts.join(" "));
    Ok(heap.alloc(Value::Null))
}

fn native_len(heap: &mut Heap, args: &[Handle]) -> Result<Handle, String> {
    arity(args, 1, "len")?;
    let len = match heap.value(args[0]) {
        Value::Str(s) => s.len(),
        Value::Tuple(items) | Value::List(items) => items.len(),
        Value::Map(entries) => entries.len(),
        Value::Range { start, end, step } => {
            let span = if *step > 0 { end - start } else { start - end };
            let step = step.abs();
            if span <= 0 {
                0
            } else {
                ((span + step - 1) / step) as usize
            }
        }
        other => return Err(format!("len does not apply to {}", other.type_name())),
    };
    Ok(heap.alloc(Value::Int(len as i64)))
}

fn native_type_of(heap: &mut Heap, args: &[Handle]) -> Result<Handle, String> {
    arity(args, 1, "type_of")?;
    let name = heap.value(args[0]).type_name();
    Ok(heap.alloc(Value::Str(name.to_string())))
}

fn native_str(heap: &mut Heap, args: &[Handle]) -> Result<Handle, String> {
    arity(args, 1, "str")?;
    cast_value(heap, args[0], TypeTag::Str)
}

fn native_int(heap: &mut Heap, args: &[Handle]) -> Result<Handle, String> {
    arity(args, 1, "int")?;
    cast_value(heap, args[0], TypeTag::Int)
}

fn native_num(heap: &mut Heap, args: &[Handle]) -> Result<Handle, String> {
    arity(args, 1, "num")?;
    cast_value(heap, args[0], TypeTag::Num)
}

fn native_abs(heap: &mut Heap, args: &[Handle]) -> Result<Handle, String> {
    arity(args, 1, "abs")?;
    let value = match heap.value(args[0]) {
        Value::Int(n) => Value::Int(
            n.checked_abs()
                .ok_or_else(|| "Integer overflow in abs".to_string())?,
        ),
        Value::Num(n) => Value::Num(n.abs()),
        other => return Err(format!("abs does not apply to {}", other.type_name())),
    };
    Ok(heap.alloc(value))
}

fn native_min(heap: &mut Heap, args: &[Handle]) -> Result<Handle, String> {
    arity(args, 2, "min")?;
    match compare(heap, args[0], args[1])? {
        Ordering::Greater => Ok(args[1]),
        _ => Ok(args[0]),
    }
}

fn native_max(heap: &mut Heap, args: &[Handle]) -> Result<Handle, String> {
    arity(args, 2, "max")?;
    match compare(heap, args[0], args[1])? {
        Ordering::Less => Ok(args[1]),
        _ => Ok(args[0]),
    }
}

fn native_clock(heap: &mut Heap, args: &[Handle]) -> Result<Handle, String> {
    arity(args, 0, "clock")?;
    let seconds = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| e.to_string())?
        .as_secs_f64();
    Ok(heap.alloc(Value::Num(seconds)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_lookup() {
        let registry = NativeRegistry::new();
        assert!(registry.get("print").is_some());
        assert!(registry.get("no_such_native").is_none());
    }

    #[test]
    fn test_len() {
        let mut heap = Heap::new();
        let registry = NativeRegistry::new();
        let len = registry.get("len").expect("len registered");
        let s = heap.alloc(Value::Str("abc".to_string()));
        let result = len(&mut heap, &[s]).expect("len failed");
        assert!(matches!(heap.value(result), Value::Int(3)));

        let r = heap.alloc(Value::Range {
            start: 1,
            end: 4,
            step: 1,
        });
        let result = len(&mut heap, &[r]).expect("len failed");
        assert!(matches!(heap.value(result), Value::Int(3)));
    }

    #[test]
    fn test_min_max() {
        let mut heap = Heap::new();
        let a = heap.alloc(Value::Int(3));
        let b = heap.alloc(Value::Num(2.5));
        let result = native_min(&mut heap, &[a, b]).expect("min failed");
        assert_eq!(result, b);
        let result = native_max(&mut heap, &[a, b]).expect("max failed");
        assert_eq!(result, a);
    }

    #[test]
    fn test_bad_arity_is_a_message() {
        let mut heap = Heap::new();
        let a = heap.alloc(Value::Int(3));
        assert!(native_len(&mut heap, &[a, a]).is_err());
    }
}
