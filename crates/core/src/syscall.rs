//! The syscall table.
//!
//! Every entry has the native calling convention, so the same functions are
//! also installed into the top-level environment as first-class cfunctions:
//! `(length xs)` compiles to a `syscall` instruction, while `(def f length)`
//! hands out the cfunction value, and both run the code below.
//!
//! Table order is part of the compiled-code contract: the compiler embeds
//! indices, so entries are only ever appended.

use crate::marshal;
use crate::ops;
use crate::strand::StrandStatus;
use crate::value::{CFunction, Value};
use crate::vm::Vm;

static TABLE: [(&str, CFunction); 24] = [
    ("print", sys_print),
    ("type", sys_type),
    ("length", sys_length),
    ("get", sys_get),
    ("put", sys_put),
    ("slice", sys_slice),
    ("tuple", sys_tuple),
    ("array", sys_array),
    ("table", sys_table),
    ("struct", sys_struct),
    ("buffer", sys_buffer),
    ("string", sys_string),
    ("symbol", sys_symbol),
    ("gensym", sys_gensym),
    ("push", sys_push),
    ("pop", sys_pop),
    ("raise", sys_raise),
    ("status", sys_status),
    ("strand", sys_strand),
    ("marshal", sys_marshal),
    ("unmarshal", sys_unmarshal),
    ("describe", sys_describe),
    ("disasm", sys_disasm),
    ("parent", sys_parent),
];

pub fn table() -> &'static [(&'static str, CFunction)] {
    &TABLE
}

/// Index of a named syscall, for the compiler.
pub fn syscall_index(name: &str) -> Option<u16> {
    TABLE.iter().position(|(n, _)| *n == name).map(|i| i as u16)
}

/// Install every syscall as a global cfunction.
pub fn install_core(vm: &Vm) {
    for (name, f) in TABLE.iter() {
        vm.register(name, *f);
    }
}

fn want(vm: &Vm, name: &str, args: &[Value], at_least: usize) -> Result<(), Value> {
    if args.len() < at_least {
        return Err(vm.error_str(format!(
            "{}: expected at least {} argument(s), got {}",
            name,
            at_least,
            args.len()
        )));
    }
    Ok(())
}

fn sys_print(_vm: &Vm, args: &[Value]) -> Result<Value, Value> {
    let line = args
        .iter()
        .map(|v| ops::display(*v))
        .collect::<Vec<_>>()
        .join(" ");
    println!("{}", line);
    Ok(Value::Nil)
}

fn sys_type(vm: &Vm, args: &[Value]) -> Result<Value, Value> {
    want(vm, "type", args, 1)?;
    Ok(vm.symbol(args[0].tag().name().as_bytes()))
}

fn sys_length(vm: &Vm, args: &[Value]) -> Result<Value, Value> {
    want(vm, "length", args, 1)?;
    ops::length(vm, args[0])
}

fn sys_get(vm: &Vm, args: &[Value]) -> Result<Value, Value> {
    want(vm, "get", args, 2)?;
    ops::get(vm, args[0], args[1])
}

fn sys_put(vm: &Vm, args: &[Value]) -> Result<Value, Value> {
    want(vm, "put", args, 3)?;
    ops::put(vm, args[0], args[1], args[2])
}

fn sys_slice(vm: &Vm, args: &[Value]) -> Result<Value, Value> {
    want(vm, "slice", args, 1)?;
    let bound = |v: Option<&Value>, what: &str| -> Result<Option<i64>, Value> {
        match v {
            None | Some(Value::Nil) => Ok(None),
            Some(Value::Int(i)) => Ok(Some(*i)),
            Some(other) => Err(vm.error_str(format!(
                "slice: {} must be an integer, got {}",
                what,
                other.tag().name()
            ))),
        }
    };
    let start = bound(args.get(1), "start")?;
    let end = bound(args.get(2), "end")?;
    ops::slice(vm, args[0], start, end)
}

fn sys_tuple(vm: &Vm, args: &[Value]) -> Result<Value, Value> {
    Ok(vm.tuple(args.to_vec()))
}

fn sys_array(vm: &Vm, args: &[Value]) -> Result<Value, Value> {
    Ok(vm.array(args.to_vec()))
}

fn sys_table(vm: &Vm, args: &[Value]) -> Result<Value, Value> {
    if args.len() % 2 != 0 {
        return Err(vm.error_str("table: expected an even number of arguments"));
    }
    let table = vm.new_table();
    for pair in args.chunks(2) {
        table.put(pair[0], pair[1]);
    }
    Ok(Value::Table(table))
}

fn sys_struct(vm: &Vm, args: &[Value]) -> Result<Value, Value> {
    if args.len() % 2 != 0 {
        return Err(vm.error_str("struct: expected an even number of arguments"));
    }
    let pairs = args.chunks(2).map(|p| (p[0], p[1])).collect();
    Ok(vm.structure(pairs))
}

fn sys_buffer(vm: &Vm, args: &[Value]) -> Result<Value, Value> {
    let mut bytes = Vec::new();
    for arg in args {
        match crate::buffer::value_bytes(*arg) {
            Some(part) => bytes.extend_from_slice(&part),
            None => {
                return Err(vm.error_str(format!(
                    "buffer: cannot append {}",
                    arg.tag().name()
                )));
            }
        }
    }
    Ok(vm.buffer(bytes))
}

fn sys_string(vm: &Vm, args: &[Value]) -> Result<Value, Value> {
    let mut text = String::new();
    for arg in args {
        text.push_str(&ops::display(*arg));
    }
    Ok(vm.string(text.as_bytes()))
}

fn sys_symbol(vm: &Vm, args: &[Value]) -> Result<Value, Value> {
    let mut text = String::new();
    for arg in args {
        text.push_str(&ops::display(*arg));
    }
    Ok(vm.symbol(text.as_bytes()))
}

fn sys_gensym(vm: &Vm, args: &[Value]) -> Result<Value, Value> {
    let prefix = match args.first() {
        None => b"_g".to_vec(),
        Some(Value::Symbol(s)) | Some(Value::Str(s)) => s.bytes.to_vec(),
        Some(other) => {
            return Err(vm.error_str(format!(
                "gensym: prefix must be a symbol or string, got {}",
                other.tag().name()
            )));
        }
    };
    Ok(vm.uniq_symbol(&prefix))
}

fn sys_push(vm: &Vm, args: &[Value]) -> Result<Value, Value> {
    want(vm, "push", args, 2)?;
    match args[0] {
        Value::Array(a) => {
            for v in &args[1..] {
                a.push(*v);
            }
            Ok(args[0])
        }
        other => Err(vm.error_str(format!("push: expected array, got {}", other.tag().name()))),
    }
}

fn sys_pop(vm: &Vm, args: &[Value]) -> Result<Value, Value> {
    want(vm, "pop", args, 1)?;
    match args[0] {
        Value::Array(a) => Ok(a.pop()),
        other => Err(vm.error_str(format!("pop: expected array, got {}", other.tag().name()))),
    }
}

fn sys_raise(_vm: &Vm, args: &[Value]) -> Result<Value, Value> {
    Err(args.first().copied().unwrap_or(Value::Nil))
}

fn sys_status(vm: &Vm, args: &[Value]) -> Result<Value, Value> {
    want(vm, "status", args, 1)?;
    match args[0] {
        Value::Strand(s) => Ok(vm.symbol(s.status.get().name().as_bytes())),
        other => Err(vm.error_str(format!(
            "status: expected strand, got {}",
            other.tag().name()
        ))),
    }
}

/// Create a pending strand over a function and its initial arguments.
fn sys_strand(vm: &Vm, args: &[Value]) -> Result<Value, Value> {
    want(vm, "strand", args, 1)?;
    match args[0] {
        Value::Function(f) => {
            let strand = vm.strand_for(f, &args[1..])?;
            debug_assert_eq!(strand.status.get(), StrandStatus::Pending);
            Ok(Value::Strand(strand))
        }
        other => Err(vm.error_str(format!(
            "strand: expected function, got {}",
            other.tag().name()
        ))),
    }
}

/// Parent of the running strand: the strand that last transferred in, or
/// nil at the root. This is how a child addresses a transfer back.
fn sys_parent(vm: &Vm, _args: &[Value]) -> Result<Value, Value> {
    Ok(vm
        .current_strand()
        .and_then(|s| s.parent.get())
        .map(Value::Strand)
        .unwrap_or(Value::Nil))
}

fn sys_marshal(vm: &Vm, args: &[Value]) -> Result<Value, Value> {
    want(vm, "marshal", args, 1)?;
    let bytes = marshal::marshal(vm, args[0])?;
    Ok(vm.buffer(bytes))
}

fn sys_unmarshal(vm: &Vm, args: &[Value]) -> Result<Value, Value> {
    want(vm, "unmarshal", args, 1)?;
    match crate::buffer::value_bytes(args[0]) {
        Some(bytes) => marshal::unmarshal(vm, &bytes),
        None => Err(vm.error_str(format!(
            "unmarshal: expected buffer or string, got {}",
            args[0].tag().name()
        ))),
    }
}

fn sys_describe(vm: &Vm, args: &[Value]) -> Result<Value, Value> {
    want(vm, "describe", args, 1)?;
    Ok(vm.string(ops::describe(args[0]).as_bytes()))
}

fn sys_disasm(vm: &Vm, args: &[Value]) -> Result<Value, Value> {
    want(vm, "disasm", args, 1)?;
    let code = match args[0] {
        Value::Function(f) => crate::bytecode::disasm(&f.def().bytecode),
        Value::FuncDef(d) => crate::bytecode::disasm(&d.bytecode),
        other => {
            return Err(vm.error_str(format!(
                "disasm: expected function, got {}",
                other.tag().name()
            )));
        }
    };
    Ok(vm.string(code.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_lookup() {
        assert_eq!(syscall_index("print"), Some(0));
        assert_eq!(syscall_index("get"), Some(3));
        assert_eq!(syscall_index("no-such-call"), None);
    }

    #[test]
    fn test_core_installed_as_globals() {
        let vm = Vm::new();
        assert!(matches!(vm.get_global("length"), Value::CFunction(_)));
        assert!(matches!(vm.get_global("print"), Value::CFunction(_)));
    }

    #[test]
    fn test_table_syscall_builds_table() {
        let vm = Vm::new();
        let t = sys_table(&vm, &[Value::Int(1), Value::Int(2)]).unwrap();
        match t {
            Value::Table(t) => {
                assert_eq!(t.get(Value::Int(1)), Value::Int(2));
            }
            _ => panic!("expected table"),
        }
    }

    #[test]
    fn test_strand_syscall_rejects_non_function() {
        let vm = Vm::new();
        assert!(sys_strand(&vm, &[Value::Int(3)]).is_err());
    }
}
