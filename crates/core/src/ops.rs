//! Standard operations: hashing, equality, comparison, arithmetic with
//! promotion, indexed access, length and slicing.
//!
//! Every fallible operation returns `Result<Value, Value>` with the error
//! payload being the guest-visible error value; the interpreter routes
//! those through the unwind machinery.

use std::cmp::Ordering;

use crate::value::{TypeTag, Value};
use crate::vm::Vm;

// ---------------------------------------------------------------------------
// Hashing

/// Content hash for immutables (precomputed at finalisation), identity hash
/// for everything else. Stable within a run.
pub fn hash(v: Value) -> u32 {
    fn fold64(x: u64) -> u32 {
        ((x ^ (x >> 32)) as u32).wrapping_mul(0x9E37_79B1)
    }
    match v {
        Value::Nil => 0x0000_5A5A,
        Value::Bool(false) => 0x0000_A5A5,
        Value::Bool(true) => 0x0000_C3C3,
        Value::Int(i) => fold64(i as u64),
        // An integral float must hash like the equal integer.
        Value::Float(f) => {
            if f == f.trunc() && f >= i64::MIN as f64 && f <= i64::MAX as f64 {
                fold64(f as i64 as u64)
            } else {
                fold64(f.to_bits())
            }
        }
        Value::Str(s) | Value::Symbol(s) => s.hash,
        Value::Tuple(t) => t.hash,
        Value::Struct(s) => s.hash,
        _ => fold64(v.heap_addr() as u64),
    }
}

/// Equality as the language sees it; see `Value`'s `PartialEq`.
pub fn equals(a: Value, b: Value) -> bool {
    a == b
}

// ---------------------------------------------------------------------------
// Comparison

fn num_cmp(x: f64, y: f64) -> Ordering {
    x.partial_cmp(&y).unwrap_or_else(|| {
        // NaN sorts after every number and equal to itself.
        match (x.is_nan(), y.is_nan()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Greater,
            _ => Ordering::Less,
        }
    })
}

/// Total order across all values: numbers numerically (with integer/real
/// cross-compare), strings and symbols lexicographically, tuples
/// element-wise with a length tie-breaker, other aggregates by identity,
/// and unrelated tag families by tag rank.
pub fn compare(a: Value, b: Value) -> Ordering {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => x.cmp(&y),
        (Value::Int(x), Value::Float(y)) => num_cmp(x as f64, y),
        (Value::Float(x), Value::Int(y)) => num_cmp(x, y as f64),
        (Value::Float(x), Value::Float(y)) => num_cmp(x, y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(&y),
        (Value::Str(x), Value::Str(y)) | (Value::Symbol(x), Value::Symbol(y)) => {
            x.bytes.cmp(&y.bytes)
        }
        (Value::Tuple(x), Value::Tuple(y)) => {
            for (p, q) in x.items.iter().zip(y.items.iter()) {
                let ord = compare(*p, *q);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        _ => {
            let (ta, tb) = (a.tag(), b.tag());
            if ta != tb {
                ta.ordinal().cmp(&tb.ordinal())
            } else {
                a.heap_addr().cmp(&b.heap_addr())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Arithmetic with promotion

fn type_error(vm: &Vm, what: &str, v: Value) -> Value {
    vm.error_str(format!("{}: cannot operate on {}", what, v.tag().name()))
}

macro_rules! promote {
    ($vm:expr, $name:expr, $a:expr, $b:expr, $int:expr, $float:expr) => {
        match ($a, $b) {
            (Value::Int(x), Value::Int(y)) => $int($vm, x, y),
            (Value::Int(x), Value::Float(y)) => Ok(Value::Float($float(x as f64, y))),
            (Value::Float(x), Value::Int(y)) => Ok(Value::Float($float(x, y as f64))),
            (Value::Float(x), Value::Float(y)) => Ok(Value::Float($float(x, y))),
            (Value::Int(_), other) | (Value::Float(_), other) => {
                Err(type_error($vm, $name, other))
            }
            (other, _) => Err(type_error($vm, $name, other)),
        }
    };
}

pub fn add(vm: &Vm, a: Value, b: Value) -> Result<Value, Value> {
    promote!(vm, "add", a, b, |_, x: i64, y: i64| Ok(Value::Int(x.wrapping_add(y))), |x, y| x + y)
}

pub fn sub(vm: &Vm, a: Value, b: Value) -> Result<Value, Value> {
    promote!(vm, "subtract", a, b, |_, x: i64, y: i64| Ok(Value::Int(x.wrapping_sub(y))), |x, y| {
        x - y
    })
}

pub fn mul(vm: &Vm, a: Value, b: Value) -> Result<Value, Value> {
    promote!(vm, "multiply", a, b, |_, x: i64, y: i64| Ok(Value::Int(x.wrapping_mul(y))), |x, y| {
        x * y
    })
}

/// Integer division by zero and `i64::MIN / -1` are runtime errors; real
/// division follows IEEE semantics.
pub fn div(vm: &Vm, a: Value, b: Value) -> Result<Value, Value> {
    promote!(
        vm,
        "divide",
        a,
        b,
        |vm: &Vm, x: i64, y: i64| {
            if y == 0 {
                return Err(vm.error_str("divide: division by zero"));
            }
            x.checked_div(y)
                .map(Value::Int)
                .ok_or_else(|| vm.error_str("divide: integer overflow"))
        },
        |x, y| x / y
    )
}

/// Modulo follows the integer-division convention: the result takes the
/// dividend's sign.
pub fn modulo(vm: &Vm, a: Value, b: Value) -> Result<Value, Value> {
    promote!(
        vm,
        "modulo",
        a,
        b,
        |vm: &Vm, x: i64, y: i64| {
            if y == 0 {
                return Err(vm.error_str("modulo: division by zero"));
            }
            x.checked_rem(y)
                .map(Value::Int)
                .ok_or_else(|| vm.error_str("modulo: integer overflow"))
        },
        |x: f64, y: f64| x % y
    )
}

// ---------------------------------------------------------------------------
// Bitwise (integer only)

fn int_pair(vm: &Vm, what: &str, a: Value, b: Value) -> Result<(i64, i64), Value> {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => Ok((x, y)),
        (Value::Int(_), other) => Err(type_error(vm, what, other)),
        (other, _) => Err(type_error(vm, what, other)),
    }
}

pub fn band(vm: &Vm, a: Value, b: Value) -> Result<Value, Value> {
    int_pair(vm, "band", a, b).map(|(x, y)| Value::Int(x & y))
}

pub fn bor(vm: &Vm, a: Value, b: Value) -> Result<Value, Value> {
    int_pair(vm, "bor", a, b).map(|(x, y)| Value::Int(x | y))
}

pub fn bxor(vm: &Vm, a: Value, b: Value) -> Result<Value, Value> {
    int_pair(vm, "bxor", a, b).map(|(x, y)| Value::Int(x ^ y))
}

pub fn shl(vm: &Vm, a: Value, b: Value) -> Result<Value, Value> {
    int_pair(vm, "shl", a, b).map(|(x, y)| Value::Int(x.wrapping_shl(y as u32 & 63)))
}

/// Logical right shift.
pub fn shr(vm: &Vm, a: Value, b: Value) -> Result<Value, Value> {
    int_pair(vm, "shr", a, b)
        .map(|(x, y)| Value::Int(((x as u64).wrapping_shr(y as u32 & 63)) as i64))
}

/// Arithmetic right shift.
pub fn ashr(vm: &Vm, a: Value, b: Value) -> Result<Value, Value> {
    int_pair(vm, "ashr", a, b).map(|(x, y)| Value::Int(x.wrapping_shr(y as u32 & 63)))
}

// ---------------------------------------------------------------------------
// Indexed access

fn index_of(vm: &Vm, what: &str, key: Value, len: usize) -> Result<usize, Value> {
    match key {
        Value::Int(i) if i >= 0 && (i as usize) < len => Ok(i as usize),
        Value::Int(i) => Err(vm.error_str(format!(
            "{}: index {} out of range for length {}",
            what, i, len
        ))),
        other => Err(vm.error_str(format!(
            "{}: expected integer index, got {}",
            what,
            other.tag().name()
        ))),
    }
}

/// Keyed and indexed lookup. Missing keys in tables and structs are nil;
/// out-of-range indexes on sequences are errors.
pub fn get(vm: &Vm, coll: Value, key: Value) -> Result<Value, Value> {
    match coll {
        Value::Array(a) => {
            let idx = index_of(vm, "get", key, a.len())?;
            Ok(a.get(idx).unwrap_or(Value::Nil))
        }
        Value::Tuple(t) => {
            let idx = index_of(vm, "get", key, t.len())?;
            Ok(t.get(idx).unwrap_or(Value::Nil))
        }
        Value::Str(s) | Value::Symbol(s) => {
            let idx = index_of(vm, "get", key, s.len())?;
            Ok(Value::Int(s.bytes[idx] as i64))
        }
        Value::Buffer(b) => {
            let idx = index_of(vm, "get", key, b.len())?;
            Ok(Value::Int(b.get(idx).unwrap_or(0) as i64))
        }
        Value::Table(t) => Ok(t.get(key)),
        Value::Struct(s) => Ok(s.get(key).unwrap_or(Value::Nil)),
        other => Err(vm.error_str(format!("get: cannot index {}", other.tag().name()))),
    }
}

/// Mutation. Arrays accept any non-negative index and grow with nil fill;
/// buffers likewise with zero fill. Immutable aggregates fault.
pub fn put(vm: &Vm, coll: Value, key: Value, value: Value) -> Result<Value, Value> {
    match coll {
        Value::Array(a) => match key {
            Value::Int(i) if i >= 0 => {
                a.set(i as usize, value);
                Ok(coll)
            }
            other => Err(vm.error_str(format!(
                "put: bad array index {}",
                describe(other)
            ))),
        },
        Value::Buffer(b) => match (key, value) {
            (Value::Int(i), Value::Int(byte)) if i >= 0 && (0..=255).contains(&byte) => {
                b.set(i as usize, byte as u8);
                Ok(coll)
            }
            _ => Err(vm.error_str("put: buffer expects a non-negative index and a byte")),
        },
        Value::Table(t) => {
            t.put(key, value);
            Ok(coll)
        }
        Value::Struct(_) | Value::Tuple(_) | Value::Str(_) | Value::Symbol(_) => Err(vm
            .error_str(format!(
                "put: {} is immutable",
                coll.tag().name()
            ))),
        other => Err(vm.error_str(format!("put: cannot index {}", other.tag().name()))),
    }
}

pub fn length(vm: &Vm, v: Value) -> Result<Value, Value> {
    let len = match v {
        Value::Array(a) => a.len(),
        Value::Tuple(t) => t.len(),
        Value::Table(t) => t.len(),
        Value::Struct(s) => s.len(),
        Value::Str(s) | Value::Symbol(s) => s.len(),
        Value::Buffer(b) => b.len(),
        other => {
            return Err(vm.error_str(format!(
                "length: no length for {}",
                other.tag().name()
            )));
        }
    };
    Ok(Value::Int(len as i64))
}

/// Half-open slice `[start, end)` of an indexed aggregate, producing a
/// value of the same kind (a symbol slice produces a string).
pub fn slice(vm: &Vm, v: Value, start: Option<i64>, end: Option<i64>) -> Result<Value, Value> {
    let len = match length(vm, v)? {
        Value::Int(n) => n as usize,
        _ => unreachable!(),
    };
    let start = start.unwrap_or(0);
    let end = end.unwrap_or(len as i64);
    if start < 0 || end < start || end as usize > len {
        return Err(vm.error_str(format!(
            "slice: bad range {}..{} for length {}",
            start, end, len
        )));
    }
    let (start, end) = (start as usize, end as usize);
    match v {
        Value::Array(a) => {
            let items = a.data.borrow()[start..end].to_vec();
            Ok(vm.array(items))
        }
        Value::Tuple(t) => Ok(vm.tuple(t.items[start..end].to_vec())),
        Value::Str(s) | Value::Symbol(s) => Ok(vm.string(&s.bytes[start..end])),
        Value::Buffer(b) => {
            let bytes = b.data.borrow()[start..end].to_vec();
            Ok(vm.buffer(bytes))
        }
        other => Err(vm.error_str(format!(
            "slice: cannot slice {}",
            other.tag().name()
        ))),
    }
}

// ---------------------------------------------------------------------------
// Printing

/// Readable rendering, quoting strings and recursing into aggregates to a
/// fixed depth.
pub fn describe(v: Value) -> String {
    let mut out = String::new();
    describe_into(&mut out, v, 0);
    out
}

/// Like [`describe`] but strings and buffers render raw, which is what
/// `print` wants.
pub fn display(v: Value) -> String {
    match v {
        Value::Str(s) => s.as_str().into_owned(),
        Value::Buffer(b) => String::from_utf8_lossy(&b.data.borrow()).into_owned(),
        other => describe(other),
    }
}

fn describe_into(out: &mut String, v: Value, depth: usize) {
    use std::fmt::Write;

    if depth > 6 {
        out.push_str("...");
        return;
    }
    match v {
        Value::Nil => out.push_str("nil"),
        Value::Bool(b) => {
            let _ = write!(out, "{}", b);
        }
        Value::Int(i) => {
            let _ = write!(out, "{}", i);
        }
        Value::Float(f) => {
            let _ = write!(out, "{:?}", f);
        }
        Value::Str(s) => {
            out.push('"');
            for &b in s.bytes.iter() {
                match b {
                    b'"' => out.push_str("\\\""),
                    b'\\' => out.push_str("\\\\"),
                    b'\n' => out.push_str("\\n"),
                    b'\t' => out.push_str("\\t"),
                    b'\r' => out.push_str("\\r"),
                    0x20..=0x7E => out.push(b as char),
                    _ => {
                        let _ = write!(out, "\\h{:02x}", b);
                    }
                }
            }
            out.push('"');
        }
        Value::Symbol(s) => out.push_str(&s.as_str()),
        Value::Buffer(b) => {
            let _ = write!(out, "@\"{}\"", String::from_utf8_lossy(&b.data.borrow()));
        }
        Value::Tuple(t) => {
            out.push('(');
            for (i, item) in t.items.iter().enumerate() {
                if i > 0 {
                    out.push(' ');
                }
                describe_into(out, *item, depth + 1);
            }
            out.push(')');
        }
        Value::Array(a) => {
            out.push_str("@[");
            for (i, item) in a.data.borrow().iter().enumerate() {
                if i > 0 {
                    out.push(' ');
                }
                describe_into(out, *item, depth + 1);
            }
            out.push(']');
        }
        Value::Struct(s) => {
            out.push('{');
            for (i, (k, val)) in s.entries().enumerate() {
                if i > 0 {
                    out.push(' ');
                }
                describe_into(out, k, depth + 1);
                out.push(' ');
                describe_into(out, val, depth + 1);
            }
            out.push('}');
        }
        Value::Table(t) => {
            out.push_str("@{");
            for (i, (k, val)) in t.entries().into_iter().enumerate() {
                if i > 0 {
                    out.push(' ');
                }
                describe_into(out, k, depth + 1);
                out.push(' ');
                describe_into(out, val, depth + 1);
            }
            out.push('}');
        }
        Value::Function(f) => {
            let _ = write!(out, "<function {:#x}>", f.addr());
        }
        Value::CFunction(f) => {
            let _ = write!(out, "<cfunction {:#x}>", f as usize);
        }
        Value::Strand(s) => {
            let _ = write!(out, "<strand {}>", s.status.get().name());
        }
        Value::Userdata(u) => {
            let _ = write!(out, "<userdata {}>", u.utype.name);
        }
        Value::FuncDef(d) => {
            let _ = write!(out, "<funcdef {:#x}>", d.addr());
        }
        Value::FuncEnv(e) => {
            let _ = write!(out, "<funcenv {:#x}>", e.addr());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_int_float_coincide() {
        assert_eq!(hash(Value::Int(12)), hash(Value::Float(12.0)));
        assert_ne!(hash(Value::Int(12)), hash(Value::Float(12.5)));
    }

    #[test]
    fn test_compare_cross_numeric() {
        assert_eq!(compare(Value::Int(1), Value::Float(1.5)), Ordering::Less);
        assert_eq!(compare(Value::Float(2.0), Value::Int(2)), Ordering::Equal);
        assert_eq!(compare(Value::Int(3), Value::Float(2.5)), Ordering::Greater);
    }

    #[test]
    fn test_compare_across_families_by_tag() {
        // Int ranks before Str in the tag order.
        assert_eq!(
            compare(Value::Int(999), Value::Bool(true)),
            Ordering::Greater
        );
        assert_eq!(compare(Value::Nil, Value::Int(-5)), Ordering::Less);
    }

    #[test]
    fn test_describe_scalars() {
        assert_eq!(describe(Value::Nil), "nil");
        assert_eq!(describe(Value::Int(42)), "42");
        assert_eq!(describe(Value::Float(1.5)), "1.5");
        assert_eq!(describe(Value::Bool(true)), "true");
    }
}
