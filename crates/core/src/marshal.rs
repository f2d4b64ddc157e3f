//! Serialization: values to bytes and back.
//!
//! One-byte tags. Bytes `0..=200` encode the small integers `-100..=100`
//! directly; the remaining tags follow. Every aggregate is assigned a
//! zero-based index in visit order, and later occurrences are written as
//! backrefs, which preserves sharing and lets cyclic graphs (strands,
//! closures and their environments) round-trip.
//!
//! Lengths and counts are little-endian `u32`; wide scalars are 8
//! little-endian bytes. CFunctions serialize by registry name; userdata
//! does not serialize.

use std::collections::HashMap;

use crate::func::{EnvStorage, FuncDef, FuncEnv, Function};
use crate::strand::{Strand, StrandStatus};
use crate::value::{TypeTag, Value};
use crate::vm::Vm;

const SMALL_INT_BIAS: i64 = 100;

const TAG_NIL: u8 = 201;
const TAG_TRUE: u8 = 202;
const TAG_FALSE: u8 = 203;
const TAG_DOUBLE: u8 = 204;
const TAG_STRING: u8 = 205;
const TAG_BUFFER: u8 = 206;
const TAG_ARRAY: u8 = 207;
const TAG_TUPLE: u8 = 208;
const TAG_STRAND: u8 = 209;
const TAG_TABLE: u8 = 210;
const TAG_FUNCDEF: u8 = 211;
const TAG_FUNCENV: u8 = 212;
const TAG_FUNCTION: u8 = 213;
#[allow(dead_code)]
const TAG_USERDATA: u8 = 214;
const TAG_CFUNCTION: u8 = 215;
const TAG_BACKREF: u8 = 216;
// The closed 201..=216 set has no room for symbols, structs or integers
// outside [-100, 100]; they get the next three tags.
const TAG_SYMBOL: u8 = 217;
const TAG_STRUCT: u8 = 218;
const TAG_INT64: u8 = 219;

pub fn marshal(vm: &Vm, value: Value) -> Result<Vec<u8>, Value> {
    let mut w = Writer {
        vm,
        out: Vec::new(),
        seen: HashMap::new(),
    };
    w.value(value)?;
    Ok(w.out)
}

pub fn unmarshal(vm: &Vm, bytes: &[u8]) -> Result<Value, Value> {
    let mut r = Reader {
        vm,
        bytes,
        pos: 0,
        seen: Vec::new(),
    };
    r.value()
}

struct Writer<'vm> {
    vm: &'vm Vm,
    out: Vec<u8>,
    /// Heap address -> assigned index.
    seen: HashMap<usize, u32>,
}

impl Writer<'_> {
    fn u32(&mut self, n: u32) {
        self.out.extend_from_slice(&n.to_le_bytes());
    }

    fn u64(&mut self, n: u64) {
        self.out.extend_from_slice(&n.to_le_bytes());
    }

    /// Emit a backref when the aggregate has been seen; otherwise assign it
    /// the next index and report "not seen".
    fn note(&mut self, v: Value) -> bool {
        let addr = v.heap_addr();
        if let Some(&idx) = self.seen.get(&addr) {
            self.out.push(TAG_BACKREF);
            self.u32(idx);
            return true;
        }
        let idx = self.seen.len() as u32;
        self.seen.insert(addr, idx);
        false
    }

    fn bytes_with_len(&mut self, bytes: &[u8]) {
        self.u32(bytes.len() as u32);
        self.out.extend_from_slice(bytes);
    }

    fn value(&mut self, v: Value) -> Result<(), Value> {
        match v {
            Value::Nil => self.out.push(TAG_NIL),
            Value::Bool(true) => self.out.push(TAG_TRUE),
            Value::Bool(false) => self.out.push(TAG_FALSE),
            Value::Int(i) => {
                if (-SMALL_INT_BIAS..=SMALL_INT_BIAS).contains(&i) {
                    self.out.push((i + SMALL_INT_BIAS) as u8);
                } else {
                    self.out.push(TAG_INT64);
                    self.u64(i as u64);
                }
            }
            Value::Float(f) => {
                self.out.push(TAG_DOUBLE);
                self.u64(f.to_bits());
            }
            Value::Str(s) => {
                if !self.note(v) {
                    self.out.push(TAG_STRING);
                    self.bytes_with_len(&s.bytes);
                }
            }
            Value::Symbol(s) => {
                if !self.note(v) {
                    self.out.push(TAG_SYMBOL);
                    self.bytes_with_len(&s.bytes);
                }
            }
            Value::Buffer(b) => {
                if !self.note(v) {
                    self.out.push(TAG_BUFFER);
                    let bytes = b.to_vec();
                    self.bytes_with_len(&bytes);
                }
            }
            Value::Array(arr) => {
                if !self.note(v) {
                    self.out.push(TAG_ARRAY);
                    let items = arr.data.borrow().clone();
                    self.u32(items.len() as u32);
                    for item in items {
                        self.value(item)?;
                    }
                }
            }
            Value::Tuple(t) => {
                if !self.note(v) {
                    self.out.push(TAG_TUPLE);
                    self.u32(t.len() as u32);
                    for item in t.items.iter() {
                        self.value(*item)?;
                    }
                }
            }
            Value::Struct(s) => {
                if !self.note(v) {
                    self.out.push(TAG_STRUCT);
                    self.u32(s.count as u32);
                    for (k, val) in s.entries() {
                        self.value(k)?;
                        self.value(val)?;
                    }
                }
            }
            Value::Table(t) => {
                if !self.note(v) {
                    self.out.push(TAG_TABLE);
                    let entries = t.entries();
                    self.u32(entries.len() as u32);
                    for (k, val) in entries {
                        self.value(k)?;
                        self.value(val)?;
                    }
                }
            }
            Value::FuncDef(d) => {
                if !self.note(v) {
                    self.out.push(TAG_FUNCDEF);
                    self.funcdef(d)?;
                }
            }
            Value::FuncEnv(e) => {
                if !self.note(v) {
                    self.out.push(TAG_FUNCENV);
                    self.funcenv(e)?;
                }
            }
            Value::Function(f) => {
                if !self.note(v) {
                    self.out.push(TAG_FUNCTION);
                    self.value(Value::FuncDef(f.def()))?;
                    let envs = f.envs();
                    self.u32(envs.len() as u32);
                    for env in envs {
                        self.value(Value::FuncEnv(env))?;
                    }
                }
            }
            Value::Strand(s) => {
                if !self.note(v) {
                    self.out.push(TAG_STRAND);
                    self.strand(s)?;
                }
            }
            Value::CFunction(_) => {
                let name = self.vm.registry.get(v);
                match name {
                    Value::Str(s) => {
                        self.out.push(TAG_CFUNCTION);
                        let bytes = s.bytes.to_vec();
                        self.bytes_with_len(&bytes);
                    }
                    _ => {
                        return Err(self
                            .vm
                            .error_str("marshal: cfunction is not in the registry"));
                    }
                }
            }
            Value::Userdata(u) => {
                return Err(self.vm.error_str(format!(
                    "marshal: cannot marshal userdata {}",
                    u.utype.name
                )));
            }
        }
        Ok(())
    }

    fn funcdef(&mut self, d: crate::gc::Gc<FuncDef>) -> Result<(), Value> {
        self.u32(d.arity);
        self.u32(d.locals);
        self.u32(d.flags.bits());
        self.u32(d.envs.len() as u32);
        for &e in d.envs.iter() {
            self.u32(e);
        }
        self.u32(d.bytecode.len() as u32);
        for &word in d.bytecode.iter() {
            self.u32(word);
        }
        self.u32(d.literals.len() as u32);
        for lit in d.literals.iter() {
            self.value(*lit)?;
        }
        Ok(())
    }

    fn funcenv(&mut self, e: crate::gc::Gc<FuncEnv>) -> Result<(), Value> {
        // Clone out of the RefCell so writing nested values cannot observe
        // a held borrow.
        enum Snapshot {
            Live(Value, usize, usize),
            Detached(Vec<Value>),
        }
        let snap = match &*e.storage.borrow() {
            EnvStorage::Live { strand, base, len } => {
                Snapshot::Live(Value::Strand(*strand), *base, *len)
            }
            EnvStorage::Detached(values) => Snapshot::Detached(values.to_vec()),
        };
        match snap {
            Snapshot::Live(strand, base, len) => {
                self.out.push(1);
                self.value(strand)?;
                self.u32(base as u32);
                self.u32(len as u32);
            }
            Snapshot::Detached(values) => {
                self.out.push(0);
                self.u32(values.len() as u32);
                for item in values {
                    self.value(item)?;
                }
            }
        }
        Ok(())
    }

    fn strand(&mut self, s: crate::gc::Gc<Strand>) -> Result<(), Value> {
        self.out.push(match s.status.get() {
            StrandStatus::Pending => 0,
            StrandStatus::Alive => 1,
            StrandStatus::Dead => 2,
            StrandStatus::Error => 3,
        });
        self.out.push(s.started.get() as u8);
        self.u32(s.resume_slot.get());
        self.u32(s.frame.get() as u32);
        let stack = s.stack.borrow().clone();
        self.u32(stack.len() as u32);
        for item in stack {
            self.value(item)?;
        }
        self.value(s.ret.get())?;
        match s.parent.get() {
            Some(parent) => {
                self.out.push(1);
                self.value(Value::Strand(parent))?;
            }
            None => self.out.push(0),
        }
        Ok(())
    }
}

struct Reader<'a> {
    vm: &'a Vm,
    bytes: &'a [u8],
    pos: usize,
    seen: Vec<Value>,
}

impl Reader<'_> {
    fn fail(&self, msg: &str) -> Value {
        self.vm.error_str(format!("unmarshal: {}", msg))
    }

    fn u8(&mut self) -> Result<u8, Value> {
        let b = *self
            .bytes
            .get(self.pos)
            .ok_or_else(|| self.fail("truncated data"))?;
        self.pos += 1;
        Ok(b)
    }

    fn u32(&mut self) -> Result<u32, Value> {
        let end = self.pos + 4;
        let chunk = self
            .bytes
            .get(self.pos..end)
            .ok_or_else(|| self.fail("truncated data"))?;
        self.pos = end;
        Ok(u32::from_le_bytes(chunk.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64, Value> {
        let end = self.pos + 8;
        let chunk = self
            .bytes
            .get(self.pos..end)
            .ok_or_else(|| self.fail("truncated data"))?;
        self.pos = end;
        Ok(u64::from_le_bytes(chunk.try_into().unwrap()))
    }

    fn raw(&mut self, len: usize) -> Result<&[u8], Value> {
        let end = self.pos + len;
        let chunk = self
            .bytes
            .get(self.pos..end)
            .ok_or_else(|| self.fail("truncated data"))?;
        self.pos = end;
        Ok(chunk)
    }

    /// Reserve the next index before reading children, mirroring the
    /// writer's assignment order.
    fn reserve(&mut self) -> usize {
        self.seen.push(Value::Nil);
        self.seen.len() - 1
    }

    fn value(&mut self) -> Result<Value, Value> {
        let tag = self.u8()?;
        if tag <= 200 {
            return Ok(Value::Int(tag as i64 - SMALL_INT_BIAS));
        }
        match tag {
            TAG_NIL => Ok(Value::Nil),
            TAG_TRUE => Ok(Value::Bool(true)),
            TAG_FALSE => Ok(Value::Bool(false)),
            TAG_INT64 => Ok(Value::Int(self.u64()? as i64)),
            TAG_DOUBLE => Ok(Value::Float(f64::from_bits(self.u64()?))),
            TAG_BACKREF => {
                let idx = self.u32()? as usize;
                self.seen
                    .get(idx)
                    .copied()
                    .ok_or_else(|| self.fail("backref out of range"))
            }
            TAG_STRING => {
                let idx = self.reserve();
                let len = self.u32()? as usize;
                let bytes = self.raw(len)?.to_vec();
                let v = self.vm.string(&bytes);
                self.seen[idx] = v;
                Ok(v)
            }
            TAG_SYMBOL => {
                let idx = self.reserve();
                let len = self.u32()? as usize;
                let bytes = self.raw(len)?.to_vec();
                let v = self.vm.symbol(&bytes);
                self.seen[idx] = v;
                Ok(v)
            }
            TAG_BUFFER => {
                let idx = self.reserve();
                let len = self.u32()? as usize;
                let bytes = self.raw(len)?.to_vec();
                let v = self.vm.buffer(bytes);
                self.seen[idx] = v;
                Ok(v)
            }
            TAG_ARRAY => {
                let idx = self.reserve();
                let v = self.vm.array(Vec::new());
                self.seen[idx] = v;
                let len = self.u32()? as usize;
                if let Value::Array(arr) = v {
                    for _ in 0..len {
                        let item = self.value()?;
                        arr.push(item);
                    }
                }
                Ok(v)
            }
            TAG_TUPLE => {
                let idx = self.reserve();
                let len = self.u32()? as usize;
                let mut items = Vec::with_capacity(len.min(4096));
                for _ in 0..len {
                    items.push(self.value()?);
                }
                let v = self.vm.tuple(items);
                self.seen[idx] = v;
                Ok(v)
            }
            TAG_STRUCT => {
                let idx = self.reserve();
                let len = self.u32()? as usize;
                let mut pairs = Vec::with_capacity(len.min(4096));
                for _ in 0..len {
                    let k = self.value()?;
                    let v = self.value()?;
                    pairs.push((k, v));
                }
                let v = self.vm.structure(pairs);
                self.seen[idx] = v;
                Ok(v)
            }
            TAG_TABLE => {
                let idx = self.reserve();
                let table = self.vm.new_table();
                let v = Value::Table(table);
                self.seen[idx] = v;
                let len = self.u32()? as usize;
                for _ in 0..len {
                    let k = self.value()?;
                    let val = self.value()?;
                    table.put(k, val);
                }
                Ok(v)
            }
            TAG_FUNCDEF => {
                let idx = self.reserve();
                let v = Value::FuncDef(self.funcdef()?);
                self.seen[idx] = v;
                Ok(v)
            }
            TAG_FUNCENV => {
                let idx = self.reserve();
                let env = self.vm.heap.alloc(
                    TypeTag::FuncEnv,
                    FuncEnv::detached(Box::new([])),
                );
                self.seen[idx] = Value::FuncEnv(env);
                let live = self.u8()? == 1;
                if live {
                    let strand = match self.value()? {
                        Value::Strand(s) => s,
                        _ => return Err(self.fail("live environment without a strand")),
                    };
                    let base = self.u32()? as usize;
                    let len = self.u32()? as usize;
                    *env.storage.borrow_mut() = EnvStorage::Live { strand, base, len };
                } else {
                    let len = self.u32()? as usize;
                    let mut values = Vec::with_capacity(len.min(4096));
                    for _ in 0..len {
                        values.push(self.value()?);
                    }
                    *env.storage.borrow_mut() =
                        EnvStorage::Detached(values.into_boxed_slice());
                }
                Ok(Value::FuncEnv(env))
            }
            TAG_FUNCTION => {
                let idx = self.reserve();
                // Register the closure before its parts so env cycles can
                // backref it; the def and envs are patched in below.
                let placeholder = self.vm.alloc_funcdef(FuncDef {
                    arity: 0,
                    locals: 0,
                    flags: crate::func::DefFlags::empty(),
                    literals: Box::new([]),
                    bytecode: Box::new([]),
                    envs: Box::new([]),
                });
                let fun = self.vm.alloc_function(Function::new(placeholder, Box::new([])));
                self.seen[idx] = Value::Function(fun);
                let def = match self.value()? {
                    Value::FuncDef(d) => d,
                    _ => return Err(self.fail("function without a funcdef")),
                };
                let count = self.u32()? as usize;
                let mut envs = Vec::with_capacity(count.min(4096));
                for _ in 0..count {
                    match self.value()? {
                        Value::FuncEnv(e) => envs.push(e),
                        _ => return Err(self.fail("function environment is not a funcenv")),
                    }
                }
                fun.patch(def, envs.into_boxed_slice());
                Ok(Value::Function(fun))
            }
            TAG_STRAND => {
                let idx = self.reserve();
                let strand = self.vm.heap.alloc(TypeTag::Strand, Strand::new());
                self.seen[idx] = Value::Strand(strand);
                let status = match self.u8()? {
                    0 => StrandStatus::Pending,
                    1 => StrandStatus::Alive,
                    2 => StrandStatus::Dead,
                    3 => StrandStatus::Error,
                    _ => return Err(self.fail("bad strand status")),
                };
                strand.status.set(status);
                strand.started.set(self.u8()? == 1);
                strand.resume_slot.set(self.u32()?);
                let frame = self.u32()? as usize;
                let len = self.u32()? as usize;
                {
                    let mut stack = strand.stack.borrow_mut();
                    stack.reserve(len.min(4096));
                }
                for _ in 0..len {
                    let item = self.value()?;
                    strand.stack.borrow_mut().push(item);
                }
                if frame > strand.stack.borrow().len()
                    || (frame != 0 && frame < crate::strand::FRAME_HEADER)
                {
                    return Err(self.fail("strand frame out of range"));
                }
                strand.frame.set(frame);
                let ret = self.value()?;
                strand.ret.set(ret);
                if self.u8()? == 1 {
                    match self.value()? {
                        Value::Strand(parent) => strand.parent.set(Some(parent)),
                        _ => return Err(self.fail("strand parent is not a strand")),
                    }
                }
                Ok(Value::Strand(strand))
            }
            TAG_CFUNCTION => {
                let len = self.u32()? as usize;
                let name = self.raw(len)?.to_vec();
                let key = self.vm.string(&name);
                match self.vm.registry.get(key) {
                    Value::CFunction(f) => Ok(Value::CFunction(f)),
                    _ => Err(self.fail("cfunction is not in the registry")),
                }
            }
            _ => Err(self.fail("unknown tag")),
        }
    }

    fn funcdef(&mut self) -> Result<crate::gc::Gc<FuncDef>, Value> {
        let arity = self.u32()?;
        let locals = self.u32()?;
        let flags = crate::func::DefFlags::from_bits_truncate(self.u32()?);
        let env_count = self.u32()? as usize;
        let mut envs = Vec::with_capacity(env_count.min(4096));
        for _ in 0..env_count {
            envs.push(self.u32()?);
        }
        let code_len = self.u32()? as usize;
        let mut bytecode = Vec::with_capacity(code_len.min(65536));
        for _ in 0..code_len {
            bytecode.push(self.u32()?);
        }
        let lit_count = self.u32()? as usize;
        let mut literals = Vec::with_capacity(lit_count.min(4096));
        for _ in 0..lit_count {
            literals.push(self.value()?);
        }
        Ok(self.vm.alloc_funcdef(FuncDef {
            arity,
            locals,
            flags,
            literals: literals.into_boxed_slice(),
            bytecode: bytecode.into_boxed_slice(),
            envs: envs.into_boxed_slice(),
        }))
    }
}
