//! The virtual machine: state, allocator facade, and the interpreter loop.
//!
//! One `Vm` owns every piece of mutable global state — the heap, the intern
//! cache, the module/registry/environment/macro tables and the return slot —
//! so several VMs can coexist in a process as long as no value crosses
//! between them.
//!
//! The interpreter is a fetch-decode-execute loop over 32-bit words with a
//! two-level structure: the outer loop re-derives the frame context (current
//! strand, executing function, program counter) and the inner loop dispatches
//! instructions until something changes frames — a call, a return, a
//! transfer or an unwind. Collection runs only at the top of the inner loop,
//! which is the safe point where all temporaries are rooted.

use std::cell::{Cell, RefCell};

use tracing::{debug, trace};

use crate::array::Array;
use crate::buffer::Buffer;
use crate::bytecode::{self, CALL_NO_HANDLER, Opcode};
use crate::error::OpalError;
use crate::func::{FuncDef, FuncEnv, Function};
use crate::gc::{Gc, Heap};
use crate::intern::InternCache;
use crate::ops;
use crate::strand::{NO_HANDLER, Strand, StrandStatus};
use crate::strings::{Str, djb2};
use crate::structs::StructBuilder;
use crate::syscall;
use crate::table::Table;
use crate::tuple::Tuple;
use crate::userdata::{UserType, Userdata};
use crate::value::{CFunction, TypeMask, TypeTag, Value};

/// Cap on nested interpreter entries from native code.
pub const MAX_DEPTH: u32 = 256;

/// Alphabet for unique-symbol suffixes: a 64-ary digit set over six
/// positions gives 64^6 suffixes per prefix.
const UNIQ_DIGITS: &[u8; 64] =
    b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz-_";

pub struct Vm {
    pub heap: Heap,
    pub intern: InternCache,
    /// Strand currently executing, if any.
    current: Cell<Option<Gc<Strand>>>,
    /// Loaded modules, keyed by name.
    pub modules: Gc<Table>,
    /// Host registry: cfunction <-> name, both directions, for marshalling.
    pub registry: Gc<Table>,
    /// Top-level environment: symbol -> value.
    pub env: Gc<Table>,
    /// Macro bindings: symbol -> function.
    pub macros: Gc<Table>,
    /// VM return slot; holds the last result or error and roots it.
    ret: Cell<Value>,
    /// Arguments staged by the push instructions for the next call.
    scratch: RefCell<Vec<Value>>,
    /// Temporaries pinned by re-entrant native calls.
    natives: RefCell<Vec<Vec<Value>>>,
    depth: Cell<u32>,
    uniq: Cell<u64>,
}

/// Keeps a batch of values rooted for the lifetime of a native call.
pub struct RootGuard<'vm> {
    vm: &'vm Vm,
}

impl Drop for RootGuard<'_> {
    fn drop(&mut self) {
        self.vm.natives.borrow_mut().pop();
    }
}

/// What the dispatch loop should do after a frame-level event.
enum Flow {
    Continue,
    Finished(Result<Value, Value>),
}

impl Vm {
    pub fn new() -> Vm {
        let heap = Heap::new();
        let modules = heap.alloc(TypeTag::Table, Table::new());
        let registry = heap.alloc(TypeTag::Table, Table::new());
        let env = heap.alloc(TypeTag::Table, Table::new());
        let macros = heap.alloc(TypeTag::Table, Table::new());
        let vm = Vm {
            heap,
            intern: InternCache::new(),
            current: Cell::new(None),
            modules,
            registry,
            env,
            macros,
            ret: Cell::new(Value::Nil),
            scratch: RefCell::new(Vec::new()),
            natives: RefCell::new(Vec::new()),
            depth: Cell::new(0),
            uniq: Cell::new(0),
        };
        syscall::install_core(&vm);
        vm
    }

    /// Last result or error; also a GC root.
    pub fn return_slot(&self) -> Value {
        self.ret.get()
    }

    pub fn current_strand(&self) -> Option<Gc<Strand>> {
        self.current.get()
    }

    // -----------------------------------------------------------------------
    // Value constructors

    /// Canonical string for the given bytes. The raw-bytes probe avoids
    /// allocating when the string already exists.
    pub fn string(&self, bytes: &[u8]) -> Value {
        let hash = djb2(bytes);
        if let Some(v) = self.intern.find_bytes(TypeTag::Str, bytes, hash) {
            return v;
        }
        let v = Value::Str(
            self.heap
                .alloc(TypeTag::Str, Str::new(bytes.to_vec().into_boxed_slice())),
        );
        self.intern.intern(v)
    }

    /// Canonical symbol for the given bytes.
    pub fn symbol(&self, bytes: &[u8]) -> Value {
        let hash = djb2(bytes);
        if let Some(v) = self.intern.find_bytes(TypeTag::Symbol, bytes, hash) {
            return v;
        }
        let v = Value::Symbol(
            self.heap
                .alloc(TypeTag::Symbol, Str::new(bytes.to_vec().into_boxed_slice())),
        );
        self.intern.intern(v)
    }

    /// A symbol guaranteed not to be interned yet: prefix plus a six-digit
    /// base-64 counter suffix, retried until the cache reports it unseen.
    pub fn uniq_symbol(&self, prefix: &[u8]) -> Value {
        loop {
            let n = self.uniq.get();
            self.uniq.set(n.wrapping_add(1));
            let mut name = prefix.to_vec();
            for i in 0..6 {
                name.push(UNIQ_DIGITS[((n >> (6 * i)) & 63) as usize]);
            }
            if self
                .intern
                .find_bytes(TypeTag::Symbol, &name, djb2(&name))
                .is_none()
            {
                return self.symbol(&name);
            }
        }
    }

    pub fn tuple(&self, items: Vec<Value>) -> Value {
        let v = Value::Tuple(
            self.heap
                .alloc(TypeTag::Tuple, Tuple::new(items.into_boxed_slice())),
        );
        self.intern.intern(v)
    }

    /// Struct from key/value pairs; nil keys and values are dropped.
    pub fn structure(&self, pairs: Vec<(Value, Value)>) -> Value {
        let mut builder = StructBuilder::new();
        for (k, v) in pairs {
            builder.put(k, v);
        }
        let v = Value::Struct(self.heap.alloc(TypeTag::Struct, builder.finish()));
        self.intern.intern(v)
    }

    pub fn array(&self, items: Vec<Value>) -> Value {
        Value::Array(self.heap.alloc(TypeTag::Array, Array::from_vec(items)))
    }

    pub fn buffer(&self, bytes: Vec<u8>) -> Value {
        Value::Buffer(self.heap.alloc(TypeTag::Buffer, Buffer::from_vec(bytes)))
    }

    pub fn new_table(&self) -> Gc<Table> {
        self.heap.alloc(TypeTag::Table, Table::new())
    }

    pub fn userdata(&self, utype: &'static UserType, data: Box<dyn std::any::Any>) -> Value {
        Value::Userdata(
            self.heap
                .alloc(TypeTag::Userdata, Userdata::new(utype, data)),
        )
    }

    pub fn alloc_funcdef(&self, def: FuncDef) -> Gc<FuncDef> {
        self.heap.alloc(TypeTag::FuncDef, def)
    }

    pub fn alloc_function(&self, f: Function) -> Gc<Function> {
        self.heap.alloc(TypeTag::Function, f)
    }

    pub(crate) fn alloc_env(&self, env: FuncEnv) -> Gc<FuncEnv> {
        self.heap.alloc(TypeTag::FuncEnv, env)
    }

    /// Error payload helper: errors are plain string values.
    pub fn error_str(&self, msg: impl AsRef<str>) -> Value {
        self.string(msg.as_ref().as_bytes())
    }

    // -----------------------------------------------------------------------
    // Globals and registration

    pub fn def_global(&self, name: &str, value: Value) {
        let sym = self.symbol(name.as_bytes());
        self.env.put(sym, value);
    }

    pub fn get_global(&self, name: &str) -> Value {
        let sym = self.symbol(name.as_bytes());
        self.env.get(sym)
    }

    /// Install a native function under `name`, and record both directions
    /// in the registry so cfunctions serialize by name.
    pub fn register(&self, name: &str, f: CFunction) {
        let sym = self.symbol(name.as_bytes());
        let name_str = self.string(name.as_bytes());
        self.env.put(sym, Value::CFunction(f));
        self.registry.put(Value::CFunction(f), name_str);
        self.registry.put(name_str, Value::CFunction(f));
    }

    // -----------------------------------------------------------------------
    // Collection

    /// Pin values so they survive collections triggered by re-entrant
    /// interpreter runs inside a native call.
    pub fn protect(&self, values: &[Value]) -> RootGuard<'_> {
        self.natives.borrow_mut().push(values.to_vec());
        RootGuard { vm: self }
    }

    pub(crate) fn maybe_collect(&self) {
        if self.heap.needs_collect() {
            self.collect();
        }
    }

    /// Full mark-and-sweep cycle over this VM's roots.
    pub fn collect(&self) {
        self.heap.mark_value(Value::Table(self.modules));
        self.heap.mark_value(Value::Table(self.registry));
        self.heap.mark_value(Value::Table(self.env));
        self.heap.mark_value(Value::Table(self.macros));
        self.heap.mark_value(self.ret.get());
        for v in self.scratch.borrow().iter() {
            self.heap.mark_value(*v);
        }
        for batch in self.natives.borrow().iter() {
            for v in batch.iter() {
                self.heap.mark_value(*v);
            }
        }
        if let Some(strand) = self.current.get() {
            self.heap.mark_value(Value::Strand(strand));
        }
        let swept = self.heap.sweep(|kind, len, hash, addr| {
            if matches!(
                kind,
                TypeTag::Str | TypeTag::Symbol | TypeTag::Tuple | TypeTag::Struct
            ) {
                self.intern.remove_dead(kind, len, hash, addr);
            }
        });
        debug!(
            swept,
            live = self.heap.block_count(),
            interned = self.intern.len(),
            "gc cycle"
        );
    }

    // -----------------------------------------------------------------------
    // Running

    /// Build a pending strand whose root frame calls `fun` with `args`.
    pub fn strand_for(&self, fun: Gc<Function>, args: &[Value]) -> Result<Gc<Strand>, Value> {
        let strand = self.heap.alloc(TypeTag::Strand, Strand::new());
        strand.begin_frame(Value::Function(fun), args, 0, NO_HANDLER);
        strand.end_frame(self)?;
        Ok(strand)
    }

    /// Compile-and-run entry point: run `fun` on a fresh root strand.
    pub fn run(&self, fun: Gc<Function>) -> Result<Value, OpalError> {
        self.call_value(Value::Function(fun), &[])
            .map_err(|e| OpalError::Runtime {
                message: ops::display(e),
                value: e,
            })
    }

    /// Call any callable from native code. Functions run on their own root
    /// strand so the caller's frame state is untouched; the strand's error,
    /// if any, is the `Err` payload.
    pub fn call_value(&self, callable: Value, args: &[Value]) -> Result<Value, Value> {
        match callable {
            Value::CFunction(cf) => {
                let _pin = self.protect(args);
                self.call_native(cf, args)
            }
            Value::Function(fun) => {
                if self.depth.get() >= MAX_DEPTH {
                    return Err(self.error_str("recursion limit exceeded"));
                }
                self.depth.set(self.depth.get() + 1);
                let _pin = self.protect(args);
                let saved = self.current.get();
                let result = self.strand_for(fun, args).and_then(|strand| {
                    strand.status.set(StrandStatus::Alive);
                    strand.started.set(true);
                    self.current.set(Some(strand));
                    self.execute()
                });
                self.current.set(saved);
                self.depth.set(self.depth.get() - 1);
                self.ret.set(match &result {
                    Ok(v) => *v,
                    Err(e) => *e,
                });
                result
            }
            other => Err(self.error_str(format!("cannot call {}", other.tag().name()))),
        }
    }

    fn call_native(&self, cf: CFunction, args: &[Value]) -> Result<Value, Value> {
        if self.depth.get() >= MAX_DEPTH {
            return Err(self.error_str("recursion limit exceeded"));
        }
        self.depth.set(self.depth.get() + 1);
        let result = cf(self, args);
        self.depth.set(self.depth.get() - 1);
        result
    }

    fn take_scratch(&self) -> Vec<Value> {
        std::mem::take(&mut *self.scratch.borrow_mut())
    }

    /// Return from the current frame with `result`. A root-frame return of
    /// the entry strand finishes the whole run, even when something has
    /// since transferred into the entry strand and parented it.
    fn do_return(&self, entry: Gc<Strand>, result: Value) -> Flow {
        let strand = match self.current.get() {
            Some(s) => s,
            None => return Flow::Finished(Ok(result)),
        };
        let (ret, _) = strand.ret_err();
        strand.pop_frame();
        if strand.has_frame() {
            strand.set_slot(ret as usize, result);
            return Flow::Continue;
        }
        strand.status.set(StrandStatus::Dead);
        strand.ret.set(result);
        trace!("strand finished");
        if strand == entry {
            return Flow::Finished(Ok(result));
        }
        match strand.parent.get() {
            Some(parent) => {
                strand.parent.set(None);
                parent.status.set(StrandStatus::Alive);
                parent.set_slot(parent.resume_slot.get() as usize, result);
                self.current.set(Some(parent));
                Flow::Continue
            }
            None => Flow::Finished(Ok(result)),
        }
    }

    /// Unwind frames with `err` until a handler frame or the strand root;
    /// at the root, propagate into the parent strand, or finish when the
    /// entry strand itself has unwound.
    fn unwind(&self, entry: Gc<Strand>, mut err: Value) -> Flow {
        loop {
            let strand = match self.current.get() {
                Some(s) => s,
                None => return Flow::Finished(Err(err)),
            };
            while strand.has_frame() {
                let (ret, handler) = strand.ret_err();
                strand.pop_frame();
                if handler != NO_HANDLER && strand.has_frame() {
                    let h = strand.slot(handler as usize);
                    match h {
                        Value::Function(_) => {
                            strand.begin_frame(h, &[err], ret, NO_HANDLER);
                            match strand.end_frame(self) {
                                Ok(()) => return Flow::Continue,
                                Err(e) => {
                                    strand.pop_frame();
                                    err = e;
                                }
                            }
                        }
                        Value::CFunction(cf) => {
                            let _pin = self.protect(&[err]);
                            match self.call_native(cf, &[err]) {
                                Ok(v) => {
                                    strand.set_slot(ret as usize, v);
                                    return Flow::Continue;
                                }
                                Err(e) => err = e,
                            }
                        }
                        other => {
                            err = self.error_str(format!(
                                "error handler is not callable: {}",
                                ops::describe(other)
                            ));
                        }
                    }
                }
            }
            strand.status.set(StrandStatus::Error);
            strand.ret.set(err);
            trace!("strand errored");
            if strand == entry {
                return Flow::Finished(Err(err));
            }
            match strand.parent.get() {
                Some(parent) => {
                    strand.parent.set(None);
                    parent.status.set(StrandStatus::Alive);
                    self.current.set(Some(parent));
                    // Rethrow at the parent's transfer site.
                }
                None => return Flow::Finished(Err(err)),
            }
        }
    }

    /// The dispatch loop. Runs until the entry strand returns or errors.
    fn execute(&self) -> Result<Value, Value> {
        let entry = match self.current.get() {
            Some(s) => s,
            None => return Err(self.error_str("no strand to execute")),
        };

        'frames: loop {
            macro_rules! flow {
                ($flow:expr) => {
                    match $flow {
                        Flow::Continue => continue 'frames,
                        Flow::Finished(r) => return r,
                    }
                };
            }
            macro_rules! throw {
                ($err:expr) => {
                    flow!(self.unwind(entry, $err))
                };
            }

            let strand = match self.current.get() {
                Some(s) => s,
                None => return Err(self.error_str("no strand to execute")),
            };
            if !strand.has_frame() {
                return Err(self.error_str("strand has no frame"));
            }
            let fun = match strand.callee() {
                Value::Function(f) => f,
                other => {
                    throw!(self.error_str(format!("cannot execute {}", other.tag().name())))
                }
            };
            let def = fun.def();
            let mut pc = strand.pc();

            loop {
                // Safe point: between instructions every live value is
                // reachable from the roots.
                self.maybe_collect();

                let word = match def.bytecode.get(pc) {
                    Some(w) => *w,
                    None => throw!(self.error_str("program counter out of range")),
                };
                pc += 1;
                let opcode = match Opcode::try_from(bytecode::op(word)) {
                    Ok(op) => op,
                    Err(_) => throw!(self.error_str("illegal instruction")),
                };
                let a = bytecode::a(word) as usize;

                match opcode {
                    Opcode::Nil => strand.set_slot(a, Value::Nil),
                    Opcode::False => strand.set_slot(a, Value::Bool(false)),
                    Opcode::True => strand.set_slot(a, Value::Bool(true)),
                    Opcode::Imm16 => {
                        strand.set_slot(a, Value::Int(bytecode::bc_signed(word) as i64))
                    }
                    Opcode::Imm32 => {
                        let imm = match def.bytecode.get(pc) {
                            Some(w) => *w as i32 as i64,
                            None => throw!(self.error_str("truncated immediate")),
                        };
                        pc += 1;
                        strand.set_slot(a, Value::Int(imm));
                    }
                    Opcode::Imm64 | Opcode::ImmF64 => {
                        let (lo, hi) = match (def.bytecode.get(pc), def.bytecode.get(pc + 1)) {
                            (Some(lo), Some(hi)) => (*lo as u64, *hi as u64),
                            _ => throw!(self.error_str("truncated immediate")),
                        };
                        pc += 2;
                        let bits = lo | (hi << 32);
                        let value = if opcode == Opcode::Imm64 {
                            Value::Int(bits as i64)
                        } else {
                            Value::Float(f64::from_bits(bits))
                        };
                        strand.set_slot(a, value);
                    }
                    Opcode::Const => {
                        let idx = bytecode::bc(word) as usize;
                        match def.literals.get(idx) {
                            Some(v) => strand.set_slot(a, *v),
                            None => throw!(self.error_str("literal index out of range")),
                        }
                    }
                    Opcode::Move => {
                        let v = strand.slot(bytecode::b(word) as usize);
                        strand.set_slot(a, v);
                    }
                    Opcode::Swap => {
                        let b = bytecode::b(word) as usize;
                        let (x, y) = (strand.slot(a), strand.slot(b));
                        strand.set_slot(a, y);
                        strand.set_slot(b, x);
                    }
                    Opcode::GetUpval => {
                        let eidx = bytecode::b(word) as usize;
                        let env = if eidx == 0 {
                            match strand.env_slot() {
                                Value::FuncEnv(e) => e,
                                _ => throw!(self.error_str("frame has no environment")),
                            }
                        } else {
                            match fun.env(eidx - 1) {
                                Some(e) => e,
                                None => throw!(self.error_str("environment index out of range")),
                            }
                        };
                        match env.get(bytecode::c(word) as usize) {
                            Some(v) => strand.set_slot(a, v),
                            None => throw!(self.error_str("environment slot out of range")),
                        }
                    }
                    Opcode::SetUpval => {
                        let eidx = bytecode::b(word) as usize;
                        let env = if eidx == 0 {
                            match strand.env_slot() {
                                Value::FuncEnv(e) => e,
                                _ => throw!(self.error_str("frame has no environment")),
                            }
                        } else {
                            match fun.env(eidx - 1) {
                                Some(e) => e,
                                None => throw!(self.error_str("environment index out of range")),
                            }
                        };
                        if !env.set(bytecode::c(word) as usize, strand.slot(a)) {
                            throw!(self.error_str("environment slot out of range"));
                        }
                    }
                    Opcode::Jump => {
                        pc = (pc as i64 - 1 + bytecode::abc_signed(word) as i64) as usize;
                    }
                    Opcode::JumpIf => {
                        if strand.slot(a).truthy() {
                            pc = (pc as i64 - 1 + bytecode::bc_signed(word) as i64) as usize;
                        }
                    }
                    Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Div | Opcode::Mod
                    | Opcode::BAnd | Opcode::BOr | Opcode::BXor | Opcode::Shl | Opcode::Shr
                    | Opcode::AShr => {
                        let x = strand.slot(bytecode::b(word) as usize);
                        let y = strand.slot(bytecode::c(word) as usize);
                        let result = match opcode {
                            Opcode::Add => ops::add(self, x, y),
                            Opcode::Sub => ops::sub(self, x, y),
                            Opcode::Mul => ops::mul(self, x, y),
                            Opcode::Div => ops::div(self, x, y),
                            Opcode::Mod => ops::modulo(self, x, y),
                            Opcode::BAnd => ops::band(self, x, y),
                            Opcode::BOr => ops::bor(self, x, y),
                            Opcode::BXor => ops::bxor(self, x, y),
                            Opcode::Shl => ops::shl(self, x, y),
                            Opcode::Shr => ops::shr(self, x, y),
                            _ => ops::ashr(self, x, y),
                        };
                        match result {
                            Ok(v) => strand.set_slot(a, v),
                            Err(e) => throw!(e),
                        }
                    }
                    Opcode::Eq => {
                        let x = strand.slot(bytecode::b(word) as usize);
                        let y = strand.slot(bytecode::c(word) as usize);
                        strand.set_slot(a, Value::Bool(ops::equals(x, y)));
                    }
                    Opcode::Neq => {
                        let x = strand.slot(bytecode::b(word) as usize);
                        let y = strand.slot(bytecode::c(word) as usize);
                        strand.set_slot(a, Value::Bool(!ops::equals(x, y)));
                    }
                    Opcode::Lt | Opcode::Lte | Opcode::Gt | Opcode::Gte => {
                        let x = strand.slot(bytecode::b(word) as usize);
                        let y = strand.slot(bytecode::c(word) as usize);
                        let ord = ops::compare(x, y);
                        let truth = match opcode {
                            Opcode::Lt => ord == std::cmp::Ordering::Less,
                            Opcode::Lte => ord != std::cmp::Ordering::Greater,
                            Opcode::Gt => ord == std::cmp::Ordering::Greater,
                            _ => ord != std::cmp::Ordering::Less,
                        };
                        strand.set_slot(a, Value::Bool(truth));
                    }
                    Opcode::TypeCheck => {
                        let mask = TypeMask::from_bits_truncate(bytecode::bc(word) as u32);
                        let v = strand.slot(a);
                        if !mask.contains(v.tag()) {
                            throw!(self.error_str(format!(
                                "unexpected type {}",
                                v.tag().name()
                            )));
                        }
                    }
                    Opcode::Push1 => {
                        let v = strand.slot(a);
                        self.scratch.borrow_mut().push(v);
                    }
                    Opcode::Push2 => {
                        let x = strand.slot(a);
                        let y = strand.slot(bytecode::b(word) as usize);
                        let mut scratch = self.scratch.borrow_mut();
                        scratch.push(x);
                        scratch.push(y);
                    }
                    Opcode::Push3 => {
                        let x = strand.slot(a);
                        let y = strand.slot(bytecode::b(word) as usize);
                        let z = strand.slot(bytecode::c(word) as usize);
                        let mut scratch = self.scratch.borrow_mut();
                        scratch.push(x);
                        scratch.push(y);
                        scratch.push(z);
                    }
                    Opcode::PushArray => {
                        match strand.slot(a) {
                            Value::Array(arr) => {
                                let items = arr.data.borrow().clone();
                                self.scratch.borrow_mut().extend(items);
                            }
                            Value::Tuple(t) => {
                                self.scratch.borrow_mut().extend(t.items.iter().copied());
                            }
                            other => throw!(self.error_str(format!(
                                "cannot splice {}",
                                other.tag().name()
                            ))),
                        }
                    }
                    Opcode::Call => {
                        let callee = strand.slot(bytecode::b(word) as usize);
                        let handler = bytecode::c(word);
                        let err = if handler == CALL_NO_HANDLER {
                            NO_HANDLER
                        } else {
                            handler as u32
                        };
                        let args = self.take_scratch();
                        match callee {
                            Value::Function(_) => {
                                strand.set_pc(pc);
                                strand.begin_frame(callee, &args, a as u32, err);
                                if let Err(e) = strand.end_frame(self) {
                                    strand.pop_frame();
                                    throw!(e);
                                }
                                continue 'frames;
                            }
                            Value::CFunction(cf) => {
                                strand.set_pc(pc);
                                let _pin = self.protect(&args);
                                match self.call_native(cf, &args) {
                                    Ok(v) => strand.set_slot(a, v),
                                    Err(e) => {
                                        drop(_pin);
                                        if err != NO_HANDLER {
                                            let h = strand.slot(err as usize);
                                            match self.call_value(h, &[e]) {
                                                Ok(v) => strand.set_slot(a, v),
                                                Err(e2) => throw!(e2),
                                            }
                                        } else {
                                            throw!(e);
                                        }
                                    }
                                }
                            }
                            other => throw!(self.error_str(format!(
                                "cannot call {}",
                                other.tag().name()
                            ))),
                        }
                    }
                    Opcode::TailCall => {
                        let callee = strand.slot(a);
                        let args = self.take_scratch();
                        match callee {
                            Value::Function(_) => {
                                if let Err(e) = strand.tail_rewrite(self, callee, &args) {
                                    throw!(e);
                                }
                                continue 'frames;
                            }
                            Value::CFunction(cf) => {
                                let _pin = self.protect(&args);
                                match self.call_native(cf, &args) {
                                    Ok(v) => {
                                        drop(_pin);
                                        flow!(self.do_return(entry, v));
                                    }
                                    Err(e) => {
                                        drop(_pin);
                                        throw!(e);
                                    }
                                }
                            }
                            other => throw!(self.error_str(format!(
                                "cannot call {}",
                                other.tag().name()
                            ))),
                        }
                    }
                    Opcode::Closure => {
                        let idx = bytecode::bc(word) as usize;
                        let child = match def.literals.get(idx) {
                            Some(Value::FuncDef(d)) => *d,
                            _ => throw!(self.error_str("closure literal is not a funcdef")),
                        };
                        let mut envs = Vec::with_capacity(child.envs.len());
                        let mut bad = None;
                        for &capture in child.envs.iter() {
                            if capture == 0 {
                                envs.push(strand.materialize_env(self, strand));
                            } else {
                                match fun.env(capture as usize - 1) {
                                    Some(e) => envs.push(e),
                                    None => {
                                        bad = Some(capture);
                                        break;
                                    }
                                }
                            }
                        }
                        if let Some(capture) = bad {
                            throw!(self.error_str(format!(
                                "closure capture {} out of range",
                                capture
                            )));
                        }
                        let f =
                            self.alloc_function(Function::new(child, envs.into_boxed_slice()));
                        strand.set_slot(a, Value::Function(f));
                    }
                    Opcode::Return => {
                        let v = strand.slot(a);
                        flow!(self.do_return(entry, v));
                    }
                    Opcode::ReturnNil => {
                        flow!(self.do_return(entry, Value::Nil));
                    }
                    Opcode::Transfer => {
                        let target = match strand.slot(bytecode::b(word) as usize) {
                            Value::Strand(s) => s,
                            other => throw!(self.error_str(format!(
                                "cannot transfer to {}",
                                other.tag().name()
                            ))),
                        };
                        let passed = strand.slot(bytecode::c(word) as usize);
                        match target.status.get() {
                            StrandStatus::Pending => {
                                strand.set_pc(pc);
                                strand.resume_slot.set(a as u32);
                                strand.status.set(StrandStatus::Pending);
                                target.parent.set(Some(strand));
                                target.status.set(StrandStatus::Alive);
                                if target.started.get() {
                                    let slot = target.resume_slot.get() as usize;
                                    target.set_slot(slot, passed);
                                } else {
                                    target.started.set(true);
                                    target.ret.set(passed);
                                }
                                trace!("transfer");
                                self.current.set(Some(target));
                                continue 'frames;
                            }
                            StrandStatus::Error => {
                                let e = target.ret.get();
                                throw!(e);
                            }
                            StrandStatus::Dead => {
                                throw!(self.error_str("cannot transfer to a dead strand"))
                            }
                            StrandStatus::Alive => {
                                throw!(self.error_str("cannot transfer to a running strand"))
                            }
                        }
                    }
                    Opcode::Syscall => {
                        let idx = bytecode::bc(word) as usize;
                        let handler = match syscall::table().get(idx) {
                            Some((_, f)) => *f,
                            None => throw!(self.error_str("syscall index out of range")),
                        };
                        let args = self.take_scratch();
                        strand.set_pc(pc);
                        let _pin = self.protect(&args);
                        match handler(self, &args) {
                            Ok(v) => strand.set_slot(a, v),
                            Err(e) => {
                                drop(_pin);
                                throw!(e);
                            }
                        }
                    }
                }
            }
        }
    }
}

impl Default for Vm {
    fn default() -> Self {
        Vm::new()
    }
}
