//! Form trees to FuncDefs.
//!
//! Single pass over the form with a stack of [`FnState`]s mirroring lexical
//! nesting. Special forms compile to dedicated instruction patterns; every
//! other tuple is a call. Macro heads are expanded (through the VM) before
//! the compiler looks at a tuple. Tail positions — the end of a function
//! body, both branches of a tail `if`, the last form of a tail `do`/`let` —
//! emit `tail-call` instead of `call`.
//!
//! Failure is fail-fast: the first malformed form, unbound symbol or macro
//! fault aborts compilation with a description and the offending form.

use tracing::trace;

use opal_core::bytecode::{self, CALL_NO_HANDLER, Opcode, enc, enc_abc, enc_bc};
use opal_core::error::OpalError;
use opal_core::func::{DefFlags, FuncDef, Function};
use opal_core::gc::Gc;
use opal_core::ops;
use opal_core::syscall::syscall_index;
use opal_core::value::Value;
use opal_core::vm::Vm;

use crate::scope::{FnState, Resolution, lexically_bound, resolve};

const MACRO_DEPTH: usize = 200;

/// Compile one form into a zero-argument function ready to run.
pub fn compile(vm: &Vm, form: Value) -> Result<Gc<Function>, OpalError> {
    let mut compiler = Compiler {
        vm,
        fns: vec![FnState::new(0, false)],
    };
    let result = compiler.expr(form, true)?;
    compiler.emit(enc(Opcode::Return, result.index as u8, 0, 0));
    let state = compiler.fns.pop().expect("root function state");
    let def = finish(vm, state);
    trace!(locals = def.locals, words = def.bytecode.len(), "compiled form");
    Ok(vm.alloc_function(Function::new(def, Box::new([]))))
}

/// Parse, compile and run every form in `source`; the last result wins.
pub fn eval(vm: &Vm, source: &str) -> Result<Value, OpalError> {
    let forms = crate::parser::parse_all(vm, source)?;
    let mut last = Value::Nil;
    for form in forms {
        let fun = compile(vm, form)?;
        last = vm.run(fun)?;
    }
    Ok(last)
}

fn finish(vm: &Vm, state: FnState) -> Gc<FuncDef> {
    let mut flags = DefFlags::empty();
    if state.vararg {
        flags |= DefFlags::VARARG;
    }
    if state.needs_env {
        flags |= DefFlags::NEEDS_ENV;
    }
    if state.needs_parent {
        flags |= DefFlags::NEEDS_PARENT;
    }
    vm.alloc_funcdef(FuncDef {
        arity: state.arity,
        locals: state.locals(),
        flags,
        literals: state.consts.into_boxed_slice(),
        bytecode: state.code.into_boxed_slice(),
        envs: state.envs.into_boxed_slice(),
    })
}

/// A compiled expression: the slot holding its value, and whether that slot
/// is a reusable temporary or a named binding.
#[derive(Debug, Clone, Copy)]
struct Slot {
    index: u32,
    temp: bool,
}

struct Compiler<'vm> {
    vm: &'vm Vm,
    fns: Vec<FnState>,
}

fn sym_addr(v: Value) -> usize {
    v.heap_addr()
}

fn sym_name(v: Value) -> Option<Vec<u8>> {
    match v {
        Value::Symbol(s) => Some(s.bytes.to_vec()),
        _ => None,
    }
}

impl Compiler<'_> {
    fn cerr(&self, message: impl Into<String>, form: Value) -> OpalError {
        OpalError::Compile {
            message: message.into(),
            form: Some(ops::describe(form)),
        }
    }

    fn f(&mut self) -> &mut FnState {
        self.fns.last_mut().expect("function state")
    }

    fn emit(&mut self, word: u32) {
        self.f().code.push(word);
    }

    fn here(&mut self) -> usize {
        self.f().code.len()
    }

    fn temp(&mut self, form: Value) -> Result<Slot, OpalError> {
        match self.f().alloc_slot() {
            Ok(index) => Ok(Slot { index, temp: true }),
            Err(msg) => Err(self.cerr(msg, form)),
        }
    }

    fn release(&mut self, slot: Slot) {
        if slot.temp {
            self.f().free_slot(slot.index);
        }
    }

    /// Emit a forward jump with a dummy offset; returns the patch site.
    fn placeholder(&mut self, op: Opcode, a: u8) -> usize {
        let at = self.f().code.len();
        self.emit(enc(op, a, 0, 0));
        at
    }

    fn patch_to_here(&mut self, at: usize, form: Value) -> Result<(), OpalError> {
        let target = self.f().code.len() as i64;
        let offset = target - at as i64;
        let word = self.f().code[at];
        let op = Opcode::try_from(bytecode::op(word)).expect("patching a jump");
        let patched = match op {
            Opcode::Jump => {
                if offset.abs() >= (1 << 23) {
                    return Err(self.cerr("jump distance too large", form));
                }
                enc_abc(Opcode::Jump, offset as i32)
            }
            Opcode::JumpIf => {
                if offset.abs() >= (1 << 15) {
                    return Err(self.cerr("jump distance too large", form));
                }
                enc_bc(Opcode::JumpIf, bytecode::a(word), offset as i16 as u16)
            }
            _ => unreachable!("patching a non-jump"),
        };
        self.f().code[at] = patched;
        Ok(())
    }

    fn constant(&mut self, v: Value, form: Value) -> Result<u16, OpalError> {
        self.f().constant(v).map_err(|msg| self.cerr(msg, form))
    }

    /// Load a literal value into a fresh slot. Integers and reals embed as
    /// immediates; everything else goes through the literal pool.
    fn load_value(&mut self, v: Value, form: Value) -> Result<Slot, OpalError> {
        let dst = self.temp(form)?;
        let a = dst.index as u8;
        match v {
            Value::Nil => self.emit(enc(Opcode::Nil, a, 0, 0)),
            Value::Bool(true) => self.emit(enc(Opcode::True, a, 0, 0)),
            Value::Bool(false) => self.emit(enc(Opcode::False, a, 0, 0)),
            Value::Int(i) => {
                if let Ok(small) = i16::try_from(i) {
                    self.emit(enc_bc(Opcode::Imm16, a, small as u16));
                } else if let Ok(medium) = i32::try_from(i) {
                    self.emit(enc(Opcode::Imm32, a, 0, 0));
                    self.emit(medium as u32);
                } else {
                    self.emit(enc(Opcode::Imm64, a, 0, 0));
                    self.emit(i as u64 as u32);
                    self.emit(((i as u64) >> 32) as u32);
                }
            }
            Value::Float(x) => {
                let bits = x.to_bits();
                self.emit(enc(Opcode::ImmF64, a, 0, 0));
                self.emit(bits as u32);
                self.emit((bits >> 32) as u32);
            }
            other => {
                let idx = self.constant(other, form)?;
                self.emit(enc_bc(Opcode::Const, a, idx));
            }
        }
        Ok(dst)
    }

    /// Expand macro heads until the form stops changing.
    fn expand(&mut self, form: Value) -> Result<Value, OpalError> {
        let vm = self.vm;
        let mut current = form;
        for _ in 0..MACRO_DEPTH {
            let items = match current {
                Value::Tuple(t) if !t.is_empty() => t,
                _ => return Ok(current),
            };
            let head = items.items[0];
            if sym_name(head).is_none() || lexically_bound(&self.fns, sym_addr(head)) {
                return Ok(current);
            }
            let macro_fn = vm.macros.get(head);
            if macro_fn.is_nil() {
                return Ok(current);
            }
            let args: Vec<Value> = items.items[1..].to_vec();
            current = vm.call_value(macro_fn, &args).map_err(|e| {
                self.cerr(
                    format!("macro expansion failed: {}", ops::display(e)),
                    current,
                )
            })?;
        }
        Err(self.cerr("macro expansion too deep", form))
    }

    fn expr(&mut self, form: Value, tail: bool) -> Result<Slot, OpalError> {
        match form {
            Value::Tuple(_) => {
                let expanded = self.expand(form)?;
                match expanded {
                    Value::Tuple(t) => {
                        let items: Vec<Value> = t.items.to_vec();
                        self.tuple_form(expanded, &items, tail)
                    }
                    other => self.expr(other, tail),
                }
            }
            Value::Symbol(_) => self.symbol_ref(form),
            Value::Array(arr) => {
                let items: Vec<Value> = arr.data.borrow().clone();
                let idx = syscall_index("array").expect("array syscall");
                self.syscall_form(idx, &items, form)
            }
            Value::Table(t) => {
                let mut items = Vec::new();
                for (k, v) in t.entries() {
                    items.push(k);
                    items.push(v);
                }
                let idx = syscall_index("table").expect("table syscall");
                self.syscall_form(idx, &items, form)
            }
            Value::Struct(s) => {
                let mut items = Vec::new();
                for (k, v) in s.entries() {
                    items.push(k);
                    items.push(v);
                }
                let idx = syscall_index("struct").expect("struct syscall");
                self.syscall_form(idx, &items, form)
            }
            Value::Buffer(_) => {
                // A fresh buffer per evaluation: copy the literal bytes.
                let lit = self.load_value(form, form)?;
                self.emit(enc(Opcode::Push1, lit.index as u8, 0, 0));
                let dst = self.temp(form)?;
                let idx = syscall_index("buffer").expect("buffer syscall");
                self.emit(enc_bc(Opcode::Syscall, dst.index as u8, idx));
                self.release(lit);
                Ok(dst)
            }
            other => self.load_value(other, other),
        }
    }

    fn symbol_ref(&mut self, form: Value) -> Result<Slot, OpalError> {
        match resolve(&mut self.fns, sym_addr(form)) {
            Resolution::Local { slot, .. } => Ok(Slot {
                index: slot,
                temp: false,
            }),
            Resolution::Upvalue { env, slot, .. } => {
                if env > u8::MAX as u32 || slot > u8::MAX as u32 {
                    return Err(self.cerr("too many captured environments", form));
                }
                let dst = self.temp(form)?;
                self.emit(enc(Opcode::GetUpval, dst.index as u8, env as u8, slot as u8));
                Ok(dst)
            }
            Resolution::Unbound => {
                if !self.vm.macros.get(form).is_nil() {
                    return Err(self.cerr("macro used as a value", form));
                }
                let global = self.vm.env.get(form);
                if global.is_nil() {
                    return Err(self.cerr(
                        format!("unknown symbol {}", ops::describe(form)),
                        form,
                    ));
                }
                self.load_value(global, form)
            }
        }
    }

    fn tuple_form(&mut self, form: Value, items: &[Value], tail: bool) -> Result<Slot, OpalError> {
        if items.is_empty() {
            return Err(self.cerr("cannot call the empty tuple", form));
        }
        let head = items[0];
        if let Some(name) = sym_name(head) {
            match name.as_slice() {
                b"quote" => {
                    self.expect_arity(form, items, 2)?;
                    return self.load_value(items[1], form);
                }
                b"def" => return self.form_def(form, items, false),
                b"var" => return self.form_def(form, items, true),
                b"set!" => return self.form_set(form, items),
                b"if" => return self.form_if(form, items, tail),
                b"do" => return self.form_do(&items[1..], tail),
                b"let" => return self.form_let(form, items, tail),
                b"while" => return self.form_while(form, items),
                b"fn" => return self.form_fn(form, items),
                b"try" => return self.form_try(form, items),
                b"defmacro" => return self.form_defmacro(form, items),
                b"transfer" => return self.form_transfer(form, items),
                b"and" => return self.form_and_or(form, items, true),
                b"or" => return self.form_and_or(form, items, false),
                b"not" => return self.form_not(form, items),
                _ => {}
            }
            if !lexically_bound(&self.fns, sym_addr(head)) {
                if let Some(result) = self.builtin_form(form, &name, &items[1..], tail)? {
                    return Ok(result);
                }
                if let Some(idx) = std::str::from_utf8(&name).ok().and_then(syscall_index) {
                    return self.syscall_form(idx, &items[1..], form);
                }
            }
        }
        self.call_form(form, items, tail)
    }

    fn expect_arity(&self, form: Value, items: &[Value], n: usize) -> Result<(), OpalError> {
        if items.len() != n {
            return Err(self.cerr(
                format!("expected {} form(s), got {}", n - 1, items.len() - 1),
                form,
            ));
        }
        Ok(())
    }

    // -- calls --------------------------------------------------------------

    fn emit_pushes(&mut self, args: &[Slot]) {
        let mut rest = args;
        loop {
            match rest {
                [] => return,
                [a] => {
                    self.emit(enc(Opcode::Push1, a.index as u8, 0, 0));
                    return;
                }
                [a, b] => {
                    self.emit(enc(Opcode::Push2, a.index as u8, b.index as u8, 0));
                    return;
                }
                [a, b, c, tail @ ..] => {
                    self.emit(enc(
                        Opcode::Push3,
                        a.index as u8,
                        b.index as u8,
                        c.index as u8,
                    ));
                    rest = tail;
                }
            }
        }
    }

    fn call_form(&mut self, form: Value, items: &[Value], tail: bool) -> Result<Slot, OpalError> {
        let fslot = self.expr(items[0], false)?;
        let mut args = Vec::with_capacity(items.len() - 1);
        for arg in &items[1..] {
            args.push(self.expr(*arg, false)?);
        }
        self.emit_pushes(&args);
        let dst = if tail {
            self.emit(enc(Opcode::TailCall, fslot.index as u8, 0, 0));
            // Nothing runs after a tail call; the slot only satisfies the
            // expression protocol.
            self.temp(form)?
        } else {
            let dst = self.temp(form)?;
            self.emit(enc(
                Opcode::Call,
                dst.index as u8,
                fslot.index as u8,
                CALL_NO_HANDLER,
            ));
            dst
        };
        for arg in args {
            self.release(arg);
        }
        self.release(fslot);
        Ok(dst)
    }

    fn syscall_form(&mut self, idx: u16, argforms: &[Value], form: Value) -> Result<Slot, OpalError> {
        let mut args = Vec::with_capacity(argforms.len());
        for arg in argforms {
            args.push(self.expr(*arg, false)?);
        }
        self.emit_pushes(&args);
        let dst = self.temp(form)?;
        self.emit(enc_bc(Opcode::Syscall, dst.index as u8, idx));
        for arg in args {
            self.release(arg);
        }
        Ok(dst)
    }

    // -- operators ----------------------------------------------------------

    /// Inline arithmetic/comparison heads. Returns `None` when the head is
    /// not a builtin operator.
    fn builtin_form(
        &mut self,
        form: Value,
        name: &[u8],
        argforms: &[Value],
        _tail: bool,
    ) -> Result<Option<Slot>, OpalError> {
        let fold = |op: Opcode| Some((op, true));
        let binary = |op: Opcode| Some((op, false));
        let operator = match name {
            b"+" => fold(Opcode::Add),
            b"*" => fold(Opcode::Mul),
            b"-" => fold(Opcode::Sub),
            b"/" => fold(Opcode::Div),
            b"band" => fold(Opcode::BAnd),
            b"bor" => fold(Opcode::BOr),
            b"bxor" => fold(Opcode::BXor),
            b"%" => binary(Opcode::Mod),
            b"shl" => binary(Opcode::Shl),
            b"shr" => binary(Opcode::Shr),
            b"ashr" => binary(Opcode::AShr),
            b"=" => binary(Opcode::Eq),
            b"not=" => binary(Opcode::Neq),
            b"<" => binary(Opcode::Lt),
            b"<=" => binary(Opcode::Lte),
            b">" => binary(Opcode::Gt),
            b">=" => binary(Opcode::Gte),
            _ => None,
        };
        let (op, nary) = match operator {
            Some(o) => o,
            None => return Ok(None),
        };
        if !nary {
            if argforms.len() != 2 {
                return Err(self.cerr(
                    format!("operator expects 2 arguments, got {}", argforms.len()),
                    form,
                ));
            }
            let lhs = self.expr(argforms[0], false)?;
            let rhs = self.expr(argforms[1], false)?;
            let dst = self.temp(form)?;
            self.emit(enc(op, dst.index as u8, lhs.index as u8, rhs.index as u8));
            self.release(rhs);
            self.release(lhs);
            return Ok(Some(dst));
        }
        // N-ary fold.
        match argforms.len() {
            0 => {
                let identity = match op {
                    Opcode::Add => 0i64,
                    Opcode::Mul => 1,
                    _ => {
                        return Err(self.cerr("operator expects at least 1 argument", form));
                    }
                };
                Ok(Some(self.load_value(Value::Int(identity), form)?))
            }
            1 => match op {
                // Unary minus negates; the rest pass the value through.
                Opcode::Sub => {
                    let zero = self.load_value(Value::Int(0), form)?;
                    let x = self.expr(argforms[0], false)?;
                    let dst = self.temp(form)?;
                    self.emit(enc(
                        Opcode::Sub,
                        dst.index as u8,
                        zero.index as u8,
                        x.index as u8,
                    ));
                    self.release(x);
                    self.release(zero);
                    Ok(Some(dst))
                }
                Opcode::Div => Err(self.cerr("/ expects at least 2 arguments", form)),
                _ => Ok(Some(self.expr(argforms[0], false)?)),
            },
            _ => {
                let dst = self.temp(form)?;
                let first = self.expr(argforms[0], false)?;
                let second = self.expr(argforms[1], false)?;
                self.emit(enc(
                    op,
                    dst.index as u8,
                    first.index as u8,
                    second.index as u8,
                ));
                self.release(second);
                self.release(first);
                for arg in &argforms[2..] {
                    let next = self.expr(*arg, false)?;
                    self.emit(enc(op, dst.index as u8, dst.index as u8, next.index as u8));
                    self.release(next);
                }
                Ok(Some(dst))
            }
        }
    }

    // -- special forms ------------------------------------------------------

    fn form_def(&mut self, form: Value, items: &[Value], mutable: bool) -> Result<Slot, OpalError> {
        self.expect_arity(form, items, 3)?;
        let sym = items[1];
        if sym_name(sym).is_none() {
            return Err(self.cerr("definition name must be a symbol", form));
        }
        let value = self.expr(items[2], false)?;
        let slot = match self.f().alloc_slot() {
            Ok(s) => s,
            Err(msg) => return Err(self.cerr(msg, form)),
        };
        self.emit(enc(Opcode::Move, slot as u8, value.index as u8, 0));
        self.release(value);
        self.f().bind(sym_addr(sym), slot, mutable);
        if self.fns.len() == 1 {
            // Top level: publish into the environment table at runtime so
            // later forms see the binding.
            let env = self.load_value(Value::Table(self.vm.env), form)?;
            let key = self.load_value(sym, form)?;
            self.emit(enc(
                Opcode::Push3,
                env.index as u8,
                key.index as u8,
                slot as u8,
            ));
            let scratch = self.temp(form)?;
            let put = syscall_index("put").expect("put syscall");
            self.emit(enc_bc(Opcode::Syscall, scratch.index as u8, put));
            self.release(scratch);
            self.release(key);
            self.release(env);
        }
        Ok(Slot {
            index: slot,
            temp: false,
        })
    }

    fn form_set(&mut self, form: Value, items: &[Value]) -> Result<Slot, OpalError> {
        self.expect_arity(form, items, 3)?;
        let sym = items[1];
        if sym_name(sym).is_none() {
            return Err(self.cerr("assignment target must be a symbol", form));
        }
        let value = self.expr(items[2], false)?;
        match resolve(&mut self.fns, sym_addr(sym)) {
            Resolution::Local { slot, mutable } => {
                if !mutable {
                    return Err(self.cerr(
                        format!("cannot assign to immutable binding {}", ops::describe(sym)),
                        form,
                    ));
                }
                self.emit(enc(Opcode::Move, slot as u8, value.index as u8, 0));
                self.release(value);
                Ok(Slot {
                    index: slot,
                    temp: false,
                })
            }
            Resolution::Upvalue { env, slot, mutable } => {
                if !mutable {
                    return Err(self.cerr(
                        format!("cannot assign to immutable binding {}", ops::describe(sym)),
                        form,
                    ));
                }
                self.emit(enc(
                    Opcode::SetUpval,
                    value.index as u8,
                    env as u8,
                    slot as u8,
                ));
                Ok(value)
            }
            Resolution::Unbound => {
                if self.vm.env.get(sym).is_nil() {
                    return Err(self.cerr(
                        format!("unknown symbol {}", ops::describe(sym)),
                        form,
                    ));
                }
                let env = self.load_value(Value::Table(self.vm.env), form)?;
                let key = self.load_value(sym, form)?;
                self.emit(enc(
                    Opcode::Push3,
                    env.index as u8,
                    key.index as u8,
                    value.index as u8,
                ));
                let scratch = self.temp(form)?;
                let put = syscall_index("put").expect("put syscall");
                self.emit(enc_bc(Opcode::Syscall, scratch.index as u8, put));
                self.release(scratch);
                self.release(key);
                self.release(env);
                Ok(value)
            }
        }
    }

    fn form_if(&mut self, form: Value, items: &[Value], tail: bool) -> Result<Slot, OpalError> {
        if items.len() != 3 && items.len() != 4 {
            return Err(self.cerr("if expects a condition, a branch and an optional else", form));
        }
        let dst = self.temp(form)?;
        let cond = self.expr(items[1], false)?;
        let jump_then = self.placeholder(Opcode::JumpIf, cond.index as u8);
        self.release(cond);
        let else_val = if items.len() == 4 {
            self.expr(items[3], tail)?
        } else {
            self.load_value(Value::Nil, form)?
        };
        self.emit(enc(Opcode::Move, dst.index as u8, else_val.index as u8, 0));
        self.release(else_val);
        let jump_end = self.placeholder(Opcode::Jump, 0);
        self.patch_to_here(jump_then, form)?;
        let then_val = self.expr(items[2], tail)?;
        self.emit(enc(Opcode::Move, dst.index as u8, then_val.index as u8, 0));
        self.release(then_val);
        self.patch_to_here(jump_end, form)?;
        Ok(dst)
    }

    fn form_do(&mut self, body: &[Value], tail: bool) -> Result<Slot, OpalError> {
        match body {
            [] => self.load_value(Value::Nil, Value::Nil),
            [rest @ .., last] => {
                for form in rest {
                    let slot = self.expr(*form, false)?;
                    self.release(slot);
                }
                self.expr(*last, tail)
            }
        }
    }

    fn form_let(&mut self, form: Value, items: &[Value], tail: bool) -> Result<Slot, OpalError> {
        if items.len() < 2 {
            return Err(self.cerr("let expects a binding vector", form));
        }
        let bindings: Vec<Value> = match items[1] {
            Value::Tuple(t) => t.items.to_vec(),
            Value::Array(a) => a.data.borrow().clone(),
            _ => return Err(self.cerr("let bindings must be a bracketed vector", form)),
        };
        if bindings.len() % 2 != 0 {
            return Err(self.cerr("let bindings must pair symbols with values", form));
        }
        let dst = self.temp(form)?;
        let mark = self.f().bindings.len();
        let mut scoped = Vec::new();
        for pair in bindings.chunks(2) {
            let sym = pair[0];
            if sym_name(sym).is_none() {
                return Err(self.cerr("let binding name must be a symbol", form));
            }
            let value = self.expr(pair[1], false)?;
            let slot = match self.f().alloc_slot() {
                Ok(s) => s,
                Err(msg) => return Err(self.cerr(msg, form)),
            };
            self.emit(enc(Opcode::Move, slot as u8, value.index as u8, 0));
            self.release(value);
            self.f().bind(sym_addr(sym), slot, false);
            scoped.push(slot);
        }
        let result = self.form_do(&items[2..], tail)?;
        self.emit(enc(Opcode::Move, dst.index as u8, result.index as u8, 0));
        self.release(result);
        self.f().bindings.truncate(mark);
        for slot in scoped {
            self.f().free_slot(slot);
        }
        Ok(dst)
    }

    fn form_while(&mut self, form: Value, items: &[Value]) -> Result<Slot, OpalError> {
        if items.len() < 2 {
            return Err(self.cerr("while expects a condition", form));
        }
        let start = self.here();
        let cond = self.expr(items[1], false)?;
        let jump_body = self.placeholder(Opcode::JumpIf, cond.index as u8);
        self.release(cond);
        let jump_end = self.placeholder(Opcode::Jump, 0);
        self.patch_to_here(jump_body, form)?;
        for body_form in &items[2..] {
            let slot = self.expr(*body_form, false)?;
            self.release(slot);
        }
        let back = start as i64 - self.here() as i64;
        self.emit(enc_abc(Opcode::Jump, back as i32));
        self.patch_to_here(jump_end, form)?;
        let dst = self.temp(form)?;
        self.emit(enc(Opcode::Nil, dst.index as u8, 0, 0));
        Ok(dst)
    }

    fn form_not(&mut self, form: Value, items: &[Value]) -> Result<Slot, OpalError> {
        self.expect_arity(form, items, 2)?;
        let value = self.expr(items[1], false)?;
        let dst = self.temp(form)?;
        self.emit(enc(Opcode::True, dst.index as u8, 0, 0));
        self.emit(enc_bc(Opcode::JumpIf, value.index as u8, 2));
        self.emit(enc_abc(Opcode::Jump, 2));
        self.emit(enc(Opcode::False, dst.index as u8, 0, 0));
        self.release(value);
        Ok(dst)
    }

    fn form_and_or(&mut self, form: Value, items: &[Value], is_and: bool) -> Result<Slot, OpalError> {
        let dst = self.temp(form)?;
        if items.len() == 1 {
            let a = dst.index as u8;
            self.emit(if is_and {
                enc(Opcode::True, a, 0, 0)
            } else {
                enc(Opcode::Nil, a, 0, 0)
            });
            return Ok(dst);
        }
        let mut ends = Vec::new();
        let last = items.len() - 1;
        for (i, arg) in items[1..].iter().enumerate() {
            let value = self.expr(*arg, false)?;
            self.emit(enc(Opcode::Move, dst.index as u8, value.index as u8, 0));
            self.release(value);
            if i + 1 < last {
                if is_and {
                    // Truthy: keep evaluating; falsy: short-circuit out.
                    self.emit(enc_bc(Opcode::JumpIf, dst.index as u8, 2));
                    ends.push(self.placeholder(Opcode::Jump, 0));
                } else {
                    // Truthy: short-circuit out.
                    ends.push(self.placeholder(Opcode::JumpIf, dst.index as u8));
                }
            }
        }
        for at in ends {
            self.patch_to_here(at, form)?;
        }
        Ok(dst)
    }

    fn form_try(&mut self, form: Value, items: &[Value]) -> Result<Slot, OpalError> {
        self.expect_arity(form, items, 3)?;
        let handler = self.expr(items[2], false)?;
        let thunk = self.compile_function(form, &[], None, &items[1..2])?;
        let cidx = self.constant(Value::FuncDef(thunk), form)?;
        let fslot = self.temp(form)?;
        self.emit(enc_bc(Opcode::Closure, fslot.index as u8, cidx));
        let dst = self.temp(form)?;
        self.emit(enc(
            Opcode::Call,
            dst.index as u8,
            fslot.index as u8,
            handler.index as u8,
        ));
        self.release(fslot);
        self.release(handler);
        Ok(dst)
    }

    fn form_defmacro(&mut self, form: Value, items: &[Value]) -> Result<Slot, OpalError> {
        if self.fns.len() != 1 {
            return Err(self.cerr("defmacro is only allowed at the top level", form));
        }
        self.expect_arity(form, items, 3)?;
        let name = items[1];
        if sym_name(name).is_none() {
            return Err(self.cerr("macro name must be a symbol", form));
        }
        let thunk = compile(self.vm, items[2])?;
        let macro_fn = self
            .vm
            .call_value(Value::Function(thunk), &[])
            .map_err(|e| {
                self.cerr(
                    format!("macro definition failed: {}", ops::display(e)),
                    form,
                )
            })?;
        if !matches!(macro_fn, Value::Function(_) | Value::CFunction(_)) {
            return Err(self.cerr("macro definition must produce a function", form));
        }
        self.vm.macros.put(name, macro_fn);
        self.load_value(Value::Nil, form)
    }

    fn form_transfer(&mut self, form: Value, items: &[Value]) -> Result<Slot, OpalError> {
        if items.len() != 2 && items.len() != 3 {
            return Err(self.cerr("transfer expects a strand and an optional value", form));
        }
        let strand = self.expr(items[1], false)?;
        let value = if items.len() == 3 {
            self.expr(items[2], false)?
        } else {
            self.load_value(Value::Nil, form)?
        };
        let dst = self.temp(form)?;
        self.emit(enc(
            Opcode::Transfer,
            dst.index as u8,
            strand.index as u8,
            value.index as u8,
        ));
        self.release(value);
        self.release(strand);
        Ok(dst)
    }

    fn form_fn(&mut self, form: Value, items: &[Value]) -> Result<Slot, OpalError> {
        let mut idx = 1;
        let name = match items.get(idx) {
            Some(v) if sym_name(*v).is_some() => {
                idx += 1;
                Some(*v)
            }
            _ => None,
        };
        let params = match items.get(idx) {
            Some(Value::Tuple(t)) => t.items.to_vec(),
            Some(Value::Array(a)) => a.data.borrow().clone(),
            _ => return Err(self.cerr("fn expects a parameter vector", form)),
        };
        idx += 1;
        // A named fn binds its own slot in the enclosing scope before the
        // body compiles, so self-references resolve as an upvalue.
        let self_slot = match name {
            Some(n) => {
                let slot = match self.f().alloc_slot() {
                    Ok(s) => s,
                    Err(msg) => return Err(self.cerr(msg, form)),
                };
                self.f().bind(sym_addr(n), slot, false);
                Some(slot)
            }
            None => None,
        };
        let def = self.compile_function(form, &params, name, &items[idx..])?;
        let cidx = self.constant(Value::FuncDef(def), form)?;
        let dst = match self_slot {
            Some(slot) => Slot {
                index: slot,
                temp: false,
            },
            None => self.temp(form)?,
        };
        self.emit(enc_bc(Opcode::Closure, dst.index as u8, cidx));
        Ok(dst)
    }

    /// Compile a nested function body into its own FuncDef.
    fn compile_function(
        &mut self,
        form: Value,
        params: &[Value],
        _name: Option<Value>,
        body: &[Value],
    ) -> Result<Gc<FuncDef>, OpalError> {
        let mut fixed = Vec::new();
        let mut rest: Option<Value> = None;
        let mut iter = params.iter().copied().peekable();
        while let Some(p) = iter.next() {
            match sym_name(p) {
                None => return Err(self.cerr("parameters must be symbols", form)),
                Some(n) if n == b"&" => {
                    let r = iter
                        .next()
                        .ok_or_else(|| self.cerr("& must be followed by a rest parameter", form))?;
                    if sym_name(r).is_none() || iter.peek().is_some() {
                        return Err(self.cerr("& takes exactly one trailing symbol", form));
                    }
                    rest = Some(r);
                }
                Some(_) => fixed.push(p),
            }
        }
        let arity = fixed.len() as u32;
        self.fns.push(FnState::new(arity, rest.is_some()));
        for (i, p) in fixed.iter().enumerate() {
            self.f().bind(sym_addr(*p), i as u32, true);
        }
        if let Some(r) = rest {
            self.f().bind(sym_addr(r), arity, true);
        }
        let result = self.form_do(body, true)?;
        self.emit(enc(Opcode::Return, result.index as u8, 0, 0));
        let state = self.fns.pop().expect("nested function state");
        Ok(finish(self.vm, state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compile_scalar() {
        let vm = Vm::new();
        let f = compile(&vm, Value::Int(41)).unwrap();
        assert_eq!(vm.run(f).unwrap(), Value::Int(41));
    }

    #[test]
    fn test_unknown_symbol_is_a_compile_error() {
        let vm = Vm::new();
        let form = vm.symbol(b"no-such-binding");
        let err = compile(&vm, form).unwrap_err();
        assert_eq!(err.status(), opal_core::error::Status::Compile);
        assert!(err.message().contains("unknown symbol"));
    }

    #[test]
    fn test_empty_call_is_a_compile_error() {
        let vm = Vm::new();
        let form = vm.tuple(Vec::new());
        assert!(compile(&vm, form).is_err());
    }

    #[test]
    fn test_malformed_special_form_reports_offender() {
        let vm = Vm::new();
        let form = vm.tuple(vec![vm.symbol(b"def"), Value::Int(3), Value::Int(4)]);
        let err = compile(&vm, form).unwrap_err();
        match err {
            OpalError::Compile { form: Some(f), .. } => assert!(f.contains("def")),
            other => panic!("expected compile error with form, got {:?}", other),
        }
    }
}
