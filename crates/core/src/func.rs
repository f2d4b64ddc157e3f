//! Functions, function definitions and captured environments.
//!
//! A [`FuncDef`] is the static product of compilation: bytecode, literal
//! pool, slot counts and capture metadata. It is shared by every closure
//! built over it and references enclosing environments only as
//! parent-relative indices, never as pointers, so defs stay serialisable
//! and reusable. A [`Function`] pairs a def with the concrete
//! [`FuncEnv`]s resolved at `closure` time.
//!
//! A FuncEnv is an activation: while its frame is live it is a view into
//! the owning strand's stack, and when the frame exits it is detached —
//! the slots are copied out to heap storage the env owns. Detachment is
//! idempotent and the central invariant that lets the collector and the
//! upvalue instructions treat both states uniformly.

use std::cell::{Cell, RefCell};

use bitflags::bitflags;

use crate::gc::Gc;
use crate::strand::Strand;
use crate::value::Value;

bitflags! {
    /// FuncDef flag set.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DefFlags: u32 {
        /// Surplus arguments are packed into a tuple at slot `arity`.
        const VARARG = 1 << 0;
        /// Capture resolution needs the enclosing function at closure time.
        const NEEDS_PARENT = 1 << 1;
        /// The function's own frame environment must be materialised so
        /// inner closures can capture it.
        const NEEDS_ENV = 1 << 2;
    }
}

/// Capture entry: where a child closure finds one of its environments,
/// relative to the function executing the `closure` instruction.
/// `0` is that function's own frame environment; `k > 0` is its captured
/// environment `k - 1`.
pub type EnvRef = u32;

/// Static code and metadata for one function body.
pub struct FuncDef {
    /// Fixed parameter count, excluding the vararg tail.
    pub arity: u32,
    /// Total slot count of a frame running this def.
    pub locals: u32,
    pub flags: DefFlags,
    pub literals: Box<[Value]>,
    /// 32-bit instruction words.
    pub bytecode: Box<[u32]>,
    /// Environments to capture, parent-relative.
    pub envs: Box<[EnvRef]>,
}

impl FuncDef {
    pub fn is_vararg(&self) -> bool {
        self.flags.contains(DefFlags::VARARG)
    }
}

/// A closure: definition plus captured environments, in the order the
/// def's capture list names them.
///
/// The fields sit behind cells so the deserializer can register a closure
/// before reading its parts — closures participate in cycles through their
/// environments. Outside deserialization a function never changes after
/// construction.
pub struct Function {
    def: Cell<Gc<FuncDef>>,
    envs: RefCell<Box<[Gc<FuncEnv>]>>,
}

impl Function {
    pub fn new(def: Gc<FuncDef>, envs: Box<[Gc<FuncEnv>]>) -> Function {
        Function {
            def: Cell::new(def),
            envs: RefCell::new(envs),
        }
    }

    pub fn def(&self) -> Gc<FuncDef> {
        self.def.get()
    }

    pub fn env(&self, index: usize) -> Option<Gc<FuncEnv>> {
        self.envs.borrow().get(index).copied()
    }

    pub fn env_count(&self) -> usize {
        self.envs.borrow().len()
    }

    /// Snapshot of the captured environments.
    pub fn envs(&self) -> Vec<Gc<FuncEnv>> {
        self.envs.borrow().to_vec()
    }

    /// Deserializer backpatch; see the type-level comment.
    pub(crate) fn patch(&self, def: Gc<FuncDef>, envs: Box<[Gc<FuncEnv>]>) {
        self.def.set(def);
        *self.envs.borrow_mut() = envs;
    }
}

/// Backing state of an environment.
pub enum EnvStorage {
    /// Stack-resident: a window of `len` slots starting at `base` on the
    /// owning strand's stack.
    Live {
        strand: Gc<Strand>,
        base: usize,
        len: usize,
    },
    /// Heap-resident: the env owns its values.
    Detached(Box<[Value]>),
}

pub struct FuncEnv {
    pub storage: RefCell<EnvStorage>,
}

impl FuncEnv {
    pub fn live(strand: Gc<Strand>, base: usize, len: usize) -> FuncEnv {
        FuncEnv {
            storage: RefCell::new(EnvStorage::Live { strand, base, len }),
        }
    }

    pub fn detached(values: Box<[Value]>) -> FuncEnv {
        FuncEnv {
            storage: RefCell::new(EnvStorage::Detached(values)),
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(&*self.storage.borrow(), EnvStorage::Live { .. })
    }

    pub fn len(&self) -> usize {
        match &*self.storage.borrow() {
            EnvStorage::Live { len, .. } => *len,
            EnvStorage::Detached(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: usize) -> Option<Value> {
        match &*self.storage.borrow() {
            EnvStorage::Live { strand, base, len } => {
                if index >= *len {
                    return None;
                }
                strand.stack.borrow().get(base + index).copied()
            }
            EnvStorage::Detached(values) => values.get(index).copied(),
        }
    }

    pub fn set(&self, index: usize, value: Value) -> bool {
        match &mut *self.storage.borrow_mut() {
            EnvStorage::Live { strand, base, len } => {
                if index >= *len {
                    return false;
                }
                let mut stack = strand.stack.borrow_mut();
                match stack.get_mut(*base + index) {
                    Some(slot) => {
                        *slot = value;
                        true
                    }
                    None => false,
                }
            }
            EnvStorage::Detached(values) => match values.get_mut(index) {
                Some(slot) => {
                    *slot = value;
                    true
                }
                None => false,
            },
        }
    }

    /// Copy the frame window out to owned storage and drop the strand
    /// reference. Idempotent: a detached env stays as it is.
    pub fn detach(&self) {
        let snapshot = match &*self.storage.borrow() {
            EnvStorage::Live { strand, base, len } => {
                let stack = strand.stack.borrow();
                let end = (base + len).min(stack.len());
                let mut values = stack[*base..end].to_vec();
                values.resize(*len, Value::Nil);
                Some(values.into_boxed_slice())
            }
            EnvStorage::Detached(_) => None,
        };
        if let Some(values) = snapshot {
            *self.storage.borrow_mut() = EnvStorage::Detached(values);
        }
    }
}
