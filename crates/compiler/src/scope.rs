//! Per-function compilation state: slot allocation, lexical bindings,
//! the literal pool and upvalue capture threading.
//!
//! One [`FnState`] exists per function being compiled; the compiler keeps
//! them on a stack that mirrors lexical nesting. Resolving a symbol walks
//! that stack, and a hit in an enclosing function threads a capture entry
//! through every function in between, so each FuncDef ends up with the
//! parent-relative `(env, slot)` pairs the `closure` instruction resolves
//! at runtime.

use std::collections::HashMap;

use opal_core::value::Value;

/// A lexical binding inside one function.
pub struct Binding {
    /// Identity of the interned symbol.
    pub sym: usize,
    pub slot: u32,
    /// `var` bindings may be assigned; `def` bindings may not.
    pub mutable: bool,
}

/// How a symbol reference resolves.
pub enum Resolution {
    Local { slot: u32, mutable: bool },
    /// `env` is the E operand: 1-based index into the function's captures.
    Upvalue { env: u32, slot: u32, mutable: bool },
    Unbound,
}

pub struct FnState {
    pub arity: u32,
    pub vararg: bool,
    pub bindings: Vec<Binding>,
    next_slot: u32,
    max_slot: u32,
    free: Vec<u32>,
    pub consts: Vec<Value>,
    const_map: HashMap<usize, u16>,
    pub code: Vec<u32>,
    /// Parent-relative capture entries (0 = parent frame env).
    pub envs: Vec<u32>,
    /// A child captured this function's frame.
    pub needs_env: bool,
    /// This function captures something and needs its parent at closure
    /// time.
    pub needs_parent: bool,
}

impl FnState {
    pub fn new(arity: u32, vararg: bool) -> FnState {
        let reserved = arity + if vararg { 1 } else { 0 };
        FnState {
            arity,
            vararg,
            bindings: Vec::new(),
            next_slot: reserved,
            max_slot: reserved,
            free: Vec::new(),
            consts: Vec::new(),
            const_map: HashMap::new(),
            code: Vec::new(),
            envs: Vec::new(),
            needs_env: false,
            needs_parent: false,
        }
    }

    /// Total slot count a frame for this function needs.
    pub fn locals(&self) -> u32 {
        self.max_slot
    }

    pub fn alloc_slot(&mut self) -> Result<u32, String> {
        if let Some(slot) = self.free.pop() {
            return Ok(slot);
        }
        let slot = self.next_slot;
        // 0xFF is the no-handler sentinel in call instructions, so the last
        // representable slot index stays unused.
        if slot >= u8::MAX as u32 {
            return Err("function needs too many slots".to_string());
        }
        self.next_slot += 1;
        self.max_slot = self.max_slot.max(self.next_slot);
        Ok(slot)
    }

    pub fn free_slot(&mut self, slot: u32) {
        self.free.push(slot);
    }

    pub fn bind(&mut self, sym: usize, slot: u32, mutable: bool) {
        self.bindings.push(Binding { sym, slot, mutable });
    }

    /// Innermost binding for a symbol, honoring shadowing.
    pub fn lookup(&self, sym: usize) -> Option<(u32, bool)> {
        self.bindings
            .iter()
            .rev()
            .find(|b| b.sym == sym)
            .map(|b| (b.slot, b.mutable))
    }

    /// Pool a literal, deduplicating by identity (interned immutables make
    /// that structural for free).
    pub fn constant(&mut self, v: Value) -> Result<u16, String> {
        let key = v.heap_addr();
        if key != 0 {
            if let Some(&idx) = self.const_map.get(&key) {
                return Ok(idx);
            }
        }
        if self.consts.len() > u16::MAX as usize {
            return Err("too many literals".to_string());
        }
        let idx = self.consts.len() as u16;
        self.consts.push(v);
        if key != 0 {
            self.const_map.insert(key, idx);
        }
        Ok(idx)
    }

    /// Find or add a parent-relative capture entry; returns its index.
    fn add_capture(&mut self, entry: u32) -> u32 {
        if let Some(idx) = self.envs.iter().position(|&e| e == entry) {
            return idx as u32;
        }
        self.envs.push(entry);
        (self.envs.len() - 1) as u32
    }
}

/// Resolve a symbol against the function stack, threading captures through
/// every function between the definition site and the use site.
pub fn resolve(fns: &mut [FnState], sym: usize) -> Resolution {
    let top = fns.len() - 1;
    if let Some((slot, mutable)) = fns[top].lookup(sym) {
        return Resolution::Local { slot, mutable };
    }
    let mut found = None;
    for i in (0..top).rev() {
        if let Some((slot, mutable)) = fns[i].lookup(sym) {
            found = Some((i, slot, mutable));
            break;
        }
    }
    let (i, slot, mutable) = match found {
        Some(hit) => hit,
        None => return Resolution::Unbound,
    };
    fns[i].needs_env = true;
    let mut entry = 0u32;
    for state in fns.iter_mut().take(top + 1).skip(i + 1) {
        let capture = state.add_capture(entry);
        state.needs_parent = true;
        entry = capture + 1;
    }
    Resolution::Upvalue {
        env: entry,
        slot,
        mutable,
    }
}

/// Read-only check used to decide whether a head symbol can be a macro use.
pub fn lexically_bound(fns: &[FnState], sym: usize) -> bool {
    fns.iter().any(|f| f.lookup(sym).is_some())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_reuse_through_free_list() {
        let mut f = FnState::new(0, false);
        let a = f.alloc_slot().unwrap();
        let b = f.alloc_slot().unwrap();
        assert_ne!(a, b);
        f.free_slot(a);
        assert_eq!(f.alloc_slot().unwrap(), a);
        assert_eq!(f.locals(), 2);
    }

    #[test]
    fn test_vararg_reserves_rest_slot() {
        let f = FnState::new(2, true);
        assert_eq!(f.locals(), 3);
    }

    #[test]
    fn test_shadowing_resolves_to_innermost() {
        let mut f = FnState::new(0, false);
        f.bind(7, 0, false);
        f.bind(7, 1, true);
        assert_eq!(f.lookup(7), Some((1, true)));
    }

    #[test]
    fn test_capture_threading_through_two_levels() {
        let mut fns = vec![FnState::new(0, false), FnState::new(0, false), FnState::new(0, false)];
        fns[0].bind(42, 3, false);
        match resolve(&mut fns, 42) {
            Resolution::Upvalue { env, slot, .. } => {
                assert_eq!(slot, 3);
                assert_eq!(env, 1);
            }
            _ => panic!("expected upvalue"),
        }
        assert!(fns[0].needs_env);
        // middle function captures the outer frame env...
        assert_eq!(fns[1].envs, vec![0]);
        assert!(fns[1].needs_parent);
        // ...and the inner function captures the middle one's capture 0.
        assert_eq!(fns[2].envs, vec![1]);
        assert!(fns[2].needs_parent);
        // Resolving again adds nothing.
        resolve(&mut fns, 42);
        assert_eq!(fns[1].envs.len(), 1);
        assert_eq!(fns[2].envs.len(), 1);
    }
}
