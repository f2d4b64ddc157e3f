//! Allocator and mark-and-sweep collector.
//!
//! Every heap object is a [`GcBox`]: a header followed by the payload. The
//! header links the block into a single intrusive list anchored in the
//! [`Heap`] and carries the object kind plus one colour bit. The heap holds
//! the value that currently means "reached this cycle"; sweep flips it, so
//! blocks allocated after a sweep start out not-yet-reached without being
//! touched.
//!
//! The collector is precise and non-moving. It may only run at safe points
//! (the top of the interpreter dispatch loop), where the VM guarantees that
//! every live value is reachable from a root: the current strand, the
//! module/registry/environment/macro tables, the VM return slot and the VM
//! scratch vector. Native code that re-enters the interpreter pins its
//! temporaries through [`crate::vm::Vm::protect`].

use std::cell::Cell;
use std::marker::PhantomData;
use std::ptr::NonNull;

use crate::array::Array;
use crate::buffer::Buffer;
use crate::func::{EnvStorage, FuncDef, FuncEnv, Function};
use crate::strand::Strand;
use crate::strings::Str;
use crate::structs::Struct;
use crate::table::Table;
use crate::tuple::Tuple;
use crate::userdata::Userdata;
use crate::value::{TypeTag, Value};

/// Default number of allocated bytes between collection attempts.
pub const DEFAULT_GC_INTERVAL: usize = 1 << 20;

/// Block header. `#[repr(C)]` so a `*mut GcHeader` and the `*mut GcBox<T>`
/// it fronts are interchangeable.
#[repr(C)]
pub struct GcHeader {
    next: Cell<*mut GcHeader>,
    kind: TypeTag,
    black: Cell<bool>,
}

impl GcHeader {
    pub fn kind(&self) -> TypeTag {
        self.kind
    }
}

/// A heap block: header + payload.
#[repr(C)]
pub struct GcBox<T> {
    header: GcHeader,
    data: T,
}

/// Copyable reference to a heap object.
///
/// Dereferencing is safe as long as the object is reachable from a root at
/// every safe point; the VM's calling conventions maintain that. `Gc` never
/// outlives its `Heap` in practice because every `Gc` is itself stored in
/// GC-managed structures or rooted VM fields.
pub struct Gc<T> {
    ptr: NonNull<GcBox<T>>,
    _marker: PhantomData<*const T>,
}

impl<T> Clone for Gc<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for Gc<T> {}

impl<T> PartialEq for Gc<T> {
    fn eq(&self, other: &Self) -> bool {
        self.ptr == other.ptr
    }
}
impl<T> Eq for Gc<T> {}

impl<T> std::fmt::Debug for Gc<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Gc({:p})", self.ptr.as_ptr())
    }
}

impl<T> std::ops::Deref for Gc<T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &self.ptr.as_ref().data }
    }
}

impl<T> Gc<T> {
    pub(crate) fn header(&self) -> &GcHeader {
        unsafe { &self.ptr.as_ref().header }
    }

    /// Stable address of the block, used for identity hashing.
    pub fn addr(&self) -> usize {
        self.ptr.as_ptr() as usize
    }
}

/// The allocator: an intrusive block list plus the collection trigger state.
pub struct Heap {
    head: Cell<*mut GcHeader>,
    /// Colour value that currently means "reached this cycle".
    black: Cell<bool>,
    /// Bytes allocated since the last collection.
    pending: Cell<usize>,
    interval: Cell<usize>,
    blocks: Cell<usize>,
}

impl Heap {
    pub fn new() -> Heap {
        Heap {
            head: Cell::new(std::ptr::null_mut()),
            black: Cell::new(true),
            pending: Cell::new(0),
            interval: Cell::new(DEFAULT_GC_INTERVAL),
            blocks: Cell::new(0),
        }
    }

    /// Number of bytes to allocate between collections.
    pub fn set_interval(&self, bytes: usize) {
        self.interval.set(bytes.max(1));
    }

    /// Live block count, as of the last sweep plus allocations since.
    pub fn block_count(&self) -> usize {
        self.blocks.get()
    }

    pub(crate) fn needs_collect(&self) -> bool {
        self.pending.get() >= self.interval.get()
    }

    /// Allocate a block. New blocks start with the not-yet-reached colour;
    /// callers must make them reachable before the next safe point.
    pub fn alloc<T>(&self, kind: TypeTag, data: T) -> Gc<T> {
        let boxed = Box::new(GcBox {
            header: GcHeader {
                next: Cell::new(self.head.get()),
                kind,
                black: Cell::new(!self.black.get()),
            },
            data,
        });
        let ptr = Box::into_raw(boxed);
        self.head.set(ptr.cast::<GcHeader>());
        self.pending
            .set(self.pending.get() + std::mem::size_of::<GcBox<T>>());
        self.blocks.set(self.blocks.get() + 1);
        Gc {
            ptr: unsafe { NonNull::new_unchecked(ptr) },
            _marker: PhantomData,
        }
    }

    /// Paint a header black for this cycle. Returns false when it already
    /// was, which is what stops recursion on cycles.
    fn blacken(&self, header: &GcHeader) -> bool {
        if header.black.get() == self.black.get() {
            return false;
        }
        header.black.set(self.black.get());
        true
    }

    /// Recursively blacken everything reachable from `v`.
    pub fn mark_value(&self, v: Value) {
        match v {
            Value::Nil | Value::Bool(_) | Value::Int(_) | Value::Float(_) | Value::CFunction(_) => {}
            Value::Str(s) | Value::Symbol(s) => {
                self.blacken(s.header());
            }
            Value::Buffer(b) => {
                self.blacken(b.header());
            }
            Value::Array(a) => {
                if self.blacken(a.header()) {
                    for item in a.data.borrow().iter() {
                        self.mark_value(*item);
                    }
                }
            }
            Value::Tuple(t) => {
                if self.blacken(t.header()) {
                    for item in t.items.iter() {
                        self.mark_value(*item);
                    }
                }
            }
            Value::Struct(s) => {
                if self.blacken(s.header()) {
                    for (k, val) in s.slots.iter() {
                        self.mark_value(*k);
                        self.mark_value(*val);
                    }
                }
            }
            Value::Table(t) => {
                if self.blacken(t.header()) {
                    t.mark_entries(self);
                }
            }
            Value::Strand(s) => {
                if self.blacken(s.header()) {
                    self.mark_strand(s);
                }
            }
            Value::Function(f) => {
                if self.blacken(f.header()) {
                    self.mark_value(Value::FuncDef(f.def()));
                    for env in f.envs() {
                        self.mark_value(Value::FuncEnv(env));
                    }
                }
            }
            Value::FuncDef(d) => {
                if self.blacken(d.header()) {
                    // Nested funcdefs sit in the literal pool as ordinary
                    // funcdef-tagged values and are traced here like any
                    // other literal.
                    for lit in d.literals.iter() {
                        self.mark_value(*lit);
                    }
                }
            }
            Value::FuncEnv(e) => {
                if self.blacken(e.header()) {
                    match &*e.storage.borrow() {
                        EnvStorage::Live { strand, .. } => {
                            self.mark_value(Value::Strand(*strand));
                        }
                        EnvStorage::Detached(values) => {
                            for item in values.iter() {
                                self.mark_value(*item);
                            }
                        }
                    }
                }
            }
            Value::Userdata(u) => {
                if self.blacken(u.header()) {
                    // Userdata marking is terminal: run the descriptor's
                    // callback and nothing else.
                    if let Some(mark) = u.utype.mark {
                        mark(self, &**u.data.borrow());
                    }
                }
            }
        }
    }

    /// A strand roots its whole stack: frame headers are ordinary values
    /// (callee and environment slots included), so one pass over the live
    /// prefix covers every frame. The parent link keeps suspended ancestors
    /// alive for error propagation.
    fn mark_strand(&self, s: Gc<Strand>) {
        for item in s.stack.borrow().iter() {
            self.mark_value(*item);
        }
        self.mark_value(s.ret.get());
        if let Some(parent) = s.parent.get() {
            self.mark_value(Value::Strand(parent));
        }
    }

    /// Sweep every non-reached block off the list, running type-dispatched
    /// finalisation, then flip the colour. `purge` is called with
    /// `(kind, len, hash, addr)` for each dying immutable aggregate so the
    /// intern cache can drop its entry before the memory goes away.
    pub(crate) fn sweep(&self, mut purge: impl FnMut(TypeTag, usize, u32, usize)) -> usize {
        let mut swept = 0usize;
        let mut prev: *mut GcHeader = std::ptr::null_mut();
        let mut cur = self.head.get();
        while !cur.is_null() {
            let header = unsafe { &*cur };
            let next = header.next.get();
            if header.black.get() == self.black.get() {
                prev = cur;
            } else {
                if prev.is_null() {
                    self.head.set(next);
                } else {
                    unsafe { (*prev).next.set(next) };
                }
                unsafe { free_block(cur, &mut purge) };
                swept += 1;
            }
            cur = next;
        }
        self.blocks.set(self.blocks.get() - swept);
        self.pending.set(0);
        self.black.set(!self.black.get());
        swept
    }
}

impl Default for Heap {
    fn default() -> Self {
        Heap::new()
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        // Free every remaining block; nothing can reference them once the
        // heap itself is gone.
        let mut cur = self.head.get();
        while !cur.is_null() {
            let next = unsafe { (*cur).next.get() };
            unsafe { free_block(cur, &mut |_, _, _, _| {}) };
            cur = next;
        }
        self.head.set(std::ptr::null_mut());
    }
}

/// Reclaim one unreached block. Backing storage is released by the payload's
/// `Drop`; userdata finalizers run first.
unsafe fn free_block(ptr: *mut GcHeader, purge: &mut impl FnMut(TypeTag, usize, u32, usize)) {
    let kind = unsafe { (*ptr).kind };
    let addr = ptr as usize;
    match kind {
        TypeTag::Str | TypeTag::Symbol => unsafe {
            let boxed = Box::from_raw(ptr.cast::<GcBox<Str>>());
            purge(kind, boxed.data.len(), boxed.data.hash, addr);
        },
        TypeTag::Tuple => unsafe {
            let boxed = Box::from_raw(ptr.cast::<GcBox<Tuple>>());
            purge(kind, boxed.data.items.len(), boxed.data.hash, addr);
        },
        TypeTag::Struct => unsafe {
            let boxed = Box::from_raw(ptr.cast::<GcBox<Struct>>());
            purge(kind, boxed.data.count, boxed.data.hash, addr);
        },
        TypeTag::Array => unsafe {
            drop(Box::from_raw(ptr.cast::<GcBox<Array>>()));
        },
        TypeTag::Buffer => unsafe {
            drop(Box::from_raw(ptr.cast::<GcBox<Buffer>>()));
        },
        TypeTag::Table => unsafe {
            drop(Box::from_raw(ptr.cast::<GcBox<Table>>()));
        },
        TypeTag::Strand => unsafe {
            drop(Box::from_raw(ptr.cast::<GcBox<Strand>>()));
        },
        TypeTag::Function => unsafe {
            drop(Box::from_raw(ptr.cast::<GcBox<Function>>()));
        },
        TypeTag::FuncEnv => unsafe {
            drop(Box::from_raw(ptr.cast::<GcBox<FuncEnv>>()));
        },
        TypeTag::FuncDef => unsafe {
            drop(Box::from_raw(ptr.cast::<GcBox<FuncDef>>()));
        },
        TypeTag::Userdata => unsafe {
            let boxed = Box::from_raw(ptr.cast::<GcBox<Userdata>>());
            if let Some(finalize) = boxed.data.utype.finalize {
                finalize(&mut **boxed.data.data.borrow_mut());
            }
        },
        // Scalars are never heap blocks.
        TypeTag::Nil | TypeTag::Bool | TypeTag::Int | TypeTag::Float | TypeTag::CFunction => {
            unreachable!("scalar kind on the heap block list")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_links_blocks() {
        let heap = Heap::new();
        assert_eq!(heap.block_count(), 0);
        let a = heap.alloc(TypeTag::Array, Array::new());
        let b = heap.alloc(TypeTag::Array, Array::new());
        assert_eq!(heap.block_count(), 2);
        assert_ne!(a.addr(), b.addr());
    }

    #[test]
    fn test_unreached_blocks_are_swept() {
        let heap = Heap::new();
        let keep = heap.alloc(TypeTag::Array, Array::new());
        let _lose = heap.alloc(TypeTag::Array, Array::new());
        heap.mark_value(Value::Array(keep));
        let swept = heap.sweep(|_, _, _, _| {});
        assert_eq!(swept, 1);
        assert_eq!(heap.block_count(), 1);
    }

    #[test]
    fn test_colour_flip_survives_cycles() {
        let heap = Heap::new();
        let root = heap.alloc(TypeTag::Array, Array::new());
        // Self-referencing array: marking must terminate.
        root.data.borrow_mut().push(Value::Array(root));
        for _ in 0..3 {
            heap.mark_value(Value::Array(root));
            let swept = heap.sweep(|_, _, _, _| {});
            assert_eq!(swept, 0);
        }
        assert_eq!(heap.block_count(), 1);
    }

    #[test]
    fn test_purge_reports_immutables() {
        let heap = Heap::new();
        let _dead = heap.alloc(
            TypeTag::Str,
            Str::new(b"doomed".to_vec().into_boxed_slice()),
        );
        let mut purged = Vec::new();
        heap.sweep(|kind, len, _, _| purged.push((kind, len)));
        assert_eq!(purged, vec![(TypeTag::Str, 6)]);
    }
}
