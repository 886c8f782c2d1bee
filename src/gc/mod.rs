// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! The tracing mark-and-sweep allocator.
//!
//! Every heap-resident object (strings, symbols, buffers, arrays, dicts,
//! function definitions, captured environments, closures, threads) lives in
//! one flat slab owned by a [`Heap`]. A `GcRef` is a slot index into that
//! slab rather than a raw pointer - the idiomatic-Rust way to express an
//! intrusive, traceable block list without `unsafe` pointer chasing. Each
//! slot carries a single color bit that is flipped, not reset, between
//! cycles, exactly like the block-list-with-color-bit design this module is
//! modeled on.

use core::fmt;

use crate::container::{Array, ByteBuffer, Dict};
use crate::value::Value;

/// An index into the GC slab. Cheap, `Copy`, and opaque - callers never see
/// the slab layout, only the object a `GcRef` resolves to.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct GcRef(u32);

impl fmt::Debug for GcRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A host-provided callback reachable through `Value::Native`. Receives the
/// call arguments and the heap (so it can allocate); raises through the
/// error mechanism by returning `Err` with the value to deliver to a `try`
/// handler (or to the runtime's top-level failure path if none is active).
pub type NativeFn = fn(&mut Heap, &[Value]) -> Result<Value, Value>;

/// An immutable compiled function template.
#[derive(Clone, Debug)]
pub struct FuncDefObj {
    pub arity: u8,
    pub variadic: bool,
    pub num_locals: u16,
    pub bytecode: Vec<u16>,
    pub literals: Vec<Value>,
}

/// Captured-environment record. While the owning frame is live, the values
/// it captured are read straight off the owning thread's stack; once that
/// frame returns, the values are snapshotted here and `thread` is cleared.
#[derive(Clone, Debug)]
pub enum EnvObj {
    Live { thread: GcRef, stack_offset: u32 },
    Detached { values: Vec<Value> },
}

/// A closure: a function template, its captured environment, and the
/// enclosing closure (for multi-level up-value resolution).
#[derive(Clone, Debug)]
pub struct FuncObj {
    pub def: GcRef,
    pub env: Option<GcRef>,
    pub parent: Option<GcRef>,
}

/// One activation record on a thread's call stack.
#[derive(Clone, Copy, Debug)]
pub struct Frame {
    pub callee: GcRef,
    pub base: u32,
    pub size: u32,
    pub ret_reg: u8,
    pub ret_pc: u32,
    pub env: Option<GcRef>,
    pub error_jump: Option<u32>,
    pub error_slot: u8,
}

/// Execution status of a thread value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreadStatus {
    Pending,
    Alive,
    Dead,
}

/// A suspended (or currently running) call stack.
#[derive(Clone, Debug)]
pub struct ThreadObj {
    pub status: ThreadStatus,
    pub registers: Vec<Value>,
    pub frames: Vec<Frame>,
}

impl ThreadObj {
    #[must_use]
    pub fn new() -> Self {
        Self {
            status: ThreadStatus::Pending,
            registers: Vec::new(),
            frames: Vec::new(),
        }
    }
}

impl Default for ThreadObj {
    fn default() -> Self {
        Self::new()
    }
}

/// A heap-resident string or symbol. The two `Value` tags share this layout;
/// only the tag on the `Value` that points here distinguishes them.
#[derive(Clone, Debug)]
pub struct HeapString {
    pub bytes: Vec<u8>,
    /// Cached djb2 hash. `0` means "not yet computed".
    hash: u32,
}

impl HeapString {
    #[must_use]
    pub fn new(s: &str) -> Self {
        Self {
            bytes: s.as_bytes().to_vec(),
            hash: 0,
        }
    }

    pub fn hash(&mut self) -> u32 {
        if self.hash == 0 {
            self.hash = Value::djb2(&self.bytes).max(1);
        }
        self.hash
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        core::str::from_utf8(&self.bytes).unwrap_or("")
    }
}

/// Any object living in the GC slab.
#[derive(Clone, Debug)]
pub enum HeapObject {
    Str(HeapString),
    Buffer(ByteBuffer),
    Array(Array),
    Dict(Dict),
    FuncDef(FuncDefObj),
    Env(EnvObj),
    Func(FuncObj),
    Thread(ThreadObj),
}

struct Slot {
    /// `true` once this slot has been marked reachable in the current cycle.
    color: bool,
    object: HeapObject,
}

/// The tracing allocator and collector.
///
/// `maybe_collect` is the only entry point the VM needs to call (once per
/// opcode, per the interpreter's GC-polling rule); `alloc_*` helpers are used
/// by the compiler, VM and containers whenever a new heap object is needed.
pub struct Heap {
    slab: Vec<Option<Slot>>,
    free_list: Vec<u32>,
    /// The color value that means "reachable in the current cycle". Flipped
    /// (not reset) at the end of every collection.
    current_black: bool,
    bytes_allocated: usize,
    /// Bytes allocated since the last collection; compared against
    /// `memory_interval` to decide whether to run a cycle.
    since_collect: usize,
    memory_interval: usize,
    /// Incremented while a section of code (typically a native function)
    /// must not be interrupted by a collection; decremented on exit. A
    /// collection is skipped entirely while this is nonzero.
    lock: u32,
    pub cycles_run: u64,
    /// Host callbacks registered via `register_native`, indexed by
    /// `Value::Native`'s id. Not heap-managed: function pointers carry no
    /// `GcRef`s of their own and are never swept.
    natives: Vec<NativeFn>,
}

impl Heap {
    #[must_use]
    pub fn new(memory_interval: usize) -> Self {
        Self {
            slab: Vec::new(),
            free_list: Vec::new(),
            current_black: true,
            bytes_allocated: 0,
            since_collect: 0,
            memory_interval,
            lock: 0,
            cycles_run: 0,
            natives: Vec::new(),
        }
    }

    /// Register a host callback, returning the `Value::Native` that calls it.
    /// Meant to be used while building a `RootEnv` before compilation, so
    /// `fn`/call sites can bind to it like any other value.
    pub fn register_native(&mut self, f: NativeFn) -> Value {
        let id = u16::try_from(self.natives.len()).unwrap_or_else(|_| {
            tracing::error!(count = self.natives.len(), "native function table exceeds u16 index space");
            panic!("native function table exceeds u16 index space")
        });
        self.natives.push(f);
        Value::Native(id)
    }

    pub(crate) fn native(&self, id: u16) -> Option<NativeFn> {
        self.natives.get(id as usize).copied()
    }

    /// Approximate size charged against `memory_interval` for an object.
    fn charge(&mut self, object: &HeapObject) {
        let size = match object {
            HeapObject::Str(s) => 16 + s.bytes.len(),
            HeapObject::Buffer(b) => 16 + b.len(),
            HeapObject::Array(a) => 16 + a.len() * core::mem::size_of::<Value>(),
            HeapObject::Dict(_) => 64,
            HeapObject::FuncDef(f) => 32 + f.bytecode.len() * 2 + f.literals.len() * 16,
            HeapObject::Env(_) | HeapObject::Func(_) => 32,
            HeapObject::Thread(t) => 32 + t.registers.len() * 16,
        };
        self.bytes_allocated += size;
        self.since_collect += size;
    }

    fn insert(&mut self, object: HeapObject) -> GcRef {
        self.charge(&object);
        // Freshly allocated blocks start "not black" so the next mark phase
        // must prove them reachable before they survive a sweep - unless a
        // cycle is already in flight and they were born from something a
        // prior marked object just allocated, in which case we still mark
        // them black immediately so they are not swept out from under the
        // allocation that produced them.
        let slot = Slot {
            color: !self.current_black,
            object,
        };
        if let Some(idx) = self.free_list.pop() {
            self.slab[idx as usize] = Some(slot);
            GcRef(idx)
        } else {
            self.slab.push(Some(slot));
            GcRef(u32::try_from(self.slab.len() - 1).unwrap_or_else(|_| {
                tracing::error!(slab_len = self.slab.len(), "heap slab exceeds u32 index space");
                panic!("heap slab exceeds u32 index space")
            }))
        }
    }

    pub fn alloc_string(&mut self, s: &str) -> GcRef {
        self.insert(HeapObject::Str(HeapString::new(s)))
    }

    pub fn alloc_symbol(&mut self, s: &str) -> GcRef {
        self.alloc_string(s)
    }

    pub fn alloc_buffer(&mut self) -> GcRef {
        self.insert(HeapObject::Buffer(ByteBuffer::new()))
    }

    pub fn alloc_array(&mut self, items: Vec<Value>) -> GcRef {
        let mut a = Array::new();
        for v in items {
            a.push(v);
        }
        self.insert(HeapObject::Array(a))
    }

    pub fn alloc_dict(&mut self) -> GcRef {
        self.insert(HeapObject::Dict(Dict::new()))
    }

    pub fn alloc_funcdef(&mut self, def: FuncDefObj) -> GcRef {
        self.insert(HeapObject::FuncDef(def))
    }

    pub fn alloc_env(&mut self, env: EnvObj) -> GcRef {
        self.insert(HeapObject::Env(env))
    }

    pub fn alloc_func(&mut self, func: FuncObj) -> GcRef {
        self.insert(HeapObject::Func(func))
    }

    pub fn alloc_thread(&mut self, thread: ThreadObj) -> GcRef {
        self.insert(HeapObject::Thread(thread))
    }

    pub fn get(&self, r: GcRef) -> &HeapObject {
        self.slab[r.0 as usize].as_ref().map(|s| &s.object).unwrap_or_else(|| {
            tracing::error!(gcref = ?r, "dangling GcRef: slot was swept while still referenced");
            panic!("dangling GcRef: slot was swept while still referenced")
        })
    }

    pub fn get_mut(&mut self, r: GcRef) -> &mut HeapObject {
        self.slab[r.0 as usize].as_mut().map(|s| &mut s.object).unwrap_or_else(|| {
            tracing::error!(gcref = ?r, "dangling GcRef: slot was swept while still referenced");
            panic!("dangling GcRef: slot was swept while still referenced")
        })
    }

    /// Acquire the GC lock, deferring any collection until released. Used
    /// around native-function bodies that allocate but cannot tolerate a
    /// collection interleaved with their own bookkeeping.
    pub fn lock(&mut self) {
        self.lock += 1;
    }

    pub fn unlock(&mut self) {
        self.lock = self.lock.saturating_sub(1);
    }

    #[must_use]
    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    /// Hash a value for use as a dictionary key. Scalars hash by value;
    /// strings and symbols hash by content (and cache the result); every
    /// other heap variant hashes by its `GcRef` identity.
    pub fn hash_value(&mut self, v: Value) -> u32 {
        match v {
            Value::Nil => 0,
            Value::Bool(b) => u32::from(b) + 1,
            Value::Number(n) => Value::djb2(&n.to_bits().to_le_bytes()),
            Value::String(r) | Value::Symbol(r) => {
                let HeapObject::Str(s) = self.get_mut(r) else {
                    unreachable!()
                };
                s.hash()
            }
            Value::Buffer(r)
            | Value::Array(r)
            | Value::Dict(r)
            | Value::Func(r)
            | Value::FuncDef(r)
            | Value::Env(r)
            | Value::Thread(r) => r.0,
            Value::Native(id) => u32::from(id),
        }
    }

    /// Equality for dictionary lookups and the `EQ` opcode: scalars by
    /// value, strings by content, everything else by `GcRef` identity.
    #[must_use]
    pub fn values_equal(&self, a: Value, b: Value) -> bool {
        match (a, b) {
            (Value::Nil, Value::Nil) => true,
            (Value::Bool(x), Value::Bool(y)) => x == y,
            (Value::Number(x), Value::Number(y)) => x == y,
            (Value::String(ra) | Value::Symbol(ra), Value::String(rb) | Value::Symbol(rb)) => {
                if ra == rb {
                    return true;
                }
                let HeapObject::Str(sa) = self.get(ra) else {
                    return false;
                };
                let HeapObject::Str(sb) = self.get(rb) else {
                    return false;
                };
                sa.bytes == sb.bytes
            }
            (Value::Native(x), Value::Native(y)) => x == y,
            (Value::Buffer(ra), Value::Buffer(rb))
            | (Value::Array(ra), Value::Array(rb))
            | (Value::Dict(ra), Value::Dict(rb))
            | (Value::Func(ra), Value::Func(rb))
            | (Value::FuncDef(ra), Value::FuncDef(rb))
            | (Value::Env(ra), Value::Env(rb))
            | (Value::Thread(ra), Value::Thread(rb)) => ra == rb,
            _ => false,
        }
    }

    /// Run a collection if `memory_interval` has been exceeded and the lock
    /// is free. Called once per opcode dispatched by the VM.
    pub fn maybe_collect(&mut self, roots: &[Value]) {
        if self.lock > 0 || self.since_collect < self.memory_interval {
            return;
        }
        self.collect(roots);
    }

    /// Force a collection regardless of `memory_interval`. Exposed for tests
    /// and for the `memory_interval = 0` "stress" configuration.
    pub fn collect(&mut self, roots: &[Value]) {
        tracing::debug!(
            objects = self.slab.iter().filter(|s| s.is_some()).count(),
            bytes = self.bytes_allocated,
            cycle = self.cycles_run,
            "gc: starting cycle"
        );
        for root in roots {
            self.mark_value(*root);
        }
        let freed = self.sweep();
        self.current_black = !self.current_black;
        self.since_collect = 0;
        self.cycles_run += 1;
        tracing::debug!(freed, "gc: cycle complete");
    }

    fn mark_slot(&mut self, r: GcRef) -> bool {
        if self.slab[r.0 as usize].is_none() {
            tracing::error!(gcref = ?r, "dangling GcRef during mark");
            panic!("dangling GcRef during mark");
        }
        let slot = self.slab[r.0 as usize].as_mut().expect("checked above");
        if slot.color == self.current_black {
            return false; // already marked this cycle
        }
        slot.color = self.current_black;
        true
    }

    /// Type-directed mark: recurse into every `GcRef` reachable from `v`.
    pub fn mark_value(&mut self, v: Value) {
        match v {
            Value::Nil | Value::Bool(_) | Value::Number(_) | Value::Native(_) => {}
            Value::String(r) | Value::Symbol(r) | Value::Buffer(r) => {
                self.mark_slot(r);
            }
            Value::Array(r) => {
                if self.mark_slot(r) {
                    let HeapObject::Array(a) = self.get(r) else {
                        unreachable!()
                    };
                    let items: Vec<Value> = a.iter().copied().collect();
                    for item in items {
                        self.mark_value(item);
                    }
                }
            }
            Value::Dict(r) => {
                if self.mark_slot(r) {
                    let HeapObject::Dict(d) = self.get(r) else {
                        unreachable!()
                    };
                    let pairs: Vec<(Value, Value)> = d.iter().collect();
                    for (k, val) in pairs {
                        self.mark_value(k);
                        self.mark_value(val);
                    }
                }
            }
            Value::FuncDef(r) => {
                if self.mark_slot(r) {
                    let HeapObject::FuncDef(def) = self.get(r) else {
                        unreachable!()
                    };
                    let literals = def.literals.clone();
                    for lit in literals {
                        self.mark_value(lit);
                    }
                }
            }
            Value::Env(r) => self.mark_env(r),
            Value::Func(r) => {
                if self.mark_slot(r) {
                    let HeapObject::Func(func) = self.get(r) else {
                        unreachable!()
                    };
                    let (def, env, parent) = (func.def, func.env, func.parent);
                    self.mark_value(Value::FuncDef(def));
                    if let Some(env) = env {
                        self.mark_env(env);
                    }
                    if let Some(parent) = parent {
                        self.mark_value(Value::Func(parent));
                    }
                }
            }
            Value::Thread(r) => {
                if self.mark_slot(r) {
                    let HeapObject::Thread(t) = self.get(r) else {
                        unreachable!()
                    };
                    let registers = t.registers.clone();
                    let frames = t.frames.clone();
                    for reg in registers {
                        self.mark_value(reg);
                    }
                    for frame in frames {
                        self.mark_value(Value::Func(frame.callee));
                        if let Some(env) = frame.env {
                            self.mark_env(env);
                        }
                    }
                }
            }
        }
    }

    fn mark_env(&mut self, r: GcRef) {
        if !self.mark_slot(r) {
            return;
        }
        let HeapObject::Env(env) = self.get(r) else {
            unreachable!()
        };
        match env {
            EnvObj::Live { thread, .. } => {
                let thread = *thread;
                self.mark_value(Value::Thread(thread));
            }
            EnvObj::Detached { values } => {
                let values = values.clone();
                for v in values {
                    self.mark_value(v);
                }
            }
        }
    }

    /// Free every slot not marked black this cycle. Returns the number of
    /// objects freed.
    fn sweep(&mut self) -> usize {
        let mut freed = 0;
        for (idx, slot) in self.slab.iter_mut().enumerate() {
            let dead = matches!(slot, Some(s) if s.color != self.current_black);
            if dead {
                *slot = None;
                let Ok(idx) = u32::try_from(idx) else {
                    tracing::error!(idx, "slab index exceeds u32 range during sweep");
                    panic!("slab index exceeds u32 range during sweep");
                };
                self.free_list.push(idx);
                freed += 1;
            }
        }
        freed
    }
}

#[cfg(test)]
mod heap_test {
    use super::*;

    #[test]
    fn unreachable_string_is_collected() {
        let mut heap = Heap::new(0);
        let r = heap.alloc_string("transient");
        let _ = r;
        heap.collect(&[]);
        // slot is dangling now; nothing else in the test touches it.
    }

    #[test]
    fn reachable_array_survives_and_is_marked_deep() {
        let mut heap = Heap::new(0);
        let inner = heap.alloc_string("kept");
        let arr = heap.alloc_array(vec![Value::String(inner)]);
        heap.collect(&[Value::Array(arr)]);
        let HeapObject::Array(a) = heap.get(arr) else {
            panic!("expected array")
        };
        assert_eq!(a.len(), 1);
        // would panic if `inner` had been swept.
        let HeapObject::Str(s) = heap.get(inner) else {
            panic!("expected string")
        };
        assert_eq!(s.as_str(), "kept");
    }

    #[test]
    fn lock_defers_collection() {
        let mut heap = Heap::new(0);
        heap.lock();
        let r = heap.alloc_string("locked");
        heap.maybe_collect(&[]);
        // still alive: collection was skipped while locked.
        let HeapObject::Str(s) = heap.get(r) else {
            panic!("expected string")
        };
        assert_eq!(s.as_str(), "locked");
        heap.unlock();
    }
}
