// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! The register-based bytecode interpreter.
//!
//! `Vm` is a stateless dispatch loop: all mutable state lives in the
//! [`crate::gc::Heap`] and the [`crate::gc::ThreadObj`] being run. The loop
//! fetches one 16-bit word, decodes its opcode, executes it, and polls the
//! GC before fetching the next - exactly the "GC may run at any opcode
//! boundary, nowhere else" rule the allocator depends on.

// The dispatch loop converts constantly between `f64` (the only numeric
// value type), register indices, and instruction offsets; blanket-allow the
// numeric casts pedantic clippy would otherwise want annotated one at a time.
#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]

#[cfg(test)]
mod integration_test;

use thiserror::Error;

use crate::bytecode::{decode_f64, decode_i32, op};
use crate::config::VmConfig;
use crate::gc::{EnvObj, Frame, FuncObj, GcRef, Heap, HeapObject, ThreadObj, ThreadStatus};
use crate::value::Value;

/// Errors raised while executing bytecode.
#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum RuntimeError {
    #[error("invalid opcode: {0}")]
    InvalidOpcode(u8),
    #[error("instruction pointer out of bounds")]
    IpOutOfBounds,
    #[error("type error: expected {expected}, got {got}")]
    TypeError {
        expected: &'static str,
        got: &'static str,
    },
    #[error("value is not callable: {type_name}")]
    NotCallable { type_name: &'static str },
    #[error("arity mismatch: expected {expected}, got {got}")]
    ArityMismatch { expected: u8, got: u8 },
    #[error("index out of bounds: {index}")]
    IndexOutOfBounds { index: i64 },
    #[error("division by zero")]
    DivisionByZero,
    #[error("call stack overflow")]
    StackOverflow,
    #[error("user error: {0:?}")]
    UserError(Value),
}

/// Maximum live call-frame depth before a `StackOverflow` error is raised,
/// turning unbounded non-tail recursion into a catchable error instead of an
/// unbounded allocation.
const DEFAULT_MAX_CALL_DEPTH: usize = 4096;

pub struct Vm;

impl Vm {
    /// Compile-and-run convenience wrapper: wraps `def` in a capture-less
    /// closure, starts a fresh thread, and runs it to completion.
    pub fn execute(
        heap: &mut Heap,
        entry: crate::gc::FuncDefObj,
        config: &VmConfig,
    ) -> Result<Value, RuntimeError> {
        let def_ref = heap.alloc_funcdef(entry);
        let func_ref = heap.alloc_func(FuncObj {
            def: def_ref,
            env: None,
            parent: None,
        });
        let mut thread = ThreadObj::new();
        thread.status = ThreadStatus::Alive;
        let thread_ref = heap.alloc_thread(thread);
        Self::call_in_thread(heap, thread_ref, func_ref, &[], config)
    }

    /// Run `func` with `args` on `thread_ref` until it returns (or the
    /// thread's frame stack empties).
    pub fn call_in_thread(
        heap: &mut Heap,
        thread_ref: GcRef,
        func_ref: GcRef,
        args: &[Value],
        config: &VmConfig,
    ) -> Result<Value, RuntimeError> {
        push_call(heap, thread_ref, func_ref, args, 0, 0)?;
        Self::run(heap, thread_ref, config)
    }

    /// The dispatch loop. Runs until the thread's frame stack empties,
    /// returning the value of the last `RETURN`. A runtime error raised by
    /// one step unwinds frames looking for an installed `try` handler
    /// (`Frame::error_jump`) before being returned to the caller.
    pub fn run(heap: &mut Heap, thread_ref: GcRef, config: &VmConfig) -> Result<Value, RuntimeError> {
        let max_depth = config.max_call_depth.unwrap_or(DEFAULT_MAX_CALL_DEPTH);
        let mut ip: usize = 0;
        let mut last_return = Value::Nil;

        loop {
            match step(heap, thread_ref, max_depth, &mut ip, &mut last_return) {
                Ok(Some(v)) => return Ok(v),
                Ok(None) => {}
                Err(err) => {
                    if !unwind_to_handler(heap, thread_ref, err, &mut ip) {
                        return Err(err);
                    }
                }
            }
        }
    }
}

/// Run one bytecode instruction. `Ok(Some(v))` means the thread finished
/// with value `v`; `Ok(None)` means keep looping. `ip_out` is the dispatch
/// loop's program counter: read at entry, written back before every return
/// path (a plain local is used for the duration of decoding so the opcode
/// match below can mutate it through `&mut ip` exactly as a flat loop body
/// would).
#[allow(clippy::too_many_lines)]
fn step(
    heap: &mut Heap,
    thread_ref: GcRef,
    max_depth: usize,
    ip_out: &mut usize,
    last_return: &mut Value,
) -> Result<Option<Value>, RuntimeError> {
    let (opcode, a, base) = {
        let HeapObject::Thread(t) = heap.get(thread_ref) else {
            unreachable!()
        };
        let Some(frame) = t.frames.last() else {
            return Ok(Some(*last_return));
        };
        let def_ref = frame_def(heap, frame.callee);
        let HeapObject::FuncDef(def) = heap.get(def_ref) else {
            unreachable!()
        };
        let Some(&word) = def.bytecode.get(*ip_out) else {
            return Err(RuntimeError::IpOutOfBounds);
        };
        (
            crate::bytecode::decode_opcode(word),
            crate::bytecode::decode_a(word),
            frame.base as usize,
        )
    };

    {
        let mut ip = *ip_out + 1;
        match opcode {
                op::LOAD_0 => set_reg(heap, thread_ref, base, a, Value::Number(0.0)),
                op::LOAD_1 => set_reg(heap, thread_ref, base, a, Value::Number(1.0)),
                op::LOAD_FALSE => set_reg(heap, thread_ref, base, a, Value::Bool(false)),
                op::LOAD_TRUE => set_reg(heap, thread_ref, base, a, Value::Bool(true)),
                op::LOAD_NIL => set_reg(heap, thread_ref, base, a, Value::Nil),
                op::LOAD_I16 => {
                    let word = fetch(heap, thread_ref, base, &mut ip)?;
                    #[allow(clippy::cast_possible_wrap)]
                    let n = word as i16;
                    set_reg(heap, thread_ref, base, a, Value::Number(f64::from(n)));
                }
                op::LOAD_I32 => {
                    let lo = fetch(heap, thread_ref, base, &mut ip)?;
                    let hi = fetch(heap, thread_ref, base, &mut ip)?;
                    let n = decode_i32(lo, hi);
                    set_reg(heap, thread_ref, base, a, Value::Number(f64::from(n)));
                }
                op::LOAD_F64 => {
                    let words = [
                        fetch(heap, thread_ref, base, &mut ip)?,
                        fetch(heap, thread_ref, base, &mut ip)?,
                        fetch(heap, thread_ref, base, &mut ip)?,
                        fetch(heap, thread_ref, base, &mut ip)?,
                    ];
                    set_reg(heap, thread_ref, base, a, Value::Number(decode_f64(words)));
                }
                op::LOAD_CONST => {
                    let idx = fetch(heap, thread_ref, base, &mut ip)?;
                    let def_ref = current_def(heap, thread_ref);
                    let HeapObject::FuncDef(def) = heap.get(def_ref) else {
                        unreachable!()
                    };
                    let v = def.literals[idx as usize];
                    set_reg(heap, thread_ref, base, a, v);
                }
                op::LOAD_UPVALUE => {
                    let level = fetch(heap, thread_ref, base, &mut ip)?;
                    let index = fetch(heap, thread_ref, base, &mut ip)?;
                    let v = read_upvalue(heap, thread_ref, level, index)?;
                    set_reg(heap, thread_ref, base, a, v);
                }
                op::STORE_UPVALUE => {
                    let level = fetch(heap, thread_ref, base, &mut ip)?;
                    let index = fetch(heap, thread_ref, base, &mut ip)?;
                    let v = reg(heap, thread_ref, base, a);
                    write_upvalue(heap, thread_ref, level, index, v)?;
                }
                op::MOVE => {
                    let src = fetch(heap, thread_ref, base, &mut ip)?;
                    let v = reg(heap, thread_ref, base, src);
                    set_reg(heap, thread_ref, base, a, v);
                }
                op::MAKE_CLOSURE => {
                    let idx = fetch(heap, thread_ref, base, &mut ip)?;
                    let def_ref = current_def(heap, thread_ref);
                    let HeapObject::FuncDef(parent_def) = heap.get(def_ref) else {
                        unreachable!()
                    };
                    let Value::FuncDef(inner_def) = parent_def.literals[idx as usize] else {
                        return Err(RuntimeError::TypeError {
                            expected: "funcdef",
                            got: "other",
                        });
                    };
                    let parent_func = current_frame_callee(heap, thread_ref);
                    let env = make_env(heap, thread_ref, base);
                    let func = heap.alloc_func(FuncObj {
                        def: inner_def,
                        env: Some(env),
                        parent: Some(parent_func),
                    });
                    set_reg(heap, thread_ref, base, a, Value::Func(func));
                }
                op::ADD | op::SUB | op::MUL | op::DIV => {
                    let lr = fetch(heap, thread_ref, base, &mut ip)?;
                    let rr = fetch(heap, thread_ref, base, &mut ip)?;
                    let l = as_number(reg(heap, thread_ref, base, lr))?;
                    let r = as_number(reg(heap, thread_ref, base, rr))?;
                    let v = binary_arith(opcode, l, r)?;
                    set_reg(heap, thread_ref, base, a, Value::Number(v));
                }
                op::ADD_N | op::SUB_N | op::MUL_N | op::DIV_N => {
                    let count = fetch(heap, thread_ref, base, &mut ip)?;
                    let mut regs = Vec::with_capacity(count as usize);
                    for _ in 0..count {
                        regs.push(fetch(heap, thread_ref, base, &mut ip)?);
                    }
                    let mut values = regs
                        .into_iter()
                        .map(|rr| as_number(reg(heap, thread_ref, base, rr)));
                    let mut acc = values.next().ok_or(RuntimeError::TypeError {
                        expected: "at least one operand",
                        got: "none",
                    })??;
                    for v in values {
                        acc = binary_arith(nary_to_binary(opcode), acc, v?)?;
                    }
                    set_reg(heap, thread_ref, base, a, Value::Number(acc));
                }
                op::NOT => {
                    let sr = fetch(heap, thread_ref, base, &mut ip)?;
                    let v = reg(heap, thread_ref, base, sr);
                    set_reg(heap, thread_ref, base, a, Value::Bool(!v.is_truthy()));
                }
                op::EQ => {
                    let lr = fetch(heap, thread_ref, base, &mut ip)?;
                    let rr = fetch(heap, thread_ref, base, &mut ip)?;
                    let l = reg(heap, thread_ref, base, lr);
                    let r = reg(heap, thread_ref, base, rr);
                    let result = heap.values_equal(l, r);
                    set_reg(heap, thread_ref, base, a, Value::Bool(result));
                }
                op::LT | op::LE => {
                    let lr = fetch(heap, thread_ref, base, &mut ip)?;
                    let rr = fetch(heap, thread_ref, base, &mut ip)?;
                    let l = as_number(reg(heap, thread_ref, base, lr))?;
                    let r = as_number(reg(heap, thread_ref, base, rr))?;
                    let result = if opcode == op::LT { l < r } else { l <= r };
                    set_reg(heap, thread_ref, base, a, Value::Bool(result));
                }
                op::JIF => {
                    let lo = fetch(heap, thread_ref, base, &mut ip)?;
                    let hi = fetch(heap, thread_ref, base, &mut ip)?;
                    let cond = reg(heap, thread_ref, base, a);
                    if !cond.is_truthy() {
                        let offset = decode_i32(lo, hi);
                        ip = apply_offset(ip, offset)?;
                    }
                }
                op::JMP => {
                    let lo = fetch(heap, thread_ref, base, &mut ip)?;
                    let hi = fetch(heap, thread_ref, base, &mut ip)?;
                    let offset = decode_i32(lo, hi);
                    ip = apply_offset(ip, offset)?;
                }
                op::CALL => {
                    let callee_r = fetch(heap, thread_ref, base, &mut ip)?;
                    let argc = fetch(heap, thread_ref, base, &mut ip)?;
                    let mut args = Vec::with_capacity(argc as usize);
                    for _ in 0..argc {
                        let rr = fetch(heap, thread_ref, base, &mut ip)?;
                        args.push(reg(heap, thread_ref, base, rr));
                    }
                    let callee = reg(heap, thread_ref, base, callee_r);
                    match dispatch_call(heap, thread_ref, callee, &args, a, ip, max_depth)? {
                        CallOutcome::Pushed => ip = 0,
                        CallOutcome::Returned(v) => set_reg(heap, thread_ref, base, a, v),
                    }
                }
                op::TAIL_CALL => {
                    let callee_r = fetch(heap, thread_ref, base, &mut ip)?;
                    let argc = fetch(heap, thread_ref, base, &mut ip)?;
                    let mut args = Vec::with_capacity(argc as usize);
                    for _ in 0..argc {
                        let rr = fetch(heap, thread_ref, base, &mut ip)?;
                        args.push(reg(heap, thread_ref, base, rr));
                    }
                    let callee = reg(heap, thread_ref, base, callee_r);
                    match dispatch_tail_call(heap, thread_ref, callee, &args)? {
                        TailOutcome::Replaced => ip = 0,
                        TailOutcome::Returned(v) => {
                            *ip_out = ip;
                            let done = do_return(heap, thread_ref, v, ip_out)?;
                            *last_return = v;
                            if done {
                                return Ok(Some(v));
                            }
                            let roots = gc_roots(heap, thread_ref);
                            heap.maybe_collect(&roots);
                            return Ok(None);
                        }
                    }
                }
                op::RETURN => {
                    let rr = fetch(heap, thread_ref, base, &mut ip)?;
                    let v = reg(heap, thread_ref, base, rr);
                    *ip_out = ip;
                    let done = do_return(heap, thread_ref, v, ip_out)?;
                    *last_return = v;
                    if done {
                        return Ok(Some(v));
                    }
                    let roots = gc_roots(heap, thread_ref);
                    heap.maybe_collect(&roots);
                    return Ok(None);
                }
                op::RETURN_NIL => {
                    *ip_out = ip;
                    let done = do_return(heap, thread_ref, Value::Nil, ip_out)?;
                    *last_return = Value::Nil;
                    if done {
                        return Ok(Some(Value::Nil));
                    }
                    let roots = gc_roots(heap, thread_ref);
                    heap.maybe_collect(&roots);
                    return Ok(None);
                }
                op::SET_HANDLER => {
                    let lo = fetch(heap, thread_ref, base, &mut ip)?;
                    let hi = fetch(heap, thread_ref, base, &mut ip)?;
                    let offset = decode_i32(lo, hi);
                    let target = apply_offset(ip, offset)?;
                    let HeapObject::Thread(t) = heap.get_mut(thread_ref) else {
                        unreachable!()
                    };
                    let Some(frame) = t.frames.last_mut() else {
                        tracing::error!("SET_HANDLER dispatched outside a frame");
                        panic!("SET_HANDLER outside a frame");
                    };
                    frame.error_jump = Some(u32::try_from(target).unwrap_or(0));
                    frame.error_slot = a;
                }
                op::CLEAR_HANDLER => {
                    let HeapObject::Thread(t) = heap.get_mut(thread_ref) else {
                        unreachable!()
                    };
                    let Some(frame) = t.frames.last_mut() else {
                        tracing::error!("CLEAR_HANDLER dispatched outside a frame");
                        panic!("CLEAR_HANDLER outside a frame");
                    };
                    frame.error_jump = None;
                }
                op::ARR => {
                    let count = fetch(heap, thread_ref, base, &mut ip)?;
                    let mut items = Vec::with_capacity(count as usize);
                    for _ in 0..count {
                        let rr = fetch(heap, thread_ref, base, &mut ip)?;
                        items.push(reg(heap, thread_ref, base, rr));
                    }
                    let r = heap.alloc_array(items);
                    set_reg(heap, thread_ref, base, a, Value::Array(r));
                }
                op::DIC => {
                    let count = fetch(heap, thread_ref, base, &mut ip)?;
                    let mut items = Vec::with_capacity(count as usize);
                    for _ in 0..count {
                        let rr = fetch(heap, thread_ref, base, &mut ip)?;
                        items.push(reg(heap, thread_ref, base, rr));
                    }
                    let dict_ref = heap.alloc_dict();
                    for pair in items.chunks(2) {
                        let (k, v) = (pair[0], pair[1]);
                        put_dict(heap, dict_ref, k, v);
                    }
                    set_reg(heap, thread_ref, base, a, Value::Dict(dict_ref));
                }
                op::GET => {
                    let cr = fetch(heap, thread_ref, base, &mut ip)?;
                    let kr = fetch(heap, thread_ref, base, &mut ip)?;
                    let container = reg(heap, thread_ref, base, cr);
                    let key = reg(heap, thread_ref, base, kr);
                    let v = do_get(heap, container, key)?;
                    set_reg(heap, thread_ref, base, a, v);
                }
                op::SET => {
                    let cr = fetch(heap, thread_ref, base, &mut ip)?;
                    let kr = fetch(heap, thread_ref, base, &mut ip)?;
                    let vr = fetch(heap, thread_ref, base, &mut ip)?;
                    let container = reg(heap, thread_ref, base, cr);
                    let key = reg(heap, thread_ref, base, kr);
                    let value = reg(heap, thread_ref, base, vr);
                    do_set(heap, container, key, value)?;
                }
                other => return Err(RuntimeError::InvalidOpcode(other)),
            }

        *ip_out = ip;
    }

    let roots = gc_roots(heap, thread_ref);
    heap.maybe_collect(&roots);
    Ok(None)
}

/// Convert a `RuntimeError` into the value delivered to a `try` handler. A
/// native-raised error (`UserError`) passes through untouched so a native's
/// raised value round-trips exactly; every other kind is stringified.
fn error_to_value(heap: &mut Heap, err: RuntimeError) -> Value {
    match err {
        RuntimeError::UserError(v) => v,
        other => Value::String(heap.alloc_string(&other.to_string())),
    }
}

/// Walk `thread_ref`'s frames innermost-to-outermost looking for an
/// installed `try` handler. Installs the converted error value in the
/// handler's register, clears that frame's handler (an error raised inside
/// the handler itself propagates past it instead of looping back in), and
/// points `ip` at the handler's entry. Returns `false` if no frame has a
/// handler, after popping every frame so the thread is left empty.
fn unwind_to_handler(heap: &mut Heap, thread_ref: GcRef, err: RuntimeError, ip: &mut usize) -> bool {
    loop {
        let frame_info = {
            let HeapObject::Thread(t) = heap.get(thread_ref) else {
                unreachable!()
            };
            t.frames.last().map(|f| (f.error_jump, f.error_slot, f.base, f.env))
        };
        let Some((error_jump, error_slot, base, env)) = frame_info else {
            return false;
        };
        if let Some(target) = error_jump {
            let value = error_to_value(heap, err);
            let HeapObject::Thread(t) = heap.get_mut(thread_ref) else {
                unreachable!()
            };
            t.registers[base as usize + error_slot as usize] = value;
            if let Some(frame) = t.frames.last_mut() {
                frame.error_jump = None;
            }
            *ip = target as usize;
            return true;
        }
        if let Some(env_ref) = env {
            detach_env(heap, env_ref, thread_ref, base);
        }
        let HeapObject::Thread(t) = heap.get_mut(thread_ref) else {
            unreachable!()
        };
        t.frames.pop();
        t.registers.truncate(base as usize);
        if t.frames.is_empty() {
            t.status = ThreadStatus::Dead;
        }
    }
}

fn gc_roots(heap: &Heap, thread_ref: GcRef) -> Vec<Value> {
    let _ = heap;
    vec![Value::Thread(thread_ref)]
}

fn current_def(heap: &Heap, thread_ref: GcRef) -> GcRef {
    let HeapObject::Thread(t) = heap.get(thread_ref) else {
        unreachable!()
    };
    let Some(frame) = t.frames.last() else {
        tracing::error!("current_def called with no active frame");
        panic!("no active frame");
    };
    frame_def(heap, frame.callee)
}

fn current_frame_callee(heap: &Heap, thread_ref: GcRef) -> GcRef {
    let HeapObject::Thread(t) = heap.get(thread_ref) else {
        unreachable!()
    };
    let Some(frame) = t.frames.last() else {
        tracing::error!("current_frame_callee called with no active frame");
        panic!("no active frame");
    };
    frame.callee
}

fn frame_def(heap: &Heap, func_ref: GcRef) -> GcRef {
    let HeapObject::Func(f) = heap.get(func_ref) else {
        unreachable!()
    };
    f.def
}

fn fetch(heap: &Heap, thread_ref: GcRef, _base: usize, ip: &mut usize) -> Result<u16, RuntimeError> {
    let def_ref = current_def(heap, thread_ref);
    let HeapObject::FuncDef(def) = heap.get(def_ref) else {
        unreachable!()
    };
    let word = *def.bytecode.get(*ip).ok_or(RuntimeError::IpOutOfBounds)?;
    *ip += 1;
    Ok(word)
}

fn reg(heap: &Heap, thread_ref: GcRef, base: usize, index: u16) -> Value {
    let HeapObject::Thread(t) = heap.get(thread_ref) else {
        unreachable!()
    };
    t.registers[base + index as usize]
}

fn set_reg(heap: &mut Heap, thread_ref: GcRef, base: usize, index: u8, value: Value) {
    let HeapObject::Thread(t) = heap.get_mut(thread_ref) else {
        unreachable!()
    };
    t.registers[base + index as usize] = value;
}

fn apply_offset(ip: usize, offset: i32) -> Result<usize, RuntimeError> {
    let next = ip as i64 + i64::from(offset);
    usize::try_from(next).map_err(|_| RuntimeError::IpOutOfBounds)
}

fn as_number(v: Value) -> Result<f64, RuntimeError> {
    match v {
        Value::Number(n) => Ok(n),
        _ => Err(RuntimeError::TypeError {
            expected: "number",
            got: v.type_name(),
        }),
    }
}

fn binary_arith(opcode: u8, l: f64, r: f64) -> Result<f64, RuntimeError> {
    Ok(match opcode {
        op::ADD => l + r,
        op::SUB => l - r,
        op::MUL => l * r,
        op::DIV => {
            if r == 0.0 {
                return Err(RuntimeError::DivisionByZero);
            }
            l / r
        }
        _ => unreachable!(),
    })
}

fn nary_to_binary(opcode: u8) -> u8 {
    match opcode {
        op::ADD_N => op::ADD,
        op::SUB_N => op::SUB,
        op::MUL_N => op::MUL,
        op::DIV_N => op::DIV,
        _ => unreachable!(),
    }
}

/// Create (or reuse) the `EnvObj` for the currently executing frame, so a
/// `MAKE_CLOSURE` can capture the locals still live on the stack.
fn make_env(heap: &mut Heap, thread_ref: GcRef, base: usize) -> GcRef {
    let existing = {
        let HeapObject::Thread(t) = heap.get(thread_ref) else {
            unreachable!()
        };
        t.frames.last().and_then(|f| f.env)
    };
    if let Some(env) = existing {
        return env;
    }
    let env_ref = heap.alloc_env(EnvObj::Live {
        thread: thread_ref,
        stack_offset: u32::try_from(base).unwrap_or(0),
    });
    let HeapObject::Thread(t) = heap.get_mut(thread_ref) else {
        unreachable!()
    };
    if let Some(frame) = t.frames.last_mut() {
        frame.env = Some(env_ref);
    }
    env_ref
}

fn read_upvalue(heap: &Heap, thread_ref: GcRef, level: u16, index: u16) -> Result<Value, RuntimeError> {
    let mut closure = current_frame_callee(heap, thread_ref);
    for _ in 0..level.saturating_sub(1) {
        let HeapObject::Func(f) = heap.get(closure) else {
            unreachable!()
        };
        let Some(parent) = f.parent else {
            tracing::error!(level, index, "up-value level exceeds closure chain");
            panic!("up-value level exceeds closure chain");
        };
        closure = parent;
    }
    let HeapObject::Func(f) = heap.get(closure) else {
        unreachable!()
    };
    let Some(env_ref) = f.env else {
        tracing::error!(level, index, "closure captured an up-value with no env");
        panic!("closure captured an up-value with no env");
    };
    let HeapObject::Env(env) = heap.get(env_ref) else {
        unreachable!()
    };
    Ok(match env {
        EnvObj::Live { thread, stack_offset } => {
            let HeapObject::Thread(t) = heap.get(*thread) else {
                unreachable!()
            };
            t.registers[*stack_offset as usize + index as usize]
        }
        EnvObj::Detached { values } => values[index as usize],
    })
}

fn write_upvalue(
    heap: &mut Heap,
    thread_ref: GcRef,
    level: u16,
    index: u16,
    value: Value,
) -> Result<(), RuntimeError> {
    let mut closure = current_frame_callee(heap, thread_ref);
    for _ in 0..level.saturating_sub(1) {
        let HeapObject::Func(f) = heap.get(closure) else {
            unreachable!()
        };
        let Some(parent) = f.parent else {
            tracing::error!(level, index, "up-value level exceeds closure chain");
            panic!("up-value level exceeds closure chain");
        };
        closure = parent;
    }
    let HeapObject::Func(f) = heap.get(closure) else {
        unreachable!()
    };
    let Some(env_ref) = f.env else {
        tracing::error!(level, index, "closure captured an up-value with no env");
        panic!("closure captured an up-value with no env");
    };
    let HeapObject::Env(env) = heap.get_mut(env_ref) else {
        unreachable!()
    };
    match env {
        EnvObj::Live { thread, stack_offset } => {
            let (thread, offset) = (*thread, *stack_offset);
            let HeapObject::Thread(t) = heap.get_mut(thread) else {
                unreachable!()
            };
            t.registers[offset as usize + index as usize] = value;
        }
        EnvObj::Detached { values } => values[index as usize] = value,
    }
    Ok(())
}

/// Push a new frame calling `func_ref` with `args`, returning to `ret_reg`
/// in the caller at `ret_pc`.
fn push_call(
    heap: &mut Heap,
    thread_ref: GcRef,
    func_ref: GcRef,
    args: &[Value],
    ret_reg: u8,
    ret_pc: u32,
) -> Result<(), RuntimeError> {
    let def_ref = frame_def(heap, func_ref);
    let HeapObject::FuncDef(def) = heap.get(def_ref) else {
        unreachable!()
    };
    let (arity, variadic, num_locals) = (def.arity, def.variadic, def.num_locals);

    if variadic {
        if args.len() < arity as usize {
            return Err(RuntimeError::ArityMismatch {
                expected: arity,
                got: u8::try_from(args.len()).unwrap_or(u8::MAX),
            });
        }
    } else if args.len() != arity as usize {
        return Err(RuntimeError::ArityMismatch {
            expected: arity,
            got: u8::try_from(args.len()).unwrap_or(u8::MAX),
        });
    }

    let HeapObject::Thread(t) = heap.get(thread_ref) else {
        unreachable!()
    };
    let base = t.registers.len();

    let size = usize::from(num_locals).max(args.len() + 1);
    let mut registers = vec![Value::Nil; size];
    for (i, &arg) in args.iter().enumerate().take(usize::from(arity)) {
        registers[i] = arg;
    }
    if variadic {
        let rest: Vec<Value> = args.iter().skip(usize::from(arity)).copied().collect();
        let rest_ref = heap.alloc_array(rest);
        registers[usize::from(arity)] = Value::Array(rest_ref);
    }

    let HeapObject::Thread(t) = heap.get_mut(thread_ref) else {
        unreachable!()
    };
    t.registers.extend(registers);
    t.frames.push(Frame {
        callee: func_ref,
        base: u32::try_from(base).unwrap_or(0),
        size: u32::try_from(size).unwrap_or(0),
        ret_reg,
        ret_pc,
        env: None,
        error_jump: None,
        error_slot: 0,
    });
    Ok(())
}

/// What dispatching a `CALL` produced: either a new frame was pushed (the
/// dispatch loop resumes at its entry), or a native ran to completion and
/// produced a value directly (no frame to resume into).
enum CallOutcome {
    Pushed,
    Returned(Value),
}

fn dispatch_call(
    heap: &mut Heap,
    thread_ref: GcRef,
    callee: Value,
    args: &[Value],
    ret_reg: u8,
    ret_pc: usize,
    max_depth: usize,
) -> Result<CallOutcome, RuntimeError> {
    match callee {
        Value::Func(func_ref) => {
            let depth = {
                let HeapObject::Thread(t) = heap.get(thread_ref) else {
                    unreachable!()
                };
                t.frames.len()
            };
            if depth >= max_depth {
                return Err(RuntimeError::StackOverflow);
            }
            push_call(
                heap,
                thread_ref,
                func_ref,
                args,
                ret_reg,
                u32::try_from(ret_pc).unwrap_or(0),
            )?;
            Ok(CallOutcome::Pushed)
        }
        Value::Native(id) => call_native(heap, id, args).map(CallOutcome::Returned),
        other => Err(RuntimeError::NotCallable {
            type_name: other.type_name(),
        }),
    }
}

/// What dispatching a `TAIL_CALL` produced: either the current frame was
/// replaced in place (the dispatch loop resumes at its entry), or a native
/// ran to completion and its value should be returned from the current
/// frame exactly as a `RETURN` would.
enum TailOutcome {
    Replaced,
    Returned(Value),
}

fn call_native(heap: &mut Heap, id: u16, args: &[Value]) -> Result<Value, RuntimeError> {
    let Some(f) = heap.native(id) else {
        return Err(RuntimeError::NotCallable { type_name: "native-function" });
    };
    f(heap, args).map_err(RuntimeError::UserError)
}

/// Replace the current frame in place, reusing its register range. Keeps
/// tail-recursive loops from growing the frame stack.
fn dispatch_tail_call(
    heap: &mut Heap,
    thread_ref: GcRef,
    callee: Value,
    args: &[Value],
) -> Result<TailOutcome, RuntimeError> {
    if let Value::Native(id) = callee {
        return call_native(heap, id, args).map(TailOutcome::Returned);
    }
    let Value::Func(func_ref) = callee else {
        return Err(RuntimeError::NotCallable {
            type_name: callee.type_name(),
        });
    };

    let (old_base, old_env) = {
        let HeapObject::Thread(t) = heap.get(thread_ref) else {
            unreachable!()
        };
        let Some(frame) = t.frames.last() else {
            tracing::error!("tail call dispatched outside a frame");
            panic!("tail call outside a frame");
        };
        (frame.base, frame.env)
    };

    if let Some(env_ref) = old_env {
        detach_env(heap, env_ref, thread_ref, old_base);
    }

    let def_ref = frame_def(heap, func_ref);
    let HeapObject::FuncDef(def) = heap.get(def_ref) else {
        unreachable!()
    };
    let (arity, variadic, num_locals) = (def.arity, def.variadic, def.num_locals);

    if (variadic && args.len() < arity as usize) || (!variadic && args.len() != arity as usize) {
        return Err(RuntimeError::ArityMismatch {
            expected: arity,
            got: u8::try_from(args.len()).unwrap_or(u8::MAX),
        });
    }

    let size = usize::from(num_locals).max(args.len() + 1);
    let base = old_base as usize;

    let HeapObject::Thread(t) = heap.get_mut(thread_ref) else {
        unreachable!()
    };
    t.registers.truncate(base);
    t.registers.resize(base + size, Value::Nil);
    for (i, &arg) in args.iter().enumerate().take(usize::from(arity)) {
        t.registers[base + i] = arg;
    }
    if variadic {
        let rest: Vec<Value> = args.iter().skip(usize::from(arity)).copied().collect();
        drop(t);
        let rest_ref = heap.alloc_array(rest);
        let HeapObject::Thread(t) = heap.get_mut(thread_ref) else {
            unreachable!()
        };
        t.registers[base + usize::from(arity)] = Value::Array(rest_ref);
    }

    let HeapObject::Thread(t) = heap.get_mut(thread_ref) else {
        unreachable!()
    };
    let Some(frame) = t.frames.last_mut() else {
        tracing::error!("tail call dispatched outside a frame");
        panic!("tail call outside a frame");
    };
    frame.callee = func_ref;
    frame.size = u32::try_from(size).unwrap_or(0);
    frame.env = None;
    Ok(TailOutcome::Replaced)
}

/// Snapshot a still-live captured environment before its owning frame is
/// reused or popped.
fn detach_env(heap: &mut Heap, env_ref: GcRef, thread_ref: GcRef, base: u32) {
    let HeapObject::Thread(t) = heap.get(thread_ref) else {
        unreachable!()
    };
    let HeapObject::FuncDef(def) = heap.get(frame_def(heap, current_frame_callee(heap, thread_ref)))
    else {
        unreachable!()
    };
    let size = t
        .frames
        .last()
        .map_or(usize::from(def.num_locals), |f| f.size as usize);
    let values = t.registers[base as usize..base as usize + size].to_vec();
    let HeapObject::Env(env) = heap.get_mut(env_ref) else {
        unreachable!()
    };
    *env = EnvObj::Detached { values };
}

/// Pop the current frame, snapshotting any live env it owned. Returns
/// `true` if the thread's frame stack is now empty (execution finished).
fn do_return(heap: &mut Heap, thread_ref: GcRef, value: Value, ip: &mut usize) -> Result<bool, RuntimeError> {
    let (base, env, ret_reg, ret_pc) = {
        let HeapObject::Thread(t) = heap.get(thread_ref) else {
            unreachable!()
        };
        let Some(frame) = t.frames.last() else {
            tracing::error!("return dispatched outside a frame");
            panic!("return outside a frame");
        };
        (frame.base, frame.env, frame.ret_reg, frame.ret_pc)
    };
    if let Some(env_ref) = env {
        detach_env(heap, env_ref, thread_ref, base);
    }
    let HeapObject::Thread(t) = heap.get_mut(thread_ref) else {
        unreachable!()
    };
    t.frames.pop();
    t.registers.truncate(base as usize);
    if t.frames.is_empty() {
        t.status = ThreadStatus::Dead;
        return Ok(true);
    }
    let Some(caller) = t.frames.last() else {
        tracing::error!("frame stack empty immediately after a non-empty check");
        panic!("non-empty frames")
    };
    let caller_base = caller.base as usize;
    t.registers[caller_base + ret_reg as usize] = value;
    *ip = ret_pc as usize;
    Ok(false)
}

/// Take a `Dict` out of its slot (replacing it with an empty placeholder)
/// so it can be mutated with a closure that itself needs `&Heap` - `put`
/// needs `Heap::values_equal` for key comparison, which would otherwise
/// alias the `&mut HeapObject::Dict` borrow.
fn take_dict(heap: &mut Heap, r: GcRef) -> crate::container::Dict {
    let HeapObject::Dict(d) = heap.get_mut(r) else {
        unreachable!()
    };
    core::mem::take(d)
}

fn put_back_dict(heap: &mut Heap, r: GcRef, dict: crate::container::Dict) {
    let HeapObject::Dict(d) = heap.get_mut(r) else {
        unreachable!()
    };
    *d = dict;
}

fn put_dict(heap: &mut Heap, dict_ref: GcRef, key: Value, value: Value) {
    let hash = heap.hash_value(key);
    let mut dict = take_dict(heap, dict_ref);
    let due = dict.put(hash, key, value, |a, b| heap.values_equal(a, b));
    if due {
        let new_count = if dict.len() >= dict.bucket_count() * 2 {
            dict.bucket_count() * 2
        } else {
            (dict.bucket_count() / 2).max(1)
        };
        dict.rehash(new_count, |k| heap.hash_value(k));
    }
    put_back_dict(heap, dict_ref, dict);
}

fn do_get(heap: &mut Heap, container: Value, key: Value) -> Result<Value, RuntimeError> {
    match container {
        Value::Array(r) => {
            let idx = as_index(key)?;
            let HeapObject::Array(a) = heap.get(r) else {
                unreachable!()
            };
            a.get(idx).map_err(|_| RuntimeError::IndexOutOfBounds { index: idx as i64 })
        }
        Value::Dict(r) => {
            let hash = heap.hash_value(key);
            let HeapObject::Dict(d) = heap.get(r) else {
                unreachable!()
            };
            Ok(get_dict(d, hash, key, heap))
        }
        other => Err(RuntimeError::TypeError {
            expected: "array or dict",
            got: other.type_name(),
        }),
    }
}

fn get_dict(d: &crate::container::Dict, hash: u32, key: Value, heap: &Heap) -> Value {
    d.get(hash, key, |a, b| heap.values_equal(a, b))
}

fn do_set(heap: &mut Heap, container: Value, key: Value, value: Value) -> Result<(), RuntimeError> {
    match container {
        Value::Array(r) => {
            let idx = as_index(key)?;
            let HeapObject::Array(a) = heap.get_mut(r) else {
                unreachable!()
            };
            a.set(idx, value)
                .map_err(|_| RuntimeError::IndexOutOfBounds { index: idx as i64 })
        }
        Value::Dict(r) => {
            put_dict(heap, r, key, value);
            Ok(())
        }
        other => Err(RuntimeError::TypeError {
            expected: "array or dict",
            got: other.type_name(),
        }),
    }
}

fn as_index(v: Value) -> Result<usize, RuntimeError> {
    match v {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        Value::Number(n) if n >= 0.0 => Ok(n as usize),
        Value::Number(n) => Err(RuntimeError::IndexOutOfBounds { index: n as i64 }),
        _ => Err(RuntimeError::TypeError {
            expected: "number",
            got: v.type_name(),
        }),
    }
}
