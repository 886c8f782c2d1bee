// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! The single-pass compiler: lowers a `Value` AST into register-based
//! bytecode.
//!
//! The AST convention: a *form* is a `Value::Array` whose first element is a
//! `Value::Symbol` naming either a special form (see `forms::SPECIAL_FORMS`)
//! or, for an ordinary call, an expression evaluating to something callable.
//! Anything else (nil, booleans, numbers, strings, bare symbols) compiles
//! directly per the dispatch rules below.

mod disassemble;
mod forms;
pub mod scope;

pub use disassemble::disassemble;

use thiserror::Error;

use crate::bytecode::{op, Chunk};
use crate::config::RootEnv;
use crate::gc::{FuncDefObj, GcRef, Heap};
use crate::value::Value;
use scope::{FormOptions, ScopeChain, Slot};

/// The largest argument count a single call or `arr`/`dic` form may carry.
pub const MAX_ARGS: u16 = 4096;

/// Hook for a macro-expansion pass run on every form before it is dispatched
/// as a special form or call. Not driven by anything in this crate by
/// default (see `NoMacros`) - an embedder wanting reader macros or
/// syntax-rules-style expansion implements this and compiles with
/// `compile_with`.
pub trait MacroExpander {
    /// Called with each form (always a `Value::Array`). Returning
    /// `Some(expanded)` replaces the form with `expanded`, which is compiled
    /// in its place (and, if itself a form, offered to `expand` again).
    /// Returning `None` leaves the form to normal dispatch.
    fn expand(&mut self, heap: &mut Heap, form: Value) -> Option<Value>;
}

/// The default `MacroExpander`: expands nothing.
pub struct NoMacros;

impl MacroExpander for NoMacros {
    fn expand(&mut self, _heap: &mut Heap, _form: Value) -> Option<Value> {
        None
    }
}

/// Errors raised while compiling an AST into bytecode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CompileError {
    #[error("unbound symbol")]
    UnboundSymbol,
    #[error("invalid syntax")]
    InvalidSyntax,
    #[error("too many arguments")]
    TooManyArguments,
    #[error("integer too large")]
    IntegerTooLarge,
    #[error("constant pool full")]
    ConstantPoolFull,
    #[error("expression too complex")]
    ExpressionTooComplex,
    #[error("double free of compiler slot")]
    DoubleFree,
}

/// Drives one top-level compilation. Holds the heap (to read AST arrays and
/// strings, and to allocate `FuncDef`s for nested `fn` forms), the scope
/// chain, and the bytecode buffer shared across the whole compile - nested
/// function bodies are compiled into the tail of this same buffer and then
/// sliced out, per `finalize_funcdef`.
pub struct Compiler<'a> {
    pub(crate) heap: &'a mut Heap,
    pub(crate) chunk: Chunk,
    pub(crate) scopes: ScopeChain,
    pub(crate) root_env: &'a RootEnv,
    pub(crate) macro_expander: &'a mut dyn MacroExpander,
}

impl<'a> Compiler<'a> {
    #[must_use]
    pub fn new(heap: &'a mut Heap, root_env: &'a RootEnv, macro_expander: &'a mut dyn MacroExpander) -> Self {
        Self {
            heap,
            chunk: Chunk::new(),
            scopes: ScopeChain::new(),
            root_env,
            macro_expander,
        }
    }

    /// Compile a single top-level expression into a `FuncDefObj` of arity 0.
    /// The expression's value is returned via `RETURN`.
    pub fn compile_top_level(mut self, expr: Value) -> Result<FuncDefObj, CompileError> {
        let target = self.scopes.get_local();
        let slot = self.compile_expr(expr, FormOptions::new().with_target(target).tail(true))?;
        if !slot.has_returned {
            self.emit_return(slot);
        }
        let top = self.scopes.pop();
        Ok(FuncDefObj {
            arity: 0,
            variadic: false,
            num_locals: top.frame_size.max(1),
            bytecode: self.chunk.code,
            literals: top.literals,
        })
    }

    pub(crate) fn emit_return(&mut self, slot: Slot) {
        if slot.is_nil {
            self.chunk.emit_header(op::RETURN_NIL, 0);
        } else {
            self.chunk.emit_header(op::RETURN, 0);
            self.chunk.emit(slot.index);
        }
    }

    /// Free `slot` if it was a compiler-owned temporary.
    pub(crate) fn release(&mut self, slot: Slot) {
        if slot.is_temp {
            self.scopes.free_local(slot.index);
        }
    }

    /// Route a freshly produced value into `opts.target`, choosing a new
    /// temporary when the caller didn't ask for a specific register.
    pub(crate) fn materialize(&mut self, opts: FormOptions) -> (u16, bool) {
        match opts.target {
            Some(t) => (t, false),
            None => (self.scopes.get_local(), true),
        }
    }

    pub fn compile_expr(&mut self, expr: Value, opts: FormOptions) -> Result<Slot, CompileError> {
        match expr {
            Value::Nil => self.compile_immediate(op::LOAD_NIL, opts, true),
            Value::Bool(true) => self.compile_immediate(op::LOAD_TRUE, opts, false),
            Value::Bool(false) => self.compile_immediate(op::LOAD_FALSE, opts, false),
            Value::Number(n) => self.compile_number(n, opts),
            Value::Symbol(r) => self.compile_symbol(r, opts),
            Value::String(_) => self.compile_constant(expr, opts),
            Value::Array(r) => self.compile_form(r, opts),
            _ => Err(CompileError::InvalidSyntax),
        }
    }

    fn compile_immediate(
        &mut self,
        opcode: u8,
        opts: FormOptions,
        is_nil: bool,
    ) -> Result<Slot, CompileError> {
        if opts.result_unused {
            return Ok(Slot::nil());
        }
        let (reg, is_temp) = self.materialize(opts);
        self.chunk.emit_header(opcode, u8::try_from(reg).unwrap_or(0));
        Ok(Slot {
            index: reg,
            is_nil,
            is_temp,
            has_returned: false,
        })
    }

    fn compile_number(&mut self, n: f64, opts: FormOptions) -> Result<Slot, CompileError> {
        if opts.result_unused {
            return Ok(Slot::nil());
        }
        let (reg, is_temp) = self.materialize(opts);
        let a = u8::try_from(reg).unwrap_or(0);
        #[allow(clippy::cast_possible_truncation)]
        let as_int = n as i64;
        if (as_int as f64) == n {
            match crate::bytecode::narrowest_int_load(as_int) {
                op::LOAD_0 => self.chunk.emit_header(op::LOAD_0, a),
                op::LOAD_1 => self.chunk.emit_header(op::LOAD_1, a),
                op::LOAD_I16 => {
                    self.chunk.emit_header(op::LOAD_I16, a);
                    #[allow(clippy::cast_possible_truncation)]
                    self.chunk.emit(as_int as u16);
                }
                op::LOAD_I32 => {
                    self.chunk.emit_header(op::LOAD_I32, a);
                    #[allow(clippy::cast_possible_truncation)]
                    self.chunk.emit_i32(as_int as i32);
                }
                _ => {
                    self.chunk.emit_header(op::LOAD_F64, a);
                    self.chunk.emit_f64(n);
                }
            }
        } else {
            self.chunk.emit_header(op::LOAD_F64, a);
            self.chunk.emit_f64(n);
        }
        Ok(Slot::value(reg, is_temp))
    }

    fn compile_constant(&mut self, value: Value, opts: FormOptions) -> Result<Slot, CompileError> {
        if opts.result_unused {
            return Ok(Slot::nil());
        }
        let (reg, is_temp) = self.materialize(opts);
        let idx = self.scopes.add_constant(value, self.heap);
        self.chunk.emit_header(op::LOAD_CONST, u8::try_from(reg).unwrap_or(0));
        self.chunk.emit(idx);
        Ok(Slot::value(reg, is_temp))
    }

    fn compile_symbol(&mut self, r: GcRef, opts: FormOptions) -> Result<Slot, CompileError> {
        let name = self.symbol_name(r);
        match self.scopes.resolve(&name) {
            Some((0, idx)) => {
                if let Some(target) = opts.target {
                    if target != idx {
                        self.chunk.emit_header(op::MOVE, u8::try_from(target).unwrap_or(0));
                        self.chunk.emit(idx);
                    }
                    Ok(Slot::value(target, false))
                } else {
                    Ok(Slot::value(idx, false))
                }
            }
            Some((level, idx)) => {
                self.scopes.mark_captures();
                let (reg, is_temp) = self.materialize(opts);
                self.chunk
                    .emit_header(op::LOAD_UPVALUE, u8::try_from(reg).unwrap_or(0));
                self.chunk.emit(u16::try_from(level).unwrap_or(u16::MAX));
                self.chunk.emit(idx);
                Ok(Slot::value(reg, is_temp))
            }
            None => match self.root_env.get(&name) {
                Some(v) => self.compile_constant(v, opts),
                None => Err(CompileError::UnboundSymbol),
            },
        }
    }

    fn symbol_name(&self, r: GcRef) -> String {
        match self.heap.get(r) {
            crate::gc::HeapObject::Str(s) => s.as_str().to_string(),
            _ => String::new(),
        }
    }

    fn compile_form(&mut self, r: GcRef, opts: FormOptions) -> Result<Slot, CompileError> {
        if let Some(expanded) = self.macro_expander.expand(self.heap, Value::Array(r)) {
            return self.compile_expr(expanded, opts);
        }
        let items = self.array_items(r);
        let Some(Value::Symbol(head)) = items.first().copied() else {
            return self.compile_call(&items, opts);
        };
        let name = self.symbol_name(head);
        if let Some(handler) = forms::lookup(&name) {
            return handler(self, &items[1..], opts);
        }
        self.compile_call(&items, opts)
    }

    pub(crate) fn array_items(&self, r: GcRef) -> Vec<Value> {
        match self.heap.get(r) {
            crate::gc::HeapObject::Array(a) => a.as_slice().to_vec(),
            _ => Vec::new(),
        }
    }

    fn compile_call(&mut self, items: &[Value], opts: FormOptions) -> Result<Slot, CompileError> {
        let Some((&callee_expr, args)) = items.split_first() else {
            return Err(CompileError::InvalidSyntax);
        };
        if args.len() > MAX_ARGS as usize {
            return Err(CompileError::TooManyArguments);
        }
        let callee = self.compile_expr(callee_expr, FormOptions::new())?;
        let mut arg_slots = Vec::with_capacity(args.len());
        for &arg in args {
            arg_slots.push(self.compile_expr(arg, FormOptions::new())?);
        }
        let argc = u16::try_from(arg_slots.len()).map_err(|_| CompileError::TooManyArguments)?;
        let opcode = if opts.is_tail { op::TAIL_CALL } else { op::CALL };
        let (reg, is_temp) = if opts.is_tail {
            (0, false)
        } else {
            self.materialize(opts)
        };
        self.chunk.emit_header(opcode, u8::try_from(reg).unwrap_or(0));
        self.chunk.emit(callee.index);
        self.chunk.emit(argc);
        for slot in &arg_slots {
            self.chunk.emit(slot.index);
        }
        self.release(callee);
        for slot in arg_slots {
            self.release(slot);
        }
        if opts.is_tail {
            Ok(Slot::returned())
        } else {
            Ok(Slot::value(reg, is_temp))
        }
    }
}

/// Convenience entry point: compile a single expression read from source
/// text (or built by hand) into a zero-arity `FuncDefObj`. Symbols not bound
/// by the expression itself resolve against `root_env`.
pub fn compile(expr: Value, heap: &mut Heap, root_env: &RootEnv) -> Result<FuncDefObj, CompileError> {
    let mut no_macros = NoMacros;
    Compiler::new(heap, root_env, &mut no_macros).compile_top_level(expr)
}

/// As `compile`, but runs `macro_expander` over every form before special-
/// form/call dispatch.
pub fn compile_with(
    expr: Value,
    heap: &mut Heap,
    root_env: &RootEnv,
    macro_expander: &mut dyn MacroExpander,
) -> Result<FuncDefObj, CompileError> {
    Compiler::new(heap, root_env, macro_expander).compile_top_level(expr)
}
