// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Special-form table: `+ - * /`, comparisons, `not`, `get`/`set`,
//! `array`/`dict`, `if`, `while`, `do`, `fn`, `quote`, and assignment.
//!
//! Each handler receives the form's argument list (the leading symbol
//! already stripped) and the [`FormOptions`] the caller compiled it with.

use crate::bytecode::op;
use crate::gc::{FuncDefObj, GcRef};
use crate::value::Value;

use super::scope::{FormOptions, Slot};
use super::{CompileError, Compiler};

type Handler = fn(&mut Compiler<'_>, &[Value], FormOptions) -> Result<Slot, CompileError>;

pub fn lookup(name: &str) -> Option<Handler> {
    Some(match name {
        "+" => add,
        "-" => sub,
        "*" => mul,
        "/" => div,
        "=" => eq,
        "<" => lt,
        "<=" => le,
        ">" => gt,
        ">=" => ge,
        "not" => not,
        "get" => get,
        "set" => set,
        "array" => array,
        "dict" => dict,
        "if" => if_form,
        "while" => while_form,
        "do" => do_form,
        "fn" => fn_form,
        "quote" => quote,
        "try" => try_form,
        ":=" | "set!" | "var" => assign,
        _ => return None,
    })
}

/// Compile each argument into a fresh temporary; returns their registers and
/// cleans up none of them (caller releases after emitting the instruction
/// that consumes them).
fn compile_args(c: &mut Compiler<'_>, args: &[Value]) -> Result<Vec<Slot>, CompileError> {
    args.iter()
        .map(|&a| c.compile_expr(a, FormOptions::new()))
        .collect()
}

fn release_all(c: &mut Compiler<'_>, slots: Vec<Slot>) {
    for s in slots {
        c.release(s);
    }
}

fn variadic_arith(
    c: &mut Compiler<'_>,
    args: &[Value],
    opts: FormOptions,
    identity: f64,
    binary_op: u8,
    nary_op: u8,
    unary: fn(&mut Compiler<'_>, Slot, FormOptions) -> Result<Slot, CompileError>,
) -> Result<Slot, CompileError> {
    match args.len() {
        0 => c.compile_expr(Value::Number(identity), opts),
        1 => {
            let a = c.compile_expr(args[0], FormOptions::new())?;
            let result = unary(c, a, opts);
            c.release(a);
            result
        }
        2 => {
            let a = c.compile_expr(args[0], FormOptions::new())?;
            let b = c.compile_expr(args[1], FormOptions::new())?;
            let (reg, is_temp) = c.materialize(opts);
            c.chunk.emit_header(binary_op, u8::try_from(reg).unwrap_or(0));
            c.chunk.emit(a.index);
            c.chunk.emit(b.index);
            c.release(a);
            c.release(b);
            Ok(Slot::value(reg, is_temp))
        }
        n if n as u16 <= super::MAX_ARGS => {
            let slots = compile_args(c, args)?;
            let (reg, is_temp) = c.materialize(opts);
            c.chunk.emit_header(nary_op, u8::try_from(reg).unwrap_or(0));
            c.chunk
                .emit(u16::try_from(slots.len()).map_err(|_| CompileError::TooManyArguments)?);
            for s in &slots {
                c.chunk.emit(s.index);
            }
            release_all(c, slots);
            Ok(Slot::value(reg, is_temp))
        }
        _ => Err(CompileError::TooManyArguments),
    }
}

fn add(c: &mut Compiler<'_>, args: &[Value], opts: FormOptions) -> Result<Slot, CompileError> {
    variadic_arith(c, args, opts, 0.0, op::ADD, op::ADD_N, |_, a, _| Ok(a))
}

fn sub(c: &mut Compiler<'_>, args: &[Value], opts: FormOptions) -> Result<Slot, CompileError> {
    variadic_arith(c, args, opts, 0.0, op::SUB, op::SUB_N, |c, a, opts| {
        let zero = c.compile_expr(Value::Number(0.0), FormOptions::new())?;
        let (reg, is_temp) = c.materialize(opts);
        c.chunk.emit_header(op::SUB, u8::try_from(reg).unwrap_or(0));
        c.chunk.emit(zero.index);
        c.chunk.emit(a.index);
        c.release(zero);
        Ok(Slot::value(reg, is_temp))
    })
}

fn mul(c: &mut Compiler<'_>, args: &[Value], opts: FormOptions) -> Result<Slot, CompileError> {
    variadic_arith(c, args, opts, 1.0, op::MUL, op::MUL_N, |_, a, _| Ok(a))
}

fn div(c: &mut Compiler<'_>, args: &[Value], opts: FormOptions) -> Result<Slot, CompileError> {
    variadic_arith(c, args, opts, 1.0, op::DIV, op::DIV_N, |c, a, opts| {
        let one = c.compile_expr(Value::Number(1.0), FormOptions::new())?;
        let (reg, is_temp) = c.materialize(opts);
        c.chunk.emit_header(op::DIV, u8::try_from(reg).unwrap_or(0));
        c.chunk.emit(one.index);
        c.chunk.emit(a.index);
        c.release(one);
        Ok(Slot::value(reg, is_temp))
    })
}

fn binary_fixed(
    c: &mut Compiler<'_>,
    args: &[Value],
    opts: FormOptions,
    opcode: u8,
    swap: bool,
) -> Result<Slot, CompileError> {
    let [lhs, rhs] = args else {
        return Err(CompileError::InvalidSyntax);
    };
    let a = c.compile_expr(*lhs, FormOptions::new())?;
    let b = c.compile_expr(*rhs, FormOptions::new())?;
    let (first, second) = if swap { (b, a) } else { (a, b) };
    let (reg, is_temp) = c.materialize(opts);
    c.chunk.emit_header(opcode, u8::try_from(reg).unwrap_or(0));
    c.chunk.emit(first.index);
    c.chunk.emit(second.index);
    c.release(a);
    c.release(b);
    Ok(Slot::value(reg, is_temp))
}

fn eq(c: &mut Compiler<'_>, args: &[Value], opts: FormOptions) -> Result<Slot, CompileError> {
    binary_fixed(c, args, opts, op::EQ, false)
}

fn lt(c: &mut Compiler<'_>, args: &[Value], opts: FormOptions) -> Result<Slot, CompileError> {
    binary_fixed(c, args, opts, op::LT, false)
}

fn le(c: &mut Compiler<'_>, args: &[Value], opts: FormOptions) -> Result<Slot, CompileError> {
    binary_fixed(c, args, opts, op::LE, false)
}

fn gt(c: &mut Compiler<'_>, args: &[Value], opts: FormOptions) -> Result<Slot, CompileError> {
    binary_fixed(c, args, opts, op::LT, true)
}

fn ge(c: &mut Compiler<'_>, args: &[Value], opts: FormOptions) -> Result<Slot, CompileError> {
    binary_fixed(c, args, opts, op::LE, true)
}

fn not(c: &mut Compiler<'_>, args: &[Value], opts: FormOptions) -> Result<Slot, CompileError> {
    if args.is_empty() {
        return c.compile_expr(Value::Bool(false), opts);
    }
    let [v] = args else {
        return Err(CompileError::InvalidSyntax);
    };
    let a = c.compile_expr(*v, FormOptions::new())?;
    let (reg, is_temp) = c.materialize(opts);
    c.chunk.emit_header(op::NOT, u8::try_from(reg).unwrap_or(0));
    c.chunk.emit(a.index);
    c.release(a);
    Ok(Slot::value(reg, is_temp))
}

fn get(c: &mut Compiler<'_>, args: &[Value], opts: FormOptions) -> Result<Slot, CompileError> {
    let [ds, key] = args else {
        return Err(CompileError::InvalidSyntax);
    };
    let a = c.compile_expr(*ds, FormOptions::new())?;
    let b = c.compile_expr(*key, FormOptions::new())?;
    let (reg, is_temp) = c.materialize(opts);
    c.chunk.emit_header(op::GET, u8::try_from(reg).unwrap_or(0));
    c.chunk.emit(a.index);
    c.chunk.emit(b.index);
    c.release(a);
    c.release(b);
    Ok(Slot::value(reg, is_temp))
}

fn set(c: &mut Compiler<'_>, args: &[Value], opts: FormOptions) -> Result<Slot, CompileError> {
    let [ds, key, val] = args else {
        return Err(CompileError::InvalidSyntax);
    };
    let a = c.compile_expr(*ds, FormOptions::new())?;
    let b = c.compile_expr(*key, FormOptions::new())?;
    let v = c.compile_expr(*val, FormOptions::new())?;
    c.chunk.emit_header(op::SET, 0);
    c.chunk.emit(a.index);
    c.chunk.emit(b.index);
    c.chunk.emit(v.index);
    c.release(b);
    c.release(v);
    // `set` returns the container, so `a` is the result rather than a
    // temporary to be freed here.
    if let Some(target) = opts.target {
        if target != a.index {
            c.chunk.emit_header(op::MOVE, u8::try_from(target).unwrap_or(0));
            c.chunk.emit(a.index);
            c.release(a);
            return Ok(Slot::value(target, false));
        }
    }
    Ok(a)
}

fn array(c: &mut Compiler<'_>, args: &[Value], opts: FormOptions) -> Result<Slot, CompileError> {
    if args.len() > super::MAX_ARGS as usize {
        return Err(CompileError::TooManyArguments);
    }
    let slots = compile_args(c, args)?;
    let (reg, is_temp) = c.materialize(opts);
    c.chunk.emit_header(op::ARR, u8::try_from(reg).unwrap_or(0));
    c.chunk.emit(u16::try_from(slots.len()).unwrap_or(0));
    for s in &slots {
        c.chunk.emit(s.index);
    }
    release_all(c, slots);
    Ok(Slot::value(reg, is_temp))
}

fn dict(c: &mut Compiler<'_>, args: &[Value], opts: FormOptions) -> Result<Slot, CompileError> {
    if args.len() % 2 != 0 {
        return Err(CompileError::InvalidSyntax);
    }
    if args.len() > super::MAX_ARGS as usize {
        return Err(CompileError::TooManyArguments);
    }
    let slots = compile_args(c, args)?;
    let (reg, is_temp) = c.materialize(opts);
    c.chunk.emit_header(op::DIC, u8::try_from(reg).unwrap_or(0));
    c.chunk.emit(u16::try_from(slots.len()).unwrap_or(0));
    for s in &slots {
        c.chunk.emit(s.index);
    }
    release_all(c, slots);
    Ok(Slot::value(reg, is_temp))
}

fn if_form(c: &mut Compiler<'_>, args: &[Value], opts: FormOptions) -> Result<Slot, CompileError> {
    let (cond, then_branch, else_branch) = match args {
        [cond, then_branch] => (*cond, *then_branch, None),
        [cond, then_branch, else_branch] => (*cond, *then_branch, Some(*else_branch)),
        _ => return Err(CompileError::InvalidSyntax),
    };

    let cond_slot = c.compile_expr(cond, FormOptions::new())?;
    c.chunk
        .emit_header(op::JIF, u8::try_from(cond_slot.index).unwrap_or(0));
    let jif_at = c.chunk.pos();
    c.chunk.emit_i32(0);
    c.release(cond_slot);

    if opts.is_tail {
        // Each branch returns directly; neither needs a jump past the other.
        let tail_opts = FormOptions::new().tail(true);
        let then_slot = c.compile_expr(then_branch, tail_opts)?;
        if !then_slot.has_returned {
            c.emit_return(then_slot);
        }

        c.chunk.patch_jump(jif_at);

        let else_slot = match else_branch {
            Some(e) => c.compile_expr(e, tail_opts)?,
            None => c.compile_expr(Value::Nil, tail_opts)?,
        };
        if !else_slot.has_returned {
            c.emit_return(else_slot);
        }
        return Ok(Slot::returned());
    }

    if opts.result_unused {
        let unused = FormOptions::new().unused();
        let then_slot = c.compile_expr(then_branch, unused)?;
        c.release(then_slot);
        c.chunk.emit_header(op::JMP, 0);
        let jmp_at = c.chunk.pos();
        c.chunk.emit_i32(0);

        c.chunk.patch_jump(jif_at);
        let else_slot = match else_branch {
            Some(e) => c.compile_expr(e, unused)?,
            None => Slot::nil(),
        };
        c.release(else_slot);
        c.chunk.patch_jump(jmp_at);
        return Ok(Slot::nil());
    }

    let (reg, is_temp) = c.materialize(opts);
    let branch_opts = FormOptions::new().with_target(reg);

    let then_slot = c.compile_expr(then_branch, branch_opts)?;
    c.release(then_slot);
    c.chunk.emit_header(op::JMP, 0);
    let jmp_at = c.chunk.pos();
    c.chunk.emit_i32(0);

    c.chunk.patch_jump(jif_at);

    let else_slot = match else_branch {
        Some(e) => c.compile_expr(e, branch_opts)?,
        None => c.compile_expr(Value::Nil, branch_opts)?,
    };
    c.release(else_slot);

    c.chunk.patch_jump(jmp_at);

    Ok(Slot::value(reg, is_temp))
}

fn while_form(
    c: &mut Compiler<'_>,
    args: &[Value],
    opts: FormOptions,
) -> Result<Slot, CompileError> {
    let Some((&cond, body)) = args.split_first() else {
        return Err(CompileError::InvalidSyntax);
    };

    c.scopes.push(false);
    let loop_start = c.chunk.pos();
    let cond_slot = c.compile_expr(cond, FormOptions::new())?;
    c.chunk.emit_header(op::JIF, u8::try_from(cond_slot.index).unwrap_or(0));
    let exit_at = c.chunk.pos();
    c.chunk.emit_i32(0);
    c.release(cond_slot);

    for &stmt in body {
        let slot = c.compile_expr(stmt, FormOptions::new().unused())?;
        c.release(slot);
    }

    let back_offset = i32::try_from(loop_start as isize - (c.chunk.pos() as isize + 2))
        .map_err(|_| CompileError::ExpressionTooComplex)?;
    c.chunk.emit_header(op::JMP, 0);
    c.chunk.emit_i32(back_offset);
    c.chunk.patch_jump(exit_at);
    c.scopes.pop();

    if opts.result_unused {
        Ok(Slot::nil())
    } else {
        c.compile_expr(Value::Nil, opts)
    }
}

fn do_form(c: &mut Compiler<'_>, args: &[Value], opts: FormOptions) -> Result<Slot, CompileError> {
    if args.is_empty() {
        return if opts.result_unused {
            Ok(Slot::nil())
        } else {
            c.compile_expr(Value::Nil, opts)
        };
    }
    c.scopes.push(false);
    let (last, init) = args.split_last().expect("checked non-empty above");
    for &stmt in init {
        let slot = c.compile_expr(stmt, FormOptions::new().unused())?;
        c.release(slot);
    }
    let result = c.compile_expr(*last, opts);
    c.scopes.pop();
    result
}

fn quote(c: &mut Compiler<'_>, args: &[Value], opts: FormOptions) -> Result<Slot, CompileError> {
    let [v] = args else {
        return Err(CompileError::InvalidSyntax);
    };
    if opts.result_unused {
        return Ok(Slot::nil());
    }
    let (reg, is_temp) = c.materialize(opts);
    let idx = c.scopes.add_constant(*v, c.heap);
    c.chunk.emit_header(op::LOAD_CONST, u8::try_from(reg).unwrap_or(0));
    c.chunk.emit(idx);
    Ok(Slot::value(reg, is_temp))
}

fn assign(c: &mut Compiler<'_>, args: &[Value], opts: FormOptions) -> Result<Slot, CompileError> {
    let [Value::Symbol(sym), expr] = args else {
        return Err(CompileError::InvalidSyntax);
    };
    let name = c.symbol_name(*sym);

    if let Some((level, idx)) = c.scopes.resolve(&name) {
        if level == 0 {
            let slot = c.compile_expr(*expr, FormOptions::new().with_target(idx))?;
            return finish_assign(c, slot, idx, opts);
        }
        c.scopes.mark_captures();
        let value = c.compile_expr(*expr, FormOptions::new())?;
        c.chunk
            .emit_header(op::STORE_UPVALUE, u8::try_from(value.index).unwrap_or(0));
        c.chunk.emit(u16::try_from(level).unwrap_or(u16::MAX));
        c.chunk.emit(idx);
        return finish_assign(c, value, value.index, opts);
    }

    let idx = c.scopes.declare_local(&name);
    let slot = c.compile_expr(*expr, FormOptions::new().with_target(idx))?;
    finish_assign(c, slot, idx, opts)
}

fn finish_assign(
    c: &mut Compiler<'_>,
    slot: Slot,
    value_reg: u16,
    opts: FormOptions,
) -> Result<Slot, CompileError> {
    let _ = slot;
    if opts.result_unused {
        return Ok(Slot::nil());
    }
    match opts.target {
        Some(target) if target != value_reg => {
            c.chunk.emit_header(op::MOVE, u8::try_from(target).unwrap_or(0));
            c.chunk.emit(value_reg);
            Ok(Slot::value(target, false))
        }
        _ => Ok(Slot::value(value_reg, false)),
    }
}

/// `(fn [params...] body...)` or the named form `(fn name [params...]
/// body...)` (the name is accepted for readability but not bound - a named
/// function that wants to recurse must be bound with `:=` first, matching
/// the resolution order: locals before any implicit self-reference).
fn fn_form(c: &mut Compiler<'_>, args: &[Value], opts: FormOptions) -> Result<Slot, CompileError> {
    let rest = if matches!(args.first(), Some(Value::Symbol(_))) {
        &args[1..]
    } else {
        args
    };
    let Some((&params_expr, body)) = rest.split_first() else {
        return Err(CompileError::InvalidSyntax);
    };
    let Value::Array(params_ref) = params_expr else {
        return Err(CompileError::InvalidSyntax);
    };
    let params = c.array_items(params_ref);

    let mut param_names = Vec::with_capacity(params.len());
    let mut variadic = false;
    for (i, &p) in params.iter().enumerate() {
        match p {
            Value::Symbol(s) => {
                let name = c.symbol_name(s);
                if name == "&" {
                    variadic = true;
                    continue;
                }
                param_names.push(name);
            }
            _ => return Err(CompileError::InvalidSyntax),
        }
        let _ = i;
    }
    let arity = u8::try_from(param_names.len().saturating_sub(usize::from(variadic)))
        .map_err(|_| CompileError::TooManyArguments)?;

    c.scopes.push(true);
    for name in &param_names {
        c.scopes.declare_local(name);
    }
    let saved_pos = c.chunk.pos();

    if body.is_empty() {
        c.emit_return(Slot::nil());
    } else {
        let (last, init) = body.split_last().expect("checked non-empty above");
        for &stmt in init {
            let slot = c.compile_expr(stmt, FormOptions::new().unused())?;
            c.release(slot);
        }
        let result = c.compile_expr(*last, FormOptions::new().tail(true))?;
        if !result.has_returned {
            c.emit_return(result);
        }
    }

    let body_code = c.chunk.code.split_off(saved_pos);
    let scope = c.scopes.pop();

    // `scope.literals` is this function's own pool - started empty when the
    // scope was pushed above, so it holds exactly the literals `body_code`'s
    // `LOAD_CONST`/`MAKE_CLOSURE` instructions reference, nothing a sibling
    // function added to its own pool.
    let def = FuncDefObj {
        arity,
        variadic,
        num_locals: scope.frame_size.max(u16::from(arity)),
        bytecode: body_code,
        literals: scope.literals,
    };
    let def_ref = c.heap.alloc_funcdef(def);
    // Registered as a literal in the *enclosing* scope, now current again
    // after the pop above.
    let literal_idx = c.scopes.add_constant(Value::FuncDef(def_ref), c.heap);

    if opts.result_unused {
        return Ok(Slot::nil());
    }
    let (reg, is_temp) = c.materialize(opts);
    c.chunk
        .emit_header(op::MAKE_CLOSURE, u8::try_from(reg).unwrap_or(0));
    c.chunk.emit(literal_idx);
    Ok(Slot::value(reg, is_temp))
}

/// Push a block scope and, if `binding` names a single-symbol bracket vector
/// `[err]`, bind it to the already-allocated `error_slot` register rather
/// than drawing a fresh one - the VM writes the raised value there before
/// jumping to the handler.
fn bind_error_symbol(
    c: &mut Compiler<'_>,
    binding: Option<GcRef>,
    error_slot: u16,
) -> Result<(), CompileError> {
    c.scopes.push(false);
    if let Some(binding_ref) = binding {
        let items = c.array_items(binding_ref);
        let [Value::Symbol(s)] = items.as_slice() else {
            return Err(CompileError::InvalidSyntax);
        };
        let name = c.symbol_name(*s);
        c.scopes.declare_local_at(&name, error_slot);
    }
    Ok(())
}

/// `(try protected handler)` or `(try protected [err] handler)`. Installs a
/// handler before `protected`; if evaluating it raises, the VM writes the
/// raised value (converted per `error_to_value`) into a fresh register and
/// jumps to `handler`, with `err` (if given) bound to that register. Both
/// branches land in the same target register, mirroring `if`'s two-branch
/// shape.
fn try_form(c: &mut Compiler<'_>, args: &[Value], opts: FormOptions) -> Result<Slot, CompileError> {
    let (protected, binding, handler) = match args {
        [protected, handler] => (*protected, None, *handler),
        [protected, Value::Array(r), handler] => (*protected, Some(*r), *handler),
        _ => return Err(CompileError::InvalidSyntax),
    };

    let error_slot = c.scopes.get_local();
    c.chunk
        .emit_header(op::SET_HANDLER, u8::try_from(error_slot).unwrap_or(0));
    let handler_at = c.chunk.pos();
    c.chunk.emit_i32(0);

    if opts.is_tail {
        let tail_opts = FormOptions::new().tail(true);
        let protected_slot = c.compile_expr(protected, tail_opts)?;
        if !protected_slot.has_returned {
            c.emit_return(protected_slot);
        }

        c.chunk.patch_jump(handler_at);
        bind_error_symbol(c, binding, error_slot)?;
        let handler_slot = c.compile_expr(handler, tail_opts)?;
        if !handler_slot.has_returned {
            c.emit_return(handler_slot);
        }
        c.scopes.pop();
        c.scopes.free_local(error_slot);
        return Ok(Slot::returned());
    }

    if opts.result_unused {
        let unused = FormOptions::new().unused();
        let protected_slot = c.compile_expr(protected, unused)?;
        c.release(protected_slot);
        c.chunk.emit_header(op::CLEAR_HANDLER, 0);
        c.chunk.emit_header(op::JMP, 0);
        let jmp_at = c.chunk.pos();
        c.chunk.emit_i32(0);

        c.chunk.patch_jump(handler_at);
        bind_error_symbol(c, binding, error_slot)?;
        let handler_slot = c.compile_expr(handler, unused)?;
        c.release(handler_slot);
        c.scopes.pop();

        c.chunk.patch_jump(jmp_at);
        c.scopes.free_local(error_slot);
        return Ok(Slot::nil());
    }

    let (reg, is_temp) = c.materialize(opts);
    let branch_opts = FormOptions::new().with_target(reg);

    let protected_slot = c.compile_expr(protected, branch_opts)?;
    c.release(protected_slot);
    c.chunk.emit_header(op::CLEAR_HANDLER, 0);
    c.chunk.emit_header(op::JMP, 0);
    let jmp_at = c.chunk.pos();
    c.chunk.emit_i32(0);

    c.chunk.patch_jump(handler_at);
    bind_error_symbol(c, binding, error_slot)?;
    let handler_slot = c.compile_expr(handler, branch_opts)?;
    c.release(handler_slot);
    c.scopes.pop();

    c.chunk.patch_jump(jmp_at);
    c.scopes.free_local(error_slot);

    Ok(Slot::value(reg, is_temp))
}
