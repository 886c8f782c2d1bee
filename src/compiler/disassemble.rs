// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Debug disassembler: prints a `FuncDefObj`'s bytecode mnemonically plus
//! its literal pool. Used by the `lark disasm` CLI subcommand and by tests
//! that assert on emitted instruction shapes.

use core::fmt::Write as _;

use crate::bytecode::{decode_f64, decode_i32, op};
use crate::gc::FuncDefObj;

#[must_use]
pub fn disassemble(def: &FuncDefObj) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "funcdef(arity={}, variadic={}, locals={})",
        def.arity, def.variadic, def.num_locals
    );
    let code = &def.bytecode;
    let mut pc = 0usize;
    while pc < code.len() {
        let word = code[pc];
        let opcode = (word & 0xFF) as u8;
        let a = (word >> 8) as u8;
        let start = pc;
        pc += 1;
        let mnemonic = mnemonic(opcode);
        let _ = write!(out, "{start:04}  {mnemonic:<14} a={a}");
        pc += print_operands(&mut out, opcode, code, pc);
        let _ = writeln!(out);
    }
    if !def.literals.is_empty() {
        let _ = writeln!(out, "constants:");
        for (i, lit) in def.literals.iter().enumerate() {
            let _ = writeln!(out, "  [{i}] {lit:?}");
        }
    }
    out
}

fn mnemonic(opcode: u8) -> &'static str {
    match opcode {
        op::LOAD_0 => "LOAD_0",
        op::LOAD_1 => "LOAD_1",
        op::LOAD_FALSE => "LOAD_FALSE",
        op::LOAD_TRUE => "LOAD_TRUE",
        op::LOAD_NIL => "LOAD_NIL",
        op::LOAD_I16 => "LOAD_I16",
        op::LOAD_I32 => "LOAD_I32",
        op::LOAD_F64 => "LOAD_F64",
        op::LOAD_CONST => "LOAD_CONST",
        op::LOAD_UPVALUE => "LOAD_UPVALUE",
        op::STORE_UPVALUE => "STORE_UPVALUE",
        op::MOVE => "MOVE",
        op::MAKE_CLOSURE => "MAKE_CLOSURE",
        op::ADD => "ADD",
        op::SUB => "SUB",
        op::MUL => "MUL",
        op::DIV => "DIV",
        op::ADD_N => "ADD_N",
        op::SUB_N => "SUB_N",
        op::MUL_N => "MUL_N",
        op::DIV_N => "DIV_N",
        op::NOT => "NOT",
        op::EQ => "EQ",
        op::LT => "LT",
        op::LE => "LE",
        op::JIF => "JIF",
        op::JMP => "JMP",
        op::CALL => "CALL",
        op::TAIL_CALL => "TAIL_CALL",
        op::RETURN => "RETURN",
        op::RETURN_NIL => "RETURN_NIL",
        op::ARR => "ARR",
        op::DIC => "DIC",
        op::GET => "GET",
        op::SET => "SET",
        op::SET_HANDLER => "SET_HANDLER",
        op::CLEAR_HANDLER => "CLEAR_HANDLER",
        _ => "INVALID",
    }
}

/// Prints this instruction's operand words and returns how many words (past
/// the header) were consumed.
fn print_operands(out: &mut String, opcode: u8, code: &[u16], pc: usize) -> usize {
    match opcode {
        op::LOAD_0
        | op::LOAD_1
        | op::LOAD_FALSE
        | op::LOAD_TRUE
        | op::LOAD_NIL
        | op::RETURN_NIL
        | op::CLEAR_HANDLER => 0,
        op::LOAD_I16 | op::LOAD_CONST | op::NOT | op::RETURN | op::MAKE_CLOSURE => {
            let _ = write!(out, " {}", code[pc]);
            1
        }
        op::LOAD_I32 => {
            let _ = write!(out, " {}", decode_i32(code[pc], code[pc + 1]));
            2
        }
        op::LOAD_F64 => {
            let words = [code[pc], code[pc + 1], code[pc + 2], code[pc + 3]];
            let _ = write!(out, " {}", decode_f64(words));
            4
        }
        op::LOAD_UPVALUE | op::STORE_UPVALUE | op::ADD | op::SUB | op::MUL | op::DIV | op::EQ
        | op::LT | op::LE | op::MOVE | op::GET => {
            let _ = write!(out, " {} {}", code[pc], code[pc + 1]);
            2
        }
        op::JIF | op::JMP | op::SET_HANDLER => {
            let offset = decode_i32(code[pc], code[pc + 1]);
            let _ = write!(out, " offset={offset}");
            2
        }
        op::SET => {
            let _ = write!(out, " {} {} {}", code[pc], code[pc + 1], code[pc + 2]);
            3
        }
        op::ADD_N | op::SUB_N | op::MUL_N | op::DIV_N | op::ARR | op::DIC => {
            let count = code[pc] as usize;
            let _ = write!(out, " count={count}");
            for reg in &code[pc + 1..pc + 1 + count] {
                let _ = write!(out, " {reg}");
            }
            1 + count
        }
        op::CALL | op::TAIL_CALL => {
            let callee = code[pc];
            let argc = code[pc + 1] as usize;
            let _ = write!(out, " callee={callee} argc={argc}");
            for reg in &code[pc + 2..pc + 2 + argc] {
                let _ = write!(out, " {reg}");
            }
            2 + argc
        }
        _ => 0,
    }
}
