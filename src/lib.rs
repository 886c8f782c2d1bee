// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Lark - a small Lisp-family language.
//!
//! This crate contains the three pieces that make up the language runtime:
//!
//! - a single-pass compiler that lowers a `Value` AST into register-based
//!   bytecode (`compiler`, `bytecode`),
//! - a register-based bytecode VM (`vm`),
//! - a tracing mark-and-sweep garbage collector that backs every heap
//!   allocation made by the other two (`gc`, `container`, `value`).
//!
//! A small reader (lexer + parser) and REPL are included as ambient tooling
//! so the language can be driven from source text on the command line; they
//! are not part of the compiler/VM/GC core.

pub mod bytecode;
pub mod compiler;
pub mod config;
pub mod container;
pub mod error;
pub mod gc;
pub mod reader;
pub mod repl;
pub mod value;
pub mod vm;

pub use config::VmConfig;
pub use error::LarkError;
pub use gc::Heap;
pub use value::Value;
pub use vm::Vm;

/// Crate version, taken from the build's Cargo metadata.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
