// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Error kinds shared across the reader, compiler and VM.
//!
//! Each stage owns its own error enum so callers can match narrowly; `LarkError`
//! is the umbrella type the CLI and REPL report through.

use thiserror::Error;

use crate::compiler::CompileError;
use crate::reader::ReadError;
use crate::vm::RuntimeError;

/// Top-level error returned by the CLI and REPL driver.
#[derive(Debug, Error)]
pub enum LarkError {
    /// Failed to read source text into an AST.
    #[error("read error: {0}")]
    Read(#[from] ReadError),

    /// Failed to compile an AST into bytecode.
    #[error("compile error: {0}")]
    Compile(#[from] CompileError),

    /// Failed during bytecode execution.
    #[error("runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    /// Failed to load a source file.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
