// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Command-line entry point for the `lark` language: run a source file,
//! disassemble it, or start an interactive session.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use lark_vm::{compiler, gc::Heap, reader, repl, vm::Vm, VmConfig};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "lark", version, about = "A small Lisp-family language")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Compile and run a source file.
    Run {
        path: PathBuf,
        #[command(flatten)]
        config: VmConfig,
    },
    /// Start an interactive read-eval-print loop.
    Repl {
        #[command(flatten)]
        config: VmConfig,
    },
    /// Compile a source file and print its disassembled bytecode.
    Disasm { path: PathBuf },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Run { path, config } => run_file(&path, &config),
        Command::Repl { config } => repl::run(&config),
        Command::Disasm { path } => disasm_file(&path),
    }
}

fn run_file(path: &PathBuf, config: &VmConfig) -> anyhow::Result<()> {
    let source = std::fs::read_to_string(path)?;
    let mut heap = Heap::new(config.memory_interval);
    let exprs = reader::read_all(&source, &mut heap)?;
    let mut result = lark_vm::Value::Nil;
    for expr in exprs {
        let def = compiler::compile(expr, &mut heap, &config.root_env)?;
        result = Vm::execute(&mut heap, def, config)?;
    }
    println!("{}", result.display(&heap));
    Ok(())
}

fn disasm_file(path: &PathBuf) -> anyhow::Result<()> {
    let source = std::fs::read_to_string(path)?;
    let config = VmConfig::default();
    let mut heap = Heap::new(config.memory_interval);
    let exprs = reader::read_all(&source, &mut heap)?;
    for expr in exprs {
        let def = compiler::compile(expr, &mut heap, &config.root_env)?;
        println!("{}", compiler::disassemble(&def));
    }
    Ok(())
}
