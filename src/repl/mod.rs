// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! An interactive read-eval-print loop.
//!
//! Each line is read, parsed, compiled and run against one persistent
//! `Heap`/`VmConfig` pair, so top-level state (allocations, GC pressure)
//! carries from one line to the next. Each line still gets its own `Vm`
//! thread - there is no notion of a persistent top-level environment.

use std::io::Write as _;

use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

use crate::config::VmConfig;
use crate::error::LarkError;
use crate::gc::Heap;
use crate::{compiler, reader, vm};

const PROMPT: &str = "lark> ";

/// Run an interactive session on stdin/stdout until EOF or `Ctrl-D`.
///
/// # Errors
///
/// Returns an error if the line editor itself fails (not for read/compile/
/// runtime errors in user input, which are printed and do not end the
/// session).
pub fn run(config: &VmConfig) -> anyhow::Result<()> {
    let mut editor = DefaultEditor::new()?;
    let mut heap = Heap::new(config.memory_interval);

    loop {
        match editor.readline(PROMPT) {
            Ok(line) => {
                if line.trim().is_empty() {
                    continue;
                }
                editor.add_history_entry(line.as_str())?;
                eval_print(&line, &mut heap, config);
            }
            Err(ReadlineError::Interrupted) => continue,
            Err(ReadlineError::Eof) => break,
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

/// Evaluate one line, printing either the resulting value or an error.
/// A failure here never aborts the session - only a single line is lost.
fn eval_print(line: &str, heap: &mut Heap, config: &VmConfig) {
    match eval_line(line, heap, config) {
        Ok(value) => println!("{}", value.display(heap)),
        Err(err) => eprintln!("{err}"),
    }
    let _ = std::io::stdout().flush();
}

fn eval_line(line: &str, heap: &mut Heap, config: &VmConfig) -> Result<crate::Value, LarkError> {
    let expr = reader::read_one(line, heap)?;
    let def = compiler::compile(expr, heap, &config.root_env)?;
    let value = vm::Vm::execute(heap, def, config)?;
    Ok(value)
}

/// Run a fixed batch of lines against one session, for use in tests - the
/// interactive loop reads from a terminal and can't be driven from `cargo
/// test` directly.
pub fn run_batch(lines: &[&str], config: &VmConfig) -> Vec<Result<crate::Value, LarkError>> {
    let mut heap = Heap::new(config.memory_interval);
    lines
        .iter()
        .map(|line| eval_line(line, &mut heap, config))
        .collect()
}

#[cfg(test)]
mod repl_test {
    use super::*;

    #[test]
    fn batch_runs_independent_lines() {
        let config = VmConfig::default();
        let results = run_batch(&["(+ 1 2 3)", "(* 6 7)"], &config);
        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        assert!(results[1].is_ok());
    }

    #[test]
    fn read_error_does_not_panic() {
        let config = VmConfig::default();
        let results = run_batch(&["(+ 1 2"], &config);
        assert!(results[0].is_err());
    }
}
