// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Runtime configuration, shared by the library entry points and the `lark`
//! CLI's flags.

use clap::Args;

use crate::value::Value;

/// Top-level bindings visible to every compile without being declared by the
/// program itself - the natural place for an embedder to register native
/// functions (see `gc::Heap::register_native`) or other host globals.
/// Resolved by the compiler as literal constants at the point a symbol would
/// otherwise be unbound, so a binding added after a closure has already
/// compiled over that name has no effect on it.
#[derive(Debug, Clone, Default)]
pub struct RootEnv {
    bindings: Vec<(String, Value)>,
}

impl RootEnv {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `name` to `value`, replacing any existing binding of the same
    /// name.
    pub fn bind(&mut self, name: &str, value: Value) {
        if let Some(slot) = self.bindings.iter_mut().find(|(n, _)| n == name) {
            slot.1 = value;
        } else {
            self.bindings.push((name.to_string(), value));
        }
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Value> {
        self.bindings.iter().find(|(n, _)| n == name).map(|&(_, v)| v)
    }
}

/// Tunables for one `Heap`/`Vm` instance.
#[derive(Debug, Clone, Args)]
pub struct VmConfig {
    /// Bytes allocated between collection cycles. `0` collects on every
    /// opcode - a "stress" setting useful for shaking out GC bugs, not for
    /// normal use.
    #[arg(long, default_value_t = 1 << 20)]
    pub memory_interval: usize,

    /// Maximum live call-frame depth before raising a stack-overflow error.
    #[arg(long)]
    pub max_call_depth: Option<usize>,

    /// Top-level bindings available to every compile, beyond what the
    /// program itself declares. Not a CLI flag - populated programmatically
    /// by an embedder before compiling.
    #[arg(skip)]
    pub root_env: RootEnv,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            memory_interval: 1 << 20,
            max_call_depth: None,
            root_env: RootEnv::default(),
        }
    }
}

#[cfg(test)]
mod config_test {
    use super::*;

    #[test]
    fn default_is_sane() {
        let config = VmConfig::default();
        assert!(config.memory_interval > 0);
        assert!(config.max_call_depth.is_none());
        assert!(config.root_env.get("anything").is_none());
    }

    #[test]
    fn root_env_rebinds_in_place() {
        let mut env = RootEnv::new();
        env.bind("x", Value::Number(1.0));
        env.bind("x", Value::Number(2.0));
        assert_eq!(env.get("x"), Some(Value::Number(2.0)));
        assert_eq!(env.get("y"), None);
    }
}
