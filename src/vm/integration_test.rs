// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! End-to-end tests driving literal source text through the reader, the
//! compiler and the VM - the same path the REPL and `lark run` use.

use super::*;
use crate::config::RootEnv;
use crate::gc::{FuncObj, HeapObject, ThreadStatus};
use crate::{compiler, reader};

fn eval(source: &str) -> Result<Value, RuntimeError> {
    let config = VmConfig::default();
    let mut heap = Heap::new(config.memory_interval);
    let expr = reader::read_one(source, &mut heap).expect("read");
    let def = compiler::compile(expr, &mut heap, &config.root_env).expect("compile");
    Vm::execute(&mut heap, def, &config)
}

#[test]
fn sums_a_variadic_call() {
    assert_eq!(eval("(+ 1 2 3)"), Ok(Value::Number(6.0)));
}

#[test]
fn do_block_threads_bindings() {
    assert_eq!(
        eval("(do (:= x 10) (:= y 20) (+ x y))"),
        Ok(Value::Number(30.0))
    );
}

#[test]
fn nested_closures_capture_their_environment() {
    let result = eval(
        "(do (:= make-adder (fn [n] (fn [x] (+ x n))))
             (:= add5 (make-adder 5))
             (add5 37))",
    );
    assert_eq!(result, Ok(Value::Number(42.0)));
}

#[test]
fn tail_recursive_factorial() {
    let result = eval(
        "(do (:= fact (fn [n acc] (if (= n 0) acc (fact (- n 1) (* acc n)))))
             (fact 10 1))",
    );
    assert_eq!(result, Ok(Value::Number(3_628_800.0)));
}

#[test]
fn dict_get_and_set_roundtrip() {
    let result = eval(
        "(do (:= d {\"a\" 1 \"b\" 2})
             (set d \"a\" 99)
             (+ (get d \"a\") (get d \"b\")))",
    );
    assert_eq!(result, Ok(Value::Number(101.0)));
}

#[test]
fn if_picks_the_else_branch() {
    let config = VmConfig::default();
    let mut heap = Heap::new(config.memory_interval);
    let expr = reader::read_one(r#"(if (< 3 2) "no" "yes")"#, &mut heap).expect("read");
    let def = compiler::compile(expr, &mut heap, &config.root_env).expect("compile");
    let result = Vm::execute(&mut heap, def, &config).expect("run");
    assert_eq!(result.display(&heap), "\"yes\"");
}

#[test]
fn division_by_zero_is_a_runtime_error() {
    assert_eq!(eval("(/ 1 0)"), Err(RuntimeError::DivisionByZero));
}

#[test]
fn calling_a_number_is_not_callable() {
    assert!(matches!(
        eval("(5 1 2)"),
        Err(RuntimeError::NotCallable { .. })
    ));
}

#[test]
fn array_index_out_of_bounds_is_reported() {
    assert!(matches!(
        eval("(get [1 2 3] 10)"),
        Err(RuntimeError::IndexOutOfBounds { .. })
    ));
}

#[test]
fn tail_call_does_not_grow_the_frame_stack() {
    let config = VmConfig::default();
    let mut heap = Heap::new(config.memory_interval);
    let expr = reader::read_one(
        "(do (:= loop (fn [n] (if (= n 0) n (loop (- n 1))))) (loop 20000))",
        &mut heap,
    )
    .expect("read");
    let def = compiler::compile(expr, &mut heap, &config.root_env).expect("compile");
    let def_ref = heap.alloc_funcdef(def);
    let func_ref = heap.alloc_func(FuncObj {
        def: def_ref,
        env: None,
        parent: None,
    });
    let mut thread = crate::gc::ThreadObj::new();
    thread.status = ThreadStatus::Alive;
    let thread_ref = heap.alloc_thread(thread);

    let result = Vm::call_in_thread(&mut heap, thread_ref, func_ref, &[], &config);
    assert_eq!(result, Ok(Value::Number(0.0)));

    let HeapObject::Thread(t) = heap.get(thread_ref) else {
        unreachable!()
    };
    assert!(
        t.frames.len() <= 1,
        "tail call grew the frame stack to {}",
        t.frames.len()
    );
}

fn double_native(_heap: &mut Heap, args: &[Value]) -> Result<Value, Value> {
    match args {
        [Value::Number(n)] => Ok(Value::Number(n * 2.0)),
        _ => Err(Value::Nil),
    }
}

#[test]
fn native_function_dispatches_through_a_root_env_binding() {
    let mut config = VmConfig::default();
    let mut heap = Heap::new(config.memory_interval);
    let native_value = heap.register_native(double_native);
    config.root_env.bind("double", native_value);

    let expr = reader::read_one("(double 21)", &mut heap).expect("read");
    let def = compiler::compile(expr, &mut heap, &config.root_env).expect("compile");
    let result = Vm::execute(&mut heap, def, &config);
    assert_eq!(result, Ok(Value::Number(42.0)));
}

#[test]
fn native_function_dispatches_in_tail_position() {
    let mut config = VmConfig::default();
    let mut heap = Heap::new(config.memory_interval);
    let native_value = heap.register_native(double_native);
    config.root_env.bind("double", native_value);

    let expr = reader::read_one("(fn [n] (double n))", &mut heap).expect("read");
    let def = compiler::compile(expr, &mut heap, &config.root_env).expect("compile");
    let def_ref = heap.alloc_funcdef(def);
    let func_ref = heap.alloc_func(FuncObj {
        def: def_ref,
        env: None,
        parent: None,
    });
    let mut thread = crate::gc::ThreadObj::new();
    thread.status = ThreadStatus::Alive;
    let thread_ref = heap.alloc_thread(thread);
    let result = Vm::call_in_thread(&mut heap, thread_ref, func_ref, &[Value::Number(4.0)], &config);
    assert_eq!(result, Ok(Value::Number(8.0)));
}

#[test]
fn root_env_binding_resolves_an_otherwise_unbound_symbol() {
    let config = VmConfig::default();
    let mut heap = Heap::new(config.memory_interval);
    let mut root_env = RootEnv::new();
    root_env.bind("answer", Value::Number(42.0));

    let expr = reader::read_one("answer", &mut heap).expect("read");
    let def = compiler::compile(expr, &mut heap, &root_env).expect("compile");
    let result = Vm::execute(&mut heap, def, &config);
    assert_eq!(result, Ok(Value::Number(42.0)));
}

#[test]
fn try_returns_the_protected_value_when_nothing_raises() {
    assert_eq!(eval("(try 41 [e] 99)"), Ok(Value::Number(41.0)));
}

#[test]
fn try_runs_the_handler_on_error() {
    assert_eq!(eval("(try (/ 1 0) [e] 99)"), Ok(Value::Number(99.0)));
}

#[test]
fn try_without_a_binding_still_runs_the_handler() {
    assert_eq!(eval("(try (/ 1 0) 99)"), Ok(Value::Number(99.0)));
}

#[test]
fn try_binds_the_error_value_in_the_handler() {
    assert_eq!(
        eval(r#"(try (/ 1 0) [e] (if (= e nil) 0 1))"#),
        Ok(Value::Number(1.0))
    );
}

#[test]
fn try_catches_an_error_raised_inside_a_called_function() {
    let result = eval("(do (:= boom (fn [] (/ 1 0))) (try (boom) [e] 99))");
    assert_eq!(result, Ok(Value::Number(99.0)));
}
