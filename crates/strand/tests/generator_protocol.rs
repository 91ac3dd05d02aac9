//! The generator state machine: advancing, sending, exhaustion and reentrancy.
//!
//! Bodies are written directly against `GeneratorScope`, the way host code
//! generated for a generator function would be.

use std::{cell::Cell, rc::Rc};

use pretty_assertions::assert_eq;
use strand::{CodeInfo, ExcType, GenStep, Object, RunResult, Runtime, RuntimeConfig, SimpleException, Value};

fn runtime() -> Runtime {
    Runtime::new(RuntimeConfig::default())
}

/// The integer a step yielded, or `None` if it exhausted.
fn yielded_int(step: RunResult<GenStep>) -> Option<i64> {
    match step.expect("step should not raise") {
        GenStep::Yielded(v) => Some(v.as_int().expect("yielded value should be an int")),
        GenStep::Exhausted(_) => None,
    }
}

// =============================================================================
// 1. Yield, yield, return
// =============================================================================

/// `yield 1; yield 2; return`: two values, then exhaustion on every further advance.
#[test]
fn two_yields_then_idempotent_exhaustion() {
    let mut rt = runtime();
    let entered = Rc::new(Cell::new(0));
    let counter = Rc::clone(&entered);
    let func = rt
        .generator_function(CodeInfo::new("two"), move |scope| {
            counter.set(counter.get() + 1);
            scope.yield_value(Value::Int(1))?;
            scope.yield_value(Value::Int(2))?;
            Ok(Value::None)
        })
        .unwrap();
    let generator = rt.call0(&func).unwrap();

    assert_eq!(rt.generator_state(&generator).unwrap(), "GEN_CREATED");
    assert_eq!(yielded_int(rt.advance(&generator)), Some(1));
    assert_eq!(rt.generator_state(&generator).unwrap(), "GEN_SUSPENDED");
    assert_eq!(yielded_int(rt.advance(&generator)), Some(2));
    assert_eq!(yielded_int(rt.advance(&generator)), None);
    assert_eq!(rt.generator_state(&generator).unwrap(), "GEN_CLOSED");
    assert_eq!(yielded_int(rt.advance(&generator)), None);
    assert_eq!(yielded_int(rt.advance(&generator)), None);
    assert_eq!(entered.get(), 1, "the body must run exactly once");

    rt.drop_value(generator);
    rt.drop_value(func);
}

/// `next()` maps exhaustion onto `None` instead of an error.
#[test]
fn next_reports_exhaustion_as_none() {
    let mut rt = runtime();
    let func = rt
        .generator_function(CodeInfo::new("count"), |scope| {
            for i in 0..3 {
                scope.yield_value(Value::Int(i))?;
            }
            Ok(Value::None)
        })
        .unwrap();
    let generator = rt.call0(&func).unwrap();
    let mut seen = Vec::new();
    while let Some(v) = rt.next(&generator).unwrap() {
        seen.push(v.as_int().unwrap());
    }
    assert_eq!(seen, vec![0, 1, 2]);
    assert!(rt.next(&generator).unwrap().is_none());
    rt.drop_value(generator);
    rt.drop_value(func);
}

// =============================================================================
// 2. Send
// =============================================================================

/// `x = yield 1; yield x + 1`: sending 41 yields 42.
#[test]
fn sent_value_becomes_yield_result() {
    let mut rt = runtime();
    let func = rt
        .generator_function(CodeInfo::new("echo_plus_one"), |scope| {
            let x = scope.yield_value(Value::Int(1))?;
            let Some(x) = x.as_int() else {
                return Err(SimpleException::new_msg(ExcType::TypeError, "expected an int").into());
            };
            scope.yield_value(Value::Int(x + 1))?;
            Ok(Value::None)
        })
        .unwrap();
    let generator = rt.call0(&func).unwrap();
    assert_eq!(yielded_int(rt.advance(&generator)), Some(1));
    assert_eq!(yielded_int(rt.send(&generator, Value::Int(41))), Some(42));
    assert_eq!(yielded_int(rt.advance(&generator)), None);
    rt.drop_value(generator);
    rt.drop_value(func);
}

/// Only `None` may be sent into a generator that has not started.
#[test]
fn non_none_send_to_fresh_generator_is_type_error() {
    let mut rt = runtime();
    let func = rt
        .generator_function(CodeInfo::new("g"), |scope| {
            scope.yield_value(Value::Int(1))?;
            Ok(Value::None)
        })
        .unwrap();
    let generator = rt.call0(&func).unwrap();

    let err = rt.send(&generator, Value::Int(5)).unwrap_err();
    let exc = rt.into_exception(err);
    assert_eq!(exc.exc_type(), ExcType::TypeError);
    assert_eq!(
        exc.message(),
        Some("can't send non-None value to a just-started generator")
    );

    // the failed send leaves the generator untouched
    assert_eq!(rt.generator_state(&generator).unwrap(), "GEN_CREATED");
    assert_eq!(yielded_int(rt.send(&generator, Value::None)), Some(1));
    rt.drop_value(generator);
    rt.drop_value(func);
}

/// The body's return value is reported with the exhaustion step.
#[test]
fn return_value_travels_with_exhaustion() {
    let mut rt = runtime();
    let func = rt
        .generator_function(CodeInfo::new("returns"), |scope| {
            scope.yield_value(Value::None)?;
            Ok(Value::Int(7))
        })
        .unwrap();
    let generator = rt.call0(&func).unwrap();
    assert!(matches!(rt.advance(&generator), Ok(GenStep::Yielded(Value::None))));
    match rt.advance(&generator).unwrap() {
        GenStep::Exhausted(v) => assert_eq!(v.as_int(), Some(7)),
        GenStep::Yielded(_) => panic!("expected exhaustion"),
    }
    rt.drop_value(generator);
    rt.drop_value(func);
}

/// Values sent in at each step are observed exactly as if the body never suspended,
/// even with another generator interleaved.
#[test]
fn interleaved_generators_keep_their_own_locals() {
    let mut rt = runtime();
    let code = CodeInfo::new("accumulate").params(&["step"]).locals(&["total"]);
    let func = rt
        .generator_function(code, |scope| {
            scope.set_local(1, Value::Int(0))?;
            loop {
                let step = scope.local(0)?.as_int().unwrap_or(0);
                let total = scope.local(1)?.as_int().unwrap_or(0) + step;
                scope.set_local(1, Value::Int(total))?;
                let sent = scope.yield_value(Value::Int(total))?;
                if sent.as_int() == Some(-1) {
                    return Ok(Value::Int(total));
                }
            }
        })
        .unwrap();
    let by_one = rt.call1(&func, Value::Int(1)).unwrap();
    let by_ten = rt.call1(&func, Value::Int(10)).unwrap();

    let mut observed = Vec::new();
    for _ in 0..3 {
        observed.push(yielded_int(rt.advance(&by_one)).unwrap());
        observed.push(yielded_int(rt.advance(&by_ten)).unwrap());
    }
    assert_eq!(observed, vec![1, 10, 2, 20, 3, 30]);

    match rt.send(&by_ten, Value::Int(-1)).unwrap() {
        GenStep::Exhausted(v) => assert_eq!(v.as_int(), Some(30)),
        GenStep::Yielded(_) => panic!("expected the accumulator to finish"),
    }
    assert_eq!(yielded_int(rt.advance(&by_one)), Some(4));

    rt.drop_value(by_one);
    rt.drop_value(by_ten);
    rt.drop_value(func);
}

// =============================================================================
// 3. Errors from the body
// =============================================================================

/// A body that raises immediately propagates the error once and is finished.
#[test]
fn immediate_raise_finishes_generator() {
    let mut rt = runtime();
    let func = rt
        .generator_function(CodeInfo::new("boom").filename("boom.py").first_line(3), |_scope| {
            Err(SimpleException::new_msg(ExcType::ValueError, "bad").into())
        })
        .unwrap();
    let generator = rt.call0(&func).unwrap();

    let err = rt.advance(&generator).unwrap_err();
    assert!(err.is_exception_type(ExcType::ValueError, rt.heap()));
    let exc = rt.into_exception(err);
    assert_eq!(exc.summary(), "ValueError: bad");
    assert_eq!(exc.traceback().len(), 1);
    assert_eq!(exc.traceback()[0].name, "boom");
    assert_eq!(exc.traceback()[0].filename, "boom.py");
    assert_eq!(exc.traceback()[0].line, 3);

    assert_eq!(rt.generator_state(&generator).unwrap(), "GEN_CLOSED");
    assert!(rt.advance(&generator).unwrap().is_exhausted());
    rt.drop_value(generator);
    rt.drop_value(func);
}

/// Raising `StopIteration` from the body is ordinary exhaustion, not an error.
#[test]
fn stop_iteration_from_body_is_exhaustion() {
    let mut rt = runtime();
    let func = rt
        .generator_function(CodeInfo::new("stops"), |scope| {
            scope.yield_value(Value::Int(1))?;
            Err(SimpleException::new(ExcType::StopIteration, None).into())
        })
        .unwrap();
    let generator = rt.call0(&func).unwrap();
    assert_eq!(yielded_int(rt.advance(&generator)), Some(1));
    assert_eq!(yielded_int(rt.advance(&generator)), None);
    assert_eq!(rt.generator_state(&generator).unwrap(), "GEN_CLOSED");
    rt.drop_value(generator);
    rt.drop_value(func);
}

// =============================================================================
// 4. Reentrancy
// =============================================================================

/// A body advancing itself gets "generator already executing" and keeps running.
#[test]
fn advancing_self_from_body_is_rejected() {
    let mut rt = runtime();
    let func = rt
        .generator_function(CodeInfo::new("selfish"), |scope| {
            let me = scope.generator();
            let rt = scope.runtime();
            let running = rt.generator_running(&me)?;
            let state = rt.generator_state(&me)?;
            let result = rt.next(&me);
            rt.drop_value(me);
            let message = match result {
                Err(e) => rt.into_exception(e).summary(),
                Ok(v) => {
                    rt.drop_value(v);
                    "no error".to_owned()
                }
            };
            let report = format!("{running} {state} {message}");
            let report = rt.new_str(report)?;
            scope.yield_value(report)?;
            Ok(Value::None)
        })
        .unwrap();
    let generator = rt.call0(&func).unwrap();

    let report = rt.advance(&generator).unwrap().into_value();
    assert_eq!(
        rt.to_object(&report),
        Object::String("true GEN_RUNNING ValueError: generator already executing".to_owned())
    );
    rt.drop_value(report);
    assert!(!rt.generator_running(&generator).unwrap());
    assert!(rt.advance(&generator).unwrap().is_exhausted());
    rt.drop_value(generator);
    rt.drop_value(func);
}

// =============================================================================
// 5. Protocol misuse
// =============================================================================

#[test]
fn coroutines_are_not_iterators() {
    let mut rt = runtime();
    let func = rt
        .coroutine_function(CodeInfo::new("coro"), |_scope| Ok(Value::Int(1)))
        .unwrap();
    let coroutine = rt.call0(&func).unwrap();
    let err = rt.next(&coroutine).unwrap_err();
    assert_eq!(
        rt.into_exception(err).summary(),
        "TypeError: 'coroutine' object is not an iterator"
    );
    // but they can still be driven with send
    match rt.send(&coroutine, Value::None).unwrap() {
        GenStep::Exhausted(v) => assert_eq!(v.as_int(), Some(1)),
        GenStep::Yielded(_) => panic!("coroutine should return immediately"),
    }
    assert_eq!(rt.generator_state(&coroutine).unwrap(), "CORO_CLOSED");
    rt.drop_value(coroutine);
    rt.drop_value(func);
}

#[test]
fn driving_a_non_generator_is_type_error() {
    let mut rt = runtime();
    let err = rt.advance(&Value::Int(3)).unwrap_err();
    assert_eq!(rt.into_exception(err).summary(), "TypeError: 'int' object is not a generator");
}

/// A generator function binds its arguments at call time, before the body runs.
#[test]
fn arguments_are_bound_before_first_advance() {
    let mut rt = runtime();
    let func = rt
        .generator_function(CodeInfo::new("needs_arg").params(&["a"]), |scope| {
            let a = scope.local(0)?;
            scope.yield_value(a)?;
            Ok(Value::None)
        })
        .unwrap();
    let err = rt.call0(&func).unwrap_err();
    assert_eq!(
        rt.into_exception(err).summary(),
        "TypeError: needs_arg() missing 1 required positional argument: 'a'"
    );
    let generator = rt.call1(&func, Value::Int(9)).unwrap();
    assert_eq!(yielded_int(rt.advance(&generator)), Some(9));
    rt.drop_value(generator);
    rt.drop_value(func);
}
