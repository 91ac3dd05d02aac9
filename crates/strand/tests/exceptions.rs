//! Exception state around generators: isolation, `throw`, normalization and matching.

use std::{
    cell::{Cell, RefCell},
    rc::Rc,
};

use pretty_assertions::assert_eq;
use strand::{
    CodeInfo, DEFAULT_NORMALIZE_BUDGET, ExcTriple, ExcType, ExcValue, GenStep, HeapId, Object, RunError, Runtime,
    RuntimeConfig, SimpleException, Value, types::ClassInit,
};

fn runtime() -> Runtime {
    Runtime::new(RuntimeConfig::default())
}

fn summary_of(rt: &mut Runtime, step: Result<GenStep, RunError>) -> String {
    match step {
        Ok(step) => {
            let value = step.into_value();
            let repr = rt.repr(&value);
            rt.drop_value(value);
            format!("ok {repr}")
        }
        Err(e) => rt.into_exception(e).summary(),
    }
}

fn advance_summary(rt: &mut Runtime, generator: &Value) -> String {
    let step = rt.advance(generator);
    summary_of(rt, step)
}

/// True when the runtime's current exception is exactly the instance `id`.
fn current_is(rt: &Runtime, id: HeapId) -> bool {
    rt.current_exception()
        .is_some_and(|t| matches!(&t.value, ExcValue::Object(Value::Ref(v)) if *v == id))
}

// =============================================================================
// 1. Isolation between caller and generator
// =============================================================================

/// A generator that raises and handles its own exception, suspending in the
/// middle of handling it, never disturbs the caller's handled exception.
#[test]
fn caller_exception_survives_generator_handling_its_own() {
    let mut rt = runtime();
    let msg = rt.new_str("outer").unwrap();
    let outer = rt.call1(&Value::ExcClass(ExcType::KeyError), msg).unwrap();
    let outer_id = outer.ref_id().unwrap();
    rt.restore_exception(Some(ExcTriple::new(
        Value::ExcClass(ExcType::KeyError),
        ExcValue::Object(outer),
    )));

    let func = rt
        .generator_function(CodeInfo::new("handler"), |scope| {
            let rt = scope.runtime();
            let saw_outer = rt.current_exception().is_some();
            let raised: RunError = SimpleException::new_msg(ExcType::ValueError, "inner").into();
            let caught = raised.into_catchable()?;
            // entering the except block
            rt.restore_exception(Some(caught));
            scope.yield_value(Value::Bool(saw_outer))?;

            let rt = scope.runtime();
            let handling = rt.current_exception().map(|t| rt.exception_name(&t.exc_type));
            // leaving it
            rt.restore_exception(None);
            let handling = rt.new_str(handling.unwrap_or_default())?;
            scope.yield_value(handling)?;
            Ok(Value::None)
        })
        .unwrap();
    let generator = rt.call0(&func).unwrap();

    assert_eq!(advance_summary(&mut rt, &generator), "ok False");
    assert!(current_is(&rt, outer_id), "caller state changed after first suspension");
    assert_eq!(advance_summary(&mut rt, &generator), "ok 'ValueError'");
    assert!(current_is(&rt, outer_id), "caller state changed after second suspension");
    assert!(rt.advance(&generator).unwrap().is_exhausted());
    assert!(current_is(&rt, outer_id), "caller state changed after exhaustion");

    let state = rt.fetch_exception();
    rt.drop_value(state);
    rt.drop_value(generator);
    rt.drop_value(func);
}

/// A generator that raises out of its body leaves the caller's state unset if it was unset.
#[test]
fn raising_body_does_not_leak_handled_state() {
    let mut rt = runtime();
    let func = rt
        .generator_function(CodeInfo::new("leaky"), |scope| {
            let rt = scope.runtime();
            let handled = SimpleException::new_msg(ExcType::KeyError, "k").into();
            rt.restore_exception(Some(handled));
            Err(SimpleException::new_msg(ExcType::ValueError, "v").into())
        })
        .unwrap();
    let generator = rt.call0(&func).unwrap();
    let err = rt.advance(&generator).unwrap_err();
    rt.drop_value(err);
    assert!(rt.current_exception().is_none());
    rt.drop_value(generator);
    rt.drop_value(func);
}

// =============================================================================
// 2. throw()
// =============================================================================

fn catcher(rt: &mut Runtime) -> Value {
    rt.generator_function(CodeInfo::new("catcher").filename("catcher.py"), |scope| {
        scope.set_line(10);
        scope.yield_value(Value::Int(1))?;
        scope.set_line(11);
        match scope.yield_value(Value::Int(2)) {
            Ok(v) => {
                scope.runtime().drop_value(v);
                Ok(Value::None)
            }
            Err(e) => {
                let rt = scope.runtime();
                if !rt.error_matches(&e, &Value::ExcClass(ExcType::KeyError))? {
                    return Err(e);
                }
                let summary = rt.into_exception(e).summary();
                let summary = rt.new_str(summary)?;
                scope.set_line(12);
                scope.yield_value(summary)?;
                Ok(Value::None)
            }
        }
    })
    .unwrap()
}

/// The thrown exception surfaces at the last yield, not at the start of the body.
#[test]
fn throw_raises_at_the_suspension_point() {
    let mut rt = runtime();
    let func = catcher(&mut rt);
    let generator = rt.call0(&func).unwrap();
    assert_eq!(advance_summary(&mut rt, &generator), "ok 1");
    assert_eq!(advance_summary(&mut rt, &generator), "ok 2");

    let msg = rt.new_str("missing").unwrap();
    let step = rt.throw(&generator, Value::ExcClass(ExcType::KeyError), Some(msg));
    assert_eq!(summary_of(&mut rt, step), "ok 'KeyError: missing'");
    assert!(rt.advance(&generator).unwrap().is_exhausted());
    rt.drop_value(generator);
    rt.drop_value(func);
}

/// An exception the body does not handle propagates with the body's line and finishes it.
#[test]
fn unhandled_throw_propagates_from_suspension_line() {
    let mut rt = runtime();
    let func = catcher(&mut rt);
    let generator = rt.call0(&func).unwrap();
    rt.advance(&generator).unwrap();
    rt.advance(&generator).unwrap();

    let err = rt
        .throw(&generator, Value::ExcClass(ExcType::ValueError), None)
        .unwrap_err();
    let exc = rt.into_exception(err);
    assert_eq!(exc.exc_type(), ExcType::ValueError);
    assert_eq!(exc.traceback().len(), 1);
    assert_eq!(exc.traceback()[0].filename, "catcher.py");
    assert_eq!(exc.traceback()[0].line, 11);
    assert_eq!(rt.generator_state(&generator).unwrap(), "GEN_CLOSED");
    rt.drop_value(generator);
    rt.drop_value(func);
}

/// Throwing into an unstarted generator finishes it without running the body.
#[test]
fn throw_into_unstarted_generator_propagates_directly() {
    let mut rt = runtime();
    let ran = Rc::new(Cell::new(false));
    let flag = Rc::clone(&ran);
    let func = rt
        .generator_function(CodeInfo::new("never"), move |scope| {
            flag.set(true);
            scope.yield_value(Value::None)?;
            Ok(Value::None)
        })
        .unwrap();
    let generator = rt.call0(&func).unwrap();
    let err = rt
        .throw(&generator, Value::ExcClass(ExcType::KeyError), None)
        .unwrap_err();
    assert!(err.is_exception_type(ExcType::KeyError, rt.heap()));
    rt.drop_value(err);
    assert!(!ran.get());
    assert_eq!(rt.generator_state(&generator).unwrap(), "GEN_CLOSED");

    // a finished generator propagates thrown exceptions as well
    let err = rt
        .throw(&generator, Value::ExcClass(ExcType::ValueError), None)
        .unwrap_err();
    assert!(err.is_exception_type(ExcType::ValueError, rt.heap()));
    rt.drop_value(err);
    rt.drop_value(generator);
    rt.drop_value(func);
}

#[test]
fn throw_rejects_non_exceptions() {
    let mut rt = runtime();
    let func = catcher(&mut rt);
    let generator = rt.call0(&func).unwrap();
    let step = rt.throw(&generator, Value::Int(3), None);
    assert_eq!(
        summary_of(&mut rt, step),
        "TypeError: exceptions must be classes or instances deriving from BaseException, not int"
    );

    let instance = rt.call0(&Value::ExcClass(ExcType::KeyError)).unwrap();
    let step = rt.throw(&generator, instance, Some(Value::Int(1)));
    assert_eq!(
        summary_of(&mut rt, step),
        "TypeError: instance exception may not have a separate value"
    );
    // neither usage error touched the generator
    assert_eq!(rt.generator_state(&generator).unwrap(), "GEN_CREATED");
    rt.drop_value(generator);
    rt.drop_value(func);
}

/// An instance is thrown as-is and keeps its own class.
#[test]
fn throw_accepts_an_instance() {
    let mut rt = runtime();
    let func = catcher(&mut rt);
    let generator = rt.call0(&func).unwrap();
    rt.advance(&generator).unwrap();
    rt.advance(&generator).unwrap();
    let msg = rt.new_str("by instance").unwrap();
    let instance = rt.call1(&Value::ExcClass(ExcType::KeyError), msg).unwrap();
    let step = rt.throw(&generator, instance, None);
    assert_eq!(summary_of(&mut rt, step), "ok 'KeyError: by instance'");
    rt.drop_value(generator);
    rt.drop_value(func);
}

// =============================================================================
// 3. Normalization
// =============================================================================

/// A class whose constructor raises is replaced by the constructor's exception.
#[test]
fn failing_constructor_replaces_the_exception() {
    let mut rt = runtime();
    let init: ClassInit = Rc::new(|_rt: &mut Runtime, _args: &[Value]| {
        Err(SimpleException::new_msg(ExcType::ValueError, "init failed").into())
    });
    let bad = rt
        .new_exception_class("Bad", Value::ExcClass(ExcType::Exception), Some(init))
        .unwrap();

    let triple = ExcTriple::new(rt.clone_value(&bad), ExcValue::Absent);
    let normalized = rt.normalize_exception(triple).unwrap();
    assert!(normalized.is_normalized(rt.heap()));
    assert_eq!(rt.exception_name(&normalized.exc_type), "ValueError");
    assert_eq!(rt.into_exception(normalized.into()).summary(), "ValueError: init failed");
    rt.drop_value(bad);
}

/// A class whose constructor always raises itself exhausts the budget.
#[test]
fn endless_replacement_hits_the_budget() {
    for budget in [DEFAULT_NORMALIZE_BUDGET, 5] {
        let mut rt = Runtime::new(RuntimeConfig::default().normalize_budget(budget));
        let calls = Rc::new(Cell::new(0));
        let class_id: Rc<Cell<Option<HeapId>>> = Rc::new(Cell::new(None));
        let (counter, me) = (Rc::clone(&calls), Rc::clone(&class_id));
        let init: ClassInit = Rc::new(move |rt: &mut Runtime, _args: &[Value]| {
            counter.set(counter.get() + 1);
            let id = me.get().expect("class registered");
            rt.heap().inc_ref(id);
            Err(ExcTriple::new(Value::Ref(id), ExcValue::Absent).into())
        });
        let ouroboros = rt
            .new_exception_class("Ouroboros", Value::ExcClass(ExcType::Exception), Some(init))
            .unwrap();
        class_id.set(ouroboros.ref_id());

        let triple = ExcTriple::new(rt.clone_value(&ouroboros), ExcValue::Absent);
        let err = rt.normalize_exception(triple).unwrap_err();
        assert!(matches!(err, RunError::UncatchableExc(_)));
        assert_eq!(
            rt.into_exception(err).summary(),
            "RecursionError: maximum recursion depth exceeded while normalizing an exception"
        );
        assert_eq!(calls.get(), budget);
        rt.drop_value(ouroboros);
    }
}

/// A message value is passed to the constructor as its single argument.
#[test]
fn message_becomes_constructor_argument() {
    let mut rt = runtime();
    let triple: ExcTriple = SimpleException::new_msg(ExcType::KeyError, "gone").into();
    assert!(!triple.is_normalized(rt.heap()));
    let normalized = rt.normalize_exception(triple).unwrap();
    let ExcValue::Object(instance) = &normalized.value else {
        panic!("expected an instance");
    };
    assert_eq!(
        rt.to_object(instance),
        Object::Exception {
            exc_type: ExcType::KeyError,
            type_name: "KeyError".to_owned(),
            message: Some("gone".to_owned()),
        }
    );
    rt.drop_value(normalized);
}

/// A tuple value is unpacked into the constructor's arguments, both when
/// normalizing directly and when thrown into a generator.
#[test]
fn tuple_value_becomes_constructor_arguments() {
    let mut rt = runtime();
    let seen: Rc<RefCell<Vec<Vec<String>>>> = Rc::default();
    let record = Rc::clone(&seen);
    let init: ClassInit = Rc::new(move |rt: &mut Runtime, args: &[Value]| {
        record.borrow_mut().push(args.iter().map(|a| rt.repr(a)).collect());
        Ok(())
    });
    let pair = rt
        .new_exception_class("PairError", Value::ExcClass(ExcType::ValueError), Some(init))
        .unwrap();

    let a = rt.new_str("a").unwrap();
    let args = rt.new_tuple(vec![a, Value::Int(2)]).unwrap();
    let triple = ExcTriple::new(rt.clone_value(&pair), ExcValue::Object(args));
    let normalized = rt.normalize_exception(triple).unwrap();
    let ExcValue::Object(instance) = &normalized.value else {
        panic!("expected an instance");
    };
    assert_eq!(
        rt.to_object(instance),
        Object::Exception {
            exc_type: ExcType::ValueError,
            type_name: "PairError".to_owned(),
            message: Some("('a', 2)".to_owned()),
        }
    );
    rt.drop_value(normalized);

    let func = catcher(&mut rt);
    let generator = rt.call0(&func).unwrap();
    let b = rt.new_str("b").unwrap();
    let args = rt.new_tuple(vec![b, Value::Int(3)]).unwrap();
    let err = rt.throw(&generator, rt.clone_value(&pair), Some(args)).unwrap_err();
    assert_eq!(rt.into_exception(err).summary(), "PairError: ('b', 3)");

    assert_eq!(
        *seen.borrow(),
        vec![
            vec!["'a'".to_owned(), "2".to_owned()],
            vec!["'b'".to_owned(), "3".to_owned()],
        ]
    );
    for v in [generator, func, pair] {
        rt.drop_value(v);
    }
}

// =============================================================================
// 4. Matching
// =============================================================================

#[test]
fn user_classes_match_their_bases() {
    let mut rt = runtime();
    let sub = rt
        .new_exception_class("AppError", Value::ExcClass(ExcType::ValueError), None)
        .unwrap();
    let instance = rt.call0(&sub).unwrap();
    assert_eq!(rt.exception_name(&instance), "AppError");

    let value_error = Value::ExcClass(ExcType::ValueError);
    let key_error = Value::ExcClass(ExcType::KeyError);
    assert!(rt.exception_matches(&instance, &value_error).unwrap());
    assert!(rt.exception_matches(&instance, &sub).unwrap());
    assert!(!rt.exception_matches(&instance, &key_error).unwrap());
    assert!(!rt.exception_matches(&value_error, &sub).unwrap());

    let either = rt.new_tuple(vec![Value::ExcClass(ExcType::KeyError), rt.clone_value(&sub)]).unwrap();
    assert!(rt.exception_matches(&instance, &either).unwrap());

    let err = rt.exception_matches(&instance, &Value::Int(1)).unwrap_err();
    assert_eq!(
        rt.into_exception(err).summary(),
        "TypeError: catching classes that do not inherit from BaseException is not allowed"
    );

    // GeneratorExit is a BaseException, not an Exception
    let exit = Value::ExcClass(ExcType::GeneratorExit);
    assert!(!rt.exception_matches(&exit, &Value::ExcClass(ExcType::Exception)).unwrap());

    rt.drop_value(either);
    rt.drop_value(instance);
    rt.drop_value(sub);
}
