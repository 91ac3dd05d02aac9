//! Frame introspection around suspension points, locals mappings and weak references.

use pretty_assertions::assert_eq;
use strand::{CodeInfo, FrameInfo, Runtime, RuntimeConfig, StackFrame, Value};

fn runtime() -> Runtime {
    Runtime::new(RuntimeConfig::default())
}

fn counting(rt: &mut Runtime, code: CodeInfo) -> Value {
    rt.generator_function(code, |scope| {
        scope.set_line(3);
        scope.set_local(0, Value::Int(1))?;
        scope.yield_value(Value::None)?;
        scope.set_line(4);
        scope.set_local(0, Value::Int(2))?;
        scope.yield_value(Value::None)?;
        Ok(Value::None)
    })
    .unwrap()
}

#[test]
fn suspended_frame_is_detached_but_inspectable() {
    let mut rt = runtime();
    let func = counting(&mut rt, CodeInfo::new("counting").filename("c.py").locals(&["n"]));
    let generator = rt.call0(&func).unwrap();
    assert!(rt.generator_frame(&generator).unwrap().is_none(), "no frame before first run");

    rt.advance(&generator).unwrap();
    let frame = rt.generator_frame(&generator).unwrap().expect("suspended generator has a frame");
    assert_eq!(
        rt.frame_info(&frame).unwrap(),
        FrameInfo {
            name: "counting".to_owned(),
            qualname: "counting".to_owned(),
            filename: "c.py".to_owned(),
            line: 3,
            on_stack: false,
        }
    );
    assert!(rt.frame_back(&frame).unwrap().is_none());
    assert_eq!(rt.depth(), 0);
    assert!(rt.current_frame().is_none());

    let locals = rt.frame_locals(&frame).unwrap();
    assert_eq!(rt.repr(&locals), "{'n': 1}");
    rt.drop_value(locals);

    rt.advance(&generator).unwrap();
    assert_eq!(rt.frame_info(&frame).unwrap().line, 4);
    let locals = rt.frame_locals(&frame).unwrap();
    assert_eq!(rt.repr(&locals), "{'n': 2}");
    rt.drop_value(locals);

    assert!(rt.advance(&generator).unwrap().is_exhausted());
    assert!(rt.generator_frame(&generator).unwrap().is_none(), "no frame after finishing");

    rt.drop_value(frame);
    rt.drop_value(generator);
    rt.drop_value(func);
}

/// Optimized frames snapshot; unoptimized frames hand out one live mapping.
#[test]
fn unoptimized_frames_keep_a_live_locals_mapping() {
    let mut rt = runtime();
    let func = counting(&mut rt, CodeInfo::new("live").locals(&["n"]).unoptimized());
    let generator = rt.call0(&func).unwrap();
    rt.advance(&generator).unwrap();
    let frame = rt.generator_frame(&generator).unwrap().unwrap();

    let first = rt.frame_locals(&frame).unwrap();
    let second = rt.frame_locals(&frame).unwrap();
    assert_eq!(first.ref_id(), second.ref_id());
    assert_eq!(rt.repr(&first), "{'n': 1}");

    rt.advance(&generator).unwrap();
    assert_eq!(rt.repr(&first), "{'n': 2}");

    for v in [second, first, frame, generator, func] {
        rt.drop_value(v);
    }
}

/// While a generator runs, its frame sits on top of its resumer's.
#[test]
fn running_generator_frame_links_to_resumer() {
    let mut rt = runtime();
    let inner_fn = rt
        .generator_function(CodeInfo::new("inner").filename("g.py"), |scope| {
            scope.set_line(7);
            let rt = scope.runtime();
            let trace: Vec<String> = rt
                .stack_trace()
                .iter()
                .map(|StackFrame { name, line, .. }| format!("{name}:{line}"))
                .collect();
            let back = match rt.current_frame() {
                Some(frame) => {
                    let back = rt.frame_back(&frame)?;
                    rt.drop_value(frame);
                    back
                }
                None => None,
            };
            let back_name = match back {
                Some(back) => {
                    let name = rt.frame_info(&back)?.name;
                    rt.drop_value(back);
                    name
                }
                None => "<none>".to_owned(),
            };
            let summary = rt.new_str(format!("{} / back={back_name}", trace.join(" > ")))?;
            scope.yield_value(summary)?;
            Ok(Value::None)
        })
        .unwrap();
    let driver_fn = rt
        .function(CodeInfo::new("driver").params(&["g"]).first_line(20), |rt| {
            rt.set_line(21);
            let generator = rt.local(0)?;
            let step = rt.advance(&generator);
            rt.drop_value(generator);
            Ok(step?.into_value())
        })
        .unwrap();

    let generator = rt.call0(&inner_fn).unwrap();
    let summary = rt.call1(&driver_fn, rt.clone_value(&generator)).unwrap();
    assert_eq!(rt.repr(&summary), "'driver:21 > inner:7 / back=driver'");
    assert_eq!(rt.depth(), 0);

    for v in [summary, generator, driver_fn, inner_fn] {
        rt.drop_value(v);
    }
}

#[test]
fn weakref_is_cleared_when_generator_dies() {
    let mut rt = runtime();
    let func = counting(&mut rt, CodeInfo::new("counting").locals(&["n"]));
    let generator = rt.call0(&func).unwrap();
    rt.advance(&generator).unwrap();

    let weak = rt.weakref(&generator).unwrap();
    let strong = rt.weakref_get(&weak).unwrap().expect("target alive");
    assert_eq!(strong.ref_id(), generator.ref_id());
    rt.drop_value(strong);

    rt.drop_value(generator);
    assert!(rt.weakref_get(&weak).unwrap().is_none());
    assert_eq!(rt.repr(&weak), "<weakref; dead>");

    let err = rt.weakref(&Value::Int(1)).unwrap_err();
    assert_eq!(
        rt.into_exception(err).summary(),
        "TypeError: cannot create weak reference to 'int' object"
    );
    rt.drop_value(weak);
    rt.drop_value(func);
}

#[test]
fn reading_unassigned_local_is_unbound_local_error() {
    let mut rt = runtime();
    let func = rt
        .generator_function(CodeInfo::new("early").locals(&["x"]), |scope| scope.local(0))
        .unwrap();
    let generator = rt.call0(&func).unwrap();
    let err = rt.advance(&generator).unwrap_err();
    assert_eq!(
        rt.into_exception(err).summary(),
        "UnboundLocalError: cannot access local variable 'x' where it is not associated with a value"
    );
    rt.drop_value(generator);
    rt.drop_value(func);
}

/// A store past the last slot fails without leaking the value or its mapping copy.
#[test]
fn out_of_range_store_into_unoptimized_frame_releases_the_value() {
    let mut rt = runtime();
    let func = rt
        .generator_function(CodeInfo::new("stray").locals(&["n"]).unoptimized(), |scope| {
            let value = scope.runtime().new_str("stray")?;
            scope.set_local(5, value)?;
            Ok(Value::None)
        })
        .unwrap();
    let before = rt.heap_stats();

    let generator = rt.call0(&func).unwrap();
    let err = rt.advance(&generator).unwrap_err();
    assert!(rt.into_exception(err).summary().contains("local slot out of range"));
    rt.drop_value(generator);

    let diff = before.diff(&rt.heap_stats());
    assert!(diff.is_empty(), "objects left behind: {diff:?}");
    rt.drop_value(func);
}
