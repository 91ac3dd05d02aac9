use criterion::{Bencher, Criterion, black_box, criterion_group, criterion_main};
use strand::{CodeInfo, Runtime, RuntimeConfig, Value};

const BENCH_STACK: usize = 64 * 1024;

fn runtime() -> Runtime {
    Runtime::new(RuntimeConfig::default().stack_size(BENCH_STACK))
}

/// `def count(n): for i in range(n): yield i`
fn count(rt: &mut Runtime) -> Value {
    rt.generator_function(CodeInfo::new("count").params(&["n"]), |scope| {
        let n = scope.local(0)?.as_int().unwrap_or_default();
        for i in 0..n {
            scope.yield_value(Value::Int(i))?;
        }
        Ok(Value::None)
    })
    .unwrap()
}

/// Creates a generator over `n` items and drains it, `sum(count(n))`.
fn run_drain(bench: &mut Bencher, n: i64) {
    let mut rt = runtime();
    let func = count(&mut rt);
    let expected = n * (n - 1) / 2;

    bench.iter(|| {
        let generator = rt.call1(&func, Value::Int(n)).unwrap();
        let mut total = 0;
        while let Some(v) = rt.next(&generator).unwrap() {
            total += v.as_int().unwrap();
        }
        rt.drop_value(generator);
        assert_eq!(total, expected);
        black_box(total);
    });
    rt.drop_value(func);
}

/// Steady-state resume/suspend cost on a single long-lived generator.
fn run_resume(bench: &mut Bencher) {
    let mut rt = runtime();
    let func = rt
        .generator_function(CodeInfo::new("echo"), |scope| {
            let mut value = Value::None;
            loop {
                value = scope.yield_value(value)?;
            }
        })
        .unwrap();
    let generator = rt.call0(&func).unwrap();
    rt.advance(&generator).unwrap();

    bench.iter(|| {
        let step = rt.send(&generator, Value::Int(7)).unwrap();
        black_box(step.into_value().as_int());
    });
    rt.drop_value(generator);
    rt.drop_value(func);
}

/// `await` through a chain of coroutines; every resumption crosses all of them.
fn run_await_chain(bench: &mut Bencher, depth: usize) {
    let mut rt = runtime();
    let leaf = rt
        .coroutine_function(CodeInfo::new("leaf"), |scope| scope.yield_value(Value::Int(1)))
        .unwrap();
    let link = rt
        .coroutine_function(CodeInfo::new("link").params(&["inner"]), |scope| {
            let inner = scope.local(0)?;
            scope.await_value(inner)
        })
        .unwrap();

    bench.iter(|| {
        let mut top = rt.call0(&leaf).unwrap();
        for _ in 0..depth {
            top = rt.call1(&link, top).unwrap();
        }
        rt.advance(&top).unwrap();
        let result = rt.send(&top, Value::Int(3)).unwrap().into_value();
        black_box(result.as_int());
        rt.drop_value(top);
    });
    rt.drop_value(link);
    rt.drop_value(leaf);
}

fn criterion_benchmark(c: &mut Criterion) {
    c.bench_function("drain_empty", |b| run_drain(b, 0));
    c.bench_function("drain_100", |b| run_drain(b, 100));
    c.bench_function("resume_suspend", run_resume);
    c.bench_function("await_chain_8", |b| run_await_chain(b, 8));
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
