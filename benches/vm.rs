//! VM microbenchmarks: compilation, arithmetic loops, call-heavy code.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use oryx::vm::Vm;
use std::rc::Rc;

const FIB: &str = "
let fib = fn(n) if n < 2 n else fib(n - 1) + fib(n - 2)
fib(18)
";

const LOOP_SUM: &str = "
let total = 0
for i in 0:100000 total += i
total
";

const MAP_CHURN: &str = "
let m = {}
for i in 0:1000 m[i] = i * 2
let total = 0
for k in m total += m[k]
total
";

fn bench_compile(c: &mut Criterion) {
    c.bench_function("compile fib", |b| {
        b.iter(|| oryx::compile_source("<bench>", black_box(FIB)).expect("compile failed"))
    });
}

fn bench_run(c: &mut Criterion) {
    let fib = Rc::new(oryx::compile_source("<bench>", FIB).expect("compile failed"));
    c.bench_function("run fib(18)", |b| {
        b.iter(|| {
            let mut vm = Vm::new();
            vm.run_module(fib.clone()).expect("run failed")
        })
    });

    let loop_sum = Rc::new(oryx::compile_source("<bench>", LOOP_SUM).expect("compile failed"));
    c.bench_function("run loop sum", |b| {
        b.iter(|| {
            let mut vm = Vm::new();
            vm.run_module(loop_sum.clone()).expect("run failed")
        })
    });

    let map_churn = Rc::new(oryx::compile_source("<bench>", MAP_CHURN).expect("compile failed"));
    c.bench_function("run map churn", |b| {
        b.iter(|| {
            let mut vm = Vm::new();
            vm.run_module(map_churn.clone()).expect("run failed")
        })
    });
}

criterion_group!(benches, bench_compile, bench_run);
criterion_main!(benches);
