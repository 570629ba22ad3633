//! Benchmarks for change propagation

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rill_core::observable::{ObservableArray, ObservableMap, Value};
use rill_core::reactive::{Computed, HostContext, ObservableValue, Runtime};

/// A chain of `depth` computeds, each adding one to the previous.
fn chain(root: &ObservableValue<i64>, depth: usize) -> Computed<i64> {
    let mut tail = {
        let root = root.clone();
        Computed::new(move || Ok(root.get() + 1))
    };
    for _ in 1..depth {
        let prev = tail.clone();
        tail = Computed::new(move || Ok(prev.get()? + 1));
    }
    tail
}

fn bench_atom(c: &mut Criterion) {
    let value = ObservableValue::new(0i64);
    let ctx = HostContext::new();
    let mut next = 0i64;

    c.bench_function("atom_set_with_reader", |b| {
        b.iter(|| {
            ctx.track(|| black_box(value.get()));
            next += 1;
            value.set(black_box(next)).unwrap();
        })
    });

    c.bench_function("atom_get_untracked", |b| {
        b.iter(|| black_box(value.get_untracked()))
    });
}

fn bench_chain(c: &mut Criterion) {
    let mut group = c.benchmark_group("computed_chain");
    for depth in [10usize, 100, 250] {
        let root = ObservableValue::new(0i64);
        let tail = chain(&root, depth);
        let ctx = HostContext::new();
        let mut next = 0i64;

        group.bench_with_input(BenchmarkId::from_parameter(depth), &depth, |b, _| {
            b.iter(|| {
                next += 1;
                root.set(next).unwrap();
                let value = ctx.track(|| tail.get()).unwrap();
                black_box(value);
                Runtime::before_frame().unwrap();
            })
        });
    }
    group.finish();
}

fn bench_fan_out(c: &mut Criterion) {
    let mut group = c.benchmark_group("computed_fan_out");
    for width in [10usize, 100, 1000] {
        let root = ObservableValue::new(0i64);
        let leaves: Vec<Computed<i64>> = (0..width as i64)
            .map(|i| {
                let root = root.clone();
                Computed::new(move || Ok(root.get() * i))
            })
            .collect();
        let ctx = HostContext::new();
        let mut next = 0i64;

        group.bench_with_input(BenchmarkId::from_parameter(width), &width, |b, _| {
            b.iter(|| {
                next += 1;
                root.set(next).unwrap();
                let sum: i64 = ctx.track(|| leaves.iter().map(|leaf| leaf.get().unwrap_or(0)).sum());
                black_box(sum);
                Runtime::before_frame().unwrap();
            })
        });
    }
    group.finish();
}

fn bench_containers(c: &mut Criterion) {
    c.bench_function("array_push_pop", |b| {
        let list = ObservableArray::from(vec![0i64; 64]);
        b.iter(|| {
            list.push(black_box(1)).unwrap();
            black_box(list.pop().unwrap());
        })
    });

    c.bench_function("map_set_get", |b| {
        let map = ObservableMap::new();
        let mut next = 0u64;
        b.iter(|| {
            next += 1;
            map.set(next % 128, black_box(next)).unwrap();
            black_box(map.get(&(next % 128)));
        })
    });

    c.bench_function("deep_wrap_json", |b| {
        let json = serde_json::json!({
            "todos": [
                {"title": "a", "done": false, "tags": ["x", "y"]},
                {"title": "b", "done": true, "tags": []},
            ],
            "filter": "all",
        });
        b.iter(|| black_box(Value::from(json.clone()).wrap()))
    });
}

criterion_group!(benches, bench_atom, bench_chain, bench_fan_out, bench_containers);
criterion_main!(benches);
