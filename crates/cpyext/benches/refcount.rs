use criterion::{BatchSize, BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use pybridge_cpyext::{Bridge, Settings, intobject, tupleobject};
use pybridge_vm::Heap;
use std::{hint::black_box, sync::Arc};

fn bench_incref_decref(c: &mut Criterion) {
    let bridge = Bridge::new(Arc::new(Heap::new()), Settings::default()).unwrap();
    bridge.enter(|| {
        let obj = bridge.as_pyobj(bridge.heap.new_int(1)).unwrap();
        c.bench_function("incref_decref", |b| {
            b.iter(|| unsafe {
                bridge.incref(black_box(obj)).unwrap();
                bridge.decref(black_box(obj)).unwrap();
            })
        });
    });
}

fn bench_attach(c: &mut Criterion) {
    let mut group = c.benchmark_group("attach");
    let bridge = Bridge::new(Arc::new(Heap::new()), Settings::default()).unwrap();
    bridge.enter(|| {
        for len in [0usize, 8, 64] {
            group.throughput(Throughput::Elements(len as u64 + 1));
            group.bench_with_input(BenchmarkId::new("tuple", len), &len, |b, &len| {
                b.iter_batched(
                    || {
                        let items = (0..len as i64).map(|i| bridge.heap.new_int(i)).collect();
                        bridge.heap.new_tuple(items)
                    },
                    |w_tuple| bridge.as_pyobj(w_tuple).unwrap(),
                    BatchSize::SmallInput,
                )
            });
        }
        // Let the mirrors go between runs.
        bridge.heap.collect();
        bridge.drain_dead();
    });
    group.finish();
}

fn bench_realize(c: &mut Criterion) {
    let bridge = Bridge::new(Arc::new(Heap::new()), Settings::default()).unwrap();
    bridge.enter(|| {
        c.bench_function("realize_native_tuple", |b| {
            b.iter(|| unsafe {
                let tuple = tupleobject::tuple_new_wrapper(2);
                for i in 0..2 {
                    let item = intobject::long_from_long_wrapper(i as _);
                    tupleobject::tuple_set_item_wrapper(tuple, i, item);
                }
                black_box(bridge.from_ref(tuple).unwrap())
            })
        });
    });
}

criterion_group!(benches, bench_incref_decref, bench_attach, bench_realize);
criterion_main!(benches);
