use criterion::{black_box, criterion_group, criterion_main, Criterion};

use txcell::{atomically, TVar};

fn read_only(c: &mut Criterion) {
    let var = TVar::new(0u64);
    let stm = var.read();
    c.bench_function("read_only_txn", |b| b.iter(|| black_box(atomically(&stm))));
}

fn counter_update(c: &mut Criterion) {
    let var = TVar::new(0u64);
    let stm = var.update(|x| x + 1);
    c.bench_function("counter_update_txn", |b| b.iter(|| atomically(&stm)));
}

fn transfer(c: &mut Criterion) {
    let from = TVar::new(i64::MAX);
    let to = TVar::new(0i64);
    let stm = from.update(|x| x - 1).zip_right(to.update(|x| x + 1));
    c.bench_function("transfer_txn", |b| b.iter(|| atomically(&stm)));
}

criterion_group!(benches, read_only, counter_update, transfer);
criterion_main!(benches);
