use std::hint::black_box;

use criterion::{criterion_group, criterion_main, Criterion};
use kiwi_collab::protocol::{HandshakeMetadata, SyncMessage};
use kiwi_collab::session::{Port, Session};
use kiwi_collab::storage::{read_backend, session_file_name, write_backend, ConverterChain, StoreConfig};
use kiwi_core::{BackendIr, Op, Patcher, Point, Transaction, MODEL_VERSION};
use tokio::sync::mpsc;
use uuid::Uuid;

/// A patcher of `count` objects chained by links.
fn chain_patcher(count: usize) -> Patcher {
    let mut patcher = Patcher::default();
    let mut previous = None;
    for i in 0..count {
        let id = patcher
            .add_object_at("+ 1", Point::new(10.0, i as f64 * 30.0))
            .unwrap();
        if let Some(previous) = previous {
            patcher.add_link(previous, 0, id, 0).unwrap();
        }
        previous = Some(id);
    }
    patcher
}

fn add_object_transaction() -> (Uuid, Transaction) {
    let mut scratch = Patcher::default();
    let id = scratch.add_object_at("osc~ 440", Point::new(0.0, 0.0)).unwrap();
    (id, Transaction::new("add osc", scratch.take_pending()))
}

fn bench_transaction_encode(c: &mut Criterion) {
    let (_, tx) = add_object_transaction();

    c.bench_function("transaction_encode", |b| {
        b.iter(|| {
            let msg = SyncMessage::transaction(black_box(1), black_box(2), black_box(3), black_box(&tx)).unwrap();
            black_box(msg.encode().unwrap());
        })
    });
}

fn bench_transaction_decode(c: &mut Criterion) {
    let (_, tx) = add_object_transaction();
    let encoded = SyncMessage::transaction(1, 2, 3, &tx).unwrap().encode().unwrap();

    c.bench_function("transaction_decode", |b| {
        b.iter(|| {
            let msg = SyncMessage::decode(black_box(&encoded)).unwrap();
            black_box(msg.transaction_payload().unwrap());
        })
    });
}

fn bench_snapshot_encode_100(c: &mut Criterion) {
    let ir = chain_patcher(100).to_ir();

    c.bench_function("snapshot_encode_100_objects", |b| {
        b.iter(|| {
            black_box(SyncMessage::snapshot(1, 0, black_box(&ir)).unwrap().encode().unwrap());
        })
    });
}

fn bench_session_apply(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let metadata = HandshakeMetadata::new(MODEL_VERSION, "bench", "0");
    let mut session = Session::new(1, &StoreConfig::for_testing(dir.path()), metadata);
    session.init_empty_document();

    let (sender, mut receiver) = mpsc::unbounded_channel();
    session.bind(Port::new(1, 1, sender)).unwrap();

    let (id, add) = add_object_transaction();
    session.apply_transaction(1, &add).unwrap();

    c.bench_function("session_apply_move", |b| {
        let mut x = 0.0;
        b.iter(|| {
            let from = Point::new(x, 0.0);
            x += 1.0;
            let op = Op::SetPosition { id, from, to: Point::new(x, 0.0) };
            let tx = Transaction::new("move", vec![op]);
            black_box(session.apply_transaction(1, &tx).unwrap());
            while receiver.try_recv().is_ok() {}
        })
    });
}

fn bench_backend_write(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(session_file_name(1));
    let ir = chain_patcher(100).to_ir();

    c.bench_function("backend_write_100_objects", |b| {
        b.iter(|| write_backend(black_box(&path), black_box(&ir)).unwrap())
    });
}

fn bench_backend_read(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(session_file_name(1));
    write_backend(&path, &chain_patcher(100).to_ir()).unwrap();

    c.bench_function("backend_read_100_objects", |b| {
        b.iter(|| black_box(read_backend(black_box(&path)).unwrap()))
    });
}

fn bench_migrate_v1(c: &mut Criterion) {
    let mut legacy: BackendIr = chain_patcher(100).to_ir();
    legacy.version = "v1".to_string();
    let chain = ConverterChain::default();

    c.bench_function("migrate_v1_100_objects", |b| {
        b.iter(|| {
            let mut ir = legacy.clone();
            chain.process(black_box(&mut ir)).unwrap();
            black_box(ir);
        })
    });
}

criterion_group!(
    benches,
    bench_transaction_encode,
    bench_transaction_decode,
    bench_snapshot_encode_100,
    bench_session_apply,
    bench_backend_write,
    bench_backend_read,
    bench_migrate_v1,
);
criterion_main!(benches);
