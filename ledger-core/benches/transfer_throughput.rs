//! Prepare/fulfil throughput against a temporary RocksDB store

use chrono::{Duration, Utc};
use criterion::{criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use ledger_core::metrics::Metrics;
use ledger_core::position::PositionAccountant;
use ledger_core::transfer::TransferStateMachine;
use ledger_core::window::WindowManager;
use ledger_core::*;
use rust_decimal::Decimal;
use std::sync::Arc;

fn usd() -> Currency {
    Currency::from_code("USD").unwrap()
}

fn setup() -> (TransferStateMachine, tempfile::TempDir) {
    let temp_dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.data_dir = temp_dir.path().to_path_buf();

    // Caps high enough that the bench never trips a limit
    let cap = Decimal::from(1_000_000_000i64);
    let reference = Arc::new(
        StaticReferenceData::new()
            .with_participant("dfsp1", &usd(), cap)
            .with_participant("dfsp2", &usd(), cap),
    );
    let storage = Arc::new(Storage::open(&config).unwrap());
    let metrics = Arc::new(Metrics::new().unwrap());
    let windows = WindowManager::new(
        storage.clone(),
        PositionAccountant::new(reference.clone()),
        metrics.clone(),
    );
    windows.ensure_open(&usd(), Utc::now()).unwrap();

    let machine = TransferStateMachine::new(storage, reference, windows, config.amount, metrics);
    (machine, temp_dir)
}

fn request(fulfilment: &Fulfilment) -> TransferRequest {
    TransferRequest {
        transfer_id: TransferId::new(),
        payer: ParticipantId::new("dfsp1"),
        payee: ParticipantId::new("dfsp2"),
        amount: Decimal::new(1050, 2),
        currency: usd(),
        condition: fulfilment.condition().unwrap(),
        expiration: Utc::now() + Duration::hours(1),
    }
}

fn bench_transfers(c: &mut Criterion) {
    let (machine, _temp) = setup();

    let mut group = c.benchmark_group("transfer");
    group.throughput(Throughput::Elements(1));

    group.bench_function("prepare", |b| {
        b.iter_batched(
            || request(&Fulfilment::random()),
            |req| machine.prepare(&req, Utc::now()).unwrap(),
            BatchSize::SmallInput,
        )
    });

    group.bench_function("prepare_fulfil", |b| {
        b.iter_batched(
            || {
                let fulfilment = Fulfilment::random();
                (request(&fulfilment), fulfilment)
            },
            |(req, fulfilment)| {
                let id = machine.prepare(&req, Utc::now()).unwrap();
                machine.fulfil(&id, &fulfilment, Utc::now()).unwrap()
            },
            BatchSize::SmallInput,
        )
    });

    group.finish();
}

criterion_group!(benches, bench_transfers);
criterion_main!(benches);
