use std::sync::Arc;

use chrono::{Duration, Utc};
use common::AggregateId;
use criterion::{Criterion, criterion_group, criterion_main};
use domain::{Aggregate, ReleaseReason, ReservationLine, VariantId};
use event_store::InMemoryEventStore;
use fulfillment::InventoryLedger;

fn stocked_ledger(rt: &tokio::runtime::Runtime, variants: usize) -> Arc<InventoryLedger<InMemoryEventStore>> {
    let ledger = Arc::new(InventoryLedger::new(InMemoryEventStore::new()));
    rt.block_on(async {
        for i in 0..variants {
            ledger
                .receive_stock(&VariantId::new(format!("SKU-{i:03}")), 1_000_000, Utc::now())
                .await
                .unwrap();
        }
    });
    ledger
}

fn bench_reserve_release(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let ledger = stocked_ledger(&rt, 1);
    let lines = [ReservationLine::new("SKU-000", 2)];

    c.bench_function("ledger/reserve_release_single_line", |b| {
        b.iter(|| {
            rt.block_on(async {
                let now = Utc::now();
                let reservation = ledger
                    .reserve(AggregateId::new(), &lines, now + Duration::minutes(15), now)
                    .await
                    .unwrap();
                ledger
                    .release(reservation.id().unwrap(), ReleaseReason::Canceled, now)
                    .await
                    .unwrap();
            });
        });
    });
}

fn bench_reserve_commit_multi_line(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let ledger = stocked_ledger(&rt, 5);
    let lines: Vec<_> = (0..5)
        .map(|i| ReservationLine::new(format!("SKU-{i:03}"), 1))
        .collect();

    c.bench_function("ledger/reserve_commit_5_lines", |b| {
        b.iter(|| {
            rt.block_on(async {
                let now = Utc::now();
                let reservation = ledger
                    .reserve(AggregateId::new(), &lines, now + Duration::minutes(15), now)
                    .await
                    .unwrap();
                ledger.commit(reservation.id().unwrap(), now).await.unwrap();
            });
        });
    });
}

fn bench_contended_reservations(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
        .unwrap();
    let ledger = stocked_ledger(&rt, 1);

    c.bench_function("ledger/contended_reserve_release_x16", |b| {
        b.iter(|| {
            rt.block_on(async {
                let handles: Vec<_> = (0..16)
                    .map(|_| {
                        let ledger = ledger.clone();
                        tokio::spawn(async move {
                            let now = Utc::now();
                            let reservation = ledger
                                .reserve(
                                    AggregateId::new(),
                                    &[ReservationLine::new("SKU-000", 1)],
                                    now + Duration::minutes(15),
                                    now,
                                )
                                .await
                                .unwrap();
                            ledger
                                .release(reservation.id().unwrap(), ReleaseReason::Canceled, now)
                                .await
                                .unwrap();
                        })
                    })
                    .collect();
                for handle in handles {
                    handle.await.unwrap();
                }
            });
        });
    });
}

criterion_group!(
    benches,
    bench_reserve_release,
    bench_reserve_commit_multi_line,
    bench_contended_reservations
);
criterion_main!(benches);
