use std::sync::Arc;
use std::time::Instant;

use criterion::{criterion_group, criterion_main, BatchSize, Criterion, Throughput};

use kyrolink::storage::InMemoryEntityStore;
use kyrolink::{AttributeKind, FeatureSet, LinkConfig, Linker, ObservationId, ResolutionEngine};

/// Feature sets for `people` distinct people, several observations each.
fn workload(people: usize, per_person: usize) -> Vec<FeatureSet> {
    let mut out = Vec::with_capacity(people * per_person);
    for p in 0..people {
        for k in 0..per_person {
            let mut f = FeatureSet::for_observation(ObservationId::for_payload(&format!("{p}/{k}")));
            f.insert(AttributeKind::Email, format!("person{p}@example.com"));
            f.insert(AttributeKind::Person, format!("Person {}", p % 50));
            f.insert(AttributeKind::Location, format!("City {}", p % 7));
            if k % 2 == 0 {
                f.insert(AttributeKind::Phone, format!("+1 555 {p:06}"));
            }
            out.push(f);
        }
    }
    out
}

fn seeded_engine(features: &[FeatureSet]) -> ResolutionEngine {
    let engine = ResolutionEngine::with_defaults(Arc::new(InMemoryEntityStore::new()));
    for f in features {
        engine.resolve(f).unwrap();
    }
    engine
}

fn bench_resolve_attach(c: &mut Criterion) {
    let mut group = c.benchmark_group("resolve");
    group.throughput(Throughput::Elements(1));

    // 1000 entities in the index; each lookup attaches to one of them.
    let seed = workload(1000, 2);
    let engine = seeded_engine(&seed);
    let mut n = 0usize;
    group.bench_function("attach_1k_entities", |b| {
        b.iter(|| {
            n += 1;
            let p = n % 1000;
            let f = FeatureSet::for_observation(ObservationId::for_payload(&format!("lookup/{n}")))
                .with(AttributeKind::Email, format!("person{p}@example.com"));
            engine.resolve(&f).unwrap()
        });
    });

    group.bench_function("create_sparse", |b| {
        b.iter_custom(|iters| {
            // Fresh state per sample so the index does not grow across samples.
            let engine = seeded_engine(&seed[..200]);
            let start = Instant::now();
            for i in 0..iters {
                let f = FeatureSet::for_observation(ObservationId::for_payload(&format!("new/{i}")))
                    .with(AttributeKind::Email, format!("nobody{i}@example.com"));
                engine.resolve(&f).unwrap();
            }
            start.elapsed()
        });
    });
    group.finish();
}

fn bench_bridge_merge(c: &mut Criterion) {
    c.bench_function("resolve/bridge_two_entities", |b| {
        b.iter_batched(
            || {
                let engine = ResolutionEngine::with_defaults(Arc::new(InMemoryEntityStore::new()));
                engine
                    .resolve(&FeatureSet::new().with(AttributeKind::Email, "ada@x.io"))
                    .unwrap();
                engine
                    .resolve(
                        &FeatureSet::new()
                            .with(AttributeKind::Phone, "555 0100")
                            .with(AttributeKind::Organization, "Acme"),
                    )
                    .unwrap();
                engine
            },
            |engine| {
                engine
                    .resolve(
                        &FeatureSet::new()
                            .with(AttributeKind::Email, "ada@x.io")
                            .with(AttributeKind::Phone, "5550100")
                            .with(AttributeKind::Organization, "Acme"),
                    )
                    .unwrap()
            },
            BatchSize::SmallInput,
        );
    });
}

fn bench_link_pipeline(c: &mut Criterion) {
    let mut group = c.benchmark_group("link");
    group.throughput(Throughput::Elements(1));
    group.bench_function("ingest_and_resolve", |b| {
        b.iter_custom(|iters| {
            let linker = Linker::in_memory(&LinkConfig::default()).unwrap();
            let start = Instant::now();
            for i in 0..iters {
                linker
                    .link(
                        "bench",
                        &format!("record {i}"),
                        FeatureSet::new()
                            .with(AttributeKind::Email, format!("user{}@example.com", i % 500))
                            .with(AttributeKind::Person, "Sam"),
                    )
                    .unwrap();
            }
            start.elapsed()
        });
    });
    group.finish();
}

criterion_group!(resolve, bench_resolve_attach, bench_bridge_merge, bench_link_pipeline);
criterion_main!(resolve);
