use criterion::{black_box, criterion_group, criterion_main, Criterion};
use slotguard::isolation;
use slotguard::stat::{BucketArray, ResourceNodePrepareSlot, ResourceNodeRegistry, StatisticSlot};
use slotguard::{entry, MetricEvent, SlotChain};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

fn guarded_chain() -> Arc<SlotChain> {
    let registry = Arc::new(ResourceNodeRegistry::new());
    let rules = Arc::new(isolation::RuleManager::new());
    rules.load_rules(vec![isolation::Rule::new("bench", 1_000)]).unwrap();
    let chain = SlotChain::with_pool_capacity(64);
    chain.add_stat_prepare_slot(Arc::new(ResourceNodePrepareSlot::new(registry))).unwrap();
    chain.add_rule_check_slot(Arc::new(isolation::Slot::new(rules))).unwrap();
    chain.add_stat_slot(Arc::new(StatisticSlot::without_inbound())).unwrap();
    Arc::new(chain)
}

fn bench_entry_exit(c: &mut Criterion) {
    let chain = guarded_chain();
    c.bench_function("entry_exit_pass", |b| {
        b.iter(|| {
            let guard = entry(black_box("bench")).with_slot_chain(chain.clone()).build().unwrap();
            guard.exit();
        })
    });

    let empty = Arc::new(SlotChain::with_pool_capacity(64));
    c.bench_function("entry_exit_empty_chain", |b| {
        b.iter(|| {
            let guard = entry(black_box("bench")).with_slot_chain(empty.clone()).build().unwrap();
            guard.exit();
        })
    });
}

fn bench_bucket_add(c: &mut Criterion) {
    let array = BucketArray::new(20, 10_000).unwrap();
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_millis() as u64;
    c.bench_function("bucket_add_pass", |b| {
        b.iter(|| array.add_count(MetricEvent::Pass, black_box(1), now).unwrap())
    });
}

criterion_group!(benches, bench_entry_exit, bench_bucket_add);
criterion_main!(benches);
